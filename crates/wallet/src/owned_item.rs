use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use coffer_core::{AccountId, Entity, OwnedItemId};

use crate::catalog::CatalogItemId;
use crate::error::WalletError;

/// Lifecycle of an ownership record: `Active` on purchase, `Refunded` (terminal) on refund.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OwnershipStatus {
    Active,
    Refunded,
}

/// One purchase of one catalog item by one account.
///
/// Name, rarity and price are snapshots taken at purchase time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedItem {
    pub id: OwnedItemId,
    pub account_id: AccountId,
    pub catalog_item_id: CatalogItemId,
    pub name: String,
    pub rarity: Option<String>,
    /// Price paid, in the smallest currency unit.
    pub price: i64,
    pub status: OwnershipStatus,
    pub purchased_at: DateTime<Utc>,
    pub refunded_at: Option<DateTime<Utc>>,
}

impl OwnedItem {
    pub fn is_active(&self) -> bool {
        self.status == OwnershipStatus::Active
    }

    /// Transition `Active -> Refunded`. There is no way back.
    pub fn mark_refunded(&mut self, at: DateTime<Utc>) -> Result<(), WalletError> {
        if !self.is_active() {
            return Err(WalletError::OwnedItemNotFound(format!(
                "{} is already refunded",
                self.id
            )));
        }
        self.status = OwnershipStatus::Refunded;
        self.refunded_at = Some(at);
        Ok(())
    }
}

impl Entity for OwnedItem {
    type Id = OwnedItemId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

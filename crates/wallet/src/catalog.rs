use serde::{Deserialize, Serialize};

use coffer_core::{DomainError, ValueObject};

use crate::error::WalletError;

/// Identifier of a purchasable item in the external catalog.
///
/// Catalog ids are owned by the catalog collaborator and are opaque strings here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CatalogItemId(String);

impl CatalogItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for CatalogItemId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CatalogItemId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Snapshot of a catalog listing as presented by the caller at purchase time.
///
/// `price` is optional because the catalog collaborator may hand over a listing without
/// a price; such a listing cannot be bought.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: CatalogItemId,
    pub name: String,
    #[serde(default)]
    pub rarity: Option<String>,
    pub price: Option<i64>,
}

impl ValueObject for CatalogItem {}

impl CatalogItem {
    pub fn new(id: impl Into<String>, name: impl Into<String>, price: i64) -> Self {
        Self {
            id: CatalogItemId::new(id),
            name: name.into(),
            rarity: None,
            price: Some(price),
        }
    }

    pub fn with_rarity(mut self, rarity: impl Into<String>) -> Self {
        self.rarity = Some(rarity.into());
        self
    }

    /// The price to charge, rejecting missing and non-positive prices.
    pub fn checked_price(&self) -> Result<i64, WalletError> {
        match self.price {
            None => Err(WalletError::InvalidPrice(format!(
                "item '{}' has no price",
                self.id
            ))),
            Some(p) if p <= 0 => Err(WalletError::InvalidPrice(format!(
                "price must be positive (item '{}', got {p})",
                self.id
            ))),
            Some(p) => Ok(p),
        }
    }

    pub(crate) fn ensure_identified(&self) -> Result<(), DomainError> {
        if self.id.as_str().trim().is_empty() {
            return Err(DomainError::validation("catalog item id must not be empty"));
        }
        Ok(())
    }
}

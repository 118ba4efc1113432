use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use coffer_core::{AccountId, ValueObject};

/// Persisted wallet account.
///
/// `version` is the optimistic concurrency stamp: every committed mutation advances it by
/// exactly one, and writers only succeed against the version they read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// Smallest currency unit. Never negative.
    pub balance: i64,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn view(&self) -> AccountView {
        AccountView {
            id: self.id,
            balance: self.balance,
            version: self.version,
        }
    }
}

/// Read projection of an account returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountView {
    pub id: AccountId,
    pub balance: i64,
    pub version: u64,
}

impl ValueObject for AccountView {}

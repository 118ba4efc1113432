use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

use coffer_core::{AccountId, DomainError, ExpectedVersion, OwnedItemId};
use coffer_wallet::{Account, CatalogItemId, LedgerEntry, OwnedItem, WalletError};

/// Store operation error.
///
/// These are **infrastructure errors** as opposed to wallet rule violations. A
/// `Conflict` means a concurrent writer got there first and the whole unit of work should
/// be retried from a fresh read; the other variants are surfaced as storage failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<StoreError> for WalletError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict(msg) => WalletError::Domain(DomainError::conflict(msg)),
            StoreError::Storage(msg) => WalletError::StorageFailure(msg),
            StoreError::Corrupt(msg) => WalletError::StorageFailure(format!("corrupt record: {msg}")),
        }
    }
}

/// Records that reference an account and therefore block its deletion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dependents {
    pub ledger_entries: u64,
    pub owned_items: u64,
}

impl Dependents {
    pub fn is_empty(&self) -> bool {
        self.ledger_entries == 0 && self.owned_items == 0
    }
}

/// Durable home of accounts, ownership records and ledger entries.
///
/// The only entry point is `begin`: every read and write happens inside a unit of work,
/// and nothing a unit of work writes becomes visible to anyone else before `commit`.
#[async_trait]
pub trait WalletStore: Send + Sync {
    /// Open a new unit of work.
    async fn begin(&self) -> Result<Box<dyn WalletTx>, StoreError>;
}

#[async_trait]
impl<S> WalletStore for Arc<S>
where
    S: WalletStore + ?Sized,
{
    async fn begin(&self) -> Result<Box<dyn WalletTx>, StoreError> {
        (**self).begin().await
    }
}

/// One atomic unit of work spanning the account, ownership and ledger tables.
///
/// Implementations must:
/// - make all writes visible together at `commit`, or none of them
/// - discard staged writes when dropped without `commit`
/// - reject a conditional account write whose `ExpectedVersion` no longer holds at commit
///   time with `StoreError::Conflict`
/// - reject a second active ownership record for the same (account, catalog item) and a
///   duplicate (account, sequence) ledger entry with `StoreError::Conflict`
/// - never update or delete ledger entries
#[async_trait]
pub trait WalletTx: Send {
    async fn load_account(&mut self, account_id: AccountId) -> Result<Option<Account>, StoreError>;

    /// Insert a brand-new account. Fails with `Conflict` if the id is taken.
    async fn insert_account(&mut self, account: &Account) -> Result<(), StoreError>;

    /// Compare-and-swap the balance and version of an existing account.
    async fn update_account(
        &mut self,
        account: &Account,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError>;

    async fn delete_account(
        &mut self,
        account_id: AccountId,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError>;

    /// The active ownership record for (account, catalog item), if any.
    async fn find_active_item(
        &mut self,
        account_id: AccountId,
        catalog_item_id: &CatalogItemId,
    ) -> Result<Option<OwnedItem>, StoreError>;

    /// An ownership record by id, active or not, scoped to the account.
    async fn find_owned_item(
        &mut self,
        account_id: AccountId,
        owned_item_id: OwnedItemId,
    ) -> Result<Option<OwnedItem>, StoreError>;

    /// All ownership records of the account, newest purchase first.
    async fn list_owned_items(&mut self, account_id: AccountId) -> Result<Vec<OwnedItem>, StoreError>;

    async fn insert_owned_item(&mut self, item: &OwnedItem) -> Result<(), StoreError>;

    /// Flip an active record to refunded. Fails with `Conflict` if it is no longer active.
    async fn mark_refunded(
        &mut self,
        account_id: AccountId,
        owned_item_id: OwnedItemId,
        refunded_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn append_entry(&mut self, entry: &LedgerEntry) -> Result<(), StoreError>;

    /// All ledger entries of the account, newest first.
    async fn list_entries(&mut self, account_id: AccountId) -> Result<Vec<LedgerEntry>, StoreError>;

    async fn count_dependents(&mut self, account_id: AccountId) -> Result<Dependents, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

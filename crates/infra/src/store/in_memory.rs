use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use coffer_core::{AccountId, ExpectedVersion, OwnedItemId};
use coffer_wallet::{Account, CatalogItemId, LedgerEntry, OwnedItem, newest_first};

use super::r#trait::{Dependents, StoreError, WalletStore, WalletTx};

#[derive(Debug, Default)]
struct Tables {
    accounts: HashMap<AccountId, Account>,
    items: HashMap<OwnedItemId, OwnedItem>,
    entries: Vec<LedgerEntry>,
}

/// In-memory wallet store.
///
/// Intended for tests/dev. Not optimized for performance. Units of work stage their
/// writes privately and apply them under a single write lock at commit, after
/// re-checking every version expectation and uniqueness rule against committed state.
#[derive(Debug, Default, Clone)]
pub struct InMemoryWalletStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryWalletStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WalletStore for InMemoryWalletStore {
    async fn begin(&self) -> Result<Box<dyn WalletTx>, StoreError> {
        Ok(Box::new(InMemoryWalletTx {
            tables: self.tables.clone(),
            accounts: HashMap::new(),
            checks: Vec::new(),
            items: HashMap::new(),
            entries: Vec::new(),
        }))
    }
}

/// Unit of work over `InMemoryWalletStore`. Reads see committed state overlaid with this
/// unit's own staged writes.
#[derive(Debug)]
pub struct InMemoryWalletTx {
    tables: Arc<RwLock<Tables>>,
    /// Staged account rows; `None` marks a deletion.
    accounts: HashMap<AccountId, Option<Account>>,
    /// Version expectations re-checked at commit.
    checks: Vec<(AccountId, ExpectedVersion)>,
    items: HashMap<OwnedItemId, OwnedItem>,
    entries: Vec<LedgerEntry>,
}

fn poisoned() -> StoreError {
    StoreError::Storage("lock poisoned".to_string())
}

impl InMemoryWalletTx {
    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> Result<T, StoreError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        Ok(f(&tables))
    }

    fn current_account(&self, account_id: AccountId) -> Result<Option<Account>, StoreError> {
        if let Some(staged) = self.accounts.get(&account_id) {
            return Ok(staged.clone());
        }
        self.read(|t| t.accounts.get(&account_id).cloned())
    }

    /// Committed records of the account with staged records layered on top.
    fn items_of(&self, account_id: AccountId) -> Result<Vec<OwnedItem>, StoreError> {
        let mut merged: HashMap<OwnedItemId, OwnedItem> = self.read(|t| {
            t.items
                .values()
                .filter(|i| i.account_id == account_id)
                .map(|i| (i.id, i.clone()))
                .collect()
        })?;
        for item in self.items.values().filter(|i| i.account_id == account_id) {
            merged.insert(item.id, item.clone());
        }
        Ok(merged.into_values().collect())
    }

    fn entries_of(&self, account_id: AccountId) -> Result<Vec<LedgerEntry>, StoreError> {
        let mut entries: Vec<LedgerEntry> = self.read(|t| {
            t.entries
                .iter()
                .filter(|e| e.account_id == account_id)
                .cloned()
                .collect()
        })?;
        entries.extend(self.entries.iter().filter(|e| e.account_id == account_id).cloned());
        Ok(entries)
    }

    fn validate(&self, tables: &Tables) -> Result<(), StoreError> {
        for (account_id, expected) in &self.checks {
            let actual = tables.accounts.get(account_id).map(|a| a.version);
            if !expected.matches(actual) {
                return Err(StoreError::Conflict(format!(
                    "account {account_id}: expected {expected:?}, found {actual:?}"
                )));
            }
        }

        let account_exists = |account_id: &AccountId| match self.accounts.get(account_id) {
            Some(staged) => staged.is_some(),
            None => tables.accounts.contains_key(account_id),
        };

        for item in self.items.values() {
            if !account_exists(&item.account_id) {
                return Err(StoreError::Conflict(format!(
                    "owned item {} references missing account {}",
                    item.id, item.account_id
                )));
            }
            if !item.is_active() {
                continue;
            }
            let clash = tables.items.values().any(|other| {
                other.id != item.id
                    && other.account_id == item.account_id
                    && other.catalog_item_id == item.catalog_item_id
                    && self.items.get(&other.id).unwrap_or(other).is_active()
            });
            if clash {
                return Err(StoreError::Conflict(format!(
                    "account {} already owns an active '{}'",
                    item.account_id, item.catalog_item_id
                )));
            }
        }

        for entry in &self.entries {
            if !account_exists(&entry.account_id) {
                return Err(StoreError::Conflict(format!(
                    "ledger entry {} references missing account {}",
                    entry.id, entry.account_id
                )));
            }
            let taken = tables.entries.iter().any(|e| {
                e.id == entry.id
                    || (e.account_id == entry.account_id && e.sequence == entry.sequence)
            });
            if taken {
                return Err(StoreError::Conflict(format!(
                    "ledger sequence {} already recorded for account {}",
                    entry.sequence, entry.account_id
                )));
            }
        }

        for (account_id, staged) in &self.accounts {
            if staged.is_some() {
                continue;
            }
            let referenced = tables.items.values().any(|i| &i.account_id == account_id)
                || tables.entries.iter().any(|e| &e.account_id == account_id);
            if referenced {
                return Err(StoreError::Conflict(format!(
                    "account {account_id} is still referenced"
                )));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl WalletTx for InMemoryWalletTx {
    async fn load_account(&mut self, account_id: AccountId) -> Result<Option<Account>, StoreError> {
        self.current_account(account_id)
    }

    async fn insert_account(&mut self, account: &Account) -> Result<(), StoreError> {
        if self.current_account(account.id)?.is_some() {
            return Err(StoreError::Conflict(format!("account {} already exists", account.id)));
        }
        self.checks.push((account.id, ExpectedVersion::Missing));
        self.accounts.insert(account.id, Some(account.clone()));
        Ok(())
    }

    async fn update_account(
        &mut self,
        account: &Account,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let current = self.current_account(account.id)?;
        if current.is_none() || !expected.matches(current.as_ref().map(|a| a.version)) {
            return Err(StoreError::Conflict(format!(
                "account {}: expected {expected:?}, found {:?}",
                account.id,
                current.map(|a| a.version)
            )));
        }
        self.checks.push((account.id, expected));
        self.accounts.insert(account.id, Some(account.clone()));
        Ok(())
    }

    async fn delete_account(
        &mut self,
        account_id: AccountId,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let current = self.current_account(account_id)?.map(|a| a.version);
        if current.is_none() || !expected.matches(current) {
            return Err(StoreError::Conflict(format!(
                "account {account_id}: expected {expected:?}, found {current:?}"
            )));
        }
        self.checks.push((account_id, expected));
        self.accounts.insert(account_id, None);
        Ok(())
    }

    async fn find_active_item(
        &mut self,
        account_id: AccountId,
        catalog_item_id: &CatalogItemId,
    ) -> Result<Option<OwnedItem>, StoreError> {
        Ok(self
            .items_of(account_id)?
            .into_iter()
            .find(|i| i.is_active() && &i.catalog_item_id == catalog_item_id))
    }

    async fn find_owned_item(
        &mut self,
        account_id: AccountId,
        owned_item_id: OwnedItemId,
    ) -> Result<Option<OwnedItem>, StoreError> {
        Ok(self
            .items_of(account_id)?
            .into_iter()
            .find(|i| i.id == owned_item_id))
    }

    async fn list_owned_items(&mut self, account_id: AccountId) -> Result<Vec<OwnedItem>, StoreError> {
        let mut items = self.items_of(account_id)?;
        items.sort_by(|a, b| b.purchased_at.cmp(&a.purchased_at).then(b.id.cmp(&a.id)));
        Ok(items)
    }

    async fn insert_owned_item(&mut self, item: &OwnedItem) -> Result<(), StoreError> {
        let exists = self.items.contains_key(&item.id)
            || self.read(|t| t.items.contains_key(&item.id))?;
        if exists {
            return Err(StoreError::Conflict(format!("owned item {} already exists", item.id)));
        }
        self.items.insert(item.id, item.clone());
        Ok(())
    }

    async fn mark_refunded(
        &mut self,
        account_id: AccountId,
        owned_item_id: OwnedItemId,
        refunded_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut item = self
            .find_owned_item(account_id, owned_item_id)
            .await?
            .filter(|i| i.is_active())
            .ok_or_else(|| {
                StoreError::Conflict(format!("owned item {owned_item_id} is no longer active"))
            })?;
        item.mark_refunded(refunded_at)
            .map_err(|e| StoreError::Conflict(e.to_string()))?;
        self.items.insert(item.id, item);
        Ok(())
    }

    async fn append_entry(&mut self, entry: &LedgerEntry) -> Result<(), StoreError> {
        self.entries.push(entry.clone());
        Ok(())
    }

    async fn list_entries(&mut self, account_id: AccountId) -> Result<Vec<LedgerEntry>, StoreError> {
        let mut entries = self.entries_of(account_id)?;
        newest_first(&mut entries);
        Ok(entries)
    }

    async fn count_dependents(&mut self, account_id: AccountId) -> Result<Dependents, StoreError> {
        Ok(Dependents {
            ledger_entries: self.entries_of(account_id)?.len() as u64,
            owned_items: self.items_of(account_id)?.len() as u64,
        })
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        let mut tables = this.tables.write().map_err(|_| poisoned())?;

        this.validate(&tables)?;

        for (account_id, staged) in this.accounts {
            match staged {
                Some(account) => {
                    tables.accounts.insert(account_id, account);
                }
                None => {
                    tables.accounts.remove(&account_id);
                }
            }
        }
        for (id, item) in this.items {
            tables.items.insert(id, item);
        }
        tables.entries.extend(this.entries);

        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coffer_core::LedgerEntryId;
    use coffer_wallet::{LedgerEntryKind, OwnershipStatus};

    fn account(version: u64, balance: i64) -> Account {
        Account {
            id: AccountId::new(),
            balance,
            version,
            created_at: Utc::now(),
        }
    }

    fn item(account_id: AccountId, catalog: &str) -> OwnedItem {
        OwnedItem {
            id: OwnedItemId::new(),
            account_id,
            catalog_item_id: CatalogItemId::new(catalog),
            name: catalog.to_string(),
            rarity: None,
            price: 100,
            status: OwnershipStatus::Active,
            purchased_at: Utc::now(),
            refunded_at: None,
        }
    }

    fn entry(account_id: AccountId, sequence: u64, amount: i64, balance_after: i64) -> LedgerEntry {
        LedgerEntry {
            id: LedgerEntryId::new(),
            account_id,
            kind: LedgerEntryKind::InitialCredit,
            amount,
            balance_after,
            reference: None,
            sequence,
            occurred_at: Utc::now(),
        }
    }

    async fn seed(store: &InMemoryWalletStore, account: &Account) {
        let mut tx = store.begin().await.unwrap();
        tx.insert_account(account).await.unwrap();
        tx.append_entry(&entry(account.id, account.version, account.balance, account.balance))
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible() {
        let store = InMemoryWalletStore::new();
        let acc = account(1, 500);

        let mut tx = store.begin().await.unwrap();
        tx.insert_account(&acc).await.unwrap();
        assert!(tx.load_account(acc.id).await.unwrap().is_some());

        let mut other = store.begin().await.unwrap();
        assert!(other.load_account(acc.id).await.unwrap().is_none());

        drop(tx);
        assert!(other.load_account(acc.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_version_fails_at_commit() {
        let store = InMemoryWalletStore::new();
        let acc = account(1, 500);
        seed(&store, &acc).await;

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();

        let mut a = first.load_account(acc.id).await.unwrap().unwrap();
        let mut b = second.load_account(acc.id).await.unwrap().unwrap();
        a.balance -= 100;
        a.version += 1;
        b.balance -= 200;
        b.version += 1;

        first.update_account(&a, ExpectedVersion::Exact(1)).await.unwrap();
        second.update_account(&b, ExpectedVersion::Exact(1)).await.unwrap();

        first.commit().await.unwrap();
        assert!(matches!(second.commit().await, Err(StoreError::Conflict(_))));

        let mut reader = store.begin().await.unwrap();
        let stored = reader.load_account(acc.id).await.unwrap().unwrap();
        assert_eq!(stored.balance, 400);
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn second_active_copy_is_rejected_at_commit() {
        let store = InMemoryWalletStore::new();
        let acc = account(1, 500);
        seed(&store, &acc).await;

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        first.insert_owned_item(&item(acc.id, "cid_001")).await.unwrap();
        second.insert_owned_item(&item(acc.id, "cid_001")).await.unwrap();

        first.commit().await.unwrap();
        assert!(matches!(second.commit().await, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn refund_then_rebuy_in_one_unit_is_allowed() {
        let store = InMemoryWalletStore::new();
        let acc = account(1, 500);
        seed(&store, &acc).await;

        let original = item(acc.id, "cid_001");
        let mut tx = store.begin().await.unwrap();
        tx.insert_owned_item(&original).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.mark_refunded(acc.id, original.id, Utc::now()).await.unwrap();
        tx.insert_owned_item(&item(acc.id, "cid_001")).await.unwrap();
        tx.commit().await.unwrap();

        let mut reader = store.begin().await.unwrap();
        let items = reader.list_owned_items(acc.id).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items.iter().filter(|i| i.is_active()).count(), 1);
    }

    #[tokio::test]
    async fn refunding_twice_conflicts() {
        let store = InMemoryWalletStore::new();
        let acc = account(1, 500);
        seed(&store, &acc).await;
        let owned = item(acc.id, "cid_001");

        let mut tx = store.begin().await.unwrap();
        tx.insert_owned_item(&owned).await.unwrap();
        tx.mark_refunded(acc.id, owned.id, Utc::now()).await.unwrap();
        let again = tx.mark_refunded(acc.id, owned.id, Utc::now()).await;
        assert!(matches!(again, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn duplicate_ledger_sequence_conflicts() {
        let store = InMemoryWalletStore::new();
        let acc = account(1, 500);
        seed(&store, &acc).await;

        let mut tx = store.begin().await.unwrap();
        tx.append_entry(&entry(acc.id, 1, 0, 500)).await.unwrap();
        assert!(matches!(tx.commit().await, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn referenced_account_cannot_be_deleted() {
        let store = InMemoryWalletStore::new();
        let acc = account(1, 500);
        seed(&store, &acc).await;

        let mut tx = store.begin().await.unwrap();
        assert_eq!(
            tx.count_dependents(acc.id).await.unwrap(),
            Dependents {
                ledger_entries: 1,
                owned_items: 0
            }
        );
        tx.delete_account(acc.id, ExpectedVersion::Exact(1)).await.unwrap();
        assert!(matches!(tx.commit().await, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn entries_are_listed_newest_first() {
        let store = InMemoryWalletStore::new();
        let acc = account(1, 500);
        seed(&store, &acc).await;

        let mut tx = store.begin().await.unwrap();
        tx.append_entry(&entry(acc.id, 2, -100, 400)).await.unwrap();
        tx.append_entry(&entry(acc.id, 3, -100, 300)).await.unwrap();
        tx.commit().await.unwrap();

        let mut reader = store.begin().await.unwrap();
        let sequences: Vec<u64> = reader
            .list_entries(acc.id)
            .await
            .unwrap()
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(sequences, vec![3, 2, 1]);
    }
}

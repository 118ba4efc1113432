//! Wallet operation pipeline (application-level orchestration).
//!
//! Every balance-affecting operation runs through the same steps inside one unit of work:
//!
//! ```text
//! Operation
//!   ↓
//! 1. Begin a unit of work on the store
//!   ↓
//! 2. Load the account and the ownership records the decision needs
//!   ↓
//! 3. Decide (`Wallet::handle`, pure, no writes)
//!   ↓
//! 4. Apply the events and derive ledger entries
//!   ↓
//! 5. Write account (version-checked), ownership records and ledger entries
//!   ↓
//! 6. Commit
//! ```
//!
//! A rejection in step 3 rolls the unit of work back before anything was written. A version
//! conflict anywhere in steps 5-6 restarts the whole pipeline from a fresh read, up to
//! `EngineConfig::max_attempts` times.

use chrono::Utc;
use std::future::Future;
use tracing::{debug, info, instrument, warn};

use coffer_core::{Aggregate, AccountId, DomainError, ExpectedVersion, LedgerEntryId, OwnedItemId};
use coffer_wallet::{
    AccountView, CatalogItem, CatalogItemId, GrantInitialCredit, LedgerEntry, OwnedItem,
    PurchaseItem, RefundItem, Wallet, WalletCommand, WalletError, WalletEvent, newest_first,
};

use crate::config::EngineConfig;
use crate::store::{WalletStore, WalletTx};

/// Executes wallet operations as all-or-nothing units of work against a `WalletStore`.
///
/// Operations on the same account are serialized by the account version; operations on
/// different accounts never contend.
#[derive(Debug)]
pub struct WalletEngine<S> {
    store: S,
    config: EngineConfig,
}

impl<S> WalletEngine<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    pub fn with_config(store: S, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl<S> WalletEngine<S>
where
    S: WalletStore,
{
    /// Create `account_id` with a starting balance of `amount` and its INITIAL_CREDIT entry.
    #[instrument(skip(self), fields(account_id = %account_id), err)]
    pub async fn grant_initial_credit(
        &self,
        account_id: AccountId,
        amount: i64,
    ) -> Result<(), WalletError> {
        self.with_retry("grant_initial_credit", || self.try_grant(account_id, amount))
            .await
            .map(|_| ())
    }

    /// Create a fresh account with the configured starting credit.
    #[instrument(skip(self), err)]
    pub async fn open_account(&self) -> Result<AccountView, WalletError> {
        let account_id = AccountId::new();
        let amount = self.config.initial_credit;
        self.with_retry("open_account", || self.try_grant(account_id, amount))
            .await
    }

    /// Buy `item` for the account: debit, ownership record and ledger entry, atomically.
    #[instrument(skip(self), fields(account_id = %account_id, catalog_item_id = %item.id), err)]
    pub async fn purchase(
        &self,
        account_id: AccountId,
        item: CatalogItem,
    ) -> Result<AccountView, WalletError> {
        self.with_retry("purchase", || self.try_purchase(account_id, item.clone()))
            .await
    }

    /// Refund an active ownership record. The credited amount is `amount_override` when
    /// given, otherwise the price paid.
    #[instrument(skip(self), fields(account_id = %account_id, owned_item_id = %owned_item_id), err)]
    pub async fn refund(
        &self,
        account_id: AccountId,
        owned_item_id: OwnedItemId,
        amount_override: Option<i64>,
    ) -> Result<AccountView, WalletError> {
        self.with_retry("refund", || {
            self.try_refund(account_id, owned_item_id, amount_override)
        })
        .await
    }

    /// Refund whatever record is currently active for `catalog_item_id`, resolved inside the
    /// same unit of work as the refund itself.
    #[instrument(
        skip(self),
        fields(account_id = %account_id, catalog_item_id = %catalog_item_id),
        err
    )]
    pub async fn refund_catalog_item(
        &self,
        account_id: AccountId,
        catalog_item_id: &CatalogItemId,
        amount_override: Option<i64>,
    ) -> Result<AccountView, WalletError> {
        self.with_retry("refund_catalog_item", || {
            self.try_refund_catalog_item(account_id, catalog_item_id, amount_override)
        })
        .await
    }

    /// All ledger entries of the account, newest first.
    #[instrument(skip(self), fields(account_id = %account_id), err)]
    pub async fn list_ledger(&self, account_id: AccountId) -> Result<Vec<LedgerEntry>, WalletError> {
        let mut tx = self.store.begin().await?;
        require_account(tx.as_mut(), account_id).await?;
        let mut entries = tx.list_entries(account_id).await?;
        tx.rollback().await?;

        newest_first(&mut entries);
        Ok(entries)
    }

    #[instrument(skip(self), fields(account_id = %account_id), err)]
    pub async fn get_balance(&self, account_id: AccountId) -> Result<i64, WalletError> {
        Ok(self.get_account(account_id).await?.balance)
    }

    #[instrument(skip(self), fields(account_id = %account_id), err)]
    pub async fn get_account(&self, account_id: AccountId) -> Result<AccountView, WalletError> {
        let mut tx = self.store.begin().await?;
        let wallet = require_account(tx.as_mut(), account_id).await?;
        tx.rollback().await?;
        Ok(wallet.account().view())
    }

    /// Every ownership record of the account, active and refunded, newest purchase first.
    #[instrument(skip(self), fields(account_id = %account_id), err)]
    pub async fn list_owned_items(&self, account_id: AccountId) -> Result<Vec<OwnedItem>, WalletError> {
        let mut tx = self.store.begin().await?;
        require_account(tx.as_mut(), account_id).await?;
        let items = tx.list_owned_items(account_id).await?;
        tx.rollback().await?;
        Ok(items)
    }

    #[instrument(skip(self), fields(account_id = %account_id), err)]
    pub async fn find_active_item(
        &self,
        account_id: AccountId,
        catalog_item_id: &CatalogItemId,
    ) -> Result<OwnedItem, WalletError> {
        let mut tx = self.store.begin().await?;
        require_account(tx.as_mut(), account_id).await?;
        let item = tx.find_active_item(account_id, catalog_item_id).await?;
        tx.rollback().await?;

        item.ok_or_else(|| {
            WalletError::OwnedItemNotFound(format!(
                "account {account_id} has no active '{catalog_item_id}'"
            ))
        })
    }

    /// One ownership record of the account, active or refunded.
    #[instrument(skip(self), fields(account_id = %account_id, owned_item_id = %owned_item_id), err)]
    pub async fn get_owned_item(
        &self,
        account_id: AccountId,
        owned_item_id: OwnedItemId,
    ) -> Result<OwnedItem, WalletError> {
        let mut tx = self.store.begin().await?;
        require_account(tx.as_mut(), account_id).await?;
        let item = tx.find_owned_item(account_id, owned_item_id).await?;
        tx.rollback().await?;

        item.ok_or_else(|| {
            WalletError::OwnedItemNotFound(format!(
                "account {account_id} has no record {owned_item_id}"
            ))
        })
    }

    /// Delete an account that nothing references.
    #[instrument(skip(self), fields(account_id = %account_id), err)]
    pub async fn delete_account(&self, account_id: AccountId) -> Result<(), WalletError> {
        self.with_retry("delete_account", || self.try_delete(account_id))
            .await
    }

    /// Run `attempt` until it stops reporting a version conflict, sleeping
    /// `attempt_number * retry_backoff` between tries.
    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> Result<T, WalletError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, WalletError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts: u32 = 1;

        loop {
            match attempt().await {
                Err(WalletError::Domain(DomainError::Conflict(reason))) => {
                    if attempts >= max_attempts {
                        warn!(operation, attempts, %reason, "giving up after repeated version conflicts");
                        return Err(WalletError::ConcurrencyConflict { attempts });
                    }
                    warn!(operation, attempt = attempts, %reason, "version conflict, retrying");
                    tokio::time::sleep(self.config.retry_backoff() * attempts).await;
                    attempts += 1;
                }
                other => return other,
            }
        }
    }

    async fn try_grant(&self, account_id: AccountId, amount: i64) -> Result<AccountView, WalletError> {
        let mut tx = self.store.begin().await?;

        let wallet = match tx.load_account(account_id).await? {
            Some(account) => Wallet::load(account),
            None => Wallet::unopened(account_id),
        };

        let command = WalletCommand::GrantInitialCredit(GrantInitialCredit {
            account_id,
            entry_id: LedgerEntryId::new(),
            amount,
            occurred_at: Utc::now(),
        });

        let wallet = self.execute(tx, wallet, command).await?;
        Ok(wallet.account().view())
    }

    async fn try_purchase(&self, account_id: AccountId, item: CatalogItem) -> Result<AccountView, WalletError> {
        let mut tx = self.store.begin().await?;

        let wallet = require_account(tx.as_mut(), account_id).await?;
        let active = tx.find_active_item(account_id, &item.id).await?;
        let wallet = wallet.with_items(active);

        let command = WalletCommand::Purchase(PurchaseItem {
            account_id,
            owned_item_id: OwnedItemId::new(),
            entry_id: LedgerEntryId::new(),
            item,
            occurred_at: Utc::now(),
        });

        let wallet = self.execute(tx, wallet, command).await?;
        Ok(wallet.account().view())
    }

    async fn try_refund(
        &self,
        account_id: AccountId,
        owned_item_id: OwnedItemId,
        amount_override: Option<i64>,
    ) -> Result<AccountView, WalletError> {
        let mut tx = self.store.begin().await?;

        let wallet = require_account(tx.as_mut(), account_id).await?;
        let owned = tx.find_owned_item(account_id, owned_item_id).await?;
        let wallet = wallet.with_items(owned);

        let command = WalletCommand::Refund(RefundItem {
            account_id,
            owned_item_id,
            entry_id: LedgerEntryId::new(),
            amount_override,
            policy: self.config.refund_override_policy,
            occurred_at: Utc::now(),
        });

        let wallet = self.execute(tx, wallet, command).await?;
        Ok(wallet.account().view())
    }

    async fn try_refund_catalog_item(
        &self,
        account_id: AccountId,
        catalog_item_id: &CatalogItemId,
        amount_override: Option<i64>,
    ) -> Result<AccountView, WalletError> {
        let mut tx = self.store.begin().await?;

        let wallet = require_account(tx.as_mut(), account_id).await?;
        let Some(active) = tx.find_active_item(account_id, catalog_item_id).await? else {
            tx.rollback().await?;
            return Err(WalletError::OwnedItemNotFound(format!(
                "account {account_id} has no active '{catalog_item_id}'"
            )));
        };
        let owned_item_id = active.id;
        let wallet = wallet.with_items(Some(active));

        let command = WalletCommand::Refund(RefundItem {
            account_id,
            owned_item_id,
            entry_id: LedgerEntryId::new(),
            amount_override,
            policy: self.config.refund_override_policy,
            occurred_at: Utc::now(),
        });

        let wallet = self.execute(tx, wallet, command).await?;
        Ok(wallet.account().view())
    }

    async fn try_delete(&self, account_id: AccountId) -> Result<(), WalletError> {
        let mut tx = self.store.begin().await?;

        let wallet = require_account(tx.as_mut(), account_id).await?;
        let dependents = tx.count_dependents(account_id).await?;
        if !dependents.is_empty() {
            tx.rollback().await?;
            return Err(WalletError::AccountHasDependents {
                account_id,
                ledger_entries: dependents.ledger_entries,
                owned_items: dependents.owned_items,
            });
        }

        tx.delete_account(account_id, ExpectedVersion::Exact(wallet.account().version))
            .await?;
        tx.commit().await?;

        info!(account_id = %account_id, "account deleted");
        Ok(())
    }

    /// Decide, apply and persist one command inside `tx`.
    async fn execute(
        &self,
        mut tx: Box<dyn WalletTx>,
        mut wallet: Wallet,
        command: WalletCommand,
    ) -> Result<Wallet, WalletError> {
        let expected = if wallet.is_opened() {
            ExpectedVersion::Exact(wallet.account().version)
        } else {
            ExpectedVersion::Missing
        };

        let events = match wallet.handle(&command) {
            Ok(events) => events,
            Err(err) => {
                debug!(error = %err, "operation rejected");
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "rollback after rejection failed");
                }
                return Err(err);
            }
        };

        let mut entries = Vec::with_capacity(events.len());
        for event in &events {
            wallet.apply(event);
            entries.push(LedgerEntry::record(event, wallet.account()));
        }

        match expected {
            ExpectedVersion::Missing => tx.insert_account(wallet.account()).await?,
            _ => tx.update_account(wallet.account(), expected).await?,
        }

        for event in &events {
            match event {
                WalletEvent::InitialCreditGranted(_) => {}
                WalletEvent::ItemPurchased(e) => {
                    let item = wallet.item(e.owned_item_id).ok_or_else(|| {
                        WalletError::OwnedItemNotFound(e.owned_item_id.to_string())
                    })?;
                    tx.insert_owned_item(item).await?;
                }
                WalletEvent::ItemRefunded(e) => {
                    tx.mark_refunded(e.account_id, e.owned_item_id, e.occurred_at)
                        .await?;
                }
            }
        }

        for entry in &entries {
            tx.append_entry(entry).await?;
        }

        tx.commit().await?;

        for event in &events {
            info!(
                event_type = event.event_type(),
                balance = wallet.account().balance,
                version = wallet.account().version,
                "wallet mutation committed"
            );
        }

        Ok(wallet)
    }
}

/// Load an existing account into a `Wallet`, or fail with `AccountNotFound`.
async fn require_account(tx: &mut dyn WalletTx, account_id: AccountId) -> Result<Wallet, WalletError> {
    tx.load_account(account_id)
        .await?
        .map(Wallet::load)
        .ok_or(WalletError::AccountNotFound(account_id))
}

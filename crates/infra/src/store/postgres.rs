//! Postgres-backed wallet store.
//!
//! Each `WalletTx` wraps one database transaction. The schema (see `migrations/`) backs
//! every invariant the engine relies on, so a racing writer is caught by the database
//! even when both writers passed their in-process checks.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `Conflict` | Second active ownership record, duplicate ledger sequence |
//! | Database (foreign key violation) | `23503` | `Conflict` | Account deleted while a dependent row was written |
//! | Database (serialization failure) | `40001` | `Conflict` | Serializable isolation abort |
//! | Database (deadlock detected) | `40P01` | `Conflict` | Lock cycle between writers |
//! | Database (check constraint violation) | `23514` | `Corrupt` | Negative balance or malformed row reached the database |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | PoolClosed | N/A | `Storage` | Connection pool was closed |
//! | Other | N/A | `Storage` | Network errors, connection failures, etc. |
//!
//! A conditional `UPDATE`/`DELETE` that matches zero rows is also reported as `Conflict`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use tracing::{debug, instrument};

use coffer_core::{AccountId, ExpectedVersion, LedgerEntryId, OwnedItemId};
use coffer_wallet::{
    Account, CatalogItemId, LedgerEntry, LedgerEntryKind, OwnedItem, OwnershipStatus,
};

use super::r#trait::{Dependents, StoreError, WalletStore, WalletTx};

/// Postgres-backed wallet store.
///
/// `Send + Sync`; clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct PostgresWalletStore {
    pool: Arc<PgPool>,
}

impl PostgresWalletStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Apply the bundled schema migrations.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&*self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("migration failed: {e}")))
    }
}

#[async_trait]
impl WalletStore for PostgresWalletStore {
    async fn begin(&self) -> Result<Box<dyn WalletTx>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PgWalletTx { tx }))
    }
}

/// Unit of work over one Postgres transaction. Dropping it without `commit` rolls back.
pub struct PgWalletTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl WalletTx for PgWalletTx {
    async fn load_account(&mut self, account_id: AccountId) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, balance, version, created_at
            FROM accounts
            WHERE id = $1
            "#,
        )
        .bind(account_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("load_account", e))?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn insert_account(&mut self, account: &Account) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO accounts (id, balance, version, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(account.id.as_uuid())
        .bind(account.balance)
        .bind(to_db_int(account.version)?)
        .bind(account.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_account", e))?;
        Ok(())
    }

    async fn update_account(
        &mut self,
        account: &Account,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let ExpectedVersion::Exact(expected_version) = expected else {
            return Err(StoreError::Conflict(format!(
                "account update requires an exact version, got {expected:?}"
            )));
        };

        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET balance = $2, version = $3
            WHERE id = $1 AND version = $4
            "#,
        )
        .bind(account.id.as_uuid())
        .bind(account.balance)
        .bind(to_db_int(account.version)?)
        .bind(to_db_int(expected_version)?)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_account", e))?;

        if result.rows_affected() == 0 {
            debug!(account_id = %account.id, expected_version, "version check matched no row");
            return Err(StoreError::Conflict(format!(
                "account {} is no longer at version {expected_version}",
                account.id
            )));
        }
        Ok(())
    }

    async fn delete_account(
        &mut self,
        account_id: AccountId,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let ExpectedVersion::Exact(expected_version) = expected else {
            return Err(StoreError::Conflict(format!(
                "account delete requires an exact version, got {expected:?}"
            )));
        };

        let result = sqlx::query("DELETE FROM accounts WHERE id = $1 AND version = $2")
            .bind(account_id.as_uuid())
            .bind(to_db_int(expected_version)?)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_account", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "account {account_id} is no longer at version {expected_version}"
            )));
        }
        Ok(())
    }

    async fn find_active_item(
        &mut self,
        account_id: AccountId,
        catalog_item_id: &CatalogItemId,
    ) -> Result<Option<OwnedItem>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, account_id, catalog_item_id, name, rarity, price, active,
                   purchased_at, refunded_at
            FROM owned_items
            WHERE account_id = $1 AND catalog_item_id = $2 AND active
            "#,
        )
        .bind(account_id.as_uuid())
        .bind(catalog_item_id.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("find_active_item", e))?;

        row.as_ref().map(owned_item_from_row).transpose()
    }

    async fn find_owned_item(
        &mut self,
        account_id: AccountId,
        owned_item_id: OwnedItemId,
    ) -> Result<Option<OwnedItem>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, account_id, catalog_item_id, name, rarity, price, active,
                   purchased_at, refunded_at
            FROM owned_items
            WHERE id = $1 AND account_id = $2
            "#,
        )
        .bind(owned_item_id.as_uuid())
        .bind(account_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("find_owned_item", e))?;

        row.as_ref().map(owned_item_from_row).transpose()
    }

    async fn list_owned_items(&mut self, account_id: AccountId) -> Result<Vec<OwnedItem>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, catalog_item_id, name, rarity, price, active,
                   purchased_at, refunded_at
            FROM owned_items
            WHERE account_id = $1
            ORDER BY purchased_at DESC, id DESC
            "#,
        )
        .bind(account_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("list_owned_items", e))?;

        rows.iter().map(owned_item_from_row).collect()
    }

    async fn insert_owned_item(&mut self, item: &OwnedItem) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO owned_items (
                id, account_id, catalog_item_id, name, rarity, price, active,
                purchased_at, refunded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(item.id.as_uuid())
        .bind(item.account_id.as_uuid())
        .bind(item.catalog_item_id.as_str())
        .bind(&item.name)
        .bind(item.rarity.as_deref())
        .bind(item.price)
        .bind(item.is_active())
        .bind(item.purchased_at)
        .bind(item.refunded_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_owned_item", e))?;
        Ok(())
    }

    async fn mark_refunded(
        &mut self,
        account_id: AccountId,
        owned_item_id: OwnedItemId,
        refunded_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE owned_items
            SET active = FALSE, refunded_at = $3
            WHERE id = $1 AND account_id = $2 AND active
            "#,
        )
        .bind(owned_item_id.as_uuid())
        .bind(account_id.as_uuid())
        .bind(refunded_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("mark_refunded", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "owned item {owned_item_id} is no longer active"
            )));
        }
        Ok(())
    }

    async fn append_entry(&mut self, entry: &LedgerEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO ledger_entries (
                id, account_id, kind, amount, balance_after, reference, sequence, occurred_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.account_id.as_uuid())
        .bind(entry.kind.as_str())
        .bind(entry.amount)
        .bind(entry.balance_after)
        .bind(entry.reference.as_ref().map(|r| r.as_str()))
        .bind(to_db_int(entry.sequence)?)
        .bind(entry.occurred_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("append_entry", e))?;
        Ok(())
    }

    async fn list_entries(&mut self, account_id: AccountId) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, kind, amount, balance_after, reference, sequence, occurred_at
            FROM ledger_entries
            WHERE account_id = $1
            ORDER BY sequence DESC, id DESC
            "#,
        )
        .bind(account_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("list_entries", e))?;

        rows.iter().map(ledger_entry_from_row).collect()
    }

    async fn count_dependents(&mut self, account_id: AccountId) -> Result<Dependents, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM ledger_entries WHERE account_id = $1) AS ledger_entries,
                (SELECT COUNT(*) FROM owned_items WHERE account_id = $1) AS owned_items
            "#,
        )
        .bind(account_id.as_uuid())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("count_dependents", e))?;

        let ledger_entries: i64 = row.try_get("ledger_entries").map_err(corrupt)?;
        let owned_items: i64 = row.try_get("owned_items").map_err(corrupt)?;
        Ok(Dependents {
            ledger_entries: from_db_int("ledger_entries", ledger_entries)?,
            owned_items: from_db_int("owned_items", owned_items)?,
        })
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

/// Map SQLx errors to `StoreError`. See the module docs for the full table.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("23503") | Some("40001") | Some("40P01") => {
                    StoreError::Conflict(msg)
                }
                Some("23514") => StoreError::Corrupt(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::RowNotFound => {
            StoreError::Storage(format!("unexpected row not found in {operation}"))
        }
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn corrupt(err: sqlx::Error) -> StoreError {
    StoreError::Corrupt(err.to_string())
}

fn to_db_int(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Storage(format!("{value} does not fit BIGINT")))
}

fn from_db_int(column: &str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} is negative ({value})")))
}

// Row conversions

fn account_from_row(row: &PgRow) -> Result<Account, StoreError> {
    let version: i64 = row.try_get("version").map_err(corrupt)?;
    Ok(Account {
        id: AccountId::from_uuid(row.try_get("id").map_err(corrupt)?),
        balance: row.try_get("balance").map_err(corrupt)?,
        version: from_db_int("version", version)?,
        created_at: row.try_get("created_at").map_err(corrupt)?,
    })
}

fn owned_item_from_row(row: &PgRow) -> Result<OwnedItem, StoreError> {
    let active: bool = row.try_get("active").map_err(corrupt)?;
    let catalog_item_id: String = row.try_get("catalog_item_id").map_err(corrupt)?;
    Ok(OwnedItem {
        id: OwnedItemId::from_uuid(row.try_get("id").map_err(corrupt)?),
        account_id: AccountId::from_uuid(row.try_get("account_id").map_err(corrupt)?),
        catalog_item_id: CatalogItemId::new(catalog_item_id),
        name: row.try_get("name").map_err(corrupt)?,
        rarity: row.try_get("rarity").map_err(corrupt)?,
        price: row.try_get("price").map_err(corrupt)?,
        status: if active {
            OwnershipStatus::Active
        } else {
            OwnershipStatus::Refunded
        },
        purchased_at: row.try_get("purchased_at").map_err(corrupt)?,
        refunded_at: row.try_get("refunded_at").map_err(corrupt)?,
    })
}

fn ledger_entry_from_row(row: &PgRow) -> Result<LedgerEntry, StoreError> {
    let kind: String = row.try_get("kind").map_err(corrupt)?;
    let reference: Option<String> = row.try_get("reference").map_err(corrupt)?;
    let sequence: i64 = row.try_get("sequence").map_err(corrupt)?;
    Ok(LedgerEntry {
        id: LedgerEntryId::from_uuid(row.try_get("id").map_err(corrupt)?),
        account_id: AccountId::from_uuid(row.try_get("account_id").map_err(corrupt)?),
        kind: kind
            .parse::<LedgerEntryKind>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        amount: row.try_get("amount").map_err(corrupt)?,
        balance_after: row.try_get("balance_after").map_err(corrupt)?,
        reference: reference.map(CatalogItemId::new),
        sequence: from_db_int("sequence", sequence)?,
        occurred_at: row.try_get("occurred_at").map_err(corrupt)?,
    })
}

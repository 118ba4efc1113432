//! Wallet persistence boundary.
//!
//! Every operation runs inside a `WalletTx` unit of work obtained from a `WalletStore`.
//! Two backends ship: an in-memory store for tests and local runs, and Postgres.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryWalletStore;
pub use postgres::PostgresWalletStore;
pub use r#trait::{Dependents, StoreError, WalletStore, WalletTx};

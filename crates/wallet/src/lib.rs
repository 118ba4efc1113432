//! Wallet domain: accounts, ownership records and the ledger.
//!
//! Pure domain logic only: no IO, no persistence concerns. Decisions are made by the
//! `Wallet` aggregate; the infra layer persists their outcome atomically.

pub mod account;
pub mod catalog;
pub mod error;
pub mod ledger;
pub mod owned_item;
pub mod wallet;

pub use account::{Account, AccountView};
pub use catalog::{CatalogItem, CatalogItemId};
pub use error::{Disposition, WalletError};
pub use ledger::{LedgerEntry, LedgerEntryKind, newest_first, verify_chain};
pub use owned_item::{OwnedItem, OwnershipStatus};
pub use wallet::{
    GrantInitialCredit, InitialCreditGranted, ItemPurchased, ItemRefunded, PurchaseItem,
    RefundItem, RefundOverridePolicy, Wallet, WalletCommand, WalletEvent,
};

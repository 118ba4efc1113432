//! Wallet error taxonomy.

use thiserror::Error;

use coffer_core::{AccountId, DomainError};

use crate::catalog::CatalogItemId;

/// How a failure should be presented to an end user by whatever layer sits in front of
/// the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// The referenced account or ownership record does not exist.
    NotFound,
    /// The request was understood and refused; the error message is the reason.
    Rejected,
    /// Transient failure; nothing was changed and the same request may succeed later.
    RetryLater,
}

/// Error raised by wallet operations.
///
/// Every variant except `ConcurrencyConflict` and `StorageFailure` is detected before
/// anything is written.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error("account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("owned item not found: {0}")]
    OwnedItemNotFound(String),

    #[error("invalid price: {0}")]
    InvalidPrice(String),

    #[error("account {account_id} already owns an active '{catalog_item_id}'")]
    DuplicateOwnership {
        account_id: AccountId,
        catalog_item_id: CatalogItemId,
    },

    #[error("insufficient funds: balance {balance}, price {price}")]
    InsufficientFunds { balance: i64, price: i64 },

    #[error("invalid refund amount: {0}")]
    InvalidRefundAmount(String),

    #[error("invalid initial credit amount: {0}")]
    InvalidCreditAmount(i64),

    #[error("initial credit already granted to account {0}")]
    InitialCreditAlreadyGranted(AccountId),

    #[error(
        "account {account_id} still has {ledger_entries} ledger entries and {owned_items} owned items"
    )]
    AccountHasDependents {
        account_id: AccountId,
        ledger_entries: u64,
        owned_items: u64,
    },

    #[error("concurrent modification, gave up after {attempts} attempts")]
    ConcurrencyConflict { attempts: u32 },

    #[error("storage failure: {0}")]
    StorageFailure(String),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl WalletError {
    pub fn disposition(&self) -> Disposition {
        match self {
            WalletError::AccountNotFound(_) | WalletError::OwnedItemNotFound(_) => {
                Disposition::NotFound
            }
            WalletError::ConcurrencyConflict { .. } | WalletError::StorageFailure(_) => {
                Disposition::RetryLater
            }
            WalletError::Domain(DomainError::Conflict(_)) => Disposition::RetryLater,
            WalletError::InvalidPrice(_)
            | WalletError::DuplicateOwnership { .. }
            | WalletError::InsufficientFunds { .. }
            | WalletError::InvalidRefundAmount(_)
            | WalletError::InvalidCreditAmount(_)
            | WalletError::InitialCreditAlreadyGranted(_)
            | WalletError::AccountHasDependents { .. }
            | WalletError::Domain(_) => Disposition::Rejected,
        }
    }
}

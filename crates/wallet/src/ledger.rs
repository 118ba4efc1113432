use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use coffer_core::{AccountId, DomainError, Entity, LedgerEntryId};

use crate::account::Account;
use crate::catalog::CatalogItemId;
use crate::wallet::WalletEvent;

/// Kind of balance movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerEntryKind {
    Purchase,
    Refund,
    InitialCredit,
}

impl LedgerEntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEntryKind::Purchase => "PURCHASE",
            LedgerEntryKind::Refund => "REFUND",
            LedgerEntryKind::InitialCredit => "INITIAL_CREDIT",
        }
    }
}

impl core::str::FromStr for LedgerEntryKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PURCHASE" => Ok(LedgerEntryKind::Purchase),
            "REFUND" => Ok(LedgerEntryKind::Refund),
            "INITIAL_CREDIT" => Ok(LedgerEntryKind::InitialCredit),
            other => Err(DomainError::validation(format!("unknown ledger entry kind '{other}'"))),
        }
    }
}

/// One immutable balance movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub account_id: AccountId,
    pub kind: LedgerEntryKind,
    /// Signed: negative for debits, positive for credits.
    pub amount: i64,
    pub balance_after: i64,
    /// Catalog item the movement relates to; `None` for the initial credit.
    pub reference: Option<CatalogItemId>,
    /// Account version written together with this entry. Unique per account and
    /// increasing in commit order.
    pub sequence: u64,
    pub occurred_at: DateTime<Utc>,
}

impl Entity for LedgerEntry {
    type Id = LedgerEntryId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl LedgerEntry {
    /// Build the entry for `event`. `account` must be the state right after the event was
    /// applied, so `balance_after` and `sequence` describe the committed mutation.
    pub fn record(event: &WalletEvent, account: &Account) -> Self {
        let (id, kind, amount, reference) = match event {
            WalletEvent::InitialCreditGranted(e) => {
                (e.entry_id, LedgerEntryKind::InitialCredit, e.amount, None)
            }
            WalletEvent::ItemPurchased(e) => (
                e.entry_id,
                LedgerEntryKind::Purchase,
                -e.price,
                Some(e.catalog_item_id.clone()),
            ),
            WalletEvent::ItemRefunded(e) => (
                e.entry_id,
                LedgerEntryKind::Refund,
                e.amount,
                Some(e.catalog_item_id.clone()),
            ),
        };

        Self {
            id,
            account_id: account.id,
            kind,
            amount,
            balance_after: account.balance,
            reference,
            sequence: account.version,
            occurred_at: event.occurred_at(),
        }
    }
}

/// Sort entries newest first (commit order, descending).
pub fn newest_first(entries: &mut [LedgerEntry]) {
    entries.sort_by(|a, b| b.sequence.cmp(&a.sequence).then(b.id.cmp(&a.id)));
}

/// Replay an account's entries and check that they form one unbroken chain.
///
/// Entries may be passed in any order. Every `balance_after` must equal the running sum
/// of amounts, sequences must be distinct, and no intermediate balance may be negative.
/// Returns the balance the chain ends at.
pub fn verify_chain(entries: &[LedgerEntry]) -> Result<i64, DomainError> {
    let mut ordered: Vec<&LedgerEntry> = entries.iter().collect();
    ordered.sort_by_key(|e| e.sequence);

    let mut balance: i64 = 0;
    let mut last_sequence: Option<u64> = None;
    for entry in ordered {
        if last_sequence == Some(entry.sequence) {
            return Err(DomainError::validation(format!(
                "duplicate ledger sequence {}",
                entry.sequence
            )));
        }
        last_sequence = Some(entry.sequence);

        balance = balance
            .checked_add(entry.amount)
            .ok_or_else(|| DomainError::validation("ledger sum overflows"))?;
        if entry.balance_after != balance {
            return Err(DomainError::validation(format!(
                "entry {} records balance {} but the chain sums to {balance}",
                entry.id, entry.balance_after
            )));
        }
        if balance < 0 {
            return Err(DomainError::validation(format!(
                "entry {} drives the balance negative",
                entry.id
            )));
        }
    }

    Ok(balance)
}

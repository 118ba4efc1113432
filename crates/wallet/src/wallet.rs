use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use coffer_core::{Aggregate, AggregateRoot, AccountId, DomainError, LedgerEntryId, OwnedItemId};

use crate::account::Account;
use crate::catalog::{CatalogItem, CatalogItemId};
use crate::error::WalletError;
use crate::owned_item::{OwnedItem, OwnershipStatus};

/// What to do with a caller-supplied refund amount that exceeds the price paid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundOverridePolicy {
    /// Overrides above the recorded purchase price are rejected.
    #[default]
    CapAtPurchasePrice,
    /// Any non-negative override is credited as-is.
    Permissive,
}

/// Command: GrantInitialCredit (opens the account).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantInitialCredit {
    pub account_id: AccountId,
    pub entry_id: LedgerEntryId,
    pub amount: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: PurchaseItem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseItem {
    pub account_id: AccountId,
    pub owned_item_id: OwnedItemId,
    pub entry_id: LedgerEntryId,
    pub item: CatalogItem,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RefundItem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundItem {
    pub account_id: AccountId,
    pub owned_item_id: OwnedItemId,
    pub entry_id: LedgerEntryId,
    pub amount_override: Option<i64>,
    pub policy: RefundOverridePolicy,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletCommand {
    GrantInitialCredit(GrantInitialCredit),
    Purchase(PurchaseItem),
    Refund(RefundItem),
}

/// Event: InitialCreditGranted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialCreditGranted {
    pub account_id: AccountId,
    pub entry_id: LedgerEntryId,
    pub amount: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ItemPurchased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemPurchased {
    pub account_id: AccountId,
    pub owned_item_id: OwnedItemId,
    pub entry_id: LedgerEntryId,
    pub catalog_item_id: CatalogItemId,
    pub name: String,
    pub rarity: Option<String>,
    pub price: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ItemRefunded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRefunded {
    pub account_id: AccountId,
    pub owned_item_id: OwnedItemId,
    pub entry_id: LedgerEntryId,
    pub catalog_item_id: CatalogItemId,
    pub amount: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletEvent {
    InitialCreditGranted(InitialCreditGranted),
    ItemPurchased(ItemPurchased),
    ItemRefunded(ItemRefunded),
}

impl WalletEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            WalletEvent::InitialCreditGranted(_) => "wallet.initial_credit_granted",
            WalletEvent::ItemPurchased(_) => "wallet.item_purchased",
            WalletEvent::ItemRefunded(_) => "wallet.item_refunded",
        }
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            WalletEvent::InitialCreditGranted(e) => e.occurred_at,
            WalletEvent::ItemPurchased(e) => e.occurred_at,
            WalletEvent::ItemRefunded(e) => e.occurred_at,
        }
    }
}

/// Aggregate root: Wallet.
///
/// Holds one account plus whichever ownership records the caller loaded for the decision
/// at hand. A purchase needs the active record for the catalog item (if any); a refund
/// needs the record being refunded. Records that were not loaded are assumed not to exist,
/// so loading the right slice is the caller's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wallet {
    account: Account,
    opened: bool,
    items: Vec<OwnedItem>,
}

impl Wallet {
    /// An account that does not exist yet; only `GrantInitialCredit` is accepted.
    pub fn unopened(id: AccountId) -> Self {
        Self {
            account: Account {
                id,
                balance: 0,
                version: 0,
                created_at: DateTime::<Utc>::default(),
            },
            opened: false,
            items: Vec::new(),
        }
    }

    /// Rehydrate from a persisted account.
    pub fn load(account: Account) -> Self {
        Self {
            account,
            opened: true,
            items: Vec::new(),
        }
    }

    pub fn with_items(mut self, items: impl IntoIterator<Item = OwnedItem>) -> Self {
        self.items.extend(items);
        self
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn is_opened(&self) -> bool {
        self.opened
    }

    pub fn item(&self, id: OwnedItemId) -> Option<&OwnedItem> {
        self.items.iter().find(|i| i.id == id)
    }

    fn active_item_for(&self, catalog_item_id: &CatalogItemId) -> Option<&OwnedItem> {
        self.items
            .iter()
            .find(|i| i.is_active() && &i.catalog_item_id == catalog_item_id)
    }
}

impl AggregateRoot for Wallet {
    type Id = AccountId;

    fn id(&self) -> &Self::Id {
        &self.account.id
    }

    fn version(&self) -> u64 {
        self.account.version
    }
}

impl Aggregate for Wallet {
    type Command = WalletCommand;
    type Event = WalletEvent;
    type Error = WalletError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            WalletEvent::InitialCreditGranted(e) => {
                self.opened = true;
                self.account.created_at = e.occurred_at;
                self.account.balance += e.amount;
            }
            WalletEvent::ItemPurchased(e) => {
                self.account.balance -= e.price;
                self.items.push(OwnedItem {
                    id: e.owned_item_id,
                    account_id: e.account_id,
                    catalog_item_id: e.catalog_item_id.clone(),
                    name: e.name.clone(),
                    rarity: e.rarity.clone(),
                    price: e.price,
                    status: OwnershipStatus::Active,
                    purchased_at: e.occurred_at,
                    refunded_at: None,
                });
            }
            WalletEvent::ItemRefunded(e) => {
                self.account.balance += e.amount;
                if let Some(item) = self.items.iter_mut().find(|i| i.id == e.owned_item_id) {
                    let refunded = item.mark_refunded(e.occurred_at);
                    debug_assert!(refunded.is_ok(), "refund event for an inactive item");
                }
            }
        }

        self.account.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            WalletCommand::GrantInitialCredit(cmd) => self.handle_grant(cmd),
            WalletCommand::Purchase(cmd) => self.handle_purchase(cmd),
            WalletCommand::Refund(cmd) => self.handle_refund(cmd),
        }
    }
}

impl Wallet {
    fn ensure_account(&self, account_id: AccountId) -> Result<(), WalletError> {
        if self.account.id != account_id {
            return Err(DomainError::validation("command targets a different account").into());
        }
        Ok(())
    }

    fn ensure_opened(&self) -> Result<(), WalletError> {
        if !self.opened {
            return Err(WalletError::AccountNotFound(self.account.id));
        }
        Ok(())
    }

    fn handle_grant(&self, cmd: &GrantInitialCredit) -> Result<Vec<WalletEvent>, WalletError> {
        self.ensure_account(cmd.account_id)?;

        if self.opened {
            return Err(WalletError::InitialCreditAlreadyGranted(cmd.account_id));
        }
        if cmd.amount < 0 {
            return Err(WalletError::InvalidCreditAmount(cmd.amount));
        }

        Ok(vec![WalletEvent::InitialCreditGranted(InitialCreditGranted {
            account_id: cmd.account_id,
            entry_id: cmd.entry_id,
            amount: cmd.amount,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_purchase(&self, cmd: &PurchaseItem) -> Result<Vec<WalletEvent>, WalletError> {
        self.ensure_account(cmd.account_id)?;
        self.ensure_opened()?;

        cmd.item.ensure_identified()?;
        let price = cmd.item.checked_price()?;

        if self.active_item_for(&cmd.item.id).is_some() {
            return Err(WalletError::DuplicateOwnership {
                account_id: cmd.account_id,
                catalog_item_id: cmd.item.id.clone(),
            });
        }

        if self.account.balance < price {
            return Err(WalletError::InsufficientFunds {
                balance: self.account.balance,
                price,
            });
        }

        Ok(vec![WalletEvent::ItemPurchased(ItemPurchased {
            account_id: cmd.account_id,
            owned_item_id: cmd.owned_item_id,
            entry_id: cmd.entry_id,
            catalog_item_id: cmd.item.id.clone(),
            name: cmd.item.name.clone(),
            rarity: cmd.item.rarity.clone(),
            price,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_refund(&self, cmd: &RefundItem) -> Result<Vec<WalletEvent>, WalletError> {
        self.ensure_account(cmd.account_id)?;
        self.ensure_opened()?;

        let item = self
            .item(cmd.owned_item_id)
            .filter(|i| i.is_active() && i.account_id == cmd.account_id)
            .ok_or_else(|| {
                WalletError::OwnedItemNotFound(format!(
                    "no active item {} for account {}",
                    cmd.owned_item_id, cmd.account_id
                ))
            })?;

        let amount = match cmd.amount_override {
            None => item.price,
            Some(a) if a < 0 => {
                return Err(WalletError::InvalidRefundAmount(format!(
                    "refund amount must not be negative (got {a})"
                )));
            }
            Some(a) if a > item.price && cmd.policy == RefundOverridePolicy::CapAtPurchasePrice => {
                return Err(WalletError::InvalidRefundAmount(format!(
                    "refund amount {a} exceeds the price paid ({})",
                    item.price
                )));
            }
            Some(a) => a,
        };

        if self.account.balance.checked_add(amount).is_none() {
            return Err(WalletError::InvalidRefundAmount(format!(
                "refund amount {amount} overflows the balance"
            )));
        }

        Ok(vec![WalletEvent::ItemRefunded(ItemRefunded {
            account_id: cmd.account_id,
            owned_item_id: item.id,
            entry_id: cmd.entry_id,
            catalog_item_id: item.catalog_item_id.clone(),
            amount,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opened_wallet(balance: i64) -> Wallet {
        let mut wallet = Wallet::unopened(AccountId::new());
        let id = *wallet.id();
        let events = wallet
            .handle(&WalletCommand::GrantInitialCredit(GrantInitialCredit {
                account_id: id,
                entry_id: LedgerEntryId::new(),
                amount: balance,
                occurred_at: Utc::now(),
            }))
            .unwrap();
        for e in &events {
            wallet.apply(e);
        }
        wallet
    }

    fn purchase(wallet: &Wallet, item: CatalogItem) -> WalletCommand {
        WalletCommand::Purchase(PurchaseItem {
            account_id: *wallet.id(),
            owned_item_id: OwnedItemId::new(),
            entry_id: LedgerEntryId::new(),
            item,
            occurred_at: Utc::now(),
        })
    }

    fn refund(wallet: &Wallet, owned_item_id: OwnedItemId, amount_override: Option<i64>) -> WalletCommand {
        WalletCommand::Refund(RefundItem {
            account_id: *wallet.id(),
            owned_item_id,
            entry_id: LedgerEntryId::new(),
            amount_override,
            policy: RefundOverridePolicy::CapAtPurchasePrice,
            occurred_at: Utc::now(),
        })
    }

    fn run(wallet: &mut Wallet, cmd: &WalletCommand) -> Result<Vec<WalletEvent>, WalletError> {
        let events = wallet.handle(cmd)?;
        for e in &events {
            wallet.apply(e);
        }
        Ok(events)
    }

    fn buy(wallet: &mut Wallet, item: CatalogItem) -> Result<Vec<WalletEvent>, WalletError> {
        let cmd = purchase(wallet, item);
        run(wallet, &cmd)
    }

    fn give_back(
        wallet: &mut Wallet,
        owned_item_id: OwnedItemId,
        amount_override: Option<i64>,
    ) -> Result<Vec<WalletEvent>, WalletError> {
        let cmd = refund(wallet, owned_item_id, amount_override);
        run(wallet, &cmd)
    }

    fn purchased_id(events: &[WalletEvent]) -> OwnedItemId {
        match &events[0] {
            WalletEvent::ItemPurchased(e) => e.owned_item_id,
            other => panic!("expected ItemPurchased, got {other:?}"),
        }
    }

    #[test]
    fn grant_opens_the_account_once() {
        let mut wallet = opened_wallet(10_000);
        assert!(wallet.is_opened());
        assert_eq!(wallet.account().balance, 10_000);
        assert_eq!(wallet.version(), 1);

        let again = WalletCommand::GrantInitialCredit(GrantInitialCredit {
            account_id: *wallet.id(),
            entry_id: LedgerEntryId::new(),
            amount: 50,
            occurred_at: Utc::now(),
        });
        let err = run(&mut wallet, &again).unwrap_err();
        assert!(matches!(err, WalletError::InitialCreditAlreadyGranted(_)));
        assert_eq!(wallet.account().balance, 10_000);
    }

    #[test]
    fn negative_initial_credit_is_rejected() {
        let wallet = Wallet::unopened(AccountId::new());
        let cmd = WalletCommand::GrantInitialCredit(GrantInitialCredit {
            account_id: *wallet.id(),
            entry_id: LedgerEntryId::new(),
            amount: -1,
            occurred_at: Utc::now(),
        });
        assert_eq!(wallet.handle(&cmd), Err(WalletError::InvalidCreditAmount(-1)));
    }

    #[test]
    fn purchase_on_unopened_account_is_not_found() {
        let wallet = Wallet::unopened(AccountId::new());
        let cmd = purchase(&wallet, CatalogItem::new("cid_001", "Raider", 500));
        assert!(matches!(wallet.handle(&cmd), Err(WalletError::AccountNotFound(_))));
    }

    #[test]
    fn purchase_debits_and_records_ownership() {
        let mut wallet = opened_wallet(10_000);
        let events = buy(&mut wallet, CatalogItem::new("cid_001", "Raider", 500)).unwrap();

        assert_eq!(wallet.account().balance, 9_500);
        assert_eq!(wallet.version(), 2);
        let item = wallet.item(purchased_id(&events)).unwrap();
        assert!(item.is_active());
        assert_eq!(item.price, 500);
    }

    #[test]
    fn unaffordable_purchase_emits_nothing() {
        let wallet = opened_wallet(100);
        let err = wallet
            .handle(&purchase(&wallet, CatalogItem::new("cid_001", "Raider", 500)))
            .unwrap_err();
        assert_eq!(
            err,
            WalletError::InsufficientFunds {
                balance: 100,
                price: 500
            }
        );
    }

    #[test]
    fn exact_balance_is_affordable() {
        let mut wallet = opened_wallet(500);
        buy(&mut wallet, CatalogItem::new("cid_001", "Raider", 500)).unwrap();
        assert_eq!(wallet.account().balance, 0);
    }

    #[test]
    fn second_active_copy_is_a_duplicate() {
        let mut wallet = opened_wallet(10_000);
        buy(&mut wallet, CatalogItem::new("cid_001", "Raider", 500)).unwrap();

        let err = buy(&mut wallet, CatalogItem::new("cid_001", "Raider", 500))
            .unwrap_err();
        assert!(matches!(err, WalletError::DuplicateOwnership { .. }));
        assert_eq!(wallet.account().balance, 9_500);
    }

    #[test]
    fn invalid_price_is_checked_before_funds() {
        let wallet = opened_wallet(0);
        let mut item = CatalogItem::new("cid_001", "Raider", 0);
        assert!(matches!(
            wallet.handle(&purchase(&wallet, item.clone())),
            Err(WalletError::InvalidPrice(_))
        ));
        item.price = None;
        assert!(matches!(
            wallet.handle(&purchase(&wallet, item)),
            Err(WalletError::InvalidPrice(_))
        ));
    }

    #[test]
    fn blank_catalog_id_is_rejected() {
        let wallet = opened_wallet(1_000);
        let err = wallet
            .handle(&purchase(&wallet, CatalogItem::new("  ", "Nameless", 10)))
            .unwrap_err();
        assert!(matches!(err, WalletError::Domain(DomainError::Validation(_))));
    }

    #[test]
    fn refund_credits_recorded_price_and_deactivates() {
        let mut wallet = opened_wallet(10_000);
        let events = buy(&mut wallet, CatalogItem::new("cid_001", "Raider", 500)).unwrap();
        let owned = purchased_id(&events);

        give_back(&mut wallet, owned, None).unwrap();
        assert_eq!(wallet.account().balance, 10_000);
        let item = wallet.item(owned).unwrap();
        assert_eq!(item.status, OwnershipStatus::Refunded);
        assert!(item.refunded_at.is_some());

        let err = give_back(&mut wallet, owned, None).unwrap_err();
        assert!(matches!(err, WalletError::OwnedItemNotFound(_)));
        assert_eq!(wallet.account().balance, 10_000);
    }

    #[test]
    fn refund_override_is_credited_instead_of_price() {
        let mut wallet = opened_wallet(10_000);
        let events = buy(&mut wallet, CatalogItem::new("cid_001", "Raider", 500)).unwrap();

        let refunded = give_back(&mut wallet, purchased_id(&events), Some(200)).unwrap();
        match &refunded[0] {
            WalletEvent::ItemRefunded(e) => assert_eq!(e.amount, 200),
            other => panic!("expected ItemRefunded, got {other:?}"),
        }
        assert_eq!(wallet.account().balance, 9_700);
    }

    #[test]
    fn refund_override_policy_decides_on_overpayment() {
        let mut wallet = opened_wallet(10_000);
        let events = buy(&mut wallet, CatalogItem::new("cid_001", "Raider", 500)).unwrap();
        let owned = purchased_id(&events);

        let capped = refund(&wallet, owned, Some(900));
        assert!(matches!(wallet.handle(&capped), Err(WalletError::InvalidRefundAmount(_))));

        let negative = refund(&wallet, owned, Some(-1));
        assert!(matches!(wallet.handle(&negative), Err(WalletError::InvalidRefundAmount(_))));

        let WalletCommand::Refund(mut permissive) = refund(&wallet, owned, Some(900)) else {
            unreachable!()
        };
        permissive.policy = RefundOverridePolicy::Permissive;
        run(&mut wallet, &WalletCommand::Refund(permissive)).unwrap();
        assert_eq!(wallet.account().balance, 10_400);
    }

    #[test]
    fn refund_of_unknown_item_is_not_found() {
        let wallet = opened_wallet(10_000);
        let err = wallet
            .handle(&refund(&wallet, OwnedItemId::new(), None))
            .unwrap_err();
        assert!(matches!(err, WalletError::OwnedItemNotFound(_)));
    }

    #[test]
    fn rebuy_after_refund_creates_a_new_record() {
        let mut wallet = opened_wallet(10_000);
        let first = purchased_id(
            &buy(&mut wallet, CatalogItem::new("cid_001", "Raider", 500)).unwrap(),
        );
        give_back(&mut wallet, first, None).unwrap();

        let second = purchased_id(
            &buy(&mut wallet, CatalogItem::new("cid_001", "Raider", 500)).unwrap(),
        );
        assert_ne!(first, second);
        assert!(wallet.item(second).unwrap().is_active());
        assert!(!wallet.item(first).unwrap().is_active());
    }
}

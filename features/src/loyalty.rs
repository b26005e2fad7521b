//! Loyalty points.
//!
//! Accounts earn and redeem points. Every movement is written to a per-account ledger that
//! keeps the most recent entries only. The reputation level follows lifetime earnings, so
//! redeeming never demotes an account.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use starport_core::environment::Environment;
use starport_core::error::LifecycleError;
use starport_core::history::BoundedLog;
use starport_core::lifecycle::{Applied, Feature, Operation};
use starport_core::registry::{Entity, Registry};
use starport_core::telemetry::TelemetryEvent;
use starport_core::view::latest_by;
use starport_runtime::Dispatcher;

/// Reputation level, derived from lifetime earnings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    /// 0+
    Novice,
    /// 500+
    Explorer,
    /// 2 000+
    Astronomer,
    /// 5 000+
    Cosmologist,
    /// 10 000+
    Master,
}

impl Level {
    const LADDER: [(u64, Self); 5] = [
        (10_000, Self::Master),
        (5_000, Self::Cosmologist),
        (2_000, Self::Astronomer),
        (500, Self::Explorer),
        (0, Self::Novice),
    ];

    /// Level reached with `lifetime_points`
    #[must_use]
    pub fn for_points(lifetime_points: u64) -> Self {
        Self::LADDER
            .iter()
            .find(|(min, _)| lifetime_points >= *min)
            .map_or(Self::Novice, |(_, level)| *level)
    }

    /// Points needed for the next level, `None` at the top
    #[must_use]
    pub fn next_threshold(self) -> Option<u64> {
        Self::LADDER
            .iter()
            .rev()
            .find(|(_, level)| *level > self)
            .map(|(min, _)| *min)
    }

    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Novice => "novice",
            Self::Explorer => "explorer",
            Self::Astronomer => "astronomer",
            Self::Cosmologist => "cosmologist",
            Self::Master => "master",
        }
    }
}

/// A points account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account ID
    pub id: String,
    /// Owner
    pub user_id: String,
    /// Spendable points
    pub balance: u64,
    /// Points ever earned
    pub lifetime_earned: u64,
    /// Points ever redeemed
    pub lifetime_redeemed: u64,
    /// Reputation level
    pub level: Level,
    /// Opening time
    pub created_at: DateTime<Utc>,
}

impl Entity for Account {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Direction of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Points added
    Earn,
    /// Points spent
    Redeem,
}

/// One balance movement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Account ID
    pub account_id: String,
    /// Direction
    pub kind: EntryKind,
    /// Points moved
    pub amount: u64,
    /// Why
    pub reason: String,
    /// Balance after the movement
    pub balance_after: u64,
    /// When
    pub at: DateTime<Utc>,
}

/// Loyalty feature state
#[derive(Debug, Clone)]
pub struct LoyaltyState {
    accounts: Registry<Account>,
    ledgers: Registry<BoundedLog<LedgerEntry>>,
    ledger_limit: usize,
}

impl LoyaltyState {
    /// Empty state keeping the last `ledger_limit` entries per account
    #[must_use]
    pub fn new(ledger_limit: usize) -> Self {
        Self {
            accounts: Registry::new("Account"),
            ledgers: Registry::new("Account"),
            ledger_limit,
        }
    }

    fn record(&mut self, entry: LedgerEntry) -> Result<(), LifecycleError> {
        self.ledgers.update(&entry.account_id.clone(), |ledger| {
            ledger.push(entry);
        })
    }
}

impl Feature for LoyaltyState {
    const NAME: &'static str = "loyalty";
}

fn require_positive(amount: u64) -> Result<(), LifecycleError> {
    if amount == 0 {
        Err(LifecycleError::validation("amount must be at least 1 point"))
    } else {
        Ok(())
    }
}

/// Open an account for a user
#[derive(Debug, Clone)]
pub struct OpenAccount {
    /// Owner
    pub user_id: String,
}

impl Operation<LoyaltyState> for OpenAccount {
    type Output = Account;
    const NAME: &'static str = "open_account";

    fn apply(self, state: &mut LoyaltyState, env: &Environment) -> Result<Applied<Account>, LifecycleError> {
        let account = state
            .accounts
            .insert(Account {
                id: env.next_id("acct"),
                user_id: self.user_id,
                balance: 0,
                lifetime_earned: 0,
                lifetime_redeemed: 0,
                level: Level::Novice,
                created_at: env.now(),
            })
            .clone();
        state
            .ledgers
            .put(account.id.clone(), BoundedLog::new(state.ledger_limit));
        let event = TelemetryEvent::new("account_opened")
            .with("account_id", account.id.as_str())
            .with("user_id", account.user_id.as_str());
        Ok(Applied::new(account).with_event(event))
    }
}

/// Add points
#[derive(Debug, Clone)]
pub struct Earn {
    /// Account ID
    pub account_id: String,
    /// Points to add
    pub amount: u64,
    /// Why
    pub reason: String,
}

impl Operation<LoyaltyState> for Earn {
    type Output = Account;
    const NAME: &'static str = "earn";

    #[allow(clippy::cast_precision_loss)]
    fn apply(self, state: &mut LoyaltyState, env: &Environment) -> Result<Applied<Account>, LifecycleError> {
        require_positive(self.amount)?;
        let account = state.accounts.require_mut(&self.account_id)?;
        let overflow = || LifecycleError::validation(format!("account {} would overflow", self.account_id));
        let balance = account.balance.checked_add(self.amount).ok_or_else(overflow)?;
        let lifetime = account.lifetime_earned.checked_add(self.amount).ok_or_else(overflow)?;

        let previous_level = account.level;
        account.balance = balance;
        account.lifetime_earned = lifetime;
        account.level = Level::for_points(lifetime);
        let account = account.clone();

        state.record(LedgerEntry {
            account_id: account.id.clone(),
            kind: EntryKind::Earn,
            amount: self.amount,
            reason: self.reason.clone(),
            balance_after: account.balance,
            at: env.now(),
        })?;

        let level_up = account.level != previous_level;
        let earned = TelemetryEvent::new("earned")
            .with_value(self.amount as f64)
            .with("account_id", account.id.as_str())
            .with("reason", self.reason);
        let promoted = TelemetryEvent::new("level_up")
            .with("account_id", account.id.as_str())
            .with("from", previous_level.as_str())
            .with("to", account.level.as_str());
        Ok(Applied::new(account)
            .with_event(earned)
            .with_event_if(level_up, || promoted))
    }
}

/// Spend points
#[derive(Debug, Clone)]
pub struct Redeem {
    /// Account ID
    pub account_id: String,
    /// Points to spend
    pub amount: u64,
    /// Why
    pub reason: String,
}

impl Operation<LoyaltyState> for Redeem {
    type Output = Account;
    const NAME: &'static str = "redeem";

    #[allow(clippy::cast_precision_loss)]
    fn apply(self, state: &mut LoyaltyState, env: &Environment) -> Result<Applied<Account>, LifecycleError> {
        require_positive(self.amount)?;
        let account = state.accounts.require_mut(&self.account_id)?;
        if account.balance < self.amount {
            return Err(LifecycleError::Insufficient {
                what: "points",
                required: self.amount,
                available: account.balance,
            });
        }
        account.balance -= self.amount;
        account.lifetime_redeemed = account.lifetime_redeemed.saturating_add(self.amount);
        let account = account.clone();

        state.record(LedgerEntry {
            account_id: account.id.clone(),
            kind: EntryKind::Redeem,
            amount: self.amount,
            reason: self.reason.clone(),
            balance_after: account.balance,
            at: env.now(),
        })?;

        let event = TelemetryEvent::new("redeemed")
            .with_value(self.amount as f64)
            .with("account_id", account.id.as_str())
            .with("reason", self.reason);
        Ok(Applied::new(account).with_event(event))
    }
}

/// Loyalty service
#[derive(Debug, Clone)]
pub struct LoyaltyService {
    dispatcher: Dispatcher<LoyaltyState>,
}

impl LoyaltyService {
    /// Empty service keeping the last `ledger_limit` entries per account
    #[must_use]
    pub fn new(env: Environment, ledger_limit: usize) -> Self {
        Self {
            dispatcher: Dispatcher::new(LoyaltyState::new(ledger_limit), env),
        }
    }

    /// Open an account with a generated ID.
    ///
    /// # Errors
    ///
    /// Does not fail today; the signature matches the other lifecycle operations.
    pub async fn open_account(&self, user_id: impl Into<String>) -> Result<Account, LifecycleError> {
        self.dispatcher.send(OpenAccount { user_id: user_id.into() }).await
    }

    /// Add points.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown account and a validation error for a zero
    /// amount or an overflowing balance.
    pub async fn earn(
        &self,
        account_id: impl Into<String>,
        amount: u64,
        reason: impl Into<String>,
    ) -> Result<Account, LifecycleError> {
        self.dispatcher
            .send(Earn {
                account_id: account_id.into(),
                amount,
                reason: reason.into(),
            })
            .await
    }

    /// Spend points.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown account, `Insufficient` when the balance is too
    /// low, and a validation error for a zero amount.
    pub async fn redeem(
        &self,
        account_id: impl Into<String>,
        amount: u64,
        reason: impl Into<String>,
    ) -> Result<Account, LifecycleError> {
        self.dispatcher
            .send(Redeem {
                account_id: account_id.into(),
                amount,
                reason: reason.into(),
            })
            .await
    }

    /// Spendable points.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown account.
    pub async fn balance(&self, account_id: &str) -> Result<u64, LifecycleError> {
        self.dispatcher
            .state(|s| s.accounts.require(account_id).map(|a| a.balance))
            .await
    }

    /// Look up an account
    pub async fn get_account(&self, account_id: &str) -> Option<Account> {
        self.dispatcher.state(|s| s.accounts.get_cloned(account_id)).await
    }

    /// Up to `n` ledger entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown account.
    pub async fn history(&self, account_id: &str, n: usize) -> Result<Vec<LedgerEntry>, LifecycleError> {
        self.dispatcher
            .state(|s| s.ledgers.require(account_id).map(|ledger| ledger.recent(n)))
            .await
    }

    /// The `n` accounts with the highest lifetime earnings
    pub async fn leaderboard(&self, n: usize) -> Vec<Account> {
        self.dispatcher
            .state(|s| latest_by(s.accounts.iter(), n, |a| a.lifetime_earned))
            .await
    }
}

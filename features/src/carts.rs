//! Cart abandonment and recovery.
//!
//! ```text
//! active ──▶ abandoned ──▶ recovered ──▶ checked_out
//!   │            │             │
//!   └────────────┴─────────────┴──▶ expired
//! ```
//!
//! `checked_out` and `expired` are terminal. Reminders can only be sent to abandoned carts
//! and are capped per cart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use starport_core::environment::Environment;
use starport_core::error::LifecycleError;
use starport_core::lifecycle::{Applied, Feature, Operation};
use starport_core::registry::{Entity, Registry};
use starport_core::status::{transition, Status};
use starport_core::telemetry::TelemetryEvent;
use starport_core::view::ratio;
use starport_runtime::Dispatcher;
use std::fmt;

/// Cart lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CartStatus {
    /// Being filled
    Active,
    /// Left without checkout
    Abandoned,
    /// Brought back after abandonment
    Recovered,
    /// Purchased
    CheckedOut,
    /// Given up on
    Expired,
}

impl Status for CartStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Abandoned => "abandoned",
            Self::Recovered => "recovered",
            Self::CheckedOut => "checked_out",
            Self::Expired => "expired",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::CheckedOut | Self::Expired)
    }

    fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Abandoned | Self::CheckedOut | Self::Expired)
                | (Self::Abandoned, Self::Recovered | Self::Expired)
                | (Self::Recovered, Self::Abandoned | Self::CheckedOut | Self::Expired)
        )
    }
}

impl fmt::Display for CartStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A line in a cart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    /// Product SKU
    pub sku: String,
    /// Display name
    pub name: String,
    /// Units
    pub quantity: u32,
    /// Price per unit, in cents
    pub unit_price_cents: u64,
}

impl CartItem {
    /// Item with a name equal to its SKU
    #[must_use]
    pub fn new(sku: impl Into<String>, quantity: u32, unit_price_cents: u64) -> Self {
        let sku = sku.into();
        Self {
            name: sku.clone(),
            sku,
            quantity,
            unit_price_cents,
        }
    }

    /// `quantity * unit_price_cents`
    #[must_use]
    pub fn line_total(&self) -> u64 {
        u64::from(self.quantity).saturating_mul(self.unit_price_cents)
    }
}

/// A shopping cart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    /// Cart ID
    pub id: String,
    /// Owner
    pub user_id: String,
    /// Lines, one per SKU
    pub items: Vec<CartItem>,
    /// Lifecycle status
    pub status: CartStatus,
    /// Reminders sent since the last abandonment
    pub reminders_sent: u32,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
    /// Most recent abandonment
    pub abandoned_at: Option<DateTime<Utc>>,
    /// Most recent recovery
    pub recovered_at: Option<DateTime<Utc>>,
}

impl Cart {
    /// Sum of line totals, in cents
    #[must_use]
    pub fn total_cents(&self) -> u64 {
        self.items.iter().map(CartItem::line_total).fold(0, u64::saturating_add)
    }

    fn move_to(&mut self, next: CartStatus, now: DateTime<Utc>) -> Result<(), LifecycleError> {
        self.status = transition("Cart", &self.id, self.status, next)?;
        self.updated_at = now;
        Ok(())
    }

    fn require_editable(&self) -> Result<(), LifecycleError> {
        if matches!(self.status, CartStatus::Active | CartStatus::Recovered) {
            Ok(())
        } else {
            Err(LifecycleError::validation(format!(
                "cart {} is {} and cannot be edited",
                self.id, self.status
            )))
        }
    }
}

impl Entity for Cart {
    fn id(&self) -> &str {
        &self.id
    }
}

/// A reminder sent for an abandoned cart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reminder {
    /// Cart ID
    pub cart_id: String,
    /// Cart owner
    pub user_id: String,
    /// 1 for the first reminder, 2 for the second, ...
    pub sequence: u32,
    /// Cart value at the time, in cents
    pub cart_value_cents: u64,
    /// Send time
    pub sent_at: DateTime<Utc>,
}

/// Recovery funnel counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStats {
    /// Carts created
    pub total_carts: usize,
    /// Carts abandoned at least once
    pub abandoned: usize,
    /// Carts recovered at least once
    pub recovered: usize,
    /// Carts expired
    pub expired: usize,
    /// Carts checked out
    pub checked_out: usize,
    /// `recovered / abandoned`
    pub recovery_rate: f64,
    /// Value of recovered carts that went on to check out, in cents
    pub recovered_revenue_cents: u64,
    /// Reminders sent, all carts
    pub reminders_sent: u64,
}

/// Cart feature state
#[derive(Debug, Clone)]
pub struct CartState {
    carts: Registry<Cart>,
    max_reminders: u32,
    reminders_sent: u64,
}

impl CartState {
    /// Empty state allowing `max_reminders` reminders per abandonment
    #[must_use]
    pub fn new(max_reminders: u32) -> Self {
        Self {
            carts: Registry::new("Cart"),
            max_reminders,
            reminders_sent: 0,
        }
    }

    /// Funnel counters
    #[must_use]
    pub fn recovery_stats(&self) -> RecoveryStats {
        let abandoned = self.carts.iter().filter(|c| c.abandoned_at.is_some()).count();
        let recovered = self.carts.iter().filter(|c| c.recovered_at.is_some()).count();
        RecoveryStats {
            total_carts: self.carts.len(),
            abandoned,
            recovered,
            expired: self.count(CartStatus::Expired),
            checked_out: self.count(CartStatus::CheckedOut),
            recovery_rate: ratio(recovered, abandoned),
            recovered_revenue_cents: self
                .carts
                .iter()
                .filter(|c| c.status == CartStatus::CheckedOut && c.recovered_at.is_some())
                .map(Cart::total_cents)
                .fold(0, u64::saturating_add),
            reminders_sent: self.reminders_sent,
        }
    }

    fn count(&self, status: CartStatus) -> usize {
        self.carts.iter().filter(|c| c.status == status).count()
    }
}

impl Feature for CartState {
    const NAME: &'static str = "carts";
}

fn status_event(name: &str, cart: &Cart) -> TelemetryEvent {
    TelemetryEvent::new(name)
        .with("cart_id", cart.id.as_str())
        .with("user_id", cart.user_id.as_str())
        .with("value_cents", cart.total_cents())
}

/// Open a cart for a user
#[derive(Debug, Clone)]
pub struct CreateCart {
    /// Owner
    pub user_id: String,
}

impl Operation<CartState> for CreateCart {
    type Output = Cart;
    const NAME: &'static str = "create_cart";

    fn apply(self, state: &mut CartState, env: &Environment) -> Result<Applied<Cart>, LifecycleError> {
        let now = env.now();
        let cart = state
            .carts
            .insert(Cart {
                id: env.next_id("cart"),
                user_id: self.user_id,
                items: Vec::new(),
                status: CartStatus::Active,
                reminders_sent: 0,
                created_at: now,
                updated_at: now,
                abandoned_at: None,
                recovered_at: None,
            })
            .clone();
        let event = status_event("created", &cart);
        Ok(Applied::new(cart).with_event(event))
    }
}

/// Add units of a SKU; an existing line for the SKU grows
#[derive(Debug, Clone)]
pub struct AddItem {
    /// Cart ID
    pub cart_id: String,
    /// Item to add
    pub item: CartItem,
}

impl Operation<CartState> for AddItem {
    type Output = Cart;
    const NAME: &'static str = "add_item";

    fn apply(self, state: &mut CartState, env: &Environment) -> Result<Applied<Cart>, LifecycleError> {
        let cart = state.carts.require_mut(&self.cart_id)?;
        cart.require_editable()?;
        if self.item.quantity == 0 {
            return Err(LifecycleError::validation("item quantity must be at least 1"));
        }

        match cart.items.iter_mut().find(|line| line.sku == self.item.sku) {
            Some(line) => {
                line.quantity = line.quantity.saturating_add(self.item.quantity);
                line.unit_price_cents = self.item.unit_price_cents;
            }
            None => cart.items.push(self.item.clone()),
        }
        cart.updated_at = env.now();

        let cart = cart.clone();
        let event = TelemetryEvent::new("item_added")
            .with("cart_id", cart.id.as_str())
            .with("sku", self.item.sku.as_str())
            .with("quantity", self.item.quantity);
        Ok(Applied::new(cart).with_event(event))
    }
}

/// Mark a cart as abandoned
#[derive(Debug, Clone)]
pub struct MarkAbandoned {
    /// Cart ID
    pub cart_id: String,
}

impl Operation<CartState> for MarkAbandoned {
    type Output = Cart;
    const NAME: &'static str = "mark_abandoned";

    fn apply(self, state: &mut CartState, env: &Environment) -> Result<Applied<Cart>, LifecycleError> {
        let now = env.now();
        let cart = state.carts.require_mut(&self.cart_id)?;
        cart.move_to(CartStatus::Abandoned, now)?;
        cart.abandoned_at = Some(now);
        cart.reminders_sent = 0;
        let cart = cart.clone();
        let event = status_event("abandoned", &cart);
        Ok(Applied::new(cart).with_event(event))
    }
}

/// Send the next reminder for an abandoned cart
#[derive(Debug, Clone)]
pub struct SendReminder {
    /// Cart ID
    pub cart_id: String,
}

impl Operation<CartState> for SendReminder {
    type Output = Reminder;
    const NAME: &'static str = "send_reminder";

    fn apply(self, state: &mut CartState, env: &Environment) -> Result<Applied<Reminder>, LifecycleError> {
        let max_reminders = state.max_reminders;
        let cart = state.carts.require_mut(&self.cart_id)?;
        if cart.status != CartStatus::Abandoned {
            return Err(LifecycleError::validation(format!(
                "cart {} is {}, reminders go to abandoned carts only",
                cart.id, cart.status
            )));
        }
        if cart.reminders_sent >= max_reminders {
            return Err(LifecycleError::validation(format!(
                "cart {} already received {max_reminders} reminder(s)",
                cart.id
            )));
        }

        let now = env.now();
        cart.reminders_sent += 1;
        cart.updated_at = now;
        let reminder = Reminder {
            cart_id: cart.id.clone(),
            user_id: cart.user_id.clone(),
            sequence: cart.reminders_sent,
            cart_value_cents: cart.total_cents(),
            sent_at: now,
        };
        state.reminders_sent += 1;

        let event = TelemetryEvent::new("reminder_sent")
            .with("cart_id", reminder.cart_id.as_str())
            .with("sequence", reminder.sequence);
        Ok(Applied::new(reminder).with_event(event))
    }
}

/// Bring an abandoned cart back
#[derive(Debug, Clone)]
pub struct Recover {
    /// Cart ID
    pub cart_id: String,
}

impl Operation<CartState> for Recover {
    type Output = Cart;
    const NAME: &'static str = "recover";

    fn apply(self, state: &mut CartState, env: &Environment) -> Result<Applied<Cart>, LifecycleError> {
        let now = env.now();
        let cart = state.carts.require_mut(&self.cart_id)?;
        cart.move_to(CartStatus::Recovered, now)?;
        cart.recovered_at = Some(now);
        let cart = cart.clone();
        let event = status_event("recovered", &cart).with("reminders", cart.reminders_sent);
        Ok(Applied::new(cart).with_event(event))
    }
}

/// Check out a non-empty cart
#[derive(Debug, Clone)]
pub struct Checkout {
    /// Cart ID
    pub cart_id: String,
}

impl Operation<CartState> for Checkout {
    type Output = Cart;
    const NAME: &'static str = "checkout";

    fn apply(self, state: &mut CartState, env: &Environment) -> Result<Applied<Cart>, LifecycleError> {
        let cart = state.carts.require_mut(&self.cart_id)?;
        transition("Cart", &cart.id, cart.status, CartStatus::CheckedOut)?;
        if cart.items.is_empty() {
            return Err(LifecycleError::validation(format!("cart {} is empty", cart.id)));
        }
        cart.move_to(CartStatus::CheckedOut, env.now())?;
        let cart = cart.clone();
        let event = status_event("checked_out", &cart);
        Ok(Applied::new(cart).with_event(event))
    }
}

/// Expire a cart for good
#[derive(Debug, Clone)]
pub struct Expire {
    /// Cart ID
    pub cart_id: String,
}

impl Operation<CartState> for Expire {
    type Output = Cart;
    const NAME: &'static str = "expire";

    fn apply(self, state: &mut CartState, env: &Environment) -> Result<Applied<Cart>, LifecycleError> {
        let cart = state.carts.require_mut(&self.cart_id)?;
        cart.move_to(CartStatus::Expired, env.now())?;
        let cart = cart.clone();
        let event = status_event("expired", &cart);
        Ok(Applied::new(cart).with_event(event))
    }
}

/// Cart service
#[derive(Debug, Clone)]
pub struct CartService {
    dispatcher: Dispatcher<CartState>,
}

impl CartService {
    /// Empty service allowing `max_reminders` reminders per abandonment
    #[must_use]
    pub fn new(env: Environment, max_reminders: u32) -> Self {
        Self {
            dispatcher: Dispatcher::new(CartState::new(max_reminders), env),
        }
    }

    /// Open a cart with a generated ID.
    ///
    /// # Errors
    ///
    /// Does not fail today; the signature matches the other lifecycle operations.
    pub async fn create_cart(&self, user_id: impl Into<String>) -> Result<Cart, LifecycleError> {
        self.dispatcher.send(CreateCart { user_id: user_id.into() }).await
    }

    /// Add an item.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown cart, and a validation error for a zero quantity
    /// or a cart that is not active or recovered.
    pub async fn add_item(&self, cart_id: impl Into<String>, item: CartItem) -> Result<Cart, LifecycleError> {
        self.dispatcher
            .send(AddItem {
                cart_id: cart_id.into(),
                item,
            })
            .await
    }

    /// Mark a cart as abandoned.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `InvalidTransition`.
    pub async fn mark_abandoned(&self, cart_id: impl Into<String>) -> Result<Cart, LifecycleError> {
        self.dispatcher.send(MarkAbandoned { cart_id: cart_id.into() }).await
    }

    /// Send the next reminder.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, or a validation error when the cart is not abandoned or has
    /// used up its reminders.
    pub async fn send_reminder(&self, cart_id: impl Into<String>) -> Result<Reminder, LifecycleError> {
        self.dispatcher.send(SendReminder { cart_id: cart_id.into() }).await
    }

    /// Recover an abandoned cart.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `InvalidTransition`.
    pub async fn recover(&self, cart_id: impl Into<String>) -> Result<Cart, LifecycleError> {
        self.dispatcher.send(Recover { cart_id: cart_id.into() }).await
    }

    /// Check out a cart.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, a validation error for an empty cart, or `InvalidTransition`.
    pub async fn checkout(&self, cart_id: impl Into<String>) -> Result<Cart, LifecycleError> {
        self.dispatcher.send(Checkout { cart_id: cart_id.into() }).await
    }

    /// Expire a cart.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `InvalidTransition`.
    pub async fn expire(&self, cart_id: impl Into<String>) -> Result<Cart, LifecycleError> {
        self.dispatcher.send(Expire { cart_id: cart_id.into() }).await
    }

    /// Look up a cart
    pub async fn get_cart(&self, cart_id: &str) -> Option<Cart> {
        self.dispatcher.state(|s| s.carts.get_cloned(cart_id)).await
    }

    /// Carts currently abandoned
    pub async fn abandoned_carts(&self) -> Vec<Cart> {
        self.dispatcher
            .state(|s| s.carts.list(|c| c.status == CartStatus::Abandoned))
            .await
    }

    /// Funnel counters
    pub async fn recovery_stats(&self) -> RecoveryStats {
        self.dispatcher.state(CartState::recovery_stats).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use starport_testing::{assertions, recording_environment, test_environment, LifecycleTest};

    fn cart_in(state: &mut CartState, env: &Environment) -> String {
        CreateCart {
            user_id: "u1".to_string(),
        }
        .apply(state, env)
        .unwrap()
        .output
        .id
    }

    #[tokio::test]
    async fn test_recovery_flow() {
        let (env, sink) = recording_environment();
        let carts = CartService::new(env, 3);

        let cart = carts.create_cart("u1").await.unwrap();
        assert_eq!(cart.id, "cart_1");
        carts.add_item(&cart.id, CartItem::new("telescope", 1, 12_000)).await.unwrap();
        carts.add_item(&cart.id, CartItem::new("star-map", 2, 1_500)).await.unwrap();
        carts.mark_abandoned(&cart.id).await.unwrap();
        assert_eq!(carts.abandoned_carts().await.len(), 1);

        let reminder = carts.send_reminder(&cart.id).await.unwrap();
        assert_eq!(reminder.sequence, 1);
        assert_eq!(reminder.cart_value_cents, 15_000);

        carts.recover(&cart.id).await.unwrap();
        let done = carts.checkout(&cart.id).await.unwrap();
        assert_eq!(done.status, CartStatus::CheckedOut);
        assert!(carts.abandoned_carts().await.is_empty());

        let stats = carts.recovery_stats().await;
        assert_eq!(stats.total_carts, 1);
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.recovered, 1);
        assert!((stats.recovery_rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(stats.recovered_revenue_cents, 15_000);
        assert_eq!(stats.reminders_sent, 1);
        assert_eq!(sink.named("carts_recovered").len(), 1);
    }

    #[tokio::test]
    async fn test_reminders_are_capped() {
        let carts = CartService::new(test_environment(), 2);
        let cart = carts.create_cart("u1").await.unwrap();
        carts.mark_abandoned(&cart.id).await.unwrap();

        carts.send_reminder(&cart.id).await.unwrap();
        carts.send_reminder(&cart.id).await.unwrap();
        let err = carts.send_reminder(&cart.id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Validation(_)));
        assert_eq!(carts.get_cart(&cart.id).await.unwrap().reminders_sent, 2);
    }

    #[tokio::test]
    async fn test_reminder_for_active_cart_is_rejected() {
        let carts = CartService::new(test_environment(), 3);
        let cart = carts.create_cart("u1").await.unwrap();
        assert!(carts.send_reminder(&cart.id).await.is_err());
    }

    #[test]
    fn test_same_sku_merges_lines() {
        let env = test_environment();
        let mut state = CartState::new(3);
        let id = cart_in(&mut state, &env);
        AddItem {
            cart_id: id.clone(),
            item: CartItem::new("fuel", 2, 100),
        }
        .apply(&mut state, &env)
        .unwrap();

        LifecycleTest::new(env)
            .given_state(state)
            .when(AddItem {
                cart_id: id,
                item: CartItem::new("fuel", 3, 100),
            })
            .then_output(|cart| {
                assert_eq!(cart.items.len(), 1);
                assert_eq!(cart.items[0].quantity, 5);
                assert_eq!(cart.total_cents(), 500);
            })
            .then_events(|events| assertions::assert_event_names(events, &["item_added"]))
            .run();
    }

    #[test]
    fn test_empty_checkout_is_rejected() {
        let env = test_environment();
        let mut state = CartState::new(3);
        let id = cart_in(&mut state, &env);

        LifecycleTest::new(env)
            .given_state(state)
            .when(Checkout { cart_id: id.clone() })
            .then_error(|error| assert!(matches!(error, LifecycleError::Validation(_))))
            .then_state(move |state| assert_eq!(state.carts.get(&id).unwrap().status, CartStatus::Active))
            .run();
    }

    #[tokio::test]
    async fn test_expired_is_terminal() {
        let carts = CartService::new(test_environment(), 3);
        let cart = carts.create_cart("u1").await.unwrap();
        carts.expire(&cart.id).await.unwrap();

        for err in [
            carts.mark_abandoned(&cart.id).await.unwrap_err(),
            carts.recover(&cart.id).await.unwrap_err(),
            carts.expire(&cart.id).await.unwrap_err(),
        ] {
            assert!(matches!(err, LifecycleError::InvalidTransition { from: "expired", .. }));
        }
        let err = carts.add_item(&cart.id, CartItem::new("x", 1, 1)).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Validation(_)));
        assert_eq!(carts.get_cart(&cart.id).await.unwrap().status, CartStatus::Expired);
    }

    #[tokio::test]
    async fn test_terminal_empty_cart_reports_transition_on_checkout() {
        let carts = CartService::new(test_environment(), 3);
        let cart = carts.create_cart("u1").await.unwrap();
        carts.expire(&cart.id).await.unwrap();

        let err = carts.checkout(&cart.id).await.unwrap_err();
        assertions::assert_invalid_transition(&err, "checked_out");
        assert!(matches!(err, LifecycleError::InvalidTransition { from: "expired", .. }));
        assert_eq!(carts.get_cart(&cart.id).await.unwrap().status, CartStatus::Expired);
    }

    #[tokio::test]
    async fn test_unknown_cart_is_not_found() {
        let carts = CartService::new(test_environment(), 3);
        let err = carts.recover("cart_404").await.unwrap_err();
        assertions::assert_not_found(&err, "Cart", "cart_404");
    }
}

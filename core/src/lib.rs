//! # Starport Core
//!
//! Core traits and types for the Starport feature modules.
//!
//! Every Starport feature (badges, carts, policies, spans, ...) is built from the same
//! handful of parts, and this crate provides each of them exactly once:
//!
//! - **Registry**: an insertion-ordered, in-memory store of entities keyed by string IDs
//! - **Operation**: a named lifecycle step `(State, Command, Environment) → (Output, Events)`
//! - **Environment**: injected clock, ID generator, random source and telemetry adapter
//! - **Telemetry**: a best-effort event fan-out that can never fail its caller
//! - **Views**: pure aggregation helpers over registries (counts, sums, summaries)
//!
//! ## Architecture Principles
//!
//! - Operations mutate state synchronously and describe their telemetry as values
//! - Telemetry is emitted by the runtime after the state lock is released
//! - All time, identity and randomness come from the [`environment::Environment`]
//! - Reads hand out copies, never live references into a registry
//!
//! ## Example
//!
//! ```
//! use starport_core::environment::Environment;
//! use starport_core::error::LifecycleError;
//! use starport_core::lifecycle::{Applied, Feature, Operation};
//! use starport_core::registry::Registry;
//! use starport_core::telemetry::TelemetryEvent;
//!
//! struct NoteState {
//!     notes: Registry<String>,
//! }
//!
//! impl Feature for NoteState {
//!     const NAME: &'static str = "notes";
//! }
//!
//! struct AddNote {
//!     id: String,
//!     body: String,
//! }
//!
//! impl Operation<NoteState> for AddNote {
//!     type Output = String;
//!     const NAME: &'static str = "add_note";
//!
//!     fn apply(
//!         self,
//!         state: &mut NoteState,
//!         _env: &Environment,
//!     ) -> Result<Applied<String>, LifecycleError> {
//!         let stored = state.notes.put(self.id.clone(), self.body).clone();
//!         Ok(Applied::new(stored).with_event(TelemetryEvent::new("note_added").with("id", self.id)))
//!     }
//! }
//!
//! let mut state = NoteState { notes: Registry::new("Note") };
//! let applied = AddNote { id: "n1".into(), body: "Kepler-186f".into() }
//!     .apply(&mut state, &Environment::system())
//!     .unwrap();
//! assert_eq!(applied.output, "Kepler-186f");
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod error;
pub mod history;
pub mod registry;
pub mod status;
pub mod telemetry;
pub mod view;

/// Lifecycle module - the core abstraction for business operations
///
/// An operation is the unit every feature is written in. It receives exclusive access to
/// the feature state and the injected environment, validates referenced entities, mutates
/// the registries and returns its output together with the telemetry it wants emitted.
///
/// Operations never emit telemetry themselves. The runtime dispatcher emits the returned
/// events after the state lock is released, so a slow or failing sink cannot hold up or
/// fail an operation.
pub mod lifecycle {
    use super::environment::Environment;
    use super::error::LifecycleError;
    use super::telemetry::TelemetryEvent;

    /// Marker for a feature's state type
    ///
    /// The name doubles as the telemetry namespace: an event `unlocked` returned by a
    /// badge operation is emitted as `badges_unlocked`.
    pub trait Feature: Send + Sync + 'static {
        /// Feature namespace (snake case)
        const NAME: &'static str;
    }

    /// Result of applying an operation: its output plus telemetry descriptions
    #[derive(Debug, Clone, PartialEq)]
    pub struct Applied<T> {
        /// Value handed back to the caller
        pub output: T,
        /// Events to emit once the operation has committed
        pub events: Vec<TelemetryEvent>,
    }

    impl<T> Applied<T> {
        /// Wrap an output with no telemetry
        #[must_use]
        pub const fn new(output: T) -> Self {
            Self {
                output,
                events: Vec::new(),
            }
        }

        /// Attach a telemetry event
        #[must_use]
        pub fn with_event(mut self, event: TelemetryEvent) -> Self {
            self.events.push(event);
            self
        }

        /// Attach an event only when `condition` holds
        #[must_use]
        pub fn with_event_if(self, condition: bool, event: impl FnOnce() -> TelemetryEvent) -> Self {
            if condition {
                self.with_event(event())
            } else {
                self
            }
        }

        /// Transform the output, keeping the events
        #[must_use]
        pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Applied<U> {
            Applied {
                output: f(self.output),
                events: self.events,
            }
        }
    }

    /// A named lifecycle operation over feature state `S`
    ///
    /// # Example
    ///
    /// ```ignore
    /// impl Operation<CartState> for Recover {
    ///     type Output = Cart;
    ///     const NAME: &'static str = "recover";
    ///
    ///     fn apply(self, state: &mut CartState, env: &Environment)
    ///         -> Result<Applied<Cart>, LifecycleError>
    ///     {
    ///         let cart = state.carts.require_mut(&self.cart_id)?;
    ///         cart.status = transition("Cart", &cart.id, cart.status, CartStatus::Recovered)?;
    ///         Ok(Applied::new(cart.clone()))
    ///     }
    /// }
    /// ```
    pub trait Operation<S> {
        /// Value returned to the caller on success
        type Output;

        /// Operation name, used in logs and metric labels
        const NAME: &'static str;

        /// Apply the operation to the state
        ///
        /// Implementations validate first and mutate second, so a returned error leaves
        /// the state untouched.
        ///
        /// # Errors
        ///
        /// Returns [`LifecycleError`] when a referenced entity is missing, a status
        /// transition is not allowed, or the input fails validation.
        fn apply(self, state: &mut S, env: &Environment) -> Result<Applied<Self::Output>, LifecycleError>;
    }
}

/// Environment module - Dependency injection traits
///
/// Everything an operation would otherwise reach for through globals (wall-clock time,
/// fresh IDs, random numbers, telemetry collectors) is provided through these traits and
/// bundled into an [`Environment`](environment::Environment) that is constructed once per
/// application root.
pub mod environment {
    use super::telemetry::Telemetry;
    use chrono::{DateTime, Utc};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::{Arc, Mutex, PoisonError};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use starport_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = clock.now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    /// Source of entity IDs
    pub trait IdGenerator: Send + Sync {
        /// Produce a fresh ID, conventionally `<prefix>_<suffix>`
        fn generate(&self, prefix: &str) -> String;
    }

    /// Production ID generator: `<prefix>_<uuid v4, simple form>`
    #[derive(Debug, Clone, Copy, Default)]
    pub struct UuidIdGenerator;

    impl IdGenerator for UuidIdGenerator {
        fn generate(&self, prefix: &str) -> String {
            format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
        }
    }

    /// Source of uniform random numbers
    ///
    /// Every simulated value in the feature modules (latencies, scores, failure rolls)
    /// is drawn from this trait so tests can script or seed it.
    pub trait RandomSource: Send + Sync {
        /// Uniform sample in `[0, 1)`
        fn next_f64(&self) -> f64;

        /// `true` with probability `probability`
        fn chance(&self, probability: f64) -> bool {
            self.next_f64() < probability
        }

        /// Uniform sample in `[low, high)`
        fn range(&self, low: f64, high: f64) -> f64 {
            (high - low).mul_add(self.next_f64(), low)
        }
    }

    /// Seedable random source backed by [`StdRng`]
    #[derive(Debug)]
    pub struct SeededRandom {
        rng: Mutex<StdRng>,
    }

    impl SeededRandom {
        /// Deterministic source for a given seed
        #[must_use]
        pub fn new(seed: u64) -> Self {
            Self {
                rng: Mutex::new(StdRng::seed_from_u64(seed)),
            }
        }

        /// Source seeded from operating system entropy
        #[must_use]
        pub fn from_entropy() -> Self {
            Self {
                rng: Mutex::new(StdRng::from_entropy()),
            }
        }
    }

    impl RandomSource for SeededRandom {
        fn next_f64(&self) -> f64 {
            self.rng
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .r#gen::<f64>()
        }
    }

    /// Injected dependencies shared by every feature of one application root
    #[derive(Clone)]
    pub struct Environment {
        /// Wall clock
        pub clock: Arc<dyn Clock>,
        /// ID generator
        pub ids: Arc<dyn IdGenerator>,
        /// Random source for simulated values
        pub random: Arc<dyn RandomSource>,
        /// Telemetry adapter
        pub telemetry: Telemetry,
    }

    impl Environment {
        /// Environment with the given clock, UUID ids, entropy-seeded randomness and no
        /// telemetry sinks
        #[must_use]
        pub fn new(clock: Arc<dyn Clock>) -> Self {
            Self {
                clock,
                ids: Arc::new(UuidIdGenerator),
                random: Arc::new(SeededRandom::from_entropy()),
                telemetry: Telemetry::disabled(),
            }
        }

        /// Production defaults
        #[must_use]
        pub fn system() -> Self {
            Self::new(Arc::new(SystemClock))
        }

        /// Replace the clock
        #[must_use]
        pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
            self.clock = clock;
            self
        }

        /// Replace the ID generator
        #[must_use]
        pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
            self.ids = ids;
            self
        }

        /// Replace the random source
        #[must_use]
        pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
            self.random = random;
            self
        }

        /// Replace the telemetry adapter
        #[must_use]
        pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
            self.telemetry = telemetry;
            self
        }

        /// Current time from the injected clock
        #[must_use]
        pub fn now(&self) -> DateTime<Utc> {
            self.clock.now()
        }

        /// Fresh ID from the injected generator
        #[must_use]
        pub fn next_id(&self, prefix: &str) -> String {
            self.ids.generate(prefix)
        }
    }

    impl std::fmt::Debug for Environment {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("Environment")
                .field("now", &self.clock.now())
                .field("telemetry", &self.telemetry)
                .finish_non_exhaustive()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::environment::{Environment, IdGenerator, RandomSource, SeededRandom, UuidIdGenerator};

    #[test]
    fn test_seeded_random_is_deterministic() {
        let a = SeededRandom::new(7);
        let b = SeededRandom::new(7);
        for _ in 0..16 {
            assert_eq!(a.next_f64().to_bits(), b.next_f64().to_bits());
        }
    }

    #[test]
    fn test_random_range_stays_in_bounds() {
        let random = SeededRandom::new(42);
        for _ in 0..256 {
            let value = random.range(10.0, 20.0);
            assert!((10.0..20.0).contains(&value));
        }
    }

    #[test]
    fn test_uuid_ids_carry_prefix_and_differ() {
        let ids = UuidIdGenerator;
        let first = ids.generate("cart");
        let second = ids.generate("cart");
        assert!(first.starts_with("cart_"));
        assert_ne!(first, second);
    }

    #[test]
    fn test_system_environment_has_no_sinks() {
        let env = Environment::system();
        assert_eq!(env.telemetry.sink_count(), 0);
    }
}

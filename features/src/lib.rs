//! # Starport Features
//!
//! The feature modules of Starport, each built as a [`Feature`](starport_core::lifecycle::Feature)
//! state, a set of [`Operation`](starport_core::lifecycle::Operation) structs and a thin service
//! around a [`Dispatcher`](starport_runtime::Dispatcher):
//!
//! - **badges**: achievement badges, unlocks and milestone trackers
//! - **policy**: rule-based allow/deny decisions with a bounded decision log
//! - **rbac**: roles, permissions and wildcard permission checks
//! - **carts**: abandoned-cart recovery with capped reminders
//! - **spans**: trace spans with parent/child trees
//! - **alerts**: threshold rules over recorded metrics
//! - **loyalty**: point accounts, levels and a bounded ledger
//! - **jobs**: simulated services run through circuit breakers and retries
//!
//! [`Starport`] wires all of them to one environment.
//!
//! ## Example
//!
//! ```ignore
//! use starport_features::Starport;
//! use starport_runtime::RuntimeConfig;
//!
//! let app = Starport::from_config(&RuntimeConfig::from_env());
//! let cart = app.carts().create_cart("user-42").await?;
//! app.carts().mark_abandoned(&cart.id).await?;
//! ```

pub mod alerts;
pub mod app;
pub mod badges;
pub mod carts;
pub mod jobs;
pub mod loyalty;
pub mod policy;
pub mod rbac;
pub mod spans;

pub use app::{Overview, Starport};

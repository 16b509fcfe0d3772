//! Tessera - FHIR batch/transaction bundle processing
//!
//! Each bundle entry becomes a typed interaction that is visited by a
//! reference-mapping stage and then by a persistence stage. Transactions
//! fail fast and roll back; batches report failures per entry.

#![allow(
    clippy::too_many_arguments,      // Stage constructors take the per-bundle state they borrow
    clippy::large_enum_variant,      // Interaction variants carry full resources
)]

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod payload;
pub mod services;
pub mod state;

pub use config::Config;
pub use error::{Error, Result};
pub use state::AppState;

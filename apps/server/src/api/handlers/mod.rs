//! Request handlers

pub mod bundle;
pub mod health;
pub mod metrics;

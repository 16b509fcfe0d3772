//! Bundle processing services
//!
//! `bundle` drives batch and transaction bundles; the remaining modules are
//! the persistence boundary it calls into.

pub mod bundle;
pub mod operation_executor;
pub mod resource_helpers;
pub mod search;

pub use bundle::BundleProcessor;
pub use operation_executor::OperationExecutor;
pub use resource_helpers::{ResourceHelpers, StoreResourceHelpers};

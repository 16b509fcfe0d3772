//! FHIR data models for bundle processing
//!
//! Only the resources the bundle engine needs a typed view of live here:
//! `Bundle` (request and response shapes) and `OperationOutcome`. Every other
//! resource is carried as `serde_json::Value`.
//!
//! # Example
//!
//! ```rust
//! use tessera_models::{Bundle, BundleType};
//! use serde_json::json;
//!
//! let bundle = Bundle::from_value(&json!({
//!     "resourceType": "Bundle",
//!     "type": "transaction",
//!     "entry": []
//! }))
//! .unwrap();
//!
//! assert!(bundle.is_transaction());
//! assert_eq!(bundle.bundle_type.response_type(), Some(BundleType::TransactionResponse));
//! ```

pub mod common;

pub use common::*;

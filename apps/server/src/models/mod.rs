//! Domain models for the bundle engine

pub mod fhir;
pub mod operations;

pub use fhir::{format_instant, Resource, ResourceOperation, SearchResult};
pub use operations::*;

//! Resource storage

pub mod memory;

pub use memory::{populate_meta, InMemoryResourceStore, StoreTransaction};

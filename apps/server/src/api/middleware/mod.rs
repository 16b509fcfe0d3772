//! Middleware and layer factories

mod layers;
mod security;

pub use layers::{cors, trace};
pub use security::security_headers_middleware;

//! Authentication for SDK uploads.

mod middleware;

pub use middleware::*;

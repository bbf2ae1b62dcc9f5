//! Database module for PostgreSQL persistence.

mod devices;
mod pool;
mod records;

pub use devices::*;
pub use pool::*;
pub use records::*;

//! Request handlers for batch ingest and record reads.

mod ingest;
mod records;

pub use ingest::*;
pub use records::*;

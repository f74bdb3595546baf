//! Segmented, append-only record storage.
//!
//! # Module Structure
//!
//! - `entry`: on-disk widths, file naming and record serialization
//! - `store`: length-prefixed payload file
//! - `index`: memory-mapped offset to position table
//! - `segment`: one store plus one index under a base offset
//! - `manager`: the ordered segment set exposed as [`Log`]

mod entry;
mod index;
mod manager;
mod segment;
mod store;

#[cfg(test)]
mod tests;

pub use entry::LEN_WIDTH;
pub use index::Index;
pub use manager::{Log, LogReader};
pub use segment::Segment;
pub use store::Store;

//! Snapshot storage for the consensus layer.
//!
//! A single snapshot is kept; saving a new one replaces the previous one.
//!
//! # Directory Structure
//!
//! ```text
//! {base_dir}/
//! ├── meta.json       # Snapshot metadata (index, term, config)
//! ├── data.bin        # Snapshot data
//! └── checksum.sha256 # Data checksum for integrity verification
//! ```
//!
//! # Features
//!
//! - Atomic snapshot writes using temporary files and rename
//! - Checksum verification for data integrity
//! - Blocking file I/O moved off the async runtime

mod store;


pub use store::{FileSnapshotStorage, SnapshotStorageOptions};

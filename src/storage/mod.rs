pub mod log;
pub mod raft_log;
pub mod snapshot;
pub mod stable;

pub use raft_log::RaftLogStore;
pub use snapshot::{FileSnapshotStorage, SnapshotStorageOptions};
pub use stable::FileStableStore;

pub mod metrics;
pub mod owner;
pub mod persistence;
pub mod registry;

pub use owner::{CellEdit, OwnerHandle, SetCellOutcome, SetCellRequest, SnapshotReply, WatchOutcome};
pub use persistence::{TilePersistence, TileRecord, TileSnapshot};
pub use registry::{OwnerRegistry, ShardDirectory};

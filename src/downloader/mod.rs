pub mod bandwidth;
pub mod engine;
pub mod manager;
pub mod progress;
pub mod retry;
pub mod segment;
pub mod source;
pub mod status;
pub mod storage;
pub mod task;
pub mod task_slot_pool;

#[cfg(test)]
pub(crate) mod test_support;

pub use bandwidth::{ActiveTransfer, Allocation, BandwidthAllocator, TransferQuota};
pub use engine::{DownloadEngine, EngineSettings, FetchOutcome, RateMeter, VerifyOutcome};
pub use manager::{DownloadManager, ManagerConfig};
pub use progress::SpeedCalculator;
pub use retry::RetryPolicy;
pub use segment::{Segment, SegmentManager, SegmentState};
pub use source::{HttpSource, SegmentSource, SourceRouter};
pub use status::{StatusKind, TaskStatus};
pub use storage::StorageLayout;
pub use task::{
    AddOptions, BandwidthLimit, Category, Download, HoldReason, Priority, SourceDescriptor,
    TorrentFile, TorrentMeta,
};
pub use task_slot_pool::{TaskSlot, TaskSlotPool};

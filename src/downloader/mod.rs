pub mod auth;
pub mod finalizer;
pub mod manager;
pub mod path;
pub mod progress;
pub mod task;
pub mod task_slot_pool;
pub mod transfer;

pub use auth::{AuthorizedRequest, HostAuth};
pub use finalizer::{finalize, FinalizeError, FinalizeSpec};
pub use manager::{DownloadManager, ManagerOptions};
pub use path::{resolve_target, TargetPaths, PARTIAL_SUFFIX};
pub use progress::{format_eta, format_speed, SpeedSampler};
pub use task::{DownloadRequest, DownloadTask, SourceKind, TaskStatus, DEFAULT_PRIORITY};
pub use task_slot_pool::TaskSlotPool;
pub use transfer::{select_transfer, Transfer, TransferOutcome, TransferProgress};

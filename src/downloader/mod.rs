pub mod archive;
pub mod breakpoint;
pub mod core;
pub mod error;
pub mod manager;
pub mod models;
pub mod pool;
pub mod progress;
pub mod rate_limit;
pub mod space;
pub mod store;
pub mod task;

pub use breakpoint::{BreakpointInfo, BreakpointStore};
pub use error::{DownloadError, Result};
pub use manager::DownloadManager;
pub use models::{CommandResult, DirectStream, DownloadRequest, ResumeOutcome, StoredFile, SubmitOutcome};
pub use progress::{ProgressEvent, ProgressPublisher};
pub use task::{Task, TaskStatus, TransferProgress};

pub mod common;
pub mod downloader;
#[cfg(feature = "http")]
pub mod http;

pub use common::config::ServiceConfig;
pub use downloader::{DownloadError, DownloadManager, DownloadRequest, ProgressEvent, Task, TaskStatus};

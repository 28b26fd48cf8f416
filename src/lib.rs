//! Segmented (HLS) and progressive video download with ffmpeg remuxing.

pub mod download;
pub mod error;
pub mod options;

pub use download::report::{Event, NoopReporter, Reporter, Stage};
pub use download::state::{ProcessHandle, Progress, RunState, TransferState};
pub use download::transfer::{spawn_download, DownloadJob, Downloader, JobKind, TransferOutcome};
pub use error::{DownloadError, Result};
pub use options::Options;

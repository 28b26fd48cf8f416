use std::fmt;

/// Steps of one job, in the order they can occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    DirectDownload,
    PlaylistFetch,
    SegmentLoop,
    Merge,
    Cleanup,
    Done,
    Cancelled,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Init => "init",
            Stage::DirectDownload => "direct download",
            Stage::PlaylistFetch => "playlist fetch",
            Stage::SegmentLoop => "segment loop",
            Stage::Merge => "merge",
            Stage::Cleanup => "cleanup",
            Stage::Done => "done",
            Stage::Cancelled => "cancelled",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Stage(Stage),
    /// `(current, total)`: segments for playlists, bytes for direct files.
    /// `total` is 0 when the server did not announce a length.
    Progress { current: u64, total: u64 },
    Status(String),
    MuxerStarted { pid: Option<u32> },
    MuxerExited { code: Option<i32> },
}

/// Sink for progress and status lines. Reporting never changes what a job does.
pub trait Reporter: Send + Sync {
    fn report(&self, _event: Event) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl Reporter for NoopReporter {}

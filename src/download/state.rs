//! State shared between a running job and whoever started it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{DownloadError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Paused,
}

/// Snapshot of the progress counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub bytes: u64,
    pub bytes_total: Option<u64>,
    pub segments: u64,
    pub segments_total: Option<u64>,
}

/// Termination handle for the multiplexer process while a merge runs.
///
/// The supervisor owns the child; this only asks it to stop.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    terminate: CancellationToken,
}

impl ProcessHandle {
    pub(crate) fn new(pid: Option<u32>) -> Self {
        Self {
            pid,
            terminate: CancellationToken::new(),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn terminate(&self) {
        self.terminate.cancel();
    }

    pub(crate) fn termination_requested(&self) -> &CancellationToken {
        &self.terminate
    }
}

#[derive(Debug)]
pub struct TransferState {
    run_state: watch::Sender<RunState>,
    cancel: CancellationToken,
    bytes: AtomicU64,
    bytes_total: AtomicU64,
    segments: AtomicU64,
    segments_total: AtomicU64,
    process: Mutex<Option<ProcessHandle>>,
}

// zero in a total counter means unknown
const UNKNOWN: u64 = 0;

impl TransferState {
    pub fn new() -> Arc<Self> {
        let (run_state, _) = watch::channel(RunState::Running);
        Arc::new(Self {
            run_state,
            cancel: CancellationToken::new(),
            bytes: AtomicU64::new(0),
            bytes_total: AtomicU64::new(UNKNOWN),
            segments: AtomicU64::new(0),
            segments_total: AtomicU64::new(UNKNOWN),
            process: Mutex::new(None),
        })
    }

    pub fn pause(&self) {
        self.run_state.send_replace(RunState::Paused);
    }

    pub fn resume(&self) {
        self.run_state.send_replace(RunState::Running);
    }

    pub fn run_state(&self) -> RunState {
        *self.run_state.borrow()
    }

    pub fn is_paused(&self) -> bool {
        self.run_state() == RunState::Paused
    }

    /// Request cancellation. There is no way back for this job.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(DownloadError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Park until the job is resumed. Returns `Cancelled` if cancel arrives first.
    pub async fn wait_if_paused(&self) -> Result<()> {
        self.check_cancelled()?;
        if !self.is_paused() {
            return Ok(());
        }

        let mut rx = self.run_state.subscribe();
        tokio::select! {
            _ = self.cancel.cancelled() => Err(DownloadError::Cancelled),
            // the sender lives in self, so the channel cannot close here
            _ = rx.wait_for(|state| *state == RunState::Running) => self.check_cancelled(),
        }
    }

    pub fn progress(&self) -> Progress {
        let total = |v: u64| (v != UNKNOWN).then_some(v);
        Progress {
            bytes: self.bytes.load(Ordering::Acquire),
            bytes_total: total(self.bytes_total.load(Ordering::Acquire)),
            segments: self.segments.load(Ordering::Acquire),
            segments_total: total(self.segments_total.load(Ordering::Acquire)),
        }
    }

    pub(crate) fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn set_bytes_total(&self, total: Option<u64>) {
        self.bytes_total
            .store(total.unwrap_or(UNKNOWN), Ordering::Release);
    }

    pub(crate) fn segment_done(&self) {
        self.segments.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn set_segments_total(&self, total: u64) {
        self.segments_total.store(total, Ordering::Release);
    }

    /// The multiplexer currently running for this job, if any.
    pub fn process(&self) -> Option<ProcessHandle> {
        self.process.lock().clone()
    }

    pub(crate) fn set_process(&self, handle: Option<ProcessHandle>) {
        *self.process.lock() = handle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn cancel_is_sticky() {
        let state = TransferState::new();
        assert!(!state.is_cancelled());
        state.cancel();
        state.resume();
        state.pause();
        state.resume();
        assert!(state.is_cancelled());
        assert!(state.check_cancelled().unwrap_err().is_cancelled());
    }

    #[test]
    fn pause_toggles_freely() {
        let state = TransferState::new();
        assert_eq!(state.run_state(), RunState::Running);
        state.pause();
        state.pause();
        assert!(state.is_paused());
        state.resume();
        assert!(!state.is_paused());
    }

    #[tokio::test]
    async fn wait_if_paused_returns_on_resume() {
        let state = TransferState::new();
        state.pause();

        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.wait_if_paused().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        state.resume();
        let res = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn wait_if_paused_wakes_on_cancel() {
        let state = TransferState::new();
        state.pause();

        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.wait_if_paused().await })
        };

        state.cancel();
        let res = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(res.unwrap_err().is_cancelled());
    }

    #[test]
    fn published_process_can_be_terminated() {
        let state = TransferState::new();
        state.set_process(Some(ProcessHandle::new(Some(42))));

        let handle = state.process().unwrap();
        assert_eq!(handle.pid(), Some(42));
        handle.terminate();
        assert!(handle.termination_requested().is_cancelled());

        state.set_process(None);
        assert!(state.process().is_none());
    }

    #[test]
    fn unknown_totals_read_as_none() {
        let state = TransferState::new();
        assert_eq!(state.progress(), Progress::default());

        state.set_segments_total(5);
        state.segment_done();
        state.add_bytes(10);
        let progress = state.progress();
        assert_eq!(progress.segments, 1);
        assert_eq!(progress.segments_total, Some(5));
        assert_eq!(progress.bytes, 10);
        assert_eq!(progress.bytes_total, None);
    }
}

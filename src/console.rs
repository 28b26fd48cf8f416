use std::io::BufRead;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use hlsgrab::{Event, Reporter, Stage, TransferState};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

const MIB: f64 = 1024.0 * 1024.0;

/// Prints progress of one job through `tracing`.
pub struct ConsoleReporter {
    label: String,
    last_percent: AtomicU64,
    segments: AtomicBool,
}

impl ConsoleReporter {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            last_percent: AtomicU64::new(u64::MAX),
            segments: AtomicBool::new(false),
        }
    }

    /// True when the whole percentage changed since the last call.
    fn percent_changed(&self, percent: u64) -> bool {
        self.last_percent.swap(percent, Ordering::Relaxed) != percent
    }
}

impl Reporter for ConsoleReporter {
    fn report(&self, event: Event) {
        match event {
            Event::Stage(Stage::SegmentLoop) => {
                self.segments.store(true, Ordering::Relaxed);
                self.last_percent.store(u64::MAX, Ordering::Relaxed);
                debug!(job = %self.label, "Downloading segments");
            }
            Event::Stage(stage) => debug!(job = %self.label, %stage, "Stage"),
            Event::Progress { current, total } if total > 0 => {
                let percent = current * 100 / total;
                if !self.percent_changed(percent) && current != total {
                    return;
                }
                let ratio = (current as f64 / total as f64) * 100.0;
                if self.segments.load(Ordering::Relaxed) {
                    info!(
                        "{}: {:width$} / {:width$} segs ({:5.2}%)",
                        self.label,
                        current,
                        total,
                        ratio,
                        width = total.to_string().len()
                    );
                } else {
                    info!(
                        "{}: {:.1} / {:.1} MB ({:5.2}%)",
                        self.label,
                        current as f64 / MIB,
                        total as f64 / MIB,
                        ratio
                    );
                }
            }
            Event::Progress { current, .. } => {
                debug!("{}: {:.1} MB", self.label, current as f64 / MIB);
            }
            Event::Status(line) => debug!(job = %self.label, "{line}"),
            Event::MuxerStarted { pid } => debug!(job = %self.label, ?pid, "ffmpeg started"),
            Event::MuxerExited { code } => debug!(job = %self.label, ?code, "ffmpeg exited"),
        }
    }
}

/// Pause, resume and cancel for every job started from this process.
#[derive(Default)]
pub struct Controls {
    states: Mutex<Vec<(String, Arc<TransferState>)>>,
    cancelled: AtomicBool,
}

impl Controls {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, label: &str) -> Arc<TransferState> {
        let state = TransferState::new();
        if self.is_cancelled() {
            state.cancel();
        }
        self.states.lock().push((label.to_string(), Arc::clone(&state)));
        state
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn pause_all(&self) {
        info!("Pausing downloads (enter `r` to resume)");
        self.states.lock().iter().for_each(|(_, state)| state.pause());
    }

    pub fn resume_all(&self) {
        info!("Resuming downloads");
        self.states.lock().iter().for_each(|(_, state)| state.resume());
    }

    pub fn cancel_all(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.states.lock().iter().for_each(|(_, state)| state.cancel());
    }

    fn print_status(&self) {
        for (label, state) in self.states.lock().iter() {
            let progress = state.progress();
            info!(
                job = %label,
                state = ?state.run_state(),
                cancelled = state.is_cancelled(),
                segments = progress.segments,
                segments_total = ?progress.segments_total,
                mb = %format!("{:.1}", progress.bytes as f64 / MIB),
                ffmpeg_pid = ?state.process().and_then(|p| p.pid()),
                "Status"
            );
        }
    }

    fn command(&self, line: &str) {
        match line.trim() {
            "p" | "pause" => self.pause_all(),
            "r" | "resume" => self.resume_all(),
            "c" | "cancel" => {
                warn!("Cancelling downloads");
                self.cancel_all();
            }
            "s" | "status" => self.print_status(),
            "" => {}
            other => warn!("Unknown command `{other}` (p = pause, r = resume, c = cancel, s = status)"),
        }
    }

    /// Read commands from stdin on a plain thread and cancel everything on Ctrl-C.
    pub fn listen(self: &Arc<Self>) {
        let controls = Arc::clone(self);
        // blocking stdin reads would hold up runtime shutdown, so keep them off tokio
        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) => controls.command(&line),
                    Err(_) => break,
                }
            }
        });

        let controls = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling downloads");
                controls.cancel_all();
            }
        });
    }
}

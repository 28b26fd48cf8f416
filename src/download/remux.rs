//! Supervision of the external multiplexer (ffmpeg) that turns the concat manifest into
//! the final container.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info, warn};

use crate::download::report::{Event, Reporter};
use crate::download::state::{ProcessHandle, TransferState};
use crate::error::{DownloadError, Result};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

const STDERR_TAIL_LINES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Copy streams as they are.
    StreamCopy,
    /// Re-encode to H.264/AAC, used when copying fails.
    Reencode,
}

impl Profile {
    fn codec_args(self) -> &'static [&'static str] {
        match self {
            Self::StreamCopy => &["-c", "copy"],
            Self::Reencode => &["-c:v", "libx264", "-c:a", "aac"],
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StreamCopy => f.write_str("stream copy"),
            Self::Reencode => f.write_str("re-encode"),
        }
    }
}

/// Arguments for a concat-demuxer merge of `manifest` into an mp4 at `output`.
pub fn merge_args(manifest: &Path, output: &Path, profile: Profile) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-hide_banner", "-loglevel", "error", "-y"]
        .iter()
        .chain(&["-f", "concat", "-safe", "0", "-i"])
        .map(OsString::from)
        .collect();
    args.push(manifest.as_os_str().to_owned());
    args.extend(profile.codec_args().iter().map(OsString::from));
    args.extend(
        ["-ignore_unknown", "-fflags", "+genpts", "-f", "mp4"]
            .iter()
            .map(OsString::from),
    );
    args.push(output.as_os_str().to_owned());
    args
}

fn muxer_command(program: &Path) -> Command {
    #[allow(unused_mut)]
    let mut cmd = Command::new(program);
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.as_std_mut().creation_flags(CREATE_NO_WINDOW);
    }
    cmd
}

/// Keeps the process handle published in the transfer state for as long as the child runs.
struct Published<'a> {
    state: &'a TransferState,
    reporter: &'a dyn Reporter,
    code: Option<i32>,
}

impl<'a> Published<'a> {
    fn new(state: &'a TransferState, reporter: &'a dyn Reporter, handle: ProcessHandle) -> Self {
        reporter.report(Event::MuxerStarted { pid: handle.pid() });
        state.set_process(Some(handle));
        Self {
            state,
            reporter,
            code: None,
        }
    }
}

impl Drop for Published<'_> {
    fn drop(&mut self) {
        self.state.set_process(None);
        self.reporter.report(Event::MuxerExited { code: self.code });
    }
}

async fn drain_stderr(stderr: ChildStderr) -> String {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "ffmpeg", "{line}");
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}

#[derive(Debug, Clone)]
pub struct Muxer {
    program: PathBuf,
    kill_grace: Duration,
}

impl Muxer {
    pub fn new(program: impl Into<PathBuf>, kill_grace: Duration) -> Self {
        Self {
            program: program.into(),
            kill_grace,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Run `<program> -version` and return the first line of its output.
    pub async fn probe(&self) -> Result<String> {
        let unavailable = |source| DownloadError::MuxerUnavailable {
            program: self.program.clone(),
            source,
        };

        let output = muxer_command(&self.program)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(unavailable)?;

        if !output.status.success() {
            return Err(unavailable(std::io::Error::other(format!(
                "-version exited with {}",
                output.status
            ))));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .to_string())
    }

    /// Merge the segments listed in `manifest` into `output`.
    ///
    /// The running process is published through `state` until this returns. Cancel (or
    /// a termination request on the handle) stops the child and yields `Cancelled`;
    /// a non-zero exit yields `MergeFailed`.
    pub async fn merge(
        &self,
        manifest: &Path,
        output: &Path,
        profile: Profile,
        state: &TransferState,
        reporter: &dyn Reporter,
    ) -> Result<()> {
        state.check_cancelled()?;

        let args = merge_args(manifest, output, profile);
        info!(program = %self.program.display(), ?args, %profile, "Starting multiplexer");

        let mut child = muxer_command(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DownloadError::MuxerUnavailable {
                program: self.program.clone(),
                source,
            })?;

        let handle = ProcessHandle::new(child.id());
        let mut published = Published::new(state, reporter, handle.clone());

        let tail = child.stderr.take().map(|stderr| tokio::spawn(drain_stderr(stderr)));

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = state.cancellation().cancelled() => {
                self.stop(&mut child).await;
                return Err(DownloadError::Cancelled);
            }
            _ = handle.termination_requested().cancelled() => {
                self.stop(&mut child).await;
                return Err(DownloadError::Cancelled);
            }
        };
        published.code = status.code();

        // a paused job does not move on, even if the child is already done
        state.wait_if_paused().await?;

        if status.success() {
            debug!(%profile, "Multiplexer finished");
            return Ok(());
        }

        let detail = match tail {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        Err(DownloadError::MergeFailed {
            profile,
            code: status.code(),
            detail,
        })
    }

    /// Ask the child to quit, then kill it once the grace period is over. Failures here
    /// are only logged, the caller reports `Cancelled` either way.
    async fn stop(&self, child: &mut Child) {
        info!("Terminating multiplexer");

        if let Some(mut stdin) = child.stdin.take() {
            // ffmpeg finishes cleanly on `q`
            if let Err(err) = stdin.write_all(b"q\n").await {
                debug!(error = %err, "Could not send quit to multiplexer");
            }
        }

        match tokio::time::timeout(self.kill_grace, child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "Multiplexer stopped"),
            Ok(Err(err)) => {
                let err = DownloadError::ProcessSupervision {
                    reason: format!("waiting for multiplexer: {err}"),
                };
                warn!(error = %err, "Multiplexer supervision failed");
            }
            Err(_) => {
                if let Err(err) = child.kill().await {
                    let err = DownloadError::ProcessSupervision {
                        reason: format!("killing multiplexer: {err}"),
                    };
                    warn!(error = %err, "Multiplexer supervision failed");
                }
            }
        }
    }
}

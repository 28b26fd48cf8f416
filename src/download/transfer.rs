use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::header::HeaderMap;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::download::playlist::PlaylistResolver;
use crate::download::remux::{Muxer, Profile};
use crate::download::report::{Event, NoopReporter, Reporter, Stage};
use crate::download::segment::{stream_to_file, SegmentFetcher};
use crate::download::state::TransferState;
use crate::download::DownloadClient;
use crate::error::{DownloadError, Result};
use crate::options::Options;

pub const MANIFEST_NAME: &str = "filelist.txt";
pub const OUTPUT_EXTENSION: &str = "mp4";
const DEFAULT_SEGMENT_EXTENSION: &str = "ts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    #[serde(alias = "mp4")]
    DirectFile,
    #[serde(alias = "m3u8")]
    Playlist,
}

impl JobKind {
    /// Guess the kind from the URL path extension.
    pub fn from_url(url: &Url) -> Result<Self> {
        let extension = Path::new(url.path())
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "m3u8" => Ok(Self::Playlist),
            "mp4" => Ok(Self::DirectFile),
            _ => Err(DownloadError::UnsupportedKind { extension }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadJob {
    pub source_url: Url,
    pub target_dir: PathBuf,
    /// File stem of the result, the `.mp4` extension is appended.
    pub output_name: String,
    pub kind: JobKind,
}

impl DownloadJob {
    pub fn new(
        source_url: Url,
        target_dir: impl Into<PathBuf>,
        output_name: impl Into<String>,
        kind: JobKind,
    ) -> Self {
        Self {
            source_url,
            target_dir: target_dir.into(),
            output_name: output_name.into(),
            kind,
        }
    }

    pub fn output_file_name(&self) -> String {
        format!("{}.{}", self.output_name, OUTPUT_EXTENSION)
    }

    pub fn output_path(&self) -> PathBuf {
        self.target_dir.join(self.output_file_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed(PathBuf),
    /// The media playlist listed no segments, no file was produced.
    NothingToMerge,
}

/// `NNNN.<ext>`, the extension taken from the segment URL when it has a sane one.
pub fn segment_file_name(index: usize, url: &Url) -> String {
    let extension = Path::new(url.path())
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or(DEFAULT_SEGMENT_EXTENSION);
    format!("{index:04}.{extension}")
}

/// Name for the on-disk copy of a fetched playlist that is not in `taken`.
fn playlist_copy_name(mut name: String, taken: &HashSet<String>) -> String {
    while taken.contains(&name) {
        name.push_str(".m3u8");
    }
    name
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "Could not remove file"),
    }
}

/// Runs jobs. Clones share the HTTP connection pool.
#[derive(Clone)]
pub struct Downloader {
    client: DownloadClient,
    muxer: Muxer,
    options: Options,
    headers: HeaderMap,
    reporter: Arc<dyn Reporter>,
}

impl Downloader {
    /// `headers` go out with every playlist and segment request (cookies, tokens).
    pub fn new(options: Options, headers: HeaderMap) -> Result<Self> {
        Ok(Self {
            client: DownloadClient::new(&options)?,
            muxer: Muxer::new(options.ffmpeg_path.clone(), options.kill_grace),
            options,
            headers,
            reporter: Arc::new(NoopReporter),
        })
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn muxer(&self) -> &Muxer {
        &self.muxer
    }

    fn stage(&self, stage: Stage) {
        debug!(%stage, "Entering stage");
        self.reporter.report(Event::Stage(stage));
    }

    fn status(&self, message: String) {
        info!("{message}");
        self.reporter.report(Event::Status(message));
    }

    fn fetcher(&self) -> SegmentFetcher<'_> {
        SegmentFetcher::new(
            &self.client,
            &self.headers,
            self.reporter.as_ref(),
            self.options.chunk_size,
            self.options.tls_retries,
        )
    }

    /// Run one job to completion. Intermediate files are kept when this fails.
    pub async fn download(&self, job: &DownloadJob, state: &TransferState) -> Result<TransferOutcome> {
        let result = self.run(job, state).await;
        match &result {
            Ok(_) => self.stage(Stage::Done),
            Err(DownloadError::Cancelled) => {
                self.status(format!("[Cancelled] {}", job.output_name));
                self.stage(Stage::Cancelled);
            }
            Err(err) => {
                error!(url = %job.source_url, error = %err, "Download failed");
                self.stage(Stage::Failed);
            }
        }
        result
    }

    async fn run(&self, job: &DownloadJob, state: &TransferState) -> Result<TransferOutcome> {
        self.stage(Stage::Init);
        state.check_cancelled()?;
        tokio::fs::create_dir_all(&job.target_dir).await?;

        match job.kind {
            JobKind::DirectFile => self.download_direct(job, state).await,
            JobKind::Playlist => self.download_playlist(job, state).await,
        }
    }

    async fn download_direct(&self, job: &DownloadJob, state: &TransferState) -> Result<TransferOutcome> {
        self.stage(Stage::DirectDownload);
        let output = job.output_path();
        self.status(format!("[Download MP4] {}", output.display()));

        let response = self.fetcher().open(&job.source_url).await?;
        let total = response.content_length();
        state.set_bytes_total(total);

        let reporter = self.reporter.as_ref();
        let written = stream_to_file(response, &output, state, self.options.chunk_size, |n| {
            reporter.report(Event::Progress {
                current: n,
                total: total.unwrap_or(0),
            })
        })
        .await;

        match written {
            Ok(bytes) => {
                self.status(format!("[Download complete] {} ({bytes} bytes)", output.display()));
                Ok(TransferOutcome::Completed(output))
            }
            Err(err) => {
                remove_quietly(&output).await;
                Err(err)
            }
        }
    }

    async fn download_playlist(&self, job: &DownloadJob, state: &TransferState) -> Result<TransferOutcome> {
        self.stage(Stage::PlaylistFetch);
        let resolver = PlaylistResolver::new(
            &self.client,
            &self.headers,
            self.options.max_playlist_redirects,
        );
        let resolved = resolver.resolve(&job.source_url).await?;

        let segments = resolved.segments;
        let segment_names = segments
            .iter()
            .enumerate()
            .map(|(index, url)| segment_file_name(index, url))
            .collect::<Vec<_>>();

        // playlist copies must not overwrite the output, the manifest or a segment
        let mut taken = segment_names.iter().cloned().collect::<HashSet<_>>();
        taken.insert(job.output_file_name());
        taken.insert(MANIFEST_NAME.to_string());

        let mut intermediates = Vec::new();
        for document in &resolved.documents {
            let name = playlist_copy_name(document.file_name(), &taken);
            let path = job.target_dir.join(&name);
            tokio::fs::write(&path, &document.text).await?;
            taken.insert(name);
            intermediates.push(path);
        }

        if segments.is_empty() {
            warn!(url = %job.source_url, "Playlist has no segments, nothing to merge");
            for path in &intermediates {
                remove_quietly(path).await;
            }
            return Ok(TransferOutcome::NothingToMerge);
        }

        self.stage(Stage::SegmentLoop);
        let total = segments.len();
        state.set_segments_total(total as u64);

        let manifest_path = job.target_dir.join(MANIFEST_NAME);
        let mut manifest = tokio::fs::File::create(&manifest_path).await?;
        intermediates.push(manifest_path.clone());

        let fetcher = self.fetcher();
        for (index, (url, name)) in segments.iter().zip(&segment_names).enumerate() {
            state.check_cancelled()?;
            state.wait_if_paused().await?;

            let path = job.target_dir.join(name);
            fetcher.fetch_segment(url, &path, index, total, state).await?;
            intermediates.push(path);

            manifest
                .write_all(format!("file '{name}'\n").as_bytes())
                .await?;
            manifest.flush().await?;
        }
        drop(manifest);
        state.check_cancelled()?;

        self.stage(Stage::Merge);
        let output = job.output_path();
        self.status(format!(
            "[Starting FFmpeg] Merging {total} segments into {}",
            output.display()
        ));
        self.merge(&manifest_path, &output, state).await?;
        self.status(format!("[Merge complete] {}", output.display()));

        self.stage(Stage::Cleanup);
        for path in &intermediates {
            remove_quietly(path).await;
        }
        self.status("[Cleanup] Temporary files removed".to_string());

        Ok(TransferOutcome::Completed(output))
    }

    /// Stream copy first, one re-encode attempt if that exits non-zero.
    async fn merge(&self, manifest: &Path, output: &Path, state: &TransferState) -> Result<()> {
        let reporter = self.reporter.as_ref();
        let first = self
            .muxer
            .merge(manifest, output, Profile::StreamCopy, state, reporter)
            .await;

        let result = match first {
            Err(err @ DownloadError::MergeFailed { .. }) => {
                warn!(error = %err, "Stream copy failed, re-encoding");
                self.reporter.report(Event::Status(format!(
                    "Warning: FFmpeg merge failed, trying to re-encode: {err}"
                )));
                self.muxer
                    .merge(manifest, output, Profile::Reencode, state, reporter)
                    .await
            }
            other => other,
        };

        if result.is_err() {
            remove_quietly(output).await;
        }
        result
    }
}

/// Run `job` on its own task. The caller keeps `state` to pause, resume or cancel it.
pub fn spawn_download(
    downloader: Arc<Downloader>,
    job: DownloadJob,
    state: Arc<TransferState>,
) -> JoinHandle<Result<TransferOutcome>> {
    tokio::spawn(async move { downloader.download(&job, &state).await })
}

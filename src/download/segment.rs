use std::path::Path;

use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::Response;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};
use url::Url;

use crate::download::report::{Event, Reporter};
use crate::download::state::TransferState;
use crate::download::{ensure_success, DownloadClient};
use crate::error::{DownloadError, Result};

/// Stream a response body into `dest`.
///
/// Cancel is checked and pause honoured before every chunk is written. On cancel the
/// partial file is flushed and left where it is. `on_chunk` receives the running byte count.
pub(crate) async fn stream_to_file(
    response: Response,
    dest: &Path,
    state: &TransferState,
    chunk_size: usize,
    mut on_chunk: impl FnMut(u64),
) -> Result<u64> {
    let file = tokio::fs::File::create(dest).await?;
    let mut writer = BufWriter::with_capacity(chunk_size, file);
    let mut stream = response.bytes_stream();
    let mut written = 0u64;

    let received: Result<()> = async {
        loop {
            let next = tokio::select! {
                biased;
                _ = state.cancellation().cancelled() => return Err(DownloadError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { return Ok(()) };
            let chunk = chunk?;

            state.check_cancelled()?;
            state.wait_if_paused().await?;

            if chunk.is_empty() {
                continue;
            }
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
            state.add_bytes(chunk.len() as u64);
            on_chunk(written);
        }
    }
    .await;

    // whatever was received stays on disk, also when cancelled
    let flushed = writer.flush().await;
    received?;
    flushed?;
    Ok(written)
}

pub struct SegmentFetcher<'a> {
    client: &'a DownloadClient,
    headers: &'a HeaderMap,
    reporter: &'a dyn Reporter,
    chunk_size: usize,
    tls_retries: u32,
}

impl<'a> SegmentFetcher<'a> {
    pub fn new(
        client: &'a DownloadClient,
        headers: &'a HeaderMap,
        reporter: &'a dyn Reporter,
        chunk_size: usize,
        tls_retries: u32,
    ) -> Self {
        Self {
            client,
            headers,
            reporter,
            chunk_size,
            tls_retries,
        }
    }

    /// GET `url`, retrying TLS-class failures only. Anything else propagates at once.
    pub(crate) async fn open(&self, url: &Url) -> Result<Response> {
        let mut retries = 0;
        loop {
            match self.client.fetch(url, self.headers).await.and_then(ensure_success) {
                Ok(response) => return Ok(response),
                Err(err) if err.is_tls() && retries < self.tls_retries => {
                    retries += 1;
                    warn!(%url, retry = retries, error = %err, "Retrying after TLS error");
                    self.reporter
                        .report(Event::Status(format!("[Retrying] {url}: TLS error: {err}")));
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Download segment `index` of `total` into `dest`.
    pub async fn fetch_segment(
        &self,
        url: &Url,
        dest: &Path,
        index: usize,
        total: usize,
        state: &TransferState,
    ) -> Result<u64> {
        let response = self.open(url).await?;
        let written = stream_to_file(response, dest, state, self.chunk_size, |_| {}).await?;

        state.segment_done();
        debug!(%url, index, bytes = written, "Segment downloaded");
        self.reporter.report(Event::Progress {
            current: index as u64 + 1,
            total: total as u64,
        });
        Ok(written)
    }
}

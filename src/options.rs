use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; rv:78.0) Gecko/20100101 Firefox/78.0";

#[derive(Debug, Clone)]
pub struct Options {
    /// Connect and per-read timeout for every request.
    pub request_timeout: Duration,
    /// Total attempts for idempotent requests answered with 500/502/503/504.
    pub max_request_attempts: u32,
    /// Backoff between transport attempts is `factor * 2^(n-1)`, the first retry is immediate.
    pub backoff_factor: Duration,
    /// Extra attempts a segment gets after a TLS-class failure. Independent of the
    /// transport attempts above.
    pub tls_retries: u32,
    pub max_playlist_redirects: usize,
    pub chunk_size: usize,
    pub ffmpeg_path: PathBuf,
    /// Time the multiplexer gets to quit after a graceful stop before it is killed.
    pub kill_grace: Duration,
    pub max_parallel_downloads: usize,
    pub user_agent: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            max_request_attempts: 5,
            backoff_factor: Duration::from_secs(1),
            tls_retries: 1,
            max_playlist_redirects: 8,
            chunk_size: 1024 * 1024,
            ffmpeg_path: std::env::var_os("FFMPEG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("ffmpeg")),
            kill_grace: Duration::from_secs(5),
            max_parallel_downloads: 1,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

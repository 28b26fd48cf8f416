use std::error::Error as _;
use std::path::PathBuf;

use reqwest::StatusCode;

use crate::download::remux::Profile;

pub type Result<T, E = DownloadError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// Cooperative stop requested through the transfer state. Not a failure.
    #[error("download cancelled")]
    Cancelled,

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("unsupported file extension `{extension}`")]
    UnsupportedKind { extension: String },

    #[error("malformed playlist {url}: {reason}")]
    MalformedPlaylist { url: String, reason: String },

    #[error("gave up after {limit} master playlist redirects")]
    TooManyRedirects { limit: usize },

    #[error("{profile} merge failed with exit code {}: {detail}", fmt_code(.code))]
    MergeFailed {
        profile: Profile,
        code: Option<i32>,
        detail: String,
    },

    #[error("multiplexer `{}` is not usable: {source}", .program.display())]
    MuxerUnavailable {
        program: PathBuf,
        source: std::io::Error,
    },

    #[error("process supervision error: {reason}")]
    ProcessSupervision { reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

fn fmt_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none (killed by signal)".to_string(),
    }
}

impl DownloadError {
    pub fn invalid_url(input: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.to_string(),
        }
    }

    pub fn malformed(url: &url::Url, reason: impl Into<String>) -> Self {
        Self::MalformedPlaylist {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// True for transport failures raised by the TLS layer (handshake, certificate,
    /// record errors). reqwest does not classify these, so the source chain is inspected.
    pub fn is_tls(&self) -> bool {
        let Self::Network { source } = self else {
            return false;
        };

        let mut current: Option<&(dyn std::error::Error + 'static)> = source.source();
        while let Some(err) = current {
            let text = err.to_string().to_ascii_lowercase();
            if ["tls", "ssl", "certificate", "handshake"]
                .iter()
                .any(|needle| text.contains(needle))
            {
                return true;
            }
            current = err.source();
        }
        false
    }
}

mod console;
mod file;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use hlsgrab::{spawn_download, DownloadError, DownloadJob, Downloader, JobKind, Options, TransferOutcome};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, COOKIE};
use tokio::sync::Semaphore;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};
use url::Url;

use console::{ConsoleReporter, Controls};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Download error: {0}")]
    Download(#[from] DownloadError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Job file error: {0}")]
    JobFile(#[from] serde_json::Error),

    #[error("{failed} of {total} downloads failed")]
    Failed { failed: usize, total: usize },
}

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[clap(subcommand)]
    subcmd: SubCmd,

    #[clap(short, long, default_value = "1")]
    /// set the maximum number of jobs running at the same time
    parallel: usize,

    #[clap(short, long, default_value = "5")]
    /// set the number of attempts for requests answered with 500/502/503/504
    retries: u32,

    #[clap(long, default_value = "1")]
    /// set the number of extra attempts a segment gets after a TLS error
    tls_retries: u32,

    #[clap(long, default_value = "10")]
    /// set the connect and read timeout in seconds
    timeout: u64,

    #[clap(long)]
    /// path of the ffmpeg binary (defaults to $FFMPEG_PATH or `ffmpeg`)
    ffmpeg: Option<PathBuf>,

    #[clap(short = 'H', long = "header")]
    /// extra request header as `Name: value`, can be repeated
    headers: Vec<String>,

    #[clap(long)]
    /// cookie header sent with every request
    cookie: Option<String>,

    #[clap(short, long)]
    /// log debug output
    verbose: bool,

    #[clap(short, long)]
    /// only log errors
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum SubCmd {
    /// Download every entry of a json file
    File {
        #[clap(default_value = "download.json")]
        /// json array of { url, dir?, name, kind? } records
        file: PathBuf,

        #[clap(short, long, default_value = ".")]
        /// base directory the entries' `dir` is relative to
        dir: PathBuf,
    },
    /// Download a single video or playlist
    Download {
        #[clap(value_parser = url_parser)]
        /// provide a download link (.m3u8 playlist or .mp4 file)
        url: Url,

        /// provide an output name, `.mp4` is appended
        name: String,

        #[clap(short, long, default_value = ".")]
        /// directory for the output and intermediate files
        dir: PathBuf,

        #[clap(short, long, value_enum)]
        /// override the kind detected from the url
        kind: Option<KindArg>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Mp4,
    M3u8,
}

impl From<KindArg> for JobKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Mp4 => JobKind::DirectFile,
            KindArg::M3u8 => JobKind::Playlist,
        }
    }
}

fn url_parser(url: &str) -> Result<Url, String> {
    if !url.starts_with("http") {
        return Err("URL must start with http or https".to_string());
    }
    Url::parse(url).map_err(|err| err.to_string())
}

fn parse_headers(raw: &[String], cookie: Option<&str>) -> Result<HeaderMap, AppError> {
    let mut headers = HeaderMap::new();

    for line in raw {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| AppError::InvalidInput(format!("header `{line}` is not `Name: value`")))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|err| AppError::InvalidInput(format!("header name `{name}`: {err}")))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|err| AppError::InvalidInput(format!("header value for `{name}`: {err}")))?;
        headers.append(name, value);
    }

    if let Some(cookie) = cookie {
        let value = HeaderValue::from_str(cookie)
            .map_err(|err| AppError::InvalidInput(format!("cookie: {err}")))?;
        headers.insert(COOKIE, value);
    }

    Ok(headers)
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_level(verbose))
        .init();
}

async fn run_jobs(
    downloader: &Downloader,
    jobs: Vec<DownloadJob>,
    parallel: usize,
    controls: &Arc<Controls>,
) -> Result<(), AppError> {
    let semaphore = Arc::new(Semaphore::new(parallel.max(1)));
    let mut tasks = Vec::new();

    for job in jobs {
        if controls.is_cancelled() {
            break;
        }

        let output = job.output_path();
        if output.exists() {
            println!("File {} already exists, therefore skipping download", output.display());
            continue;
        }

        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };

        info!("Downloading {} to {}", job.source_url, output.display());
        let reporter = Arc::new(ConsoleReporter::new(job.output_name.clone()));
        let downloader = Arc::new(downloader.clone().with_reporter(reporter));
        let state = controls.register(&job.output_name);
        let url = job.source_url.clone();
        let handle = spawn_download(downloader, job, state);

        tasks.push(tokio::spawn(async move {
            let result = handle.await;
            drop(permit);
            (url, result)
        }));
    }

    let total = tasks.len();
    let mut failed = 0;
    for task in tasks {
        match task.await {
            Ok((url, Ok(Ok(TransferOutcome::Completed(path))))) => {
                info!("Finished downloading {} to {}", url, path.display());
            }
            Ok((url, Ok(Ok(TransferOutcome::NothingToMerge)))) => {
                warn!("Playlist {} has no segments, nothing downloaded", url);
            }
            Ok((url, Ok(Err(DownloadError::Cancelled)))) => {
                info!("Download of {} cancelled", url);
            }
            Ok((url, Ok(Err(err)))) => {
                error!("Error downloading {}: {}", url, err);
                failed += 1;
            }
            Ok((url, Err(err))) => {
                error!("Error waiting for download of {}: {}", url, err);
                failed += 1;
            }
            Err(err) => {
                error!("Error waiting for task: {}", err);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        return Err(AppError::Failed { failed, total });
    }
    Ok(())
}

async fn run(args: Args) -> Result<(), AppError> {
    let mut options = Options {
        request_timeout: Duration::from_secs(args.timeout),
        max_request_attempts: args.retries,
        tls_retries: args.tls_retries,
        max_parallel_downloads: args.parallel,
        ..Options::default()
    };
    if let Some(ffmpeg) = args.ffmpeg {
        options.ffmpeg_path = ffmpeg;
    }

    let headers = parse_headers(&args.headers, args.cookie.as_deref())?;
    let downloader = Downloader::new(options.clone(), headers)?;

    let version = downloader.muxer().probe().await?;
    info!("Using {}", version);

    let jobs = match args.subcmd {
        SubCmd::File { file, dir } => {
            let jobs = file::load_jobs(&file, &dir)?;
            info!("Read {} jobs from {}", jobs.len(), file.display());
            jobs
        }
        SubCmd::Download { url, name, dir, kind } => {
            vec![file::make_job(url, &dir, None, &name, kind.map(JobKind::from))?]
        }
    };

    let controls = Controls::new();
    controls.listen();
    info!("Commands: p = pause, r = resume, c = cancel, s = status");

    run_jobs(&downloader, jobs, options.max_parallel_downloads, &controls).await
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

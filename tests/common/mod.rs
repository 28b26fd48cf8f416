//! Local HTTP server and a fake multiplexer for integration tests (no external network,
//! no real ffmpeg).

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{Response, StatusCode},
    Router,
};
use bytes::Bytes;
use futures::StreamExt;
use hlsgrab::Options;
use tokio::net::TcpListener;
use url::Url;

#[derive(Clone)]
struct Reply {
    status: StatusCode,
    body: Bytes,
    /// Send `body`, then keep the response open without sending more.
    stall: bool,
}

#[derive(Default)]
struct Routes {
    /// Replies per path, served in order. The last one repeats.
    replies: HashMap<String, Vec<Reply>>,
    request_counts: HashMap<String, usize>,
}

/// Test server serving playlists and segments from memory.
pub struct TestServer {
    base_url: String,
    routes: Arc<Mutex<Routes>>,
}

impl TestServer {
    pub async fn new() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://127.0.0.1:{}", addr.port());

        let routes = Arc::new(Mutex::new(Routes::default()));
        let app = Router::new().fallback(serve).with_state(Arc::clone(&routes));

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, routes }
    }

    pub fn url(&self, path: &str) -> Url {
        Url::parse(&format!("{}{}", self.base_url, path)).unwrap()
    }

    /// Serve `body` with 200 at `path`.
    pub fn add(&self, path: &str, body: impl Into<Bytes>) {
        self.add_sequence(path, vec![(StatusCode::OK, body.into())]);
    }

    /// Serve the given replies in order, repeating the last one.
    pub fn add_sequence(&self, path: &str, replies: Vec<(StatusCode, Bytes)>) {
        let replies = replies
            .into_iter()
            .map(|(status, body)| Reply {
                status,
                body,
                stall: false,
            })
            .collect();
        self.routes
            .lock()
            .unwrap()
            .replies
            .insert(path.to_string(), replies);
    }

    /// Serve `head` with 200 at `path` and never finish the body.
    pub fn add_stalled(&self, path: &str, head: impl Into<Bytes>) {
        let reply = Reply {
            status: StatusCode::OK,
            body: head.into(),
            stall: true,
        };
        self.routes
            .lock()
            .unwrap()
            .replies
            .insert(path.to_string(), vec![reply]);
    }

    pub fn request_count(&self, path: &str) -> usize {
        self.routes
            .lock()
            .unwrap()
            .request_counts
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    /// A media playlist at `path` listing `count` segments `seg{i}.ts` next to it,
    /// each `segment_len` bytes long. Returns the total size of all segments.
    pub fn add_media_playlist(&self, path: &str, count: usize, segment_len: usize) -> u64 {
        let dir = path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
        let mut text = String::from("#EXTM3U\n#EXT-X-TARGETDURATION:2\n");
        for i in 0..count {
            text.push_str("#EXTINF:2.0,\n");
            text.push_str(&format!("seg{i}.ts\n"));
            self.add(&format!("{dir}/seg{i}.ts"), vec![i as u8; segment_len]);
        }
        text.push_str("#EXT-X-ENDLIST\n");
        self.add(path, text);
        (count * segment_len) as u64
    }
}

async fn serve(State(routes): State<Arc<Mutex<Routes>>>, req: Request) -> Response<Body> {
    let path = req.uri().path().to_string();
    let mut routes = routes.lock().unwrap();
    let count = {
        let count = routes.request_counts.entry(path.clone()).or_insert(0);
        *count += 1;
        *count
    };

    let reply = routes
        .replies
        .get(&path)
        .and_then(|replies| replies.get(count - 1).or(replies.last()).cloned());

    match reply {
        Some(reply) if reply.stall => {
            let head = futures::stream::iter([Ok::<_, std::io::Error>(reply.body)]);
            Response::builder()
                .status(reply.status)
                .body(Body::from_stream(head.chain(futures::stream::pending())))
                .unwrap()
        }
        Some(reply) => Response::builder()
            .status(reply.status)
            .header("Content-Length", reply.body.len().to_string())
            .body(Body::from(reply.body))
            .unwrap(),
        None => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .unwrap(),
    }
}

/// Options suited to tests: short backoff and grace period, the given multiplexer.
pub fn test_options(ffmpeg: &Path) -> Options {
    Options {
        request_timeout: Duration::from_secs(5),
        backoff_factor: Duration::from_millis(10),
        kill_grace: Duration::from_millis(200),
        ffmpeg_path: ffmpeg.to_path_buf(),
        ..Options::default()
    }
}

/// How the fake multiplexer behaves.
#[derive(Debug, Clone, Copy)]
pub struct FakeMuxer {
    pub copy_exit: i32,
    pub reencode_exit: i32,
    /// Block (ignoring `q` on stdin) instead of finishing.
    pub hang: bool,
}

impl Default for FakeMuxer {
    fn default() -> Self {
        Self {
            copy_exit: 0,
            reencode_exit: 0,
            hang: false,
        }
    }
}

/// Fake ffmpeg written as a shell script into `dir`.
///
/// Every merge invocation appends its mode (`copy` or `reencode`) to `calls.log` in
/// `dir`. On success the last argument (the output) is written.
pub struct FakeFfmpeg {
    pub program: PathBuf,
    log: PathBuf,
}

impl FakeFfmpeg {
    #[cfg(unix)]
    pub fn install(dir: &Path, behaviour: FakeMuxer) -> Self {
        use std::os::unix::fs::PermissionsExt;

        let program = dir.join("fake-ffmpeg.sh");
        let log = dir.join("calls.log");
        let hang = if behaviour.hang { "exec sleep 30" } else { "" };
        let script = format!(
            r#"#!/bin/sh
mode=reencode
for arg in "$@"; do
  if [ "$arg" = "-version" ]; then echo "ffmpeg version fake"; exit 0; fi
  if [ "$arg" = "copy" ]; then mode=copy; fi
done
echo "$mode" >> "{log}"
{hang}
if [ "$mode" = copy ]; then code={copy}; else code={reencode}; fi
if [ "$code" != 0 ]; then echo "fake $mode failure" >&2; exit "$code"; fi
for last in "$@"; do :; done
printf merged > "$last"
"#,
            log = log.display(),
            copy = behaviour.copy_exit,
            reencode = behaviour.reencode_exit,
        );

        std::fs::write(&program, script).unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();
        Self { program, log }
    }

    /// Modes of the merge invocations so far, in order.
    pub fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(&self.log)
            .map(|text| text.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

/// Names of the files directly inside `dir`, sorted.
pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    names.sort();
    names
}

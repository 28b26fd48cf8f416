use std::path::{Path, PathBuf};

use hlsgrab::{DownloadJob, JobKind};
use serde::Deserialize;
use url::Url;

use crate::AppError;

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct DownloadEntity {
    url: String,
    /// Target directory, relative entries are taken relative to the base directory.
    #[serde(default)]
    dir: Option<PathBuf>,
    name: String,
    #[serde(default)]
    kind: Option<JobKind>,
}

/// Replace characters most filesystems reject and trim stray spaces and dots.
pub fn sanitize_file_name(name: &str) -> String {
    let replaced = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c => c,
        })
        .collect::<String>();

    replaced.trim_matches(|c| c == ' ' || c == '.').to_string()
}

pub fn make_job(
    url: Url,
    base_dir: &Path,
    dir: Option<&Path>,
    name: &str,
    kind: Option<JobKind>,
) -> Result<DownloadJob, AppError> {
    let kind = match kind {
        Some(kind) => kind,
        None => JobKind::from_url(&url)?,
    };

    let output_name = sanitize_file_name(name);
    if output_name.is_empty() {
        return Err(AppError::InvalidInput(format!("unusable output name `{name}`")));
    }

    let target_dir = match dir {
        Some(dir) => base_dir.join(dir),
        None => base_dir.to_path_buf(),
    };

    Ok(DownloadJob::new(url, target_dir, output_name, kind))
}

fn parse_jobs(content: &str, base_dir: &Path) -> Result<Vec<DownloadJob>, AppError> {
    let downloads: Vec<DownloadEntity> = serde_json::from_str(content)?;

    downloads
        .into_iter()
        .map(|download| {
            let url = Url::parse(&download.url).map_err(|err| {
                AppError::InvalidInput(format!("invalid url `{}`: {err}", download.url))
            })?;
            make_job(url, base_dir, download.dir.as_deref(), &download.name, download.kind)
        })
        .collect()
}

/// Read a JSON array of `{ url, dir?, name, kind? }` records.
pub fn load_jobs(file: &Path, base_dir: &Path) -> Result<Vec<DownloadJob>, AppError> {
    let content = std::fs::read_to_string(file).map_err(|err| {
        AppError::InvalidInput(format!("error opening file ({}): {err}", file.display()))
    })?;
    parse_jobs(&content, base_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_reserved_characters() {
        assert_eq!(sanitize_file_name("a/b:c*d?"), "a_b_c_d_");
        assert_eq!(sanitize_file_name("  .hidden title.. "), "hidden title");
        assert_eq!(sanitize_file_name("plain"), "plain");
    }

    #[test]
    fn jobs_from_json() {
        let content = r#"[
            { "url": "https://h/a/master.m3u8", "dir": "user/2024-05", "name": "Title: one" },
            { "url": "https://h/b/clip.mp4", "name": "clip" },
            { "url": "https://h/c/stream?id=1", "name": "forced", "kind": "m3u8" }
        ]"#;
        let jobs = parse_jobs(content, Path::new("/data")).unwrap();

        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[0].kind, JobKind::Playlist);
        assert_eq!(jobs[0].output_name, "Title_ one");
        assert_eq!(jobs[0].target_dir, PathBuf::from("/data/user/2024-05"));
        assert_eq!(jobs[1].kind, JobKind::DirectFile);
        assert_eq!(jobs[1].target_dir, PathBuf::from("/data"));
        assert_eq!(jobs[2].kind, JobKind::Playlist);
    }

    #[test]
    fn unknown_extension_without_kind_is_rejected() {
        let content = r#"[{ "url": "https://h/page.html", "name": "x" }]"#;
        let err = parse_jobs(content, Path::new(".")).unwrap_err();
        assert!(matches!(err, AppError::Download(_)));
    }

    #[test]
    fn empty_name_is_rejected() {
        let err = make_job(
            Url::parse("https://h/a.mp4").unwrap(),
            Path::new("."),
            None,
            " .. ",
            None,
        )
        .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }
}

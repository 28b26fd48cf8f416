use reqwest::header::HeaderMap;
use tracing::{debug, info};
use url::Url;

use crate::download::DownloadClient;
use crate::error::{DownloadError, Result};

pub const STREAM_INF: &str = "#EXT-X-STREAM-INF";

/// Playlist text together with the URL it was fetched from.
#[derive(Debug, Clone)]
pub struct PlaylistDocument {
    pub url: Url,
    pub text: String,
}

/// What a single document turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// Master playlist; holds the first listed rendition.
    Master(Url),
    /// Media playlist; segment URIs in playback order.
    Media(Vec<Url>),
}

/// Ordered segment URIs. Index is identity, duplicates are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentList(Vec<Url>);

impl SegmentList {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Url> {
        self.0.iter()
    }
}

impl From<Vec<Url>> for SegmentList {
    fn from(segments: Vec<Url>) -> Self {
        Self(segments)
    }
}

#[derive(Debug)]
pub struct Resolved {
    pub segments: SegmentList,
    /// Every document fetched on the way, master first.
    pub documents: Vec<PlaylistDocument>,
}

fn resolve_reference(base: &Url, reference: &str) -> Result<Url> {
    match Url::parse(reference) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => base
            .join(reference)
            .map_err(|err| DownloadError::invalid_url(reference, err)),
        Err(err) => Err(DownloadError::invalid_url(reference, err)),
    }
}

impl PlaylistDocument {
    pub fn new(url: Url, text: impl Into<String>) -> Self {
        Self {
            url,
            text: text.into(),
        }
    }

    /// Last path component of the playlist URL, used for the diagnostic copy on disk.
    pub fn file_name(&self) -> String {
        self.url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .unwrap_or("playlist.m3u8")
            .to_string()
    }

    pub fn parse(&self) -> Result<Parsed> {
        let lines = self
            .text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<&str>>();

        if let Some(i) = lines.iter().position(|line| line.starts_with(STREAM_INF)) {
            let uri = match lines.get(i + 1) {
                Some(uri) if !uri.starts_with('#') => uri,
                Some(_) => {
                    return Err(DownloadError::malformed(
                        &self.url,
                        "rendition marker is followed by another tag",
                    ))
                }
                None => {
                    return Err(DownloadError::malformed(
                        &self.url,
                        "rendition marker without a URI line",
                    ))
                }
            };
            return Ok(Parsed::Master(resolve_reference(&self.url, uri)?));
        }

        let segments = lines
            .into_iter()
            .filter(|line| !line.starts_with('#'))
            .map(|line| resolve_reference(&self.url, line))
            .collect::<Result<Vec<_>>>()?;

        Ok(Parsed::Media(segments))
    }
}

pub struct PlaylistResolver<'a> {
    client: &'a DownloadClient,
    headers: &'a HeaderMap,
    max_redirects: usize,
}

impl<'a> PlaylistResolver<'a> {
    pub fn new(client: &'a DownloadClient, headers: &'a HeaderMap, max_redirects: usize) -> Self {
        Self {
            client,
            headers,
            max_redirects,
        }
    }

    /// Follow master playlists (first rendition only) until a media playlist is reached.
    pub async fn resolve(&self, playlist_url: &Url) -> Result<Resolved> {
        let mut documents = Vec::new();
        let mut url = playlist_url.clone();

        loop {
            let text = self.client.get_text(&url, self.headers).await?;
            let document = PlaylistDocument::new(url.clone(), text);
            let parsed = document.parse()?;
            documents.push(document);

            match parsed {
                Parsed::Master(rendition) => {
                    if documents.len() > self.max_redirects {
                        return Err(DownloadError::TooManyRedirects {
                            limit: self.max_redirects,
                        });
                    }
                    info!(from = %url, to = %rendition, "Following first rendition of master playlist");
                    url = rendition;
                }
                Parsed::Media(segments) => {
                    debug!(%url, segments = segments.len(), "Parsed media playlist");
                    return Ok(Resolved {
                        segments: segments.into(),
                        documents,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(url: &str, text: &str) -> PlaylistDocument {
        PlaylistDocument::new(Url::parse(url).unwrap(), text)
    }

    #[test]
    fn media_playlist_keeps_order_and_resolves_relative() {
        let text = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n\n#EXTINF:10.0,\n  seg0.ts  \n#EXTINF:10.0,\nsub/seg1.ts\n#EXTINF:10.0,\nhttps://cdn.example/seg2.ts\n#EXTINF:10.0,\nseg0.ts\n#EXT-X-ENDLIST\n";
        let parsed = doc("https://h/a/index.m3u8?token=1", text).parse().unwrap();

        let expected = [
            "https://h/a/seg0.ts",
            "https://h/a/sub/seg1.ts",
            "https://cdn.example/seg2.ts",
            "https://h/a/seg0.ts",
        ]
        .iter()
        .map(|u| Url::parse(u).unwrap())
        .collect::<Vec<_>>();
        assert_eq!(parsed, Parsed::Media(expected));
    }

    #[test]
    fn master_selects_first_rendition() {
        let text = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=2000000\n720p.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=5000000\n1080p.m3u8\n";
        let parsed = doc("https://h/a/master.m3u8", text).parse().unwrap();
        assert_eq!(
            parsed,
            Parsed::Master(Url::parse("https://h/a/720p.m3u8").unwrap())
        );
    }

    #[test]
    fn master_keeps_absolute_rendition() {
        let text = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\nhttps://other/x/low.m3u8\n";
        let parsed = doc("https://h/a/master.m3u8", text).parse().unwrap();
        assert_eq!(
            parsed,
            Parsed::Master(Url::parse("https://other/x/low.m3u8").unwrap())
        );
    }

    #[test]
    fn marker_without_uri_is_malformed() {
        let err = doc("https://h/a/master.m3u8", "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\n\n")
            .parse()
            .unwrap_err();
        assert!(matches!(err, DownloadError::MalformedPlaylist { .. }));

        let err = doc(
            "https://h/a/master.m3u8",
            "#EXT-X-STREAM-INF:BANDWIDTH=1\n#EXT-X-STREAM-INF:BANDWIDTH=2\nlow.m3u8\n",
        )
        .parse()
        .unwrap_err();
        assert!(matches!(err, DownloadError::MalformedPlaylist { .. }));
    }

    #[test]
    fn empty_media_playlist_is_valid() {
        let parsed = doc("https://h/a/index.m3u8", "#EXTM3U\n#EXT-X-ENDLIST\n")
            .parse()
            .unwrap();
        assert_eq!(parsed, Parsed::Media(Vec::new()));
    }

    #[test]
    fn file_name_is_last_path_component() {
        assert_eq!(doc("https://h/a/index.m3u8?x=1", "").file_name(), "index.m3u8");
        assert_eq!(doc("https://h/", "").file_name(), "playlist.m3u8");
    }
}

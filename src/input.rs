//! Video acquisition
//!
//! Produces a `VideoBlob` either from a local file or by downloading a URL.
//! Validation happens here, before anything reaches the conversation.

use crate::config::AnalysisSettings;
use crate::encoder::VideoBlob;
use crate::error::ChatError;
use anyhow::Context;
use futures_util::{Stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use std::path::Path;
use tracing::{info, instrument, warn};
use url::Url;

/// Filename used when the URL path has no usable last segment
const DEFAULT_URL_FILENAME: &str = "video_from_url.mp4";

const FETCH_HINT: &str = "This might be due to a network issue or the server refusing direct downloads. Please ensure the URL is a direct, publicly accessible link to a video file.";

/// Map a file extension to its video content type
pub(crate) fn video_mime_for(path: &str) -> Option<&'static str> {
    let extension = Path::new(path).extension()?.to_str()?.to_ascii_lowercase();
    let mime = match extension.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mov" | "qt" => "video/quicktime",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "mpeg" | "mpg" => "video/mpeg",
        "3gp" => "video/3gpp",
        "ogv" => "video/ogg",
        "wmv" => "video/x-ms-wmv",
        "flv" => "video/x-flv",
        _ => return None,
    };
    Some(mime)
}

fn too_large(size: u64, max: u64) -> ChatError {
    ChatError::Validation(format!(
        "The video is too large ({:.1} MB). The maximum supported size is {:.1} MB.",
        size as f64 / 1_048_576.0,
        max as f64 / 1_048_576.0
    ))
}

/// Validate a local file and wrap it as a blob. The bytes are read later by
/// the encoder.
#[instrument(skip(settings))]
pub(crate) async fn video_from_file(
    path: &Path,
    settings: &AnalysisSettings,
) -> Result<VideoBlob, ChatError> {
    let mime_type = video_mime_for(&path.to_string_lossy())
        .ok_or_else(|| ChatError::Validation("Please select a valid video file.".to_string()))?;

    let metadata = tokio::fs::metadata(path).await.map_err(|e| {
        ChatError::Validation(format!("Cannot open {}: {}", path.display(), e))
    })?;
    if !metadata.is_file() {
        return Err(ChatError::Validation(format!(
            "{} is not a file.",
            path.display()
        )));
    }
    if metadata.len() > settings.max_inline_bytes {
        return Err(too_large(metadata.len(), settings.max_inline_bytes));
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    info!(name = %name, mime_type, bytes = metadata.len(), "Selected local video");
    Ok(VideoBlob::from_file(name, mime_type, metadata.len(), path.to_path_buf()))
}

/// Validate a user-entered URL
pub(crate) fn parse_video_url(raw: &str) -> Result<Url, ChatError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ChatError::Validation("Please enter a video URL.".to_string()));
    }

    let url = Url::parse(trimmed)
        .map_err(|e| ChatError::Validation(format!("Invalid URL '{}': {}", trimmed, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ChatError::Validation(format!(
            "Unsupported URL scheme '{}'. Use a direct http(s) link.",
            other
        ))),
    }
}

/// Downloads videos from direct links
pub(crate) struct VideoFetcher {
    client: reqwest::Client,
    max_bytes: u64,
}

impl VideoFetcher {
    pub(crate) fn new(settings: &AnalysisSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.fetch_timeout())
            .build()
            .context("Failed to create HTTP client for VideoFetcher")?;

        Ok(Self {
            client,
            max_bytes: settings.max_inline_bytes,
        })
    }

    /// Fetch a URL into an in-memory blob.
    ///
    /// The response must be a video: a `video/*` content type, or a generic
    /// binary type with a video file extension in the URL.
    #[instrument(skip(self, url), fields(url = %url))]
    pub(crate) async fn fetch(&self, url: &Url) -> Result<VideoBlob, ChatError> {
        let response = self.client.get(url.clone()).send().await.map_err(|e| {
            warn!(error = %e, "Video download failed");
            let mut message = format!("{}.", e);
            if e.is_connect() || e.is_timeout() {
                message.push(' ');
                message.push_str(FETCH_HINT);
            }
            ChatError::Fetch(message)
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChatError::Fetch(format!(
                "HTTP error! status: {}.",
                status.as_u16()
            )));
        }

        if let Some(length) = response.content_length() {
            if length > self.max_bytes {
                return Err(too_large(length, self.max_bytes));
            }
        }

        let declared = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or("").trim().to_ascii_lowercase());
        let mime_type = resolve_content_type(declared.as_deref(), url.path())?;

        let bytes = collect_limited(response.bytes_stream(), self.max_bytes).await?;

        let name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_URL_FILENAME)
            .to_string();

        info!(name = %name, mime_type = %mime_type, bytes = bytes.len(), "Downloaded video");
        Ok(VideoBlob::from_bytes(name, mime_type, bytes))
    }
}

/// Read a body chunk by chunk, giving up as soon as it exceeds `max_bytes`.
/// Bodies without a Content-Length are only bounded here.
async fn collect_limited<S, C, E>(body: S, max_bytes: u64) -> Result<Vec<u8>, ChatError>
where
    S: Stream<Item = Result<C, E>>,
    C: AsRef<[u8]>,
    E: std::fmt::Display,
{
    futures_util::pin_mut!(body);
    let mut bytes = Vec::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| ChatError::Fetch(format!("{}.", e)))?;
        let received = bytes.len() as u64 + chunk.as_ref().len() as u64;
        if received > max_bytes {
            warn!(received, max_bytes, "Download exceeded the size limit, aborting");
            return Err(too_large(received, max_bytes));
        }
        bytes.extend_from_slice(chunk.as_ref());
    }
    Ok(bytes)
}

/// Decide the content type of a downloaded video
fn resolve_content_type(declared: Option<&str>, url_path: &str) -> Result<String, ChatError> {
    match declared {
        Some(mime) if mime.starts_with("video/") => Ok(mime.to_string()),
        None | Some("") | Some("application/octet-stream") | Some("binary/octet-stream") => {
            video_mime_for(url_path).map(str::to_string).ok_or_else(|| {
                ChatError::Validation(
                    "The URL did not identify itself as a video. Please use a direct link to a video file.".to_string(),
                )
            })
        }
        Some(other) => Err(ChatError::Validation(format!(
            "The URL returned '{}' instead of a video. Please use a direct link to a video file.",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::task::Poll;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings() -> AnalysisSettings {
        AnalysisSettings {
            max_inline_bytes: 1024,
            fetch_timeout_secs: 5,
        }
    }

    #[test]
    fn test_video_mime_for() {
        assert_eq!(video_mime_for("clip.MP4"), Some("video/mp4"));
        assert_eq!(video_mime_for("/a/b/c.webm"), Some("video/webm"));
        assert_eq!(video_mime_for("notes.txt"), None);
        assert_eq!(video_mime_for("no_extension"), None);
    }

    #[test]
    fn test_parse_video_url() {
        assert!(matches!(parse_video_url("   "), Err(ChatError::Validation(_))));
        assert!(matches!(
            parse_video_url("not a url"),
            Err(ChatError::Validation(_))
        ));
        assert!(matches!(
            parse_video_url("ftp://example.com/v.mp4"),
            Err(ChatError::Validation(_))
        ));
        let url = parse_video_url(" https://example.com/v.mp4 ").unwrap();
        assert_eq!(url.path(), "/v.mp4");
    }

    #[test]
    fn test_resolve_content_type() {
        assert_eq!(resolve_content_type(Some("video/webm"), "/x").unwrap(), "video/webm");
        assert_eq!(
            resolve_content_type(Some("application/octet-stream"), "/clip.mov").unwrap(),
            "video/quicktime"
        );
        assert_eq!(resolve_content_type(None, "/clip.mp4").unwrap(), "video/mp4");
        assert!(resolve_content_type(Some("text/html"), "/clip.mp4").is_err());
        assert!(resolve_content_type(None, "/page").is_err());
    }

    #[tokio::test]
    async fn test_collect_limited_stops_at_limit() {
        let chunks: Vec<Result<Vec<u8>, String>> = vec![Ok(vec![0u8; 600]), Ok(vec![0u8; 600])];
        // Nothing past the chunk that crosses the limit may be polled
        let body = futures_util::stream::iter(chunks).chain(futures_util::stream::poll_fn(
            |_| -> Poll<Option<Result<Vec<u8>, String>>> {
                panic!("body polled after the limit was exceeded")
            },
        ));

        let err = collect_limited(body, 1024).await.unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn test_collect_limited_joins_chunks() {
        let chunks: Vec<Result<&[u8], String>> = vec![Ok(&b"abc"[..]), Ok(&b"def"[..])];
        let bytes = collect_limited(futures_util::stream::iter(chunks), 6)
            .await
            .unwrap();
        assert_eq!(bytes, b"abcdef");

        let failing: Vec<Result<&[u8], String>> = vec![Ok(&b"abc"[..]), Err("reset by peer".to_string())];
        assert!(matches!(
            collect_limited(futures_util::stream::iter(failing), 6).await,
            Err(ChatError::Fetch(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_rejects_oversized_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(vec![0u8; 4096], "video/mp4"))
            .mount(&server)
            .await;

        let fetcher = VideoFetcher::new(&settings()).unwrap();
        let url = Url::parse(&format!("{}/big.mp4", server.uri())).unwrap();
        let err = fetcher.fetch(&url).await.unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn test_video_from_file() {
        let mut file = tempfile::Builder::new().suffix(".mp4").tempfile().unwrap();
        file.write_all(&[0u8; 64]).unwrap();

        let blob = video_from_file(file.path(), &settings()).await.unwrap();
        assert_eq!(blob.mime_type, "video/mp4");
        assert_eq!(blob.size, 64);
        assert!(blob.name.ends_with(".mp4"));
    }

    #[tokio::test]
    async fn test_video_from_file_rejections() {
        let text = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        let err = video_from_file(text.path(), &settings()).await.unwrap_err();
        assert_eq!(
            err,
            ChatError::Validation("Please select a valid video file.".to_string())
        );

        let missing = Path::new("/definitely/not/here/clip.mp4");
        assert!(matches!(
            video_from_file(missing, &settings()).await,
            Err(ChatError::Validation(_))
        ));

        let mut big = tempfile::Builder::new().suffix(".mp4").tempfile().unwrap();
        big.write_all(&[0u8; 2048]).unwrap();
        let err = video_from_file(big.path(), &settings()).await.unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn test_fetch_video() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/clips/crossing.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(vec![1u8, 2, 3], "video/mp4"))
            .mount(&server)
            .await;

        let fetcher = VideoFetcher::new(&settings()).unwrap();
        let url = Url::parse(&format!("{}/clips/crossing.mp4", server.uri())).unwrap();
        let blob = fetcher.fetch(&url).await.unwrap();
        assert_eq!(blob.name, "crossing.mp4");
        assert_eq!(blob.mime_type, "video/mp4");
        assert_eq!(blob.size, 3);
    }

    #[tokio::test]
    async fn test_fetch_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = VideoFetcher::new(&settings()).unwrap();
        let url = Url::parse(&format!("{}/missing.mp4", server.uri())).unwrap();
        let err = fetcher.fetch(&url).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error fetching video from URL: HTTP error! status: 404."
        );
    }

    #[tokio::test]
    async fn test_fetch_rejects_non_video() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("<html></html>", "text/html"))
            .mount(&server)
            .await;

        let fetcher = VideoFetcher::new(&settings()).unwrap();
        let url = Url::parse(&format!("{}/watch", server.uri())).unwrap();
        assert!(matches!(
            fetcher.fetch(&url).await,
            Err(ChatError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_unreachable_includes_hint() {
        let fetcher = VideoFetcher::new(&settings()).unwrap();
        let url = Url::parse("http://127.0.0.1:9/clip.mp4").unwrap();
        let err = fetcher.fetch(&url).await.unwrap_err();
        assert!(matches!(err, ChatError::Fetch(_)));
        assert!(err.to_string().contains("publicly accessible"));
    }
}

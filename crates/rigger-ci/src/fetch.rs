//! Artifact retrieval and verification.
//!
//! Each artifact is retrieved exactly once. Results stay in memory; nothing
//! reaches disk until the stager promotes it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::artifact::ArtifactSpec;
use crate::error::{CiError, Result};
use crate::obs;

/// Outcome of a single retrieval.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Ok,
    NotFound,
    TransportError,
    DigestMismatch,
}

/// Bytes (or failure) for one artifact. Consumed once by the stager.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub spec: ArtifactSpec,
    pub bytes: Vec<u8>,
    pub status: FetchStatus,
    pub error: Option<String>,
}

impl FetchResult {
    pub fn is_ok(&self) -> bool {
        self.status == FetchStatus::Ok
    }

    fn failed(spec: &ArtifactSpec, err: &CiError) -> Self {
        let status = match err {
            CiError::NotFound { .. } => FetchStatus::NotFound,
            CiError::DigestMismatch { .. } => FetchStatus::DigestMismatch,
            _ => FetchStatus::TransportError,
        };
        Self {
            spec: spec.clone(),
            bytes: Vec::new(),
            status,
            error: Some(err.to_string()),
        }
    }
}

/// A content source addressable by URL.
///
/// Contract: return the full body, or `CiError::NotFound` / `CiError::Transport`.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn get(&self, url: &str) -> Result<Vec<u8>>;
}

/// Source serving `http(s)://` through reqwest and `file://` from local disk.
pub struct UrlSource {
    http_client: reqwest::Client,
}

impl UrlSource {
    pub fn new() -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("rigger/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CiError::config(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { http_client })
    }

    async fn get_http(&self, url: reqwest::Url) -> Result<Vec<u8>> {
        let shown = url.to_string();
        let transport = |reason: String| CiError::Transport {
            url: shown.clone(),
            reason,
        };

        let response = self
            .http_client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| transport(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(CiError::NotFound { url: shown.clone() });
        }
        if !status.is_success() {
            return Err(transport(format!("HTTP {}", status)));
        }

        let body = response.bytes().await.map_err(|e| transport(e.to_string()))?;
        Ok(body.to_vec())
    }

    async fn get_file(&self, url: &str, path: &std::path::Path) -> Result<Vec<u8>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CiError::NotFound {
                url: url.to_string(),
            }),
            Err(e) => Err(CiError::Transport {
                url: url.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

#[async_trait]
impl ArtifactSource for UrlSource {
    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        let transport = |reason: String| CiError::Transport {
            url: url.to_string(),
            reason,
        };
        let parsed = reqwest::Url::parse(url).map_err(|e| transport(format!("invalid URL: {}", e)))?;

        // Schemes come back lowercased from the parser.
        match parsed.scheme() {
            "file" => {
                let path = parsed
                    .to_file_path()
                    .map_err(|()| transport("not a local file path".to_string()))?;
                self.get_file(url, &path).await
            }
            "http" | "https" => self.get_http(parsed).await,
            other => Err(transport(format!("unsupported URL scheme '{}'", other))),
        }
    }
}

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Retrieves artifacts from a source, applying timeout and digest checks.
#[derive(Clone)]
pub struct ArtifactFetcher {
    source: Arc<dyn ArtifactSource>,
    timeout: Option<Duration>,
    verify_digests: bool,
}

impl ArtifactFetcher {
    pub fn new(source: Arc<dyn ArtifactSource>) -> Self {
        Self {
            source,
            timeout: None,
            verify_digests: true,
        }
    }

    /// Fail retrievals that take longer than `secs` (0 disables).
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = (secs > 0).then(|| Duration::from_secs(secs));
        self
    }

    pub fn with_verification(mut self, verify_digests: bool) -> Self {
        self.verify_digests = verify_digests;
        self
    }

    /// Retrieve one artifact. Never retries.
    pub async fn fetch(&self, spec: &ArtifactSpec) -> FetchResult {
        let start = Instant::now();
        let result = self.retrieve(spec).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(bytes) => {
                obs::emit_artifact_fetched(spec, bytes.len(), duration_ms);
                FetchResult {
                    spec: spec.clone(),
                    bytes,
                    status: FetchStatus::Ok,
                    error: None,
                }
            }
            Err(e) => {
                obs::emit_artifact_fetch_failed(spec, &e);
                FetchResult::failed(spec, &e)
            }
        }
    }

    /// Retrieve all artifacts of a job concurrently, preserving input order.
    pub async fn fetch_all(&self, specs: &[ArtifactSpec]) -> Vec<FetchResult> {
        join_all(specs.iter().map(|spec| self.fetch(spec))).await
    }

    async fn retrieve(&self, spec: &ArtifactSpec) -> Result<Vec<u8>> {
        let url = spec.source_url.as_str();
        debug!(url = %url, artifact = %spec.name, "Fetching artifact");

        let bytes = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.source.get(url))
                .await
                .map_err(|_| CiError::Transport {
                    url: url.to_string(),
                    reason: format!("timed out after {} seconds", limit.as_secs()),
                })??,
            None => self.source.get(url).await?,
        };

        if bytes.is_empty() {
            return Err(CiError::Transport {
                url: url.to_string(),
                reason: "empty response body".to_string(),
            });
        }

        if self.verify_digests {
            if let Some(expected) = &spec.sha256 {
                let actual = sha256_hex(&bytes);
                if !actual.eq_ignore_ascii_case(expected) {
                    return Err(CiError::DigestMismatch {
                        url: url.to_string(),
                        expected: expected.clone(),
                        actual,
                    });
                }
            }
        }

        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactKind;
    use std::path::PathBuf;

    fn spec(url: &str) -> ArtifactSpec {
        ArtifactSpec {
            kind: ArtifactKind::NativeDependency,
            name: "libsodium".to_string(),
            source_url: url.to_string(),
            destination_path: PathBuf::from("/unused"),
            triple: "t1".to_string(),
            sha256: None,
        }
    }

    fn fetcher() -> ArtifactFetcher {
        ArtifactFetcher::new(Arc::new(UrlSource::new().expect("client")))
    }

    #[tokio::test]
    async fn test_http_ok() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/libsodium.a")
            .with_status(200)
            .with_body("archive-bytes")
            .create_async()
            .await;

        let result = fetcher()
            .fetch(&spec(&format!("{}/libsodium.a", server.url())))
            .await;
        assert!(result.is_ok());
        assert_eq!(result.bytes, b"archive-bytes");
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_http_404_is_not_found() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/missing")
            .with_status(404)
            .create_async()
            .await;

        let result = fetcher().fetch(&spec(&format!("{}/missing", server.url()))).await;
        assert_eq!(result.status, FetchStatus::NotFound);
        assert!(result.bytes.is_empty());
    }

    #[tokio::test]
    async fn test_http_500_is_transport_error() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/broken")
            .with_status(500)
            .create_async()
            .await;

        let result = fetcher().fetch(&spec(&format!("{}/broken", server.url()))).await;
        assert_eq!(result.status, FetchStatus::TransportError);
        assert!(result.error.unwrap().contains("500"));
    }

    #[tokio::test]
    async fn test_empty_body_is_transport_error() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/empty")
            .with_status(200)
            .with_body("")
            .create_async()
            .await;

        let result = fetcher().fetch(&spec(&format!("{}/empty", server.url()))).await;
        assert_eq!(result.status, FetchStatus::TransportError);
    }

    #[tokio::test]
    async fn test_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dep.bin");
        std::fs::write(&path, b"local").unwrap();

        let ok = fetcher()
            .fetch(&spec(&format!("file://{}", path.display())))
            .await;
        assert!(ok.is_ok());
        assert_eq!(ok.bytes, b"local");

        let missing = fetcher()
            .fetch(&spec(&format!("file://{}", dir.path().join("nope").display())))
            .await;
        assert_eq!(missing.status, FetchStatus::NotFound);
    }

    #[tokio::test]
    async fn test_file_url_is_percent_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("my deps").join("lib sodium.a");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"spaced").unwrap();

        let url = reqwest::Url::from_file_path(&path).unwrap();
        assert!(url.as_str().contains("%20"));
        let result = fetcher().fetch(&spec(url.as_str())).await;
        assert!(result.is_ok(), "{:?}", result.error);
        assert_eq!(result.bytes, b"spaced");
    }

    #[tokio::test]
    async fn test_scheme_is_case_insensitive() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/upper")
            .with_status(200)
            .with_body("ok")
            .create_async()
            .await;

        let url = format!("{}/upper", server.url()).replacen("http://", "HTTP://", 1);
        let result = fetcher().fetch(&spec(&url)).await;
        assert!(result.is_ok(), "{:?}", result.error);
        assert_eq!(result.bytes, b"ok");
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let result = fetcher().fetch(&spec("ftp://example.org/x")).await;
        assert_eq!(result.status, FetchStatus::TransportError);

        let garbage = fetcher().fetch(&spec("not a url")).await;
        assert_eq!(garbage.status, FetchStatus::TransportError);
        assert!(garbage.error.unwrap().contains("invalid URL"));
    }

    #[tokio::test]
    async fn test_digest_pinning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dep.bin");
        std::fs::write(&path, b"pinned").unwrap();
        let url = format!("file://{}", path.display());

        let mut good = spec(&url);
        good.sha256 = Some(sha256_hex(b"pinned"));
        assert!(fetcher().fetch(&good).await.is_ok());

        let mut bad = spec(&url);
        bad.sha256 = Some(sha256_hex(b"something else"));
        let result = fetcher().fetch(&bad).await;
        assert_eq!(result.status, FetchStatus::DigestMismatch);

        let unchecked = fetcher().with_verification(false).fetch(&bad).await;
        assert!(unchecked.is_ok());
    }

    struct StalledSource;

    #[async_trait]
    impl ArtifactSource for StalledSource {
        async fn get(&self, _url: &str) -> Result<Vec<u8>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(b"late".to_vec())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transport_error() {
        let fetcher = ArtifactFetcher::new(Arc::new(StalledSource)).with_timeout_secs(5);
        let result = fetcher.fetch(&spec("https://dead.mirror/x")).await;
        assert_eq!(result.status, FetchStatus::TransportError);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_fetch_all_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        std::fs::write(&a, b"A").unwrap();
        let specs = vec![
            spec(&format!("file://{}", a.display())),
            spec(&format!("file://{}", dir.path().join("b").display())),
        ];

        let results = fetcher().fetch_all(&specs).await;
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert_eq!(results[1].status, FetchStatus::NotFound);
    }
}

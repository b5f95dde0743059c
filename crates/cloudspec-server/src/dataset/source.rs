use super::snapshot::SnapshotError;
use async_trait::async_trait;
use cloudspec_core::sha256_hex;
use reqwest::header::{HeaderMap, ETAG, LAST_MODIFIED};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct FetchedArtifact {
    pub bytes: Vec<u8>,
    pub version: String,
}

/// Where dataset artifacts come from. `fingerprint` is a cheap change probe;
/// `fetch` downloads the full artifact and names the version it saw.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// `Ok(None)` means the source cannot answer without a full download.
    async fn fingerprint(&self) -> Result<Option<String>, SnapshotError>;
    async fn fetch(&self) -> Result<FetchedArtifact, SnapshotError>;
    fn describe(&self) -> String;
}

pub struct LocalFileSource {
    path: PathBuf,
}

impl LocalFileSource {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ArtifactSource for LocalFileSource {
    async fn fingerprint(&self) -> Result<Option<String>, SnapshotError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| SnapshotError(format!("read {}: {e}", self.path.display())))?;
        Ok(Some(sha256_hex(&bytes)))
    }

    async fn fetch(&self) -> Result<FetchedArtifact, SnapshotError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| SnapshotError(format!("read {}: {e}", self.path.display())))?;
        let version = sha256_hex(&bytes);
        Ok(FetchedArtifact { bytes, version })
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

pub struct HttpArtifactSource {
    url: String,
    fetch_timeout: Duration,
}

impl HttpArtifactSource {
    #[must_use]
    pub fn new(url: impl Into<String>, fetch_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            fetch_timeout,
        }
    }

    fn client(&self, timeout: Duration) -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new())
    }
}

#[async_trait]
impl ArtifactSource for HttpArtifactSource {
    /// HEAD probe. A failed or unhelpful probe reads as "unknown" rather than
    /// an error; the fetch path makes the real call.
    async fn fingerprint(&self) -> Result<Option<String>, SnapshotError> {
        let client = self.client(PROBE_TIMEOUT);
        match client.head(&self.url).send().await {
            Ok(resp) if resp.status().is_success() => Ok(header_version(resp.headers())),
            Ok(resp) => {
                debug!(url = %self.url, status = %resp.status(), "artifact probe not usable");
                Ok(None)
            }
            Err(e) => {
                debug!(url = %self.url, "artifact probe failed: {e}");
                Ok(None)
            }
        }
    }

    #[instrument(name = "artifact_fetch", skip(self), fields(url = %self.url))]
    async fn fetch(&self) -> Result<FetchedArtifact, SnapshotError> {
        let client = self.client(self.fetch_timeout);
        let resp = client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| SnapshotError(format!("download failed url={}: {e}", self.url)))?;
        if !resp.status().is_success() {
            return Err(SnapshotError(format!(
                "download failed status={} url={}",
                resp.status(),
                self.url
            )));
        }
        let from_headers = header_version(resp.headers());
        let bytes = resp
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| SnapshotError(format!("read body failed: {e}")))?;
        let version = from_headers.unwrap_or_else(|| sha256_hex(&bytes));
        Ok(FetchedArtifact { bytes, version })
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

fn header_version(headers: &HeaderMap) -> Option<String> {
    let etag = headers
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);
    if etag.is_some() {
        return etag;
    }
    headers
        .get(LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
}

/// Scripted source for tests. Call counters expose how often the manager
/// probed versus downloaded.
pub struct FakeArtifactSource {
    state: Mutex<FakeArtifactState>,
    pub fingerprint_calls: AtomicU64,
    pub fetch_calls: AtomicU64,
}

struct FakeArtifactState {
    bytes: Vec<u8>,
    version: String,
    fail_fetch: bool,
    probe_answers: bool,
    fetch_delay: Option<Duration>,
}

impl FakeArtifactSource {
    #[must_use]
    pub fn new(bytes: Vec<u8>, version: &str) -> Self {
        Self {
            state: Mutex::new(FakeArtifactState {
                bytes,
                version: version.to_string(),
                fail_fetch: false,
                probe_answers: true,
                fetch_delay: None,
            }),
            fingerprint_calls: AtomicU64::new(0),
            fetch_calls: AtomicU64::new(0),
        }
    }

    pub async fn set_artifact(&self, bytes: Vec<u8>, version: &str) {
        let mut state = self.state.lock().await;
        state.bytes = bytes;
        state.version = version.to_string();
    }

    pub async fn set_fail_fetch(&self, fail: bool) {
        self.state.lock().await.fail_fetch = fail;
    }

    pub async fn set_probe_answers(&self, answers: bool) {
        self.state.lock().await.probe_answers = answers;
    }

    pub async fn set_fetch_delay(&self, delay: Option<Duration>) {
        self.state.lock().await.fetch_delay = delay;
    }
}

#[async_trait]
impl ArtifactSource for FakeArtifactSource {
    async fn fingerprint(&self) -> Result<Option<String>, SnapshotError> {
        self.fingerprint_calls.fetch_add(1, Ordering::Relaxed);
        let state = self.state.lock().await;
        if !state.probe_answers {
            return Ok(None);
        }
        Ok(Some(state.version.clone()))
    }

    async fn fetch(&self) -> Result<FetchedArtifact, SnapshotError> {
        self.fetch_calls.fetch_add(1, Ordering::Relaxed);
        let (bytes, version, fail, delay) = {
            let state = self.state.lock().await;
            (
                state.bytes.clone(),
                state.version.clone(),
                state.fail_fetch,
                state.fetch_delay,
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(SnapshotError("scripted fetch failure".to_string()));
        }
        Ok(FetchedArtifact { bytes, version })
    }

    fn describe(&self) -> String {
        "fake".to_string()
    }
}

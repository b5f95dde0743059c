use super::RatesError;
use async_trait::async_trait;
use cloudspec_model::CurrencyCode;
use reqwest::header::LAST_MODIFIED;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::instrument;

/// Reference rates compiled in at build time, used when the live source is
/// unreachable at startup.
pub(crate) const BUNDLED_CSV: &str = include_str!("eurofxref.csv");

const CSV_NAME: &str = "eurofxref.csv";

pub struct RatesFetch {
    pub bytes: Vec<u8>,
    pub last_modified: Option<String>,
}

/// Provider of the daily reference-rate archive.
#[async_trait]
pub trait RatesSource: Send + Sync {
    /// Publish stamp probe without a download. `Ok(None)` when the upstream
    /// will not say.
    async fn head_last_modified(&self) -> Result<Option<String>, RatesError>;
    async fn download(&self) -> Result<RatesFetch, RatesError>;
}

/// The European Central Bank's zipped daily CSV.
pub struct EcbSource {
    url: String,
    download_timeout: Duration,
    head_timeout: Duration,
}

impl EcbSource {
    #[must_use]
    pub fn new(url: impl Into<String>, download_timeout: Duration, head_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            download_timeout,
            head_timeout,
        }
    }

    fn client(&self, timeout: Duration) -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new())
    }
}

#[async_trait]
impl RatesSource for EcbSource {
    async fn head_last_modified(&self) -> Result<Option<String>, RatesError> {
        let client = self.client(self.head_timeout);
        let resp = client
            .head(&self.url)
            .send()
            .await
            .map_err(|e| RatesError(format!("rates probe failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(RatesError(format!(
                "rates probe failed status={}",
                resp.status()
            )));
        }
        Ok(stamp_header(resp.headers()))
    }

    #[instrument(name = "rates_download", skip(self), fields(url = %self.url))]
    async fn download(&self) -> Result<RatesFetch, RatesError> {
        let client = self.client(self.download_timeout);
        let resp = client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| RatesError(format!("rates download failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(RatesError(format!(
                "rates download failed status={}",
                resp.status()
            )));
        }
        let last_modified = stamp_header(resp.headers());
        let bytes = resp
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| RatesError(format!("rates body read failed: {e}")))?;
        Ok(RatesFetch {
            bytes,
            last_modified,
        })
    }
}

fn stamp_header(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get(LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
}

pub(crate) fn parse_zip(bytes: &[u8]) -> Result<HashMap<CurrencyCode, f64>, RatesError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| RatesError(format!("rates archive unreadable: {e}")))?;
    let mut file = archive
        .by_name(CSV_NAME)
        .map_err(|e| RatesError(format!("rates archive missing {CSV_NAME}: {e}")))?;
    let mut text = String::new();
    file.read_to_string(&mut text)
        .map_err(|e| RatesError(format!("rates csv unreadable: {e}")))?;
    parse_csv(&text)
}

/// Two-row CSV: a header naming the currencies and one row of euro rates.
/// The leading `Date` column and the trailing empty column are skipped.
pub(crate) fn parse_csv(text: &str) -> Result<HashMap<CurrencyCode, f64>, RatesError> {
    let mut lines = text.lines();
    let header = lines
        .next()
        .ok_or_else(|| RatesError("rates csv is empty".to_string()))?;
    let values = lines
        .next()
        .ok_or_else(|| RatesError("rates csv has no value row".to_string()))?;
    let mut rates = HashMap::new();
    for (name, value) in header.split(',').zip(values.split(',')).skip(1) {
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() || value.is_empty() {
            continue;
        }
        let code = CurrencyCode::parse(name)
            .map_err(|e| RatesError(format!("rates csv column rejected: {e}")))?;
        let rate: f64 = value
            .parse()
            .map_err(|e| RatesError(format!("rate for {name} unreadable: {e}")))?;
        if rate <= 0.0 {
            return Err(RatesError(format!("rate for {name} out of range")));
        }
        rates.insert(code, rate);
    }
    if rates.is_empty() {
        return Err(RatesError("rates csv contained no currencies".to_string()));
    }
    Ok(rates)
}

/// Scripted source for tests.
pub struct FakeRatesSource {
    state: Mutex<FakeRatesState>,
    pub head_calls: AtomicU64,
    pub download_calls: AtomicU64,
}

struct FakeRatesState {
    bytes: Vec<u8>,
    last_modified: Option<String>,
    fail_head: bool,
    fail_download: bool,
}

impl FakeRatesSource {
    #[must_use]
    pub fn new(bytes: Vec<u8>, last_modified: Option<&str>) -> Self {
        Self {
            state: Mutex::new(FakeRatesState {
                bytes,
                last_modified: last_modified.map(ToString::to_string),
                fail_head: false,
                fail_download: false,
            }),
            head_calls: AtomicU64::new(0),
            download_calls: AtomicU64::new(0),
        }
    }

    pub async fn set_archive(&self, bytes: Vec<u8>, last_modified: Option<&str>) {
        let mut state = self.state.lock().await;
        state.bytes = bytes;
        state.last_modified = last_modified.map(ToString::to_string);
    }

    pub async fn set_fail_head(&self, fail: bool) {
        self.state.lock().await.fail_head = fail;
    }

    pub async fn set_fail_download(&self, fail: bool) {
        self.state.lock().await.fail_download = fail;
    }
}

#[async_trait]
impl RatesSource for FakeRatesSource {
    async fn head_last_modified(&self) -> Result<Option<String>, RatesError> {
        self.head_calls.fetch_add(1, Ordering::Relaxed);
        let state = self.state.lock().await;
        if state.fail_head {
            return Err(RatesError("scripted probe failure".to_string()));
        }
        Ok(state.last_modified.clone())
    }

    async fn download(&self) -> Result<RatesFetch, RatesError> {
        self.download_calls.fetch_add(1, Ordering::Relaxed);
        let state = self.state.lock().await;
        if state.fail_download {
            return Err(RatesError("scripted download failure".to_string()));
        }
        Ok(RatesFetch {
            bytes: state.bytes.clone(),
            last_modified: state.last_modified.clone(),
        })
    }
}

// SPDX-License-Identifier: Apache-2.0

//! Euro reference rates with upstream-paced refresh.
//!
//! The upstream publishes one archive per business day and stamps it with a
//! `Last-Modified` header. While that stamp parses, checks are scheduled just
//! after the next expected publish; when it is missing, stale, or the fetch
//! fails, checks poll with a doubling backoff instead. Conversions always read
//! the last good table.

mod ecb;
mod schedule;

pub use ecb::{EcbSource, FakeRatesSource, RatesFetch, RatesSource};
pub use schedule::{
    RefreshMode, RefreshSchedule, BACKOFF_CEILING, BACKOFF_INITIAL, SCHEDULED_SLACK,
};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use cloudspec_model::CurrencyCode;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatesError(pub String);

impl fmt::Display for RatesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for RatesError {}

/// Euro-based conversion table. Rates are units of a currency per euro, so a
/// cross conversion goes through the euro leg.
#[derive(Debug, Clone)]
pub struct CurrencyRateTable {
    rates: HashMap<CurrencyCode, f64>,
}

impl CurrencyRateTable {
    pub fn from_zip_bytes(bytes: &[u8]) -> Result<Self, RatesError> {
        Ok(Self {
            rates: ecb::parse_zip(bytes)?,
        })
    }

    pub fn from_csv(text: &str) -> Result<Self, RatesError> {
        Ok(Self {
            rates: ecb::parse_csv(text)?,
        })
    }

    /// Rates compiled in at build time.
    pub fn bundled() -> Result<Self, RatesError> {
        Self::from_csv(ecb::BUNDLED_CSV)
    }

    pub fn convert(
        &self,
        amount: f64,
        from: &CurrencyCode,
        to: &CurrencyCode,
    ) -> Result<f64, RatesError> {
        if from == to {
            return Ok(amount);
        }
        let from_rate = self.euro_rate(from)?;
        let to_rate = self.euro_rate(to)?;
        Ok(amount / from_rate * to_rate)
    }

    fn euro_rate(&self, code: &CurrencyCode) -> Result<f64, RatesError> {
        if code.is_euro() {
            return Ok(1.0);
        }
        self.rates
            .get(code)
            .copied()
            .ok_or_else(|| RatesError(format!("unsupported currency: {}", code.as_str())))
    }

    #[must_use]
    pub fn currencies(&self) -> Vec<CurrencyCode> {
        let mut codes: Vec<CurrencyCode> = self.rates.keys().cloned().collect();
        if let Ok(eur) = CurrencyCode::parse("EUR") {
            codes.push(eur);
        }
        codes.sort();
        codes
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RatesStatus {
    pub mode: RefreshMode,
    pub currencies: usize,
    pub last_refreshed: Option<DateTime<Utc>>,
    pub last_modified: Option<String>,
    pub next_check: DateTime<Utc>,
}

/// Holds the current table behind a lock-free swap and keeps it fresh on the
/// upstream's own rhythm.
pub struct ExchangeRateCache {
    source: Arc<dyn RatesSource>,
    table: ArcSwap<CurrencyRateTable>,
    schedule: Mutex<RefreshSchedule>,
    last_refreshed: Mutex<Option<DateTime<Utc>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    updater: Mutex<Option<JoinHandle<()>>>,
}

impl ExchangeRateCache {
    /// Starts from a live download when possible, otherwise from the bundled
    /// rates. Errors only when both are unavailable; conversions must never
    /// run without a table.
    pub async fn initial_load(source: Arc<dyn RatesSource>) -> Result<Arc<Self>, RatesError> {
        let now = Utc::now();
        let mut schedule = RefreshSchedule::new(now);
        let mut last_refreshed = None;
        let table = match source.download().await {
            Ok(fetch) => match parse_and_arm(&fetch, &mut schedule, now) {
                Ok(table) => {
                    last_refreshed = Some(now);
                    table
                }
                Err(e) => {
                    warn!("exchange rate archive unusable, using bundled rates: {e}");
                    schedule.enter_backoff(now);
                    CurrencyRateTable::bundled()?
                }
            },
            Err(e) => {
                warn!("exchange rate download failed, using bundled rates: {e}");
                schedule.enter_backoff(now);
                CurrencyRateTable::bundled()?
            }
        };
        info!(
            currencies = table.currencies().len(),
            mode = ?schedule.mode(),
            "exchange rates loaded"
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Arc::new(Self {
            source,
            table: ArcSwap::from_pointee(table),
            schedule: Mutex::new(schedule),
            last_refreshed: Mutex::new(last_refreshed),
            shutdown_tx,
            shutdown_rx,
            updater: Mutex::new(None),
        }))
    }

    pub fn convert(
        &self,
        amount: f64,
        from: &CurrencyCode,
        to: &CurrencyCode,
    ) -> Result<f64, RatesError> {
        self.table.load().convert(amount, from, to)
    }

    #[must_use]
    pub fn table(&self) -> Arc<CurrencyRateTable> {
        self.table.load_full()
    }

    /// One check: probe the publish stamp, download when it changed, swap the
    /// table in. Failures leave the current table live and push the next
    /// check out.
    pub async fn update(&self) {
        let now = Utc::now();
        let known_stamp = {
            let schedule = self.schedule.lock().await;
            schedule.last_modified().map(ToString::to_string)
        };
        match self.source.head_last_modified().await {
            Ok(Some(stamp)) if known_stamp.as_deref() == Some(stamp.as_str()) => {
                self.schedule.lock().await.arm_from_publish(&stamp, now);
                debug!("exchange rates unchanged upstream");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                debug!("exchange rate probe failed, trying the download: {e}");
            }
        }
        match self.source.download().await {
            Ok(fetch) => {
                let mut schedule = self.schedule.lock().await;
                match parse_and_arm(&fetch, &mut schedule, now) {
                    Ok(table) => {
                        info!(
                            currencies = table.currencies().len(),
                            mode = ?schedule.mode(),
                            "exchange rates refreshed"
                        );
                        drop(schedule);
                        self.table.store(Arc::new(table));
                        *self.last_refreshed.lock().await = Some(now);
                    }
                    Err(e) => {
                        schedule.enter_backoff(now);
                        warn!("exchange rate archive unusable: {e}");
                    }
                }
            }
            Err(e) => {
                self.schedule.lock().await.enter_backoff(now);
                warn!("exchange rate download failed: {e}");
            }
        }
    }

    pub async fn spawn_updater(self: &Arc<Self>) {
        let me = Arc::clone(self);
        let mut shutdown = self.shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            loop {
                let wait = {
                    let schedule = me.schedule.lock().await;
                    schedule.wait_from(Utc::now())
                };
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
                let due = {
                    let schedule = me.schedule.lock().await;
                    schedule.due(Utc::now())
                };
                if due {
                    me.update().await;
                }
            }
            info!("exchange rate updater stopped");
        });
        *self.updater.lock().await = Some(handle);
    }

    pub async fn status(&self) -> RatesStatus {
        let schedule = self.schedule.lock().await;
        RatesStatus {
            mode: schedule.mode(),
            currencies: self.table.load().currencies().len(),
            last_refreshed: *self.last_refreshed.lock().await,
            last_modified: schedule.last_modified().map(ToString::to_string),
            next_check: schedule.next_check(),
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.updater.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

fn parse_and_arm(
    fetch: &RatesFetch,
    schedule: &mut RefreshSchedule,
    now: DateTime<Utc>,
) -> Result<CurrencyRateTable, RatesError> {
    let table = CurrencyRateTable::from_zip_bytes(&fetch.bytes)?;
    match &fetch.last_modified {
        Some(stamp) => schedule.arm_from_publish(stamp, now),
        None => schedule.enter_backoff(now),
    }
    Ok(table)
}

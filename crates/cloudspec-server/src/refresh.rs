// SPDX-License-Identifier: Apache-2.0

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug)]
pub struct RefreshError(pub String);

impl std::fmt::Display for RefreshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for RefreshError {}

/// Outcome of one producer cycle. `Unchanged` keeps the published value and
/// still counts as a successful check for freshness reporting.
pub enum Produced<T> {
    Fresh(T),
    Unchanged,
}

/// One refresh cycle: given the currently published value (if any), produce
/// the next one. Implementations do their own change detection so a no-op
/// cycle stays cheap.
#[async_trait]
pub trait Produce<T>: Send + Sync {
    async fn produce(&self, current: Option<Arc<T>>) -> Result<Produced<T>, RefreshError>;
}

#[derive(Debug, Clone, Copy)]
pub struct ResourceStatus {
    pub ready: bool,
    pub last_updated: Option<SystemTime>,
}

/// Holds one immutable value that a background loop replaces wholesale.
///
/// Readers go through a single atomic pointer load and never contend with a
/// producer run in progress; the only blocking read is the first `get()`
/// before any value has been published. Producer runs are serialized by an
/// internal lock that readers never touch.
pub struct RefreshableResource<T: Send + Sync + 'static> {
    name: &'static str,
    current: ArcSwapOption<T>,
    producer: Arc<dyn Produce<T>>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    last_updated: Mutex<Option<SystemTime>>,
    refresh_lock: Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    updater: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + Sync + 'static> RefreshableResource<T> {
    #[must_use]
    pub fn new(name: &'static str, producer: Arc<dyn Produce<T>>) -> Arc<Self> {
        let (ready_tx, ready_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            name,
            current: ArcSwapOption::const_empty(),
            producer,
            ready_tx,
            ready_rx,
            last_updated: Mutex::new(None),
            refresh_lock: Mutex::new(()),
            shutdown_tx,
            shutdown_rx,
            updater: Mutex::new(None),
        })
    }

    /// Current value, waiting for the first publish if none exists yet. After
    /// the first publish this is a pointer load and returns immediately even
    /// while a refresh is running.
    pub async fn get(&self) -> Arc<T> {
        loop {
            if let Some(value) = self.current.load_full() {
                return value;
            }
            let mut rx = self.ready_rx.clone();
            let _ = rx.wait_for(|ready| *ready).await;
        }
    }

    /// Fail-fast variant of `get` for callers that prefer absence over
    /// waiting out the first load.
    #[must_use]
    pub fn try_get(&self) -> Option<Arc<T>> {
        self.current.load_full()
    }

    /// Run one producer cycle now. On error the published value is left
    /// untouched and the error is returned to the caller instead of being
    /// swallowed like in the background loop.
    pub async fn force_refresh(&self) -> Result<Arc<T>, RefreshError> {
        let _guard = self.refresh_lock.lock().await;
        self.run_cycle().await?;
        self.current
            .load_full()
            .ok_or_else(|| RefreshError(format!("{}: producer returned no value", self.name)))
    }

    async fn run_cycle(&self) -> Result<(), RefreshError> {
        match self.producer.produce(self.current.load_full()).await? {
            Produced::Fresh(value) => {
                self.current.store(Some(Arc::new(value)));
                *self.last_updated.lock().await = Some(SystemTime::now());
                let _ = self.ready_tx.send_replace(true);
            }
            Produced::Unchanged => {
                if self.current.load().is_some() {
                    *self.last_updated.lock().await = Some(SystemTime::now());
                }
            }
        }
        Ok(())
    }

    /// Start the periodic updater. The first tick fires immediately; a failed
    /// cycle is logged with the running failure count and the loop carries on.
    pub async fn spawn_updater(self: &Arc<Self>, interval: Duration) {
        let me = Arc::clone(self);
        let mut shutdown = self.shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut consecutive_failures: u64 = 0;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let outcome = {
                            let _guard = me.refresh_lock.lock().await;
                            me.run_cycle().await
                        };
                        match outcome {
                            Ok(()) => consecutive_failures = 0,
                            Err(e) => {
                                consecutive_failures += 1;
                                error!(
                                    resource = me.name,
                                    attempt = consecutive_failures,
                                    "refresh failed: {e}"
                                );
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(resource = me.name, "updater stopped");
        });
        *self.updater.lock().await = Some(handle);
    }

    /// Stop the updater task and wait for it to exit. Safe to call more than
    /// once; the published value stays readable after shutdown.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.updater.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub async fn status(&self) -> ResourceStatus {
        ResourceStatus {
            ready: self.current.load().is_some(),
            last_updated: *self.last_updated.lock().await,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

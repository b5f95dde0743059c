use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

pub const BACKOFF_INITIAL: Duration = Duration::from_secs(60);
pub const BACKOFF_CEILING: Duration = Duration::from_secs(60 * 60);
/// Upstream publishes once per business day; the slack covers the publish
/// window plus a margin for clock drift.
pub const SCHEDULED_SLACK: Duration = Duration::from_secs(24 * 60 * 60 + 15 * 60);

const MAX_SLEEP_CHUNK: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshMode {
    /// Next check is derived from the upstream's own publish stamp.
    Scheduled,
    /// Upstream gave no usable stamp; checks poll with a doubling interval.
    Backoff,
}

/// Decides when to look for the next upstream publish. Pure state machine:
/// callers pass `now` in, nothing here reads the clock.
#[derive(Debug, Clone)]
pub struct RefreshSchedule {
    mode: RefreshMode,
    next_check: DateTime<Utc>,
    backoff: Duration,
    last_modified: Option<String>,
}

impl RefreshSchedule {
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            mode: RefreshMode::Backoff,
            next_check: now,
            backoff: BACKOFF_INITIAL,
            last_modified: None,
        }
    }

    /// Re-arms from an upstream publish stamp. The stamp is remembered even
    /// when unparseable so change probes can still compare against it. The
    /// backoff ladder resets only when this lands a future scheduled check;
    /// a stale stamp keeps climbing it.
    pub fn arm_from_publish(&mut self, last_modified: &str, now: DateTime<Utc>) {
        self.last_modified = Some(last_modified.to_string());
        match DateTime::parse_from_rfc2822(last_modified) {
            Ok(published) => {
                let next = published.with_timezone(&Utc)
                    + chrono::Duration::seconds(SCHEDULED_SLACK.as_secs() as i64);
                if next > now {
                    self.mode = RefreshMode::Scheduled;
                    self.next_check = next;
                    self.backoff = BACKOFF_INITIAL;
                } else {
                    self.enter_backoff(now);
                }
            }
            Err(_) => self.enter_backoff(now),
        }
    }

    /// Pushes the next check out by the current backoff interval and doubles
    /// it, up to the ceiling.
    pub fn enter_backoff(&mut self, now: DateTime<Utc>) {
        let interval = self.backoff.min(BACKOFF_CEILING);
        self.mode = RefreshMode::Backoff;
        self.next_check = now + chrono::Duration::seconds(interval.as_secs() as i64);
        self.backoff = (self.backoff * 2).min(BACKOFF_CEILING);
    }

    #[must_use]
    pub fn mode(&self) -> RefreshMode {
        self.mode
    }

    #[must_use]
    pub fn next_check(&self) -> DateTime<Utc> {
        self.next_check
    }

    #[must_use]
    pub fn last_modified(&self) -> Option<&str> {
        self.last_modified.as_deref()
    }

    #[must_use]
    pub fn due(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_check
    }

    /// Sleep till the next check, capped so a far-off schedule is still
    /// re-read within the hour.
    #[must_use]
    pub fn wait_from(&self, now: DateTime<Utc>) -> Duration {
        let until = (self.next_check - now).to_std().unwrap_or(Duration::ZERO);
        until.min(MAX_SLEEP_CHUNK)
    }
}

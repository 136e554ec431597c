use crate::clock::Clock;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;

/// [`VirtualClock`] is a [`Clock`] used for deterministic tests: time never moves on
/// its own and must be advanced explicitly via [`VirtualClock::advance`] /
/// [`VirtualClock::advance_to`].
pub struct VirtualClock {
    current_millis: AtomicU64,
    default_timezone: Tz,
    notify: Notify,
}

impl Debug for VirtualClock {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualClock")
            .field("now", &self.now_sync())
            .finish()
    }
}

impl VirtualClock {
    pub fn new(initial_time: DateTime<Utc>) -> Self {
        Self::from_millis(initial_time.timestamp_millis() as u64, Tz::UTC)
    }

    pub fn with_timezone(initial_time: DateTime<Utc>, default_timezone: Tz) -> Self {
        Self::from_millis(initial_time.timestamp_millis() as u64, default_timezone)
    }

    pub fn from_millis(initial_value: u64, default_timezone: Tz) -> Self {
        VirtualClock {
            current_millis: AtomicU64::new(initial_value),
            default_timezone,
            notify: Notify::new(),
        }
    }

    pub fn from_epoch() -> Self {
        Self::from_millis(0, Tz::UTC)
    }

    fn now_sync(&self) -> DateTime<Utc> {
        let millis = self.current_millis.load(Ordering::Relaxed) as i64;
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    /// Advance time forward by `duration`.
    pub async fn advance(&self, duration: Duration) {
        let now = self.now().await;
        self.advance_to(now + duration).await
    }

    /// Advance (or rewind) time to an absolute instant.
    pub async fn advance_to(&self, to: DateTime<Utc>) {
        self.current_millis
            .store(to.timestamp_millis() as u64, Ordering::Relaxed);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl Clock for VirtualClock {
    async fn now(&self) -> DateTime<Utc> {
        self.now_sync()
    }

    fn default_timezone(&self) -> Tz {
        self.default_timezone
    }

    async fn idle_to(&self, to: SystemTime) {
        loop {
            let now_millis = self.current_millis.load(Ordering::Relaxed);
            let to_millis = to
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            if now_millis >= to_millis {
                return;
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn advances_forward_only_when_told() {
        let clock = VirtualClock::from_epoch();
        let t0 = clock.now().await;
        assert_eq!(t0, Utc.timestamp_millis_opt(0).unwrap());
        clock.advance(Duration::from_secs(60)).await;
        let t1 = clock.now().await;
        assert_eq!((t1 - t0).num_seconds(), 60);
    }

    #[tokio::test]
    async fn default_timezone_is_configurable() {
        let clock = VirtualClock::with_timezone(Utc::now(), Tz::America__New_York);
        assert_eq!(clock.default_timezone(), Tz::America__New_York);
    }
}

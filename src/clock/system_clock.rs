use crate::clock::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::fmt::Debug;
use std::time::{Duration, SystemTime};

#[allow(unused_imports)]
use crate::clock::VirtualClock;

/// [`SystemClock`] is the default, production [`Clock`]: it always reflects wall-clock
/// time and cannot be wound forward or back, unlike [`VirtualClock`].
pub struct SystemClock {
    default_timezone: Tz,
}

impl SystemClock {
    pub fn new(default_timezone: Tz) -> Self {
        Self { default_timezone }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new(Tz::UTC)
    }
}

impl Debug for SystemClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemClock")
            .field("now", &Utc::now())
            .field("default_timezone", &self.default_timezone)
            .finish()
    }
}

#[async_trait]
impl Clock for SystemClock {
    async fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn default_timezone(&self) -> Tz {
        self.default_timezone
    }

    async fn idle_to(&self, to: SystemTime) {
        let now = SystemTime::now();
        let duration = match to.duration_since(now) {
            Ok(duration) => duration,
            Err(diff) => {
                if diff.duration() <= Duration::from_millis(7) {
                    return;
                }
                return;
            }
        };
        tokio::time::sleep(duration).await;
    }
}

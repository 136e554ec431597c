pub mod system_clock;
pub mod virtual_clock;

use std::fmt::Debug;
use std::ops::Deref;
pub use system_clock::SystemClock;
pub use virtual_clock::VirtualClock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::time::SystemTime;

/// [`Clock`] is the single source of truth for time used throughout the scheduler.
/// It is deliberately the only place that calls into the operating system's
/// notion of "now", so that tests can substitute a [`VirtualClock`] and drive
/// every time-dependent code path deterministically.
///
/// # Required Methods
/// Implementors provide [`Clock::now`] (the current UTC instant) and
/// [`Clock::default_timezone`] (the IANA zone assumed when a `ScheduledTask`
/// does not specify one). [`Clock::idle_to`] is used internally by the
/// scheduler's tick loop to sleep until a point in time without busy-waiting.
///
/// # Trait Implementation(s)
/// - [`SystemClock`] — wall-clock time, moves forward on its own.
/// - [`VirtualClock`] — frozen time, advanced only by explicit calls; used by
///   tests to assert exact scheduling behavior without sleeping.
#[async_trait]
pub trait Clock: Debug + Send + Sync {
    /// The current instant, timezone-aware (always UTC internally).
    async fn now(&self) -> DateTime<Utc>;

    /// The configured default IANA timezone, used when a task omits one.
    fn default_timezone(&self) -> Tz;

    /// Idle until `to` is reached; returns immediately if `to` is not in the future.
    async fn idle_to(&self, to: SystemTime);
}

#[async_trait]
impl<T> Clock for T
where
    T: Deref + Send + Sync + Debug,
    T::Target: Clock,
{
    async fn now(&self) -> DateTime<Utc> {
        self.deref().now().await
    }

    fn default_timezone(&self) -> Tz {
        self.deref().default_timezone()
    }

    async fn idle_to(&self, to: SystemTime) {
        self.deref().idle_to(to).await
    }
}

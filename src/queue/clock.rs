use chrono::{DateTime, Utc};

/// Time source for lease decisions and entry stamps. Queue logic never
/// calls `Utc::now()` directly so tests can drive expiry by hand.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub use manual::ManualClock;

#[cfg(test)]
mod manual {
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    use chrono::{DateTime, Duration, Utc};

    use super::Clock;

    /// Hand-advanced clock. Clones share the same instant.
    #[derive(Clone)]
    pub struct ManualClock {
        now_ms: Arc<AtomicI64>,
    }

    impl ManualClock {
        pub fn at(start: DateTime<Utc>) -> Self {
            Self {
                now_ms: Arc::new(AtomicI64::new(start.timestamp_millis())),
            }
        }

        pub fn advance(&self, by: Duration) {
            self.now_ms.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            let ms = self.now_ms.load(Ordering::SeqCst);
            DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        }
    }
}

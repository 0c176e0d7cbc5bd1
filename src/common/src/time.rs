//! Clock sources.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::RwLock;

pub trait TimeProvider: std::fmt::Debug + Send + Sync + 'static {
    /// Returns the current time. No guarantees are made about monotonicity
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// A [`TimeProvider`] that uses [`Utc::now`] as a clock source
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider {}

impl SystemProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A [`TimeProvider`] that returns a fixed, settable time
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<DateTime<Utc>>,
}

impl MockProvider {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    pub fn set(&self, time: DateTime<Utc>) {
        *self.now.write() = time
    }

    pub fn inc(&self, duration: Duration) -> DateTime<Utc> {
        let mut now = self.now.write();
        *now += duration;
        *now
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_mock_provider() {
        let start = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();
        let provider = MockProvider::new(start);
        assert_eq!(provider.now(), start);
        assert_eq!(
            provider.today(),
            NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
        );

        let later = provider.inc(Duration::days(20));
        assert_eq!(provider.now(), later);
        assert_eq!(
            provider.today(),
            NaiveDate::from_ymd_opt(2024, 4, 4).unwrap()
        );
    }

    #[test]
    fn test_system_provider_moves_forward() {
        let provider = SystemProvider::new();
        let a = provider.now();
        let b = provider.now();
        assert!(b >= a);
    }
}

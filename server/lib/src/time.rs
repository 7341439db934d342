//! Time as an injected dependency. The stamper and the replication log take
//! their notion of "now" from a [`Clock`] so tests are deterministic, and the
//! generalized-time form always carries a four digit year.

use time::OffsetDateTime;

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Format as LDAP generalized time, `YYYYMMDDhhmmssZ`.
pub fn format_generalized_time(t: OffsetDateTime) -> String {
    let fmt = time::macros::format_description!(
        "[year][month][day][hour][minute][second]Z"
    );
    #[allow(clippy::expect_used)]
    t.format(fmt).expect("invalid generalized time format")
}

/// A clock pinned to a fixed instant, for deterministic stamping in tests.
#[cfg(test)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct FixedClock(pub OffsetDateTime);

#[cfg(test)]
impl Default for FixedClock {
    fn default() -> Self {
        // 2025-06-15T12:00:00Z
        #[allow(clippy::expect_used)]
        FixedClock(OffsetDateTime::from_unix_timestamp(1_749_988_800).expect("valid timestamp"))
    }
}

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_generalized_time() {
        let t = FixedClock::default().now();
        assert_eq!(format_generalized_time(t), "20250615120000Z");
    }
}

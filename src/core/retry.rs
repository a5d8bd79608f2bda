use std::collections::BTreeSet;
use std::time::{Duration, SystemTime};

use http::{HeaderMap, StatusCode};
use rand::RngExt;

use crate::util::parse_retry_after;

/// How many extra attempts a request may make after the first one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retries {
    Limited(u32),
    Forever,
}

impl Retries {
    pub const NONE: Self = Self::Limited(0);

    /// Interprets the conventional signed count: `-1` retries forever,
    /// other negative values mean no retry.
    pub const fn from_count(count: i64) -> Self {
        if count == -1 {
            Self::Forever
        } else if count <= 0 {
            Self::NONE
        } else if count > u32::MAX as i64 {
            Self::Limited(u32::MAX)
        } else {
            Self::Limited(count as u32)
        }
    }

    pub const fn is_none(self) -> bool {
        matches!(self, Self::Limited(0))
    }

    /// Whether another attempt is allowed after `retry_index` retries were made.
    pub(crate) const fn allows(self, retry_index: usize) -> bool {
        match self {
            Self::Forever => true,
            Self::Limited(limit) => retry_index < limit as usize,
        }
    }

    pub(crate) fn max_attempts_label(self) -> String {
        match self {
            Self::Forever => "unbounded".to_owned(),
            Self::Limited(limit) => (limit as usize + 1).to_string(),
        }
    }
}

impl Default for Retries {
    fn default() -> Self {
        Self::NONE
    }
}

impl From<u32> for Retries {
    fn from(value: u32) -> Self {
        Self::Limited(value)
    }
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    base_backoff: Duration,
    max_backoff: Duration,
    jitter_ratio: f64,
    retryable_status_codes: BTreeSet<u16>,
    honor_retry_after: bool,
}

impl RetryPolicy {
    pub fn standard() -> Self {
        Self {
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            jitter_ratio: 0.2,
            retryable_status_codes: default_retryable_status_codes(),
            honor_retry_after: true,
        }
    }

    /// Retries immediately and never on status codes; only failed exchanges are retried.
    pub fn immediate() -> Self {
        Self {
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter_ratio: 0.0,
            retryable_status_codes: BTreeSet::new(),
            honor_retry_after: false,
        }
    }

    pub fn base_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff;
        if self.max_backoff < self.base_backoff {
            self.max_backoff = self.base_backoff;
        }
        self
    }

    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff.max(self.base_backoff);
        self
    }

    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio.clamp(0.0, 1.0);
        self
    }

    pub fn retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub fn honor_retry_after(mut self, honor_retry_after: bool) -> Self {
        self.honor_retry_after = honor_retry_after;
        self
    }

    pub(crate) fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.retryable_status_codes.contains(&status.as_u16())
    }

    /// Delay before retry number `retry_index` (1-based), doubling from the
    /// base backoff and capped at the max backoff.
    pub(crate) fn backoff_for_retry(&self, retry_index: usize) -> Duration {
        if self.base_backoff.is_zero() {
            return Duration::ZERO;
        }
        let capped_exponent = retry_index.saturating_sub(1).min(31) as u32;
        let multiplier = 1_u128 << capped_exponent;
        let base_ms = self.base_backoff.as_millis().max(1);
        let max_ms = self.max_backoff.as_millis().max(base_ms);
        let delay_ms = base_ms
            .saturating_mul(multiplier)
            .min(max_ms)
            .min(u64::MAX as u128) as u64;
        self.apply_jitter(Duration::from_millis(delay_ms))
    }

    pub(crate) fn delay_for_status(&self, retry_index: usize, headers: &HeaderMap) -> Duration {
        if self.honor_retry_after
            && let Some(retry_after) = parse_retry_after(headers, SystemTime::now())
        {
            return retry_after.min(self.max_backoff.max(self.base_backoff));
        }
        self.backoff_for_retry(retry_index)
    }

    fn apply_jitter(&self, backoff: Duration) -> Duration {
        if self.jitter_ratio <= f64::EPSILON {
            return backoff;
        }

        let backoff_ms = backoff.as_millis().min(u64::MAX as u128) as u64;
        if backoff_ms <= 1 {
            return backoff;
        }
        let max_backoff_ms = self.max_backoff.as_millis().min(u64::MAX as u128) as u64;

        let jitter_span = ((backoff_ms as f64) * self.jitter_ratio).round().max(1.0) as u64;
        let low = backoff_ms.saturating_sub(jitter_span);
        let high = backoff_ms.saturating_add(jitter_span).max(low);
        let mut rng = rand::rng();
        let sampled_ms = rng.random_range(low..=high).min(max_backoff_ms.max(1));
        Duration::from_millis(sampled_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

fn default_retryable_status_codes() -> BTreeSet<u16> {
    [429_u16, 500, 502, 503, 504].into_iter().collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::header::{HeaderValue, RETRY_AFTER};
    use http::{HeaderMap, StatusCode};

    use super::{Retries, RetryPolicy};

    #[test]
    fn jittered_backoff_never_exceeds_configured_max_backoff() {
        let policy = RetryPolicy::standard()
            .base_backoff(Duration::from_millis(100))
            .max_backoff(Duration::from_millis(120))
            .jitter_ratio(1.0);

        for _ in 0..256 {
            let backoff = policy.backoff_for_retry(3);
            assert!(backoff <= Duration::from_millis(120));
        }
    }

    #[test]
    fn backoff_doubles_per_retry_without_jitter() {
        let policy = RetryPolicy::standard()
            .base_backoff(Duration::from_millis(50))
            .max_backoff(Duration::from_secs(1))
            .jitter_ratio(0.0);

        assert_eq!(policy.backoff_for_retry(1), Duration::from_millis(50));
        assert_eq!(policy.backoff_for_retry(2), Duration::from_millis(100));
        assert_eq!(policy.backoff_for_retry(3), Duration::from_millis(200));
        assert_eq!(policy.backoff_for_retry(10), Duration::from_secs(1));
    }

    #[test]
    fn retry_after_header_overrides_backoff_within_cap() {
        let policy = RetryPolicy::standard()
            .base_backoff(Duration::from_millis(10))
            .max_backoff(Duration::from_secs(3))
            .jitter_ratio(0.0);
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));

        assert_eq!(policy.delay_for_status(1, &headers), Duration::from_secs(2));
    }

    #[test]
    fn default_status_set_covers_throttling_and_server_errors() {
        let policy = RetryPolicy::standard();
        assert!(policy.is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(policy.is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!policy.is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!RetryPolicy::immediate().is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn retries_from_count_maps_sentinel_values() {
        assert_eq!(Retries::from_count(-1), Retries::Forever);
        assert_eq!(Retries::from_count(0), Retries::NONE);
        assert_eq!(Retries::from_count(-5), Retries::NONE);
        assert_eq!(Retries::from_count(3), Retries::Limited(3));
        assert!(Retries::Limited(2).allows(1));
        assert!(!Retries::Limited(2).allows(2));
        assert!(Retries::Forever.allows(usize::MAX));
    }
}

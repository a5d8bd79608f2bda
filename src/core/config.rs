use std::time::Duration;

use serde::Deserialize;

use crate::redirect::RedirectPolicy;
use crate::retry::{Retries, RetryPolicy};

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_TCP_KEEPALIVE: Duration = Duration::from_secs(7);
pub(crate) const DEFAULT_MAX_IDLE_PER_HOST: usize = 20;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientProfile {
    #[default]
    Standard,
    LowLatency,
    Bulk,
}

impl ClientProfile {
    pub fn config(self) -> SettingsConfig {
        match self {
            Self::Standard => SettingsConfig::default(),
            Self::LowLatency => SettingsConfig {
                timeout_ms: 2_000,
                retries: 1,
                retry_base_backoff_ms: 50,
                retry_max_backoff_ms: 300,
                max_redirects: 3,
                pool_max_idle_per_host: 32,
                ..SettingsConfig::default()
            },
            Self::Bulk => SettingsConfig {
                timeout_ms: 120_000,
                retries: 3,
                retry_base_backoff_ms: 150,
                retry_max_backoff_ms: 3_000,
                pool_idle_timeout_ms: Some(90_000),
                pool_max_idle_per_host: 64,
                ..SettingsConfig::default()
            },
        }
    }
}

/// Deserializable form of `ClientSettings`.
///
/// Every field has a default, so a partial document such as
/// `{"timeout_ms": 5000, "retries": 2}` is complete. Durations are whole
/// milliseconds; `0` disables the corresponding deadline.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    pub profile: Option<ClientProfile>,
    pub timeout_ms: u64,
    /// `-1` retries forever.
    pub retries: i64,
    pub retry_base_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub user_agent: Option<String>,
    pub gzip: bool,
    pub debug: bool,
    pub dump_body: bool,
    pub enable_cookie: bool,
    pub follow_redirects: bool,
    pub max_redirects: usize,
    pub proxy: Option<String>,
    pub no_proxy: Vec<String>,
    pub pool_idle_timeout_ms: Option<u64>,
    pub pool_max_idle_per_host: usize,
    pub tcp_keepalive_ms: u64,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            profile: None,
            timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            retries: 0,
            retry_base_backoff_ms: 100,
            retry_max_backoff_ms: 2_000,
            user_agent: None,
            gzip: true,
            debug: false,
            dump_body: true,
            enable_cookie: false,
            follow_redirects: true,
            max_redirects: 10,
            proxy: None,
            no_proxy: Vec::new(),
            pool_idle_timeout_ms: None,
            pool_max_idle_per_host: DEFAULT_MAX_IDLE_PER_HOST,
            tcp_keepalive_ms: DEFAULT_TCP_KEEPALIVE.as_millis() as u64,
        }
    }
}

impl SettingsConfig {
    /// Applies the named profile underneath this document: fields equal to
    /// their default take the profile's value instead.
    pub fn resolved(&self) -> Self {
        let Some(profile) = self.profile else {
            return self.clone();
        };
        let base = profile.config();
        let defaults = Self::default();
        macro_rules! pick {
            ($field:ident) => {
                if self.$field == defaults.$field {
                    base.$field.clone()
                } else {
                    self.$field.clone()
                }
            };
        }
        Self {
            profile: Some(profile),
            timeout_ms: pick!(timeout_ms),
            retries: pick!(retries),
            retry_base_backoff_ms: pick!(retry_base_backoff_ms),
            retry_max_backoff_ms: pick!(retry_max_backoff_ms),
            user_agent: pick!(user_agent),
            gzip: pick!(gzip),
            debug: pick!(debug),
            dump_body: pick!(dump_body),
            enable_cookie: pick!(enable_cookie),
            follow_redirects: pick!(follow_redirects),
            max_redirects: pick!(max_redirects),
            proxy: pick!(proxy),
            no_proxy: pick!(no_proxy),
            pool_idle_timeout_ms: pick!(pool_idle_timeout_ms),
            pool_max_idle_per_host: pick!(pool_max_idle_per_host),
            tcp_keepalive_ms: pick!(tcp_keepalive_ms),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn default_retries(&self) -> Retries {
        Retries::from_count(self.retries)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::standard()
            .base_backoff(Duration::from_millis(self.retry_base_backoff_ms))
            .max_backoff(Duration::from_millis(self.retry_max_backoff_ms))
    }

    pub fn redirect_policy(&self) -> RedirectPolicy {
        if self.follow_redirects {
            RedirectPolicy::limited(self.max_redirects)
        } else {
            RedirectPolicy::none()
        }
    }

    pub(crate) fn tcp_keepalive(&self) -> Option<Duration> {
        (self.tcp_keepalive_ms > 0).then(|| Duration::from_millis(self.tcp_keepalive_ms))
    }

    pub(crate) fn pool_idle_timeout(&self) -> Option<Duration> {
        self.pool_idle_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{ClientProfile, SettingsConfig};
    use crate::retry::Retries;

    #[test]
    fn partial_document_keeps_defaults() {
        let config: SettingsConfig =
            serde_json::from_str(r#"{"timeout_ms": 5000, "retries": -1, "no_proxy": ["internal"]}"#)
                .expect("config should deserialize");
        assert_eq!(config.timeout(), Duration::from_secs(5));
        assert_eq!(config.default_retries(), Retries::Forever);
        assert!(config.gzip);
        assert!(config.redirect_policy().enabled());
        assert_eq!(config.redirect_policy().max_redirects(), 10);
        assert_eq!(config.no_proxy, vec!["internal".to_owned()]);
    }

    #[test]
    fn profile_fills_untouched_fields() {
        let config: SettingsConfig =
            serde_json::from_str(r#"{"profile": "low_latency", "retries": 4}"#)
                .expect("config should deserialize");
        let resolved = config.resolved();
        assert_eq!(resolved.timeout(), Duration::from_secs(2));
        assert_eq!(resolved.retries, 4);
        assert_eq!(resolved.pool_max_idle_per_host, 32);
        assert_eq!(ClientProfile::Bulk.config().default_retries(), Retries::Limited(3));
    }

    #[test]
    fn disabled_redirects_and_keepalive() {
        let config = SettingsConfig {
            follow_redirects: false,
            tcp_keepalive_ms: 0,
            ..SettingsConfig::default()
        };
        assert!(!config.redirect_policy().enabled());
        assert_eq!(config.tcp_keepalive(), None);
    }
}

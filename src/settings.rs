use std::net::SocketAddr;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::hooks::CacheConfig;
use crate::mfa::MfaConfig;
use crate::request::RequestConfig;
use crate::CLIENT_NAME;

const CONFIG_NAME: &str = "config.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub api: ApiSettings,
    pub requests: RequestSettings,
    pub mfa: MfaSettings,
    pub connect: ConnectSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiSettings {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api".to_string(),
            token: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestSettings {
    pub max_concurrent: usize,
    pub min_interval_ms: u64,
    pub cache_ttl_ms: u64,
}

impl From<&RequestSettings> for RequestConfig {
    fn from(s: &RequestSettings) -> Self {
        RequestConfig {
            max_concurrent: s.max_concurrent,
            min_interval: Duration::from_millis(s.min_interval_ms),
            cache_ttl: Duration::from_millis(s.cache_ttl_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MfaSettings {
    pub timeout_secs: u64,
    pub warning_threshold_secs: u64,
    pub poll_interval_secs: u64,
}

impl From<&MfaSettings> for MfaConfig {
    fn from(s: &MfaSettings) -> Self {
        MfaConfig {
            timeout: Duration::from_secs(s.timeout_secs),
            warning_threshold: Duration::from_secs(s.warning_threshold_secs),
            poll_interval: Duration::from_secs(s.poll_interval_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectSettings {
    pub sdk_url: String,
    pub locale: String,
    pub theme: String,
    pub listen: SocketAddr,
    pub session_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    pub connectors_ttl_secs: u64,
    pub stale_secs: u64,
}

impl From<&CacheSettings> for CacheConfig {
    fn from(s: &CacheSettings) -> Self {
        CacheConfig {
            stale_after: Duration::from_secs(s.stale_secs),
            connectors_ttl: Duration::from_secs(s.connectors_ttl_secs),
        }
    }
}

impl Settings {
    pub fn new(config_path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut s = Config::builder()
            .set_default("api.base_url", "http://localhost:8000/api")?
            .set_default("api.timeout_secs", 30)?
            .set_default("requests.max_concurrent", 10)?
            .set_default("requests.min_interval_ms", 100)?
            .set_default("requests.cache_ttl_ms", 5000)?
            .set_default("mfa.timeout_secs", 60)?
            .set_default("mfa.warning_threshold_secs", 20)?
            .set_default("mfa.poll_interval_secs", 5)?
            .set_default("connect.sdk_url", pluggy_connect::DEFAULT_SDK_URL)?
            .set_default("connect.locale", "pt")?
            .set_default("connect.theme", "light")?
            .set_default("connect.listen", "127.0.0.1:4545")?
            .set_default("connect.session_timeout_secs", 600)?
            .set_default("cache.connectors_ttl_secs", 86_400)?
            .set_default("cache.stale_secs", 30)?;

        let path = config_path
            .map(str::to_string)
            .unwrap_or_else(default_config_path);
        s = s.add_source(File::with_name(&path).required(config_path.is_some()));

        s.add_source(Environment::with_prefix("CAIXAHUB").separator("__"))
            .build()?
            .try_deserialize()
    }
}

pub(crate) fn default_config_path() -> String {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(CLIENT_NAME)
        .join(CONFIG_NAME)
        .display()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_a_config_file() {
        let settings = Settings::new(None).unwrap();

        assert_eq!(settings.mfa.timeout_secs, 60);
        assert_eq!(settings.mfa.warning_threshold_secs, 20);
        assert_eq!(settings.requests.max_concurrent, 10);
        assert_eq!(settings.connect.locale, "pt");

        let requests = RequestConfig::from(&settings.requests);
        assert_eq!(requests.min_interval, Duration::from_millis(100));
    }
}

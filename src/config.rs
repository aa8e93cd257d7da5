use crate::error::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_PRIMARY_ENDPOINT: &str = "http://localhost:5002";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub primary_endpoint: String,
    pub fallback_endpoints: Vec<String>,
    pub health_path: String,
    pub max_retries: u32,
    #[serde(deserialize_with = "duration_ms")]
    pub retry_delay: Duration,
    #[serde(deserialize_with = "duration_ms")]
    pub retry_max_delay: Duration,
    #[serde(deserialize_with = "duration_ms")]
    pub timeout: Duration,
    #[serde(deserialize_with = "duration_ms")]
    pub connection_check_interval: Duration,
    #[serde(deserialize_with = "duration_ms")]
    pub health_check_timeout: Duration,
    #[serde(deserialize_with = "duration_ms")]
    pub offline_threshold: Duration,
    pub cache_enabled: bool,
    #[serde(deserialize_with = "duration_ms")]
    pub cache_duration: Duration,
    #[serde(deserialize_with = "duration_ms")]
    pub cache_sweep_interval: Duration,
    /// Serve expired cache entries when the network cannot answer.
    pub offline_mode: bool,
    /// Persist queue, cache and endpoint selection to this JSON file.
    pub store_path: Option<PathBuf>,
    pub channel: ChannelConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            primary_endpoint: DEFAULT_PRIMARY_ENDPOINT.to_string(),
            fallback_endpoints: (5003..=5006)
                .map(|port| format!("http://localhost:{port}"))
                .collect(),
            health_path: "/api/health".to_string(),
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            retry_max_delay: Duration::from_millis(10_000),
            timeout: Duration::from_millis(15_000),
            connection_check_interval: Duration::from_millis(5000),
            health_check_timeout: Duration::from_millis(5000),
            offline_threshold: Duration::from_millis(30_000),
            cache_enabled: true,
            cache_duration: Duration::from_millis(300_000),
            cache_sweep_interval: Duration::from_secs(30 * 60),
            offline_mode: false,
            store_path: None,
            channel: ChannelConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Explicit channel URL; derived from the selected endpoint (`ws(s)://host/ws`) when unset.
    pub url: Option<String>,
    #[serde(deserialize_with = "duration_ms")]
    pub connect_timeout: Duration,
    #[serde(deserialize_with = "duration_ms")]
    pub ping_interval: Duration,
    pub max_reconnect_attempts: u32,
    #[serde(deserialize_with = "duration_ms")]
    pub base_delay: Duration,
    #[serde(deserialize_with = "duration_ms")]
    pub short_lived_base_delay: Duration,
    #[serde(deserialize_with = "duration_ms")]
    pub max_delay: Duration,
    #[serde(deserialize_with = "duration_ms")]
    pub short_lived_threshold: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: None,
            connect_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            base_delay: Duration::from_secs(1),
            short_lived_base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(60),
            short_lived_threshold: Duration::from_secs(1),
        }
    }
}

impl NetworkConfig {
    pub fn load() -> Result<Self> {
        Self::load_from("config/local")
    }

    /// Layers an optional config file (any extension the `config` crate understands)
    /// under `QUESTLINK__*` environment variables.
    pub fn load_from(path: &str) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("QUESTLINK")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("fallback_endpoints")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
            .with_context(|| format!("failed to deserialise network config from {path}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for endpoint in self.endpoints() {
            let url = Url::parse(endpoint)
                .with_context(|| format!("invalid endpoint url `{endpoint}`"))?;
            crate::ensure_err!(
                matches!(url.scheme(), "http" | "https"),
                "endpoint `{endpoint}` must use http or https"
            );
        }
        if let Some(url) = &self.channel.url {
            let parsed =
                Url::parse(url).with_context(|| format!("invalid channel url `{url}`"))?;
            crate::ensure_err!(
                matches!(parsed.scheme(), "ws" | "wss"),
                "channel url `{url}` must use ws or wss"
            );
        }
        crate::ensure_err!(
            self.health_path.starts_with('/'),
            "health_path must start with '/'"
        );
        crate::ensure_err!(
            self.channel.max_reconnect_attempts > 0,
            "channel.max_reconnect_attempts must be at least 1"
        );

        let periods = [
            ("timeout", self.timeout),
            ("connection_check_interval", self.connection_check_interval),
            ("health_check_timeout", self.health_check_timeout),
            ("cache_sweep_interval", self.cache_sweep_interval),
            ("channel.connect_timeout", self.channel.connect_timeout),
            ("channel.ping_interval", self.channel.ping_interval),
        ];
        for (name, value) in periods {
            crate::ensure_err!(!value.is_zero(), "{name} must be greater than zero");
        }
        Ok(())
    }

    /// Primary first, then fallbacks in configured order.
    pub fn endpoints(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary_endpoint.as_str())
            .chain(self.fallback_endpoints.iter().map(String::as_str))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationValue {
    Millis(u64),
    Text(String),
}

fn duration_ms<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match DurationValue::deserialize(deserializer)? {
        DurationValue::Millis(ms) => Ok(Duration::from_millis(ms)),
        DurationValue::Text(text) => match text.trim().parse::<u64>() {
            Ok(ms) => Ok(Duration::from_millis(ms)),
            Err(_) => humantime::parse_duration(text.trim()).map_err(serde::de::Error::custom),
        },
    }
}

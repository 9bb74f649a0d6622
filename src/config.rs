use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use dotenv::dotenv;
use topic_broker::BrokerConfig;
use tracing::info;

const APP_ID: &str = "APP_ID";
const BROKER_MAX_ATTEMPTS: &str = "BROKER_MAX_ATTEMPTS";
const BROKER_BASE_BACKOFF_MS: &str = "BROKER_BASE_BACKOFF_MS";
const BROKER_MAX_BACKOFF_MS: &str = "BROKER_MAX_BACKOFF_MS";
const BROKER_VISIBILITY_TIMEOUT_MS: &str = "BROKER_VISIBILITY_TIMEOUT_MS";
const BROKER_PREFETCH: &str = "BROKER_PREFETCH";
const BROKER_SNAPSHOT_PATH: &str = "BROKER_SNAPSHOT_PATH";
const NOTIFY_FROM: &str = "NOTIFY_FROM";
const NOTIFY_RECIPIENTS: &str = "NOTIFY_RECIPIENTS";

const DEFAULT_APP_ID: &str = "catalog-notifier";
const DEFAULT_NOTIFY_FROM: &str = "catalog@localhost";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse environment variable {name}: '{value}'")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub app_id: String,
    pub broker: BrokerConfig,
    /// Sender address of notification emails
    pub notify_from: String,
    pub recipients: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_id: DEFAULT_APP_ID.to_owned(),
            broker: BrokerConfig::default(),
            notify_from: DEFAULT_NOTIFY_FROM.to_owned(),
            recipients: Vec::new(),
        }
    }
}

impl Config {
    /// Loads `.env` (if present) and reads the process environment
    pub fn try_from_env() -> Result<Config, ConfigError> {
        dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the config from any variable source; unset variables keep their defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config, ConfigError> {
        let mut config = Config::default();
        let mut broker = BrokerConfig::default();

        if let Some(app_id) = lookup(APP_ID) {
            config.app_id = app_id;
        }

        if let Some(attempts) = parse::<u32>(&lookup, BROKER_MAX_ATTEMPTS)? {
            broker = broker.with_max_attempts(attempts);
        }

        let base = parse::<u64>(&lookup, BROKER_BASE_BACKOFF_MS)?.map(Duration::from_millis);
        let max = parse::<u64>(&lookup, BROKER_MAX_BACKOFF_MS)?.map(Duration::from_millis);
        if base.is_some() || max.is_some() {
            let base = base.unwrap_or(broker.base_backoff);
            let max = max.unwrap_or(broker.max_backoff);
            broker = broker.with_backoff(base, max);
        }

        if let Some(timeout) = parse::<u64>(&lookup, BROKER_VISIBILITY_TIMEOUT_MS)? {
            broker = broker.with_visibility_timeout(Duration::from_millis(timeout));
        }

        if let Some(prefetch) = parse::<usize>(&lookup, BROKER_PREFETCH)? {
            broker = broker.with_prefetch(prefetch);
        }

        if let Some(path) = lookup(BROKER_SNAPSHOT_PATH).filter(|path| !path.trim().is_empty()) {
            let interval = broker.snapshot_interval;
            broker = broker.with_snapshot(PathBuf::from(path.trim()), interval);
        }
        config.broker = broker;

        if let Some(from) = lookup(NOTIFY_FROM) {
            config.notify_from = from.trim().to_owned();
        }

        if let Some(recipients) = lookup(NOTIFY_RECIPIENTS) {
            config.recipients = recipients
                .split(',')
                .map(str::trim)
                .filter(|recipient| !recipient.is_empty())
                .map(str::to_owned)
                .collect();
            info!("Parsed {} notification recipients from env", config.recipients.len());
        }

        Ok(config)
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

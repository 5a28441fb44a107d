use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::resilience::BreakerPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub services: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default = "default_ratings")]
    pub ratings: DependencyConfig,
    #[serde(default = "default_movie_info")]
    pub movie_info: DependencyConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default)]
    pub tlscert: Option<String>,
    #[serde(default)]
    pub tlskey: Option<String>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: None,
            port: default_port(),
            tlscert: None,
            tlskey: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// One upstream dependency: the logical service name it is resolved under,
/// plus breaker overrides on top of that dependency's baseline policy.
#[derive(Debug, Clone, Deserialize)]
pub struct DependencyConfig {
    pub service: String,
    #[serde(default)]
    pub breaker: BreakerSettings,
}

/// Breaker options as they appear in the config file. Unset keys keep the
/// baseline value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BreakerSettings {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub window_size: Option<usize>,
    #[serde(default)]
    pub error_threshold_percentage: Option<u32>,
    #[serde(default)]
    pub cooldown_ms: Option<u64>,
}

impl BreakerSettings {
    pub fn apply(&self, base: BreakerPolicy) -> BreakerPolicy {
        BreakerPolicy {
            timeout: self.timeout_ms.map(Duration::from_millis).unwrap_or(base.timeout),
            window_size: self.window_size.unwrap_or(base.window_size),
            error_threshold_percentage: self
                .error_threshold_percentage
                .unwrap_or(base.error_threshold_percentage),
            cooldown: self.cooldown_ms.map(Duration::from_millis).unwrap_or(base.cooldown),
        }
    }
}

fn default_port() -> String {
    "8081".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_max_concurrent_fetches() -> usize {
    8
}

fn default_ratings() -> DependencyConfig {
    DependencyConfig {
        service: "ratings-service".to_string(),
        breaker: BreakerSettings::default(),
    }
}

fn default_movie_info() -> DependencyConfig {
    DependencyConfig {
        service: "movie-info-service".to_string(),
        breaker: BreakerSettings::default(),
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_string(), e))?;

        Self::from_yaml(&content).map_err(|e| match e {
            ConfigError::ParseError(_, err) => ConfigError::ParseError(path.to_string(), err),
            other => other,
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(content)
            .map_err(|e| ConfigError::ParseError("<inline>".to_string(), e))?;

        config.validate()?;
        Ok(config)
    }

    pub fn ratings_policy(&self) -> BreakerPolicy {
        self.ratings.breaker.apply(BreakerPolicy::ratings())
    }

    pub fn movie_info_policy(&self) -> BreakerPolicy {
        self.movie_info.breaker.apply(BreakerPolicy::default())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client.max_concurrent_fetches == 0 {
            return Err(ConfigError::Invalid(
                "client.max_concurrent_fetches must be at least 1".to_string(),
            ));
        }

        for (name, dep, policy) in [
            ("ratings", &self.ratings, self.ratings_policy()),
            ("movie_info", &self.movie_info, self.movie_info_policy()),
        ] {
            if policy.timeout.is_zero() {
                return Err(ConfigError::Invalid(format!("{}.breaker.timeout_ms must be > 0", name)));
            }
            if policy.window_size == 0 {
                return Err(ConfigError::Invalid(format!("{}.breaker.window_size must be >= 1", name)));
            }
            if !(1..=100).contains(&policy.error_threshold_percentage) {
                return Err(ConfigError::Invalid(format!(
                    "{}.breaker.error_threshold_percentage must be within 1..=100",
                    name
                )));
            }
            if !self.services.contains_key(&dep.service) {
                return Err(ConfigError::Invalid(format!(
                    "{}: service {} has no entry under services",
                    name, dep.service
                )));
            }
        }

        for (service, urls) in &self.services {
            if urls.is_empty() {
                return Err(ConfigError::Invalid(format!("service {} has no addresses", service)));
            }
            for url in urls {
                reqwest::Url::parse(url).map_err(|e| {
                    ConfigError::Invalid(format!("service {}: bad address {}: {}", service, url, e))
                })?;
            }
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadError(String, std::io::Error),
    #[error("Failed to parse config file {0}: {1}")]
    ParseError(String, serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

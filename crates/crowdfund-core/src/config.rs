use std::{fs, path::Path, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::{normalize_address, Address};

pub const DEFAULT_MODULE_ADDRESS: &str =
    "0x81810d53b183eca4645f5bc37fe2cfb3d53af83ed8a6af3b4df7b04f703c8050";
pub const DEFAULT_MODULE_NAME: &str = "crowdfund";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Bounded exponential backoff for transient (network) failures.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one; 1 disables retries.
    pub attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 200,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            attempts: 1,
            base_delay_ms: 0,
        }
    }

    /// Delay before retry number `attempt + 1`: `base * 2^attempt` plus up to
    /// half a base of jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.base_delay_ms == 0 {
            return Duration::ZERO;
        }
        let exp = self.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
        let jitter = rand::thread_rng().gen_range(0..=self.base_delay_ms / 2);
        Duration::from_millis(exp.saturating_add(jitter))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub module_address: Address,
    pub module_name: String,
    /// Defaults to the module address (the deployer hosts the registry).
    pub registry_address: Option<Address>,
    /// Concurrency window for registry-wide fan-out and the cap on
    /// transport calls in flight per client.
    pub max_in_flight: usize,
    pub timeout_ms: u64,
    pub retry: RetryPolicy,
    /// Text-suggestion proxy endpoint (`http://host:port/path`).
    pub suggest_url: Option<String>,
    /// Silences `warn:` lines for degraded reads.
    pub quiet: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            module_address: DEFAULT_MODULE_ADDRESS.to_string(),
            module_name: DEFAULT_MODULE_NAME.to_string(),
            registry_address: None,
            max_in_flight: 8,
            timeout_ms: 10_000,
            retry: RetryPolicy::default(),
            suggest_url: None,
            quiet: false,
        }
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let mut config: ClientConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks invariants and canonicalizes addresses in place.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.max_in_flight == 0 {
            return Err(ConfigError::Invalid("max_in_flight must be > 0".into()));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeout_ms must be > 0".into()));
        }
        if self.retry.attempts == 0 {
            return Err(ConfigError::Invalid("retry.attempts must be >= 1".into()));
        }
        if self.module_name.is_empty()
            || !self
                .module_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ConfigError::Invalid(format!(
                "bad module_name {:?}",
                self.module_name
            )));
        }
        self.module_address = normalize_address(&self.module_address)
            .map_err(|e| ConfigError::Invalid(format!("module_address: {e}")))?;
        if let Some(registry) = self.registry_address.take() {
            self.registry_address = Some(
                normalize_address(&registry)
                    .map_err(|e| ConfigError::Invalid(format!("registry_address: {e}")))?,
            );
        }
        Ok(())
    }

    pub fn registry_address(&self) -> &str {
        self.registry_address
            .as_deref()
            .unwrap_or(self.module_address.as_str())
    }

    /// Fully qualified Move function id, `0x…::crowdfund::<name>`.
    pub fn function_id(&self, name: &str) -> String {
        format!("{}::{}::{}", self.module_address, self.module_name, name)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = ClientConfig::from_json("{}").unwrap();
        assert_eq!(config.max_in_flight, 8);
        assert_eq!(config.registry_address(), DEFAULT_MODULE_ADDRESS);
        assert_eq!(
            config.function_id("get_campaign_info"),
            format!("{DEFAULT_MODULE_ADDRESS}::crowdfund::get_campaign_info")
        );
    }

    #[test]
    fn overrides_and_normalizes_addresses() {
        let config = ClientConfig::from_json(
            r#"{"module_address":"0xABC","registry_address":"0xDEF","retry":{"attempts":5}}"#,
        )
        .unwrap();
        assert_eq!(config.module_address, "0xabc");
        assert_eq!(config.registry_address(), "0xdef");
        assert_eq!(config.retry.attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 200);
    }

    #[test]
    fn rejects_zero_window_and_bad_addresses() {
        assert!(matches!(
            ClientConfig::from_json(r#"{"max_in_flight":0}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ClientConfig::from_json(r#"{"module_address":"not-hex"}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ClientConfig::from_json("[1,2]"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn backoff_grows_exponentially() {
        let policy = RetryPolicy {
            attempts: 4,
            base_delay_ms: 100,
        };
        let first = policy.delay_for(0).as_millis();
        let third = policy.delay_for(2).as_millis();
        assert!((100..=150).contains(&first));
        assert!((400..=450).contains(&third));
        assert_eq!(RetryPolicy::none().delay_for(3), Duration::ZERO);
    }
}

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use coord::store::gateway::DEFAULT_ENDPOINT;
use coord::SessionConfig;
use serde::Deserialize;

/// On-disk configuration. Every field is optional; missing ones fall back to
/// the library defaults.
#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub endpoint: Option<String>,
    #[serde(default)]
    pub session: SessionSection,
}

#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SessionSection {
    pub ttl_ms: Option<u64>,
    pub keep_alive_interval_ms: Option<u64>,
    pub max_keep_alive_failures: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub close_timeout_ms: Option<u64>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// `--endpoint` wins over the file, the file over the default.
    pub fn endpoint(&self, flag: Option<&str>) -> String {
        flag.or(self.endpoint.as_deref())
            .unwrap_or(DEFAULT_ENDPOINT)
            .to_string()
    }

    pub fn session_config(&self) -> Result<SessionConfig> {
        let s = &self.session;
        let defaults = SessionConfig::default();
        let ttl = s.ttl_ms.map(Duration::from_millis).unwrap_or(defaults.ttl);
        let interval = s
            .keep_alive_interval_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| defaults.keep_alive_interval.min(ttl / 3));

        let mut config = SessionConfig::new(ttl, interval);
        if let Some(n) = s.max_keep_alive_failures {
            config = config.with_max_keep_alive_failures(n);
        }
        if let Some(ms) = s.initial_backoff_ms {
            config = config.with_initial_backoff(Duration::from_millis(ms));
        }
        if let Some(ms) = s.max_backoff_ms {
            config = config.with_max_backoff(Duration::from_millis(ms));
        }
        if let Some(ms) = s.request_timeout_ms {
            config = config.with_request_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = s.close_timeout_ms {
            config = config.with_close_timeout(Duration::from_millis(ms));
        }
        config.validate()?;
        Ok(config)
    }
}

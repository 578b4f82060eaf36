use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// Agent configuration. Every field has a default so a partial TOML file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub license_key: String,
    pub application_id: String,
    /// Fresh v4 UUID unless pinned.
    pub agent_id: String,
    /// Collector host, without scheme.
    pub beacon: String,
    pub ssl: bool,
    /// Reported as `ref` on every request.
    pub page_url: String,
    pub request_timeout_secs: u64,
    /// Delay applied to a 429 that carries no Retry-After header.
    pub too_many_requests_delay_secs: u64,
    /// Fallback retry delay for retryable results that carry no delay.
    pub retry_delay_secs: Option<u64>,
    pub jserrors: HarvestedFeatureConfig,
    pub metrics: MetricsConfig,
    pub custom_events: CustomEventsConfig,
    pub vitals: HarvestedFeatureConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            license_key: String::new(),
            application_id: String::new(),
            agent_id: uuid::Uuid::new_v4().to_string(),
            beacon: "bam.nr-data.net".to_string(),
            ssl: true,
            page_url: String::new(),
            request_timeout_secs: 30,
            too_many_requests_delay_secs: 60,
            retry_delay_secs: None,
            jserrors: HarvestedFeatureConfig::every(10),
            metrics: MetricsConfig::default(),
            custom_events: CustomEventsConfig::default(),
            vitals: HarvestedFeatureConfig::every(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestedFeatureConfig {
    pub enabled: bool,
    pub harvest_interval_secs: u64,
}

impl HarvestedFeatureConfig {
    pub fn every(secs: u64) -> Self {
        Self { enabled: true, harvest_interval_secs: secs }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.harvest_interval_secs)
    }
}

impl Default for HarvestedFeatureConfig {
    fn default() -> Self {
        Self::every(30)
    }
}

/// Metrics are harvested once, at unload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomEventsConfig {
    pub enabled: bool,
    pub harvest_interval_secs: u64,
    /// Events beyond this many in one harvest window are dropped.
    pub max_events_per_harvest: usize,
}

impl Default for CustomEventsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            harvest_interval_secs: 30,
            max_events_per_harvest: 1000,
        }
    }
}

impl CustomEventsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.harvest_interval_secs)
    }
}

impl AgentConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, AgentError> {
        let config: AgentConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let raw = std::fs::read_to_string(path).map_err(|source| AgentError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn retry_delay(&self) -> Option<Duration> {
        self.retry_delay_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.beacon.trim().is_empty() {
            return Err(invalid("beacon must not be empty"));
        }
        if self.jserrors.enabled && self.jserrors.harvest_interval_secs == 0 {
            return Err(invalid("jserrors.harvest_interval_secs must be > 0"));
        }
        if self.vitals.enabled && self.vitals.harvest_interval_secs == 0 {
            return Err(invalid("vitals.harvest_interval_secs must be > 0"));
        }
        if self.custom_events.enabled {
            if self.custom_events.harvest_interval_secs == 0 {
                return Err(invalid("custom_events.harvest_interval_secs must be > 0"));
            }
            if self.custom_events.max_events_per_harvest == 0 {
                return Err(invalid("custom_events.max_events_per_harvest must be > 0"));
            }
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> AgentError {
    AgentError::InvalidConfig { reason: reason.to_string() }
}

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::load::LoadPolicy;

/// Property key overriding [`ProducerConfig::accept_exceeding_max_load`].
pub const ACCEPT_JOB_LOADS_EXCEEDING_PROPERTY: &str = "jobflow.job.load.acceptexceeding";

/// Property key overriding [`ProducerConfig::host`].
pub const PRODUCER_HOST_PROPERTY: &str = "jobflow.producer.host";

/// Configuration of a job producer's admission behavior.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Accept jobs whose load exceeds this node's maximum load.
    pub accept_exceeding_max_load: bool,
    /// Host the producer runs on. Falls back to the registry's hostname.
    pub host: Option<String>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            accept_exceeding_max_load: true,
            host: None,
        }
    }
}

impl ProducerConfig {
    /// Build a config from flat service properties.
    ///
    /// Unknown keys are ignored; a value that does not parse as a boolean
    /// keeps the default.
    pub fn from_properties(properties: &HashMap<String, String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = properties.get(ACCEPT_JOB_LOADS_EXCEEDING_PROPERTY) {
            match parse_bool(raw) {
                Some(value) => config.accept_exceeding_max_load = value,
                None => tracing::warn!(
                    key = ACCEPT_JOB_LOADS_EXCEEDING_PROPERTY,
                    value = %raw,
                    "ignoring unparsable boolean property"
                ),
            }
        }
        if let Some(host) = properties.get(PRODUCER_HOST_PROPERTY) {
            let host = host.trim();
            if !host.is_empty() {
                config.host = Some(host.to_string());
            }
        }

        config
    }

    pub fn load_policy(&self) -> LoadPolicy {
        LoadPolicy::new(self.accept_exceeding_max_load)
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Configuration of the workflow engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Interval between status checks while an operation waits on jobs.
    pub job_poll_interval_ms: u64,
    /// Route FAILOVER retries to another host. When off, FAILOVER behaves as NONE.
    pub failover_enabled: bool,
    /// Buffer size of the workflow event broadcast channel.
    pub event_channel_capacity: usize,
    /// Identity workflows run under when started outside an execution context.
    pub system_user: String,
    pub system_organization: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            job_poll_interval_ms: 100,
            failover_enabled: true,
            event_channel_capacity: 256,
            system_user: "system".to_string(),
            system_organization: "default".to_string(),
        }
    }
}

impl WorkflowConfig {
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.job_poll_interval_ms = ms;
        self
    }

    pub fn with_failover(mut self, enabled: bool) -> Self {
        self.failover_enabled = enabled;
        self
    }

    pub fn with_system_identity(
        mut self,
        user: impl Into<String>,
        organization: impl Into<String>,
    ) -> Self {
        self.system_user = user.into();
        self.system_organization = organization.into();
        self
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.job_poll_interval_ms.max(1))
    }
}

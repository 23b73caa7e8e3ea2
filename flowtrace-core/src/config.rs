//! Telemetry configuration.
//!
//! ## Configuration Sources
//!
//! 1. The interpreter's default task variables (`opentelemetry` entry), passed
//!    in as a JSON value via [`TelemetryConfig::from_value`]
//! 2. A YAML file, via [`TelemetryConfig::from_yaml_file`] (used by the CLI)
//! 3. Built-in defaults
//!
//! ## Example
//!
//! ```yaml
//! enabled: true
//! endpoint: http://otel-collector:4318
//! stepsToTrace: [taskCall, flowCall, checkpoint]
//! entryPointVariableName: flowToRun
//! link: https://jaeger.example.com/trace/<traceId>
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use crate::error::{Result, TelemetryError};
use crate::interpreter::StepKind;

/// Placeholder replaced with the generated trace id in [`TelemetryConfig::link`].
pub const TRACE_ID_PLACEHOLDER: &str = "<traceId>";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryConfig {
    /// Whether telemetry collection is enabled
    #[serde(default)]
    pub enabled: bool,

    /// OTLP/HTTP base URL; `/v1/traces` is appended at export
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Step kinds that produce spans
    #[serde(default = "default_steps_to_trace")]
    pub steps_to_trace: HashSet<StepKind>,

    /// Variable holding the flow name to report instead of the entry point
    #[serde(default)]
    pub entry_point_variable_name: Option<String>,

    /// Trace link template containing `<traceId>`
    #[serde(default)]
    pub link: Option<String>,

    /// Resource `service.name`
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Extra headers sent with every OTLP request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Export request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Maximum number of spans per export request
    #[serde(default = "default_max_export_batch_size")]
    pub max_export_batch_size: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_endpoint(),
            steps_to_trace: default_steps_to_trace(),
            entry_point_variable_name: None,
            link: None,
            service_name: default_service_name(),
            headers: BTreeMap::new(),
            timeout_seconds: default_timeout(),
            max_export_batch_size: default_max_export_batch_size(),
        }
    }
}

fn default_endpoint() -> String {
    "http://localhost:4318".to_string()
}

fn default_steps_to_trace() -> HashSet<StepKind> {
    StepKind::ALL.into_iter().collect()
}

fn default_service_name() -> String {
    "flowtrace".to_string()
}

fn default_timeout() -> u64 {
    10
}

fn default_max_export_batch_size() -> usize {
    512
}

impl TelemetryConfig {
    /// Build a config from the interpreter's variables. `null` yields the
    /// (disabled) defaults.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        let config: Self = serde_json::from_value(value.clone())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(TelemetryError::Config("endpoint must not be empty".into()));
        }
        if self.max_export_batch_size == 0 {
            return Err(TelemetryError::Config(
                "maxExportBatchSize must be greater than zero".into(),
            ));
        }
        if let Some(link) = &self.link {
            if !link.contains(TRACE_ID_PLACEHOLDER) {
                return Err(TelemetryError::Config(format!(
                    "link '{link}' does not contain the {TRACE_ID_PLACEHOLDER} placeholder"
                )));
            }
        }
        Ok(())
    }

    pub fn traces(&self, kind: StepKind) -> bool {
        self.steps_to_trace.contains(&kind)
    }

    /// Render the configured trace link for `trace_id`.
    pub fn render_link(&self, trace_id: &str) -> Option<String> {
        self.link
            .as_ref()
            .map(|link| link.replace(TRACE_ID_PLACEHOLDER, trace_id))
    }
}

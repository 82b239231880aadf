use crate::application::orchestrator::ViewSettings;
use crate::application::polling_clock::FirstTick;
use crate::application::retry_scheduler::RetryPolicy;
use crate::domain::date_window::RangeSelector;
use crate::domain::error::TelemetryError;
use crate::domain::export::ColumnMapping;
use crate::domain::telemetry::{SeriesType, ViewIdentity};
use crate::domain::validation::ValidationPolicy;
use crate::infrastructure::provider_client::ProviderKind;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSettings,
    pub provider: ProviderSettings,
    pub identity: IdentitySettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub views: Vec<ViewConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Deserialize, Clone)]
pub struct IdentitySettings {
    pub entity_id: String,
    pub token: String,
}

impl std::fmt::Debug for IdentitySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentitySettings")
            .field("entity_id", &self.entity_id)
            .finish_non_exhaustive()
    }
}

impl From<IdentitySettings> for ViewIdentity {
    fn from(settings: IdentitySettings) -> Self {
        ViewIdentity::new(settings.entity_id, settings.token)
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            jitter_ms: policy.jitter.as_millis() as u64,
        }
    }
}

impl From<RetrySettings> for RetryPolicy {
    fn from(settings: RetrySettings) -> Self {
        RetryPolicy::new(
            settings.max_attempts,
            Duration::from_millis(settings.base_delay_ms),
            Duration::from_millis(settings.jitter_ms),
        )
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ViewConfig {
    pub name: String,
    pub series_type: SeriesType,
    pub selector: String,
    pub interval_secs: u64,
    #[serde(default)]
    pub first_tick: FirstTick,
    pub expected_series: Vec<String>,
    #[serde(default)]
    pub validation: ValidationPolicy,
    #[serde(default)]
    pub scales: Vec<ScaleConfig>,
    #[serde(default)]
    pub retry: Option<RetrySettings>,
    #[serde(default)]
    pub columns: Vec<ColumnConfig>,
}

/// Divisor from provider units to display units for one series.
#[derive(Debug, Deserialize, Clone)]
pub struct ScaleConfig {
    pub series: String,
    pub divisor: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ColumnConfig {
    pub series: String,
    pub label: String,
}

impl ViewConfig {
    pub fn to_settings(&self, default_retry: RetrySettings) -> Result<ViewSettings, TelemetryError> {
        if self.interval_secs == 0 {
            return Err(TelemetryError::InvalidRange(format!(
                "view {} has a zero poll interval",
                self.name
            )));
        }
        if let Some(scale) = self.scales.iter().find(|s| s.divisor == 0.0) {
            return Err(TelemetryError::InvalidRange(format!(
                "view {} divides {} by zero",
                self.name, scale.series
            )));
        }

        Ok(ViewSettings {
            name: self.name.clone(),
            series_type: self.series_type,
            expected_series: self.expected_series.clone(),
            selector: self.selector.parse::<RangeSelector>()?,
            poll_interval: Duration::from_secs(self.interval_secs),
            first_tick: self.first_tick,
            retry: self.retry.unwrap_or(default_retry).into(),
            validation: self.validation,
            scales: self
                .scales
                .iter()
                .map(|s| (s.series.clone(), s.divisor))
                .collect(),
            export_columns: self
                .columns
                .iter()
                .map(|c| ColumnMapping::new(c.series.clone(), c.label.clone()))
                .collect(),
        })
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

/// `config/dashboard.{toml,...}` overlaid with `SOLAR_` environment
/// variables, e.g. `SOLAR_IDENTITY__TOKEN`.
pub fn load_app_config() -> anyhow::Result<AppConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name("config/dashboard").required(false))
        .add_source(
            config::Environment::with_prefix("SOLAR")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    Ok(settings.try_deserialize()?)
}

/// Replace `${name}` placeholders in an endpoint template
pub fn prepare_endpoint(template: &str, vars: &HashMap<&str, String>) -> String {
    let mut result = template.to_string();
    for (key, value) in vars {
        let placeholder = format!("${{{}}}", key);
        result = result.replace(&placeholder, value);
    }
    result
}

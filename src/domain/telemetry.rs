// Telemetry data domain models
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimePoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl TimePoint {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Named series as returned by a provider, keyed by series name.
///
/// Samples within a series are expected in ascending order but may repeat a
/// timestamp; the merger resolves duplicates.
pub type SeriesSet = BTreeMap<String, Vec<TimePoint>>;

/// One row per distinct timestamp across a [`SeriesSet`].
///
/// Field names are part of the export and HTTP contract.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedRecord {
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<String, Option<f64>>,
}

impl MergedRecord {
    pub fn value(&self, series: &str) -> Option<f64> {
        self.values.get(series).copied().flatten()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesType {
    PowerFlow,
    EnergyHistory,
    Notifications,
}

impl SeriesType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PowerFlow => "power_flow",
            Self::EnergyHistory => "energy_history",
            Self::Notifications => "notifications",
        }
    }
}

impl fmt::Display for SeriesType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity plus credentials a view polls with. Changing either one is an
/// identity change.
#[derive(Clone, PartialEq, Eq)]
pub struct ViewIdentity {
    pub entity_id: String,
    pub token: String,
}

impl ViewIdentity {
    pub fn new(entity_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            token: token.into(),
        }
    }
}

// Keep tokens out of logs.
impl fmt::Debug for ViewIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewIdentity")
            .field("entity_id", &self.entity_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

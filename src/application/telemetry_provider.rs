// Provider trait for telemetry data access
use crate::domain::date_window::{DateWindow, SamplingInterval};
use crate::domain::error::TelemetryError;
use crate::domain::telemetry::{SeriesSet, SeriesType, ViewIdentity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Everything a provider needs to answer one fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub identity: ViewIdentity,
    pub series_type: SeriesType,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub interval: SamplingInterval,
}

impl FetchRequest {
    pub fn new(identity: ViewIdentity, series_type: SeriesType, window: &DateWindow) -> Self {
        Self {
            identity,
            series_type,
            start: window.start,
            end: window.end,
            interval: window.interval,
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.identity.entity_id
    }

    pub fn token(&self) -> &str {
        &self.identity.token
    }
}

#[async_trait]
pub trait TelemetryProvider: Send + Sync {
    /// Fetch every series the provider has for the request window.
    ///
    /// Transport and auth failures are hard errors; a stub or undecodable
    /// envelope is `TelemetryError::IncompleteData`.
    async fn fetch_telemetry(&self, request: &FetchRequest) -> Result<SeriesSet, TelemetryError>;
}

// HTTP provider implementation for Goodwe, SolarEdge and Victron
use crate::application::telemetry_provider::{FetchRequest, TelemetryProvider};
use crate::domain::date_window::SamplingInterval;
use crate::domain::error::TelemetryError;
use crate::domain::telemetry::{SeriesSet, SeriesType};
use crate::infrastructure::config::prepare_endpoint;
use crate::infrastructure::payload_decoder::{decode, decode_alerts};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Goodwe,
    SolarEdge,
    Victron,
    Generic,
}

/// Where the provider expects the caller's token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthScheme {
    Query(&'static str),
    Header { name: &'static str, prefix: &'static str },
}

impl ProviderKind {
    fn auth_scheme(&self) -> AuthScheme {
        match self {
            Self::SolarEdge => AuthScheme::Query("api_key"),
            Self::Victron => AuthScheme::Header {
                name: "X-Authorization",
                prefix: "Token ",
            },
            Self::Goodwe => AuthScheme::Header {
                name: "Token",
                prefix: "",
            },
            Self::Generic => AuthScheme::Header {
                name: "Authorization",
                prefix: "Bearer ",
            },
        }
    }

    fn endpoint_template(&self, series_type: SeriesType) -> &'static str {
        match (self, series_type) {
            (Self::SolarEdge, SeriesType::EnergyHistory) => {
                "/site/${entity}/energyDetails?meters=Production,Consumption,FeedIn,Purchased,SelfConsumption&timeUnit=${time_unit}&startTime=${start}&endTime=${end}"
            }
            (Self::SolarEdge, SeriesType::PowerFlow) => {
                "/site/${entity}/powerDetails?startTime=${start}&endTime=${end}"
            }
            (Self::SolarEdge, SeriesType::Notifications) => {
                "/site/${entity}/alerts?startTime=${start}&endTime=${end}"
            }
            (Self::Victron, SeriesType::EnergyHistory) => {
                "/installations/${entity}/stats?type=kwh&interval=${interval}&start=${start_epoch}&end=${end_epoch}"
            }
            (Self::Victron, SeriesType::PowerFlow) => {
                "/installations/${entity}/stats?type=live_feed&start=${start_epoch}&end=${end_epoch}"
            }
            (Self::Victron, SeriesType::Notifications) => {
                "/installations/${entity}/alarms?start=${start_epoch}&end=${end_epoch}"
            }
            (Self::Goodwe, SeriesType::EnergyHistory) => {
                "/v2/Charts/GetChartByPlant?id=${entity}&date=${start_date}&range=${interval}"
            }
            (Self::Goodwe, SeriesType::PowerFlow) => {
                "/v2/Charts/GetPlantPowerChart?id=${entity}&date=${start_date}"
            }
            (Self::Goodwe, SeriesType::Notifications) => {
                "/v2/warning/PowerstationWarningsQuery?pw_id=${entity}&start=${start_date}"
            }
            (Self::Generic, _) => {
                "/entities/${entity}/${series_type}?start=${start}&end=${end}&interval=${interval}"
            }
        }
    }

    fn time_unit(interval: SamplingInterval) -> &'static str {
        match interval {
            SamplingInterval::QuarterHour => "QUARTER_OF_AN_HOUR",
            SamplingInterval::Hour => "HOUR",
            SamplingInterval::Day => "DAY",
            SamplingInterval::Month => "MONTH",
        }
    }

    fn interval_param(&self, interval: SamplingInterval) -> &'static str {
        match (self, interval) {
            (Self::Victron, SamplingInterval::QuarterHour) => "15mins",
            (Self::Victron, SamplingInterval::Hour) => "hours",
            (Self::Victron, SamplingInterval::Day) => "days",
            (Self::Victron, SamplingInterval::Month) => "months",
            (_, interval) => interval.as_str(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpTelemetryProvider {
    client: reqwest::Client,
    base_url: String,
    kind: ProviderKind,
}

impl HttpTelemetryProvider {
    pub fn new(kind: ProviderKind, base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build provider HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            kind,
        })
    }

    fn build_url(&self, request: &FetchRequest) -> String {
        let mut vars: HashMap<&str, String> = HashMap::new();
        vars.insert("entity", urlencoding::encode(request.entity_id()).into_owned());
        vars.insert("series_type", request.series_type.as_str().to_string());
        vars.insert(
            "start",
            urlencoding::encode(&request.start.format("%Y-%m-%d %H:%M:%S").to_string()).into_owned(),
        );
        vars.insert(
            "end",
            urlencoding::encode(&request.end.format("%Y-%m-%d %H:%M:%S").to_string()).into_owned(),
        );
        vars.insert("start_epoch", request.start.timestamp().to_string());
        vars.insert("end_epoch", request.end.timestamp().to_string());
        vars.insert("start_date", request.start.format("%Y-%m-%d").to_string());
        vars.insert("time_unit", ProviderKind::time_unit(request.interval).to_string());
        vars.insert("interval", self.kind.interval_param(request.interval).to_string());

        let path = prepare_endpoint(self.kind.endpoint_template(request.series_type), &vars);
        let mut url = format!("{}{}", self.base_url, path);

        if let AuthScheme::Query(param) = self.kind.auth_scheme() {
            url.push_str(&format!("&{}={}", param, urlencoding::encode(request.token())));
        }
        url
    }
}

#[async_trait]
impl TelemetryProvider for HttpTelemetryProvider {
    async fn fetch_telemetry(&self, request: &FetchRequest) -> Result<SeriesSet, TelemetryError> {
        let url = self.build_url(request);
        tracing::debug!(
            entity = %request.entity_id(),
            series_type = %request.series_type,
            provider = ?self.kind,
            "fetching telemetry"
        );

        let mut builder = self.client.get(&url).header("Accept", "application/json");
        if let AuthScheme::Header { name, prefix } = self.kind.auth_scheme() {
            builder = builder.header(name, format!("{}{}", prefix, request.token()));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TelemetryError::Network(e.without_url().to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(TelemetryError::Auth {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TelemetryError::Provider {
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| TelemetryError::Network(e.without_url().to_string()))?;

        let series = match request.series_type {
            SeriesType::Notifications => decode_alerts(self.kind, &body, request.end)?,
            _ => decode(self.kind, &body)?,
        };
        tracing::debug!(
            entity = %request.entity_id(),
            series = series.len(),
            "decoded provider payload"
        );
        Ok(series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::date_window::DateWindow;
    use crate::domain::telemetry::ViewIdentity;
    use chrono::{TimeZone, Utc};
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn request(series_type: SeriesType, interval: SamplingInterval) -> FetchRequest {
        let window = DateWindow {
            start: Utc.with_ymd_and_hms(2024, 3, 14, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 3, 14, 9, 30, 0).unwrap(),
            interval,
        };
        FetchRequest::new(ViewIdentity::new("1234", "s3cr et"), series_type, &window)
    }

    fn provider(kind: ProviderKind) -> HttpTelemetryProvider {
        HttpTelemetryProvider::new(kind, "https://api.example.com/", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_solaredge_url_carries_api_key_and_time_unit() {
        let url = provider(ProviderKind::SolarEdge)
            .build_url(&request(SeriesType::EnergyHistory, SamplingInterval::QuarterHour));
        assert!(url.starts_with("https://api.example.com/site/1234/energyDetails?"));
        assert!(url.contains("timeUnit=QUARTER_OF_AN_HOUR"));
        assert!(url.contains("startTime=2024-03-14%2000%3A00%3A00"));
        assert!(url.ends_with("&api_key=s3cr%20et"));
    }

    #[test]
    fn test_victron_url_uses_epoch_seconds() {
        let url = provider(ProviderKind::Victron)
            .build_url(&request(SeriesType::EnergyHistory, SamplingInterval::Hour));
        assert_eq!(
            url,
            "https://api.example.com/installations/1234/stats?type=kwh&interval=hours&start=1710374400&end=1710408600"
        );
    }

    #[test]
    fn test_header_auth_keeps_token_out_of_url() {
        for kind in [ProviderKind::Victron, ProviderKind::Goodwe, ProviderKind::Generic] {
            let url = provider(kind).build_url(&request(SeriesType::PowerFlow, SamplingInterval::Day));
            assert!(!url.contains("s3cr"), "{:?}: {}", kind, url);
        }
    }

    fn provider_at(kind: ProviderKind, server: &Server) -> HttpTelemetryProvider {
        HttpTelemetryProvider::new(kind, &server.url(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_decodes_successful_response() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", Matcher::Regex(r"^/installations/1234/stats".to_string()))
            .match_query(Matcher::Any)
            .match_header("x-authorization", "Token s3cr et")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "success": true,
                    "records": {"Pc": [[1710374400000i64, 1.5]], "Gc": [[1710374400000i64, 0.4]]}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let series = provider_at(ProviderKind::Victron, &server)
            .fetch_telemetry(&request(SeriesType::EnergyHistory, SamplingInterval::Hour))
            .await
            .unwrap();

        assert_eq!(series["solarProduction"][0].value, 1.5);
        assert_eq!(series["consumption"][0].value, 0.4);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_maps_rejected_credentials_to_auth() {
        let mut server = Server::new_async().await;
        for status in [401, 403] {
            let mock = server
                .mock("GET", Matcher::Regex(r"^/site/1234/energyDetails".to_string()))
                .match_query(Matcher::Any)
                .with_status(status)
                .with_body("invalid api key")
                .create_async()
                .await;

            let err = provider_at(ProviderKind::SolarEdge, &server)
                .fetch_telemetry(&request(SeriesType::EnergyHistory, SamplingInterval::Day))
                .await
                .unwrap_err();

            assert_eq!(err, TelemetryError::Auth { status: status as u16 });
            assert!(!err.is_retryable());
            mock.assert_async().await;
            mock.remove_async().await;
        }
    }

    #[tokio::test]
    async fn test_fetch_maps_server_error_to_provider() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", Matcher::Regex(r"^/entities/1234/power_flow".to_string()))
            .match_query(Matcher::Any)
            .match_header("authorization", "Bearer s3cr et")
            .with_status(500)
            .with_body("upstream unavailable")
            .create_async()
            .await;

        let err = provider_at(ProviderKind::Generic, &server)
            .fetch_telemetry(&request(SeriesType::PowerFlow, SamplingInterval::Day))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            TelemetryError::Provider {
                status: 500,
                body: "upstream unavailable".to_string()
            }
        );
        assert!(!err.is_retryable());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_notifications_counts_alerts() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", Matcher::Regex(r"^/site/1234/alerts".to_string()))
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(json!({"alerts": {"count": 1, "list": [{"alertId": 3}]}}).to_string())
            .create_async()
            .await;

        let req = request(SeriesType::Notifications, SamplingInterval::Hour);
        let series = provider_at(ProviderKind::SolarEdge, &server)
            .fetch_telemetry(&req)
            .await
            .unwrap();

        assert_eq!(series["alerts"][0].timestamp, req.end);
        assert_eq!(series["alerts"][0].value, 1.0);
        mock.assert_async().await;
    }

    #[test]
    fn test_generic_url_names_series_type() {
        let url = provider(ProviderKind::Generic)
            .build_url(&request(SeriesType::Notifications, SamplingInterval::Day));
        assert!(url.contains("/entities/1234/notifications?"));
        assert!(url.ends_with("interval=day"));
    }
}

// Provider payload decoding into SeriesSet
use crate::domain::error::TelemetryError;
use crate::domain::telemetry::{SeriesSet, TimePoint};
use crate::infrastructure::provider_client::ProviderKind;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use std::collections::HashMap;

pub fn decode(kind: ProviderKind, body: &[u8]) -> Result<SeriesSet, TelemetryError> {
    let mut series = match kind {
        ProviderKind::SolarEdge => decode_solaredge(body)?,
        ProviderKind::Victron => decode_victron(body)?,
        ProviderKind::Goodwe => decode_goodwe(body)?,
        ProviderKind::Generic => decode_generic(body)?,
    };

    // Stable sort keeps the provider's order among duplicate timestamps so
    // the merger's last-write-wins still applies.
    for points in series.values_mut() {
        points.sort_by_key(|p| p.timestamp);
    }
    Ok(series)
}

/// Series that notification views poll: open alerts in the window.
pub const ALERT_SERIES: &str = "alerts";

/// Alert listings reduce to a single count stamped at `as_of`. A zero count
/// is a real sample, not a missing one.
pub fn decode_alerts(
    kind: ProviderKind,
    body: &[u8],
    as_of: DateTime<Utc>,
) -> Result<SeriesSet, TelemetryError> {
    let count = match kind {
        ProviderKind::SolarEdge => solaredge_alert_count(body)?,
        ProviderKind::Victron => victron_alarm_count(body)?,
        ProviderKind::Goodwe => goodwe_warning_count(body)?,
        ProviderKind::Generic => return decode(kind, body),
    };

    let mut series = SeriesSet::new();
    series.insert(
        ALERT_SERIES.to_string(),
        vec![TimePoint::new(as_of, count as f64)],
    );
    Ok(series)
}

fn malformed(provider: &str, err: impl std::fmt::Display) -> TelemetryError {
    TelemetryError::IncompleteData(format!("malformed {} payload: {}", provider, err))
}

// SolarEdge: energyDetails / powerDetails meters

#[derive(Debug, Deserialize)]
struct SolarEdgeEnvelope {
    #[serde(rename = "energyDetails", alias = "powerDetails")]
    details: Option<SolarEdgeDetails>,
}

#[derive(Debug, Deserialize)]
struct SolarEdgeDetails {
    #[serde(default)]
    meters: Vec<SolarEdgeMeter>,
}

#[derive(Debug, Deserialize)]
struct SolarEdgeMeter {
    #[serde(rename = "type")]
    meter_type: String,
    #[serde(default)]
    values: Vec<SolarEdgeValue>,
}

#[derive(Debug, Deserialize)]
struct SolarEdgeValue {
    date: String,
    value: Option<f64>,
}

fn solaredge_series_name(meter_type: &str) -> String {
    match meter_type {
        "Production" => "solarProduction".to_string(),
        "Consumption" => "consumption".to_string(),
        "FeedIn" => "feedIn".to_string(),
        "Purchased" => "purchased".to_string(),
        "SelfConsumption" => "selfConsumption".to_string(),
        other => other.to_string(),
    }
}

fn decode_solaredge(body: &[u8]) -> Result<SeriesSet, TelemetryError> {
    let envelope: SolarEdgeEnvelope =
        serde_json::from_slice(body).map_err(|e| malformed("SolarEdge", e))?;
    let details = envelope
        .details
        .ok_or_else(|| TelemetryError::IncompleteData("SolarEdge payload without details".into()))?;

    let mut series = SeriesSet::new();
    for meter in details.meters {
        let points = series.entry(solaredge_series_name(&meter.meter_type)).or_default();
        for sample in meter.values {
            // Missing values are periods the inverter did not report.
            let Some(value) = sample.value else { continue };
            points.push(TimePoint::new(parse_local_timestamp(&sample.date)?, value));
        }
    }
    Ok(series)
}

#[derive(Debug, Deserialize)]
struct SolarEdgeAlertsEnvelope {
    alerts: Option<SolarEdgeAlerts>,
}

#[derive(Debug, Deserialize)]
struct SolarEdgeAlerts {
    count: Option<u64>,
    #[serde(default)]
    list: Vec<serde_json::Value>,
}

fn solaredge_alert_count(body: &[u8]) -> Result<usize, TelemetryError> {
    let envelope: SolarEdgeAlertsEnvelope =
        serde_json::from_slice(body).map_err(|e| malformed("SolarEdge", e))?;
    let alerts = envelope
        .alerts
        .ok_or_else(|| TelemetryError::IncompleteData("SolarEdge payload without alerts".into()))?;
    Ok(match alerts.count {
        Some(count) if alerts.list.is_empty() => count as usize,
        _ => alerts.list.len(),
    })
}

// Victron VRM: records keyed by attribute code

#[derive(Debug, Deserialize)]
struct VictronEnvelope {
    #[serde(default)]
    records: serde_json::Value,
}

fn victron_series_name(code: &str) -> String {
    match code {
        "Pc" => "solarProduction".to_string(),
        "Gc" => "consumption".to_string(),
        "bs" => "batteryState".to_string(),
        other => other.to_string(),
    }
}

fn decode_victron(body: &[u8]) -> Result<SeriesSet, TelemetryError> {
    let envelope: VictronEnvelope =
        serde_json::from_slice(body).map_err(|e| malformed("Victron", e))?;

    let mut series = SeriesSet::new();
    // Stub responses carry `records: false` or an empty array.
    let Some(records) = envelope.records.as_object() else {
        return Ok(series);
    };

    for (code, rows) in records {
        let rows = rows
            .as_array()
            .ok_or_else(|| malformed("Victron", format!("records.{} is not an array", code)))?;
        let points = series.entry(victron_series_name(code)).or_default();
        for row in rows {
            let (Some(ts), Some(value)) = (
                row.get(0).and_then(|v| v.as_i64()),
                row.get(1).and_then(|v| v.as_f64()),
            ) else {
                continue;
            };
            points.push(TimePoint::new(timestamp_millis(ts)?, value));
        }
    }
    Ok(series)
}

fn victron_alarm_count(body: &[u8]) -> Result<usize, TelemetryError> {
    let envelope: VictronEnvelope =
        serde_json::from_slice(body).map_err(|e| malformed("Victron", e))?;
    match &envelope.records {
        serde_json::Value::Array(alarms) => Ok(alarms.len()),
        serde_json::Value::Null | serde_json::Value::Bool(false) => Ok(0),
        other => Err(malformed("Victron", format!("unexpected alarm records {}", other))),
    }
}

// Goodwe SEMS: chart lines of x/y pairs

#[derive(Debug, Deserialize)]
struct GoodweEnvelope {
    data: Option<GoodweData>,
}

#[derive(Debug, Deserialize)]
struct GoodweData {
    #[serde(default)]
    lines: Vec<GoodweLine>,
}

#[derive(Debug, Deserialize)]
struct GoodweLine {
    key: String,
    #[serde(default)]
    xy: Vec<GoodwePoint>,
}

#[derive(Debug, Deserialize)]
struct GoodwePoint {
    x: String,
    y: Option<f64>,
}

fn goodwe_series_name(key: &str) -> String {
    match key {
        "PCurve_Power_PV" => "solarProduction".to_string(),
        "PCurve_Power_Load" => "consumption".to_string(),
        "PCurve_Power_SOC" => "batteryState".to_string(),
        "PCurve_Power_Battery" => "batteryPower".to_string(),
        "PCurve_Power_Meter" => "grid".to_string(),
        other => other.to_string(),
    }
}

fn decode_goodwe(body: &[u8]) -> Result<SeriesSet, TelemetryError> {
    let envelope: GoodweEnvelope =
        serde_json::from_slice(body).map_err(|e| malformed("Goodwe", e))?;
    let data = envelope
        .data
        .ok_or_else(|| TelemetryError::IncompleteData("Goodwe payload without data".into()))?;

    let mut series = SeriesSet::new();
    for line in data.lines {
        let points = series.entry(goodwe_series_name(&line.key)).or_default();
        for sample in line.xy {
            let Some(value) = sample.y else { continue };
            points.push(TimePoint::new(parse_local_timestamp(&sample.x)?, value));
        }
    }
    Ok(series)
}

#[derive(Debug, Deserialize)]
struct GoodweWarningsEnvelope {
    data: Option<GoodweWarnings>,
}

#[derive(Debug, Deserialize)]
struct GoodweWarnings {
    #[serde(default)]
    list: Vec<serde_json::Value>,
}

fn goodwe_warning_count(body: &[u8]) -> Result<usize, TelemetryError> {
    let envelope: GoodweWarningsEnvelope =
        serde_json::from_slice(body).map_err(|e| malformed("Goodwe", e))?;
    envelope
        .data
        .map(|warnings| warnings.list.len())
        .ok_or_else(|| TelemetryError::IncompleteData("Goodwe payload without data".into()))
}

// Generic gateway format: {"series": {"name": [[ts_ms, value], ...]}}

#[derive(Debug, Deserialize)]
struct GenericEnvelope {
    series: HashMap<String, Vec<(i64, f64)>>,
}

fn decode_generic(body: &[u8]) -> Result<SeriesSet, TelemetryError> {
    let envelope: GenericEnvelope =
        serde_json::from_slice(body).map_err(|e| malformed("generic", e))?;

    envelope
        .series
        .into_iter()
        .map(|(name, rows)| {
            let points = rows
                .into_iter()
                .map(|(ts, value)| Ok(TimePoint::new(timestamp_millis(ts)?, value)))
                .collect::<Result<Vec<_>, TelemetryError>>()?;
            Ok((name, points))
        })
        .collect()
}

fn timestamp_millis(ts: i64) -> Result<DateTime<Utc>, TelemetryError> {
    DateTime::from_timestamp_millis(ts)
        .ok_or_else(|| TelemetryError::IncompleteData(format!("timestamp {} out of range", ts)))
}

/// RFC 3339, or a naive `YYYY-MM-DD HH:MM[:SS]` read as UTC.
fn parse_local_timestamp(raw: &str) -> Result<DateTime<Utc>, TelemetryError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| TelemetryError::IncompleteData(format!("unparseable timestamp '{}'", raw)))
}

// Series merger - joins independently sampled series on exact timestamps
use crate::domain::telemetry::{MergedRecord, SeriesSet, TimePoint};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

/// Watts to kilowatts, watt-hours to kilowatt-hours.
pub const KILO: f64 = 1000.0;

/// Explicit per-series divisors from provider units to display units.
/// Series without an entry pass through unchanged.
pub type UnitScales = HashMap<String, f64>;

/// Merge without unit conversion.
pub fn merge(series: &SeriesSet) -> Vec<MergedRecord> {
    merge_scaled(series, &UnitScales::new())
}

/// Merge every series into one record per distinct timestamp, ascending.
///
/// Timestamps join on exact equality, so samples a second apart land in
/// separate records. A duplicate timestamp within one series keeps the last
/// sample. Series absent at a timestamp get `None`.
pub fn merge_scaled(series: &SeriesSet, scales: &UnitScales) -> Vec<MergedRecord> {
    let mut rows: BTreeMap<DateTime<Utc>, BTreeMap<String, Option<f64>>> = BTreeMap::new();
    let blank: BTreeMap<String, Option<f64>> =
        series.keys().map(|name| (name.clone(), None)).collect();

    for (name, points) in series {
        let divisor = scales.get(name).copied().unwrap_or(1.0);
        for point in points {
            rows.entry(point.timestamp)
                .or_insert_with(|| blank.clone())
                .insert(name.clone(), Some(point.value / divisor));
        }
    }

    rows.into_iter()
        .map(|(timestamp, values)| MergedRecord { timestamp, values })
        .collect()
}

/// Split records back into per-series samples, dropping empty cells.
pub fn split(records: &[MergedRecord]) -> SeriesSet {
    let mut series = SeriesSet::new();
    for record in records {
        for (name, value) in &record.values {
            let points = series.entry(name.clone()).or_default();
            if let Some(value) = value {
                points.push(TimePoint::new(record.timestamp, *value));
            }
        }
    }
    series
}

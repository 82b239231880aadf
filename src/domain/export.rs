// CSV export of merged records
use crate::domain::telemetry::MergedRecord;
use chrono::SecondsFormat;

/// Series name paired with the column header shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub series: String,
    pub label: String,
}

impl ColumnMapping {
    pub fn new(series: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            series: series.into(),
            label: label.into(),
        }
    }
}

/// Header row followed by one row per record, columns in `column_map` order.
pub fn records_to_csv_rows(records: &[MergedRecord], column_map: &[ColumnMapping]) -> Vec<Vec<String>> {
    let mut rows = Vec::with_capacity(records.len() + 1);

    let mut header = vec!["timestamp".to_string()];
    header.extend(column_map.iter().map(|c| c.label.clone()));
    rows.push(header);

    for record in records {
        let mut row = vec![record.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)];
        row.extend(
            column_map
                .iter()
                .map(|c| record.value(&c.series).map(format_value).unwrap_or_default()),
        );
        rows.push(row);
    }

    rows
}

/// Default mapping: every series seen in `records`, labelled by its name.
pub fn default_columns(records: &[MergedRecord]) -> Vec<ColumnMapping> {
    let mut names: Vec<&String> = records.iter().flat_map(|r| r.values.keys()).collect();
    names.sort();
    names.dedup();
    names
        .into_iter()
        .map(|name| ColumnMapping::new(name.clone(), name.clone()))
        .collect()
}

/// Encode rows as RFC 4180 CSV, quoting only where needed.
pub fn rows_to_csv(rows: &[Vec<String>]) -> Result<String, csv::Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.write_record(row)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))?;
    String::from_utf8(bytes)
        .map_err(|e| csv::Error::from(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

fn format_value(value: f64) -> String {
    let formatted = format!("{:.3}", value);
    formatted
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

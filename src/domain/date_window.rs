// Date range calculation - symbolic selectors to absolute windows
use crate::domain::error::TelemetryError;
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

const DAY_SPAN_HOURS: i64 = 24;
const WEEK_SPAN_DAYS: i64 = 7;
const DAILY_SAMPLING_MAX_DAYS: i64 = 92;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSelector {
    Today,
    Last24Hours,
    Last7Days,
    Week,
    Month,
    Year,
    BillingCycle { start_day: u32 },
    Custom { start: DateTime<Utc>, end: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingInterval {
    QuarterHour,
    Hour,
    Day,
    Month,
}

impl SamplingInterval {
    /// Nominal tick length. Months count as 31 days.
    pub fn duration(&self) -> Duration {
        match self {
            Self::QuarterHour => Duration::minutes(15),
            Self::Hour => Duration::hours(1),
            Self::Day => Duration::days(1),
            Self::Month => Duration::days(31),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QuarterHour => "quarter_hour",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
        }
    }

    fn for_span(span: Duration) -> Self {
        if span <= Duration::hours(DAY_SPAN_HOURS) {
            Self::QuarterHour
        } else if span <= Duration::days(WEEK_SPAN_DAYS) {
            Self::Hour
        } else if span <= Duration::days(DAILY_SAMPLING_MAX_DAYS) {
            Self::Day
        } else {
            Self::Month
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub interval: SamplingInterval,
}

/// Resolve `selector` against `now`.
///
/// Now-relative selectors always end at `now`, so the window grows between
/// polls. Calendar selectors that would be empty at an exact boundary fall
/// back to the previous full unit.
pub fn compute_window(
    selector: RangeSelector,
    now: DateTime<Utc>,
) -> Result<DateWindow, TelemetryError> {
    let start = match selector {
        RangeSelector::Custom { start, end } => {
            if start > end {
                return Err(TelemetryError::InvalidRange(format!(
                    "custom range starts at {} after it ends at {}",
                    start, end
                )));
            }
            return Ok(window(start, end));
        }
        RangeSelector::Last24Hours => now - Duration::hours(DAY_SPAN_HOURS),
        RangeSelector::Last7Days => now - Duration::days(WEEK_SPAN_DAYS),
        RangeSelector::Today => {
            let midnight = midnight(now.date_naive());
            if midnight < now { midnight } else { now - Duration::days(1) }
        }
        RangeSelector::Week => {
            let monday = now.date_naive()
                - Duration::days(now.weekday().num_days_from_monday() as i64);
            let start = midnight(monday);
            if start < now { start } else { now - Duration::days(WEEK_SPAN_DAYS) }
        }
        RangeSelector::Month => {
            let start = month_start(now.year(), now.month())?;
            if start < now {
                start
            } else {
                let (year, month) = previous_month(now.year(), now.month());
                month_start(year, month)?
            }
        }
        RangeSelector::Year => {
            let start = month_start(now.year(), 1)?;
            if start < now { start } else { month_start(now.year() - 1, 1)? }
        }
        RangeSelector::BillingCycle { start_day } => billing_cycle_start(start_day, now)?,
    };

    Ok(window(start, now))
}

fn window(start: DateTime<Utc>, end: DateTime<Utc>) -> DateWindow {
    DateWindow {
        start,
        end,
        interval: SamplingInterval::for_span(end - start),
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}

fn month_start(year: i32, month: u32) -> Result<DateTime<Utc>, TelemetryError> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .map(midnight)
        .ok_or_else(|| TelemetryError::InvalidRange(format!("no such month {}-{}", year, month)))
}

fn previous_month(year: i32, month: u32) -> (i32, u32) {
    if month == 1 { (year - 1, 12) } else { (year, month - 1) }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

fn billing_day(year: i32, month: u32, start_day: u32) -> Result<DateTime<Utc>, TelemetryError> {
    let day = start_day.min(days_in_month(year, month));
    NaiveDate::from_ymd_opt(year, month, day)
        .map(midnight)
        .ok_or_else(|| TelemetryError::InvalidRange(format!("billing day {} invalid", start_day)))
}

fn billing_cycle_start(start_day: u32, now: DateTime<Utc>) -> Result<DateTime<Utc>, TelemetryError> {
    if !(1..=31).contains(&start_day) {
        return Err(TelemetryError::InvalidRange(format!(
            "billing cycle start day {} outside 1..=31",
            start_day
        )));
    }

    let this_month = billing_day(now.year(), now.month(), start_day)?;
    if this_month < now {
        return Ok(this_month);
    }
    let (year, month) = previous_month(now.year(), now.month());
    billing_day(year, month, start_day)
}

impl RangeSelector {
    /// Stable label used in request keys and logs.
    pub fn label(&self) -> String {
        match self {
            Self::Today => "today".to_string(),
            Self::Last24Hours => "last24hours".to_string(),
            Self::Last7Days => "last7days".to_string(),
            Self::Week => "week".to_string(),
            Self::Month => "month".to_string(),
            Self::Year => "year".to_string(),
            Self::BillingCycle { start_day } => format!("billing:{}", start_day),
            Self::Custom { start, end } => {
                format!("custom:{}..{}", start.to_rfc3339(), end.to_rfc3339())
            }
        }
    }
}

impl fmt::Display for RangeSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl FromStr for RangeSelector {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "today" | "day" => return Ok(Self::Today),
            "last24hours" => return Ok(Self::Last24Hours),
            "last7days" => return Ok(Self::Last7Days),
            "week" => return Ok(Self::Week),
            "month" => return Ok(Self::Month),
            "year" => return Ok(Self::Year),
            _ => {}
        }

        if let Some(day) = lower.strip_prefix("billing:") {
            let start_day = day
                .parse::<u32>()
                .map_err(|_| TelemetryError::InvalidRange(format!("bad billing day in '{}'", s)))?;
            return Ok(Self::BillingCycle { start_day });
        }

        if let Some(bounds) = s.trim().strip_prefix("custom:") {
            let (start, end) = bounds
                .split_once("..")
                .ok_or_else(|| TelemetryError::InvalidRange(format!("bad custom range '{}'", s)))?;
            let parse = |raw: &str| {
                DateTime::parse_from_rfc3339(raw)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| TelemetryError::InvalidRange(format!("bad instant '{}': {}", raw, e)))
            };
            return Ok(Self::Custom {
                start: parse(start)?,
                end: parse(end)?,
            });
        }

        Err(TelemetryError::InvalidRange(format!("unknown range selector '{}'", s)))
    }
}

// Payload validation - decides whether a fetched SeriesSet is usable
use crate::domain::telemetry::SeriesSet;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationPolicy {
    /// At least one expected series has samples.
    #[default]
    #[serde(alias = "any")]
    AnyExpected,
    /// Every expected series has samples.
    #[serde(alias = "all")]
    AllExpected,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PayloadAssessment {
    /// Expected series with at least one sample.
    pub present: Vec<String>,
    /// Expected series that are missing or empty.
    pub missing: Vec<String>,
    /// Every present sample is zero (night-time production, idle battery).
    pub all_zero: bool,
}

impl PayloadAssessment {
    pub fn is_usable(&self, policy: ValidationPolicy) -> bool {
        match policy {
            ValidationPolicy::AnyExpected => !self.present.is_empty(),
            ValidationPolicy::AllExpected => !self.present.is_empty() && self.missing.is_empty(),
        }
    }
}

/// Classify each expected series as present or missing.
///
/// An empty sample list counts as missing; zero-valued samples count as
/// present.
pub fn assess<S: AsRef<str>>(payload: &SeriesSet, expected: &[S]) -> PayloadAssessment {
    let mut assessment = PayloadAssessment {
        all_zero: true,
        ..Default::default()
    };

    for name in expected {
        let name = name.as_ref();
        match payload.get(name) {
            Some(points) if !points.is_empty() => {
                if points.iter().any(|p| p.value != 0.0) {
                    assessment.all_zero = false;
                }
                assessment.present.push(name.to_string());
            }
            _ => assessment.missing.push(name.to_string()),
        }
    }

    if assessment.present.is_empty() {
        assessment.all_zero = false;
    }
    assessment
}

pub fn is_usable<S: AsRef<str>>(payload: &SeriesSet, expected: &[S], policy: ValidationPolicy) -> bool {
    assess(payload, expected).is_usable(policy)
}

// Retry scheduler - bounded jittered retries for incomplete payloads
use crate::domain::error::TelemetryError;
use crate::domain::telemetry::SeriesType;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound of the uniform random delay added to `base_delay`.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(2000),
            jitter: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, jitter: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            jitter,
        }
    }

    /// `base_delay + uniform(0..=jitter)`.
    pub fn next_delay(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let offset = if jitter_ms == 0 { 0 } else { fastrand::u64(0..=jitter_ms) };
        self.base_delay + Duration::from_millis(offset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Pending,
    Valid,
    Invalid,
    Error,
}

/// Trace record for one attempt of a retry chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchAttempt {
    pub attempt: u32,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome<T> {
    /// Last payload seen: the valid one, or the final invalid one when
    /// exhausted. `None` only if every attempt failed with a retryable error.
    pub data: Option<T>,
    pub attempts: u32,
    pub exhausted: bool,
}

/// Run `fetch` until `validate` accepts its payload or the attempts run out.
///
/// Exhaustion resolves `Ok` with `exhausted = true`. A non-retryable error
/// returns immediately without waiting or further attempts.
pub async fn run_with_retry<T, F, Fut, V>(
    mut fetch: F,
    validate: V,
    policy: &RetryPolicy,
) -> Result<RetryOutcome<T>, TelemetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TelemetryError>>,
    V: Fn(&T) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_seen = None;

    for attempt in 1..=max_attempts {
        let mut record = FetchAttempt {
            attempt,
            outcome: AttemptOutcome::Pending,
        };
        tracing::debug!(?record, "fetch attempt started");

        match fetch(attempt).await {
            Ok(data) => {
                if validate(&data) {
                    record.outcome = AttemptOutcome::Valid;
                    tracing::debug!(?record, "fetch attempt finished");
                    return Ok(RetryOutcome {
                        data: Some(data),
                        attempts: attempt,
                        exhausted: false,
                    });
                }
                record.outcome = AttemptOutcome::Invalid;
                last_seen = Some(data);
            }
            Err(e) if e.is_retryable() => {
                record.outcome = AttemptOutcome::Error;
                tracing::debug!(?record, error = %e, "retryable fetch failure");
            }
            Err(e) => {
                record.outcome = AttemptOutcome::Error;
                tracing::debug!(?record, error = %e, "hard fetch failure, not retrying");
                return Err(e);
            }
        }
        tracing::debug!(?record, "fetch attempt finished");

        if attempt < max_attempts {
            let delay = policy.next_delay();
            tracing::debug!("retrying in {} ms", delay.as_millis());
            tokio::time::sleep(delay).await;
        }
    }

    tracing::warn!("retries exhausted after {} attempts", max_attempts);
    Ok(RetryOutcome {
        data: last_seen,
        attempts: max_attempts,
        exhausted: true,
    })
}

/// Logical request identity: only one chain per key may commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub entity_id: String,
    pub range: String,
    pub series_type: SeriesType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTicket {
    pub key: RequestKey,
    pub sequence: u64,
}

/// Issues monotonically increasing sequence numbers per request key so
/// late results from superseded chains can be dropped before commit.
#[derive(Debug, Default)]
pub struct RequestSequencer {
    next: AtomicU64,
    latest: Mutex<HashMap<RequestKey, u64>>,
}

impl RequestSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, key: RequestKey) -> RequestTicket {
        let sequence = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        self.latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.clone(), sequence);
        RequestTicket { key, sequence }
    }

    pub fn is_current(&self, ticket: &RequestTicket) -> bool {
        self.latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&ticket.key)
            .is_some_and(|latest| *latest == ticket.sequence)
    }

    /// Supersede every outstanding ticket.
    pub fn invalidate_all(&self) {
        self.latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

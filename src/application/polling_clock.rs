// Polling clock - fixed-cadence refresh trigger with pause and teardown
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Shortest cadence a clock runs at; shorter intervals are raised to it.
pub const MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Whether the first tick fires at `start()` or one interval later.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirstTick {
    #[default]
    Immediate,
    AfterInterval,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollCycle {
    pub interval: Duration,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub is_paused: bool,
}

#[derive(Debug)]
struct ClockShared {
    interval: Duration,
    paused: AtomicBool,
    stopped: AtomicBool,
    last_fired_at: Mutex<Option<DateTime<Utc>>>,
}

/// Cloneable pause/resume access handed to tick callbacks.
#[derive(Debug, Clone)]
pub struct PollControl {
    shared: Arc<ClockShared>,
}

impl PollControl {
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }
}

/// Owning handle of a running clock. Dropping it stops the clock.
#[derive(Debug)]
pub struct PollHandle {
    control: PollControl,
    task: JoinHandle<()>,
}

pub struct PollingClock;

impl PollingClock {
    /// Spawn a clock that calls `on_tick` every `interval`, measured from
    /// now rather than from the end of the previous tick's work. Ticks that
    /// fire while paused are dropped, not queued.
    pub fn start<F>(interval: Duration, first_tick: FirstTick, on_tick: F) -> PollHandle
    where
        F: Fn(&PollControl) + Send + Sync + 'static,
    {
        if interval < MIN_INTERVAL {
            tracing::warn!(
                "poll interval {:?} below minimum, using {:?}",
                interval,
                MIN_INTERVAL
            );
        }
        let interval = interval.max(MIN_INTERVAL);
        let shared = Arc::new(ClockShared {
            interval,
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            last_fired_at: Mutex::new(None),
        });
        let control = PollControl { shared };
        let tick_control = control.clone();

        let task = tokio::spawn(async move {
            let mut ticker = match first_tick {
                FirstTick::Immediate => tokio::time::interval(interval),
                FirstTick::AfterInterval => {
                    tokio::time::interval_at(Instant::now() + interval, interval)
                }
            };
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if tick_control.is_stopped() {
                    break;
                }
                if tick_control.is_paused() {
                    tracing::debug!("tick skipped, clock paused");
                    continue;
                }
                *tick_control
                    .shared
                    .last_fired_at
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Utc::now());
                on_tick(&tick_control);
            }
        });

        tracing::debug!(
            "polling clock started: every {}s, first tick {:?}",
            interval.as_secs_f64(),
            first_tick
        );
        PollHandle { control, task }
    }
}

impl PollHandle {
    pub fn control(&self) -> PollControl {
        self.control.clone()
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    pub fn is_stopped(&self) -> bool {
        self.control.is_stopped()
    }

    /// Idempotent.
    pub fn stop(&self) {
        if !self.control.shared.stopped.swap(true, Ordering::SeqCst) {
            self.task.abort();
            tracing::debug!("polling clock stopped");
        }
    }

    pub fn cycle(&self) -> PollCycle {
        let shared = &self.control.shared;
        PollCycle {
            interval: shared.interval,
            last_fired_at: *shared
                .last_fired_at
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
            is_paused: self.is_paused(),
        }
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

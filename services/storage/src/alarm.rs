use crate::config::AlarmConfig;
use crate::metric::MetricExtractor;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Alarm state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmState {
    Ok,
    Alarm,
    InsufficientData,
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AlarmState::Ok => "OK",
            AlarmState::Alarm => "ALARM",
            AlarmState::InsufficientData => "INSUFFICIENT_DATA",
        };
        f.write_str(name)
    }
}

/// A change of alarm state, emitted once per change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlarmTransition {
    /// Store the alarm watches
    pub store_id: String,
    pub from: AlarmState,
    pub to: AlarmState,
    /// Windowed delta sum that caused the change
    pub reading: Option<i64>,
    pub window_start: DateTime<Utc>,
}

impl AlarmTransition {
    /// True for a change into ALARM, which triggers remediation
    pub fn is_activation(&self) -> bool {
        self.to == AlarmState::Alarm && self.from != AlarmState::Alarm
    }
}

/// One evaluated window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub window_start: DateTime<Utc>,
    pub reading: Option<i64>,
    pub state: AlarmState,
}

/// Edge-triggered threshold alarm over per-window readings.
///
/// A missing reading is non-breaching and moves the alarm to
/// INSUFFICIENT_DATA. The alarm enters ALARM after `evaluation_periods`
/// consecutive readings above the threshold.
#[derive(Debug)]
pub struct ThresholdAlarm {
    store_id: String,
    threshold: i64,
    evaluation_periods: u32,
    state: AlarmState,
    breach_streak: u32,
    history: VecDeque<Evaluation>,
    history_len: usize,
}

impl ThresholdAlarm {
    pub fn new(config: &AlarmConfig) -> Self {
        Self {
            store_id: config.store_id.clone(),
            threshold: config.threshold_bytes,
            evaluation_periods: config.evaluation_periods.max(1),
            state: AlarmState::InsufficientData,
            breach_streak: 0,
            history: VecDeque::with_capacity(config.history_len),
            history_len: config.history_len,
        }
    }

    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    pub fn state(&self) -> AlarmState {
        self.state
    }

    /// Most recent evaluations, oldest first
    pub fn history(&self) -> impl Iterator<Item = &Evaluation> {
        self.history.iter()
    }

    /// Feed one window's reading; returns a transition if the state changed
    pub fn evaluate(
        &mut self,
        window_start: DateTime<Utc>,
        reading: Option<i64>,
    ) -> Option<AlarmTransition> {
        let next = match reading {
            None => {
                self.breach_streak = 0;
                AlarmState::InsufficientData
            }
            Some(value) if value > self.threshold => {
                self.breach_streak = self.breach_streak.saturating_add(1);
                if self.breach_streak >= self.evaluation_periods {
                    AlarmState::Alarm
                } else {
                    AlarmState::Ok
                }
            }
            Some(_) => {
                self.breach_streak = 0;
                AlarmState::Ok
            }
        };

        if self.history_len > 0 {
            if self.history.len() == self.history_len {
                self.history.pop_front();
            }
            self.history.push_back(Evaluation {
                window_start,
                reading,
                state: next,
            });
        }

        let previous = std::mem::replace(&mut self.state, next);
        (previous != next).then(|| AlarmTransition {
            store_id: self.store_id.clone(),
            from: previous,
            to: next,
            reading,
            window_start,
        })
    }
}

/// Drives a [`ThresholdAlarm`] from a [`MetricExtractor`] on a fixed period
/// and broadcasts its transitions
pub struct AlarmEvaluator {
    extractor: MetricExtractor,
    alarm: ThresholdAlarm,
    period: Duration,
    settle: chrono::Duration,
    last_window: Option<i64>,
    transitions: broadcast::Sender<AlarmTransition>,
}

impl AlarmEvaluator {
    pub fn new(
        extractor: MetricExtractor,
        alarm: ThresholdAlarm,
        period: Duration,
        transitions: broadcast::Sender<AlarmTransition>,
    ) -> Self {
        Self {
            extractor,
            alarm,
            period,
            settle: chrono::Duration::zero(),
            last_window: None,
            transitions,
        }
    }

    /// Wait `settle` past a window's end before evaluating it, so deltas
    /// still in flight at the boundary are counted
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = chrono::Duration::from_std(settle).unwrap_or(chrono::Duration::zero());
        self
    }

    pub fn alarm(&self) -> &ThresholdAlarm {
        &self.alarm
    }

    /// Receiver for future transitions
    pub fn subscribe(&self) -> broadcast::Receiver<AlarmTransition> {
        self.transitions.subscribe()
    }

    /// Evaluate the last window that ended at least `settle` before `now`,
    /// once per window
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Option<AlarmTransition> {
        let settled = now.checked_sub_signed(self.settle).unwrap_or(now);
        let index = self.extractor.window_index(settled) - 1;
        if self.last_window.is_some_and(|last| index <= last) {
            return None;
        }
        self.last_window = Some(index);

        let window_start = self.extractor.window_start(index);
        self.evaluate_window(window_start).await
    }

    /// Evaluate one window and publish any resulting transition
    pub async fn evaluate_window(&mut self, window_start: DateTime<Utc>) -> Option<AlarmTransition> {
        let reading = match self.extractor.evaluate(window_start).await {
            Ok(reading) => reading,
            Err(e) => {
                warn!(error = %e, "Failed to read delta log, treating window as missing data");
                None
            }
        };

        debug!(
            store_id = %self.alarm.store_id(),
            window_start = %window_start,
            reading = ?reading,
            "Alarm window evaluated"
        );

        let transition = self.alarm.evaluate(window_start, reading)?;

        info!(
            store_id = %transition.store_id,
            from = %transition.from,
            to = %transition.to,
            reading = ?transition.reading,
            "Alarm state changed"
        );
        metrics::counter!("monitor.alarm.transitions", "to" => transition.to.to_string())
            .increment(1);

        if self.transitions.send(transition.clone()).is_err() {
            debug!("No transition subscribers");
        }

        Some(transition)
    }

    /// Evaluate every period until shutdown
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            store_id = %self.alarm.store_id(),
            period_secs = self.period.as_secs(),
            settle_secs = self.settle.num_seconds(),
            "Alarm evaluator started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }

        info!("Alarm evaluator stopped");
    }
}

//! Per-person ingestion pipeline: frames in, gate verdicts and verification rounds out.

use crate::activity::{ActivityReport, ActivityTracker, DEFAULT_INACTIVITY_MINUTES};
use crate::clock::Clock;
use crate::coordinator::{BeginError, RoundId, VerificationConfig, VerificationCoordinator};
use crate::logic::{ImpactGate, Verdict};
use crate::model::{FrameError, MonitorEvent, PredictResponse, SensorFrame};
use crate::store::StatusStore;
use crate::window::{FeatureWindow, WindowBuffer};
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

pub const DEFAULT_WINDOW_LEN: usize = 150;
pub const DEFAULT_EVAL_STRIDE: usize = 50;
pub const DEFAULT_IDLE_EVICTION_MINUTES: i64 = 30;
/// Per-person event backlog before slow subscribers start losing events.
pub const DEFAULT_EVENT_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub window_len: usize,
    /// New frames between evaluations once the buffer is full.
    pub eval_stride: usize,
    pub inactivity_minutes: i64,
    /// Minutes without traffic after which an unused monitor is dropped.
    pub idle_eviction_minutes: i64,
    pub event_capacity: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            window_len: DEFAULT_WINDOW_LEN,
            eval_stride: DEFAULT_EVAL_STRIDE,
            inactivity_minutes: DEFAULT_INACTIVITY_MINUTES,
            idle_eviction_minutes: DEFAULT_IDLE_EVICTION_MINUTES,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationAttempt {
    NotNeeded,
    Requested(RoundId),
    /// A round was already in flight; the signal was dropped.
    Suppressed,
    /// The request could not be published; no round was started.
    StoreUnavailable,
}

impl VerificationAttempt {
    pub fn label(&self) -> Option<&'static str> {
        match self {
            VerificationAttempt::NotNeeded => None,
            VerificationAttempt::Requested(_) => Some("requested"),
            VerificationAttempt::Suppressed => Some("suppressed"),
            VerificationAttempt::StoreUnavailable => Some("store_unavailable"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestReport {
    pub verdict: Verdict,
    pub activity: ActivityReport,
    pub verification: VerificationAttempt,
}

impl IngestReport {
    pub fn to_response(&self) -> PredictResponse {
        let fall = self.verdict.is_possible_fall();
        PredictResponse {
            result: u8::from(fall),
            probability: self.verdict.probability(),
            status: if fall { "possible_fall" } else { "normal" }.to_string(),
            verification: self.verification.label().map(str::to_string),
            activity: Some(self.activity.level),
            inactivity_alert: self.activity.alert,
        }
    }
}

struct Intake {
    buffer: WindowBuffer,
    since_eval: usize,
    seq: u64,
}

pub struct PersonMonitor {
    person_id: String,
    intake: Mutex<Intake>,
    eval_stride: usize,
    malformed: AtomicU64,
    activity: Mutex<ActivityTracker>,
    /// Overrides the gate's configured sensitivity for this person.
    sensitivity: Mutex<Option<f64>>,
    last_seen: Mutex<DateTime<Utc>>,
    gate: Arc<ImpactGate>,
    coordinator: VerificationCoordinator,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<MonitorEvent>,
}

impl PersonMonitor {
    pub fn new(
        person_id: impl Into<String>,
        settings: &MonitorSettings,
        gate: Arc<ImpactGate>,
        coordinator: VerificationCoordinator,
        clock: Arc<dyn Clock>,
        events: broadcast::Sender<MonitorEvent>,
    ) -> Self {
        let started = clock.now();
        let eval_stride = settings.eval_stride.max(1);
        Self {
            person_id: person_id.into(),
            intake: Mutex::new(Intake {
                buffer: WindowBuffer::new(settings.window_len),
                // The first full window is due immediately.
                since_eval: eval_stride - 1,
                seq: 0,
            }),
            eval_stride,
            malformed: AtomicU64::new(0),
            activity: Mutex::new(ActivityTracker::new(started, settings.inactivity_minutes)),
            sensitivity: Mutex::new(None),
            last_seen: Mutex::new(started),
            gate,
            coordinator,
            clock,
            events,
        }
    }

    pub fn person_id(&self) -> &str {
        &self.person_id
    }

    pub fn coordinator(&self) -> &VerificationCoordinator {
        &self.coordinator
    }

    pub fn window_len(&self) -> usize {
        self.intake.lock().buffer.capacity()
    }

    pub fn malformed_frames(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn sensitivity(&self) -> Option<f64> {
        *self.sensitivity.lock()
    }

    /// Sets (or with `None`, clears) this person's 0–100 sensitivity.
    pub fn set_sensitivity(&self, sensitivity: Option<f64>) {
        *self.sensitivity.lock() = sensitivity;
        tracing::info!(person_id = %self.person_id, ?sensitivity, "Sensitivity updated");
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        *self.last_seen.lock()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    fn touch(&self) {
        *self.last_seen.lock() = self.clock.now();
    }

    /// Ingests one delimited tuple from the stream. Frames are timed by arrival order.
    pub async fn ingest_line(&self, line: &str) -> Result<Option<IngestReport>, FrameError> {
        let time = {
            let mut intake = self.intake.lock();
            intake.seq += 1;
            intake.seq as f64
        };
        match SensorFrame::parse_tuple(line, time) {
            Ok(frame) => self.ingest(frame).await,
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(person_id = %self.person_id, error = %e, "Dropped malformed frame");
                Err(e)
            }
        }
    }

    /// Buffers a frame and evaluates the window every `eval_stride` frames once full.
    pub async fn ingest(&self, frame: SensorFrame) -> Result<Option<IngestReport>, FrameError> {
        self.touch();
        let window = {
            let mut intake = self.intake.lock();
            if let Err(e) = intake.buffer.push(frame) {
                drop(intake);
                self.malformed.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
            if !intake.buffer.is_ready() {
                return Ok(None);
            }
            intake.since_eval += 1;
            if intake.since_eval < self.eval_stride {
                return Ok(None);
            }
            intake.since_eval = 0;
            intake.buffer.snapshot()
        };

        match window {
            Some(window) => Ok(Some(self.evaluate_window(&window, None).await)),
            None => Ok(None),
        }
    }

    /// Runs the gate over `window` and, on a possible fall, tries to start a round.
    ///
    /// `sensitivity` wins over the person's stored setting, which wins over
    /// the gate's configured default.
    pub async fn evaluate_window(
        &self,
        window: &FeatureWindow,
        sensitivity: Option<f64>,
    ) -> IngestReport {
        self.touch();
        let activity = self.activity.lock().observe_window(window, self.clock.now());
        if activity.alert_raised {
            self.emit(MonitorEvent::InactivityAlert {
                person_id: self.person_id.clone(),
                inactive_minutes: activity.inactive_minutes,
            });
        }

        let sensitivity = sensitivity.or_else(|| self.sensitivity());
        let verdict = self.gate.evaluate_with(window, sensitivity).await;
        let verification = match &verdict {
            Verdict::NoAction { .. } => VerificationAttempt::NotNeeded,
            Verdict::PossibleFall(evidence) => {
                self.emit(MonitorEvent::PossibleFall {
                    person_id: self.person_id.clone(),
                    peak_impact_g: evidence.peak_impact_g,
                    probability: evidence.probability,
                    rule: evidence.rule,
                });
                match self.coordinator.begin_round(evidence).await {
                    // The round runs detached; dropping the handle does not cancel it.
                    Ok(round) => VerificationAttempt::Requested(round.id()),
                    Err(BeginError::RoundInFlight) => {
                        tracing::debug!(person_id = %self.person_id, "Round in flight, signal suppressed");
                        VerificationAttempt::Suppressed
                    }
                    Err(BeginError::Store(_)) => VerificationAttempt::StoreUnavailable,
                }
            }
        };

        IngestReport {
            verdict,
            activity,
            verification,
        }
    }

    fn emit(&self, event: MonitorEvent) {
        let _ = self.events.send(event);
    }
}

/// Monitors keyed by person id, created on first contact.
///
/// Each person has their own event channel, so a busy wearer cannot make
/// another wearer's subscribers lag.
pub struct MonitorRegistry {
    monitors: RwLock<HashMap<String, Arc<PersonMonitor>>>,
    settings: MonitorSettings,
    gate: Arc<ImpactGate>,
    store: Arc<dyn StatusStore>,
    clock: Arc<dyn Clock>,
    verification: VerificationConfig,
}

impl MonitorRegistry {
    pub fn new(
        settings: MonitorSettings,
        gate: Arc<ImpactGate>,
        store: Arc<dyn StatusStore>,
        clock: Arc<dyn Clock>,
        verification: VerificationConfig,
    ) -> Self {
        Self {
            monitors: RwLock::new(HashMap::new()),
            settings,
            gate,
            store,
            clock,
            verification,
        }
    }

    pub fn store(&self) -> &Arc<dyn StatusStore> {
        &self.store
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// Events for one person, creating the monitor if needed.
    pub fn subscribe(&self, person_id: &str) -> broadcast::Receiver<MonitorEvent> {
        self.get_or_create(person_id).subscribe()
    }

    pub fn get(&self, person_id: &str) -> Option<Arc<PersonMonitor>> {
        self.monitors.read().get(person_id).cloned()
    }

    pub fn get_or_create(&self, person_id: &str) -> Arc<PersonMonitor> {
        if let Some(monitor) = self.get(person_id) {
            return monitor;
        }

        let mut monitors = self.monitors.write();
        monitors
            .entry(person_id.to_string())
            .or_insert_with(|| {
                tracing::info!(person_id, "Monitoring new person");
                let (events, _) = broadcast::channel(self.settings.event_capacity.max(1));
                let coordinator = VerificationCoordinator::new(
                    person_id,
                    Arc::clone(&self.store),
                    Arc::clone(&self.clock),
                    self.verification.clone(),
                    Some(events.clone()),
                );
                Arc::new(PersonMonitor::new(
                    person_id,
                    &self.settings,
                    Arc::clone(&self.gate),
                    coordinator,
                    Arc::clone(&self.clock),
                    events,
                ))
            })
            .clone()
    }

    /// Drops monitors nobody holds, with no round in flight, no stored
    /// sensitivity and no traffic for `idle_eviction_minutes`. Returns how
    /// many were dropped.
    pub fn evict_idle(&self) -> usize {
        let cutoff = self.clock.now() - Duration::minutes(self.settings.idle_eviction_minutes.max(1));
        let mut monitors = self.monitors.write();
        let before = monitors.len();
        monitors.retain(|person_id, monitor| {
            let keep = Arc::strong_count(monitor) > 1
                || !monitor.coordinator().is_idle()
                || monitor.sensitivity().is_some()
                || monitor.last_seen() > cutoff;
            if !keep {
                tracing::debug!(%person_id, "Evicting idle monitor");
            }
            keep
        });
        before - monitors.len()
    }

    pub fn len(&self) -> usize {
        self.monitors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.read().is_empty()
    }

    pub fn malformed_frames(&self) -> u64 {
        self.monitors
            .read()
            .values()
            .map(|m| m.malformed_frames())
            .sum()
    }
}

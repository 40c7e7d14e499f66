//! End-to-end: frames through the gate into verification rounds.

use crate::classifier::{Classifier, ClassifierError, ClassifierInput, Prediction};
use crate::clock::{Clock, SystemClock};
use crate::coordinator::{RoundOutcome, VerificationConfig};
use crate::logic::{GateConfig, ImpactGate};
use crate::model::{MonitorEvent, RecordPatch, VerificationRecord, VerificationStatus};
use crate::monitor::{IngestReport, MonitorRegistry, MonitorSettings, VerificationAttempt};
use crate::store::{MemoryStatusStore, StatusStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const WINDOW: usize = 40;

/// The model never sees a fall; only the physical override can fire.
struct Silent;

#[async_trait]
impl Classifier for Silent {
    fn name(&self) -> &str {
        "silent"
    }

    async fn predict(&self, _input: &ClassifierInput<'_>) -> Result<Prediction, ClassifierError> {
        Ok(Prediction::safe_default())
    }
}

/// Never answers.
struct Hung;

#[async_trait]
impl Classifier for Hung {
    fn name(&self) -> &str {
        "hung"
    }

    async fn predict(&self, _input: &ClassifierInput<'_>) -> Result<Prediction, ClassifierError> {
        std::future::pending().await
    }
}

struct DownStore;

#[async_trait]
impl StatusStore for DownStore {
    async fn get(&self, _person_id: &str) -> Result<Option<VerificationRecord>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn merge(&self, _person_id: &str, _patch: &RecordPatch) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn update(&self, _person_id: &str, _patch: &RecordPatch) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}

struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    fn advance(&self, by: ChronoDuration) {
        *self.0.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock()
    }
}

fn registry_with(
    classifier: Arc<dyn Classifier>,
    store: Arc<dyn StatusStore>,
    clock: Arc<dyn Clock>,
) -> MonitorRegistry {
    MonitorRegistry::new(
        MonitorSettings {
            window_len: WINDOW,
            eval_stride: WINDOW,
            inactivity_minutes: 60,
            ..MonitorSettings::default()
        },
        Arc::new(ImpactGate::new(GateConfig::default(), classifier)),
        store,
        clock,
        VerificationConfig::default(),
    )
}

fn registry(store: Arc<dyn StatusStore>) -> MonitorRegistry {
    registry_with(Arc::new(Silent), store, Arc::new(SystemClock))
}

/// One window's worth of tuples: upright, a 2.5 g impact, then lying still.
fn fall_lines() -> Vec<String> {
    let mut lines = vec!["0,1,0,0,0,0".to_string(); 20];
    lines.push("2.5,0.3,0.2,180,40,10".to_string());
    lines.extend(vec!["0.98,0.05,0.1,0.2,0.1,0".to_string(); WINDOW - 21]);
    lines
}

fn quiet_lines() -> Vec<String> {
    vec!["0.98,0.05,0.1,0,0,0".to_string(); WINDOW]
}

async fn feed(registry: &MonitorRegistry, person: &str, lines: &[String]) -> Vec<IngestReport> {
    let monitor = registry.get_or_create(person);
    let mut reports = Vec::new();
    for line in lines {
        if let Some(report) = monitor.ingest_line(line).await.unwrap() {
            reports.push(report);
        }
    }
    reports
}

async fn next_outcome(rx: &mut broadcast::Receiver<MonitorEvent>) -> RoundOutcome {
    loop {
        if let MonitorEvent::RoundResolved { outcome, .. } = rx.recv().await.unwrap() {
            return outcome;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn unanswered_fall_escalates_to_emergency() {
    let store = Arc::new(MemoryStatusStore::new());
    let registry = registry(store.clone());
    let mut rx = registry.subscribe("grandma");

    let reports = feed(&registry, "grandma", &fall_lines()).await;
    assert_eq!(reports.len(), 1);
    assert!(reports[0].verdict.is_possible_fall());
    assert!(matches!(reports[0].verification, VerificationAttempt::Requested(_)));

    let record = store.get("grandma").await.unwrap().unwrap();
    assert_eq!(record.status, VerificationStatus::VerifyRequest);
    assert!((record.reported_force - 2.53).abs() < 0.01);

    assert_eq!(next_outcome(&mut rx).await, RoundOutcome::Escalated);
    let record = store.get("grandma").await.unwrap().unwrap();
    assert_eq!(record.status, VerificationStatus::Emergency);
}

#[tokio::test(start_paused = true)]
async fn repeated_fall_signals_are_suppressed_during_round() {
    let store = Arc::new(MemoryStatusStore::new());
    let registry = registry(store.clone());

    let first = feed(&registry, "grandma", &fall_lines()).await;
    assert!(matches!(first[0].verification, VerificationAttempt::Requested(_)));

    let second = feed(&registry, "grandma", &fall_lines()).await;
    assert!(second[0].verdict.is_possible_fall());
    assert_eq!(second[0].verification, VerificationAttempt::Suppressed);

    // A different person has an independent guard.
    let other = feed(&registry, "grandpa", &fall_lines()).await;
    assert!(matches!(other[0].verification, VerificationAttempt::Requested(_)));
}

#[tokio::test(start_paused = true)]
async fn companion_dismissal_wins_over_escalation() {
    let store = Arc::new(MemoryStatusStore::new());
    let registry = registry(store.clone());
    let mut rx = registry.subscribe("grandma");

    feed(&registry, "grandma", &fall_lines()).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    store
        .update("grandma", &RecordPatch::status(VerificationStatus::FalseAlarm))
        .await
        .unwrap();

    assert_eq!(next_outcome(&mut rx).await, RoundOutcome::Dismissed);
    assert_eq!(
        store.get("grandma").await.unwrap().unwrap().status,
        VerificationStatus::FalseAlarm
    );
}

#[tokio::test(start_paused = true)]
async fn guard_reopens_after_cooldown() {
    let store = Arc::new(MemoryStatusStore::new());
    let registry = registry(store.clone());
    let mut rx = registry.subscribe("grandma");

    feed(&registry, "grandma", &fall_lines()).await;
    loop {
        if let MonitorEvent::RoundClosed { .. } = rx.recv().await.unwrap() {
            break;
        }
    }
    assert!(registry.get_or_create("grandma").coordinator().is_idle());

    let next = feed(&registry, "grandma", &fall_lines()).await;
    assert!(matches!(next[0].verification, VerificationAttempt::Requested(_)));
}

#[tokio::test(start_paused = true)]
async fn hung_classifier_still_allows_impact_override() {
    let store = Arc::new(MemoryStatusStore::new());
    let registry = registry_with(Arc::new(Hung), store.clone(), Arc::new(SystemClock));

    let reports = feed(&registry, "grandma", &fall_lines()).await;
    assert!(reports[0].verdict.is_possible_fall());
    assert_eq!(reports[0].verdict.probability(), 0.0);

    let quiet = feed(&registry, "other", &quiet_lines()).await;
    assert!(!quiet[0].verdict.is_possible_fall());
}

#[tokio::test(start_paused = true)]
async fn unreachable_store_skips_round_without_wedging() {
    let registry = registry(Arc::new(DownStore));

    let first = feed(&registry, "grandma", &fall_lines()).await;
    assert_eq!(first[0].verification, VerificationAttempt::StoreUnavailable);

    // The guard was released, so the next signal tries again.
    let second = feed(&registry, "grandma", &fall_lines()).await;
    assert_eq!(second[0].verification, VerificationAttempt::StoreUnavailable);
    assert!(registry.get_or_create("grandma").coordinator().is_idle());
}

#[tokio::test]
async fn long_stillness_raises_one_inactivity_alert() {
    let clock = Arc::new(ManualClock(Mutex::new(
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
    )));
    let registry = registry_with(
        Arc::new(Silent),
        Arc::new(MemoryStatusStore::new()),
        clock.clone(),
    );
    let mut rx = registry.subscribe("grandma");

    let first = feed(&registry, "grandma", &quiet_lines()).await;
    assert!(!first[0].activity.alert);

    clock.advance(ChronoDuration::minutes(61));
    let second = feed(&registry, "grandma", &quiet_lines()).await;
    assert!(second[0].activity.alert);
    assert!(second[0].to_response().inactivity_alert);

    clock.advance(ChronoDuration::minutes(5));
    let third = feed(&registry, "grandma", &quiet_lines()).await;
    assert!(third[0].activity.alert);

    let mut alerts = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, MonitorEvent::InactivityAlert { .. }) {
            alerts += 1;
        }
    }
    assert_eq!(alerts, 1);
}

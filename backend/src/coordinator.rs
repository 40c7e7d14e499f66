//! Cross-device verification of a possible fall.
//!
//! ```text
//! IDLE ──possible fall──▶ VERIFY_REQUEST ──response window──▶ resolve (one read)
//!   ▲                                                         │
//!   └──────────────── cooldown ◀──── EMERGENCY | NORMAL/FALSE_ALARM | ESCALATED
//! ```
//!
//! The guard is a one-permit semaphore per person. Its permit is stored with
//! the active round, so the only ways to release it are the end of the
//! cooldown or cancellation of that round. Both take the round out of the
//! `active` slot, which drops the permit synchronously.

use crate::clock::Clock;
use crate::logic::FallEvidence;
use crate::model::{MonitorEvent, RecordPatch, VerificationRecord, VerificationStatus};
use crate::store::{StatusStore, StoreError};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

/// Note attached when the wearable escalates on its own.
pub const SINGLE_SOURCE_NOTE: &str = "single-source: no companion response";

/// Who raised the request.
pub const REQUEST_SOURCE: &str = "iot";

#[derive(Debug, Clone)]
pub struct VerificationConfig {
    /// How long the companion has to answer.
    pub response_window: Duration,
    /// Guard hold time after resolution.
    pub cooldown: Duration,
    /// Bound on every store call.
    pub store_timeout: Duration,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            response_window: Duration::from_secs(5),
            cooldown: Duration::from_secs(2),
            store_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RoundId(Uuid);

impl RoundId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundOutcome {
    /// No companion answer; the wearable wrote EMERGENCY itself.
    Escalated,
    /// The companion had already written EMERGENCY.
    ConfirmedByCompanion,
    /// The companion answered NORMAL or FALSE_ALARM.
    Dismissed,
    /// Remote state could not be trusted; nothing was asserted.
    Unresolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    AwaitingResponse,
    Cooldown,
}

#[derive(Debug, Error)]
pub enum BeginError {
    #[error("a verification round is already in flight")]
    RoundInFlight,

    #[error("could not publish verification request: {0}")]
    Store(#[from] StoreError),
}

/// Single-flight token for one monitored person.
pub struct VerificationGuard {
    permit: Arc<Semaphore>,
}

impl VerificationGuard {
    fn new() -> Self {
        Self {
            permit: Arc::new(Semaphore::new(1)),
        }
    }

    fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.permit.clone().try_acquire_owned().ok()
    }

    pub fn is_held(&self) -> bool {
        self.permit.available_permits() == 0
    }
}

/// Caller's view of a started round.
pub struct RoundHandle {
    id: RoundId,
    resolved: oneshot::Receiver<RoundOutcome>,
    task: JoinHandle<()>,
}

impl RoundHandle {
    pub fn id(&self) -> RoundId {
        self.id
    }

    /// Outcome of the resolution step; `None` if the round was cancelled first.
    pub async fn resolved(&mut self) -> Option<RoundOutcome> {
        (&mut self.resolved).await.ok()
    }

    /// Waits until the cooldown has elapsed and the guard is released.
    pub async fn finished(self) {
        let _ = self.task.await;
    }
}

struct ActiveRound {
    id: RoundId,
    abort: AbortHandle,
    _permit: OwnedSemaphorePermit,
}

struct Shared {
    person_id: String,
    store: Arc<dyn StatusStore>,
    clock: Arc<dyn Clock>,
    config: VerificationConfig,
    phase: Mutex<Phase>,
    active: Mutex<Option<ActiveRound>>,
    events: Option<broadcast::Sender<MonitorEvent>>,
}

impl Shared {
    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.config.store_timeout, fut)
            .await
            .unwrap_or(Err(StoreError::Timeout))
    }

    fn emit(&self, event: MonitorEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.lock() = phase;
    }

    /// The single authoritative read at the end of the response window.
    async fn resolve(&self, round: RoundId) -> RoundOutcome {
        let record = match self.call(self.store.get(&self.person_id)).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::warn!(person_id = %self.person_id, %round, "Verification record vanished");
                return RoundOutcome::Unresolved;
            }
            Err(e) => {
                tracing::error!(
                    person_id = %self.person_id,
                    %round,
                    error = %e,
                    "Store unreachable at resolution; not asserting emergency"
                );
                return RoundOutcome::Unresolved;
            }
        };

        self.decide(round, &record).await
    }

    async fn decide(&self, round: RoundId, record: &VerificationRecord) -> RoundOutcome {
        match record.status {
            VerificationStatus::VerifyRequest => {
                let patch = RecordPatch {
                    status: Some(VerificationStatus::Emergency),
                    requested_at: Some(self.clock.now()),
                    note: Some(SINGLE_SOURCE_NOTE.to_string()),
                    ..RecordPatch::default()
                };
                match self.call(self.store.update(&self.person_id, &patch)).await {
                    Ok(()) => {
                        tracing::warn!(
                            person_id = %self.person_id,
                            %round,
                            reported_force = record.reported_force,
                            "No companion response; escalated to EMERGENCY"
                        );
                        RoundOutcome::Escalated
                    }
                    Err(e) => {
                        tracing::error!(
                            person_id = %self.person_id,
                            %round,
                            error = %e,
                            "Escalation write failed"
                        );
                        RoundOutcome::Unresolved
                    }
                }
            }
            VerificationStatus::Emergency => {
                tracing::info!(person_id = %self.person_id, %round, "Companion confirmed the fall");
                RoundOutcome::ConfirmedByCompanion
            }
            VerificationStatus::Normal | VerificationStatus::FalseAlarm => {
                tracing::info!(
                    person_id = %self.person_id,
                    %round,
                    status = %record.status,
                    "Companion dismissed the fall"
                );
                RoundOutcome::Dismissed
            }
            VerificationStatus::Idle => {
                tracing::warn!(person_id = %self.person_id, %round, "Record reset during round");
                RoundOutcome::Unresolved
            }
        }
    }

    /// Moves to `phase` only while `round` is still the active one.
    fn set_phase_for(&self, round: RoundId, phase: Phase) -> bool {
        let active = self.active.lock();
        if active.as_ref().map(|a| a.id) == Some(round) {
            *self.phase.lock() = phase;
            true
        } else {
            false
        }
    }

    /// Releases the guard and returns to idle if `round` still owns it.
    fn clear_active(&self, round: RoundId) -> bool {
        let mut active = self.active.lock();
        if active.as_ref().map(|a| a.id) == Some(round) {
            *active = None;
            *self.phase.lock() = Phase::Idle;
            true
        } else {
            false
        }
    }
}

/// Drives verification rounds for one monitored person.
pub struct VerificationCoordinator {
    shared: Arc<Shared>,
    guard: VerificationGuard,
}

impl VerificationCoordinator {
    pub fn new(
        person_id: impl Into<String>,
        store: Arc<dyn StatusStore>,
        clock: Arc<dyn Clock>,
        config: VerificationConfig,
        events: Option<broadcast::Sender<MonitorEvent>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                person_id: person_id.into(),
                store,
                clock,
                config,
                phase: Mutex::new(Phase::Idle),
                active: Mutex::new(None),
                events,
            }),
            guard: VerificationGuard::new(),
        }
    }

    pub fn person_id(&self) -> &str {
        &self.shared.person_id
    }

    pub fn phase(&self) -> Phase {
        *self.shared.phase.lock()
    }

    pub fn is_idle(&self) -> bool {
        !self.guard.is_held()
    }

    /// Starts a round for a possible fall.
    ///
    /// Fails with [`BeginError::RoundInFlight`] while another round holds the
    /// guard, and with [`BeginError::Store`] if the request cannot be
    /// published; in the latter case the guard is left clear.
    pub async fn begin_round(&self, evidence: &FallEvidence) -> Result<RoundHandle, BeginError> {
        let permit = self.guard.try_acquire().ok_or(BeginError::RoundInFlight)?;
        let shared = &self.shared;

        let request = RecordPatch {
            status: Some(VerificationStatus::VerifyRequest),
            reported_force: Some(evidence.peak_impact_g),
            requested_at: Some(shared.clock.now()),
            note: Some(String::new()),
            source: Some(REQUEST_SOURCE.to_string()),
        };
        if let Err(e) = shared.call(shared.store.merge(&shared.person_id, &request)).await {
            tracing::warn!(
                person_id = %shared.person_id,
                error = %e,
                "Could not publish verification request; round aborted"
            );
            drop(permit);
            return Err(e.into());
        }

        let id = RoundId::new();
        shared.set_phase(Phase::AwaitingResponse);
        tracing::info!(
            person_id = %shared.person_id,
            round = %id,
            reported_force = evidence.peak_impact_g,
            "Verification requested"
        );
        shared.emit(MonitorEvent::VerificationRequested {
            person_id: shared.person_id.clone(),
            round_id: id,
            reported_force: evidence.peak_impact_g,
        });

        let (tx, resolved) = oneshot::channel();
        let task_shared = Arc::clone(shared);
        // Registered before the task can run to completion and clear it.
        let mut active = shared.active.lock();
        let task = tokio::spawn(async move {
            let shared = task_shared;

            tokio::time::sleep(shared.config.response_window).await;
            let outcome = shared.resolve(id).await;
            if !shared.set_phase_for(id, Phase::Cooldown) {
                return;
            }
            shared.emit(MonitorEvent::RoundResolved {
                person_id: shared.person_id.clone(),
                round_id: id,
                outcome,
            });
            let _ = tx.send(outcome);

            tokio::time::sleep(shared.config.cooldown).await;

            if !shared.clear_active(id) {
                return;
            }
            shared.emit(MonitorEvent::RoundClosed {
                person_id: shared.person_id.clone(),
                round_id: id,
            });
            tracing::debug!(person_id = %shared.person_id, round = %id, "Round closed");
        });

        *active = Some(ActiveRound {
            id,
            abort: task.abort_handle(),
            _permit: permit,
        });
        drop(active);

        Ok(RoundHandle { id, resolved, task })
    }

    /// Aborts the given round if it is still running. The guard is released.
    pub fn cancel(&self, round: RoundId) -> bool {
        let mut active = self.shared.active.lock();
        match active.as_ref() {
            Some(current) if current.id == round => {
                current.abort.abort();
                // Dropping the slot releases the permit before we return.
                *active = None;
                self.shared.set_phase(Phase::Idle);
                tracing::info!(person_id = %self.shared.person_id, %round, "Round cancelled");
                true
            }
            _ => false,
        }
    }

    /// Aborts whatever round is in flight.
    pub fn shutdown(&self) {
        let current = self.shared.active.lock().as_ref().map(|a| a.id);
        if let Some(round) = current {
            self.cancel(round);
        }
    }
}

impl Drop for VerificationCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//! Fall verification core: windowed sensor ingestion, an impact gate, and a
//! cross-device verification protocol over a shared status record.

pub mod activity;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod features;
pub mod logic;
pub mod model;
pub mod monitor;
pub mod store;
pub mod window;

#[cfg(test)]
mod tests;

pub use classifier::{Classifier, ForestClassifier, Prediction, ProcessClassifier};
pub use clock::{Clock, SystemClock};
pub use config::Config;
pub use coordinator::{RoundOutcome, VerificationConfig, VerificationCoordinator};
pub use logic::{GateConfig, ImpactGate, Verdict};
pub use model::{MonitorEvent, SensorFrame, VerificationRecord, VerificationStatus};
pub use monitor::{MonitorRegistry, MonitorSettings, PersonMonitor};
pub use store::{MemoryStatusStore, PgStatusStore, StatusStore};
pub use window::{FeatureWindow, WindowBuffer};

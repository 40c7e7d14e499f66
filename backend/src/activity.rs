//! Coarse activity level and long-inactivity alerting.

use crate::window::FeatureWindow;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Impact magnitude (g) above which the wearer is moving vigorously.
pub const ACTIVE_THRESHOLD_G: f64 = 2.0;
/// Impact magnitude (g) above which the wearer is walking.
pub const WALKING_THRESHOLD_G: f64 = 1.2;
pub const DEFAULT_INACTIVITY_MINUTES: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLevel {
    Resting,
    Walking,
    Active,
}

impl ActivityLevel {
    pub fn from_impact(impact_g: f64) -> Self {
        if impact_g > ACTIVE_THRESHOLD_G {
            ActivityLevel::Active
        } else if impact_g > WALKING_THRESHOLD_G {
            ActivityLevel::Walking
        } else {
            ActivityLevel::Resting
        }
    }

    pub fn is_moving(&self) -> bool {
        !matches!(self, ActivityLevel::Resting)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivityReport {
    pub level: ActivityLevel,
    pub inactive_minutes: i64,
    pub alert: bool,
    /// True only for the observation that crossed the alert threshold.
    pub alert_raised: bool,
}

/// Tracks when a person was last seen moving.
#[derive(Debug)]
pub struct ActivityTracker {
    last_active: DateTime<Utc>,
    alert_after: Duration,
    alerted: bool,
}

impl ActivityTracker {
    /// `started` counts as the last activity until movement is observed.
    pub fn new(started: DateTime<Utc>, alert_after_minutes: i64) -> Self {
        Self {
            last_active: started,
            alert_after: Duration::minutes(alert_after_minutes.max(1)),
            alerted: false,
        }
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        self.last_active
    }

    /// Classifies `window` by its peak impact, so any movement within it counts.
    pub fn observe_window(&mut self, window: &FeatureWindow, now: DateTime<Utc>) -> ActivityReport {
        let peak = window
            .impact_series()
            .into_iter()
            .fold(0.0, f64::max);
        self.observe(peak, now)
    }

    pub fn observe(&mut self, impact_g: f64, now: DateTime<Utc>) -> ActivityReport {
        let level = ActivityLevel::from_impact(impact_g);
        if level.is_moving() {
            self.last_active = now;
            self.alerted = false;
        }

        let inactive = now - self.last_active;
        let alert = inactive >= self.alert_after;
        let alert_raised = alert && !self.alerted;
        if alert_raised {
            self.alerted = true;
            tracing::warn!(
                inactive_minutes = inactive.num_minutes(),
                "Long inactivity"
            );
        }

        ActivityReport {
            level,
            inactive_minutes: inactive.num_minutes(),
            alert,
            alert_raised,
        }
    }
}

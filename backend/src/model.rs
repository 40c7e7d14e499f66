use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::activity::ActivityLevel;
use crate::coordinator::{RoundId, RoundOutcome};
use crate::logic::TriggerRule;

/// Standard gravity used to coerce m/s² readings into g.
pub const STANDARD_GRAVITY: f64 = 9.8;

/// Person id used when an ingest request does not name one.
pub const DEFAULT_PERSON_ID: &str = "guest";

// 1. INPUT: one 6-axis motion sample

/// A single 6-axis motion sample: acceleration plus angular rate.
///
/// Acceleration may arrive in g or in m/s²; the unit is decided per window
/// by [`crate::window::FeatureWindow`], never per frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorFrame {
    pub acc_x: f64,
    pub acc_y: f64,
    pub acc_z: f64,
    pub gyro_x: f64,
    pub gyro_y: f64,
    pub gyro_z: f64,
    /// Sequence number or capture time. Strictly increasing within a window.
    pub time: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("expected 6 fields, got {0}")]
    TooShort(usize),

    #[error("invalid number in field {index}: {value:?}")]
    InvalidNumber { index: usize, value: String },

    #[error("frame time {time} does not follow {previous}")]
    OutOfOrder { time: f64, previous: f64 },
}

impl SensorFrame {
    pub fn new(acc: [f64; 3], gyro: [f64; 3], time: f64) -> Self {
        Self {
            acc_x: acc[0],
            acc_y: acc[1],
            acc_z: acc[2],
            gyro_x: gyro[0],
            gyro_y: gyro[1],
            gyro_z: gyro[2],
            time,
        }
    }

    /// Parses a delimited `ax,ay,az,gx,gy,gz` tuple as sent by the wearable.
    /// Extra trailing fields are ignored.
    pub fn parse_tuple(line: &str, time: f64) -> Result<Self, FrameError> {
        let parts: Vec<&str> = line.trim().split(',').collect();
        if parts.len() < 6 {
            return Err(FrameError::TooShort(parts.len()));
        }

        let mut values = [0.0f64; 6];
        for (index, raw) in parts.iter().take(6).enumerate() {
            let value = raw
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| FrameError::InvalidNumber {
                    index,
                    value: raw.to_string(),
                })?;
            values[index] = value;
        }

        Ok(Self::new(
            [values[0], values[1], values[2]],
            [values[3], values[4], values[5]],
            time,
        ))
    }

    /// Euclidean norm of the acceleration axes (SVM).
    pub fn impact_magnitude(&self) -> f64 {
        (self.acc_x.powi(2) + self.acc_y.powi(2) + self.acc_z.powi(2)).sqrt()
    }

    /// Euclidean norm of the angular-rate axes (GVM).
    pub fn rotation_magnitude(&self) -> f64 {
        (self.gyro_x.powi(2) + self.gyro_y.powi(2) + self.gyro_z.powi(2)).sqrt()
    }

    pub(crate) fn scaled_acceleration(&self, divisor: f64) -> Self {
        Self {
            acc_x: self.acc_x / divisor,
            acc_y: self.acc_y / divisor,
            acc_z: self.acc_z / divisor,
            ..*self
        }
    }
}

// 2. INPUT: HTTP ingest payload

/// A sample as posted to `/predict`. The phone app omits gyro values.
#[derive(Debug, Clone, Deserialize)]
pub struct RawSample {
    pub acc_x: f64,
    pub acc_y: f64,
    pub acc_z: f64,
    #[serde(default)]
    pub gyro_x: f64,
    #[serde(default)]
    pub gyro_y: f64,
    #[serde(default)]
    pub gyro_z: f64,
    #[serde(default, alias = "t")]
    pub time: Option<f64>,
}

impl RawSample {
    pub fn into_frame(self, fallback_time: f64) -> SensorFrame {
        SensorFrame::new(
            [self.acc_x, self.acc_y, self.acc_z],
            [self.gyro_x, self.gyro_y, self.gyro_z],
            self.time.unwrap_or(fallback_time),
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestConfig {
    /// 0–100 sensitivity; older clients send it as `threshold`.
    #[serde(default, alias = "threshold")]
    pub sensitivity: Option<f64>,
}

/// Body of `PUT /api/config/{person_id}`. A `null` sensitivity restores the default.
#[derive(Debug, Clone, Deserialize)]
pub struct PersonConfig {
    #[serde(alias = "threshold")]
    pub sensitivity: Option<f64>,
}

#[derive(Debug, Error, PartialEq)]
#[error("sensitivity must be within 0-100, got {0}")]
pub struct SensitivityOutOfRange(pub f64);

/// Accepts a 0–100 sensitivity setting.
pub fn check_sensitivity(sensitivity: Option<f64>) -> Result<Option<f64>, SensitivityOutOfRange> {
    match sensitivity {
        Some(s) if !(0.0..=100.0).contains(&s) => Err(SensitivityOutOfRange(s)),
        other => Ok(other),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictRequest {
    #[serde(default, alias = "userId")]
    pub person_id: Option<String>,
    pub data: Vec<RawSample>,
    #[serde(default)]
    pub config: RequestConfig,
}

impl PredictRequest {
    pub fn person_id(&self) -> &str {
        self.person_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .unwrap_or(DEFAULT_PERSON_ID)
    }
}

// 3. OUTPUT: ingest verdict

#[derive(Debug, Clone, Serialize)]
pub struct PredictResponse {
    pub result: u8,
    pub probability: f64,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity: Option<ActivityLevel>,
    pub inactivity_alert: bool,
}

impl PredictResponse {
    pub fn buffering(received: usize, required: usize) -> Self {
        Self {
            result: 0,
            probability: 0.0,
            status: format!("buffering ({received}/{required})"),
            verification: None,
            activity: None,
            inactivity_alert: false,
        }
    }
}

// 4. SHARED STATE: the rendezvous record between wearable and phone

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    #[default]
    Idle,
    VerifyRequest,
    Emergency,
    Normal,
    FalseAlarm,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::VerifyRequest => "VERIFY_REQUEST",
            Self::Emergency => "EMERGENCY",
            Self::Normal => "NORMAL",
            Self::FalseAlarm => "FALSE_ALARM",
        }
    }

    /// Statuses the companion app is allowed to write.
    pub fn is_companion_answer(&self) -> bool {
        matches!(self, Self::Emergency | Self::Normal | Self::FalseAlarm)
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown verification status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for VerificationStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "IDLE" => Ok(Self::Idle),
            "VERIFY_REQUEST" => Ok(Self::VerifyRequest),
            "EMERGENCY" => Ok(Self::Emergency),
            "NORMAL" => Ok(Self::Normal),
            "FALSE_ALARM" => Ok(Self::FalseAlarm),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// One record per monitored person, written by both detectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct VerificationRecord {
    pub status: VerificationStatus,
    /// Peak impact (g) that triggered the round.
    pub reported_force: f64,
    pub requested_at: DateTime<Utc>,
    pub note: String,
    /// Which detector raised the request.
    #[serde(default)]
    pub source: Option<String>,
}

impl VerificationRecord {
    /// Applies the fields present in `patch`, leaving the rest untouched.
    pub fn apply(&mut self, patch: &RecordPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(force) = patch.reported_force {
            self.reported_force = force;
        }
        if let Some(at) = patch.requested_at {
            self.requested_at = at;
        }
        if let Some(note) = &patch.note {
            self.note = note.clone();
        }
        if let Some(source) = &patch.source {
            self.source = Some(source.clone());
        }
    }
}

/// Partial record used for `merge` and `update`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordPatch {
    #[serde(default)]
    pub status: Option<VerificationStatus>,
    #[serde(default)]
    pub reported_force: Option<f64>,
    #[serde(default)]
    pub requested_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

impl RecordPatch {
    pub fn status(status: VerificationStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Companion (phone) answer posted to `/api/status/{person}/respond`.
#[derive(Debug, Deserialize)]
pub struct CompanionAnswer {
    pub status: VerificationStatus,
    #[serde(default)]
    pub note: Option<String>,
}

// 5. LIVE STREAM: events pushed to dashboards

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MonitorEvent {
    PossibleFall {
        person_id: String,
        peak_impact_g: f64,
        probability: f64,
        rule: TriggerRule,
    },
    VerificationRequested {
        person_id: String,
        round_id: RoundId,
        reported_force: f64,
    },
    RoundResolved {
        person_id: String,
        round_id: RoundId,
        outcome: RoundOutcome,
    },
    RoundClosed {
        person_id: String,
        round_id: RoundId,
    },
    InactivityAlert {
        person_id: String,
        inactive_minutes: i64,
    },
}

impl MonitorEvent {
    pub fn person_id(&self) -> &str {
        match self {
            MonitorEvent::PossibleFall { person_id, .. }
            | MonitorEvent::VerificationRequested { person_id, .. }
            | MonitorEvent::RoundResolved { person_id, .. }
            | MonitorEvent::RoundClosed { person_id, .. }
            | MonitorEvent::InactivityAlert { person_id, .. } => person_id,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_six_field_tuple() {
        let frame = SensorFrame::parse_tuple(" 0.1, 0.9,0.2,1,2,3 ", 4.0).unwrap();
        assert_eq!(frame.acc_y, 0.9);
        assert_eq!(frame.gyro_z, 3.0);
        assert_eq!(frame.time, 4.0);
    }

    #[test]
    fn rejects_short_and_garbled_tuples() {
        assert_eq!(
            SensorFrame::parse_tuple("1,2,3", 0.0),
            Err(FrameError::TooShort(3))
        );
        assert!(matches!(
            SensorFrame::parse_tuple("1,2,x,4,5,6", 0.0),
            Err(FrameError::InvalidNumber { index: 2, .. })
        ));
        assert!(SensorFrame::parse_tuple("1,2,NaN,4,5,6", 0.0).is_err());
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            VerificationStatus::Idle,
            VerificationStatus::VerifyRequest,
            VerificationStatus::Emergency,
            VerificationStatus::Normal,
            VerificationStatus::FalseAlarm,
        ] {
            assert_eq!(status.as_str().parse::<VerificationStatus>().unwrap(), status);
        }
        assert_eq!(
            serde_json::to_string(&VerificationStatus::FalseAlarm).unwrap(),
            "\"FALSE_ALARM\""
        );
    }

    #[test]
    fn patch_leaves_unspecified_fields() {
        let mut record = VerificationRecord {
            status: VerificationStatus::VerifyRequest,
            reported_force: 2.4,
            note: "keep".into(),
            ..Default::default()
        };
        record.apply(&RecordPatch::status(VerificationStatus::Normal));
        assert_eq!(record.status, VerificationStatus::Normal);
        assert_eq!(record.reported_force, 2.4);
        assert_eq!(record.note, "keep");
    }

    #[test]
    fn predict_request_accepts_legacy_field_names() {
        let req: PredictRequest = serde_json::from_str(
            r#"{"userId":"u1","data":[{"acc_x":0,"acc_y":0,"acc_z":1}],"config":{"threshold":70}}"#,
        )
        .unwrap();
        assert_eq!(req.person_id(), "u1");
        assert_eq!(req.config.sensitivity, Some(70.0));
        assert_eq!(req.data[0].gyro_x, 0.0);

        let anon: PredictRequest = serde_json::from_str(r#"{"data":[]}"#).unwrap();
        assert_eq!(anon.person_id(), DEFAULT_PERSON_ID);
    }

    #[test]
    fn sensitivity_must_be_a_percentage() {
        assert_eq!(check_sensitivity(None), Ok(None));
        assert_eq!(check_sensitivity(Some(0.0)), Ok(Some(0.0)));
        assert_eq!(check_sensitivity(Some(100.0)), Ok(Some(100.0)));
        assert!(check_sensitivity(Some(120.0)).is_err());
        assert!(check_sensitivity(Some(f64::NAN)).is_err());

        let body: PersonConfig = serde_json::from_str(r#"{"threshold": 30}"#).unwrap();
        assert_eq!(body.sensitivity, Some(30.0));
    }
}

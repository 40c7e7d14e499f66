//! Runtime configuration from the environment (and `.env`).

use crate::classifier::ModelInput;
use crate::coordinator::VerificationConfig;
use crate::logic::GateConfig;
use crate::monitor::MonitorSettings;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_MODEL_PATH: &str = "models/fall_forest.json";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("{key}: {reason}")]
    OutOfRange { key: &'static str, reason: &'static str },

    #[error("CLASSIFIER=process requires CLASSIFIER_CMD")]
    MissingCommand,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClassifierChoice {
    Forest { model_path: String },
    Process { command: String, input: ModelInput },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    /// Absent means the in-memory store.
    pub database_url: Option<String>,
    pub classifier: ClassifierChoice,
    pub gate: GateConfig,
    pub verification: VerificationConfig,
    pub monitor: MonitorSettings,
}

impl Config {
    /// Loads `.env` if present, then reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let classifier = match env.string("CLASSIFIER").as_deref() {
            None | Some("forest") => ClassifierChoice::Forest {
                model_path: env
                    .string("MODEL_PATH")
                    .unwrap_or_else(|| DEFAULT_MODEL_PATH.to_string()),
            },
            Some("process") => ClassifierChoice::Process {
                command: env.string("CLASSIFIER_CMD").ok_or(ConfigError::MissingCommand)?,
                input: match env.string("CLASSIFIER_INPUT") {
                    Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                        key: "CLASSIFIER_INPUT",
                        value: raw,
                    })?,
                    None => ModelInput::Raw,
                },
            },
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "CLASSIFIER",
                    value: other.to_string(),
                })
            }
        };

        let defaults = GateConfig::default();
        let gate = GateConfig {
            sensitivity: env.parse("FALL_SENSITIVITY")?.unwrap_or(defaults.sensitivity),
            override_impact_g: env.parse("GATE_OVERRIDE_G")?.unwrap_or(defaults.override_impact_g),
            high_probability: env.parse("GATE_HIGH_PROB")?.unwrap_or(defaults.high_probability),
            low_probability: env.parse("GATE_LOW_PROB")?.unwrap_or(defaults.low_probability),
            secondary_impact_g: env
                .parse("GATE_SECONDARY_G")?
                .unwrap_or(defaults.secondary_impact_g),
            activity_ceiling: env
                .parse("GATE_ACTIVITY_CEILING")?
                .unwrap_or(defaults.activity_ceiling),
            classifier_timeout: env
                .millis("CLASSIFIER_TIMEOUT_MS")?
                .unwrap_or(defaults.classifier_timeout),
            ..defaults
        };
        if !(0.0..=100.0).contains(&gate.sensitivity) {
            return Err(ConfigError::OutOfRange {
                key: "FALL_SENSITIVITY",
                reason: "must be between 0 and 100",
            });
        }
        if gate.low_probability > gate.high_probability {
            return Err(ConfigError::OutOfRange {
                key: "GATE_LOW_PROB",
                reason: "must not exceed GATE_HIGH_PROB",
            });
        }

        let defaults = VerificationConfig::default();
        let verification = VerificationConfig {
            response_window: env
                .millis("VERIFY_WINDOW_MS")?
                .unwrap_or(defaults.response_window),
            cooldown: env.millis("VERIFY_COOLDOWN_MS")?.unwrap_or(defaults.cooldown),
            store_timeout: env.millis("STORE_TIMEOUT_MS")?.unwrap_or(defaults.store_timeout),
        };

        let defaults = MonitorSettings::default();
        let monitor = MonitorSettings {
            window_len: env.parse("WINDOW_LEN")?.unwrap_or(defaults.window_len),
            eval_stride: env.parse("EVAL_STRIDE")?.unwrap_or(defaults.eval_stride),
            inactivity_minutes: env
                .parse("INACTIVITY_ALERT_MINS")?
                .unwrap_or(defaults.inactivity_minutes),
            idle_eviction_minutes: env
                .parse("MONITOR_IDLE_MINS")?
                .unwrap_or(defaults.idle_eviction_minutes),
            event_capacity: env.parse("EVENT_CAPACITY")?.unwrap_or(defaults.event_capacity),
        };
        if monitor.window_len < 2 {
            return Err(ConfigError::OutOfRange {
                key: "WINDOW_LEN",
                reason: "must be at least 2",
            });
        }
        if monitor.event_capacity == 0 {
            return Err(ConfigError::OutOfRange {
                key: "EVENT_CAPACITY",
                reason: "must be positive",
            });
        }
        if monitor.eval_stride == 0 {
            return Err(ConfigError::OutOfRange {
                key: "EVAL_STRIDE",
                reason: "must be positive",
            });
        }

        Ok(Self {
            bind_addr: env
                .string("BIND_ADDR")
                .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            database_url: env.string("DATABASE_URL"),
            classifier,
            gate,
            verification,
            monitor,
        })
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    /// Blank values count as unset.
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &'static str) -> Result<Option<T>, ConfigError> {
        match self.string(key) {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::Invalid { key, value: raw }),
            None => Ok(None),
        }
    }

    fn millis(&self, key: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }
}

//! Fall-probability oracles.
//!
//! The gate only sees the [`Classifier`] capability. Two families sit behind
//! it: a tree ensemble over hand-built features ([`ForestClassifier`]) and an
//! external model process fed either features or the raw window
//! ([`ProcessClassifier`]), typically a sequence model.

use crate::features::{FeatureVector, MODEL_FEATURES};
use crate::window::FeatureWindow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Decision threshold used when a forest artifact does not carry one.
pub const DEFAULT_DECISION_THRESHOLD: f64 = 0.45;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid model: {0}")]
    InvalidModel(String),

    #[error("malformed model reply: {0}")]
    MalformedReply(String),

    #[error("model process exited with {0}")]
    ProcessFailed(std::process::ExitStatus),

    #[error("classifier timed out")]
    Timeout,
}

/// Model output: a binary decision plus the fall probability behind it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub result: u8,
    pub probability: f64,
}

impl Prediction {
    /// `{0, 0.0}`: what callers get whenever no model opinion exists.
    pub fn safe_default() -> Self {
        Self {
            result: 0,
            probability: 0.0,
        }
    }

    pub fn from_probability(probability: f64, decision_threshold: f64) -> Self {
        Self {
            result: u8::from(probability > decision_threshold),
            probability,
        }
    }

    fn validate(self) -> Result<Self, ClassifierError> {
        if !(0.0..=1.0).contains(&self.probability) || self.result > 1 {
            return Err(ClassifierError::MalformedReply(format!(
                "result={} probability={}",
                self.result, self.probability
            )));
        }
        Ok(self)
    }
}

/// Everything a model may consume for one window.
pub struct ClassifierInput<'a> {
    pub window: &'a FeatureWindow,
    pub features: &'a FeatureVector,
    /// Effective 0–100 sensitivity for this evaluation.
    pub sensitivity: f64,
}

#[async_trait]
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    async fn predict(&self, input: &ClassifierInput<'_>) -> Result<Prediction, ClassifierError>;
}

// ============================================================
// Tree ensemble
// ============================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        value: f64,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct Tree {
    nodes: Vec<TreeNode>,
}

impl Tree {
    fn validate(&self, index: usize) -> Result<(), ClassifierError> {
        if self.nodes.is_empty() {
            return Err(ClassifierError::InvalidModel(format!("tree {index} is empty")));
        }
        for (n, node) in self.nodes.iter().enumerate() {
            match *node {
                TreeNode::Split {
                    feature,
                    left,
                    right,
                    ..
                } => {
                    if feature >= MODEL_FEATURES {
                        return Err(ClassifierError::InvalidModel(format!(
                            "tree {index} node {n} uses feature {feature}"
                        )));
                    }
                    // Children must point forward, which also rules out cycles.
                    if left <= n || right <= n || left >= self.nodes.len() || right >= self.nodes.len()
                    {
                        return Err(ClassifierError::InvalidModel(format!(
                            "tree {index} node {n} has bad children"
                        )));
                    }
                }
                TreeNode::Leaf { value } => {
                    if !(0.0..=1.0).contains(&value) {
                        return Err(ClassifierError::InvalidModel(format!(
                            "tree {index} leaf {n} value {value}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn evaluate(&self, x: &[f64; MODEL_FEATURES]) -> f64 {
        let mut idx = 0;
        loop {
            match self.nodes[idx] {
                TreeNode::Leaf { value } => return value,
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => idx = if x[feature] <= threshold { left } else { right },
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ForestArtifact {
    #[serde(default = "default_decision_threshold")]
    decision_threshold: f64,
    trees: Vec<Tree>,
}

fn default_decision_threshold() -> f64 {
    DEFAULT_DECISION_THRESHOLD
}

/// Tree ensemble over the 12-value feature vector.
///
/// Probability is the mean leaf value across trees. A missing artifact is a
/// permanent local condition: the classifier stays usable and answers
/// [`Prediction::safe_default`], leaving the physical override gate in charge.
pub struct ForestClassifier {
    model: Option<ForestArtifact>,
    source: PathBuf,
}

impl ForestClassifier {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ClassifierError> {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    path = %path.display(),
                    "Model artifact missing; classifier will report probability 0"
                );
                return Ok(Self::unavailable(path));
            }
            Err(e) => return Err(e.into()),
        };

        let artifact: ForestArtifact = serde_json::from_str(&content)?;
        if artifact.trees.is_empty() {
            return Err(ClassifierError::InvalidModel("forest has no trees".into()));
        }
        for (i, tree) in artifact.trees.iter().enumerate() {
            tree.validate(i)?;
        }

        tracing::info!(
            path = %path.display(),
            trees = artifact.trees.len(),
            decision_threshold = artifact.decision_threshold,
            "Forest model loaded"
        );

        Ok(Self {
            model: Some(artifact),
            source: path.to_path_buf(),
        })
    }

    pub fn unavailable(path: impl AsRef<Path>) -> Self {
        Self {
            model: None,
            source: path.as_ref().to_path_buf(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.model.is_some()
    }

    pub fn probability(&self, features: &FeatureVector) -> Option<f64> {
        let model = self.model.as_ref()?;
        let x = features.model_input();
        let sum: f64 = model.trees.iter().map(|t| t.evaluate(&x)).sum();
        Some(sum / model.trees.len() as f64)
    }
}

#[async_trait]
impl Classifier for ForestClassifier {
    fn name(&self) -> &str {
        "forest"
    }

    async fn predict(&self, input: &ClassifierInput<'_>) -> Result<Prediction, ClassifierError> {
        let Some(model) = &self.model else {
            tracing::debug!(path = %self.source.display(), "No model artifact, safe default");
            return Ok(Prediction::safe_default());
        };
        let probability = self.probability(input.features).unwrap_or(0.0);
        Ok(Prediction::from_probability(probability, model.decision_threshold))
    }
}

// ============================================================
// External model process
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelInput {
    /// Named-field sample records, acceleration in g.
    Raw,
    Features,
}

impl std::str::FromStr for ModelInput {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(Self::Raw),
            "features" => Ok(Self::Features),
            other => Err(format!("unknown model input {other:?}")),
        }
    }
}

/// Runs an external model once per window, JSON on stdin and stdout.
///
/// The child is killed if the call is dropped, so the gate's timeout bounds it.
pub struct ProcessClassifier {
    program: String,
    args: Vec<String>,
    input: ModelInput,
}

impl ProcessClassifier {
    pub fn new(program: impl Into<String>, args: Vec<String>, input: ModelInput) -> Self {
        Self {
            program: program.into(),
            args,
            input,
        }
    }

    /// Splits a shell-like command line on whitespace.
    pub fn from_command_line(command: &str, input: ModelInput) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect(), input))
    }

    /// Raw windows go out as named-field sample records, the shape the
    /// sequence and forest model scripts index by column name.
    fn payload(&self, input: &ClassifierInput<'_>) -> serde_json::Value {
        let config = serde_json::json!({ "threshold": input.sensitivity });
        match self.input {
            ModelInput::Raw => serde_json::json!({
                "data": input.window.frames(),
                "config": config,
            }),
            ModelInput::Features => serde_json::json!({
                "features": input.features.model_input(),
                "config": config,
            }),
        }
    }
}

#[async_trait]
impl Classifier for ProcessClassifier {
    fn name(&self) -> &str {
        match self.input {
            ModelInput::Raw => "process-raw",
            ModelInput::Features => "process-features",
        }
    }

    async fn predict(&self, input: &ClassifierInput<'_>) -> Result<Prediction, ClassifierError> {
        let body = serde_json::to_vec(&self.payload(input))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            // A model that exits without reading its input is judged by its reply.
            let written = match stdin.write_all(&body).await {
                Ok(()) => stdin.shutdown().await,
                Err(e) => Err(e),
            };
            match written {
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                other => other?,
            }
        }

        let output = child.wait_with_output().await?;
        let diagnostics = String::from_utf8_lossy(&output.stderr);
        if !diagnostics.trim().is_empty() {
            tracing::debug!(classifier = self.name(), stderr = %diagnostics.trim(), "Model diagnostics");
        }
        if !output.status.success() {
            return Err(ClassifierError::ProcessFailed(output.status));
        }

        let reply: Prediction = serde_json::from_slice(&output.stdout)
            .map_err(|e| ClassifierError::MalformedReply(e.to_string()))?;
        reply.validate()
    }
}

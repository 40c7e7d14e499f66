use crate::classifier::{Classifier, ClassifierError, ClassifierInput, Prediction};
use crate::features::{sample_std, FeatureExtractor, FeatureVector};
use crate::model::STANDARD_GRAVITY;
use crate::window::FeatureWindow;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_SENSITIVITY: f64 = 50.0;

/// Physical impact threshold (m/s²) for a 0–100 sensitivity setting.
pub fn physical_threshold(sensitivity: f64) -> f64 {
    let s = if sensitivity.is_finite() {
        sensitivity.clamp(0.0, 100.0)
    } else {
        DEFAULT_SENSITIVITY
    };
    12.0 + (s - 10.0) * 13.0 / 90.0
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub sensitivity: f64,
    /// Peak impact (g) treated as a fall whatever the model says.
    pub override_impact_g: f64,
    pub high_probability: f64,
    pub low_probability: f64,
    /// Impact (g) that, with a low-probability model signal, corroborates a fall.
    pub secondary_impact_g: f64,
    /// Frames skipped after the peak before measuring post-impact activity.
    pub stillness_offset: usize,
    /// Trailing frames required before the stillness gate applies.
    pub stillness_min_frames: usize,
    /// Post-impact impact-magnitude std (m/s²) above which the wearer is still active.
    pub activity_ceiling: f64,
    pub classifier_timeout: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            sensitivity: DEFAULT_SENSITIVITY,
            override_impact_g: 1.6,
            high_probability: 0.40,
            low_probability: 0.20,
            secondary_impact_g: 1.3,
            stillness_offset: 5,
            stillness_min_frames: 5,
            activity_ceiling: 3.0,
            classifier_timeout: Duration::from_millis(800),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerRule {
    ImpactOverride,
    HighConfidence,
    Corroborated,
}

/// Which stage turned a window away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    BelowPhysicalThreshold,
    PostImpactActivity,
    Inconclusive,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallEvidence {
    pub peak_impact_g: f64,
    pub probability: f64,
    pub rule: TriggerRule,
    pub physical_threshold: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    NoAction {
        reason: Rejection,
        probability: f64,
    },
    PossibleFall(FallEvidence),
}

impl Verdict {
    pub fn is_possible_fall(&self) -> bool {
        matches!(self, Verdict::PossibleFall(_))
    }

    pub fn probability(&self) -> f64 {
        match self {
            Verdict::NoAction { probability, .. } => *probability,
            Verdict::PossibleFall(evidence) => evidence.probability,
        }
    }
}

/// Short-circuiting rule pipeline from a window to a single-device verdict.
pub struct ImpactGate {
    config: GateConfig,
    extractor: FeatureExtractor,
    classifier: Arc<dyn Classifier>,
}

impl ImpactGate {
    pub fn new(config: GateConfig, classifier: Arc<dyn Classifier>) -> Self {
        Self {
            config,
            extractor: FeatureExtractor::new(),
            classifier,
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub async fn evaluate(&self, window: &FeatureWindow) -> Verdict {
        self.evaluate_with(window, None).await
    }

    /// Evaluates with a caller-supplied sensitivity, falling back to the configured one.
    pub async fn evaluate_with(&self, window: &FeatureWindow, sensitivity: Option<f64>) -> Verdict {
        let features = self.extractor.extract(window);
        let peak_g = features.impact.max;
        let sensitivity = sensitivity.unwrap_or(self.config.sensitivity);
        let threshold = physical_threshold(sensitivity);

        // Gate 1: not enough force to be a fall.
        if peak_g * STANDARD_GRAVITY < threshold {
            tracing::trace!(peak_g, threshold, "Impact below physical threshold");
            return Verdict::NoAction {
                reason: Rejection::BelowPhysicalThreshold,
                probability: 0.0,
            };
        }

        // Gate 2: still moving vigorously after the peak.
        if let Some(activity) = self.post_impact_activity(window, &features) {
            if activity > self.config.activity_ceiling {
                tracing::debug!(peak_g, activity, "Movement after impact, not a fall");
                return Verdict::NoAction {
                    reason: Rejection::PostImpactActivity,
                    probability: 0.0,
                };
            }
        }

        // Gate 3: model opinion.
        let probability = self.classify(window, &features, sensitivity).await.probability;

        // Gate 4: first matching rule wins.
        let rule = if peak_g >= self.config.override_impact_g {
            Some(TriggerRule::ImpactOverride)
        } else if probability > self.config.high_probability {
            Some(TriggerRule::HighConfidence)
        } else if probability > self.config.low_probability
            && peak_g > self.config.secondary_impact_g
        {
            Some(TriggerRule::Corroborated)
        } else {
            None
        };

        match rule {
            Some(rule) => {
                tracing::info!(peak_g, probability, ?rule, "Possible fall");
                Verdict::PossibleFall(FallEvidence {
                    peak_impact_g: peak_g,
                    probability,
                    rule,
                    physical_threshold: threshold,
                })
            }
            None => Verdict::NoAction {
                reason: Rejection::Inconclusive,
                probability,
            },
        }
    }

    /// Std of impact magnitude (m/s²) after the peak, if enough frames follow it.
    fn post_impact_activity(&self, window: &FeatureWindow, features: &FeatureVector) -> Option<f64> {
        let series = window.impact_series();
        let start = features.peak_index + self.config.stillness_offset;
        let trailing = series.get(start..)?;
        if trailing.len() <= self.config.stillness_min_frames {
            return None;
        }
        Some(sample_std(trailing) * STANDARD_GRAVITY)
    }

    /// A failed or slow model counts as "no opinion", never as an error.
    async fn classify(
        &self,
        window: &FeatureWindow,
        features: &FeatureVector,
        sensitivity: f64,
    ) -> Prediction {
        let input = ClassifierInput {
            window,
            features,
            sensitivity,
        };
        let outcome =
            match tokio::time::timeout(self.config.classifier_timeout, self.classifier.predict(&input))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(ClassifierError::Timeout),
            };

        match outcome {
            Ok(prediction) => prediction,
            Err(e) => {
                tracing::warn!(
                    classifier = self.classifier.name(),
                    error = %e,
                    "Classifier call failed, treating probability as 0"
                );
                Prediction::safe_default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SensorFrame;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns a fixed probability and counts calls.
    struct FixedClassifier {
        probability: f64,
        calls: AtomicUsize,
    }

    impl FixedClassifier {
        fn new(probability: f64) -> Arc<Self> {
            Arc::new(Self {
                probability,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Classifier for FixedClassifier {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn predict(&self, _: &ClassifierInput<'_>) -> Result<Prediction, ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Prediction::from_probability(self.probability, 0.5))
        }
    }

    struct BrokenClassifier;

    #[async_trait]
    impl Classifier for BrokenClassifier {
        fn name(&self) -> &str {
            "broken"
        }

        async fn predict(&self, _: &ClassifierInput<'_>) -> Result<Prediction, ClassifierError> {
            Err(ClassifierError::MalformedReply("boom".into()))
        }
    }

    struct StalledClassifier;

    #[async_trait]
    impl Classifier for StalledClassifier {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn predict(&self, _: &ClassifierInput<'_>) -> Result<Prediction, ClassifierError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Prediction { result: 1, probability: 1.0 })
        }
    }

    /// Calm 1 g, one impact frame, then lying still.
    fn impact_window(peak_g: f64) -> FeatureWindow {
        let frames = (0..50)
            .map(|i| {
                let z = if i == 20 { peak_g } else { 1.0 };
                SensorFrame::new([0.0, 0.0, z], [0.0; 3], i as f64)
            })
            .collect();
        FeatureWindow::from_frames(frames).unwrap()
    }

    /// Low sensitivity so gate 1 lets moderate impacts through.
    fn permissive() -> GateConfig {
        GateConfig {
            sensitivity: 10.0,
            ..GateConfig::default()
        }
    }

    #[test]
    fn sensitivity_maps_linearly_and_monotonically() {
        assert!((physical_threshold(50.0) - 17.777_777).abs() < 1e-5);
        assert_eq!(physical_threshold(10.0), 12.0);
        assert_eq!(physical_threshold(100.0), 25.0);

        let mut previous = f64::NEG_INFINITY;
        for s in 0..=100 {
            let t = physical_threshold(s as f64);
            assert!(t >= previous);
            previous = t;
        }
        assert_eq!(physical_threshold(250.0), physical_threshold(100.0));
    }

    #[tokio::test]
    async fn weak_impact_rejected_before_classifier() {
        let classifier = FixedClassifier::new(0.99);
        let gate = ImpactGate::new(GateConfig::default(), classifier.clone());

        // Peak of 10 m/s² against a 17.78 m/s² threshold.
        let verdict = gate.evaluate(&impact_window(10.0 / STANDARD_GRAVITY)).await;
        assert!(matches!(
            verdict,
            Verdict::NoAction { reason: Rejection::BelowPhysicalThreshold, .. }
        ));
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn request_sensitivity_overrides_configured_one() {
        let gate = ImpactGate::new(GateConfig::default(), FixedClassifier::new(0.0));
        let window = impact_window(1.6);

        assert!(!gate.evaluate(&window).await.is_possible_fall());
        assert!(gate.evaluate_with(&window, Some(10.0)).await.is_possible_fall());
    }

    #[tokio::test]
    async fn vigorous_movement_after_peak_is_rejected() {
        let frames = (0..50)
            .map(|i| {
                let z = match i {
                    20 => 3.0,
                    i if i > 20 => if i % 2 == 0 { 2.2 } else { 0.3 },
                    _ => 1.0,
                };
                SensorFrame::new([0.0, 0.0, z], [0.0; 3], i as f64)
            })
            .collect();
        let window = FeatureWindow::from_frames(frames).unwrap();

        let gate = ImpactGate::new(permissive(), FixedClassifier::new(0.99));
        assert!(matches!(
            gate.evaluate(&window).await,
            Verdict::NoAction { reason: Rejection::PostImpactActivity, .. }
        ));
    }

    #[tokio::test]
    async fn extreme_impact_overrides_model() {
        let gate = ImpactGate::new(permissive(), FixedClassifier::new(0.0));
        match gate.evaluate(&impact_window(1.6)).await {
            Verdict::PossibleFall(evidence) => {
                assert_eq!(evidence.rule, TriggerRule::ImpactOverride);
                assert_eq!(evidence.probability, 0.0);
            }
            other => panic!("expected fall, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn confident_model_triggers() {
        let gate = ImpactGate::new(permissive(), FixedClassifier::new(0.41));
        match gate.evaluate(&impact_window(1.25)).await {
            Verdict::PossibleFall(evidence) => assert_eq!(evidence.rule, TriggerRule::HighConfidence),
            other => panic!("expected fall, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn weak_model_plus_weak_impact_corroborate() {
        let gate = ImpactGate::new(permissive(), FixedClassifier::new(0.25));
        match gate.evaluate(&impact_window(1.4)).await {
            Verdict::PossibleFall(evidence) => assert_eq!(evidence.rule, TriggerRule::Corroborated),
            other => panic!("expected fall, got {other:?}"),
        }

        // Same model signal without the secondary impact stays quiet.
        let verdict = gate.evaluate(&impact_window(1.25)).await;
        assert!(matches!(
            verdict,
            Verdict::NoAction { reason: Rejection::Inconclusive, .. }
        ));
        assert_eq!(verdict.probability(), 0.25);
    }

    #[tokio::test]
    async fn failing_classifier_falls_back_to_override_only() {
        let gate = ImpactGate::new(permissive(), Arc::new(BrokenClassifier));
        assert!(!gate.evaluate(&impact_window(1.4)).await.is_possible_fall());
        assert!(gate.evaluate(&impact_window(2.0)).await.is_possible_fall());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_classifier_times_out_as_no_trigger() {
        let gate = ImpactGate::new(permissive(), Arc::new(StalledClassifier));
        let verdict = gate.evaluate(&impact_window(1.4)).await;
        assert!(matches!(
            verdict,
            Verdict::NoAction { reason: Rejection::Inconclusive, probability } if probability == 0.0
        ));
    }

    #[tokio::test]
    async fn default_sensitivity_leaves_only_the_override() {
        // At 50 the threshold is 17.8 m/s², already past the 1.6 g override.
        let gate = ImpactGate::new(GateConfig::default(), FixedClassifier::new(0.99));
        assert!(physical_threshold(DEFAULT_SENSITIVITY) > 1.6 * STANDARD_GRAVITY);

        match gate.evaluate(&impact_window(1.9)).await {
            Verdict::PossibleFall(evidence) => assert_eq!(evidence.rule, TriggerRule::ImpactOverride),
            other => panic!("expected fall, got {other:?}"),
        }
        assert!(matches!(
            gate.evaluate(&impact_window(1.55)).await,
            Verdict::NoAction { reason: Rejection::BelowPhysicalThreshold, .. }
        ));
    }
}

use crate::window::FeatureWindow;
use serde::Serialize;

/// Impact magnitude (g) below which the wearer is considered unsupported.
pub const FREE_FALL_FLOOR_G: f64 = 0.6;

/// Guards the tilt ratio against a zero magnitude.
const TILT_EPSILON: f64 = 1e-6;

/// Frames averaged for the resting tilt at the end of a window.
const TILT_TAIL_FRAMES: usize = 10;

/// Length of [`FeatureVector::model_input`].
pub const MODEL_FEATURES: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Stats {
    pub max: f64,
    pub mean: f64,
    pub std: f64,
}

impl Stats {
    fn of(series: &[f64]) -> Self {
        Self {
            max: max(series),
            mean: mean(series),
            std: sample_std(series),
        }
    }
}

/// Physical features derived from one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureVector {
    /// SVM, in g.
    pub impact: Stats,
    /// GVM, in the sensor's raw angular-rate unit.
    pub rotation: Stats,
    pub jerk: Stats,
    pub tilt: Stats,
    pub tilt_tail_mean: f64,
    pub free_fall_detected: bool,
    pub delta_tilt: f64,
    /// Index of the first frame reaching the peak impact.
    pub peak_index: usize,
}

impl FeatureVector {
    /// Fixed feature order the tree ensemble was trained on.
    pub fn model_input(&self) -> [f64; MODEL_FEATURES] {
        [
            self.impact.max,
            self.rotation.max,
            self.impact.mean,
            self.rotation.mean,
            self.impact.std,
            self.jerk.max,
            self.jerk.mean,
            self.tilt.mean,
            self.tilt.std,
            self.tilt_tail_mean,
            if self.free_fall_detected { 1.0 } else { 0.0 },
            self.delta_tilt,
        ]
    }
}

/// Pure and deterministic: the same window always yields the same vector.
#[derive(Debug, Default, Clone, Copy)]
pub struct FeatureExtractor;

impl FeatureExtractor {
    pub fn new() -> Self {
        Self
    }

    pub fn extract(&self, window: &FeatureWindow) -> FeatureVector {
        let impact = window.impact_series();
        let rotation: Vec<f64> = window
            .frames()
            .iter()
            .map(|f| f.rotation_magnitude())
            .collect();

        // First difference, with the leading frame contributing zero.
        let jerk: Vec<f64> = std::iter::once(0.0)
            .chain(impact.windows(2).map(|w| (w[1] - w[0]).abs()))
            .take(impact.len())
            .collect();

        let tilt: Vec<f64> = window
            .frames()
            .iter()
            .zip(&impact)
            .map(|(f, svm)| f.acc_z / (svm + TILT_EPSILON))
            .collect();

        let tail_start = tilt.len().saturating_sub(TILT_TAIL_FRAMES);
        let delta_tilt = match (tilt.first(), tilt.last()) {
            (Some(first), Some(last)) => (last - first).abs(),
            _ => 0.0,
        };

        FeatureVector {
            impact: Stats::of(&impact),
            rotation: Stats::of(&rotation),
            jerk: Stats::of(&jerk),
            tilt: Stats::of(&tilt),
            tilt_tail_mean: mean(&tilt[tail_start..]),
            free_fall_detected: impact.iter().any(|&svm| svm < FREE_FALL_FLOOR_G),
            delta_tilt,
            peak_index: peak_index(&impact),
        }
    }
}

// ========== statistics ==========

pub(crate) fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

/// Sample standard deviation (n - 1).
pub(crate) fn sample_std(data: &[f64]) -> f64 {
    if data.len() <= 1 {
        return 0.0;
    }
    let mean = mean(data);
    let variance =
        data.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (data.len() - 1) as f64;
    variance.sqrt()
}

fn max(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

fn peak_index(data: &[f64]) -> usize {
    let mut best = 0;
    for (i, &value) in data.iter().enumerate() {
        if value > data[best] {
            best = i;
        }
    }
    best
}

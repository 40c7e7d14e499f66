use crate::model::{FrameError, SensorFrame, STANDARD_GRAVITY};
use std::collections::VecDeque;
use thiserror::Error;

/// Mean impact magnitude above which a window is taken to be in m/s².
pub const UNIT_CROSSOVER: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelUnit {
    G,
    MetersPerSecondSquared,
}

#[derive(Debug, Error, PartialEq)]
pub enum WindowError {
    #[error("window is empty")]
    Empty,

    #[error("frame {index} is not later than its predecessor")]
    OutOfOrder { index: usize },
}

/// An immutable, time-ordered window whose acceleration is already in g.
///
/// Normalization happens exactly once, at construction, from the mean
/// impact magnitude of the whole window.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureWindow {
    frames: Vec<SensorFrame>,
    source_unit: AccelUnit,
}

impl FeatureWindow {
    pub fn from_frames(frames: Vec<SensorFrame>) -> Result<Self, WindowError> {
        if frames.is_empty() {
            return Err(WindowError::Empty);
        }
        if let Some(index) = frames
            .windows(2)
            .position(|pair| pair[1].time <= pair[0].time)
        {
            return Err(WindowError::OutOfOrder { index: index + 1 });
        }
        Ok(Self::normalized(frames))
    }

    fn normalized(frames: Vec<SensorFrame>) -> Self {
        let mean = frames.iter().map(SensorFrame::impact_magnitude).sum::<f64>()
            / frames.len() as f64;

        if mean > UNIT_CROSSOVER {
            Self {
                frames: frames
                    .iter()
                    .map(|f| f.scaled_acceleration(STANDARD_GRAVITY))
                    .collect(),
                source_unit: AccelUnit::MetersPerSecondSquared,
            }
        } else {
            Self {
                frames,
                source_unit: AccelUnit::G,
            }
        }
    }

    pub fn frames(&self) -> &[SensorFrame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Unit the raw input was detected in.
    pub fn source_unit(&self) -> AccelUnit {
        self.source_unit
    }

    /// Impact magnitude per frame, in g.
    pub fn impact_series(&self) -> Vec<f64> {
        self.frames.iter().map(SensorFrame::impact_magnitude).collect()
    }
}

/// Fixed-capacity sliding buffer of sensor frames.
pub struct WindowBuffer {
    frames: VecDeque<SensorFrame>,
    capacity: usize,
}

impl WindowBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a frame, evicting the oldest once full.
    pub fn push(&mut self, frame: SensorFrame) -> Result<(), FrameError> {
        if let Some(last) = self.frames.back() {
            if frame.time <= last.time {
                return Err(FrameError::OutOfOrder {
                    time: frame.time,
                    previous: last.time,
                });
            }
        }

        self.frames.push_back(frame);
        if self.frames.len() > self.capacity {
            self.frames.pop_front();
        }
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.frames.len() == self.capacity
    }

    /// Copy of the current window, only once the buffer is full.
    pub fn snapshot(&self) -> Option<FeatureWindow> {
        if !self.is_ready() {
            return None;
        }
        Some(FeatureWindow::normalized(self.frames.iter().copied().collect()))
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

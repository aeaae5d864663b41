use serde::Deserialize;

pub const MIN_LOOP_BEATS_FLOOR: usize = 4;
/// Upper bound for both beat-count tunables.
pub const MAX_LOOP_BEATS: usize = 4096;
pub const THRESHOLD_MIN: f64 = 0.05;
pub const THRESHOLD_MAX: f64 = 0.99;

/// Which server candidates are eligible as jump edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeDirection {
    /// Circular timeline: forward and backward jumps.
    #[default]
    Bidirectional,
    /// Only jumps to an earlier beat.
    BackwardOnly,
}

/// Loop-selection tunables shared by the graph builder and the jukebox driver.
///
/// Fields are public for configuration; the setters below are the clamped
/// path used at runtime.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoopSettings {
    pub min_loop_beats: usize,
    pub max_sequential_beats: usize,
    pub loop_threshold: f64,
    pub section_bias: f64,
    pub jump_variance: f64,
    pub direction: EdgeDirection,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            min_loop_beats: 12,
            max_sequential_beats: 36,
            loop_threshold: 0.55,
            section_bias: 0.6,
            jump_variance: 0.4,
            direction: EdgeDirection::Bidirectional,
        }
    }
}

/// Clamp to `[0, 1]`, mapping NaN to the lower bound.
fn clamp01(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}

impl LoopSettings {
    /// Bring values loaded from config into their valid ranges.
    pub fn sanitized(mut self) -> Self {
        self.min_loop_beats = self.min_loop_beats.clamp(MIN_LOOP_BEATS_FLOOR, MAX_LOOP_BEATS);
        self.max_sequential_beats = self
            .max_sequential_beats
            .clamp(self.min_loop_beats + 2, MAX_LOOP_BEATS + 2);
        self.loop_threshold = if self.loop_threshold.is_nan() {
            Self::default().loop_threshold
        } else {
            self.loop_threshold.clamp(THRESHOLD_MIN, THRESHOLD_MAX)
        };
        self.section_bias = clamp01(self.section_bias);
        self.jump_variance = clamp01(self.jump_variance);
        self
    }

    /// Returns true when the stored value changed. Raises
    /// `max_sequential_beats` if it would no longer exceed the new minimum.
    pub fn set_min_loop_beats(&mut self, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        let beats = value
            .round()
            .clamp(MIN_LOOP_BEATS_FLOOR as f64, MAX_LOOP_BEATS as f64) as usize;
        if beats == self.min_loop_beats {
            return false;
        }
        self.min_loop_beats = beats;
        if self.max_sequential_beats <= beats {
            self.max_sequential_beats = beats.saturating_add(2);
        }
        true
    }

    pub fn set_max_sequential_beats(&mut self, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        let floor = self.min_loop_beats.saturating_add(2) as f64;
        let beats = value.round().min((MAX_LOOP_BEATS + 2) as f64).max(floor) as usize;
        if beats == self.max_sequential_beats {
            return false;
        }
        self.max_sequential_beats = beats;
        true
    }

    pub fn set_loop_threshold(&mut self, value: f64) -> bool {
        if value.is_nan() {
            return false;
        }
        let threshold = value.clamp(THRESHOLD_MIN, THRESHOLD_MAX);
        if threshold == self.loop_threshold {
            return false;
        }
        self.loop_threshold = threshold;
        true
    }

    pub fn set_section_bias(&mut self, value: f64) -> bool {
        if value.is_nan() {
            return false;
        }
        let bias = value.clamp(0.0, 1.0);
        if bias == self.section_bias {
            return false;
        }
        self.section_bias = bias;
        true
    }

    pub fn set_jump_variance(&mut self, value: f64) -> bool {
        if value.is_nan() {
            return false;
        }
        let variance = value.clamp(0.0, 1.0);
        if variance == self.jump_variance {
            return false;
        }
        self.jump_variance = variance;
        true
    }
}

/// A partial update; only `Some` fields are applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopSettingsPatch {
    pub min_loop_beats: Option<f64>,
    pub max_sequential_beats: Option<f64>,
    pub loop_threshold: Option<f64>,
    pub section_bias: Option<f64>,
    pub jump_variance: Option<f64>,
}

/// What a patch requires of the graph owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchEffect {
    Rebuild,
    Reschedule,
    /// Nothing changed; callers rebuild anyway.
    Unchanged,
}

impl LoopSettingsPatch {
    pub fn is_empty(&self) -> bool {
        self.min_loop_beats.is_none()
            && self.max_sequential_beats.is_none()
            && self.loop_threshold.is_none()
            && self.section_bias.is_none()
            && self.jump_variance.is_none()
    }

    /// Apply the patch field by field and report the strongest effect.
    pub fn apply(&self, settings: &mut LoopSettings) -> PatchEffect {
        let mut rebuild = false;
        let mut reschedule = false;
        if let Some(v) = self.min_loop_beats {
            rebuild |= settings.set_min_loop_beats(v);
        }
        if let Some(v) = self.max_sequential_beats {
            reschedule |= settings.set_max_sequential_beats(v);
        }
        if let Some(v) = self.loop_threshold {
            rebuild |= settings.set_loop_threshold(v);
        }
        if let Some(v) = self.section_bias {
            reschedule |= settings.set_section_bias(v);
        }
        if let Some(v) = self.jump_variance {
            reschedule |= settings.set_jump_variance(v);
        }
        if rebuild {
            PatchEffect::Rebuild
        } else if reschedule {
            PatchEffect::Reschedule
        } else {
            PatchEffect::Unchanged
        }
    }
}

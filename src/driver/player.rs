use thiserror::Error;

/// Failures surfaced by an audio backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlayerError {
    #[error("Audio output unavailable: {0}")]
    Unavailable(String),
    #[error("Audio device error: {0}")]
    Device(String),
}

/// Overlay voice attached to a beat.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayCue {
    pub index: usize,
    pub start: f64,
    pub duration: f64,
    pub gain: f64,
}

/// Everything a player needs to render one beat.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeatCue {
    pub index: usize,
    pub start: f64,
    pub duration: f64,
    pub volume: f64,
    pub master_gain: f64,
    pub overlay: Option<OverlayCue>,
}

/// The audio engine seam.
pub trait AudioPlayer {
    /// Render `cue` and return the seconds until the next beat should start.
    /// Must be deterministic for a given cue.
    fn play_beat(&mut self, cue: &BeatCue) -> Result<f64, PlayerError>;
    fn stop(&mut self);
    fn pause(&mut self);
    fn set_speed_factor(&mut self, factor: f64);
}

/// Player that renders nothing and holds each beat for its duration,
/// scaled by the speed factor.
#[derive(Debug, Clone)]
pub struct SilentPlayer {
    speed: f64,
    beats_played: u64,
    sounding: bool,
}

impl Default for SilentPlayer {
    fn default() -> Self {
        Self {
            speed: 1.0,
            beats_played: 0,
            sounding: false,
        }
    }
}

impl SilentPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn beats_played(&self) -> u64 {
        self.beats_played
    }

    pub fn is_sounding(&self) -> bool {
        self.sounding
    }

    pub fn speed_factor(&self) -> f64 {
        self.speed
    }
}

impl AudioPlayer for SilentPlayer {
    fn play_beat(&mut self, cue: &BeatCue) -> Result<f64, PlayerError> {
        self.beats_played += 1;
        self.sounding = true;
        Ok(cue.duration / self.speed)
    }

    fn stop(&mut self) {
        self.sounding = false;
    }

    fn pause(&mut self) {
        self.sounding = false;
    }

    fn set_speed_factor(&mut self, factor: f64) {
        if factor.is_finite() && factor > 0.0 {
            self.speed = factor;
        }
    }
}

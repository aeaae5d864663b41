//! Beat-by-beat playback drivers.
//!
//! A driver plays one beat, asks the player how long it holds, and arms a
//! continuation for the next beat. Callers drive time: [`PlaybackDriver::tick`]
//! fires the continuation once it is due.

pub mod canon;
pub mod continuation;
pub mod jukebox;
pub mod player;

use std::sync::Arc;

use thiserror::Error;

use crate::analysis::Track;
use crate::canon::CanonMapping;
use crate::neighbors::NeighborTable;

pub use canon::CanonDriver;
pub use continuation::{Continuation, Scheduled, Token};
pub use jukebox::JukeboxDriver;
pub use player::{AudioPlayer, BeatCue, OverlayCue, PlayerError, SilentPlayer};

#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("Playback halted on beat {beat}: {source}")]
    Player {
        beat: usize,
        #[source]
        source: PlayerError,
    },
}

pub type Result<T> = std::result::Result<T, PlaybackError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Running,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpReason {
    /// The jump countdown expired and a graph edge was chosen.
    Scheduled,
    /// Forced return from the end zone to the retreat target.
    Retreat,
    /// The walk ran off the end of the track.
    Reentry,
}

/// How the driver moves on after a beat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Sequential,
    Jump { reason: JumpReason },
    /// End of a linear track with auto-continue set; the session takes over.
    Handoff,
    /// End of a linear track; the driver stops once the beat has sounded.
    Finished,
}

/// One played beat.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub index: usize,
    pub overlay: Option<OverlayCue>,
    /// Time the beat started.
    pub at: f64,
    /// Seconds until the next beat.
    pub delay: f64,
    /// Beat that plays next, if any.
    pub next: Option<usize>,
    pub transition: Transition,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlaybackStats {
    pub beats_played: u64,
    pub listen_time: f64,
}

/// Shared, immutable inputs of a driver. Each field is replaced whole.
#[derive(Debug, Clone)]
pub struct DriverContext {
    pub track: Arc<Track>,
    pub neighbors: Arc<NeighborTable>,
    pub mapping: Arc<CanonMapping>,
    pub master_gain: f64,
}

impl DriverContext {
    /// Build the cue for `index`; the overlay is omitted when silent.
    pub fn cue(&self, index: usize) -> Option<BeatCue> {
        let beat = self.track.beats.get(index)?;
        let overlay = self.mapping.get(index).and_then(|pair| {
            if pair.gain <= 0.0 || pair.other == index {
                return None;
            }
            let other = self.track.beats.get(pair.other)?;
            Some(OverlayCue {
                index: other.which,
                start: other.start,
                duration: other.duration,
                gain: pair.gain,
            })
        });
        Some(BeatCue {
            index,
            start: beat.start,
            duration: beat.duration,
            volume: beat.median_volume,
            master_gain: self.master_gain,
            overlay,
        })
    }
}

/// Play `index` and return the cue and the delay until the next beat.
/// A non-positive or NaN delay falls back to the beat duration.
pub(crate) fn play_cue<P: AudioPlayer>(
    player: &mut P,
    ctx: &DriverContext,
    index: usize,
) -> Result<Option<(BeatCue, f64)>> {
    let Some(cue) = ctx.cue(index) else {
        return Ok(None);
    };
    let delay = player
        .play_beat(&cue)
        .map_err(|source| PlaybackError::Player { beat: index, source })?;
    let delay = if delay.is_nan() || delay <= 0.0 {
        cue.duration
    } else {
        delay
    };
    Ok(Some((cue, delay)))
}

/// Behavior shared by every driver.
pub trait PlaybackDriver {
    type Player: AudioPlayer;

    /// Reset to the start index and play the first beat.
    fn start(&mut self, now: f64) -> Result<Option<Step>>;
    /// Continue from the current position; starts when stopped.
    fn resume(&mut self, now: f64) -> Result<Option<Step>>;
    fn pause(&mut self);
    fn stop(&mut self);
    fn state(&self) -> PlaybackState;
    fn set_next(&mut self, index: usize);
    /// Fire the continuation identified by `token`. Stale tokens do nothing.
    fn fire(&mut self, token: Token) -> Result<Option<Step>>;
    fn next_due(&self) -> Option<Scheduled>;
    fn current_index(&self) -> usize;
    fn stats(&self) -> PlaybackStats;
    fn player(&self) -> &Self::Player;
    fn player_mut(&mut self) -> &mut Self::Player;
    fn set_mapping(&mut self, mapping: Arc<CanonMapping>);

    fn is_running(&self) -> bool {
        self.state() == PlaybackState::Running
    }

    /// Fire the pending continuation if it is due at `now`.
    fn tick(&mut self, now: f64) -> Result<Option<Step>> {
        match self.next_due() {
            Some(s) if s.due <= now => self.fire(s.token),
            _ => Ok(None),
        }
    }
}

/// The driver for the current mode.
pub enum Driver<P: AudioPlayer> {
    Canon(CanonDriver<P>),
    Jukebox(JukeboxDriver<P>),
}

impl<P: AudioPlayer> Driver<P> {
    /// Tear the driver down, returning its player.
    pub fn into_player(self) -> P {
        match self {
            Driver::Canon(d) => d.into_player(),
            Driver::Jukebox(d) => d.into_player(),
        }
    }

    pub fn as_jukebox_mut(&mut self) -> Option<&mut JukeboxDriver<P>> {
        match self {
            Driver::Jukebox(d) => Some(d),
            Driver::Canon(_) => None,
        }
    }

    pub fn as_jukebox(&self) -> Option<&JukeboxDriver<P>> {
        match self {
            Driver::Jukebox(d) => Some(d),
            Driver::Canon(_) => None,
        }
    }
}

impl<P: AudioPlayer> PlaybackDriver for Driver<P> {
    type Player = P;

    fn start(&mut self, now: f64) -> Result<Option<Step>> {
        match self {
            Driver::Canon(d) => d.start(now),
            Driver::Jukebox(d) => d.start(now),
        }
    }

    fn resume(&mut self, now: f64) -> Result<Option<Step>> {
        match self {
            Driver::Canon(d) => d.resume(now),
            Driver::Jukebox(d) => d.resume(now),
        }
    }

    fn pause(&mut self) {
        match self {
            Driver::Canon(d) => d.pause(),
            Driver::Jukebox(d) => d.pause(),
        }
    }

    fn stop(&mut self) {
        match self {
            Driver::Canon(d) => d.stop(),
            Driver::Jukebox(d) => d.stop(),
        }
    }

    fn state(&self) -> PlaybackState {
        match self {
            Driver::Canon(d) => d.state(),
            Driver::Jukebox(d) => d.state(),
        }
    }

    fn set_next(&mut self, index: usize) {
        match self {
            Driver::Canon(d) => d.set_next(index),
            Driver::Jukebox(d) => d.set_next(index),
        }
    }

    fn fire(&mut self, token: Token) -> Result<Option<Step>> {
        match self {
            Driver::Canon(d) => d.fire(token),
            Driver::Jukebox(d) => d.fire(token),
        }
    }

    fn next_due(&self) -> Option<Scheduled> {
        match self {
            Driver::Canon(d) => d.next_due(),
            Driver::Jukebox(d) => d.next_due(),
        }
    }

    fn current_index(&self) -> usize {
        match self {
            Driver::Canon(d) => d.current_index(),
            Driver::Jukebox(d) => d.current_index(),
        }
    }

    fn stats(&self) -> PlaybackStats {
        match self {
            Driver::Canon(d) => d.stats(),
            Driver::Jukebox(d) => d.stats(),
        }
    }

    fn player(&self) -> &P {
        match self {
            Driver::Canon(d) => d.player(),
            Driver::Jukebox(d) => d.player(),
        }
    }

    fn player_mut(&mut self) -> &mut P {
        match self {
            Driver::Canon(d) => d.player_mut(),
            Driver::Jukebox(d) => d.player_mut(),
        }
    }

    fn set_mapping(&mut self, mapping: Arc<CanonMapping>) {
        match self {
            Driver::Canon(d) => d.set_mapping(mapping),
            Driver::Jukebox(d) => d.set_mapping(mapping),
        }
    }
}

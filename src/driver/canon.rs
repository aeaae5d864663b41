use std::sync::Arc;

use super::{
    AudioPlayer, Continuation, DriverContext, PlaybackDriver, PlaybackState, PlaybackStats, Result,
    Scheduled, Step, Token, Transition, play_cue,
};
use crate::canon::CanonMapping;

/// Latest time a recommended start may lie at: `min(45 s, 25% of the track)`.
const MAX_START_SECONDS: f64 = 45.0;
const MAX_START_FRACTION: f64 = 0.25;

/// Linear traversal with the overlay pairing fixed per beat.
pub struct CanonDriver<P: AudioPlayer> {
    player: P,
    ctx: DriverContext,
    cursor: usize,
    state: PlaybackState,
    continuation: Continuation,
    auto_continue: bool,
    stats: PlaybackStats,
}

impl<P: AudioPlayer> CanonDriver<P> {
    pub fn new(player: P, ctx: DriverContext) -> Self {
        Self {
            player,
            ctx,
            cursor: 0,
            state: PlaybackState::Stopped,
            continuation: Continuation::default(),
            auto_continue: false,
            stats: PlaybackStats::default(),
        }
    }

    /// When set, the end of the track hands off instead of stopping.
    pub fn set_auto_continue(&mut self, enabled: bool) {
        self.auto_continue = enabled;
    }

    pub fn into_player(self) -> P {
        self.player
    }

    /// Where playback begins: a recommended start near the top of the
    /// track, else the first well-paired downbeat of section 0, else the
    /// first downbeat of section 0, else beat 0.
    pub fn start_index(&self) -> usize {
        let track = &self.ctx.track;
        let max_start = MAX_START_SECONDS.min(track.duration * MAX_START_FRACTION);

        if let Some(alignment) = &track.canon_alignment {
            if let Some(si) = alignment
                .start_index
                .and_then(|si| usize::try_from(si).ok())
                .filter(|&si| si < track.len())
            {
                if si > 0 && track.beats[si].start <= max_start {
                    return si;
                }
            }

            let threshold = alignment.threshold();
            let paired = track.beats.iter().find(|b| {
                b.section == 0
                    && b.index_in_parent == Some(0)
                    && b.start <= max_start
                    && alignment
                        .pair_similarity
                        .get(b.which)
                        .is_none_or(|s| s.is_some_and(|s| s >= threshold))
            });
            if let Some(beat) = paired {
                if beat.which > 0 {
                    return beat.which;
                }
            }
        }

        track
            .beats
            .iter()
            .find(|b| b.section == 0 && b.index_in_parent == Some(0))
            .map(|b| b.which)
            .unwrap_or(0)
    }

    fn process(&mut self, now: f64) -> Result<Option<Step>> {
        if self.state != PlaybackState::Running {
            return Ok(None);
        }
        let n = self.ctx.track.len();
        if self.cursor >= n {
            if self.auto_continue {
                // Leave the last beat sounding; the session starts the next track.
                self.state = PlaybackState::Stopped;
                self.continuation.cancel();
            } else {
                self.stop();
            }
            return Ok(None);
        }

        let index = self.cursor;
        let played = match play_cue(&mut self.player, &self.ctx, index) {
            Ok(played) => played,
            Err(e) => {
                log::error!("{}", e);
                self.stop();
                return Err(e);
            }
        };
        let Some((cue, delay)) = played else {
            log::warn!("No beat {} in the loaded track, stopping", index);
            self.stop();
            return Ok(None);
        };

        self.stats.beats_played += 1;
        self.stats.listen_time += delay;
        self.cursor = index + 1;

        let (next, transition) = if self.cursor < n {
            (Some(self.cursor), Transition::Sequential)
        } else if self.auto_continue {
            (None, Transition::Handoff)
        } else {
            (None, Transition::Finished)
        };
        self.continuation.arm(now + delay);

        Ok(Some(Step {
            index,
            overlay: cue.overlay,
            at: now,
            delay,
            next,
            transition,
        }))
    }
}

impl<P: AudioPlayer> PlaybackDriver for CanonDriver<P> {
    type Player = P;

    fn start(&mut self, now: f64) -> Result<Option<Step>> {
        self.continuation.cancel();
        self.cursor = self.start_index();
        self.stats = PlaybackStats::default();
        self.state = PlaybackState::Running;
        log::info!("Canon playback starting at beat {}", self.cursor);
        self.process(now)
    }

    fn resume(&mut self, now: f64) -> Result<Option<Step>> {
        match self.state {
            PlaybackState::Stopped => self.start(now),
            PlaybackState::Running => Ok(None),
            PlaybackState::Paused => {
                self.state = PlaybackState::Running;
                self.process(now)
            }
        }
    }

    fn pause(&mut self) {
        if self.state != PlaybackState::Running {
            return;
        }
        self.continuation.cancel();
        self.state = PlaybackState::Paused;
        self.player.pause();
    }

    fn stop(&mut self) {
        self.continuation.cancel();
        self.state = PlaybackState::Stopped;
        self.player.stop();
    }

    fn state(&self) -> PlaybackState {
        self.state
    }

    fn set_next(&mut self, index: usize) {
        let last = self.ctx.track.len().saturating_sub(1);
        self.cursor = index.min(last);
    }

    fn fire(&mut self, token: Token) -> Result<Option<Step>> {
        match self.continuation.claim(token) {
            Some(due) => self.process(due),
            None => Ok(None),
        }
    }

    fn next_due(&self) -> Option<Scheduled> {
        self.continuation.pending()
    }

    fn current_index(&self) -> usize {
        self.cursor
    }

    fn stats(&self) -> PlaybackStats {
        self.stats
    }

    fn player(&self) -> &P {
        &self.player
    }

    fn player_mut(&mut self) -> &mut P {
        &mut self.player
    }

    fn set_mapping(&mut self, mapping: Arc<CanonMapping>) {
        self.ctx.mapping = mapping;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{CanonAlignment, Track};
    use crate::driver::test_support::*;
    use crate::driver::{PlaybackError, SilentPlayer};
    use crate::testutil;

    fn run_to_end(driver: &mut CanonDriver<SilentPlayer>) -> Vec<Step> {
        let mut steps = Vec::new();
        if let Some(step) = driver.start(0.0).unwrap() {
            steps.push(step);
        }
        while let Some(s) = driver.next_due() {
            if let Some(step) = driver.tick(s.due).unwrap() {
                steps.push(step);
            }
        }
        steps
    }

    #[test]
    fn test_linear_to_finish() {
        let mut driver = CanonDriver::new(SilentPlayer::new(), sectioned_context(12, 1));
        let steps = run_to_end(&mut driver);
        let indices: Vec<usize> = steps.iter().map(|s| s.index).collect();
        assert_eq!(indices, (0..12).collect::<Vec<_>>());
        assert_eq!(steps.last().unwrap().transition, Transition::Finished);
        assert_eq!(driver.state(), PlaybackState::Stopped);
        assert!(!driver.player().is_sounding());
        assert_eq!(driver.stats().beats_played, 12);
        assert!((driver.stats().listen_time - 6.0).abs() < 1e-9);
        // Steps are back to back.
        assert!(steps.windows(2).all(|w| (w[0].at + w[0].delay - w[1].at).abs() < 1e-9));
    }

    #[test]
    fn test_auto_continue_hands_off() {
        let mut driver = CanonDriver::new(SilentPlayer::new(), sectioned_context(8, 1));
        driver.set_auto_continue(true);
        let steps = run_to_end(&mut driver);
        assert_eq!(steps.last().unwrap().transition, Transition::Handoff);
        assert_eq!(driver.state(), PlaybackState::Stopped);
        assert!(driver.player().is_sounding());
    }

    #[test]
    fn test_pause_cancels_and_resume_continues() {
        let mut driver = CanonDriver::new(SilentPlayer::new(), sectioned_context(12, 1));
        driver.start(0.0).unwrap();
        let stale = driver.next_due().unwrap();
        driver.tick(stale.due).unwrap();
        let pending = driver.next_due().unwrap();
        driver.pause();
        assert!(driver.next_due().is_none());
        assert!(driver.fire(pending.token).unwrap().is_none());
        assert_eq!(driver.current_index(), 2);

        let step = driver.resume(5.0).unwrap().unwrap();
        assert_eq!(step.index, 2);
        // The token from before the pause stays dead.
        assert!(driver.fire(pending.token).unwrap().is_none());
        assert_eq!(driver.player().beats_played(), 3);
    }

    #[test]
    fn test_stop_prevents_resurrection() {
        let mut driver = CanonDriver::new(SilentPlayer::new(), sectioned_context(12, 1));
        driver.start(0.0).unwrap();
        let pending = driver.next_due().unwrap();
        driver.stop();
        assert!(driver.fire(pending.token).unwrap().is_none());
        assert!(driver.tick(100.0).unwrap().is_none());
        assert_eq!(driver.state(), PlaybackState::Stopped);
    }

    #[test]
    fn test_player_error_halts() {
        let player = FailingPlayer {
            fail_on: 3,
            stopped: false,
        };
        let mut driver = CanonDriver::new(player, sectioned_context(12, 1));
        driver.start(0.0).unwrap();
        let mut err = None;
        while let Some(s) = driver.next_due() {
            if let Err(e) = driver.tick(s.due) {
                err = Some(e);
                break;
            }
        }
        assert!(matches!(err, Some(PlaybackError::Player { beat: 3, .. })));
        assert_eq!(driver.state(), PlaybackState::Stopped);
        assert!(driver.player().stopped);
        assert!(driver.next_due().is_none());
    }

    #[test]
    fn test_start_index_preferences() {
        // 120 beats of 0.5 s: 60 s track, max start = min(45, 15) = 15 s (beat 30).
        let mut payload = testutil::sectioned_payload(120, 2);
        payload.canon_alignment = Some(CanonAlignment {
            start_index: Some(20),
            ..Default::default()
        });
        let track = Track::from_payload(payload, None, None).unwrap();
        let driver = CanonDriver::new(SilentPlayer::new(), context(track, 0.55));
        assert_eq!(driver.start_index(), 20);

        // Too deep: fall to the first downbeat whose pairing is strong enough.
        let mut payload = testutil::sectioned_payload(120, 2);
        let mut sims = vec![Some(0.1); 120];
        sims[8] = Some(0.9);
        payload.canon_alignment = Some(CanonAlignment {
            start_index: Some(80),
            pair_similarity: sims,
            similarity_threshold: Some(0.5),
            ..Default::default()
        });
        let track = Track::from_payload(payload, None, None).unwrap();
        let driver = CanonDriver::new(SilentPlayer::new(), context(track, 0.55));
        assert_eq!(driver.start_index(), 8);

        // No alignment: first downbeat of section 0.
        let mut payload = testutil::sectioned_payload(20, 1);
        payload.bars[0].start = 0.5;
        payload.bars[0].duration = 1.5;
        let track = Track::from_payload(payload, None, None).unwrap();
        let driver = CanonDriver::new(SilentPlayer::new(), context(track, 0.55));
        assert_eq!(driver.start_index(), 1);
    }
}

//! Probabilistic walk over the loop graph.
//!
//! The walk plays sequentially and, whenever the jump countdown expires,
//! picks a weighted-random edge from the current neighborhood. Near the end
//! of the track a precomputed retreat edge pulls it back to the beginning,
//! and running off the end re-enters through [`JukeboxDriver::fallback_reentry_target`].

use std::collections::VecDeque;
use std::sync::Arc;

use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use rand_chacha::ChaCha8Rng;

use super::{
    AudioPlayer, Continuation, DriverContext, JumpReason, PlaybackDriver, PlaybackState,
    PlaybackStats, Result, Scheduled, Step, Token, Transition, play_cue,
};
use crate::canon::CanonMapping;
use crate::graph::{LoopGraph, LoopSettings, LoopSettingsPatch, PatchEffect};

const LOOP_HISTORY_LIMIT: usize = 8;
const BUBBLE_HISTORY_LIMIT: usize = 24;
const RECENT_SECTION_LIMIT: usize = 12;
/// Jumps checked by the anti-ping-pong filter.
const PING_PONG_LOOKBACK: usize = 3;
const RECENT_SECTION_DEPTH: usize = 4;
const MAX_SEARCH_RADIUS: usize = 8;

const END_ZONE_FRAC: f64 = 0.8;
const START_ZONE_FRAC: f64 = 0.3;
const END_ZONE_ESCAPE_BOOST: f64 = 2.5;
const END_ZONE_STAY_PENALTY: f64 = 0.3;
/// Beats before the retreat source at which a retreat may fire early.
const RETREAT_LEAD: usize = 4;

const WEIGHT_FLOOR: f64 = 0.05;
const HOP_PENALTY: f64 = 0.02;

/// Weight terms derived from the section bias and jump variance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightParams {
    pub same_section_bonus: f64,
    pub cross_section_bonus: f64,
    pub recent_penalty_scale: f64,
    pub jitter_strength: f64,
    pub span_scale: f64,
}

impl WeightParams {
    pub fn from_settings(settings: &LoopSettings) -> Self {
        let bias = settings.section_bias;
        let variance = settings.jump_variance;
        Self {
            same_section_bonus: 0.08 + bias * 0.42,
            cross_section_bonus: 0.08 + (1.0 - bias) * 0.28,
            recent_penalty_scale: (1.0 - bias) * 0.18,
            jitter_strength: variance * 0.3,
            span_scale: 1.0 + (1.0 - variance) * 0.8,
        }
    }
}

/// An edge gathered from the neighborhood of the current beat.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JumpCandidate {
    pub source: usize,
    pub target: usize,
    pub similarity: f64,
    pub span: usize,
    pub same_section: bool,
    /// Beats between the edge source and the current beat.
    pub hops: usize,
}

pub struct JukeboxDriver<P: AudioPlayer> {
    player: P,
    ctx: DriverContext,
    settings: LoopSettings,
    graph: Arc<LoopGraph>,
    current: usize,
    state: PlaybackState,
    continuation: Continuation,
    beats_until_jump: usize,
    loop_history: VecDeque<(usize, usize)>,
    /// `(center, radius)` of recent jump targets.
    bubble_history: VecDeque<(usize, usize)>,
    recent_sections: VecDeque<usize>,
    bubble_radius: usize,
    rng: ChaCha8Rng,
    stats: PlaybackStats,
}

impl<P: AudioPlayer> JukeboxDriver<P> {
    pub fn new(player: P, ctx: DriverContext, settings: LoopSettings, rng: ChaCha8Rng) -> Self {
        let settings = settings.sanitized();
        let graph = Arc::new(LoopGraph::build(&ctx.track, &ctx.neighbors, &settings));
        let mut driver = Self {
            player,
            ctx,
            settings,
            graph,
            current: 0,
            state: PlaybackState::Stopped,
            continuation: Continuation::default(),
            beats_until_jump: 0,
            loop_history: VecDeque::new(),
            bubble_history: VecDeque::new(),
            recent_sections: VecDeque::new(),
            bubble_radius: 0,
            rng,
            stats: PlaybackStats::default(),
        };
        driver.schedule_next_jump(true);
        driver
    }

    pub fn into_player(self) -> P {
        self.player
    }

    pub fn graph(&self) -> &Arc<LoopGraph> {
        &self.graph
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    pub fn beats_until_jump(&self) -> usize {
        self.beats_until_jump
    }

    /// Anti-repetition radius around recent jump targets; 0 disables it.
    pub fn set_bubble_radius(&mut self, radius: usize) {
        self.bubble_radius = radius;
    }

    pub fn set_min_loop_beats(&mut self, value: f64) {
        if self.settings.set_min_loop_beats(value) {
            self.rebuild_loop_graph();
        }
    }

    pub fn set_max_sequential_beats(&mut self, value: f64) {
        if self.settings.set_max_sequential_beats(value) {
            self.schedule_next_jump(true);
        }
    }

    pub fn set_loop_similarity_threshold(&mut self, value: f64) {
        if self.settings.set_loop_threshold(value) {
            self.rebuild_loop_graph();
        }
    }

    pub fn set_loop_section_bias(&mut self, value: f64) {
        if self.settings.set_section_bias(value) {
            log::debug!("Section bias now {:.2}", self.settings.section_bias);
            self.schedule_next_jump(true);
        }
    }

    pub fn set_loop_jump_variance(&mut self, value: f64) {
        if self.settings.set_jump_variance(value) {
            log::debug!("Jump variance now {:.2}", self.settings.jump_variance);
            self.schedule_next_jump(true);
        }
    }

    /// Apply the changed fields of `patch` with a single rebuild or
    /// reschedule. An empty or no-op patch rebuilds.
    pub fn recompute_loop_graph(&mut self, patch: &LoopSettingsPatch) {
        match patch.apply(&mut self.settings) {
            PatchEffect::Reschedule => self.schedule_next_jump(true),
            PatchEffect::Rebuild | PatchEffect::Unchanged => self.rebuild_loop_graph(),
        }
    }

    /// Replace the graph with one built from the current settings and reset
    /// the walk's memory.
    pub fn rebuild_loop_graph(&mut self) {
        self.graph = Arc::new(LoopGraph::build(
            &self.ctx.track,
            &self.ctx.neighbors,
            &self.settings,
        ));
        self.loop_history.clear();
        self.bubble_history.clear();
        self.recent_sections.clear();
        self.schedule_next_jump(true);
    }

    /// Draw the next jump countdown. `force` narrows the range toward
    /// `min_loop_beats`, used after jumps and rebuilds.
    pub fn schedule_next_jump(&mut self, force: bool) {
        let (lower, upper) = self.jump_countdown_range(force);
        self.beats_until_jump = self.rng.gen_range(lower..=upper);
    }

    /// Inclusive countdown range, always within
    /// `[min_loop_beats, max_sequential_beats]`.
    pub fn jump_countdown_range(&self, force: bool) -> (usize, usize) {
        let min_b = self.settings.min_loop_beats;
        let max_b = self.settings.max_sequential_beats.max(min_b + 1);
        let span = (max_b - min_b).max(2) as f64;
        let bias = self.settings.jump_variance;
        let (upper_frac, lower_frac) = if force {
            (0.3 + bias * 0.3, bias * 0.1)
        } else {
            (0.55 + bias * 0.4, bias * 0.3)
        };
        let upper = (min_b + (span * upper_frac).round() as usize)
            .min(max_b)
            .max(min_b + 1);
        let mut lower = (min_b + (span * lower_frac).round() as usize)
            .min(upper - 1)
            .max(min_b);
        if lower >= upper {
            lower = (upper - 1).max(min_b);
        }
        if lower >= upper {
            lower = min_b;
        }
        (lower, upper)
    }

    /// Edges leaving `src` and its neighborhood of `min(8, min_loop/2)`
    /// beats, own beat first.
    pub fn gather_candidates(&self, src: usize) -> Vec<JumpCandidate> {
        let n = self.graph.num_beats();
        let radius = MAX_SEARCH_RADIUS.min(self.settings.min_loop_beats / 2);
        let mut out = Vec::new();
        for hops in 0..=radius {
            let mut probes = vec![src.checked_add(hops)];
            if hops > 0 {
                probes.push(src.checked_sub(hops));
            }
            for probe in probes.into_iter().flatten().filter(|&p| p < n) {
                out.extend(self.graph.edges_from(probe).iter().map(|e| JumpCandidate {
                    source: probe,
                    target: e.target,
                    similarity: e.similarity,
                    span: e.span,
                    same_section: e.same_section,
                    hops,
                }));
            }
        }
        out
    }

    /// Candidates after the advisory anti-ping-pong and jump-bubble filters.
    pub fn filtered_candidates(&self, src: usize) -> Vec<JumpCandidate> {
        let candidates = self.gather_candidates(src);
        if candidates.is_empty() {
            return candidates;
        }

        let recent: Vec<(usize, usize)> = self
            .loop_history
            .iter()
            .rev()
            .take(PING_PONG_LOOKBACK)
            .copied()
            .collect();
        let mut filtered: Vec<JumpCandidate> = candidates
            .iter()
            .filter(|c| {
                !recent.iter().any(|&(s, t)| {
                    (s == c.source && t == c.target) || (s == c.target && t == c.source)
                })
            })
            .copied()
            .collect();
        if filtered.is_empty() {
            filtered = candidates;
        }

        if self.bubble_radius > 0 && !self.bubble_history.is_empty() {
            let outside: Vec<JumpCandidate> = filtered
                .iter()
                .filter(|c| !self.within_bubble(c.target))
                .copied()
                .collect();
            if !outside.is_empty() {
                filtered = outside;
            }
        }
        filtered
    }

    fn within_bubble(&self, target: usize) -> bool {
        let n = self.graph.num_beats().max(1);
        self.bubble_history.iter().rev().any(|&(center, radius)| {
            let radius = radius.max(self.bubble_radius);
            let diff = center.abs_diff(target);
            radius > 0 && diff.min(n - diff.min(n)) <= radius
        })
    }

    /// Deterministic weight of one candidate (no jitter, no floor).
    pub fn base_weight(&self, src: usize, c: &JumpCandidate) -> f64 {
        let n = self.graph.num_beats();
        let params = WeightParams::from_settings(&self.settings);
        let end_zone = (n as f64 * END_ZONE_FRAC).floor() as usize;
        let start_zone = (n as f64 * START_ZONE_FRAC).floor() as usize;
        let in_end_zone = src >= end_zone;

        let sim_norm = ((c.similarity + 1.0) / 2.0).clamp(0.0, 1.0);
        let span_norm = (c.span as f64 / (self.settings.min_loop_beats as f64 * params.span_scale))
            .clamp(0.2, 1.0);
        let section_bonus = if c.same_section {
            params.same_section_bonus
        } else {
            params.cross_section_bonus
        };
        let mut weight = 0.22 + sim_norm * 0.5 + span_norm * 0.25 + section_bonus;
        weight -= c.hops as f64 * HOP_PENALTY;

        if in_end_zone && c.target < start_zone {
            weight *= END_ZONE_ESCAPE_BOOST;
        }
        if in_end_zone && c.target >= end_zone {
            weight *= END_ZONE_STAY_PENALTY;
        }

        if let Some(target_section) = self.ctx.track.beats.get(c.target).map(|b| b.section) {
            if let Some(depth) = self
                .recent_sections
                .iter()
                .rev()
                .take(RECENT_SECTION_DEPTH)
                .position(|&s| s == target_section)
            {
                weight -= params.recent_penalty_scale * (RECENT_SECTION_DEPTH - depth) as f64 * 0.35;
            }
        }
        weight
    }

    /// Floored weights without jitter, aligned with [`Self::filtered_candidates`].
    pub fn jump_weights(&self, src: usize) -> Vec<(JumpCandidate, f64)> {
        self.filtered_candidates(src)
            .into_iter()
            .map(|c| {
                let w = self.base_weight(src, &c).max(WEIGHT_FLOOR);
                (c, w)
            })
            .collect()
    }

    /// Weighted-random choice among the filtered neighborhood edges.
    pub fn select_jump_candidate(&mut self, src: usize) -> Option<JumpCandidate> {
        let filtered = self.filtered_candidates(src);
        if filtered.is_empty() {
            return None;
        }
        let jitter = WeightParams::from_settings(&self.settings).jitter_strength;
        let mut weights = Vec::with_capacity(filtered.len());
        for c in &filtered {
            let mut w = self.base_weight(src, c);
            if jitter > 0.0 {
                w *= 1.0 + self.rng.gen_range(-1.0..=1.0) * jitter;
            }
            weights.push(if w.is_finite() { w.max(WEIGHT_FLOOR) } else { WEIGHT_FLOOR });
        }

        let selected = match WeightedIndex::new(&weights) {
            Ok(dist) => dist.sample(&mut self.rng),
            Err(e) => {
                log::warn!("Unusable jump weights at beat {}: {}", src, e);
                return None;
            }
        };
        let chosen = filtered[selected];
        let same = filtered.iter().filter(|c| c.same_section).count();
        log::debug!(
            "Jump {} -> {} (weight {:.3}, {} candidates, {} same-section)",
            src,
            chosen.target,
            weights[selected],
            filtered.len(),
            same
        );
        Some(chosen)
    }

    /// Where to continue after running off the end: the nearest earlier
    /// beat with an edge, else a random section anchor, else a third in.
    pub fn fallback_reentry_target(&mut self) -> usize {
        let n = self.graph.num_beats();
        if n == 0 {
            return 0;
        }
        let from = self.current.min(n - 1);
        for probe in (0..=from).rev() {
            if self.graph.edges_from(probe).is_empty() {
                continue;
            }
            if let Some(c) = self.select_jump_candidate(probe) {
                return c.target;
            }
        }
        let anchors = self.graph.anchors();
        if !anchors.is_empty() {
            return anchors[self.rng.gen_range(0..anchors.len())];
        }
        n / 3
    }

    fn record_jump(&mut self, source: usize, target: usize) {
        self.loop_history.push_back((source, target));
        if self.loop_history.len() > LOOP_HISTORY_LIMIT {
            self.loop_history.pop_front();
        }
        if self.bubble_radius > 0 {
            self.bubble_history.push_back((target, self.bubble_radius));
            if self.bubble_history.len() > BUBBLE_HISTORY_LIMIT {
                self.bubble_history.pop_front();
            }
        }
    }

    fn record_section_visit(&mut self, section: usize) {
        self.recent_sections.push_back(section);
        if self.recent_sections.len() > RECENT_SECTION_LIMIT {
            self.recent_sections.pop_front();
        }
    }

    /// Move `current` to the next beat and report how.
    fn advance(&mut self) -> Transition {
        let n = self.graph.num_beats();
        let end_zone = (n as f64 * END_ZONE_FRAC).floor() as usize;

        if let Some(retreat) = self.graph.retreat_point() {
            let near = self.current + RETREAT_LEAD >= retreat.source;
            if self.current >= end_zone
                && near
                && (self.current >= retreat.source || self.beats_until_jump <= 2)
            {
                log::debug!("Retreat {} -> {}", self.current, retreat.target);
                self.record_jump(self.current, retreat.target);
                self.current = retreat.target;
                self.schedule_next_jump(false);
                return Transition::Jump {
                    reason: JumpReason::Retreat,
                };
            }
        }

        self.beats_until_jump = self.beats_until_jump.saturating_sub(1);
        if self.beats_until_jump == 0 {
            if let Some(jump) = self.select_jump_candidate(self.current) {
                self.record_jump(self.current, jump.target);
                self.current = jump.target;
                self.schedule_next_jump(false);
                return Transition::Jump {
                    reason: JumpReason::Scheduled,
                };
            }
            self.schedule_next_jump(true);
        }

        self.current += 1;
        if self.current >= n {
            let target = self.fallback_reentry_target();
            self.current = target.min(n.saturating_sub(1));
            self.schedule_next_jump(true);
            log::debug!("Re-entering at beat {}", self.current);
            return Transition::Jump {
                reason: JumpReason::Reentry,
            };
        }
        Transition::Sequential
    }

    fn process(&mut self, now: f64) -> Result<Option<Step>> {
        if self.state != PlaybackState::Running {
            return Ok(None);
        }
        let index = self.current;
        if let Some(beat) = self.ctx.track.beats.get(index) {
            let section = beat.section;
            self.record_section_visit(section);
        }
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

        let transition = self.advance();
        self.continuation.arm(now + delay);

        Ok(Some(Step {
            index,
            overlay: cue.overlay,
            at: now,
            delay,
            next: Some(self.current),
            transition,
        }))
    }
}

impl<P: AudioPlayer> PlaybackDriver for JukeboxDriver<P> {
    type Player = P;

    fn start(&mut self, now: f64) -> Result<Option<Step>> {
        self.continuation.cancel();
        self.current = 0;
        self.rebuild_loop_graph();
        self.stats = PlaybackStats::default();
        self.state = PlaybackState::Running;
        log::info!(
            "Jukebox playback starting ({} loop edges, {} tier)",
            self.graph.edge_count(),
            self.graph.tier()
        );
        self.process(now)
    }

    fn resume(&mut self, now: f64) -> Result<Option<Step>> {
        match self.state {
            PlaybackState::Stopped => self.start(now),
            PlaybackState::Running => Ok(None),
            PlaybackState::Paused => {
                self.rebuild_loop_graph();
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
        self.bubble_history.clear();
    }

    fn state(&self) -> PlaybackState {
        self.state
    }

    fn set_next(&mut self, index: usize) {
        let last = self.ctx.track.len().saturating_sub(1);
        self.current = index.min(last);
        if self.state == PlaybackState::Running {
            self.schedule_next_jump(true);
        }
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
        self.current
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

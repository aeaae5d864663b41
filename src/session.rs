//! The playback session: one loaded track, its derived structures, the
//! active driver and a play queue.
//!
//! Derived structures are rebuilt whole and swapped in as new `Arc`s; a
//! track switch discards all of them before the next driver is built.

use std::collections::VecDeque;
use std::sync::Arc;

use clap::ValueEnum;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;

use crate::analysis::Track;
use crate::canon::{CanonMapping, OverlayField, OverlaySettings, advanced};
use crate::driver::{
    AudioPlayer, CanonDriver, Driver, DriverContext, JukeboxDriver, PlaybackDriver, PlaybackState,
    PlaybackStats, Result, Step, Transition,
};
use crate::graph::{LoopGraph, LoopSettings, LoopSettingsPatch};
use crate::neighbors::{ADVANCED_MAX_NEIGHBORS, DEFAULT_MAX_NEIGHBORS, NeighborTable};

pub const CANON_MASTER_GAIN: f64 = 0.55;
pub const ETERNAL_MASTER_GAIN: f64 = 0.7;
pub const JUKEBOX_MASTER_GAIN: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackMode {
    /// Linear playback against a time-shifted copy of the track.
    #[default]
    Canon,
    /// Endless walk with the canon overlay.
    Eternal,
    /// Endless walk, single voice.
    Jukebox,
}

impl std::fmt::Display for PlaybackMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PlaybackMode::Canon => "canon",
            PlaybackMode::Eternal => "eternal",
            PlaybackMode::Jukebox => "jukebox",
        };
        f.write_str(name)
    }
}

impl PlaybackMode {
    pub fn master_gain(self) -> f64 {
        match self {
            PlaybackMode::Canon => CANON_MASTER_GAIN,
            PlaybackMode::Eternal => ETERNAL_MASTER_GAIN,
            PlaybackMode::Jukebox => JUKEBOX_MASTER_GAIN,
        }
    }
}

/// Which overlay settings group an edit targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayGroup {
    Canon,
    Eternal,
}

/// Every user-tunable group, as loaded from config.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub canon_advanced: bool,
    pub eternal_advanced: bool,
    pub canon_overlay: OverlaySettings,
    pub eternal_overlay: OverlaySettings,
    pub jukebox_loop: LoopSettings,
    pub eternal_loop: LoopSettings,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            canon_advanced: false,
            eternal_advanced: false,
            canon_overlay: OverlaySettings::default(),
            eternal_overlay: OverlaySettings::eternal_default(),
            jukebox_loop: LoopSettings::default(),
            eternal_loop: eternal_loop_default(),
        }
    }
}

/// Loop settings for eternal mode: longer runs, stricter edges.
pub fn eternal_loop_default() -> LoopSettings {
    LoopSettings {
        min_loop_beats: 12,
        max_sequential_beats: 90,
        loop_threshold: 0.76,
        section_bias: 0.2,
        jump_variance: 0.65,
        ..LoopSettings::default()
    }
}

impl SessionSettings {
    fn advanced_for(&self, mode: PlaybackMode) -> bool {
        match mode {
            PlaybackMode::Canon | PlaybackMode::Jukebox => self.canon_advanced,
            PlaybackMode::Eternal => self.eternal_advanced,
        }
    }

    fn overlay_for(&self, mode: PlaybackMode) -> &OverlaySettings {
        match mode {
            PlaybackMode::Canon | PlaybackMode::Jukebox => &self.canon_overlay,
            PlaybackMode::Eternal => &self.eternal_overlay,
        }
    }

    fn loop_for(&self, mode: PlaybackMode) -> &LoopSettings {
        match mode {
            PlaybackMode::Eternal => &self.eternal_loop,
            PlaybackMode::Canon | PlaybackMode::Jukebox => &self.jukebox_loop,
        }
    }

    fn loop_for_mut(&mut self, mode: PlaybackMode) -> &mut LoopSettings {
        match mode {
            PlaybackMode::Eternal => &mut self.eternal_loop,
            PlaybackMode::Canon | PlaybackMode::Jukebox => &mut self.jukebox_loop,
        }
    }

    /// Jump-bubble radius for `mode`; only active with the advanced toggle.
    fn bubble_radius_for(&self, mode: PlaybackMode) -> usize {
        if self.advanced_for(mode) {
            self.overlay_for(mode).jump_bubble_beats
        } else {
            0
        }
    }
}

pub struct Session<P: AudioPlayer> {
    track: Arc<Track>,
    neighbors: Arc<NeighborTable>,
    base_mapping: Arc<CanonMapping>,
    mapping: Arc<CanonMapping>,
    /// Always `Some` between calls; taken while the player moves to a new driver.
    driver: Option<Driver<P>>,
    mode: PlaybackMode,
    settings: SessionSettings,
    rng: ChaCha8Rng,
    queue: VecDeque<Track>,
}

impl<P: AudioPlayer> Session<P> {
    pub fn new(
        player: P,
        track: Track,
        mode: PlaybackMode,
        settings: SessionSettings,
        seed: u64,
    ) -> Self {
        let mut session = Self {
            track: Arc::new(track),
            neighbors: Arc::new(NeighborTable::default()),
            base_mapping: Arc::new(CanonMapping::identity(0)),
            mapping: Arc::new(CanonMapping::identity(0)),
            driver: None,
            mode,
            settings,
            rng: ChaCha8Rng::seed_from_u64(seed),
            queue: VecDeque::new(),
        };
        session.derive_structures();
        session.driver = Some(session.build_driver(player));
        session
    }

    pub fn track(&self) -> &Arc<Track> {
        &self.track
    }

    pub fn neighbors(&self) -> &Arc<NeighborTable> {
        &self.neighbors
    }

    pub fn base_mapping(&self) -> &Arc<CanonMapping> {
        &self.base_mapping
    }

    /// Mapping currently fed to the driver.
    pub fn mapping(&self) -> &Arc<CanonMapping> {
        &self.mapping
    }

    pub fn mode(&self) -> PlaybackMode {
        self.mode
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn master_gain(&self) -> f64 {
        self.mode.master_gain()
    }

    pub fn driver(&self) -> Option<&Driver<P>> {
        self.driver.as_ref()
    }

    pub fn driver_mut(&mut self) -> Option<&mut Driver<P>> {
        self.driver.as_mut()
    }

    /// Loop graph of the jukebox driver, if one is active.
    pub fn loop_graph(&self) -> Option<&Arc<LoopGraph>> {
        self.driver.as_ref()?.as_jukebox().map(|j| j.graph())
    }

    pub fn state(&self) -> PlaybackState {
        self.driver
            .as_ref()
            .map_or(PlaybackState::Stopped, |d| d.state())
    }

    pub fn stats(&self) -> PlaybackStats {
        self.driver.as_ref().map(|d| d.stats()).unwrap_or_default()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn start(&mut self, now: f64) -> Result<Option<Step>> {
        match self.driver.as_mut() {
            Some(d) => d.start(now),
            None => Ok(None),
        }
    }

    pub fn resume(&mut self, now: f64) -> Result<Option<Step>> {
        match self.driver.as_mut() {
            Some(d) => d.resume(now),
            None => Ok(None),
        }
    }

    pub fn pause(&mut self) {
        if let Some(d) = self.driver.as_mut() {
            d.pause();
        }
    }

    pub fn stop(&mut self) {
        if let Some(d) = self.driver.as_mut() {
            d.stop();
        }
    }

    pub fn set_speed_factor(&mut self, factor: f64) {
        if let Some(d) = self.driver.as_mut() {
            d.player_mut().set_speed_factor(factor);
        }
    }

    /// Queue a track to play after the current one. Canon playback hands
    /// off to it at the end instead of stopping.
    pub fn enqueue(&mut self, track: Track) {
        self.queue.push_back(track);
        self.sync_auto_continue();
    }

    /// Stop playback and replace the track. Every derived structure is
    /// rebuilt from scratch.
    pub fn load_track(&mut self, track: Track) {
        if let Some(d) = self.driver.as_mut() {
            d.stop();
        }
        self.replace_track(track);
    }

    fn replace_track(&mut self, track: Track) {
        let Some(old) = self.driver.take() else {
            return;
        };
        let player = old.into_player();
        self.track = Arc::new(track);
        self.derive_structures();
        log::info!(
            "Loaded {} ({} beats, {:.1}s)",
            self.track.title.as_deref().unwrap_or("untitled track"),
            self.track.len(),
            self.track.duration
        );
        self.driver = Some(self.build_driver(player));
    }

    /// Switch modes, moving the player to the new driver. Playback restarts
    /// in the new mode if it was running.
    pub fn set_mode(&mut self, mode: PlaybackMode, now: f64) -> Result<Option<Step>> {
        if mode == self.mode {
            return Ok(None);
        }
        let Some(mut old) = self.driver.take() else {
            return Ok(None);
        };
        let was_running = old.is_running();
        old.stop();
        let player = old.into_player();

        log::info!("Switching playback mode {} -> {}", self.mode, mode);
        self.mode = mode;
        self.derive_structures();
        let mut driver = self.build_driver(player);
        let step = if was_running { driver.start(now)? } else { None };
        self.driver = Some(driver);
        Ok(step)
    }

    pub fn set_canon_advanced(&mut self, enabled: bool) {
        if self.settings.canon_advanced == enabled {
            return;
        }
        self.settings.canon_advanced = enabled;
        if self.mode != PlaybackMode::Eternal {
            self.refresh_overlay();
        }
    }

    pub fn set_eternal_advanced(&mut self, enabled: bool) {
        if self.settings.eternal_advanced == enabled {
            return;
        }
        self.settings.eternal_advanced = enabled;
        if self.mode == PlaybackMode::Eternal {
            self.refresh_overlay();
        }
    }

    /// Edit one overlay setting. The overlay is regenerated when the group
    /// is live for the current mode.
    pub fn update_overlay_setting(&mut self, group: OverlayGroup, field: OverlayField, value: f64) {
        let (settings, live) = match group {
            OverlayGroup::Canon => (
                &mut self.settings.canon_overlay,
                self.mode != PlaybackMode::Eternal && self.settings.canon_advanced,
            ),
            OverlayGroup::Eternal => (
                &mut self.settings.eternal_overlay,
                self.mode == PlaybackMode::Eternal && self.settings.eternal_advanced,
            ),
        };
        if settings.set(field, value) && live {
            self.refresh_overlay();
        }
    }

    /// Forward a loop-settings patch to the jukebox driver. In canon mode
    /// the patch is stored for the next jukebox session.
    pub fn apply_loop_settings(&mut self, patch: &LoopSettingsPatch) {
        let mode = self.mode;
        match self.driver.as_mut().and_then(|d| d.as_jukebox_mut()) {
            Some(jukebox) => {
                jukebox.recompute_loop_graph(patch);
                *self.settings.loop_for_mut(mode) = jukebox.settings().clone();
            }
            None => {
                patch.apply(self.settings.loop_for_mut(mode));
            }
        }
    }

    /// Fire every continuation due at or before `now`, following queue
    /// handoffs, and return the beats that played.
    pub fn advance_to(&mut self, now: f64) -> Result<Vec<Step>> {
        let mut steps = Vec::new();
        let mut handoff = false;
        loop {
            let Some(driver) = self.driver.as_mut() else {
                break;
            };
            let Some(due) = driver.next_due() else {
                break;
            };
            if due.due > now {
                break;
            }
            if let Some(step) = driver.fire(due.token)? {
                handoff = step.transition == Transition::Handoff;
                steps.push(step);
                continue;
            }
            if handoff && !driver.is_running() {
                handoff = false;
                let Some(next) = self.queue.pop_front() else {
                    break;
                };
                self.replace_track(next);
                if let Some(step) = self.start(due.due)? {
                    steps.push(step);
                }
            }
        }
        Ok(steps)
    }

    /// Build neighbors, base mapping and the mode's mapping for the
    /// current track.
    fn derive_structures(&mut self) {
        let advanced = self.settings.advanced_for(self.mode);
        let mut neighbors = NeighborTable::compute(&self.track, advanced);
        if let Some(alignment) = &self.track.canon_alignment {
            neighbors.augment_with_alignment(alignment);
        }
        let base = CanonMapping::for_track(&self.track, &neighbors);
        self.neighbors = Arc::new(neighbors);
        self.base_mapping = Arc::new(base);
        self.mapping = self.mapping_for_mode();
    }

    fn mapping_for_mode(&mut self) -> Arc<CanonMapping> {
        match self.mode {
            PlaybackMode::Jukebox => Arc::new(CanonMapping::identity(self.track.len())),
            mode if self.settings.advanced_for(mode) => {
                let mut mapping = (*self.base_mapping).clone();
                let overlay = self.settings.overlay_for(mode).clone();
                advanced::regenerate(
                    &mut mapping,
                    &self.track,
                    &self.neighbors,
                    &overlay,
                    &mut self.rng,
                );
                Arc::new(mapping)
            }
            _ => Arc::clone(&self.base_mapping),
        }
    }

    /// Recompute the overlay after an advanced toggle or setting change and
    /// swap it into the running driver.
    fn refresh_overlay(&mut self) {
        let wanted = if self.settings.advanced_for(self.mode) {
            ADVANCED_MAX_NEIGHBORS
        } else {
            DEFAULT_MAX_NEIGHBORS
        };
        if self.neighbors.max_neighbors != wanted {
            self.derive_structures();
        } else {
            self.mapping = self.mapping_for_mode();
        }
        let mapping = Arc::clone(&self.mapping);
        let radius = self.settings.bubble_radius_for(self.mode);
        if let Some(driver) = self.driver.as_mut() {
            driver.set_mapping(mapping);
            if let Some(jukebox) = driver.as_jukebox_mut() {
                jukebox.set_bubble_radius(radius);
            }
        }
    }

    fn build_driver(&mut self, player: P) -> Driver<P> {
        let ctx = DriverContext {
            track: Arc::clone(&self.track),
            neighbors: Arc::clone(&self.neighbors),
            mapping: Arc::clone(&self.mapping),
            master_gain: self.mode.master_gain(),
        };
        match self.mode {
            PlaybackMode::Canon => {
                let mut driver = CanonDriver::new(player, ctx);
                driver.set_auto_continue(!self.queue.is_empty());
                Driver::Canon(driver)
            }
            mode => {
                let rng = ChaCha8Rng::seed_from_u64(self.rng.next_u64());
                let mut driver =
                    JukeboxDriver::new(player, ctx, self.settings.loop_for(mode).clone(), rng);
                driver.set_bubble_radius(self.settings.bubble_radius_for(mode));
                Driver::Jukebox(driver)
            }
        }
    }

    fn sync_auto_continue(&mut self) {
        let pending = !self.queue.is_empty();
        if let Some(Driver::Canon(d)) = self.driver.as_mut() {
            d.set_auto_continue(pending);
        }
    }
}

//! Advanced overlay re-mapping.
//!
//! Runs on a clone of the base mapping in three passes: force every offset
//! into a usable range, inject short constant-offset runs in the middle of
//! the track, then smooth the offset sequence with dwell hysteresis.

use rand::Rng;
use serde::Deserialize;

use super::CanonMapping;
use crate::analysis::Track;
use crate::neighbors::NeighborTable;

const MUSICAL_INTERVALS: [i64; 9] = [4, 8, 12, 16, 20, 24, 32, 48, 64];

const MID_START_FRAC: f64 = 0.22;
const MID_END_FRAC: f64 = 0.88;
const ENRICH_MAX_DISTANCE: f64 = 70.0;
const PROBE_DISTANCE: f64 = 180.0;
const SMOOTH_CANDIDATES: usize = 6;

/// User-tunable overlay settings, one group per overlay mode.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct OverlaySettings {
    /// 0..=100: how strongly offsets snap to bar/phrase multiples.
    pub musicality: u32,
    pub min_offset_beats: usize,
    pub max_offset_beats: usize,
    pub dwell_beats: usize,
    pub density: usize,
    /// Anti-repetition radius around recent jump targets.
    pub jump_bubble_beats: usize,
    pub variation: usize,
}

impl Default for OverlaySettings {
    fn default() -> Self {
        Self {
            musicality: 65,
            min_offset_beats: 8,
            max_offset_beats: 64,
            dwell_beats: 6,
            density: 2,
            jump_bubble_beats: 8,
            variation: 2,
        }
    }
}

/// A single overlay setting, for live edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayField {
    Musicality,
    MinOffsetBeats,
    MaxOffsetBeats,
    DwellBeats,
    Density,
    JumpBubbleBeats,
    Variation,
}

impl OverlaySettings {
    pub fn eternal_default() -> Self {
        Self {
            musicality: 60,
            ..Self::default()
        }
    }

    /// Set one field from a user value. Rounds, clamps negatives to 0 and
    /// musicality to 100; NaN is ignored. Returns true when it changed.
    pub fn set(&mut self, field: OverlayField, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        let v = value.round().max(0.0) as usize;
        let slot = match field {
            OverlayField::Musicality => {
                let m = v.min(100) as u32;
                let changed = m != self.musicality;
                self.musicality = m;
                return changed;
            }
            OverlayField::MinOffsetBeats => &mut self.min_offset_beats,
            OverlayField::MaxOffsetBeats => &mut self.max_offset_beats,
            OverlayField::DwellBeats => &mut self.dwell_beats,
            OverlayField::Density => &mut self.density,
            OverlayField::JumpBubbleBeats => &mut self.jump_bubble_beats,
            OverlayField::Variation => &mut self.variation,
        };
        let changed = *slot != v;
        *slot = v;
        changed
    }
}

/// Parameters derived from [`OverlaySettings`] for one track.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayParams {
    pub min_offset: usize,
    pub max_offset: usize,
    pub dwell: usize,
    pub density: usize,
    pub variation: usize,
    pub musicality: u32,
    pub spacing: usize,
    pub run_len: usize,
    pub jitter: usize,
    pub window: usize,
}

impl OverlayParams {
    pub fn derive(settings: &OverlaySettings, num_beats: usize) -> Self {
        let last = num_beats.saturating_sub(1);
        let min_offset = settings.min_offset_beats.max(1);
        let requested_max = if settings.max_offset_beats == 0 {
            (num_beats as f64 * 0.6).floor() as usize
        } else {
            settings.max_offset_beats
        };
        let mut max_offset = requested_max.max(min_offset + 1).min(last);
        if max_offset <= min_offset {
            max_offset = (min_offset + 1).max(last.min(min_offset + 8));
        }
        let dwell = if settings.dwell_beats == 0 { 4 } else { settings.dwell_beats };
        let density = if settings.density == 0 { 3 } else { settings.density };
        let variation = settings.variation;

        Self {
            min_offset,
            max_offset,
            dwell,
            density,
            variation,
            musicality: settings.musicality.min(100),
            spacing: ((36.0 / density as f64).round() as usize + 12).max(8),
            run_len: (density + 2).clamp(2, 8),
            jitter: (variation + 2).min(10),
            window: (7 + variation).min(15),
        }
    }
}

/// Run the full advanced pipeline on `mapping` in place.
pub fn regenerate<R: Rng + ?Sized>(
    mapping: &mut CanonMapping,
    track: &Track,
    neighbors: &NeighborTable,
    settings: &OverlaySettings,
    rng: &mut R,
) -> OverlayParams {
    let params = OverlayParams::derive(settings, track.len());
    if track.is_empty() {
        return params;
    }
    ensure_minimum_offset(mapping, track, neighbors, params.min_offset, params.max_offset);
    enrich_overlay_connections(mapping, track, neighbors, &params, rng);
    smooth_canon_mapping(mapping, track, neighbors, &params);
    log::info!(
        "Regenerated overlay: offsets {}..={}, dwell {}, density {}, variation {} ({} of {} beats audible)",
        params.min_offset,
        params.max_offset,
        params.dwell,
        params.density,
        params.variation,
        mapping.audible_count(),
        mapping.len()
    );
    params
}

/// Give every beat whose circular offset lies outside `[min_abs, max_abs]`
/// a partner inside it: good neighbors first, then neighbors, then a
/// forward/backward stride probe.
pub fn ensure_minimum_offset(
    mapping: &mut CanonMapping,
    track: &Track,
    neighbors: &NeighborTable,
    min_abs: usize,
    max_abs: usize,
) {
    let n = track.len();
    if n == 0 {
        return;
    }
    let min_abs = min_abs.max(1);
    let max_abs = max_abs.max(min_abs + 1);
    let circular = |from: usize, to: usize| (to + n - from) % n;

    for which in 0..n {
        let Some(current) = mapping.get(which) else {
            continue;
        };
        let delta = circular(which, current.other);
        if (min_abs..=max_abs).contains(&delta) {
            continue;
        }
        let section = track.beats[which].section;

        let consider = |best: &mut Option<(usize, f64)>, target: usize, distance: f64, weight: f64| {
            let delta = circular(which, target);
            if delta == 0 || delta < min_abs || delta > max_abs {
                return;
            }
            let mut penalty = weight + distance / 220.0;
            if track.beats[target].section != section {
                penalty += 0.6;
            }
            if best.is_none_or(|(_, p)| penalty < p) {
                *best = Some((target, penalty));
            }
        };

        let mut best: Option<(usize, f64)> = None;
        for nb in neighbors.good_neighbors(which) {
            consider(&mut best, nb.beat, nb.distance, 0.0);
        }
        if best.is_none() {
            for nb in neighbors.neighbors(which) {
                consider(&mut best, nb.beat, nb.distance, 0.25);
            }
        }
        if best.is_none() {
            let stride = ((min_abs as f64 / 2.0).round() as usize).max(1);
            let mut offset = min_abs;
            while offset <= max_abs {
                let weight = 1.0 + offset as f64 / 64.0;
                consider(&mut best, (which + offset) % n, PROBE_DISTANCE, weight);
                consider(&mut best, (which + n - offset % n) % n, PROBE_DISTANCE, weight);
                if best.is_some() {
                    break;
                }
                offset += stride;
            }
        }

        if let Some((target, _)) = best {
            mapping.set_other(which, target);
            if let Some(pair) = mapping.pairs.get_mut(which) {
                let gain = if pair.gain > 0.0 { pair.gain } else { 0.45 };
                pair.gain = gain.clamp(0.35, 0.9);
            }
        }
    }
}

/// Inject short constant-offset runs between 22% and 88% of the track,
/// spaced `params.spacing` beats apart plus random jitter.
pub fn enrich_overlay_connections<R: Rng + ?Sized>(
    mapping: &mut CanonMapping,
    track: &Track,
    neighbors: &NeighborTable,
    params: &OverlayParams,
    rng: &mut R,
) {
    let n = track.len();
    let start = (n as f64 * MID_START_FRAC).floor() as usize;
    let end = (n as f64 * MID_END_FRAC).floor() as usize;
    if end <= start + 4 {
        return;
    }
    let base_spacing = params.spacing.max(10);
    let max_run = params.run_len.max(2);
    let max_distance = ENRICH_MAX_DISTANCE.max(40.0);
    let min_abs = params.min_offset.max(1) as i64;
    let max_abs = (params.max_offset > params.min_offset).then_some(params.max_offset as i64);

    let mut runs = 0;
    let mut i = start;
    while i < end {
        let section = track.beats[i].section;
        let pool = if neighbors.good_neighbors(i).is_empty() {
            neighbors.neighbors(i)
        } else {
            neighbors.good_neighbors(i)
        };
        let run_len = max_run.min(end - i);

        let chosen = pool.iter().find_map(|nb| {
            if nb.distance > max_distance || track.beats[nb.beat].section != section {
                return None;
            }
            let delta = nb.beat as i64 - i as i64;
            if delta.abs() < min_abs || max_abs.is_some_and(|m| delta.abs() > m) {
                return None;
            }
            let run_end = (i + run_len) as i64 + delta;
            (0..n as i64).contains(&run_end).then_some(delta)
        });

        if let Some(delta) = chosen {
            for r in 0..run_len {
                let target = (i + r) as i64 + delta;
                if !(0..n as i64).contains(&target) {
                    break;
                }
                mapping.set_other(i + r, target as usize);
                if let Some(pair) = mapping.pairs.get_mut(i + r) {
                    pair.gain = if pair.gain == 0.0 {
                        0.35
                    } else {
                        pair.gain.clamp(0.25, 0.9)
                    };
                }
            }
            runs += 1;
        }

        i += base_spacing + rng.gen_range(0..=params.jitter);
    }
    log::debug!("Injected {} overlay runs between beats {} and {}", runs, start, end);
}

/// Denoise the per-beat offsets with a running median, snap toward musical
/// intervals, re-pick each partner among its candidates, and hold an offset
/// for at least the dwell length before switching.
pub fn smooth_canon_mapping(
    mapping: &mut CanonMapping,
    track: &Track,
    neighbors: &NeighborTable,
    params: &OverlayParams,
) {
    let n = track.len();
    if n == 0 {
        return;
    }
    let window = params.window.max(3);
    let min_abs = params.min_offset.max(1) as i64;
    let min_dwell = params.dwell.max(2);
    let max_abs = (params.max_offset > params.min_offset).then_some(params.max_offset as i64);
    let musicality = f64::from(params.musicality.min(100));

    let mut deltas: Vec<i64> = (0..n)
        .map(|i| mapping.offset_of(i).unwrap_or(0))
        .collect();

    let mut last_delta: Option<i64> = None;
    let mut run_len = 0usize;

    for i in 0..n {
        let mut preferred = running_median(&deltas, i, window);

        let abs_pref = preferred.abs();
        let (closest, min_dist) = MUSICAL_INTERVALS
            .iter()
            .map(|&m| (m, (abs_pref - m).abs()))
            .fold((MUSICAL_INTERVALS[0], i64::MAX), |best, cur| {
                if cur.1 < best.1 { cur } else { best }
            });
        let snap_threshold = (musicality / 100.0 * 10.0).floor() as i64;
        if min_dist <= snap_threshold {
            let strength = musicality / 100.0;
            let snapped = if preferred >= 0 { closest } else { -closest };
            preferred = round_half_up(preferred as f64 * (1.0 - strength) + snapped as f64 * strength);
        }
        if preferred.abs() < min_abs {
            preferred = if preferred >= 0 { min_abs } else { -min_abs };
        }
        if let Some(max) = max_abs {
            if preferred.abs() > max {
                preferred = if preferred >= 0 { max } else { -max };
            }
        }

        let section = track.beats[i].section;
        let current = mapping.get(i).map(|p| (p.other, 0.0));
        let candidates = current
            .into_iter()
            .chain(
                neighbors
                    .good_neighbors(i)
                    .iter()
                    .take(SMOOTH_CANDIDATES)
                    .map(|nb| (nb.beat, nb.distance)),
            )
            .chain(
                neighbors
                    .neighbors(i)
                    .iter()
                    .take(SMOOTH_CANDIDATES)
                    .map(|nb| (nb.beat, nb.distance)),
            );

        let mut best: Option<(usize, f64, i64)> = None;
        for (beat, distance) in candidates {
            let delta = beat as i64 - i as i64;
            let abs = delta.abs();
            if abs < min_abs || max_abs.is_some_and(|m| abs > m) {
                continue;
            }
            if track.beats[beat].section != section {
                continue;
            }
            let delta_cost = (delta - preferred).abs() as f64;
            let sim_cost = distance / 200.0;
            let musical_bonus = if abs % 16 == 0 {
                0.35
            } else if abs % 8 == 0 {
                0.25
            } else if abs % 4 == 0 {
                0.15
            } else {
                0.0
            };
            let size_reward = match max_abs {
                Some(max) if max > 0 => (abs as f64 / max as f64 * 0.3).min(0.35),
                _ => (abs as f64 / (min_abs * 2).max(8) as f64 * 0.25).min(0.25),
            };
            let cost = delta_cost + sim_cost - size_reward - musical_bonus;
            if best.is_none_or(|(_, c, _)| cost < c) {
                best = Some((beat, cost, delta));
            }
        }

        let Some((beat, _, delta)) = best else {
            continue;
        };

        match last_delta {
            Some(last) if last != delta => {
                let next = (i + 1).min(n - 1);
                let at_section_boundary = track.beats[next].section != section;
                let at_phrase_boundary = i % 8 == 0;
                let effective_dwell = if at_section_boundary || at_phrase_boundary {
                    ((min_dwell as f64 * 0.6).floor() as usize).max(2)
                } else {
                    (min_dwell as f64 * 1.2).ceil() as usize
                };
                if run_len < effective_dwell {
                    let projected = i as i64 + last;
                    if (0..n as i64).contains(&projected) {
                        mapping.set_other(i, projected as usize);
                        deltas[i] = last;
                        run_len += 1;
                        continue;
                    }
                }
                run_len = 1;
            }
            _ => run_len += 1,
        }
        mapping.set_other(i, beat);
        deltas[i] = delta;
        last_delta = Some(delta);
    }
}

fn running_median(values: &[i64], idx: usize, window: usize) -> i64 {
    let half = window / 2;
    let start = idx.saturating_sub(half);
    let end = (idx + half).min(values.len() - 1);
    let mut slice = values[start..=end].to_vec();
    slice.sort_unstable();
    slice[slice.len() / 2]
}

fn round_half_up(x: f64) -> i64 {
    (x + 0.5).floor() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn setup(n: usize, sections: usize) -> (Track, NeighborTable) {
        let track = testutil::sectioned_track(n, sections);
        let table = NeighborTable::compute(&track, true);
        (track, table)
    }

    fn assert_valid(mapping: &CanonMapping, n: usize) {
        for pair in mapping.pairs() {
            assert!(pair.other < n);
            assert!((0.0..=1.0).contains(&pair.gain));
        }
    }

    #[test]
    fn test_derive_params() {
        let p = OverlayParams::derive(&OverlaySettings::default(), 200);
        assert_eq!((p.min_offset, p.max_offset), (8, 64));
        assert_eq!(p.spacing, 30);
        assert_eq!(p.run_len, 4);
        assert_eq!(p.jitter, 4);
        assert_eq!(p.window, 9);

        let p = OverlayParams::derive(&OverlaySettings::default(), 40);
        assert_eq!(p.max_offset, 39);

        let dense = OverlaySettings {
            density: 12,
            variation: 20,
            ..Default::default()
        };
        let p = OverlayParams::derive(&dense, 200);
        assert_eq!(p.spacing, 15);
        assert_eq!(p.run_len, 8);
        assert_eq!(p.jitter, 10);
        assert_eq!(p.window, 15);
    }

    #[test]
    fn test_overlay_setting_edits() {
        let mut s = OverlaySettings::default();
        assert!(s.set(OverlayField::Musicality, 250.0));
        assert_eq!(s.musicality, 100);
        assert!(s.set(OverlayField::DwellBeats, -3.0));
        assert_eq!(s.dwell_beats, 0);
        assert!(!s.set(OverlayField::Density, f64::NAN));
        assert!(!s.set(OverlayField::Density, 2.2));
        assert_eq!(OverlaySettings::eternal_default().musicality, 60);
    }

    #[test]
    fn test_ensure_minimum_offset_from_identity() {
        let (track, table) = setup(64, 1);
        let mut mapping = CanonMapping::identity(64);
        ensure_minimum_offset(&mut mapping, &track, &table, 8, 63);
        assert_valid(&mapping, 64);
        for (i, pair) in mapping.pairs().iter().enumerate() {
            let delta = (pair.other + 64 - i) % 64;
            assert!((8..=63).contains(&delta), "beat {} delta {}", i, delta);
            assert!((0.35..=0.9).contains(&pair.gain));
        }
    }

    #[test]
    fn test_ensure_minimum_offset_probes_without_neighbors() {
        let mut payload = testutil::sectioned_payload(32, 1);
        payload.segments.clear();
        let track = Track::from_payload(payload, None, None).unwrap();
        let table = NeighborTable::compute(&track, true);
        let mut mapping = CanonMapping::identity(32);
        ensure_minimum_offset(&mut mapping, &track, &table, 8, 16);
        for (i, pair) in mapping.pairs().iter().enumerate() {
            assert_eq!(pair.other, (i + 8) % 32);
            assert_eq!(pair.gain, 0.45);
        }
    }

    #[test]
    fn test_enrich_stays_in_middle() {
        let (track, table) = setup(200, 2);
        let base = CanonMapping::identity(200);
        let mut mapping = base.clone();
        let params = OverlayParams::derive(&OverlaySettings::default(), 200);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        enrich_overlay_connections(&mut mapping, &track, &table, &params, &mut rng);
        assert_valid(&mapping, 200);
        let changed: Vec<usize> = (0..200)
            .filter(|&i| mapping.get(i) != base.get(i))
            .collect();
        assert!(!changed.is_empty());
        assert!(changed.iter().all(|&i| (44..176).contains(&i)));
        for &i in &changed {
            let pair = mapping.get(i).unwrap();
            assert_eq!(pair.gain, 0.35);
            assert!(mapping.offset_of(i).unwrap().abs() >= 8);
        }
    }

    #[test]
    fn test_smoothing_reduces_offset_changes() {
        let (track, table) = setup(128, 1);
        let mut mapping = CanonMapping::identity(128);
        for i in 0..128 {
            let offset = if i % 2 == 0 { 8 } else { 16 };
            let other = if i + offset < 128 { i + offset } else { i - offset };
            mapping.set_other(i, other);
        }
        let changes = |m: &CanonMapping| {
            (1..128)
                .filter(|&i| m.offset_of(i) != m.offset_of(i - 1))
                .count()
        };
        let before = changes(&mapping);
        let params = OverlayParams::derive(&OverlaySettings::default(), 128);
        smooth_canon_mapping(&mut mapping, &track, &table, &params);
        assert_valid(&mapping, 128);
        assert!(changes(&mapping) < before / 2, "{} vs {}", changes(&mapping), before);
    }

    #[test]
    fn test_regenerate_is_seeded() {
        let (track, table) = setup(160, 4);
        let base = CanonMapping::fold_by_section(&track, &table);
        let run = |seed| {
            let mut m = base.clone();
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            regenerate(&mut m, &track, &table, &OverlaySettings::default(), &mut rng);
            m
        };
        let a = run(3);
        assert_valid(&a, 160);
        assert_eq!(a, run(3));
    }

    #[test]
    fn test_running_median() {
        let values = [1, 9, 2, 8, 3];
        assert_eq!(running_median(&values, 2, 5), 3);
        assert_eq!(running_median(&values, 0, 3), 9);
    }
}

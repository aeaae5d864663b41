//! Canon overlay mapping: every beat gets a partner beat and a blend gain.

pub mod advanced;

use std::collections::BTreeMap;

use crate::analysis::{CanonAlignment, Track};
use crate::neighbors::NeighborTable;

pub use advanced::{OverlayField, OverlayParams, OverlaySettings};

const GAIN_DEFAULT: f64 = 0.40;
const GAIN_PRIMARY: f64 = 0.46;
const GAIN_FALLBACK: f64 = 0.34;
const LOW_PHASE_ALIGNMENT: f64 = 0.65;
const HIGH_PHASE_ALIGNMENT: f64 = 0.88;
const LOW_COVERAGE: f64 = 0.75;

const FOLD_GAIN: f64 = 0.9;
const FOLD_WEAK_GAIN: f64 = 0.15;
const SEAM_GAIN: f64 = 0.5;

/// Overlay partner of one beat.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonPair {
    /// Always a valid index into the same track.
    pub other: usize,
    /// Blend gain in `[0, 1]`.
    pub gain: f64,
    /// Raw pairing similarity when supplied by an alignment.
    pub similarity: Option<f64>,
    pub label: Option<String>,
}

impl CanonPair {
    fn solo(which: usize) -> Self {
        Self {
            other: which,
            gain: 0.0,
            similarity: None,
            label: None,
        }
    }
}

/// Per-beat overlay pairing for one track.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonMapping {
    pairs: Vec<CanonPair>,
}

impl CanonMapping {
    /// No overlay: every beat pairs with itself at gain 0.
    pub fn identity(num_beats: usize) -> Self {
        Self {
            pairs: (0..num_beats).map(CanonPair::solo).collect(),
        }
    }

    /// Use the alignment when it fits the track, else fold by section.
    pub fn for_track(track: &Track, neighbors: &NeighborTable) -> Self {
        if let Some(mapping) = track
            .canon_alignment
            .as_ref()
            .and_then(|a| Self::from_alignment(a, track.len()))
        {
            log::info!(
                "Canon mapping from alignment ({} of {} beats audible)",
                mapping.audible_count(),
                mapping.len()
            );
            return mapping;
        }
        let mapping = Self::fold_by_section(track, neighbors);
        log::info!(
            "Canon mapping folded by section ({} of {} beats audible)",
            mapping.audible_count(),
            mapping.len()
        );
        mapping
    }

    /// Pair beats as the server alignment says. Returns `None` when the pair
    /// list does not cover exactly `num_beats` beats.
    pub fn from_alignment(alignment: &CanonAlignment, num_beats: usize) -> Option<Self> {
        if num_beats == 0 || alignment.pairs.len() != num_beats {
            return None;
        }
        let n = num_beats as i64;
        let threshold = alignment.threshold();
        let coverage = alignment.coverage.as_ref().and_then(|c| c.ratio);

        // Beat index -> (label, phase alignment); later segments win.
        let mut segment_info: Vec<Option<(String, Option<f64>)>> = vec![None; num_beats];
        for seg in &alignment.segments {
            let (Some(start), Some(end)) = (seg.start, seg.end) else {
                continue;
            };
            let start = start.floor().max(0.0) as usize;
            let end = (end.ceil().max(0.0) as usize).min(num_beats);
            let label = seg.label.clone().unwrap_or_else(|| "primary".to_string());
            for slot in segment_info.iter_mut().take(end).skip(start) {
                *slot = Some((label.clone(), seg.phase_alignment));
            }
        }

        let pairs = (0..num_beats)
            .map(|i| {
                let mut sim = alignment.similarity_at(i).unwrap_or(0.0);
                let other = match alignment.pairs[i].filter(|p| (0..n).contains(p)) {
                    Some(p) => p as usize,
                    None => {
                        sim = 0.0;
                        (i as i64 + alignment.offset).rem_euclid(n) as usize
                    }
                };

                let mut base = GAIN_DEFAULT;
                let mut label = None;
                if let Some((seg_label, phase)) = &segment_info[i] {
                    match seg_label.as_str() {
                        "primary" => base = GAIN_PRIMARY,
                        "fallback" => base = GAIN_FALLBACK,
                        _ => {}
                    }
                    match phase {
                        Some(p) if *p < LOW_PHASE_ALIGNMENT => base *= 0.9,
                        Some(p) if *p > HIGH_PHASE_ALIGNMENT => base += 0.05,
                        _ => {}
                    }
                    label = Some(seg_label.clone());
                }
                if coverage.is_some_and(|c| c < LOW_COVERAGE) {
                    base *= 0.92;
                }

                let gain = if sim < threshold {
                    0.0
                } else {
                    let norm = ((sim + 1.0) / 2.0).clamp(0.0, 1.0);
                    (base + norm * 0.45).clamp(0.25, 1.0)
                };

                CanonPair {
                    other,
                    gain,
                    similarity: Some(sim),
                    label,
                }
            })
            .collect();

        Some(Self { pairs })
    }

    /// Within each section apply the most common beat-to-nearest offset,
    /// falling back to the next beat (or silence) when there is none.
    pub fn fold_by_section(track: &Track, neighbors: &NeighborTable) -> Self {
        let n = track.len();
        let num_sections = track.sections.len().max(1);
        let mut pairs: Vec<CanonPair> = (0..n).map(CanonPair::solo).collect();

        for section in 0..num_sections {
            let mut counter: BTreeMap<i64, usize> = BTreeMap::new();
            for beat in track.beats.iter().filter(|b| b.section == section) {
                let Some(sim) = neighbors.sim(beat.which) else {
                    continue;
                };
                if track.beats[sim].section == section {
                    *counter.entry(beat.which as i64 - sim as i64).or_default() += 1;
                }
            }
            let mut best: Option<(i64, usize)> = None;
            for (&delta, &count) in &counter {
                if best.is_none_or(|(_, c)| count > c) {
                    best = Some((delta, count));
                }
            }
            let best_delta = best.map(|(d, _)| d);

            for beat in track.beats.iter().filter(|b| b.section == section) {
                let which = beat.which;
                let fallback = if which + 1 < n { which + 1 } else { which };
                let sim_in_section = neighbors
                    .sim(which)
                    .is_some_and(|s| track.beats[s].section == section);

                let (other, gain) = match best_delta {
                    Some(delta) if sim_in_section => {
                        let target = which as i64 - delta;
                        if (0..n as i64).contains(&target) && target as usize != fallback {
                            (target as usize, FOLD_GAIN)
                        } else {
                            (fallback, FOLD_WEAK_GAIN)
                        }
                    }
                    _ => {
                        let gain = if fallback == which { 0.0 } else { FOLD_WEAK_GAIN };
                        (fallback, gain)
                    }
                };
                pairs[which].other = other;
                pairs[which].gain = gain;
            }
        }

        // Soften the audible seam where the partner chain is not contiguous.
        for i in 1..n {
            if pairs[i - 1].other + 1 != pairs[i].other {
                pairs[i - 1].gain = pairs[i - 1].gain.min(SEAM_GAIN);
                pairs[i].gain = pairs[i].gain.min(SEAM_GAIN);
            }
        }

        Self { pairs }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn get(&self, which: usize) -> Option<&CanonPair> {
        self.pairs.get(which)
    }

    pub fn pairs(&self) -> &[CanonPair] {
        &self.pairs
    }

    /// Signed partner offset of a beat.
    pub fn offset_of(&self, which: usize) -> Option<i64> {
        self.pairs
            .get(which)
            .map(|p| p.other as i64 - which as i64)
    }

    /// Beats whose overlay is audible.
    pub fn audible_count(&self) -> usize {
        self.pairs.iter().filter(|p| p.gain > 0.0).count()
    }

    pub fn mean_gain(&self) -> f64 {
        if self.pairs.is_empty() {
            return 0.0;
        }
        self.pairs.iter().map(|p| p.gain).sum::<f64>() / self.pairs.len() as f64
    }

    fn set_other(&mut self, which: usize, other: usize) {
        if let Some(pair) = self.pairs.get_mut(which) {
            pair.other = other;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::payload::{AlignmentCoverage, AlignmentSegment};
    use crate::testutil;

    fn assert_valid(mapping: &CanonMapping, n: usize) {
        assert_eq!(mapping.len(), n);
        for pair in mapping.pairs() {
            assert!(pair.other < n);
            assert!((0.0..=1.0).contains(&pair.gain));
        }
    }

    #[test]
    fn test_identity() {
        let mapping = CanonMapping::identity(5);
        assert_valid(&mapping, 5);
        assert!(mapping.pairs().iter().enumerate().all(|(i, p)| p.other == i && p.gain == 0.0));
        assert_eq!(mapping.audible_count(), 0);
    }

    #[test]
    fn test_fold_by_section_gain_set() {
        let track = testutil::sectioned_track(100, 4);
        let table = NeighborTable::compute(&track, false);
        let mapping = CanonMapping::for_track(&track, &table);
        assert_valid(&mapping, 100);
        for pair in mapping.pairs() {
            assert!(
                [0.0, 0.15, 0.5, 0.9].contains(&pair.gain),
                "unexpected gain {}",
                pair.gain
            );
        }
        // Twins sit a phrase apart, so most beats pair with a non-adjacent beat.
        assert!(mapping.pairs().iter().filter(|p| p.gain == 0.9).count() > 50);
    }

    #[test]
    fn test_fold_without_neighbors_uses_next_beat() {
        let mut payload = testutil::sectioned_payload(10, 1);
        payload.segments.clear();
        let track = Track::from_payload(payload, None, None).unwrap();
        let table = NeighborTable::compute(&track, false);
        let mapping = CanonMapping::fold_by_section(&track, &table);
        assert_valid(&mapping, 10);
        assert_eq!(mapping.get(3).unwrap().other, 4);
        assert_eq!(mapping.get(3).unwrap().gain, 0.15);
        let last = mapping.get(9).unwrap();
        assert_eq!((last.other, last.gain), (9, 0.0));
    }

    fn alignment(n: usize) -> CanonAlignment {
        CanonAlignment {
            pairs: (0..n).map(|i| Some(((i + 8) % n) as i64)).collect(),
            pair_similarity: (0..n).map(|i| Some(if i < n / 2 { 0.9 } else { 0.2 })).collect(),
            offset: 8,
            similarity_threshold: Some(0.5),
            ..Default::default()
        }
    }

    #[test]
    fn test_alignment_gains() {
        let mut align = alignment(20);
        align.pairs[3] = Some(99);
        align.segments = vec![AlignmentSegment {
            start: Some(0.0),
            end: Some(5.0),
            label: Some("fallback".into()),
            phase_alignment: Some(0.9),
            ..Default::default()
        }];
        let mapping = CanonMapping::from_alignment(&align, 20).unwrap();
        assert_valid(&mapping, 20);

        // Primary default label is absent outside segments: base 0.40.
        let p = mapping.get(6).unwrap();
        assert_eq!(p.other, 14);
        assert!((p.gain - (0.40 + 0.95 * 0.45)).abs() < 1e-9);

        // Fallback label with high phase alignment: 0.34 + 0.05.
        let p = mapping.get(1).unwrap();
        assert!((p.gain - (0.39 + 0.95 * 0.45)).abs() < 1e-9);
        assert_eq!(p.label.as_deref(), Some("fallback"));

        // Invalid pair index falls back to the offset with similarity 0.
        let p = mapping.get(3).unwrap();
        assert_eq!(p.other, 11);
        assert_eq!(p.gain, 0.0);

        // Below threshold is silent.
        assert_eq!(mapping.get(15).unwrap().gain, 0.0);
    }

    #[test]
    fn test_alignment_coverage_attenuates() {
        let mut align = alignment(10);
        align.coverage = Some(AlignmentCoverage { ratio: Some(0.5) });
        let mapping = CanonMapping::from_alignment(&align, 10).unwrap();
        let gain = mapping.get(0).unwrap().gain;
        assert!((gain - (0.40 * 0.92 + 0.95 * 0.45)).abs() < 1e-9);
    }

    #[test]
    fn test_alignment_length_mismatch_falls_back() {
        let align = alignment(10);
        assert!(CanonMapping::from_alignment(&align, 12).is_none());

        let mut payload = testutil::sectioned_payload(12, 1);
        payload.canon_alignment = Some(align);
        let track = Track::from_payload(payload, None, None).unwrap();
        let table = NeighborTable::compute(&track, false);
        let mapping = CanonMapping::for_track(&track, &table);
        assert_eq!(mapping, CanonMapping::fold_by_section(&track, &table));
    }

    #[test]
    fn test_offset_of() {
        let mapping = CanonMapping::from_alignment(&alignment(20), 20).unwrap();
        assert_eq!(mapping.offset_of(2), Some(8));
        assert_eq!(mapping.offset_of(15), Some(-12));
        assert_eq!(mapping.offset_of(20), None);
    }
}

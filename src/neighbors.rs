//! Per-beat acoustic neighbor search.
//!
//! For every beat, all other beats are ranked by a weighted feature distance
//! plus structural penalties; the nearest few become overlay partners and the
//! fallback jump graph.

use rayon::prelude::*;

use crate::analysis::{Beat, CanonAlignment, Segment, Track, candidates::valid_index};

const TIMBRE_WEIGHT: f64 = 1.0;
const PITCH_WEIGHT: f64 = 10.0;
const LOUDNESS_START_WEIGHT: f64 = 1.0;
const LOUDNESS_MAX_WEIGHT: f64 = 1.0;
const DURATION_WEIGHT: f64 = 100.0;
const CONFIDENCE_WEIGHT: f64 = 1.0;

/// Distance charged when the candidate has no segment at a query position.
const MISSING_SEGMENT_DISTANCE: f64 = 100.0;
const PARENT_PENALTY: f64 = 120.0;
const SECTION_PENALTY: f64 = 420.0;
const TIME_PENALTY_SCALE: f64 = 70.0;
/// Beats closer than this in index are charged a flow penalty.
const FLOW_SPREAD: usize = 5;
const FLOW_PENALTY: f64 = 22.0;

pub const DEFAULT_MAX_NEIGHBORS: usize = 10;
pub const ADVANCED_MAX_NEIGHBORS: usize = 20;

const GOOD_NEIGHBOR_CUSHION: f64 = 28.0;
const GOOD_NEIGHBOR_FALLBACK: usize = 6;

const AUGMENTED_NEIGHBOR_CAP: usize = 12;
const AUGMENTED_GOOD_CAP: usize = 8;

/// Reported for beats with no neighbors at all.
pub const NO_SIM_DISTANCE: f64 = 10_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub beat: usize,
    pub distance: f64,
}

/// Ranked neighbors of one beat.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BeatNeighbors {
    /// Nearest first, at most the table's `max_neighbors`.
    pub neighbors: Vec<Neighbor>,
    /// Same-section neighbors close to the best one.
    pub good_neighbors: Vec<Neighbor>,
    pub sim: Option<usize>,
    pub sim_distance: f64,
}

/// Components of a beat-to-beat distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceBreakdown {
    /// Mean per-segment feature distance.
    pub segment: f64,
    pub parent_penalty: f64,
    pub section_penalty: f64,
    pub time_penalty: f64,
    pub flow_penalty: f64,
}

impl DistanceBreakdown {
    /// Acoustic part: features plus the bar-position penalty.
    pub fn base(&self) -> f64 {
        self.segment + self.parent_penalty
    }

    pub fn total(&self) -> f64 {
        self.base() + self.section_penalty + self.time_penalty + self.flow_penalty
    }
}

/// Neighbor lists for every beat of one track.
#[derive(Debug, Clone, Default)]
pub struct NeighborTable {
    beats: Vec<BeatNeighbors>,
    pub max_neighbors: usize,
}

impl NeighborTable {
    /// Compute neighbors for every beat. `advanced` widens the candidate pool
    /// used by the advanced canon re-mapping.
    pub fn compute(track: &Track, advanced: bool) -> Self {
        let max_neighbors = if advanced {
            ADVANCED_MAX_NEIGHBORS
        } else {
            DEFAULT_MAX_NEIGHBORS
        };

        let beats: Vec<BeatNeighbors> = (0..track.len())
            .into_par_iter()
            .map(|i| neighbors_for_beat(track, i, max_neighbors))
            .collect();

        let with_sim = beats.iter().filter(|b| b.sim.is_some()).count();
        log::debug!(
            "Computed neighbors for {} beats ({} with a nearest match, k={})",
            beats.len(),
            with_sim,
            max_neighbors
        );

        Self {
            beats,
            max_neighbors,
        }
    }

    pub fn get(&self, which: usize) -> Option<&BeatNeighbors> {
        self.beats.get(which)
    }

    pub fn neighbors(&self, which: usize) -> &[Neighbor] {
        self.beats
            .get(which)
            .map(|b| b.neighbors.as_slice())
            .unwrap_or(&[])
    }

    pub fn good_neighbors(&self, which: usize) -> &[Neighbor] {
        self.beats
            .get(which)
            .map(|b| b.good_neighbors.as_slice())
            .unwrap_or(&[])
    }

    pub fn sim(&self, which: usize) -> Option<usize> {
        self.beats.get(which).and_then(|b| b.sim)
    }

    pub fn len(&self) -> usize {
        self.beats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beats.is_empty()
    }

    /// Inject the alignment's loop edges and transitions as extra neighbors,
    /// then re-rank, de-duplicate and cap every list.
    pub fn augment_with_alignment(&mut self, alignment: &CanonAlignment) {
        if alignment.transitions.is_empty() {
            return;
        }
        let n = self.beats.len();
        let threshold = alignment.threshold();

        for edge in &alignment.loop_candidates {
            let (Some(src), Some(dst)) = (edge.source, edge.target) else {
                continue;
            };
            let (Some(src), Some(dst)) = (valid_index(src, n), valid_index(dst, n)) else {
                continue;
            };
            let sim = edge.similarity.unwrap_or(0.0);
            if sim < threshold * 0.9 {
                continue;
            }
            let entry = Neighbor {
                beat: dst,
                distance: alignment_distance(sim),
            };
            self.beats[src].neighbors.push(entry);
            self.beats[src].good_neighbors.push(entry);
        }

        for tr in &alignment.transitions {
            let (Some(src), Some(dst)) = (tr.source, tr.target) else {
                continue;
            };
            let (Some(src), Some(dst)) = (valid_index(src, n), valid_index(dst, n)) else {
                continue;
            };
            if src == dst {
                continue;
            }
            let entry = Neighbor {
                beat: dst,
                distance: alignment_distance(tr.similarity.unwrap_or(0.0)),
            };
            let beat = &mut self.beats[src];
            beat.neighbors.push(entry);
            if !beat.good_neighbors.iter().any(|g| g.beat == dst) {
                beat.good_neighbors.push(entry);
            }
        }

        for beat in &mut self.beats {
            beat.neighbors = rank_unique(&beat.neighbors, AUGMENTED_NEIGHBOR_CAP);
            beat.good_neighbors = rank_unique(&beat.good_neighbors, AUGMENTED_GOOD_CAP);
        }
    }
}

fn alignment_distance(similarity: f64) -> f64 {
    let norm = ((similarity + 1.0) / 2.0).clamp(0.0, 1.0);
    (12.0 + (1.0 - norm) * 120.0).max(4.0)
}

fn rank_unique(list: &[Neighbor], cap: usize) -> Vec<Neighbor> {
    let mut sorted = list.to_vec();
    sort_by_distance(&mut sorted);
    let mut out: Vec<Neighbor> = Vec::with_capacity(cap.min(sorted.len()));
    for entry in sorted {
        if out.len() >= cap {
            break;
        }
        if out.iter().any(|e| e.beat == entry.beat) {
            continue;
        }
        out.push(entry);
    }
    out
}

fn sort_by_distance(list: &mut [Neighbor]) {
    list.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Rank every other beat against `which`.
fn neighbors_for_beat(track: &Track, which: usize, max_neighbors: usize) -> BeatNeighbors {
    let q1 = &track.beats[which];
    if q1.segments.is_empty() {
        return BeatNeighbors {
            sim_distance: NO_SIM_DISTANCE,
            ..Default::default()
        };
    }

    let mut neighbors: Vec<Neighbor> = track
        .beats
        .iter()
        .filter(|q2| q2.which != which)
        .filter_map(|q2| {
            let total = distance_breakdown(track, q1, q2)?.total();
            (total > 0.0).then_some(Neighbor {
                beat: q2.which,
                distance: total,
            })
        })
        .collect();

    for cand in track.server_candidates.for_source(which) {
        let norm = ((cand.similarity + 1.0) / 2.0).clamp(0.0, 1.0);
        let sim_distance = (14.0 + (1.0 - norm) * 140.0).max(4.0);
        match neighbors.iter_mut().find(|n| n.beat == cand.target) {
            Some(existing) => existing.distance = existing.distance.min(sim_distance),
            None => neighbors.push(Neighbor {
                beat: cand.target,
                distance: sim_distance,
            }),
        }
    }

    sort_by_distance(&mut neighbors);
    neighbors.truncate(max_neighbors);

    let Some(best) = neighbors.first().copied() else {
        return BeatNeighbors {
            sim_distance: NO_SIM_DISTANCE,
            ..Default::default()
        };
    };

    let threshold = best.distance + GOOD_NEIGHBOR_CUSHION;
    let mut good: Vec<Neighbor> = neighbors
        .iter()
        .filter(|n| n.distance <= threshold && track.beats[n.beat].section == q1.section)
        .copied()
        .collect();
    if good.is_empty() {
        good = neighbors
            .iter()
            .take(GOOD_NEIGHBOR_FALLBACK)
            .copied()
            .collect();
    }

    BeatNeighbors {
        neighbors,
        good_neighbors: good,
        sim: Some(best.beat),
        sim_distance: best.distance,
    }
}

/// Full distance between two beats, or `None` when the query beat has no
/// overlapping segments (its distance to anything is undefined).
pub fn distance_breakdown(track: &Track, q1: &Beat, q2: &Beat) -> Option<DistanceBreakdown> {
    if q1.segments.is_empty() {
        return None;
    }

    let mut sum = 0.0;
    for (j, &seg1) in q1.segments.iter().enumerate() {
        let d = match (track.segments.get(seg1), q2.segments.get(j).and_then(|&s| track.segments.get(s))) {
            (Some(a), Some(b)) => segment_distance(a, b),
            _ => MISSING_SEGMENT_DISTANCE,
        };
        sum += d;
    }
    let segment = sum / q1.segments.len() as f64;
    if !segment.is_finite() {
        return None;
    }

    let parent_penalty = if q1.index_in_parent == q2.index_in_parent {
        0.0
    } else {
        PARENT_PENALTY
    };
    let section_penalty = if q1.section != q2.section {
        SECTION_PENALTY
    } else {
        0.0
    };
    let time_penalty = if track.duration > 0.0 {
        (q1.start - q2.start).abs() / track.duration * TIME_PENALTY_SCALE
    } else {
        0.0
    };
    let spread = q1.which.abs_diff(q2.which);
    let flow_penalty = FLOW_SPREAD.saturating_sub(spread) as f64 * FLOW_PENALTY;

    Some(DistanceBreakdown {
        segment,
        parent_penalty,
        section_penalty,
        time_penalty,
        flow_penalty,
    })
}

/// Weighted feature distance between two segments.
pub fn segment_distance(a: &Segment, b: &Segment) -> f64 {
    euclidean_distance(&a.timbre, &b.timbre) * TIMBRE_WEIGHT
        + euclidean_distance(&a.pitches, &b.pitches) * PITCH_WEIGHT
        + (a.loudness_start - b.loudness_start).abs() * LOUDNESS_START_WEIGHT
        + (a.loudness_max - b.loudness_max).abs() * LOUDNESS_MAX_WEIGHT
        + (a.duration - b.duration).abs() * DURATION_WEIGHT
        + (a.confidence - b.confidence).abs() * CONFIDENCE_WEIGHT
}

fn euclidean_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (y - x) * (y - x))
        .sum::<f64>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::payload::RawLoopCandidate;
    use crate::testutil;

    #[test]
    fn test_identical_segments_isolate_penalties() {
        let track = testutil::sectioned_track(64, 1);
        // Beats 0 and 16 share phrase features, bar position and section.
        let d = distance_breakdown(&track, &track.beats[0], &track.beats[16]).unwrap();
        assert!(d.segment.abs() < 1e-12);
        assert_eq!(d.parent_penalty, 0.0);
        assert_eq!(d.section_penalty, 0.0);
        assert_eq!(d.flow_penalty, 0.0);
        assert!((d.base() - 0.0).abs() < 1e-12);
        let expected_time = 16.0 * testutil::BEAT_SECONDS / track.duration * 70.0;
        assert!((d.total() - expected_time).abs() < 1e-9);
    }

    #[test]
    fn test_flow_and_section_penalties() {
        let track = testutil::sectioned_track(32, 2);
        let near = distance_breakdown(&track, &track.beats[2], &track.beats[4]).unwrap();
        assert!((near.flow_penalty - 3.0 * 22.0).abs() < 1e-12);

        let cross = distance_breakdown(&track, &track.beats[0], &track.beats[16]).unwrap();
        assert_eq!(cross.section_penalty, 420.0);
    }

    #[test]
    fn test_segment_distance_weights() {
        let a = Segment {
            start: 0.0,
            duration: 0.5,
            confidence: 0.5,
            loudness_start: -10.0,
            loudness_max: -5.0,
            pitches: vec![0.0, 0.0],
            timbre: vec![0.0, 0.0, 0.0],
        };
        let mut b = a.clone();
        b.pitches = vec![1.0, 0.0];
        b.duration = 0.51;
        let d = segment_distance(&a, &b);
        assert!((d - (10.0 + 1.0)).abs() < 1e-9);
    }

    #[test]
    fn test_neighbors_sorted_truncated_and_same_section() {
        let track = testutil::sectioned_track(64, 2);
        let table = NeighborTable::compute(&track, false);
        for which in 0..track.len() {
            let list = table.neighbors(which);
            assert!(list.len() <= DEFAULT_MAX_NEIGHBORS);
            assert!(list.windows(2).all(|w| w[0].distance <= w[1].distance));
            assert!(list.iter().all(|n| n.beat != which));
        }
        // The acoustic twin one phrase later wins.
        assert_eq!(table.sim(0), Some(8));
        let good = table.good_neighbors(0);
        assert!(good.iter().all(|n| track.beats[n.beat].section == 0));
    }

    #[test]
    fn test_advanced_mode_widens_pool() {
        let track = testutil::sectioned_track(64, 1);
        let table = NeighborTable::compute(&track, true);
        assert_eq!(table.max_neighbors, ADVANCED_MAX_NEIGHBORS);
        assert_eq!(table.neighbors(0).len(), ADVANCED_MAX_NEIGHBORS);
    }

    #[test]
    fn test_beat_without_segments_has_no_neighbors() {
        let mut payload = testutil::sectioned_payload(16, 1);
        payload.segments.remove(3);
        let track = Track::from_payload(payload, None, None).unwrap();
        let table = NeighborTable::compute(&track, false);
        let entry = table.get(3).unwrap();
        assert!(entry.neighbors.is_empty());
        assert_eq!(entry.sim, None);
        assert_eq!(entry.sim_distance, NO_SIM_DISTANCE);
    }

    #[test]
    fn test_server_edges_merge_as_synthetic_distance() {
        let track = testutil::track_with_edges(64, 4, &[(40, 3, 1.0)]);
        let table = NeighborTable::compute(&track, false);
        // Cross-section acoustic distance is > 420; the server edge gives 14.
        let list = table.neighbors(40);
        let pos = list.iter().position(|n| n.beat == 3).unwrap();
        assert!((list[pos].distance - 14.0).abs() < 1e-9);
        assert!(list.windows(2).all(|w| w[0].distance <= w[1].distance));
        // The in-section twin 8 beats back is closer than the merged edge.
        let twin = list.iter().position(|n| n.beat == 32).unwrap();
        assert!(twin < pos);
        assert_eq!(table.sim(40), Some(32));
    }

    #[test]
    fn test_augment_with_alignment() {
        let track = testutil::sectioned_track(32, 1);
        let mut table = NeighborTable::compute(&track, false);
        let alignment = CanonAlignment {
            similarity_threshold: Some(0.5),
            loop_candidates: vec![testutil::loop_edge(20, 2, 0.9)],
            transitions: vec![
                testutil::loop_edge(5, 30, 1.0),
                RawLoopCandidate {
                    source: Some(5),
                    target: Some(5),
                    similarity: Some(1.0),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        table.augment_with_alignment(&alignment);
        assert!(table.neighbors(20).iter().any(|n| n.beat == 2));
        let t = table.neighbors(5).iter().find(|n| n.beat == 30).unwrap();
        assert!((t.distance - 12.0).abs() < 1e-9);
        for which in 0..track.len() {
            assert!(table.neighbors(which).len() <= AUGMENTED_NEIGHBOR_CAP);
            assert!(table.good_neighbors(which).len() <= AUGMENTED_GOOD_CAP);
            assert!(table.neighbors(which).iter().all(|n| n.beat != which));
        }
    }
}

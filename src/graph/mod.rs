//! Loop-candidate graph for the jukebox modes.
//!
//! Edges come from the first non-empty tier:
//! 1. server loop candidates,
//! 2. canon-alignment loop candidates,
//! 3. backward `good_neighbors`,
//! 4. bridges between consecutive section anchors.
//!
//! A graph is built whole and never patched; owners swap in a new one.

pub mod settings;

use std::collections::HashSet;

use crate::analysis::{CandidateSource, Direction, Track, candidates::valid_index};
use crate::neighbors::NeighborTable;

pub use settings::{EdgeDirection, LoopSettings, LoopSettingsPatch, PatchEffect};

/// Tracks shorter than this get no retreat point.
const RETREAT_MIN_BEATS: usize = 40;
const RETREAT_SOURCE_FRAC: f64 = 0.85;
const RETREAT_FALLBACK_SOURCE_FRAC: f64 = 0.9;
const RETREAT_TARGET_FRAC: f64 = 0.3;
const RETREAT_EARLY_FRAC: f64 = 0.2;
const RETREAT_EARLY_BONUS: f64 = 0.1;
const RETREAT_ANCHOR_SIMILARITY: f64 = 0.45;

/// Distance at which a neighbor's synthesized similarity reaches 0.
const NEIGHBOR_DISTANCE_SCALE: f64 = 240.0;

#[derive(Debug, Clone, PartialEq)]
pub struct LoopEdge {
    pub source: usize,
    pub target: usize,
    pub similarity: f64,
    pub span: usize,
    pub direction: Direction,
    pub same_section: bool,
}

/// Which construction tier produced the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphTier {
    Server,
    Alignment,
    Neighbors,
    Bridges,
    Empty,
}

impl std::fmt::Display for GraphTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            GraphTier::Server => "server",
            GraphTier::Alignment => "alignment",
            GraphTier::Neighbors => "neighbors",
            GraphTier::Bridges => "bridges",
            GraphTier::Empty => "empty",
        };
        f.write_str(name)
    }
}

/// Forced jump from the end of the track back to its beginning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetreatPoint {
    pub source: usize,
    pub target: usize,
    pub similarity: f64,
}

/// Arc handed to the visualization layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisualEdge {
    pub source: usize,
    pub target: usize,
    pub similarity: f64,
}

#[derive(Debug, Clone)]
pub struct LoopGraph {
    edges: Vec<Vec<LoopEdge>>,
    tier: GraphTier,
    anchors: Vec<usize>,
    retreat: Option<RetreatPoint>,
}

/// A candidate before it is turned into an edge.
struct RawEdge {
    source: usize,
    target: usize,
    similarity: f64,
    direction: Option<Direction>,
}

impl LoopGraph {
    /// Build the graph for `track` with the given settings.
    pub fn build(track: &Track, neighbors: &NeighborTable, settings: &LoopSettings) -> Self {
        let n = track.len();
        let anchors = track.section_anchors();

        let tiers: [(GraphTier, Vec<RawEdge>); 4] = [
            (GraphTier::Server, server_edges(track, settings)),
            (GraphTier::Alignment, alignment_edges(track, settings)),
            (GraphTier::Neighbors, neighbor_edges(track, neighbors, settings)),
            (GraphTier::Bridges, bridge_edges(&anchors, settings)),
        ];

        let mut graph = LoopGraph {
            edges: vec![Vec::new(); n],
            tier: GraphTier::Empty,
            anchors,
            retreat: None,
        };

        for (tier, raw) in tiers {
            let mut seen = HashSet::new();
            let mut added = 0;
            for edge in raw {
                if !seen.insert((edge.source, edge.target)) {
                    continue;
                }
                if graph.register(track, edge, settings.min_loop_beats) {
                    added += 1;
                }
            }
            if added > 0 {
                graph.tier = tier;
                break;
            }
        }

        graph.retreat = graph.find_retreat_point();

        match graph.tier {
            GraphTier::Server | GraphTier::Alignment => log::info!(
                "Built loop graph: {} edges from {} tier (min span {}, threshold {:.2})",
                graph.edge_count(),
                graph.tier,
                settings.min_loop_beats,
                settings.loop_threshold
            ),
            GraphTier::Neighbors | GraphTier::Bridges => log::warn!(
                "No usable loop candidates, falling back to {} tier ({} edges)",
                graph.tier,
                graph.edge_count()
            ),
            GraphTier::Empty => {
                log::warn!("Loop graph is empty; playback will stay sequential")
            }
        }
        if let Some(r) = graph.retreat {
            log::debug!(
                "Retreat point {} -> {} (similarity {:.3})",
                r.source,
                r.target,
                r.similarity
            );
        }

        graph
    }

    /// Validate and insert one edge. Returns false when it was rejected.
    fn register(&mut self, track: &Track, raw: RawEdge, min_loop_beats: usize) -> bool {
        let n = self.edges.len();
        if raw.source >= n || raw.target >= n || raw.source == raw.target {
            return false;
        }
        let span = raw.source.abs_diff(raw.target);
        if span < min_loop_beats {
            return false;
        }
        self.edges[raw.source].push(LoopEdge {
            source: raw.source,
            target: raw.target,
            similarity: raw.similarity,
            span,
            direction: raw
                .direction
                .unwrap_or_else(|| Direction::between(raw.source, raw.target)),
            same_section: track.same_section(raw.source, raw.target),
        });
        true
    }

    pub fn tier(&self) -> GraphTier {
        self.tier
    }

    pub fn is_empty(&self) -> bool {
        self.edges.iter().all(Vec::is_empty)
    }

    pub fn edge_count(&self) -> usize {
        self.edges.iter().map(Vec::len).sum()
    }

    pub fn num_beats(&self) -> usize {
        self.edges.len()
    }

    /// Outgoing edges of `source`.
    pub fn edges_from(&self, source: usize) -> &[LoopEdge] {
        self.edges.get(source).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every edge, grouped by source in ascending order.
    pub fn edges(&self) -> impl Iterator<Item = &LoopEdge> {
        self.edges.iter().flatten()
    }

    /// First beat of each section, ascending.
    pub fn anchors(&self) -> &[usize] {
        &self.anchors
    }

    pub fn retreat_point(&self) -> Option<RetreatPoint> {
        self.retreat
    }

    /// Retained loops for rendering, best first.
    pub fn visualization_loops(&self, limit: usize) -> Vec<VisualEdge> {
        let edges = self
            .edges()
            .map(|e| VisualEdge {
                source: e.source,
                target: e.target,
                similarity: e.similarity,
            })
            .collect();
        rank_visual(edges, limit)
    }

    fn find_retreat_point(&self) -> Option<RetreatPoint> {
        let n = self.edges.len();
        if n < RETREAT_MIN_BEATS {
            return None;
        }
        let end_zone = (n as f64 * RETREAT_SOURCE_FRAC).floor() as usize;
        let start_zone = (n as f64 * RETREAT_TARGET_FRAC).floor() as usize;
        let early = (n as f64 * RETREAT_EARLY_FRAC).floor() as usize;

        let mut best: Option<RetreatPoint> = None;
        let mut best_score = f64::NEG_INFINITY;
        for source in end_zone..n {
            for edge in &self.edges[source] {
                if edge.target >= start_zone {
                    continue;
                }
                let bonus = if edge.target < early {
                    RETREAT_EARLY_BONUS
                } else {
                    0.0
                };
                let score = edge.similarity + bonus;
                if score > best_score {
                    best_score = score;
                    best = Some(RetreatPoint {
                        source,
                        target: edge.target,
                        similarity: edge.similarity,
                    });
                }
            }
        }
        if best.is_some() {
            return best;
        }

        let very_end = (n as f64 * RETREAT_FALLBACK_SOURCE_FRAC).floor() as usize;
        for source in very_end..n {
            for edge in &self.edges[source] {
                if edge.target >= start_zone {
                    continue;
                }
                if best.is_none_or(|b| edge.similarity > b.similarity) {
                    best = Some(RetreatPoint {
                        source,
                        target: edge.target,
                        similarity: edge.similarity,
                    });
                }
            }
        }
        if best.is_some() {
            return best;
        }

        if self.anchors.len() > 2 {
            let first = self.anchors[0];
            let last = self.anchors[self.anchors.len() - 1];
            if last > end_zone && first < start_zone {
                return Some(RetreatPoint {
                    source: last,
                    target: first,
                    similarity: RETREAT_ANCHOR_SIMILARITY,
                });
            }
        }
        None
    }
}

/// Server candidate map as arcs, used when no graph exists (canon modes).
pub fn server_visualization_loops(track: &Track, limit: usize) -> Vec<VisualEdge> {
    let edges = track
        .server_candidates
        .iter()
        .filter(|(src, c)| *src != c.target)
        .map(|(source, c)| VisualEdge {
            source,
            target: c.target,
            similarity: c.similarity,
        })
        .collect();
    rank_visual(edges, limit)
}

fn rank_visual(mut edges: Vec<VisualEdge>, limit: usize) -> Vec<VisualEdge> {
    // Stable sort keeps source order among equal similarities.
    edges.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    if limit > 0 {
        edges.truncate(limit);
    }
    edges
}

fn server_edges(track: &Track, settings: &LoopSettings) -> Vec<RawEdge> {
    track
        .server_candidates
        .iter()
        .filter(|(src, c)| match settings.direction {
            EdgeDirection::Bidirectional => true,
            EdgeDirection::BackwardOnly => c.target < *src,
        })
        .filter(|(_, c)| c.similarity >= settings.loop_threshold)
        .map(|(source, c)| RawEdge {
            source,
            target: c.target,
            similarity: c.similarity,
            direction: match track.server_candidates.source {
                CandidateSource::Eternal => c.direction,
                _ => None,
            },
        })
        .collect()
}

fn alignment_edges(track: &Track, settings: &LoopSettings) -> Vec<RawEdge> {
    let Some(alignment) = &track.canon_alignment else {
        return Vec::new();
    };
    let n = track.len();
    let threshold = alignment.threshold();
    let mut out = Vec::new();
    for edge in &alignment.loop_candidates {
        let (Some(src), Some(dst)) = (edge.source, edge.target) else {
            continue;
        };
        let (Some(src), Some(dst)) = (valid_index(src, n), valid_index(dst, n)) else {
            continue;
        };
        let similarity = edge.similarity.unwrap_or(0.0);
        if similarity < threshold || similarity < settings.loop_threshold {
            continue;
        }
        out.push(RawEdge {
            source: src,
            target: dst,
            similarity,
            direction: None,
        });
        if dst > src {
            out.push(RawEdge {
                source: dst,
                target: src,
                similarity,
                direction: None,
            });
        }
    }
    out
}

fn neighbor_edges(track: &Track, neighbors: &NeighborTable, settings: &LoopSettings) -> Vec<RawEdge> {
    let mut out: Vec<RawEdge> = (0..track.len())
        .flat_map(|src| {
            neighbors
                .good_neighbors(src)
                .iter()
                .filter(move |nb| nb.beat < src && src - nb.beat >= settings.min_loop_beats)
                .map(move |nb| RawEdge {
                    source: src,
                    target: nb.beat,
                    similarity: 1.0 - (nb.distance / NEIGHBOR_DISTANCE_SCALE).min(1.0),
                    direction: Some(Direction::Backward),
                })
        })
        .collect();
    out.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    out
}

fn bridge_edges(anchors: &[usize], settings: &LoopSettings) -> Vec<RawEdge> {
    anchors
        .windows(2)
        .enumerate()
        .filter(|(_, pair)| pair[1] - pair[0] >= settings.min_loop_beats)
        .map(|(i, pair)| RawEdge {
            source: pair[1],
            target: pair[0],
            similarity: 0.25 + ((i + 1) % 4) as f64 * 0.05,
            direction: Some(Direction::Backward),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn build(track: &Track, settings: &LoopSettings) -> LoopGraph {
        let table = NeighborTable::compute(track, false);
        LoopGraph::build(track, &table, settings)
    }

    fn edge_set(graph: &LoopGraph) -> Vec<(usize, usize, u64)> {
        graph
            .edges()
            .map(|e| (e.source, e.target, e.similarity.to_bits()))
            .collect()
    }

    #[test]
    fn test_server_tier_filters_threshold_span_and_self_loops() {
        let track = testutil::track_with_edges(
            200,
            4,
            &[(150, 20, 0.9), (100, 95, 0.95), (60, 60, 0.99), (30, 120, 0.7), (40, 10, 0.3)],
        );
        let graph = build(&track, &LoopSettings::default());
        assert_eq!(graph.tier(), GraphTier::Server);
        let edges: Vec<_> = graph.edges().map(|e| (e.source, e.target)).collect();
        assert_eq!(edges, vec![(30, 120), (150, 20)]);
        let forward = &graph.edges_from(30)[0];
        assert_eq!(forward.direction, Direction::Forward);
        assert_eq!(forward.span, 90);
        assert!(!forward.same_section);
    }

    #[test]
    fn test_backward_only_policy() {
        let track = testutil::track_with_edges(200, 4, &[(150, 20, 0.9), (30, 120, 0.7)]);
        let settings = LoopSettings {
            direction: EdgeDirection::BackwardOnly,
            ..Default::default()
        };
        let graph = build(&track, &settings);
        assert_eq!(graph.edge_count(), 1);
        assert!(graph.edges().all(|e| e.target < e.source));
    }

    #[test]
    fn test_invariants_hold_on_every_tier() {
        let settings = LoopSettings::default();
        for track in [
            testutil::track_with_edges(120, 4, &[(100, 10, 0.9)]),
            testutil::sectioned_track(120, 4),
            testutil::sectioned_track(120, 1),
        ] {
            let graph = build(&track, &settings);
            for e in graph.edges() {
                assert_ne!(e.source, e.target);
                assert!(e.source < track.len() && e.target < track.len());
                assert!(e.span >= settings.min_loop_beats);
                assert_eq!(e.same_section, track.same_section(e.source, e.target));
            }
        }
    }

    #[test]
    fn test_neighbor_tier_is_backward() {
        let track = testutil::sectioned_track(96, 1);
        let graph = build(&track, &LoopSettings::default());
        assert_eq!(graph.tier(), GraphTier::Neighbors);
        assert!(!graph.is_empty());
        for e in graph.edges() {
            assert!(e.target < e.source);
            assert!((0.0..=1.0).contains(&e.similarity));
        }
    }

    #[test]
    fn test_bridge_tier_when_nothing_else() {
        // No segments: no neighbors, so only anchors remain.
        let mut payload = testutil::sectioned_payload(100, 4);
        payload.segments.clear();
        let track = Track::from_payload(payload, None, None).unwrap();
        let graph = build(&track, &LoopSettings::default());
        assert_eq!(graph.tier(), GraphTier::Bridges);
        let edges: Vec<_> = graph.edges().map(|e| (e.source, e.target)).collect();
        assert_eq!(edges, vec![(25, 0), (50, 25), (75, 50)]);
        assert!((graph.edges_from(25)[0].similarity - 0.30).abs() < 1e-12);
    }

    #[test]
    fn test_empty_graph() {
        let mut payload = testutil::sectioned_payload(20, 1);
        payload.segments.clear();
        let track = Track::from_payload(payload, None, None).unwrap();
        let graph = build(&track, &LoopSettings::default());
        assert_eq!(graph.tier(), GraphTier::Empty);
        assert!(graph.is_empty());
        assert!(graph.retreat_point().is_none());
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let track = testutil::track_with_edges(200, 4, &[(150, 20, 0.9), (180, 5, 0.8), (90, 140, 0.6)]);
        let table = NeighborTable::compute(&track, false);
        let settings = LoopSettings::default();
        let a = LoopGraph::build(&track, &table, &settings);
        let b = LoopGraph::build(&track, &table, &settings);
        assert_eq!(edge_set(&a), edge_set(&b));

        let plain = testutil::sectioned_track(96, 2);
        let table = NeighborTable::compute(&plain, false);
        let a = LoopGraph::build(&plain, &table, &settings);
        let b = LoopGraph::build(&plain, &table, &settings);
        assert_eq!(edge_set(&a), edge_set(&b));
    }

    #[test]
    fn test_retreat_prefers_early_targets() {
        let track = testutil::track_with_edges(500, 5, &[(480, 50, 0.8), (460, 140, 0.85), (470, 400, 0.99)]);
        let graph = build(&track, &LoopSettings::default());
        let retreat = graph.retreat_point().unwrap();
        assert_eq!((retreat.source, retreat.target), (480, 50));
    }

    #[test]
    fn test_retreat_anchor_fallback() {
        let track = testutil::track_with_edges(100, 4, &[(40, 10, 0.9)]);
        let graph = build(&track, &LoopSettings::default());
        // Last anchor (75) is before the end zone (85), so no anchor retreat.
        assert!(graph.retreat_point().is_none());

        let track = testutil::track_with_edges(100, 10, &[(40, 10, 0.9)]);
        let graph = build(&track, &LoopSettings::default());
        let retreat = graph.retreat_point().unwrap();
        assert_eq!((retreat.source, retreat.target), (90, 0));
        assert_eq!(retreat.similarity, 0.45);
    }

    #[test]
    fn test_alignment_tier_adds_reverse_edges() {
        let mut payload = testutil::sectioned_payload(100, 2);
        payload.canon_alignment = Some(crate::analysis::CanonAlignment {
            similarity_threshold: Some(0.6),
            ..Default::default()
        });
        let mut track = Track::from_payload(payload, None, None).unwrap();
        if let Some(alignment) = track.canon_alignment.as_mut() {
            alignment.loop_candidates = vec![
                testutil::loop_edge(10, 60, 0.9),
                testutil::loop_edge(80, 20, 0.5),
            ];
        }
        let graph = build(&track, &LoopSettings::default());
        assert_eq!(graph.tier(), GraphTier::Alignment);
        let edges: Vec<_> = graph.edges().map(|e| (e.source, e.target)).collect();
        assert_eq!(edges, vec![(10, 60), (60, 10)]);
    }

    #[test]
    fn test_visualization_loops_sorted_and_capped() {
        let track = testutil::track_with_edges(200, 4, &[(150, 20, 0.9), (180, 5, 0.8), (90, 140, 0.95)]);
        let graph = build(&track, &LoopSettings::default());
        let arcs = graph.visualization_loops(2);
        assert_eq!(arcs.len(), 2);
        assert_eq!((arcs[0].source, arcs[0].target), (90, 140));
        assert_eq!((arcs[1].source, arcs[1].target), (150, 20));

        let arcs = server_visualization_loops(&track, 10);
        assert_eq!(arcs.len(), 3);
        assert!(arcs.windows(2).all(|w| w[0].similarity >= w[1].similarity));
    }
}

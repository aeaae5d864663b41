use std::collections::BTreeMap;

use super::payload::{AnalysisPayload, RawLoopCandidate};

/// Maximum server candidates kept per source beat.
const MAX_PER_SOURCE: usize = 16;

/// Which way a jump moves along the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn between(source: usize, target: usize) -> Self {
        if target < source {
            Direction::Backward
        } else {
            Direction::Forward
        }
    }

    fn parse(raw: Option<&str>) -> Option<Self> {
        match raw {
            Some("forward") => Some(Direction::Forward),
            Some("backward") => Some(Direction::Backward),
            _ => None,
        }
    }
}

/// Where the server candidate map was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSource {
    /// `eternal_loop_candidates`: circular timeline, both directions.
    Eternal,
    /// `loop_candidates` or `canon_alignment.loop_candidates`.
    Canon,
    None,
}

/// One server-suggested jump out of a source beat.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerCandidate {
    pub target: usize,
    pub similarity: f64,
    pub span: Option<i64>,
    pub direction: Option<Direction>,
}

/// Server loop candidates grouped by source beat.
#[derive(Debug, Clone)]
pub struct CandidateMap {
    pub source: CandidateSource,
    entries: BTreeMap<usize, Vec<ServerCandidate>>,
}

impl Default for CandidateMap {
    fn default() -> Self {
        Self {
            source: CandidateSource::None,
            entries: BTreeMap::new(),
        }
    }
}

impl CandidateMap {
    /// Build the map from the payload, keeping only indices inside
    /// `0..num_beats`. Eternal candidates win; canon lists are the fallback.
    pub fn from_payload(payload: &AnalysisPayload, num_beats: usize) -> Self {
        let mut map = CandidateMap::default();

        if let Some(eternal) = &payload.eternal_loop_candidates {
            for (key, candidates) in eternal {
                let Ok(src) = key.trim().parse::<usize>() else {
                    continue;
                };
                if src >= num_beats {
                    continue;
                }
                for cand in candidates {
                    let (Some(target), Some(similarity)) = (cand.target, cand.similarity) else {
                        continue;
                    };
                    let Some(target) = valid_index(target, num_beats) else {
                        continue;
                    };
                    map.push(
                        src,
                        ServerCandidate {
                            target,
                            similarity,
                            span: cand.span.filter(|s| *s != 0),
                            direction: Direction::parse(cand.direction.as_deref())
                                .or(Some(Direction::Backward)),
                        },
                    );
                }
            }
            if !map.is_empty() {
                map.source = CandidateSource::Eternal;
            }
        }

        if map.is_empty() {
            let edges: &[RawLoopCandidate] = if !payload.loop_candidates.is_empty() {
                &payload.loop_candidates
            } else {
                payload
                    .canon_alignment
                    .as_ref()
                    .map(|a| a.loop_candidates.as_slice())
                    .unwrap_or(&[])
            };
            for edge in edges {
                let (Some(src), Some(dst)) = (edge.source, edge.target) else {
                    continue;
                };
                let (Some(src), Some(dst)) = (valid_index(src, num_beats), valid_index(dst, num_beats))
                else {
                    continue;
                };
                map.push(
                    src,
                    ServerCandidate {
                        target: dst,
                        similarity: edge.similarity.unwrap_or(0.0),
                        span: None,
                        direction: None,
                    },
                );
            }
            if !map.is_empty() {
                map.source = CandidateSource::Canon;
            }
        }

        for entries in map.entries.values_mut() {
            entries.sort_by(|a, b| {
                b.similarity
                    .partial_cmp(&a.similarity)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            entries.truncate(MAX_PER_SOURCE);
        }

        let total: usize = map.entries.values().map(Vec::len).sum();
        log::debug!(
            "Prepared {} server loop candidates across {} beats ({:?})",
            total,
            map.entries.len(),
            map.source
        );
        map
    }

    fn push(&mut self, src: usize, candidate: ServerCandidate) {
        self.entries.entry(src).or_default().push(candidate);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(Vec::is_empty)
    }

    /// Candidates leaving `src`, best first.
    pub fn for_source(&self, src: usize) -> &[ServerCandidate] {
        self.entries.get(&src).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All `(source, candidate)` pairs in source order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &ServerCandidate)> {
        self.entries
            .iter()
            .flat_map(|(src, list)| list.iter().map(move |c| (*src, c)))
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }
}

/// Convert a signed payload index to a beat index, rejecting out-of-range values.
pub fn valid_index(raw: i64, num_beats: usize) -> Option<usize> {
    usize::try_from(raw).ok().filter(|i| *i < num_beats)
}

//! Synthetic analysis fixtures shared by unit tests.

use crate::analysis::payload::{AnalysisPayload, RawBeat, RawLoopCandidate, RawSegment, TimeSpan};
use crate::analysis::Track;

pub const BEAT_SECONDS: f64 = 0.5;

/// Features repeat every 8 beats, so beat `i` and `i + 8` are acoustic twins.
fn phrase_segment(i: usize) -> RawSegment {
    let phrase = i % 8;
    let mut pitches = vec![0.0; 12];
    pitches[phrase % 12] = 1.0;
    RawSegment {
        start: i as f64 * BEAT_SECONDS,
        duration: BEAT_SECONDS,
        confidence: 0.8,
        loudness_start: -20.0 + phrase as f64,
        loudness_max: -10.0 + phrase as f64 * 0.5,
        pitches,
        timbre: vec![phrase as f64, phrase as f64 * 2.0, 1.0],
    }
}

/// `num_beats` half-second beats, equal sections, 4-beat bars, one segment per beat.
pub fn sectioned_payload(num_beats: usize, num_sections: usize) -> AnalysisPayload {
    let per_section = (num_beats / num_sections.max(1)).max(1);
    let sections = (0..num_sections)
        .map(|s| TimeSpan {
            start: (s * per_section) as f64 * BEAT_SECONDS,
            duration: per_section as f64 * BEAT_SECONDS,
            confidence: 1.0,
        })
        .collect();
    let bars = (0..num_beats.div_ceil(4))
        .map(|b| TimeSpan {
            start: (b * 4) as f64 * BEAT_SECONDS,
            duration: 4.0 * BEAT_SECONDS,
            confidence: 1.0,
        })
        .collect();
    let beats = (0..num_beats)
        .map(|i| RawBeat {
            start: i as f64 * BEAT_SECONDS,
            duration: BEAT_SECONDS,
            confidence: 0.9,
            loudness_max: None,
        })
        .collect();
    let segments = (0..num_beats).map(phrase_segment).collect();
    AnalysisPayload {
        sections,
        bars,
        beats,
        segments,
        ..Default::default()
    }
}

pub fn sectioned_track(num_beats: usize, num_sections: usize) -> Track {
    Track::from_payload(sectioned_payload(num_beats, num_sections), None, None)
        .expect("synthetic payload has beats")
}

pub fn loop_edge(source: usize, target: usize, similarity: f64) -> RawLoopCandidate {
    RawLoopCandidate {
        source: Some(source as i64),
        target: Some(target as i64),
        similarity: Some(similarity),
        ..Default::default()
    }
}

/// A sectioned track carrying explicit server loop candidates.
pub fn track_with_edges(
    num_beats: usize,
    num_sections: usize,
    edges: &[(usize, usize, f64)],
) -> Track {
    let mut payload = sectioned_payload(num_beats, num_sections);
    payload.loop_candidates = edges.iter().map(|&(s, t, sim)| loop_edge(s, t, sim)).collect();
    Track::from_payload(payload, None, None).expect("synthetic payload has beats")
}

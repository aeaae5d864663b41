//! Serde model of the precomputed analysis document.
//!
//! Every field that the analyzer may omit is optional or defaulted so that a
//! sparse document still loads; the track builder decides how to degrade.

use std::collections::BTreeMap;

use serde::Deserialize;

/// Top-level document: either the full profile wrapper written by the
/// analyzer, or a bare analysis object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Document {
    Profile { response: ProfileResponse },
    Bare(AnalysisPayload),
}

#[derive(Debug, Deserialize)]
pub struct ProfileResponse {
    pub track: ProfileTrack,
}

#[derive(Debug, Deserialize)]
pub struct ProfileTrack {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub audio_summary: Option<AudioSummary>,
    pub analysis: AnalysisPayload,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AudioSummary {
    pub duration: Option<f64>,
    pub tempo: Option<f64>,
}

/// The analysis body: time quanta, segments and optional loop/canon hints.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AnalysisPayload {
    pub sections: Vec<TimeSpan>,
    pub bars: Vec<TimeSpan>,
    pub beats: Vec<RawBeat>,
    pub segments: Vec<RawSegment>,
    pub loop_candidates: Vec<RawLoopCandidate>,
    /// Keyed by source beat index (as a string, JSON object keys).
    pub eternal_loop_candidates: Option<BTreeMap<String, Vec<RawLoopCandidate>>>,
    pub canon_alignment: Option<CanonAlignment>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimeSpan {
    pub start: f64,
    pub duration: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawBeat {
    pub start: f64,
    pub duration: f64,
    pub confidence: f64,
    pub loudness_max: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawSegment {
    pub start: f64,
    pub duration: f64,
    pub confidence: f64,
    pub loudness_start: f64,
    pub loudness_max: f64,
    pub pitches: Vec<f64>,
    pub timbre: Vec<f64>,
}

/// A loop/transition hint. Indices are signed so malformed negatives can be
/// rejected instead of failing the whole parse.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawLoopCandidate {
    pub source: Option<i64>,
    pub target: Option<i64>,
    pub similarity: Option<f64>,
    pub span: Option<i64>,
    pub direction: Option<String>,
    pub section_match: Option<bool>,
}

/// Server-computed canon alignment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CanonAlignment {
    pub pairs: Vec<Option<i64>>,
    pub pair_similarity: Vec<Option<f64>>,
    pub offset: i64,
    pub segments: Vec<AlignmentSegment>,
    pub similarity_threshold: Option<f64>,
    pub coverage: Option<AlignmentCoverage>,
    pub loop_candidates: Vec<RawLoopCandidate>,
    pub transitions: Vec<RawLoopCandidate>,
    pub start_index: Option<i64>,
}

impl CanonAlignment {
    /// Threshold below which a pairing is inaudible. Defaults to 0.5.
    pub fn threshold(&self) -> f64 {
        self.similarity_threshold.unwrap_or(0.5)
    }

    /// Similarity recorded for beat `i`, if any.
    pub fn similarity_at(&self, i: usize) -> Option<f64> {
        self.pair_similarity.get(i).copied().flatten()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AlignmentSegment {
    pub start: Option<f64>,
    pub end: Option<f64>,
    pub offset: Option<i64>,
    pub label: Option<String>,
    pub mean_similarity: Option<f64>,
    pub phase_alignment: Option<f64>,
    pub threshold: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AlignmentCoverage {
    pub ratio: Option<f64>,
}

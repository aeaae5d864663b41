//! Analysis payload loading and the in-memory track model.

pub mod candidates;
pub mod payload;

use std::path::Path;

use thiserror::Error;

pub use candidates::{CandidateMap, CandidateSource, Direction, ServerCandidate};
pub use payload::{AnalysisPayload, CanonAlignment, Document};

/// Tolerance when matching beat starts against bar/section boundaries.
const TIME_EPSILON: f64 = 1e-6;

/// Window used for the per-beat median volume.
const MEDIAN_VOLUME_WINDOW: usize = 20;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed analysis JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Analysis contains no beats")]
    NoBeats,
}

pub type Result<T> = std::result::Result<T, AnalysisError>;

/// Low-level acoustic feature bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub start: f64,
    pub duration: f64,
    pub confidence: f64,
    pub loudness_start: f64,
    pub loudness_max: f64,
    pub pitches: Vec<f64>,
    pub timbre: Vec<f64>,
}

/// A contiguous run of beats.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Section {
    pub start: f64,
    pub duration: f64,
}

/// One playable beat.
#[derive(Debug, Clone, PartialEq)]
pub struct Beat {
    pub which: usize,
    pub start: f64,
    pub duration: f64,
    pub confidence: f64,
    pub section: usize,
    /// Position inside the owning bar, when bars are known.
    pub index_in_parent: Option<usize>,
    pub loudness_max: Option<f64>,
    /// Indices into [`Track::segments`] of the segments overlapping this beat.
    pub segments: Vec<usize>,
    pub volume: f64,
    pub median_volume: f64,
}

impl Beat {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// A fully loaded track. Immutable once built; a new track replaces it whole.
#[derive(Debug, Clone)]
pub struct Track {
    pub title: Option<String>,
    pub duration: f64,
    pub beats: Vec<Beat>,
    pub sections: Vec<Section>,
    pub segments: Vec<Segment>,
    pub server_candidates: CandidateMap,
    pub canon_alignment: Option<CanonAlignment>,
}

impl Track {
    /// Load an analysis document from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let track = Self::from_json_str(&contents)?;
        log::info!(
            "Loaded {} ({} beats, {} sections, {:.1}s)",
            path.display(),
            track.beats.len(),
            track.sections.len(),
            track.duration
        );
        Ok(track)
    }

    /// Parse an analysis document from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let doc: Document = serde_json::from_str(json)?;
        Self::from_document(doc)
    }

    pub fn from_document(doc: Document) -> Result<Self> {
        match doc {
            Document::Profile { response } => {
                let track = response.track;
                let duration = track.audio_summary.and_then(|s| s.duration);
                Self::from_payload(track.analysis, track.title, duration)
            }
            Document::Bare(payload) => Self::from_payload(payload, None, None),
        }
    }

    /// Build the track: section/bar membership, overlapping segments, the
    /// last-beat duration cap and normalized volumes.
    pub fn from_payload(
        payload: AnalysisPayload,
        title: Option<String>,
        duration_hint: Option<f64>,
    ) -> Result<Self> {
        if payload.beats.is_empty() {
            return Err(AnalysisError::NoBeats);
        }

        let sections: Vec<Section> = payload
            .sections
            .iter()
            .map(|s| Section {
                start: s.start,
                duration: s.duration,
            })
            .collect();

        let segments: Vec<Segment> = payload
            .segments
            .iter()
            .map(|s| Segment {
                start: s.start,
                duration: s.duration,
                confidence: s.confidence,
                loudness_start: s.loudness_start,
                loudness_max: s.loudness_max,
                pitches: s.pitches.clone(),
                timbre: s.timbre.clone(),
            })
            .collect();

        let last_end = payload
            .beats
            .last()
            .map(|b| b.start + b.duration)
            .unwrap_or(0.0);
        let duration = duration_hint
            .filter(|d| d.is_finite() && *d > 0.0)
            .unwrap_or(last_end);

        let mut bar_counts = vec![0usize; payload.bars.len()];
        let mut beats: Vec<Beat> = payload
            .beats
            .iter()
            .enumerate()
            .map(|(which, raw)| {
                let index_in_parent = containing_span(&payload.bars, raw.start).map(|bar| {
                    let idx = bar_counts[bar];
                    bar_counts[bar] += 1;
                    idx
                });
                Beat {
                    which,
                    start: raw.start,
                    duration: raw.duration,
                    confidence: raw.confidence,
                    section: section_for(&sections, raw.start),
                    index_in_parent,
                    loudness_max: raw.loudness_max,
                    segments: Vec::new(),
                    volume: 0.0,
                    median_volume: 0.0,
                }
            })
            .collect();

        cap_last_beat(&mut beats, duration);

        for beat in &mut beats {
            beat.segments = overlapping_segments(&segments, beat.start, beat.end());
        }

        assign_normalized_volumes(&mut beats, &segments);

        let server_candidates = CandidateMap::from_payload(&payload, beats.len());
        let canon_alignment = payload.canon_alignment;

        Ok(Track {
            title,
            duration,
            beats,
            sections,
            segments,
            server_candidates,
            canon_alignment,
        })
    }

    pub fn len(&self) -> usize {
        self.beats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beats.is_empty()
    }

    /// Overlapping segments of a beat, in time order.
    pub fn segments_of(&self, beat: &Beat) -> impl Iterator<Item = &Segment> {
        beat.segments.iter().filter_map(|&i| self.segments.get(i))
    }

    /// Whether two beat indices belong to the same section.
    pub fn same_section(&self, a: usize, b: usize) -> bool {
        match (self.beats.get(a), self.beats.get(b)) {
            (Some(x), Some(y)) => x.section == y.section,
            _ => false,
        }
    }

    /// First beat index of each section, ascending.
    pub fn section_anchors(&self) -> Vec<usize> {
        let mut seen = std::collections::BTreeMap::new();
        for beat in &self.beats {
            seen.entry(beat.section).or_insert(beat.which);
        }
        let mut anchors: Vec<usize> = seen.into_values().collect();
        anchors.sort_unstable();
        anchors
    }
}

/// Section owning a time: the last section starting at or before it,
/// clamped to the final section. Tracks without sections use section 0.
fn section_for(sections: &[Section], start: f64) -> usize {
    if sections.is_empty() {
        return 0;
    }
    let idx = sections.partition_point(|s| s.start <= start + TIME_EPSILON);
    idx.saturating_sub(1).min(sections.len() - 1)
}

/// Index of the span (bar) whose range contains `start`.
fn containing_span(spans: &[payload::TimeSpan], start: f64) -> Option<usize> {
    let idx = spans
        .partition_point(|s| s.start <= start + TIME_EPSILON)
        .checked_sub(1)?;
    let span = &spans[idx];
    (start < span.start + span.duration - TIME_EPSILON).then_some(idx)
}

fn overlapping_segments(segments: &[Segment], start: f64, end: f64) -> Vec<usize> {
    segments
        .iter()
        .enumerate()
        .filter(|(_, s)| s.start < end - TIME_EPSILON && s.start + s.duration > start + TIME_EPSILON)
        .map(|(i, _)| i)
        .collect()
}

/// The analyzer tends to stretch the final beat to the end of the file;
/// cap it at 1.6x the median beat duration.
fn cap_last_beat(beats: &mut [Beat], duration: f64) {
    let Some((last, rest)) = beats.split_last_mut() else {
        return;
    };
    let remaining = (duration - last.start).max(0.1);
    let mut samples: Vec<f64> = rest.iter().map(|b| b.duration).collect();
    let cap = if samples.is_empty() {
        remaining
    } else {
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = samples[samples.len() / 2];
        if median > 0.0 { median * 1.6 } else { remaining }
    };
    last.duration = remaining.min(cap);
}

fn raw_volume(beat: &Beat, segments: &[Segment]) -> f64 {
    if let Some(v) = beat.loudness_max {
        return v;
    }
    if beat.segments.is_empty() {
        return -60.0;
    }
    let sum: f64 = beat
        .segments
        .iter()
        .filter_map(|&i| segments.get(i))
        .map(|s| s.loudness_max)
        .sum();
    sum / beat.segments.len() as f64
}

/// Normalize loudness into 0..1 and smooth it with a windowed median.
fn assign_normalized_volumes(beats: &mut [Beat], segments: &[Segment]) {
    let raw: Vec<f64> = beats.iter().map(|b| raw_volume(b, segments)).collect();

    // Seeded inverted so a track quieter than 0 dB still spans the range.
    let mut min_v = 0.0_f64;
    let mut max_v = -60.0_f64;
    for &v in &raw {
        max_v = max_v.max(v);
        min_v = min_v.min(v);
    }

    for (beat, &v) in beats.iter_mut().zip(&raw) {
        let norm = if (max_v - min_v).abs() < f64::EPSILON {
            min_v
        } else {
            (v - min_v) / (max_v - min_v)
        };
        beat.volume = norm.clamp(0.0, 1.0);
    }

    let volumes: Vec<f64> = beats.iter().map(|b| b.volume).collect();
    let half = MEDIAN_VOLUME_WINDOW / 2;
    for beat in beats.iter_mut() {
        let lo = beat.which.saturating_sub(half - 1);
        let hi = (beat.which + half).min(volumes.len() - 1);
        let mut window: Vec<f64> = volumes[lo..=hi].to_vec();
        window.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        beat.median_volume = window[window.len() / 2];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn test_sections_and_bars_assigned() {
        let track = testutil::sectioned_track(32, 4);
        assert_eq!(track.len(), 32);
        assert_eq!(track.beats[0].section, 0);
        assert_eq!(track.beats[7].section, 0);
        assert_eq!(track.beats[8].section, 1);
        assert_eq!(track.beats[31].section, 3);
        assert_eq!(track.beats[0].index_in_parent, Some(0));
        assert_eq!(track.beats[5].index_in_parent, Some(1));
        assert_eq!(track.section_anchors(), vec![0, 8, 16, 24]);
    }

    #[test]
    fn test_each_beat_gets_its_segment() {
        let track = testutil::sectioned_track(16, 2);
        for beat in &track.beats {
            assert_eq!(beat.segments, vec![beat.which]);
        }
    }

    #[test]
    fn test_last_beat_capped() {
        let mut payload = testutil::sectioned_payload(10, 1);
        payload.beats.last_mut().unwrap().duration = 30.0;
        let track = Track::from_payload(payload, None, Some(60.0)).unwrap();
        let last = track.beats.last().unwrap();
        assert!((last.duration - 0.8).abs() < 1e-9, "got {}", last.duration);
    }

    #[test]
    fn test_volumes_normalized() {
        let track = testutil::sectioned_track(40, 4);
        for beat in &track.beats {
            assert!((0.0..=1.0).contains(&beat.volume));
            assert!((0.0..=1.0).contains(&beat.median_volume));
        }
    }

    #[test]
    fn test_no_beats_is_an_error() {
        let err = Track::from_payload(AnalysisPayload::default(), None, None).unwrap_err();
        assert!(matches!(err, AnalysisError::NoBeats));
    }

    #[test]
    fn test_profile_document_parses() {
        let json = r#"{
            "response": {
                "track": {
                    "title": "Loop",
                    "audio_summary": {"duration": 2.0},
                    "analysis": {
                        "sections": [{"start": 0.0, "duration": 2.0}],
                        "beats": [
                            {"start": 0.0, "duration": 0.5},
                            {"start": 0.5, "duration": 0.5},
                            {"start": 1.0, "duration": 0.5},
                            {"start": 1.5, "duration": 0.5}
                        ],
                        "loop_candidates": [{"source": 3, "target": 0, "similarity": 0.9}]
                    }
                }
            }
        }"#;
        let track = Track::from_json_str(json).unwrap();
        assert_eq!(track.title.as_deref(), Some("Loop"));
        assert_eq!(track.len(), 4);
        assert!((track.duration - 2.0).abs() < 1e-9);
        assert_eq!(track.server_candidates.for_source(3).len(), 1);
        // No segments: every beat falls back to the quiet floor.
        assert!(track.beats.iter().all(|b| b.segments.is_empty()));
    }

    #[test]
    fn test_bare_document_parses() {
        let json = r#"{"beats": [{"start": 0.0, "duration": 0.5}, {"start": 0.5, "duration": 0.5}]}"#;
        let track = Track::from_json_str(json).unwrap();
        assert_eq!(track.len(), 2);
        assert!(track.canon_alignment.is_none());
        assert_eq!(track.beats[1].section, 0);
        assert_eq!(track.beats[1].index_in_parent, None);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track.json");
        std::fs::write(&path, r#"{"beats": [{"start": 0.0, "duration": 0.5}]}"#).unwrap();
        let track = Track::load(&path).unwrap();
        assert_eq!(track.len(), 1);

        let missing = Track::load(&dir.path().join("nope.json"));
        assert!(matches!(missing, Err(AnalysisError::Io(_))));
    }
}

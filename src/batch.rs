//! Graph statistics over a directory of analysis documents.

use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use thiserror::Error;
use walkdir::WalkDir;

use crate::analysis::{self, Track};
use crate::canon::CanonMapping;
use crate::graph::{GraphTier, LoopGraph, LoopSettings};
use crate::neighbors::NeighborTable;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("Invalid progress template: {0}")]
    Template(#[from] indicatif::style::TemplateError),
}

/// What the jukebox and canon modes would get out of one track.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackSummary {
    pub path: PathBuf,
    pub beats: usize,
    pub sections: usize,
    pub duration: f64,
    pub tier: GraphTier,
    pub edges: usize,
    pub retreat: Option<(usize, usize)>,
    pub audible_pairs: usize,
    pub mean_gain: f64,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub summaries: Vec<TrackSummary>,
    pub failed: Vec<(PathBuf, String)>,
}

impl BatchReport {
    /// Tracks whose graph came from `tier`.
    pub fn count_tier(&self, tier: GraphTier) -> usize {
        self.summaries.iter().filter(|s| s.tier == tier).count()
    }
}

/// Every `*.json` file below `root`, sorted.
pub fn collect_analysis_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
        })
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

/// Load one document and derive its graph and canon mapping.
pub fn summarize_track(path: &Path, settings: &LoopSettings) -> analysis::Result<TrackSummary> {
    let track = Track::load(path)?;
    Ok(summarize(path.to_path_buf(), &track, settings))
}

pub fn summarize(path: PathBuf, track: &Track, settings: &LoopSettings) -> TrackSummary {
    let mut neighbors = NeighborTable::compute(track, false);
    if let Some(alignment) = &track.canon_alignment {
        neighbors.augment_with_alignment(alignment);
    }
    let graph = LoopGraph::build(track, &neighbors, settings);
    let mapping = CanonMapping::for_track(track, &neighbors);
    TrackSummary {
        path,
        beats: track.len(),
        sections: track.sections.len(),
        duration: track.duration,
        tier: graph.tier(),
        edges: graph.edge_count(),
        retreat: graph.retreat_point().map(|r| (r.source, r.target)),
        audible_pairs: mapping.audible_count(),
        mean_gain: mapping.mean_gain(),
    }
}

/// Summarize every analysis document below `root` on `jobs` workers.
pub fn summarize_dir(
    root: &Path,
    jobs: usize,
    settings: &LoopSettings,
) -> std::result::Result<BatchReport, BatchError> {
    let files = collect_analysis_files(root);
    if files.is_empty() {
        log::info!("No analysis files under {}", root.display());
        return Ok(BatchReport::default());
    }

    log::info!("Summarizing {} tracks with {} workers", files.len(), jobs);

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
            .progress_chars("#>-"),
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs.max(1))
        .build()?;

    let results: Vec<(PathBuf, analysis::Result<TrackSummary>)> = pool.install(|| {
        files
            .into_par_iter()
            .map(|path| {
                let result = summarize_track(&path, settings);
                pb.inc(1);
                (path, result)
            })
            .collect()
    });

    let mut report = BatchReport::default();
    for (path, result) in results {
        match result {
            Ok(summary) => report.summaries.push(summary),
            Err(e) => {
                log::warn!("Skipping {}: {}", path.display(), e);
                report.failed.push((path, e.to_string()));
            }
        }
    }

    pb.finish_with_message(format!(
        "Done: {} summarized, {} failed",
        report.summaries.len(),
        report.failed.len()
    ));
    Ok(report)
}

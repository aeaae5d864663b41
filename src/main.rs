use anyhow::{Context, Result};
use beatwalk::analysis::Track;
use beatwalk::config::AppConfig;
use beatwalk::driver::{PlaybackDriver, SilentPlayer, Step, Transition};
use beatwalk::graph;
use beatwalk::neighbors::{self, NeighborTable};
use beatwalk::session::{PlaybackMode, Session};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "beatwalk", version, about = "Beat-graph jukebox and canon playback")]
struct Cli {
    /// Path to a config file (defaults to the XDG config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize an analysis file: beats, sections, loop graph and retreat point
    Inspect {
        /// Analysis JSON file
        file: PathBuf,
    },

    /// Show the nearest neighbors of one beat
    Neighbors {
        file: PathBuf,

        /// Beat index
        #[arg(short, long)]
        beat: usize,

        /// Use the wider advanced neighbor search
        #[arg(long)]
        advanced: bool,
    },

    /// List the strongest loops the given mode would draw
    Graph {
        file: PathBuf,

        #[arg(short, long, value_enum, default_value = "jukebox")]
        mode: PlaybackMode,

        /// Number of loops
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Summarize the canon overlay mapping
    Canon {
        file: PathBuf,

        /// Regenerate the overlay with the advanced settings
        #[arg(long)]
        advanced: bool,

        /// Print the first N pairs
        #[arg(short = 'n', long, default_value = "16")]
        limit: usize,
    },

    /// Play a track through a silent player and print every beat
    Simulate {
        file: PathBuf,

        /// Playback mode (defaults to config)
        #[arg(short, long, value_enum)]
        mode: Option<PlaybackMode>,

        /// Stop after this many beats
        #[arg(short, long, default_value = "64")]
        beats: usize,

        /// Seed for the jump choices (defaults to config, then the clock)
        #[arg(long)]
        seed: Option<u64>,

        /// Playback speed factor
        #[arg(long, default_value = "1.0")]
        speed: f64,

        /// Pace beats in wall-clock time (Ctrl-C stops)
        #[arg(long)]
        realtime: bool,

        /// Tracks to play after this one (canon mode)
        #[arg(long)]
        queue: Vec<PathBuf>,
    },

    /// Summarize every analysis file under a directory
    Batch {
        dir: PathBuf,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    };

    match cli.command {
        Commands::Inspect { file } => {
            let track = load(&file)?;
            let summary = beatwalk::batch::summarize(file.clone(), &track, &config.jukebox_loop);
            println!("{}", track.title.as_deref().unwrap_or("(untitled)"));
            println!(
                "  {} beats, {} sections, {} segments, {}",
                summary.beats,
                summary.sections,
                track.segments.len(),
                format_duration(summary.duration)
            );
            println!(
                "  Server candidates: {} ({:?})",
                track.server_candidates.len(),
                track.server_candidates.source
            );
            println!(
                "  Canon alignment: {}",
                if track.canon_alignment.is_some() { "yes" } else { "no" }
            );
            println!("  Loop graph: {} edges ({} tier)", summary.edges, summary.tier);
            match summary.retreat {
                Some((src, dst)) => println!("  Retreat: {} -> {}", src, dst),
                None => println!("  Retreat: none"),
            }
            println!(
                "  Canon: {} of {} beats paired, mean gain {:.2}",
                summary.audible_pairs, summary.beats, summary.mean_gain
            );
        }

        Commands::Neighbors {
            file,
            beat,
            advanced,
        } => {
            let track = load(&file)?;
            let query = track
                .beats
                .get(beat)
                .with_context(|| format!("Beat {} out of range (track has {})", beat, track.len()))?;
            let mut table = NeighborTable::compute(&track, advanced);
            if let Some(alignment) = &track.canon_alignment {
                table.augment_with_alignment(alignment);
            }
            let good: Vec<usize> = table.good_neighbors(beat).iter().map(|n| n.beat).collect();

            println!(
                "Beat {} @ {:.2}s (section {}, sim {:?})",
                beat, query.start, query.section, table.sim(beat)
            );
            println!(
                "{:<6} {:>8} {:>9} {:>8} {:>8} {:>8} {:>8}  {}",
                "Beat", "Dist", "Segment", "Parent", "Section", "Time", "Flow", ""
            );
            println!("{}", "-".repeat(72));
            for n in table.neighbors(beat) {
                let marker = if good.contains(&n.beat) { "good" } else { "" };
                match track
                    .beats
                    .get(n.beat)
                    .and_then(|other| neighbors::distance_breakdown(&track, query, other))
                {
                    Some(d) => println!(
                        "{:<6} {:>8.2} {:>9.2} {:>8.1} {:>8.1} {:>8.1} {:>8.1}  {}",
                        n.beat,
                        n.distance,
                        d.segment,
                        d.parent_penalty,
                        d.section_penalty,
                        d.time_penalty,
                        d.flow_penalty,
                        marker
                    ),
                    None => println!("{:<6} {:>8.2} {:>50}  {}", n.beat, n.distance, "(alignment)", marker),
                }
            }
        }

        Commands::Graph { file, mode, limit } => {
            let track = load(&file)?;
            let loops = match mode {
                PlaybackMode::Canon => graph::server_visualization_loops(&track, limit),
                mode => {
                    let session = Session::new(
                        SilentPlayer::new(),
                        track,
                        mode,
                        config.session_settings(),
                        config.resolve_seed(),
                    );
                    let graph = session
                        .loop_graph()
                        .context("No loop graph for this mode")?;
                    println!("{} edges from {} tier", graph.edge_count(), graph.tier());
                    if let Some(r) = graph.retreat_point() {
                        println!("Retreat: {} -> {} ({:.3})", r.source, r.target, r.similarity);
                    }
                    graph.visualization_loops(limit)
                }
            };
            println!("{:<8} {:<8} {:>6} {:>10}", "From", "To", "Span", "Similarity");
            println!("{}", "-".repeat(36));
            for edge in &loops {
                println!(
                    "{:<8} {:<8} {:>6} {:>10.3}",
                    edge.source,
                    edge.target,
                    edge.source.abs_diff(edge.target),
                    edge.similarity
                );
            }
        }

        Commands::Canon {
            file,
            advanced,
            limit,
        } => {
            let track = load(&file)?;
            let mut settings = config.session_settings();
            settings.canon_advanced = advanced || settings.canon_advanced;
            let session = Session::new(
                SilentPlayer::new(),
                track,
                PlaybackMode::Canon,
                settings,
                config.resolve_seed(),
            );
            let mapping = session.mapping();
            println!(
                "{} of {} beats paired, mean gain {:.2}{}",
                mapping.audible_count(),
                mapping.len(),
                mapping.mean_gain(),
                if session.settings().canon_advanced { " (advanced)" } else { "" }
            );

            let mut offsets: BTreeMap<i64, usize> = BTreeMap::new();
            for which in 0..mapping.len() {
                if let Some(offset) = mapping.offset_of(which) {
                    *offsets.entry(offset).or_default() += 1;
                }
            }
            let mut ranked: Vec<(i64, usize)> = offsets.into_iter().collect();
            ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
            println!("Most common offsets:");
            for (offset, count) in ranked.iter().take(5) {
                println!("  {:+} beats: {}", offset, count);
            }

            println!("{:<6} {:<6} {:>6} {:>10}  {}", "Beat", "Other", "Gain", "Similarity", "Label");
            println!("{}", "-".repeat(44));
            for (which, pair) in mapping.pairs().iter().enumerate().take(limit) {
                println!(
                    "{:<6} {:<6} {:>6.2} {:>10}  {}",
                    which,
                    pair.other,
                    pair.gain,
                    pair.similarity
                        .map(|s| format!("{:.3}", s))
                        .unwrap_or_else(|| "-".to_string()),
                    pair.label.as_deref().unwrap_or("")
                );
            }
        }

        Commands::Simulate {
            file,
            mode,
            beats,
            seed,
            speed,
            realtime,
            queue,
        } => {
            let track = load(&file)?;
            let mode = mode.unwrap_or(config.mode);
            let seed = seed.unwrap_or_else(|| config.resolve_seed());
            log::info!("Simulating {} mode with seed {}", mode, seed);

            let mut session = Session::new(
                SilentPlayer::new(),
                track,
                mode,
                config.session_settings(),
                seed,
            );
            for path in &queue {
                session.enqueue(load(path)?);
            }
            session.set_speed_factor(speed);

            let played = if realtime {
                simulate_realtime(&mut session, beats)?
            } else {
                simulate_offline(&mut session, beats)?
            };

            let stats = session.stats();
            println!(
                "\n{} beats played, {} listened",
                played,
                format_duration(stats.listen_time)
            );
        }

        Commands::Batch { dir, jobs } => {
            let workers = if jobs > 0 { jobs } else { config.resolve_workers() };
            let report = beatwalk::batch::summarize_dir(&dir, workers, &config.jukebox_loop)
                .context("Batch summary failed")?;

            println!(
                "{:<40} {:>6} {:>8} {:<10} {:>6} {:>10}",
                "File", "Beats", "Length", "Tier", "Edges", "Canon"
            );
            println!("{}", "-".repeat(86));
            for s in &report.summaries {
                let name = s
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                println!(
                    "{:<40} {:>6} {:>8} {:<10} {:>6} {:>9.0}%",
                    truncate(&name, 40),
                    s.beats,
                    format_duration(s.duration),
                    s.tier,
                    s.edges,
                    100.0 * s.audible_pairs as f64 / s.beats.max(1) as f64
                );
            }
            println!(
                "\n{} summarized, {} failed",
                report.summaries.len(),
                report.failed.len()
            );
        }
    }

    Ok(())
}

fn load(path: &Path) -> Result<Track> {
    Track::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

/// Step through the schedule without waiting.
fn simulate_offline(session: &mut Session<SilentPlayer>, limit: usize) -> Result<usize> {
    let mut played = 0;
    if let Some(step) = session.start(0.0).context("Playback failed")? {
        print_step(&step);
        played += 1;
    }
    while played < limit {
        let Some(due) = session.driver().and_then(|d| d.next_due()) else {
            break;
        };
        for step in session.advance_to(due.due).context("Playback failed")? {
            print_step(&step);
            played += 1;
        }
    }
    session.stop();
    Ok(played)
}

/// Sleep until each continuation is due; Ctrl-C cancels the pending one.
fn simulate_realtime(session: &mut Session<SilentPlayer>, limit: usize) -> Result<usize> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .enable_io()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(async {
        let origin = tokio::time::Instant::now();
        let mut played = 0;
        if let Some(step) = session.start(0.0).context("Playback failed")? {
            print_step(&step);
            played += 1;
        }
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        while played < limit {
            let Some(due) = session.driver().and_then(|d| d.next_due()) else {
                break;
            };
            let deadline = origin + std::time::Duration::from_secs_f64(due.due.max(0.0));
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = &mut ctrl_c => {
                    log::info!("Interrupted");
                    break;
                }
            }
            let now = origin.elapsed().as_secs_f64().max(due.due);
            for step in session.advance_to(now).context("Playback failed")? {
                print_step(&step);
                played += 1;
            }
        }
        session.stop();
        Ok::<_, anyhow::Error>(played)
    })
}

fn print_step(step: &Step) {
    let overlay = step
        .overlay
        .map(|o| format!(" + {} ({:.2})", o.index, o.gain))
        .unwrap_or_default();
    let transition = match step.transition {
        Transition::Sequential => String::new(),
        Transition::Jump { reason } => match step.next {
            Some(next) => format!("  jump -> {} ({:?})", next, reason),
            None => format!("  jump ({:?})", reason),
        },
        Transition::Handoff => "  -> next track".to_string(),
        Transition::Finished => "  end".to_string(),
    };
    println!(
        "{:>9.3}s  beat {:>5}{}{}",
        step.at, step.index, overlay, transition
    );
}

fn format_duration(secs: f64) -> String {
    let total = secs.max(0.0) as u64;
    format!("{}:{:02}", total / 60, total % 60)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

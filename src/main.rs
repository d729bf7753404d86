use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use musictool::config::{Config, DATABASE_ENV};
use musictool::ledger;
use musictool::models::{ImportBatch, ImportSource, SourceKind};
use musictool::normalize::normalize;
use musictool::overrides::OverrideStore;
use musictool::pipeline::{self, RunRequest};
use musictool::progress::{format_duration, set_log_only};
use musictool::reconcile::{Ownership, UnifiedView};
use musictool::resolver::{CandidatePool, ClaimSet, Resolver};
use musictool::safety::validate_export_path;
use musictool::sources;
use musictool::store;

#[derive(Parser)]
#[command(name = "musictool")]
#[command(about = "Reconcile a digital music library with a physical record collection")]
struct Cli {
    /// SQLite database holding tracks, decisions, overrides and the ledger
    #[arg(long, global = true, env = DATABASE_ENV)]
    db: Option<PathBuf>,

    /// JSON config file (database path, scoring weights and thresholds)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, default_value = "0")]
    workers: usize,

    /// Hide progress bars, log progress lines instead
    #[arg(long, global = true)]
    log_only: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile a digital snapshot against a physical snapshot
    Run {
        #[arg(long)]
        digital: PathBuf,
        #[arg(long)]
        physical: PathBuf,
        /// traktor_nml, discogs_api, discogs_csv or combined
        #[arg(long, default_value = "combined", value_parser = parse_source)]
        source: ImportSource,
    },
    /// Pin a digital record to a physical record
    Confirm { digital_id: String, physical_id: String },
    /// Force a digital record to stay unmatched
    Reject { digital_id: String },
    /// Remove the override for a digital record
    Clear { digital_id: String },
    /// List overrides, flagging stale ones
    Overrides,
    /// Ranked physical candidates for one digital record
    Candidates {
        digital_id: String,
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// Show recent import batches
    History {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Summarise the unified view, optionally exporting it as JSON
    View {
        #[arg(long)]
        export: Option<PathBuf>,
    },
}

fn parse_source(s: &str) -> std::result::Result<ImportSource, String> {
    ImportSource::parse(s).ok_or_else(|| format!("unknown import source '{}'", s))
}

fn print_batch(batch: &ImportBatch) {
    println!(
        "#{:<5} {:<11} {:<8} seen={:<6} new={:<5} changed={:<5} removed={:<5} malformed={:<4} {}",
        batch.batch_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
        batch.source.as_str(),
        batch.status.as_str(),
        batch.records_seen,
        batch.records_new,
        batch.records_changed,
        batch.records_removed,
        batch.records_malformed,
        batch.started_at.format("%Y-%m-%d %H:%M:%S"),
    );
    if let Some(message) = &batch.error_message {
        println!("       error: {}", message);
    }
}

fn cmd_run(conn: &mut Connection, config: &Config, digital: &Path, physical: &Path, source: ImportSource) -> Result<()> {
    let start = Instant::now();
    let digital_snapshot = sources::load_digital(digital)?;
    let releases = sources::load_physical(physical)?;

    let request = RunRequest {
        digital: digital_snapshot.records,
        releases,
        source,
        source_file: Some(format!("{}; {}", digital.display(), physical.display())),
    };
    // No cancel flag: an interrupted process never reaches commit anyway
    let report = pipeline::execute(conn, &request, config.scoring, None)?;
    let stats = &report.stats;

    println!("\n{:=<60}", "");
    println!("Reconciliation complete!");
    print_batch(&report.batch);
    println!(
        "  Digital: {} records ({} malformed, {} degenerate)",
        stats.digital_records, stats.malformed_digital, stats.degenerate_digital
    );
    println!(
        "  Physical: {} tracks ({} malformed, {} not owned digitally)",
        stats.physical_records, stats.malformed_physical, stats.unmatched_physical
    );
    println!(
        "  Matches: exact={} high={} low={} manual={} unmatched={} ({:.1}%)",
        stats.exact_matches,
        stats.high_matches,
        stats.low_matches,
        stats.manual_confirmed,
        stats.unmatched_digital,
        stats.match_rate()
    );
    if stats.stale_overrides + stats.override_conflicts > 0 {
        println!(
            "  Overrides needing attention: {} stale, {} conflicting",
            stats.stale_overrides, stats.override_conflicts
        );
    }
    println!("  Elapsed: {}", format_duration(start.elapsed()));
    println!("{:=<60}", "");
    Ok(())
}

fn cmd_candidates(conn: &Connection, config: &Config, digital_id: &str, limit: usize) -> Result<()> {
    let Some(stored) = store::get_track(conn, SourceKind::Digital, digital_id)? else {
        bail!("Unknown digital record '{}'", digital_id);
    };
    let record = stored.record;

    let physical: Vec<_> = store::load_tracks(conn, SourceKind::Physical)?
        .into_iter()
        .filter(|r| !r.is_malformed())
        .collect();
    let pool = CandidatePool::new(&physical);
    let previous = store::get_decision(conn, digital_id)?;
    let key = normalize(&record.artist, &record.title);

    let resolver = Resolver::new(config.scoring);
    let ranked = resolver.rank(
        digital_id,
        &key,
        &pool,
        &ClaimSet::new(),
        previous.as_ref().and_then(|d| d.claimed_physical()),
    );

    println!("Candidates for [{}] {} - {}", digital_id, record.artist, record.title);
    if !key.annotations.is_empty() {
        println!("  notes: {}", key.annotations.join(", "));
    }
    if let Some(decision) = &previous {
        println!(
            "  current: {} ({}, {}, score {:.3})",
            decision.physical_source_id.as_deref().unwrap_or("-"),
            decision.tier,
            decision.origin.as_str(),
            decision.score
        );
    }
    println!("{:-<80}", "");

    for candidate in ranked.iter().take(limit) {
        let Some(physical_id) = candidate.physical_source_id.as_deref() else {
            continue;
        };
        let Some(entry) = pool.get(physical_id) else {
            continue;
        };
        println!(
            "{:>6.3} {:<6} [{}] {} - {}",
            candidate.score,
            candidate.tier.as_str(),
            physical_id,
            entry.record.artist,
            entry.record.title
        );
    }
    if ranked.is_empty() {
        println!("No candidates found.");
    }
    Ok(())
}

fn cmd_view(conn: &Connection, config: &Config, export: Option<&Path>) -> Result<()> {
    let digital = store::load_tracks(conn, SourceKind::Digital)?;
    let physical = store::load_tracks(conn, SourceKind::Physical)?;
    let decisions = store::load_decisions(conn)?;
    let mut retired = store::load_retired_tracks(conn, SourceKind::Digital)?;
    retired.extend(store::load_retired_tracks(conn, SourceKind::Physical)?);

    let view = UnifiedView::build(&digital, &physical, &decisions, &retired);
    let counts = &view.tier_counts;

    println!("Collection overview");
    println!("{:-<60}", "");
    println!("  Both formats:        {}", view.count(Ownership::Both));
    println!("  Digital only:        {}", view.count(Ownership::DigitalOnly));
    println!("  Physical only:       {}", view.count(Ownership::PhysicalOnly));
    println!("  No longer in source: {}", view.count(Ownership::Neither));
    println!(
        "  Tiers: exact={} high={} low={} manual={} none={}",
        counts.exact, counts.high, counts.low, counts.manual, counts.none
    );

    if let Some(output) = export {
        validate_export_path(output, &[config.database_path.as_path()])?;
        let json = serde_json::to_string_pretty(&view).context("Failed to serialize view")?;
        std::fs::write(output, json)
            .with_context(|| format!("Failed to write {}", output.display()))?;
        println!("Exported {} entries to {}", view.entries.len(), output.display());
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "musictool=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    set_log_only(cli.log_only);

    if cli.workers > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(cli.workers)
            .build_global()
            .context("Failed to set thread pool size")?;
    }

    let config = Config::load(cli.db, cli.config.as_deref()).context("Invalid configuration")?;
    let mut conn = store::open(&config.database_path)
        .with_context(|| format!("Failed to open database {}", config.database_path.display()))?;

    match cli.command {
        Command::Run {
            digital,
            physical,
            source,
        } => {
            for input in [&digital, &physical] {
                if input.as_path() == config.database_path.as_path() {
                    bail!("Snapshot '{}' is the database file", input.display());
                }
            }
            cmd_run(&mut conn, &config, &digital, &physical, source)?;
        }
        Command::Confirm {
            digital_id,
            physical_id,
        } => {
            OverrideStore::new(&conn).confirm(&digital_id, &physical_id)?;
            println!("Confirmed {} -> {}", digital_id, physical_id);
        }
        Command::Reject { digital_id } => {
            OverrideStore::new(&conn).reject(&digital_id)?;
            println!("Rejected automatic matching for {}", digital_id);
        }
        Command::Clear { digital_id } => {
            if OverrideStore::new(&conn).clear(&digital_id)? {
                println!("Cleared override for {}", digital_id);
            } else {
                println!("No override for {}", digital_id);
            }
        }
        Command::Overrides => {
            let statuses = OverrideStore::new(&conn).list_with_status()?;
            for status in &statuses {
                let pin = &status.pin;
                println!(
                    "{:<24} {:<8} {:<24} {}{}",
                    pin.digital_source_id,
                    pin.action.as_str(),
                    pin.physical_source_id.as_deref().unwrap_or("-"),
                    pin.created_at.format("%Y-%m-%d %H:%M"),
                    match status.stale {
                        Some(reason) => format!("  STALE ({:?})", reason),
                        None => String::new(),
                    }
                );
            }
            if statuses.is_empty() {
                println!("No overrides.");
            }
        }
        Command::Candidates { digital_id, limit } => {
            cmd_candidates(&conn, &config, &digital_id, limit)?;
        }
        Command::History { limit } => {
            let batches = ledger::history(&conn, limit)?;
            for batch in &batches {
                print_batch(batch);
            }
            if batches.is_empty() {
                println!("No import batches yet.");
            }
        }
        Command::View { export } => {
            cmd_view(&conn, &config, export.as_deref())?;
        }
    }

    Ok(())
}

//! Commit-or-nothing execution of one reconciliation run against the store.
//!
//! The run holds an IMMEDIATE transaction from the moment it reads the
//! previous decisions until it commits, so no other writer can commit in
//! between. A failed run rolls back and then appends a `failed` batch on its
//! own; the committed decision set is left as it was.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Serialize;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use crate::error::{ReconcileError, StoreError};
use crate::ledger;
use crate::models::{BatchStatus, DataQualityIssue, ImportBatch, ImportSource, Release, RunStats, SourceKind, TrackRecord};
use crate::overrides::OverrideStore;
use crate::progress::{create_progress_bar, create_spinner, format_duration};
use crate::reconcile::{self, RunInput, RunOptions, RunOutcome};
use crate::release::expand_releases;
use crate::scoring::ScoringConfig;
use crate::store::{self, TrackSyncStats};

/// Both snapshots for one run, as handed over by the source readers.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub digital: Vec<TrackRecord>,
    pub releases: Vec<Release>,
    pub source: ImportSource,
    pub source_file: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub batch: ImportBatch,
    pub stats: RunStats,
    pub issues: Vec<DataQualityIssue>,
    pub unmatched_physical: Vec<String>,
    pub digital_sync: TrackSyncStats,
    pub physical_sync: TrackSyncStats,
}

fn commit_outcome(
    tx: &Transaction<'_>,
    digital: &[TrackRecord],
    physical: &[TrackRecord],
    outcome: &mut RunOutcome,
) -> Result<(TrackSyncStats, TrackSyncStats), StoreError> {
    let now = Utc::now();
    let digital_sync = store::sync_tracks(tx, SourceKind::Digital, digital, &now)?;
    let physical_sync = store::sync_tracks(tx, SourceKind::Physical, physical, &now)?;
    store::replace_decisions(tx, &outcome.decisions)?;

    outcome.batch.finished_at = Some(Utc::now());
    let batch_id = ledger::append(tx, &outcome.batch)?;
    outcome.batch.batch_id = Some(batch_id);
    Ok((digital_sync, physical_sync))
}

/// Append a failed batch outside any run transaction.
fn record_failure(conn: &Connection, mut batch: ImportBatch, reason: &str) -> Result<ImportBatch> {
    batch.status = BatchStatus::Failed;
    batch.error_message.get_or_insert_with(|| reason.to_string());
    batch.finished_at = Some(Utc::now());
    let batch_id = ledger::append(conn, &batch).context("Failed to record failed batch")?;
    batch.batch_id = Some(batch_id);
    Ok(batch)
}

/// Run reconciliation for `request` and commit the result atomically.
pub fn execute(
    conn: &mut Connection,
    request: &RunRequest,
    scoring: ScoringConfig,
    cancel: Option<&AtomicBool>,
) -> Result<RunReport> {
    let started = Instant::now();
    let started_at = Utc::now();
    let physical = expand_releases(&request.releases);

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("Failed to acquire the run lock")?;

    let previous = store::load_decisions(&tx).context("Failed to read previous decisions")?;
    let overrides = OverrideStore::new(&tx)
        .list_active()
        .context("Failed to read overrides")?;

    let input = RunInput {
        digital: &request.digital,
        physical: &physical,
        previous_decisions: &previous,
        overrides: &overrides,
        source: request.source,
        source_file: request.source_file.clone(),
        started_at,
    };

    let pb = create_progress_bar(request.digital.len() as u64, "Matching digital records");
    let options = RunOptions {
        scoring,
        cancel,
        progress: Some(&pb),
    };
    let result = reconcile::run(&input, &options);
    pb.finish_and_clear();

    let mut outcome = match result {
        Ok(outcome) => outcome,
        Err(failure) => {
            tx.rollback().context("Failed to roll back run")?;
            let batch = record_failure(conn, failure.batch.clone(), &failure.error.to_string())?;
            tracing::warn!(batch_id = ?batch.batch_id, "run recorded as failed");
            return Err(failure.into());
        }
    };

    let spinner = create_spinner("Writing decisions");
    let committed = commit_outcome(&tx, &request.digital, &physical, &mut outcome);
    spinner.finish_and_clear();

    let (digital_sync, physical_sync) = match committed {
        Ok(synced) => {
            tx.commit().context("Failed to commit run")?;
            synced
        }
        Err(err) => {
            tx.rollback().context("Failed to roll back run")?;
            let mut batch = outcome.batch;
            batch.batch_id = None;
            let err = ReconcileError::from(err);
            record_failure(conn, batch, &err.to_string())?;
            return Err(err).context("Failed to write run results");
        }
    };

    tracing::info!(
        batch_id = ?outcome.batch.batch_id,
        status = outcome.batch.status.as_str(),
        elapsed = %format_duration(started.elapsed()),
        "run committed"
    );

    Ok(RunReport {
        batch: outcome.batch,
        stats: outcome.stats,
        issues: outcome.issues,
        unmatched_physical: outcome.unmatched_physical,
        digital_sync,
        physical_sync,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ReleaseTrack;
    use crate::store::open_in_memory;

    fn request() -> RunRequest {
        RunRequest {
            digital: vec![
                TrackRecord::digital("d1", "Daft Punk", "One More Time"),
                TrackRecord::digital("d2", "Daft Punk", "Aerodynamic"),
            ],
            releases: vec![Release {
                release_id: "249504".to_string(),
                artist: "Daft Punk".to_string(),
                title: "Discovery".to_string(),
                label: Some("Virgin".to_string()),
                year: Some(2001),
                format_type: Some("vinyl".to_string()),
                tracks: vec![
                    ReleaseTrack {
                        position: Some("A1".to_string()),
                        artist: None,
                        title: "One More Time".to_string(),
                        duration_sec: Some(320),
                    },
                    ReleaseTrack {
                        position: Some("A2".to_string()),
                        artist: None,
                        title: "Aerodynamic".to_string(),
                        duration_sec: Some(212),
                    },
                ],
            }],
            source: ImportSource::Combined,
            source_file: None,
        }
    }

    #[test]
    fn test_execute_commits_everything() {
        let mut conn = open_in_memory().unwrap();
        let report = execute(&mut conn, &request(), ScoringConfig::default(), None).unwrap();

        assert_eq!(report.batch.status, BatchStatus::Success);
        assert!(report.batch.batch_id.is_some());
        assert_eq!(report.digital_sync.inserted, 2);
        assert_eq!(report.physical_sync.inserted, 2);

        let decisions = store::load_decisions(&conn).unwrap();
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].physical_source_id.as_deref(), Some("249504:A1"));
        assert_eq!(ledger::history(&conn, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_cancelled_run_leaves_state_untouched() {
        let mut conn = open_in_memory().unwrap();
        execute(&mut conn, &request(), ScoringConfig::default(), None).unwrap();
        let before = store::load_decisions(&conn).unwrap();

        let mut changed = request();
        changed.digital.pop();
        let cancel = AtomicBool::new(true);
        let err = execute(&mut conn, &changed, ScoringConfig::default(), Some(&cancel)).unwrap_err();
        assert!(err.to_string().contains("failed"));

        assert_eq!(store::load_decisions(&conn).unwrap(), before);
        assert!(store::track_present(&conn, SourceKind::Digital, "d2").unwrap());

        let history = ledger::history(&conn, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, BatchStatus::Failed);
        assert!(history[0].error_message.as_deref().unwrap().contains("cancelled"));
    }
}

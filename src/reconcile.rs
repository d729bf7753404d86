//! Reconciliation runs and the unified collection view.
//!
//! `run` is a pure function of its snapshots: it reads nothing from the store
//! and writes nothing. The pipeline persists its outcome.

use chrono::{DateTime, Utc};
use indicatif::ProgressBar;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use thiserror::Error;

use crate::error::ReconcileError;
use crate::models::{
    BatchStatus, DataQualityIssue, ImportBatch, ImportSource, MatchDecision, Origin, Override,
    OverrideAction, RunStats, SourceKind, StaleReason, Tier, TrackRecord,
};
use crate::progress::log_progress;
use crate::resolver::{CandidatePool, ClaimSet, ResolutionKind, Resolver};
use crate::scoring::ScoringConfig;

const LOG_INTERVAL: u64 = 1_000;

// ============================================================================
// Run Inputs / Outputs
// ============================================================================

/// Immutable snapshots for one run. `physical` is already expanded from
/// releases into tracks.
#[derive(Debug, Clone)]
pub struct RunInput<'a> {
    pub digital: &'a [TrackRecord],
    pub physical: &'a [TrackRecord],
    pub previous_decisions: &'a [MatchDecision],
    pub overrides: &'a [Override],
    pub source: ImportSource,
    pub source_file: Option<String>,
    /// Stamped on every decision whose outcome changed
    pub started_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct RunOptions<'a> {
    pub scoring: ScoringConfig,
    /// Checked between digital records
    pub cancel: Option<&'a AtomicBool>,
    pub progress: Option<&'a ProgressBar>,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// One decision per digital record, ascending by digital source id
    pub decisions: Vec<MatchDecision>,
    /// Counts filled in; `finished_at` is left to whoever commits
    pub batch: ImportBatch,
    /// Physical source ids no decision claimed, ascending
    pub unmatched_physical: Vec<String>,
    pub issues: Vec<DataQualityIssue>,
    pub stats: RunStats,
}

/// An aborted run, carrying the failed batch with whatever counts were known.
#[derive(Error, Debug)]
#[error("reconciliation run failed: {error}")]
pub struct RunFailure {
    #[source]
    pub error: ReconcileError,
    pub batch: ImportBatch,
}

fn fail(mut batch: ImportBatch, error: ReconcileError) -> RunFailure {
    batch.status = BatchStatus::Failed;
    batch.error_message = Some(error.to_string());
    tracing::warn!(error = %error, "reconciliation run failed");
    RunFailure { error, batch }
}

fn check_unique(kind: SourceKind, records: &[TrackRecord]) -> Result<(), ReconcileError> {
    let mut seen: FxHashSet<&str> = FxHashSet::default();
    for record in records {
        if !seen.insert(record.source_id.as_str()) {
            return Err(ReconcileError::DuplicateSourceId {
                kind,
                source_id: record.source_id.clone(),
            });
        }
    }
    Ok(())
}

fn malformed_issue(record: &TrackRecord, missing: &'static str) -> DataQualityIssue {
    tracing::warn!(
        kind = %record.source_kind,
        source_id = %record.source_id,
        missing,
        "malformed record excluded from matching"
    );
    DataQualityIssue::Malformed {
        source_kind: record.source_kind,
        source_id: record.source_id.clone(),
        missing,
    }
}

fn stale_issue(digital_source_id: &str, reason: StaleReason) -> DataQualityIssue {
    tracing::warn!(digital_id = digital_source_id, reason = ?reason, "stale override");
    DataQualityIssue::StaleOverride {
        digital_source_id: digital_source_id.to_string(),
        reason,
    }
}

/// new / changed / removed counts of `decisions` against `previous`.
pub fn diff_decisions(previous: &[MatchDecision], decisions: &[MatchDecision]) -> (u64, u64, u64) {
    let before: FxHashMap<&str, &MatchDecision> = previous
        .iter()
        .map(|d| (d.digital_source_id.as_str(), d))
        .collect();
    let after: FxHashSet<&str> = decisions.iter().map(|d| d.digital_source_id.as_str()).collect();

    let mut new = 0;
    let mut changed = 0;
    for decision in decisions {
        match before.get(decision.digital_source_id.as_str()) {
            None => new += 1,
            Some(old) => {
                if old.physical_source_id != decision.physical_source_id || old.tier != decision.tier {
                    changed += 1;
                }
            }
        }
    }
    let removed = before.keys().filter(|id| !after.contains(*id)).count() as u64;
    (new, changed, removed)
}

// ============================================================================
// Run
// ============================================================================

/// Reconcile one pair of snapshots against the previous decision set.
///
/// Digital records are resolved in ascending source id order. Confirm
/// overrides reserve their physical record before any automatic matching,
/// so a scored match can never take a record the user pinned elsewhere.
pub fn run(input: &RunInput<'_>, options: &RunOptions<'_>) -> Result<RunOutcome, RunFailure> {
    let clock = Instant::now();
    let mut batch = ImportBatch::begin(input.source, input.source_file.clone(), input.started_at);
    batch.records_seen = (input.digital.len() + input.physical.len()) as u64;

    tracing::info!(
        source = input.source.as_str(),
        digital = input.digital.len(),
        physical = input.physical.len(),
        overrides = input.overrides.len(),
        "starting reconciliation run"
    );

    if let Err(error) = check_unique(SourceKind::Digital, input.digital)
        .and_then(|_| check_unique(SourceKind::Physical, input.physical))
    {
        return Err(fail(batch, error));
    }

    let mut stats = RunStats {
        digital_records: input.digital.len(),
        physical_records: input.physical.len(),
        ..Default::default()
    };
    let mut issues = Vec::new();

    // Physical records missing artist or title never enter the pool
    let mut valid_physical = Vec::with_capacity(input.physical.len());
    for record in input.physical {
        match record.missing_field() {
            Some(missing) => {
                issues.push(malformed_issue(record, missing));
                stats.malformed_physical += 1;
            }
            None => valid_physical.push(record),
        }
    }
    let physical_ids: FxHashSet<&str> = input.physical.iter().map(|r| r.source_id.as_str()).collect();
    let pool = CandidatePool::from_refs(valid_physical);

    let mut digital: Vec<&TrackRecord> = input.digital.iter().collect();
    digital.sort_by(|a, b| a.source_id.cmp(&b.source_id));
    let digital_ids: FxHashSet<&str> = digital.iter().map(|r| r.source_id.as_str()).collect();

    let previous: FxHashMap<&str, &MatchDecision> = input
        .previous_decisions
        .iter()
        .map(|d| (d.digital_source_id.as_str(), d))
        .collect();
    let overrides: FxHashMap<&str, &Override> = input
        .overrides
        .iter()
        .map(|o| (o.digital_source_id.as_str(), o))
        .collect();

    // Overrides for digital records that are gone
    let mut orphaned: Vec<&str> = overrides
        .keys()
        .copied()
        .filter(|id| !digital_ids.contains(id))
        .collect();
    orphaned.sort_unstable();
    for id in orphaned {
        issues.push(stale_issue(id, StaleReason::DigitalRemoved));
        stats.stale_overrides += 1;
    }

    // Reserve confirmed physical records, first come by digital id
    let mut claims = ClaimSet::new();
    for record in &digital {
        if let Some(pin) = overrides.get(record.source_id.as_str()) {
            if let (OverrideAction::Confirm, Some(physical_id)) = (pin.action, pin.physical_source_id.as_deref()) {
                if pool.contains(physical_id) {
                    claims.claim(physical_id, &record.source_id);
                }
            }
        }
    }

    let resolver = Resolver::new(options.scoring);
    let total = digital.len();
    let mut decisions = Vec::with_capacity(total);

    for (processed, record) in digital.iter().enumerate() {
        if options.cancel.map_or(false, |flag| flag.load(Ordering::Relaxed)) {
            batch.records_malformed = (stats.malformed_digital + stats.malformed_physical) as u64;
            return Err(fail(batch, ReconcileError::Cancelled { processed, total }));
        }

        let digital_id = record.source_id.as_str();
        let pin = overrides.get(digital_id).copied();
        let prior = previous.get(digital_id).copied();

        let mut decision = MatchDecision {
            digital_source_id: record.source_id.clone(),
            physical_source_id: None,
            tier: Tier::None,
            origin: Origin::Automatic,
            score: 0.0,
            decided_at: input.started_at,
        };

        let malformed = record.missing_field();
        if let Some(missing) = malformed {
            issues.push(malformed_issue(record, missing));
            stats.malformed_digital += 1;
        }

        // A malformed record is only decided by its override, if it has one
        if malformed.is_none() || pin.is_some() {
            let previous_physical = prior.and_then(|d| d.claimed_physical());
            let resolution = resolver.resolve(record, &pool, &mut claims, previous_physical, pin);

            match resolution.kind {
                ResolutionKind::Degenerate => {
                    tracing::debug!(digital_id, "artist and title normalize to nothing");
                    issues.push(DataQualityIssue::Degenerate {
                        source_kind: SourceKind::Digital,
                        source_id: record.source_id.clone(),
                    });
                    stats.degenerate_digital += 1;
                }
                ResolutionKind::Rejected => stats.manual_rejected += 1,
                ResolutionKind::StaleConfirm => {
                    let physical_id = pin.and_then(|p| p.physical_source_id.as_deref()).unwrap_or("");
                    let reason = if physical_ids.contains(physical_id) {
                        StaleReason::PhysicalMalformed
                    } else {
                        StaleReason::PhysicalRemoved
                    };
                    issues.push(stale_issue(digital_id, reason));
                    stats.stale_overrides += 1;
                }
                ResolutionKind::ConflictingConfirm => {
                    let physical_id = pin.and_then(|p| p.physical_source_id.clone()).unwrap_or_default();
                    let claimed_by = claims.claimed_by(&physical_id).unwrap_or_default().to_string();
                    tracing::warn!(digital_id, physical_id = %physical_id, claimed_by = %claimed_by, "conflicting confirm override");
                    issues.push(DataQualityIssue::OverrideConflict {
                        digital_source_id: record.source_id.clone(),
                        physical_source_id: physical_id,
                        claimed_by,
                    });
                    stats.override_conflicts += 1;
                }
                ResolutionKind::Confirmed | ResolutionKind::Scored | ResolutionKind::EmptyPool => {}
            }

            decision.physical_source_id = resolution.matched_physical().map(str::to_string);
            decision.tier = if decision.physical_source_id.is_some() {
                resolution.best.tier
            } else {
                Tier::None
            };
            decision.origin = resolution.origin;
            decision.score = resolution.best.score;
        }

        if let Some(prior) = prior {
            if prior.same_outcome(&decision) {
                decision.decided_at = prior.decided_at;
            }
        }

        match (decision.origin, decision.tier.is_match()) {
            (Origin::Manual, true) => stats.manual_confirmed += 1,
            _ => stats.record_tier(decision.tier),
        }

        decisions.push(decision);

        if let Some(pb) = options.progress {
            pb.inc(1);
        }
        log_progress("Matching", processed as u64 + 1, total as u64, LOG_INTERVAL);
    }

    let mut unmatched_physical: Vec<String> = pool
        .entries()
        .iter()
        .map(|entry| entry.record.source_id.as_str())
        .filter(|id| !claims.is_claimed(id))
        .map(str::to_string)
        .collect();
    unmatched_physical.sort_unstable();
    stats.unmatched_physical = unmatched_physical.len();

    let (new, changed, removed) = diff_decisions(input.previous_decisions, &decisions);
    batch.records_new = new;
    batch.records_changed = changed;
    batch.records_removed = removed;
    batch.records_malformed = (stats.malformed_digital + stats.malformed_physical) as u64;
    batch.status = if batch.records_malformed > 0 {
        BatchStatus::Partial
    } else {
        BatchStatus::Success
    };

    stats.elapsed_seconds = clock.elapsed().as_secs_f64();
    tracing::info!(
        new,
        changed,
        removed,
        malformed = batch.records_malformed,
        unmatched_physical = stats.unmatched_physical,
        match_rate = stats.match_rate(),
        "reconciliation run complete"
    );
    stats.log_phase("reconcile");

    Ok(RunOutcome {
        decisions,
        batch,
        unmatched_physical,
        issues,
        stats,
    })
}

// ============================================================================
// Unified View
// ============================================================================

/// Which formats of a logical track are owned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    Both,
    DigitalOnly,
    PhysicalOnly,
    /// Stored, but in no current snapshot
    Neither,
}

#[derive(Debug, Clone, Serialize)]
pub struct ViewEntry {
    pub ownership: Ownership,
    pub digital: Option<TrackRecord>,
    pub physical: Option<TrackRecord>,
    pub decision: Option<MatchDecision>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierCounts {
    pub exact: usize,
    pub high: usize,
    pub low: usize,
    pub none: usize,
    pub manual: usize,
}

/// One row per logical track, as consumed by the presentation layer.
#[derive(Debug, Clone, Serialize)]
pub struct UnifiedView {
    pub entries: Vec<ViewEntry>,
    pub tier_counts: TierCounts,
}

impl UnifiedView {
    /// Digital rows first (ascending id), then unclaimed physical records,
    /// then retired records from either source.
    pub fn build(
        digital: &[TrackRecord],
        physical: &[TrackRecord],
        decisions: &[MatchDecision],
        retired: &[TrackRecord],
    ) -> Self {
        let decisions_by_digital: FxHashMap<&str, &MatchDecision> = decisions
            .iter()
            .map(|d| (d.digital_source_id.as_str(), d))
            .collect();
        let physical_by_id: FxHashMap<&str, &TrackRecord> =
            physical.iter().map(|r| (r.source_id.as_str(), r)).collect();

        let mut sorted_digital: Vec<&TrackRecord> = digital.iter().collect();
        sorted_digital.sort_by(|a, b| a.source_id.cmp(&b.source_id));

        let mut tier_counts = TierCounts::default();
        let mut claimed: FxHashSet<&str> = FxHashSet::default();
        let mut entries = Vec::with_capacity(digital.len() + physical.len() + retired.len());

        for record in sorted_digital {
            let decision = decisions_by_digital.get(record.source_id.as_str()).copied();
            let matched = decision
                .and_then(|d| d.claimed_physical())
                .and_then(|id| physical_by_id.get(id).copied());

            if let Some(d) = decision {
                match (d.origin, d.tier) {
                    (Origin::Manual, tier) if tier.is_match() => tier_counts.manual += 1,
                    (_, Tier::Exact) => tier_counts.exact += 1,
                    (_, Tier::High) => tier_counts.high += 1,
                    (_, Tier::Low) => tier_counts.low += 1,
                    (_, Tier::None) => tier_counts.none += 1,
                }
            } else {
                tier_counts.none += 1;
            }

            if let Some(p) = matched {
                claimed.insert(p.source_id.as_str());
            }
            entries.push(ViewEntry {
                ownership: if matched.is_some() {
                    Ownership::Both
                } else {
                    Ownership::DigitalOnly
                },
                digital: Some(record.clone()),
                physical: matched.cloned(),
                decision: decision.cloned(),
            });
        }

        let mut unclaimed: Vec<&TrackRecord> = physical
            .iter()
            .filter(|r| !claimed.contains(r.source_id.as_str()))
            .collect();
        unclaimed.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        entries.extend(unclaimed.into_iter().map(|r| ViewEntry {
            ownership: Ownership::PhysicalOnly,
            digital: None,
            physical: Some(r.clone()),
            decision: None,
        }));

        entries.extend(retired.iter().map(|r| ViewEntry {
            ownership: Ownership::Neither,
            digital: (r.source_kind == SourceKind::Digital).then(|| r.clone()),
            physical: (r.source_kind == SourceKind::Physical).then(|| r.clone()),
            decision: None,
        }));

        Self { entries, tier_counts }
    }

    pub fn count(&self, ownership: Ownership) -> usize {
        self.entries.iter().filter(|e| e.ownership == ownership).count()
    }

    /// Physical records available but not owned digitally.
    pub fn unmatched_physical(&self) -> impl Iterator<Item = &TrackRecord> {
        self.entries
            .iter()
            .filter(|e| e.ownership == Ownership::PhysicalOnly)
            .filter_map(|e| e.physical.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
    }

    fn input<'a>(
        digital: &'a [TrackRecord],
        physical: &'a [TrackRecord],
        previous: &'a [MatchDecision],
        overrides: &'a [Override],
    ) -> RunInput<'a> {
        RunInput {
            digital,
            physical,
            previous_decisions: previous,
            overrides,
            source: ImportSource::Combined,
            source_file: None,
            started_at: t0(),
        }
    }

    fn library() -> (Vec<TrackRecord>, Vec<TrackRecord>) {
        let digital = vec![
            TrackRecord::digital("d3", "Aphex Twin", "Windowlicker"),
            TrackRecord::digital("d1", "Daft Punk", "One More Time"),
            TrackRecord::digital("42", "Daft Punk", "Digital Love"),
            TrackRecord::digital("d2", "Boards of Canada", "Roygbiv"),
        ];
        let physical = vec![
            TrackRecord::physical("100:A1", "Daft Punk", "One More Time (Radio Edit)"),
            TrackRecord::physical("100:A2", "Daft Punk", "Digital Love"),
            TrackRecord::physical("200:B1", "Aphex Twin", "Windowlicker"),
            TrackRecord::physical("300:1", "Orbital", "Halcyon"),
        ];
        (digital, physical)
    }

    fn decision_for<'a>(outcome: &'a RunOutcome, id: &str) -> &'a MatchDecision {
        outcome
            .decisions
            .iter()
            .find(|d| d.digital_source_id == id)
            .unwrap()
    }

    fn confirm(digital: &str, physical: &str) -> Override {
        Override {
            digital_source_id: digital.to_string(),
            physical_source_id: Some(physical.to_string()),
            action: OverrideAction::Confirm,
            created_at: t0(),
        }
    }

    #[test]
    fn test_run_matches_and_orders() {
        let (digital, physical) = library();
        let outcome = run(&input(&digital, &physical, &[], &[]), &RunOptions::default()).unwrap();

        let ids: Vec<&str> = outcome.decisions.iter().map(|d| d.digital_source_id.as_str()).collect();
        assert_eq!(ids, vec!["42", "d1", "d2", "d3"]);

        assert_eq!(decision_for(&outcome, "d1").physical_source_id.as_deref(), Some("100:A1"));
        assert_eq!(decision_for(&outcome, "42").physical_source_id.as_deref(), Some("100:A2"));
        assert_eq!(decision_for(&outcome, "d3").tier, Tier::Exact);
        assert_eq!(decision_for(&outcome, "d2").tier, Tier::None);
        assert_eq!(decision_for(&outcome, "d2").physical_source_id, None);

        assert_eq!(outcome.unmatched_physical, vec!["300:1".to_string()]);
        assert_eq!(outcome.batch.records_seen, 8);
        assert_eq!(outcome.batch.records_new, 4);
        assert_eq!(outcome.batch.status, BatchStatus::Success);
        assert!(outcome.batch.finished_at.is_none());
    }

    #[test]
    fn test_run_is_deterministic() {
        let (digital, physical) = library();
        let mut shuffled = digital.clone();
        shuffled.reverse();
        let a = run(&input(&digital, &physical, &[], &[]), &RunOptions::default()).unwrap();
        let b = run(&input(&shuffled, &physical, &[], &[]), &RunOptions::default()).unwrap();
        assert_eq!(a.decisions, b.decisions);
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let (digital, physical) = library();
        let first = run(&input(&digital, &physical, &[], &[]), &RunOptions::default()).unwrap();

        let mut later = input(&digital, &physical, &first.decisions, &[]);
        later.started_at = t0() + chrono::Duration::hours(1);
        let second = run(&later, &RunOptions::default()).unwrap();

        assert!(second.batch.is_unchanged());
        // Unchanged outcomes keep their original timestamp
        assert_eq!(first.decisions, second.decisions);
    }

    #[test]
    fn test_claim_exclusivity() {
        let digital = vec![
            TrackRecord::digital("a", "Artist", "Song"),
            TrackRecord::digital("b", "Artist", "Song"),
        ];
        let physical = vec![TrackRecord::physical("p", "Artist", "Song")];
        let outcome = run(&input(&digital, &physical, &[], &[]), &RunOptions::default()).unwrap();

        assert_eq!(decision_for(&outcome, "a").physical_source_id.as_deref(), Some("p"));
        assert_eq!(decision_for(&outcome, "b").tier, Tier::None);
        let claimed: Vec<_> = outcome.decisions.iter().filter_map(|d| d.claimed_physical()).collect();
        assert_eq!(claimed, vec!["p"]);
    }

    #[test]
    fn test_confirm_override_wins_regardless_of_score() {
        let (digital, physical) = library();
        // d3 pinned to a record it scores poorly against
        let overrides = vec![confirm("d3", "300:1")];
        let outcome = run(&input(&digital, &physical, &[], &overrides), &RunOptions::default()).unwrap();

        let d3 = decision_for(&outcome, "d3");
        assert_eq!(d3.physical_source_id.as_deref(), Some("300:1"));
        assert_eq!(d3.origin, Origin::Manual);
        assert_eq!(d3.tier, Tier::Exact);
        assert_eq!(outcome.stats.manual_confirmed, 1);
    }

    #[test]
    fn test_confirm_reserves_before_automatic_matching() {
        let (digital, physical) = library();
        // "42" sorts before d1 but the record d1 would match is pinned to d3
        let overrides = vec![confirm("d3", "100:A1")];
        let outcome = run(&input(&digital, &physical, &[], &overrides), &RunOptions::default()).unwrap();
        assert_eq!(decision_for(&outcome, "d3").physical_source_id.as_deref(), Some("100:A1"));
        assert_ne!(decision_for(&outcome, "d1").physical_source_id.as_deref(), Some("100:A1"));
    }

    #[test]
    fn test_reject_override_forces_unmatched() {
        let (digital, physical) = library();
        let overrides = vec![Override {
            digital_source_id: "42".to_string(),
            physical_source_id: None,
            action: OverrideAction::Reject,
            created_at: t0(),
        }];
        let outcome = run(&input(&digital, &physical, &[], &overrides), &RunOptions::default()).unwrap();

        let d = decision_for(&outcome, "42");
        assert_eq!(d.physical_source_id, None);
        assert_eq!(d.tier, Tier::None);
        assert_eq!(d.origin, Origin::Manual);
        assert!(outcome.unmatched_physical.contains(&"100:A2".to_string()));
    }

    #[test]
    fn test_removed_digital_record() {
        let (digital, physical) = library();
        let first = run(&input(&digital, &physical, &[], &[]), &RunOptions::default()).unwrap();

        let remaining: Vec<TrackRecord> = digital.into_iter().filter(|r| r.source_id != "d1").collect();
        let second = run(&input(&remaining, &physical, &first.decisions, &[]), &RunOptions::default()).unwrap();

        assert!(second.batch.records_removed >= 1);
        assert!(second.decisions.iter().all(|d| d.digital_source_id != "d1"));
    }

    #[test]
    fn test_changed_count() {
        let (digital, physical) = library();
        let first = run(&input(&digital, &physical, &[], &[]), &RunOptions::default()).unwrap();

        let overrides = vec![confirm("d2", "300:1")];
        let second = run(&input(&digital, &physical, &first.decisions, &overrides), &RunOptions::default()).unwrap();
        assert_eq!(second.batch.records_changed, 1);
        assert_eq!(second.batch.records_new, 0);
        assert_eq!(decision_for(&second, "d2").decided_at, t0());
    }

    #[test]
    fn test_malformed_records_make_partial_run() {
        let (mut digital, mut physical) = library();
        digital.push(TrackRecord::digital("d9", "", "No Artist"));
        physical.push(TrackRecord::physical("400:1", "Someone", " "));
        let outcome = run(&input(&digital, &physical, &[], &[]), &RunOptions::default()).unwrap();

        assert_eq!(outcome.batch.status, BatchStatus::Partial);
        assert_eq!(outcome.batch.records_malformed, 2);
        assert_eq!(decision_for(&outcome, "d9").tier, Tier::None);
        assert!(!outcome.unmatched_physical.contains(&"400:1".to_string()));
        let malformed = outcome
            .issues
            .iter()
            .filter(|i| matches!(i, DataQualityIssue::Malformed { .. }))
            .count();
        assert_eq!(malformed, 2);
    }

    #[test]
    fn test_degenerate_digital_record() {
        let digital = vec![TrackRecord::digital("d1", "???", "!!!")];
        let physical = vec![TrackRecord::physical("p1", "Artist", "Song")];
        let outcome = run(&input(&digital, &physical, &[], &[]), &RunOptions::default()).unwrap();
        assert_eq!(outcome.decisions[0].tier, Tier::None);
        assert_eq!(outcome.stats.degenerate_digital, 1);
        assert!(matches!(outcome.issues[0], DataQualityIssue::Degenerate { .. }));
        assert_eq!(outcome.batch.status, BatchStatus::Success);
    }

    #[test]
    fn test_stale_and_conflicting_overrides() {
        let (digital, physical) = library();
        let overrides = vec![
            confirm("d1", "100:A1"),
            confirm("d2", "100:A1"),
            confirm("d3", "999:9"),
            confirm("gone", "300:1"),
        ];
        let outcome = run(&input(&digital, &physical, &[], &overrides), &RunOptions::default()).unwrap();

        assert_eq!(decision_for(&outcome, "d1").physical_source_id.as_deref(), Some("100:A1"));
        let d2 = decision_for(&outcome, "d2");
        assert_eq!((d2.tier, d2.origin), (Tier::None, Origin::Manual));
        let d3 = decision_for(&outcome, "d3");
        assert_eq!((d3.tier, d3.origin), (Tier::None, Origin::Manual));

        assert_eq!(outcome.stats.override_conflicts, 1);
        assert_eq!(outcome.stats.stale_overrides, 2);
        assert!(outcome.issues.contains(&DataQualityIssue::StaleOverride {
            digital_source_id: "gone".to_string(),
            reason: StaleReason::DigitalRemoved,
        }));
        assert!(outcome.issues.contains(&DataQualityIssue::OverrideConflict {
            digital_source_id: "d2".to_string(),
            physical_source_id: "100:A1".to_string(),
            claimed_by: "d1".to_string(),
        }));
    }

    #[test]
    fn test_confirm_to_malformed_physical_is_reported_stale() {
        let (digital, mut physical) = library();
        physical.push(TrackRecord::physical("400:1", "Someone", " "));
        let overrides = vec![confirm("d3", "400:1")];
        let outcome = run(&input(&digital, &physical, &[], &overrides), &RunOptions::default()).unwrap();

        let d3 = decision_for(&outcome, "d3");
        assert_eq!((d3.tier, d3.origin), (Tier::None, Origin::Manual));
        assert_eq!(outcome.stats.stale_overrides, 1);
        assert!(outcome.issues.contains(&DataQualityIssue::StaleOverride {
            digital_source_id: "d3".to_string(),
            reason: StaleReason::PhysicalMalformed,
        }));
        assert_eq!(outcome.batch.status, BatchStatus::Partial);
    }

    #[test]
    fn test_duplicate_source_id_fails_run() {
        let (mut digital, physical) = library();
        digital.push(TrackRecord::digital("d1", "Other", "Thing"));
        let failure = run(&input(&digital, &physical, &[], &[]), &RunOptions::default()).unwrap_err();
        assert!(matches!(failure.error, ReconcileError::DuplicateSourceId { .. }));
        assert_eq!(failure.batch.status, BatchStatus::Failed);
        assert_eq!(failure.batch.records_seen, 9);
        assert!(failure.batch.error_message.is_some());
    }

    #[test]
    fn test_cancelled_run() {
        let (digital, physical) = library();
        let cancel = AtomicBool::new(true);
        let options = RunOptions {
            cancel: Some(&cancel),
            ..Default::default()
        };
        let failure = run(&input(&digital, &physical, &[], &[]), &options).unwrap_err();
        assert!(matches!(
            failure.error,
            ReconcileError::Cancelled { processed: 0, total: 4 }
        ));
        assert_eq!(failure.batch.status, BatchStatus::Failed);
    }

    #[test]
    fn test_unified_view() {
        let (digital, physical) = library();
        let outcome = run(&input(&digital, &physical, &[], &[]), &RunOptions::default()).unwrap();
        let retired = vec![TrackRecord::digital("old", "Gone", "Track")];
        let view = UnifiedView::build(&digital, &physical, &outcome.decisions, &retired);

        assert_eq!(view.count(Ownership::Both), 3);
        assert_eq!(view.count(Ownership::DigitalOnly), 1);
        assert_eq!(view.count(Ownership::PhysicalOnly), 1);
        assert_eq!(view.count(Ownership::Neither), 1);
        assert_eq!(view.tier_counts.none, 1);
        assert_eq!(view.tier_counts.exact + view.tier_counts.high + view.tier_counts.low, 3);

        let gap: Vec<&str> = view.unmatched_physical().map(|r| r.source_id.as_str()).collect();
        assert_eq!(gap, vec!["300:1"]);
    }
}

//! Match resolution for one digital record against the physical pool.
//!
//! Scoring fans out over rayon; ranking and claiming happen afterwards on the
//! calling thread, so the parallel step cannot change which record wins.

use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::cmp::Ordering;

use crate::models::{MatchCandidate, Origin, Override, OverrideAction, TrackRecord, Tier};
use crate::normalize::{normalize, NormalizedKey};
use crate::scoring::ScoringConfig;

// ============================================================================
// Candidate Pool
// ============================================================================

/// Physical record with its key precomputed once per run.
#[derive(Debug)]
pub struct PoolEntry<'a> {
    pub record: &'a TrackRecord,
    pub key: NormalizedKey,
}

/// All physical candidates for one run, normalized up front.
#[derive(Debug)]
pub struct CandidatePool<'a> {
    entries: Vec<PoolEntry<'a>>,
    index: FxHashMap<&'a str, usize>,
}

impl<'a> CandidatePool<'a> {
    pub fn new(records: &'a [TrackRecord]) -> Self {
        let entries: Vec<PoolEntry<'a>> = records
            .par_iter()
            .map(|record| PoolEntry {
                record,
                key: normalize(&record.artist, &record.title),
            })
            .collect();
        let index = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.record.source_id.as_str(), i))
            .collect();
        Self { entries, index }
    }

    pub fn from_refs(records: Vec<&'a TrackRecord>) -> Self {
        let entries: Vec<PoolEntry<'a>> = records
            .into_par_iter()
            .map(|record| PoolEntry {
                record,
                key: normalize(&record.artist, &record.title),
            })
            .collect();
        let index = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.record.source_id.as_str(), i))
            .collect();
        Self { entries, index }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, source_id: &str) -> bool {
        self.index.contains_key(source_id)
    }

    pub fn get(&self, source_id: &str) -> Option<&PoolEntry<'a>> {
        self.index.get(source_id).map(|&i| &self.entries[i])
    }

    pub fn entries(&self) -> &[PoolEntry<'a>] {
        &self.entries
    }
}

// ============================================================================
// Claims
// ============================================================================

/// Physical records already taken in the current pass (physical → digital).
#[derive(Debug, Default)]
pub struct ClaimSet {
    claimed: FxHashMap<String, String>,
}

impl ClaimSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_claimed(&self, physical_id: &str) -> bool {
        self.claimed.contains_key(physical_id)
    }

    pub fn claimed_by(&self, physical_id: &str) -> Option<&str> {
        self.claimed.get(physical_id).map(String::as_str)
    }

    /// Claim `physical_id` for `digital_id`. Returns false if another digital
    /// record already holds it; re-claiming by the holder is a no-op.
    pub fn claim(&mut self, physical_id: &str, digital_id: &str) -> bool {
        match self.claimed.get(physical_id) {
            Some(holder) => holder == digital_id,
            None => {
                self.claimed
                    .insert(physical_id.to_string(), digital_id.to_string());
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.claimed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claimed.is_empty()
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// How a resolution was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionKind {
    /// Scored against the unclaimed pool
    Scored,
    /// Nothing left to score against
    EmptyPool,
    /// Digital key normalized to the empty marker
    Degenerate,
    /// Confirm override applied
    Confirmed,
    /// Reject override applied
    Rejected,
    /// Confirm override points at a physical record not in this snapshot
    StaleConfirm,
    /// Confirm override points at a record another confirm already holds
    ConflictingConfirm,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    /// Top candidate; its tier decides whether the record is matched
    pub best: MatchCandidate,
    /// Full ranking for manual review (empty for overrides and degenerates)
    pub ranked: Vec<MatchCandidate>,
    pub origin: Origin,
    pub kind: ResolutionKind,
}

impl Resolution {
    fn manual(best: MatchCandidate, kind: ResolutionKind) -> Self {
        Self {
            best,
            ranked: Vec::new(),
            origin: Origin::Manual,
            kind,
        }
    }

    /// Physical id the decision should record (only for a matching tier).
    pub fn matched_physical(&self) -> Option<&str> {
        if self.best.tier.is_match() {
            self.best.physical_source_id.as_deref()
        } else {
            None
        }
    }
}

/// Ordering for ranked candidates: score descending, then the candidate
/// matched last run, then smallest physical id.
fn rank_order(a: &MatchCandidate, b: &MatchCandidate, previous: Option<&str>) -> Ordering {
    let was_previous = |c: &MatchCandidate| previous.is_some() && c.physical_source_id.as_deref() == previous;
    b.score
        .total_cmp(&a.score)
        .then_with(|| was_previous(b).cmp(&was_previous(a)))
        .then_with(|| a.physical_source_id.cmp(&b.physical_source_id))
}

pub struct Resolver {
    config: ScoringConfig,
}

impl Resolver {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Score `key` against every unclaimed pool entry and rank the result.
    /// Pure: nothing is claimed.
    pub fn rank(
        &self,
        digital_id: &str,
        key: &NormalizedKey,
        pool: &CandidatePool<'_>,
        claims: &ClaimSet,
        previous: Option<&str>,
    ) -> Vec<MatchCandidate> {
        let config = &self.config;
        let mut ranked: Vec<MatchCandidate> = pool
            .entries()
            .par_iter()
            .filter(|entry| !claims.is_claimed(&entry.record.source_id))
            .map(|entry| {
                let score = config.score(key, &entry.key);
                MatchCandidate {
                    digital_source_id: digital_id.to_string(),
                    physical_source_id: Some(entry.record.source_id.clone()),
                    score,
                    tier: config.tier_for(score),
                }
            })
            .collect();
        ranked.sort_by(|a, b| rank_order(a, b, previous));
        ranked
    }

    /// Resolve one digital record and claim the winner.
    ///
    /// `pinned` is the record's active override, if any; it wins outright and
    /// scoring is skipped. `previous` is the physical id this record was
    /// matched to in the last run, used only to break score ties.
    pub fn resolve(
        &self,
        digital: &TrackRecord,
        pool: &CandidatePool<'_>,
        claims: &mut ClaimSet,
        previous: Option<&str>,
        pinned: Option<&Override>,
    ) -> Resolution {
        let digital_id = digital.source_id.as_str();

        if let Some(pin) = pinned {
            return self.apply_override(digital_id, pin, pool, claims);
        }

        let key = normalize(&digital.artist, &digital.title);
        if key.is_empty() {
            return Resolution {
                best: MatchCandidate::unmatched(digital_id),
                ranked: Vec::new(),
                origin: Origin::Automatic,
                kind: ResolutionKind::Degenerate,
            };
        }

        let ranked = self.rank(digital_id, &key, pool, claims, previous);
        let Some(best) = ranked.first().cloned() else {
            return Resolution {
                best: MatchCandidate::unmatched(digital_id),
                ranked,
                origin: Origin::Automatic,
                kind: ResolutionKind::EmptyPool,
            };
        };

        if best.tier.is_match() {
            if let Some(physical_id) = best.physical_source_id.as_deref() {
                claims.claim(physical_id, digital_id);
            }
        }

        Resolution {
            best,
            ranked,
            origin: Origin::Automatic,
            kind: ResolutionKind::Scored,
        }
    }

    fn apply_override(
        &self,
        digital_id: &str,
        pin: &Override,
        pool: &CandidatePool<'_>,
        claims: &mut ClaimSet,
    ) -> Resolution {
        let physical_id = match (pin.action, pin.physical_source_id.as_deref()) {
            (OverrideAction::Confirm, Some(physical_id)) => physical_id,
            // A confirm without a target behaves like a reject
            _ => {
                return Resolution::manual(
                    MatchCandidate::unmatched(digital_id),
                    ResolutionKind::Rejected,
                )
            }
        };

        if !pool.contains(physical_id) {
            return Resolution::manual(
                MatchCandidate::unmatched(digital_id),
                ResolutionKind::StaleConfirm,
            );
        }

        if !claims.claim(physical_id, digital_id) {
            return Resolution::manual(
                MatchCandidate::unmatched(digital_id),
                ResolutionKind::ConflictingConfirm,
            );
        }

        Resolution::manual(
            MatchCandidate {
                digital_source_id: digital_id.to_string(),
                physical_source_id: Some(physical_id.to_string()),
                score: 1.0,
                tier: Tier::Exact,
            },
            ResolutionKind::Confirmed,
        )
    }
}

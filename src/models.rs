//! Core data models for collection reconciliation.
//!
//! This module contains the record, decision, override, and ledger types
//! shared by the matching engine, the SQLite store, and the CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Source Records
// ============================================================================

/// Which catalog a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Local media-player library export
    Digital,
    /// Marketplace/collection catalog, expanded from releases
    Physical,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Digital => "digital",
            SourceKind::Physical => "physical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "digital" => Some(SourceKind::Digital),
            "physical" => Some(SourceKind::Physical),
            _ => None,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File attributes carried only by digital records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitalAttributes {
    pub file_path: Option<String>,
    pub format: Option<String>, // mp3, flac, wav, ...
    pub bitrate: Option<u32>,   // kbps
}

/// Source-agnostic track record as handed over by a source reader.
///
/// Immutable for the duration of one import. A re-import with the same
/// `(source_kind, source_id)` and any differing field supersedes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub source_kind: SourceKind,
    pub source_id: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub duration_sec: Option<i64>,
    /// Track index within a release ("A1", "B2", "3"); physical only
    #[serde(default)]
    pub position: Option<String>,
    /// Release format ("vinyl", "cd", ...); physical only
    #[serde(default)]
    pub format_type: Option<String>,
    #[serde(default)]
    pub digital: Option<DigitalAttributes>,
}

impl TrackRecord {
    pub fn new(source_kind: SourceKind, source_id: &str, artist: &str, title: &str) -> Self {
        Self {
            source_kind,
            source_id: source_id.to_string(),
            artist: artist.to_string(),
            title: title.to_string(),
            album: None,
            label: None,
            year: None,
            duration_sec: None,
            position: None,
            format_type: None,
            digital: None,
        }
    }

    pub fn digital(source_id: &str, artist: &str, title: &str) -> Self {
        Self::new(SourceKind::Digital, source_id, artist, title)
    }

    pub fn physical(source_id: &str, artist: &str, title: &str) -> Self {
        Self::new(SourceKind::Physical, source_id, artist, title)
    }

    /// Name of the first required field that is missing, if any.
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.artist.trim().is_empty() {
            Some("artist")
        } else if self.title.trim().is_empty() {
            Some("title")
        } else {
            None
        }
    }

    pub fn is_malformed(&self) -> bool {
        self.missing_field().is_some()
    }
}

/// Physical release as yielded by the collection reader, before expansion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub release_id: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub format_type: Option<String>,
    #[serde(default)]
    pub tracks: Vec<ReleaseTrack>,
}

/// One position on a release. `artist` falls back to the release artist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseTrack {
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub duration_sec: Option<i64>,
}

// ============================================================================
// Matching Models
// ============================================================================

/// Discrete confidence bucket derived from a similarity score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Exact,
    High,
    Low,
    None,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Exact => "exact",
            Tier::High => "high",
            Tier::Low => "low",
            Tier::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exact" => Some(Tier::Exact),
            "high" => Some(Tier::High),
            "low" => Some(Tier::Low),
            "none" => Some(Tier::None),
            _ => None,
        }
    }

    /// Anything above `none` claims its physical record.
    pub fn is_match(self) -> bool {
        self != Tier::None
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who made a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Automatic,
    Manual,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Automatic => "automatic",
            Origin::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "automatic" => Some(Origin::Automatic),
            "manual" => Some(Origin::Manual),
            _ => None,
        }
    }
}

/// Scored pairing produced during one resolution pass (never persisted).
/// `physical_source_id` is `None` only when the candidate pool was empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchCandidate {
    pub digital_source_id: String,
    pub physical_source_id: Option<String>,
    pub score: f64,
    pub tier: Tier,
}

impl MatchCandidate {
    pub fn unmatched(digital_source_id: &str) -> Self {
        Self {
            digital_source_id: digital_source_id.to_string(),
            physical_source_id: None,
            score: 0.0,
            tier: Tier::None,
        }
    }
}

/// Persisted outcome for one digital record. Exactly one per digital id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchDecision {
    pub digital_source_id: String,
    pub physical_source_id: Option<String>,
    pub tier: Tier,
    pub origin: Origin,
    pub score: f64,
    pub decided_at: DateTime<Utc>,
}

impl MatchDecision {
    /// Same pairing, tier and origin. Score and timestamp are not compared.
    pub fn same_outcome(&self, other: &MatchDecision) -> bool {
        self.physical_source_id == other.physical_source_id
            && self.tier == other.tier
            && self.origin == other.origin
    }

    /// Physical id this decision holds, if its tier claims one.
    pub fn claimed_physical(&self) -> Option<&str> {
        if self.tier.is_match() {
            self.physical_source_id.as_deref()
        } else {
            None
        }
    }
}

// ============================================================================
// Overrides
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideAction {
    Confirm,
    Reject,
}

impl OverrideAction {
    pub fn as_str(self) -> &'static str {
        match self {
            OverrideAction::Confirm => "confirm",
            OverrideAction::Reject => "reject",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "confirm" => Some(OverrideAction::Confirm),
            "reject" => Some(OverrideAction::Reject),
            _ => None,
        }
    }
}

/// User decision pinning one digital record. `physical_source_id` is `None`
/// for a reject (forced unmatched).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Override {
    pub digital_source_id: String,
    pub physical_source_id: Option<String>,
    pub action: OverrideAction,
    pub created_at: DateTime<Utc>,
}

/// Why an override no longer lines up with the current catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleReason {
    DigitalRemoved,
    PhysicalRemoved,
    /// Still in the collection but missing artist or title
    PhysicalMalformed,
}

// ============================================================================
// Import Ledger
// ============================================================================

/// Where a run's snapshots came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportSource {
    TraktorNml,
    DiscogsApi,
    DiscogsCsv,
    /// Both snapshots re-read together
    Combined,
}

impl ImportSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ImportSource::TraktorNml => "traktor_nml",
            ImportSource::DiscogsApi => "discogs_api",
            ImportSource::DiscogsCsv => "discogs_csv",
            ImportSource::Combined => "combined",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "traktor_nml" => Some(ImportSource::TraktorNml),
            "discogs_api" => Some(ImportSource::DiscogsApi),
            "discogs_csv" => Some(ImportSource::DiscogsCsv),
            "combined" => Some(ImportSource::Combined),
            _ => None,
        }
    }

    pub fn source_kind(self) -> Option<SourceKind> {
        match self {
            ImportSource::TraktorNml => Some(SourceKind::Digital),
            ImportSource::DiscogsApi | ImportSource::DiscogsCsv => Some(SourceKind::Physical),
            ImportSource::Combined => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Success,
    /// Committed, but some records were excluded as malformed
    Partial,
    /// Nothing committed
    Failed,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Success => "success",
            BatchStatus::Partial => "partial",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(BatchStatus::Success),
            "partial" => Some(BatchStatus::Partial),
            "failed" => Some(BatchStatus::Failed),
            _ => None,
        }
    }
}

/// Audit row for one reconciliation run. Counts are the diff against the
/// previous decision set, not the raw decision totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportBatch {
    /// Assigned by the ledger on append
    pub batch_id: Option<i64>,
    pub source: ImportSource,
    pub source_kind: Option<SourceKind>,
    pub source_file: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub records_seen: u64,
    pub records_new: u64,
    pub records_changed: u64,
    pub records_removed: u64,
    pub records_malformed: u64,
    pub status: BatchStatus,
    pub error_message: Option<String>,
}

impl ImportBatch {
    /// Empty batch for a run that has just started.
    pub fn begin(source: ImportSource, source_file: Option<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            batch_id: None,
            source,
            source_kind: source.source_kind(),
            source_file,
            started_at,
            finished_at: None,
            records_seen: 0,
            records_new: 0,
            records_changed: 0,
            records_removed: 0,
            records_malformed: 0,
            status: BatchStatus::Success,
            error_message: None,
        }
    }

    pub fn is_unchanged(&self) -> bool {
        self.records_new == 0 && self.records_changed == 0 && self.records_removed == 0
    }
}

// ============================================================================
// Data Quality
// ============================================================================

/// Recoverable condition found during a run. Counted and logged, never fatal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataQualityIssue {
    /// Required field missing; record excluded from matching
    Malformed {
        source_kind: SourceKind,
        source_id: String,
        missing: &'static str,
    },
    /// Artist and title both normalize to nothing
    Degenerate {
        source_kind: SourceKind,
        source_id: String,
    },
    /// Override points at a record that is gone from the current snapshot
    StaleOverride {
        digital_source_id: String,
        reason: StaleReason,
    },
    /// Confirm override lost its physical record to an earlier confirm
    OverrideConflict {
        digital_source_id: String,
        physical_source_id: String,
        claimed_by: String,
    },
}

// ============================================================================
// Statistics (Instrumentation)
// ============================================================================

/// Per-run matching statistics, logged as JSON at the end of a run.
#[derive(Default, Debug, Clone, Serialize)]
pub struct RunStats {
    // Inputs
    pub digital_records: usize,
    pub physical_records: usize,
    pub malformed_digital: usize,
    pub malformed_physical: usize,
    pub degenerate_digital: usize,

    // Manual decisions
    pub manual_confirmed: usize,
    pub manual_rejected: usize,
    pub stale_overrides: usize,
    pub override_conflicts: usize,

    // Automatic tiers
    pub exact_matches: usize,
    pub high_matches: usize,
    pub low_matches: usize,
    pub unmatched_digital: usize,

    // Symmetric gap
    pub unmatched_physical: usize,

    pub elapsed_seconds: f64,
}

impl RunStats {
    /// Share of digital records holding a physical match, as a percentage
    pub fn match_rate(&self) -> f64 {
        if self.digital_records == 0 {
            0.0
        } else {
            let matched =
                self.manual_confirmed + self.exact_matches + self.high_matches + self.low_matches;
            100.0 * matched as f64 / self.digital_records as f64
        }
    }

    pub fn record_tier(&mut self, tier: Tier) {
        match tier {
            Tier::Exact => self.exact_matches += 1,
            Tier::High => self.high_matches += 1,
            Tier::Low => self.low_matches += 1,
            Tier::None => self.unmatched_digital += 1,
        }
    }

    /// Log stats at info level in JSON format
    pub fn log_phase(&self, phase: &str) {
        if let Ok(json) = serde_json::to_string(self) {
            tracing::info!(phase, stats = %json, "run statistics");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_field() {
        assert_eq!(TrackRecord::digital("1", "", "Song").missing_field(), Some("artist"));
        assert_eq!(TrackRecord::digital("1", "Artist", "  ").missing_field(), Some("title"));
        assert!(!TrackRecord::digital("1", "Artist", "Song").is_malformed());
    }

    #[test]
    fn test_enum_round_trip_strings() {
        for tier in [Tier::Exact, Tier::High, Tier::Low, Tier::None] {
            assert_eq!(Tier::parse(tier.as_str()), Some(tier));
        }
        assert_eq!(ImportSource::parse("discogs_csv"), Some(ImportSource::DiscogsCsv));
        assert_eq!(BatchStatus::parse("bogus"), None);
    }

    #[test]
    fn test_import_source_kind() {
        assert_eq!(ImportSource::TraktorNml.source_kind(), Some(SourceKind::Digital));
        assert_eq!(ImportSource::DiscogsApi.source_kind(), Some(SourceKind::Physical));
        assert_eq!(ImportSource::Combined.source_kind(), None);
    }

    #[test]
    fn test_claimed_physical_ignores_none_tier() {
        let decision = MatchDecision {
            digital_source_id: "d1".to_string(),
            physical_source_id: Some("p1".to_string()),
            tier: Tier::None,
            origin: Origin::Automatic,
            score: 0.3,
            decided_at: Utc::now(),
        };
        assert_eq!(decision.claimed_physical(), None);
    }

    #[test]
    fn test_match_rate() {
        let mut stats = RunStats {
            digital_records: 4,
            manual_confirmed: 1,
            ..Default::default()
        };
        stats.record_tier(Tier::Exact);
        stats.record_tier(Tier::None);
        assert!((stats.match_rate() - 50.0).abs() < 1e-9);
    }
}

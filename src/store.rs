//! SQLite persistence for tracks, decisions, overrides and the import ledger.
//!
//! Every function takes a plain `&Connection`, so callers can pass either a
//! connection or an open `Transaction` (which derefs to one).

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::path::Path;

use crate::error::StoreError;
use crate::models::{DigitalAttributes, MatchDecision, Origin, SourceKind, Tier, TrackRecord};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS tracks (
        source_kind TEXT NOT NULL,
        source_id TEXT NOT NULL,
        artist TEXT NOT NULL,
        title TEXT NOT NULL,
        album TEXT,
        label TEXT,
        year INTEGER,
        duration_sec INTEGER,
        position TEXT,
        format_type TEXT,
        file_path TEXT,
        file_format TEXT,
        bitrate INTEGER,
        present INTEGER NOT NULL DEFAULT 1,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (source_kind, source_id)
    );

    CREATE TABLE IF NOT EXISTS match_decisions (
        digital_source_id TEXT PRIMARY KEY,
        physical_source_id TEXT,
        tier TEXT NOT NULL,
        origin TEXT NOT NULL,
        score REAL NOT NULL,
        decided_at TEXT NOT NULL
    );

    -- A physical record backs at most one matched decision
    CREATE UNIQUE INDEX IF NOT EXISTS idx_decisions_claimed
        ON match_decisions(physical_source_id)
        WHERE tier != 'none' AND physical_source_id IS NOT NULL;

    CREATE TABLE IF NOT EXISTS overrides (
        digital_source_id TEXT PRIMARY KEY,
        physical_source_id TEXT,
        action TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS import_batches (
        batch_id INTEGER PRIMARY KEY AUTOINCREMENT,
        source TEXT NOT NULL,
        source_kind TEXT,
        source_file TEXT,
        started_at TEXT NOT NULL,
        finished_at TEXT NOT NULL,
        records_seen INTEGER NOT NULL,
        records_new INTEGER NOT NULL,
        records_changed INTEGER NOT NULL,
        records_removed INTEGER NOT NULL,
        records_malformed INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_batches_source ON import_batches(source, status);

    CREATE TRIGGER IF NOT EXISTS import_batches_no_update
    BEFORE UPDATE ON import_batches
    BEGIN
        SELECT RAISE(ABORT, 'import_batches is append-only');
    END;

    CREATE TRIGGER IF NOT EXISTS import_batches_no_delete
    BEFORE DELETE ON import_batches
    BEGIN
        SELECT RAISE(ABORT, 'import_batches is append-only');
    END;
";

// ============================================================================
// Opening
// ============================================================================

/// Open (creating if needed) the store at `path` and apply the schema.
pub fn open(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA temp_store = MEMORY;",
    )?;
    migrate(&conn)?;
    tracing::debug!(path = %path.display(), "opened store");
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection, StoreError> {
    let conn = Connection::open_in_memory()?;
    migrate(&conn)?;
    Ok(conn)
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

// ============================================================================
// Row Helpers
// ============================================================================

pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub(crate) fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn optional_timestamp_at(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

/// Read a TEXT column through one of the models' `parse` functions.
pub(crate) fn enum_at<T>(
    row: &Row<'_>,
    idx: usize,
    parse: fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unexpected value '{}'", raw).into(),
        )
    })
}

pub(crate) fn optional_enum_at<T>(
    row: &Row<'_>,
    idx: usize,
    parse: fn(&str) -> Option<T>,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        parse(&raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                Type::Text,
                format!("unexpected value '{}'", raw).into(),
            )
        })
    })
    .transpose()
}

// ============================================================================
// Tracks
// ============================================================================

const TRACK_COLUMNS: &str = "source_kind, source_id, artist, title, album, label, year, \
     duration_sec, position, format_type, file_path, file_format, bitrate, present";

/// A stored track plus whether it was in the latest snapshot of its source.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTrack {
    pub record: TrackRecord,
    pub present: bool,
}

fn track_from_row(row: &Row<'_>) -> rusqlite::Result<StoredTrack> {
    let file_path: Option<String> = row.get(10)?;
    let file_format: Option<String> = row.get(11)?;
    let bitrate: Option<u32> = row.get(12)?;
    let digital = if file_path.is_some() || file_format.is_some() || bitrate.is_some() {
        Some(DigitalAttributes {
            file_path,
            format: file_format,
            bitrate,
        })
    } else {
        None
    };

    Ok(StoredTrack {
        record: TrackRecord {
            source_kind: enum_at(row, 0, SourceKind::parse)?,
            source_id: row.get(1)?,
            artist: row.get(2)?,
            title: row.get(3)?,
            album: row.get(4)?,
            label: row.get(5)?,
            year: row.get(6)?,
            duration_sec: row.get(7)?,
            position: row.get(8)?,
            format_type: row.get(9)?,
            digital,
        },
        present: row.get(13)?,
    })
}

/// How an upsert changed the stored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// Some field differed, or the record came back after being absent
    Updated,
    Unchanged,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrackSyncStats {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Previously present, missing from this snapshot
    pub retired: usize,
}

pub fn get_track(
    conn: &Connection,
    kind: SourceKind,
    source_id: &str,
) -> Result<Option<StoredTrack>, StoreError> {
    let sql = format!(
        "SELECT {} FROM tracks WHERE source_kind = ?1 AND source_id = ?2",
        TRACK_COLUMNS
    );
    let track = conn
        .query_row(&sql, params![kind.as_str(), source_id], track_from_row)
        .optional()?;
    Ok(track)
}

/// True if the record exists and was in its source's latest snapshot.
pub fn track_present(conn: &Connection, kind: SourceKind, source_id: &str) -> Result<bool, StoreError> {
    let present: Option<bool> = conn
        .query_row(
            "SELECT present FROM tracks WHERE source_kind = ?1 AND source_id = ?2",
            params![kind.as_str(), source_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(present.unwrap_or(false))
}

/// Insert or supersede one record, keyed by (source_kind, source_id).
pub fn upsert_track(
    conn: &Connection,
    record: &TrackRecord,
    now: &DateTime<Utc>,
) -> Result<UpsertOutcome, StoreError> {
    let existing = get_track(conn, record.source_kind, &record.source_id)?;
    let outcome = match &existing {
        None => UpsertOutcome::Inserted,
        Some(stored) if stored.present && stored.record == *record => {
            return Ok(UpsertOutcome::Unchanged)
        }
        Some(_) => UpsertOutcome::Updated,
    };

    let attrs = record.digital.as_ref();
    let mut stmt = conn.prepare_cached(
        "INSERT INTO tracks (source_kind, source_id, artist, title, album, label, year,
                             duration_sec, position, format_type, file_path, file_format,
                             bitrate, present, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 1, ?14)
         ON CONFLICT(source_kind, source_id) DO UPDATE SET
            artist = excluded.artist,
            title = excluded.title,
            album = excluded.album,
            label = excluded.label,
            year = excluded.year,
            duration_sec = excluded.duration_sec,
            position = excluded.position,
            format_type = excluded.format_type,
            file_path = excluded.file_path,
            file_format = excluded.file_format,
            bitrate = excluded.bitrate,
            present = 1,
            updated_at = excluded.updated_at",
    )?;
    stmt.execute(params![
        record.source_kind.as_str(),
        record.source_id,
        record.artist,
        record.title,
        record.album,
        record.label,
        record.year,
        record.duration_sec,
        record.position,
        record.format_type,
        attrs.and_then(|a| a.file_path.as_deref()),
        attrs.and_then(|a| a.format.as_deref()),
        attrs.and_then(|a| a.bitrate),
        format_timestamp(now),
    ])?;
    Ok(outcome)
}

/// Bring the stored records of one source in line with a full snapshot.
/// Records missing from the snapshot are kept but marked not present.
pub fn sync_tracks(
    conn: &Connection,
    kind: SourceKind,
    records: &[TrackRecord],
    now: &DateTime<Utc>,
) -> Result<TrackSyncStats, StoreError> {
    let mut stats = TrackSyncStats::default();
    let mut seen: FxHashSet<&str> = FxHashSet::default();

    for record in records.iter().filter(|r| r.source_kind == kind) {
        seen.insert(record.source_id.as_str());
        match upsert_track(conn, record, now)? {
            UpsertOutcome::Inserted => stats.inserted += 1,
            UpsertOutcome::Updated => stats.updated += 1,
            UpsertOutcome::Unchanged => stats.unchanged += 1,
        }
    }

    let present_ids: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT source_id FROM tracks WHERE source_kind = ?1 AND present = 1",
        )?;
        let rows = stmt.query_map([kind.as_str()], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    let mut retire = conn.prepare_cached(
        "UPDATE tracks SET present = 0, updated_at = ?3
         WHERE source_kind = ?1 AND source_id = ?2",
    )?;
    for source_id in present_ids.iter().filter(|id| !seen.contains(id.as_str())) {
        retire.execute(params![kind.as_str(), source_id, format_timestamp(now)])?;
        stats.retired += 1;
    }

    tracing::debug!(
        kind = %kind,
        inserted = stats.inserted,
        updated = stats.updated,
        unchanged = stats.unchanged,
        retired = stats.retired,
        "synced tracks"
    );
    Ok(stats)
}

fn query_tracks(conn: &Connection, kind: SourceKind, present: bool) -> Result<Vec<TrackRecord>, StoreError> {
    let sql = format!(
        "SELECT {} FROM tracks WHERE source_kind = ?1 AND present = ?2 ORDER BY source_id",
        TRACK_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![kind.as_str(), present], track_from_row)?;
    let mut tracks = Vec::new();
    for row in rows {
        tracks.push(row?.record);
    }
    Ok(tracks)
}

/// Records in the latest snapshot of `kind`, ordered by source id.
pub fn load_tracks(conn: &Connection, kind: SourceKind) -> Result<Vec<TrackRecord>, StoreError> {
    query_tracks(conn, kind, true)
}

/// Records of `kind` that dropped out of their source.
pub fn load_retired_tracks(conn: &Connection, kind: SourceKind) -> Result<Vec<TrackRecord>, StoreError> {
    query_tracks(conn, kind, false)
}

/// Escape LIKE wildcards so user text matches literally.
fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Case-insensitive partial match on artist and/or title.
pub fn search_tracks(
    conn: &Connection,
    kind: Option<SourceKind>,
    artist: Option<&str>,
    title: Option<&str>,
    limit: usize,
) -> Result<Vec<TrackRecord>, StoreError> {
    let mut conditions = vec!["present = 1".to_string()];
    let mut values: Vec<String> = Vec::new();

    if let Some(kind) = kind {
        values.push(kind.as_str().to_string());
        conditions.push(format!("source_kind = ?{}", values.len()));
    }
    if let Some(artist) = artist {
        values.push(format!("%{}%", escape_like(&artist.to_lowercase())));
        conditions.push(format!("LOWER(artist) LIKE ?{} ESCAPE '\\'", values.len()));
    }
    if let Some(title) = title {
        values.push(format!("%{}%", escape_like(&title.to_lowercase())));
        conditions.push(format!("LOWER(title) LIKE ?{} ESCAPE '\\'", values.len()));
    }

    let sql = format!(
        "SELECT {} FROM tracks WHERE {} ORDER BY source_kind, source_id LIMIT {}",
        TRACK_COLUMNS,
        conditions.join(" AND "),
        limit
    );
    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn ToSql> = values.iter().map(|s| s as &dyn ToSql).collect();
    let rows = stmt.query_map(params.as_slice(), track_from_row)?;
    let mut tracks = Vec::new();
    for row in rows {
        tracks.push(row?.record);
    }
    Ok(tracks)
}

// ============================================================================
// Decisions
// ============================================================================

fn decision_from_row(row: &Row<'_>) -> rusqlite::Result<MatchDecision> {
    Ok(MatchDecision {
        digital_source_id: row.get(0)?,
        physical_source_id: row.get(1)?,
        tier: enum_at(row, 2, Tier::parse)?,
        origin: enum_at(row, 3, Origin::parse)?,
        score: row.get(4)?,
        decided_at: timestamp_at(row, 5)?,
    })
}

/// The committed decision set, ordered by digital source id.
pub fn load_decisions(conn: &Connection) -> Result<Vec<MatchDecision>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT digital_source_id, physical_source_id, tier, origin, score, decided_at
         FROM match_decisions
         ORDER BY digital_source_id",
    )?;
    let rows = stmt.query_map([], decision_from_row)?;
    let decisions = rows.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(decisions)
}

pub fn get_decision(conn: &Connection, digital_source_id: &str) -> Result<Option<MatchDecision>, StoreError> {
    let decision = conn
        .query_row(
            "SELECT digital_source_id, physical_source_id, tier, origin, score, decided_at
             FROM match_decisions
             WHERE digital_source_id = ?1",
            [digital_source_id],
            decision_from_row,
        )
        .optional()?;
    Ok(decision)
}

/// Swap the whole decision set. Call inside the run's transaction.
pub fn replace_decisions(conn: &Connection, decisions: &[MatchDecision]) -> Result<(), StoreError> {
    conn.execute("DELETE FROM match_decisions", [])?;
    let mut stmt = conn.prepare_cached(
        "INSERT INTO match_decisions
            (digital_source_id, physical_source_id, tier, origin, score, decided_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for d in decisions {
        stmt.execute(params![
            d.digital_source_id,
            d.physical_source_id,
            d.tier.as_str(),
            d.origin.as_str(),
            d.score,
            format_timestamp(&d.decided_at),
        ])?;
    }
    Ok(())
}

//! Append-only import ledger, one row per reconciliation run.
//!
//! UPDATE and DELETE on `import_batches` are rejected by triggers, so a row
//! cannot change once it has been written.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::StoreError;
use crate::models::{BatchStatus, ImportBatch, ImportSource, SourceKind};
use crate::store::{enum_at, format_timestamp, optional_enum_at, optional_timestamp_at, timestamp_at};

const BATCH_COLUMNS: &str = "batch_id, source, source_kind, source_file, started_at, finished_at, \
     records_seen, records_new, records_changed, records_removed, records_malformed, \
     status, error_message";

fn batch_from_row(row: &Row<'_>) -> rusqlite::Result<ImportBatch> {
    let count = |idx: usize| -> rusqlite::Result<u64> { row.get::<_, i64>(idx).map(|n| n as u64) };
    Ok(ImportBatch {
        batch_id: row.get(0)?,
        source: enum_at(row, 1, ImportSource::parse)?,
        source_kind: optional_enum_at(row, 2, SourceKind::parse)?,
        source_file: row.get(3)?,
        started_at: timestamp_at(row, 4)?,
        finished_at: optional_timestamp_at(row, 5)?,
        records_seen: count(6)?,
        records_new: count(7)?,
        records_changed: count(8)?,
        records_removed: count(9)?,
        records_malformed: count(10)?,
        status: enum_at(row, 11, BatchStatus::parse)?,
        error_message: row.get(12)?,
    })
}

/// Write one finished batch and return its id.
pub fn append(conn: &Connection, batch: &ImportBatch) -> Result<i64, StoreError> {
    let finished_at = batch.finished_at.as_ref().ok_or(StoreError::UnfinishedBatch)?;
    conn.execute(
        "INSERT INTO import_batches
            (source, source_kind, source_file, started_at, finished_at,
             records_seen, records_new, records_changed, records_removed, records_malformed,
             status, error_message)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            batch.source.as_str(),
            batch.source_kind.map(SourceKind::as_str),
            batch.source_file,
            format_timestamp(&batch.started_at),
            format_timestamp(finished_at),
            batch.records_seen as i64,
            batch.records_new as i64,
            batch.records_changed as i64,
            batch.records_removed as i64,
            batch.records_malformed as i64,
            batch.status.as_str(),
            batch.error_message,
        ],
    )?;
    let batch_id = conn.last_insert_rowid();
    tracing::debug!(batch_id, status = batch.status.as_str(), "appended import batch");
    Ok(batch_id)
}

/// Most recent batches first.
pub fn history(conn: &Connection, limit: usize) -> Result<Vec<ImportBatch>, StoreError> {
    let sql = format!(
        "SELECT {} FROM import_batches ORDER BY batch_id DESC LIMIT ?1",
        BATCH_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([limit as i64], batch_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Latest committed batch (success or partial) for `source`.
pub fn latest_successful(conn: &Connection, source: ImportSource) -> Result<Option<ImportBatch>, StoreError> {
    let sql = format!(
        "SELECT {} FROM import_batches
         WHERE source = ?1 AND status IN ('success', 'partial')
         ORDER BY batch_id DESC LIMIT 1",
        BATCH_COLUMNS
    );
    let batch = conn
        .query_row(&sql, [source.as_str()], batch_from_row)
        .optional()?;
    Ok(batch)
}

pub fn by_status(conn: &Connection, status: BatchStatus) -> Result<Vec<ImportBatch>, StoreError> {
    let sql = format!(
        "SELECT {} FROM import_batches WHERE status = ?1 ORDER BY batch_id DESC",
        BATCH_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([status.as_str()], batch_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_in_memory;
    use chrono::{Duration, TimeZone, Utc};

    fn finished(source: ImportSource, status: BatchStatus) -> ImportBatch {
        let started = Utc.with_ymd_and_hms(2024, 5, 4, 10, 0, 0).unwrap();
        let mut batch = ImportBatch::begin(source, Some("collection.json".to_string()), started);
        batch.finished_at = Some(started + Duration::seconds(3));
        batch.records_seen = 12;
        batch.records_new = 4;
        batch.status = status;
        batch
    }

    #[test]
    fn test_append_and_history() {
        let conn = open_in_memory().unwrap();
        let first = append(&conn, &finished(ImportSource::TraktorNml, BatchStatus::Success)).unwrap();
        let second = append(&conn, &finished(ImportSource::DiscogsCsv, BatchStatus::Failed)).unwrap();
        assert!(second > first);

        let rows = history(&conn, 10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].batch_id, Some(second));
        assert_eq!(rows[0].source_kind, Some(SourceKind::Physical));
        assert_eq!(rows[1].records_new, 4);
        assert_eq!(rows[1].source_file.as_deref(), Some("collection.json"));

        assert_eq!(history(&conn, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_unfinished_batch_is_rejected() {
        let conn = open_in_memory().unwrap();
        let batch = ImportBatch::begin(ImportSource::Combined, None, Utc::now());
        assert!(matches!(append(&conn, &batch), Err(StoreError::UnfinishedBatch)));
    }

    #[test]
    fn test_rows_are_immutable() {
        let conn = open_in_memory().unwrap();
        append(&conn, &finished(ImportSource::Combined, BatchStatus::Success)).unwrap();
        assert!(conn.execute("UPDATE import_batches SET status = 'failed'", []).is_err());
        assert!(conn.execute("DELETE FROM import_batches", []).is_err());
        assert_eq!(history(&conn, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_latest_successful_and_by_status() {
        let conn = open_in_memory().unwrap();
        append(&conn, &finished(ImportSource::Combined, BatchStatus::Success)).unwrap();
        let partial = append(&conn, &finished(ImportSource::Combined, BatchStatus::Partial)).unwrap();
        append(&conn, &finished(ImportSource::Combined, BatchStatus::Failed)).unwrap();

        let latest = latest_successful(&conn, ImportSource::Combined).unwrap().unwrap();
        assert_eq!(latest.batch_id, Some(partial));
        assert!(latest_successful(&conn, ImportSource::DiscogsApi).unwrap().is_none());

        assert_eq!(by_status(&conn, BatchStatus::Failed).unwrap().len(), 1);
    }
}

//! User overrides that pin a digital record's decision.
//!
//! An override survives until `clear` is called. Overrides whose records have
//! left the catalog are kept and reported as stale on read.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::error::OverrideError;
use crate::models::{Override, OverrideAction, SourceKind, StaleReason};
use crate::store::{enum_at, format_timestamp, get_track, timestamp_at, track_present};

fn override_from_row(row: &Row<'_>) -> rusqlite::Result<Override> {
    Ok(Override {
        digital_source_id: row.get(0)?,
        physical_source_id: row.get(1)?,
        action: enum_at(row, 2, OverrideAction::parse)?,
        created_at: timestamp_at(row, 3)?,
    })
}

/// An override together with its staleness against the stored catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverrideStatus {
    #[serde(flatten)]
    pub pin: Override,
    pub stale: Option<StaleReason>,
}

pub struct OverrideStore<'c> {
    conn: &'c Connection,
}

impl<'c> OverrideStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    fn require_present(&self, kind: SourceKind, source_id: &str) -> Result<(), OverrideError> {
        if track_present(self.conn, kind, source_id)? {
            Ok(())
        } else {
            Err(OverrideError::UnknownRecord {
                kind,
                source_id: source_id.to_string(),
            })
        }
    }

    fn write(&self, pin: &Override) -> Result<(), OverrideError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO overrides (digital_source_id, physical_source_id, action, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                pin.digital_source_id,
                pin.physical_source_id,
                pin.action.as_str(),
                format_timestamp(&pin.created_at),
            ],
        )?;
        Ok(())
    }

    /// Why a confirm pointing at `physical_id` cannot take effect, if it can't.
    fn physical_staleness(&self, physical_id: &str) -> Result<Option<StaleReason>, OverrideError> {
        let stale = match get_track(self.conn, SourceKind::Physical, physical_id)? {
            Some(stored) if stored.present => {
                stored.record.missing_field().map(|_| StaleReason::PhysicalMalformed)
            }
            _ => Some(StaleReason::PhysicalRemoved),
        };
        Ok(stale)
    }

    /// Pin `digital_id` to `physical_id`. Fails if the physical record is
    /// unknown, lacks an artist or title, or is already confirmed for another
    /// digital record.
    pub fn confirm(&self, digital_id: &str, physical_id: &str) -> Result<Override, OverrideError> {
        self.require_present(SourceKind::Digital, digital_id)?;
        self.require_present(SourceKind::Physical, physical_id)?;
        if let Some(stored) = get_track(self.conn, SourceKind::Physical, physical_id)? {
            if let Some(missing) = stored.record.missing_field() {
                return Err(OverrideError::MalformedRecord {
                    kind: SourceKind::Physical,
                    source_id: physical_id.to_string(),
                    missing,
                });
            }
        }

        let holder: Option<String> = self
            .conn
            .query_row(
                "SELECT digital_source_id FROM overrides
                 WHERE action = 'confirm' AND physical_source_id = ?1 AND digital_source_id != ?2",
                params![physical_id, digital_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(claimed_by) = holder {
            return Err(OverrideError::Conflict {
                physical_source_id: physical_id.to_string(),
                claimed_by,
            });
        }

        let pin = Override {
            digital_source_id: digital_id.to_string(),
            physical_source_id: Some(physical_id.to_string()),
            action: OverrideAction::Confirm,
            created_at: Utc::now(),
        };
        self.write(&pin)?;
        tracing::info!(digital_id, physical_id, "confirmed match");
        Ok(pin)
    }

    /// Force `digital_id` to stay unmatched.
    pub fn reject(&self, digital_id: &str) -> Result<Override, OverrideError> {
        self.require_present(SourceKind::Digital, digital_id)?;
        let pin = Override {
            digital_source_id: digital_id.to_string(),
            physical_source_id: None,
            action: OverrideAction::Reject,
            created_at: Utc::now(),
        };
        self.write(&pin)?;
        tracing::info!(digital_id, "rejected match");
        Ok(pin)
    }

    /// Remove the override, if any. Returns whether one existed.
    pub fn clear(&self, digital_id: &str) -> Result<bool, OverrideError> {
        let removed = self
            .conn
            .execute("DELETE FROM overrides WHERE digital_source_id = ?1", [digital_id])?;
        if removed > 0 {
            tracing::info!(digital_id, "cleared override");
        }
        Ok(removed > 0)
    }

    pub fn get(&self, digital_id: &str) -> Result<Option<Override>, OverrideError> {
        let pin = self
            .conn
            .query_row(
                "SELECT digital_source_id, physical_source_id, action, created_at
                 FROM overrides WHERE digital_source_id = ?1",
                [digital_id],
                override_from_row,
            )
            .optional()?;
        Ok(pin)
    }

    /// All overrides, ordered by digital source id.
    pub fn list_active(&self) -> Result<Vec<Override>, OverrideError> {
        let mut stmt = self.conn.prepare(
            "SELECT digital_source_id, physical_source_id, action, created_at
             FROM overrides ORDER BY digital_source_id",
        )?;
        let rows = stmt.query_map([], override_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// All overrides with a stale flag. Stale ones are logged, never dropped.
    pub fn list_with_status(&self) -> Result<Vec<OverrideStatus>, OverrideError> {
        let mut statuses = Vec::new();
        for pin in self.list_active()? {
            let stale = if !track_present(self.conn, SourceKind::Digital, &pin.digital_source_id)? {
                Some(StaleReason::DigitalRemoved)
            } else {
                match pin.physical_source_id.as_deref() {
                    Some(physical_id) => self.physical_staleness(physical_id)?,
                    None => None,
                }
            };
            if let Some(reason) = stale {
                tracing::warn!(
                    digital_id = %pin.digital_source_id,
                    reason = ?reason,
                    "stale override"
                );
            }
            statuses.push(OverrideStatus { pin, stale });
        }
        Ok(statuses)
    }
}

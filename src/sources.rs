//! Materialised snapshots handed over by the external source readers.
//!
//! The library export reader writes a JSON array of [`DigitalEntry`]; the
//! collection reader writes a JSON array of [`Release`]. Parsing the native
//! formats (NML, marketplace API/CSV) happens outside this crate.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::models::{DigitalAttributes, Release, SourceKind, TrackRecord};

/// One library entry as exported by the digital reader.
#[derive(Debug, Clone, Deserialize)]
pub struct DigitalEntry {
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
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub bitrate: Option<u32>,
    /// Set by readers that can tell which entries appeared since last read
    #[serde(default)]
    pub is_new: bool,
}

impl DigitalEntry {
    pub fn into_record(self) -> TrackRecord {
        let digital = if self.file_path.is_some() || self.format.is_some() || self.bitrate.is_some() {
            Some(DigitalAttributes {
                file_path: self.file_path,
                format: self.format.map(|f| f.to_lowercase()),
                bitrate: self.bitrate,
            })
        } else {
            None
        };
        TrackRecord {
            source_kind: SourceKind::Digital,
            source_id: self.source_id,
            artist: self.artist,
            title: self.title,
            album: self.album,
            label: self.label,
            year: self.year,
            duration_sec: self.duration_sec,
            position: None,
            format_type: None,
            digital,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DigitalSnapshot {
    pub records: Vec<TrackRecord>,
    /// Entries the reader flagged as new since its last read
    pub new_since_last_read: usize,
}

impl DigitalSnapshot {
    pub fn from_entries(entries: Vec<DigitalEntry>) -> Self {
        let new_since_last_read = entries.iter().filter(|e| e.is_new).count();
        let records = entries.into_iter().map(DigitalEntry::into_record).collect();
        Self {
            records,
            new_since_last_read,
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Load a digital library snapshot.
pub fn load_digital(path: &Path) -> Result<DigitalSnapshot> {
    let entries: Vec<DigitalEntry> = read_json(path)?;
    let snapshot = DigitalSnapshot::from_entries(entries);
    tracing::info!(
        path = %path.display(),
        records = snapshot.records.len(),
        new = snapshot.new_since_last_read,
        "loaded digital snapshot"
    );
    Ok(snapshot)
}

/// Load a physical collection snapshot (releases, not yet expanded).
pub fn load_physical(path: &Path) -> Result<Vec<Release>> {
    let releases: Vec<Release> = read_json(path)?;
    tracing::info!(
        path = %path.display(),
        releases = releases.len(),
        tracks = releases.iter().map(|r| r.tracks.len()).sum::<usize>(),
        "loaded physical snapshot"
    );
    Ok(releases)
}

//! Release-to-track expansion.
//!
//! A physical release fans out into one `TrackRecord` per position. This runs
//! as its own step before matching so the resolver only ever sees tracks.

use rustc_hash::FxHashSet;

use crate::models::{Release, SourceKind, TrackRecord};

/// Stable physical source id for one position on a release.
pub fn physical_source_id(release_id: &str, position: &str) -> String {
    format!("{}:{}", release_id, position)
}

/// Id suffix for a track that has no position of its own. `#` keeps it apart
/// from any explicit position such as `"2"`.
fn index_position(idx: usize) -> String {
    format!("#{}", idx + 1)
}

/// Expand one release into its track records, in release order.
///
/// Release-level fields (label, year, format, title as album) are copied onto
/// every track. A track without an artist inherits the release artist.
///
/// Ids are unique within the release. A track without a position is keyed by
/// `#<index>`, and a repeated key gets `~2`, `~3` and so on in release order.
pub fn expand_release(release: &Release) -> Vec<TrackRecord> {
    let mut used: FxHashSet<String> = FxHashSet::default();

    release
        .tracks
        .iter()
        .enumerate()
        .map(|(idx, track)| {
            let position = track
                .position
                .as_deref()
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string);
            let base = position.clone().unwrap_or_else(|| index_position(idx));

            let mut key = base.clone();
            let mut repeat = 1;
            while !used.insert(key.clone()) {
                repeat += 1;
                key = format!("{}~{}", base, repeat);
            }
            if repeat > 1 {
                tracing::debug!(
                    release_id = %release.release_id,
                    position = %base,
                    key = %key,
                    "repeated track position"
                );
            }

            let artist = track
                .artist
                .as_deref()
                .filter(|a| !a.trim().is_empty())
                .unwrap_or(release.artist.as_str());

            TrackRecord {
                source_kind: SourceKind::Physical,
                source_id: physical_source_id(&release.release_id, &key),
                artist: artist.to_string(),
                title: track.title.clone(),
                album: Some(release.title.clone()).filter(|t| !t.trim().is_empty()),
                label: release.label.clone(),
                year: release.year,
                duration_sec: track.duration_sec,
                position,
                format_type: release.format_type.clone(),
                digital: None,
            }
        })
        .collect()
}

/// Expand a whole collection snapshot.
pub fn expand_releases(releases: &[Release]) -> Vec<TrackRecord> {
    releases.iter().flat_map(expand_release).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ReleaseTrack;

    fn release() -> Release {
        Release {
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
                    position: None,
                    artist: Some("Daft Punk feat. Romanthony".to_string()),
                    title: "Too Long".to_string(),
                    duration_sec: None,
                },
            ],
        }
    }

    #[test]
    fn test_expand_release_fields() {
        let tracks = expand_release(&release());
        assert_eq!(tracks.len(), 2);

        let first = &tracks[0];
        assert_eq!(first.source_id, "249504:A1");
        assert_eq!(first.source_kind, SourceKind::Physical);
        assert_eq!(first.artist, "Daft Punk");
        assert_eq!(first.album.as_deref(), Some("Discovery"));
        assert_eq!(first.label.as_deref(), Some("Virgin"));
        assert_eq!(first.year, Some(2001));
        assert_eq!(first.format_type.as_deref(), Some("vinyl"));
        assert_eq!(first.position.as_deref(), Some("A1"));
    }

    #[test]
    fn test_missing_position_uses_index() {
        let tracks = expand_release(&release());
        assert_eq!(tracks[1].source_id, "249504:#2");
        assert_eq!(tracks[1].position, None);
        assert_eq!(tracks[1].artist, "Daft Punk feat. Romanthony");
    }

    #[test]
    fn test_expand_releases_flattens() {
        let mut other = release();
        other.release_id = "1".to_string();
        other.tracks.truncate(1);
        let tracks = expand_releases(&[release(), other]);
        let ids: Vec<&str> = tracks.iter().map(|t| t.source_id.as_str()).collect();
        assert_eq!(ids, vec!["249504:A1", "249504:#2", "1:A1"]);
    }

    fn track(position: Option<&str>, title: &str) -> ReleaseTrack {
        ReleaseTrack {
            position: position.map(str::to_string),
            artist: None,
            title: title.to_string(),
            duration_sec: None,
        }
    }

    #[test]
    fn test_missing_position_never_shadows_explicit_one() {
        let mut r = release();
        r.release_id = "r1".to_string();
        r.tracks = vec![track(Some("1"), "First"), track(None, "Second"), track(Some("2"), "Third")];

        let ids: Vec<String> = expand_release(&r).into_iter().map(|t| t.source_id).collect();
        assert_eq!(ids, vec!["r1:1", "r1:#2", "r1:2"]);
    }

    #[test]
    fn test_repeated_positions_get_suffixes() {
        let mut r = release();
        r.release_id = "r1".to_string();
        r.tracks = vec![
            track(Some("A1"), "Intro"),
            track(Some("A1"), "Intro (Reprise)"),
            track(Some(" A1 "), "Intro (Dub)"),
            track(Some("A1~2"), "Odd Position"),
        ];

        let tracks = expand_release(&r);
        let ids: Vec<&str> = tracks.iter().map(|t| t.source_id.as_str()).collect();
        assert_eq!(ids, vec!["r1:A1", "r1:A1~2", "r1:A1~3", "r1:A1~2~2"]);
        assert_eq!(tracks[1].position.as_deref(), Some("A1"));
    }

    #[test]
    fn test_expansion_is_stable() {
        let mut r = release();
        r.tracks = vec![track(Some("1"), "A"), track(None, "B"), track(Some("1"), "C")];
        assert_eq!(expand_release(&r), expand_release(&r));
    }

    #[test]
    fn test_empty_release() {
        let mut empty = release();
        empty.tracks.clear();
        assert!(expand_release(&empty).is_empty());
    }
}

//! Runtime configuration: database location and scoring parameters.
//!
//! Precedence for the database path is `--db`, then `MUSICTOOL_DATABASE`
//! (both handled by clap), then the config file, then the default.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::scoring::ScoringConfig;

pub const DEFAULT_DATABASE: &str = "musictool.db";
pub const DATABASE_ENV: &str = "MUSICTOOL_DATABASE";

/// Shape of the optional `--config` JSON file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub database: Option<PathBuf>,
    pub scoring: ScoringConfig,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub database_path: PathBuf,
    pub scoring: ScoringConfig,
}

impl Config {
    /// Merge the flag/env value with an optional file and validate scoring.
    pub fn resolve(database_flag: Option<PathBuf>, file: Option<ConfigFile>) -> Result<Self, ConfigError> {
        let file = file.unwrap_or_default();
        file.scoring.validate()?;
        let database_path = database_flag
            .or(file.database)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE));
        Ok(Self {
            database_path,
            scoring: file.scoring,
        })
    }

    pub fn load(database_flag: Option<PathBuf>, config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = config_path.map(ConfigFile::load).transpose()?;
        Self::resolve(database_flag, file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::resolve(None, None).unwrap();
        assert_eq!(config.database_path, PathBuf::from(DEFAULT_DATABASE));
        assert_eq!(config.scoring, ScoringConfig::default());
    }

    #[test]
    fn test_flag_beats_file() {
        let file = ConfigFile {
            database: Some(PathBuf::from("from-file.db")),
            scoring: ScoringConfig::default(),
        };
        let config = Config::resolve(Some(PathBuf::from("flag.db")), Some(file.clone())).unwrap();
        assert_eq!(config.database_path, PathBuf::from("flag.db"));

        let config = Config::resolve(None, Some(file)).unwrap();
        assert_eq!(config.database_path, PathBuf::from("from-file.db"));
    }

    #[test]
    fn test_load_file_with_partial_scoring() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"scoring": {{"title_weight": 0.7, "artist_weight": 0.3, "low_threshold": 0.6}}}}"#
        )
        .unwrap();
        let config = Config::load(None, Some(file.path())).unwrap();
        assert_eq!(config.scoring.title_weight, 0.7);
        assert_eq!(config.scoring.low_threshold, 0.6);
        assert_eq!(config.scoring.exact_threshold, 0.92);
    }

    #[test]
    fn test_invalid_scoring_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"scoring": {{"title_weight": 0.9}}}}"#).unwrap();
        assert!(matches!(
            Config::load(None, Some(file.path())),
            Err(ConfigError::InvalidWeights { .. })
        ));
    }

    #[test]
    fn test_unreadable_and_unparsable() {
        assert!(matches!(
            Config::load(None, Some(Path::new("/nonexistent/musictool.json"))),
            Err(ConfigError::Read { .. })
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"databse": "typo.db"}}"#).unwrap();
        assert!(matches!(
            Config::load(None, Some(file.path())),
            Err(ConfigError::Parse { .. })
        ));
    }
}

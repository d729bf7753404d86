//! Guards against clobbering inputs when exporting.
//!
//! An export must be a `.json` file and must not be any of the protected
//! paths the caller passes in. The `view` command protects the database.

use anyhow::{bail, Result};
use std::path::Path;

const DATABASE_EXTENSIONS: [&str; 4] = ["db", "sqlite", "sqlite3", "db3"];

/// Validates that an export path is safe to overwrite.
///
/// # Arguments
/// * `output` - The file about to be created or overwritten
/// * `protected` - Paths that must never be written, such as the database
pub fn validate_export_path(output: &Path, protected: &[&Path]) -> Result<()> {
    let extension = output
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    if DATABASE_EXTENSIONS.contains(&extension.as_str()) {
        bail!(
            "Safety check failed: export '{}' looks like a database file",
            output.display()
        );
    }

    if extension != "json" {
        bail!(
            "Safety check failed: export '{}' must have a .json extension",
            output.display()
        );
    }

    for path in protected {
        let same = output == *path
            || matches!(
                (output.canonicalize(), path.canonicalize()),
                (Ok(a), Ok(b)) if a == b
            );
        if same {
            bail!(
                "Safety check failed: export '{}' cannot overwrite input '{}'",
                output.display(),
                path.display()
            );
        }
    }

    Ok(())
}

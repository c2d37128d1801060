//! `crucible init`: create the `.crucible/` directory in a project.
//!
//! ```text
//! .crucible/
//! ├── crucible.toml    # Project configuration
//! ├── state.json       # Pipeline state (written by `crucible run`)
//! ├── logs/            # Daily rolling trace logs
//! ├── reports/         # Escalation reports, one per failed task
//! ├── backups/         # Copies of files before tools overwrite them
//! └── archive/         # Previous pipeline states
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::CRUCIBLE_DIR;
use crate::crucible_config::{CONFIG_FILE, default_config_text};

const SUBDIRS: [&str; 4] = ["logs", "reports", "backups", "archive"];

/// Result of initializing a crucible project.
#[derive(Debug)]
pub struct InitResult {
    pub crucible_dir: PathBuf,
    /// Whether the directory was newly created (false if it already existed)
    pub created: bool,
    /// Whether a default `crucible.toml` was written
    pub wrote_config: bool,
}

/// Initialize a project. Safe to run repeatedly: missing pieces are added,
/// existing files are left untouched.
pub fn init_project(project_dir: &Path) -> Result<InitResult> {
    let crucible_dir = project_dir.join(CRUCIBLE_DIR);
    let created = !crucible_dir.exists();

    for sub in SUBDIRS {
        let dir = crucible_dir.join(sub);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }

    let config_file = crucible_dir.join(CONFIG_FILE);
    let wrote_config = !config_file.exists();
    if wrote_config {
        let name = project_dir
            .canonicalize()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .unwrap_or_else(|| "project".to_string());
        std::fs::write(&config_file, default_config_text(&name))
            .with_context(|| format!("Failed to create {}", config_file.display()))?;
    }

    Ok(InitResult {
        crucible_dir,
        created,
        wrote_config,
    })
}

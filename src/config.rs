use anyhow::{Context, Result, bail};
use std::path::PathBuf;

use crate::crucible_config::{CONFIG_FILE, CrucibleToml};
use crate::state::StateManager;

pub const CRUCIBLE_DIR: &str = ".crucible";

/// Runtime configuration for Crucible.
///
/// Resolves the project directory and every path under `.crucible/`, and
/// owns the layered [`CrucibleToml`] (file, then environment, then CLI).
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub crucible_dir: PathBuf,
    pub config_file: PathBuf,
    pub state_file: PathBuf,
    pub lock_file: PathBuf,
    pub log_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub verbose: bool,
    pub toml: CrucibleToml,
}

impl Config {
    pub fn new(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let crucible_dir = project_dir.join(CRUCIBLE_DIR);

        let mut toml = CrucibleToml::load_or_default(&crucible_dir)?;
        toml.apply_env()?;

        Ok(Self {
            config_file: crucible_dir.join(CONFIG_FILE),
            state_file: crucible_dir.join("state.json"),
            lock_file: crucible_dir.join("lock"),
            log_dir: crucible_dir.join("logs"),
            reports_dir: crucible_dir.join("reports"),
            backup_dir: crucible_dir.join("backups"),
            archive_dir: crucible_dir.join("archive"),
            project_dir,
            crucible_dir,
            verbose,
            toml,
        })
    }

    /// Apply CLI overrides on top of file and environment values.
    pub fn with_retry_ceiling(mut self, ceiling: Option<u32>) -> Self {
        if let Some(ceiling) = ceiling {
            self.toml.retry.ceiling = ceiling;
        }
        self
    }

    pub fn is_initialized(&self) -> bool {
        self.crucible_dir.is_dir()
    }

    pub fn require_initialized(&self) -> Result<()> {
        if !self.is_initialized() {
            bail!(
                "No .crucible directory in {}. Run 'crucible init' first.",
                self.project_dir.display()
            );
        }
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            &self.crucible_dir,
            &self.log_dir,
            &self.reports_dir,
            &self.backup_dir,
            &self.archive_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Validate the layered configuration; any problem is fatal.
    pub fn validate(&self) -> Result<()> {
        let problems = self.toml.validate();
        if !problems.is_empty() {
            bail!("Invalid configuration:\n  - {}", problems.join("\n  - "));
        }
        Ok(())
    }

    pub fn state_manager(&self) -> StateManager {
        StateManager::new(&self.state_file, &self.archive_dir)
            .with_retry_ceiling(self.toml.retry.ceiling)
            .with_persist_attempts(self.toml.retry.persist_attempts)
    }

    pub fn project_name(&self) -> String {
        self.toml.project.name.clone().unwrap_or_else(|| {
            self.project_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "project".to_string())
        })
    }
}

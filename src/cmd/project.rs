//! Project initialization and reset commands.

use anyhow::{Context, Result};
use std::path::Path;

use super::super::Cli;

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    use crucible::init::init_project;

    let result = init_project(project_dir)?;

    if result.created {
        println!(
            "Initialized crucible project at {}",
            result.crucible_dir.display()
        );
        println!();
        println!("Created directory structure:");
        println!("  .crucible/");
        println!("  ├── crucible.toml  # Configuration");
        println!("  ├── logs/          # Trace logs");
        println!("  ├── reports/       # Escalation reports");
        println!("  ├── backups/       # File backups taken by tools");
        println!("  └── archive/       # Previous pipeline states");
        println!();
        println!("Next steps:");
        println!("  1. Set model_cmd in .crucible/crucible.toml");
        println!("  2. Seed work with `crucible add-task` (optional)");
        println!("  3. Run `crucible run` to start the coordinator");
    } else {
        println!(
            "Crucible project already initialized at {}",
            result.crucible_dir.display()
        );
        if result.wrote_config {
            println!("Restored missing crucible.toml.");
        }
        println!("Directory structure verified.");
    }

    Ok(())
}

pub fn cmd_reset(cli: &Cli, project_dir: &Path, force: bool) -> Result<()> {
    use crucible::config::Config;
    use crucible::state::StateLock;

    let config = Config::new(project_dir.to_path_buf(), cli.verbose)?;
    config.require_initialized()?;
    let _lock = StateLock::acquire(&config.lock_file)
        .context("Cannot reset while a coordinator is running")?;

    config
        .state_manager()
        .reset(force)
        .context("Failed to remove pipeline state")?;

    if force {
        println!("Reset complete (archived states removed)");
    } else {
        println!("Reset complete");
    }
    Ok(())
}

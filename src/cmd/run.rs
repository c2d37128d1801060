//! `crucible run`: the coordinator loop.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

use super::super::Cli;

pub async fn cmd_run(
    cli: &Cli,
    project_dir: PathBuf,
    resume: bool,
    max_iterations: Option<u64>,
    retry_ceiling: Option<u32>,
) -> Result<()> {
    use crucible::config::Config;
    use crucible::coordinator::{Coordinator, StopReason};
    use crucible::model::CommandModel;
    use crucible::state::StateLock;
    use crucible::state::manager::prune_history;

    let config = Config::new(project_dir, cli.verbose)?.with_retry_ceiling(retry_ceiling);
    config.require_initialized()?;
    config.ensure_directories()?;
    config.validate()?;

    let _lock = StateLock::acquire(&config.lock_file)
        .context("Another coordinator is already running for this project")?;

    let manager = config.state_manager();
    let mut state = manager
        .start(resume)
        .context("Failed to prepare pipeline state")?;
    let pruned = prune_history(
        &mut state,
        config.toml.history.max_age_hours,
        config.toml.loop_detection.window,
    );
    if pruned > 0 {
        tracing::info!(pruned, "Pruned old action records");
        manager.save(&state)?;
    }

    let toml = &config.toml;
    let model = CommandModel::new(
        &toml.project.model_cmd,
        toml.project.model_args.clone(),
        &config.project_dir,
        Duration::from_secs(toml.model.timeout_secs),
    );
    let coordinator = Coordinator::from_config(&config, model)?;

    println!(
        "{} {} ({})",
        console::style("Running").bold(),
        config.project_name(),
        if resume { "resumed" } else { "fresh state" }
    );

    let summary = coordinator
        .run(max_iterations)
        .await
        .context("Coordinator stopped: pipeline state could not be persisted")?;

    println!();
    let headline = match summary.stop {
        StopReason::Complete => console::style("All work complete").green().bold(),
        StopReason::MaxIterations => console::style("Iteration limit reached").yellow().bold(),
        StopReason::NothingPlanned => console::style("Planning produced no tasks").yellow().bold(),
    };
    println!("{} after {} iteration(s)", headline, summary.iterations);
    for (status, count) in &summary.counts {
        println!("  {:<16} {}", status.to_string(), count);
    }
    if !summary.failed.is_empty() {
        println!();
        println!(
            "{} escalated task(s); see .crucible/reports/:",
            console::style(summary.failed.len()).red().bold()
        );
        for id in &summary.failed {
            println!("  {}", id);
        }
    }
    Ok(())
}

//! Task store commands: add-task, tasks, status, report.

use anyhow::{Context, Result, bail};
use std::path::Path;

use super::super::Cli;

fn load_config(cli: &Cli, project_dir: &Path) -> Result<crucible::config::Config> {
    let config = crucible::config::Config::new(project_dir.to_path_buf(), cli.verbose)?;
    config.require_initialized()?;
    Ok(config)
}

pub fn cmd_add_task(
    cli: &Cli,
    project_dir: &Path,
    description: &str,
    target: &str,
    priority: u8,
    kind: Option<&str>,
    objective: Option<&str>,
) -> Result<()> {
    use crucible::state::{NewTask, ObjectiveLevel, StateLock, TaskKind};

    if description.trim().is_empty() {
        bail!("Task description must not be empty");
    }
    if target.trim().is_empty() {
        bail!("Task target must not be empty");
    }

    let config = load_config(cli, project_dir)?;
    let _lock = StateLock::acquire(&config.lock_file)
        .context("Cannot add tasks while a coordinator is running")?;
    let manager = config.state_manager();
    let mut state = manager.load()?;

    let mut new = NewTask::new(description, target, priority);
    if let Some(kind) = kind {
        new = new.kind(kind.parse::<TaskKind>()?);
    }
    if let Some(title) = objective {
        let objective_id = state
            .tasks
            .ensure_objective(title, ObjectiveLevel::Secondary);
        new = new.objective(objective_id);
    }

    let (id, created) = state.tasks.create(new);
    if created {
        manager.save(&state).context("Failed to save pipeline state")?;
        println!("{} {}", console::style("Created").green(), id);
    } else {
        println!("{} {}", console::style("Exists").yellow(), id);
    }
    Ok(())
}

pub fn cmd_tasks(cli: &Cli, project_dir: &Path, status: Option<&str>) -> Result<()> {
    use crucible::state::{TaskFilter, TaskStatus};

    let config = load_config(cli, project_dir)?;
    let state = config.state_manager().load()?;

    let filter = match status {
        Some(s) => TaskFilter::status(&[s.parse::<TaskStatus>()?]),
        None => TaskFilter::default(),
    };
    let tasks = state.tasks.ordered(&filter);
    if tasks.is_empty() {
        println!("No tasks");
        return Ok(());
    }

    println!(
        "{:<22} {:<16} {:<4} {:<14} {:<8} Description",
        "Id", "Status", "Pri", "Kind", "Retries"
    );
    for task in tasks {
        let status = format!("{:<16}", task.status.to_string());
        let styled = match task.status {
            TaskStatus::Completed => console::style(status).green(),
            TaskStatus::Failed => console::style(status).red(),
            TaskStatus::NeedsFixes => console::style(status).yellow(),
            _ => console::style(status),
        };
        println!(
            "{:<22} {} {:<4} {:<14} {:<8} {} ({})",
            task.id,
            styled,
            task.priority,
            task.kind.to_string(),
            task.attempt_count,
            task.description,
            task.target
        );
    }
    Ok(())
}

pub fn cmd_status(cli: &Cli, project_dir: &Path) -> Result<()> {
    use crucible::state::TaskStatus;

    let config = load_config(cli, project_dir)?;
    let manager = config.state_manager();

    println!();
    println!("Crucible Project Status");
    println!("=======================");
    println!();
    println!("Project: {}", config.project_name());

    if !manager.exists() {
        println!("Execution: Not started");
        println!();
        println!("Run 'crucible run' to start the coordinator.");
        println!();
        return Ok(());
    }

    let state = manager.load()?;
    println!("Run:     {}", state.run_id);
    println!(
        "Updated: {}",
        state.updated_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(phase) = state.last_phase {
        println!("Last phase: {}", phase);
    }

    println!();
    println!(
        "Tasks: {} ({:.0}% completed)",
        state.tasks.len(),
        state.tasks.completion_ratio() * 100.0
    );
    let counts = state.tasks.count_by_status();
    for status in TaskStatus::ALL {
        let count = counts.get(&status).copied().unwrap_or(0);
        println!("  {:<16} {}", status.to_string(), count);
    }

    let objectives: Vec<_> = state.tasks.objectives().collect();
    if !objectives.is_empty() {
        println!();
        println!("Objectives:");
        for obj in objectives {
            let progress = state.tasks.objective_progress(&obj.id).unwrap_or(0.0);
            println!("  {} ({:.0}%)", obj.title, progress * 100.0);
        }
    }

    println!();
    println!("Counters:");
    println!("  Iterations:          {}", state.counters.iteration);
    println!("  Actions recorded:    {}", state.actions.len());
    println!("  Checkpoints:         {}", state.checkpoints.total());
    println!(
        "  No-progress streak:  {}",
        state.counters.consecutive_no_progress
    );

    if let Some(hint) = &state.pending_intervention {
        println!();
        println!(
            "{} {}: {}",
            console::style("Pending intervention").yellow().bold(),
            hint.pattern,
            hint.description
        );
    }
    println!();
    Ok(())
}

pub fn cmd_report(cli: &Cli, project_dir: &Path, task_id: &str) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let state = config.state_manager().load()?;

    let Some(task) = state.tasks.get(task_id) else {
        bail!("Task '{}' not found", task_id);
    };
    let Some(report) = &task.report else {
        bail!(
            "Task '{}' has no escalation report (status: {})",
            task_id,
            task.status
        );
    };
    print!("{}", report.to_markdown());
    Ok(())
}

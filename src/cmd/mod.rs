//! CLI command implementations.
//!
//! | Module    | Commands handled                        |
//! |-----------|-----------------------------------------|
//! | `project` | `Init`, `Reset`                         |
//! | `run`     | `Run`                                   |
//! | `tasks`   | `AddTask`, `Tasks`, `Status`, `Report`  |

pub mod project;
pub mod run;
pub mod tasks;

pub use project::{cmd_init, cmd_reset};
pub use run::cmd_run;
pub use tasks::{cmd_add_task, cmd_report, cmd_status, cmd_tasks};

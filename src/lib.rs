pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod crucible_config;
pub mod errors;
pub mod init;
pub mod logging;
pub mod loop_detect;
pub mod model;
pub mod phase;
pub mod retry;
pub mod state;
pub mod tools;
pub mod util;

//! Strategic objectives grouping related tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::TaskId;

/// How central an objective is to the project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectiveLevel {
    Primary,
    #[default]
    Secondary,
    Tertiary,
}

impl std::str::FromStr for ObjectiveLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "primary" => Ok(ObjectiveLevel::Primary),
            "secondary" => Ok(ObjectiveLevel::Secondary),
            "tertiary" => Ok(ObjectiveLevel::Tertiary),
            _ => anyhow::bail!(
                "Invalid objective level '{}'. Valid values: primary, secondary, tertiary",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    pub id: String,
    pub title: String,
    pub level: ObjectiveLevel,
    #[serde(default)]
    pub task_ids: Vec<TaskId>,
    pub created_at: DateTime<Utc>,
}

impl Objective {
    pub fn derive_id(title: &str) -> String {
        format!(
            "obj-{}",
            &crate::util::sha256_hex(title.trim().to_lowercase().as_bytes())[..8]
        )
    }
}

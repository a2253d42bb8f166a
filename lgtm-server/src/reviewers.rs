//! Reviewer allow-list.
//!
//! The allow-list is an opt-in feature: a YAML file of the form
//!
//! ```yaml
//! reviewers:
//!   - alice
//!   - bob
//! ```
//!
//! When the file is missing, unreadable, malformed or lists nobody, every
//! commenter may approve. The file is re-read on every check so edits take
//! effect without a restart. Loading is blocking file I/O; async callers run
//! the check on the blocking pool.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, Default, Deserialize)]
struct ReviewersFile {
    #[serde(default)]
    reviewers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ReviewerPolicy {
    path: PathBuf,
}

impl ReviewerPolicy {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the current allow-list from disk.
    pub fn load(&self) -> Result<Vec<String>> {
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read reviewers file {}", self.path.display()))?;
        let file: ReviewersFile = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse reviewers file {}", self.path.display()))?;
        Ok(file.reviewers)
    }

    /// Whether `username` may contribute an approval.
    pub fn is_authorized(&self, username: &str) -> bool {
        let reviewers = match self.load() {
            Ok(reviewers) => reviewers,
            Err(e) => {
                debug!("Reviewer allow-list unavailable, allowing everyone: {:#}", e);
                return true;
            }
        };

        if reviewers.is_empty() || reviewers.iter().any(|r| r == username) {
            return true;
        }

        warn!("User {} is not allowed to approve merge requests", username);
        false
    }
}

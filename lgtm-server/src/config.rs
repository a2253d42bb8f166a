use std::num::NonZeroU64;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use reqwest::Url;

use crate::classifier::DEFAULT_APPROVAL_KEYWORD;
use crate::webhook::DEFAULT_HOOK_PATH;
use crate::HEALTH_PATH;

/// Merge GitLab merge requests once enough reviewers comment LGTM
#[derive(Parser, Debug, Clone)]
#[command(name = "lgtm-server", version)]
pub struct Cli {
    /// GitLab private token used to accept merge requests
    #[arg(long, env = "LGTM_GITLAB_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// GitLab base URL, e.g. https://gitlab.example.com
    #[arg(long, env = "LGTM_GITLAB_URL")]
    pub gitlab_url: Option<String>,

    /// Number of approvals needed before merging
    #[arg(long, env = "LGTM_COUNT", default_value_t = 2)]
    pub lgtm_count: u64,

    /// Comment text that counts as an approval (case-insensitive)
    #[arg(long, env = "LGTM_NOTE", default_value = DEFAULT_APPROVAL_KEYWORD)]
    pub lgtm_note: String,

    /// Log level (trace, debug, info, warn, error) or a tracing filter directive
    #[arg(long, env = "LGTM_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// HTTP listen port
    #[arg(long, env = "LGTM_PORT", default_value_t = 8989)]
    pub port: u16,

    /// Path of the approval database
    #[arg(long, env = "LGTM_DB_PATH", default_value = "lgtm.data")]
    pub db_path: PathBuf,

    /// YAML file listing the users allowed to approve; missing means everyone
    #[arg(long, env = "LGTM_REVIEWERS", default_value = "reviewers.yaml")]
    pub reviewers: PathBuf,

    /// Route the webhook is served on
    #[arg(long, env = "LGTM_HOOK_PATH", default_value = DEFAULT_HOOK_PATH)]
    pub hook_path: String,

    /// Number of background workers processing webhook events
    #[arg(long, env = "LGTM_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Events that may wait for a worker before new ones are dropped
    #[arg(long, env = "LGTM_QUEUE_CAPACITY", default_value_t = 256)]
    pub queue_capacity: usize,

    /// Timeout for the merge request call to GitLab, in seconds
    #[arg(long, env = "LGTM_MERGE_TIMEOUT_SECS", default_value_t = 30)]
    pub merge_timeout_secs: u64,
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub private_token: String,
    pub gitlab_url: Url,
    pub threshold: NonZeroU64,
    pub approval_keyword: String,
    pub log_level: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub reviewers_path: PathBuf,
    pub hook_path: String,
    pub workers: usize,
    pub queue_capacity: usize,
    pub merge_timeout: Duration,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let private_token = cli
            .token
            .filter(|s| !s.trim().is_empty())
            .context("private token is required (--token or LGTM_GITLAB_TOKEN)")?;

        let gitlab_url = cli
            .gitlab_url
            .filter(|s| !s.trim().is_empty())
            .context("gitlab url is required (--gitlab-url or LGTM_GITLAB_URL)")?;
        let gitlab_url = parse_gitlab_url(&gitlab_url)?;

        let threshold =
            NonZeroU64::new(cli.lgtm_count).context("lgtm count must be at least 1")?;

        if cli.lgtm_note.trim().is_empty() {
            bail!("lgtm note must not be empty");
        }

        if !cli.hook_path.starts_with('/') {
            bail!("hook path must start with '/', got {:?}", cli.hook_path);
        }

        if cli.hook_path == HEALTH_PATH {
            bail!("hook path must not be {:?}, it is the health check route", HEALTH_PATH);
        }

        if cli.workers == 0 {
            bail!("at least one worker is required");
        }

        if cli.queue_capacity == 0 {
            bail!("queue capacity must be at least 1");
        }

        Ok(Config {
            private_token,
            gitlab_url,
            threshold,
            approval_keyword: cli.lgtm_note,
            log_level: cli.log_level,
            port: cli.port,
            db_path: cli.db_path,
            reviewers_path: cli.reviewers,
            hook_path: cli.hook_path,
            workers: cli.workers,
            queue_capacity: cli.queue_capacity,
            merge_timeout: Duration::from_secs(cli.merge_timeout_secs),
        })
    }
}

fn parse_gitlab_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).with_context(|| format!("invalid gitlab url {:?}", raw))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("gitlab url must use http or https, got {:?}", url.scheme());
    }
    Ok(url)
}

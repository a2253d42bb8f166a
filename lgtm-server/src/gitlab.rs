use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode, Url};
use serde::Serialize;
use tracing::{error, info, warn};

/// Header GitLab reads personal/project access tokens from.
pub const PRIVATE_TOKEN_HEADER: &str = "PRIVATE-TOKEN";

#[derive(Clone)]
pub struct GitLabClient {
    client: Client,
    base_url: Url,
    private_token: String,
}

#[derive(Debug, Serialize)]
pub struct AcceptMergeRequest<'a> {
    pub should_remove_source_branch: &'a str,
}

/// How GitLab answered a merge request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    /// 405: conflicts, a failing pipeline or similar block the merge.
    Conflict,
    /// 406: the merge request is already merged or closed.
    AlreadyResolved,
    Unexpected { status: u16, reason: String },
    /// The request never produced a response.
    RequestFailed(String),
}

impl fmt::Display for MergeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeOutcome::Merged => write!(f, "merged"),
            MergeOutcome::Conflict => write!(f, "blocked by conflicts"),
            MergeOutcome::AlreadyResolved => write!(f, "already merged or closed"),
            MergeOutcome::Unexpected { status, reason } => {
                write!(f, "unexpected response {} {}", status, reason)
            }
            MergeOutcome::RequestFailed(e) => write!(f, "request failed: {}", e),
        }
    }
}

impl MergeOutcome {
    /// Only 200 means GitLab accepted the merge; any other 2xx is unexpected.
    pub fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::OK => MergeOutcome::Merged,
            StatusCode::METHOD_NOT_ALLOWED => MergeOutcome::Conflict,
            StatusCode::NOT_ACCEPTABLE => MergeOutcome::AlreadyResolved,
            other => MergeOutcome::Unexpected {
                status: other.as_u16(),
                reason: other.canonical_reason().unwrap_or("Unknown").to_string(),
            },
        }
    }
}

impl GitLabClient {
    pub fn new(base_url: Url, private_token: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("lgtm-server/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url,
            private_token,
        })
    }

    /// `{base}/api/v4/projects/{project_id}/merge_requests/{iid}/merge`.
    ///
    /// Any path on the base URL (GitLab served under a prefix) is kept.
    pub fn merge_url(&self, project_id: u64, iid: u64) -> String {
        format!(
            "{}/api/v4/projects/{}/merge_requests/{}/merge",
            self.base_url.as_str().trim_end_matches('/'),
            project_id,
            iid
        )
    }

    /// Ask GitLab to merge the merge request.
    ///
    /// Never fails: the outcome is logged here and returned for callers that
    /// want to inspect it. There are no retries.
    pub async fn attempt_merge(
        &self,
        project_id: u64,
        iid: u64,
        remove_source_branch: &str,
    ) -> MergeOutcome {
        let url = self.merge_url(project_id, iid);
        let body = AcceptMergeRequest {
            should_remove_source_branch: remove_source_branch,
        };

        info!("Accepting MR !{} in project {}", iid, project_id);

        let response = match self
            .client
            .put(&url)
            .header(PRIVATE_TOKEN_HEADER, &self.private_token)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!("Failed to send merge request for MR !{}: {}", iid, e);
                return MergeOutcome::RequestFailed(e.to_string());
            }
        };

        let outcome = MergeOutcome::from_status(response.status());
        match &outcome {
            MergeOutcome::Merged => info!(mr = iid, "Merge request merged"),
            MergeOutcome::Conflict => warn!(mr = iid, "Merge request has conflicts, cannot merge"),
            MergeOutcome::AlreadyResolved => {
                warn!(mr = iid, "Merge request is already merged or closed")
            }
            MergeOutcome::Unexpected { status, reason } => {
                let body = response.text().await.unwrap_or_default();
                error!(
                    mr = iid,
                    "Merge failed with unexpected response: {} {} - {}", status, reason, body
                );
            }
            MergeOutcome::RequestFailed(_) => {}
        }
        outcome
    }
}

//! The approval pipeline run for every decoded note event.

use std::num::NonZeroU64;

use tracing::{debug, error, info};

use crate::classifier::{classify, Classification, IgnoreReason};
use crate::gitlab::{GitLabClient, MergeOutcome};
use crate::payload::NoteEvent;
use crate::reviewers::ReviewerPolicy;
use crate::store::{ApprovalStore, ApprovalTally, StoreError};

/// What happened to one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Ignored(IgnoreReason),
    /// Classification did not complete and the event was dropped.
    ClassifyFailed,
    /// The approval could not be recorded and was dropped.
    StoreFailed,
    /// Counted, but the threshold is not met or GitLab reports the MR as
    /// not mergeable.
    Counted(ApprovalTally),
    MergeAttempted(ApprovalTally, MergeOutcome),
}

pub struct ApprovalProcessor {
    pub policy: ReviewerPolicy,
    pub store: ApprovalStore,
    pub gitlab: GitLabClient,
    pub threshold: NonZeroU64,
    pub keyword: String,
}

impl ApprovalProcessor {
    pub async fn process(&self, event: &NoteEvent) -> ProcessOutcome {
        // The reviewer check reads its file from disk.
        let classification = {
            let event = event.clone();
            let policy = self.policy.clone();
            let keyword = self.keyword.clone();
            tokio::task::spawn_blocking(move || classify(&event, &policy, &keyword)).await
        };
        match classification {
            Ok(Classification::Ignore(reason)) => {
                debug!("Ignoring event from {}: {}", event.username(), reason);
                return ProcessOutcome::Ignored(reason);
            }
            Ok(Classification::ConsiderApproval) => {}
            Err(e) => {
                error!("Failed to classify event from {}: {}", event.username(), e);
                return ProcessOutcome::ClassifyFailed;
            }
        }

        let iid = event.merge_request.iid;
        info!(
            user = event.username(),
            note = %event.object_attributes.note,
            mr = iid,
            "Approval comment"
        );

        let tally = match self.store.increment_and_check(iid, self.threshold).await {
            Ok(tally) => tally,
            Err(StoreError::Commit {
                count,
                threshold_reached,
                message,
            }) => {
                error!(
                    mr = iid,
                    count,
                    threshold_reached,
                    "Failed to commit approval count, dropping approval: {}",
                    message
                );
                return ProcessOutcome::StoreFailed;
            }
            Err(e) => {
                error!(mr = iid, "Failed to record approval, dropping it: {}", e);
                return ProcessOutcome::StoreFailed;
            }
        };

        if !(tally.threshold_reached && event.is_mergeable()) {
            info!(
                mr = iid,
                count = tally.count,
                threshold_reached = tally.threshold_reached,
                merge_status = %event.merge_request.merge_status,
                "Merge request cannot be merged yet"
            );
            return ProcessOutcome::Counted(tally);
        }

        info!(mr = iid, count = tally.count, "Merge request can be merged");
        let outcome = self
            .gitlab
            .attempt_merge(
                event.project_id,
                iid,
                &event.merge_request.merge_params.force_remove_source_branch,
            )
            .await;
        ProcessOutcome::MergeAttempted(tally, outcome)
    }
}

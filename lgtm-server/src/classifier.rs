//! Decides whether a note event is an approval vote.

use std::fmt;

use crate::payload::{NoteEvent, NOTEABLE_TYPE_MERGE_REQUEST, OBJECT_KIND_NOTE};
use crate::reviewers::ReviewerPolicy;

/// Default approval keyword.
pub const DEFAULT_APPROVAL_KEYWORD: &str = "LGTM";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    NotANote,
    UnauthorizedReviewer,
    NotAMergeRequest,
    NotAnApproval,
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IgnoreReason::NotANote => write!(f, "not a note event"),
            IgnoreReason::UnauthorizedReviewer => write!(f, "commenter is not a reviewer"),
            IgnoreReason::NotAMergeRequest => write!(f, "note is not on a merge request"),
            IgnoreReason::NotAnApproval => write!(f, "note is not the approval keyword"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Ignore(IgnoreReason),
    ConsiderApproval,
}

/// Classify an event.
///
/// The checks run in a fixed order and the first failing one wins. The
/// reviewer policy is consulted before the note body is looked at, so any
/// comment from a non-reviewer on an allow-listed project is logged as denied.
pub fn classify(event: &NoteEvent, policy: &ReviewerPolicy, keyword: &str) -> Classification {
    if event.object_kind != OBJECT_KIND_NOTE {
        return Classification::Ignore(IgnoreReason::NotANote);
    }

    if !policy.is_authorized(event.username()) {
        return Classification::Ignore(IgnoreReason::UnauthorizedReviewer);
    }

    if event.object_attributes.noteable_type != NOTEABLE_TYPE_MERGE_REQUEST {
        return Classification::Ignore(IgnoreReason::NotAMergeRequest);
    }

    if !is_approval(&event.object_attributes.note, keyword) {
        return Classification::Ignore(IgnoreReason::NotAnApproval);
    }

    Classification::ConsiderApproval
}

/// Whole-note, case-insensitive match against the keyword.
pub fn is_approval(note: &str, keyword: &str) -> bool {
    note.to_uppercase() == keyword.to_uppercase()
}

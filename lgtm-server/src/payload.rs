//! GitLab note (comment) webhook payload.
//!
//! Only the fields the approval flow reads are modelled. Everything else on the
//! wire is ignored, and missing fields fall back to their defaults so that
//! events for issues, snippets and commits still decode.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// `object_kind` of comment events.
pub const OBJECT_KIND_NOTE: &str = "note";

/// `noteable_type` of comments left on a merge request.
pub const NOTEABLE_TYPE_MERGE_REQUEST: &str = "MergeRequest";

/// `merge_status` of a merge request GitLab is willing to merge.
pub const MERGE_STATUS_CAN_BE_MERGED: &str = "can_be_merged";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NoteEvent {
    pub object_kind: String,
    pub user: User,
    pub project_id: u64,
    pub object_attributes: ObjectAttributes,
    pub merge_request: MergeRequest,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct User {
    pub name: String,
    pub username: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ObjectAttributes {
    pub note: String,
    pub noteable_type: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MergeRequest {
    pub iid: u64,
    pub state: String,
    pub merge_status: String,
    pub merge_params: MergeParams,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MergeParams {
    /// Passed through verbatim as `should_remove_source_branch` on merge.
    ///
    /// GitLab has sent this as `"1"`, `"true"` and `true` across versions, so
    /// any scalar is accepted and kept in its textual form.
    #[serde(deserialize_with = "scalar_as_string")]
    pub force_remove_source_branch: String,
}

impl NoteEvent {
    pub fn username(&self) -> &str {
        &self.user.username
    }

    pub fn is_mergeable(&self) -> bool {
        self.merge_request.merge_status == MERGE_STATUS_CAN_BE_MERGED
    }
}

fn scalar_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string, boolean or number, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_request_note_deserialization() {
        let payload = json!({
            "object_kind": "note",
            "user": { "name": "Alice", "username": "alice", "avatar_url": "https://example.com/a.png" },
            "project_id": 5,
            "project": { "name": "gitlab-test", "visibility_level": 20 },
            "object_attributes": {
                "id": 1244,
                "note": "LGTM",
                "noteable_type": "MergeRequest",
                "system": false,
                "st_diff": null
            },
            "merge_request": {
                "id": 7,
                "iid": 42,
                "state": "opened",
                "merge_status": "can_be_merged",
                "merge_params": { "force_remove_source_branch": "1" },
                "last_commit": { "id": "da1560886d4f094c3e6c9ef40349f7d38b5d27d7" }
            }
        });

        let event: NoteEvent = serde_json::from_value(payload).unwrap();
        assert_eq!(event.object_kind, OBJECT_KIND_NOTE);
        assert_eq!(event.username(), "alice");
        assert_eq!(event.project_id, 5);
        assert_eq!(event.object_attributes.note, "LGTM");
        assert_eq!(event.object_attributes.noteable_type, NOTEABLE_TYPE_MERGE_REQUEST);
        assert_eq!(event.merge_request.iid, 42);
        assert!(event.is_mergeable());
        assert_eq!(event.merge_request.merge_params.force_remove_source_branch, "1");
    }

    #[test]
    fn test_issue_note_without_merge_request_decodes() {
        let payload = json!({
            "object_kind": "note",
            "user": { "username": "bob" },
            "project_id": 9,
            "object_attributes": { "note": "LGTM", "noteable_type": "Issue" },
            "issue": { "iid": 3 }
        });

        let event: NoteEvent = serde_json::from_value(payload).unwrap();
        assert_eq!(event.merge_request.iid, 0);
        assert!(!event.is_mergeable());
    }

    #[test]
    fn test_force_remove_source_branch_accepts_scalars() {
        for (raw, expected) in [
            (json!(true), "true"),
            (json!(false), "false"),
            (json!("0"), "0"),
            (json!(1), "1"),
            (Value::Null, ""),
        ] {
            let payload = json!({
                "merge_request": { "merge_params": { "force_remove_source_branch": raw } }
            });
            let event: NoteEvent = serde_json::from_value(payload).unwrap();
            assert_eq!(
                event.merge_request.merge_params.force_remove_source_branch,
                expected
            );
        }
    }

    #[test]
    fn test_force_remove_source_branch_rejects_objects() {
        let payload = json!({
            "merge_request": { "merge_params": { "force_remove_source_branch": { "x": 1 } } }
        });
        assert!(serde_json::from_value::<NoteEvent>(payload).is_err());
    }

    #[test]
    fn test_wrong_field_type_is_rejected() {
        let payload = json!({ "project_id": "not a number" });
        assert!(serde_json::from_value::<NoteEvent>(payload).is_err());
    }
}

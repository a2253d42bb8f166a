use std::num::NonZeroU64;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use reqwest::Url;
use serde_json::json;
use tower::ServiceExt;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use lgtm_server::gitlab::GitLabClient;
use lgtm_server::reviewers::ReviewerPolicy;
use lgtm_server::store::ApprovalStore;
use lgtm_server::{app_router, AppState, ApprovalProcessor, WorkerPool};

const HOOK_PATH: &str = "/gitlab/hook";
const PROJECT_ID: u64 = 12;
const MR_IID: u64 = 42;

fn note_payload(username: &str, note: &str) -> String {
    json!({
        "object_kind": "note",
        "user": { "name": username, "username": username },
        "project_id": PROJECT_ID,
        "project": { "name": "widgets", "path_with_namespace": "acme/widgets" },
        "object_attributes": {
            "id": 1,
            "note": note,
            "noteable_type": "MergeRequest",
            "url": "https://gitlab.example.com/acme/widgets/merge_requests/42#note_1"
        },
        "merge_request": {
            "id": 900,
            "iid": MR_IID,
            "state": "opened",
            "merge_status": "can_be_merged",
            "merge_params": { "force_remove_source_branch": "1" }
        }
    })
    .to_string()
}

struct Harness {
    _dir: tempfile::TempDir,
    processor: Arc<ApprovalProcessor>,
}

impl Harness {
    fn new(gitlab: &MockServer, reviewers: Option<&str>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let reviewers_path = dir.path().join("reviewers.yaml");
        if let Some(contents) = reviewers {
            std::fs::write(&reviewers_path, contents).unwrap();
        }

        let processor = Arc::new(ApprovalProcessor {
            policy: ReviewerPolicy::new(reviewers_path),
            store: ApprovalStore::open(dir.path().join("lgtm.data")).unwrap(),
            gitlab: GitLabClient::new(
                Url::parse(&gitlab.uri()).unwrap(),
                "private-token".to_string(),
                Duration::from_secs(5),
            )
            .unwrap(),
            threshold: NonZeroU64::new(2).unwrap(),
            keyword: "LGTM".to_string(),
        });

        Self {
            _dir: dir,
            processor,
        }
    }

    /// Post each body to the webhook, then drain the workers.
    async fn deliver(&self, bodies: &[String]) -> Vec<StatusCode> {
        let state = Arc::new(AppState {
            processor: self.processor.clone(),
            dispatcher: WorkerPool::start(self.processor.clone(), 2, 16),
        });

        let mut statuses = Vec::new();
        for body in bodies {
            let request = Request::post(HOOK_PATH)
                .header("content-type", "application/json")
                .body(Body::from(body.clone()))
                .unwrap();
            let response = app_router(state.clone(), HOOK_PATH)
                .oneshot(request)
                .await
                .unwrap();
            statuses.push(response.status());
        }

        state.dispatcher.shutdown().await;
        statuses
    }
}

async fn merge_calls(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method.as_str() == "PUT")
        .count()
}

async fn mount_merge(server: &MockServer) {
    Mock::given(method("PUT"))
        .and(path(format!(
            "/api/v4/projects/{}/merge_requests/{}/merge",
            PROJECT_ID, MR_IID
        )))
        .and(header("private-token", "private-token"))
        .and(body_json(json!({ "should_remove_source_branch": "1" })))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_merges_on_every_multiple_of_threshold() {
    let gitlab = MockServer::start().await;
    mount_merge(&gitlab).await;
    let harness = Harness::new(&gitlab, None);

    let statuses = harness
        .deliver(&[note_payload("alice", "LGTM"), note_payload("bob", "lgtm")])
        .await;
    assert_eq!(statuses, vec![StatusCode::OK, StatusCode::OK]);
    assert_eq!(harness.processor.store.count(MR_IID).await.unwrap(), 2);
    assert_eq!(merge_calls(&gitlab).await, 1);

    harness.deliver(&[note_payload("carol", "LGTM")]).await;
    assert_eq!(harness.processor.store.count(MR_IID).await.unwrap(), 3);
    assert_eq!(merge_calls(&gitlab).await, 1);

    harness.deliver(&[note_payload("dave", "LGTM")]).await;
    assert_eq!(harness.processor.store.count(MR_IID).await.unwrap(), 4);
    assert_eq!(merge_calls(&gitlab).await, 2);
}

#[tokio::test]
async fn test_non_approvals_and_unlisted_reviewers_are_not_counted() {
    let gitlab = MockServer::start().await;
    mount_merge(&gitlab).await;
    let harness = Harness::new(&gitlab, Some("reviewers:\n  - alice\n  - bob\n"));

    let statuses = harness
        .deliver(&[
            note_payload("carol", "LGTM"),
            note_payload("alice", "lgtm please"),
            note_payload("alice", "LGTM"),
        ])
        .await;

    assert!(statuses.iter().all(|s| *s == StatusCode::OK));
    assert_eq!(harness.processor.store.count(MR_IID).await.unwrap(), 1);
    assert_eq!(merge_calls(&gitlab).await, 0);
}

#[tokio::test]
async fn test_malformed_payload_is_rejected_without_side_effects() {
    let gitlab = MockServer::start().await;
    mount_merge(&gitlab).await;
    let harness = Harness::new(&gitlab, None);

    let statuses = harness
        .deliver(&["{\"object_kind\": ".to_string(), String::new()])
        .await;

    assert_eq!(statuses, vec![StatusCode::BAD_REQUEST, StatusCode::BAD_REQUEST]);
    assert_eq!(harness.processor.store.count(MR_IID).await.unwrap(), 0);
    assert_eq!(merge_calls(&gitlab).await, 0);
}

#[tokio::test]
async fn test_merge_conflict_is_absorbed() {
    let gitlab = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(405))
        .expect(1)
        .mount(&gitlab)
        .await;
    let harness = Harness::new(&gitlab, None);

    let statuses = harness
        .deliver(&[note_payload("alice", "LGTM"), note_payload("bob", "LGTM")])
        .await;

    assert_eq!(statuses, vec![StatusCode::OK, StatusCode::OK]);
    assert_eq!(harness.processor.store.count(MR_IID).await.unwrap(), 2);
}

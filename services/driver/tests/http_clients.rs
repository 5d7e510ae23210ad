//! HTTP client tests against a mock network API.

use std::time::Duration;

use serde_json::json;
use slotshare_driver::clients::{
    ClientError, HttpLedger, HttpPoolSource, HttpStakeSource, Ledger, PoolSource, StakeSource,
    SubjectWeight, WeightSubmission,
};
use slotshare_driver::model::Dimension;
use slotshare_id::{CommitId, EpochIndex};
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_fetch_stakes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/stakes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"coordinator_id": "c1", "stake": 300, "endpoint": "http://pool-1"},
            {"coordinator_id": "c2", "stake": 100, "endpoint": "http://pool-2"}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    // Trailing slash on the base URL is tolerated.
    let source = HttpStakeSource::new(&format!("{}/", server.uri()), TIMEOUT).unwrap();
    let stakes = source.fetch_stakes().await.unwrap();

    assert_eq!(stakes.len(), 2);
    assert_eq!(stakes[0].coordinator_id.as_str(), "c1");
    assert_eq!(stakes[0].stake, 300);
    assert_eq!(stakes[1].endpoint, "http://pool-2");
}

#[tokio::test]
async fn test_fetch_records_sends_cursor() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/contributions"))
        .and(query_param("cursor", "41"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "records": [{
                "record_id": "r-42",
                "capacity_provider_id": "p1",
                "coordinator_id": "c1",
                "timestamp": 17,
                "dimension_samples": {"consistency": 0.9, "goal_driven": 0.4}
            }],
            "next_cursor": "42"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let source = HttpPoolSource::new(TIMEOUT).unwrap();
    let page = source.fetch_records(&server.uri(), Some("41")).await.unwrap();

    assert_eq!(page.next_cursor.as_deref(), Some("42"));
    assert_eq!(page.records.len(), 1);
    let record = &page.records[0];
    assert_eq!(record.record_id.as_str(), "r-42");
    assert_eq!(record.block, 17);
    assert_eq!(record.dimension_samples[&Dimension::GoalDriven], 0.4);
}

#[tokio::test]
async fn test_fetch_records_without_cursor_accepts_empty_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/contributions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let source = HttpPoolSource::new(TIMEOUT).unwrap();
    let page = source.fetch_records(&server.uri(), None).await.unwrap();

    assert!(page.records.is_empty());
    assert!(page.next_cursor.is_none());
}

#[tokio::test]
async fn test_error_status_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/contributions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let source = HttpPoolSource::new(TIMEOUT).unwrap();
    let err = source.fetch_records(&server.uri(), None).await.unwrap_err();

    match err {
        ClientError::Status { status, body, .. } => {
            assert_eq!(status, 503);
            assert_eq!(body, "overloaded");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_body_is_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/blocks/current"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let ledger = HttpLedger::new(&server.uri(), TIMEOUT).unwrap();
    let err = ledger.current_block().await.unwrap_err();
    assert!(matches!(err, ClientError::Decode { .. }));
}

#[tokio::test]
async fn test_current_block() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/blocks/current"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"height": 4242})))
        .mount(&server)
        .await;

    let ledger = HttpLedger::new(&server.uri(), TIMEOUT).unwrap();
    assert_eq!(ledger.current_block().await.unwrap(), 4242);
}

#[tokio::test]
async fn test_submit_weights_posts_payload() {
    let server = MockServer::start().await;
    let submission = WeightSubmission {
        commit_id: CommitId::new(),
        epoch: EpochIndex::new(7),
        weights: vec![
            SubjectWeight {
                subject_id: "p1".parse().unwrap(),
                weight: 0.75,
            },
            SubjectWeight {
                subject_id: "p2".parse().unwrap(),
                weight: 0.25,
            },
        ],
    };

    Mock::given(method("POST"))
        .and(path("/v1/weights"))
        .and(body_json(json!({
            "commit_id": submission.commit_id.to_string(),
            "epoch": 7,
            "weights": [
                {"subject_id": "p1", "weight": 0.75},
                {"subject_id": "p2", "weight": 0.25}
            ]
        })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let ledger = HttpLedger::new(&server.uri(), TIMEOUT).unwrap();
    ledger.submit_weights(&submission).await.unwrap();
}

#[tokio::test]
async fn test_rejected_submission() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/weights"))
        .respond_with(ResponseTemplate::new(409).set_body_string("stale epoch"))
        .mount(&server)
        .await;

    let ledger = HttpLedger::new(&server.uri(), TIMEOUT).unwrap();
    let submission = WeightSubmission {
        commit_id: CommitId::new(),
        epoch: EpochIndex::new(1),
        weights: vec![],
    };
    let err = ledger.submit_weights(&submission).await.unwrap_err();
    assert!(matches!(err, ClientError::Status { status: 409, .. }));
}

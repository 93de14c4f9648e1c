//! Integration tests for cursor continuation, long-poll and file info

use kdsync_core::domain::{NodeId, NodeType};
use kdsync_core::ports::IRemoteDrive;
use kdsync_drive::DriveError;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

use crate::common;

#[tokio::test]
async fn test_continue_listing_parses_actions() {
    let (server, client) = common::setup_drive_mock().await;
    common::mount_continue(
        &server,
        "cursor-001",
        serde_json::json!({
            "cursor": "cursor-002",
            "has_more": false,
            "actions": [
                {
                    "action": "file_create",
                    "file_id": 42,
                    "parent_id": 1,
                    "path": "/report.pdf",
                    "created_at": 1700000000,
                    "last_modified_at": 1700000100,
                    "file_type": "file",
                    "size": 2048
                },
                {
                    "action": "file_move",
                    "file_id": 43,
                    "parent_id": 2,
                    "path": "/Old/photo.jpg",
                    "destination": "/New/photo-renamed.jpg",
                    "file_type": "file",
                    "size": 10,
                    "capabilities": { "can_write": false }
                }
            ]
        }),
    )
    .await;

    let page = client
        .continue_listing("cursor-001")
        .await
        .expect("Continue listing failed");

    assert_eq!(page.cursor, "cursor-002");
    assert!(!page.has_more);
    assert_eq!(page.actions.len(), 2);

    let create = &page.actions[0];
    assert_eq!(create.action, "file_create");
    assert_eq!(create.file_id, NodeId::new("42"));
    assert_eq!(create.name, "report.pdf");
    assert_eq!(create.size, 2048);
    assert_eq!(create.node_type, NodeType::File);

    let moved = &page.actions[1];
    assert_eq!(moved.name, "photo-renamed.jpg");
    assert_eq!(moved.can_write, Some(false));
}

#[tokio::test]
async fn test_continue_listing_forbidden_envelope() {
    let (server, client) = common::setup_drive_mock().await;

    Mock::given(method("GET"))
        .and(path("/files/listing/continue"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "result": "error",
            "error": { "code": "forbidden_error", "description": "Access denied" }
        })))
        .mount(&server)
        .await;

    let err = client.continue_listing("c").await.unwrap_err();
    assert!(err.is_forbidden());
}

#[tokio::test]
async fn test_long_poll_reports_changes() {
    let (server, client) = common::setup_drive_mock().await;

    Mock::given(method("GET"))
        .and(path("/files/listing/listen"))
        .and(query_param("cursor", "cursor-001"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "changes": true
        })))
        .mount(&server)
        .await;

    assert!(client.long_poll("cursor-001").await.expect("Long-poll failed"));
}

#[tokio::test]
async fn test_long_poll_bad_gateway() {
    let (server, client) = common::setup_drive_mock().await;

    Mock::given(method("GET"))
        .and(path("/files/listing/listen"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let err = client.long_poll("c").await.unwrap_err();
    assert!(err.is_bad_gateway());
}

#[tokio::test]
async fn test_file_info_returns_metadata() {
    let (server, client) = common::setup_drive_mock().await;

    Mock::given(method("GET"))
        .and(path("/files/77"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "result": "success",
            "data": {
                "id": 77,
                "parent_id": 1,
                "name": "shared.txt",
                "type": "file",
                "created_at": 100,
                "last_modified_at": 200,
                "size": 5
            }
        })))
        .mount(&server)
        .await;

    let info = client
        .file_info(&NodeId::new("77"))
        .await
        .expect("File info failed");
    assert_eq!(info.name, "shared.txt");
    assert_eq!(info.size, 5);
    assert_eq!(info.last_modified, 200);
}

#[tokio::test]
async fn test_file_info_not_found() {
    let (server, client) = common::setup_drive_mock().await;

    Mock::given(method("GET"))
        .and(path("/files/78"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = client.file_info(&NodeId::new("78")).await.unwrap_err();
    assert!(matches!(err, DriveError::NotFound(_)));
}

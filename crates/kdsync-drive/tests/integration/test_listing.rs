//! Integration tests for the CSV full listing

use std::collections::HashSet;

use kdsync_core::domain::{NodeId, NodeType};
use kdsync_core::ports::IRemoteDrive;
use kdsync_drive::DriveError;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

use crate::common;

#[tokio::test]
async fn test_full_listing_returns_items_and_cursor() {
    let (server, client) = common::setup_drive_mock().await;
    let body = common::csv_body(&[
        "2,1,Documents,dir,,1700000000,1700000000,1,0",
        "3,2,\"notes, draft.txt\",file,128,1700000000,1700000100,1,0",
    ]);
    common::mount_full_listing(&server, "1", body, "cursor-001").await;

    let listing = client
        .full_listing(&NodeId::new("1"), &HashSet::new())
        .await
        .expect("Full listing failed");

    assert_eq!(listing.cursor, "cursor-001");
    assert_eq!(listing.items.len(), 2);
    assert_eq!(listing.items[0].node_type, NodeType::Directory);
    assert_eq!(listing.items[1].name, "notes, draft.txt");
    assert_eq!(listing.items[1].size, 128);
}

#[tokio::test]
async fn test_full_listing_sends_blacklist_as_without_ids() {
    let (server, client) = common::setup_drive_mock().await;

    Mock::given(method("GET"))
        .and(path("/files/listing/full"))
        .and(query_param("without_ids", "10,20"))
        .and(query_param("with", "files.is_link"))
        .and(query_param("recursive", "true"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(common::csv_body(&[]))
                .append_header("X-kDrive-Cursor", "c"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let blacklist = HashSet::from([NodeId::new("20"), NodeId::new("10")]);
    let listing = client
        .full_listing(&NodeId::new("1"), &blacklist)
        .await
        .expect("Full listing failed");
    assert!(listing.items.is_empty());
}

#[tokio::test]
async fn test_full_listing_without_eof_is_truncated() {
    let (server, client) = common::setup_drive_mock().await;
    let body = format!("{}2,1,a,file,1,1,1,1,0\n", common::CSV_HEADER);
    common::mount_full_listing(&server, "1", body, "c").await;

    let err = client
        .full_listing(&NodeId::new("1"), &HashSet::new())
        .await
        .unwrap_err();
    assert_eq!(err, DriveError::ListingTruncated);
}

#[tokio::test]
async fn test_full_listing_server_error_maps_to_http() {
    let (server, client) = common::setup_drive_mock().await;

    Mock::given(method("GET"))
        .and(path("/files/listing/full"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let err = client
        .full_listing(&NodeId::new("1"), &HashSet::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DriveError::Http { status: 500, .. }));
}

#[tokio::test]
async fn test_full_listing_unauthorized_is_invalid_token() {
    let (server, client) = common::setup_drive_mock().await;

    Mock::given(method("GET"))
        .and(path("/files/listing/full"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = client
        .full_listing(&NodeId::new("1"), &HashSet::new())
        .await
        .unwrap_err();
    assert_eq!(err, DriveError::InvalidToken);
}

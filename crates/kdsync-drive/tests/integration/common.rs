//! Shared test helpers for drive API integration tests
//!
//! Each helper mounts the endpoints a test needs on a wiremock server and
//! returns a `DriveClient` pointing at it.

use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use kdsync_drive::DriveClient;

pub const CSV_HEADER: &str =
    "id,parent_id,name,type,size,created_at,last_modified_at,can_write,is_link\n";

/// Starts a mock server and returns it with a client using it as base URL
pub async fn setup_drive_mock() -> (MockServer, DriveClient) {
    let server = MockServer::start().await;
    let client = DriveClient::with_base_url("test-access-token", server.uri());
    (server, client)
}

/// Builds a complete CSV listing body from data rows
pub fn csv_body(rows: &[&str]) -> String {
    let mut body = String::from(CSV_HEADER);
    for row in rows {
        body.push_str(row);
        body.push('\n');
    }
    body.push_str("#EOF\n");
    body
}

/// Mounts a full listing of `directory_id` returning `body` with `cursor`
pub async fn mount_full_listing(server: &MockServer, directory_id: &str, body: String, cursor: &str) {
    Mock::given(method("GET"))
        .and(path("/files/listing/full"))
        .and(query_param("directory_id", directory_id))
        .and(query_param("format", "csv"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(body)
                .append_header("X-kDrive-Cursor", cursor)
                .append_header("Content-Type", "text/csv"),
        )
        .mount(server)
        .await;
}

/// Mounts a continuation page answering for `cursor`
pub async fn mount_continue(server: &MockServer, cursor: &str, data: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/files/listing/continue"))
        .and(query_param("cursor", cursor))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "result": "success",
            "data": data
        })))
        .mount(server)
        .await;
}

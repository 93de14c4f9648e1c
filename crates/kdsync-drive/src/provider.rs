//! `IRemoteDrive` implementation backed by [`DriveClient`]

use std::collections::HashSet;

use async_trait::async_trait;
use kdsync_core::domain::NodeId;
use kdsync_core::ports::{FullListing, IRemoteDrive, ListingPage, RemoteFileInfo};
use reqwest::Method;
use tracing::{debug, instrument, warn};

use crate::changes::{ContinuePayload, FileInfoPayload, LongPollPayload};
use crate::client::{map_transport_error, DriveClient};
use crate::listing::parse_full_listing;
use crate::DriveError;

/// Response header carrying the cursor of a full listing
pub const CURSOR_HEADER: &str = "X-kDrive-Cursor";

/// Comma-separated, sorted list of ids for the `without_ids` parameter
fn join_ids(ids: &HashSet<NodeId>) -> String {
    let mut ids: Vec<&str> = ids.iter().map(NodeId::as_str).collect();
    ids.sort_unstable();
    ids.join(",")
}

#[async_trait]
impl IRemoteDrive for DriveClient {
    #[instrument(skip(self, without_ids), fields(excluded = without_ids.len()))]
    async fn full_listing(
        &self,
        directory_id: &NodeId,
        without_ids: &HashSet<NodeId>,
    ) -> Result<FullListing, DriveError> {
        let mut query: Vec<(&str, String)> = vec![
            ("directory_id", directory_id.to_string()),
            ("recursive", "true".to_string()),
            ("format", "csv".to_string()),
            ("with", "files.is_link".to_string()),
        ];
        if !without_ids.is_empty() {
            query.push(("without_ids", join_ids(without_ids)));
        }

        let builder = self
            .request(Method::GET, "/files/listing/full")
            .query(&query)
            .timeout(self.listing_timeout);
        let response = self.send(builder).await?;

        let cursor = response
            .headers()
            .get(CURSOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_default();
        if cursor.is_empty() {
            warn!("Full listing returned without a cursor header");
        }

        let body = response.text().await.map_err(map_transport_error)?;
        let parsed = parse_full_listing(&body)?;
        debug!(
            items = parsed.items.len(),
            ignored = parsed.ignored,
            "Received full listing"
        );

        Ok(FullListing {
            cursor,
            items: parsed.items,
        })
    }

    #[instrument(skip(self))]
    async fn continue_listing(&self, cursor: &str) -> Result<ListingPage, DriveError> {
        let builder = self
            .request(Method::GET, "/files/listing/continue")
            .query(&[("cursor", cursor)])
            .timeout(self.request_timeout);
        let payload: ContinuePayload = self.send_json(builder).await?;
        Ok(payload.into())
    }

    #[instrument(skip(self))]
    async fn long_poll(&self, cursor: &str) -> Result<bool, DriveError> {
        let builder = self
            .request(Method::GET, "/files/listing/listen")
            .query(&[("cursor", cursor)])
            .timeout(self.long_poll_timeout);
        let response = self.send(builder).await?;
        let payload: LongPollPayload = response
            .json()
            .await
            .map_err(|e| DriveError::InvalidResponse(e.to_string()))?;
        Ok(payload.changes)
    }

    #[instrument(skip(self))]
    async fn file_info(&self, file_id: &NodeId) -> Result<RemoteFileInfo, DriveError> {
        let builder = self
            .request(Method::GET, &format!("/files/{file_id}"))
            .timeout(self.request_timeout);
        let payload: FileInfoPayload = self.send_json(builder).await?;
        Ok(payload.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_ids_is_sorted_and_comma_separated() {
        let ids = HashSet::from([NodeId::new("9"), NodeId::new("3"), NodeId::new("5")]);
        assert_eq!(join_ids(&ids), "3,5,9");
    }

    #[test]
    fn join_ids_of_empty_set_is_empty() {
        assert_eq!(join_ids(&HashSet::new()), "");
    }
}

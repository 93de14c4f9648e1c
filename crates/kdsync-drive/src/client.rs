//! Remote drive HTTP client
//!
//! Wraps `reqwest::Client` with bearer authentication, base URL
//! construction, per-endpoint timeouts and the mapping of transport and
//! status failures onto [`DriveError`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use kdsync_drive::DriveClient;
//! use kdsync_core::domain::NodeId;
//! use kdsync_core::ports::IRemoteDrive;
//!
//! # async fn example() -> Result<(), kdsync_drive::DriveError> {
//! let client = DriveClient::with_base_url("access-token", "https://api.example.com/2/drive/42");
//! let listing = client.full_listing(&NodeId::new("1"), &Default::default()).await?;
//! println!("{} items, cursor {}", listing.items.len(), listing.cursor);
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use kdsync_core::config::DriveConfig;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::DriveError;

/// Longest response body kept in an error message
const MAX_ERROR_BODY: usize = 512;

// ============================================================================
// JSON envelope
// ============================================================================

/// Every JSON endpoint wraps its payload as `{ result, data | error }`
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope<T> {
    result: String,
    data: Option<T>,
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    description: String,
}

impl<T> Envelope<T> {
    /// Returns the payload or the server-reported error
    pub(crate) fn into_data(self) -> Result<T, DriveError> {
        if self.result == "error" {
            let err = self.error.unwrap_or(ApiErrorBody {
                code: String::new(),
                description: String::new(),
            });
            if err.code == "forbidden_error" {
                return Err(DriveError::Forbidden(err.description));
            }
            return Err(DriveError::Api {
                code: err.code,
                message: err.description,
            });
        }
        self.data
            .ok_or_else(|| DriveError::InvalidResponse("missing data field".into()))
    }
}

// ============================================================================
// DriveClient
// ============================================================================

/// HTTP client for one remote drive
pub struct DriveClient {
    client: Client,
    base_url: String,
    access_token: String,
    pub(crate) request_timeout: Duration,
    pub(crate) listing_timeout: Duration,
    pub(crate) long_poll_timeout: Duration,
}

impl DriveClient {
    /// Creates a client from the drive section of the configuration
    pub fn new(config: &DriveConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_token: config.access_token.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            listing_timeout: Duration::from_secs(config.listing_timeout_secs),
            long_poll_timeout: Duration::from_secs(config.long_poll_timeout_secs),
        }
    }

    /// Creates a client with default timeouts and a custom base URL (useful for testing)
    pub fn with_base_url(access_token: impl Into<String>, base_url: impl Into<String>) -> Self {
        let defaults = DriveConfig::default();
        let base_url: String = base_url.into();
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.into(),
            request_timeout: Duration::from_secs(defaults.request_timeout_secs),
            listing_timeout: Duration::from_secs(defaults.listing_timeout_secs),
            long_poll_timeout: Duration::from_secs(defaults.long_poll_timeout_secs),
        }
    }

    /// Overrides the long-poll timeout
    #[must_use]
    pub fn with_long_poll_timeout(mut self, timeout: Duration) -> Self {
        self.long_poll_timeout = timeout;
        self
    }

    /// Updates the access token (e.g., after a token refresh)
    pub fn set_access_token(&mut self, token: impl Into<String>) {
        self.access_token = token.into();
        debug!("Updated DriveClient access token");
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Creates an authenticated request builder for `path` under the base URL
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.client
            .request(method, &url)
            .bearer_auth(&self.access_token)
    }

    /// Sends a request and maps transport failures and error statuses
    pub(crate) async fn send(&self, builder: RequestBuilder) -> Result<Response, DriveError> {
        let response = builder.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        warn!(status = status.as_u16(), "Drive request failed");

        Err(match status {
            StatusCode::UNAUTHORIZED => DriveError::InvalidToken,
            StatusCode::FORBIDDEN => DriveError::Forbidden(body),
            StatusCode::NOT_FOUND => DriveError::NotFound(body),
            _ => DriveError::Http {
                status: status.as_u16(),
                body,
            },
        })
    }

    /// Sends a request and decodes the JSON envelope
    pub(crate) async fn send_json<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
    ) -> Result<T, DriveError> {
        let response = self.send(builder).await?;
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| DriveError::InvalidResponse(e.to_string()))?;
        envelope.into_data()
    }
}

/// Maps a reqwest transport error onto the port's error type
pub(crate) fn map_transport_error(e: reqwest::Error) -> DriveError {
    if e.is_timeout() {
        DriveError::Timeout
    } else if e.is_decode() {
        DriveError::InvalidResponse(e.to_string())
    } else {
        DriveError::Network(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_success_yields_data() {
        let env: Envelope<u32> =
            serde_json::from_str(r#"{"result":"success","data":7}"#).unwrap();
        assert_eq!(env.into_data().unwrap(), 7);
    }

    #[test]
    fn envelope_forbidden_maps_to_forbidden() {
        let env: Envelope<u32> = serde_json::from_str(
            r#"{"result":"error","error":{"code":"forbidden_error","description":"nope"}}"#,
        )
        .unwrap();
        assert_eq!(env.into_data(), Err(DriveError::Forbidden("nope".into())));
    }

    #[test]
    fn envelope_other_error_maps_to_api() {
        let env: Envelope<u32> = serde_json::from_str(
            r#"{"result":"error","error":{"code":"object_not_found","description":"gone"}}"#,
        )
        .unwrap();
        assert!(matches!(
            env.into_data(),
            Err(DriveError::Api { code, .. }) if code == "object_not_found"
        ));
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = DriveClient::with_base_url("t", "http://localhost/2/drive/1/");
        assert_eq!(client.base_url(), "http://localhost/2/drive/1");
    }
}

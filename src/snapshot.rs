//! Snapshot pulls from the order API.
//!
//! A snapshot is the full current order list for one branch. It is fetched on
//! the poll interval and once after every pushed order; whatever it returns
//! replaces the store. Failures are reported to the caller, which logs and
//! skips the cycle.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::config::normalize_base_url;
use crate::error::{Result, ScreenError};
use crate::order::{parse_snapshot, Order};

/// Anything that can produce the branch's current order list.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self, branch_id: &str) -> Result<Vec<Order>>;
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach order API at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid order API URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> ScreenError {
    let message = match status.as_u16() {
        401 | 403 => "Branch is not authorized for the customer screen".to_string(),
        404 => "Branch not found".to_string(),
        s if s >= 500 => "Order API server error".to_string(),
        _ => "Unexpected response from order API".to_string(),
    };
    ScreenError::Status {
        status: status.as_u16(),
        message,
    }
}

/// Percent-encode a path segment (RFC 3986 unreserved characters pass through).
fn percent_encode(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len());
    for b in input.bytes() {
        let is_unreserved =
            b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' || b == b'~';
        if is_unreserved {
            encoded.push(b as char);
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }
    encoded
}

// ---------------------------------------------------------------------------
// HTTP fetcher
// ---------------------------------------------------------------------------

/// `GET <api-base>/api/customerScreen/branch/<branchId>`.
///
/// No request timeout is set: a hung request only delays its own result, the
/// session keeps polling on schedule.
pub struct HttpSnapshotFetcher {
    client: Client,
    base_url: String,
}

impl HttpSnapshotFetcher {
    pub fn new(api_base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| ScreenError::Http(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_base_url(api_base_url),
        })
    }

    pub fn snapshot_url(&self, branch_id: &str) -> String {
        format!(
            "{}/api/customerScreen/branch/{}",
            self.base_url,
            percent_encode(branch_id.trim())
        )
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotFetcher {
    async fn fetch(&self, branch_id: &str) -> Result<Vec<Order>> {
        let url = self.snapshot_url(branch_id);

        let resp = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| ScreenError::Http(friendly_error(&self.base_url, &e)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(status));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| ScreenError::Http(friendly_error(&self.base_url, &e)))?;
        let orders = parse_snapshot(&body)?;
        debug!(branch_id, count = orders.len(), "Snapshot fetched");
        Ok(orders)
    }
}

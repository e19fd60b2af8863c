//! Order model shared by the snapshot API and the streaming channel.
//!
//! Both sources deliver the same camelCase JSON shape. Parsing is lenient
//! where the backend is known to vary (numeric order numbers, status casing)
//! and strict everywhere else: a payload that cannot be read as an order is
//! dropped by the caller, never half-applied.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{Result, ScreenError};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Order status as reported by the order-management backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OrderStatus {
    /// Paid and being prepared.
    Payed,
    /// Ready for pickup.
    Completed,
    /// Any other backend status. Kept verbatim, shown in neither lane.
    Other(String),
}

impl OrderStatus {
    pub fn as_str(&self) -> &str {
        match self {
            OrderStatus::Payed => "PAYED",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Other(raw) => raw,
        }
    }
}

impl From<String> for OrderStatus {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PAYED" | "PAID" => OrderStatus::Payed,
            "COMPLETED" => OrderStatus::Completed,
            _ => OrderStatus::Other(raw),
        }
    }
}

impl From<OrderStatus> for String {
    fn from(status: OrderStatus) -> Self {
        status.as_str().to_string()
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: i64,
    /// Short customer-facing number (1-5 digits).
    #[serde(deserialize_with = "display_number")]
    pub number: String,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<i64>,
    /// `Some(false)` marks a server-side soft-hidden order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
}

impl Order {
    /// Everything except an explicit `visible: false` counts as visible.
    pub fn is_visible(&self) -> bool {
        self.visible != Some(false)
    }
}

/// Accept the order number either as a JSON string or a bare integer.
fn display_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s.trim().to_string()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "order number must be a string or integer, got {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a single order payload (push event body).
pub fn parse_order(value: Value) -> Result<Order> {
    Ok(serde_json::from_value(value)?)
}

/// Parse a snapshot response body.
///
/// The body must be a JSON array; anything else is an error. Individual
/// elements that fail to parse are logged and skipped so one bad row does
/// not hide the rest of the board.
pub fn parse_snapshot(body: &str) -> Result<Vec<Order>> {
    let value: Value = serde_json::from_str(body)?;
    let Value::Array(items) = value else {
        return Err(ScreenError::Protocol(
            "snapshot response is not a JSON array".into(),
        ));
    };

    let mut orders = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        match parse_order(item) {
            Ok(order) => orders.push(order),
            Err(e) => warn!(index, error = %e, "Dropping malformed order in snapshot"),
        }
    }
    Ok(orders)
}

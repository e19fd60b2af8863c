//! Lane derivation: which orders are on screen right now.
//!
//! Pure function of the store and the current time. Windows are evaluated on
//! every render, so an order leaves its lane as soon as its window expires
//! without any eviction event.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::order::{Order, OrderStatus};
use crate::store::OrderStore;

/// Preparing orders stay on screen this long after creation.
pub const PREPARING_WINDOW_MINUTES: i64 = 30;

/// Ready orders stay on screen this long after their last update.
pub const READY_WINDOW_MINUTES: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneWindows {
    pub preparing: Duration,
    pub ready: Duration,
}

impl Default for LaneWindows {
    fn default() -> Self {
        Self {
            preparing: Duration::minutes(PREPARING_WINDOW_MINUTES),
            ready: Duration::minutes(READY_WINDOW_MINUTES),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaneEntry {
    pub order: Order,
    /// Drives the one-shot highlight; only true for one snapshot cycle.
    pub is_new: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DisplayLanes {
    pub preparing: Vec<LaneEntry>,
    pub ready: Vec<LaneEntry>,
}

impl DisplayLanes {
    pub fn preparing_numbers(&self) -> Vec<&str> {
        self.preparing.iter().map(|e| e.order.number.as_str()).collect()
    }

    pub fn ready_numbers(&self) -> Vec<&str> {
        self.ready.iter().map(|e| e.order.number.as_str()).collect()
    }
}

fn in_preparing_lane(order: &Order, now: DateTime<Utc>, windows: &LaneWindows) -> bool {
    order.status == OrderStatus::Payed && now - order.created_at <= windows.preparing
}

fn in_ready_lane(order: &Order, now: DateTime<Utc>, windows: &LaneWindows) -> bool {
    order.status == OrderStatus::Completed && now - order.updated_at <= windows.ready
}

/// Build both lanes from the store as of `now`.
///
/// Preparing is sorted oldest first (ties broken by id); ready keeps store
/// order.
pub fn derive_lanes(store: &OrderStore, now: DateTime<Utc>, windows: &LaneWindows) -> DisplayLanes {
    let entry = |order: &Order| LaneEntry {
        order: order.clone(),
        is_new: store.is_new_relative_to_previous(order),
    };

    let mut preparing: Vec<LaneEntry> = store
        .orders()
        .iter()
        .filter(|o| in_preparing_lane(o, now, windows))
        .map(entry)
        .collect();
    preparing.sort_by(|a, b| {
        a.order
            .created_at
            .cmp(&b.order.created_at)
            .then(a.order.id.cmp(&b.order.id))
    });

    let ready = store
        .orders()
        .iter()
        .filter(|o| in_ready_lane(o, now, windows))
        .map(entry)
        .collect();

    DisplayLanes { preparing, ready }
}

//! One-at-a-time presentation of pushed orders.
//!
//! Pushes can arrive in bursts; the viewer sees them as a sequence of
//! full-screen interstitials, each held for a fixed duration. The queue is a
//! plain state machine driven by the session's clock: `enqueue` appends,
//! `tick(now)` performs any due transitions and reports them.
//!
//! ```text
//!   IDLE --(backlog non-empty)--> SHOWING --(deadline reached)--> IDLE
//! ```
//!
//! `SHOWING -> IDLE` is re-evaluated in the same tick, so a queued entry
//! follows the previous one without a gap.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::order::Order;

/// How long each interstitial stays on screen.
pub const DEFAULT_DISPLAY_DURATION: Duration = Duration::from_millis(5_000);

/// Default cap on entries waiting behind the one being shown.
pub const DEFAULT_BACKLOG_CAP: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEntry {
    /// Arrival sequence, strictly increasing per queue.
    pub seq: u64,
    pub order: Order,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePhase {
    Idle,
    Showing,
}

/// A transition performed by `tick`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueTransition {
    Shown(NotificationEntry),
    Dismissed(NotificationEntry),
}

#[derive(Debug)]
struct Showing {
    entry: NotificationEntry,
    deadline: Instant,
}

#[derive(Debug)]
pub struct NotificationQueue {
    backlog: VecDeque<NotificationEntry>,
    showing: Option<Showing>,
    display_duration: Duration,
    /// `None` means unbounded.
    backlog_cap: Option<usize>,
    next_seq: u64,
    dropped: u64,
}

impl Default for NotificationQueue {
    fn default() -> Self {
        Self::new(DEFAULT_DISPLAY_DURATION, Some(DEFAULT_BACKLOG_CAP))
    }
}

impl NotificationQueue {
    pub fn new(display_duration: Duration, backlog_cap: Option<usize>) -> Self {
        Self {
            backlog: VecDeque::new(),
            showing: None,
            display_duration,
            backlog_cap,
            next_seq: 0,
            dropped: 0,
        }
    }

    /// Append an order to the tail. Never merges with earlier entries for the
    /// same id. When the backlog is over its cap the oldest waiting entry is
    /// dropped; the entry on screen is never touched.
    pub fn enqueue(&mut self, order: Order) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.backlog.push_back(NotificationEntry { seq, order });

        if let Some(cap) = self.backlog_cap {
            while self.backlog.len() > cap.max(1) {
                if let Some(evicted) = self.backlog.pop_front() {
                    self.dropped += 1;
                    warn!(
                        seq = evicted.seq,
                        order_id = evicted.order.id,
                        cap,
                        "Notification backlog full, dropping oldest pending entry"
                    );
                }
            }
        }
        seq
    }

    /// Apply every transition due at `now`.
    pub fn tick(&mut self, now: Instant) -> Vec<QueueTransition> {
        let mut transitions = Vec::new();

        if let Some(showing) = self.showing.take() {
            if now >= showing.deadline {
                debug!(seq = showing.entry.seq, "Notification dismissed");
                transitions.push(QueueTransition::Dismissed(showing.entry));
            } else {
                self.showing = Some(showing);
            }
        }

        if self.showing.is_none() {
            if let Some(entry) = self.backlog.pop_front() {
                debug!(
                    seq = entry.seq,
                    order_id = entry.order.id,
                    pending = self.backlog.len(),
                    "Notification shown"
                );
                self.showing = Some(Showing {
                    entry: entry.clone(),
                    deadline: now + self.display_duration,
                });
                transitions.push(QueueTransition::Shown(entry));
            }
        }

        transitions
    }

    pub fn phase(&self) -> QueuePhase {
        if self.showing.is_some() {
            QueuePhase::Showing
        } else {
            QueuePhase::Idle
        }
    }

    pub fn current(&self) -> Option<&NotificationEntry> {
        self.showing.as_ref().map(|s| &s.entry)
    }

    /// When the entry on screen is due to be dismissed.
    pub fn deadline(&self) -> Option<Instant> {
        self.showing.as_ref().map(|s| s.deadline)
    }

    pub fn pending(&self) -> usize {
        self.backlog.len()
    }

    /// Entries evicted because the backlog cap was hit.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Drop everything, including the entry on screen.
    pub fn clear(&mut self) {
        self.backlog.clear();
        self.showing = None;
    }
}

//! Authoritative in-memory order set for one display session.
//!
//! Two writers feed the store: full snapshots from the order API and single
//! order pushes from the streaming channel. Snapshots replace the set
//! wholesale; pushes upsert by id. Both paths drop soft-hidden orders, so the
//! store never holds an order with `visible: false` and never holds two
//! orders with the same id.
//!
//! The store is owned by the session's dispatch loop and is never shared
//! across tasks, so it carries no locks.

use std::collections::{HashMap, HashSet};

use crate::order::Order;

/// What `apply_push_event` did with an incoming order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Identical to the stored copy.
    Unchanged,
    /// Older `updatedAt` than the stored copy; ignored.
    Stale,
    /// `visible: false`; ignored.
    Hidden,
}

#[derive(Debug, Default)]
pub struct OrderStore {
    /// Current orders in arrival order (snapshot order, then pushes appended).
    orders: Vec<Order>,
    /// id -> position in `orders`.
    index: HashMap<i64, usize>,
    /// Ids of the most recently applied snapshot. Pushes never write here.
    snapshot_ids: HashSet<i64>,
    /// Ids of the snapshot before that one.
    previous_ids: HashSet<i64>,
}

impl OrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the set with `orders`. The id set of the outgoing snapshot is
    /// kept for one cycle of "is new" classification; orders that only came
    /// in by push since then still count as new.
    ///
    /// Hidden orders are dropped. If a snapshot repeats an id, the first
    /// occurrence wins.
    pub fn reconcile_snapshot(&mut self, orders: Vec<Order>) {

        let mut next = Vec::with_capacity(orders.len());
        let mut index = HashMap::with_capacity(orders.len());
        for order in orders.into_iter().filter(Order::is_visible) {
            if index.contains_key(&order.id) {
                continue;
            }
            index.insert(order.id, next.len());
            next.push(order);
        }

        let snapshot_ids = index.keys().copied().collect();
        self.previous_ids = std::mem::replace(&mut self.snapshot_ids, snapshot_ids);
        self.orders = next;
        self.index = index;
    }

    /// Insert or update a single order by id. The change is visible to the
    /// next render pass without waiting for a snapshot.
    pub fn apply_push_event(&mut self, order: Order) -> UpsertOutcome {
        if !order.is_visible() {
            return UpsertOutcome::Hidden;
        }

        match self.index.get(&order.id).copied() {
            Some(pos) => {
                let existing = &mut self.orders[pos];
                if *existing == order {
                    UpsertOutcome::Unchanged
                } else if order.updated_at < existing.updated_at {
                    UpsertOutcome::Stale
                } else {
                    *existing = order;
                    UpsertOutcome::Updated
                }
            }
            None => {
                self.index.insert(order.id, self.orders.len());
                self.orders.push(order);
                UpsertOutcome::Inserted
            }
        }
    }

    /// True when the snapshot preceding the latest one did not contain this id.
    pub fn is_new_relative_to_previous(&self, order: &Order) -> bool {
        !self.previous_ids.contains(&order.id)
    }

    pub fn orders(&self) -> &[Order] {
        &self.orders
    }

    pub fn get(&self, id: i64) -> Option<&Order> {
        self.index.get(&id).map(|&pos| &self.orders[pos])
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

//! Display session: owns the store, the notification queue and the channel,
//! and serialises everything that mutates them through one dispatch loop.
//!
//! The loop reacts to four kinds of wake-ups: the snapshot poll interval, the
//! interstitial deadline, channel events and completed snapshot fetches. Each
//! reaction runs to completion before the next one is picked, so no locking is
//! needed around the state. Fetches run as tracked tasks and report back with
//! a sequence number; a result older than one already applied is discarded.
//!
//! What the viewer should see is published as a [`ScreenView`] on a `watch`
//! channel after every reaction.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::channel::{ChannelEvent, Connector, TransportChannel};
use crate::config::ScreenConfig;
use crate::error::Result;
use crate::filter::{derive_lanes, DisplayLanes, LaneWindows};
use crate::liveness::{ConnectionState, LivenessIndicator};
use crate::order::Order;
use crate::queue::{NotificationEntry, NotificationQueue, QueueTransition};
use crate::snapshot::SnapshotSource;
use crate::store::{OrderStore, UpsertOutcome};

const CHANNEL_BUFFER: usize = 64;

type FetchResult = (u64, Result<Vec<Order>>);

// ---------------------------------------------------------------------------
// View model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ScreenContent {
    /// Full-screen notification; the lanes are hidden while it shows.
    Interstitial(NotificationEntry),
    Lanes(DisplayLanes),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenView {
    pub liveness: ConnectionState,
    pub banner: Option<String>,
    pub content: ScreenContent,
}

impl ScreenView {
    pub fn is_interstitial(&self) -> bool {
        matches!(self.content, ScreenContent::Interstitial(_))
    }

    pub fn lanes(&self) -> Option<&DisplayLanes> {
        match &self.content {
            ScreenContent::Lanes(lanes) => Some(lanes),
            ScreenContent::Interstitial(_) => None,
        }
    }

    pub fn interstitial(&self) -> Option<&NotificationEntry> {
        match &self.content {
            ScreenContent::Interstitial(entry) => Some(entry),
            ScreenContent::Lanes(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Everything the dispatch loop mutates.
struct SessionCore {
    store: OrderStore,
    queue: NotificationQueue,
    liveness: LivenessIndicator,
    windows: LaneWindows,
    next_fetch_seq: u64,
    applied_fetch_seq: u64,
    /// Fetches started but not yet reported back. Grows while the API hangs.
    in_flight: usize,
}

impl SessionCore {
    fn new(config: &ScreenConfig) -> Self {
        Self {
            store: OrderStore::new(),
            queue: NotificationQueue::new(config.notification_duration, config.notification_backlog),
            liveness: LivenessIndicator::new(),
            windows: config.lane_windows,
            next_fetch_seq: 0,
            applied_fetch_seq: 0,
            in_flight: 0,
        }
    }

    fn begin_fetch(&mut self) -> u64 {
        self.next_fetch_seq += 1;
        self.in_flight += 1;
        self.next_fetch_seq
    }

    /// Returns `true` when the snapshot replaced the store.
    fn apply_fetch(&mut self, seq: u64, result: Result<Vec<Order>>) -> bool {
        self.in_flight = self.in_flight.saturating_sub(1);
        match result {
            Err(e) => {
                warn!(seq, error = %e, "Snapshot fetch failed, keeping previous orders");
                false
            }
            Ok(_) if seq <= self.applied_fetch_seq => {
                debug!(
                    seq,
                    applied = self.applied_fetch_seq,
                    "Discarding snapshot older than the one on screen"
                );
                false
            }
            Ok(orders) => {
                self.applied_fetch_seq = seq;
                self.store.reconcile_snapshot(orders);
                debug!(seq, orders = self.store.len(), "Snapshot applied");
                true
            }
        }
    }

    /// Returns `true` when the event calls for a resync fetch.
    fn apply_channel_event(&mut self, event: ChannelEvent) -> bool {
        match event {
            ChannelEvent::NewOrder(order) => {
                let order_id = order.id;
                let outcome = self.store.apply_push_event(order.clone());
                debug!(order_id, outcome = ?outcome, "Push applied");
                // A stale push would announce a status the board no longer shows.
                if !matches!(outcome, UpsertOutcome::Hidden | UpsertOutcome::Stale) {
                    let seq = self.queue.enqueue(order);
                    debug!(order_id, seq, pending = self.queue.pending(), "Notification queued");
                }
                true
            }
            other => {
                if self.liveness.apply(&other) {
                    info!(state = ?self.liveness.state(), "Connection state changed");
                }
                false
            }
        }
    }

    fn tick(&mut self, now: Instant) -> Vec<QueueTransition> {
        self.queue.tick(now)
    }

    fn view(&self, now: DateTime<Utc>) -> ScreenView {
        let content = match self.queue.current() {
            Some(entry) => ScreenContent::Interstitial(entry.clone()),
            None => ScreenContent::Lanes(derive_lanes(&self.store, now, &self.windows)),
        };
        ScreenView {
            liveness: self.liveness.state(),
            banner: self.liveness.banner(),
            content,
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch loop
// ---------------------------------------------------------------------------

struct Dispatcher {
    core: SessionCore,
    snapshots: Arc<dyn SnapshotSource>,
    branch_id: String,
    poll_interval: Duration,
    tracker: TaskTracker,
    cancel: CancellationToken,
    view_tx: watch::Sender<ScreenView>,
}

impl Dispatcher {
    fn spawn_fetch(&mut self, fetch_tx: &mpsc::UnboundedSender<FetchResult>, reason: &'static str) {
        let seq = self.core.begin_fetch();
        debug!(seq, reason, in_flight = self.core.in_flight, "Snapshot fetch started");

        let source = Arc::clone(&self.snapshots);
        let branch_id = self.branch_id.clone();
        let tx = fetch_tx.clone();
        let cancel = self.cancel.clone();
        self.tracker.spawn(
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    result = source.fetch(&branch_id) => {
                        let _ = tx.send((seq, result));
                    }
                }
            }
            .in_current_span(),
        );
    }

    fn publish(&self) {
        let next = self.core.view(Utc::now());
        self.view_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    async fn run(mut self, mut channel_rx: mpsc::Receiver<ChannelEvent>) {
        let (fetch_tx, mut fetch_rx) = mpsc::unbounded_channel::<FetchResult>();
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Display session dispatch loop started"
        );

        loop {
            let deadline = self.core.queue.deadline();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(event) = channel_rx.recv() => {
                    if self.core.apply_channel_event(event) {
                        self.spawn_fetch(&fetch_tx, "push");
                    }
                }
                Some((seq, result)) = fetch_rx.recv() => {
                    self.core.apply_fetch(seq, result);
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {}
                _ = poll.tick() => self.spawn_fetch(&fetch_tx, "interval"),
            }

            for transition in self.core.tick(Instant::now()) {
                if let QueueTransition::Shown(entry) = transition {
                    info!(
                        seq = entry.seq,
                        order_id = entry.order.id,
                        number = %entry.order.number,
                        "Showing order notification"
                    );
                }
            }
            self.publish();
        }

        self.core.queue.clear();
        info!(
            dropped_notifications = self.core.queue.dropped(),
            "Display session dispatch loop stopped"
        );
    }
}

// ---------------------------------------------------------------------------
// Public session handle
// ---------------------------------------------------------------------------

/// One display session for one branch. Started once, stopped once.
pub struct DisplaySession {
    id: Uuid,
    config: ScreenConfig,
    snapshots: Arc<dyn SnapshotSource>,
    connector: Arc<dyn Connector>,
    view_tx: Option<watch::Sender<ScreenView>>,
    view_rx: watch::Receiver<ScreenView>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl DisplaySession {
    pub fn new(
        config: ScreenConfig,
        snapshots: Arc<dyn SnapshotSource>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let initial = SessionCore::new(&config).view(Utc::now());
        let (view_tx, view_rx) = watch::channel(initial);
        Self {
            id: Uuid::new_v4(),
            config,
            snapshots,
            connector,
            view_tx: Some(view_tx),
            view_rx,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Spawn the channel and the dispatch loop. Must be called from within a
    /// tokio runtime. Calling it again is a no-op.
    pub fn start(&mut self) -> watch::Receiver<ScreenView> {
        let Some(view_tx) = self.view_tx.take() else {
            warn!(session_id = %self.id, "Display session already started");
            return self.subscribe();
        };

        let span = info_span!(
            "display_session",
            session_id = %self.id,
            branch_id = %self.config.branch_id
        );
        let _entered = span.enter();

        let (channel_tx, channel_rx) = mpsc::channel(CHANNEL_BUFFER);
        let channel = TransportChannel::new(Arc::clone(&self.connector), self.config.reconnect_delay);
        self.tracker
            .spawn(channel.run(channel_tx, self.cancel.clone()).in_current_span());

        let dispatcher = Dispatcher {
            core: SessionCore::new(&self.config),
            snapshots: Arc::clone(&self.snapshots),
            branch_id: self.config.branch_id.clone(),
            poll_interval: self.config.poll_interval,
            tracker: self.tracker.clone(),
            cancel: self.cancel.clone(),
            view_tx,
        };
        self.tracker
            .spawn(dispatcher.run(channel_rx).in_current_span());

        info!("Display session started");
        self.subscribe()
    }

    pub fn subscribe(&self) -> watch::Receiver<ScreenView> {
        self.view_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.view_tx.is_none() && !self.cancel.is_cancelled()
    }

    /// Stop the channel, the timers and any in-flight fetches, and wait for
    /// them to finish.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!(session_id = %self.id, "Display session stopped");
    }
}

impl Drop for DisplaySession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Link;
    use crate::error::ScreenError;
    use crate::order::OrderStatus;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use zeroize::Zeroizing;

    fn config() -> ScreenConfig {
        ScreenConfig {
            api_base_url: "http://localhost:8080".into(),
            socket_base_url: "http://localhost:8080".into(),
            branch_id: "12".into(),
            branch_key: Zeroizing::new("key".into()),
            poll_interval: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(2),
            notification_duration: Duration::from_secs(5),
            notification_backlog: Some(50),
            lane_windows: LaneWindows::default(),
        }
    }

    fn order(id: i64, status: OrderStatus) -> Order {
        let now = Utc::now();
        Order {
            id,
            number: format!("{}", 100 + id),
            status,
            created_at: now,
            updated_at: now,
            company_id: None,
            visible: None,
        }
    }

    /// Hands out queued responses; once empty every fetch hangs.
    struct FakeSnapshots {
        responses: Mutex<VecDeque<Result<Vec<Order>>>>,
        calls: AtomicU32,
    }

    impl FakeSnapshots {
        fn new(responses: Vec<Result<Vec<Order>>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl SnapshotSource for FakeSnapshots {
        async fn fetch(&self, _branch_id: &str) -> Result<Vec<Order>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.responses.lock().unwrap().pop_front();
            match next {
                Some(result) => result,
                None => std::future::pending().await,
            }
        }
    }

    struct PushLink {
        pushes: mpsc::UnboundedReceiver<Order>,
    }

    #[async_trait]
    impl Link for PushLink {
        async fn next_event(&mut self) -> Result<Option<Order>> {
            match self.pushes.recv().await {
                Some(order) => Ok(Some(order)),
                None => std::future::pending().await,
            }
        }
    }

    /// First connect yields a link fed by the test; later connects fail.
    struct PushConnector {
        pushes: Mutex<Option<mpsc::UnboundedReceiver<Order>>>,
    }

    impl PushConnector {
        fn new() -> (Arc<Self>, mpsc::UnboundedSender<Order>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    pushes: Mutex::new(Some(rx)),
                }),
                tx,
            )
        }
    }

    #[async_trait]
    impl Connector for PushConnector {
        async fn connect(&self) -> Result<Box<dyn Link>> {
            match self.pushes.lock().unwrap().take() {
                Some(pushes) => Ok(Box::new(PushLink { pushes })),
                None => Err(ScreenError::ConnectionClosed),
            }
        }
    }

    #[test]
    fn test_push_updates_lanes_without_snapshot() {
        let mut core = SessionCore::new(&config());
        let seq = core.begin_fetch();
        assert!(core.apply_fetch(seq, Ok(vec![order(1, OrderStatus::Payed)])));

        let lanes = derive_lanes(&core.store, Utc::now(), &core.windows);
        assert_eq!(lanes.preparing_numbers(), vec!["101"]);
        assert!(lanes.ready.is_empty());

        let resync = core.apply_channel_event(ChannelEvent::NewOrder(order(1, OrderStatus::Completed)));
        assert!(resync);

        let lanes = derive_lanes(&core.store, Utc::now(), &core.windows);
        assert!(lanes.preparing.is_empty());
        assert_eq!(lanes.ready_numbers(), vec!["101"]);
    }

    #[test]
    fn test_older_fetch_result_is_discarded() {
        let mut core = SessionCore::new(&config());
        let first = core.begin_fetch();
        let second = core.begin_fetch();

        assert!(core.apply_fetch(second, Ok(vec![order(2, OrderStatus::Payed)])));
        assert!(!core.apply_fetch(first, Ok(vec![order(1, OrderStatus::Payed)])));
        assert!(core.store.get(2).is_some());
        assert!(core.store.get(1).is_none());
    }

    #[test]
    fn test_failed_fetch_keeps_previous_orders() {
        let mut core = SessionCore::new(&config());
        let seq = core.begin_fetch();
        core.apply_fetch(seq, Ok(vec![order(1, OrderStatus::Payed)]));

        let seq = core.begin_fetch();
        assert!(!core.apply_fetch(seq, Err(ScreenError::Http("down".into()))));
        assert_eq!(core.store.len(), 1);
    }

    #[test]
    fn test_hidden_push_is_not_queued_but_still_resyncs() {
        let mut core = SessionCore::new(&config());
        let mut hidden = order(1, OrderStatus::Payed);
        hidden.visible = Some(false);

        assert!(core.apply_channel_event(ChannelEvent::NewOrder(hidden)));
        assert_eq!(core.queue.pending(), 0);
        assert!(core.store.is_empty());
    }

    #[test]
    fn test_connectivity_events_drive_banner_only() {
        let mut core = SessionCore::new(&config());
        assert!(!core.apply_channel_event(ChannelEvent::Connected));
        let view = core.view(Utc::now());
        assert_eq!(view.liveness, ConnectionState::Connected);
        assert_eq!(view.banner, None);

        core.apply_channel_event(ChannelEvent::Disconnected {
            reason: "closed by server".into(),
        });
        core.apply_channel_event(ChannelEvent::ReconnectAttempt { attempt: 3 });
        let view = core.view(Utc::now());
        assert_eq!(view.liveness, ConnectionState::Reconnecting);
        assert_eq!(view.banner.as_deref(), Some("Reconnecting (attempt 3)"));
    }

    #[test]
    fn test_in_flight_counts_unanswered_fetches() {
        let mut core = SessionCore::new(&config());
        let first = core.begin_fetch();
        core.begin_fetch();
        core.begin_fetch();
        assert_eq!(core.in_flight, 3);

        core.apply_fetch(first, Err(ScreenError::Http("down".into())));
        assert_eq!(core.in_flight, 2);
    }

    #[test]
    fn test_stale_push_is_not_announced() {
        let mut core = SessionCore::new(&config());
        let completed = order(1, OrderStatus::Completed);
        let mut payed = order(1, OrderStatus::Payed);
        payed.updated_at = completed.updated_at - chrono::Duration::minutes(1);

        core.apply_channel_event(ChannelEvent::NewOrder(completed));
        assert_eq!(core.queue.pending(), 1);

        assert!(core.apply_channel_event(ChannelEvent::NewOrder(payed)));
        assert_eq!(core.queue.pending(), 1);
        assert_eq!(core.store.get(1).unwrap().status, OrderStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_cadence_and_one_resync_per_push() {
        let snapshots = FakeSnapshots::new((0..10).map(|_| Ok(vec![])).collect());
        let (connector, pushes) = PushConnector::new();
        let started = Instant::now();
        let mut session = DisplaySession::new(config(), snapshots.clone(), connector);
        let mut view = session.start();
        let calls = || snapshots.calls.load(Ordering::SeqCst);

        // Initial fetch fires immediately.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls(), 1);

        // One push, one resync, well before the next tick.
        pushes.send(order(1, OrderStatus::Payed)).unwrap();
        view.wait_for(|v| v.is_interstitial()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls(), 2);
        assert!(started.elapsed() < Duration::from_secs(1));

        // Then one fetch per poll interval, nothing in between.
        for tick in 1..=3u32 {
            let due = started + Duration::from_secs(5) * tick;
            tokio::time::sleep_until(due - Duration::from_millis(100)).await;
            assert_eq!(calls(), 1 + tick);
            tokio::time::sleep_until(due + Duration::from_millis(100)).await;
            assert_eq!(calls(), 2 + tick);
        }

        session.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_then_push_moves_order_to_ready_lane() {
        let snapshots = FakeSnapshots::new(vec![Ok(vec![order(1, OrderStatus::Payed)])]);
        let (connector, pushes) = PushConnector::new();
        let mut session = DisplaySession::new(config(), snapshots.clone(), connector);
        let mut view = session.start();

        view.wait_for(|v| v.lanes().is_some_and(|l| l.preparing_numbers() == vec!["101"]))
            .await
            .unwrap();

        pushes.send(order(1, OrderStatus::Completed)).unwrap();
        let shown = view
            .wait_for(|v| v.is_interstitial())
            .await
            .unwrap()
            .clone();
        let entry = shown.interstitial().unwrap();
        assert_eq!(entry.order.id, 1);
        assert_eq!(entry.order.status, OrderStatus::Completed);
        let shown_at = Instant::now();

        // Every fetch after the first hangs, so this can only come from the push.
        let after = view
            .wait_for(|v| v.lanes().is_some())
            .await
            .unwrap()
            .clone();
        assert!(shown_at.elapsed() >= Duration::from_secs(5));
        let lanes = after.lanes().unwrap();
        assert!(lanes.preparing.is_empty());
        assert_eq!(lanes.ready_numbers(), vec!["101"]);
        assert!(snapshots.calls.load(Ordering::SeqCst) >= 2);

        session.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_back_to_back_pushes_show_sequentially() {
        let snapshots = FakeSnapshots::new(vec![]);
        let (connector, pushes) = PushConnector::new();
        let mut session = DisplaySession::new(config(), snapshots, connector);
        let mut view = session.start();

        pushes.send(order(1, OrderStatus::Payed)).unwrap();
        pushes.send(order(2, OrderStatus::Payed)).unwrap();

        view.wait_for(|v| v.interstitial().is_some_and(|e| e.order.id == 1))
            .await
            .unwrap();
        let first_at = Instant::now();

        view.wait_for(|v| v.interstitial().is_some_and(|e| e.order.id == 2))
            .await
            .unwrap();
        let second_at = Instant::now();
        assert!(second_at - first_at >= Duration::from_secs(5));

        view.wait_for(|v| v.lanes().is_some()).await.unwrap();
        assert!(second_at.elapsed() >= Duration::from_secs(5));

        session.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_tears_down_timers_and_channel() {
        let snapshots = FakeSnapshots::new(vec![Ok(vec![]), Ok(vec![])]);
        let (connector, _pushes) = PushConnector::new();
        let mut session = DisplaySession::new(config(), snapshots.clone(), connector);
        let view = session.start();
        assert!(session.is_running());

        tokio::time::sleep(Duration::from_secs(6)).await;
        session.stop().await;
        assert!(!session.is_running());

        let calls = snapshots.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(snapshots.calls.load(Ordering::SeqCst), calls);

        // Dispatch loop owned the sender; it is gone now.
        assert!(view.has_changed().is_err());
    }
}

//! Streaming order channel with its own reconnect loop.
//!
//! The channel keeps exactly one authenticated connection to the branch's
//! order topic. When that connection drops (or can't be established) it waits
//! a fixed delay and tries again, forever. Callers see the connection through
//! [`ChannelEvent`]s on an mpsc queue; there is no "gave up"
//! event.
//!
//! The wire side is behind [`Connector`] / [`Link`] so the loop can be driven
//! by fakes in tests.

pub mod protocol;
pub mod socketio;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::order::Order;

pub use socketio::SocketIoConnector;

/// Delay between reconnect attempts. Fixed, no backoff.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(2_000);

/// Observable channel transitions plus the order push itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// First successful connection of this channel.
    Connected,
    Disconnected { reason: String },
    /// About to retry; `attempt` counts from 1 since the last good connection.
    ReconnectAttempt { attempt: u32 },
    /// Connected again after `attempts` tries.
    Reconnected { attempts: u32 },
    NewOrder(Order),
}

/// One established connection.
#[async_trait]
pub trait Link: Send {
    /// Next order pushed by the backend. `Ok(None)` means the server closed the
    /// connection; `Err` means it broke.
    async fn next_event(&mut self) -> Result<Option<Order>>;

    /// Best-effort graceful close on teardown.
    async fn close(&mut self) {}
}

/// Opens authenticated links to the order topic.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Link>>;
}

enum Pump {
    Cancelled,
    Lost(String),
}

pub struct TransportChannel {
    connector: Arc<dyn Connector>,
    reconnect_delay: Duration,
}

impl TransportChannel {
    pub fn new(connector: Arc<dyn Connector>, reconnect_delay: Duration) -> Self {
        Self {
            connector,
            reconnect_delay,
        }
    }

    /// Run until `cancel` fires or the event receiver is dropped.
    pub async fn run(self, events: mpsc::Sender<ChannelEvent>, cancel: CancellationToken) {
        let mut ever_connected = false;
        // Attempts since the last good connection; 0 = initial connect.
        let mut attempt: u32 = 0;

        info!(
            reconnect_delay_ms = self.reconnect_delay.as_millis() as u64,
            "Order channel started"
        );

        loop {
            if attempt > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.reconnect_delay) => {}
                }
                debug!(attempt, "Reconnect attempt");
                if events
                    .send(ChannelEvent::ReconnectAttempt { attempt })
                    .await
                    .is_err()
                {
                    break;
                }
            }

            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.connector.connect() => result,
            };

            let mut link = match connected {
                Ok(link) => link,
                Err(e) => {
                    warn!(attempt, error = %e, "Order channel connect failed");
                    attempt = attempt.saturating_add(1);
                    continue;
                }
            };

            let event = if ever_connected {
                info!(attempts = attempt, "Order channel reconnected");
                ChannelEvent::Reconnected { attempts: attempt }
            } else {
                info!("Order channel connected");
                ChannelEvent::Connected
            };
            ever_connected = true;
            attempt = 0;
            if events.send(event).await.is_err() {
                link.close().await;
                break;
            }

            let outcome = loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => None,
                    next = link.next_event() => Some(next),
                };
                match next {
                    None => break Pump::Cancelled,
                    Some(Ok(Some(order))) => {
                        debug!(order_id = order.id, status = %order.status, "Order pushed");
                        if events.send(ChannelEvent::NewOrder(order)).await.is_err() {
                            break Pump::Cancelled;
                        }
                    }
                    Some(Ok(None)) => break Pump::Lost("closed by server".to_string()),
                    Some(Err(e)) => break Pump::Lost(e.to_string()),
                }
            };

            match outcome {
                Pump::Cancelled => {
                    link.close().await;
                    break;
                }
                Pump::Lost(reason) => {
                    warn!(reason = %reason, "Order channel disconnected");
                    if events
                        .send(ChannelEvent::Disconnected { reason })
                        .await
                        .is_err()
                    {
                        break;
                    }
                    attempt = 1;
                }
            }
        }

        info!("Order channel stopped");
    }
}

//! Connection liveness banner.
//!
//! Projects the streaming channel's connectivity transitions into the three
//! states the viewer can see. There is no terminal failure state: a channel
//! that can never authenticate simply stays `Reconnecting`.

use serde::Serialize;

use crate::channel::ChannelEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Reconnecting,
}

impl ConnectionState {
    pub fn is_live(self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

#[derive(Debug, Clone)]
pub struct LivenessIndicator {
    state: ConnectionState,
    reconnect_attempts: u32,
}

impl Default for LivenessIndicator {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessIndicator {
    /// Starts out `Disconnected` until the first connection succeeds.
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
        }
    }

    /// Fold one channel event into the indicator. Returns `true` when the
    /// visible state changed. Order events are ignored.
    pub fn apply(&mut self, event: &ChannelEvent) -> bool {
        let next = match event {
            ChannelEvent::Connected | ChannelEvent::Reconnected { .. } => {
                self.reconnect_attempts = 0;
                ConnectionState::Connected
            }
            ChannelEvent::Disconnected { .. } => ConnectionState::Disconnected,
            ChannelEvent::ReconnectAttempt { attempt } => {
                self.reconnect_attempts = *attempt;
                ConnectionState::Reconnecting
            }
            ChannelEvent::NewOrder(_) => return false,
        };

        if next == self.state {
            return false;
        }
        self.state = next;
        true
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }

    /// Banner text, or `None` while connected.
    pub fn banner(&self) -> Option<String> {
        match self.state {
            ConnectionState::Connected => None,
            ConnectionState::Disconnected => Some("Connection lost".to_string()),
            ConnectionState::Reconnecting => Some(format!(
                "Reconnecting (attempt {})",
                self.reconnect_attempts
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_disconnected_with_banner() {
        let indicator = LivenessIndicator::new();
        assert_eq!(indicator.state(), ConnectionState::Disconnected);
        assert!(!indicator.is_live());
        assert!(indicator.banner().is_some());
    }

    #[test]
    fn test_liveness_false_between_disconnect_and_reconnect() {
        let mut indicator = LivenessIndicator::new();
        assert!(indicator.apply(&ChannelEvent::Connected));
        assert!(indicator.is_live());
        assert_eq!(indicator.banner(), None);

        let span = [
            ChannelEvent::Disconnected {
                reason: "transport close".into(),
            },
            ChannelEvent::ReconnectAttempt { attempt: 1 },
            ChannelEvent::ReconnectAttempt { attempt: 2 },
            ChannelEvent::ReconnectAttempt { attempt: 3 },
        ];
        for event in &span {
            indicator.apply(event);
            assert!(!indicator.is_live(), "live during {event:?}");
        }
        assert_eq!(
            indicator.banner().as_deref(),
            Some("Reconnecting (attempt 3)")
        );

        assert!(indicator.apply(&ChannelEvent::Reconnected { attempts: 3 }));
        assert!(indicator.is_live());
    }

    #[test]
    fn test_repeated_state_reports_no_change() {
        let mut indicator = LivenessIndicator::new();
        indicator.apply(&ChannelEvent::ReconnectAttempt { attempt: 1 });
        assert!(!indicator.apply(&ChannelEvent::ReconnectAttempt { attempt: 2 }));
        assert_eq!(indicator.state(), ConnectionState::Reconnecting);
    }

    #[test]
    fn test_order_events_do_not_touch_liveness() {
        use crate::order::{Order, OrderStatus};
        use chrono::Utc;
        let mut indicator = LivenessIndicator::new();
        let order = Order {
            id: 1,
            number: "1".into(),
            status: OrderStatus::Payed,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            company_id: None,
            visible: None,
        };
        assert!(!indicator.apply(&ChannelEvent::NewOrder(order)));
        assert_eq!(indicator.state(), ConnectionState::Disconnected);
    }
}

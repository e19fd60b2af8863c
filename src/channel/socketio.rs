//! Socket.IO connector for the order channel.
//!
//! WebSocket transport only; there is no long-polling fallback. A connection
//! counts as established once the `/customerscreen` namespace accepts our
//! credentials. Engine.IO heartbeats are answered here, and a link that goes
//! silent for longer than the server's advertised ping window is treated as
//! broken.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;
use zeroize::Zeroizing;

use super::protocol::{
    message_frame, EnginePacket, OpenHandshake, SocketPacket, SocketPacketKind, NAMESPACE,
    NEW_ORDER_EVENT,
};
use super::{Connector, Link};
use crate::config::{mask_secret, normalize_base_url};
use crate::error::{Result, ScreenError};
use crate::order::{parse_order, Order};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on the WebSocket + namespace handshake, matching the
/// Socket.IO client's default connect timeout.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

/// Build the Engine.IO WebSocket endpoint for a streaming base URL.
///
/// `https://push.example.com/rt` becomes
/// `wss://push.example.com/rt/socket.io/?EIO=4&transport=websocket`.
pub fn endpoint_url(socket_base: &str) -> Result<Url> {
    let mut url = Url::parse(&normalize_base_url(socket_base))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| ScreenError::Config(format!("Cannot use {socket_base} as a socket URL")))?;

    let path = format!("{}/socket.io/", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_query(Some("EIO=4&transport=websocket"));
    Ok(url)
}

pub struct SocketIoConnector {
    endpoint: Url,
    branch_id: String,
    key: Zeroizing<String>,
    handshake_timeout: Duration,
}

impl SocketIoConnector {
    pub fn new(socket_base: &str, branch_id: &str, key: Zeroizing<String>) -> Result<Self> {
        Ok(Self {
            endpoint: endpoint_url(socket_base)?,
            branch_id: branch_id.to_string(),
            key,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        })
    }

    fn auth_payload(&self) -> Value {
        json!({ "branchId": self.branch_id, "key": self.key.as_str() })
    }

    async fn handshake(&self) -> Result<SocketIoLink> {
        let (mut ws, response) = connect_async(self.endpoint.as_str()).await?;
        debug!(status = ?response.status(), "WebSocket handshake complete");

        let open = read_open(&mut ws).await?;
        debug!(
            sid = %open.sid,
            ping_interval_ms = open.ping_interval,
            ping_timeout_ms = open.ping_timeout,
            "Engine.IO session opened"
        );

        let connect = SocketPacket::connect(NAMESPACE, Some(self.auth_payload()));
        ws.send(Message::Text(message_frame(&connect))).await?;

        let mut link = SocketIoLink {
            ws,
            heartbeat: open.heartbeat_window(),
        };
        link.await_namespace_ack().await?;
        Ok(link)
    }
}

#[async_trait]
impl Connector for SocketIoConnector {
    async fn connect(&self) -> Result<Box<dyn Link>> {
        info!(
            endpoint = %self.endpoint,
            branch_id = %self.branch_id,
            key = %mask_secret(&self.key),
            "Connecting order channel"
        );
        let link = timeout(self.handshake_timeout, self.handshake())
            .await
            .map_err(|_| ScreenError::Protocol("socket.io handshake timed out".into()))??;
        Ok(Box::new(link))
    }
}

/// Read WebSocket frames until a text frame arrives. Control frames are
/// handled in place; `None` means the peer closed.
async fn next_text(ws: &mut WsStream) -> Result<Option<String>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(Some(text)),
            Some(Ok(Message::Ping(data))) => ws.send(Message::Pong(data)).await?,
            Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
            Some(Ok(Message::Binary(data))) => {
                debug!(len = data.len(), "Ignoring binary frame on order channel");
            }
            Some(Ok(Message::Close(frame))) => {
                debug!(?frame, "Order channel received close frame");
                return Ok(None);
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(None),
        }
    }
}

async fn read_open(ws: &mut WsStream) -> Result<OpenHandshake> {
    loop {
        let frame = next_text(ws).await?.ok_or(ScreenError::ConnectionClosed)?;
        match EnginePacket::decode(&frame)? {
            EnginePacket::Open(open) => return Ok(open),
            EnginePacket::Noop => continue,
            other => {
                return Err(ScreenError::Protocol(format!(
                    "expected engine.io open packet, got {other:?}"
                )))
            }
        }
    }
}

pub struct SocketIoLink {
    ws: WsStream,
    heartbeat: Duration,
}

impl SocketIoLink {
    /// Next Socket.IO packet on our namespace, answering pings on the way.
    async fn next_packet(&mut self) -> Result<Option<SocketPacket>> {
        let heartbeat = self.heartbeat;
        loop {
            let frame = timeout(heartbeat, next_text(&mut self.ws))
                .await
                .map_err(|_| {
                    ScreenError::Protocol(format!(
                        "no heartbeat within {} ms",
                        heartbeat.as_millis()
                    ))
                })??;
            let Some(frame) = frame else {
                return Ok(None);
            };

            let body = match EnginePacket::decode(&frame) {
                Ok(EnginePacket::Ping(data)) => {
                    self.ws
                        .send(Message::Text(EnginePacket::Pong(data).encode()))
                        .await?;
                    continue;
                }
                Ok(EnginePacket::Close) => return Ok(None),
                Ok(EnginePacket::Message(body)) => body,
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "Dropping malformed engine.io frame");
                    continue;
                }
            };

            match SocketPacket::decode(&body) {
                Ok(packet) if packet.namespace == NAMESPACE => return Ok(Some(packet)),
                Ok(packet) => debug!(namespace = %packet.namespace, "Ignoring foreign namespace"),
                Err(e) => warn!(error = %e, "Dropping malformed socket.io packet"),
            }
        }
    }

    async fn await_namespace_ack(&mut self) -> Result<()> {
        loop {
            let packet = self
                .next_packet()
                .await?
                .ok_or(ScreenError::ConnectionClosed)?;
            match packet.kind {
                SocketPacketKind::Connect => return Ok(()),
                SocketPacketKind::ConnectError => {
                    return Err(ScreenError::AuthRejected(packet.error_message()))
                }
                kind => debug!(?kind, "Ignoring packet before namespace ack"),
            }
        }
    }
}

#[async_trait]
impl Link for SocketIoLink {
    async fn next_event(&mut self) -> Result<Option<Order>> {
        loop {
            let Some(packet) = self.next_packet().await? else {
                return Ok(None);
            };
            match packet.kind {
                SocketPacketKind::Event => {
                    let Some((name, args)) = packet.event() else {
                        warn!("Dropping event packet without a name");
                        continue;
                    };
                    if name != NEW_ORDER_EVENT {
                        debug!(event = name, "Ignoring unsubscribed event");
                        continue;
                    }
                    match args.first().cloned().map(parse_order) {
                        Some(Ok(order)) => return Ok(Some(order)),
                        Some(Err(e)) => warn!(error = %e, "Dropping malformed newOrder payload"),
                        None => warn!("Dropping newOrder event without payload"),
                    }
                }
                SocketPacketKind::Disconnect => return Ok(None),
                SocketPacketKind::ConnectError => {
                    return Err(ScreenError::AuthRejected(packet.error_message()))
                }
                kind => debug!(?kind, "Ignoring socket.io packet"),
            }
        }
    }

    async fn close(&mut self) {
        let leave = message_frame(&SocketPacket::disconnect(NAMESPACE));
        if let Err(e) = self.ws.send(Message::Text(leave)).await {
            debug!(error = %e, "Namespace disconnect not sent");
        }
        let _ = self.ws.close(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    const OPEN: &str = r#"0{"sid":"s1","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#;

    fn order_payload(id: i64) -> String {
        format!(
            r#"{{"id":{id},"number":"{id}","status":"PAYED","createdAt":"2026-10-16T12:00:00Z","updatedAt":"2026-10-16T12:00:00Z"}}"#
        )
    }

    async fn next_server_text(ws: &mut WebSocketStream<TcpStream>) -> String {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return text,
                _ => continue,
            }
        }
    }

    #[test]
    fn test_endpoint_url_maps_http_schemes_to_websocket() {
        let url = endpoint_url("https://push.example.com/rt/").unwrap();
        assert_eq!(
            url.as_str(),
            "wss://push.example.com/rt/socket.io/?EIO=4&transport=websocket"
        );

        let url = endpoint_url("localhost:3001").unwrap();
        assert_eq!(
            url.as_str(),
            "ws://localhost:3001/socket.io/?EIO=4&transport=websocket"
        );
    }

    #[test]
    fn test_auth_payload_has_branch_and_key() {
        let connector =
            SocketIoConnector::new("http://localhost:3001", "12", Zeroizing::new("k".into()))
                .unwrap();
        assert_eq!(
            connector.auth_payload(),
            json!({ "branchId": "12", "key": "k" })
        );
    }

    #[tokio::test]
    async fn test_link_authenticates_answers_pings_and_yields_orders() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Text(OPEN.into())).await.unwrap();

            let connect = next_server_text(&mut ws).await;
            let prefix = "40/customerscreen,";
            assert!(connect.starts_with(prefix), "unexpected connect: {connect}");
            let auth: Value = serde_json::from_str(&connect[prefix.len()..]).unwrap();
            ws.send(Message::Text(r#"40/customerscreen,{"sid":"n1"}"#.into()))
                .await
                .unwrap();

            ws.send(Message::Text("2".into())).await.unwrap();
            let pong = next_server_text(&mut ws).await;

            let first = format!(r#"42/customerscreen,["newOrder",{}]"#, order_payload(1));
            ws.send(Message::Text(first)).await.unwrap();
            ws.send(Message::Text(r#"42/customerscreen,["newOrder",{"id":"bad"}]"#.into()))
                .await
                .unwrap();
            ws.send(Message::Text(r#"42/customerscreen,["somethingElse",{}]"#.into()))
                .await
                .unwrap();
            let second = format!(r#"42/customerscreen,["newOrder",{}]"#, order_payload(2));
            ws.send(Message::Text(second)).await.unwrap();
            ws.close(None).await.unwrap();
            (auth, pong)
        });

        let connector = SocketIoConnector::new(
            &format!("http://{addr}"),
            "12",
            Zeroizing::new("secret".into()),
        )
        .unwrap();
        let mut link = connector.connect().await.unwrap();

        let first = link.next_event().await.unwrap().unwrap();
        assert_eq!(first.id, 1);
        let second = link.next_event().await.unwrap().unwrap();
        assert_eq!(second.id, 2);
        assert!(link.next_event().await.unwrap().is_none());

        let (auth, pong) = server.await.unwrap();
        assert_eq!(auth, json!({ "branchId": "12", "key": "secret" }));
        assert_eq!(pong, "3");
    }

    #[tokio::test]
    async fn test_rejected_credentials_fail_the_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Text(OPEN.into())).await.unwrap();
            let _connect = next_server_text(&mut ws).await;
            ws.send(Message::Text(
                r#"44/customerscreen,{"message":"invalid key"}"#.into(),
            ))
            .await
            .unwrap();
            // Keep the socket open until the client gives up on it.
            let _ = ws.next().await;
        });

        let connector = SocketIoConnector::new(
            &format!("http://{addr}"),
            "12",
            Zeroizing::new("wrong".into()),
        )
        .unwrap();
        match connector.connect().await {
            Err(ScreenError::AuthRejected(message)) => assert_eq!(message, "invalid key"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("connect should have been rejected"),
        }
    }
}

//! Text-frame pipes to relays.
//!
//! A transport turns an address into a pair of channels. Connections only see
//! those channels, so the same connection code runs over a real WebSocket or
//! over an in-memory peer.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::error::{ClientError, Result};
use crate::lock;

/// Something that arrived from the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Text(String),
    /// The pipe is gone. Carries the close code when the relay sent one.
    Closed(Option<u16>),
}

/// Both directions of an open relay session.
///
/// Dropping `outbound` closes the session.
#[derive(Debug)]
pub struct TransportChannels {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn open(&self, address: &str, connect_timeout: Duration) -> Result<TransportChannels>;
}

/// WebSocket transport over tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

#[async_trait]
impl RelayTransport for WebSocketTransport {
    async fn open(&self, address: &str, connect_timeout: Duration) -> Result<TransportChannels> {
        let url = Url::parse(address)?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                url.scheme()
            )));
        }

        let (stream, _response) = timeout(connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                ClientError::Timeout(format!("connection timeout after {connect_timeout:?}"))
            })?
            .map_err(|error| ClientError::WebSocket(error.to_string()))?;

        let (mut writer, mut reader) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let relay = address.to_string();
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(error) = writer.send(Message::Text(text.into())).await {
                    warn!(relay = %relay, %error, "websocket write error");
                    break;
                }
            }
            let _ = writer.send(Message::Close(None)).await;
        });

        let relay = address.to_string();
        tokio::spawn(async move {
            let mut code = None;
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if inbound_tx
                            .send(TransportEvent::Text(text.to_string()))
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        debug!(relay = %relay, bytes = payload.len(), "received ping");
                    }
                    Ok(Message::Close(frame)) => {
                        code = frame.map(|frame| u16::from(frame.code));
                        break;
                    }
                    Ok(Message::Pong(_) | Message::Binary(_) | Message::Frame(_)) => {}
                    Err(error) => {
                        warn!(relay = %relay, %error, "websocket read error");
                        break;
                    }
                }
            }
            let _ = inbound_tx.send(TransportEvent::Closed(code));
        });

        Ok(TransportChannels {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Relay end of an in-memory session opened through [`ChannelTransport`].
#[derive(Debug)]
pub struct ChannelPeer {
    pub address: String,
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<TransportEvent>,
}

impl ChannelPeer {
    /// Next frame written by the client. `None` once the client hung up.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Next client frame that parses as JSON.
    pub async fn recv_json(&mut self) -> Option<Value> {
        while let Some(text) = self.recv().await {
            match serde_json::from_str(&text) {
                Ok(value) => return Some(value),
                Err(error) => debug!(address = %self.address, %error, "dropping non-JSON frame"),
            }
        }
        None
    }

    pub fn send(&self, text: impl Into<String>) -> bool {
        self.to_client
            .send(TransportEvent::Text(text.into()))
            .is_ok()
    }

    pub fn send_json(&self, value: &Value) -> bool {
        self.send(value.to_string())
    }

    /// Drop the session from the relay side.
    pub fn close(&self, code: Option<u16>) {
        let _ = self.to_client.send(TransportEvent::Closed(code));
    }
}

/// In-memory transport. Every `open` hands a [`ChannelPeer`] to whoever holds
/// the receiver returned by [`ChannelTransport::new`].
#[derive(Debug)]
pub struct ChannelTransport {
    peers: mpsc::UnboundedSender<ChannelPeer>,
    refused: std::sync::Mutex<HashSet<String>>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChannelPeer>) {
        let (peers, accepted) = mpsc::unbounded_channel();
        (
            Self {
                peers,
                refused: std::sync::Mutex::new(HashSet::new()),
            },
            accepted,
        )
    }

    /// Make `open` fail for this address until [`allow`](Self::allow) is called.
    pub fn refuse(&self, address: &str) {
        lock(&self.refused).insert(address.to_string());
    }

    pub fn allow(&self, address: &str) {
        lock(&self.refused).remove(address);
    }
}

#[async_trait]
impl RelayTransport for ChannelTransport {
    async fn open(&self, address: &str, _connect_timeout: Duration) -> Result<TransportChannels> {
        if lock(&self.refused).contains(address) {
            return Err(ClientError::Connection(format!(
                "connection refused: {address}"
            )));
        }

        let (outbound_tx, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound_rx) = mpsc::unbounded_channel();
        let peer = ChannelPeer {
            address: address.to_string(),
            from_client,
            to_client,
        };
        self.peers
            .send(peer)
            .map_err(|_| ClientError::Connection(format!("no relay listening on {address}")))?;

        Ok(TransportChannels {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_transport_pairs_client_and_peer() -> Result<()> {
        let (transport, mut accepted) = ChannelTransport::new();
        let mut channels = transport
            .open("ws://relay.test/", Duration::from_secs(1))
            .await?;
        let mut peer = accepted
            .recv()
            .await
            .ok_or_else(|| ClientError::Internal("no peer".to_string()))?;
        assert_eq!(peer.address, "ws://relay.test/");

        channels
            .outbound
            .send(r#"["CLOSE","sub"]"#.to_string())
            .map_err(|e| ClientError::Internal(e.to_string()))?;
        assert_eq!(peer.recv().await.as_deref(), Some(r#"["CLOSE","sub"]"#));

        assert!(peer.send(r#"["EOSE","sub"]"#));
        peer.close(Some(1000));
        assert_eq!(
            channels.inbound.recv().await,
            Some(TransportEvent::Text(r#"["EOSE","sub"]"#.to_string()))
        );
        assert_eq!(
            channels.inbound.recv().await,
            Some(TransportEvent::Closed(Some(1000)))
        );
        Ok(())
    }

    #[tokio::test]
    async fn refused_addresses_fail_to_open() {
        let (transport, _accepted) = ChannelTransport::new();
        transport.refuse("ws://down.test/");
        let result = transport
            .open("ws://down.test/", Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(ClientError::Connection(_))));

        transport.allow("ws://down.test/");
        assert!(
            transport
                .open("ws://down.test/", Duration::from_secs(1))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn websocket_transport_rejects_non_ws_scheme() {
        let result = WebSocketTransport
            .open("https://relay.test/", Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(ClientError::InvalidUrl(_))));
    }
}

//! Transport seam between the pool and a relay.
//!
//! A [`RelayLink`] is a pair of channels: the pool pushes [`ClientMessage`]s
//! into `outbound` and reads parsed [`RelayMessage`]s from `inbound`. The
//! link is closed when `inbound` yields `None`; dropping `outbound` asks the
//! transport to close the connection.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::message::{ClientMessage, RelayMessage};
use crate::{PoolError, RelayUrl};

pub struct RelayLink {
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
    pub inbound: mpsc::UnboundedReceiver<RelayMessage>,
}

#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Open a link to `url`. The pool bounds this call with its own timeout.
    async fn open(&self, url: &RelayUrl) -> Result<RelayLink, PoolError>;
}

/// WebSocket transport over tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

#[async_trait]
impl RelayTransport for WebSocketTransport {
    async fn open(&self, url: &RelayUrl) -> Result<RelayLink, PoolError> {
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| PoolError::WebSocket(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let (outbound, mut outgoing) = mpsc::unbounded_channel::<ClientMessage>();
        let (incoming, inbound) = mpsc::unbounded_channel::<RelayMessage>();
        let relay = url.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = outgoing.recv() => {
                        let Some(message) = message else {
                            let _ = sink.close().await;
                            break;
                        };
                        let json = match message.to_json() {
                            Ok(json) => json,
                            Err(e) => {
                                warn!(relay = %relay, "Failed to encode frame: {}", e);
                                continue;
                            }
                        };
                        debug!(relay = %relay, frame = %json, "Sending frame");
                        if let Err(e) = sink.send(Message::text(json)).await {
                            warn!(relay = %relay, "WebSocket send failed: {}", e);
                            break;
                        }
                    }
                    frame = source.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            match RelayMessage::from_json(text.as_str()) {
                                Ok(message) => {
                                    if incoming.send(message).is_err() {
                                        break;
                                    }
                                }
                                Err(e) => debug!(relay = %relay, "Skipping unparseable frame: {}", e),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(relay = %relay, "WebSocket read failed: {}", e);
                            break;
                        }
                    }
                }
            }
            debug!(relay = %relay, "WebSocket link closed");
        });

        Ok(RelayLink { outbound, inbound })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn test_relay_ping_is_answered_once_and_frames_flow() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let relay = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Ping(b"hi".to_vec().into())).await.unwrap();
            let reply = ws.next().await.unwrap().unwrap();
            ws.send(Message::text(r#"["EOSE","feed"]"#)).await.unwrap();
            let next = ws.next().await.unwrap().unwrap();
            (reply, next)
        });

        let url = RelayUrl::parse(&format!("ws://{}", addr)).unwrap();
        let mut link = WebSocketTransport.open(&url).await.unwrap();

        let message = timeout(Duration::from_secs(2), link.inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            message,
            RelayMessage::Eose {
                subscription_id: "feed".to_string()
            }
        );

        link.outbound
            .send(ClientMessage::Close {
                subscription_id: "feed".to_string(),
            })
            .unwrap();
        let (reply, next) = timeout(Duration::from_secs(2), relay)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, Message::Pong(b"hi".to_vec().into()));
        // The frame after the pong is the CLOSE, not a second pong.
        assert_eq!(next, Message::text(r#"["CLOSE","feed"]"#));
    }
}

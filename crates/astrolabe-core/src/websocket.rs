//! WebSocket implementation of the transport seam

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tracing::{debug, warn};
use url::Url;

use crate::error::TransportError;
use crate::protocol::ABNORMAL_CLOSURE;
use crate::transport::{Connection, Connector, OutboundFrame, TransportEvent};

/// Close code for a close frame that carried no status
const NO_STATUS_RECEIVED: u16 = 1005;

#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

/// `wss` handshakes need a process-wide rustls provider. One installed by
/// the host application takes precedence.
fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<Connection, TransportError> {
        if url.scheme() == "wss" {
            install_crypto_provider();
        }
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        debug!(%url, "websocket open");

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<TransportEvent>();

        // Writer: forwards frames until told to close or the client lets go
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                match frame {
                    OutboundFrame::Text(text) => {
                        if let Err(e) = ws_tx.send(Message::text(text)).await {
                            warn!("websocket send failed: {}", e);
                            return;
                        }
                    }
                    OutboundFrame::Close(code) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: Utf8Bytes::from_static(""),
                        };
                        let _ = ws_tx.send(Message::Close(Some(frame))).await;
                        let _ = ws_tx.close().await;
                        return;
                    }
                }
            }
            let _ = ws_tx.close().await;
        });

        // Reader: text frames in order, then exactly one Closed
        tokio::spawn(async move {
            loop {
                match ws_rx.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let event = TransportEvent::Frame(text.as_str().to_owned());
                        if inbound_tx.send(event).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame
                            .map(|f| u16::from(f.code))
                            .unwrap_or(NO_STATUS_RECEIVED);
                        debug!(code, "websocket closed by peer");
                        let _ = inbound_tx.send(TransportEvent::Closed { code });
                        // Keep polling so the close reply is flushed
                        while let Some(Ok(_)) = ws_rx.next().await {}
                        return;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("websocket read failed: {}", e);
                        break;
                    }
                    None => break,
                }
            }
            let _ = inbound_tx.send(TransportEvent::Closed {
                code: ABNORMAL_CLOSURE,
            });
        });

        Ok(Connection::new(outbound_tx, inbound_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn local_url(listener: &TcpListener) -> Url {
        let addr = listener.local_addr().unwrap();
        Url::parse(&format!("ws://{}/api/v1/ai/interpret", addr)).unwrap()
    }

    #[tokio::test]
    async fn test_frames_and_close_code() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = local_url(&listener).await;

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::text(
                r#"{"type":"connected","data":{"session_id":"abc"}}"#,
            ))
            .await
            .unwrap();

            let received = loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => break text.as_str().to_owned(),
                    Some(Ok(_)) => continue,
                    other => panic!("unexpected frame: {:?}", other),
                }
            };

            ws.close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: Utf8Bytes::from_static("bye"),
            }))
            .await
            .unwrap();
            // Drain until the client acknowledges the close
            while let Some(Ok(_)) = ws.next().await {}
            received
        });

        let mut connection = WebSocketConnector::new().connect(&url).await.unwrap();
        assert_eq!(
            connection.inbound.recv().await,
            Some(TransportEvent::Frame(
                r#"{"type":"connected","data":{"session_id":"abc"}}"#.to_string()
            ))
        );

        connection
            .outbound
            .send(OutboundFrame::Text(r#"{"type":"ping","data":{}}"#.to_string()))
            .unwrap();
        assert_eq!(
            connection.inbound.recv().await,
            Some(TransportEvent::Closed { code: 1000 })
        );
        assert_eq!(server.await.unwrap(), r#"{"type":"ping","data":{}}"#);
    }

    #[tokio::test]
    async fn test_client_close_sends_code() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = local_url(&listener).await;

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|f| u16::from(f.code));
                    }
                    Some(Ok(_)) => continue,
                    _ => break None,
                }
            }
        });

        let connection = WebSocketConnector::new().connect(&url).await.unwrap();
        connection.outbound.send(OutboundFrame::Close(1000)).unwrap();
        assert_eq!(server.await.unwrap(), Some(1000));
    }

    #[tokio::test]
    async fn test_wss_attempts_tls_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = Url::parse(&format!("wss://{}/api/v1/ai/interpret", addr)).unwrap();

        // A plain TCP peer that hangs up instead of speaking TLS
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            drop(tcp);
        });

        let result = WebSocketConnector::new().connect(&url).await;
        server.await.unwrap();
        match result {
            Err(TransportError::Connect { reason, .. }) => {
                assert!(!reason.contains("TLS support not compiled in"), "{}", reason);
            }
            Ok(_) => panic!("handshake against a plain TCP peer succeeded"),
        }
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = local_url(&listener).await;
        drop(listener);

        let result = WebSocketConnector::new().connect(&url).await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }
}

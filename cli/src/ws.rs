//! Websocket connector for talking to a gateway.

use async_trait::async_trait;
use duplex_handshake::transport::pair;
use duplex_handshake::{Channel, ConnectRequest, Connector, Frame, HandshakeInfo, TransportError};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Opens a websocket per connection and bridges it onto a channel pair.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Channel, TransportError> {
        let url = request.to_url();
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (local, remote) = pair(HandshakeInfo::new(None, request.query));
        let (handle, mut inbound, _) = remote.into_parts();
        let (mut sink, mut stream) = socket.split();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = inbound.recv() => {
                        let Some(frame) = frame else {
                            break;
                        };
                        let Ok(text) = frame.encode() else {
                            continue;
                        };
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    message = stream.next() => match message {
                        Some(Ok(Message::Text(text))) => match Frame::decode(&text) {
                            Ok(frame) => {
                                if handle.send(frame).is_err() {
                                    break;
                                }
                            }
                            Err(e) => debug!("Dropping frame from gateway: {}", e),
                        },
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    },
                }
            }
            handle.disconnect();
            let _ = sink.send(Message::Close(None)).await;
        });

        debug!(url = %request.url, "Websocket connected");
        Ok(local)
    }
}

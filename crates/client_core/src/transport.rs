use std::collections::HashMap;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::{
    error::{ClientError, ClientResult},
    stomp::{StompCommand, StompFrame},
};

pub struct PushLink {
    pub outbound: mpsc::UnboundedSender<StompFrame>,
    pub inbound: mpsc::UnboundedReceiver<StompFrame>,
}

#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn open(&self, url: &str, headers: &HashMap<String, String>) -> ClientResult<PushLink>;
}

pub struct WsConnector;

#[async_trait]
impl PushConnector for WsConnector {
    async fn open(&self, url: &str, headers: &HashMap<String, String>) -> ClientResult<PushLink> {
        let host = url::Url::parse(url)
            .map_err(|err| ClientError::protocol(format!("invalid push url {url}: {err}")))?
            .host_str()
            .unwrap_or("localhost")
            .to_string();

        let (ws_stream, _) = connect_async(url).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        ws_writer
            .send(Message::Text(StompFrame::connect(&host, headers).encode()))
            .await?;

        loop {
            let Some(message) = ws_reader.next().await else {
                return Err(ClientError::network("push connection closed during handshake"));
            };
            let text = match message? {
                Message::Text(text) => text,
                Message::Close(_) => {
                    return Err(ClientError::network("push connection closed during handshake"))
                }
                _ => continue,
            };
            let Some(frame) = StompFrame::decode(&text)
                .map_err(|err| ClientError::protocol(err.to_string()))?
            else {
                continue;
            };
            match frame.command {
                StompCommand::Connected => break,
                StompCommand::Error if frame.is_auth_failure() => {
                    return Err(ClientError::Auth {
                        message: frame.header("message").unwrap_or("rejected").to_string(),
                    })
                }
                other => {
                    return Err(ClientError::protocol(format!(
                        "expected CONNECTED, got {other}: {}",
                        frame.header("message").unwrap_or_default()
                    )))
                }
            }
        }

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<StompFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(err) = ws_writer.send(Message::Text(frame.encode())).await {
                    warn!("push: websocket send failed: {err}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = ws_reader.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        warn!("push: websocket receive failed: {err}");
                        break;
                    }
                };
                match StompFrame::decode(&text) {
                    Ok(Some(frame)) => {
                        if inbound_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Ok(None) => debug!("push: heart-beat"),
                    Err(err) => warn!("push: dropping undecodable frame: {err}"),
                }
            }
        });

        Ok(PushLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;

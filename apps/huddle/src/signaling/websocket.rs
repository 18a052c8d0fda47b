use super::{SignalingConnector, SignalingError, SignalingLink};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use huddle_proto::{ClientEvent, ServerEvent};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Speaks the JSON event protocol over a WebSocket.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<SignalingLink, SignalingError> {
        let websocket_url = derive_websocket_url(url)?;
        let (ws_stream, _) = connect_async(websocket_url.as_str())
            .await
            .map_err(|err| SignalingError::Connect(format!("websocket connect failed: {err}")))?;
        tracing::debug!(
            target = "huddle::signaling",
            url = %websocket_url,
            "signaling websocket connected"
        );
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerEvent>();

        let writer = tokio::spawn(async move {
            while let Some(event) = outbound_rx.recv().await {
                let text = match event.to_text() {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(target = "huddle::signaling", error = %err, "failed to encode event");
                        continue;
                    }
                };
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(message) = ws_read.next().await {
                match message {
                    Ok(Message::Text(text)) => match ServerEvent::from_text(&text) {
                        Ok(event) => {
                            if inbound_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            tracing::debug!(
                                target = "huddle::signaling",
                                error = %err,
                                payload = %text,
                                "ignoring unrecognised signaling frame"
                            );
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        tracing::debug!(target = "huddle::signaling", ?frame, "server closed signaling socket");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(target = "huddle::signaling", error = %err, "signaling socket error");
                        break;
                    }
                }
            }
        });

        Ok(SignalingLink::new(outbound_tx, inbound_rx).with_tasks(vec![writer, reader]))
    }
}

/// Maps `http(s)` base URLs onto `ws(s)`; `ws(s)` URLs pass through.
pub fn derive_websocket_url(signaling_url: &str) -> Result<Url, SignalingError> {
    let mut url = Url::parse(signaling_url)
        .map_err(|err| SignalingError::InvalidUrl(format!("{signaling_url}: {err}")))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(SignalingError::InvalidUrl(format!(
                "unsupported scheme {other} in {signaling_url}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::InvalidUrl(format!("cannot use scheme {scheme}")))?;
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_http_schemes() {
        assert_eq!(
            derive_websocket_url("https://signal.example.com/rooms").unwrap().as_str(),
            "wss://signal.example.com/rooms"
        );
        assert_eq!(
            derive_websocket_url("http://127.0.0.1:9000").unwrap().as_str(),
            "ws://127.0.0.1:9000/"
        );
        assert_eq!(
            derive_websocket_url("ws://localhost:1/x#frag").unwrap().as_str(),
            "ws://localhost:1/x"
        );
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(matches!(
            derive_websocket_url("ftp://example.com"),
            Err(SignalingError::InvalidUrl(_))
        ));
        assert!(matches!(derive_websocket_url("not a url"), Err(SignalingError::InvalidUrl(_))));
    }
}

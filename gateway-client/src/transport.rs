//! Socket factory seam.
//!
//! The connection task never builds sockets itself; it asks a [`Connector`]
//! for a [`Transport`], which is just a pair of channels. The WebSocket
//! implementation pumps those channels from two small tasks; tests hand in
//! channels they drive directly.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};

/// Close code reported when the stream ends without a close frame.
pub const ABNORMAL_CLOSE: u16 = 1006;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Closed { code: u16, reason: String },
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close,
}

pub struct Transport {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
    reader: Option<JoinHandle<()>>,
}

impl Transport {
    pub fn new(
        outbound: mpsc::UnboundedSender<Outbound>,
        inbound: mpsc::UnboundedReceiver<Inbound>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            reader: None,
        }
    }

    fn with_reader(mut self, reader: JoinHandle<()>) -> Self {
        self.reader = Some(reader);
        self
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, config: &GatewayConfig) -> GatewayResult<Transport>;
}

/// WebSocket connector backed by `tokio-tungstenite`.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, config: &GatewayConfig) -> GatewayResult<Transport> {
        let endpoint = config.endpoint().ok_or(GatewayError::NotConfigured)?;
        let url = Url::parse(endpoint).map_err(|err| {
            GatewayError::Transport(format!("invalid gateway url {endpoint}: {err}"))
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(GatewayError::Transport(format!(
                "unsupported gateway url scheme '{}'",
                url.scheme()
            )));
        }

        let mut request = url.as_str().into_client_request().map_err(transport_err)?;
        {
            let headers = request.headers_mut();
            if let Some(protocol) = config.subprotocol.as_deref() {
                headers.insert(header::SEC_WEBSOCKET_PROTOCOL, header_value(protocol)?);
            }
            if let Some(origin) = config.origin.as_deref() {
                headers.insert(header::ORIGIN, header_value(origin)?);
            }
            for (name, value) in &config.headers {
                let name = HeaderName::from_bytes(name.as_bytes()).map_err(transport_err)?;
                headers.insert(name, header_value(value)?);
            }
        }

        let (stream, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(transport_err)?;
        debug!(status = %response.status(), "gateway socket open");

        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Inbound>();

        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                match message {
                    Outbound::Text(text) => {
                        if let Err(err) = sink.send(Message::Text(text.into())).await {
                            warn!("gateway write failed: {}", err);
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            let _ = sink.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(item) = source.next().await {
                let inbound = match item {
                    Ok(Message::Text(text)) => Inbound::Text(text.to_string()),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => Inbound::Text(text),
                        Err(_) => {
                            debug!("dropping non-utf8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((1005, String::new()));
                        let _ = in_tx.send(Inbound::Closed { code, reason });
                        return;
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        let _ = in_tx.send(Inbound::Error(err.to_string()));
                        return;
                    }
                };
                if in_tx.send(inbound).is_err() {
                    return;
                }
            }
            let _ = in_tx.send(Inbound::Closed {
                code: ABNORMAL_CLOSE,
                reason: "stream ended".to_string(),
            });
        });

        Ok(Transport::new(out_tx, in_rx).with_reader(reader))
    }
}

fn header_value(value: &str) -> GatewayResult<HeaderValue> {
    HeaderValue::from_str(value).map_err(transport_err)
}

fn transport_err(err: impl std::fmt::Display) -> GatewayError {
    GatewayError::Transport(err.to_string())
}

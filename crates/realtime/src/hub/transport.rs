//! Hub transports
//!
//! A transport opens one physical link and hands back a pair of frame
//! channels. Dropping the outbound sender closes the link; the inbound
//! receiver ends when the link goes away for any reason.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::protocol::{handshake_request, parse_handshake_response, FrameDecoder, HubFrame};
use super::{HubError, HubResult};

/// How often the client pings an idle link
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Limit for opening the socket and completing the hub handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// A link with no inbound traffic for this long is considered dead
///
/// The server pings every 15 seconds, so a healthy link is never this quiet.
pub const SERVER_TIMEOUT: Duration = Duration::from_secs(30);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An open link to the hub, already past the handshake
#[derive(Debug)]
pub struct HubLink {
    pub outbound: mpsc::UnboundedSender<HubFrame>,
    pub inbound: mpsc::UnboundedReceiver<HubFrame>,
}

impl HubLink {
    /// Build a link from channel halves; used by in-memory transports
    pub fn new(
        outbound: mpsc::UnboundedSender<HubFrame>,
        inbound: mpsc::UnboundedReceiver<HubFrame>,
    ) -> Self {
        Self { outbound, inbound }
    }
}

/// Opens physical links to the hub
#[async_trait]
pub trait HubTransport: Send + Sync + 'static {
    async fn connect(&self, url: &Url) -> HubResult<HubLink>;
}

/// WebSocket transport speaking the JSON hub protocol
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    access_token: Option<String>,
    handshake_timeout: Duration,
    server_timeout: Duration,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(None)
    }
}

impl WebSocketTransport {
    pub fn new(access_token: Option<String>) -> Self {
        Self {
            access_token,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            server_timeout: SERVER_TIMEOUT,
        }
    }

    /// Override the handshake and idle-read deadlines
    pub fn with_timeouts(mut self, handshake: Duration, server: Duration) -> Self {
        self.handshake_timeout = handshake;
        self.server_timeout = server;
        self
    }

    /// Map the hub's http(s) URL onto ws(s) and attach the access token
    pub fn socket_url(&self, url: &Url) -> HubResult<Url> {
        let mut socket_url = url.clone();
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(HubError::Connect(format!("unsupported hub scheme '{}'", other)));
            }
        };
        socket_url
            .set_scheme(scheme)
            .map_err(|_| HubError::Connect(format!("cannot use scheme '{}'", scheme)))?;

        if let Some(token) = &self.access_token {
            socket_url
                .query_pairs_mut()
                .append_pair("access_token", token);
        }
        Ok(socket_url)
    }
}

/// Open the socket and complete the handshake
///
/// Returns the split socket, the decoder state and any records that arrived
/// right behind the handshake reply.
async fn open_socket(
    socket_url: &Url,
) -> HubResult<(SplitSink<Socket, Message>, SplitStream<Socket>, FrameDecoder, Vec<String>)> {
    let (ws_stream, _) = connect_async(socket_url.as_str())
        .await
        .map_err(|e| HubError::Connect(e.to_string()))?;
    let (mut sink, mut stream) = ws_stream.split();

    sink.send(Message::Text(handshake_request()))
        .await
        .map_err(|e| HubError::Connect(e.to_string()))?;

    // The first record is the handshake reply; anything after it is a frame
    let mut decoder = FrameDecoder::new();
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                let mut records = decoder.push(&text);
                if records.is_empty() {
                    continue;
                }
                let reply = records.remove(0);
                parse_handshake_response(&reply).map_err(|e| match e {
                    HubError::Connect(message) => HubError::Connect(message),
                    other => HubError::Connect(format!("bad handshake reply: {}", other)),
                })?;
                return Ok((sink, stream, decoder, records));
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(HubError::Connect(
                    "connection closed during handshake".to_string(),
                ));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(HubError::Connect(e.to_string())),
        }
    }
}

#[async_trait]
impl HubTransport for WebSocketTransport {
    async fn connect(&self, url: &Url) -> HubResult<HubLink> {
        let socket_url = self.socket_url(url)?;

        let (mut sink, mut stream, mut decoder, early_records) =
            tokio::time::timeout(self.handshake_timeout, open_socket(&socket_url))
                .await
                .map_err(|_| {
                    HubError::Connect(format!(
                        "hub handshake timed out after {:?}",
                        self.handshake_timeout
                    ))
                })??;

        tracing::debug!(url = %url, "Hub handshake complete");

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<HubFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<HubFrame>();

        for record in early_records {
            if let Ok(Some(frame)) = HubFrame::decode(&record) {
                let _ = inbound_tx.send(frame);
            }
        }

        let hub_url = url.clone();
        let server_timeout = self.server_timeout;
        tokio::spawn(async move {
            let mut keep_alive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
            keep_alive.tick().await;
            let mut last_inbound = Instant::now();

            'pump: loop {
                tokio::select! {
                    frame = outbound_rx.recv() => {
                        let Some(frame) = frame else {
                            // Owner dropped the link
                            let _ = sink.close().await;
                            break;
                        };
                        let text = match frame.encode() {
                            Ok(text) => text,
                            Err(e) => {
                                tracing::warn!(error = %e, "Failed to encode hub frame");
                                continue;
                            }
                        };
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    _ = keep_alive.tick() => {
                        if let Ok(text) = HubFrame::Ping.encode() {
                            if sink.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                    }
                    _ = tokio::time::sleep_until(last_inbound + server_timeout) => {
                        tracing::warn!(
                            url = %hub_url,
                            timeout_ms = server_timeout.as_millis() as u64,
                            "Hub went silent - dropping link"
                        );
                        break;
                    }
                    message = stream.next() => {
                        last_inbound = Instant::now();
                        match message {
                            Some(Ok(Message::Text(text))) => {
                                for record in decoder.push(&text) {
                                    match HubFrame::decode(&record) {
                                        Ok(Some(frame)) => {
                                            if inbound_tx.send(frame).is_err() {
                                                break 'pump;
                                            }
                                        }
                                        Ok(None) => {}
                                        Err(e) => {
                                            tracing::warn!(error = %e, "Dropping malformed hub frame");
                                        }
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Err(e)) => {
                                tracing::warn!(error = %e, "Hub socket error");
                                break;
                            }
                            Some(Ok(_)) => {}
                        }
                    }
                }
            }

            tracing::debug!(url = %hub_url, "Hub socket closed");
        });

        Ok(HubLink::new(outbound_tx, inbound_rx))
    }
}

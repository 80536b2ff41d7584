//! Websocket connection to the live-event endpoint.
//!
//! The driver task owns the stream for its whole life: it dials with an
//! endless 5 s retry, forwards text payloads to a bounded channel, writes
//! queued outgoing frames, and pings at the negotiated interval. Any read
//! or write failure tears the stream down and reconnects; the consumer only
//! ever sees a pause in messages.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::ClientRequestBuilder, http::Uri, Bytes, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{error, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(15);
const MESSAGE_BUFFER: usize = 16;

/// The live endpoint speaks socket.io; the session is negotiated over a
/// websocket transport with a cache-busting timestamp.
pub fn build_socket_url(base: &str) -> Result<String> {
    let mut url = url::Url::parse(&format!("{}/socket.io/", base.trim_end_matches('/')))?;
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    url.query_pairs_mut()
        .append_pair("EIO", "3")
        .append_pair("transport", "websocket")
        .append_pair("t", &t.to_string());
    Ok(url.to_string())
}

pub struct SocketConnection {
    message_rx: mpsc::Receiver<String>,
    send_tx: mpsc::Sender<String>,
    ping_tx: watch::Sender<Duration>,
    driver: JoinHandle<()>,
}

impl SocketConnection {
    /// Spawn the driver for `url`. The first connect happens in the
    /// background; messages flow once the dial succeeds.
    pub fn start(url: String, user_agent: String) -> Self {
        let (message_tx, message_rx) = mpsc::channel(MESSAGE_BUFFER);
        let (send_tx, send_rx) = mpsc::channel(MESSAGE_BUFFER);
        let (ping_tx, ping_rx) = watch::channel(DEFAULT_PING_INTERVAL);

        let driver = tokio::spawn(drive(url, user_agent, message_tx, send_rx, ping_rx));
        Self {
            message_rx,
            send_tx,
            ping_tx,
            driver,
        }
    }

    /// Next raw text payload, or `None` once the connection is closed for
    /// good.
    pub async fn next_message(&mut self) -> Option<String> {
        self.message_rx.recv().await
    }

    /// Queue one outgoing text frame.
    pub async fn send_text(&self, text: String) -> Result<()> {
        self.send_tx
            .send(text)
            .await
            .map_err(|_| anyhow!("socket connection closed"))
    }

    /// Adopt the ping interval announced by the server's handshake.
    pub fn set_ping_interval(&self, interval: Duration) {
        let _ = self.ping_tx.send(interval);
    }

    /// Tear the connection down.
    pub fn close(self) {
        self.driver.abort();
    }
}

async fn drive(
    url: String,
    user_agent: String,
    message_tx: mpsc::Sender<String>,
    mut send_rx: mpsc::Receiver<String>,
    mut ping_rx: watch::Receiver<Duration>,
) {
    'reconnect: loop {
        let ws = match connect_with_retry(&url, &user_agent, &message_tx).await {
            Some(ws) => ws,
            None => return,
        };
        let (mut sink, mut stream) = ws.split();

        let period = *ping_rx.borrow_and_update();
        let mut ping = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if message_tx.send(text.as_str().to_string()).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if message_tx
                            .send(String::from_utf8_lossy(&data).into_owned())
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        warn!("socket closed by remote, reconnecting");
                        continue 'reconnect;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "socket read error, reconnecting");
                        continue 'reconnect;
                    }
                },
                outgoing = send_rx.recv() => match outgoing {
                    Some(text) => {
                        if let Err(e) = sink.send(Message::text(text)).await {
                            warn!(error = %e, "socket send failed, reconnecting");
                            continue 'reconnect;
                        }
                    }
                    None => return,
                },
                _ = ping.tick() => {
                    if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
                        warn!(error = %e, "socket ping failed, reconnecting");
                        continue 'reconnect;
                    }
                },
                changed = ping_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let period = *ping_rx.borrow_and_update();
                    ping = tokio::time::interval_at(Instant::now() + period, period);
                },
            }
        }
    }
}

async fn connect_with_retry(
    url: &str,
    user_agent: &str,
    message_tx: &mpsc::Sender<String>,
) -> Option<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let request = match client_request(url, user_agent) {
        Ok(request) => request,
        Err(e) => {
            error!(url, error = %e, "invalid socket url");
            return None;
        }
    };

    loop {
        if message_tx.is_closed() {
            return None;
        }
        match connect_async(request.clone()).await {
            Ok((ws, _)) => {
                info!(url, "live event socket connected");
                return Some(ws);
            }
            Err(e) => {
                error!(error = %e, "socket connection failed, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

fn client_request(url: &str, user_agent: &str) -> Result<ClientRequestBuilder> {
    let uri: Uri = url.parse()?;
    Ok(ClientRequestBuilder::new(uri).with_header("User-Agent", user_agent))
}

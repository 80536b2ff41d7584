//! Live event listener.
//!
//! Decodes the socket.io framing the live endpoint speaks on top of the raw
//! websocket: engine.io packets ('0' handshake, '3' pong, '4' message) and
//! socket.io event frames ('2' + JSON array). Handles the auth exchange
//! with the account's API key, decrypts encrypted payload fields through
//! the client, and hands typed events to the consumer over a bounded
//! channel.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use mirror_core::{interpret_event, RemoteClient, SocketEvent};

use crate::socket::SocketConnection;

const PACKET_CONNECT: char = '0';
const PACKET_PONG: char = '3';
const PACKET_MESSAGE: char = '4';
const MESSAGE_EVENT: char = '2';

const EVENT_BUFFER: usize = 100;
const DEFAULT_PING_INTERVAL_MS: u64 = 15_000;

pub struct EventListener;

impl EventListener {
    /// Decode frames from `socket` until it ends or authentication fails.
    /// Returns the channel typed events arrive on.
    pub fn start(
        socket: SocketConnection,
        client: Arc<dyn RemoteClient>,
    ) -> mpsc::Receiver<SocketEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(run(socket, client, tx));
        rx
    }
}

async fn run(
    mut socket: SocketConnection,
    client: Arc<dyn RemoteClient>,
    events: mpsc::Sender<SocketEvent>,
) {
    while let Some(message) = socket.next_message().await {
        if let ControlFlow::Break(()) = handle_frame(&socket, &*client, &events, &message).await {
            break;
        }
    }
    socket.close();
}

async fn handle_frame(
    socket: &SocketConnection,
    client: &dyn RemoteClient,
    events: &mpsc::Sender<SocketEvent>,
    message: &str,
) -> ControlFlow<()> {
    let Some(packet_type) = message.chars().next() else {
        warn!("received empty socket message");
        return ControlFlow::Continue(());
    };
    let payload = &message[packet_type.len_utf8()..];

    match packet_type {
        PACKET_CONNECT => {
            if let Err(e) = handle_handshake(socket, payload).await {
                error!(error = %e, "handshake with live socket failed");
            }
            ControlFlow::Continue(())
        }
        PACKET_PONG => {
            debug!("received pong");
            ControlFlow::Continue(())
        }
        PACKET_MESSAGE => handle_message_payload(socket, client, events, payload).await,
        other => {
            warn!(packet = %other, "unknown packet type");
            ControlFlow::Continue(())
        }
    }
}

#[derive(Debug, Deserialize)]
struct HandshakePayload {
    #[serde(rename = "pingInterval", default)]
    ping_interval: u64,
}

impl HandshakePayload {
    fn interval(&self) -> Duration {
        let ms = if self.ping_interval == 0 {
            DEFAULT_PING_INTERVAL_MS
        } else {
            self.ping_interval
        };
        Duration::from_millis(ms)
    }
}

/// Adopt the announced ping interval, acknowledge the connect, and open the
/// auth exchange.
async fn handle_handshake(socket: &SocketConnection, payload: &str) -> Result<()> {
    let handshake: HandshakePayload = match serde_json::from_str(payload) {
        Ok(h) => h,
        Err(e) => {
            warn!(error = %e, "failed to parse handshake payload");
            HandshakePayload { ping_interval: 0 }
        }
    };
    socket.set_ping_interval(handshake.interval());

    socket
        .send_text(format!("{PACKET_MESSAGE}{PACKET_CONNECT}"))
        .await?;
    socket
        .send_text(build_event_frame("authed", Some(json!(now_millis()))))
        .await?;
    Ok(())
}

async fn handle_message_payload(
    socket: &SocketConnection,
    client: &dyn RemoteClient,
    events: &mpsc::Sender<SocketEvent>,
    payload: &str,
) -> ControlFlow<()> {
    let Some(message_type) = payload.chars().next() else {
        return ControlFlow::Continue(());
    };
    if message_type != MESSAGE_EVENT {
        return ControlFlow::Continue(());
    }
    let data = &payload[message_type.len_utf8()..];

    let frame: Vec<Value> = match serde_json::from_str(data) {
        Ok(frame) => frame,
        Err(e) => {
            error!(error = %e, payload = data, "failed to parse event payload");
            return ControlFlow::Continue(());
        }
    };
    let Some(name) = frame.first().and_then(Value::as_str) else {
        warn!("event frame without a name");
        return ControlFlow::Continue(());
    };

    match name {
        "authFailed" => {
            error!("live socket authentication failed");
            ControlFlow::Break(())
        }
        "authSuccess" => {
            info!("live socket authentication successful");
            ControlFlow::Continue(())
        }
        "authed" => {
            // `[authed, false]` means the session still needs our key.
            if frame.get(1) != Some(&Value::Bool(true)) {
                let auth = build_event_frame("auth", Some(json!({"apiKey": client.api_key()})));
                if let Err(e) = socket.send_text(auth).await {
                    error!(error = %e, "failed to send auth event");
                }
            }
            ControlFlow::Continue(())
        }
        name => {
            let mut payload = Map::new();
            if let Some(Value::Object(map)) = frame.get(1) {
                payload = decrypt_fields(client, map.clone()).await;
                unwrap_json_field(&mut payload, "metadata");
                unwrap_json_field(&mut payload, "name");
            }

            match interpret_event(name, Value::Object(payload)) {
                Ok(event) => {
                    if events.send(event).await.is_err() {
                        return ControlFlow::Break(());
                    }
                }
                Err(e) => warn!(event = name, error = %e, "dropping event"),
            }
            ControlFlow::Continue(())
        }
    }
}

/// socket.io event frame: "42" + JSON array of name and optional payload.
fn build_event_frame(name: &str, data: Option<Value>) -> String {
    let mut frame = vec![Value::String(name.to_string())];
    if let Some(data) = data {
        frame.push(data);
    }
    format!(
        "{PACKET_MESSAGE}{MESSAGE_EVENT}{}",
        Value::Array(frame)
    )
}

/// Encrypted strings carry a recognizable prefix; everything else passes
/// through untouched, as do values the client fails to decrypt.
fn needs_decryption(value: &str) -> bool {
    value.starts_with("U2FsdGVk") || value.starts_with("002") || value.starts_with("003")
}

fn decrypt_fields<'a>(
    client: &'a dyn RemoteClient,
    map: Map<String, Value>,
) -> BoxFuture<'a, Map<String, Value>> {
    async move {
        let mut out = Map::with_capacity(map.len());
        for (key, value) in map {
            let decrypted = match value {
                Value::String(s) if needs_decryption(&s) => match client.decrypt_meta(&s).await {
                    Ok(plain) => Value::String(plain),
                    Err(_) => Value::String(s),
                },
                Value::Object(nested) => Value::Object(decrypt_fields(client, nested).await),
                other => other,
            };
            out.insert(key, decrypted);
        }
        out
    }
    .boxed()
}

/// Decrypted metadata often arrives as a JSON string; inline it when it
/// parses as an object.
fn unwrap_json_field(map: &mut Map<String, Value>, key: &str) {
    let Some(Value::String(raw)) = map.get(key) else {
        return;
    };
    if let Ok(parsed) = serde_json::from_str::<Map<String, Value>>(raw) {
        map.insert(key.to_string(), Value::Object(parsed));
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_interval_defaults() {
        let parsed: HandshakePayload = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed.interval(), Duration::from_millis(15_000));

        let parsed: HandshakePayload =
            serde_json::from_str(r#"{"pingInterval": 25000}"#).unwrap();
        assert_eq!(parsed.interval(), Duration::from_millis(25_000));
    }

    #[test]
    fn event_frames_are_socketio_arrays() {
        assert_eq!(
            build_event_frame("auth", Some(json!({"apiKey": "k"}))),
            r#"42["auth",{"apiKey":"k"}]"#
        );
        assert_eq!(build_event_frame("ping", None), r#"42["ping"]"#);
    }

    #[test]
    fn encrypted_prefixes_are_detected() {
        assert!(needs_decryption("U2FsdGVkX19abc"));
        assert!(needs_decryption("002deadbeef"));
        assert!(needs_decryption("003deadbeef"));
        assert!(!needs_decryption("plain name.txt"));
    }

    #[test]
    fn json_string_fields_are_inlined() {
        let mut map = Map::new();
        map.insert(
            "metadata".to_string(),
            Value::String(r#"{"name":"a.txt","lastModified":7}"#.to_string()),
        );
        map.insert("name".to_string(), Value::String("not json".to_string()));

        unwrap_json_field(&mut map, "metadata");
        unwrap_json_field(&mut map, "name");
        unwrap_json_field(&mut map, "absent");

        assert!(map["metadata"].is_object());
        assert_eq!(map["metadata"]["name"], json!("a.txt"));
        assert_eq!(map["name"], json!("not json"));
    }
}

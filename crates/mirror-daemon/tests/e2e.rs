//! End-to-end tests for the mirror daemon: full sync against an in-memory
//! remote, live event application, and the socket listener against an
//! in-process websocket server.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::{SinkExt, StreamExt};
use serde_json::json;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use mirror_core::events::Metadata;
use mirror_core::{InMemoryRemote, SocketEvent, Uuid};
use mirror_daemon::{EventListener, Mirror, MirrorConfig, SocketConnection};

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn at(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

/// Remote account with:
///   docs/            (d-docs)
///   docs/sub/        (d-sub)
///   docs/sub/deep.txt (f-deep)
///   readme.md        (f-readme)
fn seeded_remote() -> Arc<InMemoryRemote> {
    let remote = Arc::new(InMemoryRemote::new("base-folder", "test-key"));
    remote.add_dir("d-docs", "base-folder", "docs");
    remote.add_dir("d-sub", "d-docs", "sub");
    remote.add_file(
        "f-deep",
        "d-sub",
        "deep.txt",
        at(1_700_000_100),
        &sha256_hex(b"deep contents"),
        b"deep contents",
    );
    remote.add_file(
        "f-readme",
        "base-folder",
        "readme.md",
        at(1_700_000_200),
        &sha256_hex(b"# mirror"),
        b"# mirror",
    );
    remote
}

async fn started_mirror(remote: Arc<InMemoryRemote>, sync_dir: &Path) -> Mirror {
    let mirror = Mirror::new(
        remote,
        MirrorConfig {
            sync_dir: sync_dir.to_path_buf(),
        },
    );
    mirror.start_workers().await;
    mirror
}

/// Poll until `check` passes or the deadline hits.
async fn wait_for<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let result = timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn full_sync_mirrors_the_remote_tree() {
    let dir = TempDir::new().unwrap();
    let mirror = started_mirror(seeded_remote(), dir.path()).await;

    mirror.full_sync_once().await.unwrap();

    assert!(dir.path().join("docs/sub").is_dir());
    assert_eq!(
        std::fs::read(dir.path().join("docs/sub/deep.txt")).unwrap(),
        b"deep contents"
    );
    assert_eq!(
        std::fs::read(dir.path().join("readme.md")).unwrap(),
        b"# mirror"
    );
    assert_eq!(
        std::fs::metadata(dir.path().join("readme.md"))
            .unwrap()
            .modified()
            .unwrap(),
        at(1_700_000_200)
    );

    // the adopted tree places base-folder children at the root
    let tree = mirror.local_tree();
    let mut db = tree.lock().await;
    assert_eq!(db.get_path(Uuid::from("f-readme")).unwrap(), "readme.md");
    assert_eq!(
        db.get_path(Uuid::from("f-deep")).unwrap(),
        "docs/sub/deep.txt"
    );
}

#[tokio::test]
async fn full_sync_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let mirror = started_mirror(seeded_remote(), dir.path()).await;

    mirror.full_sync_once().await.unwrap();
    mirror.full_sync_once().await.unwrap();

    assert_eq!(
        std::fs::read(dir.path().join("docs/sub/deep.txt")).unwrap(),
        b"deep contents"
    );
}

#[tokio::test]
async fn full_sync_removes_entries_dropped_from_remote() {
    let dir = TempDir::new().unwrap();
    let remote = seeded_remote();
    let mirror = started_mirror(Arc::clone(&remote), dir.path()).await;
    mirror.full_sync_once().await.unwrap();

    remote.remove("f-readme");
    mirror.full_sync_once().await.unwrap();

    assert!(!dir.path().join("readme.md").exists());
    assert!(dir.path().join("docs/sub/deep.txt").exists());
}

#[tokio::test]
async fn full_sync_moves_relocated_entries() {
    let dir = TempDir::new().unwrap();
    let remote = seeded_remote();
    let mirror = started_mirror(Arc::clone(&remote), dir.path()).await;
    mirror.full_sync_once().await.unwrap();

    remote.relocate("f-deep", "d-docs", "renamed.txt");
    mirror.full_sync_once().await.unwrap();

    assert!(!dir.path().join("docs/sub/deep.txt").exists());
    assert_eq!(
        std::fs::read(dir.path().join("docs/renamed.txt")).unwrap(),
        b"deep contents"
    );
}

#[tokio::test]
async fn full_sync_prunes_local_strays() {
    let dir = TempDir::new().unwrap();
    let remote = seeded_remote();
    let mirror = started_mirror(remote, dir.path()).await;
    mirror.full_sync_once().await.unwrap();

    std::fs::create_dir_all(dir.path().join("stray-dir")).unwrap();
    std::fs::write(dir.path().join("stray-dir/junk.txt"), b"junk").unwrap();
    std::fs::write(dir.path().join("docs/extra.txt"), b"extra").unwrap();

    mirror.full_sync_once().await.unwrap();

    assert!(!dir.path().join("stray-dir").exists());
    assert!(!dir.path().join("docs/extra.txt").exists());
    assert!(dir.path().join("docs/sub/deep.txt").exists());
}

#[tokio::test]
async fn file_rename_event_moves_the_local_file() {
    let dir = TempDir::new().unwrap();
    let remote = seeded_remote();
    let mirror = started_mirror(remote, dir.path()).await;
    mirror.full_sync_once().await.unwrap();

    let mut meta = Metadata::new();
    meta.insert("name".to_string(), json!("renamed.md"));
    mirror
        .handle_event(SocketEvent::FileRename(mirror_core::events::FileRename {
            uuid: "f-readme".to_string(),
            meta,
        }))
        .await;

    let tree = mirror.local_tree();
    assert_eq!(
        tree.lock().await.get_path(Uuid::from("f-readme")).unwrap(),
        "renamed.md"
    );
    assert!(dir.path().join("renamed.md").is_file());
    assert!(!dir.path().join("readme.md").exists());
}

#[tokio::test]
async fn file_new_event_downloads_the_file() {
    let dir = TempDir::new().unwrap();
    let remote = seeded_remote();
    remote.add_file(
        "f-live",
        "d-docs",
        "live.txt",
        at(1_700_000_300),
        &sha256_hex(b"pushed live"),
        b"pushed live",
    );
    let mirror = started_mirror(Arc::clone(&remote), dir.path()).await;
    mirror.full_sync_once().await.unwrap();
    std::fs::remove_file(dir.path().join("docs/live.txt")).unwrap();

    let mut meta = Metadata::new();
    meta.insert("name".to_string(), json!("live.txt"));
    meta.insert("lastModified".to_string(), json!(1_700_000_300u64));
    mirror
        .handle_event(SocketEvent::FileNew(mirror_core::events::FileNew {
            uuid: "f-live".to_string(),
            parent: "d-docs".to_string(),
            meta,
        }))
        .await;

    let path = dir.path().join("docs/live.txt");
    wait_for("live file download", || path.is_file()).await;
    assert_eq!(std::fs::read(&path).unwrap(), b"pushed live");
}

#[tokio::test]
async fn folder_trash_event_removes_the_subtree() {
    let dir = TempDir::new().unwrap();
    let remote = seeded_remote();
    let mirror = started_mirror(remote, dir.path()).await;
    mirror.full_sync_once().await.unwrap();

    mirror
        .handle_event(SocketEvent::FolderTrash(mirror_core::events::FolderTrash {
            uuid: "d-docs".to_string(),
        }))
        .await;

    assert!(!dir.path().join("docs").exists());
    let tree = mirror.local_tree();
    let db = tree.lock().await;
    assert!(!db.contains(Uuid::from("d-docs")));
    assert!(!db.contains(Uuid::from("f-deep")));
}

#[tokio::test]
async fn folder_created_at_base_lands_at_the_root() {
    let dir = TempDir::new().unwrap();
    let remote = seeded_remote();
    let mirror = started_mirror(remote, dir.path()).await;
    mirror.full_sync_once().await.unwrap();

    mirror
        .handle_event(SocketEvent::FolderSubCreated(
            mirror_core::events::FolderSubCreated {
                uuid: "d-new".to_string(),
                parent: "base-folder".to_string(),
                name: mirror_core::events::NamePayload {
                    name: "fresh".to_string(),
                },
            },
        ))
        .await;

    assert!(dir.path().join("fresh").is_dir());
    let tree = mirror.local_tree();
    assert_eq!(
        tree.lock().await.get_path(Uuid::from("d-new")).unwrap(),
        "fresh"
    );
}

#[tokio::test]
async fn start_syncs_then_consumes_live_events() {
    let dir = TempDir::new().unwrap();
    let remote = seeded_remote();
    let mirror = Arc::new(Mirror::new(
        Arc::clone(&remote) as Arc<dyn mirror_core::RemoteClient>,
        MirrorConfig {
            sync_dir: dir.path().to_path_buf(),
        },
    ));

    let (event_tx, event_rx) = tokio::sync::mpsc::channel(100);
    Arc::clone(&mirror).start(event_rx).await;

    // initial full sync already ran
    assert_eq!(
        std::fs::read(dir.path().join("readme.md")).unwrap(),
        b"# mirror"
    );

    event_tx
        .send(SocketEvent::FileTrash(mirror_core::events::FileTrash {
            uuid: "f-readme".to_string(),
        }))
        .await
        .unwrap();

    let path = dir.path().join("readme.md");
    wait_for("event-driven removal", || !path.exists()).await;
}

// ============================================================================
// Socket listener
// ============================================================================

type ServerWs = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

async fn recv_text(ws: &mut ServerWs) -> String {
    loop {
        match timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for client frame")
        {
            Some(Ok(Message::Text(text))) => return text.as_str().to_string(),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

#[tokio::test]
async fn listener_authenticates_and_delivers_typed_events() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let remote: Arc<InMemoryRemote> = Arc::new(InMemoryRemote::new("base-folder", "test-key"));
    let socket = SocketConnection::start(format!("ws://{addr}"), "mirror-tests".to_string());
    let mut events = EventListener::start(socket, remote);

    let (stream, _) = listener.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

    // engine.io handshake, then the connect ack and our authed probe
    ws.send(Message::text(r#"0{"pingInterval":60000}"#))
        .await
        .unwrap();
    assert_eq!(recv_text(&mut ws).await, "40");
    let authed = recv_text(&mut ws).await;
    assert!(authed.starts_with(r#"42["authed","#), "got: {authed}");

    // session not yet authenticated: the listener must present the API key
    ws.send(Message::text(r#"42["authed",false]"#)).await.unwrap();
    assert_eq!(
        recv_text(&mut ws).await,
        r#"42["auth",{"apiKey":"test-key"}]"#
    );
    ws.send(Message::text(r#"42["authSuccess"]"#)).await.unwrap();

    // metadata arrives as a JSON string and must be unwrapped
    let frame = format!(
        "42{}",
        json!([
            "file-new",
            {
                "uuid": "evt-file",
                "parent": "d-docs",
                "metadata": r#"{"name":"evt.txt","lastModified":1700000000}"#,
            }
        ])
    );
    ws.send(Message::text(frame)).await.unwrap();

    let event = timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for typed event")
        .expect("event channel closed");
    let SocketEvent::FileNew(e) = event else {
        panic!("expected file-new, got {event:?}");
    };
    assert_eq!(e.uuid, "evt-file");
    assert_eq!(mirror_core::events::meta_name(&e.meta), Some("evt.txt"));
    assert_eq!(mirror_core::events::meta_last_modified(&e.meta), 1_700_000_000);

    // unknown event kinds are dropped without closing the channel
    ws.send(Message::text(r#"42["folder-glitter",{"uuid":"x"}]"#))
        .await
        .unwrap();

    // severed connection: the listener dials again and re-handshakes
    drop(ws);
    let (stream, _) = timeout(Duration::from_secs(10), listener.accept())
        .await
        .expect("timed out waiting for reconnect")
        .unwrap();
    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
    ws.send(Message::text(r#"0{"pingInterval":60000}"#))
        .await
        .unwrap();
    assert_eq!(recv_text(&mut ws).await, "40");
}

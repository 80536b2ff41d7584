//! Typed events delivered by the remote service's live socket.
//!
//! Payloads arrive as socket.io event frames: a string event name plus a
//! JSON object whose encrypted fields have already been decrypted by the
//! listener. [`interpret_event`] maps the pair to a [`SocketEvent`]
//! variant; names this vocabulary does not know are a typed error so the
//! listener can log and drop them.

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("unknown event type: {0}")]
    UnknownType(String),

    #[error("malformed {kind} payload: {source}")]
    Malformed {
        kind: &'static str,
        source: serde_json::Error,
    },
}

/// Decrypted file metadata map (`name`, `lastModified`, ...).
pub type Metadata = Map<String, Value>;

#[derive(Debug, Clone, Deserialize)]
pub struct FileNew {
    pub uuid: String,
    pub parent: String,
    #[serde(default, rename = "metadata")]
    pub meta: Metadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileRename {
    pub uuid: String,
    #[serde(default, rename = "metadata")]
    pub meta: Metadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileArchiveRestored {
    pub uuid: String,
    pub parent: String,
    #[serde(default, rename = "metadata")]
    pub meta: Metadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileRestore {
    pub uuid: String,
    pub parent: String,
    #[serde(default, rename = "metadata")]
    pub meta: Metadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileMove {
    pub uuid: String,
    pub parent: String,
    #[serde(default, rename = "metadata")]
    pub meta: Metadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileTrash {
    pub uuid: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileArchived {
    pub uuid: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileDeletedPermanent {
    pub uuid: String,
}

/// Folder names travel wrapped in a `{"name": ...}` object.
#[derive(Debug, Clone, Deserialize)]
pub struct NamePayload {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FolderRename {
    pub uuid: String,
    pub name: NamePayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FolderTrash {
    pub uuid: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FolderMove {
    pub uuid: String,
    pub parent: String,
    pub name: NamePayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FolderSubCreated {
    pub uuid: String,
    pub parent: String,
    pub name: NamePayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FolderRestore {
    pub uuid: String,
    #[serde(default)]
    pub parent: String,
    pub name: NamePayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FolderColorChanged {
    pub uuid: String,
    #[serde(default)]
    pub color: i64,
}

#[derive(Debug, Clone)]
pub enum SocketEvent {
    FileNew(FileNew),
    FileRename(FileRename),
    FileArchiveRestored(FileArchiveRestored),
    FileRestore(FileRestore),
    FileMove(FileMove),
    FileTrash(FileTrash),
    FileArchived(FileArchived),
    FileDeletedPermanent(FileDeletedPermanent),
    FolderRename(FolderRename),
    FolderTrash(FolderTrash),
    FolderMove(FolderMove),
    FolderSubCreated(FolderSubCreated),
    FolderRestore(FolderRestore),
    FolderColorChanged(FolderColorChanged),
}

impl SocketEvent {
    /// The wire name of this event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            SocketEvent::FileNew(_) => "file-new",
            SocketEvent::FileRename(_) => "file-rename",
            SocketEvent::FileArchiveRestored(_) => "file-archive-restored",
            SocketEvent::FileRestore(_) => "file-restore",
            SocketEvent::FileMove(_) => "file-move",
            SocketEvent::FileTrash(_) => "file-trash",
            SocketEvent::FileArchived(_) => "file-archived",
            SocketEvent::FileDeletedPermanent(_) => "file-deleted-permanent",
            SocketEvent::FolderRename(_) => "folder-rename",
            SocketEvent::FolderTrash(_) => "folder-trash",
            SocketEvent::FolderMove(_) => "folder-move",
            SocketEvent::FolderSubCreated(_) => "folder-sub-created",
            SocketEvent::FolderRestore(_) => "folder-restore",
            SocketEvent::FolderColorChanged(_) => "folder-color-changed",
        }
    }
}

fn parse<T>(kind: &'static str, payload: Value) -> Result<T, EventError>
where
    T: for<'de> Deserialize<'de>,
{
    serde_json::from_value(payload).map_err(|source| EventError::Malformed { kind, source })
}

/// Map a socket.io event name and its decrypted payload to a typed event.
pub fn interpret_event(name: &str, payload: Value) -> Result<SocketEvent, EventError> {
    match name {
        "file-new" => parse("file-new", payload).map(SocketEvent::FileNew),
        "file-rename" => parse("file-rename", payload).map(SocketEvent::FileRename),
        "file-archive-restored" => {
            parse("file-archive-restored", payload).map(SocketEvent::FileArchiveRestored)
        }
        "file-restore" => parse("file-restore", payload).map(SocketEvent::FileRestore),
        "file-move" => parse("file-move", payload).map(SocketEvent::FileMove),
        "file-trash" => parse("file-trash", payload).map(SocketEvent::FileTrash),
        "file-archived" => parse("file-archived", payload).map(SocketEvent::FileArchived),
        "file-deleted-permanent" => {
            parse("file-deleted-permanent", payload).map(SocketEvent::FileDeletedPermanent)
        }
        "folder-rename" => parse("folder-rename", payload).map(SocketEvent::FolderRename),
        "folder-trash" => parse("folder-trash", payload).map(SocketEvent::FolderTrash),
        "folder-move" => parse("folder-move", payload).map(SocketEvent::FolderMove),
        "folder-sub-created" => {
            parse("folder-sub-created", payload).map(SocketEvent::FolderSubCreated)
        }
        "folder-restore" => parse("folder-restore", payload).map(SocketEvent::FolderRestore),
        "folder-color-changed" => {
            parse("folder-color-changed", payload).map(SocketEvent::FolderColorChanged)
        }
        other => Err(EventError::UnknownType(other.to_string())),
    }
}

/// Decrypted `name` field of a metadata map.
pub fn meta_name(meta: &Metadata) -> Option<&str> {
    meta.get("name").and_then(Value::as_str)
}

/// `lastModified` seconds from a metadata map; the remote delivers it as
/// either a number or a numeric string. Missing or unparsable values are 0.
pub fn meta_last_modified(meta: &Metadata) -> i64 {
    match meta.get("lastModified") {
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        Some(Value::Number(n)) => n.as_i64().unwrap_or_else(|| n.as_f64().unwrap_or(0.0) as i64),
        _ => 0,
    }
}

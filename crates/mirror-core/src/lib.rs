//! mirror-core: data model for the Filen mirror.
//!
//! This crate provides:
//! - The in-memory file tree database keyed by remote uuid
//! - The order-independent tree diff
//! - Typed live-socket events
//! - The remote account contract the daemon consumes

pub mod diff;
pub mod events;
pub mod id;
pub mod remote;
pub mod tree;

pub use diff::{start_diff, DiffItem};
pub use events::{interpret_event, meta_last_modified, meta_name, EventError, SocketEvent};
pub use id::{ContentHash, FileName, Uuid};
pub use remote::{
    ByteReader, InMemoryRemote, RemoteClient, RemoteDir, RemoteError, RemoteFile, RemoteListing,
};
pub use tree::{FileTree, FileTreeNode};

//! Remote account contract.
//!
//! The authenticated service client (login, key derivation, chunked
//! download decryption) lives outside this workspace; the mirror only needs
//! the narrow surface below. [`InMemoryRemote`] implements it over plain
//! maps for tests.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::RwLock;
use std::time::SystemTime;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote listing failed: {0}")]
    Listing(String),

    #[error("remote entry not found: {0}")]
    NotFound(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("metadata decryption failed: {0}")]
    Decrypt(String),
}

/// Decrypted byte stream of a single remote file.
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Clone)]
pub struct RemoteFile {
    pub uuid: String,
    pub parent: String,
    pub name: String,
    pub last_modified: SystemTime,
    /// Lowercase hex digest as reported by the remote; may be empty.
    pub hash: String,
}

#[derive(Debug, Clone)]
pub struct RemoteDir {
    pub uuid: String,
    pub parent: String,
    pub name: String,
}

/// Full recursive listing of the account, base folder excluded.
#[derive(Debug, Clone, Default)]
pub struct RemoteListing {
    pub files: Vec<RemoteFile>,
    pub dirs: Vec<RemoteDir>,
}

#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Uuid of the account's root folder. Entries whose parent equals it
    /// live at the top level of the mirror.
    fn base_folder(&self) -> &str;

    /// Key the live socket authenticates with.
    fn api_key(&self) -> &str;

    async fn list_recursive(&self) -> Result<RemoteListing, RemoteError>;

    /// Open a decrypted byte reader for one file.
    async fn open_download(&self, uuid: &str) -> Result<ByteReader, RemoteError>;

    /// Decrypt one encrypted metadata string from a socket payload.
    async fn decrypt_meta(&self, value: &str) -> Result<String, RemoteError>;
}

/// In-memory remote account for tests: a listing plus per-uuid contents.
/// Metadata "decryption" is the identity function.
#[derive(Default)]
pub struct InMemoryRemote {
    base_folder: String,
    api_key: String,
    listing: RwLock<RemoteListing>,
    contents: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryRemote {
    pub fn new(base_folder: &str, api_key: &str) -> Self {
        Self {
            base_folder: base_folder.to_string(),
            api_key: api_key.to_string(),
            listing: RwLock::new(RemoteListing::default()),
            contents: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_dir(&self, uuid: &str, parent: &str, name: &str) {
        let mut listing = self.listing.write().unwrap_or_else(|e| e.into_inner());
        listing.dirs.push(RemoteDir {
            uuid: uuid.to_string(),
            parent: parent.to_string(),
            name: name.to_string(),
        });
    }

    pub fn add_file(
        &self,
        uuid: &str,
        parent: &str,
        name: &str,
        last_modified: SystemTime,
        hash: &str,
        content: &[u8],
    ) {
        {
            let mut listing = self.listing.write().unwrap_or_else(|e| e.into_inner());
            listing.files.push(RemoteFile {
                uuid: uuid.to_string(),
                parent: parent.to_string(),
                name: name.to_string(),
                last_modified,
                hash: hash.to_string(),
            });
        }
        let mut contents = self.contents.write().unwrap_or_else(|e| e.into_inner());
        contents.insert(uuid.to_string(), content.to_vec());
    }

    /// Drop an entry from the listing; its content stays downloadable so
    /// in-flight readers keep working.
    pub fn remove(&self, uuid: &str) {
        let mut listing = self.listing.write().unwrap_or_else(|e| e.into_inner());
        listing.files.retain(|f| f.uuid != uuid);
        listing.dirs.retain(|d| d.uuid != uuid);
    }

    /// Rewrite the parent and name of a listed entry.
    pub fn relocate(&self, uuid: &str, parent: &str, name: &str) {
        let mut listing = self.listing.write().unwrap_or_else(|e| e.into_inner());
        for file in listing.files.iter_mut().filter(|f| f.uuid == uuid) {
            file.parent = parent.to_string();
            file.name = name.to_string();
        }
        for dir in listing.dirs.iter_mut().filter(|d| d.uuid == uuid) {
            dir.parent = parent.to_string();
            dir.name = name.to_string();
        }
    }
}

#[async_trait]
impl RemoteClient for InMemoryRemote {
    fn base_folder(&self) -> &str {
        &self.base_folder
    }

    fn api_key(&self) -> &str {
        &self.api_key
    }

    async fn list_recursive(&self) -> Result<RemoteListing, RemoteError> {
        Ok(self
            .listing
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    async fn open_download(&self, uuid: &str) -> Result<ByteReader, RemoteError> {
        let contents = self.contents.read().unwrap_or_else(|e| e.into_inner());
        let bytes = contents
            .get(uuid)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(uuid.to_string()))?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    async fn decrypt_meta(&self, value: &str) -> Result<String, RemoteError> {
        Ok(value.to_string())
    }
}

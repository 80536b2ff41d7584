//! Mirror controller.
//!
//! Owns the local copy of the remote tree (`os_db`) and drives the two
//! convergence paths that mutate it: the periodic full sync (walk disk,
//! fetch listing, diff, apply, adopt) and the live event handler. Both
//! paths target the same disk and the same tree; the next full sync is
//! authoritative for anything a crashed task or dropped event left behind.
//!
//! Locking: every tree access takes the mutex, and worker tasks only ever
//! capture paths and node snapshots taken under the lock at schedule time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use anyhow::{Context, Result};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use mirror_core::{
    events, start_diff, DiffItem, FileName, FileTree, FileTreeNode, RemoteClient, SocketEvent,
    Uuid,
};

use crate::executor::LocalExecutor;
use crate::task_runner::{TaskRunner, DEFAULT_WORKERS};
use crate::walk::walk_dirs;

const FULL_SYNC_INTERVAL: Duration = Duration::from_secs(60 * 60);
const FULL_SYNC_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Local root the remote tree is mirrored under.
    pub sync_dir: PathBuf,
}

pub struct Mirror {
    client: Arc<dyn RemoteClient>,
    os_db: Arc<Mutex<FileTree>>,
    base_dir: Uuid,
    sync_dir: PathBuf,
    runner: TaskRunner,
    executor: Arc<LocalExecutor>,
}

impl Mirror {
    pub fn new(client: Arc<dyn RemoteClient>, config: MirrorConfig) -> Self {
        let base_dir = Uuid::from(client.base_folder());
        Self {
            client,
            os_db: Arc::new(Mutex::new(FileTree::new())),
            base_dir,
            sync_dir: config.sync_dir,
            runner: TaskRunner::new(),
            executor: Arc::new(LocalExecutor::new()),
        }
    }

    /// Shared handle to the local tree, for embedders that want to inspect
    /// mirror state.
    pub fn local_tree(&self) -> Arc<Mutex<FileTree>> {
        Arc::clone(&self.os_db)
    }

    /// Start the download workers without entering the sync loops.
    pub async fn start_workers(&self) {
        self.runner.start(DEFAULT_WORKERS).await;
    }

    /// Bring the mirror up: start workers, run the initial full sync until
    /// it succeeds, then spawn the event handler and the hourly sync.
    pub async fn start(self: Arc<Self>, events: mpsc::Receiver<SocketEvent>) {
        self.start_workers().await;
        self.full_sync().await;

        let handler = Arc::clone(&self);
        tokio::spawn(async move { handler.run_event_handler(events).await });
        let ticker = Arc::clone(&self);
        tokio::spawn(async move { ticker.run_periodic_full_sync().await });
    }

    /// Run full sync until one pass succeeds.
    pub async fn full_sync(&self) {
        loop {
            match self.full_sync_once().await {
                Ok(()) => return,
                Err(e) => {
                    error!(error = %e, "full sync failed");
                    tokio::time::sleep(FULL_SYNC_RETRY_DELAY).await;
                }
            }
        }
    }

    async fn run_periodic_full_sync(self: Arc<Self>) {
        loop {
            tokio::time::sleep(FULL_SYNC_INTERVAL).await;
            self.full_sync().await;
        }
    }

    /// One reconciliation pass.
    pub async fn full_sync_once(&self) -> Result<()> {
        self.remove_db_items_missing_on_disk().await?;

        let mut remote_db = self.fetch_remote_db().await?;

        let diff = {
            let db = self.os_db.lock().await;
            start_diff(&db, &remote_db)
        };
        self.apply_diff_items(diff, &remote_db).await;

        self.os_db.lock().await.copy_from(&remote_db);

        self.remove_local_files_not_in_db(&mut remote_db).await
    }

    /// Drop tree entries whose local file has disappeared, so the diff
    /// re-adds them. A missing sync dir verifies nothing and removes
    /// nothing.
    async fn remove_db_items_missing_on_disk(&self) -> Result<()> {
        let mut paths = self.os_db.lock().await.get_path_to_uuid_map();

        let sync_dir = self.sync_dir.clone();
        let missing = tokio::task::spawn_blocking(move || -> std::io::Result<_> {
            let result = walk_dirs(&sync_dir, &mut |path, _is_dir, descend| {
                *descend = true;
                if let Ok(rel) = path.strip_prefix(&sync_dir) {
                    paths.remove(rel.to_string_lossy().as_ref());
                }
            });
            match result {
                Ok(()) => Ok(paths),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
                Err(e) => Err(e),
            }
        })
        .await
        .context("walk task panicked")?
        .context("walk sync dir")?;

        if !missing.is_empty() {
            let mut db = self.os_db.lock().await;
            for (path, uuid) in missing {
                info!(path = %path, uuid = %uuid, "dropping tree entry missing on disk");
                db.remove(uuid);
            }
        }
        Ok(())
    }

    /// Delete local entries the remote tree no longer contains, pruning
    /// descent below each deleted directory.
    async fn remove_local_files_not_in_db(&self, remote_db: &mut FileTree) -> Result<()> {
        let keep = remote_db.get_path_to_uuid_map();

        let sync_dir = self.sync_dir.clone();
        let doomed = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<PathBuf>> {
            let mut doomed = Vec::new();
            let result = walk_dirs(&sync_dir, &mut |path, _is_dir, descend| {
                *descend = true;
                let Ok(rel) = path.strip_prefix(&sync_dir) else {
                    return;
                };
                if !keep.contains_key(rel.to_string_lossy().as_ref()) {
                    *descend = false;
                    doomed.push(path.to_path_buf());
                }
            });
            match result {
                Ok(()) => Ok(doomed),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
                Err(e) => Err(e),
            }
        })
        .await
        .context("walk task panicked")?
        .context("walk sync dir")?;

        for path in doomed {
            info!(path = %path.display(), "removing local entry not in remote tree");
            if let Err(e) = self.executor.remove_path(&path).await {
                warn!(path = %path.display(), error = %e, "failed to remove local entry");
            }
        }
        Ok(())
    }

    /// Build the desired tree from the remote listing. Children of the base
    /// folder are re-rooted so they live at the top of the mirror.
    async fn fetch_remote_db(&self) -> Result<FileTree> {
        let listing = self.client.list_recursive().await?;

        let mut items = Vec::with_capacity(listing.dirs.len() + listing.files.len());
        for dir in listing.dirs {
            items.push(FileTreeNode {
                uuid: Uuid::from(&dir.uuid),
                name: FileName::from(dir.name),
                hash: Default::default(),
                modtime: UNIX_EPOCH,
                is_dir: true,
                parent: self.remap_base(Uuid::from(&dir.parent)),
            });
        }
        for file in listing.files {
            items.push(FileTreeNode {
                uuid: Uuid::from(&file.uuid),
                name: FileName::from(file.name),
                hash: mirror_core::ContentHash::from_hex(&file.hash),
                modtime: file.last_modified,
                is_dir: false,
                parent: self.remap_base(Uuid::from(&file.parent)),
            });
        }

        let mut remote_db = FileTree::new();
        remote_db.ensure_items(items);
        Ok(remote_db)
    }

    /// Apply one diff stream. Removals and renames run inline; ensure
    /// operations go through the worker pool, and every scheduled task is
    /// awaited before returning so `copy_from` sees finished work.
    async fn apply_diff_items(
        &self,
        mut diff: mpsc::Receiver<DiffItem>,
        remote_db: &FileTree,
    ) {
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);

        while let Some(item) = diff.recv().await {
            match item {
                DiffItem::Added { uuid, path } => {
                    self.schedule_ensure(uuid, &path, remote_db, done_tx.clone())
                        .await;
                }
                DiffItem::Removed { uuid, path } => {
                    let local = self.sync_dir.join(&path);
                    info!(path = %local.display(), "removing local entry dropped from remote");
                    if let Err(e) = self.executor.remove_path(&local).await {
                        warn!(path = %local.display(), error = %e, "failed to remove local entry");
                    }
                    self.os_db.lock().await.remove(uuid);
                }
                DiffItem::Modified {
                    uuid,
                    old_path,
                    new_path,
                } => {
                    if old_path != new_path {
                        let old_local = self.sync_dir.join(&old_path);
                        let new_local = self.sync_dir.join(&new_path);

                        if let Some(parent) = new_local.parent() {
                            if let Err(e) = self.executor.mkdir_all(parent).await {
                                warn!(path = %new_local.display(), error = %e, "failed to create parent directories for move");
                                continue;
                            }
                        }
                        info!(from = %old_local.display(), to = %new_local.display(), "moving local entry");
                        if let Err(e) = self.executor.rename(&old_local, &new_local).await {
                            warn!(from = %old_local.display(), to = %new_local.display(), error = %e, "failed to move local entry");
                            continue;
                        }
                    }
                    if let Some(node) = remote_db.get_node(uuid) {
                        self.os_db
                            .lock()
                            .await
                            .move_node(uuid, node.parent, node.name);
                    }
                    self.schedule_ensure(uuid, &new_path, remote_db, done_tx.clone())
                        .await;
                }
            }
        }

        // Each scheduled task owns a sender clone; recv returns None once
        // the last one is dropped.
        drop(done_tx);
        let _ = done_rx.recv().await;
    }

    async fn schedule_ensure(
        &self,
        uuid: Uuid,
        path: &str,
        remote_db: &FileTree,
        done: mpsc::Sender<()>,
    ) {
        let Some(node) = remote_db.get_node(uuid) else {
            return;
        };
        let local = self.sync_dir.join(path);
        let client = Arc::clone(&self.client);
        let executor = Arc::clone(&self.executor);
        let uuid = uuid.to_string();

        self.runner
            .schedule(async move {
                let _done = done;
                if node.is_dir {
                    executor.ensure_dir(&local).await
                } else {
                    executor
                        .ensure_file(&local, node.modtime, &node.hash.to_string(), move || {
                            async move { Ok(client.open_download(&uuid).await?) }
                        })
                        .await
                }
            })
            .await;
    }

    async fn run_event_handler(self: Arc<Self>, mut events: mpsc::Receiver<SocketEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        info!("live event stream ended");
    }

    /// Apply one live event to the tree and the local filesystem. All
    /// branches are idempotent: events are delivered at least once.
    pub async fn handle_event(&self, event: SocketEvent) {
        match event {
            SocketEvent::FileNew(e) => self.ensure_local_file(&e.uuid, &e.parent, &e.meta).await,
            SocketEvent::FileRestore(e) => {
                self.ensure_local_file(&e.uuid, &e.parent, &e.meta).await
            }
            SocketEvent::FileArchiveRestored(e) => {
                self.ensure_local_file(&e.uuid, &e.parent, &e.meta).await
            }
            SocketEvent::FileDeletedPermanent(e) => self.remove_local(Uuid::from(&e.uuid)).await,
            SocketEvent::FileTrash(e) => self.remove_local(Uuid::from(&e.uuid)).await,
            SocketEvent::FolderTrash(e) => self.remove_local(Uuid::from(&e.uuid)).await,
            SocketEvent::FileRename(e) => {
                let uuid = Uuid::from(&e.uuid);
                let Some(name) = events::meta_name(&e.meta) else {
                    warn!(%uuid, "rename event without a name");
                    return;
                };
                let Some(node) = self.os_db.lock().await.get_node(uuid) else {
                    warn!(%uuid, "rename event for unknown entry");
                    return;
                };
                self.move_local(uuid, node.parent, name).await;
            }
            SocketEvent::FileMove(e) => {
                let uuid = Uuid::from(&e.uuid);
                let Some(name) = events::meta_name(&e.meta) else {
                    warn!(%uuid, "move event without a name");
                    return;
                };
                self.move_local(uuid, Uuid::from(&e.parent), name).await;
            }
            SocketEvent::FolderRename(e) => {
                let uuid = Uuid::from(&e.uuid);
                let Some(node) = self.os_db.lock().await.get_node(uuid) else {
                    warn!(%uuid, "rename event for unknown entry");
                    return;
                };
                self.move_local(uuid, node.parent, &e.name.name).await;
            }
            SocketEvent::FolderMove(e) => {
                self.move_local(Uuid::from(&e.uuid), Uuid::from(&e.parent), &e.name.name)
                    .await;
            }
            SocketEvent::FolderSubCreated(e) => self.create_local_dir(&e).await,
            other => info!(kind = other.kind(), "ignoring unhandled event"),
        }
    }

    /// Record the file in the tree and queue a download. Live events carry
    /// no hash, so content is fetched unless the modtime already matches.
    async fn ensure_local_file(&self, uuid: &str, parent: &str, meta: &events::Metadata) {
        let Some(name) = events::meta_name(meta) else {
            warn!(uuid, "file event without a name");
            return;
        };
        let modtime = UNIX_EPOCH + Duration::from_secs(events::meta_last_modified(meta).max(0) as u64);
        let uuid = Uuid::from(uuid);
        let parent = self.remap_base(Uuid::from(parent));

        let local = {
            let mut db = self.os_db.lock().await;
            let Some(parent_path) = parent_path(&mut db, parent) else {
                warn!(%uuid, "file event below unknown parent");
                return;
            };
            db.create_file(uuid, parent, name, modtime, "");
            self.join_local(&parent_path, name)
        };

        let client = Arc::clone(&self.client);
        let executor = Arc::clone(&self.executor);
        let uuid = uuid.to_string();
        self.runner
            .schedule(async move {
                executor
                    .ensure_file(&local, modtime, "", move || async move {
                        Ok(client.open_download(&uuid).await?)
                    })
                    .await
            })
            .await;
    }

    async fn remove_local(&self, uuid: Uuid) {
        let path = self.os_db.lock().await.get_path(uuid);
        let Some(path) = path else {
            warn!(%uuid, "removal event for unknown entry");
            return;
        };
        let local = self.sync_dir.join(&path);
        info!(path = %local.display(), "removing local entry");
        if let Err(e) = self.executor.remove_path(&local).await {
            warn!(path = %local.display(), error = %e, "failed to remove local entry");
        }
        self.os_db.lock().await.remove(uuid);
    }

    async fn move_local(&self, uuid: Uuid, new_parent: Uuid, new_name: &str) {
        let new_parent = self.remap_base(new_parent);

        let (old_path, new_path) = {
            let mut db = self.os_db.lock().await;
            let Some(old_path) = db.get_path(uuid) else {
                warn!(%uuid, "move event for unknown entry");
                return;
            };
            db.move_node(uuid, new_parent, FileName::from(new_name));
            let Some(new_path) = db.get_path(uuid) else {
                warn!(%uuid, "entry vanished during move");
                return;
            };
            (old_path, new_path)
        };

        let old_local = self.sync_dir.join(&old_path);
        let new_local = self.sync_dir.join(&new_path);
        if let Some(parent) = new_local.parent() {
            if let Err(e) = self.executor.mkdir_all(parent).await {
                warn!(path = %new_local.display(), error = %e, "failed to create parent directories for move");
                return;
            }
        }
        info!(from = %old_local.display(), to = %new_local.display(), "moving local entry");
        if let Err(e) = self.executor.rename(&old_local, &new_local).await {
            warn!(from = %old_local.display(), to = %new_local.display(), error = %e, "failed to move local entry");
        }
    }

    async fn create_local_dir(&self, event: &events::FolderSubCreated) {
        let uuid = Uuid::from(&event.uuid);
        let parent = self.remap_base(Uuid::from(&event.parent));

        let local = {
            let mut db = self.os_db.lock().await;
            let Some(parent_path) = parent_path(&mut db, parent) else {
                warn!(%uuid, "folder event below unknown parent");
                return;
            };
            db.create_dir(uuid, parent, &event.name.name);
            self.join_local(&parent_path, &event.name.name)
        };

        if let Err(e) = self.executor.ensure_dir(&local).await {
            warn!(path = %local.display(), error = %e, "failed to create local directory");
        }
    }

    /// Children of the account's base folder live at the mirror root.
    fn remap_base(&self, uuid: Uuid) -> Uuid {
        if uuid == self.base_dir {
            Uuid::NIL
        } else {
            uuid
        }
    }

    fn join_local(&self, parent_path: &str, name: &str) -> PathBuf {
        if parent_path.is_empty() {
            self.sync_dir.join(name)
        } else {
            self.sync_dir.join(parent_path).join(name)
        }
    }
}

/// Root-relative path of a parent, where the nil parent is the mirror root.
fn parent_path(db: &mut FileTree, parent: Uuid) -> Option<String> {
    if parent.is_nil() {
        Some(String::new())
    } else {
        db.get_path(parent)
    }
}

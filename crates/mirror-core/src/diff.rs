//! Order-independent comparison of two file trees.
//!
//! Both node sets are snapshotted, sorted by uuid, and merge-walked; one
//! [`DiffItem`] is emitted per differing uuid, in ascending uuid order. That
//! order says nothing about the tree shape: an added directory may arrive
//! after the files it contains, so consumers must create missing path
//! prefixes themselves.

use tokio::sync::mpsc;

use crate::id::Uuid;
use crate::tree::FileTree;

/// Buffer between the producing walk and the consumer applying items.
const DIFF_BUFFER: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub enum DiffItem {
    /// Present only in the desired tree; path from the desired tree.
    Added { uuid: Uuid, path: String },
    /// Present only in the current tree; path from the current tree.
    Removed { uuid: Uuid, path: String },
    /// Present in both with differing modtime, parent, kind, or hash.
    Modified {
        uuid: Uuid,
        old_path: String,
        new_path: String,
    },
}

impl DiffItem {
    pub fn uuid(&self) -> Uuid {
        match self {
            DiffItem::Added { uuid, .. }
            | DiffItem::Removed { uuid, .. }
            | DiffItem::Modified { uuid, .. } => *uuid,
        }
    }
}

/// Compare `is` (current state) against `should` (desired state).
///
/// The walk runs on a spawned task over snapshots of both trees; items
/// stream through a bounded channel and the receiver may lag or drop
/// without affecting either source tree.
pub fn start_diff(is: &FileTree, should: &FileTree) -> mpsc::Receiver<DiffItem> {
    let (tx, rx) = mpsc::channel(DIFF_BUFFER);
    let is = is.clone();
    let should = should.clone();
    tokio::spawn(async move {
        diff_walk(is, should, tx).await;
    });
    rx
}

async fn diff_walk(mut is: FileTree, mut should: FileTree, tx: mpsc::Sender<DiffItem>) {
    let mut is_ids: Vec<Uuid> = is.uuids().collect();
    is_ids.sort_unstable();
    let mut should_ids: Vec<Uuid> = should.uuids().collect();
    should_ids.sort_unstable();

    let mut i = 0;
    let mut j = 0;
    while i < is_ids.len() && j < should_ids.len() {
        let is_id = is_ids[i];
        let should_id = should_ids[j];

        let item = if is_id == should_id {
            i += 1;
            j += 1;
            if nodes_differ(&is, &should, is_id) {
                Some(DiffItem::Modified {
                    uuid: is_id,
                    old_path: is.get_path(is_id).unwrap_or_default(),
                    new_path: should.get_path(is_id).unwrap_or_default(),
                })
            } else {
                None
            }
        } else if is_id < should_id {
            i += 1;
            Some(DiffItem::Removed {
                uuid: is_id,
                path: is.get_path(is_id).unwrap_or_default(),
            })
        } else {
            j += 1;
            Some(DiffItem::Added {
                uuid: should_id,
                path: should.get_path(should_id).unwrap_or_default(),
            })
        };

        if let Some(item) = item {
            if tx.send(item).await.is_err() {
                return;
            }
        }
    }

    while i < is_ids.len() {
        let uuid = is_ids[i];
        i += 1;
        let item = DiffItem::Removed {
            uuid,
            path: is.get_path(uuid).unwrap_or_default(),
        };
        if tx.send(item).await.is_err() {
            return;
        }
    }

    while j < should_ids.len() {
        let uuid = should_ids[j];
        j += 1;
        let item = DiffItem::Added {
            uuid,
            path: should.get_path(uuid).unwrap_or_default(),
        };
        if tx.send(item).await.is_err() {
            return;
        }
    }
}

fn nodes_differ(is: &FileTree, should: &FileTree, uuid: Uuid) -> bool {
    match (is.get_node(uuid), should.get_node(uuid)) {
        (Some(a), Some(b)) => {
            a.modtime != b.modtime
                || a.parent != b.parent
                || a.is_dir != b.is_dir
                || a.hash != b.hash
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::FileName;
    use std::time::UNIX_EPOCH;

    fn seed_tree() -> FileTree {
        let mut tree = FileTree::new();
        tree.create_dir(Uuid::from("dir1"), Uuid::NIL, "dir1");
        tree.create_dir(Uuid::from("dir2"), Uuid::from("dir1"), "dir2");
        tree.create_file(
            Uuid::from("file1"),
            Uuid::from("dir2"),
            "file1.txt",
            UNIX_EPOCH,
            &"aa".repeat(32),
        );
        tree
    }

    async fn collect(mut rx: mpsc::Receiver<DiffItem>) -> Vec<DiffItem> {
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn removed_file_emits_single_item() {
        let is = seed_tree();
        let mut should = seed_tree();
        should.remove(Uuid::from("file1"));

        let items = collect(start_diff(&is, &should)).await;
        assert_eq!(
            items,
            vec![DiffItem::Removed {
                uuid: Uuid::from("file1"),
                path: "dir1/dir2/file1.txt".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn removed_dir_emits_whole_subtree() {
        let is = seed_tree();
        let mut should = seed_tree();
        should.remove(Uuid::from("dir2"));

        let items = collect(start_diff(&is, &should)).await;
        assert_eq!(items.len(), 2);
        for item in &items {
            let DiffItem::Removed { uuid, path } = item else {
                panic!("expected Removed, got {item:?}");
            };
            assert!(
                (*uuid == Uuid::from("dir2") && path == "dir1/dir2")
                    || (*uuid == Uuid::from("file1") && path == "dir1/dir2/file1.txt")
            );
        }
        // ascending uuid order
        assert!(items[0].uuid() < items[1].uuid());
    }

    #[tokio::test]
    async fn moved_dir_emits_modified_with_both_paths() {
        let is = seed_tree();
        let mut should = seed_tree();
        should.move_node(Uuid::from("dir2"), Uuid::NIL, FileName::from("moved-dir"));

        let items = collect(start_diff(&is, &should)).await;
        assert_eq!(
            items,
            vec![DiffItem::Modified {
                uuid: Uuid::from("dir2"),
                old_path: "dir1/dir2".to_string(),
                new_path: "moved-dir".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn equal_trees_diff_empty() {
        let is = seed_tree();
        let should = seed_tree();
        assert!(collect(start_diff(&is, &should)).await.is_empty());
    }

    #[tokio::test]
    async fn added_into_empty_tree() {
        let is = FileTree::new();
        let should = seed_tree();

        let items = collect(start_diff(&is, &should)).await;
        assert_eq!(items.len(), 3);
        assert!(items
            .iter()
            .all(|item| matches!(item, DiffItem::Added { .. })));
        assert!(items.windows(2).all(|w| w[0].uuid() < w[1].uuid()));
    }

    #[tokio::test]
    async fn swapping_sides_flips_added_and_removed() {
        let full = seed_tree();
        let mut partial = seed_tree();
        partial.remove(Uuid::from("file1"));
        partial.create_file(
            Uuid::from("other"),
            Uuid::from("dir1"),
            "other.txt",
            UNIX_EPOCH,
            "",
        );

        let forward = collect(start_diff(&full, &partial)).await;
        let backward = collect(start_diff(&partial, &full)).await;
        assert_eq!(forward.len(), backward.len());

        for item in &forward {
            match item {
                DiffItem::Added { uuid, .. } => assert!(backward
                    .iter()
                    .any(|b| matches!(b, DiffItem::Removed { uuid: u, .. } if u == uuid))),
                DiffItem::Removed { uuid, .. } => assert!(backward
                    .iter()
                    .any(|b| matches!(b, DiffItem::Added { uuid: u, .. } if u == uuid))),
                DiffItem::Modified { uuid, .. } => assert!(backward
                    .iter()
                    .any(|b| matches!(b, DiffItem::Modified { uuid: u, .. } if u == uuid))),
            }
        }
    }

    #[tokio::test]
    async fn applying_every_item_converges_on_should() {
        let mut is = seed_tree();
        let mut should = seed_tree();
        should.remove(Uuid::from("file1"));
        should.create_file(
            Uuid::from("new-file"),
            Uuid::from("dir2"),
            "new.txt",
            UNIX_EPOCH,
            &"cc".repeat(32),
        );
        should.move_node(Uuid::from("dir2"), Uuid::NIL, FileName::from("dir2"));

        let items = collect(start_diff(&is, &should)).await;
        for item in items {
            match item {
                DiffItem::Added { uuid, .. } | DiffItem::Modified { uuid, .. } => {
                    let node = should.get_node(uuid).unwrap();
                    is.ensure_items([node]);
                }
                DiffItem::Removed { uuid, .. } => is.remove(uuid),
            }
        }

        assert_eq!(is.get_path_to_uuid_map(), should.get_path_to_uuid_map());
    }

    #[tokio::test]
    async fn modtime_change_is_modified() {
        let is = seed_tree();
        let mut should = seed_tree();
        should.set_modtime(
            Uuid::from("file1"),
            UNIX_EPOCH + std::time::Duration::from_secs(7),
        );

        let items = collect(start_diff(&is, &should)).await;
        assert_eq!(items.len(), 1);
        assert!(matches!(
            &items[0],
            DiffItem::Modified { uuid, old_path, new_path }
                if *uuid == Uuid::from("file1") && old_path == new_path
        ));
    }
}

//! In-memory tree database of the mirrored account.
//!
//! Nodes are stored index-based in a single map keyed by [`Uuid`]; parent
//! and child links are uuid fields resolved through the map, never
//! references. Paths are derived lazily and memoized per node; any rename
//! or re-parent drops the cache for the whole affected subtree.
//!
//! Invariants:
//! - a node's parent is either `Uuid::NIL` or a directory node in the same
//!   tree (a placeholder directory with an empty name is inserted when a
//!   child arrives before its parent, and overwritten once real data does),
//! - a uuid appears at most once,
//! - removing a directory removes its subtree.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::id::{ContentHash, FileName, Uuid};

/// Snapshot of a node's public fields, as stored and as returned by
/// [`FileTree::get_node`].
#[derive(Debug, Clone, PartialEq)]
pub struct FileTreeNode {
    pub uuid: Uuid,
    pub name: FileName,
    pub hash: ContentHash,
    pub modtime: SystemTime,
    pub is_dir: bool,
    pub parent: Uuid,
}

#[derive(Debug, Clone)]
struct NodeRecord {
    name: FileName,
    hash: ContentHash,
    modtime: SystemTime,
    is_dir: bool,
    parent: Uuid,
    children: Vec<Uuid>,
    path: Option<String>,
}

/// Mapping from uuid to node, with parent/child links materialized for path
/// derivation.
#[derive(Debug, Clone, Default)]
pub struct FileTree {
    nodes: HashMap<Uuid, NodeRecord>,
}

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace this tree's contents with a copy of `other`'s node set.
    pub fn copy_from(&mut self, other: &FileTree) {
        self.nodes = other.nodes.clone();
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, uuid: Uuid) -> bool {
        self.nodes.contains_key(&uuid)
    }

    pub fn uuids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.nodes.keys().copied()
    }

    /// Upsert each item, creating placeholder parents as needed. Feeding the
    /// same list twice yields an equal tree.
    pub fn ensure_items<I>(&mut self, items: I)
    where
        I: IntoIterator<Item = FileTreeNode>,
    {
        for item in items {
            self.upsert(item);
        }
    }

    pub fn create_file(
        &mut self,
        uuid: Uuid,
        parent: Uuid,
        name: &str,
        modtime: SystemTime,
        hash: &str,
    ) {
        self.upsert(FileTreeNode {
            uuid,
            name: FileName::from(name),
            hash: ContentHash::from_hex(hash),
            modtime,
            is_dir: false,
            parent,
        });
    }

    pub fn create_dir(&mut self, uuid: Uuid, parent: Uuid, name: &str) {
        self.upsert(FileTreeNode {
            uuid,
            name: FileName::from(name),
            hash: ContentHash::default(),
            modtime: UNIX_EPOCH,
            is_dir: true,
            parent,
        });
    }

    fn upsert(&mut self, item: FileTreeNode) {
        self.ensure_parent(item.parent);

        if let Some(existing) = self.nodes.get(&item.uuid) {
            let old_parent = existing.parent;
            self.invalidate_path_cache(item.uuid);
            if old_parent != item.parent {
                self.detach_child(old_parent, item.uuid);
            }
        }

        let attach = match self.nodes.get_mut(&item.uuid) {
            Some(node) => {
                let reparented = node.parent != item.parent;
                node.name = item.name;
                node.hash = item.hash;
                node.modtime = item.modtime;
                node.is_dir = item.is_dir;
                node.parent = item.parent;
                reparented
            }
            None => {
                self.nodes.insert(
                    item.uuid,
                    NodeRecord {
                        name: item.name,
                        hash: item.hash,
                        modtime: item.modtime,
                        is_dir: item.is_dir,
                        parent: item.parent,
                        children: Vec::new(),
                        path: None,
                    },
                );
                true
            }
        };

        if attach {
            self.attach_child(item.parent, item.uuid);
        }
    }

    /// Guarantee the parent of an incoming item is a directory in the tree.
    /// A missing parent, or one previously known as a file, becomes a
    /// placeholder directory with an empty name at the root; real data
    /// overwrites it when it arrives.
    fn ensure_parent(&mut self, parent: Uuid) {
        if parent.is_nil() {
            return;
        }
        let needs_placeholder = match self.nodes.get(&parent) {
            Some(node) => !node.is_dir,
            None => true,
        };
        if needs_placeholder {
            self.upsert(FileTreeNode {
                uuid: parent,
                name: FileName::default(),
                hash: ContentHash::default(),
                modtime: UNIX_EPOCH,
                is_dir: true,
                parent: Uuid::NIL,
            });
        }
    }

    fn attach_child(&mut self, parent: Uuid, child: Uuid) {
        if parent.is_nil() {
            return;
        }
        if let Some(node) = self.nodes.get_mut(&parent) {
            if !node.children.contains(&child) {
                node.children.push(child);
            }
        }
    }

    fn detach_child(&mut self, parent: Uuid, child: Uuid) {
        if parent.is_nil() {
            return;
        }
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.children.retain(|c| *c != child);
        }
    }

    /// Remove a node and its whole subtree. Missing uuids are a no-op.
    pub fn remove(&mut self, uuid: Uuid) {
        let Some(node) = self.nodes.remove(&uuid) else {
            return;
        };
        self.detach_child(node.parent, uuid);
        for child in node.children {
            self.remove_subtree(child);
        }
    }

    fn remove_subtree(&mut self, uuid: Uuid) {
        let Some(node) = self.nodes.remove(&uuid) else {
            return;
        };
        for child in node.children {
            self.remove_subtree(child);
        }
    }

    /// Re-parent and rename a node. Missing uuids are a no-op. The subtree's
    /// path cache is dropped before the links change.
    pub fn move_node(&mut self, uuid: Uuid, new_parent: Uuid, new_name: FileName) {
        if !self.nodes.contains_key(&uuid) {
            return;
        }
        self.invalidate_path_cache(uuid);

        let old_parent = self.nodes[&uuid].parent;
        if old_parent != new_parent {
            self.detach_child(old_parent, uuid);
        }
        self.ensure_parent(new_parent);

        if let Some(node) = self.nodes.get_mut(&uuid) {
            node.parent = new_parent;
            node.name = new_name;
        }

        if old_parent != new_parent {
            self.attach_child(new_parent, uuid);
        }
    }

    /// Update only the modtime. Paths are unaffected, so the cache survives.
    pub fn set_modtime(&mut self, uuid: Uuid, modtime: SystemTime) {
        if let Some(node) = self.nodes.get_mut(&uuid) {
            node.modtime = modtime;
        }
    }

    pub fn get_node(&self, uuid: Uuid) -> Option<FileTreeNode> {
        self.nodes.get(&uuid).map(|node| FileTreeNode {
            uuid,
            name: node.name.clone(),
            hash: node.hash,
            modtime: node.modtime,
            is_dir: node.is_dir,
            parent: node.parent,
        })
    }

    /// Root-rooted "/"-joined path of a node, memoized on the node and its
    /// ancestors.
    pub fn get_path(&mut self, uuid: Uuid) -> Option<String> {
        if !self.nodes.contains_key(&uuid) {
            return None;
        }
        Some(self.path_of(uuid))
    }

    fn path_of(&mut self, uuid: Uuid) -> String {
        if let Some(cached) = self.nodes.get(&uuid).and_then(|n| n.path.clone()) {
            return cached;
        }
        let (name, parent) = {
            let node = &self.nodes[&uuid];
            (node.name.to_string(), node.parent)
        };
        let path = if parent.is_nil() || !self.nodes.contains_key(&parent) {
            name
        } else {
            format!("{}/{}", self.path_of(parent), name)
        };
        if let Some(node) = self.nodes.get_mut(&uuid) {
            node.path = Some(path.clone());
        }
        path
    }

    fn invalidate_path_cache(&mut self, uuid: Uuid) {
        let children = match self.nodes.get_mut(&uuid) {
            Some(node) => {
                node.path = None;
                node.children.clone()
            }
            None => return,
        };
        for child in children {
            self.invalidate_path_cache(child);
        }
    }

    /// Ancestors of a node, root first, exclusive of the node itself.
    pub fn get_parents(&self, uuid: Uuid) -> Option<Vec<Uuid>> {
        let mut node = self.nodes.get(&uuid)?;
        let mut parents = Vec::new();
        while !node.parent.is_nil() {
            let parent = node.parent;
            parents.push(parent);
            match self.nodes.get(&parent) {
                Some(next) => node = next,
                None => break,
            }
        }
        parents.reverse();
        Some(parents)
    }

    /// Fresh mapping of every node's path to its uuid. Later tree mutations
    /// do not affect the returned map.
    pub fn get_path_to_uuid_map(&mut self) -> HashMap<String, Uuid> {
        let uuids: Vec<Uuid> = self.nodes.keys().copied().collect();
        let mut paths = HashMap::with_capacity(uuids.len());
        for uuid in uuids {
            paths.insert(self.path_of(uuid), uuid);
        }
        paths
    }
}

//! `DirectoryTree`: the lazily materialized, parent/child namespace over
//! [`Node`]s (§3, §4.5).
//!
//! Grounded on `original_source/src/data/DirectoryTree.h`: a flat
//! path→Node map plus a parent-path→pending-children multimap that lets the
//! tree grow out of LIST/HEAD order (a child can arrive before its parent).

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::node::{split_parent, Node, NodeId};

struct Inner {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    path_index: HashMap<String, NodeId>,
    /// parent-path -> child NodeIds whose parent hasn't been grown yet.
    orphans: HashMap<String, Vec<NodeId>>,
    root: NodeId,
}

pub struct DirectoryTree {
    inner: Mutex<Inner>,
}

impl DirectoryTree {
    pub fn new() -> Self {
        let root = Node::new("/");
        DirectoryTree {
            inner: Mutex::new(Inner {
                nodes: vec![Some(root)],
                free: Vec::new(),
                path_index: HashMap::from([("/".to_string(), 0)]),
                orphans: HashMap::new(),
                root: 0,
            }),
        }
    }

    pub async fn root(&self) -> NodeId {
        self.inner.lock().await.root
    }

    pub async fn find(&self, path: &str) -> Option<NodeId> {
        self.inner.lock().await.path_index.get(path).copied()
    }

    pub async fn has(&self, path: &str) -> bool {
        self.inner.lock().await.path_index.contains_key(path)
    }

    pub async fn path_of(&self, id: NodeId) -> Option<String> {
        self.inner.lock().await.nodes.get(id).and_then(|n| n.as_ref()).map(|n| n.path.clone())
    }

    pub async fn parent_of(&self, id: NodeId) -> Option<NodeId> {
        self.inner.lock().await.nodes.get(id).and_then(|n| n.as_ref()).and_then(|n| n.parent)
    }

    /// Immediate children's full paths (not recursive).
    pub async fn children_of(&self, dir_path: &str) -> Vec<String> {
        let inner = self.inner.lock().await;
        let Some(&id) = inner.path_index.get(dir_path) else {
            return Vec::new();
        };
        let node = inner.nodes[id].as_ref().expect("node present");
        node.children.values().filter_map(|&cid| inner.nodes[cid].as_ref()).map(|n| n.path.clone()).collect()
    }

    fn alloc(inner: &mut Inner, node: Node) -> NodeId {
        match inner.free.pop() {
            Some(idx) => {
                inner.nodes[idx] = Some(node);
                idx
            }
            None => {
                inner.nodes.push(Some(node));
                inner.nodes.len() - 1
            }
        }
    }

    fn link(inner: &mut Inner, id: NodeId, path: &str) {
        match split_parent(path) {
            None => {}
            Some((parent_path, name)) => match inner.path_index.get(&parent_path).copied() {
                Some(parent_id) => {
                    inner.nodes[id].as_mut().expect("node present").parent = Some(parent_id);
                    inner.nodes[parent_id].as_mut().expect("node present").children.insert(name, id);
                }
                None => {
                    inner.orphans.entry(parent_path).or_default().push(id);
                }
            },
        }
    }

    fn adopt_orphans(inner: &mut Inner, id: NodeId, path: &str) {
        let Some(pending) = inner.orphans.remove(path) else { return };
        for child_id in pending {
            if inner.nodes[child_id].is_none() {
                continue;
            }
            let child_path = inner.nodes[child_id].as_ref().expect("node present").path.clone();
            let Some((_, name)) = split_parent(&child_path) else { continue };
            inner.nodes[child_id].as_mut().expect("node present").parent = Some(id);
            inner.nodes[id].as_mut().expect("node present").children.insert(name, child_id);
        }
    }

    /// Create the Node for `path` if absent (a no-op returning the
    /// existing id otherwise), linking it to its parent or registering it
    /// as an orphan, then re-parenting any of its own children that
    /// arrived first (§4.5 Grow-by-metadata).
    pub async fn grow(&self, path: &str) -> NodeId {
        let mut inner = self.inner.lock().await;
        if let Some(&id) = inner.path_index.get(path) {
            return id;
        }
        let id = Self::alloc(&mut inner, Node::new(path));
        inner.path_index.insert(path.to_string(), id);
        Self::link(&mut inner, id, path);
        Self::adopt_orphans(&mut inner, id, path);
        id
    }

    pub async fn grow_many(&self, paths: &[String]) -> Vec<NodeId> {
        let mut ids = Vec::with_capacity(paths.len());
        for path in paths {
            ids.push(self.grow(path).await);
        }
        ids
    }

    /// Reconcile `dir_path`'s children against a freshly LISTed set: grow
    /// any new entries, and remove any existing child whose path is no
    /// longer present (§4.5 Update-directory). Returns the paths removed.
    pub async fn update_directory(&self, dir_path: &str, child_paths: &[String]) -> Vec<String> {
        let existing = self.children_of(dir_path).await;
        let incoming: std::collections::HashSet<&String> = child_paths.iter().collect();
        let mut removed = Vec::new();
        for path in existing {
            if !incoming.contains(&path) {
                removed.extend(self.remove(&path).await);
            }
        }
        self.grow_many(child_paths).await;
        removed
    }

    fn collect_subtree(inner: &Inner, id: NodeId, out: &mut Vec<NodeId>) {
        out.push(id);
        if let Some(node) = inner.nodes[id].as_ref() {
            for &child_id in node.children.values() {
                Self::collect_subtree(inner, child_id, out);
            }
        }
    }

    /// Recursively remove `path` and all descendants from the tree.
    /// Returns every removed path (graph-only; callers are responsible
    /// for evicting the corresponding MetaDataManager entries, which is
    /// how the original's destructor-triggered eviction callback is
    /// expressed here without a reference cycle).
    pub async fn remove(&self, path: &str) -> Vec<String> {
        let mut inner = self.inner.lock().await;
        let Some(&id) = inner.path_index.get(path) else {
            return Vec::new();
        };
        if let Some(parent_id) = inner.nodes[id].as_ref().and_then(|n| n.parent) {
            if let Some((_, name)) = split_parent(path) {
                if let Some(parent) = inner.nodes[parent_id].as_mut() {
                    parent.children.remove(&name);
                }
            }
        }

        let mut subtree = Vec::new();
        Self::collect_subtree(&inner, id, &mut subtree);

        let mut removed_paths = Vec::with_capacity(subtree.len());
        for node_id in &subtree {
            if let Some(node) = inner.nodes[*node_id].take() {
                inner.path_index.remove(&node.path);
                removed_paths.push(node.path);
            }
            inner.free.push(*node_id);
        }

        let removed_ids: std::collections::HashSet<NodeId> = subtree.into_iter().collect();
        for ids in inner.orphans.values_mut() {
            ids.retain(|id| !removed_ids.contains(id));
        }
        inner.orphans.retain(|_, ids| !ids.is_empty());

        removed_paths
    }

    /// Move `old` (and, if a directory, every descendant) under `new`.
    /// No-op (returns `false`) if `old` doesn't exist or `new` already
    /// does, mirroring the original's conservative no-clobber rename.
    pub async fn rename(&self, old: &str, new: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(&id) = inner.path_index.get(old) else { return false };
        if inner.path_index.contains_key(new) {
            return false;
        }

        if let Some(parent_id) = inner.nodes[id].as_ref().and_then(|n| n.parent) {
            if let Some((_, name)) = split_parent(old) {
                if let Some(parent) = inner.nodes[parent_id].as_mut() {
                    parent.children.remove(&name);
                }
            }
        }

        let mut subtree = Vec::new();
        Self::collect_subtree(&inner, id, &mut subtree);
        for node_id in subtree {
            let old_path = inner.nodes[node_id].as_ref().expect("node present").path.clone();
            let new_path = format!("{new}{}", &old_path[old.len()..]);
            inner.path_index.remove(&old_path);
            inner.path_index.insert(new_path.clone(), node_id);
            inner.nodes[node_id].as_mut().expect("node present").path = new_path;
        }

        Self::link(&mut inner, id, new);
        Self::adopt_orphans(&mut inner, id, new);
        true
    }
}

impl Default for DirectoryTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn grow_links_child_to_existing_parent() {
        let tree = DirectoryTree::new();
        tree.grow("/a/").await;
        tree.grow("/a/b").await;
        assert_eq!(tree.children_of("/a/").await, vec!["/a/b".to_string()]);
    }

    #[tokio::test]
    async fn child_arriving_before_parent_is_adopted_later() {
        let tree = DirectoryTree::new();
        tree.grow("/a/b").await;
        assert!(tree.children_of("/a/").await.is_empty());
        tree.grow("/a/").await;
        assert_eq!(tree.children_of("/a/").await, vec!["/a/b".to_string()]);
        let child_id = tree.find("/a/b").await.expect("child present");
        let parent_id = tree.find("/a/").await.expect("parent present");
        assert_eq!(tree.parent_of(child_id).await, Some(parent_id));
    }

    #[tokio::test]
    async fn update_directory_removes_stale_children() {
        let tree = DirectoryTree::new();
        tree.grow("/a/").await;
        tree.grow("/a/b").await;
        tree.grow("/a/c").await;
        let removed = tree.update_directory("/a/", &["/a/b".to_string()]).await;
        assert_eq!(removed, vec!["/a/c".to_string()]);
        assert!(!tree.has("/a/c").await);
        assert!(tree.has("/a/b").await);
    }

    #[tokio::test]
    async fn remove_is_recursive() {
        let tree = DirectoryTree::new();
        tree.grow("/a/").await;
        tree.grow("/a/b/").await;
        tree.grow("/a/b/c").await;
        let mut removed = tree.remove("/a/").await;
        removed.sort();
        assert_eq!(removed, vec!["/a/".to_string(), "/a/b/".to_string(), "/a/b/c".to_string()]);
        assert!(!tree.has("/a/b/c").await);
    }

    #[tokio::test]
    async fn rename_rewrites_descendant_paths() {
        let tree = DirectoryTree::new();
        tree.grow("/a/").await;
        tree.grow("/a/b").await;
        assert!(tree.rename("/a/", "/z/").await);
        assert!(tree.has("/z/").await);
        assert!(!tree.has("/a/").await);
        assert!(tree.has("/z/b").await);
    }

    #[tokio::test]
    async fn rename_to_existing_path_is_a_no_op() {
        let tree = DirectoryTree::new();
        tree.grow("/a").await;
        tree.grow("/b").await;
        assert!(!tree.rename("/a", "/b").await);
        assert!(tree.has("/a").await);
    }
}

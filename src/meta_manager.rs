//! `MetaDataManager`: an LRU-bounded `path -> FileMetaData` map coupled to
//! the [`DirectoryTree`] for eviction callbacks (§4.4).
//!
//! Grounded on `original_source/src/data/FileMetaDataManager.cpp`: a
//! doubly-linked list (MRU at the front) plus a path index, and the same
//! unevictable classes (root, open, dirty, directories, the target's own
//! parent) before falling back to growing the cap by 20%.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::DataError;
use crate::metadata::FileMetaData;
use crate::node::split_parent;
use crate::tree::DirectoryTree;

struct Slot {
    path: String,
    meta: FileMetaData,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Inner {
    slots: Vec<Option<Slot>>,
    free_slots: Vec<usize>,
    index: HashMap<String, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    max_count: usize,
}

impl Inner {
    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let slot = self.slots[idx].as_ref().expect("slot present");
            (slot.prev, slot.next)
        };
        match prev {
            Some(p) => self.slots[p].as_mut().expect("slot present").next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].as_mut().expect("slot present").prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let slot = self.slots[idx].as_mut().expect("slot present");
            slot.prev = None;
            slot.next = old_head;
        }
        if let Some(h) = old_head {
            self.slots[h].as_mut().expect("slot present").prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }

    fn remove_slot(&mut self, idx: usize) -> Slot {
        self.unlink(idx);
        let slot = self.slots[idx].take().expect("slot present");
        self.index.remove(&slot.path);
        self.free_slots.push(idx);
        slot
    }

    fn insert_front(&mut self, path: String, meta: FileMetaData) -> usize {
        let idx = match self.free_slots.pop() {
            Some(i) => {
                self.slots[i] = Some(Slot { path: path.clone(), meta, prev: None, next: None });
                i
            }
            None => {
                self.slots.push(Some(Slot { path: path.clone(), meta, prev: None, next: None }));
                self.slots.len() - 1
            }
        };
        self.push_front(idx);
        self.index.insert(path, idx);
        idx
    }
}

pub struct MetaDataManager {
    inner: Mutex<Inner>,
    tree: Arc<DirectoryTree>,
}

impl MetaDataManager {
    pub fn new(max_count: usize, tree: Arc<DirectoryTree>) -> Self {
        MetaDataManager {
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                free_slots: Vec::new(),
                index: HashMap::new(),
                head: None,
                tail: None,
                max_count,
            }),
            tree,
        }
    }

    pub async fn get(&self, path: &str) -> Option<FileMetaData> {
        let mut inner = self.inner.lock().await;
        let idx = *inner.index.get(path)?;
        inner.move_to_front(idx);
        Some(inner.slots[idx].as_ref().expect("slot present").meta.clone())
    }

    pub async fn has(&self, path: &str) -> bool {
        self.inner.lock().await.index.contains_key(path)
    }

    /// Insert or update `meta`'s entry, growing the cap by 20% (and
    /// logging) if eviction alone can't make room for a brand-new path.
    pub async fn add(&self, meta: FileMetaData) -> Result<(), DataError> {
        let path = meta.path.clone();
        {
            let mut inner = self.inner.lock().await;
            if let Some(&idx) = inner.index.get(&path) {
                inner.move_to_front(idx);
                inner.slots[idx].as_mut().expect("slot present").meta = meta;
                return Ok(());
            }
        }
        self.ensure_capacity(&path).await?;
        let mut inner = self.inner.lock().await;
        inner.insert_front(path, meta);
        Ok(())
    }

    /// Flip the unevictable `open` bit without disturbing LRU order.
    pub async fn set_open(&self, path: &str, open: bool) {
        let mut inner = self.inner.lock().await;
        if let Some(&idx) = inner.index.get(path) {
            inner.slots[idx].as_mut().expect("slot present").meta.open = open;
        }
    }

    /// Flip the `dirty` (needs-upload) bit without disturbing LRU order.
    pub async fn set_dirty(&self, path: &str, dirty: bool) {
        let mut inner = self.inner.lock().await;
        if let Some(&idx) = inner.index.get(path) {
            inner.slots[idx].as_mut().expect("slot present").meta.dirty = dirty;
        }
    }

    /// Apply an in-place edit to an existing entry (size/mtime/mode bumps)
    /// without touching LRU order. Returns `false` if the path is absent.
    pub async fn update(&self, path: &str, edit: impl FnOnce(&mut FileMetaData)) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.index.get(path).copied() {
            Some(idx) => {
                edit(&mut inner.slots[idx].as_mut().expect("slot present").meta);
                true
            }
            None => false,
        }
    }

    pub async fn erase(&self, path: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(&idx) = inner.index.get(path) {
            inner.remove_slot(idx);
        }
    }

    /// §4.4: old -> new entry, deleting any metadata object `new` used to
    /// have.
    pub async fn rename(&self, old: &str, new: &str) {
        if old == new {
            return;
        }
        let mut inner = self.inner.lock().await;
        if inner.index.contains_key(new) {
            return;
        }
        if let Some(idx) = inner.index.remove(old) {
            let slot = inner.slots[idx].as_mut().expect("slot present");
            slot.path = new.to_string();
            slot.meta.path = new.to_string();
            inner.index.insert(new.to_string(), idx);
            inner.move_to_front(idx);
        }
    }

    fn unevictable(path: &str, meta: &FileMetaData, protected_parent: &str) -> bool {
        path == "/" || meta.open || meta.dirty || meta.is_directory() || path == protected_parent
    }

    async fn ensure_capacity(&self, incoming_path: &str) -> Result<(), DataError> {
        let protected_parent = split_parent(incoming_path).map(|(parent, _)| parent).unwrap_or_default();

        if self.free_one(&protected_parent).await {
            return Ok(());
        }
        let (old, new) = {
            let mut inner = self.inner.lock().await;
            let old = inner.max_count;
            inner.max_count += inner.max_count / 5;
            (old, inner.max_count)
        };
        tracing::warn!(old_max = old, new_max = new, "metadata cache full, growing cap by 20%");
        if self.free_one(&protected_parent).await {
            Ok(())
        } else {
            Err(DataError::Full)
        }
    }

    /// If the manager is at (or over) capacity, evict one victim from the
    /// LRU tail, skipping the unevictable classes (§4.4). Returns true if
    /// there is now room (either nothing needed evicting, or a victim was
    /// found).
    async fn free_one(&self, protected_parent: &str) -> bool {
        let victim_path = {
            let inner = self.inner.lock().await;
            let resident = inner.slots.len().saturating_sub(inner.free_slots.len());
            if resident < inner.max_count {
                return true;
            }
            let mut cursor = inner.tail;
            let mut victim = None;
            while let Some(idx) = cursor {
                let slot = inner.slots[idx].as_ref().expect("slot present");
                if !Self::unevictable(&slot.path, &slot.meta, protected_parent) {
                    victim = Some(slot.path.clone());
                    break;
                }
                cursor = slot.prev;
            }
            victim
        };

        let Some(victim_path) = victim_path else {
            return false;
        };

        let removed = self.tree.remove(&victim_path).await;
        let mut inner = self.inner.lock().await;
        for path in &removed {
            if let Some(&idx) = inner.index.get(path) {
                inner.remove_slot(idx);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(path: &str) -> FileMetaData {
        FileMetaData::new_file(path, 0, 0, 0o644)
    }

    #[tokio::test]
    async fn add_then_get_round_trips() {
        let tree = Arc::new(DirectoryTree::new());
        let mgr = MetaDataManager::new(100, tree);
        mgr.add(meta("/a")).await.expect("add ok");
        assert!(mgr.get("/a").await.is_some());
    }

    #[tokio::test]
    async fn open_files_survive_eviction_pressure() {
        let tree = Arc::new(DirectoryTree::new());
        tree.grow("/").await;
        let mgr = MetaDataManager::new(2, tree.clone());
        let mut pinned = meta("/pinned");
        pinned.open = true;
        tree.grow("/pinned").await;
        mgr.add(pinned).await.expect("add ok");
        tree.grow("/b").await;
        mgr.add(meta("/b")).await.expect("add ok");
        tree.grow("/c").await;
        mgr.add(meta("/c")).await.expect("add ok");
        assert!(mgr.get("/pinned").await.is_some());
    }

    #[tokio::test]
    async fn rename_moves_entry() {
        let tree = Arc::new(DirectoryTree::new());
        let mgr = MetaDataManager::new(100, tree);
        mgr.add(meta("/old")).await.expect("add ok");
        mgr.rename("/old", "/new").await;
        assert!(mgr.get("/old").await.is_none());
        assert!(mgr.get("/new").await.is_some());
    }
}

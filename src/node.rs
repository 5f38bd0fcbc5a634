//! `Node`: one vertex of the [`crate::tree::DirectoryTree`] parent/child
//! graph (§3, §4.5).
//!
//! A Node carries only the graph shape — path, parent, children — and no
//! copy of [`crate::metadata::FileMetaData`]; attributes live in the
//! MetaDataManager and are joined back in by path, per §3's "cross-subsystem
//! references are by path-key lookup, never by pointer."

use std::collections::HashMap;

pub type NodeId = usize;

pub struct Node {
    pub path: String,
    pub parent: Option<NodeId>,
    /// Child basename -> child NodeId.
    pub children: HashMap<String, NodeId>,
}

impl Node {
    pub fn new(path: impl Into<String>) -> Self {
        Node { path: path.into(), parent: None, children: HashMap::new() }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Split `/a/b/c` into (`/a/b/`, `c`); a directory path `/a/b/` splits into
/// (`/a/`, `b`). Returns `None` for the root itself.
pub fn split_parent(path: &str) -> Option<(String, String)> {
    if path == "/" {
        return None;
    }
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    let parent = &trimmed[..=idx];
    let name = &trimmed[idx + 1..];
    Some((parent.to_string(), name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_file_path() {
        assert_eq!(split_parent("/a/b/c"), Some(("/a/b/".to_string(), "c".to_string())));
    }

    #[test]
    fn splits_directory_path() {
        assert_eq!(split_parent("/a/b/"), Some(("/a/".to_string(), "b".to_string())));
    }

    #[test]
    fn root_has_no_parent() {
        assert_eq!(split_parent("/"), None);
    }

    #[test]
    fn top_level_entry_parents_at_root() {
        assert_eq!(split_parent("/a"), Some(("/".to_string(), "a".to_string())));
    }
}

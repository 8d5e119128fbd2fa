//! Bidirectional inode ↔ path mapping for the FUSE adapter
//!
//! The kernel addresses nodes by 64-bit inode while the backend only knows
//! paths. Inodes are handed out on first lookup and stay stable for the life
//! of the mount unless the path is unlinked.

use std::collections::HashMap;

use common::kv::{normalize_path, parent_path};

#[derive(Debug)]
pub struct InodeTable {
    path_to_inode: HashMap<String, u64>,
    inode_to_path: HashMap<u64, String>,
    next_inode: u64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    /// Root inode number (always 1 in FUSE)
    pub const ROOT_INODE: u64 = 1;

    pub fn new() -> Self {
        let mut table = Self {
            path_to_inode: HashMap::new(),
            inode_to_path: HashMap::new(),
            next_inode: Self::ROOT_INODE + 1,
        };
        table.path_to_inode.insert("/".to_string(), Self::ROOT_INODE);
        table.inode_to_path.insert(Self::ROOT_INODE, "/".to_string());
        table
    }

    pub fn get_or_create(&mut self, path: &str) -> u64 {
        let normalized = normalize_path(path);
        if let Some(&inode) = self.path_to_inode.get(&normalized) {
            return inode;
        }

        let inode = self.next_inode;
        self.next_inode += 1;
        self.path_to_inode.insert(normalized.clone(), inode);
        self.inode_to_path.insert(inode, normalized);
        inode
    }

    pub fn get_inode(&self, path: &str) -> Option<u64> {
        self.path_to_inode.get(&normalize_path(path)).copied()
    }

    pub fn get_path(&self, inode: u64) -> Option<&str> {
        self.inode_to_path.get(&inode).map(String::as_str)
    }

    /// Path of `name` inside the directory `parent`
    pub fn child_path(&self, parent: u64, name: &str) -> Option<String> {
        let parent = self.get_path(parent)?;
        Some(if parent == "/" {
            format!("/{}", name)
        } else {
            format!("{}/{}", parent, name)
        })
    }

    /// Inode of the directory containing `inode`; the root is its own parent
    pub fn parent_inode(&mut self, inode: u64) -> u64 {
        match self.get_path(inode) {
            Some(path) => {
                let parent = parent_path(path);
                self.get_or_create(&parent)
            }
            None => Self::ROOT_INODE,
        }
    }

    /// Forget a path; the root is never removed
    pub fn remove_by_path(&mut self, path: &str) -> Option<u64> {
        let normalized = normalize_path(path);
        if normalized == "/" {
            return None;
        }
        let inode = self.path_to_inode.remove(&normalized)?;
        self.inode_to_path.remove(&inode);
        Some(inode)
    }

    pub fn len(&self) -> usize {
        self.inode_to_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inode_to_path.is_empty()
    }
}

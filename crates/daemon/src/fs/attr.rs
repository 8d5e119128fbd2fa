use std::time::SystemTime;

use common::{Node, NodeType};

/// Directories are read + search for everyone
pub const DIR_PERM: u16 = 0o555;
/// Files are read-only for everyone
pub const FILE_PERM: u16 = 0o444;

/// Attributes reported for one node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAttr {
    pub kind: NodeType,
    pub perm: u16,
    /// Byte length of the value, zero for directories
    pub size: u64,
    /// The backend exposes no creation time; this is the mount's start
    pub crtime: SystemTime,
    /// Last observed change, else the mount's start
    pub mtime: SystemTime,
}

impl NodeAttr {
    pub fn root(started_at: SystemTime) -> Self {
        Self {
            kind: NodeType::Directory,
            perm: DIR_PERM,
            size: 0,
            crtime: started_at,
            mtime: started_at,
        }
    }

    pub fn for_node(node: &Node, started_at: SystemTime, mtime: SystemTime) -> Self {
        match node.node_type {
            NodeType::Directory => Self {
                mtime,
                ..Self::root(started_at)
            },
            NodeType::File => Self {
                kind: NodeType::File,
                perm: FILE_PERM,
                size: node.value.len() as u64,
                crtime: started_at,
                mtime,
            },
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeType::Directory
    }
}

/// One entry of a directory enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Final path segment of the child
    pub name: String,
    pub kind: NodeType,
}

impl DirEntry {
    pub fn from_node(node: &Node) -> Self {
        Self {
            name: node.name().to_string(),
            kind: node.node_type,
        }
    }
}

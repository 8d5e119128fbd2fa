use std::fmt;

use serde::{Deserialize, Serialize};

/// Whether a node is an interior prefix or a leaf key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Directory,
    File,
}

/// One entry in the key-value namespace
///
/// `path` is always absolute and `/`-delimited, whatever the backend's native
/// key format. `value` is meaningless for directories and left empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub path: String,
    pub value: String,
    pub node_type: NodeType,
}

impl Node {
    pub fn file(path: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            value: value.into(),
            node_type: NodeType::File,
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            value: String::new(),
            node_type: NodeType::Directory,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.node_type == NodeType::Directory
    }

    pub fn is_file(&self) -> bool {
        !self.is_dir()
    }

    /// Final path segment, empty for the root
    pub fn name(&self) -> &str {
        let trimmed = self.path.trim_end_matches('/');
        match trimmed.rfind('/') {
            Some(pos) => &trimmed[pos + 1..],
            None => trimmed,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "path: {}, value: {}, type: {:?}",
            self.path, self.value, self.node_type
        )
    }
}

/// The kind of mutation a watch observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    #[default]
    Unknown,
    Changed,
    Deleted,
}

/// A mutation observed on the backend by a watch loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeChange {
    /// The affected node; `path` is always set, `value` when the backend sent one
    pub node: Node,
    pub operation: Operation,
}

impl NodeChange {
    pub fn changed(node: Node) -> Self {
        Self {
            node,
            operation: Operation::Changed,
        }
    }

    pub fn deleted(path: impl Into<String>) -> Self {
        Self {
            node: Node::file(path, ""),
            operation: Operation::Deleted,
        }
    }
}

/// Normalize a key to an absolute path: leading slash, no trailing slash
pub fn normalize_path(path: &str) -> String {
    let path = path.trim().trim_matches('/');
    if path.is_empty() {
        return "/".to_string();
    }
    format!("/{}", path)
}

/// Parent of a normalized path; the root is its own parent
pub fn parent_path(path: &str) -> String {
    let normalized = normalize_path(path);
    match normalized.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(pos) => normalized[..pos].to_string(),
    }
}

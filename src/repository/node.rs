//! A minimal ZooKeeper-style hierarchical store interface.
//!
//! [`NodeStore`] captures the handful of coordination-service calls the
//! hierarchical repository needs: persistent nodes addressed by `/`-separated
//! paths, each carrying opaque data and a version that the service bumps on
//! every data write. Conditional writes and deletes take the expected version
//! and fail with [`NodeError::BadVersion`] when it no longer matches.
//!
//! [`MemoryNodeStore`] implements the interface in process. Clones share
//! their nodes, so several repositories built on clones of one store behave
//! like coordinator replicas connected to the same ensemble.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use crate::errors::TccError;

/// Metadata returned alongside node data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStat {
    /// Data version, starts at 0 when the node is created.
    pub version: i32,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("no node at {0}")]
    NoNode(String),

    #[error("node already exists at {0}")]
    NodeExists(String),

    #[error("bad version at {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: i32,
        actual: i32,
    },

    #[error("node {0} has children")]
    NotEmpty(String),

    #[error("invalid path {0:?}")]
    InvalidPath(String),

    #[error("connection lost: {0}")]
    ConnectionLoss(String),
}

impl From<NodeError> for TccError {
    fn from(e: NodeError) -> Self {
        TccError::Storage(e.to_string())
    }
}

/// Client interface of a hierarchical coordination service.
pub trait NodeStore: Send + Sync + Debug {
    /// Creates `path` and any missing ancestors with empty data. Existing
    /// nodes along the way are left untouched.
    fn ensure_path(&self, path: &str) -> Result<(), NodeError>;

    /// Creates a persistent node. The parent must exist.
    fn create(&self, path: &str, data: Vec<u8>) -> Result<(), NodeError>;

    fn get_data(&self, path: &str) -> Result<(Vec<u8>, NodeStat), NodeError>;

    /// Replaces node data. With `Some(version)` the write only happens if the
    /// node is still at that version.
    fn set_data(&self, path: &str, data: Vec<u8>, expected: Option<i32>)
    -> Result<NodeStat, NodeError>;

    /// Deletes a childless node, conditionally when `expected` is given.
    fn delete(&self, path: &str, expected: Option<i32>) -> Result<(), NodeError>;

    /// Names (not full paths) of the direct children of `path`, sorted.
    fn get_children(&self, path: &str) -> Result<Vec<String>, NodeError>;
}

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    version: i32,
}

/// In-process [`NodeStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryNodeStore {
    nodes: Arc<Mutex<BTreeMap<String, Node>>>,
    unavailable: Arc<AtomicBool>,
}

fn validate_path(path: &str) -> Result<(), NodeError> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') || path.contains("//") {
        return Err(NodeError::InvalidPath(path.to_string()));
    }
    Ok(())
}

fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

fn child_name<'a>(parent: &str, path: &'a str) -> Option<&'a str> {
    if parent_of(path)? != parent {
        return None;
    }
    path.rsplit('/').next()
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates losing (or regaining) the connection to the ensemble. While
    /// unavailable every call fails with [`NodeError::ConnectionLoss`].
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check_connection(&self) -> Result<(), NodeError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(NodeError::ConnectionLoss("store marked unavailable".to_string()));
        }
        Ok(())
    }

    fn node_exists(nodes: &BTreeMap<String, Node>, path: &str) -> bool {
        path == "/" || nodes.contains_key(path)
    }
}

impl NodeStore for MemoryNodeStore {
    fn ensure_path(&self, path: &str) -> Result<(), NodeError> {
        self.check_connection()?;
        validate_path(path)?;
        let mut nodes = self.nodes.lock();
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            nodes.entry(current.clone()).or_insert(Node {
                data: Vec::new(),
                version: 0,
            });
        }
        Ok(())
    }

    fn create(&self, path: &str, data: Vec<u8>) -> Result<(), NodeError> {
        self.check_connection()?;
        validate_path(path)?;
        let mut nodes = self.nodes.lock();
        if Self::node_exists(&nodes, path) {
            return Err(NodeError::NodeExists(path.to_string()));
        }
        let parent = parent_of(path).ok_or_else(|| NodeError::InvalidPath(path.to_string()))?;
        if !Self::node_exists(&nodes, parent) {
            return Err(NodeError::NoNode(parent.to_string()));
        }
        nodes.insert(path.to_string(), Node { data, version: 0 });
        Ok(())
    }

    fn get_data(&self, path: &str) -> Result<(Vec<u8>, NodeStat), NodeError> {
        self.check_connection()?;
        validate_path(path)?;
        let nodes = self.nodes.lock();
        nodes
            .get(path)
            .map(|node| (node.data.clone(), NodeStat { version: node.version }))
            .ok_or_else(|| NodeError::NoNode(path.to_string()))
    }

    fn set_data(
        &self,
        path: &str,
        data: Vec<u8>,
        expected: Option<i32>,
    ) -> Result<NodeStat, NodeError> {
        self.check_connection()?;
        validate_path(path)?;
        let mut nodes = self.nodes.lock();
        let node = nodes
            .get_mut(path)
            .ok_or_else(|| NodeError::NoNode(path.to_string()))?;
        if let Some(expected) = expected {
            if node.version != expected {
                return Err(NodeError::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: node.version,
                });
            }
        }
        node.data = data;
        node.version = node.version.wrapping_add(1);
        Ok(NodeStat {
            version: node.version,
        })
    }

    fn delete(&self, path: &str, expected: Option<i32>) -> Result<(), NodeError> {
        self.check_connection()?;
        validate_path(path)?;
        let mut nodes = self.nodes.lock();
        let version = nodes
            .get(path)
            .map(|node| node.version)
            .ok_or_else(|| NodeError::NoNode(path.to_string()))?;
        if let Some(expected) = expected {
            if version != expected {
                return Err(NodeError::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: version,
                });
            }
        }
        if nodes.keys().any(|key| child_name(path, key).is_some()) {
            return Err(NodeError::NotEmpty(path.to_string()));
        }
        nodes.remove(path);
        Ok(())
    }

    fn get_children(&self, path: &str) -> Result<Vec<String>, NodeError> {
        self.check_connection()?;
        validate_path(path)?;
        let nodes = self.nodes.lock();
        if !Self::node_exists(&nodes, path) {
            return Err(NodeError::NoNode(path.to_string()));
        }
        Ok(nodes
            .keys()
            .filter_map(|key| child_name(path, key))
            .map(str::to_string)
            .collect())
    }
}

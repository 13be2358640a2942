//! [`NodeStore`] over a live ZooKeeper ensemble.

use std::fmt;
use std::time::Duration;

use ::zookeeper::{Acl, CreateMode, WatchedEvent, Watcher, ZkError, ZooKeeper};
use log::{debug, info};

use crate::errors::{Result, TccError};
use crate::repository::node::{NodeError, NodeStat, NodeStore};

struct SessionWatcher;

impl Watcher for SessionWatcher {
    fn handle(&self, event: WatchedEvent) {
        debug!("zookeeper session event: {:?}", event.keeper_state);
    }
}

/// Persistent, open-ACL nodes on a ZooKeeper session.
///
/// The session reconnects on its own; calls made while it is down surface as
/// [`NodeError::ConnectionLoss`], which the repository reports as a storage
/// error for the record at hand.
pub struct ZkNodeStore {
    zk: ZooKeeper,
    connect_string: String,
}

impl fmt::Debug for ZkNodeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZkNodeStore")
            .field("connect_string", &self.connect_string)
            .finish()
    }
}

impl ZkNodeStore {
    /// Opens a session, e.g. `connect("zk1:2181,zk2:2181", Duration::from_secs(15))`.
    pub fn connect(connect_string: &str, session_timeout: Duration) -> Result<Self> {
        let zk = ZooKeeper::connect(connect_string, session_timeout, SessionWatcher).map_err(|e| {
            TccError::Storage(format!("cannot connect to {}: {:?}", connect_string, e))
        })?;
        info!("connected to zookeeper at {}", connect_string);
        Ok(Self {
            zk,
            connect_string: connect_string.to_string(),
        })
    }

    pub fn connect_string(&self) -> &str {
        &self.connect_string
    }
}

impl Drop for ZkNodeStore {
    fn drop(&mut self) {
        if let Err(e) = self.zk.close() {
            debug!("closing zookeeper session failed: {:?}", e);
        }
    }
}

fn node_error(path: &str, expected: Option<i32>, e: ZkError) -> NodeError {
    match e {
        ZkError::NoNode => NodeError::NoNode(path.to_string()),
        ZkError::NodeExists => NodeError::NodeExists(path.to_string()),
        // The service does not report the node's current version.
        ZkError::BadVersion => NodeError::BadVersion {
            path: path.to_string(),
            expected: expected.unwrap_or(-1),
            actual: -1,
        },
        ZkError::NotEmpty => NodeError::NotEmpty(path.to_string()),
        ZkError::BadArguments => NodeError::InvalidPath(path.to_string()),
        other => NodeError::ConnectionLoss(format!("{:?} at {}", other, path)),
    }
}

fn validate_path(path: &str) -> std::result::Result<(), NodeError> {
    if !path.starts_with('/') || (path.len() > 1 && path.ends_with('/')) || path.contains("//") {
        return Err(NodeError::InvalidPath(path.to_string()));
    }
    Ok(())
}

impl NodeStore for ZkNodeStore {
    fn ensure_path(&self, path: &str) -> std::result::Result<(), NodeError> {
        validate_path(path)?;
        let mut current = String::with_capacity(path.len());
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            match self.zk.create(
                &current,
                Vec::new(),
                Acl::open_unsafe().clone(),
                CreateMode::Persistent,
            ) {
                Ok(_) | Err(ZkError::NodeExists) => {}
                Err(e) => return Err(node_error(&current, None, e)),
            }
        }
        Ok(())
    }

    fn create(&self, path: &str, data: Vec<u8>) -> std::result::Result<(), NodeError> {
        validate_path(path)?;
        self.zk
            .create(path, data, Acl::open_unsafe().clone(), CreateMode::Persistent)
            .map(|_| ())
            .map_err(|e| node_error(path, None, e))
    }

    fn get_data(&self, path: &str) -> std::result::Result<(Vec<u8>, NodeStat), NodeError> {
        validate_path(path)?;
        let (data, stat) = self
            .zk
            .get_data(path, false)
            .map_err(|e| node_error(path, None, e))?;
        Ok((data, NodeStat { version: stat.version }))
    }

    fn set_data(
        &self,
        path: &str,
        data: Vec<u8>,
        expected: Option<i32>,
    ) -> std::result::Result<NodeStat, NodeError> {
        validate_path(path)?;
        let stat = self
            .zk
            .set_data(path, data, expected)
            .map_err(|e| node_error(path, expected, e))?;
        Ok(NodeStat { version: stat.version })
    }

    fn delete(&self, path: &str, expected: Option<i32>) -> std::result::Result<(), NodeError> {
        validate_path(path)?;
        self.zk
            .delete(path, expected)
            .map_err(|e| node_error(path, expected, e))
    }

    fn get_children(&self, path: &str) -> std::result::Result<Vec<String>, NodeError> {
        validate_path(path)?;
        let mut children = self
            .zk
            .get_children(path, false)
            .map_err(|e| node_error(path, None, e))?;
        children.sort();
        Ok(children)
    }
}

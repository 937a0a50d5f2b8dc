// src/master/registry.rs

//! Registered worker bookkeeping.
//!
//! An entry lives exactly as long as its connection: added by
//! `register-worker`, dropped by the connection-close callback.

use crate::net::connection::Connection;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct WorkerEntry {
    pub conn: Arc<Connection>,
    pub targets: Vec<String>,
    pub name: Option<String>,
}

impl WorkerEntry {
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.conn.peer().to_string(),
        }
    }

    pub fn serves(&self, target: &str) -> bool {
        self.targets.iter().any(|t| t == target)
    }
}

#[derive(Default)]
pub struct Registry {
    workers: Vec<WorkerEntry>,
}

impl Registry {
    pub fn add(&mut self, entry: WorkerEntry) {
        info!(
            worker = %entry.display_name(),
            targets = ?entry.targets,
            "worker registered"
        );
        self.workers.push(entry);
    }

    /// Drop the entry bound to a closed connection.
    pub fn remove_conn(&mut self, conn_id: u64) -> bool {
        let before = self.workers.len();
        self.workers.retain(|entry| entry.conn.id() != conn_id);
        let removed = self.workers.len() < before;
        if removed {
            info!(conn_id, "worker unregistered");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerEntry> {
        self.workers.iter()
    }

    /// Every worker advertising the given target.
    pub fn serving(&self, target: &str) -> Vec<&WorkerEntry> {
        self.workers.iter().filter(|entry| entry.serves(target)).collect()
    }

    /// Whether any worker advertises the given target.
    pub fn serves(&self, target: &str) -> bool {
        self.workers.iter().any(|entry| entry.serves(target))
    }
}

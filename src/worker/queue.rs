// src/worker/queue.rs

//! Per-target work queues.
//!
//! Each target is a named queue with a concurrency limit and a pause flag.
//! `length` counts queued plus in-flight jobs. Dispatch is FIFO within a
//! target; there is no ordering across targets. Pausing stops new
//! dispatches without touching jobs already running.

use crate::config::validate_target;
use crate::error::{Error, Result};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug)]
pub struct TargetQueue {
    concurrency: u32,
    paused: bool,
    queued: VecDeque<u64>,
    inflight: usize,
}

impl TargetQueue {
    fn new(concurrency: u32) -> Self {
        Self { concurrency, paused: false, queued: VecDeque::new(), inflight: 0 }
    }

    pub fn len(&self) -> usize {
        self.queued.len() + self.inflight
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn concurrency(&self) -> u32 {
        self.concurrency
    }

    /// Whether a poll for this target could lead to new work running.
    pub fn has_slack(&self) -> bool {
        !self.paused && self.len() < self.concurrency as usize
    }

    fn pop_ready(&mut self) -> Option<u64> {
        if self.paused || self.inflight >= self.concurrency as usize {
            return None;
        }
        let id = self.queued.pop_front()?;
        self.inflight += 1;
        Some(id)
    }
}

/// Wire shape of one target in a `status` reply.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TargetStatus {
    pub paused: bool,
    pub concurrency: u32,
    pub length: usize,
}

/// The set of targets a worker serves.
#[derive(Debug, Default)]
pub struct TargetQueues {
    targets: BTreeMap<String, TargetQueue>,
}

impl TargetQueues {
    pub fn new(config: &BTreeMap<String, u32>) -> Self {
        let targets = config
            .iter()
            .map(|(name, concurrency)| (name.clone(), TargetQueue::new(*concurrency)))
            .collect();
        Self { targets }
    }

    pub fn contains(&self, target: &str) -> bool {
        self.targets.contains_key(target)
    }

    pub fn names(&self) -> Vec<String> {
        self.targets.keys().cloned().collect()
    }

    pub fn get(&self, target: &str) -> Option<&TargetQueue> {
        self.targets.get(target)
    }

    pub fn add(&mut self, target: &str, concurrency: u32) -> Result<()> {
        validate_target(target, concurrency)?;
        if self.targets.contains_key(target) {
            return Err(Error::Validation(format!("target '{target}' already exists")));
        }
        self.targets.insert(target.to_string(), TargetQueue::new(concurrency));
        Ok(())
    }

    pub fn remove(&mut self, target: &str) -> Result<()> {
        let queue = self.require(target)?;
        if !queue.is_empty() {
            return Err(Error::Validation(format!("target '{target}' queue is not empty")));
        }
        self.targets.remove(target);
        Ok(())
    }

    pub fn set_concurrency(&mut self, target: &str, concurrency: u32) -> Result<()> {
        validate_target(target, concurrency)?;
        self.require_mut(target)?.concurrency = concurrency;
        Ok(())
    }

    pub fn set_paused(&mut self, target: &str, paused: bool) -> Result<()> {
        self.require_mut(target)?.paused = paused;
        Ok(())
    }

    pub fn push(&mut self, target: &str, id: u64) -> Result<()> {
        self.require_mut(target)?.queued.push_back(id);
        Ok(())
    }

    /// A job on `target` finished, freeing its slot.
    pub fn finish(&mut self, target: &str) {
        if let Some(queue) = self.targets.get_mut(target) {
            queue.inflight = queue.inflight.saturating_sub(1);
        }
    }

    /// Pop every job that may start right now, across all targets.
    pub fn take_dispatchable(&mut self) -> Vec<(String, u64)> {
        let mut ready = Vec::new();
        for (name, queue) in self.targets.iter_mut() {
            while let Some(id) = queue.pop_ready() {
                ready.push((name.clone(), id));
            }
        }
        ready
    }

    /// Pop every job that may start right now on one target.
    pub fn take_dispatchable_for(&mut self, target: &str) -> Vec<(String, u64)> {
        let mut ready = Vec::new();
        if let Some(queue) = self.targets.get_mut(target) {
            while let Some(id) = queue.pop_ready() {
                ready.push((target.to_string(), id));
            }
        }
        ready
    }

    pub fn status(&self) -> BTreeMap<String, TargetStatus> {
        self.targets
            .iter()
            .map(|(name, queue)| {
                (
                    name.clone(),
                    TargetStatus {
                        paused: queue.paused,
                        concurrency: queue.concurrency,
                        length: queue.len(),
                    },
                )
            })
            .collect()
    }

    fn require(&self, target: &str) -> Result<&TargetQueue> {
        self.targets
            .get(target)
            .ok_or_else(|| Error::Validation(format!("invalid target '{target}'")))
    }

    fn require_mut(&mut self, target: &str) -> Result<&mut TargetQueue> {
        self.targets
            .get_mut(target)
            .ok_or_else(|| Error::Validation(format!("invalid target '{target}'")))
    }
}

// src/worker/scheduler.rs

//! The polling scheduler.
//!
//! External pokes and internal completions both funnel into `poll()`, which
//! keeps exactly one claim cycle in flight: a `polling` flag guards
//! reentrancy and a `nextpoll` backlog set captures everything requested
//! while a cycle runs. The flag, the backlog, and the queue set live under
//! one lock so request handlers and completion callbacks never observe them
//! out of step. No lock is held across a storage round-trip.
//!
//! Manual runs go through the same claim transaction but select by id and
//! expect `manual` rows; the caller logically blocks on a one-shot waiter
//! per id that is fulfilled when the job finishes.

use crate::config::LauncherSection;
use crate::error::{Error, Result};
use crate::store::{JobStore, ManualOutcome};
use crate::worker::queue::{TargetQueues, TargetStatus};
use crate::worker::runner::{JobReport, run_job};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Accumulated poll requests: a set of target names plus an "everything"
/// sentinel.
#[derive(Debug, Default)]
pub struct PollSet {
    all: bool,
    targets: HashSet<String>,
}

impl PollSet {
    pub fn union<I, T>(&mut self, targets: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        if self.all {
            return;
        }
        self.targets.extend(targets.into_iter().map(Into::into));
    }

    pub fn set_all(&mut self) {
        self.all = true;
        self.targets.clear();
    }

    pub fn clear(&mut self) {
        self.all = false;
        self.targets.clear();
    }

    pub fn is_empty(&self) -> bool {
        !self.all && self.targets.is_empty()
    }

    /// Expand to concrete target names, dropping anything no longer served.
    pub fn resolve(&self, queues: &TargetQueues) -> Vec<String> {
        if self.all {
            return queues.names();
        }
        let mut targets: Vec<String> =
            self.targets.iter().filter(|t| queues.contains(t)).cloned().collect();
        targets.sort();
        targets
    }
}

struct SchedulerInner {
    queues: TargetQueues,
    nextpoll: PollSet,
    polling: bool,
}

pub struct Scheduler {
    store: Arc<dyn JobStore>,
    launcher: LauncherSection,
    fetch_limit: u32,
    inner: Mutex<SchedulerInner>,
    waiters: Mutex<HashMap<u64, oneshot::Sender<JobReport>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        launcher: LauncherSection,
        fetch_limit: u32,
        targets: &BTreeMap<String, u32>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            launcher,
            fetch_limit,
            inner: Mutex::new(SchedulerInner {
                queues: TargetQueues::new(targets),
                nextpoll: PollSet::default(),
                polling: false,
            }),
            waiters: Mutex::new(HashMap::new()),
        })
    }

    pub fn target_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().queues.names()
    }

    pub fn status(&self) -> BTreeMap<String, TargetStatus> {
        self.inner.lock().unwrap().queues.status()
    }

    /// Outstanding manual-run completion waiters.
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }

    /// Handle an external poll request: validate, record the backlog, and
    /// drive a polling cycle. Storage errors surface to the caller.
    pub async fn poll_requested(self: Arc<Self>, targets: Option<Vec<String>>) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            match &targets {
                None => inner.nextpoll.set_all(),
                Some(list) => {
                    if list.is_empty() {
                        return Err(Error::Validation("empty targets list".to_string()));
                    }
                    for target in list {
                        if !inner.queues.contains(target) {
                            return Err(Error::Validation(format!("invalid target '{target}'")));
                        }
                    }
                    inner.nextpoll.union(list.iter().cloned());
                }
            }
        }
        self.poll().await
    }

    /// One polling cycle, repeated while the backlog refills.
    pub async fn poll(self: Arc<Self>) -> Result<()> {
        loop {
            let (targets, served) = {
                let mut inner = self.inner.lock().unwrap();
                let targets = inner.nextpoll.resolve(&inner.queues);
                if targets.is_empty() {
                    return Ok(());
                }
                if inner.polling {
                    // The running cycle will pick the backlog up.
                    return Ok(());
                }
                let has_slack = targets
                    .iter()
                    .any(|t| inner.queues.get(t).is_some_and(|q| q.has_slack()));
                if !has_slack {
                    // A completion will retrigger us; keep the backlog.
                    return Ok(());
                }
                inner.polling = true;
                inner.nextpoll.clear();
                let served: HashSet<String> = inner.queues.names().into_iter().collect();
                (targets, served)
            };

            debug!(?targets, "claiming waiting jobs");
            let batch = match self.store.claim_waiting(&targets, &served, self.fetch_limit).await
            {
                Ok(batch) => batch,
                Err(e) => {
                    // The backlog is not requeued; the next poke retries.
                    self.inner.lock().unwrap().polling = false;
                    return Err(e);
                }
            };

            for (id, reason) in &batch.ignored {
                warn!(id, %reason, "claim rejected a row");
            }

            let (ready, again) = {
                let mut inner = self.inner.lock().unwrap();
                for job in &batch.accepted {
                    if let Err(e) = inner.queues.push(&job.target, job.id) {
                        warn!(id = job.id, "claimed row lost its queue: {e}");
                    }
                }
                let ready = inner.queues.take_dispatchable();
                inner.polling = false;
                if self.fetch_limit > 0 && batch.fetched >= self.fetch_limit as usize {
                    // A full batch means the table may hold more.
                    inner.nextpoll.union(targets.iter().cloned());
                }
                (ready, !inner.nextpoll.is_empty())
            };

            for (target, id) in ready {
                self.clone().spawn_runner(target, id);
            }
            if !again {
                return Ok(());
            }
        }
    }

    /// Claim and execute specific `manual` rows, waiting for each to
    /// finish. Returns per-id reports and per-id error strings.
    pub async fn run_manual(
        self: Arc<Self>,
        ids: Vec<u64>,
    ) -> Result<(BTreeMap<u64, JobReport>, BTreeMap<u64, String>)> {
        let mut errors = BTreeMap::new();
        let mut fresh: Vec<u64> = Vec::new();
        {
            let waiters = self.waiters.lock().unwrap();
            for id in ids {
                if waiters.contains_key(&id) {
                    errors.insert(id, format!("job {id} is already being run"));
                } else if !fresh.contains(&id) {
                    fresh.push(id);
                }
            }
        }
        if fresh.is_empty() {
            return Ok((BTreeMap::new(), errors));
        }

        let served: HashSet<String> = self.target_names().into_iter().collect();
        let outcomes = self.store.claim_manual(&fresh, &served).await?;

        let mut pending: Vec<(u64, oneshot::Receiver<JobReport>)> = Vec::new();
        for id in &fresh {
            match outcomes.get(id) {
                Some(ManualOutcome::Accepted { target }) => {
                    let (tx, rx) = oneshot::channel();
                    self.waiters.lock().unwrap().insert(*id, tx);
                    let mut inner = self.inner.lock().unwrap();
                    if let Err(e) = inner.queues.push(target, *id) {
                        drop(inner);
                        self.waiters.lock().unwrap().remove(id);
                        errors.insert(*id, e.to_string());
                    } else {
                        pending.push((*id, rx));
                    }
                }
                Some(ManualOutcome::Ignored { reason }) => {
                    errors.insert(*id, reason.clone());
                }
                Some(ManualOutcome::NotFound) | None => {
                    errors.insert(*id, format!("job {id} not found"));
                }
            }
        }

        let ready = { self.inner.lock().unwrap().queues.take_dispatchable() };
        for (target, id) in ready {
            self.clone().spawn_runner(target, id);
        }

        let mut jobs = BTreeMap::new();
        for (id, rx) in pending {
            match rx.await {
                Ok(report) => {
                    jobs.insert(id, report);
                }
                Err(_) => {
                    errors.insert(id, "job runner went away".to_string());
                }
            }
        }
        Ok((jobs, errors))
    }

    pub fn pause(&self, targets: Option<Vec<String>>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for target in selected(&inner.queues, targets)? {
            inner.queues.set_paused(&target, true)?;
            info!(%target, "target paused");
        }
        Ok(())
    }

    /// Unpause and dispatch whatever queued up in the meantime.
    pub fn resume(self: Arc<Self>, targets: Option<Vec<String>>) -> Result<()> {
        let ready = {
            let mut inner = self.inner.lock().unwrap();
            let mut ready = Vec::new();
            for target in selected(&inner.queues, targets)? {
                inner.queues.set_paused(&target, false)?;
                info!(%target, "target resumed");
                ready.extend(inner.queues.take_dispatchable_for(&target));
            }
            ready
        };
        for (target, id) in ready {
            self.clone().spawn_runner(target, id);
        }
        // The backlog may have been blocked on the pause.
        self.spawn_poll();
        Ok(())
    }

    pub fn add_target(&self, target: &str, concurrency: u32) -> Result<()> {
        self.inner.lock().unwrap().queues.add(target, concurrency)?;
        info!(%target, concurrency, "target added");
        Ok(())
    }

    pub fn remove_target(&self, target: &str) -> Result<()> {
        self.inner.lock().unwrap().queues.remove(target)?;
        info!(%target, "target removed");
        Ok(())
    }

    /// Adjust a live limit; raising it dispatches newly eligible jobs.
    pub fn set_concurrency(self: Arc<Self>, target: &str, concurrency: u32) -> Result<()> {
        let ready = {
            let mut inner = self.inner.lock().unwrap();
            inner.queues.set_concurrency(target, concurrency)?;
            inner.queues.take_dispatchable_for(target)
        };
        for (target, id) in ready {
            self.clone().spawn_runner(target, id);
        }
        self.spawn_poll();
        Ok(())
    }

    fn spawn_runner(self: Arc<Self>, target: String, id: u64) {
        tokio::spawn(async move {
            let report = run_job(self.store.as_ref(), &self.launcher, id).await;
            self.job_finished(&target, id, report);
        });
    }

    fn job_finished(self: Arc<Self>, target: &str, id: u64, report: JobReport) {
        debug!(id, %target, verdict = report.verdict.as_str(), "job finished");
        if let Some(tx) = self.waiters.lock().unwrap().remove(&id) {
            let _ = tx.send(report);
        }
        let ready = {
            let mut inner = self.inner.lock().unwrap();
            inner.queues.finish(target);
            inner.queues.take_dispatchable_for(target)
        };
        for (target, id) in ready {
            self.clone().spawn_runner(target, id);
        }
        // The freed slot may unblock the poll backlog.
        self.spawn_poll();
    }

    fn spawn_poll(self: Arc<Self>) {
        tokio::spawn(async move {
            if let Err(e) = self.poll().await {
                warn!("poll cycle failed: {e}");
            }
        });
    }
}

/// Expand an optional target list: absent means every served target.
fn selected(queues: &TargetQueues, targets: Option<Vec<String>>) -> Result<Vec<String>> {
    match targets {
        None => Ok(queues.names()),
        Some(list) => {
            if list.is_empty() {
                return Err(Error::Validation("empty targets list".to_string()));
            }
            for target in &list {
                if !queues.contains(target) {
                    return Err(Error::Validation(format!("invalid target '{target}'")));
                }
            }
            Ok(list)
        }
    }
}

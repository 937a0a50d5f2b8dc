// tests/common/mod.rs

//! Shared fixtures for the integration tests: an in-memory job table and
//! configuration builders for daemons bound to ephemeral ports.

#![allow(dead_code)]

use async_trait::async_trait;
use dispatchd::config::{LauncherSection, MysqlSection, WorkerConfig};
use dispatchd::store::{
    ClaimBatch, ClaimedJob, JobCompletion, JobStore, ManualOutcome, classify_row,
};
use dispatchd::{Connection, FrameHandler, JobStatus, JobVerdict, MasterConfig, Request};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone)]
pub struct MemRow {
    pub target: String,
    pub status: JobStatus,
    pub verdict: Option<JobVerdict>,
    pub stdout: String,
}

/// In-memory stand-in for the job table, mirroring the claim semantics of
/// the real store.
pub struct MemStore {
    rows: Mutex<BTreeMap<u64, MemRow>>,
}

impl MemStore {
    pub fn with_rows(rows: &[(u64, &str, JobStatus)]) -> Arc<Self> {
        let rows = rows
            .iter()
            .map(|(id, target, status)| {
                (
                    *id,
                    MemRow {
                        target: target.to_string(),
                        status: *status,
                        verdict: None,
                        stdout: String::new(),
                    },
                )
            })
            .collect();
        Arc::new(Self { rows: Mutex::new(rows) })
    }

    pub fn status_of(&self, id: u64) -> JobStatus {
        self.rows.lock().unwrap()[&id].status
    }

    pub fn verdict_of(&self, id: u64) -> Option<JobVerdict> {
        self.rows.lock().unwrap()[&id].verdict
    }

    pub fn all_done(&self) -> bool {
        self.rows.lock().unwrap().values().all(|row| row.status == JobStatus::Done)
    }
}

#[async_trait]
impl JobStore for MemStore {
    async fn claim_waiting(
        &self,
        targets: &[String],
        served: &HashSet<String>,
        limit: u32,
    ) -> dispatchd::Result<ClaimBatch> {
        let mut rows = self.rows.lock().unwrap();
        let mut batch = ClaimBatch::default();
        for (id, row) in rows.iter_mut() {
            if limit > 0 && batch.fetched >= limit as usize {
                break;
            }
            if row.status != JobStatus::Waiting || !targets.contains(&row.target) {
                continue;
            }
            batch.fetched += 1;
            match classify_row(row.status.as_str(), &row.target, JobStatus::Waiting, served) {
                Ok(()) => {
                    row.status = JobStatus::Accepted;
                    batch.accepted.push(ClaimedJob { id: *id, target: row.target.clone() });
                }
                Err(reason) => {
                    row.status = JobStatus::Ignored;
                    batch.ignored.push((*id, reason));
                }
            }
        }
        Ok(batch)
    }

    async fn claim_manual(
        &self,
        ids: &[u64],
        served: &HashSet<String>,
    ) -> dispatchd::Result<HashMap<u64, ManualOutcome>> {
        let mut rows = self.rows.lock().unwrap();
        let mut outcomes = HashMap::new();
        for id in ids {
            let Some(row) = rows.get_mut(id) else {
                outcomes.insert(*id, ManualOutcome::NotFound);
                continue;
            };
            match classify_row(row.status.as_str(), &row.target, JobStatus::Manual, served) {
                Ok(()) => {
                    row.status = JobStatus::Accepted;
                    outcomes.insert(*id, ManualOutcome::Accepted { target: row.target.clone() });
                }
                Err(reason) => {
                    row.status = JobStatus::Ignored;
                    outcomes.insert(*id, ManualOutcome::Ignored { reason });
                }
            }
        }
        Ok(outcomes)
    }

    async fn mark_running(&self, id: u64) -> dispatchd::Result<()> {
        self.rows.lock().unwrap().get_mut(&id).unwrap().status = JobStatus::Running;
        Ok(())
    }

    async fn mark_done(&self, id: u64, completion: &JobCompletion) -> dispatchd::Result<()> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows.get_mut(&id).unwrap();
        row.status = JobStatus::Done;
        row.verdict = Some(completion.verdict);
        row.stdout = completion.stdout.clone();
        Ok(())
    }
}

/// Worker configuration bound to an ephemeral port, no auth.
pub fn worker_config(targets: &[(&str, u32)], launcher: &str) -> WorkerConfig {
    let targets: BTreeMap<String, u32> =
        targets.iter().map(|(name, c)| (name.to_string(), *c)).collect();
    WorkerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        password: None,
        always_allow_localhost: true,
        name: None,
        master: None,
        mysql: MysqlSection {
            host: "127.0.0.1".to_string(),
            port: 3306,
            user: "test".to_string(),
            password: String::new(),
            database: "test".to_string(),
            table: "jobs".to_string(),
            fetch_limit: 100,
        },
        launcher: LauncherSection {
            command: launcher.to_string(),
            cwd: None,
            max_output_buffer: 1024 * 1024,
            env: BTreeMap::new(),
        },
        targets,
    }
}

/// Master configuration bound to an ephemeral port, no auth, a short poke
/// window so tests do not wait on the throttle.
pub fn master_config() -> MasterConfig {
    let mut config: MasterConfig = toml::from_str("").unwrap();
    config.host = "127.0.0.1".to_string();
    config.port = 0;
    config.poke_throttle_interval = 0.05;
    config
}

/// Frame handler for client-only connections that never serve requests.
pub struct NullClient;

#[async_trait]
impl FrameHandler for NullClient {
    async fn handle_request(
        &self,
        request: Request,
        _conn: &Arc<Connection>,
    ) -> dispatchd::Result<Value> {
        Err(dispatchd::Error::Protocol(format!(
            "unknown request type: '{}'",
            request.request_type
        )))
    }
}

/// Poll a condition until it holds or the deadline passes.
pub async fn wait_until(deadline_ms: u64, mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..(deadline_ms / 10) {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

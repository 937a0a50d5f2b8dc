// src/store/mod.rs

//! Job table access.
//!
//! The table is the source of truth: producers INSERT rows, this daemon
//! only moves their state columns forward. `JobStore` is the seam between
//! the scheduler and the database so the claim protocol can be exercised
//! against an in-memory double in tests.

pub mod mysql;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

pub use mysql::MySqlStore;

/// Lifecycle states of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Manual,
    Accepted,
    Running,
    Done,
    Ignored,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Manual => "manual",
            JobStatus::Accepted => "accepted",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Ignored => "ignored",
        }
    }
}

/// Final verdict of a finished job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobVerdict {
    Ok,
    Fail,
}

impl JobVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobVerdict::Ok => "ok",
            JobVerdict::Fail => "fail",
        }
    }
}

/// A row this worker now owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    pub id: u64,
    pub target: String,
}

/// Result of one background claim transaction.
#[derive(Debug, Clone, Default)]
pub struct ClaimBatch {
    pub accepted: Vec<ClaimedJob>,
    /// Rows moved to `ignored`, with the reason.
    pub ignored: Vec<(u64, String)>,
    /// Total rows returned by the SELECT, used to decide whether a
    /// follow-up poll is needed.
    pub fetched: usize,
}

/// Per-id disposition of a manual claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManualOutcome {
    Accepted { target: String },
    Ignored { reason: String },
    NotFound,
}

/// Everything written back when a job reaches `done`.
#[derive(Debug, Clone)]
pub struct JobCompletion {
    pub verdict: JobVerdict,
    pub return_code: Option<u8>,
    pub sig: Option<String>,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Claim `waiting` rows for the given targets under a row lock.
    ///
    /// Each fetched row is classified against the expected status and the
    /// set of targets this worker serves; accepted rows move to `accepted`,
    /// everything else to `ignored`. `limit == 0` removes the row cap.
    async fn claim_waiting(
        &self,
        targets: &[String],
        served: &HashSet<String>,
        limit: u32,
    ) -> Result<ClaimBatch>;

    /// Claim specific rows for a manual run. Rows must be in `manual` and
    /// belong to a served target to be accepted.
    async fn claim_manual(
        &self,
        ids: &[u64],
        served: &HashSet<String>,
    ) -> Result<HashMap<u64, ManualOutcome>>;

    /// Move a claimed row to `running` and stamp `time_started`.
    async fn mark_running(&self, id: u64) -> Result<()>;

    /// Move a row to `done` with its captured outcome and `time_finished`.
    async fn mark_done(&self, id: u64, completion: &JobCompletion) -> Result<()>;
}

/// Classification shared by every claimer: a row is accepted when its
/// status matches what the claim expected and its target is served here.
pub fn classify_row(
    status: &str,
    target: &str,
    needed: JobStatus,
    served: &HashSet<String>,
) -> std::result::Result<(), String> {
    if status != needed.as_str() {
        return Err(format!("status={status} != {}", needed.as_str()));
    }
    if !served.contains(target) {
        return Err(format!("target '{target}' is not served here"));
    }
    Ok(())
}

// src/store/mysql.rs

//! MySQL-backed job store.
//!
//! The claim protocol relies on `SELECT ... FOR UPDATE` inside a
//! transaction: two workers polling the same table serialize on the row
//! locks, so a row is claimed exactly once. All values are bound as
//! parameters; the table name is the one configured identifier spliced
//! into the statements.
//!
//! Fatal connection errors get one transparent retry per call; anything
//! that fails twice is surfaced to the caller.

use super::{
    ClaimBatch, ClaimedJob, JobCompletion, JobStatus, JobStore, ManualOutcome, classify_row,
};
use crate::config::MysqlSection;
use crate::error::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

pub struct MySqlStore {
    pool: MySqlPool,
    table: String,
}

impl MySqlStore {
    pub async fn connect(config: &MysqlSection) -> Result<Self> {
        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.database);
        let pool = MySqlPoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        info!(
            host = %config.host,
            database = %config.database,
            table = %config.table,
            "connected to job storage"
        );
        Ok(Self { pool, table: config.table.clone() })
    }

    async fn claim_waiting_once(
        &self,
        targets: &[String],
        served: &HashSet<String>,
        limit: u32,
    ) -> sqlx::Result<ClaimBatch> {
        let mut tx = self.pool.begin().await?;

        let mut sql = format!(
            "SELECT id, status, target FROM {} WHERE status = ? AND target IN ({}) ORDER BY id",
            self.table,
            placeholders(targets.len())
        );
        if limit > 0 {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        sql.push_str(" FOR UPDATE");

        let mut query = sqlx::query(&sql).bind(JobStatus::Waiting.as_str());
        for target in targets {
            query = query.bind(target);
        }
        let rows = query.fetch_all(&mut *tx).await?;

        let mut batch = ClaimBatch { fetched: rows.len(), ..Default::default() };
        for row in &rows {
            let id = row.try_get::<u32, _>("id")? as u64;
            let status: String = row.try_get("status")?;
            let target: String = row.try_get("target")?;
            match classify_row(&status, &target, JobStatus::Waiting, served) {
                Ok(()) => batch.accepted.push(ClaimedJob { id, target }),
                Err(reason) => batch.ignored.push((id, reason)),
            }
        }

        let accepted_ids: Vec<u64> = batch.accepted.iter().map(|job| job.id).collect();
        self.set_status(&mut tx, &accepted_ids, JobStatus::Accepted).await?;
        let ignored_ids: Vec<u64> = batch.ignored.iter().map(|(id, _)| *id).collect();
        self.set_status(&mut tx, &ignored_ids, JobStatus::Ignored).await?;

        tx.commit().await?;
        Ok(batch)
    }

    async fn claim_manual_once(
        &self,
        ids: &[u64],
        served: &HashSet<String>,
    ) -> sqlx::Result<HashMap<u64, ManualOutcome>> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "SELECT id, status, target FROM {} WHERE id IN ({}) FOR UPDATE",
            self.table,
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(*id);
        }
        let rows = query.fetch_all(&mut *tx).await?;

        let mut outcomes: HashMap<u64, ManualOutcome> =
            ids.iter().map(|id| (*id, ManualOutcome::NotFound)).collect();
        let mut accepted_ids = Vec::new();
        let mut ignored_ids = Vec::new();
        for row in &rows {
            let id = row.try_get::<u32, _>("id")? as u64;
            let status: String = row.try_get("status")?;
            let target: String = row.try_get("target")?;
            match classify_row(&status, &target, JobStatus::Manual, served) {
                Ok(()) => {
                    accepted_ids.push(id);
                    outcomes.insert(id, ManualOutcome::Accepted { target });
                }
                Err(reason) => {
                    ignored_ids.push(id);
                    outcomes.insert(id, ManualOutcome::Ignored { reason });
                }
            }
        }

        self.set_status(&mut tx, &accepted_ids, JobStatus::Accepted).await?;
        self.set_status(&mut tx, &ignored_ids, JobStatus::Ignored).await?;

        tx.commit().await?;
        Ok(outcomes)
    }

    async fn set_status(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::MySql>,
        ids: &[u64],
        status: JobStatus,
    ) -> sqlx::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE {} SET status = ? WHERE id IN ({})",
            self.table,
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql).bind(status.as_str());
        for id in ids {
            query = query.bind(*id);
        }
        query.execute(&mut **tx).await?;
        Ok(())
    }

    async fn mark_running_once(&self, id: u64) -> sqlx::Result<()> {
        let sql = format!(
            "UPDATE {} SET status = ?, time_started = ? WHERE id = ?",
            self.table
        );
        sqlx::query(&sql)
            .bind(JobStatus::Running.as_str())
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_done_once(&self, id: u64, completion: &JobCompletion) -> sqlx::Result<()> {
        let sql = format!(
            "UPDATE {} SET status = ?, result = ?, return_code = ?, sig = ?, \
             stdout = ?, stderr = ?, time_finished = ? WHERE id = ?",
            self.table
        );
        sqlx::query(&sql)
            .bind(JobStatus::Done.as_str())
            .bind(completion.verdict.as_str())
            .bind(completion.return_code.map(|code| code as i32))
            .bind(completion.sig.as_deref())
            .bind(&completion.stdout)
            .bind(&completion.stderr)
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for MySqlStore {
    async fn claim_waiting(
        &self,
        targets: &[String],
        served: &HashSet<String>,
        limit: u32,
    ) -> Result<ClaimBatch> {
        if targets.is_empty() {
            return Ok(ClaimBatch::default());
        }
        match self.claim_waiting_once(targets, served, limit).await {
            Err(e) if is_connection_error(&e) => {
                warn!("claim failed on a dead connection, retrying once: {e}");
                Ok(self.claim_waiting_once(targets, served, limit).await?)
            }
            result => Ok(result?),
        }
    }

    async fn claim_manual(
        &self,
        ids: &[u64],
        served: &HashSet<String>,
    ) -> Result<HashMap<u64, ManualOutcome>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        match self.claim_manual_once(ids, served).await {
            Err(e) if is_connection_error(&e) => {
                warn!("manual claim failed on a dead connection, retrying once: {e}");
                Ok(self.claim_manual_once(ids, served).await?)
            }
            result => Ok(result?),
        }
    }

    async fn mark_running(&self, id: u64) -> Result<()> {
        match self.mark_running_once(id).await {
            Err(e) if is_connection_error(&e) => {
                warn!("retrying mark_running for job {id}: {e}");
                Ok(self.mark_running_once(id).await?)
            }
            result => Ok(result?),
        }
    }

    async fn mark_done(&self, id: u64, completion: &JobCompletion) -> Result<()> {
        debug!(id, verdict = completion.verdict.as_str(), "writing job result");
        match self.mark_done_once(id, completion).await {
            Err(e) if is_connection_error(&e) => {
                warn!("retrying mark_done for job {id}: {e}");
                Ok(self.mark_done_once(id, completion).await?)
            }
            result => Ok(result?),
        }
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn is_connection_error(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
    )
}

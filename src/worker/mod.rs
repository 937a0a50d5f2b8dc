// src/worker/mod.rs

//! The worker daemon.
//!
//! Executes jobs as child processes with per-target bounded concurrency.
//! Job rows are authored by external producers; the worker claims them from
//! the table, runs the launcher, and writes results back. Requests arrive
//! over the listening socket and, when a `[master]` uplink is configured,
//! over the dialed master connection as well.

pub mod queue;
pub mod runner;
pub mod scheduler;

use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::net::connection::{Connection, FrameHandler};
use crate::net::router::{Router, decode_payload, require_payload};
use crate::net::server;
use crate::store::{JobStore, MySqlStore};
use crate::util;
use scheduler::Scheduler;
use serde::Deserialize;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Shared state behind every worker request handler.
pub struct WorkerState {
    pub config: WorkerConfig,
    pub scheduler: Arc<Scheduler>,
}

/// A bound worker ready to serve.
pub struct WorkerDaemon {
    state: Arc<WorkerState>,
    router: Arc<Router<WorkerState>>,
    listener: TcpListener,
}

/// Run the worker daemon until ctrl-c.
pub async fn run(config: WorkerConfig) -> Result<()> {
    let store = MySqlStore::connect(&config.mysql).await?;
    let daemon = WorkerDaemon::bind(config, Arc::new(store)).await?;
    daemon.run().await
}

impl WorkerDaemon {
    /// Build the scheduler and bind the listening socket.
    pub async fn bind(config: WorkerConfig, store: Arc<dyn JobStore>) -> Result<Self> {
        let scheduler = Scheduler::new(
            store,
            config.launcher.clone(),
            config.mysql.fetch_limit,
            &config.targets,
        );
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let state = Arc::new(WorkerState { config, scheduler });
        let router = Arc::new(router(state.clone()));
        Ok(Self { state, router, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> Arc<WorkerState> {
        self.state.clone()
    }

    pub async fn run(self) -> Result<()> {
        if self.state.config.master.is_some() {
            tokio::spawn(master_link(self.state.clone(), self.router.clone()));
        }
        info!("worker listening on {}", self.local_addr()?);
        server::serve(self.listener, self.state.config.auth(), self.router).await
    }
}

/// The worker's request table.
pub fn router(state: Arc<WorkerState>) -> Router<WorkerState> {
    Router::new(state)
        .route("poll", handle_poll)
        .route("pause", handle_pause)
        .route("continue", handle_continue)
        .route("status", handle_status)
        .route("add-target", handle_add_target)
        .route("remove-target", handle_remove_target)
        .route("set-target-concurrency", handle_set_concurrency)
        .route("run-manual", handle_run_manual)
}

#[derive(Debug, Default, Deserialize)]
struct TargetsPayload {
    #[serde(default)]
    targets: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct AddTargetPayload {
    target: String,
    concurrency: u32,
}

#[derive(Debug, Deserialize)]
struct TargetPayload {
    target: String,
}

#[derive(Debug, Deserialize)]
struct RunManualPayload {
    ids: Vec<u64>,
}

async fn handle_poll(
    state: Arc<WorkerState>,
    data: Option<Value>,
    _conn: Arc<Connection>,
) -> Result<Value> {
    let payload: TargetsPayload = decode_payload(data)?;
    state.scheduler.clone().poll_requested(payload.targets).await?;
    Ok(json!("ok"))
}

async fn handle_pause(
    state: Arc<WorkerState>,
    data: Option<Value>,
    _conn: Arc<Connection>,
) -> Result<Value> {
    let payload: TargetsPayload = decode_payload(data)?;
    state.scheduler.pause(payload.targets)?;
    Ok(json!("ok"))
}

async fn handle_continue(
    state: Arc<WorkerState>,
    data: Option<Value>,
    _conn: Arc<Connection>,
) -> Result<Value> {
    let payload: TargetsPayload = decode_payload(data)?;
    state.scheduler.clone().resume(payload.targets)?;
    Ok(json!("ok"))
}

async fn handle_status(
    state: Arc<WorkerState>,
    _data: Option<Value>,
    _conn: Arc<Connection>,
) -> Result<Value> {
    Ok(json!({
        "targets": state.scheduler.status(),
        "jobPromisesCount": state.scheduler.waiter_count(),
        "memoryUsage": util::memory_usage(),
    }))
}

async fn handle_add_target(
    state: Arc<WorkerState>,
    data: Option<Value>,
    _conn: Arc<Connection>,
) -> Result<Value> {
    let payload: AddTargetPayload = require_payload(data)?;
    state.scheduler.add_target(&payload.target, payload.concurrency)?;
    Ok(json!("ok"))
}

async fn handle_remove_target(
    state: Arc<WorkerState>,
    data: Option<Value>,
    _conn: Arc<Connection>,
) -> Result<Value> {
    let payload: TargetPayload = require_payload(data)?;
    state.scheduler.remove_target(&payload.target)?;
    Ok(json!("ok"))
}

async fn handle_set_concurrency(
    state: Arc<WorkerState>,
    data: Option<Value>,
    _conn: Arc<Connection>,
) -> Result<Value> {
    let payload: AddTargetPayload = require_payload(data)?;
    state.scheduler.clone().set_concurrency(&payload.target, payload.concurrency)?;
    Ok(json!("ok"))
}

async fn handle_run_manual(
    state: Arc<WorkerState>,
    data: Option<Value>,
    _conn: Arc<Connection>,
) -> Result<Value> {
    let payload: RunManualPayload = require_payload(data)?;
    if payload.ids.is_empty() {
        return Err(Error::Validation("empty ids list".to_string()));
    }
    let (jobs, errors) = state.scheduler.clone().run_manual(payload.ids).await?;

    let mut jobs_map = serde_json::Map::new();
    for (id, report) in jobs {
        jobs_map.insert(id.to_string(), serde_json::to_value(&report)?);
    }
    let mut errors_map = serde_json::Map::new();
    for (id, message) in errors {
        errors_map.insert(id.to_string(), Value::String(message));
    }
    Ok(json!({ "jobs": jobs_map, "errors": errors_map }))
}

/// Keep a registered connection to the master alive.
///
/// Every successful dial starts with `register-worker`; the master sends
/// its `poll`/`pause`/`continue`/`run-manual` requests back over this same
/// connection, which is why it is served by the full worker router.
async fn master_link(state: Arc<WorkerState>, router: Arc<Router<WorkerState>>) {
    let Some(link) = state.config.master.clone() else {
        return;
    };
    let addr = format!("{}:{}", link.host, link.port);
    loop {
        let handler: Arc<dyn FrameHandler> = router.clone();
        match Connection::connect(&addr, handler, link.password.clone()).await {
            Ok(conn) => {
                info!("connected to master at {addr}");
                let mut registration = json!({ "targets": state.scheduler.target_names() });
                if let Some(name) = &state.config.name {
                    registration["name"] = json!(name);
                }
                match conn.send_request("register-worker", Some(registration)).await {
                    Ok(response) => match response.into_result() {
                        Ok(_) => info!("registered with master"),
                        Err(e) => warn!("master rejected registration: {e}"),
                    },
                    Err(e) => warn!("registration failed: {e}"),
                }
                conn.closed().await;
                warn!(
                    "master connection lost, reconnecting in {}s",
                    link.reconnect_timeout
                );
            }
            Err(e) => {
                warn!(
                    "cannot reach master at {addr}: {e}, retrying in {}s",
                    link.reconnect_timeout
                );
            }
        }
        tokio::time::sleep(Duration::from_secs(link.reconnect_timeout)).await;
    }
}

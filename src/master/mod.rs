// src/master/mod.rs

//! The master daemon.
//!
//! A rendezvous point: workers dial in and register the targets they serve;
//! clients poke targets, pause or continue fleets, and submit manual runs.
//! The master holds no job state of its own, it only routes. Pokes are
//! coalesced through a leading-edge throttle, and pokes for targets nobody
//! serves are parked until a matching worker registers.

pub mod registry;
pub mod throttle;

use crate::config::MasterConfig;
use crate::error::{Error, Result};
use crate::net::connection::Connection;
use crate::net::router::{Router, decode_payload, require_payload};
use crate::net::server;
use crate::proto::Message;
use crate::util;
use rand::Rng;
use registry::{Registry, WorkerEntry};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use throttle::{PokeThrottle, ThrottleDecision};
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Shared state behind every master request handler.
pub struct MasterState {
    pub config: MasterConfig,
    pub registry: Mutex<Registry>,
    /// Targets poked while nobody served them.
    pub deferred: Mutex<HashSet<String>>,
    pub throttle: PokeThrottle,
}

/// A bound master ready to serve.
pub struct MasterDaemon {
    state: Arc<MasterState>,
    router: Arc<Router<MasterState>>,
    listener: TcpListener,
}

/// Run the master daemon until ctrl-c.
pub async fn run(config: MasterConfig) -> Result<()> {
    let daemon = MasterDaemon::bind(config).await?;
    daemon.run().await
}

impl MasterDaemon {
    pub async fn bind(config: MasterConfig) -> Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let throttle =
            PokeThrottle::new(Duration::from_secs_f64(config.poke_throttle_interval));
        let state = Arc::new(MasterState {
            config,
            registry: Mutex::new(Registry::default()),
            deferred: Mutex::new(HashSet::new()),
            throttle,
        });
        let router = Arc::new(router(state.clone()));
        Ok(Self { state, router, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> Arc<MasterState> {
        self.state.clone()
    }

    pub async fn run(self) -> Result<()> {
        tokio::spawn(ping_loop(self.state.clone()));
        info!("master listening on {}", self.local_addr()?);
        server::serve(self.listener, self.state.config.auth(), self.router).await
    }
}

/// The master's request table. Registry entries die with their connection.
pub fn router(state: Arc<MasterState>) -> Router<MasterState> {
    Router::new(state)
        .route("register-worker", handle_register)
        .route("poke", handle_poke)
        .route("pause", handle_pause)
        .route("continue", handle_continue)
        .route("status", handle_status)
        .route("run-manual", handle_run_manual)
        .on_close(|state, conn| {
            state.registry.lock().unwrap().remove_conn(conn.id());
        })
}

#[derive(Debug, Default, Deserialize)]
struct TargetsPayload {
    #[serde(default)]
    targets: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RegisterPayload {
    targets: Vec<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StatusPayload {
    #[serde(default)]
    poll_workers: bool,
}

#[derive(Debug, Deserialize)]
struct JobRef {
    id: u64,
    target: String,
}

#[derive(Debug, Deserialize)]
struct RunManualPayload {
    jobs: Vec<JobRef>,
}

async fn handle_register(
    state: Arc<MasterState>,
    data: Option<Value>,
    conn: Arc<Connection>,
) -> Result<Value> {
    let payload: RegisterPayload = require_payload(data)?;
    if payload.targets.is_empty() {
        return Err(Error::Validation("empty targets list".to_string()));
    }
    if payload.targets.iter().any(|t| t.is_empty()) {
        return Err(Error::Validation("target name must not be empty".to_string()));
    }

    state.registry.lock().unwrap().add(WorkerEntry {
        conn: conn.clone(),
        targets: payload.targets.clone(),
        name: payload.name,
    });

    // Pokes parked for these targets can be delivered now.
    let parked: Vec<String> = {
        let mut deferred = state.deferred.lock().unwrap();
        let hits: Vec<String> = deferred
            .iter()
            .filter(|t| payload.targets.contains(t))
            .cloned()
            .collect();
        for target in &hits {
            deferred.remove(target);
        }
        hits
    };
    if !parked.is_empty() {
        info!(targets = ?parked, "delivering deferred pokes to new worker");
        tokio::spawn(async move {
            if let Err(e) = forward_poll(&conn, &parked).await {
                warn!("deferred poke delivery failed: {e}");
            }
        });
    }

    Ok(json!("ok"))
}

async fn handle_poke(
    state: Arc<MasterState>,
    data: Option<Value>,
    _conn: Arc<Connection>,
) -> Result<Value> {
    let payload: TargetsPayload = decode_payload(data)?;
    let targets = match payload.targets {
        Some(list) if !list.is_empty() => list,
        _ => return Err(Error::Validation("empty targets list".to_string())),
    };
    poke(&state, targets).await;
    Ok(json!("ok"))
}

/// Route a batch of poked targets through the throttle.
pub async fn poke(state: &Arc<MasterState>, targets: Vec<String>) {
    match state.throttle.submit(targets) {
        ThrottleDecision::DrainNow(batch) => drain_pokes(state, batch).await,
        ThrottleDecision::Scheduled(delay) => {
            let state = state.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let batch = state.throttle.take_scheduled();
                drain_pokes(&state, batch).await;
            });
        }
        ThrottleDecision::Coalesced => {}
    }
}

/// Forward a drained batch: `poll` to each worker serving an intersection,
/// the deferred set for everything unserved. Delivery is best effort.
async fn drain_pokes(state: &Arc<MasterState>, batch: Vec<String>) {
    if batch.is_empty() {
        return;
    }
    let mut sends: Vec<(Arc<Connection>, Vec<String>)> = Vec::new();
    {
        let registry = state.registry.lock().unwrap();
        for entry in registry.iter() {
            let intersection: Vec<String> =
                batch.iter().filter(|t| entry.serves(t.as_str())).cloned().collect();
            if !intersection.is_empty() {
                sends.push((entry.conn.clone(), intersection));
            }
        }
        let mut deferred = state.deferred.lock().unwrap();
        for target in &batch {
            if !registry.serves(target) {
                info!(%target, "no worker serves target, deferring poke");
                deferred.insert(target.clone());
            }
        }
    }
    for (conn, targets) in sends {
        tokio::spawn(async move {
            if let Err(e) = forward_poll(&conn, &targets).await {
                warn!("poke forward failed: {e}");
            }
        });
    }
}

async fn forward_poll(conn: &Arc<Connection>, targets: &[String]) -> Result<()> {
    let response = conn.send_request("poll", Some(json!({ "targets": targets }))).await?;
    response.into_result()?;
    Ok(())
}

async fn handle_pause(
    state: Arc<MasterState>,
    data: Option<Value>,
    _conn: Arc<Connection>,
) -> Result<Value> {
    let payload: TargetsPayload = decode_payload(data)?;
    fan_out(&state, "pause", payload.targets)?;
    Ok(json!("ok"))
}

async fn handle_continue(
    state: Arc<MasterState>,
    data: Option<Value>,
    _conn: Arc<Connection>,
) -> Result<Value> {
    let payload: TargetsPayload = decode_payload(data)?;
    fan_out(&state, "continue", payload.targets)?;
    Ok(json!("ok"))
}

/// Forward a request to matching workers. Omitted targets means every
/// worker, each told to act on all of its own targets; a target list means
/// only workers with a non-empty intersection, each told exactly the
/// intersection.
fn fan_out(
    state: &Arc<MasterState>,
    request_type: &'static str,
    targets: Option<Vec<String>>,
) -> Result<()> {
    let sends: Vec<(Arc<Connection>, Option<Vec<String>>)> = {
        let registry = state.registry.lock().unwrap();
        match &targets {
            None => registry.iter().map(|entry| (entry.conn.clone(), None)).collect(),
            Some(list) => {
                if list.is_empty() {
                    return Err(Error::Validation("empty targets list".to_string()));
                }
                registry
                    .iter()
                    .filter_map(|entry| {
                        let intersection: Vec<String> = list
                            .iter()
                            .filter(|t| entry.serves(t.as_str()))
                            .cloned()
                            .collect();
                        if intersection.is_empty() {
                            None
                        } else {
                            Some((entry.conn.clone(), Some(intersection)))
                        }
                    })
                    .collect()
            }
        }
    };
    for (conn, targets) in sends {
        let data = targets.map(|t| json!({ "targets": t }));
        tokio::spawn(async move {
            match conn.send_request(request_type, data).await {
                Ok(response) => {
                    if let Err(e) = response.into_result() {
                        warn!("{request_type} forward rejected: {e}");
                    }
                }
                Err(e) => warn!("{request_type} forward failed: {e}"),
            }
        });
    }
    Ok(())
}

async fn handle_status(
    state: Arc<MasterState>,
    data: Option<Value>,
    _conn: Arc<Connection>,
) -> Result<Value> {
    let payload: StatusPayload = decode_payload(data)?;
    let entries: Vec<WorkerEntry> =
        state.registry.lock().unwrap().iter().cloned().collect();

    let mut workers = Vec::new();
    for entry in entries {
        let mut item = json!({
            "name": entry.name,
            "addr": entry.conn.peer().to_string(),
            "targets": entry.targets,
        });
        if payload.poll_workers {
            item["status"] = match entry.conn.send_request("status", None).await {
                Ok(response) => match response.into_result() {
                    Ok(data) => data.unwrap_or(Value::Null),
                    Err(e) => json!({ "error": e.to_string() }),
                },
                Err(e) => json!({ "error": e.to_string() }),
            };
        }
        workers.push(item);
    }

    Ok(json!({ "workers": workers, "memoryUsage": util::memory_usage() }))
}

async fn handle_run_manual(
    state: Arc<MasterState>,
    data: Option<Value>,
    _conn: Arc<Connection>,
) -> Result<Value> {
    let payload: RunManualPayload = require_payload(data)?;
    if payload.jobs.is_empty() {
        return Err(Error::Validation("empty jobs list".to_string()));
    }

    // Pick one worker per job, uniformly among those serving its target,
    // then batch the picks per worker.
    let mut exceptions: Vec<(u64, String)> = Vec::new();
    let mut assignments: HashMap<u64, (Arc<Connection>, Vec<u64>)> = HashMap::new();
    {
        let registry = state.registry.lock().unwrap();
        let mut rng = rand::thread_rng();
        for job in &payload.jobs {
            let servers = registry.serving(&job.target);
            if servers.is_empty() {
                exceptions.push((
                    job.id,
                    format!("worker serving target '{}' not found", job.target),
                ));
                continue;
            }
            let pick = servers[rng.gen_range(0..servers.len())];
            assignments
                .entry(pick.conn.id())
                .or_insert_with(|| (pick.conn.clone(), Vec::new()))
                .1
                .push(job.id);
        }
    }

    let calls = assignments.into_values().map(|(conn, ids)| async move {
        let result =
            conn.send_request("run-manual", Some(json!({ "ids": ids.clone() }))).await;
        (ids, result)
    });
    let results = futures::future::join_all(calls).await;

    let mut jobs = serde_json::Map::new();
    let mut errors = serde_json::Map::new();
    for (ids, result) in results {
        match result.and_then(|response| response.into_result()) {
            Ok(data) => {
                if let Some(Value::Object(mut body)) = data {
                    if let Some(Value::Object(worker_jobs)) = body.remove("jobs") {
                        jobs.extend(worker_jobs);
                    }
                    if let Some(Value::Object(worker_errors)) = body.remove("errors") {
                        errors.extend(worker_errors);
                    }
                }
            }
            Err(e) => {
                for id in ids {
                    errors.insert(id.to_string(), Value::String(e.to_string()));
                }
            }
        }
    }
    for (id, reason) in exceptions {
        errors.insert(id.to_string(), Value::String(reason));
    }

    Ok(json!({ "jobs": jobs, "errors": errors }))
}

/// Keepalive: ping every registered worker on a fixed interval. A dead
/// connection surfaces as a close, which removes the registry entry.
async fn ping_loop(state: Arc<MasterState>) {
    let interval = Duration::from_secs(state.config.ping_interval);
    loop {
        tokio::time::sleep(interval).await;
        let conns: Vec<Arc<Connection>> =
            state.registry.lock().unwrap().iter().map(|entry| entry.conn.clone()).collect();
        for conn in conns {
            conn.send(Message::Ping);
        }
    }
}

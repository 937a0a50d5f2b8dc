// src/lib.rs

//! dispatchd — distributed job execution over a shared table
//!
//! Two cooperating daemons with a relational job table as the source of
//! truth:
//!
//! - **Worker**: claims `waiting` rows under row locks, runs each job as a
//!   child process with per-target bounded concurrency, and writes results
//!   back. Never inserts or deletes rows.
//! - **Master**: tracks registered workers and routes client pokes, pause /
//!   continue, and manual runs to whoever serves the named targets.
//!
//! Both speak the same framed protocol: JSON array messages separated by an
//! EOT byte over TCP, with request/response correlation and an optional
//! shared-secret handshake.

pub mod config;
mod error;
pub mod master;
pub mod net;
pub mod proto;
pub mod store;
pub mod util;
pub mod worker;

pub use config::{MasterConfig, WorkerConfig};
pub use error::{Error, Result};
pub use net::{AuthPolicy, Connection, FrameHandler, Router};
pub use proto::{Message, Request, Response};
pub use store::{JobStatus, JobStore, JobVerdict};

// src/net/mod.rs

//! Connection handling shared by the worker and master daemons.

pub mod connection;
pub mod router;
pub mod server;

pub use connection::{AuthPolicy, Connection, FrameHandler};
pub use router::Router;

// src/net/router.rs

//! Request routing.
//!
//! A `Router` maps request-type strings to handlers over some shared daemon
//! state. Handler failures of any kind become error responses; the
//! connection layer takes care of attaching the request's sequence number.

use crate::error::{Error, Result};
use crate::net::connection::{Connection, FrameHandler};
use crate::proto::Request;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

type HandlerFn<S> =
    Box<dyn Fn(Arc<S>, Option<Value>, Arc<Connection>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

type CloseFn<S> = Box<dyn Fn(Arc<S>, Arc<Connection>) + Send + Sync>;

pub struct Router<S> {
    state: Arc<S>,
    handlers: HashMap<&'static str, HandlerFn<S>>,
    on_close: Option<CloseFn<S>>,
}

impl<S: Send + Sync + 'static> Router<S> {
    pub fn new(state: Arc<S>) -> Self {
        Self { state, handlers: HashMap::new(), on_close: None }
    }

    pub fn state(&self) -> &Arc<S> {
        &self.state
    }

    /// Register a handler for one request type.
    pub fn route<F, Fut>(mut self, request_type: &'static str, handler: F) -> Self
    where
        F: Fn(Arc<S>, Option<Value>, Arc<Connection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.handlers
            .insert(request_type, Box::new(move |state, data, conn| Box::pin(handler(state, data, conn))));
        self
    }

    /// Register a callback invoked when a connection served by this router
    /// closes.
    pub fn on_close<F>(mut self, callback: F) -> Self
    where
        F: Fn(Arc<S>, Arc<Connection>) + Send + Sync + 'static,
    {
        self.on_close = Some(Box::new(callback));
        self
    }
}

#[async_trait]
impl<S: Send + Sync + 'static> FrameHandler for Router<S> {
    async fn handle_request(&self, request: Request, conn: &Arc<Connection>) -> Result<Value> {
        match self.handlers.get(request.request_type.as_str()) {
            Some(handler) => handler(self.state.clone(), request.data, conn.clone()).await,
            None => Err(Error::Protocol(format!(
                "unknown request type: '{}'",
                request.request_type
            ))),
        }
    }

    async fn connection_closed(&self, conn: &Arc<Connection>) {
        if let Some(callback) = &self.on_close {
            callback(self.state.clone(), conn.clone());
        }
    }
}

/// Decode an optional request payload, falling back to defaults when the
/// payload is absent entirely.
pub fn decode_payload<T: DeserializeOwned + Default>(data: Option<Value>) -> Result<T> {
    match data {
        None => Ok(T::default()),
        Some(value) => serde_json::from_value(value)
            .map_err(|e| Error::Validation(format!("invalid payload: {e}"))),
    }
}

/// Decode a request payload that must be present.
pub fn require_payload<T: DeserializeOwned>(data: Option<Value>) -> Result<T> {
    match data {
        None => Err(Error::Validation("missing payload".to_string())),
        Some(value) => serde_json::from_value(value)
            .map_err(|e| Error::Validation(format!("invalid payload: {e}"))),
    }
}

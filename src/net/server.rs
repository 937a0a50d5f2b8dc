// src/net/server.rs

//! TCP accept loop shared by both daemons.

use crate::error::Result;
use crate::net::connection::{AuthPolicy, Connection, FrameHandler};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Accept connections forever, handing each to the frame handler.
pub async fn accept_loop(
    listener: TcpListener,
    auth: AuthPolicy,
    handler: Arc<dyn FrameHandler>,
) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted connection");
                Connection::accept(stream, peer, &auth, handler.clone());
            }
            Err(e) => warn!("failed to accept connection: {e}"),
        }
    }
}

/// Run the accept loop until ctrl-c.
///
/// Running jobs are deliberately left alone on shutdown; a killed child
/// would strand its row in `running`, and recovery of such rows is an
/// external concern.
pub async fn serve(
    listener: TcpListener,
    auth: AuthPolicy,
    handler: Arc<dyn FrameHandler>,
) -> Result<()> {
    tokio::select! {
        result = accept_loop(listener, auth, handler) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            Ok(())
        }
    }
}

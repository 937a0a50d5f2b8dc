// src/net/connection.rs

//! One TCP peer.
//!
//! A `Connection` owns its socket through two background tasks: a reader
//! that cuts the byte stream at each frame separator and dispatches decoded
//! messages, and a writer fed through an unbounded channel so any task can
//! send without holding the socket.
//!
//! Requests flowing out are correlated with responses flowing in through a
//! per-connection sequence number; each outstanding request parks a one-shot
//! channel that is fulfilled by the matching response, or failed with a
//! socket-closed error when the peer goes away.
//!
//! # Authorization
//!
//! A connection starts authorized when no password is configured, or when
//! the peer is loopback and the localhost bypass is enabled. The first
//! request on an unauthorized connection must carry the configured password;
//! a mismatch is answered with an error response and the connection is
//! closed.

use crate::error::{Error, Result};
use crate::proto::codec::{decode_frame, encode_frame};
use crate::proto::{FRAME_SEPARATOR, Message, Request, Response, SequenceNo};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

/// Receives decoded requests and close notifications for one connection.
#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    async fn handle_request(&self, request: Request, conn: &Arc<Connection>) -> Result<Value>;

    async fn connection_closed(&self, conn: &Arc<Connection>) {
        let _ = conn;
    }
}

/// Connection-scoped authentication settings.
#[derive(Debug, Clone, Default)]
pub struct AuthPolicy {
    pub password: Option<String>,
    pub allow_localhost: bool,
}

impl AuthPolicy {
    fn initially_authorized(&self, peer: &SocketAddr) -> bool {
        self.password.is_none() || (self.allow_localhost && peer.ip().is_loopback())
    }
}

enum WriterCmd {
    Frame(Message),
    Shutdown,
}

static CONNECTION_IDS: AtomicU64 = AtomicU64::new(1);

pub struct Connection {
    id: u64,
    peer: SocketAddr,
    writer: mpsc::UnboundedSender<WriterCmd>,
    pending: Mutex<HashMap<u32, oneshot::Sender<Result<Response>>>>,
    seq: Mutex<SequenceNo>,
    authorized: AtomicBool,
    /// Password expected from the peer on inbound requests.
    expected_password: Option<String>,
    /// Password attached to outgoing requests.
    request_password: Option<String>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl Connection {
    /// Wrap an accepted socket and start serving it.
    pub fn accept(
        stream: TcpStream,
        peer: SocketAddr,
        auth: &AuthPolicy,
        handler: Arc<dyn FrameHandler>,
    ) -> Arc<Self> {
        Self::establish(
            stream,
            peer,
            auth.initially_authorized(&peer),
            auth.password.clone(),
            None,
            handler,
        )
    }

    /// Dial a remote daemon. Outbound connections never demand a password
    /// from the peer; `request_password` is attached to every request we
    /// send so the remote end can authorize us.
    pub async fn connect(
        addr: &str,
        handler: Arc<dyn FrameHandler>,
        request_password: Option<String>,
    ) -> Result<Arc<Self>> {
        let stream = TcpStream::connect(addr).await?;
        let peer = stream.peer_addr()?;
        Ok(Self::establish(stream, peer, true, None, request_password, handler))
    }

    fn establish(
        stream: TcpStream,
        peer: SocketAddr,
        authorized: bool,
        expected_password: Option<String>,
        request_password: Option<String>,
        handler: Arc<dyn FrameHandler>,
    ) -> Arc<Self> {
        let (read_half, write_half) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        let conn = Arc::new(Connection {
            id: CONNECTION_IDS.fetch_add(1, Ordering::Relaxed),
            peer,
            writer: writer_tx,
            pending: Mutex::new(HashMap::new()),
            seq: Mutex::new(SequenceNo::new()),
            authorized: AtomicBool::new(authorized),
            expected_password,
            request_password,
            closed: AtomicBool::new(false),
            closed_tx,
        });

        tokio::spawn(write_loop(write_half, writer_rx));
        tokio::spawn(read_loop(conn.clone(), read_half, closed_rx, handler));
        conn
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queue a message for the writer task. Errors are irrelevant here:
    /// a closed connection already failed every outstanding request.
    pub fn send(&self, message: Message) {
        let _ = self.writer.send(WriterCmd::Frame(message));
    }

    pub fn send_response(&self, response: Response) {
        self.send(Message::Response(response));
    }

    /// Send a request and wait for the correlated response.
    pub async fn send_request(&self, request_type: &str, data: Option<Value>) -> Result<Response> {
        if self.is_closed() {
            return Err(Error::SocketClosed);
        }
        let no = self.seq.lock().unwrap().next();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(no, tx);

        // The close path may have drained `pending` before our insert; make
        // sure a racing close cannot strand the waiter.
        if self.is_closed() {
            self.pending.lock().unwrap().remove(&no);
            return Err(Error::SocketClosed);
        }

        self.send(Message::Request(Request {
            no,
            request_type: request_type.to_string(),
            data,
            password: self.request_password.clone(),
        }));

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::SocketClosed),
        }
    }

    /// Close the connection, failing all outstanding requests.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.closed_tx.send(true);
        let _ = self.writer.send(WriterCmd::Shutdown);
        let waiters: Vec<_> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in waiters {
            let _ = tx.send(Err(Error::SocketClosed));
        }
    }

    /// Wait until the connection is closed from either side.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    fn fulfill(&self, response: Response) {
        let waiter = self.pending.lock().unwrap().remove(&response.no);
        match waiter {
            Some(tx) => {
                let _ = tx.send(Ok(response));
            }
            None => warn!(peer = %self.peer, no = response.no, "unsolicited response discarded"),
        }
    }
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<WriterCmd>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCmd::Frame(message) => {
                if write_half.write_all(&encode_frame(&message)).await.is_err() {
                    break;
                }
            }
            WriterCmd::Shutdown => break,
        }
    }
    let _ = write_half.shutdown().await;
}

async fn read_loop(
    conn: Arc<Connection>,
    read_half: tokio::net::tcp::OwnedReadHalf,
    mut closed_rx: watch::Receiver<bool>,
    handler: Arc<dyn FrameHandler>,
) {
    let mut reader = BufReader::new(read_half);
    let mut buf: Vec<u8> = Vec::new();

    loop {
        buf.clear();
        let read = tokio::select! {
            _ = closed_rx.changed() => break,
            read = reader.read_until(FRAME_SEPARATOR, &mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() != Some(&FRAME_SEPARATOR) {
                    // EOF in the middle of a frame.
                    break;
                }
                match decode_frame(&buf) {
                    Ok(message) => dispatch(&conn, message, &handler),
                    Err(e) => {
                        // The sender's sequence number is unrecoverable.
                        warn!(peer = %conn.peer, "dropping bad frame: {e}");
                        conn.send_response(Response::error(0, e.to_string()));
                    }
                }
            }
            Err(e) => {
                debug!(peer = %conn.peer, "read failed: {e}");
                break;
            }
        }
    }

    conn.close();
    handler.connection_closed(&conn).await;
}

fn dispatch(conn: &Arc<Connection>, message: Message, handler: &Arc<dyn FrameHandler>) {
    match message {
        Message::Ping => conn.send(Message::Pong),
        Message::Pong => trace!(peer = %conn.peer, "pong"),
        Message::Response(response) => conn.fulfill(response),
        Message::Request(request) => {
            if !conn.authorized.load(Ordering::SeqCst) {
                let supplied = request.password.as_deref();
                if conn.expected_password.is_some()
                    && supplied == conn.expected_password.as_deref()
                {
                    conn.authorized.store(true, Ordering::SeqCst);
                } else {
                    warn!(peer = %conn.peer, "rejecting unauthorized request");
                    conn.send_response(Response::error(
                        request.no,
                        Error::InvalidPassword.to_string(),
                    ));
                    conn.close();
                    return;
                }
            }
            let conn = conn.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                let no = request.no;
                match handler.handle_request(request, &conn).await {
                    Ok(data) => conn.send_response(Response::ok(no, data)),
                    Err(e) => conn.send_response(Response::error(no, e.to_string())),
                }
            });
        }
    }
}

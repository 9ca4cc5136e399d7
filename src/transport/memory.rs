//! In-memory transport mesh.
//!
//! Wires any number of in-process nodes together without sockets. Used by
//! the integration tests to run whole clusters in one process; the
//! production embedding supplies real framed TCP instead.

use super::{Frame, FrameConn, FrameHandler, NetLink, NetServer, ReplySender};
use crate::error::{Result, RookeryError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const CONN_DEPTH: usize = 1024;

/// One accepted connection as seen by the server side.
struct ServerConn {
    rx: mpsc::Receiver<Frame>,
    reply_tx: mpsc::Sender<Frame>,
}

type AcceptMap = Arc<Mutex<HashMap<String, mpsc::Sender<ServerConn>>>>;

/// A process-local mesh of listeners addressable by string address.
#[derive(Clone, Default)]
pub struct MemoryMesh {
    accepts: AcceptMap,
}

impl MemoryMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outbound connector half, for [`super::Peer`] workers.
    pub fn connector(&self) -> Arc<dyn NetLink> {
        Arc::new(MemoryConnector {
            accepts: Arc::clone(&self.accepts),
        })
    }

    /// Listener half bound to `addr`. Accepting begins on `start`.
    pub fn server(&self, addr: &str) -> Arc<MemoryNetServer> {
        Arc::new(MemoryNetServer {
            addr: addr.to_string(),
            accepts: Arc::clone(&self.accepts),
            accept_task: Mutex::new(None),
            conn_tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

struct MemoryConnector {
    accepts: AcceptMap,
}

#[async_trait]
impl NetLink for MemoryConnector {
    async fn connect(&self, addr: &str) -> Result<Box<dyn FrameConn>> {
        let accept_tx = self
            .accepts
            .lock()
            .get(addr)
            .cloned()
            .ok_or_else(|| refused(addr))?;

        let (c2s_tx, c2s_rx) = mpsc::channel(CONN_DEPTH);
        let (s2c_tx, s2c_rx) = mpsc::channel(CONN_DEPTH);
        accept_tx
            .try_send(ServerConn {
                rx: c2s_rx,
                reply_tx: s2c_tx,
            })
            .map_err(|_| refused(addr))?;

        Ok(Box::new(MemoryConn {
            tx: c2s_tx,
            rx: s2c_rx,
        }))
    }
}

fn refused(addr: &str) -> RookeryError {
    RookeryError::Io(io::Error::new(
        io::ErrorKind::ConnectionRefused,
        format!("no listener at {}", addr),
    ))
}

struct MemoryConn {
    tx: mpsc::Sender<Frame>,
    rx: mpsc::Receiver<Frame>,
}

#[async_trait]
impl FrameConn for MemoryConn {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| RookeryError::Canceled)
    }

    async fn recv(&mut self) -> Result<Frame> {
        self.rx.recv().await.ok_or(RookeryError::Canceled)
    }
}

/// In-memory [`NetServer`]. Stopping drops every accepted connection, so
/// connected peers observe a closed link and fall back to redialing.
pub struct MemoryNetServer {
    addr: String,
    accepts: AcceptMap,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    conn_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

#[async_trait]
impl NetServer for MemoryNetServer {
    async fn start(&self, handler: Arc<dyn FrameHandler>) -> Result<()> {
        let (accept_tx, mut accept_rx) = mpsc::channel::<ServerConn>(64);
        self.accepts.lock().insert(self.addr.clone(), accept_tx);

        let conn_tasks = Arc::clone(&self.conn_tasks);
        let accept = tokio::spawn(async move {
            while let Some(mut conn) = accept_rx.recv().await {
                let handler = Arc::clone(&handler);
                let task = tokio::spawn(async move {
                    while let Some(frame) = conn.rx.recv().await {
                        handler.on_frame(ReplySender::new(conn.reply_tx.clone()), frame);
                    }
                });
                conn_tasks.lock().push(task);
            }
        });
        *self.accept_task.lock() = Some(accept);
        Ok(())
    }

    async fn stop(&self) {
        self.accepts.lock().remove(&self.addr);
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        let tasks: Vec<_> = self.conn_tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
    }
}

//! TCP listener hosting the signaling hub
//!
//! Each accepted connection gets a reader loop and a writer task. Decoded
//! events are dispatched into the hub behind a single mutex, so every state
//! mutation and its notification fan-out happen in one critical section.
//! Outbound delivery goes through bounded per-connection queues with
//! non-blocking sends; a saturated or gone connection drops the event rather
//! than stalling the mutation path.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::WriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use beacon_core::{ClientEvent, ConnId, Hub, HubConfig, Outbox, ServerEvent};

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};

/// Queued outbound events per connection before sends are dropped
const SEND_QUEUE_DEPTH: usize = 64;

/// Registry of per-connection send handles; the hub's outbox.
#[derive(Clone, Default)]
pub struct ConnRegistry {
    senders: Arc<Mutex<HashMap<ConnId, mpsc::Sender<ServerEvent>>>>,
}

impl ConnRegistry {
    fn insert(&self, conn: ConnId, tx: mpsc::Sender<ServerEvent>) {
        self.senders.lock().unwrap().insert(conn, tx);
    }

    fn remove(&self, conn: ConnId) {
        self.senders.lock().unwrap().remove(&conn);
    }
}

impl Outbox for ConnRegistry {
    fn send(&self, conn: ConnId, event: ServerEvent) {
        let senders = self.senders.lock().unwrap();
        match senders.get(&conn) {
            Some(tx) => {
                if tx.try_send(event).is_err() {
                    debug!(conn = %conn, "Send queue full or closed; dropping event");
                }
            }
            None => debug!(conn = %conn, "Unknown connection; dropping event"),
        }
    }
}

/// Signaling server handle
pub struct Server {
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Bind the listener and start accepting connections
    pub async fn start(addr: SocketAddr, config: HubConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let bound_addr = listener.local_addr()?;

        info!(addr = %bound_addr, "Server started");

        let (shutdown_tx, _) = broadcast::channel(1);
        let conns = ConnRegistry::default();
        let hub = Arc::new(Mutex::new(Hub::new(config, conns.clone())));

        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(accept_loop(listener, hub, conns, shutdown_rx));

        Ok(Server {
            addr: bound_addr,
            shutdown_tx,
        })
    }

    /// Get the server's bound address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        info!("Server shutdown initiated");
    }
}

/// Accept incoming connections
async fn accept_loop(
    listener: TcpListener,
    hub: Arc<Mutex<Hub<ConnRegistry>>>,
    conns: ConnRegistry,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "New connection");
                        let hub = hub.clone();
                        let conns = conns.clone();
                        tokio::spawn(handle_connection(stream, addr, hub, conns));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }
}

/// Handle a single client connection
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<Mutex<Hub<ConnRegistry>>>,
    conns: ConnRegistry,
) {
    let conn = Uuid::new_v4();
    let (mut reader, writer) = tokio::io::split(stream);

    let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
    conns.insert(conn, tx);
    let writer_handle = tokio::spawn(writer_task(writer, rx));

    info!(addr = %addr, conn = %conn, "Connection open");

    loop {
        match read_frame::<_, ClientEvent>(&mut reader).await {
            Ok(event) => {
                hub.lock().unwrap().handle(conn, event);
            }
            Err(Error::ConnectionClosed) => {
                debug!(conn = %conn, "Connection closed");
                break;
            }
            Err(e) => {
                warn!(conn = %conn, error = %e, "Read error");
                break;
            }
        }
    }

    // Unbind the send handle first so the disconnect fan-out cannot target
    // the dead connection.
    conns.remove(conn);
    hub.lock().unwrap().disconnect(conn);
    writer_handle.abort();

    info!(conn = %conn, "Connection cleaned up");
}

/// Writer task - sends events to the client
async fn writer_task(mut writer: WriteHalf<TcpStream>, mut rx: mpsc::Receiver<ServerEvent>) {
    while let Some(event) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &event).await {
            debug!(error = %e, "Write failed");
            break;
        }
    }
}

//! DeviceLink: the dedicated TCP socket a controller reconnects to after the
//! rendezvous handshake.
//!
//! # Lifecycle (for beginners)
//!
//! ```text
//! DeviceLink::open()
//!   └─ link task
//!        1. bind <bind_address>:0       -- the OS picks a free port
//!        2. publish the port            -- oneshot, read by the admission loop
//!        3. accept the controller       -- bounded by accept_timeout
//!        4. pump until closed:
//!             socket  → inbound channel  (DeviceLink::recv)
//!             outbound channel → socket  (DeviceLink::send)
//!             heartbeat payload every heartbeat_period
//! ```
//!
//! When the task ends for any reason (peer closed, I/O error, accept timeout,
//! cancellation, or every `DeviceLink` handle dropped) it cancels the link's
//! token, which resolves [`DeviceLink::closed`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Payload written to the controller on every heartbeat tick.
pub const DEFAULT_HEARTBEAT_PAYLOAD: &[u8] = b"keepalive\n";

const READ_BUFFER_SIZE: usize = 4096;
const CHANNEL_CAPACITY: usize = 64;

/// Errors that end a device link.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to bind device link on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("controller did not connect to port {port} within {timeout_ms} ms")]
    AcceptTimeout { port: u16, timeout_ms: u64 },

    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    #[error("controller closed the connection")]
    PeerClosed,

    #[error("link I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("the port receiver was dropped before the link bound")]
    PortUnclaimed,

    #[error("device link is closed")]
    Closed,
}

/// Settings for one device link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub bind_address: IpAddr,
    pub accept_timeout: Duration,
    pub heartbeat_period: Duration,
    pub heartbeat_payload: Vec<u8>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            accept_timeout: Duration::from_millis(4000),
            heartbeat_period: Duration::from_millis(1000),
            heartbeat_payload: DEFAULT_HEARTBEAT_PAYLOAD.to_vec(),
        }
    }
}

/// Handle to a running device link.
#[derive(Debug)]
pub struct DeviceLink {
    inbound: mpsc::Receiver<Vec<u8>>,
    outbound: mpsc::Sender<Vec<u8>>,
    token: CancellationToken,
}

impl DeviceLink {
    /// Spawns the link task and returns the handle plus a receiver that yields
    /// the dedicated port once it is bound.  The receiver errors when binding
    /// failed.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(config: LinkConfig, token: CancellationToken) -> (Self, oneshot::Receiver<u16>) {
        let (inbound_tx, inbound) = mpsc::channel(CHANNEL_CAPACITY);
        let (outbound, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (port_tx, port_rx) = oneshot::channel();

        tokio::spawn(run_link(config, port_tx, inbound_tx, outbound_rx, token.clone()));

        (
            Self {
                inbound,
                outbound,
                token,
            },
            port_rx,
        )
    }

    /// Next chunk of bytes read from the controller, or `None` once the link
    /// has ended.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }

    /// Queues `frame` for writing to the controller.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Closed`] when the link task has ended.
    pub async fn send(&self, frame: impl Into<Vec<u8>>) -> Result<(), LinkError> {
        self.outbound
            .send(frame.into())
            .await
            .map_err(|_| LinkError::Closed)
    }

    pub fn sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.outbound.clone()
    }

    /// Resolves once the link has ended.
    pub async fn closed(&self) {
        self.token.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

// ── Link task ─────────────────────────────────────────────────────────────────

async fn run_link(
    config: LinkConfig,
    port_tx: oneshot::Sender<u16>,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    outbound_rx: mpsc::Receiver<Vec<u8>>,
    token: CancellationToken,
) {
    match serve_link(&config, port_tx, inbound_tx, outbound_rx, &token).await {
        Ok(()) => info!("device link closed"),
        Err(e) => warn!("device link ended: {e}"),
    }
    token.cancel();
}

async fn serve_link(
    config: &LinkConfig,
    port_tx: oneshot::Sender<u16>,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    outbound_rx: mpsc::Receiver<Vec<u8>>,
    token: &CancellationToken,
) -> Result<(), LinkError> {
    let addr = SocketAddr::new(config.bind_address, 0);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| LinkError::Bind { addr, source })?;
    let port = listener.local_addr()?.port();

    port_tx.send(port).map_err(|_| LinkError::PortUnclaimed)?;
    debug!(port, "device link waiting for controller");

    let accepted = tokio::select! {
        _ = token.cancelled() => return Ok(()),
        accepted = timeout(config.accept_timeout, listener.accept()) => accepted,
    };
    let (stream, peer) = match accepted {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => return Err(LinkError::Accept(e)),
        Err(_) => {
            return Err(LinkError::AcceptTimeout {
                port,
                timeout_ms: config.accept_timeout.as_millis() as u64,
            })
        }
    };
    drop(listener);

    info!(%peer, port, "controller attached to device link");
    pump(stream, config, inbound_tx, outbound_rx, token).await
}

async fn pump(
    stream: TcpStream,
    config: &LinkConfig,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    mut outbound_rx: mpsc::Receiver<Vec<u8>>,
    token: &CancellationToken,
) -> Result<(), LinkError> {
    let (mut reader, mut writer) = stream.into_split();
    let period = config.heartbeat_period.max(Duration::from_millis(1));
    let mut heartbeat = interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    // Chunk waiting for inbound capacity; the socket is not read meanwhile.
    let mut pending: Option<Vec<u8>> = None;

    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            permit = inbound_tx.reserve(), if pending.is_some() => match permit {
                Ok(permit) => {
                    if let Some(chunk) = pending.take() {
                        permit.send(chunk);
                    }
                }
                Err(_) => {
                    debug!("inbound receiver dropped");
                    return Ok(());
                }
            },
            read = reader.read(&mut buf), if pending.is_none() => {
                let n = read?;
                if n == 0 {
                    return Err(LinkError::PeerClosed);
                }
                pending = Some(buf[..n].to_vec());
            }
            frame = outbound_rx.recv() => match frame {
                Some(frame) => writer.write_all(&frame).await?,
                None => return Ok(()),
            },
            _ = heartbeat.tick() => writer.write_all(&config.heartbeat_payload).await?,
        }
    }
}

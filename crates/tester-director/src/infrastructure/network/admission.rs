//! Admission listener: the rendezvous handshake that hands every controller
//! its own [`DeviceLink`].
//!
//! # Handshake (for beginners)
//!
//! ```text
//! controller                         admission loop
//!     │ ── connect :1500 ──────────────▶ │  accept (bounded)
//!     │                                  │  DeviceLink::open → hand-off channel
//!     │                                  │  wait for the link's port
//!     │ ◀──── port (u32, little-endian) ─ │
//!     │ ────── any acknowledgement ─────▶ │  read with deadline
//!     │                                  │  close rendezvous socket, restart
//!     │ ── connect :<port> ─────────────▶ DeviceLink
//! ```
//!
//! Every failure (accept timeout, I/O error, missing acknowledgement) closes
//! the rendezvous socket and restarts the cycle.  The loop only ends when its
//! cancellation token fires.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::infrastructure::network::link::{DeviceLink, LinkConfig, DEFAULT_HEARTBEAT_PAYLOAD};

pub const DEFAULT_RENDEZVOUS_PORT: u16 = 1500;
pub const DEFAULT_RENDEZVOUS_TIMEOUT: Duration = Duration::from_millis(4000);
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_millis(4000);
pub const DEFAULT_HANDOFF_CAPACITY: usize = 20;

/// Pause before retrying after an error other than an accept timeout.
const RESTART_BACKOFF: Duration = Duration::from_millis(250);

const ACK_BUFFER_SIZE: usize = 256;

/// Errors of a single handshake cycle.  None of them stops the loop.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("failed to bind rendezvous listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("no controller knocked within {0} ms")]
    AcceptTimeout(u64),

    #[error("rendezvous I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("link hand-off receiver is closed")]
    HandoffClosed,

    #[error("device link failed before binding its port")]
    LinkFailed,

    #[error("no acknowledgement within {0} ms")]
    AckTimeout(u64),

    #[error("controller closed the rendezvous socket before acknowledging")]
    PeerClosed,
}

impl AdmissionError {
    fn is_timeout(&self) -> bool {
        matches!(self, Self::AcceptTimeout(_))
    }
}

/// Settings of the admission listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionConfig {
    pub bind_address: IpAddr,
    pub rendezvous_port: u16,
    /// Accept timeout and acknowledgement deadline; also bounds the link's
    /// wait for the controller's reconnect.
    pub rendezvous_timeout: Duration,
    /// The link heartbeat fires at a quarter of this period.
    pub keepalive_timeout: Duration,
    pub handoff_capacity: usize,
    pub heartbeat_payload: Vec<u8>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            rendezvous_port: DEFAULT_RENDEZVOUS_PORT,
            rendezvous_timeout: DEFAULT_RENDEZVOUS_TIMEOUT,
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            handoff_capacity: DEFAULT_HANDOFF_CAPACITY,
            heartbeat_payload: DEFAULT_HEARTBEAT_PAYLOAD.to_vec(),
        }
    }
}

impl AdmissionConfig {
    pub fn heartbeat_period(&self) -> Duration {
        self.keepalive_timeout / 4
    }

    pub fn rendezvous_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.rendezvous_port)
    }

    fn link_config(&self) -> LinkConfig {
        LinkConfig {
            bind_address: self.bind_address,
            accept_timeout: self.rendezvous_timeout,
            heartbeat_period: self.heartbeat_period(),
            heartbeat_payload: self.heartbeat_payload.clone(),
        }
    }
}

/// Starts the admission loop.  Returns the receiver of established links and
/// the loop's task handle.
///
/// Links are opened under child tokens of `cancel`, so cancelling it stops
/// the loop and every link it produced.
pub fn start_admission(
    config: AdmissionConfig,
    cancel: CancellationToken,
) -> (mpsc::Receiver<DeviceLink>, JoinHandle<()>) {
    let (links_tx, links_rx) = mpsc::channel(config.handoff_capacity.max(1));
    let handle = tokio::spawn(run_admission(config, links_tx, cancel));
    (links_rx, handle)
}

async fn run_admission(
    config: AdmissionConfig,
    links_tx: mpsc::Sender<DeviceLink>,
    cancel: CancellationToken,
) {
    info!(addr = %config.rendezvous_addr(), "admission listener started");

    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = admit_one(&config, &links_tx, &cancel) => outcome,
        };

        match outcome {
            Ok(ack) => info!(ack = %ack, "controller admitted"),
            Err(e) if e.is_timeout() => debug!("{e}"),
            Err(e) => {
                warn!("handshake failed, restarting: {e}");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RESTART_BACKOFF) => {}
                }
            }
        }
    }

    info!("admission listener stopped");
}

/// One rendezvous cycle.  The listener is bound fresh and dropped at the end.
async fn admit_one(
    config: &AdmissionConfig,
    links_tx: &mpsc::Sender<DeviceLink>,
    cancel: &CancellationToken,
) -> Result<String, AdmissionError> {
    let addr = config.rendezvous_addr();
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| AdmissionError::Bind { addr, source })?;

    let (mut stream, peer) = match timeout(config.rendezvous_timeout, listener.accept()).await {
        Ok(accepted) => accepted?,
        Err(_) => {
            return Err(AdmissionError::AcceptTimeout(
                config.rendezvous_timeout.as_millis() as u64,
            ))
        }
    };
    drop(listener);
    debug!(%peer, "controller knocked on rendezvous port");

    let (link, port_rx) = DeviceLink::open(config.link_config(), cancel.child_token());
    let link_token = link.token();
    if links_tx.send(link).await.is_err() {
        link_token.cancel();
        return Err(AdmissionError::HandoffClosed);
    }

    let port = port_rx.await.map_err(|_| AdmissionError::LinkFailed)?;
    info!(%peer, port, "device link bound, sending port");

    negotiate(&mut stream, port, config.rendezvous_timeout).await
}

/// Writes `port` to the controller and waits for its acknowledgement.
///
/// The port is encoded as a little-endian `u32`.  Any non-empty read counts
/// as the acknowledgement; its text is returned.
///
/// # Errors
///
/// [`AdmissionError::AckTimeout`] when nothing arrives before `ack_timeout`,
/// [`AdmissionError::PeerClosed`] on end of stream, [`AdmissionError::Io`] on
/// socket errors.
pub async fn negotiate<S>(stream: &mut S, port: u16, ack_timeout: Duration) -> Result<String, AdmissionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&u32::from(port).to_le_bytes()).await?;
    stream.flush().await?;

    let mut buf = [0u8; ACK_BUFFER_SIZE];
    let n = match timeout(ack_timeout, stream.read(&mut buf)).await {
        Ok(read) => read?,
        Err(_) => return Err(AdmissionError::AckTimeout(ack_timeout.as_millis() as u64)),
    };
    if n == 0 {
        return Err(AdmissionError::PeerClosed);
    }

    Ok(String::from_utf8_lossy(&buf[..n]).trim().to_string())
}

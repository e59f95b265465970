//! Connecting side: the mirror of a server worker, plus the connect and
//! disconnect transitions.

use std::io;
use std::net::TcpStream;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::frame::SendError;
use crate::settings::EndpointSettings;
use crate::worker::{LinkState, PacketHandler, Worker};

/// Packet client: one outgoing connection with the same framing, dispatch,
/// and teardown behavior as a server-side worker.
pub struct PacketClient {
    settings: EndpointSettings,
    handler: Arc<dyn PacketHandler>,
    link: Mutex<Option<Arc<Worker>>>,
}

impl PacketClient {
    pub fn new(settings: EndpointSettings, handler: Arc<dyn PacketHandler>) -> Self {
        Self {
            settings,
            handler,
            link: Mutex::new(None),
        }
    }

    /// Resolve the endpoint and try each candidate address until a connection
    /// succeeds, then start the receive loop.
    pub fn connect(&self) -> Result<(), ConnectError> {
        let mut link = self.link.lock();
        if link.is_some() {
            return Err(ConnectError::AlreadyConnected);
        }
        let addrs = self.settings.resolve().map_err(ConnectError::Socket)?;
        let mut last_err = None;
        for addr in &addrs {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    let worker = Worker::start(
                        stream,
                        *addr,
                        self.handler.clone(),
                        self.settings.lock_policy,
                        self.settings.dispatch_wait(),
                        self.settings.max_frame_len,
                    )
                    .map_err(ConnectError::Socket)?;
                    info!(peer = %addr, "connected");
                    *link = Some(worker);
                    return Ok(());
                }
                Err(e) => {
                    debug!(peer = %addr, error = %e, "connect candidate failed");
                    last_err = Some(e);
                }
            }
        }
        Err(ConnectError::Exhausted(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no candidate addresses")
        })))
    }

    pub fn state(&self) -> LinkState {
        self.link
            .lock()
            .as_ref()
            .map_or(LinkState::Idle, |w| w.state())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.link.lock().as_ref().map(|w| w.peer_addr())
    }

    /// Send one framed packet; returns the total bytes written.
    pub fn send(&self, payload: &[u8]) -> Result<usize, SendError> {
        let link = self.link.lock();
        match link.as_ref() {
            Some(worker) => worker.send(payload),
            None => Err(SendError::NotConnected),
        }
    }

    /// One-sided shutdown, join the receive loop, drain dispatch threads.
    /// Idempotent; a later `connect` may reuse this client.
    pub fn disconnect(&self) {
        if let Some(worker) = self.link.lock().take() {
            worker.close();
        }
    }
}

impl Drop for PacketClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("already connected")]
    AlreadyConnected,
    #[error("no candidate address accepted the connection: {0}")]
    Exhausted(io::Error),
    #[error("socket error: {0}")]
    Socket(io::Error),
}

//! Per-connection worker: a dedicated receive-loop thread, a policy-selected
//! send lock, and the tracked set of per-packet dispatch threads.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::frame::{self, SendError};
use crate::lock::{new_lock, Lock, LockGuard, LockPolicy};
use crate::packet::Packet;
use crate::registry::TaskRegistry;

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Idle = 0,
    Connected = 1,
    Disconnecting = 2,
    Terminated = 3,
}

impl LinkState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LinkState::Idle,
            1 => LinkState::Connected,
            2 => LinkState::Disconnecting,
            _ => LinkState::Terminated,
        }
    }
}

/// The single required override: parse one received packet. Runs on an
/// ephemeral dispatch thread; `conn` is live for replies.
pub trait PacketHandler: Send + Sync + 'static {
    fn on_packet(&self, conn: &Connection, packet: Packet);
}

/// Per-connection shared state: the socket, the send lock serializing
/// writers, and the in-flight dispatch registry.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    send_lock: Box<dyn Lock>,
    state: AtomicU8,
    tasks: Arc<TaskRegistry>,
    max_frame_len: u32,
}

impl Connection {
    fn new(stream: TcpStream, peer: SocketAddr, policy: LockPolicy, max_frame_len: u32) -> Self {
        Self {
            stream,
            peer,
            send_lock: new_lock(policy),
            state: AtomicU8::new(LinkState::Idle as u8),
            tasks: Arc::new(TaskRegistry::new()),
            max_frame_len,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: LinkState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: LinkState, to: LinkState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Send one framed packet. The send lock serializes writers, so frames
    /// from concurrent senders are never interleaved on the wire. Returns
    /// the total bytes written.
    pub fn send(&self, payload: &[u8]) -> Result<usize, SendError> {
        let _guard = LockGuard::new(&*self.send_lock);
        frame::write_frame(&mut &self.stream, payload, self.max_frame_len)
    }

    /// Packets currently being parsed.
    pub fn in_flight(&self) -> usize {
        self.tasks.active()
    }

    /// One-sided shutdown under the send lock: a thread blocked in the
    /// receive loop unblocks with an error or zero read.
    fn shutdown(&self) {
        let _guard = LockGuard::new(&*self.send_lock);
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// One accepted or outgoing connection; owns the receive-loop thread.
///
/// The socket is closed exactly once, when the last owner of the inner
/// connection drops.
pub struct Worker {
    conn: Arc<Connection>,
    recv: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Worker {
    /// Take ownership of a connected stream and start the receive loop.
    pub(crate) fn start(
        stream: TcpStream,
        peer: SocketAddr,
        handler: Arc<dyn PacketHandler>,
        policy: LockPolicy,
        dispatch_wait: Option<Duration>,
        max_frame_len: u32,
    ) -> io::Result<Arc<Self>> {
        let conn = Arc::new(Connection::new(stream, peer, policy, max_frame_len));
        conn.set_state(LinkState::Connected);
        let loop_conn = conn.clone();
        let recv = thread::Builder::new()
            .name(format!("framelink-recv-{peer}"))
            .spawn(move || receive_loop(loop_conn, handler, dispatch_wait))?;
        Ok(Arc::new(Self {
            conn,
            recv: Mutex::new(Some(recv)),
        }))
    }

    pub fn conn(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer
    }

    pub fn state(&self) -> LinkState {
        self.conn.state()
    }

    pub fn is_terminated(&self) -> bool {
        self.conn.state() == LinkState::Terminated
    }

    pub fn send(&self, payload: &[u8]) -> Result<usize, SendError> {
        if self.conn.state() != LinkState::Connected {
            return Err(SendError::NotConnected);
        }
        self.conn.send(payload)
    }

    /// Tear the connection down: shut the socket so the receive loop
    /// unblocks, then wait for it (and, through it, the bounded dispatch
    /// drain) to finish. Idempotent.
    pub fn close(&self) {
        self.conn
            .transition(LinkState::Connected, LinkState::Disconnecting);
        self.conn.shutdown();
        if let Some(handle) = self.recv.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.close();
    }
}

/// Blocking receive loop, one thread per connection: read a full frame,
/// hand it to a fresh dispatch thread, repeat until the connection dies.
fn receive_loop(
    conn: Arc<Connection>,
    handler: Arc<dyn PacketHandler>,
    dispatch_wait: Option<Duration>,
) {
    let peer = conn.peer;
    loop {
        match frame::read_frame(&mut &conn.stream, conn.max_frame_len) {
            Ok(Some(payload)) => {
                let packet = Packet::from_vec(payload);
                let task_conn = conn.clone();
                let task_handler = handler.clone();
                let spawned = conn.tasks.spawn("dispatch", move || {
                    task_handler.on_packet(&task_conn, packet);
                });
                if let Err(e) = spawned {
                    // Resource exhaustion: drop this packet, keep the
                    // connection up.
                    error!(%peer, error = %e, "could not spawn dispatch thread");
                }
            }
            Ok(None) => {
                debug!(%peer, "peer closed connection");
                break;
            }
            Err(e) => {
                if conn.state() == LinkState::Disconnecting {
                    debug!(%peer, "receive loop unblocked for shutdown");
                } else {
                    warn!(%peer, error = %e, "receive failed; closing connection");
                }
                break;
            }
        }
    }
    conn.transition(LinkState::Connected, LinkState::Disconnecting);
    conn.tasks.drain(dispatch_wait);
    conn.set_state(LinkState::Terminated);
    debug!(%peer, "connection terminated");
}

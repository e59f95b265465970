//! Datagram variant: no length prefix, one datagram is one packet.

use std::io::{self, ErrorKind};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::frame::SendError;
use crate::packet::Packet;
use crate::registry::TaskRegistry;
use crate::settings::EndpointSettings;
use crate::worker::LinkState;

/// Maximum payload of one datagram, fixed once at bind/connect time (the
/// IPv4 UDP payload ceiling).
pub const MAX_DATAGRAM: usize = 65_507;

/// How often the receive loop checks the stop flag.
const RECV_POLL: Duration = Duration::from_millis(100);

/// Parse one received datagram. Runs on an ephemeral dispatch thread.
pub trait DatagramHandler: Send + Sync + 'static {
    fn on_packet(&self, peer: SocketAddr, packet: Packet);
}

/// A bound or connected UDP endpoint with the same receive-loop-plus-
/// dispatch shape as a stream worker. Datagram boundaries are packet
/// boundaries; zero-length datagrams are valid packets.
pub struct DatagramPeer {
    socket: Arc<UdpSocket>,
    state: Arc<AtomicU8>,
    stop: Arc<AtomicBool>,
    tasks: Arc<TaskRegistry>,
    recv: Mutex<Option<thread::JoinHandle<()>>>,
    dispatch_wait: Option<Duration>,
    max_datagram: usize,
}

impl DatagramPeer {
    /// Bind to the endpoint address (with address reuse) and start the
    /// receive loop.
    pub fn bind(
        settings: &EndpointSettings,
        handler: Arc<dyn DatagramHandler>,
    ) -> io::Result<Self> {
        let addrs = settings.resolve()?;
        let mut last_err = None;
        for addr in &addrs {
            match bind_one(*addr) {
                Ok(socket) => return Self::start(socket, settings, handler),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| io::Error::new(ErrorKind::AddrNotAvailable, "no candidate addresses")))
    }

    /// Bind an ephemeral local socket, connect it to the endpoint, and start
    /// the receive loop.
    pub fn connect(
        settings: &EndpointSettings,
        handler: Arc<dyn DatagramHandler>,
    ) -> io::Result<Self> {
        let addrs = settings.resolve()?;
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        let mut last_err = None;
        for addr in &addrs {
            match socket.connect(addr) {
                Ok(()) => return Self::start(socket, settings, handler),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| io::Error::new(ErrorKind::AddrNotAvailable, "no candidate addresses")))
    }

    fn start(
        socket: UdpSocket,
        settings: &EndpointSettings,
        handler: Arc<dyn DatagramHandler>,
    ) -> io::Result<Self> {
        socket.set_read_timeout(Some(RECV_POLL))?;
        let socket = Arc::new(socket);
        let state = Arc::new(AtomicU8::new(LinkState::Connected as u8));
        let stop = Arc::new(AtomicBool::new(false));
        let tasks = Arc::new(TaskRegistry::new());

        let peer = Self {
            socket: socket.clone(),
            state: state.clone(),
            stop: stop.clone(),
            tasks: tasks.clone(),
            recv: Mutex::new(None),
            dispatch_wait: settings.dispatch_wait(),
            max_datagram: MAX_DATAGRAM,
        };
        let dispatch_wait = peer.dispatch_wait;
        let handle = thread::Builder::new()
            .name("framelink-udp-recv".to_string())
            .spawn(move || receive_loop(socket, state, stop, tasks, handler, dispatch_wait))?;
        *peer.recv.lock() = Some(handle);
        info!(addr = %peer.local_addr()?, "datagram peer up");
        Ok(peer)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn state(&self) -> LinkState {
        match self.state.load(Ordering::Acquire) {
            1 => LinkState::Connected,
            2 => LinkState::Disconnecting,
            3 => LinkState::Terminated,
            _ => LinkState::Idle,
        }
    }

    /// The largest payload one datagram carries, fixed at construction.
    pub fn max_datagram_size(&self) -> usize {
        self.max_datagram
    }

    /// Send one datagram to the connected peer.
    pub fn send(&self, payload: &[u8]) -> Result<usize, SendError> {
        self.check_size(payload)?;
        self.socket
            .send(payload)
            .map_err(|source| SendError::Io { written: 0, source })
    }

    /// Send one datagram to an explicit destination (bound, unconnected use).
    pub fn send_to(&self, payload: &[u8], dest: SocketAddr) -> Result<usize, SendError> {
        self.check_size(payload)?;
        self.socket
            .send_to(payload, dest)
            .map_err(|source| SendError::Io { written: 0, source })
    }

    fn check_size(&self, payload: &[u8]) -> Result<(), SendError> {
        if self.state() != LinkState::Connected {
            return Err(SendError::NotConnected);
        }
        if payload.len() > self.max_datagram {
            return Err(SendError::TooLarge {
                len: payload.len(),
            });
        }
        Ok(())
    }

    /// Stop the receive loop, join it, and drain dispatch threads.
    /// Idempotent.
    pub fn close(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self
            .state
            .compare_exchange(
                LinkState::Connected as u8,
                LinkState::Disconnecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        if let Some(handle) = self.recv.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DatagramPeer {
    fn drop(&mut self) {
        self.close();
    }
}

fn bind_one(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

fn receive_loop(
    socket: Arc<UdpSocket>,
    state: Arc<AtomicU8>,
    stop: Arc<AtomicBool>,
    tasks: Arc<TaskRegistry>,
    handler: Arc<dyn DatagramHandler>,
    dispatch_wait: Option<Duration>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }
        match socket.recv_from(&mut buf) {
            Ok((n, peer)) => {
                let packet = Packet::copy_from_slice(&buf[..n]);
                let task_handler = handler.clone();
                if let Err(e) = tasks.spawn("udp-dispatch", move || {
                    task_handler.on_packet(peer, packet);
                }) {
                    error!(%peer, error = %e, "could not spawn dispatch thread");
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "datagram receive failed; closing");
                break;
            }
        }
    }
    state.store(LinkState::Disconnecting as u8, Ordering::Release);
    tasks.drain(dispatch_wait);
    state.store(LinkState::Terminated as u8, Ordering::Release);
    debug!("datagram peer terminated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    struct Collect {
        tx: mpsc::Sender<(SocketAddr, Vec<u8>)>,
    }

    impl DatagramHandler for Collect {
        fn on_packet(&self, peer: SocketAddr, packet: Packet) {
            let _ = self.tx.send((peer, packet.payload().to_vec()));
        }
    }

    struct Ignore;

    impl DatagramHandler for Ignore {
        fn on_packet(&self, _peer: SocketAddr, _packet: Packet) {}
    }

    fn bound_peer() -> (DatagramPeer, mpsc::Receiver<(SocketAddr, Vec<u8>)>) {
        let (tx, rx) = mpsc::channel();
        let peer = DatagramPeer::bind(
            &EndpointSettings::for_addr("127.0.0.1", "0"),
            Arc::new(Collect { tx }),
        )
        .unwrap();
        (peer, rx)
    }

    #[test]
    fn datagram_round_trip() {
        let (receiver, rx) = bound_peer();
        let addr = receiver.local_addr().unwrap();
        let sender = DatagramPeer::connect(
            &EndpointSettings::for_addr("127.0.0.1", addr.port().to_string()),
            Arc::new(Ignore),
        )
        .unwrap();

        sender.send(b"PING").unwrap();
        let (_, got) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got, b"PING");

        sender.close();
        receiver.close();
    }

    #[test]
    fn zero_length_datagram_is_a_packet() {
        let (receiver, rx) = bound_peer();
        let addr = receiver.local_addr().unwrap();
        let sender = DatagramPeer::connect(
            &EndpointSettings::for_addr("127.0.0.1", addr.port().to_string()),
            Arc::new(Ignore),
        )
        .unwrap();

        sender.send(b"").unwrap();
        let (_, got) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got.len(), 0);

        sender.close();
        receiver.close();
    }

    #[test]
    fn oversize_datagram_is_rejected() {
        let (peer, _rx) = bound_peer();
        assert_eq!(peer.max_datagram_size(), MAX_DATAGRAM);
        let too_big = vec![0u8; MAX_DATAGRAM + 1];
        assert!(matches!(
            peer.send_to(&too_big, peer.local_addr().unwrap()),
            Err(SendError::TooLarge { .. })
        ));
        peer.close();
    }

    #[test]
    fn close_converges_and_rejects_sends() {
        let (peer, _rx) = bound_peer();
        peer.close();
        let deadline = Instant::now() + Duration::from_secs(5);
        while peer.state() != LinkState::Terminated && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(peer.state(), LinkState::Terminated);
        assert!(matches!(peer.send(b"x"), Err(SendError::NotConnected)));
        peer.close();
    }
}

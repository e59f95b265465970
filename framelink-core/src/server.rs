//! Listening side: bind with address reuse, accept connections on a
//! dedicated thread, build one worker per connection through a factory hook,
//! and sweep terminated workers from the tracked set.

use std::io::{self, ErrorKind};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::settings::EndpointSettings;
use crate::worker::{PacketHandler, Worker};

/// How often the accept loop checks the stop flag while idle.
const ACCEPT_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Started,
}

/// Server-side hook: build the packet handler for a freshly accepted
/// connection. One call per accept.
pub trait WorkerFactory: Send + Sync + 'static {
    fn build(&self, peer: SocketAddr) -> Arc<dyn PacketHandler>;
}

impl<F> WorkerFactory for F
where
    F: Fn(SocketAddr) -> Arc<dyn PacketHandler> + Send + Sync + 'static,
{
    fn build(&self, peer: SocketAddr) -> Arc<dyn PacketHandler> {
        self(peer)
    }
}

/// Packet server: listening socket plus the tracked set of per-connection
/// workers.
pub struct PacketServer {
    settings: EndpointSettings,
    factory: Arc<dyn WorkerFactory>,
    workers: Arc<Mutex<Vec<Arc<Worker>>>>,
    accept: Mutex<Option<thread::JoinHandle<()>>>,
    stop_flag: Arc<AtomicBool>,
    started: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl PacketServer {
    pub fn new(settings: EndpointSettings, factory: Arc<dyn WorkerFactory>) -> Self {
        Self {
            settings,
            factory,
            workers: Arc::new(Mutex::new(Vec::new())),
            accept: Mutex::new(None),
            stop_flag: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            local_addr: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ServerState {
        if self.started.load(Ordering::Acquire) {
            ServerState::Started
        } else {
            ServerState::Stopped
        }
    }

    /// Bound address once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Workers whose connection has not yet terminated.
    pub fn worker_count(&self) -> usize {
        self.workers
            .lock()
            .iter()
            .filter(|w| !w.is_terminated())
            .count()
    }

    /// Resolve the bind address, create the listening socket with address
    /// reuse, and spawn the accept-loop thread. Any socket-call failure is
    /// returned; the process stands.
    pub fn start(&self) -> Result<(), ServerError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ServerError::AlreadyStarted);
        }
        let listener = match self.bind() {
            Ok(l) => l,
            Err(e) => {
                self.started.store(false, Ordering::Release);
                return Err(e);
            }
        };
        let addr = listener.local_addr().map_err(ServerError::Socket)?;
        *self.local_addr.lock() = Some(addr);
        self.stop_flag.store(false, Ordering::Release);

        let stop = self.stop_flag.clone();
        let workers = self.workers.clone();
        let factory = self.factory.clone();
        let settings = self.settings.clone();
        let handle = thread::Builder::new()
            .name("framelink-accept".to_string())
            .spawn(move || accept_loop(listener, stop, workers, factory, settings))
            .map_err(ServerError::Socket)?;
        *self.accept.lock() = Some(handle);
        info!(%addr, "server started");
        Ok(())
    }

    fn bind(&self) -> Result<TcpListener, ServerError> {
        let addrs = self.settings.resolve().map_err(ServerError::Socket)?;
        let mut last_err = None;
        for addr in &addrs {
            match bind_one(*addr, self.settings.backlog) {
                Ok(listener) => return Ok(listener),
                Err(e) => last_err = Some(e),
            }
        }
        Err(ServerError::Socket(last_err.unwrap_or_else(|| {
            io::Error::new(ErrorKind::AddrNotAvailable, "no candidate addresses")
        })))
    }

    /// Close the listening socket, join the accept thread, then tear down
    /// every tracked worker. Idempotent.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        self.stop_flag.store(true, Ordering::Release);
        if let Some(handle) = self.accept.lock().take() {
            let _ = handle.join();
        }
        self.shutdown_workers();
        *self.local_addr.lock() = None;
        info!("server stopped");
    }

    /// Tear down every tracked worker without stopping the listener.
    pub fn shutdown_workers(&self) {
        let drained: Vec<Arc<Worker>> = std::mem::take(&mut *self.workers.lock());
        for worker in drained {
            worker.close();
        }
    }
}

impl Drop for PacketServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Listening socket with `SO_REUSEADDR`, non-blocking so the accept loop can
/// observe the stop flag.
fn bind_one(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    let listener: TcpListener = socket.into();
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn accept_loop(
    listener: TcpListener,
    stop: Arc<AtomicBool>,
    workers: Arc<Mutex<Vec<Arc<Worker>>>>,
    factory: Arc<dyn WorkerFactory>,
    settings: EndpointSettings,
) {
    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }
        sweep_terminated(&workers);
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!(%peer, error = %e, "dropping connection: socket setup failed");
                    continue;
                }
                let handler = factory.build(peer);
                match Worker::start(
                    stream,
                    peer,
                    handler,
                    settings.lock_policy,
                    settings.dispatch_wait(),
                    settings.max_frame_len,
                ) {
                    Ok(worker) => {
                        info!(%peer, "accepted connection");
                        workers.lock().push(worker);
                    }
                    // Resource exhaustion: refuse this connection, keep
                    // listening.
                    Err(e) => error!(%peer, error = %e, "failed to start worker"),
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset
                ) =>
            {
                warn!(error = %e, "transient accept error");
            }
            Err(e) => {
                error!(error = %e, "accept failed; stopping listener");
                break;
            }
        }
    }
    // Dropping the listener here closes the listening socket.
}

fn sweep_terminated(workers: &Mutex<Vec<Arc<Worker>>>) {
    workers.lock().retain(|w| !w.is_terminated());
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server already started")]
    AlreadyStarted,
    #[error("socket error: {0}")]
    Socket(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::PacketClient;
    use crate::frame;
    use crate::packet::Packet;
    use crate::worker::{Connection, LinkState};
    use std::collections::HashSet;
    use std::io::Write;
    use std::net::TcpStream;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Instant;

    /// Echoes every packet back on the same connection.
    struct Echo;

    impl PacketHandler for Echo {
        fn on_packet(&self, conn: &Connection, packet: Packet) {
            let _ = conn.send(packet.payload());
        }
    }

    /// Forwards received payloads to a channel.
    struct Collect {
        tx: mpsc::Sender<Vec<u8>>,
    }

    impl PacketHandler for Collect {
        fn on_packet(&self, _conn: &Connection, packet: Packet) {
            let _ = self.tx.send(packet.payload().to_vec());
        }
    }

    fn echo_server() -> PacketServer {
        let server = PacketServer::new(
            EndpointSettings::for_addr("127.0.0.1", "0"),
            Arc::new(|_peer: SocketAddr| Arc::new(Echo) as Arc<dyn PacketHandler>),
        );
        server.start().unwrap();
        server
    }

    fn client_for(server: &PacketServer) -> (PacketClient, mpsc::Receiver<Vec<u8>>) {
        let addr = server.local_addr().unwrap();
        let (tx, rx) = mpsc::channel();
        let client = PacketClient::new(
            EndpointSettings::for_addr(addr.ip().to_string(), addr.port().to_string()),
            Arc::new(Collect { tx }),
        );
        client.connect().unwrap();
        (client, rx)
    }

    fn wait_until(mut ready: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !ready() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(ready());
    }

    #[test]
    fn ping_round_trip() {
        let server = echo_server();
        let (client, rx) = client_for(&server);
        client.send(b"PING").unwrap();
        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got, b"PING");
        assert_eq!(got.len(), 4);
        client.disconnect();
        server.stop();
    }

    #[test]
    fn zero_length_packet_round_trip() {
        let server = echo_server();
        let (client, rx) = client_for(&server);
        client.send(b"").unwrap();
        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got.len(), 0);
        client.disconnect();
        server.stop();
    }

    #[test]
    fn close_after_prefix_only_spawns_no_dispatch() {
        let dispatched = Arc::new(AtomicUsize::new(0));
        let counter = dispatched.clone();
        struct Count(Arc<AtomicUsize>);
        impl PacketHandler for Count {
            fn on_packet(&self, _conn: &Connection, _packet: Packet) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let server = PacketServer::new(
            EndpointSettings::for_addr("127.0.0.1", "0"),
            Arc::new(move |_peer: SocketAddr| {
                Arc::new(Count(counter.clone())) as Arc<dyn PacketHandler>
            }),
        );
        server.start().unwrap();
        let addr = server.local_addr().unwrap();

        let mut raw = TcpStream::connect(addr).unwrap();
        raw.write_all(&10u32.to_le_bytes()).unwrap();
        drop(raw);

        // The worker must hit the connection-fatal path and get swept.
        wait_until(|| server.worker_count() == 0);
        assert_eq!(dispatched.load(Ordering::SeqCst), 0);
        server.stop();
    }

    #[test]
    fn concurrent_senders_never_interleave_frames() {
        let server = echo_server();
        let (client, rx) = client_for(&server);
        let client = Arc::new(client);

        let mut expected = HashSet::new();
        let mut senders = Vec::new();
        for t in 0u8..4 {
            let client = client.clone();
            let mut payloads = Vec::new();
            for i in 0u16..50 {
                // Distinct lengths and contents per (thread, index).
                let mut p = vec![t; 1 + (i as usize % 97)];
                p.extend_from_slice(&i.to_le_bytes());
                payloads.push(p);
            }
            expected.extend(payloads.iter().cloned());
            senders.push(thread::spawn(move || {
                for p in payloads {
                    client.send(&p).unwrap();
                }
            }));
        }
        for s in senders {
            s.join().unwrap();
        }

        // Every echoed frame must come back intact; any mid-frame
        // interleaving would corrupt the stream and fail the frame reads.
        let mut received = HashSet::new();
        for _ in 0..200 {
            received.insert(rx.recv_timeout(Duration::from_secs(10)).unwrap());
        }
        assert_eq!(received, expected);
        client.disconnect();
        server.stop();
    }

    #[test]
    fn stop_tears_down_workers_and_unblocks_clients() {
        let server = echo_server();
        let (client, _rx) = client_for(&server);
        wait_until(|| server.worker_count() == 1);

        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.worker_count(), 0);
        assert!(server.local_addr().is_none());

        // The client's receive loop sees the close and terminates.
        wait_until(|| client.state() == LinkState::Terminated);
        assert!(client.send(b"x").is_err());

        // Idempotent.
        server.stop();
    }

    #[test]
    fn shutdown_workers_keeps_listener_alive() {
        let server = echo_server();
        let (client, _rx) = client_for(&server);
        wait_until(|| server.worker_count() == 1);

        server.shutdown_workers();
        assert_eq!(server.worker_count(), 0);
        wait_until(|| client.state() == LinkState::Terminated);

        // Listener still accepts new connections.
        let (client2, rx2) = client_for(&server);
        client2.send(b"still alive").unwrap();
        assert_eq!(
            rx2.recv_timeout(Duration::from_secs(5)).unwrap(),
            b"still alive"
        );
        client2.disconnect();
        server.stop();
    }

    #[test]
    fn disconnected_workers_are_swept() {
        let server = echo_server();
        let (client, _rx) = client_for(&server);
        wait_until(|| server.worker_count() == 1);
        client.disconnect();
        wait_until(|| server.worker_count() == 0);
        server.stop();
    }

    #[test]
    fn start_twice_fails() {
        let server = echo_server();
        assert!(matches!(server.start(), Err(ServerError::AlreadyStarted)));
        server.stop();
    }

    #[test]
    fn raw_wire_format_is_length_prefixed() {
        let server = echo_server();
        let addr = server.local_addr().unwrap();
        let stream = TcpStream::connect(addr).unwrap();
        frame::write_frame(&mut &stream, b"RAW", frame::MAX_FRAME_LEN).unwrap();
        let echoed = frame::read_frame(&mut &stream, frame::MAX_FRAME_LEN)
            .unwrap()
            .unwrap();
        assert_eq!(echoed, b"RAW");
        drop(stream);
        server.stop();
    }
}

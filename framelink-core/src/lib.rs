//! Connection-oriented packet runtime: length-prefix framed TCP server and
//! client with one receive thread per connection and one ephemeral dispatch
//! thread per received packet, plus a datagram variant.

pub mod client;
pub mod frame;
pub mod lock;
pub mod packet;
pub mod record;
pub mod registry;
pub mod server;
pub mod settings;
pub mod udp;
pub mod worker;

pub use client::{ConnectError, PacketClient};
pub use frame::{FrameError, SendError, LEN_SIZE, MAX_FRAME_LEN};
pub use lock::{new_lock, Lock, LockGuard, LockPolicy};
pub use packet::{Packet, PacketError};
pub use record::{RecordError, RecordPacket};
pub use registry::TaskRegistry;
pub use server::{PacketServer, ServerError, ServerState, WorkerFactory};
pub use settings::EndpointSettings;
pub use udp::{DatagramHandler, DatagramPeer, MAX_DATAGRAM};
pub use worker::{Connection, LinkState, PacketHandler, Worker};

//! Endpoint settings shared by server, client, and datagram peer.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use serde::Deserialize;

use crate::frame::MAX_FRAME_LEN;
use crate::lock::LockPolicy;

/// Where to listen or connect, and how a connection behaves once up.
///
/// Host and port stay strings and go through `ToSocketAddrs`, so a hostname
/// yields every candidate address. The stock defaults (`localhost:80808`)
/// come from the original protocol and only resolve when overridden with a
/// real port.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: String,
    /// Listen backlog (server only).
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Lock flavor guarding each connection's send path.
    #[serde(default)]
    pub lock_policy: LockPolicy,
    /// Bounded wait for in-flight dispatch threads at teardown, in
    /// milliseconds. Absent means wait indefinitely.
    #[serde(default)]
    pub dispatch_wait_ms: Option<u64>,
    /// Upper bound on a single frame's payload.
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: u32,
}

fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> String {
    "80808".to_string()
}
fn default_backlog() -> i32 {
    128
}
fn default_max_frame_len() -> u32 {
    MAX_FRAME_LEN
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            lock_policy: LockPolicy::default(),
            dispatch_wait_ms: None,
            max_frame_len: default_max_frame_len(),
        }
    }
}

impl EndpointSettings {
    /// Settings for `host:port` with everything else at its default.
    pub fn for_addr(host: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: port.into(),
            ..Self::default()
        }
    }

    /// Resolve to every candidate socket address.
    pub fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = format!("{}:{}", self.host, self.port)
            .to_socket_addrs()?
            .collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{}:{} resolved to no addresses", self.host, self.port),
            ));
        }
        Ok(addrs)
    }

    /// Teardown budget for dispatch threads; `None` waits indefinitely.
    pub fn dispatch_wait(&self) -> Option<Duration> {
        self.dispatch_wait_ms.map(Duration::from_millis)
    }
}

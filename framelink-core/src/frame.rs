//! Framing: 4-byte LE length prefix + raw payload. No version, no checksum.

use std::io::{self, ErrorKind, Read, Write};

/// Size of the length prefix on the wire.
pub const LEN_SIZE: usize = 4;
/// Upper bound on a single frame's payload. Guards against a corrupt or
/// hostile length prefix.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Read until `buf` is full, a clean EOF, or an error. Returns bytes read.
fn read_full(r: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Read one complete frame. Partial reads are retried until the full prefix
/// and payload arrive; a short frame is never returned as complete.
///
/// `Ok(None)` means the peer closed cleanly before the next frame. EOF inside
/// a frame is [`FrameError::Truncated`].
pub fn read_frame(r: &mut impl Read, max_len: u32) -> Result<Option<Vec<u8>>, FrameError> {
    let mut prefix = [0u8; LEN_SIZE];
    let got = read_full(r, &mut prefix)?;
    if got == 0 {
        return Ok(None);
    }
    if got < LEN_SIZE {
        return Err(FrameError::Truncated {
            expected: LEN_SIZE,
            got,
        });
    }
    let len = u32::from_le_bytes(prefix);
    if len > max_len {
        return Err(FrameError::TooLarge { len });
    }
    let mut payload = vec![0u8; len as usize];
    let got = read_full(r, &mut payload)?;
    if got < payload.len() {
        return Err(FrameError::Truncated {
            expected: payload.len(),
            got,
        });
    }
    Ok(Some(payload))
}

/// Write one complete frame, tolerating partial writes. Returns the total
/// bytes written (`LEN_SIZE + payload.len()`); on failure the error carries
/// the count that made it onto the wire.
pub fn write_frame(w: &mut impl Write, payload: &[u8], max_len: u32) -> Result<usize, SendError> {
    if payload.len() > max_len as usize {
        return Err(SendError::TooLarge { len: payload.len() });
    }
    let prefix = (payload.len() as u32).to_le_bytes();
    let mut written = 0;
    write_all_counted(w, &prefix, &mut written)?;
    write_all_counted(w, payload, &mut written)?;
    w.flush().map_err(|source| SendError::Io { written, source })?;
    Ok(written)
}

fn write_all_counted(w: &mut impl Write, buf: &[u8], written: &mut usize) -> Result<(), SendError> {
    let mut off = 0;
    while off < buf.len() {
        match w.write(&buf[off..]) {
            Ok(0) => {
                return Err(SendError::WriteZero { written: *written });
            }
            Ok(n) => {
                off += n;
                *written += n;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(SendError::Io {
                    written: *written,
                    source,
                });
            }
        }
    }
    Ok(())
}

/// Error reading a frame. All variants are connection-fatal: the receive
/// loop exits on any of them.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("connection closed mid-frame: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("frame length {len} exceeds limit")]
    TooLarge { len: u32 },
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

/// Error writing a frame or sending a packet.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("not connected")]
    NotConnected,
    #[error("payload of {len} bytes exceeds the frame limit")]
    TooLarge { len: usize },
    #[error("peer stopped accepting bytes after {written}")]
    WriteZero { written: usize },
    #[error("transport error after {written} bytes: {source}")]
    Io { written: usize, source: io::Error },
}

impl SendError {
    /// Bytes that made it onto the wire before the failure. Less than a full
    /// frame signals a broken connection.
    pub fn bytes_written(&self) -> usize {
        match self {
            SendError::NotConnected | SendError::TooLarge { .. } => 0,
            SendError::WriteZero { written } | SendError::Io { written, .. } => *written,
        }
    }
}

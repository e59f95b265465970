//! Packet: an owned or shared byte buffer. One packet is one framed message.

use bytes::Bytes;

enum Buf {
    /// This packet allocated the buffer and may rewrite it in place.
    Owned(Vec<u8>),
    /// Read-only view of memory owned elsewhere.
    Shared(Bytes),
}

/// A framed message payload. Zero-length packets are valid.
pub struct Packet {
    buf: Buf,
}

impl Packet {
    /// Empty owning packet.
    pub fn new() -> Self {
        Self::from_vec(Vec::new())
    }

    /// Owning packet over `data` without copying.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            buf: Buf::Owned(data),
        }
    }

    /// Owning packet holding a fresh copy of `data`.
    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self::from_vec(data.to_vec())
    }

    /// Non-owning packet aliasing caller memory. The view is read-only;
    /// see [`Packet::set_payload`].
    pub fn from_shared(data: Bytes) -> Self {
        Self {
            buf: Buf::Shared(data),
        }
    }

    pub fn payload(&self) -> &[u8] {
        match &self.buf {
            Buf::Owned(v) => v,
            Buf::Shared(b) => b,
        }
    }

    pub fn len(&self) -> usize {
        self.payload().len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload().is_empty()
    }

    /// Whether this packet owns its buffer (and may replace its contents).
    pub fn is_owned(&self) -> bool {
        matches!(self.buf, Buf::Owned(_))
    }

    /// Replace the contents. The owning variant reuses its allocation,
    /// growing only when `data` exceeds it; replacing a shared packet is a
    /// contract violation.
    pub fn set_payload(&mut self, data: &[u8]) -> Result<(), PacketError> {
        match &mut self.buf {
            Buf::Owned(v) => {
                v.clear();
                v.extend_from_slice(data);
                Ok(())
            }
            Buf::Shared(_) => Err(PacketError::SharedBufferImmutable),
        }
    }

    /// Consume into an owned byte vector, copying only if shared.
    pub fn into_vec(self) -> Vec<u8> {
        match self.buf {
            Buf::Owned(v) => v,
            Buf::Shared(b) => b.to_vec(),
        }
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

/// A copied packet always owns a fresh buffer, even when the source aliased
/// caller memory.
impl Clone for Packet {
    fn clone(&self) -> Self {
        Self::copy_from_slice(self.payload())
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len())
            .field("owned", &self.is_owned())
            .finish()
    }
}

impl From<Vec<u8>> for Packet {
    fn from(data: Vec<u8>) -> Self {
        Self::from_vec(data)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("shared packet buffers are read-only")]
    SharedBufferImmutable,
}

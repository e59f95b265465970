//! Record packets: a fixed header plus a trailing variable-length element
//! array, carried contiguously in one packet via the bincode codec.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::packet::Packet;

/// Application-defined record shape: one header value of type `H` followed by
/// a trailing array of `E`. The array grows but never shrinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordPacket<H, E> {
    header: H,
    elements: Vec<E>,
}

impl<H, E> RecordPacket<H, E>
where
    H: Serialize + DeserializeOwned,
    E: Serialize + DeserializeOwned + Clone + Default,
{
    pub fn new(header: H) -> Self {
        Self {
            header,
            elements: Vec::new(),
        }
    }

    pub fn header(&self) -> &H {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut H {
        &mut self.header
    }

    /// Number of trailing elements.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Bounds-checked element access.
    pub fn get(&self, index: usize) -> Option<&E> {
        self.elements.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut E> {
        self.elements.get_mut(index)
    }

    pub fn push(&mut self, element: E) {
        self.elements.push(element);
    }

    /// Grow-only resize; new slots are default-filled. Shrinking is an error.
    pub fn resize(&mut self, new_len: usize) -> Result<(), RecordError> {
        if new_len < self.elements.len() {
            return Err(RecordError::Shrink {
                current: self.elements.len(),
                requested: new_len,
            });
        }
        self.elements.resize(new_len, E::default());
        Ok(())
    }

    pub fn elements(&self) -> &[E] {
        &self.elements
    }

    /// Encode header and elements contiguously into one owning packet.
    pub fn encode(&self) -> Result<Packet, RecordError> {
        Ok(Packet::from_vec(bincode::serialize(self)?))
    }

    /// Decode a record from a packet produced by [`RecordPacket::encode`].
    pub fn decode(packet: &Packet) -> Result<Self, RecordError> {
        Ok(bincode::deserialize(packet.payload())?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("record arrays never shrink ({current} -> {requested})")]
    Shrink { current: usize, requested: usize },
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

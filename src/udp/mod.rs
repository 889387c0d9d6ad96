//! Pooled datagram buffers shared by the UDP pumps and the tunnel loops.

use crate::{BUFFER_POOL, UDP_PACKET_SIZE};
use byte_pool::Block;
use std::fmt;

/// One in-flight datagram.
///
/// The payload is a fixed-size block borrowed from the process-wide buffer
/// pool; dropping the packet (or calling [`UdpPacket::release`]) hands the
/// block back for reuse. Because the packet is moved between the queues and
/// the I/O calls, at most one owner can ever touch a given buffer.
pub struct UdpPacket {
    /// Backed by a shared byte pool to reduce allocations.
    payload: Block<'static, Vec<u8>>,
    len: usize,
}

impl UdpPacket {
    /// Takes a buffer from the pool, allocating a new one if the pool is empty.
    pub fn acquire() -> Self {
        let mut payload = BUFFER_POOL.alloc(UDP_PACKET_SIZE);
        // recycled blocks keep their size, fresh ones may come back shorter
        payload.resize(UDP_PACKET_SIZE, 0);
        UdpPacket { payload, len: 0 }
    }

    /// Returns the buffer to the pool.
    pub fn release(self) {}

    pub fn capacity(&self) -> usize {
        self.payload.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The bytes actually used.
    pub fn data(&self) -> &[u8] {
        &self.payload[..self.len]
    }

    /// The whole buffer, to be filled by a socket read followed by
    /// [`UdpPacket::set_len`].
    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.payload[..]
    }

    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.capacity());
    }

    /// Copies `src` into the packet, truncating at capacity. Returns the
    /// number of bytes kept.
    pub fn fill_from(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.capacity());
        self.payload[..n].copy_from_slice(&src[..n]);
        self.len = n;
        n
    }
}

impl fmt::Debug for UdpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpPacket")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_gives_full_capacity_and_empty_len() {
        let packet = UdpPacket::acquire();
        assert_eq!(packet.capacity(), UDP_PACKET_SIZE);
        assert!(packet.is_empty());
        assert!(packet.data().is_empty());
    }

    #[test]
    fn fill_truncates_at_capacity() {
        let mut packet = UdpPacket::acquire();
        let big = vec![7u8; UDP_PACKET_SIZE + 100];
        assert_eq!(packet.fill_from(&big), UDP_PACKET_SIZE);
        assert_eq!(packet.len(), UDP_PACKET_SIZE);
        assert!(packet.data().iter().all(|b| *b == 7));
    }

    #[test]
    fn set_len_never_exceeds_capacity() {
        let mut packet = UdpPacket::acquire();
        packet.set_len(UDP_PACKET_SIZE * 2);
        assert_eq!(packet.len(), UDP_PACKET_SIZE);
    }

    #[test]
    fn released_buffer_is_reusable() {
        let mut packet = UdpPacket::acquire();
        packet.fill_from(b"first datagram");
        packet.release();

        let mut packet = UdpPacket::acquire();
        assert!(packet.is_empty());
        assert_eq!(packet.capacity(), UDP_PACKET_SIZE);
        packet.fill_from(b"second");
        assert_eq!(packet.data(), b"second");
    }
}

//! Packets are the unit of data moving through the pipeline queues.
//!
//! A packet is owned by exactly one queue at a time. Handing it to the next
//! queue moves it, so there is no way for two queues to share one.
use std::fmt;

use crate::error::Error;


/// Default capacity for packets created with a negative size hint
pub const DEFAULT_PACKET_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Placeholder for the response header block. The connector fills it
    /// just before the first byte is written.
    Header,
    /// Body data, either real bytes or a lazy entity range
    Data,
    /// End of stream marker, carries no content
    End,
}

pub struct Packet {
    pub kind: PacketKind,
    /// Set on packets synthesized by the range filter (part boundaries)
    pub range: bool,
    content: Option<Vec<u8>>,
    prefix: Option<Vec<u8>>,
    entity_length: u64,
}

impl Packet {
    /// Allocates a data packet
    ///
    /// Negative `size_hint` allocates a default sized buffer, zero creates
    /// a packet without any buffer (used for end markers).
    pub fn new(size_hint: isize) -> Packet {
        let content = if size_hint < 0 {
            Some(Vec::with_capacity(DEFAULT_PACKET_SIZE))
        } else if size_hint == 0 {
            None
        } else {
            Some(Vec::with_capacity(size_hint as usize))
        };
        Packet {
            kind: PacketKind::Data,
            range: false,
            content,
            prefix: None,
            entity_length: 0,
        }
    }
    pub fn data<B: Into<Vec<u8>>>(bytes: B) -> Packet {
        let mut p = Packet::new(0);
        p.content = Some(bytes.into());
        p
    }
    pub fn header() -> Packet {
        let mut p = Packet::new(0);
        p.kind = PacketKind::Header;
        p
    }
    pub fn end() -> Packet {
        let mut p = Packet::new(0);
        p.kind = PacketKind::End;
        p
    }
    /// Virtual packet standing for `length` bytes of the response entity
    ///
    /// The bytes are produced lazily (e.g. read from a file) by whoever
    /// ends up writing the packet.
    pub fn entity(length: u64) -> Packet {
        let mut p = Packet::new(0);
        p.entity_length = length;
        p
    }
    pub fn is_end(&self) -> bool {
        self.kind == PacketKind::End
    }
    pub fn is_header(&self) -> bool {
        self.kind == PacketKind::Header
    }
    pub fn is_data(&self) -> bool {
        self.kind == PacketKind::Data
    }
    /// Length of the packet as accounted by queues
    ///
    /// This is the size of the content, or the remaining entity length for
    /// packets that have no materialized content yet.
    pub fn len(&self) -> usize {
        match self.content {
            Some(ref c) => c.len(),
            None => self.entity_length as usize,
        }
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn has_content(&self) -> bool {
        self.content.is_some()
    }
    pub fn content(&self) -> &[u8] {
        self.content.as_ref().map_or(&[][..], |c| &c[..])
    }
    pub fn content_mut(&mut self) -> &mut Vec<u8> {
        self.content.get_or_insert_with(Vec::new)
    }
    pub fn entity_length(&self) -> u64 {
        self.entity_length
    }
    pub fn set_entity_length(&mut self, len: u64) {
        self.entity_length = len;
    }
    pub fn prefix(&self) -> Option<&[u8]> {
        self.prefix.as_ref().map(|p| &p[..])
    }
    pub fn set_prefix<B: Into<Vec<u8>>>(&mut self, prefix: B) {
        self.prefix = Some(prefix.into());
    }
    pub fn take_prefix(&mut self) -> Option<Vec<u8>> {
        self.prefix.take()
    }
    /// Splits the packet at `offset`
    ///
    /// The packet is truncated to `offset` bytes and the tail is returned.
    /// The tail inherits the kind of the original but not its prefix.
    ///
    /// # Panics
    ///
    /// When `offset` is not strictly inside the packet
    pub fn split(&mut self, offset: usize) -> Packet {
        assert!(offset < self.len(),
            "split offset {} is out of packet of {} bytes", offset, self.len());
        let mut tail = Packet::new(0);
        tail.kind = self.kind;
        tail.range = self.range;
        if let Some(ref mut content) = self.content {
            tail.content = Some(content.split_off(offset));
        }
        if self.entity_length > 0 {
            let total = self.entity_length;
            self.entity_length = offset as u64;
            tail.entity_length = total - offset as u64;
        }
        tail
    }
    /// Appends content of `src` to this packet
    ///
    /// The `src` packet is left intact, caller drops it afterwards.
    pub fn join(&mut self, src: &Packet) -> Result<(), Error> {
        let bytes = src.content();
        let dst = self.content_mut();
        dst.try_reserve(bytes.len()).map_err(|_| Error::Memory)?;
        dst.extend_from_slice(bytes);
        if self.entity_length > 0 {
            self.entity_length += src.entity_length;
        }
        Ok(())
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Packet")
            .field("kind", &self.kind)
            .field("len", &self.len())
            .field("prefix", &self.prefix.as_ref().map(|p| p.len()))
            .field("entity_length", &self.entity_length)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::{Packet, PacketKind};

    #[test]
    fn size_hints() {
        assert!(Packet::new(-1).has_content());
        assert!(!Packet::new(0).has_content());
        assert_eq!(Packet::new(10).len(), 0);
        assert!(Packet::end().is_end());
        assert_eq!(Packet::end().len(), 0);
    }

    #[test]
    fn split_and_join() {
        let mut p = Packet::data(&b"hello world"[..]);
        let tail = p.split(5);
        assert_eq!(p.content(), b"hello");
        assert_eq!(tail.content(), b" world");
        assert_eq!(tail.kind, PacketKind::Data);
        p.join(&tail).unwrap();
        assert_eq!(p.content(), b"hello world");
    }

    #[test]
    fn split_join_every_offset() {
        let original = b"0123456789abcdef";
        for offset in 1..original.len() {
            let mut p = Packet::data(&original[..]);
            let tail = p.split(offset);
            assert_eq!(p.len() + tail.len(), original.len());
            p.join(&tail).unwrap();
            assert_eq!(p.content(), &original[..]);
        }
    }

    #[test]
    fn split_entity() {
        let mut p = Packet::entity(100);
        let tail = p.split(30);
        assert_eq!(p.entity_length(), 30);
        assert_eq!(tail.entity_length(), 70);
        assert_eq!(p.len() + tail.len(), 100);
    }

    #[test]
    #[should_panic]
    fn split_past_end() {
        let mut p = Packet::data(&b"abc"[..]);
        p.split(3);
    }
}

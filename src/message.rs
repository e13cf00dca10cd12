use bitflags::bitflags;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};

use crate::node_addr::NodeAddr;
use crate::unicast_header::UnicastHeader;

/// A [ProtocolId] identifies the protocol layer a header in a message's
///  header map belongs to.
///
/// Ids are eight-byte tags, by convention a short ASCII name padded with NUL
///  bytes. The name keeps ids readable in logs and recognizable in wire
///  dumps, and eight bytes are enough to make accidental collisions between
///  layers unlikely.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProtocolId([u8; 8]);

impl ProtocolId {
    pub const fn new(tag: &[u8; 8]) -> ProtocolId {
        Self(*tag)
    }
}

impl Debug for ProtocolId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let used = match self.0.iter().rposition(|&b| b != 0) {
            Some(end) => &self.0[..=end],
            None => &[],
        };

        if !used.is_empty() && used.iter().all(|b| b.is_ascii_graphic()) {
            write!(f, "ProtocolId({})", String::from_utf8_lossy(used))
        } else {
            // ids are not required to be printable, so fall back to hex
            write!(f, "ProtocolId({:02x?})", used)
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
    pub struct MsgFlags: u16 {
        /// deliver out of band: FIFO ordering does not apply to this message
        const OOB = 0x0001;
    }
}

/// A header some protocol layer attached to a message. Headers of this layer
///  are carried in typed form; headers of other layers travel through
///  opaquely.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Header {
    Unicast(UnicastHeader),
    Raw(Bytes),
}

/// An application message traveling through the stack.
///
/// The destination is set by the sending application; the source is filled in
///  by the transport on the receiving side. Each protocol layer may attach
///  its own header keyed by its [ProtocolId].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
    pub dest: Option<NodeAddr>,
    pub src: Option<NodeAddr>,
    payload: Bytes,
    headers: BTreeMap<ProtocolId, Header>,
    flags: MsgFlags,
}

impl Message {
    pub fn new(dest: Option<NodeAddr>, payload: Bytes) -> Message {
        Message {
            dest,
            src: None,
            payload,
            headers: BTreeMap::default(),
            flags: MsgFlags::default(),
        }
    }

    pub fn set_flag(&mut self, flag: MsgFlags) {
        self.flags |= flag;
    }

    pub fn is_flag_set(&self, flag: MsgFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn length(&self) -> usize {
        self.payload.len()
    }

    pub fn put_header(&mut self, id: ProtocolId, header: Header) {
        self.headers.insert(id, header);
    }

    pub fn get_header(&self, id: ProtocolId) -> Option<&Header> {
        self.headers.get(&id)
    }

    pub fn unicast_header(&self, id: ProtocolId) -> Option<&UnicastHeader> {
        match self.headers.get(&id) {
            Some(Header::Unicast(h)) => Some(h),
            _ => None,
        }
    }

    /// A copy for re-sending: addresses, payload and flags are carried over,
    ///  headers are *not* - the protocol re-adds its header after copying.
    pub fn copy(&self) -> Message {
        Message {
            dest: self.dest,
            src: self.src,
            payload: self.payload.clone(),
            headers: BTreeMap::default(),
            flags: self.flags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::full_tag(ProtocolId::new(b"RELICAST"), "ProtocolId(RELICAST)")]
    #[case::padded_tag(ProtocolId::new(b"flow\0\0\0\0"), "ProtocolId(flow)")]
    #[case::all_padding(ProtocolId::new(b"\0\0\0\0\0\0\0\0"), "ProtocolId([])")]
    #[case::unprintable(ProtocolId::new(b"a\0b\0\0\0\0\0"), "ProtocolId([61, 00, 62])")]
    fn test_protocol_id_debug(#[case] id: ProtocolId, #[case] expected: &str) {
        assert_eq!(format!("{:?}", id), expected);
    }

    #[test]
    fn test_protocol_id_distinguishes_padding() {
        // a NUL inside the tag is part of the id, trailing padding is too
        assert_ne!(ProtocolId::new(b"ab\0\0\0\0\0\0"), ProtocolId::new(b"a\0b\0\0\0\0\0"));
        assert_eq!(ProtocolId::new(b"ab\0\0\0\0\0\0"), ProtocolId::new(b"ab\0\0\0\0\0\0"));
    }

    #[test]
    fn test_flags() {
        let mut msg = Message::new(Some(NodeAddr::localhost(1)), Bytes::from_static(b"abc"));
        assert!(!msg.is_flag_set(MsgFlags::OOB));
        msg.set_flag(MsgFlags::OOB);
        assert!(msg.is_flag_set(MsgFlags::OOB));
    }

    #[test]
    fn test_headers() {
        let id = ProtocolId::new(b"RELICAST");
        let mut msg = Message::new(Some(NodeAddr::localhost(1)), Bytes::new());
        assert!(msg.get_header(id).is_none());

        let hdr = UnicastHeader::data(1, 99, true, UnicastHeader::NO_ACK);
        msg.put_header(id, Header::Unicast(hdr));
        assert_eq!(msg.get_header(id), Some(&Header::Unicast(hdr)));
        assert_eq!(msg.unicast_header(id), Some(&hdr));

        // headers of other layers travel through opaquely
        let other = ProtocolId::new(b"OTHER\0\0\0");
        msg.put_header(other, Header::Raw(Bytes::from_static(b"\x01\x02")));
        assert!(msg.unicast_header(other).is_none());
        assert_eq!(msg.get_header(other), Some(&Header::Raw(Bytes::from_static(b"\x01\x02"))));
    }

    #[test]
    fn test_copy_drops_headers() {
        let id = ProtocolId::new(b"RELICAST");
        let mut msg = Message::new(Some(NodeAddr::localhost(1)), Bytes::from_static(b"payload"));
        msg.src = Some(NodeAddr::localhost(2));
        msg.set_flag(MsgFlags::OOB);
        msg.put_header(id, Header::Unicast(UnicastHeader::data(4, 99, false, UnicastHeader::NO_ACK)));

        let copy = msg.copy();
        assert_eq!(copy.dest, msg.dest);
        assert_eq!(copy.src, msg.src);
        assert_eq!(copy.payload(), msg.payload());
        assert!(copy.is_flag_set(MsgFlags::OOB));
        assert!(copy.get_header(id).is_none());
    }
}

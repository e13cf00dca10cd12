use anyhow::bail;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{Debug, Formatter};

#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum HeaderType {
    Data = 0,
    Ack = 1,
    SendFirstSeqno = 2,
}

/// The fixed-width header this layer stamps on every frame it emits.
///
/// The wire layout is part of the interoperability contract with existing
/// peers and must stay byte-identical:
/// `type:1 | seqno:8 | conn_id:8 | first:1 | ack:8`, all integers big-endian.
///
/// `conn_id` identifies the incarnation of the sender's connection - a
/// receiver holding state for a different `conn_id` knows the sender was
/// reset. `ack` carries a piggybacked cumulative acknowledgement on DATA;
/// since assigned seqnos start at 1, the value 0 means "no ack".
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct UnicastHeader {
    pub header_type: HeaderType,
    pub seqno: u64,
    pub conn_id: u64,
    pub first: bool,
    pub ack: u64,
}

impl Debug for UnicastHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.header_type {
            HeaderType::Data => {
                write!(f, "DATA(#{}, conn_id={}{}{})",
                       self.seqno,
                       self.conn_id,
                       if self.first { ", first" } else { "" },
                       if self.ack != Self::NO_ACK { format!(", ack=#{}", self.ack) } else { "".to_string() },
                )
            }
            HeaderType::Ack => write!(f, "ACK(#{})", self.seqno),
            HeaderType::SendFirstSeqno => write!(f, "SEND_FIRST_SEQNO"),
        }
    }
}

impl UnicastHeader {
    pub const SERIALIZED_LEN: usize = 26;

    /// seqnos start at 1, so 0 is free to mean "no piggybacked ack"
    pub const NO_ACK: u64 = 0;

    pub fn data(seqno: u64, conn_id: u64, first: bool, ack: u64) -> UnicastHeader {
        UnicastHeader {
            header_type: HeaderType::Data,
            seqno,
            conn_id,
            first,
            ack,
        }
    }

    pub fn ack(seqno: u64) -> UnicastHeader {
        UnicastHeader {
            header_type: HeaderType::Ack,
            seqno,
            conn_id: 0,
            first: false,
            ack: Self::NO_ACK,
        }
    }

    pub fn send_first_seqno() -> UnicastHeader {
        UnicastHeader {
            header_type: HeaderType::SendFirstSeqno,
            seqno: 0,
            conn_id: 0,
            first: false,
            ack: Self::NO_ACK,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.header_type.into());
        buf.put_u64(self.seqno);
        buf.put_u64(self.conn_id);
        buf.put_u8(self.first as u8);
        buf.put_u64(self.ack);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<UnicastHeader> {
        let header_type = match HeaderType::try_from(buf.try_get_u8()?) {
            Ok(t) => t,
            Err(e) => bail!("unsupported header type {}", e.number),
        };
        let seqno = buf.try_get_u64()?;
        let conn_id = buf.try_get_u64()?;
        let first = match buf.try_get_u8()? {
            0 => false,
            1 => true,
            n => bail!("invalid 'first' flag: {}", n),
        };
        let ack = buf.try_get_u64()?;

        Ok(UnicastHeader {
            header_type,
            seqno,
            conn_id,
            first,
            ack,
        })
    }
}

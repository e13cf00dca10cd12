use std::collections::BTreeMap;
use tracing::trace;

use crate::message::{Message, MsgFlags};

/// Classification of an arriving seqno relative to the window state.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AddResult {
    New,
    /// already buffered, not yet delivered
    DuplicatePending,
    /// below the delivery cursor - already delivered (or superseded); the
    ///  protocol must still acknowledge it, since the peer is evidently
    ///  retransmitting because an earlier ack was lost
    DuplicateDelivered,
}

struct WindowSlot {
    msg: Message,
    /// OOB messages are delivered the moment they arrive but stay in the
    ///  buffer as gap fillers for the in-order drain; this marker prevents a
    ///  second out-of-band delivery
    oob_delivered: bool,
}

/// The per-peer reassembly buffer on the receiving side.
///
/// `next_to_remove` is the lowest seqno that has not been delivered in order
///  yet; everything below it is a duplicate, everything at or above it is
///  buffered until the gap-free prefix can be handed upward.
pub struct ReceiveWindow {
    next_to_remove: u64,
    buffer: BTreeMap<u64, WindowSlot>,
}

impl ReceiveWindow {
    pub fn new(initial_seqno: u64) -> ReceiveWindow {
        ReceiveWindow {
            next_to_remove: initial_seqno,
            buffer: BTreeMap::default(),
        }
    }

    pub fn add(&mut self, seqno: u64, msg: Message) -> AddResult {
        if seqno < self.next_to_remove {
            trace!("seqno {} is below the delivery cursor {}", seqno, self.next_to_remove);
            return AddResult::DuplicateDelivered;
        }
        if self.buffer.contains_key(&seqno) {
            trace!("seqno {} is already buffered", seqno);
            return AddResult::DuplicatePending;
        }
        self.buffer.insert(seqno, WindowSlot {
            msg,
            oob_delivered: false,
        });
        AddResult::New
    }

    /// Extracts the contiguous run of messages starting at `next_to_remove`
    ///  and advances the cursor past it. The result is in seqno order and
    ///  includes OOB messages that were already delivered out of band - the
    ///  caller skips those when delivering, they only matter as gap fillers
    ///  and for the acknowledgement high-water mark.
    pub fn remove_many(&mut self) -> Vec<Message> {
        let mut result = Vec::new();
        while let Some(slot) = self.buffer.remove(&self.next_to_remove) {
            self.next_to_remove += 1;
            result.push(slot.msg);
        }
        result
    }

    /// Marks all not-yet-delivered OOB messages at or above the delivery
    ///  cursor as delivered out of band and returns them, leaving them in the
    ///  buffer so the in-order drain still sees them as gap fillers.
    ///  Returns the highest seqno marked by this call, if any.
    pub fn remove_oob_messages(&mut self) -> Option<u64> {
        let mut highest = None;
        for (&seqno, slot) in self.buffer.iter_mut() {
            if slot.msg.is_flag_set(MsgFlags::OOB) && !slot.oob_delivered {
                slot.oob_delivered = true;
                highest = Some(seqno);
            }
        }
        highest
    }

    /// true iff the in-order drain would make progress right now
    pub fn has_messages_to_remove(&self) -> bool {
        self.buffer.contains_key(&self.next_to_remove)
    }

    pub fn next_to_remove(&self) -> u64 {
        self.next_to_remove
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

use std::collections::BTreeMap;
use tokio::task::JoinHandle;

use crate::message::Message;

/// The per-peer buffer of messages sent but not yet acknowledged.
///
/// Entries are keyed by seqno; each entry owns the handle of its
///  retransmission task, which keeps re-sending the message on a growing
///  interval ladder until the entry is acknowledged (or the window is reset)
///  and the task is aborted with it.
///
/// Insertion and arming are separate steps so that the caller can keep timer
///  arming outside its seqno lock: `add` stores the message unarmed, `arm`
///  attaches the task handle afterwards. The invariant is that every entry
///  has an active retransmit task until it is acknowledged.
pub struct SendWindow {
    entries: BTreeMap<u64, SendEntry>,
}

struct SendEntry {
    msg: Message,
    retransmit_handle: Option<JoinHandle<()>>,
}

impl Drop for SendEntry {
    fn drop(&mut self) {
        if let Some(handle) = self.retransmit_handle.take() {
            handle.abort();
        }
    }
}

impl Default for SendWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl SendWindow {
    pub fn new() -> SendWindow {
        SendWindow {
            entries: BTreeMap::default(),
        }
    }

    /// Stores a message awaiting acknowledgement. The seqno must be fresh -
    ///  the caller's seqno lock ensures that seqnos are never reused while
    ///  the window lives.
    pub fn add(&mut self, seqno: u64, msg: Message) {
        let prev = self.entries.insert(seqno, SendEntry {
            msg,
            retransmit_handle: None,
        });
        debug_assert!(prev.is_none(), "second send-window entry for seqno {}", seqno);
    }

    /// Attaches the retransmission task to a previously added entry. Returns
    ///  false (and aborts the task) if the entry was acknowledged in the
    ///  meantime.
    pub fn arm(&mut self, seqno: u64, handle: JoinHandle<()>) -> bool {
        match self.entries.get_mut(&seqno) {
            Some(entry) => {
                entry.retransmit_handle = Some(handle);
                true
            }
            None => {
                handle.abort();
                false
            }
        }
    }

    /// Cumulative acknowledgement: removes all entries up to and including
    ///  `seqno`, cancelling their retransmit tasks. Returns the number of
    ///  entries removed.
    pub fn ack(&mut self, seqno: u64) -> usize {
        let mut removed = 0;
        while let Some((&lowest, _)) = self.entries.first_key_value() {
            if lowest > seqno {
                break;
            }
            self.entries.remove(&lowest);
            removed += 1;
        }
        removed
    }

    /// Cancels all retransmit tasks and empties the window.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// The message with the smallest seqno, if any.
    pub fn lowest(&self) -> Option<(u64, &Message)> {
        self.entries.first_key_value().map(|(&seqno, entry)| (seqno, &entry.msg))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn seqnos(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.keys().cloned()
    }
}

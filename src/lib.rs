//! Reliable point-to-point delivery for a group communication stack.
//!
//! This crate implements the unicast reliability layer that sits between an
//! unreliable, possibly reordering datagram transport below and the next
//! protocol layer above. Per ordered pair of endpoints it provides a lossless,
//! FIFO, exactly-once stream of application messages - comparable to what TCP
//! does for a byte stream, but for discrete messages and on top of an
//! arbitrary transport.
//!
//! ## Design goals
//!
//! * The layer is bidirectional: it reacts to *downstream* events (the
//!   application sends a message) and *upstream* events (the transport
//!   delivers a frame), stamping / parsing a fixed-size header in between.
//! * Reliability is sender-driven: every DATA message is buffered in a
//!   per-peer send window and retransmitted on a growing interval ladder
//!   until the receiver acknowledges it. Acknowledgements are cumulative,
//!   and whenever possible they piggyback on DATA traveling in the reverse
//!   direction instead of costing a frame of their own.
//! * The receiver buffers out-of-sequence messages in a per-peer receive
//!   window and delivers the gap-free prefix upward in seqno order. Messages
//!   flagged OOB bypass FIFO and are delivered the moment they arrive.
//! * Peer restarts are detected through a per-connection identifier carried
//!   in every DATA header; a changed identifier silently resets the
//!   receive-side state without involving the application.
//! * Connections to endpoints that are not current group members are torn
//!   down by an age-out cache after an idle timeout, and on membership
//!   changes the connection tables are pruned to the new member set.
//!
//! ## Wire header
//!
//! Every frame of this layer carries a fixed 26-byte header, all integers in
//! network byte order:
//!
//! ```ascii
//! 0:  type: u8 - DATA, ACK or SEND_FIRST_SEQNO
//! 1:  seqno: u64 - sequence number (DATA), acknowledged seqno (ACK)
//! 9:  conn_id: u64 - identifier of the sender's connection incarnation
//! 17: first: u8 - 1 iff this is the first DATA of a connection
//! 18: ack: u64 - piggybacked cumulative ACK, 0 if absent
//! ```
//!
//! Sequence numbers start at 1 per connection, so an `ack` field of 0
//! unambiguously means "no piggybacked ACK".
//!
//! ## Control messages
//!
//! *ACK* removes everything up to and including the acknowledged seqno from
//! the peer's send window, cancelling the associated retransmit timers.
//!
//! *SEND_FIRST_SEQNO* is sent by a receiver that gets non-first DATA for a
//! connection it has no state for (e.g. after the receiver restarted). The
//! sender responds by re-sending the oldest unacknowledged message with the
//! `first` flag set, allowing the receiver to re-establish its window.
//!
//! ## Non-goals
//!
//! No multicast ordering, no encryption, no credit-based flow control
//! (retransmission timeouts bound the outstanding work), and no ordering
//! across connections - only the per-peer FIFO guarantee.

pub mod age_out_cache;
pub mod config;
pub mod event;
pub mod message;
pub mod message_dispatcher;
pub mod node_addr;
pub mod receive_window;
pub mod send_window;
pub mod unicast;
pub mod unicast_header;

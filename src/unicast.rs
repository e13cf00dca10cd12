use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt::Write;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::age_out_cache::{AgeOutCache, ExpiryHandler};
use crate::config::UnicastConfig;
use crate::event::{Event, View};
use crate::message::{Header, Message, MsgFlags, ProtocolId};
use crate::message_dispatcher::{MessageDispatcher, Transport};
use crate::node_addr::NodeAddr;
use crate::receive_window::{AddResult, ReceiveWindow};
use crate::send_window::SendWindow;
use crate::unicast_header::{HeaderType, UnicastHeader};

/// the id under which this layer's header travels in a message's header map
pub const UNICAST_PROTOCOL_ID: ProtocolId = ProtocolId::new(b"RELICAST");

/// The seqno assigned to the first message of every connection. Starting at 1
///  keeps 0 available as the "no piggybacked ack" marker in the wire header.
pub const DEFAULT_FIRST_SEQNO: u64 = 1;

tokio::task_local! {
    /// Carries an "ack to send" from the receive path to a downstream send
    ///  issued from within the same delivery, so that the ack can piggyback
    ///  on a DATA frame traveling in the reverse direction instead of
    ///  costing a frame of its own. If no send picks it up, the receive path
    ///  flushes it as an explicit ACK at the end of the delivery.
    static PENDING_ACK: RefCell<Option<(NodeAddr, u64)>>;
}

/// ReliableUnicast is the place where all parts of the protocol come
///  together: it owns the per-peer connection tables, stamps and parses the
///  wire header, and reacts to the two event streams - application messages
///  traveling down and transport frames traveling up.
///
/// All methods are safe to call concurrently; upcalls to the dispatcher and
///  downcalls to the transport happen outside all internal locks.
#[derive(Clone)]
pub struct ReliableUnicast {
    inner: Arc<UnicastInner>,
}

struct UnicastInner {
    config: Arc<UnicastConfig>,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<dyn MessageDispatcher>,

    local_addr: RwLock<Option<NodeAddr>>,
    members: RwLock<BTreeSet<NodeAddr>>,

    send_table: RwLock<FxHashMap<NodeAddr, Arc<SenderEntry>>>,
    recv_table: RwLock<FxHashMap<NodeAddr, Arc<ReceiverEntry>>>,
    age_out_cache: RwLock<Option<Arc<AgeOutCache>>>,

    /// highest conn_id handed out so far, so that ids stay strictly
    ///  increasing even when the wall clock does not
    last_conn_id: std::sync::Mutex<u64>,

    started: AtomicBool,
    disconnected: AtomicBool,
    stats: Arc<Stats>,
}

/// One entry per peer we send to. `send_conn_id` is assigned at creation and
///  never changes for the lifetime of the entry; the lock guards seqno
///  issuance together with the send-window insert, which is what makes the
///  issued seqnos gap-free.
struct SenderEntry {
    send_conn_id: u64,
    state: Mutex<SenderState>,
}

struct SenderState {
    sent_msgs: SendWindow,
    sent_msgs_seqno: u64,
}

/// One entry per peer we receive from, valid only for the conn_id stored in
///  it - DATA carrying a different conn_id supersedes the entry.
struct ReceiverEntry {
    recv_conn_id: u64,
    window: Mutex<ReceiveWindow>,
    /// admits one drainer at a time into the delivery loop; a second task
    ///  backs off and leaves its messages to the active drainer
    processing: AtomicBool,
}

#[derive(Default)]
struct Stats {
    num_msgs_sent: AtomicU64,
    num_msgs_received: AtomicU64,
    num_bytes_sent: AtomicU64,
    num_bytes_received: AtomicU64,
    num_acks_sent: AtomicU64,
    num_acks_received: AtomicU64,
    num_xmits: AtomicU64,
    undelivered_msgs: AtomicI64,
}

/// Re-sends a message on the configured interval ladder until the task is
///  aborted (which happens when the message is acknowledged or the
///  connection goes away). The last interval repeats forever.
fn spawn_retransmitter(
    transport: Arc<dyn Transport>,
    config: Arc<UnicastConfig>,
    stats: Arc<Stats>,
    msg: Message,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let timeouts = &config.retransmit_timeouts;
        let mut attempt = 0usize;
        loop {
            tokio::time::sleep(timeouts[attempt.min(timeouts.len() - 1)]).await;
            attempt += 1;

            stats.num_xmits.fetch_add(1, Ordering::Relaxed);
            trace!("retransmitting {:?} to {:?} (attempt {})", msg.unicast_header(UNICAST_PROTOCOL_ID), msg.dest, attempt);
            if let Err(e) = transport.send(msg.clone()).await {
                warn!("retransmission to {:?} failed, will retry: {}", msg.dest, e);
            }
        }
    })
}

/// Closes connections whose age-out entry expired.
struct ConnectionReaper {
    inner: Weak<UnicastInner>,
}

#[async_trait]
impl ExpiryHandler for ConnectionReaper {
    async fn expired(&self, addr: NodeAddr) {
        if let Some(inner) = self.inner.upgrade() {
            debug!("connection to {:?} was idle for too long - closing it", addr);
            inner.remove_connection(addr).await;
        }
    }
}

impl ReliableUnicast {
    pub fn new(
        config: UnicastConfig,
        transport: Arc<dyn Transport>,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> anyhow::Result<ReliableUnicast> {
        config.validate()?;

        Ok(ReliableUnicast {
            inner: Arc::new(UnicastInner {
                config: Arc::new(config),
                transport,
                dispatcher,
                local_addr: Default::default(),
                members: Default::default(),
                send_table: Default::default(),
                recv_table: Default::default(),
                age_out_cache: Default::default(),
                last_conn_id: std::sync::Mutex::new(0),
                started: AtomicBool::new(false),
                disconnected: AtomicBool::new(false),
                stats: Default::default(),
            }),
        })
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        if tokio::runtime::Handle::try_current().is_err() {
            anyhow::bail!("no timer runtime available - refusing to start");
        }
        if self.inner.config.loopback {
            warn!("the deprecated 'loopback' option is not honoured - self-addressed messages take the regular path");
        }

        if let Some(timeout) = self.inner.config.max_retransmit_time {
            let reaper = Arc::new(ConnectionReaper {
                inner: Arc::downgrade(&self.inner),
            });
            *self.inner.age_out_cache.write().await = Some(Arc::new(AgeOutCache::new(timeout, reaper)));
        }

        self.inner.started.store(true, Ordering::Release);
        info!("started");
        Ok(())
    }

    pub async fn stop(&self) {
        self.inner.started.store(false, Ordering::Release);
        self.inner.remove_all_connections().await;
        self.inner.stats.undelivered_msgs.store(0, Ordering::Relaxed);
        *self.inner.age_out_cache.write().await = None;
        info!("stopped");
    }

    /// Events from the layer above: messages to send, plus lifecycle /
    ///  membership events that are consumed locally and forwarded down.
    pub async fn down(&self, event: Event) {
        match event {
            Event::Message(msg) => self.inner.send_unicast(msg).await,
            Event::ViewChange(view) => {
                self.inner.handle_view_change(&view).await;
                self.inner.transport.forward_event(Event::ViewChange(view)).await;
            }
            Event::SetLocalAddress(addr) => {
                self.inner.set_local_address(addr).await;
                self.inner.transport.forward_event(Event::SetLocalAddress(addr)).await;
            }
            Event::Connect => {
                self.inner.disconnected.store(false, Ordering::Release);
                self.inner.transport.forward_event(Event::Connect).await;
            }
            Event::Disconnect => {
                self.inner.disconnected.store(true, Ordering::Release);
                self.inner.transport.forward_event(Event::Disconnect).await;
            }
        }
    }

    /// Events from the transport below: received frames, plus lifecycle /
    ///  membership events that are consumed locally and forwarded up.
    pub async fn up(&self, event: Event) {
        match event {
            Event::Message(msg) => self.inner.receive(msg).await,
            Event::ViewChange(view) => {
                self.inner.handle_view_change(&view).await;
                self.inner.dispatcher.on_event(Event::ViewChange(view)).await;
            }
            Event::SetLocalAddress(addr) => {
                self.inner.set_local_address(addr).await;
                self.inner.dispatcher.on_event(Event::SetLocalAddress(addr)).await;
            }
            Event::Connect => {
                self.inner.disconnected.store(false, Ordering::Release);
                self.inner.dispatcher.on_event(Event::Connect).await;
            }
            Event::Disconnect => {
                self.inner.disconnected.store(true, Ordering::Release);
                self.inner.dispatcher.on_event(Event::Disconnect).await;
            }
        }
    }

    pub async fn remove_all_connections(&self) {
        self.inner.remove_all_connections().await;
    }

    pub fn num_msgs_sent(&self) -> u64 {
        self.inner.stats.num_msgs_sent.load(Ordering::Relaxed)
    }

    pub fn num_msgs_received(&self) -> u64 {
        self.inner.stats.num_msgs_received.load(Ordering::Relaxed)
    }

    pub fn num_bytes_sent(&self) -> u64 {
        self.inner.stats.num_bytes_sent.load(Ordering::Relaxed)
    }

    pub fn num_bytes_received(&self) -> u64 {
        self.inner.stats.num_bytes_received.load(Ordering::Relaxed)
    }

    pub fn num_acks_sent(&self) -> u64 {
        self.inner.stats.num_acks_sent.load(Ordering::Relaxed)
    }

    pub fn num_acks_received(&self) -> u64 {
        self.inner.stats.num_acks_received.load(Ordering::Relaxed)
    }

    pub fn num_xmits(&self) -> u64 {
        self.inner.stats.num_xmits.load(Ordering::Relaxed)
    }

    /// regular messages sitting in receive windows that were not delivered
    ///  upward yet
    pub fn undelivered_msgs(&self) -> i64 {
        self.inner.stats.undelivered_msgs.load(Ordering::Relaxed)
    }

    pub async fn num_unacked_msgs(&self) -> usize {
        let mut result = 0;
        for entry in self.inner.send_table.read().await.values() {
            result += entry.state.lock().await.sent_msgs.len();
        }
        result
    }

    pub async fn num_msgs_in_recv_windows(&self) -> usize {
        let mut result = 0;
        for entry in self.inner.recv_table.read().await.values() {
            result += entry.window.lock().await.len();
        }
        result
    }

    pub fn reset_stats(&self) {
        let stats = &self.inner.stats;
        stats.num_msgs_sent.store(0, Ordering::Relaxed);
        stats.num_msgs_received.store(0, Ordering::Relaxed);
        stats.num_bytes_sent.store(0, Ordering::Relaxed);
        stats.num_bytes_received.store(0, Ordering::Relaxed);
        stats.num_acks_sent.store(0, Ordering::Relaxed);
        stats.num_acks_received.store(0, Ordering::Relaxed);
        stats.num_xmits.store(0, Ordering::Relaxed);
        // NB: undelivered_msgs tracks live window state, not history, and is
        //  therefore not reset here
    }

    pub async fn print_connections(&self) -> String {
        let mut result = String::new();
        for (addr, entry) in self.inner.send_table.read().await.iter() {
            let state = entry.state.lock().await;
            let _ = writeln!(result, "-> {:?}: conn_id={}, next_seqno={}, unacked={}",
                             addr, entry.send_conn_id, state.sent_msgs_seqno, state.sent_msgs.len());
        }
        for (addr, entry) in self.inner.recv_table.read().await.iter() {
            let win = entry.window.lock().await;
            let _ = writeln!(result, "<- {:?}: conn_id={}, next_to_remove={}, buffered={}",
                             addr, entry.recv_conn_id, win.next_to_remove(), win.len());
        }
        result
    }

    pub async fn print_unacked_messages(&self) -> String {
        let mut result = String::new();
        for (addr, entry) in self.inner.send_table.read().await.iter() {
            let state = entry.state.lock().await;
            let _ = writeln!(result, "{:?}: {:?}", addr, state.sent_msgs.seqnos().collect::<Vec<_>>());
        }
        result
    }

    pub async fn print_age_out_cache(&self) -> String {
        match self.inner.age_out_cache.read().await.clone() {
            Some(cache) => cache.print().await,
            None => String::new(),
        }
    }
}

impl UnicastInner {
    // ---- send path --------------------------------------------------------

    async fn send_unicast(&self, mut msg: Message) {
        let Some(dest) = msg.dest else {
            // no destination - not point-to-point traffic, none of our business
            if let Err(e) = self.transport.send(msg).await {
                error!("passing unaddressed message down failed: {}", e);
            }
            return;
        };
        if dest.is_multicast() {
            if let Err(e) = self.transport.send(msg).await {
                error!("passing multicast message down failed: {}", e);
            }
            return;
        }
        if !self.started.load(Ordering::Acquire) {
            trace!("not started - dropping message to {:?}", dest);
            return;
        }

        let entry = self.get_or_create_sender_entry(dest).await;
        let ack_seqno = self.take_piggyback_ack(dest);
        if msg.src.is_none() {
            msg.src = *self.local_addr.read().await;
        }

        let seqno = {
            let mut state = entry.state.lock().await;

            let seqno = state.sent_msgs_seqno;
            let hdr = UnicastHeader::data(seqno, entry.send_conn_id, seqno == DEFAULT_FIRST_SEQNO, ack_seqno);
            trace!("stamping {:?} for {:?}", hdr, dest);
            msg.put_header(UNICAST_PROTOCOL_ID, Header::Unicast(hdr));

            state.sent_msgs.add(seqno, msg.clone());
            state.sent_msgs_seqno += 1;
            seqno
        };

        // arming happens outside the seqno lock: scheduling is the costliest
        //  step, and delivery order at the receiver does not depend on it
        let handle = spawn_retransmitter(self.transport.clone(), self.config.clone(), self.stats.clone(), msg.clone());
        entry.state.lock().await.sent_msgs.arm(seqno, handle);

        self.stats.num_msgs_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.num_bytes_sent.fetch_add(msg.length() as u64, Ordering::Relaxed);

        if let Err(e) = self.transport.send(msg).await {
            warn!("sending #{} to {:?} failed - the retransmitter will re-send: {}", seqno, dest, e);
        }
    }

    async fn get_or_create_sender_entry(&self, dest: NodeAddr) -> Arc<SenderEntry> {
        if let Some(entry) = self.send_table.read().await.get(&dest) {
            return entry.clone();
        }

        let entry = {
            let mut table = self.send_table.write().await;
            if let Some(entry) = table.get(&dest) {
                // lost the race against a concurrent sender
                entry.clone()
            } else {
                let send_conn_id = self.new_conn_id();
                debug!("creating send state for {:?} with conn_id {}", dest, send_conn_id);
                let entry = Arc::new(SenderEntry {
                    send_conn_id,
                    state: Mutex::new(SenderState {
                        sent_msgs: SendWindow::new(),
                        sent_msgs_seqno: DEFAULT_FIRST_SEQNO,
                    }),
                });
                table.insert(dest, entry.clone());
                entry
            }
        };

        if !self.members.read().await.contains(&dest) {
            if let Some(cache) = self.age_out_cache.read().await.clone() {
                cache.add(dest).await;
            }
        }
        entry
    }

    /// Connection ids are taken from the wall clock; receivers only compare
    ///  them for equality, so all that matters is that a replacement entry
    ///  gets a strictly greater id even within the same millisecond.
    fn new_conn_id(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let mut last = self.last_conn_id.lock().expect("last_conn_id lock poisoned");
        *last = if now > *last { now } else { *last + 1 };
        *last
    }

    // ---- receive path -----------------------------------------------------

    async fn receive(&self, msg: Message) {
        let Some(sender) = msg.src else {
            error!("received a message without source address - dropping");
            return;
        };
        let Some(&hdr) = msg.unicast_header(UNICAST_PROTOCOL_ID) else {
            // not addressed to this layer
            self.dispatcher.on_message(msg).await;
            return;
        };

        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "unicast_frame", ?correlation_id);
        async {
            trace!("received {:?} from {:?}", hdr, sender);

            match hdr.header_type {
                HeaderType::Ack => {
                    self.stats.num_acks_received.fetch_add(1, Ordering::Relaxed);
                    self.handle_ack(sender, hdr.seqno).await;
                }
                HeaderType::SendFirstSeqno => {
                    self.handle_resend_first(sender).await;
                }
                HeaderType::Data => {
                    if hdr.ack > UnicastHeader::NO_ACK {
                        self.stats.num_acks_received.fetch_add(1, Ordering::Relaxed);
                        self.handle_ack(sender, hdr.ack).await;
                    }
                    self.handle_data(sender, &hdr, msg).await;
                }
            }
        }.instrument(span).await;
    }

    async fn handle_data(&self, sender: NodeAddr, hdr: &UnicastHeader, msg: Message) {
        if !self.started.load(Ordering::Acquire) {
            trace!("not started - dropping DATA from {:?}", sender);
            return;
        }
        let Some(entry) = self.get_receiver_entry(sender, hdr.seqno, hdr.conn_id, hdr.first).await else {
            return;
        };

        self.stats.num_msgs_received.fetch_add(1, Ordering::Relaxed);
        self.stats.num_bytes_received.fetch_add(msg.length() as u64, Ordering::Relaxed);

        let oob = msg.is_flag_set(MsgFlags::OOB);
        let (result, highest_oob) = {
            let mut win = entry.window.lock().await;
            let result = win.add(hdr.seqno, msg.clone());
            let highest_oob = if oob && result == AddResult::New {
                win.remove_oob_messages()
            } else {
                None
            };
            (result, highest_oob)
        };

        match result {
            AddResult::DuplicateDelivered => {
                // the peer is evidently retransmitting because our ack got
                //  lost; not re-acking would deadlock its send window
                debug!("#{} from {:?} was already delivered - re-sending ack", hdr.seqno, sender);
                self.send_ack(sender, hdr.seqno).await;
                return;
            }
            AddResult::DuplicatePending => {
                trace!("#{} from {:?} is already pending delivery", hdr.seqno, sender);
            }
            AddResult::New => {
                if !oob {
                    self.stats.undelivered_msgs.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        PENDING_ACK.scope(RefCell::new(None), async {
            if oob && result == AddResult::New {
                let mut ack_enqueued = false;
                if let Some(highest_oob) = highest_oob {
                    let nothing_removable = !entry.window.lock().await.has_messages_to_remove();
                    if self.stats.undelivered_msgs.load(Ordering::Relaxed) == 0 || nothing_removable {
                        self.enqueue_piggyback_ack(sender, highest_oob).await;
                        ack_enqueued = true;
                    }
                }

                self.dispatcher.on_message(msg).await;

                if highest_oob.is_some() {
                    self.flush_pending_ack().await;
                }
                if ack_enqueued {
                    return;
                }
                // regular messages may have become deliverable through this
                //  OOB message acting as a gap filler
            }

            self.drain_window(sender, &entry).await;
        }).await;
    }

    async fn get_receiver_entry(&self, sender: NodeAddr, seqno: u64, conn_id: u64, first: bool) -> Option<Arc<ReceiverEntry>> {
        {
            let table = self.recv_table.read().await;
            if let Some(entry) = table.get(&sender) {
                if entry.recv_conn_id == conn_id {
                    return Some(entry.clone());
                }
            }
        }

        if !first {
            // no valid state for this stream - ask the peer to re-send its
            //  first message so the window can be (re-)established; this DATA
            //  is dropped, the peer's retransmitter covers it
            debug!("no receive state for conn_id {} of {:?} - requesting first seqno", conn_id, sender);
            self.send_first_seqno_request(sender).await;
            return None;
        }

        let mut table = self.recv_table.write().await;
        if let Some(existing) = table.get(&sender) {
            if existing.recv_conn_id == conn_id {
                // a retransmitted first message
                return Some(existing.clone());
            }
            debug!("{:?} restarted (conn_id {} -> {}) - resetting receive state", sender, existing.recv_conn_id, conn_id);
            existing.window.lock().await.reset();
        } else {
            debug!("creating receive state for {:?} starting at #{} (conn_id {})", sender, seqno, conn_id);
        }

        let entry = Arc::new(ReceiverEntry {
            recv_conn_id: conn_id,
            window: Mutex::new(ReceiveWindow::new(seqno)),
            processing: AtomicBool::new(false),
        });
        table.insert(sender, entry.clone());
        Some(entry)
    }

    async fn drain_window(&self, sender: NodeAddr, entry: &ReceiverEntry) {
        if entry.processing.compare_exchange(false, true, Ordering::Acquire, Ordering::Acquire).is_err() {
            return;
        }

        let mut num_regular_removed = 0i64;
        loop {
            let (msgs, highest) = {
                let mut win = entry.window.lock().await;
                let msgs = win.remove_many();
                (msgs, win.next_to_remove().wrapping_sub(1))
            };
            if msgs.is_empty() {
                break;
            }

            self.enqueue_piggyback_ack(sender, highest).await;

            for msg in msgs {
                if msg.is_flag_set(MsgFlags::OOB) {
                    // already delivered out of band on arrival
                    continue;
                }
                num_regular_removed += 1;
                self.dispatcher.on_message(msg).await;
            }

            // if no downstream send picked the ack up, it goes out explicitly
            self.flush_pending_ack().await;
        }

        self.stats.undelivered_msgs.fetch_sub(num_regular_removed, Ordering::Relaxed);
        entry.processing.store(false, Ordering::Release);
    }

    async fn handle_ack(&self, sender: NodeAddr, seqno: u64) {
        let entry = self.send_table.read().await.get(&sender).cloned();
        if let Some(entry) = entry {
            let removed = entry.state.lock().await.sent_msgs.ack(seqno);
            trace!("ack #{} from {:?} cleared {} pending messages", seqno, sender, removed);
        }
    }

    async fn handle_resend_first(&self, sender: NodeAddr) {
        let entry = self.send_table.read().await.get(&sender).cloned();
        let Some(entry) = entry else {
            debug!("{:?} asked for the first seqno but there is no send state - ignoring", sender);
            return;
        };

        let resend = {
            let state = entry.state.lock().await;
            state.sent_msgs.lowest().map(|(seqno, original)| {
                // a copy, so the entry in the send window stays untouched
                let mut resend = original.copy();
                let hdr = match original.unicast_header(UNICAST_PROTOCOL_ID) {
                    Some(&hdr) => UnicastHeader { first: true, ..hdr },
                    None => UnicastHeader::data(seqno, entry.send_conn_id, true, UnicastHeader::NO_ACK),
                };
                resend.put_header(UNICAST_PROTOCOL_ID, Header::Unicast(hdr));
                resend
            })
        };

        if let Some(resend) = resend {
            debug!("re-sending first pending message to {:?}", sender);
            if let Err(e) = self.transport.send(resend).await {
                warn!("re-sending first pending message to {:?} failed: {}", sender, e);
            }
        }
    }

    // ---- acks -------------------------------------------------------------

    fn take_piggyback_ack(&self, dest: NodeAddr) -> u64 {
        PENDING_ACK.try_with(|slot| {
            let mut slot = slot.borrow_mut();
            match *slot {
                Some((addr, seqno)) if addr == dest => {
                    *slot = None;
                    seqno
                }
                _ => UnicastHeader::NO_ACK,
            }
        }).unwrap_or(UnicastHeader::NO_ACK)
    }

    async fn enqueue_piggyback_ack(&self, addr: NodeAddr, seqno: u64) {
        let displaced = PENDING_ACK.try_with(|slot| {
            let mut slot = slot.borrow_mut();
            match *slot {
                Some((pending_addr, pending_seqno)) if pending_addr == addr => {
                    *slot = Some((addr, pending_seqno.max(seqno)));
                    None
                }
                previous => {
                    *slot = Some((addr, seqno));
                    previous
                }
            }
        });

        match displaced {
            // an ack for a different peer cannot wait in the slot
            Ok(Some((displaced_addr, displaced_seqno))) => self.send_ack(displaced_addr, displaced_seqno).await,
            Ok(None) => {}
            // not inside a delivery - nothing to defer into
            Err(_) => self.send_ack(addr, seqno).await,
        }
    }

    async fn flush_pending_ack(&self) {
        let pending = PENDING_ACK.try_with(|slot| slot.borrow_mut().take()).ok().flatten();
        if let Some((addr, seqno)) = pending {
            self.send_ack(addr, seqno).await;
        }
    }

    async fn send_ack(&self, to: NodeAddr, seqno: u64) {
        if self.disconnected.load(Ordering::Acquire) {
            trace!("disconnected - not sending ack #{} to {:?}", seqno, to);
            return;
        }

        let mut ack = Message::new(Some(to), Bytes::new());
        ack.src = *self.local_addr.read().await;
        ack.put_header(UNICAST_PROTOCOL_ID, Header::Unicast(UnicastHeader::ack(seqno)));

        self.stats.num_acks_sent.fetch_add(1, Ordering::Relaxed);
        trace!("sending ack #{} to {:?}", seqno, to);
        if let Err(e) = self.transport.send(ack).await {
            warn!("sending ack #{} to {:?} failed - the peer will retransmit: {}", seqno, to, e);
        }
    }

    async fn send_first_seqno_request(&self, to: NodeAddr) {
        let mut req = Message::new(Some(to), Bytes::new());
        req.src = *self.local_addr.read().await;
        req.put_header(UNICAST_PROTOCOL_ID, Header::Unicast(UnicastHeader::send_first_seqno()));

        trace!("requesting first seqno from {:?}", to);
        if let Err(e) = self.transport.send(req).await {
            warn!("requesting first seqno from {:?} failed: {}", to, e);
        }
    }

    // ---- membership & lifecycle -------------------------------------------

    async fn set_local_address(&self, addr: NodeAddr) {
        debug!("local address is {:?}", addr);
        *self.local_addr.write().await = Some(addr);
    }

    async fn handle_view_change(&self, view: &View) {
        debug!("new view with {} members", view.len());
        {
            let mut members = self.members.write().await;
            *members = view.members().clone();
        }

        if let Some(cache) = self.age_out_cache.read().await.clone() {
            // members are under the membership service's failure detection
            cache.remove_all(view.members().iter()).await;
        }

        let mut non_members = BTreeSet::new();
        non_members.extend(self.send_table.read().await.keys().cloned());
        non_members.extend(self.recv_table.read().await.keys().cloned());
        non_members.retain(|addr| !view.contains(addr));

        for addr in non_members {
            debug!("closing connection to {:?} which is no longer a member", addr);
            self.remove_connection(addr).await;
        }
    }

    async fn remove_connection(&self, addr: NodeAddr) {
        let send_entry = self.send_table.write().await.remove(&addr);
        if let Some(entry) = send_entry {
            entry.state.lock().await.sent_msgs.reset();
        }

        let recv_entry = self.recv_table.write().await.remove(&addr);
        if let Some(entry) = recv_entry {
            entry.window.lock().await.reset();
        }

        if let Some(cache) = self.age_out_cache.read().await.clone() {
            cache.remove(&addr).await;
        }
    }

    async fn remove_all_connections(&self) {
        let mut addrs = BTreeSet::new();
        addrs.extend(self.send_table.read().await.keys().cloned());
        addrs.extend(self.recv_table.read().await.keys().cloned());

        for addr in addrs {
            self.remove_connection(addr).await;
        }
    }
}

use crate::ack_tracker::AckTracker;
use crate::completion::{CompletionHandle, CompletionSignal};
use crate::config::Config;
use crate::error::TransportError;
use crate::in_flight::InFlightSets;
use crate::packet_types::{type_ids, PacketType};
use crate::protocol::DatagramSink;
use crate::seq::SequenceNumber;
use crate::sequence_pool::SequencePool;
use crate::wire;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, trace};

/// Send-side scheduler: merges freshly queued application packets and due resends into
///  a single shaped datagram stream.
///
/// New packets compete by aged priority and are packed greedily into one datagram per
///  pass; a datagram gets one shared sequence number, the current acknowledgement field
///  and the OR of its packets' dependency masks piggy-backed on. Unacknowledged datagrams
///  become resend candidates after a fixed delay, and a resend re-emits the stored bytes
///  unchanged - the receiver deduplicates and orders by sequence number, so the encoding
///  must not shift between transmissions.
///
/// All queue state sits behind a plain mutex with short critical sections; the single
///  `run` task is the only place that awaits (bandwidth shaping and the sink).
pub struct Scheduler {
    config: Arc<Config>,
    local_salt: u32,
    pool: Arc<SequencePool>,
    ack_tracker: Arc<AckTracker>,
    in_flight: Arc<InFlightSets>,
    sink: Arc<dyn DatagramSink>,
    inner: Mutex<SchedulerInner>,
    notify: Notify,
    /// true iff both queues are empty - what [Scheduler::flush] waits for
    idle: watch::Sender<bool>,
}

/// The completion handles handed to a sender: `sent` fires when the packet first left the
///  socket, `delivered` when the peer acknowledged a datagram containing it.
pub struct SendHandles {
    pub sent: CompletionHandle,
    pub delivered: CompletionHandle,
}

struct SchedulerInner {
    send_queue: Vec<QueuedPacket>,
    resend_queue: Vec<SentDatagram>,
    last_send: Option<Instant>,
    /// when the oldest currently pending acknowledgement became pending; drives the
    ///  pure-ack flush deadline
    ack_pending_since: Option<Instant>,
    closed: bool,
}

struct QueuedPacket {
    packet_type: PacketType,
    priority: f64,
    enqueued_at: Instant,
    bytes: Vec<u8>,
    sent: Arc<CompletionSignal>,
    delivered: Arc<CompletionSignal>,
}

struct SentDatagram {
    seq: SequenceNumber,
    bytes: Vec<u8>,
    /// highest constituent priority, ages from `sent_at` like a queued packet
    priority: f64,
    /// distinct packet type ids in the payload, for clearing the in-flight sets on ack
    type_ids: Vec<usize>,
    /// the constituent packets' 'sent' signals; completion is idempotent, so these fire on
    ///  the first transmission that actually reaches the sink
    sent_signals: Vec<Arc<CompletionSignal>>,
    sent_at: Instant,
    due: Instant,
}

/// An assembled datagram on its way to the shaper.
struct Prepared {
    seq: SequenceNumber,
    bytes: Vec<u8>,
    priority: f64,
    type_ids: Vec<usize>,
    sent_signals: Vec<Arc<CompletionSignal>>,
    aggregate: Arc<CompletionSignal>,
}

enum Action {
    Transmit(Prepared),
    Retransmit {
        seq: SequenceNumber,
        bytes: Vec<u8>,
        sent_signals: Vec<Arc<CompletionSignal>>,
    },
    PureAck(Prepared),
    Wait(Option<Instant>),
    Shutdown,
}

impl Scheduler {
    pub fn new(
        config: Arc<Config>,
        local_salt: u32,
        pool: Arc<SequencePool>,
        ack_tracker: Arc<AckTracker>,
        in_flight: Arc<InFlightSets>,
        sink: Arc<dyn DatagramSink>,
    ) -> Scheduler {
        Scheduler {
            config,
            local_salt,
            pool,
            ack_tracker,
            in_flight,
            sink,
            inner: Mutex::new(SchedulerInner {
                send_queue: Vec::new(),
                resend_queue: Vec::new(),
                last_send: None,
                ack_pending_since: None,
                closed: false,
            }),
            notify: Notify::new(),
            idle: watch::Sender::new(true),
        }
    }

    fn update_idle(&self, inner: &SchedulerInner) {
        let idle = inner.send_queue.is_empty() && inner.resend_queue.is_empty();
        self.idle.send_if_modified(|current| {
            if *current != idle {
                *current = idle;
                true
            }
            else {
                false
            }
        });
    }

    /// Waits until everything queued has been sent and acknowledged.
    pub async fn flush(&self) {
        let mut rx = self.idle.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Queues an encoded packet for sending. The packet must fit a single datagram
    ///  alongside the header - this transport never fragments.
    pub fn send(&self, packet_type: PacketType, priority: f64, bytes: Vec<u8>) -> Result<SendHandles, TransportError> {
        if bytes.len() + wire::HEADER_LEN > self.config.datagram_capacity {
            return Err(TransportError::PayloadTooLarge {
                payload_len: bytes.len(),
                capacity: self.config.datagram_capacity - wire::HEADER_LEN,
            });
        }

        let sent = Arc::new(CompletionSignal::new());
        let delivered = Arc::new(CompletionSignal::new());
        let handles = SendHandles {
            sent: sent.handle(),
            delivered: delivered.handle(),
        };

        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(TransportError::ConnectionClosed);
            }
            inner.send_queue.push(QueuedPacket {
                packet_type,
                priority,
                enqueued_at: Instant::now(),
                bytes,
                sent,
                delivered,
            });
            self.update_idle(&inner);
        }
        self.notify.notify_one();
        Ok(handles)
    }

    /// Cancels the resend of an acknowledged datagram and clears its packets from the
    ///  in-flight sets. Delivery signals are completed by the sequence pool; this handles
    ///  the scheduler-side bookkeeping only.
    pub fn on_acknowledged(&self, seq: SequenceNumber) {
        let acked = {
            let mut inner = self.inner.lock().unwrap();
            let pos = inner.resend_queue.iter().position(|d| d.seq == seq);
            let acked = pos.map(|pos| inner.resend_queue.remove(pos));
            self.update_idle(&inner);
            acked
        };

        if let Some(entry) = acked {
            trace!("datagram #{} acknowledged, resend cancelled", seq);
            for type_id in &entry.type_ids {
                self.in_flight.on_acknowledged(*type_id, seq);
            }
        }
        // an ack shrinks in-flight sets, which may unblock overflow-deferred packets
        self.notify.notify_one();
    }

    /// Wakes the scheduling loop after received traffic queued an acknowledgement, so a
    ///  parked loop re-reads the ack tracker and picks up the flush deadline.
    pub fn on_ack_pending(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.ack_pending_since.is_none() {
                inner.ack_pending_since = Some(Instant::now());
            }
        }
        self.notify.notify_one();
    }

    /// Stops the scheduling loop and fails every not-yet-sent packet's signals. Signals
    ///  of sent-but-unacknowledged packets are failed through the sequence pool.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.closed = true;
            for packet in inner.send_queue.drain(..) {
                packet.sent.fail(TransportError::ConnectionClosed);
                packet.delivered.fail(TransportError::ConnectionClosed);
            }
            inner.resend_queue.clear();
            self.update_idle(&inner);
        }
        self.notify.notify_one();
    }

    /// The scheduling loop, spawned once per connection.
    pub async fn run(&self) {
        let mut shaper = BandwidthShaper::new(self.config.nanos_per_byte, self.config.accumulation_window);

        loop {
            match self.next_action(Instant::now()) {
                Action::Shutdown => break,
                Action::Transmit(prepared) => self.transmit(&mut shaper, prepared, true).await,
                Action::PureAck(prepared) => self.transmit(&mut shaper, prepared, false).await,
                Action::Retransmit { seq, bytes, sent_signals } => {
                    shaper.admit(bytes.len()).await;
                    debug!("resending datagram #{}", seq);
                    match self.sink.send_datagram(bytes).await {
                        Ok(()) => {
                            // this may be the first transmission that actually went out
                            for signal in &sent_signals {
                                signal.complete();
                            }
                        }
                        Err(e) => error!("error resending datagram #{}: {:#}", seq, e),
                    }
                    self.inner.lock().unwrap().last_send = Some(Instant::now());
                }
                Action::Wait(deadline) => match deadline {
                    Some(deadline) => {
                        tokio::select! {
                            _ = self.notify.notified() => {}
                            _ = tokio::time::sleep_until(deadline) => {}
                        }
                    }
                    None => self.notify.notified().await,
                },
            }
        }
    }

    fn next_action(&self, now: Instant) -> Action {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Action::Shutdown;
        }

        let best_fresh = inner
            .send_queue
            .iter()
            .map(|p| self.fresh_score(p, now))
            .fold(None, |acc: Option<f64>, s| Some(acc.map_or(s, |a| a.max(s))));

        let best_resend = inner
            .resend_queue
            .iter()
            .enumerate()
            .filter(|(_, d)| d.due <= now)
            .map(|(idx, d)| (idx, self.resend_score(d, now)))
            .fold(None, |acc: Option<(usize, f64)>, c| match acc {
                Some(a) if a.1 >= c.1 => Some(a),
                _ => Some(c),
            });

        if let Some((idx, score)) = best_resend {
            if best_fresh.map_or(true, |f| score >= f) {
                let entry = &mut inner.resend_queue[idx];
                entry.due = now + self.config.resend_delay;
                return Action::Retransmit {
                    seq: entry.seq,
                    bytes: entry.bytes.clone(),
                    sent_signals: entry.sent_signals.clone(),
                };
            }
        }

        if !inner.send_queue.is_empty() {
            if let Some(prepared) = self.assemble(&mut inner, now) {
                return Action::Transmit(prepared);
            }
        }

        let mut deadline: Option<Instant> = inner.resend_queue.iter().map(|d| d.due).min();

        if self.ack_tracker.has_pending() {
            // the flush delay counts from when the ack became pending, giving regular
            //  traffic that long to piggy-back it
            let pending_since = *inner.ack_pending_since.get_or_insert(now);
            let ack_due = pending_since + self.config.ack_flush_delay;
            if ack_due <= now {
                return Action::PureAck(self.prepare_pure_ack());
            }
            deadline = Some(deadline.map_or(ack_due, |d| d.min(ack_due)));
        }

        Action::Wait(deadline)
    }

    /// Drains the highest-scoring packets that fit into one datagram. Assembly stops at
    ///  the first packet the remaining capacity cannot hold; a packet whose dependency
    ///  encoding overflows the wait field is skipped and stays queued for a later
    ///  datagram. Returns `None` if nothing could be included.
    fn assemble(&self, inner: &mut SchedulerInner, now: Instant) -> Option<Prepared> {
        let next_seq = self.pool.peek_next();

        let mut order: Vec<usize> = (0..inner.send_queue.len()).collect();
        order.sort_by(|&a, &b| {
            let sa = self.fresh_score(&inner.send_queue[a], now);
            let sb = self.fresh_score(&inner.send_queue[b], now);
            sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut selection: Vec<usize> = Vec::new();
        let mut remaining = self.config.datagram_capacity - wire::HEADER_LEN;
        let mut wait_field = 0u32;

        for &idx in &order {
            let packet = &inner.send_queue[idx];
            if packet.bytes.len() > remaining {
                break;
            }

            let mut mask = 0u32;
            let mut overflow = false;
            for dep_id in type_ids(packet.packet_type.waits_for) {
                match self.in_flight.encode_relative_to(dep_id, next_seq) {
                    Some(bits) => mask |= bits,
                    None => {
                        overflow = true;
                        break;
                    }
                }
            }
            if overflow {
                trace!("dependency encoding for a type {} packet overflows - deferring", packet.packet_type.id);
                continue;
            }

            wait_field |= mask;
            remaining -= packet.bytes.len();
            selection.push(idx);
        }
        if selection.is_empty() {
            return None;
        }

        // pull the selected packets out of the queue, preserving selection order in the
        //  payload (same-type packets sharing the datagram execute in payload order)
        let mut by_index: FxHashMap<usize, QueuedPacket> = FxHashMap::default();
        let mut kept = Vec::with_capacity(inner.send_queue.len() - selection.len());
        for (idx, packet) in inner.send_queue.drain(..).enumerate() {
            if selection.contains(&idx) {
                by_index.insert(idx, packet);
            }
            else {
                kept.push(packet);
            }
        }
        inner.send_queue = kept;
        let selected: Vec<QueuedPacket> = selection
            .iter()
            .map(|idx| by_index.remove(idx).unwrap())
            .collect();

        let aggregate = Arc::new(CompletionSignal::new());
        let seq = self.pool.allocate(aggregate.clone());
        debug_assert_eq!(seq, next_seq);

        // fan the datagram's delivery outcome out to each constituent packet's signal
        let mut aggregate_handle = aggregate.handle();
        let delivered: Vec<_> = selected.iter().map(|p| p.delivered.clone()).collect();
        tokio::spawn(async move {
            let outcome = aggregate_handle.wait().await;
            for signal in delivered {
                match &outcome {
                    Ok(()) => signal.complete(),
                    Err(e) => signal.fail(e.clone()),
                }
            }
        });

        for packet in &selected {
            self.in_flight.add_packet(packet.packet_type.id, seq);
        }

        let mut payload = Vec::with_capacity(self.config.datagram_capacity - remaining - wire::HEADER_LEN);
        for packet in &selected {
            payload.extend_from_slice(&packet.bytes);
        }

        let ack = self.ack_tracker.build_acknowledgement_field();
        let bytes = wire::encode_datagram(self.local_salt, ack, seq, wait_field, &payload);
        trace!("assembled datagram #{}: {} packets, {} bytes, wait field {:08x}", seq, selected.len(), bytes.len(), wait_field);

        let mut type_ids: Vec<usize> = selected.iter().map(|p| p.packet_type.id).collect();
        type_ids.sort_unstable();
        type_ids.dedup();

        Some(Prepared {
            seq,
            bytes,
            priority: selected.iter().fold(f64::MIN, |m, p| m.max(p.priority)),
            type_ids,
            sent_signals: selected.iter().map(|p| p.sent.clone()).collect(),
            aggregate,
        })
    }

    /// An empty-payload datagram carrying only the acknowledgement field. It consumes a
    ///  real sequence number (the receiver deduplicates by number, so numbers are never
    ///  reused), but its signal is pre-completed and it is never resent - the receiver
    ///  does not acknowledge pure acks, that would ping-pong forever.
    fn prepare_pure_ack(&self) -> Prepared {
        let aggregate = Arc::new(CompletionSignal::new());
        aggregate.complete();
        let seq = self.pool.allocate(aggregate.clone());

        let ack = self.ack_tracker.build_acknowledgement_field();
        let bytes = wire::encode_datagram(self.local_salt, ack, seq, 0, &[]);
        debug!("flushing pending acknowledgements in dedicated datagram #{}", seq);

        Prepared {
            seq,
            bytes,
            priority: 0.0,
            type_ids: Vec::new(),
            sent_signals: Vec::new(),
            aggregate,
        }
    }

    async fn transmit(&self, shaper: &mut BandwidthShaper, prepared: Prepared, reliable: bool) {
        shaper.admit(prepared.bytes.len()).await;

        trace!("sending datagram #{} ({} bytes)", prepared.seq, prepared.bytes.len());
        match self.sink.send_datagram(prepared.bytes.clone()).await {
            Ok(()) => {
                for signal in &prepared.sent_signals {
                    signal.complete();
                }
            }
            Err(e) => {
                // the resend path repairs this for reliable datagrams
                error!("error sending datagram #{}: {:#}", prepared.seq, e);
            }
        }

        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        inner.last_send = Some(now);
        // the datagram carried the current acknowledgement field
        inner.ack_pending_since = None;
        if reliable {
            if !prepared.aggregate.is_completed() {
                inner.resend_queue.push(SentDatagram {
                    seq: prepared.seq,
                    bytes: prepared.bytes,
                    priority: prepared.priority,
                    type_ids: prepared.type_ids,
                    sent_signals: prepared.sent_signals,
                    sent_at: now,
                    due: now + self.config.resend_delay,
                });
            }
            else {
                // the ack overtook this transmission, so `on_acknowledged` found no
                //  resend-queue entry to clear the in-flight sets through
                for type_id in &prepared.type_ids {
                    self.in_flight.on_acknowledged(*type_id, prepared.seq);
                }
            }
        }
        self.update_idle(&inner);
    }

    fn fresh_score(&self, packet: &QueuedPacket, now: Instant) -> f64 {
        let age_millis = now.duration_since(packet.enqueued_at).as_millis() as f64;
        packet.priority * (1.0 + age_millis * self.config.aging_factor_per_milli)
    }

    fn resend_score(&self, datagram: &SentDatagram, now: Instant) -> f64 {
        let age_millis = now.duration_since(datagram.sent_at).as_millis() as f64;
        datagram.priority
            * (1.0 + age_millis * self.config.aging_factor_per_milli)
            * (1.0 - self.config.in_transit_chance)
    }
}

/// Token-bucket style bandwidth cap: a virtual watermark marks the time at which zero
///  bytes are owed. Every send advances it by `bytes * nanos_per_byte`; a send whose
///  watermark lies in the future waits. The watermark never falls more than the
///  accumulation window behind real time, so an idle connection cannot bank an unbounded
///  burst.
struct BandwidthShaper {
    nanos_per_byte: u64,
    accumulation_window: std::time::Duration,
    watermark: Instant,
}

impl BandwidthShaper {
    fn new(nanos_per_byte: u64, accumulation_window: std::time::Duration) -> BandwidthShaper {
        BandwidthShaper {
            nanos_per_byte,
            accumulation_window,
            watermark: Instant::now(),
        }
    }

    async fn admit(&mut self, num_bytes: usize) {
        let now = Instant::now();

        let floor = now.checked_sub(self.accumulation_window).unwrap_or(now);
        if self.watermark < floor {
            self.watermark = floor;
        }
        if self.watermark > now {
            tokio::time::sleep_until(self.watermark).await;
        }

        self.watermark += std::time::Duration::from_nanos(num_bytes as u64 * self.nanos_per_byte);
    }
}

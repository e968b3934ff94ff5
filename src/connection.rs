use crate::ack_tracker::AckTracker;
use crate::config::Config;
use crate::error::TransportError;
use crate::in_flight::InFlightSets;
use crate::ordering_gate::{OrderingGate, Released};
use crate::packet_types::{PacketType, PacketTypeDescriptor, PacketTypeTable};
use crate::protocol::{DatagramSink, Protocol};
use crate::scheduler::{Scheduler, SendHandles};
use crate::seq::SequenceNumber;
use crate::sequence_pool::SequencePool;
use crate::wire;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, span, trace, warn, Level};
use uuid::Uuid;

/// default priority for packets the transport queues on its own behalf (error replies)
const ERROR_REPLY_PRIORITY: f64 = 1.0;

/// One established peer-to-peer connection: the send API over the outgoing scheduler,
///  and the receive path from raw datagram to ordered handler execution.
///
/// The caller owns the socket: it feeds received datagrams into
///  [Connection::on_datagram_received] and provides a [DatagramSink] for outgoing ones.
///  Salts come from the handshake (see [crate::wire::HandshakeFrame]); each direction is
///  hashed with its sender's salt.
///
/// A fatal error returned from the receive path ([TransportError::SequenceInvariantViolated],
///  [TransportError::Overloaded]) means the peers' views have diverged beyond repair; the
///  caller is expected to `close` and re-establish.
pub struct Connection {
    protocol: Arc<dyn Protocol>,
    types: PacketTypeTable,
    peer_salt: u32,
    pool: Arc<SequencePool>,
    ack_tracker: Arc<AckTracker>,
    gate: OrderingGate<Vec<u8>>,
    scheduler: Arc<Scheduler>,
    send_task: JoinHandle<()>,
}

impl Connection {
    pub fn new(
        config: Config,
        local_salt: u32,
        peer_salt: u32,
        protocol: Arc<dyn Protocol>,
        sink: Arc<dyn DatagramSink>,
    ) -> anyhow::Result<Arc<Connection>> {
        config.validate()?;
        let config = Arc::new(config);

        let pool = Arc::new(SequencePool::new(config.initial_sequence_slots, SequenceNumber::ZERO));
        let ack_tracker = Arc::new(AckTracker::new());
        let in_flight = Arc::new(InFlightSets::new());
        let gate = OrderingGate::new(config.max_outstanding_packets);

        let scheduler = Arc::new(Scheduler::new(
            config.clone(),
            local_salt,
            pool.clone(),
            ack_tracker.clone(),
            in_flight,
            sink,
        ));
        let send_task = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run().await })
        };

        Ok(Arc::new(Connection {
            protocol,
            types: PacketTypeTable::new(),
            peer_salt,
            pool,
            ack_tracker,
            gate,
            scheduler,
            send_task,
        }))
    }

    /// Queues an encoded packet for reliable, type-ordered delivery to the peer.
    pub fn send_packet(
        &self,
        descriptor: &PacketTypeDescriptor,
        priority: f64,
        bytes: Vec<u8>,
    ) -> anyhow::Result<SendHandles> {
        let packet_type = self.types.type_for(descriptor)?;
        Ok(self.scheduler.send(packet_type, priority, bytes)?)
    }

    /// Waits until every queued packet has been sent and acknowledged.
    pub async fn flush(&self) {
        self.scheduler.flush().await
    }

    /// Announces a packet ahead of its arrival on the peer's behalf - used by protocol
    ///  layers that know a send is coming before the transport sees it.
    pub fn pre_announce(&self, descriptor: &PacketTypeDescriptor, seq: SequenceNumber) -> anyhow::Result<()> {
        let packet_type = self.types.type_for(descriptor)?;
        Ok(self.gate.pre_announce(packet_type, seq)?)
    }

    /// Declares that no packet older than `seq` will ever arrive again, bounding the
    ///  ordering gate's memory and releasing anything blocked on lost announcements.
    pub fn trim_receive_window(self: &Arc<Self>, seq: SequenceNumber) {
        let released = self.gate.trim(seq);
        self.dispatch(released);
    }

    /// Feeds one raw received datagram through validation, deduplication, acknowledgement
    ///  bookkeeping and the ordering gate; handlers for released packets run as spawned
    ///  tasks. The returned errors are fatal for the connection, everything recoverable
    ///  is logged and swallowed.
    pub fn on_datagram_received(self: &Arc<Self>, datagram: &[u8]) -> Result<(), TransportError> {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
        let _entered = span.enter();

        let (header, payload) = match wire::decode_datagram(self.peer_salt, datagram) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => {
                debug!("hash mismatch on received datagram - dropping");
                return Ok(());
            }
            Err(e) => {
                warn!("unparseable datagram: {:#} - dropping", e);
                return Ok(());
            }
        };
        trace!("received datagram #{}, {} payload bytes", header.sequence_number, payload.len());

        // the piggy-backed ack field is valuable even on a duplicate
        for acked in header.ack.iter() {
            self.pool.on_acknowledged(acked);
            self.scheduler.on_acknowledged(acked);
        }

        let is_pure_ack = payload.is_empty();
        let is_new = self
            .ack_tracker
            .on_sequence_number_received(header.sequence_number, !is_pure_ack);
        if !is_pure_ack {
            self.scheduler.on_ack_pending();
        }
        if !is_new {
            debug!("datagram #{} is a duplicate - dropping after ack processing", header.sequence_number);
            return Ok(());
        }
        if is_pure_ack {
            return Ok(());
        }

        let packets = self.parse_packets(payload);

        // file the wait field's in-flight hints before admitting anything, so older
        //  datagrams still under way block what must not overtake them
        let union_waits = packets.iter().fold(0u64, |mask, (ty, _)| mask | ty.waits_for);
        for k in 1..32 {
            if header.wait_field & (1u32 << k) != 0 {
                let dep = header.sequence_number.minus(k);
                if !self.ack_tracker.was_received(dep) {
                    self.gate.announce_dependencies(dep, union_waits)?;
                }
            }
        }

        let mut released = Vec::new();
        for (packet_type, bytes) in packets {
            released.extend(self.gate.admit(packet_type, header.sequence_number, bytes)?);
        }
        released.extend(self.gate.resolve_announcement(header.sequence_number));

        self.dispatch(released);
        Ok(())
    }

    /// Splits a payload into its self-describing packets. A packet that cannot be split
    ///  or classified discards the rest of the payload - boundaries after it are
    ///  unknowable - but everything before it is kept.
    fn parse_packets(&self, payload: &[u8]) -> Vec<(PacketType, Vec<u8>)> {
        let mut packets = Vec::new();
        let mut rest = payload;

        while !rest.is_empty() {
            let len = match self.protocol.next_packet_len(rest) {
                Ok(len) if len > 0 && len <= rest.len() => len,
                Ok(len) => {
                    warn!("protocol reported packet length {} of {} remaining bytes - discarding rest of datagram", len, rest.len());
                    break;
                }
                Err(e) => {
                    warn!("cannot split packet: {:#} - discarding rest of datagram", e);
                    break;
                }
            };

            let descriptor = match self.protocol.packet_descriptor(&rest[..len]) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    warn!("cannot classify packet: {:#} - discarding rest of datagram", e);
                    break;
                }
            };
            let packet_type = match self.types.type_for(&descriptor) {
                Ok(packet_type) => packet_type,
                Err(e) => {
                    warn!("cannot resolve packet type {}: {:#} - discarding rest of datagram", descriptor.key, e);
                    break;
                }
            };

            packets.push((packet_type, rest[..len].to_vec()));
            rest = &rest[len..];
        }
        packets
    }

    /// Spawns a handler task per released packet. Completion feeds back into the gate,
    ///  which may release more.
    fn dispatch(self: &Arc<Self>, released: Vec<Released<Vec<u8>>>) {
        for packet in released {
            let connection = self.clone();
            tokio::spawn(async move { connection.execute(packet).await });
        }
    }

    async fn execute(self: Arc<Self>, released: Released<Vec<u8>>) {
        let packet_type = released.packet_type;
        let seq = released.sequence_number;

        // the extra spawn contains handler panics: they surface as a JoinError instead of
        //  tearing down the connection
        let protocol = self.protocol.clone();
        let handler = tokio::spawn(async move { protocol.handle_packet(packet_type, released.packet).await });

        let failure = match handler.await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(join_error) => Some(format!("handler panicked: {}", join_error)),
        };

        if let Some(message) = failure {
            warn!("handler for type {} packet in #{} failed: {}", packet_type.id, seq, message);
            if let Some((descriptor, reply)) = self.protocol.error_reply(packet_type, message) {
                if let Err(e) = self.send_packet(&descriptor, ERROR_REPLY_PRIORITY, reply) {
                    debug!("cannot queue error reply: {:#}", e);
                }
            }
        }

        let next = self.gate.notify_finished(packet_type.id, seq);
        self.dispatch(next);
    }

    /// Shuts the connection down: stops the scheduler, fails every pending completion
    ///  signal with [TransportError::ConnectionClosed]. Handlers already running finish
    ///  undisturbed.
    pub fn close(&self) {
        debug!("closing connection");
        self.scheduler.close();
        self.pool.fail_all(TransportError::ConnectionClosed);
        self.send_task.abort();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.send_task.abort();
    }
}

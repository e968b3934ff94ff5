use crate::error::TransportError;
use crate::packet_types::{type_ids, PacketType};
use crate::seq::SequenceNumber;
use std::sync::Mutex;
use tracing::{debug, trace};

/// Receive-side ordering gate: admits arriving packets into per-type pending queues and
///  releases a packet for handler execution only once no type it must not overtake has an
///  older still-unfinished packet.
///
/// A packet passes through four logical stages:
///
///  * PRE-RECEIVE - announced early (explicitly, or via the piggy-backed wait field of a
///     younger datagram) but not arrived yet
///  * RECEIVED    - arrived, blocked on dependencies
///  * PROCESSING  - released, handler running
///  * DONE        - finished, removed
///
/// PRE-RECEIVE, RECEIVED and PROCESSING members block younger packets of dependent types
///  through their oldest member; PROCESSING and DONE are remembered through a per-type
///  'youngest started' marker, which is what makes a late packet of a dependent type
///  droppable: once a younger packet of a type it must not overtake has started, it can
///  never legally execute.
///
/// All state is behind one short-critical-section mutex. Released packets are returned to
///  the caller rather than dispatched from under the lock; handler execution happens
///  outside, and unrelated types therefore only ever wait on bookkeeping, never on each
///  other's handlers.
pub struct OrderingGate<P> {
    inner: Mutex<GateInner<P>>,
    max_outstanding: usize,
}

/// A packet the gate has moved to PROCESSING; the caller runs its handler and reports
///  back via `notify_finished`.
#[derive(Debug)]
pub struct Released<P> {
    pub packet_type: PacketType,
    pub sequence_number: SequenceNumber,
    pub packet: P,
}

struct GateInner<P> {
    queues: Vec<TypeQueue<P>>,
    /// the most recent sequence number ever observed (admitted or announced)
    newest_seen: Option<SequenceNumber>,
    /// lower edge of the ordering window, set from the oldest observed number and
    ///  advanced by `trim`; together with `newest_seen` this detects window violations
    lower_bound: Option<SequenceNumber>,
    /// which of the last 32 numbers relative to `newest_seen` have been admitted
    admitted_bits: u32,
    /// global arrival tie-breaker for packets sharing a sequence number
    arrival_counter: u64,
    /// RECEIVED + PROCESSING across all types
    outstanding: usize,
    /// no packet older than this will ever arrive again
    trim_threshold: Option<SequenceNumber>,
}

struct TypeQueue<P> {
    waits_for: u64,
    pre_received: Vec<(SequenceNumber, u64)>,
    received: Vec<GatedPacket<P>>,
    processing: Vec<(SequenceNumber, u64)>,
    /// youngest sequence number of this type that ever reached PROCESSING (or DONE)
    youngest_started: Option<SequenceNumber>,
}

struct GatedPacket<P> {
    seq: SequenceNumber,
    counter: u64,
    packet_type: PacketType,
    packet: P,
}

impl<P> TypeQueue<P> {
    fn empty() -> TypeQueue<P> {
        TypeQueue {
            waits_for: 0,
            pre_received: Vec::new(),
            received: Vec::new(),
            processing: Vec::new(),
            youngest_started: None,
        }
    }
}

/// wraparound-aware 'strictly earlier', with the arrival counter breaking ties between
///  packets that share a datagram's sequence number
fn earlier(a: (SequenceNumber, u64), b: (SequenceNumber, u64)) -> bool {
    a.0.is_before(b.0) || (a.0 == b.0 && a.1 < b.1)
}

impl<P> OrderingGate<P> {
    pub fn new(max_outstanding: usize) -> OrderingGate<P> {
        OrderingGate {
            inner: Mutex::new(GateInner {
                queues: Vec::new(),
                newest_seen: None,
                lower_bound: None,
                admitted_bits: 0,
                arrival_counter: 0,
                outstanding: 0,
                trim_threshold: None,
            }),
            max_outstanding,
        }
    }

    /// Announces a packet of a known type before its arrival, making it a blocking factor
    ///  for younger packets of types that must not overtake it. A packet that can never
    ///  legally execute any more is dropped right away.
    pub fn pre_announce(&self, packet_type: PacketType, seq: SequenceNumber) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_and_observe(seq)?;

        if inner.is_trimmed(seq) {
            debug!("pre-announced packet #{} is older than the trim threshold - ignoring", seq);
            return Ok(());
        }

        inner.ensure_queue(packet_type);
        if inner.is_dead(packet_type.waits_for, seq) {
            debug!("pre-announced packet #{} of type {} can never execute in order - dropping", seq, packet_type.id);
            return Ok(());
        }

        if !inner.queues[packet_type.id].pre_received.iter().any(|&(s, _)| s == seq) {
            let counter = inner.arrival_counter;
            inner.arrival_counter += 1;
            inner.queues[packet_type.id].pre_received.push((seq, counter));
        }
        Ok(())
    }

    /// Announces the in-flight dependency hints piggy-backed on an arriving datagram: the
    ///  datagram with `seq` is known to contain a packet of *some* type in `waits_mask`.
    ///  It is filed under every type in the mask - over-approximate, but resolved the
    ///  moment the datagram actually arrives.
    pub fn announce_dependencies(&self, seq: SequenceNumber, waits_mask: u64) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_and_observe(seq)?;

        if inner.is_trimmed(seq) || inner.was_admitted(seq) {
            return Ok(());
        }

        for type_id in type_ids(waits_mask) {
            while inner.queues.len() <= type_id {
                inner.queues.push(TypeQueue::empty());
            }
            if !inner.queues[type_id].pre_received.iter().any(|&(s, _)| s == seq) {
                let counter = inner.arrival_counter;
                inner.arrival_counter += 1;
                inner.queues[type_id].pre_received.push((seq, counter));
                trace!("announced in-flight dependency #{} for type {}", seq, type_id);
            }
        }
        Ok(())
    }

    /// Clears all announcements for `seq` - called once the datagram with that number has
    ///  arrived, whatever types it turned out to contain.
    pub fn resolve_announcement(&self, seq: SequenceNumber) -> Vec<Released<P>> {
        let mut inner = self.inner.lock().unwrap();
        for queue in &mut inner.queues {
            queue.pre_received.retain(|&(s, _)| s != seq);
        }
        inner.attempt_advance_all()
    }

    /// Admits an arrived packet, returning every packet this releases for execution.
    pub fn admit(&self, packet_type: PacketType, seq: SequenceNumber, packet: P) -> Result<Vec<Released<P>>, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_and_observe(seq)?;

        inner.ensure_queue(packet_type);
        inner.queues[packet_type.id].pre_received.retain(|&(s, _)| s != seq);

        if inner.is_trimmed(seq) {
            debug!("packet #{} arrived after trim declared it would not - dropping", seq);
            return Ok(inner.attempt_advance_all());
        }

        if inner.is_dead(packet_type.waits_for, seq) {
            debug!("packet #{} of type {} can never execute in order - dropping", seq, packet_type.id);
            return Ok(inner.attempt_advance_all());
        }

        if inner.outstanding >= self.max_outstanding {
            return Err(TransportError::Overloaded {
                outstanding: inner.outstanding,
                limit: self.max_outstanding,
            });
        }
        inner.outstanding += 1;

        let counter = inner.arrival_counter;
        inner.arrival_counter += 1;
        inner.mark_admitted(seq);
        inner.queues[packet_type.id].received.push(GatedPacket {
            seq,
            counter,
            packet_type,
            packet,
        });

        Ok(inner.attempt_advance_all())
    }

    /// Moves a packet from PROCESSING to DONE and returns everything its completion
    ///  releases.
    pub fn notify_finished(&self, type_id: usize, seq: SequenceNumber) -> Vec<Released<P>> {
        let mut inner = self.inner.lock().unwrap();

        let mut finished = false;
        if let Some(queue) = inner.queues.get_mut(type_id) {
            if let Some(pos) = queue.processing.iter().position(|&(s, _)| s == seq) {
                queue.processing.remove(pos);
                finished = true;
            }
        }
        if finished {
            inner.outstanding -= 1;
        }
        inner.attempt_advance_all()
    }

    /// Declares that no packet older than `seq` will ever arrive again: per-type 'youngest
    ///  started' markers older than the trim point are forgotten, and announcements of
    ///  numbers that will now never arrive stop blocking. This is what bounds the gate's
    ///  memory.
    pub fn trim(&self, seq: SequenceNumber) -> Vec<Released<P>> {
        let mut inner = self.inner.lock().unwrap();

        if inner.trim_threshold.map_or(true, |t| t.is_before(seq)) {
            inner.trim_threshold = Some(seq);
        }
        // the ordering window moves with the trim point; without this a long-lived
        //  connection wrapping the sequence space would trip the invariant check on
        //  perfectly valid numbers
        if inner.lower_bound.map_or(true, |lower| lower.is_before(seq)) {
            inner.lower_bound = Some(seq);
        }

        for queue in &mut inner.queues {
            if queue.youngest_started.map_or(false, |y| y.is_before(seq)) {
                queue.youngest_started = None;
            }
            queue.pre_received.retain(|&(s, _)| !s.is_before(seq));
        }
        inner.attempt_advance_all()
    }

    /// RECEIVED + PROCESSING packets across all types.
    pub fn outstanding(&self) -> usize {
        self.inner.lock().unwrap().outstanding
    }
}

impl<P> GateInner<P> {
    fn check_and_observe(&mut self, seq: SequenceNumber) -> Result<(), TransportError> {
        if let (Some(lower), Some(newest)) = (self.lower_bound, self.newest_seen) {
            // a number that is simultaneously at/before the lower bound and after the
            //  newest number ever seen has no consistent place in the window
            if seq.is_at_or_before(lower) && newest.is_before(seq) {
                return Err(TransportError::SequenceInvariantViolated { sequence_number: seq });
            }
        }

        if let Some(newest) = self.newest_seen {
            let delta = seq.offset_from(newest);
            if delta > 0 {
                self.admitted_bits = if delta >= 32 { 0 } else { self.admitted_bits << delta };
                self.newest_seen = Some(seq);
            }
        }
        else {
            self.newest_seen = Some(seq);
        }

        if self.lower_bound.map_or(true, |lower| seq.is_before(lower)) {
            self.lower_bound = Some(seq);
        }
        Ok(())
    }

    fn mark_admitted(&mut self, seq: SequenceNumber) {
        if let Some(newest) = self.newest_seen {
            let behind = newest.offset_from(seq);
            if (0..32).contains(&behind) {
                self.admitted_bits |= 1u32 << behind;
            }
        }
    }

    fn was_admitted(&self, seq: SequenceNumber) -> bool {
        match self.newest_seen {
            Some(newest) => {
                let behind = newest.offset_from(seq);
                (0..32).contains(&behind) && self.admitted_bits & (1u32 << behind) != 0
            }
            None => false,
        }
    }

    fn is_trimmed(&self, seq: SequenceNumber) -> bool {
        self.trim_threshold.map_or(false, |t| seq.is_before(t))
    }

    /// true iff a type this packet must not overtake has already started something younger
    fn is_dead(&self, waits_mask: u64, seq: SequenceNumber) -> bool {
        type_ids(waits_mask).any(|type_id| {
            self.queues
                .get(type_id)
                .and_then(|q| q.youngest_started)
                .map_or(false, |youngest| seq.is_before(youngest))
        })
    }

    fn ensure_queue(&mut self, packet_type: PacketType) {
        while self.queues.len() <= packet_type.id {
            self.queues.push(TypeQueue::empty());
        }
        self.queues[packet_type.id].waits_for = packet_type.waits_for;
    }

    /// Starts every packet whose dependencies are satisfied. Starting a packet never
    ///  unblocks another one (it keeps blocking as PROCESSING), so a single pass over the
    ///  types is complete.
    fn attempt_advance_all(&mut self) -> Vec<Released<P>> {
        let mut released = Vec::new();

        for type_id in 0..self.queues.len() {
            loop {
                let oldest = self.queues[type_id]
                    .received
                    .iter()
                    .enumerate()
                    .min_by(|(_, a), (_, b)| {
                        if earlier((a.seq, a.counter), (b.seq, b.counter)) {
                            std::cmp::Ordering::Less
                        }
                        else {
                            std::cmp::Ordering::Greater
                        }
                    })
                    .map(|(idx, gp)| (idx, gp.seq, gp.counter));

                let (idx, seq, counter) = match oldest {
                    Some(x) => x,
                    None => break,
                };
                if self.is_blocked(type_id, seq, counter) {
                    break;
                }

                let gated = self.queues[type_id].received.swap_remove(idx);
                self.queues[type_id].processing.push((gated.seq, gated.counter));

                let youngest = &mut self.queues[type_id].youngest_started;
                if youngest.map_or(true, |y| y.is_before(gated.seq)) {
                    *youngest = Some(gated.seq);
                }

                trace!("releasing packet #{} of type {} for execution", gated.seq, type_id);
                released.push(Released {
                    packet_type: gated.packet_type,
                    sequence_number: gated.seq,
                    packet: gated.packet,
                });
            }
        }

        released
    }

    fn is_blocked(&self, type_id: usize, seq: SequenceNumber, counter: u64) -> bool {
        let mask = self.queues[type_id].waits_for;

        type_ids(mask).any(|dep_id| {
            let queue = match self.queues.get(dep_id) {
                Some(queue) => queue,
                None => return false,
            };

            queue.pre_received.iter().any(|&e| earlier(e, (seq, counter)))
                || queue.processing.iter().any(|&e| earlier(e, (seq, counter)))
                || queue
                    .received
                    .iter()
                    .any(|gp| gp.counter != counter && earlier((gp.seq, gp.counter), (seq, counter)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(raw: i32) -> SequenceNumber {
        SequenceNumber::from_raw(raw)
    }

    fn unordered(id: usize) -> PacketType {
        PacketType { id, waits_for: 0 }
    }

    fn self_ordered(id: usize) -> PacketType {
        PacketType { id, waits_for: 1 << id }
    }

    fn released_names(released: &[Released<&'static str>]) -> Vec<&'static str> {
        released.iter().map(|r| r.packet).collect()
    }

    #[test]
    fn test_unrelated_types_execute_in_admission_order() {
        let gate: OrderingGate<&str> = OrderingGate::new(100);

        let mut executed = Vec::new();
        executed.extend(released_names(&gate.admit(unordered(0), seq(5), "x").unwrap()));
        executed.extend(released_names(&gate.admit(unordered(1), seq(3), "y").unwrap()));
        executed.extend(released_names(&gate.admit(unordered(2), seq(9), "z").unwrap()));

        assert_eq!(executed, vec!["x", "y", "z"]);
        assert_eq!(gate.outstanding(), 3);

        gate.notify_finished(0, seq(5));
        gate.notify_finished(1, seq(3));
        gate.notify_finished(2, seq(9));
        assert_eq!(gate.outstanding(), 0);
    }

    /// Self-ordered packets a@2, b@3, c@-1 delivered without pre-announcement: "a" runs
    ///  immediately, "b" waits for "a", and "c" - arriving after its slot has conclusively
    ///  passed - is dropped.
    #[test]
    fn test_self_ordered_late_packet_is_dropped() {
        let ty = self_ordered(0);
        let gate: OrderingGate<&str> = OrderingGate::new(100);

        assert_eq!(released_names(&gate.admit(ty, seq(2), "a").unwrap()), vec!["a"]);
        assert_eq!(released_names(&gate.admit(ty, seq(3), "b").unwrap()), Vec::<&str>::new());
        // c is older than the youngest started packet of its own type - dropped
        assert_eq!(released_names(&gate.admit(ty, seq(-1), "c").unwrap()), Vec::<&str>::new());

        assert_eq!(released_names(&gate.notify_finished(0, seq(2))), vec!["b"]);
        // only a and b ever counted as outstanding
        assert_eq!(gate.outstanding(), 1);
    }

    /// The same three packets pre-announced before delivery: nothing is dropped, they
    ///  execute strictly oldest-first as each predecessor finishes.
    #[test]
    fn test_self_ordered_with_pre_announcement() {
        let ty = self_ordered(0);
        let gate: OrderingGate<&str> = OrderingGate::new(100);

        gate.pre_announce(ty, seq(2)).unwrap();
        gate.pre_announce(ty, seq(3)).unwrap();
        gate.pre_announce(ty, seq(-1)).unwrap();

        assert_eq!(released_names(&gate.admit(ty, seq(2), "a").unwrap()), Vec::<&str>::new());
        assert_eq!(released_names(&gate.admit(ty, seq(3), "b").unwrap()), Vec::<&str>::new());
        assert_eq!(released_names(&gate.admit(ty, seq(-1), "c").unwrap()), vec!["c"]);

        assert_eq!(released_names(&gate.notify_finished(0, seq(-1))), vec!["a"]);
        assert_eq!(released_names(&gate.notify_finished(0, seq(2))), vec!["b"]);
        assert_eq!(released_names(&gate.notify_finished(0, seq(3))), Vec::<&str>::new());
    }

    /// Three numbers spaced so that wraparound comparison is intransitive: delivering two
    ///  of them and then the third must raise the sequence-invariant error, from the
    ///  admit entry point as well as from pre-announcement.
    #[test]
    fn test_intransitive_window_violation_on_admit() {
        let a = seq((2_147_483_648i64 / 3 * 2) as i32);
        let b = seq(0);
        let c = seq((-2_147_483_648i64 / 3 * 2) as i32);

        let gate: OrderingGate<&str> = OrderingGate::new(100);
        gate.admit(unordered(0), a, "a").unwrap();
        gate.admit(unordered(0), b, "b").unwrap();

        assert_eq!(
            gate.admit(unordered(0), c, "c").unwrap_err(),
            TransportError::SequenceInvariantViolated { sequence_number: c }
        );
    }

    #[test]
    fn test_intransitive_window_violation_on_pre_announce() {
        let a = seq((2_147_483_648i64 / 3 * 2) as i32);
        let b = seq(0);
        let c = seq((-2_147_483_648i64 / 3 * 2) as i32);

        let gate: OrderingGate<&str> = OrderingGate::new(100);
        gate.pre_announce(unordered(0), a).unwrap();
        gate.pre_announce(unordered(0), b).unwrap();

        assert_eq!(
            gate.pre_announce(unordered(0), c).unwrap_err(),
            TransportError::SequenceInvariantViolated { sequence_number: c }
        );
    }

    /// A dependency announced via the wait field blocks dependents until the datagram
    ///  arrives and resolves it.
    #[test]
    fn test_announced_dependency_blocks_until_resolved() {
        let dep = unordered(0);
        let ty = PacketType { id: 1, waits_for: 1 << 0 };
        let gate: OrderingGate<&str> = OrderingGate::new(100);

        gate.announce_dependencies(seq(4), 1 << 0).unwrap();
        assert_eq!(released_names(&gate.admit(ty, seq(6), "dependent").unwrap()), Vec::<&str>::new());

        // the announced datagram arrives; its packet starts, the dependent stays blocked
        let mut released = gate.admit(dep, seq(4), "dependency").unwrap();
        released.extend(gate.resolve_announcement(seq(4)));
        assert_eq!(released_names(&released), vec!["dependency"]);

        assert_eq!(released_names(&gate.notify_finished(0, seq(4))), vec!["dependent"]);
    }

    #[test]
    fn test_trim_unblocks_lost_announcements() {
        let ty = PacketType { id: 1, waits_for: 1 << 0 };
        let gate: OrderingGate<&str> = OrderingGate::new(100);

        gate.announce_dependencies(seq(4), 1 << 0).unwrap();
        assert_eq!(released_names(&gate.admit(ty, seq(6), "p").unwrap()), Vec::<&str>::new());

        // the announced datagram is declared lost for good
        assert_eq!(released_names(&gate.trim(seq(5))), vec!["p"]);
    }

    /// A packet older than the trim point that was never pre-announced must not resurrect
    ///  a false blocking dependency; packets newer than the trim point are unaffected.
    #[test]
    fn test_late_packet_after_trim_is_dropped() {
        let ty = self_ordered(0);
        let gate: OrderingGate<&str> = OrderingGate::new(100);

        gate.admit(ty, seq(10), "first").unwrap();
        gate.trim(seq(8));

        // too old to ever arrive per the trim declaration - dropped, does not block
        assert_eq!(released_names(&gate.admit(ty, seq(5), "late").unwrap()), Vec::<&str>::new());

        assert_eq!(released_names(&gate.notify_finished(0, seq(10))), Vec::<&str>::new());
        assert_eq!(released_names(&gate.admit(ty, seq(11), "next").unwrap()), vec!["next"]);
        assert_eq!(gate.outstanding(), 1);
    }

    /// A connection that lives long enough to wrap through the sequence space must not
    ///  trip the window-violation check, provided trimming keeps the window moving.
    #[test]
    fn test_trim_advances_the_ordering_window() {
        let ty = unordered(0);
        let gate: OrderingGate<&str> = OrderingGate::new(100);

        gate.admit(ty, seq(0), "start").unwrap();
        gate.notify_finished(0, seq(0));
        gate.admit(ty, seq(1_500_000_000), "mid").unwrap();
        gate.notify_finished(0, seq(1_500_000_000));

        gate.trim(seq(1_400_000_000));

        // more than half the number space past the original lower bound
        let wrapped = seq(i32::MIN + 100);
        assert_eq!(released_names(&gate.admit(ty, wrapped, "wrapped").unwrap()), vec!["wrapped"]);
    }

    #[test]
    fn test_trim_forgets_youngest_started_marker() {
        let ty = self_ordered(0);
        let gate: OrderingGate<&str> = OrderingGate::new(100);

        gate.admit(ty, seq(10), "first").unwrap();
        gate.notify_finished(0, seq(10));

        // without the trim, a packet older than #10 would be dropped as overtaken
        gate.trim(seq(20));
        assert_eq!(released_names(&gate.admit(ty, seq(25), "next").unwrap()), vec!["next"]);
    }

    #[test]
    fn test_overload_is_fatal() {
        let gate: OrderingGate<&str> = OrderingGate::new(2);
        let blocker = PacketType { id: 0, waits_for: 1 };

        gate.admit(blocker, seq(1), "a").unwrap();
        gate.admit(blocker, seq(2), "b").unwrap();

        assert_eq!(
            gate.admit(blocker, seq(3), "c").unwrap_err(),
            TransportError::Overloaded { outstanding: 2, limit: 2 }
        );
    }

    /// Two packets of a self-ordered type sharing a datagram (and therefore a sequence
    ///  number) execute in payload order.
    #[test]
    fn test_same_sequence_number_ordered_by_arrival() {
        let ty = self_ordered(0);
        let gate: OrderingGate<&str> = OrderingGate::new(100);

        assert_eq!(released_names(&gate.admit(ty, seq(1), "first").unwrap()), vec!["first"]);
        assert_eq!(released_names(&gate.admit(ty, seq(1), "second").unwrap()), Vec::<&str>::new());
        assert_eq!(released_names(&gate.notify_finished(0, seq(1))), vec!["second"]);
    }
}

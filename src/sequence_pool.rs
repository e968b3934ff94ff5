use crate::completion::CompletionSignal;
use crate::error::TransportError;
use crate::seq::SequenceNumber;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Allocates monotonically increasing local sequence numbers and keeps the completion
///  signal of every outstanding number until it is acknowledged.
///
/// Signals are stored in a circular slot array; the slot count is a power of two so that
///  the mapping from a wrapping sequence number to a slot stays stable across growth. If
///  the slot about to be reused still holds an incomplete signal the array is doubled,
///  redistributing entries and preserving their relative order.
///
/// Allocation and acknowledgement are serialized by a single mutex - resizing must be
///  atomic with respect to both operations, so there is nothing to gain from going
///  lock-free here.
pub struct SequencePool {
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    slots: Vec<Option<(SequenceNumber, Arc<CompletionSignal>)>>,
    next: SequenceNumber,
}

impl PoolInner {
    fn slot_index(&self, seq: SequenceNumber) -> usize {
        (seq.to_raw() as u32 as usize) & (self.slots.len() - 1)
    }

    fn grow(&mut self) {
        let new_len = self.slots.len() * 2;
        debug!("sequence pool full of incomplete signals - growing to {} slots", new_len);

        let old = std::mem::replace(&mut self.slots, vec![None; new_len]);
        for entry in old.into_iter().flatten() {
            let idx = (entry.0.to_raw() as u32 as usize) & (new_len - 1);
            self.slots[idx] = Some(entry);
        }
    }
}

impl SequencePool {
    /// `initial_slots` must be a power of two (validated by [crate::config::Config]).
    pub fn new(initial_slots: usize, first_sequence_number: SequenceNumber) -> SequencePool {
        assert!(initial_slots.is_power_of_two());
        SequencePool {
            inner: Mutex::new(PoolInner {
                slots: vec![None; initial_slots],
                next: first_sequence_number,
            }),
        }
    }

    /// The number the next call to `allocate` will return. The outgoing scheduler is the
    ///  only allocator per direction; it uses this to encode dependency masks relative to a
    ///  datagram's number before committing to the allocation.
    pub fn peek_next(&self) -> SequenceNumber {
        self.inner.lock().unwrap().next
    }

    /// Returns the next sequence number and stores the signal to be completed when that
    ///  number is acknowledged.
    pub fn allocate(&self, signal: Arc<CompletionSignal>) -> SequenceNumber {
        let mut inner = self.inner.lock().unwrap();

        let seq = inner.next;
        let idx = inner.slot_index(seq);
        if matches!(&inner.slots[idx], Some((_, stored)) if !stored.is_completed()) {
            inner.grow();
        }

        let idx = inner.slot_index(seq);
        inner.slots[idx] = Some((seq, signal));
        inner.next = seq.next();

        trace!("allocated sequence number #{}", seq);
        seq
    }

    /// Completes the signal stored for `seq`. A number older than the oldest trackable one
    ///  (recycled slot, or assumed lost) is a no-op, as is a duplicate acknowledgement -
    ///  both are expected under retransmission.
    pub fn on_acknowledged(&self, seq: SequenceNumber) {
        let mut inner = self.inner.lock().unwrap();

        if !seq.is_before(inner.next) {
            debug!("acknowledgement for not-yet-allocated sequence number #{} - ignoring", seq);
            return;
        }

        let idx = inner.slot_index(seq);
        match inner.slots[idx].take() {
            Some((stored_seq, signal)) if stored_seq == seq => {
                trace!("sequence number #{} acknowledged", seq);
                signal.complete();
            }
            other => {
                // already recycled or acked before - nothing to do
                inner.slots[idx] = other;
            }
        }
    }

    /// Fails every outstanding signal. Called when the connection shuts down - nothing
    ///  tracked here will ever be acknowledged after that.
    pub fn fail_all(&self, error: TransportError) {
        let mut inner = self.inner.lock().unwrap();
        for slot in inner.slots.iter_mut() {
            if let Some((seq, signal)) = slot.take() {
                debug!("failing outstanding sequence number #{}: {}", seq, error);
                signal.fail(error.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    fn signal() -> Arc<CompletionSignal> {
        Arc::new(CompletionSignal::new())
    }

    #[test]
    fn test_allocate_is_monotonic() {
        let pool = SequencePool::new(4, SequenceNumber::ZERO);
        for expected in 0..10 {
            assert_eq!(pool.peek_next(), SequenceNumber::from_raw(expected));
            let sig = signal();
            let seq = pool.allocate(sig.clone());
            assert_eq!(seq, SequenceNumber::from_raw(expected));
            sig.complete(); // keep slots reusable
        }
    }

    #[test]
    fn test_acknowledge_completes_signal_once() {
        let pool = SequencePool::new(4, SequenceNumber::ZERO);
        let sig = signal();
        let seq = pool.allocate(sig.clone());

        assert!(!sig.is_completed());
        pool.on_acknowledged(seq);
        assert!(sig.is_completed());

        // duplicate ack is a no-op
        pool.on_acknowledged(seq);
    }

    #[rstest]
    #[case::far_in_the_past(-100)]
    #[case::not_yet_allocated(50)]
    fn test_untracked_ack_is_noop(#[case] raw: i32) {
        let pool = SequencePool::new(4, SequenceNumber::ZERO);
        let sig = signal();
        pool.allocate(sig.clone());

        pool.on_acknowledged(SequenceNumber::from_raw(raw));
        assert!(!sig.is_completed());
    }

    #[test]
    fn test_grows_when_slots_are_exhausted() {
        let pool = SequencePool::new(4, SequenceNumber::ZERO);

        let signals: Vec<_> = (0..10).map(|_| signal()).collect();
        let seqs: Vec<_> = signals.iter().map(|s| pool.allocate(s.clone())).collect();

        // more incomplete signals than initial slots - all must still be completable
        for (sig, seq) in signals.iter().zip(&seqs) {
            assert!(!sig.is_completed());
            pool.on_acknowledged(*seq);
            assert!(sig.is_completed());
        }
    }

    #[test]
    fn test_fail_all_fails_outstanding_signals() {
        let pool = SequencePool::new(4, SequenceNumber::ZERO);
        let acked = signal();
        let outstanding = signal();

        let seq = pool.allocate(acked.clone());
        pool.allocate(outstanding.clone());
        pool.on_acknowledged(seq);

        pool.fail_all(TransportError::ConnectionClosed);
        assert_eq!(acked.handle().outcome(), Some(Ok(())));
        assert_eq!(outstanding.handle().outcome(), Some(Err(TransportError::ConnectionClosed)));
    }

    #[test]
    fn test_allocation_across_wraparound() {
        let pool = SequencePool::new(4, SequenceNumber::from_raw(i32::MAX));
        let first = signal();
        let second = signal();

        let a = pool.allocate(first.clone());
        let b = pool.allocate(second.clone());
        assert_eq!(a, SequenceNumber::from_raw(i32::MAX));
        assert_eq!(b, SequenceNumber::from_raw(i32::MIN));

        pool.on_acknowledged(b);
        assert!(!first.is_completed());
        assert!(second.is_completed());
    }
}

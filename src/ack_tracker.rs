use crate::seq::SequenceNumber;
use bit_set::BitSet;
use std::sync::Mutex;
use tracing::{debug, trace};

/// Compact representation of a contiguous run of receive / non-receive status for the 32
///  numbers `oldest .. oldest+31`: bit `i` of `bitfield` is set iff `oldest + i` was
///  received. Embedded in every outgoing datagram to piggy-back acknowledgements.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Acknowledgement {
    pub oldest: SequenceNumber,
    pub bitfield: u32,
}

impl Acknowledgement {
    pub const EMPTY: Acknowledgement = Acknowledgement {
        oldest: SequenceNumber::ZERO,
        bitfield: 0,
    };

    /// All acknowledged numbers in the field, oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = SequenceNumber> + '_ {
        (0..32)
            .filter(|i| self.bitfield & (1u32 << i) != 0)
            .map(|i| self.oldest.plus(i))
    }

    pub fn contains(&self, seq: SequenceNumber) -> bool {
        let offset = seq.offset_from(self.oldest);
        (0..32).contains(&offset) && self.bitfield & (1u32 << offset) != 0
    }
}

/// Records which remote sequence numbers have been received and which of those the peer
///  has not been told about yet.
///
/// Two parallel bit-vectors indexed by the offset from a sliding base: 'received' (seen
///  within the tracked window) and 'pending' (seen but not yet reported in an
///  acknowledgement field). The base slides forward as numbers far beyond it arrive, so a
///  long-lived connection wraps through the sequence space cleanly; numbers that fell
///  behind the window count as duplicates.
pub struct AckTracker {
    inner: Mutex<AckTrackerInner>,
}

struct AckTrackerInner {
    /// sequence number corresponding to bit 0. Starts a slack window below the first
    ///  received number so that moderately older packets (delayed on the wire past their
    ///  siblings) stay representable, and slides forward with traffic.
    base: Option<SequenceNumber>,
    received: BitSet,
    pending: BitSet,
    /// highest tracked index marked received
    newest: usize,
    /// lowest index with a pending bit, if any
    oldest_pending: Option<usize>,
}

const BASE_SLACK: i32 = 1024;

/// Offsets the bitsets track before the base slides; a received number beyond this moves
///  the base forward to the middle of the window.
const TRACKED_WINDOW: usize = 1 << 16;

impl AckTracker {
    pub fn new() -> AckTracker {
        AckTracker {
            inner: Mutex::new(AckTrackerInner {
                base: None,
                received: BitSet::new(),
                pending: BitSet::new(),
                newest: 0,
                oldest_pending: None,
            }),
        }
    }

    /// Marks `seq` as received, returning false if it was a duplicate (the caller must
    ///  then suppress re-processing). With `queue_for_ack` the number is also queued to be
    ///  reported to the peer in the next acknowledgement field - that applies to
    ///  duplicates too, so a lost acknowledgement is repaired by the retransmission it
    ///  provokes.
    pub fn on_sequence_number_received(&self, seq: SequenceNumber, queue_for_ack: bool) -> bool {
        let mut inner = self.inner.lock().unwrap();

        let base = *inner.base.get_or_insert(seq.minus(BASE_SLACK));
        let offset = seq.offset_from(base);
        if offset < 0 {
            debug!("received sequence number #{} from before the tracked window - treating as duplicate", seq);
            return false;
        }
        let mut idx = offset as usize;
        if idx >= TRACKED_WINDOW {
            idx -= inner.slide(idx + 1 - TRACKED_WINDOW / 2);
        }

        let is_new = inner.received.insert(idx);
        if is_new {
            inner.newest = inner.newest.max(idx);
        }
        else {
            trace!("received duplicate sequence number #{}", seq);
        }

        if queue_for_ack {
            inner.pending.insert(idx);
            inner.oldest_pending = Some(inner.oldest_pending.map_or(idx, |old| old.min(idx)));
        }

        is_new
    }

    pub fn was_received(&self, seq: SequenceNumber) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.base {
            Some(base) => {
                let offset = seq.offset_from(base);
                // numbers from before the tracked window were handled long ago
                offset < 0 || inner.received.contains(offset as usize)
            }
            None => false,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.inner.lock().unwrap().oldest_pending.is_some()
    }

    /// Builds the acknowledgement field for the next outgoing datagram. The field's base is
    ///  the oldest number with a pending bit, or the newest-known number if nothing is
    ///  pending; the pending bits of the reported window are cleared. Returns `EMPTY` if no
    ///  number was ever received.
    pub fn build_acknowledgement_field(&self) -> Acknowledgement {
        let mut inner = self.inner.lock().unwrap();

        let base = match inner.base {
            Some(base) => base,
            None => return Acknowledgement::EMPTY,
        };

        let start_idx = inner.oldest_pending.unwrap_or(inner.newest);

        let mut bitfield = 0u32;
        for i in 0..32usize {
            if inner.received.contains(start_idx + i) {
                bitfield |= 1u32 << i;
            }
            inner.pending.remove(start_idx + i);
        }

        // the window may not have covered all pending bits
        let next_pending = (start_idx + 32..=inner.newest).find(|&i| inner.pending.contains(i));
        inner.oldest_pending = next_pending;

        Acknowledgement {
            oldest: base.plus(start_idx as i32),
            bitfield,
        }
    }
}

impl AckTrackerInner {
    /// Moves the base forward by up to `wanted` offsets, forgetting the status of the
    ///  numbers slid past. Never slides past a pending bit - an unreported
    ///  acknowledgement must survive until some field carries it.
    fn slide(&mut self, wanted: usize) -> usize {
        let shift = self.oldest_pending.map_or(wanted, |p| wanted.min(p));
        if shift == 0 {
            return 0;
        }

        let mut received = BitSet::new();
        for i in self.received.iter() {
            if i >= shift {
                received.insert(i - shift);
            }
        }
        let mut pending = BitSet::new();
        for i in self.pending.iter() {
            pending.insert(i - shift);
        }
        self.received = received;
        self.pending = pending;

        self.base = self.base.map(|b| b.plus(shift as i32));
        self.newest = self.newest.saturating_sub(shift);
        self.oldest_pending = self.oldest_pending.map(|p| p - shift);
        debug!("sliding the acknowledgement window forward by {} numbers", shift);
        shift
    }
}

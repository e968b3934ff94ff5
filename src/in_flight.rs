use crate::seq::SequenceNumber;
use rustc_hash::FxHashMap;
use std::sync::Mutex;
use tracing::{debug, trace};

/// Sender-side tracking of which recently sent, not-yet-acknowledged sequence numbers
///  belong to each packet type.
///
/// Per type this is `(newest sequence number, bitfield of unacknowledged offsets from the
///  newest, count of older-than-bitfield still-unacknowledged numbers)`. Encoding the set
///  into a datagram's 32-bit wait field tells the receiver which in-flight siblings a
///  packet must wait for; encoding fails with a sentinel (`None`) if any unacknowledged
///  number falls outside the 32-bit window from the new packet's number - an overload
///  condition that defers the packet, never a silent truncation.
pub struct InFlightSets {
    per_type: Mutex<FxHashMap<usize, TypeInFlight>>,
}

#[derive(Copy, Clone, Debug)]
struct TypeInFlight {
    newest: SequenceNumber,
    /// bit `k` set iff `newest - k` is unacknowledged
    bits: u32,
    /// unacknowledged numbers older than `newest - 31`; invariant: never negative
    older_count: u32,
}

impl InFlightSets {
    pub fn new() -> InFlightSets {
        InFlightSets {
            per_type: Mutex::new(FxHashMap::default()),
        }
    }

    /// Records that a packet of `type_id` was sent in the datagram with `seq`.
    pub fn add_packet(&self, type_id: usize, seq: SequenceNumber) {
        let mut per_type = self.per_type.lock().unwrap();

        let entry = per_type.entry(type_id).or_insert(TypeInFlight {
            newest: seq,
            bits: 0,
            older_count: 0,
        });

        let delta = seq.offset_from(entry.newest);
        if delta > 0 {
            let (shifted, fell_out) = shift_window(entry.bits, delta);
            entry.bits = shifted;
            entry.older_count += fell_out;
            entry.newest = seq;
        }
        entry.bits |= 1 << (entry.newest.offset_from(seq) as u32).min(31);

        trace!("in-flight set for type {}: {:?}", type_id, entry);
    }

    /// Clears the tracked bit for an acknowledged number, or decrements the older-count if
    ///  the number already fell outside the tracked window.
    pub fn on_acknowledged(&self, type_id: usize, seq: SequenceNumber) {
        let mut per_type = self.per_type.lock().unwrap();
        let entry = match per_type.get_mut(&type_id) {
            Some(entry) => entry,
            None => return,
        };

        let delta = entry.newest.offset_from(seq);
        if delta < 0 {
            debug!("acknowledgement for #{} which is newer than anything sent for type {} - ignoring", seq, type_id);
        }
        else if delta < 32 {
            entry.bits &= !(1u32 << delta);
        }
        else if entry.older_count > 0 {
            entry.older_count -= 1;
        }
        // else: duplicate ack of a number that was already cleared - nothing to do
    }

    /// Encodes the type's in-flight set as a bitfield relative to `new_seq` (bit `k` set iff
    ///  `new_seq - k` is an unacknowledged number of this type). Returns `None` if the set
    ///  cannot be represented - some unacknowledged number lies outside the 32-bit window -
    ///  in which case the packet being built must be deferred, not corrupted.
    pub fn encode_relative_to(&self, type_id: usize, new_seq: SequenceNumber) -> Option<u32> {
        let per_type = self.per_type.lock().unwrap();
        let entry = match per_type.get(&type_id) {
            Some(entry) => *entry,
            None => return Some(0),
        };

        if entry.older_count > 0 {
            return None;
        }

        let delta = new_seq.offset_from(entry.newest);
        if delta < 0 {
            // the new packet is older than the newest in-flight one; relative encoding is
            //  meaningless, treat as overflow
            return None;
        }

        let shifted = (entry.bits as u64) << delta.min(63);
        if shifted >> 32 != 0 {
            return None;
        }
        Some(shifted as u32)
    }
}

fn shift_window(bits: u32, delta: i32) -> (u32, u32) {
    if delta >= 32 {
        (0, bits.count_ones())
    }
    else {
        let fell_out = (bits >> (32 - delta)).count_ones();
        (bits << delta, fell_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    fn seq(raw: i32) -> SequenceNumber {
        SequenceNumber::from_raw(raw)
    }

    #[rstest]
    #[case::first_packet(vec![5], 6, Some(0b10))]
    #[case::two_adjacent(vec![5, 6], 7, Some(0b110))]
    #[case::with_gap(vec![5, 8], 9, Some(0b1001_0))]
    #[case::window_edge(vec![5], 36, Some(1 << 31))]
    #[case::just_outside_window(vec![5], 37, None)]
    fn test_encode(#[case] sent: Vec<i32>, #[case] new_seq: i32, #[case] expected: Option<u32>) {
        let sets = InFlightSets::new();
        for n in sent {
            sets.add_packet(0, seq(n));
        }
        assert_eq!(sets.encode_relative_to(0, seq(new_seq)), expected);
    }

    #[test]
    fn test_unknown_type_encodes_empty() {
        let sets = InFlightSets::new();
        assert_eq!(sets.encode_relative_to(7, seq(1)), Some(0));
    }

    #[test]
    fn test_acknowledgement_clears_bit() {
        let sets = InFlightSets::new();
        sets.add_packet(0, seq(5));
        sets.add_packet(0, seq(6));

        sets.on_acknowledged(0, seq(5));
        assert_eq!(sets.encode_relative_to(0, seq(7)), Some(0b10));

        sets.on_acknowledged(0, seq(6));
        assert_eq!(sets.encode_relative_to(0, seq(7)), Some(0));
    }

    #[test]
    fn test_older_than_window_blocks_encoding_until_acked() {
        let sets = InFlightSets::new();
        sets.add_packet(0, seq(0));
        // a burst that pushes #0 out of the 32-bit window
        sets.add_packet(0, seq(40));

        assert_eq!(sets.encode_relative_to(0, seq(41)), None);

        // acknowledging the too-old number decrements the older-count and unblocks encoding
        sets.on_acknowledged(0, seq(0));
        assert_eq!(sets.encode_relative_to(0, seq(41)), Some(0b10));
    }

    #[test]
    fn test_types_are_independent() {
        let sets = InFlightSets::new();
        sets.add_packet(0, seq(5));
        sets.add_packet(1, seq(6));

        assert_eq!(sets.encode_relative_to(0, seq(7)), Some(0b100));
        assert_eq!(sets.encode_relative_to(1, seq(7)), Some(0b10));
    }
}

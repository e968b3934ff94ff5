//! Reliable, per-type-ordered application messaging over unreliable datagrams.
//!
//! This transport sits between TCP and UDP: every packet is delivered at least once
//!  (acknowledged, resent on loss), but instead of one global delivery order there are
//!  declared per-packet-type ordering constraints - packet type `a` can declare it must
//!  never overtake packet type `b`, and the receiver only defers execution where such a
//!  constraint actually binds. Unrelated traffic flows freely past losses and reorderings
//!  that would stall a TCP stream.
//!
//! ## Design goals
//!
//! * Peer-to-peer: both sides are equal once the handshake has established the salts
//! * The unit of transfer is a *packet* (a defined-length chunk the application layer can
//!   encode and handle on its own), not a byte stream
//! * Several packets share one datagram: the scheduler packs by aged priority, never
//!   fragments, and shapes bandwidth with a bounded burst budget
//! * Acknowledgements piggy-back on regular traffic and fall back to dedicated datagrams
//!   only when the connection is idle
//! * Ordering constraints travel with the traffic: each datagram announces which older
//!   in-flight datagrams carry packets the receiver must wait for, so even a reordered
//!   first delivery can execute in the declared order instead of being dropped
//! * Fatal conditions are explicit (`SequenceInvariantViolated`, `Overloaded`) - this
//!   transport prefers tearing a diverged connection down over silently misordering
//!
//! ## Wire format
//!
//! One UDP datagram, all numbers little-endian:
//!
//! ```ascii
//!  0: hash (u32) - CRC-32 over the sender's salt followed by everything below.
//!      The salt never travels on the wire, so a corrupted or forged datagram
//!      fails validation without cryptographic machinery
//!  4: ack oldest (i32) - base of the acknowledgement field
//!  8: ack bits (u32) - bit i set iff 'ack oldest + i' was received
//! 12: sequence number (i32) - shared by all packets in this datagram; wraps
//! 16: wait field (u32) - bit k set iff datagram 'seq - k' is still in flight
//!      and carries a packet that something in this datagram must not overtake
//! 20: payload - concatenation of self-describing packets, empty for a pure ack
//! ```
//!
//! Sequence numbers are 32-bit and wrap; all comparisons are relative
//!  ([seq::SequenceNumber]). The receiver deduplicates and orders by sequence number,
//!  which is why a resend re-emits the stored bytes unchanged.
//!
//! ## Structure
//!
//! [connection::Connection] is the façade: the send API on top of the
//!  [scheduler::Scheduler] (sequence allocation, datagram assembly, shaping, resends) and
//!  the receive path ending in the [ordering_gate::OrderingGate] (deduplication via
//!  [ack_tracker::AckTracker], dependency announcements, ordered handler execution).
//!  The application side plugs in through the traits in [protocol].

pub mod ack_tracker;
pub mod completion;
pub mod config;
pub mod connection;
pub mod error;
pub mod in_flight;
pub mod ordering_gate;
pub mod packet_types;
pub mod protocol;
pub mod scheduler;
pub mod seq;
pub mod sequence_pool;
pub mod wire;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}

use crate::seq::SequenceNumber;

/// The named failure conditions of the transport core.
///
/// Corrupt datagrams and duplicate sequence numbers are *not* represented here: they are
///  resolved locally (logged and dropped) and never surface to the caller. Handler failures
///  are converted to an error-reply packet and likewise stay below this boundary.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    /// A packet's sequence number is simultaneously at or before the ordering window's lower
    ///  bound and after the most recent number ever seen. This means the ordering window has
    ///  been violated (typically a handler hung or never signalled completion) and the
    ///  connection's ordering guarantees are void.
    #[error("sequence invariant violated: packet #{sequence_number} falls outside the ordering window")]
    SequenceInvariantViolated { sequence_number: SequenceNumber },

    /// Too many packets are outstanding on the receive side. The caller's policy (commonly
    ///  resetting the connection) is outside the core.
    #[error("overloaded: {outstanding} outstanding packets, limit is {limit}")]
    Overloaded { outstanding: usize, limit: usize },

    /// The connection was closed while the packet was still pending.
    #[error("connection closed")]
    ConnectionClosed,

    /// A single packet exceeds what fits into one datagram. Fragmentation is unsupported,
    ///  so this fails the packet's send signal rather than attempting partial transmission.
    #[error("payload of {payload_len} bytes exceeds the datagram capacity of {capacity}")]
    PayloadTooLarge { payload_len: usize, capacity: usize },
}

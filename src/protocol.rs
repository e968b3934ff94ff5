use crate::packet_types::{PacketType, PacketTypeDescriptor};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

/// Sink for fully assembled datagrams. In production this is a thin wrapper around a UDP
///  socket; tests substitute a mock or an in-memory channel.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSink: Send + Sync + 'static {
    async fn send_datagram(&self, datagram: Vec<u8>) -> anyhow::Result<()>;
}

/// The application-facing protocol layer, typically generated: it owns the packet
///  encoding and the handlers, the transport owns reliability and ordering.
///
/// A datagram payload is a concatenation of self-describing packets; the transport never
///  interprets packet bytes beyond asking this trait to split and classify them.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Protocol: Send + Sync + 'static {
    /// The length of the packet at the start of `payload`. An error here discards the rest
    ///  of the datagram (packet boundaries after a broken packet are unknowable).
    fn next_packet_len(&self, payload: &[u8]) -> anyhow::Result<usize>;

    /// Classifies an encoded packet. The connection resolves the descriptor against its
    ///  per-connection type table.
    fn packet_descriptor(&self, packet: &[u8]) -> anyhow::Result<PacketTypeDescriptor>;

    /// Runs the handler for a received packet. Handler errors are reported back to the
    ///  peer via [Protocol::error_reply]; they do not affect delivery bookkeeping.
    async fn handle_packet(&self, packet_type: PacketType, packet: Vec<u8>) -> anyhow::Result<()>;

    /// An optional error-reply packet to send when a handler failed or panicked, `(type,
    ///  encoded packet)`. `None` swallows the error after logging.
    fn error_reply(&self, packet_type: PacketType, error: String) -> Option<(PacketTypeDescriptor, Vec<u8>)>;
}

use crate::wire;
use anyhow::bail;
use std::time::Duration;

/// Tunables of the transport core. The constants here are defaults, not protocol
///  requirements - both peers keep working with differing configurations, at the cost of
///  suboptimal scheduling.
pub struct Config {
    /// The UDP payload size the transport assumes, header included. The transport enforces
    ///  non-fragmentation, so this size must be supported end-to-end on all routes between
    ///  the peers.
    ///
    /// In an ideal world we would discover the MTU, but discovery is unreliable (optional IP
    ///  headers, surprising network hardware on some routes), so the responsibility stays
    ///  with the application. With full Ethernet frames and no optional headers this is
    ///  `1500 - 20 - 8 = 1472` for IPV4.
    pub datagram_capacity: usize,

    /// Delay after which an unacknowledged datagram becomes a resend candidate. Relative to
    ///  time-of-send, not time-of-queue. Configure to roughly 2x RTT.
    pub resend_delay: Duration,

    /// Delay after which pending acknowledgements are flushed in a dedicated (empty-payload)
    ///  datagram if no application traffic carried them earlier.
    pub ack_flush_delay: Duration,

    /// Bandwidth cap, expressed as the virtual time each payload byte 'costs'. 8 ns/byte is
    ///  roughly 125 MB/s.
    pub nanos_per_byte: u64,

    /// Upper bound on how far the bandwidth watermark may fall behind real time, i.e. the
    ///  burst budget accumulated during idle periods.
    pub accumulation_window: Duration,

    /// Priority aging: a queued packet's effective priority is
    ///  `priority * (1 + age_millis * aging_factor_per_milli)`, so with the default of
    ///  0.001 a packet's priority doubles after one second of waiting.
    pub aging_factor_per_milli: f64,

    /// Down-weight applied to the effective priority of a packet that is already embedded
    ///  in an unacknowledged, possibly-still-arriving datagram. Must be in `0.0..1.0`.
    pub in_transit_chance: f64,

    /// Hard cap on received-but-unfinished packets on the receive side. Exceeding it is a
    ///  fatal overload condition for the connection, not a silent drop.
    pub max_outstanding_packets: usize,

    /// Initial number of slots in the sequence pool. Must be a power of two (the pool maps
    ///  wrapping sequence numbers to slots by masking) and doubles on demand.
    pub initial_sequence_slots: usize,
}

impl Config {
    /// Defaults for IPV4 with end-to-end full Ethernet MTU and no optional IP headers.
    pub fn default_ipv4() -> Config {
        Config {
            datagram_capacity: 1472,
            resend_delay: Duration::from_millis(200),
            ack_flush_delay: Duration::from_millis(50),
            nanos_per_byte: 8,
            accumulation_window: Duration::from_millis(10),
            aging_factor_per_milli: 0.001,
            in_transit_chance: 0.9,
            max_outstanding_packets: 4096,
            initial_sequence_slots: 32,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.datagram_capacity <= wire::HEADER_LEN {
            bail!("datagram capacity of {} leaves no room for a payload", self.datagram_capacity);
        }
        if !self.initial_sequence_slots.is_power_of_two() {
            bail!("initial sequence slot count must be a power of two, was {}", self.initial_sequence_slots);
        }
        if !(0.0..1.0).contains(&self.in_transit_chance) {
            bail!("in-transit chance must be in 0.0..1.0, was {}", self.in_transit_chance);
        }
        if self.aging_factor_per_milli < 0.0 {
            bail!("aging factor must not be negative, was {}", self.aging_factor_per_milli);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(Config::default_ipv4().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default_ipv4();
        config.datagram_capacity = 10;
        assert!(config.validate().is_err());

        let mut config = Config::default_ipv4();
        config.initial_sequence_slots = 24;
        assert!(config.validate().is_err());

        let mut config = Config::default_ipv4();
        config.in_transit_chance = 1.0;
        assert!(config.validate().is_err());
    }
}

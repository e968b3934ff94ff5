use crate::ack_tracker::Acknowledgement;
use crate::seq::SequenceNumber;
use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};

/// Wire layout of a datagram, all integers little-endian:
///
/// ```ascii
///  0: hash (u32)            - CRC-32 over (salt, ack.oldest, ack.bitfield, sequence
///                              number, wait field, payload); the salt itself is never
///                              transmitted
///  4: ack.oldest (i32)      - base of the piggy-backed acknowledgement field
///  8: ack.bitfield (u32)    - receive status for ack.oldest .. ack.oldest+31
/// 12: sequence number (i32) - shared by all application packets in this datagram
/// 16: wait field (u32)      - OR of the dependency encodings of all contained packets,
///                              relative to the sequence number
/// 20: payload               - concatenation of self-describing application packets
/// ```
pub const HEADER_LEN: usize = 20;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct DatagramHeader {
    pub hash: u32,
    pub ack: Acknowledgement,
    pub sequence_number: SequenceNumber,
    pub wait_field: u32,
}

impl DatagramHeader {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.hash);
        buf.put_i32_le(self.ack.oldest.to_raw());
        buf.put_u32_le(self.ack.bitfield);
        buf.put_i32_le(self.sequence_number.to_raw());
        buf.put_u32_le(self.wait_field);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<DatagramHeader> {
        if buf.remaining() < HEADER_LEN {
            bail!("datagram of {} bytes is shorter than the header", buf.remaining());
        }
        Ok(DatagramHeader {
            hash: buf.get_u32_le(),
            ack: Acknowledgement {
                oldest: SequenceNumber::from_raw(buf.get_i32_le()),
                bitfield: buf.get_u32_le(),
            },
            sequence_number: SequenceNumber::from_raw(buf.get_i32_le()),
            wait_field: buf.get_u32_le(),
        })
    }
}

/// The integrity hash over everything after the hash field, keyed with the sender's salt.
///  The salt is agreed during the handshake and never appears on the wire itself, so a
///  forged or corrupted datagram fails verification without any cryptographic machinery.
pub fn compute_hash(
    salt: u32,
    ack: Acknowledgement,
    sequence_number: SequenceNumber,
    wait_field: u32,
    payload: &[u8],
) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(&salt.to_le_bytes());
    digest.update(&ack.oldest.to_raw().to_le_bytes());
    digest.update(&ack.bitfield.to_le_bytes());
    digest.update(&sequence_number.to_raw().to_le_bytes());
    digest.update(&wait_field.to_le_bytes());
    digest.update(payload);
    digest.finalize()
}

/// Assembles a complete, hashed datagram.
pub fn encode_datagram(
    salt: u32,
    ack: Acknowledgement,
    sequence_number: SequenceNumber,
    wait_field: u32,
    payload: &[u8],
) -> Vec<u8> {
    let header = DatagramHeader {
        hash: compute_hash(salt, ack, sequence_number, wait_field, payload),
        ack,
        sequence_number,
        wait_field,
    };

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    header.ser(&mut buf);
    buf.put_slice(payload);
    buf.to_vec()
}

/// Parses a datagram and verifies its integrity hash against the peer's salt. Returns the
///  header and the payload slice, or `None` if the datagram is corrupt or forged - the
///  caller logs and discards, it never processes such a datagram further.
pub fn decode_datagram(peer_salt: u32, datagram: &[u8]) -> anyhow::Result<Option<(DatagramHeader, &[u8])>> {
    let mut cursor = datagram;
    let header = DatagramHeader::deser(&mut cursor)?;
    let payload = cursor;

    let expected = compute_hash(peer_salt, header.ack, header.sequence_number, header.wait_field, payload);
    if header.hash != expected {
        return Ok(None);
    }
    Ok(Some((header, payload)))
}

pub fn generate_salt() -> u32 {
    rand::random()
}

/// The handshake frames that establish the per-direction salts. The surrounding connect
///  state machine lives outside the core; the core only defines the fixed formats and
///  their hash validation, since its datagram hashing depends on the salts they carry.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum HandshakeFrame {
    Connect { client_salt: u32 },
    /// `hash = CRC(client_salt, server_salt)` proves the server saw the client's salt
    Challenge { hash: u32, server_salt: u32 },
    /// `hash = CRC(client_salt)` authenticates the rejection to the requesting client
    ConnectionDenied { hash: u32 },
}

const FRAME_CONNECT: u8 = 1;
const FRAME_CHALLENGE: u8 = 2;
const FRAME_DENIED: u8 = 3;

impl HandshakeFrame {
    pub fn challenge(client_salt: u32, server_salt: u32) -> HandshakeFrame {
        HandshakeFrame::Challenge {
            hash: hash_salts(&[client_salt, server_salt]),
            server_salt,
        }
    }

    pub fn connection_denied(client_salt: u32) -> HandshakeFrame {
        HandshakeFrame::ConnectionDenied {
            hash: hash_salts(&[client_salt]),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        match *self {
            HandshakeFrame::Connect { client_salt } => {
                buf.put_u8(FRAME_CONNECT);
                buf.put_u32_le(client_salt);
            }
            HandshakeFrame::Challenge { hash, server_salt } => {
                buf.put_u8(FRAME_CHALLENGE);
                buf.put_u32_le(hash);
                buf.put_u32_le(server_salt);
            }
            HandshakeFrame::ConnectionDenied { hash } => {
                buf.put_u8(FRAME_DENIED);
                buf.put_u32_le(hash);
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<HandshakeFrame> {
        if buf.remaining() < 1 {
            bail!("empty handshake frame");
        }
        let kind = buf.get_u8();
        let frame = match kind {
            FRAME_CONNECT if buf.remaining() >= 4 => HandshakeFrame::Connect {
                client_salt: buf.get_u32_le(),
            },
            FRAME_CHALLENGE if buf.remaining() >= 8 => HandshakeFrame::Challenge {
                hash: buf.get_u32_le(),
                server_salt: buf.get_u32_le(),
            },
            FRAME_DENIED if buf.remaining() >= 4 => HandshakeFrame::ConnectionDenied {
                hash: buf.get_u32_le(),
            },
            _ => bail!("malformed handshake frame of kind {}", kind),
        };
        Ok(frame)
    }

    /// Checks the frame's hash against the client salt the receiver handed out. Frames
    ///  failing this check must be discarded before acting on their payload.
    pub fn validate(&self, client_salt: u32) -> bool {
        match *self {
            HandshakeFrame::Connect { .. } => true,
            HandshakeFrame::Challenge { hash, server_salt } => hash == hash_salts(&[client_salt, server_salt]),
            HandshakeFrame::ConnectionDenied { hash } => hash == hash_salts(&[client_salt]),
        }
    }
}

fn hash_salts(salts: &[u32]) -> u32 {
    let mut digest = CRC32.digest();
    for salt in salts {
        digest.update(&salt.to_le_bytes());
    }
    digest.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[test]
    fn test_datagram_roundtrip() {
        let ack = Acknowledgement {
            oldest: SequenceNumber::from_raw(17),
            bitfield: 0b1011,
        };
        let datagram = encode_datagram(0xdead_beef, ack, SequenceNumber::from_raw(42), 0b110, &[1, 2, 3, 4]);

        let (header, payload) = decode_datagram(0xdead_beef, &datagram).unwrap().expect("hash should verify");
        assert_eq!(header.ack, ack);
        assert_eq!(header.sequence_number, SequenceNumber::from_raw(42));
        assert_eq!(header.wait_field, 0b110);
        assert_eq!(payload, &[1, 2, 3, 4]);
    }

    #[test]
    fn test_reencoding_is_byte_identical() {
        let ack = Acknowledgement {
            oldest: SequenceNumber::from_raw(5),
            bitfield: 1,
        };
        let first = encode_datagram(7, ack, SequenceNumber::from_raw(9), 0, b"payload");
        let second = encode_datagram(7, ack, SequenceNumber::from_raw(9), 0, b"payload");
        assert_eq!(first, second);
    }

    #[rstest]
    #[case::flipped_payload_bit(|d: &mut Vec<u8>| d[HEADER_LEN] ^= 1)]
    #[case::flipped_header_bit(|d: &mut Vec<u8>| d[12] ^= 0x80)]
    #[case::truncated(|d: &mut Vec<u8>| { d.pop(); })]
    fn test_corruption_is_detected(#[case] corrupt: fn(&mut Vec<u8>)) {
        let mut datagram = encode_datagram(3, Acknowledgement::EMPTY, SequenceNumber::ZERO, 0, &[9, 9]);
        corrupt(&mut datagram);
        assert_eq!(decode_datagram(3, &datagram).unwrap(), None);
    }

    #[test]
    fn test_wrong_salt_is_rejected() {
        let datagram = encode_datagram(1, Acknowledgement::EMPTY, SequenceNumber::ZERO, 0, &[]);
        assert!(decode_datagram(1, &datagram).unwrap().is_some());
        assert_eq!(decode_datagram(2, &datagram).unwrap(), None);
    }

    #[test]
    fn test_short_datagram_is_unparseable() {
        assert!(decode_datagram(0, &[1, 2, 3]).is_err());
    }

    #[rstest]
    #[case::connect(HandshakeFrame::Connect { client_salt: 123 })]
    #[case::challenge(HandshakeFrame::challenge(123, 456))]
    #[case::denied(HandshakeFrame::connection_denied(123))]
    fn test_handshake_roundtrip(#[case] frame: HandshakeFrame) {
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);

        let parsed = HandshakeFrame::deser(&mut buf.as_ref()).unwrap();
        assert_eq!(parsed, frame);
        assert!(parsed.validate(123));
    }

    #[rstest]
    #[case::challenge(HandshakeFrame::challenge(123, 456))]
    #[case::denied(HandshakeFrame::connection_denied(123))]
    fn test_handshake_wrong_salt_fails_validation(#[case] frame: HandshakeFrame) {
        assert!(!frame.validate(124));
    }
}

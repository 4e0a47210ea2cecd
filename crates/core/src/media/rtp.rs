use bytes::{Bytes, BytesMut};

use crate::error::{PacketErrorKind, Result, RtspError};

/// Size of the RTP fixed header (RFC 3550 §5.1).
pub const RTP_HEADER_LEN: usize = 12;

/// A relayed RTP packet (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The relay never touches payloads, CSRC lists or header extensions: the
/// packet keeps its wire bytes and only the fields needed for routing are
/// decoded. Cloning is cheap (the bytes are reference counted), which matters
/// because one source packet fans out to every attached session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    /// RTP payload type (7-bit, RFC 3551).
    pub payload_type: u8,
    /// Marker bit, set on the last packet of an access unit.
    pub marker: bool,
    /// 16-bit wrapping sequence number.
    pub sequence: u16,
    /// Media clock timestamp.
    pub timestamp: u32,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    raw: Bytes,
}

impl RtpPacket {
    /// Decode the fixed header of an RTP packet.
    pub fn parse(raw: Bytes) -> Result<Self> {
        if raw.len() < RTP_HEADER_LEN {
            return Err(RtspError::Packet {
                kind: PacketErrorKind::Truncated {
                    required: RTP_HEADER_LEN,
                    available: raw.len(),
                },
            });
        }

        let version = raw[0] >> 6;
        if version != 2 {
            return Err(RtspError::Packet {
                kind: PacketErrorKind::BadVersion(version),
            });
        }

        Ok(Self {
            payload_type: raw[1] & 0x7f,
            marker: raw[1] & 0x80 != 0,
            sequence: u16::from_be_bytes([raw[2], raw[3]]),
            timestamp: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
            ssrc: u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]),
            raw,
        })
    }

    /// Build a packet with a bare fixed header followed by `payload`.
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32, payload: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(RTP_HEADER_LEN + payload.len());
        buf.extend_from_slice(&[2 << 6, payload_type & 0x7f]);
        buf.extend_from_slice(&sequence.to_be_bytes());
        buf.extend_from_slice(&timestamp.to_be_bytes());
        buf.extend_from_slice(&ssrc.to_be_bytes());
        buf.extend_from_slice(payload);

        Self {
            payload_type: payload_type & 0x7f,
            marker: false,
            sequence,
            timestamp,
            ssrc,
            raw: buf.freeze(),
        }
    }

    /// The packet exactly as it was received.
    pub fn as_bytes(&self) -> &Bytes {
        &self.raw
    }

    /// Wire bytes with the SSRC field replaced.
    ///
    /// Used when a source packet leaves on a client leg, which announces its
    /// own SSRC in the SETUP response.
    pub fn with_ssrc(&self, ssrc: u32) -> Bytes {
        if ssrc == self.ssrc {
            return self.raw.clone();
        }
        let mut buf = BytesMut::from(&self.raw[..]);
        buf[8..12].copy_from_slice(&ssrc.to_be_bytes());
        buf.freeze()
    }

    /// Same packet relabelled with another SSRC.
    pub fn relabel(&self, ssrc: u32) -> Self {
        Self {
            ssrc,
            raw: self.with_ssrc(ssrc),
            ..self.clone()
        }
    }
}

/// Whether RTP timestamp `ts` lies before `reference`, honouring 32-bit
/// wraparound (serial number arithmetic, RFC 1982).
pub fn timestamp_precedes(ts: u32, reference: u32) -> bool {
    (ts.wrapping_sub(reference) as i32) < 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_packet() -> RtpPacket {
        RtpPacket::new(96, 7, 3000, 0xAABBCCDD, &[1, 2, 3])
    }

    #[test]
    fn parse_roundtrips_header_fields() {
        let p = make_packet();
        let parsed = RtpPacket::parse(p.as_bytes().clone()).unwrap();
        assert_eq!(parsed.payload_type, 96);
        assert_eq!(parsed.sequence, 7);
        assert_eq!(parsed.timestamp, 3000);
        assert_eq!(parsed.ssrc, 0xAABBCCDD);
        assert_eq!(&parsed.as_bytes()[RTP_HEADER_LEN..], &[1, 2, 3]);
    }

    #[test]
    fn marker_bit() {
        let mut raw = make_packet().as_bytes().to_vec();
        raw[1] |= 0x80;
        let parsed = RtpPacket::parse(Bytes::from(raw)).unwrap();
        assert!(parsed.marker);
        assert_eq!(parsed.payload_type, 96);
    }

    #[test]
    fn truncated_rejected() {
        let err = RtpPacket::parse(Bytes::from_static(&[0x80, 96, 0])).unwrap_err();
        assert!(matches!(
            err,
            RtspError::Packet {
                kind: PacketErrorKind::Truncated { required: 12, available: 3 }
            }
        ));
    }

    #[test]
    fn wrong_version_rejected() {
        let mut raw = make_packet().as_bytes().to_vec();
        raw[0] = 1 << 6;
        assert!(RtpPacket::parse(Bytes::from(raw)).is_err());
    }

    #[test]
    fn ssrc_rewrite_keeps_payload() {
        let p = make_packet();
        let out = p.with_ssrc(0x01020304);
        assert_eq!(&out[8..12], &[1, 2, 3, 4]);
        assert_eq!(&out[..8], &p.as_bytes()[..8]);
        assert_eq!(&out[12..], &[1, 2, 3]);
        // Original untouched
        assert_eq!(p.ssrc, 0xAABBCCDD);
    }

    #[test]
    fn timestamp_ordering_wraps() {
        assert!(timestamp_precedes(100, 200));
        assert!(!timestamp_precedes(200, 200));
        assert!(!timestamp_precedes(300, 200));
        assert!(timestamp_precedes(u32::MAX - 10, 5));
        assert!(!timestamp_precedes(5, u32::MAX - 10));
    }
}

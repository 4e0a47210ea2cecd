//! RTCP sender reports and goodbyes (RFC 3550 §6.4.1, §6.6).
//!
//! Only the two packet types the relay acts on are decoded; everything else
//! in a compound packet is carried through as [`RtcpPacket::Other`].

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{PacketErrorKind, Result, RtspError};

pub const PT_SENDER_REPORT: u8 = 200;
pub const PT_GOODBYE: u8 = 203;

const HEADER_LEN: usize = 4;
const SENDER_INFO_LEN: usize = 20;
const REPORT_BLOCK_LEN: usize = 24;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// One reception report block carried in a sender report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportBlock {
    pub ssrc: u32,
    pub fraction_lost: u8,
    /// 24-bit cumulative loss.
    pub cumulative_lost: u32,
    pub highest_sequence: u32,
    pub jitter: u32,
    pub last_sr: u32,
    pub delay_since_last_sr: u32,
}

/// RTCP Sender Report (PT=200).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SenderReport {
    /// SSRC of the sender issuing the report.
    pub ssrc: u32,
    /// 64-bit NTP wall-clock timestamp.
    pub ntp_timestamp: u64,
    /// RTP timestamp corresponding to `ntp_timestamp`.
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
    pub blocks: Vec<ReportBlock>,
}

impl SenderReport {
    pub fn serialize(&self) -> Bytes {
        let count = self.blocks.len().min(31);
        let body_len = 4 + SENDER_INFO_LEN + count * REPORT_BLOCK_LEN;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + body_len);

        buf.put_u8((2 << 6) | count as u8);
        buf.put_u8(PT_SENDER_REPORT);
        buf.put_u16((body_len / 4) as u16);
        buf.put_u32(self.ssrc);
        buf.put_u64(self.ntp_timestamp);
        buf.put_u32(self.rtp_timestamp);
        buf.put_u32(self.packet_count);
        buf.put_u32(self.octet_count);

        for block in &self.blocks[..count] {
            buf.put_u32(block.ssrc);
            buf.put_u8(block.fraction_lost);
            let lost = block.cumulative_lost & 0x00ff_ffff;
            buf.put_slice(&lost.to_be_bytes()[1..]);
            buf.put_u32(block.highest_sequence);
            buf.put_u32(block.jitter);
            buf.put_u32(block.last_sr);
            buf.put_u32(block.delay_since_last_sr);
        }

        buf.freeze()
    }

    fn parse_body(count: u8, mut body: &[u8]) -> Result<Self> {
        ensure(body.len(), 4 + SENDER_INFO_LEN)?;
        let ssrc = body.get_u32();
        let ntp_timestamp = body.get_u64();
        let rtp_timestamp = body.get_u32();
        let packet_count = body.get_u32();
        let octet_count = body.get_u32();

        let mut blocks = Vec::with_capacity(count as usize);
        for _ in 0..count {
            ensure(body.len(), REPORT_BLOCK_LEN)?;
            let ssrc = body.get_u32();
            let fraction_lost = body.get_u8();
            let lost = [0, body.get_u8(), body.get_u8(), body.get_u8()];
            blocks.push(ReportBlock {
                ssrc,
                fraction_lost,
                cumulative_lost: u32::from_be_bytes(lost),
                highest_sequence: body.get_u32(),
                jitter: body.get_u32(),
                last_sr: body.get_u32(),
                delay_since_last_sr: body.get_u32(),
            });
        }

        Ok(Self {
            ssrc,
            ntp_timestamp,
            rtp_timestamp,
            packet_count,
            octet_count,
            blocks,
        })
    }
}

/// RTCP Goodbye (PT=203).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Goodbye {
    pub sources: Vec<u32>,
    pub reason: Option<String>,
}

impl Goodbye {
    pub fn for_source(ssrc: u32) -> Self {
        Self {
            sources: vec![ssrc],
            reason: None,
        }
    }

    pub fn serialize(&self) -> Bytes {
        let count = self.sources.len().min(31);
        let reason = self.reason.as_deref().map(|r| &r.as_bytes()[..r.len().min(255)]);
        let reason_len = reason.map_or(0, |r| 1 + r.len());
        let padding = (4 - reason_len % 4) % 4;
        let body_len = count * 4 + reason_len + padding;

        let mut buf = BytesMut::with_capacity(HEADER_LEN + body_len);
        buf.put_u8((2 << 6) | count as u8);
        buf.put_u8(PT_GOODBYE);
        buf.put_u16((body_len / 4) as u16);
        for ssrc in &self.sources[..count] {
            buf.put_u32(*ssrc);
        }
        if let Some(reason) = reason {
            buf.put_u8(reason.len() as u8);
            buf.put_slice(reason);
            buf.put_bytes(0, padding);
        }
        buf.freeze()
    }

    fn parse_body(count: u8, mut body: &[u8]) -> Result<Self> {
        ensure(body.len(), count as usize * 4)?;
        let sources = (0..count).map(|_| body.get_u32()).collect();

        let reason = if body.has_remaining() {
            let len = body.get_u8() as usize;
            ensure(body.len(), len)?;
            Some(String::from_utf8_lossy(&body[..len]).into_owned())
        } else {
            None
        };

        Ok(Self { sources, reason })
    }
}

/// One packet out of an RTCP compound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport(SenderReport),
    Goodbye(Goodbye),
    /// Any other packet type, kept verbatim.
    Other { packet_type: u8, raw: Bytes },
}

impl RtcpPacket {
    pub fn packet_type(&self) -> u8 {
        match self {
            Self::SenderReport(_) => PT_SENDER_REPORT,
            Self::Goodbye(_) => PT_GOODBYE,
            Self::Other { packet_type, .. } => *packet_type,
        }
    }

    pub fn serialize(&self) -> Bytes {
        match self {
            Self::SenderReport(sr) => sr.serialize(),
            Self::Goodbye(bye) => bye.serialize(),
            Self::Other { raw, .. } => raw.clone(),
        }
    }

    /// Split and decode an RTCP compound packet.
    pub fn parse_compound(data: &[u8]) -> Result<Vec<RtcpPacket>> {
        let mut packets = Vec::new();
        let mut rest = data;

        while !rest.is_empty() {
            ensure(rest.len(), HEADER_LEN)?;
            let version = rest[0] >> 6;
            if version != 2 {
                return Err(RtspError::Packet {
                    kind: PacketErrorKind::BadVersion(version),
                });
            }
            let count = rest[0] & 0x1f;
            let packet_type = rest[1];
            let len = (u16::from_be_bytes([rest[2], rest[3]]) as usize + 1) * 4;
            ensure(rest.len(), len)?;

            let (packet, tail) = rest.split_at(len);
            let body = &packet[HEADER_LEN..];
            packets.push(match packet_type {
                PT_SENDER_REPORT => Self::SenderReport(SenderReport::parse_body(count, body)?),
                PT_GOODBYE => Self::Goodbye(Goodbye::parse_body(count, body)?),
                _ => Self::Other {
                    packet_type,
                    raw: Bytes::copy_from_slice(packet),
                },
            });
            rest = tail;
        }

        Ok(packets)
    }
}

fn ensure(available: usize, required: usize) -> Result<()> {
    if available < required {
        return Err(RtspError::Packet {
            kind: PacketErrorKind::Truncated {
                required,
                available,
            },
        });
    }
    Ok(())
}

/// Current wall clock as a 64-bit NTP timestamp (RFC 5905 §6).
pub fn ntp_now() -> u64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = since_epoch.as_secs() + NTP_UNIX_OFFSET;
    let frac = ((since_epoch.subsec_nanos() as u64) << 32) / 1_000_000_000;
    (secs << 32) | frac
}

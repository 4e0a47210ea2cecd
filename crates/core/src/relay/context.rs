use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::media::rtcp::ntp_now;
use crate::media::{RtpPacket, SenderReport};
use crate::transport::tcp::ControlChannel;
use crate::transport::udp::UdpPair;

/// How a session's legs reach the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// RTP/RTCP over a dedicated UDP port pair per leg.
    Udp,
    /// RTP/RTCP framed with `$` on the RTSP TCP connection (RFC 2326 §10.12).
    Interleaved,
}

/// Reference point pairing wall-clock and media-clock time, as carried in a
/// sender report. `ntp_timestamp == 0` means no report has been seen yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClockState {
    pub ntp_timestamp: u64,
    pub rtp_timestamp: u32,
}

impl ClockState {
    pub fn is_known(&self) -> bool {
        self.ntp_timestamp != 0
    }
}

/// Where a leg's bytes go.
pub enum LegSink {
    Udp(UdpLeg),
    Interleaved(ControlChannel),
}

/// Server socket pair plus the client's receive addresses.
pub struct UdpLeg {
    pub pair: UdpPair,
    pub client_rtp: SocketAddr,
    pub client_rtcp: SocketAddr,
}

/// One negotiated outbound media leg.
///
/// Addressed by the client-side SSRC; every forwarded packet is relabelled
/// with it. The clock is copied from the source at SETUP and refreshed from
/// the source's sender reports.
pub struct TransportContext {
    ssrc: u32,
    source_ssrc: u32,
    channels: (u8, u8),
    media_type: String,
    clock: Mutex<ClockState>,
    packets_sent: AtomicU32,
    octets_sent: AtomicU32,
    last_timestamp: AtomicU32,
    sink: LegSink,
}

impl TransportContext {
    pub fn new(
        ssrc: u32,
        source_ssrc: u32,
        channels: (u8, u8),
        media_type: &str,
        clock: ClockState,
        sink: LegSink,
    ) -> Self {
        Self {
            ssrc,
            source_ssrc,
            channels,
            media_type: media_type.to_string(),
            clock: Mutex::new(clock),
            packets_sent: AtomicU32::new(0),
            octets_sent: AtomicU32::new(0),
            last_timestamp: AtomicU32::new(clock.rtp_timestamp),
            sink,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn source_ssrc(&self) -> u32 {
        self.source_ssrc
    }

    pub fn channels(&self) -> (u8, u8) {
        self.channels
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn mode(&self) -> TransportMode {
        match self.sink {
            LegSink::Udp(_) => TransportMode::Udp,
            LegSink::Interleaved(_) => TransportMode::Interleaved,
        }
    }

    /// Local RTP/RTCP ports for UDP legs.
    pub fn server_ports(&self) -> Option<(u16, u16)> {
        match &self.sink {
            LegSink::Udp(leg) => Some(leg.pair.ports()),
            LegSink::Interleaved(_) => None,
        }
    }

    pub fn client_ports(&self) -> Option<(u16, u16)> {
        match &self.sink {
            LegSink::Udp(leg) => Some((leg.client_rtp.port(), leg.client_rtcp.port())),
            LegSink::Interleaved(_) => None,
        }
    }

    pub fn clock(&self) -> ClockState {
        *self.clock.lock()
    }

    pub fn set_clock(&self, ntp_timestamp: u64, rtp_timestamp: u32) {
        *self.clock.lock() = ClockState {
            ntp_timestamp,
            rtp_timestamp,
        };
    }

    pub fn packets_sent(&self) -> u32 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    /// Write one RTP packet, relabelled with this leg's SSRC.
    pub fn send_rtp(&self, packet: &RtpPacket) -> io::Result<()> {
        let bytes = packet.with_ssrc(self.ssrc);
        match &self.sink {
            LegSink::Udp(leg) => {
                leg.pair.rtp.send_to(&bytes, leg.client_rtp)?;
            }
            LegSink::Interleaved(control) => control.send_interleaved(self.channels.0, &bytes)?,
        }
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        let payload = bytes.len().saturating_sub(crate::media::rtp::RTP_HEADER_LEN);
        self.octets_sent.fetch_add(payload as u32, Ordering::Relaxed);
        self.last_timestamp.store(packet.timestamp, Ordering::Relaxed);
        Ok(())
    }

    pub fn send_rtcp(&self, bytes: &Bytes) -> io::Result<()> {
        match &self.sink {
            LegSink::Udp(leg) => send_datagram(&leg.pair.rtcp, bytes, leg.client_rtcp),
            LegSink::Interleaved(control) => control.send_interleaved(self.channels.1, bytes),
        }
    }

    /// Sender report describing this leg, anchored on the copied source clock
    /// when one is known.
    pub fn sender_report(&self) -> SenderReport {
        let clock = self.clock();
        let (ntp_timestamp, rtp_timestamp) = if clock.is_known() {
            (clock.ntp_timestamp, clock.rtp_timestamp)
        } else {
            (ntp_now(), self.last_timestamp.load(Ordering::Relaxed))
        };
        SenderReport {
            ssrc: self.ssrc,
            ntp_timestamp,
            rtp_timestamp,
            packet_count: self.packets_sent.load(Ordering::Relaxed),
            octet_count: self.octets_sent.load(Ordering::Relaxed),
            blocks: Vec::new(),
        }
    }
}

fn send_datagram(socket: &UdpSocket, bytes: &[u8], addr: SocketAddr) -> io::Result<()> {
    socket.send_to(bytes, addr).map(|_| ())
}

impl std::fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportContext")
            .field("ssrc", &format_args!("{:#010X}", self.ssrc))
            .field("source_ssrc", &format_args!("{:#010X}", self.source_ssrc))
            .field("channels", &self.channels)
            .field("media_type", &self.media_type)
            .field("mode", &self.mode())
            .finish()
    }
}

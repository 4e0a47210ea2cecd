use crate::error::{Result, RtspError};
use crate::media::{RtcpPacket, RtpPacket, SenderReport};
use crate::session::SessionMedia;
use crate::source::SourceObserver;

/// Forwarding from attached sources into this session's relay.
///
/// Runs on the source's delivery thread. A failure only costs the packet or
/// report that caused it.
impl SourceObserver for SessionMedia {
    fn on_rtp(&self, packet: &RtpPacket) {
        let disposition = self.buffer.route(packet, |p| match self.routes.get(p.ssrc) {
            Some(client_ssrc) => match self.relay.enqueue_rtp(client_ssrc, p) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(
                        source_ssrc = format_args!("{:#010X}", p.ssrc),
                        error = %e,
                        "dropping RTP packet"
                    );
                    false
                }
            },
            None => false,
        });
        tracing::trace!(
            source_ssrc = format_args!("{:#010X}", packet.ssrc),
            seq = packet.sequence,
            ?disposition,
            "rtp"
        );
    }

    fn on_rtcp(&self, packet: &RtcpPacket) {
        let result = match packet {
            RtcpPacket::Goodbye(bye) => self.forward_goodbye(&bye.sources),
            RtcpPacket::SenderReport(sr) => self.copy_clock(sr),
            RtcpPacket::Other { .. } => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!(
                packet_type = packet.packet_type(),
                error = %e,
                "dropping RTCP packet"
            );
        }
    }
}

impl SessionMedia {
    /// One BYE per routed source SSRC, on the leg it maps to.
    fn forward_goodbye(&self, sources: &[u32]) -> Result<()> {
        for &source_ssrc in sources {
            if let Some(client_ssrc) = self.routes.get(source_ssrc) {
                self.relay.enqueue_goodbye(client_ssrc)?;
                tracing::debug!(
                    source_ssrc = format_args!("{:#010X}", source_ssrc),
                    ssrc = format_args!("{:#010X}", client_ssrc),
                    "forwarded goodbye"
                );
            }
        }
        Ok(())
    }

    /// Copy the report's clock onto every routed leg it mentions.
    fn copy_clock(&self, sr: &SenderReport) -> Result<()> {
        let mut mentioned = vec![sr.ssrc];
        for block in &sr.blocks {
            if !mentioned.contains(&block.ssrc) {
                mentioned.push(block.ssrc);
            }
        }
        for source_ssrc in mentioned {
            let Some(client_ssrc) = self.routes.get(source_ssrc) else {
                continue;
            };
            let leg = self
                .relay
                .leg(client_ssrc)
                .ok_or(RtspError::LegNotFound(client_ssrc))?;
            leg.set_clock(sr.ntp_timestamp, sr.rtp_timestamp);
        }
        Ok(())
    }
}

use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::{Result, RtspError};
use crate::relay::{LegSink, TransportContext, TransportMode, UdpLeg};
use crate::session::{ClientSession, SessionSources};
use crate::source::SourceTrack;

/// Requested delivery for one leg, from the client's `Transport` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Udp { client_rtp: u16, client_rtcp: u16 },
    Interleaved { rtp_channel: u8, rtcp_channel: u8 },
}

/// Why a `Transport` header was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRejection {
    /// 400: not RTP, no port/channel pair, unparsable numbers, or UDP asked
    /// for on a TCP-only source.
    BadRequest,
    /// 461: a pair that is not exactly two values.
    Unsupported,
}

/// Parsed client-side `Transport` header (RFC 2326 §12.39).
///
/// ## Wire format examples
///
/// ```text
/// RTP/AVP;unicast;client_port=8000-8001
/// RTP/AVP/TCP;unicast;interleaved=0-1
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHeader {
    /// Transport/profile with any lower-transport suffix removed
    /// (`RTP/AVP/TCP` → `RTP/AVP`).
    pub profile: String,
    pub delivery: Delivery,
}

impl TransportHeader {
    /// Parse the first transport spec in `header`. `client_port=` wins when
    /// both a port pair and a channel pair are present.
    ///
    /// ## Examples
    ///
    /// ```
    /// use rtsp::session::transport::{Delivery, TransportHeader, TransportRejection};
    ///
    /// let th = TransportHeader::parse("RTP/AVP;unicast;client_port=8000-8001", false).unwrap();
    /// assert_eq!(th.delivery, Delivery::Udp { client_rtp: 8000, client_rtcp: 8001 });
    ///
    /// let err = TransportHeader::parse("RTP/AVP;unicast", false).unwrap_err();
    /// assert_eq!(err, TransportRejection::BadRequest);
    /// ```
    pub fn parse(header: &str, force_tcp: bool) -> std::result::Result<Self, TransportRejection> {
        let spec = header.split(',').next().unwrap_or("").trim();
        if !spec.contains("RTP") {
            return Err(TransportRejection::BadRequest);
        }

        let mut params = spec.split(';').map(str::trim);
        let protocol = params.next().unwrap_or("");
        let profile = protocol
            .strip_suffix("/TCP")
            .or_else(|| protocol.strip_suffix("/UDP"))
            .unwrap_or(protocol)
            .to_string();

        let mut client_port = None;
        let mut interleaved = None;
        for param in params {
            if let Some(v) = param.strip_prefix("client_port=") {
                client_port = Some(v);
            } else if let Some(v) = param.strip_prefix("interleaved=") {
                interleaved = Some(v);
            }
        }

        let delivery = match (client_port, interleaved) {
            (Some(_), _) if force_tcp => return Err(TransportRejection::BadRequest),
            (Some(ports), _) => {
                let (rtp, rtcp) = pair(ports)?;
                Delivery::Udp {
                    client_rtp: number(rtp)?,
                    client_rtcp: number(rtcp)?,
                }
            }
            (None, Some(channels)) => {
                let (rtp, rtcp) = pair(channels)?;
                Delivery::Interleaved {
                    rtp_channel: number(rtp)?,
                    rtcp_channel: number(rtcp)?,
                }
            }
            (None, None) => return Err(TransportRejection::BadRequest),
        };

        Ok(Self { profile, delivery })
    }
}

fn pair(value: &str) -> std::result::Result<(&str, &str), TransportRejection> {
    let mut parts = value.split('-');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(b), None) => Ok((a.trim(), b.trim())),
        _ => Err(TransportRejection::Unsupported),
    }
}

fn number<T: std::str::FromStr>(value: &str) -> std::result::Result<T, TransportRejection> {
    value.parse().map_err(|_| TransportRejection::BadRequest)
}

/// `Transport` value answered for a negotiated leg.
pub fn response_header(profile: &str, leg: &TransportContext, source_addr: &str) -> String {
    match (leg.client_ports(), leg.server_ports()) {
        (Some((c1, c2)), Some((s1, s2))) => format!(
            "{profile}/UDP;unicast;client_port={c1}-{c2};server_port={s1}-{s2};source={source_addr};ssrc={:08X}",
            leg.ssrc()
        ),
        _ => {
            let (a, b) = leg.channels();
            format!(
                "{profile}/TCP;unicast;interleaved={a}-{b};ssrc={:08X}",
                leg.ssrc()
            )
        }
    }
}

impl ClientSession {
    /// Build and register the leg for `track`.
    ///
    /// The channel pair and UDP port pair are reserved before anything else
    /// changes, so exhaustion of either leaves the session exactly as it was.
    pub(crate) fn negotiate(
        &self,
        sources: &mut SessionSources,
        delivery: Delivery,
        track: &Arc<SourceTrack>,
    ) -> Result<Arc<TransportContext>> {
        let relay = &self.media.relay;
        let replaced = self.media.routes.get(track.ssrc());
        let following = match replaced {
            Some(ssrc) => relay.next_channels_replacing(ssrc),
            None => relay.next_channels(),
        };
        let stacked = relay.legs().iter().any(|l| Some(l.ssrc()) != replaced);

        let (channels, sink) = match delivery {
            Delivery::Udp {
                client_rtp,
                client_rtcp,
            } => {
                let switching = relay.mode() == Some(TransportMode::Interleaved);
                let channels = match following {
                    _ if switching => (0, 1),
                    Some(channels) => channels,
                    None => return Err(RtspError::ChannelsExhausted),
                };
                let pair = self.services.ports.allocate(self.local_addr.ip())?;
                self.release_track(sources, track.ssrc());
                if switching {
                    self.switchover(sources, TransportMode::Udp);
                }
                let ip = self.remote_addr.ip();
                let sink = LegSink::Udp(UdpLeg {
                    pair,
                    client_rtp: SocketAddr::new(ip, client_rtp),
                    client_rtcp: SocketAddr::new(ip, client_rtcp),
                });
                (channels, sink)
            }
            Delivery::Interleaved {
                rtp_channel,
                rtcp_channel,
            } => {
                let requested = (rtp_channel, rtcp_channel);
                let mode = relay.mode();
                let channels = match mode {
                    Some(TransportMode::Interleaved) if stacked => {
                        following.ok_or(RtspError::ChannelsExhausted)?
                    }
                    _ => requested,
                };
                self.release_track(sources, track.ssrc());
                if mode == Some(TransportMode::Udp) {
                    self.switchover(sources, TransportMode::Interleaved);
                }
                (channels, LegSink::Interleaved(self.control.clone()))
            }
        };

        let leg = Arc::new(TransportContext::new(
            self.fresh_ssrc(),
            track.ssrc(),
            channels,
            track.media_type(),
            track.clock(),
            sink,
        ));

        relay.add_leg(leg.clone());
        self.media.routes.insert(track.ssrc(), leg.ssrc());
        sources.contexts.insert(track.ssrc(), track.clone());

        tracing::debug!(
            session_id = ?self.session_id(),
            source_ssrc = format_args!("{:#010X}", track.ssrc()),
            ssrc = format_args!("{:#010X}", leg.ssrc()),
            mode = ?leg.mode(),
            channels = ?leg.channels(),
            "leg negotiated"
        );
        Ok(leg)
    }

    /// Drop every leg, queued send, route, buffered packet and source
    /// context, and continue in `mode`.
    fn switchover(&self, sources: &mut SessionSources, mode: TransportMode) {
        tracing::info!(
            session_id = ?self.session_id(),
            ?mode,
            legs = self.media.relay.legs().len(),
            "transport switchover"
        );
        self.media.relay.switch_to(mode);
        self.media.routes.clear();
        self.media.buffer.clear();
        sources.contexts.clear();
    }

    /// Random client SSRC not used by any current leg.
    fn fresh_ssrc(&self) -> u32 {
        loop {
            let ssrc = rand::random::<u32>();
            if ssrc != 0 && self.media.relay.leg(ssrc).is_none() {
                return ssrc;
            }
        }
    }
}

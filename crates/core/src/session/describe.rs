//! Per-session copy of a source's session description.
//!
//! The source's SDP is kept line for line except for:
//!
//! | Line | Becomes |
//! |------|---------|
//! | `o=` | this server, a fresh session id/version, the session's address |
//! | `s=` | configured session name |
//! | `c=` | removed everywhere; one session-level line with the session's address |
//! | `a=control` | `rtsp://<host>/live/<source>` (session), `.../<media type>` (media) |
//! | `b=RS`, `b=RR` | policy values for media sections |

use crate::protocol::sdp::{MediaDescription, SdpLine, SessionDescription};
use crate::source::LIVE_PREFIX;

/// RTCP bandwidth lines written into each media section (RFC 3556).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpBandwidth {
    /// `b=RS:<sender>` and `b=RR:<receiver>`.
    Limits { sender: u32, receiver: u32 },
    /// No `b=RS`/`b=RR` lines at all.
    Omit,
}

#[derive(Debug, Clone)]
pub struct RewriteParams<'a> {
    pub server_name: &'a str,
    pub session_name: &'a str,
    /// Address advertised in `o=` and `c=`.
    pub address: &'a str,
    /// `rtsp://host[:port]` the client reached us on.
    pub base_url: &'a str,
    pub source_id: &'a str,
    /// Appended to the `c=` address when delivery may use UDP.
    pub probe_port: Option<u16>,
    pub bandwidth: RtcpBandwidth,
    /// The RTSP session id, used as both id and version in `o=`.
    pub origin_id: &'a str,
}

pub fn source_url(base_url: &str, source_id: &str) -> String {
    format!("{}/{}/{}", base_url.trim_end_matches('/'), LIVE_PREFIX, source_id)
}

pub fn track_url(base_url: &str, source_id: &str, media_type: &str) -> String {
    format!("{}/{}", source_url(base_url, source_id), media_type)
}

fn address_type(address: &str) -> &'static str {
    if address.contains(':') { "IP6" } else { "IP4" }
}

pub fn rewrite(source: &SessionDescription, params: &RewriteParams<'_>) -> SessionDescription {
    let addr_type = address_type(params.address);
    let origin = format!(
        "{} {} {} IN {} {}",
        params.server_name, params.origin_id, params.origin_id, addr_type, params.address
    );
    let connection = match params.probe_port {
        Some(port) => format!("IN {} {}/{}", addr_type, params.address, port),
        None => format!("IN {} {}", addr_type, params.address),
    };
    let session_control = format!("control:{}", source_url(params.base_url, params.source_id));

    let mut session = Vec::with_capacity(source.session.len() + 2);
    let mut connection_at = None;
    let mut control_written = false;
    for line in &source.session {
        match line.kind {
            'o' => session.push(SdpLine::new('o', origin.as_str())),
            's' => session.push(SdpLine::new('s', params.session_name)),
            'c' => {
                connection_at.get_or_insert(session.len());
            }
            'a' if line.is_attribute("control") => {
                if !control_written {
                    session.push(SdpLine::new('a', session_control.as_str()));
                    control_written = true;
                }
            }
            _ => session.push(line.clone()),
        }
    }
    if !control_written {
        session.push(SdpLine::new('a', session_control));
    }
    // c= goes before b=/t= when the source had none.
    let connection_at = connection_at.unwrap_or_else(|| {
        session
            .iter()
            .position(|l| matches!(l.kind, 'b' | 't' | 'r' | 'z' | 'k' | 'a' | 'm'))
            .unwrap_or(session.len())
    });
    session.insert(connection_at, SdpLine::new('c', connection));

    let media = source
        .media
        .iter()
        .map(|m| rewrite_media(m, params))
        .collect();

    SessionDescription { session, media }
}

fn is_rtcp_bandwidth(line: &SdpLine) -> bool {
    line.kind == 'b' && (line.value.starts_with("RS:") || line.value.starts_with("RR:"))
}

fn rewrite_media(media: &MediaDescription, params: &RewriteParams<'_>) -> MediaDescription {
    let control = format!(
        "control:{}",
        track_url(params.base_url, params.source_id, media.media_type())
    );

    let mut lines = Vec::with_capacity(media.lines.len() + 2);
    let mut control_written = false;
    for line in &media.lines {
        if line.kind == 'c' || is_rtcp_bandwidth(line) {
            continue;
        }
        if line.is_attribute("control") {
            if !control_written {
                lines.push(SdpLine::new('a', control.as_str()));
                control_written = true;
            }
            continue;
        }
        lines.push(line.clone());
    }
    if !control_written {
        lines.push(SdpLine::new('a', control));
    }

    if let RtcpBandwidth::Limits { sender, receiver } = params.bandwidth {
        // After m=, i= and any remaining b= lines.
        let at = 1 + lines
            .iter()
            .skip(1)
            .take_while(|l| matches!(l.kind, 'i' | 'b'))
            .count();
        let at = at.min(lines.len());
        lines.insert(at, SdpLine::new('b', format!("RR:{receiver}")));
        lines.insert(at, SdpLine::new('b', format!("RS:{sender}")));
    }

    MediaDescription { lines }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE_SDP: &str = "v=0\r\n\
        o=- 1 1 IN IP4 10.0.0.5\r\n\
        s=Camera\r\n\
        c=IN IP4 10.0.0.5\r\n\
        t=0 0\r\n\
        a=control:*\r\n\
        a=control:rtsp://10.0.0.5/extra\r\n\
        m=video 0 RTP/AVP 96\r\n\
        c=IN IP4 10.0.0.5\r\n\
        b=AS:500\r\n\
        b=RS:800\r\n\
        b=RR:2400\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=control:trackID=1\r\n\
        m=audio 0 RTP/AVP 97\r\n\
        a=rtpmap:97 MPEG4-GENERIC/48000/2\r\n";

    fn params(bandwidth: RtcpBandwidth, probe_port: Option<u16>) -> RewriteParams<'static> {
        RewriteParams {
            server_name: "rtsp-relay",
            session_name: "Relay",
            address: "192.168.1.10",
            base_url: "rtsp://192.168.1.10:8554",
            source_id: "cam",
            probe_port,
            bandwidth,
            origin_id: "EE806FE5D14E9D3A",
        }
    }

    fn udp_params() -> RewriteParams<'static> {
        params(
            RtcpBandwidth::Limits {
                sender: 96,
                receiver: 96,
            },
            Some(10_000),
        )
    }

    fn controls(lines: &[SdpLine]) -> Vec<&str> {
        lines
            .iter()
            .filter_map(|l| l.attribute_value("control"))
            .collect()
    }

    #[test]
    fn session_section_rewritten() {
        let source = SessionDescription::parse(SOURCE_SDP).unwrap();
        let out = rewrite(&source, &udp_params());
        let text = out.to_string();

        assert!(text.starts_with("v=0\r\no=rtsp-relay EE806FE5D14E9D3A EE806FE5D14E9D3A IN IP4 192.168.1.10\r\ns=Relay\r\nc=IN IP4 192.168.1.10/10000\r\nt=0 0\r\n"));
        assert_eq!(
            controls(&out.session),
            vec!["rtsp://192.168.1.10:8554/live/cam"]
        );
        assert_eq!(out.session.iter().filter(|l| l.kind == 'c').count(), 1);
    }

    #[test]
    fn media_sections_rewritten() {
        let source = SessionDescription::parse(SOURCE_SDP).unwrap();
        let out = rewrite(&source, &udp_params());

        let video = &out.media[0];
        assert_eq!(
            controls(&video.lines),
            vec!["rtsp://192.168.1.10:8554/live/cam/video"]
        );
        assert!(video.lines.iter().all(|l| l.kind != 'c'));
        let bw: Vec<String> = video
            .lines
            .iter()
            .filter(|l| l.kind == 'b')
            .map(|l| l.value.clone())
            .collect();
        assert_eq!(bw, vec!["AS:500", "RS:96", "RR:96"]);
        assert_eq!(video.lines[4].value, "rtpmap:96 H264/90000");

        // Missing control is appended.
        let audio = &out.media[1];
        assert_eq!(
            audio.lines.last().unwrap().value,
            "control:rtsp://192.168.1.10:8554/live/cam/audio"
        );
        assert_eq!(audio.lines[1].value, "RS:96");
    }

    #[test]
    fn forced_tcp_bandwidth_policies() {
        let source = SessionDescription::parse(SOURCE_SDP).unwrap();

        let zero = rewrite(
            &source,
            &params(
                RtcpBandwidth::Limits {
                    sender: 0,
                    receiver: 0,
                },
                None,
            ),
        );
        let text = zero.to_string();
        assert!(text.contains("c=IN IP4 192.168.1.10\r\n"));
        assert!(text.contains("b=RS:0\r\nb=RR:0\r\n"));

        let omitted = rewrite(&source, &params(RtcpBandwidth::Omit, None));
        let text = omitted.to_string();
        assert!(!text.contains("b=RS"));
        assert!(!text.contains("b=RR"));
        assert!(text.contains("b=AS:500\r\n"));
    }

    #[test]
    fn rewriting_twice_is_stable() {
        let source = SessionDescription::parse(SOURCE_SDP).unwrap();
        let once = rewrite(&source, &udp_params());
        let twice = rewrite(&once, &udp_params());
        assert_eq!(once, twice);
        assert_eq!(twice.media.len(), 2);
    }

    #[test]
    fn ipv6_address() {
        let source = SessionDescription::parse(SOURCE_SDP).unwrap();
        let mut p = params(RtcpBandwidth::Omit, None);
        p.address = "::1";
        let text = rewrite(&source, &p).to_string();
        assert!(text.contains("c=IN IP6 ::1\r\n"));
        assert!(text.contains("IN IP6 ::1\r\ns=Relay"));
    }
}

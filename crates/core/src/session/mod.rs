//! Per-client RTSP session engine (RFC 2326 §3, §A.1).
//!
//! One [`ClientSession`] exists per accepted RTSP connection. It owns the
//! session's routing state and drives it through the protocol state machine:
//!
//! ```text
//! DESCRIBE      -> Described   (id assigned, SDP rewritten)
//! SETUP         -> Ready       (leg + route per track)
//! PLAY          -> Playing     (relay connected, buffer flushed, source attached)
//! PAUSE         -> Paused      (track SSRCs held in the packet buffer)
//! PLAY          -> Playing     (from Paused)
//! TEARDOWN      -> TornDown    (once no attached source remains)
//! TCP disconnect -> TornDown   (always)
//! ```
//!
//! Media reaches the session through [`SessionMedia`], which is attached to
//! each played source as a [`SourceObserver`](crate::source::SourceObserver)
//! (see [`dispatch`]).

pub mod describe;
pub mod directory;
mod dispatch;
pub mod transport;

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::error::{Result, RtspError};
use crate::media::rtp::timestamp_precedes;
use crate::protocol::range::PlayRange;
use crate::protocol::request::{Method, RtspRequest};
use crate::protocol::response::{RtspResponse, StatusCode};
use crate::protocol::sdp;
use crate::relay::{OutboundRelay, PacketBuffer, RouteTable, TransportContext, TransportMode};
use crate::server::ServerConfig;
use crate::source::{SourceRegistry, SourceStream, SourceTrack};
use crate::transport::{ControlChannel, PortAllocator};

use describe::{RewriteParams, RtcpBandwidth};
pub use directory::SessionDirectory;
use transport::{TransportHeader, TransportRejection};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connection accepted, nothing negotiated.
    Init,
    /// A description has been served.
    Described,
    /// At least one leg is set up.
    Ready,
    /// Media is being delivered.
    Playing,
    /// Delivery suspended; packets are held in the buffer.
    Paused,
    /// Retired from the directory or disconnected.
    TornDown,
}

/// Server-wide collaborators every session needs.
#[derive(Clone)]
pub struct SessionServices {
    pub config: Arc<ServerConfig>,
    pub sources: SourceRegistry,
    pub directory: SessionDirectory,
    pub ports: PortAllocator,
}

/// The part of a session the source delivery threads touch.
pub(crate) struct SessionMedia {
    routes: RouteTable,
    buffer: PacketBuffer,
    relay: OutboundRelay,
}

/// Source-side bookkeeping, guarded together.
#[derive(Default)]
pub(crate) struct SessionSources {
    /// Source tracks this session has legs for, by source SSRC.
    contexts: HashMap<u32, Arc<SourceTrack>>,
    /// Sources this session is subscribed to, by source id.
    attached: HashMap<String, Arc<SourceStream>>,
}

/// One client's RTSP session.
pub struct ClientSession {
    connection_id: u64,
    session_id: RwLock<Option<String>>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    services: SessionServices,
    control: ControlChannel,
    media: Arc<SessionMedia>,
    sources: Mutex<SessionSources>,
    state: Mutex<SessionState>,
    closed: AtomicBool,
}

impl ClientSession {
    pub fn new(
        connection_id: u64,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        control: ControlChannel,
        services: SessionServices,
    ) -> Self {
        let capacity = services.config.relay_queue_capacity;
        let hold_limit = services.config.pause_buffer_capacity;
        Self {
            connection_id,
            session_id: RwLock::new(None),
            local_addr,
            remote_addr,
            services,
            control,
            media: Arc::new(SessionMedia {
                routes: RouteTable::new(),
                buffer: PacketBuffer::with_limit(hold_limit),
                relay: OutboundRelay::new(capacity),
            }),
            sources: Mutex::new(SessionSources::default()),
            state: Mutex::new(SessionState::Init),
            closed: AtomicBool::new(false),
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// RTSP session id, once a DESCRIBE or SETUP has been answered.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    pub fn services(&self) -> &SessionServices {
        &self.services
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn legs(&self) -> Vec<Arc<TransportContext>> {
        self.media.relay.legs()
    }

    pub fn transport_mode(&self) -> Option<TransportMode> {
        self.media.relay.mode()
    }

    pub fn route_count(&self) -> usize {
        self.media.routes.len()
    }

    /// Client SSRC the given source SSRC is routed to.
    pub fn route(&self, source_ssrc: u32) -> Option<u32> {
        self.media.routes.get(source_ssrc)
    }

    /// Packets held for `source_ssrc`, `None` when it is not paused.
    pub fn buffered(&self, source_ssrc: u32) -> Option<usize> {
        self.media.buffer.pending(source_ssrc)
    }

    pub fn attached_sources(&self) -> Vec<String> {
        self.sources.lock().attached.keys().cloned().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn transition(&self, to: SessionState) {
        let mut state = self.state.lock();
        if *state != to {
            tracing::debug!(
                connection_id = self.connection_id,
                old_state = ?*state,
                new_state = ?to,
                "state transition"
            );
            *state = to;
        }
    }

    /// Response with the headers every answer carries: `CSeq`, the client's
    /// `Timestamp` (RFC 2326 §12.38) and `Session` once assigned.
    pub fn response(&self, request: &RtspRequest, status: StatusCode) -> RtspResponse {
        let mut response =
            RtspResponse::new(status).add_header("CSeq", request.cseq().unwrap_or("0"));
        if let Some(timestamp) = request.get_header("Timestamp") {
            response = response.add_header("Timestamp", timestamp);
        }
        if let Some(id) = self.session_id() {
            let value = format!("{};timeout={}", id, self.services.config.session_timeout_secs);
            response = response.add_header("Session", &value);
        }
        response
    }

    /// Write a response to the client.
    ///
    /// SETUP answers, and everything on a session that is not streaming
    /// interleaved, go straight to the socket. Otherwise the response joins
    /// the relay queue behind the media already queued.
    pub fn send_response(&self, method: &Method, response: &RtspResponse) -> io::Result<()> {
        let text = response.serialize();
        let relay = &self.media.relay;
        let queued = *method != Method::Setup
            && relay.mode() == Some(TransportMode::Interleaved)
            && relay.is_connected();
        if queued {
            relay.enqueue_control(self.control.clone(), Bytes::from(text));
            Ok(())
        } else {
            self.control.send(text.as_bytes())
        }
    }

    fn ensure_session_id(self: &Arc<Self>) -> String {
        let mut slot = self.session_id.write();
        if let Some(id) = slot.as_ref() {
            return id.clone();
        }
        let id = self.services.directory.register(self.clone());
        tracing::info!(
            session_id = %id,
            connection_id = self.connection_id,
            peer = %self.remote_addr,
            "session created"
        );
        *slot = Some(id.clone());
        id
    }

    /// Address advertised to the client in SDP and `Transport` headers.
    fn advertised_address(&self) -> String {
        match &self.services.config.public_host {
            Some(host) => host.clone(),
            None => self.local_addr.ip().to_string(),
        }
    }

    fn base_url(&self) -> String {
        match &self.services.config.public_host {
            Some(host) => format!("rtsp://{}:{}", host, self.local_addr.port()),
            None => format!("rtsp://{}", self.local_addr),
        }
    }

    pub fn describe(self: &Arc<Self>, request: &RtspRequest) -> RtspResponse {
        let Some((source, _)) = self.services.sources.resolve_from_uri(&request.uri) else {
            tracing::warn!(uri = %request.uri, "DESCRIBE for unknown source");
            return self.response(request, StatusCode::NotFound);
        };

        let config = &self.services.config;
        let probe_port = if source.force_tcp() {
            None
        } else {
            self.services.ports.probe(self.local_addr.ip())
        };
        let bandwidth = match (source.force_tcp(), source.disable_qos()) {
            (false, _) => RtcpBandwidth::Limits {
                sender: config.rtcp_sender_bandwidth,
                receiver: config.rtcp_receiver_bandwidth,
            },
            (true, true) => RtcpBandwidth::Limits {
                sender: 0,
                receiver: 0,
            },
            (true, false) => RtcpBandwidth::Omit,
        };
        let session_id = self.ensure_session_id();
        let address = self.advertised_address();
        let base_url = self.base_url();
        let description = describe::rewrite(
            source.description(),
            &RewriteParams {
                server_name: &config.server_name,
                session_name: &config.session_name,
                address: &address,
                base_url: &base_url,
                source_id: source.id(),
                probe_port,
                bandwidth,
                origin_id: &session_id,
            },
        );

        if self.state() == SessionState::Init {
            self.transition(SessionState::Described);
        }

        let content_base = format!("{}/", describe::source_url(&base_url, source.id()));
        self.response(request, StatusCode::Ok)
            .add_header("Content-Base", &content_base)
            .add_header("Content-Type", sdp::MIME_TYPE)
            .with_body(description.to_string())
    }

    /// Negotiate one leg. Protocol problems are answered with a coded
    /// response; failing to reserve resources is an `Err`.
    pub fn setup(self: &Arc<Self>, request: &RtspRequest) -> Result<RtspResponse> {
        let Some((source, segment)) = self.services.sources.resolve_from_uri(&request.uri) else {
            tracing::warn!(uri = %request.uri, "SETUP for unknown source");
            return Ok(self.response(request, StatusCode::NotFound));
        };
        let Some(track) = source.track_for(segment.as_deref()).cloned() else {
            tracing::warn!(uri = %request.uri, source = %source.id(), "SETUP for unknown track");
            return Ok(self.response(request, StatusCode::NotFound));
        };
        let Some(header) = request.get_header("Transport") else {
            tracing::warn!(uri = %request.uri, "SETUP missing Transport header");
            return Ok(self.response(request, StatusCode::BadRequest));
        };

        let transport = match TransportHeader::parse(header, source.force_tcp()) {
            Ok(t) => t,
            Err(TransportRejection::BadRequest) => {
                tracing::warn!(transport = %header, force_tcp = source.force_tcp(), "SETUP rejected Transport");
                return Ok(self.response(request, StatusCode::BadRequest));
            }
            Err(TransportRejection::Unsupported) => {
                tracing::warn!(transport = %header, "SETUP unsupported Transport");
                return Ok(self
                    .response(request, StatusCode::UnsupportedTransport)
                    .add_header("Transport", "RTP/AVP"));
            }
        };

        let negotiated = {
            let mut sources = self.sources.lock();
            self.negotiate(&mut sources, transport.delivery, &track)
        };
        let leg = match negotiated {
            Ok(leg) => leg,
            Err(RtspError::ChannelsExhausted) => {
                tracing::warn!(uri = %request.uri, legs = self.legs().len(), "SETUP ran out of interleaved channels");
                return Ok(self
                    .response(request, StatusCode::UnsupportedTransport)
                    .add_header("Transport", "RTP/AVP"));
            }
            Err(e) => return Err(e),
        };

        let session_id = self.ensure_session_id();
        if matches!(self.state(), SessionState::Init | SessionState::Described | SessionState::TornDown) {
            self.transition(SessionState::Ready);
        }

        tracing::info!(
            session_id = %session_id,
            source = %source.id(),
            media = %track.media_type(),
            ssrc = format_args!("{:#010X}", leg.ssrc()),
            "track set up"
        );

        let value = transport::response_header(&transport.profile, &leg, &self.advertised_address());
        Ok(self
            .response(request, StatusCode::Ok)
            .add_header("Transport", &value))
    }

    pub fn play(&self, request: &RtspRequest) -> RtspResponse {
        let range = match request.get_header("Range") {
            Some(value) => match PlayRange::parse(value) {
                Ok(range) => range,
                Err(e) => {
                    tracing::warn!(error = %e, "PLAY rejected");
                    return self.response(request, StatusCode::InvalidRange);
                }
            },
            None => PlayRange::default(),
        };

        let Some((source, _)) = self.services.sources.resolve_from_uri(&request.uri) else {
            tracing::warn!(uri = %request.uri, "PLAY for unknown source");
            return self.response(request, StatusCode::MethodNotValidInThisState);
        };

        let mut sources = self.sources.lock();
        let routed: Vec<(Arc<SourceTrack>, u32)> = source
            .tracks()
            .iter()
            .filter_map(|t| self.media.routes.get(t.ssrc()).map(|c| (t.clone(), c)))
            .collect();
        if routed.is_empty() {
            tracing::warn!(source = %source.id(), "PLAY without any set-up track");
            return self.response(request, StatusCode::MethodNotValidInThisState);
        }

        if let Err(e) = self.media.relay.connect() {
            tracing::warn!(error = %e, "failed to start relay sender");
            return self.response(request, StatusCode::InternalServerError);
        }

        let base_url = self.base_url();
        let rtp_info = routed
            .iter()
            .map(|(track, _)| {
                let (seq, rtptime) = track
                    .position()
                    .unwrap_or((0, track.clock().rtp_timestamp));
                format!(
                    "url={};seq={};rtptime={}",
                    describe::track_url(&base_url, source.id(), track.media_type()),
                    seq,
                    rtptime
                )
            })
            .collect::<Vec<_>>()
            .join(",");

        let client_ssrcs: Vec<u32> = routed.iter().map(|(_, c)| *c).collect();
        self.media.relay.send_sender_reports(&client_ssrcs);

        for (track, client_ssrc) in &routed {
            self.flush(track, *client_ssrc);
        }
        for track in source.tracks() {
            if self.media.routes.get(track.ssrc()).is_none() {
                self.media.buffer.discard(track.ssrc());
            }
        }

        if !sources.attached.contains_key(source.id()) {
            source.attach(self.connection_id, self.media.clone());
            sources.attached.insert(source.id().to_string(), source.clone());
        }
        drop(sources);

        self.transition(SessionState::Playing);
        tracing::info!(session_id = ?self.session_id(), source = %source.id(), tracks = routed.len(), "playing");

        self.response(request, StatusCode::Ok)
            .add_header("Range", &range.header_value())
            .add_header("RTP-Info", &rtp_info)
    }

    /// Hand the packets held for `track` to the relay, skipping leading
    /// packets older than the track's last sender report.
    fn flush(&self, track: &SourceTrack, client_ssrc: u32) {
        let clock = track.clock();
        let mut skipping = clock.is_known();
        let mut skipped = 0usize;
        let released = self.media.buffer.release(track.ssrc(), |packet| {
            if skipping && timestamp_precedes(packet.timestamp, clock.rtp_timestamp) {
                skipped += 1;
                return;
            }
            skipping = false;
            if let Err(e) = self.media.relay.enqueue_rtp(client_ssrc, &packet) {
                tracing::warn!(error = %e, "dropping buffered packet");
            }
        });
        if let Some(released) = released {
            tracing::debug!(
                source_ssrc = format_args!("{:#010X}", track.ssrc()),
                released,
                skipped,
                "flushed packet buffer"
            );
        }
    }

    pub fn pause(&self, request: &RtspRequest) -> RtspResponse {
        let resolved = self.services.sources.resolve_from_uri(&request.uri);
        let sources = self.sources.lock();
        let Some((source, _)) = resolved.filter(|(s, _)| sources.attached.contains_key(s.id()))
        else {
            tracing::warn!(uri = %request.uri, "PAUSE for a source that is not playing");
            return self.response(request, StatusCode::MethodNotValidInThisState);
        };

        for track in source.tracks() {
            self.media.buffer.hold(track.ssrc());
        }
        drop(sources);

        self.transition(SessionState::Paused);
        tracing::info!(session_id = ?self.session_id(), source = %source.id(), "paused");
        self.response(request, StatusCode::Ok)
    }

    pub fn teardown(&self, request: &RtspRequest) -> RtspResponse {
        let resolved = self.services.sources.resolve_from_uri(&request.uri);
        let mut sources = self.sources.lock();
        let Some((source, segment)) =
            resolved.filter(|(s, _)| sources.attached.contains_key(s.id()))
        else {
            tracing::warn!(uri = %request.uri, "TEARDOWN for a source that is not attached");
            return self.response(request, StatusCode::BadRequest);
        };

        if let Some(segment) = segment {
            let Some(track) = source
                .tracks()
                .iter()
                .find(|t| t.matches(&segment) && sources.contexts.contains_key(&t.ssrc()))
                .cloned()
            else {
                tracing::warn!(uri = %request.uri, "TEARDOWN for a track that is not set up");
                return self.response(request, StatusCode::NotFound);
            };
            self.release_track(&mut sources, track.ssrc());
            tracing::info!(
                session_id = ?self.session_id(),
                source = %source.id(),
                media = %track.media_type(),
                "track torn down"
            );
            return self.response(request, StatusCode::Ok);
        }

        source.detach(self.connection_id);
        sources.attached.remove(source.id());
        for track in source.tracks() {
            self.release_track(&mut sources, track.ssrc());
        }
        let remaining = sources.attached.len();
        drop(sources);

        tracing::info!(session_id = ?self.session_id(), source = %source.id(), remaining, "source torn down");

        let response = self.response(request, StatusCode::Ok);
        if remaining == 0 {
            self.retire();
        }
        response
    }

    /// Remove a track's route, leg, context and held packets.
    fn release_track(&self, sources: &mut SessionSources, source_ssrc: u32) {
        if let Some(client_ssrc) = self.media.routes.remove(source_ssrc) {
            self.media.relay.remove_leg(client_ssrc);
        }
        sources.contexts.remove(&source_ssrc);
        self.media.buffer.discard(source_ssrc);
    }

    /// Leave the directory and stop the relay. Only the first call has an
    /// effect on the directory.
    fn retire(&self) {
        if let Some(id) = self.session_id.write().take()
            && self.services.directory.remove(&id).is_some()
        {
            tracing::info!(session_id = %id, connection_id = self.connection_id, "session retired");
        }
        self.media.relay.disconnect();
        self.transition(SessionState::TornDown);
    }

    /// Release everything after connection loss. Idempotent.
    pub fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let attached: Vec<Arc<SourceStream>> = {
            let mut sources = self.sources.lock();
            sources.contexts.clear();
            sources.attached.drain().map(|(_, s)| s).collect()
        };
        for source in &attached {
            source.detach(self.connection_id);
        }

        self.media.routes.clear();
        self.media.buffer.clear();
        self.media.relay.disconnect();
        self.media.relay.clear_legs();
        self.retire();

        tracing::debug!(
            connection_id = self.connection_id,
            detached = attached.len(),
            "session resources released"
        );
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("connection_id", &self.connection_id)
            .field("session_id", &self.session_id())
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::rtcp::{Goodbye, ReportBlock};
    use crate::media::{RtcpPacket, RtpPacket, SenderReport};
    use crate::protocol::sdp::SessionDescription;
    use crate::source::SourceObserver;
    use std::net::{IpAddr, Ipv4Addr};

    const SDP: &str = "v=0\r\n\
        o=- 1 1 IN IP4 10.0.0.5\r\n\
        s=Camera\r\n\
        t=0 0\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=control:trackID=1\r\n\
        a=ssrc:1111 cname:cam\r\n\
        m=audio 0 RTP/AVP 97\r\n\
        a=control:trackID=2\r\n\
        a=ssrc:2222 cname:cam\r\n";

    const VIDEO: u32 = 1111;
    const AUDIO: u32 = 2222;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        session: Arc<ClientSession>,
        source: Arc<SourceStream>,
        directory: SessionDirectory,
        wire: Captured,
    }

    fn fixture_with(force_tcp: bool, ports: PortAllocator) -> Fixture {
        let sources = SourceRegistry::new();
        let source = sources.add(SourceStream::new(
            "cam",
            SessionDescription::parse(SDP).unwrap(),
            force_tcp,
            false,
        ));
        let directory = SessionDirectory::new();
        let services = SessionServices {
            config: Arc::new(ServerConfig::default()),
            sources,
            directory: directory.clone(),
            ports,
        };
        let local = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8554);
        let remote = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 50000);
        let wire = Captured::default();
        let session = Arc::new(ClientSession::new(
            1,
            local,
            remote,
            ControlChannel::new(wire.clone()),
            services,
        ));
        Fixture {
            session,
            source,
            directory,
            wire,
        }
    }

    /// Sequence numbers of the RTP frames written on interleaved `channel`.
    fn sequences_on(wire: &Captured, channel: u8) -> Vec<u16> {
        let bytes = wire.0.lock().clone();
        let mut seqs = Vec::new();
        let mut rest = &bytes[..];
        while let [b'$', ch, hi, lo, tail @ ..] = rest {
            let len = u16::from_be_bytes([*hi, *lo]) as usize;
            if tail.len() < len {
                break;
            }
            let (payload, next) = tail.split_at(len);
            if *ch == channel && payload.len() >= 4 {
                seqs.push(u16::from_be_bytes([payload[2], payload[3]]));
            }
            rest = next;
        }
        seqs
    }

    fn wait_for_sequences(wire: &Captured, channel: u8, count: usize) -> Vec<u16> {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            let seqs = sequences_on(wire, channel);
            if seqs.len() >= count || std::time::Instant::now() >= deadline {
                return seqs;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }

    fn fixture() -> Fixture {
        fixture_with(false, PortAllocator::new(42000, 42400))
    }

    fn request(method: &str, uri: &str, headers: &[(&str, &str)]) -> RtspRequest {
        let mut text = format!("{method} {uri} RTSP/1.0\r\nCSeq: 1\r\n");
        for (name, value) in headers {
            text.push_str(&format!("{name}: {value}\r\n"));
        }
        text.push_str("\r\n");
        RtspRequest::parse(&text).unwrap()
    }

    fn setup_interleaved(f: &Fixture, track: &str, channels: &str) -> RtspResponse {
        let transport = format!("RTP/AVP/TCP;unicast;interleaved={channels}");
        f.session
            .setup(&request(
                "SETUP",
                &format!("rtsp://127.0.0.1:8554/live/cam/{track}"),
                &[("Transport", &transport)],
            ))
            .unwrap()
    }

    fn play(f: &Fixture) -> RtspResponse {
        f.session
            .play(&request("PLAY", "rtsp://127.0.0.1:8554/live/cam", &[]))
    }

    #[test]
    fn describe_assigns_id_and_rewrites() {
        let f = fixture();
        let resp = f
            .session
            .describe(&request("DESCRIBE", "rtsp://127.0.0.1:8554/live/cam", &[]));
        assert_eq!(resp.status_code(), 200);
        let id = f.session.session_id().unwrap();
        assert!(f.directory.contains(&id));
        assert_eq!(f.session.state(), SessionState::Described);

        let body = resp.body.clone().unwrap();
        assert!(body.contains(&format!("o=rtsp-relay {id} {id} IN IP4 127.0.0.1\r\n")));
        assert!(body.contains("a=control:rtsp://127.0.0.1:8554/live/cam/video\r\n"));
        assert!(body.contains("b=RS:96\r\n"));
        assert_eq!(
            resp.get_header("Content-Base"),
            Some("rtsp://127.0.0.1:8554/live/cam/")
        );
    }

    #[test]
    fn describe_unknown_source() {
        let f = fixture();
        let resp = f
            .session
            .describe(&request("DESCRIBE", "rtsp://127.0.0.1:8554/live/nope", &[]));
        assert_eq!(resp.status_code(), 404);
        assert!(f.session.session_id().is_none());
    }

    #[test]
    fn interleaved_channels_step_by_two() {
        let f = fixture();
        let first = setup_interleaved(&f, "video", "0-1");
        let second = setup_interleaved(&f, "audio", "0-1");

        let t1 = first.get_header("Transport").unwrap();
        let t2 = second.get_header("Transport").unwrap();
        assert!(t1.starts_with("RTP/AVP/TCP;unicast;interleaved=0-1;ssrc="), "{t1}");
        assert!(t2.starts_with("RTP/AVP/TCP;unicast;interleaved=2-3;ssrc="), "{t2}");
        assert_eq!(f.session.route_count(), 2);
        assert_eq!(f.session.state(), SessionState::Ready);
        assert!(first.get_header("Session").is_some());
    }

    #[test]
    fn channels_past_255_are_refused() {
        let f = fixture();
        let first = setup_interleaved(&f, "video", "254-255");
        assert_eq!(first.status_code(), 200);

        let second = setup_interleaved(&f, "audio", "0-1");
        assert_eq!(second.status_code(), 461);
        assert_eq!(second.get_header("Transport"), Some("RTP/AVP"));
        assert!(f.session.route(AUDIO).is_none());
        assert!(f.session.route(VIDEO).is_some());
        assert_eq!(f.session.legs().len(), 1);
        assert_eq!(f.session.legs()[0].channels(), (254, 255));

        // Replacing the only leg keeps working at the top of the range.
        let again = setup_interleaved(&f, "video", "254-255");
        assert_eq!(again.status_code(), 200);
        assert_eq!(f.session.legs().len(), 1);
    }

    #[test]
    fn udp_setup_answers_adjacent_ports() {
        let f = fixture();
        let resp = f
            .session
            .setup(&request(
                "SETUP",
                "rtsp://127.0.0.1:8554/live/cam/video",
                &[("Transport", "RTP/AVP;unicast;client_port=6000-6001")],
            ))
            .unwrap();
        let transport = resp.get_header("Transport").unwrap();
        assert!(transport.starts_with("RTP/AVP/UDP;unicast;client_port=6000-6001;server_port="));
        assert!(transport.contains(";source=127.0.0.1;ssrc="));

        let leg = &f.session.legs()[0];
        let (rtp, rtcp) = leg.server_ports().unwrap();
        assert_eq!(rtp % 2, 0);
        assert_eq!(rtcp, rtp + 1);
    }

    #[test]
    fn setup_rejections() {
        let f = fixture();
        let uri = "rtsp://127.0.0.1:8554/live/cam/video";
        let missing = f.session.setup(&request("SETUP", uri, &[])).unwrap();
        assert_eq!(missing.status_code(), 400);

        let odd = f
            .session
            .setup(&request("SETUP", uri, &[("Transport", "RTP/AVP;client_port=6000")]))
            .unwrap();
        assert_eq!(odd.status_code(), 461);
        assert_eq!(odd.get_header("Transport"), Some("RTP/AVP"));

        let track = f
            .session
            .setup(&request(
                "SETUP",
                "rtsp://127.0.0.1:8554/live/cam/subtitles",
                &[("Transport", "RTP/AVP/TCP;interleaved=0-1")],
            ))
            .unwrap();
        assert_eq!(track.status_code(), 404);
        assert_eq!(f.session.route_count(), 0);
    }

    #[test]
    fn forced_tcp_refuses_udp() {
        let f = fixture_with(true, PortAllocator::new(42500, 42600));
        let resp = f
            .session
            .setup(&request(
                "SETUP",
                "rtsp://127.0.0.1:8554/live/cam/video",
                &[("Transport", "RTP/AVP;unicast;client_port=6000-6001")],
            ))
            .unwrap();
        assert_eq!(resp.status_code(), 400);
    }

    #[test]
    fn port_exhaustion_leaves_nothing_registered() {
        let ports = PortAllocator::new(42700, 42702);
        let _held = ports.allocate(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        let f = fixture_with(false, ports);

        let result = f.session.setup(&request(
            "SETUP",
            "rtsp://127.0.0.1:8554/live/cam/video",
            &[("Transport", "RTP/AVP;unicast;client_port=6000-6001")],
        ));
        assert!(matches!(
            result,
            Err(crate::RtspError::PortRangeExhausted { .. })
        ));
        assert_eq!(f.session.route_count(), 0);
        assert!(f.session.legs().is_empty());
        assert!(f.session.session_id().is_none());
    }

    #[test]
    fn switchover_rebuilds_single_leg() {
        let f = fixture();
        let _ = setup_interleaved(&f, "video", "0-1");
        let _ = setup_interleaved(&f, "audio", "2-3");
        assert_eq!(f.session.legs().len(), 2);

        let _ = f
            .session
            .setup(&request(
                "SETUP",
                "rtsp://127.0.0.1:8554/live/cam/audio",
                &[("Transport", "RTP/AVP;unicast;client_port=6000-6001")],
            ))
            .unwrap();
        assert_eq!(f.session.transport_mode(), Some(TransportMode::Udp));
        assert_eq!(f.session.legs().len(), 1);
        assert_eq!(f.session.route_count(), 1);
        assert!(f.session.route(VIDEO).is_none());
        assert!(f.session.route(AUDIO).is_some());

        let back = setup_interleaved(&f, "video", "4-5");
        assert!(back
            .get_header("Transport")
            .unwrap()
            .contains("interleaved=4-5"));
        assert_eq!(f.session.legs().len(), 1);
        assert_eq!(f.session.transport_mode(), Some(TransportMode::Interleaved));
    }

    #[test]
    fn setup_copies_source_clock() {
        let f = fixture();
        f.source.publish_rtcp(&RtcpPacket::SenderReport(SenderReport {
            ssrc: VIDEO,
            ntp_timestamp: 77,
            rtp_timestamp: 900,
            ..Default::default()
        }));
        let _ = setup_interleaved(&f, "video", "0-1");
        let clock = f.session.legs()[0].clock();
        assert_eq!((clock.ntp_timestamp, clock.rtp_timestamp), (77, 900));
    }

    #[test]
    fn play_requires_routes_and_valid_range() {
        let f = fixture();
        assert_eq!(play(&f).status_code(), 455);

        let _ = setup_interleaved(&f, "video", "0-1");
        let bad = f.session.play(&request(
            "PLAY",
            "rtsp://127.0.0.1:8554/live/cam",
            &[("Range", "npt=5-10-15")],
        ));
        assert_eq!(bad.status_code(), 457);
        assert!(f.session.attached_sources().is_empty());
        assert_eq!(f.session.state(), SessionState::Ready);
    }

    #[test]
    fn play_attaches_and_reports_position() {
        let f = fixture();
        f.source.publish_rtp(&RtpPacket::new(96, 500, 123_000, VIDEO, &[]));
        let _ = setup_interleaved(&f, "video", "0-1");

        let resp = f.session.play(&request(
            "PLAY",
            "rtsp://127.0.0.1:8554/live/cam",
            &[("Range", "npt=5-10")],
        ));
        assert_eq!(resp.status_code(), 200);
        assert_eq!(resp.get_header("Range"), Some("npt=5.000-10.000"));
        assert_eq!(
            resp.get_header("RTP-Info"),
            Some("url=rtsp://127.0.0.1:8554/live/cam/video;seq=500;rtptime=123000")
        );
        assert_eq!(f.session.attached_sources(), vec!["cam".to_string()]);
        assert_eq!(f.source.observer_count(), 1);
        assert_eq!(f.session.state(), SessionState::Playing);
    }

    #[test]
    fn pause_requires_attachment_and_holds_packets() {
        let f = fixture();
        let _ = setup_interleaved(&f, "video", "0-1");
        let early = f
            .session
            .pause(&request("PAUSE", "rtsp://127.0.0.1:8554/live/cam", &[]));
        assert_eq!(early.status_code(), 455);

        let _ = play(&f);
        let resp = f
            .session
            .pause(&request("PAUSE", "rtsp://127.0.0.1:8554/live/cam", &[]));
        assert_eq!(resp.status_code(), 200);
        assert_eq!(f.session.buffered(VIDEO), Some(0));
        assert_eq!(f.session.buffered(AUDIO), Some(0));

        for seq in 0..3 {
            f.source.publish_rtp(&RtpPacket::new(96, seq, 0, VIDEO, &[]));
        }
        assert_eq!(f.session.buffered(VIDEO), Some(3));

        let _ = play(&f);
        assert_eq!(f.session.buffered(VIDEO), None);
        assert_eq!(f.session.buffered(AUDIO), None);
    }

    #[test]
    fn resume_skips_packets_older_than_sender_report() {
        let f = fixture();
        let _ = setup_interleaved(&f, "video", "0-1");
        let _ = play(&f);
        let _ = f
            .session
            .pause(&request("PAUSE", "rtsp://127.0.0.1:8554/live/cam", &[]));

        f.source.publish_rtcp(&RtcpPacket::SenderReport(SenderReport {
            ssrc: VIDEO,
            ntp_timestamp: 0xE000_0000_0000_0000,
            rtp_timestamp: 0xFFFF_FF00,
            ..Default::default()
        }));
        let timestamps: [u32; 5] = [0xFFFF_FE00, 0xFFFF_FEFF, 0xFFFF_FF00, 0x0000_0010, 0xFFFF_FE80];
        for (seq, ts) in (1u16..).zip(timestamps) {
            f.source.publish_rtp(&RtpPacket::new(96, seq, ts, VIDEO, &[]));
        }
        assert_eq!(f.session.buffered(VIDEO), Some(5));

        let _ = play(&f);
        assert_eq!(f.session.buffered(VIDEO), None);
        let forwarded = wait_for_sequences(&f.wire, 0, 3);
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(forwarded, vec![3, 4, 5]);
        assert_eq!(sequences_on(&f.wire, 0), vec![3, 4, 5]);
    }

    #[test]
    fn resume_without_sender_report_forwards_everything() {
        let f = fixture();
        let _ = setup_interleaved(&f, "video", "0-1");
        let _ = play(&f);
        let _ = f
            .session
            .pause(&request("PAUSE", "rtsp://127.0.0.1:8554/live/cam", &[]));
        for (seq, ts) in (1u16..).zip([500u32, 100, 900]) {
            f.source.publish_rtp(&RtpPacket::new(96, seq, ts, VIDEO, &[]));
        }

        let _ = play(&f);
        assert_eq!(wait_for_sequences(&f.wire, 0, 3), vec![1, 2, 3]);
    }

    #[test]
    fn goodbye_only_for_routed_sources() {
        let f = fixture();
        let _ = setup_interleaved(&f, "video", "0-1");
        let media = f.session.media.clone();

        media.on_rtcp(&RtcpPacket::Goodbye(Goodbye::for_source(0xDEAD)));
        assert_eq!(media.relay.pending(), 0);

        media.on_rtcp(&RtcpPacket::Goodbye(Goodbye {
            sources: vec![VIDEO, 0xDEAD],
            reason: None,
        }));
        assert_eq!(media.relay.pending(), 1);
    }

    #[test]
    fn sender_report_updates_routed_legs() {
        let f = fixture();
        let _ = setup_interleaved(&f, "video", "0-1");
        let _ = setup_interleaved(&f, "audio", "0-1");
        let media = f.session.media.clone();

        media.on_rtcp(&RtcpPacket::SenderReport(SenderReport {
            ssrc: 0xBEEF,
            ntp_timestamp: 5,
            rtp_timestamp: 6,
            blocks: vec![
                ReportBlock {
                    ssrc: AUDIO,
                    ..Default::default()
                },
                ReportBlock {
                    ssrc: AUDIO,
                    ..Default::default()
                },
            ],
            ..Default::default()
        }));

        let audio = media.relay.leg(f.session.route(AUDIO).unwrap()).unwrap();
        let video = media.relay.leg(f.session.route(VIDEO).unwrap()).unwrap();
        assert_eq!(audio.clock().rtp_timestamp, 6);
        assert!(!video.clock().is_known());
    }

    #[test]
    fn unrouted_rtp_is_dropped() {
        let f = fixture();
        let media = f.session.media.clone();
        media.on_rtp(&RtpPacket::new(96, 0, 0, VIDEO, &[]));
        assert_eq!(media.relay.pending(), 0);
    }

    #[test]
    fn teardown_track_keeps_siblings() {
        let f = fixture();
        let _ = setup_interleaved(&f, "video", "0-1");
        let _ = setup_interleaved(&f, "audio", "0-1");

        let not_attached = f
            .session
            .teardown(&request("TEARDOWN", "rtsp://127.0.0.1:8554/live/cam", &[]));
        assert_eq!(not_attached.status_code(), 400);

        let _ = play(&f);
        let missing = f.session.teardown(&request(
            "TEARDOWN",
            "rtsp://127.0.0.1:8554/live/cam/subtitles",
            &[],
        ));
        assert_eq!(missing.status_code(), 404);

        let resp = f.session.teardown(&request(
            "TEARDOWN",
            "rtsp://127.0.0.1:8554/live/cam/audio",
            &[],
        ));
        assert_eq!(resp.status_code(), 200);
        assert!(f.session.route(AUDIO).is_none());
        assert!(f.session.route(VIDEO).is_some());
        assert_eq!(f.session.legs().len(), 1);
        assert!(f.session.session_id().is_some());

        let again = f.session.teardown(&request(
            "TEARDOWN",
            "rtsp://127.0.0.1:8554/live/cam/audio",
            &[],
        ));
        assert_eq!(again.status_code(), 404);
        assert!(f.session.route(VIDEO).is_some());
    }

    #[test]
    fn teardown_of_track_never_set_up() {
        let f = fixture();
        let _ = setup_interleaved(&f, "video", "0-1");
        let _ = play(&f);

        let resp = f.session.teardown(&request(
            "TEARDOWN",
            "rtsp://127.0.0.1:8554/live/cam/audio",
            &[],
        ));
        assert_eq!(resp.status_code(), 404);
        assert!(f.session.route(VIDEO).is_some());
        assert_eq!(f.session.legs().len(), 1);
        assert_eq!(f.session.attached_sources(), vec!["cam".to_string()]);
    }

    #[test]
    fn full_teardown_retires_once() {
        let f = fixture();
        let _ = setup_interleaved(&f, "video", "0-1");
        let _ = play(&f);
        let id = f.session.session_id().unwrap();
        assert!(f.directory.contains(&id));

        let resp = f
            .session
            .teardown(&request("TEARDOWN", "rtsp://127.0.0.1:8554/live/cam", &[]));
        assert_eq!(resp.status_code(), 200);
        assert!(resp.get_header("Session").unwrap().starts_with(&id));
        assert!(!f.directory.contains(&id));
        assert_eq!(f.source.observer_count(), 0);
        assert_eq!(f.session.route_count(), 0);
        assert_eq!(f.session.state(), SessionState::TornDown);

        f.session.disconnect();
        assert!(f.directory.is_empty());
    }

    #[test]
    fn disconnect_is_idempotent() {
        let f = fixture();
        let _ = setup_interleaved(&f, "video", "0-1");
        let _ = play(&f);

        f.session.disconnect();
        f.session.disconnect();
        assert!(f.session.is_closed());
        assert!(f.directory.is_empty());
        assert_eq!(f.source.observer_count(), 0);
        assert!(f.session.legs().is_empty());
    }

    #[test]
    fn responses_echo_cseq_and_timestamp() {
        let f = fixture();
        let req = request(
            "DESCRIBE",
            "rtsp://127.0.0.1:8554/live/cam",
            &[("Timestamp", "12.5")],
        );
        let resp = f.session.describe(&req);
        assert_eq!(resp.get_header("CSeq"), Some("1"));
        assert_eq!(resp.get_header("Timestamp"), Some("12.5"));
        assert!(resp.get_header("Session").unwrap().ends_with(";timeout=60"));
    }

    #[test]
    fn source_observer_trait_object() {
        let f = fixture();
        let observer: Arc<dyn SourceObserver> = f.session.media.clone();
        assert!(f.source.attach(99, observer));
        assert!(f.source.detach(99));
    }
}

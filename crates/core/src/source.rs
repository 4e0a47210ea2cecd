use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::media::{RtcpPacket, RtpPacket};
use crate::protocol::sdp::{MediaDescription, SessionDescription};
use crate::relay::ClockState;

/// Path prefix under which sources are published (`rtsp://host/live/<id>`).
pub const LIVE_PREFIX: &str = "live";

/// Receives everything a [`SourceStream`] produces.
///
/// Called on the source's delivery thread; implementations must not block.
pub trait SourceObserver: Send + Sync {
    fn on_rtp(&self, packet: &RtpPacket);
    fn on_rtcp(&self, packet: &RtcpPacket);
}

/// One media track of a source stream.
pub struct SourceTrack {
    media_type: String,
    control: Option<String>,
    ssrc: u32,
    media: MediaDescription,
    clock: Mutex<ClockState>,
    position: Mutex<Option<(u16, u32)>>,
}

impl SourceTrack {
    fn from_media(media: MediaDescription) -> Self {
        let ssrc = media
            .attribute("ssrc")
            .and_then(|v| v.split_whitespace().next())
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(rand::random::<u32>);
        Self {
            media_type: media.media_type().to_string(),
            control: media.control().map(str::to_string),
            ssrc,
            media,
            clock: Mutex::new(ClockState::default()),
            position: Mutex::new(None),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// The track's `a=control` value as the source published it.
    pub fn control(&self) -> Option<&str> {
        self.control.as_deref()
    }

    pub fn media(&self) -> &MediaDescription {
        &self.media
    }

    /// Clock from the latest sender report.
    pub fn clock(&self) -> ClockState {
        *self.clock.lock()
    }

    /// Sequence number and RTP timestamp of the latest packet.
    pub fn position(&self) -> Option<(u16, u32)> {
        *self.position.lock()
    }

    /// Whether a URI segment names this track, by media type or by its
    /// original control value.
    pub fn matches(&self, segment: &str) -> bool {
        if segment.eq_ignore_ascii_case(&self.media_type) {
            return true;
        }
        self.control.as_deref().is_some_and(|control| {
            control == segment || control.rsplit('/').next() == Some(segment)
        })
    }
}

impl std::fmt::Debug for SourceTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceTrack")
            .field("media_type", &self.media_type)
            .field("control", &self.control)
            .field("ssrc", &format_args!("{:#010X}", self.ssrc))
            .finish()
    }
}

/// A shared, long-lived producer of RTP/RTCP.
///
/// Sessions subscribe with [`attach`](Self::attach). Delivery happens under
/// the observer list's read lock, so [`detach`](Self::detach) returns only
/// once no delivery to that observer is still in flight.
pub struct SourceStream {
    id: String,
    description: SessionDescription,
    tracks: Vec<Arc<SourceTrack>>,
    force_tcp: bool,
    disable_qos: bool,
    observers: RwLock<Vec<(u64, Arc<dyn SourceObserver>)>>,
}

impl SourceStream {
    pub fn new(
        id: &str,
        description: SessionDescription,
        force_tcp: bool,
        disable_qos: bool,
    ) -> Self {
        let tracks = description
            .media
            .iter()
            .cloned()
            .map(|m| Arc::new(SourceTrack::from_media(m)))
            .collect();
        Self {
            id: id.to_string(),
            description,
            tracks,
            force_tcp,
            disable_qos,
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> &SessionDescription {
        &self.description
    }

    pub fn tracks(&self) -> &[Arc<SourceTrack>] {
        &self.tracks
    }

    pub fn track(&self, ssrc: u32) -> Option<&Arc<SourceTrack>> {
        self.tracks.iter().find(|t| t.ssrc == ssrc)
    }

    /// Track named by a URI segment; `None` selects the first track.
    pub fn track_for(&self, segment: Option<&str>) -> Option<&Arc<SourceTrack>> {
        match segment {
            Some(segment) => self.tracks.iter().find(|t| t.matches(segment)),
            None => self.tracks.first(),
        }
    }

    /// Clients must use interleaved delivery for this source.
    pub fn force_tcp(&self) -> bool {
        self.force_tcp
    }

    pub fn disable_qos(&self) -> bool {
        self.disable_qos
    }

    /// Subscribe an observer under `key`. Returns `false` if the key is
    /// already attached.
    pub fn attach(&self, key: u64, observer: Arc<dyn SourceObserver>) -> bool {
        let mut observers = self.observers.write();
        if observers.iter().any(|(k, _)| *k == key) {
            return false;
        }
        observers.push((key, observer));
        tracing::debug!(source = %self.id, key, observers = observers.len(), "observer attached");
        true
    }

    /// Unsubscribe `key`. Safe to call any number of times.
    pub fn detach(&self, key: u64) -> bool {
        let mut observers = self.observers.write();
        match observers.iter().position(|(k, _)| *k == key) {
            Some(pos) => {
                observers.swap_remove(pos);
                tracing::debug!(source = %self.id, key, observers = observers.len(), "observer detached");
                true
            }
            None => false,
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    pub fn publish_rtp(&self, packet: &RtpPacket) {
        if let Some(track) = self.track(packet.ssrc) {
            *track.position.lock() = Some((packet.sequence, packet.timestamp));
        }
        for (_, observer) in self.observers.read().iter() {
            observer.on_rtp(packet);
        }
    }

    pub fn publish_rtcp(&self, packet: &RtcpPacket) {
        if let RtcpPacket::SenderReport(sr) = packet
            && let Some(track) = self.track(sr.ssrc)
        {
            *track.clock.lock() = ClockState {
                ntp_timestamp: sr.ntp_timestamp,
                rtp_timestamp: sr.rtp_timestamp,
            };
        }
        for (_, observer) in self.observers.read().iter() {
            observer.on_rtcp(packet);
        }
    }
}

/// Registry of source streams, keyed by id.
///
/// Supports a "default" source that serves any URI whose id does not match
/// a registered source.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: Arc<RwLock<HashMap<String, Arc<SourceStream>>>>,
    default_id: Arc<RwLock<Option<String>>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source. Replaces any existing source with the same id.
    pub fn add(&self, source: SourceStream) -> Arc<SourceStream> {
        let source = Arc::new(source);
        self.sources
            .write()
            .insert(source.id().to_string(), source.clone());
        tracing::info!(
            source = %source.id(),
            tracks = source.tracks().len(),
            force_tcp = source.force_tcp(),
            "source registered"
        );
        source
    }

    pub fn set_default(&self, id: &str) {
        *self.default_id.write() = Some(id.to_string());
    }

    pub fn get(&self, id: &str) -> Option<Arc<SourceStream>> {
        self.sources.read().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sources.read().keys().cloned().collect()
    }

    /// Resolve the source named by an RTSP URI and the track segment that
    /// follows it, if any.
    ///
    /// `rtsp://host/live/cam/video` → (`cam`, `Some("video")`)
    pub fn resolve_from_uri(&self, uri: &str) -> Option<(Arc<SourceStream>, Option<String>)> {
        let (id, segment) = split_source_path(uri);
        let source = self.get(id).or_else(|| {
            let default = self.default_id.read();
            default.as_ref().and_then(|d| self.get(d))
        })?;
        Some((source, segment.map(str::to_string)))
    }
}

/// Split a URI into source id and optional track segment.
///
/// `rtsp://host:8554/live/cam/trackID=1` → (`cam`, `Some("trackID=1")`)
/// `rtsp://host:8554/cam/`               → (`cam`, `None`)
/// `rtsp://host:8554`                    → (``, `None`)
pub fn split_source_path(uri: &str) -> (&str, Option<&str>) {
    let path = match uri
        .strip_prefix("rtsp://")
        .or_else(|| uri.strip_prefix("rtsps://"))
    {
        Some(after) => after.find('/').map_or("", |slash| &after[slash..]),
        None => uri,
    };
    let path = path.split(['?', '#']).next().unwrap_or("");
    let path = path.trim_matches('/');
    let path = path
        .strip_prefix(LIVE_PREFIX)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(path);

    match path.split_once('/') {
        Some((id, rest)) => {
            let rest = rest.trim_matches('/');
            (id, (!rest.is_empty()).then_some(rest))
        }
        None => (path, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SDP: &str = "v=0\r\n\
        o=- 1 1 IN IP4 10.0.0.5\r\n\
        s=Camera\r\n\
        t=0 0\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=control:trackID=1\r\n\
        a=ssrc:305419896 cname:cam\r\n\
        m=audio 0 RTP/AVP 97\r\n\
        a=control:trackID=2\r\n";

    fn source() -> SourceStream {
        SourceStream::new("cam", SessionDescription::parse(SDP).unwrap(), false, false)
    }

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl SourceObserver for Counter {
        fn on_rtp(&self, _: &RtpPacket) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn on_rtcp(&self, _: &RtcpPacket) {}
    }

    #[test]
    fn split_paths() {
        assert_eq!(split_source_path("rtsp://h:8554/live/cam/video"), ("cam", Some("video")));
        assert_eq!(split_source_path("rtsp://h:8554/cam/"), ("cam", None));
        assert_eq!(split_source_path("rtsp://h:8554/cam?x=1"), ("cam", None));
        assert_eq!(
            split_source_path("rtsp://h/live/cam/trackID=1"),
            ("cam", Some("trackID=1"))
        );
        assert_eq!(split_source_path("rtsp://h:8554"), ("", None));
        assert_eq!(split_source_path("/cam/audio"), ("cam", Some("audio")));
    }

    #[test]
    fn tracks_from_description() {
        let s = source();
        assert_eq!(s.tracks().len(), 2);
        assert_eq!(s.tracks()[0].ssrc(), 305_419_896);
        assert_eq!(s.tracks()[0].media_type(), "video");
        assert_eq!(s.tracks()[1].control(), Some("trackID=2"));
    }

    #[test]
    fn track_lookup_by_segment() {
        let s = source();
        assert_eq!(s.track_for(Some("audio")).unwrap().media_type(), "audio");
        assert_eq!(s.track_for(Some("trackID=1")).unwrap().media_type(), "video");
        assert_eq!(s.track_for(None).unwrap().media_type(), "video");
        assert!(s.track_for(Some("subtitles")).is_none());
    }

    #[test]
    fn attach_detach_idempotent() {
        let s = source();
        let counter = Arc::new(Counter::default());
        assert!(s.attach(1, counter.clone()));
        assert!(!s.attach(1, counter.clone()));

        s.publish_rtp(&RtpPacket::new(96, 1, 1, 305_419_896, &[]));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        assert!(s.detach(1));
        assert!(!s.detach(1));
        s.publish_rtp(&RtpPacket::new(96, 2, 2, 305_419_896, &[]));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn publish_tracks_position_and_clock() {
        let s = source();
        let ssrc = s.tracks()[0].ssrc();
        s.publish_rtp(&RtpPacket::new(96, 77, 9000, ssrc, &[]));
        assert_eq!(s.tracks()[0].position(), Some((77, 9000)));

        s.publish_rtcp(&RtcpPacket::SenderReport(crate::media::SenderReport {
            ssrc,
            ntp_timestamp: 42,
            rtp_timestamp: 8000,
            ..Default::default()
        }));
        assert_eq!(
            s.tracks()[0].clock(),
            ClockState {
                ntp_timestamp: 42,
                rtp_timestamp: 8000
            }
        );
    }

    #[test]
    fn registry_default_fallback() {
        let registry = SourceRegistry::new();
        registry.add(source());
        assert!(registry.resolve_from_uri("rtsp://h/live/other").is_none());

        registry.set_default("cam");
        let (s, segment) = registry.resolve_from_uri("rtsp://h/live/other/video").unwrap();
        assert_eq!(s.id(), "cam");
        assert_eq!(segment.as_deref(), Some("video"));
    }
}

use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use parking_lot::Mutex;

use crate::error::{Result, RtspError};
use crate::protocol::sdp::SessionDescription;
use crate::relay::buffer::DEFAULT_HOLD_LIMIT;
use crate::session::{SessionDirectory, SessionServices, SessionState};
use crate::source::{SourceRegistry, SourceStream};
use crate::transport::tcp;
use crate::transport::{PortAllocator, UdpIngest};

/// Server-level configuration used by protocol handlers.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Public host advertised in SDP `o=`/`c=` lines, `Content-Base` and
    /// `RTP-Info` URLs. When `None`, the address the client connected to is
    /// used.
    pub public_host: Option<String>,
    /// SDP origin username field (`o=<server_name> ...`).
    pub server_name: String,
    /// SDP session name (`s=`).
    pub session_name: String,
    /// Lowest local UDP port handed out to legs.
    pub udp_port_min: u16,
    /// Highest local UDP port handed out to legs.
    pub udp_port_max: u16,
    /// `b=RS:` written into UDP-capable descriptions (RFC 3556).
    pub rtcp_sender_bandwidth: u32,
    /// `b=RR:` written into UDP-capable descriptions (RFC 3556).
    pub rtcp_receiver_bandwidth: u32,
    /// Entries a session's outbound queue holds before dropping the oldest.
    pub relay_queue_capacity: usize,
    /// Packets held per track while paused before dropping the oldest.
    pub pause_buffer_capacity: usize,
    /// Idle seconds before a connection is closed and its session released.
    /// Advertised as `Session: <id>;timeout=<n>`. Zero disables the timer.
    pub session_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            public_host: None,
            server_name: "rtsp-relay".to_string(),
            session_name: "Stream".to_string(),
            udp_port_min: 10000,
            udp_port_max: 65534,
            rtcp_sender_bandwidth: 96,
            rtcp_receiver_bandwidth: 96,
            relay_queue_capacity: 4096,
            pause_buffer_capacity: DEFAULT_HOLD_LIMIT,
            session_timeout_secs: 60,
        }
    }
}

/// High-level RTSP relay orchestrator.
///
/// Owns the source registry, the session directory and the UDP port
/// allocator. Delegates TCP connection handling to [`transport::tcp`] and
/// external RTP feeds to [`UdpIngest`].
///
/// [`transport::tcp`]: crate::transport::tcp
pub struct Server {
    running: Arc<AtomicBool>,
    bind_addr: String,
    local_addr: Option<SocketAddr>,
    config: Arc<ServerConfig>,
    sources: SourceRegistry,
    directory: SessionDirectory,
    ports: PortAllocator,
    ingests: Mutex<Vec<UdpIngest>>,
}

impl Server {
    pub fn new(bind_addr: &str) -> Self {
        Self::with_config(bind_addr, ServerConfig::default())
    }

    pub fn with_config(bind_addr: &str, config: ServerConfig) -> Self {
        let ports = PortAllocator::new(config.udp_port_min, config.udp_port_max);
        Self {
            running: Arc::new(AtomicBool::new(false)),
            bind_addr: bind_addr.to_string(),
            local_addr: None,
            config: Arc::new(config),
            sources: SourceRegistry::new(),
            directory: SessionDirectory::new(),
            ports,
            ingests: Mutex::new(Vec::new()),
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RtspError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.bind_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let services = SessionServices {
            config: self.config.clone(),
            sources: self.sources.clone(),
            directory: self.directory.clone(),
            ports: self.ports.clone(),
        };

        tracing::info!(addr = %local_addr, sources = self.sources.ids().len(), "RTSP relay listening");

        thread::spawn(move || {
            tcp::accept_loop(listener, services, running);
        });

        Ok(())
    }

    /// Stop accepting, release every live session and stop all ingests.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for session in self.directory.sessions() {
            session.disconnect();
        }
        self.ingests.lock().clear();
        tracing::info!("server stopping");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Register a source stream from its SDP.
    pub fn add_source(
        &self,
        id: &str,
        sdp: &str,
        force_tcp: bool,
        disable_qos: bool,
    ) -> Result<Arc<SourceStream>> {
        let description = SessionDescription::parse(sdp)?;
        Ok(self
            .sources
            .add(SourceStream::new(id, description, force_tcp, disable_qos)))
    }

    /// Feed source `id` from RTP/RTCP arriving on `base_port` and up.
    pub fn ingest_udp(&self, id: &str, ip: IpAddr, base_port: u16) -> Result<()> {
        let source = self
            .sources
            .get(id)
            .ok_or_else(|| RtspError::SourceNotFound(id.to_string()))?;
        let ingest = UdpIngest::spawn(source, ip, base_port)?;
        self.ingests.lock().push(ingest);
        Ok(())
    }

    /// Sessions currently delivering media.
    pub fn get_viewers(&self) -> Vec<Viewer> {
        self.directory
            .sessions()
            .iter()
            .filter(|s| s.state() == SessionState::Playing)
            .filter_map(|s| {
                s.session_id().map(|session_id| Viewer {
                    session_id,
                    client_addr: s.remote_addr().to_string(),
                    sources: s.attached_sources(),
                    legs: s.legs().len(),
                })
            })
            .collect()
    }

    pub fn directory(&self) -> &SessionDirectory {
        &self.directory
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Returns the server's protocol configuration.
    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

/// Information about a connected viewer (client in PLAY state).
#[derive(Debug, Clone)]
pub struct Viewer {
    pub session_id: String,
    pub client_addr: String,
    /// Ids of the sources the viewer is attached to.
    pub sources: Vec<String>,
    /// Number of negotiated transport legs.
    pub legs: usize,
}

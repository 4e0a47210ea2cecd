//! Error types for the RTSP relay library.

use std::fmt;

/// Errors that can occur in the RTSP relay library.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Protocol**: [`Parse`](Self::Parse): malformed RTSP messages,
///   [`Sdp`](Self::Sdp): unusable session descriptions.
/// - **Media**: [`Packet`](Self::Packet): RTP/RTCP that cannot be decoded.
/// - **Transport**: [`Io`](Self::Io), [`PortRangeExhausted`](Self::PortRangeExhausted),
///   [`ChannelsExhausted`](Self::ChannelsExhausted).
/// - **Lookup**: [`SessionNotFound`](Self::SessionNotFound),
///   [`SourceNotFound`](Self::SourceNotFound), [`LegNotFound`](Self::LegNotFound).
/// - **Server**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning).
///
/// Protocol violations by a client never surface here; they are answered
/// with a coded [`RtspResponse`](crate::protocol::RtspResponse) instead.
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No session with the given ID exists in the [`SessionDirectory`](crate::session::SessionDirectory).
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// No source stream registered under the requested id.
    #[error("source not found: {0}")]
    SourceNotFound(String),

    /// [`Server::start`](crate::Server::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// Failed to decode an RTP or RTCP packet.
    #[error("packet error: {kind}")]
    Packet { kind: PacketErrorKind },

    /// The session description could not be parsed.
    #[error("SDP error: {0}")]
    Sdp(String),

    /// A route points at a client SSRC with no outbound leg behind it.
    #[error("no outbound leg for SSRC {0:#010X}")]
    LegNotFound(u32),

    /// No adjacent pair of free UDP ports is left in the configured range.
    #[error("UDP port range {min}-{max} exhausted")]
    PortRangeExhausted { min: u16, max: u16 },

    /// The next interleaved channel pair would run past 255.
    #[error("interleaved channels exhausted")]
    ChannelsExhausted,
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
        }
    }
}

/// Specific kind of RTP/RTCP decode failure.
#[derive(Debug, PartialEq, Eq)]
pub enum PacketErrorKind {
    /// Fewer bytes than the fixed header (or a declared length) requires.
    Truncated { required: usize, available: usize },
    /// Version field was not 2.
    BadVersion(u8),
}

impl fmt::Display for PacketErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated {
                required,
                available,
            } => write!(f, "truncated: need {required} bytes, have {available}"),
            Self::BadVersion(v) => write!(f, "unsupported version {v}"),
        }
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;

//! Network transport layer for RTSP signaling and RTP media.
//!
//! - **TCP** ([`tcp`]): RTSP request/response signaling, one thread per
//!   connection. The connection's write half doubles as the interleaved
//!   media channel (RFC 2326 §10.12) through [`ControlChannel`].
//!
//! - **UDP** ([`udp`]): per-leg RTP/RTCP socket pairs handed out by
//!   [`PortAllocator`], and [`UdpIngest`] which turns an external RTP feed
//!   into a source stream.

pub mod tcp;
pub mod udp;

pub use tcp::ControlChannel;
pub use udp::{PortAllocator, UdpIngest, UdpPair};

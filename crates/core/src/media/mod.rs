//! RTP and RTCP as seen by the relay.
//!
//! The relay forwards media it did not produce, so it only needs enough of
//! the wire formats to route and re-time packets:
//!
//! - **RTP** ([`rtp`]): fixed-header fields (SSRC, sequence, timestamp) and an
//!   SSRC rewrite for the outbound leg. Payloads stay opaque.
//! - **RTCP** ([`rtcp`]): sender reports (clock synchronisation) and goodbyes
//!   (track end), plus pass-through for the other packet types.
//!
//! | Packet | RFC | Used for |
//! |--------|-----|----------|
//! | RTP | [RFC 3550 §5](https://tools.ietf.org/html/rfc3550#section-5) | Media forwarding |
//! | SR | [RFC 3550 §6.4.1](https://tools.ietf.org/html/rfc3550#section-6.4.1) | Clock copy, PLAY sync |
//! | BYE | [RFC 3550 §6.6](https://tools.ietf.org/html/rfc3550#section-6.6) | Per-track end |

pub mod rtcp;
pub mod rtp;

pub use rtcp::{Goodbye, RtcpPacket, SenderReport};
pub use rtp::RtpPacket;

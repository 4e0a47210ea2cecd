//! Per-session packet routing primitives.
//!
//! ```text
//!  source packet ──► PacketBuffer ──held──► buffered until PLAY
//!                        │
//!                        └─flowing─► RouteTable ──► OutboundRelay queue ──► sender thread
//!                                    (src → client SSRC)        (leg by client SSRC)
//! ```
//!
//! The three structures are always locked in that order: buffer, routes,
//! relay queue.

pub mod buffer;
pub mod context;
pub mod outbound;
pub mod routes;

pub use buffer::{Disposition, PacketBuffer};
pub use context::{ClockState, LegSink, TransportContext, TransportMode, UdpLeg};
pub use outbound::OutboundRelay;
pub use routes::RouteTable;

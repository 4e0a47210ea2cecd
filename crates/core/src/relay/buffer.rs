use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::media::RtpPacket;

/// What happened to a packet offered to [`PacketBuffer::route`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The SSRC is held; the packet was queued in the buffer.
    Buffered,
    /// Not held; the forward callback accepted the packet.
    Forwarded,
    /// Not held and the forward callback declined it (no route).
    Dropped,
}

/// Packets held per SSRC before the oldest are dropped.
pub const DEFAULT_HOLD_LIMIT: usize = 8192;

/// Per-session packet buffer: source SSRC → packets in arrival order.
///
/// A key that is present, even with an empty list, means the SSRC is paused
/// and its packets are withheld. A missing key means packets flow (or were
/// never set up).
///
/// Every operation runs under one mutex, which gives the two guarantees the
/// pause/resume path needs:
///
/// - [`route`](Self::route) decides "buffer or forward" and performs the
///   forward while the lock is held, so a packet can never slip past a
///   concurrent [`release`](Self::release).
/// - [`release`](Self::release) takes the list and removes the key in one
///   step, handing every packet to the caller before any later packet for
///   that SSRC can be forwarded live.
///
/// Each held list keeps at most `limit` packets; the oldest go first.
#[derive(Debug)]
pub struct PacketBuffer {
    entries: Mutex<HashMap<u32, VecDeque<RtpPacket>>>,
    limit: usize,
}

impl Default for PacketBuffer {
    fn default() -> Self {
        Self::with_limit(DEFAULT_HOLD_LIMIT)
    }
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Start withholding packets for `ssrc`. Returns `false` if it was
    /// already held (the existing backlog is kept).
    pub fn hold(&self, ssrc: u32) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(&ssrc) {
            return false;
        }
        entries.insert(ssrc, VecDeque::new());
        true
    }

    pub fn is_held(&self, ssrc: u32) -> bool {
        self.entries.lock().contains_key(&ssrc)
    }

    /// Number of packets waiting for `ssrc`, `None` when not held.
    pub fn pending(&self, ssrc: u32) -> Option<usize> {
        self.entries.lock().get(&ssrc).map(VecDeque::len)
    }

    /// Buffer `packet` if its SSRC is held, otherwise hand it to `forward`.
    /// A full held list drops its oldest packet to make room.
    ///
    /// `forward` returns whether it accepted the packet and runs with the
    /// buffer lock held; it must not block.
    pub fn route<F>(&self, packet: &RtpPacket, forward: F) -> Disposition
    where
        F: FnOnce(&RtpPacket) -> bool,
    {
        let mut entries = self.entries.lock();
        if let Some(held) = entries.get_mut(&packet.ssrc) {
            if held.len() >= self.limit {
                held.pop_front();
                tracing::warn!(
                    ssrc = format_args!("{:#010X}", packet.ssrc),
                    limit = self.limit,
                    "pause buffer full, dropping oldest packet"
                );
            }
            held.push_back(packet.clone());
            return Disposition::Buffered;
        }
        if forward(packet) {
            Disposition::Forwarded
        } else {
            Disposition::Dropped
        }
    }

    /// Stop withholding `ssrc`, passing each buffered packet to `deliver` in
    /// arrival order before the key disappears.
    ///
    /// Returns the number of packets released, `None` if the SSRC was not
    /// held.
    pub fn release<F>(&self, ssrc: u32, mut deliver: F) -> Option<usize>
    where
        F: FnMut(RtpPacket),
    {
        let mut entries = self.entries.lock();
        let packets = entries.remove(&ssrc)?;
        let count = packets.len();
        for packet in packets {
            deliver(packet);
        }
        Some(count)
    }

    /// Drop the key and its backlog without delivering anything.
    pub fn discard(&self, ssrc: u32) -> Option<usize> {
        self.entries.lock().remove(&ssrc).map(|p| p.len())
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn held_ssrcs(&self) -> Vec<u32> {
        self.entries.lock().keys().copied().collect()
    }
}

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::{Result, RtspError};
use crate::media::{Goodbye, RtpPacket};
use crate::relay::context::{TransportContext, TransportMode};
use crate::transport::tcp::ControlChannel;

enum Outbound {
    Rtp {
        leg: Arc<TransportContext>,
        packet: RtpPacket,
    },
    Rtcp {
        leg: Arc<TransportContext>,
        payload: Bytes,
    },
    Control {
        channel: ControlChannel,
        payload: Bytes,
    },
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<Outbound>,
    running: bool,
}

struct Queue {
    state: Mutex<QueueState>,
    ready: Condvar,
    capacity: usize,
}

impl Queue {
    fn push(&self, item: Outbound) {
        let mut state = self.state.lock();
        if state.items.len() >= self.capacity {
            state.items.pop_front();
            tracing::warn!(capacity = self.capacity, "relay queue full, dropped oldest entry");
        }
        state.items.push_back(item);
        drop(state);
        self.ready.notify_one();
    }

    fn next(&self) -> Option<Outbound> {
        let mut state = self.state.lock();
        loop {
            if !state.running {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            self.ready.wait(&mut state);
        }
    }
}

/// A session's outbound side: its legs and an ordered send queue.
///
/// Every enqueue is non-blocking; a single sender thread, started by
/// [`connect`](Self::connect), drains the queue in order. Media and
/// interleaved RTSP responses share the queue so they reach the client in
/// the order they were produced.
pub struct OutboundRelay {
    legs: RwLock<Vec<Arc<TransportContext>>>,
    mode: RwLock<Option<TransportMode>>,
    queue: Arc<Queue>,
    sender: Mutex<Option<JoinHandle<()>>>,
}

impl OutboundRelay {
    pub fn new(capacity: usize) -> Self {
        Self {
            legs: RwLock::new(Vec::new()),
            mode: RwLock::new(None),
            queue: Arc::new(Queue {
                state: Mutex::new(QueueState::default()),
                ready: Condvar::new(),
                capacity: capacity.max(1),
            }),
            sender: Mutex::new(None),
        }
    }

    /// Delivery mode of the current legs, `None` before the first SETUP.
    pub fn mode(&self) -> Option<TransportMode> {
        *self.mode.read()
    }

    /// Drop every leg and queued entry and start over in `mode`.
    pub fn switch_to(&self, mode: TransportMode) {
        let dropped = {
            let mut legs = self.legs.write();
            let n = legs.len();
            legs.clear();
            n
        };
        self.clear_pending();
        *self.mode.write() = Some(mode);
        tracing::debug!(?mode, dropped_legs = dropped, "relay transport switched");
    }

    /// Register a leg, fixing the relay's mode on first use.
    pub fn add_leg(&self, leg: Arc<TransportContext>) {
        let mode = leg.mode();
        {
            let mut current = self.mode.write();
            if current.is_none() {
                *current = Some(mode);
            }
        }
        tracing::debug!(
            ssrc = format_args!("{:#010X}", leg.ssrc()),
            channels = ?leg.channels(),
            ?mode,
            "leg added"
        );
        self.legs.write().push(leg);
    }

    /// Unregister a leg and drop the media still queued for it.
    pub fn remove_leg(&self, ssrc: u32) -> Option<Arc<TransportContext>> {
        let leg = {
            let mut legs = self.legs.write();
            let pos = legs.iter().position(|l| l.ssrc() == ssrc)?;
            legs.remove(pos)
        };
        let purged = {
            let mut state = self.queue.state.lock();
            let before = state.items.len();
            state.items.retain(|item| match item {
                Outbound::Rtp { leg, .. } | Outbound::Rtcp { leg, .. } => leg.ssrc() != ssrc,
                Outbound::Control { .. } => true,
            });
            before - state.items.len()
        };
        tracing::debug!(ssrc = format_args!("{:#010X}", ssrc), purged, "leg removed");
        Some(leg)
    }

    pub fn leg(&self, ssrc: u32) -> Option<Arc<TransportContext>> {
        self.legs.read().iter().find(|l| l.ssrc() == ssrc).cloned()
    }

    pub fn legs(&self) -> Vec<Arc<TransportContext>> {
        self.legs.read().clone()
    }

    pub fn clear_legs(&self) {
        self.legs.write().clear();
    }

    /// Channel pair for the next leg: `(0, 1)` for the first, the previous
    /// leg's pair plus two after that. `None` once the pair would pass 255.
    pub fn next_channels(&self) -> Option<(u8, u8)> {
        self.channels_following(None)
    }

    /// [`next_channels`](Self::next_channels) as if the leg `ssrc` were
    /// already gone.
    pub fn next_channels_replacing(&self, ssrc: u32) -> Option<(u8, u8)> {
        self.channels_following(Some(ssrc))
    }

    fn channels_following(&self, skip: Option<u32>) -> Option<(u8, u8)> {
        let legs = self.legs.read();
        match legs.iter().rev().find(|l| Some(l.ssrc()) != skip) {
            Some(last) => {
                let (rtp, rtcp) = last.channels();
                Some((rtp.checked_add(2)?, rtcp.checked_add(2)?))
            }
            None => Some((0, 1)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.queue.state.lock().running
    }

    /// Start the sender thread. Does nothing if it is already running.
    pub fn connect(&self) -> Result<()> {
        let mut sender = self.sender.lock();
        if sender.is_some() {
            return Ok(());
        }
        self.queue.state.lock().running = true;

        let queue = self.queue.clone();
        let spawned = thread::Builder::new()
            .name("relay-sender".to_string())
            .spawn(move || {
                while let Some(item) = queue.next() {
                    deliver(item);
                }
                tracing::trace!("relay sender exited");
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.queue.state.lock().running = false;
                return Err(e.into());
            }
        };
        *sender = Some(handle);
        tracing::debug!("relay connected");
        Ok(())
    }

    /// Stop the sender thread, discard whatever is still queued and wait for
    /// the thread to finish. Idempotent.
    pub fn disconnect(&self) {
        {
            let mut state = self.queue.state.lock();
            state.running = false;
            state.items.clear();
        }
        self.queue.ready.notify_all();
        if let Some(handle) = self.sender.lock().take() {
            if handle.join().is_err() {
                tracing::warn!("relay sender panicked");
            }
            tracing::debug!("relay disconnected");
        }
    }

    pub fn enqueue_rtp(&self, client_ssrc: u32, packet: &RtpPacket) -> Result<()> {
        let leg = self.leg(client_ssrc).ok_or(RtspError::LegNotFound(client_ssrc))?;
        self.queue.push(Outbound::Rtp {
            leg,
            packet: packet.clone(),
        });
        Ok(())
    }

    pub fn enqueue_goodbye(&self, client_ssrc: u32) -> Result<()> {
        let leg = self.leg(client_ssrc).ok_or(RtspError::LegNotFound(client_ssrc))?;
        let payload = Goodbye::for_source(client_ssrc).serialize();
        self.queue.push(Outbound::Rtcp { leg, payload });
        Ok(())
    }

    /// Queue a sender report on each of the given legs.
    pub fn send_sender_reports(&self, client_ssrcs: &[u32]) {
        for leg in self.legs() {
            if client_ssrcs.contains(&leg.ssrc()) {
                let payload = leg.sender_report().serialize();
                self.queue.push(Outbound::Rtcp { leg, payload });
            }
        }
    }

    pub fn enqueue_control(&self, channel: ControlChannel, payload: Bytes) {
        self.queue.push(Outbound::Control { channel, payload });
    }

    pub fn pending(&self) -> usize {
        self.queue.state.lock().items.len()
    }

    pub fn clear_pending(&self) {
        self.queue.state.lock().items.clear();
    }
}

impl Drop for OutboundRelay {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn deliver(item: Outbound) {
    let (ssrc, result) = match item {
        Outbound::Rtp { leg, packet } => (leg.ssrc(), leg.send_rtp(&packet)),
        Outbound::Rtcp { leg, payload } => (leg.ssrc(), leg.send_rtcp(&payload)),
        Outbound::Control { channel, payload } => (0, channel.send(&payload)),
    };
    if let Err(e) = result {
        tracing::warn!(ssrc = format_args!("{:#010X}", ssrc), error = %e, "relay send failed");
    }
}

use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{Result, RtspError};
use crate::media::{Goodbye, RtcpPacket, RtpPacket};
use crate::source::{SourceStream, SourceTrack};

const MAX_DATAGRAM: usize = 65_536;
const INGEST_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct Reservations {
    ports: HashSet<u16>,
    cursor: u16,
}

/// Hands out even/odd UDP port pairs from a fixed range.
///
/// A pair is reserved only once both sockets are actually bound, and stays
/// reserved until its [`PortLease`] is dropped, so no two live legs (across
/// all sessions sharing the allocator) are ever given the same pair.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    min: u16,
    max: u16,
    reserved: Arc<Mutex<Reservations>>,
}

impl PortAllocator {
    pub fn new(min: u16, max: u16) -> Self {
        let min = min.max(2) & !1;
        Self {
            min,
            max: max.max(min.saturating_add(1)),
            reserved: Arc::new(Mutex::new(Reservations {
                ports: HashSet::new(),
                cursor: min,
            })),
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.min, self.max)
    }

    /// Bind and reserve the next free pair on `ip`.
    pub fn allocate(&self, ip: IpAddr) -> Result<UdpPair> {
        let mut reserved = self.reserved.lock();
        for rtp_port in self.candidates(reserved.cursor) {
            let rtcp_port = rtp_port + 1;
            if reserved.ports.contains(&rtp_port) || reserved.ports.contains(&rtcp_port) {
                continue;
            }
            let Ok(rtp) = UdpSocket::bind(SocketAddr::new(ip, rtp_port)) else {
                continue;
            };
            let Ok(rtcp) = UdpSocket::bind(SocketAddr::new(ip, rtcp_port)) else {
                continue;
            };

            reserved.ports.insert(rtp_port);
            reserved.ports.insert(rtcp_port);
            reserved.cursor = self.wrap(rtp_port.saturating_add(2));
            tracing::trace!(rtp_port, rtcp_port, "allocated UDP port pair");

            return Ok(UdpPair {
                rtp,
                rtcp,
                lease: PortLease {
                    ports: (rtp_port, rtcp_port),
                    reserved: self.reserved.clone(),
                },
            });
        }

        tracing::warn!(min = self.min, max = self.max, "UDP port range exhausted");
        Err(RtspError::PortRangeExhausted {
            min: self.min,
            max: self.max,
        })
    }

    /// An even port that is currently free on `ip`, without reserving it.
    pub fn probe(&self, ip: IpAddr) -> Option<u16> {
        let reserved = self.reserved.lock();
        self.candidates(reserved.cursor)
            .filter(|p| !reserved.ports.contains(p))
            .find(|p| UdpSocket::bind(SocketAddr::new(ip, *p)).is_ok())
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved.lock().ports.len()
    }

    fn wrap(&self, port: u16) -> u16 {
        if port >= self.max { self.min } else { port }
    }

    /// Even ports from `start` to the top of the range, then from the bottom
    /// back up to `start`.
    fn candidates(&self, start: u16) -> impl Iterator<Item = u16> + '_ {
        let last = self.max.saturating_sub(1);
        let start = self.wrap(start.max(self.min)) & !1;
        (start..=last)
            .step_by(2)
            .chain((self.min..start).step_by(2))
    }
}

/// A bound RTP/RTCP socket pair.
#[derive(Debug)]
pub struct UdpPair {
    pub rtp: UdpSocket,
    pub rtcp: UdpSocket,
    lease: PortLease,
}

impl UdpPair {
    pub fn ports(&self) -> (u16, u16) {
        self.lease.ports
    }
}

/// Returns the pair to its [`PortAllocator`] when dropped.
#[derive(Debug)]
pub struct PortLease {
    ports: (u16, u16),
    reserved: Arc<Mutex<Reservations>>,
}

impl Drop for PortLease {
    fn drop(&mut self) {
        let mut reserved = self.reserved.lock();
        reserved.ports.remove(&self.ports.0);
        reserved.ports.remove(&self.ports.1);
        tracing::trace!(rtp_port = self.ports.0, "released UDP port pair");
    }
}

/// Feeds a [`SourceStream`] from plain RTP/RTCP over UDP.
///
/// Track `i` listens on `base_port + 2i` (RTP) and `base_port + 2i + 1`
/// (RTCP). Whatever SSRC the sender uses is replaced with the track's, so
/// downstream routing only ever sees track SSRCs.
pub struct UdpIngest {
    source_id: String,
    running: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl UdpIngest {
    pub fn spawn(source: Arc<SourceStream>, ip: IpAddr, base_port: u16) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let mut ingest = UdpIngest {
            source_id: source.id().to_string(),
            running: running.clone(),
            workers: Vec::new(),
        };

        for (index, track) in source.tracks().iter().enumerate() {
            let rtp_port = port_for(base_port, index, 0)?;
            let rtcp_port = port_for(base_port, index, 1)?;

            let rtp = bind_ingest(ip, rtp_port)?;
            let rtcp = bind_ingest(ip, rtcp_port)?;

            tracing::info!(
                source = %source.id(),
                media = %track.media_type(),
                rtp_port,
                rtcp_port,
                "UDP ingest listening"
            );

            ingest.workers.push(spawn_worker(
                "ingest-rtp",
                rtp,
                source.clone(),
                track.clone(),
                running.clone(),
                ingest_rtp,
            )?);
            ingest.workers.push(spawn_worker(
                "ingest-rtcp",
                rtcp,
                source.clone(),
                track.clone(),
                running.clone(),
                ingest_rtcp,
            )?);
        }

        Ok(ingest)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        tracing::debug!(source = %self.source_id, "UDP ingest stopped");
    }
}

impl Drop for UdpIngest {
    fn drop(&mut self) {
        self.stop();
    }
}

fn port_for(base: u16, index: usize, offset: usize) -> Result<u16> {
    u16::try_from(base as usize + index * 2 + offset).map_err(|_| {
        RtspError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "ingest port out of range",
        ))
    })
}

fn bind_ingest(ip: IpAddr, port: u16) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddr::new(ip, port))?;
    socket.set_read_timeout(Some(INGEST_POLL))?;
    Ok(socket)
}

type IngestFn = fn(&SourceStream, &SourceTrack, Bytes);

fn spawn_worker(
    name: &str,
    socket: UdpSocket,
    source: Arc<SourceStream>,
    track: Arc<SourceTrack>,
    running: Arc<AtomicBool>,
    handle: IngestFn,
) -> Result<JoinHandle<()>> {
    let worker = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            while running.load(Ordering::SeqCst) {
                match socket.recv_from(&mut buf) {
                    Ok((len, _)) => handle(&source, &track, Bytes::copy_from_slice(&buf[..len])),
                    Err(ref e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                        ) => {}
                    Err(e) => {
                        tracing::warn!(source = %source.id(), error = %e, "ingest receive failed");
                        thread::sleep(INGEST_POLL);
                    }
                }
            }
        })?;
    Ok(worker)
}

fn ingest_rtp(source: &SourceStream, track: &SourceTrack, datagram: Bytes) {
    match RtpPacket::parse(datagram) {
        Ok(packet) => source.publish_rtp(&packet.relabel(track.ssrc())),
        Err(e) => tracing::warn!(source = %source.id(), error = %e, "dropping bad RTP datagram"),
    }
}

fn ingest_rtcp(source: &SourceStream, track: &SourceTrack, datagram: Bytes) {
    let packets = match RtcpPacket::parse_compound(&datagram) {
        Ok(packets) => packets,
        Err(e) => {
            tracing::warn!(source = %source.id(), error = %e, "dropping bad RTCP datagram");
            return;
        }
    };
    for packet in packets {
        let packet = match packet {
            RtcpPacket::SenderReport(mut sr) => {
                sr.ssrc = track.ssrc();
                RtcpPacket::SenderReport(sr)
            }
            RtcpPacket::Goodbye(bye) => RtcpPacket::Goodbye(Goodbye {
                sources: vec![track.ssrc()],
                reason: bye.reason,
            }),
            other => other,
        };
        source.publish_rtcp(&packet);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn pairs_are_adjacent_even_odd() {
        let ports = PortAllocator::new(41000, 41100);
        let pair = ports.allocate(LOCALHOST).unwrap();
        let (rtp, rtcp) = pair.ports();
        assert_eq!(rtp % 2, 0);
        assert_eq!(rtcp, rtp + 1);
        assert_eq!(pair.rtp.local_addr().unwrap().port(), rtp);
        assert_eq!(pair.rtcp.local_addr().unwrap().port(), rtcp);
    }

    #[test]
    fn live_pairs_never_collide() {
        let ports = PortAllocator::new(41200, 41300);
        let a = ports.allocate(LOCALHOST).unwrap();
        let b = ports.allocate(LOCALHOST).unwrap();
        assert_ne!(a.ports(), b.ports());
        assert_eq!(ports.reserved_count(), 4);
    }

    #[test]
    fn lease_released_on_drop() {
        let ports = PortAllocator::new(41400, 41500);
        let pair = ports.allocate(LOCALHOST).unwrap();
        assert_eq!(ports.reserved_count(), 2);
        drop(pair);
        assert_eq!(ports.reserved_count(), 0);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let ports = PortAllocator::new(41600, 41602);
        let _held = ports.allocate(LOCALHOST).unwrap();
        let err = ports.allocate(LOCALHOST).unwrap_err();
        assert!(matches!(
            err,
            RtspError::PortRangeExhausted {
                min: 41600,
                max: 41602
            }
        ));
    }

    #[test]
    fn probe_does_not_reserve() {
        let ports = PortAllocator::new(41700, 41800);
        let port = ports.probe(LOCALHOST).unwrap();
        assert_eq!(port % 2, 0);
        assert_eq!(ports.reserved_count(), 0);
    }
}

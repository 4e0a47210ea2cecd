use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::protocol::{MethodHandler, RtspRequest};
use crate::session::{ClientSession, SessionServices};

/// Write stalls tolerated before a send is abandoned.
const MAX_WRITE_STALLS: u32 = 200;
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Shared write half of an RTSP connection.
///
/// Responses and interleaved media frames are both written through this
/// handle; one lock guards each complete message so frames never
/// interleave mid-write.
#[derive(Clone)]
pub struct ControlChannel {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl ControlChannel {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Write `bytes` completely, retrying partial writes.
    pub fn send(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock();
        write_fully(&mut **writer, bytes)
    }

    /// Write one `$`-framed packet (RFC 2326 §10.12):
    ///
    /// ```text
    /// | '$' | channel | length (u16 BE) | payload ... |
    /// ```
    pub fn send_interleaved(&self, channel: u8, payload: &[u8]) -> io::Result<()> {
        let len = u16::try_from(payload.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "interleaved payload too large")
        })?;
        let [hi, lo] = len.to_be_bytes();
        let mut writer = self.writer.lock();
        write_fully(&mut **writer, &[b'$', channel, hi, lo])?;
        write_fully(&mut **writer, payload)
    }
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel").finish_non_exhaustive()
    }
}

fn write_fully(writer: &mut dyn Write, mut buf: &[u8]) -> io::Result<()> {
    let mut stalls = 0;
    while !buf.is_empty() {
        match writer.write(buf) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                buf = &buf[n..];
                stalls = 0;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                stalls += 1;
                if stalls > MAX_WRITE_STALLS {
                    return Err(e);
                }
                thread::sleep(Duration::from_millis(1));
            }
            Err(e) => return Err(e),
        }
    }
    writer.flush()
}

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`crate::server::Server::stop`] can terminate it promptly.
pub fn accept_loop(listener: TcpListener, services: SessionServices, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let services = services.clone();
                let r = running.clone();
                thread::spawn(move || {
                    Connection::handle(stream, services, r);
                });
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

/// A single RTSP client connection with its own lifecycle.
struct Connection {
    reader: BufReader<TcpStream>,
    session: Arc<ClientSession>,
    handler: MethodHandler,
    peer_addr: SocketAddr,
}

impl Connection {
    /// Entry point: set up a connection and run its request loop.
    pub fn handle(stream: TcpStream, services: SessionServices, running: Arc<AtomicBool>) {
        let (peer_addr, local_addr) = match (stream.peer_addr(), stream.local_addr()) {
            (Ok(peer), Ok(local)) => (peer, local),
            _ => return,
        };

        let timeout_secs = services.config.session_timeout_secs;
        if timeout_secs > 0 {
            let _ = stream.set_read_timeout(Some(Duration::from_secs(timeout_secs)));
        }
        let _ = stream.set_write_timeout(Some(WRITE_TIMEOUT));
        let _ = stream.set_nodelay(true);

        let reader_stream = match stream.try_clone() {
            Ok(s) => s,
            Err(_) => return,
        };

        let connection_id = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        tracing::info!(%peer_addr, connection_id, "client connected");

        let session = Arc::new(ClientSession::new(
            connection_id,
            local_addr,
            peer_addr,
            ControlChannel::new(stream),
            services,
        ));

        let mut conn = Connection {
            reader: BufReader::new(reader_stream),
            handler: MethodHandler::new(session.clone()),
            session,
            peer_addr,
        };

        let reason = conn.run(&running);
        conn.session.disconnect();

        tracing::info!(%peer_addr, connection_id, reason, "client disconnected");
    }

    /// RTSP request/response loop. Returns the reason for exiting.
    fn run(&mut self, running: &Arc<AtomicBool>) -> &'static str {
        while running.load(Ordering::SeqCst) {
            let request_text = match self.read_message() {
                Ok(Some(text)) => text,
                Ok(None) => return "connection closed by client",
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    return "session timed out";
                }
                Err(_) => return "read error",
            };

            if request_text.trim().is_empty() {
                continue;
            }

            match RtspRequest::parse(&request_text) {
                Ok(request) => {
                    if self.skip_body(request.content_length()).is_err() {
                        return "read error";
                    }

                    tracing::debug!(
                        peer = %self.peer_addr,
                        method = %request.method,
                        uri = %request.uri,
                        version = %request.version,
                        "request"
                    );

                    let response = self.handler.handle(&request);

                    tracing::debug!(
                        peer = %self.peer_addr,
                        status = response.status_code(),
                        "response"
                    );

                    if self
                        .session
                        .send_response(&request.method, &response)
                        .is_err()
                    {
                        return "write error";
                    }
                }
                Err(e) => {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "parse error");
                }
            }
        }

        "server shutting down"
    }

    /// Read one request head, skipping any interleaved frames the client
    /// sends in between (receiver reports on the odd channels).
    fn read_message(&mut self) -> io::Result<Option<String>> {
        loop {
            let next = match self.reader.fill_buf()?.first() {
                Some(byte) => *byte,
                None => return Ok(None),
            };
            if next != b'$' {
                break;
            }
            self.skip_interleaved()?;
        }

        let mut request_text = String::new();
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            request_text.push_str(&line);
            if line == "\r\n" || line == "\n" {
                break;
            }
        }
        Ok(Some(request_text))
    }

    fn skip_interleaved(&mut self) -> io::Result<()> {
        let mut header = [0u8; 4];
        self.reader.read_exact(&mut header)?;
        let len = u16::from_be_bytes([header[2], header[3]]) as u64;
        tracing::trace!(peer = %self.peer_addr, channel = header[1], len, "skipping client frame");
        io::copy(&mut (&mut self.reader).take(len), &mut io::sink())?;
        Ok(())
    }

    fn skip_body(&mut self, len: usize) -> io::Result<()> {
        if len > 0 {
            io::copy(&mut (&mut self.reader).take(len as u64), &mut io::sink())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct Trickle {
        out: Arc<Mutex<Vec<u8>>>,
        calls: Arc<Mutex<u32>>,
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut calls = self.calls.lock();
            *calls += 1;
            if *calls % 2 == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(3);
            self.out.lock().extend_from_slice(&buf[..n]);
            Ok(n)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn partial_writes_are_retried() {
        let sink = Trickle::default();
        let channel = ControlChannel::new(sink.clone());
        channel.send(b"RTSP/1.0 200 OK\r\n\r\n").unwrap();
        assert_eq!(sink.out.lock().as_slice(), b"RTSP/1.0 200 OK\r\n\r\n");
    }

    #[test]
    fn interleaved_frame_layout() {
        let sink = Trickle::default();
        let channel = ControlChannel::new(sink.clone());
        channel.send_interleaved(4, &[1, 2, 3]).unwrap();
        assert_eq!(sink.out.lock().as_slice(), &[b'$', 4, 0, 3, 1, 2, 3]);
    }

    #[test]
    fn oversized_frame_rejected() {
        let channel = ControlChannel::new(io::sink());
        let payload = vec![0u8; u16::MAX as usize + 1];
        let err = channel.send_interleaved(0, &payload).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}

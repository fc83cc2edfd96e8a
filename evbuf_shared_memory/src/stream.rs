//! Length-prefixed TCP transport for event records
//!
//! Every frame is a 4-byte big-endian byte count followed by that many
//! bytes. Word records travel as big-endian `u32`s, so a frame carrying a
//! ring record is `4 * len` bytes long.
//!
//! Clients reconnect on a fixed interval until the server shows up.
//! `SIGPIPE` is ignored process-wide as soon as a socket is created, so a
//! vanished peer surfaces as an error instead of killing the process.

use crate::error::{ShmError, ShmResult};
use crate::platform::ignore_sigpipe;
use evbuf::consts::{DEFAULT_MAX_FRAME_BYTES, DEFAULT_RETRY_INTERVAL_MS};
use evbuf::shm::consts::WORD_SIZE;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Client reconnect behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause between attempts
    pub interval: Duration,
    /// Give up after this many attempts; 0 retries forever
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_RETRY_INTERVAL_MS),
            max_attempts: 0,
        }
    }
}

/// Server side: accepts framed connections
#[derive(Debug)]
pub struct StreamListener {
    listener: TcpListener,
    max_frame: usize,
}

impl StreamListener {
    /// Listen on `addr` (`"0.0.0.0:5101"`, `"127.0.0.1:0"`, ...).
    pub fn bind(addr: impl ToSocketAddrs) -> ShmResult<Self> {
        ignore_sigpipe();
        let listener = TcpListener::bind(addr)?;
        info!("Listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            max_frame: DEFAULT_MAX_FRAME_BYTES,
        })
    }

    /// Limit applied to sockets returned by [`accept`](Self::accept).
    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// Bound address (useful with port 0).
    pub fn local_addr(&self) -> ShmResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Block until a client connects.
    pub fn accept(&self) -> ShmResult<StreamSocket> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    info!("Accepted connection from {}", peer);
                    return StreamSocket::from_stream(stream, peer, self.max_frame);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// One framed TCP connection
#[derive(Debug)]
pub struct StreamSocket {
    stream: TcpStream,
    peer: SocketAddr,
    max_frame: usize,
}

impl StreamSocket {
    /// Connect to `addr`, retrying per `policy` while the peer is not up.
    pub fn connect(addr: &str, policy: RetryPolicy) -> ShmResult<Self> {
        ignore_sigpipe();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    let peer = stream.peer_addr()?;
                    info!("Connected to {} after {} attempt(s)", peer, attempts);
                    return Self::from_stream(stream, peer, DEFAULT_MAX_FRAME_BYTES);
                }
                Err(e) => {
                    if policy.max_attempts != 0 && attempts >= policy.max_attempts {
                        warn!("Giving up on {} after {} attempts: {}", addr, attempts, e);
                        return Err(ShmError::ConnectFailed {
                            addr: addr.to_string(),
                            attempts,
                        });
                    }
                    debug!("Connect to {} failed ({}), retrying", addr, e);
                    std::thread::sleep(policy.interval);
                }
            }
        }
    }

    fn from_stream(stream: TcpStream, peer: SocketAddr, max_frame: usize) -> ShmResult<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            peer,
            max_frame,
        })
    }

    /// Reject incoming frames above `max_frame` bytes.
    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// Bound how long a read may sit idle; see [`try_get`](Self::try_get).
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> ShmResult<()> {
        Ok(self.stream.set_read_timeout(timeout)?)
    }

    /// Remote address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Send one frame.
    pub fn put(&mut self, frame: &[u8]) -> ShmResult<()> {
        let len = u32::try_from(frame.len()).map_err(|_| ShmError::FrameTooLarge {
            len: frame.len(),
            max: u32::MAX as usize,
        })?;
        self.stream.write_all(&len.to_be_bytes())?;
        self.stream.write_all(frame)?;
        Ok(())
    }

    /// Receive one frame into `buf` (resized to fit). Returns its length.
    pub fn get(&mut self, buf: &mut Vec<u8>) -> ShmResult<usize> {
        loop {
            if let Some(len) = self.try_get(buf)? {
                return Ok(len);
            }
        }
    }

    /// Like [`get`](Self::get), but returns `Ok(None)` if the read timeout
    /// expires before the first byte of a frame arrives.
    ///
    /// Once a frame has started it is always read to the end.
    pub fn try_get(&mut self, buf: &mut Vec<u8>) -> ShmResult<Option<usize>> {
        let mut header = [0u8; 4];
        if !self.read_full(&mut header, true)? {
            return Ok(None);
        }
        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_frame {
            return Err(ShmError::FrameTooLarge {
                len,
                max: self.max_frame,
            });
        }
        buf.clear();
        buf.resize(len, 0);
        self.read_full(buf, false)?;
        Ok(Some(len))
    }

    /// Send a word record as one frame of big-endian words.
    pub fn put_words(&mut self, words: &[u32]) -> ShmResult<()> {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
        self.put(&bytes)
    }

    /// Receive one frame and decode it as big-endian words.
    pub fn get_words(&mut self) -> ShmResult<Vec<u32>> {
        let mut buf = Vec::new();
        self.get(&mut buf)?;
        decode_words(&buf)
    }

    /// [`get_words`](Self::get_words) with idle timeout semantics of
    /// [`try_get`](Self::try_get).
    pub fn try_get_words(&mut self) -> ShmResult<Option<Vec<u32>>> {
        let mut buf = Vec::new();
        match self.try_get(&mut buf)? {
            Some(_) => decode_words(&buf).map(Some),
            None => Ok(None),
        }
    }

    /// Fill `buf` completely. Returns `false` only when `idle_ok` is set and
    /// the read timed out before any byte arrived.
    fn read_full(&mut self, buf: &mut [u8], idle_ok: bool) -> ShmResult<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => return Err(ShmError::ConnectionClosed),
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    if idle_ok && filled == 0 {
                        return Ok(false);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }
}

fn decode_words(bytes: &[u8]) -> ShmResult<Vec<u32>> {
    if bytes.len() % WORD_SIZE != 0 {
        return Err(ShmError::Io {
            source: std::io::Error::new(
                ErrorKind::InvalidData,
                format!("frame of {} bytes is not a whole number of words", bytes.len()),
            ),
        });
    }
    Ok(bytes
        .chunks_exact(WORD_SIZE)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

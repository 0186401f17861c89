//! Peer connection plumbing: the TCP/Unix transport, symmetric connection
//! establishment with retries, the readahead handshake, and the write half
//! used to emit frames.

use std::{
    fs,
    io::{self, Read, Write},
    net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream},
    os::unix::net::{UnixListener, UnixStream},
    path::PathBuf,
    sync::Mutex,
    thread,
    time::{Duration, Instant},
};

use log::{debug, info};

use crate::proto::{self, OpenMode};

pub const DEFAULT_PORT: u16 = 7000;
pub const DEFAULT_TIMEOUT_MS: u64 = 8000;

/// How often a failed connection attempt is retried while the peer is not
/// up yet.
const CONNECT_INTERVAL: Duration = Duration::from_millis(500);

const BASESOCKNAME: &str = "/tmp/sockfile";

/// Name of the socket file used for the local-socket transport.
pub fn sockfile_path(port: u16) -> PathBuf {
    PathBuf::from(format!("{BASESOCKNAME}{port}.sock"))
}

/// One half of the peer connection. `localhost` peers talk over Unix-domain
/// sockets, everything else over TCP.
#[derive(Debug)]
pub enum Transport {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Transport {
    pub fn try_clone(&self) -> io::Result<Self> {
        match self {
            Self::Tcp(s) => s.try_clone().map(Self::Tcp),
            Self::Unix(s) => s.try_clone().map(Self::Unix),
        }
    }

    /// Severs both directions, failing any blocked read or write on either
    /// half.
    pub fn shutdown(&self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.shutdown(Shutdown::Both),
            Self::Unix(s) => s.shutdown(Shutdown::Both),
        }
    }
}

impl Read for Transport {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Unix(s) => s.write(buf),
        }
    }
    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            Self::Unix(s) => s.flush(),
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    fn bind(host: &str, port: u16) -> io::Result<Self> {
        let listener = if host == "localhost" {
            let path = sockfile_path(port);
            // A stale socket file from a crashed run would fail the bind.
            let _ = fs::remove_file(&path);
            let l = UnixListener::bind(&path)?;
            l.set_nonblocking(true)?;
            Self::Unix(l)
        } else {
            let l = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))?;
            l.set_nonblocking(true)?;
            Self::Tcp(l)
        };
        Ok(listener)
    }

    fn try_accept(&self) -> io::Result<Option<Transport>> {
        let accepted = match self {
            Self::Tcp(l) => l.accept().map(|(s, _)| Transport::Tcp(s)),
            Self::Unix(l) => l.accept().map(|(s, _)| Transport::Unix(s)),
        };
        match accepted {
            Ok(stream) => Ok(Some(stream)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn try_connect(host: &str, hostport: u16, limit: Duration) -> io::Result<Option<Transport>> {
    if host == "localhost" {
        match UnixStream::connect(sockfile_path(hostport)) {
            Ok(s) => Ok(Some(Transport::Unix(s))),
            Err(e) if connect_retryable(&e) => Ok(None),
            Err(e) => Err(e),
        }
    } else {
        let ip: Ipv4Addr = host
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid host address"))?;
        let addr = SocketAddr::from((ip, hostport));
        match TcpStream::connect_timeout(&addr, limit.max(Duration::from_millis(1))) {
            Ok(s) => Ok(Some(Transport::Tcp(s))),
            Err(e) if connect_retryable(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn connect_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::TimedOut
    )
}

/// Symmetric connection establishment: listen on the local port while
/// retrying a connect to the peer every [`CONNECT_INTERVAL`], whichever
/// completes first. Fails with `TimedOut` once `timeout` has elapsed.
pub fn establish(host: &str, port: u16, hostport: u16, timeout: Duration) -> io::Result<Transport> {
    let deadline = Instant::now() + timeout;
    let listener = Listener::bind(host, port)?;
    info!("waiting for peer {host}:{hostport} (listening on {port})");

    loop {
        if let Some(stream) = listener.try_accept()? {
            debug!("peer connected to us");
            return finish(stream);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "timed out waiting for the peer",
            ));
        }
        if let Some(stream) = try_connect(host, hostport, remaining.min(CONNECT_INTERVAL))? {
            debug!("connected to peer");
            return finish(stream);
        }
        thread::sleep(remaining.min(CONNECT_INTERVAL));
    }
}

fn finish(stream: Transport) -> io::Result<Transport> {
    match &stream {
        Transport::Tcp(s) => {
            s.set_nodelay(true)?;
            s.set_nonblocking(false)?;
        }
        Transport::Unix(s) => s.set_nonblocking(false)?,
    }
    Ok(stream)
}

/// Removes the socket file of the local-socket transport, if any.
pub fn destroy(host: &str, port: u16) {
    if host == "localhost" {
        let _ = fs::remove_file(sockfile_path(port));
    }
}

/// Write half of the peer connection plus the peer's declared readahead.
///
/// Frame emission is serialized by the write mutex, and every frame is a
/// single `write_all` of one contiguous buffer, so frames from concurrent
/// pipes can never interleave on the stream.
pub struct PeerSocket {
    writer: Mutex<Transport>,
    peer_readahead: usize,
}

impl PeerSocket {
    /// Exchanges readahead declarations over a fresh stream and splits it.
    /// Returns the write side and the read half for the dispatcher.
    pub fn handshake(stream: Transport, local_readahead: usize) -> io::Result<(Self, Transport)> {
        let mut read_half = stream.try_clone()?;
        let mut write_half = stream;
        write_half.write_all(&(local_readahead as u64).to_le_bytes())?;
        let mut raw = [0; 8];
        read_half.read_exact(&mut raw)?;
        let peer_readahead = u64::from_le_bytes(raw) as usize;
        debug!("peer accepts {peer_readahead} readahead bytes");
        Ok((
            Self {
                writer: Mutex::new(write_half),
                peer_readahead,
            },
            read_half,
        ))
    }

    #[cfg(test)]
    pub(crate) fn new(write_half: Transport, peer_readahead: usize) -> Self {
        Self {
            writer: Mutex::new(write_half),
            peer_readahead,
        }
    }

    /// Baseline credit window every pipe starts from.
    #[inline]
    pub fn peer_readahead(&self) -> usize {
        self.peer_readahead
    }

    fn send(&self, frame: Vec<u8>) -> io::Result<()> {
        let mut writer = self.writer.lock().unwrap();
        writer.write_all(&frame)
    }

    pub fn send_open(&self, path: &str, mode: OpenMode) -> io::Result<()> {
        self.send(proto::encode_open(path, mode))
    }

    pub fn send_close(&self, path: &str, mode: OpenMode) -> io::Result<()> {
        self.send(proto::encode_close(path, mode))
    }

    pub fn send_write(&self, path: &str, payload: &[u8]) -> io::Result<()> {
        self.send(proto::encode_write(path, payload))
    }

    pub fn send_read_request(&self, path: &str, size: usize) -> io::Result<()> {
        self.send(proto::encode_read_request(path, size as u64))
    }

    pub fn send_read_ack(&self, path: &str, size: usize) -> io::Result<()> {
        self.send(proto::encode_read_ack(path, size as u64))
    }

    /// Severs the connection, unblocking the dispatcher's pending read.
    pub fn shutdown(&self) {
        let writer = self.writer.lock().unwrap();
        let _ = writer.shutdown();
    }
}

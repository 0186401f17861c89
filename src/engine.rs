//! The long-lived owner of the per-peer machinery.
//!
//! [`Engine`] bundles the open-files registry, the peer socket and the
//! dispatcher thread into one value with a clear lifecycle: created when
//! the connection comes up, shut down exactly once, everything blocked
//! unwound before the threads are joined.

use std::{
    io,
    sync::{Arc, Mutex},
    thread::JoinHandle,
    time::Duration,
};

use log::info;

use crate::{
    config::Config,
    dispatch,
    error::{Error, Result},
    pipe::{PollHandle, Readiness},
    proto::OpenMode,
    registry::Registry,
    socket::{self, PeerSocket, Transport},
};

pub struct Engine {
    registry: Arc<Registry>,
    socket: Arc<PeerSocket>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    /// Set for the local-socket transport so shutdown can unlink the file.
    unix_port: Option<u16>,
}

impl Engine {
    /// Runs the readahead handshake on an established transport and spawns
    /// the dispatcher.
    pub fn start(stream: Transport, readahead: usize, writeahead: usize) -> io::Result<Self> {
        let (peer, read_half) = PeerSocket::handshake(stream, readahead)?;
        let socket = Arc::new(peer);
        let registry = Arc::new(Registry::new(socket.clone(), readahead, writeahead));
        let dispatcher = dispatch::spawn(read_half, registry.clone())?;
        Ok(Self {
            registry,
            socket,
            dispatcher: Mutex::new(Some(dispatcher)),
            unix_port: None,
        })
    }

    /// Full symmetric connection establishment followed by [`Engine::start`].
    pub fn connect(cfg: &Config) -> io::Result<Self> {
        let stream = socket::establish(
            &cfg.host,
            cfg.port,
            cfg.hostport,
            Duration::from_millis(cfg.timeout),
        )?;
        info!("peer connection established");
        let mut engine = Self::start(stream, cfg.readahead, cfg.writeahead)?;
        if cfg.host == "localhost" {
            engine.unix_port = Some(cfg.port);
        }
        Ok(engine)
    }

    /// Opens `path` in `mode`; see [`crate::pipe::Netpipe::open`].
    pub fn open(&self, path: &str, mode: OpenMode, nonblock: bool) -> Result<()> {
        let (pipe, _) = self.registry.get_or_create(path);
        if let Err(e) = pipe.open(mode, nonblock) {
            // A pipe created just for this failed open must not linger.
            self.registry.remove_if_defunct(path);
            return Err(e);
        }
        Ok(())
    }

    pub fn write(&self, path: &str, buf: &[u8], nonblock: bool) -> Result<usize> {
        let pipe = self.registry.get(path).ok_or(Error::Gone)?;
        pipe.send(buf, nonblock)
    }

    pub fn read(&self, path: &str, dst: &mut [u8], nonblock: bool) -> Result<usize> {
        let pipe = self.registry.get(path).ok_or(Error::Gone)?;
        pipe.read(dst, nonblock)
    }

    /// Computes readiness for `path`, parking `handle` (if any) for a
    /// notification on the next state change.
    pub fn poll(&self, path: &str, handle: Option<Box<dyn PollHandle>>) -> Result<Readiness> {
        let pipe = self.registry.get(path).ok_or(Error::Gone)?;
        Ok(pipe.poll(handle))
    }

    pub fn close(&self, path: &str, mode: OpenMode) -> Result<()> {
        let pipe = self.registry.get(path).ok_or(Error::Gone)?;
        if pipe.close(mode)? {
            self.registry.remove_if_defunct(path);
        }
        Ok(())
    }

    /// Number of live registry entries.
    pub fn open_pipes(&self) -> usize {
        self.registry.len()
    }

    /// Severs the peer connection, force-exits every pipe and joins the
    /// dispatcher. Idempotent.
    pub fn shutdown(&self) {
        // The socket goes first: the dispatcher may be blocked mid-payload
        // while holding a pipe lock, and force-exit needs that lock.
        self.socket.shutdown();
        self.registry.shutdown();
        if let Some(handle) = self.dispatcher.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(port) = self.unix_port {
            socket::destroy("localhost", port);
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

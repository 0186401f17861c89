//! The per-path pipe engine.
//!
//! A [`Netpipe`] is the state machine behind one virtual file: it pairs
//! local and remote opens, arbitrates readers, writers and the socket
//! dispatcher over the bounded ring buffer, runs credit-based flow control
//! with readahead/writeahead, and drives blocked requests through an
//! ordered queue. Every field lives under one mutex; the two condition
//! variables (`canopen` for pairing, `drained` for flush-on-close) and each
//! request's private condition variable are always used with that mutex.

use std::{
    collections::VecDeque,
    io::{self, Read},
    sync::{Arc, Condvar, Mutex, MutexGuard},
};

use log::{debug, error, warn};

use crate::{
    error::{Error, Result},
    proto::OpenMode,
    ringbuf::RingBuf,
    socket::PeerSocket,
};

/// Readiness bits computed by [`Netpipe::poll`], using the conventional
/// `poll(2)` flag values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness(pub u32);

impl Readiness {
    pub const IN: u32 = libc::POLLIN as u32;
    pub const OUT: u32 = libc::POLLOUT as u32;
    pub const ERR: u32 = libc::POLLERR as u32;
    pub const HUP: u32 = libc::POLLHUP as u32;

    #[inline]
    pub fn readable(self) -> bool {
        self.0 & Self::IN != 0
    }
    #[inline]
    pub fn writable(self) -> bool {
        self.0 & Self::OUT != 0
    }
    #[inline]
    pub fn error(self) -> bool {
        self.0 & Self::ERR != 0
    }
    #[inline]
    pub fn hangup(self) -> bool {
        self.0 & Self::HUP != 0
    }
}

/// Token parked on a pipe until its readiness changes.
///
/// The filesystem layer implements this over the kernel's poll-notification
/// handle. A handle is consumed exactly once, either by a notification or
/// when the pipe force-exits.
pub trait PollHandle: Send {
    fn notify(self: Box<Self>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReqKind {
    Read,
    Write,
}

/// One blocked read or write.
///
/// Write requests own the bytes that still have to be transmitted or parked
/// in the writeahead ring (`off` counts what has been processed); read
/// requests own the bytes accumulated for the waiter so far. Requests are
/// created under the pipe lock, completed or failed by the dispatcher under
/// the pipe lock, and reclaimed by the originating thread under the pipe
/// lock, so a completion signal can never race past queue removal.
struct Request {
    id: u64,
    kind: ReqKind,
    data: Vec<u8>,
    off: usize,
    size: usize,
    error: Option<Error>,
    cond: Arc<Condvar>,
}

impl Request {
    fn processed(&self) -> usize {
        match self.kind {
            ReqKind::Write => self.off,
            ReqKind::Read => self.data.len(),
        }
    }

    fn complete(&self) -> bool {
        self.processed() == self.size
    }
}

struct State {
    /// Local role; `None` while no local opener exists.
    mode: Option<OpenMode>,
    local_readers: usize,
    local_writers: usize,
    remote_readers: usize,
    remote_writers: usize,
    /// Readahead ring on a reading host, writeahead ring on a writing one.
    buffer: RingBuf,
    /// Bytes the peer is currently willing to accept.
    remote_max: usize,
    /// Bytes sent but not yet acknowledged. Never exceeds `remote_max`.
    remote_in_flight: usize,
    queue: VecDeque<Request>,
    /// Requests the dispatcher finished; the waiters reclaim them here.
    finished: Vec<Request>,
    poll_handles: Vec<Box<dyn PollHandle>>,
    force_exit: bool,
    next_id: u64,
}

impl State {
    #[inline]
    fn available_remote(&self) -> usize {
        self.remote_max - self.remote_in_flight
    }

    fn paired(&self) -> bool {
        self.local_readers + self.remote_readers > 0
            && self.local_writers + self.remote_writers > 0
    }

    fn defunct(&self) -> bool {
        self.local_readers == 0
            && self.local_writers == 0
            && self.remote_readers == 0
            && self.remote_writers == 0
            && self.remote_in_flight == 0
    }

    fn size_buffer(&mut self, capacity: usize) {
        if self.buffer.capacity() == 0 && capacity > 0 {
            self.buffer = RingBuf::new(capacity);
        }
    }

    fn add_request(&mut self, kind: ReqKind, data: Vec<u8>, size: usize) -> (u64, Arc<Condvar>) {
        let id = self.next_id;
        self.next_id += 1;
        let cond = Arc::new(Condvar::new());
        self.queue.push_back(Request {
            id,
            kind,
            data,
            off: 0,
            size,
            error: None,
            cond: cond.clone(),
        });
        (id, cond)
    }

    /// Signals the queue head and moves it to the finished pile.
    fn finish_front(&mut self) {
        if let Some(req) = self.queue.pop_front() {
            req.cond.notify_one();
            self.finished.push(req);
        }
    }

    /// Fails every queued request and signals its waiter.
    fn fail_all(&mut self, err: impl Fn() -> Error) {
        while let Some(mut req) = self.queue.pop_front() {
            req.error = Some(err());
            req.cond.notify_one();
            self.finished.push(req);
        }
    }

    fn take_finished(&mut self, id: u64) -> Option<Request> {
        let pos = self.finished.iter().position(|r| r.id == id)?;
        Some(self.finished.swap_remove(pos))
    }

    fn take_queued(&mut self, id: u64) -> Option<Request> {
        let pos = self.queue.iter().position(|r| r.id == id)?;
        self.queue.remove(pos)
    }

    /// Fires and releases every parked poll handle.
    fn notify_pollers(&mut self) {
        for handle in self.poll_handles.drain(..) {
            handle.notify();
        }
    }
}

/// Per-path pipe: the hub the filesystem workers and the socket dispatcher
/// meet at.
pub struct Netpipe {
    path: String,
    socket: Arc<PeerSocket>,
    readahead: usize,
    writeahead: usize,
    state: Mutex<State>,
    canopen: Condvar,
    drained: Condvar,
}

impl Netpipe {
    pub(crate) fn new(
        path: &str,
        socket: Arc<PeerSocket>,
        readahead: usize,
        writeahead: usize,
    ) -> Self {
        let remote_max = socket.peer_readahead();
        Self {
            path: path.to_owned(),
            socket,
            readahead,
            writeahead,
            state: Mutex::new(State {
                mode: None,
                local_readers: 0,
                local_writers: 0,
                remote_readers: 0,
                remote_writers: 0,
                buffer: RingBuf::new(0),
                remote_max,
                remote_in_flight: 0,
                queue: VecDeque::new(),
                finished: Vec::new(),
                poll_handles: Vec::new(),
                force_exit: false,
                next_id: 0,
            }),
            canopen: Condvar::new(),
            drained: Condvar::new(),
        }
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub(crate) fn is_defunct(&self) -> bool {
        self.lock().defunct()
    }

    /// Opens the local end in `mode` and blocks until the path has at least
    /// one reader and one writer across both hosts (unless `nonblock`).
    ///
    /// Only the exclusive modes exist; a host never carries both roles for
    /// one path, the opposite role lives on the peer.
    pub fn open(&self, mode: OpenMode, nonblock: bool) -> Result<()> {
        let mut st = self.lock();
        if st.force_exit {
            return Err(Error::Gone);
        }
        if st.mode.is_some_and(|m| m != mode) {
            return Err(Error::RoleConflict);
        }
        match mode {
            OpenMode::Read => st.local_readers += 1,
            OpenMode::Write => st.local_writers += 1,
        }
        if st.mode.is_none() {
            st.mode = Some(mode);
            let capacity = match mode {
                OpenMode::Read => self.readahead,
                OpenMode::Write => self.writeahead,
            };
            st.size_buffer(capacity);
        }
        // The nonblocking pairing check runs before the OPEN frame goes out,
        // so a failed open is invisible to the peer.
        if nonblock && !st.paired() {
            self.undo_open(&mut st, mode);
            return Err(Error::WouldBlock);
        }
        self.canopen.notify_all();
        if let Err(e) = self.socket.send_open(&self.path, mode) {
            self.undo_open(&mut st, mode);
            return Err(Error::Transport(e));
        }
        while !st.force_exit && !st.paired() {
            st = self.canopen.wait(st).unwrap();
        }
        if st.force_exit {
            self.undo_open(&mut st, mode);
            return Err(Error::Gone);
        }
        debug!(
            "open[{}] readers {}+{} writers {}+{}",
            self.path, st.local_readers, st.remote_readers, st.local_writers, st.remote_writers
        );
        Ok(())
    }

    fn undo_open(&self, st: &mut State, mode: OpenMode) {
        match mode {
            OpenMode::Read => st.local_readers -= 1,
            OpenMode::Write => st.local_writers -= 1,
        }
        if st.local_readers == 0 && st.local_writers == 0 {
            st.mode = None;
        }
    }

    /// Remote OPEN observed by the dispatcher.
    pub(crate) fn open_update(&self, mode: OpenMode) {
        let mut st = self.lock();
        match mode {
            OpenMode::Read => st.remote_readers += 1,
            OpenMode::Write => st.remote_writers += 1,
        }
        // A remote writer makes this the reading side and vice versa.
        let capacity = match mode {
            OpenMode::Write => self.readahead,
            OpenMode::Read => self.writeahead,
        };
        st.size_buffer(capacity);
        debug!(
            "open_update[{}] readers {}+{} writers {}+{}",
            self.path, st.local_readers, st.remote_readers, st.local_writers, st.remote_writers
        );
        self.canopen.notify_all();
    }

    /// Writer path. Transmits directly while the peer has credit, parks the
    /// remainder in the writeahead ring, and blocks on a queued request for
    /// whatever is left (unless `nonblock`). Returns how many bytes were
    /// accepted.
    pub fn send(&self, buf: &[u8], nonblock: bool) -> Result<usize> {
        let mut st = self.lock();
        if st.force_exit || st.remote_readers == 0 {
            return Err(Error::BrokenPipe);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let mut sent = 0;
        // Fast path: the peer can take bytes right now and nothing is
        // queued ahead of us in the ring.
        if st.available_remote() > 0 && (st.buffer.is_empty() || st.buffer.capacity() == 0) {
            let n = buf.len().min(st.available_remote());
            self.socket.send_write(&self.path, &buf[..n])?;
            st.remote_in_flight += n;
            sent += n;
            debug!("send[{}] {n} bytes", self.path);
        }
        if sent < buf.len() {
            let n = st.buffer.put(&buf[sent..]);
            if n > 0 {
                debug!("writeahead[{}] {n} bytes", self.path);
            }
            sent += n;
        }
        if sent == buf.len() || nonblock {
            if sent == 0 {
                return Err(Error::WouldBlock);
            }
            return Ok(sent);
        }

        let remaining = buf.len() - sent;
        let (id, cond) = st.add_request(ReqKind::Write, buf[sent..].to_vec(), remaining);
        let (_st, req) = self.wait_request(st, id, &cond);
        let total = sent + req.processed();
        if total == 0 {
            return Err(req.error.unwrap_or(Error::BrokenPipe));
        }
        Ok(total)
    }

    /// Reader path. Drains the readahead ring first (returning credit to
    /// the peer for every byte so drained), then blocks on a queued request
    /// for the remainder. A missing remote writer turns the partial count
    /// into a clean EOF.
    pub fn read(&self, dst: &mut [u8], nonblock: bool) -> Result<usize> {
        let mut st = self.lock();
        if st.force_exit {
            return Err(Error::BrokenPipe);
        }
        if dst.is_empty() {
            return Ok(0);
        }
        let mut count = st.buffer.get(dst);
        if count > 0 {
            debug!("buffered read[{}] {count} bytes", self.path);
            if let Err(e) = self.socket.send_read_ack(&self.path, count) {
                warn!("read ack for {} failed: {e}", self.path);
                return Ok(count);
            }
        }
        if count == dst.len() || nonblock {
            if count == 0 {
                return Err(Error::WouldBlock);
            }
            return Ok(count);
        }
        if st.remote_writers == 0 {
            return Ok(count);
        }

        let remaining = dst.len() - count;
        let (id, cond) = st.add_request(ReqKind::Read, Vec::with_capacity(remaining), remaining);
        // Ask the peer to grow its send window by what we still need.
        if let Err(e) = self.socket.send_read_request(&self.path, remaining) {
            st.take_queued(id);
            if count > 0 {
                warn!("read request for {} failed: {e}", self.path);
                return Ok(count);
            }
            return Err(Error::Transport(e));
        }
        let (_st, req) = self.wait_request(st, id, &cond);
        dst[count..count + req.data.len()].copy_from_slice(&req.data);
        count += req.data.len();
        if count == 0 {
            return match req.error {
                // The writer left; whatever was delivered is the EOF.
                Some(Error::BrokenPipe) => Ok(0),
                Some(e) => Err(e),
                None => Err(Error::BrokenPipe),
            };
        }
        Ok(count)
    }

    /// Blocks until the request identified by `id` has been finished by the
    /// dispatcher or the pipe force-exits, then reclaims it. Runs under the
    /// pipe lock; the lock is released while waiting.
    fn wait_request<'a>(
        &'a self,
        mut st: MutexGuard<'a, State>,
        id: u64,
        cond: &Condvar,
    ) -> (MutexGuard<'a, State>, Request) {
        loop {
            if let Some(req) = st.take_finished(id) {
                return (st, req);
            }
            if st.force_exit {
                if let Some(req) = st.take_queued(id) {
                    return (st, req);
                }
            }
            st = cond.wait(st).unwrap();
        }
    }

    /// Dispatcher callback for an incoming WRITE whose `size` payload bytes
    /// are still on the socket. The whole payload is consumed here: queued
    /// read requests are fed first (from ring leftovers, then straight off
    /// the socket), the rest lands in the readahead ring, and one READ_ACK
    /// returns credit for everything that reached a request.
    pub(crate) fn recv<R: Read>(&self, sock: &mut R, size: usize) -> io::Result<()> {
        let mut st = self.lock();
        let mut delivered = 0;
        let mut remaining = size;

        // Ring leftovers feed queued requests first so byte order holds.
        loop {
            if st.buffer.is_empty() {
                break;
            }
            let want = match st.queue.front() {
                Some(req) if req.kind == ReqKind::Read => req.size - req.data.len(),
                _ => break,
            };
            let chunk = st.buffer.get_vec(want);
            if chunk.is_empty() {
                break;
            }
            delivered += chunk.len();
            debug!("buffered read[{}] {} bytes", self.path, chunk.len());
            let done = match st.queue.front_mut() {
                Some(req) => {
                    req.data.extend_from_slice(&chunk);
                    req.complete()
                }
                None => break,
            };
            if done {
                st.finish_front();
            } else {
                break;
            }
        }

        // Then straight from the socket into requests, no intermediate copy.
        while remaining > 0 && st.buffer.is_empty() {
            let want = match st.queue.front() {
                Some(req) if req.kind == ReqKind::Read => {
                    (req.size - req.data.len()).min(remaining)
                }
                _ => break,
            };
            let done = match st.queue.front_mut() {
                Some(req) => {
                    let at = req.data.len();
                    req.data.resize(at + want, 0);
                    sock.read_exact(&mut req.data[at..at + want])?;
                    req.complete()
                }
                None => break,
            };
            remaining -= want;
            delivered += want;
            debug!("read[{}] {want} bytes", self.path);
            if done {
                st.finish_front();
            }
        }

        // Whatever is left goes into the readahead ring.
        if remaining > 0 {
            let n = st.buffer.read_from(sock, remaining)?;
            remaining -= n;
            if n > 0 {
                debug!("readahead[{}] {n} bytes", self.path);
            }
        }
        if remaining > 0 {
            // The peer overran our window. Drain anyway: the dispatcher
            // cannot re-enter the next frame boundary otherwise.
            error!(
                "{}: {remaining} payload bytes exceed the receive window, discarding",
                self.path
            );
            io::copy(&mut sock.by_ref().take(remaining as u64), &mut io::sink())?;
        }

        if delivered > 0 {
            self.socket.send_read_ack(&self.path, delivered)?;
        }
        st.notify_pollers();
        Ok(())
    }

    /// Dispatcher callback: the peer's reader wants `size` more bytes, so
    /// its window grows and parked output gets another chance to leave.
    pub(crate) fn read_request(&self, size: usize) -> io::Result<()> {
        let mut st = self.lock();
        st.remote_max = st.remote_max.saturating_add(size);
        self.drain_outbox(&mut st)?;
        st.notify_pollers();
        Ok(())
    }

    /// Dispatcher callback: the peer consumed `size` bytes. Credit returns,
    /// and the window shrinks back towards the baseline readahead it was
    /// grown from.
    pub(crate) fn read_update(&self, size: usize) -> io::Result<()> {
        let mut st = self.lock();
        let baseline = self.socket.peer_readahead();
        st.remote_max = st.remote_max.saturating_sub(size).max(baseline);
        st.remote_in_flight = st.remote_in_flight.saturating_sub(size);
        self.drain_outbox(&mut st)?;
        st.notify_pollers();
        Ok(())
    }

    /// Sends as much parked output as the credit window allows: flushes the
    /// writeahead ring, then transmits straight from queued write requests,
    /// then tops the ring back up from whatever is still queued. Runs under
    /// the pipe lock.
    fn drain_outbox(&self, st: &mut State) -> io::Result<()> {
        let n = st.buffer.len().min(st.available_remote());
        if n > 0 {
            let chunk = st.buffer.get_vec(n);
            self.socket.send_write(&self.path, &chunk)?;
            st.remote_in_flight += n;
            debug!("flush[{}] {n} bytes", self.path);
            if st.local_writers == 0 && st.buffer.is_empty() {
                self.drained.notify_all();
            }
        }

        loop {
            let available = st.available_remote();
            if available == 0 {
                break;
            }
            let step = match st.queue.front_mut() {
                Some(req) if req.kind == ReqKind::Write => {
                    let want = (req.size - req.off).min(available);
                    match self
                        .socket
                        .send_write(&self.path, &req.data[req.off..req.off + want])
                    {
                        Ok(()) => {
                            req.off += want;
                            Ok((want, req.complete()))
                        }
                        Err(e) => Err(e),
                    }
                }
                _ => break,
            };
            match step {
                Ok((n, done)) => {
                    st.remote_in_flight += n;
                    debug!("send[{}] {n} bytes", self.path);
                    if done {
                        st.finish_front();
                    }
                }
                Err(e) => {
                    if let Some(req) = st.queue.front_mut() {
                        req.error = Some(Error::Transport(io::Error::from(e.kind())));
                    }
                    st.finish_front();
                    return Err(e);
                }
            }
        }

        // Park what is still queued into the writeahead ring.
        loop {
            if st.buffer.capacity() == 0 || st.buffer.is_full() {
                break;
            }
            let State {
                ref mut buffer,
                ref mut queue,
                ..
            } = *st;
            let Some(req) = queue.front_mut() else { break };
            if req.kind != ReqKind::Write {
                break;
            }
            let n = buffer.put(&req.data[req.off..]);
            if n == 0 {
                break;
            }
            req.off += n;
            debug!("writeahead[{}] {n} bytes", self.path);
            if req.complete() {
                st.finish_front();
            } else {
                break;
            }
        }
        Ok(())
    }

    /// Computes readiness and, when `handle` is given, parks it for a
    /// notification on the next state change.
    pub fn poll(&self, handle: Option<Box<dyn PollHandle>>) -> Readiness {
        let mut st = self.lock();
        if let Some(ph) = handle {
            st.poll_handles.push(ph);
        }
        let mut bits = 0;
        if st.force_exit {
            bits |= Readiness::HUP | Readiness::ERR;
        } else {
            match st.mode {
                Some(OpenMode::Read) => {
                    if !st.buffer.is_empty() || st.remote_writers > 0 {
                        bits |= Readiness::IN;
                    } else {
                        bits |= Readiness::HUP;
                    }
                }
                Some(OpenMode::Write) => {
                    if st.remote_readers == 0 {
                        bits |= Readiness::ERR;
                    } else if st.available_remote() + st.buffer.free() > 0 {
                        bits |= Readiness::OUT;
                    }
                }
                None => {}
            }
        }
        Readiness(bits)
    }

    /// Local close. The last local writer flushes the writeahead ring as far
    /// as credit allows and waits until it drains, the peer's readers leave,
    /// or the pipe force-exits. Returns whether the pipe became defunct and
    /// should be unlinked from the registry.
    pub fn close(&self, mode: OpenMode) -> Result<bool> {
        let mut st = self.lock();
        let counted = match mode {
            OpenMode::Read => st.local_readers,
            OpenMode::Write => st.local_writers,
        };
        if st.mode != Some(mode) || counted == 0 {
            return Err(Error::NotOpened);
        }
        match mode {
            OpenMode::Read => st.local_readers -= 1,
            OpenMode::Write => {
                st.local_writers -= 1;
                if !st.force_exit
                    && st.local_writers == 0
                    && st.remote_readers > 0
                    && !st.buffer.is_empty()
                {
                    if let Err(e) = self.drain_outbox(&mut st) {
                        warn!("flush on close of {} failed: {e}", self.path);
                    }
                    while !st.force_exit && st.remote_readers > 0 && !st.buffer.is_empty() {
                        st = self.drained.wait(st).unwrap();
                    }
                }
            }
        }
        if st.local_readers == 0 && st.local_writers == 0 {
            st.mode = None;
        }
        st.notify_pollers();
        if let Err(e) = self.socket.send_close(&self.path, mode) {
            warn!("close frame for {} failed: {e}", self.path);
        }
        debug!(
            "close[{}] readers {}+{} writers {}+{}",
            self.path, st.local_readers, st.remote_readers, st.local_writers, st.remote_writers
        );
        Ok(st.defunct())
    }

    /// Remote CLOSE observed by the dispatcher. When the last remote
    /// participant of a role leaves, every queued request fails with
    /// broken-pipe; a departed reader also resets the credit window to its
    /// baseline. Returns whether the pipe became defunct.
    pub(crate) fn close_update(&self, mode: OpenMode) -> bool {
        let mut st = self.lock();
        match mode {
            OpenMode::Write => {
                st.remote_writers = st.remote_writers.saturating_sub(1);
                if st.remote_writers == 0 {
                    st.fail_all(|| Error::BrokenPipe);
                }
            }
            OpenMode::Read => {
                st.remote_readers = st.remote_readers.saturating_sub(1);
                if st.remote_readers == 0 {
                    st.remote_in_flight = 0;
                    st.remote_max = self.socket.peer_readahead();
                    st.fail_all(|| Error::BrokenPipe);
                    // A writer blocked in close() waits for readers or an
                    // empty ring; the readers are gone now.
                    self.drained.notify_all();
                }
            }
        }
        st.notify_pollers();
        debug!(
            "close_update[{}] readers {}+{} writers {}+{}",
            self.path, st.local_readers, st.remote_readers, st.local_writers, st.remote_writers
        );
        st.defunct()
    }

    /// Sticky teardown: every waiter wakes with a terminal error and every
    /// parked poll handle fires. Subsequent operations reject with *gone*.
    pub(crate) fn force_exit(&self) {
        let mut st = self.lock();
        st.force_exit = true;
        self.canopen.notify_all();
        self.drained.notify_all();
        for req in &st.queue {
            req.cond.notify_one();
        }
        st.notify_pollers();
    }
}

//! FUSE adapter: bridges the kernel's filesystem callbacks onto the pipe
//! engine.
//!
//! Everything here is glue — inode and handle bookkeeping, attribute stubs
//! and errno mapping. The pipe semantics live in [`crate::pipe`]; every
//! file is opened `direct_io` and `nonseekable` so read/write return values
//! pass straight through to the caller.

use std::{
    collections::HashMap,
    ffi::OsStr,
    io,
    sync::{Arc, Mutex, OnceLock},
    time::{Duration, SystemTime},
};

use fuser::{
    Errno, FileAttr, FileHandle, FileType, Filesystem, FopenFlags, Generation, INodeNo,
    KernelConfig, OpenFlags, PollEvents, PollFlags, PollNotifier, ReplyAttr, ReplyCreate,
    ReplyData, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyPoll, ReplyWrite, Request,
};
use log::{debug, warn};

use crate::{
    config::Config,
    engine::Engine,
    error::Error,
    pipe::PollHandle,
    proto::OpenMode,
};

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

/// Engine slot shared between the mounted filesystem, the signal handler
/// and main. Filled before mounting, or from the `init` callback when
/// `--delayconnect` asks for the connection to wait for the mount point.
pub struct EngineCell {
    config: Config,
    engine: OnceLock<Arc<Engine>>,
}

impl EngineCell {
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Establishes the peer connection and publishes the engine.
    pub fn connect(&self) -> io::Result<()> {
        let engine = Engine::connect(&self.config)?;
        let _ = self.engine.set(Arc::new(engine));
        Ok(())
    }

    fn get(&self) -> Option<&Arc<Engine>> {
        self.engine.get()
    }

    /// Force-exits every pipe and severs the peer connection, if one was
    /// ever established.
    pub fn shutdown(&self) {
        if let Some(engine) = self.engine.get() {
            engine.shutdown();
        }
    }
}

struct Inodes {
    by_path: HashMap<String, u64>,
    by_ino: HashMap<u64, String>,
    next: u64,
}

impl Inodes {
    fn new() -> Self {
        Self {
            by_path: HashMap::new(),
            by_ino: HashMap::new(),
            next: ROOT_INO + 1,
        }
    }

    fn intern(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.by_path.get(path) {
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_path.insert(path.to_owned(), ino);
        self.by_ino.insert(ino, path.to_owned());
        ino
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.by_ino.get(&ino).cloned()
    }
}

struct OpenFile {
    path: String,
    mode: OpenMode,
    nonblock: bool,
}

/// Adapts the fuser callback surface onto an [`Engine`].
pub struct NetpipeFs {
    cell: Arc<EngineCell>,
    inodes: Mutex<Inodes>,
    handles: Mutex<HashMap<u64, OpenFile>>,
    next_fh: Mutex<u64>,
}

impl NetpipeFs {
    pub fn new(config: Config) -> (Self, Arc<EngineCell>) {
        let cell = Arc::new(EngineCell {
            config,
            engine: OnceLock::new(),
        });
        (
            Self {
                cell: cell.clone(),
                inodes: Mutex::new(Inodes::new()),
                handles: Mutex::new(HashMap::new()),
                next_fh: Mutex::new(1),
            },
            cell,
        )
    }

    fn engine(&self) -> Result<Arc<Engine>, Errno> {
        self.cell.get().cloned().ok_or(Errno::EIO)
    }

    fn errno(e: &Error) -> Errno {
        match e {
            Error::Gone => Errno::ENOENT,
            Error::BrokenPipe => Errno::EPIPE,
            Error::RoleConflict | Error::NotOpened => Errno::EPERM,
            Error::WouldBlock => Errno::EAGAIN,
            Error::Protocol(..) | Error::Transport(..) => Errno::EIO,
        }
    }

    fn root_attr() -> FileAttr {
        let now = SystemTime::now();
        FileAttr {
            ino: INodeNo(ROOT_INO),
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind: FileType::Directory,
            perm: 0o755,
            nlink: 2,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    /// Pipes have no size or position; the attributes are stubs.
    fn file_attr(ino: u64) -> FileAttr {
        let now = SystemTime::now();
        FileAttr {
            ino: INodeNo(ino),
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind: FileType::RegularFile,
            perm: 0o644,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    fn child_path(name: &OsStr) -> Option<String> {
        let name = name.to_str()?;
        Some(format!("/{name}"))
    }

    /// Maps open(2) flags onto an exclusive pipe role. Read-write access
    /// has no meaning on a unidirectional stream.
    fn parse_flags(raw: i32) -> Result<(OpenMode, bool), Errno> {
        let mode = match raw & libc::O_ACCMODE {
            libc::O_RDONLY => OpenMode::Read,
            libc::O_WRONLY => OpenMode::Write,
            _ => return Err(Errno::EINVAL),
        };
        Ok((mode, raw & libc::O_NONBLOCK != 0))
    }

    fn do_open(&self, ino: u64, raw_flags: i32) -> Result<u64, Errno> {
        let path = self
            .inodes
            .lock()
            .unwrap()
            .path_of(ino)
            .ok_or(Errno::ENOENT)?;
        let (mode, nonblock) = Self::parse_flags(raw_flags)?;
        let engine = self.engine()?;
        engine
            .open(&path, mode, nonblock)
            .map_err(|e| Self::errno(&e))?;
        let fh = {
            let mut next = self.next_fh.lock().unwrap();
            let fh = *next;
            *next += 1;
            fh
        };
        self.handles.lock().unwrap().insert(
            fh,
            OpenFile {
                path,
                mode,
                nonblock,
            },
        );
        Ok(fh)
    }

    fn handle(&self, fh: u64) -> Result<(String, OpenMode, bool), Errno> {
        let handles = self.handles.lock().unwrap();
        let file = handles.get(&fh).ok_or(Errno::EBADF)?;
        Ok((file.path.clone(), file.mode, file.nonblock))
    }
}

/// Carries the kernel's poll notification token into the pipe engine.
struct FusePollHandle {
    inner: PollNotifier,
}

impl PollHandle for FusePollHandle {
    fn notify(self: Box<Self>) {
        if let Err(e) = self.inner.notify() {
            warn!("poll notification failed: {e}");
        }
    }
}

impl Filesystem for NetpipeFs {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> io::Result<()> {
        if self.cell.config().delayconnect && self.cell.get().is_none() {
            self.cell.connect()?;
        }
        Ok(())
    }

    fn destroy(&mut self) {
        debug!("filesystem destroyed, shutting the engine down");
        self.cell.shutdown();
    }

    /// Every name below the root resolves: pipes spring into existence on
    /// first use, exactly like the paths themselves.
    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        if parent.0 != ROOT_INO {
            reply.error(Errno::ENOENT);
            return;
        }
        let Some(path) = Self::child_path(name) else {
            reply.error(Errno::ENOENT);
            return;
        };
        let ino = self.inodes.lock().unwrap().intern(&path);
        reply.entry(&TTL, &Self::file_attr(ino), Generation(0));
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, _fh: Option<FileHandle>, reply: ReplyAttr) {
        if ino.0 == ROOT_INO {
            reply.attr(&TTL, &Self::root_attr());
        } else if self.inodes.lock().unwrap().path_of(ino.0).is_some() {
            reply.attr(&TTL, &Self::file_attr(ino.0));
        } else {
            reply.error(Errno::ENOENT);
        }
    }

    fn open(&self, _req: &Request, ino: INodeNo, flags: OpenFlags, reply: ReplyOpen) {
        match self.do_open(ino.0, flags.0) {
            Ok(fh) => reply.opened(
                FileHandle(fh),
                FopenFlags::FOPEN_DIRECT_IO | FopenFlags::FOPEN_NONSEEKABLE,
            ),
            Err(errno) => reply.error(errno),
        }
    }

    fn create(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        if parent.0 != ROOT_INO {
            reply.error(Errno::ENOENT);
            return;
        }
        let Some(path) = Self::child_path(name) else {
            reply.error(Errno::ENOENT);
            return;
        };
        let ino = self.inodes.lock().unwrap().intern(&path);
        match self.do_open(ino, flags) {
            Ok(fh) => reply.created(
                &TTL,
                &Self::file_attr(ino),
                Generation(0),
                FileHandle(fh),
                FopenFlags::FOPEN_DIRECT_IO | FopenFlags::FOPEN_NONSEEKABLE,
            ),
            Err(errno) => reply.error(errno),
        }
    }

    fn read(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _offset: u64,
        size: u32,
        _flags: OpenFlags,
        _lock_owner: Option<fuser::LockOwner>,
        reply: ReplyData,
    ) {
        let (path, _, nonblock) = match self.handle(fh.0) {
            Ok(h) => h,
            Err(errno) => return reply.error(errno),
        };
        let engine = match self.engine() {
            Ok(e) => e,
            Err(errno) => return reply.error(errno),
        };
        let mut buf = vec![0; size as usize];
        match engine.read(&path, &mut buf, nonblock) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(Self::errno(&e)),
        }
    }

    fn write(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _offset: u64,
        data: &[u8],
        _write_flags: fuser::WriteFlags,
        _flags: OpenFlags,
        _lock_owner: Option<fuser::LockOwner>,
        reply: ReplyWrite,
    ) {
        let (path, _, nonblock) = match self.handle(fh.0) {
            Ok(h) => h,
            Err(errno) => return reply.error(errno),
        };
        let engine = match self.engine() {
            Ok(e) => e,
            Err(errno) => return reply.error(errno),
        };
        match engine.write(&path, data, nonblock) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(Self::errno(&e)),
        }
    }

    fn flush(
        &self,
        _req: &Request,
        _ino: INodeNo,
        _fh: FileHandle,
        _lock_owner: fuser::LockOwner,
        reply: ReplyEmpty,
    ) {
        // Draining on the final close happens in release; per-descriptor
        // flushes have nothing to do on a pipe.
        reply.ok();
    }

    fn poll(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        ph: PollNotifier,
        _events: PollEvents,
        _flags: PollFlags,
        reply: ReplyPoll,
    ) {
        let (path, _, _) = match self.handle(fh.0) {
            Ok(h) => h,
            Err(errno) => return reply.error(errno),
        };
        let engine = match self.engine() {
            Ok(e) => e,
            Err(errno) => return reply.error(errno),
        };
        let handle: Box<dyn PollHandle> = Box::new(FusePollHandle { inner: ph });
        match engine.poll(&path, Some(handle)) {
            Ok(readiness) => reply.poll(PollEvents::from_bits_truncate(readiness.0 as _)),
            Err(e) => reply.error(Self::errno(&e)),
        }
    }

    fn release(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _flags: OpenFlags,
        _lock_owner: Option<fuser::LockOwner>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let Some(file) = self.handles.lock().unwrap().remove(&fh.0) else {
            reply.error(Errno::EBADF);
            return;
        };
        let engine = match self.engine() {
            Ok(e) => e,
            Err(errno) => return reply.error(errno),
        };
        match engine.close(&file.path, file.mode) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(Self::errno(&e)),
        }
    }
}

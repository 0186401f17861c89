use std::{
    error::Error as StdError,
    fmt::{self, Display, Formatter},
    io,
};

/// Failure taxonomy surfaced by the pipe engine.
///
/// Every error is a plain value carried back to the caller (or stored on a
/// blocked request and delivered when it wakes); there is no out-of-band
/// failure channel.
#[derive(Debug)]
pub enum Error {
    /// The pipe is being torn down; nothing can run on it anymore.
    Gone,
    /// The opposite side has gone away and no data remains.
    BrokenPipe,
    /// The path is already open on this host in the opposite mode.
    RoleConflict,
    /// A nonblocking operation could not make progress.
    WouldBlock,
    /// Close in a mode that was never opened on this host.
    NotOpened,
    /// A frame that cannot be honored (unknown path, malformed header).
    Protocol(&'static str),
    /// I/O failure on the peer socket.
    Transport(io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The errno equivalent handed back through the filesystem boundary.
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::Gone => libc::ENOENT,
            Self::BrokenPipe => libc::EPIPE,
            Self::RoleConflict | Self::NotOpened => libc::EPERM,
            Self::WouldBlock => libc::EAGAIN,
            Self::Protocol(..) => libc::EPROTO,
            Self::Transport(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Whether the error reports a nonblocking operation that would block.
    #[inline]
    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::WouldBlock)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gone => f.write_str("pipe is being torn down"),
            Self::BrokenPipe => f.write_str("broken pipe"),
            Self::RoleConflict => f.write_str("path is already open in the opposite mode"),
            Self::WouldBlock => f.write_str("operation would block"),
            Self::NotOpened => f.write_str("not opened in this mode"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Transport(e) => write!(f, "peer socket failure: {e}"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(e: io::Error) -> Self {
        Self::Transport(e)
    }
}

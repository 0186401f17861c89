//! Command-line options.

use std::{net::Ipv4Addr, path::PathBuf};

use clap::Parser;

use crate::socket::{DEFAULT_PORT, DEFAULT_TIMEOUT_MS};

/// How many bytes may be buffered locally to anticipate reads.
pub const DEFAULT_READAHEAD: usize = 4096;
/// How many bytes a writer may stage locally while the peer has no credit.
pub const DEFAULT_WRITEAHEAD: usize = 4096;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "netpipefs",
    version,
    about = "Filesystem exposing remote byte streams as local files with pipe semantics"
)]
pub struct Config {
    /// Directory to mount the filesystem on.
    pub mountpoint: PathBuf,

    /// Remote host IPv4 address; `localhost` switches to Unix-domain
    /// sockets (`/tmp/sockfile<port>.sock`).
    #[arg(long)]
    pub host: String,

    /// Local port used for the socket connection.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Remote port used for the socket connection.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub hostport: u16,

    /// Connection timeout in milliseconds.
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS)]
    pub timeout: u64,

    /// How many bytes can be received and buffered to anticipate read
    /// requests. 0 disables readahead.
    #[arg(long, default_value_t = DEFAULT_READAHEAD)]
    pub readahead: usize,

    /// How many bytes can be buffered on write requests while the remote
    /// host cannot receive data. 0 disables writeahead.
    #[arg(long, default_value_t = DEFAULT_WRITEAHEAD)]
    pub writeahead: usize,

    /// Connect to the host only after the filesystem is mounted.
    #[arg(long)]
    pub delayconnect: bool,

    /// Verbose logging; implies foreground operation.
    #[arg(short, long)]
    pub debug: bool,
}

impl Config {
    /// Checks option combinations that clap cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.host != "localhost" && self.host.parse::<Ipv4Addr>().is_err() {
            return Err(format!("invalid host ip address '{}'", self.host));
        }
        if self.host == "localhost" && self.port == self.hostport {
            return Err("local and remote port must differ when host is localhost".into());
        }
        Ok(())
    }
}

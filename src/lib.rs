//! NetpipeFS: a user-space filesystem that exposes remote byte streams as
//! local files with anonymous-pipe semantics.
//!
//! Two cooperating instances, each mounted on a different host, negotiate a
//! symmetric socket connection at startup. Any path opened for writing on
//! one side is implicitly paired with the same path opened for reading on
//! the other; bytes written on one host appear on the read end of the peer
//! and nothing is ever persisted.
//!
//! The whole core — circular buffer, framed wire codec, open-files
//! registry, per-path pipe engine and socket dispatcher — lives behind the
//! [`Engine`] owner value and needs no mounted filesystem, so it can be
//! driven directly over any byte stream (the integration tests connect two
//! engines over a Unix socket pair). The [`fs`] module adds the FUSE
//! adapter the binary mounts.

pub mod config;
mod dispatch;
pub mod engine;
pub mod error;
pub mod fs;
pub mod pipe;
pub mod proto;
mod registry;
mod ringbuf;
pub mod shutdown;
pub mod socket;

pub use crate::{
    engine::Engine,
    error::{Error, Result},
    pipe::{PollHandle, Readiness},
    proto::OpenMode,
};

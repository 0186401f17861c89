//! The socket dispatcher: a single thread owning the read half of the peer
//! connection, demultiplexing incoming frames onto pipes.

use std::{
    io::{self, Read},
    sync::Arc,
    thread,
};

use log::{error, info, warn};

use crate::{
    proto::{self, Frame},
    registry::Registry,
    socket::Transport,
};

pub(crate) fn spawn(
    stream: Transport,
    registry: Arc<Registry>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("netpipefs-dispatch".into())
        .spawn(move || run(stream, registry))
}

/// Consumes frames until the peer disconnects or the stream becomes
/// unusable, then force-exits every pipe. Frames for unknown paths are
/// logged and skipped; a broken frame boundary is unrecoverable.
fn run(mut stream: Transport, registry: Arc<Registry>) {
    loop {
        let frame = match proto::read_frame(&mut stream) {
            Ok(frame) => frame,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                info!("peer closed the connection");
                break;
            }
            Err(e) => {
                error!("peer connection lost: {e}");
                break;
            }
        };
        if let Err(e) = dispatch(&mut stream, &registry, frame) {
            error!("dispatcher stopping: {e}");
            break;
        }
    }
    registry.shutdown();
}

fn dispatch(stream: &mut Transport, registry: &Registry, frame: Frame) -> io::Result<()> {
    match frame {
        Frame::Open { path, mode } => {
            let (pipe, _) = registry.get_or_create(&path);
            pipe.open_update(mode);
        }
        Frame::Close { path, mode } => match registry.get(&path) {
            Some(pipe) => {
                if pipe.close_update(mode) {
                    registry.remove_if_defunct(&path);
                }
            }
            None => warn!("CLOSE for unknown path {path}"),
        },
        Frame::ReadRequest { path, size } => match registry.get(&path) {
            Some(pipe) => pipe.read_request(size as usize)?,
            None => warn!("READ_REQUEST for unknown path {path}"),
        },
        Frame::ReadAck { path, size } => match registry.get(&path) {
            Some(pipe) => pipe.read_update(size as usize)?,
            None => warn!("READ_ACK for unknown path {path}"),
        },
        Frame::Write { path, size } => match registry.get(&path) {
            // The payload is consumed from the socket inside the callback.
            Some(pipe) => pipe.recv(stream, size as usize)?,
            None => {
                warn!("WRITE for unknown path {path}, discarding {size} bytes");
                io::copy(&mut stream.by_ref().take(size), &mut io::sink())?;
            }
        },
    }
    Ok(())
}

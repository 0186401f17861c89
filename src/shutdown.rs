//! Signal-driven shutdown: one thread waits for SIGINT/SIGTERM, then tears
//! every pipe down and unmounts the filesystem.

use std::{io, sync::Arc, thread};

use fuser::SessionUnmounter;
use log::{error, info};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};

use crate::fs::EngineCell;

/// A write on a dead peer socket must report an error, not kill the
/// process.
pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Spawns the signal thread. On SIGINT or SIGTERM it force-exits every
/// pipe (unblocking all filesystem workers) and unmounts, which ends the
/// session loop in main.
pub fn spawn_handler(cell: Arc<EngineCell>, mut unmounter: SessionUnmounter) -> io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    thread::Builder::new()
        .name("netpipefs-signal".into())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!("caught signal {signal}, shutting down");
                cell.shutdown();
                if let Err(e) = unmounter.unmount() {
                    error!("unmount failed: {e}");
                }
            }
        })?;
    Ok(())
}

use std::process::ExitCode;

use clap::Parser;
use fuser::{Config as FuseConfig, MountOption, Session};
use log::{error, LevelFilter};

use netpipefs::{config::Config, fs::NetpipeFs, shutdown};

fn main() -> ExitCode {
    let config = match Config::try_parse() {
        Ok(config) => config,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    if let Err(msg) = config.validate() {
        eprintln!("{msg}");
        return ExitCode::from(1);
    }

    env_logger::Builder::new()
        .filter_level(if config.debug {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .parse_default_env()
        .init();

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(1)
        }
    }
}

fn run(config: Config) -> std::io::Result<()> {
    shutdown::ignore_sigpipe();

    let mountpoint = config.mountpoint.clone();
    let delayconnect = config.delayconnect;
    let (fs, cell) = NetpipeFs::new(config);
    if !delayconnect {
        cell.connect()?;
    }

    let mut options = FuseConfig::default();
    options.mount_options = vec![
        MountOption::FSName("netpipefs".into()),
        MountOption::DefaultPermissions,
        MountOption::AutoUnmount,
    ];
    let mut session = Session::new(fs, &mountpoint, &options)?;
    shutdown::spawn_handler(cell.clone(), session.unmount_callable())?;

    // Runs until the filesystem is unmounted, by the signal thread or by a
    // manual umount.
    session.spawn()?.join()?;
    cell.shutdown();
    Ok(())
}

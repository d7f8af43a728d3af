//! CardBoost idle process - Stands in for one running game
//!
//! Usage: `cardboost-idle <appid> <parent pid>`. The process stays alive
//! while its parent does and exits once the parent disappears.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How often the parent is looked up
const PARENT_CHECK_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Parser)]
#[command(name = "cardboost-idle", version, about = "Stand in for one running game")]
struct Args {
    /// App id reported to the platform
    appid: u32,
    /// Process to follow; exits once it is gone
    parent: u32,
}

fn main() -> Result<()> {
    init_logging();

    let Args { appid, parent } = Args::parse();
    info!("Idling app {} for parent process {}", appid, parent);

    let mut system = System::new();
    if !parent_alive(&mut system, parent) {
        warn!("Parent process {} not found at startup", parent);
        std::thread::sleep(PARENT_CHECK_INTERVAL);
        std::process::exit(1);
    }

    loop {
        std::thread::sleep(PARENT_CHECK_INTERVAL);
        if !parent_alive(&mut system, parent) {
            info!("Parent process {} is gone, exiting", parent);
            std::process::exit(1);
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn parent_alive(system: &mut System, pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::new(),
    );
    system.process(pid).is_some()
}

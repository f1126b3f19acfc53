//! The rinit daemon.
//!
//! Startup: install the logging sink, read the kernel command line, load
//! the series file (populating global options), build the task database
//! with the process dispatcher as spawn handler, insert all tasks, bring up
//! the service socket, then run the level-triggered scheduler loop: spawn
//! everything startable, wait for the change condition, repeat.

use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use log::{debug, error, info};
use nix::unistd::{fork, getpid, ForkResult};
use structopt::StructOpt;

use rinit::config;
use rinit::dispatch;
use rinit::error::Result;
use rinit::ipc::server;
use rinit::kernel_cmdline;
use rinit::logger;
use rinit::task_db::{DispatchMode, TaskDb};
use rinit::version;

/// Series file used when none is given on the command line.
const DEFAULT_SERIES: &str = "/etc/rinit/default.series";

#[derive(Debug, StructOpt)]
#[structopt(name = "rinit", about = "Dependency-driven system init and service manager.")]
struct Opt {
    /// Absolute path of the series file to load.
    #[structopt(parse(from_os_str))]
    series: Option<PathBuf>,

    /// Rendezvous path of the service socket (overrides RINIT_SOCK).
    #[structopt(long, parse(from_os_str))]
    socket: Option<PathBuf>,

    /// Kernel command line to scan for rinit.* settings.
    #[structopt(long, parse(from_os_str))]
    kcmdline: Option<PathBuf>,
}

fn main() {
    logger::init();
    let opt = Opt::from_args();
    info!("rinit daemon version {} started", version::version_string());

    if let Err(e) = run(opt) {
        error!("startup failed: {}", e);
        exit(1);
    }
}

/// Fork so that PID 1 degenerates into a zombie reaper for adopted orphans
/// while the child carries on as the service manager.
fn fork_zombie_reaper() -> Result<()> {
    match unsafe { fork() }? {
        ForkResult::Child => Ok(()),
        ForkResult::Parent { .. } => loop {
            let _ = nix::sys::wait::wait();
        },
    }
}

fn run(opt: Opt) -> Result<()> {
    let series_path = opt.series.unwrap_or_else(|| PathBuf::from(DEFAULT_SERIES));

    if getpid().as_raw() == 1 {
        fork_zombie_reaper()?;
    }

    if let Err(e) = kernel_cmdline::parse(opt.kcmdline.as_deref()) {
        // A broken command line must not stop the boot.
        error!("could not evaluate kernel command line: {}", e);
    }

    let series = config::load_series(&series_path)?;
    debug!("series file '{}' loaded", series_path.display());

    let db = TaskDb::new(dispatch::spawn_handler());
    for file in series.paths() {
        let task = config::task_from_file(&file)?;
        info!("file '{}' loaded", file.display());
        db.insert(task, false)?;
    }
    debug!("done parsing");

    let sock_path = opt
        .socket
        .or_else(|| std::env::var_os(server::SOCK_PATH_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(server::DEFAULT_SOCK_PATH));
    server::start(Arc::clone(&db), &sock_path)?;
    info!("service interface listening on '{}'", sock_path.display());

    loop {
        if let Err(e) = db.spawn_ready(DispatchMode::Start) {
            error!("scheduler scan failed: {}", e);
        }
        debug!("waiting for a task to become ready");
        db.wait_for_change();
    }
}

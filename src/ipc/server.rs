//! The notification/service socket server.
//!
//! Listens on a SEQPACKET socket under the configured rendezvous path. A
//! pool worker accepts a connection, enables credential passing, sends a
//! framed `RTR`, receives exactly one request, gates it on the peer's
//! credentials, executes it and answers with one response before closing.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;

use log::{debug, error, warn};
use nix::sys::socket::{
    accept, bind, listen, setsockopt, socket, sockopt::PassCred, AddressFamily, SockFlag,
    SockType, UnixAddr, UnixCredentials,
};
use nix::unistd::{close, geteuid};

use crate::error::{Error, Result};
use crate::ipc::command::{Op, OpCode, RtCommand};
use crate::ipc::executor;
use crate::ipc::frame;
use crate::ipc::thread_pool::ThreadPool;
use crate::task_db::TaskDb;

/// Default rendezvous path of the service socket.
pub const DEFAULT_SOCK_PATH: &str = "/run/rinit/rinit.sock";
/// Environment variable overriding the rendezvous path.
pub const SOCK_PATH_ENV: &str = "RINIT_SOCK";

const CONN_BACKLOG: usize = 100;

/// Effective capability bit a peer needs for SHUTDOWN.
const CAP_SYS_BOOT: u32 = 22;

/// Create the rendezvous socket and start the worker pool serving it.
pub fn start(db: Arc<TaskDb>, sock_path: &Path) -> Result<()> {
    if let Some(dir) = sock_path.parent() {
        fs::create_dir_all(dir)?;
        // Clients of the read-only commands may run under any UID.
        fs::set_permissions(dir, fs::Permissions::from_mode(0o777))?;
    }
    match fs::remove_file(sock_path) {
        Ok(()) => debug!("replaced stale socket file '{}'", sock_path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let listen_fd = socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    let addr = UnixAddr::new(sock_path)?;
    bind(listen_fd, &addr)?;
    listen(listen_fd, CONN_BACKLOG)?;
    fs::set_permissions(sock_path, fs::Permissions::from_mode(0o666))?;

    ThreadPool::start(0, move |pool| conn_worker(&db, listen_fd, pool))?;
    Ok(())
}

/// Accept loop run by every pool worker.
fn conn_worker(db: &Arc<TaskDb>, listen_fd: RawFd, pool: &ThreadPool) {
    debug!("connection worker ready");
    loop {
        let conn = match accept(listen_fd) {
            Ok(fd) => fd,
            Err(e) => {
                error!("could not accept connection: {}", e);
                continue;
            }
        };
        pool.busy();
        if let Err(e) = handle_connection(db, conn) {
            error!("connection handling failed: {}", e);
        }
        let _ = close(conn);
        pool.idle();
    }
}

fn handle_connection(db: &Arc<TaskDb>, conn: RawFd) -> Result<()> {
    setsockopt(conn, PassCred, &true)?;
    frame::send_str(conn, "RTR")?;

    let (msg, creds) = frame::recv_str(conn)?;
    debug!(
        "received '{}' from peer PID={} UID={} GID={}",
        msg,
        creds.pid(),
        creds.uid(),
        creds.gid()
    );

    let cmd = RtCommand::parse(&msg)?;
    let op = match cmd.op {
        OpCode::Request(op) => op,
        OpCode::Response(_) => {
            return Err(Error::InvalidArgument(
                "received a response code as a request".into(),
            ))
        }
    };

    let res = if !peer_permitted(op, &creds) {
        warn!(target: "ipc-not-authorized",
            "peer PID={} UID={} denied {:?}", creds.pid(), creds.uid(), op);
        RtCommand::err_response(op, "Permission denied.")
    } else {
        executor::execute(db, &cmd)
    };

    frame::send_str(conn, &res.to_wire())
}

/// The opcode-indexed permission policy.
///
/// Read-only commands are open to everyone. Mutating commands require the
/// peer to run under the daemon's effective UID. SHUTDOWN requires
/// `CAP_SYS_BOOT` in the peer's effective capability set.
fn peer_permitted(op: Op, creds: &UnixCredentials) -> bool {
    match op {
        Op::Status | Op::TaskList | Op::GetVer => true,
        Op::Shutdown => peer_has_cap_sys_boot(creds.pid()),
        Op::AddTask
        | Op::AddSeries
        | Op::Enable
        | Op::Disable
        | Op::Stop
        | Op::Kill
        | Op::Restart
        | Op::Notify => creds.uid() == geteuid().as_raw(),
    }
}

/// Query the peer's effective capability set via procfs.
fn peer_has_cap_sys_boot(pid: libc::pid_t) -> bool {
    let status = match fs::read_to_string(format!("/proc/{}/status", pid)) {
        Ok(s) => s,
        Err(e) => {
            error!("could not read capabilities of peer PID {}: {}", pid, e);
            return false;
        }
    };
    match effective_caps(&status) {
        Some(caps) => caps & (1u64 << CAP_SYS_BOOT) != 0,
        None => {
            error!("no CapEff line in status of peer PID {}", pid);
            false
        }
    }
}

fn effective_caps(proc_status: &str) -> Option<u64> {
    proc_status
        .lines()
        .find_map(|l| l.strip_prefix("CapEff:"))
        .and_then(|hex| u64::from_str_radix(hex.trim(), 16).ok())
}

//! System shutdown and reboot.
//!
//! Runs as a detached worker so the requesting connection gets its response
//! before the kernel call. The sequence: inhibit further spawning, wake and
//! terminate all processes, wait out the configured grace period on an
//! absolute monotonic deadline, kill the stragglers, detach every
//! non-virtual mount except `/`, remount `/` read-only if needed, `sync`,
//! and invoke the kernel reboot interface.

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info};
use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::reboot::{reboot, RebootMode};
use nix::sys::signal::{kill, Signal};
use nix::sys::time::TimeSpec;
use nix::time::{clock_gettime, ClockId};
use nix::unistd::{sync, Pid};

use crate::error::{Error, Result};
use crate::global_opts;
use crate::task_db::TaskDb;

/// The two supported shutdown operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOp {
    Poweroff,
    Reboot,
}

impl ShutdownOp {
    /// Parse the SHUTDOWN command argument.
    pub fn parse(arg: &str) -> Result<ShutdownOp> {
        match arg {
            "poweroff" => Ok(ShutdownOp::Poweroff),
            "reboot" => Ok(ShutdownOp::Reboot),
            other => Err(Error::InvalidArgument(format!(
                "shutdown operation must be poweroff or reboot, not '{}'",
                other
            ))),
        }
    }

    fn reboot_mode(self) -> RebootMode {
        match self {
            ShutdownOp::Poweroff => RebootMode::RB_POWER_OFF,
            ShutdownOp::Reboot => RebootMode::RB_AUTOBOOT,
        }
    }
}

/// Start the detached shutdown worker.
pub fn spawn_shutdown(db: Arc<TaskDb>, op: ShutdownOp) -> Result<()> {
    thread::Builder::new()
        .name("shutdown".into())
        .spawn(move || run(db, op))
        .map_err(|e| Error::Resource(format!("could not start shutdown thread: {}", e)))?;
    Ok(())
}

fn run(db: Arc<TaskDb>, op: ShutdownOp) {
    info!("system {:?} requested", op);
    db.set_spawn_inhibit(true);

    let grace_us = global_opts::shutdown_grace_us();

    // Stopped processes would never see the SIGTERM.
    let everyone = Pid::from_raw(-1);
    let _ = kill(everyone, Signal::SIGCONT);
    let _ = kill(everyone, Signal::SIGTERM);
    debug!("sent SIGTERM to all processes");

    if let Err(e) = grace_sleep(grace_us) {
        error!("could not wait out the shutdown grace period: {}", e);
    }

    let _ = kill(everyone, Signal::SIGKILL);
    debug!("sent SIGKILL to all processes");

    if let Err(e) = prepare_filesystems() {
        error!(
            "could not cleanly detach filesystems, some may be dirty on next boot: {}",
            e
        );
    }

    if let Err(e) = reboot(op.reboot_mode()) {
        error!("reboot syscall failed: {}", e);
    }
}

/// Sleep for `micros` against an absolute monotonic deadline, so repeated
/// signal interruptions converge instead of restarting the wait.
fn grace_sleep(micros: u64) -> Result<()> {
    let deadline = clock_gettime(ClockId::CLOCK_MONOTONIC)?
        + TimeSpec::from(Duration::from_micros(micros));
    let deadline_ts = libc::timespec {
        tv_sec: deadline.tv_sec(),
        tv_nsec: deadline.tv_nsec(),
    };
    loop {
        let ret = unsafe {
            libc::clock_nanosleep(
                libc::CLOCK_MONOTONIC,
                libc::TIMER_ABSTIME,
                &deadline_ts,
                std::ptr::null_mut(),
            )
        };
        match ret {
            0 => return Ok(()),
            e if e == libc::EINTR => continue,
            e => return Err(Errno::from_i32(e).into()),
        }
    }
}

/// `/proc/mounts` escapes whitespace and backslashes octally.
fn unescape_mount_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let chars: Vec<char> = field.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '\\' && i + 3 < chars.len() {
            let code: String = chars[i + 1..i + 4].iter().collect();
            if let Ok(num) = u8::from_str_radix(&code, 8) {
                out.push(num as char);
                i += 4;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

/// Extract the unmount targets (newest mount last) and whether `/` is
/// already read-only from `/proc/mounts` content.
fn parse_mount_table(text: &str) -> (Vec<String>, bool) {
    let mut targets = Vec::new();
    let mut rootfs_ro = false;
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let source = match fields.next() {
            Some(s) => s,
            None => continue,
        };
        // tmpfs, proc, sysfs and friends are mounted from 'none'.
        if source == "none" {
            continue;
        }
        let target = match fields.next() {
            Some(t) => unescape_mount_field(t),
            None => continue,
        };
        if target == "/" {
            let opts = fields.nth(1).unwrap_or("");
            rootfs_ro = opts.split(',').any(|o| o == "ro");
        } else {
            targets.push(target);
        }
    }
    (targets, rootfs_ro)
}

fn prepare_filesystems() -> Result<()> {
    let table = fs::read_to_string("/proc/mounts")?;
    let (targets, rootfs_ro) = parse_mount_table(&table);

    // Lazy-detach in reverse mount order; the root mount stays.
    for target in targets.iter().rev() {
        debug!("unmounting '{}'", target);
        if let Err(e) = umount2(target.as_str(), MntFlags::MNT_DETACH) {
            error!("could not detach mountpoint '{}': {}", target, e);
        }
    }

    if !rootfs_ro {
        if let Err(e) = mount::<str, str, str, str>(
            None,
            "/",
            None,
            MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None,
        ) {
            error!("could not remount rootfs read-only: {}", e);
        }
    }

    sync();
    Ok(())
}

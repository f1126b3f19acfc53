//! The process dispatcher.
//!
//! Every dispatch runs a detached worker thread which executes a task's
//! command chain: fork/exec each command with the configured redirections,
//! environment and user/group, peek at the exit status without reaping,
//! update database state, and fulfill the task's `spawn`/`wait`/`fail`
//! events. Spawning works against a deep copy of the task taken under the
//! database lock, so later mutations do not race the worker.
//!
//! Zombie reaping is guarded by a process-wide wait-inhibit flag: while the
//! STOP/KILL runtime commands are between looking up a PID and delivering
//! the signal, workers must not reap, or the PID could be recycled.

use std::ffi::CString;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::{debug, error, info};
use nix::errno::Errno;
use nix::sys::stat::{stat, Mode, SFlag};
use nix::sys::wait::waitpid;
use nix::unistd::{self, fork, ForkResult, Gid, Pid, Uid};

use crate::error::{Error, Result};
use crate::global_opts;
use crate::io_redirect::{IoRedirect, RedirTarget};
use crate::task::{Task, TaskCmd, TaskDep, TaskState, EVENT_FAIL, EVENT_SPAWN, EVENT_WAIT};
use crate::task_db::{DispatchMode, SpawnHandler, TaskDb};

/// Environment variable telling a child which task it belongs to, needed by
/// clients of the NOTIFY command.
pub const TASK_NAME_ENV: &str = "RINIT_TASK_NAME";

struct WaitGuard {
    inhibit: Mutex<bool>,
    cond: Condvar,
}

lazy_static::lazy_static! {
    static ref WAIT_GUARD: WaitGuard = WaitGuard {
        inhibit: Mutex::new(false),
        cond: Condvar::new(),
    };
}

/// Set or clear the process-wide wait-inhibit flag; clearing wakes all
/// workers blocked before a reap.
pub fn set_wait_inhibit(inhibit: bool) {
    let mut flag = WAIT_GUARD.inhibit.lock().unwrap_or_else(|e| e.into_inner());
    *flag = inhibit;
    if !inhibit {
        WAIT_GUARD.cond.notify_all();
    }
}

fn block_on_wait_inhibit() {
    let mut flag = WAIT_GUARD.inhibit.lock().unwrap_or_else(|e| e.into_inner());
    while *flag {
        flag = WAIT_GUARD
            .cond
            .wait(flag)
            .unwrap_or_else(|e| e.into_inner());
    }
}

/// The spawn handler installed into the task database.
pub fn spawn_handler() -> SpawnHandler {
    Box::new(|db, name, mode| dispatch(Arc::clone(db), name.to_string(), mode))
}

/// Hand a task to a detached worker thread.
pub fn dispatch(db: Arc<TaskDb>, name: String, mode: DispatchMode) -> Result<()> {
    thread::Builder::new()
        .name(format!("dispatch-{}", name))
        .spawn(move || worker(db, name, mode))
        .map_err(|e| Error::Resource(format!("could not create dispatch thread: {}", e)))?;
    Ok(())
}

/// Replace `${TASK_PID}` in stop-command argv elements with the recorded
/// PID. This is the only variable resolved against runtime state, and only
/// at dispatch time.
fn expand_task_pid(cmds: &mut [TaskCmd], pid: libc::pid_t) {
    let pid_str = pid.to_string();
    for cmd in cmds {
        for arg in &mut cmd.argv {
            if arg.contains("${TASK_PID}") {
                *arg = arg.replace("${TASK_PID}", &pid_str);
            }
        }
    }
}

fn worker(db: Arc<TaskDb>, name: String, mode: DispatchMode) {
    debug!("dispatch worker for task '{}' started", name);
    let mut task = match db.snapshot_task(&name) {
        Ok(t) => t,
        Err(e) => {
            error!("could not copy task '{}' for dispatch: {}", name, e);
            return;
        }
    };
    task.env.set(TASK_NAME_ENV, &task.name);

    let cmds = match mode {
        DispatchMode::Start => task.cmds.clone(),
        DispatchMode::Stop => {
            let mut cmds = task.stop_cmds.clone();
            expand_task_pid(&mut cmds, task.pid.unwrap_or(-1));
            cmds
        }
    };

    match run_chain(&db, &task, &cmds) {
        Ok(()) => {
            info!("task '{}' done", name);
            log_err(db.set_task_state(&name, TaskState::Done, false));
            log_err(db.fulfill_dep(&TaskDep::new(&name, EVENT_WAIT), None));
            log_err(db.provide_feature(&task, TaskState::Done, false));
        }
        Err(e) => {
            info!("task '{}' failed: {}", name, e);
            log_err(db.set_task_state(&name, TaskState::Failed, false));
            log_err(db.set_task_pid(&name, None));
            log_err(db.fulfill_dep(&TaskDep::new(&name, EVENT_FAIL), None));
            log_err(db.provide_feature(&task, TaskState::Failed, false));
        }
    }
}

fn log_err<T>(res: Result<T>) {
    if let Err(e) = res {
        error!("dispatch bookkeeping failed: {}", e);
    }
}

/// Run one command chain to completion or first failure.
fn run_chain(db: &Arc<TaskDb>, task: &Task, cmds: &[TaskCmd]) -> Result<()> {
    for (idx, cmd) in cmds.iter().enumerate() {
        let pid = spawn_command(task, cmd)?;
        info!(
            "started process {} for command {} of task '{}' ('{}')",
            pid, idx, task.name, cmd.argv[0]
        );
        db.set_task_pid(&task.name, Some(pid))?;

        if idx == 0 {
            db.set_task_state(&task.name, TaskState::Running, false)?;
            db.fulfill_dep(&TaskDep::new(&task.name, EVENT_SPAWN), None)?;
            db.provide_feature(task, TaskState::Running, false)?;
        }

        let clean = peek_wait(pid)?;
        if !clean {
            // A child that exited unsuccessfully or was killed fails the
            // whole chain. Leave the PID reset and the zombie reaped.
            let _ = db.set_task_pid(&task.name, None);
            reap(pid)?;
            return Err(Error::Spawn(format!(
                "command {} of task '{}' did not exit cleanly",
                idx, task.name
            )));
        }

        db.set_task_pid(&task.name, None)?;
        reap(pid)?;
    }
    Ok(())
}

/// Fork and exec one command with the task's redirections, environment and
/// credentials applied in the child.
fn spawn_command(task: &Task, cmd: &TaskCmd) -> Result<libc::pid_t> {
    // FIFO targets are created (or checked) before forking, failures must
    // surface in the parent.
    for redir in &task.redirs {
        if redir.fifo {
            if let RedirTarget::Path(path) = &redir.target {
                ensure_fifo(path, redir.mode)?;
            }
        }
    }

    let mut argv = cmd.argv.clone();
    if task.needs_launcher() {
        if let Some(launcher) = global_opts::lock().launcher_cmd.clone() {
            argv.insert(0, launcher.display().to_string());
        }
    }

    let argv_c: Vec<CString> = argv
        .iter()
        .map(|a| {
            CString::new(a.as_str())
                .map_err(|_| Error::InvalidArgument(format!("NUL byte in argv element '{}'", a)))
        })
        .collect::<Result<_>>()?;
    let envp = task.env.to_cstring_vec();

    match unsafe { fork() }.map_err(|e| Error::Spawn(format!("fork failed: {}", e)))? {
        ForkResult::Parent { child } => Ok(child.as_raw()),
        ForkResult::Child => {
            // Only async-signal-safe calls from here to the exec.
            if exec_child(task, &argv_c, &envp).is_err() {
                unsafe { libc::_exit(127) };
            }
            unreachable!()
        }
    }
}

fn exec_child(task: &Task, argv: &[CString], envp: &[CString]) -> nix::Result<()> {
    for redir in &task.redirs {
        apply_redirection(redir)?;
    }
    if let Some(gid) = task.group {
        let gid = Gid::from_raw(gid);
        unistd::setgroups(&[gid])?;
        unistd::setgid(gid)?;
    }
    if let Some(uid) = task.user {
        unistd::setuid(Uid::from_raw(uid))?;
    }
    unistd::execve(&argv[0], argv, envp)?;
    Ok(())
}

fn apply_redirection(redir: &IoRedirect) -> nix::Result<()> {
    match &redir.target {
        RedirTarget::Stream(old) => {
            unistd::dup2(*old, redir.stream)?;
        }
        RedirTarget::Path(path) => {
            let fd = nix::fcntl::open(path.as_path(), redir.oflags, redir.mode)?;
            if fd != redir.stream {
                unistd::dup2(fd, redir.stream)?;
                unistd::close(fd)?;
            }
        }
    }
    Ok(())
}

/// Make sure `path` is a FIFO special file, creating it if absent. An
/// existing file of any other type is an error.
fn ensure_fifo(path: &Path, mode: Mode) -> Result<()> {
    match unistd::mkfifo(path, mode) {
        Ok(()) => Ok(()),
        Err(Errno::EEXIST) => {
            let st = stat(path)?;
            if SFlag::from_bits_truncate(st.st_mode).contains(SFlag::S_IFIFO) {
                Ok(())
            } else {
                Err(Error::InvalidArgument(format!(
                    "'{}' exists but is not a FIFO",
                    path.display()
                )))
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// Check whether the child has exited cleanly, leaving the zombie in place.
fn peek_wait(pid: libc::pid_t) -> Result<bool> {
    let mut si: libc::siginfo_t = unsafe { std::mem::zeroed() };
    loop {
        let ret = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut si,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if ret == 0 {
            break;
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(Error::Spawn(format!("waitid for PID {} failed: {}", pid, err)));
    }
    Ok(si.si_code == libc::CLD_EXITED && unsafe { si.si_status() } == 0)
}

/// Reap a zombie, honoring the wait-inhibit guard. A PID that is already
/// gone counts as reaped.
fn reap(pid: libc::pid_t) -> Result<()> {
    block_on_wait_inhibit();
    loop {
        match waitpid(Pid::from_raw(pid), None) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_pid_expansion_touches_only_the_variable() {
        let mut cmds = vec![
            TaskCmd::new(vec!["/bin/kill".into(), "-TERM".into(), "${TASK_PID}".into()]).unwrap(),
            TaskCmd::new(vec!["/bin/echo".into(), "pid=${TASK_PID}!".into(), "$TASK_PID".into()])
                .unwrap(),
        ];
        expand_task_pid(&mut cmds, 42);
        assert_eq!(cmds[0].argv[2], "42");
        assert_eq!(cmds[1].argv[1], "pid=42!");
        assert_eq!(cmds[1].argv[2], "$TASK_PID");
    }

    #[test]
    fn ensure_fifo_creates_and_accepts_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipe");
        let mode = Mode::from_bits_truncate(0o600);
        ensure_fifo(&path, mode).unwrap();
        ensure_fifo(&path, mode).unwrap();

        let plain = dir.path().join("file");
        std::fs::File::create(&plain).unwrap();
        assert!(ensure_fifo(&plain, mode).is_err());
    }

    #[test]
    fn wait_inhibit_releases_blocked_reapers() {
        set_wait_inhibit(true);
        let waiter = std::thread::spawn(|| {
            block_on_wait_inhibit();
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!waiter.is_finished());
        set_wait_inhibit(false);
        waiter.join().unwrap();
    }
}

//! Process-wide configuration storage.
//!
//! One mutex guards all global settings; readers and writers go through
//! [`lock`] or the typed convenience getters below. Values are populated
//! from the series file, the kernel command line and runtime commands.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use crate::env_set::EnvSet;

pub const DEFAULT_TASK_DIR: &str = "/etc/rinit";
pub const DEFAULT_TASK_FILE_SUFFIX: &str = ".task";
pub const DEFAULT_INCL_SUFFIX: &str = ".include";
pub const DEFAULT_SHUTDOWN_GRACE_US: u64 = 500_000;
pub const DEFAULT_SIGKEY_DIR: &str = "/etc/rinit/keys";

#[derive(Debug, Clone)]
pub struct GlobalOpts {
    pub debug: bool,
    pub use_syslog: bool,

    pub task_dir: PathBuf,
    pub task_dir_follow_symlinks: bool,
    pub task_file_suffix: String,
    pub incl_dir: Option<PathBuf>,
    pub incl_suffix: String,

    /// Explicit task file list from a series file; `None` selects a
    /// directory scan of `task_dir`.
    pub tasks: Option<Vec<String>>,

    pub shutdown_grace_us: u64,

    /// Helper program prefixed to commands that carry capability or cgroup
    /// settings.
    pub launcher_cmd: Option<PathBuf>,

    /// Global environment, inherited by every new task.
    pub env: EnvSet,
    /// Global filter definitions, inherited by every new task. Opaque to
    /// the core; consumed by external event-filter collaborators.
    pub filters: EnvSet,

    // Stored for external event-logging collaborators; the core only
    // validates their consistency.
    pub use_elos: bool,
    pub elos_server: Option<String>,
    pub elos_port: Option<u16>,
    pub elos_poll_interval_us: u64,

    // Kernel command line settings.
    pub sig_key_dir: PathBuf,
    pub signatures: bool,
}

impl Default for GlobalOpts {
    fn default() -> Self {
        GlobalOpts {
            debug: false,
            use_syslog: false,
            task_dir: PathBuf::from(DEFAULT_TASK_DIR),
            task_dir_follow_symlinks: true,
            task_file_suffix: DEFAULT_TASK_FILE_SUFFIX.to_string(),
            incl_dir: None,
            incl_suffix: DEFAULT_INCL_SUFFIX.to_string(),
            tasks: None,
            shutdown_grace_us: DEFAULT_SHUTDOWN_GRACE_US,
            launcher_cmd: None,
            env: EnvSet::new(),
            filters: EnvSet::new(),
            use_elos: false,
            elos_server: None,
            elos_port: None,
            elos_poll_interval_us: 1_000_000,
            sig_key_dir: PathBuf::from(DEFAULT_SIGKEY_DIR),
            signatures: false,
        }
    }
}

lazy_static::lazy_static! {
    static ref GLOBALS: Mutex<GlobalOpts> = Mutex::new(GlobalOpts::default());
}

/// Exclusive access to the global option storage. Keep the critical
/// section short; nothing blocking may run while holding the guard.
pub fn lock() -> MutexGuard<'static, GlobalOpts> {
    GLOBALS.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn debug() -> bool {
    lock().debug
}

pub fn shutdown_grace_us() -> u64 {
    lock().shutdown_grace_us
}

/// Include directory, falling back to the task directory when unset.
pub fn include_dir() -> PathBuf {
    let g = lock();
    g.incl_dir.clone().unwrap_or_else(|| g.task_dir.clone())
}

pub fn include_suffix() -> String {
    lock().incl_suffix.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn include_dir_falls_back_to_task_dir() {
        let (incl, task_dir) = {
            let g = lock();
            (g.incl_dir.clone(), g.task_dir.clone())
        };
        if incl.is_none() {
            assert_eq!(include_dir(), task_dir);
        }
    }
}

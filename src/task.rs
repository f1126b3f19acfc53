//! The in-memory task record.
//!
//! A task is a named unit of work: an ordered chain of start commands, an
//! optional chain of stop commands, a multiset of dependencies gating its
//! start, features it provides to others, its execution environment and
//! redirections, and runtime bookkeeping (state, PID, retry counters,
//! timestamps). Tasks are built from parsed configuration by
//! [`crate::config::task_file`], owned by the task database and cloned by
//! the dispatcher for the duration of a run.

use std::time::Instant;

use serde::Serialize;

use crate::env_set::EnvSet;
use crate::error::{Error, Result};
use crate::io_redirect::IoRedirect;

/// Dependency event fired when the first command of a task has spawned.
pub const EVENT_SPAWN: &str = "spawn";
/// Dependency event fired when a task's command chain has finished.
pub const EVENT_WAIT: &str = "wait";
/// Dependency event fired when a task has failed.
pub const EVENT_FAIL: &str = "fail";
/// Suffix selecting the notification-originated variant of an event.
pub const EVENT_NOTIFY_SUFFIX: &str = "-notify";

/// Sentinel dependency name controlled via the ENABLE/DISABLE runtime
/// commands.
pub const DEP_NAME_CTL: &str = "@ctl";
/// Sentinel dependency name matched by the provides mechanism.
pub const DEP_NAME_PROVIDED: &str = "@provided";
/// Sentinel dependency name matched by external event-filter collaborators.
pub const DEP_NAME_FILTER: &str = "@elos";
/// Event of the `@ctl` gating dependency.
pub const EVENT_ENABLE: &str = "enable";

bitflags::bitflags! {
    /// Boolean task options.
    pub struct TaskOpts: u32 {
        /// Restart the task when it leaves DONE or FAILED, subject to the
        /// retry policy.
        const RESPAWN = 1 << 0;
    }
}

impl Default for TaskOpts {
    fn default() -> Self {
        TaskOpts::empty()
    }
}

impl Serialize for TaskOpts {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u32(self.bits())
    }
}

/// Lifecycle state of a task.
///
/// Whether the most recent transition originated from an external
/// notification is tracked separately in [`Task::notified`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Loaded,
    Starting,
    Running,
    Done,
    Failed,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Loaded => "loaded",
            TaskState::Starting => "starting",
            TaskState::Running => "running",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
        }
    }
}

impl Default for TaskState {
    fn default() -> Self {
        TaskState::Loaded
    }
}

/// A `(name, event)` dependency. Two dependencies are equal iff both parts
/// are lexically equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskDep {
    pub name: String,
    pub event: String,
}

impl TaskDep {
    pub fn new(name: &str, event: &str) -> Self {
        TaskDep {
            name: name.to_string(),
            event: event.to_string(),
        }
    }

    /// Parse a `name:event` token.
    pub fn parse(token: &str) -> Result<Self> {
        let mut parts = token.splitn(2, ':');
        match (parts.next(), parts.next()) {
            (Some(name), Some(event)) if !name.is_empty() && !event.is_empty() => {
                Ok(TaskDep::new(name, event))
            }
            _ => Err(Error::Parse(format!("malformed dependency token '{}'", token))),
        }
    }

    /// The gating dependency added by DISABLE and removed by ENABLE.
    pub fn ctl_enable() -> Self {
        TaskDep::new(DEP_NAME_CTL, EVENT_ENABLE)
    }
}

impl std::fmt::Display for TaskDep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.event)
    }
}

/// A provided feature: reaching `state` (with matching notification origin)
/// fulfills `(@provided, feature)` across the whole database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskProv {
    pub feature: String,
    pub state: TaskState,
    pub notified: bool,
}

impl TaskProv {
    /// Parse a `feature:state[-notify]` token with
    /// `state ∈ {spawn, wait, fail}`.
    pub fn parse(token: &str) -> Result<Self> {
        let mut parts = token.splitn(2, ':');
        let (feature, ev) = match (parts.next(), parts.next()) {
            (Some(f), Some(e)) if !f.is_empty() && !e.is_empty() => (f, e),
            _ => return Err(Error::Parse(format!("malformed provides token '{}'", token))),
        };
        let (ev, notified) = match ev.strip_suffix(EVENT_NOTIFY_SUFFIX) {
            Some(base) => (base, true),
            None => (ev, false),
        };
        let state = match ev {
            EVENT_SPAWN => TaskState::Running,
            EVENT_WAIT => TaskState::Done,
            EVENT_FAIL => TaskState::Failed,
            other => {
                return Err(Error::Parse(format!(
                    "provides state must be spawn, wait or fail, not '{}'",
                    other
                )))
            }
        };
        Ok(TaskProv {
            feature: feature.to_string(),
            state,
            notified,
        })
    }
}

/// One command of a task's start or stop chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskCmd {
    /// Argument vector; the first element is the program path.
    pub argv: Vec<String>,
}

impl TaskCmd {
    pub fn new(argv: Vec<String>) -> Result<Self> {
        if argv.is_empty() {
            return Err(Error::Parse("a command needs at least a program path".into()));
        }
        Ok(TaskCmd { argv })
    }
}

/// Control group configuration carried on a task.
#[cfg(feature = "cgroup")]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CgroupCfg {
    pub name: String,
    /// `controller.key=value` parameter lines, passed through unmodified.
    pub params: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub name: String,
    pub cmds: Vec<TaskCmd>,
    pub stop_cmds: Vec<TaskCmd>,
    pub deps: Vec<TaskDep>,
    pub provides: Vec<TaskProv>,
    pub env: EnvSet,
    pub filters: EnvSet,
    pub redirs: Vec<IoRedirect>,

    pub user: Option<u32>,
    pub user_name: Option<String>,
    pub group: Option<u32>,
    pub group_name: Option<String>,

    /// Capability bits to raise / lower for the task's processes. Carried
    /// through to the launcher; not enforced in-process.
    #[cfg(feature = "capabilities")]
    pub caps_set: u64,
    #[cfg(feature = "capabilities")]
    pub caps_clear: u64,

    #[cfg(feature = "cgroup")]
    pub cgroup: Option<CgroupCfg>,

    pub opts: TaskOpts,
    /// Maximum respawn attempts after failure; -1 means unlimited.
    pub max_retries: i32,
    pub fail_count: i32,
    /// Runtime-settable override suppressing respawn.
    pub inhibit_respawn: bool,

    pub state: TaskState,
    /// The most recent state transition came from a NOTIFY command rather
    /// than the dispatcher.
    pub notified: bool,
    pub pid: Option<libc::pid_t>,

    #[serde(skip)]
    pub create_time: Option<Instant>,
    #[serde(skip)]
    pub start_time: Option<Instant>,
    #[serde(skip)]
    pub end_time: Option<Instant>,
}

impl Task {
    /// An empty task shell. Configuration handlers fill it in;
    /// [`Task::validate`] rejects shells that stayed empty.
    pub fn new(name: &str) -> Self {
        Task {
            name: name.to_string(),
            cmds: Vec::new(),
            stop_cmds: Vec::new(),
            deps: Vec::new(),
            provides: Vec::new(),
            env: EnvSet::new(),
            filters: EnvSet::new(),
            redirs: Vec::new(),
            user: None,
            user_name: None,
            group: None,
            group_name: None,
            #[cfg(feature = "capabilities")]
            caps_set: 0,
            #[cfg(feature = "capabilities")]
            caps_clear: 0,
            #[cfg(feature = "cgroup")]
            cgroup: None,
            opts: TaskOpts::empty(),
            max_retries: -1,
            fail_count: 0,
            inhibit_respawn: false,
            state: TaskState::Loaded,
            notified: false,
            pid: None,
            create_time: Some(Instant::now()),
            start_time: None,
            end_time: None,
        }
    }

    pub fn respawn(&self) -> bool {
        self.opts.contains(TaskOpts::RESPAWN)
    }

    /// A task with neither commands nor dependencies is rejected: a regular
    /// task needs a COMMAND and a meta-task only makes sense with DEPENDS.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidArgument("task has no NAME".into()));
        }
        if self.cmds.is_empty() && self.deps.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "task '{}' has neither COMMAND nor DEPENDS",
                self.name
            )));
        }
        Ok(())
    }

    /// True when the task carries settings that need the launcher helper.
    pub fn needs_launcher(&self) -> bool {
        #[cfg(feature = "capabilities")]
        {
            if self.caps_set != 0 || self.caps_clear != 0 {
                return true;
            }
        }
        #[cfg(feature = "cgroup")]
        {
            if self.cgroup.is_some() {
                return true;
            }
        }
        false
    }
}

//! Building task records from parsed configuration.
//!
//! A table of known keys drives the translation: each key knows whether it
//! may repeat (array-like), whether it may appear in include files, and how
//! to apply its value to the task under construction. `INCLUDE` merges
//! another file restricted to include-safe keys, optionally filtered by an
//! import list.

use std::collections::HashSet;
use std::path::Path;

use log::warn;

use crate::config::reader::{self, ConfigEntry};
use crate::env_set::EnvSet;
use crate::error::{Error, Result};
use crate::global_opts;
use crate::io_redirect::IoRedirect;
use crate::lexer;
use crate::task::{Task, TaskCmd, TaskDep, TaskOpts, TaskProv};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// A regular task configuration file.
    Standard,
    /// An include file merged into a task.
    Include,
}

struct KeyDef {
    key: &'static str,
    array_like: bool,
    include_safe: bool,
    apply: fn(&mut Task, &str) -> Result<()>,
}

fn parse_bool(val: &str) -> Result<bool> {
    match val {
        "YES" => Ok(true),
        "NO" => Ok(false),
        other => Err(Error::Parse(format!(
            "boolean option must be YES or NO, not '{}'",
            other
        ))),
    }
}

fn apply_name(t: &mut Task, val: &str) -> Result<()> {
    if val.is_empty() {
        return Err(Error::Parse("NAME must not be empty".into()));
    }
    t.name = val.to_string();
    Ok(())
}

fn apply_command(t: &mut Task, val: &str) -> Result<()> {
    t.cmds.push(TaskCmd::new(lexer::split_argv(val, true)?)?);
    Ok(())
}

fn apply_stop_command(t: &mut Task, val: &str) -> Result<()> {
    t.stop_cmds.push(TaskCmd::new(lexer::split_argv(val, true)?)?);
    Ok(())
}

fn apply_depends(t: &mut Task, val: &str) -> Result<()> {
    for token in val.split_whitespace() {
        t.deps.push(TaskDep::parse(token)?);
    }
    Ok(())
}

fn apply_provides(t: &mut Task, val: &str) -> Result<()> {
    for token in val.split_whitespace() {
        t.provides.push(TaskProv::parse(token)?);
    }
    Ok(())
}

fn apply_env_set(t: &mut Task, val: &str) -> Result<()> {
    t.env.set_from_directive(val)
}

fn apply_filter_define(t: &mut Task, val: &str) -> Result<()> {
    t.filters.set_from_directive(val)
}

fn apply_io_redirect(t: &mut Task, val: &str) -> Result<()> {
    t.redirs.push(IoRedirect::from_config_value(val)?);
    Ok(())
}

fn apply_respawn(t: &mut Task, val: &str) -> Result<()> {
    t.opts.set(TaskOpts::RESPAWN, parse_bool(val)?);
    Ok(())
}

fn apply_respawn_retries(t: &mut Task, val: &str) -> Result<()> {
    t.max_retries = val
        .parse::<i32>()
        .map_err(|_| Error::Parse(format!("RESPAWN_RETRIES must be an integer, not '{}'", val)))?;
    Ok(())
}

fn apply_user(t: &mut Task, val: &str) -> Result<()> {
    if let Ok(uid) = val.parse::<u32>() {
        t.user = Some(uid);
        t.user_name = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(|u| u.name);
        return Ok(());
    }
    let user = nix::unistd::User::from_name(val)
        .map_err(|e| Error::Parse(format!("could not look up user '{}': {}", val, e)))?
        .ok_or_else(|| Error::Parse(format!("unknown user '{}'", val)))?;
    t.user = Some(user.uid.as_raw());
    t.user_name = Some(user.name);
    Ok(())
}

fn apply_group(t: &mut Task, val: &str) -> Result<()> {
    if let Ok(gid) = val.parse::<u32>() {
        t.group = Some(gid);
        t.group_name = nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
            .ok()
            .flatten()
            .map(|g| g.name);
        return Ok(());
    }
    let group = nix::unistd::Group::from_name(val)
        .map_err(|e| Error::Parse(format!("could not look up group '{}': {}", val, e)))?
        .ok_or_else(|| Error::Parse(format!("unknown group '{}'", val)))?;
    t.group = Some(group.gid.as_raw());
    t.group_name = Some(group.name);
    Ok(())
}

fn apply_include(t: &mut Task, val: &str) -> Result<()> {
    let mut parts = val.split_whitespace();
    let name = parts
        .next()
        .ok_or_else(|| Error::Parse("INCLUDE needs a file name".into()))?;
    let imports: Option<Vec<String>> = parts
        .next()
        .map(|list| list.split(',').map(str::to_string).collect());
    if parts.next().is_some() {
        return Err(Error::Parse(format!("trailing data in INCLUDE value '{}'", val)));
    }
    merge_include(t, name, imports.as_deref())
}

#[cfg(feature = "capabilities")]
mod caps {
    use crate::error::{Error, Result};

    /// Linux capability names, indexed by bit number.
    const CAP_NAMES: &[&str] = &[
        "CAP_CHOWN",
        "CAP_DAC_OVERRIDE",
        "CAP_DAC_READ_SEARCH",
        "CAP_FOWNER",
        "CAP_FSETID",
        "CAP_KILL",
        "CAP_SETGID",
        "CAP_SETUID",
        "CAP_SETPCAP",
        "CAP_LINUX_IMMUTABLE",
        "CAP_NET_BIND_SERVICE",
        "CAP_NET_BROADCAST",
        "CAP_NET_ADMIN",
        "CAP_NET_RAW",
        "CAP_IPC_LOCK",
        "CAP_IPC_OWNER",
        "CAP_SYS_MODULE",
        "CAP_SYS_RAWIO",
        "CAP_SYS_CHROOT",
        "CAP_SYS_PTRACE",
        "CAP_SYS_PACCT",
        "CAP_SYS_ADMIN",
        "CAP_SYS_BOOT",
        "CAP_SYS_NICE",
        "CAP_SYS_RESOURCE",
        "CAP_SYS_TIME",
        "CAP_SYS_TTY_CONFIG",
        "CAP_MKNOD",
        "CAP_LEASE",
        "CAP_AUDIT_WRITE",
        "CAP_AUDIT_CONTROL",
        "CAP_SETFCAP",
        "CAP_MAC_OVERRIDE",
        "CAP_MAC_ADMIN",
        "CAP_SYSLOG",
        "CAP_WAKE_ALARM",
        "CAP_BLOCK_SUSPEND",
        "CAP_AUDIT_READ",
        "CAP_PERFMON",
        "CAP_BPF",
        "CAP_CHECKPOINT_RESTORE",
    ];

    /// Parse a whitespace-separated list of capability names into a bitmask.
    pub fn parse_mask(val: &str) -> Result<u64> {
        let mut mask = 0u64;
        for token in val.split_whitespace() {
            let bit = CAP_NAMES
                .iter()
                .position(|&n| n == token)
                .ok_or_else(|| Error::Parse(format!("unknown capability '{}'", token)))?;
            mask |= 1 << bit;
        }
        Ok(mask)
    }
}

#[cfg(feature = "capabilities")]
fn apply_cap_set(t: &mut Task, val: &str) -> Result<()> {
    t.caps_set |= caps::parse_mask(val)?;
    Ok(())
}

#[cfg(feature = "capabilities")]
fn apply_cap_clear(t: &mut Task, val: &str) -> Result<()> {
    t.caps_clear |= caps::parse_mask(val)?;
    Ok(())
}

#[cfg(feature = "cgroup")]
fn apply_cgroup_name(t: &mut Task, val: &str) -> Result<()> {
    if val.is_empty() || val.contains('/') {
        return Err(Error::Parse(format!("invalid CGROUP_NAME '{}'", val)));
    }
    t.cgroup.get_or_insert_with(Default::default).name = val.to_string();
    Ok(())
}

#[cfg(feature = "cgroup")]
fn apply_cgroup_params(t: &mut Task, val: &str) -> Result<()> {
    t.cgroup
        .get_or_insert_with(Default::default)
        .params
        .push(val.to_string());
    Ok(())
}

static TASK_KEYS: &[KeyDef] = &[
    KeyDef { key: "NAME", array_like: false, include_safe: false, apply: apply_name },
    KeyDef { key: "COMMAND", array_like: true, include_safe: false, apply: apply_command },
    KeyDef { key: "STOP_COMMAND", array_like: true, include_safe: false, apply: apply_stop_command },
    KeyDef { key: "DEPENDS", array_like: true, include_safe: true, apply: apply_depends },
    KeyDef { key: "PROVIDES", array_like: true, include_safe: false, apply: apply_provides },
    KeyDef { key: "ENV_SET", array_like: true, include_safe: true, apply: apply_env_set },
    KeyDef { key: "FILTER_DEFINE", array_like: true, include_safe: true, apply: apply_filter_define },
    KeyDef { key: "IO_REDIRECT", array_like: true, include_safe: true, apply: apply_io_redirect },
    KeyDef { key: "INCLUDE", array_like: true, include_safe: false, apply: apply_include },
    KeyDef { key: "RESPAWN", array_like: false, include_safe: false, apply: apply_respawn },
    KeyDef { key: "RESPAWN_RETRIES", array_like: false, include_safe: false, apply: apply_respawn_retries },
    KeyDef { key: "USER", array_like: false, include_safe: false, apply: apply_user },
    KeyDef { key: "GROUP", array_like: false, include_safe: false, apply: apply_group },
];

#[cfg(feature = "capabilities")]
static CAP_KEYS: &[KeyDef] = &[
    KeyDef { key: "CAPABILITY_SET", array_like: true, include_safe: false, apply: apply_cap_set },
    KeyDef { key: "CAPABILITY_CLEAR", array_like: true, include_safe: false, apply: apply_cap_clear },
];

#[cfg(feature = "cgroup")]
static CGROUP_KEYS: &[KeyDef] = &[
    KeyDef { key: "CGROUP_NAME", array_like: false, include_safe: false, apply: apply_cgroup_name },
    KeyDef { key: "CGROUP_PARAMS", array_like: true, include_safe: false, apply: apply_cgroup_params },
];

fn find_key(key: &str) -> Option<&'static KeyDef> {
    let found = TASK_KEYS.iter().find(|d| d.key == key);
    #[cfg(feature = "capabilities")]
    let found = found.or_else(|| CAP_KEYS.iter().find(|d| d.key == key));
    #[cfg(feature = "cgroup")]
    let found = found.or_else(|| CGROUP_KEYS.iter().find(|d| d.key == key));
    found
}

/// Apply a parsed key/value list to a task under construction.
pub(crate) fn apply_entries(
    task: &mut Task,
    entries: &[ConfigEntry],
    kind: SourceKind,
    imports: Option<&[String]>,
) -> Result<()> {
    if let Some(imports) = imports {
        for name in imports {
            match find_key(name) {
                Some(def) if def.include_safe => {}
                _ => {
                    return Err(Error::Parse(format!(
                        "unexpected key '{}' in include import list",
                        name
                    )))
                }
            }
        }
    }
    let mut seen: HashSet<&'static str> = HashSet::new();
    for entry in entries {
        let def = match find_key(&entry.key) {
            Some(def) => def,
            None => {
                warn!("unknown configuration key '{}'", entry.key);
                continue;
            }
        };
        if kind == SourceKind::Include && !def.include_safe {
            return Err(Error::Parse(format!(
                "key '{}' is not allowed in include files",
                def.key
            )));
        }
        if !def.array_like && !seen.insert(def.key) {
            return Err(Error::Parse(format!(
                "multiple values for non-array key '{}'",
                def.key
            )));
        }
        if let Some(imports) = imports {
            if !imports.iter().any(|n| n == def.key) {
                continue;
            }
        }
        (def.apply)(task, &entry.val)?;
    }
    Ok(())
}

/// Merge the include file `<INCLUDEDIR>/<name><INCLUDE_SUFFIX>` into `task`,
/// restricted to include-safe keys and optionally to `imports`.
pub fn merge_include(task: &mut Task, name: &str, imports: Option<&[String]>) -> Result<()> {
    let path = global_opts::include_dir().join(format!("{}{}", name, global_opts::include_suffix()));
    let entries = reader::parse_file(&path)?;
    apply_entries(task, &entries, SourceKind::Include, imports)
}

/// Build a task from an already-parsed key/value list.
///
/// The task's environment and filter sets start out as copies of the global
/// sets; directives in the file update those copies.
pub fn task_from_entries(entries: &[ConfigEntry]) -> Result<Task> {
    let mut task = Task::new("");
    let (env, filters): (EnvSet, EnvSet) = {
        let g = global_opts::lock();
        (g.env.clone(), g.filters.clone())
    };
    task.env = env;
    task.filters = filters;

    apply_entries(&mut task, entries, SourceKind::Standard, None)?;
    task.validate()?;
    Ok(task)
}

/// Parse a task configuration file into a task record.
pub fn task_from_file(path: &Path) -> Result<Task> {
    let entries = reader::parse_file(path)?;
    task_from_entries(&entries)
}

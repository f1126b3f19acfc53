//! Series (global) configuration loading.
//!
//! A series file sets process-wide options and names the set of task files
//! to load, either explicitly via `TASKS` or implicitly by scanning
//! `TASKDIR`. Loading a series updates the global option storage and
//! returns the resulting file series.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use log::warn;

use crate::config::reader;
use crate::error::{Error, Result};
use crate::file_series::FileSeries;
use crate::global_opts;
use crate::lexer;
use crate::logger;

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

/// Keys accepted in a series file; `true` marks array-like keys.
static SERIES_KEYS: &[(&str, bool)] = &[
    ("TASKS", true),
    ("TASKDIR", false),
    ("TASKDIR_FOLLOW_SYMLINKS", false),
    ("TASK_FILE_SUFFIX", false),
    ("INCLUDEDIR", false),
    ("INCLUDE_SUFFIX", false),
    ("DEBUG", false),
    ("SHUTDOWN_GRACE_PERIOD_US", false),
    ("USE_SYSLOG", false),
    ("USE_ELOS", false),
    ("ELOS_SERVER", false),
    ("ELOS_PORT", false),
    ("ELOS_EVENT_POLL_INTERVAL", false),
    ("LAUNCHER_CMD", false),
    ("ENV_SET", true),
    ("FILTER_DEFINE", true),
];

/// Load a series file, updating the global options and returning the task
/// file series to be parsed.
pub fn load_series(path: &Path) -> Result<FileSeries> {
    if !path.is_absolute() {
        return Err(Error::InvalidArgument(format!(
            "series file path must be absolute: '{}'",
            path.display()
        )));
    }
    let entries = reader::parse_file(path)?;

    let mut seen: HashSet<&'static str> = HashSet::new();
    {
        let mut g = global_opts::lock();
        for entry in &entries {
            let def = SERIES_KEYS.iter().find(|(k, _)| *k == entry.key);
            let (key, array_like) = match def {
                Some(&(k, a)) => (k, a),
                None => {
                    warn!("unknown configuration key '{}'", entry.key);
                    continue;
                }
            };
            if !array_like && !seen.insert(key) {
                return Err(Error::Parse(format!(
                    "multiple values for non-array key '{}'",
                    key
                )));
            }
            let val = entry.val.as_str();
            match key {
                "TASKS" => {
                    let names = lexer::split_argv(val, true)?;
                    g.tasks.get_or_insert_with(Vec::new).extend(names);
                }
                "TASKDIR" => g.task_dir = PathBuf::from(val),
                "TASKDIR_FOLLOW_SYMLINKS" => g.task_dir_follow_symlinks = parse_bool(val)?,
                "TASK_FILE_SUFFIX" => g.task_file_suffix = val.to_string(),
                "INCLUDEDIR" => g.incl_dir = Some(PathBuf::from(val)),
                "INCLUDE_SUFFIX" => g.incl_suffix = val.to_string(),
                "DEBUG" => {
                    g.debug = parse_bool(val)?;
                    logger::set_debug(g.debug);
                }
                "SHUTDOWN_GRACE_PERIOD_US" => {
                    g.shutdown_grace_us = val.parse::<u64>().map_err(|_| {
                        Error::Parse(format!(
                            "SHUTDOWN_GRACE_PERIOD_US must be an integer, not '{}'",
                            val
                        ))
                    })?;
                }
                "USE_SYSLOG" => {
                    g.use_syslog = parse_bool(val)?;
                    if g.use_syslog {
                        logger::set_sink(logger::Sink::Syslog);
                    }
                }
                "USE_ELOS" => g.use_elos = parse_bool(val)?,
                "ELOS_SERVER" => g.elos_server = Some(val.to_string()),
                "ELOS_PORT" => {
                    g.elos_port = Some(val.parse::<u16>().map_err(|_| {
                        Error::Parse(format!("ELOS_PORT must be a port number, not '{}'", val))
                    })?);
                }
                "ELOS_EVENT_POLL_INTERVAL" => {
                    g.elos_poll_interval_us = val.parse::<u64>().map_err(|_| {
                        Error::Parse(format!(
                            "ELOS_EVENT_POLL_INTERVAL must be an integer, not '{}'",
                            val
                        ))
                    })?;
                }
                "LAUNCHER_CMD" => g.launcher_cmd = Some(PathBuf::from(val)),
                "ENV_SET" => g.env.set_from_directive(val)?,
                "FILTER_DEFINE" => g.filters.set_from_directive(val)?,
                _ => unreachable!(),
            }
        }

        // An event-log connection without a reachable server is useless;
        // drop the toggle rather than fail the boot.
        if g.use_elos
            && (g.elos_server.as_deref().map_or(true, str::is_empty) || g.elos_port.is_none())
        {
            warn!("event log requested but server/port missing, disabling");
            g.use_elos = false;
        }
    }

    let (tasks, task_dir, suffix, follow) = {
        let g = global_opts::lock();
        (
            g.tasks.clone(),
            g.task_dir.clone(),
            g.task_file_suffix.clone(),
            g.task_dir_follow_symlinks,
        )
    };
    match tasks {
        Some(names) => Ok(FileSeries::from_names(&task_dir, names)),
        None => FileSeries::from_dir(&task_dir, &suffix, follow),
    }
}

//! Kernel command line handling.
//!
//! At startup the daemon scans the kernel command line (default
//! `/proc/cmdline`) for `rinit.<key>=<value>` settings and applies the
//! recognized ones to the global options. Unknown keys only produce a
//! warning, so newer images keep booting with older daemons.

use std::fs;
use std::path::{Path, PathBuf};

use log::warn;

use crate::error::{Error, Result};
use crate::global_opts;
use crate::lexer;

pub const DEFAULT_CMDLINE_PATH: &str = "/proc/cmdline";

/// Prefix of daemon settings on the kernel command line.
const KEY_PREFIX: &str = "rinit";

fn parse_bool(val: &str) -> Result<bool> {
    if val.eq_ignore_ascii_case("yes") {
        Ok(true)
    } else if val.eq_ignore_ascii_case("no") {
        Ok(false)
    } else {
        Err(Error::Parse(format!(
            "boolean option must be yes or no, not '{}'",
            val
        )))
    }
}

/// Read and apply the kernel command line.
pub fn parse(path: Option<&Path>) -> Result<()> {
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CMDLINE_PATH));
    let text = fs::read_to_string(path)?;
    let line = text.lines().next().unwrap_or("");
    apply(line)
}

fn apply(line: &str) -> Result<()> {
    for (key, val) in lexer::scan_cmdline_vars(line, KEY_PREFIX) {
        match key.as_str() {
            "sigkeydir" => global_opts::lock().sig_key_dir = PathBuf::from(&val),
            "signatures" => global_opts::lock().signatures = parse_bool(&val)?,
            _ => warn!(
                "unknown configuration setting '{}.{}={}' on kernel command line",
                KEY_PREFIX, key, val
            ),
        }
    }
    Ok(())
}

//! I/O redirection records for task commands.
//!
//! Value grammar: `<FROM> <TO> [TRUNCATE|APPEND|PIPE] [OCTAL_MODE]` where
//! `FROM` is one of `STDOUT`, `STDERR`, `STDIN` and `TO` is another of the
//! three or an absolute path. Defaults to truncate-and-create with mode
//! 0644; stdin redirections are forced read-only; `PIPE` requires the path
//! to be (or become) a FIFO.

use std::os::unix::io::RawFd;
use std::path::PathBuf;

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use crate::error::{Error, Result};
use crate::lexer;

pub const STDIN_NAME: &str = "STDIN";
pub const STDOUT_NAME: &str = "STDOUT";
pub const STDERR_NAME: &str = "STDERR";

/// Where a redirected stream points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirTarget {
    /// Duplicate one of the three standard streams.
    Stream(RawFd),
    /// Open (or create) a file at an absolute path.
    Path(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoRedirect {
    /// The standard stream being replaced (0, 1 or 2).
    pub stream: RawFd,
    pub target: RedirTarget,
    /// Open flags used when the target is a path.
    pub oflags: OFlag,
    /// File mode for newly created files.
    pub mode: Mode,
    /// Target must be a FIFO special file.
    pub fifo: bool,
}

fn stream_fd(name: &str) -> Option<RawFd> {
    match name {
        STDIN_NAME => Some(libc::STDIN_FILENO),
        STDOUT_NAME => Some(libc::STDOUT_FILENO),
        STDERR_NAME => Some(libc::STDERR_FILENO),
        _ => None,
    }
}

fn stream_name(fd: RawFd) -> &'static str {
    match fd {
        libc::STDIN_FILENO => STDIN_NAME,
        libc::STDOUT_FILENO => STDOUT_NAME,
        _ => STDERR_NAME,
    }
}

impl IoRedirect {
    /// Parse an `IO_REDIRECT` configuration value.
    pub fn from_config_value(val: &str) -> Result<IoRedirect> {
        let params = lexer::split_argv(val, true)?;
        if params.len() < 2 {
            return Err(Error::Parse(format!(
                "IO redirection needs at least a source and a target: '{}'",
                val
            )));
        }

        let stream = stream_fd(&params[0]).ok_or_else(|| {
            Error::Parse(format!(
                "redirection source must be STDOUT, STDERR or STDIN, not '{}'",
                params[0]
            ))
        })?;

        let target = match stream_fd(&params[1]) {
            Some(fd) => RedirTarget::Stream(fd),
            None if params[1].starts_with('/') => RedirTarget::Path(PathBuf::from(&params[1])),
            None => {
                return Err(Error::Parse(format!(
                    "redirection target must be a standard stream or an absolute path: '{}'",
                    params[1]
                )))
            }
        };

        let mut oflags = OFlag::O_TRUNC | OFlag::O_CREAT;
        let mut mode = Mode::from_bits_truncate(0o644);
        let mut fifo = false;

        if let RedirTarget::Path(_) = target {
            if let Some(kind) = params.get(2) {
                match kind.as_str() {
                    "TRUNCATE" => oflags = OFlag::O_TRUNC | OFlag::O_CREAT,
                    "APPEND" => oflags = OFlag::O_APPEND | OFlag::O_CREAT,
                    "PIPE" => {
                        oflags = OFlag::empty();
                        fifo = true;
                    }
                    other => {
                        return Err(Error::Parse(format!(
                            "third redirection parameter must be TRUNCATE, APPEND or PIPE, not '{}'",
                            other
                        )))
                    }
                }
            }
            if let Some(m) = params.get(3) {
                let bits = u32::from_str_radix(m, 8)
                    .map_err(|_| Error::Parse(format!("'{}' is not an octal file mode", m)))?;
                if bits > 0o777 {
                    return Err(Error::Parse(format!("0{:o} is not a supported file mode", bits)));
                }
                mode = Mode::from_bits_truncate(bits);
            }
            if stream == libc::STDIN_FILENO {
                oflags = OFlag::O_RDONLY;
            } else {
                oflags |= OFlag::O_WRONLY;
            }
        }

        Ok(IoRedirect {
            stream,
            target,
            oflags,
            mode,
            fifo,
        })
    }
}

impl Serialize for IoRedirect {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut st = serializer.serialize_struct("IoRedirect", 5)?;
        st.serialize_field("stream", stream_name(self.stream))?;
        match &self.target {
            RedirTarget::Stream(fd) => st.serialize_field("target", stream_name(*fd))?,
            RedirTarget::Path(p) => st.serialize_field("target", &p.display().to_string())?,
        }
        st.serialize_field("oflags", &self.oflags.bits())?;
        st.serialize_field("mode", &format!("0{:o}", self.mode.bits()))?;
        st.serialize_field("fifo", &self.fifo)?;
        st.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_to_stream() {
        let r = IoRedirect::from_config_value("STDERR STDOUT").unwrap();
        assert_eq!(r.stream, libc::STDERR_FILENO);
        assert_eq!(r.target, RedirTarget::Stream(libc::STDOUT_FILENO));
        assert!(!r.fifo);
    }

    #[test]
    fn file_target_with_defaults() {
        let r = IoRedirect::from_config_value("STDOUT /var/log/app.log").unwrap();
        assert_eq!(r.target, RedirTarget::Path(PathBuf::from("/var/log/app.log")));
        assert!(r.oflags.contains(OFlag::O_TRUNC | OFlag::O_CREAT | OFlag::O_WRONLY));
        assert_eq!(r.mode.bits() & 0o777, 0o644);
    }

    #[test]
    fn append_and_mode() {
        let r = IoRedirect::from_config_value("STDOUT /tmp/o APPEND 0600").unwrap();
        assert!(r.oflags.contains(OFlag::O_APPEND | OFlag::O_WRONLY));
        assert!(!r.oflags.contains(OFlag::O_TRUNC));
        assert_eq!(r.mode.bits() & 0o777, 0o600);
    }

    #[test]
    fn stdin_is_read_only() {
        let r = IoRedirect::from_config_value("STDIN /etc/input").unwrap();
        assert_eq!(r.oflags, OFlag::O_RDONLY);
    }

    #[test]
    fn pipe_sets_fifo() {
        let r = IoRedirect::from_config_value("STDOUT /run/fifo PIPE").unwrap();
        assert!(r.fifo);
        assert!(r.oflags.contains(OFlag::O_WRONLY));
        assert!(!r.oflags.contains(OFlag::O_CREAT));
    }

    #[test]
    fn rejects_relative_path_and_bad_mode() {
        assert!(IoRedirect::from_config_value("STDOUT relative/path").is_err());
        assert!(IoRedirect::from_config_value("STDOUT /tmp/o TRUNCATE 9999").is_err());
        assert!(IoRedirect::from_config_value("STDOUT").is_err());
    }
}

//! The daemon's logging sink.
//!
//! A process-wide [`log::Log`] implementation with an internal mutex so that
//! output lines are atomic with respect to each other. The destination is
//! selectable at runtime between an stderr stream, `syslog(3)` and
//! `/dev/kmsg`. Debug-level output is gated on the `DEBUG` global setting.
//!
//! Event codes (e.g. `ipc-not-authorized`) are passed as `log` targets:
//! `warn!(target: "ipc-not-authorized", ...)`.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

use log::{Level, LevelFilter, Log, Metadata, Record};

/// Identification string for syslog. glibc keeps the pointer, so this must
/// stay alive for the process lifetime.
const SYSLOG_IDENT: &[u8] = b"rinit\0";

/// Prefix put in front of every line written to a plain stream.
const PRINT_PREFIX: &str = "[rinit] ";

/// Selectable logging destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sink {
    /// Plain lines on stderr. The default, and the only sink available
    /// before any configuration has been read.
    Stream,
    /// `syslog(3)` with facility `LOG_DAEMON`.
    Syslog,
    /// The kernel ring buffer via `/dev/kmsg`.
    Kmsg,
}

struct SinkState {
    sink: Sink,
    debug: bool,
    kmsg: Option<File>,
    syslog_open: bool,
}

pub struct Logger {
    state: Mutex<SinkState>,
}

lazy_static::lazy_static! {
    static ref LOGGER: Logger = Logger {
        state: Mutex::new(SinkState {
            sink: Sink::Stream,
            debug: false,
            kmsg: None,
            syslog_open: false,
        }),
    };
}

/// Install the sink as the process logger. Called once at startup; later
/// calls are no-ops.
pub fn init() {
    if log::set_logger(&*LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}

/// Switch the logging destination.
pub fn set_sink(sink: Sink) {
    let mut st = LOGGER.state.lock().unwrap();
    if sink == Sink::Syslog && !st.syslog_open {
        unsafe {
            libc::openlog(
                SYSLOG_IDENT.as_ptr() as *const libc::c_char,
                libc::LOG_CONS,
                libc::LOG_DAEMON,
            );
        }
        st.syslog_open = true;
    }
    if sink == Sink::Kmsg && st.kmsg.is_none() {
        st.kmsg = OpenOptions::new().write(true).open("/dev/kmsg").ok();
    }
    st.sink = sink;
}

/// Enable or disable debug-level output.
pub fn set_debug(debug: bool) {
    LOGGER.state.lock().unwrap().debug = debug;
}

fn syslog_priority(level: Level) -> libc::c_int {
    match level {
        Level::Error => libc::LOG_ERR,
        Level::Warn => libc::LOG_WARNING,
        Level::Info => libc::LOG_INFO,
        Level::Debug | Level::Trace => libc::LOG_DEBUG,
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if metadata.level() >= Level::Debug {
            return self.state.lock().unwrap().debug;
        }
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // Print the target only when it carries an event code rather than
        // the default module path.
        let code = match record.module_path() {
            Some(mp) if mp == record.target() => None,
            _ => Some(record.target()),
        };
        let line = match code {
            Some(code) => format!("{} ({}): {}", record.level(), code, record.args()),
            None => format!("{}: {}", record.level(), record.args()),
        };

        let mut st = self.state.lock().unwrap();
        match st.sink {
            Sink::Stream => {
                let _ = writeln!(std::io::stderr(), "{}{}", PRINT_PREFIX, line);
            }
            Sink::Syslog => {
                if let Ok(msg) = CString::new(line) {
                    unsafe {
                        libc::syslog(
                            syslog_priority(record.level()) | libc::LOG_DAEMON,
                            b"%s\0".as_ptr() as *const libc::c_char,
                            msg.as_ptr(),
                        );
                    }
                }
            }
            Sink::Kmsg => {
                let prio = syslog_priority(record.level());
                if let Some(kmsg) = st.kmsg.as_mut() {
                    let _ = writeln!(kmsg, "<{}>rinit: {}", prio, line);
                }
            }
        }
    }

    fn flush(&self) {}
}

use std::io;

/// Crate-wide error type.
///
/// Every fallible operation in the daemon resolves to one of these
/// categories. Runtime-command handlers map them onto one-line `RES_ERR`
/// reasons; everything else propagates with `?` up to the component
/// boundary where it is logged.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("resource exhausted: {0}")]
    Resource(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short reason line suitable for a `RES_ERR` response argument.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

//! Version information reported by `--version` and the GETVER runtime
//! command.

pub const MAJOR: &str = env!("CARGO_PKG_VERSION_MAJOR");
pub const MINOR: &str = env!("CARGO_PKG_VERSION_MINOR");
pub const MICRO: &str = env!("CARGO_PKG_VERSION_PATCH");

/// Build identifier, settable at build time via the `RINIT_BUILD_ID`
/// environment variable (e.g. a VCS hash injected by the packaging).
pub const BUILD_ID: &str = match option_env!("RINIT_BUILD_ID") {
    Some(id) => id,
    None => "dev",
};

pub fn version_string() -> String {
    format!("{}.{}.{}+{}", MAJOR, MINOR, MICRO, BUILD_ID)
}

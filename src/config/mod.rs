//! Configuration loading.
//!
//! `reader` turns a file into an ordered key/value list, `task_file` builds
//! task records from such lists (including include-file merging), and
//! `series_file` loads the global series configuration and produces the
//! task file series to load.

pub mod reader;
pub mod series_file;
pub mod task_file;

pub use reader::{parse_file, ConfigEntry};
pub use series_file::load_series;
pub use task_file::{task_from_entries, task_from_file};

//! Ordered lists of task/include configuration filenames.
//!
//! Either the result of scanning a directory for files with the configured
//! suffix, or built from an explicit `TASKS` list in a series file.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub struct FileSeries {
    pub base_dir: PathBuf,
    pub fnames: Vec<String>,
}

impl FileSeries {
    /// Scan `dir` for regular files ending in `suffix`, sorted by name.
    ///
    /// Symlinks are followed only when `follow_symlinks` is set; otherwise
    /// they are filtered out even if their target would qualify.
    pub fn from_dir(dir: &Path, suffix: &str, follow_symlinks: bool) -> Result<FileSeries> {
        let mut fnames = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(n) => n,
                Err(_) => continue,
            };
            if !name.ends_with(suffix) {
                continue;
            }
            let lmeta = entry.path().symlink_metadata()?;
            let is_file = if lmeta.file_type().is_symlink() {
                follow_symlinks && entry.path().metadata().map(|m| m.is_file()).unwrap_or(false)
            } else {
                lmeta.is_file()
            };
            if is_file {
                fnames.push(name);
            }
        }
        fnames.sort();
        Ok(FileSeries {
            base_dir: dir.to_path_buf(),
            fnames,
        })
    }

    /// Use an explicit file list, resolved against `base_dir` unless a name
    /// is already absolute.
    pub fn from_names(base_dir: &Path, fnames: Vec<String>) -> FileSeries {
        FileSeries {
            base_dir: base_dir.to_path_buf(),
            fnames,
        }
    }

    /// Full paths of all files in series order.
    pub fn paths(&self) -> impl Iterator<Item = PathBuf> + '_ {
        self.fnames.iter().map(move |n| {
            let p = Path::new(n);
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                self.base_dir.join(n)
            }
        })
    }

    pub fn len(&self) -> usize {
        self.fnames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fnames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    #[test]
    fn scan_filters_by_suffix_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in &["b.task", "a.task", "ignored.conf", "sub.task.bak"] {
            File::create(dir.path().join(name))
                .unwrap()
                .write_all(b"NAME = x\n")
                .unwrap();
        }
        fs::create_dir(dir.path().join("dir.task")).unwrap();

        let fs = FileSeries::from_dir(dir.path(), ".task", false).unwrap();
        assert_eq!(fs.fnames, vec!["a.task", "b.task"]);
    }

    #[test]
    fn symlinks_respect_policy() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("real.task")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("real.task"), dir.path().join("link.task"))
            .unwrap();

        let no_follow = FileSeries::from_dir(dir.path(), ".task", false).unwrap();
        assert_eq!(no_follow.fnames, vec!["real.task"]);

        let follow = FileSeries::from_dir(dir.path(), ".task", true).unwrap();
        assert_eq!(follow.fnames, vec!["link.task", "real.task"]);
    }

    #[test]
    fn paths_resolve_relative_names() {
        let fs = FileSeries::from_names(
            Path::new("/etc/rinit"),
            vec!["one.task".into(), "/abs/two.task".into()],
        );
        let paths: Vec<_> = fs.paths().collect();
        assert_eq!(paths[0], PathBuf::from("/etc/rinit/one.task"));
        assert_eq!(paths[1], PathBuf::from("/abs/two.task"));
    }
}

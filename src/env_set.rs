//! Ordered sets of `NAME=VALUE` pairs.
//!
//! Used for task environments and for the opaque filter definitions handed
//! to external event-filter collaborators. Entries keep their insertion
//! order (later `ENV_SET` directives may reference earlier ones); updating
//! an existing name replaces the value in place.

use std::ffi::CString;

use serde::Serialize;

use crate::error::Result;
use crate::lexer;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnvSet {
    entries: Vec<(String, String)>,
}

impl EnvSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Insert or update a variable, preserving insertion order on update.
    pub fn set(&mut self, name: &str, value: &str) {
        match self.entries.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = value.to_string(),
            None => self.entries.push((name.to_string(), value.to_string())),
        }
    }

    /// Apply an `ENV_SET` directive (`NAME "VALUE"`).
    ///
    /// Escape sequences in the value are resolved and `${NAME}` references
    /// are expanded against the set as it stands, so earlier definitions in
    /// the same set are visible.
    pub fn set_from_directive(&mut self, directive: &str) -> Result<()> {
        let (name, raw) = lexer::split_env_directive(directive)?;
        let value = lexer::expand_value(&raw, |n| self.get(n).map(str::to_string))?;
        self.set(&name, &value);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Render as `NAME=VALUE` C strings for `execve`. Entries with an
    /// interior NUL are skipped.
    pub fn to_cstring_vec(&self) -> Vec<CString> {
        self.entries
            .iter()
            .filter_map(|(k, v)| CString::new(format!("{}={}", k, v)).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_preserves_order_and_updates_in_place() {
        let mut es = EnvSet::new();
        es.set("A", "1");
        es.set("B", "2");
        es.set("A", "3");
        let pairs: Vec<_> = es.iter().collect();
        assert_eq!(pairs, vec![("A", "3"), ("B", "2")]);
    }

    #[test]
    fn directive_expands_against_earlier_entries() {
        let mut es = EnvSet::new();
        es.set_from_directive(r#"PATH "/usr/bin""#).unwrap();
        es.set_from_directive(r#"PATH "${PATH}:/sbin""#).unwrap();
        assert_eq!(es.get("PATH"), Some("/usr/bin:/sbin"));
    }

    #[test]
    fn directive_resolves_escapes() {
        let mut es = EnvSet::new();
        es.set_from_directive(r#"GREETING "hi\x21\n""#).unwrap();
        assert_eq!(es.get("GREETING"), Some("hi!\n"));
    }

    #[test]
    fn unknown_reference_expands_empty() {
        let mut es = EnvSet::new();
        es.set_from_directive(r#"X "a${NOPE}b""#).unwrap();
        assert_eq!(es.get("X"), Some("ab"));
    }

    #[test]
    fn cstring_rendering() {
        let mut es = EnvSet::new();
        es.set("A", "1");
        let v = es.to_cstring_vec();
        assert_eq!(v[0].to_str().unwrap(), "A=1");
    }
}

//! Line-based `KEY = VALUE` configuration reader.
//!
//! The format is INI minus sections: one pair per line, `#` or `;` starts a
//! comment line, values may be wrapped in double quotes to preserve leading
//! or trailing whitespace. Array-like options simply repeat their key; the
//! reader preserves file order and leaves interpretation to the consumers.

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEntry {
    pub key: String,
    pub val: String,
}

/// Parse a configuration file into an ordered key/value list.
pub fn parse_file(path: &Path) -> Result<Vec<ConfigEntry>> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::Parse(format!("could not read '{}': {}", path.display(), e)))?;
    parse_str(&text).map_err(|e| match e {
        Error::Parse(msg) => Error::Parse(format!("{}: {}", path.display(), msg)),
        other => other,
    })
}

pub fn parse_str(text: &str) -> Result<Vec<ConfigEntry>> {
    let mut entries = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let eq = line.find('=').ok_or_else(|| {
            Error::Parse(format!("line {}: expected KEY = VALUE", lineno + 1))
        })?;
        let key = line[..eq].trim();
        if key.is_empty() {
            return Err(Error::Parse(format!("line {}: empty key", lineno + 1)));
        }
        let mut val = line[eq + 1..].trim();
        // Strip one pair of surrounding double quotes.
        if val.len() >= 2 && val.starts_with('"') && val.ends_with('"') {
            val = &val[1..val.len() - 1];
        }
        entries.push(ConfigEntry {
            key: key.to_string(),
            val: val.to_string(),
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pairs_in_order_with_comments() {
        let entries = parse_str(
            "# header\nNAME = foo\n; note\nCOMMAND = /bin/a\nCOMMAND = /bin/b arg\n",
        )
        .unwrap();
        let pairs: Vec<_> = entries.iter().map(|e| (e.key.as_str(), e.val.as_str())).collect();
        assert_eq!(
            pairs,
            vec![("NAME", "foo"), ("COMMAND", "/bin/a"), ("COMMAND", "/bin/b arg")]
        );
    }

    #[test]
    fn strips_surrounding_quotes() {
        let entries = parse_str("GREETING = \"  hello  \"\n").unwrap();
        assert_eq!(entries[0].val, "  hello  ");
    }

    #[test]
    fn rejects_lines_without_equals() {
        assert!(parse_str("NAME foo\n").is_err());
        assert!(parse_str("= value\n").is_err());
    }
}

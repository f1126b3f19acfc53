//! Tokenizers for configuration values.
//!
//! Configuration files hand the daemon flat `KEY = VALUE` pairs; the value
//! side has its own micro-grammars (argv-like arrays, `NAME "VALUE"`
//! environment directives, kernel command line variables). The functions
//! here turn those strings into structured data without any opinion about
//! the surrounding file format.

use crate::error::{Error, Result};

/// Resolve backslash escape sequences in `src`.
///
/// Supported: `\a \b \f \n \r \t \v \\ \" \' \$` and `\xNN` with two hex
/// digits. Anything else is a parse error.
pub fn resolve_escapes(src: &str) -> Result<String> {
    let mut out = String::with_capacity(src.len());
    let mut it = src.chars();
    while let Some(c) = it.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match it.next() {
            Some('a') => out.push('\x07'),
            Some('b') => out.push('\x08'),
            Some('f') => out.push('\x0c'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('v') => out.push('\x0b'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('\'') => out.push('\''),
            Some('$') => out.push('$'),
            Some('x') => {
                let hi = it.next();
                let lo = it.next();
                let (hi, lo) = match (hi, lo) {
                    (Some(h), Some(l)) => (h, l),
                    _ => return Err(Error::Parse("truncated \\x escape".into())),
                };
                let num = u8::from_str_radix(&format!("{}{}", hi, lo), 16)
                    .map_err(|_| Error::Parse(format!("invalid \\x escape \\x{}{}", hi, lo)))?;
                out.push(num as char);
            }
            Some(c) => return Err(Error::Parse(format!("unknown escape sequence \\{}", c))),
            None => return Err(Error::Parse("dangling backslash".into())),
        }
    }
    Ok(out)
}

/// Split a configuration value into an argv-like array.
///
/// Tokens are separated by whitespace. With `double_quoting`, a token may be
/// enclosed in double quotes to protect whitespace. Escape sequences are
/// resolved in both quoted and unquoted tokens.
pub fn split_argv(val: &str, double_quoting: bool) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let bytes: Vec<char> = val.chars().collect();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_whitespace() {
            i += 1;
            continue;
        }
        let mut raw = String::new();
        if double_quoting && bytes[i] == '"' {
            i += 1;
            let mut closed = false;
            while i < bytes.len() {
                if bytes[i] == '\\' && i + 1 < bytes.len() {
                    raw.push(bytes[i]);
                    raw.push(bytes[i + 1]);
                    i += 2;
                    continue;
                }
                if bytes[i] == '"' {
                    closed = true;
                    i += 1;
                    break;
                }
                raw.push(bytes[i]);
                i += 1;
            }
            if !closed {
                return Err(Error::Parse(format!("unterminated quote in '{}'", val)));
            }
        } else {
            while i < bytes.len() && !bytes[i].is_whitespace() {
                if bytes[i] == '\\' && i + 1 < bytes.len() {
                    raw.push(bytes[i]);
                    raw.push(bytes[i + 1]);
                    i += 2;
                    continue;
                }
                raw.push(bytes[i]);
                i += 1;
            }
        }
        out.push(resolve_escapes(&raw)?);
    }
    Ok(out)
}

/// Split an environment directive of the form `NAME "VALUE"`.
///
/// Returns the name and the raw (unexpanded, unescaped) value between the
/// quotes. Escape resolution and `${NAME}` expansion happen later against a
/// concrete environment set, see [`expand_value`].
pub fn split_env_directive(val: &str) -> Result<(String, String)> {
    let s = val.trim_start();
    let name_end = s
        .find(|c: char| c.is_whitespace())
        .ok_or_else(|| Error::Parse(format!("missing value in env directive '{}'", val)))?;
    let name = &s[..name_end];
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        || name.chars().next().map_or(false, |c| c.is_ascii_digit())
    {
        return Err(Error::Parse(format!("invalid variable name '{}'", name)));
    }
    let rest = s[name_end..].trim_start();
    if !rest.starts_with('"') {
        return Err(Error::Parse(format!(
            "env directive value must be double-quoted: '{}'",
            val
        )));
    }
    let inner: Vec<char> = rest[1..].chars().collect();
    let mut raw = String::new();
    let mut i = 0;
    let mut closed = false;
    while i < inner.len() {
        if inner[i] == '\\' && i + 1 < inner.len() {
            raw.push(inner[i]);
            raw.push(inner[i + 1]);
            i += 2;
            continue;
        }
        if inner[i] == '"' {
            closed = true;
            i += 1;
            break;
        }
        raw.push(inner[i]);
        i += 1;
    }
    if !closed {
        return Err(Error::Parse(format!("unterminated quote in '{}'", val)));
    }
    if !inner[i..].iter().all(|c| c.is_whitespace()) {
        return Err(Error::Parse(format!(
            "trailing characters after env directive value: '{}'",
            val
        )));
    }
    Ok((name.to_string(), raw))
}

/// Resolve escapes and expand `${NAME}` references in a raw directive value.
///
/// `lookup` supplies variable values; unknown variables expand to the empty
/// string. A `$` not followed by `{` is copied literally.
pub fn expand_value<F>(raw: &str, lookup: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(raw.len());
    let chars: Vec<char> = raw.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '\\' {
            let end = (i + 4).min(chars.len());
            let chunk: String = chars[i..end].iter().collect();
            // Hand the single escape sequence to the shared resolver.
            let seq_len = match chars.get(i + 1) {
                Some('x') => 4,
                Some(_) => 2,
                None => return Err(Error::Parse("dangling backslash".into())),
            };
            if i + seq_len > chars.len() {
                return Err(Error::Parse("truncated escape sequence".into()));
            }
            let seq: String = chunk.chars().take(seq_len).collect();
            out.push_str(&resolve_escapes(&seq)?);
            i += seq_len;
            continue;
        }
        if chars[i] == '$' && chars.get(i + 1) == Some(&'{') {
            let close = chars[i + 2..]
                .iter()
                .position(|&c| c == '}')
                .ok_or_else(|| Error::Parse(format!("unterminated ${{...}} in '{}'", raw)))?;
            let name: String = chars[i + 2..i + 2 + close].iter().collect();
            if let Some(v) = lookup(&name) {
                out.push_str(&v);
            }
            i += close + 3;
            continue;
        }
        out.push(chars[i]);
        i += 1;
    }
    Ok(out)
}

/// Scan a kernel command line for `<prefix>.<key>=<value>` variables.
///
/// Values may be double-quoted to protect whitespace. Tokens that do not
/// match the prefix are ignored.
pub fn scan_cmdline_vars(line: &str, prefix: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let chars: Vec<char> = line.chars().collect();
    let want = format!("{}.", prefix);
    let mut i = 0;
    while i < chars.len() {
        if chars[i].is_whitespace() {
            i += 1;
            continue;
        }
        // Collect one token; a double quote after '=' spans whitespace.
        let mut tok = String::new();
        let mut quoted = false;
        while i < chars.len() {
            let c = chars[i];
            if quoted {
                if c == '"' {
                    quoted = false;
                } else {
                    tok.push(c);
                }
            } else if c == '"' {
                quoted = true;
            } else if c.is_whitespace() {
                break;
            } else {
                tok.push(c);
            }
            i += 1;
        }
        if let Some(rest) = tok.strip_prefix(&want) {
            if let Some(eq) = rest.find('=') {
                let (key, val) = rest.split_at(eq);
                if !key.is_empty() {
                    out.push((key.to_string(), val[1..].to_string()));
                }
            }
        }
    }
    out
}

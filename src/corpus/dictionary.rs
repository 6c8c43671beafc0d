//! libFuzzer-compatible dictionary loading.
//!
//! `spec.md` §3 calls the on-disk format "libFuzzer-compatible textual form" without
//! specifying it byte-for-byte; no `original_source` dictionary parser was retrieved
//! with the pack, so this follows libFuzzer's documented grammar: one entry per line,
//! `name="value"` or bare `"value"`, `#`-prefixed comments and blank lines ignored,
//! `\xHH` hex escapes, and `\\`/`\"` escapes inside the quoted value.

use crate::error::{Error, Result};

/// A set of byte strings used to seed the dictionary-aware mutators.
#[derive(Debug, Clone, Default)]
pub struct Dictionary {
    entries: Vec<Vec<u8>>,
}

impl Dictionary {
    pub fn entries(&self) -> &[Vec<u8>] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parses dictionary text, skipping malformed lines rather than failing the whole
    /// load -- a single bad entry in a hand-edited dictionary file should not prevent
    /// fuzzing from starting.
    pub fn parse(text: &str) -> Self {
        let mut entries = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(value) = parse_entry(line) {
                entries.push(value);
            } else {
                log::warn!("skipping malformed dictionary entry: {line}");
            }
        }
        Dictionary { entries }
    }

    pub async fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(Error::Io)?;
        Ok(Self::parse(&text))
    }
}

/// Extracts and unescapes the quoted value from one dictionary line, which may be
/// preceded by an optional `name=` token (ignored -- this crate does not distinguish
/// named dictionary entries from anonymous ones).
fn parse_entry(line: &str) -> Option<Vec<u8>> {
    let quoted = match line.find('"') {
        Some(start) => &line[start..],
        None => return None,
    };
    let mut chars = quoted.char_indices();
    let (_, opening) = chars.next()?;
    if opening != '"' {
        return None;
    }
    let mut out = Vec::new();
    let bytes = quoted.as_bytes();
    let mut i = 1;
    loop {
        let b = *bytes.get(i)?;
        match b {
            b'"' => return Some(out),
            b'\\' => {
                let next = *bytes.get(i + 1)?;
                match next {
                    b'\\' => {
                        out.push(b'\\');
                        i += 2;
                    }
                    b'"' => {
                        out.push(b'"');
                        i += 2;
                    }
                    b'x' | b'X' => {
                        let hex = bytes.get(i + 2..i + 4)?;
                        let hex = std::str::from_utf8(hex).ok()?;
                        let value = u8::from_str_radix(hex, 16).ok()?;
                        out.push(value);
                        i += 4;
                    }
                    _ => return None,
                }
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_escaped_entries() {
        let dict = Dictionary::parse(
            "# a comment\n\"foo\"\nkw1=\"\\x41\\x42\"\n\n\"with\\\\backslash\"\n",
        );
        assert_eq!(
            dict.entries(),
            &[
                b"foo".to_vec(),
                b"AB".to_vec(),
                b"with\\backslash".to_vec(),
            ]
        );
    }

    #[test]
    fn skips_malformed_lines() {
        let dict = Dictionary::parse("not a dictionary entry\n\"ok\"\n");
        assert_eq!(dict.entries(), &[b"ok".to_vec()]);
    }
}

//! Versioned properties
//!
//! Properties are name → string pairs attached to node versions and to
//! revisions. This module also holds the property block codec used by dump
//! streams:
//!
//! ```text
//! K <name-len>\n<name>\nV <value-len>\n<value>\n   set
//! D <name-len>\n<name>\n                           delete (delta blocks only)
//! PROPS-END\n
//! ```

use crate::error::{FsError, Result};
use std::collections::BTreeMap;

/// Properties of a node version or revision, ordered by name
pub type PropertyMap = BTreeMap<String, String>;

/// One entry of a property block; `None` deletes the property
pub type PropChange = (String, Option<String>);

const PROPS_END: &[u8] = b"PROPS-END\n";

/// Standard property names
pub mod svn_props {
    /// Revision author
    pub const AUTHOR: &str = "svn:author";

    /// Revision log message
    pub const LOG: &str = "svn:log";

    /// Revision timestamp (RFC 3339, UTC)
    pub const DATE: &str = "svn:date";

    /// Executable flag
    pub const EXECUTABLE: &str = "svn:executable";

    /// MIME type
    pub const MIME_TYPE: &str = "svn:mime-type";

    /// Ignore patterns
    pub const IGNORE: &str = "svn:ignore";

    /// Check if a property name is in the reserved namespace
    pub fn is_svn_property(name: &str) -> bool {
        name.starts_with("svn:")
    }
}

/// Apply `changes` to `props` in order
pub fn apply_changes(props: &mut PropertyMap, changes: impl IntoIterator<Item = PropChange>) {
    for (name, value) in changes {
        match value {
            Some(value) => {
                props.insert(name, value);
            }
            None => {
                props.remove(&name);
            }
        }
    }
}

/// Encode a full property block
pub fn encode_block(props: &PropertyMap) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in props {
        out.extend_from_slice(format!("K {}\n", name.len()).as_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(format!("\nV {}\n", value.len()).as_bytes());
        out.extend_from_slice(value.as_bytes());
        out.push(b'\n');
    }
    out.extend_from_slice(PROPS_END);
    out
}

struct BlockReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BlockReader<'a> {
    fn line(&mut self) -> Result<&'a [u8]> {
        let rest = &self.data[self.pos..];
        let Some(nl) = rest.iter().position(|b| *b == b'\n') else {
            return Err(FsError::malformed("property block ends inside a line"));
        };
        self.pos += nl + 1;
        Ok(&rest[..nl])
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end < self.data.len() && self.data[*end] == b'\n')
            .ok_or_else(|| FsError::malformed("property length overruns its block"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end + 1;
        Ok(slice)
    }
}

fn parse_len(line: &[u8], tag: u8) -> Result<usize> {
    let text = std::str::from_utf8(line).map_err(|_| FsError::malformed("non-text property header"))?;
    let prefix = [tag, b' '];
    if !line.starts_with(&prefix) {
        return Err(FsError::malformed(format!("expected '{}' entry in property block, got '{}'", tag as char, text)));
    }
    text[2..]
        .parse()
        .map_err(|_| FsError::malformed(format!("bad property length in '{}'", text)))
}

fn utf8(data: &[u8], what: &str) -> Result<String> {
    String::from_utf8(data.to_vec()).map_err(|_| FsError::malformed(format!("property {} is not UTF-8", what)))
}

/// Parse a property block into its entries, in stream order.
///
/// `D` entries are only accepted when `allow_deletes` is set. Bytes after
/// `PROPS-END` must be newlines.
pub fn parse_block(data: &[u8], allow_deletes: bool) -> Result<Vec<PropChange>> {
    let mut reader = BlockReader { data, pos: 0 };
    let mut entries = Vec::new();

    loop {
        if reader.pos >= data.len() {
            return Err(FsError::malformed("property block has no PROPS-END"));
        }
        let line = reader.line()?;
        if line == &PROPS_END[..PROPS_END.len() - 1] {
            break;
        }
        match line.first() {
            Some(b'K') => {
                let name_len = parse_len(line, b'K')?;
                let name = utf8(reader.bytes(name_len)?, "name")?;
                let value_line = reader.line()?;
                let value_len = parse_len(value_line, b'V')?;
                let value = utf8(reader.bytes(value_len)?, "value")?;
                entries.push((name, Some(value)));
            }
            Some(b'D') if allow_deletes => {
                let name_len = parse_len(line, b'D')?;
                let name = utf8(reader.bytes(name_len)?, "name")?;
                entries.push((name, None));
            }
            _ => {
                return Err(FsError::malformed(format!(
                    "unexpected line in property block: '{}'",
                    String::from_utf8_lossy(line)
                )));
            }
        }
    }

    if data[reader.pos..].iter().any(|b| *b != b'\n') {
        return Err(FsError::malformed("trailing data after PROPS-END"));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_block_layout() {
        let mut props = PropertyMap::new();
        props.insert(svn_props::LOG.to_string(), "test".to_string());
        props.insert(svn_props::AUTHOR.to_string(), "user".to_string());
        let block = encode_block(&props);
        assert_eq!(
            block,
            b"K 10\nsvn:author\nV 4\nuser\nK 7\nsvn:log\nV 4\ntest\nPROPS-END\n".to_vec()
        );
    }

    #[test]
    fn test_empty_block() {
        assert_eq!(encode_block(&PropertyMap::new()), b"PROPS-END\n");
        assert!(parse_block(b"PROPS-END\n", false).unwrap().is_empty());
        assert!(parse_block(b"PROPS-END\n\n", false).unwrap().is_empty());
    }

    #[test]
    fn test_parse_block_roundtrip_with_newlines_in_values() {
        let mut props = PropertyMap::new();
        props.insert("svn:ignore".to_string(), "*.o\n*.tmp\n".to_string());
        props.insert("empty".to_string(), String::new());
        let parsed = parse_block(&encode_block(&props), false).unwrap();
        let mut back = PropertyMap::new();
        apply_changes(&mut back, parsed);
        assert_eq!(back, props);
    }

    #[test]
    fn test_parse_delete_entries() {
        let block = b"K 1\na\nV 1\nx\nD 1\nb\nPROPS-END\n";
        let parsed = parse_block(block, true).unwrap();
        assert_eq!(parsed, vec![("a".to_string(), Some("x".to_string())), ("b".to_string(), None)]);
        assert!(parse_block(block, false).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_blocks() {
        let cases: [&[u8]; 6] = [
            b"",
            b"K 1\na\nV 1\nx\n",
            b"K 5\na\nV 1\nx\nPROPS-END\n",
            b"K x\na\nV 1\nx\nPROPS-END\n",
            b"Q 1\na\nPROPS-END\n",
            b"PROPS-END\ngarbage",
        ];
        for case in cases {
            assert!(
                matches!(parse_block(case, true), Err(FsError::MalformedStream(_))),
                "accepted {:?}",
                String::from_utf8_lossy(case)
            );
        }
    }

    #[test]
    fn test_apply_changes() {
        let mut props = PropertyMap::new();
        props.insert("keep".into(), "1".into());
        props.insert("drop".into(), "2".into());
        apply_changes(&mut props, vec![("drop".into(), None), ("new".into(), Some("3".into()))]);
        assert_eq!(props.len(), 2);
        assert_eq!(props.get("new").map(String::as_str), Some("3"));
        assert!(!props.contains_key("drop"));
    }

    #[test]
    fn test_svn_namespace() {
        assert!(svn_props::is_svn_property(svn_props::EXECUTABLE));
        assert!(!svn_props::is_svn_property("custom:prop"));
    }
}

//! Streaming dump parser
//!
//! Single pass over the input, one record at a time:
//!
//! ```text
//! Start -> ReadingHeaders -> [ContentProps] -> [ContentText] -> Dispatch -> ReadingHeaders | End
//! ```
//!
//! Records are reported to a [`DumpVisitor`] as [`DumpEvent`]s. Text is
//! never buffered whole; it arrives in chunks of at most 64 KiB.

use crate::cancel::CancelFlag;
use crate::dump_format::*;
use crate::error::{FsError, Result};
use crate::object::{CopySource, NodeKind};
use crate::properties::parse_block;
use std::io::{self, BufRead, Read};

const CHUNK_SIZE: u64 = 64 * 1024;

/// Longest header line accepted, newline included
const MAX_HEADER_LINE: u64 = 64 * 1024;

/// One parsed piece of a dump stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpEvent<'a> {
    FormatVersion(u32),
    Uuid(String),
    RevisionStart(RevisionHeader),
    NodeStart(NodeHeader),
    /// A property of the open node, or of the open revision when no node
    /// is open. `None` deletes the property.
    PropertySet { name: String, value: Option<String> },
    TextChunk(&'a [u8]),
    NodeEnd,
    RevisionEnd,
}

/// Consumer of parse events. An error stops the parse and is returned
/// unchanged to the caller.
pub trait DumpVisitor {
    fn visit(&mut self, event: DumpEvent<'_>) -> Result<()>;
}

impl<F> DumpVisitor for F
where
    F: FnMut(DumpEvent<'_>) -> Result<()>,
{
    fn visit(&mut self, event: DumpEvent<'_>) -> Result<()> {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    Start,
    ReadingHeaders,
    ContentProps,
    ContentText,
    Dispatch,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordKind {
    Meta,
    Revision,
    Node,
}

#[derive(Debug, Clone, Copy)]
struct OpenRecord {
    kind: RecordKind,
    prop_len: Option<u64>,
    allow_deletes: bool,
    text_len: Option<u64>,
    padding: u64,
}

struct HeaderBlock {
    headers: Vec<(String, String)>,
}

impl HeaderBlock {
    fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn number(&self, name: &str) -> Result<Option<u64>> {
        self.get(name)
            .map(|v| {
                v.trim()
                    .parse::<u64>()
                    .map_err(|_| FsError::malformed(format!("{} is not a number: '{}'", name, v)))
            })
            .transpose()
    }

    fn flag(&self, name: &str) -> bool {
        self.get(name).is_some_and(|v| v.trim() == "true")
    }
}

fn truncated(e: io::Error) -> FsError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        FsError::malformed("stream ends inside a record's content")
    } else {
        FsError::Io(e)
    }
}

fn node_header(block: &HeaderBlock) -> Result<NodeHeader> {
    let path = block.get(NODE_PATH).unwrap_or_default().to_string();
    let kind = block
        .get(NODE_KIND)
        .map(|k| k.parse::<NodeKind>().map_err(FsError::malformed))
        .transpose()?;
    let action = block
        .get(NODE_ACTION)
        .ok_or_else(|| FsError::malformed(format!("node '{}' has no {}", path, NODE_ACTION)))?
        .parse::<NodeAction>()
        .map_err(FsError::malformed)?;
    let copyfrom = match (block.number(NODE_COPYFROM_REV)?, block.get(NODE_COPYFROM_PATH)) {
        (Some(rev), Some(from)) => Some(CopySource {
            rev,
            path: from.to_string(),
        }),
        (None, None) => None,
        _ => {
            return Err(FsError::malformed(format!(
                "node '{}' needs both {} and {}",
                path, NODE_COPYFROM_REV, NODE_COPYFROM_PATH
            )))
        }
    };
    if block.flag(TEXT_DELTA) {
        return Err(FsError::UnsupportedFeature(format!(
            "text delta for node '{}'",
            path
        )));
    }
    let props = block.get(PROP_CONTENT_LENGTH).map(|_| {
        if block.flag(PROP_DELTA) {
            PropsMode::Delta
        } else {
            PropsMode::Full
        }
    });
    Ok(NodeHeader {
        kind,
        action,
        copyfrom,
        props,
        text_len: block.number(TEXT_CONTENT_LENGTH)?,
        md5: block
            .get(TEXT_CONTENT_MD5)
            .or_else(|| block.get(TEXT_CONTENT_CHECKSUM))
            .map(str::to_string),
        sha1: block.get(TEXT_CONTENT_SHA1).map(str::to_string),
        path,
    })
}

/// Pull parser over a dump stream
pub struct DumpParser<'c, R> {
    reader: R,
    state: ParserState,
    cancel: Option<&'c CancelFlag>,
    in_revision: bool,
    record: Option<OpenRecord>,
    line: Vec<u8>,
}

impl<'c, R: BufRead> DumpParser<'c, R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            state: ParserState::Start,
            cancel: None,
            in_revision: false,
            record: None,
            line: Vec::new(),
        }
    }

    /// Check `cancel` before every record
    pub fn with_cancel(mut self, cancel: &'c CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Drive the state machine to the end of the stream
    pub fn run<V: DumpVisitor + ?Sized>(&mut self, visitor: &mut V) -> Result<()> {
        loop {
            self.state = match self.state {
                ParserState::Start => ParserState::ReadingHeaders,
                ParserState::ReadingHeaders => {
                    if let Some(cancel) = self.cancel {
                        cancel.check()?;
                    }
                    match self.read_header_block()? {
                        Some(block) => {
                            self.open_record(&block, visitor)?;
                            ParserState::ContentProps
                        }
                        None => ParserState::End,
                    }
                }
                ParserState::ContentProps => {
                    self.read_props(visitor)?;
                    ParserState::ContentText
                }
                ParserState::ContentText => {
                    self.read_text(visitor)?;
                    ParserState::Dispatch
                }
                ParserState::Dispatch => {
                    self.close_record(visitor)?;
                    ParserState::ReadingHeaders
                }
                ParserState::End => {
                    if self.in_revision {
                        self.in_revision = false;
                        visitor.visit(DumpEvent::RevisionEnd)?;
                    }
                    return Ok(());
                }
            };
        }
    }

    /// Next header block, skipping blank lines before it; `None` at the end
    /// of the stream
    fn read_header_block(&mut self) -> Result<Option<HeaderBlock>> {
        let mut headers = Vec::new();
        loop {
            self.line.clear();
            let read = (&mut self.reader)
                .take(MAX_HEADER_LINE)
                .read_until(b'\n', &mut self.line)?;
            if read == 0 {
                return Ok((!headers.is_empty()).then_some(HeaderBlock { headers }));
            }
            let Some(line) = self.line.strip_suffix(b"\n") else {
                if read as u64 == MAX_HEADER_LINE {
                    return Err(FsError::malformed(format!(
                        "header line longer than {} bytes",
                        MAX_HEADER_LINE
                    )));
                }
                return Err(FsError::malformed("stream ends inside a header line"));
            };
            if line.is_empty() {
                if headers.is_empty() {
                    continue;
                }
                return Ok(Some(HeaderBlock { headers }));
            }
            let line = std::str::from_utf8(line)
                .map_err(|_| FsError::malformed("header line is not valid UTF-8"))?;
            let Some((name, value)) = line.split_once(':') else {
                return Err(FsError::malformed(format!("header line without colon: '{}'", line)));
            };
            let value = value.strip_prefix(' ').unwrap_or(value);
            headers.push((name.to_string(), value.to_string()));
        }
    }

    fn open_record<V: DumpVisitor + ?Sized>(&mut self, block: &HeaderBlock, visitor: &mut V) -> Result<()> {
        let kind = if let Some(version) = block.get(FORMAT_VERSION) {
            let version: u32 = version
                .trim()
                .parse()
                .map_err(|_| FsError::malformed(format!("bad {}: '{}'", FORMAT_VERSION, version)))?;
            if !SUPPORTED_VERSIONS.contains(&version) {
                return Err(FsError::UnsupportedFeature(format!("dump format version {}", version)));
            }
            visitor.visit(DumpEvent::FormatVersion(version))?;
            RecordKind::Meta
        } else if let Some(uuid) = block.get(UUID) {
            visitor.visit(DumpEvent::Uuid(uuid.trim().to_string()))?;
            RecordKind::Meta
        } else if let Some(revision) = block.number(REVISION_NUMBER)? {
            if self.in_revision {
                visitor.visit(DumpEvent::RevisionEnd)?;
            }
            self.in_revision = true;
            visitor.visit(DumpEvent::RevisionStart(RevisionHeader { revision }))?;
            RecordKind::Revision
        } else if block.get(NODE_PATH).is_some() {
            if !self.in_revision {
                return Err(FsError::malformed("node record outside of a revision record"));
            }
            visitor.visit(DumpEvent::NodeStart(node_header(block)?))?;
            RecordKind::Node
        } else {
            let first = block.headers.first().map(|(n, _)| n.as_str()).unwrap_or_default();
            return Err(FsError::malformed(format!("unrecognized record starting with '{}'", first)));
        };

        let prop_len = block.number(PROP_CONTENT_LENGTH)?;
        let text_len = block.number(TEXT_CONTENT_LENGTH)?;
        let declared = prop_len
            .unwrap_or(0)
            .checked_add(text_len.unwrap_or(0))
            .ok_or_else(|| FsError::malformed("content lengths overflow"))?;
        let content_len = block.number(CONTENT_LENGTH)?.unwrap_or(declared);
        if declared > content_len {
            return Err(FsError::malformed(format!(
                "{} ({}) is smaller than properties plus text ({})",
                CONTENT_LENGTH, content_len, declared
            )));
        }
        self.record = Some(if kind == RecordKind::Meta {
            OpenRecord {
                kind,
                prop_len: None,
                allow_deletes: false,
                text_len: None,
                padding: content_len,
            }
        } else {
            OpenRecord {
                kind,
                prop_len,
                allow_deletes: block.flag(PROP_DELTA),
                text_len,
                padding: content_len - declared,
            }
        });
        Ok(())
    }

    fn read_props<V: DumpVisitor + ?Sized>(&mut self, visitor: &mut V) -> Result<()> {
        let Some(OpenRecord {
            prop_len: Some(len),
            allow_deletes,
            ..
        }) = self.record
        else {
            return Ok(());
        };
        let mut data = Vec::new();
        (&mut self.reader).take(len).read_to_end(&mut data)?;
        if data.len() as u64 != len {
            return Err(FsError::malformed("stream ends inside a property block"));
        }
        for (name, value) in parse_block(&data, allow_deletes)? {
            visitor.visit(DumpEvent::PropertySet { name, value })?;
        }
        Ok(())
    }

    fn read_text<V: DumpVisitor + ?Sized>(&mut self, visitor: &mut V) -> Result<()> {
        let Some(OpenRecord {
            text_len: Some(mut remaining),
            ..
        }) = self.record
        else {
            return Ok(());
        };
        let mut buf = vec![0u8; remaining.min(CHUNK_SIZE) as usize];
        while remaining > 0 {
            let want = remaining.min(CHUNK_SIZE) as usize;
            self.reader.read_exact(&mut buf[..want]).map_err(truncated)?;
            visitor.visit(DumpEvent::TextChunk(&buf[..want]))?;
            remaining -= want as u64;
        }
        Ok(())
    }

    fn close_record<V: DumpVisitor + ?Sized>(&mut self, visitor: &mut V) -> Result<()> {
        let Some(record) = self.record.take() else {
            return Ok(());
        };
        if record.padding > 0 {
            let skipped = io::copy(&mut (&mut self.reader).take(record.padding), &mut io::sink())?;
            if skipped != record.padding {
                return Err(FsError::malformed("stream ends inside a record's content"));
            }
        }
        if record.kind == RecordKind::Node {
            visitor.visit(DumpEvent::NodeEnd)?;
        }
        Ok(())
    }
}

/// Parse a whole dump stream into `visitor`
pub fn parse_dump<R, V>(reader: R, visitor: &mut V, cancel: Option<&CancelFlag>) -> Result<()>
where
    R: BufRead,
    V: DumpVisitor + ?Sized,
{
    let mut parser = DumpParser::new(reader);
    if let Some(cancel) = cancel {
        parser = parser.with_cancel(cancel);
    }
    parser.run(visitor)
}

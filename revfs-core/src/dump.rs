//! Dump a revision range as a portable stream
//!
//! Each revision becomes a revision record carrying all its revision
//! properties, followed by one node record per changed path. Copies whose
//! source lies before the dumped range are written out as plain adds of
//! the copied subtree so the stream can be loaded on its own.

use crate::cancel::CancelFlag;
use crate::dump_format::*;
use crate::error::{FsError, Result};
use crate::object::{md5_hex, sha1_hex, ChangeAction, ChangedPath, CopySource, NodeKind};
use crate::path;
use crate::properties::encode_block;
use crate::repository::Repository;
use crate::Revnum;
use serde::Serialize;
use std::io::Write;
use std::time::Instant;

/// Dump configuration
#[derive(Debug, Clone)]
pub struct DumpOptions {
    pub start: Revnum,
    /// Last revision to dump; the youngest when `None`
    pub end: Option<Revnum>,
    /// Dump the first revision as changes against its predecessor instead
    /// of as a full tree
    pub incremental: bool,
    /// Leave file texts (and their checksums) out of the stream
    pub omit_text: bool,
    pub format_version: u32,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            start: 0,
            end: None,
            incremental: false,
            omit_text: false,
            format_version: 2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DumpStats {
    pub revisions: u64,
    pub nodes: u64,
    pub text_bytes: u64,
}

struct NodeRecord<'a> {
    path: &'a str,
    kind: Option<NodeKind>,
    action: NodeAction,
    copyfrom: Option<&'a CopySource>,
    props: Option<Vec<u8>>,
    text: Option<Vec<u8>>,
}

struct Dumper<'a, W> {
    repo: &'a Repository,
    out: &'a mut W,
    options: &'a DumpOptions,
    stats: DumpStats,
}

impl<W: Write> Dumper<'_, W> {
    fn write_preamble(&mut self) -> Result<()> {
        write!(self.out, "{}: {}\n\n", FORMAT_VERSION, self.options.format_version)?;
        if self.options.format_version >= 2 {
            write!(self.out, "{}: {}\n\n", UUID, self.repo.uuid()?)?;
        }
        Ok(())
    }

    fn dump_revision(&mut self, rev: Revnum) -> Result<()> {
        let revision = self.repo.revision(rev)?;
        let props = encode_block(&revision.props);
        writeln!(self.out, "{}: {}", REVISION_NUMBER, rev)?;
        writeln!(self.out, "{}: {}", PROP_CONTENT_LENGTH, props.len())?;
        writeln!(self.out, "{}: {}", CONTENT_LENGTH, props.len())?;
        writeln!(self.out)?;
        self.out.write_all(&props)?;
        writeln!(self.out)?;
        self.stats.revisions += 1;

        if rev == self.options.start && rev > 0 && !self.options.incremental {
            return self.dump_full_tree(rev);
        }

        let mut expanded: Vec<String> = Vec::new();
        for change in &revision.changes {
            if expanded.iter().any(|prefix| path::is_ancestor_or_self(prefix, &change.path)) {
                continue;
            }
            if self.dump_change(rev, change)? {
                expanded.push(change.path.clone());
            }
        }
        Ok(())
    }

    /// Everything in `rev` as adds; the root only appears when it has
    /// properties
    fn dump_full_tree(&mut self, rev: Revnum) -> Result<()> {
        for (node_path, node) in self.repo.walk(rev, "")? {
            if node_path.is_empty() {
                if !node.props.is_empty() {
                    self.write_node(NodeRecord {
                        path: "",
                        kind: Some(NodeKind::Dir),
                        action: NodeAction::Change,
                        copyfrom: None,
                        props: Some(encode_block(&node.props)),
                        text: None,
                    })?;
                }
                continue;
            }
            self.write_node(NodeRecord {
                path: &node_path,
                kind: Some(node.kind),
                action: NodeAction::Add,
                copyfrom: None,
                props: Some(encode_block(&node.props)),
                text: self.text_of(rev, &node_path, node.kind)?,
            })?;
        }
        Ok(())
    }

    /// Write the records for one changed path. Returns true when the change
    /// was a copy expanded into plain adds, so later changes beneath it are
    /// already covered.
    fn dump_change(&mut self, rev: Revnum, change: &ChangedPath) -> Result<bool> {
        if change.action == ChangeAction::Delete {
            self.write_node(NodeRecord {
                path: &change.path,
                kind: None,
                action: NodeAction::Delete,
                copyfrom: None,
                props: None,
                text: None,
            })?;
            return Ok(false);
        }

        let node = self.repo.node_at(rev, &change.path)?;
        let kind = change.kind.unwrap_or(node.kind);
        let action = NodeAction::from(change.action);

        match &change.copyfrom {
            Some(source) if source.rev < self.options.start => {
                tracing::debug!(
                    "r{}: copy of {}@{} predates the dump, writing '{}' as adds",
                    rev,
                    source.path,
                    source.rev,
                    change.path
                );
                for (node_path, node) in self.repo.walk(rev, &change.path)? {
                    let action = if node_path == change.path { action } else { NodeAction::Add };
                    self.write_node(NodeRecord {
                        path: &node_path,
                        kind: Some(node.kind),
                        action,
                        copyfrom: None,
                        props: Some(encode_block(&node.props)),
                        text: self.text_of(rev, &node_path, node.kind)?,
                    })?;
                }
                Ok(true)
            }
            Some(source) => {
                let props = change.prop_mod.then(|| encode_block(&node.props));
                let text = if change.text_mod {
                    self.text_of(rev, &change.path, kind)?
                } else {
                    None
                };
                self.write_node(NodeRecord {
                    path: &change.path,
                    kind: Some(kind),
                    action,
                    copyfrom: Some(source),
                    props,
                    text,
                })?;
                Ok(false)
            }
            None => {
                let full = matches!(change.action, ChangeAction::Add | ChangeAction::Replace);
                let props = (full || change.prop_mod).then(|| encode_block(&node.props));
                let text = if full || change.text_mod {
                    self.text_of(rev, &change.path, kind)?
                } else {
                    None
                };
                self.write_node(NodeRecord {
                    path: &change.path,
                    kind: Some(kind),
                    action,
                    copyfrom: None,
                    props,
                    text,
                })?;
                Ok(false)
            }
        }
    }

    fn text_of(&self, rev: Revnum, node_path: &str, kind: NodeKind) -> Result<Option<Vec<u8>>> {
        if kind != NodeKind::File || self.options.omit_text {
            return Ok(None);
        }
        Ok(Some(self.repo.read_file(rev, node_path)?))
    }

    fn write_node(&mut self, record: NodeRecord<'_>) -> Result<()> {
        let out = &mut *self.out;
        writeln!(out, "{}: {}", NODE_PATH, record.path)?;
        if let Some(kind) = record.kind {
            writeln!(out, "{}: {}", NODE_KIND, kind)?;
        }
        writeln!(out, "{}: {}", NODE_ACTION, record.action)?;
        if let Some(source) = record.copyfrom {
            writeln!(out, "{}: {}", NODE_COPYFROM_REV, source.rev)?;
            writeln!(out, "{}: {}", NODE_COPYFROM_PATH, source.path)?;
        }

        let prop_len = record.props.as_ref().map_or(0, Vec::len);
        let text_len = record.text.as_ref().map_or(0, Vec::len);
        if let Some(props) = &record.props {
            writeln!(out, "{}: {}", PROP_CONTENT_LENGTH, props.len())?;
        }
        if let Some(text) = &record.text {
            writeln!(out, "{}: {}", TEXT_CONTENT_LENGTH, text.len())?;
            writeln!(out, "{}: {}", TEXT_CONTENT_MD5, md5_hex(text))?;
            writeln!(out, "{}: {}", TEXT_CONTENT_SHA1, sha1_hex(text))?;
        }
        if record.props.is_some() || record.text.is_some() {
            writeln!(out, "{}: {}", CONTENT_LENGTH, prop_len + text_len)?;
        }
        writeln!(out)?;
        if let Some(props) = &record.props {
            out.write_all(props)?;
        }
        if let Some(text) = &record.text {
            out.write_all(text)?;
        }
        write!(out, "\n\n")?;

        self.stats.nodes += 1;
        self.stats.text_bytes += text_len as u64;
        Ok(())
    }
}

/// Write revisions `options.start..=options.end` of `repo` to `out`
pub fn dump_repository<W: Write>(
    repo: &Repository,
    out: &mut W,
    options: &DumpOptions,
    cancel: Option<&CancelFlag>,
) -> Result<DumpStats> {
    let youngest = repo.youngest_revision()?;
    let end = options.end.unwrap_or(youngest);
    if end > youngest {
        return Err(FsError::NoSuchRevision(end));
    }
    if options.start > end {
        return Err(FsError::NoSuchRevision(options.start));
    }
    if !SUPPORTED_VERSIONS.contains(&options.format_version) {
        return Err(FsError::UnsupportedFeature(format!(
            "dump format version {}",
            options.format_version
        )));
    }

    let start_time = Instant::now();
    let mut dumper = Dumper {
        repo,
        out,
        options,
        stats: DumpStats::default(),
    };
    dumper.write_preamble()?;
    for rev in options.start..=end {
        if let Some(cancel) = cancel {
            cancel.check()?;
        }
        dumper.dump_revision(rev)?;
        if dumper.stats.revisions % 500 == 0 {
            tracing::info!("Dumped r{} ({} node records so far)", rev, dumper.stats.nodes);
        }
    }
    dumper.out.flush()?;

    let stats = dumper.stats;
    tracing::info!(
        "Dumped r{}:{} ({} revisions, {} nodes) in {:.1}s",
        options.start,
        end,
        stats.revisions,
        stats.nodes,
        start_time.elapsed().as_secs_f64()
    );
    Ok(stats)
}

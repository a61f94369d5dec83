//! Load a dump stream into a repository
//!
//! Every dumped revision is replayed through a transaction on the youngest
//! revision, so the target numbers revisions on its own. Copy sources are
//! translated through the map of dumped to loaded revision numbers.
//!
//! A load is all or nothing. Revisions are sealed into an in-memory staging
//! area over the target and written out together once the stream has been
//! read to the end; any error or cancellation leaves the target untouched.
//! The target's commit lock is held for the whole load.

use crate::cancel::CancelFlag;
use crate::dump_format::{NodeAction, NodeHeader, PropsMode};
use crate::dump_parser::{parse_dump, DumpEvent, DumpVisitor};
use crate::error::{FsError, Result};
use crate::object::{md5_hex, sha1_hex, CopySource};
use crate::properties::{apply_changes, svn_props, PropChange, PropertyMap};
use crate::repository::Repository;
use crate::transaction::Transaction;
use crate::Revnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::BufRead;
use std::time::Instant;

/// What to do with the UUID record of a dump
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UuidAction {
    /// Take the dump's UUID only when the target has no revisions yet
    #[default]
    Default,
    Ignore,
    Force,
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub uuid_action: UuidAction,
    /// Keep the commit time of each loaded revision instead of the dumped
    /// `svn:date`
    pub ignore_dates: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadStats {
    pub revisions_loaded: u64,
    pub nodes_loaded: u64,
    pub bytes_loaded: u64,
    pub first_revision: Option<Revnum>,
    pub last_revision: Option<Revnum>,
    /// Dumped revision number to loaded revision number
    pub revision_map: BTreeMap<Revnum, Revnum>,
}

struct PendingRevision {
    dumped: Revnum,
    /// `None` for dumped revision 0, which only carries properties
    txn: Option<Transaction>,
    props: PropertyMap,
}

struct PendingNode {
    header: NodeHeader,
    props: Vec<PropChange>,
    text: Option<Vec<u8>>,
}

struct Loader<'a> {
    repo: &'a Repository,
    options: &'a LoadOptions,
    stats: LoadStats,
    revision: Option<PendingRevision>,
    node: Option<PendingNode>,
}

impl<'a> Loader<'a> {
    fn new(repo: &'a Repository, options: &'a LoadOptions) -> Self {
        Self {
            repo,
            options,
            stats: LoadStats::default(),
            revision: None,
            node: None,
        }
    }

    fn open_revision(&mut self) -> Result<&mut PendingRevision> {
        self.revision
            .as_mut()
            .ok_or_else(|| FsError::malformed("node data outside of a revision record"))
    }

    fn start_revision(&mut self, dumped: Revnum) -> Result<()> {
        let txn = if dumped == 0 {
            None
        } else {
            Some(self.repo.begin(self.repo.youngest_revision()?)?)
        };
        self.revision = Some(PendingRevision {
            dumped,
            txn,
            props: PropertyMap::new(),
        });
        Ok(())
    }

    fn set_uuid(&self, uuid: &str) -> Result<()> {
        let apply = match self.options.uuid_action {
            UuidAction::Ignore => false,
            UuidAction::Force => true,
            UuidAction::Default => self.repo.youngest_revision()? == 0,
        };
        if apply {
            tracing::info!("Setting repository UUID to {}", uuid);
            self.repo.set_uuid(uuid)?;
        }
        Ok(())
    }

    fn start_node(&mut self, header: NodeHeader) -> Result<()> {
        let revision = self.open_revision()?;
        if revision.txn.is_none() {
            return Err(FsError::malformed(format!(
                "revision 0 cannot change nodes (found '{}')",
                header.path
            )));
        }
        self.node = Some(PendingNode {
            text: header.text_len.map(|len| Vec::with_capacity(len.min(1 << 20) as usize)),
            props: Vec::new(),
            header,
        });
        Ok(())
    }

    fn end_node(&mut self) -> Result<()> {
        let node = self
            .node
            .take()
            .ok_or_else(|| FsError::malformed("node end without a node"))?;
        let rev_map = &self.stats.revision_map;
        let revision = self
            .revision
            .as_mut()
            .ok_or_else(|| FsError::malformed("node data outside of a revision record"))?;
        let txn = revision
            .txn
            .as_mut()
            .ok_or_else(|| FsError::malformed("revision 0 cannot change nodes"))?;
        let bytes = apply_node(txn, rev_map, node)?;
        self.stats.nodes_loaded += 1;
        self.stats.bytes_loaded += bytes;
        Ok(())
    }

    fn end_revision(&mut self) -> Result<()> {
        let Some(pending) = self.revision.take() else {
            return Ok(());
        };
        let loaded = match pending.txn {
            None => {
                if self.repo.youngest_revision()? == 0 {
                    let mut props = pending.props;
                    if self.options.ignore_dates {
                        match self.repo.get_revision_property(0, svn_props::DATE)? {
                            Some(date) => props.insert(svn_props::DATE.to_string(), date),
                            None => props.remove(svn_props::DATE),
                        };
                    }
                    self.repo.overwrite_revision_properties(0, &props)?;
                }
                0
            }
            Some(mut txn) => {
                let rev = txn.commit_with_properties(pending.props, self.options.ignore_dates)?;
                self.stats.revisions_loaded += 1;
                self.stats.first_revision.get_or_insert(rev);
                self.stats.last_revision = Some(rev);
                if self.stats.revisions_loaded % 500 == 0 {
                    tracing::info!("Staged {} revisions (now at r{})", self.stats.revisions_loaded, rev);
                }
                tracing::debug!("Loaded dumped r{} as r{}", pending.dumped, rev);
                rev
            }
        };
        self.stats.revision_map.insert(pending.dumped, loaded);
        Ok(())
    }

    fn abort(&mut self) {
        self.node = None;
        if let Some(PendingRevision { txn: Some(mut txn), dumped, .. }) = self.revision.take() {
            tracing::warn!("Aborting load of dumped r{}", dumped);
            txn.abort();
        }
    }
}

impl DumpVisitor for Loader<'_> {
    fn visit(&mut self, event: DumpEvent<'_>) -> Result<()> {
        match event {
            DumpEvent::FormatVersion(version) => {
                tracing::debug!("Dump format version {}", version);
            }
            DumpEvent::Uuid(uuid) => self.set_uuid(&uuid)?,
            DumpEvent::RevisionStart(header) => self.start_revision(header.revision)?,
            DumpEvent::NodeStart(header) => self.start_node(header)?,
            DumpEvent::PropertySet { name, value } => match self.node.as_mut() {
                Some(node) => node.props.push((name, value)),
                None => {
                    let revision = self.open_revision()?;
                    apply_changes(&mut revision.props, [(name, value)]);
                }
            },
            DumpEvent::TextChunk(chunk) => {
                let text = self
                    .node
                    .as_mut()
                    .and_then(|node| node.text.as_mut())
                    .ok_or_else(|| FsError::malformed("text outside of a node record"))?;
                text.extend_from_slice(chunk);
            }
            DumpEvent::NodeEnd => self.end_node()?,
            DumpEvent::RevisionEnd => self.end_revision()?,
        }
        Ok(())
    }
}

/// Apply one node record to `txn`. Returns the number of text bytes written.
fn apply_node(txn: &mut Transaction, rev_map: &BTreeMap<Revnum, Revnum>, node: PendingNode) -> Result<u64> {
    let PendingNode { header, props, text } = node;
    let path = header.path.as_str();

    match header.action {
        NodeAction::Delete => {
            txn.delete_node(path)?;
            return Ok(0);
        }
        NodeAction::Add | NodeAction::Replace => {
            if header.action == NodeAction::Replace {
                txn.delete_node(path)?;
            }
            match &header.copyfrom {
                Some(source) => {
                    let rev = *rev_map.get(&source.rev).ok_or_else(|| {
                        FsError::malformed(format!(
                            "copy source r{} of '{}' was not loaded",
                            source.rev, path
                        ))
                    })?;
                    let from = CopySource {
                        rev,
                        path: source.path.clone(),
                    };
                    txn.copy(&from, path)?;
                }
                None => {
                    let kind = header
                        .kind
                        .ok_or_else(|| FsError::malformed(format!("node '{}' has no Node-kind", path)))?;
                    txn.add_node(path, kind)?;
                }
            }
        }
        NodeAction::Change => {}
    }

    if let Some(mode) = header.props {
        let current = txn.node_properties(path)?;
        let mut wanted = match mode {
            PropsMode::Full => PropertyMap::new(),
            PropsMode::Delta => current.clone(),
        };
        apply_changes(&mut wanted, props);
        for name in current.keys().filter(|name| !wanted.contains_key(*name)) {
            txn.set_node_property(path, name, None)?;
        }
        for (name, value) in &wanted {
            if current.get(name) != Some(value) {
                txn.set_node_property(path, name, Some(value))?;
            }
        }
    }

    let Some(text) = text else {
        return Ok(0);
    };
    // A zero-length text without a checksum carries no change
    if text.is_empty() && !header.has_checksum() {
        return Ok(0);
    }
    if let Some(expected) = &header.md5 {
        let actual = md5_hex(&text);
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(FsError::corrupt(format!(
                "MD5 mismatch for '{}': expected {}, got {}",
                path, expected, actual
            )));
        }
    }
    if let Some(expected) = &header.sha1 {
        let actual = sha1_hex(&text);
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(FsError::corrupt(format!(
                "SHA-1 mismatch for '{}': expected {}, got {}",
                path, expected, actual
            )));
        }
    }
    let len = text.len() as u64;
    txn.modify_content(path, text)?;
    Ok(len)
}

/// Replay a dump stream into `repo`. On error nothing is written.
pub fn load_dump<R: BufRead>(
    repo: &Repository,
    reader: R,
    options: &LoadOptions,
    cancel: Option<&CancelFlag>,
) -> Result<LoadStats> {
    let start = Instant::now();
    let _guard = repo.inner.commit_lock.lock();
    let (staging, staged) = repo.staging();
    let mut loader = Loader::new(&staging, options);
    if let Err(e) = parse_dump(reader, &mut loader, cancel) {
        let dumped = loader.revision.as_ref().map(|r| r.dumped);
        loader.abort();
        tracing::warn!(
            "Load failed (dumped r{}), {} staged revisions discarded: {}",
            dumped.map_or_else(|| "-".to_string(), |r| r.to_string()),
            loader.stats.revisions_loaded,
            e
        );
        return Err(e);
    }
    let stats = loader.stats;

    repo.inner.backend.write_staged(staged.take())?;
    tracing::info!(
        "Loaded {} revisions ({} nodes, {} bytes) in {:.1}s",
        stats.revisions_loaded,
        stats.nodes_loaded,
        stats.bytes_loaded,
        start.elapsed().as_secs_f64()
    );
    Ok(stats)
}

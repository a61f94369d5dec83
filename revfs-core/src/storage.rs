//! Storage abstraction layer
//!
//! A backend persists sealed revisions, node versions and text
//! representations. Everything one commit produces is handed over as a
//! single [`CommitBatch`] which the backend must apply atomically. A load
//! collects many batches in a `StagingBackend` first and hands them over
//! as one [`StagedWrites`].

use crate::error::{FsError, Result};
use crate::id::{NodeId, NodeVersionId};
use crate::object::{NodeRevision, Representation, Revision};
use crate::properties::PropertyMap;
use crate::Revnum;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Everything written by one commit
#[derive(Debug, Clone)]
pub struct CommitBatch {
    pub revision: Revision,
    pub nodes: Vec<NodeRevision>,
    pub representations: Vec<(NodeVersionId, Representation)>,
    /// Node number the next new node will take
    pub next_node_number: u64,
    /// Updated branch counters, keyed by the branched node version
    pub branch_counters: Vec<(NodeVersionId, u64)>,
}

/// Several commits plus metadata changes, written all or nothing
#[derive(Debug, Default)]
pub struct StagedWrites {
    pub uuid: Option<String>,
    /// Property replacements for revisions that already exist
    pub revision_properties: Vec<(Revnum, PropertyMap)>,
    /// Consecutive batches, oldest first
    pub batches: Vec<CommitBatch>,
}

/// Persistent store for a repository
///
/// Implementations must be safe to share between threads. Reads never wait
/// on commits for longer than a single batch write.
pub trait Backend: Send + Sync {
    fn uuid(&self) -> Result<String>;

    fn set_uuid(&self, uuid: &str) -> Result<()>;

    /// Youngest sealed revision, `None` until revision 0 has been written
    fn youngest(&self) -> Result<Option<Revnum>>;

    fn revision(&self, rev: Revnum) -> Result<Option<Revision>>;

    fn node(&self, id: &NodeVersionId) -> Result<Option<NodeRevision>>;

    fn representation(&self, key: &NodeVersionId) -> Result<Option<Representation>>;

    fn next_node_number(&self) -> Result<u64>;

    /// Number of branches taken off `base` so far
    fn branch_count(&self, base: &NodeVersionId) -> Result<u64>;

    /// Newest version of `node`
    fn node_head(&self, node: &NodeId) -> Result<Option<NodeVersionId>>;

    /// Apply a commit atomically. Fails with `Conflict` unless the batch's
    /// revision is exactly one past the youngest.
    fn write_batch(&self, batch: CommitBatch) -> Result<()>;

    /// Replace the properties of a sealed revision
    fn write_revision_properties(&self, rev: Revnum, props: &PropertyMap) -> Result<()>;

    /// Apply everything in `staged` atomically
    fn write_staged(&self, staged: StagedWrites) -> Result<()>;
}

pub(crate) fn check_batch_order(youngest: Option<Revnum>, batch: &CommitBatch) -> Result<()> {
    let expected = youngest.map_or(0, |y| y + 1);
    if batch.revision.number != expected {
        return Err(FsError::Conflict {
            path: String::new(),
            base: batch.revision.number.saturating_sub(1),
            rev: youngest.unwrap_or(0),
        });
    }
    Ok(())
}

#[derive(Default)]
struct MemoryState {
    uuid: String,
    revisions: Vec<Revision>,
    nodes: HashMap<NodeVersionId, NodeRevision>,
    representations: HashMap<NodeVersionId, Representation>,
    branches: HashMap<NodeVersionId, u64>,
    heads: HashMap<NodeId, NodeVersionId>,
    next_node_number: u64,
}

impl MemoryState {
    fn youngest(&self) -> Option<Revnum> {
        self.revisions.len().checked_sub(1).map(|r| r as Revnum)
    }

    fn apply(&mut self, batch: CommitBatch) {
        for node in batch.nodes {
            self.heads.insert(node.id.node_id(), node.id.clone());
            self.nodes.insert(node.id.clone(), node);
        }
        for (key, rep) in batch.representations {
            self.representations.insert(key, rep);
        }
        for (base, count) in batch.branch_counters {
            self.branches.insert(base, count);
        }
        self.next_node_number = batch.next_node_number;
        self.revisions.push(batch.revision);
    }
}

/// Backend holding everything in process memory
pub struct MemoryBackend {
    state: RwLock<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState {
                uuid: uuid::Uuid::new_v4().to_string(),
                ..Default::default()
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn remove_representation(&self, key: &NodeVersionId) -> Option<Representation> {
        self.state.write().representations.remove(key)
    }

    #[cfg(test)]
    pub(crate) fn replace_representation(&self, key: &NodeVersionId, rep: Representation) {
        self.state.write().representations.insert(key.clone(), rep);
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    fn uuid(&self) -> Result<String> {
        Ok(self.state.read().uuid.clone())
    }

    fn set_uuid(&self, uuid: &str) -> Result<()> {
        self.state.write().uuid = uuid.to_string();
        Ok(())
    }

    fn youngest(&self) -> Result<Option<Revnum>> {
        Ok(self.state.read().youngest())
    }

    fn revision(&self, rev: Revnum) -> Result<Option<Revision>> {
        Ok(self.state.read().revisions.get(rev as usize).cloned())
    }

    fn node(&self, id: &NodeVersionId) -> Result<Option<NodeRevision>> {
        Ok(self.state.read().nodes.get(id).cloned())
    }

    fn representation(&self, key: &NodeVersionId) -> Result<Option<Representation>> {
        Ok(self.state.read().representations.get(key).cloned())
    }

    fn next_node_number(&self) -> Result<u64> {
        Ok(self.state.read().next_node_number)
    }

    fn branch_count(&self, base: &NodeVersionId) -> Result<u64> {
        Ok(self.state.read().branches.get(base).copied().unwrap_or(0))
    }

    fn node_head(&self, node: &NodeId) -> Result<Option<NodeVersionId>> {
        Ok(self.state.read().heads.get(node).cloned())
    }

    fn write_batch(&self, batch: CommitBatch) -> Result<()> {
        let mut state = self.state.write();
        check_batch_order(state.youngest(), &batch)?;
        state.apply(batch);
        Ok(())
    }

    fn write_revision_properties(&self, rev: Revnum, props: &PropertyMap) -> Result<()> {
        let mut state = self.state.write();
        let revision = state
            .revisions
            .get_mut(rev as usize)
            .ok_or(FsError::NoSuchRevision(rev))?;
        revision.props = props.clone();
        Ok(())
    }

    fn write_staged(&self, staged: StagedWrites) -> Result<()> {
        let mut state = self.state.write();
        let mut youngest = state.youngest();
        for batch in &staged.batches {
            check_batch_order(youngest, batch)?;
            youngest = Some(batch.revision.number);
        }
        for (rev, _) in &staged.revision_properties {
            if *rev as usize >= state.revisions.len() {
                return Err(FsError::NoSuchRevision(*rev));
            }
        }

        if let Some(uuid) = staged.uuid {
            state.uuid = uuid;
        }
        for (rev, props) in staged.revision_properties {
            state.revisions[rev as usize].props = props;
        }
        for batch in staged.batches {
            state.apply(batch);
        }
        Ok(())
    }
}

#[derive(Default)]
struct StagingState {
    uuid: Option<String>,
    revision_properties: BTreeMap<Revnum, PropertyMap>,
    batches: Vec<CommitBatch>,
    /// Batch and position of every staged node version
    nodes: HashMap<NodeVersionId, (usize, usize)>,
    representations: HashMap<NodeVersionId, (usize, usize)>,
    branches: HashMap<NodeVersionId, u64>,
    heads: HashMap<NodeId, NodeVersionId>,
}

impl StagingState {
    fn batch(&self, rev: Revnum) -> Option<&CommitBatch> {
        let first = self.batches.first()?.revision.number;
        self.batches.get(rev.checked_sub(first)? as usize)
    }
}

/// Backend that keeps commits in memory on top of another backend. Reads
/// see the staged revisions; nothing reaches the base until
/// [`StagingBackend::take`] hands the staged writes over.
pub(crate) struct StagingBackend {
    base: Arc<dyn Backend>,
    state: RwLock<StagingState>,
}

impl StagingBackend {
    pub(crate) fn new(base: Arc<dyn Backend>) -> Self {
        Self {
            base,
            state: RwLock::new(StagingState::default()),
        }
    }

    /// Everything staged so far, leaving the staging area empty
    pub(crate) fn take(&self) -> StagedWrites {
        let state = std::mem::take(&mut *self.state.write());
        StagedWrites {
            uuid: state.uuid,
            revision_properties: state.revision_properties.into_iter().collect(),
            batches: state.batches,
        }
    }
}

impl Backend for StagingBackend {
    fn uuid(&self) -> Result<String> {
        match &self.state.read().uuid {
            Some(uuid) => Ok(uuid.clone()),
            None => self.base.uuid(),
        }
    }

    fn set_uuid(&self, uuid: &str) -> Result<()> {
        self.state.write().uuid = Some(uuid.to_string());
        Ok(())
    }

    fn youngest(&self) -> Result<Option<Revnum>> {
        match self.state.read().batches.last() {
            Some(batch) => Ok(Some(batch.revision.number)),
            None => self.base.youngest(),
        }
    }

    fn revision(&self, rev: Revnum) -> Result<Option<Revision>> {
        let state = self.state.read();
        if let Some(batch) = state.batch(rev) {
            return Ok(Some(batch.revision.clone()));
        }
        let mut revision = self.base.revision(rev)?;
        if let (Some(revision), Some(props)) = (revision.as_mut(), state.revision_properties.get(&rev)) {
            revision.props = props.clone();
        }
        Ok(revision)
    }

    fn node(&self, id: &NodeVersionId) -> Result<Option<NodeRevision>> {
        let state = self.state.read();
        match state.nodes.get(id) {
            Some(&(b, n)) => Ok(Some(state.batches[b].nodes[n].clone())),
            None => self.base.node(id),
        }
    }

    fn representation(&self, key: &NodeVersionId) -> Result<Option<Representation>> {
        let state = self.state.read();
        match state.representations.get(key) {
            Some(&(b, r)) => Ok(Some(state.batches[b].representations[r].1.clone())),
            None => self.base.representation(key),
        }
    }

    fn next_node_number(&self) -> Result<u64> {
        match self.state.read().batches.last() {
            Some(batch) => Ok(batch.next_node_number),
            None => self.base.next_node_number(),
        }
    }

    fn branch_count(&self, base: &NodeVersionId) -> Result<u64> {
        match self.state.read().branches.get(base) {
            Some(count) => Ok(*count),
            None => self.base.branch_count(base),
        }
    }

    fn node_head(&self, node: &NodeId) -> Result<Option<NodeVersionId>> {
        match self.state.read().heads.get(node) {
            Some(id) => Ok(Some(id.clone())),
            None => self.base.node_head(node),
        }
    }

    fn write_batch(&self, batch: CommitBatch) -> Result<()> {
        let mut state = self.state.write();
        let youngest = match state.batches.last() {
            Some(last) => Some(last.revision.number),
            None => self.base.youngest()?,
        };
        check_batch_order(youngest, &batch)?;

        let b = state.batches.len();
        for (n, node) in batch.nodes.iter().enumerate() {
            state.heads.insert(node.id.node_id(), node.id.clone());
            state.nodes.insert(node.id.clone(), (b, n));
        }
        for (r, (key, _)) in batch.representations.iter().enumerate() {
            state.representations.insert(key.clone(), (b, r));
        }
        for (base, count) in &batch.branch_counters {
            state.branches.insert(base.clone(), *count);
        }
        state.batches.push(batch);
        Ok(())
    }

    fn write_revision_properties(&self, rev: Revnum, props: &PropertyMap) -> Result<()> {
        let mut state = self.state.write();
        if let Some(first) = state.batches.first().map(|b| b.revision.number) {
            if let Some(batch) = rev.checked_sub(first).and_then(|i| state.batches.get_mut(i as usize)) {
                batch.revision.props = props.clone();
                return Ok(());
            }
        }
        if self.base.revision(rev)?.is_none() {
            return Err(FsError::NoSuchRevision(rev));
        }
        state.revision_properties.insert(rev, props.clone());
        Ok(())
    }

    fn write_staged(&self, _staged: StagedWrites) -> Result<()> {
        Err(FsError::UnsupportedFeature(
            "staged writes cannot be nested".to_string(),
        ))
    }
}

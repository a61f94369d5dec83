//! Transaction manager
//!
//! A transaction stages a mutable copy of the tree of its base revision.
//! Committed nodes are only copied into the staging area when an edit
//! reaches them; everything else keeps pointing at sealed node versions.
//!
//! Commits are optimistic. If other revisions were sealed since the base,
//! their changed paths are compared against ours; without a conflict the
//! recorded edits are replayed onto the youngest tree and sealed there.

use crate::error::{FsError, Result};
use crate::id::{NodeId, NodeVersionId};
use crate::node_store::NodeStore;
use crate::object::{
    format_date, ChangeAction, ChangedPath, CopySource, NodeKind, NodeRevision, Revision,
};
use crate::path;
use crate::properties::{apply_changes, svn_props, PropertyMap};
use crate::repository::Repository;
use crate::storage::CommitBatch;
use crate::Revnum;
use bytes::Bytes;
use chrono::Utc;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;

/// Lifecycle of a transaction. `Sealed` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Open,
    Sealed(Revnum),
    Aborted,
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnState::Open => f.write_str("open"),
            TxnState::Sealed(_) => f.write_str("sealed"),
            TxnState::Aborted => f.write_str("aborted"),
        }
    }
}

/// Result of a commit attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(Revnum),
    /// Nothing was staged; no revision was created
    NoOp,
}

impl CommitOutcome {
    /// The new revision, or `EmptyCommit` for a no-op
    pub fn revision(self) -> Result<Revnum> {
        match self {
            CommitOutcome::Committed(rev) => Ok(rev),
            CommitOutcome::NoOp => Err(FsError::EmptyCommit),
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, CommitOutcome::NoOp)
    }
}

/// What a property change applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropTarget<'a> {
    Node(&'a str),
    Revision,
}

type LogMessageSupplier = Box<dyn FnOnce() -> Option<String> + Send>;

#[derive(Debug, Clone)]
enum Origin {
    /// Next version of an existing node
    Successor { pred: NodeVersionId },
    /// New branch off an existing node version
    Branch {
        from: NodeVersionId,
        copyfrom: Option<CopySource>,
    },
    New,
}

#[derive(Debug, Clone)]
enum TextState {
    Inherited,
    Replaced(Bytes),
}

#[derive(Debug, Clone)]
struct StagedNode {
    origin: Origin,
    kind: NodeKind,
    props: PropertyMap,
    text: TextState,
    entries: BTreeMap<String, TxnNode>,
    created_path: String,
}

impl StagedNode {
    fn new_node(kind: NodeKind, path: &str) -> Self {
        Self {
            origin: Origin::New,
            kind,
            props: PropertyMap::new(),
            text: match kind {
                NodeKind::File => TextState::Replaced(Bytes::new()),
                NodeKind::Dir => TextState::Inherited,
            },
            entries: BTreeMap::new(),
            created_path: path.to_string(),
        }
    }

    /// Mutable copy of a committed node reached at `path`. The node's line
    /// continues only if `head` (no newer version of it exists) and it is
    /// reached where it was created. Anything else lives under a copy, or
    /// under a restored copy of an older tree, and must branch.
    fn from_committed(node: &NodeRevision, path: &str, head: bool) -> Self {
        let origin = if head && node.created_path == path {
            Origin::Successor { pred: node.id.clone() }
        } else {
            Origin::Branch {
                from: node.id.clone(),
                copyfrom: None,
            }
        };
        Self::with_origin(node, origin, path)
    }

    fn copy_of(node: &NodeRevision, from: CopySource, path: &str) -> Self {
        let origin = Origin::Branch {
            from: node.id.clone(),
            copyfrom: Some(from),
        };
        Self::with_origin(node, origin, path)
    }

    fn with_origin(node: &NodeRevision, origin: Origin, path: &str) -> Self {
        Self {
            origin,
            kind: node.kind,
            props: node.props.clone(),
            text: TextState::Inherited,
            entries: node
                .entries
                .iter()
                .map(|(name, id)| (name.clone(), TxnNode::Committed(id.clone())))
                .collect(),
            created_path: path.to_string(),
        }
    }

    /// Committed version this node's unchanged state comes from
    fn basis(&self) -> Option<&NodeVersionId> {
        match &self.origin {
            Origin::Successor { pred } => Some(pred),
            Origin::Branch { from, .. } => Some(from),
            Origin::New => None,
        }
    }
}

#[derive(Debug, Clone)]
enum TxnNode {
    Committed(NodeVersionId),
    Staged(Box<StagedNode>),
}

/// Either a sealed node version or a staged one
enum NodeRef<'t> {
    Committed(NodeRevision),
    Staged(&'t StagedNode),
}

impl NodeRef<'_> {
    fn kind(&self) -> NodeKind {
        match self {
            NodeRef::Committed(node) => node.kind,
            NodeRef::Staged(node) => node.kind,
        }
    }

    fn props(&self) -> &PropertyMap {
        match self {
            NodeRef::Committed(node) => &node.props,
            NodeRef::Staged(node) => &node.props,
        }
    }
}

/// A single recorded edit, kept so the transaction can be replayed onto a
/// newer revision at commit time.
#[derive(Debug, Clone)]
enum Edit {
    Add { path: String, kind: NodeKind },
    Copy {
        path: String,
        from: CopySource,
        source: NodeVersionId,
    },
    Delete { path: String },
    Text { path: String, content: Bytes },
    Prop {
        path: String,
        name: String,
        value: Option<String>,
    },
}

impl Edit {
    fn path(&self) -> &str {
        match self {
            Edit::Add { path, .. }
            | Edit::Copy { path, .. }
            | Edit::Delete { path }
            | Edit::Text { path, .. }
            | Edit::Prop { path, .. } => path,
        }
    }
}

fn resolve<'t>(repo: &Repository, slot: &'t TxnNode) -> Result<NodeRef<'t>> {
    match slot {
        TxnNode::Committed(id) => Ok(NodeRef::Committed(repo.node(id)?)),
        TxnNode::Staged(node) => Ok(NodeRef::Staged(&**node)),
    }
}

fn make_mutable<'t>(repo: &Repository, slot: &'t mut TxnNode, path: &str) -> Result<&'t mut StagedNode> {
    if let TxnNode::Committed(id) = &*slot {
        let node = repo.node(id)?;
        let head = repo.inner.backend.node_head(&node.id.node_id())?;
        let staged = StagedNode::from_committed(&node, path, head.as_ref() == Some(&node.id));
        *slot = TxnNode::Staged(Box::new(staged));
    }
    match slot {
        TxnNode::Staged(node) => Ok(&mut **node),
        TxnNode::Committed(id) => Err(FsError::corrupt(format!("node {} could not be staged", id))),
    }
}

fn split_child(path: &str) -> Result<(&str, &str)> {
    path::split(path).ok_or_else(|| FsError::InvalidPath(path.to_string()))
}

struct TxnTree {
    root: TxnNode,
}

impl TxnTree {
    fn new(root: NodeVersionId) -> Self {
        Self {
            root: TxnNode::Committed(root),
        }
    }

    fn lookup<'t>(&'t self, repo: &Repository, path: &str) -> Result<Option<NodeRef<'t>>> {
        let mut current = resolve(repo, &self.root)?;
        for name in path::components(path) {
            current = match current {
                NodeRef::Staged(node) => match node.entries.get(name) {
                    Some(child) => resolve(repo, child)?,
                    None => return Ok(None),
                },
                NodeRef::Committed(node) => match node.entries.get(name) {
                    Some(id) => NodeRef::Committed(repo.node(id)?),
                    None => return Ok(None),
                },
            };
        }
        Ok(Some(current))
    }

    fn node_mut(&mut self, repo: &Repository, path: &str) -> Result<&mut StagedNode> {
        let mut current = make_mutable(repo, &mut self.root, "")?;
        let mut walked = String::new();
        for name in path::components(path) {
            if current.kind != NodeKind::Dir {
                return Err(FsError::NotDirectory(walked));
            }
            walked = path::join(&walked, name);
            let Some(slot) = current.entries.get_mut(name) else {
                return Err(FsError::PathNotFound(walked));
            };
            current = make_mutable(repo, slot, &walked)?;
        }
        Ok(current)
    }

    fn dir_mut(&mut self, repo: &Repository, path: &str) -> Result<&mut StagedNode> {
        let node = self.node_mut(repo, path)?;
        if node.kind != NodeKind::Dir {
            return Err(FsError::NotDirectory(path.to_string()));
        }
        Ok(node)
    }

    /// Apply one edit and return the kind of the node it touched
    fn apply(&mut self, repo: &Repository, edit: &Edit) -> Result<NodeKind> {
        match edit {
            Edit::Add { path, kind } => {
                let (parent, name) = split_child(path)?;
                let dir = self.dir_mut(repo, parent)?;
                if dir.entries.contains_key(name) {
                    return Err(FsError::PathExists(path.clone()));
                }
                let node = StagedNode::new_node(*kind, path);
                dir.entries.insert(name.to_string(), TxnNode::Staged(Box::new(node)));
                Ok(*kind)
            }
            Edit::Copy { path, from, source } => {
                let source = repo.node(source)?;
                let (parent, name) = split_child(path)?;
                let dir = self.dir_mut(repo, parent)?;
                if dir.entries.contains_key(name) {
                    return Err(FsError::PathExists(path.clone()));
                }
                let node = StagedNode::copy_of(&source, from.clone(), path);
                dir.entries.insert(name.to_string(), TxnNode::Staged(Box::new(node)));
                Ok(source.kind)
            }
            Edit::Delete { path } => {
                let (parent, name) = split_child(path)?;
                let dir = self.dir_mut(repo, parent)?;
                match dir.entries.remove(name) {
                    Some(TxnNode::Staged(node)) => Ok(node.kind),
                    Some(TxnNode::Committed(id)) => Ok(repo.node(&id)?.kind),
                    None => Err(FsError::PathNotFound(path.clone())),
                }
            }
            Edit::Text { path, content } => {
                let node = self.node_mut(repo, path)?;
                if node.kind != NodeKind::File {
                    return Err(FsError::NotFile(path.clone()));
                }
                node.text = TextState::Replaced(content.clone());
                Ok(NodeKind::File)
            }
            Edit::Prop { path, name, value } => {
                let node = self.node_mut(repo, path)?;
                apply_changes(&mut node.props, [(name.clone(), value.clone())]);
                Ok(node.kind)
            }
        }
    }
}

/// Whether a change sealed after our base collides with one of ours
fn conflicts(theirs: &ChangedPath, ours: &ChangedPath) -> bool {
    let structural = |c: &ChangedPath| matches!(c.action, ChangeAction::Delete | ChangeAction::Replace);
    theirs.path == ours.path
        || (path::is_ancestor_or_self(&theirs.path, &ours.path) && structural(theirs))
        || (path::is_ancestor_or_self(&ours.path, &theirs.path) && structural(ours))
}

/// Turns the staged tree into node versions of the new revision
struct Finalizer<'r> {
    repo: &'r Repository,
    store: NodeStore<'r>,
    rev: Revnum,
    next_node: u64,
    branches: BTreeMap<NodeVersionId, u64>,
    batch: CommitBatch,
}

impl Finalizer<'_> {
    /// Post-order: children get their ids before the directory listing them
    /// is written. A staged node that ended up identical to its basis keeps
    /// the basis id, unless `force` is set.
    fn finalize(&mut self, slot: TxnNode, force: bool) -> Result<NodeVersionId> {
        let node = match slot {
            TxnNode::Committed(id) => return Ok(id),
            TxnNode::Staged(node) => *node,
        };
        let StagedNode {
            origin,
            kind,
            props,
            text,
            entries,
            created_path,
        } = node;

        let mut children = BTreeMap::new();
        for (name, child) in entries {
            let id = self.finalize(child, false)?;
            children.insert(name, id);
        }

        let basis = match &origin {
            Origin::Successor { pred } => Some(self.store.node(pred)?),
            Origin::Branch { from, .. } => Some(self.store.node(from)?),
            Origin::New => None,
        };

        if let Some(basis) = &basis {
            let plain = !matches!(origin, Origin::Branch { copyfrom: Some(_), .. });
            let unchanged = matches!(text, TextState::Inherited)
                && basis.props == props
                && basis.entries == children;
            if plain && unchanged && !force {
                return Ok(basis.id.clone());
            }
        }

        let (node_id, predecessor, copyfrom) = match origin {
            Origin::Successor { pred } => (pred.node_id(), Some(pred), None),
            Origin::Branch { from, copyfrom } => {
                let n = self.next_branch(&from)?;
                (from.branch(n), Some(from), copyfrom)
            }
            Origin::New => {
                let n = self.next_node;
                self.next_node += 1;
                (NodeId::new(n), None, None)
            }
        };
        let id = node_id.version(self.rev);

        let text = match kind {
            NodeKind::Dir => None,
            NodeKind::File => {
                let base = basis.and_then(|b| b.text);
                match text {
                    TextState::Inherited => base,
                    TextState::Replaced(content) => {
                        Some(self.store.write_text(&mut self.batch, &id, &content, base.as_ref())?)
                    }
                }
            }
        };

        self.batch.nodes.push(NodeRevision {
            id: id.clone(),
            kind,
            props,
            entries: children,
            text,
            predecessor,
            copyfrom,
            created_path,
        });
        Ok(id)
    }

    fn next_branch(&mut self, from: &NodeVersionId) -> Result<u64> {
        let count = match self.branches.get(from) {
            Some(count) => *count,
            None => self.repo.inner.backend.branch_count(from)?,
        };
        self.branches.insert(from.clone(), count + 1);
        Ok(count + 1)
    }
}

/// A mutable staging area for the next revision
pub struct Transaction {
    repo: Repository,
    base: Revnum,
    base_root: NodeVersionId,
    state: TxnState,
    tree: TxnTree,
    changes: BTreeMap<String, ChangedPath>,
    edits: Vec<Edit>,
    revprops: PropertyMap,
    log_message: Option<LogMessageSupplier>,
}

impl Transaction {
    pub(crate) fn new(repo: Repository, base: Revnum, base_root: NodeVersionId) -> Self {
        Self {
            repo,
            base,
            tree: TxnTree::new(base_root.clone()),
            base_root,
            state: TxnState::Open,
            changes: BTreeMap::new(),
            edits: Vec::new(),
            revprops: PropertyMap::new(),
            log_message: None,
        }
    }

    pub fn base_revision(&self) -> Revnum {
        self.base
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Paths changed so far, sorted
    pub fn changed_paths(&self) -> Vec<ChangedPath> {
        self.changes.values().cloned().collect()
    }

    pub fn revision_properties(&self) -> &PropertyMap {
        &self.revprops
    }

    /// Supplier for the log message, called once at commit when `svn:log`
    /// has not been set explicitly.
    pub fn set_log_message_supplier<F>(&mut self, supplier: F)
    where
        F: FnOnce() -> Option<String> + Send + 'static,
    {
        self.log_message = Some(Box::new(supplier));
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state != TxnState::Open {
            return Err(FsError::InvalidTransactionState(self.state));
        }
        Ok(())
    }

    fn apply(&mut self, edit: Edit) -> Result<NodeKind> {
        let kind = self.tree.apply(&self.repo, &edit)?;
        self.edits.push(edit);
        Ok(kind)
    }

    pub fn add_node(&mut self, path: &str, kind: NodeKind) -> Result<()> {
        self.ensure_open()?;
        let path = path::canonicalize(path)?;
        self.apply(Edit::Add { path: path.clone(), kind })?;
        self.record_add(&path, kind, None);
        Ok(())
    }

    /// Copy `from` (a path in a sealed revision) to `to`
    pub fn copy(&mut self, from: &CopySource, to: &str) -> Result<()> {
        self.ensure_open()?;
        let to = path::canonicalize(to)?;
        let from = CopySource {
            rev: from.rev,
            path: path::canonicalize(&from.path)?,
        };
        let source = self.repo.node_at(from.rev, &from.path)?;
        let kind = self.apply(Edit::Copy {
            path: to.clone(),
            from: from.clone(),
            source: source.id,
        })?;
        self.record_add(&to, kind, Some(from));
        Ok(())
    }

    pub fn delete_node(&mut self, path: &str) -> Result<()> {
        self.ensure_open()?;
        let path = path::canonicalize(path)?;
        self.apply(Edit::Delete { path: path.clone() })?;
        self.record_delete(&path);
        Ok(())
    }

    /// Replace the text of the file at `path`
    pub fn modify_content(&mut self, path: &str, content: impl Into<Bytes>) -> Result<()> {
        self.ensure_open()?;
        let path = path::canonicalize(path)?;
        self.apply(Edit::Text {
            path: path.clone(),
            content: content.into(),
        })?;
        self.record_modify(&path, NodeKind::File, true, false);
        Ok(())
    }

    /// Replace the text of the file at `path` with everything `reader` yields
    pub fn apply_text<R: Read>(&mut self, path: &str, mut reader: R) -> Result<()> {
        self.ensure_open()?;
        let mut content = Vec::new();
        reader.read_to_end(&mut content)?;
        self.modify_content(path, content)
    }

    /// Set (`Some`) or delete (`None`) a property of the node at `path`
    pub fn set_node_property(&mut self, path: &str, name: &str, value: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        let path = path::canonicalize(path)?;
        let kind = self.apply(Edit::Prop {
            path: path.clone(),
            name: name.to_string(),
            value: value.map(str::to_string),
        })?;
        self.record_modify(&path, kind, false, true);
        Ok(())
    }

    pub fn set_revision_property(&mut self, name: &str, value: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        apply_changes(&mut self.revprops, [(name.to_string(), value.map(str::to_string))]);
        Ok(())
    }

    pub fn set_property(&mut self, target: PropTarget<'_>, name: &str, value: Option<&str>) -> Result<()> {
        match target {
            PropTarget::Node(path) => self.set_node_property(path, name, value),
            PropTarget::Revision => self.set_revision_property(name, value),
        }
    }

    pub fn check_path(&self, path: &str) -> Result<Option<NodeKind>> {
        self.ensure_open()?;
        let path = path::canonicalize(path)?;
        Ok(self.tree.lookup(&self.repo, &path)?.map(|node| node.kind()))
    }

    pub fn node_properties(&self, path: &str) -> Result<PropertyMap> {
        self.ensure_open()?;
        let path = path::canonicalize(path)?;
        match self.tree.lookup(&self.repo, &path)? {
            Some(node) => Ok(node.props().clone()),
            None => Err(FsError::PathNotFound(path)),
        }
    }

    pub fn read_content(&self, path: &str) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let path = path::canonicalize(path)?;
        let node = self
            .tree
            .lookup(&self.repo, &path)?
            .ok_or_else(|| FsError::PathNotFound(path.clone()))?;
        if node.kind() != NodeKind::File {
            return Err(FsError::NotFile(path));
        }
        match node {
            NodeRef::Committed(node) => self.repo.read_content(&node.id),
            NodeRef::Staged(node) => match (&node.text, node.basis()) {
                (TextState::Replaced(content), _) => Ok(content.to_vec()),
                (TextState::Inherited, Some(basis)) => self.repo.read_content(basis),
                (TextState::Inherited, None) => Ok(Vec::new()),
            },
        }
    }

    /// Entries of the directory at `path` with their kinds
    pub fn list_dir(&self, path: &str) -> Result<Vec<(String, NodeKind)>> {
        self.ensure_open()?;
        let path = path::canonicalize(path)?;
        let node = self
            .tree
            .lookup(&self.repo, &path)?
            .ok_or_else(|| FsError::PathNotFound(path.clone()))?;
        match node {
            NodeRef::Committed(node) => {
                if !node.is_dir() {
                    return Err(FsError::NotDirectory(path));
                }
                node.entries
                    .iter()
                    .map(|(name, id)| -> Result<(String, NodeKind)> {
                        Ok((name.clone(), self.repo.node(id)?.kind))
                    })
                    .collect()
            }
            NodeRef::Staged(node) => {
                if node.kind != NodeKind::Dir {
                    return Err(FsError::NotDirectory(path));
                }
                node.entries
                    .iter()
                    .map(|(name, child)| -> Result<(String, NodeKind)> {
                        Ok((name.clone(), resolve(&self.repo, child)?.kind()))
                    })
                    .collect()
            }
        }
    }

    fn record_add(&mut self, path: &str, kind: NodeKind, copyfrom: Option<CopySource>) {
        let action = match self.changes.get(path) {
            Some(prev) if prev.action == ChangeAction::Delete => ChangeAction::Replace,
            _ => ChangeAction::Add,
        };
        self.changes.insert(
            path.to_string(),
            ChangedPath {
                path: path.to_string(),
                action,
                kind: Some(kind),
                text_mod: false,
                prop_mod: false,
                copyfrom,
            },
        );
    }

    fn record_delete(&mut self, path: &str) {
        let was_added = matches!(
            self.changes.get(path).map(|c| c.action),
            Some(ChangeAction::Add)
        );
        self.changes.retain(|p, _| !path::is_ancestor_or_self(path, p));
        if !was_added {
            self.changes.insert(
                path.to_string(),
                ChangedPath {
                    path: path.to_string(),
                    action: ChangeAction::Delete,
                    kind: None,
                    text_mod: false,
                    prop_mod: false,
                    copyfrom: None,
                },
            );
        }
    }

    fn record_modify(&mut self, path: &str, kind: NodeKind, text_mod: bool, prop_mod: bool) {
        let entry = self.changes.entry(path.to_string()).or_insert_with(|| ChangedPath {
            path: path.to_string(),
            action: ChangeAction::Modify,
            kind: Some(kind),
            text_mod: false,
            prop_mod: false,
            copyfrom: None,
        });
        entry.text_mod |= text_mod;
        entry.prop_mod |= prop_mod;
    }

    /// Seal the transaction into a new revision. Returns `NoOp` (and ends
    /// the transaction) when nothing was changed.
    pub fn commit(&mut self) -> Result<CommitOutcome> {
        self.finish(false, true)
    }

    /// Seal even when no path was changed
    pub fn commit_allowing_empty(&mut self) -> Result<Revnum> {
        self.finish(true, true)?.revision()
    }

    /// Seal with exactly `props` as the revision properties, even when no
    /// path was changed. `svn:date` is stamped only if `stamp_date` is set.
    pub(crate) fn commit_with_properties(&mut self, props: PropertyMap, stamp_date: bool) -> Result<Revnum> {
        self.ensure_open()?;
        self.revprops = props;
        self.log_message = None;
        self.finish(true, stamp_date)?.revision()
    }

    /// Discard everything staged. Always succeeds.
    pub fn abort(&mut self) {
        if self.state == TxnState::Open {
            tracing::debug!("Aborting transaction based on r{}", self.base);
            self.state = TxnState::Aborted;
        }
        self.discard();
    }

    fn discard(&mut self) {
        self.tree = TxnTree::new(self.base_root.clone());
        self.changes.clear();
        self.edits.clear();
        self.log_message = None;
    }

    fn finish(&mut self, allow_empty: bool, stamp_date: bool) -> Result<CommitOutcome> {
        self.ensure_open()?;
        let outcome = self.seal(allow_empty, stamp_date);
        self.state = match &outcome {
            Ok(CommitOutcome::Committed(rev)) => TxnState::Sealed(*rev),
            _ => TxnState::Aborted,
        };
        self.discard();
        outcome
    }

    fn seal(&mut self, allow_empty: bool, stamp_date: bool) -> Result<CommitOutcome> {
        if self.changes.is_empty() && !allow_empty {
            return Ok(CommitOutcome::NoOp);
        }
        if !self.revprops.contains_key(svn_props::LOG) {
            if let Some(message) = self.log_message.take().and_then(|supplier| supplier()) {
                self.revprops.insert(svn_props::LOG.to_string(), message);
            }
        }

        let repo = self.repo.clone();
        let _guard = repo.inner.commit_lock.lock();
        let youngest = repo.youngest_revision()?;
        if youngest != self.base {
            self.rebase(youngest)?;
        }
        let rev = youngest + 1;

        let backend = repo.inner.backend.as_ref();
        let mut finalizer = Finalizer {
            repo: &repo,
            store: repo.node_store(),
            rev,
            next_node: backend.next_node_number()?,
            branches: BTreeMap::new(),
            batch: CommitBatch {
                revision: Revision {
                    number: rev,
                    root: NodeId::new(0).version(rev),
                    props: PropertyMap::new(),
                    changes: Vec::new(),
                },
                nodes: Vec::new(),
                representations: Vec::new(),
                next_node_number: 0,
                branch_counters: Vec::new(),
            },
        };
        let root = std::mem::replace(&mut self.tree.root, TxnNode::Committed(self.base_root.clone()));
        let root_id = finalizer.finalize(root, true)?;
        let Finalizer {
            mut batch,
            next_node,
            branches,
            ..
        } = finalizer;

        if stamp_date {
            self.revprops
                .insert(svn_props::DATE.to_string(), format_date(Utc::now()));
        }
        batch.revision.root = root_id;
        batch.revision.props = self.revprops.clone();
        batch.revision.changes = self.changes.values().cloned().collect();
        batch.next_node_number = next_node;
        batch.branch_counters = branches.into_iter().collect();

        let changed = batch.revision.changes.len();
        let node_versions = batch.nodes.len();
        backend.write_batch(batch)?;
        tracing::info!(
            "Committed r{} ({} changed paths, {} node versions)",
            rev,
            changed,
            node_versions
        );
        Ok(CommitOutcome::Committed(rev))
    }

    /// Move the transaction onto `youngest`, failing if any revision sealed
    /// in between touched what we touched.
    fn rebase(&mut self, youngest: Revnum) -> Result<()> {
        for rev in self.base + 1..=youngest {
            for theirs in self.repo.changed_paths(rev)? {
                if let Some(ours) = self.changes.values().find(|ours| conflicts(&theirs, ours)) {
                    return Err(FsError::Conflict {
                        path: ours.path.clone(),
                        base: self.base,
                        rev,
                    });
                }
            }
        }

        let root = self.repo.get_root(youngest)?;
        let mut tree = TxnTree::new(root.clone());
        for edit in &self.edits {
            if let Err(e) = tree.apply(&self.repo, edit) {
                tracing::debug!("Replaying '{}' onto r{} failed: {}", edit.path(), youngest, e);
                return Err(FsError::Conflict {
                    path: edit.path().to_string(),
                    base: self.base,
                    rev: youngest,
                });
            }
        }
        tracing::debug!("Rebased transaction from r{} onto r{}", self.base, youngest);
        self.tree = tree;
        self.base = youngest;
        self.base_root = root;
        Ok(())
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("base", &self.base)
            .field("state", &self.state)
            .field("changes", &self.changes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo_with_file() -> Repository {
        let repo = Repository::in_memory().unwrap();
        let mut txn = repo.begin(0).unwrap();
        txn.add_node("trunk", NodeKind::Dir).unwrap();
        txn.add_node("trunk/a.txt", NodeKind::File).unwrap();
        txn.modify_content("trunk/a.txt", &b"hello"[..]).unwrap();
        assert_eq!(txn.commit().unwrap(), CommitOutcome::Committed(1));
        repo
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TxnState::Open.to_string(), "open");
        assert_eq!(TxnState::Sealed(3).to_string(), "sealed");
        assert_eq!(TxnState::Aborted.to_string(), "aborted");
    }

    #[test]
    fn test_commit_creates_revision() {
        let repo = repo_with_file();
        assert_eq!(repo.youngest_revision().unwrap(), 1);
        assert_eq!(repo.read_file(1, "trunk/a.txt").unwrap(), b"hello");
        let changes = repo.changed_paths(1).unwrap();
        let paths: Vec<_> = changes.iter().map(|c| (c.path.as_str(), c.action)).collect();
        assert_eq!(
            paths,
            vec![("trunk", ChangeAction::Add), ("trunk/a.txt", ChangeAction::Add)]
        );
        assert!(changes[1].text_mod);
        assert_eq!(repo.get_root(1).unwrap().to_string(), "0.1");
    }

    #[test]
    fn test_modification_creates_successor() {
        let repo = repo_with_file();
        let first = repo.node_at(1, "trunk/a.txt").unwrap().id;
        let mut txn = repo.begin(1).unwrap();
        txn.modify_content("trunk/a.txt", &b"hello world"[..]).unwrap();
        assert_eq!(txn.commit().unwrap().revision().unwrap(), 2);
        let second = repo.node_at(2, "trunk/a.txt").unwrap();
        assert_eq!(second.id.node_id(), first.node_id());
        assert_eq!(second.id.revision(), 2);
        assert_eq!(second.predecessor, Some(first.clone()));
        assert!(first.is_ancestor_of(&second.id));
        assert_eq!(repo.read_file(1, "trunk/a.txt").unwrap(), b"hello");
        assert_eq!(repo.read_file(2, "trunk/a.txt").unwrap(), b"hello world");
    }

    #[test]
    fn test_empty_commit_is_noop() {
        let repo = repo_with_file();
        let mut txn = repo.begin(1).unwrap();
        txn.set_revision_property(svn_props::LOG, Some("nothing")).unwrap();
        let outcome = txn.commit().unwrap();
        assert!(outcome.is_noop());
        assert!(matches!(outcome.revision(), Err(FsError::EmptyCommit)));
        assert_eq!(repo.youngest_revision().unwrap(), 1);
    }

    #[test]
    fn test_commit_allowing_empty() {
        let repo = repo_with_file();
        let mut txn = repo.begin(1).unwrap();
        assert_eq!(txn.commit_allowing_empty().unwrap(), 2);
        assert!(repo.changed_paths(2).unwrap().is_empty());
        assert_eq!(repo.read_file(2, "trunk/a.txt").unwrap(), b"hello");
    }

    #[test]
    fn test_operations_require_open_state() {
        let repo = repo_with_file();
        let mut txn = repo.begin(1).unwrap();
        txn.abort();
        assert_eq!(txn.state(), TxnState::Aborted);
        let err = txn.add_node("x", NodeKind::Dir).unwrap_err();
        assert!(matches!(err, FsError::InvalidTransactionState(TxnState::Aborted)));
        assert!(matches!(txn.commit(), Err(FsError::InvalidTransactionState(_))));
        txn.abort();
        assert_eq!(repo.youngest_revision().unwrap(), 1);

        let mut txn = repo.begin(1).unwrap();
        txn.delete_node("trunk/a.txt").unwrap();
        txn.commit().unwrap();
        assert_eq!(txn.state(), TxnState::Sealed(2));
        assert!(matches!(
            txn.delete_node("trunk"),
            Err(FsError::InvalidTransactionState(TxnState::Sealed(2)))
        ));
    }

    #[test]
    fn test_add_then_delete_cancels() {
        let repo = repo_with_file();
        let mut txn = repo.begin(1).unwrap();
        txn.add_node("tmp", NodeKind::Dir).unwrap();
        txn.add_node("tmp/x", NodeKind::File).unwrap();
        txn.delete_node("tmp").unwrap();
        assert!(txn.changed_paths().is_empty());
        assert!(txn.commit().unwrap().is_noop());
    }

    #[test]
    fn test_delete_then_add_is_replace() {
        let repo = repo_with_file();
        let mut txn = repo.begin(1).unwrap();
        txn.delete_node("trunk/a.txt").unwrap();
        txn.add_node("trunk/a.txt", NodeKind::File).unwrap();
        txn.modify_content("trunk/a.txt", &b"new"[..]).unwrap();
        let changes = txn.changed_paths();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].action, ChangeAction::Replace);
        txn.commit().unwrap();
        let old = repo.node_at(1, "trunk/a.txt").unwrap().id;
        let new = repo.node_at(2, "trunk/a.txt").unwrap().id;
        assert_ne!(old.node_id(), new.node_id());
    }

    #[test]
    fn test_reads_see_staged_state() {
        let repo = repo_with_file();
        let mut txn = repo.begin(1).unwrap();
        txn.add_node("trunk/b.txt", NodeKind::File).unwrap();
        txn.modify_content("trunk/b.txt", &b"bee"[..]).unwrap();
        txn.set_node_property("trunk", "svn:ignore", Some("*.o")).unwrap();
        assert_eq!(txn.check_path("trunk/b.txt").unwrap(), Some(NodeKind::File));
        assert_eq!(txn.check_path("nope").unwrap(), None);
        assert_eq!(txn.read_content("trunk/b.txt").unwrap(), b"bee");
        assert_eq!(txn.read_content("trunk/a.txt").unwrap(), b"hello");
        assert_eq!(txn.node_properties("trunk").unwrap().get("svn:ignore").unwrap(), "*.o");
        let listing = txn.list_dir("trunk").unwrap();
        assert_eq!(
            listing,
            vec![("a.txt".to_string(), NodeKind::File), ("b.txt".to_string(), NodeKind::File)]
        );
        assert!(matches!(txn.read_content("trunk"), Err(FsError::NotFile(_))));
    }

    #[test]
    fn test_edit_errors() {
        let repo = repo_with_file();
        let mut txn = repo.begin(1).unwrap();
        assert!(matches!(txn.add_node("trunk", NodeKind::Dir), Err(FsError::PathExists(_))));
        assert!(matches!(txn.delete_node("missing"), Err(FsError::PathNotFound(_))));
        assert!(matches!(
            txn.add_node("trunk/a.txt/x", NodeKind::File),
            Err(FsError::NotDirectory(_))
        ));
        assert!(matches!(txn.modify_content("trunk", &b"x"[..]), Err(FsError::NotFile(_))));
        assert!(matches!(txn.delete_node(""), Err(FsError::InvalidPath(_))));
        assert_eq!(txn.state(), TxnState::Open);
        assert!(txn.commit().unwrap().is_noop());
    }

    #[test]
    fn test_copy_branches_node() {
        let repo = repo_with_file();
        let mut txn = repo.begin(1).unwrap();
        txn.copy(&CopySource { rev: 1, path: "trunk".into() }, "branch").unwrap();
        txn.commit().unwrap();

        let trunk = repo.node_at(1, "trunk").unwrap().id;
        let branch = repo.node_at(2, "branch").unwrap();
        assert_eq!(branch.id, trunk.branch(1).version(2));
        assert_eq!(branch.copyfrom, Some(CopySource { rev: 1, path: "trunk".into() }));
        assert!(trunk.is_ancestor_of(&branch.id));
        assert_eq!(repo.read_file(2, "branch/a.txt").unwrap(), b"hello");

        // Modifying under the copy branches the file instead of succeeding it
        let mut txn = repo.begin(2).unwrap();
        txn.modify_content("branch/a.txt", &b"branched"[..]).unwrap();
        txn.commit().unwrap();
        let original = repo.node_at(1, "trunk/a.txt").unwrap().id;
        let copied = repo.node_at(3, "branch/a.txt").unwrap().id;
        assert_eq!(copied, original.branch(1).version(3));
        assert_eq!(repo.read_file(3, "trunk/a.txt").unwrap(), b"hello");
        assert_eq!(repo.read_file(3, "branch/a.txt").unwrap(), b"branched");

        // A second copy of the same source takes the next branch number
        let mut txn = repo.begin(3).unwrap();
        txn.copy(&CopySource { rev: 1, path: "trunk".into() }, "branch2").unwrap();
        txn.commit().unwrap();
        assert_eq!(repo.node_at(4, "branch2").unwrap().id, trunk.branch(2).version(4));
    }

    #[test]
    fn test_unchanged_siblings_keep_ids() {
        let repo = repo_with_file();
        let mut txn = repo.begin(1).unwrap();
        txn.add_node("other", NodeKind::Dir).unwrap();
        txn.commit().unwrap();
        assert_eq!(
            repo.node_at(2, "trunk").unwrap().id,
            repo.node_at(1, "trunk").unwrap().id
        );
    }

    #[test]
    fn test_conflicting_commits() {
        let repo = repo_with_file();
        let mut first = repo.begin(1).unwrap();
        let mut second = repo.begin(1).unwrap();
        first.modify_content("trunk/a.txt", &b"one"[..]).unwrap();
        second.modify_content("trunk/a.txt", &b"two"[..]).unwrap();
        assert_eq!(first.commit().unwrap(), CommitOutcome::Committed(2));
        let err = second.commit().unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, FsError::Conflict { ref path, base: 1, rev: 2 } if path == "trunk/a.txt"));
        assert_eq!(second.state(), TxnState::Aborted);
        assert_eq!(repo.youngest_revision().unwrap(), 2);
    }

    #[test]
    fn test_non_conflicting_commit_is_rebased() {
        let repo = repo_with_file();
        let mut first = repo.begin(1).unwrap();
        let mut second = repo.begin(1).unwrap();
        first.modify_content("trunk/a.txt", &b"one"[..]).unwrap();
        second.add_node("trunk/b.txt", NodeKind::File).unwrap();
        second.modify_content("trunk/b.txt", &b"bee"[..]).unwrap();
        first.commit().unwrap();
        assert_eq!(second.commit().unwrap(), CommitOutcome::Committed(3));
        assert_eq!(repo.read_file(3, "trunk/a.txt").unwrap(), b"one");
        assert_eq!(repo.read_file(3, "trunk/b.txt").unwrap(), b"bee");
    }

    #[test]
    fn test_delete_of_parent_conflicts() {
        let repo = repo_with_file();
        let mut first = repo.begin(1).unwrap();
        let mut second = repo.begin(1).unwrap();
        first.delete_node("trunk").unwrap();
        second.modify_content("trunk/a.txt", &b"x"[..]).unwrap();
        first.commit().unwrap();
        assert!(matches!(second.commit(), Err(FsError::Conflict { .. })));
    }

    #[test]
    fn test_log_message_supplier() {
        let repo = repo_with_file();
        let mut txn = repo.begin(1).unwrap();
        txn.add_node("x", NodeKind::Dir).unwrap();
        txn.set_log_message_supplier(|| Some("supplied".to_string()));
        let rev = txn.commit().unwrap().revision().unwrap();
        assert_eq!(repo.revision(rev).unwrap().log(), Some("supplied"));

        let mut txn = repo.begin(rev).unwrap();
        txn.add_node("y", NodeKind::Dir).unwrap();
        txn.set_property(PropTarget::Revision, svn_props::LOG, Some("explicit")).unwrap();
        txn.set_log_message_supplier(|| panic!("must not be called"));
        let rev = txn.commit().unwrap().revision().unwrap();
        assert_eq!(repo.revision(rev).unwrap().log(), Some("explicit"));
    }

    #[test]
    fn test_commit_stamps_date() {
        let repo = repo_with_file();
        assert!(repo.revision(1).unwrap().date().is_some());
    }

    #[test]
    fn test_restored_copy_branches_off_older_version() {
        let repo = Repository::in_memory().unwrap();
        let mut txn = repo.begin(0).unwrap();
        txn.add_node("d", NodeKind::Dir).unwrap();
        txn.add_node("d/f", NodeKind::File).unwrap();
        txn.modify_content("d/f", &b"one"[..]).unwrap();
        txn.commit().unwrap();
        let mut txn = repo.begin(1).unwrap();
        txn.modify_content("d/f", &b"two"[..]).unwrap();
        txn.commit().unwrap();
        let mut txn = repo.begin(2).unwrap();
        txn.delete_node("d").unwrap();
        txn.commit().unwrap();
        let mut txn = repo.begin(3).unwrap();
        txn.copy(&CopySource { rev: 1, path: "d".into() }, "d").unwrap();
        txn.commit().unwrap();
        let mut txn = repo.begin(4).unwrap();
        txn.modify_content("d/f", &b"three"[..]).unwrap();
        txn.commit().unwrap();

        let restored = repo.node_at(4, "d/f").unwrap().id;
        let discarded = repo.node_at(2, "d/f").unwrap().id;
        let edited = repo.node_at(5, "d/f").unwrap();
        assert_eq!(restored, repo.node_at(1, "d/f").unwrap().id);
        assert_eq!(edited.id, restored.branch(1).version(5));
        assert_eq!(edited.predecessor, Some(restored.clone()));
        assert!(restored.is_ancestor_of(&edited.id));
        assert!(!discarded.is_ancestor_of(&edited.id));
        assert_eq!(repo.read_file(5, "d/f").unwrap(), b"three");

        // Later edits continue the new branch
        let mut txn = repo.begin(5).unwrap();
        txn.modify_content("d/f", &b"four"[..]).unwrap();
        txn.commit().unwrap();
        let next = repo.node_at(6, "d/f").unwrap().id;
        assert_eq!(next.node_id(), edited.id.node_id());
        assert!(edited.id.is_ancestor_of(&next));
    }

    #[test]
    fn test_commit_with_properties_keeps_them_exactly() {
        let repo = repo_with_file();
        let mut props = PropertyMap::new();
        props.insert(svn_props::LOG.to_string(), "replayed".to_string());
        let mut txn = repo.begin(1).unwrap();
        txn.set_revision_property(svn_props::AUTHOR, Some("dropped")).unwrap();
        assert_eq!(txn.commit_with_properties(props.clone(), false).unwrap(), 2);
        assert_eq!(repo.revision_properties(2).unwrap(), props);

        let mut txn = repo.begin(2).unwrap();
        assert_eq!(txn.commit_with_properties(props, true).unwrap(), 3);
        let revision = repo.revision(3).unwrap();
        assert_eq!(revision.log(), Some("replayed"));
        assert!(revision.date().is_some());
    }

    #[test]
    fn test_apply_text_from_reader() {
        let repo = repo_with_file();
        let mut txn = repo.begin(1).unwrap();
        txn.apply_text("trunk/a.txt", std::io::Cursor::new(b"streamed".to_vec())).unwrap();
        txn.commit().unwrap();
        assert_eq!(repo.read_file(2, "trunk/a.txt").unwrap(), b"streamed");
    }
}

//! Repository handle and revision store
//!
//! A [`Repository`] is a cheap, clonable handle over one storage backend.
//! Readers go straight to the backend; commits additionally serialize on
//! the repository's commit lock.

use crate::config::RepositoryConfig;
use crate::error::{FsError, Result};
use crate::id::{NodeId, NodeVersionId};
use crate::node_store::NodeStore;
use crate::object::{format_date, ChangedPath, NodeKind, NodeRevision, Revision};
use crate::path;
use crate::properties::{apply_changes, svn_props, PropertyMap};
use crate::sqlite_backend::SqliteBackend;
use crate::storage::{Backend, CommitBatch, MemoryBackend, StagingBackend};
use crate::transaction::Transaction;
use crate::Revnum;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DB_FILE: &str = "fs.sqlite";

pub(crate) struct Inner {
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) config: RepositoryConfig,
    pub(crate) commit_lock: Mutex<()>,
    root_path: Option<PathBuf>,
}

/// Handle to a versioned filesystem
#[derive(Clone)]
pub struct Repository {
    pub(crate) inner: Arc<Inner>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("path", &self.inner.root_path)
            .finish()
    }
}

impl Repository {
    fn from_backend(backend: Arc<dyn Backend>, config: RepositoryConfig, root_path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                config,
                commit_lock: Mutex::new(()),
                root_path,
            }),
        }
    }

    /// A fresh repository held in memory
    pub fn in_memory() -> Result<Self> {
        Self::in_memory_with(RepositoryConfig::default())
    }

    pub fn in_memory_with(config: RepositoryConfig) -> Result<Self> {
        let repo = Self::from_backend(Arc::new(MemoryBackend::new()), config, None);
        repo.initialize()?;
        Ok(repo)
    }

    /// Create a repository in directory `path` with default settings
    pub fn create(path: &Path) -> Result<Self> {
        Self::create_with(path, RepositoryConfig::default())
    }

    pub fn create_with(path: &Path, config: RepositoryConfig) -> Result<Self> {
        if path.join(DB_FILE).exists() {
            return Err(FsError::PathExists(path.display().to_string()));
        }
        std::fs::create_dir_all(path)?;
        config.save(path)?;
        let backend = SqliteBackend::open(path, config.compression_level)?;
        let repo = Self::from_backend(Arc::new(backend), config, Some(path.to_path_buf()));
        repo.initialize()?;
        tracing::info!("Created repository at {}", path.display());
        Ok(repo)
    }

    /// Open an existing repository
    pub fn open(path: &Path) -> Result<Self> {
        if !path.join(DB_FILE).exists() {
            return Err(FsError::PathNotFound(path.display().to_string()));
        }
        let config = RepositoryConfig::load(path)?;
        let backend = SqliteBackend::open(path, config.compression_level)?;
        if backend.youngest()?.is_none() {
            return Err(FsError::corrupt(format!("{} has no revision 0", path.display())));
        }
        Ok(Self::from_backend(Arc::new(backend), config, Some(path.to_path_buf())))
    }

    /// Seal revision 0: an empty root directory `0.0`
    fn initialize(&self) -> Result<()> {
        let root = NodeRevision {
            id: NodeId::new(0).version(0),
            kind: NodeKind::Dir,
            props: PropertyMap::new(),
            entries: BTreeMap::new(),
            text: None,
            predecessor: None,
            copyfrom: None,
            created_path: String::new(),
        };
        let mut props = PropertyMap::new();
        props.insert(svn_props::DATE.to_string(), format_date(Utc::now()));
        self.inner.backend.write_batch(CommitBatch {
            revision: Revision {
                number: 0,
                root: root.id.clone(),
                props,
                changes: Vec::new(),
            },
            nodes: vec![root],
            representations: Vec::new(),
            next_node_number: 1,
            branch_counters: Vec::new(),
        })
    }

    /// A repository whose commits are kept in memory on top of this one.
    /// The returned backend gives access to what was staged.
    pub(crate) fn staging(&self) -> (Repository, Arc<StagingBackend>) {
        let staging = Arc::new(StagingBackend::new(Arc::clone(&self.inner.backend)));
        let repo = Self::from_backend(staging.clone(), self.inner.config.clone(), None);
        (repo, staging)
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.root_path.as_deref()
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.inner.config
    }

    pub fn uuid(&self) -> Result<String> {
        self.inner.backend.uuid()
    }

    pub fn set_uuid(&self, uuid: &str) -> Result<()> {
        self.inner.backend.set_uuid(uuid)
    }

    pub(crate) fn node_store(&self) -> NodeStore<'_> {
        NodeStore::new(self.inner.backend.as_ref(), self.inner.config.max_delta_chain)
    }

    // Revision store

    pub fn youngest_revision(&self) -> Result<Revnum> {
        self.inner
            .backend
            .youngest()?
            .ok_or_else(|| FsError::corrupt("repository has no revision 0"))
    }

    pub fn revision(&self, rev: Revnum) -> Result<Revision> {
        self.inner
            .backend
            .revision(rev)?
            .ok_or(FsError::NoSuchRevision(rev))
    }

    pub fn get_root(&self, rev: Revnum) -> Result<NodeVersionId> {
        Ok(self.revision(rev)?.root)
    }

    pub fn revision_properties(&self, rev: Revnum) -> Result<PropertyMap> {
        Ok(self.revision(rev)?.props)
    }

    pub fn get_revision_property(&self, rev: Revnum, name: &str) -> Result<Option<String>> {
        Ok(self.revision(rev)?.props.remove(name))
    }

    pub fn changed_paths(&self, rev: Revnum) -> Result<Vec<ChangedPath>> {
        Ok(self.revision(rev)?.changes)
    }

    /// Revisions from `start` to `end` inclusive; descending when `start > end`
    pub fn log(&self, start: Revnum, end: Revnum) -> Result<Vec<Revision>> {
        let youngest = self.youngest_revision()?;
        for rev in [start, end] {
            if rev > youngest {
                return Err(FsError::NoSuchRevision(rev));
            }
        }
        if start <= end {
            (start..=end).map(|rev| self.revision(rev)).collect()
        } else {
            (end..=start).rev().map(|rev| self.revision(rev)).collect()
        }
    }

    /// Change a property of a sealed revision. The old value is overwritten
    /// without being recorded anywhere, so this is refused unless the
    /// repository configuration allows it.
    pub fn set_revision_property(&self, rev: Revnum, name: &str, value: Option<&str>) -> Result<()> {
        if !self.inner.config.allow_revprop_changes {
            return Err(FsError::UnsupportedFeature(
                "revision property changes are disabled for this repository".to_string(),
            ));
        }
        let _guard = self.inner.commit_lock.lock();
        let mut props = self.revision_properties(rev)?;
        let old = props.get(name).cloned();
        apply_changes(&mut props, [(name.to_string(), value.map(str::to_string))]);
        self.inner.backend.write_revision_properties(rev, &props)?;
        tracing::warn!(
            "Revision property '{}' of r{} changed from {:?} to {:?}; the old value is not kept",
            name,
            rev,
            old,
            value
        );
        Ok(())
    }

    /// Replace all properties of `rev` without the configuration check
    pub(crate) fn overwrite_revision_properties(&self, rev: Revnum, props: &PropertyMap) -> Result<()> {
        let _guard = self.inner.commit_lock.lock();
        self.revision(rev)?;
        self.inner.backend.write_revision_properties(rev, props)
    }

    /// Open a transaction on `base`
    pub fn begin(&self, base: Revnum) -> Result<Transaction> {
        let root = self.get_root(base)?;
        Ok(Transaction::new(self.clone(), base, root))
    }

    // Node store

    pub fn node(&self, id: &NodeVersionId) -> Result<NodeRevision> {
        self.node_store().node(id)
    }

    pub fn read_content(&self, id: &NodeVersionId) -> Result<Vec<u8>> {
        self.node_store().read_content(id)
    }

    pub fn read_properties(&self, id: &NodeVersionId) -> Result<PropertyMap> {
        self.node_store().read_properties(id)
    }

    // Path-level reads

    /// Node version at `path` in revision `rev`
    pub fn node_at(&self, rev: Revnum, path: &str) -> Result<NodeRevision> {
        let path = path::canonicalize(path)?;
        let mut node = self.node(&self.get_root(rev)?)?;
        let mut walked = String::new();
        for name in path::components(&path) {
            if !node.is_dir() {
                return Err(FsError::NotDirectory(walked));
            }
            walked = path::join(&walked, name);
            let id = node
                .entries
                .get(name)
                .ok_or_else(|| FsError::PathNotFound(walked.clone()))?;
            node = self.node(id)?;
        }
        Ok(node)
    }

    pub fn check_path(&self, rev: Revnum, path: &str) -> Result<Option<NodeKind>> {
        match self.node_at(rev, path) {
            Ok(node) => Ok(Some(node.kind)),
            Err(FsError::PathNotFound(_)) | Err(FsError::NotDirectory(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn read_file(&self, rev: Revnum, path: &str) -> Result<Vec<u8>> {
        let node = self.node_at(rev, path)?;
        if !node.is_file() {
            return Err(FsError::NotFile(path.to_string()));
        }
        self.read_content(&node.id)
    }

    pub fn list_dir(&self, rev: Revnum, path: &str) -> Result<Vec<(String, NodeKind)>> {
        let node = self.node_at(rev, path)?;
        if !node.is_dir() {
            return Err(FsError::NotDirectory(path.to_string()));
        }
        node.entries
            .iter()
            .map(|(name, id)| -> Result<(String, NodeKind)> { Ok((name.clone(), self.node(id)?.kind)) })
            .collect()
    }

    pub fn node_properties(&self, rev: Revnum, path: &str) -> Result<PropertyMap> {
        Ok(self.node_at(rev, path)?.props)
    }

    /// Every node at or below `path` in revision `rev`, parents before
    /// children, siblings by name
    pub fn walk(&self, rev: Revnum, path: &str) -> Result<Vec<(String, NodeRevision)>> {
        let start = path::canonicalize(path)?;
        let mut out = Vec::new();
        let mut stack = vec![(start.clone(), self.node_at(rev, &start)?)];
        while let Some((node_path, node)) = stack.pop() {
            for (name, id) in node.entries.iter().rev() {
                stack.push((path::join(&node_path, name), self.node(id)?));
            }
            out.push((node_path, node));
        }
        Ok(out)
    }

    /// Reconstruct every file of `rev` and check identities and checksums.
    /// Returns the number of files verified.
    pub fn verify_revision(&self, rev: Revnum) -> Result<usize> {
        let root = self.get_root(rev)?;
        if root.revision() > rev {
            return Err(FsError::corrupt(format!("root {} of r{} is from the future", root, rev)));
        }
        let mut files = 0;
        for (node_path, node) in self.walk(rev, "")? {
            if !node.id.is_consistent() || node.id.revision() > rev {
                return Err(FsError::corrupt(format!(
                    "node {} at '{}' is not a valid version for r{}",
                    node.id, node_path, rev
                )));
            }
            if node.is_file() {
                self.read_content(&node.id)?;
                files += 1;
            }
        }
        tracing::debug!("Verified r{} ({} files)", rev, files);
        Ok(files)
    }
}

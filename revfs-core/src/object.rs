//! Object model for the versioned filesystem
//!
//! Revisions point at a root directory node version; directory node versions
//! map entry names to child node versions; file node versions reference a
//! stored text representation, which is either a full text or a delta against
//! an earlier representation.

use crate::delta::Delta;
use crate::id::NodeVersionId;
use crate::properties::{svn_props, PropertyMap};
use crate::Revnum;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Kind of a versioned node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Dir,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Dir => "dir",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "file" => Ok(NodeKind::File),
            "dir" => Ok(NodeKind::Dir),
            other => Err(format!("unknown node kind '{}'", other)),
        }
    }
}

/// Where a node was copied from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopySource {
    pub rev: Revnum,
    pub path: String,
}

/// Reference from a file node version to its text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRef {
    /// Node version whose representation holds the text
    pub rep: NodeVersionId,
    pub len: u64,
    pub md5: String,
    pub sha1: String,
}

impl TextRef {
    pub fn for_content(rep: NodeVersionId, content: &[u8]) -> Self {
        Self {
            rep,
            len: content.len() as u64,
            md5: md5_hex(content),
            sha1: sha1_hex(content),
        }
    }
}

pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// One immutable version of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRevision {
    pub id: NodeVersionId,
    pub kind: NodeKind,
    pub props: PropertyMap,
    /// Directory entries (always empty for files)
    pub entries: BTreeMap<String, NodeVersionId>,
    /// File text (always `None` for directories)
    pub text: Option<TextRef>,
    /// Previous version on this node's history line
    pub predecessor: Option<NodeVersionId>,
    pub copyfrom: Option<CopySource>,
    /// Path at which this node id came into existence
    pub created_path: String,
}

impl NodeRevision {
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Dir
    }

    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }
}

/// Stored form of a file text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Representation {
    FullText(Vec<u8>),
    Delta {
        /// Representation the delta applies to
        base: NodeVersionId,
        /// Number of deltas between this representation and a full text
        depth: u32,
        delta: Delta,
    },
}

impl Representation {
    pub fn depth(&self) -> u32 {
        match self {
            Representation::FullText(_) => 0,
            Representation::Delta { depth, .. } => *depth,
        }
    }
}

/// What a commit did to a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeAction {
    Add,
    Delete,
    Modify,
    Replace,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Add => "add",
            ChangeAction::Delete => "delete",
            ChangeAction::Modify => "change",
            ChangeAction::Replace => "replace",
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A path changed by a revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedPath {
    pub path: String,
    pub action: ChangeAction,
    /// Kind of the node left at the path (`None` for deletes)
    pub kind: Option<NodeKind>,
    pub text_mod: bool,
    pub prop_mod: bool,
    pub copyfrom: Option<CopySource>,
}

/// A sealed revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub number: Revnum,
    pub root: NodeVersionId,
    pub props: PropertyMap,
    /// Changed paths, sorted by path
    pub changes: Vec<ChangedPath>,
}

impl Revision {
    pub fn author(&self) -> Option<&str> {
        self.props.get(svn_props::AUTHOR).map(String::as_str)
    }

    pub fn log(&self) -> Option<&str> {
        self.props.get(svn_props::LOG).map(String::as_str)
    }

    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.props
            .get(svn_props::DATE)
            .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Format a timestamp the way `svn:date` stores it
pub fn format_date(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

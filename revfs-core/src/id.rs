//! Node and node-version identity
//!
//! Nodes and node versions are named by dot-separated integer sequences that
//! read like RCS revision numbers:
//!
//! ```text
//! node_id         ::= number | node_version_id "." number
//! node_version_id ::= node_id "." number
//! ```
//!
//! - `100` is a node id.
//! - `100.10` is version 10 of node 100, created in revision 10.
//! - `100.10.3` is the third branch taken off `100.10`.
//! - `100.10.3.13` is that branch's version created in revision 13.
//!
//! The trailing component of a node version id is always the revision that
//! created it, so ancestry between two versions can be read off the ids.

use crate::error::{FsError, Result};
use crate::Revnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

fn parse_components(s: &str) -> Result<Vec<u64>> {
    if s.is_empty() {
        return Err(FsError::MalformedId(s.to_string()));
    }
    s.split('.')
        .map(|part| {
            let canonical = !part.is_empty()
                && part.bytes().all(|b| b.is_ascii_digit())
                && (part == "0" || !part.starts_with('0'));
            if !canonical {
                return Err(FsError::MalformedId(s.to_string()));
            }
            part.parse::<u64>().map_err(|_| FsError::MalformedId(s.to_string()))
        })
        .collect()
}

fn write_components(f: &mut fmt::Formatter<'_>, parts: &[u64]) -> fmt::Result {
    for (i, n) in parts.iter().enumerate() {
        if i > 0 {
            f.write_str(".")?;
        }
        write!(f, "{}", n)?;
    }
    Ok(())
}

/// Identity of a node, stable across content changes and renames
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(Vec<u64>);

impl NodeId {
    /// A root-level node id
    pub fn new(number: u64) -> Self {
        Self(vec![number])
    }

    pub fn parse(s: &str) -> Result<Self> {
        let parts = parse_components(s)?;
        if parts.len() % 2 == 0 {
            return Err(FsError::MalformedId(s.to_string()));
        }
        Ok(Self(parts))
    }

    /// The version of this node created in `rev`
    pub fn version(&self, rev: Revnum) -> NodeVersionId {
        let mut parts = self.0.clone();
        parts.push(rev);
        NodeVersionId(parts)
    }

    pub fn components(&self) -> &[u64] {
        &self.0
    }

    /// Whether this node id names a branch rather than an original node
    pub fn is_branch(&self) -> bool {
        self.0.len() > 1
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_components(f, &self.0)
    }
}

impl FromStr for NodeId {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for NodeId {
    type Error = FsError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.to_string()
    }
}

/// Identity of one immutable version of a node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeVersionId(Vec<u64>);

impl NodeVersionId {
    /// Parse a node version id; fails with `MalformedId` on empty input,
    /// non-canonical components, or an odd number of components.
    pub fn parse(s: &str) -> Result<Self> {
        let parts = parse_components(s)?;
        if parts.len() % 2 != 0 {
            return Err(FsError::MalformedId(s.to_string()));
        }
        Ok(Self(parts))
    }

    /// Inverse of [`NodeVersionId::parse`]
    pub fn render(&self) -> String {
        self.to_string()
    }

    /// The node this is a version of
    pub fn node_id(&self) -> NodeId {
        NodeId(self.0[..self.0.len() - 1].to_vec())
    }

    /// The revision in which this version was created
    pub fn revision(&self) -> Revnum {
        self.0[self.0.len() - 1]
    }

    /// The node id of the `n`th branch taken off this version
    pub fn branch(&self, n: u64) -> NodeId {
        let mut parts = self.0.clone();
        parts.push(n);
        NodeId(parts)
    }

    pub fn components(&self) -> &[u64] {
        &self.0
    }

    /// Revision components never decrease from left to right. `100.13.10.2`
    /// is not consistent: a branch of a version made in r13 cannot have a
    /// version made in r2.
    pub fn is_consistent(&self) -> bool {
        self.0
            .iter()
            .skip(1)
            .step_by(2)
            .try_fold(0u64, |last, &rev| (rev >= last).then_some(rev))
            .is_some()
    }

    /// Whether `self` lies on the history line leading to `other`.
    ///
    /// `100.5` precedes `100.9`; `100.10` precedes `100.10.3.13` because the
    /// branch was taken off it; `100.12` does not precede `100.10.3.13`.
    pub fn is_ancestor_of(&self, other: &NodeVersionId) -> bool {
        let n = self.0.len();
        if self == other || n > other.0.len() {
            return false;
        }
        self.0[..n - 1] == other.0[..n - 1] && self.0[n - 1] <= other.0[n - 1]
    }
}

/// Free-standing form of [`NodeVersionId::is_ancestor_of`]
pub fn is_ancestor(a: &NodeVersionId, b: &NodeVersionId) -> bool {
    a.is_ancestor_of(b)
}

impl fmt::Display for NodeVersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_components(f, &self.0)
    }
}

impl FromStr for NodeVersionId {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for NodeVersionId {
    type Error = FsError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<NodeVersionId> for String {
    fn from(id: NodeVersionId) -> Self {
        id.to_string()
    }
}

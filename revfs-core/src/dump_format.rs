//! Dump stream records and header names

use crate::object::{ChangeAction, CopySource, NodeKind};
use crate::Revnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const FORMAT_VERSION: &str = "SVN-fs-dump-format-version";
pub const UUID: &str = "UUID";
pub const REVISION_NUMBER: &str = "Revision-number";
pub const NODE_PATH: &str = "Node-path";
pub const NODE_KIND: &str = "Node-kind";
pub const NODE_ACTION: &str = "Node-action";
pub const NODE_COPYFROM_REV: &str = "Node-copyfrom-rev";
pub const NODE_COPYFROM_PATH: &str = "Node-copyfrom-path";
pub const PROP_CONTENT_LENGTH: &str = "Prop-content-length";
pub const TEXT_CONTENT_LENGTH: &str = "Text-content-length";
pub const CONTENT_LENGTH: &str = "Content-length";
pub const PROP_DELTA: &str = "Prop-delta";
pub const TEXT_DELTA: &str = "Text-delta";
pub const TEXT_CONTENT_MD5: &str = "Text-content-md5";
pub const TEXT_CONTENT_SHA1: &str = "Text-content-sha1";
pub const TEXT_CONTENT_CHECKSUM: &str = "Text-content-checksum";

/// Dump format versions this engine reads
pub const SUPPORTED_VERSIONS: std::ops::RangeInclusive<u32> = 1..=3;

/// Node action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeAction {
    Add,
    Delete,
    Change,
    Replace,
}

impl NodeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeAction::Add => "add",
            NodeAction::Delete => "delete",
            NodeAction::Change => "change",
            NodeAction::Replace => "replace",
        }
    }
}

impl fmt::Display for NodeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(NodeAction::Add),
            "delete" => Ok(NodeAction::Delete),
            "change" => Ok(NodeAction::Change),
            "replace" => Ok(NodeAction::Replace),
            other => Err(format!("unknown node action '{}'", other)),
        }
    }
}

impl From<ChangeAction> for NodeAction {
    fn from(action: ChangeAction) -> Self {
        match action {
            ChangeAction::Add => NodeAction::Add,
            ChangeAction::Delete => NodeAction::Delete,
            ChangeAction::Modify => NodeAction::Change,
            ChangeAction::Replace => NodeAction::Replace,
        }
    }
}

/// How a node record's property block applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropsMode {
    /// The block is the node's complete property set
    Full,
    /// The block lists only sets and deletions
    Delta,
}

/// Header block of a revision record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionHeader {
    pub revision: Revnum,
}

/// Header block of a node record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHeader {
    pub path: String,
    pub kind: Option<NodeKind>,
    pub action: NodeAction,
    pub copyfrom: Option<CopySource>,
    /// `None` when the record carries no property block
    pub props: Option<PropsMode>,
    /// `None` when the record carries no text
    pub text_len: Option<u64>,
    pub md5: Option<String>,
    pub sha1: Option<String>,
}

impl NodeHeader {
    pub fn has_checksum(&self) -> bool {
        self.md5.is_some() || self.sha1.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_action_strings() {
        for action in [NodeAction::Add, NodeAction::Delete, NodeAction::Change, NodeAction::Replace] {
            assert_eq!(action.as_str().parse::<NodeAction>().unwrap(), action);
        }
        assert!("move".parse::<NodeAction>().is_err());
        assert_eq!(NodeAction::from(ChangeAction::Modify), NodeAction::Change);
    }

    #[test]
    fn test_supported_versions() {
        assert!(SUPPORTED_VERSIONS.contains(&2));
        assert!(!SUPPORTED_VERSIONS.contains(&4));
    }
}

//! Node store: node versions and their text representations
//!
//! A file's text is stored either as a full text or as a forward delta
//! against its predecessor's representation. Reading walks the chain back
//! to the nearest full text and applies the deltas oldest to newest.

use crate::delta::Delta;
use crate::error::{FsError, Result};
use crate::id::NodeVersionId;
use crate::object::{md5_hex, NodeRevision, Representation, TextRef};
use crate::properties::PropertyMap;
use crate::storage::{Backend, CommitBatch};

/// Read access to committed node versions plus the storage policy used
/// when a commit writes new texts.
pub struct NodeStore<'a> {
    backend: &'a dyn Backend,
    max_delta_chain: u32,
}

impl<'a> NodeStore<'a> {
    pub fn new(backend: &'a dyn Backend, max_delta_chain: u32) -> Self {
        Self { backend, max_delta_chain }
    }

    /// Fetch a committed node version
    pub fn node(&self, id: &NodeVersionId) -> Result<NodeRevision> {
        self.backend
            .node(id)?
            .ok_or_else(|| FsError::NoSuchNode(id.to_string()))
    }

    pub fn read_properties(&self, id: &NodeVersionId) -> Result<PropertyMap> {
        Ok(self.node(id)?.props)
    }

    /// Full text of a file node version, verified against its MD5
    pub fn read_content(&self, id: &NodeVersionId) -> Result<Vec<u8>> {
        let node = self.node(id)?;
        if !node.is_file() {
            return Err(FsError::NotFile(id.to_string()));
        }
        let Some(text) = node.text else {
            return Ok(Vec::new());
        };
        let content = self.reconstruct(&text.rep)?;
        if content.len() as u64 != text.len || md5_hex(&content) != text.md5 {
            return Err(FsError::corrupt(format!(
                "text of {} does not match its checksum {}",
                id, text.md5
            )));
        }
        Ok(content)
    }

    /// Rebuild the bytes held by representation `key`
    pub fn reconstruct(&self, key: &NodeVersionId) -> Result<Vec<u8>> {
        let mut deltas = Vec::new();
        let mut current = key.clone();
        let mut expected_depth: Option<u32> = None;
        loop {
            let rep = self.backend.representation(&current)?.ok_or_else(|| {
                FsError::corrupt(format!("representation {} is missing (needed by {})", current, key))
            })?;
            if let Some(expected) = expected_depth {
                if rep.depth() != expected {
                    return Err(FsError::corrupt(format!(
                        "representation {} has depth {}, expected {}",
                        current,
                        rep.depth(),
                        expected
                    )));
                }
            }
            match rep {
                Representation::FullText(base) => {
                    let mut content = base;
                    for delta in deltas.iter().rev() {
                        content = Delta::apply(delta, &content)?;
                    }
                    return Ok(content);
                }
                Representation::Delta { base, depth, delta } => {
                    if depth == 0 {
                        return Err(FsError::corrupt(format!("delta {} claims depth 0", current)));
                    }
                    deltas.push(delta);
                    expected_depth = Some(depth - 1);
                    current = base;
                }
            }
        }
    }

    /// Store `content` as the full text of node version `id`
    pub fn write_full_text(&self, batch: &mut CommitBatch, id: &NodeVersionId, content: &[u8]) -> TextRef {
        batch
            .representations
            .push((id.clone(), Representation::FullText(content.to_vec())));
        TextRef::for_content(id.clone(), content)
    }

    /// Store `content` for node version `id`, deltified against `base` (the
    /// predecessor's text) when the chain stays short and the delta pays off.
    /// Unchanged content reuses the base representation.
    pub fn write_text(
        &self,
        batch: &mut CommitBatch,
        id: &NodeVersionId,
        content: &[u8],
        base: Option<&TextRef>,
    ) -> Result<TextRef> {
        let Some(base) = base else {
            return Ok(self.write_full_text(batch, id, content));
        };
        if base.len == content.len() as u64 && base.md5 == md5_hex(content) {
            tracing::debug!("{}: text unchanged, sharing representation {}", id, base.rep);
            return Ok(base.clone());
        }
        if self.max_delta_chain == 0 {
            return Ok(self.write_full_text(batch, id, content));
        }

        let base_rep = self.backend.representation(&base.rep)?.ok_or_else(|| {
            FsError::corrupt(format!("representation {} is missing", base.rep))
        })?;
        let depth = base_rep.depth() + 1;
        if depth > self.max_delta_chain {
            tracing::debug!("{}: delta chain would reach {}, storing full text", id, depth);
            return Ok(self.write_full_text(batch, id, content));
        }

        let source = self.reconstruct(&base.rep)?;
        let delta = Delta::compute(&source, content);
        let encoded = delta.to_bytes()?.len();
        if encoded >= content.len() {
            tracing::debug!("{}: delta ({} bytes) not smaller than text, storing full text", id, encoded);
            return Ok(self.write_full_text(batch, id, content));
        }

        tracing::debug!("{}: stored as delta against {} (depth {}, {} bytes)", id, base.rep, depth, encoded);
        batch.representations.push((
            id.clone(),
            Representation::Delta {
                base: base.rep.clone(),
                depth,
                delta,
            },
        ));
        Ok(TextRef::for_content(id.clone(), content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::NodeId;
    use crate::object::{NodeKind, Revision};
    use crate::storage::MemoryBackend;
    use crate::Revnum;
    use std::collections::BTreeMap;

    fn empty_batch(rev: Revnum) -> CommitBatch {
        CommitBatch {
            revision: Revision {
                number: rev,
                root: NodeId::new(0).version(rev),
                props: PropertyMap::new(),
                changes: Vec::new(),
            },
            nodes: Vec::new(),
            representations: Vec::new(),
            next_node_number: 101,
            branch_counters: Vec::new(),
        }
    }

    fn file_node(id: &NodeVersionId, text: TextRef, predecessor: Option<NodeVersionId>) -> NodeRevision {
        NodeRevision {
            id: id.clone(),
            kind: NodeKind::File,
            props: PropertyMap::new(),
            entries: BTreeMap::new(),
            text: Some(text),
            predecessor,
            copyfrom: None,
            created_path: "f".into(),
        }
    }

    /// Writes one version of node 100 per revision and returns the last text
    fn write_versions(backend: &MemoryBackend, max_chain: u32, texts: &[Vec<u8>]) -> Vec<TextRef> {
        let store = NodeStore::new(backend, max_chain);
        let mut refs: Vec<TextRef> = Vec::new();
        let mut prev_id: Option<NodeVersionId> = None;
        for (rev, content) in texts.iter().enumerate() {
            let rev = rev as Revnum;
            let id = NodeId::new(100).version(rev);
            let mut batch = empty_batch(rev);
            let text = store.write_text(&mut batch, &id, content, refs.last()).unwrap();
            batch.nodes.push(file_node(&id, text.clone(), prev_id.clone()));
            backend.write_batch(batch).unwrap();
            refs.push(text);
            prev_id = Some(id);
        }
        refs
    }

    fn growing_texts(n: usize) -> Vec<Vec<u8>> {
        let mut text: Vec<u8> = (0..4096u32).flat_map(|i| i.to_le_bytes()).collect();
        (0..n)
            .map(|i| {
                text.extend_from_slice(format!("line {}\n", i).as_bytes());
                text.clone()
            })
            .collect()
    }

    #[test]
    fn test_full_text_roundtrip() {
        let backend = MemoryBackend::new();
        let refs = write_versions(&backend, 16, &[b"hello".to_vec()]);
        let store = NodeStore::new(&backend, 16);
        let id = NodeId::new(100).version(0);
        assert_eq!(refs[0].rep, id);
        assert_eq!(store.read_content(&id).unwrap(), b"hello");
    }

    #[test]
    fn test_delta_chain_reconstruction() {
        let backend = MemoryBackend::new();
        let texts = growing_texts(6);
        write_versions(&backend, 16, &texts);
        let store = NodeStore::new(&backend, 16);
        for (rev, expected) in texts.iter().enumerate() {
            let id = NodeId::new(100).version(rev as Revnum);
            assert_eq!(&store.read_content(&id).unwrap(), expected);
        }
        let last = backend.representation(&NodeId::new(100).version(5)).unwrap().unwrap();
        assert_eq!(last.depth(), 5);
    }

    #[test]
    fn test_chain_is_cut_at_threshold() {
        let backend = MemoryBackend::new();
        let texts = growing_texts(7);
        write_versions(&backend, 3, &texts);
        let depths: Vec<u32> = (0..7)
            .map(|rev| {
                backend
                    .representation(&NodeId::new(100).version(rev))
                    .unwrap()
                    .unwrap()
                    .depth()
            })
            .collect();
        assert_eq!(depths, vec![0, 1, 2, 3, 0, 1, 2]);
        let store = NodeStore::new(&backend, 3);
        assert_eq!(store.read_content(&NodeId::new(100).version(6)).unwrap(), texts[6]);
    }

    #[test]
    fn test_zero_threshold_stores_full_texts() {
        let backend = MemoryBackend::new();
        write_versions(&backend, 0, &growing_texts(3));
        for rev in 0..3 {
            let rep = backend.representation(&NodeId::new(100).version(rev)).unwrap().unwrap();
            assert!(matches!(rep, Representation::FullText(_)));
        }
    }

    #[test]
    fn test_unchanged_text_shares_representation() {
        let backend = MemoryBackend::new();
        let refs = write_versions(&backend, 16, &[b"same".to_vec(), b"same".to_vec()]);
        assert_eq!(refs[1].rep, NodeId::new(100).version(0));
        assert!(backend.representation(&NodeId::new(100).version(1)).unwrap().is_none());
        let store = NodeStore::new(&backend, 16);
        assert_eq!(store.read_content(&NodeId::new(100).version(1)).unwrap(), b"same");
    }

    #[test]
    fn test_broken_chain_is_corrupt() {
        let backend = MemoryBackend::new();
        write_versions(&backend, 16, &growing_texts(4));
        backend.remove_representation(&NodeId::new(100).version(1));
        let store = NodeStore::new(&backend, 16);
        let err = store.read_content(&NodeId::new(100).version(3)).unwrap_err();
        assert!(matches!(err, FsError::CorruptData(_)), "{}", err);
        assert_eq!(store.read_content(&NodeId::new(100).version(0)).unwrap().len(), 4096 * 4 + 7);
    }

    #[test]
    fn test_checksum_mismatch_is_corrupt() {
        let backend = MemoryBackend::new();
        write_versions(&backend, 16, &[b"hello".to_vec()]);
        backend.replace_representation(
            &NodeId::new(100).version(0),
            Representation::FullText(b"jello".to_vec()),
        );
        let store = NodeStore::new(&backend, 16);
        assert!(matches!(
            store.read_content(&NodeId::new(100).version(0)),
            Err(FsError::CorruptData(_))
        ));
    }

    #[test]
    fn test_missing_node() {
        let backend = MemoryBackend::new();
        let store = NodeStore::new(&backend, 16);
        let id = NodeVersionId::parse("9.9").unwrap();
        assert!(matches!(store.node(&id), Err(FsError::NoSuchNode(_))));
    }
}

//! Integration tests for the dump/load cycle

use revfs_core::{
    dump_repository, load_dump, svn_props, CancelFlag, CopySource, DumpOptions, FsError,
    LoadOptions, NodeKind, PropertyMap, Repository,
};
use std::collections::BTreeMap;
use std::io::{self, BufReader, Read};
use tempfile::TempDir;

type Snapshot = BTreeMap<String, (NodeKind, PropertyMap, Option<Vec<u8>>)>;

/// Build a repository with adds, text and property changes, copies,
/// deletes, a replace and a long run of edits to one file
fn build_history(repo: &Repository) {
    let mut txn = repo.begin(0).unwrap();
    txn.set_revision_property(svn_props::AUTHOR, Some("alice")).unwrap();
    txn.set_revision_property(svn_props::LOG, Some("Initial import")).unwrap();
    txn.add_node("trunk", NodeKind::Dir).unwrap();
    txn.add_node("trunk/src", NodeKind::Dir).unwrap();
    txn.add_node("trunk/README", NodeKind::File).unwrap();
    txn.modify_content("trunk/README", &b"readme v1\n"[..]).unwrap();
    txn.add_node("trunk/src/main.c", NodeKind::File).unwrap();
    txn.modify_content("trunk/src/main.c", &b"int main() { return 0; }\n"[..]).unwrap();
    txn.add_node("trunk/empty", NodeKind::File).unwrap();
    assert_eq!(txn.commit().unwrap().revision().unwrap(), 1);

    let mut txn = repo.begin(1).unwrap();
    txn.set_revision_property(svn_props::AUTHOR, Some("bob")).unwrap();
    txn.set_revision_property(svn_props::LOG, Some("Update readme\nand set properties")).unwrap();
    txn.modify_content("trunk/README", &b"readme v2\n"[..]).unwrap();
    txn.set_node_property("trunk/src/main.c", "svn:eol-style", Some("native")).unwrap();
    txn.set_node_property("", "custom", Some("yes")).unwrap();
    txn.commit().unwrap();

    let mut txn = repo.begin(2).unwrap();
    txn.set_revision_property(svn_props::LOG, Some("Tag v1")).unwrap();
    txn.add_node("tags", NodeKind::Dir).unwrap();
    txn.copy(&CopySource { rev: 2, path: "trunk".into() }, "tags/v1").unwrap();
    txn.commit().unwrap();

    let mut txn = repo.begin(3).unwrap();
    txn.set_revision_property(svn_props::LOG, Some("Shuffle files")).unwrap();
    txn.delete_node("trunk/README").unwrap();
    txn.add_node("trunk/NEWS", NodeKind::File).unwrap();
    txn.modify_content("trunk/NEWS", &b"news\n"[..]).unwrap();
    txn.modify_content("tags/v1/src/main.c", &b"int main() { return 1; }\n"[..]).unwrap();
    txn.commit().unwrap();

    let mut txn = repo.begin(4).unwrap();
    txn.set_revision_property(svn_props::LOG, Some("Replace trunk/src")).unwrap();
    txn.delete_node("trunk/src").unwrap();
    txn.copy(&CopySource { rev: 4, path: "tags/v1/src".into() }, "trunk/src").unwrap();
    txn.commit().unwrap();

    let mut news = b"news\n".to_vec();
    for i in 0..20 {
        news.extend_from_slice(format!("entry {}\n", i).as_bytes());
        let base = repo.youngest_revision().unwrap();
        let mut txn = repo.begin(base).unwrap();
        txn.set_revision_property(svn_props::LOG, Some(&format!("News entry {}", i))).unwrap();
        txn.modify_content("trunk/NEWS", news.clone()).unwrap();
        txn.commit().unwrap();
    }
    assert_eq!(repo.youngest_revision().unwrap(), 25);
}

fn snapshot(repo: &Repository, rev: u64) -> Snapshot {
    repo.walk(rev, "")
        .unwrap()
        .into_iter()
        .map(|(path, node)| {
            let content = node.is_file().then(|| repo.read_file(rev, &path).unwrap());
            (path, (node.kind, node.props, content))
        })
        .collect()
}

fn dump_all(repo: &Repository, options: &DumpOptions) -> Vec<u8> {
    let mut out = Vec::new();
    dump_repository(repo, &mut out, options, None).unwrap();
    out
}

fn assert_same_history(a: &Repository, b: &Repository) {
    assert_eq!(a.youngest_revision().unwrap(), b.youngest_revision().unwrap());
    for rev in 0..=a.youngest_revision().unwrap() {
        assert_eq!(snapshot(a, rev), snapshot(b, rev), "trees differ at r{}", rev);
        assert_eq!(
            a.revision_properties(rev).unwrap(),
            b.revision_properties(rev).unwrap(),
            "revision properties differ at r{}",
            rev
        );
    }
}

#[test]
fn test_round_trip_in_memory() {
    let source = Repository::in_memory().unwrap();
    build_history(&source);
    let dump = dump_all(&source, &DumpOptions::default());

    let target = Repository::in_memory().unwrap();
    let stats = load_dump(&target, &dump[..], &LoadOptions::default(), None).unwrap();
    assert_eq!(stats.revisions_loaded, 25);
    assert_eq!(stats.last_revision, Some(25));

    assert_same_history(&source, &target);
    assert_eq!(target.uuid().unwrap(), source.uuid().unwrap());

    // Dumping the loaded repository reproduces the stream
    let again = dump_all(&target, &DumpOptions::default());
    assert_eq!(String::from_utf8_lossy(&again), String::from_utf8_lossy(&dump));
}

#[test]
fn test_round_trip_sqlite() {
    let tmp = TempDir::new().unwrap();
    let source = Repository::create(&tmp.path().join("source")).unwrap();
    build_history(&source);
    let dump = dump_all(&source, &DumpOptions::default());

    {
        let target = Repository::create(&tmp.path().join("target")).unwrap();
        load_dump(&target, &dump[..], &LoadOptions::default(), None).unwrap();
    }

    let target = Repository::open(&tmp.path().join("target")).unwrap();
    assert_same_history(&source, &target);
    for rev in 0..=25 {
        target.verify_revision(rev).unwrap();
    }
}

#[test]
fn test_copy_history_survives_load() {
    let source = Repository::in_memory().unwrap();
    build_history(&source);
    let target = Repository::in_memory().unwrap();
    load_dump(&target, &dump_all(&source, &DumpOptions::default())[..], &LoadOptions::default(), None).unwrap();

    let changes = target.changed_paths(5).unwrap();
    let replaced = changes.iter().find(|c| c.path == "trunk/src").unwrap();
    assert_eq!(replaced.copyfrom, Some(CopySource { rev: 4, path: "tags/v1/src".into() }));

    let tagged = target.node_at(3, "tags/v1").unwrap();
    assert!(tagged.id.node_id().is_branch());
}

#[test]
fn test_incremental_dumps_compose() {
    let source = Repository::in_memory().unwrap();
    build_history(&source);

    let first = dump_all(
        &source,
        &DumpOptions {
            end: Some(3),
            ..Default::default()
        },
    );
    let rest = dump_all(
        &source,
        &DumpOptions {
            start: 4,
            incremental: true,
            ..Default::default()
        },
    );

    let target = Repository::in_memory().unwrap();
    load_dump(&target, &first[..], &LoadOptions::default(), None).unwrap();
    assert_eq!(target.youngest_revision().unwrap(), 3);
    load_dump(&target, &rest[..], &LoadOptions::default(), None).unwrap();
    assert_same_history(&source, &target);
}

#[test]
fn test_partial_range_loads_standalone() {
    let source = Repository::in_memory().unwrap();
    build_history(&source);
    let dump = dump_all(
        &source,
        &DumpOptions {
            start: 3,
            end: Some(5),
            ..Default::default()
        },
    );

    let target = Repository::in_memory().unwrap();
    let stats = load_dump(&target, &dump[..], &LoadOptions::default(), None).unwrap();
    assert_eq!(stats.revision_map.get(&3), Some(&1));
    assert_eq!(stats.revision_map.get(&5), Some(&3));
    for (dumped, loaded) in [(3, 1), (4, 2), (5, 3)] {
        assert_eq!(snapshot(&source, dumped), snapshot(&target, loaded));
    }
}

#[test]
fn test_truncated_stream_loads_nothing() {
    let source = Repository::in_memory().unwrap();
    build_history(&source);
    let dump = dump_all(&source, &DumpOptions::default());
    let text = String::from_utf8(dump).unwrap();
    let cut = text.find("readme v2").unwrap() + 3;

    let target = Repository::in_memory().unwrap();
    let uuid = target.uuid().unwrap();
    let err = load_dump(&target, text[..cut].as_bytes(), &LoadOptions::default(), None).unwrap_err();
    assert!(matches!(err, FsError::MalformedStream(_)), "got {:?}", err);
    assert_eq!(target.youngest_revision().unwrap(), 0);
    assert_eq!(target.uuid().unwrap(), uuid);

    // The complete stream still loads into the same target
    load_dump(&target, text.as_bytes(), &LoadOptions::default(), None).unwrap();
    assert_same_history(&source, &target);
}

#[test]
fn test_truncated_stream_on_disk_loads_nothing() {
    let tmp = TempDir::new().unwrap();
    let source = Repository::in_memory().unwrap();
    build_history(&source);
    let text = String::from_utf8(dump_all(&source, &DumpOptions::default())).unwrap();
    let cut = text.find("Revision-number: 20").unwrap();

    let path = tmp.path().join("target");
    {
        let target = Repository::create(&path).unwrap();
        let err = load_dump(&target, text[..cut + 10].as_bytes(), &LoadOptions::default(), None).unwrap_err();
        assert!(matches!(err, FsError::MalformedStream(_)), "got {:?}", err);
    }
    let target = Repository::open(&path).unwrap();
    assert_eq!(target.youngest_revision().unwrap(), 0);
}

#[test]
fn test_malformed_first_revision_leaves_target_untouched() {
    let target = Repository::in_memory().unwrap();
    let stream = "SVN-fs-dump-format-version: 2\n\nRevision-number: 1\n\nNode-path: a\nNode-action: sideways\n\n";
    let err = load_dump(&target, stream.as_bytes(), &LoadOptions::default(), None).unwrap_err();
    assert!(matches!(err, FsError::MalformedStream(_)));
    assert_eq!(target.youngest_revision().unwrap(), 0);
}

#[test]
fn test_props_only_record_leaves_content() {
    let target = Repository::in_memory().unwrap();
    let stream = "SVN-fs-dump-format-version: 2

Revision-number: 1

Node-path: f
Node-kind: file
Node-action: add
Text-content-length: 3
Content-length: 3

abc

Revision-number: 2

Node-path: f
Node-kind: file
Node-action: change
Prop-content-length: 11
Content-length: 11

PROPS-END


";
    load_dump(&target, stream.as_bytes(), &LoadOptions::default(), None).unwrap();
    assert_eq!(target.youngest_revision().unwrap(), 2);
    assert_eq!(target.read_file(2, "f").unwrap(), b"abc");
    assert_eq!(target.node_at(1, "f").unwrap().id, target.node_at(2, "f").unwrap().id);
}

#[test]
fn test_load_cancelled() {
    let source = Repository::in_memory().unwrap();
    build_history(&source);
    let dump = dump_all(&source, &DumpOptions::default());

    let target = Repository::in_memory().unwrap();
    let cancel = CancelFlag::new();
    cancel.cancel();
    let err = load_dump(&target, &dump[..], &LoadOptions::default(), Some(&cancel)).unwrap_err();
    assert!(matches!(err, FsError::Cancelled));
    assert_eq!(target.youngest_revision().unwrap(), 0);
}

#[test]
fn test_header_without_colon_leaves_youngest() {
    let target = Repository::in_memory().unwrap();
    let mut txn = target.begin(0).unwrap();
    txn.add_node("a", NodeKind::File).unwrap();
    txn.commit().unwrap();

    let stream = "SVN-fs-dump-format-version: 2\n\nRevision-number: 1\nno colon here\n\n";
    let err = load_dump(&target, stream.as_bytes(), &LoadOptions::default(), None).unwrap_err();
    assert!(matches!(err, FsError::MalformedStream(_)));
    assert_eq!(target.youngest_revision().unwrap(), 1);
}

#[test]
fn test_bad_header_after_replayed_revisions_loads_nothing() {
    let target = Repository::in_memory().unwrap();
    let stream = "SVN-fs-dump-format-version: 2

Revision-number: 1

Node-path: a
Node-kind: dir
Node-action: add

Revision-number: 2

Node-path: a/f
Node-kind: file
Node-action: add
Text-content-length: 2
Content-length: 2

hi

Revision-number: 3
no colon here

";
    let err = load_dump(&target, stream.as_bytes(), &LoadOptions::default(), None).unwrap_err();
    assert!(matches!(err, FsError::MalformedStream(_)), "got {:?}", err);
    assert_eq!(target.youngest_revision().unwrap(), 0);
    assert_eq!(target.check_path(0, "a").unwrap(), None);
}

/// Reader that raises a cancel flag once `limit` bytes have been read
struct CancelAfter<R> {
    inner: R,
    read: usize,
    limit: usize,
    cancel: CancelFlag,
}

impl<R: Read> Read for CancelAfter<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.read += n;
        if self.read >= self.limit {
            self.cancel.cancel();
        }
        Ok(n)
    }
}

#[test]
fn test_cancel_after_replayed_revisions_loads_nothing() {
    let source = Repository::in_memory().unwrap();
    build_history(&source);
    let dump = dump_all(&source, &DumpOptions::default());
    let text = String::from_utf8_lossy(&dump).into_owned();
    let limit = text.find("Revision-number: 10\n").unwrap();

    let target = Repository::in_memory().unwrap();
    let cancel = CancelFlag::new();
    let reader = CancelAfter {
        inner: &dump[..],
        read: 0,
        limit,
        cancel: cancel.clone(),
    };
    let err = load_dump(
        &target,
        BufReader::with_capacity(64, reader),
        &LoadOptions::default(),
        Some(&cancel),
    )
    .unwrap_err();
    assert!(matches!(err, FsError::Cancelled), "got {:?}", err);
    assert_eq!(target.youngest_revision().unwrap(), 0);
    assert_eq!(target.check_path(0, "trunk").unwrap(), None);
}

//! Load a dump stream into a repository
//!
//! The import runs on the blocking thread pool; the repository and the
//! dump parser are both synchronous.

use anyhow::{Context, Result};
use revfs_core::{load_dump, CancelFlag, LoadOptions, LoadStats, Repository};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use tokio::task;

/// Where the dump stream comes from; `None` reads stdin
pub async fn load_repository(
    repo: Repository,
    input: Option<PathBuf>,
    options: LoadOptions,
    cancel: CancelFlag,
) -> Result<LoadStats> {
    task::spawn_blocking(move || load_blocking(&repo, input, &options, &cancel))
        .await
        .map_err(|e| anyhow::anyhow!("Load task failed: {:?}", e))?
}

fn load_blocking(
    repo: &Repository,
    input: Option<PathBuf>,
    options: &LoadOptions,
    cancel: &CancelFlag,
) -> Result<LoadStats> {
    let result = match input {
        Some(path) => {
            let file = File::open(&path).with_context(|| format!("cannot open {}", path.display()))?;
            load_dump(repo, BufReader::new(file), options, Some(cancel))
        }
        None => load_dump(repo, io::stdin().lock(), options, Some(cancel)),
    };

    match result {
        Ok(stats) => {
            eprintln!("Load complete!");
            eprintln!("  Revisions loaded: {}", stats.revisions_loaded);
            eprintln!("  Nodes loaded: {}", stats.nodes_loaded);
            eprintln!("  Text bytes: {}", stats.bytes_loaded);
            if let (Some(first), Some(last)) = (stats.first_revision, stats.last_revision) {
                eprintln!("  Revisions: r{} to r{}", first, last);
            }
            Ok(stats)
        }
        Err(e) => {
            eprintln!(
                "Load failed; nothing was committed, the repository is still at r{}",
                repo.youngest_revision()?
            );
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let dump_path = dir.path().join("repo.dump");
        let mut file = File::create(&dump_path).unwrap();
        file.write_all(
            b"SVN-fs-dump-format-version: 2\n\nRevision-number: 1\n\n\
Node-path: trunk\nNode-kind: dir\nNode-action: add\n\n",
        )
        .unwrap();
        drop(file);

        let repo = Repository::create(&dir.path().join("repo")).unwrap();
        let stats = load_repository(repo.clone(), Some(dump_path), LoadOptions::default(), CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(stats.revisions_loaded, 1);
        assert_eq!(repo.youngest_revision().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_dump_file() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::create(&dir.path().join("repo")).unwrap();
        let result = load_repository(
            repo,
            Some(dir.path().join("absent.dump")),
            LoadOptions::default(),
            CancelFlag::new(),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_failed_load_commits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let dump_path = dir.path().join("broken.dump");
        std::fs::write(
            &dump_path,
            b"SVN-fs-dump-format-version: 2\n\nRevision-number: 1\n\n\
Node-path: trunk\nNode-kind: dir\nNode-action: add\n\n\
Revision-number: 2\n\nNode-path: trunk\nNode-action: sideways\n\n",
        )
        .unwrap();

        let repo = Repository::create(&dir.path().join("repo")).unwrap();
        let result = load_repository(repo.clone(), Some(dump_path), LoadOptions::default(), CancelFlag::new()).await;
        assert!(result.is_err());
        assert_eq!(repo.youngest_revision().unwrap(), 0);
    }
}

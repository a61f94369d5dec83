//! Dump a repository to a file or stdout

use anyhow::{Context, Result};
use revfs_core::{dump_repository, CancelFlag, DumpOptions, DumpStats, Repository};
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::PathBuf;
use tokio::task;

/// Write the dump to `output`, or stdout when `None`
pub async fn dump_to(
    repo: Repository,
    output: Option<PathBuf>,
    options: DumpOptions,
    cancel: CancelFlag,
) -> Result<DumpStats> {
    task::spawn_blocking(move || -> Result<DumpStats> {
        let stats = match output {
            Some(path) => {
                let file = File::create(&path).with_context(|| format!("cannot create {}", path.display()))?;
                dump_repository(&repo, &mut BufWriter::new(file), &options, Some(&cancel))?
            }
            None => {
                let stdout = io::stdout();
                dump_repository(&repo, &mut BufWriter::new(stdout.lock()), &options, Some(&cancel))?
            }
        };
        eprintln!(
            "* Dumped {} revisions ({} node records, {} text bytes)",
            stats.revisions, stats.nodes, stats.text_bytes
        );
        Ok(stats)
    })
    .await
    .map_err(|e| anyhow::anyhow!("Dump task failed: {:?}", e))?
}

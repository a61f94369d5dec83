//! Verify repository integrity

use anyhow::{anyhow, Result};
use revfs_core::{CancelFlag, Repository};
use tokio::task;

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub revisions: u64,
    pub files: u64,
    pub errors: u64,
    pub warnings: u64,
}

/// Reconstruct every file of `start..=end` and check ids and checksums
pub async fn verify_repository(
    repo: Repository,
    start: Option<u64>,
    end: Option<u64>,
    quiet: bool,
    cancel: CancelFlag,
) -> Result<VerifyReport> {
    task::spawn_blocking(move || verify_blocking(&repo, start, end, quiet, &cancel))
        .await
        .map_err(|e| anyhow!("Verify task failed: {:?}", e))?
}

fn verify_blocking(
    repo: &Repository,
    start: Option<u64>,
    end: Option<u64>,
    quiet: bool,
    cancel: &CancelFlag,
) -> Result<VerifyReport> {
    let head = repo.youngest_revision()?;
    let start = start.unwrap_or(0);
    let end = end.unwrap_or(head).min(head);

    if !quiet {
        println!("Verifying revisions {} to {}", start, end);
    }

    let mut report = VerifyReport::default();
    for rev in start..=end {
        cancel.check()?;
        match repo.revision(rev) {
            Ok(revision) => {
                if rev > 0 && revision.date().is_none() {
                    report.warnings += 1;
                    if !quiet {
                        eprintln!("  WARNING: r{} has no svn:date", rev);
                    }
                }
            }
            Err(e) => {
                report.errors += 1;
                eprintln!("  ERROR: r{}: {}", rev, e);
                continue;
            }
        }
        match repo.verify_revision(rev) {
            Ok(files) => {
                report.files += files as u64;
                report.revisions += 1;
                if !quiet {
                    println!("* Verified revision {}.", rev);
                }
            }
            Err(e) => {
                report.errors += 1;
                eprintln!("  ERROR: r{}: {}", rev, e);
            }
        }
    }

    if !quiet {
        println!();
        println!("Verification complete:");
        println!("  Revisions verified: {}", report.revisions);
        println!("  Files verified: {}", report.files);
        println!("  Errors: {}", report.errors);
        println!("  Warnings: {}", report.warnings);
    }

    if report.errors > 0 {
        return Err(anyhow!("verification failed with {} errors", report.errors));
    }
    Ok(report)
}

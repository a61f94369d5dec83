//! RevFS Administration CLI

mod dump;
mod load;
mod verify;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use revfs_core::{
    svn_props, CancelFlag, ChangeAction, CommitOutcome, DumpOptions, LoadOptions, NodeKind,
    Repository, RepositoryConfig, Transaction, UuidAction,
};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "revfs-admin")]
#[command(author = "RevFS Contributors")]
#[command(version = "0.1.0")]
#[command(about = "RevFS repository administration and dump file tool")]
struct Cli {
    /// Log at debug level
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new repository
    Create {
        path: PathBuf,
        /// Longest delta chain before a full text is stored (0 = always full)
        #[arg(long)]
        max_delta_chain: Option<u32>,
        /// Allow revision properties to be changed after commit
        #[arg(long)]
        allow_revprop_changes: bool,
    },

    /// Print the youngest revision number
    Youngest { repo: PathBuf },

    /// Dump revisions to a dump stream
    Dump {
        repo: PathBuf,
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(short, long)]
        start: Option<u64>,
        #[arg(short, long)]
        end: Option<u64>,
        /// Dump the first revision as a change instead of a full tree
        #[arg(long)]
        incremental: bool,
        /// Leave file texts out
        #[arg(long)]
        omit_text: bool,
        #[arg(long, default_value_t = 2)]
        format_version: u32,
    },

    /// Load a dump stream into a repository
    Load {
        repo: PathBuf,
        /// Dump file ("-" or omitted reads stdin)
        #[arg(short, long)]
        file: Option<String>,
        /// Never take the dump's UUID
        #[arg(long, conflicts_with = "force_uuid")]
        ignore_uuid: bool,
        /// Always take the dump's UUID
        #[arg(long)]
        force_uuid: bool,
        /// Keep commit times instead of dumped svn:date values
        #[arg(long)]
        ignore_dates: bool,
        /// Print load statistics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Verify stored data
    Verify {
        repo: PathBuf,
        #[arg(short, long)]
        start: Option<u64>,
        #[arg(short, long)]
        end: Option<u64>,
        #[arg(short, long)]
        quiet: bool,
    },

    /// Show revision logs
    Log {
        repo: PathBuf,
        #[arg(short, long)]
        start: Option<u64>,
        #[arg(short, long)]
        end: Option<u64>,
        /// List changed paths
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print a file
    Cat {
        repo: PathBuf,
        path: String,
        #[arg(short, long)]
        revision: Option<u64>,
    },

    /// List a directory
    Ls {
        repo: PathBuf,
        #[arg(default_value = "")]
        path: String,
        #[arg(short, long)]
        revision: Option<u64>,
    },

    /// List node properties
    Proplist {
        repo: PathBuf,
        #[arg(default_value = "")]
        path: String,
        #[arg(short, long)]
        revision: Option<u64>,
    },

    /// Read or change revision properties
    Revprop {
        #[command(subcommand)]
        command: RevpropCommand,
    },

    /// Create a directory in a new revision
    Mkdir {
        repo: PathBuf,
        path: String,
        #[arg(short, long)]
        message: Option<String>,
        #[arg(long)]
        author: Option<String>,
    },

    /// Store a file in a new revision
    Put {
        repo: PathBuf,
        path: String,
        /// Local file to read ("-" or omitted reads stdin)
        #[arg(short, long)]
        file: Option<String>,
        #[arg(short, long)]
        message: Option<String>,
        #[arg(long)]
        author: Option<String>,
    },

    /// Delete a path in a new revision
    Rm {
        repo: PathBuf,
        path: String,
        #[arg(short, long)]
        message: Option<String>,
        #[arg(long)]
        author: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum RevpropCommand {
    Get {
        repo: PathBuf,
        revision: u64,
        name: String,
    },
    Set {
        repo: PathBuf,
        revision: u64,
        name: String,
        /// New value; omit to delete the property
        value: Option<String>,
    },
}

fn open_repo(path: &Path) -> Result<Repository> {
    Repository::open(path).with_context(|| format!("cannot open repository at {}", path.display()))
}

fn short_action(action: ChangeAction) -> char {
    match action {
        ChangeAction::Add => 'A',
        ChangeAction::Delete => 'D',
        ChangeAction::Modify => 'M',
        ChangeAction::Replace => 'R',
    }
}

/// Open a transaction on the youngest revision, stage one edit and commit
fn commit_edit<F>(repo: &Repository, message: Option<String>, author: Option<String>, edit: F) -> Result<()>
where
    F: FnOnce(&mut Transaction) -> revfs_core::Result<()>,
{
    let mut txn = repo.begin(repo.youngest_revision()?)?;
    if let Some(message) = &message {
        txn.set_revision_property(svn_props::LOG, Some(message))?;
    }
    if let Some(author) = &author {
        txn.set_revision_property(svn_props::AUTHOR, Some(author))?;
    }
    if let Err(e) = edit(&mut txn) {
        txn.abort();
        return Err(e.into());
    }
    match txn.commit()? {
        CommitOutcome::Committed(rev) => println!("Committed revision {}.", rev),
        CommitOutcome::NoOp => println!("Nothing to commit."),
    }
    Ok(())
}

fn read_input(file: Option<&str>) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    match file {
        None | Some("-") => {
            std::io::stdin().read_to_end(&mut data)?;
        }
        Some(path) => {
            data = std::fs::read(path).with_context(|| format!("cannot read {}", path))?;
        }
    }
    Ok(data)
}

fn init_tracing(debug: bool) {
    let env_filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, stopping after the current record");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Commands::Create {
            path,
            max_delta_chain,
            allow_revprop_changes,
        } => {
            let mut config = RepositoryConfig {
                allow_revprop_changes,
                ..Default::default()
            };
            if let Some(max) = max_delta_chain {
                config.max_delta_chain = max;
            }
            let repo = Repository::create_with(&path, config)?;
            println!("Repository created at {} (UUID: {})", path.display(), repo.uuid()?);
        }

        Commands::Youngest { repo } => {
            println!("{}", open_repo(&repo)?.youngest_revision()?);
        }

        Commands::Dump {
            repo,
            output,
            start,
            end,
            incremental,
            omit_text,
            format_version,
        } => {
            let repository = open_repo(&repo)?;
            let options = DumpOptions {
                start: start.unwrap_or(0),
                end,
                incremental,
                omit_text,
                format_version,
            };
            dump::dump_to(repository, output, options, cancel).await?;
        }

        Commands::Load {
            repo,
            file,
            ignore_uuid,
            force_uuid,
            ignore_dates,
            json,
        } => {
            let repository = open_repo(&repo)?;
            let uuid_action = if ignore_uuid {
                UuidAction::Ignore
            } else if force_uuid {
                UuidAction::Force
            } else {
                UuidAction::Default
            };
            let options = LoadOptions {
                uuid_action,
                ignore_dates,
            };
            let input = file.filter(|f| f != "-").map(PathBuf::from);
            let stats = load::load_repository(repository, input, options, cancel).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
        }

        Commands::Verify {
            repo,
            start,
            end,
            quiet,
        } => {
            let repository = open_repo(&repo)?;
            verify::verify_repository(repository, start, end, quiet, cancel).await?;
        }

        Commands::Log {
            repo,
            start,
            end,
            verbose,
        } => {
            let repository = open_repo(&repo)?;
            let head = repository.youngest_revision()?;
            let start = start.unwrap_or(head);
            let end = end.unwrap_or(0);
            for revision in repository.log(start, end)? {
                println!("{}", "-".repeat(72));
                let date = revision
                    .date()
                    .map(|d| d.format("%Y-%m-%d %H:%M:%S %z").to_string())
                    .unwrap_or_else(|| "(no date)".to_string());
                let lines = revision.log().map_or(0, |log| log.lines().count());
                println!(
                    "r{} | {} | {} | {} line{}",
                    revision.number,
                    revision.author().unwrap_or("(no author)"),
                    date,
                    lines,
                    if lines == 1 { "" } else { "s" }
                );
                if verbose && !revision.changes.is_empty() {
                    println!("Changed paths:");
                    for change in &revision.changes {
                        match &change.copyfrom {
                            Some(source) => println!(
                                "   {} /{} (from /{}:{})",
                                short_action(change.action),
                                change.path,
                                source.path,
                                source.rev
                            ),
                            None => println!("   {} /{}", short_action(change.action), change.path),
                        }
                    }
                }
                println!();
                if let Some(log) = revision.log() {
                    println!("{}", log);
                }
            }
            println!("{}", "-".repeat(72));
        }

        Commands::Cat { repo, path, revision } => {
            let repository = open_repo(&repo)?;
            let rev = match revision {
                Some(rev) => rev,
                None => repository.youngest_revision()?,
            };
            let content = repository.read_file(rev, &path)?;
            use std::io::Write;
            std::io::stdout().write_all(&content)?;
        }

        Commands::Ls { repo, path, revision } => {
            let repository = open_repo(&repo)?;
            let rev = match revision {
                Some(rev) => rev,
                None => repository.youngest_revision()?,
            };
            for (name, kind) in repository.list_dir(rev, &path)? {
                match kind {
                    NodeKind::Dir => println!("{}/", name),
                    NodeKind::File => println!("{}", name),
                }
            }
        }

        Commands::Proplist { repo, path, revision } => {
            let repository = open_repo(&repo)?;
            let rev = match revision {
                Some(rev) => rev,
                None => repository.youngest_revision()?,
            };
            for (name, value) in repository.node_properties(rev, &path)? {
                println!("  {}: {}", name, value);
            }
        }

        Commands::Revprop { command } => match command {
            RevpropCommand::Get { repo, revision, name } => {
                match open_repo(&repo)?.get_revision_property(revision, &name)? {
                    Some(value) => println!("{}", value),
                    None => bail!("r{} has no property '{}'", revision, name),
                }
            }
            RevpropCommand::Set {
                repo,
                revision,
                name,
                value,
            } => {
                open_repo(&repo)?.set_revision_property(revision, &name, value.as_deref())?;
                println!("Property '{}' updated on r{}", name, revision);
            }
        },

        Commands::Mkdir {
            repo,
            path,
            message,
            author,
        } => {
            let repository = open_repo(&repo)?;
            commit_edit(&repository, message, author, |txn| txn.add_node(&path, NodeKind::Dir))?;
        }

        Commands::Put {
            repo,
            path,
            file,
            message,
            author,
        } => {
            let repository = open_repo(&repo)?;
            let content = read_input(file.as_deref())?;
            commit_edit(&repository, message, author, |txn| {
                if txn.check_path(&path)?.is_none() {
                    txn.add_node(&path, NodeKind::File)?;
                }
                txn.modify_content(&path, content)
            })?;
        }

        Commands::Rm {
            repo,
            path,
            message,
            author,
        } => {
            let repository = open_repo(&repo)?;
            commit_edit(&repository, message, author, |txn| txn.delete_node(&path))?;
        }
    }

    Ok(())
}

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use queuety::{
    config::Config,
    jobs::{self, JobSetBuilder},
    pipeline::Pipeline,
    queue::{CompletionChain, QueueMonitor, Submitter},
    remote::{OpenSshChannel, RemoteChannel},
    results::{self, ArchiveManager, ResultCollector, RetrieveSource},
    scripts::{assign_variants, ScriptRunner, TemplateSet, VariantPolicy},
    transfer::TransferEngine,
    utils::init_logger,
    Job,
};

/// QueueTY - stage, run and collect computational chemistry jobs on a cluster
#[derive(Parser, Debug)]
#[command(name = "queuety")]
#[command(version, about, long_about = None)]
struct Cli {
    /// TOML configuration file layered under the QUEUETY__* environment
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    /// Print reports as JSON
    #[arg(long = "json", global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the local job tree from the molecule list
    Stage {
        /// Molecule list (defaults to <local_root>/<list>/<list>.tsv)
        #[arg(long)]
        list: Option<PathBuf>,
    },
    /// Push the job tree to the remote temp directory
    Push,
    /// Stage the driver and job scripts and run the driver
    RunScripts,
    /// Submit every staged job to the scheduler
    Submit,
    /// Poll the scheduler until the batch drains
    Monitor {
        /// Do not run the completion chain after the drain
        #[arg(long)]
        no_chain: bool,
    },
    /// Pull result files back into the output folder
    Retrieve {
        /// Pull from the live temp directory instead of an archive
        #[arg(long, conflicts_with = "archive")]
        from_temp: bool,
        /// Archive folder name (the most recent one when omitted)
        #[arg(long)]
        archive: Option<String>,
    },
    /// Run the enabled stages end to end
    Pipeline {
        #[arg(long)]
        continue_on_failure: bool,
    },
    /// Show which archive a retrieval would use
    Locate {
        name: Option<String>,
    },
    /// Pack, unpack or delete folders under the remote directory
    Archive {
        #[command(subcommand)]
        action: ArchiveCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ArchiveCommand {
    /// Pack a folder into <name>.tar.gz (the temp directory when no name is given)
    Pack { name: Option<String> },
    /// Unpack <name>.tar.gz back into its folder (the temp directory when no name is given)
    Unpack { name: Option<String> },
    /// Delete a file or folder given relative to the remote directory
    Delete { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;
    let _guard = init_logger(&config.logging);
    info!(host = %config.cluster.host, remote = %config.paths.remote_root(), "Configuration loaded");

    match cli.command {
        Command::Stage { list } => {
            let list = list.unwrap_or_else(|| config.paths.molecule_list_path());
            let entries = jobs::read_molecule_list(&list)
                .with_context(|| format!("Failed to read {}", list.display()))?;
            let names = JobSetBuilder::new(&config.build)
                .build(&entries, &config.paths.coord_dir())
                .context("Failed to build job tree")?;
            emit(&names, cli.json, || format!("{} jobs written to {}", names.len(), config.paths.coord_dir().display()))
        }
        Command::Push => {
            let channel = connect(&config)?;
            let transfer = TransferEngine::new(channel, &config.transfer);
            let remote_temp = config.paths.remote_temp_dir();
            transfer
                .clear_remote_dir(&remote_temp)
                .await
                .context("Failed to clear the remote temp directory")?;
            let report = transfer
                .push_tree(&config.paths.coord_dir(), &remote_temp)
                .await
                .context("Push failed")?;
            emit(&report, cli.json, || report.summary())
        }
        Command::RunScripts => {
            let channel = connect(&config)?;
            let templates = TemplateSet::from_config(&config.scripts).context("Failed to load templates")?;
            let runner = ScriptRunner::new(
                channel.clone(),
                TransferEngine::new(channel, &config.transfer),
                templates,
                &config.scripts,
                &config.paths.remote_temp_dir(),
            );
            let report = runner
                .stage_and_run(&local_jobs(&config)?)
                .await
                .context("Script run failed")?;
            emit(&report, cli.json, || {
                format!(
                    "{} jobs logged, {} failed: {}",
                    report.log.jobs().len(),
                    report.failed_jobs.len(),
                    report.failed_jobs.join(", ")
                )
            })
        }
        Command::Submit => {
            let channel = connect(&config)?;
            let outcomes = Submitter::new(channel, &config.queue)
                .submit_all(&local_jobs(&config)?)
                .await;
            emit(&outcomes, cli.json, || {
                let submitted = outcomes.iter().filter(|o| o.result.is_ok()).count();
                format!("{submitted} of {} jobs submitted", outcomes.len())
            })
        }
        Command::Monitor { no_chain } => {
            let channel = connect(&config)?;
            let monitor = QueueMonitor::new(channel.clone(), &config.queue);
            if no_chain {
                let summary = monitor.wait_until_drained().await.context("Monitoring failed")?;
                emit(&summary, cli.json, || format!("Queue drained after {} polls", summary.polls))
            } else {
                let chain = CompletionChain::new(channel, &config.paths, &config.completion);
                let (summary, report) = monitor.drain_then(chain).await.context("Monitoring failed")?;
                emit(&(summary, &report), cli.json, || {
                    format!("Queue drained, completion steps run: {:?}", report.executed)
                })
            }
        }
        Command::Retrieve { from_temp, archive } => {
            let channel = connect(&config)?;
            let source = if from_temp {
                RetrieveSource::TempDir
            } else if archive.is_some() {
                RetrieveSource::Archive(archive)
            } else {
                RetrieveSource::from_config(&config.retrieve)
            };
            let collector = ResultCollector::new(
                channel.clone(),
                TransferEngine::new(channel, &config.transfer),
                &config.paths,
                &config.retrieve,
                &config.scripts.driver_script_name,
            );
            let report = collector
                .retrieve(source, &config.paths.list_folder())
                .await
                .context("Retrieval failed")?;
            emit(&report, cli.json, || {
                format!(
                    "{} from {}; look in {}",
                    report.transfers.summary(),
                    report.source,
                    report.output_dir.display()
                )
            })
        }
        Command::Pipeline { continue_on_failure } => {
            let channel = connect(&config)?;
            let mut stages = config.pipeline.clone();
            stages.continue_on_failure |= continue_on_failure;
            let report = Pipeline::new(channel, config)
                .run(&stages)
                .await
                .context("Pipeline failed")?;
            emit(&report, cli.json, || match report.halted_at {
                Some(stage) => format!("Stopped after {stage} with {} failures", report.failures.len()),
                None => format!(
                    "{} stages completed, {} failures",
                    report.completed.len(),
                    report.failures.len()
                ),
            })
        }
        Command::Locate { name } => {
            let channel = connect(&config)?;
            let archive = results::locate_archive(&channel, &config.paths.remote_root(), name.as_deref())
                .await
                .context("Failed to locate archive")?;
            emit(&archive, cli.json, || match &archive {
                Some(found) if found.compressed => found.tarball(),
                Some(found) => found.path.clone(),
                None => "No timestamped archive found".to_string(),
            })
        }
        Command::Archive { action } => {
            let manager = ArchiveManager::new(connect(&config)?, &config.paths);
            let change = match action {
                ArchiveCommand::Pack { name } => manager.pack(name.as_deref()).await,
                ArchiveCommand::Unpack { name } => manager.unpack(name.as_deref()).await,
                ArchiveCommand::Delete { name } => manager.delete(&name).await,
            }
            .context("Archive operation failed")?;
            emit(&change, cli.json, || format!("{} {}", change.path, change.action))
        }
    }
}

fn connect(config: &Config) -> anyhow::Result<Arc<dyn RemoteChannel>> {
    let channel = OpenSshChannel::new(&config.cluster).context("Invalid cluster settings")?;
    Ok(Arc::new(channel))
}

/// Jobs of the existing local tree with their script variants assigned
fn local_jobs(config: &Config) -> anyhow::Result<Vec<Job>> {
    let coord_dir = config.paths.coord_dir();
    let names = jobs::discover_job_names(&coord_dir)
        .with_context(|| format!("Failed to read job tree {}", coord_dir.display()))?;
    Ok(assign_variants(
        jobs::jobs_from_names(&names, &coord_dir, &config.paths.remote_temp_dir()),
        VariantPolicy::from_config(&config.scripts),
    ))
}

fn emit<T: Serialize>(value: &T, json: bool, summary: impl FnOnce() -> String) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", summary());
    }
    Ok(())
}

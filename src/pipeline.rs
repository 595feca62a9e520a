//! Pipeline
//!
//! Runs the enabled stages of one batch in a fixed order. Every stage is a
//! barrier: the next one starts only after the previous one has finished for
//! all jobs.
//!
//! ```text
//! build ──▶ push ──▶ run scripts ──▶ submit ──▶ monitor ──▶ retrieve
//!  (coord)  (all files   (driver +     (qsub per   (drain, then
//!            verified)    log)          job)        completion chain)
//! ```
//!
//! File-level failures are collected per stage. Unless `continue_on_failure`
//! is set, a stage that reported failures halts the run before the next stage.
//! Directory- and archive-level problems abort the run with a [`StageError`].

use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::{Config, PipelineConfig};
use crate::jobs::{self, JobSetBuilder};
use crate::models::Job;
use crate::queue::{ChainReport, CompletionChain, DrainSummary, QueueMonitor, SubmitOutcome, Submitter};
use crate::remote::RemoteChannel;
use crate::results::{ResultCollector, RetrieveReport, RetrieveSource};
use crate::scripts::{assign_variants, ScriptRunReport, ScriptRunner, TemplateSet, VariantPolicy};
use crate::transfer::{TransferEngine, TransferReport};
use crate::types::StageResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Build,
    Push,
    RunScripts,
    Submit,
    Monitor,
    Retrieve,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Build => "build",
            Stage::Push => "push",
            Stage::RunScripts => "run scripts",
            Stage::Submit => "submit",
            Stage::Monitor => "monitor",
            Stage::Retrieve => "retrieve",
        };
        f.write_str(name)
    }
}

/// One file or job that failed inside a stage
#[derive(Debug, Clone, Serialize)]
pub struct StageFailure {
    pub stage: Stage,
    pub item: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineReport {
    pub jobs: Vec<String>,
    pub completed: Vec<Stage>,
    pub failures: Vec<StageFailure>,
    /// Stage after which the run stopped because of failures
    pub halted_at: Option<Stage>,
    pub push: Option<TransferReport>,
    pub scripts: Option<ScriptRunReport>,
    pub submissions: Vec<SubmitOutcome>,
    pub drain: Option<DrainSummary>,
    pub chain: Option<ChainReport>,
    pub retrieve: Option<RetrieveReport>,
}

impl PipelineReport {
    fn fail(&mut self, stage: Stage, item: impl Into<String>, error: impl Into<String>) {
        let failure = StageFailure {
            stage,
            item: item.into(),
            error: error.into(),
        };
        warn!(stage = %failure.stage, item = %failure.item, error = %failure.error, "Stage failure");
        self.failures.push(failure);
    }

    fn failures_in(&self, stage: Stage) -> usize {
        self.failures.iter().filter(|f| f.stage == stage).count()
    }
}

pub struct Pipeline {
    channel: Arc<dyn RemoteChannel>,
    config: Config,
    builder: JobSetBuilder,
}

impl Pipeline {
    pub fn new(channel: Arc<dyn RemoteChannel>, config: Config) -> Self {
        let builder = JobSetBuilder::new(&config.build);
        Self {
            channel,
            config,
            builder,
        }
    }

    pub fn with_builder(mut self, builder: JobSetBuilder) -> Self {
        self.builder = builder;
        self
    }

    pub async fn run(&self, stages: &PipelineConfig) -> StageResult<PipelineReport> {
        let paths = &self.config.paths;
        let coord_dir = paths.coord_dir();
        let remote_temp = paths.remote_temp_dir();
        let transfer = TransferEngine::new(self.channel.clone(), &self.config.transfer);
        let mut report = PipelineReport::default();

        let needs_jobs = stages.push || stages.run_scripts || stages.submit;
        let names = if stages.build {
            let entries = jobs::read_molecule_list(&paths.molecule_list_path())?;
            let names = self.builder.build(&entries, &coord_dir)?;
            report.completed.push(Stage::Build);
            names
        } else if needs_jobs {
            jobs::discover_job_names(&coord_dir)?
        } else {
            Vec::new()
        };
        report.jobs = names.clone();

        let mut jobs: Vec<Job> = assign_variants(
            jobs::jobs_from_names(&names, &coord_dir, &remote_temp),
            VariantPolicy::from_config(&self.config.scripts),
        );

        if stages.push {
            transfer.clear_remote_dir(&remote_temp).await?;
            let pushed = transfer.push_tree(&coord_dir, &remote_temp).await?;
            for outcome in pushed.failed() {
                report.fail(
                    Stage::Push,
                    outcome.local.display().to_string(),
                    outcome.error().unwrap_or_default(),
                );
            }
            report.push = Some(pushed);
            report.completed.push(Stage::Push);
            if self.halt_after(Stage::Push, stages, &mut report) {
                return Ok(report);
            }
        }

        if stages.run_scripts {
            let templates = TemplateSet::from_config(&self.config.scripts)?;
            let runner = ScriptRunner::new(
                self.channel.clone(),
                transfer.clone(),
                templates,
                &self.config.scripts,
                &remote_temp,
            );
            let ran = runner.stage_and_run(&jobs).await?;
            for outcome in ran.staged.failed() {
                report.fail(
                    Stage::RunScripts,
                    outcome.remote.as_str(),
                    outcome.error().unwrap_or_default(),
                );
            }
            for job in &ran.failed_jobs {
                report.fail(Stage::RunScripts, job.as_str(), "preparation step failed");
            }
            let failed: HashSet<&str> = ran.failed_jobs.iter().map(String::as_str).collect();
            jobs.retain(|job| !failed.contains(job.name.as_str()));

            report.scripts = Some(ran);
            report.completed.push(Stage::RunScripts);
            if self.halt_after(Stage::RunScripts, stages, &mut report) {
                return Ok(report);
            }
        }

        if stages.submit {
            let submitter = Submitter::new(self.channel.clone(), &self.config.queue);
            let submissions = submitter.submit_all(&jobs).await;
            for outcome in &submissions {
                if let Err(e) = &outcome.result {
                    report.fail(Stage::Submit, outcome.job.as_str(), e.as_str());
                }
            }
            report.submissions = submissions;
            report.completed.push(Stage::Submit);
            if self.halt_after(Stage::Submit, stages, &mut report) {
                return Ok(report);
            }
        }

        if stages.monitor {
            let monitor = QueueMonitor::new(self.channel.clone(), &self.config.queue);
            let chain = CompletionChain::new(self.channel.clone(), paths, &self.config.completion);
            let (drain, chain) = monitor.drain_then(chain).await?;
            report.drain = Some(drain);
            report.chain = Some(chain);
            report.completed.push(Stage::Monitor);
        }

        if stages.retrieve {
            let collector = ResultCollector::new(
                self.channel.clone(),
                transfer,
                paths,
                &self.config.retrieve,
                &self.config.scripts.driver_script_name,
            );
            let retrieved = collector
                .retrieve(
                    RetrieveSource::from_config(&self.config.retrieve),
                    &paths.list_folder(),
                )
                .await?;
            for outcome in retrieved.transfers.failed() {
                report.fail(
                    Stage::Retrieve,
                    outcome.remote.as_str(),
                    outcome.error().unwrap_or_default(),
                );
            }
            report.retrieve = Some(retrieved);
            report.completed.push(Stage::Retrieve);
        }

        info!(
            completed = ?report.completed,
            failures = report.failures.len(),
            "Pipeline finished"
        );
        Ok(report)
    }

    fn halt_after(&self, stage: Stage, stages: &PipelineConfig, report: &mut PipelineReport) -> bool {
        let failures = report.failures_in(stage);
        if failures == 0 || stages.continue_on_failure {
            return false;
        }
        error!(%stage, failures, "Stopping pipeline after failed stage");
        report.halted_at = Some(stage);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuildConfig, PathsConfig, QueueConfig, TransferConfig};
    use crate::remote::fake::FakeChannel;
    use tempfile::TempDir;

    fn config(local_root: &std::path::Path) -> Config {
        Config {
            paths: PathsConfig {
                remote_directory: "/r".to_string(),
                temp_dir: "temp".to_string(),
                list_folder_name: "PFOA".to_string(),
                local_root: local_root.to_path_buf(),
                molecule_list: None,
            },
            build: BuildConfig {
                seed: 7,
                relax_iterations: 50,
            },
            transfer: TransferConfig {
                concurrency: 2,
                max_retries: 2,
                retry_delay_ms: 1,
                retry_backoff: 1.0,
            },
            queue: QueueConfig {
                poll_interval_secs: 0,
                submit_pause_ms: 0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn molecule_list(local_root: &std::path::Path) {
        let list = local_root.join("PFOA");
        std::fs::create_dir_all(&list).unwrap();
        std::fs::write(list.join("PFOA.tsv"), "CC(=O)[O-]\tacetate\nO\twater\n").unwrap();
    }

    #[tokio::test]
    async fn test_full_run_goes_through_every_stage() {
        let local = TempDir::new().unwrap();
        molecule_list(local.path());

        let fake = Arc::new(FakeChannel::new());
        fake.put_file("/r/temp/old_mol/x", b"1\n\nC 0 0 0\n");
        fake.on_command(
            "bash ",
            "/r/temp/completion.log",
            b"acetate_neg1: tx Pass\nacetate_neg1: define Pass\nacetate_neg1: cosmoprep Pass\n\
water: tx Pass\nwater: define Pass\nwater: cosmoprep Pass\n",
        );
        fake.on_command("bash ", "/r/temp/acetate_neg1/acetate_neg1.cosmo", b"cosmo");
        fake.script("bash ", 0, "");
        fake.script("cd /r/temp/", 0, "Your job 11 (\"x\") has been submitted\n");
        fake.script("qstat", 0, "");

        let pipeline = Pipeline::new(fake.clone(), config(local.path()));
        let report = pipeline.run(&PipelineConfig::default()).await.unwrap();

        assert!(report.failures.is_empty(), "{:?}", report.failures);
        assert_eq!(report.jobs, vec!["acetate_neg1", "water"]);
        assert_eq!(
            report.completed,
            vec![
                Stage::Build,
                Stage::Push,
                Stage::RunScripts,
                Stage::Submit,
                Stage::Monitor,
                Stage::Retrieve
            ]
        );
        assert_eq!(report.submissions.len(), 2);
        assert!(fake.file("/r/temp/acetate_neg1/x").is_some());
        assert!(fake.file("/r/temp/water/x").is_some());
        assert!(fake.files_under("/r/temp/old_mol").is_empty());
        assert!(local
            .path()
            .join("PFOA/TMoleX_output/acetate_neg1/acetate_neg1.cosmo")
            .exists());

        let history = fake.history();
        let position = |needle: &str| history.iter().position(|c| c.contains(needle)).unwrap();
        assert!(position("-mindepth 1") < position("copy_to /r/temp/water/x"));
        assert!(position("copy_to /r/temp/water/x") < position("bash "));
        assert!(position("bash ") < position("cd /r/temp/"));
        assert!(position("cd /r/temp/") < position("qstat"));
        assert!(position("qstat") < position("cp -r"));
    }

    #[tokio::test]
    async fn test_failed_push_halts_before_scripts() {
        let local = TempDir::new().unwrap();
        molecule_list(local.path());

        let fake = Arc::new(FakeChannel::new());
        fake.fail_copies("/r/temp/water/x", 5);

        let pipeline = Pipeline::new(fake.clone(), config(local.path()));
        let report = pipeline.run(&PipelineConfig::default()).await.unwrap();

        assert_eq!(report.halted_at, Some(Stage::Push));
        assert_eq!(report.completed, vec![Stage::Build, Stage::Push]);
        assert_eq!(report.failures.len(), 1);
        assert!(!fake.history().iter().any(|c| c.starts_with("bash ")));
    }

    #[tokio::test]
    async fn test_continue_on_failure_submits_remaining_jobs() {
        let local = TempDir::new().unwrap();
        molecule_list(local.path());

        let fake = Arc::new(FakeChannel::new());
        fake.on_command(
            "bash ",
            "/r/temp/completion.log",
            b"acetate_neg1: tx Pass\nacetate_neg1: define failed\nwater: tx Pass\n\
water: define Pass\nwater: cosmoprep Pass\n",
        );
        fake.script("bash ", 0, "");
        fake.script("cd /r/temp/", 0, "Your job 12 (\"water\") has been submitted\n");
        let stages = PipelineConfig {
            monitor: false,
            retrieve: false,
            continue_on_failure: true,
            ..Default::default()
        };

        let pipeline = Pipeline::new(fake.clone(), config(local.path()));
        let report = pipeline.run(&stages).await.unwrap();

        assert!(report.halted_at.is_none());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].item, "acetate_neg1");
        assert_eq!(report.submissions.len(), 1);
        assert_eq!(report.submissions[0].job, "water");
    }
}

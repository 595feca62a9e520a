//! Remote Script Composer
//!
//! Builds the driver script that prepares every job directory on the login
//! node, plus the per-job scripts it and the scheduler call. Composition is
//! pure text; [`ScriptRunner`] stages the result and runs it.
//!
//! ```text
//! run_tx.sh                       completion.log
//! ├─ cd <job dir>                 <job>: tx Pass
//! ├─ $chelp patch (idempotent)    <job>: define Pass
//! ├─ tx ─▶ define ─▶ cosmoprep    <job>: cosmoprep failed
//! └─ $cosmo_out rewrite           ...
//! ```
//!
//! Each step only runs when its predecessor passed, and appends its outcome
//! to the shared log. The log is the only way to learn per-job results: the
//! driver itself exits 0 regardless.

pub mod log;
pub mod templates;
pub mod variant;

pub use log::{parse_completion_log, CompletionLog, StepRecord};
pub use templates::TemplateSet;
pub use variant::{assign_variants, select_variant, VariantPolicy};

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::ScriptConfig;
use crate::models::{Job, ScriptVariant};
use crate::remote::{shell, CommandResult, RemoteChannel};
use crate::transfer::{TransferEngine, TransferOutcome, TransferReport};
use crate::types::{StageError, StageResult};

pub const DEFINE_SCRIPT: &str = "run_define.sh";
pub const COSMOPREP_SCRIPT: &str = "run_cosmoprep.sh";
pub const SUBMIT_SCRIPT: &str = "subscript";

/// Steps run per job, in order: (log name, command)
const STEPS: [(&str, &str); 3] = [
    ("tx", "tx"),
    ("define", "./run_define.sh"),
    ("cosmoprep", "./run_cosmoprep.sh"),
];

/// Settings of the driver script that are not templates
#[derive(Debug, Clone, PartialEq)]
pub struct DriverOptions {
    /// Remote path of the shared completion log
    pub log_path: String,
    pub chelp_grid: u32,
    pub cosmo_output: bool,
}

impl DriverOptions {
    pub fn new(config: &ScriptConfig, remote_temp_dir: &str) -> Self {
        Self {
            log_path: shell::join(remote_temp_dir, &config.log_file_name),
            chelp_grid: config.chelp_grid,
            cosmo_output: config.cosmo_output,
        }
    }
}

fn log_line(job: &str, step: &str, passed: bool, log: &str) -> String {
    let status = if passed { "Pass" } else { "failed" };
    format!("echo '{job}: {step} {status}' >> {log}")
}

/// Nested `if step; then ... else ... fi` chain for the remaining steps
fn write_steps(out: &mut String, job: &str, steps: &[(&str, &str)], log: &str, depth: usize) {
    let Some(((step, command), rest)) = steps.split_first() else {
        return;
    };
    let pad = "    ".repeat(depth);
    let _ = writeln!(out, "{pad}if {command}; then");
    let _ = writeln!(out, "{pad}    {}", log_line(job, step, true, log));
    write_steps(out, job, rest, log, depth + 1);
    let _ = writeln!(out, "{pad}else");
    let _ = writeln!(out, "{pad}    {}", log_line(job, step, false, log));
    let _ = writeln!(out, "{pad}fi");
}

/// Driver script for all jobs. The log is truncated at start so a rerun
/// reports only its own outcomes.
pub fn compose_driver_script(jobs: &[Job], templates: &TemplateSet, options: &DriverOptions) -> String {
    let log = shell::quote(&options.log_path);
    let mut out = templates.driver_header.clone();
    if !out.ends_with('\n') {
        out.push('\n');
    }
    let _ = writeln!(out, ": > {log}");

    for job in jobs {
        let dir = shell::quote(&job.remote_dir);
        let _ = writeln!(out, "\n# {}", job.name);
        let _ = writeln!(out, "if cd {dir}; then");
        // insert the $chelp directive once; later runs leave control unchanged
        let _ = writeln!(out, "    if ! grep -q '^\\$chelp' control 2>/dev/null; then");
        let _ = writeln!(
            out,
            "        printf '%s\\n' '$chelp' '   grid={}' >> control",
            options.chelp_grid
        );
        let _ = writeln!(out, "    fi");
        write_steps(&mut out, &job.name, &STEPS, &log, 1);
        if options.cosmo_output {
            let _ = writeln!(
                out,
                "    sed -i 's|$cosmo_out file=out.ccf|$cosmo_out file={}.cosmo|' control",
                job.name
            );
        }
        let _ = writeln!(out, "    cd - > /dev/null");
        let _ = writeln!(out, "else");
        let _ = writeln!(out, "    {}", log_line(&job.name, "cd", false, &log));
        let _ = writeln!(out, "fi");
    }
    out
}

/// `(file name, content)` of the scripts staged into a job directory
pub fn compose_job_scripts(job: &Job, templates: &TemplateSet) -> Vec<(String, String)> {
    let command = match job.variant {
        ScriptVariant::Optimize => templates::OPTIMIZE_COMMAND,
        ScriptVariant::Standard => templates::SINGLE_POINT_COMMAND,
    };
    vec![
        (
            DEFINE_SCRIPT.to_string(),
            templates.define.replace("{charge}", &job.charge.to_string()),
        ),
        (COSMOPREP_SCRIPT.to_string(), templates.cosmoprep.clone()),
        (
            SUBMIT_SCRIPT.to_string(),
            templates
                .subscript
                .replace("{mol_name}", &job.name)
                .replace("{job_command}", command),
        ),
    ]
}

/// What happened when the driver ran
#[derive(Debug, Clone, Serialize)]
pub struct ScriptRunReport {
    pub staged: TransferReport,
    pub driver: CommandResult,
    pub log: CompletionLog,
    /// Jobs that failed a step or never reached the log
    pub failed_jobs: Vec<String>,
}

/// Stages composed scripts on the cluster and runs the driver
pub struct ScriptRunner {
    channel: Arc<dyn RemoteChannel>,
    transfer: TransferEngine,
    templates: TemplateSet,
    remote_temp_dir: String,
    driver_name: String,
    options: DriverOptions,
}

impl ScriptRunner {
    pub fn new(
        channel: Arc<dyn RemoteChannel>,
        transfer: TransferEngine,
        templates: TemplateSet,
        config: &ScriptConfig,
        remote_temp_dir: &str,
    ) -> Self {
        Self {
            channel,
            transfer,
            templates,
            remote_temp_dir: remote_temp_dir.to_string(),
            driver_name: config.driver_script_name.clone(),
            options: DriverOptions::new(config, remote_temp_dir),
        }
    }

    pub fn driver_path(&self) -> String {
        shell::join(&self.remote_temp_dir, &self.driver_name)
    }

    /// Push the driver and per-job scripts, mark them executable, run the
    /// driver and read back the completion log
    pub async fn stage_and_run(&self, jobs: &[Job]) -> StageResult<ScriptRunReport> {
        if jobs.is_empty() {
            return Err(StageError::EmptyInput("no jobs to prepare".to_string()));
        }
        if !self.transfer.ensure_remote_dir(&self.remote_temp_dir).await? {
            return Err(StageError::RemoteState(format!(
                "remote directory {} does not exist",
                self.remote_temp_dir
            )));
        }

        let driver_path = self.driver_path();
        let driver = compose_driver_script(jobs, &self.templates, &self.options);
        let driver_outcome = self.transfer.push_content(driver.as_bytes(), &driver_path).await;
        if let Some(error) = driver_outcome.error() {
            return Err(StageError::RemoteState(format!(
                "driver script could not be staged: {error}"
            )));
        }

        let mut staged = TransferReport {
            outcomes: vec![driver_outcome],
        };
        let per_job: Vec<(String, String)> = jobs
            .iter()
            .flat_map(|job| {
                compose_job_scripts(job, &self.templates)
                    .into_iter()
                    .map(|(name, content)| (shell::join(&job.remote_dir, &name), content))
            })
            .collect();
        let outcomes: Vec<TransferOutcome> = stream::iter(per_job)
            .map(|(remote, content)| async move {
                self.transfer.push_content(content.as_bytes(), &remote).await
            })
            .buffer_unordered(self.transfer.concurrency())
            .collect()
            .await;
        staged.outcomes.extend(outcomes);

        for outcome in staged.outcomes.iter().filter(|o| o.is_ok()) {
            let chmod = self.channel.exec(&shell::chmod_x(&outcome.remote)).await?;
            if !chmod.success() {
                warn!(path = %outcome.remote, "chmod +x failed");
            }
        }
        if !staged.is_clean() {
            warn!(summary = %staged.summary(), "Some job scripts were not staged");
        }

        info!(driver = %driver_path, jobs = jobs.len(), "Running driver script");
        let run = self
            .channel
            .exec(&format!("bash {}", shell::quote(&driver_path)))
            .await?;
        if !run.success() {
            warn!(exit_code = run.exit_code, stderr = %run.stderr.trim(), "Driver script exited non-zero");
        }

        let log = self.fetch_log().await?;
        let mut failed_jobs: Vec<String> = log.failed_jobs().into_iter().map(str::to_string).collect();
        failed_jobs.extend(
            log.missing(jobs.iter().map(|j| j.name.as_str()))
                .into_iter()
                .map(str::to_string),
        );
        for job in &failed_jobs {
            warn!(job = %job, "Job preparation failed");
        }
        info!(
            logged = log.jobs().len(),
            failed = failed_jobs.len(),
            "Driver script finished"
        );

        Ok(ScriptRunReport {
            staged,
            driver: run,
            log,
            failed_jobs,
        })
    }

    async fn fetch_log(&self) -> StageResult<CompletionLog> {
        let local = tempfile::TempDir::new()?;
        let target = local.path().join("completion.log");
        let outcome = self.transfer.pull_file(&self.options.log_path, &target).await;
        if let Some(error) = outcome.error() {
            return Err(StageError::RemoteState(format!(
                "completion log {} could not be fetched: {error}",
                self.options.log_path
            )));
        }
        let text = tokio::fs::read_to_string(&target).await?;
        Ok(parse_completion_log(&text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferConfig;
    use crate::remote::fake::FakeChannel;

    fn options() -> DriverOptions {
        DriverOptions {
            log_path: "/r/temp/completion.log".to_string(),
            chelp_grid: 3,
            cosmo_output: true,
        }
    }

    fn jobs() -> Vec<Job> {
        vec![
            Job::new("PFOA_1_neg1", "/local", "/r/temp").with_variant(ScriptVariant::Optimize),
            Job::new("TFA_2", "/local", "/r/temp"),
        ]
    }

    #[test]
    fn test_driver_script_chains_steps_per_job() {
        let script = compose_driver_script(&jobs(), &TemplateSet::builtin(), &options());

        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains(": > /r/temp/completion.log"));
        assert!(script.contains("if cd /r/temp/PFOA_1_neg1; then"));
        assert!(script.contains("echo 'PFOA_1_neg1: tx Pass' >> /r/temp/completion.log"));
        assert!(script.contains("        if ./run_define.sh; then"));
        assert!(script.contains("            if ./run_cosmoprep.sh; then"));
        assert!(script.contains("echo 'TFA_2: cosmoprep failed' >> /r/temp/completion.log"));
        assert!(script.contains("$cosmo_out file=TFA_2.cosmo|' control"));

        let tx = script.find("if tx; then").unwrap();
        let define = script.find("if ./run_define.sh").unwrap();
        let chelp = script.find("grep -q '^\\$chelp' control").unwrap();
        assert!(chelp < tx && tx < define);
    }

    #[test]
    fn test_chelp_patch_is_guarded() {
        let script = compose_driver_script(&jobs(), &TemplateSet::builtin(), &options());
        let patches = script.matches("printf '%s\\n' '$chelp' '   grid=3' >> control").count();
        let guards = script.matches("if ! grep -q '^\\$chelp' control").count();
        assert_eq!(patches, 2);
        assert_eq!(guards, 2);
    }

    #[test]
    fn test_cosmo_rewrite_is_optional() {
        let mut options = options();
        options.cosmo_output = false;
        let script = compose_driver_script(&jobs(), &TemplateSet::builtin(), &options);
        assert!(!script.contains("$cosmo_out"));
    }

    #[test]
    fn test_job_scripts_follow_variant() {
        let jobs = jobs();
        let templates = TemplateSet::builtin();

        let optimize = compose_job_scripts(&jobs[0], &templates);
        assert_eq!(optimize[0].0, DEFINE_SCRIPT);
        assert!(optimize[0].1.contains("eht\n\n-1\n"));
        assert!(optimize[2].1.contains("#$ -N PFOA_1_neg1"));
        assert!(optimize[2].1.contains("jobex -c 400 -ri > job.out"));

        let standard = compose_job_scripts(&jobs[1], &templates);
        assert!(standard[0].1.contains("eht\n\n0\n"));
        assert!(standard[2].1.contains("ridft > job.out"));
        assert!(!standard[2].1.contains("{mol_name}"));
    }

    #[tokio::test]
    async fn test_stage_and_run_reads_the_log() {
        let fake = Arc::new(FakeChannel::new());
        fake.put_dir("/r/temp/PFOA_1_neg1");
        fake.put_dir("/r/temp/TFA_2");
        fake.script("bash ", 0, "");
        fake.put_file(
            "/r/temp/completion.log",
            b"PFOA_1_neg1: tx Pass\nPFOA_1_neg1: define Pass\nPFOA_1_neg1: cosmoprep Pass\n",
        );

        let transfer = TransferEngine::new(
            fake.clone(),
            &TransferConfig {
                concurrency: 2,
                max_retries: 2,
                retry_delay_ms: 1,
                retry_backoff: 1.0,
            },
        );
        let runner = ScriptRunner::new(
            fake.clone(),
            transfer,
            TemplateSet::builtin(),
            &ScriptConfig::default(),
            "/r/temp",
        );

        let report = runner.stage_and_run(&jobs()).await.unwrap();
        assert!(report.staged.is_clean());
        assert_eq!(report.staged.outcomes.len(), 7);
        assert_eq!(report.failed_jobs, vec!["TFA_2".to_string()]);
        assert!(fake.file("/r/temp/TFA_2/subscript").is_some());
        assert!(fake.file("/r/temp/run_tx.sh").is_some());

        let history = fake.history();
        let run = history.iter().position(|c| c == "bash /r/temp/run_tx.sh").unwrap();
        let chmod = history
            .iter()
            .position(|c| c == "chmod +x /r/temp/run_tx.sh")
            .unwrap();
        assert!(chmod < run);
    }
}

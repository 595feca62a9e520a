// Scheduler submission

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::QueueConfig;
use crate::models::Job;
use crate::remote::{shell, RemoteChannel};
use crate::scripts::SUBMIT_SCRIPT;

/// Scheduler id of a submitted job, or why submission failed
#[derive(Debug, Clone, Serialize)]
pub struct SubmitOutcome {
    pub job: String,
    pub result: Result<String, String>,
}

pub struct Submitter {
    channel: Arc<dyn RemoteChannel>,
    config: QueueConfig,
}

impl Submitter {
    pub fn new(channel: Arc<dyn RemoteChannel>, config: &QueueConfig) -> Self {
        Self {
            channel,
            config: config.clone(),
        }
    }

    pub fn submit_command(&self, job: &Job) -> String {
        format!(
            "cd {} && {} {}",
            shell::quote(&job.remote_dir),
            self.config.submit_command,
            SUBMIT_SCRIPT
        )
    }

    /// Submit every job's `subscript` from inside its directory. Best effort:
    /// a failed submission is recorded and the next job is tried.
    pub async fn submit_all(&self, jobs: &[Job]) -> Vec<SubmitOutcome> {
        let pause = Duration::from_millis(self.config.submit_pause_ms);
        let mut outcomes = Vec::with_capacity(jobs.len());

        for (i, job) in jobs.iter().enumerate() {
            if i > 0 && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }

            let result = match self.channel.exec(&self.submit_command(job)).await {
                Ok(output) if output.success() => Ok(parse_job_id(&output.stdout)),
                Ok(output) => Err(format!(
                    "{} exited with {}: {}",
                    self.config.submit_command,
                    output.exit_code,
                    output.combined_output().trim()
                )),
                Err(e) => Err(e.to_string()),
            };

            match &result {
                Ok(id) => info!(job = %job.name, scheduler_id = %id, "Submitted"),
                Err(e) => warn!(job = %job.name, error = %e, "Submission failed"),
            }
            outcomes.push(SubmitOutcome {
                job: job.name.clone(),
                result,
            });
        }
        outcomes
    }
}

/// First numeric token of the scheduler's reply (`Your job 4711 (...)`,
/// `4711.headnode`); the trimmed reply when there is none
pub fn parse_job_id(stdout: &str) -> String {
    stdout
        .split_whitespace()
        .find_map(|token| {
            let digits: String = token.chars().take_while(|c| c.is_ascii_digit()).collect();
            (!digits.is_empty()).then_some(digits)
        })
        .unwrap_or_else(|| stdout.trim().to_string())
}

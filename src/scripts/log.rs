// Completion log written by the driver script

use serde::{Deserialize, Serialize};

/// One `"<job>: <step> Pass|failed"` line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub job: String,
    pub step: String,
    pub passed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionLog {
    pub records: Vec<StepRecord>,
}

impl CompletionLog {
    /// Jobs in order of first appearance
    pub fn jobs(&self) -> Vec<&str> {
        let mut jobs: Vec<&str> = Vec::new();
        for record in &self.records {
            if !jobs.contains(&record.job.as_str()) {
                jobs.push(&record.job);
            }
        }
        jobs
    }

    /// Outcome of a step, or `None` when it never ran. A later line for the
    /// same step wins.
    pub fn passed(&self, job: &str, step: &str) -> Option<bool> {
        self.records
            .iter()
            .rev()
            .find(|r| r.job == job && r.step == step)
            .map(|r| r.passed)
    }

    /// Jobs with at least one failed step
    pub fn failed_jobs(&self) -> Vec<&str> {
        self.jobs()
            .into_iter()
            .filter(|job| self.records.iter().any(|r| r.job == *job && !r.passed))
            .collect()
    }

    /// Expected jobs that never wrote a line
    pub fn missing<'a>(&self, expected: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
        let seen = self.jobs();
        expected.into_iter().filter(|job| !seen.contains(job)).collect()
    }
}

/// Parse the shared log; lines that do not match the pattern are ignored
pub fn parse_completion_log(text: &str) -> CompletionLog {
    let records = text
        .lines()
        .filter_map(|line| {
            let (head, status) = line.trim().rsplit_once(' ')?;
            let passed = match status {
                "Pass" => true,
                "failed" => false,
                _ => return None,
            };
            let (job, step) = head.split_once(": ")?;
            if job.is_empty() || step.trim().is_empty() {
                return None;
            }
            Some(StepRecord {
                job: job.to_string(),
                step: step.trim().to_string(),
                passed,
            })
        })
        .collect();
    CompletionLog { records }
}

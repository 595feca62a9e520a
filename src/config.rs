use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::RetryPolicy;

/// Immutable run configuration.
///
/// Built once from defaults, an optional TOML file and `QUEUETY__*`
/// environment variables (`QUEUETY__CLUSTER__HOST`, `QUEUETY__TRANSFER__CONCURRENCY`, ...)
/// and handed to each component's constructor.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cluster: ClusterConfig,
    pub paths: PathsConfig,
    pub build: BuildConfig,
    pub transfer: TransferConfig,
    pub scripts: ScriptConfig,
    pub queue: QueueConfig,
    pub completion: CompletionConfig,
    pub retrieve: RetrieveConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Private key passed to `ssh -i`; agent or default keys are used when unset
    pub identity_file: Option<PathBuf>,
    pub ssh_program: String,
    pub scp_program: String,
    /// Run scp with `-O` so remote paths go through the remote shell
    /// and are quoted for it; SFTP mode takes them verbatim
    pub scp_legacy_protocol: bool,
    /// Upper bound on simultaneously open ssh/scp channels
    pub max_sessions: usize,
    pub connect_timeout_secs: u64,
    pub extra_options: Vec<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            user: String::new(),
            identity_file: None,
            ssh_program: "ssh".to_string(),
            scp_program: "scp".to_string(),
            scp_legacy_protocol: true,
            max_sessions: 8,
            connect_timeout_secs: 20,
            extra_options: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Remote root holding the temp dir and the timestamped archives
    pub remote_directory: String,
    pub temp_dir: String,
    /// Batch name; also the prefix of timestamped archive folders
    pub list_folder_name: String,
    pub local_root: PathBuf,
    /// Molecule list; defaults to `<local_root>/<list>/<list>.tsv`
    pub molecule_list: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            remote_directory: "turbomol".to_string(),
            temp_dir: "temp_tmole_dir".to_string(),
            list_folder_name: "batch".to_string(),
            local_root: PathBuf::from("."),
            molecule_list: None,
        }
    }
}

impl PathsConfig {
    pub fn remote_root(&self) -> String {
        self.remote_directory.trim_end_matches('/').to_string()
    }

    pub fn remote_temp_dir(&self) -> String {
        format!("{}/{}", self.remote_root(), self.temp_dir.trim_matches('/'))
    }

    pub fn list_folder(&self) -> PathBuf {
        self.local_root.join(&self.list_folder_name)
    }

    pub fn coord_dir(&self) -> PathBuf {
        self.list_folder().join("COORD_files")
    }

    pub fn molecule_list_path(&self) -> PathBuf {
        self.molecule_list
            .clone()
            .unwrap_or_else(|| self.list_folder().join(format!("{}.tsv", self.list_folder_name)))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub seed: u64,
    pub relax_iterations: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            relax_iterations: 400,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub concurrency: usize,
    /// Total attempts per file, verification mismatches included
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Multiplier on the delay after each failed attempt
    pub retry_backoff: f64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_retries: 3,
            retry_delay_ms: 1000,
            retry_backoff: 2.0,
        }
    }
}

impl TransferConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_delay_ms))
            .with_backoff(self.retry_backoff)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    /// Directory with `driver_header.sh`, `define.sh`, `cosmoprep.sh` and
    /// `subscript.sh`; built-in templates are used when unset
    pub template_dir: Option<PathBuf>,
    pub driver_script_name: String,
    pub log_file_name: String,
    /// Percentage (0-100) or literal count of jobs per group that get the
    /// optimize variant
    pub optimize_amount: f64,
    pub use_percent: bool,
    /// Rewrite `$cosmo_out file=out.ccf` so each job writes `<job>.cosmo`
    pub cosmo_output: bool,
    pub chelp_grid: u32,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            template_dir: None,
            driver_script_name: "run_tx.sh".to_string(),
            log_file_name: "completion.log".to_string(),
            optimize_amount: 0.0,
            use_percent: true,
            cosmo_output: true,
            chelp_grid: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub status_command: String,
    pub submit_command: String,
    /// Zero-based whitespace column holding the job-state token
    pub state_column: usize,
    pub header_lines: usize,
    pub poll_interval_secs: u64,
    pub submit_pause_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            status_command: "qstat".to_string(),
            submit_command: "qsub".to_string(),
            state_column: 4,
            header_lines: 2,
            poll_interval_secs: 120,
            submit_pause_ms: 500,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    pub cleanup_temp_dir: bool,
    /// File names kept by the cleanup step
    pub keep_files: Vec<String>,
    /// Wildcard kept by the cleanup step, e.g. `*.cosmo`
    pub keep_pattern: Option<String>,
    pub copy_to_timestamped_folder: bool,
    pub gzip_timestamped_folder: bool,
    pub delete_temp_dir_contents: bool,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            cleanup_temp_dir: false,
            keep_files: vec!["control".to_string(), "job.out".to_string()],
            keep_pattern: Some("*.cosmo".to_string()),
            copy_to_timestamped_folder: true,
            gzip_timestamped_folder: false,
            delete_temp_dir_contents: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrieveConfig {
    pub pull_from_timestamped_folder: bool,
    /// Explicit archive name; the most recent one is used when unset
    pub timestamp_folder: Option<String>,
    /// Only pull files with this extension, e.g. `.cosmo`
    pub only_extension: Option<String>,
    pub output_folder_name: String,
}

impl Default for RetrieveConfig {
    fn default() -> Self {
        Self {
            pull_from_timestamped_folder: true,
            timestamp_folder: None,
            only_extension: Some(".cosmo".to_string()),
            output_folder_name: "TMoleX_output".to_string(),
        }
    }
}

/// Stages run by the `pipeline` command
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub build: bool,
    pub push: bool,
    pub run_scripts: bool,
    pub submit: bool,
    pub monitor: bool,
    pub retrieve: bool,
    /// Go on with the next stage although file-level failures were reported
    pub continue_on_failure: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            build: true,
            push: true,
            run_scripts: true,
            submit: true,
            monitor: true,
            retrieve: true,
            continue_on_failure: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
    /// Also write a daily rolling log file into this directory
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "queuety=info".to_string(),
            directory: None,
        }
    }
}

impl Config {
    /// Load `.env`, then layer the optional file and the environment over the defaults
    pub fn load(file: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("QUEUETY")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("completion.keep_files")
                .with_list_parse_key("cluster.extra_options"),
        );

        let config: Config = builder
            .build()
            .context("Failed to read configuration sources")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=16).contains(&self.transfer.concurrency) {
            anyhow::bail!(
                "transfer.concurrency must be between 1 and 16, got {}",
                self.transfer.concurrency
            );
        }
        if self.transfer.max_retries == 0 {
            anyhow::bail!("transfer.max_retries must be at least 1");
        }
        if self.transfer.retry_backoff < 1.0 {
            anyhow::bail!(
                "transfer.retry_backoff must be at least 1.0, got {}",
                self.transfer.retry_backoff
            );
        }
        if self.cluster.max_sessions == 0 {
            anyhow::bail!("cluster.max_sessions must be at least 1");
        }
        if self.scripts.use_percent && !(0.0..=100.0).contains(&self.scripts.optimize_amount) {
            anyhow::bail!(
                "scripts.optimize_amount must be a percentage, got {}",
                self.scripts.optimize_amount
            );
        }
        if self.scripts.optimize_amount < 0.0 {
            anyhow::bail!("scripts.optimize_amount must not be negative");
        }
        Ok(())
    }
}

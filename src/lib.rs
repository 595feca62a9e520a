// QueueTY - Remote batch orchestration for computational chemistry jobs

pub mod config;
pub mod jobs;      // Molecule list → local job tree with coordinate files
pub mod models;
pub mod pipeline;
pub mod queue;     // Submission, scheduler polling and the completion chain
pub mod remote;    // ssh/scp channel and shell command builders
pub mod results;
pub mod scripts;
pub mod transfer;
pub mod types;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use models::{Archive, Job, JobState, ScriptVariant};
pub use pipeline::{Pipeline, PipelineReport};
pub use remote::{CommandResult, OpenSshChannel, RemoteChannel};
pub use types::{StageError, StageResult};

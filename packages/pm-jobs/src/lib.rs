mod enqueue;
mod runner;

pub use enqueue::{EnqueueJob, EnqueueResult, enqueue};
pub use runner::{QueueConfig, Runner};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use pm_storage::models::Job;

/// How a handler reports its outcome. Transient failures (network, 5xx,
/// deadlocks) retry with backoff; deterministic failures dead-letter the job
/// for operator attention.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
	#[error("retryable: {0}")]
	Retry(String),
	#[error("fatal: {0}")]
	Fatal(String),
}

impl JobError {
	pub fn retry(message: impl Into<String>) -> Self {
		Self::Retry(message.into())
	}

	pub fn fatal(message: impl Into<String>) -> Self {
		Self::Fatal(message.into())
	}
}

impl From<pm_storage::Error> for JobError {
	fn from(err: pm_storage::Error) -> Self {
		if err.is_transient() {
			Self::Retry(err.to_string())
		} else {
			Self::Fatal(err.to_string())
		}
	}
}

pub type JobResult = Result<(), JobError>;

/// A queue handler. Must be idempotent: rerunning after a partial crash has
/// to converge to the same final state. The cancellation token fires on
/// runner shutdown; handlers commit atomically or not at all.
#[async_trait]
pub trait JobHandler
where
	Self: Send + Sync,
{
	async fn run(&self, job: &Job, cancel: &CancellationToken) -> JobResult;
}

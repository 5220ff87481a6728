use std::{
	sync::Arc,
	time::{Duration, Instant},
};

use sqlx::PgPool;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use pm_domain::backoff::RetryPolicy;
use pm_storage::{Result, db::Db, models::Job};

use crate::{JobError, JobHandler};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const LEASE_GRACE: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct QueueConfig {
	pub name: String,
	pub concurrency: u32,
	pub retry: RetryPolicy,
	pub deadline: Duration,
}

struct QueueEntry {
	cfg: QueueConfig,
	handler: Arc<dyn JobHandler>,
}

/// Named durable queues over the `jobs` table with at-least-once delivery.
/// Claims take a lease (`available_at` pushed past the deadline) so a
/// crashed worker's jobs become claimable again; execution within a queue is
/// concurrent, not FIFO.
pub struct Runner {
	db: Arc<Db>,
	queues: Vec<QueueEntry>,
	cancel: CancellationToken,
}

impl Runner {
	pub fn new(db: Arc<Db>) -> Self {
		Self { db, queues: Vec::new(), cancel: CancellationToken::new() }
	}

	pub fn register(&mut self, cfg: QueueConfig, handler: Arc<dyn JobHandler>) {
		self.queues.push(QueueEntry { cfg, handler });
	}

	pub fn cancel_token(&self) -> CancellationToken {
		self.cancel.clone()
	}

	/// Runs every registered queue until the cancel token fires, then waits
	/// for in-flight handlers to finish.
	pub async fn run(self) {
		let mut workers = Vec::new();

		for entry in self.queues {
			let db = Arc::clone(&self.db);
			let cancel = self.cancel.clone();

			workers.push(tokio::spawn(run_queue(db, entry, cancel)));
		}

		for worker in workers {
			if let Err(err) = worker.await {
				error!(error = %err, "Queue worker panicked.");
			}
		}
	}
}

async fn run_queue(db: Arc<Db>, entry: QueueEntry, cancel: CancellationToken) {
	let semaphore = Arc::new(Semaphore::new(entry.cfg.concurrency.max(1) as usize));
	let handler = entry.handler;
	let cfg = entry.cfg;

	info!(queue = %cfg.name, concurrency = cfg.concurrency, "Queue worker started.");

	loop {
		if cancel.is_cancelled() {
			break;
		}

		let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
			break;
		};
		let claimed = match claim_job(&db.pool, &cfg.name, cfg.deadline).await {
			Ok(job) => job,
			Err(err) => {
				warn!(queue = %cfg.name, error = %err, "Job claim failed.");

				None
			},
		};
		let Some(job) = claimed else {
			drop(permit);
			tokio::select! {
				_ = cancel.cancelled() => {},
				_ = tokio::time::sleep(POLL_INTERVAL) => {},
			}

			continue;
		};

		let db = Arc::clone(&db);
		let handler = Arc::clone(&handler);
		let cfg = cfg.clone();
		let cancel = cancel.clone();

		tokio::spawn(async move {
			let _permit = permit;

			execute_job(&db.pool, &cfg, handler.as_ref(), job, &cancel).await;
		});
	}

	// Drain: wait until every in-flight handler released its permit.
	let _ = semaphore.acquire_many(cfg.concurrency.max(1)).await;

	info!(queue = %cfg.name, "Queue worker stopped.");
}

async fn execute_job(
	pool: &PgPool,
	cfg: &QueueConfig,
	handler: &dyn JobHandler,
	job: Job,
	cancel: &CancellationToken,
) {
	let started = Instant::now();
	let outcome = tokio::select! {
		_ = cancel.cancelled() => {
			// Shutdown: hand the job back untouched.
			if let Err(err) = release_job(pool, job.job_id).await {
				error!(job_id = %job.job_id, error = %err, "Failed to release job on shutdown.");
			}

			return;
		},
		outcome = tokio::time::timeout(cfg.deadline, handler.run(&job, cancel)) => outcome,
	};
	let outcome = match outcome {
		Ok(outcome) => outcome,
		Err(_) => Err(JobError::retry(format!("Deadline of {:?} exceeded.", cfg.deadline))),
	};
	let duration_ms = started.elapsed().as_millis() as u64;
	let disposition = disposition_for(&outcome, job.attempts, job.max_attempts, &cfg.retry);

	match &disposition {
		Disposition::Succeed => {
			info!(
				job_id = %job.job_id, queue = %cfg.name, status = "succeeded",
				attempt = job.attempts, duration_ms, "Job finished.",
			);
		},
		Disposition::RetryAt(delay) => {
			warn!(
				job_id = %job.job_id, queue = %cfg.name, status = "retry-scheduled",
				attempt = job.attempts, duration_ms, delay_ms = delay.as_millis() as u64,
				error = %outcome.as_ref().err().map(ToString::to_string).unwrap_or_default(),
				"Job will retry.",
			);
		},
		Disposition::DeadLetter => {
			error!(
				job_id = %job.job_id, queue = %cfg.name, status = "failed",
				attempt = job.attempts, duration_ms,
				error = %outcome.as_ref().err().map(ToString::to_string).unwrap_or_default(),
				"Job dead-lettered.",
			);
		},
	}

	if let Err(err) = apply_disposition(pool, job.job_id, &outcome, disposition).await {
		error!(job_id = %job.job_id, error = %err, "Failed to record job outcome.");
	}
}

#[derive(Debug)]
enum Disposition {
	Succeed,
	RetryAt(Duration),
	DeadLetter,
}

/// Pure outcome-to-state decision: retryable errors back off until the
/// attempt budget runs out, then dead-letter; fatal errors dead-letter at
/// once.
fn disposition_for(
	outcome: &crate::JobResult,
	attempts: i32,
	max_attempts: i32,
	retry: &RetryPolicy,
) -> Disposition {
	match outcome {
		Ok(()) => Disposition::Succeed,
		Err(JobError::Fatal(_)) => Disposition::DeadLetter,
		Err(JobError::Retry(_)) =>
			if attempts >= max_attempts {
				Disposition::DeadLetter
			} else {
				Disposition::RetryAt(retry.delay_with_jitter(attempts.max(0) as u32))
			},
	}
}

async fn claim_job(pool: &PgPool, queue: &str, deadline: Duration) -> Result<Option<Job>> {
	let lease_secs = (deadline + LEASE_GRACE).as_secs() as i64;
	let mut tx = pool.begin().await?;
	let job = sqlx::query_as::<_, Job>(
		"SELECT job_id, queue, job_key, payload, status, attempts, max_attempts, last_error, \
		 available_at, completed_at, created_at, updated_at \
		 FROM jobs \
		 WHERE queue = $1 AND status IN ('queued', 'running') AND available_at <= now() \
		 ORDER BY available_at ASC \
		 LIMIT 1 \
		 FOR UPDATE SKIP LOCKED",
	)
	.bind(queue)
	.fetch_optional(&mut *tx)
	.await?;
	let Some(mut job) = job else {
		tx.commit().await?;

		return Ok(None);
	};

	job.attempts = job.attempts.saturating_add(1);

	sqlx::query(
		"UPDATE jobs SET status = 'running', attempts = $1, \
		 available_at = now() + make_interval(secs => $2::double precision) \
		 WHERE job_id = $3",
	)
	.bind(job.attempts)
	.bind(lease_secs as f64)
	.bind(job.job_id)
	.execute(&mut *tx)
	.await?;
	tx.commit().await?;

	Ok(Some(job))
}

async fn release_job(pool: &PgPool, job_id: Uuid) -> Result<()> {
	sqlx::query(
		"UPDATE jobs SET status = 'queued', attempts = greatest(attempts - 1, 0), \
		 available_at = now() WHERE job_id = $1 AND status = 'running'",
	)
	.bind(job_id)
	.execute(pool)
	.await?;

	Ok(())
}

async fn apply_disposition(
	pool: &PgPool,
	job_id: Uuid,
	outcome: &crate::JobResult,
	disposition: Disposition,
) -> Result<()> {
	match disposition {
		Disposition::Succeed => {
			sqlx::query(
				"UPDATE jobs SET status = 'succeeded', completed_at = now(), last_error = NULL \
				 WHERE job_id = $1",
			)
			.bind(job_id)
			.execute(pool)
			.await?;
		},
		Disposition::RetryAt(delay) => {
			sqlx::query(
				"UPDATE jobs SET status = 'queued', last_error = $1, \
				 available_at = now() + make_interval(secs => $2::double precision) \
				 WHERE job_id = $3",
			)
			.bind(outcome.as_ref().err().map(ToString::to_string))
			.bind(delay.as_secs_f64())
			.bind(job_id)
			.execute(pool)
			.await?;
		},
		Disposition::DeadLetter => {
			sqlx::query(
				"UPDATE jobs SET status = 'failed', completed_at = now(), last_error = $1 \
				 WHERE job_id = $2",
			)
			.bind(outcome.as_ref().err().map(ToString::to_string))
			.bind(job_id)
			.execute(pool)
			.await?;
		},
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn policy() -> RetryPolicy {
		RetryPolicy::new(3, 1_000, 60_000)
	}

	#[test]
	fn success_succeeds() {
		assert!(matches!(disposition_for(&Ok(()), 1, 3, &policy()), Disposition::Succeed));
	}

	#[test]
	fn fatal_dead_letters_immediately() {
		let outcome = Err(JobError::fatal("schema mismatch"));

		assert!(matches!(disposition_for(&outcome, 1, 3, &policy()), Disposition::DeadLetter));
	}

	#[test]
	fn retry_backs_off_until_attempts_run_out() {
		let outcome = Err(JobError::retry("503"));

		assert!(matches!(disposition_for(&outcome, 1, 3, &policy()), Disposition::RetryAt(_)));
		assert!(matches!(disposition_for(&outcome, 2, 3, &policy()), Disposition::RetryAt(_)));
		assert!(matches!(disposition_for(&outcome, 3, 3, &policy()), Disposition::DeadLetter));
	}

	#[test]
	fn retry_delay_grows_with_attempts() {
		let policy = policy();
		let outcome = Err(JobError::retry("timeout"));
		let Disposition::RetryAt(first) = disposition_for(&outcome, 1, 5, &policy) else {
			panic!("expected retry");
		};
		let Disposition::RetryAt(third) = disposition_for(&outcome, 3, 5, &policy) else {
			panic!("expected retry");
		};

		// ±25% jitter cannot make attempt 3 (4s base) undercut attempt 1 (1s base).
		assert!(third > first);
	}
}

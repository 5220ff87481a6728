use serde_json::Value;
use sqlx::{Postgres, Row, Transaction};
use time::Duration;
use uuid::Uuid;

use pm_storage::Result;

pub struct EnqueueJob<'a> {
	pub queue: &'a str,
	pub job_key: Option<&'a str>,
	pub payload: Value,
	pub max_attempts: i32,
	/// Completed jobs with the same `(queue, job_key)` inside this window
	/// absorb the enqueue instead of re-running.
	pub dedup_window: Duration,
}

#[derive(Clone, Copy, Debug)]
pub struct EnqueueResult {
	pub job_id: Uuid,
	pub deduped: bool,
}

/// Enqueues inside the caller's transaction so the job becomes durable with
/// the rows it refers to. Two jobs with the same `(queue, job_key)` collapse
/// to one: open jobs via the partial unique index, recently-finished ones
/// via the dedup window.
pub async fn enqueue(
	tx: &mut Transaction<'_, Postgres>,
	job: EnqueueJob<'_>,
) -> Result<EnqueueResult> {
	if let Some(job_key) = job.job_key {
		let cutoff = time::OffsetDateTime::now_utc() - job.dedup_window;
		let recent = sqlx::query(
			"SELECT job_id FROM jobs \
			 WHERE queue = $1 AND job_key = $2 AND status = 'succeeded' AND completed_at > $3 \
			 ORDER BY completed_at DESC LIMIT 1",
		)
		.bind(job.queue)
		.bind(job_key)
		.bind(cutoff)
		.fetch_optional(&mut **tx)
		.await?;

		if let Some(row) = recent {
			return Ok(EnqueueResult { job_id: row.try_get("job_id")?, deduped: true });
		}
	}

	let inserted = sqlx::query(
		"INSERT INTO jobs (job_id, queue, job_key, payload, max_attempts) \
		 VALUES ($1, $2, $3, $4, $5) \
		 ON CONFLICT (queue, job_key) \
		 WHERE job_key IS NOT NULL AND status IN ('queued', 'running') \
		 DO NOTHING \
		 RETURNING job_id",
	)
	.bind(Uuid::new_v4())
	.bind(job.queue)
	.bind(job.job_key)
	.bind(&job.payload)
	.bind(job.max_attempts)
	.fetch_optional(&mut **tx)
	.await?;

	if let Some(row) = inserted {
		return Ok(EnqueueResult { job_id: row.try_get("job_id")?, deduped: false });
	}

	// Lost the race to an open twin; hand back its id.
	let existing = sqlx::query(
		"SELECT job_id FROM jobs \
		 WHERE queue = $1 AND job_key = $2 AND status IN ('queued', 'running') LIMIT 1",
	)
	.bind(job.queue)
	.bind(job.job_key)
	.fetch_one(&mut **tx)
	.await?;

	Ok(EnqueueResult { job_id: existing.try_get("job_id")?, deduped: true })
}

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use pm_domain::backoff::RetryPolicy;
use pm_jobs::{Job, JobError, JobHandler, JobResult, QueueConfig, Runner};
use pm_storage::queries;

use crate::{
	PmService, QUEUE_COMPUTE_EMBEDDINGS, QUEUE_ENTITIES_ORGANIZE, QUEUE_EXPORT_TRAINING,
	QUEUE_NOTES_EXTRACT, QUEUE_NOTES_REPROCESS, Result,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotePayload {
	raw_note_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntityPayload {
	entity_id: Uuid,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportPayload {
	#[serde(default, with = "time::serde::rfc3339::option")]
	since: Option<OffsetDateTime>,
	#[serde(default, with = "time::serde::rfc3339::option")]
	until: Option<OffsetDateTime>,
}

fn parse_payload<T>(job: &Job) -> Result<T, JobError>
where
	T: serde::de::DeserializeOwned,
{
	serde_json::from_value(job.payload.clone())
		.map_err(|err| JobError::fatal(format!("Malformed job payload: {err}.")))
}

/// Phase A: extract one note, then materialize. The job id doubles as the
/// extraction run id so a crash-and-rerun writes the same provenance.
pub struct ExtractHandler {
	pub service: Arc<PmService>,
}

#[async_trait]
impl JobHandler for ExtractHandler {
	async fn run(&self, job: &Job, _cancel: &CancellationToken) -> JobResult {
		let payload: NotePayload = parse_payload(job)?;
		let note = queries::fetch_raw_note(&self.service.db.pool, payload.raw_note_id)
			.await
			.map_err(JobError::from)?
			.ok_or_else(|| {
				JobError::fatal(format!("Raw note {} does not exist.", payload.raw_note_id))
			})?;

		if note.processed {
			debug!(raw_note_id = %note.raw_note_id, "Note already processed; nothing to do.");

			return Ok(());
		}

		let output = self.service.run_extraction(&note).await.map_err(JobError::from)?;
		let entity_ids = self
			.service
			.apply_extraction(note.raw_note_id, &output, job.job_id)
			.await
			.map_err(JobError::from)?;

		info!(
			raw_note_id = %note.raw_note_id,
			entity_count = entity_ids.len(),
			"Extraction materialized.",
		);

		Ok(())
	}
}

/// Phase B: organize one freshly-created entity against workspace context.
pub struct OrganizeHandler {
	pub service: Arc<PmService>,
}

#[async_trait]
impl JobHandler for OrganizeHandler {
	async fn run(&self, job: &Job, _cancel: &CancellationToken) -> JobResult {
		let payload: EntityPayload = parse_payload(job)?;
		let entity = queries::fetch_entity(&self.service.db.pool, payload.entity_id)
			.await
			.map_err(JobError::from)?
			.ok_or_else(|| {
				JobError::fatal(format!("Entity {} does not exist.", payload.entity_id))
			})?;

		if entity.deleted_at.is_some() {
			debug!(entity_id = %entity.entity_id, "Entity deleted; skipping organization.");

			return Ok(());
		}

		let context =
			self.service.gather_organization_context(&entity).await.map_err(JobError::from)?;
		let output =
			self.service.run_organization(&entity, &context).await.map_err(JobError::from)?;

		self.service
			.apply_organization(entity.entity_id, &output)
			.await
			.map_err(JobError::from)?;

		Ok(())
	}
}

/// Full re-run: invalidate provenance, then extract and materialize again.
pub struct ReprocessHandler {
	pub service: Arc<PmService>,
}

#[async_trait]
impl JobHandler for ReprocessHandler {
	async fn run(&self, job: &Job, _cancel: &CancellationToken) -> JobResult {
		let payload: NotePayload = parse_payload(job)?;

		self.service
			.invalidate_note_provenance(payload.raw_note_id)
			.await
			.map_err(JobError::from)?;

		let note = queries::fetch_raw_note(&self.service.db.pool, payload.raw_note_id)
			.await
			.map_err(JobError::from)?
			.ok_or_else(|| {
				JobError::fatal(format!("Raw note {} does not exist.", payload.raw_note_id))
			})?;
		let output = self.service.run_extraction(&note).await.map_err(JobError::from)?;

		self.service
			.apply_extraction(note.raw_note_id, &output, job.job_id)
			.await
			.map_err(JobError::from)?;

		Ok(())
	}
}

/// The queue contract exists; the vector backend behind it does not yet.
/// Succeeding keeps the pipeline green without fabricating embeddings.
pub struct ComputeEmbeddingsHandler;

#[async_trait]
impl JobHandler for ComputeEmbeddingsHandler {
	async fn run(&self, job: &Job, _cancel: &CancellationToken) -> JobResult {
		let payload: EntityPayload = parse_payload(job)?;

		debug!(entity_id = %payload.entity_id, "No vector backend configured; skipping.");

		Ok(())
	}
}

pub struct ExportTrainingHandler {
	pub service: Arc<PmService>,
}

#[async_trait]
impl JobHandler for ExportTrainingHandler {
	async fn run(&self, job: &Job, _cancel: &CancellationToken) -> JobResult {
		let payload: ExportPayload = parse_payload(job)?;
		let until = payload.until.unwrap_or_else(OffsetDateTime::now_utc);
		let since = payload.since.unwrap_or(until - time::Duration::days(7));
		let export =
			self.service.export_training_data(since, until).await.map_err(JobError::from)?;

		info!(
			path = %export.path.display(),
			count = export.count,
			"Training data exported.",
		);

		Ok(())
	}
}

impl PmService {
	/// Returns a note to the extracting state: the processed flag drops and
	/// provenance on previously derived entities is cleared. Their rows and
	/// event history stay.
	pub async fn invalidate_note_provenance(&self, raw_note_id: Uuid) -> Result<()> {
		let mut tx = self.db.pool.begin().await?;

		sqlx::query(
			"UPDATE raw_notes SET processed = FALSE, processed_at = NULL WHERE raw_note_id = $1",
		)
		.bind(raw_note_id)
		.execute(&mut *tx)
		.await?;
		sqlx::query(
			"UPDATE entities SET ai_meta = NULL WHERE entity_id IN \
			 (SELECT entity_id FROM entity_sources WHERE raw_note_id = $1)",
		)
		.bind(raw_note_id)
		.execute(&mut *tx)
		.await?;
		tx.commit().await?;

		Ok(())
	}
}

/// Registers the five required queues on a runner. Concurrency and
/// deadlines come from configuration; retry backoff is shared.
pub fn register_queues(runner: &mut Runner, service: Arc<PmService>) {
	let cfg = &service.cfg.jobs;
	let retry = RetryPolicy::new(4, 1_000, 60_000);
	let default_deadline = Duration::from_secs(cfg.default_deadline_secs);
	let extract_deadline = Duration::from_secs(cfg.extract_deadline_secs);

	runner.register(
		QueueConfig {
			name: QUEUE_NOTES_EXTRACT.to_string(),
			concurrency: cfg.extract_concurrency,
			retry,
			deadline: extract_deadline,
		},
		Arc::new(ExtractHandler { service: Arc::clone(&service) }),
	);
	runner.register(
		QueueConfig {
			name: QUEUE_ENTITIES_ORGANIZE.to_string(),
			concurrency: cfg.organize_concurrency,
			retry,
			deadline: default_deadline,
		},
		Arc::new(OrganizeHandler { service: Arc::clone(&service) }),
	);
	runner.register(
		QueueConfig {
			name: QUEUE_NOTES_REPROCESS.to_string(),
			concurrency: cfg.reprocess_concurrency,
			retry,
			deadline: extract_deadline,
		},
		Arc::new(ReprocessHandler { service: Arc::clone(&service) }),
	);
	runner.register(
		QueueConfig {
			name: QUEUE_COMPUTE_EMBEDDINGS.to_string(),
			concurrency: cfg.default_concurrency,
			retry,
			deadline: default_deadline,
		},
		Arc::new(ComputeEmbeddingsHandler),
	);
	runner.register(
		QueueConfig {
			name: QUEUE_EXPORT_TRAINING.to_string(),
			concurrency: 1,
			retry,
			deadline: default_deadline,
		},
		Arc::new(ExportTrainingHandler { service }),
	);
}

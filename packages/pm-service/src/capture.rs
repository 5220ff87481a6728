use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use pm_domain::{dedupe, source::NoteSource};
use pm_jobs::{EnqueueJob, enqueue};
use pm_storage::models::RawNote;

use crate::{Error, PmService, QUEUE_NOTES_EXTRACT, Result, notes::NoteView};

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRequest {
	pub content: String,
	pub source: NoteSource,
	#[serde(default = "empty_object")]
	pub source_meta: Value,
	#[serde(default, with = "time::serde::rfc3339::option")]
	pub captured_at: Option<OffsetDateTime>,
	#[serde(default)]
	pub external_id: Option<String>,
	#[serde(default)]
	pub captured_by: Option<Uuid>,
}

fn empty_object() -> Value {
	Value::Object(serde_json::Map::new())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureResponse {
	pub note: NoteView,
	pub deduped: bool,
}

impl PmService {
	/// Idempotent capture: the first write of a `(source, externalId)` pair
	/// (or, without an external id, of a dedupe-hash) creates the note and
	/// enqueues extraction; every repeat returns the existing note with
	/// `deduped = true` and enqueues nothing.
	pub async fn capture_note(&self, req: CaptureRequest) -> Result<CaptureResponse> {
		if req.content.trim().is_empty() {
			return Err(Error::validation("content must be non-empty."));
		}
		if let Some(external_id) = req.external_id.as_deref()
			&& external_id.trim().is_empty()
		{
			return Err(Error::validation("externalId must be non-empty when provided."));
		}
		if !req.source_meta.is_object() {
			return Err(Error::validation("sourceMeta must be a JSON object."));
		}

		let captured_at = req.captured_at.unwrap_or_else(OffsetDateTime::now_utc);
		let dedupe_hash =
			dedupe::dedupe_hash(req.source.as_str(), &req.content, req.captured_by);
		let mut tx = self.db.pool.begin().await?;
		let inserted = sqlx::query_as::<_, RawNote>(
			"INSERT INTO raw_notes \
			 (raw_note_id, content, source, source_meta, external_id, captured_at, captured_by, \
			  dedupe_hash) \
			 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
			 ON CONFLICT DO NOTHING \
			 RETURNING raw_note_id, content, source, source_meta, external_id, captured_at, \
			 captured_by, processed, processed_at, dedupe_hash, created_at, updated_at",
		)
		.bind(Uuid::new_v4())
		.bind(&req.content)
		.bind(req.source.as_str())
		.bind(&req.source_meta)
		.bind(req.external_id.as_deref())
		.bind(captured_at)
		.bind(req.captured_by)
		.bind(&dedupe_hash)
		.fetch_optional(&mut *tx)
		.await?;

		let Some(note) = inserted else {
			// The losing side of the idempotency race: return the existing
			// row; the extraction job was enqueued by the first writer.
			tx.commit().await?;

			let existing = self
				.find_existing_note(req.source, req.external_id.as_deref(), &dedupe_hash)
				.await?;

			return Ok(CaptureResponse { note: existing.into(), deduped: true });
		};
		let job_key = format!("extract:{}", note.raw_note_id);

		enqueue(
			&mut tx,
			EnqueueJob {
				queue: QUEUE_NOTES_EXTRACT,
				job_key: Some(&job_key),
				payload: serde_json::json!({ "rawNoteId": note.raw_note_id }),
				max_attempts: 4,
				dedup_window: time::Duration::milliseconds(self.cfg.jobs.dedup_window_ms as i64),
			},
		)
		.await?;
		tx.commit().await?;

		Ok(CaptureResponse { note: note.into(), deduped: false })
	}

	async fn find_existing_note(
		&self,
		source: NoteSource,
		external_id: Option<&str>,
		dedupe_hash: &str,
	) -> Result<RawNote> {
		let note = match external_id {
			Some(external_id) => sqlx::query_as::<_, RawNote>(
				"SELECT raw_note_id, content, source, source_meta, external_id, captured_at, \
				 captured_by, processed, processed_at, dedupe_hash, created_at, updated_at \
				 FROM raw_notes WHERE source = $1 AND external_id = $2",
			)
			.bind(source.as_str())
			.bind(external_id)
			.fetch_optional(&self.db.pool)
			.await?,
			None => sqlx::query_as::<_, RawNote>(
				"SELECT raw_note_id, content, source, source_meta, external_id, captured_at, \
				 captured_by, processed, processed_at, dedupe_hash, created_at, updated_at \
				 FROM raw_notes WHERE dedupe_hash = $1 AND external_id IS NULL",
			)
			.bind(dedupe_hash)
			.fetch_optional(&self.db.pool)
			.await?,
		};

		note.ok_or_else(|| Error::conflict("Capture conflicted with a row that has since vanished."))
	}
}

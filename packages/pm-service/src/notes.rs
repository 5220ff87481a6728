use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use pm_domain::cursor::Cursor;
use pm_jobs::{EnqueueJob, enqueue};
use pm_storage::models::RawNote;

use crate::{Error, Page, PmService, QUEUE_NOTES_REPROCESS, Result, effective_limit, paginate};

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteView {
	pub id: Uuid,
	pub content: String,
	pub source: String,
	pub source_meta: Value,
	pub external_id: Option<String>,
	#[serde(with = "time::serde::rfc3339")]
	pub captured_at: OffsetDateTime,
	pub captured_by: Option<Uuid>,
	pub processed: bool,
	#[serde(with = "time::serde::rfc3339::option")]
	pub processed_at: Option<OffsetDateTime>,
	#[serde(with = "time::serde::rfc3339")]
	pub created_at: OffsetDateTime,
}

impl From<RawNote> for NoteView {
	fn from(note: RawNote) -> Self {
		Self {
			id: note.raw_note_id,
			content: note.content,
			source: note.source,
			source_meta: note.source_meta,
			external_id: note.external_id,
			captured_at: note.captured_at,
			captured_by: note.captured_by,
			processed: note.processed,
			processed_at: note.processed_at,
			created_at: note.created_at,
		}
	}
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListNotesRequest {
	pub limit: Option<i64>,
	pub cursor: Option<String>,
	#[serde(default, with = "time::serde::rfc3339::option")]
	pub since: Option<OffsetDateTime>,
	#[serde(default, with = "time::serde::rfc3339::option")]
	pub until: Option<OffsetDateTime>,
}

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReprocessResponse {
	pub raw_note_id: Uuid,
	pub job_id: Uuid,
	pub deduped: bool,
}

impl PmService {
	pub async fn list_notes(&self, req: ListNotesRequest) -> Result<Page<NoteView>> {
		let limit = effective_limit(req.limit)?;
		let mut builder = sqlx::QueryBuilder::new(
			"SELECT raw_note_id, content, source, source_meta, external_id, captured_at, \
			 captured_by, processed, processed_at, dedupe_hash, created_at, updated_at \
			 FROM raw_notes WHERE TRUE",
		);

		if let Some(since) = req.since {
			builder.push(" AND captured_at >= ");
			builder.push_bind(since);
		}
		if let Some(until) = req.until {
			builder.push(" AND captured_at <= ");
			builder.push_bind(until);
		}
		if let Some(raw) = req.cursor.as_deref() {
			let cursor = Cursor::decode(raw)?;
			let captured_at = cursor.timestamp()?;

			builder.push(" AND (captured_at, raw_note_id) < (");
			builder.push_bind(captured_at);
			builder.push(", ");
			builder.push_bind(cursor.id);
			builder.push(")");
		}

		builder.push(" ORDER BY captured_at DESC, raw_note_id DESC LIMIT ");
		builder.push_bind(limit + 1);

		let notes: Vec<RawNote> = builder.build_query_as().fetch_all(&self.db.pool).await?;
		let views: Vec<NoteView> = notes.into_iter().map(NoteView::from).collect();

		paginate(views, limit, |note| {
			Cursor::from_timestamp(note.captured_at, note.id).map_err(Error::from)
		})
	}

	pub async fn get_note(&self, raw_note_id: Uuid) -> Result<NoteView> {
		let note = pm_storage::queries::fetch_raw_note(&self.db.pool, raw_note_id)
			.await?
			.ok_or_else(|| Error::not_found(format!("Raw note {raw_note_id} does not exist.")))?;

		Ok(note.into())
	}

	/// Queues a full re-run of both pipeline phases for one note. The
	/// handler clears provenance before extracting again.
	pub async fn reprocess_note(&self, raw_note_id: Uuid) -> Result<ReprocessResponse> {
		let mut tx = self.db.pool.begin().await?;
		let note = pm_storage::queries::fetch_raw_note(&self.db.pool, raw_note_id)
			.await?
			.ok_or_else(|| Error::not_found(format!("Raw note {raw_note_id} does not exist.")))?;
		let job_key = format!("reprocess:{raw_note_id}");
		let queued = enqueue(
			&mut tx,
			EnqueueJob {
				queue: QUEUE_NOTES_REPROCESS,
				job_key: Some(&job_key),
				payload: serde_json::json!({ "rawNoteId": note.raw_note_id }),
				max_attempts: 4,
				dedup_window: time::Duration::milliseconds(self.cfg.jobs.dedup_window_ms as i64),
			},
		)
		.await?;

		tx.commit().await?;

		Ok(ReprocessResponse {
			raw_note_id,
			job_id: queued.job_id,
			deduped: queued.deduped,
		})
	}
}

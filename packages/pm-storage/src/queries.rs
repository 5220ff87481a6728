use serde_json::Value;
use sqlx::{PgExecutor, Postgres, Transaction};
use uuid::Uuid;

use crate::{
	Result,
	models::{Entity, EntityEvent, Epic, LineageRow, Project, RawNote, ReviewItem},
};

const ENTITY_COLUMNS: &str = "entity_id, type, content, status, project_id, epic_id, \
	parent_task_id, assignee_id, confidence, attributes, ai_meta, evidence, deleted_at, \
	created_at, updated_at";

pub async fn fetch_entity<'e>(executor: impl PgExecutor<'e>, entity_id: Uuid) -> Result<Option<Entity>> {
	let entity = sqlx::query_as::<_, Entity>(&format!(
		"SELECT {ENTITY_COLUMNS} FROM entities WHERE entity_id = $1"
	))
	.bind(entity_id)
	.fetch_optional(executor)
	.await?;

	Ok(entity)
}

pub async fn fetch_entity_for_update(
	tx: &mut Transaction<'_, Postgres>,
	entity_id: Uuid,
) -> Result<Option<Entity>> {
	let entity = sqlx::query_as::<_, Entity>(&format!(
		"SELECT {ENTITY_COLUMNS} FROM entities WHERE entity_id = $1 FOR UPDATE"
	))
	.bind(entity_id)
	.fetch_optional(&mut **tx)
	.await?;

	Ok(entity)
}

pub async fn fetch_project<'e>(
	executor: impl PgExecutor<'e>,
	project_id: Uuid,
) -> Result<Option<Project>> {
	let project = sqlx::query_as::<_, Project>(
		"SELECT project_id, name, description, status, deleted_at, created_at, updated_at \
		 FROM projects WHERE project_id = $1",
	)
	.bind(project_id)
	.fetch_optional(executor)
	.await?;

	Ok(project)
}

pub async fn fetch_epic<'e>(executor: impl PgExecutor<'e>, epic_id: Uuid) -> Result<Option<Epic>> {
	let epic = sqlx::query_as::<_, Epic>(
		"SELECT epic_id, project_id, name, description, created_by, deleted_at, created_at, \
		 updated_at FROM epics WHERE epic_id = $1",
	)
	.bind(epic_id)
	.fetch_optional(executor)
	.await?;

	Ok(epic)
}

pub async fn fetch_raw_note<'e>(
	executor: impl PgExecutor<'e>,
	raw_note_id: Uuid,
) -> Result<Option<RawNote>> {
	let note = sqlx::query_as::<_, RawNote>(
		"SELECT raw_note_id, content, source, source_meta, external_id, captured_at, captured_by, \
		 processed, processed_at, dedupe_hash, created_at, updated_at \
		 FROM raw_notes WHERE raw_note_id = $1",
	)
	.bind(raw_note_id)
	.fetch_optional(executor)
	.await?;

	Ok(note)
}

pub struct NewEntityEvent<'a> {
	pub entity_id: Uuid,
	pub event_type: &'a str,
	pub actor_user_id: Option<Uuid>,
	pub raw_note_id: Option<Uuid>,
	pub body: Option<&'a str>,
	pub old_status: Option<&'a str>,
	pub new_status: Option<&'a str>,
	pub meta: Value,
}

pub async fn insert_entity_event(
	tx: &mut Transaction<'_, Postgres>,
	event: NewEntityEvent<'_>,
) -> Result<EntityEvent> {
	let row = sqlx::query_as::<_, EntityEvent>(
		"INSERT INTO entity_events \
		 (event_id, entity_id, type, actor_user_id, raw_note_id, body, old_status, new_status, meta) \
		 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
		 RETURNING event_id, entity_id, type, actor_user_id, raw_note_id, body, old_status, \
		 new_status, meta, created_at",
	)
	.bind(Uuid::new_v4())
	.bind(event.entity_id)
	.bind(event.event_type)
	.bind(event.actor_user_id)
	.bind(event.raw_note_id)
	.bind(event.body)
	.bind(event.old_status)
	.bind(event.new_status)
	.bind(event.meta)
	.fetch_one(&mut **tx)
	.await?;

	Ok(row)
}

pub struct NewReview<'a> {
	pub entity_id: Option<Uuid>,
	pub project_id: Option<Uuid>,
	pub review_type: &'a str,
	pub ai_suggestion: Value,
	pub ai_confidence: f32,
}

/// Inserts a pending review item. Returns `None` when an equivalent pending
/// item already exists (the partial unique index absorbs the insert), which
/// is what makes materialization idempotent.
pub async fn insert_pending_review(
	tx: &mut Transaction<'_, Postgres>,
	review: NewReview<'_>,
) -> Result<Option<ReviewItem>> {
	let row = sqlx::query_as::<_, ReviewItem>(
		"INSERT INTO review_queue \
		 (review_id, entity_id, project_id, review_type, status, ai_suggestion, ai_confidence) \
		 VALUES ($1, $2, $3, $4, 'pending', $5, $6) \
		 ON CONFLICT (entity_id, review_type) \
		 WHERE status = 'pending' AND entity_id IS NOT NULL AND review_type <> 'low_confidence' \
		 DO NOTHING \
		 RETURNING review_id, entity_id, project_id, review_type, status, ai_suggestion, \
		 ai_confidence, resolved_by, resolved_at, user_resolution, training_comment, created_at, \
		 updated_at",
	)
	.bind(Uuid::new_v4())
	.bind(review.entity_id)
	.bind(review.project_id)
	.bind(review.review_type)
	.bind(review.ai_suggestion)
	.bind(review.ai_confidence)
	.fetch_optional(&mut **tx)
	.await?;

	Ok(row)
}

pub async fn fetch_review_for_update(
	tx: &mut Transaction<'_, Postgres>,
	review_id: Uuid,
) -> Result<Option<ReviewItem>> {
	let row = sqlx::query_as::<_, ReviewItem>(
		"SELECT review_id, entity_id, project_id, review_type, status, ai_suggestion, \
		 ai_confidence, resolved_by, resolved_at, user_resolution, training_comment, created_at, \
		 updated_at FROM review_queue WHERE review_id = $1 FOR UPDATE",
	)
	.bind(review_id)
	.fetch_optional(&mut **tx)
	.await?;

	Ok(row)
}

/// DAG view of ancestors and descendants via `entity_relationships` and
/// `parent_task_id`, cycle-safe, with depth annotations. `duplicate_of`
/// edges are followed once and terminate.
pub async fn lineage<'e>(
	executor: impl PgExecutor<'e>,
	entity_id: Uuid,
	direction: &str,
	max_depth: i32,
) -> Result<Vec<LineageRow>> {
	let rows = sqlx::query_as::<_, LineageRow>(
		"SELECT entity_id, depth, direction, via FROM get_entity_lineage($1, $2, $3) \
		 ORDER BY direction, depth, entity_id",
	)
	.bind(entity_id)
	.bind(direction)
	.bind(max_depth)
	.fetch_all(executor)
	.await?;

	Ok(rows)
}

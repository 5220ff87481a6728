use serde_json::Value;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Clone, Debug, FromRow)]
pub struct User {
	pub user_id: Uuid,
	pub name: String,
	pub email: String,
	pub password_hash: String,
	pub created_at: OffsetDateTime,
	pub updated_at: OffsetDateTime,
}

#[derive(Clone, Debug, FromRow)]
pub struct ApiKey {
	pub api_key_id: Uuid,
	pub user_id: Uuid,
	pub name: String,
	pub key_hash: String,
	pub last_used_at: Option<OffsetDateTime>,
	pub revoked_at: Option<OffsetDateTime>,
	pub created_at: OffsetDateTime,
}

#[derive(Clone, Debug, FromRow)]
pub struct Project {
	pub project_id: Uuid,
	pub name: String,
	pub description: Option<String>,
	pub status: String,
	pub deleted_at: Option<OffsetDateTime>,
	pub created_at: OffsetDateTime,
	pub updated_at: OffsetDateTime,
}

#[derive(Clone, Debug, FromRow)]
pub struct Epic {
	pub epic_id: Uuid,
	pub project_id: Uuid,
	pub name: String,
	pub description: Option<String>,
	pub created_by: String,
	pub deleted_at: Option<OffsetDateTime>,
	pub created_at: OffsetDateTime,
	pub updated_at: OffsetDateTime,
}

#[derive(Clone, Debug, FromRow)]
pub struct RawNote {
	pub raw_note_id: Uuid,
	pub content: String,
	pub source: String,
	pub source_meta: Value,
	pub external_id: Option<String>,
	pub captured_at: OffsetDateTime,
	pub captured_by: Option<Uuid>,
	pub processed: bool,
	pub processed_at: Option<OffsetDateTime>,
	pub dedupe_hash: String,
	pub created_at: OffsetDateTime,
	pub updated_at: OffsetDateTime,
}

#[derive(Clone, Debug, FromRow)]
pub struct Entity {
	pub entity_id: Uuid,
	pub r#type: String,
	pub content: String,
	pub status: String,
	pub project_id: Option<Uuid>,
	pub epic_id: Option<Uuid>,
	pub parent_task_id: Option<Uuid>,
	pub assignee_id: Option<Uuid>,
	pub confidence: f32,
	pub attributes: Value,
	pub ai_meta: Option<Value>,
	pub evidence: Value,
	pub deleted_at: Option<OffsetDateTime>,
	pub created_at: OffsetDateTime,
	pub updated_at: OffsetDateTime,
}

#[derive(Clone, Debug, FromRow)]
pub struct EntityRelationship {
	pub relationship_id: Uuid,
	pub source_id: Uuid,
	pub target_id: Uuid,
	pub r#type: String,
	pub metadata: Value,
	pub created_at: OffsetDateTime,
}

#[derive(Clone, Debug, FromRow)]
pub struct Tag {
	pub tag_id: Uuid,
	pub name: String,
	pub created_at: OffsetDateTime,
}

#[derive(Clone, Debug, FromRow)]
pub struct EntityEvent {
	pub event_id: Uuid,
	pub entity_id: Uuid,
	pub r#type: String,
	pub actor_user_id: Option<Uuid>,
	pub raw_note_id: Option<Uuid>,
	pub body: Option<String>,
	pub old_status: Option<String>,
	pub new_status: Option<String>,
	pub meta: Value,
	pub created_at: OffsetDateTime,
}

#[derive(Clone, Debug, FromRow)]
pub struct ReviewItem {
	pub review_id: Uuid,
	pub entity_id: Option<Uuid>,
	pub project_id: Option<Uuid>,
	pub review_type: String,
	pub status: String,
	pub ai_suggestion: Value,
	pub ai_confidence: f32,
	pub resolved_by: Option<Uuid>,
	pub resolved_at: Option<OffsetDateTime>,
	pub user_resolution: Option<Value>,
	pub training_comment: Option<String>,
	pub created_at: OffsetDateTime,
	pub updated_at: OffsetDateTime,
}

#[derive(Clone, Debug, FromRow)]
pub struct Job {
	pub job_id: Uuid,
	pub queue: String,
	pub job_key: Option<String>,
	pub payload: Value,
	pub status: String,
	pub attempts: i32,
	pub max_attempts: i32,
	pub last_error: Option<String>,
	pub available_at: OffsetDateTime,
	pub completed_at: Option<OffsetDateTime>,
	pub created_at: OffsetDateTime,
	pub updated_at: OffsetDateTime,
}

/// One row of the lineage DAG view returned by `get_entity_lineage`.
#[derive(Clone, Debug, FromRow)]
pub struct LineageRow {
	pub entity_id: Uuid,
	pub depth: i32,
	pub direction: String,
	pub via: Option<String>,
}

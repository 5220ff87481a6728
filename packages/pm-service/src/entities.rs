use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use pm_bus::{Event, TxEvents};
use pm_domain::{
	cursor::Cursor,
	entity::{EntityKind, validate_attributes},
	event::EntityEventType,
	patch::Patch,
};
use pm_storage::{
	models::{Entity, EntityEvent},
	queries::{self, NewEntityEvent},
};

use crate::{Error, Page, PmService, Result, effective_limit, paginate};

/// How far up a parent-task chain the cycle guard walks before giving up.
const MAX_PARENT_DEPTH: usize = 64;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityView {
	pub id: Uuid,
	#[serde(rename = "type")]
	pub entity_type: String,
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
	#[serde(with = "time::serde::rfc3339::option")]
	pub deleted_at: Option<OffsetDateTime>,
	#[serde(with = "time::serde::rfc3339")]
	pub created_at: OffsetDateTime,
	#[serde(with = "time::serde::rfc3339")]
	pub updated_at: OffsetDateTime,
}

impl From<Entity> for EntityView {
	fn from(entity: Entity) -> Self {
		Self {
			id: entity.entity_id,
			entity_type: entity.r#type,
			content: entity.content,
			status: entity.status,
			project_id: entity.project_id,
			epic_id: entity.epic_id,
			parent_task_id: entity.parent_task_id,
			assignee_id: entity.assignee_id,
			confidence: entity.confidence,
			attributes: entity.attributes,
			ai_meta: entity.ai_meta,
			evidence: entity.evidence,
			deleted_at: entity.deleted_at,
			created_at: entity.created_at,
			updated_at: entity.updated_at,
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEntityRequest {
	#[serde(rename = "type")]
	pub entity_type: EntityKind,
	pub content: String,
	#[serde(default)]
	pub status: Option<String>,
	#[serde(default)]
	pub project_id: Option<Uuid>,
	#[serde(default)]
	pub epic_id: Option<Uuid>,
	#[serde(default)]
	pub parent_task_id: Option<Uuid>,
	#[serde(default)]
	pub assignee_id: Option<Uuid>,
	#[serde(default)]
	pub attributes: Option<Value>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchEntityRequest {
	#[serde(default)]
	pub content: Patch<String>,
	#[serde(default)]
	pub project_id: Patch<Uuid>,
	#[serde(default)]
	pub epic_id: Patch<Uuid>,
	#[serde(default)]
	pub parent_task_id: Patch<Uuid>,
	#[serde(default)]
	pub assignee_id: Patch<Uuid>,
	#[serde(default)]
	pub attributes: Patch<Value>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListEntitiesRequest {
	pub project_id: Option<Uuid>,
	pub epic_id: Option<Uuid>,
	#[serde(rename = "type")]
	pub entity_type: Option<EntityKind>,
	pub status: Option<String>,
	pub assignee_id: Option<Uuid>,
	pub tag_id: Option<Uuid>,
	#[serde(default)]
	pub include_deleted: bool,
	pub limit: Option<i64>,
	pub cursor: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityEventView {
	pub id: Uuid,
	pub entity_id: Uuid,
	#[serde(rename = "type")]
	pub event_type: String,
	pub actor_user_id: Option<Uuid>,
	pub raw_note_id: Option<Uuid>,
	pub body: Option<String>,
	pub old_status: Option<String>,
	pub new_status: Option<String>,
	pub meta: Value,
	#[serde(with = "time::serde::rfc3339")]
	pub created_at: OffsetDateTime,
}

impl From<EntityEvent> for EntityEventView {
	fn from(event: EntityEvent) -> Self {
		Self {
			id: event.event_id,
			entity_id: event.entity_id,
			event_type: event.r#type,
			actor_user_id: event.actor_user_id,
			raw_note_id: event.raw_note_id,
			body: event.body,
			old_status: event.old_status,
			new_status: event.new_status,
			meta: event.meta,
			created_at: event.created_at,
		}
	}
}

/// Arguments for the shared entity insert used by both the HTTP surface and
/// materialization.
pub(crate) struct NewEntity {
	pub kind: EntityKind,
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
	pub actor_user_id: Option<Uuid>,
	pub raw_note_id: Option<Uuid>,
}

impl PmService {
	pub async fn create_entity(
		&self,
		req: CreateEntityRequest,
		actor_user_id: Option<Uuid>,
	) -> Result<EntityView> {
		if req.content.trim().is_empty() {
			return Err(Error::validation("content must be non-empty."));
		}

		let status = match req.status {
			Some(status) => {
				if !req.entity_type.is_valid_status(&status) {
					return Err(Error::validation(format!(
						"Status {status} is not valid for type {}.",
						req.entity_type,
					)));
				}

				status
			},
			None => req.entity_type.default_status().to_string(),
		};
		let attributes = req.attributes.unwrap_or_else(|| Value::Object(Default::default()));

		validate_attributes(req.entity_type, &attributes)
			.map_err(Error::validation)?;

		let mut tx = self.db.pool.begin().await?;
		let mut events = TxEvents::new();

		if let Some(epic_id) = req.epic_id {
			check_epic_in_project(&mut tx, epic_id, req.project_id).await?;
		}
		if let Some(parent_task_id) = req.parent_task_id {
			check_parent_task(&mut tx, parent_task_id, req.entity_type, None).await?;
		}

		let entity = insert_entity_tx(
			&mut tx,
			&mut events,
			NewEntity {
				kind: req.entity_type,
				content: req.content,
				status,
				project_id: req.project_id,
				epic_id: req.epic_id,
				parent_task_id: req.parent_task_id,
				assignee_id: req.assignee_id,
				confidence: 1.0,
				attributes,
				ai_meta: None,
				evidence: Value::Array(Vec::new()),
				actor_user_id,
				raw_note_id: None,
			},
		)
		.await?;

		self.commit_with_events(tx, events).await?;

		Ok(entity.into())
	}

	pub async fn get_entity(&self, entity_id: Uuid) -> Result<EntityView> {
		let entity = queries::fetch_entity(&self.db.pool, entity_id)
			.await?
			.ok_or_else(|| Error::not_found(format!("Entity {entity_id} does not exist.")))?;

		Ok(entity.into())
	}

	pub async fn list_entities(&self, req: ListEntitiesRequest) -> Result<Page<EntityView>> {
		let limit = effective_limit(req.limit)?;
		let mut builder = sqlx::QueryBuilder::new(
			"SELECT e.entity_id, e.type, e.content, e.status, e.project_id, e.epic_id, \
			 e.parent_task_id, e.assignee_id, e.confidence, e.attributes, e.ai_meta, e.evidence, \
			 e.deleted_at, e.created_at, e.updated_at FROM entities e WHERE TRUE",
		);

		if !req.include_deleted {
			builder.push(" AND e.deleted_at IS NULL");
		}
		if let Some(project_id) = req.project_id {
			builder.push(" AND e.project_id = ");
			builder.push_bind(project_id);
		}
		if let Some(epic_id) = req.epic_id {
			builder.push(" AND e.epic_id = ");
			builder.push_bind(epic_id);
		}
		if let Some(kind) = req.entity_type {
			builder.push(" AND e.type = ");
			builder.push_bind(kind.as_str());
		}
		if let Some(status) = req.status.as_deref() {
			builder.push(" AND e.status = ");
			builder.push_bind(status.to_string());
		}
		if let Some(assignee_id) = req.assignee_id {
			builder.push(" AND e.assignee_id = ");
			builder.push_bind(assignee_id);
		}
		if let Some(tag_id) = req.tag_id {
			builder.push(
				" AND EXISTS (SELECT 1 FROM entity_tags et WHERE et.entity_id = e.entity_id AND et.tag_id = ",
			);
			builder.push_bind(tag_id);
			builder.push(")");
		}
		if let Some(raw) = req.cursor.as_deref() {
			let cursor = Cursor::decode(raw)?;
			let created_at = cursor.timestamp()?;

			builder.push(" AND (e.created_at, e.entity_id) < (");
			builder.push_bind(created_at);
			builder.push(", ");
			builder.push_bind(cursor.id);
			builder.push(")");
		}

		builder.push(" ORDER BY e.created_at DESC, e.entity_id DESC LIMIT ");
		builder.push_bind(limit + 1);

		let entities: Vec<Entity> = builder.build_query_as().fetch_all(&self.db.pool).await?;
		let views: Vec<EntityView> = entities.into_iter().map(EntityView::from).collect();

		paginate(views, limit, |entity| {
			Cursor::from_timestamp(entity.created_at, entity.id).map_err(Error::from)
		})
	}

	pub async fn patch_entity(
		&self,
		entity_id: Uuid,
		req: PatchEntityRequest,
		actor_user_id: Option<Uuid>,
	) -> Result<EntityView> {
		let mut tx = self.db.pool.begin().await?;
		let mut events = TxEvents::new();
		let entity = queries::fetch_entity_for_update(&mut tx, entity_id)
			.await?
			.ok_or_else(|| Error::not_found(format!("Entity {entity_id} does not exist.")))?;
		let kind: EntityKind = entity
			.r#type
			.parse()
			.map_err(|_| Error::conflict("Entity row carries an unknown type."))?;

		let content = match req.content {
			Patch::Missing => entity.content.clone(),
			Patch::Null => return Err(Error::validation("content cannot be cleared.")),
			Patch::Set(content) => {
				if content.trim().is_empty() {
					return Err(Error::validation("content must be non-empty."));
				}

				content
			},
		};
		let project_id = req.project_id.into_update().unwrap_or(entity.project_id);
		let epic_id = req.epic_id.into_update().unwrap_or(entity.epic_id);
		let parent_task_id = req.parent_task_id.into_update().unwrap_or(entity.parent_task_id);
		let assignee_id = req.assignee_id.into_update().unwrap_or(entity.assignee_id);
		let attributes = match req.attributes {
			Patch::Missing => entity.attributes.clone(),
			Patch::Null => Value::Object(Default::default()),
			Patch::Set(attributes) => attributes,
		};

		validate_attributes(kind, &attributes).map_err(Error::validation)?;

		if let Some(epic_id) = epic_id {
			check_epic_in_project(&mut tx, epic_id, project_id).await?;
		}
		if let Some(parent_task_id) = parent_task_id {
			check_parent_task(&mut tx, parent_task_id, kind, Some(entity_id)).await?;
		}

		let updated = sqlx::query_as::<_, Entity>(
			"UPDATE entities SET content = $1, project_id = $2, epic_id = $3, \
			 parent_task_id = $4, assignee_id = $5, attributes = $6 \
			 WHERE entity_id = $7 \
			 RETURNING entity_id, type, content, status, project_id, epic_id, parent_task_id, \
			 assignee_id, confidence, attributes, ai_meta, evidence, deleted_at, created_at, \
			 updated_at",
		)
		.bind(&content)
		.bind(project_id)
		.bind(epic_id)
		.bind(parent_task_id)
		.bind(assignee_id)
		.bind(&attributes)
		.bind(entity_id)
		.fetch_one(&mut *tx)
		.await?;

		if assignee_id != entity.assignee_id {
			let event = queries::insert_entity_event(
				&mut tx,
				NewEntityEvent {
					entity_id,
					event_type: EntityEventType::AssignmentChange.as_str(),
					actor_user_id,
					raw_note_id: None,
					body: None,
					old_status: None,
					new_status: None,
					meta: serde_json::json!({
						"oldAssigneeId": entity.assignee_id,
						"newAssigneeId": assignee_id,
					}),
				},
			)
			.await?;

			events.push(Event::EntityEventAdded {
				entity_id,
				event_id: event.event_id,
				event_type: event.r#type,
			});
		}

		events.push(Event::EntityUpdated { id: entity_id });

		if project_id != entity.project_id {
			crate::projects::push_stats_updated(&mut events, entity.project_id);
			crate::projects::push_stats_updated(&mut events, project_id);
		}

		self.commit_with_events(tx, events).await?;

		Ok(updated.into())
	}

	/// The only status write path. A transition to the current status is a
	/// no-op: no event, no update.
	pub async fn transition_entity_status(
		&self,
		entity_id: Uuid,
		new_status: &str,
		actor_user_id: Option<Uuid>,
	) -> Result<EntityView> {
		let mut tx = self.db.pool.begin().await?;
		let mut events = TxEvents::new();
		let entity = queries::fetch_entity_for_update(&mut tx, entity_id)
			.await?
			.ok_or_else(|| Error::not_found(format!("Entity {entity_id} does not exist.")))?;
		let kind: EntityKind = entity
			.r#type
			.parse()
			.map_err(|_| Error::conflict("Entity row carries an unknown type."))?;

		if !kind.is_valid_status(new_status) {
			return Err(Error::validation(format!(
				"Status {new_status} is not valid for type {kind}.",
			)));
		}
		if entity.status == new_status {
			tx.commit().await?;

			return Ok(entity.into());
		}

		let updated = sqlx::query_as::<_, Entity>(
			"UPDATE entities SET status = $1 WHERE entity_id = $2 \
			 RETURNING entity_id, type, content, status, project_id, epic_id, parent_task_id, \
			 assignee_id, confidence, attributes, ai_meta, evidence, deleted_at, created_at, \
			 updated_at",
		)
		.bind(new_status)
		.bind(entity_id)
		.fetch_one(&mut *tx)
		.await?;
		let event = queries::insert_entity_event(
			&mut tx,
			NewEntityEvent {
				entity_id,
				event_type: EntityEventType::StatusChange.as_str(),
				actor_user_id,
				raw_note_id: None,
				body: None,
				old_status: Some(&entity.status),
				new_status: Some(new_status),
				meta: Value::Object(Default::default()),
			},
		)
		.await?;

		events.push(Event::EntityUpdated { id: entity_id });
		events.push(Event::EntityEventAdded {
			entity_id,
			event_id: event.event_id,
			event_type: event.r#type,
		});
		crate::projects::push_stats_updated(&mut events, entity.project_id);
		self.commit_with_events(tx, events).await?;

		Ok(updated.into())
	}

	pub async fn add_comment(
		&self,
		entity_id: Uuid,
		body: &str,
		meta: Value,
		actor_user_id: Option<Uuid>,
	) -> Result<EntityEventView> {
		if body.trim().is_empty() {
			return Err(Error::validation("Comment body must be non-empty."));
		}
		if !meta.is_object() {
			return Err(Error::validation("meta must be a JSON object."));
		}

		let mut tx = self.db.pool.begin().await?;
		let mut events = TxEvents::new();

		queries::fetch_entity(&mut *tx, entity_id)
			.await?
			.ok_or_else(|| Error::not_found(format!("Entity {entity_id} does not exist.")))?;

		let event = queries::insert_entity_event(
			&mut tx,
			NewEntityEvent {
				entity_id,
				event_type: EntityEventType::Comment.as_str(),
				actor_user_id,
				raw_note_id: None,
				body: Some(body),
				old_status: None,
				new_status: None,
				meta,
			},
		)
		.await?;

		events.push(Event::EntityEventAdded {
			entity_id,
			event_id: event.event_id,
			event_type: event.r#type.clone(),
		});
		self.commit_with_events(tx, events).await?;

		Ok(event.into())
	}

	pub async fn list_entity_events(
		&self,
		entity_id: Uuid,
		ascending: bool,
	) -> Result<Vec<EntityEventView>> {
		queries::fetch_entity(&self.db.pool, entity_id)
			.await?
			.ok_or_else(|| Error::not_found(format!("Entity {entity_id} does not exist.")))?;

		let order = if ascending { "ASC" } else { "DESC" };
		let rows = sqlx::query_as::<_, EntityEvent>(&format!(
			"SELECT event_id, entity_id, type, actor_user_id, raw_note_id, body, old_status, \
			 new_status, meta, created_at FROM entity_events WHERE entity_id = $1 \
			 ORDER BY created_at {order}, event_id {order}",
		))
		.bind(entity_id)
		.fetch_all(&self.db.pool)
		.await?;

		Ok(rows.into_iter().map(EntityEventView::from).collect())
	}
}

/// Shared insert for user- and AI-created entities: same row shape, same
/// `created` audit event, same bus topic. Only the actor differs.
pub(crate) async fn insert_entity_tx(
	tx: &mut Transaction<'_, Postgres>,
	events: &mut TxEvents,
	new: NewEntity,
) -> Result<Entity> {
	let entity = sqlx::query_as::<_, Entity>(
		"INSERT INTO entities \
		 (entity_id, type, content, status, project_id, epic_id, parent_task_id, assignee_id, \
		  confidence, attributes, ai_meta, evidence) \
		 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
		 RETURNING entity_id, type, content, status, project_id, epic_id, parent_task_id, \
		 assignee_id, confidence, attributes, ai_meta, evidence, deleted_at, created_at, updated_at",
	)
	.bind(Uuid::new_v4())
	.bind(new.kind.as_str())
	.bind(&new.content)
	.bind(&new.status)
	.bind(new.project_id)
	.bind(new.epic_id)
	.bind(new.parent_task_id)
	.bind(new.assignee_id)
	.bind(new.confidence)
	.bind(&new.attributes)
	.bind(&new.ai_meta)
	.bind(&new.evidence)
	.fetch_one(&mut **tx)
	.await?;
	let event = queries::insert_entity_event(
		tx,
		NewEntityEvent {
			entity_id: entity.entity_id,
			event_type: EntityEventType::Created.as_str(),
			actor_user_id: new.actor_user_id,
			raw_note_id: new.raw_note_id,
			body: None,
			old_status: None,
			new_status: None,
			meta: Value::Object(Default::default()),
		},
	)
	.await?;

	events.push(Event::EntityCreated {
		id: entity.entity_id,
		entity_type: entity.r#type.clone(),
	});
	events.push(Event::EntityEventAdded {
		entity_id: entity.entity_id,
		event_id: event.event_id,
		event_type: event.r#type,
	});
	crate::projects::push_stats_updated(events, entity.project_id);

	Ok(entity)
}

/// An epic reference requires a project reference, and the epic must belong
/// to that project. The foreign keys cannot express the cross-column rule.
pub(crate) async fn check_epic_in_project(
	tx: &mut Transaction<'_, Postgres>,
	epic_id: Uuid,
	project_id: Option<Uuid>,
) -> Result<()> {
	let Some(project_id) = project_id else {
		return Err(Error::validation("epicId requires projectId."));
	};
	let epic = queries::fetch_epic(&mut **tx, epic_id)
		.await?
		.ok_or_else(|| Error::not_found(format!("Epic {epic_id} does not exist.")))?;

	if epic.project_id != project_id {
		return Err(Error::validation(format!(
			"Epic {epic_id} belongs to project {}, not {project_id}.",
			epic.project_id,
		)));
	}

	Ok(())
}

/// Parent links are task-only on both ends, and following the chain upward
/// must never come back to the entity being written.
pub(crate) async fn check_parent_task(
	tx: &mut Transaction<'_, Postgres>,
	parent_task_id: Uuid,
	child_kind: EntityKind,
	child_id: Option<Uuid>,
) -> Result<()> {
	if child_kind != EntityKind::Task {
		return Err(Error::validation("parentTaskId is only valid for tasks."));
	}

	let mut current = Some(parent_task_id);
	let mut depth = 0;

	while let Some(ancestor_id) = current {
		if Some(ancestor_id) == child_id {
			return Err(Error::validation("parentTaskId would create a cycle."));
		}
		if depth >= MAX_PARENT_DEPTH {
			return Err(Error::validation("Parent-task chain is too deep."));
		}

		let ancestor = queries::fetch_entity(&mut **tx, ancestor_id).await?.ok_or_else(|| {
			Error::not_found(format!("Parent task {ancestor_id} does not exist."))
		})?;

		if ancestor.r#type != EntityKind::Task.as_str() {
			return Err(Error::validation(format!(
				"Parent {ancestor_id} is a {}, not a task.",
				ancestor.r#type,
			)));
		}

		current = ancestor.parent_task_id;
		depth += 1;
	}

	Ok(())
}

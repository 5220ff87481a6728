use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlx::{Acquire as _, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use pm_bus::{Event, TxEvents};
use pm_domain::{
	cursor::Cursor,
	entity::EntityKind,
	event::EntityEventType,
	review::{ReviewStatus, ReviewType},
};
use pm_storage::{
	models::{Entity, ReviewItem},
	queries::{self, NewEntityEvent, NewReview},
};

use crate::{
	Error, Page, PmService, Result, effective_limit, epics::create_epic_tx, paginate,
	projects::push_stats_updated,
};

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewView {
	pub id: Uuid,
	pub entity_id: Option<Uuid>,
	pub project_id: Option<Uuid>,
	pub review_type: String,
	pub status: String,
	pub ai_suggestion: Value,
	pub ai_confidence: f32,
	pub resolved_by: Option<Uuid>,
	#[serde(with = "time::serde::rfc3339::option")]
	pub resolved_at: Option<OffsetDateTime>,
	pub user_resolution: Option<Value>,
	pub training_comment: Option<String>,
	#[serde(with = "time::serde::rfc3339")]
	pub created_at: OffsetDateTime,
}

impl From<ReviewItem> for ReviewView {
	fn from(item: ReviewItem) -> Self {
		Self {
			id: item.review_id,
			entity_id: item.entity_id,
			project_id: item.project_id,
			review_type: item.review_type,
			status: item.status,
			ai_suggestion: item.ai_suggestion,
			ai_confidence: item.ai_confidence,
			resolved_by: item.resolved_by,
			resolved_at: item.resolved_at,
			user_resolution: item.user_resolution,
			training_comment: item.training_comment,
			created_at: item.created_at,
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
	pub status: ReviewStatus,
	#[serde(default)]
	pub user_resolution: Option<Value>,
	#[serde(default)]
	pub training_comment: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResolveRequest {
	pub resolutions: Vec<BatchResolution>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResolution {
	pub id: Uuid,
	pub status: ReviewStatus,
	#[serde(default)]
	pub user_resolution: Option<Value>,
	#[serde(default)]
	pub training_comment: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
	pub id: Uuid,
	pub outcome: BatchOutcomeKind,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub review: Option<ReviewView>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcomeKind {
	Applied,
	Failed,
	Skipped,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListReviewsRequest {
	pub status: Option<ReviewStatus>,
	pub review_type: Option<ReviewType>,
	pub project_id: Option<Uuid>,
	pub entity_id: Option<Uuid>,
	pub limit: Option<i64>,
	pub cursor: Option<String>,
}

impl PmService {
	pub async fn list_reviews(&self, req: ListReviewsRequest) -> Result<Page<ReviewView>> {
		let limit = effective_limit(req.limit)?;
		let mut builder = review_filter_query(
			"SELECT review_id, entity_id, project_id, review_type, status, ai_suggestion, \
			 ai_confidence, resolved_by, resolved_at, user_resolution, training_comment, \
			 created_at, updated_at FROM review_queue WHERE TRUE",
			&req,
		);

		if let Some(raw) = req.cursor.as_deref() {
			let cursor = Cursor::decode(raw)?;
			let created_at = cursor.timestamp()?;

			builder.push(" AND (created_at, review_id) < (");
			builder.push_bind(created_at);
			builder.push(", ");
			builder.push_bind(cursor.id);
			builder.push(")");
		}

		builder.push(" ORDER BY created_at DESC, review_id DESC LIMIT ");
		builder.push_bind(limit + 1);

		let items: Vec<ReviewItem> = builder.build_query_as().fetch_all(&self.db.pool).await?;
		let views: Vec<ReviewView> = items.into_iter().map(ReviewView::from).collect();

		paginate(views, limit, |item| {
			Cursor::from_timestamp(item.created_at, item.id).map_err(Error::from)
		})
	}

	pub async fn count_reviews(&self, req: ListReviewsRequest) -> Result<i64> {
		let mut builder =
			review_filter_query("SELECT count(*) FROM review_queue WHERE TRUE", &req);
		let count: i64 =
			builder.build_query_scalar().fetch_one(&self.db.pool).await.map_err(Error::from)?;

		Ok(count)
	}

	pub async fn resolve_review(
		&self,
		review_id: Uuid,
		req: ResolveRequest,
		actor_user_id: Option<Uuid>,
	) -> Result<ReviewView> {
		let mut tx = self.db.pool.begin().await?;
		let mut events = TxEvents::new();
		let view =
			resolve_review_tx(&mut tx, &mut events, review_id, &req, actor_user_id).await?;

		self.commit_with_events(tx, events).await?;

		Ok(view)
	}

	/// Each resolution runs in its own savepoint inside one outer
	/// transaction: a failure keeps the effects of the items before it,
	/// aborts the items after it, and reports per-item outcomes.
	pub async fn resolve_batch(
		&self,
		req: BatchResolveRequest,
		actor_user_id: Option<Uuid>,
	) -> Result<Vec<BatchOutcome>> {
		if req.resolutions.is_empty() {
			return Err(Error::validation("resolutions must be non-empty."));
		}

		let mut tx = self.db.pool.begin().await?;
		let mut events = TxEvents::new();
		let mut outcomes = Vec::with_capacity(req.resolutions.len());
		let mut aborted = false;

		for item in req.resolutions {
			if aborted {
				outcomes.push(BatchOutcome {
					id: item.id,
					outcome: BatchOutcomeKind::Skipped,
					error: None,
					review: None,
				});

				continue;
			}

			let resolve = ResolveRequest {
				status: item.status,
				user_resolution: item.user_resolution,
				training_comment: item.training_comment,
			};
			let mut item_events = TxEvents::new();
			let mut savepoint = tx.begin().await?;
			let result =
				resolve_review_tx(&mut savepoint, &mut item_events, item.id, &resolve, actor_user_id)
					.await;

			match result {
				Ok(view) => {
					savepoint.commit().await?;

					for event in item_events.into_events() {
						events.push(event);
					}

					outcomes.push(BatchOutcome {
						id: item.id,
						outcome: BatchOutcomeKind::Applied,
						error: None,
						review: Some(view),
					});
				},
				Err(err) => {
					savepoint.rollback().await?;
					aborted = true;
					outcomes.push(BatchOutcome {
						id: item.id,
						outcome: BatchOutcomeKind::Failed,
						error: Some(err.to_string()),
						review: None,
					});
				},
			}
		}

		self.commit_with_events(tx, events).await?;

		Ok(outcomes)
	}
}

fn review_filter_query<'a>(
	base: &str,
	req: &'a ListReviewsRequest,
) -> sqlx::QueryBuilder<'a, Postgres> {
	let mut builder = sqlx::QueryBuilder::new(base);

	if let Some(status) = req.status {
		builder.push(" AND status = ");
		builder.push_bind(status.as_str());
	}
	if let Some(review_type) = req.review_type {
		builder.push(" AND review_type = ");
		builder.push_bind(review_type.as_str());
	}
	if let Some(project_id) = req.project_id {
		builder.push(" AND project_id = ");
		builder.push_bind(project_id);
	}
	if let Some(entity_id) = req.entity_id {
		builder.push(" AND entity_id = ");
		builder.push_bind(entity_id);
	}

	builder
}

/// One resolution: row lock, terminal-state transition, per-type side
/// effects, audit row, and bus events, all in the caller's transaction.
async fn resolve_review_tx(
	tx: &mut Transaction<'_, Postgres>,
	events: &mut TxEvents,
	review_id: Uuid,
	req: &ResolveRequest,
	actor_user_id: Option<Uuid>,
) -> Result<ReviewView> {
	if !req.status.is_terminal() {
		return Err(Error::validation("status must be accepted, rejected, or modified."));
	}
	if req.status == ReviewStatus::Modified && req.user_resolution.is_none() {
		return Err(Error::validation("userResolution is required when modifying."));
	}

	let review = queries::fetch_review_for_update(tx, review_id)
		.await?
		.ok_or_else(|| Error::not_found(format!("Review {review_id} does not exist.")))?;

	if review.status != ReviewStatus::Pending.as_str() {
		return Err(Error::conflict(format!(
			"Review {review_id} was already resolved as {}.",
			review.status,
		)));
	}

	let review_type: ReviewType = review
		.review_type
		.parse()
		.map_err(|_| Error::conflict("Review row carries an unknown type."))?;

	apply_effects(tx, events, &review, review_type, req, actor_user_id).await?;

	let updated = sqlx::query_as::<_, ReviewItem>(
		"UPDATE review_queue SET status = $1, resolved_by = $2, resolved_at = now(), \
		 user_resolution = $3, training_comment = $4 WHERE review_id = $5 \
		 RETURNING review_id, entity_id, project_id, review_type, status, ai_suggestion, \
		 ai_confidence, resolved_by, resolved_at, user_resolution, training_comment, created_at, \
		 updated_at",
	)
	.bind(req.status.as_str())
	.bind(actor_user_id)
	.bind(&req.user_resolution)
	.bind(req.training_comment.as_deref())
	.bind(review_id)
	.fetch_one(&mut **tx)
	.await?;

	// Project-scoped reviews have no entity to audit against; the review row
	// itself is the trail.
	if let Some(entity_id) = review.entity_id {
		let event = queries::insert_entity_event(
			tx,
			NewEntityEvent {
				entity_id,
				event_type: EntityEventType::ReviewResolved.as_str(),
				actor_user_id,
				raw_note_id: None,
				body: None,
				old_status: None,
				new_status: None,
				meta: json!({
					"reviewId": review_id,
					"reviewType": review.review_type,
					"resolution": req.status.as_str(),
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

	events.push(Event::ReviewQueueResolved {
		id: review_id,
		status: req.status.as_str().to_string(),
	});

	Ok(updated.into())
}

/// The per-reviewType effects table: accept applies the AI suggestion,
/// modify applies the user resolution, reject applies the clear action.
async fn apply_effects(
	tx: &mut Transaction<'_, Postgres>,
	events: &mut TxEvents,
	review: &ReviewItem,
	review_type: ReviewType,
	req: &ResolveRequest,
	actor_user_id: Option<Uuid>,
) -> Result<()> {
	let resolution = match req.status {
		ReviewStatus::Accepted => Some(&review.ai_suggestion),
		ReviewStatus::Modified => req.user_resolution.as_ref(),
		_ => None,
	};

	match review_type {
		ReviewType::TypeClassification => {
			let Some(resolution) = resolution else {
				return Ok(());
			};

			apply_type_change(tx, events, review, resolution).await
		},
		ReviewType::ProjectAssignment => {
			let suggested = resolution
				.map(|value| required_uuid(value, "suggestedProjectId"))
				.transpose()?
				.flatten();

			apply_project_assignment(tx, events, review, suggested).await
		},
		ReviewType::EpicAssignment => {
			let suggested = resolution
				.map(|value| required_uuid(value, "suggestedEpicId"))
				.transpose()?
				.flatten();

			apply_epic_assignment(tx, events, review, suggested).await
		},
		ReviewType::AssigneeSuggestion => {
			let suggested = resolution
				.map(|value| required_uuid(value, "suggestedAssigneeId"))
				.transpose()?
				.flatten();

			apply_assignee(tx, events, review, suggested, actor_user_id).await
		},
		ReviewType::DuplicateDetection => {
			let Some(resolution) = resolution else {
				return Ok(());
			};

			apply_duplicate(tx, events, review, resolution).await
		},
		ReviewType::EpicCreation => {
			let Some(resolution) = resolution else {
				return Ok(());
			};

			apply_epic_creation(tx, events, review, resolution).await
		},
		// Training signal only; nothing structural changes.
		ReviewType::LowConfidence | ReviewType::ProjectCreation => Ok(()),
	}
}

async fn load_review_entity(
	tx: &mut Transaction<'_, Postgres>,
	review: &ReviewItem,
) -> Result<Entity> {
	let entity_id = review
		.entity_id
		.ok_or_else(|| Error::validation("This review is not entity-scoped."))?;
	let entity = queries::fetch_entity_for_update(tx, entity_id)
		.await?
		.ok_or_else(|| Error::not_found(format!("Entity {entity_id} does not exist.")))?;

	Ok(entity)
}

async fn apply_type_change(
	tx: &mut Transaction<'_, Postgres>,
	events: &mut TxEvents,
	review: &ReviewItem,
	resolution: &Value,
) -> Result<()> {
	let raw = resolution
		.get("suggestedType")
		.and_then(Value::as_str)
		.ok_or_else(|| Error::validation("suggestedType is required."))?;
	let kind: EntityKind = raw
		.parse()
		.map_err(|_| Error::validation(format!("Unknown entity type: {raw}.")))?;
	let entity = load_review_entity(tx, review).await?;

	// Kind change resets the status to the new kind's initial state; a
	// non-task kind cannot keep a parent link.
	let parent_task_id = if kind == EntityKind::Task { entity.parent_task_id } else { None };

	sqlx::query(
		"UPDATE entities SET type = $1, status = $2, parent_task_id = $3 WHERE entity_id = $4",
	)
	.bind(kind.as_str())
	.bind(kind.default_status())
	.bind(parent_task_id)
	.bind(entity.entity_id)
	.execute(&mut **tx)
	.await?;

	// Cascade: every other pending review for this entity was produced
	// against the old type and may no longer apply.
	let cascaded: Vec<(Uuid,)> = sqlx::query_as(
		"UPDATE review_queue SET status = 'rejected', resolved_at = now() \
		 WHERE entity_id = $1 AND review_id <> $2 AND status = 'pending' \
		 RETURNING review_id",
	)
	.bind(entity.entity_id)
	.bind(review.review_id)
	.fetch_all(&mut **tx)
	.await?;

	for (review_id,) in cascaded {
		events.push(Event::ReviewQueueResolved {
			id: review_id,
			status: ReviewStatus::Rejected.as_str().to_string(),
		});
	}

	events.push(Event::EntityUpdated { id: entity.entity_id });
	push_stats_updated(events, entity.project_id);

	Ok(())
}

async fn apply_project_assignment(
	tx: &mut Transaction<'_, Postgres>,
	events: &mut TxEvents,
	review: &ReviewItem,
	project_id: Option<Uuid>,
) -> Result<()> {
	let entity = load_review_entity(tx, review).await?;

	if let Some(project_id) = project_id {
		let project = queries::fetch_project(&mut **tx, project_id)
			.await?
			.ok_or_else(|| Error::not_found(format!("Project {project_id} does not exist.")))?;

		if project.deleted_at.is_some() {
			return Err(Error::conflict(format!("Project {project_id} is deleted.")));
		}
	}

	// Moving (or clearing) the project invalidates an epic from elsewhere.
	let epic_id = match (project_id, entity.epic_id) {
		(Some(project_id), Some(epic_id)) => {
			let epic = queries::fetch_epic(&mut **tx, epic_id).await?;

			epic.filter(|epic| epic.project_id == project_id).map(|epic| epic.epic_id)
		},
		_ => None,
	};

	sqlx::query("UPDATE entities SET project_id = $1, epic_id = $2 WHERE entity_id = $3")
		.bind(project_id)
		.bind(epic_id)
		.bind(entity.entity_id)
		.execute(&mut **tx)
		.await?;

	events.push(Event::EntityUpdated { id: entity.entity_id });
	push_stats_updated(events, entity.project_id);
	push_stats_updated(events, project_id);

	Ok(())
}

async fn apply_epic_assignment(
	tx: &mut Transaction<'_, Postgres>,
	events: &mut TxEvents,
	review: &ReviewItem,
	epic_id: Option<Uuid>,
) -> Result<()> {
	let entity = load_review_entity(tx, review).await?;
	let (epic_id, project_id) = match epic_id {
		Some(epic_id) => {
			let epic = queries::fetch_epic(&mut **tx, epic_id)
				.await?
				.ok_or_else(|| Error::not_found(format!("Epic {epic_id} does not exist.")))?;

			if epic.deleted_at.is_some() {
				return Err(Error::conflict(format!("Epic {epic_id} is deleted.")));
			}
			if let Some(project_id) = entity.project_id
				&& project_id != epic.project_id
			{
				return Err(Error::validation(format!(
					"Epic {epic_id} belongs to project {}, not {project_id}.",
					epic.project_id,
				)));
			}

			(Some(epic_id), Some(epic.project_id))
		},
		None => (None, entity.project_id),
	};

	sqlx::query("UPDATE entities SET epic_id = $1, project_id = $2 WHERE entity_id = $3")
		.bind(epic_id)
		.bind(project_id)
		.bind(entity.entity_id)
		.execute(&mut **tx)
		.await?;

	events.push(Event::EntityUpdated { id: entity.entity_id });
	push_stats_updated(events, project_id);

	Ok(())
}

async fn apply_assignee(
	tx: &mut Transaction<'_, Postgres>,
	events: &mut TxEvents,
	review: &ReviewItem,
	assignee_id: Option<Uuid>,
	actor_user_id: Option<Uuid>,
) -> Result<()> {
	let entity = load_review_entity(tx, review).await?;

	if entity.assignee_id == assignee_id {
		return Ok(());
	}

	sqlx::query("UPDATE entities SET assignee_id = $1 WHERE entity_id = $2")
		.bind(assignee_id)
		.bind(entity.entity_id)
		.execute(&mut **tx)
		.await?;

	let event = queries::insert_entity_event(
		tx,
		NewEntityEvent {
			entity_id: entity.entity_id,
			event_type: EntityEventType::AssignmentChange.as_str(),
			actor_user_id,
			raw_note_id: None,
			body: None,
			old_status: None,
			new_status: None,
			meta: json!({
				"oldAssigneeId": entity.assignee_id,
				"newAssigneeId": assignee_id,
			}),
		},
	)
	.await?;

	events.push(Event::EntityEventAdded {
		entity_id: entity.entity_id,
		event_id: event.event_id,
		event_type: event.r#type,
	});
	events.push(Event::EntityUpdated { id: entity.entity_id });

	Ok(())
}

async fn apply_duplicate(
	tx: &mut Transaction<'_, Postgres>,
	events: &mut TxEvents,
	review: &ReviewItem,
	resolution: &Value,
) -> Result<()> {
	let target_id = required_uuid(resolution, "duplicateEntityId")?
		.ok_or_else(|| Error::validation("duplicateEntityId is required."))?;
	let entity = load_review_entity(tx, review).await?;

	if target_id == entity.entity_id {
		return Err(Error::validation("An entity cannot be a duplicate of itself."));
	}

	let target = queries::fetch_entity(&mut **tx, target_id)
		.await?
		.ok_or_else(|| Error::not_found(format!("Entity {target_id} does not exist.")))?;

	if target.deleted_at.is_some() {
		return Err(Error::conflict(format!("Entity {target_id} is deleted.")));
	}

	sqlx::query(
		"INSERT INTO entity_relationships (relationship_id, source_id, target_id, type) \
		 VALUES ($1, $2, $3, 'duplicate_of') ON CONFLICT DO NOTHING",
	)
	.bind(Uuid::new_v4())
	.bind(entity.entity_id)
	.bind(target_id)
	.execute(&mut **tx)
	.await?;
	// The duplicate disappears from default lists but its history stays.
	sqlx::query(
		"UPDATE entities SET deleted_at = now() WHERE entity_id = $1 AND deleted_at IS NULL",
	)
	.bind(entity.entity_id)
	.execute(&mut **tx)
	.await?;

	events.push(Event::EntityUpdated { id: entity.entity_id });
	push_stats_updated(events, entity.project_id);

	Ok(())
}

async fn apply_epic_creation(
	tx: &mut Transaction<'_, Postgres>,
	events: &mut TxEvents,
	review: &ReviewItem,
	resolution: &Value,
) -> Result<()> {
	// Modified resolutions may override any field; the suggestion fills the
	// gaps.
	let suggestion = &review.ai_suggestion;
	let name = resolution
		.get("proposedEpicName")
		.or_else(|| suggestion.get("proposedEpicName"))
		.and_then(Value::as_str)
		.ok_or_else(|| Error::validation("proposedEpicName is required."))?;
	let description = resolution
		.get("proposedEpicDescription")
		.or_else(|| suggestion.get("proposedEpicDescription"))
		.and_then(Value::as_str);
	let project_id = required_uuid(resolution, "proposedEpicProjectId")?
		.or(required_uuid(suggestion, "proposedEpicProjectId")?)
		.ok_or_else(|| Error::validation("proposedEpicProjectId is required."))?;
	let candidate_ids: Vec<Uuid> = resolution
		.get("candidateEntityIds")
		.or_else(|| suggestion.get("candidateEntityIds"))
		.and_then(Value::as_array)
		.map(|ids| {
			ids.iter()
				.filter_map(Value::as_str)
				.filter_map(|raw| raw.parse().ok())
				.collect()
		})
		.unwrap_or_default();
	let epic = create_epic_tx(tx, project_id, name, description, "ai").await?;

	// Every candidate gets a follow-up assignment review targeting the new
	// epic; dead candidates are silently skipped.
	for candidate_id in candidate_ids {
		let candidate = queries::fetch_entity(&mut **tx, candidate_id).await?;

		let Some(candidate) = candidate else {
			continue;
		};

		if candidate.deleted_at.is_some() {
			continue;
		}

		let inserted = queries::insert_pending_review(
			tx,
			NewReview {
				entity_id: Some(candidate_id),
				project_id: None,
				review_type: ReviewType::EpicAssignment.as_str(),
				ai_suggestion: json!({ "suggestedEpicId": epic.epic_id }),
				ai_confidence: review.ai_confidence,
			},
		)
		.await?;

		if let Some(inserted) = inserted {
			events.push(Event::ReviewQueueCreated {
				id: inserted.review_id,
				review_type: inserted.review_type,
				entity_id: inserted.entity_id,
				project_id: inserted.project_id,
			});
		}
	}

	push_stats_updated(events, Some(project_id));

	Ok(())
}

/// Reads an optional UUID field: a missing key or explicit null clears, a
/// present value must parse.
fn required_uuid(value: &Value, key: &str) -> Result<Option<Uuid>> {
	match value.get(key) {
		None | Some(Value::Null) => Ok(None),
		Some(raw) => raw
			.as_str()
			.and_then(|raw| raw.parse().ok())
			.map(Some)
			.ok_or_else(|| Error::validation(format!("{key} must be a UUID string."))),
	}
}

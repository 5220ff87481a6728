use serde_json::{Value, json};
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

use pm_bus::{Event, TxEvents};
use pm_domain::{
	confidence::{FieldConfidence, SuggestedField, partition},
	event::EntityEventType,
	evidence::{Evidence, derive_permalink},
	source::NoteSource,
};
use pm_jobs::{EnqueueJob, enqueue};
use pm_storage::{
	models::RawNote,
	queries::{self, NewEntityEvent, NewReview},
};

use crate::{
	Error, PmService, QUEUE_COMPUTE_EMBEDDINGS, QUEUE_ENTITIES_ORGANIZE, Result,
	entities::{NewEntity, insert_entity_tx},
	extraction::ExtractionOutput,
	organization::OrganizationOutput,
	projects::push_stats_updated,
};

impl PmService {
	/// Applies a Phase A output under one transaction: entities, evidence,
	/// sources, relationships, confidence-partitioned reviews, the processed
	/// flag, and one organize job per created entity. Rerunning against an
	/// already-processed note returns the previously created entity ids.
	pub async fn apply_extraction(
		&self,
		raw_note_id: Uuid,
		output: &ExtractionOutput,
		extraction_run_id: Uuid,
	) -> Result<Vec<Uuid>> {
		let threshold = self.cfg.review.confidence_threshold;
		let mut tx = self.db.pool.begin().await?;
		let mut events = TxEvents::new();
		let note = sqlx::query_as::<_, RawNote>(
			"SELECT raw_note_id, content, source, source_meta, external_id, captured_at, \
			 captured_by, processed, processed_at, dedupe_hash, created_at, updated_at \
			 FROM raw_notes WHERE raw_note_id = $1 FOR UPDATE",
		)
		.bind(raw_note_id)
		.fetch_optional(&mut *tx)
		.await?
		.ok_or_else(|| Error::not_found(format!("Raw note {raw_note_id} does not exist.")))?;

		if note.processed {
			let existing: Vec<(Uuid,)> = sqlx::query_as(
				"SELECT entity_id FROM entity_sources WHERE raw_note_id = $1",
			)
			.bind(raw_note_id)
			.fetch_all(&mut *tx)
			.await?;

			tx.commit().await?;

			return Ok(existing.into_iter().map(|(id,)| id).collect());
		}

		let source: NoteSource = note
			.source
			.parse()
			.map_err(|_| Error::conflict("Raw note row carries an unknown source."))?;
		let mut created_ids = Vec::with_capacity(output.entities.len());

		for extracted in &output.entities {
			let type_confidence = extracted
				.field_confidences
				.get("type")
				.copied()
				.unwrap_or(extracted.confidence);
			let mut fields = vec![FieldConfidence {
				field: SuggestedField::EntityType,
				value: json!({ "suggestedType": extracted.kind.as_str() }),
				confidence: type_confidence,
				evidence_refs: Vec::new(),
			}];

			if extracted.confidence < threshold {
				fields.push(FieldConfidence {
					field: SuggestedField::Overall,
					value: json!({
						"reason": "Entity confidence is below the review threshold.",
						"confidence": extracted.confidence,
					}),
					confidence: extracted.confidence,
					evidence_refs: Vec::new(),
				});
			}

			let split = partition(fields, threshold);
			let status = match extracted.status.as_deref() {
				Some(status) if extracted.kind.is_valid_status(status) => status.to_string(),
				_ => extracted.kind.default_status().to_string(),
			};
			let evidence: Vec<Evidence> = extracted
				.evidence
				.iter()
				.map(|item| Evidence {
					raw_note_id,
					quote: item.quote.clone(),
					start_offset: item.start_offset,
					end_offset: item.end_offset,
					permalink: derive_permalink(source, &note.source_meta, item.start_offset),
				})
				.collect();
			let ai_meta = json!({
				"model": self.cfg.llm.extraction_model,
				"promptVersion": self.cfg.llm.prompt_version,
				"extractionRunId": extraction_run_id,
				"fieldConfidences": extracted.field_confidences,
			});
			let evidence_json = serde_json::to_value(&evidence)
				.map_err(|err| Error::validation(format!("Evidence serialization failed: {err}.")))?;
			let entity = insert_entity_tx(
				&mut tx,
				&mut events,
				NewEntity {
					kind: extracted.kind,
					content: extracted.content.clone(),
					status,
					project_id: None,
					epic_id: None,
					parent_task_id: None,
					assignee_id: None,
					confidence: extracted.confidence,
					attributes: extracted.attributes.clone(),
					ai_meta: Some(ai_meta),
					evidence: evidence_json,
					actor_user_id: None,
					raw_note_id: Some(raw_note_id),
				},
			)
			.await?;

			sqlx::query(
				"INSERT INTO entity_sources (entity_id, raw_note_id) VALUES ($1, $2) \
				 ON CONFLICT DO NOTHING",
			)
			.bind(entity.entity_id)
			.bind(raw_note_id)
			.execute(&mut *tx)
			.await?;

			for field in &split.review {
				self.insert_review_tx(&mut tx, &mut events, Some(entity.entity_id), None, field)
					.await?;
			}

			let organize_key = format!("organize:{}", entity.entity_id);
			let embeddings_key = format!("embeddings:{}", entity.entity_id);
			let dedup_window =
				time::Duration::milliseconds(self.cfg.jobs.dedup_window_ms as i64);

			enqueue(
				&mut tx,
				EnqueueJob {
					queue: QUEUE_ENTITIES_ORGANIZE,
					job_key: Some(&organize_key),
					payload: json!({ "entityId": entity.entity_id }),
					max_attempts: 4,
					dedup_window,
				},
			)
			.await?;
			enqueue(
				&mut tx,
				EnqueueJob {
					queue: QUEUE_COMPUTE_EMBEDDINGS,
					job_key: Some(&embeddings_key),
					payload: json!({ "entityId": entity.entity_id }),
					max_attempts: 3,
					dedup_window,
				},
			)
			.await?;

			created_ids.push(entity.entity_id);
		}

		for relationship in &output.relationships {
			let (Some(source_id), Some(target_id)) = (
				created_ids.get(relationship.source_index).copied(),
				created_ids.get(relationship.target_index).copied(),
			) else {
				warn!(
					raw_note_id = %raw_note_id,
					"Skipping relationship with out-of-range index.",
				);

				continue;
			};

			sqlx::query(
				"INSERT INTO entity_relationships (relationship_id, source_id, target_id, type) \
				 VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING",
			)
			.bind(Uuid::new_v4())
			.bind(source_id)
			.bind(target_id)
			.bind(relationship.rel_type.as_str())
			.execute(&mut *tx)
			.await?;
		}

		sqlx::query(
			"UPDATE raw_notes SET processed = TRUE, processed_at = $1 WHERE raw_note_id = $2",
		)
		.bind(OffsetDateTime::now_utc())
		.bind(raw_note_id)
		.execute(&mut *tx)
		.await?;

		events.push(Event::RawNoteProcessed { raw_note_id, entity_ids: created_ids.clone() });
		self.commit_with_events(tx, events).await?;

		Ok(created_ids)
	}

	/// Applies a Phase B output: high-confidence assignments land on the
	/// entity row, everything else becomes pending review items. The partial
	/// unique index makes the review inserts idempotent.
	pub async fn apply_organization(
		&self,
		entity_id: Uuid,
		output: &OrganizationOutput,
	) -> Result<()> {
		let threshold = self.cfg.review.confidence_threshold;
		let mut tx = self.db.pool.begin().await?;
		let mut events = TxEvents::new();
		let entity = queries::fetch_entity_for_update(&mut tx, entity_id)
			.await?
			.ok_or_else(|| Error::not_found(format!("Entity {entity_id} does not exist.")))?;

		if entity.deleted_at.is_some() {
			tx.commit().await?;

			return Ok(());
		}

		let mut fields = Vec::new();

		if let Some(project) = output.project {
			fields.push(FieldConfidence {
				field: SuggestedField::Project,
				value: json!({ "suggestedProjectId": project.id }),
				confidence: project.confidence,
				evidence_refs: Vec::new(),
			});
		}
		if let Some(epic) = output.epic {
			fields.push(FieldConfidence {
				field: SuggestedField::Epic,
				value: json!({ "suggestedEpicId": epic.id }),
				confidence: epic.confidence,
				evidence_refs: Vec::new(),
			});
		}
		if let Some(assignee) = output.assignee {
			fields.push(FieldConfidence {
				field: SuggestedField::Assignee,
				value: json!({ "suggestedAssigneeId": assignee.id }),
				confidence: assignee.confidence,
				evidence_refs: Vec::new(),
			});
		}

		for duplicate in &output.duplicates {
			fields.push(FieldConfidence {
				field: SuggestedField::DuplicateOf,
				value: json!({
					"duplicateEntityId": duplicate.entity_id,
					"similarityScore": duplicate.similarity_score,
					"reason": duplicate.reason,
				}),
				confidence: duplicate.confidence,
				evidence_refs: Vec::new(),
			});
		}
		for proposal in &output.epic_proposals {
			fields.push(FieldConfidence {
				field: SuggestedField::EpicProposal,
				value: json!({
					"proposedEpicName": proposal.name,
					"proposedEpicDescription": proposal.description,
					"proposedEpicProjectId": proposal.project_id,
					"candidateEntityIds": proposal.candidate_entity_ids,
				}),
				confidence: proposal.confidence,
				evidence_refs: Vec::new(),
			});
		}

		let mut split = partition(fields, threshold);
		let mut project_id = entity.project_id;
		let mut epic_id = entity.epic_id;
		let mut assignee_id = entity.assignee_id;
		let mut demoted = Vec::new();

		for field in &split.apply {
			match field.field {
				SuggestedField::Project => {
					let Some(id) = field_uuid(&field.value, "suggestedProjectId") else {
						continue;
					};
					let project = queries::fetch_project(&mut *tx, id).await?;

					match project {
						Some(project) if project.deleted_at.is_none() => project_id = Some(id),
						// A vanished referent is a bad suggestion, not a bad
						// entity; send it to review instead of failing.
						_ => demoted.push(field.clone()),
					}
				},
				SuggestedField::Epic => {
					let Some(id) = field_uuid(&field.value, "suggestedEpicId") else {
						continue;
					};
					let epic = queries::fetch_epic(&mut *tx, id).await?;

					match epic {
						Some(epic) if epic.deleted_at.is_none() => {
							if project_id.is_none() {
								project_id = Some(epic.project_id);
							}
							if project_id == Some(epic.project_id) {
								epic_id = Some(id);
							} else {
								demoted.push(field.clone());
							}
						},
						_ => demoted.push(field.clone()),
					}
				},
				SuggestedField::Assignee => {
					let Some(id) = field_uuid(&field.value, "suggestedAssigneeId") else {
						continue;
					};
					let known: Option<(Uuid,)> =
						sqlx::query_as("SELECT user_id FROM users WHERE user_id = $1")
							.bind(id)
							.fetch_optional(&mut *tx)
							.await?;

					match known {
						Some(_) => assignee_id = Some(id),
						None => demoted.push(field.clone()),
					}
				},
				_ => demoted.push(field.clone()),
			}
		}

		split.review.append(&mut demoted);

		let changed = project_id != entity.project_id
			|| epic_id != entity.epic_id
			|| assignee_id != entity.assignee_id;

		if changed {
			sqlx::query(
				"UPDATE entities SET project_id = $1, epic_id = $2, assignee_id = $3 \
				 WHERE entity_id = $4",
			)
			.bind(project_id)
			.bind(epic_id)
			.bind(assignee_id)
			.bind(entity_id)
			.execute(&mut *tx)
			.await?;

			if assignee_id != entity.assignee_id {
				let event = queries::insert_entity_event(
					&mut tx,
					NewEntityEvent {
						entity_id,
						event_type: EntityEventType::AssignmentChange.as_str(),
						actor_user_id: None,
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
					entity_id,
					event_id: event.event_id,
					event_type: event.r#type,
				});
			}

			events.push(Event::EntityUpdated { id: entity_id });

			if project_id != entity.project_id {
				push_stats_updated(&mut events, entity.project_id);
				push_stats_updated(&mut events, project_id);
			}
		}

		for field in &split.review {
			self.insert_review_tx(&mut tx, &mut events, Some(entity_id), None, field).await?;
		}

		self.commit_with_events(tx, events).await?;

		Ok(())
	}

	/// One review insert plus its bus event; silent when the pending
	/// uniqueness index absorbs a duplicate.
	pub(crate) async fn insert_review_tx(
		&self,
		tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
		events: &mut TxEvents,
		entity_id: Option<Uuid>,
		project_id: Option<Uuid>,
		field: &FieldConfidence,
	) -> Result<()> {
		let review = queries::insert_pending_review(
			tx,
			NewReview {
				entity_id,
				project_id,
				review_type: field.field.review_type().as_str(),
				ai_suggestion: field.value.clone(),
				ai_confidence: field.confidence,
			},
		)
		.await?;

		if let Some(review) = review {
			events.push(Event::ReviewQueueCreated {
				id: review.review_id,
				review_type: review.review_type,
				entity_id: review.entity_id,
				project_id: review.project_id,
			});
		}

		Ok(())
	}
}

fn field_uuid(value: &Value, key: &str) -> Option<Uuid> {
	value.get(key).and_then(Value::as_str).and_then(|raw| raw.parse().ok())
}

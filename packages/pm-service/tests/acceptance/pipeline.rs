use serde_json::json;
use uuid::Uuid;

use pm_domain::source::NoteSource;
use pm_service::{capture::CaptureRequest, organization::validate_organization};

use crate::{SKIP_MESSAGE, SpyLlm, build_service, count_rows, create_project, test_db};

/// The extraction payload for the onboarding note: a decided decision, a
/// captured task, and a pending decision.
fn extraction_payload() -> serde_json::Value {
	json!({
		"entities": [
			{
				"type": "decision",
				"content": "Switch onboarding from 5 to 3 steps",
				"status": "decided",
				"attributes": {},
				"fieldConfidences": {"type": 0.97, "content": 0.95, "status": 0.95},
				"confidence": 0.95,
				"evidence": [{"quote": "switch onboarding from 5 to 3 steps"}]
			},
			{
				"type": "task",
				"content": "Take point on the onboarding change",
				"status": "captured",
				"attributes": {},
				"fieldConfidences": {"type": 0.94, "content": 0.92, "status": 0.93},
				"confidence": 0.92,
				"evidence": [{"quote": "@maria take point"}]
			},
			{
				"type": "decision",
				"content": "Keep progress bar or switch to stepper",
				"status": "pending",
				"attributes": {"options": ["progress bar", "stepper"]},
				"fieldConfidences": {"type": 0.93, "content": 0.9, "status": 0.95},
				"confidence": 0.9,
				"evidence": [{"quote": "Keep progress bar or stepper?"}]
			}
		],
		"relationships": [
			{"sourceIndex": 1, "targetIndex": 0, "type": "derived_from"}
		]
	})
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set PM_PG_DSN to run."]
async fn extract_then_organize_produces_entities_and_reviews() {
	let Some(test_db) = test_db().await else {
		eprintln!("{SKIP_MESSAGE}");

		return;
	};
	let llm = SpyLlm::new(vec![extraction_payload()]);
	let (service, _bus) = build_service(test_db.dsn(), llm.clone()).await;
	let project_id = create_project(&service, "Onboarding").await;
	let captured = service
		.capture_note(CaptureRequest {
			content:
				"We should switch onboarding from 5 to 3 steps. @maria take point. Keep progress bar or stepper?"
					.to_string(),
			source: NoteSource::Slack,
			source_meta: json!({ "channelId": "C1", "messageTs": "1.0" }),
			captured_at: None,
			external_id: Some("C1:1.0".to_string()),
			captured_by: None,
		})
		.await
		.expect("Capture failed.");
	let note = pm_storage::queries::fetch_raw_note(&service.db.pool, captured.note.id)
		.await
		.expect("Note fetch failed.")
		.expect("Note vanished.");
	let output = service.run_extraction(&note).await.expect("Extraction failed.");
	let entity_ids = service
		.apply_extraction(note.raw_note_id, &output, Uuid::new_v4())
		.await
		.expect("Materialization failed.");

	assert_eq!(entity_ids.len(), 3);
	assert_eq!(llm.call_count(), 1);

	// Rows in one transaction share a created_at; compare as a set.
	let mut statuses: Vec<(String, String)> =
		sqlx::query_as("SELECT type, status FROM entities")
			.fetch_all(&service.db.pool)
			.await
			.expect("Entity fetch failed.");

	statuses.sort();

	assert_eq!(statuses, vec![
		("decision".to_string(), "decided".to_string()),
		("decision".to_string(), "pending".to_string()),
		("task".to_string(), "captured".to_string()),
	]);

	// Evidence, sources, relationship, processed flag.
	for entity_id in &entity_ids {
		let sources =
			count_rows(&service, "SELECT count(*) FROM entity_sources WHERE entity_id = $1", *entity_id)
				.await;

		assert_eq!(sources, 1);
	}

	let relationships = count_rows(
		&service,
		"SELECT count(*) FROM entity_relationships WHERE source_id = $1",
		entity_ids[1],
	)
	.await;

	assert_eq!(relationships, 1);

	let processed = pm_storage::queries::fetch_raw_note(&service.db.pool, note.raw_note_id)
		.await
		.expect("Note fetch failed.")
		.expect("Note vanished.");

	assert!(processed.processed);
	assert!(processed.processed_at.is_some());

	// Rerunning materialization converges instead of duplicating.
	let rerun = service
		.apply_extraction(note.raw_note_id, &output, Uuid::new_v4())
		.await
		.expect("Rerun failed.");

	assert_eq!(rerun.len(), 3);

	let total_entities: i64 = sqlx::query_scalar("SELECT count(*) FROM entities")
		.fetch_one(&service.db.pool)
		.await
		.expect("Count failed.");

	assert_eq!(total_entities, 3);

	// Phase B with a hesitant project suggestion: every entity gets a
	// pending project_assignment review below the threshold.
	let organization = validate_organization(&json!({
		"suggestedProject": {"id": project_id.to_string(), "confidence": 0.6}
	}))
	.expect("Organization payload should validate.");

	for entity_id in &entity_ids {
		service
			.apply_organization(*entity_id, &organization)
			.await
			.expect("Organization apply failed.");
		// Idempotent: a second pass is absorbed by the pending uniqueness.
		service
			.apply_organization(*entity_id, &organization)
			.await
			.expect("Organization rerun failed.");

		let pending = count_rows(
			&service,
			"SELECT count(*) FROM review_queue WHERE entity_id = $1 \
			 AND review_type = 'project_assignment' AND status = 'pending'",
			*entity_id,
		)
		.await;

		assert_eq!(pending, 1);
	}

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set PM_PG_DSN to run."]
async fn confident_organization_applies_directly() {
	let Some(test_db) = test_db().await else {
		eprintln!("{SKIP_MESSAGE}");

		return;
	};
	let (service, _bus) = build_service(test_db.dsn(), SpyLlm::new(vec![])).await;
	let project_id = create_project(&service, "Payments").await;
	let entity_id = crate::create_task(&service, "Wire up the billing webhook").await;
	let organization = validate_organization(&json!({
		"suggestedProject": {"id": project_id.to_string(), "confidence": 0.97}
	}))
	.expect("Organization payload should validate.");

	service.apply_organization(entity_id, &organization).await.expect("Apply failed.");

	let entity = service.get_entity(entity_id).await.expect("Entity fetch failed.");

	assert_eq!(entity.project_id, Some(project_id));

	let reviews = count_rows(
		&service,
		"SELECT count(*) FROM review_queue WHERE entity_id = $1",
		entity_id,
	)
	.await;

	assert_eq!(reviews, 0, "a confident assignment needs no review");

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

use serde_json::json;

use pm_domain::review::ReviewStatus;
use pm_service::{entities::ListEntitiesRequest, lineage::LineageDirection, review::ResolveRequest};

use crate::{SKIP_MESSAGE, SpyLlm, build_service, create_task, seed_review, test_db};

#[tokio::test]
#[ignore = "Requires external Postgres. Set PM_PG_DSN to run."]
async fn accepted_duplicate_links_and_soft_deletes() {
	let Some(test_db) = test_db().await else {
		eprintln!("{SKIP_MESSAGE}");

		return;
	};
	let (service, _bus) = build_service(test_db.dsn(), SpyLlm::new(vec![])).await;
	let original = create_task(&service, "Fix login bug").await;
	let duplicate = create_task(&service, "Login is broken").await;
	let review_id = seed_review(
		&service,
		Some(duplicate),
		None,
		"duplicate_detection",
		json!({
			"duplicateEntityId": original,
			"similarityScore": 0.88,
			"reason": "Same login failure.",
		}),
		0.85,
	)
	.await;

	service
		.resolve_review(
			review_id,
			ResolveRequest {
				status: ReviewStatus::Accepted,
				user_resolution: None,
				training_comment: None,
			},
			None,
		)
		.await
		.expect("Resolution failed.");

	let relationship: i64 = sqlx::query_scalar(
		"SELECT count(*) FROM entity_relationships \
		 WHERE source_id = $1 AND target_id = $2 AND type = 'duplicate_of'",
	)
	.bind(duplicate)
	.bind(original)
	.fetch_one(&service.db.pool)
	.await
	.expect("Relationship count failed.");

	assert_eq!(relationship, 1);

	let deleted = service.get_entity(duplicate).await.expect("Entity fetch failed.");

	assert!(deleted.deleted_at.is_some());

	// Gone from default lists, still reachable with includeDeleted.
	let live = service
		.list_entities(ListEntitiesRequest::default())
		.await
		.expect("List failed.");

	assert!(live.items.iter().all(|entity| entity.id != duplicate));

	let all = service
		.list_entities(ListEntitiesRequest { include_deleted: true, ..Default::default() })
		.await
		.expect("List failed.");

	assert!(all.items.iter().any(|entity| entity.id == duplicate));

	// Lineage from the surviving entity shows the duplicate as incoming.
	let lineage = service
		.lineage(original, LineageDirection::Down, None)
		.await
		.expect("Lineage failed.");

	assert!(lineage.nodes.iter().any(|node| node.entity_id == duplicate));

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set PM_PG_DSN to run."]
async fn rejected_duplicate_changes_nothing() {
	let Some(test_db) = test_db().await else {
		eprintln!("{SKIP_MESSAGE}");

		return;
	};
	let (service, _bus) = build_service(test_db.dsn(), SpyLlm::new(vec![])).await;
	let original = create_task(&service, "Fix login bug").await;
	let duplicate = create_task(&service, "Login is broken").await;
	let review_id = seed_review(
		&service,
		Some(duplicate),
		None,
		"duplicate_detection",
		json!({
			"duplicateEntityId": original,
			"similarityScore": 0.5,
			"reason": "Might be the same.",
		}),
		0.5,
	)
	.await;

	service
		.resolve_review(
			review_id,
			ResolveRequest {
				status: ReviewStatus::Rejected,
				user_resolution: None,
				training_comment: Some("different subsystems".to_string()),
			},
			None,
		)
		.await
		.expect("Resolution failed.");

	let entity = service.get_entity(duplicate).await.expect("Entity fetch failed.");

	assert!(entity.deleted_at.is_none());

	let relationships: i64 = sqlx::query_scalar(
		"SELECT count(*) FROM entity_relationships WHERE source_id = $1",
	)
	.bind(duplicate)
	.fetch_one(&service.db.pool)
	.await
	.expect("Relationship count failed.");

	assert_eq!(relationships, 0);

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

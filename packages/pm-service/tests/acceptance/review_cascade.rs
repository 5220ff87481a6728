use serde_json::json;

use pm_domain::review::ReviewStatus;
use pm_service::review::ResolveRequest;

use crate::{SKIP_MESSAGE, SpyLlm, build_service, create_project, create_task, seed_review, test_db};

#[tokio::test]
#[ignore = "Requires external Postgres. Set PM_PG_DSN to run."]
async fn type_change_resets_status_and_rejects_sibling_reviews() {
	let Some(test_db) = test_db().await else {
		eprintln!("{SKIP_MESSAGE}");

		return;
	};
	let (service, _bus) = build_service(test_db.dsn(), SpyLlm::new(vec![])).await;
	let project_id = create_project(&service, "Onboarding").await;
	let entity_id = create_task(&service, "Decide on the stepper").await;
	let type_review = seed_review(
		&service,
		Some(entity_id),
		None,
		"type_classification",
		json!({ "suggestedType": "decision" }),
		0.6,
	)
	.await;
	let project_review = seed_review(
		&service,
		Some(entity_id),
		None,
		"project_assignment",
		json!({ "suggestedProjectId": project_id }),
		0.5,
	)
	.await;
	let assignee_review = seed_review(
		&service,
		Some(entity_id),
		None,
		"assignee_suggestion",
		json!({ "suggestedAssigneeId": null }),
		0.4,
	)
	.await;
	let resolved = service
		.resolve_review(
			type_review,
			ResolveRequest {
				status: ReviewStatus::Accepted,
				user_resolution: None,
				training_comment: None,
			},
			None,
		)
		.await
		.expect("Resolution failed.");

	assert_eq!(resolved.status, "accepted");

	let entity = service.get_entity(entity_id).await.expect("Entity fetch failed.");

	assert_eq!(entity.entity_type, "decision");
	assert_eq!(entity.status, "pending", "type change resets to the new default status");

	// The cascade auto-rejected the siblings without user attribution.
	for review_id in [project_review, assignee_review] {
		let (status, resolved_at, resolved_by): (String, Option<time::OffsetDateTime>, Option<uuid::Uuid>) =
			sqlx::query_as(
				"SELECT status, resolved_at, resolved_by FROM review_queue WHERE review_id = $1",
			)
			.bind(review_id)
			.fetch_one(&service.db.pool)
			.await
			.expect("Review fetch failed.");

		assert_eq!(status, "rejected");
		assert!(resolved_at.is_some());
		assert!(resolved_by.is_none());
	}

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set PM_PG_DSN to run."]
async fn second_resolution_conflicts() {
	let Some(test_db) = test_db().await else {
		eprintln!("{SKIP_MESSAGE}");

		return;
	};
	let (service, _bus) = build_service(test_db.dsn(), SpyLlm::new(vec![])).await;
	let entity_id = create_task(&service, "Dedupe the webhook retries").await;
	let review_id = seed_review(
		&service,
		Some(entity_id),
		None,
		"low_confidence",
		json!({ "reason": "overall confidence 0.4" }),
		0.4,
	)
	.await;
	let accept = ResolveRequest {
		status: ReviewStatus::Accepted,
		user_resolution: None,
		training_comment: Some("good catch".to_string()),
	};

	service
		.resolve_review(review_id, accept.clone(), None)
		.await
		.expect("First resolution failed.");

	let err = service
		.resolve_review(review_id, accept, None)
		.await
		.expect_err("Second resolution must fail.");

	assert!(matches!(err, pm_service::Error::Conflict { .. }));

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

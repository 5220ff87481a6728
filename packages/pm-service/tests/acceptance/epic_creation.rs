use serde_json::json;
use uuid::Uuid;

use pm_domain::review::ReviewStatus;
use pm_service::review::ResolveRequest;

use crate::{SKIP_MESSAGE, SpyLlm, build_service, create_project, create_task, seed_review, test_db};

#[tokio::test]
#[ignore = "Requires external Postgres. Set PM_PG_DSN to run."]
async fn accepting_an_epic_proposal_creates_the_epic_and_follow_up_reviews() {
	let Some(test_db) = test_db().await else {
		eprintln!("{SKIP_MESSAGE}");

		return;
	};
	let (service, _bus) = build_service(test_db.dsn(), SpyLlm::new(vec![])).await;
	let project_id = create_project(&service, "Platform").await;
	let first = create_task(&service, "Add the payments webhook").await;
	let second = create_task(&service, "Reconcile payouts nightly").await;
	let review_id = seed_review(
		&service,
		Some(first),
		None,
		"epic_creation",
		json!({
			"proposedEpicName": "Payments",
			"proposedEpicProjectId": project_id,
			"candidateEntityIds": [first, second],
		}),
		0.7,
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

	let (epic_id, created_by): (Uuid, String) = sqlx::query_as(
		"SELECT epic_id, created_by FROM epics WHERE project_id = $1 AND name = 'Payments'",
	)
	.bind(project_id)
	.fetch_one(&service.db.pool)
	.await
	.expect("Epic fetch failed.");

	assert_eq!(created_by, "ai");

	for entity_id in [first, second] {
		let (suggestion,): (serde_json::Value,) = sqlx::query_as(
			"SELECT ai_suggestion FROM review_queue \
			 WHERE entity_id = $1 AND review_type = 'epic_assignment' AND status = 'pending'",
		)
		.bind(entity_id)
		.fetch_one(&service.db.pool)
		.await
		.expect("Follow-up review missing.");

		assert_eq!(
			suggestion["suggestedEpicId"].as_str(),
			Some(epic_id.to_string().as_str()),
		);
	}

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set PM_PG_DSN to run."]
async fn accepting_epic_assignment_pulls_the_project_along() {
	let Some(test_db) = test_db().await else {
		eprintln!("{SKIP_MESSAGE}");

		return;
	};
	let (service, _bus) = build_service(test_db.dsn(), SpyLlm::new(vec![])).await;
	let project_id = create_project(&service, "Platform").await;
	let epic = service
		.create_epic(pm_service::epics::CreateEpicRequest {
			project_id,
			name: "Payments".to_string(),
			description: None,
		})
		.await
		.expect("Epic creation failed.");
	let entity_id = create_task(&service, "Add the payments webhook").await;
	let review_id = seed_review(
		&service,
		Some(entity_id),
		None,
		"epic_assignment",
		json!({ "suggestedEpicId": epic.id }),
		0.8,
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

	let entity = service.get_entity(entity_id).await.expect("Entity fetch failed.");

	assert_eq!(entity.epic_id, Some(epic.id));
	assert_eq!(entity.project_id, Some(project_id), "epic carries its project");

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

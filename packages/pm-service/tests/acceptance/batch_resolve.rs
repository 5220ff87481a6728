use serde_json::json;

use pm_domain::review::ReviewStatus;
use pm_service::review::{BatchResolution, BatchResolveRequest, BatchOutcomeKind};

use crate::{SKIP_MESSAGE, SpyLlm, build_service, create_project, create_task, seed_review, test_db};

#[tokio::test]
#[ignore = "Requires external Postgres. Set PM_PG_DSN to run."]
async fn batch_keeps_earlier_effects_and_skips_after_a_failure() {
	let Some(test_db) = test_db().await else {
		eprintln!("{SKIP_MESSAGE}");

		return;
	};
	let (service, _bus) = build_service(test_db.dsn(), SpyLlm::new(vec![])).await;
	let project_a = create_project(&service, "Alpha").await;
	let project_b = create_project(&service, "Beta").await;
	let foreign_epic = service
		.create_epic(pm_service::epics::CreateEpicRequest {
			project_id: project_b,
			name: "Elsewhere".to_string(),
			description: None,
		})
		.await
		.expect("Epic creation failed.");
	let first = create_task(&service, "First task").await;
	let second = create_task(&service, "Second task").await;
	let third = create_task(&service, "Third task").await;

	// Pin the second entity to project A so the foreign epic cannot attach.
	let r1 = seed_review(
		&service,
		Some(first),
		None,
		"project_assignment",
		json!({ "suggestedProjectId": project_a }),
		0.6,
	)
	.await;
	let pin = seed_review(
		&service,
		Some(second),
		None,
		"project_assignment",
		json!({ "suggestedProjectId": project_a }),
		0.6,
	)
	.await;

	service
		.resolve_review(
			pin,
			pm_service::review::ResolveRequest {
				status: ReviewStatus::Accepted,
				user_resolution: None,
				training_comment: None,
			},
			None,
		)
		.await
		.expect("Pin resolution failed.");

	let r2 = seed_review(
		&service,
		Some(second),
		None,
		"epic_assignment",
		json!({ "suggestedEpicId": foreign_epic.id }),
		0.6,
	)
	.await;
	let r3 = seed_review(
		&service,
		Some(third),
		None,
		"project_assignment",
		json!({ "suggestedProjectId": project_a }),
		0.6,
	)
	.await;
	let outcomes = service
		.resolve_batch(
			BatchResolveRequest {
				resolutions: vec![
					BatchResolution {
						id: r1,
						status: ReviewStatus::Accepted,
						user_resolution: None,
						training_comment: None,
					},
					BatchResolution {
						id: r2,
						status: ReviewStatus::Accepted,
						user_resolution: None,
						training_comment: None,
					},
					BatchResolution {
						id: r3,
						status: ReviewStatus::Accepted,
						user_resolution: None,
						training_comment: None,
					},
				],
			},
			None,
		)
		.await
		.expect("Batch resolve failed.");

	assert_eq!(outcomes.len(), 3);
	assert_eq!(outcomes[0].outcome, BatchOutcomeKind::Applied);
	assert_eq!(outcomes[1].outcome, BatchOutcomeKind::Failed);
	assert!(outcomes[1].error.is_some());
	assert_eq!(outcomes[2].outcome, BatchOutcomeKind::Skipped);

	// r1's effect is retained, r2's is rolled back, r3 never ran.
	let first_entity = service.get_entity(first).await.expect("Entity fetch failed.");
	let second_entity = service.get_entity(second).await.expect("Entity fetch failed.");
	let third_entity = service.get_entity(third).await.expect("Entity fetch failed.");

	assert_eq!(first_entity.project_id, Some(project_a));
	assert_eq!(second_entity.epic_id, None);
	assert_eq!(third_entity.project_id, None);

	let (r3_status,): (String,) =
		sqlx::query_as("SELECT status FROM review_queue WHERE review_id = $1")
			.bind(r3)
			.fetch_one(&service.db.pool)
			.await
			.expect("Review fetch failed.");

	assert_eq!(r3_status, "pending", "skipped items stay pending");

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

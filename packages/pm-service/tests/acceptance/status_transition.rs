use crate::{SKIP_MESSAGE, SpyLlm, build_service, count_rows, create_task, test_db};

#[tokio::test]
#[ignore = "Requires external Postgres. Set PM_PG_DSN to run."]
async fn same_status_transition_is_a_no_op() {
	let Some(test_db) = test_db().await else {
		eprintln!("{SKIP_MESSAGE}");

		return;
	};
	let (service, _bus) = build_service(test_db.dsn(), SpyLlm::new(vec![])).await;
	let entity_id = create_task(&service, "Write the changelog").await;
	let view = service
		.transition_entity_status(entity_id, "captured", None)
		.await
		.expect("No-op transition failed.");

	assert_eq!(view.status, "captured");

	let status_changes = count_rows(
		&service,
		"SELECT count(*) FROM entity_events WHERE entity_id = $1 AND type = 'status_change'",
		entity_id,
	)
	.await;

	assert_eq!(status_changes, 0, "no event for old = new");

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set PM_PG_DSN to run."]
async fn real_transition_writes_one_ordered_event() {
	let Some(test_db) = test_db().await else {
		eprintln!("{SKIP_MESSAGE}");

		return;
	};
	let (service, _bus) = build_service(test_db.dsn(), SpyLlm::new(vec![])).await;
	let entity_id = create_task(&service, "Write the changelog").await;

	service
		.transition_entity_status(entity_id, "in_progress", None)
		.await
		.expect("Transition failed.");
	service
		.transition_entity_status(entity_id, "done", None)
		.await
		.expect("Transition failed.");

	let transitions: Vec<(Option<String>, Option<String>)> = sqlx::query_as(
		"SELECT old_status, new_status FROM entity_events \
		 WHERE entity_id = $1 AND type = 'status_change' ORDER BY created_at, event_id",
	)
	.bind(entity_id)
	.fetch_all(&service.db.pool)
	.await
	.expect("Event fetch failed.");

	assert_eq!(transitions, vec![
		(Some("captured".to_string()), Some("in_progress".to_string())),
		(Some("in_progress".to_string()), Some("done".to_string())),
	]);

	let err = service
		.transition_entity_status(entity_id, "decided", None)
		.await
		.expect_err("Cross-type status must be rejected.");

	assert!(matches!(err, pm_service::Error::Validation { .. }));

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

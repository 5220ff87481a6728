use std::collections::HashSet;

use serde_json::json;
use time::macros::datetime;
use uuid::Uuid;

use pm_domain::source::NoteSource;
use pm_service::{capture::CaptureRequest, notes::ListNotesRequest};

use crate::{SKIP_MESSAGE, SpyLlm, build_service, test_db};

#[tokio::test]
#[ignore = "Requires external Postgres. Set PM_PG_DSN to run."]
async fn cursor_pages_neither_skip_nor_repeat_across_equal_timestamps() {
	let Some(test_db) = test_db().await else {
		eprintln!("{SKIP_MESSAGE}");

		return;
	};
	let (service, _bus) = build_service(test_db.dsn(), SpyLlm::new(vec![])).await;
	// Five notes captured at the same millisecond; only the id tiebreaker
	// separates them.
	let captured_at = datetime!(2026-02-06 12:00:00.000 UTC);
	let mut all_ids = HashSet::new();

	for idx in 0..5 {
		let response = service
			.capture_note(CaptureRequest {
				content: format!("note number {idx}"),
				source: NoteSource::Api,
				source_meta: json!({}),
				captured_at: Some(captured_at),
				external_id: Some(format!("page-test-{idx}")),
				captured_by: None,
			})
			.await
			.expect("Capture failed.");

		all_ids.insert(response.note.id);
	}

	let mut seen: Vec<Uuid> = Vec::new();
	let mut cursor: Option<String> = None;

	loop {
		let page = service
			.list_notes(ListNotesRequest {
				limit: Some(2),
				cursor: cursor.clone(),
				since: None,
				until: None,
			})
			.await
			.expect("List failed.");

		seen.extend(page.items.iter().map(|note| note.id));

		match page.next_cursor {
			Some(next) => cursor = Some(next),
			None => break,
		}
	}

	assert_eq!(seen.len(), 5, "no note may repeat or vanish: {seen:?}");
	assert_eq!(seen.iter().copied().collect::<HashSet<_>>(), all_ids);

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set PM_PG_DSN to run."]
async fn limit_bounds_are_enforced() {
	let Some(test_db) = test_db().await else {
		eprintln!("{SKIP_MESSAGE}");

		return;
	};
	let (service, _bus) = build_service(test_db.dsn(), SpyLlm::new(vec![])).await;
	let err = service
		.list_notes(ListNotesRequest { limit: Some(0), ..Default::default() })
		.await
		.expect_err("limit 0 must be rejected.");

	assert!(matches!(err, pm_service::Error::Validation { .. }));

	let page = service
		.list_notes(ListNotesRequest { limit: Some(250), ..Default::default() })
		.await
		.expect("List failed.");

	assert_eq!(page.limit, 100, "over-limit requests clamp and report it");

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

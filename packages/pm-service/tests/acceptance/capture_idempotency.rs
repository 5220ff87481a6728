use serde_json::json;

use pm_domain::source::NoteSource;
use pm_service::capture::CaptureRequest;
use time::macros::datetime;

use crate::{SKIP_MESSAGE, SpyLlm, build_service, test_db};

fn slack_capture() -> CaptureRequest {
	CaptureRequest {
		content:
			"We should switch onboarding from 5 to 3 steps. @maria take point. Keep progress bar or stepper?"
				.to_string(),
		source: NoteSource::Slack,
		source_meta: json!({ "channelId": "C1", "messageTs": "1.0" }),
		captured_at: Some(datetime!(2026-02-06 15:45:00 UTC)),
		external_id: Some("C1:1.0".to_string()),
		captured_by: None,
	}
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set PM_PG_DSN to run."]
async fn repeated_capture_returns_the_same_note_and_enqueues_once() {
	let Some(test_db) = test_db().await else {
		eprintln!("{SKIP_MESSAGE}");

		return;
	};
	let (service, _bus) = build_service(test_db.dsn(), SpyLlm::new(vec![])).await;
	let first = service.capture_note(slack_capture()).await.expect("First capture failed.");
	let second = service.capture_note(slack_capture()).await.expect("Second capture failed.");

	assert!(!first.deduped);
	assert!(second.deduped);
	assert_eq!(first.note.id, second.note.id);

	let extract_jobs: i64 = sqlx::query_scalar(
		"SELECT count(*) FROM jobs WHERE queue = 'notes:extract'",
	)
	.fetch_one(&service.db.pool)
	.await
	.expect("Job count failed.");

	assert_eq!(extract_jobs, 1, "only the first capture enqueues extraction");

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set PM_PG_DSN to run."]
async fn dedupe_hash_collapses_captures_without_external_id() {
	let Some(test_db) = test_db().await else {
		eprintln!("{SKIP_MESSAGE}");

		return;
	};
	let (service, _bus) = build_service(test_db.dsn(), SpyLlm::new(vec![])).await;
	let request = CaptureRequest {
		content: "ship the release notes".to_string(),
		source: NoteSource::Cli,
		source_meta: json!({}),
		captured_at: None,
		external_id: None,
		captured_by: None,
	};
	let first = service.capture_note(request.clone()).await.expect("First capture failed.");
	let second = service.capture_note(request).await.expect("Second capture failed.");

	assert!(second.deduped);
	assert_eq!(first.note.id, second.note.id);

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set PM_PG_DSN to run."]
async fn empty_content_is_rejected() {
	let Some(test_db) = test_db().await else {
		eprintln!("{SKIP_MESSAGE}");

		return;
	};
	let (service, _bus) = build_service(test_db.dsn(), SpyLlm::new(vec![])).await;
	let request = CaptureRequest {
		content: "   ".to_string(),
		source: NoteSource::Cli,
		source_meta: json!({}),
		captured_at: None,
		external_id: None,
		captured_by: None,
	};
	let err = service.capture_note(request).await.expect_err("Empty content must be rejected.");

	assert!(matches!(err, pm_service::Error::Validation { .. }));

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[path = "acceptance/batch_resolve.rs"]
mod batch_resolve;
#[path = "acceptance/capture_idempotency.rs"]
mod capture_idempotency;
#[path = "acceptance/duplicate_detection.rs"]
mod duplicate_detection;
#[path = "acceptance/epic_creation.rs"]
mod epic_creation;
#[path = "acceptance/pagination.rs"]
mod pagination;
#[path = "acceptance/pipeline.rs"]
mod pipeline;
#[path = "acceptance/review_cascade.rs"]
mod review_cascade;
#[path = "acceptance/status_transition.rs"]
mod status_transition;

use std::{
	collections::VecDeque,
	sync::{
		Arc, Mutex,
		atomic::{AtomicUsize, Ordering},
	},
};

use serde_json::{Value, json};
use uuid::Uuid;

use pm_bus::Bus;
use pm_config::Config;
use pm_providers::{BoxFuture, ToolUseProvider, ToolUseRequest};
use pm_service::PmService;
use pm_storage::db::Db;
use pm_testkit::TestDatabase;

pub const SKIP_MESSAGE: &str = "Skipping acceptance test; set PM_PG_DSN to run it.";

pub async fn test_db() -> Option<TestDatabase> {
	let dsn = std::env::var("PM_PG_DSN").ok()?;

	Some(TestDatabase::new(&dsn).await.expect("Failed to create test database."))
}

/// Canned tool-use provider: returns queued payloads in order, then empty
/// extractions, counting every call.
pub struct SpyLlm {
	pub calls: AtomicUsize,
	payloads: Mutex<VecDeque<Value>>,
}

impl SpyLlm {
	pub fn new(payloads: Vec<Value>) -> Arc<Self> {
		Arc::new(Self {
			calls: AtomicUsize::new(0),
			payloads: Mutex::new(payloads.into()),
		})
	}

	pub fn call_count(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}
}

impl ToolUseProvider for SpyLlm {
	fn invoke<'a>(&'a self, _req: ToolUseRequest<'a>) -> BoxFuture<'a, pm_providers::Result<Value>> {
		self.calls.fetch_add(1, Ordering::SeqCst);

		let next = self
			.payloads
			.lock()
			.unwrap_or_else(|err| err.into_inner())
			.pop_front()
			.unwrap_or_else(|| json!({ "entities": [], "relationships": [] }));

		Box::pin(async move { Ok(next) })
	}
}

pub async fn build_service(
	dsn: &str,
	llm: Arc<dyn ToolUseProvider>,
) -> (Arc<PmService>, Arc<Bus>) {
	let mut cfg = Config::default();

	cfg.storage.postgres.dsn = dsn.to_string();
	cfg.storage.postgres.pool_max_conns = 5;
	cfg.auth.disabled = true;

	let db = Db::connect(&cfg.storage.postgres).await.expect("Failed to connect.");

	db.ensure_schema().await.expect("Failed to apply schema.");

	let bus = Arc::new(Bus::new());
	let service = Arc::new(PmService::new(cfg, db, Arc::clone(&bus), llm));

	(service, bus)
}

pub async fn create_project(service: &PmService, name: &str) -> Uuid {
	service
		.create_project(pm_service::projects::CreateProjectRequest {
			name: name.to_string(),
			description: None,
		})
		.await
		.expect("Failed to create project.")
		.id
}

pub async fn create_task(service: &PmService, content: &str) -> Uuid {
	service
		.create_entity(
			pm_service::entities::CreateEntityRequest {
				entity_type: pm_domain::entity::EntityKind::Task,
				content: content.to_string(),
				status: None,
				project_id: None,
				epic_id: None,
				parent_task_id: None,
				assignee_id: None,
				attributes: None,
			},
			None,
		)
		.await
		.expect("Failed to create entity.")
		.id
}

/// Seeds one pending review row directly, the way materialization would.
pub async fn seed_review(
	service: &PmService,
	entity_id: Option<Uuid>,
	project_id: Option<Uuid>,
	review_type: &str,
	ai_suggestion: Value,
	ai_confidence: f32,
) -> Uuid {
	let mut tx = service.db.pool.begin().await.expect("Failed to begin tx.");
	let inserted = pm_storage::queries::insert_pending_review(
		&mut tx,
		pm_storage::queries::NewReview {
			entity_id,
			project_id,
			review_type,
			ai_suggestion,
			ai_confidence,
		},
	)
	.await
	.expect("Failed to insert review.")
	.expect("Review insert was absorbed unexpectedly.");

	tx.commit().await.expect("Failed to commit.");

	inserted.review_id
}

pub async fn count_rows(service: &PmService, sql: &str, id: Uuid) -> i64 {
	sqlx::query_scalar(sql)
		.bind(id)
		.fetch_one(&service.db.pool)
		.await
		.expect("Count query failed.")
}

pub mod capture;
pub mod entities;
pub mod epics;
pub mod extraction;
pub mod handlers;
pub mod lineage;
pub mod materialize;
pub mod notes;
pub mod organization;
pub mod projects;
pub mod review;
pub mod tags;
pub mod training;
pub mod users;

mod error;

pub use error::{Error, Result};

use std::sync::Arc;

use serde::Serialize;
use sqlx::{Postgres, Transaction};

use pm_bus::{Bus, TxEvents};
use pm_config::Config;
use pm_domain::cursor::Cursor;
use pm_providers::ToolUseProvider;
use pm_storage::db::Db;

pub const QUEUE_NOTES_EXTRACT: &str = "notes:extract";
pub const QUEUE_ENTITIES_ORGANIZE: &str = "entities:organize";
pub const QUEUE_NOTES_REPROCESS: &str = "notes:reprocess";
pub const QUEUE_COMPUTE_EMBEDDINGS: &str = "entities:compute-embeddings";
pub const QUEUE_EXPORT_TRAINING: &str = "review-queue:export-training-data";

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 100;

/// The processing engine. One per process; shared behind an `Arc` by the
/// HTTP surface and the job runner so AI-driven and user-driven mutations go
/// through the same write paths with the same invariants.
pub struct PmService {
	pub cfg: Config,
	pub db: Db,
	pub bus: Arc<Bus>,
	pub llm: Arc<dyn ToolUseProvider>,
}

impl PmService {
	pub fn new(cfg: Config, db: Db, bus: Arc<Bus>, llm: Arc<dyn ToolUseProvider>) -> Self {
		Self { cfg, db, bus, llm }
	}

	/// Stages buffered events inside the transaction (`pg_notify` rides the
	/// commit), commits, then delivers to in-process subscribers. A failed
	/// commit discards the events.
	pub(crate) async fn commit_with_events(
		&self,
		mut tx: Transaction<'_, Postgres>,
		events: TxEvents,
	) -> Result<()> {
		if !events.is_empty() {
			events.stage(&mut tx, self.bus.instance()).await?;
		}

		tx.commit().await?;
		events.flush(&self.bus);

		Ok(())
	}
}

/// List page envelope shared by every list operation.
#[derive(Debug, Serialize)]
pub struct Page<T> {
	pub items: Vec<T>,
	#[serde(rename = "nextCursor")]
	pub next_cursor: Option<String>,
	/// The limit actually applied, so callers see when a too-large request
	/// was clamped.
	pub limit: i64,
}

/// `limit = 0` is a validation error, absent defaults to 50, anything above
/// 100 clamps to 100.
pub(crate) fn effective_limit(limit: Option<i64>) -> Result<i64> {
	match limit {
		None => Ok(DEFAULT_PAGE_SIZE),
		Some(limit) if limit <= 0 =>
			Err(Error::validation("limit must be between 1 and 100.")),
		Some(limit) => Ok(limit.min(MAX_PAGE_SIZE)),
	}
}

/// Builds a page from a `limit + 1` fetch: the extra row only signals that a
/// next page exists and supplies nothing itself.
pub(crate) fn paginate<T>(
	mut rows: Vec<T>,
	limit: i64,
	cursor_for: impl Fn(&T) -> Result<Cursor>,
) -> Result<Page<T>> {
	let has_more = rows.len() as i64 > limit;

	if has_more {
		rows.truncate(limit as usize);
	}

	let next_cursor = if has_more {
		match rows.last() {
			Some(last) => Some(cursor_for(last)?.encode()),
			None => None,
		}
	} else {
		None
	};

	Ok(Page { items: rows, next_cursor, limit })
}

#[cfg(test)]
mod tests {
	use uuid::Uuid;

	use super::*;

	#[test]
	fn limit_defaults_clamps_and_rejects_zero() {
		assert_eq!(effective_limit(None).unwrap(), 50);
		assert_eq!(effective_limit(Some(10)).unwrap(), 10);
		assert_eq!(effective_limit(Some(250)).unwrap(), 100);
		assert!(effective_limit(Some(0)).is_err());
		assert!(effective_limit(Some(-5)).is_err());
	}

	#[test]
	fn paginate_emits_cursor_only_when_more_rows_remain() {
		let rows: Vec<u32> = (0..6).collect();
		let page = paginate(rows, 5, |n| {
			Ok(Cursor::new(serde_json::json!(n), Uuid::nil()))
		})
		.unwrap();

		assert_eq!(page.items, vec![0, 1, 2, 3, 4]);
		assert!(page.next_cursor.is_some());

		let page = paginate(vec![0_u32, 1], 5, |n| {
			Ok(Cursor::new(serde_json::json!(n), Uuid::nil()))
		})
		.unwrap();

		assert!(page.next_cursor.is_none());
	}
}

use std::path::PathBuf;

use serde_json::json;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use pm_storage::models::ReviewItem;

use crate::{Error, PmService, Result};

#[derive(Debug)]
pub struct TrainingExport {
	pub path: PathBuf,
	pub count: usize,
}

impl PmService {
	/// Serializes resolved reviews carrying a training comment over a time
	/// window into a JSONL file, one stable-ordered record per line, for
	/// offline use.
	pub async fn export_training_data(
		&self,
		since: OffsetDateTime,
		until: OffsetDateTime,
	) -> Result<TrainingExport> {
		if until <= since {
			return Err(Error::validation("until must be after since."));
		}

		let items = sqlx::query_as::<_, ReviewItem>(
			"SELECT review_id, entity_id, project_id, review_type, status, ai_suggestion, \
			 ai_confidence, resolved_by, resolved_at, user_resolution, training_comment, \
			 created_at, updated_at FROM review_queue \
			 WHERE status <> 'pending' AND training_comment IS NOT NULL \
			 AND resolved_at >= $1 AND resolved_at < $2 \
			 ORDER BY resolved_at, review_id",
		)
		.bind(since)
		.bind(until)
		.fetch_all(&self.db.pool)
		.await?;
		let mut lines = String::new();

		for item in &items {
			let resolved_at = item
				.resolved_at
				.map(|ts| ts.format(&Rfc3339))
				.transpose()
				.map_err(|_| Error::validation("resolved_at failed to format."))?;
			let record = json!({
				"reviewId": item.review_id,
				"entityId": item.entity_id,
				"projectId": item.project_id,
				"reviewType": item.review_type,
				"status": item.status,
				"aiSuggestion": item.ai_suggestion,
				"aiConfidence": item.ai_confidence,
				"userResolution": item.user_resolution,
				"trainingComment": item.training_comment,
				"resolvedAt": resolved_at,
			});

			lines.push_str(&record.to_string());
			lines.push('\n');
		}

		let dir = PathBuf::from(&self.cfg.training.export_dir);

		tokio::fs::create_dir_all(&dir).await.map_err(|err| Error::Storage {
			message: format!("Failed to create export directory: {err}."),
			transient: true,
		})?;

		let file_name = format!(
			"training-{}-{}.jsonl",
			since.unix_timestamp(),
			until.unix_timestamp(),
		);
		let path = dir.join(file_name);

		tokio::fs::write(&path, lines).await.map_err(|err| Error::Storage {
			message: format!("Failed to write export file: {err}."),
			transient: true,
		})?;

		Ok(TrainingExport { path, count: items.len() })
	}
}

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use pm_bus::{Event, TxEvents};
use pm_storage::{models::Tag, queries};

use crate::{Error, PmService, Result};

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TagView {
	pub id: Uuid,
	pub name: String,
	#[serde(with = "time::serde::rfc3339")]
	pub created_at: OffsetDateTime,
}

impl From<Tag> for TagView {
	fn from(tag: Tag) -> Self {
		Self { id: tag.tag_id, name: tag.name, created_at: tag.created_at }
	}
}

#[derive(Clone, Debug, Deserialize)]
pub struct CreateTagRequest {
	pub name: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetEntityTagsRequest {
	pub tag_ids: Vec<Uuid>,
}

impl PmService {
	/// Tag names are lowercase and unique; input is normalized rather than
	/// rejected.
	pub async fn create_tag(&self, req: CreateTagRequest) -> Result<TagView> {
		let name = req.name.trim().to_lowercase();

		if name.is_empty() {
			return Err(Error::validation("name must be non-empty."));
		}

		let tag = sqlx::query_as::<_, Tag>(
			"INSERT INTO tags (tag_id, name) VALUES ($1, $2) \
			 ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name \
			 RETURNING tag_id, name, created_at",
		)
		.bind(Uuid::new_v4())
		.bind(&name)
		.fetch_one(&self.db.pool)
		.await?;

		Ok(tag.into())
	}

	pub async fn list_tags(&self, query: Option<&str>) -> Result<Vec<TagView>> {
		let tags = match query {
			Some(q) if !q.trim().is_empty() => {
				let pattern = format!("%{}%", q.trim().to_lowercase());

				sqlx::query_as::<_, Tag>(
					"SELECT tag_id, name, created_at FROM tags WHERE name LIKE $1 ORDER BY name",
				)
				.bind(pattern)
				.fetch_all(&self.db.pool)
				.await?
			},
			_ => sqlx::query_as::<_, Tag>(
				"SELECT tag_id, name, created_at FROM tags ORDER BY name",
			)
			.fetch_all(&self.db.pool)
			.await?,
		};

		Ok(tags.into_iter().map(TagView::from).collect())
	}

	/// Replaces an entity's tag set wholesale (PUT semantics).
	pub async fn set_entity_tags(
		&self,
		entity_id: Uuid,
		req: SetEntityTagsRequest,
	) -> Result<Vec<TagView>> {
		let mut tx = self.db.pool.begin().await?;
		let mut events = TxEvents::new();

		queries::fetch_entity(&mut *tx, entity_id)
			.await?
			.ok_or_else(|| Error::not_found(format!("Entity {entity_id} does not exist.")))?;

		sqlx::query("DELETE FROM entity_tags WHERE entity_id = $1")
			.bind(entity_id)
			.execute(&mut *tx)
			.await?;

		for tag_id in &req.tag_ids {
			sqlx::query(
				"INSERT INTO entity_tags (entity_id, tag_id) VALUES ($1, $2) \
				 ON CONFLICT DO NOTHING",
			)
			.bind(entity_id)
			.bind(tag_id)
			.execute(&mut *tx)
			.await?;
		}

		let tags = sqlx::query_as::<_, Tag>(
			"SELECT t.tag_id, t.name, t.created_at FROM tags t \
			 JOIN entity_tags et ON et.tag_id = t.tag_id \
			 WHERE et.entity_id = $1 ORDER BY t.name",
		)
		.bind(entity_id)
		.fetch_all(&mut *tx)
		.await?;

		events.push(Event::EntityUpdated { id: entity_id });
		self.commit_with_events(tx, events).await?;

		Ok(tags.into_iter().map(TagView::from).collect())
	}
}

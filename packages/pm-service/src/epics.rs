use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use pm_bus::{Event, TxEvents};
use pm_domain::{cursor::Cursor, patch::Patch};
use pm_storage::{models::Epic, queries};

use crate::{Error, Page, PmService, Result, effective_limit, paginate};

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EpicView {
	pub id: Uuid,
	pub project_id: Uuid,
	pub name: String,
	pub description: Option<String>,
	pub created_by: String,
	#[serde(with = "time::serde::rfc3339::option")]
	pub deleted_at: Option<OffsetDateTime>,
	#[serde(with = "time::serde::rfc3339")]
	pub created_at: OffsetDateTime,
	#[serde(with = "time::serde::rfc3339")]
	pub updated_at: OffsetDateTime,
}

impl From<Epic> for EpicView {
	fn from(epic: Epic) -> Self {
		Self {
			id: epic.epic_id,
			project_id: epic.project_id,
			name: epic.name,
			description: epic.description,
			created_by: epic.created_by,
			deleted_at: epic.deleted_at,
			created_at: epic.created_at,
			updated_at: epic.updated_at,
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEpicRequest {
	pub project_id: Uuid,
	pub name: String,
	#[serde(default)]
	pub description: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct PatchEpicRequest {
	#[serde(default)]
	pub name: Patch<String>,
	#[serde(default)]
	pub description: Patch<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListEpicsRequest {
	pub project_id: Uuid,
	pub limit: Option<i64>,
	pub cursor: Option<String>,
}

impl PmService {
	pub async fn create_epic(&self, req: CreateEpicRequest) -> Result<EpicView> {
		let mut tx = self.db.pool.begin().await?;
		let epic = create_epic_tx(&mut tx, req.project_id, &req.name, req.description.as_deref(), "user").await?;

		tx.commit().await?;

		Ok(epic.into())
	}

	pub async fn patch_epic(&self, epic_id: Uuid, req: PatchEpicRequest) -> Result<EpicView> {
		let mut tx = self.db.pool.begin().await?;
		let epic = queries::fetch_epic(&mut *tx, epic_id)
			.await?
			.ok_or_else(|| Error::not_found(format!("Epic {epic_id} does not exist.")))?;
		let name = match req.name {
			Patch::Missing => epic.name,
			Patch::Null => return Err(Error::validation("name cannot be cleared.")),
			Patch::Set(name) => {
				if name.trim().is_empty() {
					return Err(Error::validation("name must be non-empty."));
				}

				name
			},
		};
		let description = req.description.into_update().unwrap_or(epic.description);
		let updated = sqlx::query_as::<_, Epic>(
			"UPDATE epics SET name = $1, description = $2 WHERE epic_id = $3 \
			 RETURNING epic_id, project_id, name, description, created_by, deleted_at, \
			 created_at, updated_at",
		)
		.bind(&name)
		.bind(description.as_deref())
		.bind(epic_id)
		.fetch_one(&mut *tx)
		.await?;

		tx.commit().await?;

		Ok(updated.into())
	}

	/// Epic deletion detaches child entities rather than deleting them.
	pub async fn delete_epic(&self, epic_id: Uuid) -> Result<EpicView> {
		let mut tx = self.db.pool.begin().await?;
		let mut events = TxEvents::new();
		let epic = queries::fetch_epic(&mut *tx, epic_id)
			.await?
			.ok_or_else(|| Error::not_found(format!("Epic {epic_id} does not exist.")))?;

		if epic.deleted_at.is_some() {
			tx.commit().await?;

			return Ok(epic.into());
		}

		let detached: Vec<(Uuid,)> = sqlx::query_as(
			"UPDATE entities SET epic_id = NULL WHERE epic_id = $1 RETURNING entity_id",
		)
		.bind(epic_id)
		.fetch_all(&mut *tx)
		.await?;
		let deleted = sqlx::query_as::<_, Epic>(
			"UPDATE epics SET deleted_at = now() WHERE epic_id = $1 \
			 RETURNING epic_id, project_id, name, description, created_by, deleted_at, \
			 created_at, updated_at",
		)
		.bind(epic_id)
		.fetch_one(&mut *tx)
		.await?;

		for (entity_id,) in detached {
			events.push(Event::EntityUpdated { id: entity_id });
		}

		crate::projects::push_stats_updated(&mut events, Some(epic.project_id));
		self.commit_with_events(tx, events).await?;

		Ok(deleted.into())
	}

	pub async fn list_epics(&self, req: ListEpicsRequest) -> Result<Page<EpicView>> {
		let limit = effective_limit(req.limit)?;
		let mut builder = sqlx::QueryBuilder::new(
			"SELECT epic_id, project_id, name, description, created_by, deleted_at, created_at, \
			 updated_at FROM epics WHERE deleted_at IS NULL AND project_id = ",
		);

		builder.push_bind(req.project_id);

		if let Some(raw) = req.cursor.as_deref() {
			let cursor = Cursor::decode(raw)?;
			let created_at = cursor.timestamp()?;

			builder.push(" AND (created_at, epic_id) < (");
			builder.push_bind(created_at);
			builder.push(", ");
			builder.push_bind(cursor.id);
			builder.push(")");
		}

		builder.push(" ORDER BY created_at DESC, epic_id DESC LIMIT ");
		builder.push_bind(limit + 1);

		let epics: Vec<Epic> = builder.build_query_as().fetch_all(&self.db.pool).await?;
		let views: Vec<EpicView> = epics.into_iter().map(EpicView::from).collect();

		paginate(views, limit, |epic| {
			Cursor::from_timestamp(epic.created_at, epic.id).map_err(Error::from)
		})
	}
}

/// Shared by the HTTP surface (`created_by = user`) and the review engine's
/// `epic_creation` acceptance (`created_by = ai`).
pub(crate) async fn create_epic_tx(
	tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
	project_id: Uuid,
	name: &str,
	description: Option<&str>,
	created_by: &str,
) -> Result<Epic> {
	if name.trim().is_empty() {
		return Err(Error::validation("name must be non-empty."));
	}

	let project = queries::fetch_project(&mut **tx, project_id)
		.await?
		.ok_or_else(|| Error::not_found(format!("Project {project_id} does not exist.")))?;

	if project.deleted_at.is_some() {
		return Err(Error::conflict(format!("Project {project_id} is deleted.")));
	}

	let epic = sqlx::query_as::<_, Epic>(
		"INSERT INTO epics (epic_id, project_id, name, description, created_by) \
		 VALUES ($1, $2, $3, $4, $5) \
		 RETURNING epic_id, project_id, name, description, created_by, deleted_at, created_at, \
		 updated_at",
	)
	.bind(Uuid::new_v4())
	.bind(project_id)
	.bind(name.trim())
	.bind(description)
	.bind(created_by)
	.fetch_one(&mut **tx)
	.await?;

	Ok(epic)
}

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use time::OffsetDateTime;
use uuid::Uuid;

use pm_bus::{Event, TxEvents};
use pm_domain::{cursor::Cursor, patch::Patch};
use pm_storage::{models::Project, queries};

use crate::{
	Error, Page, PmService, Result, effective_limit, entities::EntityView, paginate,
};

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectView {
	pub id: Uuid,
	pub name: String,
	pub description: Option<String>,
	pub status: String,
	#[serde(with = "time::serde::rfc3339::option")]
	pub deleted_at: Option<OffsetDateTime>,
	#[serde(with = "time::serde::rfc3339")]
	pub created_at: OffsetDateTime,
	#[serde(with = "time::serde::rfc3339")]
	pub updated_at: OffsetDateTime,
}

impl From<Project> for ProjectView {
	fn from(project: Project) -> Self {
		Self {
			id: project.project_id,
			name: project.name,
			description: project.description,
			status: project.status,
			deleted_at: project.deleted_at,
			created_at: project.created_at,
			updated_at: project.updated_at,
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
pub struct CreateProjectRequest {
	pub name: String,
	#[serde(default)]
	pub description: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct PatchProjectRequest {
	#[serde(default)]
	pub name: Patch<String>,
	#[serde(default)]
	pub description: Patch<String>,
	#[serde(default)]
	pub status: Patch<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListProjectsRequest {
	pub status: Option<String>,
	#[serde(default)]
	pub include_deleted: bool,
	pub limit: Option<i64>,
	pub cursor: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDashboard {
	pub project: ProjectView,
	pub tasks_by_status: Value,
	pub open_decisions: i64,
	pub recent_insights: Vec<EntityView>,
	pub epics: Vec<EpicProgress>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EpicProgress {
	pub id: Uuid,
	pub name: String,
	pub total_tasks: i64,
	pub done_tasks: i64,
	pub progress: f64,
}

impl PmService {
	pub async fn create_project(&self, req: CreateProjectRequest) -> Result<ProjectView> {
		if req.name.trim().is_empty() {
			return Err(Error::validation("name must be non-empty."));
		}

		let project = sqlx::query_as::<_, Project>(
			"INSERT INTO projects (project_id, name, description) VALUES ($1, $2, $3) \
			 RETURNING project_id, name, description, status, deleted_at, created_at, updated_at",
		)
		.bind(Uuid::new_v4())
		.bind(req.name.trim())
		.bind(req.description.as_deref())
		.fetch_one(&self.db.pool)
		.await?;

		Ok(project.into())
	}

	pub async fn patch_project(
		&self,
		project_id: Uuid,
		req: PatchProjectRequest,
	) -> Result<ProjectView> {
		let mut tx = self.db.pool.begin().await?;
		let project = queries::fetch_project(&mut *tx, project_id)
			.await?
			.ok_or_else(|| Error::not_found(format!("Project {project_id} does not exist.")))?;
		let name = match req.name {
			Patch::Missing => project.name,
			Patch::Null => return Err(Error::validation("name cannot be cleared.")),
			Patch::Set(name) => {
				if name.trim().is_empty() {
					return Err(Error::validation("name must be non-empty."));
				}

				name
			},
		};
		let description = req.description.into_update().unwrap_or(project.description);
		let status = match req.status {
			Patch::Missing => project.status,
			Patch::Null => return Err(Error::validation("status cannot be cleared.")),
			Patch::Set(status) => {
				if !matches!(status.as_str(), "active" | "archived") {
					return Err(Error::validation("status must be active or archived."));
				}

				status
			},
		};
		let updated = sqlx::query_as::<_, Project>(
			"UPDATE projects SET name = $1, description = $2, status = $3 WHERE project_id = $4 \
			 RETURNING project_id, name, description, status, deleted_at, created_at, updated_at",
		)
		.bind(&name)
		.bind(description.as_deref())
		.bind(&status)
		.bind(project_id)
		.fetch_one(&mut *tx)
		.await?;

		tx.commit().await?;

		Ok(updated.into())
	}

	/// Soft delete. Refused while live entities still point at the project.
	pub async fn delete_project(&self, project_id: Uuid) -> Result<ProjectView> {
		let mut tx = self.db.pool.begin().await?;
		let project = queries::fetch_project(&mut *tx, project_id)
			.await?
			.ok_or_else(|| Error::not_found(format!("Project {project_id} does not exist.")))?;

		if project.deleted_at.is_some() {
			tx.commit().await?;

			return Ok(project.into());
		}

		let live: i64 = sqlx::query_scalar(
			"SELECT count(*) FROM entities WHERE project_id = $1 AND deleted_at IS NULL",
		)
		.bind(project_id)
		.fetch_one(&mut *tx)
		.await?;

		if live > 0 {
			return Err(Error::conflict(format!(
				"Project {project_id} still has {live} live entities.",
			)));
		}

		let deleted = sqlx::query_as::<_, Project>(
			"UPDATE projects SET deleted_at = now() WHERE project_id = $1 \
			 RETURNING project_id, name, description, status, deleted_at, created_at, updated_at",
		)
		.bind(project_id)
		.fetch_one(&mut *tx)
		.await?;

		tx.commit().await?;

		Ok(deleted.into())
	}

	/// Default listing is active projects that are not soft-deleted.
	pub async fn list_projects(&self, req: ListProjectsRequest) -> Result<Page<ProjectView>> {
		let limit = effective_limit(req.limit)?;
		let mut builder = sqlx::QueryBuilder::new(
			"SELECT project_id, name, description, status, deleted_at, created_at, updated_at \
			 FROM projects WHERE TRUE",
		);

		if !req.include_deleted {
			builder.push(" AND deleted_at IS NULL");
		}

		match req.status.as_deref() {
			Some(status) => {
				builder.push(" AND status = ");
				builder.push_bind(status.to_string());
			},
			None => {
				builder.push(" AND status = 'active'");
			},
		}

		if let Some(raw) = req.cursor.as_deref() {
			let cursor = Cursor::decode(raw)?;
			let created_at = cursor.timestamp()?;

			builder.push(" AND (created_at, project_id) < (");
			builder.push_bind(created_at);
			builder.push(", ");
			builder.push_bind(cursor.id);
			builder.push(")");
		}

		builder.push(" ORDER BY created_at DESC, project_id DESC LIMIT ");
		builder.push_bind(limit + 1);

		let projects: Vec<Project> = builder.build_query_as().fetch_all(&self.db.pool).await?;
		let views: Vec<ProjectView> = projects.into_iter().map(ProjectView::from).collect();

		paginate(views, limit, |project| {
			Cursor::from_timestamp(project.created_at, project.id).map_err(Error::from)
		})
	}

	/// One aggregate read feeding the project overview screen.
	pub async fn project_dashboard(&self, project_id: Uuid) -> Result<ProjectDashboard> {
		let project = queries::fetch_project(&self.db.pool, project_id)
			.await?
			.ok_or_else(|| Error::not_found(format!("Project {project_id} does not exist.")))?;
		let status_rows = sqlx::query(
			"SELECT status, count(*) AS n FROM entities \
			 WHERE project_id = $1 AND type = 'task' AND deleted_at IS NULL \
			 GROUP BY status",
		)
		.bind(project_id)
		.fetch_all(&self.db.pool)
		.await?;
		let mut tasks_by_status = serde_json::Map::new();

		for row in status_rows {
			let status: String = row.try_get("status").map_err(pm_storage::Error::from)?;
			let count: i64 = row.try_get("n").map_err(pm_storage::Error::from)?;

			tasks_by_status.insert(status, count.into());
		}

		let open_decisions: i64 = sqlx::query_scalar(
			"SELECT count(*) FROM entities \
			 WHERE project_id = $1 AND type = 'decision' AND status = 'pending' \
			 AND deleted_at IS NULL",
		)
		.bind(project_id)
		.fetch_one(&self.db.pool)
		.await?;
		let recent_insights = sqlx::query_as::<_, pm_storage::models::Entity>(
			"SELECT entity_id, type, content, status, project_id, epic_id, parent_task_id, \
			 assignee_id, confidence, attributes, ai_meta, evidence, deleted_at, created_at, \
			 updated_at FROM entities \
			 WHERE project_id = $1 AND type = 'insight' AND deleted_at IS NULL \
			 ORDER BY created_at DESC, entity_id DESC LIMIT 5",
		)
		.bind(project_id)
		.fetch_all(&self.db.pool)
		.await?;
		let epic_rows = sqlx::query(
			"SELECT ep.epic_id, ep.name, \
			 count(e.entity_id) FILTER (WHERE e.deleted_at IS NULL) AS total_tasks, \
			 count(e.entity_id) FILTER (WHERE e.deleted_at IS NULL AND e.status = 'done') AS done_tasks \
			 FROM epics ep \
			 LEFT JOIN entities e ON e.epic_id = ep.epic_id AND e.type = 'task' \
			 WHERE ep.project_id = $1 AND ep.deleted_at IS NULL \
			 GROUP BY ep.epic_id, ep.name \
			 ORDER BY ep.created_at",
		)
		.bind(project_id)
		.fetch_all(&self.db.pool)
		.await?;
		let mut epics = Vec::with_capacity(epic_rows.len());

		for row in epic_rows {
			let total_tasks: i64 = row.try_get("total_tasks").map_err(pm_storage::Error::from)?;
			let done_tasks: i64 = row.try_get("done_tasks").map_err(pm_storage::Error::from)?;

			epics.push(EpicProgress {
				id: row.try_get("epic_id").map_err(pm_storage::Error::from)?,
				name: row.try_get("name").map_err(pm_storage::Error::from)?,
				total_tasks,
				done_tasks,
				progress: if total_tasks == 0 {
					0.0
				} else {
					done_tasks as f64 / total_tasks as f64
				},
			});
		}

		Ok(ProjectDashboard {
			project: project.into(),
			tasks_by_status: Value::Object(tasks_by_status),
			open_decisions,
			recent_insights: recent_insights.into_iter().map(EntityView::from).collect(),
			epics,
		})
	}
}

/// Bus notification helper shared by the write paths that change a
/// project's aggregate numbers.
pub(crate) fn push_stats_updated(events: &mut TxEvents, project_id: Option<Uuid>) {
	if let Some(project_id) = project_id {
		events.push(Event::ProjectStatsUpdated { project_id });
	}
}

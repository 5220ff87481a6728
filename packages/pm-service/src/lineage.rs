use serde::{Deserialize, Serialize};
use uuid::Uuid;

use pm_storage::queries;

use crate::{Error, PmService, Result};

const DEFAULT_MAX_DEPTH: i32 = 10;
const MAX_MAX_DEPTH: i32 = 50;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineageDirection {
	Up,
	Down,
	Both,
}

impl LineageDirection {
	const fn as_str(&self) -> &'static str {
		match self {
			Self::Up => "up",
			Self::Down => "down",
			Self::Both => "both",
		}
	}
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LineageNode {
	pub entity_id: Uuid,
	pub depth: i32,
	pub direction: String,
	pub via: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LineageResponse {
	pub root: Uuid,
	pub nodes: Vec<LineageNode>,
}

impl PmService {
	/// DAG view around one entity following relationship edges and parent
	/// links, cycle-safe, with depth annotations.
	pub async fn lineage(
		&self,
		entity_id: Uuid,
		direction: LineageDirection,
		max_depth: Option<i32>,
	) -> Result<LineageResponse> {
		let max_depth = match max_depth {
			None => DEFAULT_MAX_DEPTH,
			Some(depth) if depth <= 0 =>
				return Err(Error::validation("maxDepth must be greater than zero.")),
			Some(depth) => depth.min(MAX_MAX_DEPTH),
		};

		queries::fetch_entity(&self.db.pool, entity_id)
			.await?
			.ok_or_else(|| Error::not_found(format!("Entity {entity_id} does not exist.")))?;

		let rows =
			queries::lineage(&self.db.pool, entity_id, direction.as_str(), max_depth).await?;
		let nodes = rows
			.into_iter()
			.map(|row| LineageNode {
				entity_id: row.entity_id,
				depth: row.depth,
				direction: row.direction,
				via: row.via,
			})
			.collect();

		Ok(LineageResponse { root: entity_id, nodes })
	}
}

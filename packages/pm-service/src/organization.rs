use serde::Serialize;
use serde_json::{Value, json};
use tracing::{error, warn};
use uuid::Uuid;

use pm_providers::{Message, ToolSpec, ToolUseRequest};
use pm_storage::models::Entity;

use crate::{Error, PmService, Result};

const TOOL_NAME: &str = "record_organization";
const RECENT_ENTITIES: i64 = 20;
const CONTEXT_PROJECTS: i64 = 50;
const CONTEXT_EPICS: i64 = 100;

const SYSTEM_PROMPT: &str = r#"You place one freshly-extracted work item into an existing workspace.

Given the item plus context (active projects, open epics, recent items, people), suggest:
- the project it belongs to, the epic within that project, and an assignee, each with a confidence in [0,1];
- duplicate candidates among the recent items, with a similarity score and a short reason;
- new-epic proposals when several recent items plus this one form a coherent theme that no existing epic covers.

Only reference ids that appear in the context. Omit a suggestion entirely rather than guessing below 0.3 confidence. Mentions like "@name" in the item content are strong assignee signals."#;

#[derive(Clone, Debug)]
pub struct OrganizationOutput {
	pub project: Option<ScoredId>,
	pub epic: Option<ScoredId>,
	pub assignee: Option<ScoredId>,
	pub duplicates: Vec<DuplicateCandidate>,
	pub epic_proposals: Vec<EpicProposal>,
}

#[derive(Clone, Copy, Debug)]
pub struct ScoredId {
	pub id: Uuid,
	pub confidence: f32,
}

#[derive(Clone, Debug)]
pub struct DuplicateCandidate {
	pub entity_id: Uuid,
	pub similarity_score: f32,
	pub reason: String,
	pub confidence: f32,
}

#[derive(Clone, Debug)]
pub struct EpicProposal {
	pub name: String,
	pub description: Option<String>,
	pub project_id: Uuid,
	pub candidate_entity_ids: Vec<Uuid>,
	pub confidence: f32,
}

/// Context batches handed to the model. Everything is serialized into the
/// user message; the model may only reference ids that appear here.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationContext {
	pub projects: Vec<ProjectBrief>,
	pub epics: Vec<EpicBrief>,
	pub recent_entities: Vec<EntityBrief>,
	pub users: Vec<UserBrief>,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ProjectBrief {
	pub id: Uuid,
	pub name: String,
	pub description: Option<String>,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct EpicBrief {
	pub id: Uuid,
	pub project_id: Uuid,
	pub name: String,
	pub description: Option<String>,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct EntityBrief {
	pub id: Uuid,
	#[serde(rename = "type")]
	pub entity_type: String,
	pub content: String,
	pub project_id: Option<Uuid>,
	pub epic_id: Option<Uuid>,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UserBrief {
	pub id: Uuid,
	pub name: String,
	pub email: String,
}

pub fn organization_tool() -> ToolSpec {
	ToolSpec {
		name: TOOL_NAME.to_string(),
		description: "Record project, epic, assignee, and duplicate suggestions for one entity."
			.to_string(),
		input_schema: json!({
			"type": "object",
			"properties": {
				"suggestedProject": {
					"type": "object",
					"required": ["id", "confidence"],
					"properties": {
						"id": { "type": "string" },
						"confidence": { "type": "number" }
					}
				},
				"suggestedEpic": {
					"type": "object",
					"required": ["id", "confidence"],
					"properties": {
						"id": { "type": "string" },
						"confidence": { "type": "number" }
					}
				},
				"suggestedAssignee": {
					"type": "object",
					"required": ["id", "confidence"],
					"properties": {
						"id": { "type": "string" },
						"confidence": { "type": "number" }
					}
				},
				"duplicateCandidates": {
					"type": "array",
					"items": {
						"type": "object",
						"required": ["entityId", "similarityScore", "reason", "confidence"],
						"properties": {
							"entityId": { "type": "string" },
							"similarityScore": { "type": "number" },
							"reason": { "type": "string" },
							"confidence": { "type": "number" }
						}
					}
				},
				"epicProposals": {
					"type": "array",
					"items": {
						"type": "object",
						"required": ["name", "projectId", "candidateEntityIds", "confidence"],
						"properties": {
							"name": { "type": "string" },
							"description": { "type": "string" },
							"projectId": { "type": "string" },
							"candidateEntityIds": {
								"type": "array",
								"items": { "type": "string" }
							},
							"confidence": { "type": "number" }
						}
					}
				}
			}
		}),
	}
}

impl PmService {
	pub async fn gather_organization_context(
		&self,
		entity: &Entity,
	) -> Result<OrganizationContext> {
		let projects = sqlx::query_as::<_, ProjectBrief>(
			"SELECT project_id AS id, name, description FROM projects \
			 WHERE status = 'active' AND deleted_at IS NULL \
			 ORDER BY created_at DESC LIMIT $1",
		)
		.bind(CONTEXT_PROJECTS)
		.fetch_all(&self.db.pool)
		.await?;
		let epics = sqlx::query_as::<_, EpicBrief>(
			"SELECT e.epic_id AS id, e.project_id, e.name, e.description FROM epics e \
			 JOIN projects p ON p.project_id = e.project_id \
			 WHERE e.deleted_at IS NULL AND p.status = 'active' AND p.deleted_at IS NULL \
			 ORDER BY e.created_at DESC LIMIT $1",
		)
		.bind(CONTEXT_EPICS)
		.fetch_all(&self.db.pool)
		.await?;
		let recent_entities = sqlx::query_as::<_, EntityBrief>(
			"SELECT entity_id AS id, type AS entity_type, content, project_id, epic_id \
			 FROM entities WHERE deleted_at IS NULL AND entity_id <> $1 \
			 ORDER BY created_at DESC, entity_id DESC LIMIT $2",
		)
		.bind(entity.entity_id)
		.bind(RECENT_ENTITIES)
		.fetch_all(&self.db.pool)
		.await?;
		let users = sqlx::query_as::<_, UserBrief>(
			"SELECT user_id AS id, name, email FROM users ORDER BY name",
		)
		.fetch_all(&self.db.pool)
		.await?;

		Ok(OrganizationContext { projects, epics, recent_entities, users })
	}

	/// Phase B, same tool-use discipline as extraction: strict schema, one
	/// retry with the issues appended, then deterministic failure.
	pub async fn run_organization(
		&self,
		entity: &Entity,
		context: &OrganizationContext,
	) -> Result<OrganizationOutput> {
		let tool = organization_tool();
		let entity_message = format_entity_message(entity, context)?;
		let messages = vec![Message::user(entity_message.clone())];
		let first = self
			.llm
			.invoke(ToolUseRequest { system: SYSTEM_PROMPT, messages: &messages, tool: &tool })
			.await?;

		match validate_organization(&first) {
			Ok(output) => Ok(output),
			Err(issues) => {
				warn!(
					entity_id = %entity.entity_id,
					issues = ?issues,
					"Organization output failed validation; retrying once.",
				);

				let retry_messages = vec![
					Message::user(entity_message),
					Message::assistant(first.to_string()),
					Message::user(format!(
						"Your previous tool call failed schema validation. Fix these issues and call the tool again:\n{}",
						issues
							.iter()
							.map(|issue| format!("- {issue}\n"))
							.collect::<String>(),
					)),
				];
				let second = self
					.llm
					.invoke(ToolUseRequest {
						system: SYSTEM_PROMPT,
						messages: &retry_messages,
						tool: &tool,
					})
					.await?;

				validate_organization(&second).map_err(|issues| {
					error!(
						entity_id = %entity.entity_id,
						issues = ?issues,
						"Organization output failed validation after retry.",
					);

					Error::Upstream {
						message: format!(
							"Organization schema validation failed twice: {}.",
							issues.join("; "),
						),
						transient: false,
					}
				})
			},
		}
	}
}

fn format_entity_message(entity: &Entity, context: &OrganizationContext) -> Result<String> {
	let context_json = serde_json::to_string_pretty(context)
		.map_err(|err| Error::validation(format!("Context serialization failed: {err}.")))?;

	Ok(format!(
		"entity:\n  type: {}\n  content: {}\n  status: {}\n\ncontext:\n{}",
		entity.r#type,
		entity.content,
		entity.status,
		context_json,
	))
}

pub fn validate_organization(value: &Value) -> Result<OrganizationOutput, Vec<String>> {
	let mut issues = Vec::new();
	let project = validate_scored_id(value.get("suggestedProject"), "suggestedProject", &mut issues);
	let epic = validate_scored_id(value.get("suggestedEpic"), "suggestedEpic", &mut issues);
	let assignee =
		validate_scored_id(value.get("suggestedAssignee"), "suggestedAssignee", &mut issues);
	let mut duplicates = Vec::new();

	if let Some(raw) = value.get("duplicateCandidates") {
		match raw.as_array() {
			Some(items) =>
				for (idx, item) in items.iter().enumerate() {
					let path = format!("duplicateCandidates[{idx}]");
					let entity_id = parse_uuid(item.get("entityId"), &format!("{path}.entityId"), &mut issues);
					let similarity = parse_score(
						item.get("similarityScore"),
						&format!("{path}.similarityScore"),
						&mut issues,
					);
					let confidence =
						parse_score(item.get("confidence"), &format!("{path}.confidence"), &mut issues);
					let reason = match item.get("reason").and_then(Value::as_str) {
						Some(reason) if !reason.trim().is_empty() => Some(reason.to_string()),
						_ => {
							issues.push(format!("{path}.reason must be a non-empty string."));

							None
						},
					};

					if let (Some(entity_id), Some(similarity), Some(confidence), Some(reason)) =
						(entity_id, similarity, confidence, reason)
					{
						duplicates.push(DuplicateCandidate {
							entity_id,
							similarity_score: similarity,
							reason,
							confidence,
						});
					}
				},
			None => issues.push("duplicateCandidates must be an array.".to_string()),
		}
	}

	let mut epic_proposals = Vec::new();

	if let Some(raw) = value.get("epicProposals") {
		match raw.as_array() {
			Some(items) =>
				for (idx, item) in items.iter().enumerate() {
					let path = format!("epicProposals[{idx}]");
					let name = match item.get("name").and_then(Value::as_str) {
						Some(name) if !name.trim().is_empty() => Some(name.to_string()),
						_ => {
							issues.push(format!("{path}.name must be a non-empty string."));

							None
						},
					};
					let project_id =
						parse_uuid(item.get("projectId"), &format!("{path}.projectId"), &mut issues);
					let confidence =
						parse_score(item.get("confidence"), &format!("{path}.confidence"), &mut issues);
					let candidate_entity_ids = match item
						.get("candidateEntityIds")
						.and_then(Value::as_array)
					{
						Some(ids) => {
							let mut out = Vec::with_capacity(ids.len());

							for (id_idx, id) in ids.iter().enumerate() {
								if let Some(id) = parse_uuid(
									Some(id),
									&format!("{path}.candidateEntityIds[{id_idx}]"),
									&mut issues,
								) {
									out.push(id);
								}
							}

							Some(out)
						},
						None => {
							issues.push(format!("{path}.candidateEntityIds must be an array."));

							None
						},
					};

					if let (Some(name), Some(project_id), Some(confidence), Some(candidate_entity_ids)) =
						(name, project_id, confidence, candidate_entity_ids)
					{
						epic_proposals.push(EpicProposal {
							name,
							description: item
								.get("description")
								.and_then(Value::as_str)
								.map(str::to_string),
							project_id,
							candidate_entity_ids,
							confidence,
						});
					}
				},
			None => issues.push("epicProposals must be an array.".to_string()),
		}
	}

	if issues.is_empty() {
		Ok(OrganizationOutput { project, epic, assignee, duplicates, epic_proposals })
	} else {
		Err(issues)
	}
}

fn validate_scored_id(
	raw: Option<&Value>,
	path: &str,
	issues: &mut Vec<String>,
) -> Option<ScoredId> {
	let raw = raw?;

	if raw.is_null() {
		return None;
	}

	let id = parse_uuid(raw.get("id"), &format!("{path}.id"), issues);
	let confidence = parse_score(raw.get("confidence"), &format!("{path}.confidence"), issues);

	match (id, confidence) {
		(Some(id), Some(confidence)) => Some(ScoredId { id, confidence }),
		_ => None,
	}
}

fn parse_uuid(raw: Option<&Value>, path: &str, issues: &mut Vec<String>) -> Option<Uuid> {
	match raw.and_then(Value::as_str).map(str::parse::<Uuid>) {
		Some(Ok(id)) => Some(id),
		_ => {
			issues.push(format!("{path} must be a UUID string."));

			None
		},
	}
}

fn parse_score(raw: Option<&Value>, path: &str, issues: &mut Vec<String>) -> Option<f32> {
	match raw.and_then(Value::as_f64) {
		Some(score) if (0.0..=1.0).contains(&score) => Some(score as f32),
		_ => {
			issues.push(format!("{path} must be a number in [0,1]."));

			None
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_output_is_valid() {
		let output = validate_organization(&json!({})).expect("empty output is a valid answer");

		assert!(output.project.is_none());
		assert!(output.duplicates.is_empty());
		assert!(output.epic_proposals.is_empty());
	}

	#[test]
	fn parses_a_full_output() {
		let project = Uuid::new_v4();
		let duplicate = Uuid::new_v4();
		let candidate = Uuid::new_v4();
		let output = validate_organization(&json!({
			"suggestedProject": {"id": project.to_string(), "confidence": 0.95},
			"duplicateCandidates": [
				{
					"entityId": duplicate.to_string(),
					"similarityScore": 0.82,
					"reason": "Same login bug.",
					"confidence": 0.8
				}
			],
			"epicProposals": [
				{
					"name": "Payments",
					"projectId": project.to_string(),
					"candidateEntityIds": [candidate.to_string()],
					"confidence": 0.6
				}
			]
		}))
		.expect("full output should validate");

		assert_eq!(output.project.unwrap().id, project);
		assert_eq!(output.duplicates[0].entity_id, duplicate);
		assert_eq!(output.epic_proposals[0].candidate_entity_ids, vec![candidate]);
	}

	#[test]
	fn rejects_malformed_ids_and_scores() {
		let issues = validate_organization(&json!({
			"suggestedProject": {"id": "not-a-uuid", "confidence": 1.5},
			"duplicateCandidates": [{"entityId": "nope", "similarityScore": 0.5, "reason": "", "confidence": 0.5}]
		}))
		.expect_err("malformed output must be rejected");

		assert!(issues.iter().any(|issue| issue.contains("suggestedProject.id")));
		assert!(issues.iter().any(|issue| issue.contains("suggestedProject.confidence")));
		assert!(issues.iter().any(|issue| issue.contains("reason")));
	}

	#[test]
	fn null_suggestion_reads_as_absent() {
		let output = validate_organization(&json!({"suggestedEpic": null}))
			.expect("null suggestion is absent");

		assert!(output.epic.is_none());
	}
}

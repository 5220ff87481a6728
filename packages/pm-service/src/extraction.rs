use std::collections::BTreeMap;

use serde_json::{Value, json};
use tracing::{error, warn};

use pm_domain::{
	entity::EntityKind,
	evidence,
	relationship::RelationshipType,
};
use pm_providers::{Message, ToolSpec, ToolUseRequest};
use pm_storage::models::RawNote;

use crate::{Error, PmService, Result};

const TOOL_NAME: &str = "record_extraction";
const MAX_ENTITIES_PER_NOTE: usize = 20;
const CONFIDENCE_EPSILON: f32 = 1e-3;

/// Fixed system preamble plus three domain few-shots (CLI capture, chat
/// message, meeting transcript). The tool schema is the output contract;
/// the examples teach the confidence and evidence discipline.
const SYSTEM_PROMPT: &str = r#"You extract structured work items from free-form notes.

Produce tasks (things to do), decisions (choices made or pending), and insights (observations worth keeping). Rules:
- Statuses: task one of captured|needs_action|in_progress|done; decision one of pending|decided; insight one of captured|acknowledged.
- Give a confidence in [0,1] for every field you fill under fieldConfidences; the entity confidence must equal the minimum of its field confidences.
- Quote evidence verbatim from the note for every entity; offsets are character positions when you can supply them.
- Do not assign projects, epics, or people; a later stage does that with more context.
- Relationships reference entities by array index.

Example (cli capture):
note: "fix the flaky login test before friday"
output: {"entities": [{"type": "task", "content": "Fix the flaky login test", "status": "captured", "attributes": {"due_date": "friday"}, "fieldConfidences": {"type": 0.98, "content": 0.95, "status": 0.95, "attributes.due_date": 0.7}, "confidence": 0.7, "evidence": [{"quote": "fix the flaky login test before friday"}]}], "relationships": []}

Example (chat message):
note: "we're going with postgres over sqlite for the store. @dana will migrate the schema"
output: {"entities": [{"type": "decision", "content": "Use Postgres instead of SQLite for the store", "status": "decided", "attributes": {"options": ["postgres", "sqlite"], "decided_option": "postgres"}, "fieldConfidences": {"type": 0.97, "content": 0.95, "status": 0.96}, "confidence": 0.95, "evidence": [{"quote": "we're going with postgres over sqlite"}]}, {"type": "task", "content": "Migrate the schema to Postgres", "status": "captured", "attributes": {}, "fieldConfidences": {"type": 0.95, "content": 0.9, "status": 0.9}, "confidence": 0.9, "evidence": [{"quote": "@dana will migrate the schema"}]}], "relationships": [{"sourceIndex": 1, "targetIndex": 0, "type": "derived_from"}]}

Example (meeting transcript):
note: "Sam: churn is up 12% this month. Alex: mostly the new pricing page. Sam: ok, revisit pricing copy next sprint, undecided on the annual tier."
output: {"entities": [{"type": "insight", "content": "Churn is up 12% this month, attributed to the new pricing page", "status": "captured", "attributes": {"category": "retention"}, "fieldConfidences": {"type": 0.96, "content": 0.9, "status": 0.96, "attributes.category": 0.8}, "confidence": 0.8, "evidence": [{"quote": "churn is up 12% this month"}, {"quote": "mostly the new pricing page"}]}, {"type": "task", "content": "Revisit pricing copy next sprint", "status": "captured", "attributes": {}, "fieldConfidences": {"type": 0.94, "content": 0.92, "status": 0.94}, "confidence": 0.92, "evidence": [{"quote": "revisit pricing copy next sprint"}]}, {"type": "decision", "content": "Whether to keep the annual tier", "status": "pending", "attributes": {}, "fieldConfidences": {"type": 0.85, "content": 0.8, "status": 0.9}, "confidence": 0.8, "evidence": [{"quote": "undecided on the annual tier"}]}], "relationships": []}"#;

#[derive(Clone, Debug)]
pub struct ExtractionOutput {
	pub entities: Vec<ExtractedEntity>,
	pub relationships: Vec<ExtractedRelationship>,
}

#[derive(Clone, Debug)]
pub struct ExtractedEntity {
	pub kind: EntityKind,
	pub content: String,
	pub status: Option<String>,
	pub attributes: Value,
	pub confidence: f32,
	pub field_confidences: BTreeMap<String, f32>,
	pub evidence: Vec<ExtractedEvidence>,
}

#[derive(Clone, Debug)]
pub struct ExtractedEvidence {
	pub quote: String,
	pub start_offset: Option<u32>,
	pub end_offset: Option<u32>,
}

#[derive(Clone, Copy, Debug)]
pub struct ExtractedRelationship {
	pub source_index: usize,
	pub target_index: usize,
	pub rel_type: RelationshipType,
}

pub fn extraction_tool() -> ToolSpec {
	ToolSpec {
		name: TOOL_NAME.to_string(),
		description: "Record the entities and relationships extracted from one note.".to_string(),
		input_schema: json!({
			"type": "object",
			"required": ["entities", "relationships"],
			"properties": {
				"entities": {
					"type": "array",
					"items": {
						"type": "object",
						"required": ["type", "content", "fieldConfidences", "confidence", "evidence"],
						"properties": {
							"type": { "type": "string", "enum": ["task", "decision", "insight"] },
							"content": { "type": "string" },
							"status": { "type": "string" },
							"attributes": { "type": "object" },
							"fieldConfidences": {
								"type": "object",
								"additionalProperties": { "type": "number" }
							},
							"confidence": { "type": "number" },
							"evidence": {
								"type": "array",
								"items": {
									"type": "object",
									"required": ["quote"],
									"properties": {
										"quote": { "type": "string" },
										"startOffset": { "type": "integer" },
										"endOffset": { "type": "integer" }
									}
								}
							}
						}
					}
				},
				"relationships": {
					"type": "array",
					"items": {
						"type": "object",
						"required": ["sourceIndex", "targetIndex", "type"],
						"properties": {
							"sourceIndex": { "type": "integer" },
							"targetIndex": { "type": "integer" },
							"type": {
								"type": "string",
								"enum": ["derived_from", "related_to", "duplicate_of", "blocks"]
							}
						}
					}
				}
			}
		}),
	}
}

impl PmService {
	/// Phase A. Pure with respect to the store: reads nothing, writes
	/// nothing; one schema-failure retry with the issues appended, then the
	/// failure is deterministic.
	pub async fn run_extraction(&self, note: &RawNote) -> Result<ExtractionOutput> {
		let tool = extraction_tool();
		let note_message = format_note_message(note);
		let messages = vec![Message::user(note_message.clone())];
		let first = self
			.llm
			.invoke(ToolUseRequest { system: SYSTEM_PROMPT, messages: &messages, tool: &tool })
			.await?;

		match validate_extraction(&first) {
			Ok(output) => {
				warn_on_unmatched_evidence(note, &output);

				return Ok(output);
			},
			Err(issues) => {
				warn!(
					raw_note_id = %note.raw_note_id,
					issues = ?issues,
					"Extraction output failed validation; retrying once.",
				);

				let retry_messages = vec![
					Message::user(note_message),
					Message::assistant(first.to_string()),
					Message::user(format_validation_retry(&issues)),
				];
				let second = self
					.llm
					.invoke(ToolUseRequest {
						system: SYSTEM_PROMPT,
						messages: &retry_messages,
						tool: &tool,
					})
					.await?;

				match validate_extraction(&second) {
					Ok(output) => {
						warn_on_unmatched_evidence(note, &output);

						Ok(output)
					},
					Err(issues) => {
						error!(
							raw_note_id = %note.raw_note_id,
							issues = ?issues,
							"Extraction output failed validation after retry.",
						);

						Err(Error::Upstream {
							message: format!(
								"Extraction schema validation failed twice: {}.",
								issues.join("; "),
							),
							transient: false,
						})
					},
				}
			},
		}
	}
}

fn format_note_message(note: &RawNote) -> String {
	format!(
		"source: {}\ncapturedAt: {}\nsourceMeta: {}\n---\n{}",
		note.source,
		note.captured_at,
		note.source_meta,
		note.content,
	)
}

fn format_validation_retry(issues: &[String]) -> String {
	let mut out = String::from(
		"Your previous tool call failed schema validation. Fix these issues and call the tool again:\n",
	);

	for issue in issues {
		out.push_str("- ");
		out.push_str(issue);
		out.push('\n');
	}

	out
}

fn warn_on_unmatched_evidence(note: &RawNote, output: &ExtractionOutput) {
	for (idx, entity) in output.entities.iter().enumerate() {
		for item in &entity.evidence {
			if !evidence::quote_matches(&note.content, &item.quote) {
				warn!(
					raw_note_id = %note.raw_note_id,
					entity_index = idx,
					quote = %item.quote,
					"Evidence quote is not a substring of the note.",
				);
			}
		}
	}
}

/// Strict structural validation of the tool input. Collects every issue in
/// one pass so the retry prompt can list them all.
pub fn validate_extraction(value: &Value) -> Result<ExtractionOutput, Vec<String>> {
	let mut issues = Vec::new();
	let entities_raw = match value.get("entities").and_then(Value::as_array) {
		Some(entities) => entities.clone(),
		None => {
			issues.push("entities must be an array.".to_string());

			Vec::new()
		},
	};

	if entities_raw.len() > MAX_ENTITIES_PER_NOTE {
		issues.push(format!("entities must contain at most {MAX_ENTITIES_PER_NOTE} items."));
	}

	let mut entities = Vec::with_capacity(entities_raw.len());

	for (idx, raw) in entities_raw.iter().enumerate() {
		if let Some(entity) = validate_entity(idx, raw, &mut issues) {
			entities.push(entity);
		}
	}

	let relationships =
		validate_relationships(value.get("relationships"), entities_raw.len(), &mut issues);

	if issues.is_empty() {
		Ok(ExtractionOutput { entities, relationships })
	} else {
		Err(issues)
	}
}

fn validate_entity(idx: usize, raw: &Value, issues: &mut Vec<String>) -> Option<ExtractedEntity> {
	let path = format!("entities[{idx}]");
	let before = issues.len();
	let kind = match raw.get("type").and_then(Value::as_str) {
		Some(kind) => match kind.parse::<EntityKind>() {
			Ok(kind) => Some(kind),
			Err(_) => {
				issues.push(format!("{path}.type must be one of task, decision, insight."));

				None
			},
		},
		None => {
			issues.push(format!("{path}.type is required."));

			None
		},
	};
	let content = match raw.get("content").and_then(Value::as_str) {
		Some(content) if !content.trim().is_empty() => Some(content.to_string()),
		_ => {
			issues.push(format!("{path}.content must be a non-empty string."));

			None
		},
	};
	let status = raw.get("status").and_then(Value::as_str).map(str::to_string);

	if let (Some(kind), Some(status)) = (kind, status.as_deref())
		&& !kind.is_valid_status(status)
	{
		issues.push(format!("{path}.status {status} is not valid for type {kind}."));
	}

	let attributes =
		raw.get("attributes").cloned().unwrap_or_else(|| Value::Object(Default::default()));

	if let Some(kind) = kind
		&& let Err(message) = pm_domain::entity::validate_attributes(kind, &attributes)
	{
		issues.push(format!("{path}.{message}"));
	}

	let mut field_confidences = BTreeMap::new();

	match raw.get("fieldConfidences").and_then(Value::as_object) {
		Some(map) if !map.is_empty() =>
			for (field, score) in map {
				match score.as_f64() {
					Some(score) if (0.0..=1.0).contains(&score) => {
						field_confidences.insert(field.clone(), score as f32);
					},
					_ => issues.push(format!(
						"{path}.fieldConfidences.{field} must be a number in [0,1].",
					)),
				}
			},
		_ => issues.push(format!("{path}.fieldConfidences must be a non-empty object.")),
	}

	let confidence = match raw.get("confidence").and_then(Value::as_f64) {
		Some(confidence) if (0.0..=1.0).contains(&confidence) => confidence as f32,
		_ => {
			issues.push(format!("{path}.confidence must be a number in [0,1]."));

			0.0
		},
	};

	// The entity confidence is asserted against the field minimum, never
	// trusted.
	if let Some(min) = field_confidences.values().copied().reduce(f32::min)
		&& (confidence - min).abs() > CONFIDENCE_EPSILON
	{
		issues.push(format!(
			"{path}.confidence {confidence} must equal the minimum field confidence {min}.",
		));
	}

	let evidence = validate_evidence(&path, raw.get("evidence"), issues);

	if issues.len() > before {
		return None;
	}

	Some(ExtractedEntity {
		kind: kind?,
		content: content?,
		status,
		attributes,
		confidence,
		field_confidences,
		evidence,
	})
}

fn validate_evidence(
	path: &str,
	raw: Option<&Value>,
	issues: &mut Vec<String>,
) -> Vec<ExtractedEvidence> {
	let Some(items) = raw.and_then(Value::as_array) else {
		issues.push(format!("{path}.evidence must be an array."));

		return Vec::new();
	};

	if items.is_empty() {
		issues.push(format!("{path}.evidence must contain at least one quote."));

		return Vec::new();
	}

	let mut out = Vec::with_capacity(items.len());

	for (idx, item) in items.iter().enumerate() {
		match item.get("quote").and_then(Value::as_str) {
			Some(quote) if !quote.trim().is_empty() => out.push(ExtractedEvidence {
				quote: quote.to_string(),
				start_offset: item
					.get("startOffset")
					.and_then(Value::as_u64)
					.and_then(|offset| u32::try_from(offset).ok()),
				end_offset: item
					.get("endOffset")
					.and_then(Value::as_u64)
					.and_then(|offset| u32::try_from(offset).ok()),
			}),
			_ => issues.push(format!("{path}.evidence[{idx}].quote must be a non-empty string.")),
		}
	}

	out
}

fn validate_relationships(
	raw: Option<&Value>,
	entity_count: usize,
	issues: &mut Vec<String>,
) -> Vec<ExtractedRelationship> {
	let Some(items) = raw.and_then(Value::as_array) else {
		issues.push("relationships must be an array.".to_string());

		return Vec::new();
	};
	let mut out = Vec::with_capacity(items.len());

	for (idx, item) in items.iter().enumerate() {
		let path = format!("relationships[{idx}]");
		let source = item.get("sourceIndex").and_then(Value::as_u64).map(|v| v as usize);
		let target = item.get("targetIndex").and_then(Value::as_u64).map(|v| v as usize);
		let rel_type = item
			.get("type")
			.and_then(Value::as_str)
			.and_then(|raw| raw.parse::<RelationshipType>().ok());
		let (Some(source), Some(target), Some(rel_type)) = (source, target, rel_type) else {
			issues.push(format!("{path} must carry sourceIndex, targetIndex, and a known type."));

			continue;
		};

		if source >= entity_count || target >= entity_count {
			issues.push(format!("{path} references an entity index that does not exist."));

			continue;
		}
		if source == target && !rel_type.allows_loop() {
			issues.push(format!("{path} may not point an entity at itself for {rel_type}."));

			continue;
		}

		out.push(ExtractedRelationship { source_index: source, target_index: target, rel_type });
	}

	out
}

#[cfg(test)]
mod tests {
	use super::*;

	fn valid_payload() -> Value {
		json!({
			"entities": [
				{
					"type": "task",
					"content": "Fix the flaky login test",
					"status": "captured",
					"attributes": {},
					"fieldConfidences": {"type": 0.95, "content": 0.9, "status": 0.92},
					"confidence": 0.9,
					"evidence": [{"quote": "fix the flaky login test", "startOffset": 0}]
				}
			],
			"relationships": []
		})
	}

	#[test]
	fn accepts_a_valid_payload() {
		let output = validate_extraction(&valid_payload()).expect("payload should validate");

		assert_eq!(output.entities.len(), 1);
		assert_eq!(output.entities[0].kind, EntityKind::Task);
		assert_eq!(output.entities[0].evidence[0].start_offset, Some(0));
	}

	#[test]
	fn rejects_confidence_above_field_minimum() {
		let mut payload = valid_payload();

		payload["entities"][0]["confidence"] = json!(0.99);

		let issues = validate_extraction(&payload).expect_err("mismatch must be rejected");

		assert!(issues.iter().any(|issue| issue.contains("minimum field confidence")));
	}

	#[test]
	fn rejects_status_from_the_wrong_type() {
		let mut payload = valid_payload();

		payload["entities"][0]["status"] = json!("decided");

		let issues = validate_extraction(&payload).expect_err("wrong status must be rejected");

		assert!(issues.iter().any(|issue| issue.contains("not valid for type")));
	}

	#[test]
	fn rejects_missing_evidence() {
		let mut payload = valid_payload();

		payload["entities"][0]["evidence"] = json!([]);

		assert!(validate_extraction(&payload).is_err());
	}

	#[test]
	fn rejects_out_of_range_relationship_index() {
		let mut payload = valid_payload();

		payload["relationships"] = json!([
			{"sourceIndex": 0, "targetIndex": 4, "type": "blocks"}
		]);

		let issues = validate_extraction(&payload).expect_err("bad index must be rejected");

		assert!(issues.iter().any(|issue| issue.contains("does not exist")));
	}

	#[test]
	fn rejects_self_loop_except_related_to() {
		let mut payload = valid_payload();

		payload["relationships"] = json!([
			{"sourceIndex": 0, "targetIndex": 0, "type": "blocks"}
		]);

		assert!(validate_extraction(&payload).is_err());

		payload["relationships"] = json!([
			{"sourceIndex": 0, "targetIndex": 0, "type": "related_to"}
		]);

		assert!(validate_extraction(&payload).is_ok());
	}

	#[test]
	fn collects_every_issue_in_one_pass() {
		let payload = json!({
			"entities": [
				{"type": "epic", "content": "", "fieldConfidences": {}, "confidence": 2.0, "evidence": []}
			],
			"relationships": [{"sourceIndex": 0}]
		});
		let issues = validate_extraction(&payload).expect_err("everything is wrong");

		assert!(issues.len() >= 4, "expected many issues, got {issues:?}");
	}

	#[test]
	fn retry_prompt_lists_issues() {
		let prompt = format_validation_retry(&[
			"entities[0].type is required.".to_string(),
			"relationships must be an array.".to_string(),
		]);

		assert!(prompt.contains("- entities[0].type is required."));
		assert!(prompt.contains("- relationships must be an array."));
	}
}

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The three structured units extracted from notes. Statuses are typed per
/// kind; the permitted sets and defaults live here so application code and
/// database constraints agree on one source of truth.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
	Task,
	Decision,
	Insight,
}

impl EntityKind {
	pub const fn as_str(&self) -> &'static str {
		match self {
			Self::Task => "task",
			Self::Decision => "decision",
			Self::Insight => "insight",
		}
	}

	pub const fn statuses(&self) -> &'static [&'static str] {
		match self {
			Self::Task => &["captured", "needs_action", "in_progress", "done"],
			Self::Decision => &["pending", "decided"],
			Self::Insight => &["captured", "acknowledged"],
		}
	}

	pub const fn default_status(&self) -> &'static str {
		match self {
			Self::Task => "captured",
			Self::Decision => "pending",
			Self::Insight => "captured",
		}
	}

	pub fn is_valid_status(&self, status: &str) -> bool {
		self.statuses().contains(&status)
	}
}

impl fmt::Display for EntityKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for EntityKind {
	type Err = UnknownEntityKind;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		match raw {
			"task" => Ok(Self::Task),
			"decision" => Ok(Self::Decision),
			"insight" => Ok(Self::Insight),
			other => Err(UnknownEntityKind { raw: other.to_string() }),
		}
	}
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown entity type: {raw}.")]
pub struct UnknownEntityKind {
	pub raw: String,
}

/// Validates the per-kind attribute map. Attributes are a tagged variant on
/// the wire: the entity row's `type` column discriminates, the JSON column
/// holds the data. Raw JSON is validated here at the write boundary, never
/// trusted structurally on read.
pub fn validate_attributes(kind: EntityKind, attributes: &Value) -> Result<(), String> {
	let Some(map) = attributes.as_object() else {
		return Err("attributes must be a JSON object.".to_string());
	};

	match kind {
		EntityKind::Task => {
			if let Some(priority) = map.get("priority") {
				let valid = priority
					.as_str()
					.map(|p| matches!(p, "low" | "medium" | "high"))
					.unwrap_or(false);

				if !valid {
					return Err("attributes.priority must be one of low, medium, high.".to_string());
				}
			}
			if let Some(due_date) = map.get("due_date")
				&& !due_date.is_string()
			{
				return Err("attributes.due_date must be a string.".to_string());
			}
		},
		EntityKind::Decision => {
			if let Some(options) = map.get("options") {
				let valid = options
					.as_array()
					.map(|items| items.iter().all(Value::is_string))
					.unwrap_or(false);

				if !valid {
					return Err("attributes.options must be an array of strings.".to_string());
				}
			}
			if let Some(decided) = map.get("decided_option")
				&& !decided.is_string()
			{
				return Err("attributes.decided_option must be a string.".to_string());
			}
			if let Some(rationale) = map.get("rationale")
				&& !rationale.is_string()
			{
				return Err("attributes.rationale must be a string.".to_string());
			}
		},
		EntityKind::Insight => {
			if let Some(category) = map.get("category")
				&& !category.is_string()
			{
				return Err("attributes.category must be a string.".to_string());
			}
		},
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn every_kind_accepts_its_default_status() {
		for kind in [EntityKind::Task, EntityKind::Decision, EntityKind::Insight] {
			assert!(kind.is_valid_status(kind.default_status()));
		}
	}

	#[test]
	fn statuses_are_not_shared_across_kinds() {
		assert!(!EntityKind::Decision.is_valid_status("in_progress"));
		assert!(!EntityKind::Task.is_valid_status("decided"));
		assert!(!EntityKind::Insight.is_valid_status("done"));
	}

	#[test]
	fn kind_round_trips_through_str() {
		for kind in [EntityKind::Task, EntityKind::Decision, EntityKind::Insight] {
			assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
		}
		assert!("epic".parse::<EntityKind>().is_err());
	}

	#[test]
	fn task_attributes_reject_bad_priority() {
		let err = validate_attributes(EntityKind::Task, &json!({"priority": "urgent"}))
			.expect_err("unknown priority must be rejected");

		assert!(err.contains("priority"));
	}

	#[test]
	fn decision_attributes_accept_options() {
		validate_attributes(
			EntityKind::Decision,
			&json!({"options": ["progress bar", "stepper"], "rationale": "fewer steps"}),
		)
		.expect("valid decision attributes");
	}

	#[test]
	fn attributes_must_be_an_object() {
		assert!(validate_attributes(EntityKind::Insight, &json!([1, 2])).is_err());
	}
}

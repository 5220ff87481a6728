use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::review::ReviewType;

/// A single AI-suggested field with its score. Materialization walks a list
/// of these once; there are no per-field special cases in control flow.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldConfidence {
	pub field: SuggestedField,
	pub value: Value,
	pub confidence: f32,
	#[serde(default)]
	pub evidence_refs: Vec<usize>,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedField {
	EntityType,
	Project,
	Epic,
	Assignee,
	DuplicateOf,
	EpicProposal,
	Overall,
}

impl SuggestedField {
	/// The fixed field-to-reviewType mapping.
	pub const fn review_type(&self) -> ReviewType {
		match self {
			Self::EntityType => ReviewType::TypeClassification,
			Self::Project => ReviewType::ProjectAssignment,
			Self::Epic => ReviewType::EpicAssignment,
			Self::Assignee => ReviewType::AssigneeSuggestion,
			Self::DuplicateOf => ReviewType::DuplicateDetection,
			Self::EpicProposal => ReviewType::EpicCreation,
			Self::Overall => ReviewType::LowConfidence,
		}
	}

	/// Epic proposals, duplicate verdicts, and overall-confidence flags go to
	/// review even when the model is confident: creating containers and
	/// soft-deleting entities are human calls.
	pub const fn always_reviewed(&self) -> bool {
		matches!(self, Self::EpicProposal | Self::DuplicateOf | Self::Overall)
	}
}

#[derive(Clone, Debug, Default)]
pub struct Partition {
	pub apply: Vec<FieldConfidence>,
	pub review: Vec<FieldConfidence>,
}

/// Splits suggested fields by the confidence threshold: at-or-above applies
/// directly, below funnels to the review queue.
pub fn partition(fields: Vec<FieldConfidence>, threshold: f32) -> Partition {
	let mut out = Partition::default();

	for field in fields {
		if !field.field.always_reviewed() && field.confidence >= threshold {
			out.apply.push(field);
		} else {
			out.review.push(field);
		}
	}

	out
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	fn field(kind: SuggestedField, confidence: f32) -> FieldConfidence {
		FieldConfidence { field: kind, value: json!("x"), confidence, evidence_refs: vec![] }
	}

	#[test]
	fn partition_splits_on_threshold() {
		let split = partition(
			vec![
				field(SuggestedField::Project, 0.95),
				field(SuggestedField::Assignee, 0.89),
				field(SuggestedField::Epic, 0.9),
			],
			0.9,
		);

		assert_eq!(split.apply.len(), 2);
		assert_eq!(split.review.len(), 1);
		assert_eq!(split.review[0].field, SuggestedField::Assignee);
	}

	#[test]
	fn destructive_fields_are_reviewed_even_when_confident() {
		let split = partition(
			vec![
				field(SuggestedField::EpicProposal, 0.99),
				field(SuggestedField::DuplicateOf, 0.99),
			],
			0.9,
		);

		assert!(split.apply.is_empty());
		assert_eq!(split.review.len(), 2);
	}

	#[test]
	fn field_mapping_is_fixed() {
		assert_eq!(SuggestedField::EntityType.review_type(), ReviewType::TypeClassification);
		assert_eq!(SuggestedField::Project.review_type(), ReviewType::ProjectAssignment);
		assert_eq!(SuggestedField::Epic.review_type(), ReviewType::EpicAssignment);
		assert_eq!(SuggestedField::Assignee.review_type(), ReviewType::AssigneeSuggestion);
		assert_eq!(SuggestedField::DuplicateOf.review_type(), ReviewType::DuplicateDetection);
		assert_eq!(SuggestedField::EpicProposal.review_type(), ReviewType::EpicCreation);
		assert_eq!(SuggestedField::Overall.review_type(), ReviewType::LowConfidence);
	}
}

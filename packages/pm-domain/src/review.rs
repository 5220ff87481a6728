use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewType {
	TypeClassification,
	ProjectAssignment,
	ProjectCreation,
	EpicAssignment,
	EpicCreation,
	DuplicateDetection,
	LowConfidence,
	AssigneeSuggestion,
}

impl ReviewType {
	pub const fn as_str(&self) -> &'static str {
		match self {
			Self::TypeClassification => "type_classification",
			Self::ProjectAssignment => "project_assignment",
			Self::ProjectCreation => "project_creation",
			Self::EpicAssignment => "epic_assignment",
			Self::EpicCreation => "epic_creation",
			Self::DuplicateDetection => "duplicate_detection",
			Self::LowConfidence => "low_confidence",
			Self::AssigneeSuggestion => "assignee_suggestion",
		}
	}

	/// `low_confidence` is the one review type that may pile up per entity;
	/// every other type is unique while pending.
	pub const fn unique_while_pending(&self) -> bool {
		!matches!(self, Self::LowConfidence)
	}
}

impl fmt::Display for ReviewType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ReviewType {
	type Err = UnknownReviewType;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		match raw {
			"type_classification" => Ok(Self::TypeClassification),
			"project_assignment" => Ok(Self::ProjectAssignment),
			"project_creation" => Ok(Self::ProjectCreation),
			"epic_assignment" => Ok(Self::EpicAssignment),
			"epic_creation" => Ok(Self::EpicCreation),
			"duplicate_detection" => Ok(Self::DuplicateDetection),
			"low_confidence" => Ok(Self::LowConfidence),
			"assignee_suggestion" => Ok(Self::AssigneeSuggestion),
			other => Err(UnknownReviewType { raw: other.to_string() }),
		}
	}
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown review type: {raw}.")]
pub struct UnknownReviewType {
	pub raw: String,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
	Pending,
	Accepted,
	Rejected,
	Modified,
}

impl ReviewStatus {
	pub const fn as_str(&self) -> &'static str {
		match self {
			Self::Pending => "pending",
			Self::Accepted => "accepted",
			Self::Rejected => "rejected",
			Self::Modified => "modified",
		}
	}

	pub const fn is_terminal(&self) -> bool {
		!matches!(self, Self::Pending)
	}
}

impl fmt::Display for ReviewStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ReviewStatus {
	type Err = UnknownReviewStatus;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		match raw {
			"pending" => Ok(Self::Pending),
			"accepted" => Ok(Self::Accepted),
			"rejected" => Ok(Self::Rejected),
			"modified" => Ok(Self::Modified),
			other => Err(UnknownReviewStatus { raw: other.to_string() }),
		}
	}
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown review status: {raw}.")]
pub struct UnknownReviewStatus {
	pub raw: String,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pending_is_the_only_non_terminal_status() {
		assert!(!ReviewStatus::Pending.is_terminal());
		assert!(ReviewStatus::Accepted.is_terminal());
		assert!(ReviewStatus::Rejected.is_terminal());
		assert!(ReviewStatus::Modified.is_terminal());
	}

	#[test]
	fn low_confidence_is_exempt_from_pending_uniqueness() {
		assert!(!ReviewType::LowConfidence.unique_while_pending());
		assert!(ReviewType::ProjectAssignment.unique_while_pending());
	}
}

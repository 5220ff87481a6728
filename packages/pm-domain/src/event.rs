use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Entity-scoped audit log entry kinds, append-only, ordered by
/// `(created_at, event_id)`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityEventType {
	Created,
	Comment,
	StatusChange,
	AssignmentChange,
	ReviewResolved,
}

impl EntityEventType {
	pub const fn as_str(&self) -> &'static str {
		match self {
			Self::Created => "created",
			Self::Comment => "comment",
			Self::StatusChange => "status_change",
			Self::AssignmentChange => "assignment_change",
			Self::ReviewResolved => "review_resolved",
		}
	}
}

impl fmt::Display for EntityEventType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for EntityEventType {
	type Err = UnknownEntityEventType;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		match raw {
			"created" => Ok(Self::Created),
			"comment" => Ok(Self::Comment),
			"status_change" => Ok(Self::StatusChange),
			"assignment_change" => Ok(Self::AssignmentChange),
			"review_resolved" => Ok(Self::ReviewResolved),
			other => Err(UnknownEntityEventType { raw: other.to_string() }),
		}
	}
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown entity event type: {raw}.")]
pub struct UnknownEntityEventType {
	pub raw: String,
}

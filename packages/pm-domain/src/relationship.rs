use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
	DerivedFrom,
	RelatedTo,
	DuplicateOf,
	Blocks,
}

impl RelationshipType {
	pub const fn as_str(&self) -> &'static str {
		match self {
			Self::DerivedFrom => "derived_from",
			Self::RelatedTo => "related_to",
			Self::DuplicateOf => "duplicate_of",
			Self::Blocks => "blocks",
		}
	}

	/// Self-loops create a forest everywhere except `related_to`.
	pub const fn allows_loop(&self) -> bool {
		matches!(self, Self::RelatedTo)
	}
}

impl fmt::Display for RelationshipType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for RelationshipType {
	type Err = UnknownRelationshipType;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		match raw {
			"derived_from" => Ok(Self::DerivedFrom),
			"related_to" => Ok(Self::RelatedTo),
			"duplicate_of" => Ok(Self::DuplicateOf),
			"blocks" => Ok(Self::Blocks),
			other => Err(UnknownRelationshipType { raw: other.to_string() }),
		}
	}
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown relationship type: {raw}.")]
pub struct UnknownRelationshipType {
	pub raw: String,
}

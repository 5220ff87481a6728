use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteSource {
	Cli,
	Slack,
	VoiceMemo,
	MeetingTranscript,
	Obsidian,
	Mcp,
	Api,
}

impl NoteSource {
	pub const fn as_str(&self) -> &'static str {
		match self {
			Self::Cli => "cli",
			Self::Slack => "slack",
			Self::VoiceMemo => "voice_memo",
			Self::MeetingTranscript => "meeting_transcript",
			Self::Obsidian => "obsidian",
			Self::Mcp => "mcp",
			Self::Api => "api",
		}
	}
}

impl fmt::Display for NoteSource {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for NoteSource {
	type Err = UnknownNoteSource;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		match raw {
			"cli" => Ok(Self::Cli),
			"slack" => Ok(Self::Slack),
			"voice_memo" => Ok(Self::VoiceMemo),
			"meeting_transcript" => Ok(Self::MeetingTranscript),
			"obsidian" => Ok(Self::Obsidian),
			"mcp" => Ok(Self::Mcp),
			"api" => Ok(Self::Api),
			other => Err(UnknownNoteSource { raw: other.to_string() }),
		}
	}
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown note source: {raw}.")]
pub struct UnknownNoteSource {
	pub raw: String,
}

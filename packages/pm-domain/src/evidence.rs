use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::source::NoteSource;

/// A literal quote from a raw note supporting an extracted field.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Evidence {
	pub raw_note_id: Uuid,
	pub quote: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub start_offset: Option<u32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub end_offset: Option<u32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub permalink: Option<String>,
}

/// Checks that a quote appears in the note content. Models paraphrase
/// whitespace, so a collapsed-whitespace comparison is the fallback; a miss
/// is a warning for the caller, never a rejection.
pub fn quote_matches(content: &str, quote: &str) -> bool {
	if quote.trim().is_empty() {
		return false;
	}
	if content.contains(quote) {
		return true;
	}

	collapse_whitespace(content).contains(&collapse_whitespace(quote))
}

fn collapse_whitespace(raw: &str) -> String {
	raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Derives a permalink for evidence where the source supports one. Slack
/// messages carry one in their metadata; Obsidian notes link back into the
/// vault file. Everything else gets none.
pub fn derive_permalink(
	source: NoteSource,
	source_meta: &Value,
	start_offset: Option<u32>,
) -> Option<String> {
	match source {
		NoteSource::Slack =>
			source_meta.get("permalink").and_then(Value::as_str).map(String::from),
		NoteSource::Obsidian => {
			let path = source_meta.get("file_path").and_then(Value::as_str)?;

			match start_offset {
				Some(offset) => Some(format!("file://{path}#{offset}")),
				None => Some(format!("file://{path}")),
			}
		},
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn exact_substring_matches() {
		assert!(quote_matches("We should switch onboarding from 5 to 3 steps.", "5 to 3 steps"));
	}

	#[test]
	fn whitespace_paraphrase_matches() {
		assert!(quote_matches("keep  the\nprogress bar", "keep the progress bar"));
	}

	#[test]
	fn unrelated_quote_does_not_match() {
		assert!(!quote_matches("keep the progress bar", "remove the stepper"));
		assert!(!quote_matches("anything", "   "));
	}

	#[test]
	fn slack_permalink_comes_from_meta() {
		let meta = json!({"channel_id": "C1", "permalink": "https://x.slack.com/p1"});

		assert_eq!(
			derive_permalink(NoteSource::Slack, &meta, None).as_deref(),
			Some("https://x.slack.com/p1"),
		);
	}

	#[test]
	fn obsidian_permalink_includes_offset() {
		let meta = json!({"file_path": "/vault/daily/2026-02-06.md"});

		assert_eq!(
			derive_permalink(NoteSource::Obsidian, &meta, Some(120)).as_deref(),
			Some("file:///vault/daily/2026-02-06.md#120"),
		);
	}

	#[test]
	fn cli_has_no_permalink() {
		assert_eq!(derive_permalink(NoteSource::Cli, &json!({}), Some(3)), None);
	}
}

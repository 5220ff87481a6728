use uuid::Uuid;

/// Deterministic capture-dedup hash for notes without an explicit external
/// id. Field separators keep `("a", "bc")` and `("ab", "c")` distinct.
pub fn dedupe_hash(source: &str, content: &str, captured_by: Option<Uuid>) -> String {
	let mut hasher = blake3::Hasher::new();

	hasher.update(source.as_bytes());
	hasher.update(&[0x1f]);
	hasher.update(content.as_bytes());
	hasher.update(&[0x1f]);

	if let Some(user_id) = captured_by {
		hasher.update(user_id.as_bytes());
	}

	hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn is_deterministic() {
		let a = dedupe_hash("cli", "ship the release", None);
		let b = dedupe_hash("cli", "ship the release", None);

		assert_eq!(a, b);
	}

	#[test]
	fn differs_by_source_content_and_user() {
		let base = dedupe_hash("cli", "ship the release", None);

		assert_ne!(base, dedupe_hash("slack", "ship the release", None));
		assert_ne!(base, dedupe_hash("cli", "ship the releases", None));
		assert_ne!(base, dedupe_hash("cli", "ship the release", Some(Uuid::new_v4())));
	}

	#[test]
	fn separators_prevent_boundary_collisions() {
		assert_ne!(dedupe_hash("a", "bc", None), dedupe_hash("ab", "c", None));
	}
}

pub fn render_schema() -> String {
	expand_includes(include_str!("../../../sql/init.sql"))
}

fn expand_includes(sql: &str) -> String {
	let mut out = String::new();

	for line in sql.lines() {
		let trimmed = line.trim();

		if let Some(path) = trimmed.strip_prefix("\\ir ") {
			match path.trim() {
				"00_functions.sql" => out.push_str(include_str!("../../../sql/00_functions.sql")),
				"tables/001_users.sql" =>
					out.push_str(include_str!("../../../sql/tables/001_users.sql")),
				"tables/002_api_keys.sql" =>
					out.push_str(include_str!("../../../sql/tables/002_api_keys.sql")),
				"tables/003_projects.sql" =>
					out.push_str(include_str!("../../../sql/tables/003_projects.sql")),
				"tables/004_epics.sql" =>
					out.push_str(include_str!("../../../sql/tables/004_epics.sql")),
				"tables/005_raw_notes.sql" =>
					out.push_str(include_str!("../../../sql/tables/005_raw_notes.sql")),
				"tables/006_entities.sql" =>
					out.push_str(include_str!("../../../sql/tables/006_entities.sql")),
				"tables/007_entity_sources.sql" =>
					out.push_str(include_str!("../../../sql/tables/007_entity_sources.sql")),
				"tables/008_entity_relationships.sql" =>
					out.push_str(include_str!("../../../sql/tables/008_entity_relationships.sql")),
				"tables/009_tags.sql" =>
					out.push_str(include_str!("../../../sql/tables/009_tags.sql")),
				"tables/010_entity_tags.sql" =>
					out.push_str(include_str!("../../../sql/tables/010_entity_tags.sql")),
				"tables/011_entity_events.sql" =>
					out.push_str(include_str!("../../../sql/tables/011_entity_events.sql")),
				"tables/012_review_queue.sql" =>
					out.push_str(include_str!("../../../sql/tables/012_review_queue.sql")),
				"tables/013_jobs.sql" =>
					out.push_str(include_str!("../../../sql/tables/013_jobs.sql")),
				"99_lineage.sql" => out.push_str(include_str!("../../../sql/99_lineage.sql")),
				_ => out.push_str(line),
			}
		} else {
			out.push_str(line);
		}

		out.push('\n');
	}

	out
}

/// Splits rendered DDL into executable statements. A plain split on `;`
/// would cut function bodies apart, so dollar-quoted sections are kept
/// intact.
pub fn split_statements(sql: &str) -> Vec<String> {
	let mut statements = Vec::new();
	let mut current = String::new();
	let mut dollar_tag: Option<String> = None;
	let mut rest = sql;

	while let Some(ch) = rest.chars().next() {
		match dollar_tag.as_deref() {
			Some(tag) if rest.starts_with(tag) => {
				current.push_str(tag);
				rest = &rest[tag.len()..];
				dollar_tag = None;

				continue;
			},
			None if ch == '$' =>
				if let Some(tag) = leading_dollar_tag(rest) {
					current.push_str(&tag);
					rest = &rest[tag.len()..];
					dollar_tag = Some(tag);

					continue;
				},
			None if ch == ';' => {
				let statement = current.trim();

				if !statement.is_empty() {
					statements.push(statement.to_string());
				}

				current.clear();
				rest = &rest[1..];

				continue;
			},
			_ => {},
		}

		current.push(ch);
		rest = &rest[ch.len_utf8()..];
	}

	let tail = current.trim();

	if !tail.is_empty() {
		statements.push(tail.to_string());
	}

	statements
}

/// Parses a `$tag$` opener at the start of `raw`, returning the full tag
/// including both dollar signs.
fn leading_dollar_tag(raw: &str) -> Option<String> {
	let mut chars = raw.char_indices();
	let (_, first) = chars.next()?;

	if first != '$' {
		return None;
	}

	for (idx, ch) in chars {
		if ch == '$' {
			return Some(raw[..=idx].to_string());
		}
		if !ch.is_ascii_alphanumeric() && ch != '_' {
			return None;
		}
	}

	None
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rendered_schema_has_no_unresolved_includes() {
		let schema = render_schema();

		assert!(!schema.contains("\\ir "), "all includes should expand");
		assert!(schema.contains("CREATE TABLE IF NOT EXISTS entities"));
		assert!(schema.contains("get_entity_lineage"));
	}

	#[test]
	fn split_keeps_function_bodies_whole() {
		let statements = split_statements(
			"CREATE TABLE t (id INT);\n\
			 CREATE FUNCTION f() RETURNS TRIGGER AS $fn$ BEGIN NEW.x = 1; RETURN NEW; END; $fn$ LANGUAGE plpgsql;\n\
			 CREATE INDEX i ON t (id);",
		);

		assert_eq!(statements.len(), 3);
		assert!(statements[1].contains("RETURN NEW;"));
	}

	#[test]
	fn split_handles_the_real_schema() {
		let statements = split_statements(&render_schema());

		assert!(statements.iter().any(|s| s.starts_with("CREATE OR REPLACE FUNCTION set_updated_at")));
		assert!(
			statements
				.iter()
				.any(|s| s.starts_with("CREATE OR REPLACE FUNCTION get_entity_lineage"))
		);
		// Every statement should be non-empty DDL, not a fragment.
		for statement in &statements {
			assert!(
				statement.starts_with("CREATE"),
				"unexpected statement start: {statement:.40}"
			);
		}
	}
}

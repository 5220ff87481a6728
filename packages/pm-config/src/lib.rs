mod error;
mod types;

pub use error::{Error, Result};
pub use types::{Auth, Config, Jobs, Llm, Postgres, Review, Service, Storage, Training};

use std::{env, fs, path::Path};

pub fn load(path: &Path) -> Result<Config> {
	let raw = fs::read_to_string(path)
		.map_err(|err| Error::ReadConfig { path: path.to_path_buf(), source: err })?;
	let mut cfg: Config = toml::from_str(&raw)
		.map_err(|err| Error::ParseConfig { path: path.to_path_buf(), source: err })?;

	apply_env_overrides(&mut cfg);
	validate(&cfg)?;

	Ok(cfg)
}

pub fn from_env() -> Result<Config> {
	let mut cfg = Config::default();

	apply_env_overrides(&mut cfg);
	validate(&cfg)?;

	Ok(cfg)
}

/// Recognized environment variables override file values.
fn apply_env_overrides(cfg: &mut Config) {
	if let Ok(dsn) = env::var("DATABASE_URL") {
		cfg.storage.postgres.dsn = dsn;
	}
	if let Ok(key) = env::var("ANTHROPIC_API_KEY") {
		cfg.llm.api_key = key;
	}
	if let Ok(model) = env::var("ANTHROPIC_EXTRACTION_MODEL") {
		cfg.llm.extraction_model = model;
	}
	if let Ok(pepper) = env::var("API_KEY_HASH_PEPPER") {
		cfg.auth.key_hash_pepper = pepper;
	}
	if let Ok(origins) = env::var("CORS_ORIGINS") {
		cfg.service.cors_origins =
			origins.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect();
	}
	if let Ok(port) = env::var("PORT")
		&& port.parse::<u16>().is_ok()
	{
		cfg.service.http_bind = format!("0.0.0.0:{port}");
	}
	if let Ok(level) = env::var("LOG_LEVEL") {
		cfg.service.log_level = level;
	}
	if let Ok(concurrency) = env::var("WORKER_CONCURRENCY")
		&& let Ok(parsed) = concurrency.parse::<u32>()
	{
		cfg.jobs.default_concurrency = parsed;
	}
	if let Ok(threshold) = env::var("CONFIDENCE_THRESHOLD")
		&& let Ok(parsed) = threshold.parse::<f32>()
	{
		cfg.review.confidence_threshold = parsed;
	}
	if let Ok(window) = env::var("DEDUP_WINDOW_MS")
		&& let Ok(parsed) = window.parse::<u64>()
	{
		cfg.jobs.dedup_window_ms = parsed;
	}
}

pub fn validate(cfg: &Config) -> Result<()> {
	if cfg.storage.postgres.dsn.trim().is_empty() {
		return Err(Error::Validation {
			message: "storage.postgres.dsn (or DATABASE_URL) must be non-empty.".to_string(),
		});
	}
	if cfg.storage.postgres.pool_max_conns == 0 {
		return Err(Error::Validation {
			message: "storage.postgres.pool_max_conns must be greater than zero.".to_string(),
		});
	}
	if cfg.service.http_bind.trim().is_empty() {
		return Err(Error::Validation {
			message: "service.http_bind must be non-empty.".to_string(),
		});
	}
	if !(0.0..=1.0).contains(&cfg.review.confidence_threshold) {
		return Err(Error::Validation {
			message: "review.confidence_threshold must be in the range 0.0-1.0.".to_string(),
		});
	}
	if cfg.llm.extraction_model.trim().is_empty() {
		return Err(Error::Validation {
			message: "llm.extraction_model must be non-empty.".to_string(),
		});
	}
	if cfg.llm.prompt_version.trim().is_empty() {
		return Err(Error::Validation {
			message: "llm.prompt_version must be non-empty.".to_string(),
		});
	}
	if cfg.llm.max_output_tokens == 0 {
		return Err(Error::Validation {
			message: "llm.max_output_tokens must be greater than zero.".to_string(),
		});
	}
	if cfg.llm.timeout_ms == 0 {
		return Err(Error::Validation {
			message: "llm.timeout_ms must be greater than zero.".to_string(),
		});
	}

	for (path, value) in [
		("jobs.extract_concurrency", cfg.jobs.extract_concurrency),
		("jobs.organize_concurrency", cfg.jobs.organize_concurrency),
		("jobs.reprocess_concurrency", cfg.jobs.reprocess_concurrency),
		("jobs.default_concurrency", cfg.jobs.default_concurrency),
	] {
		if value == 0 {
			return Err(Error::Validation {
				message: format!("{path} must be greater than zero."),
			});
		}
	}

	if !cfg.auth.disabled && cfg.auth.key_hash_pepper.trim().is_empty() {
		return Err(Error::Validation {
			message: "auth.key_hash_pepper (or API_KEY_HASH_PEPPER) is required unless auth.disabled is true.".to_string(),
		});
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn minimal() -> Config {
		let mut cfg = Config::default();
		cfg.storage.postgres.dsn = "postgres://localhost/pm".to_string();
		cfg.auth.disabled = true;
		cfg
	}

	#[test]
	fn minimal_config_validates() {
		validate(&minimal()).expect("minimal config should validate");
	}

	#[test]
	fn rejects_out_of_range_threshold() {
		let mut cfg = minimal();
		cfg.review.confidence_threshold = 1.5;

		let err = validate(&cfg).expect_err("threshold above 1.0 must be rejected");

		assert!(matches!(err, Error::Validation { .. }));
	}

	#[test]
	fn rejects_missing_pepper_when_auth_enabled() {
		let mut cfg = minimal();
		cfg.auth.disabled = false;

		assert!(validate(&cfg).is_err());
	}

	#[test]
	fn parses_toml_with_partial_sections() {
		let cfg: Config = toml::from_str(
			r#"
[storage.postgres]
dsn = "postgres://localhost/pm"

[review]
confidence_threshold = 0.8
"#,
		)
		.expect("partial toml should parse");

		assert_eq!(cfg.review.confidence_threshold, 0.8);
		assert_eq!(cfg.jobs.extract_concurrency, 5);
		assert_eq!(cfg.llm.extraction_model, "claude-sonnet-4-20250514");
	}
}

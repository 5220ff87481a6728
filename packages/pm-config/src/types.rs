use serde::Deserialize;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
	pub service: Service,
	pub storage: Storage,
	pub auth: Auth,
	pub llm: Llm,
	pub jobs: Jobs,
	pub review: Review,
	pub training: Training,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Service {
	pub http_bind: String,
	pub log_level: String,
	pub cors_origins: Vec<String>,
	pub request_timeout_secs: u64,
	pub health_timeout_secs: u64,
	pub sse_keepalive_secs: u64,
	pub sse_coalesce_ms: u64,
}
impl Default for Service {
	fn default() -> Self {
		Self {
			http_bind: "127.0.0.1:8080".to_string(),
			log_level: "info".to_string(),
			cors_origins: Vec::new(),
			request_timeout_secs: 30,
			health_timeout_secs: 5,
			sse_keepalive_secs: 20,
			sse_coalesce_ms: 100,
		}
	}
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Storage {
	pub postgres: Postgres,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Postgres {
	pub dsn: String,
	pub pool_max_conns: u32,
}
impl Default for Postgres {
	fn default() -> Self {
		Self { dsn: String::new(), pool_max_conns: 20 }
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Auth {
	pub disabled: bool,
	pub key_hash_pepper: String,
}
impl Default for Auth {
	fn default() -> Self {
		Self { disabled: false, key_hash_pepper: String::new() }
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Llm {
	pub api_base: String,
	pub api_key: String,
	pub extraction_model: String,
	pub prompt_version: String,
	pub max_output_tokens: u32,
	pub timeout_ms: u64,
}
impl Default for Llm {
	fn default() -> Self {
		Self {
			api_base: "https://api.anthropic.com".to_string(),
			api_key: String::new(),
			extraction_model: "claude-sonnet-4-20250514".to_string(),
			prompt_version: "v3".to_string(),
			max_output_tokens: 4_096,
			timeout_ms: 60_000,
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Jobs {
	pub extract_concurrency: u32,
	pub organize_concurrency: u32,
	pub reprocess_concurrency: u32,
	pub default_concurrency: u32,
	pub dedup_window_ms: u64,
	pub default_deadline_secs: u64,
	pub extract_deadline_secs: u64,
}
impl Default for Jobs {
	fn default() -> Self {
		Self {
			extract_concurrency: 5,
			organize_concurrency: 5,
			reprocess_concurrency: 2,
			default_concurrency: 2,
			dedup_window_ms: 600_000,
			default_deadline_secs: 300,
			extract_deadline_secs: 600,
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Review {
	pub confidence_threshold: f32,
}
impl Default for Review {
	fn default() -> Self {
		Self { confidence_threshold: 0.9 }
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Training {
	pub export_dir: String,
}
impl Default for Training {
	fn default() -> Self {
		Self { export_dir: "./training-exports".to_string() }
	}
}

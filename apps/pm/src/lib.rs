pub mod client;
pub mod config;
pub mod vault;

use std::{
	env, fs,
	io::{self, Write as _},
	path::{Path, PathBuf},
};

use clap::{Parser, Subcommand};
use color_eyre::eyre::eyre;
use serde::Deserialize;
use serde_json::{Value, json};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use uuid::Uuid;

use crate::{client::ApiClient, config::CliConfig};

#[derive(Debug, Parser)]
#[command(
	name = "pm",
	version = pm_cli::VERSION,
	rename_all = "kebab",
	styles = pm_cli::styles(),
)]
pub struct Args {
	#[command(subcommand)]
	pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
	/// Point the CLI at a server, or show the current settings.
	Config {
		#[arg(long)]
		url: Option<String>,
		#[arg(long)]
		key: Option<String>,
		#[arg(long)]
		vault: Option<PathBuf>,
		#[arg(long)]
		show: bool,
	},
	/// Capture a note from the command line.
	Capture {
		#[arg(required = true, trailing_var_arg = true)]
		content: Vec<String>,
	},
	/// List active projects.
	Projects,
	/// List tasks, optionally filtered.
	Tasks {
		#[arg(long)]
		project: Option<Uuid>,
		#[arg(long)]
		status: Option<String>,
		#[arg(long)]
		assignee: Option<Uuid>,
	},
	/// Move an entity to a new status.
	Status { id: Uuid, new_status: String },
	/// Walk pending review items interactively.
	Review {
		#[arg(long, default_value_t = 20)]
		limit: i64,
	},
	/// Upload modified vault files as notes.
	SessionSync {
		#[arg(long)]
		since: Option<String>,
		#[arg(long)]
		dry_run: bool,
		#[arg(long)]
		vault: Option<PathBuf>,
	},
}

#[derive(Debug, Deserialize)]
struct Page<T> {
	items: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectRow {
	id: Uuid,
	name: String,
	status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntityRow {
	id: Uuid,
	content: String,
	status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewRow {
	id: Uuid,
	review_type: String,
	entity_id: Option<Uuid>,
	ai_suggestion: Value,
	ai_confidence: f32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CaptureReply {
	note: NoteReply,
	deduped: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NoteReply {
	id: Uuid,
}

pub async fn run(args: Args) -> color_eyre::Result<()> {
	match args.command {
		Command::Config { url, key, vault, show } => run_config(url, key, vault, show),
		Command::Capture { content } => run_capture(content.join(" ")).await,
		Command::Projects => run_projects().await,
		Command::Tasks { project, status, assignee } =>
			run_tasks(project, status, assignee).await,
		Command::Status { id, new_status } => run_status(id, &new_status).await,
		Command::Review { limit } => run_review(limit).await,
		Command::SessionSync { since, dry_run, vault } =>
			run_session_sync(since, dry_run, vault).await,
	}
}

fn run_config(
	url: Option<String>,
	key: Option<String>,
	vault: Option<PathBuf>,
	show: bool,
) -> color_eyre::Result<()> {
	let mut cfg = CliConfig::load()?;

	if show || (url.is_none() && key.is_none() && vault.is_none()) {
		println!("url: {}", cfg.url.as_deref().unwrap_or("(unset)"));
		println!(
			"key: {}",
			if cfg.key.is_some() { "(configured)" } else { "(unset)" },
		);
		println!(
			"vault: {}",
			cfg.vault_dir
				.as_deref()
				.map(|path| path.display().to_string())
				.unwrap_or_else(|| "(unset)".to_string()),
		);

		return Ok(());
	}

	if let Some(url) = url {
		cfg.url = Some(url);
	}
	if let Some(key) = key {
		cfg.key = Some(key);
	}
	if let Some(vault) = vault {
		cfg.vault_dir = Some(vault);
	}

	cfg.store()?;
	println!("Saved {}", CliConfig::path()?.display());

	Ok(())
}

async fn run_capture(content: String) -> color_eyre::Result<()> {
	if content.trim().is_empty() {
		return Err(eyre!("Nothing to capture."));
	}

	let cfg = CliConfig::load()?;
	let client = ApiClient::from_config(&cfg)?;
	let working_directory =
		env::current_dir().map(|dir| dir.display().to_string()).unwrap_or_default();
	let git_branch = current_git_branch(Path::new(&working_directory));
	let reply: CaptureReply = client
		.post(
			"/notes/capture",
			json!({
				"content": content,
				"source": "cli",
				"sourceMeta": {
					"workingDirectory": working_directory,
					"gitBranch": git_branch,
				},
			}),
		)
		.await?;

	if reply.deduped {
		println!("Already captured as {}", reply.note.id);
	} else {
		println!("Captured {}", reply.note.id);
	}

	Ok(())
}

/// Reads `.git/HEAD` walking up from the working directory; no libgit needed
/// for a branch label.
fn current_git_branch(start: &Path) -> Option<String> {
	let mut dir = Some(start);

	while let Some(current) = dir {
		let head = current.join(".git").join("HEAD");

		if let Ok(raw) = fs::read_to_string(&head) {
			let raw = raw.trim();

			return Some(match raw.strip_prefix("ref: refs/heads/") {
				Some(branch) => branch.to_string(),
				None => raw.chars().take(12).collect(),
			});
		}

		dir = current.parent();
	}

	None
}

async fn run_projects() -> color_eyre::Result<()> {
	let cfg = CliConfig::load()?;
	let client = ApiClient::from_config(&cfg)?;
	let page: Page<ProjectRow> = client.get("/projects").await?;

	if page.items.is_empty() {
		println!("No active projects.");

		return Ok(());
	}

	for project in page.items {
		println!("{}  {}  [{}]", project.id, project.name, project.status);
	}

	Ok(())
}

async fn run_tasks(
	project: Option<Uuid>,
	status: Option<String>,
	assignee: Option<Uuid>,
) -> color_eyre::Result<()> {
	let cfg = CliConfig::load()?;
	let client = ApiClient::from_config(&cfg)?;
	let mut path = String::from("/entities?type=task");

	if let Some(project) = project {
		path.push_str(&format!("&projectId={project}"));
	}
	if let Some(status) = status {
		path.push_str(&format!("&status={status}"));
	}
	if let Some(assignee) = assignee {
		path.push_str(&format!("&assigneeId={assignee}"));
	}

	let page: Page<EntityRow> = client.get(&path).await?;

	if page.items.is_empty() {
		println!("No tasks.");

		return Ok(());
	}

	for task in page.items {
		println!("{}  [{}]  {}", task.id, task.status, task.content);
	}

	Ok(())
}

async fn run_status(id: Uuid, new_status: &str) -> color_eyre::Result<()> {
	let cfg = CliConfig::load()?;
	let client = ApiClient::from_config(&cfg)?;
	let entity: EntityRow = client
		.post(&format!("/entities/{id}/status"), json!({ "newStatus": new_status }))
		.await?;

	println!("{}  [{}]  {}", entity.id, entity.status, entity.content);

	Ok(())
}

async fn run_review(limit: i64) -> color_eyre::Result<()> {
	let cfg = CliConfig::load()?;
	let client = ApiClient::from_config(&cfg)?;
	let page: Page<ReviewRow> =
		client.get(&format!("/review-queue?status=pending&limit={limit}")).await?;

	if page.items.is_empty() {
		println!("Review queue is empty.");

		return Ok(());
	}

	let total = page.items.len();

	for (idx, item) in page.items.into_iter().enumerate() {
		println!("\n[{}/{total}] {} (confidence {:.2})", idx + 1, item.review_type, item.ai_confidence);

		if let Some(entity_id) = item.entity_id {
			println!("  entity: {entity_id}");
		}

		println!("  suggestion: {}", item.ai_suggestion);
		print!("  [a]ccept / [r]eject / [m]odify / [s]kip / [q]uit > ");
		io::stdout().flush()?;

		let mut line = String::new();

		io::stdin().read_line(&mut line)?;

		match line.trim() {
			"a" => {
				let _: Value = client
					.post(
						&format!("/review-queue/{}/resolve", item.id),
						json!({ "status": "accepted" }),
					)
					.await?;

				println!("  accepted");
			},
			"r" => {
				let _: Value = client
					.post(
						&format!("/review-queue/{}/resolve", item.id),
						json!({ "status": "rejected" }),
					)
					.await?;

				println!("  rejected");
			},
			"m" => {
				print!("  resolution JSON > ");
				io::stdout().flush()?;

				let mut resolution = String::new();

				io::stdin().read_line(&mut resolution)?;

				let resolution: Value = serde_json::from_str(resolution.trim())
					.map_err(|err| eyre!("Invalid JSON: {err}"))?;
				let _: Value = client
					.post(
						&format!("/review-queue/{}/resolve", item.id),
						json!({ "status": "modified", "userResolution": resolution }),
					)
					.await?;

				println!("  modified");
			},
			"q" => break,
			_ => println!("  skipped"),
		}
	}

	Ok(())
}

async fn run_session_sync(
	since: Option<String>,
	dry_run: bool,
	vault_override: Option<PathBuf>,
) -> color_eyre::Result<()> {
	let cfg = CliConfig::load()?;
	let vault_dir = vault_override
		.or_else(|| cfg.vault_dir.clone())
		.ok_or_else(|| eyre!("No vault directory configured. Run: pm config --vault <DIR>"))?;
	let since_ms = match since.as_deref() {
		Some(raw) => {
			let parsed = OffsetDateTime::parse(raw, &Rfc3339)
				.map_err(|_| eyre!("--since must be an RFC3339 timestamp."))?;

			Some((parsed.unix_timestamp_nanos() / 1_000_000) as u128)
		},
		None => None,
	};
	let files = vault::collect(&vault_dir, since_ms)?;

	if files.is_empty() {
		println!("Nothing to sync.");

		return Ok(());
	}

	if dry_run {
		for file in &files {
			println!("would sync {} ({})", file.path.display(), file.external_id);
		}

		println!("{} files (dry run).", files.len());

		return Ok(());
	}

	let client = ApiClient::from_config(&cfg)?;
	let mut synced = 0_usize;
	let mut deduped = 0_usize;

	for file in &files {
		let content = fs::read_to_string(&file.path)?;

		if content.trim().is_empty() {
			continue;
		}

		let reply: CaptureReply = client
			.post(
				"/notes/capture",
				json!({
					"content": content,
					"source": "obsidian",
					"externalId": file.external_id,
					"sourceMeta": {
						"filePath": file.path.display().to_string(),
						"mtimeMs": file.mtime_ms.to_string(),
					},
				}),
			)
			.await?;

		if reply.deduped {
			deduped += 1;
		} else {
			synced += 1;
		}
	}

	println!("Synced {synced} notes ({deduped} already captured).");

	Ok(())
}

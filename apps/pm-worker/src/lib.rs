use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use pm_bus::Bus;
use pm_jobs::Runner;
use pm_providers::AnthropicClient;
use pm_service::{PmService, handlers};

#[derive(Debug, Parser)]
#[command(
	version = pm_cli::VERSION,
	rename_all = "kebab",
	styles = pm_cli::styles(),
)]
pub struct Args {
	/// Optional TOML config; environment variables override, and a bare
	/// environment is enough on its own.
	#[arg(long, short = 'c', value_name = "FILE")]
	pub config: Option<PathBuf>,
}

/// Hosts the five durable queues. Draining is graceful: SIGINT cancels the
/// runner token, in-flight handlers finish or release their jobs, then the
/// process exits. Events committed here reach API processes over Postgres
/// NOTIFY; the worker itself has no subscribers.
pub async fn run(args: Args) -> color_eyre::Result<()> {
	let config = match args.config.as_deref() {
		Some(path) => pm_config::load(path)?,
		None => pm_config::from_env()?,
	};

	init_tracing(&config);

	let db = pm_storage::db::Db::connect(&config.storage.postgres).await?;

	db.ensure_schema().await?;

	let runner_db = Arc::new(pm_storage::db::Db { pool: db.pool.clone() });
	let bus = Arc::new(Bus::new());
	let llm = Arc::new(AnthropicClient::new(config.llm.clone())?);
	let service = Arc::new(PmService::new(config, db, bus, llm));
	let mut runner = Runner::new(runner_db);

	handlers::register_queues(&mut runner, service);

	let cancel = runner.cancel_token();

	tokio::spawn(async move {
		let _ = tokio::signal::ctrl_c().await;

		tracing::info!("Shutdown requested; draining queues.");
		cancel.cancel();
	});

	runner.run().await;

	Ok(())
}

fn init_tracing(config: &pm_config::Config) {
	let filter = EnvFilter::try_new(&config.service.log_level)
		.unwrap_or_else(|_| EnvFilter::new("info"));

	tracing_subscriber::fmt().with_env_filter(filter).init();
}

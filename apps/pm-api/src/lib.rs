pub mod routes;
pub mod sse;
pub mod state;

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::state::AppState;

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

pub async fn run(args: Args) -> color_eyre::Result<()> {
	let config = match args.config.as_deref() {
		Some(path) => pm_config::load(path)?,
		None => pm_config::from_env()?,
	};

	init_tracing(&config);

	let http_addr: SocketAddr = config.service.http_bind.parse()?;
	let dsn = config.storage.postgres.dsn.clone();
	let state = AppState::new(config).await?;
	let cancel = CancellationToken::new();
	let bridge = tokio::spawn(pm_bus::run_notify_bridge(
		dsn,
		Arc::clone(&state.bus),
		cancel.clone(),
	));
	let app = routes::router(state);
	let listener = TcpListener::bind(http_addr).await?;

	tracing::info!(%http_addr, "HTTP server listening.");

	axum::serve(listener, app)
		.with_graceful_shutdown(shutdown_signal(cancel.clone()))
		.await?;

	cancel.cancel();
	bridge.await.ok();

	Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
	let _ = tokio::signal::ctrl_c().await;

	cancel.cancel();
}

fn init_tracing(config: &pm_config::Config) {
	let filter = EnvFilter::try_new(&config.service.log_level)
		.unwrap_or_else(|_| EnvFilter::new("info"));

	tracing_subscriber::fmt().with_env_filter(filter).init();
}

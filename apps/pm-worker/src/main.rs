use clap::Parser;

use pm_worker::Args;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	color_eyre::install()?;
	dotenvy::dotenv().ok();

	let args = Args::parse();

	pm_worker::run(args).await
}

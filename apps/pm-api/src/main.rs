use clap::Parser;

use pm_api::Args;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	color_eyre::install()?;
	dotenvy::dotenv().ok();

	let args = Args::parse();

	pm_api::run(args).await
}

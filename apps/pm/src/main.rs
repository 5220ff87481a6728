use std::process::ExitCode;

use clap::Parser;

use pm::Args;

#[tokio::main]
async fn main() -> ExitCode {
	if color_eyre::install().is_err() {
		eprintln!("Failed to install error reporting.");

		return ExitCode::FAILURE;
	}

	let args = Args::parse();

	match pm::run(args).await {
		Ok(()) => ExitCode::SUCCESS,
		Err(err) => {
			eprintln!("{err}");

			ExitCode::FAILURE
		},
	}
}

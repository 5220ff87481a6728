mod error;

pub use error::{Error, Result};

use std::{str::FromStr, thread};

use sqlx::{
	ConnectOptions, Executor,
	postgres::{PgConnectOptions, PgConnection},
};
use tokio::runtime::Builder;
use uuid::Uuid;

const ADMIN_DATABASES: [&str; 2] = ["postgres", "template1"];

/// A throwaway database per test: created against the DSN in `PM_PG_DSN`,
/// dropped on cleanup (or best-effort from `Drop` when a test forgets).
pub struct TestDatabase {
	name: String,
	dsn: String,
	admin_options: PgConnectOptions,
	cleaned: bool,
}

impl TestDatabase {
	pub async fn new(base_dsn: &str) -> Result<Self> {
		let base_options: PgConnectOptions = PgConnectOptions::from_str(base_dsn)
			.map_err(|err| Error::Message(format!("Failed to parse PM_PG_DSN: {err}.")))?;
		let (admin_options, mut admin_conn) = connect_admin(&base_options).await?;
		let name = format!("pm_test_{}", Uuid::new_v4().simple());
		let create_sql = format!(r#"CREATE DATABASE "{name}""#);

		admin_conn
			.execute(create_sql.as_str())
			.await
			.map_err(|err| Error::Message(format!("Failed to create test database: {err}.")))?;

		let dsn = base_options.clone().database(&name).to_url_lossy().to_string();

		Ok(Self { name, dsn, admin_options, cleaned: false })
	}

	pub fn dsn(&self) -> &str {
		&self.dsn
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub async fn cleanup(mut self) -> Result<()> {
		if self.cleaned {
			return Ok(());
		}

		cleanup_database(&self.name, &self.admin_options).await?;
		self.cleaned = true;

		Ok(())
	}
}

impl Drop for TestDatabase {
	fn drop(&mut self) {
		if self.cleaned {
			return;
		}

		let name = self.name.clone();
		let admin_options = self.admin_options.clone();
		let cleanup_thread = thread::spawn(move || {
			let runtime = match Builder::new_current_thread().enable_all().build() {
				Ok(runtime) => runtime,
				Err(err) => {
					eprintln!("Test database cleanup failed: {err}.");

					return;
				},
			};

			if let Err(err) = runtime.block_on(cleanup_database(&name, &admin_options)) {
				eprintln!("Test database cleanup failed: {err}.");
			}
		});

		let _ = cleanup_thread.join();
	}
}

async fn connect_admin(
	base: &PgConnectOptions,
) -> Result<(PgConnectOptions, PgConnection)> {
	let mut last_error = None;

	for database in ADMIN_DATABASES {
		let options = base.clone().database(database);

		match options.connect().await {
			Ok(conn) => return Ok((options, conn)),
			Err(err) => last_error = Some(err),
		}
	}

	Err(Error::Message(format!(
		"Failed to connect to an admin database: {}.",
		last_error.map(|err| err.to_string()).unwrap_or_default(),
	)))
}

async fn cleanup_database(name: &str, admin_options: &PgConnectOptions) -> Result<()> {
	let mut conn = admin_options.clone().connect().await?;
	let terminate_sql = format!(
		"SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
		 WHERE datname = '{name}' AND pid <> pg_backend_pid()",
	);
	let drop_sql = format!(r#"DROP DATABASE IF EXISTS "{name}""#);

	conn.execute(terminate_sql.as_str()).await?;
	conn.execute(drop_sql.as_str()).await?;

	Ok(())
}

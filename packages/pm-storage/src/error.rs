#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Sqlx(sqlx::Error),
	#[error("Invalid argument: {0}")]
	InvalidArgument(String),
	#[error("Not found: {0}")]
	NotFound(String),
	#[error("Conflict: {0}")]
	Conflict(String),
}

impl Error {
	/// Serialization failures and deadlocks are worth retrying; everything
	/// else is deterministic.
	pub fn is_transient(&self) -> bool {
		match self {
			Self::Sqlx(sqlx::Error::Database(db)) =>
				matches!(db.code().as_deref(), Some("40001") | Some("40P01")),
			Self::Sqlx(sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut) => true,
			_ => false,
		}
	}
}

/// Constraint violations surface as typed errors: unique conflicts map to
/// `Conflict`, broken foreign keys to `NotFound` (the referent is a missing
/// parent row), check failures to `InvalidArgument`.
impl From<sqlx::Error> for Error {
	fn from(err: sqlx::Error) -> Self {
		if let sqlx::Error::Database(db) = &err {
			let constraint = db.constraint().unwrap_or("constraint").to_string();

			match db.code().as_deref() {
				Some("23505") => return Self::Conflict(format!("Duplicate row violates {constraint}.")),
				Some("23503") => return Self::NotFound(format!("Referenced row is missing ({constraint}).")),
				Some("23514") => return Self::InvalidArgument(format!("Value violates {constraint}.")),
				_ => {},
			}
		}
		if matches!(err, sqlx::Error::RowNotFound) {
			return Self::NotFound("Row not found.".to_string());
		}

		Self::Sqlx(err)
	}
}

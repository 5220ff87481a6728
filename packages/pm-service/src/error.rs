pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("{message}")]
	Validation { message: String, issues: Vec<String> },
	#[error("Not found: {message}")]
	NotFound { message: String },
	#[error("Conflict: {message}")]
	Conflict { message: String },
	#[error("Unauthorized: {message}")]
	Unauthorized { message: String },
	#[error("Upstream failure: {message}")]
	Upstream { message: String, transient: bool },
	#[error("Storage failure: {message}")]
	Storage { message: String, transient: bool },
}

impl Error {
	pub fn validation(message: impl Into<String>) -> Self {
		Self::Validation { message: message.into(), issues: Vec::new() }
	}

	pub fn not_found(message: impl Into<String>) -> Self {
		Self::NotFound { message: message.into() }
	}

	pub fn conflict(message: impl Into<String>) -> Self {
		Self::Conflict { message: message.into() }
	}

	/// Whether a job handler should reschedule rather than dead-letter.
	pub fn is_transient(&self) -> bool {
		match self {
			Self::Upstream { transient, .. } | Self::Storage { transient, .. } => *transient,
			_ => false,
		}
	}
}

impl From<pm_storage::Error> for Error {
	fn from(err: pm_storage::Error) -> Self {
		match err {
			pm_storage::Error::NotFound(message) => Self::NotFound { message },
			pm_storage::Error::Conflict(message) => Self::Conflict { message },
			pm_storage::Error::InvalidArgument(message) =>
				Self::Validation { message, issues: Vec::new() },
			pm_storage::Error::Sqlx(inner) => {
				let wrapped = pm_storage::Error::Sqlx(inner);
				let transient = wrapped.is_transient();

				Self::Storage { message: wrapped.to_string(), transient }
			},
		}
	}
}

impl From<sqlx::Error> for Error {
	fn from(err: sqlx::Error) -> Self {
		pm_storage::Error::from(err).into()
	}
}

impl From<pm_providers::Error> for Error {
	fn from(err: pm_providers::Error) -> Self {
		let transient = err.is_transient();

		Self::Upstream { message: err.to_string(), transient }
	}
}

impl From<pm_domain::cursor::Error> for Error {
	fn from(err: pm_domain::cursor::Error) -> Self {
		Self::validation(err.to_string())
	}
}

impl From<Error> for pm_jobs::JobError {
	fn from(err: Error) -> Self {
		if err.is_transient() {
			Self::Retry(err.to_string())
		} else {
			Self::Fatal(err.to_string())
		}
	}
}

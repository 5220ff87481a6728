pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Http(#[from] reqwest::Error),
	#[error("LLM API error ({status}): {message}")]
	Api { status: u16, message: String },
	#[error("LLM response contained no tool_use block.")]
	MissingToolUse,
	#[error("Invalid provider config: {message}")]
	InvalidConfig { message: String },
}

impl Error {
	/// Timeouts, connection failures, 429s, and 5xx responses are worth a
	/// retry; schema and auth problems are not.
	pub fn is_transient(&self) -> bool {
		match self {
			Self::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
			Self::Api { status, .. } => *status == 429 || *status >= 500,
			Self::MissingToolUse | Self::InvalidConfig { .. } => false,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn server_errors_and_throttles_are_transient() {
		assert!(Error::Api { status: 500, message: String::new() }.is_transient());
		assert!(Error::Api { status: 529, message: String::new() }.is_transient());
		assert!(Error::Api { status: 429, message: String::new() }.is_transient());
		assert!(!Error::Api { status: 400, message: String::new() }.is_transient());
		assert!(!Error::Api { status: 401, message: String::new() }.is_transient());
		assert!(!Error::MissingToolUse.is_transient());
	}
}

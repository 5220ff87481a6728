pub mod anthropic;

mod error;

pub use anthropic::AnthropicClient;
pub use error::{Error, Result};

use std::{future::Future, pin::Pin};

use serde::Serialize;
use serde_json::Value;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Clone, Debug, Serialize)]
pub struct Message {
	pub role: &'static str,
	pub content: String,
}

impl Message {
	pub fn user(content: impl Into<String>) -> Self {
		Self { role: "user", content: content.into() }
	}

	pub fn assistant(content: impl Into<String>) -> Self {
		Self { role: "assistant", content: content.into() }
	}
}

/// A single tool definition whose input schema is the structured output
/// contract for the call.
#[derive(Clone, Debug)]
pub struct ToolSpec {
	pub name: String,
	pub description: String,
	pub input_schema: Value,
}

pub struct ToolUseRequest<'a> {
	pub system: &'a str,
	pub messages: &'a [Message],
	pub tool: &'a ToolSpec,
}

/// The seam between pipeline stages and the LLM backend. Production uses
/// [`AnthropicClient`]; tests inject spies that return canned tool input.
pub trait ToolUseProvider
where
	Self: Send + Sync,
{
	fn invoke<'a>(&'a self, req: ToolUseRequest<'a>) -> BoxFuture<'a, Result<Value>>;
}

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{BoxFuture, Error, Message, Result, ToolSpec, ToolUseProvider, ToolUseRequest};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API client. Every call carries exactly one tool with a
/// forced `tool_choice`, so the model must answer with structured input
/// matching the tool's JSON schema.
pub struct AnthropicClient {
	http: Client,
	cfg: pm_config::Llm,
}

impl AnthropicClient {
	pub fn new(cfg: pm_config::Llm) -> Result<Self> {
		if cfg.api_key.trim().is_empty() {
			return Err(Error::InvalidConfig {
				message: "llm.api_key (or ANTHROPIC_API_KEY) is required.".to_string(),
			});
		}

		let http = Client::builder().timeout(Duration::from_millis(cfg.timeout_ms)).build()?;

		Ok(Self { http, cfg })
	}

	async fn call(&self, system: &str, messages: &[Message], tool: &ToolSpec) -> Result<Value> {
		let body = MessagesRequest {
			model: &self.cfg.extraction_model,
			max_tokens: self.cfg.max_output_tokens,
			system,
			messages,
			tools: vec![ToolParam {
				name: &tool.name,
				description: &tool.description,
				input_schema: &tool.input_schema,
			}],
			tool_choice: ToolChoice { choice_type: "tool", name: &tool.name },
		};
		let response = self
			.http
			.post(format!("{}/v1/messages", self.cfg.api_base.trim_end_matches('/')))
			.header("x-api-key", &self.cfg.api_key)
			.header("anthropic-version", ANTHROPIC_VERSION)
			.json(&body)
			.send()
			.await?;
		let status = response.status();
		let json: Value = response.json().await?;

		if !status.is_success() {
			let message = json
				.pointer("/error/message")
				.and_then(Value::as_str)
				.unwrap_or("unknown error")
				.to_string();

			return Err(Error::Api { status: status.as_u16(), message });
		}

		parse_tool_input(&json, &tool.name)
	}
}

impl ToolUseProvider for AnthropicClient {
	fn invoke<'a>(&'a self, req: ToolUseRequest<'a>) -> BoxFuture<'a, Result<Value>> {
		Box::pin(self.call(req.system, req.messages, req.tool))
	}
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
	model: &'a str,
	max_tokens: u32,
	system: &'a str,
	messages: &'a [Message],
	tools: Vec<ToolParam<'a>>,
	tool_choice: ToolChoice<'a>,
}

#[derive(Serialize)]
struct ToolParam<'a> {
	name: &'a str,
	description: &'a str,
	input_schema: &'a Value,
}

#[derive(Serialize)]
struct ToolChoice<'a> {
	#[serde(rename = "type")]
	choice_type: &'a str,
	name: &'a str,
}

#[derive(Deserialize)]
struct ContentBlock {
	#[serde(rename = "type")]
	block_type: String,
	name: Option<String>,
	input: Option<Value>,
}

/// Walks the response content for the forced tool's `tool_use` block and
/// returns its input.
fn parse_tool_input(response: &Value, tool_name: &str) -> Result<Value> {
	let blocks = response.get("content").and_then(Value::as_array).ok_or(Error::MissingToolUse)?;

	for raw in blocks {
		let Ok(block) = serde_json::from_value::<ContentBlock>(raw.clone()) else {
			continue;
		};

		if block.block_type == "tool_use"
			&& block.name.as_deref().is_none_or(|name| name == tool_name)
			&& let Some(input) = block.input
		{
			return Ok(input);
		}
	}

	Err(Error::MissingToolUse)
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn finds_the_tool_use_block() {
		let response = json!({
			"content": [
				{"type": "text", "text": "Extracting now."},
				{"type": "tool_use", "name": "record_extraction", "input": {"entities": []}}
			]
		});
		let input = parse_tool_input(&response, "record_extraction").unwrap();

		assert_eq!(input, json!({"entities": []}));
	}

	#[test]
	fn text_only_response_is_an_error() {
		let response = json!({"content": [{"type": "text", "text": "Sorry."}]});

		assert!(matches!(
			parse_tool_input(&response, "record_extraction"),
			Err(Error::MissingToolUse),
		));
	}

	#[test]
	fn ignores_other_tools() {
		let response = json!({
			"content": [{"type": "tool_use", "name": "something_else", "input": {}}]
		});

		assert!(parse_tool_input(&response, "record_extraction").is_err());
	}
}

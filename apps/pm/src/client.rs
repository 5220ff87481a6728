use color_eyre::eyre::eyre;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::CliConfig;

/// Thin authenticated JSON client over the server API. Any non-2xx response
/// becomes an error carrying the server's message, which bubbles up as a
/// non-zero exit.
pub struct ApiClient {
	http: Client,
	base_url: String,
	key: Option<String>,
}

impl ApiClient {
	pub fn from_config(cfg: &CliConfig) -> color_eyre::Result<Self> {
		let base_url = cfg.base_url()?.trim_end_matches('/').to_string();

		Ok(Self { http: Client::new(), base_url, key: cfg.key.clone() })
	}

	pub async fn get<T>(&self, path: &str) -> color_eyre::Result<T>
	where
		T: DeserializeOwned,
	{
		self.request(Method::GET, path, None).await
	}

	pub async fn post<T>(&self, path: &str, body: Value) -> color_eyre::Result<T>
	where
		T: DeserializeOwned,
	{
		self.request(Method::POST, path, Some(body)).await
	}

	async fn request<T>(
		&self,
		method: Method,
		path: &str,
		body: Option<Value>,
	) -> color_eyre::Result<T>
	where
		T: DeserializeOwned,
	{
		let mut request = self.http.request(method, format!("{}{path}", self.base_url));

		if let Some(key) = self.key.as_deref() {
			request = request.bearer_auth(key);
		}
		if let Some(body) = body {
			request = request.json(&body);
		}

		let response = request.send().await?;
		let status = response.status();

		if status.is_success() {
			return Ok(response.json().await?);
		}

		let message = response
			.json::<Value>()
			.await
			.ok()
			.and_then(|value| {
				value
					.pointer("/error/message")
					.and_then(Value::as_str)
					.map(str::to_string)
			})
			.unwrap_or_else(|| status_label(status));

		Err(eyre!("{} ({})", message, status.as_u16()))
	}
}

fn status_label(status: StatusCode) -> String {
	status.canonical_reason().unwrap_or("request failed").to_string()
}

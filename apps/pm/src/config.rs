use std::{fs, path::PathBuf};

use color_eyre::eyre::{Context, eyre};
use serde::{Deserialize, Serialize};

/// CLI-side settings, kept under the user config dir
/// (`~/.config/pm/config.toml` on Linux).
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct CliConfig {
	pub url: Option<String>,
	pub key: Option<String>,
	pub vault_dir: Option<PathBuf>,
}

impl CliConfig {
	pub fn path() -> color_eyre::Result<PathBuf> {
		let base = dirs::config_dir().ok_or_else(|| eyre!("No user config directory found."))?;

		Ok(base.join("pm").join("config.toml"))
	}

	pub fn load() -> color_eyre::Result<Self> {
		let path = Self::path()?;

		if !path.exists() {
			return Ok(Self::default());
		}

		let raw = fs::read_to_string(&path)
			.wrap_err_with(|| format!("Failed to read {}", path.display()))?;

		toml::from_str(&raw).wrap_err_with(|| format!("Failed to parse {}", path.display()))
	}

	pub fn store(&self) -> color_eyre::Result<()> {
		let path = Self::path()?;

		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent)
				.wrap_err_with(|| format!("Failed to create {}", parent.display()))?;
		}

		let raw = toml::to_string_pretty(self)?;

		fs::write(&path, raw).wrap_err_with(|| format!("Failed to write {}", path.display()))?;

		Ok(())
	}

	pub fn base_url(&self) -> color_eyre::Result<&str> {
		self.url
			.as_deref()
			.ok_or_else(|| eyre!("No server configured. Run: pm config --url <URL> --key <KEY>"))
	}
}

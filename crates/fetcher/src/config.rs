//! Fetcher configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::batch::MAX_BATCH_OPERATIONS;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// The TOML document could not be parsed or did not match the schema.
	#[error("TOML parse error: {0}")]
	Toml(#[from] toml::de::Error),

	/// A `[sites]` entry is not an absolute URL.
	#[error("invalid url for site '{key}': {reason}")]
	InvalidSiteUrl {
		/// Site alias.
		key: String,
		/// Parser failure reason.
		reason: String,
	},
}

/// Tunables of a fetcher instance.
///
/// ```toml
/// batch_window_ms = 50
/// batch_grace_ms = 10
/// batch_cap = 50
/// lcid = 1033
///
/// [sites]
/// hr = "https://contoso.example/sites/hr"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FetcherConfig {
	/// Default batch window in milliseconds.
	#[serde(default = "default_window_ms")]
	pub batch_window_ms: u64,
	/// Delay between window close and batch execution, in milliseconds.
	#[serde(default = "default_grace_ms")]
	pub batch_grace_ms: u64,
	/// Operations admitted into one window before it is retired early.
	///
	/// Clamped to [`MAX_BATCH_OPERATIONS`].
	#[serde(default = "default_cap")]
	pub batch_cap: usize,
	/// Locale id used when creating taxonomy terms.
	#[serde(default = "default_lcid")]
	pub lcid: u32,
	/// Site aliases registered at construction.
	#[serde(default)]
	pub sites: HashMap<String, String>,
}

fn default_window_ms() -> u64 {
	50
}

fn default_grace_ms() -> u64 {
	10
}

fn default_cap() -> usize {
	MAX_BATCH_OPERATIONS
}

fn default_lcid() -> u32 {
	1033
}

impl Default for FetcherConfig {
	fn default() -> Self {
		Self {
			batch_window_ms: default_window_ms(),
			batch_grace_ms: default_grace_ms(),
			batch_cap: default_cap(),
			lcid: default_lcid(),
			sites: HashMap::new(),
		}
	}
}

impl FetcherConfig {
	/// Parse a configuration from TOML and validate its site table.
	pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
		let config: Self = toml::from_str(input)?;
		for (key, url) in &config.sites {
			url::Url::parse(url).map_err(|e| ConfigError::InvalidSiteUrl {
				key: key.clone(),
				reason: e.to_string(),
			})?;
		}
		Ok(config)
	}

	/// Set the default batch window.
	pub fn batch_window(mut self, window: Duration) -> Self {
		self.batch_window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
		self
	}

	/// Set the grace period after a window closes.
	pub fn batch_grace(mut self, grace: Duration) -> Self {
		self.batch_grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
		self
	}

	/// Register a site alias.
	pub fn site(mut self, key: impl Into<String>, url: impl Into<String>) -> Self {
		self.sites.insert(key.into(), url.into());
		self
	}

	/// Default batch window.
	pub fn window(&self) -> Duration {
		Duration::from_millis(self.batch_window_ms)
	}

	/// Grace period between window close and execution.
	pub fn grace(&self) -> Duration {
		Duration::from_millis(self.batch_grace_ms)
	}

	/// Effective per-window operation cap.
	pub fn cap(&self) -> usize {
		self.batch_cap.clamp(1, MAX_BATCH_OPERATIONS)
	}
}

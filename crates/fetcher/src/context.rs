//! Host context handed to [`Fetcher::initialize`](crate::Fetcher::initialize).

use serde::Deserialize;
use url::Url;

use crate::{Error, Result};

/// The part of the plugin host's page context the fetcher consumes.
///
/// Deserializes from the host's camelCase JSON:
///
/// ```json
/// { "webAbsoluteUrl": "https://contoso.example/sites/hr", "listId": "{6f2a...}" }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformContext {
	/// Absolute URL of the site hosting the page.
	pub web_absolute_url: String,
	/// Server-relative URL of the same site.
	#[serde(default)]
	pub web_server_relative_url: Option<String>,
	/// Id of the list (library) the active page belongs to.
	#[serde(default)]
	pub list_id: Option<String>,
}

/// URLs extracted from a [`PlatformContext`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteUrls {
	/// Absolute site URL, used to open the default handle.
	pub absolute: Url,
	/// Server-relative site URL.
	pub base: String,
}

impl PlatformContext {
	/// Create a context for the site at `web_absolute_url`.
	pub fn new(web_absolute_url: impl Into<String>) -> Self {
		Self {
			web_absolute_url: web_absolute_url.into(),
			..Default::default()
		}
	}

	/// Set the active page's list id.
	pub fn with_list_id(mut self, list_id: impl Into<String>) -> Self {
		self.list_id = Some(list_id.into());
		self
	}

	/// Parse from the host's JSON representation.
	pub fn from_json(value: serde_json::Value) -> Result<Self> {
		serde_json::from_value(value).map_err(|e| Error::Initialization(format!("malformed host context: {e}")))
	}

	/// Extract and validate the absolute and server-relative site URLs.
	///
	/// The server-relative URL falls back to the absolute URL's path when the host omits it.
	pub fn site_urls(&self) -> Result<SiteUrls> {
		let absolute = Url::parse(&self.web_absolute_url)
			.map_err(|e| Error::Initialization(format!("invalid web absolute url '{}': {e}", self.web_absolute_url)))?;
		if absolute.cannot_be_a_base() {
			return Err(Error::Initialization(format!(
				"web absolute url '{}' cannot be a base",
				self.web_absolute_url
			)));
		}

		let base = match &self.web_server_relative_url {
			Some(base) if !base.is_empty() => base.clone(),
			_ => absolute.path().to_string(),
		};

		Ok(SiteUrls { absolute, base })
	}
}

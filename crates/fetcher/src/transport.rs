//! Boundary to the remote platform.
//!
//! The fetcher only sequences calls; issuing them is the job of a [`RestTransport`]
//! implementation supplied by the host (an authenticated HTTP client, a recorded fixture, ...).

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use crate::Result;
use crate::sites::SiteHandle;

/// HTTP method of a REST operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
	/// Read.
	Get,
	/// Create or invoke.
	Post,
	/// Partial update.
	Patch,
	/// Removal.
	Delete,
}

impl Method {
	/// Upper-case wire name.
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Get => "GET",
			Self::Post => "POST",
			Self::Patch => "PATCH",
			Self::Delete => "DELETE",
		}
	}
}

/// One REST operation against a site's API root.
///
/// `path` is relative to the site's REST root (e.g. `web/lists/getbytitle('Docs')`). Query
/// parameters are passed through to the transport verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct RestRequest {
	/// HTTP method.
	pub method: Method,
	/// Path below the site's REST root.
	pub path: String,
	/// Query parameters in insertion order.
	pub query: Vec<(String, String)>,
	/// JSON body for writes.
	pub body: Option<Value>,
}

impl RestRequest {
	/// Create a request with the given method and path.
	pub fn new(method: Method, path: impl Into<String>) -> Self {
		Self {
			method,
			path: path.into(),
			query: Vec::new(),
			body: None,
		}
	}

	/// Create a `GET` request.
	pub fn get(path: impl Into<String>) -> Self {
		Self::new(Method::Get, path)
	}

	/// Create a `POST` request carrying a JSON body.
	pub fn post(path: impl Into<String>, body: Value) -> Self {
		Self::new(Method::Post, path).body(body)
	}

	/// Append a query parameter.
	pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.query.push((key.into(), value.into()));
		self
	}

	/// Set the JSON body.
	pub fn body(mut self, body: Value) -> Self {
		self.body = Some(body);
		self
	}
}

/// A raw POST to a non-REST endpoint of a site (e.g. the procedural taxonomy services).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRequest {
	/// Path relative to the site URL.
	pub path: String,
	/// Value of the `Content-Type` header.
	pub content_type: String,
	/// Request body, sent as-is.
	pub body: String,
}

impl RawRequest {
	/// Create a raw request.
	pub fn new(path: impl Into<String>, content_type: impl Into<String>, body: impl Into<String>) -> Self {
		Self {
			path: path.into(),
			content_type: content_type.into(),
			body: body.into(),
		}
	}
}

/// Metadata returned when a site handle is opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteInfo {
	/// Identifier of the site's root web, when the platform reports one.
	pub web_id: Option<String>,
	/// Display title, when reported.
	pub title: Option<String>,
}

/// Capability set of the remote platform consumed by the fetcher.
///
/// Implementations must be cheap to share; the fetcher holds one as `Arc<dyn RestTransport>`.
#[async_trait]
pub trait RestTransport: Send + Sync {
	/// Open a resource handle for the site at `url`.
	async fn open_site(&self, url: &Url) -> Result<SiteInfo>;

	/// Issue a single REST operation.
	async fn send(&self, site: &SiteHandle, request: RestRequest) -> Result<Value>;

	/// Issue several REST operations in one round trip.
	///
	/// The returned vector holds one result per request, in request order.
	async fn send_batch(&self, site: &SiteHandle, requests: Vec<RestRequest>) -> Result<Vec<Result<Value>>>;

	/// POST a raw body to a non-REST endpoint and return the raw response body.
	async fn post_raw(&self, site: &SiteHandle, request: RawRequest) -> Result<String>;
}

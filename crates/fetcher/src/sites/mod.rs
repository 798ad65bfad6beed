//! Site handle registry.
//!
//! Maps a logical [`SiteKey`] to a lazily opened [`SiteHandle`]. Handles are opened at most once
//! per key: concurrent requests for an unopened key share a single `open_site` call.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, info};
use url::Url;

use crate::context::SiteUrls;
use crate::flight::SingleFlight;
use crate::transport::{RestTransport, SiteInfo};
use crate::{Error, Result};

/// Logical site name, unique per fetcher.
///
/// `default` always means the site from the platform context; `current` is the alias rebound by
/// [`SiteRegistry::set_site`]. Any other key is a caller-chosen alias.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SiteKey(Arc<str>);

impl SiteKey {
	/// Name of the context site.
	pub const DEFAULT: &'static str = "default";
	/// Name of the rebindable alias.
	pub const CURRENT: &'static str = "current";

	/// Create a key.
	pub fn new(key: impl AsRef<str>) -> Self {
		Self(Arc::from(key.as_ref()))
	}

	/// The context site.
	pub fn default_site() -> Self {
		Self::new(Self::DEFAULT)
	}

	/// The rebindable alias.
	pub fn current() -> Self {
		Self::new(Self::CURRENT)
	}

	/// Key as a string slice.
	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Returns true for the context site key.
	pub fn is_default(&self) -> bool {
		&*self.0 == Self::DEFAULT
	}

	/// Returns true for the rebindable alias.
	pub fn is_current(&self) -> bool {
		&*self.0 == Self::CURRENT
	}
}

impl Default for SiteKey {
	fn default() -> Self {
		Self::default_site()
	}
}

impl fmt::Display for SiteKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for SiteKey {
	fn from(key: &str) -> Self {
		Self::new(key)
	}
}

impl From<String> for SiteKey {
	fn from(key: String) -> Self {
		Self(Arc::from(key))
	}
}

/// Registry-unique identity of an opened handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "site#{}", self.0)
	}
}

struct HandleInner {
	id: HandleId,
	key: SiteKey,
	url: Url,
	info: SiteInfo,
}

/// Opaque handle bound to one absolute site URL.
///
/// Cheap to clone; all clones share identity ([`SiteHandle::id`]).
#[derive(Clone)]
pub struct SiteHandle {
	inner: Arc<HandleInner>,
}

impl fmt::Debug for SiteHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SiteHandle")
			.field("id", &self.inner.id)
			.field("key", &self.inner.key)
			.field("url", &self.inner.url.as_str())
			.finish_non_exhaustive()
	}
}

impl SiteHandle {
	pub(crate) fn new(id: HandleId, key: SiteKey, url: Url, info: SiteInfo) -> Self {
		Self {
			inner: Arc::new(HandleInner { id, key, url, info }),
		}
	}

	/// Handle identity.
	pub fn id(&self) -> HandleId {
		self.inner.id
	}

	/// Key the handle was opened for.
	pub fn key(&self) -> &SiteKey {
		&self.inner.key
	}

	/// Absolute site URL.
	pub fn url(&self) -> &Url {
		&self.inner.url
	}

	/// Metadata reported by the transport when the handle was opened.
	pub fn info(&self) -> &SiteInfo {
		&self.inner.info
	}

	/// Returns true if both handles are the same opened instance.
	pub fn same_handle(&self, other: &SiteHandle) -> bool {
		Arc::ptr_eq(&self.inner, &other.inner)
	}
}

/// URL bindings; mutated only through the registry.
#[derive(Default)]
struct Bindings {
	context: Option<SiteUrls>,
	aliases: HashMap<SiteKey, Url>,
	current: Option<Url>,
}

impl Bindings {
	fn context_url(&self) -> Result<Url> {
		self.context.as_ref().map(|c| c.absolute.clone()).ok_or(Error::NotInitialized)
	}

	/// URL a key resolves to. Unknown aliases fall back to the context site.
	fn resolve(&self, key: &SiteKey) -> Result<Url> {
		if key.is_default() {
			return self.context_url();
		}
		if key.is_current() {
			return match &self.current {
				Some(url) => Ok(url.clone()),
				None => self.context_url(),
			};
		}
		match self.aliases.get(key) {
			Some(url) => Ok(url.clone()),
			None => {
				debug!(site = %key, "Unknown site alias; falling back to the context site");
				self.context_url()
			}
		}
	}
}

/// Lazily constructed, memoized site handles.
///
/// Thread-safe; shared by every operation of one fetcher.
///
/// # Concurrency
///
/// - `bindings`: `RwLock` over the context URLs, registered aliases and the `current` binding
/// - `handles`: single-flight map guaranteeing one `open_site` call per key
pub struct SiteRegistry {
	bindings: RwLock<Bindings>,
	handles: SingleFlight<SiteKey, SiteHandle>,
	transport: Arc<dyn RestTransport>,
	next_id: AtomicU64,
}

impl SiteRegistry {
	/// Create an empty registry over `transport`.
	pub fn new(transport: Arc<dyn RestTransport>) -> Self {
		Self {
			bindings: RwLock::new(Bindings::default()),
			handles: SingleFlight::default(),
			transport,
			next_id: AtomicU64::new(0),
		}
	}

	/// Register (or replace) an alias. A cached handle for the alias is dropped.
	pub fn register(&self, key: impl Into<SiteKey>, url: &str) -> Result<()> {
		let key = key.into();
		let url = Url::parse(url).map_err(|e| Error::InvalidUrl {
			url: url.to_string(),
			reason: e.to_string(),
		})?;
		self.bindings.write().aliases.insert(key.clone(), url);
		self.handles.invalidate(&key);
		Ok(())
	}

	/// Registered alias URL, if any.
	pub fn registered_url(&self, key: &SiteKey) -> Option<Url> {
		self.bindings.read().aliases.get(key).cloned()
	}

	/// Bind the platform context's URLs. Returns true when an earlier context was replaced.
	///
	/// On re-initialization every handle that resolved through the context is reset so it is
	/// reopened against the new one, which covers `default`, `current` and unregistered aliases.
	pub fn bind_context(&self, urls: SiteUrls) -> bool {
		let mut bindings = self.bindings.write();
		let rebinding = bindings.context.is_some();
		bindings.context = Some(urls);
		if rebinding {
			bindings.current = None;
			drop(bindings);
			self.handles.invalidate_where(|key| self.follows_context(key));
		}
		rebinding
	}

	/// Returns true if `key` is reset when the context is rebound.
	pub(crate) fn follows_context(&self, key: &SiteKey) -> bool {
		key.is_default() || key.is_current() || !self.bindings.read().aliases.contains_key(key)
	}

	/// The bound context URLs.
	pub fn context_urls(&self) -> Option<SiteUrls> {
		self.bindings.read().context.clone()
	}

	/// Handle for `key`, opening it on first use.
	///
	/// `None` resolves to the `current` site once [`Self::set_site`] has bound it and to the
	/// context site before that. Concurrent first requests for the same key share one `open_site`
	/// call and receive the same handle. A failed open is reported to all of them and retried by
	/// the next request.
	pub async fn get_handle(&self, key: Option<&SiteKey>) -> Result<SiteHandle> {
		let key = match key {
			Some(key) => key.clone(),
			None => self.implicit_key(),
		};
		let open_key = key.clone();
		self.handles
			.get_or_resolve(&key, || async move {
				let url = self.bindings.read().resolve(&open_key)?;
				let id = HandleId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
				debug!(site = %open_key, url = %url, %id, "Opening site handle");
				let info = self.transport.open_site(&url).await?;
				Ok(SiteHandle::new(id, open_key, url, info))
			})
			.await
	}

	/// Key used when a caller names no site.
	fn implicit_key(&self) -> SiteKey {
		if self.bindings.read().current.is_some() {
			SiteKey::current()
		} else {
			SiteKey::default_site()
		}
	}

	/// Rebind the `current` alias to the URL of `key` and reopen the `current` handle.
	///
	/// Calls naming no site follow the rebound alias from then on; `default` stays pinned to the
	/// context. Unknown keys rebind to the context site.
	pub async fn set_site(&self, key: &SiteKey) -> Result<SiteHandle> {
		{
			let mut bindings = self.bindings.write();
			let url = bindings.resolve(key)?;
			info!(site = %key, url = %url, "Rebinding current site");
			bindings.current = Some(url);
		}
		self.handles.invalidate(&SiteKey::current());
		self.get_handle(Some(&SiteKey::current())).await
	}

	/// Drop the cached handle for `key`; the next request reopens it.
	pub fn reset(&self, key: &SiteKey) -> bool {
		self.handles.invalidate(key)
	}

	/// Cached handle for `key`, without opening one.
	pub fn cached(&self, key: &SiteKey) -> Option<SiteHandle> {
		self.handles.peek(key)
	}

	/// Number of opened handles currently cached.
	pub fn open_count(&self) -> usize {
		self.handles.resolved_len()
	}

	/// The underlying transport.
	pub fn transport(&self) -> Arc<dyn RestTransport> {
		self.transport.clone()
	}
}

//! The fetcher aggregate.
//!
//! A [`Fetcher`] owns one of each orchestration component and exposes the operations consumers
//! build on. Every operation awaits the ready gate before touching the network.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batch::{Batch, BatchKey, BatchMultiplexer};
use crate::config::FetcherConfig;
use crate::content_types::{self, ContentTypeCache};
use crate::context::PlatformContext;
use crate::gate::{Admission, ReadyGate, Status};
use crate::lists::{self, FieldInfo, ListInfo, ListKey};
use crate::sites::{SiteHandle, SiteKey, SiteRegistry};
use crate::taxonomy::{PrefixMatch, TermPathBuilder};
use crate::transport::{RestRequest, RestTransport};
use crate::{Error, Result, odata};

/// Consumer-declared work run once per successful initialization, after the default site handle
/// exists and before parked callers are released.
///
/// Operations called on `fetcher` from inside the routine pass the gate immediately.
#[async_trait]
pub trait StartupRoutines: Send + Sync {
	/// Run the startup work. An error moves the fetcher to [`Status::Error`].
	async fn startup_routines(&self, fetcher: &Fetcher) -> Result<()>;
}

/// Startup routines that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoStartup;

#[async_trait]
impl StartupRoutines for NoStartup {
	async fn startup_routines(&self, _fetcher: &Fetcher) -> Result<()> {
		Ok(())
	}
}

struct FetcherInner {
	gate: ReadyGate,
	sites: SiteRegistry,
	batches: BatchMultiplexer,
	content_types: ContentTypeCache,
	transport: Arc<dyn RestTransport>,
	startup: Arc<dyn StartupRoutines>,
	config: FetcherConfig,
	context: RwLock<Option<PlatformContext>>,
}

/// Gated, batching request orchestrator for one platform context.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Fetcher {
	inner: Arc<FetcherInner>,
}

impl fmt::Debug for Fetcher {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Fetcher")
			.field("status", &self.inner.gate.status())
			.field("sites", &self.inner.sites.open_count())
			.finish_non_exhaustive()
	}
}

/// Builder for [`Fetcher`].
pub struct FetcherBuilder {
	transport: Arc<dyn RestTransport>,
	startup: Arc<dyn StartupRoutines>,
	config: FetcherConfig,
}

impl FetcherBuilder {
	/// Use `config` instead of the defaults.
	pub fn config(mut self, config: FetcherConfig) -> Self {
		self.config = config;
		self
	}

	/// Run `startup` during every initialization.
	pub fn startup(mut self, startup: impl StartupRoutines + 'static) -> Self {
		self.startup = Arc::new(startup);
		self
	}

	/// Build the fetcher, registering the configured site aliases.
	pub fn build(self) -> Result<Fetcher> {
		let sites = SiteRegistry::new(self.transport.clone());
		for (key, url) in &self.config.sites {
			sites.register(key.as_str(), url)?;
		}
		Ok(Fetcher {
			inner: Arc::new(FetcherInner {
				gate: ReadyGate::new(),
				sites,
				batches: BatchMultiplexer::new(self.config.cap(), self.config.grace()),
				content_types: ContentTypeCache::new(),
				transport: self.transport,
				startup: self.startup,
				config: self.config,
				context: RwLock::new(None),
			}),
		})
	}
}

/// Moves the gate to `Error` if an initialization is dropped before it finishes.
struct InitGuard<'a> {
	gate: &'a ReadyGate,
	completed: bool,
}

impl InitGuard<'_> {
	fn finish(mut self, ok: bool) {
		self.completed = true;
		self.gate.finish(ok);
	}
}

impl Drop for InitGuard<'_> {
	fn drop(&mut self) {
		if !self.completed {
			warn!("Initialization abandoned before completion");
			self.gate.finish(false);
		}
	}
}

impl Fetcher {
	/// Start building a fetcher over `transport`.
	pub fn builder(transport: Arc<dyn RestTransport>) -> FetcherBuilder {
		FetcherBuilder {
			transport,
			startup: Arc::new(NoStartup),
			config: FetcherConfig::default(),
		}
	}

	/// Bind `context`, open the default site handle and run the startup routines.
	///
	/// On success the fetcher is [`Status::Ready`] and callers parked in [`Self::ready`] are
	/// released in the order they arrived. A call made while another initialization is running
	/// waits for that one instead of starting its own.
	///
	/// Any failure moves the fetcher to [`Status::Error`] and is returned unchanged. Callers
	/// already parked stay parked until a later `initialize` succeeds.
	pub async fn initialize(&self, context: PlatformContext) -> Result<()> {
		let inner = &self.inner;
		let admission = inner.gate.begin(|| {
			let urls = context.site_urls()?;
			info!(url = %urls.absolute, base = %urls.base, "Initializing fetcher");
			if inner.sites.bind_context(urls) {
				inner.content_types.forget_sites(|site| inner.sites.follows_context(site));
			}
			*inner.context.write() = Some(context);
			Ok(())
		});
		let admission = match admission {
			Ok(admission) => admission,
			Err(e) => {
				warn!(error = %e, "Fetcher initialization failed");
				return Err(e);
			}
		};

		match admission {
			Admission::Follower(rx) => {
				debug!("Joining in-flight initialization");
				rx.await.map_err(|_| Error::Abandoned)
			}
			Admission::Leader => {
				let guard = InitGuard {
					gate: &inner.gate,
					completed: false,
				};
				let outcome = self.run_startup().await;
				guard.finish(outcome.is_ok());
				match &outcome {
					Ok(()) => info!("Fetcher ready"),
					Err(e) => warn!(error = %e, "Fetcher initialization failed"),
				}
				outcome
			}
		}
	}

	async fn run_startup(&self) -> Result<()> {
		self.inner.sites.get_handle(None).await?;
		self.inner.startup.startup_routines(self).await
	}

	/// Wait until operations may proceed.
	///
	/// Completes immediately once ready or while initializing. Before [`Self::initialize`] the
	/// caller is queued; after a failed initialization it stays pending.
	pub async fn ready(&self) {
		self.inner.gate.ready().await;
	}

	/// Current lifecycle status.
	pub fn status(&self) -> Status {
		self.inner.gate.status()
	}

	/// Configuration the fetcher was built with.
	pub fn config(&self) -> &FetcherConfig {
		&self.inner.config
	}

	/// The bound platform context.
	pub fn context(&self) -> Option<PlatformContext> {
		self.inner.context.read().clone()
	}

	/// Register (or replace) a site alias.
	pub fn register_site(&self, key: impl Into<SiteKey>, url: &str) -> Result<()> {
		self.inner.sites.register(key, url)
	}

	/// Handle for `key`. `None` means the `current` site once [`Self::set_site`] has bound it and
	/// the context site before that.
	pub async fn site(&self, key: Option<&SiteKey>) -> Result<SiteHandle> {
		self.ready().await;
		self.inner.sites.get_handle(key).await
	}

	/// Rebind the `current` alias to the site registered under `key`.
	///
	/// Calls naming no site use the rebound alias afterwards.
	pub async fn set_site(&self, key: &SiteKey) -> Result<SiteHandle> {
		self.ready().await;
		let handle = self.inner.sites.set_site(key).await?;
		self.inner.content_types.forget_sites(SiteKey::is_current);
		Ok(handle)
	}

	/// Drop the cached handle for `key`; the next request reopens it.
	pub fn reset_site(&self, key: &SiteKey) -> bool {
		self.inner.sites.reset(key)
	}

	/// Issue one REST operation against `site` outside any batch.
	pub async fn send(&self, site: &SiteKey, request: RestRequest) -> Result<Value> {
		let handle = self.site(Some(site)).await?;
		self.inner.transport.send(&handle, request).await
	}

	/// Factory handing out the shared batch of the current `window` for `site`.
	///
	/// Uses the configured default window when `window` is `None`.
	pub fn batch_factory(&self, window: Option<Duration>, site: SiteKey) -> BatchFactory {
		let window = window.unwrap_or_else(|| self.inner.config.window());
		BatchFactory {
			fetcher: self.clone(),
			key: BatchKey::new(window, site),
		}
	}

	/// List metadata.
	pub async fn get_list(&self, site: &SiteKey, list: &ListKey) -> Result<ListInfo> {
		let request = RestRequest::get(list.api_path()).query("$select", "Id,Title,BaseTemplate,ItemCount");
		let value = self.send(site, request).await?;
		Ok(serde_json::from_value(odata::entity(value))?)
	}

	/// Content type ids visible at `list` of `site` (the whole site when `None`).
	///
	/// Looked up once per scope for the lifetime of the fetcher.
	pub async fn content_type_ids(&self, site: &SiteKey, list: Option<&ListKey>) -> Result<Arc<[String]>> {
		let handle = self.site(Some(site)).await?;
		self.inner
			.content_types
			.resolve(self.inner.transport.as_ref(), &handle, list)
			.await
	}

	/// Find a field by internal name, title or id across every content type of the scope.
	///
	/// The per-content-type lookups share one batch; the first content type carrying the field
	/// wins.
	pub async fn find_field(&self, site: &SiteKey, list: Option<&ListKey>, name_or_id: &str) -> Result<Option<FieldInfo>> {
		let ids = self.content_type_ids(site, list).await?;
		if ids.is_empty() {
			return Ok(None);
		}
		let batch = self.batch_factory(None, site.clone()).next().await?;
		content_types::find_field_in(&batch, &lists::scope_path(list), &ids, name_or_id).await
	}

	/// Id of the site's default document library.
	pub async fn default_library_id(&self, site: &SiteKey) -> Result<String> {
		let request = RestRequest::get("web/DefaultDocumentLibrary").query("$select", "Id");
		let missing = || Error::NotFound(format!("default document library of site '{site}'"));
		let value = match self.send(site, request).await {
			Ok(value) => odata::entity(value),
			Err(e) if e.is_not_found() => return Err(missing()),
			Err(e) => return Err(e),
		};
		if odata::is_empty(&value) {
			return Err(missing());
		}
		value
			.get("Id")
			.and_then(Value::as_str)
			.map(odata::normalize_guid)
			.ok_or_else(|| Error::Protocol("default document library carries no id".into()))
	}

	/// Id of the library the active page belongs to.
	pub async fn current_library_id(&self) -> Result<String> {
		self.ready().await;
		self.inner
			.context
			.read()
			.as_ref()
			.and_then(|ctx| ctx.list_id.as_deref())
			.map(odata::normalize_guid)
			.ok_or_else(|| Error::NotFound("current library".into()))
	}

	/// Returns true when the active page's library is the default library of `site`.
	pub async fn is_default_library(&self, site: &SiteKey) -> Result<bool> {
		let default = self.default_library_id(site).await?;
		let current = self.current_library_id().await?;
		Ok(default == current)
	}

	fn taxonomy<'a>(&'a self, handle: &'a SiteHandle) -> TermPathBuilder<'a> {
		TermPathBuilder::new(self.inner.transport.as_ref(), handle, self.inner.config.lcid)
	}

	/// Id of the default term store of `site`'s site collection.
	pub async fn default_term_store_id(&self, site: &SiteKey) -> Result<String> {
		let handle = self.site(Some(site)).await?;
		self.taxonomy(&handle).default_term_store_id().await
	}

	/// Deepest existing term along `path` in `term_set`.
	pub async fn resolve_closest_prefix(&self, site: &SiteKey, term_set: Uuid, path: &str) -> Result<PrefixMatch> {
		let handle = self.site(Some(site)).await?;
		self.taxonomy(&handle).resolve_closest_prefix(term_set, path).await
	}

	/// Make sure `path` exists in `term_set`, creating missing terms in order, and return the id
	/// of its last term.
	///
	/// A failed creation leaves the terms created before it in place.
	pub async fn build_term_path(&self, site: &SiteKey, ssp_id: Uuid, term_set: Uuid, path: &str) -> Result<String> {
		let handle = self.site(Some(site)).await?;
		self.taxonomy(&handle).build_path(ssp_id, term_set, path).await
	}

	/// Build `path` in the term set bound to the taxonomy field `field`.
	pub async fn ensure_field_term_path(
		&self,
		site: &SiteKey,
		list: Option<&ListKey>,
		field: &str,
		path: &str,
	) -> Result<String> {
		let info = self
			.find_field(site, list, field)
			.await?
			.ok_or_else(|| Error::NotFound(format!("field '{field}'")))?;
		let (ssp_id, term_set) = info
			.taxonomy_binding()
			.ok_or_else(|| Error::NotFound(format!("term set bound to field '{field}'")))?;
		self.build_term_path(site, ssp_id, term_set, path).await
	}
}

/// Hands out the shared [`Batch`] of the current window for one [`BatchKey`].
#[derive(Debug, Clone)]
pub struct BatchFactory {
	fetcher: Fetcher,
	key: BatchKey,
}

impl BatchFactory {
	/// Window and site this factory batches for.
	pub fn key(&self) -> &BatchKey {
		&self.key
	}

	/// Shared batch of the current window, opening a new window if none is open.
	pub async fn next(&self) -> Result<Batch> {
		let handle = self.fetcher.site(Some(&self.key.site)).await?;
		let transport = self.fetcher.inner.transport.clone();
		Ok(self.fetcher.inner.batches.checkout(&self.key, handle, transport))
	}
}

#[cfg(test)]
mod tests;

//! Gated request orchestration for site-scoped REST clients.
//!
//! This crate is centered on [`Fetcher`], the aggregate every concrete data fetcher is built on.
//! A fetcher mediates all outbound calls to a remote content platform and guarantees that no
//! request reaches the network before the platform context has been bound and the default site
//! handle exists.
//!
//! The pieces, leaf first:
//! - [`gate::ReadyGate`]: initialization state machine and FIFO queue of callers waiting on it.
//! - [`sites::SiteRegistry`]: lazily opened, single-flight memoized [`SiteHandle`]s per [`SiteKey`].
//! - [`batch::BatchMultiplexer`]: coalesces operations issued within a short window into one
//!   round trip per `(window, site)` key.
//! - [`content_types::ContentTypeCache`]: single-flight, permanently memoized content type ids.
//! - [`taxonomy`]: closest existing prefix of a term path and sequential creation of the rest.
//!
//! Consumers wrap a [`Fetcher`] in their own type and declare their startup work through
//! [`StartupRoutines`]:
//!
//! ```ignore
//! use spgate_fetcher::{Fetcher, SiteKey, StartupRoutines};
//!
//! struct WarmLists;
//!
//! #[async_trait::async_trait]
//! impl StartupRoutines for WarmLists {
//!     async fn startup_routines(&self, fetcher: &Fetcher) -> spgate_fetcher::Result<()> {
//!         fetcher.default_library_id(&SiteKey::default_site()).await.map(drop)
//!     }
//! }
//!
//! let fetcher = Fetcher::builder(transport).startup(WarmLists).build()?;
//! fetcher.initialize(context).await?;
//! let field = fetcher.find_field(&SiteKey::default_site(), None, "Category").await?;
//! ```
#![warn(missing_docs)]

pub mod batch;
pub mod config;
pub mod content_types;
pub mod context;
mod fetcher;
mod flight;
pub mod gate;
pub mod lists;
mod odata;
pub mod sites;
pub mod taxonomy;
pub mod transport;

#[cfg(test)]
mod testing;

pub use batch::{Batch, BatchKey, BatchResponse, MAX_BATCH_OPERATIONS};
pub use config::{ConfigError, FetcherConfig};
pub use context::{PlatformContext, SiteUrls};
pub use fetcher::{BatchFactory, Fetcher, FetcherBuilder, NoStartup, StartupRoutines};
pub use gate::Status;
pub use lists::{FieldInfo, ListInfo, ListKey};
pub use sites::{HandleId, SiteHandle, SiteKey};
pub use taxonomy::{PrefixMatch, TermNode, TermPathBuilder};
pub use transport::{Method, RawRequest, RestRequest, RestTransport, SiteInfo};

/// A convenient type alias for `Result` with `E` = [`enum@crate::Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Possible errors.
///
/// Errors are `Clone` because a single outcome is broadcast to every caller sharing a
/// single-flight resolution or a batch round trip.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
	/// Context extraction or a startup routine failed; the fetcher is now in the error state.
	#[error("initialization failed: {0}")]
	Initialization(String),
	/// A site handle was requested before any platform context was bound.
	#[error("no platform context bound; call initialize first")]
	NotInitialized,
	/// A lookup found nothing to resolve (no default library, unknown field, ...).
	#[error("not found: {0}")]
	NotFound(String),
	/// The remote platform or the transport reported a failure.
	#[error("remote call failed: {message}")]
	Remote {
		/// HTTP status, when the failure came from a response.
		status: Option<u16>,
		/// Failure description reported by the platform or transport.
		message: String,
	},
	/// The platform replied with a payload of an unexpected shape.
	#[error("protocol error: {0}")]
	Protocol(String),
	/// A payload could not be decoded.
	#[error("deserialization failed: {0}")]
	Deserialize(String),
	/// A site URL could not be parsed.
	#[error("invalid site url '{url}': {reason}")]
	InvalidUrl {
		/// The rejected input.
		url: String,
		/// Parser failure reason.
		reason: String,
	},
	/// A term path was empty or contained an empty segment.
	#[error("invalid term path '{0}'")]
	InvalidPath(String),
	/// An operation was added to a batch that has already been sent.
	#[error("batch already executed")]
	BatchClosed,
	/// The task resolving a shared result went away before publishing it.
	#[error("shared resolution abandoned before completion")]
	Abandoned,
}

impl Error {
	/// Builds a [`Error::Remote`] from an HTTP status and message.
	pub fn remote(status: u16, message: impl Into<String>) -> Self {
		Self::Remote {
			status: Some(status),
			message: message.into(),
		}
	}

	/// Returns true for remote failures reporting HTTP 404.
	pub fn is_not_found(&self) -> bool {
		matches!(self, Self::NotFound(_) | Self::Remote { status: Some(404), .. })
	}
}

impl From<serde_json::Error> for Error {
	fn from(e: serde_json::Error) -> Self {
		Self::Deserialize(e.to_string())
	}
}

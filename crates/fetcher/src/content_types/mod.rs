//! Content type id cache and cross-content-type field lookup.
//!
//! Content type ids are looked up once per `(site, list)` scope and kept for the lifetime of the
//! fetcher, unless the site key itself is rebound to another URL. Concurrent first requests for a
//! scope share one lookup.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, trace};

use crate::batch::Batch;
use crate::flight::SingleFlight;
use crate::lists::{self, FieldInfo, ListKey};
use crate::sites::{SiteHandle, SiteKey};
use crate::transport::{RestRequest, RestTransport};
use crate::{Result, odata};

/// Cache key: a site and, for list-scoped lookups, the list.
pub type ContentTypeKey = (SiteKey, Option<ListKey>);

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContentTypeRow {
	string_id: String,
}

/// Memoized content type ids per scope.
#[derive(Default)]
pub struct ContentTypeCache {
	entries: SingleFlight<ContentTypeKey, Arc<[String]>>,
}

impl ContentTypeCache {
	/// Create an empty cache.
	pub fn new() -> Self {
		Self::default()
	}

	/// Ordered content type ids visible at `list` of `site` (the whole site when `None`).
	///
	/// The first caller for a scope issues the lookup; callers arriving while it runs receive the
	/// same result. A successful result is kept permanently. A failed lookup is reported to every
	/// waiter and the next call looks it up again.
	pub async fn resolve(
		&self,
		transport: &dyn RestTransport,
		site: &SiteHandle,
		list: Option<&ListKey>,
	) -> Result<Arc<[String]>> {
		let key: ContentTypeKey = (site.key().clone(), list.cloned());
		self.entries
			.get_or_resolve(&key, || async move {
				let scope = lists::scope_path(list);
				debug!(site = %site.key(), scope = %scope, "Looking up content type ids");
				let request = RestRequest::get(format!("{scope}/contenttypes")).query("$select", "StringId");
				let rows = odata::collection(transport.send(site, request).await?)?;
				let ids = rows
					.into_iter()
					.map(|row| serde_json::from_value::<ContentTypeRow>(row).map(|r| r.string_id))
					.collect::<Result<Vec<_>, _>>()?;
				trace!(count = ids.len(), "content_types.resolved");
				Ok(Arc::from(ids))
			})
			.await
	}

	/// Resolved ids for a scope, without looking them up.
	pub fn cached(&self, site: &SiteKey, list: Option<&ListKey>) -> Option<Arc<[String]>> {
		self.entries.peek(&(site.clone(), list.cloned()))
	}

	/// Forget every scope of a site matching `predicate`.
	pub(crate) fn forget_sites(&self, mut predicate: impl FnMut(&SiteKey) -> bool) {
		self.entries.invalidate_where(|(site, _)| predicate(site));
	}

	/// Number of resolved scopes.
	pub fn len(&self) -> usize {
		self.entries.resolved_len()
	}

	/// Returns true when no scope has been resolved.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

/// Look `name_or_id` up in every content type of `scope`, all inside `batch`.
///
/// Returns the first non-empty match in content type order. A content type answering 404 does not
/// carry the field; any other failure aborts the lookup.
pub(crate) async fn find_field_in(
	batch: &Batch,
	scope: &str,
	content_type_ids: &[String],
	name_or_id: &str,
) -> Result<Option<FieldInfo>> {
	let responses: Vec<_> = content_type_ids
		.iter()
		.map(|ct| batch.add(lists::content_type_field_request(scope, ct, name_or_id)))
		.collect();

	for (ct, response) in content_type_ids.iter().zip(responses) {
		let value = match response.await {
			Ok(value) => odata::entity(value),
			Err(e) if e.is_not_found() => continue,
			Err(e) => return Err(e),
		};
		if !odata::is_empty(&value) {
			trace!(content_type = %ct, field = name_or_id, "field.matched");
			return Ok(Some(serde_json::from_value(value)?));
		}
	}
	Ok(None)
}

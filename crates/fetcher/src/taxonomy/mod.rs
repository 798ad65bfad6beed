//! Taxonomy term paths.
//!
//! A term path is a `;`-delimited sequence of term names (`Region;Europe;Norway`). Building a path
//! finds the deepest term that already exists along it and creates the missing suffix one segment
//! at a time, each new term parented to the previous one.
//!
//! Creation is sequential and not transactional: when a write fails, the terms created before it
//! stay in the term set and the error is returned.

mod query;

use tracing::{debug, info};
use uuid::Uuid;

use crate::sites::SiteHandle;
use crate::transport::{RawRequest, RestTransport};
use crate::{Error, Result};

/// Separator between the segments of a term path.
pub const PATH_DELIMITER: char = ';';

/// A term as reported by the term store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermNode {
	/// Term id (normalized GUID).
	pub id: String,
	/// Label in the default language.
	pub name: String,
	/// Whether the term sits directly below the term set.
	pub is_root: bool,
	/// Full `;`-delimited path of the term.
	pub path_of_term: String,
	/// Id of the parent term; `None` for root terms.
	pub parent_id: Option<String>,
}

/// Deepest existing term along a requested path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixMatch {
	/// Index of the last matched segment; `None` when nothing matched and the term set root is
	/// the closest ancestor.
	pub index: Option<usize>,
	/// The matched term.
	pub term: Option<TermNode>,
}

impl PrefixMatch {
	/// Segments of `segments` that do not exist yet.
	pub fn remaining<'a>(&self, segments: &'a [String]) -> &'a [String] {
		let start = self.index.map_or(0, |i| i + 1);
		segments.get(start..).unwrap_or_default()
	}
}

/// Split `path` into its segments. Empty paths and empty segments are rejected.
pub fn split_path(path: &str) -> Result<Vec<String>> {
	let segments: Vec<String> = path.split(PATH_DELIMITER).map(str::to_string).collect();
	if segments.iter().any(String::is_empty) {
		return Err(Error::InvalidPath(path.to_string()));
	}
	Ok(segments)
}

/// Find the term whose full path equals the longest prefix of `segments`.
///
/// Every term scores the index of the prefix its path equals, or nothing. The highest score wins;
/// on a tie the term listed first is kept.
pub fn closest_prefix(terms: &[TermNode], segments: &[String]) -> PrefixMatch {
	let separator = PATH_DELIMITER.to_string();
	let prefixes: Vec<String> = (1..=segments.len())
		.map(|n| segments[..n].join(separator.as_str()))
		.collect();

	let mut best: Option<(usize, &TermNode)> = None;
	for term in terms {
		let Some(score) = prefixes.iter().position(|p| *p == term.path_of_term) else {
			continue;
		};
		if best.is_none_or(|(top, _)| score > top) {
			best = Some((score, term));
		}
	}

	PrefixMatch {
		index: best.map(|(score, _)| score),
		term: best.map(|(_, term)| term.clone()),
	}
}

/// Parent of a term being created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentKind {
	/// Directly below the term set.
	TermSet,
	/// Below another term.
	Term,
}

impl ParentKind {
	fn as_str(self) -> &'static str {
		match self {
			Self::TermSet => "TermSet",
			Self::Term => "Term",
		}
	}
}

/// Reads and writes terms of one site's term store.
pub struct TermPathBuilder<'a> {
	transport: &'a dyn RestTransport,
	site: &'a SiteHandle,
	lcid: u32,
}

impl<'a> TermPathBuilder<'a> {
	/// Create a builder writing labels in locale `lcid`.
	pub fn new(transport: &'a dyn RestTransport, site: &'a SiteHandle, lcid: u32) -> Self {
		Self { transport, site, lcid }
	}

	/// Every term of `term_set`, flattened, in store order.
	pub async fn all_terms(&self, term_set: Uuid) -> Result<Vec<TermNode>> {
		let request = RawRequest::new(
			query::PROCESS_QUERY_PATH,
			query::XML_CONTENT_TYPE,
			query::all_terms_envelope(&term_set),
		);
		let body = self.transport.post_raw(self.site, request).await?;
		let terms = query::parse_terms(&body)?;
		debug!(site = %self.site.key(), %term_set, count = terms.len(), "Fetched terms");
		Ok(terms)
	}

	/// Id of the site collection's default term store.
	pub async fn default_term_store_id(&self) -> Result<String> {
		let request = RawRequest::new(query::PROCESS_QUERY_PATH, query::XML_CONTENT_TYPE, query::term_store_envelope());
		let body = self.transport.post_raw(self.site, request).await?;
		query::parse_term_store_id(&body)
	}

	/// Deepest existing term along `path` in `term_set`.
	pub async fn resolve_closest_prefix(&self, term_set: Uuid, path: &str) -> Result<PrefixMatch> {
		let segments = split_path(path)?;
		let terms = self.all_terms(term_set).await?;
		Ok(closest_prefix(&terms, &segments))
	}

	/// Make sure `path` exists in `term_set` and return the id of its last term.
	///
	/// Existing terms are reused. Missing segments are created in order, each one parented to the
	/// term created (or matched) just before it.
	pub async fn build_path(&self, ssp_id: Uuid, term_set: Uuid, path: &str) -> Result<String> {
		let segments = split_path(path)?;
		let terms = self.all_terms(term_set).await?;
		let matched = closest_prefix(&terms, &segments);
		let missing = matched.remaining(&segments);
		if missing.is_empty() {
			debug!(%term_set, path, "Term path already exists");
		}

		let mut parent = matched.term.map(|term| term.id);
		for name in missing {
			let id = self.create_item(ssp_id, term_set, parent.as_deref(), name).await?;
			parent = Some(id);
		}
		parent.ok_or_else(|| Error::InvalidPath(path.to_string()))
	}

	/// Create one term named `name` below `parent` (the term set itself when `None`).
	pub async fn create_item(&self, ssp_id: Uuid, term_set: Uuid, parent: Option<&str>, name: &str) -> Result<String> {
		let (parent_type, parent_id) = match parent {
			Some(id) => (ParentKind::Term, id.to_string()),
			None => (ParentKind::TermSet, term_set.to_string()),
		};
		let body = query::CreateItem {
			ssp_id: ssp_id.to_string(),
			lcid: self.lcid,
			parent_type: parent_type.as_str(),
			parent_id,
			term_set_id: term_set.to_string(),
			new_name: name,
		};
		let request = RawRequest::new(query::CREATE_ITEM_PATH, query::JSON_CONTENT_TYPE, serde_json::to_string(&body)?);
		let response = self.transport.post_raw(self.site, request).await?;
		let id = query::parse_created_id(&response)?;
		info!(%term_set, parent = ?parent_type, name, %id, "Created term");
		Ok(id)
	}
}

//! List and field addressing.

use std::fmt;

use serde::Deserialize;
use uuid::Uuid;

use crate::odata::quote;
use crate::transport::RestRequest;

/// Addresses a list within a site.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListKey {
	/// By list id.
	Id(Uuid),
	/// By display title.
	Title(String),
	/// By server-relative URL.
	Url(String),
}

impl ListKey {
	/// Parse `raw` as an id when it is a GUID, otherwise treat it as a title.
	pub fn parse(raw: &str) -> Self {
		match parse_guid(raw) {
			Some(id) => Self::Id(id),
			None => Self::Title(raw.to_string()),
		}
	}

	/// REST path of the list below the site's API root.
	pub fn api_path(&self) -> String {
		match self {
			Self::Id(id) => format!("web/lists(guid'{id}')"),
			Self::Title(title) => format!("web/lists/getbytitle({})", quote(title)),
			Self::Url(url) => format!("web/getlist({})", quote(url)),
		}
	}
}

impl fmt::Display for ListKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Id(id) => write!(f, "{id}"),
			Self::Title(title) => f.write_str(title),
			Self::Url(url) => f.write_str(url),
		}
	}
}

/// REST path of the scope a lookup runs in: the web, or a list of it.
pub(crate) fn scope_path(list: Option<&ListKey>) -> String {
	list.map_or_else(|| "web".to_string(), ListKey::api_path)
}

/// Parse a GUID in any of the platform's printed forms.
pub(crate) fn parse_guid(raw: &str) -> Option<Uuid> {
	Uuid::parse_str(&crate::odata::normalize_guid(raw)).ok()
}

/// Request resolving `name_or_id` among the fields of one content type in `scope`.
pub(crate) fn content_type_field_request(scope: &str, content_type_id: &str, name_or_id: &str) -> RestRequest {
	let fields = format!("{scope}/contenttypes({})/fields", quote(content_type_id));
	match parse_guid(name_or_id) {
		Some(id) => RestRequest::get(format!("{fields}/getbyid('{id}')")),
		None => RestRequest::get(format!("{fields}/getbyinternalnameortitle({})", quote(name_or_id))),
	}
}

/// List metadata.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListInfo {
	/// List id.
	pub id: String,
	/// Display title.
	pub title: String,
	/// Platform template number (101 for document libraries).
	#[serde(default)]
	pub base_template: Option<i32>,
	/// Number of items, when reported.
	#[serde(default)]
	pub item_count: Option<u64>,
}

/// Field (column) metadata.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FieldInfo {
	/// Field id.
	pub id: String,
	/// Internal name.
	pub internal_name: String,
	/// Display title.
	#[serde(default)]
	pub title: String,
	/// Type name (e.g. `TaxonomyFieldType`).
	#[serde(default)]
	pub type_as_string: String,
	/// Term set bound to a taxonomy field.
	#[serde(default)]
	pub term_set_id: Option<String>,
	/// Term store bound to a taxonomy field.
	#[serde(default)]
	pub ssp_id: Option<String>,
}

impl FieldInfo {
	/// Term store and term set ids, when this is a bound taxonomy field.
	pub fn taxonomy_binding(&self) -> Option<(Uuid, Uuid)> {
		let ssp = parse_guid(self.ssp_id.as_deref()?)?;
		let term_set = parse_guid(self.term_set_id.as_deref()?)?;
		Some((ssp, term_set))
	}
}

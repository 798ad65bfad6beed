//! Wire formats of the two procedural taxonomy endpoints.
//!
//! Term reads go through the client object model endpoint, which takes an XML action envelope and
//! answers with a JSON array interleaving action ids and result objects. Term creation goes through
//! the JSON taxonomy service, one item per call.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::TermNode;
use crate::{Error, Result, odata};

/// Client object model endpoint, relative to the site URL.
pub(crate) const PROCESS_QUERY_PATH: &str = "_vti_bin/client.svc/ProcessQuery";
/// Taxonomy item creation endpoint, relative to the site URL.
pub(crate) const CREATE_ITEM_PATH: &str = "_vti_bin/TaxonomyInternalService.json/CreateTaxonomyItem";

pub(crate) const XML_CONTENT_TYPE: &str = "text/xml";
pub(crate) const JSON_CONTENT_TYPE: &str = "application/json;odata=verbose";

const TAXONOMY_SESSION_TYPE_ID: &str = "{981cbc68-9edc-4f8d-872f-71146fcbb84f}";
const ENVELOPE_HEAD: &str = r#"<Request xmlns="http://schemas.microsoft.com/sharepoint/clientquery/2009" SchemaVersion="15.0.0.0" LibraryVersion="16.0.0.0" ApplicationName="spgate">"#;

/// Session → default term store → term set → all terms, selecting the fields [`TermNode`] needs.
pub(crate) fn all_terms_envelope(term_set: &Uuid) -> String {
	format!(
		concat!(
			"{head}<Actions>",
			r#"<ObjectPath Id="2" ObjectPathId="1"/>"#,
			r#"<ObjectPath Id="4" ObjectPathId="3"/>"#,
			r#"<ObjectPath Id="6" ObjectPathId="5"/>"#,
			r#"<ObjectPath Id="8" ObjectPathId="7"/>"#,
			r#"<Query Id="9" ObjectPathId="7">"#,
			r#"<Query SelectAllProperties="false"><Properties/></Query>"#,
			r#"<ChildItemQuery SelectAllProperties="false"><Properties>"#,
			r#"<Property Name="Id" ScalarProperty="true"/>"#,
			r#"<Property Name="Name" ScalarProperty="true"/>"#,
			r#"<Property Name="IsRoot" ScalarProperty="true"/>"#,
			r#"<Property Name="PathOfTerm" ScalarProperty="true"/>"#,
			r#"<Property Name="Parent" SelectAll="false"><Query SelectAllProperties="false"><Properties>"#,
			r#"<Property Name="Id" ScalarProperty="true"/>"#,
			r#"</Properties></Query></Property>"#,
			r#"</Properties></ChildItemQuery>"#,
			r#"</Query>"#,
			"</Actions><ObjectPaths>",
			r#"<StaticMethod Id="1" Name="GetTaxonomySession" TypeId="{type_id}"/>"#,
			r#"<Method Id="3" ParentId="1" Name="GetDefaultSiteCollectionTermStore"/>"#,
			r#"<Method Id="5" ParentId="3" Name="GetTermSet"><Parameters><Parameter Type="Guid">{{{term_set}}}</Parameter></Parameters></Method>"#,
			r#"<Method Id="7" ParentId="5" Name="GetAllTerms"/>"#,
			"</ObjectPaths></Request>",
		),
		head = ENVELOPE_HEAD,
		type_id = TAXONOMY_SESSION_TYPE_ID,
		term_set = term_set,
	)
}

/// Session → default term store, selecting its id.
pub(crate) fn term_store_envelope() -> String {
	format!(
		concat!(
			"{head}<Actions>",
			r#"<ObjectPath Id="2" ObjectPathId="1"/>"#,
			r#"<ObjectPath Id="4" ObjectPathId="3"/>"#,
			r#"<Query Id="5" ObjectPathId="3">"#,
			r#"<Query SelectAllProperties="false"><Properties><Property Name="Id" ScalarProperty="true"/></Properties></Query>"#,
			r#"</Query>"#,
			"</Actions><ObjectPaths>",
			r#"<StaticMethod Id="1" Name="GetTaxonomySession" TypeId="{type_id}"/>"#,
			r#"<Method Id="3" ParentId="1" Name="GetDefaultSiteCollectionTermStore"/>"#,
			"</ObjectPaths></Request>",
		),
		head = ENVELOPE_HEAD,
		type_id = TAXONOMY_SESSION_TYPE_ID,
	)
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorInfo {
	#[serde(default)]
	error_message: Option<String>,
	#[serde(default)]
	error_type_name: Option<String>,
}

/// Parse a ProcessQuery response into its result objects, surfacing a reported failure.
fn parse_process_query(body: &str) -> Result<Vec<Value>> {
	let items: Vec<Value> = serde_json::from_str(body)?;
	let header = items
		.first()
		.ok_or_else(|| Error::Protocol("empty ProcessQuery response".into()))?;
	if let Some(info) = header.get("ErrorInfo").filter(|v| !v.is_null()) {
		let info: ErrorInfo = serde_json::from_value(info.clone())?;
		let message = info
			.error_message
			.or(info.error_type_name)
			.unwrap_or_else(|| "ProcessQuery failed".to_string());
		return Err(Error::Remote { status: None, message });
	}
	Ok(items)
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawParent {
	#[serde(default)]
	id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawTerm {
	id: String,
	name: String,
	#[serde(default)]
	is_root: bool,
	path_of_term: String,
	#[serde(default)]
	parent: Option<RawParent>,
}

impl From<RawTerm> for TermNode {
	fn from(raw: RawTerm) -> Self {
		Self {
			id: odata::normalize_guid(&raw.id),
			name: raw.name,
			is_root: raw.is_root,
			path_of_term: raw.path_of_term,
			parent_id: raw.parent.and_then(|p| p.id).map(|id| odata::normalize_guid(&id)),
		}
	}
}

/// Flattened terms from a GetAllTerms response, in response order.
pub(crate) fn parse_terms(body: &str) -> Result<Vec<TermNode>> {
	let items = parse_process_query(body)?;
	let children = items
		.into_iter()
		.find_map(|mut item| item.as_object_mut().and_then(|o| o.remove("_Child_Items_")))
		.ok_or_else(|| Error::Protocol("ProcessQuery response carries no term collection".into()))?;
	let raw: Vec<RawTerm> = serde_json::from_value(children)?;
	Ok(raw.into_iter().map(TermNode::from).collect())
}

/// Id of the default term store from a term store query response.
pub(crate) fn parse_term_store_id(body: &str) -> Result<String> {
	parse_process_query(body)?
		.iter()
		.filter(|item| item.get("_ObjectType_").and_then(Value::as_str) == Some("SP.Taxonomy.TermStore"))
		.find_map(|item| item.get("Id").and_then(Value::as_str))
		.map(odata::normalize_guid)
		.ok_or_else(|| Error::NotFound("default site collection term store".into()))
}

/// Body of one CreateTaxonomyItem call.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateItem<'a> {
	pub ssp_id: String,
	pub lcid: u32,
	pub parent_type: &'static str,
	pub parent_id: String,
	pub term_set_id: String,
	pub new_name: &'a str,
}

/// Id of the item created by a CreateTaxonomyItem call.
pub(crate) fn parse_created_id(body: &str) -> Result<String> {
	let value: Value = serde_json::from_str(body)?;
	let id = match value.get("d") {
		Some(Value::String(id)) => Some(id.as_str()),
		Some(d) => d.get("Id").and_then(Value::as_str),
		None => value.get("Id").and_then(Value::as_str),
	};
	id.map(odata::normalize_guid)
		.ok_or_else(|| Error::Protocol("CreateTaxonomyItem response carries no id".into()))
}

//! Purpose: Typed bibliographic item model, relaxed-input normalization, and the stored envelope.
//! Exports: `BibliographicItem`, `DocId`, `Contributor`, `RecordEnvelope`, `normalize_relaxed`,
//! `bibitem_from_value`, `primary_docid`.
//! Invariants: Normalization never fails; it rewrites what it recognizes and leaves the rest.
//! Invariants: Envelope digests are deterministic for a given bibitem + xml pair.

use crate::core::error::{Error, ErrorKind};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Accepts either a single element or a list, as loose source datasets do.
/// Explicit nulls read as empty.
fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    let items = match value {
        Value::Null => return Ok(Vec::new()),
        Value::Array(items) => items,
        other => vec![other],
    };
    items
        .into_iter()
        .map(|item| serde_json::from_value(item).map_err(serde::de::Error::custom))
        .collect()
}

/// A formatted string per the bibliographic data model: either a bare string
/// or `{"content": …}`. Extra formatting fields are ignored on read.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FormattedString {
    pub content: String,
}

impl<'de> Deserialize<'de> for FormattedString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(content) => Ok(Self { content }),
            Value::Object(map) => {
                let content = map
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(Self { content })
            }
            other => Ok(Self {
                content: other.to_string(),
            }),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DocId {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub id_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// A typed title: either a bare string or `{"type": …, "content": …}`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Title {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub title_type: Option<String>,
    pub content: String,
}

impl<'de> Deserialize<'de> for Title {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(content) => Ok(Self {
                title_type: None,
                content,
            }),
            Value::Object(map) => Ok(Self {
                title_type: map
                    .get("type")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                content: map.get("content").map(plain_string).unwrap_or_default(),
            }),
            other => Ok(Self {
                title_type: None,
                content: other.to_string(),
            }),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DocDate {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub date_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Role {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub role_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Phone {
    #[serde(default)]
    pub content: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Address {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub street: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postcode: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<Phone>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub name: Vec<FormattedString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abbreviation: Option<FormattedString>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub contact: Vec<Contact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GivenName {
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub forename: Vec<FormattedString>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub formatted_initials: Vec<FormattedString>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonName {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completename: Option<FormattedString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub surname: Option<FormattedString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub given: Option<GivenName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<FormattedString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addition: Option<FormattedString>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Affiliation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<Organization>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Person {
    #[serde(default)]
    pub name: PersonName,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub affiliation: Vec<Affiliation>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub contact: Vec<Contact>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Contributor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub person: Option<Person>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<Organization>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub role: Vec<Role>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Edition {
    #[serde(default)]
    pub content: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Link {
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Series {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<FormattedString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub relation_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bibitem: Option<Box<BibliographicItem>>,
}

/// The typed view of a normalized bibliographic item. Carries the fields the
/// service consumes; unknown source fields survive only in the raw envelope.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BibliographicItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub item_type: Option<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub docid: Vec<DocId>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub title: Vec<Title>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub contributor: Vec<Contributor>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub date: Vec<DocDate>,
    #[serde(
        rename = "abstract",
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub abstracts: Vec<FormattedString>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub version: Vec<VersionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edition: Option<Edition>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub keyword: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub link: Vec<Link>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub series: Vec<Series>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub relation: Vec<Relation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched: Option<String>,
}

impl BibliographicItem {
    pub fn main_title(&self) -> Option<&str> {
        self.title
            .iter()
            .find(|title| title.title_type.as_deref() == Some("main"))
            .or_else(|| self.title.first())
            .map(|title| title.content.as_str())
    }

    pub fn published_date(&self) -> Option<&str> {
        self.date
            .iter()
            .find(|date| date.date_type.as_deref() == Some("published"))
            .or_else(|| self.date.first())
            .and_then(|date| date.value.as_deref())
    }
}

/// One recoverable deviation found while parsing loose source data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceIssue {
    pub field: String,
    pub message: String,
}

/// Extracts the primary document identifier: `primary == true` with id and
/// type set and no scope. When several distinct primaries exist, the first
/// wins and a warning is logged.
pub fn primary_docid(docids: &[DocId]) -> Option<&DocId> {
    let primaries: Vec<&DocId> = docids
        .iter()
        .filter(|docid| {
            docid.primary == Some(true)
                && docid.id.is_some()
                && docid.id_type.is_some()
                && docid.scope.is_none()
        })
        .collect();

    let deduped: HashSet<(Option<&str>, Option<&str>)> = primaries
        .iter()
        .map(|docid| (docid.id.as_deref(), docid.id_type.as_deref()))
        .collect();
    if deduped.len() != 1 {
        tracing::warn!(
            primaries = primaries.len(),
            "unexpected number of primary docids"
        );
    }

    primaries.first().copied()
}

/// Rewrites common relaxed/abbreviated source shapes into strict form:
/// bare-string versions and editions, formatted-string keywords, bare-string
/// roles, flat contact objects, and forenames without content. Recurses into
/// relations. Leaves anything it does not recognize untouched.
pub fn normalize_relaxed(data: &mut Value) {
    let Some(map) = data.as_object_mut() else {
        return;
    };

    if let Some(version) = map.remove("version") {
        let versions = match version {
            Value::Array(items) => items,
            other => vec![other],
        };
        let normalized: Vec<Value> = versions
            .into_iter()
            .map(|item| match item {
                Value::String(draft) => json!({ "draft": draft }),
                other => other,
            })
            .collect();
        map.insert("version".to_string(), Value::Array(normalized));
    }

    if let Some(Value::String(edition)) = map.get("edition") {
        let edition = edition.clone();
        map.insert("edition".to_string(), json!({ "content": edition }));
    }

    if let Some(Value::Array(keywords)) = map.get_mut("keyword") {
        for keyword in keywords.iter_mut() {
            if let Value::Object(inner) = keyword {
                if let Some(content) = inner.get("content") {
                    *keyword = Value::String(plain_string(content));
                }
            }
        }
    }

    if let Some(Value::Array(contributors)) = map.get_mut("contributor") {
        for contributor in contributors.iter_mut() {
            normalize_contributor(contributor);
        }
    }

    if let Some(Value::Array(relations)) = map.get_mut("relation") {
        for relation in relations.iter_mut() {
            if let Some(bibitem) = relation.get_mut("bibitem") {
                normalize_relaxed(bibitem);
            }
        }
    }
}

fn normalize_contributor(contributor: &mut Value) {
    let Some(map) = contributor.as_object_mut() else {
        return;
    };

    for key in ["person", "organization"] {
        let Some(entity) = map.get_mut(key).and_then(Value::as_object_mut) else {
            continue;
        };
        if let Some(contact) = entity.remove("contact") {
            let contacts = match contact {
                Value::Array(items) => items,
                other => vec![other],
            };
            let normalized: Vec<Value> = contacts
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(inner) => normalize_contact(inner),
                    _ => None,
                })
                .collect();
            entity.insert("contact".to_string(), Value::Array(normalized));
        }
        if key == "person" {
            if let Some(given) = entity
                .get_mut("name")
                .and_then(|name| name.get_mut("given"))
                .and_then(Value::as_object_mut)
            {
                if let Some(forename) = given.remove("forename") {
                    let forenames = match forename {
                        Value::Array(items) => items,
                        other => vec![other],
                    };
                    let ensured: Vec<Value> =
                        forenames.into_iter().map(ensure_formatted_string).collect();
                    given.insert("forename".to_string(), Value::Array(ensured));
                }
                if let Some(initials) = given.remove("formatted_initials") {
                    given.insert(
                        "formatted_initials".to_string(),
                        ensure_formatted_string(initials),
                    );
                }
            }
        }
    }

    if let Some(role) = map.remove("role") {
        let roles = match role {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };
        let normalized: Vec<Value> = roles.into_iter().map(normalize_role).collect();
        map.insert("role".to_string(), Value::Array(normalized));
    }
}

fn normalize_role(role: Value) -> Value {
    match role {
        Value::String(kind) => json!({ "type": kind }),
        Value::Object(map) if map.contains_key("type") || map.contains_key("description") => {
            Value::Object(map)
        }
        other => json!({ "description": plain_string(&other) }),
    }
}

fn normalize_contact(raw: Map<String, Value>) -> Option<Value> {
    if let Some(kind) = raw.get("type").and_then(Value::as_str) {
        if let Some(value) = raw.get("value") {
            let text = value.as_str().unwrap_or_default();
            if text.is_empty() {
                return None;
            }
            return match kind {
                "email" => Some(json!({ "email": text })),
                "uri" | "url" => Some(json!({ "uri": text })),
                "phone" => Some(json!({ "phone": { "content": text } })),
                _ => Some(Value::Object(raw)),
            };
        }
    }

    if raw.contains_key("city") || raw.contains_key("country") {
        return Some(json!({ "address": Value::Object(raw) }));
    }

    if let Some(Value::String(phone)) = raw.get("phone") {
        return Some(json!({ "phone": { "content": phone } }));
    }

    Some(Value::Object(raw))
}

fn ensure_formatted_string(value: Value) -> Value {
    match value {
        Value::String(content) => json!({ "content": content }),
        Value::Object(mut map) => {
            let missing = !matches!(map.get("content"), Some(Value::String(s)) if !s.is_empty());
            if missing {
                map.insert("content".to_string(), Value::String(String::new()));
            }
            Value::Object(map)
        }
        other => json!({ "content": plain_string(&other) }),
    }
}

fn plain_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Object(map) => map
            .get("content")
            .map(plain_string)
            .unwrap_or_else(|| Value::Object(map.clone()).to_string()),
        other => other.to_string(),
    }
}

/// Parses source data into the typed model. Always normalizes first. With
/// `strict` set, a parse failure is an error; otherwise the failure is
/// collected as issues and fields are salvaged individually, so a single
/// malformed contributor does not discard a whole document.
pub fn bibitem_from_value(
    mut data: Value,
    strict: bool,
) -> Result<(BibliographicItem, Value, Vec<SourceIssue>), Error> {
    normalize_relaxed(&mut data);

    match serde_json::from_value::<BibliographicItem>(data.clone()) {
        Ok(item) => Ok((item, data, Vec::new())),
        Err(err) if strict => Err(Error::new(ErrorKind::Usage)
            .with_message("invalid bibliographic item")
            .with_source(err)),
        Err(err) => {
            let mut issues = vec![SourceIssue {
                field: String::new(),
                message: err.to_string(),
            }];
            let item = salvage_bibitem(&data, &mut issues);
            tracing::warn!(issues = issues.len(), "relaxed bibliographic item parse");
            Ok((item, data, issues))
        }
    }
}

fn salvage_bibitem(data: &Value, issues: &mut Vec<SourceIssue>) -> BibliographicItem {
    BibliographicItem {
        id: salvage_field(data, "id", issues),
        item_type: salvage_field(data, "type", issues),
        docid: salvage_list(data, "docid", issues),
        title: salvage_list(data, "title", issues),
        contributor: salvage_list(data, "contributor", issues),
        date: salvage_list(data, "date", issues),
        abstracts: salvage_list(data, "abstract", issues),
        version: salvage_list(data, "version", issues),
        edition: salvage_field(data, "edition", issues),
        keyword: salvage_list(data, "keyword", issues),
        link: salvage_list(data, "link", issues),
        series: salvage_list(data, "series", issues),
        relation: salvage_list(data, "relation", issues),
        fetched: salvage_field(data, "fetched", issues),
    }
}

fn salvage_field<T: DeserializeOwned>(
    data: &Value,
    field: &str,
    issues: &mut Vec<SourceIssue>,
) -> Option<T> {
    let value = data.get(field)?;
    match serde_json::from_value(value.clone()) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            issues.push(SourceIssue {
                field: field.to_string(),
                message: err.to_string(),
            });
            None
        }
    }
}

fn salvage_list<T: DeserializeOwned>(
    data: &Value,
    field: &str,
    issues: &mut Vec<SourceIssue>,
) -> Vec<T> {
    let Some(value) = data.get(field) else {
        return Vec::new();
    };
    let items = match value {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    };
    let mut parsed = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        match serde_json::from_value(item) {
            Ok(entry) => parsed.push(entry),
            Err(err) => issues.push(SourceIssue {
                field: format!("{field}[{index}]"),
                message: err.to_string(),
            }),
        }
    }
    parsed
}

/// The stored form of a record: one envelope per (snapshot, docid).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordEnvelope {
    pub docid: String,
    pub snapshot: String,
    pub fetched: String,
    pub digest: String,
    pub bibitem: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xml: Option<String>,
}

impl RecordEnvelope {
    pub fn new(
        docid: impl Into<String>,
        snapshot: impl Into<String>,
        bibitem: Value,
        xml: Option<String>,
    ) -> Result<Self, Error> {
        let digest = compute_digest(&bibitem, xml.as_deref())?;
        Ok(Self {
            docid: docid.into(),
            snapshot: snapshot.into(),
            fetched: now_rfc3339()?,
            digest,
            bibitem,
            xml,
        })
    }

    pub fn verify_digest(&self) -> Result<(), Error> {
        let expected = compute_digest(&self.bibitem, self.xml.as_deref())?;
        if expected != self.digest {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("record digest mismatch")
                .with_docid(&self.docid)
                .with_snapshot(&self.snapshot));
        }
        Ok(())
    }

    pub fn typed_item(&self) -> Result<(BibliographicItem, Vec<SourceIssue>), Error> {
        let (item, _, issues) = bibitem_from_value(self.bibitem.clone(), false)?;
        Ok((item, issues))
    }
}

/// SHA-256 over the canonical bibitem JSON followed by the XML body, as
/// `sha256:<hex>`. serde_json maps are ordered, so the digest is stable.
pub fn compute_digest(bibitem: &Value, xml: Option<&str>) -> Result<String, Error> {
    let body = serde_json::to_vec(bibitem).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("bibitem serialization failed")
            .with_source(err)
    })?;
    let mut hasher = Sha256::new();
    hasher.update(&body);
    if let Some(xml) = xml {
        hasher.update(xml.as_bytes());
    }
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
    Ok(format!("sha256:{hex}"))
}

pub fn now_rfc3339() -> Result<String, Error> {
    use time::format_description::well_known::Rfc3339;
    time::OffsetDateTime::now_utc().format(&Rfc3339).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("timestamp format failed")
            .with_source(err)
    })
}

#[cfg(test)]
mod tests {
    use super::{
        RecordEnvelope, bibitem_from_value, compute_digest, normalize_relaxed, primary_docid,
    };
    use serde_json::json;

    #[test]
    fn normalize_version_string_becomes_draft() {
        let mut data = json!({ "version": "17" });
        normalize_relaxed(&mut data);
        assert_eq!(data["version"], json!([{ "draft": "17" }]));

        let mut data = json!({ "version": { "draft": "03" } });
        normalize_relaxed(&mut data);
        assert_eq!(data["version"], json!([{ "draft": "03" }]));
    }

    #[test]
    fn normalize_edition_string_becomes_content() {
        let mut data = json!({ "edition": "2nd" });
        normalize_relaxed(&mut data);
        assert_eq!(data["edition"], json!({ "content": "2nd" }));
    }

    #[test]
    fn normalize_keywords_collapse_to_plain_strings() {
        let mut data = json!({ "keyword": [{ "content": "routing" }, "transport"] });
        normalize_relaxed(&mut data);
        assert_eq!(data["keyword"], json!(["routing", "transport"]));
    }

    #[test]
    fn normalize_roles_and_contacts() {
        let mut data = json!({
            "contributor": [{
                "role": "editor",
                "person": {
                    "name": { "surname": { "content": "Rivest" } },
                    "contact": [
                        { "type": "email", "value": "rivest@example.com" },
                        { "type": "uri", "value": "" },
                        { "city": "Cambridge", "country": "US" },
                        { "phone": "+1 555 0100" }
                    ]
                }
            }]
        });
        normalize_relaxed(&mut data);
        let contributor = &data["contributor"][0];
        assert_eq!(contributor["role"], json!([{ "type": "editor" }]));
        let contacts = contributor["person"]["contact"].as_array().expect("contacts");
        assert_eq!(contacts.len(), 3);
        assert_eq!(contacts[0], json!({ "email": "rivest@example.com" }));
        assert_eq!(
            contacts[1],
            json!({ "address": { "city": "Cambridge", "country": "US" } })
        );
        assert_eq!(contacts[2], json!({ "phone": { "content": "+1 555 0100" } }));
    }

    #[test]
    fn normalize_recurses_into_relations() {
        let mut data = json!({
            "relation": [{
                "type": "obsoletes",
                "bibitem": { "version": "1" }
            }]
        });
        normalize_relaxed(&mut data);
        assert_eq!(
            data["relation"][0]["bibitem"]["version"],
            json!([{ "draft": "1" }])
        );
    }

    #[test]
    fn strict_parse_rejects_bad_items() {
        let data = json!({ "docid": [{ "id": 42 }] });
        let err = bibitem_from_value(data, true).expect_err("parsed");
        assert_eq!(err.kind(), crate::core::error::ErrorKind::Usage);
    }

    #[test]
    fn relaxed_parse_salvages_good_fields() {
        let data = json!({
            "docid": [{ "id": "RFC1234", "type": "IETF", "primary": true }],
            "title": [{ "content": "A Title", "type": "main" }],
            "date": "not-a-date-object"
        });
        let (item, _, issues) = bibitem_from_value(data, false).expect("relaxed");
        assert_eq!(item.docid.len(), 1);
        assert_eq!(item.main_title(), Some("A Title"));
        assert!(item.date.is_empty());
        assert!(!issues.is_empty());
    }

    #[test]
    fn single_objects_parse_as_lists() {
        let data = json!({
            "docid": { "id": "RFC1234", "type": "IETF" },
            "title": "Bare Title"
        });
        let (item, _, issues) = bibitem_from_value(data, true).expect("strict");
        assert!(issues.is_empty());
        assert_eq!(item.docid.len(), 1);
        assert_eq!(item.main_title(), Some("Bare Title"));
    }

    #[test]
    fn primary_docid_requires_id_type_and_no_scope() {
        let data = json!({
            "docid": [
                { "id": "RFC1234", "type": "IETF", "primary": true },
                { "id": "10.17487/RFC1234", "type": "DOI" },
                { "id": "scoped", "type": "IETF", "primary": true, "scope": "anchor" }
            ]
        });
        let (item, _, _) = bibitem_from_value(data, true).expect("parse");
        let primary = primary_docid(&item.docid).expect("primary");
        assert_eq!(primary.id.as_deref(), Some("RFC1234"));

        assert!(primary_docid(&[]).is_none());
    }

    #[test]
    fn digest_is_stable_and_verifies() {
        let bibitem = json!({ "docid": [{ "id": "RFC1234", "type": "IETF" }] });
        let first = compute_digest(&bibitem, Some("<reference/>")).expect("digest");
        let second = compute_digest(&bibitem, Some("<reference/>")).expect("digest");
        assert_eq!(first, second);
        assert!(first.starts_with("sha256:"));

        let envelope = RecordEnvelope::new(
            "RFC1234",
            "test",
            bibitem,
            Some("<reference/>".to_string()),
        )
        .expect("envelope");
        envelope.verify_digest().expect("verify");

        let mut tampered = envelope;
        tampered.bibitem = json!({ "docid": [] });
        assert!(tampered.verify_digest().is_err());
    }
}

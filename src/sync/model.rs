use crate::error::AccessError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

pub const WEBHOOK_NOT_SET: &str = "NOT SET";
pub const UNKNOWN_NAME: &str = "unknown";
pub const UNKNOWN_ORGANIZATION: &str = "unknown";
pub const NOT_FOUND_DESCRIPTION: &str = "toolchain guid not found using OTC API";
pub const SERVICE_INSTANCE_KIND: &str = "service_instance";
pub const TOOLCHAIN_KIND: &str = "toolchain";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolchainId(String);

impl ToolchainId {
    /// Accepts a raw id from an event or view row; blank ids are treated as absent.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ToolchainId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl fmt::Display for ToolchainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Interprets the loose boolean encodings found in legacy documents
/// (`true`, `"true"`, `1`).
pub fn flag_value(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim() {
            v if v.eq_ignore_ascii_case("true") => Some(true),
            v if v.eq_ignore_ascii_case("false") => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        _ => None,
    }
}

fn lenient_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    Ok(flag_value(&raw).unwrap_or(false))
}

fn lenient_optional_flag<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    Ok(flag_value(&raw))
}

/// Reads `T`, treating a value of the wrong shape as absent.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let raw = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(raw).ok())
}

fn lenient_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient::<D, String>(deserializer)?.unwrap_or_default())
}

fn lenient_webhook<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient::<D, String>(deserializer)?.unwrap_or_else(webhook_not_set))
}

/// Anything but an array reads as no bindings; entries that are not objects
/// are dropped.
fn lenient_services<'de, D>(deserializer: D) -> Result<Vec<ServiceBinding>, D::Error>
where
    D: Deserializer<'de>,
{
    let Value::Array(items) = Value::deserialize(deserializer)? else {
        return Ok(Vec::new());
    };
    Ok(items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect())
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn webhook_not_set() -> String {
    WEBHOOK_NOT_SET.to_string()
}

/// A service attached to a toolchain, as kept in the warehouse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceBinding {
    #[serde(default, deserialize_with = "lenient_text")]
    pub service_id: String,
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub instance_id: Option<String>,
    #[serde(default = "webhook_not_set", deserialize_with = "lenient_webhook")]
    pub webhook_id: String,
    #[serde(
        default,
        deserialize_with = "lenient_optional_flag",
        skip_serializing_if = "Option::is_none"
    )]
    pub enable_traceability: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ServiceBinding {
    /// Lifts the webhook id and traceability flag out of the nested API shape.
    /// Running it twice is a no-op.
    pub fn normalize(&mut self) {
        if self.webhook_id.trim().is_empty() || self.webhook_id == WEBHOOK_NOT_SET {
            self.webhook_id = self
                .extra
                .get("toolchain_binding")
                .and_then(|binding| binding.get("webhook_id"))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map_or_else(webhook_not_set, ToOwned::to_owned);
        }
        if self.enable_traceability.is_none() {
            self.enable_traceability = self
                .extra
                .get("parameters")
                .and_then(|params| params.get("enable_traceability"))
                .and_then(flag_value);
        }
    }
}

/// Provenance recovered from the event log for a toolchain the API no longer knows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub toolchain_guid: ToolchainId,
    pub generator: Option<String>,
    pub organization_guid: String,
    pub creator: Option<String>,
    pub created: Option<String>,
}

/// Warehouse document for one toolchain, live or tombstoned.
///
/// Fields the API returns that are not modelled here round-trip through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolchainRecord {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub toolchain_guid: String,
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub name: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub description: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub organization_guid: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub creator: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub created: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub generator: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_services",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub services: Vec<ServiceBinding>,
    #[serde(
        default,
        deserialize_with = "lenient_flag",
        skip_serializing_if = "is_false"
    )]
    pub deleted: bool,
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub date_deleted: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_flag",
        skip_serializing_if = "is_false"
    )]
    pub no_event_found: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ToolchainRecord {
    pub fn from_document(doc: Value) -> Result<Self, AccessError> {
        Ok(serde_json::from_value(doc)?)
    }

    pub fn to_document(&self) -> Result<Value, AccessError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Builds the warehouse form of an API record: guid filled in, bindings
    /// normalized, no store metadata.
    pub fn from_source(id: &ToolchainId, raw: Value) -> Result<Self, AccessError> {
        let mut record = Self::from_document(raw)?;
        record.doc_id = None;
        record.rev = None;
        if record.toolchain_guid.trim().is_empty() {
            record.toolchain_guid = id.to_string();
        }
        for service in &mut record.services {
            service.normalize();
        }
        Ok(record)
    }

    /// Tombstone synthesized from event-log provenance.
    pub fn tombstone(provenance: &Provenance, date_deleted: String) -> Self {
        Self {
            toolchain_guid: provenance.toolchain_guid.to_string(),
            name: Some(UNKNOWN_NAME.to_string()),
            description: Some(NOT_FOUND_DESCRIPTION.to_string()),
            organization_guid: Some(provenance.organization_guid.clone()),
            creator: provenance.creator.clone(),
            created: provenance.created.clone(),
            generator: provenance.generator.clone(),
            deleted: true,
            date_deleted: Some(date_deleted),
            ..Self::default()
        }
    }

    /// Tombstone for an id that has neither an API record nor any event; it is
    /// excluded from migration and export.
    pub fn orphan_tombstone(
        id: &ToolchainId,
        placeholder_name: &str,
        date_deleted: String,
    ) -> Self {
        Self {
            toolchain_guid: id.to_string(),
            name: Some(placeholder_name.to_string()),
            description: Some(NOT_FOUND_DESCRIPTION.to_string()),
            deleted: true,
            date_deleted: Some(date_deleted),
            no_event_found: true,
            ..Self::default()
        }
    }

    pub fn is_placeholder(&self, placeholder_name: &str) -> bool {
        !self.no_event_found && self.name.as_deref() == Some(placeholder_name)
    }

    /// Content equality, ignoring store metadata.
    pub fn same_content(&self, other: &Self) -> bool {
        let strip = |record: &Self| Self {
            doc_id: None,
            rev: None,
            ..record.clone()
        };
        strip(self) == strip(other)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Create,
    Update,
    Delete,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityRef {
    #[serde(deserialize_with = "lenient")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubjectRef {
    #[serde(rename = "objectType", deserialize_with = "lenient")]
    pub object_type: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub id: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub generator: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub organization: Option<EntityRef>,
}

impl SubjectRef {
    pub fn is_kind(&self, kind: &str) -> bool {
        self.object_type.as_deref() == Some(kind)
    }
}

/// One entry of the append-only metrics event log. Historical events do not
/// share a single shape: every field is optional and a field of the wrong type
/// reads as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Event {
    #[serde(
        rename = "_id",
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub doc_id: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub verb: Option<Verb>,
    #[serde(deserialize_with = "lenient")]
    pub generator: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub object: Option<SubjectRef>,
    #[serde(deserialize_with = "lenient")]
    pub target: Option<SubjectRef>,
    #[serde(deserialize_with = "lenient")]
    pub actor: Option<EntityRef>,
    #[serde(deserialize_with = "lenient")]
    pub published: Option<String>,
}

impl Event {
    /// Owning toolchain of the event: service-instance events name it in
    /// `target`, everything else in `object`.
    pub fn toolchain_id(&self) -> Option<ToolchainId> {
        let object = self.object.as_ref()?;
        let subject = if object.is_kind(SERVICE_INSTANCE_KIND) {
            self.target.as_ref()?
        } else {
            object
        };
        subject.id.as_deref().and_then(ToolchainId::parse)
    }

    pub fn is_verb(&self, verb: Verb) -> bool {
        self.verb == Some(verb)
    }
}

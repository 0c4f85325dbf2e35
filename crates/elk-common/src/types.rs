//! Shared types for the appmetrics ELK connector.
//!
//! Metric events and the per-process envelope they are published under,
//! declarative mapping descriptors, Kibana saved objects, and the datastore
//! version epoch that every document-shaping decision keys off.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Metric type with a fixed, non-declarative document shape.
pub const MEMORY_METRIC: &str = "memory";

/// Document type used by datastores that allow a single mapping type per index.
pub const GENERIC_DOC_TYPE: &str = "doc";

/// A metric event forwarded from the event source.
///
/// Immutable once constructed; `fields` holds only the allowlisted subset of
/// the raw payload.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricEvent {
    /// Metric type name (e.g. "cpu", "http").
    pub metric_type: String,
    /// Time the metric was sampled.
    pub timestamp: DateTime<Utc>,
    /// Extracted fields.
    pub fields: Map<String, Value>,
}

impl MetricEvent {
    pub fn new(
        metric_type: impl Into<String>,
        timestamp: DateTime<Utc>,
        fields: Map<String, Value>,
    ) -> Self {
        Self {
            metric_type: metric_type.into(),
            timestamp,
            fields,
        }
    }
}

/// Process identity stamped identically onto every published document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Host name of the machine running the monitored process.
    pub host: String,
    /// Process ID.
    pub pid: u32,
    /// Application label.
    pub app: String,
}

impl Envelope {
    pub fn new(host: impl Into<String>, pid: u32, app: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            pid,
            app: app.into(),
        }
    }

    /// Builds the envelope for the running process.
    ///
    /// The application label defaults to the name the process was invoked as.
    pub fn current(app: Option<String>) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());

        Self {
            host,
            pid: std::process::id(),
            app: app.unwrap_or_else(invocation_name),
        }
    }
}

/// Returns the file name this process was invoked as.
pub fn invocation_name() -> String {
    std::env::args()
        .next()
        .map(|arg| {
            Path::new(&arg)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or(arg)
        })
        .unwrap_or_default()
}

/// A metric event wrapped with its envelope, ready for a bulk write.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDocument {
    pub envelope: Arc<Envelope>,
    pub event: MetricEvent,
}

impl MetricDocument {
    pub fn new(envelope: Arc<Envelope>, event: MetricEvent) -> Self {
        Self { envelope, event }
    }

    pub fn metric_type(&self) -> &str {
        &self.event.metric_type
    }

    /// Renders the document source.
    ///
    /// The metric fields are nested under a key equal to the metric type so
    /// that each type gets its own mapping namespace.
    pub fn to_source(&self) -> Value {
        let metric_type = self.event.metric_type.clone();
        let mut source = Map::with_capacity(6);
        source.insert("type".to_string(), Value::String(metric_type.clone()));
        source.insert(
            "@timestamp".to_string(),
            Value::String(
                self.event
                    .timestamp
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
        );
        source.insert(
            "host".to_string(),
            Value::String(self.envelope.host.clone()),
        );
        source.insert("pid".to_string(), Value::from(self.envelope.pid));
        source.insert("app".to_string(), Value::String(self.envelope.app.clone()));
        source.insert(metric_type, Value::Object(self.event.fields.clone()));
        Value::Object(source)
    }
}

/// Field data types of the mapping catalog.
///
/// Types the version shim has no rule for are kept verbatim in `Other` and
/// written back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldType {
    Text,
    Keyword,
    /// Pre-5.x string type.
    String,
    Nested,
    Object,
    Date,
    Long,
    Integer,
    Short,
    Byte,
    Double,
    Float,
    HalfFloat,
    ScaledFloat,
    Boolean,
    Ip,
    Other(std::string::String),
}

impl FieldType {
    pub fn as_str(&self) -> &str {
        match self {
            FieldType::Text => "text",
            FieldType::Keyword => "keyword",
            FieldType::String => "string",
            FieldType::Nested => "nested",
            FieldType::Object => "object",
            FieldType::Date => "date",
            FieldType::Long => "long",
            FieldType::Integer => "integer",
            FieldType::Short => "short",
            FieldType::Byte => "byte",
            FieldType::Double => "double",
            FieldType::Float => "float",
            FieldType::HalfFloat => "half_float",
            FieldType::ScaledFloat => "scaled_float",
            FieldType::Boolean => "boolean",
            FieldType::Ip => "ip",
            FieldType::Other(name) => name,
        }
    }
}

impl From<std::string::String> for FieldType {
    fn from(name: std::string::String) -> Self {
        match name.as_str() {
            "text" => FieldType::Text,
            "keyword" => FieldType::Keyword,
            "string" => FieldType::String,
            "nested" => FieldType::Nested,
            "object" => FieldType::Object,
            "date" => FieldType::Date,
            "long" => FieldType::Long,
            "integer" => FieldType::Integer,
            "short" => FieldType::Short,
            "byte" => FieldType::Byte,
            "double" => FieldType::Double,
            "float" => FieldType::Float,
            "half_float" => FieldType::HalfFloat,
            "scaled_float" => FieldType::ScaledFloat,
            "boolean" => FieldType::Boolean,
            "ip" => FieldType::Ip,
            _ => FieldType::Other(name),
        }
    }
}

impl From<FieldType> for std::string::String {
    fn from(field_type: FieldType) -> Self {
        field_type.as_str().to_string()
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Declaration of a single mapped field.
///
/// Object fields may omit `type` and only declare `properties`. Attributes the
/// connector does not interpret (`format`, `index`, ...) are kept in `extra`
/// and written back unchanged.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub field_type: Option<FieldType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, FieldSpec>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FieldSpec {
    /// A leaf field of the given type.
    pub fn of(field_type: FieldType) -> Self {
        Self {
            field_type: Some(field_type),
            ..Default::default()
        }
    }

    /// An untyped object field.
    pub fn object(properties: BTreeMap<String, FieldSpec>) -> Self {
        Self {
            properties: Some(properties),
            ..Default::default()
        }
    }

    /// A `nested` field.
    pub fn nested(properties: BTreeMap<String, FieldSpec>) -> Self {
        Self {
            field_type: Some(FieldType::Nested),
            properties: Some(properties),
            ..Default::default()
        }
    }

    /// Adds an uninterpreted attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Declarative schema for one metric type, loaded once from a fixture file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingDescriptor {
    #[serde(rename = "type")]
    pub metric_type: String,
    pub properties: BTreeMap<String, FieldSpec>,
}

impl MappingDescriptor {
    pub fn new(metric_type: impl Into<String>, properties: BTreeMap<String, FieldSpec>) -> Self {
        Self {
            metric_type: metric_type.into(),
            properties,
        }
    }

    /// Top-level field names forwarded from raw events of this type.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }
}

/// Errors raised while reading a saved object template.
#[derive(Debug, Error)]
pub enum SavedObjectError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("missing payload for saved object kind '{0}'")]
    MissingPayload(String),
}

/// A Kibana saved object (index-pattern, visualization, dashboard).
///
/// Templates are written in the generic single-document-kind shape:
/// `{ "id": "<kind>:<name>", "body": { "type": kind, kind: attributes } }`.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedObject {
    /// Identifier including the `<kind>:` prefix.
    pub id: String,
    /// Saved object kind (e.g. "visualization").
    pub kind: String,
    /// Kind-specific payload.
    pub attributes: Value,
}

impl SavedObject {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, attributes: Value) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            attributes,
        }
    }

    /// Parses a template in the generic shape.
    pub fn from_generic(value: &Value) -> Result<Self, SavedObjectError> {
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .ok_or(SavedObjectError::MissingField("id"))?;
        let body = value
            .get("body")
            .and_then(Value::as_object)
            .ok_or(SavedObjectError::MissingField("body"))?;
        let kind = body
            .get("type")
            .and_then(Value::as_str)
            .ok_or(SavedObjectError::MissingField("body.type"))?;
        let attributes = body
            .get(kind)
            .cloned()
            .ok_or_else(|| SavedObjectError::MissingPayload(kind.to_string()))?;

        Ok(Self::new(id, kind, attributes))
    }

    /// Body in the generic shape: the payload wrapped under its kind.
    pub fn generic_body(&self) -> Value {
        let mut body = Map::with_capacity(2);
        body.insert("type".to_string(), Value::String(self.kind.clone()));
        body.insert(self.kind.clone(), self.attributes.clone());
        Value::Object(body)
    }

    /// Identifier with the `<kind>:` prefix removed.
    pub fn unprefixed_id(&self) -> &str {
        self.id
            .strip_prefix(self.kind.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
            .unwrap_or(&self.id)
    }
}

/// Major version of the target datastore, fixed once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DatastoreVersion(u32);

impl DatastoreVersion {
    /// Epoch assumed when the datastore could not be queried.
    pub const DEFAULT: Self = Self(6);

    pub const fn new(major: u32) -> Self {
        Self(major)
    }

    pub fn major(self) -> u32 {
        self.0
    }

    /// Parses the major component of a dotted version string ("6.8.2").
    pub fn parse(number: &str) -> Option<Self> {
        number
            .trim()
            .split('.')
            .next()
            .and_then(|major| major.parse().ok())
            .map(Self)
    }

    /// `text`/`keyword` must be expressed as `string`.
    pub fn uses_string_fields(self) -> bool {
        self.0 <= 2
    }

    /// Every document carries its own storage-level type discriminator.
    pub fn uses_per_document_types(self) -> bool {
        self.0 <= 5
    }

    /// Mapping types are gone entirely.
    pub fn is_typeless(self) -> bool {
        self.0 >= 7
    }

    /// Storage-level document type for a document of the given kind.
    pub fn document_type(self, kind: &str) -> Option<String> {
        if self.uses_per_document_types() {
            Some(kind.to_string())
        } else if self.is_typeless() {
            None
        } else {
            Some(GENERIC_DOC_TYPE.to_string())
        }
    }
}

impl Default for DatastoreVersion {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for DatastoreVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.x", self.0)
    }
}

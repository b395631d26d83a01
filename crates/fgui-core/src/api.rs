use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// ── Records ─────────────────────────────────────────────────────────────────

/// A remote document: arbitrary key/value pairs keyed by field name.
pub type Record = Map<String, Value>;

/// Field holding the remote identifier of a record.
pub const ID_FIELD: &str = "_id";

/// Extract the identifier of a record as a string.
///
/// Numeric identifiers are accepted and rendered in decimal form so that
/// `{"_id": 7}` and `{"_id": "7"}` address the same cache slot.
pub fn record_id(record: &Record) -> Option<String> {
    match record.get(ID_FIELD)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Change notification names a collection emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordEvent {
    Created,
    Updated,
    Patched,
    Removed,
}

impl RecordEvent {
    pub const ALL: [RecordEvent; 4] = [
        RecordEvent::Created,
        RecordEvent::Updated,
        RecordEvent::Patched,
        RecordEvent::Removed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RecordEvent::Created => "created",
            RecordEvent::Updated => "updated",
            RecordEvent::Patched => "patched",
            RecordEvent::Removed => "removed",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        RecordEvent::ALL.into_iter().find(|e| e.as_str() == name)
    }
}

impl fmt::Display for RecordEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalize the three shapes a `find` call may answer with into a list.
///
/// - paginated: `{"total": n, "data": [...]}`
/// - bare array: `[...]`
/// - single record: `{...}`
pub fn unpack_find_response(response: Value) -> Vec<Record> {
    match response {
        Value::Array(items) => items.into_iter().filter_map(into_record).collect(),
        Value::Object(mut obj) => match obj.remove("data") {
            Some(Value::Array(items)) => items.into_iter().filter_map(into_record).collect(),
            Some(other) => {
                // `data` was an ordinary field, not a page wrapper
                obj.insert("data".to_string(), other);
                vec![obj]
            }
            None => vec![obj],
        },
        Value::Null => Vec::new(),
        other => {
            log::warn!("Ignoring non-record find response: {}", other);
            Vec::new()
        }
    }
}

fn into_record(value: Value) -> Option<Record> {
    match value {
        Value::Object(obj) => Some(obj),
        other => {
            log::warn!("Ignoring non-record item in find response: {}", other);
            None
        }
    }
}

// ── Field metadata ──────────────────────────────────────────────────────────

/// Display type of a collection field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    String,
    Number,
    Boolean,
    Date,
    Array,
    Object,
    Relation,
}

impl FieldType {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Array => "array",
            FieldType::Object => "object",
            FieldType::Relation => "relation",
        }
    }

    /// Unknown type names fall back to `String`.
    pub fn parse(name: &str) -> Self {
        match name {
            "number" => FieldType::Number,
            "boolean" => FieldType::Boolean,
            "date" => FieldType::Date,
            "array" => FieldType::Array,
            "object" => FieldType::Object,
            "relation" => FieldType::Relation,
            _ => FieldType::String,
        }
    }

    /// Value used to scaffold a new record. Dates default to "now" in
    /// milliseconds since the epoch.
    pub fn default_value(self) -> Value {
        match self {
            FieldType::Number => Value::from(0),
            FieldType::Array => Value::Array(Vec::new()),
            FieldType::Boolean => Value::Bool(false),
            FieldType::Object => Value::Object(Map::new()),
            FieldType::Date => {
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as u64;
                Value::from(now)
            }
            FieldType::Relation | FieldType::String => Value::String(String::new()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub property: String,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
}

impl FieldSpec {
    pub fn new(property: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            property: property.into(),
            field_type,
        }
    }
}

/// Pack a field list into a `{property: type}` lookup.
pub fn pack_fields(fields: &[FieldSpec]) -> Map<String, Value> {
    fields
        .iter()
        .map(|f| (f.property.clone(), Value::String(f.field_type.as_str().to_string())))
        .collect()
}

/// Inverse of [`pack_fields`]. Non-string type values fall back to `string`.
pub fn unpack_fields(packed: &Map<String, Value>) -> Vec<FieldSpec> {
    packed
        .iter()
        .map(|(property, ty)| {
            let field_type = ty.as_str().map(FieldType::parse).unwrap_or_default();
            FieldSpec::new(property.clone(), field_type)
        })
        .collect()
}

// ── Configuration records ───────────────────────────────────────────────────

/// Authentication strategy plus its credential fields, passed through
/// unmodified to the server's authentication service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub strategy: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Credentials {
    pub fn to_record(&self) -> Record {
        let mut record = self.payload.clone();
        record.insert("strategy".to_string(), Value::String(self.strategy.clone()));
        record
    }
}

/// Configuration for a single backend server.
/// Persisted as part of the `servers` list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Stable UUID, never changes after creation
    pub id: String,
    /// Socket endpoint, e.g. `ws://localhost:3030`
    pub url: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub authentication: Option<Credentials>,
}

/// The mutable part of a [`ServerConfig`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerProps {
    pub url: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub authentication: Option<Credentials>,
}

impl ServerConfig {
    pub fn new(props: ServerProps) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: props.url,
            is_active: props.is_active,
            authentication: props.authentication,
        }
    }
}

/// Configuration for one collection hosted by a server.
/// Persisted as part of the `services` list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionConfig {
    pub id: String,
    /// Back-reference to the owning [`ServerConfig::id`]
    pub server_id: String,
    pub path: String,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

impl CollectionConfig {
    /// New collections start with only the identifier field described.
    pub fn new(server_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            server_id: server_id.into(),
            path: path.into(),
            fields: vec![FieldSpec::new(ID_FIELD, FieldType::String)],
        }
    }
}

// ── Errors ──────────────────────────────────────────────────────────────────

/// Structured error returned by a remote call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{name} ({code}): {message}")]
pub struct ServiceError {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub code: i64,
}

impl ServiceError {
    pub fn new(name: impl Into<String>, message: impl Into<String>, code: i64) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            code,
        }
    }
}

//! Typed records over the replica's generic field maps.
//!
//! Replicated storage stays loosely-typed key/value; this module is the
//! schema-validated accessor layer at the API boundary. Parsing is
//! lenient about absent optional fields and strict about type
//! mismatches, so one malformed record from a peer never poisons the
//! rest of a collection.

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};
use uuid::Uuid;

use crate::replica::Collection;

// Field names shared with every other client implementation.
pub const F_LABEL: &str = "label";
pub const F_KIND: &str = "kind";
pub const F_X: &str = "x";
pub const F_Y: &str = "y";
pub const F_PINNED: &str = "pinned";
pub const F_PROPS: &str = "props";
pub const F_SOURCE: &str = "source";
pub const F_TARGET: &str = "target";
pub const F_ANCHOR: &str = "anchor";
pub const F_AUTHOR: &str = "author";
pub const F_BODY: &str = "body";
pub const F_CREATED_AT: &str = "createdAt";
pub const F_NAME: &str = "name";
pub const F_MIME: &str = "mime";
pub const F_SIZE: &str = "size";
pub const F_DIGEST: &str = "digest";

/// Schema violations found while parsing a record.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaError {
    /// A required field is absent.
    MissingField { field: &'static str },
    /// A field is present with the wrong type.
    TypeMismatch {
        field: &'static str,
        expected: &'static str,
    },
    /// A field that should hold an entity id does not parse as one.
    InvalidId { field: &'static str },
}

impl std::fmt::Display for SchemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaError::MissingField { field } => write!(f, "Missing field: {field}"),
            SchemaError::TypeMismatch { field, expected } => {
                write!(f, "Field {field} is not a {expected}")
            }
            SchemaError::InvalidId { field } => write!(f, "Field {field} is not a valid id"),
        }
    }
}

impl std::error::Error for SchemaError {}

/// A record type stored in one of the board's entity collections.
pub trait BoardRecord: Sized + Send + Sync + 'static {
    /// The collection this record lives in.
    const COLLECTION: Collection;

    /// Parse from a replicated field map.
    fn from_fields(id: Uuid, fields: &JsonMap<String, Value>) -> Result<Self, SchemaError>;

    /// Encode back into a replicated field map.
    fn to_fields(&self) -> JsonMap<String, Value>;

    /// The record's stable identifier.
    fn id(&self) -> Uuid;
}

/// A node on the board: person, organization, event, location, note…
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: Uuid,
    pub label: String,
    /// Free-form element kind, e.g. `"person"` or `"event"`.
    pub kind: String,
    pub x: f64,
    pub y: f64,
    pub pinned: bool,
    /// Everything the schema does not name explicitly.
    pub props: JsonMap<String, Value>,
}

impl Element {
    pub fn new(label: impl Into<String>, kind: impl Into<String>, x: f64, y: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            kind: kind.into(),
            x,
            y,
            pinned: false,
            props: JsonMap::new(),
        }
    }
}

impl BoardRecord for Element {
    const COLLECTION: Collection = Collection::Elements;

    fn from_fields(id: Uuid, fields: &JsonMap<String, Value>) -> Result<Self, SchemaError> {
        Ok(Self {
            id,
            label: opt_string(fields, F_LABEL)?.unwrap_or_default(),
            kind: opt_string(fields, F_KIND)?.unwrap_or_else(|| "entity".to_string()),
            x: opt_f64(fields, F_X)?.unwrap_or(0.0),
            y: opt_f64(fields, F_Y)?.unwrap_or(0.0),
            pinned: opt_bool(fields, F_PINNED)?.unwrap_or(false),
            props: opt_object(fields, F_PROPS)?.unwrap_or_default(),
        })
    }

    fn to_fields(&self) -> JsonMap<String, Value> {
        let mut fields = JsonMap::new();
        fields.insert(F_LABEL.into(), Value::String(self.label.clone()));
        fields.insert(F_KIND.into(), Value::String(self.kind.clone()));
        fields.insert(F_X.into(), json_f64(self.x));
        fields.insert(F_Y.into(), json_f64(self.y));
        fields.insert(F_PINNED.into(), Value::Bool(self.pinned));
        if !self.props.is_empty() {
            fields.insert(F_PROPS.into(), Value::Object(self.props.clone()));
        }
        fields
    }

    fn id(&self) -> Uuid {
        self.id
    }
}

/// A directed relation between two elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub id: Uuid,
    pub source: Uuid,
    pub target: Uuid,
    pub label: String,
    pub kind: String,
    pub props: JsonMap<String, Value>,
}

impl Link {
    pub fn new(source: Uuid, target: Uuid, label: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            target,
            label: label.into(),
            kind: "relation".to_string(),
            props: JsonMap::new(),
        }
    }

    /// Whether this link touches the given element.
    pub fn is_incident_to(&self, element_id: Uuid) -> bool {
        self.source == element_id || self.target == element_id
    }
}

impl BoardRecord for Link {
    const COLLECTION: Collection = Collection::Links;

    fn from_fields(id: Uuid, fields: &JsonMap<String, Value>) -> Result<Self, SchemaError> {
        Ok(Self {
            id,
            source: req_uuid(fields, F_SOURCE)?,
            target: req_uuid(fields, F_TARGET)?,
            label: opt_string(fields, F_LABEL)?.unwrap_or_default(),
            kind: opt_string(fields, F_KIND)?.unwrap_or_else(|| "relation".to_string()),
            props: opt_object(fields, F_PROPS)?.unwrap_or_default(),
        })
    }

    fn to_fields(&self) -> JsonMap<String, Value> {
        let mut fields = JsonMap::new();
        fields.insert(F_SOURCE.into(), Value::String(self.source.to_string()));
        fields.insert(F_TARGET.into(), Value::String(self.target.to_string()));
        fields.insert(F_LABEL.into(), Value::String(self.label.clone()));
        fields.insert(F_KIND.into(), Value::String(self.kind.clone()));
        if !self.props.is_empty() {
            fields.insert(F_PROPS.into(), Value::Object(self.props.clone()));
        }
        fields
    }

    fn id(&self) -> Uuid {
        self.id
    }
}

/// An annotation, optionally anchored to an element or link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub anchor: Option<Uuid>,
    pub author: String,
    pub body: String,
    /// Seconds since the Unix epoch, as reported by the writer.
    pub created_at: u64,
}

impl Comment {
    pub fn new(author: impl Into<String>, body: impl Into<String>, anchor: Option<Uuid>) -> Self {
        let created_at = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            id: Uuid::new_v4(),
            anchor,
            author: author.into(),
            body: body.into(),
            created_at,
        }
    }
}

impl BoardRecord for Comment {
    const COLLECTION: Collection = Collection::Comments;

    fn from_fields(id: Uuid, fields: &JsonMap<String, Value>) -> Result<Self, SchemaError> {
        Ok(Self {
            id,
            anchor: opt_uuid(fields, F_ANCHOR)?,
            author: opt_string(fields, F_AUTHOR)?.unwrap_or_default(),
            body: opt_string(fields, F_BODY)?.unwrap_or_default(),
            created_at: opt_u64(fields, F_CREATED_AT)?.unwrap_or(0),
        })
    }

    fn to_fields(&self) -> JsonMap<String, Value> {
        let mut fields = JsonMap::new();
        if let Some(anchor) = self.anchor {
            fields.insert(F_ANCHOR.into(), Value::String(anchor.to_string()));
        }
        fields.insert(F_AUTHOR.into(), Value::String(self.author.clone()));
        fields.insert(F_BODY.into(), Value::String(self.body.clone()));
        fields.insert(F_CREATED_AT.into(), Value::Number(self.created_at.into()));
        fields
    }

    fn id(&self) -> Uuid {
        self.id
    }
}

/// An attached artifact: document scan, photo, export…
///
/// Only descriptive metadata replicates; the payload itself moves through
/// a side channel keyed by `digest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: Uuid,
    pub name: String,
    pub mime: String,
    pub size: u64,
    pub digest: String,
    pub anchor: Option<Uuid>,
}

impl BoardRecord for Asset {
    const COLLECTION: Collection = Collection::Assets;

    fn from_fields(id: Uuid, fields: &JsonMap<String, Value>) -> Result<Self, SchemaError> {
        Ok(Self {
            id,
            name: opt_string(fields, F_NAME)?.unwrap_or_default(),
            mime: opt_string(fields, F_MIME)?
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            size: opt_u64(fields, F_SIZE)?.unwrap_or(0),
            digest: opt_string(fields, F_DIGEST)?.unwrap_or_default(),
            anchor: opt_uuid(fields, F_ANCHOR)?,
        })
    }

    fn to_fields(&self) -> JsonMap<String, Value> {
        let mut fields = JsonMap::new();
        fields.insert(F_NAME.into(), Value::String(self.name.clone()));
        fields.insert(F_MIME.into(), Value::String(self.mime.clone()));
        fields.insert(F_SIZE.into(), Value::Number(self.size.into()));
        fields.insert(F_DIGEST.into(), Value::String(self.digest.clone()));
        if let Some(anchor) = self.anchor {
            fields.insert(F_ANCHOR.into(), Value::String(anchor.to_string()));
        }
        fields
    }

    fn id(&self) -> Uuid {
        self.id
    }
}

// ─── Field accessors ──────────────────────────────────────────────────

fn opt_string(
    fields: &JsonMap<String, Value>,
    field: &'static str,
) -> Result<Option<String>, SchemaError> {
    match fields.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(SchemaError::TypeMismatch {
            field,
            expected: "string",
        }),
    }
}

fn opt_f64(
    fields: &JsonMap<String, Value>,
    field: &'static str,
) -> Result<Option<f64>, SchemaError> {
    match fields.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(_) => Err(SchemaError::TypeMismatch {
            field,
            expected: "number",
        }),
    }
}

fn opt_u64(
    fields: &JsonMap<String, Value>,
    field: &'static str,
) -> Result<Option<u64>, SchemaError> {
    match fields.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().map(|f| f.max(0.0) as u64))
            .map(Some)
            .ok_or(SchemaError::TypeMismatch {
                field,
                expected: "unsigned integer",
            }),
        Some(_) => Err(SchemaError::TypeMismatch {
            field,
            expected: "unsigned integer",
        }),
    }
}

fn opt_bool(
    fields: &JsonMap<String, Value>,
    field: &'static str,
) -> Result<Option<bool>, SchemaError> {
    match fields.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(SchemaError::TypeMismatch {
            field,
            expected: "bool",
        }),
    }
}

fn opt_object(
    fields: &JsonMap<String, Value>,
    field: &'static str,
) -> Result<Option<JsonMap<String, Value>>, SchemaError> {
    match fields.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map.clone())),
        Some(_) => Err(SchemaError::TypeMismatch {
            field,
            expected: "object",
        }),
    }
}

fn opt_uuid(
    fields: &JsonMap<String, Value>,
    field: &'static str,
) -> Result<Option<Uuid>, SchemaError> {
    match opt_string(fields, field)? {
        None => Ok(None),
        Some(s) => Uuid::parse_str(&s)
            .map(Some)
            .map_err(|_| SchemaError::InvalidId { field }),
    }
}

fn req_uuid(fields: &JsonMap<String, Value>, field: &'static str) -> Result<Uuid, SchemaError> {
    opt_uuid(fields, field)?.ok_or(SchemaError::MissingField { field })
}

fn json_f64(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_element_roundtrip() {
        let mut element = Element::new("A. Koch", "person", 120.0, -40.5);
        element.pinned = true;
        element
            .props
            .insert("alias".into(), json!("the accountant"));

        let fields = element.to_fields();
        let parsed = Element::from_fields(element.id, &fields).unwrap();
        assert_eq!(parsed, element);
    }

    #[test]
    fn test_element_defaults_for_absent_fields() {
        let parsed = Element::from_fields(Uuid::new_v4(), &JsonMap::new()).unwrap();
        assert_eq!(parsed.label, "");
        assert_eq!(parsed.kind, "entity");
        assert_eq!(parsed.x, 0.0);
        assert!(!parsed.pinned);
        assert!(parsed.props.is_empty());
    }

    #[test]
    fn test_element_type_mismatch() {
        let mut fields = JsonMap::new();
        fields.insert(F_X.into(), json!("not a number"));
        let err = Element::from_fields(Uuid::new_v4(), &fields).unwrap_err();
        assert_eq!(
            err,
            SchemaError::TypeMismatch {
                field: F_X,
                expected: "number"
            }
        );
    }

    #[test]
    fn test_link_requires_endpoints() {
        let err = Link::from_fields(Uuid::new_v4(), &JsonMap::new()).unwrap_err();
        assert_eq!(err, SchemaError::MissingField { field: F_SOURCE });

        let mut fields = JsonMap::new();
        fields.insert(F_SOURCE.into(), json!("not-a-uuid"));
        let err = Link::from_fields(Uuid::new_v4(), &fields).unwrap_err();
        assert_eq!(err, SchemaError::InvalidId { field: F_SOURCE });
    }

    #[test]
    fn test_link_roundtrip_and_incidence() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let link = Link::new(a, b, "transferred funds to");

        let parsed = Link::from_fields(link.id, &link.to_fields()).unwrap();
        assert_eq!(parsed, link);
        assert!(parsed.is_incident_to(a));
        assert!(parsed.is_incident_to(b));
        assert!(!parsed.is_incident_to(Uuid::new_v4()));
    }

    #[test]
    fn test_comment_roundtrip() {
        let anchor = Uuid::new_v4();
        let comment = Comment::new("dana", "check the second ledger", Some(anchor));
        let parsed = Comment::from_fields(comment.id, &comment.to_fields()).unwrap();
        assert_eq!(parsed, comment);
    }

    #[test]
    fn test_asset_roundtrip() {
        let asset = Asset {
            id: Uuid::new_v4(),
            name: "ledger-p12.png".into(),
            mime: "image/png".into(),
            size: 48_213,
            digest: "b3:9f2a…".into(),
            anchor: None,
        };
        let parsed = Asset::from_fields(asset.id, &asset.to_fields()).unwrap();
        assert_eq!(parsed, asset);
    }
}

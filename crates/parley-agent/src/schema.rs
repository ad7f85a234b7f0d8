//! Schema contracts and schema instances.
//!
//! A [`SchemaContract`] names the shape a payload must have: a set of fields,
//! each with a type and a required flag.  Contracts are compiled once into a
//! JSON Schema validator; validation reports exactly which required fields are
//! missing or malformed.  Unknown fields are ignored, and optional fields are
//! never a reason to reject a candidate.
//!
//! A [`Payload`] is one instance of a contract: a JSON object.

use std::fmt;
use std::sync::Arc;

use jsonschema::error::ValidationErrorKind;
use jsonschema::{Draft, JSONSchema};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{AgentError, Result};

/// The field every built-in contract carries.
pub const CHAT_MESSAGE: &str = "chat_message";

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// One schema instance: the JSON object carried by a turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Map<String, Value>);

impl Payload {
    /// An empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// A payload holding only `chat_message`.
    pub fn chat(text: impl Into<String>) -> Self {
        Self::new().with_field(CHAT_MESSAGE, Value::String(text.into()))
    }

    /// Builder-style field insertion.
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    /// Insert or replace a field.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.0.insert(name.into(), value);
    }

    /// Look up a field.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// The `chat_message` text, if present and a string.
    pub fn chat_message(&self) -> Option<&str> {
        self.0.get(CHAT_MESSAGE).and_then(Value::as_str)
    }

    /// Iterate over all fields in insertion-independent (sorted) order.
    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns `true` if at least one field carries a non-empty value.
    pub fn has_content(&self) -> bool {
        self.0.values().any(is_revealed)
    }

    /// Build a payload from a JSON value; only objects qualify.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// The payload as a JSON object value.
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Render the payload as message content for a model request.
    ///
    /// A payload that carries nothing but `chat_message` is sent as plain
    /// text; anything richer is sent as compact JSON.
    pub fn to_message_content(&self) -> String {
        match (self.0.len(), self.chat_message()) {
            (1, Some(text)) => text.to_owned(),
            _ => self.to_value().to_string(),
        }
    }
}

impl From<Map<String, Value>> for Payload {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Returns `true` when a value counts as revealed content: not null and not
/// an empty string, array, or object.
pub fn is_revealed(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Field types
// ---------------------------------------------------------------------------

/// The type of one contract field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    /// A homogeneous list.
    Array(Box<FieldType>),
    /// Any JSON object.
    Object,
}

impl FieldType {
    /// JSON Schema fragment for this type.
    fn json_schema(&self) -> Value {
        match self {
            Self::Array(items) => json!({ "type": "array", "items": items.json_schema() }),
            other => json!({ "type": other.json_type() }),
        }
    }

    fn json_type(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array(_) => "array",
            Self::Object => "object",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Array(items) => write!(f, "array of {items}"),
            other => f.write_str(other.json_type()),
        }
    }
}

/// One field of a contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// Violations
// ---------------------------------------------------------------------------

/// Why one field failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationKind {
    /// A required field is absent.
    Missing,
    /// A required field is present with the wrong shape.
    Malformed { expected: String, found: String },
    /// The reply could not be decoded into an object at all.
    Unparseable { reason: String },
}

/// One validation failure, keyed by field name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    pub field: String,
    pub kind: ViolationKind,
}

impl FieldViolation {
    /// A violation describing an undecodable reply.
    pub fn unparseable(reason: impl Into<String>) -> Self {
        Self {
            field: "$reply".to_owned(),
            kind: ViolationKind::Unparseable {
                reason: reason.into(),
            },
        }
    }
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ViolationKind::Missing => write!(f, "missing required field `{}`", self.field),
            ViolationKind::Malformed { expected, found } => write!(
                f,
                "field `{}` must be {expected} but was {found}",
                self.field
            ),
            ViolationKind::Unparseable { reason } => write!(f, "reply is not a JSON object ({reason})"),
        }
    }
}

/// Join violations into one human-readable sentence.
pub fn describe_violations(violations: &[FieldViolation]) -> String {
    if violations.is_empty() {
        return "no details".to_owned();
    }
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// A named structural type that payloads are validated against.
///
/// Cheap to clone; the compiled validator is shared.
#[derive(Clone)]
pub struct SchemaContract {
    inner: Arc<ContractInner>,
}

struct ContractInner {
    name: String,
    description: String,
    fields: Vec<FieldSpec>,
    /// Full JSON Schema, optional fields included.  Sent to models.
    json_schema: Value,
    /// Compiled from the required fields only.
    validator: JSONSchema,
}

impl fmt::Debug for SchemaContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaContract")
            .field("name", &self.inner.name)
            .field("fields", &self.inner.fields)
            .finish()
    }
}

impl SchemaContract {
    /// Start building a contract.
    pub fn builder(name: impl Into<String>) -> ContractBuilder {
        ContractBuilder {
            name: name.into(),
            description: String::new(),
            fields: Vec::new(),
        }
    }

    /// `InputSchema{chat_message: string}`: what users and system turns carry.
    pub fn input() -> Self {
        Self::builder("InputSchema")
            .description("A chat message sent to the assistant.")
            .required(CHAT_MESSAGE, FieldType::String, "The chat message sent to the assistant.")
            .build()
            .expect("built-in input contract compiles")
    }

    /// `OutputSchema{chat_message: string}`: what assistant turns carry.
    pub fn output() -> Self {
        Self::builder("OutputSchema")
            .description("The assistant's reply.")
            .required(
                CHAT_MESSAGE,
                FieldType::String,
                "The chat message exchanged between the user and the assistant.",
            )
            .build()
            .expect("built-in output contract compiles")
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn description(&self) -> &str {
        &self.inner.description
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.inner.fields
    }

    /// The full JSON Schema for this contract, suitable for model instructions
    /// and tool definitions.
    pub fn json_schema(&self) -> &Value {
        &self.inner.json_schema
    }

    /// Validate a candidate value.
    ///
    /// Returns every violated required field, sorted by field name so the
    /// verdict for a given candidate is always identical.
    pub fn validate(&self, candidate: &Value) -> std::result::Result<(), Vec<FieldViolation>> {
        if !candidate.is_object() {
            return Err(vec![FieldViolation {
                field: "$root".to_owned(),
                kind: ViolationKind::Malformed {
                    expected: "object".to_owned(),
                    found: json_type_name(candidate).to_owned(),
                },
            }]);
        }

        let Err(errors) = self.inner.validator.validate(candidate) else {
            return Ok(());
        };

        let mut violations: Vec<FieldViolation> = errors
            .map(|error| match &error.kind {
                ValidationErrorKind::Required { property } => FieldViolation {
                    field: property
                        .as_str()
                        .map(str::to_owned)
                        .unwrap_or_else(|| property.to_string()),
                    kind: ViolationKind::Missing,
                },
                _ => {
                    let field = top_level_field(&error.instance_path.to_string());
                    let expected = self
                        .field(&field)
                        .map(|spec| spec.field_type.to_string())
                        .unwrap_or_else(|| "a valid value".to_owned());
                    let found = candidate
                        .get(&field)
                        .map(json_type_name)
                        .unwrap_or("nothing")
                        .to_owned();
                    FieldViolation {
                        field,
                        kind: ViolationKind::Malformed { expected, found },
                    }
                }
            })
            .collect();

        violations.sort_by(|a, b| a.field.cmp(&b.field));
        violations.dedup_by(|a, b| a.field == b.field);
        Err(violations)
    }

    /// Validate a payload.
    pub fn validate_payload(&self, payload: &Payload) -> std::result::Result<(), Vec<FieldViolation>> {
        self.validate(&payload.to_value())
    }

    fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.inner.fields.iter().find(|f| f.name == name)
    }
}

/// Builder for [`SchemaContract`].
#[derive(Debug)]
pub struct ContractBuilder {
    name: String,
    description: String,
    fields: Vec<FieldSpec>,
}

impl ContractBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add a required field.
    pub fn required(
        self,
        name: impl Into<String>,
        field_type: FieldType,
        description: impl Into<String>,
    ) -> Self {
        self.field(name.into(), field_type, true, description.into())
    }

    /// Add an optional field.
    pub fn optional(
        self,
        name: impl Into<String>,
        field_type: FieldType,
        description: impl Into<String>,
    ) -> Self {
        self.field(name.into(), field_type, false, description.into())
    }

    fn field(mut self, name: String, field_type: FieldType, required: bool, description: String) -> Self {
        self.fields.retain(|f| f.name != name);
        self.fields.push(FieldSpec {
            name,
            field_type,
            required,
            description: (!description.is_empty()).then_some(description),
        });
        self
    }

    /// Compile the contract.
    pub fn build(self) -> Result<SchemaContract> {
        let json_schema = object_schema(&self.name, &self.description, self.fields.iter());
        let required_schema = object_schema(
            &self.name,
            &self.description,
            self.fields.iter().filter(|f| f.required),
        );

        let validator = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&required_schema)
            .map_err(|e| AgentError::ConfigError {
                reason: format!("failed to compile contract `{}`: {e}", self.name),
            })?;

        Ok(SchemaContract {
            inner: Arc::new(ContractInner {
                name: self.name,
                description: self.description,
                fields: self.fields,
                json_schema,
                validator,
            }),
        })
    }
}

fn object_schema<'a>(
    title: &str,
    description: &str,
    fields: impl Iterator<Item = &'a FieldSpec>,
) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();

    for spec in fields {
        let mut property = spec.field_type.json_schema();
        if let Some(description) = &spec.description {
            property["description"] = json!(description);
        }
        properties.insert(spec.name.clone(), property);
        if spec.required {
            required.push(Value::String(spec.name.clone()));
        }
    }

    let mut schema = json!({
        "title": title,
        "type": "object",
        "properties": properties,
        "required": required,
    });
    if !description.is_empty() {
        schema["description"] = json!(description);
    }
    schema
}

/// First segment of a JSON pointer such as `/tags/0`, unescaped.
fn top_level_field(pointer: &str) -> String {
    pointer
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or_default()
        .replace("~1", "/")
        .replace("~0", "~")
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

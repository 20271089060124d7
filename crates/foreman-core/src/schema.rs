//! Explicit JSON-schema builder for structured model replies. Field types are
//! a closed set; anything else is rejected when a schema is assembled from
//! template data.

use serde_json::{json, Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("unknown field type {ty:?} for {field}")]
    UnknownType { field: String, ty: String },

    #[error("schema description must be an object or a full JSON schema, got: {0}")]
    Malformed(String),
}

/// Builds `{"type": "object", "properties": …, "required": …}` schemas with a
/// closed set of field constructors.
#[derive(Clone, Debug, Default)]
pub struct SchemaBuilder {
    properties: Map<String, Value>,
    required: Vec<String>,
}

impl SchemaBuilder {
    pub fn object() -> Self {
        Self::default()
    }

    fn field(mut self, name: &str, schema: Value) -> Self {
        self.properties.insert(name.to_owned(), schema);
        self.required.push(name.to_owned());
        self
    }

    pub fn string(self, name: &str) -> Self {
        self.field(name, json!({"type": "string"}))
    }

    pub fn boolean(self, name: &str) -> Self {
        self.field(name, json!({"type": "boolean"}))
    }

    pub fn integer(self, name: &str) -> Self {
        self.field(name, json!({"type": "integer"}))
    }

    pub fn number(self, name: &str) -> Self {
        self.field(name, json!({"type": "number"}))
    }

    pub fn string_array(self, name: &str) -> Self {
        self.field(name, json!({"type": "array", "items": {"type": "string"}}))
    }

    pub fn build(self) -> Value {
        json!({
            "type": "object",
            "properties": Value::Object(self.properties),
            "required": self.required,
            "additionalProperties": false,
        })
    }

    /// Assemble a schema from template data: either a full JSON schema (an
    /// object with a `"type"` key, passed through) or a shorthand map of
    /// `field → type-name`.
    pub fn from_value(description: &Value) -> Result<Value, SchemaError> {
        let obj = description
            .as_object()
            .ok_or_else(|| SchemaError::Malformed(description.to_string()))?;

        if obj.contains_key("type") {
            return Ok(description.clone());
        }

        let mut builder = Self::object();
        for (field, ty) in obj {
            let ty_name = ty
                .as_str()
                .ok_or_else(|| SchemaError::Malformed(description.to_string()))?;
            builder = match ty_name {
                "string" => builder.string(field),
                "boolean" => builder.boolean(field),
                "integer" => builder.integer(field),
                "number" => builder.number(field),
                "string_array" => builder.string_array(field),
                other => {
                    return Err(SchemaError::UnknownType {
                        field: field.clone(),
                        ty: other.to_owned(),
                    })
                }
            };
        }
        Ok(builder.build())
    }
}

//! Structural schema descriptors
//!
//! A descriptor is a root object with named properties plus a flat map of
//! named sub-descriptors (`definitions`) that `ObjectRef`/`ArrayRef`
//! properties point at. Descriptors are plain data: build them with
//! [`SchemaDescriptor::builder`] or deserialize them from JSON.
//!
//! ```
//! use schema_ingest::{PropertyKind, SchemaDescriptor};
//!
//! let user = SchemaDescriptor::builder("User")
//!     .required("id", PropertyKind::string())
//!     .optional("address", PropertyKind::object("Address"))
//!     .define("Address", |a| a.required("city", PropertyKind::string()))
//!     .build()
//!     .unwrap();
//! assert!(user.definition("Address").is_some());
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{IngestError, Result};

/// Scalar kinds a property or array item can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveKind {
    String,
    Number,
    Boolean,
}

impl PrimitiveKind {
    /// JSON Schema type keyword
    pub fn json_type(&self) -> &'static str {
        match self {
            PrimitiveKind::String => "string",
            PrimitiveKind::Number => "number",
            PrimitiveKind::Boolean => "boolean",
        }
    }
}

/// Shape of a single property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PropertyKind {
    Primitive { primitive: PrimitiveKind },
    Array { items: PrimitiveKind },
    ObjectRef { target: String },
    ArrayRef { target: String },
}

impl PropertyKind {
    pub fn string() -> Self {
        PropertyKind::Primitive { primitive: PrimitiveKind::String }
    }

    pub fn number() -> Self {
        PropertyKind::Primitive { primitive: PrimitiveKind::Number }
    }

    pub fn boolean() -> Self {
        PropertyKind::Primitive { primitive: PrimitiveKind::Boolean }
    }

    pub fn array_of(items: PrimitiveKind) -> Self {
        PropertyKind::Array { items }
    }

    pub fn object(target: impl Into<String>) -> Self {
        PropertyKind::ObjectRef { target: target.into() }
    }

    pub fn array_of_objects(target: impl Into<String>) -> Self {
        PropertyKind::ArrayRef { target: target.into() }
    }

    /// Name of the referenced definition, if this is a ref
    pub fn target(&self) -> Option<&str> {
        match self {
            PropertyKind::ObjectRef { target } | PropertyKind::ArrayRef { target } => Some(target),
            _ => None,
        }
    }

    fn to_json_schema(&self, required: bool) -> Value {
        let nullable = |ty: &str| -> Value {
            if required {
                json!(ty)
            } else {
                json!([ty, "null"])
            }
        };
        match self {
            PropertyKind::Primitive { primitive } => json!({ "type": nullable(primitive.json_type()) }),
            PropertyKind::Array { items } => json!({
                "type": nullable("array"),
                "items": { "type": items.json_type() },
            }),
            PropertyKind::ObjectRef { target } => {
                let reference = json!({ "$ref": definition_pointer(target) });
                if required {
                    reference
                } else {
                    json!({ "anyOf": [{ "type": "null" }, reference] })
                }
            }
            PropertyKind::ArrayRef { target } => json!({
                "type": nullable("array"),
                "items": { "$ref": definition_pointer(target) },
            }),
        }
    }
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyKind::Primitive { primitive } => write!(f, "{}", primitive.json_type()),
            PropertyKind::Array { items } => write!(f, "{}[]", items.json_type()),
            PropertyKind::ObjectRef { target } => write!(f, "{}", target),
            PropertyKind::ArrayRef { target } => write!(f, "{}[]", target),
        }
    }
}

fn definition_pointer(target: &str) -> String {
    format!("#/definitions/{}", target)
}

/// A named property with its requiredness
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub kind: PropertyKind,
    #[serde(default)]
    pub required: bool,
}

/// An object shape: the root of a descriptor or one of its definitions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    #[serde(default)]
    pub properties: BTreeMap<String, Property>,
}

impl ObjectDescriptor {
    fn to_json_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .properties
            .iter()
            .map(|(name, prop)| (name.clone(), prop.kind.to_json_schema(prop.required)))
            .collect();
        let required: Vec<&String> = self
            .properties
            .iter()
            .filter(|(_, prop)| prop.required)
            .map(|(name, _)| name)
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// Structural descriptor of a schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub name: String,
    #[serde(flatten)]
    pub root: ObjectDescriptor,
    #[serde(default)]
    pub definitions: BTreeMap<String, ObjectDescriptor>,
}

impl SchemaDescriptor {
    /// Start building a descriptor for a root object named `name`
    pub fn builder(name: impl Into<String>) -> DescriptorBuilder {
        DescriptorBuilder {
            name: name.into(),
            root: ObjectBuilder::default(),
            definitions: BTreeMap::new(),
        }
    }

    pub fn properties(&self) -> &BTreeMap<String, Property> {
        &self.root.properties
    }

    pub fn definition(&self, name: &str) -> Option<&ObjectDescriptor> {
        self.definitions.get(name)
    }

    /// Check names are non-empty and every ref resolves to a definition
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(IngestError::InvalidDescriptor("descriptor name is empty".to_string()));
        }
        let objects = std::iter::once((self.name.as_str(), &self.root))
            .chain(self.definitions.iter().map(|(n, d)| (n.as_str(), d)));
        for (owner, object) in objects {
            for (prop_name, prop) in &object.properties {
                if prop_name.is_empty() {
                    return Err(IngestError::InvalidDescriptor(format!(
                        "'{}' has a property with an empty name",
                        owner
                    )));
                }
                if let Some(target) = prop.kind.target() {
                    if !self.definitions.contains_key(target) {
                        return Err(IngestError::InvalidDescriptor(format!(
                            "{}.{} references undefined definition '{}'",
                            owner, prop_name, target
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Render as a draft-07 JSON Schema document
    pub fn to_json_schema(&self) -> Value {
        let mut schema = self.root.to_json_schema();
        let definitions: Map<String, Value> = self
            .definitions
            .iter()
            .map(|(name, def)| (name.clone(), def.to_json_schema()))
            .collect();
        if let Value::Object(map) = &mut schema {
            map.insert("$schema".to_string(), json!("http://json-schema.org/draft-07/schema#"));
            map.insert("title".to_string(), json!(self.name));
            map.insert("definitions".to_string(), Value::Object(definitions));
        }
        schema
    }
}

/// Property list under construction
#[derive(Debug, Default)]
pub struct ObjectBuilder {
    properties: BTreeMap<String, Property>,
}

impl ObjectBuilder {
    pub fn required(mut self, name: impl Into<String>, kind: PropertyKind) -> Self {
        self.properties.insert(name.into(), Property { kind, required: true });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, kind: PropertyKind) -> Self {
        self.properties.insert(name.into(), Property { kind, required: false });
        self
    }

    fn finish(self) -> ObjectDescriptor {
        ObjectDescriptor {
            properties: self.properties,
        }
    }
}

/// Fluent builder for [`SchemaDescriptor`]
#[derive(Debug)]
pub struct DescriptorBuilder {
    name: String,
    root: ObjectBuilder,
    definitions: BTreeMap<String, ObjectDescriptor>,
}

impl DescriptorBuilder {
    pub fn required(mut self, name: impl Into<String>, kind: PropertyKind) -> Self {
        self.root = self.root.required(name, kind);
        self
    }

    pub fn optional(mut self, name: impl Into<String>, kind: PropertyKind) -> Self {
        self.root = self.root.optional(name, kind);
        self
    }

    /// Add a named sub-descriptor that refs can point at
    pub fn define<F>(mut self, name: impl Into<String>, build: F) -> Self
    where
        F: FnOnce(ObjectBuilder) -> ObjectBuilder,
    {
        let object = build(ObjectBuilder::default()).finish();
        self.definitions.insert(name.into(), object);
        self
    }

    pub fn build(self) -> Result<SchemaDescriptor> {
        let descriptor = SchemaDescriptor {
            name: self.name,
            root: self.root.finish(),
            definitions: self.definitions,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

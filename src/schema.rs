//! Schema types and record validation

use chrono::{DateTime, Utc};
use jsonschema::error::{TypeKind, ValidationErrorKind};
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::checksum::Checksum;
use crate::compatibility::is_compatible;
use crate::descriptor::SchemaDescriptor;
use crate::error::{FieldError, IngestError, Result};
use crate::identity::SchemaIdentity;

/// A schema bound to its registry slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub identity: SchemaIdentity,
    pub descriptor: SchemaDescriptor,
}

impl Schema {
    /// Create a schema, rejecting malformed identities and dangling refs
    pub fn new(identity: SchemaIdentity, descriptor: SchemaDescriptor) -> Result<Self> {
        identity.validate()?;
        descriptor.validate()?;
        Ok(Self { identity, descriptor })
    }

    /// Fingerprint of the descriptor content
    pub fn fingerprint(&self) -> Result<Checksum> {
        Ok(Checksum::of(&self.descriptor)?)
    }

    /// Compile a validator that can be reused across many records
    pub fn validator(&self) -> Result<RecordValidator> {
        let document = self.descriptor.to_json_schema();
        let compiled = JSONSchema::compile(&document)
            .map_err(|e| IngestError::InvalidDescriptor(e.to_string()))?;
        Ok(RecordValidator {
            identity: self.identity.clone(),
            compiled,
        })
    }

    /// Validate a single record
    pub fn validate(&self, record: &Value) -> Result<()> {
        self.validator()?.validate(record)
    }

    /// Whether data valid under `older` stays valid under this schema
    pub fn is_backward_compatible_with(&self, older: &Schema) -> bool {
        is_compatible(&self.descriptor, &older.descriptor)
    }
}

/// A compiled schema ready to check records
pub struct RecordValidator {
    identity: SchemaIdentity,
    compiled: JSONSchema,
}

impl RecordValidator {
    pub fn validate(&self, record: &Value) -> Result<()> {
        let errors = self.field_errors(record);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(IngestError::SchemaValidation {
                identity: self.identity.clone(),
                errors,
            })
        }
    }

    /// Collect every violation instead of stopping at the first
    pub fn field_errors(&self, record: &Value) -> Vec<FieldError> {
        match self.compiled.validate(record) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .map(|error| {
                    let message = match &error.kind {
                        ValidationErrorKind::Required { property } => {
                            let name = property
                                .as_str()
                                .map(str::to_string)
                                .unwrap_or_else(|| property.to_string());
                            format!("must have required property '{}'", name)
                        }
                        ValidationErrorKind::Type { kind } => format!("must be {}", expected_type(kind)),
                        _ => error.to_string(),
                    };
                    FieldError::new(error.instance_path.to_string(), message)
                })
                .collect(),
        }
    }
}

/// The expected type name; `null` is left out of nullable unions
fn expected_type(kind: &TypeKind) -> String {
    match kind {
        TypeKind::Single(primitive) => primitive.to_string(),
        TypeKind::Multiple(types) => (*types)
            .into_iter()
            .map(|primitive| primitive.to_string())
            .filter(|name| name != "null")
            .collect::<Vec<_>>()
            .join(","),
    }
}

/// Persistence form of a registered schema
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSchema {
    pub schema: Schema,
    pub fingerprint: Checksum,
    /// Optimistic concurrency token; bumped by the store on every write
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredSchema {
    pub fn new(schema: Schema) -> Result<Self> {
        let fingerprint = schema.fingerprint()?;
        let now = Utc::now();
        Ok(Self {
            schema,
            fingerprint,
            revision: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Replace the schema content, keeping creation metadata
    pub fn evolve(&self, schema: Schema) -> Result<Self> {
        Ok(Self {
            fingerprint: schema.fingerprint()?,
            schema,
            revision: self.revision,
            created_at: self.created_at,
            updated_at: Utc::now(),
        })
    }
}

/// Row count summary for one registered schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaStats {
    pub identity: SchemaIdentity,
    pub row_count: usize,
    pub last_updated: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::PropertyKind;
    use serde_json::json;

    fn user_schema() -> Schema {
        let descriptor = SchemaDescriptor::builder("User")
            .required("id", PropertyKind::string())
            .required("name", PropertyKind::string())
            .optional("age", PropertyKind::number())
            .optional("friends", PropertyKind::array_of_objects("Friend"))
            .define("Friend", |f| f.required("id", PropertyKind::string()))
            .build()
            .unwrap();
        Schema::new(SchemaIdentity::new("ns", "User", "v1").unwrap(), descriptor).unwrap()
    }

    #[test]
    fn test_valid_record_passes() {
        let schema = user_schema();
        let record = json!({"id": "1", "name": "Ada", "age": 36, "friends": [{"id": "2"}]});
        assert!(schema.validate(&record).is_ok());
    }

    #[test]
    fn test_missing_required_property_message() {
        let schema = user_schema();
        let err = schema.validate(&json!({"id": "1"})).unwrap_err();
        match err {
            IngestError::SchemaValidation { errors, .. } => {
                assert_eq!(
                    errors,
                    vec![FieldError::new("", "must have required property 'name'")]
                );
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_optional_accepts_null_and_nested_refs_are_checked() {
        let schema = user_schema();
        assert!(schema.validate(&json!({"id": "1", "name": "a", "age": null})).is_ok());

        let err = schema
            .validate(&json!({"id": "1", "name": "a", "friends": [{}]}))
            .unwrap_err();
        match err {
            IngestError::SchemaValidation { errors, .. } => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].field, "/friends/0");
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_wrong_type_message() {
        let schema = user_schema();
        match schema.validate(&json!({"id": 1, "name": "a"})).unwrap_err() {
            IngestError::SchemaValidation { errors, .. } => {
                assert_eq!(errors, vec![FieldError::new("/id", "must be string")]);
            }
            other => panic!("expected validation error, got {:?}", other),
        }

        // Nullable optional: the message names the declared type only
        match schema.validate(&json!({"id": "1", "name": "a", "age": "x"})).unwrap_err() {
            IngestError::SchemaValidation { errors, .. } => {
                assert_eq!(errors, vec![FieldError::new("/age", "must be number")]);
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_fingerprint_tracks_descriptor_only() {
        let a = user_schema();
        let mut b = user_schema();
        b.identity = SchemaIdentity::new("other", "User", "v1").unwrap();
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }
}

//! Output-contract checks with compiled JSON Schema validators.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use super::expression::canonical_json;

/// Compiled validators keyed by the canonical text of their schema.
#[derive(Default)]
pub struct SchemaCache {
    compiled: DashMap<String, Arc<jsonschema::Validator>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check `value` against `schema`, returning every violation message.
    ///
    /// A schema that fails to compile is reported as a single violation.
    pub fn check(&self, schema: &Value, value: &Value) -> Result<(), Vec<String>> {
        let key = canonical_json(schema);
        let validator = match self.compiled.get(&key) {
            Some(v) => Arc::clone(&v),
            None => {
                let compiled = jsonschema::validator_for(schema)
                    .map_err(|e| vec![format!("invalid output schema: {e}")])?;
                let compiled = Arc::new(compiled);
                self.compiled.insert(key, Arc::clone(&compiled));
                compiled
            }
        };

        let violations: Vec<String> = validator.iter_errors(value).map(|e| e.to_string()).collect();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

/// Whether a schema compiles.
pub fn compile_check(schema: &Value) -> Result<(), String> {
    jsonschema::validator_for(schema)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn branch_schema() -> Value {
        json!({
            "type": "object",
            "required": ["branch"],
            "properties": { "branch": { "type": "string" } }
        })
    }

    #[test]
    fn valid_value_passes() {
        let cache = SchemaCache::new();
        assert!(cache.check(&branch_schema(), &json!({ "branch": "feat-x" })).is_ok());
    }

    #[test]
    fn violations_are_listed() {
        let cache = SchemaCache::new();
        let violations = cache
            .check(&branch_schema(), &json!({ "branch": 7 }))
            .unwrap_err();
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("string"));
    }

    #[test]
    fn equivalent_schemas_share_one_validator() {
        let cache = SchemaCache::new();
        let a = json!({ "type": "string", "minLength": 1 });
        let b = json!({ "minLength": 1, "type": "string" });
        cache.check(&a, &json!("x")).unwrap();
        cache.check(&b, &json!("y")).unwrap();
        assert_eq!(cache.compiled.len(), 1);
    }

    #[test]
    fn invalid_schema_is_reported() {
        assert!(compile_check(&json!({ "type": 12 })).is_err());
        let cache = SchemaCache::new();
        let err = cache.check(&json!({ "type": 12 }), &json!(1)).unwrap_err();
        assert!(err[0].starts_with("invalid output schema"));
    }
}

//! Converts a tabular HSDS schema description into a JSON-Schema envelope
//! suitable for a provider's strict structured-output mode.

use crate::providers::{JsonSchemaDescriptor, OutputFormat};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("unable to read schema file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed schema row in {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },

    #[error("schema references unknown table '{0}'")]
    UnknownReference(String),

    #[error("unrecognised field type '{0}' for field '{1}'")]
    UnknownFieldType(String, String),

    #[error("entity '{0}' has no rows in the schema file")]
    UnknownEntity(String),
}

pub type Result<T> = std::result::Result<T, SchemaError>;

#[derive(Debug, Clone, Deserialize)]
struct SchemaRow {
    table_name: String,
    field_name: String,
    field_type: String,
    #[serde(deserialize_with = "bool_from_str")]
    required: bool,
    #[serde(default, deserialize_with = "bool_from_str")]
    #[allow(dead_code)]
    unique: bool,
    #[serde(default)]
    enumeration: String,
    #[serde(default)]
    reference: String,
}

fn bool_from_str<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
}

const MAX_RECURSION_DEPTH: usize = 6;

/// Reads the tabular schema once per process and caches the JSON-Schema
/// envelope it builds per entity name.
pub struct SchemaConverter {
    path: PathBuf,
    rows: OnceLock<Vec<SchemaRow>>,
    cache: Mutex<HashMap<String, Value>>,
}

impl SchemaConverter {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            rows: OnceLock::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn rows(&self) -> Result<&Vec<SchemaRow>> {
        if let Some(rows) = self.rows.get() {
            return Ok(rows);
        }
        let rows = self.load_rows()?;
        Ok(self.rows.get_or_init(|| rows))
    }

    fn load_rows(&self) -> Result<Vec<SchemaRow>> {
        let path_str = self.path.display().to_string();
        let mut reader = csv::Reader::from_path(&self.path).map_err(|source| SchemaError::Csv {
            path: path_str.clone(),
            source,
        })?;
        let mut rows = Vec::new();
        for record in reader.deserialize() {
            let row: SchemaRow = record.map_err(|source| SchemaError::Csv {
                path: path_str.clone(),
                source,
            })?;
            rows.push(row);
        }
        Ok(rows)
    }

    /// Builds (or returns the cached) JSON-Schema envelope for `entity`.
    pub fn convert_to_llm_schema(&self, entity: &str) -> Result<OutputFormat> {
        if let Some(cached) = self.cache.lock().unwrap().get(entity) {
            return Ok(wrap_envelope(entity, cached.clone()));
        }

        let rows = self.rows()?;
        if !rows.iter().any(|r| r.table_name == entity) {
            return Err(SchemaError::UnknownEntity(entity.to_string()));
        }

        let mut building = HashSet::new();
        let schema = build_table_schema(rows, entity, &mut building, 0)?;
        self.cache
            .lock()
            .unwrap()
            .insert(entity.to_string(), schema.clone());

        Ok(wrap_envelope(entity, schema))
    }
}

fn wrap_envelope(entity: &str, schema: Value) -> OutputFormat {
    OutputFormat::JsonSchema {
        json_schema: JsonSchemaDescriptor {
            name: entity.to_string(),
            description: format!("Structured output for the {entity} entity"),
            strict: true,
            schema,
        },
    }
}

fn build_table_schema(
    rows: &[SchemaRow],
    table: &str,
    building: &mut HashSet<String>,
    depth: usize,
) -> Result<Value> {
    if depth >= MAX_RECURSION_DEPTH || !building.insert(table.to_string()) {
        return Ok(json!({ "type": "object", "additionalProperties": false }));
    }

    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();

    for row in rows.iter().filter(|r| r.table_name == table) {
        let field_schema = build_field_schema(rows, row, building, depth)?;
        properties.insert(row.field_name.clone(), field_schema);
        if row.required {
            required.push(Value::String(row.field_name.clone()));
        }
    }

    building.remove(table);

    Ok(json!({
        "type": "object",
        "properties": Value::Object(properties),
        "required": required,
        "additionalProperties": false,
    }))
}

fn build_field_schema(
    rows: &[SchemaRow],
    row: &SchemaRow,
    building: &mut HashSet<String>,
    depth: usize,
) -> Result<Value> {
    match row.field_type.as_str() {
        "array" => {
            if row.reference.is_empty() {
                return Err(SchemaError::UnknownReference(row.field_name.clone()));
            }
            if !rows.iter().any(|r| r.table_name == row.reference) {
                return Err(SchemaError::UnknownReference(row.reference.clone()));
            }
            let item_schema = build_table_schema(rows, &row.reference, building, depth + 1)?;
            Ok(json!({ "type": "array", "items": item_schema }))
        }
        "object" => {
            if row.reference.is_empty() {
                return Err(SchemaError::UnknownReference(row.field_name.clone()));
            }
            build_table_schema(rows, &row.reference, building, depth + 1)
        }
        "string" => Ok(string_field_schema(row)),
        "number" => Ok(json!({ "type": "number" })),
        "integer" => Ok(json!({ "type": "integer" })),
        "boolean" => Ok(json!({ "type": "boolean" })),
        other => Err(SchemaError::UnknownFieldType(other.to_string(), row.field_name.clone())),
    }
}

fn string_field_schema(row: &SchemaRow) -> Value {
    if !row.enumeration.trim().is_empty() {
        let values: Vec<Value> = row
            .enumeration
            .split(',')
            .map(|s| Value::String(s.trim().to_string()))
            .collect();
        return json!({ "type": "string", "enum": values });
    }

    if let Some(pattern) = semantic_pattern(&row.field_name) {
        return json!({ "type": "string", "pattern": pattern });
    }

    json!({ "type": "string" })
}

/// Attaches pattern constraints for semantically typed fields by name.
fn semantic_pattern(field_name: &str) -> Option<&'static str> {
    match field_name {
        "state_province" => Some(r"^[A-Z]{2}$"),
        "postal_code" => Some(r"^\d{5}(-\d{4})?$"),
        "country" => Some(r"^[A-Z]{2}$"),
        "opens_at" | "closes_at" => {
            Some(r"^([01]\d|2[0-3]):[0-5]\d(:[0-5]\d)?(Z|[+-]\d{2}:\d{2})?$")
        }
        "last_action_date" => Some(r"^\d{4}-\d{2}-\d{2}$"),
        "number" => Some(r"^[\d\s()+\-.]+$"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_schema(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn builds_schema_with_required_fields_and_additional_properties_false() {
        let file = write_schema(
            "table_name,field_name,field_type,required,unique,enumeration,reference\n\
             organization,name,string,true,false,,\n\
             organization,description,string,true,false,,\n",
        );
        let converter = SchemaConverter::new(file.path());
        let format = converter.convert_to_llm_schema("organization").unwrap();
        let OutputFormat::JsonSchema { json_schema } = format;
        assert_eq!(json_schema.schema["additionalProperties"], json!(false));
        assert_eq!(
            json_schema.schema["required"],
            json!(["name", "description"])
        );
    }

    #[test]
    fn nested_array_reference_is_resolved() {
        let file = write_schema(
            "table_name,field_name,field_type,required,unique,enumeration,reference\n\
             organization,services,array,true,false,,service\n\
             service,name,string,true,false,,\n",
        );
        let converter = SchemaConverter::new(file.path());
        let format = converter.convert_to_llm_schema("organization").unwrap();
        let OutputFormat::JsonSchema { json_schema } = format;
        assert_eq!(json_schema.schema["properties"]["services"]["type"], json!("array"));
        assert_eq!(
            json_schema.schema["properties"]["services"]["items"]["properties"]["name"]["type"],
            json!("string")
        );
    }

    #[test]
    fn unknown_reference_is_an_error() {
        let file = write_schema(
            "table_name,field_name,field_type,required,unique,enumeration,reference\n\
             organization,services,array,true,false,,missing_table\n",
        );
        let converter = SchemaConverter::new(file.path());
        assert!(matches!(
            converter.convert_to_llm_schema("organization"),
            Err(SchemaError::UnknownReference(_))
        ));
    }

    #[test]
    fn conversion_is_cached_and_byte_stable() {
        let file = write_schema(
            "table_name,field_name,field_type,required,unique,enumeration,reference\n\
             organization,name,string,true,false,,\n",
        );
        let converter = SchemaConverter::new(file.path());
        let first = converter.convert_to_llm_schema("organization").unwrap();
        let second = converter.convert_to_llm_schema("organization").unwrap();
        let OutputFormat::JsonSchema { json_schema: a } = first;
        let OutputFormat::JsonSchema { json_schema: b } = second;
        assert_eq!(a.schema, b.schema);
    }

    #[test]
    fn semantic_patterns_attach_to_known_fields() {
        let file = write_schema(
            "table_name,field_name,field_type,required,unique,enumeration,reference\n\
             address,postal_code,string,true,false,,\n\
             address,state_province,string,true,false,,\n",
        );
        let converter = SchemaConverter::new(file.path());
        let format = converter.convert_to_llm_schema("address").unwrap();
        let OutputFormat::JsonSchema { json_schema } = format;
        assert_eq!(
            json_schema.schema["properties"]["postal_code"]["pattern"],
            json!(r"^\d{5}(-\d{4})?$")
        );
    }

    #[test]
    fn unknown_entity_is_an_error() {
        let file = write_schema(
            "table_name,field_name,field_type,required,unique,enumeration,reference\n\
             organization,name,string,true,false,,\n",
        );
        let converter = SchemaConverter::new(file.path());
        assert!(matches!(
            converter.convert_to_llm_schema("nonexistent"),
            Err(SchemaError::UnknownEntity(_))
        ));
    }
}

//! Deterministic presence/completeness scoring of an HSDS payload.

use serde_json::Value;
use std::collections::BTreeMap;

/// Fields the upstream scraper asserts were present in its input, grouped by
/// entity. Missing-known penalties are strictly greater than missing-unknown.
#[derive(Debug, Clone, Default)]
pub struct KnownFields {
    pub organization_fields: Vec<String>,
    pub service_fields: Vec<String>,
    pub location_fields: Vec<String>,
    pub phone_fields: Vec<String>,
    pub address_fields: Vec<String>,
    pub schedule_fields: Vec<String>,
}

// Required-field sets below must track `resources/hsds_schema.csv`'s
// `required=true` column for each table. That CSV is also what C4 feeds the
// LLM as the generation schema, so a field absent here but required there
// (or vice versa) would make C4 and C5 disagree about what's mandatory.
const TOP_LEVEL_FIELDS: &[&str] = &["organization", "service", "location"];
const ORGANIZATION_FIELDS: &[&str] = &["name", "description", "services"];
const SERVICE_FIELDS: &[&str] = &["name", "description", "status", "organization_id"];
const LOCATION_FIELDS: &[&str] = &["name", "location_type", "latitude", "longitude", "addresses"];
const PHONE_FIELDS: &[&str] = &["number"];
const ADDRESS_FIELDS: &[&str] = &["address_1", "city", "state_province", "postal_code", "country"];

const DEDUCTION_TOP_LEVEL: f64 = 0.15;
const DEDUCTION_ORGANIZATION: f64 = 0.10;
const DEDUCTION_SERVICE: f64 = 0.10;
const DEDUCTION_LOCATION: f64 = 0.10;
const DEDUCTION_OTHER: f64 = 0.05;
const DEDUCTION_KNOWN_TOP_LEVEL: f64 = 0.25;
const DEDUCTION_KNOWN_ORGANIZATION: f64 = 0.20;
const DEDUCTION_KNOWN_SERVICE: f64 = 0.20;
const DEDUCTION_KNOWN_LOCATION: f64 = 0.20;
const DEDUCTION_KNOWN_OTHER: f64 = 0.15;
const DEDUCTION_INFERRABLE_ADDRESS: f64 = 0.03;
const DEDUCTION_INFERRABLE_DEFAULTS: f64 = 0.02;
const DEDUCTION_INFERRABLE_STATUS: f64 = 0.02;

const INFERRABLE_ADDRESS_PIECES: &[&str] = &["city", "state_province", "postal_code"];
const INFERRABLE_DEFAULTS: &[&str] = &["country", "phone.type", "languages", "address_type"];
const INFERRABLE_STATUS: &[&str] = &["status", "location_type", "freq", "wkst"];

#[derive(Debug, Default)]
pub struct FieldValidator;

impl FieldValidator {
    pub fn new() -> Self {
        Self
    }

    /// Returns missing required field paths such as
    /// `"organization.name"` or `"location[0].phones[0].number"`.
    pub fn validate_required_fields(&self, hsds_data: &Value) -> Vec<String> {
        let mut missing = Vec::new();

        for field in TOP_LEVEL_FIELDS {
            if hsds_data.get(field).is_none() {
                missing.push(field.to_string());
            }
        }

        check_entity_array(hsds_data, "organization", ORGANIZATION_FIELDS, &mut missing);
        check_entity_array(hsds_data, "service", SERVICE_FIELDS, &mut missing);
        check_entity_array(hsds_data, "location", LOCATION_FIELDS, &mut missing);

        self.validate_phone_fields(hsds_data, &mut missing);

        missing
    }

    fn validate_phone_fields(&self, data: &Value, missing: &mut Vec<String>) {
        for entity in ["organization", "service", "location"] {
            let Some(items) = data.get(entity).and_then(Value::as_array) else {
                continue;
            };
            for (idx, item) in items.iter().enumerate() {
                let Some(phones) = item.get("phones").and_then(Value::as_array) else {
                    continue;
                };
                for (phone_idx, phone) in phones.iter().enumerate() {
                    let prefix = format!("{entity}[{idx}].phones[{phone_idx}]");
                    for field in PHONE_FIELDS {
                        if phone.get(field).is_none() {
                            missing.push(format!("{prefix}.{field}"));
                        }
                    }
                }
            }
        }
    }

    /// Confidence score in `[0, 1]`, starting at 1.0 and subtracting
    /// per-missing-field penalties. Inferrable categories are checked first
    /// and take precedence over the generic per-section penalty.
    pub fn calculate_confidence(&self, missing_fields: &[String], known_fields: Option<&KnownFields>) -> f64 {
        if missing_fields.is_empty() {
            return 1.0;
        }

        let mut confidence = 1.0;

        for field in missing_fields {
            let is_known = known_fields.map(|k| field_is_known(field, k)).unwrap_or(false);

            let deduction = if INFERRABLE_ADDRESS_PIECES.iter().any(|p| field.contains(p)) {
                DEDUCTION_INFERRABLE_ADDRESS
            } else if INFERRABLE_DEFAULTS.iter().any(|p| field.contains(p)) {
                DEDUCTION_INFERRABLE_DEFAULTS
            } else if INFERRABLE_STATUS.iter().any(|p| field.contains(p)) {
                DEDUCTION_INFERRABLE_STATUS
            } else if TOP_LEVEL_FIELDS.contains(&field.as_str()) {
                if is_known { DEDUCTION_KNOWN_TOP_LEVEL } else { DEDUCTION_TOP_LEVEL }
            } else if field.starts_with("organization.") {
                if is_known { DEDUCTION_KNOWN_ORGANIZATION } else { DEDUCTION_ORGANIZATION }
            } else if field.starts_with("service.") {
                if is_known { DEDUCTION_KNOWN_SERVICE } else { DEDUCTION_SERVICE }
            } else if field.starts_with("location.") {
                if is_known { DEDUCTION_KNOWN_LOCATION } else { DEDUCTION_LOCATION }
            } else if is_known {
                DEDUCTION_KNOWN_OTHER
            } else {
                DEDUCTION_OTHER
            };

            confidence -= deduction;
        }

        confidence.clamp(0.0, 1.0)
    }

    /// Human-readable feedback grouped by entity; empty when nothing missing.
    pub fn generate_feedback(&self, missing_fields: &[String]) -> String {
        if missing_fields.is_empty() {
            return String::new();
        }

        let mut groups: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();
        groups.insert("top_level", Vec::new());
        groups.insert("organization", Vec::new());
        groups.insert("service", Vec::new());
        groups.insert("location", Vec::new());
        groups.insert("phone", Vec::new());

        for field in missing_fields {
            if TOP_LEVEL_FIELDS.contains(&field.as_str()) {
                groups.get_mut("top_level").unwrap().push(field.clone());
            } else if let Some(rest) = field.strip_prefix("organization.") {
                groups.get_mut("organization").unwrap().push(rest.to_string());
            } else if let Some(rest) = field.strip_prefix("service.") {
                groups.get_mut("service").unwrap().push(rest.to_string());
            } else if let Some(rest) = field.strip_prefix("location.") {
                groups.get_mut("location").unwrap().push(rest.to_string());
            } else if field.contains("phones") {
                groups.get_mut("phone").unwrap().push(field.clone());
            }
        }

        let mut parts = vec!["Missing required fields:".to_string()];
        for entity in ["top_level", "organization", "service", "location", "phone"] {
            let fields = &groups[entity];
            if fields.is_empty() {
                continue;
            }
            if entity == "top_level" {
                parts.push(format!("Top-level fields: {}", fields.join(", ")));
            } else {
                let title = format!("{}{}", &entity[..1].to_uppercase(), &entity[1..]);
                parts.push(format!("{title} fields: {}", fields.join(", ")));
            }
        }

        parts.join("\n")
    }
}

fn check_entity_array(data: &Value, entity: &str, fields: &[&str], missing: &mut Vec<String>) {
    let Some(items) = data.get(entity).and_then(Value::as_array) else {
        return;
    };
    for item in items {
        for field in fields {
            if item.get(field).is_none() {
                missing.push(format!("{entity}.{field}"));
            }
        }
    }
}

fn field_is_known(field: &str, known: &KnownFields) -> bool {
    if TOP_LEVEL_FIELDS.contains(&field) {
        return known.organization_fields.iter().any(|f| f == field);
    }
    if let Some(rest) = field.strip_prefix("organization.") {
        let name = rest.split('.').next().unwrap_or(rest);
        return known.organization_fields.iter().any(|f| f == name);
    }
    if let Some(rest) = field.strip_prefix("service.") {
        let name = rest.split('.').next().unwrap_or(rest);
        return known.service_fields.iter().any(|f| f == name);
    }
    if let Some(rest) = field.strip_prefix("location.") {
        let name = rest.split('.').next().unwrap_or(rest);
        return known.location_fields.iter().any(|f| f == name);
    }
    if field.contains("phones") {
        let name = field.rsplit('.').next().unwrap_or(field);
        return known.phone_fields.iter().any(|f| f == name);
    }
    if field.contains("addresses") {
        let name = field.rsplit('.').next().unwrap_or(field);
        return known.address_fields.iter().any(|f| f == name);
    }
    if field.contains("schedules") {
        let name = field.rsplit('.').next().unwrap_or(field);
        return known.schedule_fields.iter().any(|f| f == name);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn no_missing_fields_yields_full_confidence() {
        let validator = FieldValidator::new();
        assert_eq!(validator.calculate_confidence(&[], None), 1.0);
    }

    #[test]
    fn missing_top_level_field_is_detected() {
        let validator = FieldValidator::new();
        let data = json!({"organization": [], "service": []});
        let missing = validator.validate_required_fields(&data);
        assert!(missing.contains(&"location".to_string()));
    }

    #[test]
    fn inferrable_address_piece_takes_precedence_over_location_penalty() {
        let validator = FieldValidator::new();
        let missing = vec!["location.city".to_string()];
        let confidence = validator.calculate_confidence(&missing, None);
        assert!((confidence - (1.0 - DEDUCTION_INFERRABLE_ADDRESS)).abs() < 1e-9);
    }

    #[test]
    fn known_field_missing_costs_more_than_unknown() {
        let validator = FieldValidator::new();
        let missing = vec!["organization.name".to_string()];
        let unknown_conf = validator.calculate_confidence(&missing, None);

        let known = KnownFields {
            organization_fields: vec!["name".to_string()],
            ..Default::default()
        };
        let known_conf = validator.calculate_confidence(&missing, Some(&known));

        assert!(known_conf < unknown_conf);
    }

    #[test]
    fn confidence_never_drops_below_zero() {
        let validator = FieldValidator::new();
        let missing: Vec<String> = (0..50).map(|i| format!("other_field_{i}")).collect();
        assert_eq!(validator.calculate_confidence(&missing, None), 0.0);
    }

    #[test]
    fn feedback_groups_by_entity() {
        let validator = FieldValidator::new();
        let missing = vec!["organization.name".to_string(), "location".to_string()];
        let feedback = validator.generate_feedback(&missing);
        assert!(feedback.contains("Top-level fields: location"));
        assert!(feedback.contains("Organization fields: name"));
    }

    #[test]
    fn phone_missing_fields_use_indexed_prefix() {
        let validator = FieldValidator::new();
        let data = json!({
            "organization": [{"phones": [{"languages": []}]}],
        });
        let missing = validator.validate_required_fields(&data);
        assert!(missing.contains(&"organization[0].phones[0].number".to_string()));
    }

    #[test]
    fn phone_type_is_not_required() {
        let validator = FieldValidator::new();
        let data = json!({
            "organization": [{"phones": [{"number": "555-0100"}]}],
        });
        let missing = validator.validate_required_fields(&data);
        assert!(!missing.iter().any(|f| f.ends_with(".type")));
    }

    #[test]
    fn service_phones_is_not_required() {
        let validator = FieldValidator::new();
        let data = json!({
            "service": [{
                "name": "Food pantry",
                "description": "Weekly distribution",
                "status": "active",
                "organization_id": "org-1",
            }],
        });
        let missing = validator.validate_required_fields(&data);
        assert!(!missing.contains(&"service.phones".to_string()));
    }

    #[test]
    fn required_fields_match_the_shipped_schema_csv() {
        let csv_text = include_str!("../../resources/hsds_schema.csv");
        let mut reader = csv::Reader::from_reader(csv_text.as_bytes());
        let mut required_by_table: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for record in reader.records() {
            let record = record.unwrap();
            let table = record.get(0).unwrap().to_string();
            let field = record.get(1).unwrap().to_string();
            let required = record.get(3).unwrap() == "true";
            if required {
                required_by_table.entry(table).or_default().push(field);
            }
        }

        let check = |table: &str, expected: &[&str]| {
            let mut csv_fields = required_by_table.get(table).cloned().unwrap_or_default();
            csv_fields.sort();
            let mut expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
            expected.sort();
            assert_eq!(csv_fields, expected, "required fields for '{table}' drifted from the schema CSV");
        };

        check("organization", ORGANIZATION_FIELDS);
        check("service", SERVICE_FIELDS);
        check("location", LOCATION_FIELDS);
        check("phone", PHONE_FIELDS);
    }
}

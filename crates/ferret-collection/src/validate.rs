use serde_json::{Map, Number, Value};

use ferret_query::DirtyValues;

use crate::document::get_path;
use crate::error::Error;
use crate::schema::{Field, FieldType, ID_FIELD, Schema, detect_type};

/// Validation failure, kept typed so the alter protocol can map categories
/// to its own user-visible messages.
#[derive(Debug, Clone, PartialEq)]
pub enum Invalid {
    /// A non-optional field is absent.
    Missing { field: String },
    /// A value cannot be used (or coerced) as the declared type.
    Type { field: String, expected: FieldType },
    Bad(String),
}

impl From<Invalid> for Error {
    fn from(invalid: Invalid) -> Self {
        match invalid {
            Invalid::Missing { field } => Error::BadRequest(format!(
                "field `{field}` has been declared in the schema, but is not found in the document"
            )),
            Invalid::Type { field, expected } => Error::BadRequest(format!(
                "field `{field}` must be a `{}` value",
                type_name(expected)
            )),
            Invalid::Bad(msg) => Error::BadRequest(msg),
        }
    }
}

fn type_name(t: FieldType) -> &'static str {
    match t {
        FieldType::String => "string",
        FieldType::Int32 => "int32",
        FieldType::Int64 => "int64",
        FieldType::Float => "float",
        FieldType::Bool => "bool",
        FieldType::Geopoint => "geopoint",
        FieldType::Object => "object",
        FieldType::StringArray => "string[]",
        FieldType::Int32Array => "int32[]",
        FieldType::Int64Array => "int64[]",
        FieldType::FloatArray => "float[]",
        FieldType::BoolArray => "bool[]",
        FieldType::ObjectArray => "object[]",
        FieldType::Auto => "auto",
        FieldType::StringStar => "string*",
    }
}

/// Outcome of coercing one value.
enum Coerced {
    Value(Value),
    Dropped,
}

/// Validate a document against the schema in place: discover new fields
/// permitted by dynamic rules, then coerce every declared field per the
/// dirty-values policy. Returns the fields to add to the live schema.
pub fn validate_document(
    doc: &mut Map<String, Value>,
    schema: &Schema,
    dirty: DirtyValues,
) -> Result<Vec<Field>, Invalid> {
    let new_fields = detect_new_fields(doc, schema);

    for field in schema.fields().iter().chain(new_fields.iter()) {
        validate_field(doc, field, dirty)?;
    }
    Ok(new_fields)
}

fn validate_field(
    doc: &mut Map<String, Value>,
    field: &Field,
    dirty: DirtyValues,
) -> Result<(), Invalid> {
    // Reference helpers are produced by resolution, never validated here.
    if field.name.ends_with("_sequence_id") {
        return Ok(());
    }

    let present = if field.name.contains('.') {
        get_path(doc, &field.name).is_some_and(|v| !v.is_null())
    } else {
        doc.get(&field.name).is_some_and(|v| !v.is_null())
    };
    if !present {
        if field.optional || !field.index || field.embed.is_some() {
            return Ok(());
        }
        return Err(Invalid::Missing {
            field: field.name.clone(),
        });
    }

    // Coercion applies to top-level values; nested leaves were validated
    // through their parent object's flattening.
    if field.name.contains('.') {
        return Ok(());
    }
    let Some(value) = doc.get(&field.name).cloned() else {
        return Ok(());
    };

    match coerce_value(&value, field, dirty)? {
        Coerced::Value(coerced) => {
            doc.insert(field.name.clone(), coerced);
        }
        Coerced::Dropped => {
            doc.remove(&field.name);
        }
    }
    Ok(())
}

/// Undeclared top-level keys matched against dynamic patterns, then the
/// `.*` fallback. Nested objects additionally surface their flattened
/// leaves when nested fields are on.
pub fn detect_new_fields(doc: &Map<String, Value>, schema: &Schema) -> Vec<Field> {
    let mut added = Vec::new();
    for (key, value) in doc {
        if key == ID_FIELD || key.ends_with("_sequence_id") {
            continue;
        }
        if let Some(declared) = schema.field(key) {
            // Declared object fields surface their primitive leaves.
            if schema.enable_nested_fields && declared.field_type.is_object_kind() {
                expand_object_leaves(key, value, declared.index, false, schema, &mut added);
            }
            continue;
        }
        let Some(prototype) = schema.match_undeclared(key) else {
            continue;
        };
        let string_star = prototype.field_type == FieldType::StringStar;
        let Some(detected) = detect_type(value, string_star) else {
            continue;
        };
        let mut field = prototype.clone();
        field.name = key.clone();
        field.field_type = if prototype.field_type.is_dynamic() {
            detected
        } else {
            prototype.field_type
        };
        field.optional = true;
        added.push(field.clone());

        // Nested objects expand their primitive leaves too.
        if schema.enable_nested_fields && detected.is_object_kind() {
            expand_object_leaves(key, value, field.index, string_star, schema, &mut added);
        }
    }
    added
}

fn expand_object_leaves(
    key: &str,
    value: &Value,
    index: bool,
    string_star: bool,
    schema: &Schema,
    added: &mut Vec<Field>,
) {
    let root: Map<String, Value> = [(key.to_string(), value.clone())].into_iter().collect();
    for (path, leaf) in crate::document::flatten(&root) {
        if path == key || schema.field(&path).is_some() {
            continue;
        }
        if added.iter().any(|f| f.name == path) {
            continue;
        }
        if let Some(leaf_type) = detect_type(&leaf, string_star) {
            let mut leaf_field = Field::new(&path, leaf_type);
            leaf_field.optional = true;
            leaf_field.index = index;
            added.push(leaf_field);
        }
    }
}

fn coerce_value(value: &Value, field: &Field, dirty: DirtyValues) -> Result<Coerced, Invalid> {
    let expected = field.field_type;
    let mismatch = || Invalid::Type {
        field: field.name.clone(),
        expected,
    };

    if matches_type(value, field) {
        return Ok(Coerced::Value(value.clone()));
    }

    match dirty {
        DirtyValues::Reject => Err(mismatch()),
        DirtyValues::Drop => Ok(Coerced::Dropped),
        DirtyValues::CoerceOrReject => match try_coerce(value, field) {
            Some(coerced) => Ok(Coerced::Value(coerced)),
            None => Err(mismatch()),
        },
        DirtyValues::CoerceOrDrop => match try_coerce(value, field) {
            Some(coerced) => Ok(Coerced::Value(coerced)),
            None => Ok(Coerced::Dropped),
        },
    }
}

fn matches_type(value: &Value, field: &Field) -> bool {
    if field.is_vector() {
        return value.as_array().is_some_and(|items| {
            items.len() == field.num_dim && items.iter().all(Value::is_number)
        });
    }
    match field.field_type {
        FieldType::String => value.is_string(),
        FieldType::Int32 => value
            .as_i64()
            .is_some_and(|v| i32::try_from(v).is_ok()),
        FieldType::Int64 => value.is_i64() || value.is_u64(),
        FieldType::Float => value.is_number(),
        FieldType::Bool => value.is_boolean(),
        FieldType::Geopoint => value.as_array().is_some_and(|items| {
            items.len() == 2 && items.iter().all(Value::is_number)
        }),
        FieldType::Object => value.is_object(),
        FieldType::ObjectArray => value
            .as_array()
            .is_some_and(|items| items.iter().all(Value::is_object)),
        FieldType::StringArray
        | FieldType::Int32Array
        | FieldType::Int64Array
        | FieldType::FloatArray
        | FieldType::BoolArray => {
            let element = scalar_field(field);
            value
                .as_array()
                .is_some_and(|items| items.iter().all(|item| matches_type(item, &element)))
        }
        FieldType::Auto | FieldType::StringStar => true,
    }
}

fn scalar_field(field: &Field) -> Field {
    let mut element = field.clone();
    element.field_type = field.field_type.element_type();
    element.num_dim = 0;
    element
}

fn try_coerce(value: &Value, field: &Field) -> Option<Value> {
    if field.is_vector() {
        return None;
    }
    match field.field_type {
        FieldType::String => match value {
            Value::Number(n) => Some(Value::String(n.to_string())),
            Value::Bool(b) => Some(Value::String(b.to_string())),
            _ => None,
        },
        FieldType::Int32 | FieldType::Int64 => match value {
            Value::String(s) => s.trim().parse::<i64>().ok().and_then(|v| {
                if field.field_type == FieldType::Int32 && i32::try_from(v).is_err() {
                    None
                } else {
                    Some(Value::Number(v.into()))
                }
            }),
            Value::Bool(b) => Some(Value::Number(i64::from(*b).into())),
            Value::Number(n) if n.is_f64() => {
                let v = n.as_f64()?.trunc() as i64;
                Some(Value::Number(v.into()))
            }
            _ => None,
        },
        FieldType::Float => match value {
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number),
            Value::Bool(b) => Number::from_f64(f64::from(u8::from(*b))).map(Value::Number),
            _ => None,
        },
        FieldType::Bool => match value {
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            Value::Number(n) => n.as_i64().and_then(|v| match v {
                0 => Some(Value::Bool(false)),
                1 => Some(Value::Bool(true)),
                _ => None,
            }),
            _ => None,
        },
        FieldType::StringArray
        | FieldType::Int32Array
        | FieldType::Int64Array
        | FieldType::FloatArray
        | FieldType::BoolArray => {
            let element = scalar_field(field);
            let items = match value {
                Value::Array(items) => items.clone(),
                // Scalar promoted to a one-element array before element
                // coercion.
                other => vec![other.clone()],
            };
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                if matches_type(&item, &element) {
                    out.push(item);
                } else {
                    out.push(try_coerce(&item, &element)?);
                }
            }
            Some(Value::Array(out))
        }
        FieldType::Geopoint | FieldType::Object | FieldType::ObjectArray => None,
        FieldType::Auto | FieldType::StringStar => Some(value.clone()),
    }
}

/// Validate the `id` key of an incoming document body against an optional
/// caller-supplied id.
pub fn resolve_doc_id(
    doc: &Map<String, Value>,
    argument_id: Option<&str>,
) -> Result<Option<String>, Error> {
    let body_id = match doc.get(ID_FIELD) {
        None => None,
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::String(_)) => {
            return Err(Error::BadRequest("document `id` cannot be empty".into()));
        }
        Some(_) => {
            return Err(Error::BadRequest("document `id` must be a string".into()));
        }
    };
    match (body_id, argument_id) {
        (Some(body), Some(arg)) if body != arg => Err(Error::BadRequest(format!(
            "document `id` `{body}` does not match the request id `{arg}`"
        ))),
        (Some(body), _) => Ok(Some(body)),
        (None, Some(arg)) => Ok(Some(arg.to_string())),
        (None, None) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema(fields: Vec<Field>) -> Schema {
        Schema::new(fields, String::new(), vec![], vec![], false).unwrap()
    }

    fn doc(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn missing_required_field_rejected() {
        let s = schema(vec![Field::new("title", FieldType::String)]);
        let mut d = doc(json!({"points": 1}));
        let err = validate_document(&mut d, &s, DirtyValues::CoerceOrReject).unwrap_err();
        assert!(matches!(err, Invalid::Missing { field } if field == "title"));
    }

    #[test]
    fn optional_field_may_be_absent() {
        let mut title = Field::new("title", FieldType::String);
        title.optional = true;
        let s = schema(vec![title]);
        let mut d = doc(json!({}));
        assert!(validate_document(&mut d, &s, DirtyValues::Reject).is_ok());
    }

    #[test]
    fn reject_policy_errors_on_mismatch() {
        let s = schema(vec![Field::new("points", FieldType::Int32)]);
        let mut d = doc(json!({"points": "100"}));
        let err = validate_document(&mut d, &s, DirtyValues::Reject).unwrap_err();
        assert!(matches!(err, Invalid::Type { field, .. } if field == "points"));
    }

    #[test]
    fn coerce_string_to_int() {
        let s = schema(vec![Field::new("points", FieldType::Int32)]);
        let mut d = doc(json!({"points": "100"}));
        validate_document(&mut d, &s, DirtyValues::CoerceOrReject).unwrap();
        assert_eq!(d["points"], json!(100));
    }

    #[test]
    fn coerce_number_to_string() {
        let s = schema(vec![Field::new("title", FieldType::String)]);
        let mut d = doc(json!({"title": 42}));
        validate_document(&mut d, &s, DirtyValues::CoerceOrReject).unwrap();
        assert_eq!(d["title"], json!("42"));
    }

    #[test]
    fn uncoercible_string_to_int_rejected() {
        let s = schema(vec![Field::new("points", FieldType::Int32)]);
        let mut d = doc(json!({"points": "red"}));
        let err = validate_document(&mut d, &s, DirtyValues::CoerceOrReject).unwrap_err();
        assert!(matches!(err, Invalid::Type { .. }));
    }

    #[test]
    fn coerce_or_drop_drops_bad_values() {
        let s = schema(vec![Field::new("points", FieldType::Int32)]);
        let mut d = doc(json!({"points": "red"}));
        validate_document(&mut d, &s, DirtyValues::CoerceOrDrop).unwrap();
        assert!(!d.contains_key("points"));
    }

    #[test]
    fn int32_range_enforced() {
        let s = schema(vec![Field::new("points", FieldType::Int32)]);
        let mut d = doc(json!({"points": 3_000_000_000i64}));
        let err = validate_document(&mut d, &s, DirtyValues::Reject).unwrap_err();
        assert!(matches!(err, Invalid::Type { .. }));
    }

    #[test]
    fn array_elements_coerced() {
        let s = schema(vec![Field::new("tags", FieldType::StringArray)]);
        let mut d = doc(json!({"tags": ["a", 2]}));
        validate_document(&mut d, &s, DirtyValues::CoerceOrReject).unwrap();
        assert_eq!(d["tags"], json!(["a", "2"]));
    }

    #[test]
    fn geopoint_shape_checked() {
        let s = schema(vec![Field::new("loc", FieldType::Geopoint)]);
        let mut ok = doc(json!({"loc": [48.1, 2.3]}));
        assert!(validate_document(&mut ok, &s, DirtyValues::Reject).is_ok());
        let mut bad = doc(json!({"loc": [48.1]}));
        assert!(validate_document(&mut bad, &s, DirtyValues::Reject).is_err());
    }

    #[test]
    fn vector_dims_checked() {
        let mut emb = Field::new("emb", FieldType::FloatArray);
        emb.num_dim = 3;
        let s = schema(vec![emb]);
        let mut bad = doc(json!({"emb": [0.1, 0.2]}));
        assert!(validate_document(&mut bad, &s, DirtyValues::CoerceOrReject).is_err());
    }

    #[test]
    fn dynamic_field_discovered_with_detected_type() {
        let s = schema(vec![Field::new(".*_facet", FieldType::StringStar)]);
        let d = doc(json!({"color_facet": "red"}));
        let added = detect_new_fields(&d, &s);
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].name, "color_facet");
        assert_eq!(added[0].field_type, FieldType::String);
        assert!(added[0].optional);
    }

    #[test]
    fn fallback_auto_infers_types() {
        let s = schema(vec![Field::new(".*", FieldType::Auto)]);
        let d = doc(json!({"count": 3, "names": ["a"]}));
        let mut added = detect_new_fields(&d, &s);
        added.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(added[0].field_type, FieldType::Int64);
        assert_eq!(added[1].field_type, FieldType::StringArray);
    }

    #[test]
    fn string_star_fallback_stringifies() {
        let s = schema(vec![Field::new(".*", FieldType::StringStar)]);
        let d = doc(json!({"count": 3, "names": [1, 2]}));
        let added = detect_new_fields(&d, &s);
        assert!(added.iter().all(|f| f.field_type.is_string_kind()));
    }

    #[test]
    fn undeclared_without_rules_ignored() {
        let s = schema(vec![Field::new("title", FieldType::String)]);
        let d = doc(json!({"title": "x", "rogue": 1}));
        assert!(detect_new_fields(&d, &s).is_empty());
    }

    #[test]
    fn doc_id_mismatch_rejected() {
        let d = doc(json!({"id": "1"}));
        assert!(resolve_doc_id(&d, Some("2")).is_err());
        assert_eq!(resolve_doc_id(&d, Some("1")).unwrap(), Some("1".into()));
        assert_eq!(resolve_doc_id(&d, None).unwrap(), Some("1".into()));
    }

    #[test]
    fn non_string_id_rejected() {
        let d = doc(json!({"id": 7}));
        assert!(resolve_doc_id(&d, None).is_err());
    }
}

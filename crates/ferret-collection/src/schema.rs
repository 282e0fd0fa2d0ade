use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Reserved document key; always present, never declared.
pub const ID_FIELD: &str = "id";

/// Name of the catch-all field governing undeclared keys.
pub const FALLBACK_FIELD: &str = ".*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    #[serde(rename = "string")]
    String,
    #[serde(rename = "int32")]
    Int32,
    #[serde(rename = "int64")]
    Int64,
    #[serde(rename = "float")]
    Float,
    #[serde(rename = "bool")]
    Bool,
    #[serde(rename = "geopoint")]
    Geopoint,
    #[serde(rename = "object")]
    Object,
    #[serde(rename = "string[]")]
    StringArray,
    #[serde(rename = "int32[]")]
    Int32Array,
    #[serde(rename = "int64[]")]
    Int64Array,
    #[serde(rename = "float[]")]
    FloatArray,
    #[serde(rename = "bool[]")]
    BoolArray,
    #[serde(rename = "object[]")]
    ObjectArray,
    /// Dynamic: concrete type inferred from the first matching document.
    #[serde(rename = "auto")]
    Auto,
    /// Dynamic: scalars become `string`, arrays become `string[]`.
    #[serde(rename = "string*")]
    StringStar,
}

impl FieldType {
    pub fn is_array(self) -> bool {
        matches!(
            self,
            FieldType::StringArray
                | FieldType::Int32Array
                | FieldType::Int64Array
                | FieldType::FloatArray
                | FieldType::BoolArray
                | FieldType::ObjectArray
        )
    }

    pub fn is_string_kind(self) -> bool {
        matches!(self, FieldType::String | FieldType::StringArray)
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            FieldType::Int32
                | FieldType::Int64
                | FieldType::Float
                | FieldType::Int32Array
                | FieldType::Int64Array
                | FieldType::FloatArray
        )
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            FieldType::Int32 | FieldType::Int64 | FieldType::Int32Array | FieldType::Int64Array
        )
    }

    pub fn is_object_kind(self) -> bool {
        matches!(self, FieldType::Object | FieldType::ObjectArray)
    }

    pub fn is_dynamic(self) -> bool {
        matches!(self, FieldType::Auto | FieldType::StringStar)
    }

    /// Scalar counterpart of an array type (identity for scalars).
    pub fn element_type(self) -> FieldType {
        match self {
            FieldType::StringArray => FieldType::String,
            FieldType::Int32Array => FieldType::Int32,
            FieldType::Int64Array => FieldType::Int64,
            FieldType::FloatArray => FieldType::Float,
            FieldType::BoolArray => FieldType::Bool,
            FieldType::ObjectArray => FieldType::Object,
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_name: String,
}

/// `embed.from` sources feed the named model; the output lands in this
/// field's vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedConfig {
    pub from: Vec<String>,
    pub model_config: ModelConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub facet: bool,
    #[serde(default = "default_true")]
    pub index: bool,
    /// `None` resolves per type: numeric and bool sort by default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<bool>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub infix: bool,
    #[serde(default)]
    pub stem: bool,
    #[serde(default = "default_true")]
    pub store: bool,
    #[serde(default)]
    pub range_index: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub locale: String,
    /// Vector dimension; non-zero turns a `float[]` into a vector field.
    #[serde(default)]
    pub num_dim: usize,
    #[serde(default = "default_vec_dist", skip_serializing_if = "is_default_vec_dist")]
    pub vec_dist: String,
    /// Outgoing join target, `collection.field`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embed: Option<EmbedConfig>,
}

fn default_true() -> bool {
    true
}

fn default_vec_dist() -> String {
    "cosine".to_string()
}

fn is_default_vec_dist(v: &str) -> bool {
    v == "cosine"
}

impl Field {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            facet: false,
            index: true,
            sort: None,
            optional: false,
            infix: false,
            stem: false,
            store: true,
            range_index: false,
            locale: String::new(),
            num_dim: 0,
            vec_dist: default_vec_dist(),
            reference: String::new(),
            embed: None,
        }
    }

    pub fn is_sortable(&self) -> bool {
        self.sort
            .unwrap_or(self.field_type.is_numeric() || self.field_type == FieldType::Bool)
    }

    pub fn is_vector(&self) -> bool {
        self.field_type == FieldType::FloatArray && self.num_dim > 0
    }

    pub fn is_nested(&self) -> bool {
        self.field_type.is_object_kind() || self.name.contains('.')
    }

    pub fn is_reference(&self) -> bool {
        !self.reference.is_empty()
    }

    /// Dynamic fields match by name pattern and expand on first use.
    pub fn is_dynamic(&self) -> bool {
        self.name == FALLBACK_FIELD
            || self.name.contains('*')
            || (self.field_type.is_dynamic() && self.name.contains(['^', '$', '+', '(', '[']))
    }

    /// `collection.field` halves of a reference target.
    pub fn reference_parts(&self) -> Result<(&str, &str), Error> {
        self.reference.split_once('.').ok_or_else(|| {
            Error::BadRequest(format!(
                "reference `{}` must be of the form `collection.field`",
                self.reference
            ))
        })
    }

    /// Hidden helper column carrying resolved seq ids for a reference
    /// field.
    pub fn sequence_helper_name(&self) -> String {
        format!("{}_sequence_id", self.name)
    }
}

/// Infer the narrowest field type for a JSON value. `None` for nulls and
/// empty arrays — detection waits for a value that shows its shape.
pub fn detect_type(value: &Value, string_star: bool) -> Option<FieldType> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some(if string_star {
            FieldType::String
        } else {
            FieldType::Bool
        }),
        Value::Number(n) => Some(if string_star {
            FieldType::String
        } else if n.is_f64() {
            FieldType::Float
        } else {
            FieldType::Int64
        }),
        Value::String(_) => Some(FieldType::String),
        Value::Object(_) => Some(FieldType::Object),
        Value::Array(items) => {
            let element = items.iter().find_map(|v| detect_type(v, string_star))?;
            Some(match element {
                FieldType::String => FieldType::StringArray,
                FieldType::Int32 | FieldType::Int64 => FieldType::Int64Array,
                FieldType::Float => FieldType::FloatArray,
                FieldType::Bool => FieldType::BoolArray,
                FieldType::Object => FieldType::ObjectArray,
                other => other,
            })
        }
    }
}

/// The collection's live schema: concrete fields in declaration order,
/// dynamic patterns, and the optional `.*` fallback.
#[derive(Debug, Clone)]
pub struct Schema {
    fields: Vec<Field>,
    by_name: HashMap<String, usize>,
    dynamic: Vec<(Regex, Field)>,
    fallback: Option<Field>,
    pub default_sorting_field: String,
    pub symbols_to_index: Vec<char>,
    pub token_separators: Vec<char>,
    pub enable_nested_fields: bool,
}

impl Schema {
    pub fn new(
        declared: Vec<Field>,
        default_sorting_field: String,
        symbols_to_index: Vec<char>,
        token_separators: Vec<char>,
        enable_nested_fields: bool,
    ) -> Result<Self, Error> {
        let mut schema = Self {
            fields: Vec::new(),
            by_name: HashMap::new(),
            dynamic: Vec::new(),
            fallback: None,
            default_sorting_field,
            symbols_to_index,
            token_separators,
            enable_nested_fields,
        };

        for field in declared {
            schema.declare(field)?;
        }

        if !schema.default_sorting_field.is_empty() {
            let name = schema.default_sorting_field.clone();
            let field = schema.field(&name).ok_or_else(|| {
                Error::BadRequest(format!(
                    "default sorting field `{name}` is not a declared field"
                ))
            })?;
            if !field.field_type.is_numeric() || field.field_type.is_array() {
                return Err(Error::BadRequest(format!(
                    "default sorting field `{name}` must be a scalar numeric field"
                )));
            }
            if field.optional {
                return Err(Error::BadRequest(format!(
                    "default sorting field `{name}` cannot be optional"
                )));
            }
        }

        Ok(schema)
    }

    /// Route a declared field to the concrete list, the dynamic patterns,
    /// or the fallback slot.
    pub fn declare(&mut self, field: Field) -> Result<(), Error> {
        if field.name == ID_FIELD {
            return Err(Error::BadRequest(
                "`id` is a reserved field and cannot be declared".into(),
            ));
        }
        if field.name == FALLBACK_FIELD {
            if self.fallback.is_some() {
                return Err(Error::BadRequest(
                    "schema can contain at most one `.*` field".into(),
                ));
            }
            self.fallback = Some(field);
            return Ok(());
        }
        if field.is_dynamic() {
            let pattern = Regex::new(&format!("^{}$", field.name)).map_err(|e| {
                Error::BadRequest(format!("invalid dynamic field pattern `{}`: {e}", field.name))
            })?;
            self.dynamic.push((pattern, field));
            return Ok(());
        }
        if field.field_type.is_dynamic() {
            return Err(Error::BadRequest(format!(
                "field `{}` with type `auto`/`string*` must use a pattern name",
                field.name
            )));
        }
        self.insert_concrete(field);
        Ok(())
    }

    fn insert_concrete(&mut self, field: Field) {
        match self.by_name.get(&field.name) {
            Some(&at) => self.fields[at] = field,
            None => {
                self.by_name.insert(field.name.clone(), self.fields.len());
                self.fields.push(field);
            }
        }
    }

    /// Add a concrete field discovered from a document.
    pub fn add_discovered(&mut self, field: Field) {
        self.insert_concrete(field);
    }

    pub fn remove_field(&mut self, name: &str) -> Option<Field> {
        let at = self.by_name.remove(name)?;
        let removed = self.fields.remove(at);
        for index in self.by_name.values_mut() {
            if *index > at {
                *index -= 1;
            }
        }
        Some(removed)
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.by_name.get(name).map(|&at| &self.fields[at])
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn fallback(&self) -> Option<&Field> {
        self.fallback.as_ref()
    }

    pub fn set_fallback(&mut self, field: Option<Field>) {
        self.fallback = field;
    }

    pub fn dynamic_patterns(&self) -> impl Iterator<Item = &Field> {
        self.dynamic.iter().map(|(_, f)| f)
    }

    /// Prototype for an undeclared key: first matching dynamic pattern,
    /// else the `.*` fallback.
    pub fn match_undeclared(&self, name: &str) -> Option<&Field> {
        self.dynamic
            .iter()
            .find(|(pattern, _)| pattern.is_match(name))
            .map(|(_, field)| field)
            .or(self.fallback.as_ref())
    }

    /// Every declared field, dynamic patterns and fallback included, for
    /// persistence.
    pub fn all_declared(&self) -> Vec<Field> {
        let mut all = self.fields.clone();
        all.extend(self.dynamic.iter().map(|(_, f)| f.clone()));
        all.extend(self.fallback.clone());
        all
    }

    pub fn reference_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.is_reference())
    }

    pub fn embed_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.embed.is_some())
    }

    /// Expand a `query_by`/`facet_by` entry that may end in `*`.
    pub fn expand_wildcard(&self, pattern: &str) -> Vec<String> {
        match pattern.strip_suffix('*') {
            Some(prefix) => self
                .fields
                .iter()
                .filter(|f| f.name.starts_with(prefix))
                .map(|f| f.name.clone())
                .collect(),
            None => vec![pattern.to_string()],
        }
    }
}

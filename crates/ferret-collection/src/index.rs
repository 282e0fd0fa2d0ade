use std::collections::HashMap;

use roaring::RoaringBitmap;
use serde_json::{Map, Value};

use ferret_index::{
    GeoColumn, NumColumn, StrColumn, TermIndex, Tokenizer, VectorColumn, ordered_f64,
};
use ferret_query::{Comparator, Condition, FilterNode, LogicalOp};

use crate::document::flatten;
use crate::error::Error;
use crate::schema::{Field, FieldType, Schema};

/// Gap inserted between array elements' token positions so a proximity
/// window never spans two elements.
const ARRAY_POSITION_GAP: u16 = ferret_index::MATCH_WINDOW_SIZE;

/// The in-memory index of one collection: token postings per string field,
/// typed columns for filtering/sorting/faceting, geo points and vectors.
pub struct Index {
    tokenizer: Tokenizer,
    terms: HashMap<String, TermIndex>,
    nums: HashMap<String, NumColumn>,
    strs: HashMap<String, StrColumn>,
    geos: HashMap<String, GeoColumn>,
    vectors: HashMap<String, VectorColumn>,
    seq_ids: RoaringBitmap,
}

impl Index {
    pub fn new(schema: &Schema) -> Self {
        Self {
            tokenizer: Tokenizer::new(&schema.symbols_to_index, &schema.token_separators),
            terms: HashMap::new(),
            nums: HashMap::new(),
            strs: HashMap::new(),
            geos: HashMap::new(),
            vectors: HashMap::new(),
            seq_ids: RoaringBitmap::new(),
        }
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn num_documents(&self) -> u64 {
        self.seq_ids.len()
    }

    pub fn seq_ids(&self) -> &RoaringBitmap {
        &self.seq_ids
    }

    pub fn contains(&self, seq_id: u32) -> bool {
        self.seq_ids.contains(seq_id)
    }

    pub fn term_index(&self, field: &str) -> Option<&TermIndex> {
        self.terms.get(field)
    }

    pub fn num_column(&self, field: &str) -> Option<&NumColumn> {
        self.nums.get(field)
    }

    pub fn str_column(&self, field: &str) -> Option<&StrColumn> {
        self.strs.get(field)
    }

    pub fn geo_column(&self, field: &str) -> Option<&GeoColumn> {
        self.geos.get(field)
    }

    pub fn vector_column(&self, field: &str) -> Option<&VectorColumn> {
        self.vectors.get(field)
    }

    // ── Document add / remove ───────────────────────────────────

    /// Index every schema-known leaf of the document.
    pub fn index_document(
        &mut self,
        schema: &Schema,
        seq_id: u32,
        doc: &Map<String, Value>,
    ) -> Result<(), Error> {
        for (path, value) in flatten(doc) {
            self.index_leaf(schema, seq_id, &path, &value)?;
        }
        self.seq_ids.insert(seq_id);
        Ok(())
    }

    pub fn remove_document(&mut self, schema: &Schema, seq_id: u32, doc: &Map<String, Value>) {
        for (path, value) in flatten(doc) {
            self.remove_leaf(schema, seq_id, &path, &value);
        }
        self.seq_ids.remove(seq_id);
    }

    fn index_leaf(
        &mut self,
        schema: &Schema,
        seq_id: u32,
        path: &str,
        value: &Value,
    ) -> Result<(), Error> {
        let Some(field) = leaf_field(schema, path) else {
            return Ok(());
        };
        if !field.index || value.is_null() {
            return Ok(());
        }

        if field.is_vector() {
            let vector = parse_vector(value, &field.name)?;
            self.vectors
                .entry(path.to_string())
                .or_insert_with(|| VectorColumn::new(field.num_dim))
                .add(seq_id, vector)?;
            return Ok(());
        }

        match field.field_type.element_type() {
            FieldType::String => {
                let values = string_values(value);
                let term_index = self.terms.entry(path.to_string()).or_default();
                let mut base: u16 = 0;
                for item in &values {
                    let tokens = self.tokenizer.tokenize(item);
                    let mut last = base;
                    for token in &tokens {
                        let position = base + token.position;
                        term_index.add(&token.text, seq_id, position);
                        last = position;
                    }
                    base = last + ARRAY_POSITION_GAP;
                }
                let str_column = self.strs.entry(path.to_string()).or_default();
                for item in &values {
                    str_column.add(seq_id, item);
                }
            }
            FieldType::Int32 | FieldType::Int64 => {
                let column = self.nums.entry(path.to_string()).or_default();
                for v in integer_values(value) {
                    column.add(seq_id, v);
                }
                if field.facet {
                    let str_column = self.strs.entry(path.to_string()).or_default();
                    for v in integer_values(value) {
                        str_column.add(seq_id, &v.to_string());
                    }
                }
            }
            FieldType::Float => {
                let column = self.nums.entry(path.to_string()).or_default();
                for v in float_values(value) {
                    column.add(seq_id, ordered_f64(v));
                }
                if field.facet {
                    let str_column = self.strs.entry(path.to_string()).or_default();
                    for v in float_values(value) {
                        str_column.add(seq_id, &format_float(v));
                    }
                }
            }
            FieldType::Bool => {
                let column = self.nums.entry(path.to_string()).or_default();
                for v in bool_values(value) {
                    column.add(seq_id, i64::from(v));
                }
                if field.facet {
                    let str_column = self.strs.entry(path.to_string()).or_default();
                    for v in bool_values(value) {
                        str_column.add(seq_id, if v { "true" } else { "false" });
                    }
                }
            }
            FieldType::Geopoint => {
                if let Some((lat, lng)) = parse_geopoint(value) {
                    self.geos
                        .entry(path.to_string())
                        .or_default()
                        .add(seq_id, lat, lng);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn remove_leaf(&mut self, schema: &Schema, seq_id: u32, path: &str, value: &Value) {
        let Some(field) = leaf_field(schema, path) else {
            return;
        };
        if !field.index {
            return;
        }
        if field.is_vector() {
            if let Some(column) = self.vectors.get_mut(path) {
                column.remove(seq_id);
            }
            return;
        }
        match field.field_type.element_type() {
            FieldType::String => {
                if let Some(term_index) = self.terms.get_mut(path) {
                    for item in string_values(value) {
                        for token in self.tokenizer.terms(&item) {
                            term_index.remove_doc(&token, seq_id);
                        }
                    }
                }
                if let Some(column) = self.strs.get_mut(path) {
                    column.remove(seq_id);
                }
            }
            FieldType::Int32 | FieldType::Int64 | FieldType::Float | FieldType::Bool => {
                if let Some(column) = self.nums.get_mut(path) {
                    column.remove(seq_id);
                }
                if let Some(column) = self.strs.get_mut(path) {
                    column.remove(seq_id);
                }
            }
            FieldType::Geopoint => {
                if let Some(column) = self.geos.get_mut(path) {
                    column.remove(seq_id);
                }
            }
            _ => {}
        }
    }

    // ── Filter evaluation ───────────────────────────────────────

    /// Evaluate a filter tree to the set of matching live documents.
    /// Reference nodes must be resolved (rewritten) by the caller first.
    pub fn eval_filter(&self, node: &FilterNode, schema: &Schema) -> Result<RoaringBitmap, Error> {
        match node {
            FilterNode::Group { logical, children } => {
                let mut iter = children.iter();
                let first = iter
                    .next()
                    .ok_or_else(|| Error::BadRequest("empty filter group".into()))?;
                let mut acc = self.eval_filter(first, schema)?;
                for child in iter {
                    let rhs = self.eval_filter(child, schema)?;
                    match logical {
                        LogicalOp::And => acc &= rhs,
                        LogicalOp::Or => acc |= rhs,
                    }
                }
                Ok(acc)
            }
            FilterNode::Condition(cond) => self.eval_condition(cond, schema),
            FilterNode::Reference { collection, .. } => Err(Error::BadRequest(format!(
                "unresolved reference filter on collection `{collection}`"
            ))),
        }
    }

    fn eval_condition(&self, cond: &Condition, schema: &Schema) -> Result<RoaringBitmap, Error> {
        let field = leaf_field(schema, &cond.field).ok_or_else(|| {
            Error::NotFound(format!("could not find a filter field named `{}`", cond.field))
        })?;
        if !field.index {
            return Err(Error::BadRequest(format!(
                "field `{}` is not indexed and cannot be filtered on",
                cond.field
            )));
        }

        if let Comparator::GeoRadius {
            lat,
            lng,
            radius_meters,
        } = cond.comparator
        {
            if field.field_type != FieldType::Geopoint {
                return Err(Error::BadRequest(format!(
                    "field `{}` is not a geopoint",
                    cond.field
                )));
            }
            return Ok(self
                .geos
                .get(&cond.field)
                .map(|col| col.within_radius(lat, lng, radius_meters))
                .unwrap_or_default());
        }

        match field.field_type.element_type() {
            FieldType::String => self.eval_string_condition(cond),
            FieldType::Int32 | FieldType::Int64 => {
                self.eval_num_condition(cond, |raw| {
                    raw.trim()
                        .parse::<i64>()
                        .map_err(|_| bad_value(&cond.field, raw))
                })
            }
            FieldType::Float => self.eval_num_condition(cond, |raw| {
                raw.trim()
                    .parse::<f64>()
                    .map(ordered_f64)
                    .map_err(|_| bad_value(&cond.field, raw))
            }),
            FieldType::Bool => self.eval_num_condition(cond, |raw| {
                match raw.trim().to_ascii_lowercase().as_str() {
                    "true" => Ok(1),
                    "false" => Ok(0),
                    _ => Err(bad_value(&cond.field, raw)),
                }
            }),
            other => Err(Error::BadRequest(format!(
                "field `{}` of type `{other:?}` cannot be filtered on",
                cond.field
            ))),
        }
    }

    fn eval_string_condition(&self, cond: &Condition) -> Result<RoaringBitmap, Error> {
        let strs = self.strs.get(&cond.field);
        match cond.comparator {
            Comparator::Eq | Comparator::Ne => {
                let mut matched = RoaringBitmap::new();
                if let Some(column) = strs {
                    for value in &cond.values {
                        matched |= column.eq(value);
                    }
                }
                if cond.comparator == Comparator::Ne {
                    Ok(&self.seq_ids - matched)
                } else {
                    Ok(matched)
                }
            }
            Comparator::Contains => {
                // Token match: every token of the value must hit.
                let terms = self.terms.get(&cond.field);
                let mut matched = RoaringBitmap::new();
                for value in &cond.values {
                    let tokens = self.tokenizer.terms(value);
                    if tokens.is_empty() {
                        continue;
                    }
                    let mut value_docs: Option<RoaringBitmap> = None;
                    for token in &tokens {
                        let docs = terms
                            .and_then(|t| t.postings(token))
                            .map(|p| p.doc_ids())
                            .unwrap_or_default();
                        value_docs = Some(match value_docs {
                            Some(acc) => acc & docs,
                            None => docs,
                        });
                    }
                    matched |= value_docs.unwrap_or_default();
                }
                Ok(matched)
            }
            _ => Err(Error::BadRequest(format!(
                "string field `{}` supports only `:`, `:=` and `:!=` filters",
                cond.field
            ))),
        }
    }

    fn eval_num_condition(
        &self,
        cond: &Condition,
        parse: impl Fn(&str) -> Result<i64, Error>,
    ) -> Result<RoaringBitmap, Error> {
        let Some(column) = self.nums.get(&cond.field) else {
            return Ok(RoaringBitmap::new());
        };
        let one = |raw: &String| parse(raw);
        match cond.comparator {
            Comparator::Eq | Comparator::Contains | Comparator::Ne => {
                let mut matched = RoaringBitmap::new();
                for raw in &cond.values {
                    matched |= column.eq(one(raw)?);
                }
                if cond.comparator == Comparator::Ne {
                    Ok(&self.seq_ids - matched)
                } else {
                    Ok(matched)
                }
            }
            Comparator::Gt => Ok(column.gt(one(&cond.values[0])?)),
            Comparator::Gte => Ok(column.gte(one(&cond.values[0])?)),
            Comparator::Lt => Ok(column.lt(one(&cond.values[0])?)),
            Comparator::Lte => Ok(column.lte(one(&cond.values[0])?)),
            Comparator::Between => {
                let min = one(&cond.values[0])?;
                let max = one(&cond.values[1])?;
                Ok(column.range(min, max))
            }
            Comparator::GeoRadius { .. } => unreachable!("geo handled before typing"),
        }
    }
}

/// Schema field for a flattened leaf path. Reference helper columns
/// resolve to a synthetic int64 array field.
fn leaf_field<'a>(schema: &'a Schema, path: &str) -> Option<&'a Field> {
    if let Some(field) = schema.field(path) {
        return Some(field);
    }
    if let Some(base) = path.strip_suffix("_sequence_id") {
        if schema.field(base).is_some_and(Field::is_reference) {
            return Some(helper_field());
        }
    }
    None
}

fn helper_field() -> &'static Field {
    use std::sync::OnceLock;
    static HELPER: OnceLock<Field> = OnceLock::new();
    HELPER.get_or_init(|| {
        let mut f = Field::new("_sequence_id", FieldType::Int64Array);
        f.optional = true;
        f
    })
}

fn bad_value(field: &str, raw: &str) -> Error {
    Error::BadRequest(format!("value `{raw}` is not valid for field `{field}`"))
}

fn string_values(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn integer_values(value: &Value) -> Vec<i64> {
    match value {
        Value::Number(n) => n.as_i64().into_iter().collect(),
        Value::Array(items) => items
            .iter()
            .flat_map(|item| match item {
                Value::Number(n) => n.as_i64(),
                // `[object_index, seq]` helper pairs index their seq half.
                Value::Array(pair) if pair.len() == 2 => pair[1].as_i64(),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn float_values(value: &Value) -> Vec<f64> {
    match value {
        Value::Number(n) => n.as_f64().into_iter().collect(),
        Value::Array(items) => items.iter().filter_map(Value::as_f64).collect(),
        _ => Vec::new(),
    }
}

fn bool_values(value: &Value) -> Vec<bool> {
    match value {
        Value::Bool(b) => vec![*b],
        Value::Array(items) => items.iter().filter_map(Value::as_bool).collect(),
        _ => Vec::new(),
    }
}

fn parse_geopoint(value: &Value) -> Option<(f64, f64)> {
    let items = value.as_array()?;
    if items.len() != 2 {
        return None;
    }
    Some((items[0].as_f64()?, items[1].as_f64()?))
}

fn parse_vector(value: &Value, field: &str) -> Result<Vec<f32>, Error> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .map(|v| v.as_f64().map(|f| f as f32))
                .collect::<Option<Vec<f32>>>()
        })
        .ok_or_else(|| Error::BadRequest(format!("field `{field}` must be a float array")))?
        .ok_or_else(|| Error::BadRequest(format!("field `{field}` must contain only numbers")))
}

/// Canonical facet rendering for floats; trims the trailing `.0` noise
/// serde_json would not produce anyway.
fn format_float(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferret_query::parse_filter;
    use serde_json::json;

    fn schema() -> Schema {
        let mut brand = Field::new("brand", FieldType::String);
        brand.facet = true;
        let mut loc = Field::new("loc", FieldType::Geopoint);
        loc.optional = true;
        let mut tags = Field::new("tags", FieldType::StringArray);
        tags.optional = true;
        let mut active = Field::new("active", FieldType::Bool);
        active.optional = true;
        let mut price = Field::new("price", FieldType::Float);
        price.optional = true;
        Schema::new(
            vec![
                Field::new("title", FieldType::String),
                Field::new("points", FieldType::Int32),
                brand,
                tags,
                active,
                price,
                loc,
            ],
            String::new(),
            vec![],
            vec![],
            false,
        )
        .unwrap()
    }

    fn index_with_docs(docs: &[(u32, Value)]) -> (Index, Schema) {
        let schema = schema();
        let mut index = Index::new(&schema);
        for (seq, doc) in docs {
            index
                .index_document(&schema, *seq, doc.as_object().unwrap())
                .unwrap();
        }
        (index, schema)
    }

    fn sample() -> Vec<(u32, Value)> {
        vec![
            (
                1,
                json!({"title": "Denim jeans", "points": 100, "brand": "Levis", "price": 49.5}),
            ),
            (
                2,
                json!({"title": "Denim jacket", "points": 80, "brand": "Levis", "active": true}),
            ),
            (
                3,
                json!({"title": "Cotton shirt", "points": 60, "brand": "Spykar",
                       "tags": ["sale", "summer"], "loc": [48.85, 2.35]}),
            ),
        ]
    }

    #[test]
    fn token_postings_populated() {
        let (index, _) = index_with_docs(&sample());
        let postings = index.term_index("title").unwrap().postings("denim").unwrap();
        assert_eq!(postings.num_docs(), 2);
        assert!(postings.contains(1));
        assert!(postings.contains(2));
    }

    #[test]
    fn numeric_filters() {
        let (index, schema) = index_with_docs(&sample());
        let node = parse_filter("points:>70").unwrap();
        let matched = index.eval_filter(&node, &schema).unwrap();
        assert_eq!(matched.iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn float_filters_use_ordered_encoding() {
        let (index, schema) = index_with_docs(&sample());
        let node = parse_filter("price:<50.0").unwrap();
        let matched = index.eval_filter(&node, &schema).unwrap();
        assert_eq!(matched.iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn string_exact_and_token_filters() {
        let (index, schema) = index_with_docs(&sample());
        let exact = index
            .eval_filter(&parse_filter("brand:=Levis").unwrap(), &schema)
            .unwrap();
        assert_eq!(exact.len(), 2);

        let token = index
            .eval_filter(&parse_filter("title:denim").unwrap(), &schema)
            .unwrap();
        assert_eq!(token.len(), 2);

        let ne = index
            .eval_filter(&parse_filter("brand:!=Levis").unwrap(), &schema)
            .unwrap();
        assert_eq!(ne.iter().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn bool_and_array_filters() {
        let (index, schema) = index_with_docs(&sample());
        let active = index
            .eval_filter(&parse_filter("active:true").unwrap(), &schema)
            .unwrap();
        assert_eq!(active.iter().collect::<Vec<_>>(), vec![2]);

        let tagged = index
            .eval_filter(&parse_filter("tags:=sale").unwrap(), &schema)
            .unwrap();
        assert_eq!(tagged.iter().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn and_or_composition() {
        let (index, schema) = index_with_docs(&sample());
        let node = parse_filter("brand:=Levis && points:>90").unwrap();
        let matched = index.eval_filter(&node, &schema).unwrap();
        assert_eq!(matched.iter().collect::<Vec<_>>(), vec![1]);

        let node = parse_filter("points:>90 || brand:=Spykar").unwrap();
        let matched = index.eval_filter(&node, &schema).unwrap();
        assert_eq!(matched.iter().collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn geo_radius_filter() {
        let (index, schema) = index_with_docs(&sample());
        let node = parse_filter("loc:(48.86, 2.35, 5 km)").unwrap();
        let matched = index.eval_filter(&node, &schema).unwrap();
        assert_eq!(matched.iter().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn unknown_filter_field_is_not_found() {
        let (index, schema) = index_with_docs(&sample());
        let err = index
            .eval_filter(&parse_filter("ghost:=1").unwrap(), &schema)
            .unwrap_err();
        assert_eq!(err.http_code(), 404);
    }

    #[test]
    fn remove_document_clears_postings_and_columns() {
        let (mut index, schema) = index_with_docs(&sample());
        let doc = sample()[0].1.as_object().cloned().unwrap();
        index.remove_document(&schema, 1, &doc);

        assert!(!index.contains(1));
        let postings = index.term_index("title").unwrap().postings("denim").unwrap();
        assert!(!postings.contains(1));
        let matched = index
            .eval_filter(&parse_filter("points:>90").unwrap(), &schema)
            .unwrap();
        assert!(matched.is_empty());
    }

    #[test]
    fn array_positions_leave_window_gaps() {
        let schema = schema();
        let mut index = Index::new(&schema);
        let doc = json!({"title": "x", "points": 1, "brand": "b",
                         "tags": ["alpha beta", "gamma"]});
        index
            .index_document(&schema, 9, doc.as_object().unwrap())
            .unwrap();
        let tags = index.term_index("tags").unwrap();
        let alpha = tags.postings("alpha").unwrap().positions(9)[0];
        let beta = tags.postings("beta").unwrap().positions(9)[0];
        let gamma = tags.postings("gamma").unwrap().positions(9)[0];
        assert_eq!(beta, alpha + 1);
        assert!(gamma >= beta + ARRAY_POSITION_GAP);
    }
}

use serde_json::Value;

use ferret_query::{
    FilterNode, InfixMode, LogicalOp, ParseError, SearchParams, SortClause, SortOrder, SortTarget,
    TextMatchType, VectorQuery, parse_filter, parse_sort, parse_vector_query,
};

use crate::curation::{Override, expand_synonyms};
use crate::error::Error;
use crate::schema::{FieldType, Schema};
use crate::topster::DEFAULT_TOPSTER_SIZE;

/// Weights are normalised into `0..=FIELD_MAX_WEIGHT`.
pub const FIELD_MAX_WEIGHT: u32 = 15;

/// Hard cap on sort clauses.
pub const MAX_SORT_CLAUSES: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct SearchField {
    pub name: String,
    pub weight: u32,
    pub prefix: bool,
    pub num_typos: u8,
    pub infix: InfixMode,
}

/// A sort clause with its target resolved against the schema.
#[derive(Debug, Clone)]
pub enum ResolvedSortBy {
    TextMatch { buckets: Option<usize> },
    NumField { field: String, is_float: bool },
    StrField { field: String },
    SeqId,
    Eval { filter: FilterNode },
    Geo { field: String, lat: f64, lng: f64 },
    VectorDistance,
    GroupFound,
}

#[derive(Debug, Clone)]
pub struct ResolvedSort {
    pub by: ResolvedSortBy,
    pub descending: bool,
}

/// One token of the parsed query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryToken {
    pub text: String,
    /// Part of a quoted phrase.
    pub phrase: usize,
}

/// A fully-resolved search: what the executor runs.
#[derive(Debug)]
pub struct SearchPlan {
    /// Token lists to match; index 0 is the user query, the rest are
    /// synonym variants. Empty for wildcard browsing.
    pub query_variants: Vec<Vec<String>>,
    /// Original query tokens before synonym expansion, for highlighting.
    pub raw_tokens: Vec<String>,
    /// Quoted phrases; hits must contain these tokens adjacently.
    pub phrases: Vec<Vec<String>>,
    /// Tokens with a leading `-`; matching documents are excluded.
    pub exclude_tokens: Vec<String>,
    pub is_wildcard: bool,

    pub fields: Vec<SearchField>,
    pub filter: Option<FilterNode>,
    pub sorts: Vec<ResolvedSort>,

    pub group_by: Vec<String>,
    pub group_limit: usize,
    pub group_missing_values: bool,

    pub page: usize,
    pub per_page: usize,
    pub offset: usize,
    /// Candidates retained before pagination.
    pub fetch_size: usize,

    /// `(doc_id, 1-based position)`, position-ascending.
    pub pinned: Vec<(String, usize)>,
    pub hidden: Vec<String>,
    pub filter_curated_hits: bool,
    pub override_metadata: Option<Value>,

    pub vector_query: Option<VectorQuery>,
    pub text_match_type: TextMatchType,

    pub params: SearchParams,
}

/// Build a [`SearchPlan`] from raw parameters against the live schema,
/// overrides and synonyms.
pub fn build_plan(
    params: &SearchParams,
    schema: &Schema,
    overrides: &[Override],
    synonyms: &[(Vec<String>, Vec<Vec<String>>)],
    now_ts: i64,
) -> Result<SearchPlan, Error> {
    let mut params = params.clone();

    // ── Overrides ───────────────────────────────────────────────
    let tokenizer =
        ferret_index::Tokenizer::new(&schema.symbols_to_index, &schema.token_separators);
    let normalized_query = tokenizer.terms(&params.q).join(" ");

    let mut pinned: Vec<(String, usize)> = parse_pinned(&params.pinned_hits)?;
    let mut hidden: Vec<String> = params.hidden_hits.clone();
    let mut override_filter: Option<String> = None;
    let mut override_sort: Option<String> = None;
    let mut override_metadata: Option<Value> = None;
    let mut filter_curated_hits = params.filter_curated_hits;
    let mut removed_tokens: Vec<String> = Vec::new();

    if params.enable_overrides {
        let param_pins = !pinned.is_empty();
        let param_hides = !hidden.is_empty();
        for ov in overrides {
            if !ov.matches(&normalized_query, &params.override_tags, now_ts) {
                continue;
            }
            // A rule filter participates in matching: the request's filter
            // must carry it.
            if let Some(rule_filter) = &ov.rule.filter_by {
                if !params.filter_by.contains(rule_filter.as_str()) {
                    continue;
                }
            }
            // Explicit pinned/hidden params take precedence over override
            // curation.
            if !param_pins {
                for add in &ov.add_hits {
                    if !pinned.iter().any(|(id, _)| id == &add.doc_id) {
                        pinned.push((add.doc_id.clone(), add.position));
                    }
                }
            }
            if !param_hides {
                for drop in &ov.drop_hits {
                    if !hidden.contains(&drop.doc_id) {
                        hidden.push(drop.doc_id.clone());
                    }
                }
            }
            if let Some(f) = &ov.filter_by {
                override_filter = Some(match override_filter {
                    Some(existing) => format!("({existing}) && ({f})"),
                    None => f.clone(),
                });
            }
            if override_sort.is_none() {
                override_sort = ov.sort_by.clone();
            }
            if let Some(replacement) = &ov.replace_query {
                params.q = replacement.clone();
            }
            if ov.remove_matched_tokens {
                if let Some(rule_query) = &ov.rule.query {
                    removed_tokens.extend(tokenizer.terms(rule_query));
                }
            }
            if override_metadata.is_none() {
                override_metadata = ov.metadata.clone();
            }
            if filter_curated_hits.is_none() {
                filter_curated_hits = ov.filter_curated_hits;
            }
            if ov.stop_processing {
                break;
            }
        }
    }
    pinned.sort_by_key(|&(_, position)| position);

    // ── Query tokens ────────────────────────────────────────────
    let (mut tokens, phrases, exclude_tokens) = tokenize_query(&params.q, &tokenizer);
    if !removed_tokens.is_empty() {
        tokens.retain(|t| !removed_tokens.contains(&t.text));
        // Removing every token turns the query into a browse.
        if tokens.is_empty() {
            params.q = "*".into();
        }
    }
    let is_wildcard = params.q == "*" || tokens.is_empty();

    let raw_tokens: Vec<String> = tokens.iter().map(|t| t.text.clone()).collect();
    let mut query_variants = if is_wildcard {
        Vec::new()
    } else {
        expand_synonyms(&raw_tokens, synonyms)
    };
    // Join-token fallback: each adjacent pair concatenated becomes an
    // extra variant, so "note book" can still hit "notebook".
    if params.split_join_tokens && raw_tokens.len() > 1 {
        for i in 0..raw_tokens.len() - 1 {
            let mut joined = Vec::with_capacity(raw_tokens.len() - 1);
            joined.extend_from_slice(&raw_tokens[..i]);
            joined.push(format!("{}{}", raw_tokens[i], raw_tokens[i + 1]));
            joined.extend_from_slice(&raw_tokens[i + 2..]);
            if !query_variants.contains(&joined) {
                query_variants.push(joined);
            }
        }
    }

    // ── Search fields ───────────────────────────────────────────
    let fields = resolve_fields(&params, schema, is_wildcard)?;

    // ── Filter ──────────────────────────────────────────────────
    let mut filter_exprs: Vec<String> = Vec::new();
    if !params.filter_by.trim().is_empty() {
        filter_exprs.push(params.filter_by.clone());
    }
    if let Some(ov) = override_filter {
        filter_exprs.push(ov);
    }
    let filter = match filter_exprs.len() {
        0 => None,
        1 => Some(parse_filter(&filter_exprs[0])?),
        _ => Some(FilterNode::Group {
            logical: LogicalOp::And,
            children: filter_exprs
                .iter()
                .map(|e| parse_filter(e))
                .collect::<Result<Vec<_>, ParseError>>()?,
        }),
    };

    // ── Vector query ────────────────────────────────────────────
    let vector_query = match &params.vector_query {
        Some(raw) => {
            let vq = parse_vector_query(raw)?;
            let field = schema
                .field(&vq.field)
                .ok_or_else(|| Error::NotFound(format!("field `{}` does not exist", vq.field)))?;
            if !field.is_vector() {
                return Err(Error::BadRequest(format!(
                    "field `{}` is not a vector field",
                    vq.field
                )));
            }
            if !vq.values.is_empty() && vq.values.len() != field.num_dim {
                return Err(Error::BadRequest(format!(
                    "query vector has {} dims, field `{}` expects {}",
                    vq.values.len(),
                    vq.field,
                    field.num_dim
                )));
            }
            Some(vq)
        }
        None => auto_embed_query(schema, &params)?,
    };

    // ── Sorts ───────────────────────────────────────────────────
    let sort_source = override_sort.unwrap_or_else(|| params.sort_by.clone());
    let sorts = resolve_sorts(
        &sort_source,
        schema,
        is_wildcard,
        vector_query.is_some(),
        !params.group_by.is_empty(),
    )?;

    // ── Grouping ────────────────────────────────────────────────
    for group_field in &params.group_by {
        let field = schema
            .field(group_field)
            .ok_or_else(|| Error::NotFound(format!("field `{group_field}` does not exist")))?;
        if !field.facet {
            return Err(Error::BadRequest(format!(
                "group by field `{group_field}` must be a facet field"
            )));
        }
    }

    // ── Pagination ──────────────────────────────────────────────
    let page = params.page.unwrap_or(1);
    if page == 0 {
        return Err(Error::BadRequest("`page` must be 1 or greater".into()));
    }
    let per_page = params.per_page;
    // `page` wins when both are supplied.
    let offset = match (params.page, params.offset) {
        (Some(p), _) => (p - 1) * per_page,
        (None, Some(o)) => o,
        (None, None) => 0,
    };
    if params.limit_hits != usize::MAX && offset + per_page > params.limit_hits {
        return Err(Error::Unprocessable(format!(
            "only the first {} results are available",
            params.limit_hits
        )));
    }
    let fetch_size = (offset + per_page).max(DEFAULT_TOPSTER_SIZE);

    Ok(SearchPlan {
        query_variants,
        raw_tokens,
        phrases,
        exclude_tokens,
        is_wildcard,
        fields,
        filter,
        sorts,
        group_by: params.group_by.clone(),
        group_limit: params.group_limit,
        group_missing_values: params.group_missing_values,
        page,
        per_page,
        offset,
        fetch_size,
        pinned,
        hidden,
        filter_curated_hits: filter_curated_hits.unwrap_or(false),
        override_metadata,
        vector_query,
        text_match_type: params.text_match_type,
        params,
    })
}

/// `"quoted phrases"`, `-exclusions` and plain tokens.
fn tokenize_query(
    q: &str,
    tokenizer: &ferret_index::Tokenizer,
) -> (Vec<QueryToken>, Vec<Vec<String>>, Vec<String>) {
    if q == "*" {
        return (Vec::new(), Vec::new(), Vec::new());
    }

    let mut tokens = Vec::new();
    let mut phrases = Vec::new();
    let mut excludes = Vec::new();

    let mut rest = q;
    let mut exclude_next_phrase = false;
    while !rest.is_empty() {
        if let Some(start) = rest.find('"') {
            let before = &rest[..start];
            exclude_next_phrase = before.trim_end().ends_with('-');
            collect_plain(before, tokenizer, &mut tokens, &mut excludes);
            let after = &rest[start + 1..];
            match after.find('"') {
                Some(end) => {
                    let phrase_tokens = tokenizer.terms(&after[..end]);
                    if !phrase_tokens.is_empty() {
                        if exclude_next_phrase {
                            excludes.extend(phrase_tokens);
                        } else {
                            let phrase_id = phrases.len() + 1;
                            for text in &phrase_tokens {
                                tokens.push(QueryToken {
                                    text: text.clone(),
                                    phrase: phrase_id,
                                });
                            }
                            phrases.push(phrase_tokens);
                        }
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    collect_plain(after, tokenizer, &mut tokens, &mut excludes);
                    rest = "";
                }
            }
        } else {
            collect_plain(rest, tokenizer, &mut tokens, &mut excludes);
            rest = "";
        }
    }

    (tokens, phrases, excludes)
}

fn collect_plain(
    chunk: &str,
    tokenizer: &ferret_index::Tokenizer,
    tokens: &mut Vec<QueryToken>,
    excludes: &mut Vec<String>,
) {
    for word in chunk.split_whitespace() {
        if let Some(negated) = word.strip_prefix('-') {
            excludes.extend(tokenizer.terms(negated));
        } else {
            for text in tokenizer.terms(word) {
                tokens.push(QueryToken { text, phrase: 0 });
            }
        }
    }
}

fn resolve_fields(
    params: &SearchParams,
    schema: &Schema,
    is_wildcard: bool,
) -> Result<Vec<SearchField>, Error> {
    let mut names: Vec<String> = Vec::new();
    for entry in &params.query_by {
        for name in schema.expand_wildcard(entry) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }

    if names.is_empty() {
        if is_wildcard {
            return Ok(Vec::new());
        }
        return Err(Error::BadRequest(
            "`query_by` is required for a non-wildcard query".into(),
        ));
    }

    if !params.query_by_weights.is_empty() && params.query_by_weights.len() != names.len() {
        return Err(Error::BadRequest(
            "`query_by_weights` must match the number of `query_by` fields".into(),
        ));
    }

    let mut fields = Vec::with_capacity(names.len());
    for (i, name) in names.iter().enumerate() {
        let field = schema
            .field(name)
            .ok_or_else(|| Error::NotFound(format!("field `{name}` does not exist")))?;
        // Auto-embedding vector fields ride along for hybrid search and
        // are not text-matched.
        if field.is_vector() {
            continue;
        }
        if !field.index {
            return Err(Error::BadRequest(format!(
                "field `{name}` is not indexed and cannot be searched"
            )));
        }
        if !field.field_type.is_string_kind() {
            return Err(Error::BadRequest(format!(
                "field `{name}` must be a string or string[] field to be searched"
            )));
        }
        let weight = match params.query_by_weights.get(i) {
            Some(&w) => w.min(FIELD_MAX_WEIGHT),
            // Descending defaults, floored at 1.
            None => FIELD_MAX_WEIGHT.saturating_sub(i as u32).max(1),
        };
        fields.push(SearchField {
            name: name.clone(),
            weight,
            prefix: params.prefix_for(i),
            num_typos: params.num_typos_for(i),
            infix: params.infix_for(i),
        });
    }

    // Highest weight first; stable for equal weights.
    fields.sort_by(|a, b| b.weight.cmp(&a.weight));
    Ok(fields)
}

/// A `query_by` entry with an embed config turns into an implicit vector
/// query over the embedded field (values resolved later).
fn auto_embed_query(schema: &Schema, params: &SearchParams) -> Result<Option<VectorQuery>, Error> {
    let mut embed_fields = Vec::new();
    for entry in &params.query_by {
        if let Some(field) = schema.field(entry) {
            if field.is_vector() && field.embed.is_some() {
                embed_fields.push(field.name.clone());
            }
        }
    }
    match embed_fields.len() {
        0 => Ok(None),
        1 => Ok(Some(VectorQuery {
            field: embed_fields.pop().expect("one element"),
            values: Vec::new(),
            k: None,
            distance_threshold: None,
            alpha: None,
            doc_id: None,
        })),
        _ => Err(Error::BadRequest(
            "only one auto-embedding field may be queried at a time".into(),
        )),
    }
}

fn resolve_sorts(
    sort_by: &str,
    schema: &Schema,
    is_wildcard: bool,
    has_vector: bool,
    grouped: bool,
) -> Result<Vec<ResolvedSort>, Error> {
    let clauses = parse_sort(sort_by)?;
    if clauses.len() > MAX_SORT_CLAUSES {
        return Err(Error::Unprocessable(
            "only up to 3 sort clauses are allowed".into(),
        ));
    }
    let eval_count = clauses
        .iter()
        .filter(|c| matches!(c.target, SortTarget::Eval { .. }))
        .count();
    if eval_count > 1 {
        return Err(Error::Unprocessable(
            "only one `_eval` sort clause is allowed".into(),
        ));
    }

    let mut sorts = Vec::new();
    for clause in &clauses {
        sorts.push(resolve_sort_clause(clause, schema, has_vector, grouped)?);
    }

    // Defaults: text match, vector distance, declared default sort, then
    // recency.
    if sorts.is_empty() && !is_wildcard {
        sorts.push(ResolvedSort {
            by: ResolvedSortBy::TextMatch { buckets: None },
            descending: true,
        });
    }
    if sorts.len() < MAX_SORT_CLAUSES && has_vector {
        let already = sorts
            .iter()
            .any(|s| matches!(s.by, ResolvedSortBy::VectorDistance));
        if !already {
            sorts.push(ResolvedSort {
                by: ResolvedSortBy::VectorDistance,
                descending: false,
            });
        }
    }
    if sorts.len() < MAX_SORT_CLAUSES && !schema.default_sorting_field.is_empty() {
        let field = schema
            .field(&schema.default_sorting_field)
            .expect("validated at schema build");
        sorts.push(ResolvedSort {
            by: ResolvedSortBy::NumField {
                field: field.name.clone(),
                is_float: field.field_type == FieldType::Float,
            },
            descending: true,
        });
    }
    if sorts.len() < MAX_SORT_CLAUSES {
        sorts.push(ResolvedSort {
            by: ResolvedSortBy::SeqId,
            descending: true,
        });
    }
    sorts.truncate(MAX_SORT_CLAUSES);
    Ok(sorts)
}

fn resolve_sort_clause(
    clause: &SortClause,
    schema: &Schema,
    has_vector: bool,
    grouped: bool,
) -> Result<ResolvedSort, Error> {
    let descending = clause.order == SortOrder::Desc;
    let by = match &clause.target {
        SortTarget::TextMatch { buckets } => ResolvedSortBy::TextMatch { buckets: *buckets },
        SortTarget::VectorDistance => {
            if !has_vector {
                return Err(Error::BadRequest(
                    "`_vector_distance` sort requires a vector query".into(),
                ));
            }
            ResolvedSortBy::VectorDistance
        }
        SortTarget::SeqId => ResolvedSortBy::SeqId,
        SortTarget::GroupFound => {
            if !grouped {
                return Err(Error::BadRequest(
                    "`_group_found` sort requires `group_by`".into(),
                ));
            }
            ResolvedSortBy::GroupFound
        }
        SortTarget::Eval { expr } => ResolvedSortBy::Eval {
            filter: parse_filter(expr)?,
        },
        SortTarget::GeoPoint { field, lat, lng } => {
            let f = schema
                .field(field)
                .ok_or_else(|| Error::NotFound(format!("field `{field}` does not exist")))?;
            if f.field_type != FieldType::Geopoint {
                return Err(Error::BadRequest(format!(
                    "field `{field}` is not a geopoint and cannot be distance-sorted"
                )));
            }
            ResolvedSortBy::Geo {
                field: field.clone(),
                lat: *lat,
                lng: *lng,
            }
        }
        SortTarget::Reference { collection, .. } => {
            return Err(Error::BadRequest(format!(
                "reference sort through `{collection}` must be resolved by the joining search"
            )));
        }
        SortTarget::Field(name) => {
            let field = schema
                .field(name)
                .ok_or_else(|| Error::NotFound(format!("field `{name}` does not exist")))?;
            if !field.is_sortable() {
                return Err(Error::BadRequest(format!(
                    "field `{name}` is not declared sortable"
                )));
            }
            if field.field_type.is_string_kind() {
                ResolvedSortBy::StrField { field: name.clone() }
            } else {
                ResolvedSortBy::NumField {
                    field: name.clone(),
                    is_float: field.field_type == FieldType::Float,
                }
            }
        }
    };
    Ok(ResolvedSort { by, descending })
}

fn parse_pinned(entries: &[String]) -> Result<Vec<(String, usize)>, Error> {
    let mut pinned = Vec::with_capacity(entries.len());
    for entry in entries {
        let (id, position) = entry.rsplit_once(':').ok_or_else(|| {
            Error::BadRequest(format!("pinned hit `{entry}` must be `doc_id:position`"))
        })?;
        let position: usize = position
            .parse()
            .map_err(|_| Error::BadRequest(format!("invalid pinned position in `{entry}`")))?;
        if position == 0 {
            return Err(Error::BadRequest("pinned positions start at 1".into()));
        }
        pinned.push((id.to_string(), position));
    }
    Ok(pinned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curation::{AddHit, OverrideRule, RuleMatch};
    use crate::schema::Field;

    fn schema() -> Schema {
        let mut brand = Field::new("brand", FieldType::String);
        brand.facet = true;
        Schema::new(
            vec![
                Field::new("title", FieldType::String),
                Field::new("description", FieldType::String),
                Field::new("points", FieldType::Int32),
                brand,
            ],
            "points".into(),
            vec![],
            vec![],
            false,
        )
        .unwrap()
    }

    fn plan(params: SearchParams) -> Result<SearchPlan, Error> {
        build_plan(&params, &schema(), &[], &[], 0)
    }

    fn base_params(q: &str) -> SearchParams {
        SearchParams {
            q: q.into(),
            query_by: vec!["title".into()],
            ..Default::default()
        }
    }

    #[test]
    fn wildcard_query_has_no_tokens() {
        let p = plan(base_params("*")).unwrap();
        assert!(p.is_wildcard);
        assert!(p.query_variants.is_empty());
    }

    #[test]
    fn tokens_lowercased_and_split() {
        let p = plan(base_params("Denim JEANS")).unwrap();
        assert_eq!(p.query_variants[0], vec!["denim", "jeans"]);
    }

    #[test]
    fn exclusion_tokens_extracted() {
        let p = plan(base_params("shoes -leather")).unwrap();
        assert_eq!(p.query_variants[0], vec!["shoes"]);
        assert_eq!(p.exclude_tokens, vec!["leather"]);
    }

    #[test]
    fn quoted_phrase_extracted() {
        let p = plan(base_params(r#"blue "denim jacket""#)).unwrap();
        assert_eq!(p.phrases, vec![vec!["denim", "jacket"]]);
        assert_eq!(p.query_variants[0], vec!["blue", "denim", "jacket"]);
    }

    #[test]
    fn missing_query_by_rejected() {
        let params = SearchParams {
            q: "shoe".into(),
            ..Default::default()
        };
        assert_eq!(plan(params).unwrap_err().http_code(), 400);
    }

    #[test]
    fn unknown_query_field_is_not_found() {
        let params = SearchParams {
            q: "shoe".into(),
            query_by: vec!["ghost".into()],
            ..Default::default()
        };
        assert_eq!(plan(params).unwrap_err().http_code(), 404);
    }

    #[test]
    fn non_string_query_field_rejected() {
        let params = SearchParams {
            q: "shoe".into(),
            query_by: vec!["points".into()],
            ..Default::default()
        };
        assert_eq!(plan(params).unwrap_err().http_code(), 400);
    }

    #[test]
    fn default_weights_descend() {
        let params = SearchParams {
            q: "shoe".into(),
            query_by: vec!["title".into(), "description".into()],
            ..Default::default()
        };
        let p = plan(params).unwrap();
        assert_eq!(p.fields[0].weight, FIELD_MAX_WEIGHT);
        assert_eq!(p.fields[1].weight, FIELD_MAX_WEIGHT - 1);
    }

    #[test]
    fn explicit_weights_reorder_fields() {
        let params = SearchParams {
            q: "shoe".into(),
            query_by: vec!["title".into(), "description".into()],
            query_by_weights: vec![2, 9],
            ..Default::default()
        };
        let p = plan(params).unwrap();
        assert_eq!(p.fields[0].name, "description");
        assert_eq!(p.fields[0].weight, 9);
    }

    #[test]
    fn weights_length_mismatch_rejected() {
        let params = SearchParams {
            q: "shoe".into(),
            query_by: vec!["title".into()],
            query_by_weights: vec![1, 2],
            ..Default::default()
        };
        assert_eq!(plan(params).unwrap_err().http_code(), 400);
    }

    #[test]
    fn default_sorts_fill_in() {
        let p = plan(base_params("shoe")).unwrap();
        assert_eq!(p.sorts.len(), 3);
        assert!(matches!(p.sorts[0].by, ResolvedSortBy::TextMatch { .. }));
        assert!(matches!(
            &p.sorts[1].by,
            ResolvedSortBy::NumField { field, .. } if field == "points"
        ));
        assert!(matches!(p.sorts[2].by, ResolvedSortBy::SeqId));
    }

    #[test]
    fn four_sort_clauses_rejected() {
        let mut params = base_params("shoe");
        params.sort_by = "points:desc,_text_match:desc,_seq_id:desc,points:asc".into();
        assert_eq!(plan(params).unwrap_err().http_code(), 422);
    }

    #[test]
    fn unknown_sort_field_is_not_found() {
        let mut params = base_params("shoe");
        params.sort_by = "ghost:desc".into();
        assert_eq!(plan(params).unwrap_err().http_code(), 404);
    }

    #[test]
    fn page_past_limit_hits_rejected() {
        let mut params = base_params("shoe");
        params.limit_hits = 20;
        params.page = Some(3);
        assert_eq!(plan(params).unwrap_err().http_code(), 422);
    }

    #[test]
    fn page_wins_over_offset() {
        let mut params = base_params("shoe");
        params.page = Some(2);
        params.offset = Some(95);
        let p = plan(params).unwrap();
        assert_eq!(p.offset, 10);
    }

    #[test]
    fn pinned_hits_parsed_and_ordered() {
        let mut params = base_params("shoe");
        params.pinned_hits = vec!["7:2".into(), "42:1".into()];
        let p = plan(params).unwrap();
        assert_eq!(p.pinned, vec![("42".into(), 1), ("7".into(), 2)]);
    }

    #[test]
    fn override_pins_and_stops() {
        let ov = Override {
            id: "promo".into(),
            rule: OverrideRule {
                query: Some("shoe".into()),
                r#match: Some(RuleMatch::Exact),
                filter_by: None,
                tags: vec![],
            },
            add_hits: vec![AddHit {
                doc_id: "2".into(),
                position: 1,
            }],
            drop_hits: vec![],
            filter_by: Some("points:>10".into()),
            sort_by: None,
            replace_query: None,
            remove_matched_tokens: false,
            filter_curated_hits: None,
            effective_from_ts: -1,
            effective_to_ts: -1,
            stop_processing: true,
            metadata: None,
        };
        let p = build_plan(&base_params("shoe"), &schema(), &[ov], &[], 0).unwrap();
        assert_eq!(p.pinned, vec![("2".into(), 1)]);
        assert!(p.filter.is_some());
    }

    #[test]
    fn override_replace_query() {
        let ov = Override {
            id: "redirect".into(),
            rule: OverrideRule {
                query: Some("sneaker".into()),
                r#match: Some(RuleMatch::Exact),
                filter_by: None,
                tags: vec![],
            },
            add_hits: vec![],
            drop_hits: vec![],
            filter_by: None,
            sort_by: None,
            replace_query: Some("trainer".into()),
            remove_matched_tokens: false,
            filter_curated_hits: None,
            effective_from_ts: -1,
            effective_to_ts: -1,
            stop_processing: false,
            metadata: None,
        };
        let p = build_plan(&base_params("sneaker"), &schema(), &[ov], &[], 0).unwrap();
        assert_eq!(p.query_variants[0], vec!["trainer"]);
    }

    #[test]
    fn synonym_variants_included() {
        let synonyms = vec![(
            vec!["shoe".to_string()],
            vec![vec!["sneaker".to_string()]],
        )];
        let p = build_plan(&base_params("shoe"), &schema(), &[], &synonyms, 0).unwrap();
        assert_eq!(p.query_variants.len(), 2);
        assert_eq!(p.query_variants[1], vec!["sneaker"]);
    }
}

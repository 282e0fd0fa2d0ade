use serde_json::{Map, Value, json};

use ferret_index::Tokenizer;
use ferret_query::TextMatchType;

use crate::document::{FLAT_KEY, apply_projection};
use crate::error::Error;
use crate::executor::Outcome;
use crate::facet::{FacetResult, facet_to_json};
use crate::highlight::build_highlights;
use crate::index::Index;
use crate::planner::{ResolvedSortBy, SearchPlan};
use crate::schema::Schema;
use crate::topster::Kv;

/// How a resolved reference document is attached to the hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStrategy {
    Merge,
    Nest,
    NestArray,
}

/// One `$collection(...)` projection clause.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinClause {
    pub collection: String,
    pub include_fields: Vec<String>,
    pub exclude_fields: Vec<String>,
    pub alias: Option<String>,
    pub strategy: JoinStrategy,
    /// Nested `$other(...)` clauses to resolve on the joined documents.
    pub nested_join_includes: Vec<JoinClause>,
}

/// Resolves a join clause for one hit into the value to attach, or `None`
/// when nothing references out.
pub type JoinResolver<'a> = dyn Fn(&Map<String, Value>, &JoinClause) -> Option<Value> + 'a;

pub struct AssembleContext<'a> {
    pub collection_name: &'a str,
    pub out_of: u64,
    pub index: &'a Index,
    pub schema: &'a Schema,
    pub tokenizer: &'a Tokenizer,
    pub doc_of: &'a dyn Fn(u32) -> Option<Map<String, Value>>,
    pub join: Option<&'a JoinResolver<'a>>,
}

/// Build the response JSON for the requested page.
pub fn build_response(
    plan: &SearchPlan,
    outcome: &Outcome,
    facets: &[FacetResult],
    ctx: &AssembleContext,
) -> Result<Value, Error> {
    let (includes, joins) = split_join_includes(&plan.params.include_fields)?;
    let excludes = plan.params.exclude_fields.clone();

    let grouped = !plan.group_by.is_empty();
    let mut response = json!({
        "found": outcome.found,
        "out_of": ctx.out_of,
        "page": plan.page,
        "search_cutoff": outcome.search_cutoff,
        "request_params": {
            "collection_name": ctx.collection_name,
            "q": plan.params.q,
            "per_page": plan.per_page,
        },
    });
    if let Some(metadata) = &plan.override_metadata {
        response["metadata"] = metadata.clone();
    }

    let facet_counts: Vec<Value> = facets
        .iter()
        .map(|f| facet_to_json(f, plan.params.max_facet_values))
        .collect();
    response["facet_counts"] = Value::Array(facet_counts);

    if grouped {
        response["found_docs"] = json!(outcome.found_docs);
        let mut grouped_hits = Vec::new();
        let page_groups = outcome
            .groups
            .iter()
            .skip(plan.offset)
            .take(plan.per_page);
        for group in page_groups {
            let mut hits = Vec::new();
            for kv in &group.hits {
                if let Some(hit) =
                    build_hit(kv, plan, outcome, ctx, &includes, &excludes, &joins)?
                {
                    hits.push(hit);
                }
            }
            let group_key = group
                .hits
                .first()
                .and_then(|kv| (ctx.doc_of)(kv.seq_id))
                .map(|doc| group_key_values(&doc, plan))
                .unwrap_or_default();
            grouped_hits.push(json!({
                "group_key": group_key,
                "found": group.found,
                "hits": hits,
            }));
        }
        response["grouped_hits"] = Value::Array(grouped_hits);
    } else {
        let merged = merge_curated(&outcome.hits, &outcome.curated);
        let page_hits = merged.iter().skip(plan.offset).take(plan.per_page);
        let mut hits = Vec::new();
        for kv in page_hits {
            if let Some(hit) = build_hit(kv, plan, outcome, ctx, &includes, &excludes, &joins)? {
                hits.push(hit);
            }
        }
        response["hits"] = Value::Array(hits);
    }

    Ok(response)
}

/// Curated entries land at their 1-based positions; organic hits flow
/// around them.
pub fn merge_curated(hits: &[Kv], curated: &[(usize, Kv)]) -> Vec<Kv> {
    let curated_seqs: Vec<u32> = curated.iter().map(|(_, kv)| kv.seq_id).collect();
    let mut merged: Vec<Kv> = hits
        .iter()
        .filter(|kv| !curated_seqs.contains(&kv.seq_id))
        .cloned()
        .collect();
    for (position, kv) in curated {
        let at = (position - 1).min(merged.len());
        merged.insert(at, kv.clone());
    }
    merged
}

fn build_hit(
    kv: &Kv,
    plan: &SearchPlan,
    outcome: &Outcome,
    ctx: &AssembleContext,
    includes: &[String],
    excludes: &[String],
    joins: &[JoinClause],
) -> Result<Option<Value>, Error> {
    let Some(mut doc) = (ctx.doc_of)(kv.seq_id) else {
        return Ok(None);
    };
    strip_internal_keys(&mut doc, ctx.schema);

    // Joins run before projection; the resolver reads the stored copy by
    // id, where the reference helpers survive.
    let mut joined: Vec<(JoinStrategy, String, Value)> = Vec::new();
    if let Some(join) = ctx.join {
        for clause in joins {
            if let Some(value) = join(&doc, clause) {
                let alias = clause
                    .alias
                    .clone()
                    .unwrap_or_else(|| clause.collection.clone());
                joined.push((clause.strategy, alias, value));
            }
        }
    }

    apply_projection(&mut doc, includes, excludes);
    for (strategy, alias, value) in joined {
        match (strategy, value) {
            // Merge folds the joined object's fields in flat.
            (JoinStrategy::Merge, Value::Object(map)) => {
                for (k, v) in map {
                    doc.insert(k, v);
                }
            }
            (_, other) => {
                doc.insert(alias, other);
            }
        }
    }

    let (v1, v2) = build_highlights(&doc, plan, &outcome.leaves, ctx.tokenizer);

    let mut hit = json!({
        "document": doc,
        "highlight": v2,
    });
    if plan.params.enable_highlight_v1 {
        hit["highlights"] = Value::Array(v1);
    }

    if kv.is_curated() {
        hit["curated"] = json!(true);
    } else if !plan.is_wildcard {
        hit["text_match"] = json!(kv.text_match_score);
        hit["text_match_info"] = text_match_info(kv, plan);
    }

    if plan.vector_query.is_some() {
        hit["vector_distance"] = json!(kv.vector_distance);
        if !plan.is_wildcard {
            hit["hybrid_search_info"] = json!({
                "rank_fusion_score": fusion_score_of(kv, plan),
            });
        }
    }

    let geo = geo_distances(kv, plan, ctx);
    if !geo.is_empty() {
        hit["geo_distance_meters"] = json!(geo);
    }

    Ok(Some(hit))
}

fn strip_internal_keys(doc: &mut Map<String, Value>, schema: &Schema) {
    doc.remove(FLAT_KEY);
    let helper_keys: Vec<String> = schema
        .reference_fields()
        .map(|f| f.sequence_helper_name())
        .collect();
    for key in helper_keys {
        doc.remove(&key);
    }
}

/// Decode per-hit score components back out of the packed 64-bit score.
fn text_match_info(kv: &Kv, plan: &SearchPlan) -> Value {
    let score = kv.text_match_score;
    let tokens_matched = score >> 59;
    let fields_matched = score & 0x7;
    let (best_field_score, best_field_weight) = match plan.text_match_type {
        TextMatchType::MaxScore => ((score >> 11) & 0xFFFF_FFFF_FFFF, (score >> 3) & 0xFF),
        TextMatchType::MaxWeight => ((score >> 3) & 0xFFFF_FFFF_FFFF, (score >> 51) & 0xFF),
    };
    json!({
        "score": score.to_string(),
        "tokens_matched": tokens_matched,
        "fields_matched": fields_matched,
        "best_field_score": best_field_score.to_string(),
        "best_field_weight": best_field_weight,
    })
}

/// Invert the order-preserving float encoding used for fused scores.
fn fusion_score_of(kv: &Kv, plan: &SearchPlan) -> f64 {
    let slot = (kv.match_score_index as usize).min(2);
    let encoded = kv.scores[slot];
    let descending = plan
        .sorts
        .get(slot)
        .map(|s| s.descending)
        .unwrap_or(true);
    let encoded = if descending { encoded } else { -encoded };
    let bits = if encoded < 0 {
        (encoded ^ i64::MIN) as u64
    } else {
        encoded as u64
    };
    f64::from_bits(bits)
}

fn geo_distances(kv: &Kv, plan: &SearchPlan, ctx: &AssembleContext) -> Map<String, Value> {
    let mut out = Map::new();
    for sort in &plan.sorts {
        if let ResolvedSortBy::Geo { field, lat, lng } = &sort.by {
            if let Some(meters) = ctx
                .index
                .geo_column(field)
                .and_then(|c| c.distance_meters(kv.seq_id, *lat, *lng))
            {
                out.insert(field.clone(), json!(meters.round() as i64));
            }
        }
    }
    out
}

fn group_key_values(doc: &Map<String, Value>, plan: &SearchPlan) -> Vec<Value> {
    plan.group_by
        .iter()
        .map(|field| crate::document::get_path(doc, field).unwrap_or(Value::Null))
        .collect()
}

/// Split `include_fields` into plain projections and `$coll(...)` join
/// clauses.
pub fn split_join_includes(entries: &[String]) -> Result<(Vec<String>, Vec<JoinClause>), Error> {
    let mut plain = Vec::new();
    let mut joins = Vec::new();
    for entry in entries {
        let entry = entry.trim();
        if entry.starts_with('$') {
            joins.push(parse_join_clause(entry)?);
        } else {
            plain.push(entry.to_string());
        }
    }
    Ok((plain, joins))
}

/// `$coll(field1, field2, strategy: nest) as alias`
fn parse_join_clause(entry: &str) -> Result<JoinClause, Error> {
    let body = entry
        .strip_prefix('$')
        .ok_or_else(|| Error::BadRequest(format!("malformed join include: {entry}")))?;
    let open = body
        .find('(')
        .ok_or_else(|| Error::BadRequest(format!("malformed join include: {entry}")))?;
    let collection = body[..open].trim().to_string();

    let close = find_matching_paren(body, open)
        .ok_or_else(|| Error::BadRequest(format!("malformed join include: {entry}")))?;
    let inner = &body[open + 1..close];
    let tail = body[close + 1..].trim();

    let alias = match tail.strip_prefix("as ") {
        Some(alias) => Some(alias.trim().to_string()),
        None if tail.is_empty() => None,
        None => {
            return Err(Error::BadRequest(format!(
                "unexpected trailing join syntax: {tail}"
            )));
        }
    };

    let mut clause = JoinClause {
        collection,
        include_fields: Vec::new(),
        exclude_fields: Vec::new(),
        alias,
        strategy: JoinStrategy::Nest,
        nested_join_includes: Vec::new(),
    };

    for part in ferret_query::split_outside_parens(inner, ',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if part.starts_with('$') {
            clause.nested_join_includes.push(parse_join_clause(part)?);
        } else if let Some(strategy) = part.strip_prefix("strategy:") {
            clause.strategy = match strategy.trim() {
                "merge" => JoinStrategy::Merge,
                "nest" => JoinStrategy::Nest,
                "nest_array" => JoinStrategy::NestArray,
                other => {
                    return Err(Error::BadRequest(format!(
                        "unknown join strategy: {other}"
                    )));
                }
            };
        } else if let Some(excluded) = part.strip_prefix('!') {
            clause.exclude_fields.push(excluded.to_string());
        } else {
            clause.include_fields.push(part.to_string());
        }
    }
    Ok(clause)
}

fn find_matching_paren(s: &str, open: usize) -> Option<usize> {
    let mut depth = 0i32;
    for (i, ch) in s.char_indices().skip(open) {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

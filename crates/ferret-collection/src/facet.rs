use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use roaring::RoaringBitmap;
use serde_json::{Map, Value, json};

use ferret_index::ordered_f64;
use ferret_query::SearchParams;

use crate::document::get_path;
use crate::error::Error;
use crate::index::Index;
use crate::schema::Schema;

/// Seed for the Bernoulli facet-sampling pass; fixed so repeated queries
/// over unchanged data count identically.
const SAMPLE_SEED: u64 = 0x00F4_CE75;

#[derive(Debug, Clone, PartialEq)]
enum FacetOrder {
    /// count desc, shorter value, lexicographic.
    Count,
    Alpha { ascending: bool },
}

#[derive(Debug)]
struct FacetSpec {
    field: String,
    order: FacetOrder,
    /// Labeled `[min, max)` buckets for range facets.
    ranges: Vec<(String, f64, f64)>,
    /// Expanded from a `prefix*` entry.
    from_wildcard: bool,
    /// Attach the deepest ancestor object of each counted value.
    return_parent: bool,
}

/// One value bucket in a facet result.
#[derive(Debug, Clone, PartialEq)]
pub struct FacetCount {
    pub value: String,
    pub count: u64,
    pub parent: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FacetStats {
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub avg: f64,
    pub total_values: u64,
}

#[derive(Debug)]
pub struct FacetResult {
    pub field_name: String,
    pub sampled: bool,
    pub counts: Vec<FacetCount>,
    pub stats: Option<FacetStats>,
}

/// Compute facets over the matched document set. `doc_of` fetches stored
/// documents for representative-parent lookups.
pub fn compute_facets(
    params: &SearchParams,
    schema: &Schema,
    index: &Index,
    matched: &RoaringBitmap,
    doc_of: &dyn Fn(u32) -> Option<Map<String, Value>>,
) -> Result<Vec<FacetResult>, Error> {
    let mut specs: Vec<FacetSpec> = Vec::new();
    for entry in &params.facet_by {
        specs.extend(parse_facet_entry(entry, schema)?);
    }
    for spec in &mut specs {
        spec.return_parent = params
            .facet_return_parent
            .iter()
            .any(|f| f == &spec.field);
    }

    // Sampling applies once, to the shared candidate set.
    let sample_percent = params.facet_sample_percent.min(100);
    let sampled =
        sample_percent < 100 && matched.len() as usize > params.facet_sample_threshold;
    let counted_docs: Vec<u32> = if sampled {
        let mut rng = StdRng::seed_from_u64(SAMPLE_SEED);
        matched
            .iter()
            .filter(|_| rng.gen_range(0u8..100) < sample_percent)
            .collect()
    } else {
        matched.iter().collect()
    };
    let scale = if sampled {
        100.0 / sample_percent as f64
    } else {
        1.0
    };

    let facet_query = parse_facet_query(params)?;

    let mut results = Vec::with_capacity(specs.len());
    for spec in specs {
        let result = if spec.ranges.is_empty() {
            count_facet(&spec, schema, index, &counted_docs, scale, sampled, &facet_query, doc_of)?
        } else {
            range_facet(&spec, index, &counted_docs, scale, sampled)?
        };
        // Wildcard expansions skip empty facets.
        if spec.from_wildcard && result.counts.is_empty() {
            continue;
        }
        results.push(result);
    }
    Ok(results)
}

fn parse_facet_entry(entry: &str, schema: &Schema) -> Result<Vec<FacetSpec>, Error> {
    let entry = entry.trim();

    // `prefix*` — expand to every matching facet field.
    if let Some(prefix) = entry.strip_suffix('*') {
        let specs: Vec<FacetSpec> = schema
            .fields()
            .iter()
            .filter(|f| f.facet && f.name.starts_with(prefix))
            .map(|f| FacetSpec {
                field: f.name.clone(),
                order: FacetOrder::Count,
                ranges: Vec::new(),
                from_wildcard: true,
                return_parent: false,
            })
            .collect();
        if specs.is_empty() {
            return Err(Error::NotFound(format!(
                "no facet fields match the pattern `{entry}`"
            )));
        }
        return Ok(specs);
    }

    let (name, args) = match entry.find('(') {
        Some(open) => {
            let inner = entry[open + 1..].strip_suffix(')').ok_or_else(|| {
                Error::BadRequest(format!("malformed facet expression: {entry}"))
            })?;
            (entry[..open].trim(), Some(inner))
        }
        None => (entry, None),
    };

    let field = schema
        .field(name)
        .ok_or_else(|| Error::NotFound(format!("could not find a facet field named `{name}`")))?;
    if !field.facet {
        return Err(Error::BadRequest(format!(
            "field `{name}` is not declared as a facet"
        )));
    }

    let mut spec = FacetSpec {
        field: name.to_string(),
        order: FacetOrder::Count,
        ranges: Vec::new(),
        from_wildcard: false,
        return_parent: false,
    };

    if let Some(args) = args {
        for part in ferret_query::split_outside_parens(args, ',') {
            let part = part.trim();
            if let Some(sort_arg) = part.strip_prefix("sort_by:") {
                spec.order = parse_facet_order(sort_arg.trim())?;
                continue;
            }
            // `label:[min, max]` range bucket.
            let (label, bounds) = part.split_once(':').ok_or_else(|| {
                Error::BadRequest(format!("malformed facet range: {part}"))
            })?;
            let bounds = bounds
                .trim()
                .strip_prefix('[')
                .and_then(|b| b.strip_suffix(']'))
                .ok_or_else(|| Error::BadRequest(format!("malformed facet range: {part}")))?;
            let (min, max) = bounds.split_once(',').ok_or_else(|| {
                Error::BadRequest(format!("facet range needs `min, max`: {part}"))
            })?;
            let min: f64 = min.trim().parse().map_err(|_| {
                Error::BadRequest(format!("invalid facet range bound: {min}"))
            })?;
            let max: f64 = max.trim().parse().map_err(|_| {
                Error::BadRequest(format!("invalid facet range bound: {max}"))
            })?;
            spec.ranges.push((label.trim().to_string(), min, max));
        }
        if !spec.ranges.is_empty() && !field.field_type.is_numeric() {
            return Err(Error::BadRequest(format!(
                "range facets need a numeric field, `{name}` is not"
            )));
        }
    }
    Ok(vec![spec])
}

fn parse_facet_order(arg: &str) -> Result<FacetOrder, Error> {
    match arg {
        "_alpha:asc" => Ok(FacetOrder::Alpha { ascending: true }),
        "_alpha:desc" => Ok(FacetOrder::Alpha { ascending: false }),
        other => Err(Error::BadRequest(format!(
            "unsupported facet sort: {other}"
        ))),
    }
}

/// `facet_query=field:prefix` → `(field, lowercase prefix)`.
fn parse_facet_query(params: &SearchParams) -> Result<Option<(String, String)>, Error> {
    match &params.facet_query {
        None => Ok(None),
        Some(raw) => {
            let (field, prefix) = raw.split_once(':').ok_or_else(|| {
                Error::BadRequest("facet_query must be of the form `field:value`".into())
            })?;
            Ok(Some((field.trim().to_string(), prefix.trim().to_lowercase())))
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn count_facet(
    spec: &FacetSpec,
    schema: &Schema,
    index: &Index,
    docs: &[u32],
    scale: f64,
    sampled: bool,
    facet_query: &Option<(String, String)>,
    doc_of: &dyn Fn(u32) -> Option<Map<String, Value>>,
) -> Result<FacetResult, Error> {
    let column = index.str_column(&spec.field);
    let mut counts: HashMap<&str, (u64, u32)> = HashMap::new();

    let value_filter = facet_query
        .as_ref()
        .filter(|(field, _)| field == &spec.field)
        .map(|(_, prefix)| prefix.as_str());

    if let Some(column) = column {
        for &seq in docs {
            for value in column.values_of(seq) {
                if let Some(prefix) = value_filter {
                    if !value.to_lowercase().starts_with(prefix) {
                        continue;
                    }
                }
                let slot = counts.entry(value.as_str()).or_insert((0, seq));
                slot.0 += 1;
            }
        }
    }

    let mut buckets: Vec<(&str, u64, u32)> = counts
        .into_iter()
        .map(|(value, (count, seq))| (value, count, seq))
        .collect();
    match spec.order {
        FacetOrder::Count => buckets.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then_with(|| a.0.len().cmp(&b.0.len()))
                .then_with(|| a.0.cmp(b.0))
        }),
        FacetOrder::Alpha { ascending } => buckets.sort_by(|a, b| {
            if ascending {
                a.0.cmp(b.0)
            } else {
                b.0.cmp(a.0)
            }
        }),
    }

    let field = schema.field(&spec.field);
    let want_parent = spec.return_parent && spec.field.contains('.');

    let mut out = Vec::new();
    for (value, count, representative_seq) in buckets.iter() {
        let parent = if want_parent {
            doc_of(*representative_seq)
                .and_then(|doc| facet_parent(&doc, &spec.field, value))
        } else {
            None
        };
        out.push(FacetCount {
            value: value.to_string(),
            count: (*count as f64 * scale).round() as u64,
            parent,
        });
    }

    let stats = field
        .filter(|f| f.field_type.is_numeric())
        .and_then(|_| numeric_stats(index, &spec.field, docs));

    Ok(FacetResult {
        field_name: spec.field.clone(),
        sampled,
        counts: out,
        stats,
    })
}

fn range_facet(
    spec: &FacetSpec,
    index: &Index,
    docs: &[u32],
    scale: f64,
    sampled: bool,
) -> Result<FacetResult, Error> {
    let Some(column) = index.num_column(&spec.field) else {
        return Ok(FacetResult {
            field_name: spec.field.clone(),
            sampled,
            counts: Vec::new(),
            stats: None,
        });
    };

    let mut counts: Vec<u64> = vec![0; spec.ranges.len()];
    for &seq in docs {
        for &encoded in column.values_of(seq) {
            for (i, &(_, min, max)) in spec.ranges.iter().enumerate() {
                // Bounds compare in the same ordered-f64 space the column
                // stores floats in; ints order identically.
                let (lo, hi) = (ordered_f64(min), ordered_f64(max));
                let value = encoded;
                if value >= lo && value < hi {
                    counts[i] += 1;
                }
            }
        }
    }

    let out: Vec<FacetCount> = spec
        .ranges
        .iter()
        .zip(&counts)
        .filter(|&(_, &count)| count > 0)
        .map(|((label, _, _), &count)| FacetCount {
            value: label.clone(),
            count: (count as f64 * scale).round() as u64,
            parent: None,
        })
        .collect();

    Ok(FacetResult {
        field_name: spec.field.clone(),
        sampled,
        counts: out,
        stats: numeric_stats(index, &spec.field, docs),
    })
}

fn numeric_stats(index: &Index, field: &str, docs: &[u32]) -> Option<FacetStats> {
    let column = index.str_column(field)?;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut sum = 0.0f64;
    let mut n = 0u64;
    let mut distinct: Vec<&str> = Vec::new();
    for &seq in docs {
        for value in column.values_of(seq) {
            let Ok(v) = value.parse::<f64>() else {
                continue;
            };
            min = min.min(v);
            max = max.max(v);
            sum += v;
            n += 1;
            if !distinct.contains(&value.as_str()) {
                distinct.push(value);
            }
        }
    }
    if n == 0 {
        return None;
    }
    Some(FacetStats {
        min,
        max,
        sum,
        avg: sum / n as f64,
        total_values: distinct.len() as u64,
    })
}

/// Deepest ancestor object whose subtree contains the matched facet value.
fn facet_parent(doc: &Map<String, Value>, path: &str, value: &str) -> Option<Value> {
    let (parent_path, _) = path.rsplit_once('.')?;
    let parent = get_path(doc, parent_path)?;
    match parent {
        Value::Array(items) => items
            .into_iter()
            .find(|item| contains_value(item, value)),
        other => Some(other),
    }
}

fn contains_value(node: &Value, needle: &str) -> bool {
    match node {
        Value::String(s) => s == needle,
        Value::Number(n) => n.to_string() == needle,
        Value::Bool(b) => b.to_string() == needle,
        Value::Array(items) => items.iter().any(|i| contains_value(i, needle)),
        Value::Object(map) => map.values().any(|v| contains_value(v, needle)),
        Value::Null => false,
    }
}

/// Render a facet result to the response JSON shape.
pub fn facet_to_json(result: &FacetResult, max_facet_values: usize) -> Value {
    let counts: Vec<Value> = result
        .counts
        .iter()
        .take(max_facet_values)
        .map(|c| {
            let mut obj = json!({ "value": c.value, "count": c.count });
            if let Some(parent) = &c.parent {
                obj["parent"] = parent.clone();
            }
            obj
        })
        .collect();
    let mut out = json!({
        "field_name": result.field_name,
        "sampled": result.sampled,
        "counts": counts,
    });
    if let Some(stats) = &result.stats {
        out["stats"] = json!({
            "min": stats.min,
            "max": stats.max,
            "sum": stats.sum,
            "avg": stats.avg,
            "total_values": stats.total_values,
        });
    }
    out
}

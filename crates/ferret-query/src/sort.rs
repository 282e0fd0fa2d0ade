use crate::error::ParseError;
use crate::split_outside_parens;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn is_desc(self) -> bool {
        matches!(self, SortOrder::Desc)
    }
}

/// What a sort clause sorts on.
#[derive(Debug, Clone, PartialEq)]
pub enum SortTarget {
    /// A sortable document field.
    Field(String),
    /// `_text_match`, optionally with `buckets` for blockwise flattening.
    TextMatch { buckets: Option<usize> },
    /// `_vector_distance`.
    VectorDistance,
    /// `_seq_id` — insertion order.
    SeqId,
    /// `_group_found` — group size, grouped searches only.
    GroupFound,
    /// `_eval(filter)` — 1 when the document matches, else 0.
    Eval { expr: String },
    /// `field(lat, lng)` — distance from a reference geopoint.
    GeoPoint { field: String, lat: f64, lng: f64 },
    /// `$collection(field:order)` — sort on a referenced collection's field.
    Reference { collection: String, field: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortClause {
    pub target: SortTarget,
    pub order: SortOrder,
}

/// Parse a `sort_by` string such as
/// `_text_match:desc,points:desc` or `_eval(brand:=Nike):desc`.
pub fn parse_sort(input: &str) -> Result<Vec<SortClause>, ParseError> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(Vec::new());
    }

    split_outside_parens(input, ',')
        .iter()
        .map(|clause| parse_clause(clause))
        .collect()
}

fn parse_clause(clause: &str) -> Result<SortClause, ParseError> {
    let (target_str, order_str) = split_order(clause)?;
    let order = match order_str.to_ascii_lowercase().as_str() {
        "asc" => SortOrder::Asc,
        "desc" => SortOrder::Desc,
        other => {
            return Err(ParseError(format!(
                "sort order must be `asc` or `desc`, found `{other}`"
            )));
        }
    };

    let target = parse_target(target_str.trim())?;
    Ok(SortClause { target, order })
}

/// Split `target:order` on the last top-level colon.
fn split_order(clause: &str) -> Result<(&str, &str), ParseError> {
    let mut depth = 0i32;
    let mut split_at = None;
    for (i, ch) in clause.char_indices() {
        match ch {
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            ':' if depth == 0 => split_at = Some(i),
            _ => {}
        }
    }
    match split_at {
        Some(i) => Ok((&clause[..i], &clause[i + 1..])),
        None => Err(ParseError(format!("sort clause `{clause}` has no order"))),
    }
}

fn parse_target(target: &str) -> Result<SortTarget, ParseError> {
    if target == "_text_match" {
        return Ok(SortTarget::TextMatch { buckets: None });
    }
    if let Some(args) = strip_call(target, "_text_match") {
        let buckets = args
            .trim()
            .strip_prefix("buckets")
            .and_then(|rest| rest.trim().strip_prefix(':'))
            .ok_or_else(|| ParseError(format!("malformed _text_match args: {args}")))?;
        let buckets: usize = buckets
            .trim()
            .parse()
            .map_err(|_| ParseError(format!("invalid bucket count: {args}")))?;
        return Ok(SortTarget::TextMatch {
            buckets: Some(buckets),
        });
    }
    if target == "_vector_distance" {
        return Ok(SortTarget::VectorDistance);
    }
    if target == "_seq_id" {
        return Ok(SortTarget::SeqId);
    }
    if target == "_group_found" {
        return Ok(SortTarget::GroupFound);
    }
    if let Some(expr) = strip_call(target, "_eval") {
        if expr.trim().is_empty() {
            return Err(ParseError("empty _eval expression".into()));
        }
        return Ok(SortTarget::Eval {
            expr: expr.trim().to_string(),
        });
    }
    if let Some(rest) = target.strip_prefix('$') {
        let open = rest
            .find('(')
            .ok_or_else(|| ParseError(format!("malformed reference sort: {target}")))?;
        let collection = rest[..open].to_string();
        let inner = rest[open + 1..]
            .strip_suffix(')')
            .ok_or_else(|| ParseError(format!("malformed reference sort: {target}")))?;
        let field = inner.trim().to_string();
        if collection.is_empty() || field.is_empty() {
            return Err(ParseError(format!("malformed reference sort: {target}")));
        }
        return Ok(SortTarget::Reference { collection, field });
    }
    // `field(lat, lng)` — geopoint sort with a reference point.
    if let Some(open) = target.find('(') {
        let field = target[..open].trim().to_string();
        let inner = target[open + 1..]
            .strip_suffix(')')
            .ok_or_else(|| ParseError(format!("malformed geo sort: {target}")))?;
        let parts: Vec<&str> = inner.split(',').map(str::trim).collect();
        if parts.len() != 2 {
            return Err(ParseError(format!(
                "geo sort needs `lat, lng`, found: {inner}"
            )));
        }
        let lat: f64 = parts[0]
            .parse()
            .map_err(|_| ParseError(format!("invalid latitude: {}", parts[0])))?;
        let lng: f64 = parts[1]
            .parse()
            .map_err(|_| ParseError(format!("invalid longitude: {}", parts[1])))?;
        return Ok(SortTarget::GeoPoint { field, lat, lng });
    }

    if target.is_empty() {
        return Err(ParseError("empty sort target".into()));
    }
    Ok(SortTarget::Field(target.to_string()))
}

/// `name(args)` → `Some(args)`.
fn strip_call<'a>(target: &'a str, name: &str) -> Option<&'a str> {
    target
        .strip_prefix(name)?
        .strip_prefix('(')?
        .strip_suffix(')')
}

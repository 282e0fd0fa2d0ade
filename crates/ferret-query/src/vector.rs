use crate::error::ParseError;
use crate::split_outside_parens;

/// A parsed `vector_query` expression.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorQuery {
    pub field: String,
    /// Explicit query vector; empty when the vector comes from embedding `q`
    /// or from a reference document (`id:`).
    pub values: Vec<f32>,
    /// Nearest-neighbour budget.
    pub k: Option<usize>,
    /// Drop candidates farther than this.
    pub distance_threshold: Option<f32>,
    /// Hybrid-search blend weight for rank fusion.
    pub alpha: Option<f32>,
    /// Use the stored vector of this document as the query.
    pub doc_id: Option<String>,
}

/// Parse `emb:([0.1, 0.2], k: 100, distance_threshold: 0.5)`.
///
/// The leading bracket group is optional (`emb:(k: 100)` embeds `q`).
pub fn parse_vector_query(input: &str) -> Result<VectorQuery, ParseError> {
    let input = input.trim();
    let colon = input
        .find(':')
        .ok_or_else(|| ParseError(format!("malformed vector_query: {input}")))?;
    let field = input[..colon].trim().to_string();
    if field.is_empty() {
        return Err(ParseError("vector_query has no field".into()));
    }

    let rest = input[colon + 1..].trim();
    let inner = rest
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| ParseError(format!("malformed vector_query: {input}")))?;

    let mut query = VectorQuery {
        field,
        values: Vec::new(),
        k: None,
        distance_threshold: None,
        alpha: None,
        doc_id: None,
    };

    for part in split_outside_parens(inner, ',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if part.starts_with('[') {
            let list = part
                .strip_prefix('[')
                .and_then(|p| p.strip_suffix(']'))
                .ok_or_else(|| ParseError(format!("malformed vector literal: {part}")))?;
            for num in list.split(',') {
                let num = num.trim();
                if num.is_empty() {
                    continue;
                }
                let v: f32 = num
                    .parse()
                    .map_err(|_| ParseError(format!("invalid vector component: {num}")))?;
                query.values.push(v);
            }
            continue;
        }

        let (key, value) = part
            .split_once(':')
            .ok_or_else(|| ParseError(format!("malformed vector_query arg: {part}")))?;
        let value = value.trim();
        match key.trim() {
            "k" => {
                query.k = Some(
                    value
                        .parse()
                        .map_err(|_| ParseError(format!("invalid k: {value}")))?,
                );
            }
            "distance_threshold" => {
                query.distance_threshold = Some(
                    value
                        .parse()
                        .map_err(|_| ParseError(format!("invalid distance_threshold: {value}")))?,
                );
            }
            "alpha" => {
                query.alpha = Some(
                    value
                        .parse()
                        .map_err(|_| ParseError(format!("invalid alpha: {value}")))?,
                );
            }
            "id" => {
                query.doc_id = Some(value.to_string());
            }
            other => {
                return Err(ParseError(format!("unknown vector_query arg: {other}")));
            }
        }
    }

    Ok(query)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_vector_with_k() {
        let q = parse_vector_query("emb:([0.1, 0.2, 0.3], k: 50)").unwrap();
        assert_eq!(q.field, "emb");
        assert_eq!(q.values, vec![0.1, 0.2, 0.3]);
        assert_eq!(q.k, Some(50));
    }

    #[test]
    fn args_only() {
        let q = parse_vector_query("emb:(k: 10, distance_threshold: 0.4, alpha: 0.7)").unwrap();
        assert!(q.values.is_empty());
        assert_eq!(q.k, Some(10));
        assert_eq!(q.distance_threshold, Some(0.4));
        assert_eq!(q.alpha, Some(0.7));
    }

    #[test]
    fn reference_doc_id() {
        let q = parse_vector_query("emb:(id: 42)").unwrap();
        assert_eq!(q.doc_id.as_deref(), Some("42"));
    }

    #[test]
    fn missing_parens_errors() {
        assert!(parse_vector_query("emb:[0.1]").is_err());
    }

    #[test]
    fn unknown_arg_errors() {
        assert!(parse_vector_query("emb:(flat_search_cutoff: 2)").is_err());
    }
}

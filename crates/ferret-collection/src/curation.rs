use serde::{Deserialize, Serialize};

/// Upper bound on synonym-expanded query variants per search.
pub const MAX_QUERY_VARIANTS: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleMatch {
    Exact,
    Contains,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverrideRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#match: Option<RuleMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_by: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddHit {
    pub doc_id: String,
    /// 1-based position in the result page.
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropHit {
    pub doc_id: String,
}

/// A curation rule: matches a query (or tag set) and rewrites the search —
/// pinning/hiding documents, adding filters or sorts, or replacing the
/// query text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Override {
    pub id: String,
    #[serde(default)]
    pub rule: OverrideRule,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add_hits: Vec<AddHit>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub drop_hits: Vec<DropHit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace_query: Option<String>,
    #[serde(default)]
    pub remove_matched_tokens: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_curated_hits: Option<bool>,
    /// Unix seconds; `-1` disables the bound.
    #[serde(default = "disabled_ts")]
    pub effective_from_ts: i64,
    #[serde(default = "disabled_ts")]
    pub effective_to_ts: i64,
    #[serde(default)]
    pub stop_processing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

fn disabled_ts() -> i64 {
    -1
}

impl Override {
    /// Whether this override fires for the given normalised query, tag set
    /// and wall-clock time.
    pub fn matches(&self, normalized_query: &str, tags: &[String], now_ts: i64) -> bool {
        if self.effective_from_ts >= 0 && now_ts < self.effective_from_ts {
            return false;
        }
        if self.effective_to_ts >= 0 && now_ts > self.effective_to_ts {
            return false;
        }

        // No tags in the request → only untagged overrides participate.
        if tags.is_empty() {
            if !self.rule.tags.is_empty() {
                return false;
            }
        } else if !self.rule.tags.iter().any(|t| tags.contains(t)) {
            return false;
        }

        match (&self.rule.query, self.rule.r#match) {
            (Some(rule_query), match_kind) => {
                let rule_query = rule_query.to_lowercase();
                match match_kind.unwrap_or(RuleMatch::Exact) {
                    RuleMatch::Exact => {
                        normalized_query == rule_query || rule_query == "*"
                    }
                    RuleMatch::Contains => normalized_query.contains(rule_query.as_str()),
                }
            }
            // Tag-only or filter-only rules fire on any query.
            (None, _) => !self.rule.tags.is_empty() || self.rule.filter_by.is_some(),
        }
    }
}

/// `{id, root?, synonyms[]}` — with an empty root all terms are mutual.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Synonym {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub root: String,
    pub synonyms: Vec<String>,
}

/// Expand a tokenised query with synonym variants. The original token list
/// stays at index 0; each variant replaces one matched phrase occurrence.
pub fn expand_synonyms(
    tokens: &[String],
    synonyms: &[(Vec<String>, Vec<Vec<String>>)],
) -> Vec<Vec<String>> {
    let mut variants: Vec<Vec<String>> = vec![tokens.to_vec()];
    for (needle, replacements) in synonyms {
        if needle.is_empty() {
            continue;
        }
        let Some(at) = find_subsequence(tokens, needle) else {
            continue;
        };
        for replacement in replacements {
            if variants.len() >= MAX_QUERY_VARIANTS {
                return variants;
            }
            let mut variant = Vec::with_capacity(tokens.len());
            variant.extend_from_slice(&tokens[..at]);
            variant.extend(replacement.iter().cloned());
            variant.extend_from_slice(&tokens[at + needle.len()..]);
            if !variant.is_empty() && !variants.contains(&variant) {
                variants.push(variant);
            }
        }
    }
    variants
}

/// Build `(needle, replacements)` pairs from a synonym definition, with
/// each term pre-tokenised by the caller.
pub fn synonym_pairs(
    root_tokens: Vec<String>,
    member_tokens: Vec<Vec<String>>,
) -> Vec<(Vec<String>, Vec<Vec<String>>)> {
    if !root_tokens.is_empty() {
        return vec![(root_tokens, member_tokens)];
    }
    // Mutual: every member maps to all the others.
    member_tokens
        .iter()
        .enumerate()
        .map(|(i, needle)| {
            let others: Vec<Vec<String>> = member_tokens
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != i)
                .map(|(_, t)| t.clone())
                .collect();
            (needle.clone(), others)
        })
        .collect()
}

fn find_subsequence(haystack: &[String], needle: &[String]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&at| haystack[at..at + needle.len()] == *needle)
}

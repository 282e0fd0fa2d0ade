use serde_json::{Map, Value, json};

use ferret_index::Tokenizer;

use crate::executor::TokenLeaf;
use crate::planner::SearchPlan;

/// Highlighted rendering of one string value.
#[derive(Debug, Clone, PartialEq)]
struct Highlighted {
    snippet: String,
    /// Full tagged value, when the field is in `highlight_full_fields`.
    full: Option<String>,
    matched_tokens: Vec<String>,
}

/// Annotate matched spans over the stored document. Returns the v1
/// `highlights` array and the v2 `highlight` object mirroring the
/// document's nesting.
pub fn build_highlights(
    doc: &Map<String, Value>,
    plan: &SearchPlan,
    leaves: &[TokenLeaf],
    tokenizer: &Tokenizer,
) -> (Vec<Value>, Value) {
    let mut v1 = Vec::new();
    let mut v2 = Map::new();

    if leaves.is_empty() {
        return (v1, Value::Object(v2));
    }

    let fields = highlight_fields(plan);
    let full_fields = &plan.params.highlight_full_fields;

    for field in &fields {
        let full = full_fields.iter().any(|f| f == field || f == "*");

        // Literal dotted keys resolve directly; otherwise walk the path
        // one segment at a time so object arrays keep their element
        // positions instead of being flattened away.
        let (anchor, value, rest) = match doc.get(field.as_str()) {
            Some(value) => (field.as_str(), value, Vec::new()),
            None => {
                let mut segments: Vec<&str> = field.split('.').collect();
                let head = segments.remove(0);
                match doc.get(head) {
                    Some(value) => (head, value, segments),
                    None => continue,
                }
            }
        };

        let mut hits: Vec<(Option<usize>, Highlighted)> = Vec::new();
        let Some(node) =
            highlight_subtree(value, &rest, None, plan, leaves, tokenizer, full, &mut hits)
        else {
            continue;
        };
        if plan.params.enable_highlight_v1 {
            v1.push(v1_entry(field, &hits, &node));
        }
        set_path(&mut v2, anchor, node);
    }

    (v1, Value::Object(v2))
}

/// v2 node for the subtree under `segments`, or `None` when nothing
/// matched. `array_index` pins leaves to their outermost array element so
/// only the element that actually matched is annotated.
#[allow(clippy::too_many_arguments)]
fn highlight_subtree(
    value: &Value,
    segments: &[&str],
    array_index: Option<usize>,
    plan: &SearchPlan,
    leaves: &[TokenLeaf],
    tokenizer: &Tokenizer,
    full: bool,
    hits: &mut Vec<(Option<usize>, Highlighted)>,
) -> Option<Value> {
    match (segments.split_first(), value) {
        (None, Value::String(text)) => {
            let h = highlight_text(text, plan, leaves, tokenizer, full)?;
            hits.push((array_index, h.clone()));
            Some(highlight_node(&h))
        }
        (None, Value::Array(items)) => {
            let mut any = false;
            let mut nodes = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                let Some(text) = item.as_str() else {
                    nodes.push(Value::Null);
                    continue;
                };
                match highlight_text(text, plan, leaves, tokenizer, full) {
                    Some(h) => {
                        any = true;
                        hits.push((Some(array_index.unwrap_or(i)), h.clone()));
                        nodes.push(highlight_node(&h));
                    }
                    None => nodes.push(json!({"snippet": text, "matched_tokens": []})),
                }
            }
            any.then_some(Value::Array(nodes))
        }
        (Some((head, rest)), Value::Object(map)) => {
            let child = map.get(*head)?;
            let node =
                highlight_subtree(child, rest, array_index, plan, leaves, tokenizer, full, hits)?;
            let mut wrapped = Map::new();
            wrapped.insert((*head).to_string(), node);
            Some(Value::Object(wrapped))
        }
        (Some(_), Value::Array(items)) => {
            // Object array mid-path: elements that match carry their
            // highlight; siblings keep an empty slot at their position.
            let mut any = false;
            let mut nodes = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                let index = Some(array_index.unwrap_or(i));
                match highlight_subtree(item, segments, index, plan, leaves, tokenizer, full, hits)
                {
                    Some(node) => {
                        any = true;
                        nodes.push(node);
                    }
                    None => nodes.push(json!({})),
                }
            }
            any.then_some(Value::Array(nodes))
        }
        _ => None,
    }
}

/// v1 row for one highlighted field: scalar shape for a lone non-array
/// match, `snippets`/`indices` lists otherwise.
fn v1_entry(field: &str, hits: &[(Option<usize>, Highlighted)], node: &Value) -> Value {
    if hits.len() == 1 && hits[0].0.is_none() && !node.is_array() {
        let h = &hits[0].1;
        let mut entry = json!({
            "field": field,
            "snippet": h.snippet,
            "matched_tokens": h.matched_tokens,
        });
        if let Some(full_value) = &h.full {
            entry["value"] = json!(full_value);
        }
        return entry;
    }
    let snippets: Vec<&String> = hits.iter().map(|(_, h)| &h.snippet).collect();
    let indices: Vec<usize> = hits
        .iter()
        .enumerate()
        .map(|(k, (index, _))| index.unwrap_or(k))
        .collect();
    let matched: Vec<&Vec<String>> = hits.iter().map(|(_, h)| &h.matched_tokens).collect();
    json!({
        "field": field,
        "snippets": snippets,
        "indices": indices,
        "matched_tokens": matched,
    })
}

fn highlight_node(h: &Highlighted) -> Value {
    let mut node = json!({
        "snippet": h.snippet,
        "matched_tokens": h.matched_tokens,
    });
    if let Some(full) = &h.full {
        node["value"] = json!(full);
    }
    node
}

/// Fields to highlight: the explicit list, or every searched string field.
fn highlight_fields(plan: &SearchPlan) -> Vec<String> {
    if !plan.params.highlight_fields.is_empty() {
        return plan.params.highlight_fields.clone();
    }
    let mut fields: Vec<String> = plan.fields.iter().map(|f| f.name.clone()).collect();
    for full in &plan.params.highlight_full_fields {
        if full != "*" && !fields.contains(full) {
            fields.push(full.clone());
        }
    }
    fields
}

/// A matched span inside a tokenised value.
struct Span {
    byte_start: usize,
    byte_end: usize,
    token_index: usize,
    text: String,
}

fn highlight_text(
    text: &str,
    plan: &SearchPlan,
    leaves: &[TokenLeaf],
    tokenizer: &Tokenizer,
    full: bool,
) -> Option<Highlighted> {
    let tokens = tokenizer.tokenize(text);
    if tokens.is_empty() {
        return None;
    }

    let mut spans: Vec<Span> = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        let Some((start, end)) = match_token(&token.text, leaves) else {
            continue;
        };
        // Map the char-range of the match back onto the raw token bytes.
        let raw = &text[token.byte_start..token.byte_end];
        let byte_start = token.byte_start + char_to_byte(raw, start);
        let byte_end = token.byte_start + char_to_byte(raw, end);
        spans.push(Span {
            byte_start,
            byte_end,
            token_index: i,
            text: text[byte_start..byte_end].to_string(),
        });
    }
    if spans.is_empty() {
        return None;
    }

    let params = &plan.params;
    let matched_tokens: Vec<String> = spans.iter().map(|s| s.text.clone()).collect();

    let full_value = wrap(text, &spans, 0, text.len(), params);

    let snippet = if full || tokens.len() <= params.snippet_threshold {
        full_value.clone()
    } else {
        let anchor = spans[0].token_index;
        let affix = params.highlight_affix_num_tokens;
        let start_tok = anchor.saturating_sub(affix);
        let mut end_tok = (anchor + affix).min(tokens.len() - 1);
        if end_tok - start_tok + 1 > params.snippet_threshold {
            end_tok = start_tok + params.snippet_threshold - 1;
        }
        let lo = tokens[start_tok].byte_start;
        let hi = tokens[end_tok].byte_end;
        wrap(text, &spans, lo, hi, params)
    };

    Some(Highlighted {
        snippet,
        full: full.then_some(full_value),
        matched_tokens,
    })
}

/// Highlighted char-range of a document token against the query leaves,
/// or `None`.
fn match_token(token: &str, leaves: &[TokenLeaf]) -> Option<(usize, usize)> {
    let token_chars = token.chars().count();
    let mut best: Option<(usize, usize)> = None;

    for leaf in leaves {
        if token != leaf.leaf {
            continue;
        }
        let root_chars = leaf.root.chars().count();
        let span = if leaf.is_prefix && root_chars < token_chars {
            // Prefix hit: highlight the root-length prefix, or the whole
            // token when the leftover tail is tiny and the leaf came from
            // a typo expansion.
            if token_chars - root_chars <= 2 && leaf.cost > 0 {
                (0, token_chars)
            } else {
                (0, root_chars)
            }
        } else {
            (0, token_chars)
        };
        // Prefer the widest highlight across leaves.
        best = Some(match best {
            Some(existing) if existing.1 >= span.1 => existing,
            _ => span,
        });
    }
    best
}

/// Wrap matched spans intersecting `[lo, hi)` with the configured tags.
fn wrap(
    text: &str,
    spans: &[Span],
    lo: usize,
    hi: usize,
    params: &ferret_query::SearchParams,
) -> String {
    let mut out = String::with_capacity(hi - lo + 16);
    let mut cursor = lo;
    for span in spans {
        if span.byte_start < lo || span.byte_end > hi {
            continue;
        }
        out.push_str(&text[cursor..span.byte_start]);
        out.push_str(&params.highlight_start_tag);
        out.push_str(&text[span.byte_start..span.byte_end]);
        out.push_str(&params.highlight_end_tag);
        cursor = span.byte_end;
    }
    out.push_str(&text[cursor..hi]);
    out
}

fn char_to_byte(s: &str, char_index: usize) -> usize {
    s.char_indices()
        .nth(char_index)
        .map(|(b, _)| b)
        .unwrap_or(s.len())
}

/// Insert `value` at a dotted path, building intermediate objects.
fn set_path(map: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(inner) = entry {
                set_path(inner, rest, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{SearchField, SearchPlan};
    use ferret_query::{InfixMode, SearchParams, TextMatchType};
    use serde_json::json;

    fn plan_with(params: SearchParams) -> SearchPlan {
        SearchPlan {
            query_variants: vec![],
            raw_tokens: vec![],
            phrases: vec![],
            exclude_tokens: vec![],
            is_wildcard: false,
            fields: vec![SearchField {
                name: "title".into(),
                weight: 15,
                prefix: true,
                num_typos: 2,
                infix: InfixMode::Off,
            }],
            filter: None,
            sorts: vec![],
            group_by: vec![],
            group_limit: 3,
            group_missing_values: true,
            page: 1,
            per_page: 10,
            offset: 0,
            fetch_size: 250,
            pinned: vec![],
            hidden: vec![],
            filter_curated_hits: false,
            override_metadata: None,
            vector_query: None,
            text_match_type: TextMatchType::MaxScore,
            params,
        }
    }

    fn exact_leaf(token: &str) -> TokenLeaf {
        TokenLeaf {
            root: token.into(),
            leaf: token.into(),
            cost: 0,
            is_prefix: false,
        }
    }

    fn doc(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn exact_token_wrapped() {
        let plan = plan_with(SearchParams::default());
        let tokenizer = Tokenizer::default();
        let d = doc(json!({"title": "Denim jeans"}));
        let (v1, v2) = build_highlights(&d, &plan, &[exact_leaf("denim")], &tokenizer);
        assert_eq!(v1[0]["snippet"], "<mark>Denim</mark> jeans");
        assert_eq!(v1[0]["matched_tokens"][0], "Denim");
        assert_eq!(v2["title"]["snippet"], "<mark>Denim</mark> jeans");
    }

    #[test]
    fn prefix_highlights_root_only() {
        let plan = plan_with(SearchParams::default());
        let tokenizer = Tokenizer::default();
        let d = doc(json!({"title": "application"}));
        let leaf = TokenLeaf {
            root: "app".into(),
            leaf: "application".into(),
            cost: 0,
            is_prefix: true,
        };
        let (v1, _) = build_highlights(&d, &plan, &[leaf], &tokenizer);
        assert_eq!(v1[0]["snippet"], "<mark>app</mark>lication");
        assert_eq!(v1[0]["matched_tokens"][0], "app");
    }

    #[test]
    fn prefix_typo_with_short_tail_highlights_whole_token() {
        let plan = plan_with(SearchParams::default());
        let tokenizer = Tokenizer::default();
        let d = doc(json!({"title": "apples"}));
        let leaf = TokenLeaf {
            root: "appl".into(),
            leaf: "apples".into(),
            cost: 1,
            is_prefix: true,
        };
        let (v1, _) = build_highlights(&d, &plan, &[leaf], &tokenizer);
        assert_eq!(v1[0]["snippet"], "<mark>apples</mark>");
    }

    #[test]
    fn snippet_windows_long_values() {
        let params = SearchParams {
            snippet_threshold: 5,
            highlight_affix_num_tokens: 1,
            ..Default::default()
        };
        let plan = plan_with(params);
        let tokenizer = Tokenizer::default();
        let text = "one two three four five six seven target nine ten eleven";
        let d = doc(json!({"title": text}));
        let (v1, _) = build_highlights(&d, &plan, &[exact_leaf("target")], &tokenizer);
        assert_eq!(v1[0]["snippet"], "seven <mark>target</mark> nine");
    }

    #[test]
    fn short_values_emit_whole_text() {
        let plan = plan_with(SearchParams::default());
        let tokenizer = Tokenizer::default();
        let d = doc(json!({"title": "tiny target text"}));
        let (v1, _) = build_highlights(&d, &plan, &[exact_leaf("target")], &tokenizer);
        assert_eq!(v1[0]["snippet"], "tiny <mark>target</mark> text");
    }

    #[test]
    fn array_fields_highlight_matching_elements() {
        let mut plan = plan_with(SearchParams::default());
        plan.fields[0].name = "tags".into();
        let tokenizer = Tokenizer::default();
        let d = doc(json!({"tags": ["red shoe", "blue sock"]}));
        let (v1, v2) = build_highlights(&d, &plan, &[exact_leaf("shoe")], &tokenizer);
        assert_eq!(v1[0]["snippets"][0], "red <mark>shoe</mark>");
        assert_eq!(v1[0]["indices"][0], 0);
        assert_eq!(v2["tags"][0]["snippet"], "red <mark>shoe</mark>");
        assert_eq!(v2["tags"][1]["matched_tokens"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn object_array_annotates_only_matching_element() {
        let mut plan = plan_with(SearchParams::default());
        plan.fields[0].name = "variants.sku".into();
        let tokenizer = Tokenizer::default();
        let d = doc(json!({"variants": [{"sku": "red shoe"}, {"sku": "blue sock"}]}));
        let (v1, v2) = build_highlights(&d, &plan, &[exact_leaf("shoe")], &tokenizer);
        assert_eq!(
            v2["variants"][0]["sku"]["snippet"],
            "red <mark>shoe</mark>"
        );
        assert_eq!(v2["variants"][1], json!({}));
        assert_eq!(v1[0]["indices"], json!([0]));
        assert_eq!(v1[0]["snippets"][0], "red <mark>shoe</mark>");
        assert_eq!(v1[0]["matched_tokens"][0][0], "shoe");
    }

    #[test]
    fn object_array_with_gaps_keeps_element_positions() {
        // The middle element lacks the leaf entirely; the matching third
        // element still reports its true position.
        let mut plan = plan_with(SearchParams::default());
        plan.fields[0].name = "variants.sku".into();
        let tokenizer = Tokenizer::default();
        let d = doc(json!({
            "variants": [{"sku": "plain"}, {"color": "red"}, {"sku": "target item"}]
        }));
        let (v1, v2) = build_highlights(&d, &plan, &[exact_leaf("target")], &tokenizer);
        assert_eq!(v2["variants"][1], json!({}));
        assert_eq!(
            v2["variants"][2]["sku"]["snippet"],
            "<mark>target</mark> item"
        );
        assert_eq!(v1[0]["indices"], json!([2]));
    }

    #[test]
    fn nested_paths_mirror_structure_in_v2() {
        let mut plan = plan_with(SearchParams::default());
        plan.fields[0].name = "meta.title".into();
        let tokenizer = Tokenizer::default();
        let d = doc(json!({"meta": {"title": "deep denim"}}));
        let (_, v2) = build_highlights(&d, &plan, &[exact_leaf("denim")], &tokenizer);
        assert_eq!(v2["meta"]["title"]["snippet"], "deep <mark>denim</mark>");
    }

    #[test]
    fn full_fields_carry_value() {
        let params = SearchParams {
            highlight_full_fields: vec!["title".into()],
            snippet_threshold: 2,
            ..Default::default()
        };
        let plan = plan_with(params);
        let tokenizer = Tokenizer::default();
        let d = doc(json!({"title": "alpha beta gamma delta target"}));
        let (v1, _) = build_highlights(&d, &plan, &[exact_leaf("target")], &tokenizer);
        let value = v1[0]["value"].as_str().unwrap();
        assert!(value.ends_with("<mark>target</mark>"));
        assert!(value.starts_with("alpha"));
    }

    #[test]
    fn stripping_tags_yields_contiguous_substring() {
        let params = SearchParams {
            snippet_threshold: 3,
            highlight_affix_num_tokens: 1,
            ..Default::default()
        };
        let plan = plan_with(params);
        let tokenizer = Tokenizer::default();
        let text = "zero one two three target five six";
        let d = doc(json!({"title": text}));
        let (v1, _) = build_highlights(&d, &plan, &[exact_leaf("target")], &tokenizer);
        let snippet = v1[0]["snippet"].as_str().unwrap();
        let stripped = snippet.replace("<mark>", "").replace("</mark>", "");
        assert!(text.contains(&stripped), "`{stripped}` not in `{text}`");
    }

    #[test]
    fn no_matches_no_highlight() {
        let plan = plan_with(SearchParams::default());
        let tokenizer = Tokenizer::default();
        let d = doc(json!({"title": "plain text"}));
        let (v1, v2) = build_highlights(&d, &plan, &[exact_leaf("absent")], &tokenizer);
        assert!(v1.is_empty());
        assert_eq!(v2, json!({}));
    }
}

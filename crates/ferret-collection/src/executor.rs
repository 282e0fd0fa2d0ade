use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Instant;

use roaring::RoaringBitmap;

use ferret_index::{Match, TermHit, ordered_f64};
use ferret_query::{DropTokensMode, InfixMode, TextMatchType};

use crate::error::Error;
use crate::index::Index;
use crate::planner::{ResolvedSortBy, SearchField, SearchPlan};
use crate::schema::Schema;
use crate::topster::{
    CURATED_RECORD_IDENTIFIER, DEFAULT_TOPSTER_SIZE, Group, GroupedTopster, Kv, Topster,
};

/// A query-token expansion actually used for matching; feeds the
/// highlighter.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenLeaf {
    pub root: String,
    pub leaf: String,
    pub cost: u8,
    pub is_prefix: bool,
}

/// Everything the executor needs besides the plan.
pub struct ExecuteContext<'a> {
    pub index: &'a Index,
    pub schema: &'a Schema,
    /// doc id → live seq id, for pinned/hidden resolution.
    pub seq_of: &'a dyn Fn(&str) -> Option<u32>,
    pub deadline: Instant,
}

pub struct Outcome {
    /// Ranked candidates, best first (ungrouped searches).
    pub hits: Vec<Kv>,
    /// Ranked groups (grouped searches); `hits` is empty then.
    pub groups: Vec<Group>,
    /// Curated entries with their 1-based target positions.
    pub curated: Vec<(usize, Kv)>,
    pub found: u64,
    /// Underlying documents for grouped searches (= `found` otherwise).
    pub found_docs: u64,
    /// Every matched document, for faceting.
    pub matched: RoaringBitmap,
    pub search_cutoff: bool,
    pub leaves: Vec<TokenLeaf>,
}

/// Per-document text-match state accumulated across fields and variants.
#[derive(Debug, Default, Clone)]
struct DocScore {
    tokens_matched: u8,
    best_score: u64,
    best_score_weight: u32,
    best_weight: u32,
    best_weight_score: u64,
    /// Bit per field that matched; distinct-field count feeds the score.
    fields_mask: u16,
    /// Variant that produced the best field score.
    query_index: u16,
}

pub fn execute(plan: &SearchPlan, ctx: &ExecuteContext) -> Result<Outcome, Error> {
    let mut cutoff = false;

    // ── Shared bitmaps ──────────────────────────────────────────
    let filter_docs = match &plan.filter {
        Some(node) => Some(ctx.index.eval_filter(node, ctx.schema)?),
        None => None,
    };
    let hidden_docs: RoaringBitmap = plan
        .hidden
        .iter()
        .filter_map(|id| (ctx.seq_of)(id))
        .collect();
    let excluded_docs = excluded_docs(plan, ctx.index);

    let eligible = |seq: u32| -> bool {
        if hidden_docs.contains(seq) || excluded_docs.contains(seq) {
            return false;
        }
        filter_docs.as_ref().is_none_or(|f| f.contains(seq))
    };

    // ── Eval-sort bitmaps ───────────────────────────────────────
    let mut eval_docs: Vec<Option<RoaringBitmap>> = Vec::new();
    for sort in &plan.sorts {
        eval_docs.push(match &sort.by {
            ResolvedSortBy::Eval { filter } => {
                Some(ctx.index.eval_filter(filter, ctx.schema)?)
            }
            _ => None,
        });
    }

    // ── String-sort rank maps ───────────────────────────────────
    let str_ranks = build_str_ranks(plan, ctx.index);

    // ── Vector candidates ───────────────────────────────────────
    let vector_hits: Option<HashMap<u32, f32>> = match &plan.vector_query {
        Some(vq) if !vq.values.is_empty() => {
            let column = ctx.index.vector_column(&vq.field).ok_or_else(|| {
                Error::NotFound(format!("vector field `{}` has no indexed data", vq.field))
            })?;
            let k = vq.k.unwrap_or(plan.fetch_size).max(plan.fetch_size);
            let mut hits: HashMap<u32, f32> = column
                .nearest(&vq.values, k)
                .into_iter()
                .filter(|&(seq, _)| eligible(seq))
                .collect();
            if let Some(threshold) = vq.distance_threshold {
                hits.retain(|_, d| *d <= threshold);
            }
            Some(hits)
        }
        _ => None,
    };

    let group_keys = |seq: u32| group_key_for(plan, ctx, seq);

    let mut found_bitmap = RoaringBitmap::new();
    let mut leaves: Vec<TokenLeaf> = Vec::new();

    // doc -> best text state across variants
    let mut doc_scores: HashMap<u32, DocScore> = HashMap::new();

    if !plan.is_wildcard {
        for (query_index, variant) in plan.query_variants.iter().enumerate() {
            if Instant::now() >= ctx.deadline {
                cutoff = true;
                break;
            }
            match_variant(
                plan,
                ctx,
                variant,
                query_index as u16,
                &eligible,
                &mut doc_scores,
                &mut leaves,
                &mut cutoff,
            );
        }
    }

    // ── Assemble candidates into topsters ───────────────────────
    let grouped = !plan.group_by.is_empty();
    let mut topster = Topster::new(plan.fetch_size.max(DEFAULT_TOPSTER_SIZE));
    let mut grouped_topster = GroupedTopster::new(
        plan.fetch_size.max(DEFAULT_TOPSTER_SIZE),
        plan.group_limit,
    );

    let text_slot = plan
        .sorts
        .iter()
        .position(|s| matches!(s.by, ResolvedSortBy::TextMatch { .. }));

    let mut push_doc = |seq: u32,
                        query_index: u16,
                        text_score: u64,
                        vector_distance: Option<f32>,
                        fused: Option<f64>,
                        topster: &mut Topster,
                        grouped_topster: &mut GroupedTopster| {
        let mut scores = [0i64; 3];
        for (slot, sort) in plan.sorts.iter().enumerate() {
            let value = match &sort.by {
                ResolvedSortBy::TextMatch { .. } => match fused {
                    Some(f) => ordered_f64(f),
                    None => text_score as i64,
                },
                ResolvedSortBy::NumField { field, .. } => ctx
                    .index
                    .num_column(field)
                    .and_then(|c| c.sort_key(seq))
                    .unwrap_or(i64::MIN / 2),
                ResolvedSortBy::StrField { field } => str_ranks
                    .get(field)
                    .and_then(|ranks| ranks.get(&seq).copied())
                    .unwrap_or(i64::MIN / 2),
                ResolvedSortBy::SeqId => seq as i64,
                ResolvedSortBy::Eval { .. } => eval_docs[slot]
                    .as_ref()
                    .map(|b| i64::from(b.contains(seq)))
                    .unwrap_or(0),
                ResolvedSortBy::Geo { field, lat, lng } => ctx
                    .index
                    .geo_column(field)
                    .and_then(|c| c.distance_meters(seq, *lat, *lng))
                    .map(|m| m.round() as i64)
                    .unwrap_or(i64::MIN / 2),
                ResolvedSortBy::VectorDistance => vector_distance
                    .map(|d| ordered_f64(d as f64))
                    .unwrap_or(i64::MIN / 2),
                ResolvedSortBy::GroupFound => 0,
            };
            // Ascending clauses negate so bigger always wins. Sentinels
            // stay at the bottom either way.
            scores[slot] = if sort.descending || value == i64::MIN / 2 {
                value
            } else {
                -value
            };
        }

        let kv = Kv {
            query_index,
            seq_id: seq,
            distinct_key: if grouped { group_keys(seq) } else { seq as u64 },
            match_score_index: text_slot.unwrap_or(0) as u8,
            scores,
            text_match_score: text_score,
            vector_distance: vector_distance.unwrap_or(0.0),
        };
        if grouped {
            grouped_topster.add(kv);
        } else {
            topster.add(kv);
        }
    };

    if plan.is_wildcard {
        match &vector_hits {
            Some(hits) => {
                // Pure vector browse: distance ranks alone.
                for (&seq, &distance) in hits {
                    found_bitmap.insert(seq);
                    push_doc(
                        seq,
                        0,
                        0,
                        Some(distance),
                        None,
                        &mut topster,
                        &mut grouped_topster,
                    );
                }
            }
            None => {
                let mut docs = ctx.index.seq_ids().clone();
                if let Some(filter) = &filter_docs {
                    docs &= filter;
                }
                docs -= &hidden_docs;
                docs -= &excluded_docs;
                for seq in docs.iter() {
                    found_bitmap.insert(seq);
                    push_doc(seq, 0, 0, None, None, &mut topster, &mut grouped_topster);
                }
            }
        }
    } else {
        // Text ranks first so hybrid fusion can use them.
        let mut ranked: Vec<(u32, u64, u16)> = doc_scores
            .iter()
            .map(|(&seq, score)| (seq, composite_text_score(score, plan), score.query_index))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(b.0.cmp(&a.0)));
        let text_rank: HashMap<u32, usize> = ranked
            .iter()
            .enumerate()
            .map(|(rank, &(seq, _, _))| (seq, rank))
            .collect();

        let vector_rank: HashMap<u32, usize> = match &vector_hits {
            Some(hits) => {
                let mut by_distance: Vec<(u32, f32)> =
                    hits.iter().map(|(&s, &d)| (s, d)).collect();
                by_distance.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
                by_distance
                    .iter()
                    .enumerate()
                    .map(|(rank, &(seq, _))| (seq, rank))
                    .collect()
            }
            None => HashMap::new(),
        };
        let alpha = plan
            .vector_query
            .as_ref()
            .and_then(|vq| vq.alpha)
            .unwrap_or(0.3) as f64;

        for (seq, text_score, query_index) in &ranked {
            found_bitmap.insert(*seq);
            let vector_distance = vector_hits.as_ref().and_then(|h| h.get(seq)).copied();
            let fused = match &vector_hits {
                Some(_) => {
                    let tr = text_rank.get(seq).copied().unwrap_or(usize::MAX);
                    Some(fused_score(tr, vector_rank.get(seq).copied(), alpha))
                }
                None => None,
            };
            push_doc(
                *seq,
                *query_index,
                *text_score,
                vector_distance,
                fused,
                &mut topster,
                &mut grouped_topster,
            );
        }

        // Vector-only hits join the candidate set in hybrid mode.
        if let Some(hits) = &vector_hits {
            for (&seq, &distance) in hits {
                if text_rank.contains_key(&seq) {
                    continue;
                }
                found_bitmap.insert(seq);
                let fused = fused_score(usize::MAX, vector_rank.get(&seq).copied(), alpha);
                push_doc(
                    seq,
                    0,
                    0,
                    Some(distance),
                    Some(fused),
                    &mut topster,
                    &mut grouped_topster,
                );
            }
        }
    }

    // ── Curated hits ────────────────────────────────────────────
    let mut curated: Vec<(usize, Kv)> = Vec::new();
    for (doc_id, position) in &plan.pinned {
        let Some(seq) = (ctx.seq_of)(doc_id) else {
            continue;
        };
        if plan.filter_curated_hits && !filter_docs.as_ref().is_none_or(|f| f.contains(seq)) {
            continue;
        }
        if hidden_docs.contains(seq) {
            continue;
        }
        found_bitmap.insert(seq);
        curated.push((
            *position,
            Kv {
                query_index: 0,
                seq_id: seq,
                distinct_key: seq as u64,
                match_score_index: CURATED_RECORD_IDENTIFIER,
                scores: [i64::MAX, i64::MAX, i64::MAX],
                text_match_score: 0,
                vector_distance: 0.0,
            },
        ));
    }
    curated.sort_by_key(|&(position, _)| position);

    // ── Finalise ────────────────────────────────────────────────
    let (hits, groups, found) = if grouped {
        let group_found_order = plan.sorts.iter().enumerate().find_map(|(slot, sort)| {
            matches!(sort.by, ResolvedSortBy::GroupFound)
                .then_some((slot, !sort.descending))
        });
        let groups = grouped_topster.finalize(group_found_order);
        let found = groups.len() as u64;
        (Vec::new(), groups, found)
    } else {
        let mut hits = topster.sorted();
        apply_text_match_buckets(plan, &mut hits, text_slot);
        let found = found_bitmap.len();
        (hits, Vec::new(), found)
    };

    Ok(Outcome {
        hits,
        groups,
        curated,
        found,
        found_docs: found_bitmap.len(),
        matched: found_bitmap,
        search_cutoff: cutoff,
        leaves,
    })
}

/// Candidate set for one token within one field: doc → (cost, positions).
struct TokenDocs {
    docs: HashMap<u32, (u8, Vec<u16>)>,
}

#[allow(clippy::too_many_arguments)]
fn match_variant(
    plan: &SearchPlan,
    ctx: &ExecuteContext,
    variant: &[String],
    query_index: u16,
    eligible: &dyn Fn(u32) -> bool,
    doc_scores: &mut HashMap<u32, DocScore>,
    leaves: &mut Vec<TokenLeaf>,
    cutoff: &mut bool,
) {
    for (field_id, field) in plan.fields.iter().enumerate() {
        if Instant::now() >= ctx.deadline {
            *cutoff = true;
            return;
        }
        let Some(term_index) = ctx.index.term_index(&field.name) else {
            continue;
        };

        // Exact-only pass decides whether typo expansion is needed.
        let exact_docs = exact_doc_count(term_index, variant);
        let expand = plan.params.exhaustive_search
            || exact_docs < plan.params.typo_tokens_threshold;

        let token_docs: Vec<TokenDocs> = variant
            .iter()
            .enumerate()
            .map(|(i, token)| {
                gather_token_docs(
                    plan,
                    field,
                    term_index,
                    token,
                    i + 1 == variant.len(),
                    expand,
                    leaves,
                )
            })
            .collect();

        // Full intersection, then drop-token fallback.
        let mut matched = intersect_docs(&token_docs, (0..variant.len()).collect());
        if matched.len() < plan.params.drop_tokens_threshold && variant.len() > 1 {
            let orders = drop_orders(variant.len(), plan.params.drop_tokens_mode);
            for kept in orders {
                let extra = intersect_docs(&token_docs, kept);
                for (seq, tokens) in extra {
                    matched.entry(seq).or_insert(tokens);
                }
                if matched.len() >= plan.params.drop_tokens_threshold {
                    break;
                }
            }
        }

        for (seq, kept_tokens) in matched {
            if !eligible(seq) {
                continue;
            }
            // Per-token offset streams for the proximity window.
            let mut offsets: Vec<Vec<u16>> = vec![Vec::new(); variant.len()];
            let mut total_cost: u32 = 0;
            for &token_i in &kept_tokens {
                if let Some((cost, positions)) = token_docs[token_i].docs.get(&seq) {
                    offsets[token_i] = positions.clone();
                    total_cost += *cost as u32;
                }
            }

            if !phrases_hold(plan, variant, &offsets) {
                continue;
            }

            let m = Match::compute(&offsets);
            if m.words_present == 0 {
                continue;
            }
            let field_score = if plan.params.prioritize_token_position {
                let proximity = 255u64.saturating_sub(m.start_offset.min(255) as u64);
                ((m.words_present as u64) << 24)
                    | ((255u64.saturating_sub(total_cost as u64)) << 16)
                    | (proximity << 8)
                    | (field_id as u64)
            } else {
                m.field_score(total_cost, field_id as u8)
            };

            let entry = doc_scores.entry(seq).or_default();
            entry.tokens_matched = entry.tokens_matched.max(m.words_present);
            entry.fields_mask |= 1u16 << (field_id.min(15));
            if field_score > entry.best_score {
                entry.best_score = field_score;
                entry.best_score_weight = field.weight;
                entry.query_index = query_index;
            }
            if field.weight > entry.best_weight
                || (field.weight == entry.best_weight && field_score > entry.best_weight_score)
            {
                entry.best_weight = field.weight;
                entry.best_weight_score = field_score;
            }
        }
    }
}

fn exact_doc_count(term_index: &ferret_index::TermIndex, variant: &[String]) -> usize {
    let mut acc: Option<RoaringBitmap> = None;
    for token in variant {
        let docs = term_index
            .postings(token)
            .map(|p| p.doc_ids())
            .unwrap_or_default();
        acc = Some(match acc {
            Some(a) => a & docs,
            None => docs,
        });
    }
    acc.map(|a| a.len() as usize).unwrap_or(0)
}

fn gather_token_docs(
    plan: &SearchPlan,
    field: &SearchField,
    term_index: &ferret_index::TermIndex,
    token: &str,
    is_last: bool,
    expand: bool,
    leaves: &mut Vec<TokenLeaf>,
) -> TokenDocs {
    let params = &plan.params;
    let mut candidates: Vec<TermHit> = Vec::new();

    let exact_exists = term_index.postings(token).is_some();
    if exact_exists {
        candidates.push(TermHit {
            term: token.to_string(),
            cost: 0,
            is_prefix: false,
        });
    }

    if expand {
        let budget = typo_budget(params, field, token);
        if budget > 0 {
            candidates.extend(term_index.fuzzy_terms(token, budget, params.max_candidates));
        }
        if field.prefix && is_last {
            candidates.extend(term_index.prefix_terms(token, params.max_candidates));
        }
        match field.infix {
            InfixMode::Always => {
                candidates.extend(term_index.infix_terms(token, params.max_candidates));
            }
            InfixMode::Fallback if !exact_exists => {
                candidates.extend(term_index.infix_terms(token, params.max_candidates));
            }
            _ => {}
        }
    }
    candidates.truncate(params.max_candidates.max(1));

    let mut docs: HashMap<u32, (u8, Vec<u16>)> = HashMap::new();
    for hit in &candidates {
        let Some(postings) = term_index.postings(&hit.term) else {
            continue;
        };
        // A prefix expansion costs one typo unit unless exact matches are
        // not being prioritised.
        let cost = hit.cost
            + u8::from(hit.is_prefix && params.prioritize_exact_match);
        for (seq, positions) in postings.iter() {
            match docs.get_mut(&seq) {
                Some((existing_cost, existing_positions)) => {
                    if cost < *existing_cost {
                        *existing_cost = cost;
                        *existing_positions = positions.to_vec();
                    }
                }
                None => {
                    docs.insert(seq, (cost, positions.to_vec()));
                }
            }
        }
        let leaf = TokenLeaf {
            root: token.to_string(),
            leaf: hit.term.clone(),
            cost: hit.cost,
            is_prefix: hit.is_prefix,
        };
        if !leaves.contains(&leaf) {
            leaves.push(leaf);
        }
    }
    TokenDocs { docs }
}

fn typo_budget(
    params: &ferret_query::SearchParams,
    field: &SearchField,
    token: &str,
) -> u8 {
    let len = token.chars().count();
    let mut budget = field.num_typos;
    if len < params.min_len_1typo {
        budget = 0;
    } else if len < params.min_len_2typo {
        budget = budget.min(1);
    }
    let has_digit = token.chars().any(|c| c.is_ascii_digit());
    let has_alpha = token.chars().any(char::is_alphabetic);
    if has_digit && !has_alpha && !params.enable_typos_for_numerical_tokens {
        budget = 0;
    }
    if has_digit && has_alpha && !params.enable_typos_for_alpha_numerical_tokens {
        budget = 0;
    }
    budget.min(2)
}

/// Docs present in every kept token's candidate set, tagged with the kept
/// token indexes.
fn intersect_docs(token_docs: &[TokenDocs], kept: Vec<usize>) -> HashMap<u32, Vec<usize>> {
    let mut out: HashMap<u32, Vec<usize>> = HashMap::new();
    let Some(&first) = kept.first() else {
        return out;
    };
    'docs: for &seq in token_docs[first].docs.keys() {
        for &token_i in &kept[1..] {
            if !token_docs[token_i].docs.contains_key(&seq) {
                continue 'docs;
            }
        }
        out.insert(seq, kept.clone());
    }
    out
}

/// Token subsets to try, in order, when dropping tokens.
fn drop_orders(num_tokens: usize, mode: DropTokensMode) -> Vec<Vec<usize>> {
    let all: Vec<usize> = (0..num_tokens).collect();
    let mut orders = Vec::new();
    match mode {
        DropTokensMode::RightToLeft => {
            for keep in (1..num_tokens).rev() {
                orders.push(all[..keep].to_vec());
            }
        }
        DropTokensMode::LeftToRight => {
            for drop in 1..num_tokens {
                orders.push(all[drop..].to_vec());
            }
        }
        DropTokensMode::BothSides => {
            for keep in (1..num_tokens).rev() {
                orders.push(all[..keep].to_vec());
                orders.push(all[num_tokens - keep..].to_vec());
            }
        }
    }
    orders
}

/// Every quoted phrase must appear with adjacent, in-order positions.
fn phrases_hold(plan: &SearchPlan, variant: &[String], offsets: &[Vec<u16>]) -> bool {
    'phrases: for phrase in &plan.phrases {
        // Map phrase tokens onto variant token indexes.
        let mut streams: Vec<&[u16]> = Vec::with_capacity(phrase.len());
        for token in phrase {
            match variant.iter().position(|t| t == token) {
                Some(i) if !offsets[i].is_empty() => streams.push(&offsets[i]),
                // Synonym variants may not carry the phrase tokens; the
                // phrase constraint does not apply to them.
                _ => continue 'phrases,
            }
        }
        let mut found = false;
        'starts: for &start in streams[0] {
            for (k, stream) in streams.iter().enumerate().skip(1) {
                if !stream.contains(&(start + k as u16)) {
                    continue 'starts;
                }
            }
            found = true;
            break;
        }
        if !found {
            return false;
        }
    }
    true
}

/// §4.4 composite layouts. `max_score`:
/// `sign(1) | tokens(4) | best_field_score(48) | best_field_weight(8) |
/// num_matching_fields(3)`; `max_weight` swaps score and weight.
fn composite_text_score(score: &DocScore, plan: &SearchPlan) -> u64 {
    let fields = if plan.params.prioritize_num_matching_fields {
        (score.fields_mask.count_ones().min(7)) as u64
    } else {
        0
    };
    let tokens = (score.tokens_matched.min(15)) as u64;
    match plan.text_match_type {
        TextMatchType::MaxScore => {
            (tokens << 59)
                | ((score.best_score & 0xFFFF_FFFF_FFFF) << 11)
                | (((score.best_score_weight & 0xFF) as u64) << 3)
                | fields
        }
        TextMatchType::MaxWeight => {
            (tokens << 59)
                | (((score.best_weight & 0xFF) as u64) << 51)
                | ((score.best_weight_score & 0xFFFF_FFFF_FFFF) << 3)
                | fields
        }
    }
}

fn fused_score(text_rank: usize, vector_rank: Option<usize>, alpha: f64) -> f64 {
    let text_part = if text_rank == usize::MAX {
        0.0
    } else {
        (1.0 - alpha) / (text_rank as f64 + 1.0)
    };
    let vector_part = match vector_rank {
        Some(rank) => alpha / (rank as f64 + 1.0),
        None => 0.0,
    };
    text_part + vector_part
}

fn excluded_docs(plan: &SearchPlan, index: &Index) -> RoaringBitmap {
    let mut out = RoaringBitmap::new();
    for token in &plan.exclude_tokens {
        for field in &plan.fields {
            if let Some(postings) = index.term_index(&field.name).and_then(|t| t.postings(token))
            {
                out |= postings.doc_ids();
            }
        }
    }
    out
}

/// Rank maps for string-field sorts: distinct values in order → rank.
fn build_str_ranks(plan: &SearchPlan, index: &Index) -> HashMap<String, HashMap<u32, i64>> {
    let mut out = HashMap::new();
    for sort in &plan.sorts {
        let ResolvedSortBy::StrField { field } = &sort.by else {
            continue;
        };
        let Some(column) = index.str_column(field) else {
            continue;
        };
        let mut ranks: HashMap<u32, i64> = HashMap::new();
        let mut distinct: Vec<(&str, u32)> = Vec::new();
        for seq in index.seq_ids().iter() {
            if let Some(value) = column.sort_key(seq) {
                distinct.push((value, seq));
            }
        }
        distinct.sort_by(|a, b| a.0.cmp(b.0).then(a.1.cmp(&b.1)));
        for (rank, (_, seq)) in distinct.iter().enumerate() {
            ranks.insert(*seq, rank as i64);
        }
        out.insert(field.clone(), ranks);
    }
    out
}

fn group_key_for(plan: &SearchPlan, ctx: &ExecuteContext, seq: u32) -> u64 {
    let mut hasher = DefaultHasher::new();
    let mut any_value = false;
    for field in &plan.group_by {
        let values: Vec<String> = ctx
            .index
            .str_column(field)
            .map(|c| c.values_of(seq).to_vec())
            .unwrap_or_default();
        if !values.is_empty() {
            any_value = true;
        }
        values.hash(&mut hasher);
    }
    if !any_value && !plan.group_missing_values {
        // Docs with no group value each form their own group.
        return (1u64 << 63) | seq as u64;
    }
    hasher.finish() & !(1u64 << 63)
}

/// Blockwise flattening of near-tied text scores over the first
/// [`DEFAULT_TOPSTER_SIZE`] hits.
fn apply_text_match_buckets(plan: &SearchPlan, hits: &mut [Kv], text_slot: Option<usize>) {
    let Some(slot) = text_slot else {
        return;
    };
    let buckets = plan.sorts.iter().find_map(|s| match &s.by {
        ResolvedSortBy::TextMatch { buckets } => *buckets,
        _ => None,
    });
    let Some(buckets) = buckets else {
        return;
    };
    if buckets == 0 || plan.is_wildcard {
        return;
    }

    let window = hits.len().min(DEFAULT_TOPSTER_SIZE);
    if window == 0 {
        return;
    }
    let block = window.div_ceil(buckets);
    if block == 0 {
        return;
    }
    for start in (0..window).step_by(block) {
        let anchor = hits[start].scores[slot];
        let end = (start + block).min(window);
        for hit in hits.iter_mut().take(end).skip(start) {
            hit.scores[slot] = anchor;
        }
    }
    hits[..window].sort_by(|a, b| (b.scores, b.seq_id).cmp(&(a.scores, a.seq_id)));
}

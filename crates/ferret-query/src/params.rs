use serde::{Deserialize, Serialize};

/// Write-path verb for document indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexOp {
    /// Fail with a conflict when the id already exists.
    Create,
    /// Fail with not-found when the id is absent; merges fields.
    Update,
    /// Insert or replace wholesale.
    Upsert,
    /// Insert or shallow-merge.
    Emplace,
}

/// Policy for fields that fail type validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirtyValues {
    Reject,
    Drop,
    CoerceOrReject,
    CoerceOrDrop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfixMode {
    Off,
    Always,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropTokensMode {
    RightToLeft,
    LeftToRight,
    BothSides,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextMatchType {
    MaxScore,
    MaxWeight,
}

/// Every recognised search parameter, with engine defaults. Construct with
/// struct-update syntax over `SearchParams::default()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    /// Query text; `*` browses (no text matching).
    pub q: String,
    /// Ordered list of searched fields.
    pub query_by: Vec<String>,
    /// Per-field weights; defaults to descending when omitted.
    pub query_by_weights: Vec<u32>,
    /// Raw `filter_by` expression; empty means unfiltered.
    pub filter_by: String,

    // ── Faceting ────────────────────────────────────────────────
    pub facet_by: Vec<String>,
    pub facet_query: Option<String>,
    pub max_facet_values: usize,
    /// Percent of candidates counted when sampling kicks in.
    pub facet_sample_percent: u8,
    /// Candidate count above which facet sampling applies.
    pub facet_sample_threshold: usize,
    pub facet_return_parent: Vec<String>,

    // ── Sorting / grouping / pagination ─────────────────────────
    /// Raw `sort_by` string; up to three clauses.
    pub sort_by: String,
    pub group_by: Vec<String>,
    pub group_limit: usize,
    pub group_missing_values: bool,
    pub page: Option<usize>,
    pub per_page: usize,
    pub offset: Option<usize>,
    pub limit_hits: usize,

    // ── Recall / precision ──────────────────────────────────────
    /// Per-field prefix matching; last entry repeats.
    pub prefix: Vec<bool>,
    /// Per-field typo budget (0..=2); last entry repeats.
    pub num_typos: Vec<u8>,
    pub infix: Vec<InfixMode>,
    pub min_len_1typo: usize,
    pub min_len_2typo: usize,
    pub max_candidates: usize,
    pub typo_tokens_threshold: usize,
    pub drop_tokens_threshold: usize,
    pub drop_tokens_mode: DropTokensMode,
    pub exhaustive_search: bool,
    pub search_stop_millis: u64,
    pub split_join_tokens: bool,

    // ── Curation ────────────────────────────────────────────────
    /// `doc_id:position` pairs, e.g. `["42:1", "7:2"]`.
    pub pinned_hits: Vec<String>,
    pub hidden_hits: Vec<String>,
    pub override_tags: Vec<String>,
    pub enable_overrides: bool,
    pub filter_curated_hits: Option<bool>,

    // ── Projection & highlighting ───────────────────────────────
    pub include_fields: Vec<String>,
    pub exclude_fields: Vec<String>,
    pub highlight_fields: Vec<String>,
    pub highlight_full_fields: Vec<String>,
    pub highlight_start_tag: String,
    pub highlight_end_tag: String,
    pub snippet_threshold: usize,
    pub highlight_affix_num_tokens: usize,
    pub enable_highlight_v1: bool,

    // ── Semantic & side-channels ────────────────────────────────
    /// Raw `vector_query` expression.
    pub vector_query: Option<String>,
    pub remote_embedding_timeout_ms: u64,
    pub remote_embedding_num_tries: u32,
    /// Base64 audio to transcribe into `q`; needs the collection's
    /// transcription model.
    pub voice_query: Option<String>,
    pub conversation: bool,
    pub conversation_model_id: Option<String>,
    pub conversation_id: Option<String>,

    // ── Scoring knobs ───────────────────────────────────────────
    pub text_match_type: TextMatchType,
    pub prioritize_exact_match: bool,
    pub prioritize_token_position: bool,
    pub prioritize_num_matching_fields: bool,
    pub enable_typos_for_numerical_tokens: bool,
    pub enable_typos_for_alpha_numerical_tokens: bool,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            q: "*".to_string(),
            query_by: Vec::new(),
            query_by_weights: Vec::new(),
            filter_by: String::new(),

            facet_by: Vec::new(),
            facet_query: None,
            max_facet_values: 10,
            facet_sample_percent: 100,
            facet_sample_threshold: 0,
            facet_return_parent: Vec::new(),

            sort_by: String::new(),
            group_by: Vec::new(),
            group_limit: 3,
            group_missing_values: true,
            page: None,
            per_page: 10,
            offset: None,
            limit_hits: usize::MAX,

            prefix: vec![true],
            num_typos: vec![2],
            infix: vec![InfixMode::Off],
            min_len_1typo: 4,
            min_len_2typo: 7,
            max_candidates: 4,
            typo_tokens_threshold: 1,
            drop_tokens_threshold: 1,
            drop_tokens_mode: DropTokensMode::RightToLeft,
            exhaustive_search: false,
            search_stop_millis: 30_000,
            split_join_tokens: false,

            pinned_hits: Vec::new(),
            hidden_hits: Vec::new(),
            override_tags: Vec::new(),
            enable_overrides: true,
            filter_curated_hits: None,

            include_fields: Vec::new(),
            exclude_fields: Vec::new(),
            highlight_fields: Vec::new(),
            highlight_full_fields: Vec::new(),
            highlight_start_tag: "<mark>".to_string(),
            highlight_end_tag: "</mark>".to_string(),
            snippet_threshold: 30,
            highlight_affix_num_tokens: 4,
            enable_highlight_v1: true,

            vector_query: None,
            remote_embedding_timeout_ms: 30_000,
            remote_embedding_num_tries: 2,
            voice_query: None,
            conversation: false,
            conversation_model_id: None,
            conversation_id: None,

            text_match_type: TextMatchType::MaxScore,
            prioritize_exact_match: true,
            prioritize_token_position: false,
            prioritize_num_matching_fields: true,
            enable_typos_for_numerical_tokens: true,
            enable_typos_for_alpha_numerical_tokens: true,
        }
    }
}

impl SearchParams {
    /// Per-field knob lookup: entry at `i`, or the last entry repeated.
    pub fn prefix_for(&self, field_index: usize) -> bool {
        repeated(&self.prefix, field_index).copied().unwrap_or(true)
    }

    pub fn num_typos_for(&self, field_index: usize) -> u8 {
        repeated(&self.num_typos, field_index).copied().unwrap_or(2)
    }

    pub fn infix_for(&self, field_index: usize) -> InfixMode {
        repeated(&self.infix, field_index)
            .copied()
            .unwrap_or(InfixMode::Off)
    }
}

fn repeated<T>(values: &[T], index: usize) -> Option<&T> {
    values.get(index).or_else(|| values.last())
}

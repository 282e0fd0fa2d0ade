use std::sync::Arc;

use serde_json::{Value, json};

use ferret_store::{MemoryStore, Store};

use crate::collection::ImportOptions;
use crate::curation::{AddHit, Override, OverrideRule, RuleMatch, Synonym};
use crate::manager::CollectionManager;
use crate::{DirtyValues, IndexOp, SearchParams};

// ── Helpers ─────────────────────────────────────────────────

fn manager() -> CollectionManager<MemoryStore> {
    CollectionManager::load(Arc::new(MemoryStore::new())).unwrap()
}

fn products(mgr: &CollectionManager<MemoryStore>) -> Arc<crate::Collection<MemoryStore>> {
    let coll = mgr
        .create_collection(json!({
            "name": "products",
            "fields": [
                {"name": "title", "type": "string"},
                {"name": "points", "type": "int32"},
                {"name": "brand", "type": "string", "facet": true, "optional": true},
            ],
        }))
        .unwrap();
    for doc in [
        json!({"id": "1", "title": "Denim jeans", "points": 100}),
        json!({"id": "2", "title": "Denim jacket", "points": 80}),
    ] {
        coll.add_document(doc, ImportOptions::default(), Some(mgr))
            .unwrap();
    }
    coll
}

fn search_ids(response: &Value) -> Vec<String> {
    response["hits"]
        .as_array()
        .unwrap()
        .iter()
        .map(|hit| hit["document"]["id"].as_str().unwrap().to_string())
        .collect()
}

fn query(q: &str) -> SearchParams {
    SearchParams {
        q: q.into(),
        query_by: vec!["title".into()],
        ..Default::default()
    }
}

// ── End-to-end scenarios ────────────────────────────────────

#[test]
fn create_and_search_sorted_by_points() {
    let mgr = manager();
    let coll = products(&mgr);

    let params = SearchParams {
        sort_by: "points:desc".into(),
        ..query("denim")
    };
    let response = coll.search(&params, Some(&mgr)).unwrap();
    assert_eq!(response["found"], 2);
    assert_eq!(search_ids(&response), vec!["1", "2"]);
    assert_eq!(response["out_of"], 2);
    assert_eq!(response["page"], 1);
    assert_eq!(response["search_cutoff"], false);
}

#[test]
fn typo_tolerance_bounded_by_num_typos() {
    let mgr = manager();
    let coll = products(&mgr);

    let params = SearchParams {
        num_typos: vec![1],
        ..query("denm")
    };
    let response = coll.search(&params, Some(&mgr)).unwrap();
    assert_eq!(response["found"], 2);

    let params = SearchParams {
        num_typos: vec![0],
        ..query("denm")
    };
    let response = coll.search(&params, Some(&mgr)).unwrap();
    assert_eq!(response["found"], 0);
}

#[test]
fn facet_counts_by_brand() {
    let mgr = manager();
    let coll = products(&mgr);
    for doc in [
        json!({"id": "3", "title": "Slim pants", "points": 70, "brand": "Levis"}),
        json!({"id": "4", "title": "Slim shirt", "points": 60, "brand": "Levis"}),
        json!({"id": "5", "title": "Slim tie", "points": 50, "brand": "Spykar"}),
    ] {
        coll.add_document(doc, ImportOptions::default(), Some(&mgr))
            .unwrap();
    }

    let params = SearchParams {
        facet_by: vec!["brand".into()],
        ..query("slim")
    };
    let response = coll.search(&params, Some(&mgr)).unwrap();
    let counts = response["facet_counts"][0]["counts"].as_array().unwrap();
    assert_eq!(counts[0]["value"], "Levis");
    assert_eq!(counts[0]["count"], 2);
    assert_eq!(counts[1]["value"], "Spykar");
    assert_eq!(counts[1]["count"], 1);
}

#[test]
fn override_pins_document_to_position_one() {
    let mgr = manager();
    let coll = products(&mgr);
    coll.upsert_override(Override {
        id: "promote-jacket".into(),
        rule: OverrideRule {
            query: Some("denim".into()),
            r#match: Some(RuleMatch::Exact),
            filter_by: None,
            tags: vec![],
        },
        add_hits: vec![AddHit {
            doc_id: "2".into(),
            position: 1,
        }],
        drop_hits: vec![],
        filter_by: None,
        sort_by: None,
        replace_query: None,
        remove_matched_tokens: false,
        filter_curated_hits: None,
        effective_from_ts: -1,
        effective_to_ts: -1,
        stop_processing: false,
        metadata: None,
    })
    .unwrap();

    let params = SearchParams {
        sort_by: "points:desc".into(),
        ..query("denim")
    };
    let response = coll.search(&params, Some(&mgr)).unwrap();
    assert_eq!(search_ids(&response), vec!["2", "1"]);
    assert_eq!(response["hits"][0]["curated"], true);
    assert!(response["hits"][1]["curated"].is_null());
}

#[test]
fn alter_drop_add_incompatible_type_rejected() {
    let mgr = manager();
    let coll = mgr
        .create_collection(json!({
            "name": "shirts",
            "fields": [{"name": "color", "type": "string"}],
        }))
        .unwrap();
    coll.add_document(
        json!({"id": "1", "color": "red"}),
        ImportOptions::default(),
        Some(&mgr),
    )
    .unwrap();

    let err = coll
        .alter(
            json!({
                "fields": [
                    {"name": "color", "drop": true},
                    {"name": "color", "type": "int32"},
                ]
            }),
            Some(&mgr),
        )
        .unwrap_err();
    assert_eq!(err.http_code(), 400);
    assert!(
        err.message().contains("existing data cannot be coerced"),
        "{}",
        err.message()
    );
}

#[test]
fn highlighter_prefix_marks_root() {
    let mgr = manager();
    let coll = mgr
        .create_collection(json!({
            "name": "apps",
            "fields": [{"name": "title", "type": "string"}],
        }))
        .unwrap();
    coll.add_document(
        json!({"id": "1", "title": "application"}),
        ImportOptions::default(),
        Some(&mgr),
    )
    .unwrap();

    let params = SearchParams {
        q: "app".into(),
        query_by: vec!["title".into()],
        prefix: vec![true],
        ..Default::default()
    };
    let response = coll.search(&params, Some(&mgr)).unwrap();
    assert_eq!(response["found"], 1);
    let hit = &response["hits"][0];
    assert_eq!(hit["highlight"]["title"]["snippet"], "<mark>app</mark>lication");
    assert_eq!(hit["highlight"]["title"]["matched_tokens"][0], "app");
}

// ── Round-trips & invariants ────────────────────────────────

#[test]
fn create_then_get_roundtrip() {
    let mgr = manager();
    let coll = products(&mgr);
    let doc = coll.get_document("1").unwrap();
    assert_eq!(doc["title"], "Denim jeans");
    assert_eq!(doc["points"], 100);
    assert_eq!(doc["id"], "1");
}

#[test]
fn upsert_twice_is_idempotent() {
    let mgr = manager();
    let coll = products(&mgr);
    let doc = json!({"id": "1", "title": "Denim jeans", "points": 100});
    let options = ImportOptions {
        op: IndexOp::Upsert,
        ..Default::default()
    };
    coll.add_document(doc.clone(), options, Some(&mgr)).unwrap();
    let after_first = coll.get_document("1").unwrap();
    coll.add_document(doc, options, Some(&mgr)).unwrap();
    let after_second = coll.get_document("1").unwrap();
    assert_eq!(after_first, after_second);
    assert_eq!(coll.num_documents().unwrap(), 2);
}

#[test]
fn doc_keys_exist_exactly_once_and_delete_removes_both() {
    let store = Arc::new(MemoryStore::new());
    let mgr = CollectionManager::load(Arc::clone(&store)).unwrap();
    let coll = products(&mgr);
    let cid = coll.collection_id();

    assert_eq!(
        store
            .count_prefix(format!("{cid}_$DI_").as_bytes())
            .unwrap(),
        2
    );
    assert_eq!(
        store
            .count_prefix(format!("{cid}_$SI_").as_bytes())
            .unwrap(),
        2
    );

    mgr.delete_document("products", "1").unwrap();
    assert_eq!(
        store
            .count_prefix(format!("{cid}_$DI_").as_bytes())
            .unwrap(),
        1
    );
    assert_eq!(
        store
            .count_prefix(format!("{cid}_$SI_").as_bytes())
            .unwrap(),
        1
    );
    assert_eq!(coll.num_documents().unwrap(), 1);
}

#[test]
fn wildcard_count_matches_filter() {
    let mgr = manager();
    let coll = products(&mgr);

    let params = SearchParams {
        q: "*".into(),
        filter_by: "points:>90".into(),
        ..Default::default()
    };
    let response = coll.search(&params, Some(&mgr)).unwrap();
    assert_eq!(response["found"], 1);
    assert_eq!(search_ids(&response), vec!["1"]);

    let params = SearchParams {
        q: "*".into(),
        ..Default::default()
    };
    let response = coll.search(&params, Some(&mgr)).unwrap();
    assert_eq!(response["found"], 2);
}

#[test]
fn seq_ids_are_monotonic_and_survive_reload() {
    let store = Arc::new(MemoryStore::new());
    {
        let mgr = CollectionManager::load(Arc::clone(&store)).unwrap();
        let coll = products(&mgr);
        mgr.delete_document("products", "2").unwrap();
        coll.add_document(
            json!({"id": "9", "title": "New arrival", "points": 10}),
            ImportOptions::default(),
            Some(&mgr),
        )
        .unwrap();
    }
    // Reload: the counter resumes past every assigned seq, deleted ones
    // included.
    let mgr = CollectionManager::load(store).unwrap();
    let coll = mgr.get_collection("products").unwrap();
    coll.add_document(
        json!({"id": "10", "title": "Another", "points": 5}),
        ImportOptions::default(),
        Some(&mgr),
    )
    .unwrap();
    let seq9 = coll.seq_of("9").unwrap().unwrap();
    let seq10 = coll.seq_of("10").unwrap().unwrap();
    assert!(seq10 > seq9);
}

#[test]
fn add_many_duplicate_id_last_writer_wins() {
    let mgr = manager();
    let coll = mgr
        .create_collection(json!({
            "name": "dup",
            "fields": [{"name": "v", "type": "int32"}],
        }))
        .unwrap();

    let lines = vec![
        json!({"id": "a", "v": 1}).to_string(),
        json!({"id": "b", "v": 2}).to_string(),
        json!({"id": "a", "v": 3}).to_string(),
    ];
    let options = ImportOptions {
        op: IndexOp::Upsert,
        ..Default::default()
    };
    let report = coll.add_many(&lines, options, Some(&mgr)).unwrap();
    assert_eq!(report.num_imported, 3);
    assert!(report.success());

    let doc = coll.get_document("a").unwrap();
    assert_eq!(doc["v"], 3);
    assert_eq!(coll.num_documents().unwrap(), 2);
}

#[test]
fn add_many_reports_per_line_failures() {
    let mgr = manager();
    let coll = mgr
        .create_collection(json!({
            "name": "strict",
            "fields": [{"name": "v", "type": "int32"}],
        }))
        .unwrap();
    let lines = vec![
        json!({"id": "1", "v": 1}).to_string(),
        "{not json".to_string(),
        json!({"id": "1", "v": 2}).to_string(),
    ];
    let report = coll
        .add_many(&lines, ImportOptions::default(), Some(&mgr))
        .unwrap();
    assert_eq!(report.num_imported, 1);
    assert_eq!(report.items[0]["success"], true);
    assert_eq!(report.items[1]["success"], false);
    assert_eq!(report.items[1]["code"], 400);
    // Create on an existing id conflicts.
    assert_eq!(report.items[2]["code"], 409);
}

#[test]
fn create_on_existing_id_conflicts_update_on_missing_id_not_found() {
    let mgr = manager();
    let coll = products(&mgr);

    let err = coll
        .add_document(
            json!({"id": "1", "title": "Clone", "points": 1}),
            ImportOptions::default(),
            Some(&mgr),
        )
        .unwrap_err();
    assert_eq!(err.http_code(), 409);

    let err = coll
        .add_document(
            json!({"id": "404", "title": "Ghost", "points": 1}),
            ImportOptions {
                op: IndexOp::Update,
                ..Default::default()
            },
            Some(&mgr),
        )
        .unwrap_err();
    assert_eq!(err.http_code(), 404);
}

#[test]
fn update_merges_and_emplace_shallow_merges() {
    let mgr = manager();
    let coll = mgr
        .create_collection(json!({
            "name": "merge",
            "enable_nested_fields": true,
            "fields": [
                {"name": "meta", "type": "object", "optional": true},
                {"name": "v", "type": "int32", "optional": true},
            ],
        }))
        .unwrap();
    coll.add_document(
        json!({"id": "1", "meta": {"a": 1, "b": 2}, "v": 1}),
        ImportOptions::default(),
        Some(&mgr),
    )
    .unwrap();

    coll.add_document(
        json!({"id": "1", "meta": {"a": 9}}),
        ImportOptions {
            op: IndexOp::Update,
            ..Default::default()
        },
        Some(&mgr),
    )
    .unwrap();
    let doc = coll.get_document("1").unwrap();
    assert_eq!(doc["meta"], json!({"a": 9, "b": 2}));
    assert_eq!(doc["v"], 1);

    coll.add_document(
        json!({"id": "1", "meta": {"c": 3}}),
        ImportOptions {
            op: IndexOp::Emplace,
            ..Default::default()
        },
        Some(&mgr),
    )
    .unwrap();
    let doc = coll.get_document("1").unwrap();
    assert_eq!(doc["meta"], json!({"c": 3}));
}

#[test]
fn grouped_search_caps_hits_and_keys_are_distinct() {
    let mgr = manager();
    let coll = products(&mgr);
    for doc in [
        json!({"id": "3", "title": "Denim shirt", "points": 60, "brand": "Levis"}),
        json!({"id": "4", "title": "Denim sock", "points": 50, "brand": "Levis"}),
        json!({"id": "5", "title": "Denim cap", "points": 40, "brand": "Levis"}),
        json!({"id": "6", "title": "Denim belt", "points": 30, "brand": "Spykar"}),
    ] {
        coll.add_document(doc, ImportOptions::default(), Some(&mgr))
            .unwrap();
    }

    let params = SearchParams {
        group_by: vec!["brand".into()],
        group_limit: 2,
        group_missing_values: true,
        sort_by: "points:desc".into(),
        ..query("denim")
    };
    let response = coll.search(&params, Some(&mgr)).unwrap();
    let groups = response["grouped_hits"].as_array().unwrap();
    let mut seen_keys = Vec::new();
    for group in groups {
        assert!(group["hits"].as_array().unwrap().len() <= 2);
        let key = group["group_key"].to_string();
        assert!(!seen_keys.contains(&key), "duplicate group key {key}");
        seen_keys.push(key);
    }
}

#[test]
fn pagination_and_limit_hits() {
    let mgr = manager();
    let coll = mgr
        .create_collection(json!({
            "name": "pages",
            "fields": [
                {"name": "title", "type": "string"},
                {"name": "n", "type": "int32"},
            ],
        }))
        .unwrap();
    for i in 0..25 {
        coll.add_document(
            json!({"id": i.to_string(), "title": "common token", "n": i}),
            ImportOptions::default(),
            Some(&mgr),
        )
        .unwrap();
    }

    let params = SearchParams {
        q: "common".into(),
        query_by: vec!["title".into()],
        sort_by: "n:asc".into(),
        per_page: 10,
        page: Some(3),
        ..Default::default()
    };
    let response = coll.search(&params, Some(&mgr)).unwrap();
    assert_eq!(response["hits"].as_array().unwrap().len(), 5);
    assert_eq!(response["found"], 25);

    let params = SearchParams {
        q: "common".into(),
        query_by: vec!["title".into()],
        per_page: 10,
        page: Some(3),
        limit_hits: 20,
        ..Default::default()
    };
    let err = coll.search(&params, Some(&mgr)).unwrap_err();
    assert_eq!(err.http_code(), 422);
}

#[test]
fn hidden_hits_removed_from_results() {
    let mgr = manager();
    let coll = products(&mgr);
    let params = SearchParams {
        hidden_hits: vec!["1".into()],
        ..query("denim")
    };
    let response = coll.search(&params, Some(&mgr)).unwrap();
    assert_eq!(search_ids(&response), vec!["2"]);
}

#[test]
fn exclude_token_filters_documents() {
    let mgr = manager();
    let coll = products(&mgr);
    let response = coll.search(&query("denim -jacket"), Some(&mgr)).unwrap();
    assert_eq!(search_ids(&response), vec!["1"]);
}

#[test]
fn phrase_query_requires_adjacency() {
    let mgr = manager();
    let coll = products(&mgr);
    let response = coll
        .search(&query(r#""denim jacket""#), Some(&mgr))
        .unwrap();
    assert_eq!(search_ids(&response), vec!["2"]);
}

#[test]
fn synonyms_expand_queries() {
    let mgr = manager();
    let coll = products(&mgr);
    coll.upsert_synonym(Synonym {
        id: "jeans-syn".into(),
        root: String::new(),
        synonyms: vec!["jeans".into(), "pants".into()],
    })
    .unwrap();

    let response = coll.search(&query("pants"), Some(&mgr)).unwrap();
    assert_eq!(search_ids(&response), vec!["1"]);
}

#[test]
fn delete_by_filter_removes_matches() {
    let mgr = manager();
    let coll = products(&mgr);
    let deleted = coll.delete_by_filter("points:<90").unwrap();
    assert_eq!(deleted, 1);
    assert_eq!(coll.num_documents().unwrap(), 1);
    assert_eq!(coll.get_document("2").unwrap_err().http_code(), 404);
}

#[test]
fn projection_include_exclude() {
    let mgr = manager();
    let coll = products(&mgr);
    let params = SearchParams {
        include_fields: vec!["title".into()],
        ..query("jeans")
    };
    let response = coll.search(&params, Some(&mgr)).unwrap();
    let doc = &response["hits"][0]["document"];
    assert!(doc.get("title").is_some());
    assert!(doc.get("points").is_none());

    let params = SearchParams {
        exclude_fields: vec!["points".into()],
        ..query("jeans")
    };
    let response = coll.search(&params, Some(&mgr)).unwrap();
    let doc = &response["hits"][0]["document"];
    assert!(doc.get("title").is_some());
    assert!(doc.get("points").is_none());
    assert!(doc.get("id").is_some());
}

#[test]
fn unstored_fields_are_stripped_from_storage() {
    let mgr = manager();
    let coll = mgr
        .create_collection(json!({
            "name": "secrets",
            "fields": [
                {"name": "title", "type": "string"},
                {"name": "internal", "type": "string", "store": false, "optional": true},
            ],
        }))
        .unwrap();
    coll.add_document(
        json!({"id": "1", "title": "Public", "internal": "hidden"}),
        ImportOptions::default(),
        Some(&mgr),
    )
    .unwrap();

    let doc = coll.get_document("1").unwrap();
    assert!(doc.get("internal").is_none());

    // Still searchable through the in-memory index.
    let params = SearchParams {
        q: "hidden".into(),
        query_by: vec!["internal".into()],
        ..Default::default()
    };
    let response = coll.search(&params, Some(&mgr)).unwrap();
    assert_eq!(response["found"], 1);
}

#[test]
fn nested_object_array_highlights_matching_element_only() {
    let mgr = manager();
    let coll = mgr
        .create_collection(json!({
            "name": "catalog",
            "enable_nested_fields": true,
            "fields": [{"name": "variants", "type": "object[]"}],
        }))
        .unwrap();
    coll.add_document(
        json!({"id": "1", "variants": [{"sku": "red shoe"}, {"sku": "blue sock"}]}),
        ImportOptions::default(),
        Some(&mgr),
    )
    .unwrap();

    let params = SearchParams {
        q: "shoe".into(),
        query_by: vec!["variants.sku".into()],
        ..Default::default()
    };
    let response = coll.search(&params, Some(&mgr)).unwrap();
    assert_eq!(response["found"], 1);

    // Only the element that matched carries a highlight; its sibling
    // keeps an empty slot at its own position.
    let highlight = &response["hits"][0]["highlight"];
    assert_eq!(
        highlight["variants"][0]["sku"]["snippet"],
        "red <mark>shoe</mark>"
    );
    assert_eq!(highlight["variants"][1], json!({}));
    let v1 = &response["hits"][0]["highlights"][0];
    assert_eq!(v1["field"], "variants.sku");
    assert_eq!(v1["indices"], json!([0]));
}

// ── References & joins ──────────────────────────────────────

fn setup_joined(mgr: &CollectionManager<MemoryStore>) {
    mgr.create_collection(json!({
        "name": "brands",
        "fields": [
            {"name": "slug", "type": "string"},
            {"name": "brand_name", "type": "string"},
            {"name": "country", "type": "string", "facet": true},
        ],
    }))
    .unwrap();
    mgr.create_collection(json!({
        "name": "shoes",
        "fields": [
            {"name": "title", "type": "string"},
            {"name": "brand_slug", "type": "string", "reference": "brands.slug"},
        ],
    }))
    .unwrap();

    let brands = mgr.get_collection("brands").unwrap();
    for doc in [
        json!({"id": "b1", "slug": "acme", "brand_name": "Acme Corp", "country": "US"}),
        json!({"id": "b2", "slug": "zenith", "brand_name": "Zenith", "country": "DE"}),
    ] {
        brands
            .add_document(doc, ImportOptions::default(), Some(mgr))
            .unwrap();
    }

    let shoes = mgr.get_collection("shoes").unwrap();
    for doc in [
        json!({"id": "s1", "title": "Acme runner", "brand_slug": "acme"}),
        json!({"id": "s2", "title": "Zenith walker", "brand_slug": "zenith"}),
    ] {
        shoes
            .add_document(doc, ImportOptions::default(), Some(mgr))
            .unwrap();
    }
}

#[test]
fn reference_helper_resolves_and_is_hidden() {
    let mgr = manager();
    setup_joined(&mgr);
    let shoes = mgr.get_collection("shoes").unwrap();

    let doc = shoes.get_document("s1").unwrap();
    assert!(doc.get("brand_slug_sequence_id").is_none());

    // The stored copy carries the helper for joins.
    let seq = shoes.seq_of("s1").unwrap().unwrap();
    let raw = shoes.doc_by_seq(seq).unwrap().unwrap();
    assert!(raw.get("brand_slug_sequence_id").is_some());
}

#[test]
fn missing_reference_target_is_not_found() {
    let mgr = manager();
    setup_joined(&mgr);
    let shoes = mgr.get_collection("shoes").unwrap();
    let err = shoes
        .add_document(
            json!({"id": "s9", "title": "Orphan", "brand_slug": "ghost"}),
            ImportOptions::default(),
            Some(&mgr),
        )
        .unwrap_err();
    assert_eq!(err.http_code(), 404);
}

#[test]
fn reference_filter_restricts_results() {
    let mgr = manager();
    setup_joined(&mgr);
    let shoes = mgr.get_collection("shoes").unwrap();

    let params = SearchParams {
        q: "*".into(),
        filter_by: "$brands(country:=US)".into(),
        ..Default::default()
    };
    let response = shoes.search(&params, Some(&mgr)).unwrap();
    assert_eq!(search_ids(&response), vec!["s1"]);
}

#[test]
fn join_include_nests_referenced_document() {
    let mgr = manager();
    setup_joined(&mgr);
    let shoes = mgr.get_collection("shoes").unwrap();

    let params = SearchParams {
        q: "runner".into(),
        query_by: vec!["title".into()],
        include_fields: vec!["$brands(brand_name, country) as brand".into()],
        ..Default::default()
    };
    let response = shoes.search(&params, Some(&mgr)).unwrap();
    let doc = &response["hits"][0]["document"];
    assert_eq!(doc["brand"]["brand_name"], "Acme Corp");
    assert_eq!(doc["brand"]["country"], "US");
}

#[test]
fn cascade_delete_removes_dependent_documents() {
    let mgr = manager();
    setup_joined(&mgr);

    mgr.delete_document("brands", "b1").unwrap();

    let shoes = mgr.get_collection("shoes").unwrap();
    // s1's reference was required, so it cascaded away; s2 survives.
    assert_eq!(shoes.get_document("s1").unwrap_err().http_code(), 404);
    assert!(shoes.get_document("s2").is_ok());
}

// ── Alter protocol ──────────────────────────────────────────

#[test]
fn alter_add_and_drop_fields() {
    let mgr = manager();
    let coll = products(&mgr);

    coll.alter(
        json!({
            "fields": [
                {"name": "brand", "drop": true},
                {"name": "rating", "type": "float", "optional": true},
            ]
        }),
        Some(&mgr),
    )
    .unwrap();

    let summary = coll.summary().unwrap();
    let names: Vec<&str> = summary["fields"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"rating"));
    assert!(!names.contains(&"brand"));

    // New field becomes searchable data-wise right away.
    coll.add_document(
        json!({"id": "7", "title": "Rated denim", "points": 5, "rating": 4.5}),
        ImportOptions::default(),
        Some(&mgr),
    )
    .unwrap();
    let params = SearchParams {
        q: "*".into(),
        filter_by: "rating:>4".into(),
        ..Default::default()
    };
    let response = coll.search(&params, Some(&mgr)).unwrap();
    assert_eq!(response["found"], 1);
}

#[test]
fn alter_missing_required_field_rejected() {
    let mgr = manager();
    let coll = products(&mgr);
    let err = coll
        .alter(
            json!({
                "fields": [{"name": "mandatory", "type": "string"}]
            }),
            Some(&mgr),
        )
        .unwrap_err();
    assert_eq!(err.http_code(), 400);
    assert!(err.message().contains("set it as optional"), "{}", err.message());
}

#[test]
fn alter_drop_then_later_add_leaves_field_absent() {
    let mgr = manager();
    let coll = products(&mgr);

    coll.alter(
        json!({"fields": [{"name": "points", "drop": true}]}),
        Some(&mgr),
    )
    .unwrap();
    let doc = coll.get_document("1").unwrap();
    assert!(doc.get("points").is_none());

    coll.alter(
        json!({
            "fields": [{"name": "points", "type": "int32", "optional": true}]
        }),
        Some(&mgr),
    )
    .unwrap();
    let doc = coll.get_document("1").unwrap();
    assert!(doc.get("points").is_none());
}

#[test]
fn alter_added_embed_field_backfills_vectors() {
    struct ConstEmbedder;
    impl crate::Embedder for ConstEmbedder {
        fn dims(&self) -> usize {
            3
        }
        fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, String> {
            Ok(inputs
                .iter()
                .map(|input| vec![input.len() as f32, 1.0, 0.0])
                .collect())
        }
    }

    let mgr = manager();
    mgr.embedders().register("toy", Arc::new(ConstEmbedder));
    let coll = mgr
        .create_collection(json!({
            "name": "embedded",
            "fields": [{"name": "title", "type": "string"}],
        }))
        .unwrap();
    coll.add_document(
        json!({"id": "1", "title": "Denim"}),
        ImportOptions::default(),
        Some(&mgr),
    )
    .unwrap();

    coll.alter(
        json!({
            "fields": [{
                "name": "emb",
                "type": "float[]",
                "num_dim": 3,
                "embed": {"from": ["title"], "model_config": {"model_name": "toy"}},
            }]
        }),
        Some(&mgr),
    )
    .unwrap();

    // The existing document picked up a vector computed from its source
    // text during the reindex.
    let doc = coll.get_document("1").unwrap();
    let emb = doc["emb"].as_array().unwrap();
    assert_eq!(emb.len(), 3);
    assert_eq!(emb[0], json!(5.0));
}

// ── Dynamic fields ──────────────────────────────────────────

#[test]
fn dynamic_pattern_expands_to_concrete_fields() {
    let mgr = manager();
    let coll = mgr
        .create_collection(json!({
            "name": "dyn",
            "fields": [
                {"name": "title", "type": "string"},
                {"name": ".*_facet", "type": "string*", "facet": true},
            ],
        }))
        .unwrap();
    coll.add_document(
        json!({"id": "1", "title": "x", "color_facet": "red"}),
        ImportOptions::default(),
        Some(&mgr),
    )
    .unwrap();

    let params = SearchParams {
        q: "*".into(),
        facet_by: vec!["color_facet".into()],
        ..Default::default()
    };
    let response = coll.search(&params, Some(&mgr)).unwrap();
    let counts = response["facet_counts"][0]["counts"].as_array().unwrap();
    assert_eq!(counts[0]["value"], "red");
}

#[test]
fn auto_fallback_accepts_anything() {
    let mgr = manager();
    let coll = mgr
        .create_collection(json!({
            "name": "loose",
            "fields": [{"name": ".*", "type": "auto"}],
        }))
        .unwrap();
    coll.add_document(
        json!({"id": "1", "anything": "goes", "count": 3}),
        ImportOptions::default(),
        Some(&mgr),
    )
    .unwrap();

    let params = SearchParams {
        q: "goes".into(),
        query_by: vec!["anything".into()],
        ..Default::default()
    };
    let response = coll.search(&params, Some(&mgr)).unwrap();
    assert_eq!(response["found"], 1);
}

// ── Dirty values ────────────────────────────────────────────

#[test]
fn coerce_or_drop_imports_with_field_dropped() {
    let mgr = manager();
    let coll = mgr
        .create_collection(json!({
            "name": "dirty",
            "fields": [
                {"name": "title", "type": "string"},
                {"name": "n", "type": "int32", "optional": true},
            ],
        }))
        .unwrap();
    let options = ImportOptions {
        dirty: DirtyValues::CoerceOrDrop,
        ..Default::default()
    };
    coll.add_document(
        json!({"id": "1", "title": "x", "n": "not-a-number"}),
        options,
        Some(&mgr),
    )
    .unwrap();
    let doc = coll.get_document("1").unwrap();
    assert!(doc.get("n").is_none());
}

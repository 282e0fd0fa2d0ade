use std::collections::HashSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::warn;
use uuid::Uuid;

use ferret_query::{DirtyValues, FilterNode, IndexOp, SearchParams, parse_filter};
use ferret_store::{Store, WriteBatch};

use crate::assemble::{AssembleContext, build_response};
use crate::catalog;
use crate::curation::{Override, Synonym, synonym_pairs};
use crate::document::{FLAT_KEY, merge_deep, merge_shallow};
use crate::error::Error;
use crate::executor::{ExecuteContext, execute};
use crate::facet::compute_facets;
use crate::index::Index;
use crate::manager::CollectionManager;
use crate::planner::build_plan;
use crate::schema::{Field, ID_FIELD, Schema};
use crate::validate::{resolve_doc_id, validate_document};

/// Persisted collection metadata, stored under `$CM_<name>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionMeta {
    pub id: u32,
    pub name: String,
    pub created_at: u64,
    pub fields: Vec<Field>,
    #[serde(default)]
    pub default_sorting_field: String,
    #[serde(default)]
    pub symbols_to_index: Vec<char>,
    #[serde(default)]
    pub token_separators: Vec<char>,
    #[serde(default)]
    pub enable_nested_fields: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Opaque transcription-model config, kept for the voice pipeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_query_model: Option<Value>,
}

/// Mutable collection state behind the shared/exclusive lock.
pub(crate) struct Inner {
    pub(crate) schema: Schema,
    pub(crate) index: Index,
    pub(crate) next_seq_id: u32,
    pub(crate) overrides: Vec<Override>,
    pub(crate) synonyms: Vec<Synonym>,
    pub(crate) metadata: Option<Value>,
    pub(crate) voice_query_model: Option<Value>,
}

/// A named, versioned dataset: schema, in-memory index, and durable
/// storage keys. Reads take the shared lock; schema mutation and index
/// writes take it exclusively, with durable writes outside the lock.
pub struct Collection<S: Store> {
    pub(crate) name: String,
    pub(crate) collection_id: u32,
    pub(crate) created_at: u64,
    pub(crate) store: Arc<S>,
    pub(crate) inner: RwLock<Inner>,
}

impl<S: Store> std::fmt::Debug for Collection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("collection_id", &self.collection_id)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ImportOptions {
    pub op: IndexOp,
    pub dirty: DirtyValues,
    pub return_doc: bool,
    pub return_id: bool,
    pub remote_embed_batch_size: usize,
    pub remote_embed_timeout_ms: u64,
    pub remote_embed_retries: u32,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            op: IndexOp::Create,
            dirty: DirtyValues::CoerceOrReject,
            return_doc: false,
            return_id: false,
            remote_embed_batch_size: 200,
            remote_embed_timeout_ms: 60_000,
            remote_embed_retries: 2,
        }
    }
}

/// Outcome of `add_many`: one JSON result per input line.
#[derive(Debug)]
pub struct ImportReport {
    pub items: Vec<Value>,
    pub num_imported: usize,
}

impl ImportReport {
    pub fn success(&self) -> bool {
        self.num_imported == self.items.len()
    }
}

/// One validated record staged for a durable batch flush.
struct Pending {
    line: usize,
    seq_id: u32,
    doc_id: String,
    doc: Map<String, Value>,
    stored: Vec<u8>,
    old_doc: Option<Map<String, Value>>,
}

impl<S: Store> Collection<S> {
    // ── Construction ────────────────────────────────────────────

    pub(crate) fn create(
        store: Arc<S>,
        collection_id: u32,
        created_at: u64,
        create: crate::manager::CollectionCreate,
    ) -> Result<Self, Error> {
        let schema = Schema::new(
            create.fields,
            create.default_sorting_field,
            create.symbols_to_index,
            create.token_separators,
            create.enable_nested_fields,
        )?;
        let index = Index::new(&schema);
        let collection = Self {
            name: create.name.clone(),
            collection_id,
            created_at,
            store,
            inner: RwLock::new(Inner {
                schema,
                index,
                next_seq_id: 0,
                overrides: Vec::new(),
                synonyms: Vec::new(),
                metadata: create.metadata,
                voice_query_model: create.voice_query_model,
            }),
        };
        collection.persist_meta(&*collection.read_inner()?)?;
        collection
            .store
            .insert(&catalog::seq_counter_key(&create.name), b"0")?;
        Ok(collection)
    }

    /// Rebuild a collection from its catalog keys and stored documents.
    pub(crate) fn load(store: Arc<S>, meta: CollectionMeta) -> Result<Self, Error> {
        let schema = Schema::new(
            meta.fields,
            meta.default_sorting_field,
            meta.symbols_to_index,
            meta.token_separators,
            meta.enable_nested_fields,
        )?;
        let mut index = Index::new(&schema);

        for (key, value) in store.scan_prefix(&catalog::seq_id_prefix(meta.id))? {
            let Some(seq_id) = catalog::parse_seq_id_key(&key) else {
                continue;
            };
            let doc: Map<String, Value> = serde_json::from_slice(&value)
                .map_err(|e| Error::Internal(format!("corrupt stored document: {e}")))?;
            index.index_document(&schema, seq_id, &doc)?;
        }

        let next_seq_id = match store.get(&catalog::seq_counter_key(&meta.name))? {
            Some(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            None => 0,
        };

        let mut overrides = Vec::new();
        for (_, value) in store.scan_prefix(&catalog::override_prefix(&meta.name))? {
            let ov: Override = serde_json::from_slice(&value)
                .map_err(|e| Error::Internal(format!("corrupt override: {e}")))?;
            overrides.push(ov);
        }
        let mut synonyms = Vec::new();
        for (_, value) in store.scan_prefix(&catalog::synonym_prefix(&meta.name))? {
            let synonym: Synonym = serde_json::from_slice(&value)
                .map_err(|e| Error::Internal(format!("corrupt synonym: {e}")))?;
            synonyms.push(synonym);
        }

        Ok(Self {
            name: meta.name,
            collection_id: meta.id,
            created_at: meta.created_at,
            store,
            inner: RwLock::new(Inner {
                schema,
                index,
                next_seq_id,
                overrides,
                synonyms,
                metadata: meta.metadata,
                voice_query_model: meta.voice_query_model,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collection_id(&self) -> u32 {
        self.collection_id
    }

    pub fn num_documents(&self) -> Result<u64, Error> {
        Ok(self.read_inner()?.index.num_documents())
    }

    /// Collection summary, the catalog response shape.
    pub fn summary(&self) -> Result<Value, Error> {
        let inner = self.read_inner()?;
        let mut out = json!({
            "name": self.name,
            "num_documents": inner.index.num_documents(),
            "created_at": self.created_at,
            "fields": inner.schema.all_declared(),
            "default_sorting_field": inner.schema.default_sorting_field,
            "symbols_to_index": inner.schema.symbols_to_index,
            "token_separators": inner.schema.token_separators,
            "enable_nested_fields": inner.schema.enable_nested_fields,
        });
        if let Some(metadata) = &inner.metadata {
            out["metadata"] = metadata.clone();
        }
        if let Some(model) = &inner.voice_query_model {
            out["voice_query_model"] = model.clone();
        }
        Ok(out)
    }

    pub(crate) fn read_inner(&self) -> Result<RwLockReadGuard<'_, Inner>, Error> {
        self.inner
            .read()
            .map_err(|_| Error::Internal("collection lock poisoned".into()))
    }

    pub(crate) fn write_inner(&self) -> Result<RwLockWriteGuard<'_, Inner>, Error> {
        self.inner
            .write()
            .map_err(|_| Error::Internal("collection lock poisoned".into()))
    }

    pub(crate) fn persist_meta(&self, inner: &Inner) -> Result<(), Error> {
        let meta = CollectionMeta {
            id: self.collection_id,
            name: self.name.clone(),
            created_at: self.created_at,
            fields: inner.schema.all_declared(),
            default_sorting_field: inner.schema.default_sorting_field.clone(),
            symbols_to_index: inner.schema.symbols_to_index.clone(),
            token_separators: inner.schema.token_separators.clone(),
            enable_nested_fields: inner.schema.enable_nested_fields,
            metadata: inner.metadata.clone(),
            voice_query_model: inner.voice_query_model.clone(),
        };
        let bytes = serde_json::to_vec(&meta)
            .map_err(|e| Error::Internal(format!("meta serialization: {e}")))?;
        self.store.insert(&catalog::meta_key(&self.name), &bytes)?;
        Ok(())
    }

    // ── Document lookups ────────────────────────────────────────

    pub fn seq_of(&self, doc_id: &str) -> Result<Option<u32>, Error> {
        match self
            .store
            .get(&catalog::doc_id_key(self.collection_id, doc_id))?
        {
            Some(bytes) => {
                let seq = std::str::from_utf8(&bytes)
                    .map_err(|e| Error::Internal(e.to_string()))?
                    .parse::<u32>()
                    .map_err(|e| Error::Internal(e.to_string()))?;
                Ok(Some(seq))
            }
            None => Ok(None),
        }
    }

    pub fn doc_by_seq(&self, seq_id: u32) -> Result<Option<Map<String, Value>>, Error> {
        match self
            .store
            .get(&catalog::seq_id_key(self.collection_id, seq_id))?
        {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
                Error::Internal(format!("corrupt stored document: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    pub fn get_document(&self, doc_id: &str) -> Result<Value, Error> {
        let seq = self
            .seq_of(doc_id)?
            .ok_or_else(|| Error::NotFound(format!("could not find a document with id: {doc_id}")))?;
        let mut doc = self.doc_by_seq(seq)?.ok_or_else(|| {
            Error::Internal(format!("document `{doc_id}` has no stored record"))
        })?;
        let inner = self.read_inner()?;
        strip_helpers(&mut doc, &inner.schema);
        Ok(Value::Object(doc))
    }

    /// All stored documents in seq order, for export and alter scans.
    pub fn export_documents(&self) -> Result<Vec<(u32, Map<String, Value>)>, Error> {
        let mut out = Vec::new();
        for (key, value) in self
            .store
            .scan_prefix(&catalog::seq_id_prefix(self.collection_id))?
        {
            let Some(seq_id) = catalog::parse_seq_id_key(&key) else {
                continue;
            };
            let doc = serde_json::from_slice(&value)
                .map_err(|e| Error::Internal(format!("corrupt stored document: {e}")))?;
            out.push((seq_id, doc));
        }
        Ok(out)
    }

    // ── Writes ──────────────────────────────────────────────────

    /// Index a single document; returns the stored document.
    pub fn add_document(
        &self,
        doc: Value,
        options: ImportOptions,
        manager: Option<&CollectionManager<S>>,
    ) -> Result<Value, Error> {
        let line = serde_json::to_string(&doc)
            .map_err(|e| Error::BadRequest(format!("malformed JSON: {e}")))?;
        let options = ImportOptions {
            return_doc: true,
            ..options
        };
        let report = self.add_many(&[line], options, manager)?;
        let item = report.items.into_iter().next().unwrap_or(Value::Null);
        if item["success"] == json!(true) {
            Ok(item["document"].clone())
        } else {
            let code = item["code"].as_u64().unwrap_or(400) as u16;
            let message = item["error"].as_str().unwrap_or("import failed").to_string();
            Err(error_for(code, message))
        }
    }

    /// Update a document addressed by id; the body's `id`, when present,
    /// must agree.
    pub fn update_document(
        &self,
        doc_id: &str,
        doc: Value,
        options: ImportOptions,
        manager: Option<&CollectionManager<S>>,
    ) -> Result<Value, Error> {
        let Value::Object(mut body) = doc else {
            return Err(Error::BadRequest("document must be a JSON object".into()));
        };
        resolve_doc_id(&body, Some(doc_id))?;
        body.insert(ID_FIELD.to_string(), Value::String(doc_id.to_string()));
        self.add_document(Value::Object(body), options, manager)
    }

    /// Batched import. Each line is parsed, validated and indexed
    /// independently; failures are reported inline. A duplicate id inside
    /// the in-flight batch forces a flush so later writes win
    /// deterministically.
    pub fn add_many(
        &self,
        lines: &[String],
        options: ImportOptions,
        manager: Option<&CollectionManager<S>>,
    ) -> Result<ImportReport, Error> {
        let mut items: Vec<Value> = vec![Value::Null; lines.len()];
        let mut num_imported = 0usize;

        let mut batch: Vec<Pending> = Vec::new();
        let mut batch_ids: HashSet<String> = HashSet::new();

        for (line_index, line) in lines.iter().enumerate() {
            let doc: Map<String, Value> = match serde_json::from_str(line) {
                Ok(Value::Object(map)) => map,
                Ok(_) => {
                    items[line_index] = line_error(line, 400, "document must be a JSON object");
                    continue;
                }
                Err(e) => {
                    items[line_index] = line_error(line, 400, &format!("malformed JSON: {e}"));
                    continue;
                }
            };

            // A repeated id closes the current durable batch first, so the
            // earlier write commits before the later one is staged.
            if let Some(id) = doc.get(ID_FIELD).and_then(Value::as_str) {
                if batch_ids.contains(id) {
                    self.flush_batch(&mut batch, &mut items, &mut num_imported, options);
                    batch_ids.clear();
                }
            }

            match self.stage_record(line_index, doc, options, manager) {
                Ok(pending) => {
                    batch_ids.insert(pending.doc_id.clone());
                    batch.push(pending);
                }
                Err(e) => {
                    items[line_index] = line_error(line, e.http_code(), e.message());
                }
            }
        }
        self.flush_batch(&mut batch, &mut items, &mut num_imported, options);

        Ok(ImportReport {
            items,
            num_imported,
        })
    }

    /// Validate one record and apply it to the in-memory index. Durable
    /// persistence happens at the batch flush.
    fn stage_record(
        &self,
        line: usize,
        mut doc: Map<String, Value>,
        options: ImportOptions,
        manager: Option<&CollectionManager<S>>,
    ) -> Result<Pending, Error> {
        let body_id = resolve_doc_id(&doc, None)?;
        let existing_seq = match &body_id {
            Some(id) => self.seq_of(id)?,
            None => None,
        };

        match (options.op, existing_seq) {
            (IndexOp::Create, Some(_)) => {
                return Err(Error::Conflict(format!(
                    "a document with id {} already exists",
                    body_id.unwrap_or_default()
                )));
            }
            (IndexOp::Update, None) => {
                return Err(Error::NotFound(format!(
                    "could not find a document with id: {}",
                    body_id.unwrap_or_default()
                )));
            }
            _ => {}
        }

        // Merge against the prior version for update-flavoured ops.
        let old_doc = match existing_seq {
            Some(seq) => self.doc_by_seq(seq)?,
            None => None,
        };
        if let Some(old) = &old_doc {
            match options.op {
                IndexOp::Update => {
                    let mut merged = old.clone();
                    merge_deep(&mut merged, doc);
                    doc = merged;
                }
                IndexOp::Emplace => {
                    let mut merged = old.clone();
                    merge_shallow(&mut merged, doc);
                    doc = merged;
                }
                _ => {}
            }
        }

        // Assign seq id (and auto-generate the doc id off it when absent)
        // under the schema lock.
        let (seq_id, doc_id) = {
            let mut inner = self.write_inner()?;
            match existing_seq {
                Some(seq) => (seq, body_id.expect("existing doc has id")),
                None => {
                    let seq = inner.next_seq_id;
                    inner.next_seq_id += 1;
                    let id = body_id.unwrap_or_else(|| seq.to_string());
                    (seq, id)
                }
            }
        };
        doc.insert(ID_FIELD.to_string(), Value::String(doc_id.clone()));

        // Schema discovery + validation; new fields persist to the catalog
        // before the record proceeds.
        {
            let mut inner = self.write_inner()?;
            let new_fields = validate_document(&mut doc, &inner.schema, options.dirty)
                .map_err(Error::from)?;
            if !new_fields.is_empty() {
                for field in new_fields {
                    inner.schema.add_discovered(field);
                }
                self.persist_meta(&inner)?;
            }
        }

        if let Some(manager) = manager {
            self.add_reference_helpers(&mut doc, manager)?;
            self.embed_fields(&mut doc, old_doc.as_ref(), manager)?;
        }

        // In-memory index swap under the exclusive lock.
        {
            let mut inner = self.write_inner()?;
            if let Some(old) = &old_doc {
                let schema = inner.schema.clone();
                inner.index.remove_document(&schema, seq_id, old);
            }
            let schema = inner.schema.clone();
            if let Err(e) = inner.index.index_document(&schema, seq_id, &doc) {
                // Reinstate the prior version on index failure.
                if let Some(old) = &old_doc {
                    let _ = inner.index.index_document(&schema, seq_id, old);
                }
                return Err(e);
            }
        }

        let stored = {
            let inner = self.read_inner()?;
            let mut to_store = doc.clone();
            strip_unstored(&mut to_store, &inner.schema);
            serde_json::to_vec(&to_store)
                .map_err(|e| Error::Internal(format!("document serialization: {e}")))?
        };

        Ok(Pending {
            line,
            seq_id,
            doc_id,
            doc,
            stored,
            old_doc,
        })
    }

    /// Write the staged records durably in one atomic batch. On failure
    /// the in-memory entries roll back and every record in the batch
    /// reports a 500.
    fn flush_batch(
        &self,
        batch: &mut Vec<Pending>,
        items: &mut [Value],
        num_imported: &mut usize,
        options: ImportOptions,
    ) {
        if batch.is_empty() {
            return;
        }
        let mut write = WriteBatch::new();
        for pending in batch.iter() {
            write.put(
                catalog::doc_id_key(self.collection_id, &pending.doc_id),
                pending.seq_id.to_string().into_bytes(),
            );
            write.put(
                catalog::seq_id_key(self.collection_id, pending.seq_id),
                pending.stored.clone(),
            );
        }
        let next_seq = self
            .read_inner()
            .map(|inner| inner.next_seq_id)
            .unwrap_or(0);
        write.put(
            catalog::seq_counter_key(&self.name),
            next_seq.to_string().into_bytes(),
        );

        match self.store.write(write) {
            Ok(()) => {
                for pending in batch.iter() {
                    let mut item = json!({"success": true});
                    if options.return_id {
                        item["id"] = json!(pending.doc_id);
                    }
                    if options.return_doc {
                        let mut doc = pending.doc.clone();
                        if let Ok(inner) = self.read_inner() {
                            strip_helpers(&mut doc, &inner.schema);
                        }
                        item["document"] = Value::Object(doc);
                    }
                    items[pending.line] = item;
                    *num_imported += 1;
                }
            }
            Err(e) => {
                warn!(collection = %self.name, error = %e, "durable batch write failed; rolling back");
                for pending in batch.iter() {
                    if let Ok(mut inner) = self.write_inner() {
                        let schema = inner.schema.clone();
                        inner
                            .index
                            .remove_document(&schema, pending.seq_id, &pending.doc);
                        if let Some(old) = &pending.old_doc {
                            let _ = inner.index.index_document(&schema, pending.seq_id, old);
                        }
                    }
                    items[pending.line] = json!({
                        "success": false,
                        "error": format!("durable write failed: {e}"),
                        "code": 500,
                    });
                }
            }
        }
        batch.clear();
    }

    /// Resolve reference fields to `<name>_sequence_id` helper columns.
    fn add_reference_helpers(
        &self,
        doc: &mut Map<String, Value>,
        manager: &CollectionManager<S>,
    ) -> Result<(), Error> {
        let reference_fields: Vec<Field> = {
            let inner = self.read_inner()?;
            inner.schema.reference_fields().cloned().collect()
        };
        for field in reference_fields {
            let (target_name, target_field) = field.reference_parts()?;
            let in_object_array = field.name.contains('.') && !doc.contains_key(&field.name);
            let value = match doc.get(&field.name).cloned() {
                Some(v) => Some(v),
                None => crate::document::get_path(doc, &field.name),
            };
            let Some(value) = value else {
                if field.optional {
                    continue;
                }
                return Err(Error::BadRequest(format!(
                    "reference field `{}` is required",
                    field.name
                )));
            };
            let target = manager.get_collection(target_name)?;

            // References inside object arrays record which element each
            // resolved seq came from.
            if in_object_array {
                let items = match &value {
                    Value::Array(items) => items.clone(),
                    other => vec![other.clone()],
                };
                let mut pairs = Vec::with_capacity(items.len());
                for (object_index, item) in items.iter().enumerate() {
                    for seq in target.resolve_reference(target_field, item)? {
                        pairs.push(json!([object_index, seq]));
                    }
                }
                doc.insert(field.sequence_helper_name(), Value::Array(pairs));
                continue;
            }

            let helper = match value {
                Value::Array(items) => {
                    let mut seqs = Vec::with_capacity(items.len());
                    for item in items {
                        seqs.extend(target.resolve_reference(target_field, &item)?);
                    }
                    Value::Array(seqs.into_iter().map(|s| json!(s)).collect())
                }
                scalar => {
                    let seqs = target.resolve_reference(target_field, &scalar)?;
                    match seqs.len() {
                        1 => json!(seqs[0]),
                        0 => {
                            return Err(Error::NotFound(format!(
                                "reference document for `{}` not found in `{target_name}`",
                                field.name
                            )));
                        }
                        _ => {
                            return Err(Error::BadRequest(format!(
                                "reference `{}` matches more than one document",
                                field.name
                            )));
                        }
                    }
                }
            };
            doc.insert(field.sequence_helper_name(), helper);
        }
        Ok(())
    }

    /// Seq ids of documents whose `field` equals the given scalar value.
    pub(crate) fn resolve_reference(&self, field: &str, value: &Value) -> Result<Vec<u32>, Error> {
        let rendered = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            other => {
                return Err(Error::BadRequest(format!(
                    "reference value {other} must be a scalar"
                )));
            }
        };
        let node = FilterNode::Condition(ferret_query::Condition {
            field: field.to_string(),
            comparator: ferret_query::Comparator::Eq,
            values: vec![rendered],
        });
        let inner = self.read_inner()?;
        let matched = inner.index.eval_filter(&node, &inner.schema)?;
        Ok(matched.iter().collect())
    }

    /// Produce embeddings for fields whose `embed.from` sources changed.
    pub(crate) fn embed_fields(
        &self,
        doc: &mut Map<String, Value>,
        old_doc: Option<&Map<String, Value>>,
        manager: &CollectionManager<S>,
    ) -> Result<(), Error> {
        let embed_fields: Vec<Field> = {
            let inner = self.read_inner()?;
            inner.schema.embed_fields().cloned().collect()
        };
        for field in embed_fields {
            let Some(embed) = &field.embed else { continue };
            let sources: Vec<String> = embed
                .from
                .iter()
                .filter_map(|source| doc.get(source).and_then(Value::as_str))
                .map(str::to_string)
                .collect();
            if sources.is_empty() {
                continue;
            }
            let changed = match old_doc {
                None => true,
                Some(old) => embed.from.iter().any(|s| old.get(s) != doc.get(s)),
            };
            if !changed && doc.contains_key(&field.name) {
                continue;
            }
            let Some(embedder) = manager.embedders().get(&embed.model_config.model_name) else {
                warn!(
                    model = %embed.model_config.model_name,
                    field = %field.name,
                    "no embedder registered; skipping embedding"
                );
                continue;
            };
            let vectors = embedder
                .embed(&[sources.join(" ")])
                .map_err(|e| Error::Internal(format!("embedding failed: {e}")))?;
            let vector = vectors.into_iter().next().unwrap_or_default();
            doc.insert(
                field.name.clone(),
                Value::Array(vector.into_iter().map(|v| json!(v)).collect()),
            );
        }
        Ok(())
    }

    // ── Deletes ─────────────────────────────────────────────────

    /// Remove a document from the index and both storage keys. Cascading
    /// through incoming references is the manager's job.
    pub fn delete_document(&self, doc_id: &str) -> Result<Value, Error> {
        let seq = self
            .seq_of(doc_id)?
            .ok_or_else(|| Error::NotFound(format!("could not find a document with id: {doc_id}")))?;
        let doc = self.doc_by_seq(seq)?.ok_or_else(|| {
            Error::Internal(format!("document `{doc_id}` has no stored record"))
        })?;

        {
            let mut inner = self.write_inner()?;
            let schema = inner.schema.clone();
            inner.index.remove_document(&schema, seq, &doc);
        }

        let mut batch = WriteBatch::new();
        batch.delete(catalog::doc_id_key(self.collection_id, doc_id));
        batch.delete(catalog::seq_id_key(self.collection_id, seq));
        self.store.write(batch)?;

        let mut doc = doc;
        let inner = self.read_inner()?;
        strip_helpers(&mut doc, &inner.schema);
        Ok(Value::Object(doc))
    }

    /// Swap a live document in place (index + stored copy), keeping its
    /// seq id. Used by cascade maintenance; skips reference re-resolution.
    pub(crate) fn rewrite_document(
        &self,
        seq_id: u32,
        old_doc: &Map<String, Value>,
        new_doc: Map<String, Value>,
    ) -> Result<(), Error> {
        {
            let mut inner = self.write_inner()?;
            let schema = inner.schema.clone();
            inner.index.remove_document(&schema, seq_id, old_doc);
            inner.index.index_document(&schema, seq_id, &new_doc)?;
        }
        let bytes = serde_json::to_vec(&new_doc)
            .map_err(|e| Error::Internal(format!("document serialization: {e}")))?;
        self.store
            .insert(&catalog::seq_id_key(self.collection_id, seq_id), &bytes)?;
        Ok(())
    }

    /// Delete every document matching `filter_by`; returns the count.
    pub fn delete_by_filter(&self, filter_by: &str) -> Result<u64, Error> {
        let node = parse_filter(filter_by)?;
        let seqs: Vec<u32> = {
            let inner = self.read_inner()?;
            inner
                .index
                .eval_filter(&node, &inner.schema)?
                .iter()
                .collect()
        };
        let mut deleted = 0u64;
        for seq in seqs {
            let Some(doc) = self.doc_by_seq(seq)? else {
                continue;
            };
            let Some(id) = doc.get(ID_FIELD).and_then(Value::as_str) else {
                continue;
            };
            self.delete_document(id)?;
            deleted += 1;
        }
        Ok(deleted)
    }

    // ── Overrides & synonyms ────────────────────────────────────

    /// Insert or replace (same id) an override; empty id gets a UUID.
    pub fn upsert_override(&self, mut ov: Override) -> Result<Override, Error> {
        if ov.id.is_empty() {
            ov.id = Uuid::new_v4().to_string();
        }
        let bytes = serde_json::to_vec(&ov)
            .map_err(|e| Error::Internal(format!("override serialization: {e}")))?;
        self.store
            .insert(&catalog::override_key(&self.name, &ov.id), &bytes)?;
        let mut inner = self.write_inner()?;
        match inner.overrides.iter_mut().find(|o| o.id == ov.id) {
            Some(existing) => *existing = ov.clone(),
            None => inner.overrides.push(ov.clone()),
        }
        Ok(ov)
    }

    pub fn list_overrides(&self) -> Result<Vec<Override>, Error> {
        Ok(self.read_inner()?.overrides.clone())
    }

    pub fn get_override(&self, id: &str) -> Result<Override, Error> {
        self.read_inner()?
            .overrides
            .iter()
            .find(|o| o.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("could not find an override with id: {id}")))
    }

    pub fn delete_override(&self, id: &str) -> Result<(), Error> {
        let mut inner = self.write_inner()?;
        let before = inner.overrides.len();
        inner.overrides.retain(|o| o.id != id);
        if inner.overrides.len() == before {
            return Err(Error::NotFound(format!(
                "could not find an override with id: {id}"
            )));
        }
        self.store.delete(&catalog::override_key(&self.name, id))?;
        Ok(())
    }

    pub fn upsert_synonym(&self, mut synonym: Synonym) -> Result<Synonym, Error> {
        if synonym.id.is_empty() {
            synonym.id = Uuid::new_v4().to_string();
        }
        if synonym.synonyms.is_empty() {
            return Err(Error::BadRequest(
                "a synonym must list at least one term".into(),
            ));
        }
        let bytes = serde_json::to_vec(&synonym)
            .map_err(|e| Error::Internal(format!("synonym serialization: {e}")))?;
        self.store
            .insert(&catalog::synonym_key(&self.name, &synonym.id), &bytes)?;
        let mut inner = self.write_inner()?;
        match inner.synonyms.iter_mut().find(|s| s.id == synonym.id) {
            Some(existing) => *existing = synonym.clone(),
            None => inner.synonyms.push(synonym.clone()),
        }
        Ok(synonym)
    }

    pub fn list_synonyms(&self) -> Result<Vec<Synonym>, Error> {
        Ok(self.read_inner()?.synonyms.clone())
    }

    pub fn delete_synonym(&self, id: &str) -> Result<(), Error> {
        let mut inner = self.write_inner()?;
        let before = inner.synonyms.len();
        inner.synonyms.retain(|s| s.id != id);
        if inner.synonyms.len() == before {
            return Err(Error::NotFound(format!(
                "could not find a synonym with id: {id}"
            )));
        }
        self.store.delete(&catalog::synonym_key(&self.name, id))?;
        Ok(())
    }

    pub fn update_metadata(&self, metadata: Option<Value>) -> Result<(), Error> {
        let mut inner = self.write_inner()?;
        inner.metadata = metadata;
        self.persist_meta(&inner)
    }

    // ── Search ──────────────────────────────────────────────────

    pub fn search(
        &self,
        params: &SearchParams,
        manager: Option<&CollectionManager<S>>,
    ) -> Result<Value, Error> {
        let inner = self.read_inner()?;

        // Transcription runs in an external model pipeline this core only
        // carries configuration for.
        if params.voice_query.is_some() {
            return Err(Error::BadRequest(
                "`voice_query` requires a transcription pipeline, which is not available here"
                    .into(),
            ));
        }
        if params.conversation && params.conversation_model_id.is_none() {
            return Err(Error::BadRequest(
                "`conversation` needs a `conversation_model_id`".into(),
            ));
        }

        let now_ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let synonyms: Vec<(Vec<String>, Vec<Vec<String>>)> = inner
            .synonyms
            .iter()
            .flat_map(|s| {
                let tokenizer = inner.index.tokenizer();
                synonym_pairs(
                    tokenizer.terms(&s.root),
                    s.synonyms.iter().map(|m| tokenizer.terms(m)).collect(),
                )
            })
            .collect();

        let mut plan = build_plan(params, &inner.schema, &inner.overrides, &synonyms, now_ts)?;

        // Reference filters resolve through the joined collection before
        // execution.
        if let Some(filter) = plan.filter.take() {
            plan.filter = Some(resolve_reference_filters(
                filter,
                &self.name,
                &inner,
                manager,
            )?);
        }

        // Vector queries resolve their values: stored doc vector or an
        // embedding of `q`.
        if let Some(vq) = &mut plan.vector_query {
            if vq.values.is_empty() {
                if let Some(doc_id) = &vq.doc_id {
                    let seq = self.seq_of(doc_id)?.ok_or_else(|| {
                        Error::NotFound(format!("could not find a document with id: {doc_id}"))
                    })?;
                    vq.values = inner
                        .index
                        .vector_column(&vq.field)
                        .and_then(|c| c.get(seq).map(<[f32]>::to_vec))
                        .ok_or_else(|| {
                            Error::BadRequest(format!(
                                "document `{doc_id}` has no vector for `{}`",
                                vq.field
                            ))
                        })?;
                } else if !plan.is_wildcard {
                    // Embed the query text when an embedder is available;
                    // degrade to pure text search otherwise.
                    let model = inner
                        .schema
                        .field(&vq.field)
                        .and_then(|f| f.embed.as_ref())
                        .map(|e| e.model_config.model_name.clone());
                    let embedded = model.and_then(|m| {
                        manager.and_then(|mgr| mgr.embedders().get(&m)).map(|e| {
                            e.embed(&[plan.params.q.clone()])
                        })
                    });
                    match embedded {
                        Some(Ok(mut vectors)) if !vectors.is_empty() => {
                            vq.values = vectors.remove(0);
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "query embedding failed; degrading to text-only search");
                        }
                        _ => {}
                    }
                }
            }
        }
        if plan
            .vector_query
            .as_ref()
            .is_some_and(|vq| vq.values.is_empty())
        {
            plan.vector_query = None;
        }

        let deadline = Instant::now() + Duration::from_millis(plan.params.search_stop_millis);
        let seq_of = |id: &str| self.seq_of(id).ok().flatten();
        let ctx = ExecuteContext {
            index: &inner.index,
            schema: &inner.schema,
            seq_of: &seq_of,
            deadline,
        };
        let outcome = execute(&plan, &ctx)?;
        if outcome.search_cutoff && outcome.found == 0 {
            return Err(Error::Timeout(
                "search exceeded the time budget before finding any result".into(),
            ));
        }

        let doc_of = |seq: u32| self.doc_by_seq(seq).ok().flatten();
        let facets = compute_facets(
            &plan.params,
            &inner.schema,
            &inner.index,
            &outcome.matched,
            &doc_of,
        )?;

        let join_resolver = manager.map(|mgr| {
            let fields: Vec<Field> = inner.schema.reference_fields().cloned().collect();
            mgr.join_resolver(self, fields)
        });
        let assemble_ctx = AssembleContext {
            collection_name: &self.name,
            out_of: inner.index.num_documents(),
            index: &inner.index,
            schema: &inner.schema,
            tokenizer: inner.index.tokenizer(),
            doc_of: &doc_of,
            join: join_resolver.as_deref(),
        };
        build_response(&plan, &outcome, &facets, &assemble_ctx)
    }
}

/// Rewrite `$collection(expr)` filter nodes into helper-column conditions.
/// A self-referential target evaluates against the already-held guard
/// instead of re-entering the lock.
fn resolve_reference_filters<S: Store>(
    node: FilterNode,
    self_name: &str,
    inner: &Inner,
    manager: Option<&CollectionManager<S>>,
) -> Result<FilterNode, Error> {
    match node {
        FilterNode::Reference { collection, expr } => {
            let local_field = inner
                .schema
                .reference_fields()
                .find(|f| {
                    f.reference_parts()
                        .map(|(target, _)| target == collection)
                        .unwrap_or(false)
                })
                .ok_or_else(|| {
                    Error::BadRequest(format!(
                        "no reference field points at collection `{collection}`"
                    ))
                })?;

            let values: Vec<String> = if collection == self_name {
                inner
                    .index
                    .eval_filter(&expr, &inner.schema)?
                    .iter()
                    .map(|seq| seq.to_string())
                    .collect()
            } else {
                let Some(manager) = manager else {
                    return Err(Error::BadRequest(format!(
                        "reference filter on `{collection}` needs the collection manager"
                    )));
                };
                let target = manager.get_collection(&collection)?;
                let target_inner = target.read_inner()?;
                target_inner
                    .index
                    .eval_filter(&expr, &target_inner.schema)?
                    .iter()
                    .map(|seq| seq.to_string())
                    .collect()
            };

            Ok(FilterNode::Condition(ferret_query::Condition {
                field: local_field.sequence_helper_name(),
                comparator: ferret_query::Comparator::Eq,
                values,
            }))
        }
        FilterNode::Group { logical, children } => Ok(FilterNode::Group {
            logical,
            children: children
                .into_iter()
                .map(|child| resolve_reference_filters(child, self_name, inner, manager))
                .collect::<Result<Vec<_>, Error>>()?,
        }),
        other => Ok(other),
    }
}

fn strip_helpers(doc: &mut Map<String, Value>, schema: &Schema) {
    doc.remove(FLAT_KEY);
    let helpers: Vec<String> = schema
        .reference_fields()
        .map(|f| f.sequence_helper_name())
        .collect();
    for helper in helpers {
        doc.remove(&helper);
    }
}

/// Drop `.store=false` fields and pipeline bookkeeping before
/// serialisation.
fn strip_unstored(doc: &mut Map<String, Value>, schema: &Schema) {
    doc.remove(FLAT_KEY);
    let unstored: Vec<String> = schema
        .fields()
        .iter()
        .filter(|f| !f.store)
        .map(|f| f.name.clone())
        .collect();
    for field in unstored {
        crate::document::remove_path(doc, &field);
    }
}

fn line_error(line: &str, code: u16, message: &str) -> Value {
    json!({
        "success": false,
        "error": message,
        "code": code,
        "document": line,
    })
}

fn error_for(code: u16, message: String) -> Error {
    match code {
        404 => Error::NotFound(message),
        409 => Error::Conflict(message),
        422 => Error::Unprocessable(message),
        408 => Error::Timeout(message),
        500 => Error::Internal(message),
        _ => Error::BadRequest(message),
    }
}

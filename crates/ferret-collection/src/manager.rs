use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use ferret_store::{Store, WriteBatch};

use crate::assemble::{JoinClause, JoinResolver, JoinStrategy};
use crate::catalog;
use crate::collection::{Collection, CollectionMeta};
use crate::document::apply_projection;
use crate::embed::EmbedderRegistry;
use crate::error::Error;
use crate::schema::{Field, ID_FIELD};

/// Collection-create request payload.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectionCreate {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default)]
    pub default_sorting_field: String,
    #[serde(default)]
    pub symbols_to_index: Vec<char>,
    #[serde(default)]
    pub token_separators: Vec<char>,
    #[serde(default)]
    pub enable_nested_fields: bool,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub voice_query_model: Option<Value>,
}

/// Outcome of detaching a dangling reference from a dependent document.
enum Detach {
    Updated,
    DeleteDocument,
}

/// Owns every collection over one store: catalog load at startup,
/// create/get/list/drop, cross-collection reference resolution, and
/// cascade deletes.
pub struct CollectionManager<S: Store> {
    store: Arc<S>,
    collections: RwLock<HashMap<String, Arc<Collection<S>>>>,
    /// target collection → (referencing collection, reference field).
    referenced_in: RwLock<HashMap<String, Vec<(String, String)>>>,
    next_collection_id: AtomicU32,
    embedders: EmbedderRegistry,
}

impl<S: Store> CollectionManager<S> {
    /// Load all persisted collections from the catalog.
    pub fn load(store: Arc<S>) -> Result<Self, Error> {
        let mut collections = HashMap::new();
        let mut max_id = 0u32;
        for (_, value) in store.scan_prefix(catalog::META_PREFIX.as_bytes())? {
            let meta: CollectionMeta = serde_json::from_slice(&value)
                .map_err(|e| Error::Internal(format!("corrupt collection meta: {e}")))?;
            max_id = max_id.max(meta.id + 1);
            let name = meta.name.clone();
            let collection = Collection::load(Arc::clone(&store), meta)?;
            collections.insert(name, Arc::new(collection));
        }

        let manager = Self {
            store,
            collections: RwLock::new(collections),
            referenced_in: RwLock::new(HashMap::new()),
            next_collection_id: AtomicU32::new(max_id),
            embedders: EmbedderRegistry::new(),
        };
        let names: Vec<String> = manager.collection_names();
        for name in names {
            manager.register_references(&name)?;
        }
        Ok(manager)
    }

    pub fn embedders(&self) -> &EmbedderRegistry {
        &self.embedders
    }

    fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .collections
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    // ── Collection lifecycle ────────────────────────────────────

    pub fn create_collection(&self, payload: Value) -> Result<Arc<Collection<S>>, Error> {
        let create: CollectionCreate = serde_json::from_value(payload)
            .map_err(|e| Error::BadRequest(format!("invalid collection schema: {e}")))?;
        if create.name.is_empty() {
            return Err(Error::BadRequest("collection name cannot be empty".into()));
        }
        {
            let collections = self.collections.read().expect("registry lock poisoned");
            if collections.contains_key(&create.name) {
                return Err(Error::Conflict(format!(
                    "a collection with name `{}` already exists",
                    create.name
                )));
            }
        }

        let collection_id = self.next_collection_id.fetch_add(1, Ordering::SeqCst);
        let name = create.name.clone();
        let collection = Collection::create(
            Arc::clone(&self.store),
            collection_id,
            now_secs(),
            create,
        )?;
        let collection = Arc::new(collection);
        self.collections
            .write()
            .expect("registry lock poisoned")
            .insert(name.clone(), Arc::clone(&collection));
        self.register_references(&name)?;
        debug!(collection = %name, id = collection_id, "collection created");
        Ok(collection)
    }

    pub fn get_collection(&self, name: &str) -> Result<Arc<Collection<S>>, Error> {
        self.collections
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no collection named `{name}` was found")))
    }

    pub fn list_collections(&self) -> Vec<Arc<Collection<S>>> {
        let collections = self.collections.read().expect("registry lock poisoned");
        let mut out: Vec<Arc<Collection<S>>> = collections.values().cloned().collect();
        out.sort_by(|a, b| a.name().cmp(b.name()));
        out
    }

    /// Drop a collection and every key it owns.
    pub fn drop_collection(&self, name: &str) -> Result<(), Error> {
        let collection = self.get_collection(name)?;
        let collection_id = collection.collection_id();

        let mut batch = WriteBatch::new();
        batch.delete(catalog::meta_key(name));
        batch.delete(catalog::seq_counter_key(name));
        for (key, _) in self.store.scan_prefix(&catalog::override_prefix(name))? {
            batch.delete(key);
        }
        for (key, _) in self.store.scan_prefix(&catalog::synonym_prefix(name))? {
            batch.delete(key);
        }
        for (key, _) in self.store.scan_prefix(&catalog::doc_id_prefix(collection_id))? {
            batch.delete(key);
        }
        for (key, _) in self.store.scan_prefix(&catalog::seq_id_prefix(collection_id))? {
            batch.delete(key);
        }
        self.store.write(batch)?;

        self.collections
            .write()
            .expect("registry lock poisoned")
            .remove(name);
        let mut referenced_in = self.referenced_in.write().expect("registry lock poisoned");
        referenced_in.remove(name);
        for sources in referenced_in.values_mut() {
            sources.retain(|(source, _)| source != name);
        }
        Ok(())
    }

    /// Record `source → target` reference edges for a collection's schema.
    fn register_references(&self, source_name: &str) -> Result<(), Error> {
        let source = self.get_collection(source_name)?;
        let edges: Vec<(String, String)> = {
            let inner = source.read_inner()?;
            inner
                .schema
                .reference_fields()
                .filter_map(|f| {
                    f.reference_parts()
                        .ok()
                        .map(|(target, _)| (target.to_string(), f.name.clone()))
                })
                .collect()
        };
        let mut referenced_in = self.referenced_in.write().expect("registry lock poisoned");
        for (target, field) in edges {
            let entry = referenced_in.entry(target).or_default();
            let edge = (source_name.to_string(), field);
            if !entry.contains(&edge) {
                entry.push(edge);
            }
        }
        Ok(())
    }

    // ── Cascade delete ──────────────────────────────────────────

    /// Delete a document and walk incoming references breadth-first:
    /// referencing documents lose the dangling value, and are themselves
    /// deleted when the reference was required and nothing remains.
    pub fn delete_document(&self, collection_name: &str, doc_id: &str) -> Result<Value, Error> {
        let mut visited: HashSet<(String, u32)> = HashSet::new();
        let mut queue: VecDeque<(String, String)> = VecDeque::new();
        queue.push_back((collection_name.to_string(), doc_id.to_string()));
        let mut deleted_root = None;

        while let Some((name, id)) = queue.pop_front() {
            let collection = self.get_collection(&name)?;
            let Some(seq) = collection.seq_of(&id)? else {
                if deleted_root.is_none() {
                    return Err(Error::NotFound(format!(
                        "could not find a document with id: {id}"
                    )));
                }
                continue;
            };
            if !visited.insert((name.clone(), seq)) {
                continue;
            }

            let deleted = collection.delete_document(&id)?;
            if deleted_root.is_none() {
                deleted_root = Some(deleted);
            }

            let dependents = self
                .referenced_in
                .read()
                .expect("registry lock poisoned")
                .get(&name)
                .cloned()
                .unwrap_or_default();
            for (dependent_name, field_name) in dependents {
                let dependent = self.get_collection(&dependent_name)?;
                for (dep_seq, dep_id) in dependent.docs_referencing(&field_name, seq)? {
                    if visited.contains(&(dependent_name.clone(), dep_seq)) {
                        continue;
                    }
                    match self.detach_reference(&dependent, dep_seq, &field_name, seq)? {
                        Detach::DeleteDocument => {
                            queue.push_back((dependent_name.clone(), dep_id));
                        }
                        Detach::Updated => {}
                    }
                }
            }
        }

        deleted_root.ok_or_else(|| {
            Error::NotFound(format!("could not find a document with id: {doc_id}"))
        })
    }

    /// Remove a dangling reference value from a dependent document.
    fn detach_reference(
        &self,
        dependent: &Arc<Collection<S>>,
        dep_seq: u32,
        field_name: &str,
        target_seq: u32,
    ) -> Result<Detach, Error> {
        let Some(old_doc) = dependent.doc_by_seq(dep_seq)? else {
            return Ok(Detach::Updated);
        };
        let (optional, helper_name) = {
            let inner = dependent.read_inner()?;
            let field = inner.schema.field(field_name);
            (
                field.map(|f| f.optional).unwrap_or(true),
                field
                    .map(|f| f.sequence_helper_name())
                    .unwrap_or_else(|| format!("{field_name}_sequence_id")),
            )
        };

        let mut new_doc = old_doc.clone();
        let remaining = match new_doc.get_mut(&helper_name) {
            Some(Value::Array(seqs)) => {
                let before = seqs.len();
                let mut kept_indexes = Vec::new();
                for (i, v) in seqs.iter().enumerate() {
                    if v.as_u64() != Some(target_seq as u64) {
                        kept_indexes.push(i);
                    }
                }
                seqs.retain(|v| v.as_u64() != Some(target_seq as u64));
                let after = seqs.len();
                // Drop the matching value from the user-visible field too.
                if let Some(Value::Array(values)) = new_doc.get_mut(field_name) {
                    if before == values.len() {
                        let mut i = 0usize;
                        values.retain(|_| {
                            let keep = kept_indexes.contains(&i);
                            i += 1;
                            keep
                        });
                    }
                }
                after
            }
            Some(_) => {
                new_doc.remove(&helper_name);
                new_doc.remove(field_name);
                0
            }
            None => return Ok(Detach::Updated),
        };

        if remaining == 0 && !optional {
            return Ok(Detach::DeleteDocument);
        }
        dependent.rewrite_document(dep_seq, &old_doc, new_doc)?;
        Ok(Detach::Updated)
    }

    // ── Joins ───────────────────────────────────────────────────

    /// Build the assembler's join resolver for searches on `from`. The
    /// caller supplies `from`'s reference fields so the resolver never
    /// re-enters the collection lock the search already holds.
    pub fn join_resolver<'a>(
        &'a self,
        from: &'a Collection<S>,
        from_fields: Vec<Field>,
    ) -> Box<JoinResolver<'a>> {
        Box::new(move |doc, clause| self.resolve_join(from, &from_fields, doc, clause))
    }

    fn resolve_join(
        &self,
        from: &Collection<S>,
        from_fields: &[Field],
        doc: &Map<String, Value>,
        clause: &JoinClause,
    ) -> Option<Value> {
        let reference_field = from_fields
            .iter()
            .find(|f| {
                f.reference_parts()
                    .map(|(target, _)| target == clause.collection)
                    .unwrap_or(false)
            })
            .cloned()?;

        // The assembled hit has helpers stripped; go back to the stored
        // copy for the resolved seq ids.
        let doc_id = doc.get(ID_FIELD)?.as_str()?;
        let seq = from.seq_of(doc_id).ok().flatten()?;
        let raw = from.doc_by_seq(seq).ok().flatten()?;
        let helper = raw.get(&reference_field.sequence_helper_name())?;

        let target = self.get_collection(&clause.collection).ok()?;
        let target_seqs: Vec<u32> = match helper {
            Value::Array(items) => items
                .iter()
                .filter_map(|v| v.as_u64().map(|s| s as u32))
                .collect(),
            Value::Number(n) => n.as_u64().map(|s| vec![s as u32]).unwrap_or_default(),
            _ => Vec::new(),
        };
        if target_seqs.is_empty() {
            return None;
        }

        let mut joined_docs = Vec::new();
        for target_seq in target_seqs {
            let Some(mut target_doc) = target.doc_by_seq(target_seq).ok().flatten() else {
                continue;
            };
            apply_projection(
                &mut target_doc,
                &clause.include_fields,
                &clause.exclude_fields,
            );
            // Nested joins recurse on the target collection. A
            // self-referential target reuses the already-known fields
            // rather than re-entering the held lock.
            for nested in &clause.nested_join_includes {
                let target_fields: Vec<Field> = if target.name() == from.name() {
                    from_fields.to_vec()
                } else {
                    target
                        .read_inner()
                        .map(|i| i.schema.reference_fields().cloned().collect())
                        .unwrap_or_default()
                };
                if let Some(value) =
                    self.resolve_join(&target, &target_fields, &target_doc, nested)
                {
                    let alias = nested
                        .alias
                        .clone()
                        .unwrap_or_else(|| nested.collection.clone());
                    target_doc.insert(alias, value);
                }
            }
            target_doc.remove(ID_FIELD);
            joined_docs.push(target_doc);
        }
        if joined_docs.is_empty() {
            return None;
        }

        Some(match (clause.strategy, joined_docs.len()) {
            (JoinStrategy::Merge, 1) | (JoinStrategy::Nest, 1) => {
                Value::Object(joined_docs.remove(0))
            }
            (JoinStrategy::Merge, _) => {
                // One-to-many merge broadcasts value arrays per key.
                let mut broadcast: Map<String, Value> = Map::new();
                for joined in &joined_docs {
                    for (key, value) in joined {
                        match broadcast.get_mut(key) {
                            Some(Value::Array(values)) => values.push(value.clone()),
                            _ => {
                                broadcast
                                    .insert(key.clone(), Value::Array(vec![value.clone()]));
                            }
                        }
                    }
                }
                Value::Object(broadcast)
            }
            (JoinStrategy::Nest | JoinStrategy::NestArray, _) => Value::Array(
                joined_docs.into_iter().map(Value::Object).collect(),
            ),
        })
    }
}

/// `(seq, doc_id)` of documents whose helper column contains the seq.
impl<S: Store> Collection<S> {
    pub(crate) fn docs_referencing(
        &self,
        field_name: &str,
        target_seq: u32,
    ) -> Result<Vec<(u32, String)>, Error> {
        let helper = format!("{field_name}_sequence_id");
        let node = ferret_query::FilterNode::Condition(ferret_query::Condition {
            field: helper,
            comparator: ferret_query::Comparator::Eq,
            values: vec![target_seq.to_string()],
        });
        let seqs: Vec<u32> = {
            let inner = self.read_inner()?;
            inner
                .index
                .eval_filter(&node, &inner.schema)?
                .iter()
                .collect()
        };
        let mut out = Vec::with_capacity(seqs.len());
        for seq in seqs {
            if let Some(doc) = self.doc_by_seq(seq)? {
                if let Some(id) = doc.get(ID_FIELD).and_then(Value::as_str) {
                    out.push((seq, id.to_string()));
                }
            }
        }
        Ok(out)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

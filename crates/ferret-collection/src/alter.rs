use serde_json::Value;
use tracing::{info, warn};

use ferret_query::DirtyValues;
use ferret_store::{Store, WriteBatch};

use crate::catalog;
use crate::collection::Collection;
use crate::document::remove_path;
use crate::error::Error;
use crate::manager::CollectionManager;
use crate::schema::{FALLBACK_FIELD, Field, ID_FIELD, Schema};
use crate::validate::{Invalid, validate_document};

/// Documents between progress log lines during an alter scan.
const PROGRESS_EVERY: u64 = 16_384;

/// Decomposed alter payload.
struct AlterPlan {
    del_fields: Vec<String>,
    additions: Vec<Field>,
    /// Same name dropped and re-added: reindexed after plain additions.
    reindex: Vec<Field>,
    metadata: Option<Value>,
}

impl<S: Store> Collection<S> {
    /// Alter the schema in place: drop/add/reindex fields and update
    /// metadata, revalidating and reindexing live documents while reads
    /// continue against the old index between phases. Newly-added
    /// `embed.from` fields get their vectors computed during the reindex,
    /// so the manager's embedder registry is needed for them.
    pub fn alter(
        &self,
        payload: Value,
        manager: Option<&CollectionManager<S>>,
    ) -> Result<Value, Error> {
        let plan = decompose(payload)?;

        // Embedders for newly-added embed fields resolve before the
        // iteration; a missing one degrades to skipped vectors, same as
        // the write path.
        for field in plan.additions.iter().chain(plan.reindex.iter()) {
            let Some(embed) = &field.embed else { continue };
            let model = &embed.model_config.model_name;
            let available = manager
                .map(|mgr| mgr.embedders().get(model).is_some())
                .unwrap_or(false);
            if !available {
                warn!(
                    collection = %self.name,
                    field = %field.name,
                    model = %model,
                    "no embedder available for altered field; vectors will not be backfilled"
                );
            }
        }

        // Dry-run: every stored document must fit the prospective schema.
        let prospective = {
            let inner = self.read_inner()?;
            prospective_schema(&inner.schema, &plan)?
        };
        let documents = self.export_documents()?;
        let mut scanned = 0u64;
        for (_, doc) in &documents {
            let mut candidate = doc.clone();
            for deleted in &plan.del_fields {
                if plan.reindex.iter().any(|f| &f.name == deleted) {
                    continue;
                }
                remove_path(&mut candidate, deleted);
            }
            if let Err(invalid) =
                validate_document(&mut candidate, &prospective, DirtyValues::CoerceOrReject)
            {
                return Err(alter_error(invalid));
            }
            scanned += 1;
            if scanned % PROGRESS_EVERY == 0 {
                info!(
                    collection = %self.name,
                    scanned,
                    total = documents.len(),
                    "alter validation in progress"
                );
            }
        }

        // Apply: swap the schema under the exclusive lock, then walk the
        // data, removing dropped fields and reindexing through the new
        // schema. Un-indexing must use the pre-alter schema: dropped
        // fields are invisible to the new one.
        let old_schema = {
            let mut inner = self.write_inner()?;
            let old_schema = inner.schema.clone();
            inner.schema = prospective_schema(&inner.schema, &plan)?;
            prune_orphaned_embed_sources(&mut inner.schema);
            if let Some(metadata) = plan.metadata.clone() {
                inner.metadata = Some(metadata);
            }
            old_schema
        };

        let mut rewrite = WriteBatch::new();
        let mut processed = 0u64;
        for (seq_id, doc) in &documents {
            let mut updated = doc.clone();
            for deleted in &plan.del_fields {
                if plan.reindex.iter().any(|f| &f.name == deleted) {
                    // Reindexed fields keep their stored values.
                    continue;
                }
                remove_path(&mut updated, deleted);
            }

            // Backfill vectors for embed fields the document now lacks;
            // the prior version stands in as `old` so unchanged sources
            // with an existing vector are left alone.
            if let Some(manager) = manager {
                self.embed_fields(&mut updated, Some(doc), manager)?;
            }

            {
                let mut inner = self.write_inner()?;
                inner.index.remove_document(&old_schema, *seq_id, doc);
                let schema = inner.schema.clone();
                let mut indexable = updated.clone();
                validate_document(&mut indexable, &schema, DirtyValues::CoerceOrReject)
                    .map_err(alter_error)?;
                inner.index.index_document(&schema, *seq_id, &indexable)?;
            }

            if updated != *doc {
                let bytes = serde_json::to_vec(&updated)
                    .map_err(|e| Error::Internal(format!("document serialization: {e}")))?;
                rewrite.put(catalog::seq_id_key(self.collection_id, *seq_id), bytes);
            }
            processed += 1;
            if processed % PROGRESS_EVERY == 0 {
                info!(
                    collection = %self.name,
                    processed,
                    total = documents.len(),
                    "alter reindex in progress"
                );
            }
        }
        if !rewrite.is_empty() {
            self.store.write(rewrite)?;
        }

        {
            let inner = self.read_inner()?;
            self.persist_meta(&inner)?;
        }
        info!(collection = %self.name, docs = documents.len(), "alter complete");
        self.summary()
    }
}

fn decompose(payload: Value) -> Result<AlterPlan, Error> {
    let payload = payload
        .as_object()
        .ok_or_else(|| Error::BadRequest("alter payload must be a JSON object".into()))?;

    let metadata = payload.get("metadata").cloned();
    let entries = match payload.get("fields") {
        Some(Value::Array(entries)) => entries.clone(),
        Some(_) => {
            return Err(Error::BadRequest("`fields` must be an array".into()));
        }
        None if metadata.is_some() => Vec::new(),
        None => {
            return Err(Error::BadRequest(
                "alter payload needs a `fields` array or `metadata`".into(),
            ));
        }
    };

    let mut del_fields: Vec<String> = Vec::new();
    let mut additions: Vec<Field> = Vec::new();
    for entry in entries {
        let obj = entry
            .as_object()
            .ok_or_else(|| Error::BadRequest("each field entry must be an object".into()))?;
        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::BadRequest("field entry is missing `name`".into()))?;
        if name == ID_FIELD {
            return Err(Error::BadRequest("`id` cannot be altered".into()));
        }
        if obj.get("drop").and_then(Value::as_bool) == Some(true) {
            del_fields.push(name.to_string());
        } else {
            let field: Field = serde_json::from_value(entry.clone())
                .map_err(|e| Error::BadRequest(format!("invalid field `{name}`: {e}")))?;
            additions.push(field);
        }
    }

    if additions
        .iter()
        .filter(|f| f.name == FALLBACK_FIELD)
        .count()
        > 1
    {
        return Err(Error::BadRequest(
            "schema can contain at most one `.*` field".into(),
        ));
    }

    let reindex: Vec<Field> = additions
        .iter()
        .filter(|f| del_fields.contains(&f.name))
        .cloned()
        .collect();
    let additions: Vec<Field> = additions
        .into_iter()
        .filter(|f| !reindex.iter().any(|r| r.name == f.name))
        .collect();

    Ok(AlterPlan {
        del_fields,
        additions,
        reindex,
        metadata,
    })
}

/// Embedding sources that no longer exist are dropped from `embed.from`.
fn prune_orphaned_embed_sources(schema: &mut Schema) {
    let live: Vec<String> = schema.fields().iter().map(|f| f.name.clone()).collect();
    let updated: Vec<Field> = schema
        .fields()
        .iter()
        .filter(|f| f.embed.is_some())
        .cloned()
        .map(|mut f| {
            if let Some(embed) = &mut f.embed {
                embed.from.retain(|source| live.contains(source));
            }
            f
        })
        .collect();
    for field in updated {
        schema.add_discovered(field);
    }
}

/// Build the post-alter schema without touching the live one.
fn prospective_schema(current: &Schema, plan: &AlterPlan) -> Result<Schema, Error> {
    let mut schema = current.clone();
    for deleted in &plan.del_fields {
        if deleted == FALLBACK_FIELD {
            schema.set_fallback(None);
        } else {
            schema.remove_field(deleted);
        }
    }
    // Additions land first so discovery of parents precedes reindexes.
    for field in plan.additions.iter().chain(plan.reindex.iter()) {
        schema.declare(field.clone())?;
    }
    Ok(schema)
}

fn alter_error(invalid: Invalid) -> Error {
    match invalid {
        Invalid::Missing { field } => Error::BadRequest(format!(
            "field `{field}` cannot be added as non-optional: documents are already present; \
             set it as optional"
        )),
        Invalid::Type { field, .. } => Error::BadRequest(format!(
            "schema change is incompatible with field `{field}`: existing data cannot be coerced"
        )),
        other => Error::BadRequest(format!(
            "schema change is incompatible with the existing data: {}",
            Error::from(other)
        )),
    }
}

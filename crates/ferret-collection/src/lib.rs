mod alter;
mod assemble;
mod catalog;
mod collection;
mod curation;
mod document;
mod embed;
mod error;
mod executor;
mod facet;
mod highlight;
mod index;
mod manager;
mod planner;
mod schema;
mod topster;
mod validate;

#[cfg(test)]
mod tests;

pub use collection::{Collection, CollectionMeta, ImportOptions, ImportReport};
pub use curation::{AddHit, DropHit, Override, OverrideRule, RuleMatch, Synonym};
pub use embed::{Embedder, EmbedderRegistry};
pub use error::Error;
pub use manager::{CollectionCreate, CollectionManager};
pub use schema::{EmbedConfig, Field, FieldType, ModelConfig, Schema};
pub use topster::{Group, GroupedTopster, Kv, Topster};

pub use ferret_query::{DirtyValues, IndexOp, SearchParams};

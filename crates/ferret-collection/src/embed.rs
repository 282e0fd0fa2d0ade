use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Embedding-model seam. Implementations may call out to remote services;
/// the core only sees vectors. Calls happen outside the collection's
/// exclusive lock.
pub trait Embedder: Send + Sync {
    fn dims(&self) -> usize;

    /// One vector per input, in order.
    fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, String>;
}

/// Process-wide registry of embedders, keyed by model name.
#[derive(Default)]
pub struct EmbedderRegistry {
    models: RwLock<HashMap<String, Arc<dyn Embedder>>>,
}

impl EmbedderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, model_name: &str, embedder: Arc<dyn Embedder>) {
        self.models
            .write()
            .expect("embedder registry poisoned")
            .insert(model_name.to_string(), embedder);
    }

    pub fn get(&self, model_name: &str) -> Option<Arc<dyn Embedder>> {
        self.models
            .read()
            .expect("embedder registry poisoned")
            .get(model_name)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic toy embedder: char-count histogram.
    pub struct StubEmbedder {
        pub dims: usize,
    }

    impl Embedder for StubEmbedder {
        fn dims(&self) -> usize {
            self.dims
        }

        fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, String> {
            Ok(inputs
                .iter()
                .map(|input| {
                    let mut v = vec![0.0f32; self.dims];
                    for (i, b) in input.bytes().enumerate() {
                        v[i % self.dims] += (b % 16) as f32;
                    }
                    v
                })
                .collect())
        }
    }

    #[test]
    fn register_and_fetch() {
        let registry = EmbedderRegistry::new();
        registry.register("toy", Arc::new(StubEmbedder { dims: 4 }));
        let embedder = registry.get("toy").unwrap();
        let out = embedder.embed(&["abc".into()]).unwrap();
        assert_eq!(out[0].len(), 4);
        assert!(registry.get("missing").is_none());
    }
}

use std::collections::{BTreeMap, HashMap};

use roaring::RoaringBitmap;

use crate::error::EvalError;
use crate::geo::haversine_meters;

/// Order-preserving mapping from `f64` to `i64`, so floats share the
/// numeric column's ordered map with ints.
pub fn ordered_f64(value: f64) -> i64 {
    let bits = value.to_bits() as i64;
    if bits < 0 { i64::MIN ^ bits } else { bits }
}

// ── Numeric column ─────────────────────────────────────────────

/// Sorted numeric column: value → docs for range filters, doc → values for
/// sorting and faceting. Bools index as 0/1 and floats via [`ordered_f64`].
#[derive(Debug, Default, Clone)]
pub struct NumColumn {
    by_value: BTreeMap<i64, RoaringBitmap>,
    by_doc: HashMap<u32, Vec<i64>>,
}

impl NumColumn {
    pub fn add(&mut self, seq_id: u32, value: i64) {
        self.by_value.entry(value).or_default().insert(seq_id);
        self.by_doc.entry(seq_id).or_default().push(value);
    }

    pub fn remove(&mut self, seq_id: u32) {
        let Some(values) = self.by_doc.remove(&seq_id) else {
            return;
        };
        for value in values {
            if let Some(docs) = self.by_value.get_mut(&value) {
                docs.remove(seq_id);
                if docs.is_empty() {
                    self.by_value.remove(&value);
                }
            }
        }
    }

    pub fn eq(&self, value: i64) -> RoaringBitmap {
        self.by_value.get(&value).cloned().unwrap_or_default()
    }

    /// Inclusive on both ends.
    pub fn range(&self, min: i64, max: i64) -> RoaringBitmap {
        let mut out = RoaringBitmap::new();
        for docs in self.by_value.range(min..=max).map(|(_, d)| d) {
            out |= docs;
        }
        out
    }

    pub fn gt(&self, value: i64) -> RoaringBitmap {
        self.range_from(value.checked_add(1))
    }

    pub fn gte(&self, value: i64) -> RoaringBitmap {
        self.range_from(Some(value))
    }

    pub fn lt(&self, value: i64) -> RoaringBitmap {
        let mut out = RoaringBitmap::new();
        for docs in self.by_value.range(..value).map(|(_, d)| d) {
            out |= docs;
        }
        out
    }

    pub fn lte(&self, value: i64) -> RoaringBitmap {
        let mut out = RoaringBitmap::new();
        for docs in self.by_value.range(..=value).map(|(_, d)| d) {
            out |= docs;
        }
        out
    }

    fn range_from(&self, min: Option<i64>) -> RoaringBitmap {
        let mut out = RoaringBitmap::new();
        if let Some(min) = min {
            for docs in self.by_value.range(min..).map(|(_, d)| d) {
                out |= docs;
            }
        }
        out
    }

    /// First indexed value, used as the document's sort key.
    pub fn sort_key(&self, seq_id: u32) -> Option<i64> {
        self.by_doc.get(&seq_id).and_then(|v| v.first().copied())
    }

    pub fn values_of(&self, seq_id: u32) -> &[i64] {
        self.by_doc.get(&seq_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn docs(&self) -> RoaringBitmap {
        self.by_doc.keys().copied().collect()
    }
}

// ── String column ──────────────────────────────────────────────

/// Exact-value string column for `:=` filters, facet counting and string
/// sorting.
#[derive(Debug, Default, Clone)]
pub struct StrColumn {
    by_value: BTreeMap<String, RoaringBitmap>,
    by_doc: HashMap<u32, Vec<String>>,
}

impl StrColumn {
    pub fn add(&mut self, seq_id: u32, value: &str) {
        self.by_value
            .entry(value.to_string())
            .or_default()
            .insert(seq_id);
        self.by_doc
            .entry(seq_id)
            .or_default()
            .push(value.to_string());
    }

    pub fn remove(&mut self, seq_id: u32) {
        let Some(values) = self.by_doc.remove(&seq_id) else {
            return;
        };
        for value in values {
            if let Some(docs) = self.by_value.get_mut(&value) {
                docs.remove(seq_id);
                if docs.is_empty() {
                    self.by_value.remove(&value);
                }
            }
        }
    }

    pub fn eq(&self, value: &str) -> RoaringBitmap {
        self.by_value.get(value).cloned().unwrap_or_default()
    }

    /// Case-insensitive equality, for facet queries.
    pub fn eq_ignore_case(&self, value: &str) -> RoaringBitmap {
        let mut out = RoaringBitmap::new();
        for (v, docs) in &self.by_value {
            if v.eq_ignore_ascii_case(value) {
                out |= docs;
            }
        }
        out
    }

    pub fn sort_key(&self, seq_id: u32) -> Option<&str> {
        self.by_doc
            .get(&seq_id)
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    pub fn values_of(&self, seq_id: u32) -> &[String] {
        self.by_doc.get(&seq_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn docs(&self) -> RoaringBitmap {
        self.by_doc.keys().copied().collect()
    }
}

// ── Geo column ─────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct GeoColumn {
    by_doc: HashMap<u32, Vec<(f64, f64)>>,
}

impl GeoColumn {
    pub fn add(&mut self, seq_id: u32, lat: f64, lng: f64) {
        self.by_doc.entry(seq_id).or_default().push((lat, lng));
    }

    pub fn remove(&mut self, seq_id: u32) {
        self.by_doc.remove(&seq_id);
    }

    /// Docs with any point within `radius_meters` of `(lat, lng)`.
    pub fn within_radius(&self, lat: f64, lng: f64, radius_meters: f64) -> RoaringBitmap {
        let mut out = RoaringBitmap::new();
        for (&seq_id, points) in &self.by_doc {
            if points
                .iter()
                .any(|&(p_lat, p_lng)| haversine_meters(lat, lng, p_lat, p_lng) <= radius_meters)
            {
                out.insert(seq_id);
            }
        }
        out
    }

    /// Distance from the document's nearest point to `(lat, lng)`.
    pub fn distance_meters(&self, seq_id: u32, lat: f64, lng: f64) -> Option<f64> {
        self.by_doc.get(&seq_id).map(|points| {
            points
                .iter()
                .map(|&(p_lat, p_lng)| haversine_meters(lat, lng, p_lat, p_lng))
                .fold(f64::INFINITY, f64::min)
        })
    }
}

// ── Vector column ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct VectorColumn {
    dims: usize,
    by_doc: HashMap<u32, Vec<f32>>,
}

impl VectorColumn {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            by_doc: HashMap::new(),
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn add(&mut self, seq_id: u32, vector: Vec<f32>) -> Result<(), EvalError> {
        if vector.len() != self.dims {
            return Err(EvalError(format!(
                "vector has {} dims, field expects {}",
                vector.len(),
                self.dims
            )));
        }
        self.by_doc.insert(seq_id, vector);
        Ok(())
    }

    pub fn remove(&mut self, seq_id: u32) {
        self.by_doc.remove(&seq_id);
    }

    pub fn get(&self, seq_id: u32) -> Option<&[f32]> {
        self.by_doc.get(&seq_id).map(Vec::as_slice)
    }

    /// Cosine distance (1 − cosine similarity), the default vector metric.
    pub fn distance(&self, seq_id: u32, query: &[f32]) -> Option<f32> {
        self.by_doc.get(&seq_id).map(|v| cosine_distance(v, query))
    }

    /// Brute-force k-nearest scan over the column.
    pub fn nearest(&self, query: &[f32], k: usize) -> Vec<(u32, f32)> {
        let mut all: Vec<(u32, f32)> = self
            .by_doc
            .iter()
            .map(|(&seq_id, v)| (seq_id, cosine_distance(v, query)))
            .collect();
        all.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        all.truncate(k);
        all
    }
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn num_range_queries() {
        let mut col = NumColumn::default();
        col.add(1, 100);
        col.add(2, 80);
        col.add(3, 60);

        assert_eq!(col.gt(80).len(), 1);
        assert_eq!(col.gte(80).len(), 2);
        assert_eq!(col.lt(80).len(), 1);
        assert_eq!(col.lte(100).len(), 3);
        assert_eq!(col.range(60, 80).len(), 2);
        assert_eq!(col.eq(80).len(), 1);
    }

    #[test]
    fn num_remove_cleans_both_maps() {
        let mut col = NumColumn::default();
        col.add(1, 5);
        col.add(2, 5);
        col.remove(1);
        assert_eq!(col.eq(5).len(), 1);
        assert!(col.sort_key(1).is_none());
        col.remove(2);
        assert!(col.eq(5).is_empty());
    }

    #[test]
    fn ordered_f64_preserves_order() {
        let values = [-10.5, -0.1, 0.0, 0.1, 2.5, 1e9];
        for pair in values.windows(2) {
            assert!(ordered_f64(pair[0]) < ordered_f64(pair[1]), "{pair:?}");
        }
    }

    #[test]
    fn str_eq_and_sort_key() {
        let mut col = StrColumn::default();
        col.add(1, "Levis");
        col.add(2, "Levis");
        col.add(3, "Spykar");
        assert_eq!(col.eq("Levis").len(), 2);
        assert_eq!(col.eq_ignore_case("levis").len(), 2);
        assert_eq!(col.sort_key(3), Some("Spykar"));
    }

    #[test]
    fn geo_radius_filters() {
        let mut col = GeoColumn::default();
        col.add(1, 48.8566, 2.3522); // Paris
        col.add(2, 51.5074, -0.1278); // London
        let near_paris = col.within_radius(48.85, 2.35, 10_000.0);
        assert!(near_paris.contains(1));
        assert!(!near_paris.contains(2));
    }

    #[test]
    fn vector_nearest_orders_by_distance() {
        let mut col = VectorColumn::new(2);
        col.add(1, vec![1.0, 0.0]).unwrap();
        col.add(2, vec![0.0, 1.0]).unwrap();
        col.add(3, vec![0.7, 0.7]).unwrap();

        let nearest = col.nearest(&[1.0, 0.0], 2);
        assert_eq!(nearest[0].0, 1);
        assert_eq!(nearest[1].0, 3);
    }

    #[test]
    fn vector_dim_mismatch_errors() {
        let mut col = VectorColumn::new(3);
        assert!(col.add(1, vec![1.0]).is_err());
    }
}

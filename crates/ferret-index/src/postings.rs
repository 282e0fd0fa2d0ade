use std::collections::BTreeMap;
use std::ops::Bound;

use roaring::RoaringBitmap;

use crate::levenshtein::bounded_levenshtein;

/// For one `(field, token)` pair: every document containing the token and
/// the token's positions within it, kept sorted.
#[derive(Debug, Default, Clone)]
pub struct PostingList {
    docs: BTreeMap<u32, Vec<u16>>,
}

impl PostingList {
    pub fn add(&mut self, seq_id: u32, position: u16) {
        let offsets = self.docs.entry(seq_id).or_default();
        match offsets.binary_search(&position) {
            Ok(_) => {}
            Err(at) => offsets.insert(at, position),
        }
    }

    pub fn remove_doc(&mut self, seq_id: u32) {
        self.docs.remove(&seq_id);
    }

    pub fn num_docs(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn contains(&self, seq_id: u32) -> bool {
        self.docs.contains_key(&seq_id)
    }

    /// Sorted token positions of `seq_id`, empty when absent.
    pub fn positions(&self, seq_id: u32) -> &[u16] {
        self.docs.get(&seq_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn doc_ids(&self) -> RoaringBitmap {
        self.docs.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &[u16])> {
        self.docs.iter().map(|(&seq, offs)| (seq, offs.as_slice()))
    }
}

/// A token expansion produced by fuzzy or prefix lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermHit {
    pub term: String,
    /// Edit distance from the query token (0 for prefix/exact hits).
    pub cost: u8,
    /// True when matched as a prefix rather than a whole token.
    pub is_prefix: bool,
}

/// One field's term dictionary. A sorted map stands in for the trie: prefix
/// enumeration is a bounded range scan and fuzzy lookup walks candidate
/// terms with a banded edit-distance check.
#[derive(Debug, Default, Clone)]
pub struct TermIndex {
    terms: BTreeMap<String, PostingList>,
}

impl TermIndex {
    pub fn add(&mut self, term: &str, seq_id: u32, position: u16) {
        self.terms
            .entry(term.to_string())
            .or_default()
            .add(seq_id, position);
    }

    pub fn remove_doc(&mut self, term: &str, seq_id: u32) {
        if let Some(postings) = self.terms.get_mut(term) {
            postings.remove_doc(seq_id);
            if postings.is_empty() {
                self.terms.remove(term);
            }
        }
    }

    pub fn num_terms(&self) -> usize {
        self.terms.len()
    }

    pub fn postings(&self, term: &str) -> Option<&PostingList> {
        self.terms.get(term)
    }

    /// Terms starting with `prefix` (the exact term excluded), best-first
    /// by document frequency, capped at `limit`.
    pub fn prefix_terms(&self, prefix: &str, limit: usize) -> Vec<TermHit> {
        let mut hits: Vec<(&String, usize)> = self
            .terms
            .range::<str, _>((Bound::Excluded(prefix), Bound::Unbounded))
            .take_while(|(term, _)| term.starts_with(prefix))
            .map(|(term, postings)| (term, postings.num_docs()))
            .collect();
        hits.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        hits.truncate(limit);
        hits.into_iter()
            .map(|(term, _)| TermHit {
                term: term.clone(),
                cost: 0,
                is_prefix: true,
            })
            .collect()
    }

    /// Terms within `max_cost` edits of `token` (the exact term excluded),
    /// cheapest first, ties broken by document frequency.
    pub fn fuzzy_terms(&self, token: &str, max_cost: u8, limit: usize) -> Vec<TermHit> {
        if max_cost == 0 {
            return Vec::new();
        }
        let mut hits: Vec<(u8, usize, &String)> = Vec::new();
        for (term, postings) in &self.terms {
            if term == token {
                continue;
            }
            if let Some(cost) = bounded_levenshtein(token, term, max_cost) {
                if cost > 0 {
                    hits.push((cost, postings.num_docs(), term));
                }
            }
        }
        hits.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)).then(a.2.cmp(b.2)));
        hits.truncate(limit);
        hits.into_iter()
            .map(|(cost, _, term)| TermHit {
                term: term.clone(),
                cost,
                is_prefix: false,
            })
            .collect()
    }

    /// Terms containing `needle` strictly inside (infix search), capped at
    /// `limit`.
    pub fn infix_terms(&self, needle: &str, limit: usize) -> Vec<TermHit> {
        let mut hits: Vec<(&String, usize)> = self
            .terms
            .iter()
            .filter(|(term, _)| term.as_str() != needle && term.contains(needle))
            .filter(|(term, _)| !term.starts_with(needle))
            .map(|(term, postings)| (term, postings.num_docs()))
            .collect();
        hits.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        hits.truncate(limit);
        hits.into_iter()
            .map(|(term, _)| TermHit {
                term: term.clone(),
                cost: 0,
                is_prefix: false,
            })
            .collect()
    }

    /// All documents under any term of this field.
    pub fn all_docs(&self) -> RoaringBitmap {
        let mut out = RoaringBitmap::new();
        for postings in self.terms.values() {
            out |= postings.doc_ids();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(entries: &[(&str, u32, u16)]) -> TermIndex {
        let mut idx = TermIndex::default();
        for &(term, seq, pos) in entries {
            idx.add(term, seq, pos);
        }
        idx
    }

    #[test]
    fn postings_keep_sorted_positions() {
        let idx = index(&[("denim", 1, 4), ("denim", 1, 2), ("denim", 2, 0)]);
        let postings = idx.postings("denim").unwrap();
        assert_eq!(postings.positions(1), &[2, 4]);
        assert_eq!(postings.num_docs(), 2);
    }

    #[test]
    fn remove_doc_prunes_empty_terms() {
        let mut idx = index(&[("denim", 1, 0)]);
        idx.remove_doc("denim", 1);
        assert!(idx.postings("denim").is_none());
        assert_eq!(idx.num_terms(), 0);
    }

    #[test]
    fn prefix_lookup_excludes_exact() {
        let idx = index(&[("app", 1, 0), ("apple", 2, 0), ("application", 3, 0)]);
        let hits = idx.prefix_terms("app", 10);
        let terms: Vec<&str> = hits.iter().map(|h| h.term.as_str()).collect();
        assert!(terms.contains(&"apple"));
        assert!(terms.contains(&"application"));
        assert!(!terms.contains(&"app"));
        assert!(hits.iter().all(|h| h.is_prefix));
    }

    #[test]
    fn fuzzy_lookup_orders_by_cost() {
        let idx = index(&[("denim", 1, 0), ("denims", 2, 0), ("venims", 3, 0)]);
        let hits = idx.fuzzy_terms("denim", 2, 10);
        assert_eq!(hits[0].term, "denims");
        assert_eq!(hits[0].cost, 1);
        assert_eq!(hits[1].term, "venims");
        assert_eq!(hits[1].cost, 2);
    }

    #[test]
    fn fuzzy_zero_budget_is_empty() {
        let idx = index(&[("denim", 1, 0)]);
        assert!(idx.fuzzy_terms("denm", 0, 10).is_empty());
    }

    #[test]
    fn infix_lookup_skips_prefix_hits() {
        let idx = index(&[("codebase", 1, 0), ("decode", 2, 0), ("coder", 3, 0)]);
        let hits = idx.infix_terms("code", 10);
        let terms: Vec<&str> = hits.iter().map(|h| h.term.as_str()).collect();
        assert_eq!(terms, vec!["decode"]);
    }

    #[test]
    fn all_docs_unions_terms() {
        let idx = index(&[("a", 1, 0), ("b", 2, 0), ("b", 3, 0)]);
        assert_eq!(idx.all_docs().len(), 3);
    }
}

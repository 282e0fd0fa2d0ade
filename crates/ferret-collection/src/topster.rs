use std::cmp::Ordering;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use roaring::RoaringBitmap;

/// `match_score_index` marker for curated (pinned) records.
pub const CURATED_RECORD_IDENTIFIER: u8 = 100;

/// Candidates retained per search before pagination.
pub const DEFAULT_TOPSTER_SIZE: usize = 250;

/// Upper bound on `group_limit`.
pub const GROUP_LIMIT_MAX: usize = 99;

/// A ranked candidate. `scores` is the composite sort key, slots filled in
/// the planner-declared clause order with ascending clauses negated, so
/// bigger is always better.
#[derive(Debug, Clone, PartialEq)]
pub struct Kv {
    pub query_index: u16,
    pub seq_id: u32,
    pub distinct_key: u64,
    /// Which `scores` slot carries the text-match/fused score;
    /// [`CURATED_RECORD_IDENTIFIER`] marks curated entries.
    pub match_score_index: u8,
    pub scores: [i64; 3],
    pub text_match_score: u64,
    pub vector_distance: f32,
}

impl Kv {
    pub fn is_curated(&self) -> bool {
        self.match_score_index == CURATED_RECORD_IDENTIFIER
    }

    /// Descending composite order, `seq_id` (newest first) as the final
    /// tiebreak.
    pub fn ranks_above(&self, other: &Kv) -> bool {
        match self.scores.cmp(&other.scores) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self.seq_id > other.seq_id,
        }
    }

    fn rank_key(&self) -> ([i64; 3], u32) {
        (self.scores, self.seq_id)
    }
}

/// Fixed-capacity selector of the best candidates, one entry per key
/// (`seq_id`, or `distinct_key` inside a grouped topster). Eviction runs
/// off a lazy min-heap: stale heap entries are skipped when popped.
#[derive(Debug)]
pub struct Topster {
    capacity: usize,
    entries: HashMap<u64, Kv>,
    heap: BinaryHeap<Reverse<(([i64; 3], u32), u64)>>,
}

impl Topster {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            heap: BinaryHeap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: u64) -> bool {
        self.entries.contains_key(&key)
    }

    /// Add keyed by `seq_id`.
    pub fn add(&mut self, kv: Kv) -> bool {
        let key = kv.seq_id as u64;
        self.add_keyed(key, kv)
    }

    /// Insert or replace; returns whether the candidate was retained.
    pub fn add_keyed(&mut self, key: u64, kv: Kv) -> bool {
        if let Some(existing) = self.entries.get(&key) {
            if !kv.ranks_above(existing) {
                return false;
            }
            self.heap.push(Reverse((kv.rank_key(), key)));
            self.entries.insert(key, kv);
            return true;
        }

        if self.entries.len() < self.capacity {
            self.heap.push(Reverse((kv.rank_key(), key)));
            self.entries.insert(key, kv);
            return true;
        }

        // Full: locate the live minimum, discarding stale heap entries.
        loop {
            let Some(&Reverse((rank, worst_key))) = self.heap.peek() else {
                // Heap drained by staleness; rebuild from live entries.
                self.rebuild_heap();
                continue;
            };
            match self.entries.get(&worst_key) {
                Some(live) if live.rank_key() == rank => {
                    if kv.ranks_above(live) {
                        self.heap.pop();
                        self.entries.remove(&worst_key);
                        self.heap.push(Reverse((kv.rank_key(), key)));
                        self.entries.insert(key, kv);
                        return true;
                    }
                    return false;
                }
                _ => {
                    self.heap.pop();
                }
            }
        }
    }

    fn rebuild_heap(&mut self) {
        self.heap = self
            .entries
            .iter()
            .map(|(&key, kv)| Reverse((kv.rank_key(), key)))
            .collect();
    }

    /// Materialise descending rank order.
    pub fn sorted(&self) -> Vec<Kv> {
        let mut out: Vec<Kv> = self.entries.values().cloned().collect();
        out.sort_by(|a, b| b.rank_key().cmp(&a.rank_key()));
        out
    }
}

/// Grouped variant: every `distinct_key` owns an inner topster of capacity
/// `group_limit`; groups are ranked by their best member.
#[derive(Debug)]
pub struct GroupedTopster {
    capacity: usize,
    group_limit: usize,
    groups: HashMap<u64, Topster>,
    found: HashMap<u64, RoaringBitmap>,
}

/// One finalised group: key, ranked hits, and the number of underlying
/// documents seen for the group.
#[derive(Debug)]
pub struct Group {
    pub distinct_key: u64,
    pub hits: Vec<Kv>,
    pub found: usize,
}

impl GroupedTopster {
    pub fn new(capacity: usize, group_limit: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            group_limit: group_limit.clamp(1, GROUP_LIMIT_MAX),
            groups: HashMap::new(),
            found: HashMap::new(),
        }
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn add(&mut self, kv: Kv) {
        let group_key = kv.distinct_key;
        self.found.entry(group_key).or_default().insert(kv.seq_id);

        if !self.groups.contains_key(&group_key) && self.groups.len() >= self.capacity {
            // At capacity: evict the group with the worst representative
            // if the newcomer beats it.
            let worst = self
                .groups
                .iter()
                .min_by(|(_, a), (_, b)| {
                    representative_rank(a).cmp(&representative_rank(b))
                })
                .map(|(&key, t)| (key, representative_rank(t)));
            match worst {
                Some((worst_key, worst_rank)) if (kv.rank_key()) > worst_rank => {
                    self.groups.remove(&worst_key);
                }
                _ => return,
            }
        }

        self.groups
            .entry(group_key)
            .or_insert_with(|| Topster::new(self.group_limit))
            .add(kv);
    }

    /// Sort inner groups, then order groups by their representative. When
    /// `group_found_order` is set, representatives rank by group size
    /// instead (negated for ascending).
    pub fn finalize(&self, group_found_order: Option<(usize, bool)>) -> Vec<Group> {
        let mut groups: Vec<Group> = self
            .groups
            .iter()
            .map(|(&distinct_key, topster)| Group {
                distinct_key,
                hits: topster.sorted(),
                found: self
                    .found
                    .get(&distinct_key)
                    .map(|b| b.len() as usize)
                    .unwrap_or(0),
            })
            .filter(|g| !g.hits.is_empty())
            .collect();

        groups.sort_by(|a, b| {
            let rank_a = group_rank(a, group_found_order);
            let rank_b = group_rank(b, group_found_order);
            rank_b.cmp(&rank_a)
        });
        groups
    }
}

fn representative_rank(topster: &Topster) -> ([i64; 3], u32) {
    topster
        .entries
        .values()
        .map(Kv::rank_key)
        .max()
        .unwrap_or(([i64::MIN; 3], 0))
}

fn group_rank(group: &Group, group_found_order: Option<(usize, bool)>) -> ([i64; 3], u32) {
    let rep = &group.hits[0];
    let mut scores = rep.scores;
    if let Some((slot, ascending)) = group_found_order {
        let found = group.found as i64;
        scores[slot.min(2)] = if ascending { -found } else { found };
    }
    (scores, rep.seq_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(seq_id: u32, score: i64) -> Kv {
        Kv {
            query_index: 0,
            seq_id,
            distinct_key: seq_id as u64,
            match_score_index: 0,
            scores: [score, 0, 0],
            text_match_score: score.max(0) as u64,
            vector_distance: 0.0,
        }
    }

    fn grouped_kv(seq_id: u32, group: u64, score: i64) -> Kv {
        Kv {
            distinct_key: group,
            ..kv(seq_id, score)
        }
    }

    #[test]
    fn keeps_top_k_in_descending_order() {
        let mut topster = Topster::new(3);
        for (seq, score) in [(1, 10), (2, 50), (3, 30), (4, 40), (5, 20)] {
            topster.add(kv(seq, score));
        }
        let sorted = topster.sorted();
        let scores: Vec<i64> = sorted.iter().map(|kv| kv.scores[0]).collect();
        assert_eq!(scores, vec![50, 40, 30]);
    }

    #[test]
    fn same_seq_keeps_best_score() {
        let mut topster = Topster::new(10);
        topster.add(kv(1, 10));
        topster.add(kv(1, 30));
        topster.add(kv(1, 20));
        let sorted = topster.sorted();
        assert_eq!(sorted.len(), 1);
        assert_eq!(sorted[0].scores[0], 30);
    }

    #[test]
    fn equal_scores_tiebreak_newest_first() {
        let mut topster = Topster::new(10);
        topster.add(kv(1, 10));
        topster.add(kv(2, 10));
        let sorted = topster.sorted();
        assert_eq!(sorted[0].seq_id, 2);
    }

    #[test]
    fn full_topster_rejects_worse_candidates() {
        let mut topster = Topster::new(2);
        topster.add(kv(1, 50));
        topster.add(kv(2, 40));
        assert!(!topster.add(kv(3, 10)));
        assert!(topster.add(kv(4, 60)));
        let seqs: Vec<u32> = topster.sorted().iter().map(|kv| kv.seq_id).collect();
        assert_eq!(seqs, vec![4, 1]);
    }

    #[test]
    fn lexicographic_scores_respected() {
        let mut topster = Topster::new(10);
        let mut a = kv(1, 5);
        a.scores = [5, 9, 0];
        let mut b = kv(2, 5);
        b.scores = [5, 1, 99];
        topster.add(a);
        topster.add(b);
        assert_eq!(topster.sorted()[0].seq_id, 1);
    }

    #[test]
    fn grouped_caps_hits_per_group() {
        let mut grouped = GroupedTopster::new(10, 2);
        grouped.add(grouped_kv(1, 7, 10));
        grouped.add(grouped_kv(2, 7, 30));
        grouped.add(grouped_kv(3, 7, 20));
        let groups = grouped.finalize(None);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].hits.len(), 2);
        assert_eq!(groups[0].found, 3);
        let seqs: Vec<u32> = groups[0].hits.iter().map(|kv| kv.seq_id).collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    #[test]
    fn groups_ordered_by_representative() {
        let mut grouped = GroupedTopster::new(10, 3);
        grouped.add(grouped_kv(1, 100, 10));
        grouped.add(grouped_kv(2, 200, 90));
        grouped.add(grouped_kv(3, 100, 50));
        let groups = grouped.finalize(None);
        assert_eq!(groups[0].distinct_key, 200);
        assert_eq!(groups[1].distinct_key, 100);
    }

    #[test]
    fn group_found_order_overrides_representative() {
        let mut grouped = GroupedTopster::new(10, 3);
        // Group 100: two docs, low scores. Group 200: one doc, high score.
        grouped.add(grouped_kv(1, 100, 10));
        grouped.add(grouped_kv(2, 100, 20));
        grouped.add(grouped_kv(3, 200, 90));
        let groups = grouped.finalize(Some((0, false)));
        assert_eq!(groups[0].distinct_key, 100);
        assert_eq!(groups[0].found, 2);
    }
}

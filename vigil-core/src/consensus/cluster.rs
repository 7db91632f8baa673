use std::collections::BTreeMap;

use crate::types::{Category, LineRange};

/// Union-find over `0..len` with path compression and union by rank.
#[derive(Clone, Debug)]
pub struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    pub fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            rank: vec![0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    pub fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] = self.rank[ra].saturating_add(1);
            }
        }
        true
    }

    /// Members of every set, each sorted, ordered by smallest member.
    pub fn groups(&mut self) -> Vec<Vec<usize>> {
        let mut by_root: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for idx in 0..self.len() {
            let root = self.find(idx);
            by_root.entry(root).or_default().push(idx);
        }
        let mut groups: Vec<Vec<usize>> = by_root.into_values().collect();
        groups.sort_by_key(|g| g[0]);
        groups
    }
}

/// Clustering view of one finding.
#[derive(Clone, Copy, Debug)]
pub struct ClusterKey<'a> {
    pub file: &'a str,
    pub category: &'a Category,
    pub location: LineRange,
}

/// Groups findings that share file and category and whose line ranges are
/// at most `window` lines apart, transitively.
///
/// Within a (file, category) bucket, items are swept in start order. Every
/// earlier item that reaches the current one also reaches the earlier item
/// with the furthest end, so they already share a set and one union with
/// that item is enough.
pub fn cluster(keys: &[ClusterKey<'_>], window: u32) -> Vec<Vec<usize>> {
    let mut buckets: BTreeMap<(&str, &Category), Vec<usize>> = BTreeMap::new();
    for (idx, key) in keys.iter().enumerate() {
        buckets.entry((key.file, key.category)).or_default().push(idx);
    }

    let mut sets = DisjointSet::new(keys.len());
    for members in buckets.values_mut() {
        members.sort_by_key(|&i| (keys[i].location.start, keys[i].location.end, i));

        let mut reach: Option<(usize, u32)> = None;
        for &idx in members.iter() {
            let loc = keys[idx].location;
            match reach {
                Some((anchor, end)) if loc.start <= end.saturating_add(window) => {
                    sets.union(anchor, idx);
                    if loc.end > end {
                        reach = Some((idx, loc.end));
                    }
                }
                _ => reach = Some((idx, loc.end)),
            }
        }
    }
    sets.groups()
}

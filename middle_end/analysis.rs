//! Static analysis of bril programs.
//!
//! Every analysis in this crate is an instance of the same worklist solver:
//! per-edge fact slots, one `out` fact per block, a join over the slots and a
//! transfer over the block.  The solver owns that state for the duration of
//! one run.

use std::collections::VecDeque;
use std::collections::{BTreeMap as Map, BTreeSet as Set};

use log::debug;

use super::cfg::Cfg;

pub mod constant_prop;
pub mod dominators;
pub mod liveness;
pub mod mem_alias;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    Forward,
    Backward,
}

/// The generic fixed-point engine.
///
/// For a forward analysis a block has one slot per predecessor edge; for a
/// backward analysis one per successor edge.  `out` is the block's result
/// fact and `touch` counts visits, which is what guarantees every reachable
/// block is processed at least once even when its fact never changes.
pub struct Solver<T> {
    dir: Direction,
    preds: Vec<Vec<usize>>,
    succs: Vec<Vec<usize>>,
    pub slots: Vec<Vec<T>>,
    pub out: Vec<T>,
    pub touch: Vec<u32>,
}

impl<T: Clone + Default + PartialEq> Solver<T> {
    pub fn new(cfg: &Cfg, dir: Direction) -> Self {
        let preds: Vec<Vec<usize>> = cfg.blocks.iter().map(|b| b.preds.clone()).collect();
        let succs: Vec<Vec<usize>> = cfg.blocks.iter().map(|b| b.succs.clone()).collect();
        let slots = match dir {
            Direction::Forward => preds
                .iter()
                .map(|p| vec![T::default(); p.len()])
                .collect(),
            Direction::Backward => succs
                .iter()
                .map(|s| vec![T::default(); s.len()])
                .collect(),
        };
        let n = preds.len();
        Solver {
            dir,
            preds,
            succs,
            slots,
            out: vec![T::default(); n],
            touch: vec![0; n],
        }
    }

    /// Append an extra inbound slot to a block, used to inject boundary
    /// facts (argument taints, pointer arguments) into the entry.
    pub fn seed(&mut self, block: usize, fact: T) {
        self.slots[block].push(fact);
    }

    /// Run to a fixed point from the natural seeds: block 0 for a forward
    /// analysis, the exit blocks for a backward one.
    pub fn run<J, F>(&mut self, join: J, transfer: F)
    where
        J: FnMut(&[T]) -> T,
        F: FnMut(usize, T, &[T]) -> T,
    {
        let seeds = match self.dir {
            Direction::Forward => {
                if self.out.is_empty() {
                    Vec::new()
                } else {
                    vec![0]
                }
            }
            Direction::Backward => (0..self.out.len())
                .filter(|&b| self.succs[b].is_empty())
                .collect(),
        };
        self.iterate(seeds, join, transfer);
    }

    /// Run another fixed point over every block without resetting any state.
    /// This is the second-phase schedule used by the rewrite passes (dce
    /// deletion, phi cleanup, dead-store deletion).
    pub fn resweep<J, F>(&mut self, join: J, transfer: F)
    where
        J: FnMut(&[T]) -> T,
        F: FnMut(usize, T, &[T]) -> T,
    {
        let seeds: Vec<usize> = match self.dir {
            Direction::Forward => (0..self.out.len()).collect(),
            Direction::Backward => (0..self.out.len()).rev().collect(),
        };
        self.iterate(seeds, join, transfer);
    }

    fn iterate<J, F>(&mut self, seeds: Vec<usize>, mut join: J, mut transfer: F)
    where
        J: FnMut(&[T]) -> T,
        F: FnMut(usize, T, &[T]) -> T,
    {
        let mut worklist: VecDeque<usize> = seeds.into();
        while let Some(b) = worklist.pop_front() {
            let local = join(&self.slots[b]);
            let new = transfer(b, local, &self.slots[b]);
            self.touch[b] += 1;
            let changed = new != self.out[b] || self.touch[b] == 1;
            self.out[b] = new;
            debug!("block {b}: touch {}, changed {changed}", self.touch[b]);

            let neighbors = match self.dir {
                Direction::Forward => &self.succs[b],
                Direction::Backward => &self.preds[b],
            };
            if changed {
                for &n in neighbors {
                    let keys = match self.dir {
                        Direction::Forward => &self.preds[n],
                        Direction::Backward => &self.succs[n],
                    };
                    // slots are aligned with the stable edge order
                    if let Some(idx) = keys.iter().position(|&k| k == b) {
                        self.slots[n][idx] = self.out[b].clone();
                    }
                    if !worklist.contains(&n) {
                        worklist.push_back(n);
                    }
                }
            } else {
                for &n in neighbors {
                    if self.touch[n] == 0 && !worklist.contains(&n) {
                        worklist.push_back(n);
                    }
                }
            }
        }
    }
}

// SECTION: join helpers shared by the analyses

/// Union across all slots.
pub fn union_sets<T: Ord + Clone>(slots: &[Set<T>]) -> Set<T> {
    let mut union = Set::new();
    for s in slots {
        union.extend(s.iter().cloned());
    }
    union
}

/// Intersection across slots, starting from the first non-empty one.  With
/// `skip_empty`, empty slots (edges not yet processed) act as the identity.
pub fn intersect_sets<T: Ord + Clone>(slots: &[Set<T>], skip_empty: bool) -> Set<T> {
    let Some(base) = slots.iter().find(|s| !s.is_empty()) else {
        return Set::new();
    };
    let mut result = base.clone();
    for s in slots {
        if skip_empty && s.is_empty() {
            continue;
        }
        result = result.intersection(s).cloned().collect();
    }
    result
}

/// Key-value intersection: an entry survives only when every slot carries it
/// with the same value.
pub fn merge_maps_exact<K, V>(slots: &[Map<K, V>]) -> Map<K, V>
where
    K: Ord + Clone,
    V: Clone + PartialEq,
{
    let Some(base) = slots.first() else {
        return Map::new();
    };
    let mut merged = base.clone();
    for m in &slots[1..] {
        merged.retain(|k, v| m.get(k).map_or(false, |mv| mv == v));
    }
    merged
}

/// The permissive merge used by ssa renaming: empty slots are skipped; keys
/// agreeing across every non-empty slot keep their value; keys unique to
/// some slot are injected with the first observed value; keys that every
/// slot defines but with different values are dropped.
pub fn merge_maps_loose<K, V>(slots: &[Map<K, V>]) -> Map<K, V>
where
    K: Ord + Clone,
    V: Clone + PartialEq,
{
    let Some(base) = slots.iter().find(|m| !m.is_empty()) else {
        return Map::new();
    };
    let mut merged = base.clone();
    let mut common_keys: Set<K> = base.keys().cloned().collect();
    let mut all_keys: Set<K> = common_keys.clone();
    for m in slots {
        if m.is_empty() {
            continue;
        }
        merged.retain(|k, v| m.get(k).map_or(false, |mv| mv == v));
        common_keys.retain(|k| m.contains_key(k));
        all_keys.extend(m.keys().cloned());
    }
    for key in &all_keys {
        if common_keys.contains(key) || merged.contains_key(key) {
            continue;
        }
        if let Some(value) = slots.iter().find_map(|m| m.get(key)) {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Key-wise set union, the join of the points-to lattice.
pub fn union_map_sets<K, V>(slots: &[Map<K, Set<V>>]) -> Map<K, Set<V>>
where
    K: Ord + Clone,
    V: Ord + Clone,
{
    let mut merged: Map<K, Set<V>> = Map::new();
    for m in slots {
        for (k, locs) in m {
            merged
                .entry(k.clone())
                .or_default()
                .extend(locs.iter().cloned());
        }
    }
    merged
}

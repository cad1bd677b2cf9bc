//! Dominator sets and the dominance frontier.

use super::*;

/// `Dom(b) = {b} ∪ ⋂ Dom(p)` over the predecessors of `b`, solved with the
/// worklist engine on the set lattice.  Slots of predecessors that have not
/// been processed yet are empty and act as the identity of the meet.
pub fn dominators(cfg: &Cfg) -> Vec<Set<usize>> {
    let mut solver: Solver<Set<usize>> = Solver::new(cfg, Direction::Forward);
    solver.run(
        |slots| intersect_sets(slots, true),
        |b, mut doms, _| {
            doms.insert(b);
            doms
        },
    );
    solver.out
}

/// `frontier[b] = [j : ∃p ∈ pred(j). b ∈ Dom(p) ∧ b ∉ Dom(j)]` — the blocks
/// where a definition in `b` first meets definitions arriving on other
/// paths, which is where the ssa builder places phis for `b`'s defs.
pub fn dominance_frontier(cfg: &Cfg, doms: &[Set<usize>]) -> Map<usize, Vec<usize>> {
    let mut frontier: Map<usize, Vec<usize>> = Map::new();
    for (j, block) in cfg.blocks.iter().enumerate() {
        for &p in &block.preds {
            for &b in &doms[p] {
                if !doms[j].contains(&b) {
                    let joins = frontier.entry(b).or_default();
                    if !joins.contains(&j) {
                        joins.push(j);
                    }
                }
            }
        }
    }
    frontier
}

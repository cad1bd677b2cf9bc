//! Live-variable analysis.
//!
//! Backward over the powerset of names, join = union of successor slots.

use super::*;
use crate::middle_end::cfg::Block;

pub type LiveSet = Set<String>;

/// Walk a block in reverse: a definition kills its dest, then every use is
/// added.  `live` is the set at block exit; the result is the set at entry.
pub fn block_transfer(block: &Block, mut live: LiveSet) -> LiveSet {
    for instr in block.instrs.iter().rev() {
        let Some(op) = instr.as_op() else { continue };
        if let Some(dest) = &op.dest {
            live.remove(dest);
        }
        for arg in &op.args {
            live.insert(arg.clone());
        }
    }
    live
}

/// Solve liveness for a whole function.  The converged solver is returned so
/// dce can keep iterating on the same state.
pub fn solve(cfg: &Cfg) -> Solver<LiveSet> {
    let mut solver: Solver<LiveSet> = Solver::new(cfg, Direction::Backward);
    let blocks = &cfg.blocks;
    solver.run(union_sets, |b, live, _| block_transfer(&blocks[b], live));
    solver
}

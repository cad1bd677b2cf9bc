//! Dead store elimination over the may-alias analysis.
//!
//! A store is dead when the same pointer is stored again on every path
//! before any load that may observe it.  The backward fact is the set of
//! pointers with such a pending overwrite.

use std::collections::BTreeSet as Set;

use log::debug;

use crate::commons::{IrError, Valid};
use crate::middle_end::analysis::{intersect_sets, mem_alias, Direction, Solver};
use crate::middle_end::bril::Program;
use crate::middle_end::cfg::{Block, Cfg};

fn dse_block(
    block: &Block,
    mut pending: Set<String>,
    pts: &mem_alias::PointsTo,
    mut dead: Option<&mut Vec<usize>>,
) -> Set<String> {
    // a name the block's map does not cover could point anywhere
    let locs = |name: &str| {
        pts.get(name)
            .cloned()
            .unwrap_or_else(mem_alias::all)
    };

    for (i, instr) in block.instrs.iter().enumerate().rev() {
        let Some(op) = instr.as_op() else { continue };
        match op.op.as_str() {
            "store" => {
                let Some(ptr) = op.args.first() else { continue };
                if pending.contains(ptr) {
                    if let Some(dead) = dead.as_mut() {
                        debug!("store through `{ptr}` at {i} is dead");
                        dead.push(i);
                    }
                } else {
                    pending.insert(ptr.clone());
                }
            }
            "load" => {
                let Some(ptr) = op.args.first() else { continue };
                let loaded = locs(ptr);
                pending.retain(|p| !mem_alias::may_alias(&locs(p), &loaded));
            }
            _ => {}
        }
    }
    pending
}

pub fn dead_store_elimination(valid_program: Valid<Program>) -> Result<Valid<Program>, IrError> {
    let mut program = valid_program.0;
    for f in &mut program.functions {
        let mut cfg = Cfg::build(f, false)?;
        let pts = mem_alias::analyze(&cfg, f);

        let mut solver: Solver<Set<String>> = Solver::new(&cfg, Direction::Backward);
        {
            let blocks = &cfg.blocks;
            solver.run(
                |slots| intersect_sets(slots, false),
                |b, pending, _| dse_block(&blocks[b], pending, &pts[b], None),
            );
        }
        {
            let blocks = &mut cfg.blocks;
            solver.resweep(
                |slots| intersect_sets(slots, false),
                |b, pending, _| {
                    let mut dead = Vec::new();
                    let out = dse_block(&blocks[b], pending, &pts[b], Some(&mut dead));
                    for i in dead {
                        blocks[b].instrs.remove(i);
                    }
                    out
                },
            );
        }
        f.instrs = cfg.flatten();
    }
    program.validate()
}

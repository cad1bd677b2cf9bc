//! May-alias points-to analysis over abstract allocation sites.

use derive_more::Display;

use super::*;
use crate::middle_end::bril::Function;
use crate::middle_end::cfg::Block;

/// An abstract location: one allocation site, or the universal sink that
/// aliases everything (loaded pointers, pointers returned from calls,
/// pointer arguments).
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord)]
pub enum Loc {
    #[display(fmt = "{} {}", _0, _1)]
    Site(usize, usize),
    #[display(fmt = "all")]
    All,
}

pub type PointsTo = Map<String, Set<Loc>>;

pub fn all() -> Set<Loc> {
    [Loc::All].into()
}

/// Whether two loc sets may refer to the same memory.  `all` aliases
/// everything, in both directions.
pub fn may_alias(a: &Set<Loc>, b: &Set<Loc>) -> bool {
    a.contains(&Loc::All) || b.contains(&Loc::All) || !a.is_disjoint(b)
}

fn alias_block(block: &Block, b: usize, mut env: PointsTo) -> PointsTo {
    for (i, instr) in block.instrs.iter().enumerate() {
        let Some(op) = instr.as_op() else { continue };
        let Some(dest) = op.dest.clone() else { continue };
        let is_ptr = op.typ.as_ref().map_or(false, |t| t.is_ptr());

        // a source pointer the analysis has not seen could point anywhere
        let source = |env: &PointsTo, name: Option<&String>| -> Set<Loc> {
            name.and_then(|n| env.get(n).cloned()).unwrap_or_else(all)
        };

        match op.op.as_str() {
            "alloc" => {
                env.insert(dest, [Loc::Site(b, i)].into());
            }
            "ptradd" => {
                let locs = source(&env, op.args.first());
                env.insert(dest, locs);
            }
            "id" if is_ptr => {
                let locs = source(&env, op.args.first());
                env.insert(dest, locs);
            }
            "load" if is_ptr => {
                env.insert(dest, all());
            }
            "phi" if is_ptr => {
                let mut locs = Set::new();
                for arg in &op.args {
                    if let Some(src) = env.get(arg) {
                        locs.extend(src.iter().copied());
                    }
                }
                env.insert(dest, locs);
            }
            "call" if is_ptr => {
                env.insert(dest, all());
            }
            _ => {}
        }
    }
    env
}

/// Solve may-alias for one function over an already-built cfg.  Returns
/// each block's post-state location map.  The maps are kept per block
/// because a name rebound in sibling branches (legal outside ssa form)
/// points at a different site in each of them.
pub fn analyze(cfg: &Cfg, f: &Function) -> Vec<PointsTo> {
    let mut solver: Solver<PointsTo> = Solver::new(cfg, Direction::Forward);

    // pointer arguments may point anywhere
    let arg_seed: PointsTo = f
        .args
        .iter()
        .filter(|a| a.typ.is_ptr())
        .map(|a| (a.name.clone(), all()))
        .collect();
    if !arg_seed.is_empty() {
        solver.seed(0, arg_seed);
    }

    let blocks = &cfg.blocks;
    solver.run(union_map_sets, |b, env, _| alias_block(&blocks[b], b, env));

    solver.out
}

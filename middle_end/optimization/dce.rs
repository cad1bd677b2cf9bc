//! Dead-code elimination driven by live-variable analysis.

use log::debug;

use crate::commons::{IrError, Valid};
use crate::middle_end::analysis::{liveness, union_sets};
use crate::middle_end::bril::Program;
use crate::middle_end::cfg::{Block, Cfg};

/// Operators that are kept regardless of their destination's liveness.
const EFFECTFUL_OPS: [&str; 4] = ["ret", "store", "print", "call"];

fn dce_block(block: &mut Block, mut live: liveness::LiveSet) -> liveness::LiveSet {
    let mut dead: Vec<usize> = Vec::new();
    for (i, instr) in block.instrs.iter().enumerate().rev() {
        let Some(op) = instr.as_op() else { continue };
        if let Some(dest) = &op.dest {
            if !live.contains(dest) && !EFFECTFUL_OPS.contains(&op.op.as_str()) {
                // a deleted instruction generates no uses
                dead.push(i);
                continue;
            }
            live.remove(dest);
        }
        for arg in &op.args {
            live.insert(arg.clone());
        }
    }
    // indices were collected high-to-low
    for i in dead {
        debug!("removing dead instruction at {i}");
        block.instrs.remove(i);
    }
    live
}

pub fn dead_code_elimination(valid_program: Valid<Program>) -> Result<Valid<Program>, IrError> {
    let mut program = valid_program.0;
    for f in &mut program.functions {
        let mut cfg = Cfg::build(f, false)?;
        let mut solver = liveness::solve(&cfg);
        {
            let blocks = &mut cfg.blocks;
            solver.resweep(union_sets, |b, live, _| dce_block(&mut blocks[b], live));
        }
        f.instrs = cfg.flatten();
    }
    program.validate()
}

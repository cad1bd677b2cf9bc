//! Global constant propagation and folding.
//!
//! Forward over `name -> literal`; the join keeps an entry only when every
//! predecessor agrees on it.  The transfer folds block-locally with the same
//! rules lvn uses, rewriting foldable instructions to `const` in place.

use super::*;
use crate::commons::{IrError, Valid};
use crate::middle_end::bril::{Function, Literal, Program, Type, NON_FOLDABLE_OPS};
use crate::middle_end::cfg::Block;

pub type Env = Map<String, Literal>;

/// Fold one operator applied to literal operands.  `None` means the
/// operator does not fold (unknown op, type mismatch, division by zero).
pub fn fold_op(op: &str, args: &[Literal]) -> Option<Literal> {
    use Literal::*;

    let int = |i: usize| match args.get(i) {
        Some(Int(v)) => Some(*v),
        _ => None,
    };
    let boolean = |i: usize| match args.get(i) {
        Some(Bool(v)) => Some(*v),
        _ => None,
    };

    Some(match op {
        "id" => match args.first()? {
            v @ (Int(_) | Bool(_)) => v.clone(),
            _ => return None,
        },
        // two's-complement 64-bit arithmetic; div folds only when defined
        "add" => Int(int(0)?.wrapping_add(int(1)?)),
        "sub" => Int(int(0)?.wrapping_sub(int(1)?)),
        "mul" => Int(int(0)?.wrapping_mul(int(1)?)),
        "div" => Int(int(0)?.checked_div(int(1)?)?),
        "and" => Bool(boolean(0)? && boolean(1)?),
        "or" => Bool(boolean(0)? || boolean(1)?),
        "not" => Bool(!boolean(0)?),
        "eq" => Bool(int(0)? == int(1)?),
        "ne" => Bool(int(0)? != int(1)?),
        "le" => Bool(int(0)? <= int(1)?),
        "lt" => Bool(int(0)? < int(1)?),
        "ge" => Bool(int(0)? >= int(1)?),
        "gt" => Bool(int(0)? > int(1)?),
        _ => return None,
    })
}

/// `eq x x`, `le x x`, ... fold to their algebraic identity without knowing
/// `x`.
pub fn fold_same_operand(op: &str) -> Option<bool> {
    match op {
        "eq" | "le" | "ge" => Some(true),
        "lt" | "gt" | "ne" => Some(false),
        _ => None,
    }
}

fn is_float(op: &crate::middle_end::bril::Op) -> bool {
    op.typ.as_ref().map_or(false, Type::is_float) || matches!(op.value, Some(Literal::Float(_)))
}

/// The block transfer: fold what the inbound environment proves constant.
fn cpf_block(block: &mut Block, mut env: Env) -> Env {
    for instr in block.instrs.iter_mut() {
        let Some(op) = instr.as_op_mut() else { continue };
        let Some(dest) = op.dest.clone() else { continue };
        if is_float(op) || NON_FOLDABLE_OPS.contains(&op.op.as_str()) {
            env.remove(&dest);
            continue;
        }
        if op.args.is_empty() && op.value.is_none() {
            env.remove(&dest);
            continue;
        }

        let folded = if let Some(value) = &op.value {
            Some(value.clone())
        } else {
            let literals: Option<Vec<Literal>> =
                op.args.iter().map(|a| env.get(a).cloned()).collect();
            match literals {
                Some(literals) => fold_op(&op.op, &literals),
                None if op.args.len() == 2 && op.args[0] == op.args[1] => {
                    fold_same_operand(&op.op).map(Literal::Bool)
                }
                None => None,
            }
        };

        match folded {
            Some(value) => {
                op.op = "const".to_owned();
                op.args.clear();
                op.funcs.clear();
                op.value = Some(value.clone());
                env.insert(dest, value);
            }
            // the dest holds something this analysis cannot prove constant
            None => {
                env.remove(&dest);
            }
        }
    }
    env
}

/// Run the pass over one function, rewriting provably constant instructions.
/// Returns the constant facts agreed on by every exit block, which the taint
/// analysis consumes.
pub fn analyze(f: &mut Function) -> Result<Env, IrError> {
    let mut cfg = Cfg::build(f, false)?;
    let mut solver: Solver<Env> = Solver::new(&cfg, Direction::Forward);
    {
        let blocks = &mut cfg.blocks;
        solver.run(merge_maps_exact, |b, env, _| cpf_block(&mut blocks[b], env));
    }

    let exit_envs: Vec<Env> = cfg.exits().into_iter().map(|b| solver.out[b].clone()).collect();
    let facts = merge_maps_exact(&exit_envs);

    f.instrs = cfg.flatten();
    Ok(facts)
}

/// Constant facts of a function without touching it.
pub fn constant_facts(f: &Function) -> Result<Env, IrError> {
    let mut scratch = f.clone();
    analyze(&mut scratch)
}

/// The whole-program pass.
pub fn constant_propagation(valid_program: Valid<Program>) -> Result<Valid<Program>, IrError> {
    let mut program = valid_program.0;
    for f in &mut program.functions {
        analyze(f)?;
    }
    program.validate()
}

//! Basic-block partition and control-flow graph construction.

use std::collections::BTreeMap as Map;

use log::debug;

use super::bril::{Arg, Function, Instr, Op};
use crate::commons::IrError;

/// A basic block.  `instrs` always starts with the block's label
/// pseudo-instruction.  Edge lists hold dense block indices; predecessor
/// order is stable and is what aligns the per-edge slots of an analysis.
#[derive(Clone, Debug)]
pub struct Block {
    pub label: String,
    pub instrs: Vec<Instr>,
    pub preds: Vec<usize>,
    pub succs: Vec<usize>,
}

#[derive(Clone, Debug)]
pub struct Cfg {
    pub blocks: Vec<Block>,
}

impl Cfg {
    /// Partition `f`'s flat instruction list into blocks and link the edges.
    ///
    /// A synthetic `entry` label is prepended when the function does not
    /// start with one.  With `dummy` set and the function taking arguments,
    /// an extra `dummy_entry` block of `id a <- a` instructions is prepended
    /// so every argument has a textual definition (the ssa builder relies on
    /// this; everything else passes `dummy = false`).
    pub fn build(f: &Function, dummy: bool) -> Result<Cfg, IrError> {
        let mut instrs = f.instrs.clone();
        if instrs.first().map_or(true, |i| i.label().is_none()) {
            instrs.insert(
                0,
                Instr::Label {
                    label: "entry".to_owned(),
                },
            );
        }
        if dummy && !f.args.is_empty() {
            let mut prefix = vec![Instr::Label {
                label: "dummy_entry".to_owned(),
            }];
            for Arg { name, typ } in &f.args {
                prefix.push(Instr::Op(Op {
                    op: "id".to_owned(),
                    dest: Some(name.clone()),
                    typ: Some(typ.clone()),
                    args: vec![name.clone()],
                    ..Default::default()
                }));
            }
            instrs.splice(0..0, prefix);
        }

        let mut blocks: Vec<Block> = Vec::new();
        // the currently open block, if any
        let mut cur: Option<Block> = None;
        // label -> block index, for labels already seen
        let mut defined: Map<String, usize> = Map::new();
        // label -> indices of closed blocks waiting for that label to appear
        let mut pending: Map<String, Vec<usize>> = Map::new();

        for instr in instrs {
            match instr {
                Instr::Label { label } => {
                    // close the current block with a fallthrough edge
                    let mut fall_pred = None;
                    if let Some(mut open) = cur.take() {
                        fall_pred = Some(blocks.len());
                        open.succs.push(blocks.len() + 1);
                        blocks.push(open);
                    }
                    let idx = blocks.len();
                    if defined.insert(label.clone(), idx).is_some() {
                        return Err(IrError::malformed(
                            format!("function `{}`", f.name),
                            format!("duplicate label `{label}`"),
                        ));
                    }
                    let mut open = Block {
                        label: label.clone(),
                        instrs: vec![Instr::Label {
                            label: label.clone(),
                        }],
                        preds: Vec::new(),
                        succs: Vec::new(),
                    };
                    if let Some(p) = fall_pred {
                        open.preds.push(p);
                    }
                    for pred in pending.remove(&label).unwrap_or_default() {
                        open.preds.push(pred);
                        blocks[pred].succs.push(idx);
                    }
                    cur = Some(open);
                }
                Instr::Op(op) => {
                    let Some(mut open) = cur.take() else {
                        // unreachable code between a terminator and the next
                        // label; dropped together with the rest of its run
                        debug!("dropping unreachable instruction `{}`", op.op);
                        continue;
                    };
                    let terminator = op.is_terminator();
                    if op.op == "jmp" || op.op == "br" {
                        let idx = blocks.len();
                        for target in &op.labels {
                            match defined.get(target) {
                                Some(&t) if t == idx => {
                                    // self-loop
                                    open.succs.push(t);
                                    open.preds.push(t);
                                }
                                Some(&t) => {
                                    open.succs.push(t);
                                    blocks[t].preds.push(idx);
                                }
                                None => pending.entry(target.clone()).or_default().push(idx),
                            }
                        }
                    }
                    open.instrs.push(Instr::Op(op));
                    if terminator {
                        blocks.push(open);
                    } else {
                        cur = Some(open);
                    }
                }
            }
        }
        if let Some(open) = cur.take() {
            blocks.push(open);
        }

        // queued edges still unresolved point at labels that never appeared
        if let Some(label) = pending.into_keys().next() {
            return Err(IrError::UndefinedLabel {
                func: f.name.clone(),
                label,
            });
        }

        Ok(Cfg { blocks })
    }

    /// Write the blocks back into a flat instruction list.
    pub fn flatten(&self) -> Vec<Instr> {
        self.blocks
            .iter()
            .flat_map(|b| b.instrs.iter().cloned())
            .collect()
    }

    /// Indices of blocks without successors.
    pub fn exits(&self) -> Vec<usize> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.succs.is_empty())
            .map(|(i, _)| i)
            .collect()
    }
}

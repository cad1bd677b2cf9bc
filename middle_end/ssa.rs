//! Ssa construction and destruction.
//!
//! Construction renames every textual definition to `base.k`, inserts phis
//! on the iterated dominance frontier, completes their operands with a
//! forward rename pass, and finally degrades trivial phis.  Destruction
//! strips the `.k` suffixes and deletes the remaining phis.

use std::collections::VecDeque;
use std::collections::{BTreeMap as Map, BTreeSet as Set};

use log::debug;

use super::analysis::{dominators, merge_maps_loose, Direction, Solver};
use super::bril::{base_name, ssa_name, Function, Instr, Op, Program, Type};
use super::cfg::{Block, Cfg};
use crate::commons::{IrError, Valid};

// SECTION: construction

pub fn to_ssa(valid_program: Valid<Program>) -> Result<Valid<Program>, IrError> {
    let mut program = valid_program.0;
    for f in &mut program.functions {
        ssa_func(f)?;
    }
    program.validate()
}

fn ssa_func(f: &mut Function) -> Result<(), IrError> {
    debug!("ssa construction for function `{}`", f.name);
    let mut cfg = Cfg::build(f, true)?;

    let doms = dominators::dominators(&cfg);
    let frontier = dominators::dominance_frontier(&cfg, &doms);

    insert_phis(&mut cfg, &frontier);
    rename(&mut cfg);
    strip_dummy_entry(&mut cfg, f);

    f.instrs = cfg.flatten();
    Ok(())
}

/// The index of an existing phi for `var` in a block, if any.
fn find_phi(block: &Block, var: &str) -> Option<usize> {
    block.instrs.iter().position(|instr| {
        instr.as_op().map_or(false, |op| {
            op.op == "phi" && op.dest.as_deref().map(base_name) == Some(var)
        })
    })
}

/// Rename textual definitions and place phis on the iterated dominance
/// frontier of every variable's defining blocks.
fn insert_phis(cfg: &mut Cfg, frontier: &Map<usize, Vec<usize>>) {
    // var -> { (defining block, dest type) }
    let mut def_sites: Map<String, Set<(usize, Type)>> = Map::new();
    for (b, block) in cfg.blocks.iter().enumerate() {
        for instr in &block.instrs {
            let Some(op) = instr.as_op() else { continue };
            if let (Some(dest), Some(typ)) = (&op.dest, &op.typ) {
                def_sites
                    .entry(dest.clone())
                    .or_default()
                    .insert((b, typ.clone()));
            }
        }
    }

    for (var, sites) in &def_sites {
        let mut version = 0u32;
        let mut worklist: VecDeque<(usize, Type)> = sites.iter().cloned().collect();
        while let Some((def_block, typ)) = worklist.pop_front() {
            // fresh name for every remaining textual definition here
            for instr in &mut cfg.blocks[def_block].instrs {
                let Some(op) = instr.as_op_mut() else { continue };
                if op.dest.as_deref() == Some(var) {
                    version += 1;
                    op.dest = Some(ssa_name(var, version));
                }
            }
            let Some(joins) = frontier.get(&def_block) else {
                continue;
            };
            for &join in joins {
                if find_phi(&cfg.blocks[join], var).is_some() {
                    continue;
                }
                version += 1;
                debug!("phi for `{var}` in block {join}");
                let phi = Op {
                    op: "phi".to_owned(),
                    dest: Some(ssa_name(var, version)),
                    typ: Some(typ.clone()),
                    ..Default::default()
                };
                // right after the block's label
                cfg.blocks[join].instrs.insert(1, Instr::Op(phi));
                worklist.push_back((join, typ.clone()));
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Phase {
    /// Rename uses and collect phi operands as predecessors become known.
    Build,
    /// Re-resolve phi operands and degrade trivial phis.
    Cleanup,
}

/// Run the rename fixed point, then the cleanup fixed point, on the same
/// solver state.  The per-block fact is `base -> latest ssa name`.
fn rename(cfg: &mut Cfg) {
    let labels: Vec<String> = cfg.blocks.iter().map(|b| b.label.clone()).collect();
    let preds: Vec<Vec<usize>> = cfg.blocks.iter().map(|b| b.preds.clone()).collect();

    let mut solver: Solver<Map<String, String>> = Solver::new(cfg, Direction::Forward);
    let blocks = &mut cfg.blocks;

    solver.run(merge_maps_loose, |b, env, slots| {
        rename_block(&mut blocks[b], &preds[b], &labels, env, slots, Phase::Build)
    });
    solver.resweep(merge_maps_loose, |b, env, slots| {
        rename_block(&mut blocks[b], &preds[b], &labels, env, slots, Phase::Cleanup)
    });
}

fn rename_block(
    block: &mut Block,
    preds: &[usize],
    labels: &[String],
    mut env: Map<String, String>,
    slots: &[Map<String, String>],
    phase: Phase,
) -> Map<String, String> {
    let mut dead_phis: Vec<usize> = Vec::new();

    for (i, instr) in block.instrs.iter_mut().enumerate() {
        let Some(op) = instr.as_op_mut() else { continue };

        if op.op == "phi" {
            let Some(dest) = op.dest.clone() else { continue };
            let base = base_name(&dest).to_owned();
            match phase {
                Phase::Build => {
                    // append one (name, label) pair per predecessor whose
                    // state already defines the base
                    for (pred_idx, &pred) in preds.iter().enumerate() {
                        let pred_label = &labels[pred];
                        if op.labels.iter().any(|l| l == pred_label) {
                            continue;
                        }
                        let Some(name) = slots.get(pred_idx).and_then(|s| s.get(&base)) else {
                            continue;
                        };
                        op.args.push(name.clone());
                        op.labels.push(pred_label.clone());
                    }
                }
                Phase::Cleanup => {
                    // re-resolve operands; trim those whose predecessor no
                    // longer defines the variable
                    let mut idx = 0;
                    while idx < op.labels.len() {
                        let pred_idx = preds
                            .iter()
                            .position(|&p| labels[p] == op.labels[idx]);
                        let resolved = pred_idx
                            .and_then(|pi| slots.get(pi))
                            .and_then(|s| s.get(&base))
                            .cloned();
                        match resolved {
                            Some(name) => {
                                op.args[idx] = name;
                                idx += 1;
                            }
                            None => {
                                op.args.remove(idx);
                                op.labels.remove(idx);
                            }
                        }
                    }
                    // a phi of one value, or of itself and one value, is an id
                    if op.args.len() == 1 {
                        op.dest = Some(op.args[0].clone());
                        dead_phis.push(i);
                    } else if op.args.len() == 2 && op.args.contains(&dest) {
                        let keep = if op.args[0] == dest {
                            op.args[1].clone()
                        } else {
                            op.args[0].clone()
                        };
                        op.dest = Some(keep);
                        dead_phis.push(i);
                    }
                }
            }
        } else {
            for arg in op.args.iter_mut() {
                let key = match phase {
                    Phase::Build => arg.clone(),
                    Phase::Cleanup => base_name(arg).to_owned(),
                };
                if let Some(name) = env.get(&key) {
                    *arg = name.clone();
                }
            }
        }

        // the definition (for a degraded phi, the surviving value) becomes
        // the latest name for its base
        if let Some(dest) = &op.dest {
            env.insert(base_name(dest).to_owned(), dest.clone());
        }
    }

    for i in dead_phis.into_iter().rev() {
        block.instrs.remove(i);
    }
    env
}

/// Rewrite argument names to the ssa names their virtual `id`s produced and
/// drop the synthetic block.
fn strip_dummy_entry(cfg: &mut Cfg, f: &mut Function) {
    if cfg.blocks.first().map(|b| b.label.as_str()) != Some("dummy_entry") {
        return;
    }
    let mut renamed: Map<String, String> = Map::new();
    for instr in &cfg.blocks[0].instrs {
        let Some(op) = instr.as_op() else { continue };
        if let (Some(orig), Some(dest)) = (op.args.first(), &op.dest) {
            renamed.insert(orig.clone(), dest.clone());
        }
    }
    for arg in &mut f.args {
        if let Some(new) = renamed.get(&arg.name) {
            arg.name = new.clone();
        }
    }
    cfg.blocks[0].instrs.clear();
}

// SECTION: destruction

pub fn from_ssa(valid_program: Valid<Program>) -> Result<Valid<Program>, IrError> {
    let mut program = valid_program.0;
    for f in &mut program.functions {
        from_ssa_func(f)?;
    }
    program.validate()
}

fn from_ssa_func(f: &mut Function) -> Result<(), IrError> {
    // conventional-ssa precondition: a phi never mixes base names
    for instr in &f.instrs {
        let Some(op) = instr.as_op() else { continue };
        if op.op != "phi" {
            continue;
        }
        let Some(dest) = &op.dest else { continue };
        let base = base_name(dest);
        if op.args.iter().any(|a| base_name(a) != base) {
            return Err(IrError::NonConventionalSsa {
                func: f.name.clone(),
                reason: format!("phi for `{base}` has sources with other bases"),
            });
        }
    }

    for arg in &mut f.args {
        arg.name = base_name(&arg.name).to_owned();
    }
    f.instrs
        .retain(|i| i.as_op().map_or(true, |op| op.op != "phi"));
    for instr in &mut f.instrs {
        let Some(op) = instr.as_op_mut() else { continue };
        if let Some(dest) = &op.dest {
            op.dest = Some(base_name(dest).to_owned());
        }
        for arg in op.args.iter_mut() {
            *arg = base_name(arg).to_owned();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn parse(s: &str) -> Valid<Program> {
        serde_json::from_str::<Program>(s).unwrap().validate().unwrap()
    }

    // the diamond of scenario S4: x is 1 on one branch, 2 on the other
    const DIAMOND: &str = r#"{"functions":[{"name":"f","instrs":[
        {"op":"const","dest":"c","type":"bool","value":true},
        {"op":"br","args":["c"],"labels":["t","e"]},
        {"label":"t"},
        {"op":"const","dest":"x","type":"int","value":1},
        {"op":"jmp","labels":["j"]},
        {"label":"e"},
        {"op":"const","dest":"x","type":"int","value":2},
        {"op":"jmp","labels":["j"]},
        {"label":"j"},
        {"op":"ret","args":["x"]}
    ]}]}"#;

    fn defs(f: &Function) -> Vec<String> {
        f.instrs
            .iter()
            .filter_map(|i| i.as_op())
            .filter_map(|op| op.dest.clone())
            .collect()
    }

    #[test]
    fn diamond_gets_one_phi_at_the_join() {
        let out = to_ssa(parse(DIAMOND)).unwrap().0;
        let f = &out.functions[0];

        let phis: Vec<&Op> = f
            .instrs
            .iter()
            .filter_map(|i| i.as_op())
            .filter(|op| op.op == "phi")
            .collect();
        assert_eq!(phis.len(), 1);

        let phi = phis[0];
        assert_eq!(base_name(phi.dest.as_deref().unwrap()), "x");
        assert_eq!(phi.args.len(), 2);
        assert_eq!(phi.labels.len(), 2);
        let mut labels = phi.labels.clone();
        labels.sort();
        assert_eq!(labels, vec!["e", "t"]);
        // the phi picks up both renamed definitions
        let mut bases: Vec<&str> = phi.args.iter().map(|a| base_name(a)).collect();
        bases.dedup();
        assert_eq!(bases, vec!["x"]);
        assert_ne!(phi.args[0], phi.args[1]);

        // the ret uses the phi's dest
        let ret = f
            .instrs
            .iter()
            .filter_map(|i| i.as_op())
            .find(|op| op.op == "ret")
            .unwrap();
        assert_eq!(ret.args, vec![phi.dest.clone().unwrap()]);
    }

    #[test]
    fn every_name_is_defined_once() {
        let out = to_ssa(parse(DIAMOND)).unwrap().0;
        let defs = defs(&out.functions[0]);
        let unique: Set<&String> = defs.iter().collect();
        assert_eq!(unique.len(), defs.len());
    }

    #[test]
    fn phis_sit_right_after_their_label() {
        let out = to_ssa(parse(DIAMOND)).unwrap().0;
        let f = &out.functions[0];
        let phi_at = f
            .instrs
            .iter()
            .position(|i| i.as_op().map_or(false, |op| op.op == "phi"))
            .unwrap();
        assert_eq!(f.instrs[phi_at - 1].label(), Some("j"));
    }

    #[test]
    fn straightline_code_needs_no_phi() {
        let out = to_ssa(parse(
            r#"{"functions":[{"name":"f","instrs":[
                {"op":"const","dest":"x","type":"int","value":1},
                {"op":"add","dest":"x","type":"int","args":["x","x"]},
                {"op":"ret","args":["x"]}
            ]}]}"#,
        ))
        .unwrap()
        .0;
        let f = &out.functions[0];

        assert!(!f.instrs.iter().any(|i| i.as_op().map_or(false, |op| op.op == "phi")));
        let defs = defs(f);
        assert_eq!(defs, vec!["x.1", "x.2"]);
        // the add reads the first version, the ret the second
        let add = f.instrs.iter().filter_map(|i| i.as_op()).find(|op| op.op == "add").unwrap();
        assert_eq!(add.args, vec!["x.1", "x.1"]);
        let ret = f.instrs.iter().filter_map(|i| i.as_op()).find(|op| op.op == "ret").unwrap();
        assert_eq!(ret.args, vec!["x.2"]);
    }

    #[test]
    fn arguments_are_renamed_through_the_dummy_block() {
        let out = to_ssa(parse(
            r#"{"functions":[{"name":"f","args":[{"name":"a","type":"int"}],"instrs":[
                {"op":"add","dest":"b","type":"int","args":["a","a"]},
                {"op":"ret","args":["b"]}
            ]}]}"#,
        ))
        .unwrap()
        .0;
        let f = &out.functions[0];

        // the argument now carries its ssa name and the synthetic block is gone
        assert_eq!(f.args[0].name, "a.1");
        assert!(!f.instrs.iter().any(|i| i.label() == Some("dummy_entry")));
        let add = f.instrs.iter().filter_map(|i| i.as_op()).find(|op| op.op == "add").unwrap();
        assert_eq!(add.args, vec!["a.1", "a.1"]);
    }

    #[test]
    fn destruction_restores_base_names() {
        let ssa = to_ssa(parse(DIAMOND)).unwrap();
        let out = from_ssa(ssa).unwrap().0;
        let f = &out.functions[0];

        assert!(!f.instrs.iter().any(|i| i.as_op().map_or(false, |op| op.op == "phi")));
        for op in f.instrs.iter().filter_map(|i| i.as_op()) {
            if let Some(dest) = &op.dest {
                assert!(!dest.contains('.'));
            }
            for arg in &op.args {
                assert!(!arg.contains('.'));
            }
        }
    }

    #[test]
    fn destruction_rejects_mixed_phis() {
        let mixed = parse(
            r#"{"functions":[{"name":"f","instrs":[
                {"label":"entry"},
                {"op":"phi","dest":"x.1","type":"int","args":["y.1"],"labels":["entry"]},
                {"op":"ret"}
            ]}]}"#,
        );
        assert!(matches!(
            from_ssa(mixed),
            Err(IrError::NonConventionalSsa { .. })
        ));
    }

    #[test]
    fn definitions_dominate_uses() {
        let out = to_ssa(parse(
            r#"{"functions":[{"name":"f","instrs":[
                {"op":"const","dest":"i","type":"int","value":0},
                {"op":"const","dest":"n","type":"int","value":10},
                {"label":"head"},
                {"op":"lt","dest":"c","type":"bool","args":["i","n"]},
                {"op":"br","args":["c"],"labels":["body","done"]},
                {"label":"body"},
                {"op":"const","dest":"one","type":"int","value":1},
                {"op":"add","dest":"i","type":"int","args":["i","one"]},
                {"op":"jmp","labels":["head"]},
                {"label":"done"},
                {"op":"ret","args":["i"]}
            ]}]}"#,
        ))
        .unwrap()
        .0;
        let f = &out.functions[0];

        let cfg = Cfg::build(f, false).unwrap();
        let doms = dominators::dominators(&cfg);
        let mut def_block: Map<String, usize> = Map::new();
        for (b, block) in cfg.blocks.iter().enumerate() {
            for op in block.instrs.iter().filter_map(|i| i.as_op()) {
                if let Some(dest) = &op.dest {
                    def_block.insert(dest.clone(), b);
                }
            }
        }
        for (b, block) in cfg.blocks.iter().enumerate() {
            for op in block.instrs.iter().filter_map(|i| i.as_op()) {
                if op.op == "phi" {
                    continue;
                }
                for arg in &op.args {
                    let d = def_block[arg];
                    assert!(
                        doms[b].contains(&d),
                        "definition of `{arg}` does not dominate its use in block {b}"
                    );
                }
            }
        }
    }

    #[test]
    fn loop_variable_gets_a_header_phi() {
        let out = to_ssa(parse(
            r#"{"functions":[{"name":"f","instrs":[
                {"op":"const","dest":"i","type":"int","value":0},
                {"op":"const","dest":"n","type":"int","value":10},
                {"label":"head"},
                {"op":"lt","dest":"c","type":"bool","args":["i","n"]},
                {"op":"br","args":["c"],"labels":["body","done"]},
                {"label":"body"},
                {"op":"const","dest":"one","type":"int","value":1},
                {"op":"add","dest":"i","type":"int","args":["i","one"]},
                {"op":"jmp","labels":["head"]},
                {"label":"done"},
                {"op":"ret","args":["i"]}
            ]}]}"#,
        ))
        .unwrap()
        .0;
        let f = &out.functions[0];

        let phi = f
            .instrs
            .iter()
            .filter_map(|i| i.as_op())
            .find(|op| op.op == "phi" && base_name(op.dest.as_deref().unwrap()) == "i")
            .expect("loop header phi for i");
        assert_eq!(phi.args.len(), 2);
        assert_eq!(phi.args.len(), phi.labels.len());
        // the comparison reads the phi's merged value
        let lt = f
            .instrs
            .iter()
            .filter_map(|i| i.as_op())
            .find(|op| op.op == "lt")
            .unwrap();
        assert_eq!(lt.args[0], phi.dest.clone().unwrap());
    }
}

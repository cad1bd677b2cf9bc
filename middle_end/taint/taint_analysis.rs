//! Interprocedural taint analysis with function specialization.
//!
//! Every function is analyzed once per distinct vector of argument taints;
//! each such specialization is a copy of the template with the vector baked
//! into its argument types.  Recursion is broken by seeding the in-flight
//! specialization's return taint as `private` and relaxing it once the body
//! has been analyzed.

use std::collections::BTreeMap as Map;

use log::debug;

use crate::commons::{IrError, Valid};
use crate::middle_end::analysis::{constant_prop, Direction, Solver};
use crate::middle_end::bril::{Function, Program, Taint, Type};
use crate::middle_end::cfg::{Block, Cfg};

type Env = Map<String, Taint>;

/// The taint join: a key survives when any predecessor assigns it, and
/// `private` wins a disagreement.
fn taint_join(slots: &[Env]) -> Env {
    let mut joined = Env::new();
    for slot in slots {
        for (name, &taint) in slot {
            joined
                .entry(name.clone())
                .and_modify(|t| {
                    if taint == Taint::Private {
                        *t = Taint::Private;
                    }
                })
                .or_insert(taint);
        }
    }
    joined
}

/// One analyzed copy of a function, keyed by its argument-taint vector.
struct Spec {
    func: Function,
    ret: Taint,
    /// already emitted into the output program
    added: bool,
    /// `ret` reflects a finished analysis rather than the recursion seed
    ready: bool,
}

struct FuncEntry {
    template: Function,
    specs: Vec<Spec>,
}

/// All the state of one whole-program run.  The call stack lives here, so
/// independent programs can be analyzed back to back.
struct TaintAnalysis {
    funcs: Map<String, FuncEntry>,
    call_stack: Vec<String>,
    emitted: Vec<Function>,
}

fn spec_vector(f: &Function) -> Vec<Taint> {
    f.args
        .iter()
        .map(|a| a.typ.taint().unwrap_or(Taint::Public))
        .collect()
}

fn set_arg_taints(f: &mut Function, vector: &[Taint]) {
    for (arg, &taint) in f.args.iter_mut().zip(vector) {
        arg.typ = arg.typ.clone().with_taint(taint);
    }
}

pub fn analyze(valid_program: Valid<Program>) -> Result<Valid<Program>, IrError> {
    let program = valid_program.0;

    let mut main: Option<Function> = None;
    let mut funcs: Map<String, FuncEntry> = Map::new();
    for f in program.functions {
        if f.name == "main" {
            main = Some(f);
        } else {
            funcs.insert(
                f.name.clone(),
                FuncEntry {
                    template: f,
                    specs: Vec::new(),
                },
            );
        }
    }
    let mut main = main.ok_or_else(|| IrError::malformed("functions", "no `main` function"))?;

    // arguments of main are private unless annotated otherwise
    for arg in &mut main.args {
        if arg.typ.taint().is_none() {
            arg.typ = arg.typ.clone().with_taint(Taint::Private);
        }
    }

    let mut analysis = TaintAnalysis {
        funcs,
        call_stack: vec!["main".to_owned()],
        emitted: Vec::new(),
    };
    let ret = analysis.taint_func(&mut main)?;
    analysis.call_stack.pop();

    if let Some(typ) = main.ret_type.take() {
        main.ret_type = Some(typ.with_taint(ret));
    }

    let mut functions = vec![main];
    functions.extend(analysis.emitted);
    Program { functions }.validate()
}

impl TaintAnalysis {
    /// Analyze one function (in place) to a fixed point, annotate it, and
    /// return its return taint.
    fn taint_func(&mut self, f: &mut Function) -> Result<Taint, IrError> {
        debug!("taint analysis of `{}`", f.name);
        let facts = constant_prop::constant_facts(f)?;
        let mut cfg = Cfg::build(f, false)?;

        let mut solver: Solver<Env> = Solver::new(&cfg, Direction::Forward);
        if !f.args.is_empty() {
            let seed: Env = f
                .args
                .iter()
                .map(|a| (a.name.clone(), a.typ.taint().unwrap_or(Taint::Private)))
                .collect();
            solver.seed(0, seed);
        }

        let mut failure: Option<IrError> = None;
        {
            let blocks = &mut cfg.blocks;
            solver.run(taint_join, |b, env, _| {
                match self.taint_block(&mut blocks[b], env.clone(), &facts) {
                    Ok(out) => out,
                    Err(e) => {
                        if failure.is_none() {
                            failure = Some(e);
                        }
                        env
                    }
                }
            });
        }
        if let Some(e) = failure {
            return Err(e);
        }

        // the function returns private iff some ret sees a private value
        let exit_envs: Vec<Env> = cfg.exits().into_iter().map(|b| solver.out[b].clone()).collect();
        let exit_env = taint_join(&exit_envs);
        let mut ret = Taint::Public;
        for (b, block) in cfg.blocks.iter().enumerate() {
            for instr in &block.instrs {
                let Some(op) = instr.as_op() else { continue };
                if op.op == "ret" {
                    if let Some(x) = op.args.first() {
                        if solver.out[b].get(x).copied().unwrap_or(Taint::Private) == Taint::Private
                        {
                            ret = Taint::Private;
                        }
                    }
                }
            }
        }

        self.materialize(&mut cfg, &solver, &exit_env, &facts)?;
        f.instrs = cfg.flatten();
        Ok(ret)
    }

    fn arg_taint(&self, name: &str, env: &Env, facts: &constant_prop::Env) -> Taint {
        if facts.contains_key(name) {
            // constants cannot leak secrets
            return Taint::Public;
        }
        env.get(name).copied().unwrap_or(Taint::Private)
    }

    fn taint_block(
        &mut self,
        block: &mut Block,
        mut env: Env,
        facts: &constant_prop::Env,
    ) -> Result<Env, IrError> {
        for instr in block.instrs.iter_mut() {
            let Some(op) = instr.as_op_mut() else { continue };
            let annotated = op.typ.as_ref().and_then(Type::taint);

            match op.op.as_str() {
                "call" => {
                    let callee = op.funcs[0].clone();
                    let vector: Vec<Taint> = op
                        .args
                        .iter()
                        .map(|a| self.arg_taint(a, &env, facts))
                        .collect();
                    let ret = self.resolve_spec(&callee, &vector)?;
                    if let Some(dest) = &op.dest {
                        env.insert(dest.clone(), annotated.unwrap_or(ret));
                    }
                }
                "load" => {
                    // memory is untracked, so anything loaded may be secret
                    if let Some(dest) = &op.dest {
                        env.insert(dest.clone(), annotated.unwrap_or(Taint::Private));
                    }
                }
                _ => {
                    let Some(dest) = &op.dest else { continue };
                    let taint = if let Some(t) = annotated {
                        t
                    } else if facts.contains_key(dest) {
                        // provably constant, whatever its inputs were
                        Taint::Public
                    } else if op.op == "const" || op.op == "nop" {
                        Taint::Public
                    } else if op.args.is_empty() {
                        Taint::Private
                    } else if op
                        .args
                        .iter()
                        .any(|a| self.arg_taint(a, &env, facts) == Taint::Private)
                    {
                        Taint::Private
                    } else {
                        Taint::Public
                    };
                    env.insert(dest.clone(), taint);
                }
            }
        }
        Ok(env)
    }

    /// Find or create the specialization of `callee` for `vector` and return
    /// its return taint.
    fn resolve_spec(&mut self, callee: &str, vector: &[Taint]) -> Result<Taint, IrError> {
        let entry = self
            .funcs
            .get(callee)
            .ok_or_else(|| IrError::UndefinedFunction {
                func: callee.to_owned(),
            })?;
        if entry.template.args.len() != vector.len() {
            return Err(IrError::malformed(
                format!("call to `{callee}`"),
                format!(
                    "expects {} arguments, got {}",
                    entry.template.args.len(),
                    vector.len()
                ),
            ));
        }
        if let Some(spec) = entry.specs.iter().find(|s| spec_vector(&s.func) == vector) {
            return Ok(spec.ret);
        }

        let mut spec_fn = entry.template.clone();
        set_arg_taints(&mut spec_fn, vector);

        if self.call_stack.iter().any(|n| n == callee) {
            // recursion: seed private, analyze, relax
            debug!("recursive call to `{callee}`, seeding private");
            if let Some(entry) = self.funcs.get_mut(callee) {
                entry.specs.push(Spec {
                    func: spec_fn.clone(),
                    ret: Taint::Private,
                    added: false,
                    ready: false,
                });
            }
            let ret = self.taint_func(&mut spec_fn)?;
            if let Some(entry) = self.funcs.get_mut(callee) {
                if let Some(spec) = entry.specs.iter_mut().find(|s| spec_vector(&s.func) == vector)
                {
                    spec.func = spec_fn;
                    spec.ret = ret;
                    spec.ready = true;
                }
            }
            Ok(ret)
        } else {
            self.call_stack.push(callee.to_owned());
            let ret = self.taint_func(&mut spec_fn)?;
            self.call_stack.pop();

            if let Some(entry) = self.funcs.get_mut(callee) {
                match entry.specs.iter_mut().find(|s| spec_vector(&s.func) == vector) {
                    // a recursive child already recorded this vector;
                    // overwrite its seed with the finished analysis
                    Some(spec) => {
                        spec.func = spec_fn;
                        spec.ret = ret;
                        spec.ready = true;
                    }
                    None => entry.specs.push(Spec {
                        func: spec_fn,
                        ret,
                        added: false,
                        ready: true,
                    }),
                }
            }
            Ok(ret)
        }
    }

    /// Rewrite calls to their specialized names, emit newly referenced
    /// specializations, and annotate every destination's type.
    fn materialize(
        &mut self,
        cfg: &mut Cfg,
        solver: &Solver<Env>,
        exit_env: &Env,
        facts: &constant_prop::Env,
    ) -> Result<(), IrError> {
        for (b, block) in cfg.blocks.iter_mut().enumerate() {
            let out_env = &solver.out[b];
            for instr in block.instrs.iter_mut() {
                let Some(op) = instr.as_op_mut() else { continue };
                match op.op.as_str() {
                    "ret" => {}
                    "call" => {
                        let callee = op.funcs[0].clone();
                        let vector: Vec<Taint> = op
                            .args
                            .iter()
                            .map(|a| self.arg_taint(a, exit_env, facts))
                            .collect();
                        let (idx, ret) = self.emit_spec(&callee, &vector)?;
                        op.funcs[0] = format!("{callee}_{idx}");
                        if op.dest.is_some() {
                            if let Some(typ) = op.typ.take() {
                                op.typ = Some(typ.with_taint(ret));
                            }
                        }
                    }
                    _ => {
                        if let Some(dest) = &op.dest {
                            let taint = out_env.get(dest).copied().unwrap_or(Taint::Private);
                            if let Some(typ) = op.typ.take() {
                                op.typ = Some(typ.with_taint(taint));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Emit the specialization for `(callee, vector)` into the output if it
    /// has not been emitted yet, and return its index and return taint.
    fn emit_spec(&mut self, callee: &str, vector: &[Taint]) -> Result<(usize, Taint), IrError> {
        let missing = self.funcs.get(callee).map_or(true, |e| {
            !e.specs.iter().any(|s| spec_vector(&s.func) == vector)
        });
        if missing {
            // the environments converged after this call was first analyzed;
            // resolve the remaining vector now
            self.resolve_spec(callee, vector)?;
        }

        let entry = self
            .funcs
            .get_mut(callee)
            .ok_or_else(|| IrError::UndefinedFunction {
                func: callee.to_owned(),
            })?;
        let idx = entry
            .specs
            .iter()
            .position(|s| spec_vector(&s.func) == vector)
            .ok_or_else(|| {
                IrError::malformed(format!("call to `{callee}`"), "unresolved specialization")
            })?;

        let spec = &mut entry.specs[idx];
        let ret = spec.ret;
        if !spec.added && spec.ready {
            spec.added = true;
            let mut out = spec.func.clone();
            out.name = format!("{callee}_{idx}");
            if let Some(typ) = out.ret_type.take() {
                out.ret_type = Some(typ.with_taint(ret));
            }
            debug!("emitting specialization `{}`", out.name);
            self.emitted.push(out);
        }
        Ok((idx, ret))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::middle_end::bril::Op;

    fn parse(s: &str) -> Valid<Program> {
        serde_json::from_str::<Program>(s)
            .unwrap()
            .validate()
            .unwrap()
    }

    fn func<'p>(p: &'p Program, name: &str) -> &'p Function {
        p.functions.iter().find(|f| f.name == name).unwrap()
    }

    fn op_named<'f>(f: &'f Function, dest: &str) -> &'f Op {
        f.instrs
            .iter()
            .filter_map(|i| i.as_op())
            .find(|op| op.dest.as_deref() == Some(dest))
            .unwrap()
    }

    #[test]
    fn private_argument_taints_the_return() {
        let out = analyze(parse(
            r#"{"functions":[{"name":"main","type":"int",
                "args":[{"name":"s","type":{"prim":"int","taint":"private"}}],
                "instrs":[
                    {"op":"id","dest":"t","type":"int","args":["s"]},
                    {"op":"ret","args":["t"]}
            ]}]}"#,
        ))
        .unwrap()
        .0;

        let main = func(&out, "main");
        assert_eq!(op_named(main, "t").typ.as_ref().unwrap().taint(), Some(Taint::Private));
        assert_eq!(main.ret_type.as_ref().unwrap().taint(), Some(Taint::Private));
    }

    #[test]
    fn main_arguments_default_to_private() {
        let out = analyze(parse(
            r#"{"functions":[{"name":"main",
                "args":[{"name":"s","type":"int"}],
                "instrs":[
                    {"op":"id","dest":"t","type":"int","args":["s"]},
                    {"op":"ret","args":["t"]}
            ]}]}"#,
        ))
        .unwrap()
        .0;

        let main = func(&out, "main");
        assert_eq!(main.args[0].typ.taint(), Some(Taint::Private));
        assert_eq!(op_named(main, "t").typ.as_ref().unwrap().taint(), Some(Taint::Private));
    }

    #[test]
    fn constants_stay_public() {
        let out = analyze(parse(
            r#"{"functions":[{"name":"main",
                "args":[{"name":"s","type":{"prim":"int","taint":"private"}}],
                "instrs":[
                    {"op":"const","dest":"a","type":"int","value":1},
                    {"op":"add","dest":"b","type":"int","args":["a","a"]},
                    {"op":"ret","args":["b"]}
            ]}]}"#,
        ))
        .unwrap()
        .0;

        let main = func(&out, "main");
        assert_eq!(op_named(main, "a").typ.as_ref().unwrap().taint(), Some(Taint::Public));
        assert_eq!(op_named(main, "b").typ.as_ref().unwrap().taint(), Some(Taint::Public));
    }

    #[test]
    fn loads_are_conservatively_private() {
        let out = analyze(parse(
            r#"{"functions":[{"name":"main","instrs":[
                {"op":"const","dest":"n","type":"int","value":1},
                {"op":"alloc","dest":"p","type":{"ptr":"int"},"args":["n"]},
                {"op":"load","dest":"x","type":"int","args":["p"]},
                {"op":"ret","args":["x"]}
            ]}]}"#,
        ))
        .unwrap()
        .0;

        let main = func(&out, "main");
        assert_eq!(op_named(main, "x").typ.as_ref().unwrap().taint(), Some(Taint::Private));
    }

    #[test]
    fn distinct_taint_vectors_get_distinct_specializations() {
        let out = analyze(parse(
            r#"{"functions":[
                {"name":"main",
                 "args":[{"name":"s","type":{"prim":"int","taint":"private"}}],
                 "instrs":[
                    {"op":"const","dest":"k","type":"int","value":3},
                    {"op":"call","dest":"a","type":"int","funcs":["id_fn"],"args":["s"]},
                    {"op":"call","dest":"b","type":"int","funcs":["id_fn"],"args":["k"]},
                    {"op":"ret","args":["b"]}
                 ]},
                {"name":"id_fn",
                 "args":[{"name":"x","type":"int"}],
                 "type":"int",
                 "instrs":[
                    {"op":"id","dest":"y","type":"int","args":["x"]},
                    {"op":"ret","args":["y"]}
                 ]}
            ]}"#,
        ))
        .unwrap()
        .0;

        // two specializations, each emitted exactly once
        let names: Vec<&str> = out.functions.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names.len(), 3);
        assert!(names.contains(&"id_fn_0"));
        assert!(names.contains(&"id_fn_1"));

        // calls reference existing specializations
        let main = func(&out, "main");
        for op in main.instrs.iter().filter_map(|i| i.as_op()) {
            if op.op == "call" {
                assert!(names.contains(&op.funcs[0].as_str()));
            }
        }

        // the private-argument copy returns private, the public one public
        let a = op_named(main, "a");
        assert_eq!(a.typ.as_ref().unwrap().taint(), Some(Taint::Private));
        let b = op_named(main, "b");
        assert_eq!(b.typ.as_ref().unwrap().taint(), Some(Taint::Public));
    }

    #[test]
    fn recursion_terminates_and_stays_conservative() {
        let out = analyze(parse(
            r#"{"functions":[
                {"name":"main",
                 "args":[{"name":"s","type":{"prim":"int","taint":"private"}}],
                 "instrs":[
                    {"op":"call","dest":"r","type":"int","funcs":["loop_fn"],"args":["s"]},
                    {"op":"ret","args":["r"]}
                 ]},
                {"name":"loop_fn",
                 "args":[{"name":"x","type":"int"}],
                 "type":"int",
                 "instrs":[
                    {"op":"call","dest":"y","type":"int","funcs":["loop_fn"],"args":["x"]},
                    {"op":"ret","args":["y"]}
                 ]}
            ]}"#,
        ))
        .unwrap()
        .0;

        let main = func(&out, "main");
        let r = op_named(main, "r");
        assert_eq!(r.typ.as_ref().unwrap().taint(), Some(Taint::Private));
        // exactly one specialization of the recursive function is emitted
        let copies = out
            .functions
            .iter()
            .filter(|f| f.name.starts_with("loop_fn"))
            .count();
        assert_eq!(copies, 1);
    }

    #[test]
    fn private_dominates_at_joins() {
        let out = analyze(parse(
            r#"{"functions":[{"name":"main",
                "args":[{"name":"s","type":{"prim":"int","taint":"private"}}],
                "instrs":[
                {"op":"const","dest":"c","type":"bool","value":true},
                {"op":"br","args":["c"],"labels":["t","e"]},
                {"label":"t"},
                {"op":"id","dest":"x","type":"int","args":["s"]},
                {"op":"jmp","labels":["j"]},
                {"label":"e"},
                {"op":"const","dest":"x","type":"int","value":1},
                {"op":"jmp","labels":["j"]},
                {"label":"j"},
                {"op":"id","dest":"y","type":"int","args":["x"]},
                {"op":"ret","args":["y"]}
            ]}]}"#,
        ))
        .unwrap()
        .0;

        // x is private on one inbound edge, so the merged use is private
        let main = func(&out, "main");
        assert_eq!(op_named(main, "y").typ.as_ref().unwrap().taint(), Some(Taint::Private));
    }

    #[test]
    fn unknown_callee_is_fatal() {
        let result = analyze(parse(
            r#"{"functions":[{"name":"main","instrs":[
                {"op":"call","funcs":["ghost"]},
                {"op":"ret"}
            ]}]}"#,
        ));
        assert!(matches!(result, Err(IrError::UndefinedFunction { .. })));
    }

    #[test]
    fn explicit_annotations_are_honored() {
        let out = analyze(parse(
            r#"{"functions":[{"name":"main",
                "args":[{"name":"s","type":"int"}],
                "instrs":[
                {"op":"id","dest":"a","type":{"prim":"int","taint":"public"},"args":["s"]},
                {"op":"id","dest":"b","type":"int","args":["a"]},
                {"op":"ret","args":["b"]}
            ]}]}"#,
        ))
        .unwrap()
        .0;

        // `a` copies the private argument but is declassified by its
        // annotation, and `b` inherits the declassified label
        let main = func(&out, "main");
        assert_eq!(op_named(main, "a").typ.as_ref().unwrap().taint(), Some(Taint::Public));
        assert_eq!(op_named(main, "b").typ.as_ref().unwrap().taint(), Some(Taint::Public));
    }
}

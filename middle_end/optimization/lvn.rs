//! Local value numbering with constant folding.
//!
//! Per block, four tables tie destinations, value keys and numbering
//! classes together.  Uses of a known constant class are substituted as
//! literals, so folding happens transparently through `id` chains;
//! commutative operators canonicalize by sorting their translated keys.

use std::collections::BTreeMap as Map;

use log::debug;

use crate::commons::{IrError, Valid};
use crate::middle_end::analysis::constant_prop::{fold_op, fold_same_operand};
use crate::middle_end::bril::{Literal, Program, Type, NON_FOLDABLE_OPS};
use crate::middle_end::cfg::{Block, Cfg};

const COMMUTATIVE_OPS: [&str; 3] = ["add", "mul", "eq"];

/// One translated operand: a numbering class, a literal, or a name the
/// block knows nothing about.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Key {
    Num(usize),
    Int(i64),
    Bool(bool),
    Name(String),
}

impl Key {
    fn from_literal(lit: &Literal) -> Option<Key> {
        match lit {
            Literal::Int(v) => Some(Key::Int(*v)),
            Literal::Bool(v) => Some(Key::Bool(*v)),
            Literal::Float(_) | Literal::Str(_) => None,
        }
    }

    fn to_literal(&self) -> Option<Literal> {
        match self {
            Key::Int(v) => Some(Literal::Int(*v)),
            Key::Bool(v) => Some(Literal::Bool(*v)),
            Key::Num(_) | Key::Name(_) => None,
        }
    }
}

/// The canonical form an instruction's computation hashes under.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum ValueKey {
    Const(Key),
    Expr(String, Vec<Key>),
}

#[derive(Default)]
struct Tables {
    dest2num: Map<String, usize>,
    val2num: Map<ValueKey, usize>,
    num2dest: Map<usize, Vec<String>>,
    num2val: Map<usize, ValueKey>,
    next_num: usize,
}

impl Tables {
    /// Remove a redefined dest from its old class; a class without
    /// remaining dests is dropped entirely.
    fn clobber(&mut self, dest: &str) {
        let Some(old) = self.dest2num.remove(dest) else {
            return;
        };
        let Some(dests) = self.num2dest.get_mut(&old) else {
            return;
        };
        dests.retain(|d| d != dest);
        if dests.is_empty() {
            self.num2dest.remove(&old);
            if let Some(val) = self.num2val.remove(&old) {
                self.val2num.remove(&val);
            }
        }
    }

    fn register(&mut self, dest: String, num: usize) {
        self.dest2num.insert(dest.clone(), num);
        self.num2dest.entry(num).or_default().push(dest);
    }

    fn fresh(&mut self, dest: String, value: ValueKey) {
        let num = self.next_num;
        self.next_num += 1;
        self.val2num.insert(value.clone(), num);
        self.num2val.insert(num, value);
        self.register(dest, num);
    }
}

fn lvn_block(block: &mut Block) {
    let mut tables = Tables::default();

    for instr in block.instrs.iter_mut() {
        let Some(op) = instr.as_op_mut() else { continue };
        if op.typ.as_ref().map_or(false, Type::is_float) {
            continue;
        }
        if NON_FOLDABLE_OPS.contains(&op.op.as_str()) {
            continue;
        }
        let Some(dest) = op.dest.clone() else { continue };
        if op.args.is_empty() && op.value.is_none() {
            continue;
        }
        let orig_op = op.op.clone();

        // translate operands through the tables
        let (keys, all_const) = if let Some(value) = &op.value {
            match Key::from_literal(value) {
                Some(key) => (vec![key], false),
                None => continue, // string constants are not numbered
            }
        } else {
            let mut keys = Vec::with_capacity(op.args.len());
            let mut all_const = true;
            for arg in &op.args {
                match tables.dest2num.get(arg) {
                    Some(&num) => match &tables.num2val[&num] {
                        ValueKey::Const(c) => keys.push(c.clone()),
                        ValueKey::Expr(..) => {
                            keys.push(Key::Num(num));
                            all_const = false;
                        }
                    },
                    None => {
                        keys.push(Key::Name(arg.clone()));
                        all_const = false;
                    }
                }
            }
            (keys, all_const)
        };

        // fold, or canonicalize into a value key
        let value = if orig_op == "const" {
            ValueKey::Const(keys[0].clone())
        } else if all_const {
            let literals: Vec<Literal> = keys.iter().filter_map(Key::to_literal).collect();
            match fold_op(&orig_op, &literals).and_then(|lit| Key::from_literal(&lit)) {
                Some(folded) => {
                    debug!("fold `{}` -> {:?}", orig_op, folded);
                    op.op = "const".to_owned();
                    op.args.clear();
                    op.value = folded.to_literal();
                    ValueKey::Const(folded)
                }
                // division by zero and friends: leave the instruction alone
                None => continue,
            }
        } else if keys.len() == 2 && keys[0] == keys[1] && fold_same_operand(&orig_op).is_some() {
            let result = fold_same_operand(&orig_op).unwrap_or_default();
            op.op = "const".to_owned();
            op.args.clear();
            op.value = Some(Literal::Bool(result));
            ValueKey::Const(Key::Bool(result))
        } else {
            let mut keys = keys;
            if COMMUTATIVE_OPS.contains(&orig_op.as_str()) {
                keys.sort();
            }
            ValueKey::Expr(orig_op.clone(), keys)
        };

        // look up the numbering class
        let num = match &value {
            ValueKey::Expr(op_name, keys) if op_name == "id" => match keys.first() {
                Some(Key::Num(n)) => Some(*n),
                _ => tables.val2num.get(&value).copied(),
            },
            _ => tables.val2num.get(&value).copied(),
        };

        match num {
            Some(num) => {
                let canonical = tables.num2dest[&num][0].clone();
                if canonical == dest {
                    // recomputation of the value this dest already holds
                    continue;
                }
                debug!("`{dest}` joins class {num}, canonical `{canonical}`");
                tables.clobber(&dest);
                op.op = "id".to_owned();
                op.args = vec![canonical];
                op.value = None;
                tables.register(dest, num);
            }
            None => {
                tables.clobber(&dest);
                tables.fresh(dest, value);
            }
        }
    }
}

/// The pass: number every block of every function independently.
pub fn local_value_numbering(valid_program: Valid<Program>) -> Result<Valid<Program>, IrError> {
    let mut program = valid_program.0;
    for f in &mut program.functions {
        let mut cfg = Cfg::build(f, false)?;
        for block in &mut cfg.blocks {
            lvn_block(block);
        }
        f.instrs = cfg.flatten();
    }
    program.validate()
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

    fn ops(p: &Program) -> Vec<&Op> {
        p.functions[0]
            .instrs
            .iter()
            .filter_map(|i| i.as_op())
            .collect()
    }

    #[test]
    fn constant_folding() {
        let out = local_value_numbering(parse(
            r#"{"functions":[{"name":"f","instrs":[
                {"op":"const","dest":"a","type":"int","value":1},
                {"op":"const","dest":"b","type":"int","value":2},
                {"op":"add","dest":"c","type":"int","args":["a","b"]},
                {"op":"ret","args":["c"]}
            ]}]}"#,
        ))
        .unwrap()
        .0;

        let ops = ops(&out);
        assert_eq!(ops[2].op, "const");
        assert_eq!(ops[2].value, Some(Literal::Int(3)));
        assert!(ops[2].args.is_empty());
        assert_eq!(ops[3].args, vec!["c"]);
    }

    #[test]
    fn commutative_operands_share_a_class() {
        let out = local_value_numbering(parse(
            r#"{"functions":[{"name":"f","args":[{"name":"a","type":"int"},{"name":"b","type":"int"}],"instrs":[
                {"op":"add","dest":"c","type":"int","args":["a","b"]},
                {"op":"add","dest":"d","type":"int","args":["b","a"]},
                {"op":"ret","args":["c"]}
            ]}]}"#,
        ))
        .unwrap()
        .0;

        let ops = ops(&out);
        assert_eq!(ops[1].op, "id");
        assert_eq!(ops[1].args, vec!["c"]);
        assert_eq!(ops[1].dest.as_deref(), Some("d"));
    }

    #[test]
    fn repeated_constants_unify() {
        let out = local_value_numbering(parse(
            r#"{"functions":[{"name":"f","instrs":[
                {"op":"const","dest":"a","type":"int","value":7},
                {"op":"const","dest":"b","type":"int","value":7},
                {"op":"ret","args":["b"]}
            ]}]}"#,
        ))
        .unwrap()
        .0;

        let ops = ops(&out);
        assert_eq!(ops[1].op, "id");
        assert_eq!(ops[1].args, vec!["a"]);
    }

    #[test]
    fn folds_through_id_chains() {
        let out = local_value_numbering(parse(
            r#"{"functions":[{"name":"f","instrs":[
                {"op":"const","dest":"a","type":"int","value":4},
                {"op":"id","dest":"b","type":"int","args":["a"]},
                {"op":"add","dest":"c","type":"int","args":["b","b"]},
                {"op":"ret","args":["c"]}
            ]}]}"#,
        ))
        .unwrap()
        .0;

        let ops = ops(&out);
        // the id of a known constant folds into the constant's class, and
        // the add folds right through it
        assert_eq!(ops[1].op, "id");
        assert_eq!(ops[1].args, vec!["a"]);
        assert_eq!(ops[2].op, "const");
        assert_eq!(ops[2].value, Some(Literal::Int(8)));
    }

    #[test]
    fn division_by_zero_stays() {
        let input = r#"{"functions":[{"name":"f","instrs":[
            {"op":"const","dest":"a","type":"int","value":1},
            {"op":"const","dest":"z","type":"int","value":0},
            {"op":"div","dest":"d","type":"int","args":["a","z"]},
            {"op":"ret","args":["d"]}
        ]}]}"#;
        let out = local_value_numbering(parse(input)).unwrap().0;

        let ops = ops(&out);
        assert_eq!(ops[2].op, "div");
        assert_eq!(ops[2].args, vec!["a", "z"]);
    }

    #[test]
    fn same_operand_comparison_folds() {
        let out = local_value_numbering(parse(
            r#"{"functions":[{"name":"f","args":[{"name":"x","type":"int"}],"instrs":[
                {"op":"le","dest":"c","type":"bool","args":["x","x"]},
                {"op":"gt","dest":"d","type":"bool","args":["x","x"]},
                {"op":"ret","args":["c"]}
            ]}]}"#,
        ))
        .unwrap()
        .0;

        let ops = ops(&out);
        assert_eq!(ops[0].value, Some(Literal::Bool(true)));
        assert_eq!(ops[1].value, Some(Literal::Bool(false)));
    }

    #[test]
    fn clobbered_destinations_leave_their_class() {
        let out = local_value_numbering(parse(
            r#"{"functions":[{"name":"f","args":[{"name":"a","type":"int"},{"name":"b","type":"int"}],"instrs":[
                {"op":"add","dest":"t","type":"int","args":["a","b"]},
                {"op":"mul","dest":"t","type":"int","args":["a","b"]},
                {"op":"add","dest":"u","type":"int","args":["a","b"]},
                {"op":"ret","args":["u"]}
            ]}]}"#,
        ))
        .unwrap()
        .0;

        let ops = ops(&out);
        // `t` no longer holds a+b, so `u` cannot alias it
        assert_eq!(ops[2].op, "add");
        assert_eq!(ops[2].args, vec!["a", "b"]);
    }

    #[test]
    fn lvn_is_idempotent() {
        let input = r#"{"functions":[{"name":"f","args":[{"name":"a","type":"int"},{"name":"b","type":"int"}],"instrs":[
            {"op":"const","dest":"one","type":"int","value":1},
            {"op":"add","dest":"c","type":"int","args":["a","b"]},
            {"op":"add","dest":"d","type":"int","args":["b","a"]},
            {"op":"add","dest":"e","type":"int","args":["one","one"]},
            {"op":"ret","args":["d"]}
        ]}]}"#;

        let once = local_value_numbering(parse(input)).unwrap().0;
        let twice = local_value_numbering(Valid(once.clone())).unwrap().0;
        assert_eq!(once, twice);
    }
}

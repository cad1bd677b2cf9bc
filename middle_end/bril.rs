//! The json-encoded register IR that every pass consumes and produces.
//!
//! The serde model mirrors the wire format exactly: a `Type` is either a
//! bare primitive name or a record with `prim`/`ptr`/`taint` attributes, an
//! instruction is either a label pseudo-instruction or an operation with
//! optional fields.  Whatever shape came in goes back out.

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::commons::{IrError, Valid};

pub const TERMINATORS: [&str; 3] = ["jmp", "br", "ret"];

/// Operators whose results LVN and constant propagation never fold.
pub const NON_FOLDABLE_OPS: [&str; 7] = ["call", "ret", "print", "store", "load", "alloc", "phi"];

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Program {
    pub functions: Vec<Function>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Function {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Arg>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub ret_type: Option<Type>,
    pub instrs: Vec<Instr>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Arg {
    pub name: String,
    #[serde(rename = "type")]
    pub typ: Type,
}

/// A secrecy label.  `Public` joins below `Private`.
#[derive(Clone, Copy, Debug, Display, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Taint {
    #[display(fmt = "public")]
    Public,
    #[display(fmt = "private")]
    Private,
}

/// A type as it appears on the wire: either a primitive tag or a structured
/// record.  The two shapes are kept apart so round-tripping is lossless.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(untagged)]
pub enum Type {
    Prim(String),
    Record(TypeRecord),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct TypeRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prim: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ptr: Option<Box<Type>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taint: Option<Taint>,
}

impl Type {
    pub fn prim(name: &str) -> Self {
        Type::Prim(name.to_owned())
    }

    pub fn is_ptr(&self) -> bool {
        matches!(self, Type::Record(r) if r.ptr.is_some())
    }

    pub fn is_float(&self) -> bool {
        self.prim_name() == Some("float")
    }

    pub fn is_int(&self) -> bool {
        self.prim_name() == Some("int")
    }

    pub fn prim_name(&self) -> Option<&str> {
        match self {
            Type::Prim(p) => Some(p),
            Type::Record(r) => r.prim.as_deref(),
        }
    }

    pub fn taint(&self) -> Option<Taint> {
        match self {
            Type::Prim(_) => None,
            Type::Record(r) => r.taint,
        }
    }

    /// Attach a taint attribute, upgrading a primitive to a record only when
    /// necessary.
    pub fn with_taint(self, taint: Taint) -> Self {
        match self {
            Type::Prim(p) => Type::Record(TypeRecord {
                prim: Some(p),
                ptr: None,
                taint: Some(taint),
            }),
            Type::Record(mut r) => {
                r.taint = Some(taint);
                Type::Record(r)
            }
        }
    }
}

/// A literal payload of a `const` instruction.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Literal {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Instr {
    Label { label: String },
    Op(Op),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct Op {
    pub op: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<Type>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub funcs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Literal>,
}

impl Op {
    pub fn is_terminator(&self) -> bool {
        TERMINATORS.contains(&self.op.as_str())
    }
}

impl Instr {
    pub fn label(&self) -> Option<&str> {
        match self {
            Instr::Label { label } => Some(label),
            Instr::Op(_) => None,
        }
    }

    pub fn as_op(&self) -> Option<&Op> {
        match self {
            Instr::Label { .. } => None,
            Instr::Op(op) => Some(op),
        }
    }

    pub fn as_op_mut(&mut self) -> Option<&mut Op> {
        match self {
            Instr::Label { .. } => None,
            Instr::Op(op) => Some(op),
        }
    }
}

// SECTION: ssa names

/// The base of a renamed ssa name: `x.3` -> `x`.  The suffix is stripped
/// only when it is purely numeric, so variables whose original names contain
/// dots survive a round-trip through ssa form.
pub fn base_name(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((base, suffix)) if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) => {
            base
        }
        _ => name,
    }
}

pub fn ssa_name(base: &str, version: u32) -> String {
    format!("{base}.{version}")
}

// SECTION: validation

impl Program {
    /// Enforce the reader invariants: terminators carry labels, calls carry
    /// a callee, every dest carries a type, phis are balanced, consts carry
    /// a value.
    pub fn validate(self) -> Result<Valid<Program>, IrError> {
        for (fi, f) in self.functions.iter().enumerate() {
            for (ii, instr) in f.instrs.iter().enumerate() {
                let op = match instr.as_op() {
                    Some(op) => op,
                    None => continue,
                };
                let path = || format!("functions[{fi}].instrs[{ii}]");

                match op.op.as_str() {
                    "jmp" | "br" => {
                        if op.labels.is_empty() {
                            return Err(IrError::malformed(path(), "missing labels"));
                        }
                    }
                    "call" => {
                        if op.funcs.is_empty() {
                            return Err(IrError::malformed(path(), "call without funcs"));
                        }
                    }
                    "const" => {
                        if op.value.is_none() {
                            return Err(IrError::malformed(path(), "const without value"));
                        }
                    }
                    "phi" => {
                        if op.args.len() != op.labels.len() {
                            return Err(IrError::malformed(
                                path(),
                                "phi args and labels differ in length",
                            ));
                        }
                    }
                    _ => {}
                }

                if op.dest.is_some() && op.typ.is_none() {
                    return Err(IrError::malformed(path(), "dest without type"));
                }
            }
        }

        Ok(Valid(self))
    }
}

//! Shared plumbing for the pass binaries and the library.

use std::io::{Read, Write};

use thiserror::Error;

use crate::middle_end::bril::Program;

/// A program that went through `Program::validate`.  Passes take and return
/// this wrapper so unvalidated input cannot reach an analysis by accident.
#[derive(Clone, Debug)]
pub struct Valid<T>(pub T);

/// Every fatal condition a pass can hit.
#[derive(Debug, Error)]
pub enum IrError {
    #[error("malformed ir at {path}: {reason}")]
    Malformed { path: String, reason: String },

    #[error("undefined label `{label}` in function `{func}`")]
    UndefinedLabel { func: String, label: String },

    #[error("call to undefined function `{func}`")]
    UndefinedFunction { func: String },

    #[error("non-conventional ssa in function `{func}`: {reason}")]
    NonConventionalSsa { func: String, reason: String },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl IrError {
    pub fn malformed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        IrError::Malformed {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Set up stderr logging.  `IR_DEBUG=1` turns on the per-block trace.
pub fn init_logging() {
    let debug = std::env::var("IR_DEBUG").map_or(false, |v| v == "1");
    let level = if debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };

    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .target(env_logger::Target::Stderr)
        .init();
}

/// Whether the trace requested via `IR_DEBUG` is active (the binaries skip
/// the stdout json dump in that case).
pub fn debug_mode() -> bool {
    std::env::var("IR_DEBUG").map_or(false, |v| v == "1")
}

/// Read and validate a program from stdin.
pub fn read_program() -> Result<Valid<Program>, IrError> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    let program: Program = serde_json::from_str(&input)?;
    program.validate()
}

/// Write a program to stdout as 2-space-indented json.
pub fn write_program(program: &Program) -> Result<(), IrError> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    serde_json::to_writer_pretty(&mut out, program)?;
    out.write_all(b"\n")?;
    Ok(())
}

/// Shared main body for the pass binaries: read, transform, write, exit 1 on
/// any fatal error.
pub fn drive(pass: fn(Valid<Program>) -> Result<Valid<Program>, IrError>) {
    init_logging();

    let program = match read_program() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    match pass(program) {
        Ok(p) => {
            if !debug_mode() {
                if let Err(e) = write_program(&p.0) {
                    eprintln!("{e}");
                    std::process::exit(1);
                }
            }
        }
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

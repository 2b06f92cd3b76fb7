//! ykcolor: a scope-based online register allocator for x64.
//!
//! The input to this crate is a procedure ([ir::Proc]) whose instructions refer to an unbounded
//! number of virtual registers, nested inside structured scopes (function bodies, loop bodies,
//! conditional arms). [colorize] walks the procedure once, top to bottom, assigning each virtual
//! register to a physical register (or to memory) at every point of use, and returns a flat
//! instruction listing ([Colored]) that refers only to physical registers.
//!
//! Allocation happens in two passes:
//!
//! 1. The colorizer ([colorize::Colorizer]) colors each instruction, inserting loads, stores,
//!    moves, and exchanges as needed. When control flow leaves a scope, the locations of values
//!    that outlive the scope are reconciled so that every path into a join point agrees.
//! 2. The frame finalizer ([frame]) resolves the frame and stack-alignment placeholders now that
//!    the number of spill cells is known.

use std::{error::Error, fmt};
use thiserror::Error;

mod colorize;
mod frame;
pub mod ir;
mod log;
pub mod reg;

use ir::{Inst, Proc};
use log::{dump_ir, IRPhase, Log, Verbosity};

/// A failure to color a procedure.
#[derive(Error, Debug)]
pub enum CompilationError {
    #[error("Internal error: {0}")]
    /// The input violated one of the colorizer's preconditions, or the colorizer itself has a
    /// bug. Either way, the procedure cannot be colored.
    InternalError(String),
    #[error("Internal error: {0}")]
    /// A limit was exceeded (e.g. more virtual registers than an index can represent, or a frame
    /// that cannot be addressed with a 32-bit displacement).
    LimitExceeded(String),
}

/// Configuration for [colorize].
pub struct Config {
    log: Log,
}

impl Config {
    /// Build a [Config] from the `YKD_LOG` environment variable.
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        Ok(Self { log: Log::new()? })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: Log::errors_only(),
        }
    }
}

/// A procedure whose registers have all been colored.
#[derive(Debug)]
pub struct Colored {
    /// The procedure's name, for logging.
    pub name: String,
    /// The instructions, referring only to physical registers.
    pub insts: Vec<Inst>,
    /// The number of bytes reserved below `rbp` for spill cells. Always a multiple of 16.
    pub frame_size: u32,
}

impl fmt::Display for Colored {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; {}: frame size {}", self.name, self.frame_size)?;
        for inst in &self.insts {
            writeln!(f, "{inst}")?;
        }
        Ok(())
    }
}

/// Color `proc`. Failures are also logged at [Verbosity::Error].
pub fn colorize(proc: &Proc, config: &Config) -> Result<Colored, CompilationError> {
    dump_ir(IRPhase::ColorizeIn, &proc.name, || proc.to_string());
    let colored = colorize::Colorizer::new(proc, &config.log)
        .and_then(|c| c.run())
        .map_err(|e| {
            config
                .log
                .log(Verbosity::Error, &format!("{}: {e}", proc.name));
            e
        })?;
    dump_ir(IRPhase::Asm, &proc.name, || colored.to_string());
    Ok(colored)
}

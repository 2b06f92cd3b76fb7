//! The frame finalizer: once coloring knows how many spill cells a procedure needs, replace the
//! frame and alignment placeholders with real instructions.

use crate::{
    ir::{Cmd, Inst, Opcode, Operand, RegRef},
    reg::Reg,
    Colored, CompilationError,
};

/// The SysV ABI requires `rsp` to be a multiple of this at every call.
const STACK_ALIGN: i64 = 16;
/// The size of one pushed stack entry.
const SLOT: i64 = 8;
static_assertions::const_assert_eq!(STACK_ALIGN % SLOT, 0);

fn rsp() -> Operand {
    Operand::phys(Reg::RSP)
}

fn rbp() -> Operand {
    Operand::phys(Reg::RBP)
}

/// How many bytes does `inst` push onto (positive) or pop off (negative) the stack?
fn stack_effect(inst: &Inst) -> i64 {
    let adjusts_rsp = |inst: &Inst| match inst.operands.as_slice() {
        [Operand::Reg(RegRef::Phys(Reg::RSP)), Operand::Imm(x)] => Some(*x),
        _ => None,
    };
    match inst.opcode {
        Opcode::Push => SLOT,
        Opcode::Pop => -SLOT,
        Opcode::Sub => adjusts_rsp(inst).unwrap_or(0),
        Opcode::Add => adjusts_rsp(inst).map_or(0, |x| -x),
        _ => 0,
    }
}

/// Resolve the placeholders in the colorizer's output `cmds`, which needed `spill_bytes` bytes of
/// spill cells. `uses_fp` says whether anything addresses incoming stack parameters through
/// `rbp`, which then needs setting up even if there are no spill cells.
pub(crate) fn finalize(
    name: &str,
    cmds: Vec<Cmd>,
    spill_bytes: usize,
    uses_fp: bool,
) -> Result<Colored, CompilationError> {
    let frame_size = spill_bytes
        .checked_next_multiple_of(STACK_ALIGN as usize)
        .and_then(|x| i32::try_from(x).ok())
        .ok_or_else(|| CompilationError::LimitExceeded(format!("{name}: frame too large")))?;
    let has_frame = frame_size > 0 || uses_fp;

    // The number of bytes below the caller's (aligned) stack pointer, starting with the return
    // address.
    let mut depth = SLOT;
    // For each unmatched `AlignBefore`, its argument count and whether it padded.
    let mut pads = Vec::new();
    let mut insts = Vec::with_capacity(cmds.len());
    for cmd in cmds {
        match cmd {
            Cmd::Inst(inst) => {
                depth += stack_effect(&inst);
                insts.push(inst);
            }
            Cmd::FrameCreate => {
                if has_frame {
                    insts.push(Inst::push(rbp()));
                    insts.push(Inst::mov(rbp(), rsp()));
                    if frame_size > 0 {
                        insts.push(Inst::binop(
                            Opcode::Sub,
                            rsp(),
                            Operand::Imm(i64::from(frame_size)),
                        ));
                    }
                    depth += SLOT + i64::from(frame_size);
                }
            }
            Cmd::FrameDestroy => {
                // Only a return can follow, so `depth` is left as the rest of the body sees it.
                if has_frame {
                    insts.push(Inst::mov(rsp(), rbp()));
                    insts.push(Inst::pop(rbp()));
                }
            }
            Cmd::AlignBefore(n) => {
                let args = i64::try_from(n).map_err(|_| {
                    CompilationError::LimitExceeded(format!("{name}: {n} stack arguments"))
                })?;
                let pad = (depth + args * SLOT) % STACK_ALIGN != 0;
                if pad {
                    insts.push(Inst::binop(Opcode::Sub, rsp(), Operand::Imm(SLOT)));
                    depth += SLOT;
                }
                pads.push((n, pad));
            }
            Cmd::AlignAfter(n) => match pads.pop() {
                Some((m, pad)) if m == n => {
                    if pad {
                        insts.push(Inst::binop(Opcode::Add, rsp(), Operand::Imm(SLOT)));
                        depth -= SLOT;
                    }
                }
                Some((m, _)) => {
                    return Err(CompilationError::InternalError(format!(
                        "{name}: align-after {n} does not match align-before {m}"
                    )))
                }
                None => {
                    return Err(CompilationError::InternalError(format!(
                        "{name}: align-after {n} without an align-before"
                    )))
                }
            },
            cmd => {
                return Err(CompilationError::InternalError(format!(
                    "{name}: `{cmd}` left after coloring"
                )))
            }
        }
    }
    if let Some((n, _)) = pads.last() {
        return Err(CompilationError::InternalError(format!(
            "{name}: align-before {n} without an align-after"
        )));
    }
    Ok(Colored {
        name: name.to_owned(),
        insts,
        // Non-negative: rounded up from a `usize`.
        frame_size: frame_size.unsigned_abs(),
    })
}

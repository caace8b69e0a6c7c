// This module encodes allocated LIR instructions into x86-64 machine code using the
// iced-x86 assembler. Each instruction is assembled position-independently into the
// emitter's chunk sink; references that the installer must patch (constant-pool
// addresses, foreign-call targets) are recorded at the offset of their immediate
// field, which is why the constant-address move and the call are emitted by hand
// with fixed-size placeholder fields instead of through iced. Spilled operands have
// already been staged through scratch registers by the allocator; only moves may
// still carry a stack-slot operand, encoded as RBP-relative memory.

//! Instruction encoding for the x86-64 reference target.

use crate::error::{BackendError, CompileResult};
use crate::lir::{BinOp, FrameLayout, Inst, LirUnit, Location, Op, Operand, PhysReg, Value};
use crate::target::{CodeSink, Reference};
use iced_x86::code_asm::*;

const GP64: [AsmRegister64; 16] = [
    rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15,
];
const GP32: [AsmRegister32; 16] = [
    eax, ecx, edx, ebx, esp, ebp, esi, edi, r8d, r9d, r10d, r11d, r12d, r13d, r14d, r15d,
];
const XMM: [AsmRegisterXmm; 16] = [
    xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7, xmm8, xmm9, xmm10, xmm11, xmm12, xmm13,
    xmm14, xmm15,
];

fn asm_err(e: iced_x86::IcedError) -> BackendError {
    BackendError::internal("x64", e.to_string())
}

fn unsupported(what: &str) -> BackendError {
    BackendError::internal("x64", format!("unsupported encoding: {what}"))
}

/// Operand resolved against the variable table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Opnd {
    Gp(u8),
    Xmm(u8),
    Imm(i64),
    Slot(u32),
}

fn resolve(operand: &Operand, unit: &LirUnit) -> CompileResult<Opnd> {
    let classify = |r: PhysReg| -> CompileResult<Opnd> {
        match r.bank {
            0 => Ok(Opnd::Gp(r.num)),
            1 => Ok(Opnd::Xmm(r.num)),
            _ => Err(unsupported("register bank")),
        }
    };
    match operand.value {
        Value::Reg(r) => classify(r),
        Value::Var(v) => match unit.var(v).loc {
            Location::Reg(r) => classify(r),
            Location::Slot(s) => Ok(Opnd::Slot(s)),
            Location::Unassigned => Err(BackendError::internal(
                "x64",
                format!("v{} reached the encoder without a location", v.0),
            )),
        },
        Value::Imm(i) => Ok(Opnd::Imm(i)),
        Value::Slot(s) => Ok(Opnd::Slot(s)),
        Value::Data(_) => Err(unsupported("data reference outside a constant move")),
    }
}

/// RBP-relative displacement of a spill slot. Slots live below the saved
/// callee registers.
fn slot_disp(frame: &FrameLayout, slot: u32) -> i32 {
    let saved = frame.saved_regs.len() as i32 * 8;
    -(saved + (slot as i32 + 1) * frame.slot_bytes.max(8) as i32)
}

/// Bytes the prologue subtracts from RSP, padded so call sites stay
/// aligned to the frame's requirement.
fn frame_adjust(frame: &FrameLayout) -> u32 {
    let align = frame.align.max(1);
    let spill = frame.slots * frame.slot_bytes.max(8);
    let total = frame.saved_regs.len() as u32 * 8 + spill;
    spill + (align - total % align) % align
}

pub(super) fn encode_prologue(frame: &FrameLayout, buf: &mut Vec<u8>) -> CompileResult<()> {
    let mut a = CodeAssembler::new(64).map_err(asm_err)?;
    a.push(rbp).map_err(asm_err)?;
    a.mov(rbp, rsp).map_err(asm_err)?;
    for &reg in &frame.saved_regs {
        a.push(GP64[reg.num as usize]).map_err(asm_err)?;
    }
    let adjust = frame_adjust(frame);
    if adjust > 0 {
        a.sub(rsp, adjust as i32).map_err(asm_err)?;
    }
    let bytes = a.assemble(0).map_err(asm_err)?;
    buf.extend_from_slice(&bytes);
    Ok(())
}

fn encode_epilogue(frame: &FrameLayout, a: &mut CodeAssembler) -> CompileResult<()> {
    let adjust = frame_adjust(frame);
    if adjust > 0 {
        a.add(rsp, adjust as i32).map_err(asm_err)?;
    }
    for &reg in frame.saved_regs.iter().rev() {
        a.pop(GP64[reg.num as usize]).map_err(asm_err)?;
    }
    a.pop(rbp).map_err(asm_err)?;
    a.ret().map_err(asm_err)?;
    Ok(())
}

/// Encode a move between resolved operands; the workhorse shared by `Move`,
/// operand staging inside `Bin`, and `Return`.
fn encode_move(
    a: &mut CodeAssembler,
    frame: &FrameLayout,
    dst: Opnd,
    src: Opnd,
    bits: u16,
) -> CompileResult<()> {
    if dst == src {
        return Ok(());
    }
    let wide = bits > 32;
    match (dst, src) {
        (Opnd::Gp(d), Opnd::Gp(s)) => {
            if wide {
                a.mov(GP64[d as usize], GP64[s as usize]).map_err(asm_err)
            } else {
                a.mov(GP32[d as usize], GP32[s as usize]).map_err(asm_err)
            }
        }
        (Opnd::Gp(d), Opnd::Imm(i)) => {
            if wide {
                a.mov(GP64[d as usize], i).map_err(asm_err)
            } else {
                a.mov(GP32[d as usize], i as i32).map_err(asm_err)
            }
        }
        (Opnd::Gp(d), Opnd::Slot(s)) => {
            let mem = qword_ptr(rbp + slot_disp(frame, s));
            a.mov(GP64[d as usize], mem).map_err(asm_err)
        }
        (Opnd::Slot(s), Opnd::Gp(d)) => {
            let mem = qword_ptr(rbp + slot_disp(frame, s));
            a.mov(mem, GP64[d as usize]).map_err(asm_err)
        }
        (Opnd::Slot(s), Opnd::Imm(i)) => {
            let imm = i32::try_from(i).map_err(|_| unsupported("64-bit store immediate"))?;
            let mem = qword_ptr(rbp + slot_disp(frame, s));
            a.mov(mem, imm).map_err(asm_err)
        }
        (Opnd::Xmm(d), Opnd::Xmm(s)) => {
            a.movaps(XMM[d as usize], XMM[s as usize]).map_err(asm_err)
        }
        (Opnd::Xmm(d), Opnd::Slot(s)) => {
            let mem = qword_ptr(rbp + slot_disp(frame, s));
            a.movsd_2(XMM[d as usize], mem).map_err(asm_err)
        }
        (Opnd::Slot(s), Opnd::Xmm(d)) => {
            let mem = qword_ptr(rbp + slot_disp(frame, s));
            a.movsd_2(mem, XMM[d as usize]).map_err(asm_err)
        }
        (Opnd::Gp(d), Opnd::Xmm(s)) => a.movq(GP64[d as usize], XMM[s as usize]).map_err(asm_err),
        (Opnd::Xmm(d), Opnd::Gp(s)) => a.movq(XMM[d as usize], GP64[s as usize]).map_err(asm_err),
        _ => Err(unsupported("move operand combination")),
    }
}

fn encode_bin(
    a: &mut CodeAssembler,
    frame: &FrameLayout,
    op: BinOp,
    inst: &Inst,
    unit: &LirUnit,
) -> CompileResult<()> {
    let dst = resolve(&inst.operands[0], unit)?;
    let lhs = resolve(&inst.operands[1], unit)?;
    let rhs = resolve(&inst.operands[2], unit)?;
    let bits = inst.operands[0].kind.bits;
    let Opnd::Gp(d) = dst else {
        return Err(unsupported("non-integer arithmetic destination"));
    };

    encode_move(a, frame, dst, lhs, bits)?;

    match rhs {
        Opnd::Gp(s) => {
            if bits > 32 {
                let (d, s) = (GP64[d as usize], GP64[s as usize]);
                match op {
                    BinOp::Add => a.add(d, s),
                    BinOp::Sub => a.sub(d, s),
                    BinOp::Mul => a.imul_2(d, s),
                    BinOp::And => a.and(d, s),
                    BinOp::Or => a.or(d, s),
                    BinOp::Xor => a.xor(d, s),
                }
                .map_err(asm_err)
            } else {
                let (d, s) = (GP32[d as usize], GP32[s as usize]);
                match op {
                    BinOp::Add => a.add(d, s),
                    BinOp::Sub => a.sub(d, s),
                    BinOp::Mul => a.imul_2(d, s),
                    BinOp::And => a.and(d, s),
                    BinOp::Or => a.or(d, s),
                    BinOp::Xor => a.xor(d, s),
                }
                .map_err(asm_err)
            }
        }
        Opnd::Imm(i) => {
            let imm = i32::try_from(i).map_err(|_| unsupported("64-bit arithmetic immediate"))?;
            if bits > 32 {
                let d = GP64[d as usize];
                match op {
                    BinOp::Add => a.add(d, imm),
                    BinOp::Sub => a.sub(d, imm),
                    BinOp::Mul => a.imul_3(d, d, imm),
                    BinOp::And => a.and(d, imm),
                    BinOp::Or => a.or(d, imm),
                    BinOp::Xor => a.xor(d, imm),
                }
                .map_err(asm_err)
            } else {
                let d = GP32[d as usize];
                match op {
                    BinOp::Add => a.add(d, imm),
                    BinOp::Sub => a.sub(d, imm),
                    BinOp::Mul => a.imul_3(d, d, imm),
                    BinOp::And => a.and(d, imm),
                    BinOp::Or => a.or(d, imm),
                    BinOp::Xor => a.xor(d, imm),
                }
                .map_err(asm_err)
            }
        }
        _ => Err(unsupported("arithmetic source operand")),
    }
}

pub(super) fn encode_inst(inst: &Inst, unit: &LirUnit, sink: &mut CodeSink) -> CompileResult<()> {
    match &inst.op {
        Op::LoadData(id) => {
            let Opnd::Gp(d) = resolve(&inst.operands[0], unit)? else {
                return Err(unsupported("constant address outside the integer bank"));
            };
            // movabs reg, imm64 with a zero placeholder; the installer
            // patches in the absolute data-section address.
            sink.put(&[0x48 | u8::from(d >= 8), 0xB8 + (d & 7)]);
            sink.reloc_here(Reference::Data(*id));
            sink.put(&[0, 0, 0, 0, 0, 0, 0, 0]);
            return Ok(());
        }
        Op::Call { linkage, .. } => {
            // call rel32 with a zero placeholder for the installer.
            sink.put(&[0xE8]);
            sink.reloc_here(Reference::Foreign(linkage.descriptor.name));
            sink.put(&[0, 0, 0, 0]);
            return Ok(());
        }
        Op::Jump(_) => {
            return Err(BackendError::internal(
                "x64",
                "jump bytes are owned by the emitter",
            ));
        }
        _ => {}
    }

    let mut a = CodeAssembler::new(64).map_err(asm_err)?;
    let frame = &unit.frame;

    match &inst.op {
        Op::Move => {
            let dst = resolve(&inst.operands[0], unit)?;
            let src = resolve(&inst.operands[1], unit)?;
            encode_move(&mut a, frame, dst, src, inst.operands[0].kind.bits)?;
        }
        Op::Bin(op) => encode_bin(&mut a, frame, *op, inst, unit)?,
        Op::Load => {
            let dst = resolve(&inst.operands[0], unit)?;
            let addr = resolve(&inst.operands[1], unit)?;
            let (Opnd::Gp(d), Opnd::Gp(base)) = (dst, addr) else {
                return Err(unsupported("load operands"));
            };
            if inst.operands[0].kind.bits > 32 {
                a.mov(GP64[d as usize], qword_ptr(GP64[base as usize]))
                    .map_err(asm_err)?;
            } else {
                a.mov(GP32[d as usize], dword_ptr(GP64[base as usize]))
                    .map_err(asm_err)?;
            }
        }
        Op::Store => {
            let addr = resolve(&inst.operands[0], unit)?;
            let val = resolve(&inst.operands[1], unit)?;
            let Opnd::Gp(base) = addr else {
                return Err(unsupported("store address"));
            };
            let wide = inst.operands[1].kind.bits > 32;
            match val {
                Opnd::Gp(s) if wide => a
                    .mov(qword_ptr(GP64[base as usize]), GP64[s as usize])
                    .map_err(asm_err)?,
                Opnd::Gp(s) => a
                    .mov(dword_ptr(GP64[base as usize]), GP32[s as usize])
                    .map_err(asm_err)?,
                Opnd::Imm(i) => {
                    let imm = i32::try_from(i).map_err(|_| unsupported("store immediate"))?;
                    if wide {
                        a.mov(qword_ptr(GP64[base as usize]), imm).map_err(asm_err)?;
                    } else {
                        a.mov(dword_ptr(GP64[base as usize]), imm).map_err(asm_err)?;
                    }
                }
                _ => return Err(unsupported("store value")),
            }
        }
        Op::CondBranch { .. } => {
            let lhs = resolve(&inst.operands[0], unit)?;
            let rhs = resolve(&inst.operands[1], unit)?;
            let Opnd::Gp(l) = lhs else {
                return Err(unsupported("comparison operand"));
            };
            let wide = inst.operands[0].kind.bits > 32;
            match rhs {
                Opnd::Gp(r) if wide => a
                    .cmp(GP64[l as usize], GP64[r as usize])
                    .map_err(asm_err)?,
                Opnd::Gp(r) => a.cmp(GP32[l as usize], GP32[r as usize]).map_err(asm_err)?,
                Opnd::Imm(i) => {
                    let imm = i32::try_from(i).map_err(|_| unsupported("comparison immediate"))?;
                    if wide {
                        a.cmp(GP64[l as usize], imm).map_err(asm_err)?;
                    } else {
                        a.cmp(GP32[l as usize], imm).map_err(asm_err)?;
                    }
                }
                _ => return Err(unsupported("comparison operand")),
            }
        }
        Op::Return => {
            if let Some(operand) = inst.operands.first() {
                let src = resolve(operand, unit)?;
                let ret = match operand.kind.class {
                    crate::lir::RegClass::Int => Opnd::Gp(0),
                    crate::lir::RegClass::Float => Opnd::Xmm(0),
                };
                encode_move(&mut a, frame, ret, src, operand.kind.bits)?;
            }
            encode_epilogue(frame, &mut a)?;
        }
        Op::LoadData(_) | Op::Call { .. } | Op::Jump(_) => unreachable!("handled above"),
    }

    if a.instructions().is_empty() {
        return Ok(());
    }
    let bytes = a.assemble(0).map_err(asm_err)?;
    sink.put(&bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::{LirUnit, Operand, ValueKind};

    fn unit() -> LirUnit {
        LirUnit::new("enc", 1)
    }

    #[test]
    fn reg_to_reg_move_uses_rex_prefix() {
        let unit = unit();
        let mut sink = CodeSink::new();
        let kind = ValueKind::word();
        let inst = Inst::new(
            Op::Move,
            vec![
                Operand::def_of(Value::Reg(PhysReg::new(0, 0)), kind),
                Operand::use_of(Value::Reg(PhysReg::new(0, 1)), kind),
            ],
        );
        encode_inst(&inst, &unit, &mut sink).unwrap();
        assert!(!sink.bytes.is_empty());
        assert_eq!(sink.bytes[0], 0x48);
    }

    #[test]
    fn identical_move_encodes_to_nothing() {
        let unit = unit();
        let mut sink = CodeSink::new();
        let kind = ValueKind::word();
        let inst = Inst::new(
            Op::Move,
            vec![
                Operand::def_of(Value::Reg(PhysReg::new(0, 2)), kind),
                Operand::use_of(Value::Reg(PhysReg::new(0, 2)), kind),
            ],
        );
        encode_inst(&inst, &unit, &mut sink).unwrap();
        assert!(sink.bytes.is_empty());
    }

    #[test]
    fn constant_address_move_reserves_patch_field() {
        let mut u = unit();
        let id = u.intern_constant(vec![1, 2, 3, 4], 4);
        let kind = ValueKind::word();
        let inst = Inst::new(
            Op::LoadData(id),
            vec![Operand::def_of(Value::Reg(PhysReg::new(0, 0)), kind)],
        );
        let mut sink = CodeSink::new();
        encode_inst(&inst, &u, &mut sink).unwrap();

        // movabs rax, imm64: REX.W B8 + 8 placeholder bytes.
        assert_eq!(sink.bytes.len(), 10);
        assert_eq!(&sink.bytes[..2], &[0x48, 0xB8]);
        assert_eq!(sink.relocs.len(), 1);
        assert_eq!(sink.relocs[0].0, 2);
        assert!(matches!(sink.relocs[0].1, Reference::Data(d) if d == id));
    }

    #[test]
    fn prologue_and_return_frame_balance() {
        let mut u = unit();
        u.frame.slots = 3;
        u.frame.slot_bytes = 8;
        u.frame.saved_regs = vec![PhysReg::new(0, 3)];

        let mut buf = Vec::new();
        encode_prologue(&u.frame, &mut buf).unwrap();
        assert!(!buf.is_empty());
        // push rbp is the first byte.
        assert_eq!(buf[0], 0x55);

        let kind = ValueKind::word();
        let ret = Inst::new(Op::Return, vec![Operand::use_of(Value::Imm(7), kind)]);
        let mut sink = CodeSink::new();
        encode_inst(&ret, &u, &mut sink).unwrap();
        // Ends in C3.
        assert_eq!(*sink.bytes.last().unwrap(), 0xC3);
    }

    #[test]
    fn frame_adjust_keeps_call_sites_aligned() {
        let mut frame = FrameLayout {
            slots: 1,
            slot_bytes: 8,
            align: 16,
            saved_regs: vec![],
        };
        // 8 bytes of spill + 8 bytes of padding.
        assert_eq!(frame_adjust(&frame), 16);
        frame.saved_regs.push(PhysReg::new(0, 3));
        // 8 saved + 8 spill is already aligned.
        assert_eq!(frame_adjust(&frame), 8);
    }
}

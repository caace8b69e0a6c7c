// This module provides the bundled x86-64 System V reference target: the register
// configuration (GP and XMM banks, argument and return registers, callee-saved set,
// spill scratch registers), the branch-form geometry the emitter's fixed point
// works with (short jumps are 0xEB/0x70|cc with an 8-bit displacement, long jumps
// 0xE9/0x0F 0x80|cc with 32 bits), and the instruction encoder built on iced-x86.
// Any other target plugs into the same TargetIsa interface; nothing outside this
// directory knows about x86-64.

//! x86-64 System V reference target.

mod encoder;

use crate::error::{BackendError, CompileResult};
use crate::lir::{Cond, FrameLayout, Inst, LirUnit, PhysReg};
use crate::regalloc::config::{CallConvention, RegMask, RegisterAllocationConfig};
use crate::target::{BranchForm, CodeSink, TargetIsa};

pub const RAX: PhysReg = PhysReg::new(0, 0);
pub const RCX: PhysReg = PhysReg::new(0, 1);
pub const RDX: PhysReg = PhysReg::new(0, 2);
pub const RBX: PhysReg = PhysReg::new(0, 3);
pub const RSP: PhysReg = PhysReg::new(0, 4);
pub const RBP: PhysReg = PhysReg::new(0, 5);
pub const RSI: PhysReg = PhysReg::new(0, 6);
pub const RDI: PhysReg = PhysReg::new(0, 7);
pub const R8: PhysReg = PhysReg::new(0, 8);
pub const R9: PhysReg = PhysReg::new(0, 9);
pub const R10: PhysReg = PhysReg::new(0, 10);
pub const R11: PhysReg = PhysReg::new(0, 11);

/// Build the System V register allocation configuration.
///
/// R10/R11 and XMM14/XMM15 are reserved as spill scratch; RSP and RBP are
/// the stack and frame pointers.
pub fn config() -> RegisterAllocationConfig {
    let mut allocatable = RegMask::bank_range(0, 16);
    for reg in [RSP, RBP, R10, R11] {
        allocatable.remove(reg);
    }
    let allocatable = allocatable.union(RegMask::bank_range(1, 14));

    let mut reserved = RegMask::empty();
    for reg in [RSP, RBP, R10, R11] {
        reserved.insert(reg);
    }
    reserved.insert(PhysReg::new(1, 14));
    reserved.insert(PhysReg::new(1, 15));

    // RBX, R12-R15
    let mut callee_saved = RegMask::empty();
    for num in [3, 12, 13, 14, 15] {
        callee_saved.insert(PhysReg::new(0, num));
    }

    let mut caller_saved = RegMask::empty();
    for reg in [RAX, RCX, RDX, RSI, RDI, R8, R9, R10, R11] {
        caller_saved.insert(reg);
    }
    let caller_saved = caller_saved.union(RegMask::bank_range(1, 16));

    RegisterAllocationConfig {
        allocatable,
        reserved,
        callee_saved,
        scratch: [
            [Some(R10), Some(R11)],
            [Some(PhysReg::new(1, 14)), Some(PhysReg::new(1, 15))],
            [None, None],
            [None, None],
        ],
        call_conv: CallConvention {
            int_args: vec![RDI, RSI, RDX, RCX, R8, R9],
            float_args: (0..8).map(|n| PhysReg::new(1, n)).collect(),
            int_ret: RAX,
            float_ret: PhysReg::new(1, 0),
            caller_saved,
        },
        slot_bytes: 8,
        frame_align: 16,
        max_vector_bits: 128,
    }
}

/// The reference target.
pub struct X64Target {
    config: RegisterAllocationConfig,
}

impl X64Target {
    pub fn new() -> Self {
        Self { config: config() }
    }
}

impl Default for X64Target {
    fn default() -> Self {
        Self::new()
    }
}

/// Condition-code nibble shared by both branch forms.
fn cc_bits(cond: Cond) -> u8 {
    match cond {
        Cond::Eq => 0x4,
        Cond::Ne => 0x5,
        Cond::Lt => 0xC,
        Cond::Ge => 0xD,
        Cond::Le => 0xE,
        Cond::Gt => 0xF,
    }
}

impl TargetIsa for X64Target {
    fn name(&self) -> &'static str {
        "x86_64-sysv"
    }

    fn reg_config(&self) -> &RegisterAllocationConfig {
        &self.config
    }

    fn short_branch_range(&self) -> (i64, i64) {
        (i64::from(i8::MIN), i64::from(i8::MAX))
    }

    fn branch_size(&self, cond: Option<Cond>, form: BranchForm) -> u32 {
        match (cond, form) {
            (_, BranchForm::Short) => 2,
            (None, BranchForm::Long) => 5,
            (Some(_), BranchForm::Long) => 6,
        }
    }

    fn encode_branch(
        &self,
        cond: Option<Cond>,
        form: BranchForm,
        disp: i32,
        buf: &mut Vec<u8>,
    ) -> CompileResult<()> {
        match form {
            BranchForm::Short => {
                let disp = i8::try_from(disp).map_err(|_| {
                    BackendError::internal("x64", "short branch displacement out of range")
                })?;
                match cond {
                    // EB ib
                    None => buf.push(0xEB),
                    // 70+cc ib
                    Some(c) => buf.push(0x70 | cc_bits(c)),
                }
                buf.push(disp as u8);
            }
            BranchForm::Long => {
                match cond {
                    // E9 id
                    None => buf.push(0xE9),
                    // 0F 80+cc id
                    Some(c) => {
                        buf.push(0x0F);
                        buf.push(0x80 | cc_bits(c));
                    }
                }
                buf.extend_from_slice(&disp.to_le_bytes());
            }
        }
        Ok(())
    }

    fn encode_inst(&self, inst: &Inst, unit: &LirUnit, sink: &mut CodeSink) -> CompileResult<()> {
        encoder::encode_inst(inst, unit, sink)
    }

    fn encode_prologue(&self, frame: &FrameLayout, buf: &mut Vec<u8>) -> CompileResult<()> {
        encoder::encode_prologue(frame, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_sizes_match_their_encodings() {
        let target = X64Target::new();
        for cond in [None, Some(Cond::Lt)] {
            for form in [BranchForm::Short, BranchForm::Long] {
                let mut buf = Vec::new();
                target.encode_branch(cond, form, 16, &mut buf).unwrap();
                assert_eq!(buf.len() as u32, target.branch_size(cond, form));
            }
        }
    }

    #[test]
    fn branch_opcode_classes() {
        let target = X64Target::new();

        let mut buf = Vec::new();
        target
            .encode_branch(None, BranchForm::Short, -2, &mut buf)
            .unwrap();
        assert_eq!(buf, vec![0xEB, 0xFE]);

        buf.clear();
        target
            .encode_branch(None, BranchForm::Long, 0x100, &mut buf)
            .unwrap();
        assert_eq!(buf[0], 0xE9);

        buf.clear();
        target
            .encode_branch(Some(Cond::Eq), BranchForm::Long, 0x100, &mut buf)
            .unwrap();
        assert_eq!(&buf[..2], &[0x0F, 0x84]);

        buf.clear();
        target
            .encode_branch(Some(Cond::Ne), BranchForm::Short, 4, &mut buf)
            .unwrap();
        assert_eq!(buf[0], 0x75);
    }

    #[test]
    fn config_partitions_are_sane() {
        let cfg = config();
        assert!(!cfg.allocatable.contains(RSP));
        assert!(!cfg.allocatable.contains(RBP));
        assert!(!cfg.allocatable.contains(R10));
        assert!(cfg.allocatable.contains(RAX));
        assert!(cfg.callee_saved.contains(RBX));
        assert!(!cfg.callee_saved.contains(RAX));
        assert_eq!(cfg.scratch_reg(crate::lir::RegClass::Int, 0), Some(R10));
        assert_eq!(cfg.call_conv.arg_reg(crate::lir::RegClass::Int, 0), Some(RDI));
    }
}

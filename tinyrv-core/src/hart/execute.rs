//! Per-opcode semantics for RV32IMAFC + Zicsr + Zifencei.

use log::trace;

use super::{Exception, ExecutionResult, HartState};
use crate::instruction::{
    AmoOp, BranchCondition, CsrOp, FpArithOp, FpCompareOp, FpFusedOp, FpMinMaxOp, FpSignInjectOp,
    Instruction, LoadWidth, RegImmOp, RegRegOp, RegShiftImmOp, StoreWidth,
};
use crate::registers::Specifier;
use crate::{Alignment, SystemIo};

/// How the step loop proceeds after an instruction.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Flow {
    /// Sequential instruction: pc was advanced past it, the cycle counter
    /// increments and the loop continues.
    Next,
    /// Control transfer (branches, jumps, MRET): pc was set by the handler
    /// and the step loop returns to its caller.
    Branch,
}

/// Canonical NaN bit pattern produced by single-precision operations.
const CANONICAL_NAN: u32 = 0x7FC0_0000;

/// Sign bit of an IEEE-754 single.
const FLOAT_SIGN_BIT: u32 = 0x8000_0000;

// Accrued exception flags in fcsr.fflags.
const FFLAG_INEXACT: u32 = 1 << 0;
const FFLAG_OVERFLOW: u32 = 1 << 2;
const FFLAG_DIV_BY_ZERO: u32 = 1 << 3;
const FFLAG_INVALID_OP: u32 = 1 << 4;

#[derive(Debug)]
pub(crate) struct Executor<'a, S: SystemIo> {
    pub state: &'a mut HartState,
    pub io: &'a mut S,
}

impl<'a, S: SystemIo> Executor<'a, S> {
    /// Decodes and executes a single raw instruction word, recording its
    /// length in the hart state.
    pub fn execute_raw(&mut self, raw_instruction: u32) -> ExecutionResult {
        let (instruction, length) = Instruction::decode(raw_instruction, &self.state.isa)
            .map_err(|_| Exception::IllegalInstruction(raw_instruction))?;
        self.state.insn_len = u32::from(length);
        self.execute(instruction)
    }

    /// Dispatches on the instruction tag. The match compiles to a jump
    /// table; the per-opcode handlers below stay small enough to inline into
    /// the loop.
    pub fn execute(&mut self, instruction: Instruction) -> ExecutionResult {
        match instruction {
            Instruction::OpImm {
                op,
                dest,
                src,
                immediate,
            } => {
                let op = match op {
                    RegImmOp::Addi => Executor::addi,
                    RegImmOp::Slti => Executor::slti,
                    RegImmOp::Sltiu => Executor::sltiu,
                    RegImmOp::Xori => Executor::xori,
                    RegImmOp::Ori => Executor::ori,
                    RegImmOp::Andi => Executor::andi,
                };
                op(self, dest, src, immediate)
            }
            Instruction::OpShiftImm {
                op,
                dest,
                src,
                shift_amount_u5,
            } => {
                let op = match op {
                    RegShiftImmOp::Slli => Executor::slli,
                    RegShiftImmOp::Srli => Executor::srli,
                    RegShiftImmOp::Srai => Executor::srai,
                };
                op(self, dest, src, shift_amount_u5)
            }
            Instruction::Auipc { dest, immediate } => self.auipc(dest, immediate),
            Instruction::Lui { dest, immediate } => self.lui(dest, immediate),
            Instruction::Op {
                op,
                dest,
                src1,
                src2,
            } => {
                let op = match op {
                    RegRegOp::Add => Executor::add,
                    RegRegOp::Slt => Executor::slt,
                    RegRegOp::Sltu => Executor::sltu,
                    RegRegOp::And => Executor::and,
                    RegRegOp::Or => Executor::or,
                    RegRegOp::Xor => Executor::xor,
                    RegRegOp::Sll => Executor::sll,
                    RegRegOp::Srl => Executor::srl,
                    RegRegOp::Sub => Executor::sub,
                    RegRegOp::Sra => Executor::sra,
                    RegRegOp::Mul => Executor::mul,
                    RegRegOp::Mulh => Executor::mulh,
                    RegRegOp::Mulhsu => Executor::mulhsu,
                    RegRegOp::Mulhu => Executor::mulhu,
                    RegRegOp::Div => Executor::div,
                    RegRegOp::Divu => Executor::divu,
                    RegRegOp::Rem => Executor::rem,
                    RegRegOp::Remu => Executor::remu,
                };
                op(self, dest, src1, src2)
            }
            Instruction::Jal { dest, offset } => self.jal(dest, offset),
            Instruction::Jalr { dest, base, offset } => self.jalr(dest, base, offset),
            Instruction::Branch {
                condition,
                src1,
                src2,
                offset,
            } => {
                let op = match condition {
                    BranchCondition::Beq => Executor::beq,
                    BranchCondition::Bne => Executor::bne,
                    BranchCondition::Blt => Executor::blt,
                    BranchCondition::Bltu => Executor::bltu,
                    BranchCondition::Bge => Executor::bge,
                    BranchCondition::Bgeu => Executor::bgeu,
                };
                op(self, src1, src2, offset)
            }
            Instruction::Load {
                width,
                dest,
                base,
                offset,
            } => {
                let op = match width {
                    LoadWidth::Lb => Executor::lb,
                    LoadWidth::Lh => Executor::lh,
                    LoadWidth::Lw => Executor::lw,
                    LoadWidth::Lbu => Executor::lbu,
                    LoadWidth::Lhu => Executor::lhu,
                };
                op(self, dest, base, offset)
            }
            Instruction::Store {
                width,
                src,
                base,
                offset,
            } => {
                let op = match width {
                    StoreWidth::Sb => Executor::sb,
                    StoreWidth::Sh => Executor::sh,
                    StoreWidth::Sw => Executor::sw,
                };
                op(self, src, base, offset)
            }
            Instruction::Amo {
                op,
                aq: _,
                rl: _,
                src,
                addr,
                dest,
            } => self.amo(op, dest, src, addr),
            Instruction::LoadFp { dest, base, offset } => self.flw(dest, base, offset),
            Instruction::StoreFp { src, base, offset } => self.fsw(src, base, offset),
            Instruction::FpArith {
                op,
                dest,
                src1,
                src2,
                rounding_mode: _,
            } => self.fp_arith(op, dest, src1, src2),
            Instruction::FpFused {
                op,
                dest,
                src1,
                src2,
                src3,
                rounding_mode: _,
            } => self.fp_fused(op, dest, src1, src2, src3),
            Instruction::FpSignInject {
                op,
                dest,
                src1,
                src2,
            } => self.fp_sign_inject(op, dest, src1, src2),
            Instruction::FpMinMax {
                op,
                dest,
                src1,
                src2,
            } => self.fp_min_max(op, dest, src1, src2),
            Instruction::FpConvertToInt {
                signed,
                dest,
                src,
                rounding_mode: _,
            } => self.fp_convert_to_int(signed, dest, src),
            Instruction::FpConvertFromInt {
                signed,
                dest,
                src,
                rounding_mode: _,
            } => self.fp_convert_from_int(signed, dest, src),
            Instruction::FpCompare {
                op,
                dest,
                src1,
                src2,
            } => self.fp_compare(op, dest, src1, src2),
            Instruction::FpClassify { dest, src } => self.fp_classify(dest, src),
            Instruction::FpMoveToInt { dest, src } => self.fmv_x_w(dest, src),
            Instruction::FpMoveFromInt { dest, src } => self.fmv_w_x(dest, src),
            Instruction::Fence | Instruction::FenceI => self.fence(),
            Instruction::Ecall => self.ecall(),
            Instruction::Ebreak => self.ebreak(),
            Instruction::Mret => self.mret(),
            Instruction::Csr { op, dest, csr, src } => {
                // For CSRRS and CSRRC, rs1 == x0 suppresses the modify.
                let value = (op == CsrOp::ReadWrite || src != Specifier::X0)
                    .then(|| self.state.registers.x(src));
                self.csr_op(op, dest, csr, value)
            }
            Instruction::Csri {
                op,
                dest,
                csr,
                immediate,
            } => {
                let value = (op == CsrOp::ReadWrite || immediate != 0).then_some(immediate);
                self.csr_op(op, dest, csr, value)
            }
        }
    }

    /// Executes an `addi` instruction.
    ///
    /// > ADDI adds the sign-extended 12-bit immediate to register rs1.
    /// > Arithmetic overflow is ignored and the result is simply the low XLEN
    /// > bits of the result.
    fn addi(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        trace!("executing addi {dest} {src} {immediate}");
        self.reg_imm_op(dest, src, immediate, |s, imm| s.wrapping_add_signed(imm))
    }

    /// Executes a `slti` instruction.
    ///
    /// > SLTI (set less than immediate) places the value 1 in register rd if
    /// > register rs1 is less than the sign-extended immediate when both are
    /// > treated as signed numbers, else 0 is written to rd.
    fn slti(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        trace!("executing slti {dest} {src} {immediate}");
        self.reg_imm_op(dest, src, immediate, |s, imm| ((s as i32) < imm) as u32)
    }

    /// Executes a `sltiu` instruction (unsigned compare against the
    /// sign-extended immediate).
    fn sltiu(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        trace!("executing sltiu {dest} {src} {immediate}");
        self.reg_imm_op(dest, src, immediate, |s, imm| (s < (imm as u32)) as u32)
    }

    fn xori(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        trace!("executing xori {dest} {src} {immediate}");
        self.reg_imm_op(dest, src, immediate, |s, imm| s ^ (imm as u32))
    }

    fn ori(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        trace!("executing ori {dest} {src} {immediate}");
        self.reg_imm_op(dest, src, immediate, |s, imm| s | (imm as u32))
    }

    fn andi(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        trace!("executing andi {dest} {src} {immediate}");
        self.reg_imm_op(dest, src, immediate, |s, imm| s & (imm as u32))
    }

    fn slli(&mut self, dest: Specifier, src: Specifier, shift_amount_u5: u32) -> ExecutionResult {
        trace!("executing slli {dest} {src} {shift_amount_u5}");
        self.reg_shamt_op(dest, src, shift_amount_u5, |s, shamt| s << shamt)
    }

    fn srli(&mut self, dest: Specifier, src: Specifier, shift_amount_u5: u32) -> ExecutionResult {
        trace!("executing srli {dest} {src} {shift_amount_u5}");
        self.reg_shamt_op(dest, src, shift_amount_u5, |s, shamt| s >> shamt)
    }

    /// Executes a `srai` instruction (the original sign bit is copied into
    /// the vacated upper bits).
    fn srai(&mut self, dest: Specifier, src: Specifier, shift_amount_u5: u32) -> ExecutionResult {
        trace!("executing srai {dest} {src} {shift_amount_u5}");
        self.reg_shamt_op(dest, src, shift_amount_u5, |s, shamt| {
            ((s as i32) >> shamt) as u32
        })
    }

    /// Executes a `lui` instruction.
    ///
    /// > LUI (load upper immediate) places the U-immediate value in the top
    /// > 20 bits of the destination register rd, filling in the lowest 12
    /// > bits with zeros.
    fn lui(&mut self, dest: Specifier, immediate: i32) -> ExecutionResult {
        trace!("executing lui {dest} {immediate}");
        let result = immediate as u32 & !0xFFF;
        self.state.registers.set_x(dest, result);
        self.increment_pc();
        Ok(Flow::Next)
    }

    /// Executes an `auipc` instruction.
    ///
    /// > AUIPC forms a 32-bit offset from the 20-bit U-immediate, filling in
    /// > the lowest 12 bits with zeros, adds this offset to the address of
    /// > the AUIPC instruction, then places the result in register rd.
    fn auipc(&mut self, dest: Specifier, immediate: i32) -> ExecutionResult {
        trace!("executing auipc {dest} {immediate}");
        let registers = &mut self.state.registers;
        let result = registers.pc().wrapping_add_signed(immediate & !0xFFF);
        registers.set_x(dest, result);
        self.increment_pc();
        Ok(Flow::Next)
    }

    fn add(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("executing add {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1.wrapping_add(s2))
    }

    fn sub(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("executing sub {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1.wrapping_sub(s2))
    }

    fn slt(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("executing slt {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            ((s1 as i32) < (s2 as i32)) as u32
        })
    }

    fn sltu(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("executing sltu {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| (s1 < s2) as u32)
    }

    fn and(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("executing and {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1 & s2)
    }

    fn or(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("executing or {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1 | s2)
    }

    fn xor(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("executing xor {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1 ^ s2)
    }

    /// The register shifts take their shift amount from the low 5 bits of
    /// rs2.
    fn sll(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("executing sll {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1 << (s2 & 0x1F))
    }

    fn srl(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("executing srl {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1 >> (s2 & 0x1F))
    }

    fn sra(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("executing sra {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            ((s1 as i32) >> (s2 & 0x1F)) as u32
        })
    }

    fn mul(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("executing mul {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1.wrapping_mul(s2))
    }

    /// > MULH, MULHU, and MULHSU perform the same multiplication but return
    /// > the upper XLEN bits of the full 2×XLEN-bit product, for
    /// > signed×signed, unsigned×unsigned, and signed rs1×unsigned rs2
    /// > multiplication, respectively.
    fn mulh(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("executing mulh {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            ((s1 as i32 as i64 * s2 as i32 as i64) >> 32) as u32
        })
    }

    fn mulhsu(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("executing mulhsu {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            ((s1 as i32 as i64 * s2 as i64) >> 32) as u32
        })
    }

    fn mulhu(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("executing mulhu {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            ((s1 as u64 * s2 as u64) >> 32) as u32
        })
    }

    /// Executes a `div` instruction.
    ///
    /// > The quotient of division by zero has all bits set, and the remainder
    /// > of division by zero equals the dividend. Signed division overflow
    /// > occurs only when the most-negative integer is divided by −1. The
    /// > quotient of a signed division with overflow is equal to the
    /// > dividend, and the remainder is zero.
    fn div(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("executing div {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| match s2 == 0 {
            true => 0xFFFF_FFFF,
            false => (s1 as i32).overflowing_div(s2 as i32).0 as u32,
        })
    }

    fn divu(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("executing divu {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            s1.checked_div(s2).unwrap_or(0xFFFF_FFFF)
        })
    }

    fn rem(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("executing rem {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| match s2 == 0 {
            true => s1,
            false => (s1 as i32).overflowing_rem(s2 as i32).0 as u32,
        })
    }

    fn remu(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        trace!("executing remu {dest} {src1} {src2}");
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1.checked_rem(s2).unwrap_or(s1))
    }

    fn jal(&mut self, dest: Specifier, offset: i32) -> ExecutionResult {
        trace!("executing jal {dest} {offset}");
        let target = self.state.registers.pc().wrapping_add_signed(offset);
        self.jump_to(dest, target)
    }

    /// Executes a `jalr` instruction. The computed target has its least
    /// significant bit cleared before the alignment check.
    fn jalr(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        trace!("executing jalr {dest} {base} {offset}");
        let target = self.state.registers.x(base).wrapping_add_signed(offset) & !1;
        self.jump_to(dest, target)
    }

    fn beq(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        trace!("executing beq {src1} {src2} {offset}");
        self.cond_branch(src1, src2, offset, |s1, s2| s1 == s2)
    }

    fn bne(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        trace!("executing bne {src1} {src2} {offset}");
        self.cond_branch(src1, src2, offset, |s1, s2| s1 != s2)
    }

    fn blt(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        trace!("executing blt {src1} {src2} {offset}");
        self.cond_branch(src1, src2, offset, |s1, s2| (s1 as i32) < (s2 as i32))
    }

    fn bltu(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        trace!("executing bltu {src1} {src2} {offset}");
        self.cond_branch(src1, src2, offset, |s1, s2| s1 < s2)
    }

    fn bge(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        trace!("executing bge {src1} {src2} {offset}");
        self.cond_branch(src1, src2, offset, |s1, s2| (s1 as i32) >= (s2 as i32))
    }

    fn bgeu(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        trace!("executing bgeu {src1} {src2} {offset}");
        self.cond_branch(src1, src2, offset, |s1, s2| s1 >= s2)
    }

    fn lb(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        trace!("executing lb {dest} {offset}({base})");
        self.load_op(dest, base, offset, Alignment::BYTE, |io, address| {
            io.mem_read_b(address) as i8 as u32
        })
    }

    fn lbu(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        trace!("executing lbu {dest} {offset}({base})");
        self.load_op(dest, base, offset, Alignment::BYTE, |io, address| {
            io.mem_read_b(address) as u32
        })
    }

    fn lh(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        trace!("executing lh {dest} {offset}({base})");
        self.load_op(dest, base, offset, Alignment::HALFWORD, |io, address| {
            io.mem_read_s(address) as i16 as u32
        })
    }

    fn lhu(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        trace!("executing lhu {dest} {offset}({base})");
        self.load_op(dest, base, offset, Alignment::HALFWORD, |io, address| {
            io.mem_read_s(address) as u32
        })
    }

    fn lw(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        trace!("executing lw {dest} {offset}({base})");
        self.load_op(dest, base, offset, Alignment::WORD, |io, address| {
            io.mem_read_w(address)
        })
    }

    fn sb(&mut self, src: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        trace!("executing sb {src} {offset}({base})");
        self.store_op(src, base, offset, Alignment::BYTE, |io, address, value| {
            io.mem_write_b(address, value as u8)
        })
    }

    fn sh(&mut self, src: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        trace!("executing sh {src} {offset}({base})");
        self.store_op(
            src,
            base,
            offset,
            Alignment::HALFWORD,
            |io, address, value| io.mem_write_s(address, value as u16),
        )
    }

    fn sw(&mut self, src: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        trace!("executing sw {src} {offset}({base})");
        self.store_op(src, base, offset, Alignment::WORD, |io, address, value| {
            io.mem_write_w(address, value)
        })
    }

    /// Executes the A-extension operations.
    ///
    /// The emulated core runs a single hart with no out-of-order execution,
    /// so the atomics reduce to their plain read-modify-write semantics:
    /// LR.W records a reservation placeholder, SC.W always succeeds, and the
    /// aq/rl ordering bits are ignored. The effective address is `X[rs1]`,
    /// checked for word alignment.
    fn amo(
        &mut self,
        op: AmoOp,
        dest: Specifier,
        src: Specifier,
        addr: Specifier,
    ) -> ExecutionResult {
        trace!("executing amo {dest}, {src}, ({addr})");
        let address = self.state.registers.x(addr);
        if !Alignment::WORD.is_aligned(address) {
            return Err(match op {
                AmoOp::Lr => Exception::LoadAddressMisaligned(address),
                _ => Exception::StoreAddressMisaligned(address),
            });
        }
        match op {
            AmoOp::Lr => {
                let value = self.io.mem_read_w(address);
                self.state.reservation = Some(address);
                self.state.registers.set_x(dest, value);
            }
            AmoOp::Sc => {
                // The reservation set is assumed valid: sc always succeeds.
                self.state.reservation.take();
                let value = self.state.registers.x(src);
                self.io.mem_write_w(address, value);
                self.state.registers.set_x(dest, 0);
            }
            _ => {
                let mem_value = self.io.mem_read_w(address);
                let src_value = self.state.registers.x(src);
                let new_value = match op {
                    AmoOp::Swap => src_value,
                    AmoOp::Add => mem_value.wrapping_add(src_value),
                    AmoOp::Xor => mem_value ^ src_value,
                    AmoOp::And => mem_value & src_value,
                    AmoOp::Or => mem_value | src_value,
                    AmoOp::Min => (mem_value as i32).min(src_value as i32) as u32,
                    AmoOp::Max => (mem_value as i32).max(src_value as i32) as u32,
                    AmoOp::Minu => mem_value.min(src_value),
                    AmoOp::Maxu => mem_value.max(src_value),
                    AmoOp::Lr | AmoOp::Sc => unreachable!(), // Handled above
                };
                self.io.mem_write_w(address, new_value);
                self.state.registers.set_x(dest, mem_value);
            }
        }
        self.increment_pc();
        Ok(Flow::Next)
    }

    /// Executes a `flw` instruction: the loaded bit pattern lands in the
    /// float register unmodified.
    fn flw(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        trace!("executing flw {dest} {offset}({base})");
        let address = self.state.registers.x(base).wrapping_add_signed(offset);
        if !Alignment::WORD.is_aligned(address) {
            return Err(Exception::LoadAddressMisaligned(address));
        }
        let bits = self.io.mem_read_w(address);
        self.state.fregisters.set_bits(dest, bits);
        self.increment_pc();
        Ok(Flow::Next)
    }

    /// Executes a `fsw` instruction: the float register's bit pattern is
    /// stored unmodified.
    fn fsw(&mut self, src: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        trace!("executing fsw {src} {offset}({base})");
        let address = self.state.registers.x(base).wrapping_add_signed(offset);
        if !Alignment::WORD.is_aligned(address) {
            return Err(Exception::StoreAddressMisaligned(address));
        }
        let bits = self.state.fregisters.bits(src);
        self.io.mem_write_w(address, bits);
        self.increment_pc();
        Ok(Flow::Next)
    }

    /// Executes the single-precision add/sub/mul/div/sqrt group.
    ///
    /// Results that are NaN are stored as the canonical NaN so host-FPU
    /// payloads never reach the register file. Exception flags accrue into
    /// `fcsr.fflags`.
    fn fp_arith(
        &mut self,
        op: FpArithOp,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
    ) -> ExecutionResult {
        trace!("executing fp arith {dest} {src1} {src2}");
        let a_bits = self.state.fregisters.bits(src1);
        let b_bits = self.state.fregisters.bits(src2);
        let a = f32::from_bits(a_bits);
        let b = f32::from_bits(b_bits);
        let mut flags = 0;
        let result = match op {
            FpArithOp::Add => a + b,
            FpArithOp::Sub => a - b,
            FpArithOp::Mul => a * b,
            FpArithOp::Div => a / b,
            FpArithOp::Sqrt => a.sqrt(),
        };
        if is_signalling_nan(a_bits) || (op != FpArithOp::Sqrt && is_signalling_nan(b_bits)) {
            flags |= FFLAG_INVALID_OP;
        }
        match op {
            FpArithOp::Sqrt => {
                if a < 0.0 {
                    flags |= FFLAG_INVALID_OP;
                }
            }
            FpArithOp::Div => {
                if b == 0.0 && !a.is_nan() && a != 0.0 && a.is_finite() {
                    flags |= FFLAG_DIV_BY_ZERO;
                }
                if result.is_nan() && !a.is_nan() && !b.is_nan() {
                    // 0/0 and inf/inf.
                    flags |= FFLAG_INVALID_OP;
                }
                // A finite quotient rounding to infinity is an overflow; an
                // exact infinity from division by zero is not.
                if result.is_infinite() && a.is_finite() && b.is_finite() && b != 0.0 {
                    flags |= FFLAG_OVERFLOW | FFLAG_INEXACT;
                }
            }
            _ => {
                if result.is_nan() && !a.is_nan() && !b.is_nan() {
                    // inf - inf and 0 * inf.
                    flags |= FFLAG_INVALID_OP;
                }
                if result.is_infinite() && a.is_finite() && b.is_finite() {
                    flags |= FFLAG_OVERFLOW | FFLAG_INEXACT;
                }
            }
        }
        self.state.fregisters.set_bits(dest, canonicalize(result));
        self.state.csrs.accrue_fflags(flags);
        self.increment_pc();
        Ok(Flow::Next)
    }

    /// Executes the fused multiply-add family. The multiplication and
    /// addition round once, as the host's fused `mul_add` does.
    fn fp_fused(
        &mut self,
        op: FpFusedOp,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
        src3: Specifier,
    ) -> ExecutionResult {
        trace!("executing fp fused {dest} {src1} {src2} {src3}");
        let a_bits = self.state.fregisters.bits(src1);
        let b_bits = self.state.fregisters.bits(src2);
        let c_bits = self.state.fregisters.bits(src3);
        let a = f32::from_bits(a_bits);
        let b = f32::from_bits(b_bits);
        let c = f32::from_bits(c_bits);
        let result = match op {
            FpFusedOp::Madd => a.mul_add(b, c),
            FpFusedOp::Msub => a.mul_add(b, -c),
            FpFusedOp::Nmsub => (-a).mul_add(b, c),
            FpFusedOp::Nmadd => (-a).mul_add(b, -c),
        };
        let mut flags = 0;
        if [a_bits, b_bits, c_bits].iter().any(|&bits| is_signalling_nan(bits)) {
            flags |= FFLAG_INVALID_OP;
        }
        if result.is_nan() && !a.is_nan() && !b.is_nan() && !c.is_nan() {
            // inf * 0, or the product cancelling an opposite infinity.
            flags |= FFLAG_INVALID_OP;
        }
        if result.is_infinite() && a.is_finite() && b.is_finite() && c.is_finite() {
            flags |= FFLAG_OVERFLOW | FFLAG_INEXACT;
        }
        self.state.fregisters.set_bits(dest, canonicalize(result));
        self.state.csrs.accrue_fflags(flags);
        self.increment_pc();
        Ok(Flow::Next)
    }

    /// Executes the sign-injection group on raw bit patterns.
    fn fp_sign_inject(
        &mut self,
        op: FpSignInjectOp,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
    ) -> ExecutionResult {
        trace!("executing fp sign inject {dest} {src1} {src2}");
        let a = self.state.fregisters.bits(src1);
        let b = self.state.fregisters.bits(src2);
        let result = match op {
            FpSignInjectOp::Sgnj => a & !FLOAT_SIGN_BIT | b & FLOAT_SIGN_BIT,
            FpSignInjectOp::Sgnjn => a & !FLOAT_SIGN_BIT | !b & FLOAT_SIGN_BIT,
            FpSignInjectOp::Sgnjx => a ^ b & FLOAT_SIGN_BIT,
        };
        self.state.fregisters.set_bits(dest, result);
        self.increment_pc();
        Ok(Flow::Next)
    }

    /// Executes `fmin.s`/`fmax.s`.
    ///
    /// If both inputs are NaN the result is the canonical NaN; if only one
    /// is, the result is the other input. A signalling NaN input raises the
    /// invalid-operation flag. `-0.0` orders before `+0.0`.
    fn fp_min_max(
        &mut self,
        op: FpMinMaxOp,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
    ) -> ExecutionResult {
        trace!("executing fp min/max {dest} {src1} {src2}");
        let a_bits = self.state.fregisters.bits(src1);
        let b_bits = self.state.fregisters.bits(src2);
        let a = f32::from_bits(a_bits);
        let b = f32::from_bits(b_bits);
        if is_signalling_nan(a_bits) || is_signalling_nan(b_bits) {
            self.state.csrs.accrue_fflags(FFLAG_INVALID_OP);
        }
        let result = match (a.is_nan(), b.is_nan()) {
            (true, true) => CANONICAL_NAN,
            (true, false) => b_bits,
            (false, true) => a_bits,
            (false, false) => {
                let take_a = if a == b {
                    // Distinguish the zero signs: min takes -0.0, max +0.0.
                    match op {
                        FpMinMaxOp::Min => a_bits & FLOAT_SIGN_BIT != 0,
                        FpMinMaxOp::Max => a_bits & FLOAT_SIGN_BIT == 0,
                    }
                } else {
                    match op {
                        FpMinMaxOp::Min => a < b,
                        FpMinMaxOp::Max => a > b,
                    }
                };
                if take_a {
                    a_bits
                } else {
                    b_bits
                }
            }
        };
        self.state.fregisters.set_bits(dest, result);
        self.increment_pc();
        Ok(Flow::Next)
    }

    /// Executes `fcvt.w.s` / `fcvt.wu.s`, rounding toward zero. Out-of-range
    /// values (including NaN) clamp to the nearest representable bound and
    /// raise invalid-operation.
    fn fp_convert_to_int(&mut self, signed: bool, dest: Specifier, src: Specifier) -> ExecutionResult {
        trace!("executing fcvt to int {dest} {src}");
        let a = self.state.fregisters.f(src);
        let mut flags = 0;
        let result = match signed {
            true => convert_to_i32(a, &mut flags),
            false => convert_to_u32(a, &mut flags),
        };
        self.state.registers.set_x(dest, result);
        self.state.csrs.accrue_fflags(flags);
        self.increment_pc();
        Ok(Flow::Next)
    }

    /// Executes `fcvt.s.w` / `fcvt.s.wu`. Values that don't fit the 24-bit
    /// significand round and raise inexact.
    fn fp_convert_from_int(
        &mut self,
        signed: bool,
        dest: Specifier,
        src: Specifier,
    ) -> ExecutionResult {
        trace!("executing fcvt from int {dest} {src}");
        let value = self.state.registers.x(src);
        let result = match signed {
            true => value as i32 as f32,
            false => value as f32,
        };
        let exact = match signed {
            true => result as f64 == value as i32 as f64,
            false => result as f64 == value as f64,
        };
        if !exact {
            self.state.csrs.accrue_fflags(FFLAG_INEXACT);
        }
        self.state.fregisters.set_f(dest, result);
        self.increment_pc();
        Ok(Flow::Next)
    }

    /// Executes `feq.s`/`flt.s`/`fle.s`, writing 0 or 1 to the integer
    /// destination. FEQ is quiet (only signalling NaNs raise invalid), FLT
    /// and FLE are signalling (any NaN raises invalid).
    fn fp_compare(
        &mut self,
        op: FpCompareOp,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
    ) -> ExecutionResult {
        trace!("executing fp compare {dest} {src1} {src2}");
        let a_bits = self.state.fregisters.bits(src1);
        let b_bits = self.state.fregisters.bits(src2);
        let a = f32::from_bits(a_bits);
        let b = f32::from_bits(b_bits);
        let invalid = match op {
            FpCompareOp::Eq => is_signalling_nan(a_bits) || is_signalling_nan(b_bits),
            FpCompareOp::Lt | FpCompareOp::Le => a.is_nan() || b.is_nan(),
        };
        if invalid {
            self.state.csrs.accrue_fflags(FFLAG_INVALID_OP);
        }
        let result = match op {
            FpCompareOp::Eq => a == b,
            FpCompareOp::Lt => a < b,
            FpCompareOp::Le => a <= b,
        };
        self.state.registers.set_x(dest, result as u32);
        self.increment_pc();
        Ok(Flow::Next)
    }

    /// Executes `fclass.s`, writing the standard 10-bit classification mask.
    fn fp_classify(&mut self, dest: Specifier, src: Specifier) -> ExecutionResult {
        trace!("executing fclass {dest} {src}");
        let mask = classify(self.state.fregisters.bits(src));
        self.state.registers.set_x(dest, mask);
        self.increment_pc();
        Ok(Flow::Next)
    }

    fn fmv_x_w(&mut self, dest: Specifier, src: Specifier) -> ExecutionResult {
        trace!("executing fmv.x.w {dest} {src}");
        let bits = self.state.fregisters.bits(src);
        self.state.registers.set_x(dest, bits);
        self.increment_pc();
        Ok(Flow::Next)
    }

    fn fmv_w_x(&mut self, dest: Specifier, src: Specifier) -> ExecutionResult {
        trace!("executing fmv.w.x {dest} {src}");
        let bits = self.state.registers.x(src);
        self.state.fregisters.set_bits(dest, bits);
        self.increment_pc();
        Ok(Flow::Next)
    }

    /// FENCE and FENCE.I order nothing on a single hart; both just advance
    /// pc.
    fn fence(&mut self) -> ExecutionResult {
        trace!("executing fence");
        self.increment_pc();
        Ok(Flow::Next)
    }

    /// Executes an `ecall` instruction: the host callback services the call,
    /// then pc advances past the instruction.
    fn ecall(&mut self) -> ExecutionResult {
        trace!("executing ecall");
        self.io.on_ecall(self.state);
        self.increment_pc();
        Ok(Flow::Next)
    }

    fn ebreak(&mut self) -> ExecutionResult {
        trace!("executing ebreak");
        self.io.on_ebreak(self.state);
        self.increment_pc();
        Ok(Flow::Next)
    }

    /// Executes an `mret` instruction: pc returns to `mepc` and the step
    /// loop exits as for any other control transfer.
    fn mret(&mut self) -> ExecutionResult {
        trace!("executing mret");
        let mepc = self.state.csrs.read(super::csr::MEPC);
        *self.state.registers.pc_mut() = mepc;
        Ok(Flow::Branch)
    }

    /// Uniform CSR read-modify-write.
    ///
    /// > The CSRRW (Atomic Read/Write CSR) instruction atomically swaps
    /// > values in the CSRs and integer registers. [...] CSRRS and CSRRC
    /// > always read the addressed CSR and cause any read side effects
    /// > regardless of rs1 and rd fields.
    ///
    /// `value` is `None` when the modify is suppressed (rs1 = x0 for the
    /// register forms, a zero immediate for the immediate forms). The
    /// writeback to `dest` is structurally suppressed for x0 by the register
    /// file. Writes to read-only addresses are silently ignored by the CSR
    /// file.
    fn csr_op(
        &mut self,
        op: CsrOp,
        dest: Specifier,
        csr: crate::hart::csr::CsrSpecifier,
        value: Option<u32>,
    ) -> ExecutionResult {
        trace!("executing csr op {dest} {csr:#05x}");
        let old_value = self.state.csrs.read(csr);
        self.state.registers.set_x(dest, old_value);
        if let Some(value) = value {
            let new_value = match op {
                CsrOp::ReadWrite => value,
                CsrOp::ReadSet => old_value | value,
                CsrOp::ReadClear => old_value & !value,
            };
            self.state.csrs.write(csr, new_value);
        }
        self.increment_pc();
        Ok(Flow::Next)
    }

    // Private generic implementations

    fn increment_pc(&mut self) {
        let len = self.state.insn_len;
        let pc = self.state.registers.pc_mut();
        *pc = pc.wrapping_add(len);
    }

    fn reg_imm_op<F>(
        &mut self,
        dest: Specifier,
        src: Specifier,
        immediate: i32,
        op: F,
    ) -> ExecutionResult
    where
        F: FnOnce(u32, i32) -> u32,
    {
        let registers = &mut self.state.registers;
        registers.set_x(dest, op(registers.x(src), immediate));
        self.increment_pc();
        Ok(Flow::Next)
    }

    fn reg_shamt_op<F>(
        &mut self,
        dest: Specifier,
        src: Specifier,
        shift_amount_u5: u32,
        op: F,
    ) -> ExecutionResult
    where
        F: FnOnce(u32, u32) -> u32,
    {
        if shift_amount_u5 > 31 {
            panic!("out of range u5 used");
        }
        let registers = &mut self.state.registers;
        registers.set_x(dest, op(registers.x(src), shift_amount_u5));
        self.increment_pc();
        Ok(Flow::Next)
    }

    fn reg_reg_op<F>(
        &mut self,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
        op: F,
    ) -> ExecutionResult
    where
        F: FnOnce(u32, u32) -> u32,
    {
        let registers = &mut self.state.registers;
        registers.set_x(dest, op(registers.x(src1), registers.x(src2)));
        self.increment_pc();
        Ok(Flow::Next)
    }

    /// Common path for jal/jalr. The link register is written only after the
    /// target passes the alignment check, so a trapping jump leaves the
    /// register file untouched; `mepc` is the pc of the jump itself.
    fn jump_to(&mut self, dest: Specifier, target: u32) -> ExecutionResult {
        let pc = self.state.registers.pc();
        if !self.state.isa.pc_alignment().is_aligned(target) {
            return Err(Exception::InstructionAddressMisaligned {
                branch_pc: pc,
                target,
            });
        }
        let return_address = pc.wrapping_add(self.state.insn_len);
        let registers = &mut self.state.registers;
        *registers.pc_mut() = target;
        registers.set_x(dest, return_address);
        Ok(Flow::Branch)
    }

    /// Takes the branch if `predicate` returns `true`. The taken target is
    /// checked against the profile's pc alignment; `mepc` on a misaligned
    /// target is the branch's own pc and `mtval` the target.
    fn cond_branch<P>(
        &mut self,
        src1: Specifier,
        src2: Specifier,
        offset: i32,
        predicate: P,
    ) -> ExecutionResult
    where
        P: FnOnce(u32, u32) -> bool,
    {
        let registers = &mut self.state.registers;
        if predicate(registers.x(src1), registers.x(src2)) {
            let pc = registers.pc();
            let target = pc.wrapping_add_signed(offset);
            if !self.state.isa.pc_alignment().is_aligned(target) {
                return Err(Exception::InstructionAddressMisaligned {
                    branch_pc: pc,
                    target,
                });
            }
            *self.state.registers.pc_mut() = target;
        } else {
            self.increment_pc();
        }
        Ok(Flow::Branch)
    }

    fn load_op<F>(
        &mut self,
        dest: Specifier,
        base: Specifier,
        offset: i32,
        alignment: Alignment,
        read: F,
    ) -> ExecutionResult
    where
        F: FnOnce(&mut S, u32) -> u32,
    {
        let address = self.state.registers.x(base).wrapping_add_signed(offset);
        if !alignment.is_aligned(address) {
            return Err(Exception::LoadAddressMisaligned(address));
        }
        let value = read(&mut *self.io, address);
        self.state.registers.set_x(dest, value);
        self.increment_pc();
        Ok(Flow::Next)
    }

    fn store_op<F>(
        &mut self,
        src: Specifier,
        base: Specifier,
        offset: i32,
        alignment: Alignment,
        write: F,
    ) -> ExecutionResult
    where
        F: FnOnce(&mut S, u32, u32),
    {
        let registers = &self.state.registers;
        let address = registers.x(base).wrapping_add_signed(offset);
        let value = registers.x(src);
        if !alignment.is_aligned(address) {
            return Err(Exception::StoreAddressMisaligned(address));
        }
        write(&mut *self.io, address, value);
        self.increment_pc();
        Ok(Flow::Next)
    }
}

/// Returns `true` for a signalling NaN bit pattern (quiet bit clear).
fn is_signalling_nan(bits: u32) -> bool {
    let exponent = bits >> 23 & 0xFF;
    let mantissa = bits & 0x007F_FFFF;
    exponent == 0xFF && mantissa != 0 && mantissa & 0x0040_0000 == 0
}

/// Replaces any NaN result by the canonical NaN bit pattern.
fn canonicalize(value: f32) -> u32 {
    match value.is_nan() {
        true => CANONICAL_NAN,
        false => value.to_bits(),
    }
}

/// Round-toward-zero conversion to i32 with RISC-V clamping.
fn convert_to_i32(value: f32, flags: &mut u32) -> u32 {
    if value.is_nan() {
        *flags |= FFLAG_INVALID_OP;
        return i32::MAX as u32;
    }
    let truncated = value.trunc();
    if truncated >= 2_147_483_648.0 {
        *flags |= FFLAG_INVALID_OP;
        i32::MAX as u32
    } else if truncated < -2_147_483_648.0 {
        *flags |= FFLAG_INVALID_OP;
        i32::MIN as u32
    } else {
        if truncated != value {
            *flags |= FFLAG_INEXACT;
        }
        truncated as i32 as u32
    }
}

/// Round-toward-zero conversion to u32 with RISC-V clamping.
fn convert_to_u32(value: f32, flags: &mut u32) -> u32 {
    if value.is_nan() {
        *flags |= FFLAG_INVALID_OP;
        return u32::MAX;
    }
    let truncated = value.trunc();
    if truncated >= 4_294_967_296.0 {
        *flags |= FFLAG_INVALID_OP;
        u32::MAX
    } else if truncated <= -1.0 {
        *flags |= FFLAG_INVALID_OP;
        0
    } else {
        if truncated != value {
            *flags |= FFLAG_INEXACT;
        }
        truncated as u32
    }
}

/// The standard 10-bit FCLASS.S mask.
fn classify(bits: u32) -> u32 {
    let negative = bits & FLOAT_SIGN_BIT != 0;
    let exponent = bits >> 23 & 0xFF;
    let mantissa = bits & 0x007F_FFFF;
    match (exponent, mantissa) {
        (0xFF, 0) => match negative {
            true => 1 << 0,  // -inf
            false => 1 << 7, // +inf
        },
        (0xFF, m) => match m & 0x0040_0000 != 0 {
            true => 1 << 9,  // quiet NaN
            false => 1 << 8, // signalling NaN
        },
        (0, 0) => match negative {
            true => 1 << 3,  // -0
            false => 1 << 4, // +0
        },
        (0, _) => match negative {
            true => 1 << 2,  // negative subnormal
            false => 1 << 5, // positive subnormal
        },
        _ => match negative {
            true => 1 << 1,  // negative normal
            false => 1 << 6, // positive normal
        },
    }
}

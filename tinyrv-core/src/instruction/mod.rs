//! Instruction decoding for RV32IMAFC + Zicsr + Zifencei.
//!
//! A fetched parcel whose low two bits are `0b11` is a 32-bit instruction;
//! anything else is a 16-bit compressed instruction, which decodes by
//! expansion to its uncompressed counterpart (see [`compressed`]). Encodings
//! belonging to a disabled extension, and reserved code points, map to a
//! [`DecodeError`]; the interpreter raises those as illegal-instruction
//! exceptions on execution.

mod compressed;

use crate::hart::csr::CsrSpecifier;
use crate::registers::Specifier;
use crate::Isa;
use log::trace;
use thiserror::Error;

/// Width in bytes of an encoded instruction.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InstructionLength {
    /// A 16-bit compressed instruction.
    Two = 2,
    /// A standard 32-bit instruction.
    Four = 4,
}

impl From<InstructionLength> for u32 {
    fn from(value: InstructionLength) -> Self {
        value as u32
    }
}

/// Data structure that can hold any supported instruction in its decoded form.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Instruction {
    OpImm {
        op: RegImmOp,
        dest: Specifier,
        src: Specifier,
        immediate: i32,
    },
    OpShiftImm {
        op: RegShiftImmOp,
        dest: Specifier,
        src: Specifier,
        shift_amount_u5: u32,
    },
    Auipc {
        dest: Specifier,
        immediate: i32,
    },
    Lui {
        dest: Specifier,
        immediate: i32,
    },
    Op {
        op: RegRegOp,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
    },
    Jal {
        dest: Specifier,
        offset: i32,
    },
    Jalr {
        dest: Specifier,
        base: Specifier,
        offset: i32,
    },
    Branch {
        condition: BranchCondition,
        src1: Specifier,
        src2: Specifier,
        offset: i32,
    },
    Load {
        width: LoadWidth,
        dest: Specifier,
        base: Specifier,
        offset: i32,
    },
    Store {
        width: StoreWidth,
        src: Specifier,
        base: Specifier,
        offset: i32,
    },
    Amo {
        op: AmoOp,
        aq: bool,
        rl: bool,
        src: Specifier,
        addr: Specifier,
        dest: Specifier,
    },
    /// FLW: load a word into a float register, bit pattern preserved.
    LoadFp {
        dest: Specifier,
        base: Specifier,
        offset: i32,
    },
    /// FSW: store a float register's bit pattern as a word.
    StoreFp {
        src: Specifier,
        base: Specifier,
        offset: i32,
    },
    FpArith {
        op: FpArithOp,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
        rounding_mode: u32,
    },
    /// The R4-type fused multiply-add family.
    FpFused {
        op: FpFusedOp,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
        src3: Specifier,
        rounding_mode: u32,
    },
    FpSignInject {
        op: FpSignInjectOp,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
    },
    FpMinMax {
        op: FpMinMaxOp,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
    },
    /// FCVT.W.S / FCVT.WU.S: float to (un)signed 32-bit integer.
    FpConvertToInt {
        signed: bool,
        dest: Specifier,
        src: Specifier,
        rounding_mode: u32,
    },
    /// FCVT.S.W / FCVT.S.WU: (un)signed 32-bit integer to float.
    FpConvertFromInt {
        signed: bool,
        dest: Specifier,
        src: Specifier,
        rounding_mode: u32,
    },
    FpCompare {
        op: FpCompareOp,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
    },
    /// FCLASS.S: write the 10-bit classification mask of `src` to `dest`.
    FpClassify {
        dest: Specifier,
        src: Specifier,
    },
    /// FMV.X.W: move a float register's raw bits to an integer register.
    FpMoveToInt {
        dest: Specifier,
        src: Specifier,
    },
    /// FMV.W.X: move an integer register's raw bits to a float register.
    FpMoveFromInt {
        dest: Specifier,
        src: Specifier,
    },
    Fence,
    FenceI,
    Ecall,
    Ebreak,
    Mret,
    Csr {
        op: CsrOp,
        dest: Specifier,
        csr: CsrSpecifier,
        src: Specifier,
    },
    Csri {
        op: CsrOp,
        dest: Specifier,
        csr: CsrSpecifier,
        immediate: u32,
    },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegImmOp {
    Addi,
    Slti,
    Sltiu,
    Xori,
    Ori,
    Andi,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegShiftImmOp {
    Slli,
    Srli,
    Srai,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegRegOp {
    Add,
    Slt,
    Sltu,
    And,
    Or,
    Xor,
    Sll,
    Srl,
    Sub,
    Sra,
    Mul,
    Mulh,
    Mulhsu,
    Mulhu,
    Div,
    Divu,
    Rem,
    Remu,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BranchCondition {
    Beq,
    Bne,
    Blt,
    Bltu,
    Bge,
    Bgeu,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LoadWidth {
    Lb,
    Lh,
    Lw,
    Lbu,
    Lhu,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StoreWidth {
    Sb,
    Sh,
    Sw,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AmoOp {
    Lr,
    Sc,
    Swap,
    Add,
    Xor,
    And,
    Or,
    Min,
    Max,
    Minu,
    Maxu,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FpArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Sqrt,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FpFusedOp {
    /// FMADD.S: `src1 * src2 + src3`.
    Madd,
    /// FMSUB.S: `src1 * src2 - src3`.
    Msub,
    /// FNMSUB.S: `-(src1 * src2) + src3`.
    Nmsub,
    /// FNMADD.S: `-(src1 * src2) - src3`.
    Nmadd,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FpSignInjectOp {
    /// Take the sign bit of `src2` as-is.
    Sgnj,
    /// Take the negated sign bit of `src2`.
    Sgnjn,
    /// Xor the sign bits of `src1` and `src2`.
    Sgnjx,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FpMinMaxOp {
    Min,
    Max,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FpCompareOp {
    /// FEQ.S: quiet comparison.
    Eq,
    /// FLT.S: signalling comparison.
    Lt,
    /// FLE.S: signalling comparison.
    Le,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CsrOp {
    /// Atomic Read/Write CSR.
    ReadWrite,
    /// Atomic Read and Set Bits in CSR.
    ReadSet,
    /// Atomic Read and Clear Bits in CSR.
    ReadClear,
}

impl Instruction {
    /// Decodes a fetched parcel under the given ISA profile.
    ///
    /// Returns the decoded instruction together with its encoded length, so
    /// the interpreter can advance pc without re-inspecting the raw bits.
    pub fn decode(
        raw_instruction: u32,
        isa: &Isa,
    ) -> Result<(Self, InstructionLength), DecodeError> {
        trace!("Decoding instruction {raw_instruction:#010x}");
        if raw_instruction & 0b11 == 0b11 {
            Self::decode_32(raw_instruction, isa).map(|i| (i, InstructionLength::Four))
        } else {
            if !isa.c {
                return Err(DecodeError::UnsupportedExtension);
            }
            compressed::decode(raw_instruction as u16, isa).map(|i| (i, InstructionLength::Two))
        }
    }

    /// Returns `true` if this instruction can redirect control flow, i.e. if
    /// a basic block must end after it.
    pub fn is_control_transfer(&self) -> bool {
        matches!(
            self,
            Self::Branch { .. }
                | Self::Jal { .. }
                | Self::Jalr { .. }
                | Self::Ecall
                | Self::Ebreak
                | Self::Mret
        )
    }

    fn decode_32(raw_instruction: u32, isa: &Isa) -> Result<Self, DecodeError> {
        match opcode(raw_instruction).ok_or(DecodeError::UnsupportedOpcode)? {
            Opcode::OpImm => match i_funct(raw_instruction) {
                Some(op) => Ok(Self::OpImm {
                    op,
                    dest: rd(raw_instruction),
                    src: rs1(raw_instruction),
                    immediate: i_imm(raw_instruction),
                }),
                None => match i_shfunct(raw_instruction) {
                    Some(op) => Ok(Self::OpShiftImm {
                        op,
                        dest: rd(raw_instruction),
                        src: rs1(raw_instruction),
                        shift_amount_u5: shamt(raw_instruction),
                    }),
                    None => Err(DecodeError::IllegalInstruction),
                },
            },
            Opcode::Auipc => Ok(Self::Auipc {
                dest: rd(raw_instruction),
                immediate: u_imm(raw_instruction),
            }),
            Opcode::Lui => Ok(Self::Lui {
                dest: rd(raw_instruction),
                immediate: u_imm(raw_instruction),
            }),
            Opcode::Op => match r_funct(raw_instruction) {
                Some(op) => {
                    if op.is_muldiv() && !isa.m {
                        return Err(DecodeError::UnsupportedExtension);
                    }
                    Ok(Self::Op {
                        op,
                        dest: rd(raw_instruction),
                        src1: rs1(raw_instruction),
                        src2: rs2(raw_instruction),
                    })
                }
                None => Err(DecodeError::IllegalInstruction),
            },
            Opcode::Jal => Ok(Self::Jal {
                dest: rd(raw_instruction),
                offset: j_imm(raw_instruction),
            }),
            Opcode::Jalr => match funct3(raw_instruction) {
                0b000 => Ok(Self::Jalr {
                    dest: rd(raw_instruction),
                    base: rs1(raw_instruction),
                    offset: i_imm(raw_instruction),
                }),
                _ => Err(DecodeError::IllegalInstruction),
            },
            Opcode::Branch => match b_funct(raw_instruction) {
                Some(condition) => Ok(Self::Branch {
                    condition,
                    src1: rs1(raw_instruction),
                    src2: rs2(raw_instruction),
                    offset: b_imm(raw_instruction),
                }),
                None => Err(DecodeError::IllegalInstruction),
            },
            Opcode::Load => match i_width(raw_instruction) {
                Some(width) => Ok(Self::Load {
                    width,
                    dest: rd(raw_instruction),
                    base: rs1(raw_instruction),
                    offset: i_imm(raw_instruction),
                }),
                None => Err(DecodeError::IllegalInstruction),
            },
            Opcode::Store => match s_width(raw_instruction) {
                Some(width) => Ok(Self::Store {
                    width,
                    src: rs2(raw_instruction),
                    base: rs1(raw_instruction),
                    offset: s_imm(raw_instruction),
                }),
                None => Err(DecodeError::IllegalInstruction),
            },
            Opcode::Amo => {
                if !isa.a {
                    return Err(DecodeError::UnsupportedExtension);
                }
                match amo_op(raw_instruction) {
                    Some(op) => Ok(Self::Amo {
                        op,
                        aq: amo_aq(raw_instruction),
                        rl: amo_rl(raw_instruction),
                        src: rs2(raw_instruction),
                        addr: rs1(raw_instruction),
                        dest: rd(raw_instruction),
                    }),
                    None => Err(DecodeError::IllegalInstruction),
                }
            }
            Opcode::LoadFp => {
                if !isa.f {
                    return Err(DecodeError::UnsupportedExtension);
                }
                match funct3(raw_instruction) {
                    0b010 => Ok(Self::LoadFp {
                        dest: rd(raw_instruction),
                        base: rs1(raw_instruction),
                        offset: i_imm(raw_instruction),
                    }),
                    _ => Err(DecodeError::IllegalInstruction),
                }
            }
            Opcode::StoreFp => {
                if !isa.f {
                    return Err(DecodeError::UnsupportedExtension);
                }
                match funct3(raw_instruction) {
                    0b010 => Ok(Self::StoreFp {
                        src: rs2(raw_instruction),
                        base: rs1(raw_instruction),
                        offset: s_imm(raw_instruction),
                    }),
                    _ => Err(DecodeError::IllegalInstruction),
                }
            }
            Opcode::OpFp => {
                if !isa.f {
                    return Err(DecodeError::UnsupportedExtension);
                }
                decode_op_fp(raw_instruction)
            }
            op @ (Opcode::Madd | Opcode::Msub | Opcode::Nmsub | Opcode::Nmadd) => {
                if !isa.f {
                    return Err(DecodeError::UnsupportedExtension);
                }
                if r4_fmt(raw_instruction) != 0b00 {
                    // Only the single-precision format is supported.
                    return Err(DecodeError::IllegalInstruction);
                }
                let op = match op {
                    Opcode::Madd => FpFusedOp::Madd,
                    Opcode::Msub => FpFusedOp::Msub,
                    Opcode::Nmsub => FpFusedOp::Nmsub,
                    _ => FpFusedOp::Nmadd,
                };
                Ok(Self::FpFused {
                    op,
                    dest: rd(raw_instruction),
                    src1: rs1(raw_instruction),
                    src2: rs2(raw_instruction),
                    src3: r4_rs3(raw_instruction),
                    rounding_mode: funct3(raw_instruction) as u32,
                })
            }
            Opcode::MiscMem => {
                if !isa.zifencei {
                    return Err(DecodeError::UnsupportedExtension);
                }
                match funct3(raw_instruction) {
                    // All unused FENCE fields (fm, predecessor/successor sets,
                    // rs1, rd) are reserved for future use and must execute as
                    // a normal fence, which is a no-op on a single hart.
                    0b000 => Ok(Self::Fence),
                    0b001 => Ok(Self::FenceI),
                    _ => Err(DecodeError::IllegalInstruction),
                }
            }
            Opcode::System => decode_system(raw_instruction, isa),
        }
    }
}

fn decode_system(raw_instruction: u32, isa: &Isa) -> Result<Instruction, DecodeError> {
    let sys = match funct3(raw_instruction) {
        0b000 => {
            return match funct12(raw_instruction) {
                0x000 => Ok(Instruction::Ecall),
                0x001 => Ok(Instruction::Ebreak),
                0x302 => Ok(Instruction::Mret),
                // URET, SRET, HRET, and WFI are not supported; they decode as
                // illegal instructions like every other reserved funct12.
                _ => Err(DecodeError::IllegalInstruction),
            };
        }
        0b001 => CsrOp::ReadWrite,
        0b010 => CsrOp::ReadSet,
        0b011 => CsrOp::ReadClear,
        0b101 => CsrOp::ReadWrite,
        0b110 => CsrOp::ReadSet,
        0b111 => CsrOp::ReadClear,
        _ => return Err(DecodeError::IllegalInstruction),
    };
    if !isa.zicsr {
        return Err(DecodeError::UnsupportedExtension);
    }
    if funct3(raw_instruction) & 0b100 == 0 {
        Ok(Instruction::Csr {
            op: sys,
            dest: rd(raw_instruction),
            csr: csr(raw_instruction),
            src: rs1(raw_instruction),
        })
    } else {
        Ok(Instruction::Csri {
            op: sys,
            dest: rd(raw_instruction),
            csr: csr(raw_instruction),
            immediate: u32::from(rs1(raw_instruction)),
        })
    }
}

/// Decodes the OP-FP major opcode (single-precision compute, convert,
/// compare, classify, and move instructions).
fn decode_op_fp(raw_instruction: u32) -> Result<Instruction, DecodeError> {
    let dest = rd(raw_instruction);
    let src1 = rs1(raw_instruction);
    let src2 = rs2(raw_instruction);
    let rm = funct3(raw_instruction) as u32;
    let arith = |op| {
        Ok(Instruction::FpArith {
            op,
            dest,
            src1,
            src2,
            rounding_mode: rm,
        })
    };
    match funct7(raw_instruction) {
        0b0000000 => arith(FpArithOp::Add),
        0b0000100 => arith(FpArithOp::Sub),
        0b0001000 => arith(FpArithOp::Mul),
        0b0001100 => arith(FpArithOp::Div),
        0b0101100 => match u8::from(src2) {
            0 => arith(FpArithOp::Sqrt),
            _ => Err(DecodeError::IllegalInstruction),
        },
        0b0010000 => {
            let op = match funct3(raw_instruction) {
                0b000 => FpSignInjectOp::Sgnj,
                0b001 => FpSignInjectOp::Sgnjn,
                0b010 => FpSignInjectOp::Sgnjx,
                _ => return Err(DecodeError::IllegalInstruction),
            };
            Ok(Instruction::FpSignInject {
                op,
                dest,
                src1,
                src2,
            })
        }
        0b0010100 => {
            let op = match funct3(raw_instruction) {
                0b000 => FpMinMaxOp::Min,
                0b001 => FpMinMaxOp::Max,
                _ => return Err(DecodeError::IllegalInstruction),
            };
            Ok(Instruction::FpMinMax {
                op,
                dest,
                src1,
                src2,
            })
        }
        0b1100000 => match u8::from(src2) {
            0 => Ok(Instruction::FpConvertToInt {
                signed: true,
                dest,
                src: src1,
                rounding_mode: rm,
            }),
            1 => Ok(Instruction::FpConvertToInt {
                signed: false,
                dest,
                src: src1,
                rounding_mode: rm,
            }),
            _ => Err(DecodeError::IllegalInstruction),
        },
        0b1101000 => match u8::from(src2) {
            0 => Ok(Instruction::FpConvertFromInt {
                signed: true,
                dest,
                src: src1,
                rounding_mode: rm,
            }),
            1 => Ok(Instruction::FpConvertFromInt {
                signed: false,
                dest,
                src: src1,
                rounding_mode: rm,
            }),
            _ => Err(DecodeError::IllegalInstruction),
        },
        0b1010000 => {
            let op = match funct3(raw_instruction) {
                0b010 => FpCompareOp::Eq,
                0b001 => FpCompareOp::Lt,
                0b000 => FpCompareOp::Le,
                _ => return Err(DecodeError::IllegalInstruction),
            };
            Ok(Instruction::FpCompare {
                op,
                dest,
                src1,
                src2,
            })
        }
        0b1110000 => match (funct3(raw_instruction), u8::from(src2)) {
            (0b000, 0) => Ok(Instruction::FpMoveToInt { dest, src: src1 }),
            (0b001, 0) => Ok(Instruction::FpClassify { dest, src: src1 }),
            _ => Err(DecodeError::IllegalInstruction),
        },
        0b1111000 => match (funct3(raw_instruction), u8::from(src2)) {
            (0b000, 0) => Ok(Instruction::FpMoveFromInt { dest, src: src1 }),
            _ => Err(DecodeError::IllegalInstruction),
        },
        _ => Err(DecodeError::IllegalInstruction),
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum DecodeError {
    #[error("instruction has unsupported opcode")]
    UnsupportedOpcode,
    #[error("instruction belongs to an extension that is not enabled")]
    UnsupportedExtension,
    #[error("illegal instruction")]
    IllegalInstruction,
}

impl RegRegOp {
    fn is_muldiv(self) -> bool {
        matches!(
            self,
            Self::Mul
                | Self::Mulh
                | Self::Mulhsu
                | Self::Mulhu
                | Self::Div
                | Self::Divu
                | Self::Rem
                | Self::Remu
        )
    }
}

/// Returns the 7-bit *opcode* value of the instruction, or `None` if it isn't
/// supported.
fn opcode(raw_instruction: u32) -> Option<Opcode> {
    #[allow(clippy::unusual_byte_groupings)]
    match raw_instruction & 0x7F {
        0b00_000_11 => Some(Opcode::Load),
        0b00_001_11 => Some(Opcode::LoadFp),
        // custom-0
        0b00_011_11 => Some(Opcode::MiscMem),
        0b00_100_11 => Some(Opcode::OpImm),
        0b00_101_11 => Some(Opcode::Auipc),
        // OP-IMM-32
        // 48b
        0b01_000_11 => Some(Opcode::Store),
        0b01_001_11 => Some(Opcode::StoreFp),
        // custom-1
        0b01_011_11 => Some(Opcode::Amo),
        0b01_100_11 => Some(Opcode::Op),
        0b01_101_11 => Some(Opcode::Lui),
        // OP-32
        // 64b
        0b10_000_11 => Some(Opcode::Madd),
        0b10_001_11 => Some(Opcode::Msub),
        0b10_010_11 => Some(Opcode::Nmsub),
        0b10_011_11 => Some(Opcode::Nmadd),
        0b10_100_11 => Some(Opcode::OpFp),
        // reserved
        // custom-2/rv128
        // 48b
        0b11_000_11 => Some(Opcode::Branch),
        0b11_001_11 => Some(Opcode::Jalr),
        // reserved
        0b11_011_11 => Some(Opcode::Jal),
        0b11_100_11 => Some(Opcode::System),
        // reserved
        // custom-3/rv128
        // >= 80b
        _ => None,
    }
}

/// Returns the 5-bit *rd* value for R-type, I-type, U-type, J-type
/// instructions.
fn rd(raw_instruction: u32) -> Specifier {
    Specifier::from_u5(((raw_instruction >> 7) & 0x1F) as u8)
}

/// Returns the 5-bit *rs1* value for R-type, I-type, S-type, B-type
/// instructions.
fn rs1(raw_instruction: u32) -> Specifier {
    Specifier::from_u5(((raw_instruction >> 15) & 0x1F) as u8)
}

/// Returns the 5-bit *rs2* value for R-type, S-type, B-type instructions.
fn rs2(raw_instruction: u32) -> Specifier {
    Specifier::from_u5(((raw_instruction >> 20) & 0x1F) as u8)
}

/// Returns the 5-bit *rs3* value for R4-type instructions.
fn r4_rs3(raw_instruction: u32) -> Specifier {
    Specifier::from_u5((raw_instruction >> 27) as u8)
}

/// Returns the 2-bit *fmt* field for R4-type instructions.
fn r4_fmt(raw_instruction: u32) -> u32 {
    (raw_instruction >> 25) & 0b11
}

fn csr(raw_instruction: u32) -> CsrSpecifier {
    (raw_instruction >> 20) as u16
}

fn i_funct(raw_instruction: u32) -> Option<RegImmOp> {
    match funct3(raw_instruction) {
        0b000 => Some(RegImmOp::Addi),
        0b010 => Some(RegImmOp::Slti),
        0b011 => Some(RegImmOp::Sltiu),
        0b100 => Some(RegImmOp::Xori),
        0b110 => Some(RegImmOp::Ori),
        0b111 => Some(RegImmOp::Andi),
        _ => None,
    }
}

fn i_shfunct(raw_instruction: u32) -> Option<RegShiftImmOp> {
    let bit30 = (raw_instruction >> 30) & 1;
    match (bit30, funct3(raw_instruction)) {
        (0, 0b001) => Some(RegShiftImmOp::Slli),
        (0, 0b101) => Some(RegShiftImmOp::Srli),
        (1, 0b101) => Some(RegShiftImmOp::Srai),
        _ => None,
    }
}

fn i_width(raw_instruction: u32) -> Option<LoadWidth> {
    match funct3(raw_instruction) {
        0b000 => Some(LoadWidth::Lb),
        0b001 => Some(LoadWidth::Lh),
        0b010 => Some(LoadWidth::Lw),
        0b100 => Some(LoadWidth::Lbu),
        0b101 => Some(LoadWidth::Lhu),
        _ => None,
    }
}

fn s_width(raw_instruction: u32) -> Option<StoreWidth> {
    match funct3(raw_instruction) {
        0b000 => Some(StoreWidth::Sb),
        0b001 => Some(StoreWidth::Sh),
        0b010 => Some(StoreWidth::Sw),
        _ => None,
    }
}

fn r_funct(raw_instruction: u32) -> Option<RegRegOp> {
    match (funct7(raw_instruction), funct3(raw_instruction)) {
        (0b0000000, 0b000) => Some(RegRegOp::Add),
        (0b0000000, 0b001) => Some(RegRegOp::Sll),
        (0b0000000, 0b010) => Some(RegRegOp::Slt),
        (0b0000000, 0b011) => Some(RegRegOp::Sltu),
        (0b0000000, 0b100) => Some(RegRegOp::Xor),
        (0b0000000, 0b101) => Some(RegRegOp::Srl),
        (0b0000000, 0b110) => Some(RegRegOp::Or),
        (0b0000000, 0b111) => Some(RegRegOp::And),
        (0b0100000, 0b000) => Some(RegRegOp::Sub),
        (0b0100000, 0b101) => Some(RegRegOp::Sra),
        // funct7 == MULDIV
        (0b0000001, 0b000) => Some(RegRegOp::Mul),
        (0b0000001, 0b001) => Some(RegRegOp::Mulh),
        (0b0000001, 0b010) => Some(RegRegOp::Mulhsu),
        (0b0000001, 0b011) => Some(RegRegOp::Mulhu),
        (0b0000001, 0b100) => Some(RegRegOp::Div),
        (0b0000001, 0b101) => Some(RegRegOp::Divu),
        (0b0000001, 0b110) => Some(RegRegOp::Rem),
        (0b0000001, 0b111) => Some(RegRegOp::Remu),
        _ => None,
    }
}

fn b_funct(raw_instruction: u32) -> Option<BranchCondition> {
    match funct3(raw_instruction) {
        0b000 => Some(BranchCondition::Beq),
        0b001 => Some(BranchCondition::Bne),
        0b100 => Some(BranchCondition::Blt),
        0b101 => Some(BranchCondition::Bge),
        0b110 => Some(BranchCondition::Bltu),
        0b111 => Some(BranchCondition::Bgeu),
        _ => None,
    }
}

fn amo_op(raw_instruction: u32) -> Option<AmoOp> {
    if funct3(raw_instruction) != 0b010 {
        return None;
    }
    match funct7(raw_instruction) >> 2 {
        0b00010 => Some(AmoOp::Lr),
        0b00011 => Some(AmoOp::Sc),
        0b00001 => Some(AmoOp::Swap),
        0b00000 => Some(AmoOp::Add),
        0b00100 => Some(AmoOp::Xor),
        0b01100 => Some(AmoOp::And),
        0b01000 => Some(AmoOp::Or),
        0b10000 => Some(AmoOp::Min),
        0b10100 => Some(AmoOp::Max),
        0b11000 => Some(AmoOp::Minu),
        0b11100 => Some(AmoOp::Maxu),
        _ => None,
    }
}

fn amo_rl(raw_instruction: u32) -> bool {
    (raw_instruction >> 25) & 0b1 == 1
}

fn amo_aq(raw_instruction: u32) -> bool {
    (raw_instruction >> 26) & 0b1 == 1
}

/// Returns the 3-bit *funct3* value for R-type, I-type, S-type, B-type
/// instructions.
fn funct3(raw_instruction: u32) -> u8 {
    ((raw_instruction >> 12) & 0b111) as u8
}

/// Returns the 7-bit *funct7* value for R-type instructions.
fn funct7(raw_instruction: u32) -> u8 {
    (raw_instruction >> 25) as u8
}

/// Returns the 5-bit *shamt* value for I-type shift instructions.
fn shamt(raw_instruction: u32) -> u32 {
    (raw_instruction >> 20) & 0x1F
}

/// Returns the 12-bit I-immediate sign-extended to 32 bits.
fn i_imm(raw_instruction: u32) -> i32 {
    raw_instruction as i32 >> 20
}

/// Returns the 12-bit funct12 field zero-extended to 32 bits.
fn funct12(raw_instruction: u32) -> u32 {
    raw_instruction >> 20
}

/// Returns the 12-bit S-immediate sign-extended to 32 bits.
fn s_imm(raw_instruction: u32) -> i32 {
    let imm_11_5 = raw_instruction & 0xFE00_0000;
    let imm_4_0 = raw_instruction & 0x0000_0F80;
    (imm_11_5 | (imm_4_0 << 13)) as i32 >> 20
}

/// Returns the 13-bit B-immediate sign-extended to 32 bits.
fn b_imm(raw_instruction: u32) -> i32 {
    let imm_12 = raw_instruction & 0x8000_0000;
    let imm_10_5 = raw_instruction & 0x7E00_0000;
    let imm_4_1 = raw_instruction & 0x0000_0F00;
    let imm_11 = raw_instruction & 0x0000_0080;
    (imm_12 | (imm_11 << 23) | (imm_10_5 >> 1) | (imm_4_1 << 12)) as i32 >> 19
}

/// Returns the signed 32-bit U-immediate.
fn u_imm(raw_instruction: u32) -> i32 {
    (raw_instruction & 0xFFFF_F000) as i32
}

/// Returns the 21-bit J-immediate sign-extended to 32 bits.
fn j_imm(raw_instruction: u32) -> i32 {
    let imm_20 = raw_instruction & 0x8000_0000;
    let imm_10_1 = raw_instruction & 0x7FE0_0000;
    let imm_11 = raw_instruction & 0x0010_0000;
    let imm_19_12 = raw_instruction & 0x000F_F000;
    (imm_20 | (imm_19_12 << 11) | (imm_11 << 2) | (imm_10_1 >> 9)) as i32 >> 11
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Opcode {
    Load,
    LoadFp,
    MiscMem,
    OpImm,
    Auipc,
    Store,
    StoreFp,
    Amo,
    Op,
    Lui,
    Madd,
    Msub,
    Nmsub,
    Nmadd,
    OpFp,
    Branch,
    Jalr,
    Jal,
    System,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(raw: u32) -> Instruction {
        let (instruction, length) = Instruction::decode(raw, &Isa::rv32imafc()).unwrap();
        assert_eq!(InstructionLength::Four, length);
        instruction
    }

    #[test]
    fn test_i_imm() {
        assert_eq!(0, i_imm(0x0000_0000));
        assert_eq!(-1, i_imm(0xFFF0_0000));
        assert_eq!(2047, i_imm(2047 << 20));
        assert_eq!(-2048, i_imm(0x8000_0000));
        assert_eq!(-42, i_imm((-42_i32 << 20) as u32));
        // Check other bits are ignored
        assert_eq!(0, i_imm(0x000F_FFFF));
        assert_eq!(-1, i_imm(0xFFF1_2345));
    }

    #[test]
    fn test_decode_addi() {
        // addi x1, x0, 5
        assert_eq!(
            Instruction::OpImm {
                op: RegImmOp::Addi,
                dest: Specifier::from_u5(1),
                src: Specifier::X0,
                immediate: 5,
            },
            decode(0x0050_0093)
        );
        // addi x2, x1, -3
        assert_eq!(
            Instruction::OpImm {
                op: RegImmOp::Addi,
                dest: Specifier::from_u5(2),
                src: Specifier::from_u5(1),
                immediate: -3,
            },
            decode(0xFFD0_8113)
        );
    }

    #[test]
    fn test_decode_srai_vs_srli() {
        // srli x5, x6, 3
        assert_eq!(
            Instruction::OpShiftImm {
                op: RegShiftImmOp::Srli,
                dest: Specifier::from_u5(5),
                src: Specifier::from_u5(6),
                shift_amount_u5: 3,
            },
            decode(0x0033_5293)
        );
        // srai x5, x6, 3
        assert_eq!(
            Instruction::OpShiftImm {
                op: RegShiftImmOp::Srai,
                dest: Specifier::from_u5(5),
                src: Specifier::from_u5(6),
                shift_amount_u5: 3,
            },
            decode(0x4033_5293)
        );
    }

    #[test]
    fn test_decode_lui_auipc() {
        // lui x5, 0xABCDE
        assert_eq!(
            Instruction::Lui {
                dest: Specifier::from_u5(5),
                immediate: 0xABCD_E000_u32 as i32,
            },
            decode(0xABCD_E2B7)
        );
        // auipc x6, 0x1
        assert_eq!(
            Instruction::Auipc {
                dest: Specifier::from_u5(6),
                immediate: 0x1000,
            },
            decode(0x0000_1317)
        );
    }

    #[test]
    fn test_decode_branch_offset() {
        // beq x1, x2, -4
        assert_eq!(
            Instruction::Branch {
                condition: BranchCondition::Beq,
                src1: Specifier::from_u5(1),
                src2: Specifier::from_u5(2),
                offset: -4,
            },
            decode(0xFE20_8EE3)
        );
    }

    #[test]
    fn test_decode_jal() {
        // jal x1, 2048
        assert_eq!(
            Instruction::Jal {
                dest: Specifier::RA,
                offset: 2048,
            },
            decode(0x0010_00EF)
        );
    }

    #[test]
    fn test_decode_muldiv_gated_by_m() {
        // div x3, x1, x2
        assert_eq!(
            Instruction::Op {
                op: RegRegOp::Div,
                dest: Specifier::from_u5(3),
                src1: Specifier::from_u5(1),
                src2: Specifier::from_u5(2),
            },
            decode(0x0220_C1B3)
        );
        assert_eq!(
            Err(DecodeError::UnsupportedExtension),
            Instruction::decode(0x0220_C1B3, &Isa::rv32i()).map(|(i, _)| i)
        );
    }

    #[test]
    fn test_decode_amo() {
        // amoadd.w x3, x2, (x1)
        assert_eq!(
            Instruction::Amo {
                op: AmoOp::Add,
                aq: false,
                rl: false,
                src: Specifier::from_u5(2),
                addr: Specifier::from_u5(1),
                dest: Specifier::from_u5(3),
            },
            decode(0x0020_A1AF)
        );
        // lr.w x3, (x1) with aq set
        assert_eq!(
            Instruction::Amo {
                op: AmoOp::Lr,
                aq: true,
                rl: false,
                src: Specifier::X0,
                addr: Specifier::from_u5(1),
                dest: Specifier::from_u5(3),
            },
            decode(0x1400_A1AF)
        );
    }

    #[test]
    fn test_decode_system() {
        assert_eq!(Instruction::Ecall, decode(0x0000_0073));
        assert_eq!(Instruction::Ebreak, decode(0x0010_0073));
        assert_eq!(Instruction::Mret, decode(0x3020_0073));
        // wfi decodes as illegal
        assert_eq!(
            Err(DecodeError::IllegalInstruction),
            Instruction::decode(0x1050_0073, &Isa::rv32imafc()).map(|(i, _)| i)
        );
    }

    #[test]
    fn test_decode_csr() {
        // csrrw x5, mtvec, x6
        assert_eq!(
            Instruction::Csr {
                op: CsrOp::ReadWrite,
                dest: Specifier::from_u5(5),
                csr: 0x305,
                src: Specifier::from_u5(6),
            },
            decode(0x3053_12F3)
        );
        // csrrsi x0, fflags, 0x10
        assert_eq!(
            Instruction::Csri {
                op: CsrOp::ReadSet,
                dest: Specifier::X0,
                csr: 0x001,
                immediate: 16,
            },
            decode(0x0018_6073)
        );
    }

    #[test]
    fn test_decode_fp() {
        // fadd.s f3, f1, f2 (rm = dynamic 0b111)
        assert_eq!(
            Instruction::FpArith {
                op: FpArithOp::Add,
                dest: Specifier::from_u5(3),
                src1: Specifier::from_u5(1),
                src2: Specifier::from_u5(2),
                rounding_mode: 0b111,
            },
            decode(0x0020_F1D3)
        );
        // fmin.s f3, f1, f2
        assert_eq!(
            Instruction::FpMinMax {
                op: FpMinMaxOp::Min,
                dest: Specifier::from_u5(3),
                src1: Specifier::from_u5(1),
                src2: Specifier::from_u5(2),
            },
            decode(0x2820_81D3)
        );
        // fmadd.s f1, f2, f3, f4
        assert_eq!(
            Instruction::FpFused {
                op: FpFusedOp::Madd,
                dest: Specifier::from_u5(1),
                src1: Specifier::from_u5(2),
                src2: Specifier::from_u5(3),
                src3: Specifier::from_u5(4),
                rounding_mode: 0b111,
            },
            decode(0x2031_70C3)
        );
        // flw f1, 8(x2)
        assert_eq!(
            Instruction::LoadFp {
                dest: Specifier::from_u5(1),
                base: Specifier::SP,
                offset: 8,
            },
            decode(0x0081_2087)
        );
        // fp is gated by the f flag
        assert_eq!(
            Err(DecodeError::UnsupportedExtension),
            Instruction::decode(0x0020_F1D3, &Isa::rv32i()).map(|(i, _)| i)
        );
    }

    #[test]
    fn test_compressed_gated_by_c() {
        let mut isa = Isa::rv32imafc();
        isa.c = false;
        assert_eq!(
            Err(DecodeError::UnsupportedExtension),
            Instruction::decode(0x0001, &isa).map(|(i, _)| i)
        );
    }

    #[test]
    fn test_control_transfer_classification() {
        assert!(decode(0x0000_0073).is_control_transfer()); // ecall
        assert!(decode(0x0010_00EF).is_control_transfer()); // jal
        assert!(decode(0xFE20_8EE3).is_control_transfer()); // beq
        assert!(!decode(0x0050_0093).is_control_transfer()); // addi
    }
}

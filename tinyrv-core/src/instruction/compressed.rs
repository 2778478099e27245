//! Decoding of the 16-bit compressed (RVC) instruction encodings.
//!
//! Every compressed instruction decodes by expansion to the [`Instruction`]
//! variant of its 32-bit counterpart; only the recorded length differs. HINT
//! code points (writes to `x0`, zero shift amounts) expand to architectural
//! no-ops, reserved code points are decode errors. The RV32FC float load/store
//! encodings are not supported and decode as errors.

use super::{
    BranchCondition, DecodeError, Instruction, LoadWidth, RegImmOp, RegRegOp, RegShiftImmOp,
    StoreWidth,
};
use crate::registers::Specifier;
use crate::Isa;

/// Decodes a 16-bit parcel (low two bits != `0b11`).
pub(super) fn decode(raw: u16, _isa: &Isa) -> Result<Instruction, DecodeError> {
    let op = raw & 0b11;
    let funct3 = raw >> 13;
    match (op, funct3) {
        // Quadrant 0
        (0b00, 0b000) => {
            // C.ADDI4SPN: addi rd', x2, nzuimm
            let nzuimm = ciw_imm(raw);
            if nzuimm == 0 {
                // The all-zero parcel and nzuimm == 0 are reserved.
                return Err(DecodeError::IllegalInstruction);
            }
            Ok(Instruction::OpImm {
                op: RegImmOp::Addi,
                dest: rdc(raw),
                src: Specifier::SP,
                immediate: nzuimm as i32,
            })
        }
        (0b00, 0b010) => {
            // C.LW: lw rd', uimm(rs1')
            Ok(Instruction::Load {
                width: LoadWidth::Lw,
                dest: rdc(raw),
                base: rs1c(raw),
                offset: cl_imm(raw) as i32,
            })
        }
        (0b00, 0b110) => {
            // C.SW: sw rs2', uimm(rs1')
            Ok(Instruction::Store {
                width: StoreWidth::Sw,
                src: rs2c(raw),
                base: rs1c(raw),
                offset: cl_imm(raw) as i32,
            })
        }
        // Quadrant 1
        (0b01, 0b000) => {
            // C.NOP / C.ADDI: addi rd, rd, nzimm (nzimm == 0 is a HINT)
            let dest = rd_full(raw);
            Ok(Instruction::OpImm {
                op: RegImmOp::Addi,
                dest,
                src: dest,
                immediate: ci_imm(raw),
            })
        }
        (0b01, 0b001) => {
            // C.JAL: jal x1, offset
            Ok(Instruction::Jal {
                dest: Specifier::RA,
                offset: cj_imm(raw),
            })
        }
        (0b01, 0b010) => {
            // C.LI: addi rd, x0, imm (rd == x0 is a HINT)
            Ok(Instruction::OpImm {
                op: RegImmOp::Addi,
                dest: rd_full(raw),
                src: Specifier::X0,
                immediate: ci_imm(raw),
            })
        }
        (0b01, 0b011) => {
            let dest = rd_full(raw);
            if u8::from(dest) == 2 {
                // C.ADDI16SP: addi x2, x2, nzimm
                let nzimm = ci16sp_imm(raw);
                if nzimm == 0 {
                    return Err(DecodeError::IllegalInstruction);
                }
                Ok(Instruction::OpImm {
                    op: RegImmOp::Addi,
                    dest,
                    src: dest,
                    immediate: nzimm,
                })
            } else {
                // C.LUI: lui rd, nzimm (rd == x0 is a HINT)
                let immediate = ci_lui_imm(raw);
                if immediate == 0 {
                    return Err(DecodeError::IllegalInstruction);
                }
                Ok(Instruction::Lui {
                    dest,
                    immediate,
                })
            }
        }
        (0b01, 0b100) => decode_misc_alu(raw),
        (0b01, 0b101) => {
            // C.J: jal x0, offset
            Ok(Instruction::Jal {
                dest: Specifier::X0,
                offset: cj_imm(raw),
            })
        }
        (0b01, 0b110) => Ok(Instruction::Branch {
            condition: BranchCondition::Beq,
            src1: rs1c(raw),
            src2: Specifier::X0,
            offset: cb_imm(raw),
        }),
        (0b01, 0b111) => Ok(Instruction::Branch {
            condition: BranchCondition::Bne,
            src1: rs1c(raw),
            src2: Specifier::X0,
            offset: cb_imm(raw),
        }),
        // Quadrant 2
        (0b10, 0b000) => {
            // C.SLLI: slli rd, rd, shamt (rd == x0 and shamt == 0 are HINTs)
            let shamt = ci_shamt(raw);
            if shamt & 0x20 != 0 {
                // shamt[5] must be zero on RV32.
                return Err(DecodeError::IllegalInstruction);
            }
            let dest = rd_full(raw);
            Ok(Instruction::OpShiftImm {
                op: RegShiftImmOp::Slli,
                dest,
                src: dest,
                shift_amount_u5: shamt,
            })
        }
        (0b10, 0b010) => {
            // C.LWSP: lw rd, uimm(x2)
            let dest = rd_full(raw);
            if dest == Specifier::X0 {
                return Err(DecodeError::IllegalInstruction);
            }
            Ok(Instruction::Load {
                width: LoadWidth::Lw,
                dest,
                base: Specifier::SP,
                offset: ci_lwsp_imm(raw) as i32,
            })
        }
        (0b10, 0b100) => decode_cr(raw),
        (0b10, 0b110) => {
            // C.SWSP: sw rs2, uimm(x2)
            Ok(Instruction::Store {
                width: StoreWidth::Sw,
                src: rs2_full(raw),
                base: Specifier::SP,
                offset: css_imm(raw) as i32,
            })
        }
        // The remaining code points are the RV32FC float load/stores and
        // RV64-only encodings; none are supported.
        _ => Err(DecodeError::IllegalInstruction),
    }
}

/// Decodes the quadrant-1 `funct3 == 100` group: C.SRLI, C.SRAI, C.ANDI, and
/// the CA-format register-register operations.
fn decode_misc_alu(raw: u16) -> Result<Instruction, DecodeError> {
    let src = rs1c(raw);
    match (raw >> 10) & 0b11 {
        0b00 | 0b01 => {
            let shamt = ci_shamt(raw);
            if shamt & 0x20 != 0 {
                // shamt[5] must be zero on RV32 (shamt == 0 is a HINT).
                return Err(DecodeError::IllegalInstruction);
            }
            let op = match (raw >> 10) & 0b11 {
                0b00 => RegShiftImmOp::Srli,
                _ => RegShiftImmOp::Srai,
            };
            Ok(Instruction::OpShiftImm {
                op,
                dest: src,
                src,
                shift_amount_u5: shamt,
            })
        }
        0b10 => Ok(Instruction::OpImm {
            op: RegImmOp::Andi,
            dest: src,
            src,
            immediate: ci_imm(raw),
        }),
        _ => {
            if raw & 0x1000 != 0 {
                // C.SUBW/C.ADDW and two reserved code points; RV64-only.
                return Err(DecodeError::IllegalInstruction);
            }
            let op = match (raw >> 5) & 0b11 {
                0b00 => RegRegOp::Sub,
                0b01 => RegRegOp::Xor,
                0b10 => RegRegOp::Or,
                _ => RegRegOp::And,
            };
            Ok(Instruction::Op {
                op,
                dest: src,
                src1: src,
                src2: rs2c(raw),
            })
        }
    }
}

/// Decodes the CR format group: C.JR, C.MV, C.EBREAK, C.JALR, C.ADD.
fn decode_cr(raw: u16) -> Result<Instruction, DecodeError> {
    let rs1 = rd_full(raw);
    let rs2 = rs2_full(raw);
    match (raw >> 12) & 1 {
        0 => {
            if rs2 == Specifier::X0 {
                // C.JR: jalr x0, 0(rs1)
                if rs1 == Specifier::X0 {
                    return Err(DecodeError::IllegalInstruction);
                }
                Ok(Instruction::Jalr {
                    dest: Specifier::X0,
                    base: rs1,
                    offset: 0,
                })
            } else {
                // C.MV: add rd, x0, rs2 (rd == x0 is a HINT)
                Ok(Instruction::Op {
                    op: RegRegOp::Add,
                    dest: rs1,
                    src1: Specifier::X0,
                    src2: rs2,
                })
            }
        }
        _ => match (rs1 == Specifier::X0, rs2 == Specifier::X0) {
            (true, true) => Ok(Instruction::Ebreak),
            // C.JALR: jalr x1, 0(rs1)
            (false, true) => Ok(Instruction::Jalr {
                dest: Specifier::RA,
                base: rs1,
                offset: 0,
            }),
            // C.ADD: add rd, rd, rs2 (rd == x0 is a HINT)
            (_, false) => Ok(Instruction::Op {
                op: RegRegOp::Add,
                dest: rs1,
                src1: rs1,
                src2: rs2,
            }),
        },
    }
}

/// Returns the full 5-bit *rd*/*rs1* field (bits 11:7).
fn rd_full(raw: u16) -> Specifier {
    Specifier::from_u5(((raw >> 7) & 0x1F) as u8)
}

/// Returns the full 5-bit *rs2* field (bits 6:2).
fn rs2_full(raw: u16) -> Specifier {
    Specifier::from_u5(((raw >> 2) & 0x1F) as u8)
}

/// Returns the 3-bit *rd'* field (bits 4:2), mapping to `x8..=x15`.
fn rdc(raw: u16) -> Specifier {
    Specifier::from_u5(((raw >> 2) & 0b111) as u8 + 8)
}

/// Returns the 3-bit *rs1'* field (bits 9:7), mapping to `x8..=x15`.
fn rs1c(raw: u16) -> Specifier {
    Specifier::from_u5(((raw >> 7) & 0b111) as u8 + 8)
}

/// Returns the 3-bit *rs2'* field (bits 4:2), mapping to `x8..=x15`.
fn rs2c(raw: u16) -> Specifier {
    Specifier::from_u5(((raw >> 2) & 0b111) as u8 + 8)
}

/// Returns the sign-extended 6-bit CI-format immediate (C.ADDI, C.LI,
/// C.ANDI).
fn ci_imm(raw: u16) -> i32 {
    let value = ((raw >> 7) & 0x20 | (raw >> 2) & 0x1F) as i32;
    (value << 26) >> 26
}

/// Returns the 6-bit CI-format shift amount (C.SLLI, C.SRLI, C.SRAI).
fn ci_shamt(raw: u16) -> u32 {
    ((raw >> 7) & 0x20 | (raw >> 2) & 0x1F) as u32
}

/// Returns the sign-extended C.LUI immediate (bits 17:12 of the result).
fn ci_lui_imm(raw: u16) -> i32 {
    let value = ((raw as u32) << 5 & 0x2_0000 | (raw as u32) << 10 & 0x1_F000) as i32;
    (value << 14) >> 14
}

/// Returns the sign-extended C.ADDI16SP immediate (scaled by 16).
fn ci16sp_imm(raw: u16) -> i32 {
    let raw = raw as u32;
    let value =
        (raw >> 3 & 0x200 | raw >> 2 & 0x10 | raw << 1 & 0x40 | raw << 4 & 0x180 | raw << 3 & 0x20)
            as i32;
    (value << 22) >> 22
}

/// Returns the zero-extended CIW-format immediate (C.ADDI4SPN, scaled by 4).
fn ciw_imm(raw: u16) -> u32 {
    let raw = raw as u32;
    raw >> 7 & 0x30 | raw >> 1 & 0x3C0 | raw >> 4 & 0x4 | raw >> 2 & 0x8
}

/// Returns the zero-extended CL/CS-format immediate (C.LW, C.SW, scaled by
/// 4).
fn cl_imm(raw: u16) -> u32 {
    let raw = raw as u32;
    raw >> 7 & 0x38 | raw >> 4 & 0x4 | raw << 1 & 0x40
}

/// Returns the zero-extended C.LWSP immediate (scaled by 4).
fn ci_lwsp_imm(raw: u16) -> u32 {
    let raw = raw as u32;
    raw >> 7 & 0x20 | raw >> 2 & 0x1C | raw << 4 & 0xC0
}

/// Returns the zero-extended CSS-format immediate (C.SWSP, scaled by 4).
fn css_imm(raw: u16) -> u32 {
    let raw = raw as u32;
    raw >> 7 & 0x3C | raw >> 1 & 0xC0
}

/// Returns the sign-extended CJ-format offset (C.J, C.JAL).
fn cj_imm(raw: u16) -> i32 {
    let raw = raw as u32;
    let value = (raw >> 1 & 0x800
        | raw >> 7 & 0x10
        | raw >> 1 & 0x300
        | raw << 2 & 0x400
        | raw >> 1 & 0x40
        | raw << 1 & 0x80
        | raw >> 2 & 0xE
        | raw << 3 & 0x20) as i32;
    (value << 20) >> 20
}

/// Returns the sign-extended CB-format offset (C.BEQZ, C.BNEZ).
fn cb_imm(raw: u16) -> i32 {
    let raw = raw as u32;
    let value = (raw >> 4 & 0x100
        | raw >> 7 & 0x18
        | raw << 1 & 0xC0
        | raw >> 2 & 0x6
        | raw << 3 & 0x20) as i32;
    (value << 23) >> 23
}

#[cfg(test)]
mod tests {
    use super::super::InstructionLength;
    use super::*;

    fn decode(raw: u16) -> Instruction {
        let (instruction, length) = Instruction::decode(raw as u32, &Isa::rv32imafc()).unwrap();
        assert_eq!(InstructionLength::Two, length);
        instruction
    }

    #[test]
    fn test_c_nop_and_c_addi() {
        // c.nop
        assert_eq!(
            Instruction::OpImm {
                op: RegImmOp::Addi,
                dest: Specifier::X0,
                src: Specifier::X0,
                immediate: 0,
            },
            decode(0x0001)
        );
        // c.addi x8, -1 (imm all ones)
        assert_eq!(
            Instruction::OpImm {
                op: RegImmOp::Addi,
                dest: Specifier::from_u5(8),
                src: Specifier::from_u5(8),
                immediate: -1,
            },
            decode(0x147D)
        );
    }

    #[test]
    fn test_c_jal_offset() {
        // c.jal +6: offset bits imm[2:1] = 11
        // encoding: funct3=001, op=01, imm[3:1] at insn[5:3]
        assert_eq!(
            Instruction::Jal {
                dest: Specifier::RA,
                offset: 6,
            },
            decode(0x2019)
        );
        // c.j -2
        assert_eq!(
            Instruction::Jal {
                dest: Specifier::X0,
                offset: -2,
            },
            decode(0xBFF5)
        );
    }

    #[test]
    fn test_c_li_and_c_lui() {
        // c.li x10, 5
        assert_eq!(
            Instruction::OpImm {
                op: RegImmOp::Addi,
                dest: Specifier::A0,
                src: Specifier::X0,
                immediate: 5,
            },
            decode(0x4515)
        );
        // c.lui x10, 1 => imm 0x1000
        assert_eq!(
            Instruction::Lui {
                dest: Specifier::A0,
                immediate: 0x1000,
            },
            decode(0x6505)
        );
        // c.lui x10, 0x3F (negative) => imm 0xFFFF_F000
        assert_eq!(
            Instruction::Lui {
                dest: Specifier::A0,
                immediate: -0x1000,
            },
            decode(0x757D)
        );
    }

    #[test]
    fn test_c_addi4spn() {
        // c.addi4spn x8, x2, 4
        assert_eq!(
            Instruction::OpImm {
                op: RegImmOp::Addi,
                dest: Specifier::from_u5(8),
                src: Specifier::SP,
                immediate: 4,
            },
            decode(0x0040)
        );
        // nzuimm == 0 is reserved
        assert!(Instruction::decode(0x0000, &Isa::rv32imafc()).is_err());
    }

    #[test]
    fn test_c_addi16sp() {
        // c.addi16sp x2, 16
        assert_eq!(
            Instruction::OpImm {
                op: RegImmOp::Addi,
                dest: Specifier::SP,
                src: Specifier::SP,
                immediate: 16,
            },
            decode(0x6141)
        );
        // c.addi16sp x2, -16
        assert_eq!(
            Instruction::OpImm {
                op: RegImmOp::Addi,
                dest: Specifier::SP,
                src: Specifier::SP,
                immediate: -16,
            },
            decode(0x717D)
        );
    }

    #[test]
    fn test_c_lw_c_sw() {
        // c.lw x9, 8(x10)
        assert_eq!(
            Instruction::Load {
                width: LoadWidth::Lw,
                dest: Specifier::from_u5(9),
                base: Specifier::A0,
                offset: 8,
            },
            decode(0x4504)
        );
        // c.sw x9, 8(x10)
        assert_eq!(
            Instruction::Store {
                width: StoreWidth::Sw,
                src: Specifier::from_u5(9),
                base: Specifier::A0,
                offset: 8,
            },
            decode(0xC504)
        );
    }

    #[test]
    fn test_c_lwsp_c_swsp() {
        // c.lwsp x5, 12(x2)
        assert_eq!(
            Instruction::Load {
                width: LoadWidth::Lw,
                dest: Specifier::from_u5(5),
                base: Specifier::SP,
                offset: 12,
            },
            decode(0x42B2)
        );
        // c.lwsp with rd == x0 is reserved
        assert!(Instruction::decode(0x4032, &Isa::rv32imafc()).is_err());
        // c.swsp x5, 12(x2)
        assert_eq!(
            Instruction::Store {
                width: StoreWidth::Sw,
                src: Specifier::from_u5(5),
                base: Specifier::SP,
                offset: 12,
            },
            decode(0xC616)
        );
    }

    #[test]
    fn test_cr_group() {
        // c.mv x10, x11
        assert_eq!(
            Instruction::Op {
                op: RegRegOp::Add,
                dest: Specifier::A0,
                src1: Specifier::X0,
                src2: Specifier::from_u5(11),
            },
            decode(0x852E)
        );
        // c.jr x1
        assert_eq!(
            Instruction::Jalr {
                dest: Specifier::X0,
                base: Specifier::RA,
                offset: 0,
            },
            decode(0x8082)
        );
        // c.jalr x5
        assert_eq!(
            Instruction::Jalr {
                dest: Specifier::RA,
                base: Specifier::from_u5(5),
                offset: 0,
            },
            decode(0x9282)
        );
        // c.add x10, x11
        assert_eq!(
            Instruction::Op {
                op: RegRegOp::Add,
                dest: Specifier::A0,
                src1: Specifier::A0,
                src2: Specifier::from_u5(11),
            },
            decode(0x952E)
        );
        // c.ebreak
        assert_eq!(Instruction::Ebreak, decode(0x9002));
        // c.jr x0 is reserved
        assert!(Instruction::decode(0x8002, &Isa::rv32imafc()).is_err());
    }

    #[test]
    fn test_misc_alu() {
        // c.srli x8, 4
        assert_eq!(
            Instruction::OpShiftImm {
                op: RegShiftImmOp::Srli,
                dest: Specifier::from_u5(8),
                src: Specifier::from_u5(8),
                shift_amount_u5: 4,
            },
            decode(0x8011)
        );
        // c.srai x8, 4
        assert_eq!(
            Instruction::OpShiftImm {
                op: RegShiftImmOp::Srai,
                dest: Specifier::from_u5(8),
                src: Specifier::from_u5(8),
                shift_amount_u5: 4,
            },
            decode(0x8411)
        );
        // c.andi x8, 3
        assert_eq!(
            Instruction::OpImm {
                op: RegImmOp::Andi,
                dest: Specifier::from_u5(8),
                src: Specifier::from_u5(8),
                immediate: 3,
            },
            decode(0x880D)
        );
        // c.sub x8, x9
        assert_eq!(
            Instruction::Op {
                op: RegRegOp::Sub,
                dest: Specifier::from_u5(8),
                src1: Specifier::from_u5(8),
                src2: Specifier::from_u5(9),
            },
            decode(0x8C05)
        );
        // c.xor x8, x9
        assert_eq!(
            Instruction::Op {
                op: RegRegOp::Xor,
                dest: Specifier::from_u5(8),
                src1: Specifier::from_u5(8),
                src2: Specifier::from_u5(9),
            },
            decode(0x8C25)
        );
    }

    #[test]
    fn test_c_branches() {
        // c.beqz x8, +8
        assert_eq!(
            Instruction::Branch {
                condition: BranchCondition::Beq,
                src1: Specifier::from_u5(8),
                src2: Specifier::X0,
                offset: 8,
            },
            decode(0xC401)
        );
        // c.bnez x8, -4
        assert_eq!(
            Instruction::Branch {
                condition: BranchCondition::Bne,
                src1: Specifier::from_u5(8),
                src2: Specifier::X0,
                offset: -4,
            },
            decode(0xFC75)
        );
    }

    #[test]
    fn test_c_slli() {
        // c.slli x5, 1
        assert_eq!(
            Instruction::OpShiftImm {
                op: RegShiftImmOp::Slli,
                dest: Specifier::from_u5(5),
                src: Specifier::from_u5(5),
                shift_amount_u5: 1,
            },
            decode(0x0286)
        );
        // shamt[5] set is reserved on RV32
        assert!(Instruction::decode(0x1286, &Isa::rv32imafc()).is_err());
    }

    #[test]
    fn test_float_encodings_unsupported() {
        // c.flw and friends decode as illegal
        assert!(Instruction::decode(0x6000, &Isa::rv32imafc()).is_err());
    }
}

/*
Instruction decoding
--------------------
Decoding is a pure two-level table walk over the 32-bit instruction word:
the top 6 bits select either an opcode directly or a secondary table
(SPECIAL and SPECIAL2 dispatch on the function field, REGIMM on rt, COPz on
rs with a further CO sub-table on the function field). Encodings with no
assigned meaning map to RES (raises Reserved Instruction when executed) or
QRES (quietly ignored). The all-zero word is NOP.

Decoding never faults and has no side effects; the semantics live entirely
in the execute unit.
*/

pub struct Instruction(pub u32);

impl Instruction {
    #[inline(always)]
    pub fn op(&self) -> u32 {
        self.0 >> 26
    }
    #[inline(always)]
    pub fn rs(&self) -> usize {
        ((self.0 >> 21) & 0x1F) as usize
    }
    #[inline(always)]
    pub fn rt(&self) -> usize {
        ((self.0 >> 16) & 0x1F) as usize
    }
    #[inline(always)]
    pub fn rd(&self) -> usize {
        ((self.0 >> 11) & 0x1F) as usize
    }
    #[inline(always)]
    pub fn shift_amount(&self) -> u32 {
        (self.0 >> 6) & 0x1F
    }
    #[inline(always)]
    pub fn function(&self) -> u32 {
        self.0 & 0x3F
    }
    #[inline(always)]
    pub fn imm16(&self) -> u16 {
        self.0 as u16
    }
    #[inline(always)]
    pub fn target26(&self) -> u64 {
        (self.0 & 0x3FF_FFFF) as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    NOP,
    // SPECIAL
    SLL, SRL, SRA, SLLV, SRLV, SRAV,
    JR, JALR, MOVZ, MOVN, SYSCALL, BREAK, SYNC,
    MFHI, MTHI, MFLO, MTLO,
    DSLLV, DSRLV, DSRAV,
    MULT, MULTU, DIV, DIVU, DMULT, DMULTU, DDIV, DDIVU,
    ADD, ADDU, SUB, SUBU, AND, OR, XOR, NOR, SLT, SLTU,
    DADD, DADDU, DSUB, DSUBU,
    TGE, TGEU, TLT, TLTU, TEQ, TNE,
    DSLL, DSRL, DSRA, DSLL32, DSRL32, DSRA32,
    // SPECIAL2
    MADD, MADDU, MUL, MSUB, MSUBU, CLZ, CLO,
    // REGIMM
    BLTZ, BGEZ, BLTZL, BGEZL,
    TGEI, TGEIU, TLTI, TLTIU, TEQI, TNEI,
    BLTZAL, BGEZAL, BLTZALL, BGEZALL,
    // primary
    J, JAL, BEQ, BNE, BLEZ, BGTZ,
    ADDI, ADDIU, SLTI, SLTIU, ANDI, ORI, XORI, LUI,
    BEQL, BNEL, BLEZL, BGTZL,
    DADDI, DADDIU,
    LDL, LDR, LB, LH, LWL, LW, LBU, LHU, LWR, LWU,
    SB, SH, SWL, SW, SDL, SDR, SWR, CACHE,
    LL, LWC1, LWC2, LLD, LDC1, LDC2, LD,
    SC, SWC1, SWC2, SCD, SDC1, SDC2, SD,
    // coprocessor moves and branches
    MFC0, MFC1, MFC2, MFC3,
    DMFC0, DMFC1, DMFC2, DMFC3,
    CFC0, CFC1, CFC2, CFC3,
    MTC0, MTC1, MTC2, MTC3,
    DMTC0, DMTC1, DMTC2, DMTC3,
    CTC0, CTC1, CTC2, CTC3,
    BC0F, BC1F, BC2F, BC3F,
    BC0T, BC1T, BC2T, BC3T,
    BC0FL, BC1FL, BC2FL, BC3FL,
    BC0TL, BC1TL, BC2TL, BC3TL,
    // CP0 operations
    TLBR, TLBWI, TLBWR, TLBP, ERET, WAIT,
    // machine debugging encodings
    DVAL, DTRC, DTRO, DRV, DHLT, DINT,
    // unassigned
    RES,
    QRES,
}

#[derive(Clone, Copy)]
enum Dispatch {
    Op(Opcode),
    Special,
    Special2,
    RegImm,
    Cop(usize),
}

use Dispatch::{Cop, Op, RegImm, Special, Special2};
use Opcode::*;

static PRIMARY_TABLE: [Dispatch; 64] = [
    /* 0x00 */ Special, RegImm, Op(J), Op(JAL), Op(BEQ), Op(BNE), Op(BLEZ), Op(BGTZ),
    /* 0x08 */ Op(ADDI), Op(ADDIU), Op(SLTI), Op(SLTIU), Op(ANDI), Op(ORI), Op(XORI), Op(LUI),
    /* 0x10 */ Cop(0), Cop(1), Cop(2), Cop(3), Op(BEQL), Op(BNEL), Op(BLEZL), Op(BGTZL),
    /* 0x18 */ Op(DADDI), Op(DADDIU), Op(LDL), Op(LDR), Special2, Op(RES), Op(RES), Op(RES),
    /* 0x20 */ Op(LB), Op(LH), Op(LWL), Op(LW), Op(LBU), Op(LHU), Op(LWR), Op(LWU),
    /* 0x28 */ Op(SB), Op(SH), Op(SWL), Op(SW), Op(SDL), Op(SDR), Op(SWR), Op(CACHE),
    /* 0x30 */ Op(LL), Op(LWC1), Op(LWC2), Op(RES), Op(LLD), Op(LDC1), Op(LDC2), Op(LD),
    /* 0x38 */ Op(SC), Op(SWC1), Op(SWC2), Op(RES), Op(SCD), Op(SDC1), Op(SDC2), Op(SD),
];

static SPECIAL_TABLE: [Opcode; 64] = [
    /* 0x00 */ SLL, RES, SRL, SRA, SLLV, RES, SRLV, SRAV,
    /* 0x08 */ JR, JALR, MOVZ, MOVN, SYSCALL, BREAK, RES, SYNC,
    /* 0x10 */ MFHI, MTHI, MFLO, MTLO, DSLLV, RES, DSRLV, DSRAV,
    /* 0x18 */ MULT, MULTU, DIV, DIVU, DMULT, DMULTU, DDIV, DDIVU,
    /* 0x20 */ ADD, ADDU, SUB, SUBU, AND, OR, XOR, NOR,
    /* 0x28 */ DHLT, DINT, SLT, SLTU, DADD, DADDU, DSUB, DSUBU,
    /* 0x30 */ TGE, TGEU, TLT, TLTU, TEQ, DVAL, TNE, DRV,
    /* 0x38 */ DSLL, DTRC, DSRL, DSRA, DSLL32, DTRO, DSRL32, DSRA32,
];

static SPECIAL2_TABLE: [Opcode; 64] = [
    /* 0x00 */ MADD, MADDU, MUL, RES, MSUB, MSUBU, RES, RES,
    /* 0x08 */ RES, RES, RES, RES, RES, RES, RES, RES,
    /* 0x10 */ RES, RES, RES, RES, RES, RES, RES, RES,
    /* 0x18 */ RES, RES, RES, RES, RES, RES, RES, RES,
    /* 0x20 */ CLZ, CLO, RES, RES, RES, RES, RES, RES,
    /* 0x28 */ RES, RES, RES, RES, RES, RES, RES, RES,
    /* 0x30 */ RES, RES, RES, RES, RES, RES, RES, RES,
    /* 0x38 */ RES, RES, RES, RES, RES, RES, RES, RES,
];

static REGIMM_TABLE: [Opcode; 32] = [
    /* 0x00 */ BLTZ, BGEZ, BLTZL, BGEZL, RES, RES, RES, RES,
    /* 0x08 */ TGEI, TGEIU, TLTI, TLTIU, TEQI, RES, TNEI, RES,
    /* 0x10 */ BLTZAL, BGEZAL, BLTZALL, BGEZALL, RES, RES, RES, RES,
    /* 0x18 */ RES, RES, RES, RES, RES, RES, RES, RES,
];

static CO_TABLE: [Opcode; 64] = [
    /* 0x00 */ QRES, TLBR, TLBWI, QRES, QRES, QRES, TLBWR, QRES,
    /* 0x08 */ TLBP, QRES, QRES, QRES, QRES, QRES, QRES, QRES,
    /* 0x10 */ QRES, QRES, QRES, QRES, QRES, QRES, QRES, QRES,
    /* 0x18 */ ERET, QRES, QRES, QRES, QRES, QRES, QRES, QRES,
    /* 0x20 */ WAIT, QRES, QRES, QRES, QRES, QRES, QRES, QRES,
    /* 0x28 */ QRES, QRES, QRES, QRES, QRES, QRES, QRES, QRES,
    /* 0x30 */ QRES, QRES, QRES, QRES, QRES, QRES, QRES, QRES,
    /* 0x38 */ QRES, QRES, QRES, QRES, QRES, QRES, QRES, QRES,
];

static COP_MF: [Opcode; 4] = [MFC0, MFC1, MFC2, MFC3];
static COP_DMF: [Opcode; 4] = [DMFC0, DMFC1, DMFC2, DMFC3];
static COP_CF: [Opcode; 4] = [CFC0, CFC1, CFC2, CFC3];
static COP_MT: [Opcode; 4] = [MTC0, MTC1, MTC2, MTC3];
static COP_DMT: [Opcode; 4] = [DMTC0, DMTC1, DMTC2, DMTC3];
static COP_CT: [Opcode; 4] = [CTC0, CTC1, CTC2, CTC3];
static COP_BCF: [Opcode; 4] = [BC0F, BC1F, BC2F, BC3F];
static COP_BCT: [Opcode; 4] = [BC0T, BC1T, BC2T, BC3T];
static COP_BCFL: [Opcode; 4] = [BC0FL, BC1FL, BC2FL, BC3FL];
static COP_BCTL: [Opcode; 4] = [BC0TL, BC1TL, BC2TL, BC3TL];

fn decode_copz(cop: usize, i: &Instruction) -> Opcode {
    match i.rs() {
        0x00 => COP_MF[cop],
        0x01 => COP_DMF[cop],
        0x02 => COP_CF[cop],
        0x04 => COP_MT[cop],
        0x05 => COP_DMT[cop],
        0x06 => COP_CT[cop],
        0x08 => match i.rt() {
            0x00 => COP_BCF[cop],
            0x01 => COP_BCT[cop],
            0x02 => COP_BCFL[cop],
            0x03 => COP_BCTL[cop],
            _ => RES,
        },
        0x10..=0x1F => CO_TABLE[i.function() as usize],
        _ => RES,
    }
}

impl Opcode {
    /// Total over all 2^32 encodings, never faults.
    #[inline(always)]
    pub fn from_instruction(i: &Instruction) -> Opcode {
        if i.0 == 0 {
            return NOP;
        }
        match PRIMARY_TABLE[i.op() as usize] {
            Dispatch::Op(opcode) => opcode,
            Dispatch::Special => SPECIAL_TABLE[i.function() as usize],
            Dispatch::Special2 => SPECIAL2_TABLE[i.function() as usize],
            Dispatch::RegImm => REGIMM_TABLE[i.rt()],
            Dispatch::Cop(cop) => decode_copz(cop, i),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r_type(op: u32, rs: u32, rt: u32, rd: u32, sa: u32, func: u32) -> u32 {
        (op << 26) | (rs << 21) | (rt << 16) | (rd << 11) | (sa << 6) | func
    }

    fn i_type(op: u32, rs: u32, rt: u32, imm: u32) -> u32 {
        (op << 26) | (rs << 21) | (rt << 16) | (imm & 0xFFFF)
    }

    #[test]
    fn zero_word_is_nop() {
        assert_eq!(Opcode::from_instruction(&Instruction(0)), NOP);
        // a non-zero SLL is a real shift
        let sll = Instruction(r_type(0, 0, 5, 6, 4, 0));
        assert_eq!(Opcode::from_instruction(&sll), SLL);
    }

    #[test]
    fn field_accessors() {
        let i = Instruction(r_type(0, 9, 10, 11, 12, 0x20));
        assert_eq!(i.rs(), 9);
        assert_eq!(i.rt(), 10);
        assert_eq!(i.rd(), 11);
        assert_eq!(i.shift_amount(), 12);
        assert_eq!(i.function(), 0x20);
        assert_eq!(Opcode::from_instruction(&i), ADD);

        let j = Instruction((0x02 << 26) | 0x3FF_FFFF);
        assert_eq!(j.target26(), 0x3FF_FFFF);
        assert_eq!(Opcode::from_instruction(&j), J);

        let ori = Instruction(i_type(0x0D, 1, 2, 0xBEEF));
        assert_eq!(ori.imm16(), 0xBEEF);
        assert_eq!(Opcode::from_instruction(&ori), ORI);
    }

    #[test]
    fn special_and_regimm_dispatch() {
        assert_eq!(Opcode::from_instruction(&Instruction(r_type(0, 1, 2, 0, 0, 0x1A))), DIV);
        assert_eq!(Opcode::from_instruction(&Instruction(r_type(0, 31, 0, 0, 0, 0x08))), JR);
        assert_eq!(Opcode::from_instruction(&Instruction(r_type(0, 1, 2, 3, 0, 0x2C))), DADD);
        assert_eq!(Opcode::from_instruction(&Instruction(i_type(0x01, 4, 0x00, 16))), BLTZ);
        assert_eq!(Opcode::from_instruction(&Instruction(i_type(0x01, 4, 0x11, 16))), BGEZAL);
        assert_eq!(Opcode::from_instruction(&Instruction(i_type(0x01, 4, 0x0C, 16))), TEQI);
        // unassigned REGIMM rt value
        assert_eq!(Opcode::from_instruction(&Instruction(i_type(0x01, 4, 0x1F, 16))), RES);
    }

    #[test]
    fn special2_dispatch() {
        assert_eq!(Opcode::from_instruction(&Instruction(r_type(0x1C, 1, 2, 3, 0, 0x02))), MUL);
        assert_eq!(Opcode::from_instruction(&Instruction(r_type(0x1C, 1, 0, 3, 0, 0x20))), CLZ);
        assert_eq!(Opcode::from_instruction(&Instruction(r_type(0x1C, 1, 0, 3, 0, 0x3F))), RES);
    }

    #[test]
    fn coprocessor_dispatch() {
        assert_eq!(Opcode::from_instruction(&Instruction(r_type(0x10, 0x00, 2, 12, 0, 0))), MFC0);
        assert_eq!(Opcode::from_instruction(&Instruction(r_type(0x10, 0x04, 2, 12, 0, 0))), MTC0);
        assert_eq!(Opcode::from_instruction(&Instruction(r_type(0x10, 0x01, 2, 12, 0, 0))), DMFC0);
        assert_eq!(Opcode::from_instruction(&Instruction(r_type(0x11, 0x04, 2, 12, 0, 0))), MTC1);
        assert_eq!(Opcode::from_instruction(&Instruction(i_type(0x10, 0x08, 0x00, 4))), BC0F);
        assert_eq!(Opcode::from_instruction(&Instruction(i_type(0x12, 0x08, 0x03, 4))), BC2TL);
        // CO sub-table
        assert_eq!(Opcode::from_instruction(&Instruction(r_type(0x10, 0x10, 0, 0, 0, 0x02))), TLBWI);
        assert_eq!(Opcode::from_instruction(&Instruction(r_type(0x10, 0x10, 0, 0, 0, 0x18))), ERET);
        assert_eq!(Opcode::from_instruction(&Instruction(r_type(0x10, 0x10, 0, 0, 0, 0x20))), WAIT);
        assert_eq!(Opcode::from_instruction(&Instruction(r_type(0x10, 0x10, 0, 0, 0, 0x3F))), QRES);
    }

    #[test]
    fn decoding_is_total() {
        // every combination of primary opcode and function field decodes
        for op in 0u32..64 {
            for func in 0u32..64 {
                let word = (op << 26) | func;
                let _ = Opcode::from_instruction(&Instruction(word));
            }
        }
        // every rs/rt combination of the COPz space decodes
        for cop in 0u32..4 {
            for rs in 0u32..32 {
                for rt in 0u32..32 {
                    let word = ((0x10 + cop) << 26) | (rs << 21) | (rt << 16);
                    let _ = Opcode::from_instruction(&Instruction(word));
                }
            }
        }
    }
}

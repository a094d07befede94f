use crate::core::cpu::cop0::CP0_REGISTER_NAMES;
use crate::core::cpu::instruction::{Instruction, Opcode};
use crate::core::cpu::Cpu;

/*
Instruction trace output. One line per retired instruction, optionally
followed by the registers the instruction modified. Three register naming
conventions are supported, selectable at runtime.
*/

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegNaming {
    /// r0..r31
    Numeric,
    /// $0..$31
    Dollar,
    /// at, v0, a0, sp, ra, ...
    Abi,
}

impl RegNaming {
    pub fn from_index(index: u32) -> RegNaming {
        match index {
            0 => RegNaming::Numeric,
            1 => RegNaming::Dollar,
            _ => RegNaming::Abi,
        }
    }
}

static REG_NAMES_ABI: [&str; 32] = [
    "0", "at", "v0", "v1", "a0", "a1", "a2", "a3",
    "t0", "t1", "t2", "t3", "t4", "t5", "t6", "t7",
    "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7",
    "t8", "t9", "k0", "k1", "gp", "sp", "fp", "ra",
];

pub fn reg_name(naming: RegNaming, index: usize) -> String {
    match naming {
        RegNaming::Numeric => format!("r{}", index),
        RegNaming::Dollar => format!("${}", index),
        RegNaming::Abi => REG_NAMES_ABI[index].to_string(),
    }
}

pub fn cp0_reg_name(naming: RegNaming, index: usize) -> String {
    match naming {
        RegNaming::Numeric => format!("{}", index),
        RegNaming::Dollar => format!("${}", index),
        RegNaming::Abi => CP0_REGISTER_NAMES[index].to_string(),
    }
}

/// Addresses are printed in their 32-bit form when they are just
/// sign-extended 32-bit values.
fn fmt_addr(addr: u64) -> String {
    let high = (addr >> 32) as u32;
    if high == 0 || high == 0xFFFF_FFFF {
        format!("{:08X}", addr as u32)
    } else {
        format!("{:016X}", addr)
    }
}

#[derive(Debug)]
pub struct Disassembled {
    pub address: u64,
    pub opcode: Opcode,
    pub operands: String,
    pub formatted: String,
}

pub fn disassemble(pc: u64, icode: u32, naming: RegNaming) -> Disassembled {
    let i = Instruction(icode);
    let opcode = Opcode::from_instruction(&i);
    let mnemonic = format!("{:?}", opcode).to_lowercase();
    let operands = operands(&i, opcode, pc, naming);
    let formatted = if operands.is_empty() {
        format!("{}  {}", fmt_addr(pc), mnemonic)
    } else {
        format!("{}  {} {}", fmt_addr(pc), mnemonic, operands)
    };
    Disassembled { address: pc, opcode, operands, formatted }
}

fn branch_dest(pc: u64, i: &Instruction) -> u64 {
    pc.wrapping_add(4).wrapping_add(((i.imm16() as i16 as i64) << 2) as u64)
}

fn operands(i: &Instruction, opcode: Opcode, pc: u64, naming: RegNaming) -> String {
    use Opcode::*;

    let rs = || reg_name(naming, i.rs());
    let rt = || reg_name(naming, i.rt());
    let rd = || reg_name(naming, i.rd());
    let simm = i.imm16() as i16;

    match opcode {
        NOP | SYSCALL | BREAK | SYNC | CACHE | ERET | WAIT | TLBR | TLBWI | TLBWR | TLBP
        | RES | QRES | DVAL | DTRC | DTRO | DRV | DHLT | DINT => String::new(),

        ADD | ADDU | SUB | SUBU | AND | OR | XOR | NOR | SLT | SLTU | DADD | DADDU | DSUB
        | DSUBU | MOVZ | MOVN | MUL => {
            format!("{},{},{}", rd(), rs(), rt())
        }

        SLL | SRL | SRA | DSLL | DSRL | DSRA | DSLL32 | DSRL32 | DSRA32 => {
            format!("{},{},{}", rd(), rt(), i.shift_amount())
        }

        SLLV | SRLV | SRAV | DSLLV | DSRLV | DSRAV => {
            format!("{},{},{}", rd(), rt(), rs())
        }

        ADDI | ADDIU | SLTI | SLTIU | DADDI | DADDIU => {
            format!("{},{},{}", rt(), rs(), simm)
        }

        ANDI | ORI | XORI => format!("{},{},{:#X}", rt(), rs(), i.imm16()),

        LUI => format!("{},{:#X}", rt(), i.imm16()),

        MULT | MULTU | DIV | DIVU | DMULT | DMULTU | DDIV | DDIVU | MADD | MADDU | MSUB
        | MSUBU | TGE | TGEU | TLT | TLTU | TEQ | TNE => {
            format!("{},{}", rs(), rt())
        }

        TGEI | TGEIU | TLTI | TLTIU | TEQI | TNEI => format!("{},{}", rs(), simm),

        CLZ | CLO => format!("{},{}", rd(), rs()),

        MFHI | MFLO => rd(),
        MTHI | MTLO | JR => rs(),
        JALR => format!("{},{}", rd(), rs()),

        J | JAL => {
            let dest = (pc.wrapping_add(4) & 0xFFFF_FFFF_F000_0000) | (i.target26() << 2);
            fmt_addr(dest)
        }

        BEQ | BNE | BEQL | BNEL => {
            format!("{},{},{}", rs(), rt(), fmt_addr(branch_dest(pc, i)))
        }

        BLEZ | BGTZ | BLEZL | BGTZL | BLTZ | BGEZ | BLTZL | BGEZL | BLTZAL | BGEZAL
        | BLTZALL | BGEZALL => {
            format!("{},{}", rs(), fmt_addr(branch_dest(pc, i)))
        }

        BC0F | BC1F | BC2F | BC3F | BC0T | BC1T | BC2T | BC3T | BC0FL | BC1FL | BC2FL
        | BC3FL | BC0TL | BC1TL | BC2TL | BC3TL => fmt_addr(branch_dest(pc, i)),

        LB | LBU | LH | LHU | LW | LWU | LWL | LWR | LD | LDL | LDR | LL | LLD | SB | SH
        | SW | SD | SWL | SWR | SDL | SDR | SC | SCD | LWC1 | LWC2 | LDC1 | LDC2 | SWC1
        | SWC2 | SDC1 | SDC2 => {
            format!("{},{}({})", rt(), simm, rs())
        }

        MFC0 | DMFC0 | MTC0 | DMTC0 => {
            format!("{},{}", rt(), cp0_reg_name(naming, i.rd()))
        }

        MFC1 | MFC2 | MFC3 | DMFC1 | DMFC2 | DMFC3 | MTC1 | MTC2 | MTC3 | DMTC1 | DMTC2
        | DMTC3 | CFC0 | CFC1 | CFC2 | CFC3 | CTC0 | CTC1 | CTC2 | CTC3 => {
            format!("{},${}", rt(), i.rd())
        }
    }
}

/// Differences against the trace shadow copies, one `name: old->new` item
/// per modified register.
pub fn modified_regs_dump(cpu: &Cpu, naming: RegNaming) -> String {
    let (old_regs, old_cp0, old_lo, old_hi) = cpu.old_regs();
    let mut items = Vec::new();

    for (index, (old, new)) in old_regs.iter().zip(cpu.regs().iter()).enumerate() {
        if old != new {
            items.push(format!("{}: {:#X}->{:#X}", reg_name(naming, index), old, new));
        }
    }
    for (index, (old, new)) in old_cp0.iter().zip(cpu.cop0().regs().iter()).enumerate() {
        if old != new {
            items.push(format!("cp0_{}: {:#X}->{:#X}", cp0_reg_name(RegNaming::Abi, index), old, new));
        }
    }
    if old_lo != cpu.lo() {
        items.push(format!("lo: {:#X}->{:#X}", old_lo, cpu.lo()));
    }
    if old_hi != cpu.hi() {
        items.push(format!("hi: {:#X}->{:#X}", old_hi, cpu.hi()));
    }

    items.join(", ")
}

/// Full register view, four registers per row.
pub fn reg_dump(cpu: &Cpu) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "cpu{}  pc {}  lo {:016X}  hi {:016X}\n",
        cpu.procno(),
        fmt_addr(cpu.pc()),
        cpu.lo(),
        cpu.hi()
    ));
    for row in 0..8 {
        for col in 0..4 {
            let index = row * 4 + col;
            out.push_str(&format!(
                "{:>4} {:016X}  ",
                reg_name(RegNaming::Abi, index),
                cpu.reg(index)
            ));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_common_instructions() {
        // addiu $29, $29, -32
        let d = disassemble(0xFFFF_FFFF_BFC0_0000, (0x09 << 26) | (29 << 21) | (29 << 16) | 0xFFE0, RegNaming::Abi);
        assert_eq!(d.opcode, Opcode::ADDIU);
        assert_eq!(d.formatted, "BFC00000  addiu sp,sp,-32");

        // lw t0, 16(sp)
        let d = disassemble(0x8000_0100, (0x23 << 26) | (29 << 21) | (8 << 16) | 16, RegNaming::Abi);
        assert_eq!(d.formatted, "80000100  lw t0,16(sp)");

        // no operands
        let d = disassemble(0x8000_0104, (0x10 << 26) | (0x10 << 21) | 0x18, RegNaming::Abi);
        assert_eq!(d.formatted, "80000104  eret");
    }

    #[test]
    fn branch_targets_resolve_relative_to_the_delay_slot() {
        // beq r4, r5, +4 words back
        let off = (-4i16) as u16 as u32;
        let d = disassemble(0x8000_0010, (0x04 << 26) | (4 << 21) | (5 << 16) | off, RegNaming::Numeric);
        assert_eq!(d.formatted, "80000010  beq r4,r5,80000004");
    }

    #[test]
    fn naming_conventions() {
        assert_eq!(reg_name(RegNaming::Numeric, 31), "r31");
        assert_eq!(reg_name(RegNaming::Dollar, 31), "$31");
        assert_eq!(reg_name(RegNaming::Abi, 31), "ra");
        assert_eq!(cp0_reg_name(RegNaming::Abi, 12), "status");
    }
}

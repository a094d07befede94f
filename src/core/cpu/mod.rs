use tracing::{debug, info, warn};

use crate::core::cpu::cop0::{
    Cop0, Cp0Reg, CAUSE_BD_MASK, CAUSE_CE_MASK, CAUSE_CE_SHIFT, CAUSE_EXCCODE_MASK,
    CAUSE_EXCCODE_SHIFT, CAUSE_IP_MASK, CAUSE_IP_SHIFT, CAUSE_IP7_SHIFT, STATUS_ERL_MASK,
    STATUS_EXL_MASK,
};
use crate::core::cpu::instruction::{Instruction, Opcode};
use crate::core::cpu::tlb::{convert_addr, Tlb, TlbStats, VmFault, TLB_ENTRIES};
use crate::core::debugger::CodeBreakpoint;
use crate::core::memory::bus::Bus;

pub mod cop0;
pub mod disassembler;
pub mod instruction;
pub mod tlb;

pub const REG_COUNT: usize = 32;
pub const INTR_COUNT: usize = 8;

/// Reset state
pub const HARD_RESET_START_ADDRESS: u64 = 0xFFFF_FFFF_BFC0_0000;

/// Exception vectors
const EXCEPTION_BOOT_BASE_ADDRESS: u64 = 0xFFFF_FFFF_BFC0_0200;
const EXCEPTION_NORMAL_BASE_ADDRESS: u64 = 0xFFFF_FFFF_8000_0000;
const EXCEPTION_OFFSET: u64 = 0x180;

/// J/JAL paste the 26-bit target into the region of the delay slot.
const TARGET_COMB: u64 = 0xFFFF_FFFF_F000_0000;

const SBIT32: u32 = 0x8000_0000;
const SBIT64: u64 = 0x8000_0000_0000_0000;

#[inline(always)]
fn sign_extend_16_32(val: u16) -> u32 {
    val as i16 as i32 as u32
}

#[inline(always)]
fn sign_extend_8_64(val: u8) -> u64 {
    val as i8 as i64 as u64
}

#[inline(always)]
fn sign_extend_16_64(val: u16) -> u64 {
    val as i16 as i64 as u64
}

#[inline(always)]
fn sign_extend_32_64(val: u32) -> u64 {
    val as i32 as i64 as u64
}

/*
Architectural exceptions. The refill variants carry the information that
the no-offset vector applies; they collapse to TLBL/TLBS when delivered.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exc {
    Int,
    Mod,
    TLBL,
    TLBS,
    AdEL,
    AdES,
    IBE,
    DBE,
    Sys,
    Bp,
    RI,
    CpU,
    Ov,
    Tr,
    VCEI,
    FPE,
    Watch,
    VCED,
    TLBLRefill,
    TLBSRefill,
    Reset,
}

impl Exc {
    pub fn code(self) -> u64 {
        use Exc::*;
        match self {
            Int => 0,
            Mod => 1,
            TLBL | TLBLRefill => 2,
            TLBS | TLBSRefill => 3,
            AdEL => 4,
            AdES => 5,
            IBE => 6,
            DBE => 7,
            Sys => 8,
            Bp => 9,
            RI => 10,
            CpU => 11,
            Ov => 12,
            Tr => 13,
            VCEI => 14,
            FPE => 15,
            Watch => 23,
            VCED => 31,
            Reset => 0,
        }
    }
}

type ExecResult = Result<(), Exc>;

/// Faults coming out of the address path before they are classified by the
/// access direction.
enum MemFault {
    Vm(VmFault),
    Watch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BranchState {
    None = 0,
    /// The delay slot instruction is executing now.
    Passed = 1,
    /// A branch has just been taken; the next instruction is the delay slot.
    Cond = 2,
}

#[derive(Clone, Copy, PartialEq)]
enum AccMode {
    Fetch,
    Read,
    Write,
}

/*
Unaligned access merge tables, keyed on the low address bits. The guest is
little-endian; the tables mirror that parity.
*/
static SHIFT_TAB_LEFT: [(u32, u32); 4] = [
    (0x00FF_FFFF, 24),
    (0x0000_FFFF, 16),
    (0x0000_00FF, 8),
    (0x0000_0000, 0),
];

static SHIFT_TAB_RIGHT: [(u32, u32); 4] = [
    (0x0000_0000, 0),
    (0xFF00_0000, 8),
    (0xFFFF_0000, 16),
    (0xFFFF_FF00, 24),
];

static SHIFT_TAB_LEFT_STORE: [(u32, u32); 4] = [
    (0xFFFF_FF00, 24),
    (0xFFFF_0000, 16),
    (0xFF00_0000, 8),
    (0x0000_0000, 0),
];

static SHIFT_TAB_RIGHT_STORE: [(u32, u32); 4] = [
    (0x0000_0000, 0),
    (0x0000_00FF, 8),
    (0x0000_FFFF, 16),
    (0x00FF_FFFF, 24),
];

static SHIFT_TAB_LEFT64: [(u64, u32); 8] = [
    (0x00FF_FFFF_FFFF_FFFF, 56),
    (0x0000_FFFF_FFFF_FFFF, 48),
    (0x0000_00FF_FFFF_FFFF, 40),
    (0x0000_0000_FFFF_FFFF, 32),
    (0x0000_0000_00FF_FFFF, 24),
    (0x0000_0000_0000_FFFF, 16),
    (0x0000_0000_0000_00FF, 8),
    (0x0000_0000_0000_0000, 0),
];

static SHIFT_TAB_RIGHT64: [(u64, u32); 8] = [
    (0x0000_0000_0000_0000, 0),
    (0xFF00_0000_0000_0000, 8),
    (0xFFFF_0000_0000_0000, 16),
    (0xFFFF_FF00_0000_0000, 24),
    (0xFFFF_FFFF_0000_0000, 32),
    (0xFFFF_FFFF_FF00_0000, 40),
    (0xFFFF_FFFF_FFFF_0000, 48),
    (0xFFFF_FFFF_FFFF_FF00, 56),
];

static SHIFT_TAB_LEFT_STORE64: [(u64, u32); 8] = [
    (0xFFFF_FFFF_FFFF_FF00, 56),
    (0xFFFF_FFFF_FFFF_0000, 48),
    (0xFFFF_FFFF_FF00_0000, 40),
    (0xFFFF_FFFF_0000_0000, 32),
    (0xFFFF_FF00_0000_0000, 24),
    (0xFFFF_0000_0000_0000, 16),
    (0xFF00_0000_0000_0000, 8),
    (0x0000_0000_0000_0000, 0),
];

static SHIFT_TAB_RIGHT_STORE64: [(u64, u32); 8] = [
    (0x0000_0000_0000_0000, 0),
    (0x0000_0000_0000_00FF, 8),
    (0x0000_0000_0000_FFFF, 16),
    (0x0000_0000_00FF_FFFF, 24),
    (0x0000_0000_FFFF_FFFF, 32),
    (0x0000_00FF_FFFF_FFFF, 40),
    (0x0000_FFFF_FFFF_FFFF, 48),
    (0x00FF_FFFF_FFFF_FFFF, 56),
];

pub struct Cpu {
    procno: usize,
    stdby: bool,

    regs: [u64; REG_COUNT],
    cop0: Cop0,
    loreg: u64,
    hireg: u64,

    pc: u64,
    pc_next: u64,

    tlb: Tlb,
    pub tlb_stats: TlbStats,

    // shadow copies for the instruction-trace register diff
    old_regs: [u64; REG_COUNT],
    old_cp0: [u64; cop0::CP0_REG_COUNT],
    old_loreg: u64,
    old_hireg: u64,

    excaddr: u64,
    branch: BranchState,

    // watchpoint derived state
    waddr: u64,
    wpending: bool,
    wexcaddr: u64,

    // statistics
    pub k_cycles: u64,
    pub u_cycles: u64,
    pub w_cycles: u64,
    pub intr: [u64; INTR_COUNT],

    pub breakpoints: Vec<CodeBreakpoint>,

    last_icode: u32,
    last_fetch_ok: bool,
}

impl Cpu {
    pub fn new(procno: usize) -> Self {
        let mut cpu = Cpu {
            procno,
            stdby: false,
            regs: [0; REG_COUNT],
            cop0: Cop0::new(),
            loreg: 0,
            hireg: 0,
            pc: 0,
            pc_next: 0,
            tlb: Tlb::new(),
            tlb_stats: TlbStats::default(),
            old_regs: [0; REG_COUNT],
            old_cp0: [0; cop0::CP0_REG_COUNT],
            old_loreg: 0,
            old_hireg: 0,
            excaddr: 0,
            branch: BranchState::None,
            waddr: 0,
            wpending: false,
            wexcaddr: 0,
            k_cycles: 0,
            u_cycles: 0,
            w_cycles: 0,
            intr: [0; INTR_COUNT],
            breakpoints: Vec::new(),
            last_icode: 0,
            last_fetch_ok: false,
        };
        cpu.set_pc(HARD_RESET_START_ADDRESS);
        cpu
    }

    pub fn set_pc(&mut self, value: u64) {
        self.pc = value;
        self.pc_next = value.wrapping_add(4);
    }

    pub fn procno(&self) -> usize {
        self.procno
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn pc_next(&self) -> u64 {
        self.pc_next
    }

    pub fn stdby(&self) -> bool {
        self.stdby
    }

    pub fn branch(&self) -> BranchState {
        self.branch
    }

    pub fn reg(&self, index: usize) -> u64 {
        self.regs[index]
    }

    /// Direct register poke; r0 stays hard-wired to zero.
    pub fn set_reg(&mut self, index: usize, value: u64) {
        if index != 0 {
            self.regs[index] = value;
        }
    }

    pub fn regs(&self) -> &[u64; REG_COUNT] {
        &self.regs
    }

    pub fn lo(&self) -> u64 {
        self.loreg
    }

    pub fn hi(&self) -> u64 {
        self.hireg
    }

    pub fn cop0(&self) -> &Cop0 {
        &self.cop0
    }

    pub fn cop0_mut(&mut self) -> &mut Cop0 {
        &mut self.cop0
    }

    pub fn tlb(&self) -> &Tlb {
        &self.tlb
    }

    pub fn tlb_mut(&mut self) -> &mut Tlb {
        &mut self.tlb
    }

    pub fn last_icode(&self) -> u32 {
        self.last_icode
    }

    pub fn last_fetch_ok(&self) -> bool {
        self.last_fetch_ok
    }

    pub fn watch_pending(&self) -> Option<u64> {
        if self.wpending { Some(self.wexcaddr) } else { None }
    }

    pub fn old_regs(&self) -> (&[u64; REG_COUNT], &[u64; cop0::CP0_REG_COUNT], u64, u64) {
        (&self.old_regs, &self.old_cp0, self.old_loreg, self.old_hireg)
    }

    /// Refresh the shadow copies used by the trace register diff.
    pub fn update_trace_shadow(&mut self) {
        self.old_regs = self.regs;
        self.old_cp0 = *self.cop0.regs();
        self.old_loreg = self.loreg;
        self.old_hireg = self.hireg;
    }

    // ==================== interrupt pins ====================

    pub fn interrupt_up(&mut self, no: usize) {
        let cause = self.cop0.reg(Cp0Reg::Cause);
        self.cop0.set(Cp0Reg::Cause, cause | (1 << (CAUSE_IP_SHIFT as usize + no)));
        self.intr[no] += 1;
    }

    pub fn interrupt_down(&mut self, no: usize) {
        let cause = self.cop0.reg(Cp0Reg::Cause);
        self.cop0.set(Cp0Reg::Cause, cause & !(1 << (CAUSE_IP_SHIFT as usize + no)));
    }

    // ==================== virtual memory access ====================

    /// Translate and check the watchpoint. Instruction fetches do not
    /// trigger the watch exception.
    fn access_mem(&mut self, mode: AccMode, virt: u64, noisy: bool) -> Result<u64, MemFault> {
        let phys = convert_addr(
            &mut self.cop0,
            &mut self.tlb,
            &mut self.tlb_stats,
            virt,
            mode == AccMode::Write,
            noisy,
        )
        .map_err(MemFault::Vm)?;

        let watched = (self.cop0.watchlo_r() && mode == AccMode::Read)
            || (self.cop0.watchlo_w() && mode == AccMode::Write);
        if watched && self.waddr == (phys >> 3) {
            // With EXL set the exception is postponed and the access
            // (probably) proceeds.
            if self.cop0.status_exl() {
                self.wpending = true;
                self.wexcaddr = self.pc;
            } else {
                return Err(MemFault::Watch);
            }
        }

        Ok(phys)
    }

    fn load_fault(fault: MemFault) -> Exc {
        match fault {
            MemFault::Vm(VmFault::AddrError) => Exc::AdEL,
            MemFault::Vm(VmFault::TlbRefill) => Exc::TLBLRefill,
            MemFault::Vm(VmFault::TlbInvalid) => Exc::TLBL,
            MemFault::Vm(VmFault::TlbModified) => Exc::Mod,
            MemFault::Watch => Exc::Watch,
        }
    }

    fn store_fault(fault: MemFault) -> Exc {
        match fault {
            MemFault::Vm(VmFault::AddrError) => Exc::AdES,
            MemFault::Vm(VmFault::TlbRefill) => Exc::TLBSRefill,
            MemFault::Vm(VmFault::TlbInvalid) => Exc::TLBS,
            MemFault::Vm(VmFault::TlbModified) => Exc::Mod,
            MemFault::Watch => Exc::Watch,
        }
    }

    fn align_test<const BYTES: u64>(&mut self, addr: u64, noisy: bool) -> Result<(), ()> {
        if (addr & (BYTES - 1)) != 0 {
            tlb::addr_error_fill(&mut self.cop0, addr, noisy);
            Err(())
        } else {
            Ok(())
        }
    }

    fn read_mem8(&mut self, bus: &mut Bus, addr: u64, noisy: bool) -> Result<u8, Exc> {
        match self.access_mem(AccMode::Read, addr, noisy) {
            Ok(phys) => Ok(bus.read8(self.procno, phys, true)),
            Err(fault) => Err(Self::load_fault(fault)),
        }
    }

    fn read_mem16(&mut self, bus: &mut Bus, addr: u64, noisy: bool) -> Result<u16, Exc> {
        if self.align_test::<2>(addr, noisy).is_err() {
            return Err(Exc::AdEL);
        }
        match self.access_mem(AccMode::Read, addr, noisy) {
            Ok(phys) => Ok(bus.read16(self.procno, phys, true)),
            Err(fault) => Err(Self::load_fault(fault)),
        }
    }

    fn read_mem32(&mut self, bus: &mut Bus, addr: u64, noisy: bool) -> Result<u32, Exc> {
        if self.align_test::<4>(addr, noisy).is_err() {
            return Err(Exc::AdEL);
        }
        match self.access_mem(AccMode::Read, addr, noisy) {
            Ok(phys) => Ok(bus.read32(self.procno, phys, true)),
            Err(fault) => Err(Self::load_fault(fault)),
        }
    }

    fn read_mem64(&mut self, bus: &mut Bus, addr: u64, noisy: bool) -> Result<u64, Exc> {
        if self.align_test::<8>(addr, noisy).is_err() {
            return Err(Exc::AdEL);
        }
        match self.access_mem(AccMode::Read, addr, noisy) {
            Ok(phys) => Ok(bus.read64(self.procno, phys, true)),
            Err(fault) => Err(Self::load_fault(fault)),
        }
    }

    fn write_mem8(&mut self, bus: &mut Bus, addr: u64, value: u8, noisy: bool) -> ExecResult {
        match self.access_mem(AccMode::Write, addr, noisy) {
            Ok(phys) => {
                bus.write8(self.procno, phys, value, true);
                Ok(())
            }
            Err(fault) => Err(Self::store_fault(fault)),
        }
    }

    fn write_mem16(&mut self, bus: &mut Bus, addr: u64, value: u16, noisy: bool) -> ExecResult {
        if self.align_test::<2>(addr, noisy).is_err() {
            return Err(Exc::AdES);
        }
        match self.access_mem(AccMode::Write, addr, noisy) {
            Ok(phys) => {
                bus.write16(self.procno, phys, value, true);
                Ok(())
            }
            Err(fault) => Err(Self::store_fault(fault)),
        }
    }

    fn write_mem32(&mut self, bus: &mut Bus, addr: u64, value: u32, noisy: bool) -> ExecResult {
        if self.align_test::<4>(addr, noisy).is_err() {
            return Err(Exc::AdES);
        }
        match self.access_mem(AccMode::Write, addr, noisy) {
            Ok(phys) => {
                bus.write32(self.procno, phys, value, true);
                Ok(())
            }
            Err(fault) => Err(Self::store_fault(fault)),
        }
    }

    fn write_mem64(&mut self, bus: &mut Bus, addr: u64, value: u64, noisy: bool) -> ExecResult {
        if self.align_test::<8>(addr, noisy).is_err() {
            return Err(Exc::AdES);
        }
        match self.access_mem(AccMode::Write, addr, noisy) {
            Ok(phys) => {
                bus.write64(self.procno, phys, value, true);
                Ok(())
            }
            Err(fault) => Err(Self::store_fault(fault)),
        }
    }

    /// Instruction fetch; a fault outside a delay slot records the fetch
    /// address as the exception address.
    fn read_ins(&mut self, bus: &mut Bus, addr: u64, noisy: bool) -> Result<u32, Exc> {
        let result = if self.align_test::<4>(addr, noisy).is_err() {
            Err(Exc::AdEL)
        } else {
            match self.access_mem(AccMode::Fetch, addr, noisy) {
                Ok(phys) => Ok(bus.read32(self.procno, phys, true)),
                Err(fault) => Err(Self::load_fault(fault)),
            }
        };

        if noisy && result.is_err() && self.branch == BranchState::None {
            self.excaddr = self.pc;
        }

        result
    }

    // ==================== execute helpers ====================

    #[inline(always)]
    fn mem_target(&self, i: &Instruction) -> u64 {
        self.regs[i.rs()].wrapping_add(sign_extend_16_64(i.imm16()))
    }

    #[inline(always)]
    fn branch_target(&self, i: &Instruction) -> u64 {
        self.pc_next.wrapping_add(sign_extend_16_64(i.imm16()) << 2)
    }

    #[inline(always)]
    fn take_branch(&mut self, pca: &mut u64, i: &Instruction) {
        *pca = self.branch_target(i);
        self.branch = BranchState::Cond;
    }

    /// Failed likely branches skip the delay slot.
    #[inline(always)]
    fn squash_delay_slot(&mut self, pca: &mut u64) {
        self.pc_next = self.pc_next.wrapping_add(4);
        *pca = self.pc_next.wrapping_add(4);
    }

    /// CP0 access from an unprivileged mode: Cause.CE is zeroed.
    fn cp0_unusable(&mut self) -> Exc {
        let cause = self.cop0.reg(Cp0Reg::Cause) & !CAUSE_CE_MASK;
        self.cop0.set(Cp0Reg::Cause, cause);
        Exc::CpU
    }

    /// CP1..CP3 gate: pass when the CU bit is set, otherwise raise CpU with
    /// Cause.CE naming the coprocessor.
    fn cop_gate(&mut self, cop: usize) -> ExecResult {
        if self.cop0.status_cu(cop) {
            Ok(())
        } else {
            let cause = (self.cop0.reg(Cp0Reg::Cause) & !CAUSE_CE_MASK)
                | ((cop as u64) << CAUSE_CE_SHIFT);
            self.cop0.set(Cp0Reg::Cause, cause);
            Err(Exc::CpU)
        }
    }

    fn mtc0(&mut self, i: &Instruction) -> ExecResult {
        if !self.cop0.cp0_usable() {
            return Err(self.cp0_unusable());
        }
        let value = self.regs[i.rt()];
        self.cop0.write_masked(i.rd(), value);
        if i.rd() == Cp0Reg::WatchLo as usize || i.rd() == Cp0Reg::WatchHi as usize {
            self.waddr = self.cop0.watch_addr();
        }
        Ok(())
    }

    fn tlb_write_op(&mut self, random: bool) -> ExecResult {
        if !self.cop0.cp0_usable() {
            return Err(self.cp0_unusable());
        }
        let index = if random {
            self.cop0.random_random() as usize
        } else {
            self.cop0.index_index() as usize
        };
        if index >= TLB_ENTRIES {
            // Random stays in range by construction, so this is TLBWI
            warn!("Invalid value in Index (TLBWI): {}", index);
        } else {
            self.tlb.write_entry(index, &self.cop0);
        }
        Ok(())
    }

    fn multiply_s32(&mut self, a: u32, b: u32) {
        let res = ((a as i32 as i64) * (b as i32 as i64)) as u64;
        self.loreg = sign_extend_32_64(res as u32);
        self.hireg = sign_extend_32_64((res >> 32) as u32);
    }

    fn multiply_u32(&mut self, a: u32, b: u32) {
        let res = (a as u64) * (b as u64);
        self.loreg = sign_extend_32_64(res as u32);
        self.hireg = sign_extend_32_64((res >> 32) as u32);
    }

    fn multiply_s64(&mut self, a: u64, b: u64) {
        let res = (a as i64 as i128) * (b as i64 as i128);
        self.loreg = res as u64;
        self.hireg = (res >> 64) as u64;
    }

    fn multiply_u64(&mut self, a: u64, b: u64) {
        let res = (a as u128) * (b as u128);
        self.loreg = res as u64;
        self.hireg = (res >> 64) as u64;
    }

    /// MADD/MADDU/MSUB/MSUBU accumulate into the 64-bit HI:LO pair.
    fn mul_accumulate(&mut self, a: u32, b: u32, signed: bool, add: bool) {
        let acc = ((self.hireg as u32 as u64) << 32) | (self.loreg as u32 as u64);
        let product = if signed {
            ((a as i32 as i64) * (b as i32 as i64)) as u64
        } else {
            (a as u64) * (b as u64)
        };
        let result = if add {
            acc.wrapping_add(product)
        } else {
            acc.wrapping_sub(product)
        };
        self.hireg = sign_extend_32_64((result >> 32) as u32);
        self.loreg = sign_extend_32_64(result as u32);
    }

    // ==================== the execute unit ====================

    fn execute(&mut self, bus: &mut Bus, i: &Instruction) -> ExecResult {
        let mut pca = self.pc_next.wrapping_add(4);
        let res = self.dispatch(bus, i, &mut pca);

        // remember where the exception engine should restart, unless we
        // are sitting in a delay slot (the branch address is kept then)
        if self.branch != BranchState::Passed {
            self.excaddr = self.pc;
        }

        if res.is_ok() {
            self.pc = self.pc_next;
            self.pc_next = pca;
        }

        // register 0 is hard-wired zero
        self.regs[0] = 0;

        res
    }

    fn dispatch(&mut self, bus: &mut Bus, i: &Instruction, pca: &mut u64) -> ExecResult {
        use Opcode::*;

        let opcode = Opcode::from_instruction(i);
        let urrs = self.regs[i.rs()];
        let urrt = self.regs[i.rt()];
        let mode64 = self.cop0.mode_64bit();

        match opcode {
            NOP => {}

            // ==================== arithmetic, logic, shifts ====================
            ADD => {
                let sum = (urrs as u32).wrapping_add(urrt as u32);
                if ((urrs as u32 ^ urrt as u32) & SBIT32) == 0 && ((urrs as u32 ^ sum) & SBIT32) != 0 {
                    return Err(Exc::Ov);
                }
                self.regs[i.rd()] = sign_extend_32_64(sum);
            }
            ADDI => {
                let imm = sign_extend_16_32(i.imm16());
                let sum = (urrs as u32).wrapping_add(imm);
                if ((urrs as u32 ^ imm) & SBIT32) == 0 && ((urrs as u32 ^ sum) & SBIT32) != 0 {
                    return Err(Exc::Ov);
                }
                self.regs[i.rt()] = sign_extend_32_64(sum);
            }
            ADDIU => {
                self.regs[i.rt()] =
                    sign_extend_32_64((urrs as u32).wrapping_add(sign_extend_16_32(i.imm16())));
            }
            ADDU => {
                self.regs[i.rd()] = sign_extend_32_64((urrs as u32).wrapping_add(urrt as u32));
            }
            SUB => {
                let diff = (urrs as u32).wrapping_sub(urrt as u32);
                if ((urrs as u32 ^ urrt as u32) & SBIT32) != 0 && ((urrs as u32 ^ diff) & SBIT32) != 0 {
                    return Err(Exc::Ov);
                }
                self.regs[i.rd()] = sign_extend_32_64(diff);
            }
            SUBU => {
                self.regs[i.rd()] = sign_extend_32_64((urrs as u32).wrapping_sub(urrt as u32));
            }
            DADD => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                let sum = urrs.wrapping_add(urrt);
                if ((urrs ^ urrt) & SBIT64) == 0 && ((urrs ^ sum) & SBIT64) != 0 {
                    return Err(Exc::Ov);
                }
                self.regs[i.rd()] = sum;
            }
            DADDI => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                let imm = sign_extend_16_64(i.imm16());
                let sum = urrs.wrapping_add(imm);
                if ((urrs ^ imm) & SBIT64) == 0 && ((urrs ^ sum) & SBIT64) != 0 {
                    return Err(Exc::Ov);
                }
                self.regs[i.rt()] = sum;
            }
            DADDIU => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                self.regs[i.rt()] = urrs.wrapping_add(sign_extend_16_64(i.imm16()));
            }
            DADDU => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                self.regs[i.rd()] = urrs.wrapping_add(urrt);
            }
            DSUB => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                let diff = urrs.wrapping_sub(urrt);
                if ((urrs ^ urrt) & SBIT64) != 0 && ((urrs ^ diff) & SBIT64) != 0 {
                    return Err(Exc::Ov);
                }
                self.regs[i.rd()] = diff;
            }
            DSUBU => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                self.regs[i.rd()] = urrs.wrapping_sub(urrt);
            }
            AND => self.regs[i.rd()] = urrs & urrt,
            ANDI => self.regs[i.rt()] = urrs & (i.imm16() as u64),
            OR => self.regs[i.rd()] = urrs | urrt,
            ORI => self.regs[i.rt()] = urrs | (i.imm16() as u64),
            XOR => self.regs[i.rd()] = urrs ^ urrt,
            XORI => self.regs[i.rt()] = urrs ^ (i.imm16() as u64),
            NOR => self.regs[i.rd()] = !(urrs | urrt),
            LUI => {
                self.regs[i.rt()] = sign_extend_32_64((i.imm16() as u32) << 16);
            }
            SLT => {
                self.regs[i.rd()] = if mode64 {
                    ((urrs as i64) < (urrt as i64)) as u64
                } else {
                    ((urrs as u32 as i32) < (urrt as u32 as i32)) as u64
                };
            }
            SLTI => {
                self.regs[i.rt()] = if mode64 {
                    ((urrs as i64) < (sign_extend_16_64(i.imm16()) as i64)) as u64
                } else {
                    ((urrs as u32 as i32) < (sign_extend_16_32(i.imm16()) as i32)) as u64
                };
            }
            SLTIU => {
                self.regs[i.rt()] = if mode64 {
                    (urrs < sign_extend_16_64(i.imm16())) as u64
                } else {
                    ((urrs as u32) < sign_extend_16_32(i.imm16())) as u64
                };
            }
            SLTU => {
                self.regs[i.rd()] = if mode64 {
                    (urrs < urrt) as u64
                } else {
                    ((urrs as u32) < (urrt as u32)) as u64
                };
            }
            SLL => {
                self.regs[i.rd()] = sign_extend_32_64((urrt as u32) << i.shift_amount());
            }
            SLLV => {
                self.regs[i.rd()] = sign_extend_32_64((urrt as u32) << (urrs as u32 & 0x1F));
            }
            SRL => {
                self.regs[i.rd()] = sign_extend_32_64((urrt as u32) >> i.shift_amount());
            }
            SRLV => {
                self.regs[i.rd()] = sign_extend_32_64((urrt as u32) >> (urrs as u32 & 0x1F));
            }
            SRA => {
                self.regs[i.rd()] =
                    sign_extend_32_64(((urrt as u32 as i32) >> i.shift_amount()) as u32);
            }
            SRAV => {
                self.regs[i.rd()] =
                    sign_extend_32_64(((urrt as u32 as i32) >> (urrs as u32 & 0x1F)) as u32);
            }
            DSLL => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                self.regs[i.rd()] = urrt << i.shift_amount();
            }
            DSLLV => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                self.regs[i.rd()] = urrt << (urrs & 0x3F);
            }
            DSLL32 => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                self.regs[i.rd()] = urrt << (i.shift_amount() + 32);
            }
            DSRL => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                self.regs[i.rd()] = urrt >> i.shift_amount();
            }
            DSRLV => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                self.regs[i.rd()] = urrt >> (urrs & 0x3F);
            }
            DSRL32 => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                self.regs[i.rd()] = urrt >> (i.shift_amount() + 32);
            }
            DSRA => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                self.regs[i.rd()] = ((urrt as i64) >> i.shift_amount()) as u64;
            }
            DSRAV => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                self.regs[i.rd()] = ((urrt as i64) >> (urrs & 0x3F)) as u64;
            }
            DSRA32 => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                self.regs[i.rd()] = ((urrt as i64) >> (i.shift_amount() + 32)) as u64;
            }
            MULT => self.multiply_s32(urrs as u32, urrt as u32),
            MULTU => self.multiply_u32(urrs as u32, urrt as u32),
            DMULT => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                self.multiply_s64(urrs, urrt);
            }
            DMULTU => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                self.multiply_u64(urrs, urrt);
            }
            DIV => {
                if urrt as u32 == 0 {
                    self.loreg = 0;
                    self.hireg = 0;
                } else {
                    let a = urrs as u32 as i32;
                    let b = urrt as u32 as i32;
                    self.loreg = sign_extend_32_64(a.wrapping_div(b) as u32);
                    self.hireg = sign_extend_32_64(a.wrapping_rem(b) as u32);
                }
            }
            DIVU => {
                if urrt as u32 == 0 {
                    self.loreg = 0;
                    self.hireg = 0;
                } else {
                    self.loreg = sign_extend_32_64((urrs as u32) / (urrt as u32));
                    self.hireg = sign_extend_32_64((urrs as u32) % (urrt as u32));
                }
            }
            DDIV => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                if urrt == 0 {
                    self.loreg = 0;
                    self.hireg = 0;
                } else {
                    self.loreg = (urrs as i64).wrapping_div(urrt as i64) as u64;
                    self.hireg = (urrs as i64).wrapping_rem(urrt as i64) as u64;
                }
            }
            DDIVU => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                if urrt == 0 {
                    self.loreg = 0;
                    self.hireg = 0;
                } else {
                    self.loreg = urrs / urrt;
                    self.hireg = urrs % urrt;
                }
            }
            MADD => self.mul_accumulate(urrs as u32, urrt as u32, true, true),
            MADDU => self.mul_accumulate(urrs as u32, urrt as u32, false, true),
            MSUB => self.mul_accumulate(urrs as u32, urrt as u32, true, false),
            MSUBU => self.mul_accumulate(urrs as u32, urrt as u32, false, false),
            MUL => {
                let product = (urrs as u32).wrapping_mul(urrt as u32);
                self.regs[i.rd()] = sign_extend_32_64(product);
            }
            CLZ => {
                self.regs[i.rd()] = (urrs as u32).leading_zeros() as u64;
            }
            CLO => {
                self.regs[i.rd()] = (!(urrs as u32)).leading_zeros() as u64;
            }
            MOVZ => {
                if urrt == 0 {
                    self.regs[i.rd()] = urrs;
                }
            }
            MOVN => {
                if urrt != 0 {
                    self.regs[i.rd()] = urrs;
                }
            }
            MFHI => self.regs[i.rd()] = self.hireg,
            MFLO => self.regs[i.rd()] = self.loreg,
            MTHI => self.hireg = urrs,
            MTLO => self.loreg = urrs,

            // ==================== branches and jumps ====================
            BEQ | BEQL | BNE | BNEL => {
                let eq = if mode64 { urrs == urrt } else { urrs as u32 == urrt as u32 };
                let cond = if opcode == BEQ || opcode == BEQL { eq } else { !eq };
                if cond {
                    self.take_branch(pca, i);
                } else if opcode == BEQL || opcode == BNEL {
                    self.squash_delay_slot(pca);
                }
            }
            BGEZ | BGEZL | BGEZAL | BGEZALL => {
                if opcode == BGEZAL || opcode == BGEZALL {
                    self.regs[31] = self.pc.wrapping_add(8);
                }
                let cond = if mode64 { (urrs & SBIT64) == 0 } else { (urrs as u32 & SBIT32) == 0 };
                if cond {
                    self.take_branch(pca, i);
                } else if opcode == BGEZL || opcode == BGEZALL {
                    self.squash_delay_slot(pca);
                }
            }
            BLTZ | BLTZL | BLTZAL | BLTZALL => {
                if opcode == BLTZAL || opcode == BLTZALL {
                    self.regs[31] = self.pc.wrapping_add(8);
                }
                let cond = if mode64 { (urrs as i64) < 0 } else { (urrs as u32 as i32) < 0 };
                if cond {
                    self.take_branch(pca, i);
                } else if opcode == BLTZL || opcode == BLTZALL {
                    self.squash_delay_slot(pca);
                }
            }
            BGTZ | BGTZL => {
                let cond = if mode64 { (urrs as i64) > 0 } else { (urrs as u32 as i32) > 0 };
                if cond {
                    self.take_branch(pca, i);
                } else if opcode == BGTZL {
                    self.squash_delay_slot(pca);
                }
            }
            BLEZ | BLEZL => {
                let cond = if mode64 { (urrs as i64) <= 0 } else { (urrs as u32 as i32) <= 0 };
                if cond {
                    self.take_branch(pca, i);
                } else if opcode == BLEZL {
                    self.squash_delay_slot(pca);
                }
            }
            J | JAL => {
                if opcode == JAL {
                    self.regs[31] = self.pc.wrapping_add(8);
                }
                *pca = (self.pc_next & TARGET_COMB) | (i.target26() << 2);
                self.branch = BranchState::Cond;
            }
            JR | JALR => {
                if opcode == JALR {
                    self.regs[i.rd()] = self.pc.wrapping_add(8);
                }
                *pca = urrs;
                self.branch = BranchState::Cond;
            }

            // ==================== loads and stores ====================
            LB => {
                let value = self.read_mem8(bus, self.mem_target(i), true)?;
                self.regs[i.rt()] = sign_extend_8_64(value);
            }
            LBU => {
                let value = self.read_mem8(bus, self.mem_target(i), true)?;
                self.regs[i.rt()] = value as u64;
            }
            LH => {
                let value = self.read_mem16(bus, self.mem_target(i), true)?;
                self.regs[i.rt()] = sign_extend_16_64(value);
            }
            LHU => {
                let value = self.read_mem16(bus, self.mem_target(i), true)?;
                self.regs[i.rt()] = value as u64;
            }
            LW => {
                let value = self.read_mem32(bus, self.mem_target(i), true)?;
                self.regs[i.rt()] = sign_extend_32_64(value);
            }
            LWU => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                let value = self.read_mem32(bus, self.mem_target(i), true)?;
                self.regs[i.rt()] = value as u64;
            }
            LD => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                let value = self.read_mem64(bus, self.mem_target(i), true)?;
                self.regs[i.rt()] = value;
            }
            LWL => {
                let target = self.mem_target(i);
                let value = self.read_mem32(bus, target & !0x3, true)?;
                let index = (target & 0x3) as usize;
                let (mask, shift) = SHIFT_TAB_LEFT[index];
                let merged = ((urrt as u32) & mask) | (value << shift);
                self.regs[i.rt()] = sign_extend_32_64(merged);
            }
            LWR => {
                let target = self.mem_target(i);
                let value = self.read_mem32(bus, target & !0x3, true)?;
                let index = (target & 0x3) as usize;
                let (mask, shift) = SHIFT_TAB_RIGHT[index];
                let merged = ((urrt as u32) & mask) | ((value >> shift) & !mask);
                self.regs[i.rt()] = if index == 0 {
                    sign_extend_32_64(merged)
                } else {
                    merged as u64
                };
            }
            LDL => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                let target = self.mem_target(i);
                let value = self.read_mem64(bus, target & !0x7, true)?;
                let index = (target & 0x7) as usize;
                let (mask, shift) = SHIFT_TAB_LEFT64[index];
                self.regs[i.rt()] = (urrt & mask) | (value << shift);
            }
            LDR => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                let target = self.mem_target(i);
                let value = self.read_mem64(bus, target & !0x7, true)?;
                let index = (target & 0x7) as usize;
                let (mask, shift) = SHIFT_TAB_RIGHT64[index];
                self.regs[i.rt()] = (urrt & mask) | ((value >> shift) & !mask);
            }
            SB => {
                self.write_mem8(bus, self.mem_target(i), urrt as u8, true)?;
            }
            SH => {
                self.write_mem16(bus, self.mem_target(i), urrt as u16, true)?;
            }
            SW => {
                self.write_mem32(bus, self.mem_target(i), urrt as u32, true)?;
            }
            SD => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                self.write_mem64(bus, self.mem_target(i), urrt, true)?;
            }
            SWL => {
                let target = self.mem_target(i);
                let value = self.read_mem32(bus, target & !0x3, true)?;
                let index = (target & 0x3) as usize;
                let (mask, shift) = SHIFT_TAB_LEFT_STORE[index];
                let merged = (value & mask) | (((urrt as u32) >> shift) & !mask);
                self.write_mem32(bus, target & !0x3, merged, true)?;
            }
            SWR => {
                let target = self.mem_target(i);
                let value = self.read_mem32(bus, target & !0x3, true)?;
                let index = (target & 0x3) as usize;
                let (mask, shift) = SHIFT_TAB_RIGHT_STORE[index];
                let merged = (value & mask) | ((urrt as u32) << shift);
                self.write_mem32(bus, target & !0x3, merged, true)?;
            }
            SDL => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                let target = self.mem_target(i);
                let value = self.read_mem64(bus, target & !0x7, true)?;
                let index = (target & 0x7) as usize;
                let (mask, shift) = SHIFT_TAB_LEFT_STORE64[index];
                let merged = (value & mask) | ((urrt >> shift) & !mask);
                self.write_mem64(bus, target & !0x7, merged, true)?;
            }
            SDR => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                let target = self.mem_target(i);
                let value = self.read_mem64(bus, target & !0x7, true)?;
                let index = (target & 0x7) as usize;
                let (mask, shift) = SHIFT_TAB_RIGHT_STORE64[index];
                let merged = (value & mask) | (urrt << shift);
                self.write_mem64(bus, target & !0x7, merged, true)?;
            }

            // ==================== LL/SC ====================
            LL => {
                let target = self.mem_target(i);
                match self.read_mem32(bus, target, true) {
                    Ok(value) => {
                        self.regs[i.rt()] = sign_extend_32_64(value);
                        // the tracked address is physical; the conversion
                        // cannot fail after a successful read
                        if let Ok(phys) = convert_addr(
                            &mut self.cop0,
                            &mut self.tlb,
                            &mut self.tlb_stats,
                            target,
                            false,
                            false,
                        ) {
                            bus.ll_register(self.procno, phys);
                        }
                    }
                    Err(exc) => {
                        bus.ll_unregister(self.procno);
                        return Err(exc);
                    }
                }
            }
            LLD => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                let target = self.mem_target(i);
                match self.read_mem64(bus, target, true) {
                    Ok(value) => {
                        self.regs[i.rt()] = value;
                        if let Ok(phys) = convert_addr(
                            &mut self.cop0,
                            &mut self.tlb,
                            &mut self.tlb_stats,
                            target,
                            false,
                            false,
                        ) {
                            bus.ll_register(self.procno, phys);
                        }
                    }
                    Err(exc) => {
                        bus.ll_unregister(self.procno);
                        return Err(exc);
                    }
                }
            }
            SC => {
                if !bus.ll_holds(self.procno) {
                    self.regs[i.rt()] = 0;
                } else {
                    let target = self.mem_target(i);
                    let lladdr = bus.ll_addr(self.procno);
                    let res = self.write_mem32(bus, target, urrt as u32, true);
                    if res.is_ok() {
                        self.regs[i.rt()] = 1;
                        let phys = convert_addr(
                            &mut self.cop0,
                            &mut self.tlb,
                            &mut self.tlb_stats,
                            target,
                            false,
                            false,
                        );
                        if phys.ok() != lladdr {
                            warn!("LL/SC addresses do not match");
                        }
                    }
                    // SC always stops the address tracking
                    bus.ll_unregister(self.procno);
                    res?;
                }
            }
            SCD => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                if !bus.ll_holds(self.procno) {
                    self.regs[i.rt()] = 0;
                } else {
                    let target = self.mem_target(i);
                    let lladdr = bus.ll_addr(self.procno);
                    let res = self.write_mem64(bus, target, urrt, true);
                    if res.is_ok() {
                        self.regs[i.rt()] = 1;
                        let phys = convert_addr(
                            &mut self.cop0,
                            &mut self.tlb,
                            &mut self.tlb_stats,
                            target,
                            false,
                            false,
                        );
                        if phys.ok() != lladdr {
                            warn!("LLD/SCD addresses do not match");
                        }
                    }
                    bus.ll_unregister(self.procno);
                    res?;
                }
            }

            // ==================== traps ====================
            TEQ => {
                let cond = if mode64 { urrs == urrt } else { urrs as u32 == urrt as u32 };
                if cond {
                    return Err(Exc::Tr);
                }
            }
            TNE => {
                let cond = if mode64 { urrs != urrt } else { urrs as u32 != urrt as u32 };
                if cond {
                    return Err(Exc::Tr);
                }
            }
            TGE => {
                let cond = if mode64 {
                    (urrs as i64) >= (urrt as i64)
                } else {
                    (urrs as u32 as i32) >= (urrt as u32 as i32)
                };
                if cond {
                    return Err(Exc::Tr);
                }
            }
            TGEU => {
                let cond = if mode64 { urrs >= urrt } else { (urrs as u32) >= (urrt as u32) };
                if cond {
                    return Err(Exc::Tr);
                }
            }
            TLT => {
                let cond = if mode64 {
                    (urrs as i64) < (urrt as i64)
                } else {
                    (urrs as u32 as i32) < (urrt as u32 as i32)
                };
                if cond {
                    return Err(Exc::Tr);
                }
            }
            TLTU => {
                let cond = if mode64 { urrs < urrt } else { (urrs as u32) < (urrt as u32) };
                if cond {
                    return Err(Exc::Tr);
                }
            }
            TEQI => {
                let cond = if mode64 {
                    urrs == sign_extend_16_64(i.imm16())
                } else {
                    urrs as u32 == sign_extend_16_32(i.imm16())
                };
                if cond {
                    return Err(Exc::Tr);
                }
            }
            TNEI => {
                let cond = if mode64 {
                    urrs != sign_extend_16_64(i.imm16())
                } else {
                    urrs as u32 != sign_extend_16_32(i.imm16())
                };
                if cond {
                    return Err(Exc::Tr);
                }
            }
            TGEI => {
                let cond = if mode64 {
                    (urrs as i64) >= (sign_extend_16_64(i.imm16()) as i64)
                } else {
                    (urrs as u32 as i32) >= (sign_extend_16_32(i.imm16()) as i32)
                };
                if cond {
                    return Err(Exc::Tr);
                }
            }
            TGEIU => {
                let cond = if mode64 {
                    urrs >= sign_extend_16_64(i.imm16())
                } else {
                    (urrs as u32) >= sign_extend_16_32(i.imm16())
                };
                if cond {
                    return Err(Exc::Tr);
                }
            }
            TLTI => {
                let cond = if mode64 {
                    (urrs as i64) < (sign_extend_16_64(i.imm16()) as i64)
                } else {
                    (urrs as u32 as i32) < (sign_extend_16_32(i.imm16()) as i32)
                };
                if cond {
                    return Err(Exc::Tr);
                }
            }
            TLTIU => {
                let cond = if mode64 {
                    urrs < sign_extend_16_64(i.imm16())
                } else {
                    (urrs as u32) < sign_extend_16_32(i.imm16())
                };
                if cond {
                    return Err(Exc::Tr);
                }
            }

            // ==================== CP0 and friends ====================
            MFC0 => {
                if !self.cop0.cp0_usable() {
                    return Err(self.cp0_unusable());
                }
                self.regs[i.rt()] = sign_extend_32_64(self.cop0.get(i.rd()) as u32);
            }
            DMFC0 => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                if !self.cop0.cp0_usable() {
                    return Err(self.cp0_unusable());
                }
                self.regs[i.rt()] = self.cop0.get(i.rd());
            }
            MTC0 => self.mtc0(i)?,
            DMTC0 => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                self.mtc0(i)?;
            }
            CFC0 | CTC0 => {
                warn!("Invalid instruction CFC0/CTC0");
            }
            MFC1 | MTC1 | CFC1 | CTC1 => self.cop_gate(1)?,
            MFC2 | MTC2 | CFC2 | CTC2 => self.cop_gate(2)?,
            MFC3 | MTC3 | CFC3 | CTC3 => self.cop_gate(3)?,
            DMFC1 | DMTC1 => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                self.cop_gate(1)?;
            }
            DMFC2 | DMTC2 => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                self.cop_gate(2)?;
            }
            DMFC3 | DMTC3 => {
                if !self.cop0.instruction_64bit() {
                    return Err(Exc::RI);
                }
                self.cop_gate(3)?;
            }
            LWC1 | SWC1 | LDC1 | SDC1 => self.cop_gate(1)?,
            LWC2 | SWC2 | LDC2 | SDC2 => self.cop_gate(2)?,

            // FPU-less coprocessor branches: the condition is hard false
            BC0F => {
                if !self.cop0.cp0_usable() {
                    return Err(self.cp0_unusable());
                }
            }
            BC0FL => {
                if !self.cop0.cp0_usable() {
                    return Err(self.cp0_unusable());
                }
                self.squash_delay_slot(pca);
            }
            BC0T | BC0TL => {
                if !self.cop0.cp0_usable() {
                    return Err(self.cp0_unusable());
                }
                self.take_branch(pca, i);
            }
            BC1F | BC2F | BC3F => {
                let cop = (i.op() & 0x3) as usize;
                self.cop_gate(cop)?;
            }
            BC1FL | BC2FL | BC3FL => {
                let cop = (i.op() & 0x3) as usize;
                self.cop_gate(cop)?;
                self.squash_delay_slot(pca);
            }
            BC1T | BC2T | BC3T | BC1TL | BC2TL | BC3TL => {
                let cop = (i.op() & 0x3) as usize;
                self.cop_gate(cop)?;
                self.take_branch(pca, i);
            }

            TLBP => {
                if !self.cop0.cp0_usable() {
                    return Err(self.cp0_unusable());
                }
                self.tlb.probe(&mut self.cop0);
            }
            TLBR => {
                if !self.cop0.cp0_usable() {
                    return Err(self.cp0_unusable());
                }
                self.tlb.read_entry(&mut self.cop0);
            }
            TLBWI => self.tlb_write_op(false)?,
            TLBWR => self.tlb_write_op(true)?,
            ERET => {
                if !self.cop0.cp0_usable() {
                    return Err(self.cp0_unusable());
                }
                // ERET breaks the LL reservation
                bus.ll_unregister(self.procno);
                if self.branch != BranchState::None {
                    warn!("ERET in a branch delay slot");
                }
                let status = self.cop0.reg(Cp0Reg::Status);
                if self.cop0.status_erl() {
                    self.pc_next = self.cop0.reg(Cp0Reg::ErrorEPC);
                    *pca = self.pc_next.wrapping_add(4);
                    self.cop0.set(Cp0Reg::Status, status & !STATUS_ERL_MASK);
                } else {
                    self.pc_next = self.cop0.reg(Cp0Reg::EPC);
                    *pca = self.pc_next.wrapping_add(4);
                    self.cop0.set(Cp0Reg::Status, status & !STATUS_EXL_MASK);
                }
            }

            // ==================== the rest ====================
            SYSCALL => return Err(Exc::Sys),
            BREAK => return Err(Exc::Bp),
            SYNC => {
                // no synchronisation is needed
            }
            CACHE => {
                // caches are not simulated
            }
            WAIT => {
                self.pc_next = self.pc;
                *pca = self.pc.wrapping_add(4);
                self.stdby = true;
            }

            // machine debugging encodings
            DVAL => {
                info!(
                    "Debug: Value {:#X} = {} ({})",
                    self.regs[4], self.regs[4], self.regs[4] as i64
                );
            }
            DTRC => {
                if !bus.trace {
                    self.update_trace_shadow();
                }
                bus.trace = true;
            }
            DTRO => {
                bus.trace = false;
            }
            DRV => {
                info!("Debug: register view");
                info!("{}", disassembler::reg_dump(self));
            }
            DHLT => {
                if bus.trace {
                    info!("Debug: Machine halt");
                }
                bus.events.halt = true;
            }
            DINT => {
                bus.events.interactive = true;
            }

            RES => return Err(Exc::RI),
            QRES => {
                // quiet reserved: no effect
            }
        }

        Ok(())
    }

    // ==================== exception engine ====================

    /// Rewrites the processor state for the given exception: Cause, EPC,
    /// EXL and the vectored program counter.
    fn handle_exception(&mut self, exc: Exc) {
        let mut tlb_refill = false;
        let exc = match exc {
            Exc::TLBLRefill => {
                tlb_refill = true;
                Exc::TLBL
            }
            Exc::TLBSRefill => {
                tlb_refill = true;
                Exc::TLBS
            }
            other => other,
        };

        // WAIT wakes on any exception
        self.stdby = false;

        debug!("cpu{}: raised exception {:?} at {:#018X}", self.procno, exc, self.pc);

        let mut cause = self.cop0.reg(Cp0Reg::Cause) & !CAUSE_EXCCODE_MASK;
        cause |= exc.code() << CAUSE_EXCCODE_SHIFT;

        // exception branch control
        cause &= !CAUSE_BD_MASK;
        if self.branch == BranchState::Passed {
            cause |= CAUSE_BD_MASK;
        }
        self.cop0.set(Cp0Reg::Cause, cause);

        if !self.cop0.status_exl() {
            self.cop0.set(Cp0Reg::EPC, self.excaddr);
            if exc == Exc::Int && self.branch != BranchState::Cond {
                self.cop0.set(Cp0Reg::EPC, self.pc);
            }
        }

        let mut vector = if self.cop0.status_bev() {
            if exc != Exc::Reset { EXCEPTION_BOOT_BASE_ADDRESS } else { HARD_RESET_START_ADDRESS }
        } else {
            if exc != Exc::Reset { EXCEPTION_NORMAL_BASE_ADDRESS } else { HARD_RESET_START_ADDRESS }
        };

        // the TLB Refill handler sits at the vector base itself
        if self.cop0.status_exl() || !tlb_refill {
            vector += EXCEPTION_OFFSET;
        }

        self.set_pc(vector);

        let status = self.cop0.reg(Cp0Reg::Status);
        self.cop0.set(Cp0Reg::Status, status | STATUS_EXL_MASK);
    }

    // ==================== interrupts, timer, random ====================

    /// Per-cycle control: pending interrupt delivery, Count/Compare timer
    /// and the Random register rotation.
    fn manage(&mut self, res: Option<Exc>) {
        let mut res = res;

        if res.is_none()
            && !self.cop0.status_exl()
            && !self.cop0.status_erl()
            && self.cop0.status_ie()
            && (self.cop0.reg(Cp0Reg::Cause) & self.cop0.reg(Cp0Reg::Status) & CAUSE_IP_MASK) != 0
        {
            res = Some(Exc::Int);
        }

        if let Some(exc) = res {
            self.handle_exception(exc);
        }

        let count = self.cop0.reg(Cp0Reg::Count).wrapping_add(1);
        self.cop0.set(Cp0Reg::Count, count);

        let mut random = self.cop0.random_random();
        random = if random == 0 { 47 } else { random - 1 };
        if random < self.cop0.wired_w() {
            random = 47;
        }
        self.cop0.set(Cp0Reg::Random, random as u64);

        // Count and Compare are truly 32-bit even in 64-bit mode
        if count as u32 == self.cop0.reg(Cp0Reg::Compare) as u32 {
            let cause = self.cop0.reg(Cp0Reg::Cause);
            self.cop0.set(Cp0Reg::Cause, cause | (1 << CAUSE_IP7_SHIFT));
        }
    }

    /// Fetch, decode and execute one instruction.
    fn instruction(&mut self, bus: &mut Bus) -> Option<Exc> {
        match self.read_ins(bus, self.pc, true) {
            Ok(icode) => {
                self.last_icode = icode;
                self.last_fetch_ok = true;
                let i = Instruction(icode);
                self.execute(bus, &i).err()
            }
            Err(exc) => {
                self.last_fetch_ok = false;
                Some(exc)
            }
        }
    }

    /// One processor cycle: instruction (unless parked by WAIT) plus the
    /// per-cycle management, cycle accounting and delay-slot bookkeeping.
    pub fn step(&mut self, bus: &mut Bus) {
        let mut res = None;

        if !self.stdby {
            res = self.instruction(bus);
        } else {
            self.last_fetch_ok = false;
        }

        self.manage(res);

        if self.stdby {
            self.w_cycles += 1;
        } else if self.cop0.kernel_mode() {
            self.k_cycles += 1;
        } else {
            self.u_cycles += 1;
        }

        self.branch = match self.branch {
            BranchState::Cond => BranchState::Passed,
            _ => BranchState::None,
        };
    }
}

use tracing::{error, info};

use crate::core::config::MachineConfig;
use crate::core::cpu::disassembler::{self, RegNaming};
use crate::core::cpu::Cpu;
use crate::core::debugger;
use crate::core::device::{Device, IrqQueue};
use crate::core::memory::bus::Bus;
use crate::core::memory::PhysMemArea;

/*
Step scheduler
--------------
One outer step advances the whole machine by one cycle: processors first in
strict round-robin order, then every device's per-cycle hook, with the slow
hook every 4096th cycle. There is no preemption; the only suspension points
are the boundaries between cycles, where breakpoint hits, the stepping
counter and the user break flag are honored.
*/

const STEP4K_PERIOD: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    /// A breakpoint, the stepping counter or the user asked for control;
    /// the caller owns the interactive session.
    Interactive,
    Halted,
}

pub struct Emulator {
    cpus: Vec<Cpu>,
    bus: Bus,
    irq: IrqQueue,
    msteps: u64,
    /// Cycles left until the stepping counter requests interactive mode;
    /// zero disables it.
    stepping: u64,
    /// User break stage: the first break requests interactive mode, the
    /// second asks for a clean exit.
    break_stage: u32,
    /// Machine-wide per-line interrupt totals, observability only.
    intr_totals: [u64; crate::core::cpu::INTR_COUNT],
    iregch: bool,
    ireg: RegNaming,
}

impl Emulator {
    pub fn new(cpu_count: usize, nondet: bool) -> Self {
        let count = cpu_count.max(1);
        Emulator {
            cpus: (0..count).map(Cpu::new).collect(),
            bus: Bus::new(nondet),
            irq: IrqQueue::new(),
            msteps: 0,
            stepping: 0,
            break_stage: 0,
            intr_totals: [0; crate::core::cpu::INTR_COUNT],
            iregch: false,
            ireg: RegNaming::Abi,
        }
    }

    /// Builds the machine a configuration file describes.
    pub fn from_config(config: &MachineConfig) -> Result<Self, String> {
        let mut emu = Emulator::new(config.cpus, config.nondet);

        for mem in &config.memory {
            let area = if let Some(ref path) = mem.fmap {
                PhysMemArea::fmap(&mem.name, mem.start, path, mem.writable)
                    .map_err(|e| format!("Area '{}': {}", mem.name, e))?
            } else {
                let size = mem
                    .size
                    .ok_or_else(|| format!("Area '{}' has neither size nor fmap", mem.name))?;
                let mut area = PhysMemArea::generic(&mem.name, mem.start, size, mem.writable)
                    .map_err(|e| format!("Area '{}': {}", mem.name, e))?;
                if let Some(value) = mem.fill {
                    area.fill(value);
                }
                if let Some(ref path) = mem.image {
                    area.load(path).map_err(|e| format!("Area '{}': {}", mem.name, e))?;
                }
                area
            };
            emu.bus.add_area(area)?;
        }

        emu.bus.trace = config.trace.enabled;
        emu.iregch = config.trace.iregch;
        emu.ireg = RegNaming::from_index(config.trace.ireg);
        Ok(emu)
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut Bus {
        &mut self.bus
    }

    pub fn cpu(&self, procno: usize) -> &Cpu {
        &self.cpus[procno]
    }

    pub fn cpu_mut(&mut self, procno: usize) -> &mut Cpu {
        &mut self.cpus[procno]
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    pub fn msteps(&self) -> u64 {
        self.msteps
    }

    pub fn intr_totals(&self) -> &[u64; crate::core::cpu::INTR_COUNT] {
        &self.intr_totals
    }

    pub fn add_device(&mut self, device: Box<dyn Device>) -> Result<(), String> {
        self.bus.add_device(device)
    }

    /// Arm the stepping counter: interactive mode after `count` cycles.
    pub fn set_stepping(&mut self, count: u64) {
        self.stepping = count;
    }

    /// User break (SIGINT and friends): first request interactive mode,
    /// a repeated break exits cleanly.
    pub fn request_break(&mut self) {
        self.break_stage += 1;
        if self.break_stage > 1 {
            self.bus.events.halt = true;
        } else {
            self.bus.events.interactive = true;
        }
    }

    /// One machine cycle. Breakpoints set flags when the instruction at
    /// their address retires; the stop is honored here, between cycles.
    pub fn step(&mut self) -> StepOutcome {
        if self.bus.events.halt {
            return StepOutcome::Halted;
        }
        if self.bus.events.interactive || self.bus.events.debugger {
            self.bus.events.clear();
            self.break_stage = 0;
            return StepOutcome::Interactive;
        }

        if self.stepping > 0 {
            self.stepping -= 1;
            if self.stepping == 0 {
                self.bus.events.interactive = true;
            }
        }

        // processors, in round-robin order
        for cpu in self.cpus.iter_mut() {
            let pc_before = cpu.pc();
            let parked = cpu.stdby();

            cpu.step(&mut self.bus);

            if self.bus.trace && cpu.last_fetch_ok() {
                let d = disassembler::disassemble(pc_before, cpu.last_icode(), self.ireg);
                if self.iregch {
                    let diff = disassembler::modified_regs_dump(cpu, self.ireg);
                    if diff.is_empty() {
                        info!("cpu{}  {}", cpu.procno(), d.formatted);
                    } else {
                        info!("cpu{}  {}  [{}]", cpu.procno(), d.formatted, diff);
                    }
                    cpu.update_trace_shadow();
                } else {
                    info!("cpu{}  {}", cpu.procno(), d.formatted);
                }
            }

            // code breakpoints fire once the instruction retired
            if !parked {
                for bp in cpu.breakpoints.iter_mut() {
                    if bp.pc == pc_before {
                        debugger::code_breakpoint_hit(bp, &mut self.bus.events);
                    }
                }
            }
        }

        // devices, after the processors
        self.msteps += 1;
        let fourk = self.msteps % STEP4K_PERIOD == 0;
        self.bus.step_devices(fourk, &mut self.irq);

        // forward device interrupt requests to the target processors
        for req in self.irq.drain() {
            match self.cpus.get_mut(req.procno) {
                Some(cpu) => {
                    if req.up {
                        cpu.interrupt_up(req.line);
                        self.intr_totals[req.line] += 1;
                    } else {
                        cpu.interrupt_down(req.line);
                    }
                }
                None => error!("Interrupt request for unknown cpu{}", req.procno),
            }
        }

        StepOutcome::Continue
    }

    /// Run until halted, a stop request or the optional cycle limit.
    pub fn run(&mut self, max_steps: Option<u64>) -> StepOutcome {
        loop {
            if let Some(limit) = max_steps {
                if self.msteps >= limit {
                    return StepOutcome::Interactive;
                }
            }
            match self.step() {
                StepOutcome::Continue => {}
                outcome => return outcome,
            }
        }
    }

    /// Teardown: device hooks, file write-back and the cycle statistics.
    pub fn shutdown(&mut self) {
        self.bus.shutdown();
        if self.msteps > 0 {
            info!("Cycles: {}", self.msteps);
            for cpu in &self.cpus {
                info!(
                    "cpu{}: kernel {} user {} wait {}  tlb refill {} invalid {} modified {}",
                    cpu.procno(),
                    cpu.k_cycles,
                    cpu.u_cycles,
                    cpu.w_cycles,
                    cpu.tlb_stats.refill,
                    cpu.tlb_stats.invalid,
                    cpu.tlb_stats.modified
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::debugger::{BreakpointKind, CodeBreakpoint};

    /// Device counting its step hooks and raising a line when asked.
    struct TickDevice {
        steps: u64,
        steps4k: u64,
        raise_at: Option<u64>,
    }

    impl Device for TickDevice {
        fn name(&self) -> &str {
            "tick"
        }

        fn step(&mut self, irq: &mut IrqQueue) {
            self.steps += 1;
            if Some(self.steps) == self.raise_at {
                irq.raise(0, 3);
            }
        }

        fn step4k(&mut self, _irq: &mut IrqQueue) {
            self.steps4k += 1;
        }

        fn read32(&mut self, _procno: usize, addr: u64, val: &mut u32) {
            if addr == 0x1_0000_0000 {
                *val = self.steps as u32;
            }
        }
    }

    fn emulator_with_boot() -> Emulator {
        let mut emu = Emulator::new(1, false);
        emu.bus_mut()
            .add_area(PhysMemArea::generic("boot", 0x1FC0_0000, 0x4000, true).unwrap())
            .unwrap();
        emu
    }

    #[test]
    fn devices_step_after_cpus_and_every_4096th() {
        let mut emu = emulator_with_boot();
        emu.add_device(Box::new(TickDevice { steps: 0, steps4k: 0, raise_at: None })).unwrap();
        for _ in 0..STEP4K_PERIOD + 1 {
            assert_eq!(emu.step(), StepOutcome::Continue);
        }
        // the device window reflects the per-cycle count
        let val = emu.bus_mut().read32(0, 0x1_0000_0000, false);
        assert_eq!(val as u64, STEP4K_PERIOD + 1);
        assert_eq!(emu.msteps(), STEP4K_PERIOD + 1);
    }

    #[test]
    fn device_interrupt_reaches_the_cpu() {
        let mut emu = emulator_with_boot();
        emu.add_device(Box::new(TickDevice { steps: 0, steps4k: 0, raise_at: Some(1) })).unwrap();
        emu.step();
        // Cause.IP3 set and the per-line counter bumped
        assert_ne!(emu.cpu(0).cop0().cause_ip() & (1 << 3), 0);
        assert_eq!(emu.cpu(0).intr[3], 1);
    }

    #[test]
    fn stepping_counter_requests_interactive() {
        let mut emu = emulator_with_boot();
        emu.set_stepping(3);
        assert_eq!(emu.step(), StepOutcome::Continue);
        assert_eq!(emu.step(), StepOutcome::Continue);
        assert_eq!(emu.step(), StepOutcome::Continue);
        // the request is honored at the next cycle boundary
        assert_eq!(emu.step(), StepOutcome::Interactive);
        assert_eq!(emu.msteps(), 3);
    }

    #[test]
    fn code_breakpoint_stops_after_retire() {
        let mut emu = emulator_with_boot();
        let boot_pc = emu.cpu(0).pc();
        emu.cpu_mut(0)
            .breakpoints
            .push(CodeBreakpoint::new(boot_pc, BreakpointKind::Simulator));
        // the breakpointed instruction itself still runs
        assert_eq!(emu.step(), StepOutcome::Continue);
        assert_eq!(emu.cpu(0).breakpoints[0].hits, 1);
        assert_eq!(emu.step(), StepOutcome::Interactive);
        assert_eq!(emu.msteps(), 1);
    }

    #[test]
    fn double_break_halts() {
        let mut emu = emulator_with_boot();
        emu.request_break();
        emu.request_break();
        assert_eq!(emu.step(), StepOutcome::Halted);
    }

    #[test]
    fn run_honors_the_cycle_limit() {
        let mut emu = emulator_with_boot();
        assert_eq!(emu.run(Some(10)), StepOutcome::Interactive);
        assert_eq!(emu.msteps(), 10);
    }

    #[test]
    fn from_config_builds_the_described_machine() {
        let config = MachineConfig::default();
        let emu = Emulator::from_config(&config).unwrap();
        assert_eq!(emu.cpu_count(), 1);
        assert_eq!(emu.bus().areas().len(), 2);
        assert_eq!(emu.bus().areas()[1].start, 0x1FC0_0000);
    }

    #[test]
    fn nondet_device_requires_permission() {
        struct HostClock;
        impl Device for HostClock {
            fn name(&self) -> &str {
                "host-clock"
            }
            fn nondet(&self) -> bool {
                true
            }
        }

        let mut emu = Emulator::new(1, false);
        assert!(emu.add_device(Box::new(HostClock)).is_err());
        let mut emu = Emulator::new(1, true);
        assert!(emu.add_device(Box::new(HostClock)).is_ok());
    }
}

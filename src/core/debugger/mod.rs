use tracing::info;

/*
Breakpoints
-----------
Two independent families:

 - memory breakpoints fire on physical read/write accesses crossing the
   watched range and live on the bus;
 - code breakpoints fire on a virtual PC and live on the owning processor.

Both come in two kinds. A simulator breakpoint reports to the user and asks
the scheduler for interactive mode; a debugger breakpoint raises an event
for the remote stub. Either way the simulator stops only after the
instruction at the breakpointed address has retired.
*/

pub const ACCESS_READ: u8 = 1 << 0;
pub const ACCESS_WRITE: u8 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointKind {
    Simulator,
    Debugger,
}

pub struct MemBreakpoint {
    pub addr: u64,
    pub size: u64,
    pub kind: BreakpointKind,
    pub access: u8,
    pub hits: u64,
}

impl MemBreakpoint {
    pub fn new(addr: u64, size: u64, kind: BreakpointKind, access: u8) -> Self {
        MemBreakpoint { addr, size, kind, access, hits: 0 }
    }
}

pub struct CodeBreakpoint {
    pub pc: u64,
    pub kind: BreakpointKind,
    pub hits: u64,
}

impl CodeBreakpoint {
    pub fn new(pc: u64, kind: BreakpointKind) -> Self {
        CodeBreakpoint { pc, kind, hits: 0 }
    }
}

/// Requests produced inside a tick (by breakpoint hits or debugging
/// opcodes) and consumed by the scheduler between ticks.
#[derive(Default)]
pub struct MachineEvents {
    /// The outer control loop should suspend and hand over to the user.
    pub interactive: bool,
    /// The remote debugger stub should be notified.
    pub debugger: bool,
    /// The machine should shut down cleanly.
    pub halt: bool,
}

impl MachineEvents {
    pub fn new() -> Self {
        MachineEvents::default()
    }

    pub fn clear(&mut self) {
        self.interactive = false;
        self.debugger = false;
    }
}

/// Fire a memory breakpoint: bump the hit counter and flag the matching
/// event for the scheduler.
pub fn memory_breakpoint_hit(bp: &mut MemBreakpoint, access: u8, events: &mut MachineEvents) {
    bp.hits += 1;
    match bp.kind {
        BreakpointKind::Simulator => {
            if access == ACCESS_READ {
                info!("Debug: Read from address {:#011X}", bp.addr);
            } else {
                info!("Debug: Written to address {:#011X}", bp.addr);
            }
            events.interactive = true;
        }
        BreakpointKind::Debugger => {
            events.debugger = true;
        }
    }
}

/// Fire a code breakpoint after the instruction at its address retired.
pub fn code_breakpoint_hit(bp: &mut CodeBreakpoint, events: &mut MachineEvents) {
    bp.hits += 1;
    match bp.kind {
        BreakpointKind::Simulator => {
            info!("Debug: Hit breakpoint at {:#018X}", bp.pc);
            events.interactive = true;
        }
        BreakpointKind::Debugger => {
            events.debugger = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulator_hit_requests_interactive() {
        let mut events = MachineEvents::new();
        let mut bp = MemBreakpoint::new(0x1000, 4, BreakpointKind::Simulator, ACCESS_WRITE);
        memory_breakpoint_hit(&mut bp, ACCESS_WRITE, &mut events);
        assert_eq!(bp.hits, 1);
        assert!(events.interactive);
        assert!(!events.debugger);
    }

    #[test]
    fn debugger_hit_raises_event() {
        let mut events = MachineEvents::new();
        let mut bp = CodeBreakpoint::new(0xFFFF_FFFF_BFC0_0000, BreakpointKind::Debugger);
        code_breakpoint_hit(&mut bp, &mut events);
        assert_eq!(bp.hits, 1);
        assert!(events.debugger);
        assert!(!events.interactive);
    }
}

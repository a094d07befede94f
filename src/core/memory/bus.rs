use tracing::{debug, warn};

use crate::core::debugger::{self, MachineEvents, MemBreakpoint, ACCESS_READ, ACCESS_WRITE};
use crate::core::device::{Device, IrqQueue};
use crate::core::memory::{mem_read, mem_write, PhysMemArea, DEFAULT_MEMORY_VALUE};

/// One active LL reservation: a processor index plus the physical address
/// it loaded from. At most one entry per processor.
struct LlEntry {
    procno: usize,
    addr: u64,
}

/*
Physical bus
------------
Routes aligned 8/16/32/64-bit accesses between the ordered memory area list
and the device windows. Area lookup is first-match; if no area claims the
address the device list is walked in registration order. Unmapped reads
return all-ones truncated to the access width.

Protected accesses additionally consult the memory breakpoints, and every
successful write to an area invalidates any matching LL reservation before
it becomes observable.
*/
pub struct Bus {
    areas: Vec<PhysMemArea>,
    devices: Vec<Box<dyn Device>>,
    mem_breakpoints: Vec<MemBreakpoint>,
    ll_entries: Vec<LlEntry>,
    nondet_allowed: bool,
    pub events: MachineEvents,
    /// Instruction trace toggle, also reachable from the guest through the
    /// machine-debugging encodings.
    pub trace: bool,
}

impl Bus {
    pub fn new(nondet_allowed: bool) -> Self {
        Bus {
            areas: Vec::new(),
            devices: Vec::new(),
            mem_breakpoints: Vec::new(),
            ll_entries: Vec::new(),
            nondet_allowed,
            events: MachineEvents::new(),
            trace: false,
        }
    }

    /// Places a memory area into the physical space. Overlap is forbidden.
    pub fn add_area(&mut self, area: PhysMemArea) -> Result<(), String> {
        for existing in &self.areas {
            let overlap = area.start < existing.start + existing.size()
                && existing.start < area.start + area.size();
            if overlap {
                return Err(format!(
                    "Memory area '{}' [{:#011X}..{:#011X}) overlaps '{}'",
                    area.name,
                    area.start,
                    area.start + area.size(),
                    existing.name
                ));
            }
        }
        self.areas.push(area);
        Ok(())
    }

    pub fn add_device(&mut self, device: Box<dyn Device>) -> Result<(), String> {
        if device.nondet() && !self.nondet_allowed {
            return Err(format!(
                "Device '{}' is non-deterministic and the machine forbids it",
                device.name()
            ));
        }
        self.devices.push(device);
        Ok(())
    }

    pub fn add_mem_breakpoint(&mut self, bp: MemBreakpoint) {
        self.mem_breakpoints.push(bp);
    }

    pub fn remove_mem_breakpoint(&mut self, addr: u64) -> bool {
        let before = self.mem_breakpoints.len();
        self.mem_breakpoints.retain(|bp| bp.addr != addr);
        self.mem_breakpoints.len() != before
    }

    pub fn mem_breakpoints(&self) -> &[MemBreakpoint] {
        &self.mem_breakpoints
    }

    pub fn areas(&self) -> &[PhysMemArea] {
        &self.areas
    }

    pub fn area_mut(&mut self, name: &str) -> Option<&mut PhysMemArea> {
        self.areas.iter_mut().find(|a| a.name == name)
    }

    /// Per-cycle device pass, plus the slow pass every 4096th cycle.
    pub fn step_devices(&mut self, fourk: bool, irq: &mut IrqQueue) {
        for dev in self.devices.iter_mut() {
            dev.step(irq);
        }
        if fourk {
            for dev in self.devices.iter_mut() {
                dev.step4k(irq);
            }
        }
    }

    /// Teardown: device `done` hooks, then file-mapped areas are flushed.
    pub fn shutdown(&mut self) {
        for dev in self.devices.iter_mut() {
            dev.done();
        }
        for area in &self.areas {
            if let crate::core::memory::AreaBacking::FileMapped(ref path) = area.backing {
                if area.writable {
                    if let Err(e) = area.save(path) {
                        warn!("Area '{}' could not be written back to {}: {}", area.name, path.display(), e);
                    }
                }
            }
        }
    }

    // ==================== LL/SC tracker ====================

    /// Ensures the processor appears once in the reservation list.
    pub fn ll_register(&mut self, procno: usize, addr: u64) {
        for entry in self.ll_entries.iter_mut() {
            if entry.procno == procno {
                entry.addr = addr;
                return;
            }
        }
        self.ll_entries.push(LlEntry { procno, addr });
    }

    pub fn ll_unregister(&mut self, procno: usize) {
        self.ll_entries.retain(|e| e.procno != procno);
    }

    pub fn ll_holds(&self, procno: usize) -> bool {
        self.ll_entries.iter().any(|e| e.procno == procno)
    }

    pub fn ll_addr(&self, procno: usize) -> Option<u64> {
        self.ll_entries.iter().find(|e| e.procno == procno).map(|e| e.addr)
    }

    /// Bus-write notification: any reservation on the written address is
    /// eagerly dropped, so a later SC on that processor fails.
    fn sc_control(&mut self, addr: u64) {
        self.ll_entries.retain(|e| {
            if e.addr == addr {
                debug!("LL reservation of cpu{} broken by write to {:#011X}", e.procno, addr);
                false
            } else {
                true
            }
        });
    }

    // ==================== access plumbing ====================

    fn find_area(&self, addr: u64, bytes: u64) -> Option<usize> {
        self.areas
            .iter()
            .position(|a| a.contains(addr) && addr + bytes <= a.start + a.size())
    }

    fn check_breakpoints(&mut self, addr: u64, bytes: u64, access: u8) {
        for bp in self.mem_breakpoints.iter_mut() {
            let intersects = bp.addr < addr + bytes && addr < bp.addr + bp.size;
            if intersects && (bp.access & access) != 0 {
                debugger::memory_breakpoint_hit(bp, access, &mut self.events);
                break;
            }
        }
    }

    fn dev_read32(&mut self, procno: usize, addr: u64) -> u32 {
        let mut val = DEFAULT_MEMORY_VALUE as u32;
        for dev in self.devices.iter_mut() {
            dev.read32(procno, addr, &mut val);
        }
        val
    }

    fn dev_read64(&mut self, procno: usize, addr: u64) -> u64 {
        let mut val = DEFAULT_MEMORY_VALUE;
        for dev in self.devices.iter_mut() {
            dev.read64(procno, addr, &mut val);
        }
        val
    }

    fn dev_write32(&mut self, procno: usize, addr: u64, val: u32) -> bool {
        let mut written = false;
        for dev in self.devices.iter_mut() {
            written |= dev.write32(procno, addr, val);
        }
        written
    }

    fn dev_write64(&mut self, procno: usize, addr: u64, val: u64) -> bool {
        let mut written = false;
        for dev in self.devices.iter_mut() {
            written |= dev.write64(procno, addr, val);
        }
        written
    }

    fn read_phys<const SIZE: usize>(&mut self, procno: usize, addr: u64, protected: bool) -> u64 {
        let bytes = (SIZE >> 3) as u64;
        match self.find_area(addr, bytes) {
            Some(index) => {
                if protected {
                    self.check_breakpoints(addr, bytes, ACCESS_READ);
                }
                let area = &self.areas[index];
                mem_read::<SIZE>((addr - area.start) as usize, &area.data)
            }
            None => {
                if SIZE == 64 {
                    self.dev_read64(procno, addr)
                } else {
                    (self.dev_read32(procno, addr) as u64) & (DEFAULT_MEMORY_VALUE >> (64 - SIZE))
                }
            }
        }
    }

    fn write_phys<const SIZE: usize>(&mut self, procno: usize, addr: u64, val: u64, protected: bool) -> bool {
        let bytes = (SIZE >> 3) as u64;
        match self.find_area(addr, bytes) {
            Some(index) => {
                if !self.areas[index].writable && protected {
                    return false;
                }
                self.sc_control(addr);
                if protected {
                    self.check_breakpoints(addr, bytes, ACCESS_WRITE);
                }
                let area = &mut self.areas[index];
                let offset = (addr - area.start) as usize;
                mem_write::<SIZE>(offset, val, &mut area.data);
                true
            }
            None => {
                let written = if SIZE == 64 {
                    self.dev_write64(procno, addr, val)
                } else {
                    self.dev_write32(procno, addr, val as u32)
                };
                if written {
                    self.sc_control(addr);
                }
                written
            }
        }
    }

    // ==================== public contract ====================

    pub fn read8(&mut self, procno: usize, addr: u64, protected: bool) -> u8 {
        self.read_phys::<8>(procno, addr, protected) as u8
    }

    pub fn read16(&mut self, procno: usize, addr: u64, protected: bool) -> u16 {
        self.read_phys::<16>(procno, addr, protected) as u16
    }

    pub fn read32(&mut self, procno: usize, addr: u64, protected: bool) -> u32 {
        self.read_phys::<32>(procno, addr, protected) as u32
    }

    pub fn read64(&mut self, procno: usize, addr: u64, protected: bool) -> u64 {
        self.read_phys::<64>(procno, addr, protected)
    }

    pub fn write8(&mut self, procno: usize, addr: u64, val: u8, protected: bool) -> bool {
        self.write_phys::<8>(procno, addr, val as u64, protected)
    }

    pub fn write16(&mut self, procno: usize, addr: u64, val: u16, protected: bool) -> bool {
        self.write_phys::<16>(procno, addr, val as u64, protected)
    }

    pub fn write32(&mut self, procno: usize, addr: u64, val: u32, protected: bool) -> bool {
        self.write_phys::<32>(procno, addr, val as u64, protected)
    }

    pub fn write64(&mut self, procno: usize, addr: u64, val: u64, protected: bool) -> bool {
        self.write_phys::<64>(procno, addr, val, protected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::debugger::BreakpointKind;

    /// Single 32-bit register window used by the routing tests.
    struct RegDevice {
        base: u64,
        reg: u32,
    }

    impl Device for RegDevice {
        fn name(&self) -> &str {
            "reg"
        }

        fn read32(&mut self, _procno: usize, addr: u64, val: &mut u32) {
            if addr == self.base {
                *val = self.reg;
            }
        }

        fn write32(&mut self, _procno: usize, addr: u64, val: u32) -> bool {
            if addr == self.base {
                self.reg = val;
                true
            } else {
                false
            }
        }
    }

    fn bus_with_ram() -> Bus {
        let mut bus = Bus::new(false);
        bus.add_area(PhysMemArea::generic("ram", 0x0, 0x4000, true).unwrap()).unwrap();
        bus.add_area(PhysMemArea::generic("rom", 0x1FC0_0000, 0x1000, false).unwrap()).unwrap();
        bus
    }

    #[test]
    fn area_read_write_round_trip() {
        let mut bus = bus_with_ram();
        assert!(bus.write32(0, 0x100, 0xCAFE_BABE, true));
        assert_eq!(bus.read32(0, 0x100, true), 0xCAFE_BABE);
        assert_eq!(bus.read16(0, 0x100, true), 0xBABE);
        assert_eq!(bus.read8(0, 0x103, true), 0xCA);
        assert!(bus.write64(0, 0x200, 0x1122_3344_5566_7788, true));
        assert_eq!(bus.read64(0, 0x200, true), 0x1122_3344_5566_7788);
    }

    #[test]
    fn rom_rejects_protected_writes_only() {
        let mut bus = bus_with_ram();
        assert!(!bus.write32(0, 0x1FC0_0000, 1, true));
        assert_eq!(bus.read32(0, 0x1FC0_0000, true), 0);
        // loaders write unprotected
        assert!(bus.write32(0, 0x1FC0_0000, 0x2A, false));
        assert_eq!(bus.read32(0, 0x1FC0_0000, true), 0x2A);
    }

    #[test]
    fn unmapped_reads_return_all_ones() {
        let mut bus = bus_with_ram();
        assert_eq!(bus.read8(0, 0x9000_0000, true), 0xFF);
        assert_eq!(bus.read16(0, 0x9000_0000, true), 0xFFFF);
        assert_eq!(bus.read32(0, 0x9000_0000, true), 0xFFFF_FFFF);
        assert_eq!(bus.read64(0, 0x9000_0000, true), 0xFFFF_FFFF_FFFF_FFFF);
        assert!(!bus.write32(0, 0x9000_0000, 1, true));
    }

    #[test]
    fn device_window_claims_addresses() {
        let mut bus = bus_with_ram();
        bus.add_device(Box::new(RegDevice { base: 0x1_0000_0000, reg: 0x55 })).unwrap();
        assert_eq!(bus.read32(0, 0x1_0000_0000, true), 0x55);
        assert!(bus.write32(0, 0x1_0000_0000, 0x99, true));
        assert_eq!(bus.read32(0, 0x1_0000_0000, true), 0x99);
        // outside the window the device stays silent
        assert_eq!(bus.read32(0, 0x1_0000_0004, true), 0xFFFF_FFFF);
    }

    #[test]
    fn overlapping_areas_are_rejected() {
        let mut bus = bus_with_ram();
        let overlap = PhysMemArea::generic("clash", 0x2000, 0x4000, true).unwrap();
        assert!(bus.add_area(overlap).is_err());
    }

    #[test]
    fn write_breaks_matching_reservation() {
        let mut bus = bus_with_ram();
        bus.ll_register(0, 0x100);
        bus.ll_register(1, 0x100);
        bus.ll_register(2, 0x200);
        assert!(bus.write32(3, 0x100, 7, true));
        assert!(!bus.ll_holds(0));
        assert!(!bus.ll_holds(1));
        assert!(bus.ll_holds(2));
    }

    #[test]
    fn reservation_is_unique_per_cpu() {
        let mut bus = bus_with_ram();
        bus.ll_register(0, 0x100);
        bus.ll_register(0, 0x300);
        assert_eq!(bus.ll_addr(0), Some(0x300));
        bus.ll_unregister(0);
        assert!(!bus.ll_holds(0));
    }

    #[test]
    fn memory_breakpoint_fires_on_matching_access() {
        let mut bus = bus_with_ram();
        bus.add_mem_breakpoint(MemBreakpoint::new(0x104, 4, BreakpointKind::Simulator, ACCESS_WRITE));
        bus.read32(0, 0x104, true);
        assert_eq!(bus.mem_breakpoints()[0].hits, 0);
        // partially overlapping write still fires
        bus.write32(0, 0x104, 1, true);
        assert_eq!(bus.mem_breakpoints()[0].hits, 1);
        assert!(bus.events.interactive);
        // unprotected accesses bypass breakpoints
        bus.events.clear();
        bus.write32(0, 0x104, 2, false);
        assert_eq!(bus.mem_breakpoints()[0].hits, 1);
        assert!(!bus.events.interactive);
    }
}

use tracing::debug;

/*
Device bus contract
-------------------
Peripherals hang off the physical bus through this trait. Every hook is
optional (the defaults do nothing); a device decides locally whether an
incoming physical address belongs to its window.

Reads preset the value to all-ones before the device list is walked, every
device may overwrite it and the last writer wins. Writes report whether any
device accepted the address.

`step` runs once per machine cycle after the processors; `step4k` runs every
4096th cycle after the per-cycle pass. Interrupt requests are queued through
the `IrqQueue` and forwarded to the target processor by the scheduler at the
end of the tick.
*/
pub trait Device {
    fn name(&self) -> &str;

    /// Devices observing host time or randomness must report themselves as
    /// non-deterministic; the machine refuses them unless allowed by config.
    fn nondet(&self) -> bool {
        false
    }

    fn read32(&mut self, _procno: usize, _addr: u64, _val: &mut u32) {}
    fn read64(&mut self, _procno: usize, _addr: u64, _val: &mut u64) {}

    fn write32(&mut self, _procno: usize, _addr: u64, _val: u32) -> bool {
        false
    }
    fn write64(&mut self, _procno: usize, _addr: u64, _val: u64) -> bool {
        false
    }

    fn step(&mut self, _irq: &mut IrqQueue) {}
    fn step4k(&mut self, _irq: &mut IrqQueue) {}

    /// Teardown hook, called once when the machine shuts down.
    fn done(&mut self) {}
}

#[derive(Debug, Clone, Copy)]
pub struct IrqRequest {
    pub procno: usize,
    pub line: usize,
    pub up: bool,
}

/// Interrupt requests raised by devices during a tick, drained by the
/// scheduler once the devices are done.
pub struct IrqQueue {
    requests: Vec<IrqRequest>,
}

impl IrqQueue {
    pub fn new() -> Self {
        IrqQueue { requests: Vec::new() }
    }

    pub fn raise(&mut self, procno: usize, line: usize) {
        debug!("Device raising interrupt {} on cpu{}", line, procno);
        self.requests.push(IrqRequest { procno, line, up: true });
    }

    pub fn lower(&mut self, procno: usize, line: usize) {
        self.requests.push(IrqRequest { procno, line, up: false });
    }

    pub fn drain(&mut self) -> Vec<IrqRequest> {
        std::mem::take(&mut self.requests)
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_preserves_request_order() {
        let mut irq = IrqQueue::new();
        irq.raise(0, 3);
        irq.lower(0, 3);
        irq.raise(1, 5);
        let reqs = irq.drain();
        assert_eq!(reqs.len(), 3);
        assert!(reqs[0].up && reqs[0].line == 3);
        assert!(!reqs[1].up);
        assert!(reqs[2].procno == 1 && reqs[2].line == 5);
        assert!(irq.is_empty());
    }
}

use tracing::warn;

use crate::core::cpu::cop0::{
    Cop0, Cp0Reg, CONTEXT_BADVPN2_MASK, CONTEXT_ADDR_SHIFT, CONTEXT_PTEBASE_MASK,
    ENTRYHI_ASID_MASK, ENTRYHI_VPN2_MASK, ENTRYLO_C_MASK, ENTRYLO_C_SHIFT, ENTRYLO_D_MASK,
    ENTRYLO_G_MASK, ENTRYLO_PFN_MASK, ENTRYLO_PFN_SHIFT, ENTRYLO_V_MASK, INDEX_P_MASK,
    PAGEMASK_MASK_MASK,
};

pub const TLB_ENTRIES: usize = 48;

/// High bits of the 36-bit physical space that always come from the PFN.
pub const TLB_PHYSMASK: u64 = 0x7_8000_0000;

/*
TLB
---
48 fully-associative entries, each mapping an even/odd pair of subpages.
`mask` selects the VPN2 bits for the configured page size and `vpn2` has the
corresponding low bits cleared; matching requires the ASID to agree unless
the entry is global. A rotation hint remembers the most recently hit entry
to shortcut the scan.
*/

#[derive(Debug, Clone, Copy)]
pub struct TlbPage {
    /// Physical frame base (already shifted to a byte address).
    pub pfn: u64,
    pub cohh: u8,
    pub dirty: bool,
    pub valid: bool,
}

impl TlbPage {
    const fn empty() -> Self {
        TlbPage { pfn: 0, cohh: 0, dirty: false, valid: false }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TlbEntry {
    pub mask: u32,
    pub vpn2: u32,
    pub global: bool,
    pub asid: u8,
    pub pg: [TlbPage; 2],
}

impl TlbEntry {
    const fn empty() -> Self {
        TlbEntry {
            mask: 0,
            vpn2: 0,
            global: false,
            asid: 0,
            pg: [TlbPage::empty(); 2],
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum TlbLook {
    Ok(u64),
    Refill,
    Invalid,
    Modified,
}

/// Internal translation faults; the execute unit converts them to the
/// architectural exception matching the access direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmFault {
    AddrError,
    TlbRefill,
    TlbInvalid,
    TlbModified,
}

#[derive(Debug, Default)]
pub struct TlbStats {
    pub refill: u64,
    pub invalid: u64,
    pub modified: u64,
}

pub struct Tlb {
    entries: [TlbEntry; TLB_ENTRIES],
    hint: usize,
}

impl Tlb {
    pub fn new() -> Self {
        Tlb {
            entries: [TlbEntry::empty(); TLB_ENTRIES],
            hint: 0,
        }
    }

    pub fn entry(&self, index: usize) -> &TlbEntry {
        &self.entries[index]
    }

    /// Associative lookup starting at the rotation hint.
    pub fn lookup(&mut self, virt: u32, write: bool, asid: u8, shutdown: bool) -> TlbLook {
        // TLB shutdown bypasses translation entirely
        if shutdown {
            return TlbLook::Ok(virt as u64);
        }

        let hint = self.hint;
        for i in 0..TLB_ENTRIES {
            let index = (i + hint) % TLB_ENTRIES;
            let entry = &self.entries[index];

            if (virt & entry.mask) != entry.vpn2 {
                continue;
            }
            if !entry.global && entry.asid != asid {
                continue;
            }

            // The subpage selector is the bit just below the page mask.
            let smask = ((entry.mask >> 1) as u64) | TLB_PHYSMASK;
            let subpage = if ((virt as u64) & (entry.mask as u64)) < ((virt as u64) & smask) {
                1
            } else {
                0
            };

            if !entry.pg[subpage].valid {
                return TlbLook::Invalid;
            }
            if write && !entry.pg[subpage].dirty {
                return TlbLook::Modified;
            }

            let phys = ((virt as u64) & !smask) | (entry.pg[subpage].pfn & smask);
            self.hint = index;
            return TlbLook::Ok(phys);
        }

        TlbLook::Refill
    }

    /// TLBWI/TLBWR: fill the indexed entry from EntryHi/EntryLo0/EntryLo1
    /// and PageMask.
    pub fn write_entry(&mut self, index: usize, cop0: &Cop0) {
        let entry = &mut self.entries[index];
        let lo0 = cop0.reg(Cp0Reg::EntryLo0);
        let lo1 = cop0.reg(Cp0Reg::EntryLo1);

        entry.mask = (ENTRYHI_VPN2_MASK & !cop0.reg(Cp0Reg::PageMask)) as u32;
        entry.vpn2 = (cop0.reg(Cp0Reg::EntryHi) as u32) & entry.mask;
        entry.global = (lo0 & lo1 & ENTRYLO_G_MASK) != 0;
        entry.asid = cop0.entryhi_asid();

        for (page, lo) in entry.pg.iter_mut().zip([lo0, lo1]) {
            page.pfn = ((lo & ENTRYLO_PFN_MASK) >> ENTRYLO_PFN_SHIFT) << 12;
            page.cohh = ((lo & ENTRYLO_C_MASK) >> ENTRYLO_C_SHIFT) as u8;
            page.dirty = (lo & ENTRYLO_D_MASK) != 0;
            page.valid = (lo & ENTRYLO_V_MASK) != 0;
        }
    }

    /// TLBR: read the entry selected by Index back into the CP0 registers.
    /// An out-of-range Index zeroes them.
    pub fn read_entry(&self, cop0: &mut Cop0) {
        let index = cop0.index_index() as usize;
        if index >= TLB_ENTRIES {
            warn!("Invalid value in Index (TLBR): {}", index);
            cop0.set(Cp0Reg::PageMask, 0);
            cop0.set(Cp0Reg::EntryHi, 0);
            cop0.set(Cp0Reg::EntryLo0, 0);
            cop0.set(Cp0Reg::EntryLo1, 0);
            return;
        }

        let entry = &self.entries[index];
        cop0.set(Cp0Reg::PageMask, (!entry.mask as u64) & PAGEMASK_MASK_MASK);
        cop0.set(Cp0Reg::EntryHi, entry.vpn2 as u64 | entry.asid as u64);

        for (page, reg) in entry.pg.iter().zip([Cp0Reg::EntryLo0, Cp0Reg::EntryLo1]) {
            let lo = (page.pfn >> ENTRYLO_PFN_SHIFT)
                | ((page.cohh as u64) << ENTRYLO_C_SHIFT)
                | ((page.dirty as u64) << 2)
                | ((page.valid as u64) << 1)
                | (entry.global as u64);
            cop0.set(reg, lo);
        }
    }

    /// TLBP: probe for the entry matching EntryHi; Index.P signals a miss.
    pub fn probe(&self, cop0: &mut Cop0) {
        cop0.set(Cp0Reg::Index, INDEX_P_MASK);
        let vpn2 = (cop0.reg(Cp0Reg::EntryHi) & ENTRYHI_VPN2_MASK) as u32;
        let asid = cop0.entryhi_asid();

        for (i, entry) in self.entries.iter().enumerate() {
            if entry.vpn2 == vpn2 && (entry.global || entry.asid == asid) {
                cop0.set(Cp0Reg::Index, i as u64);
                break;
            }
        }
    }
}

// ==================== segment-mapped translation ====================

/// Record the faulting address for a TLB miss: BadVAddr, Context.BadVPN2
/// and the VPN2 half of EntryHi (ASID preserved).
fn fill_tlb_error(cop0: &mut Cop0, addr: u64) {
    cop0.set(Cp0Reg::BadVAddr, addr);

    let context = cop0.reg(Cp0Reg::Context) & CONTEXT_PTEBASE_MASK;
    cop0.set(
        Cp0Reg::Context,
        context | ((addr >> CONTEXT_ADDR_SHIFT) & CONTEXT_BADVPN2_MASK),
    );

    let entryhi = cop0.reg(Cp0Reg::EntryHi) & ENTRYHI_ASID_MASK;
    cop0.set(Cp0Reg::EntryHi, entryhi | (addr & ENTRYHI_VPN2_MASK));
}

/// Address errors leave Context/EntryHi undefined; we clear the fields.
pub(crate) fn addr_error_fill(cop0: &mut Cop0, addr: u64, noisy: bool) {
    if noisy {
        cop0.set(Cp0Reg::BadVAddr, addr);
        cop0.set(Cp0Reg::Context, cop0.reg(Cp0Reg::Context) & !CONTEXT_BADVPN2_MASK);
        cop0.set(Cp0Reg::EntryHi, cop0.reg(Cp0Reg::EntryHi) & !ENTRYHI_VPN2_MASK);
    }
}

fn tlb_hit(
    cop0: &mut Cop0,
    tlb: &mut Tlb,
    stats: &mut TlbStats,
    virt: u64,
    write: bool,
    noisy: bool,
) -> Result<u64, VmFault> {
    let asid = cop0.entryhi_asid();
    match tlb.lookup(virt as u32, write, asid, cop0.status_ts()) {
        TlbLook::Ok(phys) => Ok(phys),
        TlbLook::Refill => {
            if noisy {
                stats.refill += 1;
                fill_tlb_error(cop0, virt);
            }
            Err(VmFault::TlbRefill)
        }
        TlbLook::Invalid => {
            if noisy {
                stats.invalid += 1;
                fill_tlb_error(cop0, virt);
            }
            Err(VmFault::TlbInvalid)
        }
        TlbLook::Modified => {
            if noisy {
                stats.modified += 1;
                fill_tlb_error(cop0, virt);
            }
            Err(VmFault::TlbModified)
        }
    }
}

/// Virtual-to-physical conversion under the segment map of the effective
/// execution mode.
pub fn convert_addr(
    cop0: &mut Cop0,
    tlb: &mut Tlb,
    stats: &mut TlbStats,
    virt: u64,
    write: bool,
    noisy: bool,
) -> Result<u64, VmFault> {
    let lo = virt as u32;

    if cop0.user_mode() {
        // useg only; bit 31 is out of reach
        if (lo & 0x8000_0000) != 0 {
            addr_error_fill(cop0, virt, noisy);
            return Err(VmFault::AddrError);
        }
        return tlb_hit(cop0, tlb, stats, virt, write, noisy);
    }

    if cop0.supervisor_mode() {
        if lo < 0x8000_0000 {
            // suseg
            return tlb_hit(cop0, tlb, stats, virt, write, noisy);
        }
        if lo < 0xC000_0000 {
            addr_error_fill(cop0, virt, noisy);
            return Err(VmFault::AddrError);
        }
        if lo < 0xE000_0000 {
            // sseg
            return tlb_hit(cop0, tlb, stats, virt, write, noisy);
        }
        addr_error_fill(cop0, virt, noisy);
        return Err(VmFault::AddrError);
    }

    // kernel
    if lo < 0x8000_0000 {
        // kuseg translates, unless ERL maps it to identity
        if !cop0.status_erl() {
            return tlb_hit(cop0, tlb, stats, virt, write, noisy);
        }
        return Ok(lo as u64);
    }
    if lo < 0xA000_0000 {
        // kseg0
        return Ok((lo - 0x8000_0000) as u64);
    }
    if lo < 0xC000_0000 {
        // kseg1
        return Ok((lo - 0xA000_0000) as u64);
    }
    // kseg2 and kseg3 translate
    tlb_hit(cop0, tlb, stats, virt, write, noisy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cpu::cop0::{STATUS_ERL_MASK, STATUS_TS_MASK};

    fn cop0_with(status: u64) -> Cop0 {
        let mut cop0 = Cop0::new();
        cop0.set(Cp0Reg::Status, status);
        cop0
    }

    /// Writes a 4K-page entry mapping `vpn2_base` (two subpages) to the
    /// frames `pfn0`/`pfn1`.
    fn map_page(
        tlb: &mut Tlb,
        cop0: &mut Cop0,
        index: usize,
        vpn2_base: u64,
        pfn0: u64,
        pfn1: u64,
        flags: u64,
    ) {
        cop0.set(Cp0Reg::PageMask, 0);
        cop0.set(Cp0Reg::EntryHi, (vpn2_base & ENTRYHI_VPN2_MASK) | (cop0.entryhi_asid() as u64));
        cop0.set(Cp0Reg::EntryLo0, ((pfn0 >> 12) << 6) | flags);
        cop0.set(Cp0Reg::EntryLo1, ((pfn1 >> 12) << 6) | flags);
        tlb.write_entry(index, cop0);
    }

    const VALID: u64 = ENTRYLO_V_MASK;
    const DIRTY: u64 = ENTRYLO_D_MASK;
    const GLOBAL: u64 = ENTRYLO_G_MASK;

    #[test]
    fn kernel_segments_translate_directly() {
        let mut cop0 = cop0_with(0);
        let mut tlb = Tlb::new();
        let mut stats = TlbStats::default();
        assert_eq!(
            convert_addr(&mut cop0, &mut tlb, &mut stats, 0x8000_1234, false, true),
            Ok(0x1234)
        );
        assert_eq!(
            convert_addr(&mut cop0, &mut tlb, &mut stats, 0xBFC0_0000, false, true),
            Ok(0x1FC0_0000)
        );
    }

    #[test]
    fn erl_maps_kuseg_to_identity() {
        let mut cop0 = cop0_with(STATUS_ERL_MASK);
        let mut tlb = Tlb::new();
        let mut stats = TlbStats::default();
        assert_eq!(
            convert_addr(&mut cop0, &mut tlb, &mut stats, 0x0000_2000, false, true),
            Ok(0x2000)
        );
    }

    #[test]
    fn shutdown_bypasses_translation() {
        let mut cop0 = cop0_with(STATUS_TS_MASK);
        let mut tlb = Tlb::new();
        let mut stats = TlbStats::default();
        // kuseg with an empty TLB, but TS set
        assert_eq!(
            convert_addr(&mut cop0, &mut tlb, &mut stats, 0x0000_4000, false, true),
            Ok(0x4000)
        );
    }

    #[test]
    fn empty_tlb_refills_and_fills_cp0() {
        let mut cop0 = cop0_with(0);
        let mut tlb = Tlb::new();
        let mut stats = TlbStats::default();
        cop0.set(Cp0Reg::EntryHi, 0x55); // current ASID
        let res = convert_addr(&mut cop0, &mut tlb, &mut stats, 0x0000_5008, false, true);
        assert_eq!(res, Err(VmFault::TlbRefill));
        assert_eq!(stats.refill, 1);
        assert_eq!(cop0.reg(Cp0Reg::BadVAddr), 0x5008);
        // ASID preserved, VPN2 patched
        assert_eq!(cop0.reg(Cp0Reg::EntryHi), 0x4000 | 0x55);
        assert_eq!(cop0.reg(Cp0Reg::Context), (0x5008 >> 9) & CONTEXT_BADVPN2_MASK);
    }

    #[test]
    fn even_and_odd_subpages_map_to_their_frames() {
        let mut cop0 = cop0_with(0);
        let mut tlb = Tlb::new();
        let mut stats = TlbStats::default();
        map_page(&mut tlb, &mut cop0, 0, 0x4000, 0x10_000, 0x20_000, VALID | DIRTY);

        let even = convert_addr(&mut cop0, &mut tlb, &mut stats, 0x4010, false, true);
        assert_eq!(even, Ok(0x10_010));
        let odd = convert_addr(&mut cop0, &mut tlb, &mut stats, 0x5010, false, true);
        assert_eq!(odd, Ok(0x20_010));
    }

    #[test]
    fn translation_is_repeatable() {
        let mut cop0 = cop0_with(0);
        let mut tlb = Tlb::new();
        let mut stats = TlbStats::default();
        map_page(&mut tlb, &mut cop0, 7, 0x4000, 0x10_000, 0x20_000, VALID | DIRTY);

        let first = convert_addr(&mut cop0, &mut tlb, &mut stats, 0x4123, false, true);
        // the hint moved to the hit entry; the result must not change
        let second = convert_addr(&mut cop0, &mut tlb, &mut stats, 0x4123, false, true);
        assert_eq!(first, Ok(0x10_123));
        assert_eq!(second, first);
    }

    #[test]
    fn asid_mismatch_skips_non_global_entries() {
        let mut cop0 = cop0_with(0);
        let mut tlb = Tlb::new();
        let mut stats = TlbStats::default();
        cop0.set(Cp0Reg::EntryHi, 0x11);
        map_page(&mut tlb, &mut cop0, 0, 0x4000, 0x10_000, 0x20_000, VALID | DIRTY);

        // switch ASID: the entry no longer matches
        cop0.set(Cp0Reg::EntryHi, 0x22);
        let res = convert_addr(&mut cop0, &mut tlb, &mut stats, 0x4000, false, true);
        assert_eq!(res, Err(VmFault::TlbRefill));

        // a global mapping matches any ASID
        map_page(&mut tlb, &mut cop0, 1, 0x4000, 0x30_000, 0x40_000, VALID | DIRTY | GLOBAL);
        cop0.set(Cp0Reg::EntryHi, 0x33);
        let res = convert_addr(&mut cop0, &mut tlb, &mut stats, 0x4000, false, true);
        assert_eq!(res, Ok(0x30_000));
    }

    #[test]
    fn invalid_and_clean_pages_fault() {
        let mut cop0 = cop0_with(0);
        let mut tlb = Tlb::new();
        let mut stats = TlbStats::default();
        map_page(&mut tlb, &mut cop0, 0, 0x4000, 0x10_000, 0x20_000, 0);
        assert_eq!(
            convert_addr(&mut cop0, &mut tlb, &mut stats, 0x4000, false, true),
            Err(VmFault::TlbInvalid)
        );

        map_page(&mut tlb, &mut cop0, 0, 0x4000, 0x10_000, 0x20_000, VALID);
        // reads are fine, writes trip the dirty check
        assert_eq!(
            convert_addr(&mut cop0, &mut tlb, &mut stats, 0x4000, false, true),
            Ok(0x10_000)
        );
        assert_eq!(
            convert_addr(&mut cop0, &mut tlb, &mut stats, 0x4000, true, true),
            Err(VmFault::TlbModified)
        );
        assert_eq!(stats.invalid, 1);
        assert_eq!(stats.modified, 1);
    }

    #[test]
    fn user_mode_rejects_high_half() {
        let mut cop0 = cop0_with(0x10); // KSU = user
        let mut tlb = Tlb::new();
        let mut stats = TlbStats::default();
        let res = convert_addr(&mut cop0, &mut tlb, &mut stats, 0x8000_0000, false, true);
        assert_eq!(res, Err(VmFault::AddrError));
        assert_eq!(cop0.reg(Cp0Reg::BadVAddr), 0x8000_0000);
    }

    #[test]
    fn supervisor_segment_map() {
        let mut cop0 = cop0_with(0x08); // KSU = supervisor
        let mut tlb = Tlb::new();
        let mut stats = TlbStats::default();
        // kseg0 range is out of reach for the supervisor
        assert_eq!(
            convert_addr(&mut cop0, &mut tlb, &mut stats, 0x8000_0000, false, true),
            Err(VmFault::AddrError)
        );
        assert_eq!(
            convert_addr(&mut cop0, &mut tlb, &mut stats, 0xE000_0000, false, true),
            Err(VmFault::AddrError)
        );
        // sseg translates (empty TLB refills)
        assert_eq!(
            convert_addr(&mut cop0, &mut tlb, &mut stats, 0xC000_0000, false, true),
            Err(VmFault::TlbRefill)
        );
    }

    #[test]
    fn write_then_read_restores_architected_fields() {
        let mut cop0 = cop0_with(0);
        let mut tlb = Tlb::new();
        cop0.set(Cp0Reg::PageMask, 0x6000); // 16K pages
        cop0.set(Cp0Reg::EntryHi, 0x0012_8000 | 0x7F);
        cop0.set(Cp0Reg::EntryLo0, ((0x345 as u64) << 6) | ENTRYLO_V_MASK | ENTRYLO_D_MASK | ENTRYLO_G_MASK);
        cop0.set(Cp0Reg::EntryLo1, ((0x678 as u64) << 6) | ENTRYLO_V_MASK | ENTRYLO_G_MASK);
        tlb.write_entry(3, &cop0);

        // clobber and read back
        cop0.set(Cp0Reg::PageMask, 0);
        cop0.set(Cp0Reg::EntryHi, 0);
        cop0.set(Cp0Reg::EntryLo0, 0);
        cop0.set(Cp0Reg::EntryLo1, 0);
        cop0.set(Cp0Reg::Index, 3);
        tlb.read_entry(&mut cop0);

        assert_eq!(cop0.reg(Cp0Reg::PageMask), 0x6000);
        assert_eq!(cop0.reg(Cp0Reg::EntryHi), (0x0012_8000 & !0x6000) | 0x7F);
        assert_eq!(
            cop0.reg(Cp0Reg::EntryLo0),
            ((0x345 as u64) << 6) | ENTRYLO_V_MASK | ENTRYLO_D_MASK | ENTRYLO_G_MASK
        );
        assert_eq!(
            cop0.reg(Cp0Reg::EntryLo1),
            ((0x678 as u64) << 6) | ENTRYLO_V_MASK | ENTRYLO_G_MASK
        );
    }

    #[test]
    fn out_of_range_tlbr_zeroes_registers() {
        let mut cop0 = cop0_with(0);
        let tlb = Tlb::new();
        cop0.set(Cp0Reg::Index, 50);
        cop0.set(Cp0Reg::EntryHi, 0x1234_5678);
        tlb.read_entry(&mut cop0);
        assert_eq!(cop0.reg(Cp0Reg::EntryHi), 0);
        assert_eq!(cop0.reg(Cp0Reg::PageMask), 0);
    }

    #[test]
    fn probe_finds_entry_or_sets_p() {
        let mut cop0 = cop0_with(0);
        let mut tlb = Tlb::new();
        cop0.set(Cp0Reg::EntryHi, 0x42);
        map_page(&mut tlb, &mut cop0, 5, 0x0003_8000, 0x10_000, 0x20_000, VALID);

        cop0.set(Cp0Reg::EntryHi, 0x0003_8000 | 0x42);
        tlb.probe(&mut cop0);
        assert_eq!(cop0.reg(Cp0Reg::Index), 5);

        cop0.set(Cp0Reg::EntryHi, 0x0007_0000 | 0x42);
        tlb.probe(&mut cop0);
        assert_ne!(cop0.reg(Cp0Reg::Index) & INDEX_P_MASK, 0);
    }
}

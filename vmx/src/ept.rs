//! Extended page tables: a fixed 4-level identity structure mapping guest
//! physical `[0, 4 GiB)` with 2 MiB leaves.
//!
//! The tables are built once before the first VM entry and never change,
//! so there is no allocator and no locking here: one PML4, one PDPT and
//! four page directories, all statically placed by the owner (`kvm`).

use crate::Gpa;
use bedrock::addressing::{Pa, Va, SZ_2M};

bitflags::bitflags! {
    /// EPT paging-structure entry bits used by this VMM.
    pub struct EptFlags: u64 {
        /// Reads allowed.
        const READ = 1 << 0;
        /// Writes allowed. Hardware rejects write-without-read at entry.
        const WRITE = 1 << 1;
        /// Instruction fetches allowed.
        const EXECUTE = 1 << 2;
        /// This entry maps a large page (valid at the PDPT and PD levels).
        const PSE = 1 << 7;
    }
}

const RWX: u64 = EptFlags::READ.bits() | EptFlags::WRITE.bits() | EptFlags::EXECUTE.bits();

/// EPTP low bits: write-back paging-structure memory type (6) and a
/// 4-level walk (walk length minus one in bits 5:3).
const EPTP_MEMTYPE_WB: u64 = 6;
const EPTP_WALK_LENGTH_4: u64 = 3 << 3;

/// Guest physical space addressable through the tables.
pub const GUEST_PHYS_LIMIT: u64 = 4 << 30;

/// The complete second-stage translation structure.
#[repr(C, align(4096))]
pub struct EptTables {
    pml4: [u64; 512],
    pdpt: [u64; 512],
    pd: [[u64; 512]; 4],
}

impl EptTables {
    /// All-zero tables, for static placement.
    pub const fn zeroed() -> Self {
        Self {
            pml4: [0; 512],
            pdpt: [0; 512],
            pd: [[0; 512]; 4],
        }
    }

    /// Link the fixed spine: PML4 entry 0 to the PDPT, PDPT entries 0..4 to
    /// the four page directories. Leaves stay absent until [`map_2m`].
    ///
    /// [`map_2m`]: EptTables::map_2m
    pub fn init(&mut self) {
        self.pml4[0] = Va::of(&self.pdpt).into_pa().into_usize() as u64 | RWX;
        for (i, pd) in self.pd.iter().enumerate() {
            self.pdpt[i] = Va::of(pd).into_pa().into_usize() as u64 | RWX;
        }
    }

    /// Install one read-write-execute 2 MiB leaf translating the 2 MiB
    /// guest frame at `gpa` to the host frame at `hpa`.
    pub fn map_2m(&mut self, gpa: Gpa, hpa: Pa) {
        let gpa = gpa.into_u64();
        let hpa = hpa.into_usize() as u64;
        assert_eq!(gpa % SZ_2M as u64, 0, "guest frame not 2MiB aligned");
        assert_eq!(hpa % SZ_2M as u64, 0, "host frame not 2MiB aligned");
        assert!(gpa < GUEST_PHYS_LIMIT, "guest frame beyond EPT coverage");

        let index = (gpa / SZ_2M as u64) as usize;
        self.pd[index / 512][index % 512] = hpa | RWX | EptFlags::PSE.bits();
    }

    /// The EPT-pointer value for the VMCS.
    pub fn eptp(&self) -> u64 {
        Va::of(&self.pml4).into_pa().into_usize() as u64 | EPTP_MEMTYPE_WB | EPTP_WALK_LENGTH_4
    }
}

const LEVEL_MASKS: [u64; 4] = [
    0xffff_ff80_0000_0000,
    0xffff_ffff_c000_0000,
    0xffff_ffff_ffe0_0000,
    0xffff_ffff_ffff_f000,
];
const LEVEL_SHIFTS: [u64; 4] = [39, 30, 21, 12];

/// Walk the EPT exactly as the hardware would and return the host physical
/// address backing `gpa`.
///
/// Asserts that every entry on the path is readable; an unmapped guest
/// address is a VMM bug at the call sites that use this (the guest itself
/// takes an EPT violation instead).
pub fn gpa_to_hpa(eptp: u64, gpa: Gpa) -> Pa {
    let gpa = gpa.into_u64();
    let mut table = (eptp & !0xfff) as usize;
    let mut entry = 0u64;

    for (i, (mask, shift)) in LEVEL_MASKS.iter().zip(LEVEL_SHIFTS.iter()).enumerate() {
        let index = ((gpa >> shift) & 0x1ff) as usize;
        entry = unsafe {
            Pa::new(table)
                .unwrap()
                .into_va()
                .as_ref::<[u64; 512]>()
                .unwrap()[index]
        };
        assert!(
            entry & EptFlags::READ.bits() != 0,
            "ept: walk of {:#x} hit a non-present entry at level {}",
            gpa,
            i
        );
        if entry & EptFlags::PSE.bits() != 0 {
            // Large page; only legal below the PML4.
            assert!(i == 1 || i == 2);
            return Pa::new(((entry & mask) | (gpa & !mask)) as usize).unwrap();
        }
        table = (entry & !0xfff) as usize;
    }
    Pa::new(((entry & !0xfff) | (gpa & 0xfff)) as usize).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> Box<EptTables> {
        let mut t = Box::new(EptTables::zeroed());
        t.init();
        t
    }

    #[test]
    fn spine_links_four_gib() {
        let t = tables();
        assert_eq!(t.pml4[0] & 7, RWX);
        for i in 0..4 {
            assert_eq!(t.pdpt[i] & 7, RWX);
            assert_eq!(
                t.pdpt[i] & !0xfff,
                &t.pd[i] as *const _ as u64,
                "pdpt entry {} must point at pd {}",
                i,
                i
            );
        }
        for i in 1..512 {
            assert_eq!(t.pml4[i], 0);
        }
        for i in 4..512 {
            assert_eq!(t.pdpt[i], 0);
        }
    }

    #[test]
    fn walk_translates_mapped_frames() {
        let mut t = tables();
        // A fake host frame address; the walk only does arithmetic.
        let host = 0x4060_0000usize;
        t.map_2m(Gpa::new(0x1ec0_0000), Pa::new(host).unwrap());

        let eptp = t.eptp();
        assert_eq!(eptp & 0xfff, 0x1e);

        // Frame base and an offset deep inside the 2 MiB page.
        assert_eq!(
            gpa_to_hpa(eptp, Gpa::new(0x1ec0_0000)).into_usize(),
            host
        );
        assert_eq!(
            gpa_to_hpa(eptp, Gpa::new(0x1ec0_0000 + 0x12_3456)).into_usize(),
            host + 0x12_3456
        );
    }

    #[test]
    fn walk_reaches_above_one_gib() {
        let mut t = tables();
        let host = 0x8000_0000usize;
        // 3 GiB guest frame exercises pd[3].
        t.map_2m(Gpa::new(0xc000_0000), Pa::new(host).unwrap());
        assert_eq!(
            gpa_to_hpa(t.eptp(), Gpa::new(0xc000_0000 + 0xfff)).into_usize(),
            host + 0xfff
        );
    }

    #[test]
    fn no_leaf_is_writable_but_not_readable() {
        let mut t = tables();
        t.map_2m(Gpa::new(0), Pa::new(0x20_0000).unwrap());
        t.map_2m(Gpa::new(0x20_0000), Pa::new(0x40_0000).unwrap());
        let all = t
            .pml4
            .iter()
            .chain(t.pdpt.iter())
            .chain(t.pd.iter().flatten());
        for entry in all {
            if entry & EptFlags::WRITE.bits() != 0 {
                assert_ne!(entry & EptFlags::READ.bits(), 0);
            }
        }
    }

    #[test]
    #[should_panic]
    fn walk_of_unmapped_address_asserts() {
        let t = tables();
        gpa_to_hpa(t.eptp(), Gpa::new(0x2000_0000));
    }

    #[test]
    #[should_panic]
    fn map_rejects_unaligned_guest_frame() {
        let mut t = tables();
        t.map_2m(Gpa::new(0x1000), Pa::new(0x20_0000).unwrap());
    }
}

//! VMCS configuration: negotiate the five control words against the
//! IA32_VMX_* capability MSRs and build the MSR intercept bitmap.
//!
//! Everything here runs once, before any CPU loads a VMCS; the results are
//! frozen behind [`spin::Once`] and read-only afterwards.

use crate::vm_control::*;
use bedrock::addressing::{Pa, Va, PAGE_SIZE};
use bedrock::x86_64::intrinsics;
use bedrock::x86_64::msr::{
    self, Msr, FEATURE_CONTROL_LOCKED, FEATURE_CONTROL_VMXON_ENABLED_OUTSIDE_SMX,
    IA32_APIC_BASE, IA32_EFER, IA32_FEATURE_CONTROL, X2APIC_ICR,
};
use spin::Once;

/// Snapshot of the negotiated control words. Immutable after
/// [`hardware_setup`].
#[derive(Debug, Clone, Copy)]
pub struct VmcsConfig {
    /// VMCS region size reported by IA32_VMX_BASIC.
    pub size: u32,
    /// IA32_VMX_BASIC bits 63:45.
    pub basic_cap: u32,
    /// VMCS revision identifier.
    pub revision_id: u32,
    /// Pin-based VM-execution controls.
    pub pin: PinControls,
    /// Primary processor-based VM-execution controls.
    pub proc: ProcControls,
    /// Secondary processor-based VM-execution controls.
    pub proc2: ProcControls2,
    /// VM-exit controls.
    pub exit: ExitControls,
    /// VM-entry controls.
    pub entry: EntryControls,
}

/// IA32_VMX_EPT_VPID_CAP, split.
#[derive(Debug, Clone, Copy)]
pub struct VmxCapability {
    /// EPT capabilities (low word).
    pub ept: u32,
    /// VPID capabilities (high word).
    pub vpid: u32,
}

static VMCS_CONFIG: Once<VmcsConfig> = Once::new();
static VMX_CAPABILITY: Once<VmxCapability> = Once::new();

#[repr(align(4096))]
struct MsrBitmap([u8; PAGE_SIZE]);

/// The one MSR intercept bitmap, shared by every vCPU. Written during
/// `hardware_setup`, read-only (to us) afterwards.
static mut MSR_BITMAP: MsrBitmap = MsrBitmap([0; PAGE_SIZE]);

/// The negotiated configuration.
///
/// Panics if `hardware_setup` has not run.
pub fn config() -> &'static VmcsConfig {
    VMCS_CONFIG.get().expect("vmx: hardware_setup has not run")
}

/// The EPT/VPID capability words.
pub fn capability() -> &'static VmxCapability {
    VMX_CAPABILITY
        .get()
        .expect("vmx: hardware_setup has not run")
}

/// Physical address of the MSR intercept bitmap.
pub fn msr_bitmap_pa() -> Pa {
    unsafe { Va::of(&*core::ptr::addr_of!(MSR_BITMAP)).into_pa() }
}

/// `ctl = (min | opt) & allowed1 | allowed0`. `Err` carries the required
/// bits the capability word refuses.
fn adjust(min: u32, opt: u32, allowed0: u32, allowed1: u32) -> Result<u32, u32> {
    let mut ctl = min | opt;
    ctl &= allowed1; // bit == 0 in the high word: must be zero
    ctl |= allowed0; // bit == 1 in the low word: must be one

    if min & !ctl != 0 {
        return Err(min & !ctl);
    }
    Ok(ctl)
}

/// Negotiate one control word against its capability MSR, panicking when a
/// required bit is not available on this CPU.
fn adjust_controls(min: u32, opt: u32, capability_msr: u32) -> u32 {
    let cap = msr::rdmsr(capability_msr);
    match adjust(min, opt, cap as u32, (cap >> 32) as u32) {
        Ok(ctl) => ctl,
        Err(missing) => panic!(
            "vmx: required control bits {:08x} unavailable (msr {:x})",
            missing, capability_msr
        ),
    }
}

fn log_controls(name: &str, ctl: u32) {
    log::info!("vmx: {}: {:#010x}", name, ctl);
}

/// Is VMXON forbidden by the firmware?
///
/// If IA32_FEATURE_CONTROL is locked without the outside-SMX enable bit,
/// there is nothing we can do about it.
fn disabled_by_bios() -> bool {
    let v = Msr::<IA32_FEATURE_CONTROL>::read();
    v & FEATURE_CONTROL_LOCKED != 0 && v & FEATURE_CONTROL_VMXON_ENABLED_OUTSIDE_SMX == 0
}

fn setup_vmcs_config() -> VmcsConfig {
    let min = ProcControls::USE_MSR_BITMAPS
        | ProcControls::ACTIVATE_SECONDARY_CONTROLS
        | ProcControls::RDTSC_EXITING
        | ProcControls::CR3_LOAD_EXITING
        | ProcControls::HLT_EXITING;
    let mut proc = ProcControls::from_bits_truncate(adjust_controls(
        min.bits(),
        0,
        IA32_VMX_PROCBASED_CTLS,
    ));

    let min2 = ProcControls2::ENABLE_EPT
        | ProcControls2::ENABLE_VPID
        | ProcControls2::UNRESTRICTED_GUEST;
    let opt2 = ProcControls2::ENABLE_RDTSCP | ProcControls2::ENABLE_INVPCID;
    let proc2 = ProcControls2::from_bits_truncate(adjust_controls(
        min2.bits(),
        opt2.bits(),
        IA32_VMX_PROCBASED_CTLS2,
    ));

    // With EPT the guest owns its CR3 reads and TLB; only CR3 loads stay
    // intercepted (the dispatcher logs them and writes through).
    proc &= !(ProcControls::CR3_STORE_EXITING | ProcControls::INVLPG_EXITING);

    let cap = msr::rdmsr(IA32_VMX_EPT_VPID_CAP);
    VMX_CAPABILITY.call_once(|| VmxCapability {
        ept: cap as u32,
        vpid: (cap >> 32) as u32,
    });

    let min = ExitControls::SAVE_DEBUG_CONTROLS
        | ExitControls::HOST_ADDR_SPACE_SIZE
        | ExitControls::SAVE_IA32_EFER
        | ExitControls::LOAD_IA32_EFER;
    let opt = ExitControls::SAVE_IA32_PAT
        | ExitControls::LOAD_IA32_PAT
        | ExitControls::CLEAR_IA32_BNDCFGS;
    let exit = ExitControls::from_bits_truncate(adjust_controls(
        min.bits(),
        opt.bits(),
        IA32_VMX_EXIT_CTLS,
    ));

    let pin = PinControls::from_bits_truncate(adjust_controls(0, 0, IA32_VMX_PINBASED_CTLS));

    let min = EntryControls::LOAD_DEBUG_CONTROLS | EntryControls::LOAD_IA32_EFER;
    let opt = EntryControls::LOAD_IA32_PAT | EntryControls::LOAD_IA32_BNDCFGS;
    let entry = EntryControls::from_bits_truncate(adjust_controls(
        min.bits(),
        opt.bits(),
        IA32_VMX_ENTRY_CTLS,
    ));

    let basic = msr::rdmsr(IA32_VMX_BASIC);
    let (basic_lo, basic_hi) = (basic as u32, (basic >> 32) as u32);

    if (basic_hi & 0x1fff) as usize > PAGE_SIZE {
        panic!("vmx: VMCS size is never greater than 4KB");
    }
    if (basic_hi >> 18) & 15 != 6 {
        panic!("vmx: require write-back memory type for VMCS accesses");
    }

    let config = VmcsConfig {
        size: basic_hi & 0x1fff,
        basic_cap: basic_hi & !0x1fff,
        revision_id: basic_lo,
        pin,
        proc,
        proc2,
        exit,
        entry,
    };

    log_controls("pin-based controls", config.pin.bits());
    log_controls("processor-based controls", config.proc.bits());
    log_controls("secondary controls", config.proc2.bits());
    log_controls("exit controls", config.exit.bits());
    log_controls("entry controls", config.entry.bits());
    config
}

/// Flip one MSR's read/write intercept bits in a bitmap page.
///
/// The page is four 1 KiB quadrants: read-low, read-high, write-low,
/// write-high, covering MSRs 0..0x1fff and 0xc0000000..0xc0001fff.
fn set_msr_interception_in(bitmap: &mut [u8; PAGE_SIZE], index: u32, read: bool, write: bool) {
    let (read_base, write_base, bit) = if index <= 0x1fff {
        (0x000, 0x800, index as usize)
    } else if (0xc000_0000..=0xc000_1fff).contains(&index) {
        (0x400, 0xc00, (index & 0x1fff) as usize)
    } else {
        panic!("vmx: msr {:#x} not coverable by the bitmap", index);
    };

    let set = |bitmap: &mut [u8; PAGE_SIZE], base: usize, on: bool| {
        let byte = base + bit / 8;
        let mask = 1u8 << (bit % 8);
        if on {
            bitmap[byte] |= mask;
        } else {
            bitmap[byte] &= !mask;
        }
    };
    set(bitmap, read_base, read);
    set(bitmap, write_base, write);
}

fn set_msr_interception(index: u32, read: bool, write: bool) {
    unsafe {
        set_msr_interception_in(
            &mut (*core::ptr::addr_of_mut!(MSR_BITMAP)).0,
            index,
            read,
            write,
        )
    }
}

/// Negotiate the VMX configuration and build the MSR intercept bitmap.
///
/// Must run once, on the boot CPU, before anything touches a VMCS. Every
/// failure here is terminal: either the CPU lacks a required feature or
/// the firmware forbids VMX.
pub fn hardware_setup() {
    if !intrinsics::has_vmx() {
        panic!("vmx: no VT-x support on this CPU");
    }
    if disabled_by_bios() {
        panic!("vmx: disabled by BIOS");
    }

    VMCS_CONFIG.call_once(setup_vmcs_config);

    let cap = capability();
    if cap.ept & EPT_CAP_2MB_PAGE == 0 {
        panic!("vmx: no support for 2MB EPT pages");
    }
    if cap.ept & EPT_CAP_PAGE_WALK_4 == 0 {
        panic!("vmx: no support for 4-level EPT");
    }

    // The baseline bitmap passes everything through; intercept only what
    // the dispatcher must see.
    //
    // IA32_APICBASE writes: the guest must not move or disable the LAPIC
    // under us, and x2APIC switch-on is worth a log line.
    set_msr_interception(IA32_APIC_BASE, false, true);

    // ICR writes: INIT and STARTUP IPIs from the guest would yank physical
    // APs out from under the VMM, so they are filtered.
    set_msr_interception(X2APIC_ICR, false, true);

    // The VMX capability family: CPUID hides VMX from the guest, so any
    // access to these is a guest bug we want to hear about.
    for index in IA32_VMX_BASIC..=IA32_VMX_VMFUNC {
        set_msr_interception(index, true, true);
    }

    // EFER writes: SCE is stripped so SYSCALL/SYSRET trap with #UD and get
    // emulated (see the exception handler).
    set_msr_interception(IA32_EFER, false, true);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_negotiation() {
        // Optional bits survive only when allowed1 has them.
        assert_eq!(adjust(0x0, 0xff, 0x0, 0x0f), Ok(0x0f));
        // allowed0 bits are forced on even when nobody asked.
        assert_eq!(adjust(0x0, 0x0, 0x16, 0xffff), Ok(0x16));
        // A required bit the hardware refuses is reported, not dropped.
        assert_eq!(adjust(0x80, 0x0, 0x0, 0x7f), Err(0x80));
        // A required bit that is also always-on is fine.
        assert_eq!(adjust(0x2, 0x0, 0x2, 0xff), Ok(0x2));
    }

    #[test]
    fn msr_bitmap_quadrants() {
        let mut bitmap = [0u8; PAGE_SIZE];

        // Low MSR, write-only intercept: bit lands in the write-low quadrant.
        set_msr_interception_in(&mut bitmap, IA32_APIC_BASE, false, true);
        assert_eq!(bitmap[0x000 + 0x1b / 8], 0);
        assert_eq!(bitmap[0x800 + 0x1b / 8], 1 << (0x1b % 8));

        // High MSR (EFER = 0xc0000080), write-only: write-high quadrant.
        set_msr_interception_in(&mut bitmap, IA32_EFER, false, true);
        assert_eq!(bitmap[0x400 + 0x80 / 8], 0);
        assert_eq!(bitmap[0xc00 + 0x80 / 8], 1 << (0x80 % 8));

        // Read+write intercept sets both quadrants; clearing write leaves read.
        set_msr_interception_in(&mut bitmap, 0x480, true, true);
        assert_ne!(bitmap[0x000 + 0x480 / 8] & (1 << (0x480 % 8)), 0);
        assert_ne!(bitmap[0x800 + 0x480 / 8] & (1 << (0x480 % 8)), 0);
        set_msr_interception_in(&mut bitmap, 0x480, true, false);
        assert_ne!(bitmap[0x000 + 0x480 / 8] & (1 << (0x480 % 8)), 0);
        assert_eq!(bitmap[0x800 + 0x480 / 8] & (1 << (0x480 % 8)), 0);
    }

    #[test]
    fn x2apic_icr_msr_index() {
        // ICR is APIC register 0x300; the MSR window maps it at 0x830.
        assert_eq!(X2APIC_ICR, 0x830);
    }
}

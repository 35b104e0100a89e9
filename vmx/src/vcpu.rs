//! Virtual CPU: the register record, reset-state initialization, and the
//! world-switch into and out of the guest.

use crate::config;
use crate::vm_control::*;
use crate::vmcs::{ActiveVmcs, ActivityState, Field, Vmcs};
use crate::Gpa;
use bedrock::addressing::Va;
use bedrock::x86_64::msr::{
    self, Msr, FEATURE_CONTROL_LOCKED, FEATURE_CONTROL_VMXON_ENABLED_OUTSIDE_SMX,
    IA32_EFER, IA32_FEATURE_CONTROL, IA32_FS_BASE, IA32_GS_BASE, IA32_KERNEL_GS_BASE,
    IA32_LSTAR, IA32_PAT, IA32_STAR, IA32_SYSCALL_MASK, IA32_SYSENTER_CS, IA32_SYSENTER_EIP,
    IA32_SYSENTER_ESP,
};
use bedrock::x86_64::{intrinsics, segmentation, Cr0, Cr4, Efer};

/// Guest CR0 bits the VMM forces on: hardware mandates NE and WP in VMX
/// non-root operation with our configuration.
pub const GUEST_CR0_ALWAYS_ON: u64 = Cr0::WP.bits() | Cr0::NE.bits();
/// Guest CR0 bits the VMM owns. PG is included so long-mode transitions
/// always trap even once the guest's view of WP/NE matches the shadow.
pub const GUEST_CR0_OWNED: u64 = GUEST_CR0_ALWAYS_ON | Cr0::PG.bits();
/// Guest CR4 bits the VMM forces on and owns.
pub const GUEST_CR4_ALWAYS_ON: u64 = Cr4::VMXE.bits();

/// Exceptions intercepted from the guest: `#UD` (SYSCALL/SYSRET emulation)
/// and `#PF`.
const EXCEPTION_BITMAP: u32 = (1 << 6) | (1 << 14);

/// X86_64 guest general purpose registers, canonical index order, plus the
/// page-fault linear address register which the hardware does not context
/// switch for us.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    /// Unused by the world-switch; the architectural guest RSP lives in the
    /// VMCS. Kept so the record is indexable by canonical register number.
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub cr2: u64,
}

/// One entry of the VMCS automatic MSR load/store areas.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct MsrEntry {
    /// MSR index.
    pub index: u32,
    _rsv: u32,
    /// MSR value.
    pub value: u64,
}

/// The MSRs swapped automatically on every entry and exit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(usize)]
pub enum SavedMsr {
    KernelGsBase = 0,
    SyscallMask = 1,
    Lstar = 2,
    Star = 3,
}

/// Indices of the auto-saved MSRs, in [`SavedMsr`] order.
pub const MSR_SAVE_LIST: [u32; 4] = [
    IA32_KERNEL_GS_BASE,
    IA32_SYSCALL_MASK,
    IA32_LSTAR,
    IA32_STAR,
];

// The hardware requires the load/store areas to be 16-byte aligned.
#[repr(C, align(16))]
#[derive(Clone, Copy, Default)]
struct MsrAutoload {
    guest: [MsrEntry; MSR_SAVE_LIST.len()],
    host: [MsrEntry; MSR_SAVE_LIST.len()],
}

/// Virtual cpu record. The leading fields are at fixed offsets consumed by
/// the world-switch assembly below.
#[repr(C)]
pub struct VCpu {
    /// Guest register file.
    pub regs: GuestRegisters,
    host_rsp: u64,
    fail: u8,
    launched: u8,
    /// SIPI vector delivered by a startup IPI, if any.
    pub sipi_vector: u8,
    /// Current activity state.
    pub activity: ActivityState,
    msr_autoload: MsrAutoload,
    /// Invoked on EPT violations with the faulting guest physical address;
    /// without one, an EPT violation is fatal.
    pub ept_handler: Option<fn(&mut VCpu, Gpa)>,
}

const VCPU_REGS: usize = core::mem::offset_of!(VCpu, regs);
const VCPU_CR2: usize = core::mem::offset_of!(GuestRegisters, cr2);
const VCPU_HOST_RSP: usize = core::mem::offset_of!(VCpu, host_rsp);
const VCPU_FAIL: usize = core::mem::offset_of!(VCpu, fail);
const VCPU_LAUNCHED: usize = core::mem::offset_of!(VCpu, launched);

const _: () = {
    // The trampoline hardcodes the register file at the front of the record
    // with 8-byte slots in canonical order.
    assert!(VCPU_REGS == 0);
    assert!(core::mem::offset_of!(GuestRegisters, rax) == 0x00);
    assert!(core::mem::offset_of!(GuestRegisters, rcx) == 0x08);
    assert!(core::mem::offset_of!(GuestRegisters, rdx) == 0x10);
    assert!(core::mem::offset_of!(GuestRegisters, rbx) == 0x18);
    assert!(core::mem::offset_of!(GuestRegisters, rbp) == 0x28);
    assert!(core::mem::offset_of!(GuestRegisters, rsi) == 0x30);
    assert!(core::mem::offset_of!(GuestRegisters, rdi) == 0x38);
    assert!(core::mem::offset_of!(GuestRegisters, r8) == 0x40);
    assert!(core::mem::offset_of!(GuestRegisters, r15) == 0x78);
    assert!(VCPU_CR2 == 0x80);
    assert!(core::mem::size_of::<MsrEntry>() == 16);
};

impl VCpu {
    /// A quiescent record, for static placement.
    pub const fn new() -> Self {
        Self {
            regs: GuestRegisters {
                rax: 0,
                rcx: 0,
                rdx: 0,
                rbx: 0,
                rsp: 0,
                rbp: 0,
                rsi: 0,
                rdi: 0,
                r8: 0,
                r9: 0,
                r10: 0,
                r11: 0,
                r12: 0,
                r13: 0,
                r14: 0,
                r15: 0,
                cr2: 0,
            },
            host_rsp: 0,
            fail: 0,
            launched: 0,
            sipi_vector: 0,
            activity: ActivityState::Active,
            msr_autoload: MsrAutoload {
                guest: [MsrEntry {
                    index: 0,
                    _rsv: 0,
                    value: 0,
                }; 4],
                host: [MsrEntry {
                    index: 0,
                    _rsv: 0,
                    value: 0,
                }; 4],
            },
            ept_handler: None,
        }
    }

    /// Did the last VMLAUNCH/VMRESUME fail its validity checks?
    #[inline]
    pub fn failed(&self) -> bool {
        self.fail != 0
    }

    /// The guest-side value of an auto-saved MSR, as stored by the last
    /// VM exit.
    #[inline]
    pub fn saved_msr(&self, which: SavedMsr) -> u64 {
        self.msr_autoload.guest[which as usize].value
    }

    /// Enter the guest, returning on the next VM exit.
    ///
    /// Clobbers every guest-visible register; all caller-saved host state
    /// is spilled by the trampoline. On return either a VM exit occurred
    /// (`!self.failed()`, exit state readable from the VMCS) or the entry
    /// itself was rejected.
    pub fn run(&mut self) {
        extern "C" {
            fn __vmx_vcpu_run(vcpu: *mut VCpu);
        }
        unsafe { __vmx_vcpu_run(self as *mut _) };
        self.launched = 1;
    }
}

// The world switch. Keep in sync with the offset assertions above.
//
// Entered with the vcpu record in rdi. The record pointer rides in rcx so
// guest rcx must come from / return to a stack slot: one push is the
// placeholder for guest rcx, the second preserves the record pointer
// across the guest run. HOST_RSP (0x6c14) is rewritten only when the stack
// moved since the last entry, and CR2 only when it differs; both writes
// are expensive.
//
// The `vmx_return` label is what the host-state area's HOST_RIP points
// at: hardware resumes there on every VM exit with our stack restored.
#[cfg(not(test))]
core::arch::global_asm!(
    ".text",
    ".global __vmx_vcpu_run",
    "__vmx_vcpu_run:",
    "push rbx",
    "push rbp",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov rcx, rdi",
    "push rcx",
    "push rcx",
    "cmp rsp, [rcx + {host_rsp}]",
    "je 2f",
    "mov [rcx + {host_rsp}], rsp",
    "mov rdx, 0x6c14",
    "vmwrite rdx, rsp",
    "2:",
    "mov rax, [rcx + {cr2}]",
    "mov rdx, cr2",
    "cmp rax, rdx",
    "je 3f",
    "mov cr2, rax",
    "3:",
    "cmp byte ptr [rcx + {launched}], 0",
    // Load guest registers without touching flags.
    "mov rax, [rcx + 0x00]",
    "mov rdx, [rcx + 0x10]",
    "mov rbx, [rcx + 0x18]",
    "mov rbp, [rcx + 0x28]",
    "mov rsi, [rcx + 0x30]",
    "mov rdi, [rcx + 0x38]",
    "mov r8,  [rcx + 0x40]",
    "mov r9,  [rcx + 0x48]",
    "mov r10, [rcx + 0x50]",
    "mov r11, [rcx + 0x58]",
    "mov r12, [rcx + 0x60]",
    "mov r13, [rcx + 0x68]",
    "mov r14, [rcx + 0x70]",
    "mov r15, [rcx + 0x78]",
    "mov rcx, [rcx + 0x08]",
    "jne 4f",
    "vmlaunch",
    "jmp 5f",
    "4:",
    "vmresume",
    ".global vmx_return",
    "vmx_return:",
    "5:",
    // Stash guest rcx in the placeholder slot, recover the record pointer.
    "mov [rsp + 8], rcx",
    "pop rcx",
    "mov [rcx + 0x00], rax",
    "mov [rcx + 0x10], rdx",
    "mov [rcx + 0x18], rbx",
    "mov [rcx + 0x28], rbp",
    "mov [rcx + 0x30], rsi",
    "mov [rcx + 0x38], rdi",
    "mov [rcx + 0x40], r8",
    "mov [rcx + 0x48], r9",
    "mov [rcx + 0x50], r10",
    "mov [rcx + 0x58], r11",
    "mov [rcx + 0x60], r12",
    "mov [rcx + 0x68], r13",
    "mov [rcx + 0x70], r14",
    "mov [rcx + 0x78], r15",
    "pop qword ptr [rcx + 0x08]",
    "mov rax, cr2",
    "mov [rcx + {cr2}], rax",
    "setbe byte ptr [rcx + {fail}]",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbp",
    "pop rbx",
    "ret",
    host_rsp = const VCPU_HOST_RSP,
    cr2 = const VCPU_CR2,
    launched = const VCPU_LAUNCHED,
    fail = const VCPU_FAIL,
);

// The host test harness links this crate as a normal library; give the
// symbol a body so the linker stays happy, it is never called there.
#[cfg(test)]
#[no_mangle]
extern "C" fn __vmx_vcpu_run(_vcpu: *mut VCpu) {
    unreachable!("world switch is bare-metal only");
}

/// Address of the VM-exit landing point, for HOST_RIP.
#[cfg(not(test))]
fn vmx_return_address() -> u64 {
    extern "C" {
        fn vmx_return();
    }
    vmx_return as usize as u64
}

#[cfg(test)]
fn vmx_return_address() -> u64 {
    0
}

/// Put this CPU into VMX root operation.
///
/// Mirrors the power-up protocol: refuse if CR4.VMXE is already set
/// (somebody else is using VMX), enable and lock IA32_FEATURE_CONTROL if
/// the firmware left it open, set CR4.VMXE, then VMXON.
///
/// # Safety
/// `vmxon_region` must be this CPU's statically owned VMXON page and
/// `hardware_setup` must have run.
pub unsafe fn enable_on_this_cpu(vmxon_region: &mut Vmcs) {
    if Cr4::current().contains(Cr4::VMXE) {
        panic!("vmx: VMXE already set in CR4");
    }

    let old = Msr::<IA32_FEATURE_CONTROL>::read();
    let test_bits = FEATURE_CONTROL_LOCKED | FEATURE_CONTROL_VMXON_ENABLED_OUTSIDE_SMX;
    if old & test_bits != test_bits {
        Msr::<IA32_FEATURE_CONTROL>::write(old | test_bits);
    }
    (Cr4::current() | Cr4::VMXE).apply();

    vmxon_region.init();
    vmxon_region.vmxon();
}

/// Write `val` as the guest's CR0, forcing the always-on bits and walking
/// the long-mode transition when the guest flips PG with EFER.LME set.
///
/// Consistency requirements:
/// - EFER.LMA == VM-entry control's IA-32e guest mode bit
/// - EFER.LMA == CR0.PG & EFER.LME
pub fn set_cr0(vmcs: &ActiveVmcs, val: u64) {
    if vmcs.read64(Field::GuestIa32Efer) & Efer::LME.bits() != 0 {
        let old = vmcs.readl(Field::GuestCr0);
        if old & Cr0::PG.bits() == 0 && val & Cr0::PG.bits() != 0 {
            enter_lmode(vmcs);
        }
        if old & Cr0::PG.bits() != 0 && val & Cr0::PG.bits() == 0 {
            exit_lmode(vmcs);
        }
    }
    vmcs.writel(Field::GuestCr0, val | GUEST_CR0_ALWAYS_ON);
    vmcs.writel(Field::Cr0ReadShadow, val);
}

/// Write through the guest's CR3.
pub fn set_cr3(vmcs: &ActiveVmcs, val: u64) {
    vmcs.writel(Field::GuestCr3, val);
}

/// Write `val` as the guest's CR4, forcing VMXE on.
pub fn set_cr4(vmcs: &ActiveVmcs, val: u64) {
    vmcs.writel(Field::GuestCr4, val | GUEST_CR4_ALWAYS_ON);
    vmcs.writel(Field::Cr4ReadShadow, val);
}

const AR_TYPE_MASK: u32 = 0x0f;
const AR_TYPE_BUSY_64_TSS: u32 = 11;

fn enter_lmode(vmcs: &ActiveVmcs) {
    let entry = vmcs.read32(Field::VmEntryControls);
    vmcs.write32(Field::VmEntryControls, entry | EntryControls::IA32E_MODE_GUEST.bits());

    let efer = vmcs.read64(Field::GuestIa32Efer);
    vmcs.write64(Field::GuestIa32Efer, efer | Efer::LMA.bits());

    // TSS fixup: a 16/32-bit busy TSS is illegal guest state in IA-32e mode.
    let tr_ar = vmcs.read32(Field::GuestTrArBytes);
    if tr_ar & AR_TYPE_MASK != AR_TYPE_BUSY_64_TSS {
        vmcs.write32(
            Field::GuestTrArBytes,
            (tr_ar & !AR_TYPE_MASK) | AR_TYPE_BUSY_64_TSS,
        );
    }
}

fn exit_lmode(vmcs: &ActiveVmcs) {
    let entry = vmcs.read32(Field::VmEntryControls);
    vmcs.write32(
        Field::VmEntryControls,
        entry & !EntryControls::IA32E_MODE_GUEST.bits(),
    );

    let efer = vmcs.read64(Field::GuestIa32Efer);
    vmcs.write64(Field::GuestIa32Efer, efer & !Efer::LMA.bits());
}

/// Initialize a freshly loaded VMCS: negotiated controls, the MSR autoload
/// areas, a snapshot of this CPU as the host state, and the architectural
/// power-on reset state as the guest.
pub fn vcpu_setup(vcpu: &mut VCpu, vmcs: &ActiveVmcs) {
    let cfg = config::config();

    // I/O: pass through.

    // MSR.
    vmcs.write64(Field::MsrBitmap, config::msr_bitmap_pa().into_usize() as u64);

    vmcs.write64(Field::VmcsLinkPointer, !0u64);

    // Control.
    vmcs.write32(Field::PinBasedControls, cfg.pin.bits());
    vmcs.write32(Field::ProcBasedControls, cfg.proc.bits());
    vmcs.write32(Field::SecondaryControls, cfg.proc2.bits());
    vmcs.write32(Field::VmExitControls, cfg.exit.bits());
    vmcs.write32(Field::VmEntryControls, cfg.entry.bits());

    vmcs.write32(Field::ExceptionBitmap, EXCEPTION_BITMAP);
    vmcs.write32(Field::PageFaultErrorCodeMask, 0);
    vmcs.write32(Field::PageFaultErrorCodeMatch, 0);
    vmcs.write32(Field::Cr3TargetCount, 0);

    // MSR autoload: exits store the guest's copies and restore ours, entry
    // loads the guest's back.
    let nmsrs = MSR_SAVE_LIST.len() as u32;
    let guest_pa = Va::of(&vcpu.msr_autoload.guest).into_pa().into_usize() as u64;
    let host_pa = Va::of(&vcpu.msr_autoload.host).into_pa().into_usize() as u64;
    vmcs.write32(Field::VmExitMsrStoreCount, nmsrs);
    vmcs.write64(Field::VmExitMsrStoreAddr, guest_pa);
    vmcs.write32(Field::VmExitMsrLoadCount, nmsrs);
    vmcs.write64(Field::VmExitMsrLoadAddr, host_pa);
    vmcs.write32(Field::VmEntryMsrLoadCount, nmsrs);
    vmcs.write64(Field::VmEntryMsrLoadAddr, guest_pa);

    for (i, index) in MSR_SAVE_LIST.iter().enumerate() {
        vcpu.msr_autoload.guest[i].index = *index;
        vcpu.msr_autoload.guest[i].value = 0;
        vcpu.msr_autoload.host[i].index = *index;
        vcpu.msr_autoload.host[i].value = msr::rdmsr(*index);
    }

    // Host state: whatever this CPU is running with right now.
    vmcs.write16(Field::HostCsSelector, segmentation::cs().pack());
    vmcs.write16(Field::HostDsSelector, segmentation::ds().pack());
    vmcs.write16(Field::HostEsSelector, segmentation::es().pack());
    vmcs.write16(Field::HostSsSelector, segmentation::ss().pack());
    vmcs.write16(Field::HostFsSelector, segmentation::fs().pack());
    vmcs.write16(Field::HostGsSelector, segmentation::gs().pack());
    vmcs.write16(Field::HostTrSelector, segmentation::tr().pack());

    vmcs.writel(Field::HostFsBase, Msr::<IA32_FS_BASE>::read());
    vmcs.writel(Field::HostGsBase, Msr::<IA32_GS_BASE>::read());

    vmcs.writel(Field::HostCr0, Cr0::current().bits());
    vmcs.writel(Field::HostCr3, intrinsics::read_cr3());
    vmcs.writel(Field::HostCr4, Cr4::current().bits());
    vmcs.write64(Field::HostIa32Efer, Msr::<IA32_EFER>::read());

    vmcs.writel(Field::HostIdtrBase, segmentation::sidt().base);
    vmcs.writel(Field::HostGdtrBase, segmentation::sgdt().base);
    vmcs.writel(Field::HostTrBase, segmentation::tr_base());

    vmcs.writel(Field::HostRip, vmx_return_address());

    vmcs.write32(
        Field::HostSysenterCs,
        Msr::<IA32_SYSENTER_CS>::read() as u32,
    );
    vmcs.writel(Field::HostSysenterEsp, Msr::<IA32_SYSENTER_ESP>::read());
    vmcs.writel(Field::HostSysenterEip, Msr::<IA32_SYSENTER_EIP>::read());

    if cfg.exit.contains(ExitControls::LOAD_IA32_PAT) {
        vmcs.write64(Field::HostIa32Pat, Msr::<IA32_PAT>::read());
    }

    // Guest state: a CPU fresh out of reset.
    vmcs.write16(Field::GuestCsSelector, 0xf000);
    vmcs.writel(Field::GuestCsBase, 0xffff_0000);
    vmcs.write32(Field::GuestCsLimit, 0xffff);
    vmcs.write32(Field::GuestCsArBytes, 0x93 | 0x08);

    for (selector, base, limit, ar) in [
        (Field::GuestDsSelector, Field::GuestDsBase, Field::GuestDsLimit, Field::GuestDsArBytes),
        (Field::GuestEsSelector, Field::GuestEsBase, Field::GuestEsLimit, Field::GuestEsArBytes),
        (Field::GuestSsSelector, Field::GuestSsBase, Field::GuestSsLimit, Field::GuestSsArBytes),
        (Field::GuestFsSelector, Field::GuestFsBase, Field::GuestFsLimit, Field::GuestFsArBytes),
        (Field::GuestGsSelector, Field::GuestGsBase, Field::GuestGsLimit, Field::GuestGsArBytes),
    ] {
        vmcs.write16(selector, 0);
        vmcs.writel(base, 0);
        vmcs.write32(limit, 0xffff);
        vmcs.write32(ar, 0x93);
    }

    vmcs.write16(Field::GuestTrSelector, 0);
    vmcs.writel(Field::GuestTrBase, 0);
    vmcs.write32(Field::GuestTrLimit, 0xffff);
    // Both Bochs and QEMU report a busy 32-bit TSS rather than 16-bit.
    vmcs.write32(Field::GuestTrArBytes, 0x008b);

    vmcs.write16(Field::GuestLdtrSelector, 0);
    vmcs.writel(Field::GuestLdtrBase, 0);
    vmcs.write32(Field::GuestLdtrLimit, 0xffff);
    vmcs.write32(Field::GuestLdtrArBytes, 0x0082);

    vmcs.write32(Field::GuestSysenterCs, 0);
    vmcs.writel(Field::GuestSysenterEsp, 0);
    vmcs.writel(Field::GuestSysenterEip, 0);
    vmcs.write64(Field::GuestIa32Debugctl, 0);

    vmcs.writel(Field::GuestRflags, 0x02);
    vmcs.writel(Field::GuestRip, 0xfff0);

    vmcs.writel(Field::GuestGdtrBase, 0);
    vmcs.write32(Field::GuestGdtrLimit, 0xffff);
    vmcs.writel(Field::GuestIdtrBase, 0);
    vmcs.write32(Field::GuestIdtrLimit, 0xffff);

    vmcs.write32(Field::GuestActivityState, ActivityState::Active as u64 as u32);
    vmcs.write32(Field::GuestInterruptibility, 0);
    vmcs.writel(Field::GuestPendingDbgExceptions, 0);

    vmcs.write32(Field::VmEntryInterruptionInfo, 0);

    vmcs.write16(Field::Vpid, 1);

    // Initial CR0: NW and CD are set, ET is hard-wired to 1; the CR masks
    // route every interesting CR0/CR4 write through the dispatcher.
    vmcs.writel(Field::Cr0GuestHostMask, GUEST_CR0_OWNED);
    vmcs.writel(Field::Cr4GuestHostMask, GUEST_CR4_ALWAYS_ON);
    vmcs.write64(Field::GuestIa32Efer, 0);
    set_cr0(vmcs, Cr0::NW.bits() | Cr0::CD.bits() | Cr0::ET.bits());
    vmcs.writel(Field::GuestCr3, 0);
    set_cr4(vmcs, 0);

    vcpu.activity = ActivityState::Active;
}

/// Point the guest at `start_ip` following the BIOS reset-vector
/// convention (CS.base carries the high bits, IP the low 16).
pub fn set_start_ip(vmcs: &ActiveVmcs, start_ip: u32) {
    let base = start_ip & 0xffff_0000;
    vmcs.writel(Field::GuestCsBase, base as u64);
    vmcs.write16(Field::GuestCsSelector, (base >> 4) as u16);
    vmcs.write32(Field::GuestCsLimit, 0xffff);
    vmcs.write32(Field::GuestCsArBytes, 0x93 | 0x08);
    vmcs.writel(Field::GuestRip, (start_ip & 0xffff) as u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn world_switch_offsets_are_pinned() {
        // The asm trampoline addresses the record with these constants.
        assert_eq!(VCPU_HOST_RSP, 0x88);
        assert_eq!(VCPU_FAIL, 0x90);
        assert_eq!(VCPU_LAUNCHED, 0x91);
        assert_eq!(VCPU_CR2, 0x80);
    }

    #[test]
    fn saved_msr_list_matches_autoload_slots() {
        let vcpu = VCpu::new();
        assert_eq!(MSR_SAVE_LIST[SavedMsr::Lstar as usize], IA32_LSTAR);
        assert_eq!(MSR_SAVE_LIST[SavedMsr::Star as usize], IA32_STAR);
        assert_eq!(
            MSR_SAVE_LIST[SavedMsr::KernelGsBase as usize],
            IA32_KERNEL_GS_BASE
        );
        assert_eq!(vcpu.saved_msr(SavedMsr::Lstar), 0);
    }
}

//! VM-exit dispatch: a fixed table of handlers indexed by the basic exit
//! reason. A reason with no entry is fatal; this VMM surfaces every
//! surprise as a crash instead of silently resuming the guest.

mod cpuid;
mod cr;
mod exception;
mod msr;

use crate::emulate;
use crate::vcpu::{SavedMsr, VCpu};
use crate::vmcs::{
    ActiveVmcs, Field, INTERRUPTIBILITY_MOV_SS, INTERRUPTIBILITY_STI,
};
use crate::Gpa;
use bedrock::x86_64::intrinsics;

/// Basic exit reasons this VMM knows by name.
pub mod reason {
    pub const EXCEPTION_NMI: usize = 0;
    pub const CPUID: usize = 10;
    pub const HLT: usize = 12;
    pub const RDTSC: usize = 16;
    pub const CR_ACCESS: usize = 28;
    pub const MSR_READ: usize = 31;
    pub const MSR_WRITE: usize = 32;
    pub const EPT_VIOLATION: usize = 48;
}

type Handler = fn(&mut VCpu, &ActiveVmcs);

const MAX_HANDLED_REASON: usize = 64;

static EXIT_HANDLERS: [Option<Handler>; MAX_HANDLED_REASON] = {
    let mut table: [Option<Handler>; MAX_HANDLED_REASON] = [None; MAX_HANDLED_REASON];
    table[reason::EXCEPTION_NMI] = Some(exception::handle_exception_nmi as Handler);
    table[reason::CPUID] = Some(cpuid::handle_cpuid as Handler);
    table[reason::HLT] = Some(handle_hlt as Handler);
    table[reason::RDTSC] = Some(handle_rdtsc as Handler);
    table[reason::CR_ACCESS] = Some(cr::handle_cr as Handler);
    table[reason::MSR_READ] = Some(msr::handle_rdmsr as Handler);
    table[reason::MSR_WRITE] = Some(msr::handle_wrmsr as Handler);
    table[reason::EPT_VIOLATION] = Some(handle_ept_violation as Handler);
    table
};

/// Read VM_EXIT_REASON and dispatch.
pub fn handle_exit(vcpu: &mut VCpu, vmcs: &ActiveVmcs) {
    let raw = vmcs.read32(Field::VmExitReason);
    if raw & 0x8000_0000 != 0 {
        dump_vmcs(vcpu, vmcs);
        panic!("vmx: VM-entry failure, basic reason {}", raw & 0xffff);
    }

    let basic = (raw & 0xffff) as usize;
    if let Some(Some(handler)) = EXIT_HANDLERS.get(basic) {
        return handler(vcpu, vmcs);
    }

    dump_vmcs(vcpu, vmcs);
    panic!("vmx: unexpected exit reason {}", basic);
}

/// Advance guest RIP over the instruction that caused the exit.
///
/// Skipping an emulated instruction also counts as executing one for the
/// STI/MOV-SS interrupt shadows, so those are cleared.
pub fn skip_emulated_instruction(vmcs: &ActiveVmcs) {
    let rip = vmcs.readl(Field::GuestRip);
    let len = vmcs.read32(Field::VmExitInstructionLen) as u64;
    vmcs.writel(Field::GuestRip, rip + len);

    let interruptibility = vmcs.read32(Field::GuestInterruptibility);
    vmcs.write32(
        Field::GuestInterruptibility,
        interruptibility & !((INTERRUPTIBILITY_STI | INTERRUPTIBILITY_MOV_SS) as u32),
    );
}

fn handle_rdtsc(vcpu: &mut VCpu, vmcs: &ActiveVmcs) {
    emulate::write_edx_eax(vcpu, intrinsics::rdtsc());
    skip_emulated_instruction(vmcs)
}

fn handle_hlt(vcpu: &mut VCpu, vmcs: &ActiveVmcs) {
    use crate::vmcs::ActivityState;

    // With interrupts off on the host and no event injection, a halted
    // guest is never coming back; park the machine.
    vcpu.activity = ActivityState::Hlt;
    log::info!(
        "vmx: guest executed HLT at rip {:#x}, parking",
        vmcs.readl(Field::GuestRip)
    );
    intrinsics::halt();
}

fn handle_ept_violation(vcpu: &mut VCpu, vmcs: &ActiveVmcs) {
    let guest_phys = Gpa::new(vmcs.read64(Field::GuestPhysicalAddress));
    match vcpu.ept_handler {
        Some(handler) => handler(vcpu, guest_phys),
        None => {
            dump_vmcs(vcpu, vmcs);
            panic!("vmx: cannot handle EPT violation at {:?}", guest_phys);
        }
    }
}

fn dump_sel(name: &str, vmcs: &ActiveVmcs, selector: Field, ar: Field, limit: Field, base: Field) {
    log::error!(
        "{} sel={:#06x}, attr={:#07x}, limit={:#010x}, base={:#018x}",
        name,
        vmcs.read_any(selector),
        vmcs.read_any(ar),
        vmcs.read_any(limit),
        vmcs.read_any(base)
    );
}

/// Dump guest, host and control state; the closest thing to a debugger
/// this environment has.
pub fn dump_vmcs(vcpu: &VCpu, vmcs: &ActiveVmcs) {
    log::error!("*** Guest State ***");
    log::error!(
        "CR0: actual={:#018x}, shadow={:#018x}, gh_mask={:#018x}",
        vmcs.readl(Field::GuestCr0),
        vmcs.readl(Field::Cr0ReadShadow),
        vmcs.readl(Field::Cr0GuestHostMask)
    );
    log::error!(
        "CR4: actual={:#018x}, shadow={:#018x}, gh_mask={:#018x}",
        vmcs.readl(Field::GuestCr4),
        vmcs.readl(Field::Cr4ReadShadow),
        vmcs.readl(Field::Cr4GuestHostMask)
    );
    log::error!("CR3 = {:#018x}", vmcs.readl(Field::GuestCr3));
    log::error!(
        "RSP = {:#018x}  RIP = {:#018x}",
        vmcs.readl(Field::GuestRsp),
        vmcs.readl(Field::GuestRip)
    );
    log::error!(
        "RFLAGS={:#010x}  DR7 = {:#018x}",
        vmcs.readl(Field::GuestRflags),
        vmcs.readl(Field::GuestDr7)
    );
    dump_sel("CS:  ", vmcs, Field::GuestCsSelector, Field::GuestCsArBytes, Field::GuestCsLimit, Field::GuestCsBase);
    dump_sel("DS:  ", vmcs, Field::GuestDsSelector, Field::GuestDsArBytes, Field::GuestDsLimit, Field::GuestDsBase);
    dump_sel("SS:  ", vmcs, Field::GuestSsSelector, Field::GuestSsArBytes, Field::GuestSsLimit, Field::GuestSsBase);
    dump_sel("ES:  ", vmcs, Field::GuestEsSelector, Field::GuestEsArBytes, Field::GuestEsLimit, Field::GuestEsBase);
    dump_sel("FS:  ", vmcs, Field::GuestFsSelector, Field::GuestFsArBytes, Field::GuestFsLimit, Field::GuestFsBase);
    dump_sel("GS:  ", vmcs, Field::GuestGsSelector, Field::GuestGsArBytes, Field::GuestGsLimit, Field::GuestGsBase);
    dump_sel("LDTR:", vmcs, Field::GuestLdtrSelector, Field::GuestLdtrArBytes, Field::GuestLdtrLimit, Field::GuestLdtrBase);
    dump_sel("TR:  ", vmcs, Field::GuestTrSelector, Field::GuestTrArBytes, Field::GuestTrLimit, Field::GuestTrBase);
    log::error!(
        "GDTR: limit={:#010x}, base={:#018x}",
        vmcs.read32(Field::GuestGdtrLimit),
        vmcs.readl(Field::GuestGdtrBase)
    );
    log::error!(
        "IDTR: limit={:#010x}, base={:#018x}",
        vmcs.read32(Field::GuestIdtrLimit),
        vmcs.readl(Field::GuestIdtrBase)
    );
    log::error!(
        "EFER = {:#018x}  PAT = {:#018x}",
        vmcs.read64(Field::GuestIa32Efer),
        vmcs.read64(Field::GuestIa32Pat)
    );
    log::error!(
        "Interruptibility = {:#010x}  ActivityState = {:#010x}",
        vmcs.read32(Field::GuestInterruptibility),
        vmcs.read32(Field::GuestActivityState)
    );
    for (name, which) in [
        ("KERNEL_GS_BASE", SavedMsr::KernelGsBase),
        ("SYSCALL_MASK", SavedMsr::SyscallMask),
        ("LSTAR", SavedMsr::Lstar),
        ("STAR", SavedMsr::Star),
    ] {
        log::error!("{} = {:#018x}", name, vcpu.saved_msr(which));
    }

    log::error!("*** Host State ***");
    log::error!(
        "RIP = {:#018x}  RSP = {:#018x}",
        vmcs.readl(Field::HostRip),
        vmcs.readl(Field::HostRsp)
    );
    log::error!(
        "CS={:#06x} SS={:#06x} DS={:#06x} ES={:#06x} FS={:#06x} GS={:#06x} TR={:#06x}",
        vmcs.read16(Field::HostCsSelector),
        vmcs.read16(Field::HostSsSelector),
        vmcs.read16(Field::HostDsSelector),
        vmcs.read16(Field::HostEsSelector),
        vmcs.read16(Field::HostFsSelector),
        vmcs.read16(Field::HostGsSelector),
        vmcs.read16(Field::HostTrSelector)
    );
    log::error!(
        "FSBase={:#018x} GSBase={:#018x} TRBase={:#018x}",
        vmcs.readl(Field::HostFsBase),
        vmcs.readl(Field::HostGsBase),
        vmcs.readl(Field::HostTrBase)
    );
    log::error!(
        "GDTBase={:#018x} IDTBase={:#018x}",
        vmcs.readl(Field::HostGdtrBase),
        vmcs.readl(Field::HostIdtrBase)
    );
    log::error!(
        "CR0={:#018x} CR3={:#018x} CR4={:#018x}",
        vmcs.readl(Field::HostCr0),
        vmcs.readl(Field::HostCr3),
        vmcs.readl(Field::HostCr4)
    );

    log::error!("*** Control State ***");
    log::error!(
        "PinBased={:#010x} CPUBased={:#010x} SecondaryExec={:#010x}",
        vmcs.read32(Field::PinBasedControls),
        vmcs.read32(Field::ProcBasedControls),
        vmcs.read32(Field::SecondaryControls)
    );
    log::error!(
        "EntryControls={:#010x} ExitControls={:#010x}",
        vmcs.read32(Field::VmEntryControls),
        vmcs.read32(Field::VmExitControls)
    );
    log::error!(
        "ExceptionBitmap={:#010x} PFECmask={:#010x} PFECmatch={:#010x}",
        vmcs.read32(Field::ExceptionBitmap),
        vmcs.read32(Field::PageFaultErrorCodeMask),
        vmcs.read32(Field::PageFaultErrorCodeMatch)
    );
    log::error!(
        "VMExit: intr_info={:#010x} errcode={:#010x} ilen={:#010x}",
        vmcs.read32(Field::VmExitInterruptionInfo),
        vmcs.read32(Field::VmExitInterruptionErrorCode),
        vmcs.read32(Field::VmExitInstructionLen)
    );
    log::error!(
        "        reason={:#010x} qualification={:#018x}",
        vmcs.read32(Field::VmExitReason),
        vmcs.readl(Field::ExitQualification)
    );
    log::error!(
        "IDTVectoring: info={:#010x} errcode={:#010x}",
        vmcs.read32(Field::IdtVectoringInfo),
        vmcs.read32(Field::IdtVectoringErrorCode)
    );
    log::error!("EPT pointer = {:#018x}", vmcs.read64(Field::EptPointer));
    log::error!(
        "Virtual processor ID = {:#06x}",
        vmcs.read16(Field::Vpid)
    );
}

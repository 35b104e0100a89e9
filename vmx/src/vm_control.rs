//! VMX capability MSRs and the five VMCS control words.
//!
//! Bit meanings follow the Intel SDM Vol. 3 control tables; only the bits
//! this VMM negotiates or strips are spelled out individually.

/// MSR - IA32_VMX_BASIC.
pub const IA32_VMX_BASIC: u32 = 0x480;
/// MSR - IA32_VMX_PINBASED_CTLS.
pub const IA32_VMX_PINBASED_CTLS: u32 = 0x481;
/// MSR - IA32_VMX_PROCBASED_CTLS.
pub const IA32_VMX_PROCBASED_CTLS: u32 = 0x482;
/// MSR - IA32_VMX_EXIT_CTLS.
pub const IA32_VMX_EXIT_CTLS: u32 = 0x483;
/// MSR - IA32_VMX_ENTRY_CTLS.
pub const IA32_VMX_ENTRY_CTLS: u32 = 0x484;
/// MSR - IA32_VMX_MISC.
pub const IA32_VMX_MISC: u32 = 0x485;
/// MSR - IA32_VMX_CR0_FIXED0.
pub const IA32_VMX_CR0_FIXED0: u32 = 0x486;
/// MSR - IA32_VMX_CR0_FIXED1.
pub const IA32_VMX_CR0_FIXED1: u32 = 0x487;
/// MSR - IA32_VMX_CR4_FIXED0.
pub const IA32_VMX_CR4_FIXED0: u32 = 0x488;
/// MSR - IA32_VMX_CR4_FIXED1.
pub const IA32_VMX_CR4_FIXED1: u32 = 0x489;
/// MSR - IA32_VMX_VMCS_ENUM.
pub const IA32_VMX_VMCS_ENUM: u32 = 0x48a;
/// MSR - IA32_VMX_PROCBASED_CTLS2.
pub const IA32_VMX_PROCBASED_CTLS2: u32 = 0x48b;
/// MSR - IA32_VMX_EPT_VPID_CAP.
pub const IA32_VMX_EPT_VPID_CAP: u32 = 0x48c;
/// MSR - IA32_VMX_VMFUNC, the last of the VMX capability family.
pub const IA32_VMX_VMFUNC: u32 = 0x491;

/// IA32_VMX_EPT_VPID_CAP: 4-level EPT page walk supported.
pub const EPT_CAP_PAGE_WALK_4: u32 = 1 << 6;
/// IA32_VMX_EPT_VPID_CAP: write-back EPT paging-structure memory type.
pub const EPT_CAP_MEMTYPE_WB: u32 = 1 << 14;
/// IA32_VMX_EPT_VPID_CAP: 2 MiB EPT pages supported.
pub const EPT_CAP_2MB_PAGE: u32 = 1 << 16;

bitflags::bitflags! {
    /// Pin-based VM-execution controls.
    pub struct PinControls: u32 {
        /// External interrupts cause VM exits.
        const EXTERNAL_INTERRUPT_EXITING = 1 << 0;
        /// NMIs cause VM exits.
        const NMI_EXITING = 1 << 3;
        /// NMIs are never blocked; "blocking by NMI" becomes virtual.
        const VIRTUAL_NMIS = 1 << 5;
        /// VMX-preemption timer counts down in non-root operation.
        const PREEMPTION_TIMER = 1 << 6;
        /// Posted-interrupt processing.
        const POSTED_INTERRUPTS = 1 << 7;
    }
}

bitflags::bitflags! {
    /// Primary processor-based VM-execution controls.
    pub struct ProcControls: u32 {
        /// VM exit at the start of any instruction when RFLAGS.IF = 1.
        const INTERRUPT_WINDOW_EXITING = 1 << 2;
        /// RDTSC/RDTSCP/RDMSR of TSC return a value offset by TSC_OFFSET.
        const USE_TSC_OFFSETTING = 1 << 3;
        /// HLT causes VM exits.
        const HLT_EXITING = 1 << 7;
        /// INVLPG causes VM exits.
        const INVLPG_EXITING = 1 << 9;
        /// MWAIT causes VM exits.
        const MWAIT_EXITING = 1 << 10;
        /// RDPMC causes VM exits.
        const RDPMC_EXITING = 1 << 11;
        /// RDTSC and RDTSCP cause VM exits.
        const RDTSC_EXITING = 1 << 12;
        /// MOV to CR3 causes VM exits.
        const CR3_LOAD_EXITING = 1 << 15;
        /// MOV from CR3 causes VM exits.
        const CR3_STORE_EXITING = 1 << 16;
        /// MOV to CR8 causes VM exits.
        const CR8_LOAD_EXITING = 1 << 19;
        /// MOV from CR8 causes VM exits.
        const CR8_STORE_EXITING = 1 << 20;
        /// TPR virtualization and the virtual-APIC page.
        const USE_TPR_SHADOW = 1 << 21;
        /// VM exit at the start of any instruction with no NMI blocking.
        const NMI_WINDOW_EXITING = 1 << 22;
        /// MOV DR causes VM exits.
        const MOV_DR_EXITING = 1 << 23;
        /// All I/O instructions cause VM exits.
        const UNCONDITIONAL_IO_EXITING = 1 << 24;
        /// Consult the I/O bitmaps for I/O instruction exits.
        const USE_IO_BITMAPS = 1 << 25;
        /// Monitor trap flag.
        const MONITOR_TRAP_FLAG = 1 << 27;
        /// Consult the MSR bitmap for RDMSR/WRMSR exits.
        const USE_MSR_BITMAPS = 1 << 28;
        /// MONITOR causes VM exits.
        const MONITOR_EXITING = 1 << 29;
        /// PAUSE causes VM exits.
        const PAUSE_EXITING = 1 << 30;
        /// The secondary processor-based controls are in use.
        const ACTIVATE_SECONDARY_CONTROLS = 1 << 31;
    }
}

bitflags::bitflags! {
    /// Secondary processor-based VM-execution controls.
    pub struct ProcControls2: u32 {
        /// Accesses to the APIC-access page are treated specially.
        const VIRTUALIZE_APIC_ACCESSES = 1 << 0;
        /// Extended page tables.
        const ENABLE_EPT = 1 << 1;
        /// Descriptor-table instructions cause VM exits.
        const DESCRIPTOR_TABLE_EXITING = 1 << 2;
        /// RDTSCP does not #UD.
        const ENABLE_RDTSCP = 1 << 3;
        /// RDMSR/WRMSR to the x2APIC MSR range are virtualized.
        const VIRTUALIZE_X2APIC_MODE = 1 << 4;
        /// TLB entries are tagged with a virtual-processor identifier.
        const ENABLE_VPID = 1 << 5;
        /// WBINVD causes VM exits.
        const WBINVD_EXITING = 1 << 6;
        /// Guest may run in real mode / unpaged protected mode.
        const UNRESTRICTED_GUEST = 1 << 7;
        /// APIC-register virtualization.
        const APIC_REGISTER_VIRTUALIZATION = 1 << 8;
        /// Virtual-interrupt delivery.
        const VIRTUAL_INTERRUPT_DELIVERY = 1 << 9;
        /// PAUSE-loop exiting.
        const PAUSE_LOOP_EXITING = 1 << 10;
        /// RDRAND causes VM exits.
        const RDRAND_EXITING = 1 << 11;
        /// INVPCID does not #UD.
        const ENABLE_INVPCID = 1 << 12;
        /// VMFUNC in non-root operation.
        const ENABLE_VM_FUNCTIONS = 1 << 13;
        /// VMREAD/VMWRITE may access a shadow VMCS.
        const VMCS_SHADOWING = 1 << 14;
        /// RDSEED causes VM exits.
        const RDSEED_EXITING = 1 << 16;
        /// EPT violations may deliver #VE instead of exiting.
        const EPT_VIOLATION_VE = 1 << 18;
        /// XSAVES/XRSTORS do not #UD.
        const ENABLE_XSAVES = 1 << 20;
        /// TSC multiplier is applied.
        const USE_TSC_SCALING = 1 << 25;
    }
}

bitflags::bitflags! {
    /// Primary VM-exit controls.
    pub struct ExitControls: u32 {
        /// DR7 and IA32_DEBUGCTL are saved on VM exit.
        const SAVE_DEBUG_CONTROLS = 1 << 2;
        /// The processor is in 64-bit mode after VM exit.
        const HOST_ADDR_SPACE_SIZE = 1 << 9;
        /// IA32_PERF_GLOBAL_CTRL is loaded on VM exit.
        const LOAD_IA32_PERF_GLOBAL_CTRL = 1 << 12;
        /// Acknowledge the interrupt controller on external-interrupt exits.
        const ACK_INTERRUPT_ON_EXIT = 1 << 15;
        /// IA32_PAT is saved on VM exit.
        const SAVE_IA32_PAT = 1 << 18;
        /// IA32_PAT is loaded on VM exit.
        const LOAD_IA32_PAT = 1 << 19;
        /// IA32_EFER is saved on VM exit.
        const SAVE_IA32_EFER = 1 << 20;
        /// IA32_EFER is loaded on VM exit.
        const LOAD_IA32_EFER = 1 << 21;
        /// The preemption-timer value is saved on VM exit.
        const SAVE_PREEMPTION_TIMER = 1 << 22;
        /// IA32_BNDCFGS is cleared on VM exit.
        const CLEAR_IA32_BNDCFGS = 1 << 23;
    }
}

bitflags::bitflags! {
    /// VM-entry controls.
    pub struct EntryControls: u32 {
        /// DR7 and IA32_DEBUGCTL are loaded on VM entry.
        const LOAD_DEBUG_CONTROLS = 1 << 2;
        /// The logical processor is in IA-32e mode after VM entry.
        const IA32E_MODE_GUEST = 1 << 9;
        /// Enter system-management mode.
        const ENTRY_TO_SMM = 1 << 10;
        /// Deactivate dual-monitor treatment of SMIs.
        const DEACTIVATE_DUAL_MONITOR = 1 << 11;
        /// IA32_PERF_GLOBAL_CTRL is loaded on VM entry.
        const LOAD_IA32_PERF_GLOBAL_CTRL = 1 << 13;
        /// IA32_PAT is loaded on VM entry.
        const LOAD_IA32_PAT = 1 << 14;
        /// IA32_EFER is loaded on VM entry.
        const LOAD_IA32_EFER = 1 << 15;
        /// IA32_BNDCFGS is loaded on VM entry.
        const LOAD_IA32_BNDCFGS = 1 << 16;
    }
}

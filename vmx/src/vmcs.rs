//! Virtual-Machine Control Structure: the region, the VMX instruction
//! wrappers, and width-checked field accessors.
//!
//! See Intel® 64 and IA-32 Architectures Software Developer's Manual,
//! Vol. 3, "Virtual Machine Control Structures".

use crate::config;
use bedrock::addressing::{Pa, Va, PAGE_SIZE};
use core::arch::asm;
use num_enum::TryFromPrimitive;

/// A VMCS (or VMXON) region: one 4 KiB page whose first word is the
/// processor's VMCS revision identifier.
#[repr(C, align(4096))]
pub struct Vmcs {
    /// Bits 30:0 revision identifier, bit 31 shadow-VMCS indicator.
    rev_id: u32,
    /// VMX-abort indicator.
    abort: u32,
    /// Implementation-specific format.
    data: [u8; PAGE_SIZE - 8],
}

impl Vmcs {
    /// An all-zero region, for static placement.
    pub const fn zeroed() -> Self {
        Self {
            rev_id: 0,
            abort: 0,
            data: [0; PAGE_SIZE - 8],
        }
    }

    /// Stamp the revision identifier negotiated at `hardware_setup`.
    pub fn init(&mut self) {
        self.rev_id = config::config().revision_id;
        self.abort = 0;
    }

    /// Physical address of this region.
    pub fn pa(&self) -> Pa {
        Va::of(self).into_pa()
    }

    /// Enter VMX root operation with this region as the VMXON region.
    ///
    /// # Safety
    /// The region must be initialized with the right revision id, CR4.VMXE
    /// must be set, and the CPU must not already be in VMX operation.
    pub unsafe fn vmxon(&self) {
        let pa = self.pa().into_usize() as u64;
        let err: u8;
        asm!(
            "vmxon [{}]",
            "setna {}",
            in(reg) &pa,
            out(reg_byte) err,
            options(nostack)
        );
        assert_eq!(err, 0, "vmx: vmxon failed");
    }

    /// VMCLEAR this region, making it inactive and clear.
    pub fn clear(&self) {
        let pa = self.pa().into_usize() as u64;
        let err: u8;
        unsafe {
            asm!(
                "vmclear [{}]",
                "setna {}",
                in(reg) &pa,
                out(reg_byte) err,
                options(nostack)
            );
        }
        assert_eq!(err, 0, "vmx: vmclear failed: {:?}", instruction_error());
    }

    /// VMPTRLD this region, making it the current VMCS on this CPU.
    ///
    /// # Safety
    /// The CPU must be in VMX root operation and the region initialized.
    pub unsafe fn load(&mut self) -> ActiveVmcs {
        let pa = self.pa().into_usize() as u64;
        let err: u8;
        asm!(
            "vmptrld [{}]",
            "setna {}",
            in(reg) &pa,
            out(reg_byte) err,
            options(nostack)
        );
        assert_eq!(
            err,
            0,
            "vmx: vmptrld {:x} failed: {:?}",
            pa,
            instruction_error()
        );
        ActiveVmcs { _p: () }
    }
}

/// Flush every EPT-derived translation on this CPU (INVEPT type 2,
/// global). The descriptor is ignored for the global type but must still
/// be a valid 128-bit memory operand.
///
/// # Safety
/// Requires VMX root operation.
pub unsafe fn invept_global() {
    let descriptor: [u64; 2] = [0, 0];
    let err: u8;
    asm!(
        "invept {}, [{}]",
        "setna {}",
        in(reg) 2u64,
        in(reg) &descriptor,
        out(reg_byte) err,
        options(nostack)
    );
    assert_eq!(err, 0, "vmx: invept failed: {:?}", instruction_error());
}

/// Read the VM-instruction error field of the current VMCS.
pub fn instruction_error() -> InstructionError {
    let v: u64;
    let err: u8;
    unsafe {
        asm!(
            "vmread {}, {}",
            "setna {}",
            out(reg) v,
            in(reg) Field::VmInstructionError.encoding(),
            out(reg_byte) err,
            options(nomem, nostack)
        );
    }
    if err != 0 {
        return InstructionError::Unknown;
    }
    InstructionError::try_from(v).unwrap_or(InstructionError::Unknown)
}

/// VM-instruction error numbers (SDM Vol. 3, "VM-Instruction Error Numbers").
#[derive(Debug, Eq, PartialEq, Clone, Copy, TryFromPrimitive)]
#[repr(u64)]
pub enum InstructionError {
    /// VMCALL executed in VMX root operation.
    VmcallInRoot = 1,
    /// VMCLEAR with invalid physical address.
    VmclearBadAddress = 2,
    /// VMCLEAR with the VMXON pointer.
    VmclearVmxonPointer = 3,
    /// VMLAUNCH with a non-clear VMCS.
    VmlaunchNonClearVmcs = 4,
    /// VMRESUME with a non-launched VMCS.
    VmresumeNonLaunchedVmcs = 5,
    /// VMRESUME after VMXOFF.
    VmresumeAfterVmxoff = 6,
    /// VM entry with invalid control field(s).
    EntryBadControls = 7,
    /// VM entry with invalid host-state field(s).
    EntryBadHostState = 8,
    /// VMPTRLD with invalid physical address.
    VmptrldBadAddress = 9,
    /// VMPTRLD with the VMXON pointer.
    VmptrldVmxonPointer = 10,
    /// VMPTRLD with incorrect revision identifier.
    VmptrldBadRevision = 11,
    /// VMREAD/VMWRITE to an unsupported component.
    UnsupportedField = 12,
    /// VMWRITE to a read-only component.
    WriteReadOnlyField = 13,
    /// VMXON executed in VMX root operation.
    VmxonInRoot = 15,
    /// VM entry with invalid executive-VMCS pointer.
    EntryBadExecutivePointer = 16,
    /// VM entry with non-launched executive VMCS.
    EntryNonLaunchedExecutive = 17,
    /// VM entry with executive-VMCS pointer not the VMXON pointer.
    EntryExecutiveNotVmxon = 18,
    /// VMCALL with a non-clear VMCS.
    VmcallNonClearVmcs = 19,
    /// VMCALL with invalid VM-exit control fields.
    VmcallBadExitControls = 20,
    /// VMCALL with incorrect MSEG revision identifier.
    VmcallBadMsegRevision = 22,
    /// VMXOFF under dual-monitor treatment of SMIs.
    VmxoffUnderDualMonitor = 23,
    /// VMCALL with invalid SMM-monitor features.
    VmcallBadSmmMonitor = 24,
    /// VM entry with invalid VM-execution controls in executive VMCS.
    EntryBadExecutiveControls = 25,
    /// VM entry with events blocked by MOV SS.
    EntryBlockedByMovSs = 26,
    /// Invalid operand to INVEPT/INVVPID.
    BadInveptInvvpidOperand = 28,
    /// Anything the hardware did not report.
    Unknown = 0,
}

/// Width class of a VMCS field, taken from bits 14:13 of its encoding.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FieldWidth {
    /// 16-bit fields.
    W16,
    /// 64-bit fields.
    W64,
    /// 32-bit fields.
    W32,
    /// Natural-width fields.
    WNatural,
}

/// VMCS field encodings used by this VMM.
#[allow(missing_docs)]
#[repr(u32)]
#[derive(Debug, Clone, Copy)]
pub enum Field {
    // 16-bit control fields.
    Vpid = 0x0000,
    // 16-bit guest-state fields.
    GuestEsSelector = 0x0800,
    GuestCsSelector = 0x0802,
    GuestSsSelector = 0x0804,
    GuestDsSelector = 0x0806,
    GuestFsSelector = 0x0808,
    GuestGsSelector = 0x080a,
    GuestLdtrSelector = 0x080c,
    GuestTrSelector = 0x080e,
    // 16-bit host-state fields.
    HostEsSelector = 0x0c00,
    HostCsSelector = 0x0c02,
    HostSsSelector = 0x0c04,
    HostDsSelector = 0x0c06,
    HostFsSelector = 0x0c08,
    HostGsSelector = 0x0c0a,
    HostTrSelector = 0x0c0c,
    // 64-bit control fields.
    IoBitmapA = 0x2000,
    IoBitmapB = 0x2002,
    MsrBitmap = 0x2004,
    VmExitMsrStoreAddr = 0x2006,
    VmExitMsrLoadAddr = 0x2008,
    VmEntryMsrLoadAddr = 0x200a,
    TscOffset = 0x2010,
    EptPointer = 0x201a,
    // 64-bit read-only data fields.
    GuestPhysicalAddress = 0x2400,
    // 64-bit guest-state fields.
    VmcsLinkPointer = 0x2800,
    GuestIa32Debugctl = 0x2802,
    GuestIa32Pat = 0x2804,
    GuestIa32Efer = 0x2806,
    // 64-bit host-state fields.
    HostIa32Pat = 0x2c00,
    HostIa32Efer = 0x2c02,
    // 32-bit control fields.
    PinBasedControls = 0x4000,
    ProcBasedControls = 0x4002,
    ExceptionBitmap = 0x4004,
    PageFaultErrorCodeMask = 0x4006,
    PageFaultErrorCodeMatch = 0x4008,
    Cr3TargetCount = 0x400a,
    VmExitControls = 0x400c,
    VmExitMsrStoreCount = 0x400e,
    VmExitMsrLoadCount = 0x4010,
    VmEntryControls = 0x4012,
    VmEntryMsrLoadCount = 0x4014,
    VmEntryInterruptionInfo = 0x4016,
    VmEntryExceptionErrorCode = 0x4018,
    VmEntryInstructionLen = 0x401a,
    SecondaryControls = 0x401e,
    // 32-bit read-only data fields.
    VmInstructionError = 0x4400,
    VmExitReason = 0x4402,
    VmExitInterruptionInfo = 0x4404,
    VmExitInterruptionErrorCode = 0x4406,
    IdtVectoringInfo = 0x4408,
    IdtVectoringErrorCode = 0x440a,
    VmExitInstructionLen = 0x440c,
    VmExitInstructionInfo = 0x440e,
    // 32-bit guest-state fields.
    GuestEsLimit = 0x4800,
    GuestCsLimit = 0x4802,
    GuestSsLimit = 0x4804,
    GuestDsLimit = 0x4806,
    GuestFsLimit = 0x4808,
    GuestGsLimit = 0x480a,
    GuestLdtrLimit = 0x480c,
    GuestTrLimit = 0x480e,
    GuestGdtrLimit = 0x4810,
    GuestIdtrLimit = 0x4812,
    GuestEsArBytes = 0x4814,
    GuestCsArBytes = 0x4816,
    GuestSsArBytes = 0x4818,
    GuestDsArBytes = 0x481a,
    GuestFsArBytes = 0x481c,
    GuestGsArBytes = 0x481e,
    GuestLdtrArBytes = 0x4820,
    GuestTrArBytes = 0x4822,
    GuestInterruptibility = 0x4824,
    GuestActivityState = 0x4826,
    GuestSysenterCs = 0x482a,
    // 32-bit host-state fields.
    HostSysenterCs = 0x4c00,
    // Natural-width control fields.
    Cr0GuestHostMask = 0x6000,
    Cr4GuestHostMask = 0x6002,
    Cr0ReadShadow = 0x6004,
    Cr4ReadShadow = 0x6006,
    // Natural-width read-only data fields.
    ExitQualification = 0x6400,
    GuestLinearAddress = 0x640a,
    // Natural-width guest-state fields.
    GuestCr0 = 0x6800,
    GuestCr3 = 0x6802,
    GuestCr4 = 0x6804,
    GuestEsBase = 0x6806,
    GuestCsBase = 0x6808,
    GuestSsBase = 0x680a,
    GuestDsBase = 0x680c,
    GuestFsBase = 0x680e,
    GuestGsBase = 0x6810,
    GuestLdtrBase = 0x6812,
    GuestTrBase = 0x6814,
    GuestGdtrBase = 0x6816,
    GuestIdtrBase = 0x6818,
    GuestDr7 = 0x681a,
    GuestRsp = 0x681c,
    GuestRip = 0x681e,
    GuestRflags = 0x6820,
    GuestPendingDbgExceptions = 0x6822,
    GuestSysenterEsp = 0x6824,
    GuestSysenterEip = 0x6826,
    // Natural-width host-state fields.
    HostCr0 = 0x6c00,
    HostCr3 = 0x6c02,
    HostCr4 = 0x6c04,
    HostFsBase = 0x6c06,
    HostGsBase = 0x6c08,
    HostTrBase = 0x6c0a,
    HostGdtrBase = 0x6c0c,
    HostIdtrBase = 0x6c0e,
    HostSysenterEsp = 0x6c10,
    HostSysenterEip = 0x6c12,
    HostRsp = 0x6c14,
    HostRip = 0x6c16,
}

impl Field {
    /// The raw encoding.
    #[inline]
    pub const fn encoding(self) -> u64 {
        self as u32 as u64
    }

    /// Width class from the encoding.
    #[inline]
    pub const fn width(self) -> FieldWidth {
        match (self as u32 >> 13) & 3 {
            0 => FieldWidth::W16,
            1 => FieldWidth::W64,
            2 => FieldWidth::W32,
            _ => FieldWidth::WNatural,
        }
    }
}

/// GUEST_INTERRUPTIBILITY: blocking by STI.
pub const INTERRUPTIBILITY_STI: u64 = 1 << 0;
/// GUEST_INTERRUPTIBILITY: blocking by MOV SS.
pub const INTERRUPTIBILITY_MOV_SS: u64 = 1 << 1;

/// GUEST_ACTIVITY_STATE values.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive)]
#[repr(u64)]
pub enum ActivityState {
    /// Executing instructions normally.
    Active = 0,
    /// Halted by HLT.
    Hlt = 1,
    /// Triple-faulted.
    Shutdown = 2,
    /// Waiting for a startup IPI.
    WaitForSipi = 3,
}

/// Witness that a VMCS is current on this CPU. VMREAD/VMWRITE act on the
/// current VMCS, so the accessors hang off this type.
pub struct ActiveVmcs {
    _p: (),
}

impl ActiveVmcs {
    #[inline]
    fn raw_read(&self, field: Field) -> u64 {
        let v: u64;
        let err: u8;
        unsafe {
            asm!(
                "vmread {}, {}",
                "setna {}",
                out(reg) v,
                in(reg) field.encoding(),
                out(reg_byte) err,
                options(nomem, nostack)
            );
        }
        if err != 0 {
            panic!("vmx: vmread {:?} failed: {:?}", field, instruction_error());
        }
        v
    }

    #[inline]
    fn raw_write(&self, field: Field, value: u64) {
        let err: u8;
        unsafe {
            asm!(
                "vmwrite {}, {}",
                "setna {}",
                in(reg) field.encoding(),
                in(reg) value,
                out(reg_byte) err,
                options(nomem, nostack)
            );
        }
        if err != 0 {
            // Always a programmer error, never guest-visible.
            panic!(
                "vmx: vmwrite error: field {:?} value {:x} ({:?})",
                field,
                value,
                instruction_error()
            );
        }
    }

    /// Read a 16-bit field.
    #[inline]
    pub fn read16(&self, field: Field) -> u16 {
        assert_eq!(field.width(), FieldWidth::W16);
        self.raw_read(field) as u16
    }

    /// Read a 32-bit field.
    #[inline]
    pub fn read32(&self, field: Field) -> u32 {
        assert_eq!(field.width(), FieldWidth::W32);
        self.raw_read(field) as u32
    }

    /// Read a 64-bit field.
    #[inline]
    pub fn read64(&self, field: Field) -> u64 {
        assert_eq!(field.width(), FieldWidth::W64);
        self.raw_read(field)
    }

    /// Read a natural-width field.
    #[inline]
    pub fn readl(&self, field: Field) -> u64 {
        assert_eq!(field.width(), FieldWidth::WNatural);
        self.raw_read(field)
    }

    /// Write a 16-bit field.
    #[inline]
    pub fn write16(&self, field: Field, value: u16) {
        assert_eq!(field.width(), FieldWidth::W16);
        self.raw_write(field, value as u64)
    }

    /// Write a 32-bit field.
    #[inline]
    pub fn write32(&self, field: Field, value: u32) {
        assert_eq!(field.width(), FieldWidth::W32);
        self.raw_write(field, value as u64)
    }

    /// Write a 64-bit field.
    #[inline]
    pub fn write64(&self, field: Field, value: u64) {
        assert_eq!(field.width(), FieldWidth::W64);
        self.raw_write(field, value)
    }

    /// Write a natural-width field.
    #[inline]
    pub fn writel(&self, field: Field, value: u64) {
        assert_eq!(field.width(), FieldWidth::WNatural);
        self.raw_write(field, value)
    }

    /// Read a segment field group without a width assertion; used by the
    /// segment get/set helpers which mix widths per sub-field.
    #[inline]
    pub(crate) fn read_any(&self, field: Field) -> u64 {
        self.raw_read(field)
    }

    #[inline]
    pub(crate) fn write_any(&self, field: Field, value: u64) {
        self.raw_write(field, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_width_follows_encoding() {
        assert_eq!(Field::Vpid.width(), FieldWidth::W16);
        assert_eq!(Field::GuestCsSelector.width(), FieldWidth::W16);
        assert_eq!(Field::MsrBitmap.width(), FieldWidth::W64);
        assert_eq!(Field::GuestIa32Efer.width(), FieldWidth::W64);
        assert_eq!(Field::VmExitReason.width(), FieldWidth::W32);
        assert_eq!(Field::GuestTrArBytes.width(), FieldWidth::W32);
        assert_eq!(Field::GuestRip.width(), FieldWidth::WNatural);
        assert_eq!(Field::HostRsp.width(), FieldWidth::WNatural);
        assert_eq!(Field::ExitQualification.width(), FieldWidth::WNatural);
    }

    #[test]
    fn vmcs_region_is_one_page() {
        assert_eq!(core::mem::size_of::<Vmcs>(), PAGE_SIZE);
        assert_eq!(core::mem::align_of::<Vmcs>(), PAGE_SIZE);
    }

    #[test]
    fn instruction_error_numbers_round_trip() {
        assert_eq!(
            InstructionError::try_from(5).unwrap(),
            InstructionError::VmresumeNonLaunchedVmcs
        );
        assert_eq!(
            InstructionError::try_from(12).unwrap(),
            InstructionError::UnsupportedField
        );
        assert!(InstructionError::try_from(14).is_err());
    }
}

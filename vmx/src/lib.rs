//! The VT-x virtualization engine.
//!
//! This crate stands up a single guest on Intel VT-x: it negotiates the
//! VMCS controls against the capability MSRs ([`config`]), builds the
//! extended page table ([`ept`]), initializes a vCPU to the power-on reset
//! state ([`vcpu`]), performs the world switch, and dispatches VM exits
//! ([`vmexit`]) to a small set of emulation helpers ([`emulate`]). The
//! [`kvm`] module owns the guest memory frames and drives the whole thing.
//!
//! Error handling is deliberately fail-fast: a wrong VMCS field, a control
//! bit the hardware refuses, or an exit nobody handles is a bug in the VMM
//! or an unsupported guest, and the only sane reaction without a debugger
//! is to dump the VMCS and panic.
#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod emulate;
pub mod ept;
pub mod kvm;
pub mod vcpu;
pub mod vm_control;
pub mod vmcs;
pub mod vmexit;

/// Guest physical address.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
pub struct Gpa(u64);

impl Gpa {
    /// Wrap a guest physical address.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Cast into u64.
    #[inline]
    pub const fn into_u64(self) -> u64 {
        self.0
    }
}

/// Guest virtual address.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
pub struct Gva(u64);

impl Gva {
    /// Wrap a guest virtual address.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Cast into u64.
    #[inline]
    pub const fn into_u64(self) -> u64 {
        self.0
    }
}

impl core::fmt::Debug for Gpa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gpa(0x{:x})", self.0)
    }
}

impl core::fmt::Debug for Gva {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gva(0x{:x})", self.0)
    }
}

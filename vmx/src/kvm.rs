//! Top-level orchestration: guest memory frames, the guest parameters
//! blob, EPT construction, and the run loop.
//!
//! Everything guest-visible lives in statics owned by this module: two
//! 2 MiB frames (one backing guest physical `[0, 2 MiB)` where the
//! firmware lands, one backing the 2 MiB frame holding the kernel image),
//! the EPT tables, and the per-CPU VMXON/VMCS pages. All of it is written
//! during [`init`] and then only read.

use crate::ept::EptTables;
use crate::vcpu::{self, VCpu};
use crate::vmcs::{self, Vmcs};
use crate::{vmexit, Gpa};
use bedrock::addressing::{Pa, Va, SZ_2M};
use bedrock::boot::MultibootInfo;
use bedrock::e820::E820Entry;
use core::ptr::addr_of_mut;
use firmware::params::{self, GuestParams, CMDLINE_SIZE, FIRMWARE_START};

#[repr(C, align(2097152))]
struct GuestFrame([u8; SZ_2M]);

static mut EPT: EptTables = EptTables::zeroed();
static mut FIRMWARE_FRAME: GuestFrame = GuestFrame([0; SZ_2M]);
static mut KERNEL_FRAME: GuestFrame = GuestFrame([0; SZ_2M]);
static mut GUEST_PARAMS: GuestParams = GuestParams::zeroed();

static mut VMXON_REGION: Vmcs = Vmcs::zeroed();
static mut VMCS0: Vmcs = Vmcs::zeroed();
static mut VCPU0: VCpu = VCpu::new();

fn firmware_frame_base() -> Pa {
    unsafe { Va::of(&*addr_of_mut!(FIRMWARE_FRAME)).into_pa() }
}

fn kernel_frame_base() -> Pa {
    unsafe { Va::of(&*addr_of_mut!(KERNEL_FRAME)).into_pa() }
}

/// Host view of a guest physical address inside the firmware frame.
fn gfva(guest_pa: u64) -> *mut u8 {
    let offset = guest_pa as usize & (SZ_2M - 1);
    unsafe { (*addr_of_mut!(FIRMWARE_FRAME)).0.as_mut_ptr().add(offset) }
}

/// Host view of a guest physical address inside the kernel frame.
fn gkva(guest_pa: u64) -> *mut u8 {
    let offset = guest_pa as usize & (SZ_2M - 1);
    unsafe { (*addr_of_mut!(KERNEL_FRAME)).0.as_mut_ptr().add(offset) }
}

/// Build the second-stage translation: identity except for the two frames
/// the VMM substitutes.
fn construct_tdp(kernel_start: u64) {
    let ept = unsafe { &mut *addr_of_mut!(EPT) };
    ept.init();
    ept.map_2m(Gpa::new(0), firmware_frame_base());
    ept.map_2m(
        Gpa::new(kernel_start & !(SZ_2M as u64 - 1)),
        kernel_frame_base(),
    );
}

fn fill_guest_params(boot: &MultibootInfo, e820: &[E820Entry]) {
    let params = unsafe { &mut *addr_of_mut!(GUEST_PARAMS) };

    let modules = boot.modules();
    if modules.is_empty() {
        panic!("kvm: no guest kernel loaded");
    }
    params.kernel_start = modules[0].start as u64;
    params.kernel_end = modules[0].end as u64;

    if let Some(cmdline) = modules[0].cmdline() {
        if cmdline.len() >= CMDLINE_SIZE {
            panic!("kvm: kernel cmdline too long");
        }
        params.cmdline[..cmdline.len()].copy_from_slice(cmdline);
        params.cmdline[cmdline.len()] = 0;
    }

    if modules.len() > 1 {
        params.initrd_start = modules[1].start as u64;
        params.initrd_end = modules[1].end as u64;
    }

    if e820.len() > params.e820_table.len() {
        panic!("kvm: e820 table too large for the guest");
    }
    params.e820_table[..e820.len()].copy_from_slice(e820);
    params.e820_entries = e820.len() as u32;

    params.magic = params::jump_header();
}

/// Stand up the virtualization engine and stage the guest.
///
/// `firmware_image` is the built firmware blob (linked into the VMM);
/// `e820` is the sanitized host memory map from the bring-up code.
pub fn init(boot: &MultibootInfo, e820: &[E820Entry], firmware_image: &[u8]) {
    crate::config::hardware_setup();

    fill_guest_params(boot, e820);
    let params = unsafe { &*addr_of_mut!(GUEST_PARAMS) };

    if params.kernel_start < SZ_2M as u64 {
        panic!("kvm: kernel module collides with the firmware frame");
    }
    construct_tdp(params.kernel_start);

    // Firmware lands at its fixed guest address.
    assert!(firmware_image.len() <= SZ_2M - FIRMWARE_START as usize);
    unsafe {
        core::ptr::copy_nonoverlapping(
            firmware_image.as_ptr(),
            gfva(FIRMWARE_START),
            firmware_image.len(),
        );
    }

    // The image must begin with the same jump header the VMM is about to
    // lay down; anything else means the blob and the VMM disagree about
    // the parameter layout.
    let mut blob_magic = [0u8; 8];
    blob_magic
        .copy_from_slice(unsafe { core::slice::from_raw_parts(gfva(FIRMWARE_START), 8) });
    if blob_magic != params.magic {
        panic!("kvm: firmware magic doesn't match");
    }

    // Write the parameters over the head of the blob.
    unsafe {
        core::ptr::copy_nonoverlapping(
            params as *const GuestParams as *const u8,
            gfva(FIRMWARE_START),
            core::mem::size_of::<GuestParams>(),
        );
    }

    // Copy the kernel image into the frame the EPT substitutes for its
    // load address, preserving the offset within the 2 MiB frame.
    let kernel_len = (params.kernel_end - params.kernel_start) as usize;
    assert!(
        (params.kernel_start as usize & (SZ_2M - 1)) + kernel_len <= SZ_2M,
        "kvm: kernel image does not fit its 2MiB frame"
    );
    unsafe {
        core::ptr::copy_nonoverlapping(
            params.kernel_start as usize as *const u8,
            gkva(params.kernel_start),
            kernel_len,
        );
    }

    let (kernel_start, kernel_end, e820_entries) =
        (params.kernel_start, params.kernel_end, params.e820_entries);
    log::info!(
        "kvm: guest kernel at {:#x}..{:#x}, {} e820 entries",
        kernel_start,
        kernel_end,
        e820_entries
    );
}

/// Enable VMX on this CPU and initialize its vCPU to the reset state.
fn create_vcpu() -> (&'static mut VCpu, vmcs::ActiveVmcs) {
    unsafe {
        vcpu::enable_on_this_cpu(&mut *addr_of_mut!(VMXON_REGION));

        let vmcs0 = &mut *addr_of_mut!(VMCS0);
        vmcs0.init();
        vmcs0.clear();
        let active = vmcs0.load();

        let vcpu = &mut *addr_of_mut!(VCPU0);
        vcpu::vcpu_setup(vcpu, &active);
        active.write64(
            crate::vmcs::Field::EptPointer,
            (*addr_of_mut!(EPT)).eptp(),
        );
        vmcs::invept_global();
        (vcpu, active)
    }
}

/// The dispatcher loop. Never returns; panics are the only way out.
fn kvm_loop(vcpu: &mut VCpu, active: &vmcs::ActiveVmcs) -> ! {
    loop {
        vcpu.run();
        if vcpu.failed() {
            panic!(
                "kvm: vmlaunch/vmresume failed: {:?}",
                vmcs::instruction_error()
            );
        }
        vmexit::handle_exit(vcpu, active);
    }
}

/// Run the guest on the boot CPU, entering the firmware at its fixed
/// guest physical address. Never returns.
pub fn bsp_run() -> ! {
    let (vcpu, active) = create_vcpu();
    vcpu::set_start_ip(&active, FIRMWARE_START as u32);
    kvm_loop(vcpu, &active)
}

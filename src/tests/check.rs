//! Tests for the `VMRUN` consistency checks.

use alloc::boxed::Box;

use tock_registers::interfaces::Writeable;
use x86_64::registers::control::Cr0Flags;
use x86_64::registers::model_specific::EferFlags;

use super::mock::*;
use crate::frame::PAGE_SIZE;
use crate::svm::vmcb::{InterceptVec4, VmcbStruct};
use crate::{VmcbCheckError, check_vmcb};

fn vmcb(page: &Page) -> &VmcbStruct {
    unsafe { &*(page.0.as_ptr() as *const VmcbStruct) }
}

/// A VMCB of a 64-bit guest that passes every check.
fn valid_page() -> Box<Page> {
    let page = Box::new(Page([0; PAGE_SIZE]));
    let v = vmcb(&page);
    v.state.efer.set(L1_EFER);
    v.state.cr0.set(L1_CR0);
    v.state.cr4.set(L1_CR4);
    v.state.cr3.set(0x1000);
    v.state.dr6.set(0xffff_0ff0);
    v.state.dr7.set(0x400);
    v.control.intercept_vector4.write(InterceptVec4::VMRUN::SET);
    v.control.guest_asid.set(1);
    page
}

#[test]
fn test_valid_vmcb() {
    let page = valid_page();
    assert_eq!(check_vmcb(vmcb(&page)), Ok(()));
}

#[test]
fn test_efer_rules() {
    let page = valid_page();
    let v = vmcb(&page);

    v.state.efer.set(L1_EFER & !EferFlags::SECURE_VIRTUAL_MACHINE_ENABLE.bits());
    assert_eq!(check_vmcb(v), Err(VmcbCheckError::SvmeClear));

    v.state.efer.set(L1_EFER | 1 << 1);
    assert_eq!(check_vmcb(v), Err(VmcbCheckError::EferReserved));
}

#[test]
fn test_cr0_rules() {
    let page = valid_page();
    let v = vmcb(&page);

    v.state.cr0.set(L1_CR0 | Cr0Flags::NOT_WRITE_THROUGH.bits());
    assert_eq!(check_vmcb(v), Err(VmcbCheckError::CacheDisableNotWriteThrough));

    v.state
        .cr0
        .set(L1_CR0 | Cr0Flags::NOT_WRITE_THROUGH.bits() | Cr0Flags::CACHE_DISABLE.bits());
    assert_eq!(check_vmcb(v), Ok(()));

    v.state.cr0.set(L1_CR0 | 1 << 32);
    assert_eq!(check_vmcb(v), Err(VmcbCheckError::Cr0Reserved));
}

#[test]
fn test_long_mode_rules() {
    let page = valid_page();
    let v = vmcb(&page);

    v.state.cr4.set(0);
    assert_eq!(check_vmcb(v), Err(VmcbCheckError::LongModeWithoutPae));

    v.state.cr4.set(L1_CR4);
    v.state.cr0.set(Cr0Flags::PAGING.bits());
    assert_eq!(check_vmcb(v), Err(VmcbCheckError::LongModeWithoutPe));

    v.state.cr0.set(L1_CR0);
    v.state.cr3.set(1 << 52);
    assert_eq!(check_vmcb(v), Err(VmcbCheckError::Cr3Reserved));

    // 48-bit CR3 is fine in long mode, not in legacy mode.
    v.state.cr3.set(1 << 40);
    assert_eq!(check_vmcb(v), Ok(()));
    v.state.cr0.set(Cr0Flags::PROTECTED_MODE_ENABLE.bits());
    assert_eq!(check_vmcb(v), Err(VmcbCheckError::Cr3Reserved));
}

#[test]
fn test_reserved_register_bits() {
    let page = valid_page();
    let v = vmcb(&page);

    v.state.cr4.set(L1_CR4 | 1 << 63);
    assert_eq!(check_vmcb(v), Err(VmcbCheckError::Cr4Reserved));
    v.state.cr4.set(L1_CR4);

    v.state.dr6.set(1 << 32);
    assert_eq!(check_vmcb(v), Err(VmcbCheckError::Dr6Reserved));
    v.state.dr6.set(0);

    v.state.dr7.set(1 << 40);
    assert_eq!(check_vmcb(v), Err(VmcbCheckError::Dr7Reserved));
}

#[test]
fn test_control_rules() {
    let page = valid_page();
    let v = vmcb(&page);

    v.control.guest_asid.set(0);
    assert_eq!(check_vmcb(v), Err(VmcbCheckError::ZeroAsid));

    v.control.intercept_vector4.set(0);
    assert_eq!(check_vmcb(v), Err(VmcbCheckError::VmrunNotIntercepted));
}

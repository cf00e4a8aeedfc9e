//! Consistency checks performed by `VMRUN` (AMD64 APM Vol.2, 15.5.1).
//!
//! Hardware refuses to enter a guest whose VMCB violates one of these rules
//! and reports `VMEXIT_INVALID`. Running them in software before an emulated
//! `VMRUN` catches both a bad VMCB from L1 and a bad merge of our own.

use bit_field::BitField;
use tock_registers::interfaces::Readable;
use x86_64::registers::control::{Cr0Flags, Cr4Flags};
use x86_64::registers::model_specific::EferFlags;

use super::vmcb::{InterceptVec4, VmcbStruct};

/// The first rule a VMCB was found to break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmcbCheckError {
    SvmeClear,
    CacheDisableNotWriteThrough,
    Cr0Reserved,
    Cr3Reserved,
    Cr4Reserved,
    Dr6Reserved,
    Dr7Reserved,
    EferReserved,
    LongModeWithoutPae,
    LongModeWithoutPe,
    VmrunNotIntercepted,
    ZeroAsid,
}

/// Run all checks against `vmcb`.
pub fn check_vmcb(vmcb: &VmcbStruct) -> Result<(), VmcbCheckError> {
    let state = &vmcb.state;
    let control = &vmcb.control;

    let efer = state.efer.get();
    let cr0 = state.cr0.get();
    let cr3 = state.cr3.get();
    let cr4 = state.cr4.get();

    let Some(efer_flags) = EferFlags::from_bits(efer) else {
        return Err(VmcbCheckError::EferReserved);
    };
    if !efer_flags.contains(EferFlags::SECURE_VIRTUAL_MACHINE_ENABLE) {
        return Err(VmcbCheckError::SvmeClear);
    }

    let cr0_flags = Cr0Flags::from_bits_truncate(cr0);
    if !cr0_flags.contains(Cr0Flags::CACHE_DISABLE)
        && cr0_flags.contains(Cr0Flags::NOT_WRITE_THROUGH)
    {
        return Err(VmcbCheckError::CacheDisableNotWriteThrough);
    }
    if cr0.get_bits(32..64) != 0 {
        return Err(VmcbCheckError::Cr0Reserved);
    }

    let Some(cr4_flags) = Cr4Flags::from_bits(cr4) else {
        return Err(VmcbCheckError::Cr4Reserved);
    };

    if state.dr6.get().get_bits(32..64) != 0 {
        return Err(VmcbCheckError::Dr6Reserved);
    }
    if state.dr7.get().get_bits(32..64) != 0 {
        return Err(VmcbCheckError::Dr7Reserved);
    }

    let long_mode = efer_flags.contains(EferFlags::LONG_MODE_ENABLE)
        && cr0_flags.contains(Cr0Flags::PAGING);
    if long_mode {
        if !cr4_flags.contains(Cr4Flags::PHYSICAL_ADDRESS_EXTENSION) {
            return Err(VmcbCheckError::LongModeWithoutPae);
        }
        if !cr0_flags.contains(Cr0Flags::PROTECTED_MODE_ENABLE) {
            return Err(VmcbCheckError::LongModeWithoutPe);
        }
        if cr3.get_bits(52..64) != 0 {
            return Err(VmcbCheckError::Cr3Reserved);
        }
    } else if cr3.get_bits(32..64) != 0 {
        return Err(VmcbCheckError::Cr3Reserved);
    }

    if !control.intercept_vector4.is_set(InterceptVec4::VMRUN) {
        return Err(VmcbCheckError::VmrunNotIntercepted);
    }
    if control.guest_asid.get() == 0 {
        return Err(VmcbCheckError::ZeroAsid);
    }

    Ok(())
}

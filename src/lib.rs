#![no_std]
#![doc = include_str!("../README.md")]

#[macro_use]
extern crate log;

extern crate alloc;

mod regs;
mod error;
mod frame;
mod hal;
mod svm;

#[cfg(test)]
mod tests;

memory_addr::def_usize_addr! {
    /// Guest physical address.
    pub type GuestPhysAddr;
}

memory_addr::def_usize_addr_formatter! {
    GuestPhysAddr = "GPA:{}";
}

/// Host physical address.
pub type HostPhysAddr = memory_addr::PhysAddr;
/// Host virtual address.
pub type HostVirtAddr = memory_addr::VirtAddr;

pub use error::{NestedSvmError, Result};
pub use hal::NestedSvmHal;
pub use regs::{GeneralRegisters, GuestUserRegs, GuestUserRegsDiff};

pub use svm::vmcb;
pub use svm::{
    ActiveVmcb, CopyFault, ExitRoute, IOPm, InterruptBlock, InterruptOutcome, InterruptSource,
    L1WalkResult, MSRPm, MappedGuestPage, NestedSvmCaps, NestedSvmVcpu, NestedVcpuOps, PagingMode,
    PendingVmexit, ShadowIoMap, ShadowIoMaps, SvmExitCode, SvmExitInfo, SvmInstruction,
    SyntheticFault, VmcbCheckError, VmcbStruct, VmrunOutcome, check_vmcb, event_needs_reinjection,
    exception_exit, has_hardware_support,
};

use core::fmt;

use x86_64::structures::idt::PageFaultErrorCode;

use crate::frame::PAGE_SIZE;
use crate::svm::check::{VmcbCheckError, check_vmcb};
use crate::svm::definitions::SvmInstruction;
use crate::svm::vmcb::VmcbStruct;
use crate::{GuestPhysAddr, HostPhysAddr, HostVirtAddr};

/// A guest page mapped into the host address space.
///
/// Handed out by [`NestedVcpuOps::map_guest_page`] and given back through
/// [`NestedVcpuOps::unmap_guest_page`].
#[derive(Debug)]
pub struct MappedGuestPage {
    gpa: GuestPhysAddr,
    hva: HostVirtAddr,
    writable: bool,
}

impl MappedGuestPage {
    /// # Safety
    ///
    /// `hva` must point to 4 KiB of host memory, aligned to 4 KiB, that stays
    /// mapped (writable if `writable` is set) until the page is unmapped.
    pub unsafe fn new(gpa: GuestPhysAddr, hva: HostVirtAddr, writable: bool) -> Self {
        Self { gpa, hva, writable }
    }

    /// Guest physical address of the start of the page.
    pub fn gpa(&self) -> GuestPhysAddr {
        self.gpa
    }

    pub fn hva(&self) -> HostVirtAddr {
        self.hva
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: guaranteed by the contract of `new`.
        unsafe { core::slice::from_raw_parts(self.hva.as_ptr(), PAGE_SIZE) }
    }

    /// The page viewed as a VMCB.
    pub fn as_vmcb(&self) -> &VmcbStruct {
        // SAFETY: page-sized and page-aligned per the contract of `new`;
        // `VmcbStruct` is made of interior-mutable cells only.
        unsafe { &*(self.hva.as_ptr() as *const VmcbStruct) }
    }
}

/// A guest memory access that could not be completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyFault {
    pub gpa: GuestPhysAddr,
}

impl fmt::Display for CopyFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "guest memory access failed at {:?}", self.gpa)
    }
}

/// A register setter rejected its value; the guest gets a `#GP(0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticFault;

/// Per-vcpu services of the surrounding hypervisor.
///
/// Everything the nested core does not own itself goes through this trait:
/// guest memory, the paging code, the control-register setters and the
/// instruction decoder. Register setters take the VMCB that is active when
/// they are called and are expected to update its state-save area.
pub trait NestedVcpuOps {
    /// Map the guest page containing `gpa`. `None` if there is no such page,
    /// or it is not RAM.
    fn map_guest_page(&mut self, gpa: GuestPhysAddr, writable: bool) -> Option<MappedGuestPage>;
    fn unmap_guest_page(&mut self, page: MappedGuestPage);
    /// Copy `dst.len()` bytes of guest memory starting at `gpa`.
    fn copy_from_guest_phys(&mut self, dst: &mut [u8], gpa: GuestPhysAddr)
    -> Result<(), CopyFault>;

    /// The logical `EFER` of the vcpu, as last set through [`Self::set_efer`].
    fn guest_efer(&self) -> u64;
    fn guest_cr0(&self) -> u64;
    fn guest_cr2(&self) -> u64;
    fn guest_cr4(&self) -> u64;

    fn set_efer(&mut self, vmcb: &VmcbStruct, value: u64) -> Result<(), SyntheticFault>;
    fn set_cr0(&mut self, vmcb: &VmcbStruct, value: u64) -> Result<(), SyntheticFault>;
    fn set_cr3(&mut self, vmcb: &VmcbStruct, value: u64) -> Result<(), SyntheticFault>;
    fn set_cr4(&mut self, vmcb: &VmcbStruct, value: u64) -> Result<(), SyntheticFault>;
    fn set_cr2(&mut self, vmcb: &VmcbStruct, value: u64);

    /// Whether the host runs this guest on nested paging.
    fn host_hap_enabled(&self) -> bool;
    /// Root of the host's nested page table shadowing L1's table rooted at
    /// `l1_nested_cr3`.
    fn nested_p2m_root(&mut self, l1_nested_cr3: u64) -> HostPhysAddr;
    /// Whether the nested page table handed out last is still in place.
    fn nested_p2m_present(&self) -> bool;
    /// Walk the guest-owned nested page table at `root`. Returns the frame
    /// number `l2_gpa` maps to and the order of the mapping.
    fn walk_nested_page_table(
        &mut self,
        root: u64,
        l2_gpa: GuestPhysAddr,
        error_code: PageFaultErrorCode,
    ) -> Option<(u64, u32)>;
    /// ASID the shadow VMCB runs L2 under.
    fn nested_guest_asid(&mut self) -> u32;
    /// Drop TLB entries tagged with the nested ASID.
    fn flush_nested_asid(&mut self);
    /// Recompute the paging mode of the vcpu after L1 runs on shadow paging.
    fn update_paging_modes(&mut self);

    /// Length of the intercepted instruction, 0 if it could not be decoded.
    fn instruction_length(&mut self, insn: SvmInstruction) -> u8;

    /// Structural checks `VMRUN` would perform.
    fn validate_block(&self, vmcb: &VmcbStruct) -> Result<(), VmcbCheckError> {
        check_vmcb(vmcb)
    }

    /// Whether an emulated I/O access of the vcpu is still in flight.
    fn io_request_pending(&self) -> bool;
    /// Mask or unmask event-channel delivery to the vcpu.
    fn local_event_delivery(&mut self, enable: bool);
}

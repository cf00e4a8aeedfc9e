use crate::{HostPhysAddr, HostVirtAddr};

/// Host memory services needed to back VMCBs and permission maps.
///
/// Every structure the hardware reads by physical address is allocated
/// through this trait.
pub trait NestedSvmHal {
    /// Allocate one 4 KiB frame.
    fn alloc_frame() -> Option<HostPhysAddr>;
    /// Deallocate a frame returned by [`NestedSvmHal::alloc_frame`].
    fn dealloc_frame(paddr: HostPhysAddr);
    /// Allocate `count` physically contiguous, 4 KiB aligned frames.
    fn alloc_contiguous_frames(count: usize) -> Option<HostPhysAddr>;
    /// Deallocate frames returned by [`NestedSvmHal::alloc_contiguous_frames`].
    fn dealloc_contiguous_frames(paddr: HostPhysAddr, count: usize);
    /// Convert a host physical address to a host virtual address.
    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr;
}

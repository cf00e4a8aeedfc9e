use memory_addr::MemoryAddr;

use super::{NestedSvmVcpu, NestedVcpuOps};
use crate::{GuestPhysAddr, NestedSvmHal};

impl<H: NestedSvmHal, O: NestedVcpuOps> NestedSvmVcpu<H, O> {
    /// Map the virtual VMCB at `vmcb_addr`, replacing any block mapped at a
    /// different address. Returns `false` (and leaves nothing mapped) if the
    /// page cannot be mapped writable.
    pub(super) fn vmcb_map(&mut self, vmcb_addr: GuestPhysAddr) -> bool {
        let vmcb_addr = vmcb_addr.align_down_4k();

        if let Some(page) = self.vvmcb.take_if(|page| page.gpa() != vmcb_addr) {
            trace!("[NSVM] unmapping virtual VMCB at {:?}", page.gpa());
            self.ops.unmap_guest_page(page);
        }

        if self.vvmcb.is_none() {
            let Some(page) = self.ops.map_guest_page(vmcb_addr, true) else {
                warn!("[NSVM] virtual VMCB at {:?} is not mappable", vmcb_addr);
                return false;
            };
            if !page.is_writable() {
                warn!("[NSVM] virtual VMCB at {:?} is read-only", vmcb_addr);
                self.ops.unmap_guest_page(page);
                return false;
            }
            self.vvmcb = Some(page);
            self.vvmcb_generation = self.vvmcb_generation.wrapping_add(1);
        }

        true
    }

    /// Re-establish the mapping of the current virtual VMCB.
    pub(super) fn vmcb_remap(&mut self) -> bool {
        match self.vvmcb_addr() {
            Some(addr) => self.vmcb_map(addr),
            None => false,
        }
    }
}

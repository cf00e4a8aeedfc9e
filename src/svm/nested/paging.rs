use tock_registers::interfaces::{Readable, Writeable};
use x86_64::structures::idt::PageFaultErrorCode;

use super::{NestedSvmVcpu, NestedVcpuOps};
use crate::frame::PAGE_SIZE;
use crate::{GuestPhysAddr, NestedSvmHal};

/// How L2 memory is translated, derived from whether the host and L1 each
/// use nested paging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    /// Host nested paging, L1 nested paging: the shadow VMCB runs on a host
    /// table that shadows L1's nested table.
    FullNested,
    /// Host nested paging, L1 shadow paging: the shadow VMCB keeps the host's
    /// own nested table and L1 is expected to intercept `#PF`.
    HostNestedOnly,
    /// Host shadow paging. Shadowing L1's shadow tables is not supported; the
    /// nested root is left zero.
    FullShadow,
}

impl PagingMode {
    pub const fn select(host_hap: bool, guest_hap: bool) -> Self {
        match (host_hap, guest_hap) {
            (true, true) => Self::FullNested,
            (true, false) => Self::HostNestedOnly,
            (false, _) => Self::FullShadow,
        }
    }
}

/// Result of translating an L2 address through L1's nested page table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L1WalkResult {
    Done {
        l1_gpa: GuestPhysAddr,
        page_order: u32,
    },
    /// L1's table has no valid translation; L1 has to see a nested page
    /// fault.
    Inject,
}

impl<H: NestedSvmHal, O: NestedVcpuOps> NestedSvmVcpu<H, O> {
    pub fn paging_mode(&self) -> PagingMode {
        PagingMode::select(self.ops.host_hap_enabled(), self.hap_enabled)
    }

    /// Point the shadow VMCB at the host table shadowing L1's nested table.
    pub(super) fn set_nested_p2m(&mut self) {
        let Some(vvmcb) = self.vvmcb.as_ref().map(|page| page.as_vmcb()) else {
            return;
        };
        self.host_cr3 = vvmcb.control.nested_cr3.get();
        let root = self.ops.nested_p2m_root(self.host_cr3);
        self.n2
            .as_vmcb()
            .control
            .nested_cr3
            .set(root.as_usize() as u64);
    }

    /// Translate `l2_gpa` through the nested page table L1 set up for L2.
    pub fn hap_walk_l1_p2m(&mut self, l2_gpa: GuestPhysAddr, write: bool, fetch: bool) -> L1WalkResult {
        let mut error_code = PageFaultErrorCode::USER_MODE | PageFaultErrorCode::PROTECTION_VIOLATION;
        if write {
            error_code |= PageFaultErrorCode::CAUSED_BY_WRITE;
        }
        if fetch {
            error_code |= PageFaultErrorCode::INSTRUCTION_FETCH;
        }

        match self
            .ops
            .walk_nested_page_table(self.host_cr3, l2_gpa, error_code)
        {
            Some((gfn, page_order)) => {
                let offset = l2_gpa.as_usize() & (PAGE_SIZE - 1);
                match usize::try_from(gfn)
                    .ok()
                    .and_then(|gfn| gfn.checked_mul(PAGE_SIZE))
                {
                    Some(base) => L1WalkResult::Done {
                        l1_gpa: GuestPhysAddr::from(base + offset),
                        page_order,
                    },
                    None => {
                        warn!("[NSVM] L1 nested walk returned bad gfn {:#x}", gfn);
                        L1WalkResult::Inject
                    }
                }
            }
            None => {
                trace!("[NSVM] L1 nested walk of {:?} failed", l2_gpa);
                L1WalkResult::Inject
            }
        }
    }

    /// L1's nested page table root recorded at the last `VMRUN`.
    pub fn host_cr3(&self) -> u64 {
        self.host_cr3
    }

    /// Whether L1 enabled nested paging for L2 at the last `VMRUN`.
    pub fn hap_enabled(&self) -> bool {
        self.hap_enabled
    }
}

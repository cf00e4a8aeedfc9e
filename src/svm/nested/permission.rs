//! Permission maps used while L2 runs.

use alloc::sync::Arc;

use axerrno::AxResult;
use tock_registers::interfaces::{Readable, Writeable};

use super::{NestedSvmVcpu, NestedVcpuOps};
use crate::error::{NestedSvmError, Result};
use crate::svm::structs::{IOPm, io_bitmap_test};
use crate::{GuestPhysAddr, HostPhysAddr, NestedSvmHal};

/// The two ports probed in L1's I/O bitmap.
const PORT_80: u32 = 0x80;
const PORT_ED: u32 = 0xed;

/// Which of the shadow I/O maps applies, keyed by L1's intercept bits for
/// the two probed ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowIoMap {
    pub port_80: bool,
    pub port_ed: bool,
}

impl ShadowIoMap {
    const fn index(self) -> usize {
        ((self.port_80 as usize) << 1) | self.port_ed as usize
    }

    const fn from_index(index: usize) -> Self {
        Self {
            port_80: index & 0b10 != 0,
            port_ed: index & 0b01 != 0,
        }
    }
}

/// Pre-built I/O permission maps for L2, shared by every vcpu of the host.
///
/// All four intercept every port except the probed ports L1 lets through.
pub struct ShadowIoMaps<H: NestedSvmHal> {
    maps: [IOPm<H>; 4],
}

impl<H: NestedSvmHal> ShadowIoMaps<H> {
    pub fn new() -> AxResult<Arc<Self>> {
        let maps = [
            Self::build(ShadowIoMap::from_index(0))?,
            Self::build(ShadowIoMap::from_index(1))?,
            Self::build(ShadowIoMap::from_index(2))?,
            Self::build(ShadowIoMap::from_index(3))?,
        ];
        Ok(Arc::new(Self { maps }))
    }

    fn build(selection: ShadowIoMap) -> AxResult<IOPm<H>> {
        let mut map = IOPm::intercept_all()?;
        if !selection.port_80 {
            map.set_intercept(PORT_80, false);
        }
        if !selection.port_ed {
            map.set_intercept(PORT_ED, false);
        }
        Ok(map)
    }

    pub fn phys_addr(&self, selection: ShadowIoMap) -> HostPhysAddr {
        self.maps[selection.index()].phys_addr()
    }

    pub fn is_intercepted(&self, selection: ShadowIoMap, port: u32) -> bool {
        self.maps[selection.index()].is_intercepted(port)
    }
}

impl<H: NestedSvmHal, O: NestedVcpuOps> NestedSvmVcpu<H, O> {
    /// Build the MSR and I/O permission maps for L2 and install them into the
    /// shadow VMCB.
    pub(super) fn build_permission_maps(&mut self) -> Result {
        let vvmcb = self
            .vvmcb
            .as_ref()
            .ok_or(NestedSvmError::MapFailure)?
            .as_vmcb();
        let msrpm_gpa = GuestPhysAddr::from(vvmcb.control.msrpm_base_pa.get() as usize);
        let iopm_gpa = GuestPhysAddr::from(vvmcb.control.iopm_base_pa.get() as usize);

        if let Err(fault) = self
            .ops
            .copy_from_guest_phys(self.cached_msrpm.as_bytes_mut(), msrpm_gpa)
        {
            error!("[NSVM] failed to copy L1 MSRPM: {}", fault);
            return Err(NestedSvmError::CopyFault);
        }

        self.oiomap_gpa = self.iomap_gpa;
        self.iomap_gpa = Some(iopm_gpa);

        let selection = match self.ops.map_guest_page(iopm_gpa, false) {
            Some(page) => {
                let bitmap = page.as_bytes();
                let selection = ShadowIoMap {
                    port_80: io_bitmap_test(bitmap, PORT_80),
                    port_ed: io_bitmap_test(bitmap, PORT_ED),
                };
                self.ops.unmap_guest_page(page);
                selection
            }
            None => ShadowIoMap {
                port_80: true,
                port_ed: true,
            },
        };
        debug!("[NSVM] L1 IOPM {:?} selects {:?}", iopm_gpa, selection);
        self.io_map = Some(selection);

        self.merged_msrpm.merge_from(&self.host_msrpm, &self.cached_msrpm);

        let n2 = self.n2.as_vmcb();
        n2.control
            .iopm_base_pa
            .set(self.io_maps.phys_addr(selection).as_usize() as u64);
        n2.control
            .msrpm_base_pa
            .set(self.merged_msrpm.phys_addr().as_usize() as u64);

        Ok(())
    }
}

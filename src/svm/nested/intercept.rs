//! Who handles an exit taken while L2 runs: the host or L1.

use bit_field::BitField;
use tock_registers::interfaces::Readable;

use super::{NestedSvmVcpu, NestedVcpuOps, PagingMode};
use crate::frame::PAGE_SIZE;
use crate::svm::definitions::{
    CR_ACCESS_EXITS, DR_ACCESS_EXITS, EXCEPTION_EXITS, GENERAL1_EXITS, GENERAL2_EXITS,
    SvmExitCode, VMEXIT_EXCP_NM, VMEXIT_EXCP_PF, exception_exit,
};
use crate::svm::structs::{IOPM_PORTS_PER_PAGE, io_bitmap_test};
use crate::{GuestPhysAddr, NestedSvmHal};

/// Where an exit taken while L2 runs has to go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitRoute {
    /// The host handles the exit and resumes L2.
    Host,
    /// L1 asked for the exit; emulate a `#VMEXIT` to L1.
    Forward,
    /// The exit contradicts the nested paging setup.
    Fatal,
}

impl ExitRoute {
    fn from_intercepted(intercepted: bool) -> Self {
        if intercepted { Self::Forward } else { Self::Host }
    }
}

/// Decoded `EXITINFO1` of an `IOIO` exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IoioInfo {
    port: u32,
    size: u32,
}

impl IoioInfo {
    fn decode(exitinfo1: u64) -> Self {
        let size = if exitinfo1.get_bit(6) {
            4
        } else if exitinfo1.get_bit(5) {
            2
        } else {
            1
        };
        Self {
            port: exitinfo1.get_bits(16..32) as u32,
            size,
        }
    }
}

impl<H: NestedSvmHal, O: NestedVcpuOps> NestedSvmVcpu<H, O> {
    /// Whether L1's intercept configuration asks for `exitcode`.
    fn guest_intercepts_exitcode(&mut self, exitcode: u64) -> bool {
        let cached = self.cached_intercepts;

        let intercepted = match exitcode {
            code if CR_ACCESS_EXITS.contains(&code) => cached.cr.get_bit(code as usize),
            code if DR_ACCESS_EXITS.contains(&code) => {
                cached.dr.get_bit((code - DR_ACCESS_EXITS.start()) as usize)
            }
            code if EXCEPTION_EXITS.contains(&code) => cached
                .exceptions
                .get_bit((code - EXCEPTION_EXITS.start()) as usize),
            code if GENERAL1_EXITS.contains(&code) => cached
                .general1
                .get_bit((code - GENERAL1_EXITS.start()) as usize),
            code if GENERAL2_EXITS.contains(&code) => cached
                .general2
                .get_bit((code - GENERAL2_EXITS.start()) as usize),
            code if code == SvmExitCode::NPF.raw() => {
                self.paging_mode() == PagingMode::FullNested
            }
            code if code == SvmExitCode::INVALID.raw() => true,
            code => {
                warn!("[NSVM] unknown exit code {:#x}", code);
                false
            }
        };
        if !intercepted {
            return false;
        }

        match exitcode {
            code if code == SvmExitCode::MSR.raw() => self.guest_intercepts_msr(),
            code if code == SvmExitCode::IOIO.raw() => self.guest_intercepts_ioio(),
            _ => true,
        }
    }

    /// Look the accessed MSR up in L1's MSR permission map.
    fn guest_intercepts_msr(&mut self) -> bool {
        if !self.vmcb_remap() {
            return true;
        }
        let msr = self.regs.gpr.ecx();
        let is_write = self.n2.as_vmcb().control.exit_info_1.get() != 0;
        // MSRs outside the map are L1's business.
        self.cached_msrpm
            .is_intercepted(msr, is_write)
            .unwrap_or(true)
    }

    /// Walk L1's I/O bitmap over every port the access touches.
    fn guest_intercepts_ioio(&mut self) -> bool {
        if !self.vmcb_remap() {
            return true;
        }
        let Some(vvmcb) = self.virtual_vmcb() else {
            return true;
        };
        let iopm_base = vvmcb.control.iopm_base_pa.get() as usize & !(PAGE_SIZE - 1);
        let info = IoioInfo::decode(self.n2.as_vmcb().control.exit_info_1.get());

        let mut page_index = (info.port / IOPM_PORTS_PER_PAGE) as usize;
        let mut bit = info.port % IOPM_PORTS_PER_PAGE;
        let mut remaining = info.size;

        let page_gpa = |index: usize| GuestPhysAddr::from(iopm_base + index * PAGE_SIZE);
        let mut page = self.ops.map_guest_page(page_gpa(page_index), false);

        let intercepted = loop {
            let Some(bitmap) = page.as_ref().map(|page| page.as_bytes()) else {
                warn!("[NSVM] L1 IOPM page {} not mappable", page_index);
                break true;
            };
            if !io_bitmap_test(bitmap, bit) {
                break false;
            }
            remaining -= 1;
            if remaining == 0 {
                break true;
            }
            bit += 1;
            if bit == IOPM_PORTS_PER_PAGE {
                if let Some(done) = page.take() {
                    self.ops.unmap_guest_page(done);
                }
                page_index += 1;
                bit = 0;
                page = self.ops.map_guest_page(page_gpa(page_index), false);
            }
        };
        if let Some(page) = page {
            self.ops.unmap_guest_page(page);
        }

        trace!(
            "[NSVM] IOIO port {:#x} size {}: intercepted by L1: {}",
            info.port, info.size, intercepted
        );
        intercepted
    }

    /// Route `exitcode` by L1's intercept configuration alone.
    pub fn wants_intercept(&mut self, exitcode: u64) -> ExitRoute {
        ExitRoute::from_intercepted(self.guest_intercepts_exitcode(exitcode))
    }

    /// Route an exit taken while L2 runs.
    ///
    /// Physical interrupts, NMIs and `#NM` always go to the host first,
    /// `VMMCALL` always goes to L1.
    pub fn classify(&mut self, exitcode: u64) -> ExitRoute {
        let intercepted = self.guest_intercepts_exitcode(exitcode);
        let mode = self.paging_mode();

        let route = match exitcode {
            code if code == SvmExitCode::INTR.raw() || code == SvmExitCode::NMI.raw() => {
                ExitRoute::Host
            }
            // Lazy FPU switch first, then L1 may see it on the next exit.
            VMEXIT_EXCP_NM => ExitRoute::Host,
            code if code == SvmExitCode::NPF.raw() => match (mode, intercepted) {
                (PagingMode::FullNested, true) | (PagingMode::HostNestedOnly, false) => {
                    ExitRoute::Host
                }
                _ => ExitRoute::Fatal,
            },
            VMEXIT_EXCP_PF => match mode {
                PagingMode::FullNested => ExitRoute::from_intercepted(intercepted),
                PagingMode::HostNestedOnly => ExitRoute::Forward,
                PagingMode::FullShadow => ExitRoute::Host,
            },
            code if code == SvmExitCode::VMMCALL.raw() => ExitRoute::Forward,
            _ => ExitRoute::from_intercepted(intercepted),
        };

        if route == ExitRoute::Fatal {
            error!(
                "[NSVM] exit {:#x} contradicts paging mode {:?} (intercepted: {})",
                exitcode, mode, intercepted
            );
        } else {
            trace!("[NSVM] exit {:#x} -> {:?}", exitcode, route);
        }
        route
    }

    /// Whether L1 intercepts exception `vector`.
    pub fn intercepts_event(&mut self, vector: u8) -> bool {
        self.guest_intercepts_exitcode(exception_exit(vector))
    }

    /// Turn an exception raised for L2 into a deferred exception exit to L1.
    pub fn vmexit_event(&mut self, vector: u8, error_code: Option<u32>, cr2: u64) {
        debug_assert!(self.vvmcb.is_some());
        self.vmexit_defer(
            exception_exit(vector),
            error_code.unwrap_or_default() as u64,
            cr2,
        );
    }
}

#[cfg(test)]
mod test {
    use super::IoioInfo;

    #[test]
    fn ioio_decode() {
        // OUT dx, al to 0x80
        let info = IoioInfo::decode((0x80 << 16) | (1 << 4));
        assert_eq!(info, IoioInfo { port: 0x80, size: 1 });

        // IN eax, dx from 0xcfc
        let info = IoioInfo::decode((0xcfc << 16) | (1 << 6) | 1);
        assert_eq!(info, IoioInfo { port: 0xcfc, size: 4 });

        let info = IoioInfo::decode((0x1f0 << 16) | (1 << 5));
        assert_eq!(info.size, 2);
    }
}

//! Nested SVM: running L1's own guest (L2) on a single level of hardware
//! virtualization.
//!
//! Three VMCBs are involved per vcpu:
//! - the *virtual* VMCB, which L1 programs in its own memory and passes to
//!   `VMRUN`. It is mapped, not copied, so writes to it are visible to L1;
//! - the *L1* VMCB, which runs L1 and holds L1's state while L2 runs;
//! - the *shadow* VMCB, merged from the other two, which runs L2.

mod intercept;
mod interrupt;
mod mapper;
mod ops;
mod paging;
mod permission;
mod vmentry;
mod vmexit;

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use axerrno::AxResult;
use tock_registers::interfaces::{Readable, Writeable};

use super::NestedSvmCaps;
use super::structs::{MSRPm, VmcbFrame};
use super::vmcb::{VmcbControlArea, VmcbStruct};
use crate::{GuestPhysAddr, GuestUserRegs, HostPhysAddr, NestedSvmHal};

pub use self::intercept::ExitRoute;
pub use self::interrupt::{InterruptBlock, InterruptOutcome, InterruptSource};
pub use self::ops::{CopyFault, MappedGuestPage, NestedVcpuOps, SyntheticFault};
pub use self::paging::{L1WalkResult, PagingMode};
pub use self::permission::{ShadowIoMap, ShadowIoMaps};
pub use self::vmentry::VmrunOutcome;

/// Which VMCB the hardware runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveVmcb {
    /// The L1 VMCB; the vcpu is not running L2.
    NonNested,
    /// The shadow VMCB, running L2.
    Shadow,
}

/// Identifies the virtual VMCB a shadow VMCB was last derived from, so the
/// clean bits L1 sets on it can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CachedDerivation {
    source: GuestPhysAddr,
    generation: u64,
}

/// L1's intercept words as of the last derivation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CachedIntercepts {
    pub cr: u32,
    pub dr: u32,
    pub exceptions: u32,
    pub general1: u32,
    pub general2: u32,
}

impl CachedIntercepts {
    fn read_from(control: &VmcbControlArea) -> Self {
        Self {
            cr: control.intercept_cr.get(),
            dr: control.intercept_dr.get(),
            exceptions: control.intercept_exceptions.get(),
            general1: control.intercept_vector3.get(),
            general2: control.intercept_vector4.get(),
        }
    }
}

/// L1 interrupt state captured at `VMRUN`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct HostFlags {
    rflags_if: bool,
    vintr_mask: bool,
}

/// An emulated `#VMEXIT` waiting for the next switch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PendingVmexit {
    pub exitcode: u64,
    pub exitinfo1: u64,
    pub exitinfo2: u64,
}

/// Nested SVM state of one vcpu.
pub struct NestedSvmVcpu<H: NestedSvmHal, O: NestedVcpuOps> {
    ops: O,
    caps: NestedSvmCaps,
    io_maps: Arc<ShadowIoMaps<H>>,
    regs: GuestUserRegs,

    n1: VmcbFrame<H>,
    n2: VmcbFrame<H>,
    active: ActiveVmcb,
    vvmcb: Option<MappedGuestPage>,
    /// Bumped every time a virtual VMCB is mapped.
    vvmcb_generation: u64,
    cached_derivation: Option<CachedDerivation>,
    /// The shadow VMCB was fully derived by the last `VMRUN`.
    shadow_derived: bool,
    hsave_pa: Option<GuestPhysAddr>,

    /// Software GIF, used while hardware GIF virtualization is off.
    gif: bool,
    cached_intercepts: CachedIntercepts,
    asid: u32,
    flush_p2m: bool,
    hap_enabled: bool,
    guest_cr3: u64,
    host_cr3: u64,
    /// Logical CR0 of L1 while L2 runs. `None` until L2's CR0 was derived
    /// from it, so the exit path only undoes a lazy FPU sync that happened.
    l1_cr0: Option<u64>,
    host_flags: HostFlags,
    pending_exit: PendingVmexit,

    host_msrpm: MSRPm<H>,
    cached_msrpm: MSRPm<H>,
    merged_msrpm: MSRPm<H>,
    io_map: Option<ShadowIoMap>,
    iomap_gpa: Option<GuestPhysAddr>,
    oiomap_gpa: Option<GuestPhysAddr>,

    in_guestmode: bool,
    vmswitch_in_progress: bool,
    vmentry_pending: bool,
    vmexit_pending: bool,

    pending_events: VecDeque<(u8, Option<u32>)>,
}

impl<H: NestedSvmHal, O: NestedVcpuOps> NestedSvmVcpu<H, O> {
    /// Create the nested state of a vcpu.
    pub fn new(ops: O, caps: NestedSvmCaps, io_maps: Arc<ShadowIoMaps<H>>) -> AxResult<Self> {
        let vcpu = Self {
            ops,
            caps,
            io_maps,
            regs: GuestUserRegs::default(),
            n1: VmcbFrame::new()?,
            n2: VmcbFrame::new()?,
            active: ActiveVmcb::NonNested,
            vvmcb: None,
            vvmcb_generation: 0,
            cached_derivation: None,
            shadow_derived: false,
            hsave_pa: None,
            gif: true,
            cached_intercepts: CachedIntercepts::default(),
            asid: 0,
            flush_p2m: false,
            hap_enabled: false,
            guest_cr3: 0,
            host_cr3: 0,
            l1_cr0: None,
            host_flags: HostFlags::default(),
            pending_exit: PendingVmexit::default(),
            host_msrpm: MSRPm::passthrough_all()?,
            cached_msrpm: MSRPm::passthrough_all()?,
            merged_msrpm: MSRPm::passthrough_all()?,
            io_map: None,
            iomap_gpa: None,
            oiomap_gpa: None,
            in_guestmode: false,
            vmswitch_in_progress: false,
            vmentry_pending: false,
            vmexit_pending: false,
            pending_events: VecDeque::with_capacity(8),
        };
        vcpu.n1
            .as_vmcb()
            .control
            .msrpm_base_pa
            .set(vcpu.host_msrpm.phys_addr().as_usize() as u64);
        info!(
            "[NSVM] created nested state (l1 vmcb: {:#x}, shadow vmcb: {:#x})",
            vcpu.n1.phys_addr(),
            vcpu.n2.phys_addr()
        );
        Ok(vcpu)
    }

    /// Reset the nested state along with the vcpu.
    pub fn reset(&mut self) {
        self.hsave_pa = None;
        self.cached_derivation = None;
        self.shadow_derived = false;
        self.l1_cr0 = None;
        self.cached_intercepts = CachedIntercepts::default();
        self.hap_enabled = false;
        self.guest_cr3 = 0;
        self.host_cr3 = 0;
        self.asid = 0;
        self.host_flags = HostFlags::default();
        self.pending_exit.exitinfo1 = 0;
        self.pending_exit.exitinfo2 = 0;
        self.io_map = None;
        self.stgi();
        debug!("[NSVM] nested state reset");
    }

    pub fn ops(&self) -> &O {
        &self.ops
    }

    pub fn ops_mut(&mut self) -> &mut O {
        &mut self.ops
    }

    pub fn caps(&self) -> &NestedSvmCaps {
        &self.caps
    }

    /// The register frame of whichever guest runs on this vcpu.
    pub fn regs(&self) -> &GuestUserRegs {
        &self.regs
    }

    pub fn regs_mut(&mut self) -> &mut GuestUserRegs {
        &mut self.regs
    }

    pub fn active(&self) -> ActiveVmcb {
        self.active
    }

    /// The VMCB the hardware has to run next.
    pub fn active_vmcb(&self) -> &VmcbStruct {
        match self.active {
            ActiveVmcb::NonNested => self.n1.as_vmcb(),
            ActiveVmcb::Shadow => self.n2.as_vmcb(),
        }
    }

    pub fn active_vmcb_paddr(&self) -> HostPhysAddr {
        match self.active {
            ActiveVmcb::NonNested => self.n1.phys_addr(),
            ActiveVmcb::Shadow => self.n2.phys_addr(),
        }
    }

    pub fn l1_vmcb(&self) -> &VmcbStruct {
        self.n1.as_vmcb()
    }

    pub fn shadow_vmcb(&self) -> &VmcbStruct {
        self.n2.as_vmcb()
    }

    /// The VMCB L1 passed to its last `VMRUN`, if mapped.
    pub fn virtual_vmcb(&self) -> Option<&VmcbStruct> {
        self.vvmcb.as_ref().map(|page| page.as_vmcb())
    }

    pub fn vvmcb_addr(&self) -> Option<GuestPhysAddr> {
        self.vvmcb.as_ref().map(|page| page.gpa())
    }

    /// The host's MSR intercepts for L1, merged into L2's map on `VMRUN`.
    pub fn host_msrpm_mut(&mut self) -> &mut MSRPm<H> {
        &mut self.host_msrpm
    }

    /// The shadow I/O map chosen at the last `VMRUN`.
    pub fn io_map(&self) -> Option<ShadowIoMap> {
        self.io_map
    }

    /// L1's I/O bitmap address at the last and the previous `VMRUN`.
    pub fn iomap_gpas(&self) -> (Option<GuestPhysAddr>, Option<GuestPhysAddr>) {
        (self.iomap_gpa, self.oiomap_gpa)
    }

    pub fn set_hsave_pa(&mut self, pa: GuestPhysAddr) {
        self.hsave_pa = Some(pa);
    }

    pub fn hsave_pa(&self) -> Option<GuestPhysAddr> {
        self.hsave_pa
    }

    pub fn in_guestmode(&self) -> bool {
        self.in_guestmode
    }

    pub fn vmswitch_in_progress(&self) -> bool {
        self.vmswitch_in_progress
    }

    pub fn vmentry_pending(&self) -> bool {
        self.vmentry_pending
    }

    pub fn vmexit_pending(&self) -> bool {
        self.vmexit_pending
    }

    pub fn pending_exit(&self) -> PendingVmexit {
        self.pending_exit
    }

    /// ASID of the virtual VMCB at the last `VMRUN`.
    pub fn asid(&self) -> u32 {
        self.asid
    }

    /// Whether the last `VMRUN` requires L2's TLB entries to be flushed.
    pub fn flush_p2m(&self) -> bool {
        self.flush_p2m
    }

    /// L2's `CR3` as L1 passed it to the last `VMRUN`.
    pub fn guest_cr3(&self) -> u64 {
        self.guest_cr3
    }

    /// Queue an exception for the guest that currently runs on this vcpu.
    pub fn queue_event(&mut self, vector: u8, err_code: Option<u32>) {
        self.pending_events.push_back((vector, err_code));
    }

    /// Take the oldest queued exception.
    pub fn pop_pending_event(&mut self) -> Option<(u8, Option<u32>)> {
        self.pending_events.pop_front()
    }
}

impl<H: NestedSvmHal, O: NestedVcpuOps> Drop for NestedSvmVcpu<H, O> {
    fn drop(&mut self) {
        self.active = ActiveVmcb::NonNested;
        if let Some(page) = self.vvmcb.take() {
            self.ops.unmap_guest_page(page);
        }
        info!("[NSVM] destroyed nested state");
    }
}

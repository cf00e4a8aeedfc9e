//! Emulated `VMRUN`: save L1, derive the shadow VMCB, switch to L2.

use alloc::collections::VecDeque;

use tock_registers::LocalRegisterCopy;
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use x86::irq;
use x86_64::registers::control::Cr0Flags;
use x86_64::registers::rflags::RFlags;

use super::{ActiveVmcb, CachedIntercepts, NestedSvmVcpu, NestedVcpuOps, PagingMode, SyntheticFault};
use crate::error::{NestedSvmError, Result};
use crate::svm::definitions::{SvmExitCode, SvmInstruction};
use crate::svm::vmcb::{InterceptExceptions, InterceptVec3, VIntr, VmcbCleanBits, VmcbStruct};
use crate::{GuestPhysAddr, NestedSvmHal};

const CR0_TS: u64 = Cr0Flags::TASK_SWITCHED.bits();

/// Result of an emulated `VMRUN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmrunOutcome {
    /// L2 is ready to run on the shadow VMCB.
    Entered,
    /// The entry was abandoned; L1 has to see a `#VMEXIT` with `exitcode`.
    Vmexit { exitcode: u64 },
}

/// Queue `#GP(0)` for a register setter that rejected its value.
pub(super) fn inject_setter_fault(
    events: &mut VecDeque<(u8, Option<u32>)>,
    reg: &str,
    res: core::result::Result<(), SyntheticFault>,
) {
    if res.is_err() {
        warn!("[NSVM] setting {} faulted, injecting #GP(0)", reg);
        events.push_back((irq::GENERAL_PROTECTION_FAULT_VECTOR, Some(0)));
    }
}

/// Sync lazy FPU state into the CR0 L2 starts with. Returns the CR0 to load.
///
/// If the host gave up the FPU while L1 ran (`TS` set in the L1 VMCB but not
/// in L1's logical CR0), L2 has to trap on its first FPU use as well. If the
/// host took the FPU back instead, the trap is dropped.
pub(super) fn fpu_vmentry(l1_cr0: u64, vvmcb: &VmcbStruct, n1: &VmcbStruct, n2: &VmcbStruct) -> u64 {
    let mut vcr0 = vvmcb.state.cr0.get();
    let exceptions = &n2.control.intercept_exceptions;

    if l1_cr0 & CR0_TS == 0 && n1.state.cr0.get() & CR0_TS != 0 {
        vcr0 |= CR0_TS;
        exceptions.modify(InterceptExceptions::NM::SET);
    } else if vcr0 & CR0_TS == 0 && n2.state.cr0.get() & CR0_TS != 0 {
        vcr0 &= !CR0_TS;
        exceptions.modify(InterceptExceptions::NM::CLEAR);
    }
    vcr0
}

impl<H: NestedSvmHal, O: NestedVcpuOps> NestedSvmVcpu<H, O> {
    /// Trap-side half of `VMRUN`: map the VMCB L1 passed in `RAX` and mark
    /// the entry pending. The entry itself runs in [`Self::switch`].
    ///
    /// On `MapFailure` the caller has to shut L1 down.
    pub fn queue_vmrun(&mut self, vmcb_addr: GuestPhysAddr) -> Result {
        if !self.vmcb_map(vmcb_addr) {
            error!("[NSVM] VMRUN: cannot map VMCB at {:?}", vmcb_addr);
            return Err(NestedSvmError::MapFailure);
        }
        self.vmentry_pending = true;
        Ok(())
    }

    /// Emulate `VMRUN` for the virtual VMCB mapped by [`Self::queue_vmrun`].
    pub fn emulate_vmrun(&mut self) -> VmrunOutcome {
        let inst_len = self.ops.instruction_length(SvmInstruction::Vmrun);
        if inst_len == 0 {
            return self.abandon_vmrun(SvmExitCode::SHUTDOWN);
        }

        self.vmswitch_in_progress = true;
        let ret = self.vmentry(inst_len);

        // Guest mode even on failure, so the exit path restores L1.
        self.in_guestmode = true;

        match ret {
            Ok(()) => {}
            Err(NestedSvmError::MapFailure) => {
                error!("[NSVM] VMRUN: virtual VMCB not mapped");
                return self.abandon_vmrun(SvmExitCode::SHUTDOWN);
            }
            Err(err @ (NestedSvmError::MalformedVirtualBlock | NestedSvmError::CopyFault)) => {
                error!("[NSVM] VMRUN failed ({}), injecting VMEXIT(INVALID)", err);
                return self.abandon_vmrun(SvmExitCode::INVALID);
            }
            Err(err) => {
                error!("[NSVM] VMRUN failed ({}), injecting #UD", err);
                self.queue_event(irq::INVALID_OPCODE_VECTOR, None);
                self.vmswitch_in_progress = false;
                return self.abandon_vmrun(SvmExitCode::INVALID);
            }
        }

        if self.paging_mode() != PagingMode::FullNested {
            self.ops.update_paging_modes();
        }

        self.vmswitch_in_progress = false;
        debug!(
            "[NSVM] VMRUN emulated, L2 at rip {:#x} ({:?})",
            self.regs.rip,
            self.paging_mode()
        );
        VmrunOutcome::Entered
    }

    fn abandon_vmrun(&mut self, exitcode: SvmExitCode) -> VmrunOutcome {
        self.pending_exit.exitcode = exitcode.raw();
        VmrunOutcome::Vmexit {
            exitcode: exitcode.raw(),
        }
    }

    fn vmentry(&mut self, inst_len: u8) -> Result {
        let vvmcb = self
            .vvmcb
            .as_ref()
            .ok_or(NestedSvmError::MapFailure)?
            .as_vmcb();

        self.guest_cr3 = vvmcb.state.cr3.get();
        self.host_cr3 = vvmcb.control.nested_cr3.get();

        // Converted to bool: L1 may use flush-by-ASID without checking for it.
        self.flush_p2m = vvmcb.control.tlb_control.get() != 0;
        let asid = vvmcb.control.guest_asid.get();
        if self.asid != asid {
            self.flush_p2m = true;
            self.ops.flush_nested_asid();
            self.asid = asid;
        }

        self.hap_enabled = vvmcb.control.np_enabled();
        self.host_flags.vintr_mask = vvmcb.control.int_control.is_set(VIntr::V_INTR_MASKING);

        self.hostsave(inst_len);

        self.active = ActiveVmcb::Shadow;

        self.prepare4vmrun()?;

        self.stgi();
        Ok(())
    }

    /// Save L1's state into the L1 VMCB.
    fn hostsave(&mut self, inst_len: u8) {
        let n1 = self.n1.as_vmcb();

        n1.state.rip.set(n1.state.rip.get().wrapping_add(inst_len as u64));

        // Take the values the host tracks, not what L1 left in its VMCB.
        n1.state.efer.set(self.ops.guest_efer());
        n1.state.cr0.set(self.ops.guest_cr0());
        n1.state.cr2.set(self.ops.guest_cr2());
        n1.state.cr4.set(self.ops.guest_cr4());

        self.host_flags.rflags_if =
            RFlags::from_bits_truncate(n1.state.rflags.get()).contains(RFlags::INTERRUPT_FLAG);
    }

    /// Derive the shadow VMCB from the virtual VMCB and the L1 VMCB.
    fn prepare4vmrun(&mut self) -> Result {
        self.shadow_derived = false;

        if !self.ops.host_hap_enabled() && self.hap_enabled {
            error!("[NSVM] nested paging requested but the host runs shadow paging");
            return Err(NestedSvmError::MalformedVirtualBlock);
        }

        // Installs the merged maps into the shadow VMCB.
        self.build_permission_maps()?;

        let vvmcb = self
            .vvmcb
            .as_ref()
            .ok_or(NestedSvmError::MapFailure)?
            .as_vmcb();
        let n1 = self.n1.as_vmcb();
        let n2 = self.n2.as_vmcb();

        let mode = self.paging_mode();

        let source_is_cached = self.cached_derivation.is_some_and(|cached| {
            Some(cached.source) == self.vvmcb.as_ref().map(|page| page.gpa())
                && cached.generation == self.vvmcb_generation
        });
        let clean = LocalRegisterCopy::<u32, VmcbCleanBits::Register>::new(if source_is_cached {
            vvmcb.control.clean_bits.get()
        } else {
            0
        });

        // Intercepts
        if !clean.is_set(VmcbCleanBits::INTERCEPTS) {
            self.cached_intercepts = CachedIntercepts::read_from(&vvmcb.control);
        }
        let guest = self.cached_intercepts;
        let (host, shadow) = (&n1.control, &n2.control);
        shadow.intercept_cr.set(host.intercept_cr.get() | guest.cr);
        shadow.intercept_dr.set(host.intercept_dr.get() | guest.dr);
        shadow
            .intercept_exceptions
            .set(host.intercept_exceptions.get() | guest.exceptions);
        shadow
            .intercept_vector3
            .set(host.intercept_vector3.get() | guest.general1);
        shadow
            .intercept_vector4
            .set(host.intercept_vector4.get() | guest.general2);

        // Pause filter
        let general1 = LocalRegisterCopy::<u32, InterceptVec3::Register>::new(guest.general1);
        shadow.pause_filter_count.set(if general1.is_set(InterceptVec3::PAUSE) {
            host.pause_filter_count
                .get()
                .min(vvmcb.control.pause_filter_count.get())
        } else {
            host.pause_filter_count.get()
        });

        shadow.tsc_offset.set(
            host.tsc_offset
                .get()
                .wrapping_add(vvmcb.control.tsc_offset.get()),
        );

        shadow.guest_asid.set(self.ops.nested_guest_asid());
        shadow.tlb_control.set(vvmcb.control.tlb_control.get());

        if !clean.is_set(VmcbCleanBits::TPR) {
            shadow.int_control.set(vvmcb.control.int_control.get());
            shadow.int_control.modify(VIntr::V_INTR_MASKING::SET);
            shadow.int_vector.set(vvmcb.control.int_vector.get());
        }
        shadow.int_state.set(vvmcb.control.int_state.get());

        shadow.exit_code.set(vvmcb.control.exit_code.get());
        shadow.exit_info_1.set(vvmcb.control.exit_info_1.get());
        shadow.exit_info_2.set(vvmcb.control.exit_info_2.get());
        shadow.copy_exit_int_info(&vvmcb.control);
        shadow.copy_event_inj(&vvmcb.control);

        shadow
            .virt_ext
            .set(host.virt_ext.get() | vvmcb.control.virt_ext.get());

        // State save area
        let (src, dst) = (&vvmcb.state, &n2.state);
        if !clean.is_set(VmcbCleanBits::SEG) {
            dst.es.copy_from(&src.es);
            dst.cs.copy_from(&src.cs);
            dst.ss.copy_from(&src.ss);
            dst.ds.copy_from(&src.ds);
            dst.cpl.set(src.cpl.get());
        }
        if !clean.is_set(VmcbCleanBits::DT) {
            dst.gdtr.copy_from(&src.gdtr);
            dst.idtr.copy_from(&src.idtr);
        }

        let res = self.ops.set_efer(n2, src.efer.get());
        inject_setter_fault(&mut self.pending_events, "EFER", res);

        let res = self.ops.set_cr4(n2, src.cr4.get());
        inject_setter_fault(&mut self.pending_events, "CR4", res);

        let l1_cr0 = self.ops.guest_cr0();
        self.l1_cr0 = Some(l1_cr0);
        let cr0 = fpu_vmentry(l1_cr0, vvmcb, n1, n2);
        let res = self.ops.set_cr0(n2, cr0);
        inject_setter_fault(&mut self.pending_events, "CR0", res);

        self.ops.set_cr2(n2, src.cr2.get());

        match mode {
            PagingMode::FullNested => {
                shadow.set_np(true);
                self.host_cr3 = vvmcb.control.nested_cr3.get();
                let root = self.ops.nested_p2m_root(self.host_cr3);
                shadow.nested_cr3.set(root.as_usize() as u64);
                let res = self.ops.set_cr3(n2, src.cr3.get());
                inject_setter_fault(&mut self.pending_events, "CR3", res);
            }
            PagingMode::HostNestedOnly => {
                shadow.set_np(true);
                shadow.nested_cr3.set(host.nested_cr3.get());
                let res = self.ops.set_cr3(n2, src.cr3.get());
                inject_setter_fault(&mut self.pending_events, "CR3", res);
            }
            PagingMode::FullShadow => {
                shadow.set_np(false);
                shadow.nested_cr3.set(0);
            }
        }

        if !clean.is_set(VmcbCleanBits::DRx) {
            dst.dr7.set(src.dr7.get());
            dst.dr6.set(src.dr6.get());
        }

        dst.rflags.set(src.rflags.get());
        dst.rip.set(src.rip.get());
        dst.rsp.set(src.rsp.get());
        dst.rax.set(src.rax.get());

        if !clean.is_set(VmcbCleanBits::NP) {
            dst.g_pat.set(src.g_pat.get());
        }
        if !clean.is_set(VmcbCleanBits::LBR) {
            dst.copy_lbr(src);
        }

        shadow.clean_bits.set(0);

        if let Err(err) = self.ops.validate_block(vvmcb) {
            error!("[NSVM] virtual VMCB invalid: {:?}", err);
            return Err(NestedSvmError::MalformedVirtualBlock);
        }
        if let Err(err) = self.ops.validate_block(n2) {
            error!("[NSVM] shadow VMCB invalid: {:?}", err);
            return Err(NestedSvmError::MalformedDerivedBlock);
        }

        self.regs.gpr.rax = src.rax.get();
        self.regs.rip = src.rip.get();
        self.regs.rsp = src.rsp.get();
        self.regs.rflags = src.rflags.get();

        self.shadow_derived = true;
        Ok(())
    }
}

//! Emulated `#VMEXIT`: hand L2's state back to L1 and resume L1.

use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use x86_64::registers::control::Cr0Flags;
use x86_64::registers::rflags::RFlags;

use super::vmentry::{VmrunOutcome, inject_setter_fault};
use super::{ActiveVmcb, CachedDerivation, NestedSvmVcpu, NestedVcpuOps, PagingMode};
use crate::error::{NestedSvmError, Result};
use crate::regs::GuestUserRegsDiff;
use crate::svm::definitions::{
    SvmExitCode, VMEXIT_EXCP_15, VMEXIT_EXCP_AC, VMEXIT_EXCP_GP, VMEXIT_EXCP_MF, VMEXIT_EXCP_NP,
    VMEXIT_EXCP_PF, VMEXIT_EXCP_SS, event_needs_reinjection,
};
use crate::svm::vmcb::{InterceptExceptions, VIntr, VmcbStruct};
use crate::NestedSvmHal;

const CR0_TS: u64 = Cr0Flags::TASK_SWITCHED.bits();

/// Reverse of `fpu_vmentry`: make L1's CR0 and `#NM` intercept reflect
/// whichever of L1 and L2 last used the FPU.
pub(super) fn fpu_vmexit(n1: &VmcbStruct, n2: &VmcbStruct, l1_cr0: u64, guest_cr0: u64) {
    let exceptions = &n1.control.intercept_exceptions;

    if guest_cr0 & CR0_TS == 0 && n2.state.cr0.get() & CR0_TS != 0 {
        n1.state.cr0.set(n1.state.cr0.get() | CR0_TS);
        exceptions.modify(InterceptExceptions::NM::SET);
    } else if l1_cr0 & CR0_TS == 0 && n1.state.cr0.get() & CR0_TS != 0 {
        n1.state.cr0.set(n1.state.cr0.get() & !CR0_TS);
        exceptions.modify(InterceptExceptions::NM::CLEAR);
    }
}

impl<H: NestedSvmHal, O: NestedVcpuOps> NestedSvmVcpu<H, O> {
    /// Run the pending exit or entry, exit first.
    ///
    /// Called once per scheduling pass before the vcpu resumes.
    pub fn switch(&mut self) -> Result {
        if self.vmexit_pending {
            return self.switch_vmexit();
        }

        if self.vmentry_pending {
            match self.emulate_vmrun() {
                VmrunOutcome::Entered => self.vmentry_pending = false,
                VmrunOutcome::Vmexit { .. } => return self.switch_vmexit(),
            }
        }

        if self.in_guestmode
            && self.paging_mode() == PagingMode::FullNested
            && !self.ops.nested_p2m_present()
        {
            // L2 keeps running after a host-only exit; its table may be gone.
            trace!("[NSVM] reinstalling nested p2m");
            self.set_nested_p2m();
        }

        Ok(())
    }

    fn switch_vmexit(&mut self) -> Result {
        let ret = self.emulate_vmexit(self.pending_exit.exitcode);
        self.vmexit_pending = false;
        self.vmentry_pending = false;
        ret
    }

    /// Emulate a `#VMEXIT` with `exitcode` to L1.
    ///
    /// Fails with `Fatal` if L1's state could not be restored.
    pub fn emulate_vmexit(&mut self, exitcode: u64) -> Result {
        self.vmswitch_in_progress = true;

        // Host-handled exits leave the vcpu in guest mode until here.
        if self.in_guestmode {
            trace!("[NSVM] L2 exit: {:#x?}", self.n2.as_vmcb().exit_info());
            if let Err(err) = self.vmexit_n2n1() {
                error!("[NSVM] VMEXIT: fatal error ({})", err);
                return Err(NestedSvmError::Fatal);
            }
        }

        let ret = self.vmexit_inject(exitcode);

        if self.paging_mode() != PagingMode::FullNested {
            self.ops.update_paging_modes();
        }

        self.vmswitch_in_progress = false;
        debug!("[NSVM] VMEXIT({:#x}) emulated", exitcode);
        ret
    }

    /// Switch the vcpu from L2 back to L1.
    fn vmexit_n2n1(&mut self) -> Result {
        let ret = self.prepare4vmexit();
        self.hostrestore();
        self.in_guestmode = false;
        ret.map_err(|_| NestedSvmError::Fatal)
    }

    /// Copy L2's state from the shadow VMCB into the virtual VMCB.
    fn prepare4vmexit(&mut self) -> Result {
        let page = self.vvmcb.as_ref().ok_or(NestedSvmError::MapFailure)?;
        let vvmcb = page.as_vmcb();
        let n2 = self.n2.as_vmcb();
        let (vctl, sctl) = (&vvmcb.control, &n2.control);

        // Clean bits L1 sets from now on refer to this derivation. An aborted
        // VMRUN left parts of the shadow VMCB underived.
        self.cached_derivation = self.shadow_derived.then(|| CachedDerivation {
            source: page.gpa(),
            generation: self.vvmcb_generation,
        });

        // Intercepts, pause filter, permission maps, TSC offset and ASID
        // stay as L1 programmed them.
        vctl.tlb_control.set(0);

        vctl.int_control.set(sctl.int_control.get());
        vctl.int_vector.set(sctl.int_vector.get());
        if !self.host_flags.vintr_mask {
            vctl.int_control.modify(VIntr::V_INTR_MASKING::CLEAR);
        }
        vctl.int_state.set(sctl.int_state.get());

        vctl.exit_code.set(sctl.exit_code.get());
        vctl.exit_info_1.set(sctl.exit_info_1.get());
        vctl.exit_info_2.set(sctl.exit_info_2.get());
        vctl.copy_exit_int_info(sctl);

        // A VMRUN and a #VMEXIT emulated in the same host exit must not lose
        // the injected event. EXITINTINFO is not valid on a VMRUN intercept,
        // so nothing is overwritten here.
        if let Some((ty, vector)) = sctl.pending_event()
            && event_needs_reinjection(ty, vector)
        {
            vctl.set_exit_int_info_from_event(sctl);
        }
        vctl.clear_event_inj();
        sctl.clear_event_inj();

        match self.paging_mode() {
            PagingMode::FullNested => {
                // L1's own nested CR3 was never replaced, keep it.
                vctl.set_np(sctl.np_enabled());
                vvmcb.state.cr3.set(n2.state.cr3.get());
            }
            PagingMode::HostNestedOnly => {
                // Never let L1 see the host's root.
                vctl.set_np(false);
                vctl.nested_cr3.set(0);
                vvmcb.state.cr3.set(n2.state.cr3.get());
            }
            PagingMode::FullShadow => {
                vctl.set_np(false);
                vctl.nested_cr3.set(0);
            }
        }

        vctl.next_rip.set(sctl.next_rip.get());
        vctl.copy_insn_bytes(sctl);

        let (dst, src) = (&vvmcb.state, &n2.state);
        dst.es.copy_from(&src.es);
        dst.cs.copy_from(&src.cs);
        dst.ss.copy_from(&src.ss);
        dst.ds.copy_from(&src.ds);
        dst.gdtr.copy_from(&src.gdtr);
        dst.idtr.copy_from(&src.idtr);
        dst.cpl.set(src.cpl.get());
        dst.efer.set(src.efer.get());
        dst.cr4.set(src.cr4.get());
        dst.cr0.set(src.cr0.get());
        dst.dr7.set(src.dr7.get());
        dst.dr6.set(src.dr6.get());

        // The register frame may be newer than the shadow VMCB, e.g. right
        // after an emulated instruction.
        dst.rflags.set(self.regs.rflags);
        dst.rip.set(self.regs.rip);
        dst.rsp.set(self.regs.rsp);
        dst.rax.set(self.regs.gpr.rax);
        src.rflags.set(self.regs.rflags);
        src.rip.set(self.regs.rip);
        src.rsp.set(self.regs.rsp);
        src.rax.set(self.regs.gpr.rax);

        dst.cr2.set(src.cr2.get());
        dst.g_pat.set(src.g_pat.get());
        dst.copy_lbr(src);

        Ok(())
    }

    /// Restore L1 from the L1 VMCB and make it the active block again.
    fn hostrestore(&mut self) {
        let old_regs = self.regs;
        let n1 = self.n1.as_vmcb();
        let n2 = self.n2.as_vmcb();

        self.active = ActiveVmcb::NonNested;

        let res = self.ops.set_efer(n1, n1.state.efer.get());
        inject_setter_fault(&mut self.pending_events, "EFER", res);

        let res = self.ops.set_cr4(n1, n1.state.cr4.get());
        inject_setter_fault(&mut self.pending_events, "CR4", res);

        if let Some(l1_cr0) = self.l1_cr0.take() {
            fpu_vmexit(n1, n2, l1_cr0, self.ops.guest_cr0());
        }
        let rflags = RFlags::from_bits_retain(n1.state.rflags.get()) - RFlags::VIRTUAL_8086_MODE;
        n1.state.rflags.set(rflags.bits());
        let cr0 = n1.state.cr0.get() | Cr0Flags::PROTECTED_MODE_ENABLE.bits();
        let res = self.ops.set_cr0(n1, cr0);
        inject_setter_fault(&mut self.pending_events, "CR0", res);

        self.ops.set_cr2(n1, n1.state.cr2.get());

        // Under shadow paging the host rebuilds its tables for L1 from the
        // CR3 set here, see `emulate_vmexit`.
        let res = self.ops.set_cr3(n1, n1.state.cr3.get());
        inject_setter_fault(&mut self.pending_events, "CR3", res);

        self.regs.gpr.rax = n1.state.rax.get();
        self.regs.rsp = n1.state.rsp.get();
        self.regs.rip = n1.state.rip.get();
        self.regs.rflags = n1.state.rflags.get();

        n1.state.dr7.set(0);
        n1.state.cpl.set(0);

        // A stale EXITINTINFO would re-inject the same event forever.
        n1.control.exit_int_info.set(0);
        n1.control.exit_int_info_err.set(0);

        n1.control.clean_bits.set(0);

        let diff = GuestUserRegsDiff::new(old_regs, self.regs);
        if !diff.is_same() {
            trace!("[NSVM] L1 restored: {:?}", diff);
        }
    }

    /// Write the pending exit into the virtual VMCB.
    fn vmexit_inject(&mut self, exitcode: u64) -> Result {
        let Some(vvmcb) = self.vvmcb.as_ref().map(|page| page.as_vmcb()) else {
            error!("[NSVM] VMEXIT({:#x}) without a virtual VMCB", exitcode);
            return Err(NestedSvmError::Fatal);
        };
        let vctl = &vvmcb.control;
        let pending = self.pending_exit;

        if self.vmexit_pending {
            match exitcode {
                code if code == SvmExitCode::INTR.raw() => {
                    if self.vmentry_pending
                        && let Some((ty, vector)) = vctl.pending_event()
                        && event_needs_reinjection(ty, vector)
                    {
                        vctl.set_exit_int_info_from_event(vctl);
                    }
                }
                VMEXIT_EXCP_PF => {
                    vvmcb.state.cr2.set(pending.exitinfo2);
                    vctl.exit_info_2.set(pending.exitinfo2);
                    vctl.exit_info_1.set(pending.exitinfo1);
                }
                code if code == SvmExitCode::NPF.raw() => {
                    vctl.exit_info_2.set(pending.exitinfo2);
                    vctl.exit_info_1.set(pending.exitinfo1);
                }
                VMEXIT_EXCP_NP | VMEXIT_EXCP_SS | VMEXIT_EXCP_GP | VMEXIT_EXCP_15
                | VMEXIT_EXCP_MF | VMEXIT_EXCP_AC => {
                    vctl.exit_info_1.set(pending.exitinfo1);
                }
                _ => {}
            }
        }

        vctl.exit_code.set(exitcode);
        vctl.clear_event_inj();
        Ok(())
    }
}

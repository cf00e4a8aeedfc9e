//! GIF and interrupt delivery for a vcpu that may be running L2.

use tock_registers::interfaces::{ReadWriteable, Readable};
use x86::irq;
use x86_64::registers::model_specific::EferFlags;

use super::{NestedSvmVcpu, NestedVcpuOps, PendingVmexit};
use crate::NestedSvmHal;
use crate::svm::definitions::{SvmExitCode, SvmInstruction, VMEXIT_EXCP_MC};
use crate::svm::vmcb::{EventInj, InterceptVec3, InterceptVec4, VIntr, VirtExt};

/// Why an interrupt cannot be delivered right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptBlock {
    None,
    /// GIF is clear.
    GifClear,
    /// L1 runs with interrupts disabled, or an emulated exit is already
    /// pending.
    ShadowIF,
    /// An I/O request or a previously injected event is still in flight.
    ShadowPending,
}

/// Result of [`NestedSvmVcpu::deliver_interrupt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    Masked,
    NotHandled,
    /// L1 intercepts the interrupt; a `#VMEXIT` is pending.
    ForceVmexit,
    /// Deliver the interrupt to L2 directly.
    NotIntercepted,
}

/// Source of an acknowledged interrupt.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptSource {
    None = 0,
    Pic = 1,
    Lapic = 2,
    Nmi = 3,
    Mce = 4,
    Vector = 5,
}

impl<H: NestedSvmHal, O: NestedVcpuOps> NestedSvmVcpu<H, O> {
    /// The current GIF, from the active VMCB if hardware virtualizes it.
    pub fn gif_isset(&self) -> bool {
        let int_control = &self.active_vmcb().control.int_control;
        if int_control.is_set(VIntr::VGIF_ENABLE) {
            int_control.is_set(VIntr::VGIF)
        } else {
            self.gif
        }
    }

    pub(super) fn stgi(&mut self) {
        self.gif = true;
        self.ops.local_event_delivery(true);
    }

    pub(super) fn clgi(&mut self) {
        self.gif = false;
        self.ops.local_event_delivery(false);
    }

    /// Record an exit to emulate at the next [`Self::switch`] and clear GIF
    /// so nothing else is delivered meanwhile.
    pub fn vmexit_defer(&mut self, exitcode: u64, exitinfo1: u64, exitinfo2: u64) {
        let int_control = &self.active_vmcb().control.int_control;
        if int_control.is_set(VIntr::VGIF_ENABLE) {
            int_control.modify(VIntr::VGIF::CLEAR);
        } else {
            self.clgi();
        }

        self.pending_exit = PendingVmexit {
            exitcode,
            exitinfo1,
            exitinfo2,
        };
        self.vmexit_pending = true;
        trace!("[NSVM] deferred VMEXIT {:#x?}", self.pending_exit);
    }

    pub fn interrupt_blocked(&self) -> InterruptBlock {
        if !self.gif_isset() {
            return InterruptBlock::GifClear;
        }

        if self.in_guestmode {
            if self.host_flags.vintr_mask && !self.host_flags.rflags_if {
                return InterruptBlock::ShadowIF;
            }

            // An interrupt exit now would land in the middle of the
            // instruction that issued the request.
            if self.ops.io_request_pending() {
                return InterruptBlock::ShadowPending;
            }

            // Let L2 finish delivering the last injected event first.
            let exit_int_info = &self.n2.as_vmcb().control.exit_int_info;
            if !self.vmexit_pending && exit_int_info.is_set(EventInj::V) {
                return InterruptBlock::ShadowPending;
            }
        }

        // Exceptions take priority over interrupts.
        if self.vmexit_pending {
            return InterruptBlock::ShadowIF;
        }

        InterruptBlock::None
    }

    /// Offer an acknowledged interrupt to L1 while L2 runs.
    pub fn deliver_interrupt(&mut self, source: InterruptSource, vector: u8) -> InterruptOutcome {
        debug_assert!(self.in_guestmode);

        if self.interrupt_blocked() != InterruptBlock::None {
            return InterruptOutcome::Masked;
        }

        let exitcode = match source {
            InterruptSource::Pic | InterruptSource::Lapic | InterruptSource::Vector => {
                SvmExitCode::INTR.raw()
            }
            InterruptSource::Nmi => SvmExitCode::NMI.raw(),
            InterruptSource::Mce => VMEXIT_EXCP_MC,
            InterruptSource::None => return InterruptOutcome::NotHandled,
        };

        if self.wants_intercept(exitcode) == super::ExitRoute::Forward {
            self.vmexit_defer(exitcode, source as u64, vector as u64);
            InterruptOutcome::ForceVmexit
        } else {
            InterruptOutcome::NotIntercepted
        }
    }

    /// Emulate an intercepted `STGI`.
    pub fn emulate_stgi(&mut self) {
        let inst_len = self.ops.instruction_length(SvmInstruction::Stgi);
        if inst_len == 0 {
            return;
        }
        self.stgi();
        self.regs.advance_rip(inst_len);
    }

    /// Emulate an intercepted `CLGI`.
    pub fn emulate_clgi(&mut self) {
        if !self.l1_svme_enabled() {
            self.queue_event(irq::INVALID_OPCODE_VECTOR, None);
            return;
        }

        let inst_len = self.ops.instruction_length(SvmInstruction::Clgi);
        if inst_len == 0 {
            return;
        }
        self.clgi();

        // Nothing may be delivered after CLGI.
        let control = &self.active_vmcb().control;
        control.int_control.modify(VIntr::V_IRQ::CLEAR);
        control.intercept_vector3.modify(InterceptVec3::VINTR::CLEAR);

        self.regs.advance_rip(inst_len);
    }

    fn l1_svme_enabled(&self) -> bool {
        EferFlags::from_bits_truncate(self.ops.guest_efer())
            .contains(EferFlags::SECURE_VIRTUAL_MACHINE_ENABLE)
    }

    /// Toggle virtualized `VMLOAD`/`VMSAVE` and hardware GIF after L1 wrote
    /// `EFER.SVME`.
    pub fn on_efer_update(&mut self) {
        let control = &self.active_vmcb().control;

        if self.l1_svme_enabled() {
            if !control.virt_ext.is_set(VirtExt::VIRTUAL_VMLOAD_VMSAVE)
                && self.ops.host_hap_enabled()
                && self.caps.vloadsave
            {
                control.virt_ext.modify(VirtExt::VIRTUAL_VMLOAD_VMSAVE::SET);
                control
                    .intercept_vector4
                    .modify(InterceptVec4::VMLOAD::CLEAR + InterceptVec4::VMSAVE::CLEAR);
                info!("[NSVM] virtual VMLOAD/VMSAVE enabled");
            }

            if !control.int_control.is_set(VIntr::VGIF_ENABLE) && self.caps.vgif {
                let vgif = if self.gif {
                    VIntr::VGIF::SET
                } else {
                    VIntr::VGIF::CLEAR
                };
                control.int_control.modify(vgif + VIntr::VGIF_ENABLE::SET);
                control
                    .intercept_vector4
                    .modify(InterceptVec4::STGI::CLEAR + InterceptVec4::CLGI::CLEAR);
                info!("[NSVM] virtual GIF enabled");
            }
        } else {
            if control.virt_ext.is_set(VirtExt::VIRTUAL_VMLOAD_VMSAVE) {
                control.virt_ext.modify(VirtExt::VIRTUAL_VMLOAD_VMSAVE::CLEAR);
                control
                    .intercept_vector4
                    .modify(InterceptVec4::VMLOAD::SET + InterceptVec4::VMSAVE::SET);
                info!("[NSVM] virtual VMLOAD/VMSAVE disabled");
            }

            if control.int_control.is_set(VIntr::VGIF_ENABLE) {
                let gif = control.int_control.is_set(VIntr::VGIF);
                control.int_control.modify(VIntr::VGIF_ENABLE::CLEAR);
                control
                    .intercept_vector4
                    .modify(InterceptVec4::STGI::SET + InterceptVec4::CLGI::SET);
                self.gif = gif;
                info!("[NSVM] virtual GIF disabled");
            }
        }
    }
}

//! Tests for GIF handling and interrupt delivery.

use alloc::sync::Arc;

use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use x86_64::registers::model_specific::EferFlags;

use super::mock::*;
use crate::svm::vmcb::{EventInj, InterceptVec3, InterceptVec4, VIntr, VirtExt};
use crate::{
    InterruptBlock, InterruptOutcome, InterruptSource, NestedSvmCaps, PendingVmexit,
    ShadowIoMaps, SvmExitCode,
};

fn l2_vcpu(setup: impl FnOnce(&MockOps)) -> TestVcpu {
    let ops = l1_memory();
    setup(&ops);
    let mut vcpu = l1_vcpu(ops);
    enter_l2(&mut vcpu);
    vcpu
}

fn intercept_interrupts(ops: &MockOps) {
    ops.vmcb_at(VMCB_GPA)
        .control
        .intercept_vector3
        .write(InterceptVec3::INTR::SET + InterceptVec3::NMI::SET);
}

#[test]
fn test_nothing_blocks_a_fresh_l2() {
    let vcpu = l2_vcpu(|_| {});
    assert!(vcpu.gif_isset());
    assert_eq!(vcpu.interrupt_blocked(), InterruptBlock::None);
    assert!(vcpu.ops().event_delivery);
}

#[test]
fn test_deliver_intercepted_interrupt() {
    let mut vcpu = l2_vcpu(intercept_interrupts);

    let outcome = vcpu.deliver_interrupt(InterruptSource::Lapic, 0x30);
    assert_eq!(outcome, InterruptOutcome::ForceVmexit);
    assert!(vcpu.vmexit_pending());
    assert_eq!(
        vcpu.pending_exit(),
        PendingVmexit {
            exitcode: SvmExitCode::INTR.raw(),
            exitinfo1: InterruptSource::Lapic as u64,
            exitinfo2: 0x30,
        }
    );

    // The pending exit closes GIF until L1 runs.
    assert!(!vcpu.gif_isset());
    assert!(!vcpu.ops().event_delivery);
    assert_eq!(vcpu.interrupt_blocked(), InterruptBlock::GifClear);
    assert_eq!(
        vcpu.deliver_interrupt(InterruptSource::Lapic, 0x31),
        InterruptOutcome::Masked
    );

    vcpu.switch().unwrap();
    assert!(!vcpu.in_guestmode());
    let vctl = &vcpu.virtual_vmcb().unwrap().control;
    assert_eq!(vctl.exit_code.get(), SvmExitCode::INTR.raw());
}

#[test]
fn test_deliver_nmi() {
    let mut vcpu = l2_vcpu(intercept_interrupts);
    let outcome = vcpu.deliver_interrupt(InterruptSource::Nmi, 2);
    assert_eq!(outcome, InterruptOutcome::ForceVmexit);
    assert_eq!(vcpu.pending_exit().exitcode, SvmExitCode::NMI.raw());
}

#[test]
fn test_deliver_not_intercepted_interrupt() {
    let mut vcpu = l2_vcpu(|_| {});
    let outcome = vcpu.deliver_interrupt(InterruptSource::Pic, 0x20);
    assert_eq!(outcome, InterruptOutcome::NotIntercepted);
    assert!(!vcpu.vmexit_pending());
    assert!(vcpu.gif_isset());
}

#[test]
fn test_deliver_without_source() {
    let mut vcpu = l2_vcpu(intercept_interrupts);
    let outcome = vcpu.deliver_interrupt(InterruptSource::None, 0);
    assert_eq!(outcome, InterruptOutcome::NotHandled);
    assert!(!vcpu.vmexit_pending());
}

#[test]
fn test_l1_interrupts_disabled_blocks() {
    let ops = l1_memory();
    ops.vmcb_at(VMCB_GPA)
        .control
        .int_control
        .write(VIntr::V_INTR_MASKING::SET);
    intercept_interrupts(&ops);
    let mut vcpu = l1_vcpu(ops);
    // L1 executed VMRUN with RFLAGS.IF clear.
    vcpu.l1_vmcb().state.rflags.set(0x2);
    enter_l2(&mut vcpu);

    assert_eq!(vcpu.interrupt_blocked(), InterruptBlock::ShadowIF);
    assert_eq!(
        vcpu.deliver_interrupt(InterruptSource::Lapic, 0x30),
        InterruptOutcome::Masked
    );
    assert!(!vcpu.vmexit_pending());
}

#[test]
fn test_pending_io_blocks() {
    let mut vcpu = l2_vcpu(intercept_interrupts);
    vcpu.ops_mut().io_pending = true;
    assert_eq!(vcpu.interrupt_blocked(), InterruptBlock::ShadowPending);
    assert_eq!(
        vcpu.deliver_interrupt(InterruptSource::Lapic, 0x30),
        InterruptOutcome::Masked
    );
}

#[test]
fn test_undelivered_event_blocks() {
    let vcpu = l2_vcpu(|_| {});
    vcpu.shadow_vmcb()
        .control
        .exit_int_info
        .write(EventInj::V::SET + EventInj::VECTOR.val(0x30));
    assert_eq!(vcpu.interrupt_blocked(), InterruptBlock::ShadowPending);
}

#[test]
fn test_pending_exit_blocks_with_hardware_gif() {
    let mut vcpu = l1_vcpu(l1_memory());
    vcpu.on_efer_update();
    assert!(vcpu.l1_vmcb().control.int_control.is_set(VIntr::VGIF_ENABLE));

    vcpu.vmexit_defer(SvmExitCode::HLT.raw(), 0, 0);
    // Only the hardware GIF is cleared.
    assert!(!vcpu.gif_isset());
    assert!(vcpu.ops().event_delivery);
    assert_eq!(vcpu.interrupt_blocked(), InterruptBlock::GifClear);

    vcpu.l1_vmcb()
        .control
        .int_control
        .modify(VIntr::VGIF::SET);
    assert_eq!(vcpu.interrupt_blocked(), InterruptBlock::ShadowIF);
}

#[test]
fn test_clgi_and_stgi() {
    let mut vcpu = l1_vcpu(l1_memory());
    let control = &vcpu.l1_vmcb().control;
    control.int_control.modify(VIntr::V_IRQ::SET);
    control
        .intercept_vector3
        .modify(InterceptVec3::VINTR::SET + InterceptVec3::HLT::SET);

    vcpu.emulate_clgi();
    assert!(!vcpu.gif_isset());
    assert!(!vcpu.ops().event_delivery);
    assert_eq!(vcpu.regs().rip, 3);

    let control = &vcpu.l1_vmcb().control;
    assert!(!control.int_control.is_set(VIntr::V_IRQ));
    assert!(!control.intercept_vector3.is_set(InterceptVec3::VINTR));
    assert!(control.intercept_vector3.is_set(InterceptVec3::HLT));

    vcpu.emulate_stgi();
    assert!(vcpu.gif_isset());
    assert!(vcpu.ops().event_delivery);
    assert_eq!(vcpu.regs().rip, 6);
}

#[test]
fn test_clgi_without_svme_raises_ud() {
    let mut ops = l1_memory();
    ops.efer = 0;
    let mut vcpu = l1_vcpu(ops);

    vcpu.emulate_clgi();
    assert!(vcpu.gif_isset());
    assert_eq!(vcpu.regs().rip, 0);
    assert_eq!(vcpu.pop_pending_event(), Some((6, None)));
}

#[test]
fn test_gi_instructions_without_length() {
    let mut ops = l1_memory();
    ops.inst_len = 0;
    let mut vcpu = l1_vcpu(ops);

    vcpu.emulate_clgi();
    assert!(vcpu.gif_isset());
    vcpu.emulate_stgi();
    assert_eq!(vcpu.regs().rip, 0);
    assert_eq!(vcpu.pop_pending_event(), None);
}

#[test]
fn test_efer_update_toggles_virtualized_features() {
    let mut vcpu = l1_vcpu(l1_memory());
    vcpu.l1_vmcb().control.intercept_vector4.modify(
        InterceptVec4::VMLOAD::SET
            + InterceptVec4::VMSAVE::SET
            + InterceptVec4::STGI::SET
            + InterceptVec4::CLGI::SET,
    );

    vcpu.on_efer_update();
    let control = &vcpu.l1_vmcb().control;
    assert!(control.virt_ext.is_set(VirtExt::VIRTUAL_VMLOAD_VMSAVE));
    assert!(control.int_control.is_set(VIntr::VGIF_ENABLE));
    assert!(control.int_control.is_set(VIntr::VGIF));
    let vec4 = &control.intercept_vector4;
    assert!(!vec4.is_set(InterceptVec4::VMLOAD));
    assert!(!vec4.is_set(InterceptVec4::VMSAVE));
    assert!(!vec4.is_set(InterceptVec4::STGI));
    assert!(!vec4.is_set(InterceptVec4::CLGI));
    assert!(vec4.is_set(InterceptVec4::VMRUN));

    // L1 runs CLGI natively, then clears EFER.SVME.
    control.int_control.modify(VIntr::VGIF::CLEAR);
    vcpu.ops_mut().efer = L1_EFER & !EferFlags::SECURE_VIRTUAL_MACHINE_ENABLE.bits();
    vcpu.on_efer_update();

    let control = &vcpu.l1_vmcb().control;
    assert!(!control.virt_ext.is_set(VirtExt::VIRTUAL_VMLOAD_VMSAVE));
    assert!(!control.int_control.is_set(VIntr::VGIF_ENABLE));
    let vec4 = &control.intercept_vector4;
    assert!(vec4.is_set(InterceptVec4::VMLOAD));
    assert!(vec4.is_set(InterceptVec4::VMSAVE));
    assert!(vec4.is_set(InterceptVec4::STGI));
    assert!(vec4.is_set(InterceptVec4::CLGI));
    // The hardware GIF carries over.
    assert!(!vcpu.gif_isset());
}

#[test]
fn test_efer_update_respects_host_caps() {
    let caps = NestedSvmCaps {
        vgif: false,
        ..all_caps()
    };
    let mut ops = l1_memory();
    ops.host_hap = false;
    let io_maps: Arc<ShadowIoMaps<MockHal>> = ShadowIoMaps::new().unwrap();
    let mut vcpu = TestVcpu::new(ops, caps, io_maps).unwrap();

    vcpu.on_efer_update();
    let control = &vcpu.l1_vmcb().control;
    assert!(!control.virt_ext.is_set(VirtExt::VIRTUAL_VMLOAD_VMSAVE));
    assert!(!control.int_control.is_set(VIntr::VGIF_ENABLE));
}

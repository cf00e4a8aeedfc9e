//! Tests for the permission maps installed into the shadow VMCB.

use alloc::sync::Arc;

use tock_registers::interfaces::{Readable, Writeable};

use super::mock::*;
use crate::frame::PAGE_SIZE;
use crate::svm::structs::{IOPM_SIZE, MSRPM_SIZE, io_bitmap_test, msrpm_bit};
use crate::{GuestPhysAddr, ShadowIoMap, ShadowIoMaps, SvmExitCode};

fn msrpm_test(bitmap: &[u8], msr: u32, is_write: bool) -> bool {
    let (byte, bit) = msrpm_bit(msr, is_write).unwrap();
    bitmap[byte] & (1 << bit) != 0
}

#[test]
fn test_shadow_io_maps() {
    let maps: Arc<ShadowIoMaps<MockHal>> = ShadowIoMaps::new().unwrap();

    for (port_80, port_ed) in [(false, false), (false, true), (true, false), (true, true)] {
        let selection = ShadowIoMap { port_80, port_ed };
        assert_eq!(maps.is_intercepted(selection, 0x80), port_80);
        assert_eq!(maps.is_intercepted(selection, 0xed), port_ed);
        assert!(maps.is_intercepted(selection, 0x60));
        assert!(maps.is_intercepted(selection, 0xcf8));
        assert!(maps.is_intercepted(selection, 0xffff));
    }

    let none = ShadowIoMap {
        port_80: false,
        port_ed: false,
    };
    let all = ShadowIoMap {
        port_80: true,
        port_ed: true,
    };
    assert_ne!(maps.phys_addr(none), maps.phys_addr(all));
}

#[test]
fn test_io_map_follows_probed_ports() {
    let mut ops = l1_memory();
    ops.intercept_port(0x80);
    let mut vcpu = l1_vcpu(ops);
    enter_l2(&mut vcpu);

    assert_eq!(
        vcpu.io_map(),
        Some(ShadowIoMap {
            port_80: true,
            port_ed: false,
        })
    );

    let iopm = vcpu.shadow_vmcb().control.iopm_base_pa.get();
    assert_ne!(iopm, IOPM_GPA as u64);
    let bitmap = host_bytes(iopm, IOPM_SIZE);
    assert!(io_bitmap_test(bitmap, 0x80));
    assert!(!io_bitmap_test(bitmap, 0xed));
    assert!(io_bitmap_test(bitmap, 0x60));
    assert_eq!(vcpu.ops().live_mappings, 1);
}

#[test]
fn test_io_map_with_unmappable_bitmap() {
    let mut ops = l1_memory();
    ops.pages.remove(&(IOPM_GPA / PAGE_SIZE));
    let mut vcpu = l1_vcpu(ops);
    enter_l2(&mut vcpu);

    assert_eq!(
        vcpu.io_map(),
        Some(ShadowIoMap {
            port_80: true,
            port_ed: true,
        })
    );
    let bitmap = host_bytes(vcpu.shadow_vmcb().control.iopm_base_pa.get(), IOPM_SIZE);
    assert!(io_bitmap_test(bitmap, 0x80));
    assert!(io_bitmap_test(bitmap, 0xed));
}

#[test]
fn test_msr_maps_are_merged() {
    let mut ops = l1_memory();
    let (byte, bit) = msrpm_bit(0x174, true).unwrap();
    ops.page_mut(MSRPM_GPA)[byte] |= 1 << bit;
    let mut vcpu = l1_vcpu(ops);
    vcpu.host_msrpm_mut().set_read_intercept(0x10, true);
    enter_l2(&mut vcpu);

    let msrpm = vcpu.shadow_vmcb().control.msrpm_base_pa.get();
    assert_ne!(msrpm, MSRPM_GPA as u64);
    assert_ne!(msrpm, vcpu.l1_vmcb().control.msrpm_base_pa.get());

    let bitmap = host_bytes(msrpm, MSRPM_SIZE);
    // host
    assert!(msrpm_test(bitmap, 0x10, false));
    assert!(!msrpm_test(bitmap, 0x10, true));
    // L1
    assert!(msrpm_test(bitmap, 0x174, true));
    assert!(!msrpm_test(bitmap, 0x174, false));
    assert!(!msrpm_test(bitmap, 0xc000_0080, false));

    // The host map L1 runs on is left alone.
    let host = host_bytes(vcpu.l1_vmcb().control.msrpm_base_pa.get(), MSRPM_SIZE);
    assert!(msrpm_test(host, 0x10, false));
    assert!(!msrpm_test(host, 0x174, true));
}

#[test]
fn test_msr_map_refreshed_on_every_vmrun() {
    let mut vcpu = l1_vcpu(l1_memory());
    enter_l2(&mut vcpu);
    exit_to_l1(&mut vcpu, SvmExitCode::HLT.raw());

    let (byte, bit) = msrpm_bit(0xc001_0010, false).unwrap();
    vcpu.ops_mut().page_mut(MSRPM_GPA + PAGE_SIZE)[byte - PAGE_SIZE] |= 1 << bit;
    vcpu.queue_vmrun(GuestPhysAddr::from(VMCB_GPA)).unwrap();
    vcpu.switch().unwrap();

    let bitmap = host_bytes(vcpu.shadow_vmcb().control.msrpm_base_pa.get(), MSRPM_SIZE);
    assert!(msrpm_test(bitmap, 0xc001_0010, false));
}

#[test]
fn test_iomap_addresses_tracked() {
    const OTHER_IOPM_GPA: usize = 0x40_000;

    let mut ops = l1_memory();
    ops.add_pages(OTHER_IOPM_GPA, 3);
    let mut vcpu = l1_vcpu(ops);
    assert_eq!(vcpu.iomap_gpas(), (None, None));

    enter_l2(&mut vcpu);
    let first = GuestPhysAddr::from(IOPM_GPA);
    assert_eq!(vcpu.iomap_gpas(), (Some(first), None));

    exit_to_l1(&mut vcpu, SvmExitCode::HLT.raw());
    vcpu.virtual_vmcb()
        .unwrap()
        .control
        .iopm_base_pa
        .set(OTHER_IOPM_GPA as u64);
    vcpu.queue_vmrun(GuestPhysAddr::from(VMCB_GPA)).unwrap();
    vcpu.switch().unwrap();

    let second = GuestPhysAddr::from(OTHER_IOPM_GPA);
    assert_eq!(vcpu.iomap_gpas(), (Some(second), Some(first)));
    // Nothing intercepted in the new bitmap.
    assert_eq!(
        vcpu.io_map(),
        Some(ShadowIoMap {
            port_80: false,
            port_ed: false,
        })
    );
}

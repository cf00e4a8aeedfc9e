mod check;
pub(crate) mod definitions; // exit codes, exit ranges, event types
mod nested;
pub(crate) mod structs; // VmcbFrame / IOPm / MSRPm
pub mod vmcb;

use bit_field::BitField;

pub use self::check::{VmcbCheckError, check_vmcb};
pub use self::definitions::{SvmExitCode, SvmInstruction, event_needs_reinjection, exception_exit};
pub use self::nested::{
    ActiveVmcb, CopyFault, ExitRoute, InterruptBlock, InterruptOutcome, InterruptSource,
    L1WalkResult, MappedGuestPage, NestedSvmVcpu, NestedVcpuOps, PagingMode, PendingVmexit,
    ShadowIoMap, ShadowIoMaps, SyntheticFault, VmrunOutcome,
};
pub use self::structs::{IOPm, MSRPm};
pub use self::vmcb::{SvmExitInfo, VmcbStruct};

pub fn has_hardware_support() -> bool {
    if let Some(ext) = raw_cpuid::CpuId::new().get_extended_processor_and_feature_identifiers() {
        ext.has_svm()
    } else {
        false
    }
}

/// SVM features of the host CPU that nested SVM depends on
/// (CPUID `Fn8000_000A_EDX`).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NestedSvmCaps {
    pub nested_paging: bool,
    pub lbr_virt: bool,
    pub nrip_save: bool,
    pub flush_by_asid: bool,
    pub decode_assists: bool,
    pub vmcb_clean: bool,
    /// Virtualized `VMLOAD`/`VMSAVE`.
    pub vloadsave: bool,
    /// Hardware GIF virtualization.
    pub vgif: bool,
}

impl NestedSvmCaps {
    pub fn detect() -> Self {
        let edx = raw_cpuid::cpuid!(0x8000_000a).edx;
        let caps = Self {
            nested_paging: edx.get_bit(0),
            lbr_virt: edx.get_bit(1),
            nrip_save: edx.get_bit(3),
            vmcb_clean: edx.get_bit(5),
            flush_by_asid: edx.get_bit(6),
            decode_assists: edx.get_bit(7),
            vloadsave: edx.get_bit(15),
            vgif: edx.get_bit(16),
        };
        debug!("[NSVM] host SVM features: {:?}", caps);
        caps
    }

    /// Whether L1 can be offered SVM at all.
    pub fn nested_virt_supported(&self) -> bool {
        self.nested_paging
            && self.lbr_virt
            && self.nrip_save
            && self.flush_by_asid
            && self.decode_assists
    }
}

//! SVM `#VMEXIT` codes (AMD64 APM Vol.2, Appendix C).

#![allow(non_camel_case_types)]

use core::ops::RangeInclusive;

use x86::irq;

/// `VMEXIT_CR0_READ ..= VMEXIT_CR15_WRITE`, one bit each in the CR intercept word.
pub const CR_ACCESS_EXITS: RangeInclusive<u64> = 0x00..=0x1f;
/// `VMEXIT_DR0_READ ..= VMEXIT_DR15_WRITE`, one bit each in the DR intercept word.
pub const DR_ACCESS_EXITS: RangeInclusive<u64> = 0x20..=0x3f;
/// `VMEXIT_EXCP0 ..= VMEXIT_EXCP31`, one bit each in the exception intercept word.
pub const EXCEPTION_EXITS: RangeInclusive<u64> = 0x40..=0x5f;
/// `VMEXIT_INTR ..= VMEXIT_SHUTDOWN`, intercept vector 3.
pub const GENERAL1_EXITS: RangeInclusive<u64> = 0x60..=0x7f;
/// `VMEXIT_VMRUN ..= VMEXIT_EFER_WRITE_TRAP`, intercept vector 4.
pub const GENERAL2_EXITS: RangeInclusive<u64> = 0x80..=0x8f;

/// The exit code an exception with `vector` produces.
pub const fn exception_exit(vector: u8) -> u64 {
    *EXCEPTION_EXITS.start() + vector as u64
}

pub const VMEXIT_EXCP_NM: u64 = exception_exit(irq::DEVICE_NOT_AVAILABLE_VECTOR);
pub const VMEXIT_EXCP_NP: u64 = exception_exit(irq::SEGMENT_NOT_PRESENT_VECTOR);
pub const VMEXIT_EXCP_SS: u64 = exception_exit(irq::STACK_SEGEMENT_FAULT_VECTOR);
pub const VMEXIT_EXCP_GP: u64 = exception_exit(irq::GENERAL_PROTECTION_FAULT_VECTOR);
pub const VMEXIT_EXCP_PF: u64 = exception_exit(irq::PAGE_FAULT_VECTOR);
/// Vector 15 is reserved, but hardware still reports an exit code for it.
pub const VMEXIT_EXCP_15: u64 = exception_exit(15);
pub const VMEXIT_EXCP_MF: u64 = exception_exit(irq::X87_FPU_VECTOR);
pub const VMEXIT_EXCP_AC: u64 = exception_exit(irq::ALIGNMENT_CHECK_VECTOR);
pub const VMEXIT_EXCP_MC: u64 = exception_exit(irq::MACHINE_CHECK_VECTOR);

numeric_enum_macro::numeric_enum! {
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// `#VMEXIT` codes outside the CR/DR/exception ranges.
pub enum SvmExitCode {
    INTR = 0x60,
    NMI = 0x61,
    SMI = 0x62,
    INIT = 0x63,
    VINTR = 0x64,
    CR0_SEL_WRITE = 0x65,
    IDTR_READ = 0x66,
    GDTR_READ = 0x67,
    LDTR_READ = 0x68,
    TR_READ = 0x69,
    IDTR_WRITE = 0x6a,
    GDTR_WRITE = 0x6b,
    LDTR_WRITE = 0x6c,
    TR_WRITE = 0x6d,
    RDTSC = 0x6e,
    RDPMC = 0x6f,
    PUSHF = 0x70,
    POPF = 0x71,
    CPUID = 0x72,
    RSM = 0x73,
    IRET = 0x74,
    SWINT = 0x75,
    INVD = 0x76,
    PAUSE = 0x77,
    HLT = 0x78,
    INVLPG = 0x79,
    INVLPGA = 0x7a,
    IOIO = 0x7b,
    MSR = 0x7c,
    TASK_SWITCH = 0x7d,
    FERR_FREEZE = 0x7e,
    SHUTDOWN = 0x7f,
    VMRUN = 0x80,
    VMMCALL = 0x81,
    VMLOAD = 0x82,
    VMSAVE = 0x83,
    STGI = 0x84,
    CLGI = 0x85,
    SKINIT = 0x86,
    RDTSCP = 0x87,
    ICEBP = 0x88,
    WBINVD = 0x89,
    MONITOR = 0x8a,
    MWAIT = 0x8b,
    MWAIT_CONDITIONAL = 0x8c,
    XSETBV = 0x8d,
    RDPRU = 0x8e,
    EFER_WRITE_TRAP = 0x8f,
    NPF = 0x400,
    AVIC_INCOMPLETE_IPI = 0x401,
    AVIC_NOACCEL = 0x402,
    VMGEXIT = 0x403,
    INVALID = 0xffff_ffff_ffff_ffff,
}
}

impl SvmExitCode {
    /// The raw value written into `EXITCODE`.
    pub const fn raw(self) -> u64 {
        self as u64
    }
}

/// Instructions whose length the trap decoder has to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvmInstruction {
    Vmrun,
    Stgi,
    Clgi,
}

/// Event types in `EVENTINJ` / `EXITINTINFO` (APM Vol.2, 15.20).
pub mod event_type {
    pub const EXTERNAL_INTR: u8 = 0;
    pub const NMI: u8 = 2;
    pub const HW_EXCEPTION: u8 = 3;
    pub const SW_INTR: u8 = 4;
}

/// Whether an event cut short by a `#VMEXIT` has to be delivered again.
///
/// Software-generated events restart with the instruction. `#BP` and `#OF`
/// are traps raised by `INT3`/`INTO`, so they are regenerated as well.
pub fn event_needs_reinjection(ty: u8, vector: u8) -> bool {
    match ty {
        event_type::EXTERNAL_INTR | event_type::NMI => true,
        event_type::HW_EXCEPTION => {
            vector != irq::BREAKPOINT_VECTOR && vector != irq::OVERFLOW_VECTOR
        }
        _ => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exit_code_conversion() {
        assert_eq!(SvmExitCode::try_from(0x7c_u64), Ok(SvmExitCode::MSR));
        assert_eq!(SvmExitCode::try_from(u64::MAX), Ok(SvmExitCode::INVALID));
        assert_eq!(SvmExitCode::try_from(0x4e_u64), Err(0x4e));
        assert_eq!(u64::from(SvmExitCode::NPF), 0x400);
        assert_eq!(VMEXIT_EXCP_PF, 0x4e);
        assert_eq!(VMEXIT_EXCP_MC, 0x52);
    }

    #[test]
    fn reinjection_rule() {
        assert!(event_needs_reinjection(event_type::EXTERNAL_INTR, 0x20));
        assert!(event_needs_reinjection(event_type::NMI, 2));
        assert!(event_needs_reinjection(event_type::HW_EXCEPTION, 14));
        assert!(!event_needs_reinjection(event_type::HW_EXCEPTION, 3));
        assert!(!event_needs_reinjection(event_type::HW_EXCEPTION, 4));
        assert!(!event_needs_reinjection(event_type::SW_INTR, 0x80));
    }
}

use core::fmt;

/// Errors raised by the nested-SVM pipelines.
///
/// Setter faults on EFER/CR0/CR3/CR4 are not in this list: they are turned
/// into a `#GP(0)` for the guest that caused them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NestedSvmError {
    /// The virtual VMCB or a permission map page could not be mapped.
    MapFailure,
    /// Reading L1's MSR permission map out of guest memory failed.
    CopyFault,
    /// The VMCB programmed by L1 failed the structural checks.
    MalformedVirtualBlock,
    /// The merged shadow VMCB failed the structural checks.
    MalformedDerivedBlock,
    /// Restoring L1 after an emulated `#VMEXIT` failed; the nested session
    /// cannot continue.
    Fatal,
}

impl fmt::Display for NestedSvmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::MapFailure => "virtual VMCB or permission map not mappable",
            Self::CopyFault => "failed to copy L1 MSR permission map",
            Self::MalformedVirtualBlock => "virtual VMCB is invalid",
            Self::MalformedDerivedBlock => "shadow VMCB is invalid",
            Self::Fatal => "nested #VMEXIT restore failed",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for NestedSvmError {}

/// Result type of the nested-SVM pipelines.
pub type Result<T = ()> = core::result::Result<T, NestedSvmError>;

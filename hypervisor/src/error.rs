//! Error types surfaced by the root-mode lifecycle.

use thiserror_no_std::Error;

/// Failures observed while bringing a logical processor into or out of VMX
/// operation.
///
/// The VMX instruction variants are distinguishable so a caller can tell which
/// step of the enter/exit sequence the hardware rejected. There is no retry or
/// rollback here: a failure after a successful VMXON leaves the processor in
/// VMX operation with no clean VMCS, and remediation belongs to the caller.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorError {
    #[error("VMXON failed")]
    VmxonFailed,

    #[error("VMCLEAR failed")]
    VmclearFailed,

    #[error("VMPTRLD failed")]
    VmptrldFailed,

    #[error("The processor is not a supported Intel CPU")]
    CPUUnsupported,

    #[error("Virtual Machine Extension (VMX) technology is not supported")]
    VMXUnsupported,

    #[error("VMX is locked off in the BIOS")]
    VmxBiosLock,
}

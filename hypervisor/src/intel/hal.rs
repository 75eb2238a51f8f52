//! Hardware abstraction over the processor state touched during VMX bring-up.
//!
//! Control registers, capability MSRs and the VMX instructions are ambient
//! machine state; reaching them through an explicit handle keeps the lifecycle
//! logic testable, since a fake backend can be injected in place of the
//! physical processor. [`crate::intel::support::VmxHalImpl`] is the backend
//! for real hardware.

use x86::vmx::VmFail;

/// The processor-local privileged state consumed by the root-mode lifecycle.
///
/// Every method operates on the logical processor the caller is currently
/// pinned to; nothing here crosses cores. The four VMX instruction methods
/// report hardware rejection through [`VmFail`], the RFlags-derived outcome
/// (carry flag set -> `VmFailInvalid`, zero flag set -> `VmFailValid`); the
/// instructions never fault when the caller honors the documented
/// address/alignment/revision preconditions.
pub trait VmxHal {
    fn read_cr0(&self) -> u64;

    fn write_cr0(&mut self, value: u64);

    fn read_cr4(&self) -> u64;

    fn write_cr4(&mut self, value: u64);

    fn rdmsr(&self, msr: u32) -> u64;

    fn wrmsr(&mut self, msr: u32, value: u64);

    /// Sets CR4.VMXE, the permission bit that makes the VMX instruction set
    /// valid on this processor.
    fn enable_vmx_operation(&mut self);

    /// Clears CR4.VMXE after VMX operation has been left.
    fn disable_vmx_operation(&mut self);

    /// Executes VMXON with the physical address of the VMXON region.
    fn vmxon(&mut self, vmxon_region_pa: u64) -> Result<(), VmFail>;

    /// Executes VMCLEAR with the physical address of a VMCS region.
    fn vmclear(&mut self, vmcs_region_pa: u64) -> Result<(), VmFail>;

    /// Executes VMPTRLD, making the VMCS at the given physical address current.
    fn vmptrld(&mut self, vmcs_region_pa: u64) -> Result<(), VmFail>;

    /// Executes VMXOFF. Once the processor is in VMX operation this cannot
    /// fail observably, so no outcome is reported.
    fn vmxoff(&mut self);
}

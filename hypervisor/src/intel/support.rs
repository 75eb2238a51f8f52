//! Thin wrappers over the privileged instructions and register accesses used
//! by the rest of the crate, plus [`VmxHalImpl`], the [`VmxHal`] backend that
//! executes them on the physical processor.

use {
    crate::intel::hal::VmxHal,
    x86::{bits64::vmx, vmx::VmFail},
    x86_64::registers::control::{Cr0, Cr4, Cr4Flags},
};

/// Reads an MSR.
pub fn rdmsr(msr: u32) -> u64 {
    unsafe { x86::msr::rdmsr(msr) }
}

/// Writes an MSR.
pub fn wrmsr(msr: u32, value: u64) {
    unsafe { x86::msr::wrmsr(msr, value) }
}

/// Reads CR0 as a raw machine word.
pub fn cr0() -> u64 {
    Cr0::read_raw()
}

/// Writes CR0 as a raw machine word.
pub fn cr0_write(value: u64) {
    unsafe { Cr0::write_raw(value) };
}

/// Reads CR4 as a raw machine word.
pub fn cr4() -> u64 {
    Cr4::read_raw()
}

/// Writes CR4 as a raw machine word.
pub fn cr4_write(value: u64) {
    unsafe { Cr4::write_raw(value) };
}

/// Reads 8 bits from the given I/O port.
pub fn inb(port: u16) -> u8 {
    unsafe { x86::io::inb(port) }
}

/// Writes 8 bits to the given I/O port.
pub fn outb(port: u16, value: u8) {
    unsafe { x86::io::outb(port, value) }
}

/// The [`VmxHal`] backend for the physical processor this code runs on.
///
/// Zero-sized; the state behind it is the ambient state of the current
/// logical processor.
pub struct VmxHalImpl;

impl VmxHal for VmxHalImpl {
    fn read_cr0(&self) -> u64 {
        cr0()
    }

    fn write_cr0(&mut self, value: u64) {
        cr0_write(value);
    }

    fn read_cr4(&self) -> u64 {
        cr4()
    }

    fn write_cr4(&mut self, value: u64) {
        cr4_write(value);
    }

    fn rdmsr(&self, msr: u32) -> u64 {
        rdmsr(msr)
    }

    fn wrmsr(&mut self, msr: u32, value: u64) {
        wrmsr(msr, value);
    }

    fn enable_vmx_operation(&mut self) {
        cr4_write(cr4() | Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits());
    }

    fn disable_vmx_operation(&mut self) {
        cr4_write(cr4() & !Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits());
    }

    fn vmxon(&mut self, vmxon_region_pa: u64) -> Result<(), VmFail> {
        unsafe { vmx::vmxon(vmxon_region_pa) }
    }

    fn vmclear(&mut self, vmcs_region_pa: u64) -> Result<(), VmFail> {
        unsafe { vmx::vmclear(vmcs_region_pa) }
    }

    fn vmptrld(&mut self, vmcs_region_pa: u64) -> Result<(), VmFail> {
        unsafe { vmx::vmptrld(vmcs_region_pa) }
    }

    fn vmxoff(&mut self) {
        // VMXOFF only reports failure outside VMX operation; by the time the
        // lifecycle calls this the processor is in root mode.
        let _ = unsafe { vmx::vmxoff() };
    }
}

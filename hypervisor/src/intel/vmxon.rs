//! The VMXON region and the preconditions for entering VMX operation.
//!
//! The VMXON region is the page the processor activates with the VMXON
//! instruction before any other VMX instruction is valid. Allocation and
//! physical mapping of the page belong to the caller; this module only defines
//! its layout and stamps the revision identifier the hardware demands.

use {
    crate::{error::HypervisorError, intel::hal::VmxHal},
    bit_field::BitField,
    static_assertions::const_assert_eq,
    x86::{bits64::paging::BASE_PAGE_SIZE, msr},
};

/// IA32_FEATURE_CONTROL lock bit. Once set, the MSR is immutable until reset.
const FEATURE_CONTROL_LOCKED: u64 = 1 << 0;

/// IA32_FEATURE_CONTROL bit permitting VMXON outside SMX operation.
const FEATURE_CONTROL_VMXON_OUTSIDE_SMX: u64 = 1 << 2;

/// The region activated by VMXON, one per logical processor.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
/// 25.11.5 VMXON Region
#[repr(C, align(4096))]
pub struct Vmxon {
    /// Must hold the revision identifier from IA32_VMX_BASIC before VMXON.
    pub revision_id: u32,

    pub data: [u8; BASE_PAGE_SIZE - 4],
}
const_assert_eq!(core::mem::size_of::<Vmxon>(), BASE_PAGE_SIZE);

impl Vmxon {
    /// Stamps the VMCS revision identifier reported by IA32_VMX_BASIC into
    /// the region. Bit 31 of the MSR is not part of the identifier.
    pub fn init<H: VmxHal>(&mut self, hal: &H) {
        self.revision_id = hal.rdmsr(msr::IA32_VMX_BASIC) as u32;
        self.revision_id.set_bit(31, false);
    }
}

/// Checks that this processor can enter VMX operation at all: the vendor must
/// be GenuineIntel and CPUID must report the VMX extension.
pub fn check_supported_cpu() -> Result<(), HypervisorError> {
    let cpuid = x86::cpuid::CpuId::new();

    let is_intel = cpuid
        .get_vendor_info()
        .map(|vendor| vendor.as_str() == "GenuineIntel")
        .unwrap_or(false);
    if !is_intel {
        return Err(HypervisorError::CPUUnsupported);
    }

    let has_vmx = cpuid
        .get_feature_info()
        .map(|feature| feature.has_vmx())
        .unwrap_or(false);
    if !has_vmx {
        return Err(HypervisorError::VMXUnsupported);
    }

    Ok(())
}

/// Makes IA32_FEATURE_CONTROL permit VMXON, locking it in the process.
///
/// Firmware usually locks this MSR at boot. If it is still unlocked, lock it
/// with VMXON-outside-SMX enabled; if it is locked with VMXON disabled, the
/// extension is off at a higher privilege boundary and VMXON would fail with
/// a #GP, so report [`HypervisorError::VmxBiosLock`] instead of attempting it.
pub fn adjust_feature_control_msr<H: VmxHal>(hal: &mut H) -> Result<(), HypervisorError> {
    let feature_control = hal.rdmsr(msr::IA32_FEATURE_CONTROL);

    if feature_control & FEATURE_CONTROL_LOCKED == 0 {
        hal.wrmsr(
            msr::IA32_FEATURE_CONTROL,
            feature_control | FEATURE_CONTROL_VMXON_OUTSIDE_SMX | FEATURE_CONTROL_LOCKED,
        );
    } else if feature_control & FEATURE_CONTROL_VMXON_OUTSIDE_SMX == 0 {
        return Err(HypervisorError::VmxBiosLock);
    }

    Ok(())
}

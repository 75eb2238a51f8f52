//! The VMCS region cleared and loaded by the root-mode lifecycle.
//!
//! Only the region layout lives here. Populating the guest/host/control
//! fields of the active VMCS is owned by the surrounding hypervisor and
//! happens after [`crate::intel::vmx::Vmx::enter_root_mode`] succeeds.

use {
    crate::intel::hal::VmxHal,
    bit_field::BitField,
    core::fmt,
    static_assertions::const_assert_eq,
    x86::{bits64::paging::BASE_PAGE_SIZE, msr},
};

/// One guest execution context's control structure, one page, physically
/// addressed by VMCLEAR/VMPTRLD.
#[repr(C, align(4096))]
pub struct Vmcs {
    /// Must match the revision identifier from IA32_VMX_BASIC.
    pub revision_id: u32,

    /// Written by the processor on a VMX abort.
    pub abort_indicator: u32,

    pub reserved: [u8; BASE_PAGE_SIZE - 8],
}
const_assert_eq!(core::mem::size_of::<Vmcs>(), BASE_PAGE_SIZE);

impl Vmcs {
    /// Stamps the VMCS revision identifier reported by IA32_VMX_BASIC into
    /// the region. Bit 31 of the MSR is not part of the identifier.
    pub fn init<H: VmxHal>(&mut self, hal: &H) {
        self.revision_id = hal.rdmsr(msr::IA32_VMX_BASIC) as u32;
        self.revision_id.set_bit(31, false);
    }
}

impl fmt::Debug for Vmcs {
    fn fmt(&self, format: &mut fmt::Formatter<'_>) -> fmt::Result {
        format
            .debug_struct("Vmcs")
            .field("Current VMCS: ", &(self as *const _))
            .field("Revision ID: ", &self.revision_id)
            .finish_non_exhaustive()
    }
}

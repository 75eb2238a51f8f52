//! Root-mode lifecycle: entering and leaving VMX operation on one logical
//! processor.
//!
//! The enter sequence is fixed by the hardware contract: set CR4.VMXE, force
//! the CR0/CR4 fixed bits, VMXON the on-region, VMCLEAR the VMCS, VMPTRLD the
//! VMCS. Each VMX instruction reports rejection through RFlags rather than a
//! fault, and a rejection part-way through leaves the processor in a state
//! this module does not remediate: the caller must treat the processor's
//! virtualization session as dead until an external cleanup path runs.
//!
//! Everything here is strictly processor-local. The caller is responsible for
//! pinning to the target processor and keeping interrupts/preemption out of
//! the way for the duration of a call.

use {
    crate::{
        error::HypervisorError,
        intel::{hal::VmxHal, vmcs::Vmcs, vmxon::Vmxon},
    },
    log::{debug, error},
    x86::msr,
};

/// Per-processor virtualization context, owned by the caller.
///
/// Holds the virtual and physical addresses of the two per-processor regions.
/// The virtual addresses must point at live, page-aligned regions for as long
/// as the context is in use; the physical addresses must map those same
/// regions, since they are handed directly to VMXON/VMCLEAR/VMPTRLD.
pub struct ProcessorContext {
    /// Logical processor index, used only to attribute log lines.
    pub processor_index: u32,

    pub vmxon_region: *mut Vmxon,

    pub vmxon_region_physical: u64,

    pub vmcs_region: *mut Vmcs,

    pub vmcs_region_physical: u64,
}

/// Drives one logical processor into and out of VMX root operation through an
/// injected hardware backend.
pub struct Vmx<H: VmxHal> {
    hal: H,
}

impl<H: VmxHal> Vmx<H> {
    pub fn new(hal: H) -> Self {
        Self { hal }
    }

    /// Forces CR0 into the value mandated by IA32_VMX_CR0_FIXED0/1.
    ///
    /// A bit set in FIXED0 must be 1; a bit clear in FIXED1 must be 0. The
    /// unique compliant value for the current register is
    /// `(cr0 | fixed0) & fixed1`.
    pub fn set_cr0_bits(&mut self) {
        let fixed0 = self.hal.rdmsr(msr::IA32_VMX_CR0_FIXED0);
        let fixed1 = self.hal.rdmsr(msr::IA32_VMX_CR0_FIXED1);

        let cr0 = adjust_fixed_bits(self.hal.read_cr0(), fixed0, fixed1);
        self.hal.write_cr0(cr0);
    }

    /// Forces CR4 into the value mandated by IA32_VMX_CR4_FIXED0/1.
    pub fn set_cr4_bits(&mut self) {
        let fixed0 = self.hal.rdmsr(msr::IA32_VMX_CR4_FIXED0);
        let fixed1 = self.hal.rdmsr(msr::IA32_VMX_CR4_FIXED1);

        let cr4 = adjust_fixed_bits(self.hal.read_cr4(), fixed0, fixed1);
        self.hal.write_cr4(cr4);
    }

    /// Ensures the fixed bits are set in CR0 and CR4, as the capability MSRs
    /// demand. Must run on the processor that will attempt VMXON, strictly
    /// before the attempt.
    pub fn set_fixed_bits(&mut self) {
        self.set_cr0_bits();
        self.set_cr4_bits();
    }

    /// Enters VMX root mode on the current processor.
    ///
    /// Enables CR4.VMXE, normalizes the control registers, then executes
    /// VMXON with the on-region, VMCLEAR with the VMCS region, and VMPTRLD
    /// with the same VMCS region. Returns `Ok` only if all three instructions
    /// succeeded. On failure the error names the rejected step; earlier
    /// successful steps are not rolled back, so a VMCLEAR/VMPTRLD failure
    /// leaves the processor in VMX operation with no usable VMCS.
    pub fn enter_root_mode(&mut self, context: &ProcessorContext) -> Result<(), HypervisorError> {
        // Make the VMX instruction set valid on this processor.
        self.hal.enable_vmx_operation();

        self.set_fixed_bits();

        debug!(
            "VmxonRegion[#{}]: (V) {:p} / (P) {:#x} [{}]",
            context.processor_index,
            context.vmxon_region,
            context.vmxon_region_physical,
            unsafe { (*context.vmxon_region).revision_id },
        );

        // RFlags.CF reports an unsuccessful VMXON: the region may already be
        // active, carry a stale revision identifier, or the extension may be
        // disabled at a higher privilege boundary.
        if let Err(e) = self.hal.vmxon(context.vmxon_region_physical) {
            error!("VMXON failed on processor {}: {:?}", context.processor_index, e);
            return Err(HypervisorError::VmxonFailed);
        }

        // Clear the VMCS before any configuration entry is written to it.
        if let Err(e) = self.hal.vmclear(context.vmcs_region_physical) {
            error!("VMCLEAR failed on processor {}: {:?}", context.processor_index, e);
            return Err(HypervisorError::VmclearFailed);
        }

        // Load the blank VMCS as the current one.
        if let Err(e) = self.hal.vmptrld(context.vmcs_region_physical) {
            error!("VMPTRLD failed on processor {}: {:?}", context.processor_index, e);
            return Err(HypervisorError::VmptrldFailed);
        }

        Ok(())
    }

    /// Leaves VMX root mode on the current processor.
    ///
    /// Clears the active VMCS, executes VMXOFF and drops CR4.VMXE. VMXOFF and
    /// the CR4 write always run, even when the clear fails; the clear failure
    /// is still reported, and a caller seeing it must treat the processor's
    /// virtualization session as unclean.
    pub fn exit_root_mode(&mut self, context: &ProcessorContext) -> Result<(), HypervisorError> {
        let cleared = self.hal.vmclear(context.vmcs_region_physical).map_err(|e| {
            error!("VMCLEAR failed on processor {}: {:?}", context.processor_index, e);
            HypervisorError::VmclearFailed
        });

        self.hal.vmxoff();
        self.hal.disable_vmx_operation();

        cleared
    }
}

/// The unique hardware-compliant value for a control register under a
/// must-be-1 / may-be-1 capability mask pair.
pub fn adjust_fixed_bits(value: u64, fixed0: u64, fixed1: u64) -> u64 {
    (value | fixed0) & fixed1
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloc::vec::Vec;
    use x86::{bits64::paging::BASE_PAGE_SIZE, vmx::VmFail};

    /// Which privileged operation a [`FakeVmxHal`] executed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum Op {
        EnableVmxOperation,
        DisableVmxOperation,
        WriteCr0,
        WriteCr4,
        Vmxon,
        Vmclear,
        Vmptrld,
        Vmxoff,
    }

    const CR4_VMXE: u64 = 1 << 13;

    /// A recording in-memory processor: register state plus programmable
    /// instruction outcomes.
    pub(crate) struct FakeVmxHal {
        pub cr0: u64,
        pub cr4: u64,
        pub vmx_basic: u64,
        pub feature_control: u64,
        pub cr0_fixed0: u64,
        pub cr0_fixed1: u64,
        pub cr4_fixed0: u64,
        pub cr4_fixed1: u64,
        pub fail_vmxon: bool,
        pub fail_vmclear: bool,
        pub fail_vmptrld: bool,
        pub ops: Vec<Op>,
    }

    impl FakeVmxHal {
        pub fn new() -> Self {
            Self {
                cr0: 0x8005_0033,
                cr4: 0x0000_06E0,
                vmx_basic: 0x0000_0001,
                feature_control: 0x5,
                // Representative mask pairs: PE/NE/PG mandatory in CR0,
                // VMXE mandatory in CR4, a handful of bits forbidden.
                cr0_fixed0: 0x8000_0021,
                cr0_fixed1: 0xFFFF_FFFF,
                cr4_fixed0: 0x0000_2000,
                cr4_fixed1: 0x0037_27FF,
                fail_vmxon: false,
                fail_vmclear: false,
                fail_vmptrld: false,
                ops: Vec::new(),
            }
        }
    }

    impl VmxHal for FakeVmxHal {
        fn read_cr0(&self) -> u64 {
            self.cr0
        }

        fn write_cr0(&mut self, value: u64) {
            self.cr0 = value;
            self.ops.push(Op::WriteCr0);
        }

        fn read_cr4(&self) -> u64 {
            self.cr4
        }

        fn write_cr4(&mut self, value: u64) {
            self.cr4 = value;
            self.ops.push(Op::WriteCr4);
        }

        fn rdmsr(&self, msr: u32) -> u64 {
            match msr {
                msr::IA32_VMX_BASIC => self.vmx_basic,
                msr::IA32_FEATURE_CONTROL => self.feature_control,
                msr::IA32_VMX_CR0_FIXED0 => self.cr0_fixed0,
                msr::IA32_VMX_CR0_FIXED1 => self.cr0_fixed1,
                msr::IA32_VMX_CR4_FIXED0 => self.cr4_fixed0,
                msr::IA32_VMX_CR4_FIXED1 => self.cr4_fixed1,
                _ => 0,
            }
        }

        fn wrmsr(&mut self, msr: u32, value: u64) {
            if msr == msr::IA32_FEATURE_CONTROL {
                self.feature_control = value;
            }
        }

        fn enable_vmx_operation(&mut self) {
            self.cr4 |= CR4_VMXE;
            self.ops.push(Op::EnableVmxOperation);
        }

        fn disable_vmx_operation(&mut self) {
            self.cr4 &= !CR4_VMXE;
            self.ops.push(Op::DisableVmxOperation);
        }

        fn vmxon(&mut self, _vmxon_region_pa: u64) -> Result<(), VmFail> {
            self.ops.push(Op::Vmxon);
            if self.fail_vmxon {
                Err(VmFail::VmFailInvalid)
            } else {
                Ok(())
            }
        }

        fn vmclear(&mut self, _vmcs_region_pa: u64) -> Result<(), VmFail> {
            self.ops.push(Op::Vmclear);
            if self.fail_vmclear {
                Err(VmFail::VmFailInvalid)
            } else {
                Ok(())
            }
        }

        fn vmptrld(&mut self, _vmcs_region_pa: u64) -> Result<(), VmFail> {
            self.ops.push(Op::Vmptrld);
            if self.fail_vmptrld {
                Err(VmFail::VmFailInvalid)
            } else {
                Ok(())
            }
        }

        fn vmxoff(&mut self) {
            self.ops.push(Op::Vmxoff);
        }
    }

    fn regions() -> (Vmxon, Vmcs) {
        (
            Vmxon {
                revision_id: 0,
                data: [0; BASE_PAGE_SIZE - 4],
            },
            Vmcs {
                revision_id: 0,
                abort_indicator: 0,
                reserved: [0; BASE_PAGE_SIZE - 8],
            },
        )
    }

    fn context(vmxon_region: &mut Vmxon, vmcs_region: &mut Vmcs) -> ProcessorContext {
        ProcessorContext {
            processor_index: 0,
            vmxon_region,
            vmxon_region_physical: 0x1000,
            vmcs_region,
            vmcs_region_physical: 0x2000,
        }
    }

    #[test]
    fn adjust_fixed_bits_satisfies_both_masks() {
        let cases = [
            (0x0000_0000, 0x8000_0021, 0xFFFF_FFFF),
            (0xFFFF_FFFF, 0x8000_0021, 0xFFFF_FFFF),
            (0x0000_06E0, 0x0000_2000, 0x0037_27FF),
            (0xDEAD_BEEF, 0x0000_2000, 0x0037_27FF),
        ];

        for (value, fixed0, fixed1) in cases {
            let adjusted = adjust_fixed_bits(value, fixed0, fixed1);
            assert_eq!(adjusted & fixed0, fixed0, "must-be-1 bits all set");
            assert_eq!(adjusted & !fixed1, 0, "may-be-1 zero bits all clear");
            // Normalizing an already-normalized value changes nothing.
            assert_eq!(adjust_fixed_bits(adjusted, fixed0, fixed1), adjusted);
        }
    }

    #[test]
    fn set_fixed_bits_writes_compliant_register_values() {
        let mut vmx = Vmx::new(FakeVmxHal::new());
        vmx.set_fixed_bits();

        let hal = &vmx.hal;
        assert_eq!(hal.cr0 & hal.cr0_fixed0, hal.cr0_fixed0);
        assert_eq!(hal.cr0 & !hal.cr0_fixed1, 0);
        assert_eq!(hal.cr4 & hal.cr4_fixed0, hal.cr4_fixed0);
        assert_eq!(hal.cr4 & !hal.cr4_fixed1, 0);
    }

    #[test]
    fn enter_then_exit_restores_the_vmxe_bit() {
        let (mut vmxon_region, mut vmcs_region) = regions();
        let context = context(&mut vmxon_region, &mut vmcs_region);

        let mut vmx = Vmx::new(FakeVmxHal::new());
        assert_eq!(vmx.hal.cr4 & CR4_VMXE, 0);

        assert_eq!(vmx.enter_root_mode(&context), Ok(()));
        assert_ne!(vmx.hal.cr4 & CR4_VMXE, 0);

        assert_eq!(vmx.exit_root_mode(&context), Ok(()));
        assert_eq!(vmx.hal.cr4 & CR4_VMXE, 0);
    }

    #[test]
    fn enter_executes_the_fixed_instruction_sequence() {
        let (mut vmxon_region, mut vmcs_region) = regions();
        let context = context(&mut vmxon_region, &mut vmcs_region);

        let mut vmx = Vmx::new(FakeVmxHal::new());
        assert_eq!(vmx.enter_root_mode(&context), Ok(()));

        assert_eq!(
            vmx.hal.ops,
            [
                Op::EnableVmxOperation,
                Op::WriteCr0,
                Op::WriteCr4,
                Op::Vmxon,
                Op::Vmclear,
                Op::Vmptrld,
            ]
        );
    }

    #[test]
    fn vmxon_failure_stops_before_the_vmcs_instructions() {
        let (mut vmxon_region, mut vmcs_region) = regions();
        let context = context(&mut vmxon_region, &mut vmcs_region);

        let mut hal = FakeVmxHal::new();
        hal.fail_vmxon = true;
        let mut vmx = Vmx::new(hal);

        assert_eq!(vmx.enter_root_mode(&context), Err(HypervisorError::VmxonFailed));
        assert!(!vmx.hal.ops.contains(&Op::Vmclear));
        assert!(!vmx.hal.ops.contains(&Op::Vmptrld));
    }

    #[test]
    fn vmclear_failure_stops_before_the_load() {
        let (mut vmxon_region, mut vmcs_region) = regions();
        let context = context(&mut vmxon_region, &mut vmcs_region);

        let mut hal = FakeVmxHal::new();
        hal.fail_vmclear = true;
        let mut vmx = Vmx::new(hal);

        assert_eq!(vmx.enter_root_mode(&context), Err(HypervisorError::VmclearFailed));
        assert!(vmx.hal.ops.contains(&Op::Vmxon));
        assert!(!vmx.hal.ops.contains(&Op::Vmptrld));
    }

    #[test]
    fn vmptrld_failure_is_reported_as_the_failing_step() {
        let (mut vmxon_region, mut vmcs_region) = regions();
        let context = context(&mut vmxon_region, &mut vmcs_region);

        let mut hal = FakeVmxHal::new();
        hal.fail_vmptrld = true;
        let mut vmx = Vmx::new(hal);

        assert_eq!(vmx.enter_root_mode(&context), Err(HypervisorError::VmptrldFailed));
    }

    #[test]
    fn exit_always_turns_vmx_off_even_when_the_clear_fails() {
        let (mut vmxon_region, mut vmcs_region) = regions();
        let context = context(&mut vmxon_region, &mut vmcs_region);

        let mut hal = FakeVmxHal::new();
        hal.fail_vmclear = true;
        let mut vmx = Vmx::new(hal);

        assert_eq!(vmx.exit_root_mode(&context), Err(HypervisorError::VmclearFailed));
        assert!(vmx.hal.ops.contains(&Op::Vmxoff));
        assert!(vmx.hal.ops.contains(&Op::DisableVmxOperation));
    }
}

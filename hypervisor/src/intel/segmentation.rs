//! Translation of the OS's segmentation state into the VMX descriptor format.
//!
//! The VMCS wants segment state in a layout of its own, populated from the
//! GDT entries the OS was already running with, so the guest keeps using the
//! same segments it had before the processor entered VMX operation. The same
//! translation, with the RPL normalized away, prepares the host-state
//! descriptors.

use {
    bitfield::bitfield,
    x86::{dtables::DescriptorTablePointer, segmentation::SegmentSelector},
};

bitfield! {
    /// One 8-byte code/data segment descriptor in an OS descriptor table.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 3.4.5 Segment Descriptors
    #[derive(Clone, Copy)]
    pub struct SegmentDescriptor64(u64);
    impl Debug;

    pub segment_limit_low, _: 15, 0;
    pub base_address_low, _: 31, 16;
    pub base_address_middle, _: 39, 32;
    pub segment_type, _: 43, 40;
    pub descriptor_type, _: 44;
    pub descriptor_privilege_level, _: 46, 45;
    pub present, _: 47;
    pub segment_limit_high, _: 51, 48;
    pub available, _: 52;
    pub long_mode, _: 53;
    pub default_big, _: 54;
    pub granularity, _: 55;
    pub base_address_high, _: 63, 56;
}

bitfield! {
    /// Segment access rights in the layout the VMCS expects.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 25-2. Format of Access Rights
    #[derive(Clone, Copy, Default)]
    pub struct VmxSegmentAccessRights(u32);
    impl Debug;

    pub segment_type, set_segment_type: 3, 0;
    pub descriptor_type, set_descriptor_type: 4;
    pub descriptor_privilege_level, set_descriptor_privilege_level: 6, 5;
    pub present, set_present: 7;
    pub available, set_available: 12;
    pub long_mode, set_long_mode: 13;
    pub default_big, set_default_big: 14;
    pub granularity, set_granularity: 15;
    /// Set when the segment register holds no live segment; the processor
    /// skips most checks on an unusable segment at VM entry.
    pub unusable, set_unusable: 16;
}

/// The per-segment record embedded into the VMCS guest/host state.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmxSegmentDescriptor {
    pub selector: u16,
    pub base_address: u64,
    pub segment_limit: u32,
    pub access_rights: VmxSegmentAccessRights,
}

impl VmxSegmentDescriptor {
    /// Builds the VMX segment record for one segment selector from the
    /// descriptor table addressed by `gdtr`.
    ///
    /// A null selector, a selector whose table-indicator bit points away from
    /// the GDT, or an index past the table's limit cannot name a live GDT
    /// segment: the record is marked unusable, and the remaining fields are
    /// still populated from whatever the index decodes to (an absent entry
    /// decodes as all zeroes), matching the hardware's tolerance for unusable
    /// segments. No failure is signaled.
    ///
    /// `clear_rpl` zeroes the requested privilege level before the selector
    /// is copied out, which keeps the hypervisor's own host-state selectors
    /// uniformly at privilege level 0.
    ///
    /// The caller guarantees `gdtr` describes a readable descriptor table.
    pub fn from_selector(
        mut selector: SegmentSelector,
        gdtr: &DescriptorTablePointer<u64>,
        clear_rpl: bool,
    ) -> Self {
        let mut descriptor = Self::default();

        // Index is a count of 8-byte slots from the table base.
        let table =
            unsafe { core::slice::from_raw_parts(gdtr.base, (gdtr.limit as usize + 1) / 8) };
        let entry = table.get(selector.index() as usize).copied();

        let unusable = selector.bits() == 0
            || selector.contains(SegmentSelector::TI_LDT)
            || entry.is_none();

        let entry = SegmentDescriptor64(entry.unwrap_or(0));

        // The base is split across three fields of the OS descriptor. The
        // VMCS field is wider, but carries at most a 32-bit base here.
        descriptor.base_address = ((entry.base_address_high() << 24)
            | (entry.base_address_middle() << 16)
            | entry.base_address_low())
            & 0xFFFF_FFFF;

        // 20-bit limit from the two limit fields.
        descriptor.segment_limit =
            ((entry.segment_limit_high() << 16) | entry.segment_limit_low()) as u32;

        if clear_rpl {
            selector = SegmentSelector::from_raw(selector.bits() & !0b11);
        }
        descriptor.selector = selector.bits();

        descriptor.access_rights.set_segment_type(entry.segment_type() as u32);
        descriptor.access_rights.set_descriptor_type(entry.descriptor_type());
        descriptor
            .access_rights
            .set_descriptor_privilege_level(entry.descriptor_privilege_level() as u32);
        descriptor.access_rights.set_present(entry.present());
        descriptor.access_rights.set_available(entry.available());
        descriptor.access_rights.set_long_mode(entry.long_mode());
        descriptor.access_rights.set_default_big(entry.default_big());
        descriptor.access_rights.set_granularity(entry.granularity());

        descriptor.access_rights.set_unusable(unusable);

        descriptor
    }
}

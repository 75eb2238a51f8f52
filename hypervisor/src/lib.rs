//! Root-mode lifecycle and segment-state translation core for an Intel VT-x hypervisor.
//!
//! This crate owns three things and nothing else: forcing CR0/CR4 into the
//! VMX-compliant values mandated by the fixed-bit capability MSRs, driving a
//! logical processor into and out of VMX root operation (VMXON / VMCLEAR /
//! VMPTRLD on entry, VMCLEAR / VMXOFF on exit), and translating the OS's GDT
//! entries into the segment descriptor format the VMCS expects. Region
//! allocation, multi-processor dispatch, VMCS field population and VM-exit
//! handling all live with the caller.

#![no_std]

extern crate alloc;
extern crate static_assertions;

pub mod error;
pub mod intel;
pub mod logger;

//! Intel VT-x specific parts of the core: the hardware abstraction, the
//! VMXON/VMCS region types, the root-mode lifecycle and segment translation.

pub mod hal;
pub mod segmentation;
pub mod support;
pub mod vmcs;
pub mod vmx;
pub mod vmxon;

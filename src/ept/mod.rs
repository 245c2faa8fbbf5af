//! The extended page table engine: identity-mapped guest-physical memory,
//! on-demand 2MB-to-4KB splitting, and the hooking machinery built on top
//! of it.
//!
//! Grounded on `header/vmm/ept/Ept.h`.

pub mod hooks;
pub mod mtrr;
pub mod table;

pub use hooks::{BreakpointDescriptor, DetourHookDetails, HookEngine, HookedPageDetail};
pub use mtrr::{MemoryType, MtrrRangeDescriptor};
pub use table::{EptEntry, EptPageTable};

/// The last kind of access that triggered a violation on a hooked page.
///
/// Mirrors `EPT_HOOKED_LAST_VIOLATION`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LastViolation {
    /// The most recent violation was a read.
    Read,
    /// The most recent violation was a write.
    Write,
    /// The most recent violation was an instruction fetch.
    Exec,
}

/// The raw exit-qualification bits this crate cares about from an EPT
/// violation VM-exit, independent of how the host's VMCS access layer
/// represents them.
#[derive(Clone, Copy, Debug, Default)]
pub struct ViolationQualification {
    /// The violating access was a read.
    pub read_access: bool,
    /// The violating access was a write.
    pub write_access: bool,
    /// The violating access was an instruction fetch.
    pub execute_access: bool,
    /// A valid guest-linear address is associated with the violation.
    pub linear_address_valid: bool,
}

//! The crate-wide error type.
//!
//! Every fallible operation in this crate returns [`HvResult`]. Nothing here
//! panics or unwinds; callers running in VMX-root mode cannot afford either.

use core::fmt;

/// The result type used throughout this crate.
pub type HvResult<T> = Result<T, HvError>;

/// The error taxonomy shared by every component, matching the wire-level
/// error codes reported back to the debugger client.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HvError {
    /// [`crate::pool`] ran out of pre-reserved blocks of the requested intent.
    OutOfMemory,
    /// An operation valid only from non-root (or only from root) mode was
    /// attempted from the other side.
    Misuse,
    /// [`crate::mem_mapper`] walked a page table entry that was not present.
    NotPresent,
    /// [`crate::ept::hooks`] was asked to hook a page that already carries a
    /// hook of an incompatible kind.
    AlreadyHooked,
    /// Splitting a 2MB EPT entry into a 4KB table failed.
    UnsplitFailed,
    /// A breakpoint-slot or callback-slot index fell outside its fixed array.
    OutOfRange,
    /// [`crate::ept::hooks`] ran out of pre-allocated `VMM_EPT_DYNAMIC_SPLIT`
    /// or `EPT_HOOKED_PAGE_DETAIL` blocks.
    OutOfPreallocatedPool,
    /// Registering an event failed validation; see [`EventParsingError`].
    EventParsing(EventParsingError),
    /// The current logical processor does not support the EPT/VT-x features
    /// this crate requires.
    VirtualizationUnsupported,
    /// MTRR enumeration produced more ranges than this crate can represent.
    EptMtrrFailed,
    /// The serial wire protocol received a frame that failed its checksum
    /// or carried an unrecognized type/action pair.
    ProtocolViolation,
    /// A halt/resume broadcast was asked to synchronize without also
    /// relocking the target core, which would deadlock.
    InvalidHaltRequest,
    /// A request named a tag, thread, or breakpoint that is not currently
    /// registered.
    NotFound,
    /// A requested baud rate is not one of [`crate::config::ALLOWED_BAUD_RATES`].
    InvalidBaudrate,
    /// A requested COM port is not one of [`crate::config::ALLOWED_COM_PORTS`].
    InvalidSerialPort,
}

/// Reasons `DebuggerEventListValidation` rejects an event registration,
/// named after the checks `ValidateEvents.c` performs.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventParsingError {
    /// An exception event named a vector beyond the first 32 IDT entries.
    ExceptionIndexExceedsFirst32Entries,
    /// An external-interrupt event named a vector outside the valid range.
    InterruptIndexInvalid,
    /// `event_stage` and the event's kind disagree on supported stages.
    ModeExecutionInvalid,
    /// A monitor/hook event named an address that cannot be canonical.
    InvalidAddress,
    /// A process-scoped event was registered while the caller was in root
    /// mode, where no process context is available to resolve it against.
    ProcessIdCannotBeSpecifiedFromRoot,
    /// Short-circuiting was requested on a stage that does not support it.
    UsingShortCircuitingInPostEvents,
}

impl fmt::Display for HvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of pre-reserved pool memory"),
            Self::Misuse => write!(f, "operation not valid in the caller's current mode"),
            Self::NotPresent => write!(f, "page table entry not present"),
            Self::AlreadyHooked => write!(f, "page already carries an incompatible hook"),
            Self::UnsplitFailed => write!(f, "failed to split a 2MB EPT entry"),
            Self::OutOfRange => write!(f, "index outside its fixed-size array"),
            Self::OutOfPreallocatedPool => write!(f, "ran out of pre-allocated hook bookkeeping blocks"),
            Self::EventParsing(cause) => write!(f, "event registration rejected: {cause:?}"),
            Self::VirtualizationUnsupported => write!(f, "processor lacks required virtualization features"),
            Self::EptMtrrFailed => write!(f, "MTRR enumeration exceeded the supported range count"),
            Self::ProtocolViolation => write!(f, "malformed serial protocol frame"),
            Self::InvalidHaltRequest => write!(f, "synchronized halt broadcast without relocking the core"),
            Self::NotFound => write!(f, "no entry registered under the requested identifier"),
            Self::InvalidBaudrate => write!(f, "baud rate outside the supported set"),
            Self::InvalidSerialPort => write!(f, "COM port outside the supported set"),
        }
    }
}

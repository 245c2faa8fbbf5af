//! Compile-time constants shared across the crate.
//!
//! Collects tunables in one place instead of scattering magic numbers
//! through the modules that use them.

/// Minimum level of log record that reaches the UART sink.
pub(crate) const LOGGING_LEVEL: log::LevelFilter = log::LevelFilter::Trace;

/// Page size, x86-64.
pub const PAGE_SIZE: usize = 0x1000;

/// Bytes in a 2MB large page, the granularity of the identity-mapped EPT
/// before a hook forces a split.
pub const SIZE_2MB: usize = 512 * PAGE_SIZE;

/// Entries per EPT paging structure level (PML4/PML3/PML2/PML1 all hold 512).
pub const EPT_ENTRY_COUNT: usize = 512;

/// Maximum number of MTRR ranges `EptBuildMtrrMap` can represent.
pub const MTRR_RANGE_MAX: usize = 9;

/// Maximum number of hidden breakpoints tracked on a single hooked page.
pub const MAX_HIDDEN_BREAKPOINTS_ON_PAGE: usize = 40;

/// Depth of the bounded root-mode allocation/deallocation request queue.
pub const MAX_QUEUE_DEPTH: usize = 512;

/// Seed counts for [`crate::pool::RootPool::new`], matching
/// `PoolManagerInitialize`'s initial reservation for each intent.
pub mod pool_seed {
    /// Pre-split 4KB page tables reserved for `SplitTo4Kb`.
    pub const SPLIT_2MB_TO_4KB: usize = 5;
    /// `EPT_HOOKED_PAGE_DETAIL` blocks reserved for `TrackHookedPages`.
    pub const TRACKING_HOOKED_PAGES: usize = 5;
    /// Trampoline buffers reserved for `ExecTrampoline`.
    pub const EXEC_TRAMPOLINE: usize = 5;
    /// Detour bookkeeping blocks reserved for `DetourHookDetails`.
    pub const DETOUR_HOOK_DETAILS: usize = 5;
    /// Maximum breakpoints outstanding without a continue, bounding the
    /// `BreakpointDefinitionStructure` intent's seed count.
    pub const MAXIMUM_BREAKPOINTS_WITHOUT_CONTINUE: usize = 0x3e8;
    /// Blocks reserved for regular-sized instant event payloads.
    pub const INSTANT_EVENT_REGULAR: usize = 10;
    /// Blocks reserved for oversized instant event payloads.
    pub const INSTANT_EVENT_BIG: usize = 5;
    /// Blocks reserved for regular-sized instant action payloads.
    pub const INSTANT_ACTION_REGULAR: usize = 10;
    /// Blocks reserved for oversized instant action payloads.
    pub const INSTANT_ACTION_BIG: usize = 5;
}

/// Maximum size, in bytes, of an inline-trampoline detour.
pub const MAX_EXEC_TRAMPOLINE_SIZE: usize = 0x100;

/// Maximum size, in bytes, of a regular-sized instant event or action
/// payload handed across the serial link inline with its packet header.
pub const MAX_INSTANT_REGULAR_SIZE: usize = 0x400;

/// Maximum size, in bytes, of an oversized instant event or action payload,
/// used when the regular allotment is too small (e.g. a long condition or
/// action script).
pub const MAX_INSTANT_BIG_SIZE: usize = 0x4000;

/// Baud rates the serial transport accepts, matching the original's
/// allow-list of standard PC UART rates.
pub const ALLOWED_BAUD_RATES: &[u32] = &[
    110, 300, 600, 1200, 2400, 4800, 9600, 14400, 19200, 38400, 56000, 57600, 115200, 128000, 256000,
];

/// Magic value every [`crate::serial::packet::PacketHeader`] carries in its
/// `indicator` field, checked on receipt before a frame is trusted. Chosen
/// arbitrarily (the original's build does not publish its constant); any
/// fixed 64-bit value works equally well as a desynchronization guard.
pub const PACKET_INDICATOR: u64 = 0x4848_4442_4447_4844;

/// COM port indexes (1-based) the serial transport accepts.
pub const ALLOWED_COM_PORTS: &[u8] = &[1, 2, 3, 4];

/// The four-byte sentinel that terminates every serial frame.
pub const SERIAL_END_OF_BUFFER: [u8; 4] = [0x10, 0x20, 0x30, 0x40];

/// Largest frame `SerialProtocol` will buffer before declaring the stream
/// desynchronized.
pub const SERIAL_MAX_FRAME: usize = 0x1000;

//! The kernel-mode debugger engine: EPT hooking, event dispatch, and the
//! serial control protocol.
//!
//! This crate is the host-independent core of a kernel-level debugger's
//! hypervisor layer. It owns the data structures and algorithms VM-exit
//! handlers need — the event registry, the EPT hook engine, the root-mode
//! allocator, multi-core halt coordination, SYSCALL/SYSRET emulation, and
//! the serial wire protocol to a remote debugger client — but not VMX
//! bring-up, VM-exit dispatch itself, or any of the platform plumbing
//! (`VMXON`/`VMXOFF`, IDT/GDT setup, raw NMI delivery) that differs between
//! host environments. Those are supplied by the embedding driver through the
//! trait seams this crate defines ([`halt::NmiSender`],
//! [`broadcast::DpcBroadcaster`], [`events::dispatch::ScriptHost`],
//! [`serial::kd_controller::GuestMemoryAccess`], [`syscall::MsrReader`],
//! [`syscall::GuestMemoryReader`], [`serial::SerialTransport`]), the same
//! way VMX/SVM bring-up sits behind a `HardwareVt` trait one layer down.
//!
//! `no_std` except under `cfg(test)`, where `std` is linked in so each
//! module's `#[cfg(test)] mod tests` can use it directly.

#![cfg_attr(not(test), no_std)]
#![allow(clippy::module_name_repetitions)]

extern crate alloc;

mod arena;
mod x86_instructions;

pub mod broadcast;
pub mod config;
pub mod context;
pub mod core_state;
pub mod ept;
pub mod error;
pub mod events;
pub mod halt;
pub mod logger;
pub mod mem_mapper;
pub mod pool;
pub mod protected_hv;
pub mod serial;
pub mod syscall;

pub use context::VmmContext;
pub use core_state::CoreState;
pub use error::{HvError, HvResult};

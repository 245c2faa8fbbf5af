//! Serial transport, framing, and packet dispatch between the debuggee and
//! the remote debugger.
//!
//! Grounded on `SerialConnection.c`, `Debugger.h`, and `HaltedCore.c`.

pub mod kd_controller;
pub mod packet;
pub mod transport;

pub use kd_controller::{GuestMemoryAccess, IncomingPacket, KdController, OutgoingPacket, RequestedAction};
pub use packet::{FrameReader, PacketHeader, PacketType};
pub use transport::{check_baud_rate, ComPort, ComPortTransport, SerialTransport};

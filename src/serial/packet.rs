//! Framing for the byte stream running over the debuggee's serial link.
//!
//! There is no length-prefix or checksum on the wire: a frame is just a run
//! of payload bytes followed by a fixed four-byte sentinel
//! ([`SERIAL_END_OF_BUFFER`]), the same as `SerialConnectionSend` /
//! `SerialConnectionCheckForTheEndOfTheBuffer`. The receiver keeps appending
//! bytes to its buffer until it sees the sentinel trailing what it has
//! collected so far, then strips it.
//!
//! Grounded on `SerialConnection.c`.

use crate::config::{PACKET_INDICATOR, SERIAL_END_OF_BUFFER, SERIAL_MAX_FRAME};
use crate::error::{HvError, HvResult};
use alloc::vec::Vec;

/// Direction and privilege level a packet travels between, matching
/// `DEBUGGER_REMOTE_PACKET_TYPE`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketType {
    /// Debugger to debuggee, to be handled while the debuggee is in VMX-root
    /// mode.
    DebuggerToDebuggeeRoot = 1,
    /// Debugger to debuggee, to be handled from the debuggee's user-mode
    /// companion process.
    DebuggerToDebuggeeUser = 2,
    /// Debuggee to debugger.
    DebuggeeToDebugger = 3,
}

impl PacketType {
    fn from_u32(value: u32) -> HvResult<Self> {
        match value {
            1 => Ok(Self::DebuggerToDebuggeeRoot),
            2 => Ok(Self::DebuggerToDebuggeeUser),
            3 => Ok(Self::DebuggeeToDebugger),
            _ => Err(HvError::ProtocolViolation),
        }
    }
}

/// The fixed-size header prefixing every serial packet's payload, mirroring
/// `_DEBUGGER_REMOTE_PACKET`'s `Checksum`/`Indicator`/`TypeOfThePacket`/
/// `RequestedActionOfThePacket` fields.
///
/// `action` is left as a raw `u32` here: which enum it decodes into (a
/// `kd_controller::RequestedAction` variant, or one of the user-mode-only
/// action codes this crate does not interpret) depends on `packet_type`,
/// decided by the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub checksum: u8,
    pub indicator: u64,
    pub packet_type: PacketType,
    pub action: u32,
}

const HEADER_LEN: usize = 1 + 8 + 4 + 4;

impl PacketHeader {
    /// Computes the checksum `SerialConnectionSend` covers a packet with:
    /// a byte-wise sum over the indicator, type, action, and payload fields,
    /// truncated to one byte. The checksum field itself is never summed.
    pub fn compute_checksum(packet_type: PacketType, action: u32, payload: &[u8]) -> u8 {
        let mut sum: u8 = 0;
        for byte in PACKET_INDICATOR.to_le_bytes() {
            sum = sum.wrapping_add(byte);
        }
        for byte in (packet_type as u32).to_le_bytes() {
            sum = sum.wrapping_add(byte);
        }
        for byte in action.to_le_bytes() {
            sum = sum.wrapping_add(byte);
        }
        for &byte in payload {
            sum = sum.wrapping_add(byte);
        }
        sum
    }

    /// Builds a header for an outbound packet, computing its checksum over
    /// `payload`.
    pub fn new(packet_type: PacketType, action: u32, payload: &[u8]) -> Self {
        Self {
            checksum: Self::compute_checksum(packet_type, action, payload),
            indicator: PACKET_INDICATOR,
            packet_type,
            action,
        }
    }

    /// Serializes the header in wire order, little-endian, matching the C
    /// struct's natural layout on x86-64.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.checksum);
        out.extend_from_slice(&self.indicator.to_le_bytes());
        out.extend_from_slice(&(self.packet_type as u32).to_le_bytes());
        out.extend_from_slice(&self.action.to_le_bytes());
    }

    /// Parses a header off the front of `frame` and validates its indicator
    /// and checksum against the trailing `payload` bytes, returning the
    /// header and the remaining payload slice.
    ///
    /// Mirrors the rejection path in `SerialConnectionRecvBuffer` when the
    /// indicator or checksum does not match.
    pub fn decode(frame: &[u8]) -> HvResult<(Self, &[u8])> {
        if frame.len() < HEADER_LEN {
            return Err(HvError::ProtocolViolation);
        }
        let checksum = frame[0];
        let indicator = u64::from_le_bytes(frame[1..9].try_into().unwrap());
        let packet_type_raw = u32::from_le_bytes(frame[9..13].try_into().unwrap());
        let action = u32::from_le_bytes(frame[13..17].try_into().unwrap());
        let payload = &frame[HEADER_LEN..];

        if indicator != PACKET_INDICATOR {
            return Err(HvError::ProtocolViolation);
        }
        let packet_type = PacketType::from_u32(packet_type_raw)?;
        if checksum != Self::compute_checksum(packet_type, action, payload) {
            return Err(HvError::ProtocolViolation);
        }

        Ok((
            Self { checksum, indicator, packet_type, action },
            payload,
        ))
    }
}

/// Accumulates inbound bytes into complete frames.
///
/// Mirrors the loop body of `SerialConnectionRecvBuffer`.
#[derive(Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
}

impl FrameReader {
    pub const fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feeds one received byte in. Returns the completed frame (sentinel
    /// already stripped) once the sentinel is seen, or `None` if more bytes
    /// are still needed.
    pub fn push_byte(&mut self, byte: u8) -> HvResult<Option<Vec<u8>>> {
        if self.buffer.len() >= SERIAL_MAX_FRAME {
            self.buffer.clear();
            return Err(HvError::ProtocolViolation);
        }
        self.buffer.push(byte);

        if self.buffer.len() < SERIAL_END_OF_BUFFER.len() {
            return Ok(None);
        }

        let tail = &self.buffer[self.buffer.len() - SERIAL_END_OF_BUFFER.len()..];
        if tail == SERIAL_END_OF_BUFFER {
            let payload_len = self.buffer.len() - SERIAL_END_OF_BUFFER.len();
            let frame = self.buffer.drain(..payload_len).collect();
            self.buffer.clear();
            Ok(Some(frame))
        } else {
            Ok(None)
        }
    }

    /// Discards whatever partial frame has been accumulated so far, used
    /// when desynchronization is detected upstream.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

/// Appends the four-byte end-of-buffer sentinel `payload` should be
/// followed by on the wire.
///
/// Mirrors `SerialConnectionSendEndOfBuffer`.
pub fn append_frame_terminator(payload: &mut Vec<u8>) {
    payload.extend_from_slice(&SERIAL_END_OF_BUFFER);
}

/// Checks that `payload`, once framed, will not exceed [`SERIAL_MAX_FRAME`].
///
/// Mirrors the bounds checks in `SerialConnectionSend` /
/// `SerialConnectionSendTwoBuffers` / `SerialConnectionSendThreeBuffers`,
/// generalized to an arbitrary number of concatenated buffers.
pub fn check_outbound_size(buffers: &[&[u8]]) -> HvResult<()> {
    let total: usize = buffers.iter().map(|b| b.len()).sum::<usize>() + SERIAL_END_OF_BUFFER.len();
    if total > SERIAL_MAX_FRAME {
        return Err(HvError::ProtocolViolation);
    }
    Ok(())
}

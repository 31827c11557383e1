// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Named bit positions shared between the AT context FSM and the register
//! fakes used in tests. One source of truth instead of scattering magic
//! numbers through `context.rs` and `ar.rs`, per spec §6.

/// `ContextControl` / `ContextControlSet` / `ContextControlClear` bits
/// (OHCI 1.1 §3.1.1, §6.7, §7.1, §7.2, §9.4).
pub const RUN_BIT: u32 = 1 << 15;
pub const WAKE_BIT: u32 = 1 << 12;
pub const ACTIVE_BIT: u32 = 1 << 13;
pub const DEAD_BIT: u32 = 1 << 5;
/// Event code occupies the low 5 bits of ContextControl.
pub const EVENT_CODE_MASK: u32 = 0x1f;

/// Acknowledge codes carried back from the target in the AT completion
/// status word (IEEE 1394-1995 §6.2.4, OHCI 1.1 Table 3-2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCode {
    Complete = 0x0,
    Pending = 0x1,
    BusyX = 0x4,
    BusyA = 0x5,
    BusyB = 0x6,
    Tardy = 0xC,
    Conflict = 0x9,
    DataError = 0xD,
    TypeError = 0xE,
    /// Agere/LSI controllers have been observed reporting 0x10 where the
    /// OHCI table calls for `ack_complete`; spec §9 open question: treated
    /// as `ack_complete` here, but a per-controller quirk table may be
    /// needed for other silicon.
    AgereQuirkComplete = 0x10,
    Other(u8),
}

impl AckCode {
    pub const fn from_raw(raw: u8) -> Self {
        match raw & 0xf {
            0x0 => AckCode::Complete,
            0x1 => AckCode::Pending,
            0x4 => AckCode::BusyX,
            0x5 => AckCode::BusyA,
            0x6 => AckCode::BusyB,
            0x9 => AckCode::Conflict,
            0xC => AckCode::Tardy,
            0xD => AckCode::DataError,
            0xE => AckCode::TypeError,
            _ => AckCode::Other(raw),
        }
    }

    /// "Slow" acks: the target has accepted the request and a response is
    /// expected on the AR path. Includes the Agere 0x10 quirk per spec §9
    /// and 0x1B (`ack_tardy` restated with the high nibble set, as seen on
    /// some controllers' raw status words).
    pub const fn is_tardy_like(self) -> bool {
        matches!(
            self,
            AckCode::Tardy | AckCode::AgereQuirkComplete | AckCode::Other(0x1B)
        )
    }

    pub const fn is_busy(self) -> bool {
        matches!(self, AckCode::BusyX | AckCode::BusyA | AckCode::BusyB)
    }
}

/// Hardware event codes reported in the low 5 bits of a descriptor's
/// `xferStatus` / a context's `ContextControl` (OHCI 1.1 Table 3-2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCode {
    NoStatus = 0x00,
    LongPacket = 0x02,
    MissingAck = 0x03,
    Underrun = 0x04,
    Overrun = 0x05,
    DescriptorRead = 0x06,
    DataRead = 0x07,
    DataWrite = 0x08,
    BusReset = 0x09,
    Timeout = 0x0A,
    TcodeErr = 0x0B,
    Unknown = 0x0E,
    Flushed = 0x0F,
    Other(u8),
}

impl EventCode {
    pub const fn from_raw(raw: u8) -> Self {
        match raw & 0x1f {
            0x00 => EventCode::NoStatus,
            0x02 => EventCode::LongPacket,
            0x03 => EventCode::MissingAck,
            0x04 => EventCode::Underrun,
            0x05 => EventCode::Overrun,
            0x06 => EventCode::DescriptorRead,
            0x07 => EventCode::DataRead,
            0x08 => EventCode::DataWrite,
            0x09 => EventCode::BusReset,
            0x0A => EventCode::Timeout,
            0x0B => EventCode::TcodeErr,
            0x0E => EventCode::Unknown,
            0x0F => EventCode::Flushed,
            other => EventCode::Other(other),
        }
    }

    /// Terminal hardware faults per spec §7 ("Hardware error" taxonomy).
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            EventCode::DescriptorRead | EventCode::TcodeErr | EventCode::Unknown
        )
    }
}

/// IEEE 1394 transaction codes handled by this core (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TCode {
    WriteQuadlet = 0x0,
    WriteBlock = 0x1,
    WriteResponse = 0x2,
    ReadQuadlet = 0x4,
    ReadBlock = 0x5,
    ReadQuadletResponse = 0x6,
    ReadBlockResponse = 0x7,
    LockRequest = 0x9,
    LockResponse = 0xB,
    Phy = 0xE,
}

impl TCode {
    pub const fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw & 0xf {
            0x0 => TCode::WriteQuadlet,
            0x1 => TCode::WriteBlock,
            0x2 => TCode::WriteResponse,
            0x4 => TCode::ReadQuadlet,
            0x5 => TCode::ReadBlock,
            0x6 => TCode::ReadQuadletResponse,
            0x7 => TCode::ReadBlockResponse,
            0x9 => TCode::LockRequest,
            0xB => TCode::LockResponse,
            0xE => TCode::Phy,
            _ => return None,
        })
    }

    /// True for tcodes carrying a request header + payload rather than a
    /// header-only quadlet operation (spec §4.4 item 3).
    pub const fn carries_payload(self) -> bool {
        matches!(
            self,
            TCode::WriteBlock
                | TCode::LockRequest
                | TCode::ReadBlockResponse
                | TCode::LockResponse
        )
    }

    /// True for tcodes needing a fourth header quadlet carrying a
    /// length/extended-opcode word, independent of whether the packet
    /// itself carries trailing payload bytes -- a block-read request asks
    /// for a length but carries no bytes of its own (spec §4.4 item 3).
    pub const fn has_length_quadlet(self) -> bool {
        matches!(
            self,
            TCode::WriteBlock
                | TCode::ReadBlock
                | TCode::ReadBlockResponse
                | TCode::LockRequest
                | TCode::LockResponse
        )
    }

    pub const fn is_read(self) -> bool {
        matches!(self, TCode::ReadQuadlet | TCode::ReadBlock)
    }
}

/// Synthetic bus-reset packet: tcode 0xE (PHY) with event code 0x09
/// (`evt_bus_reset`), delivered on the AR-Request context per spec §4.6.
pub const SYNTHETIC_BUS_RESET_EVENT: u8 = EventCode::BusReset as u8;

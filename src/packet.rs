// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! IEEE 1394 async request/response packet headers, built in host byte
//! order for the AT immediate-descriptor payload (spec §4.4).
//!
//! Quadlet 0 layout (all async request/response packets):
//! `destID[31:16] | tLabel[15:10] | rt[9:8] | tCode[7:4] | priority[3:0]`.
//! Quadlet 1 is `srcID[31:16] | destinationOffsetHigh[15:0]`, quadlet 2 the
//! low 32 bits of the 48-bit offset. Block/lock requests add a data-length
//! quadlet with an extended tcode in its low 16 bits.

use crate::ohci_regs::TCode;

/// Maximum header length in quadlets: block/lock requests carry 4 header
/// quadlets (destID/tLabel/tcode, srcID/offsetHi, offsetLo, length/extTcode).
pub const MAX_HEADER_QUADLETS: usize = 4;
pub const MAX_HEADER_BYTES: usize = MAX_HEADER_QUADLETS * 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOp {
    MaskSwap = 1,
    CompareSwap = 2,
    FetchAdd = 3,
    LittleAdd = 4,
    BoundedAdd = 5,
    WrapAdd = 6,
}

/// Parameters needed to build any request header this engine emits (spec
/// §4.4 item 3, §6 `Read`/`Write`/`Lock`).
#[derive(Debug, Clone, Copy)]
pub struct HeaderParams {
    pub destination_id: u16,
    pub source_id: u16,
    pub t_label: u8,
    pub retry: u8,
    pub tcode: TCode,
    pub priority: u8,
    pub offset: u64,
    pub data_length: u16,
    pub extended_tcode: Option<LockOp>,
}

/// Fixed-capacity header buffer, filled in place and sliced to its actual
/// length -- mirrors the original's `uint8_t headerBuffer[20]` stack buffer.
#[derive(Debug, Clone, Copy)]
pub struct HeaderBuffer {
    bytes: [u8; MAX_HEADER_BYTES],
    len: usize,
}

impl HeaderBuffer {
    pub const fn empty() -> Self {
        Self {
            bytes: [0; MAX_HEADER_BYTES],
            len: 0,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    fn push_quadlet(&mut self, q: u32) {
        let start = self.len;
        self.bytes[start..start + 4].copy_from_slice(&q.to_be_bytes());
        self.len += 4;
    }
}

/// Builds the header for `params` in the original's "host order, big-endian
/// on the wire" convention -- the AT descriptor's immediate data is copied
/// verbatim by hardware, so the bytes here must already be bus byte order.
pub fn build_header(params: &HeaderParams) -> HeaderBuffer {
    let mut buf = HeaderBuffer::empty();

    let quadlet0 = ((params.destination_id as u32) << 16)
        | ((params.t_label as u32 & 0x3F) << 10)
        | ((params.retry as u32 & 0x3) << 8)
        | ((params.tcode as u32 & 0xF) << 4)
        | (params.priority as u32 & 0xF);
    buf.push_quadlet(quadlet0);

    let offset_hi = ((params.offset >> 32) & 0xFFFF) as u32;
    let quadlet1 = ((params.source_id as u32) << 16) | offset_hi;
    buf.push_quadlet(quadlet1);

    let offset_lo = (params.offset & 0xFFFF_FFFF) as u32;
    buf.push_quadlet(offset_lo);

    if params.tcode.has_length_quadlet() || params.extended_tcode.is_some() {
        let ext = params.extended_tcode.map(|op| op as u32).unwrap_or(0);
        let quadlet3 = ((params.data_length as u32) << 16) | ext;
        buf.push_quadlet(quadlet3);
    } else if matches!(
        params.tcode,
        TCode::WriteQuadlet | TCode::ReadQuadletResponse | TCode::Phy
    ) {
        // A quadlet write's payload, a quadlet read's response data, or a
        // PHY packet's one data quadlet is a single 4-byte word with no
        // separate length quadlet -- all three ride along as a fourth
        // header quadlet rather than a separate descriptor (spec §4.4 item
        // 2/3); the caller fills it in via `set_quadlet_payload`.
        buf.push_quadlet(0);
    }

    buf
}

impl HeaderBuffer {
    /// Overwrites the final quadlet with `payload` for a quadlet write,
    /// after `build_header` has reserved space for it.
    pub fn set_quadlet_payload(&mut self, payload: [u8; 4]) {
        if self.len >= 4 {
            let start = self.len - 4;
            self.bytes[start..start + 4].copy_from_slice(&payload);
        }
    }
}

/// Response codes carried in a response packet's reserved offset quadlet
/// (spec §4.6 supplement). `WriteResponse`/`ReadQuadletResponse`/
/// `ReadBlockResponse`/`LockResponse` headers are built with `build_header`
/// like any other header, with the 48-bit offset field repurposed to carry
/// just this one byte -- a response has no destination offset of its own,
/// so there's no layout this displaces.
pub const fn extract_rcode(quadlet2: u32) -> u8 {
    (quadlet2 & 0xF) as u8
}

/// Extracts the `tLabel` field from a raw quadlet-0 value in host byte
/// order, matching `ExtractTLabel` in the original descriptor helpers.
pub const fn extract_t_label(quadlet0_host: u32) -> u8 {
    ((quadlet0_host >> 10) & 0x3F) as u8
}

pub const fn extract_destination_id(quadlet0_host: u32) -> u16 {
    (quadlet0_host >> 16) as u16
}

pub const fn extract_tcode_raw(quadlet0_host: u32) -> u8 {
    ((quadlet0_host >> 4) & 0xF) as u8
}

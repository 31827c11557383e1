// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Parses a hardware-filled AR buffer into individual packets and routes
//! each to a per-tcode handler slot (spec §4.6, grounded in
//! `PacketRouter::RoutePacket`). A buffer-fill region is a *stream*: it may
//! hold several packets back to back, so parsing loops until the region is
//! consumed.
//!
//! Unlike the original, header quadlets here are taken to already be in
//! consistent big-endian wire order (as `packet::build_header` produces,
//! and as this port's AR buffers are defined to deliver) -- the original's
//! little-endian AR-DMA byte-reversal quirk is specific to that
//! controller's descriptor-engine wiring and is not reproduced here.

use crate::ohci_regs::TCode;
use crate::packet::{extract_destination_id, extract_rcode, extract_t_label};

/// A zero-copy view over one parsed packet within an AR buffer-fill
/// region (spec §4.6 `ARPacketView`).
#[derive(Debug, Clone, Copy)]
pub struct PacketView<'a> {
    pub tcode_raw: u8,
    pub destination_id: u16,
    pub source_id: u16,
    pub t_label: u8,
    /// Valid only for `WriteResponse`/`ReadQuadletResponse`/
    /// `ReadBlockResponse`/`LockResponse`; 0 for request packets.
    pub rcode: u8,
    pub header: &'a [u8],
    pub payload: &'a [u8],
}

/// Outcome of a registered handler: for AR-Request packets, whether (and
/// how) to send a write response (spec §4.6 `ResponseKind` supplement).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    NoResponse,
    Ack(u8),
    RCode(u8),
}

/// Per-tcode default response policy for packets arriving on the
/// AR-Request context (spec §4.6 supplement): quadlet/block writes get an
/// automatic `ack_complete` write response; every other request tcode
/// (reads, locks, PHY) has no automatic response from this core, since
/// actually serving a request is a target-side behavior out of scope here.
pub fn default_response_kind(tcode_raw: u8) -> ResponseKind {
    match TCode::from_raw(tcode_raw) {
        Some(TCode::WriteQuadlet) | Some(TCode::WriteBlock) => ResponseKind::Ack(0),
        _ => ResponseKind::NoResponse,
    }
}

/// Splits one buffer-fill region into packets, calling `on_packet` for
/// each. Quadlet 0 gives the packet's tcode; header length is derived from
/// whether that tcode carries a payload/length quadlet, matching
/// `ARPacketParser::ParseNext`'s per-tcode framing. Malformed trailing
/// bytes (too short for even a quadlet-0) stop the scan, same as the
/// original falling out of its `while` loop on a parse failure.
pub fn route_buffer<'a>(data: &'a [u8], mut on_packet: impl FnMut(PacketView<'a>)) {
    let mut offset = 0;
    while offset + 4 <= data.len() {
        let q0 = u32::from_be_bytes(data[offset..offset + 4].try_into().unwrap());
        let tcode_raw = crate::packet::extract_tcode_raw(q0);
        let Some(tcode) = TCode::from_raw(tcode_raw) else {
            break;
        };

        // Quadlet write/response data and PHY packets carry their one data
        // word as a fourth header quadlet with no separate length field;
        // block/lock operations carry a length quadlet, and some of those
        // (write, lock, read-response) are followed by a separately-sized
        // trailing payload (spec §4.4 item 3, §4.6). A block-read request
        // also gets the fourth quadlet (it states a requested length) but
        // has no trailing bytes of its own.
        let embeds_quadlet_payload =
            matches!(tcode, TCode::WriteQuadlet | TCode::ReadQuadletResponse | TCode::Phy);
        let header_len = if tcode.has_length_quadlet() || embeds_quadlet_payload {
            16
        } else {
            12
        };
        if offset + header_len > data.len() {
            break;
        }

        let data_len = if tcode.carries_payload() {
            let q3 = u32::from_be_bytes(
                data[offset + 12..offset + 16].try_into().unwrap(),
            );
            (q3 >> 16) as usize
        } else {
            0
        };

        let packet_end = offset + header_len + data_len;
        if packet_end > data.len() {
            break;
        }

        let header = &data[offset..offset + header_len];
        let payload = if embeds_quadlet_payload {
            &header[12..16]
        } else {
            &data[offset + header_len..packet_end]
        };
        let destination_id = extract_destination_id(q0);
        let t_label = extract_t_label(q0);
        let source_id = if header.len() >= 8 {
            u16::from_be_bytes(header[4..6].try_into().unwrap())
        } else {
            0
        };
        let rcode = if header.len() >= 12
            && matches!(
                tcode,
                TCode::WriteResponse
                    | TCode::ReadQuadletResponse
                    | TCode::ReadBlockResponse
                    | TCode::LockResponse
            ) {
            let q2 = u32::from_be_bytes(header[8..12].try_into().unwrap());
            extract_rcode(q2)
        } else {
            0
        };

        on_packet(PacketView {
            tcode_raw,
            destination_id,
            source_id,
            t_label,
            rcode,
            header,
            payload,
        });

        // Trailer quadlet(s) carrying xferStatus/timeStamp are appended
        // by hardware after each packet in a buffer-fill stream (OHCI
        // 1.1 §8.4.2); round up to the next quadlet boundary.
        offset = packet_end.div_ceil(4) * 4;
    }
}

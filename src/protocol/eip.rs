// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! EtherNet/IP encapsulation header: the 24-byte frame every CIP request
//! and reply rides inside.

use zerocopy::{
    byteorder::little_endian::{U16, U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

use crate::error::{Error, TransportError};

pub const HEADER_LEN: usize = 24;

/// EIP command codes this client uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    RegisterSession = 0x0065,
    UnregisterSession = 0x0066,
    SendRrData = 0x006f,
    SendUnitData = 0x0070,
}

impl Command {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Fixed 24-byte layout, little-endian, exactly as it appears on the
/// wire. Zero-copy: this struct can be cast directly over a socket read
/// buffer.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct EncapsulationHeader {
    pub command: U16,
    pub length: U16,
    pub session_handle: U32,
    pub status: U32,
    pub sender_context: U64,
    pub options: U32,
}

impl EncapsulationHeader {
    pub fn new(command: Command, length: u16, session_handle: u32, sender_context: u64) -> Self {
        Self {
            command: U16::new(command.as_u16()),
            length: U16::new(length),
            session_handle: U32::new(session_handle),
            status: U32::new(0),
            sender_context: U64::new(sender_context),
            options: U32::new(0),
        }
    }

    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf.copy_from_slice(zerocopy::IntoBytes::as_bytes(&self));
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < HEADER_LEN {
            return Err(TransportError::Partial.into());
        }
        EncapsulationHeader::read_from_bytes(&buf[..HEADER_LEN])
            .map_err(|_| TransportError::BadReply("malformed EIP header".into()).into())
    }

    pub fn status(&self) -> u32 {
        self.status.get()
    }

    pub fn length(&self) -> u16 {
        self.length.get()
    }

    pub fn session_handle(&self) -> u32 {
        self.session_handle.get()
    }

    pub fn sender_context(&self) -> u64 {
        self.sender_context.get()
    }
}

/// `RegisterSession` command-specific data: always version 1, no flags.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RegisterSessionData {
    pub protocol_version: U16,
    pub option_flags: U16,
}

impl Default for RegisterSessionData {
    fn default() -> Self {
        Self {
            protocol_version: U16::new(1),
            option_flags: U16::new(0),
        }
    }
}

impl RegisterSessionData {
    pub fn to_bytes(self) -> [u8; 4] {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(zerocopy::IntoBytes::as_bytes(&self));
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < 4 {
            return Err(TransportError::Partial.into());
        }
        RegisterSessionData::read_from_bytes(&buf[..4])
            .map_err(|_| TransportError::BadReply("malformed RegisterSession body".into()).into())
    }
}

/// Builds the `SendRRData`/`SendUnitData` item-list prefix: interface
/// handle (always 0) + timeout, followed by two CPF items (null address
/// item, then unconnected- or connected-data item).
pub fn build_cpf_unconnected(cip_payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(10 + cip_payload.len());
    out.extend_from_slice(&0u32.to_le_bytes()); // interface handle
    out.extend_from_slice(&0u16.to_le_bytes()); // timeout
    out.extend_from_slice(&2u16.to_le_bytes()); // item count
    out.extend_from_slice(&0x0000u16.to_le_bytes()); // null address item type
    out.extend_from_slice(&0u16.to_le_bytes()); // null address item length
    out.extend_from_slice(&0x00b2u16.to_le_bytes()); // unconnected data item type
    out.extend_from_slice(&(cip_payload.len() as u16).to_le_bytes());
    out.extend_from_slice(cip_payload);
    out
}

/// Builds the CPF item list for connected (`SendUnitData`) messaging: a
/// connected-address item carrying the target connection id, then a
/// connected-data item carrying `conn_seq_num` followed by the CIP
/// payload.
pub fn build_cpf_connected(targ_connection_id: u32, conn_seq_num: u16, cip_payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + cip_payload.len());
    out.extend_from_slice(&0u32.to_le_bytes()); // interface handle
    out.extend_from_slice(&0u16.to_le_bytes()); // timeout
    out.extend_from_slice(&2u16.to_le_bytes()); // item count
    out.extend_from_slice(&0x00a1u16.to_le_bytes()); // connected address item type
    out.extend_from_slice(&4u16.to_le_bytes());
    out.extend_from_slice(&targ_connection_id.to_le_bytes());
    out.extend_from_slice(&0x00b1u16.to_le_bytes()); // connected data item type
    out.extend_from_slice(&(2 + cip_payload.len() as u16).to_le_bytes());
    out.extend_from_slice(&conn_seq_num.to_le_bytes());
    out.extend_from_slice(cip_payload);
    out
}

/// Strips the CPF item-list wrapper off a `SendRRData`/`SendUnitData`
/// reply and returns the inner CIP payload (the second item's data).
pub fn parse_cpf_payload(buf: &[u8]) -> Result<&[u8], Error> {
    if buf.len() < 6 {
        return Err(TransportError::Partial.into());
    }
    let item_count = u16::from_le_bytes([buf[4], buf[5]]);
    let mut offset = 6usize;
    let mut last: Option<&[u8]> = None;
    for _ in 0..item_count {
        if buf.len() < offset + 4 {
            return Err(TransportError::Partial.into());
        }
        let len = u16::from_le_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
        let data_start = offset + 4;
        if buf.len() < data_start + len {
            return Err(TransportError::Partial.into());
        }
        last = Some(&buf[data_start..data_start + len]);
        offset = data_start + len;
    }
    last.ok_or_else(|| TransportError::BadReply("empty CPF item list".into()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let h = EncapsulationHeader::new(Command::RegisterSession, 4, 0, 0xdead_beef);
        let bytes = h.to_bytes();
        assert_eq!(bytes.len(), HEADER_LEN);
        let parsed = EncapsulationHeader::parse(&bytes).expect("parse");
        assert_eq!(parsed.length(), 4);
        assert_eq!(parsed.sender_context(), 0xdead_beef);
    }

    #[test]
    fn register_session_default_is_version_one() {
        let body = RegisterSessionData::default().to_bytes();
        assert_eq!(body, [1, 0, 0, 0]);
    }

    #[test]
    fn cpf_unconnected_round_trip_extracts_payload() {
        let cip = [0xaa, 0xbb, 0xcc];
        let wire = build_cpf_unconnected(&cip);
        let parsed = parse_cpf_payload(&wire).expect("parse");
        assert_eq!(parsed, &cip);
    }

    #[test]
    fn cpf_connected_round_trip_extracts_payload_after_seq_num() {
        let cip = [0x01, 0x02];
        let wire = build_cpf_connected(0x1234_5678, 7, &cip);
        let parsed = parse_cpf_payload(&wire).expect("parse");
        assert_eq!(parsed, &[7, 0, 0x01, 0x02]);
    }

    #[test]
    fn header_parse_rejects_short_buffer() {
        assert!(EncapsulationHeader::parse(&[0u8; 10]).is_err());
    }
}

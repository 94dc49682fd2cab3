// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Modbus-TCP MBAP framing and the handful of function codes this
//! client needs: read holding registers, write single register, write
//! multiple registers.

use crate::error::{Error, ProtocolError, TransportError};

pub const MBAP_LEN: usize = 7;

pub const FN_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FN_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FN_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Exception bit set on a function code in an error reply.
const EXCEPTION_FLAG: u8 = 0x80;

#[derive(Debug, Clone, Copy)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn new(transaction_id: u16, length: u16, unit_id: u8) -> Self {
        Self {
            transaction_id,
            protocol_id: 0,
            length,
            unit_id,
        }
    }

    pub fn to_bytes(self) -> [u8; MBAP_LEN] {
        let mut out = [0u8; MBAP_LEN];
        out[0..2].copy_from_slice(&self.transaction_id.to_be_bytes());
        out[2..4].copy_from_slice(&self.protocol_id.to_be_bytes());
        out[4..6].copy_from_slice(&self.length.to_be_bytes());
        out[6] = self.unit_id;
        out
    }

    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < MBAP_LEN {
            return Err(TransportError::Partial.into());
        }
        Ok(Self {
            transaction_id: u16::from_be_bytes([buf[0], buf[1]]),
            protocol_id: u16::from_be_bytes([buf[2], buf[3]]),
            length: u16::from_be_bytes([buf[4], buf[5]]),
            unit_id: buf[6],
        })
    }
}

/// Build a full `Read Holding Registers` request frame (MBAP + PDU).
pub fn build_read_holding_registers(
    transaction_id: u16,
    unit_id: u8,
    start_address: u16,
    quantity: u16,
) -> Vec<u8> {
    let pdu_len = 1 + 4;
    let header = MbapHeader::new(transaction_id, (1 + pdu_len) as u16, unit_id);
    let mut out = Vec::with_capacity(MBAP_LEN + pdu_len);
    out.extend_from_slice(&header.to_bytes());
    out.push(FN_READ_HOLDING_REGISTERS);
    out.extend_from_slice(&start_address.to_be_bytes());
    out.extend_from_slice(&quantity.to_be_bytes());
    out
}

pub fn build_write_single_register(
    transaction_id: u16,
    unit_id: u8,
    address: u16,
    value: u16,
) -> Vec<u8> {
    let pdu_len = 1 + 4;
    let header = MbapHeader::new(transaction_id, (1 + pdu_len) as u16, unit_id);
    let mut out = Vec::with_capacity(MBAP_LEN + pdu_len);
    out.extend_from_slice(&header.to_bytes());
    out.push(FN_WRITE_SINGLE_REGISTER);
    out.extend_from_slice(&address.to_be_bytes());
    out.extend_from_slice(&value.to_be_bytes());
    out
}

pub fn build_write_multiple_registers(
    transaction_id: u16,
    unit_id: u8,
    start_address: u16,
    values: &[u16],
) -> Vec<u8> {
    let byte_count = values.len() * 2;
    let pdu_len = 1 + 4 + 1 + byte_count;
    let header = MbapHeader::new(transaction_id, (1 + pdu_len) as u16, unit_id);
    let mut out = Vec::with_capacity(MBAP_LEN + pdu_len);
    out.extend_from_slice(&header.to_bytes());
    out.push(FN_WRITE_MULTIPLE_REGISTERS);
    out.extend_from_slice(&start_address.to_be_bytes());
    out.extend_from_slice(&(values.len() as u16).to_be_bytes());
    out.push(byte_count as u8);
    for v in values {
        out.extend_from_slice(&v.to_be_bytes());
    }
    out
}

/// Translate a tag name into a raw holding-register address.
///
/// Accepts a bare register number (`"10"`), a register prefixed with
/// `hr`/`HR` (`"hr10"`), or legacy Modicon-style five/six-digit
/// addressing (`"40001"`), which is zero-based and offset by 40001.
pub fn parse_address(name: &str) -> Result<u16, Error> {
    let trimmed = name.trim();
    let digits = if let Some(rest) = trimmed.strip_prefix("hr").or_else(|| trimmed.strip_prefix("HR")) {
        rest
    } else {
        trimmed
    };
    let n: u32 = digits
        .parse()
        .map_err(|_| Error::bad_param(format!("not a Modbus register address: {name}")))?;
    let addr = if digits.len() >= 5 && n >= 40001 { n - 40001 } else { n };
    u16::try_from(addr).map_err(|_| Error::bad_param(format!("register address out of range: {name}")))
}

/// Parsed Modbus reply PDU, with the MBAP header stripped.
#[derive(Debug, Clone)]
pub struct ModbusReply<'a> {
    pub function: u8,
    pub data: &'a [u8],
}

/// Split `buf` (one full MBAP frame) into header and PDU, checking for
/// an exception reply.
pub fn parse_reply(buf: &[u8]) -> Result<ModbusReply<'_>, Error> {
    let header = MbapHeader::parse(buf)?;
    let pdu_len = header.length as usize - 1;
    if buf.len() < MBAP_LEN + pdu_len {
        return Err(TransportError::Partial.into());
    }
    let pdu = &buf[MBAP_LEN..MBAP_LEN + pdu_len];
    if pdu.is_empty() {
        return Err(TransportError::BadReply("empty Modbus PDU".into()).into());
    }
    let function = pdu[0];
    if function & EXCEPTION_FLAG != 0 {
        let code = pdu.get(1).copied().unwrap_or(0);
        return Err(ProtocolError::BadStatus(code).into());
    }
    Ok(ModbusReply {
        function,
        data: &pdu[1..],
    })
}

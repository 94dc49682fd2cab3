// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Shared dummy-server helpers for the black-box scenarios in this
//! directory. There is no lab gateway to point these at, so each helper
//! speaks just enough of the real wire protocol to stand in for one:
//! a Modbus-TCP register file, or an EtherNet/IP gateway answering CIP
//! `Read Tag Fragmented`/`Write Tag Fragmented` unconnected requests.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

/// A Modbus server that backs every Read/Write Holding Registers request
/// with a shared register file, so a write followed by a read observes
/// the value that was written.
pub async fn spawn_modbus_register_file(registers: Arc<Mutex<Vec<u8>>>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        loop {
            let mut header = [0u8; 7];
            if stream.read_exact(&mut header).await.is_err() {
                return;
            }
            let pdu_len = u16::from_be_bytes([header[4], header[5]]) as usize - 1;
            let mut pdu = vec![0u8; pdu_len];
            if stream.read_exact(&mut pdu).await.is_err() {
                return;
            }

            let function = pdu[0];
            let frame = match function {
                0x03 => {
                    // Read Holding Registers: addr(2) + quantity(2).
                    let addr = u16::from_be_bytes([pdu[1], pdu[2]]) as usize;
                    let quantity = u16::from_be_bytes([pdu[3], pdu[4]]) as usize;
                    let byte_count = quantity * 2;
                    let regs = registers.lock().expect("lock");
                    let start = addr * 2;
                    let data = regs.get(start..start + byte_count).map(<[u8]>::to_vec).unwrap_or_else(|| vec![0u8; byte_count]);
                    let mut reply = header;
                    reply[4..6].copy_from_slice(&(2 + byte_count as u16).to_be_bytes());
                    let mut out = reply.to_vec();
                    out.push(0x03);
                    out.push(byte_count as u8);
                    out.extend_from_slice(&data);
                    out
                },
                0x06 => {
                    // Write Single Register: addr(2) + value(2).
                    let addr = u16::from_be_bytes([pdu[1], pdu[2]]) as usize;
                    let mut regs = registers.lock().expect("lock");
                    let start = addr * 2;
                    if regs.len() < start + 2 {
                        regs.resize(start + 2, 0);
                    }
                    regs[start..start + 2].copy_from_slice(&pdu[3..5]);
                    drop(regs);
                    let mut reply = header;
                    reply[4..6].copy_from_slice(&6u16.to_be_bytes());
                    let mut out = reply.to_vec();
                    out.extend_from_slice(&pdu);
                    out
                },
                0x10 => {
                    // Write Multiple Registers: addr(2) + quantity(2) + byte_count(1) + data.
                    let addr = u16::from_be_bytes([pdu[1], pdu[2]]) as usize;
                    let quantity = u16::from_be_bytes([pdu[3], pdu[4]]);
                    let byte_count = pdu[5] as usize;
                    let data = &pdu[6..6 + byte_count];
                    let mut regs = registers.lock().expect("lock");
                    let start = addr * 2;
                    if regs.len() < start + byte_count {
                        regs.resize(start + byte_count, 0);
                    }
                    regs[start..start + byte_count].copy_from_slice(data);
                    drop(regs);
                    let mut reply = header;
                    reply[4..6].copy_from_slice(&6u16.to_be_bytes());
                    let mut out = reply.to_vec();
                    out.push(0x10);
                    out.extend_from_slice(&(addr as u16).to_be_bytes());
                    out.extend_from_slice(&quantity.to_be_bytes());
                    out
                },
                _ => return,
            };
            if stream.write_all(&frame).await.is_err() {
                return;
            }
        }
    });
    addr
}

const EIP_HEADER_LEN: usize = 24;
const CMD_REGISTER_SESSION: u16 = 0x0065;
const CMD_SEND_RR_DATA: u16 = 0x006f;
const SERVICE_READ_TAG_FRAGMENTED: u8 = 0x52;
const SERVICE_WRITE_TAG_FRAGMENTED: u8 = 0x53;
const RESPONSE_FLAG: u8 = 0x80;

fn eip_header(command: u16, length: u16, session_handle: u32, sender_context: u64) -> [u8; EIP_HEADER_LEN] {
    let mut buf = [0u8; EIP_HEADER_LEN];
    buf[0..2].copy_from_slice(&command.to_le_bytes());
    buf[2..4].copy_from_slice(&length.to_le_bytes());
    buf[4..8].copy_from_slice(&session_handle.to_le_bytes());
    // status (8..12) stays zero.
    buf[16..24].copy_from_slice(&sender_context.to_le_bytes());
    buf
}

fn cpf_unconnected(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(10 + payload.len());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&0x0000u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0x00b2u16.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// A CIP/EtherNet-IP gateway answering `RegisterSession` followed by
/// unconnected `Read Tag Fragmented`/`Write Tag Fragmented` requests against a shared
/// byte buffer standing in for one Logix tag's memory.
pub async fn spawn_logix_gateway(tag_memory: Arc<Mutex<Vec<u8>>>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };

        let mut header_buf = [0u8; EIP_HEADER_LEN];
        if stream.read_exact(&mut header_buf).await.is_err() {
            return;
        }
        let length = u16::from_le_bytes([header_buf[2], header_buf[3]]) as usize;
        let sender_context = u64::from_le_bytes(header_buf[16..24].try_into().expect("8 bytes"));
        let mut body = vec![0u8; length];
        if stream.read_exact(&mut body).await.is_err() {
            return;
        }
        debug_assert_eq!(u16::from_le_bytes([header_buf[0], header_buf[1]]), CMD_REGISTER_SESSION);

        let session_handle = 0x1122_3344u32;
        let reply_body = [1u8, 0, 0, 0]; // RegisterSessionData, version 1.
        let reply_header = eip_header(CMD_REGISTER_SESSION, reply_body.len() as u16, session_handle, sender_context);
        let mut reply = reply_header.to_vec();
        reply.extend_from_slice(&reply_body);
        if stream.write_all(&reply).await.is_err() {
            return;
        }

        loop {
            let mut header_buf = [0u8; EIP_HEADER_LEN];
            if stream.read_exact(&mut header_buf).await.is_err() {
                return;
            }
            let command = u16::from_le_bytes([header_buf[0], header_buf[1]]);
            let length = u16::from_le_bytes([header_buf[2], header_buf[3]]) as usize;
            let sender_context = u64::from_le_bytes(header_buf[16..24].try_into().expect("8 bytes"));
            let mut body = vec![0u8; length];
            if stream.read_exact(&mut body).await.is_err() {
                return;
            }
            if command != CMD_SEND_RR_DATA {
                return;
            }

            // Strip the CPF item-list wrapper down to the raw CIP service
            // request: two items, take the second's payload.
            let item_count = u16::from_le_bytes([body[4], body[5]]) as usize;
            let mut offset = 6usize;
            let mut cip = &body[0..0];
            for _ in 0..item_count {
                let item_len = u16::from_le_bytes([body[offset + 2], body[offset + 3]]) as usize;
                let data_start = offset + 4;
                cip = &body[data_start..data_start + item_len];
                offset = data_start + item_len;
            }

            let service = cip[0];
            let path_words = cip[1] as usize;
            let path_end = 2 + path_words * 2;
            let reply_payload = if service == SERVICE_READ_TAG_FRAGMENTED {
                // element_count(2) + byte_offset(4).
                let byte_offset = u32::from_le_bytes(cip[path_end + 2..path_end + 6].try_into().expect("4 bytes")) as usize;
                let mem = tag_memory.lock().expect("lock");
                let data = mem.get(byte_offset..).unwrap_or(&[]).to_vec();
                let mut out = vec![service | RESPONSE_FLAG, 0, 0, 0];
                out.extend_from_slice(&0x00c4u16.to_le_bytes()); // DINT, good enough for the stub.
                out.extend_from_slice(&data);
                out
            } else if service == SERVICE_WRITE_TAG_FRAGMENTED {
                // data_type(2) + element_count(2) + byte_offset(4) + data.
                let byte_offset = u32::from_le_bytes(cip[path_end + 4..path_end + 8].try_into().expect("4 bytes")) as usize;
                let data = &cip[path_end + 8..];
                let mut mem = tag_memory.lock().expect("lock");
                let end = byte_offset + data.len();
                if mem.len() < end {
                    mem.resize(end, 0);
                }
                mem[byte_offset..end].copy_from_slice(data);
                vec![service | RESPONSE_FLAG, 0, 0, 0]
            } else {
                vec![service | RESPONSE_FLAG, 0, 0x08, 0] // service not supported
            };

            let cpf = cpf_unconnected(&reply_payload);
            let reply_header = eip_header(CMD_SEND_RR_DATA, cpf.len() as u16, session_handle, sender_context);
            let mut reply = reply_header.to_vec();
            reply.extend_from_slice(&cpf);
            if stream.write_all(&reply).await.is_err() {
                return;
            }
        }
    });
    addr
}

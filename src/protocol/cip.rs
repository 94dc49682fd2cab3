// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! CIP request/response framing, symbolic tag-path encoding, and
//! connection-path encoding (including the DH+ routing tail).
//!
//! The symbolic path encoder is a state machine grounded on the
//! `cip_encode_tag_name` routine used by this library's C-language
//! predecessor: it walks the name left to right, alternating between
//! reading a dotted segment and reading a bracketed array index.

use crate::error::{ArgumentError, Error, ProtocolError};

pub const SERVICE_READ_TAG: u8 = 0x4c;
pub const SERVICE_WRITE_TAG: u8 = 0x4d;
pub const SERVICE_READ_TAG_FRAGMENTED: u8 = 0x52;
pub const SERVICE_WRITE_TAG_FRAGMENTED: u8 = 0x53;
pub const SERVICE_FORWARD_OPEN: u8 = 0x54;
pub const SERVICE_FORWARD_CLOSE: u8 = 0x4e;
pub const SERVICE_MULTIPLE_SERVICE_PACKET: u8 = 0x0a;
pub const SERVICE_EXECUTE_PCCC: u8 = 0x4b;

/// Response-bit set on a reply's service byte.
const RESPONSE_FLAG: u8 = 0x80;

/// Message router path for unconnected Logix-class requests (class
/// 0x02, instance 1).
pub const MESSAGE_ROUTER_PATH: [u8; 4] = [0x20, 0x02, 0x24, 0x01];

/// PCCC object path for `Execute PCCC` requests routed directly (not
/// over DH+) to a PLC-5/SLC-class CPU (class 0x67, instance 1).
pub const PCCC_OBJECT_PATH: [u8; 4] = [0x20, 0x67, 0x24, 0x01];

/// Encode a CIP symbolic tag path such as `motor.axis[3].speed` into its
/// IOI wire form: a leading word-count byte followed by alternating
/// name and array-index segments.
pub fn encode_symbolic_path(name: &str) -> Result<Vec<u8>, Error> {
    let mut body = Vec::with_capacity(name.len() + 4);
    let mut chars = name.char_indices().peekable();

    let first_ok = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == ':');
    if !first_ok {
        return Err(ArgumentError::BadParam(format!(
            "tag name must start with a letter, '_' or ':': {name}"
        ))
        .into());
    }

    let mut cur_name_start: Option<usize> = Some(0);
    let flush_name = |body: &mut Vec<u8>, seg: &str| -> Result<(), Error> {
        if seg.is_empty() {
            return Err(ArgumentError::BadParam(format!("empty name segment in {name}")).into());
        }
        if seg.len() > 255 {
            return Err(ArgumentError::TooLarge(format!("tag name segment too long: {seg}")).into());
        }
        body.push(0x91);
        body.push(seg.len() as u8);
        body.extend_from_slice(seg.as_bytes());
        if seg.len() % 2 != 0 {
            body.push(0);
        }
        Ok(())
    };

    while let Some((i, c)) = chars.next() {
        match c {
            '.' => {
                if let Some(start) = cur_name_start.take() {
                    flush_name(&mut body, &name[start..i])?;
                }
                cur_name_start = Some(i + 1);
            },
            '[' => {
                if let Some(start) = cur_name_start.take() {
                    flush_name(&mut body, &name[start..i])?;
                }
                loop {
                    let num_start = match chars.peek() {
                        Some(&(j, _)) => j,
                        None => {
                            return Err(ArgumentError::BadParam(format!(
                                "unterminated array index in {name}"
                            ))
                            .into());
                        },
                    };
                    let mut num_end = num_start;
                    while let Some(&(j, d)) = chars.peek() {
                        if d.is_ascii_digit() {
                            num_end = j + d.len_utf8();
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    if num_end == num_start {
                        return Err(ArgumentError::BadParam(format!(
                            "expected array index in {name}"
                        ))
                        .into());
                    }
                    let val: u32 = name[num_start..num_end]
                        .parse()
                        .map_err(|_| ArgumentError::BadParam(format!("bad array index in {name}")))?;
                    encode_array_index(&mut body, val);
                    match chars.next() {
                        Some((_, ',')) => continue,
                        Some((_, ']')) => break,
                        _ => {
                            return Err(ArgumentError::BadParam(format!(
                                "malformed array index in {name}"
                            ))
                            .into());
                        },
                    }
                }
                cur_name_start = None;
            },
            _ => {
                if cur_name_start.is_none() {
                    cur_name_start = Some(i);
                }
            },
        }
    }
    if let Some(start) = cur_name_start {
        flush_name(&mut body, &name[start..])?;
    }

    if body.is_empty() {
        return Err(ArgumentError::BadParam(format!("empty tag path: {name}")).into());
    }
    let word_count = (body.len() / 2) as u8;
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(word_count);
    out.extend_from_slice(&body);
    Ok(out)
}

fn encode_array_index(body: &mut Vec<u8>, val: u32) {
    if val <= 0xff {
        body.push(0x28);
        body.push(val as u8);
    } else if val <= 0xffff {
        body.push(0x29);
        body.push(0);
        body.extend_from_slice(&(val as u16).to_le_bytes());
    } else {
        body.push(0x2a);
        body.push(0);
        body.extend_from_slice(&val.to_le_bytes());
    }
}

/// One DH+ channel selector parsed from a `path` attribute's trailing
/// `<ch>:<src>:<dst>` segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhpChannel {
    A,
    B,
}

impl DhpChannel {
    fn code(self) -> u8 {
        match self {
            DhpChannel::A => 1,
            DhpChannel::B => 2,
        }
    }
}

/// A DH+ route parsed from a trailing `<ch>:<src>:<dst>` path segment.
/// `src`/`dst` never appear in the CIP path itself (see
/// [`encode_connection_path`]) — they're carried out-of-band for the
/// PCCC/DH+ message layer, the way the original client's `tag->dhp_src`/
/// `tag->dhp_dest` fields do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DhpRoute {
    pub channel: DhpChannel,
    pub src: u8,
    pub dst: u8,
}

/// Parsed connection-path attribute, ready to be serialized onto the
/// wire.
#[derive(Debug, Clone, Default)]
pub struct ConnectionPath {
    pub ports: Vec<u8>,
    pub dhp: Option<DhpRoute>,
}

/// Parse a comma-separated route string such as `1,0` or `2,1,A:0:3`
/// into its port list and optional trailing DH+ selector. A DH+ segment
/// anywhere but last is rejected; a dotted-quad IPv4 address anywhere in
/// the path is rejected rather than silently parsed as port numbers.
pub fn parse_connection_path(path: &str) -> Result<ConnectionPath, Error> {
    let segments: Vec<&str> = path.split(',').map(str::trim).collect();
    let mut out = ConnectionPath::default();
    for (idx, seg) in segments.iter().enumerate() {
        if seg.split('.').count() == 4 && seg.split('.').all(|p| p.parse::<u8>().is_ok()) {
            return Err(ArgumentError::BadParam(format!(
                "dotted-quad IPv4 address is not a valid route segment: {seg}"
            ))
            .into());
        }
        if let Some((ch, rest)) = seg.split_once(':') {
            let channel = match ch {
                "A" | "a" | "2" => DhpChannel::A,
                "B" | "b" | "3" => DhpChannel::B,
                other => {
                    return Err(ArgumentError::BadParam(format!(
                        "unknown DH+ channel selector: {other}"
                    ))
                    .into());
                },
            };
            if idx != segments.len() - 1 {
                return Err(ArgumentError::BadParam(
                    "DH+ routing segment must be the final path segment".into(),
                )
                .into());
            }
            let parts: Vec<&str> = rest.split(':').collect();
            let [src_str, dst_str] = parts[..] else {
                return Err(ArgumentError::BadParam(format!("malformed DH+ segment: {seg}")).into());
            };
            let src: u8 = src_str
                .parse()
                .map_err(|_| ArgumentError::BadParam(format!("malformed DH+ segment: {seg}")))?;
            let dst: u8 = dst_str
                .parse()
                .map_err(|_| ArgumentError::BadParam(format!("malformed DH+ segment: {seg}")))?;
            out.dhp = Some(DhpRoute { channel, src, dst });
        } else {
            let port: u8 = seg
                .parse()
                .map_err(|_| ArgumentError::BadParam(format!("bad route segment: {seg}")))?;
            out.ports.push(port);
        }
    }
    Ok(out)
}

/// Serialize a parsed connection path to its CIP wire form, including
/// the Message Router trailer for Logix-class targets and the DH+ tail
/// for PLC-5/SLC targets bridged over DH+.
pub fn encode_connection_path(path: &ConnectionPath, is_logix: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(path.ports.len() + 8);
    for &port in &path.ports {
        out.push(port);
    }
    if let Some(route) = path.dhp {
        // The trailing byte is a fixed 0x01, not the destination node:
        // the node address travels out-of-band (`DhpRoute::src`/`dst`),
        // never inside this path.
        out.extend_from_slice(&[0x20, 0xa6, 0x24, route.channel.code(), 0x2c, 0x01]);
    } else if is_logix {
        out.extend_from_slice(&MESSAGE_ROUTER_PATH);
    }
    if out.len() % 2 != 0 {
        out.push(0);
    }
    out
}

/// A decoded CIP reply: status plus whatever service-specific data
/// followed it.
#[derive(Debug, Clone)]
pub struct CipReply<'a> {
    pub service: u8,
    pub general_status: u8,
    pub extended_status: &'a [u8],
    pub data: &'a [u8],
}

/// General status codes this client distinguishes from a bare
/// [`ProtocolError::BadStatus`].
pub const STATUS_SUCCESS: u8 = 0x00;
pub const STATUS_PATH_SEGMENT_ERROR: u8 = 0x04;
pub const STATUS_PATH_DESTINATION_UNKNOWN: u8 = 0x05;
pub const STATUS_PARTIAL_TRANSFER: u8 = 0x06;

pub fn parse_reply(buf: &[u8]) -> Result<CipReply<'_>, Error> {
    if buf.len() < 4 {
        return Err(crate::error::TransportError::Partial.into());
    }
    let service = buf[0] & !RESPONSE_FLAG;
    let general_status = buf[2];
    let ext_len = buf[3] as usize;
    if buf.len() < 4 + ext_len {
        return Err(crate::error::TransportError::Partial.into());
    }
    let extended_status = &buf[4..4 + ext_len];
    let data = &buf[4 + ext_len..];
    Ok(CipReply {
        service,
        general_status,
        extended_status,
        data,
    })
}

pub fn status_to_error(status: u8) -> Error {
    match status {
        STATUS_SUCCESS => unreachable!("caller must check for success before calling"),
        STATUS_PATH_DESTINATION_UNKNOWN => ProtocolError::NotFound.into(),
        STATUS_PARTIAL_TRANSFER => ProtocolError::Pending.into(),
        other => ProtocolError::BadStatus(other).into(),
    }
}

/// Build a CIP `Read Tag Service` request (path + element count).
pub fn build_read_tag(path: &[u8], element_count: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + path.len() + 2);
    out.push(SERVICE_READ_TAG);
    out.push((path.len() / 2) as u8);
    out.extend_from_slice(path);
    out.extend_from_slice(&element_count.to_le_bytes());
    out
}

/// Build a CIP `Write Tag Service` request (path + CIP data-type code +
/// element count + raw data).
pub fn build_write_tag(path: &[u8], data_type: u16, element_count: u16, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + path.len() + 4 + data.len());
    out.push(SERVICE_WRITE_TAG);
    out.push((path.len() / 2) as u8);
    out.extend_from_slice(path);
    out.extend_from_slice(&data_type.to_le_bytes());
    out.extend_from_slice(&element_count.to_le_bytes());
    out.extend_from_slice(data);
    out
}

/// Wrap a PCCC command frame in a CIP `Execute PCCC Object` request
/// (service 0x4b): path to the PCCC object, a 7-byte requestor id
/// (vendor id + originator serial), then the raw PCCC command bytes.
pub fn build_execute_pccc(path: &[u8], vendor_id: u16, orig_serial: u32, pccc_cmd: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + path.len() + 7 + pccc_cmd.len());
    out.push(SERVICE_EXECUTE_PCCC);
    out.push((path.len() / 2) as u8);
    out.extend_from_slice(path);
    out.push(7); // requestor id length
    out.extend_from_slice(&vendor_id.to_le_bytes());
    out.extend_from_slice(&orig_serial.to_le_bytes());
    out.extend_from_slice(pccc_cmd);
    out
}

/// Build a CIP `Read Tag Fragmented Service` request (service 0x52):
/// path, element count, and the byte offset to resume from.
pub fn build_read_tag_fragmented(path: &[u8], element_count: u16, byte_offset: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + path.len() + 6);
    out.push(SERVICE_READ_TAG_FRAGMENTED);
    out.push((path.len() / 2) as u8);
    out.extend_from_slice(path);
    out.extend_from_slice(&element_count.to_le_bytes());
    out.extend_from_slice(&byte_offset.to_le_bytes());
    out
}

/// Build a CIP `Write Tag Fragmented Service` request (service 0x53):
/// path, CIP data-type code, element count, byte offset, and the slice
/// of `data` starting at that offset.
pub fn build_write_tag_fragmented(
    path: &[u8],
    data_type: u16,
    element_count: u16,
    byte_offset: u32,
    data: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + path.len() + 8 + data.len());
    out.push(SERVICE_WRITE_TAG_FRAGMENTED);
    out.push((path.len() / 2) as u8);
    out.extend_from_slice(path);
    out.extend_from_slice(&data_type.to_le_bytes());
    out.extend_from_slice(&element_count.to_le_bytes());
    out.extend_from_slice(&byte_offset.to_le_bytes());
    out.extend_from_slice(data);
    out
}

/// CIP elementary data-type codes, keyed by buffer element width.
pub const CIP_TYPE_BOOL: u16 = 0x00c1;
pub const CIP_TYPE_SINT: u16 = 0x00c2;
pub const CIP_TYPE_INT: u16 = 0x00c3;
pub const CIP_TYPE_DINT: u16 = 0x00c4;
pub const CIP_TYPE_LINT: u16 = 0x00c5;
pub const CIP_TYPE_REAL: u16 = 0x00ca;
pub const CIP_TYPE_LREAL: u16 = 0x00cb;

/// Pick the CIP elementary data-type code matching a tag's element size,
/// disambiguating integer vs. float at 4 and 8 bytes via `is_float`.
pub fn data_type_for_elem_size(elem_size: u32, is_float: bool) -> Result<u16, Error> {
    Ok(match (elem_size, is_float) {
        (1, false) => CIP_TYPE_SINT,
        (2, false) => CIP_TYPE_INT,
        (4, false) => CIP_TYPE_DINT,
        (8, false) => CIP_TYPE_LINT,
        (4, true) => CIP_TYPE_REAL,
        (8, true) => CIP_TYPE_LREAL,
        (other, _) => {
            return Err(ArgumentError::Unsupported(format!("no CIP data type for element size {other}")).into());
        },
    })
}

/// Wrap an embedded unconnected request (a plain Read/Write Tag
/// Service request, typically) in a CIP `Unconnected Send` (service
/// 0x52 on the Connection Manager, class 0x06) so it can be routed
/// across backplane/bridge hops named by `route_path`.
pub fn build_unconnected_send(embedded: &[u8], route_path: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + embedded.len() + route_path.len());
    out.push(SERVICE_UNCONNECTED_SEND);
    out.push(2); // path size in words for the connection manager object
    out.extend_from_slice(&[0x20, 0x06, 0x24, 0x01]);
    out.push(10); // priority/time tick
    out.push(14); // timeout ticks
    out.extend_from_slice(&(embedded.len() as u16).to_le_bytes());
    out.extend_from_slice(embedded);
    if embedded.len() % 2 != 0 {
        out.push(0); // pad embedded request to an even length
    }
    out.push((route_path.len() / 2) as u8);
    out.push(0); // reserved
    out.extend_from_slice(route_path);
    out
}

/// Service code for CIP `Unconnected Send` on the Connection Manager.
pub const SERVICE_UNCONNECTED_SEND: u8 = 0x52;

/// Build a CIP `Multiple Service Packet` request (service 0x0a) that
/// coalesces several independent CIP requests, addressed to the
/// Message Router, into one reply.
pub fn build_multi_service_packet(requests: &[Vec<u8>]) -> Vec<u8> {
    let count = requests.len() as u16;
    let mut offsets = Vec::with_capacity(requests.len());
    let header_len = 2 + requests.len() * 2;
    let mut offset = header_len as u16;
    for req in requests {
        offsets.push(offset);
        offset += req.len() as u16;
    }
    let mut out = Vec::with_capacity(2 + MESSAGE_ROUTER_PATH.len() + 2 + header_len + offset as usize);
    out.push(SERVICE_MULTIPLE_SERVICE_PACKET);
    out.push((MESSAGE_ROUTER_PATH.len() / 2) as u8);
    out.extend_from_slice(&MESSAGE_ROUTER_PATH);
    out.extend_from_slice(&count.to_le_bytes());
    for off in &offsets {
        out.extend_from_slice(&off.to_le_bytes());
    }
    for req in requests {
        out.extend_from_slice(req);
    }
    out
}

/// Split a `Multiple Service Packet` reply's data section back into its
/// individual embedded CIP replies, using the offset array the target
/// echoed back.
pub fn parse_multi_service_reply(data: &[u8]) -> Result<Vec<&[u8]>, Error> {
    if data.len() < 2 {
        return Err(crate::error::TransportError::Partial.into());
    }
    let count = u16::from_le_bytes([data[0], data[1]]) as usize;
    let offsets_end = 2 + count * 2;
    if data.len() < offsets_end {
        return Err(crate::error::TransportError::Partial.into());
    }
    let mut offsets = Vec::with_capacity(count);
    for i in 0..count {
        let start = 2 + i * 2;
        offsets.push(u16::from_le_bytes([data[start], data[start + 1]]) as usize);
    }
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let start = offsets[i];
        let end = offsets.get(i + 1).copied().unwrap_or(data.len());
        if start > data.len() || end > data.len() || start > end {
            return Err(crate::error::TransportError::BadReply("malformed multi-service offsets".into()).into());
        }
        out.push(&data[start..end]);
    }
    Ok(out)
}

/// A `ForwardOpen` request ready to be wrapped in an unconnected CPF
/// frame and sent on the registered session.
pub struct ForwardOpenParams {
    pub orig_connection_id: u32,
    pub conn_serial_number: u16,
    pub vendor_id: u16,
    pub orig_serial_number: u32,
    pub connection_path: Vec<u8>,
    pub connection_size: u16,
}

pub fn build_forward_open(params: &ForwardOpenParams) -> Vec<u8> {
    let mut out = Vec::with_capacity(40 + params.connection_path.len());
    out.push(SERVICE_FORWARD_OPEN);
    out.push(2); // path size in words for the connection manager object
    out.extend_from_slice(&[0x20, 0x06, 0x24, 0x01]); // class 0x06 (connection manager), instance 1
    out.push(10); // priority/time tick
    out.push(14); // timeout ticks
    out.extend_from_slice(&params.orig_connection_id.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // targ_connection_id, filled by target
    out.extend_from_slice(&params.conn_serial_number.to_le_bytes());
    out.extend_from_slice(&params.vendor_id.to_le_bytes());
    out.extend_from_slice(&params.orig_serial_number.to_le_bytes());
    out.push(0); // connection timeout multiplier
    out.extend_from_slice(&[0, 0, 0]); // reserved
    out.extend_from_slice(&2_000_000u32.to_le_bytes()); // O->T RPI, us
    out.extend_from_slice(&((0x4000u16) | params.connection_size).to_le_bytes());
    out.extend_from_slice(&2_000_000u32.to_le_bytes()); // T->O RPI, us
    out.extend_from_slice(&((0x4000u16) | params.connection_size).to_le_bytes());
    out.push(0xa3); // transport type/trigger: class 3, application object
    out.push((params.connection_path.len() / 2) as u8);
    out.extend_from_slice(&params.connection_path);
    out
}

pub fn build_forward_close(
    conn_serial_number: u16,
    vendor_id: u16,
    orig_serial_number: u32,
    connection_path: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(20 + connection_path.len());
    out.push(SERVICE_FORWARD_CLOSE);
    out.push(2);
    out.extend_from_slice(&[0x20, 0x06, 0x24, 0x01]);
    out.push(10);
    out.push(14);
    out.extend_from_slice(&conn_serial_number.to_le_bytes());
    out.extend_from_slice(&vendor_id.to_le_bytes());
    out.extend_from_slice(&orig_serial_number.to_le_bytes());
    out.push((connection_path.len() / 2) as u8);
    out.push(0); // reserved
    out.extend_from_slice(connection_path);
    out
}

/// Parsed `ForwardOpen` success reply fields this client needs.
#[derive(Debug, Clone, Copy)]
pub struct ForwardOpenReply {
    pub targ_connection_id: u32,
}

pub fn parse_forward_open_reply(data: &[u8]) -> Result<ForwardOpenReply, Error> {
    if data.len() < 4 {
        return Err(crate::error::TransportError::BadReply("short ForwardOpen reply".into()).into());
    }
    Ok(ForwardOpenReply {
        targ_connection_id: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_simple_name() {
        let path = encode_symbolic_path("speed").expect("encode");
        assert_eq!(path[0] as usize, (path.len() - 1) / 2);
        assert_eq!(&path[1..4], &[0x91, 5, b's']);
    }

    #[test]
    fn encodes_dotted_and_array_path() {
        let path = encode_symbolic_path("motor.axis[3].speed").expect("encode");
        assert_eq!(path[1], 0x91);
        assert_eq!(path[2], 5); // "motor" length
        let word_count = path[0] as usize;
        assert_eq!(word_count * 2, path.len() - 1);
    }

    #[test]
    fn array_index_picks_smallest_encoding() {
        let p1 = encode_symbolic_path("arr[1]").expect("encode");
        assert!(p1.windows(2).any(|w| w == [0x28, 1]));
        let p2 = encode_symbolic_path("arr[1000]").expect("encode");
        assert!(p2.contains(&0x29));
        let p3 = encode_symbolic_path("arr[100000]").expect("encode");
        assert!(p3.contains(&0x2a));
    }

    #[test]
    fn rejects_name_starting_with_digit() {
        assert!(encode_symbolic_path("1abc").is_err());
    }

    #[test]
    fn connection_path_rejects_non_final_dhp() {
        assert!(parse_connection_path("A:0:3,1").is_err());
    }

    #[test]
    fn connection_path_rejects_dotted_quad() {
        assert!(parse_connection_path("192.168.1.1").is_err());
    }

    #[test]
    fn connection_path_parses_dhp_tail() {
        let p = parse_connection_path("1,0,A:0:3").expect("parse");
        assert_eq!(p.ports, vec![1, 0]);
        assert_eq!(
            p.dhp,
            Some(DhpRoute {
                channel: DhpChannel::A,
                src: 0,
                dst: 3,
            })
        );
        let enc = encode_connection_path(&p, false);
        assert_eq!(&enc[2..], &[0x20, 0xa6, 0x24, 1, 0x2c, 0x01]);
    }

    #[test]
    fn logix_path_without_dhp_gets_message_router_trailer() {
        let p = parse_connection_path("1,0").expect("parse");
        let enc = encode_connection_path(&p, true);
        assert_eq!(&enc[2..], &MESSAGE_ROUTER_PATH);
    }

    #[test]
    fn execute_pccc_wraps_command_with_requestor_id() {
        let path = PCCC_OBJECT_PATH;
        let cmd = [0x0f, 0x00, 0x01, 0x00, 0xa2];
        let wire = build_execute_pccc(&path, 0x1234, 0xaabb_ccdd, &cmd);
        assert_eq!(wire[0], SERVICE_EXECUTE_PCCC);
        assert_eq!(wire[1] as usize, path.len() / 2);
        assert_eq!(&wire[2..6], &path);
        assert_eq!(wire[6], 7);
        assert_eq!(&wire[13..], &cmd);
    }

    #[test]
    fn parses_simple_success_reply() {
        let buf = [SERVICE_READ_TAG | RESPONSE_FLAG, 0, STATUS_SUCCESS, 0, 1, 2, 3, 4];
        let reply = parse_reply(&buf).expect("parse");
        assert_eq!(reply.service, SERVICE_READ_TAG);
        assert_eq!(reply.general_status, STATUS_SUCCESS);
        assert_eq!(reply.data, &[1, 2, 3, 4]);
    }

    #[test]
    fn data_type_for_elem_size_disambiguates_float_and_int() {
        assert_eq!(data_type_for_elem_size(4, false).expect("dint"), CIP_TYPE_DINT);
        assert_eq!(data_type_for_elem_size(4, true).expect("real"), CIP_TYPE_REAL);
        assert_eq!(data_type_for_elem_size(8, true).expect("lreal"), CIP_TYPE_LREAL);
        assert!(data_type_for_elem_size(3, false).is_err());
    }

    #[test]
    fn fragmented_read_carries_offset() {
        let path = encode_symbolic_path("buf").expect("encode");
        let wire = build_read_tag_fragmented(&path, 10, 200);
        assert_eq!(wire[0], SERVICE_READ_TAG_FRAGMENTED);
        assert_eq!(&wire[wire.len() - 4..], &200u32.to_le_bytes());
    }

    #[test]
    fn fragmented_write_carries_offset_and_data() {
        let path = encode_symbolic_path("buf").expect("encode");
        let data = [1u8, 2, 3, 4];
        let wire = build_write_tag_fragmented(&path, CIP_TYPE_DINT, 1, 4, &data);
        assert_eq!(wire[0], SERVICE_WRITE_TAG_FRAGMENTED);
        assert_eq!(&wire[wire.len() - 4..], &data);
    }

    #[test]
    fn unconnected_send_wraps_and_pads_embedded_request() {
        let embedded = build_read_tag(&encode_symbolic_path("x").expect("encode"), 1);
        let route = [0x01, 0x00];
        let wire = build_unconnected_send(&embedded, &route);
        assert_eq!(wire[0], SERVICE_UNCONNECTED_SEND);
        assert!(wire.ends_with(&route));
    }

    #[test]
    fn multi_service_packet_round_trips_offsets() {
        let r1 = build_read_tag(&encode_symbolic_path("a").expect("encode"), 1);
        let r2 = build_read_tag(&encode_symbolic_path("b").expect("encode"), 1);
        let packet = build_multi_service_packet(&[r1.clone(), r2.clone()]);
        // Emulate a reply: same data layout (count + offsets + payloads)
        // relative to the Message Router path prefix in the request.
        let data_start = 2 + MESSAGE_ROUTER_PATH.len();
        let reply_data = &packet[data_start..];
        let parts = parse_multi_service_reply(reply_data).expect("parse");
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], &r1[..]);
        assert_eq!(parts[1], &r2[..]);
    }
}

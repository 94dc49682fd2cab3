// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Typed tag configuration, resolved from an [`AttrBag`] the way the
//! teacher's negotiation layer turns negotiated keys into a typed
//! `Config`: one struct per logical grouping, validated and normalized in
//! a single pass, with unrecognised keys preserved rather than rejected.

use std::collections::HashMap;

use crate::{
    cfg::{
        attr::AttrBag,
        enums::{PlcFamily, Protocol},
    },
    codec::ByteOrderDescriptor,
    error::{ArgumentError, Error},
};

/// Gateway addressing: where the TCP connection goes.
#[derive(Debug, Clone)]
pub struct Gateway {
    pub host: String,
    pub port: u16,
}

/// CIP routing / addressing details.
#[derive(Debug, Clone, Default)]
pub struct Route {
    pub path: Option<String>,
    pub cpu: Option<PlcFamily>,
}

/// Tag geometry and naming.
#[derive(Debug, Clone)]
pub struct Identity {
    pub name: String,
    pub elem_size: usize,
    pub elem_count: usize,
}

/// Timing knobs: how often things happen automatically, and how long to
/// wait before giving up.
#[derive(Debug, Clone)]
pub struct Timing {
    pub timeout_ms: u64,
    pub auto_sync_read_ms: u64,
    pub auto_sync_write_ms: u64,
    pub read_cache_ms: u64,
    pub idle_timeout_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            auto_sync_read_ms: 0,
            auto_sync_write_ms: 0,
            read_cache_ms: 0,
            idle_timeout_ms: 0,
        }
    }
}

/// Request packing / batching behaviour.
#[derive(Debug, Clone, Default)]
pub struct Packing {
    pub allow_packing: bool,
}

/// Fully resolved, validated configuration for a single tag.
#[derive(Debug, Clone)]
pub struct TagConfig {
    pub protocol: Protocol,
    pub gateway: Gateway,
    pub route: Route,
    pub identity: Identity,
    pub timing: Timing,
    pub packing: Packing,
    pub debug: u8,
    pub is_bit: bool,
    pub bit_index: Option<u8>,
    pub is_float: bool,
    pub use_connection: bool,
    pub byte_order: ByteOrderDescriptor,
    pub unit_id: u8,
    /// Vendor/forward-compatible keys not recognised above.
    pub custom: HashMap<String, String>,
}

const CONSUMED_KEYS: &[&str] = &[
    "protocol",
    "gateway",
    "path",
    "cpu",
    "plc",
    "elem_size",
    "elem_count",
    "name",
    "debug",
    "allow_packing",
    "auto_sync_read_ms",
    "auto_sync_write_ms",
    "read_cache_ms",
    "idle_timeout_ms",
    "port",
    "timeout_ms",
    "unit_id",
    "is_bit",
    "bit_index",
    "float",
    "use_connection",
    "str_is_counted",
    "str_is_fixed_length",
    "str_is_zero_terminated",
    "str_is_byte_swapped",
    "str_count_word_bytes",
    "str_pad_bytes",
    "str_max_capacity",
    "str_total_length",
];

/// Resolve the `str_*` attribute family into a [`ByteOrderDescriptor`],
/// starting from its defaults and overriding only the keys present in
/// `bag`.
fn byte_order_from_attrs(bag: &AttrBag) -> Result<ByteOrderDescriptor, Error> {
    let defaults = ByteOrderDescriptor::default();
    let str_count_word_bytes = bag.get_int("str_count_word_bytes", defaults.str_count_word_bytes as i64)?;
    let str_count_word_bytes = u8::try_from(str_count_word_bytes)
        .map_err(|_| ArgumentError::BadParam("str_count_word_bytes out of range".into()))?;
    let str_pad_bytes = bag.get_int("str_pad_bytes", defaults.str_pad_bytes as i64)?;
    let str_pad_bytes = u8::try_from(str_pad_bytes)
        .map_err(|_| ArgumentError::BadParam("str_pad_bytes out of range".into()))?;
    let str_max_capacity = bag.get_int("str_max_capacity", defaults.str_max_capacity as i64)?;
    let str_max_capacity = usize::try_from(str_max_capacity)
        .map_err(|_| ArgumentError::BadParam("str_max_capacity must be >= 0".into()))?;
    let str_total_length = bag.get_int("str_total_length", defaults.str_total_length as i64)?;
    let str_total_length = usize::try_from(str_total_length)
        .map_err(|_| ArgumentError::BadParam("str_total_length must be >= 0".into()))?;

    Ok(ByteOrderDescriptor {
        str_is_counted: bag.get_bool("str_is_counted", defaults.str_is_counted)?,
        str_is_fixed_length: bag.get_bool("str_is_fixed_length", defaults.str_is_fixed_length)?,
        str_is_zero_terminated: bag.get_bool("str_is_zero_terminated", defaults.str_is_zero_terminated)?,
        str_is_byte_swapped: bag.get_bool("str_is_byte_swapped", defaults.str_is_byte_swapped)?,
        str_count_word_bytes,
        str_pad_bytes,
        str_max_capacity,
        str_total_length,
    })
}

impl TagConfig {
    pub fn from_attrs(bag: &AttrBag) -> Result<Self, Error> {
        let protocol: Protocol = bag.get_required("protocol")?.parse()?;

        let default_port = match protocol {
            Protocol::ModbusTcp => 502,
            _ => 44818,
        };
        let host = bag.get_required("gateway")?.to_string();
        let port = bag.get_int("port", default_port as i64)?;
        let port = u16::try_from(port)
            .map_err(|_| ArgumentError::BadParam(format!("port out of range: {port}")))?;

        let cpu = bag
            .get("cpu")
            .or_else(|| bag.get("plc"))
            .map(str::parse::<PlcFamily>)
            .transpose()?;
        let route = Route {
            path: bag.get("path").map(str::to_string),
            cpu,
        };

        let elem_size = bag.get_int("elem_size", 1)?;
        let elem_size = usize::try_from(elem_size)
            .map_err(|_| ArgumentError::BadParam("elem_size must be >= 0".into()))?;
        if elem_size == 0 {
            return Err(ArgumentError::BadParam("elem_size must be >= 1".into()).into());
        }
        let elem_count = bag.get_int("elem_count", 1)?;
        let elem_count = usize::try_from(elem_count)
            .map_err(|_| ArgumentError::BadParam("elem_count must be >= 0".into()))?;
        if elem_count == 0 {
            return Err(ArgumentError::BadParam("elem_count must be >= 1".into()).into());
        }
        let name = if protocol == Protocol::System {
            bag.get("name").unwrap_or_default().to_string()
        } else {
            bag.get_required("name")?.to_string()
        };

        let debug = bag.get_int("debug", 0)?;
        let debug = u8::try_from(debug.clamp(0, 5))
            .map_err(|_| ArgumentError::BadParam("debug out of range".into()))?;

        let timing = Timing {
            timeout_ms: bag.get_int("timeout_ms", Timing::default().timeout_ms as i64)? as u64,
            auto_sync_read_ms: bag.get_int("auto_sync_read_ms", 0)? as u64,
            auto_sync_write_ms: bag.get_int("auto_sync_write_ms", 0)? as u64,
            read_cache_ms: bag.get_int("read_cache_ms", 0)? as u64,
            idle_timeout_ms: bag.get_int("idle_timeout_ms", 0)? as u64,
        };

        let packing = Packing {
            allow_packing: bag.get_bool("allow_packing", false)?,
        };

        let unit_id = bag.get_int("unit_id", 1)?;
        let unit_id = u8::try_from(unit_id)
            .map_err(|_| ArgumentError::BadParam(format!("unit_id out of range: {unit_id}")))?;

        let is_bit = bag.get_bool("is_bit", false)?;
        let bit_index = bag
            .get("bit_index")
            .map(|v| v.parse::<u8>())
            .transpose()
            .map_err(|_| ArgumentError::BadParam("bit_index must be 0-255".into()))?;

        let is_float = bag.get_bool("float", false)?;
        let use_connection = bag.get_bool("use_connection", false)?;
        let byte_order = byte_order_from_attrs(bag)?;

        let cfg = Self {
            protocol,
            gateway: Gateway { host, port },
            route,
            identity: Identity {
                name,
                elem_size,
                elem_count,
            },
            timing,
            packing,
            debug,
            is_bit,
            bit_index,
            is_float,
            use_connection,
            byte_order,
            unit_id,
            custom: bag.remaining(CONSUMED_KEYS),
        };
        cfg.validate_and_normalize()
    }

    fn validate_and_normalize(mut self) -> Result<Self, Error> {
        if self.protocol != Protocol::ModbusTcp && self.protocol != Protocol::System {
            if self.route.cpu.is_none() {
                return Err(ArgumentError::BadParam(
                    "cpu/plc is required for ab_eip and ab_eip2 tags".into(),
                )
                .into());
            }
            if let Some(path) = &self.route.path
                && path.split('.').count() == 4
                && path.split('.').all(|seg| seg.parse::<u8>().is_ok())
            {
                return Err(ArgumentError::BadParam(
                    "dotted-quad IPv4 address is not a valid CIP route path".into(),
                )
                .into());
            }
        }
        if self.is_bit && self.bit_index.is_none_or(|b| b > 7) {
            return Err(ArgumentError::BadParam(
                "is_bit requires bit_index in 0..=7".into(),
            )
            .into());
        }
        if self.use_connection && (self.protocol == Protocol::ModbusTcp || self.protocol == Protocol::System) {
            return Err(ArgumentError::BadParam(
                "use_connection only applies to CIP-family protocols".into(),
            )
            .into());
        }
        if self.protocol == Protocol::ModbusTcp && self.identity.elem_size % 2 != 0 {
            return Err(ArgumentError::BadParam(
                "elem_size must be a multiple of 2 registers for modbus_tcp tags".into(),
            )
            .into());
        }
        self.identity.name = self.identity.name.trim().to_string();
        Ok(self)
    }

    pub fn buffer_len(&self) -> usize {
        self.identity.elem_size * self.identity.elem_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_a_logix_tag() {
        let bag = AttrBag::parse(
            "protocol=ab_eip&gateway=10.0.0.1&cpu=logix&path=1,0&name=motor.speed&elem_size=4&elem_count=1",
        )
        .expect("parse");
        let cfg = TagConfig::from_attrs(&bag).expect("config");
        assert_eq!(cfg.gateway.port, 44818);
        assert_eq!(cfg.buffer_len(), 4);
    }

    #[test]
    fn resolves_a_modbus_tag_with_default_port() {
        let bag = AttrBag::parse("protocol=modbus_tcp&gateway=10.0.0.2&name=40001&elem_size=2&elem_count=10")
            .expect("parse");
        let cfg = TagConfig::from_attrs(&bag).expect("config");
        assert_eq!(cfg.gateway.port, 502);
        assert_eq!(cfg.buffer_len(), 20);
    }

    #[test]
    fn rejects_missing_cpu_for_ab_eip() {
        let bag = AttrBag::parse("protocol=ab_eip&gateway=10.0.0.1&name=foo").expect("parse");
        assert!(TagConfig::from_attrs(&bag).is_err());
    }

    #[test]
    fn rejects_dotted_quad_path() {
        let bag = AttrBag::parse(
            "protocol=ab_eip&gateway=10.0.0.1&cpu=logix&path=192.168.1.1&name=foo",
        )
        .expect("parse");
        assert!(TagConfig::from_attrs(&bag).is_err());
    }

    #[test]
    fn rejects_use_connection_for_modbus() {
        let bag = AttrBag::parse(
            "protocol=modbus_tcp&gateway=10.0.0.2&name=40001&elem_size=2&elem_count=1&use_connection=true",
        )
        .expect("parse");
        assert!(TagConfig::from_attrs(&bag).is_err());
    }

    #[test]
    fn rejects_odd_elem_size_for_modbus() {
        let bag = AttrBag::parse("protocol=modbus_tcp&gateway=10.0.0.2&name=40001&elem_size=1&elem_count=1")
            .expect("parse");
        assert!(TagConfig::from_attrs(&bag).is_err());
    }

    #[test]
    fn parses_float_and_use_connection_attrs() {
        let bag = AttrBag::parse(
            "protocol=ab_eip&gateway=10.0.0.1&cpu=logix&path=1,0&name=motor.speed&elem_size=4&elem_count=1&float=true&use_connection=true",
        )
        .expect("parse");
        let cfg = TagConfig::from_attrs(&bag).expect("config");
        assert!(cfg.is_float);
        assert!(cfg.use_connection);
    }

    #[test]
    fn str_attrs_override_the_byte_order_descriptor_defaults() {
        let bag = AttrBag::parse(
            "protocol=modbus_tcp&gateway=10.0.0.2&name=40001&elem_size=2&elem_count=10&str_is_zero_terminated=true&str_is_counted=false&str_max_capacity=20",
        )
        .expect("parse");
        let cfg = TagConfig::from_attrs(&bag).expect("config");
        assert!(cfg.byte_order.str_is_zero_terminated);
        assert!(!cfg.byte_order.str_is_counted);
        assert_eq!(cfg.byte_order.str_max_capacity, 20);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.byte_order.str_count_word_bytes, 2);
    }

    #[test]
    fn preserves_unknown_keys_in_custom() {
        let bag = AttrBag::parse(
            "protocol=ab_eip&gateway=10.0.0.1&cpu=logix&path=1,0&name=foo&vendor_x=7",
        )
        .expect("parse");
        let cfg = TagConfig::from_attrs(&bag).expect("config");
        assert_eq!(cfg.custom.get("vendor_x").map(String::as_str), Some("7"));
    }
}

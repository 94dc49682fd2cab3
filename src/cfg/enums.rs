// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ArgumentError, Error};

/// Wire protocol family selected by the `protocol` attribute key.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    #[serde(rename = "ab_eip", alias = "AB_EIP")]
    AbEip,
    #[serde(rename = "ab_eip2", alias = "AB_EIP2")]
    AbEip2,
    #[serde(rename = "modbus_tcp", alias = "MODBUS_TCP")]
    ModbusTcp,
    #[serde(rename = "system", alias = "SYSTEM")]
    System,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::AbEip => "ab_eip",
            Protocol::AbEip2 => "ab_eip2",
            Protocol::ModbusTcp => "modbus_tcp",
            Protocol::System => "system",
        })
    }
}

impl std::str::FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ab_eip" => Ok(Protocol::AbEip),
            "ab_eip2" => Ok(Protocol::AbEip2),
            "modbus_tcp" => Ok(Protocol::ModbusTcp),
            "system" => Ok(Protocol::System),
            other => Err(ArgumentError::BadParam(format!("unknown protocol: {other}")).into()),
        }
    }
}

/// CPU family, drives connection-path defaults and which tag vtable is
/// selected for an `ab_eip`/`ab_eip2` tag.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlcFamily {
    #[serde(rename = "plc5")]
    Plc5,
    #[serde(rename = "slc")]
    Slc,
    #[serde(rename = "micrologix")]
    Micrologix,
    #[serde(rename = "mlgx800")]
    Mlgx800,
    #[serde(
        rename = "logix",
        alias = "controllogix",
        alias = "compactlogix"
    )]
    Logix,
    #[serde(rename = "lgxpccc")]
    LogixPccc,
    #[serde(rename = "omron-njnx", alias = "omron_njnx")]
    OmronNjnx,
}

impl PlcFamily {
    /// Whether this family's tags are addressed with CIP symbolic tag
    /// paths (true) or PCCC logical addresses (false).
    pub fn is_symbolic(self) -> bool {
        matches!(self, PlcFamily::Logix | PlcFamily::OmronNjnx)
    }
}

impl fmt::Display for PlcFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PlcFamily::Plc5 => "plc5",
            PlcFamily::Slc => "slc",
            PlcFamily::Micrologix => "micrologix",
            PlcFamily::Mlgx800 => "mlgx800",
            PlcFamily::Logix => "logix",
            PlcFamily::LogixPccc => "lgxpccc",
            PlcFamily::OmronNjnx => "omron-njnx",
        })
    }
}

impl std::str::FromStr for PlcFamily {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plc5" => Ok(PlcFamily::Plc5),
            "slc" => Ok(PlcFamily::Slc),
            "micrologix" => Ok(PlcFamily::Micrologix),
            "mlgx800" => Ok(PlcFamily::Mlgx800),
            "logix" | "controllogix" | "compactlogix" => Ok(PlcFamily::Logix),
            "lgxpccc" => Ok(PlcFamily::LogixPccc),
            "omron-njnx" | "omron_njnx" => Ok(PlcFamily::OmronNjnx),
            other => Err(ArgumentError::BadParam(format!("unknown cpu/plc: {other}")).into()),
        }
    }
}

/// Event kinds delivered to a tag's callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    ReadStarted,
    ReadCompleted,
    WriteStarted,
    WriteCompleted,
    Aborted,
    Destroyed,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventKind::Created => "CREATED",
            EventKind::ReadStarted => "READ_STARTED",
            EventKind::ReadCompleted => "READ_COMPLETED",
            EventKind::WriteStarted => "WRITE_STARTED",
            EventKind::WriteCompleted => "WRITE_COMPLETED",
            EventKind::Aborted => "ABORTED",
            EventKind::Destroyed => "DESTROYED",
        })
    }
}

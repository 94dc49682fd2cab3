// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Wire-format codecs: EtherNet/IP encapsulation, CIP, PCCC, and
//! Modbus-TCP.

pub mod cip;
pub mod eip;
pub mod modbus;
pub mod pccc;

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Black-box scenarios driven entirely through [`plc_tag_rs::TagClient`],
//! each against a purpose-built dummy gateway rather than a real PLC.

mod integration_tests {
    pub mod common;

    pub mod logix_read_write;
    pub mod modbus_read_write;
}

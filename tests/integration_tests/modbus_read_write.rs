// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, Mutex};

use plc_tag_rs::TagClient;

use crate::integration_tests::common::spawn_modbus_register_file;

#[tokio::test]
async fn write_then_read_round_trips_through_a_modbus_gateway() {
    let registers = Arc::new(Mutex::new(vec![0u8; 16]));
    let addr = spawn_modbus_register_file(Arc::clone(&registers)).await;

    let client = TagClient::new();
    let attrs = format!(
        "protocol=modbus_tcp&gateway={}&port={}&name=40001&elem_size=2&elem_count=2",
        addr.ip(),
        addr.port()
    );
    let handle = client.create(&attrs, 1000, None).await.expect("create");

    client.set_u16(handle, 0, 0x1234).await.expect("set");
    client.set_u16(handle, 2, 0x5678).await.expect("set");
    client.write(handle, 1000).await.expect("write");

    // A second tag on the same gateway, starting from a clean buffer,
    // must observe what the first tag just wrote on the wire.
    let handle2 = client.create(&attrs, 1000, None).await.expect("create second tag");
    client.read(handle2, 1000).await.expect("read");
    assert_eq!(client.get_u16(handle2, 0).await.expect("get"), 0x1234);
    assert_eq!(client.get_u16(handle2, 2).await.expect("get"), 0x5678);
}

#[tokio::test]
async fn write_multiple_registers_then_read_back() {
    let registers = Arc::new(Mutex::new(vec![0u8; 64]));
    let addr = spawn_modbus_register_file(Arc::clone(&registers)).await;

    let client = TagClient::new();
    let attrs = format!(
        "protocol=modbus_tcp&gateway={}&port={}&name=40010&elem_size=2&elem_count=8",
        addr.ip(),
        addr.port()
    );
    let handle = client.create(&attrs, 1000, None).await.expect("create");
    for i in 0..8u16 {
        client.set_u16(handle, (i as usize) * 2, i * 11).await.expect("set");
    }
    client.write(handle, 1000).await.expect("write");

    let handle2 = client.create(&attrs, 1000, None).await.expect("create second");
    client.read(handle2, 1000).await.expect("read");
    for i in 0..8u16 {
        assert_eq!(client.get_u16(handle2, (i as usize) * 2).await.expect("get"), i * 11);
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, Mutex};

use plc_tag_rs::TagClient;

use crate::integration_tests::common::spawn_logix_gateway;

#[tokio::test]
async fn write_then_read_round_trips_through_a_logix_gateway() {
    let tag_memory = Arc::new(Mutex::new(vec![0u8; 4]));
    let addr = spawn_logix_gateway(Arc::clone(&tag_memory)).await;

    let client = TagClient::new();
    let attrs = format!(
        "protocol=ab_eip&gateway={}&port={}&cpu=logix&name=motor.speed&elem_size=4&elem_count=1",
        addr.ip(),
        addr.port()
    );
    let handle = client.create(&attrs, 1000, None).await.expect("create");

    client.set_u32(handle, 0, 0xdead_beef).await.expect("set");
    client.write(handle, 1000).await.expect("write");
    assert_eq!(tag_memory.lock().expect("lock").as_slice(), &0xdead_beefu32.to_le_bytes());

    client.set_u32(handle, 0, 0).await.expect("clear local buffer");
    client.read(handle, 1000).await.expect("read");
    assert_eq!(client.get_u32(handle, 0).await.expect("get"), 0xdead_beef);
}

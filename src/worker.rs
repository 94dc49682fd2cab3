// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The cross-tag auto-sync sweep: one Tokio task per [`crate::client::TagClient`]
//! that polls every registered tag for its declared `auto_sync_read_ms`/
//! `auto_sync_write_ms` interval, the way the teacher's connection pool
//! runs a single background task rather than one timer per session.
//! Per-session idle-disconnect is unrelated to this and is handled
//! inside [`crate::session::Session`]'s own receive loop.

use std::time::Duration;

use tracing::debug;

use crate::registry::TagRegistry;

/// How often the sweep runs. Finer than any sane auto-sync interval, so
/// declared intervals are honored within this much jitter.
const SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// Spawn the sweep as a detached task tied to `registry`'s lifetime. The
/// caller is expected to keep the returned handle and abort it when the
/// owning client is dropped; letting it run past that point would just
/// poll an otherwise-unreachable, still-`Clone`d registry forever.
pub fn spawn_auto_sync_worker(registry: TagRegistry) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tick.tick().await;
            for tag in registry.snapshot() {
                if tag.due_for_auto_read().await {
                    let tag = tag.clone();
                    tokio::spawn(async move {
                        if let Err(e) = tag.read(0).await {
                            debug!(handle = tag.handle, error = %e, "auto-sync read did not start");
                        }
                    });
                }
                if tag.due_for_auto_write().await {
                    let tag = tag.clone();
                    tokio::spawn(async move {
                        if let Err(e) = tag.write(0).await {
                            debug!(handle = tag.handle, error = %e, "auto-sync write did not start");
                        }
                    });
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        sync::Arc,
        time::Duration,
    };

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;
    use crate::{
        cfg::{attr::AttrBag, config::TagConfig},
        session::{Session, SessionKey},
        tag::Tag,
    };

    /// A Modbus server that answers every Read Holding Registers request
    /// with zeroed registers, so an auto-sync read actually completes
    /// instead of timing out.
    async fn spawn_modbus_stub(reads_seen: Arc<std::sync::atomic::AtomicUsize>) -> SocketAddr {
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
                reads_seen.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let quantity = u16::from_be_bytes([pdu[3], pdu[4]]);
                let byte_count = (quantity * 2) as u8;
                let mut reply = header;
                reply[4..6].copy_from_slice(&((2 + byte_count as u16).to_be_bytes()));
                let mut frame = reply.to_vec();
                frame.push(0x03);
                frame.push(byte_count);
                frame.extend(std::iter::repeat(0u8).take(byte_count as usize));
                if stream.write_all(&frame).await.is_err() {
                    return;
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn sweep_reissues_reads_at_the_declared_interval() {
        let reads_seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let addr = spawn_modbus_stub(Arc::clone(&reads_seen)).await;

        let bag = AttrBag::parse(&format!(
            "protocol=modbus_tcp&gateway={}&port={}&name=hr0&elem_size=2&elem_count=1&auto_sync_read_ms=20",
            addr.ip(),
            addr.port()
        ))
        .expect("parse");
        let cfg = TagConfig::from_attrs(&bag).expect("config");
        let key = SessionKey {
            host: addr.ip().to_string(),
            port: addr.port(),
            protocol: cfg.protocol,
        };
        let session = Session::connect(key, Duration::from_secs(1), None).await.expect("connect");
        let tag = Tag::new(1, cfg, session, None).expect("tag");

        let registry = TagRegistry::new();
        registry.insert(tag);
        let handle = spawn_auto_sync_worker(registry.clone());

        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.abort();

        assert!(
            reads_seen.load(std::sync::atomic::Ordering::Relaxed) >= 2,
            "expected at least two auto-sync reads within 300ms at a 20ms interval"
        );
    }

    #[tokio::test]
    async fn a_tag_with_no_auto_sync_interval_is_never_swept() {
        let reads_seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let addr = spawn_modbus_stub(Arc::clone(&reads_seen)).await;

        let bag = AttrBag::parse(&format!(
            "protocol=modbus_tcp&gateway={}&port={}&name=hr0&elem_size=2&elem_count=1",
            addr.ip(),
            addr.port()
        ))
        .expect("parse");
        let cfg = TagConfig::from_attrs(&bag).expect("config");
        let key = SessionKey {
            host: addr.ip().to_string(),
            port: addr.port(),
            protocol: cfg.protocol,
        };
        let session = Session::connect(key, Duration::from_secs(1), None).await.expect("connect");
        let tag = Tag::new(1, cfg, session, None).expect("tag");

        let registry = TagRegistry::new();
        registry.insert(tag);
        let handle = spawn_auto_sync_worker(registry.clone());

        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.abort();

        assert_eq!(reads_seen.load(std::sync::atomic::Ordering::Relaxed), 0);
    }
}

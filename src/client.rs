// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The public, caller-facing tag API.
//!
//! [`TagClient`] is the single entry point applications construct: it
//! owns the tag registry and the session pool every tag it creates
//! draws its connection from, and every method resolves a handle
//! through the registry before touching the tag itself, so operating on
//! an unknown or already-destroyed handle always fails the same way no
//! matter which operation was attempted.
//!
//! Every operation here is natively async, mirroring the teacher's
//! `ClientConnection`; the `_blocking` wrappers alongside them are a
//! thin convenience layer for callers with no Tokio runtime of their
//! own, built on a lazily-started, process-wide runtime rather than one
//! owned per `TagClient`.

use std::{sync::Arc, time::Duration};

use once_cell::sync::OnceCell;

use crate::{
    cfg::{attr::AttrBag, config::TagConfig},
    error::{Error, ResourceError},
    registry::TagRegistry,
    session::{SessionKey, SessionPool},
    tag::{Tag, TagCallback},
    worker,
};

pub use crate::tag::TagHandle;

static BLOCKING_RUNTIME: OnceCell<tokio::runtime::Runtime> = OnceCell::new();

fn blocking_runtime() -> Result<&'static tokio::runtime::Runtime, Error> {
    BLOCKING_RUNTIME.get_or_try_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| ResourceError::CreateFailed(e.to_string()))
    })
}

/// Applications construct one of these per process (or per logical
/// group of gateways) and share it across every tag they operate on.
pub struct TagClient {
    registry: TagRegistry,
    sessions: SessionPool,
    auto_sync: tokio::task::JoinHandle<()>,
}

impl Default for TagClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TagClient {
    fn drop(&mut self) {
        self.auto_sync.abort();
    }
}

impl TagClient {
    /// Construct a client with its own tag registry, session pool, and
    /// background auto-sync sweep. Must be called from inside a Tokio
    /// runtime (the sweep task is spawned immediately).
    pub fn new() -> Self {
        let registry = TagRegistry::new();
        let auto_sync = worker::spawn_auto_sync_worker(registry.clone());
        Self {
            registry,
            sessions: SessionPool::new(),
            auto_sync,
        }
    }

    /// Parse an attribute string, resolve it into a [`TagConfig`], open
    /// or reuse the gateway session it names, and register a new tag.
    /// `timeout_ms` bounds only the connect/handshake a brand-new
    /// session requires; `0` falls back to the tag's own `timeout_ms`
    /// attribute (defaulting to five seconds).
    pub async fn create(
        &self,
        attr_string: &str,
        timeout_ms: u64,
        callback: Option<TagCallback>,
    ) -> Result<TagHandle, Error> {
        let bag = AttrBag::parse(attr_string)?;
        let cfg = TagConfig::from_attrs(&bag)?;

        let connect_timeout = Duration::from_millis(if timeout_ms > 0 {
            timeout_ms
        } else {
            cfg.timing.timeout_ms
        });
        let idle_timeout = (cfg.timing.idle_timeout_ms > 0).then(|| Duration::from_millis(cfg.timing.idle_timeout_ms));

        let key = SessionKey {
            host: cfg.gateway.host.clone(),
            port: cfg.gateway.port,
            protocol: cfg.protocol,
        };
        let session = self.sessions.get_or_connect(key, connect_timeout, idle_timeout).await?;

        let handle = self.registry.alloc_handle();
        let tag = Tag::new(handle, cfg, session, callback)?;
        self.registry.insert(tag);
        Ok(handle)
    }

    pub fn create_blocking(
        &self,
        attr_string: &str,
        timeout_ms: u64,
        callback: Option<TagCallback>,
    ) -> Result<TagHandle, Error> {
        blocking_runtime()?.block_on(self.create(attr_string, timeout_ms, callback))
    }

    fn resolve(&self, handle: TagHandle) -> Result<Arc<Tag>, Error> {
        self.registry.get(handle)
    }

    pub async fn read(&self, handle: TagHandle, timeout_ms: u64) -> Result<(), Error> {
        self.resolve(handle)?.read(timeout_ms).await
    }

    pub fn read_blocking(&self, handle: TagHandle, timeout_ms: u64) -> Result<(), Error> {
        blocking_runtime()?.block_on(self.read(handle, timeout_ms))
    }

    pub async fn write(&self, handle: TagHandle, timeout_ms: u64) -> Result<(), Error> {
        self.resolve(handle)?.write(timeout_ms).await
    }

    pub fn write_blocking(&self, handle: TagHandle, timeout_ms: u64) -> Result<(), Error> {
        blocking_runtime()?.block_on(self.write(handle, timeout_ms))
    }

    pub async fn status(&self, handle: TagHandle) -> Result<(), Error> {
        self.resolve(handle)?.status().await
    }

    pub fn status_blocking(&self, handle: TagHandle) -> Result<(), Error> {
        blocking_runtime()?.block_on(self.status(handle))
    }

    pub async fn abort(&self, handle: TagHandle) -> Result<(), Error> {
        self.resolve(handle)?.abort().await
    }

    pub fn abort_blocking(&self, handle: TagHandle) -> Result<(), Error> {
        blocking_runtime()?.block_on(self.abort(handle))
    }

    /// Abort any in-flight operation and permanently invalidate
    /// `handle`. A concurrent `get_or_connect` on the same gateway
    /// session is unaffected; sessions are reference counted and
    /// outlive any single tag.
    pub async fn destroy(&self, handle: TagHandle) -> Result<(), Error> {
        let tag = self.registry.remove(handle).ok_or(crate::error::ArgumentError::InvalidHandle(handle))?;
        tag.destroy().await
    }

    pub fn destroy_blocking(&self, handle: TagHandle) -> Result<(), Error> {
        blocking_runtime()?.block_on(self.destroy(handle))
    }

    pub async fn get_int_attrib(&self, handle: TagHandle, name: &str) -> Result<i64, Error> {
        self.resolve(handle)?.get_int_attrib(name).await
    }

    pub fn get_int_attrib_blocking(&self, handle: TagHandle, name: &str) -> Result<i64, Error> {
        blocking_runtime()?.block_on(self.get_int_attrib(handle, name))
    }

    pub async fn set_int_attrib(&self, handle: TagHandle, name: &str, value: i64) -> Result<(), Error> {
        self.resolve(handle)?.set_int_attrib(name, value).await
    }

    pub fn set_int_attrib_blocking(&self, handle: TagHandle, name: &str, value: i64) -> Result<(), Error> {
        blocking_runtime()?.block_on(self.set_int_attrib(handle, name, value))
    }

    pub async fn get_bit(&self, handle: TagHandle, byte_offset: usize, bit_index: u8) -> Result<bool, Error> {
        self.resolve(handle)?.get_bit(byte_offset, bit_index).await
    }

    pub async fn set_bit(&self, handle: TagHandle, byte_offset: usize, bit_index: u8, value: bool) -> Result<(), Error> {
        self.resolve(handle)?.set_bit(byte_offset, bit_index, value).await
    }

    pub async fn get_string(&self, handle: TagHandle, offset: usize) -> Result<String, Error> {
        self.resolve(handle)?.get_string(offset).await
    }

    pub async fn set_string(&self, handle: TagHandle, offset: usize, value: &str) -> Result<(), Error> {
        self.resolve(handle)?.set_string(offset, value).await
    }

    /// Number of tags currently registered, mostly useful in tests.
    pub fn tag_count(&self) -> usize {
        self.registry.len()
    }
}

macro_rules! client_scalar_accessors {
    ($get:ident, $set:ident, $ty:ty) => {
        impl TagClient {
            pub async fn $get(&self, handle: TagHandle, offset: usize) -> Result<$ty, Error> {
                self.resolve(handle)?.$get(offset).await
            }

            pub async fn $set(&self, handle: TagHandle, offset: usize, value: $ty) -> Result<(), Error> {
                self.resolve(handle)?.$set(offset, value).await
            }
        }
    };
}

client_scalar_accessors!(get_u8, set_u8, u8);
client_scalar_accessors!(get_i8, set_i8, i8);
client_scalar_accessors!(get_u16, set_u16, u16);
client_scalar_accessors!(get_i16, set_i16, i16);
client_scalar_accessors!(get_u32, set_u32, u32);
client_scalar_accessors!(get_i32, set_i32, i32);
client_scalar_accessors!(get_u64, set_u64, u64);
client_scalar_accessors!(get_i64, set_i64, i64);
client_scalar_accessors!(get_f32, set_f32, f32);
client_scalar_accessors!(get_f64, set_f64, f64);

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The tag state machine: per-protocol request building and reply
//! parsing (`TagProtocol`, dispatched through `enum_dispatch` the way
//! the teacher dispatches its PDU traits over a session's login state),
//! plus `Tag` itself, which owns the shadow buffer and drives reads and
//! writes over a shared [`crate::session::Session`].
//!
//! `TagProtocol` only covers synchronous encode/decode: `enum_dispatch`
//! does not support async trait methods cleanly, so the actual network
//! I/O (session sends, ForwardOpen, timeouts) stays as ordinary async
//! code on `Tag`'s own methods, which call into a family only to build
//! or parse one wire message at a time.

use std::{
    sync::{
        atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use enum_dispatch::enum_dispatch;
use tokio::{
    sync::{mpsc, oneshot, Mutex, RwLock},
    task::AbortHandle,
    time::Instant,
};

use crate::{
    cfg::{
        config::TagConfig,
        enums::{EventKind, Protocol},
    },
    codec::byte_order::{self, ByteOrderDescriptor},
    connection::Connection,
    error::{ArgumentError, Error, ProtocolError, TransportError},
    protocol::{cip, modbus, pccc},
    session::Session,
    utils::generate_orig_connection_id,
};

/// Vendor id this client presents in CIP `ForwardOpen` and PCCC
/// `Execute PCCC` requests.
const VENDOR_ID: u16 = 0x0001;

/// Default number of times a single request retries after a transient
/// transport failure before the read/write it belongs to gives up.
const DEFAULT_RETRIES: u32 = 5;

/// Delay between retry attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(900);

/// Largest single CIP request/reply payload this client assumes fits in
/// one unconnected packet; Logix-class reads/writes larger than this
/// are split across multiple `Read/Write Tag Fragmented` calls.
const CIP_MAX_CHUNK_BYTES: usize = 480;

/// Largest single PCCC command payload, leaving headroom in the
/// protocol's one-byte `byte_size` field for command/address/BCC
/// framing.
const PCCC_MAX_CHUNK_BYTES: usize = 232;

/// Largest number of Modbus holding registers requested in one
/// `Read Holding Registers`/`Write Multiple Registers` call, kept a
/// little under the 125-register wire ceiling.
const MODBUS_MAX_REGISTERS: usize = 120;

/// How long an `allow_packing` read waits for siblings before its
/// session flushes a Multi-Service Packet. Short enough that a lone read
/// barely notices the wait; long enough for reads issued from the same
/// application tick to land in the same session's pack queue.
const PACK_DEBOUNCE: Duration = Duration::from_millis(2);

/// Positive, process-wide-unique identifier for a live tag. Stable for
/// the tag's lifetime; never reused before the handle is fully released.
pub type TagHandle = u32;

/// Callback invoked for every lifecycle event on a tag. Runs detached
/// (via `tokio::spawn`), so it may call back into the public API without
/// deadlocking the tag it was invoked for.
pub type TagCallback = Arc<dyn Fn(TagHandle, EventKind, Result<(), Error>) + Send + Sync>;

/// How a family's wire requests reach the PLC.
#[derive(Debug, Clone)]
pub enum Transport {
    /// Unconnected CIP messaging. `route_path` is non-empty only when
    /// the tag's `path` attribute names backplane hops the request must
    /// be wrapped in an `Unconnected Send` to traverse.
    CipUnconnected { route_path: Vec<u8> },
    /// CIP connected messaging (ForwardOpen-based).
    CipConnected { connection_path: Vec<u8> },
    Modbus,
}

/// Pure encode/decode operations a protocol family supplies. Byte
/// offsets and lengths are always in application-buffer terms; each
/// family translates them into its own addressing (CIP element counts,
/// PCCC element numbers, Modbus register numbers).
#[enum_dispatch]
pub trait TagProtocol {
    /// Largest byte range this family will ask for or send in one wire
    /// request.
    fn max_chunk_bytes(&self) -> usize;
    /// Width in bytes of one buffer element, used to convert a byte
    /// range into this family's native element count.
    fn elem_size(&self) -> usize;
    fn build_read(&self, byte_offset: usize, byte_len: usize) -> Result<Vec<u8>, Error>;
    fn build_write(&self, byte_offset: usize, data: &[u8]) -> Result<Vec<u8>, Error>;
    /// Decode a reply to `build_read`, returning the application bytes
    /// it carried (owned, since Modbus replies need byte-swapping per
    /// register before they match the little-endian buffer convention).
    fn parse_read_reply(&self, reply: &[u8]) -> Result<Vec<u8>, Error>;
    fn parse_write_reply(&self, reply: &[u8]) -> Result<(), Error>;
    fn transport(&self) -> Transport;
}

/// Logix-class CIP tag: symbolic tag path, optional connected
/// messaging, optional backplane routing via `Unconnected Send`.
pub struct CipLogixFamily {
    path: Vec<u8>,
    data_type: u16,
    elem_size: usize,
    route_path: Vec<u8>,
    connection_path: Option<Vec<u8>>,
}

impl CipLogixFamily {
    fn from_config(cfg: &TagConfig) -> Result<Self, Error> {
        let path = cip::encode_symbolic_path(&cfg.identity.name)?;
        let data_type = cip::data_type_for_elem_size(cfg.identity.elem_size as u32, cfg.is_float)?;
        let route_path = match &cfg.route.path {
            Some(p) => {
                let parsed = cip::parse_connection_path(p)?;
                cip::encode_connection_path(&parsed, true)
            },
            None => Vec::new(),
        };
        let connection_path = cfg.use_connection.then(|| route_path.clone());
        Ok(Self {
            path,
            data_type,
            elem_size: cfg.identity.elem_size,
            route_path,
            connection_path,
        })
    }
}

impl TagProtocol for CipLogixFamily {
    fn max_chunk_bytes(&self) -> usize {
        CIP_MAX_CHUNK_BYTES
    }

    fn elem_size(&self) -> usize {
        self.elem_size
    }

    fn build_read(&self, byte_offset: usize, byte_len: usize) -> Result<Vec<u8>, Error> {
        let element_count = ((byte_len / self.elem_size).max(1)) as u16;
        Ok(cip::build_read_tag_fragmented(&self.path, element_count, byte_offset as u32))
    }

    fn build_write(&self, byte_offset: usize, data: &[u8]) -> Result<Vec<u8>, Error> {
        let element_count = ((data.len() / self.elem_size).max(1)) as u16;
        Ok(cip::build_write_tag_fragmented(
            &self.path,
            self.data_type,
            element_count,
            byte_offset as u32,
            data,
        ))
    }

    fn parse_read_reply(&self, reply: &[u8]) -> Result<Vec<u8>, Error> {
        let parsed = cip::parse_reply(reply)?;
        if parsed.general_status != cip::STATUS_SUCCESS {
            return Err(cip::status_to_error(parsed.general_status));
        }
        // Read Tag (Fragmented) replies carry a 2-byte CIP data-type code
        // ahead of the element data itself.
        Ok(parsed.data.get(2..).unwrap_or(&[]).to_vec())
    }

    fn parse_write_reply(&self, reply: &[u8]) -> Result<(), Error> {
        let parsed = cip::parse_reply(reply)?;
        if parsed.general_status != cip::STATUS_SUCCESS {
            return Err(cip::status_to_error(parsed.general_status));
        }
        Ok(())
    }

    fn transport(&self) -> Transport {
        match &self.connection_path {
            Some(path) => Transport::CipConnected {
                connection_path: path.clone(),
            },
            None => Transport::CipUnconnected {
                route_path: self.route_path.clone(),
            },
        }
    }
}

/// PLC-5/SLC/MicroLogix-class tag, addressed through PCCC logical
/// addresses and carried inside CIP `Execute PCCC Object` requests.
/// Routing (including any DH+ hop) is baked directly into the
/// `Execute PCCC` request's own path, so unlike the Logix family this
/// one never needs a separate `Unconnected Send` wrapper.
pub struct CipPcccFamily {
    base_address: pccc::LogicalAddress,
    elem_size: usize,
    execute_path: Vec<u8>,
    orig_serial: u32,
    tns: AtomicU16,
}

impl CipPcccFamily {
    fn from_config(cfg: &TagConfig) -> Result<Self, Error> {
        let base_address = pccc::parse_logical_address(&cfg.identity.name)?;
        let mut execute_path = cip::PCCC_OBJECT_PATH.to_vec();
        if let Some(p) = &cfg.route.path {
            let parsed = cip::parse_connection_path(p)?;
            execute_path.extend_from_slice(&cip::encode_connection_path(&parsed, false));
        }
        Ok(Self {
            base_address,
            elem_size: cfg.identity.elem_size,
            execute_path,
            orig_serial: generate_orig_connection_id(),
            tns: AtomicU16::new(1),
        })
    }

    fn address_at(&self, byte_offset: usize) -> pccc::LogicalAddress {
        let mut addr = self.base_address;
        let elements = (byte_offset / self.elem_size.max(1)) as u16;
        addr.element = addr.element.wrapping_add(elements);
        addr
    }

    fn next_tns(&self) -> u16 {
        self.tns.fetch_add(1, Ordering::Relaxed)
    }
}

impl TagProtocol for CipPcccFamily {
    fn max_chunk_bytes(&self) -> usize {
        PCCC_MAX_CHUNK_BYTES
    }

    fn elem_size(&self) -> usize {
        self.elem_size
    }

    fn build_read(&self, byte_offset: usize, byte_len: usize) -> Result<Vec<u8>, Error> {
        let addr = self.address_at(byte_offset);
        let byte_size = byte_len.min(u8::MAX as usize) as u8;
        let pccc_cmd = pccc::build_typed_read(self.next_tns(), &addr, byte_size);
        Ok(cip::build_execute_pccc(&self.execute_path, VENDOR_ID, self.orig_serial, &pccc_cmd))
    }

    fn build_write(&self, byte_offset: usize, data: &[u8]) -> Result<Vec<u8>, Error> {
        let addr = self.address_at(byte_offset);
        let pccc_cmd = pccc::build_typed_write(self.next_tns(), &addr, data)?;
        Ok(cip::build_execute_pccc(&self.execute_path, VENDOR_ID, self.orig_serial, &pccc_cmd))
    }

    fn parse_read_reply(&self, reply: &[u8]) -> Result<Vec<u8>, Error> {
        let parsed = cip::parse_reply(reply)?;
        if parsed.general_status != cip::STATUS_SUCCESS {
            return Err(cip::status_to_error(parsed.general_status));
        }
        Ok(pccc::parse_typed_reply(parsed.data)?.to_vec())
    }

    fn parse_write_reply(&self, reply: &[u8]) -> Result<(), Error> {
        let parsed = cip::parse_reply(reply)?;
        if parsed.general_status != cip::STATUS_SUCCESS {
            return Err(cip::status_to_error(parsed.general_status));
        }
        pccc::parse_typed_reply(parsed.data)?;
        Ok(())
    }

    fn transport(&self) -> Transport {
        Transport::CipUnconnected { route_path: Vec::new() }
    }
}

/// A Modbus-TCP holding-register tag.
pub struct ModbusFamily {
    unit_id: u8,
    start_address: u16,
    elem_size: usize,
    txn: AtomicU16,
}

impl ModbusFamily {
    fn from_config(cfg: &TagConfig) -> Result<Self, Error> {
        let start_address = modbus::parse_address(&cfg.identity.name)?;
        Ok(Self {
            unit_id: cfg.unit_id,
            start_address,
            elem_size: cfg.identity.elem_size,
            txn: AtomicU16::new(1),
        })
    }

    fn next_txn(&self) -> u16 {
        self.txn.fetch_add(1, Ordering::Relaxed)
    }
}

impl TagProtocol for ModbusFamily {
    fn max_chunk_bytes(&self) -> usize {
        MODBUS_MAX_REGISTERS * 2
    }

    fn elem_size(&self) -> usize {
        self.elem_size
    }

    fn build_read(&self, byte_offset: usize, byte_len: usize) -> Result<Vec<u8>, Error> {
        let reg_offset = (byte_offset / 2) as u16;
        let reg_count = byte_len.div_ceil(2) as u16;
        Ok(modbus::build_read_holding_registers(
            self.next_txn(),
            self.unit_id,
            self.start_address.wrapping_add(reg_offset),
            reg_count,
        ))
    }

    fn build_write(&self, byte_offset: usize, data: &[u8]) -> Result<Vec<u8>, Error> {
        let reg_offset = (byte_offset / 2) as u16;
        let address = self.start_address.wrapping_add(reg_offset);
        if data.len() == 2 {
            let value = u16::from_le_bytes([data[0], data[1]]);
            return Ok(modbus::build_write_single_register(self.next_txn(), self.unit_id, address, value));
        }
        let values: Vec<u16> = data
            .chunks(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair.get(1).copied().unwrap_or(0)]))
            .collect();
        Ok(modbus::build_write_multiple_registers(self.next_txn(), self.unit_id, address, &values))
    }

    fn parse_read_reply(&self, reply: &[u8]) -> Result<Vec<u8>, Error> {
        let parsed = modbus::parse_reply(reply)?;
        let registers = parsed.data.get(1..).unwrap_or(&[]);
        let mut out = Vec::with_capacity(registers.len());
        for pair in registers.chunks(2) {
            out.push(pair[pair.len() - 1]);
            if pair.len() == 2 {
                out.push(pair[0]);
            }
        }
        Ok(out)
    }

    fn parse_write_reply(&self, reply: &[u8]) -> Result<(), Error> {
        modbus::parse_reply(reply)?;
        Ok(())
    }

    fn transport(&self) -> Transport {
        Transport::Modbus
    }
}

/// The per-protocol vtable a tag dispatches through, selected once at
/// creation time from the tag's resolved [`TagConfig`].
#[enum_dispatch(TagProtocol)]
pub enum TagFamily {
    CipLogix(CipLogixFamily),
    CipPccc(CipPcccFamily),
    Modbus(ModbusFamily),
}

impl TagFamily {
    pub fn from_config(cfg: &TagConfig) -> Result<Self, Error> {
        match cfg.protocol {
            Protocol::ModbusTcp => Ok(TagFamily::Modbus(ModbusFamily::from_config(cfg)?)),
            Protocol::System => {
                Err(ArgumentError::Unsupported("system pseudo-tags are not implemented".into()).into())
            },
            Protocol::AbEip | Protocol::AbEip2 => {
                let cpu = cfg
                    .route
                    .cpu
                    .ok_or_else(|| ArgumentError::BadParam("cpu/plc is required".into()))?;
                if cpu.is_symbolic() {
                    Ok(TagFamily::CipLogix(CipLogixFamily::from_config(cfg)?))
                } else {
                    Ok(TagFamily::CipPccc(CipPcccFamily::from_config(cfg)?))
                }
            },
        }
    }
}

/// Coarse lifecycle state of a tag's current (or most recent) operation.
/// The actual "at most one read and one write in flight" rule is
/// enforced by `read_lock`/`write_lock`, not by this field; it exists so
/// a caller inspecting a tag mid-operation sees something more specific
/// than "busy".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagState {
    Idle,
    ReadRequested,
    ReadInFlight,
    ReadResponse,
    WriteRequested,
    WriteInFlight,
    WriteResponse,
}

fn snapshot_status(result: &Result<(), Error>) -> Result<(), Error> {
    match result {
        Ok(()) => Ok(()),
        Err(e) => Err(e.shallow_clone()),
    }
}

/// Transient transport failures worth a second attempt: the reply never
/// arrived, or arrived but didn't parse. Argument/resource errors and
/// PLC-returned bad-status replies are excluded on purpose.
fn is_transient(err: &Error) -> bool {
    matches!(
        err,
        Error::Transport(TransportError::Timeout | TransportError::NoData | TransportError::Partial | TransportError::BadReply(_))
    )
}

/// One addressable PLC variable: its shadow buffer, status, and the
/// session it talks over. Exclusively owned by the tag registry; shared
/// with callers only through a handle.
pub struct Tag {
    pub handle: TagHandle,
    cfg: TagConfig,
    family: TagFamily,
    session: Session,
    connection: Option<Mutex<Connection>>,
    conn_orig_serial: u32,
    buffer: Mutex<Vec<u8>>,
    byte_order: ByteOrderDescriptor,
    status: RwLock<Result<(), Error>>,
    state: Mutex<TagState>,
    read_lock: Arc<Mutex<()>>,
    write_lock: Arc<Mutex<()>>,
    /// Events queue here rather than spawning one detached task per
    /// `fire()` call, so a dedicated drain task invokes the callback in
    /// the order events were raised even when several race to fire close
    /// together (e.g. `ReadCompleted` immediately followed by `Destroyed`).
    callback_tx: Option<mpsc::UnboundedSender<(EventKind, Result<(), Error>)>>,
    read_cache_expiry: Mutex<Option<Instant>>,
    last_read_at: Mutex<Option<Instant>>,
    last_write_at: Mutex<Option<Instant>>,
    read_op: Mutex<Option<AbortHandle>>,
    write_op: Mutex<Option<AbortHandle>>,
    read_cache_ms: AtomicU64,
    auto_sync_read_ms: AtomicU64,
    auto_sync_write_ms: AtomicU64,
    idle_timeout_ms: AtomicU64,
}

impl Tag {
    pub fn new(
        handle: TagHandle,
        cfg: TagConfig,
        session: Session,
        callback: Option<TagCallback>,
    ) -> Result<Arc<Self>, Error> {
        let family = TagFamily::from_config(&cfg)?;
        let connection = match family.transport() {
            Transport::CipConnected { connection_path } => Some(Mutex::new(Connection::new(connection_path))),
            _ => None,
        };
        let buffer_len = cfg.buffer_len();
        let byte_order = cfg.byte_order;
        let read_cache_ms = cfg.timing.read_cache_ms;
        let auto_sync_read_ms = cfg.timing.auto_sync_read_ms;
        let auto_sync_write_ms = cfg.timing.auto_sync_write_ms;
        let idle_timeout_ms = cfg.timing.idle_timeout_ms;

        let callback_tx = callback.map(|cb| {
            let (tx, mut rx) = mpsc::unbounded_channel::<(EventKind, Result<(), Error>)>();
            tokio::spawn(async move {
                while let Some((kind, result)) = rx.recv().await {
                    cb(handle, kind, result);
                }
            });
            tx
        });

        let tag = Arc::new(Self {
            handle,
            cfg,
            family,
            session,
            connection,
            conn_orig_serial: generate_orig_connection_id(),
            buffer: Mutex::new(vec![0u8; buffer_len]),
            byte_order,
            status: RwLock::new(Ok(())),
            state: Mutex::new(TagState::Idle),
            read_lock: Arc::new(Mutex::new(())),
            write_lock: Arc::new(Mutex::new(())),
            callback_tx,
            read_cache_expiry: Mutex::new(None),
            last_read_at: Mutex::new(None),
            last_write_at: Mutex::new(None),
            read_op: Mutex::new(None),
            write_op: Mutex::new(None),
            read_cache_ms: AtomicU64::new(read_cache_ms),
            auto_sync_read_ms: AtomicU64::new(auto_sync_read_ms),
            auto_sync_write_ms: AtomicU64::new(auto_sync_write_ms),
            idle_timeout_ms: AtomicU64::new(idle_timeout_ms),
        });
        tag.fire(EventKind::Created, Ok(()));
        Ok(tag)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        let ms = self.idle_timeout_ms.load(Ordering::Relaxed);
        (ms > 0).then(|| Duration::from_millis(ms))
    }

    fn fire(&self, kind: EventKind, result: Result<(), Error>) {
        if let Some(tx) = &self.callback_tx {
            // An unbounded send only fails if the drain task's receiver
            // was dropped, which happens only if the task itself panicked;
            // there is no callback left to invoke either way.
            let _ = tx.send((kind, result));
        }
    }

    pub async fn status(&self) -> Result<(), Error> {
        snapshot_status(&self.status.read().await)
    }

    pub async fn state(&self) -> TagState {
        *self.state.lock().await
    }

    /// Start a read, honoring the read cache. Returns immediately with
    /// `Ok(())` when `timeout_ms == 0` (fire-and-forget, poll `status`
    /// for completion); otherwise blocks until the read completes, fails,
    /// or `timeout_ms` elapses.
    pub async fn read(self: &Arc<Self>, timeout_ms: u64) -> Result<(), Error> {
        if self.read_cache_ms.load(Ordering::Relaxed) > 0
            && let Some(expiry) = *self.read_cache_expiry.lock().await
            && Instant::now() < expiry
        {
            return Ok(());
        }

        let guard = self
            .read_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| Error::from(ProtocolError::Busy))?;

        *self.state.lock().await = TagState::ReadRequested;
        *self.status.write().await = Err(ProtocolError::Pending.into());
        *self.last_read_at.lock().await = Some(Instant::now());
        self.fire(EventKind::ReadStarted, Err(ProtocolError::Pending.into()));

        let (done_tx, done_rx) = oneshot::channel();
        let tag = Arc::clone(self);
        let join = tokio::spawn(async move {
            *tag.state.lock().await = TagState::ReadInFlight;
            let result = tag.read_once().await;
            *tag.state.lock().await = TagState::ReadResponse;
            if result.is_ok() {
                let cache_ms = tag.read_cache_ms.load(Ordering::Relaxed);
                if cache_ms > 0 {
                    *tag.read_cache_expiry.lock().await = Some(Instant::now() + Duration::from_millis(cache_ms));
                }
            }
            *tag.status.write().await = snapshot_status(&result);
            *tag.state.lock().await = TagState::Idle;
            tag.fire(EventKind::ReadCompleted, snapshot_status(&result));
            drop(guard);
            let _ = done_tx.send(result);
        });
        *self.read_op.lock().await = Some(join.abort_handle());

        if timeout_ms == 0 {
            return Ok(());
        }
        match tokio::time::timeout(Duration::from_millis(timeout_ms), done_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::NoData.into()),
            Err(_) => Err(TransportError::Timeout.into()),
        }
    }

    /// Start a write of the buffer's current contents. Same blocking
    /// semantics as [`Tag::read`].
    pub async fn write(self: &Arc<Self>, timeout_ms: u64) -> Result<(), Error> {
        let guard = self
            .write_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| Error::from(ProtocolError::Busy))?;

        *self.state.lock().await = TagState::WriteRequested;
        *self.status.write().await = Err(ProtocolError::Pending.into());
        *self.last_write_at.lock().await = Some(Instant::now());
        self.fire(EventKind::WriteStarted, Err(ProtocolError::Pending.into()));

        let (done_tx, done_rx) = oneshot::channel();
        let tag = Arc::clone(self);
        let join = tokio::spawn(async move {
            *tag.state.lock().await = TagState::WriteInFlight;
            let result = tag.write_once().await;
            *tag.state.lock().await = TagState::WriteResponse;
            *tag.status.write().await = snapshot_status(&result);
            *tag.state.lock().await = TagState::Idle;
            tag.fire(EventKind::WriteCompleted, snapshot_status(&result));
            drop(guard);
            let _ = done_tx.send(result);
        });
        *self.write_op.lock().await = Some(join.abort_handle());

        if timeout_ms == 0 {
            return Ok(());
        }
        match tokio::time::timeout(Duration::from_millis(timeout_ms), done_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::NoData.into()),
            Err(_) => Err(TransportError::Timeout.into()),
        }
    }

    /// Cancel any in-flight read and write, returning the tag to idle.
    pub async fn abort(&self) -> Result<(), Error> {
        if let Some(h) = self.read_op.lock().await.take() {
            h.abort();
        }
        if let Some(h) = self.write_op.lock().await.take() {
            h.abort();
        }
        *self.state.lock().await = TagState::Idle;
        *self.status.write().await = Err(ProtocolError::Aborted.into());
        self.fire(EventKind::Aborted, Err(ProtocolError::Aborted.into()));
        Ok(())
    }

    pub async fn destroy(&self) -> Result<(), Error> {
        self.abort().await?;
        self.fire(EventKind::Destroyed, Ok(()));
        Ok(())
    }

    async fn read_once(self: &Arc<Self>) -> Result<(), Error> {
        let total_len = self.cfg.buffer_len();
        let mut assembled = vec![0u8; total_len];
        let max_chunk = self.family.max_chunk_bytes().max(self.family.elem_size());
        let mut offset = 0usize;
        while offset < total_len {
            let chunk_len = (total_len - offset).min(max_chunk);
            let outbound = self.family.build_read(offset, chunk_len)?;
            let reply = self.send_retrying(outbound, self.cfg.packing.allow_packing).await?;
            let chunk_data = self.family.parse_read_reply(&reply)?;
            let n = chunk_data.len().min(chunk_len);
            if n == 0 {
                return Err(TransportError::BadReply("empty read reply".into()).into());
            }
            assembled[offset..offset + n].copy_from_slice(&chunk_data[..n]);
            offset += n;
        }
        *self.buffer.lock().await = assembled;
        Ok(())
    }

    async fn write_once(self: &Arc<Self>) -> Result<(), Error> {
        let snapshot = self.buffer.lock().await.clone();
        let total_len = snapshot.len();
        let max_chunk = self.family.max_chunk_bytes().max(self.family.elem_size());
        let mut offset = 0usize;
        while offset < total_len {
            let chunk_len = (total_len - offset).min(max_chunk);
            let outbound = self.family.build_write(offset, &snapshot[offset..offset + chunk_len])?;
            // Writes are never packed: only independent reads are safe to
            // coalesce into one Multi-Service Packet.
            let reply = self.send_retrying(outbound, false).await?;
            self.family.parse_write_reply(&reply)?;
            offset += chunk_len;
        }
        Ok(())
    }

    /// Sends one request, retrying on the transient transport failures a
    /// second attempt can plausibly fix (timeout, no reply demultiplexed,
    /// a frame that didn't parse), up to [`DEFAULT_RETRIES`] times with
    /// [`RETRY_INTERVAL`] between attempts. Argument/resource errors and
    /// PLC-returned bad-status replies are not retried: another attempt
    /// over the same session won't change the outcome.
    async fn send_retrying(&self, outbound: Vec<u8>, packable: bool) -> Result<Vec<u8>, Error> {
        let mut attempt = 0;
        loop {
            match self.send(outbound.clone(), packable).await {
                Ok(reply) => return Ok(reply),
                Err(e) if attempt < DEFAULT_RETRIES && is_transient(&e) => {
                    attempt += 1;
                    tokio::time::sleep(RETRY_INTERVAL).await;
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn send(&self, outbound: Vec<u8>, packable: bool) -> Result<Vec<u8>, Error> {
        let io_timeout = Duration::from_millis(self.cfg.timing.timeout_ms);
        match self.family.transport() {
            Transport::CipUnconnected { route_path } => {
                let wire = if route_path.is_empty() {
                    outbound
                } else {
                    cip::build_unconnected_send(&outbound, &route_path)
                };
                // Packing only applies to direct (unrouted) unconnected
                // messaging: a request already wrapped for backplane
                // routing can't be demultiplexed back out of a shared
                // Multi-Service Packet reply.
                if packable && route_path.is_empty() {
                    self.session.send_unconnected_packed(wire, PACK_DEBOUNCE, io_timeout).await
                } else {
                    self.session.send_unconnected(wire, io_timeout).await
                }
            },
            Transport::CipConnected { .. } => {
                let (targ, orig, seq) = self.ensure_connection(io_timeout).await?;
                let result = self.session.send_connected(targ, orig, seq, outbound, io_timeout).await;
                if let Some(conn) = &self.connection {
                    conn.lock().await.release_slot();
                }
                result
            },
            Transport::Modbus => self.session.send_modbus(outbound, io_timeout).await,
        }
    }

    async fn ensure_connection(&self, io_timeout: Duration) -> Result<(u32, u32, u16), Error> {
        let Some(conn_mutex) = &self.connection else {
            return Err(TransportError::BadConnection("tag has no CIP connection".into()).into());
        };
        let mut conn = conn_mutex.lock().await;
        if !conn.is_connected() {
            conn.mark_opening();
            let params = cip::ForwardOpenParams {
                orig_connection_id: conn.orig_connection_id,
                conn_serial_number: conn.conn_serial_number,
                vendor_id: VENDOR_ID,
                orig_serial_number: self.conn_orig_serial,
                connection_path: conn.connection_path.clone(),
                connection_size: self.cfg.buffer_len().min(500) as u16,
            };
            let fo = cip::build_forward_open(&params);
            let reply = self.session.send_unconnected(fo, io_timeout).await?;
            let parsed = cip::parse_reply(&reply)?;
            if parsed.general_status != cip::STATUS_SUCCESS {
                conn.mark_closed();
                return Err(cip::status_to_error(parsed.general_status));
            }
            let fo_reply = cip::parse_forward_open_reply(parsed.data)?;
            conn.mark_opened(fo_reply.targ_connection_id);
        }
        let seq = conn.next_seq_num()?;
        Ok((conn.targ_connection_id, conn.orig_connection_id, seq))
    }

    pub async fn due_for_auto_read(&self) -> bool {
        let ms = self.auto_sync_read_ms.load(Ordering::Relaxed);
        if ms == 0 {
            return false;
        }
        match *self.last_read_at.lock().await {
            None => true,
            Some(t) => t.elapsed() >= Duration::from_millis(ms),
        }
    }

    pub async fn due_for_auto_write(&self) -> bool {
        let ms = self.auto_sync_write_ms.load(Ordering::Relaxed);
        if ms == 0 {
            return false;
        }
        match *self.last_write_at.lock().await {
            None => true,
            Some(t) => t.elapsed() >= Duration::from_millis(ms),
        }
    }

    pub async fn get_int_attrib(&self, name: &str) -> Result<i64, Error> {
        match name {
            "elem_size" => Ok(self.cfg.identity.elem_size as i64),
            "elem_count" => Ok(self.cfg.identity.elem_count as i64),
            "debug" => Ok(self.cfg.debug as i64),
            "auto_sync_read_ms" => Ok(self.auto_sync_read_ms.load(Ordering::Relaxed) as i64),
            "auto_sync_write_ms" => Ok(self.auto_sync_write_ms.load(Ordering::Relaxed) as i64),
            "read_cache_ms" => Ok(self.read_cache_ms.load(Ordering::Relaxed) as i64),
            "idle_timeout_ms" => Ok(self.idle_timeout_ms.load(Ordering::Relaxed) as i64),
            other => Err(ArgumentError::Unsupported(format!("unknown int attribute: {other}")).into()),
        }
    }

    pub async fn set_int_attrib(&self, name: &str, value: i64) -> Result<(), Error> {
        let value = u64::try_from(value).map_err(|_| ArgumentError::BadParam(format!("negative value for {name}")))?;
        match name {
            "auto_sync_read_ms" => {
                self.auto_sync_read_ms.store(value, Ordering::Relaxed);
                Ok(())
            },
            "auto_sync_write_ms" => {
                self.auto_sync_write_ms.store(value, Ordering::Relaxed);
                Ok(())
            },
            "read_cache_ms" => {
                self.read_cache_ms.store(value, Ordering::Relaxed);
                Ok(())
            },
            "idle_timeout_ms" => {
                self.idle_timeout_ms.store(value, Ordering::Relaxed);
                Ok(())
            },
            other => Err(ArgumentError::NotAllowed(format!("attribute not settable: {other}")).into()),
        }
    }
}

macro_rules! tag_scalar_accessors {
    ($get:ident, $set:ident, $byte_get:path, $byte_set:path, $ty:ty) => {
        impl Tag {
            pub async fn $get(&self, offset: usize) -> Result<$ty, Error> {
                let buf = self.buffer.lock().await;
                $byte_get(&buf, offset)
            }

            pub async fn $set(&self, offset: usize, value: $ty) -> Result<(), Error> {
                let mut buf = self.buffer.lock().await;
                $byte_set(&mut buf, offset, value)
            }
        }
    };
}

tag_scalar_accessors!(get_u8, set_u8, byte_order::get_u8, byte_order::set_u8, u8);
tag_scalar_accessors!(get_i8, set_i8, byte_order::get_i8, byte_order::set_i8, i8);
tag_scalar_accessors!(get_u16, set_u16, byte_order::get_u16, byte_order::set_u16, u16);
tag_scalar_accessors!(get_i16, set_i16, byte_order::get_i16, byte_order::set_i16, i16);
tag_scalar_accessors!(get_u32, set_u32, byte_order::get_u32, byte_order::set_u32, u32);
tag_scalar_accessors!(get_i32, set_i32, byte_order::get_i32, byte_order::set_i32, i32);
tag_scalar_accessors!(get_u64, set_u64, byte_order::get_u64, byte_order::set_u64, u64);
tag_scalar_accessors!(get_i64, set_i64, byte_order::get_i64, byte_order::set_i64, i64);
tag_scalar_accessors!(get_f32, set_f32, byte_order::get_f32, byte_order::set_f32, f32);
tag_scalar_accessors!(get_f64, set_f64, byte_order::get_f64, byte_order::set_f64, f64);

impl Tag {
    pub async fn get_bit(&self, byte_offset: usize, bit_index: u8) -> Result<bool, Error> {
        let buf = self.buffer.lock().await;
        byte_order::get_bit(&buf, byte_offset, bit_index)
    }

    pub async fn set_bit(&self, byte_offset: usize, bit_index: u8, value: bool) -> Result<(), Error> {
        let mut buf = self.buffer.lock().await;
        byte_order::set_bit(&mut buf, byte_offset, bit_index, value)
    }

    pub async fn get_string(&self, offset: usize) -> Result<String, Error> {
        let buf = self.buffer.lock().await;
        byte_order::get_string(&buf, offset, &self.byte_order)
    }

    pub async fn set_string(&self, offset: usize, value: &str) -> Result<(), Error> {
        let mut buf = self.buffer.lock().await;
        byte_order::set_string(&mut buf, offset, value, &self.byte_order)
    }

    pub fn is_bit(&self) -> bool {
        self.cfg.is_bit
    }

    pub fn bit_index(&self) -> Option<u8> {
        self.cfg.bit_index
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::net::TcpListener;

    use super::*;
    use crate::{
        cfg::attr::AttrBag,
        session::SessionKey,
    };

    async fn spawn_dummy_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });
        addr
    }

    async fn modbus_tag(name: &str, elem_size: u32, elem_count: u32, handle: TagHandle) -> Arc<Tag> {
        let addr = spawn_dummy_server().await;
        let bag = AttrBag::parse(&format!(
            "protocol=modbus_tcp&gateway={}&port={}&name={name}&elem_size={elem_size}&elem_count={elem_count}",
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
        Tag::new(handle, cfg, session, None).expect("tag")
    }

    #[tokio::test]
    async fn modbus_tag_allocates_buffer_sized_by_elem_geometry() {
        let tag = modbus_tag("hr10", 2, 4, 1).await;
        assert_eq!(tag.buffer.lock().await.len(), 8);
    }

    #[tokio::test]
    async fn scalar_accessors_round_trip_through_the_buffer() {
        let tag = modbus_tag("hr0", 2, 4, 2).await;
        tag.set_u16(0, 0xbeef).await.expect("set u16");
        assert_eq!(tag.get_u16(0).await.expect("get u16"), 0xbeef);
        tag.set_bit(2, 3, true).await.expect("set bit");
        assert!(tag.get_bit(2, 3).await.expect("get bit"));
    }

    #[tokio::test]
    async fn abort_with_no_in_flight_operation_still_marks_aborted() {
        let tag = modbus_tag("hr0", 2, 1, 3).await;
        tag.abort().await.expect("abort");
        assert!(tag.status().await.is_err());
        assert_eq!(tag.state().await, TagState::Idle);
    }

    #[tokio::test]
    async fn int_attrib_round_trips_mutable_timing_knobs() {
        let tag = modbus_tag("hr0", 2, 1, 4).await;
        tag.set_int_attrib("auto_sync_read_ms", 500).await.expect("set");
        assert_eq!(tag.get_int_attrib("auto_sync_read_ms").await.expect("get"), 500);
        assert!(tag.set_int_attrib("elem_size", 4).await.is_err());
    }

    #[test]
    fn logix_cpu_selects_the_symbolic_cip_family() {
        let bag = AttrBag::parse(
            "protocol=ab_eip&gateway=10.0.0.1&cpu=logix&path=1,0&name=motor.speed&elem_size=4&elem_count=1",
        )
        .expect("parse");
        let cfg = TagConfig::from_attrs(&bag).expect("config");
        let family = TagFamily::from_config(&cfg).expect("family");
        assert!(matches!(family, TagFamily::CipLogix(_)));
    }

    #[test]
    fn plc5_cpu_selects_the_pccc_family() {
        let bag = AttrBag::parse("protocol=ab_eip&gateway=10.0.0.1&cpu=plc5&name=N7:0&elem_size=2&elem_count=1")
            .expect("parse");
        let cfg = TagConfig::from_attrs(&bag).expect("config");
        let family = TagFamily::from_config(&cfg).expect("family");
        assert!(matches!(family, TagFamily::CipPccc(_)));
    }

    #[test]
    fn transient_transport_errors_are_retried_but_protocol_errors_are_not() {
        assert!(is_transient(&TransportError::Timeout.into()));
        assert!(is_transient(&TransportError::NoData.into()));
        assert!(is_transient(&TransportError::Partial.into()));
        assert!(is_transient(&TransportError::BadReply("short frame".into()).into()));
        assert!(!is_transient(&TransportError::Open("refused".into()).into()));
        assert!(!is_transient(&ProtocolError::BadStatus(0x05).into()));
        assert!(!is_transient(&ProtocolError::Busy.into()));
        assert!(!is_transient(&ArgumentError::InvalidHandle(1).into()));
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One TCP connection per gateway, shared by every tag that talks to it.
//!
//! Modeled on the teacher's `ClientConnection`: the socket's read and
//! write halves each live behind their own `tokio::sync::Mutex`, replies
//! are correlated through a `DashMap` keyed by a correlation id, and a
//! single background task owns the header-then-body receive loop.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{oneshot, Mutex},
    time::{timeout, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::enums::Protocol,
    error::{Error, TransportError},
    protocol::{cip, eip, modbus},
};

/// Identifies one session: same gateway, port, and wire family share one
/// TCP connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
}

type PendingReply = oneshot::Sender<Result<Vec<u8>, Error>>;

struct SessionInner {
    key: SessionKey,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    eip_session_handle: AtomicU32,
    next_seq: AtomicU64,
    pending_unconnected: DashMap<u64, PendingReply>,
    pending_connected: DashMap<(u32, u16), PendingReply>,
    pending_modbus: DashMap<u16, PendingReply>,
    /// Unconnected CIP reads awaiting coalescing into one Multi-Service
    /// Packet. Only populated by [`Session::send_unconnected_packed`].
    pack_queue: Mutex<Vec<(Vec<u8>, PendingReply)>>,
    shutdown: CancellationToken,
    last_activity: Mutex<Instant>,
    idle_timeout: Option<Duration>,
    is_closed: AtomicBool,
}

/// Strong handle to a live session. The background receive task also
/// holds a clone for as long as the socket is open; the session is torn
/// down once both this handle and the task's copy are dropped.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub async fn connect(key: SessionKey, connect_timeout: Duration, idle_timeout: Option<Duration>) -> Result<Self, Error> {
        let addr = format!("{}:{}", key.host, key.port);
        let stream = timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Open(e.to_string()))?;
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();

        let inner = Arc::new(SessionInner {
            key,
            reader: Mutex::new(read_half),
            writer: Mutex::new(write_half),
            eip_session_handle: AtomicU32::new(0),
            next_seq: AtomicU64::new(1),
            pending_unconnected: DashMap::new(),
            pending_connected: DashMap::new(),
            pending_modbus: DashMap::new(),
            pack_queue: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            last_activity: Mutex::new(Instant::now()),
            idle_timeout,
            is_closed: AtomicBool::new(false),
        });
        let session = Session { inner };

        if session.inner.key.protocol != Protocol::ModbusTcp {
            session.register_session(connect_timeout).await?;
        }

        let recv_session = session.clone();
        tokio::spawn(async move {
            recv_session.receive_loop().await;
        });

        Ok(session)
    }

    pub fn key(&self) -> &SessionKey {
        &self.inner.key
    }

    fn next_sender_context(&self) -> u64 {
        self.inner.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    async fn register_session(&self, io_timeout: Duration) -> Result<(), Error> {
        let header = eip::EncapsulationHeader::new(eip::Command::RegisterSession, 4, 0, 0);
        let body = eip::RegisterSessionData::default().to_bytes();
        let mut frame = header.to_bytes().to_vec();
        frame.extend_from_slice(&body);

        {
            let mut w = self.inner.writer.lock().await;
            timeout(io_timeout, w.write_all(&frame))
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|e| TransportError::Write(e.to_string()))?;
        }

        let mut header_buf = [0u8; eip::HEADER_LEN];
        {
            let mut r = self.inner.reader.lock().await;
            timeout(io_timeout, r.read_exact(&mut header_buf))
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|e| TransportError::Read(e.to_string()))?;
        }
        let reply_header = eip::EncapsulationHeader::parse(&header_buf)?;
        if reply_header.status() != 0 {
            return Err(TransportError::BadReply(format!(
                "RegisterSession failed, status=0x{:08x}",
                reply_header.status()
            ))
            .into());
        }
        let mut body_buf = vec![0u8; reply_header.length() as usize];
        {
            let mut r = self.inner.reader.lock().await;
            timeout(io_timeout, r.read_exact(&mut body_buf))
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|e| TransportError::Read(e.to_string()))?;
        }
        self.inner
            .eip_session_handle
            .store(reply_header.session_handle(), Ordering::Relaxed);
        Ok(())
    }

    /// Send an unconnected (UCMM) CIP request and await its reply.
    pub async fn send_unconnected(&self, cip_payload: Vec<u8>, io_timeout: Duration) -> Result<Vec<u8>, Error> {
        let sender_context = self.next_sender_context();
        let (tx, rx) = oneshot::channel();
        self.inner.pending_unconnected.insert(sender_context, tx);

        let cpf = eip::build_cpf_unconnected(&cip_payload);
        let session_handle = self.inner.eip_session_handle.load(Ordering::Relaxed);
        let header = eip::EncapsulationHeader::new(
            eip::Command::SendRrData,
            cpf.len() as u16,
            session_handle,
            sender_context,
        );
        let mut frame = header.to_bytes().to_vec();
        frame.extend_from_slice(&cpf);
        self.write_frame(&frame, io_timeout).await?;

        match timeout(io_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.inner.pending_unconnected.remove(&sender_context);
                Err(TransportError::NoData.into())
            },
            Err(_) => {
                self.inner.pending_unconnected.remove(&sender_context);
                Err(TransportError::Timeout.into())
            },
        }
    }

    /// Queue an unconnected CIP request for possible coalescing with
    /// other requests arriving within `debounce` into a single Multiple
    /// Service Packet, the way Logix-class tags with `allow_packing` set
    /// share one round trip for several independent reads. The first
    /// request into an empty queue starts the debounce timer; anything
    /// that piles in before it fires rides along in the same packet.
    /// Individual sub-replies are correlated purely by request order, so
    /// callers must await this and not race another packable send for
    /// the same session while it is pending.
    pub async fn send_unconnected_packed(
        &self,
        cip_payload: Vec<u8>,
        debounce: Duration,
        io_timeout: Duration,
    ) -> Result<Vec<u8>, Error> {
        let (tx, rx) = oneshot::channel();
        let starts_batch = {
            let mut queue = self.inner.pack_queue.lock().await;
            queue.push((cip_payload, tx));
            queue.len() == 1
        };
        if starts_batch {
            let session = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(debounce).await;
                session.flush_pack_queue(io_timeout).await;
            });
        }
        match timeout(io_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::NoData.into()),
            Err(_) => Err(TransportError::Timeout.into()),
        }
    }

    /// Drain the pack queue and send it as one packet, or fall back to
    /// sending every queued request individually if the packet fails at
    /// the CIP level or the reply can't be demultiplexed cleanly.
    async fn flush_pack_queue(&self, io_timeout: Duration) {
        let batch: Vec<(Vec<u8>, PendingReply)> = {
            let mut queue = self.inner.pack_queue.lock().await;
            std::mem::take(&mut *queue)
        };
        if batch.is_empty() {
            return;
        }
        if batch.len() == 1 {
            let (payload, tx) = batch.into_iter().next().expect("checked len == 1");
            let result = self.send_unconnected(payload, io_timeout).await;
            let _ = tx.send(result);
            return;
        }

        let requests: Vec<Vec<u8>> = batch.iter().map(|(payload, _)| payload.clone()).collect();
        let packet = cip::build_multi_service_packet(&requests);
        let outcome = self.send_unconnected(packet, io_timeout).await.and_then(|reply| {
            let parsed = cip::parse_reply(&reply)?;
            if parsed.general_status != cip::STATUS_SUCCESS {
                return Err(cip::status_to_error(parsed.general_status));
            }
            let parts = cip::parse_multi_service_reply(parsed.data)?;
            if parts.len() != batch.len() {
                return Err(TransportError::BadReply("multi-service reply count mismatch".into()).into());
            }
            Ok(parts.into_iter().map(<[u8]>::to_vec).collect::<Vec<_>>())
        });

        match outcome {
            Ok(replies) => {
                for ((_, tx), reply) in batch.into_iter().zip(replies) {
                    let _ = tx.send(Ok(reply));
                }
            },
            Err(_) => {
                for (payload, tx) in batch {
                    let result = self.send_unconnected(payload, io_timeout).await;
                    let _ = tx.send(result);
                }
            },
        }
    }

    /// Send a CIP connected-messaging request and await its reply.
    pub async fn send_connected(
        &self,
        targ_connection_id: u32,
        orig_connection_id: u32,
        conn_seq_num: u16,
        cip_payload: Vec<u8>,
        io_timeout: Duration,
    ) -> Result<Vec<u8>, Error> {
        let key = (orig_connection_id, conn_seq_num);
        let (tx, rx) = oneshot::channel();
        self.inner.pending_connected.insert(key, tx);

        let cpf = eip::build_cpf_connected(targ_connection_id, conn_seq_num, &cip_payload);
        let session_handle = self.inner.eip_session_handle.load(Ordering::Relaxed);
        let sender_context = self.next_sender_context();
        let header = eip::EncapsulationHeader::new(
            eip::Command::SendUnitData,
            cpf.len() as u16,
            session_handle,
            sender_context,
        );
        let mut frame = header.to_bytes().to_vec();
        frame.extend_from_slice(&cpf);
        self.write_frame(&frame, io_timeout).await?;

        match timeout(io_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.inner.pending_connected.remove(&key);
                Err(TransportError::NoData.into())
            },
            Err(_) => {
                self.inner.pending_connected.remove(&key);
                Err(TransportError::Timeout.into())
            },
        }
    }

    /// Send a full Modbus-TCP frame (already includes its own MBAP
    /// header, built by the caller so it can choose the transaction id)
    /// and await the matching reply. The transaction id is read back out
    /// of the frame rather than passed separately, so it can never drift
    /// from what was actually put on the wire.
    pub async fn send_modbus(&self, frame: Vec<u8>, io_timeout: Duration) -> Result<Vec<u8>, Error> {
        if frame.len() < 2 {
            return Err(crate::error::ArgumentError::TooSmall { need: 2, have: frame.len() }.into());
        }
        let transaction_id = u16::from_be_bytes([frame[0], frame[1]]);
        let (tx, rx) = oneshot::channel();
        self.inner.pending_modbus.insert(transaction_id, tx);
        self.write_frame(&frame, io_timeout).await?;
        match timeout(io_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.inner.pending_modbus.remove(&transaction_id);
                Err(TransportError::NoData.into())
            },
            Err(_) => {
                self.inner.pending_modbus.remove(&transaction_id);
                Err(TransportError::Timeout.into())
            },
        }
    }

    async fn write_frame(&self, frame: &[u8], io_timeout: Duration) -> Result<(), Error> {
        let mut w = self.inner.writer.lock().await;
        timeout(io_timeout, w.write_all(frame))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Write(e.to_string()))?;
        drop(w);
        *self.inner.last_activity.lock().await = Instant::now();
        Ok(())
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Whether the background receive loop has torn this session down,
    /// either on an idle timeout or a read error. A closed session must
    /// be dropped from the pool and reconnected rather than reused.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed.load(Ordering::Relaxed)
    }

    fn has_pending(&self) -> bool {
        !self.inner.pending_unconnected.is_empty()
            || !self.inner.pending_connected.is_empty()
            || !self.inner.pending_modbus.is_empty()
    }

    /// Background task: read exactly one frame (EIP or MBAP), then
    /// deliver its payload to whichever pending request it correlates
    /// with. Kept as an explicit header-then-body loop rather than a
    /// single `read_exact` over a guessed size, so partial reads stay
    /// observable.
    async fn receive_loop(&self) {
        let mut idle_tick = self.inner.idle_timeout.map(|d| tokio::time::interval(d.min(Duration::from_secs(1)).max(Duration::from_millis(50))));

        loop {
            let frame = tokio::select! {
                _ = self.inner.shutdown.cancelled() => {
                    self.inner.is_closed.store(true, Ordering::Relaxed);
                    return;
                },
                _ = Self::tick(&mut idle_tick) => {
                    if self.idle_past_timeout().await {
                        debug!(gateway = %self.inner.key.host, "session idle timeout, closing");
                        self.inner.is_closed.store(true, Ordering::Relaxed);
                        return;
                    }
                    continue;
                },
                frame = self.read_one_frame() => frame,
            };
            match frame {
                Ok(Some((corr, payload))) => self.dispatch_reply(corr, payload),
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, gateway = %self.inner.key.host, "session receive loop ended");
                    self.fail_all_pending(e);
                    self.inner.is_closed.store(true, Ordering::Relaxed);
                    return;
                },
            }
        }
    }

    async fn tick(idle_tick: &mut Option<tokio::time::Interval>) {
        match idle_tick {
            Some(interval) => {
                interval.tick().await;
            },
            None => std::future::pending::<()>().await,
        }
    }

    async fn idle_past_timeout(&self) -> bool {
        let Some(limit) = self.inner.idle_timeout else {
            return false;
        };
        if self.has_pending() {
            return false;
        }
        self.inner.last_activity.lock().await.elapsed() >= limit
    }

    async fn read_one_frame(&self) -> Result<Option<(ReplyCorrelation, Vec<u8>)>, Error> {
        if self.inner.key.protocol == Protocol::ModbusTcp {
            let mut header_buf = [0u8; modbus::MBAP_LEN];
            {
                let mut r = self.inner.reader.lock().await;
                r.read_exact(&mut header_buf).await.map_err(|e| TransportError::Read(e.to_string()))?;
            }
            let header = modbus::MbapHeader::parse(&header_buf)?;
            let body_len = (header.length as usize).saturating_sub(1);
            let mut body = vec![0u8; body_len];
            {
                let mut r = self.inner.reader.lock().await;
                r.read_exact(&mut body).await.map_err(|e| TransportError::Read(e.to_string()))?;
            }
            let mut full = header_buf.to_vec();
            full.extend_from_slice(&body);
            return Ok(Some((ReplyCorrelation::Modbus(header.transaction_id), full)));
        }

        let mut header_buf = [0u8; eip::HEADER_LEN];
        {
            let mut r = self.inner.reader.lock().await;
            r.read_exact(&mut header_buf).await.map_err(|e| TransportError::Read(e.to_string()))?;
        }
        let header = eip::EncapsulationHeader::parse(&header_buf)?;
        let mut body = vec![0u8; header.length() as usize];
        {
            let mut r = self.inner.reader.lock().await;
            r.read_exact(&mut body).await.map_err(|e| TransportError::Read(e.to_string()))?;
        }
        debug!(status = header.status(), "received EIP frame");
        if header.status() != 0 {
            return Ok(Some((
                ReplyCorrelation::Unconnected(header.sender_context()),
                body,
            )));
        }
        let cip = eip::parse_cpf_payload(&body)?;
        if cip.len() >= 4 && is_connected_command(&body) {
            let seq = u16::from_le_bytes([cip[0], cip[1]]);
            Ok(Some((
                ReplyCorrelation::Connected { conn_seq_num: seq },
                cip[2..].to_vec(),
            )))
        } else {
            Ok(Some((
                ReplyCorrelation::Unconnected(header.sender_context()),
                cip.to_vec(),
            )))
        }
    }

    fn dispatch_reply(&self, corr: ReplyCorrelation, payload: Vec<u8>) {
        match corr {
            ReplyCorrelation::Unconnected(ctx) => {
                if let Some((_, tx)) = self.inner.pending_unconnected.remove(&ctx) {
                    let _ = tx.send(Ok(payload));
                }
            },
            ReplyCorrelation::Connected { conn_seq_num } => {
                let found = self
                    .inner
                    .pending_connected
                    .iter()
                    .find(|e| e.key().1 == conn_seq_num)
                    .map(|e| *e.key());
                if let Some(key) = found
                    && let Some((_, tx)) = self.inner.pending_connected.remove(&key)
                {
                    let _ = tx.send(Ok(payload));
                }
            },
            ReplyCorrelation::Modbus(txn) => {
                if let Some((_, tx)) = self.inner.pending_modbus.remove(&txn) {
                    let _ = tx.send(Ok(payload));
                }
            },
        }
    }

    fn fail_all_pending(&self, err: Error) {
        let msg = err.to_string();
        let unconnected_keys: Vec<u64> = self.inner.pending_unconnected.iter().map(|e| *e.key()).collect();
        for key in unconnected_keys {
            if let Some((_, tx)) = self.inner.pending_unconnected.remove(&key) {
                let _ = tx.send(Err(TransportError::BadReply(msg.clone()).into()));
            }
        }
        let connected_keys: Vec<(u32, u16)> = self.inner.pending_connected.iter().map(|e| *e.key()).collect();
        for key in connected_keys {
            if let Some((_, tx)) = self.inner.pending_connected.remove(&key) {
                let _ = tx.send(Err(TransportError::BadReply(msg.clone()).into()));
            }
        }
        let modbus_keys: Vec<u16> = self.inner.pending_modbus.iter().map(|e| *e.key()).collect();
        for key in modbus_keys {
            if let Some((_, tx)) = self.inner.pending_modbus.remove(&key) {
                let _ = tx.send(Err(TransportError::BadReply(msg.clone()).into()));
            }
        }
    }
}

/// Type code of the second CPF item (the data item, following the
/// null/connected address item): 0x00b1 for connected, 0x00b2 for
/// unconnected. Walks the item list rather than assuming a fixed
/// offset, since the address item's length differs between the two
/// (0 bytes for a null address item, 4 for a connected address item).
fn second_cpf_item_type(eip_body: &[u8]) -> Option<u16> {
    if eip_body.len() < 12 {
        return None;
    }
    let item0_len = u16::from_le_bytes([eip_body[10], eip_body[11]]) as usize;
    let item1_type_offset = 12 + item0_len;
    if eip_body.len() < item1_type_offset + 2 {
        return None;
    }
    Some(u16::from_le_bytes([eip_body[item1_type_offset], eip_body[item1_type_offset + 1]]))
}

fn is_connected_command(eip_body: &[u8]) -> bool {
    second_cpf_item_type(eip_body) == Some(0x00b1)
}

enum ReplyCorrelation {
    Unconnected(u64),
    Connected { conn_seq_num: u16 },
    Modbus(u16),
}

/// All live sessions, keyed so that tags sharing a gateway/port/family
/// share one TCP connection.
#[derive(Default)]
pub struct SessionPool {
    sessions: Mutex<HashMap<SessionKey, Session>>,
}

impl SessionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_connect(
        &self,
        key: SessionKey,
        connect_timeout: Duration,
        idle_timeout: Option<Duration>,
    ) -> Result<Session, Error> {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&key) {
            if !existing.is_closed() {
                return Ok(existing.clone());
            }
            sessions.remove(&key);
        }
        let session = Session::connect(key.clone(), connect_timeout, idle_timeout).await?;
        sessions.insert(key, session.clone());
        Ok(session)
    }

    pub async fn remove(&self, key: &SessionKey) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.remove(key) {
            session.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_equality_is_by_value() {
        let a = SessionKey {
            host: "10.0.0.1".into(),
            port: 44818,
            protocol: Protocol::AbEip,
        };
        let b = a.clone();
        assert_eq!(a, b);
    }

    #[test]
    fn is_connected_command_detects_item_type() {
        let unconnected = eip::build_cpf_unconnected(&[0xaa, 0xbb]);
        assert!(!is_connected_command(&unconnected));

        let connected = eip::build_cpf_connected(0x1234_5678, 7, &[0xaa, 0xbb]);
        assert!(is_connected_command(&connected));
    }
}

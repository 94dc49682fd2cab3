// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! CIP connected messaging: the `ForwardOpen`/`ForwardClose` handshake
//! and the per-connection sequence counter and in-flight window that
//! connected requests use once it is up.

use crate::{
    error::{Error, TransportError},
    utils::{generate_conn_serial, generate_orig_connection_id},
};

/// Maximum number of connected requests this client keeps outstanding on
/// one connection at a time.
pub const MAX_IN_FLIGHT: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Opening,
    Connected,
    Closing,
}

pub struct Connection {
    pub state: ConnectionState,
    pub orig_connection_id: u32,
    pub targ_connection_id: u32,
    pub conn_serial_number: u16,
    pub conn_seq_num: u16,
    pub connection_path: Vec<u8>,
    in_flight: usize,
}

impl Connection {
    pub fn new(connection_path: Vec<u8>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            orig_connection_id: generate_orig_connection_id(),
            targ_connection_id: 0,
            conn_serial_number: generate_conn_serial(),
            conn_seq_num: 0,
            connection_path,
            in_flight: 0,
        }
    }

    pub fn mark_opening(&mut self) {
        self.state = ConnectionState::Opening;
    }

    pub fn mark_opened(&mut self, targ_connection_id: u32) {
        self.targ_connection_id = targ_connection_id;
        self.state = ConnectionState::Connected;
    }

    pub fn mark_closed(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.targ_connection_id = 0;
        self.conn_seq_num = 0;
        self.in_flight = 0;
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn has_capacity(&self) -> bool {
        self.in_flight < MAX_IN_FLIGHT
    }

    /// Reserve the next sequence number for a connected request. Fails
    /// if the connection is not open or the in-flight window is full.
    pub fn next_seq_num(&mut self) -> Result<u16, Error> {
        if !self.is_connected() {
            return Err(TransportError::BadConnection("connection is not open".into()).into());
        }
        if !self.has_capacity() {
            return Err(crate::error::ProtocolError::Busy.into());
        }
        self.conn_seq_num = self.conn_seq_num.wrapping_add(1);
        self.in_flight += 1;
        Ok(self.conn_seq_num)
    }

    /// Release one in-flight slot once a connected request's reply
    /// arrives or it is abandoned.
    pub fn release_slot(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }
}

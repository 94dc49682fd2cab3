// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use rand::Rng;

/// Generates a random 16-bit connection serial number for a CIP
/// `ForwardOpen`. The PLC treats this, together with our vendor/originator
/// id, as the key identifying our half of a connection; any nonzero value
/// works, so a fresh random draw per connection is enough to avoid
/// colliding with a connection this process already has open.
pub fn generate_conn_serial() -> u16 {
    rand::rng().random_range(1..=u16::MAX)
}

/// Generates a random 32-bit originator connection id for a CIP
/// `ForwardOpen`. Zero is reserved, so the range excludes it.
pub fn generate_orig_connection_id() -> u32 {
    rand::rng().random_range(1..=u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_serial_is_never_zero() {
        for _ in 0..64 {
            assert_ne!(generate_conn_serial(), 0);
        }
    }

    #[test]
    fn orig_connection_id_is_never_zero() {
        for _ in 0..64 {
            assert_ne!(generate_orig_connection_id(), 0);
        }
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Buffer-level codecs shared by every protocol family.

pub mod byte_order;

pub use byte_order::ByteOrderDescriptor;

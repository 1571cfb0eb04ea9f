// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire protocol: message set, envelope codec, stream framing, and bulk
//! compression.
//!
//! The contract at this boundary is deliberately small: `decode(encode(m))
//! == m` for every message variant, the tag discriminator is recoverable in
//! O(1), and frames above 16 MiB are protocol errors.

/// Deflate compression for bulk payloads.
pub mod compress;
/// Length-prefix framing for stream transports.
pub mod framing;
/// Message set and envelope codec.
pub mod wire;

pub use compress::{compress, compress_bound, decompress, DEFAULT_COMPRESSION_LEVEL};
pub use framing::{encode_frame, FrameAccumulator, DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE};
pub use wire::{
    decode_envelope, encode_envelope, peek_tag, Envelope, Message, MessageTag, PropertyBatch,
    PropertyUpdate, SceneSnapshotChunk,
};

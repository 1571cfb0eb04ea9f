// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared value types: connection state/stats, 128-bit content hashes, and
//! the typed property value union carried in update batches.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use md5::{Digest, Md5};

/// State of a connection's lifecycle.
///
/// Legal transitions: `Disconnected -> Connecting -> Connected`,
/// `Connecting -> Failed`, `Connected -> Disconnected`,
/// `Failed -> Disconnected`. `Connected` is entered only once the reliable
/// channel is open; the underlying transport's own "connected" signal is not
/// sufficient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected (initial state, or after a graceful disconnect).
    #[default]
    Disconnected,
    /// Establishment in progress.
    Connecting,
    /// Reliable channel open and ready.
    Connected,
    /// Establishment failed or the link broke irrecoverably.
    Failed,
}

impl ConnectionState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Failed => 3,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Failed,
            _ => ConnectionState::Disconnected,
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connecting, Disconnected) // connect canceled before establishment
                | (Connected, Disconnected)
                | (Failed, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Backend of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    /// Same-host link over a Unix domain socket.
    Local,
    /// Peer-to-peer data-channel link established out-of-band.
    Remote,
}

/// Snapshot of a connection's traffic counters.
///
/// All counters are monotone for the lifetime of a slot and reset only on
/// slot reuse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Total payload bytes sent.
    pub bytes_sent: u64,
    /// Total payload bytes received.
    pub bytes_received: u64,
    /// Messages sent.
    pub messages_sent: u64,
    /// Messages received.
    pub messages_received: u64,
    /// Wall-clock ms when the connection reached `Connected` (0 if never).
    pub connect_time_ms: u64,
    /// Wall-clock ms of the last send or receive (0 if none).
    pub last_activity_ms: u64,
}

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Wall-clock microseconds since the Unix epoch.
pub(crate) fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Opaque 128-bit key identifying an (entity, app, type, property) tuple.
///
/// Computed by the caller (see [`compute_property_hash`]); the core treats
/// it purely as a map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PropertyHash {
    /// High 64 bits.
    pub high: u64,
    /// Low 64 bits.
    pub low: u64,
}

impl PropertyHash {
    /// Construct from raw halves.
    pub const fn new(high: u64, low: u64) -> Self {
        Self { high, low }
    }
}

impl fmt::Display for PropertyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.high, self.low)
    }
}

/// Opaque 128-bit key identifying a component schema.
///
/// Ordered only so the NACK tracker can prune by recency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ComponentTypeHash {
    /// High 64 bits.
    pub high: u64,
    /// Low 64 bits.
    pub low: u64,
}

impl ComponentTypeHash {
    /// Construct from raw halves.
    pub const fn new(high: u64, low: u64) -> Self {
        Self { high, low }
    }

    /// The all-zero hash, used by messages that carry no schema reference.
    pub const ZERO: ComponentTypeHash = ComponentTypeHash { high: 0, low: 0 };

    /// Whether this is the all-zero (absent) hash.
    pub fn is_zero(&self) -> bool {
        self.high == 0 && self.low == 0
    }
}

impl fmt::Display for ComponentTypeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.high, self.low)
    }
}

fn digest_halves(hasher: Md5) -> (u64, u64) {
    let digest: [u8; 16] = hasher.finalize().into();
    let mut hi = [0u8; 8];
    let mut lo = [0u8; 8];
    hi.copy_from_slice(&digest[0..8]);
    lo.copy_from_slice(&digest[8..16]);
    (u64::from_le_bytes(hi), u64::from_le_bytes(lo))
}

/// Compute the 128-bit property hash for an (entity, app, type, property)
/// tuple. Deterministic across processes and platforms.
pub fn compute_property_hash(
    entity_id: u64,
    app_id: &str,
    type_name: &str,
    property_name: &str,
) -> PropertyHash {
    let mut hasher = Md5::new();
    hasher.update(entity_id.to_le_bytes());
    hasher.update(app_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(type_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(property_name.as_bytes());
    let (high, low) = digest_halves(hasher);
    PropertyHash { high, low }
}

/// Compute the 128-bit component type hash for an (app, component) pair.
pub fn compute_component_type_hash(app_id: &str, component_name: &str) -> ComponentTypeHash {
    let mut hasher = Md5::new();
    hasher.update(app_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(component_name.as_bytes());
    let (high, low) = digest_halves(hasher);
    ComponentTypeHash { high, low }
}

/// 2-component float vector.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

/// 3-component float vector.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// 4-component float vector.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec4 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

/// Quaternion (x, y, z, w).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Default for Quat {
    fn default() -> Self {
        Quat {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            w: 1.0,
        }
    }
}

/// Type tag for a property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyType {
    Int32,
    Int64,
    Float32,
    Float64,
    Vec2,
    Vec3,
    Vec4,
    Quat,
    String,
    Bool,
    Bytes,
}

impl PropertyType {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            PropertyType::Int32 => 0,
            PropertyType::Int64 => 1,
            PropertyType::Float32 => 2,
            PropertyType::Float64 => 3,
            PropertyType::Vec2 => 4,
            PropertyType::Vec3 => 5,
            PropertyType::Vec4 => 6,
            PropertyType::Quat => 7,
            PropertyType::String => 8,
            PropertyType::Bool => 9,
            PropertyType::Bytes => 10,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => PropertyType::Int32,
            1 => PropertyType::Int64,
            2 => PropertyType::Float32,
            3 => PropertyType::Float64,
            4 => PropertyType::Vec2,
            5 => PropertyType::Vec3,
            6 => PropertyType::Vec4,
            7 => PropertyType::Quat,
            8 => PropertyType::String,
            9 => PropertyType::Bool,
            10 => PropertyType::Bytes,
            _ => return None,
        })
    }
}

/// Typed property value carried by update batches.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Quat(Quat),
    String(String),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl PropertyValue {
    /// The type tag for this value.
    pub fn property_type(&self) -> PropertyType {
        match self {
            PropertyValue::Int32(_) => PropertyType::Int32,
            PropertyValue::Int64(_) => PropertyType::Int64,
            PropertyValue::Float32(_) => PropertyType::Float32,
            PropertyValue::Float64(_) => PropertyType::Float64,
            PropertyValue::Vec2(_) => PropertyType::Vec2,
            PropertyValue::Vec3(_) => PropertyType::Vec3,
            PropertyValue::Vec4(_) => PropertyType::Vec4,
            PropertyValue::Quat(_) => PropertyType::Quat,
            PropertyValue::String(_) => PropertyType::String,
            PropertyValue::Bool(_) => PropertyType::Bool,
            PropertyValue::Bytes(_) => PropertyType::Bytes,
        }
    }
}

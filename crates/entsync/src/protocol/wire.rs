// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message set and wire codec.
//!
//! Every frame on the link carries one envelope:
//!
//! ```text
//! +---------+---------------+-----------------+
//! | tag: u8 | sequence: u32 | payload (by tag)|
//! +---------+---------------+-----------------+
//! ```
//!
//! The tag discriminator is recoverable in O(1) from the first byte. All
//! multi-byte integers are little-endian; strings and byte arrays are
//! `u32` length-prefixed. The codec is hand-rolled and monomorphic so the
//! wire boundary stays inspectable; `decode(encode(m)) == m` holds for
//! every variant.

use crate::core::error::{NetworkError, Result};
use crate::core::types::{
    ComponentTypeHash, PropertyHash, PropertyType, PropertyValue, Quat, Vec2, Vec3, Vec4,
};
use crate::schema::{ComponentSchema, PropertyMetadata, SchemaField};

/// One property update inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyUpdate {
    /// Caller-computed 128-bit property key.
    pub property_hash: PropertyHash,
    /// Declared type of the value.
    pub expected_type: PropertyType,
    /// The value itself.
    pub value: PropertyValue,
}

/// A timestamped, sequenced collection of deduplicated property updates.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyBatch {
    /// Microsecond wall-clock timestamp at serialization.
    pub timestamp_us: u64,
    /// Batch sequence number (independent of the envelope sequence).
    pub sequence: u32,
    /// The updates, at most one per property hash.
    pub updates: Vec<PropertyUpdate>,
}

/// One chunk of a scene snapshot transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneSnapshotChunk {
    /// Zero-based chunk index.
    pub chunk_index: u32,
    /// Total chunks in the snapshot.
    pub chunk_count: u32,
    /// Whether `data` is compressed (see [`crate::protocol::compress`]).
    pub compressed: bool,
    /// Chunk payload.
    pub data: Vec<u8>,
}

/// Protocol message. The set is closed; every variant routes onto a fixed
/// channel (see the session machine's routing table).
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Session handshake; the only message legal before handshake completion.
    Handshake {
        client_type: String,
        client_id: String,
        protocol_version: u32,
    },
    /// Entity creation announcement.
    EntityCreated {
        entity_id: u64,
        app_id: String,
        type_name: String,
        parent_id: u64,
        /// Schema reference; [`ComponentTypeHash::ZERO`] when untyped.
        type_hash: ComponentTypeHash,
        properties: Vec<PropertyMetadata>,
    },
    /// Entity destruction announcement.
    EntityDestroyed { entity_id: u64 },
    /// High-frequency property state (unreliable channel).
    PropertyUpdateBatch(PropertyBatch),
    /// Bulk scene state chunk (reliable channel).
    SceneSnapshotChunk(SceneSnapshotChunk),
    /// A schema became publicly available on the sender.
    SchemaAdvertisement {
        type_hash: ComponentTypeHash,
        app_id: String,
        component_name: String,
        schema_version: u32,
    },
    /// Advisory: the sender did not recognize `type_hash`.
    SchemaNack {
        type_hash: ComponentTypeHash,
        reason: String,
        timestamp_ms: u64,
    },
    /// Register a schema with the peer's registry.
    RegisterSchema { schema: ComponentSchema },
    /// Ask the peer to advertise all its public schemas.
    QueryPublicSchemas,
    /// Mark a registered schema public on the peer.
    PublishSchema { type_hash: ComponentTypeHash },
    /// Withdraw a schema from the peer's public set.
    UnpublishSchema { type_hash: ComponentTypeHash },
    /// Liveness probe.
    Heartbeat { timestamp_ms: u64 },
}

/// Wire tag for each message variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageTag {
    Handshake = 1,
    EntityCreated = 2,
    EntityDestroyed = 3,
    PropertyUpdateBatch = 4,
    SceneSnapshotChunk = 5,
    SchemaAdvertisement = 6,
    SchemaNack = 7,
    RegisterSchema = 8,
    QueryPublicSchemas = 9,
    PublishSchema = 10,
    UnpublishSchema = 11,
    Heartbeat = 12,
}

impl MessageTag {
    /// Recover the tag from its wire byte.
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => MessageTag::Handshake,
            2 => MessageTag::EntityCreated,
            3 => MessageTag::EntityDestroyed,
            4 => MessageTag::PropertyUpdateBatch,
            5 => MessageTag::SceneSnapshotChunk,
            6 => MessageTag::SchemaAdvertisement,
            7 => MessageTag::SchemaNack,
            8 => MessageTag::RegisterSchema,
            9 => MessageTag::QueryPublicSchemas,
            10 => MessageTag::PublishSchema,
            11 => MessageTag::UnpublishSchema,
            12 => MessageTag::Heartbeat,
            _ => return None,
        })
    }
}

impl Message {
    /// The wire tag for this message.
    pub fn tag(&self) -> MessageTag {
        match self {
            Message::Handshake { .. } => MessageTag::Handshake,
            Message::EntityCreated { .. } => MessageTag::EntityCreated,
            Message::EntityDestroyed { .. } => MessageTag::EntityDestroyed,
            Message::PropertyUpdateBatch(_) => MessageTag::PropertyUpdateBatch,
            Message::SceneSnapshotChunk(_) => MessageTag::SceneSnapshotChunk,
            Message::SchemaAdvertisement { .. } => MessageTag::SchemaAdvertisement,
            Message::SchemaNack { .. } => MessageTag::SchemaNack,
            Message::RegisterSchema { .. } => MessageTag::RegisterSchema,
            Message::QueryPublicSchemas => MessageTag::QueryPublicSchemas,
            Message::PublishSchema { .. } => MessageTag::PublishSchema,
            Message::UnpublishSchema { .. } => MessageTag::UnpublishSchema,
            Message::Heartbeat { .. } => MessageTag::Heartbeat,
        }
    }

    /// Whether this message rides the unreliable channel.
    pub fn is_unreliable(&self) -> bool {
        matches!(self, Message::PropertyUpdateBatch(_))
    }
}

/// A decoded envelope: the per-session send sequence plus the message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Per-session monotonically increasing send sequence.
    pub sequence: u32,
    /// The carried message.
    pub message: Message,
}

// ---------------------------------------------------------------------------
// Encoder / decoder
// ---------------------------------------------------------------------------

/// Little-endian append-only encoder.
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_str(&mut self, v: &str) {
        self.put_u32(v.len() as u32);
        self.buf.extend_from_slice(v.as_bytes());
    }

    pub fn put_bytes(&mut self, v: &[u8]) {
        self.put_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }

    pub fn put_property_hash(&mut self, h: PropertyHash) {
        self.put_u64(h.high);
        self.put_u64(h.low);
    }

    pub fn put_type_hash(&mut self, h: ComponentTypeHash) {
        self.put_u64(h.high);
        self.put_u64(h.low);
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounds-checked little-endian decoder over a borrowed buffer.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(NetworkError::DeserializationFailed(format!(
                "need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let bytes: [u8; 4] = self.take(4)?.try_into().expect("sized slice");
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let bytes: [u8; 8] = self.take(8)?.try_into().expect("sized slice");
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        let bytes: [u8; 4] = self.take(4)?.try_into().expect("sized slice");
        Ok(i32::from_le_bytes(bytes))
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        let bytes: [u8; 8] = self.take(8)?.try_into().expect("sized slice");
        Ok(i64::from_le_bytes(bytes))
    }

    pub fn get_f32(&mut self) -> Result<f32> {
        let bytes: [u8; 4] = self.take(4)?.try_into().expect("sized slice");
        Ok(f32::from_le_bytes(bytes))
    }

    pub fn get_f64(&mut self) -> Result<f64> {
        let bytes: [u8; 8] = self.take(8)?.try_into().expect("sized slice");
        Ok(f64::from_le_bytes(bytes))
    }

    pub fn get_str(&mut self) -> Result<String> {
        let len = self.get_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| NetworkError::DeserializationFailed("invalid utf-8 string".into()))
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn get_property_hash(&mut self) -> Result<PropertyHash> {
        Ok(PropertyHash::new(self.get_u64()?, self.get_u64()?))
    }

    pub fn get_type_hash(&mut self) -> Result<ComponentTypeHash> {
        Ok(ComponentTypeHash::new(self.get_u64()?, self.get_u64()?))
    }

    /// Fail unless the buffer was consumed exactly.
    pub fn finish(self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(NetworkError::DeserializationFailed(format!(
                "{} trailing bytes after message",
                self.remaining()
            )));
        }
        Ok(())
    }
}

fn put_value(enc: &mut Encoder, value: &PropertyValue) {
    enc.put_u8(value.property_type().as_u8());
    match value {
        PropertyValue::Int32(v) => enc.put_i32(*v),
        PropertyValue::Int64(v) => enc.put_i64(*v),
        PropertyValue::Float32(v) => enc.put_f32(*v),
        PropertyValue::Float64(v) => enc.put_f64(*v),
        PropertyValue::Vec2(v) => {
            enc.put_f32(v.x);
            enc.put_f32(v.y);
        }
        PropertyValue::Vec3(v) => {
            enc.put_f32(v.x);
            enc.put_f32(v.y);
            enc.put_f32(v.z);
        }
        PropertyValue::Vec4(v) => {
            enc.put_f32(v.x);
            enc.put_f32(v.y);
            enc.put_f32(v.z);
            enc.put_f32(v.w);
        }
        PropertyValue::Quat(v) => {
            enc.put_f32(v.x);
            enc.put_f32(v.y);
            enc.put_f32(v.z);
            enc.put_f32(v.w);
        }
        PropertyValue::String(v) => enc.put_str(v),
        PropertyValue::Bool(v) => enc.put_bool(*v),
        PropertyValue::Bytes(v) => enc.put_bytes(v),
    }
}

fn get_value(dec: &mut Decoder<'_>) -> Result<PropertyValue> {
    let tag = dec.get_u8()?;
    let ty = PropertyType::from_u8(tag)
        .ok_or_else(|| NetworkError::InvalidMessage(format!("unknown value type {}", tag)))?;
    Ok(match ty {
        PropertyType::Int32 => PropertyValue::Int32(dec.get_i32()?),
        PropertyType::Int64 => PropertyValue::Int64(dec.get_i64()?),
        PropertyType::Float32 => PropertyValue::Float32(dec.get_f32()?),
        PropertyType::Float64 => PropertyValue::Float64(dec.get_f64()?),
        PropertyType::Vec2 => PropertyValue::Vec2(Vec2 {
            x: dec.get_f32()?,
            y: dec.get_f32()?,
        }),
        PropertyType::Vec3 => PropertyValue::Vec3(Vec3 {
            x: dec.get_f32()?,
            y: dec.get_f32()?,
            z: dec.get_f32()?,
        }),
        PropertyType::Vec4 => PropertyValue::Vec4(Vec4 {
            x: dec.get_f32()?,
            y: dec.get_f32()?,
            z: dec.get_f32()?,
            w: dec.get_f32()?,
        }),
        PropertyType::Quat => PropertyValue::Quat(Quat {
            x: dec.get_f32()?,
            y: dec.get_f32()?,
            z: dec.get_f32()?,
            w: dec.get_f32()?,
        }),
        PropertyType::String => PropertyValue::String(dec.get_str()?),
        PropertyType::Bool => PropertyValue::Bool(dec.get_bool()?),
        PropertyType::Bytes => PropertyValue::Bytes(dec.get_bytes()?),
    })
}

fn put_schema(enc: &mut Encoder, schema: &ComponentSchema) {
    enc.put_type_hash(schema.type_hash);
    enc.put_str(&schema.app_id);
    enc.put_str(&schema.component_name);
    enc.put_u32(schema.version);
    enc.put_u32(schema.fields.len() as u32);
    for field in &schema.fields {
        enc.put_str(&field.name);
        enc.put_u8(field.field_type.as_u8());
    }
}

fn get_schema(dec: &mut Decoder<'_>) -> Result<ComponentSchema> {
    let type_hash = dec.get_type_hash()?;
    let app_id = dec.get_str()?;
    let component_name = dec.get_str()?;
    let version = dec.get_u32()?;
    let field_count = dec.get_u32()? as usize;
    if field_count > dec.remaining() {
        return Err(NetworkError::DeserializationFailed(
            "schema field count exceeds payload".into(),
        ));
    }
    let mut fields = Vec::with_capacity(field_count);
    for _ in 0..field_count {
        let name = dec.get_str()?;
        let tag = dec.get_u8()?;
        let field_type = PropertyType::from_u8(tag).ok_or_else(|| {
            NetworkError::InvalidMessage(format!("unknown field type {}", tag))
        })?;
        fields.push(SchemaField { name, field_type });
    }
    Ok(ComponentSchema {
        type_hash,
        app_id,
        component_name,
        version,
        fields,
    })
}

/// Encode `message` into an envelope stamped with `sequence`.
pub fn encode_envelope(sequence: u32, message: &Message) -> Result<Vec<u8>> {
    let mut enc = Encoder::with_capacity(64);
    enc.put_u8(message.tag() as u8);
    enc.put_u32(sequence);
    match message {
        Message::Handshake {
            client_type,
            client_id,
            protocol_version,
        } => {
            enc.put_str(client_type);
            enc.put_str(client_id);
            enc.put_u32(*protocol_version);
        }
        Message::EntityCreated {
            entity_id,
            app_id,
            type_name,
            parent_id,
            type_hash,
            properties,
        } => {
            enc.put_u64(*entity_id);
            enc.put_str(app_id);
            enc.put_str(type_name);
            enc.put_u64(*parent_id);
            enc.put_type_hash(*type_hash);
            enc.put_u32(properties.len() as u32);
            for meta in properties {
                enc.put_str(&meta.name);
                enc.put_u8(meta.property_type.as_u8());
            }
        }
        Message::EntityDestroyed { entity_id } => {
            enc.put_u64(*entity_id);
        }
        Message::PropertyUpdateBatch(batch) => {
            enc.put_u64(batch.timestamp_us);
            enc.put_u32(batch.sequence);
            enc.put_u32(batch.updates.len() as u32);
            for update in &batch.updates {
                enc.put_property_hash(update.property_hash);
                enc.put_u8(update.expected_type.as_u8());
                put_value(&mut enc, &update.value);
            }
        }
        Message::SceneSnapshotChunk(chunk) => {
            enc.put_u32(chunk.chunk_index);
            enc.put_u32(chunk.chunk_count);
            enc.put_bool(chunk.compressed);
            enc.put_bytes(&chunk.data);
        }
        Message::SchemaAdvertisement {
            type_hash,
            app_id,
            component_name,
            schema_version,
        } => {
            enc.put_type_hash(*type_hash);
            enc.put_str(app_id);
            enc.put_str(component_name);
            enc.put_u32(*schema_version);
        }
        Message::SchemaNack {
            type_hash,
            reason,
            timestamp_ms,
        } => {
            enc.put_type_hash(*type_hash);
            enc.put_str(reason);
            enc.put_u64(*timestamp_ms);
        }
        Message::RegisterSchema { schema } => {
            put_schema(&mut enc, schema);
        }
        Message::QueryPublicSchemas => {}
        Message::PublishSchema { type_hash } | Message::UnpublishSchema { type_hash } => {
            enc.put_type_hash(*type_hash);
        }
        Message::Heartbeat { timestamp_ms } => {
            enc.put_u64(*timestamp_ms);
        }
    }
    Ok(enc.into_bytes())
}

/// Recover the tag discriminator from a frame without decoding the payload.
pub fn peek_tag(frame: &[u8]) -> Result<MessageTag> {
    let first = frame
        .first()
        .ok_or_else(|| NetworkError::DeserializationFailed("empty frame".into()))?;
    MessageTag::from_u8(*first)
        .ok_or_else(|| NetworkError::InvalidMessage(format!("unknown message tag {}", first)))
}

/// Decode an envelope, consuming the frame exactly.
pub fn decode_envelope(frame: &[u8]) -> Result<Envelope> {
    let mut dec = Decoder::new(frame);
    let tag_byte = dec.get_u8()?;
    let tag = MessageTag::from_u8(tag_byte)
        .ok_or_else(|| NetworkError::InvalidMessage(format!("unknown message tag {}", tag_byte)))?;
    let sequence = dec.get_u32()?;

    let message = match tag {
        MessageTag::Handshake => Message::Handshake {
            client_type: dec.get_str()?,
            client_id: dec.get_str()?,
            protocol_version: dec.get_u32()?,
        },
        MessageTag::EntityCreated => {
            let entity_id = dec.get_u64()?;
            let app_id = dec.get_str()?;
            let type_name = dec.get_str()?;
            let parent_id = dec.get_u64()?;
            let type_hash = dec.get_type_hash()?;
            let count = dec.get_u32()? as usize;
            if count > dec.remaining() {
                return Err(NetworkError::DeserializationFailed(
                    "property count exceeds payload".into(),
                ));
            }
            let mut properties = Vec::with_capacity(count);
            for _ in 0..count {
                let name = dec.get_str()?;
                let tag = dec.get_u8()?;
                let property_type = PropertyType::from_u8(tag).ok_or_else(|| {
                    NetworkError::InvalidMessage(format!("unknown property type {}", tag))
                })?;
                properties.push(PropertyMetadata {
                    name,
                    property_type,
                });
            }
            Message::EntityCreated {
                entity_id,
                app_id,
                type_name,
                parent_id,
                type_hash,
                properties,
            }
        }
        MessageTag::EntityDestroyed => Message::EntityDestroyed {
            entity_id: dec.get_u64()?,
        },
        MessageTag::PropertyUpdateBatch => {
            let timestamp_us = dec.get_u64()?;
            let batch_sequence = dec.get_u32()?;
            let count = dec.get_u32()? as usize;
            if count > dec.remaining() {
                return Err(NetworkError::DeserializationFailed(
                    "update count exceeds payload".into(),
                ));
            }
            let mut updates = Vec::with_capacity(count);
            for _ in 0..count {
                let property_hash = dec.get_property_hash()?;
                let type_tag = dec.get_u8()?;
                let expected_type = PropertyType::from_u8(type_tag).ok_or_else(|| {
                    NetworkError::InvalidMessage(format!("unknown property type {}", type_tag))
                })?;
                let value = get_value(&mut dec)?;
                if value.property_type() != expected_type {
                    return Err(NetworkError::InvalidMessage(
                        "value type does not match declared type".into(),
                    ));
                }
                updates.push(PropertyUpdate {
                    property_hash,
                    expected_type,
                    value,
                });
            }
            Message::PropertyUpdateBatch(PropertyBatch {
                timestamp_us,
                sequence: batch_sequence,
                updates,
            })
        }
        MessageTag::SceneSnapshotChunk => Message::SceneSnapshotChunk(SceneSnapshotChunk {
            chunk_index: dec.get_u32()?,
            chunk_count: dec.get_u32()?,
            compressed: dec.get_bool()?,
            data: dec.get_bytes()?,
        }),
        MessageTag::SchemaAdvertisement => Message::SchemaAdvertisement {
            type_hash: dec.get_type_hash()?,
            app_id: dec.get_str()?,
            component_name: dec.get_str()?,
            schema_version: dec.get_u32()?,
        },
        MessageTag::SchemaNack => Message::SchemaNack {
            type_hash: dec.get_type_hash()?,
            reason: dec.get_str()?,
            timestamp_ms: dec.get_u64()?,
        },
        MessageTag::RegisterSchema => Message::RegisterSchema {
            schema: get_schema(&mut dec)?,
        },
        MessageTag::QueryPublicSchemas => Message::QueryPublicSchemas,
        MessageTag::PublishSchema => Message::PublishSchema {
            type_hash: dec.get_type_hash()?,
        },
        MessageTag::UnpublishSchema => Message::UnpublishSchema {
            type_hash: dec.get_type_hash()?,
        },
        MessageTag::Heartbeat => Message::Heartbeat {
            timestamp_ms: dec.get_u64()?,
        },
    };

    dec.finish()?;
    Ok(Envelope { sequence, message })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::Handshake {
                client_type: "viewer".into(),
                client_id: "client-42".into(),
                protocol_version: 1,
            },
            Message::EntityCreated {
                entity_id: 7,
                app_id: "demo".into(),
                type_name: "Cube".into(),
                parent_id: 0,
                type_hash: ComponentTypeHash::new(0xAB, 0xCD),
                properties: vec![
                    PropertyMetadata {
                        name: "position".into(),
                        property_type: PropertyType::Vec3,
                    },
                    PropertyMetadata {
                        name: "visible".into(),
                        property_type: PropertyType::Bool,
                    },
                ],
            },
            Message::EntityDestroyed { entity_id: 7 },
            Message::PropertyUpdateBatch(PropertyBatch {
                timestamp_us: 1_234_567,
                sequence: 3,
                updates: vec![
                    PropertyUpdate {
                        property_hash: PropertyHash::new(1, 2),
                        expected_type: PropertyType::Vec3,
                        value: PropertyValue::Vec3(Vec3 {
                            x: 1.0,
                            y: 2.0,
                            z: 3.0,
                        }),
                    },
                    PropertyUpdate {
                        property_hash: PropertyHash::new(3, 4),
                        expected_type: PropertyType::String,
                        value: PropertyValue::String("hello".into()),
                    },
                    PropertyUpdate {
                        property_hash: PropertyHash::new(5, 6),
                        expected_type: PropertyType::Bytes,
                        value: PropertyValue::Bytes(vec![0, 1, 2, 255]),
                    },
                ],
            }),
            Message::SceneSnapshotChunk(SceneSnapshotChunk {
                chunk_index: 2,
                chunk_count: 5,
                compressed: true,
                data: vec![9; 128],
            }),
            Message::SchemaAdvertisement {
                type_hash: ComponentTypeHash::new(10, 20),
                app_id: "demo".into(),
                component_name: "Transform".into(),
                schema_version: 4,
            },
            Message::SchemaNack {
                type_hash: ComponentTypeHash::new(30, 40),
                reason: "schema not found in registry".into(),
                timestamp_ms: 99,
            },
            Message::RegisterSchema {
                schema: ComponentSchema {
                    type_hash: ComponentTypeHash::new(50, 60),
                    app_id: "demo".into(),
                    component_name: "Physics".into(),
                    version: 2,
                    fields: vec![SchemaField {
                        name: "mass".into(),
                        field_type: PropertyType::Float32,
                    }],
                },
            },
            Message::QueryPublicSchemas,
            Message::PublishSchema {
                type_hash: ComponentTypeHash::new(70, 80),
            },
            Message::UnpublishSchema {
                type_hash: ComponentTypeHash::new(70, 80),
            },
            Message::Heartbeat { timestamp_ms: 555 },
        ]
    }

    #[test]
    fn test_round_trip_all_variants() {
        for (i, message) in sample_messages().into_iter().enumerate() {
            let frame = encode_envelope(i as u32, &message).expect("encode");
            let envelope = decode_envelope(&frame).expect("decode");
            assert_eq!(envelope.sequence, i as u32);
            assert_eq!(envelope.message, message, "variant {} differs", i);
        }
    }

    #[test]
    fn test_peek_tag_is_first_byte() {
        let frame = encode_envelope(9, &Message::Heartbeat { timestamp_ms: 1 }).unwrap();
        assert_eq!(peek_tag(&frame).unwrap(), MessageTag::Heartbeat);
        assert_eq!(frame[0], MessageTag::Heartbeat as u8);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut frame = encode_envelope(0, &Message::QueryPublicSchemas).unwrap();
        frame[0] = 0xEE;
        assert!(matches!(
            decode_envelope(&frame),
            Err(NetworkError::InvalidMessage(_))
        ));
        assert!(peek_tag(&frame).is_err());
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let frame = encode_envelope(
            1,
            &Message::Handshake {
                client_type: "viewer".into(),
                client_id: "c".into(),
                protocol_version: 1,
            },
        )
        .unwrap();
        for cut in 0..frame.len() {
            let err = decode_envelope(&frame[..cut]).unwrap_err();
            assert!(
                matches!(
                    err,
                    NetworkError::DeserializationFailed(_) | NetworkError::InvalidMessage(_)
                ),
                "cut at {} produced {:?}",
                cut,
                err
            );
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut frame = encode_envelope(1, &Message::EntityDestroyed { entity_id: 2 }).unwrap();
        frame.push(0);
        assert!(matches!(
            decode_envelope(&frame),
            Err(NetworkError::DeserializationFailed(_))
        ));
    }

    #[test]
    fn test_declared_length_cannot_overrun() {
        // A string whose declared length exceeds the payload must fail
        // cleanly rather than allocate or read past the end.
        let mut enc = Encoder::new();
        enc.put_u8(MessageTag::Handshake as u8);
        enc.put_u32(0);
        enc.put_u32(u32::MAX); // absurd string length
        let frame = enc.into_bytes();
        assert!(matches!(
            decode_envelope(&frame),
            Err(NetworkError::DeserializationFailed(_))
        ));
    }

    #[test]
    fn test_value_type_mismatch_rejected() {
        let message = Message::PropertyUpdateBatch(PropertyBatch {
            timestamp_us: 0,
            sequence: 0,
            updates: vec![PropertyUpdate {
                property_hash: PropertyHash::new(1, 1),
                expected_type: PropertyType::Int32,
                value: PropertyValue::Int32(5),
            }],
        });
        let mut frame = encode_envelope(0, &message).unwrap();
        // Flip the declared expected-type byte to Bool; the encoded value
        // tag still says Int32.
        let offset = 1 + 4 + 8 + 4 + 4 + 16;
        frame[offset] = PropertyType::Bool.as_u8();
        assert!(decode_envelope(&frame).is_err());
    }

    #[test]
    fn test_routing_split() {
        for message in sample_messages() {
            let unreliable = message.is_unreliable();
            match message {
                Message::PropertyUpdateBatch(_) => assert!(unreliable),
                _ => assert!(!unreliable),
            }
        }
    }
}

// ABOUTME: Protocol registry mapping compact type ids to erased encode/decode/complete hooks
// ABOUTME: Also hosts the wire primitives: CRC-guarded integers, varints and endian helpers

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};

use crate::context::ConnectionContext;
use crate::error::{Error, Result};
use crate::message::{AnyMessage, downcast_message};
use crate::packet::MIN_FREE_PACKET_DATA_SIZE;

/// Compact, dense message type identifier assigned at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub u16);

/// A message type that can cross the wire.
///
/// `encode` writes the complete payload; `decode` must consume exactly the
/// bytes `encode` produced. Use the primitive helpers from this module so the
/// byte order stays fixed regardless of host.
pub trait Serializable: Send + 'static {
    fn encode(&self, buf: &mut BytesMut) -> Result<()>;
    fn decode(buf: &mut Cursor<&[u8]>) -> Result<Self>
    where
        Self: Sized;
}

/// Completion hook stored per registered type.
///
/// Invoked with the sent message (if this process sent one), the received
/// message (if one arrived from the wire) and the terminal error, exactly
/// once per sent message and once per received message.
pub type CompleteFn = Box<
    dyn Fn(
            &mut ConnectionContext<'_>,
            Option<Box<dyn AnyMessage>>,
            Option<Box<dyn AnyMessage>>,
            Option<&Error>,
        ) + Send
        + Sync,
>;

type EncodeFn = Box<dyn Fn(&dyn AnyMessage, &mut BytesMut) -> Result<()> + Send + Sync>;
type DecodeFn = Box<dyn Fn(&mut Cursor<&[u8]>) -> Result<Box<dyn AnyMessage>> + Send + Sync>;

struct TypeEntry {
    name: &'static str,
    encode: EncodeFn,
    decode: DecodeFn,
    complete: CompleteFn,
}

/// Process-wide table of registered message types.
///
/// Built once at startup through [`ProtocolBuilder`] and immutable afterwards,
/// so it is shared read-only across every connection without locking.
pub struct Protocol {
    entries: Vec<TypeEntry>,
    by_rust_type: HashMap<std::any::TypeId, u16>,
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.entries.iter().map(|e| e.name).collect();
        f.debug_struct("Protocol").field("types", &names).finish()
    }
}

impl Protocol {
    pub fn builder() -> ProtocolBuilder {
        ProtocolBuilder::default()
    }

    /// The writer's "don't start a packet with less room than this" threshold.
    pub fn min_free_packet_data_size(&self) -> usize {
        MIN_FREE_PACKET_DATA_SIZE
    }

    pub fn is_registered(&self, type_id: TypeId) -> bool {
        (type_id.0 as usize) < self.entries.len()
    }

    pub fn type_name(&self, type_id: TypeId) -> Option<&'static str> {
        self.entries.get(type_id.0 as usize).map(|e| e.name)
    }

    /// Look up the registered type id for a concrete message type.
    pub fn type_id_of<M: Any>(&self) -> Result<TypeId> {
        self.by_rust_type
            .get(&std::any::TypeId::of::<M>())
            .map(|id| TypeId(*id))
            .ok_or(Error::UnknownMessageType)
    }

    pub(crate) fn encode(
        &self,
        type_id: TypeId,
        message: &dyn AnyMessage,
        buf: &mut BytesMut,
    ) -> Result<()> {
        let entry = self
            .entries
            .get(type_id.0 as usize)
            .ok_or(Error::UnknownMessageType)?;
        (entry.encode)(message, buf)
    }

    pub(crate) fn decode(
        &self,
        type_id: TypeId,
        buf: &mut Cursor<&[u8]>,
    ) -> Result<Box<dyn AnyMessage>> {
        let entry = self
            .entries
            .get(type_id.0 as usize)
            .ok_or(Error::UnknownMessageType)?;
        (entry.decode)(buf)
    }

    pub(crate) fn complete(
        &self,
        type_id: TypeId,
        ctx: &mut ConnectionContext<'_>,
        sent: Option<Box<dyn AnyMessage>>,
        received: Option<Box<dyn AnyMessage>>,
        error: Option<&Error>,
    ) {
        if let Some(entry) = self.entries.get(type_id.0 as usize) {
            (entry.complete)(ctx, sent, received, error);
        } else {
            tracing::error!(type_id = type_id.0, "completion for unregistered type");
        }
    }
}

/// Builder for the immutable [`Protocol`] table.
///
/// Registration order assigns the dense type ids, so both endpoints must
/// register the same types in the same order.
#[derive(Default)]
pub struct ProtocolBuilder {
    entries: Vec<TypeEntry>,
    by_rust_type: HashMap<std::any::TypeId, u16>,
}

impl ProtocolBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a message type with its completion hook.
    pub fn register<M, F>(mut self, complete: F) -> Self
    where
        M: Serializable,
        F: Fn(&mut ConnectionContext<'_>, Option<Box<M>>, Option<Box<M>>, Option<&Error>)
            + Send
            + Sync
            + 'static,
    {
        let id = self.entries.len() as u16;
        self.by_rust_type.insert(std::any::TypeId::of::<M>(), id);
        self.entries.push(TypeEntry {
            name: std::any::type_name::<M>(),
            encode: Box::new(|message, buf| {
                let message = message
                    .as_any()
                    .downcast_ref::<M>()
                    .ok_or(Error::Logic("message type does not match registration"))?;
                message.encode(buf)
            }),
            decode: Box::new(|buf| {
                let message = M::decode(buf)?;
                Ok(Box::new(message) as Box<dyn AnyMessage>)
            }),
            complete: Box::new(move |ctx, sent, received, error| {
                let sent = sent.and_then(downcast_message::<M>);
                let received = received.and_then(downcast_message::<M>);
                complete(ctx, sent, received, error);
            }),
        });
        self
    }

    pub fn build(self) -> Arc<Protocol> {
        Arc::new(Protocol {
            entries: self.entries,
            by_rust_type: self.by_rust_type,
        })
    }
}

// --- wire primitives ---------------------------------------------------------

/// Values protected by the 4-bit CRC must fit in 28 bits.
pub const MAX_CRC_VALUE: u32 = (1 << 28) - 1;

fn crc4(value: u32) -> u8 {
    // CRC-4-ITU, bitwise, over the 28 data bits
    let mut crc: u8 = 0;
    for i in (0..28).rev() {
        let bit = ((value >> i) & 1) as u8;
        let top = (crc >> 3) & 1;
        crc = (crc << 1) & 0x0f;
        if top ^ bit == 1 {
            crc ^= 0x03;
        }
    }
    crc
}

/// Wrap a value with its CRC so a single-bit flip on the wire is detected.
pub fn compute_value_with_crc(value: u32) -> Result<u32> {
    if value > MAX_CRC_VALUE {
        return Err(Error::Logic("value too large for CRC wrapping"));
    }
    Ok((value << 4) | crc4(value) as u32)
}

/// Unwrap a CRC-guarded value, verifying the checksum.
pub fn check_value_with_crc(wire: u32) -> Result<u32> {
    let value = wire >> 4;
    if crc4(value) as u32 == (wire & 0x0f) {
        Ok(value)
    } else {
        Err(Error::Deserializer("CRC mismatch on wire value".into()))
    }
}

/// Store a variable-length integer (7 bits per byte, continuation bit high).
pub fn store_cross(buf: &mut BytesMut, mut value: u32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Load a variable-length integer stored by [`store_cross`].
pub fn load_cross(buf: &mut Cursor<&[u8]>) -> Result<u32> {
    let mut value: u32 = 0;
    let mut shift: u32 = 0;
    loop {
        if !buf.has_remaining() {
            return Err(Error::Deserializer("truncated variable-length integer".into()));
        }
        if shift > 28 {
            return Err(Error::Deserializer("variable-length integer overflow".into()));
        }
        let byte = buf.get_u8();
        value |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Fixed-endianness primitive store/load, used by message payload codecs.
pub fn encode_u8(buf: &mut BytesMut, value: u8) {
    buf.put_u8(value);
}

pub fn encode_u16(buf: &mut BytesMut, value: u16) {
    buf.put_u16(value);
}

pub fn encode_u32(buf: &mut BytesMut, value: u32) {
    buf.put_u32(value);
}

pub fn encode_u64(buf: &mut BytesMut, value: u64) {
    buf.put_u64(value);
}

pub fn decode_u8(buf: &mut Cursor<&[u8]>) -> Result<u8> {
    if !buf.has_remaining() {
        return Err(Error::Deserializer("need more data".into()));
    }
    Ok(buf.get_u8())
}

pub fn decode_u16(buf: &mut Cursor<&[u8]>) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(Error::Deserializer("need more data".into()));
    }
    Ok(buf.get_u16())
}

pub fn decode_u32(buf: &mut Cursor<&[u8]>) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(Error::Deserializer("need more data".into()));
    }
    Ok(buf.get_u32())
}

pub fn decode_u64(buf: &mut Cursor<&[u8]>) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(Error::Deserializer("need more data".into()));
    }
    Ok(buf.get_u64())
}

/// Encode a length-prefixed UTF-8 string.
pub fn encode_string(buf: &mut BytesMut, value: &str) {
    store_cross(buf, value.len() as u32);
    buf.put_slice(value.as_bytes());
}

/// Decode a length-prefixed UTF-8 string.
pub fn decode_string(buf: &mut Cursor<&[u8]>) -> Result<String> {
    let len = load_cross(buf)? as usize;
    if buf.remaining() < len {
        return Err(Error::Deserializer("truncated string".into()));
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec())
        .map_err(|e| Error::Deserializer(format!("invalid UTF-8 in string: {e}")))
}

/// Encode a length-prefixed byte blob.
pub fn encode_bytes(buf: &mut BytesMut, value: &[u8]) {
    store_cross(buf, value.len() as u32);
    buf.put_slice(value);
}

/// Decode a length-prefixed byte blob.
pub fn decode_bytes(buf: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = load_cross(buf)? as usize;
    if buf.remaining() < len {
        return Err(Error::Deserializer("truncated byte blob".into()));
    }
    Ok(buf.copy_to_bytes(len).to_vec())
}

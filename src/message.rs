// ABOUTME: Message-level data model: flag bits, request/message ids, the wire header and bundles
// ABOUTME: Bundles carry an erased message value plus its completion hooks between pool and writer

use std::any::Any;
use std::fmt;
use std::io::Cursor;

use bytes::BytesMut;

use crate::context::ConnectionContext;
use crate::error::Error;
use crate::protocol::{TypeId, load_cross, store_cross};

bitflags::bitflags! {
    /// Per-message flag bits.
    ///
    /// The low byte is user-settable and crosses the wire; the upper bits are
    /// lifecycle state maintained by the library.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MessageFlags: u32 {
        /// Keep the slot alive after the send completes, waiting for a response
        const WAIT_RESPONSE = 0b0000_0001;
        /// No later message of the same pool may start serializing until this one finishes
        const SYNCHRONOUS = 0b0000_0010;
        /// Never retry on another connection; fail on the first connection loss
        const ONE_SHOT = 0b0000_0100;
        /// Safe to re-send on a new connection if the old one died mid-flight
        const IDEMPOTENT = 0b0000_1000;
        /// This message answers an earlier request and carries its request id
        const RESPONSE = 0b0001_0000;

        /// Canceled by the sender; the peer must discard partial state
        const CANCELED = 1 << 8;
        /// At least one byte of this message has been serialized
        const STARTED_SEND = 1 << 9;
        /// The last byte of this message has been serialized
        const DONE_SEND = 1 << 10;
        /// The value arrived from the wire
        const ON_PEER = 1 << 11;
        /// The value returned to the process that constructed the request
        const BACK_ON_SENDER = 1 << 12;

        /// Bits that are serialized into the message header.
        const WIRE = Self::WAIT_RESPONSE.bits()
            | Self::SYNCHRONOUS.bits()
            | Self::ONE_SHOT.bits()
            | Self::IDEMPOTENT.bits()
            | Self::RESPONSE.bits();
    }
}

impl MessageFlags {
    pub fn is_synchronous(&self) -> bool {
        self.contains(Self::SYNCHRONOUS)
    }

    pub fn is_asynchronous(&self) -> bool {
        !self.is_synchronous()
    }

    pub fn is_waiting_response(&self) -> bool {
        self.contains(Self::WAIT_RESPONSE)
    }

    pub fn is_one_shot(&self) -> bool {
        self.contains(Self::ONE_SHOT)
    }

    pub fn is_idempotent(&self) -> bool {
        self.contains(Self::IDEMPOTENT)
    }

    pub fn is_response(&self) -> bool {
        self.contains(Self::RESPONSE)
    }

    pub fn is_canceled(&self) -> bool {
        self.contains(Self::CANCELED)
    }
}

/// Identity of a message within one connection's writer: slot index plus a
/// generation counter so reused slots never alias. Carried on the wire so a
/// response can find the request that is waiting for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId {
    pub index: u32,
    pub unique: u32,
}

impl RequestId {
    pub const INVALID: Self = Self {
        index: u32::MAX,
        unique: 0,
    };

    pub fn new(index: u32, unique: u32) -> Self {
        Self { index, unique }
    }

    pub fn is_valid(&self) -> bool {
        self.index != u32::MAX
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.index, self.unique)
    }
}

/// Pool-side identity of a message, stable across connection retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub index: u32,
    pub unique: u32,
}

impl MessageId {
    pub const INVALID: Self = Self {
        index: u32::MAX,
        unique: 0,
    };

    pub fn new(index: u32, unique: u32) -> Self {
        Self { index, unique }
    }

    pub fn is_valid(&self) -> bool {
        self.index != u32::MAX
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.index, self.unique)
    }
}

/// Wire header serialized before every message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Wire-relevant subset of the message flags
    pub flags: MessageFlags,
    /// The sender's writer-slot id, or for responses the id of the request
    pub request_id: RequestId,
    /// Send-hop counter, incremented each time the message enters a writer
    pub state: u32,
}

impl MessageHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        store_cross(buf, (self.flags & MessageFlags::WIRE).bits());
        store_cross(buf, self.request_id.index);
        store_cross(buf, self.request_id.unique);
        store_cross(buf, self.state);
    }

    pub fn decode(buf: &mut Cursor<&[u8]>) -> Result<Self, Error> {
        let flags = MessageFlags::from_bits_truncate(load_cross(buf)?);
        let index = load_cross(buf)?;
        let unique = load_cross(buf)?;
        let state = load_cross(buf)?;
        Ok(Self {
            flags,
            request_id: RequestId::new(index, unique),
            state,
        })
    }
}

/// Type-erased message value.
///
/// Concrete message types participate through the protocol registry's tagged
/// dispatch; no inheritance, no RTTI. The blanket impl makes any sendable
/// value erasable, the registry's typed glue does the downcasts.
pub trait AnyMessage: Send + 'static {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Send + 'static> AnyMessage for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Downcast an erased message back to its concrete type.
pub fn downcast_message<M: 'static>(message: Box<dyn AnyMessage>) -> Option<Box<M>> {
    message.into_any().downcast().ok()
}

/// Per-request response callback, invoked exactly once with either the
/// received response or the terminal error.
pub type ResponseFn =
    Box<dyn FnOnce(&mut ConnectionContext<'_>, Option<Box<dyn AnyMessage>>, Option<&Error>) + Send>;

/// The unit moved between pool queue, writer slot and completion path.
///
/// Owned exclusively by whichever component currently holds it; transfer is
/// always by move.
pub struct MessageBundle {
    pub type_id: TypeId,
    pub flags: MessageFlags,
    pub message: Box<dyn AnyMessage>,
    pub response_fnc: Option<ResponseFn>,
    /// For responses: the peer's request id to embed in the header
    pub peer_request_id: RequestId,
    /// Send-hop counter carried across retries
    pub state: u32,
}

impl MessageBundle {
    pub fn new(type_id: TypeId, flags: MessageFlags, message: Box<dyn AnyMessage>) -> Self {
        Self {
            type_id,
            flags,
            message,
            response_fnc: None,
            peer_request_id: RequestId::INVALID,
            state: 0,
        }
    }

    pub fn with_response_fnc(mut self, response_fnc: ResponseFn) -> Self {
        self.response_fnc = Some(response_fnc);
        self
    }
}

impl fmt::Debug for MessageBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBundle")
            .field("type_id", &self.type_id)
            .field("flags", &self.flags)
            .field("has_response_fnc", &self.response_fnc.is_some())
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = MessageHeader {
            flags: MessageFlags::WAIT_RESPONSE | MessageFlags::SYNCHRONOUS,
            request_id: RequestId::new(7, 3),
            state: 2,
        };

        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        let mut cursor = Cursor::new(buf.as_ref());
        let decoded = MessageHeader::decode(&mut cursor).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn internal_flags_do_not_cross_the_wire() {
        let header = MessageHeader {
            flags: MessageFlags::IDEMPOTENT | MessageFlags::CANCELED | MessageFlags::DONE_SEND,
            request_id: RequestId::new(0, 0),
            state: 0,
        };

        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        let mut cursor = Cursor::new(buf.as_ref());
        let decoded = MessageHeader::decode(&mut cursor).unwrap();
        assert_eq!(decoded.flags, MessageFlags::IDEMPOTENT);
    }

    #[test]
    fn downcast_roundtrip() {
        let boxed: Box<dyn AnyMessage> = Box::new(String::from("payload"));
        let back = downcast_message::<String>(boxed).unwrap();
        assert_eq!(*back, "payload");
    }

    #[test]
    fn invalid_ids() {
        assert!(!RequestId::INVALID.is_valid());
        assert!(!MessageId::INVALID.is_valid());
        assert!(RequestId::new(0, 0).is_valid());
    }
}

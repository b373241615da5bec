// ABOUTME: The context handed to completion hooks and response handlers
// ABOUTME: Exposes message identity/derived traits and lets peer-side hooks queue responses

use std::any::Any;

use crate::error::{Error, Result};
use crate::message::{AnyMessage, MessageFlags, MessageId, RequestId};
use crate::protocol::{Protocol, Serializable, TypeId};
use crate::service::{ConnectionId, RecipientId, Service};

/// A response queued by a hook, drained into the connection's writer after
/// the hook returns.
pub(crate) struct ResponseCommand {
    pub type_id: TypeId,
    pub message: Box<dyn AnyMessage>,
    pub request_id: RequestId,
}

/// Context passed to every completion hook and response handler.
///
/// Hooks run synchronously on the connection task that triggered them, so the
/// context can hand out borrowed access without synchronization. A hook that
/// wants to answer an inbound message queues the response here; it is written
/// through the same connection once the hook returns.
pub struct ConnectionContext<'a> {
    pub(crate) service: &'a Service,
    pub(crate) protocol: &'a Protocol,
    pub(crate) connection_id: ConnectionId,
    pub(crate) recipient_id: RecipientId,
    pub(crate) message_flags: MessageFlags,
    pub(crate) request_id: RequestId,
    pub(crate) message_id: MessageId,
    pub(crate) message_state: u32,
    pub(crate) responses: &'a mut Vec<ResponseCommand>,
    pub(crate) kill_requested: &'a mut bool,
    pub(crate) user_data: &'a mut Option<UserData>,
}

impl ConnectionContext<'_> {
    /// The service this connection belongs to.
    pub fn service(&self) -> &Service {
        self.service
    }

    /// The connection the current message arrived on or was sent through.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// The pool identity of the remote endpoint.
    pub fn recipient_id(&self) -> RecipientId {
        self.recipient_id
    }

    /// Flags of the message this hook is being invoked for.
    pub fn message_flags(&self) -> MessageFlags {
        self.message_flags
    }

    /// The request id correlating a request with its response.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// The pool-side message id, valid for messages sent through a pool.
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Send-hop counter of the message; greater than one after a retry.
    pub fn message_state(&self) -> u32 {
        self.message_state
    }

    /// True when the message value arrived from the wire.
    pub fn is_on_peer(&self) -> bool {
        self.message_flags.contains(MessageFlags::ON_PEER)
    }

    /// True when the value is a response delivered back to the requester.
    pub fn is_back_on_sender(&self) -> bool {
        self.message_flags.contains(MessageFlags::BACK_ON_SENDER)
    }

    /// True when this process constructed the message.
    pub fn is_on_sender(&self) -> bool {
        !self.is_on_peer()
    }

    /// Queue a response to the message currently being delivered.
    ///
    /// Only meaningful from a peer-side hook with a live connection; the
    /// response carries this message's request id so the remote writer can
    /// complete the waiting request.
    pub fn send_response<M: Serializable>(&mut self, message: M) -> Result<()> {
        if !self.connection_id.is_valid() {
            return Err(Error::ConnectionInexistent);
        }
        if !self.request_id.is_valid() {
            return Err(Error::InvalidState);
        }
        let type_id = self.protocol.type_id_of::<M>()?;
        self.responses.push(ResponseCommand {
            type_id,
            message: Box::new(message),
            request_id: self.request_id,
        });
        Ok(())
    }

    /// Ask the connection to stop forcefully once the current hook returns.
    pub fn close_connection(&mut self) {
        *self.kill_requested = true;
    }

    /// The connection's any-typed user data slot.
    pub fn user_data(&mut self) -> &mut Option<UserData> {
        &mut *self.user_data
    }
}

/// Per-connection user data slot, reachable from hooks through the service.
pub type UserData = Box<dyn Any + Send>;

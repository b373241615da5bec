// ABOUTME: Typed error conditions for every reader, writer, connection and service failure
// ABOUTME: Provides a single crate-wide error enum with automatic conversion from I/O errors

use std::io;
use thiserror::Error;

/// Error conditions raised by the messaging service.
///
/// Grouped by the component that raises them: the message reader, the message
/// writer, the connection state machine and the pool-manager service. Any
/// reader or writer error on a connection terminates that connection; the
/// per-message errors are then delivered through the message completion
/// hooks, exactly once per message.
#[derive(Debug, Error)]
pub enum Error {
    // -- reader --
    /// The 4-byte packet header failed validation (unknown type or oversized payload)
    #[error("invalid packet header")]
    InvalidPacketHeader,

    /// A fragment control code was unknown or arrived for a slot in the wrong state
    #[error("invalid message switch code: {0:#x}")]
    InvalidMessageSwitch(u8),

    /// The peer interleaved more messages than `max_message_count_multiplex` allows
    #[error("too many multiplexed messages")]
    TooManyMultiplexedMessages,

    /// Message payload could not be deserialized
    #[error("deserializer failure: {0}")]
    Deserializer(String),

    // -- writer --
    /// The message was canceled before it was fully sent
    #[error("message canceled")]
    MessageCanceled,

    /// A delayed close is already queued on this connection
    #[error("delayed close already pending")]
    DelayedClosePending,

    /// The writer reached `max_message_count_per_connection`
    #[error("writer message queue full")]
    WriterFull,

    // -- connection --
    /// The connection was forcefully killed
    #[error("connection forcefully killed")]
    ConnectionKilled,

    /// Server-side inactivity timeout expired without traffic
    #[error("timeout due to inactivity")]
    InactivityTimeout,

    /// The peer sent more keep-alive packets per inactivity window than allowed
    #[error("received too many keep-alive packets")]
    TooManyKeepAlivePackets,

    /// The connection is shutting down and cannot accept the operation
    #[error("connection stopping")]
    ConnectionStopping,

    /// The message could not be delivered before its connection went away
    #[error("message failed to send")]
    MessageFailSend,

    /// The connection completed a requested delayed close
    #[error("connection delayed closed")]
    ConnectionDelayedClosed,

    /// The operation is not valid in the connection's current state
    #[error("operation invalid in the current connection state")]
    InvalidState,

    /// Internal invariant violation
    #[error("library logic error: {0}")]
    Logic(&'static str),

    // -- service --
    /// No connection or pool exists for the given recipient
    #[error("connection does not exist")]
    ConnectionInexistent,

    /// The message id is unknown to the pool (already completed or never existed)
    #[error("message does not exist")]
    MessageInexistent,

    /// The pool's pending queue reached `pool_max_pending_connection_count`
    #[error("pool pending queue full")]
    PoolFull,

    /// The service has been stopped
    #[error("service stopped")]
    ServiceStopped,

    /// The message type was not registered with the protocol
    #[error("message type not registered")]
    UnknownMessageType,

    // -- transport --
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A secure start was requested but no TLS context is configured
    #[error("TLS not configured for this connection")]
    TlsNotConfigured,
}

/// A specialized `Result` type for messaging operations.
pub type Result<T> = std::result::Result<T, Error>;

// ABOUTME: Crate root for msgmux, a multiplexed message-passing layer over TCP/TLS
// ABOUTME: Re-exports the service, protocol registry, configuration and error types

//! Bidirectional, multiplexed, connection-pooled message passing over
//! streaming transports.
//!
//! `msgmux` exchanges typed messages between processes with
//! at-most-once delivery, optional request/response correlation, optional
//! idempotent retry across reconnects and fair multiplexing of many logical
//! messages over a bounded number of physical connections.
//!
//! * **Protocol registry**: message types register once at startup with a
//!   completion hook; everything else is tagged dispatch, no trait objects in
//!   user code beyond the hook closures.
//! * **Service**: maps symbolic recipient names (`"host:port"`) to pools of
//!   connections, resolves names, creates connections on demand and routes
//!   messages through them.
//! * **Connections**: length-framed packets over plain TCP or TLS, with
//!   keep-alive, inactivity policing and a staged, message-draining stop.
//!
//! ## Echo in one process
//!
//! ```rust,no_run
//! use bytes::BytesMut;
//! use msgmux::protocol::{decode_string, encode_string, Serializable};
//! use msgmux::{Config, MessageFlags, Protocol, Service};
//!
//! struct Echo {
//!     text: String,
//! }
//!
//! impl Serializable for Echo {
//!     fn encode(&self, buf: &mut BytesMut) -> msgmux::Result<()> {
//!         encode_string(buf, &self.text);
//!         Ok(())
//!     }
//!
//!     fn decode(buf: &mut std::io::Cursor<&[u8]>) -> msgmux::Result<Self> {
//!         Ok(Self {
//!             text: decode_string(buf)?,
//!         })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> msgmux::Result<()> {
//!     let protocol = Protocol::builder()
//!         .register::<Echo, _>(|ctx, _sent, received, _error| {
//!             // On the peer side, bounce the message straight back.
//!             if ctx.is_on_peer() {
//!                 if let Some(echo) = received {
//!                     let _ = ctx.send_response(Echo { text: echo.text });
//!                 }
//!             }
//!         })
//!         .build();
//!
//!     let service = Service::new(
//!         Config::default().with_listener("127.0.0.1", "6666"),
//!         protocol,
//!     );
//!     service.start_listener().await?;
//!
//!     service.send_message(
//!         "127.0.0.1:6666",
//!         Echo {
//!             text: "hello".into(),
//!         },
//!         MessageFlags::WAIT_RESPONSE,
//!     )?;
//!     Ok(())
//! }
//! ```
//!
//! Request/response with a typed handler goes through
//! [`Service::send_request`]; the handler fires exactly once with either the
//! response or the terminal error.

pub mod config;
pub mod context;
pub mod error;
pub mod message;
pub mod packet;
pub mod protocol;
pub mod service;

mod connection;
mod inner_list;
mod reader;
mod writer;

#[cfg(test)]
mod tests;

pub use config::{Config, ConnectionStartState, SecureContext};
pub use connection::{RawRecvDoneFn, RawSendDoneFn};
pub use context::ConnectionContext;
pub use error::{Error, Result};
pub use message::{MessageFlags, MessageId, RequestId};
pub use protocol::{Protocol, ProtocolBuilder, Serializable, TypeId};
pub use service::{ConnectionId, RecipientId, Service};

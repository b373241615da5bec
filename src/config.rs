// ABOUTME: Grouped service configuration with builder-style setters and sensible defaults
// ABOUTME: Hook slots cover resolution, buffers, compression, TLS and connection callbacks

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::context::ConnectionContext;
use crate::error::{Error, Result};
use crate::packet::{MAX_PACKET_DATA_SIZE, PacketHeader};

/// How a freshly started connection behaves before the user upgrades it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStartState {
    /// Bytes pass through untouched; only raw send/recv operations are legal
    Raw,
    /// Framed traffic runs but the connection takes no pooled messages
    Passive,
    /// Full-speed: pooled traffic, keep-alive, the lot
    #[default]
    Active,
}

/// Asynchronous name resolution hook: turns `"host:port"` into an address list.
pub type ResolveFn = Arc<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<Vec<SocketAddr>>> + Send>> + Send + Sync,
>;

/// Compress a filled packet payload in place; `Ok(Some(n))` shrinks it to `n`
/// bytes and marks the packet compressed, `Ok(None)` sends it as-is.
pub type CompressFn = Arc<dyn Fn(&mut [u8]) -> Result<Option<usize>> + Send + Sync>;

/// Decompress a packet payload into the scratch buffer, returning the
/// decompressed length.
pub type DecompressFn = Arc<dyn Fn(&mut [u8], &[u8]) -> Result<usize> + Send + Sync>;

/// Buffer allocation hooks; the matching free hook observes the buffer on
/// release.
pub type AllocateBufferFn = Arc<dyn Fn(usize) -> Vec<u8> + Send + Sync>;
pub type FreeBufferFn = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

pub type ConnectionStartFn = Arc<dyn Fn(&mut ConnectionContext<'_>) + Send + Sync>;
pub type ConnectionStopFn = Arc<dyn Fn(&mut ConnectionContext<'_>, Option<&Error>) + Send + Sync>;
pub type ConnectionEventFn =
    Arc<dyn Fn(&mut ConnectionContext<'_>, Box<dyn Any + Send>) + Send + Sync>;

/// Writer limits.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// How many messages may interleave fragments on the wire at once
    pub max_message_count_multiplex: usize,
    /// Consecutive packets one message may monopolize before rotation
    pub max_message_continuous_packet_count: usize,
    /// Hard cap on live messages held by one connection
    pub max_message_count_per_connection: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_message_count_multiplex: 8,
            max_message_continuous_packet_count: 4,
            max_message_count_per_connection: 1024,
        }
    }
}

/// Reader limits and hooks.
#[derive(Clone, Default)]
pub struct ReaderConfig {
    /// How many partially-assembled messages the peer may interleave
    pub max_message_count_multiplex: usize,
    pub decompress_fnc: Option<DecompressFn>,
}

impl fmt::Debug for ReaderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderConfig")
            .field("max_message_count_multiplex", &self.max_message_count_multiplex)
            .field("has_decompress_fnc", &self.decompress_fnc.is_some())
            .finish()
    }
}

/// Connection timers and start behavior.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server side: stop if no traffic arrives within this window
    pub inactivity_timeout: Duration,
    /// Client side: emit a keep-alive packet after this much idle time
    pub keepalive_timeout: Duration,
    /// Keep-alives tolerated per inactivity window before the peer is cut off
    pub inactivity_keepalive_count: u32,
    /// Grace period before retrying a recipient whose connection failed
    pub reconnect_timeout: Duration,
    pub start_state: ConnectionStartState,
    pub start_secure: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(120),
            keepalive_timeout: Duration::from_secs(30),
            inactivity_keepalive_count: 8,
            reconnect_timeout: Duration::from_secs(10),
            start_state: ConnectionStartState::Active,
            start_secure: false,
        }
    }
}

/// Scratch buffer sizing and allocation.
#[derive(Clone)]
pub struct BufferConfig {
    pub recv_buffer_capacity_kb: usize,
    pub send_buffer_capacity_kb: usize,
    pub allocate_recv_buffer_fnc: Option<AllocateBufferFn>,
    pub allocate_send_buffer_fnc: Option<AllocateBufferFn>,
    pub free_recv_buffer_fnc: Option<FreeBufferFn>,
    pub free_send_buffer_fnc: Option<FreeBufferFn>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            recv_buffer_capacity_kb: 64,
            send_buffer_capacity_kb: 64,
            allocate_recv_buffer_fnc: None,
            allocate_send_buffer_fnc: None,
            free_recv_buffer_fnc: None,
            free_send_buffer_fnc: None,
        }
    }
}

impl fmt::Debug for BufferConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferConfig")
            .field("recv_buffer_capacity_kb", &self.recv_buffer_capacity_kb)
            .field("send_buffer_capacity_kb", &self.send_buffer_capacity_kb)
            .finish()
    }
}

/// Per-pool limits.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Physical connections a pool may run concurrently
    pub max_active_connection_count: usize,
    /// Messages a pool may hold pending before `send` fails with `PoolFull`
    pub max_pending_connection_count: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_active_connection_count: 1,
            max_pending_connection_count: 1024,
        }
    }
}

/// TLS material for secure connections; wraps the rustls connector/acceptor.
#[derive(Clone)]
pub struct SecureContext {
    pub connector: Option<TlsConnector>,
    pub acceptor: Option<TlsAcceptor>,
    pub server_name: Option<ServerName<'static>>,
}

impl SecureContext {
    pub fn client(connector: TlsConnector, server_name: ServerName<'static>) -> Self {
        Self {
            connector: Some(connector),
            acceptor: None,
            server_name: Some(server_name),
        }
    }

    pub fn server(acceptor: TlsAcceptor) -> Self {
        Self {
            connector: None,
            acceptor: Some(acceptor),
            server_name: None,
        }
    }
}

impl fmt::Debug for SecureContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureContext")
            .field("has_connector", &self.connector.is_some())
            .field("has_acceptor", &self.acceptor.is_some())
            .finish()
    }
}

/// Complete service configuration.
///
/// Everything has a workable default; a client-only service needs nothing,
/// a server additionally sets the listener address/service strings.
#[derive(Clone)]
pub struct Config {
    pub writer: WriterConfig,
    pub reader: ReaderConfig,
    pub connection: ConnectionConfig,
    pub buffers: BufferConfig,
    pub pool: PoolConfig,

    /// Listen address, e.g. `"127.0.0.1"`; empty means client-only
    pub listener_address_str: String,
    /// Listen service/port, e.g. `"6666"` or `"0"` for ephemeral
    pub listener_service_str: String,

    pub name_resolve_fnc: ResolveFn,
    pub connection_stop_fnc: Option<ConnectionStopFn>,
    pub connection_start_incoming_fnc: Option<ConnectionStartFn>,
    pub connection_start_outgoing_fnc: Option<ConnectionStartFn>,
    pub connection_on_event_fnc: Option<ConnectionEventFn>,
    pub inplace_compress_fnc: Option<CompressFn>,
    pub secure_context: Option<SecureContext>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            writer: WriterConfig::default(),
            reader: ReaderConfig {
                max_message_count_multiplex: 8,
                decompress_fnc: None,
            },
            connection: ConnectionConfig::default(),
            buffers: BufferConfig::default(),
            pool: PoolConfig::default(),
            listener_address_str: String::new(),
            listener_service_str: String::new(),
            name_resolve_fnc: Arc::new(|name| {
                Box::pin(async move {
                    let addrs: Result<Vec<SocketAddr>> = tokio::net::lookup_host(name.as_str())
                        .await
                        .map(|addrs| addrs.collect())
                        .map_err(Error::Io);
                    addrs
                })
            }),
            connection_stop_fnc: None,
            connection_start_incoming_fnc: None,
            connection_start_outgoing_fnc: None,
            connection_on_event_fnc: None,
            inplace_compress_fnc: None,
            secure_context: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("writer", &self.writer)
            .field("reader", &self.reader)
            .field("connection", &self.connection)
            .field("buffers", &self.buffers)
            .field("pool", &self.pool)
            .field("listener_address_str", &self.listener_address_str)
            .field("listener_service_str", &self.listener_service_str)
            .finish()
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_server(&self) -> bool {
        !self.listener_service_str.is_empty()
    }

    /// Listen on the given address and service strings.
    pub fn with_listener(mut self, address: impl Into<String>, service: impl Into<String>) -> Self {
        self.listener_address_str = address.into();
        self.listener_service_str = service.into();
        self
    }

    pub fn with_pool_max_active_connection_count(mut self, count: usize) -> Self {
        self.pool.max_active_connection_count = count.max(1);
        self
    }

    pub fn with_pool_max_pending_connection_count(mut self, count: usize) -> Self {
        self.pool.max_pending_connection_count = count;
        self
    }

    pub fn with_max_message_count_multiplex(mut self, count: usize) -> Self {
        self.writer.max_message_count_multiplex = count.max(1);
        self.reader.max_message_count_multiplex = count.max(1);
        self
    }

    pub fn with_max_message_continuous_packet_count(mut self, count: usize) -> Self {
        self.writer.max_message_continuous_packet_count = count.max(1);
        self
    }

    pub fn with_max_message_count_per_connection(mut self, count: usize) -> Self {
        self.writer.max_message_count_per_connection = count.max(1);
        self
    }

    pub fn with_connection_inactivity_timeout_seconds(mut self, seconds: u64) -> Self {
        self.connection.inactivity_timeout = Duration::from_secs(seconds);
        self
    }

    pub fn with_connection_keepalive_timeout_seconds(mut self, seconds: u64) -> Self {
        self.connection.keepalive_timeout = Duration::from_secs(seconds);
        self
    }

    pub fn with_connection_inactivity_keepalive_count(mut self, count: u32) -> Self {
        self.connection.inactivity_keepalive_count = count;
        self
    }

    pub fn with_connection_reconnect_timeout_seconds(mut self, seconds: u64) -> Self {
        self.connection.reconnect_timeout = Duration::from_secs(seconds);
        self
    }

    pub fn with_connection_timeouts(
        mut self,
        inactivity: Duration,
        keepalive: Duration,
        reconnect: Duration,
    ) -> Self {
        self.connection.inactivity_timeout = inactivity;
        self.connection.keepalive_timeout = keepalive;
        self.connection.reconnect_timeout = reconnect;
        self
    }

    pub fn with_connection_start_state(mut self, state: ConnectionStartState) -> Self {
        self.connection.start_state = state;
        self
    }

    pub fn with_connection_start_secure(mut self, secure: bool) -> Self {
        self.connection.start_secure = secure;
        self
    }

    pub fn with_secure_context(mut self, ctx: SecureContext) -> Self {
        self.secure_context = Some(ctx);
        self
    }

    pub fn with_recv_buffer_capacity_kb(mut self, kb: usize) -> Self {
        self.buffers.recv_buffer_capacity_kb = kb.max(1);
        self
    }

    pub fn with_send_buffer_capacity_kb(mut self, kb: usize) -> Self {
        self.buffers.send_buffer_capacity_kb = kb.max(1);
        self
    }

    pub fn with_name_resolve_fnc(mut self, fnc: ResolveFn) -> Self {
        self.name_resolve_fnc = fnc;
        self
    }

    pub fn with_connection_stop_fnc(mut self, fnc: ConnectionStopFn) -> Self {
        self.connection_stop_fnc = Some(fnc);
        self
    }

    pub fn with_connection_start_incoming_fnc(mut self, fnc: ConnectionStartFn) -> Self {
        self.connection_start_incoming_fnc = Some(fnc);
        self
    }

    pub fn with_connection_start_outgoing_fnc(mut self, fnc: ConnectionStartFn) -> Self {
        self.connection_start_outgoing_fnc = Some(fnc);
        self
    }

    pub fn with_connection_on_event_fnc(mut self, fnc: ConnectionEventFn) -> Self {
        self.connection_on_event_fnc = Some(fnc);
        self
    }

    pub fn with_inplace_compress_fnc(mut self, fnc: CompressFn) -> Self {
        self.inplace_compress_fnc = Some(fnc);
        self
    }

    pub fn with_decompress_fnc(mut self, fnc: DecompressFn) -> Self {
        self.reader.decompress_fnc = Some(fnc);
        self
    }

    /// Receive buffer size in bytes, never smaller than one maximum packet so
    /// a peer's largest frame always fits.
    pub(crate) fn recv_buffer_capacity(&self) -> usize {
        (self.buffers.recv_buffer_capacity_kb * 1024)
            .max(PacketHeader::SIZE + MAX_PACKET_DATA_SIZE)
    }

    pub(crate) fn send_buffer_capacity(&self) -> usize {
        (self.buffers.send_buffer_capacity_kb * 1024).max(4 * 1024)
    }

    pub(crate) fn allocate_recv_buffer(&self) -> Vec<u8> {
        let capacity = self.recv_buffer_capacity();
        match &self.buffers.allocate_recv_buffer_fnc {
            Some(alloc) => alloc(capacity),
            None => vec![0u8; capacity],
        }
    }

    pub(crate) fn allocate_send_buffer(&self) -> Vec<u8> {
        let capacity = self.send_buffer_capacity();
        match &self.buffers.allocate_send_buffer_fnc {
            Some(alloc) => alloc(capacity),
            None => vec![0u8; capacity],
        }
    }

    pub(crate) fn free_recv_buffer(&self, buf: Vec<u8>) {
        if let Some(free) = &self.buffers.free_recv_buffer_fnc {
            free(buf);
        }
    }

    pub(crate) fn free_send_buffer(&self, buf: Vec<u8>) {
        if let Some(free) = &self.buffers.free_send_buffer_fnc {
            free(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert!(!config.is_server());
        assert_eq!(config.writer.max_message_count_multiplex, 8);
        assert_eq!(config.connection.keepalive_timeout, Duration::from_secs(30));
        assert_eq!(config.pool.max_active_connection_count, 1);
    }

    #[test]
    fn builder_setters() {
        let config = Config::default()
            .with_listener("127.0.0.1", "0")
            .with_connection_keepalive_timeout_seconds(10)
            .with_connection_inactivity_timeout_seconds(20)
            .with_connection_inactivity_keepalive_count(4)
            .with_max_message_count_multiplex(3);

        assert!(config.is_server());
        assert_eq!(config.connection.keepalive_timeout, Duration::from_secs(10));
        assert_eq!(config.connection.inactivity_timeout, Duration::from_secs(20));
        assert_eq!(config.connection.inactivity_keepalive_count, 4);
        assert_eq!(config.writer.max_message_count_multiplex, 3);
        assert_eq!(config.reader.max_message_count_multiplex, 3);
    }

    #[test]
    fn recv_buffer_always_fits_a_packet() {
        let config = Config::default().with_recv_buffer_capacity_kb(1);
        assert!(config.recv_buffer_capacity() >= PacketHeader::SIZE + MAX_PACKET_DATA_SIZE);
    }
}

// ABOUTME: The pool-manager service: maps recipient names to connection pools and routes messages
// ABOUTME: Owns connection mailboxes, the listener accept loop and all pool-structural state

mod pool;

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, mpsc};

use crate::config::Config;
use crate::connection::{Connection, ConnectionEvent, RawRecvDoneFn, RawSendDoneFn};
use crate::context::ConnectionContext;
use crate::error::{Error, Result};
use crate::message::{MessageBundle, MessageFlags, MessageId, RequestId, downcast_message};
use crate::protocol::{Protocol, Serializable};

use pool::{MsgLocation, Pool, ResolveState};

/// Opaque identity of one physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub(crate) u64);

impl ConnectionId {
    pub const INVALID: Self = Self(u64::MAX);

    pub fn is_valid(&self) -> bool {
        self.0 != u64::MAX
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a recipient's connection pool, returned from the send calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecipientId(pub(crate) u32);

impl fmt::Display for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct ConnHandle {
    sender: mpsc::UnboundedSender<ConnectionEvent>,
}

enum CancelAction {
    Complete(MessageBundle),
    Forward(ConnectionId),
}

struct ServiceCore {
    config: Arc<Config>,
    protocol: Arc<Protocol>,
    pools: RwLock<Vec<Arc<Mutex<Pool>>>>,
    names: Mutex<HashMap<String, u32>>,
    conns: Mutex<HashMap<u64, ConnHandle>>,
    next_connection_id: AtomicU64,
    conn_count: AtomicUsize,
    conns_drained: Notify,
    listener: Mutex<Option<tokio::task::JoinHandle<()>>>,
    stopped: AtomicBool,
}

/// The messaging service: resolves recipient names to pools, creates
/// connections on demand and funnels message submission, cancellation and
/// stop events.
///
/// Cheap to clone; all clones share the same state. Must be created and used
/// inside a tokio runtime.
#[derive(Clone)]
pub struct Service {
    core: Arc<ServiceCore>,
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("connections", &self.core.conn_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Service {
    pub fn new(config: Config, protocol: Arc<Protocol>) -> Self {
        Self {
            core: Arc::new(ServiceCore {
                config: Arc::new(config),
                protocol,
                pools: RwLock::new(Vec::new()),
                names: Mutex::new(HashMap::new()),
                conns: Mutex::new(HashMap::new()),
                next_connection_id: AtomicU64::new(0),
                conn_count: AtomicUsize::new(0),
                conns_drained: Notify::new(),
                listener: Mutex::new(None),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.core.config
    }

    pub fn protocol(&self) -> &Arc<Protocol> {
        &self.core.protocol
    }

    /// Bind the configured listener and start accepting connections.
    /// Returns the bound local address (useful with an ephemeral port).
    pub async fn start_listener(&self) -> Result<SocketAddr> {
        if !self.core.config.is_server() {
            return Err(Error::InvalidState);
        }
        let address = format!(
            "{}:{}",
            self.core.config.listener_address_str, self.core.config.listener_service_str
        );
        let listener = TcpListener::bind(address.as_str()).await?;
        let local_addr = listener.local_addr()?;
        tracing::debug!(%local_addr, "listening");

        let service = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "incoming connection");
                        service.accept_incoming(stream, peer);
                    }
                    Err(error) => {
                        tracing::warn!(%error, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        *self.core.listener.lock().unwrap() = Some(handle);
        Ok(local_addr)
    }

    /// Submit a message to a recipient. Completion is reported through the
    /// type's registered hook; errors returned here are only the immediate
    /// ones (unknown type, pool full, service stopped).
    pub fn send_message<M: Serializable>(
        &self,
        recipient: &str,
        message: M,
        flags: MessageFlags,
    ) -> Result<(RecipientId, MessageId)> {
        let type_id = self.core.protocol.type_id_of::<M>()?;
        let bundle = MessageBundle::new(
            type_id,
            flags & MessageFlags::WIRE & !MessageFlags::RESPONSE,
            Box::new(message),
        );
        self.submit(recipient, bundle)
    }

    /// Submit a request and register a typed handler for its response. The
    /// handler is invoked exactly once, with the response or the terminal
    /// error.
    pub fn send_request<M, R, F>(
        &self,
        recipient: &str,
        message: M,
        on_response: F,
        flags: MessageFlags,
    ) -> Result<(RecipientId, MessageId)>
    where
        M: Serializable,
        R: Serializable,
        F: FnOnce(&mut ConnectionContext<'_>, Option<Box<R>>, Option<&Error>) + Send + 'static,
    {
        let type_id = self.core.protocol.type_id_of::<M>()?;
        let mut bundle = MessageBundle::new(
            type_id,
            (flags & MessageFlags::WIRE & !MessageFlags::RESPONSE) | MessageFlags::WAIT_RESPONSE,
            Box::new(message),
        );
        bundle.response_fnc = Some(Box::new(move |ctx, response, error| {
            let response = response.and_then(downcast_message::<R>);
            on_response(ctx, response, error);
        }));
        self.submit(recipient, bundle)
    }

    /// Cancel a message previously submitted to `recipient`.
    pub fn cancel_message(&self, recipient: RecipientId, message_id: MessageId) -> Result<()> {
        let pool_arc = self.pool(recipient.0).ok_or(Error::ConnectionInexistent)?;
        let action = {
            let mut pool = pool_arc.lock().unwrap();
            match pool.live.get(&message_id) {
                None => return Err(Error::MessageInexistent),
                Some(MsgLocation::Pending) => {
                    let bundle = pool
                        .remove_pending(message_id)
                        .ok_or(Error::MessageInexistent)?;
                    CancelAction::Complete(bundle)
                }
                Some(MsgLocation::Conn(conn)) => CancelAction::Forward(*conn),
            }
        };
        match action {
            CancelAction::Complete(bundle) => {
                self.complete_detached(
                    recipient,
                    vec![(bundle, message_id)],
                    Error::MessageCanceled,
                );
                Ok(())
            }
            CancelAction::Forward(conn) => {
                self.send_event(conn, ConnectionEvent::CancelPoolMessage(message_id))
            }
        }
    }

    /// Gracefully close every connection of a recipient after their queued
    /// traffic drains.
    pub fn delayed_close(&self, recipient: RecipientId) -> Result<()> {
        self.broadcast(recipient, || ConnectionEvent::DelayedClose)
    }

    /// Forcefully stop every connection of a recipient.
    pub fn force_close(&self, recipient: RecipientId) -> Result<()> {
        self.broadcast(recipient, || ConnectionEvent::Kill)
    }

    /// Ask every connection of a recipient to upgrade to the active state.
    pub fn connection_notify_enter_active_state(&self, recipient: RecipientId) -> Result<()> {
        self.broadcast(recipient, || ConnectionEvent::EnterActive)
    }

    /// Upgrade a single connection to the active state, subject to the
    /// pool's active-connection quota.
    pub fn activate_connection(&self, connection: ConnectionId) -> Result<()> {
        self.send_event(connection, ConnectionEvent::EnterActive)
    }

    /// Ask every connection of a recipient to downgrade to the passive state.
    pub fn connection_notify_enter_passive_state(&self, recipient: RecipientId) -> Result<()> {
        self.broadcast(recipient, || ConnectionEvent::EnterPassive)
    }

    /// Deliver a user event to a connection's `connection_on_event_fnc`.
    pub fn connection_post(
        &self,
        connection: ConnectionId,
        payload: Box<dyn std::any::Any + Send>,
    ) -> Result<()> {
        self.send_event(connection, ConnectionEvent::User(payload))
    }

    /// Begin the TLS upgrade on an already-open raw connection.
    pub fn connection_start_secure(&self, connection: ConnectionId) -> Result<()> {
        self.send_event(connection, ConnectionEvent::StartSecure)
    }

    /// Write raw bytes on a connection in the raw start state.
    pub fn connection_send_raw(
        &self,
        connection: ConnectionId,
        data: bytes::Bytes,
        done: RawSendDoneFn,
    ) -> Result<()> {
        self.send_event(connection, ConnectionEvent::SendRaw { data, done })
    }

    /// Read raw bytes from a connection in the raw start state.
    pub fn connection_recv_raw(&self, connection: ConnectionId, done: RawRecvDoneFn) -> Result<()> {
        self.send_event(connection, ConnectionEvent::RecvRaw { done })
    }

    /// Forcefully stop one connection.
    pub fn kill_connection(&self, connection: ConnectionId) -> Result<()> {
        self.send_event(connection, ConnectionEvent::Kill)
    }

    /// Stop the service: kill the listener and every connection, then wait
    /// for the connection tasks to finish their staged stops.
    pub async fn stop(&self) {
        self.core.stopped.store(true, Ordering::SeqCst);
        if let Some(listener) = self.core.listener.lock().unwrap().take() {
            listener.abort();
        }
        {
            let pools = self.core.pools.read().unwrap();
            for pool_arc in pools.iter() {
                pool_arc.lock().unwrap().stopping = true;
            }
        }
        let senders: Vec<_> = self
            .core
            .conns
            .lock()
            .unwrap()
            .values()
            .map(|handle| handle.sender.clone())
            .collect();
        for sender in senders {
            let _ = sender.send(ConnectionEvent::Kill);
        }
        loop {
            let mut drained = std::pin::pin!(self.core.conns_drained.notified());
            drained.as_mut().enable();
            if self.core.conn_count.load(Ordering::Acquire) == 0 {
                break;
            }
            drained.await;
        }
    }

    // --- connection-facing internals -----------------------------------

    pub(crate) fn poll_pool(
        &self,
        pool_id: RecipientId,
        conn: ConnectionId,
        max: usize,
    ) -> (Vec<(MessageBundle, MessageId)>, bool) {
        let Some(pool_arc) = self.pool(pool_id.0) else {
            return (Vec::new(), false);
        };
        let mut pool = pool_arc.lock().unwrap();
        let is_primary = pool.primary == Some(conn);
        pool.take_eligible(conn, is_primary, max)
    }

    pub(crate) fn return_to_pool(
        &self,
        pool_id: RecipientId,
        bundle: MessageBundle,
        message_id: MessageId,
    ) {
        if let Some(pool_arc) = self.pool(pool_id.0) {
            let mut pool = pool_arc.lock().unwrap();
            pool.live.insert(message_id, MsgLocation::Pending);
            pool.pending.push_front((bundle, message_id));
        }
    }

    pub(crate) fn reclaim_messages(
        &self,
        pool_id: RecipientId,
        messages: Vec<(MessageBundle, MessageId)>,
    ) {
        if let Some(pool_arc) = self.pool(pool_id.0) {
            pool_arc.lock().unwrap().reclaim(messages);
        }
    }

    pub(crate) fn pool_message_done(&self, pool_id: RecipientId, message_id: MessageId) {
        if !message_id.is_valid() {
            return;
        }
        if let Some(pool_arc) = self.pool(pool_id.0) {
            pool_arc.lock().unwrap().live.remove(&message_id);
        }
    }

    pub(crate) fn connection_notify_enter_active(
        &self,
        pool_id: RecipientId,
        conn: ConnectionId,
    ) -> bool {
        let Some(pool_arc) = self.pool(pool_id.0) else {
            return false;
        };
        let mut pool = pool_arc.lock().unwrap();
        if pool.active.len() < self.core.config.pool.max_active_connection_count {
            pool.active.insert(conn);
            true
        } else {
            false
        }
    }

    pub(crate) fn connection_notify_enter_passive(&self, pool_id: RecipientId, conn: ConnectionId) {
        if let Some(pool_arc) = self.pool(pool_id.0) {
            pool_arc.lock().unwrap().active.remove(&conn);
        }
    }

    /// Staged-stop arbitration: how long the connection should linger before
    /// its final stop.
    pub(crate) fn connection_stopping(
        &self,
        pool_id: RecipientId,
        conn: ConnectionId,
        error: Option<&Error>,
    ) -> Duration {
        tracing::debug!(pool = %pool_id, connection = %conn, ?error, "connection stopping");
        Duration::ZERO
    }

    /// Final bookkeeping for a dead connection. Returns pool-level messages
    /// that must now fail (one-shots after a connect failure).
    pub(crate) fn connection_stopped(
        &self,
        pool_id: RecipientId,
        conn: ConnectionId,
        connected: bool,
        _error: Option<&Error>,
    ) -> Vec<(MessageBundle, MessageId)> {
        self.core.conns.lock().unwrap().remove(&conn.0);

        let mut failed = Vec::new();
        let mut respawn = false;
        let mut respawn_delay = None;
        if let Some(pool_arc) = self.pool(pool_id.0) {
            let mut pool = pool_arc.lock().unwrap();
            pool.conns.retain(|c| *c != conn);
            pool.active.remove(&conn);
            if pool.primary == Some(conn) {
                pool.primary = pool.conns.first().copied();
            }
            // Anything still marked as delegated to this connection was
            // already completed or reclaimed by the writer; drop stale marks.
            pool.live
                .retain(|_, location| !matches!(location, MsgLocation::Conn(c) if *c == conn));

            if !connected {
                let mut rest = std::collections::VecDeque::new();
                while let Some((bundle, message_id)) = pool.pending.pop_front() {
                    if bundle.flags.is_one_shot() {
                        pool.live.remove(&message_id);
                        failed.push((bundle, message_id));
                    } else {
                        rest.push_back((bundle, message_id));
                    }
                }
                pool.pending = rest;
            }

            if !pool.stopping
                && !self.core.stopped.load(Ordering::SeqCst)
                && !pool.pending.is_empty()
                && pool.conns.is_empty()
                && !pool.reconnect_scheduled
            {
                respawn = true;
                pool.reconnect_scheduled = true;
                if !connected {
                    respawn_delay = Some(self.core.config.connection.reconnect_timeout);
                }
            }
        }

        if respawn {
            let service = self.clone();
            let pool_index = pool_id.0;
            tokio::spawn(async move {
                if let Some(delay) = respawn_delay {
                    tokio::time::sleep(delay).await;
                }
                if let Some(pool_arc) = service.pool(pool_index) {
                    pool_arc.lock().unwrap().reconnect_scheduled = false;
                }
                service.spawn_outgoing(pool_index);
            });
        }

        if self.core.conn_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.core.conns_drained.notify_waiters();
        }
        failed
    }

    // --- internals ------------------------------------------------------

    fn pool(&self, index: u32) -> Option<Arc<Mutex<Pool>>> {
        self.core.pools.read().unwrap().get(index as usize).cloned()
    }

    fn find_or_create_pool(&self, name: &str) -> (u32, Arc<Mutex<Pool>>) {
        let mut names = self.core.names.lock().unwrap();
        if let Some(&index) = names.get(name) {
            let pool_arc = self.pool(index).expect("named pool must exist");
            return (index, pool_arc);
        }
        let mut pools = self.core.pools.write().unwrap();
        let index = pools.len() as u32;
        let pool_arc = Arc::new(Mutex::new(Pool::new(name)));
        pools.push(pool_arc.clone());
        names.insert(name.to_string(), index);
        (index, pool_arc)
    }

    fn submit(&self, recipient: &str, bundle: MessageBundle) -> Result<(RecipientId, MessageId)> {
        if self.core.stopped.load(Ordering::SeqCst) {
            return Err(Error::ServiceStopped);
        }
        let (pool_index, pool_arc) = self.find_or_create_pool(recipient);

        let message_id;
        let mut need_resolve = false;
        let mut need_spawn = false;
        let mut notify: Vec<ConnectionId> = Vec::new();
        {
            let mut pool = pool_arc.lock().unwrap();
            if pool.stopping {
                return Err(Error::ServiceStopped);
            }
            if pool.pending.len() >= self.core.config.pool.max_pending_connection_count {
                return Err(Error::PoolFull);
            }
            message_id = pool.mint_message_id();
            pool.live.insert(message_id, MsgLocation::Pending);
            pool.pending.push_back((bundle, message_id));

            match &pool.resolve {
                ResolveState::NotStarted => {
                    pool.resolve = ResolveState::InProgress;
                    need_resolve = true;
                }
                ResolveState::InProgress => {}
                ResolveState::Done(_) => {
                    let below_cap =
                        pool.conns.len() < self.core.config.pool.max_active_connection_count;
                    if below_cap
                        && !pool.reconnect_scheduled
                        && (pool.conns.is_empty() || pool.pending.len() > pool.conns.len())
                    {
                        need_spawn = true;
                    }
                }
            }
            notify.extend(pool.conns.iter().copied());
        }

        if need_resolve {
            self.start_resolve(pool_index, recipient.to_string());
        }
        if need_spawn {
            self.spawn_outgoing(pool_index);
        }
        for conn in notify {
            let _ = self.send_event(conn, ConnectionEvent::NewPoolMessage);
        }
        Ok((RecipientId(pool_index), message_id))
    }

    fn start_resolve(&self, pool_index: u32, name: String) {
        let resolve = self.core.config.name_resolve_fnc.clone();
        let service = self.clone();
        tokio::spawn(async move {
            let result = resolve(name.clone()).await;
            service.on_resolved(pool_index, name, result);
        });
    }

    fn on_resolved(&self, pool_index: u32, name: String, result: Result<Vec<SocketAddr>>) {
        let Some(pool_arc) = self.pool(pool_index) else {
            return;
        };
        match result {
            Ok(addresses) if !addresses.is_empty() => {
                {
                    let mut pool = pool_arc.lock().unwrap();
                    pool.resolve = ResolveState::Done(addresses);
                }
                self.spawn_outgoing(pool_index);
            }
            other => {
                let error = match other {
                    Err(error) => error,
                    Ok(_) => Error::ConnectionInexistent,
                };
                tracing::warn!(%name, %error, "name resolution failed");
                let failed = {
                    let mut pool = pool_arc.lock().unwrap();
                    pool.resolve = ResolveState::NotStarted;
                    let drained: Vec<_> = pool.pending.drain(..).collect();
                    for (_, message_id) in &drained {
                        pool.live.remove(message_id);
                    }
                    drained
                };
                self.complete_detached(RecipientId(pool_index), failed, Error::MessageFailSend);
            }
        }
    }

    fn spawn_outgoing(&self, pool_index: u32) {
        if self.core.stopped.load(Ordering::SeqCst) {
            return;
        }
        let Some(pool_arc) = self.pool(pool_index) else {
            return;
        };
        let addresses = {
            let pool = pool_arc.lock().unwrap();
            if pool.stopping
                || pool.conns.len() >= self.core.config.pool.max_active_connection_count
            {
                return;
            }
            match &pool.resolve {
                ResolveState::Done(addresses) => addresses.clone(),
                _ => return,
            }
        };
        let (_, sender) = self.new_connection(pool_index, None);
        let _ = sender.send(ConnectionEvent::Resolve(addresses));
        let _ = sender.send(ConnectionEvent::NewPoolMessage);
    }

    fn new_connection(
        &self,
        pool_index: u32,
        incoming: Option<TcpStream>,
    ) -> (ConnectionId, mpsc::UnboundedSender<ConnectionEvent>) {
        let id = ConnectionId(self.core.next_connection_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::unbounded_channel();
        self.core.conns.lock().unwrap().insert(
            id.0,
            ConnHandle {
                sender: sender.clone(),
            },
        );
        if let Some(pool_arc) = self.pool(pool_index) {
            let mut pool = pool_arc.lock().unwrap();
            pool.conns.push(id);
            if pool.primary.is_none() {
                pool.primary = Some(id);
            }
        }
        self.core.conn_count.fetch_add(1, Ordering::AcqRel);

        let connection = Connection::new(
            self.clone(),
            self.core.config.clone(),
            self.core.protocol.clone(),
            id,
            RecipientId(pool_index),
            receiver,
        );
        tokio::spawn(connection.run(incoming));
        (id, sender)
    }

    fn accept_incoming(&self, stream: TcpStream, peer: SocketAddr) {
        if self.core.stopped.load(Ordering::SeqCst) {
            return;
        }
        let name = peer.to_string();
        let (pool_index, _) = self.find_or_create_pool(&name);
        self.new_connection(pool_index, Some(stream));
    }

    fn send_event(&self, conn: ConnectionId, event: ConnectionEvent) -> Result<()> {
        let conns = self.core.conns.lock().unwrap();
        let handle = conns.get(&conn.0).ok_or(Error::ConnectionInexistent)?;
        handle
            .sender
            .send(event)
            .map_err(|_| Error::ConnectionInexistent)
    }

    fn broadcast(&self, recipient: RecipientId, event: impl Fn() -> ConnectionEvent) -> Result<()> {
        let pool_arc = self.pool(recipient.0).ok_or(Error::ConnectionInexistent)?;
        let conns: Vec<ConnectionId> = {
            let pool = pool_arc.lock().unwrap();
            pool.conns.clone()
        };
        if conns.is_empty() {
            return Err(Error::ConnectionInexistent);
        }
        for conn in conns {
            let _ = self.send_event(conn, event());
        }
        Ok(())
    }

    /// Complete bundles that never reached a connection, running their hooks
    /// on the calling thread with a detached context.
    fn complete_detached(
        &self,
        recipient: RecipientId,
        bundles: Vec<(MessageBundle, MessageId)>,
        error: Error,
    ) {
        for (mut bundle, message_id) in bundles {
            let mut responses = Vec::new();
            let mut kill = false;
            let mut user_data = None;
            let mut ctx = ConnectionContext {
                service: self,
                protocol: self.core.protocol.as_ref(),
                connection_id: ConnectionId::INVALID,
                recipient_id: recipient,
                message_flags: bundle.flags,
                request_id: RequestId::INVALID,
                message_id,
                message_state: bundle.state,
                responses: &mut responses,
                kill_requested: &mut kill,
                user_data: &mut user_data,
            };
            if let Some(response_fnc) = bundle.response_fnc.take() {
                response_fnc(&mut ctx, None, Some(&error));
            }
            self.core.protocol.complete(
                bundle.type_id,
                &mut ctx,
                Some(bundle.message),
                None,
                Some(&error),
            );
        }
    }
}

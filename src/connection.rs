// ABOUTME: Connection actor: one tokio task owning a socket, a reader, a writer and a timer
// ABOUTME: Drives the framed send/recv paths, keep-alive/inactivity policy and the staged stop

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::{Config, ConnectionStartState};
use crate::context::{ConnectionContext, ResponseCommand, UserData};
use crate::error::{Error, Result};
use crate::message::{MessageBundle, MessageFlags, MessageHeader, MessageId, RequestId};
use crate::protocol::{Protocol, TypeId};
use crate::reader::{MessageReader, ReadEvent};
use crate::service::{ConnectionId, RecipientId, Service};
use crate::writer::{MessageWriter, WriterCompletion};

/// Completion callback for a raw send.
pub type RawSendDoneFn = Box<dyn FnOnce(Result<()>) + Send>;
/// Completion callback for a raw receive, invoked with the bytes read.
pub type RawRecvDoneFn = Box<dyn FnOnce(Result<Bytes>) + Send>;

/// Everything a connection can be told from the outside. Delivery is through
/// the connection's mailbox; handlers run serialized on its task.
pub(crate) enum ConnectionEvent {
    /// Outgoing connections: the pool resolved the recipient name
    Resolve(Vec<SocketAddr>),
    /// The pool queued one or more messages; poll for them
    NewPoolMessage,
    /// Cancel a message by its connection-level id
    CancelConnMessage(RequestId),
    /// Cancel a message by its pool-level id
    CancelPoolMessage(MessageId),
    EnterActive,
    EnterPassive,
    StartSecure,
    SendRaw { data: Bytes, done: RawSendDoneFn },
    RecvRaw { done: RawRecvDoneFn },
    DelayedClose,
    Kill,
    User(Box<dyn Any + Send>),
}

/// Plain or TLS transport, matched per operation so the framed hot path stays
/// monomorphic over this enum.
pub(crate) enum SocketStream {
    Plain(TcpStream),
    Secure(Box<tokio_rustls::TlsStream<TcpStream>>),
}

impl AsyncRead for SocketStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SocketStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            SocketStream::Secure(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SocketStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SocketStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            SocketStream::Secure(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SocketStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            SocketStream::Secure(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SocketStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            SocketStream::Secure(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, Default)]
    struct ConnFlags: u16 {
        const ACTIVE = 1;
        const SERVER = 1 << 1;
        const RAW = 1 << 2;
        const SECURE = 1 << 3;
        const POLL_POOL = 1 << 4;
        const STOPPING = 1 << 5;
        const DELAYED_STOPPING = 1 << 6;
        const HAS_ACTIVITY = 1 << 7;
        const CONNECTED = 1 << 8;
        const KEEPALIVE_PENDING = 1 << 9;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    KeepAlive,
    Inactivity,
}

enum Action {
    Continue,
    /// Rejoin the socket halves and run the TLS handshake
    Secure,
}

pub(crate) struct Connection {
    service: Service,
    config: Arc<Config>,
    protocol: Arc<Protocol>,
    id: ConnectionId,
    pool_id: RecipientId,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    reader: MessageReader,
    writer: MessageWriter,
    flags: ConnFlags,
    recv_keepalive_count: u32,
    timer_deadline: Option<Instant>,
    timer_kind: TimerKind,
    kill_requested: bool,
    /// An activation request arrived before the socket was up.
    deferred_enter_active: bool,
    user_data: Option<UserData>,
}

impl Connection {
    pub fn new(
        service: Service,
        config: Arc<Config>,
        protocol: Arc<Protocol>,
        id: ConnectionId,
        pool_id: RecipientId,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> Self {
        Self {
            service,
            config,
            protocol,
            id,
            pool_id,
            events,
            reader: MessageReader::new(),
            writer: MessageWriter::new(),
            flags: ConnFlags::empty(),
            recv_keepalive_count: 0,
            timer_deadline: None,
            timer_kind: TimerKind::KeepAlive,
            kill_requested: false,
            deferred_enter_active: false,
            user_data: None,
        }
    }

    /// Entry point of the connection task. `incoming` carries the accepted
    /// socket for server-side connections; outgoing connections wait for
    /// their pool's `Resolve` event instead.
    pub async fn run(mut self, incoming: Option<TcpStream>) {
        let mut completions: Vec<WriterCompletion> = Vec::new();

        let stream = match self.establish(incoming).await {
            Ok(stream) => stream,
            Err(error) => {
                self.do_stop(Some(error), &mut completions).await;
                return;
            }
        };

        self.reader.prepare(&self.config);
        self.writer.prepare(&self.config);
        self.flags.insert(ConnFlags::CONNECTED);
        self.apply_start_state();
        if self.deferred_enter_active {
            self.try_enter_active();
        }
        self.run_start_callback();

        let stop_error = self.main_loop(stream, &mut completions).await;
        self.do_stop(stop_error, &mut completions).await;
    }

    async fn establish(&mut self, incoming: Option<TcpStream>) -> Result<SocketStream> {
        if let Some(stream) = incoming {
            self.flags.insert(ConnFlags::SERVER);
            return if self.config.connection.start_secure {
                self.secure_accept(stream).await
            } else {
                Ok(SocketStream::Plain(stream))
            };
        }

        // Outgoing: wait for the resolved address list, then walk it.
        loop {
            let event = self.events.recv().await.ok_or(Error::ConnectionKilled)?;
            match event {
                ConnectionEvent::Resolve(addresses) => {
                    let mut last_error: Option<io::Error> = None;
                    for address in addresses {
                        match TcpStream::connect(address).await {
                            Ok(stream) => {
                                tracing::debug!(connection = %self.id, %address, "connected");
                                return if self.config.connection.start_secure {
                                    self.secure_connect(stream).await
                                } else {
                                    Ok(SocketStream::Plain(stream))
                                };
                            }
                            Err(error) => {
                                tracing::debug!(
                                    connection = %self.id,
                                    %address,
                                    %error,
                                    "connect attempt failed"
                                );
                                last_error = Some(error);
                            }
                        }
                    }
                    return Err(Error::Io(last_error.unwrap_or_else(|| {
                        io::Error::new(io::ErrorKind::AddrNotAvailable, "empty address list")
                    })));
                }
                ConnectionEvent::NewPoolMessage => {
                    self.flags.insert(ConnFlags::POLL_POOL);
                }
                ConnectionEvent::EnterActive => {
                    self.deferred_enter_active = true;
                }
                ConnectionEvent::Kill => return Err(Error::ConnectionKilled),
                ConnectionEvent::DelayedClose => return Err(Error::ConnectionDelayedClosed),
                _ => {
                    tracing::warn!(connection = %self.id, "event before connection start");
                }
            }
        }
    }

    async fn secure_connect(&mut self, stream: TcpStream) -> Result<SocketStream> {
        let secure = self
            .config
            .secure_context
            .as_ref()
            .ok_or(Error::TlsNotConfigured)?;
        let connector = secure.connector.clone().ok_or(Error::TlsNotConfigured)?;
        let name = secure.server_name.clone().ok_or(Error::TlsNotConfigured)?;
        let tls = connector.connect(name, stream).await?;
        self.flags.insert(ConnFlags::SECURE);
        Ok(SocketStream::Secure(Box::new(
            tokio_rustls::TlsStream::Client(tls),
        )))
    }

    async fn secure_accept(&mut self, stream: TcpStream) -> Result<SocketStream> {
        let secure = self
            .config
            .secure_context
            .as_ref()
            .ok_or(Error::TlsNotConfigured)?;
        let acceptor = secure.acceptor.clone().ok_or(Error::TlsNotConfigured)?;
        let tls = acceptor.accept(stream).await?;
        self.flags.insert(ConnFlags::SECURE);
        Ok(SocketStream::Secure(Box::new(
            tokio_rustls::TlsStream::Server(tls),
        )))
    }

    fn apply_start_state(&mut self) {
        match self.config.connection.start_state {
            ConnectionStartState::Raw => {
                self.flags.insert(ConnFlags::RAW);
            }
            ConnectionStartState::Passive => {}
            ConnectionStartState::Active => {
                self.flags.insert(ConnFlags::ACTIVE | ConnFlags::POLL_POOL);
            }
        }
        if self.flags.contains(ConnFlags::SERVER) {
            self.arm_timer(TimerKind::Inactivity);
        } else if self.flags.contains(ConnFlags::ACTIVE) {
            self.arm_timer(TimerKind::KeepAlive);
        }
    }

    fn run_start_callback(&mut self) {
        let callback = if self.flags.contains(ConnFlags::SERVER) {
            self.config.connection_start_incoming_fnc.clone()
        } else {
            self.config.connection_start_outgoing_fnc.clone()
        };
        if let Some(callback) = callback {
            let mut responses = Vec::new();
            let mut kill = false;
            {
                let mut ctx = self.make_context(
                    MessageFlags::empty(),
                    RequestId::INVALID,
                    MessageId::INVALID,
                    0,
                    &mut responses,
                    &mut kill,
                );
                callback(&mut ctx);
            }
            self.enqueue_responses(responses);
            self.kill_requested |= kill;
        }
    }

    async fn main_loop(
        &mut self,
        stream: SocketStream,
        completions: &mut Vec<WriterCompletion>,
    ) -> Option<Error> {
        let (mut rd, mut wr) = tokio::io::split(stream);
        let mut recv_buf = self.config.allocate_recv_buffer();
        let mut send_buf = self.config.allocate_send_buffer();
        let mut rstart = 0usize;
        let mut rend = 0usize;
        let mut soff = 0usize;
        let mut slen = 0usize;

        let stop_error = 'main: loop {
            if self.kill_requested {
                break 'main Some(Error::ConnectionKilled);
            }

            if self.flags.contains(ConnFlags::POLL_POOL) && self.flags.contains(ConnFlags::ACTIVE)
            {
                self.do_poll_pool();
            }

            if soff == slen && !self.flags.contains(ConnFlags::RAW) {
                soff = 0;
                slen = 0;
                let keep_alive = self.flags.contains(ConnFlags::KEEPALIVE_PENDING);
                match self.writer.write(
                    &mut send_buf,
                    keep_alive,
                    &self.config,
                    &self.protocol,
                    completions,
                ) {
                    Ok(produced) => {
                        slen = produced;
                        if produced > 0 {
                            self.flags.remove(ConnFlags::KEEPALIVE_PENDING);
                        }
                    }
                    Err(error) => break 'main Some(error),
                }
                self.process_completions(completions);
            }

            let timer_armed = self.timer_deadline.is_some();
            let deadline = self
                .timer_deadline
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            let want_write = slen > soff;
            let want_read = !self.flags.contains(ConnFlags::RAW) && rend < recv_buf.len();

            tokio::select! {
                biased;
                event = self.events.recv() => {
                    let Some(event) = event else {
                        break 'main Some(Error::ConnectionKilled);
                    };
                    match self.handle_event(event, &mut rd, &mut wr, completions).await {
                        Ok(Action::Continue) => {}
                        Ok(Action::Secure) => {
                            let joined = rd.unsplit(wr);
                            let upgraded = match joined {
                                SocketStream::Plain(tcp) => {
                                    if self.flags.contains(ConnFlags::SERVER) {
                                        self.secure_accept(tcp).await
                                    } else {
                                        self.secure_connect(tcp).await
                                    }
                                }
                                already_secure => Ok(already_secure),
                            };
                            match upgraded {
                                Ok(stream) => {
                                    let halves = tokio::io::split(stream);
                                    rd = halves.0;
                                    wr = halves.1;
                                }
                                Err(error) => break 'main Some(error),
                            }
                        }
                        Err(error) => break 'main Some(error),
                    }
                }
                result = wr.write(&send_buf[soff..slen]), if want_write => {
                    match result {
                        Ok(0) => {
                            break 'main Some(Error::Io(io::ErrorKind::WriteZero.into()));
                        }
                        Ok(written) => {
                            soff += written;
                            if soff == slen {
                                self.on_all_sent();
                            }
                        }
                        Err(error) => break 'main Some(Error::Io(error)),
                    }
                }
                result = rd.read(&mut recv_buf[rend..]), if want_read => {
                    match result {
                        Ok(0) => break 'main None, // peer closed
                        Ok(received) => {
                            rend += received;
                            match self.on_recv(&recv_buf[rstart..rend], completions) {
                                Ok(consumed) => {
                                    rstart += consumed;
                                    if rstart == rend {
                                        rstart = 0;
                                        rend = 0;
                                    } else if rstart > recv_buf.len() / 2
                                        || rend == recv_buf.len()
                                    {
                                        // Compact once more than half is
                                        // consumed, or the tail is full and a
                                        // partial packet needs headroom.
                                        recv_buf.copy_within(rstart..rend, 0);
                                        rend -= rstart;
                                        rstart = 0;
                                    }
                                }
                                Err(error) => break 'main Some(error),
                            }
                        }
                        Err(error) => break 'main Some(Error::Io(error)),
                    }
                }
                _ = tokio::time::sleep_until(deadline), if timer_armed => {
                    if let Some(error) = self.on_timer() {
                        break 'main Some(error);
                    }
                }
            }
        };

        let recv_taken = std::mem::take(&mut recv_buf);
        let send_taken = std::mem::take(&mut send_buf);
        self.config.free_recv_buffer(recv_taken);
        self.config.free_send_buffer(send_taken);
        stop_error
    }

    async fn handle_event(
        &mut self,
        event: ConnectionEvent,
        rd: &mut ReadHalf<SocketStream>,
        wr: &mut WriteHalf<SocketStream>,
        completions: &mut Vec<WriterCompletion>,
    ) -> Result<Action> {
        match event {
            ConnectionEvent::Resolve(_) => {
                tracing::warn!(connection = %self.id, "resolve event on a started connection");
            }
            ConnectionEvent::NewPoolMessage => {
                self.flags.insert(ConnFlags::POLL_POOL);
            }
            ConnectionEvent::CancelConnMessage(request_id) => {
                match self.writer.cancel(request_id, completions) {
                    Ok(()) => self.process_completions(completions),
                    Err(error) => {
                        tracing::debug!(connection = %self.id, %request_id, %error, "cancel miss");
                    }
                }
            }
            ConnectionEvent::CancelPoolMessage(message_id) => {
                match self.writer.cancel_by_pool_id(message_id, completions) {
                    Ok(()) => self.process_completions(completions),
                    Err(error) => {
                        tracing::debug!(connection = %self.id, %message_id, %error, "cancel miss");
                        // Never reached the writer: the pool still owns it.
                        self.service.pool_message_done(self.pool_id, message_id);
                    }
                }
            }
            ConnectionEvent::EnterActive => {
                self.try_enter_active();
            }
            ConnectionEvent::EnterPassive => {
                self.flags.remove(ConnFlags::ACTIVE | ConnFlags::RAW);
                self.service
                    .connection_notify_enter_passive(self.pool_id, self.id);
            }
            ConnectionEvent::StartSecure => {
                if self.flags.contains(ConnFlags::SECURE) {
                    tracing::warn!(connection = %self.id, "connection is already secure");
                } else if !self.flags.contains(ConnFlags::RAW) {
                    return Err(Error::InvalidState);
                } else {
                    return Ok(Action::Secure);
                }
            }
            ConnectionEvent::SendRaw { data, done } => {
                if !self.flags.contains(ConnFlags::RAW) {
                    done(Err(Error::InvalidState));
                } else {
                    let result = wr.write_all(&data).await.map_err(Error::Io);
                    self.flags.insert(ConnFlags::HAS_ACTIVITY);
                    done(result);
                }
            }
            ConnectionEvent::RecvRaw { done } => {
                if !self.flags.contains(ConnFlags::RAW) {
                    done(Err(Error::InvalidState));
                } else {
                    let mut buf = vec![0u8; 4096];
                    match rd.read(&mut buf).await {
                        Ok(0) => done(Err(Error::Io(io::ErrorKind::UnexpectedEof.into()))),
                        Ok(received) => {
                            buf.truncate(received);
                            self.flags.insert(ConnFlags::HAS_ACTIVITY);
                            done(Ok(Bytes::from(buf)));
                        }
                        Err(error) => done(Err(Error::Io(error))),
                    }
                }
            }
            ConnectionEvent::DelayedClose => {
                self.flags.insert(ConnFlags::DELAYED_STOPPING);
                if let Err(error) = self.writer.enqueue_close() {
                    tracing::debug!(connection = %self.id, %error, "delayed close rejected");
                }
            }
            ConnectionEvent::Kill => return Err(Error::ConnectionKilled),
            ConnectionEvent::User(payload) => {
                if let Some(hook) = self.config.connection_on_event_fnc.clone() {
                    let mut responses = Vec::new();
                    let mut kill = false;
                    {
                        let mut ctx = self.make_context(
                            MessageFlags::empty(),
                            RequestId::INVALID,
                            MessageId::INVALID,
                            0,
                            &mut responses,
                            &mut kill,
                        );
                        hook(&mut ctx, payload);
                    }
                    self.enqueue_responses(responses);
                    self.kill_requested |= kill;
                }
            }
        }
        Ok(Action::Continue)
    }

    fn try_enter_active(&mut self) {
        if self.flags.contains(ConnFlags::ACTIVE) {
            return;
        }
        if self
            .service
            .connection_notify_enter_active(self.pool_id, self.id)
        {
            self.flags.remove(ConnFlags::RAW);
            self.flags.insert(ConnFlags::ACTIVE | ConnFlags::POLL_POOL);
            if !self.flags.contains(ConnFlags::SERVER) {
                self.arm_timer(TimerKind::KeepAlive);
            }
        } else {
            tracing::warn!(
                connection = %self.id,
                "pool active-connection quota reached; staying passive"
            );
        }
    }

    fn do_poll_pool(&mut self) {
        let free = self
            .config
            .writer
            .max_message_count_per_connection
            .saturating_sub(self.writer.live_count());
        if free == 0 {
            return;
        }
        let (batch, more) = self.service.poll_pool(self.pool_id, self.id, free);
        for (bundle, pool_msg_id) in batch {
            match self.writer.enqueue(&self.config, bundle, pool_msg_id) {
                Ok(request_id) => {
                    tracing::debug!(
                        connection = %self.id,
                        message = %pool_msg_id,
                        request = %request_id,
                        "message taken from pool"
                    );
                }
                Err((error, bundle)) => {
                    tracing::warn!(connection = %self.id, %error, "writer refused pool message");
                    self.service
                        .return_to_pool(self.pool_id, bundle, pool_msg_id);
                }
            }
        }
        if !more {
            self.flags.remove(ConnFlags::POLL_POOL);
        }
    }

    fn on_recv(&mut self, buf: &[u8], completions: &mut Vec<WriterCompletion>) -> Result<usize> {
        self.flags.insert(ConnFlags::HAS_ACTIVITY);
        let mut events = Vec::new();
        let consumed = self
            .reader
            .read(buf, &self.config, &self.protocol, &mut events)?;
        self.process_read_events(events, completions)?;
        Ok(consumed)
    }

    fn process_read_events(
        &mut self,
        events: Vec<ReadEvent>,
        completions: &mut Vec<WriterCompletion>,
    ) -> Result<()> {
        for event in events {
            match event {
                ReadEvent::KeepAlive => {
                    self.recv_keepalive_count += 1;
                    tracing::debug!(
                        connection = %self.id,
                        count = self.recv_keepalive_count,
                        "keep-alive received"
                    );
                    if self.flags.contains(ConnFlags::SERVER)
                        && self.recv_keepalive_count
                            > self.config.connection.inactivity_keepalive_count
                    {
                        return Err(Error::TooManyKeepAlivePackets);
                    }
                }
                ReadEvent::Message {
                    type_id,
                    header,
                    message,
                } => {
                    self.recv_keepalive_count = 0;
                    if header.flags.is_response() {
                        if self
                            .writer
                            .complete_message(header.request_id, Some(message), completions)
                        {
                            self.process_completions(completions);
                        } else {
                            tracing::debug!(
                                connection = %self.id,
                                request = %header.request_id,
                                "response without a waiting request"
                            );
                        }
                    } else {
                        self.deliver_fresh_message(type_id, header, message);
                    }
                }
            }
        }
        Ok(())
    }

    fn deliver_fresh_message(
        &mut self,
        type_id: TypeId,
        header: MessageHeader,
        message: Box<dyn crate::message::AnyMessage>,
    ) {
        let mut responses = Vec::new();
        let mut kill = false;
        {
            let mut ctx = ConnectionContext {
                service: &self.service,
                protocol: self.protocol.as_ref(),
                connection_id: self.id,
                recipient_id: self.pool_id,
                message_flags: header.flags | MessageFlags::ON_PEER,
                request_id: header.request_id,
                message_id: MessageId::INVALID,
                message_state: header.state,
                responses: &mut responses,
                kill_requested: &mut kill,
                user_data: &mut self.user_data,
            };
            self.protocol
                .complete(type_id, &mut ctx, None, Some(message), None);
        }
        self.enqueue_responses(responses);
        self.kill_requested |= kill;
    }

    /// Run the completion hooks for messages the writer finished, failed or
    /// canceled, then release their pool ids.
    fn process_completions(&mut self, completions: &mut Vec<WriterCompletion>) {
        if completions.is_empty() {
            return;
        }
        let drained: Vec<WriterCompletion> = completions.drain(..).collect();
        let mut responses = Vec::new();
        let mut kill = false;
        for completion in drained {
            let WriterCompletion {
                mut bundle,
                pool_msg_id,
                request_id,
                mut response,
                error,
            } = completion;

            let mut flags = bundle.flags;
            if response.is_some() {
                flags.insert(MessageFlags::BACK_ON_SENDER);
            }
            let mut ctx = ConnectionContext {
                service: &self.service,
                protocol: self.protocol.as_ref(),
                connection_id: self.id,
                recipient_id: self.pool_id,
                message_flags: flags,
                request_id,
                message_id: pool_msg_id,
                message_state: bundle.state,
                responses: &mut responses,
                kill_requested: &mut kill,
                user_data: &mut self.user_data,
            };
            if let Some(response_fnc) = bundle.response_fnc.take() {
                response_fnc(&mut ctx, response.take(), error.as_ref());
            }
            self.protocol.complete(
                bundle.type_id,
                &mut ctx,
                Some(bundle.message),
                response,
                error.as_ref(),
            );
        }
        let service = self.service.clone();
        let pool_id = self.pool_id;
        self.writer
            .visit_completing_messages(|message_id| service.pool_message_done(pool_id, message_id));
        self.enqueue_responses(responses);
        self.kill_requested |= kill;
    }

    fn enqueue_responses(&mut self, responses: Vec<ResponseCommand>) {
        if self.flags.contains(ConnFlags::STOPPING) {
            if !responses.is_empty() {
                tracing::warn!(connection = %self.id, "dropping responses queued during stop");
            }
            return;
        }
        for response in responses {
            let mut bundle =
                MessageBundle::new(response.type_id, MessageFlags::RESPONSE, response.message);
            bundle.peer_request_id = response.request_id;
            if let Err((error, _bundle)) =
                self.writer
                    .enqueue(&self.config, bundle, MessageId::INVALID)
            {
                tracing::warn!(connection = %self.id, %error, "dropping response");
            }
        }
    }

    fn on_all_sent(&mut self) {
        self.flags.insert(ConnFlags::HAS_ACTIVITY);
        if !self.flags.contains(ConnFlags::SERVER) && !self.flags.contains(ConnFlags::RAW) {
            self.arm_timer(TimerKind::KeepAlive);
        }
    }

    fn arm_timer(&mut self, kind: TimerKind) {
        let timeout = match kind {
            TimerKind::KeepAlive => self.config.connection.keepalive_timeout,
            TimerKind::Inactivity => self.config.connection.inactivity_timeout,
        };
        self.timer_kind = kind;
        self.timer_deadline = Some(Instant::now() + timeout);
    }

    fn on_timer(&mut self) -> Option<Error> {
        self.timer_deadline = None;
        match self.timer_kind {
            TimerKind::KeepAlive => {
                // The next writer pass emits a keep-alive packet if no real
                // traffic is eligible; the flush re-arms this timer.
                self.flags.insert(ConnFlags::KEEPALIVE_PENDING);
                None
            }
            TimerKind::Inactivity => {
                if self.flags.contains(ConnFlags::HAS_ACTIVITY) {
                    self.flags.remove(ConnFlags::HAS_ACTIVITY);
                    self.recv_keepalive_count = 0;
                    self.arm_timer(TimerKind::Inactivity);
                    None
                } else {
                    Some(Error::InactivityTimeout)
                }
            }
        }
    }

    async fn do_stop(&mut self, error: Option<Error>, completions: &mut Vec<WriterCompletion>) {
        self.flags.insert(ConnFlags::STOPPING);
        tracing::debug!(
            connection = %self.id,
            error = %error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "peer closed".into()),
            "connection stopping"
        );

        // Messages the pool may redeliver go back first, in submission order.
        let retriables = self.writer.take_retriables();
        if !retriables.is_empty() {
            self.service.reclaim_messages(self.pool_id, retriables);
        }

        // Everything else fails here, exactly once.
        self.writer
            .complete_all_messages(|_| Error::MessageFailSend, completions);
        self.process_completions(completions);

        let wait = self
            .service
            .connection_stopping(self.pool_id, self.id, error.as_ref());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        if let Some(stop_fnc) = self.config.connection_stop_fnc.clone() {
            let mut responses = Vec::new();
            let mut kill = false;
            {
                let mut ctx = self.make_context(
                    MessageFlags::empty(),
                    RequestId::INVALID,
                    MessageId::INVALID,
                    0,
                    &mut responses,
                    &mut kill,
                );
                stop_fnc(&mut ctx, error.as_ref());
            }
            if !responses.is_empty() {
                tracing::warn!(connection = %self.id, "responses queued from a stop callback");
            }
        }

        self.reader.unprepare();
        self.writer.unprepare();

        let connected = self.flags.contains(ConnFlags::CONNECTED);
        let failed = self
            .service
            .connection_stopped(self.pool_id, self.id, connected, error.as_ref());
        self.complete_detached(failed);
    }

    /// Complete pool-level bundles that never reached a writer.
    fn complete_detached(&mut self, bundles: Vec<(MessageBundle, MessageId)>) {
        for (mut bundle, message_id) in bundles {
            let mut responses = Vec::new();
            let mut kill = false;
            let error = Error::MessageFailSend;
            {
                let mut ctx = ConnectionContext {
                    service: &self.service,
                    protocol: self.protocol.as_ref(),
                    connection_id: self.id,
                    recipient_id: self.pool_id,
                    message_flags: bundle.flags,
                    request_id: RequestId::INVALID,
                    message_id,
                    message_state: bundle.state,
                    responses: &mut responses,
                    kill_requested: &mut kill,
                    user_data: &mut self.user_data,
                };
                if let Some(response_fnc) = bundle.response_fnc.take() {
                    response_fnc(&mut ctx, None, Some(&error));
                }
                self.protocol.complete(
                    bundle.type_id,
                    &mut ctx,
                    Some(bundle.message),
                    None,
                    Some(&error),
                );
            }
            self.service.pool_message_done(self.pool_id, message_id);
        }
    }

    fn make_context<'a>(
        &'a mut self,
        message_flags: MessageFlags,
        request_id: RequestId,
        message_id: MessageId,
        message_state: u32,
        responses: &'a mut Vec<ResponseCommand>,
        kill_requested: &'a mut bool,
    ) -> ConnectionContext<'a> {
        ConnectionContext {
            service: &self.service,
            protocol: self.protocol.as_ref(),
            connection_id: self.id,
            recipient_id: self.pool_id,
            message_flags,
            request_id,
            message_id,
            message_state,
            responses,
            kill_requested,
            user_data: &mut self.user_data,
        }
    }
}

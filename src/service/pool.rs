// ABOUTME: Per-recipient connection pool state: pending queue, live connections, resolution
// ABOUTME: Guarded by one mutex per pool; all methods run under that lock and never block

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;

use crate::message::{MessageBundle, MessageId};
use crate::service::ConnectionId;

/// Name resolution progress for an outgoing pool.
pub(crate) enum ResolveState {
    NotStarted,
    InProgress,
    /// Resolved address list, reused for reconnects
    Done(Vec<SocketAddr>),
}

/// Where a live pool message currently is.
pub(crate) enum MsgLocation {
    /// Still in the pool's pending queue
    Pending,
    /// Delegated to a connection's writer
    Conn(ConnectionId),
}

/// One pool: the set of connections serving a symbolic recipient plus the
/// messages not yet handed to any of them.
///
/// Synchronous messages are only ever handed to the primary connection, so
/// the writer's one-synchronous-at-a-time rule gives a pool-wide total order.
pub(crate) struct Pool {
    pub name: String,
    pub pending: VecDeque<(MessageBundle, MessageId)>,
    pub conns: Vec<ConnectionId>,
    pub primary: Option<ConnectionId>,
    /// Connections that upgraded to active through the notify path
    pub active: HashSet<ConnectionId>,
    pub resolve: ResolveState,
    pub live: HashMap<MessageId, MsgLocation>,
    pub stopping: bool,
    pub reconnect_scheduled: bool,
    next_msg_index: u32,
}

impl Pool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pending: VecDeque::new(),
            conns: Vec::new(),
            primary: None,
            active: HashSet::new(),
            resolve: ResolveState::NotStarted,
            live: HashMap::new(),
            stopping: false,
            reconnect_scheduled: false,
            next_msg_index: 0,
        }
    }

    /// Mint the next pool-side message id.
    pub fn mint_message_id(&mut self) -> MessageId {
        let id = MessageId::new(self.next_msg_index, 0);
        self.next_msg_index = self.next_msg_index.wrapping_add(1);
        id
    }

    /// Hand up to `max` eligible pending messages to `conn`, preserving
    /// submission order. Synchronous messages are eligible only for the
    /// primary connection. Returns the batch and whether eligible work
    /// remains.
    pub fn take_eligible(
        &mut self,
        conn: ConnectionId,
        is_primary: bool,
        max: usize,
    ) -> (Vec<(MessageBundle, MessageId)>, bool) {
        let mut taken = Vec::new();
        let mut rest = VecDeque::with_capacity(self.pending.len());
        while let Some((bundle, message_id)) = self.pending.pop_front() {
            let eligible = bundle.flags.is_asynchronous() || is_primary;
            if eligible && taken.len() < max {
                self.live.insert(message_id, MsgLocation::Conn(conn));
                taken.push((bundle, message_id));
            } else {
                rest.push_back((bundle, message_id));
            }
        }
        self.pending = rest;
        let more = self
            .pending
            .iter()
            .any(|(bundle, _)| bundle.flags.is_asynchronous() || is_primary);
        (taken, more)
    }

    /// Put reclaimed messages back at the head of the queue, keeping their
    /// relative order ahead of anything newer.
    pub fn reclaim(&mut self, messages: Vec<(MessageBundle, MessageId)>) {
        for (bundle, message_id) in messages.into_iter().rev() {
            self.live.insert(message_id, MsgLocation::Pending);
            self.pending.push_front((bundle, message_id));
        }
    }

    /// Remove a pending message by id, for cancellation.
    pub fn remove_pending(&mut self, message_id: MessageId) -> Option<MessageBundle> {
        let position = self
            .pending
            .iter()
            .position(|(_, id)| *id == message_id)?;
        self.live.remove(&message_id);
        self.pending.remove(position).map(|(bundle, _)| bundle)
    }
}

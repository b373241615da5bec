// ABOUTME: Message writer: multiplexes fragments of many in-flight messages into packets
// ABOUTME: Slot vector threaded by intrusive order/status lists; status enum is the source of truth

use bytes::{Bytes, BytesMut};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::inner_list::{INVALID_INDEX, InnerList, InnerNode, Link};
use crate::message::{
    AnyMessage, MessageBundle, MessageFlags, MessageHeader, MessageId, RequestId,
};
use crate::packet::{MAX_PACKET_DATA_SIZE, MIN_FREE_PACKET_DATA_SIZE, PacketHeader, PacketType};
use crate::protocol::{Protocol, compute_value_with_crc, store_cross};

const ORDER: usize = 0;
const STATUS: usize = 1;

/// Where a slot currently lives. The status lists are derived from this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InnerStatus {
    /// Free for reuse, parked in the cache list
    Invalid,
    /// Queued behind the multiplex cap or synchronous ordering
    Pending,
    /// Eligible for serialization into the next packet
    Sending,
    /// Fully sent, slot kept alive for the response
    Waiting,
    /// Completed but its pool message id has not been released yet
    Completing,
}

/// Streams one message's bytes across packets: CRC-wrapped type id and
/// length prefix first, then the header+payload blob.
struct MessageSerializer {
    data: Bytes,
    offset: usize,
}

impl MessageSerializer {
    fn new(protocol: &Protocol, bundle: &MessageBundle, request_id: RequestId) -> Result<Self> {
        let mut blob = BytesMut::new();
        MessageHeader {
            flags: bundle.flags & MessageFlags::WIRE,
            request_id,
            state: bundle.state,
        }
        .encode(&mut blob);
        protocol.encode(bundle.type_id, bundle.message.as_ref(), &mut blob)?;

        let mut data = BytesMut::with_capacity(blob.len() + 12);
        store_cross(&mut data, compute_value_with_crc(bundle.type_id.0 as u32)?);
        store_cross(&mut data, compute_value_with_crc(blob.len() as u32)?);
        data.extend_from_slice(&blob);
        Ok(Self {
            data: data.freeze(),
            offset: 0,
        })
    }

    fn write(&mut self, out: &mut [u8]) -> usize {
        let take = (self.data.len() - self.offset).min(out.len());
        out[..take].copy_from_slice(&self.data[self.offset..self.offset + take]);
        self.offset += take;
        take
    }

    fn is_empty(&self) -> bool {
        self.offset == self.data.len()
    }
}

struct MessageStub {
    bundle: Option<MessageBundle>,
    unique: u32,
    packet_count: u32,
    serializer: Option<MessageSerializer>,
    status: InnerStatus,
    pool_msg_id: MessageId,
    order_link: Link,
    status_link: Link,
}

impl Default for MessageStub {
    fn default() -> Self {
        Self {
            bundle: None,
            unique: 0,
            packet_count: 0,
            serializer: None,
            status: InnerStatus::Invalid,
            pool_msg_id: MessageId::INVALID,
            order_link: Link::default(),
            status_link: Link::default(),
        }
    }
}

impl MessageStub {
    /// Delayed-close sentinel: no message value and not a canceled leftover.
    fn is_stop(&self) -> bool {
        self.bundle.is_none()
    }

    fn is_canceled(&self) -> bool {
        self.bundle.as_ref().is_some_and(|b| b.flags.is_canceled())
    }

    fn flags(&self) -> MessageFlags {
        self.bundle.as_ref().map(|b| b.flags).unwrap_or_default()
    }
}

impl InnerNode<ORDER> for MessageStub {
    fn link(&self) -> &Link {
        &self.order_link
    }

    fn link_mut(&mut self) -> &mut Link {
        &mut self.order_link
    }
}

impl InnerNode<STATUS> for MessageStub {
    fn link(&self) -> &Link {
        &self.status_link
    }

    fn link_mut(&mut self) -> &mut Link {
        &mut self.status_link
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, Default)]
    struct WriterFlags: u8 {
        const SYNC_IN_SENDING = 1;
        const ASYNC_IN_PENDING = 2;
        const DELAYED_CLOSE_IN_QUEUE = 4;
    }
}

#[derive(Default)]
struct PacketOptions {
    packet_type: Option<PacketType>,
    /// Fragments emitted into this packet; a lone cancel marker is a valid
    /// packet with zero payload bytes.
    fragments: usize,
    force_no_compress: bool,
}

/// A completed message handed back to the connection, which runs the hooks.
pub(crate) struct WriterCompletion {
    pub bundle: MessageBundle,
    pub pool_msg_id: MessageId,
    pub request_id: RequestId,
    pub response: Option<Box<dyn AnyMessage>>,
    pub error: Option<Error>,
}

/// Holds the set of in-flight outgoing messages and fills packets on demand.
///
/// Every live slot is in exactly one status list; every non-cached slot is in
/// the order list. At most one synchronous slot sits in `sending`.
pub(crate) struct MessageWriter {
    slots: Vec<MessageStub>,
    order: InnerList<ORDER>,
    pending: InnerList<STATUS>,
    sending: InnerList<STATUS>,
    cached: InnerList<STATUS>,
    flags: WriterFlags,
}

impl MessageWriter {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            order: InnerList::default(),
            pending: InnerList::default(),
            sending: InnerList::default(),
            cached: InnerList::default(),
            flags: WriterFlags::empty(),
        }
    }

    pub fn prepare(&mut self, _config: &Config) {}

    pub fn unprepare(&mut self) {
        self.slots.clear();
        self.order.fast_clear();
        self.pending.fast_clear();
        self.sending.fast_clear();
        self.cached.fast_clear();
        self.flags = WriterFlags::empty();
    }

    /// No traffic left to serialize. Waiting slots do not count: they only
    /// hold seats for responses.
    pub fn is_empty(&self) -> bool {
        self.sending.is_empty() && self.pending.is_empty()
    }

    /// Live messages currently owned by this writer.
    pub fn live_count(&self) -> usize {
        self.order.len()
    }

    fn allocate_slot(&mut self) -> u32 {
        let front = self.cached.front();
        if front != INVALID_INDEX && self.slots[front as usize].status == InnerStatus::Invalid {
            self.cached.pop_front(&mut self.slots);
            return front;
        }
        self.slots.push(MessageStub::default());
        (self.slots.len() - 1) as u32
    }

    /// Install a message into a slot and place it in `sending` or `pending`.
    /// On failure the bundle is handed back untouched.
    pub fn enqueue(
        &mut self,
        config: &Config,
        bundle: MessageBundle,
        pool_msg_id: MessageId,
    ) -> std::result::Result<RequestId, (Error, MessageBundle)> {
        if self.flags.contains(WriterFlags::DELAYED_CLOSE_IN_QUEUE) {
            return Err((Error::DelayedClosePending, bundle));
        }
        if self.order.len() >= config.writer.max_message_count_per_connection {
            return Err((Error::WriterFull, bundle));
        }

        let synchronous = bundle.flags.is_synchronous();
        let index = self.allocate_slot();
        let i = index as usize;
        self.slots[i].bundle = Some(bundle);
        self.slots[i].pool_msg_id = pool_msg_id;
        self.slots[i].packet_count = 0;

        self.order.push_back(&mut self.slots, index);

        if self.sending.len() < config.writer.max_message_count_multiplex
            && (!synchronous || !self.flags.contains(WriterFlags::SYNC_IN_SENDING))
        {
            self.sending.push_back(&mut self.slots, index);
            self.slots[i].status = InnerStatus::Sending;
            if synchronous {
                self.flags.insert(WriterFlags::SYNC_IN_SENDING);
            }
        } else {
            self.pending.push_back(&mut self.slots, index);
            self.slots[i].status = InnerStatus::Pending;
            if !synchronous {
                self.flags.insert(WriterFlags::ASYNC_IN_PENDING);
            }
        }

        Ok(RequestId::new(index, self.slots[i].unique))
    }

    /// Queue the delayed-close sentinel: once everything ahead of it drains,
    /// the next fill reports `ConnectionDelayedClosed`.
    pub fn enqueue_close(&mut self) -> Result<()> {
        if self.flags.contains(WriterFlags::DELAYED_CLOSE_IN_QUEUE) {
            return Err(Error::DelayedClosePending);
        }
        self.flags.insert(WriterFlags::DELAYED_CLOSE_IN_QUEUE);

        let index = self.allocate_slot();
        let i = index as usize;
        self.slots[i].bundle = None;
        self.slots[i].pool_msg_id = MessageId::INVALID;
        self.order.push_back(&mut self.slots, index);
        if self.sending.is_empty() {
            self.sending.push_back(&mut self.slots, index);
            self.slots[i].status = InnerStatus::Sending;
        } else {
            self.pending.push_back(&mut self.slots, index);
            self.slots[i].status = InnerStatus::Pending;
        }
        Ok(())
    }

    /// Cancel a message by its connection-level id.
    ///
    /// Messages that have not produced bytes complete immediately; a message
    /// mid-send is flipped to its canceled variant and completes once the
    /// canceled tail marker is emitted.
    pub fn cancel(
        &mut self,
        request_id: RequestId,
        completions: &mut Vec<WriterCompletion>,
    ) -> Result<()> {
        let i = request_id.index as usize;
        if i >= self.slots.len()
            || self.slots[i].unique != request_id.unique
            || self.slots[i].bundle.is_none()
        {
            return Err(Error::MessageInexistent);
        }

        match self.slots[i].status {
            InnerStatus::Pending => {
                self.order.erase(&mut self.slots, request_id.index);
                self.pending.erase(&mut self.slots, request_id.index);
                self.complete_slot(request_id.index, None, Some(Error::MessageCanceled), completions);
            }
            InnerStatus::Sending if self.slots[i].serializer.is_none() => {
                self.order.erase(&mut self.slots, request_id.index);
                self.sending.erase(&mut self.slots, request_id.index);
                self.complete_slot(request_id.index, None, Some(Error::MessageCanceled), completions);
                self.recompute_sync_flag();
                // a seat freed up
                // (the canceled message may have been the synchronous holder)
            }
            InnerStatus::Sending => {
                // Mid-send: keep the slot so the canceled marker reaches the peer.
                let stub = &mut self.slots[i];
                if let Some(bundle) = &mut stub.bundle {
                    bundle.flags.insert(MessageFlags::CANCELED);
                }
                stub.serializer = None;
                self.recompute_sync_flag();
            }
            InnerStatus::Waiting => {
                self.order.erase(&mut self.slots, request_id.index);
                self.complete_slot(request_id.index, None, Some(Error::MessageCanceled), completions);
            }
            InnerStatus::Invalid | InnerStatus::Completing => {
                return Err(Error::MessageInexistent);
            }
        }
        Ok(())
    }

    /// Cancel a message by its pool-level id.
    pub fn cancel_by_pool_id(
        &mut self,
        pool_msg_id: MessageId,
        completions: &mut Vec<WriterCompletion>,
    ) -> Result<()> {
        let mut index = self.order.front();
        while index != INVALID_INDEX {
            let next = self.order.next_of(&self.slots, index);
            if self.slots[index as usize].pool_msg_id == pool_msg_id {
                let request_id = RequestId::new(index, self.slots[index as usize].unique);
                return self.cancel(request_id, completions);
            }
            index = next;
        }
        Err(Error::MessageInexistent)
    }

    /// Forcibly drain the oldest live message; used while shutting down.
    pub fn cancel_oldest(&mut self, completions: &mut Vec<WriterCompletion>) -> bool {
        let index = self.order.front();
        if index == INVALID_INDEX {
            return false;
        }
        match self.slots[index as usize].status {
            InnerStatus::Pending => self.pending.erase(&mut self.slots, index),
            InnerStatus::Sending => self.sending.erase(&mut self.slots, index),
            _ => {}
        }
        self.order.erase(&mut self.slots, index);
        if self.slots[index as usize].bundle.is_some() {
            self.complete_slot(index, None, Some(Error::MessageCanceled), completions);
        } else {
            // Sentinels have no bundle; drop them outright.
            self.unprepare_slot(index);
        }
        self.recompute_sync_flag();
        true
    }

    /// A response with a matching request id arrived: complete the waiter.
    pub fn complete_message(
        &mut self,
        request_id: RequestId,
        response: Option<Box<dyn AnyMessage>>,
        completions: &mut Vec<WriterCompletion>,
    ) -> bool {
        let i = request_id.index as usize;
        if i >= self.slots.len()
            || self.slots[i].unique != request_id.unique
            || self.slots[i].bundle.is_none()
            || self.slots[i].status != InnerStatus::Waiting
        {
            return false;
        }
        self.order.erase(&mut self.slots, request_id.index);
        self.complete_slot(request_id.index, response, None, completions);
        true
    }

    /// Fill `buf` with as many packets as fit. Returns the bytes written; a
    /// keep-alive-only packet is emitted when there is nothing else to send
    /// and the caller asked for one.
    pub fn write(
        &mut self,
        buf: &mut [u8],
        keep_alive: bool,
        config: &Config,
        protocol: &Protocol,
        completions: &mut Vec<WriterCompletion>,
    ) -> Result<usize> {
        let mut pos = 0;
        let mut more = true;

        while more && buf.len() - pos >= PacketHeader::SIZE + MIN_FREE_PACKET_DATA_SIZE {
            let data_start = pos + PacketHeader::SIZE;
            let data_end = data_start + (buf.len() - data_start).min(MAX_PACKET_DATA_SIZE);
            let mut options = PacketOptions::default();
            let produced = self.do_fill_packet(
                &mut buf[data_start..data_end],
                &mut options,
                &mut more,
                pos > 0,
                config,
                protocol,
                completions,
            )?;
            if options.fragments == 0 {
                break;
            }

            let mut size = produced;
            let mut header = PacketHeader::new(
                options
                    .packet_type
                    .ok_or(Error::Logic("packet fragments without a type"))?,
                size,
            );
            if produced > 0 && !options.force_no_compress {
                if let Some(compress) = &config.inplace_compress_fnc {
                    if let Some(compressed) =
                        compress(&mut buf[data_start..data_start + produced])?
                    {
                        if compressed < produced {
                            size = compressed;
                            header = PacketHeader::new(header.packet_type(), size);
                            header.set_compressed();
                        }
                    }
                }
            }
            header.store(&mut buf[pos..]);
            pos = data_start + size;
        }

        if pos == 0 && keep_alive {
            PacketHeader::new(PacketType::KeepAlive, 0).store(&mut buf[pos..]);
            pos += PacketHeader::SIZE;
        }
        Ok(pos)
    }

    fn do_fill_packet(
        &mut self,
        buf: &mut [u8],
        options: &mut PacketOptions,
        more: &mut bool,
        call_has_data: bool,
        config: &Config,
        protocol: &Protocol,
        completions: &mut Vec<WriterCompletion>,
    ) -> Result<usize> {
        let mut pos = 0;

        while !self.sending.is_empty() && buf.len() - pos >= MIN_FREE_PACKET_DATA_SIZE {
            let index = self.sending.front();
            let i = index as usize;

            if self.slots[i].is_stop() {
                if options.fragments == 0 && !call_has_data {
                    // Nothing ahead of the sentinel: the close takes effect.
                    self.sending.pop_front(&mut self.slots);
                    self.order.erase(&mut self.slots, index);
                    self.unprepare_slot(index);
                    return Err(Error::ConnectionDelayedClosed);
                }
                // Flush what the buffer already holds first; the close fires
                // on the next, otherwise-empty pass.
                *more = false;
                break;
            }

            let msg_switch = self.prepare_message_for_sending(i, protocol)?;
            if options.fragments == 0 {
                options.packet_type = Some(msg_switch);
            } else {
                buf[pos] = msg_switch as u8;
                pos += 1;
            }
            options.fragments += 1;

            if self.slots[i].is_canceled() {
                // The marker is the whole fragment; the message can complete.
                self.sending.pop_front(&mut self.slots);
                self.order.erase(&mut self.slots, index);
                self.complete_slot(index, None, Some(Error::MessageCanceled), completions);
                self.recompute_sync_flag();
                self.try_move_pending_to_sending(config);
                continue;
            }

            let written = self.slots[i]
                .serializer
                .as_mut()
                .ok_or(Error::Logic("sending slot without serializer"))?
                .write(&mut buf[pos..]);
            if written == 0 {
                return Err(Error::Logic("serializer made no progress"));
            }
            pos += written;

            self.try_complete_after_serialization(index, config, completions);
        }

        Ok(pos)
    }

    /// Choose the control code for the front slot and make sure its
    /// serializer exists. Fresh slots switch to new and serialize the
    /// CRC-wrapped type id first so the receiver can construct the value.
    fn prepare_message_for_sending(
        &mut self,
        i: usize,
        protocol: &Protocol,
    ) -> Result<PacketType> {
        let stub = &mut self.slots[i];
        if stub.is_canceled() {
            return Ok(if stub.packet_count == 0 {
                PacketType::SwitchToOldCanceledMessage
            } else {
                PacketType::ContinuedCanceledMessage
            });
        }
        if stub.serializer.is_none() {
            let bundle = stub
                .bundle
                .as_mut()
                .ok_or(Error::Logic("serializing an empty slot"))?;
            bundle.state += 1;
            bundle.flags.insert(MessageFlags::STARTED_SEND);
            let request_id = if bundle.flags.is_response() {
                bundle.peer_request_id
            } else {
                RequestId::new(i as u32, stub.unique)
            };
            stub.serializer = Some(MessageSerializer::new(protocol, bundle, request_id)?);
            return Ok(PacketType::SwitchToNewMessage);
        }
        Ok(if stub.packet_count == 0 {
            PacketType::SwitchToOldMessage
        } else {
            PacketType::ContinuedMessage
        })
    }

    fn try_complete_after_serialization(
        &mut self,
        index: u32,
        config: &Config,
        completions: &mut Vec<WriterCompletion>,
    ) {
        let i = index as usize;
        if self.slots[i]
            .serializer
            .as_ref()
            .is_some_and(MessageSerializer::is_empty)
        {
            // Done serializing this message.
            self.sending.pop_front(&mut self.slots);
            if self.slots[i].flags().is_synchronous() {
                self.flags.remove(WriterFlags::SYNC_IN_SENDING);
            }
            let stub = &mut self.slots[i];
            stub.serializer = None;
            if let Some(bundle) = &mut stub.bundle {
                bundle.flags.remove(MessageFlags::STARTED_SEND);
                bundle.flags.insert(MessageFlags::DONE_SEND);
            }
            if self.slots[i].flags().is_waiting_response() {
                self.slots[i].status = InnerStatus::Waiting;
            } else {
                self.order.erase(&mut self.slots, index);
                self.complete_slot(index, None, None, completions);
            }
            self.try_move_pending_to_sending(config);
        } else {
            let stub = &mut self.slots[i];
            stub.packet_count += 1;
            if stub.packet_count as usize >= config.writer.max_message_continuous_packet_count {
                // Give another message airtime.
                stub.packet_count = 0;
                let front = self.sending.pop_front(&mut self.slots);
                self.sending.push_back(&mut self.slots, front);
            }
        }
    }

    /// Fairness: promote the pending head when a seat frees, or the first
    /// asynchronous pending message when the head is a blocked synchronous one.
    fn try_move_pending_to_sending(&mut self, config: &Config) {
        if self.pending.is_empty()
            || self.sending.len() >= config.writer.max_message_count_multiplex
        {
            return;
        }
        let front = self.pending.front();
        let i = front as usize;
        let is_stop = self.slots[i].is_stop();
        let is_sync = self.slots[i].flags().is_synchronous();
        let promotable = if is_stop {
            self.sending.is_empty()
        } else {
            !is_sync || !self.flags.contains(WriterFlags::SYNC_IN_SENDING)
        };
        if promotable {
            self.pending.pop_front(&mut self.slots);
            self.sending.push_back(&mut self.slots, front);
            self.slots[i].status = InnerStatus::Sending;
            if !is_stop && is_sync {
                self.flags.insert(WriterFlags::SYNC_IN_SENDING);
            }
            return;
        }

        if !self.flags.contains(WriterFlags::ASYNC_IN_PENDING) {
            return;
        }
        // The head is synchronous and blocked. Rotate the whole pending list
        // once, pulling out the first asynchronous message while keeping the
        // relative order of everything else.
        let mut remaining = self.pending.len();
        let mut async_index = INVALID_INDEX;
        let mut has_more_async = false;
        while remaining > 0 {
            remaining -= 1;
            let index = self.pending.pop_front(&mut self.slots);
            let slot = &self.slots[index as usize];
            let keep_queued = slot.is_stop() || slot.flags().is_synchronous();
            if keep_queued {
                self.pending.push_back(&mut self.slots, index);
            } else if async_index != INVALID_INDEX {
                has_more_async = true;
                self.pending.push_back(&mut self.slots, index);
            } else {
                async_index = index;
            }
        }
        self.flags.set(WriterFlags::ASYNC_IN_PENDING, has_more_async);
        if async_index != INVALID_INDEX {
            self.sending.push_back(&mut self.slots, async_index);
            self.slots[async_index as usize].status = InnerStatus::Sending;
        }
    }

    fn recompute_sync_flag(&mut self) {
        let mut index = self.sending.front();
        let mut any = false;
        while index != INVALID_INDEX {
            let slot = &self.slots[index as usize];
            if !slot.is_stop() && !slot.is_canceled() && slot.flags().is_synchronous() {
                any = true;
                break;
            }
            index = self.sending.next_of(&self.slots, index);
        }
        self.flags.set(WriterFlags::SYNC_IN_SENDING, any);
    }

    /// Move the bundle out as a completion record and recycle the slot.
    /// The slot must already be off the order and status lists.
    fn complete_slot(
        &mut self,
        index: u32,
        response: Option<Box<dyn AnyMessage>>,
        error: Option<Error>,
        completions: &mut Vec<WriterCompletion>,
    ) {
        let i = index as usize;
        let request_id = RequestId::new(index, self.slots[i].unique);
        let pool_msg_id = self.slots[i].pool_msg_id;
        if let Some(bundle) = self.slots[i].bundle.take() {
            completions.push(WriterCompletion {
                bundle,
                pool_msg_id,
                request_id,
                response,
                error,
            });
        }
        self.unprepare_slot(index);
    }

    fn unprepare_slot(&mut self, index: u32) {
        let i = index as usize;
        let stub = &mut self.slots[i];
        stub.bundle = None;
        stub.unique = stub.unique.wrapping_add(1);
        stub.packet_count = 0;
        stub.serializer = None;
        if stub.pool_msg_id.is_valid() {
            stub.status = InnerStatus::Completing;
            self.cached.push_back(&mut self.slots, index);
        } else {
            stub.status = InnerStatus::Invalid;
            self.cached.push_front(&mut self.slots, index);
        }
    }

    /// Release pool message ids of completed slots back to the caller.
    pub fn visit_completing_messages(&mut self, mut visit: impl FnMut(MessageId)) {
        loop {
            let back = self.cached.back();
            if back == INVALID_INDEX
                || self.slots[back as usize].status != InnerStatus::Completing
            {
                return;
            }
            visit(self.slots[back as usize].pool_msg_id);
            self.slots[back as usize].pool_msg_id = MessageId::INVALID;
            self.slots[back as usize].status = InnerStatus::Invalid;
            let index = self.cached.pop_back(&mut self.slots);
            self.cached.push_front(&mut self.slots, index);
        }
    }

    /// Iterate every live bundle in submission order.
    pub fn visit_all_messages(&mut self, mut visit: impl FnMut(&MessageBundle, MessageId)) {
        let mut index = self.order.front();
        while index != INVALID_INDEX {
            if let Some(bundle) = &self.slots[index as usize].bundle {
                visit(bundle, self.slots[index as usize].pool_msg_id);
            }
            index = self.order.next_of(&self.slots, index);
        }
    }

    /// Pull out every message the pool may redeliver on another connection:
    /// unsent non-one-shot messages and fully-sent idempotent response
    /// waiters, in submission order.
    pub fn take_retriables(&mut self) -> Vec<(MessageBundle, MessageId)> {
        let mut retriables = Vec::new();
        let mut index = self.order.front();
        while index != INVALID_INDEX {
            let next = self.order.next_of(&self.slots, index);
            let i = index as usize;
            let retriable = match &self.slots[i].bundle {
                None => false,
                Some(bundle) if bundle.flags.is_canceled() => false,
                Some(bundle) if bundle.flags.contains(MessageFlags::DONE_SEND) => {
                    bundle.flags.is_idempotent()
                }
                Some(bundle) => !bundle.flags.is_one_shot(),
            };
            if retriable {
                match self.slots[i].status {
                    InnerStatus::Pending => self.pending.erase(&mut self.slots, index),
                    InnerStatus::Sending => self.sending.erase(&mut self.slots, index),
                    _ => {}
                }
                self.order.erase(&mut self.slots, index);
                let pool_msg_id = self.slots[i].pool_msg_id;
                let mut bundle = self.slots[i].bundle.take().expect("checked above");
                bundle.flags.remove(MessageFlags::STARTED_SEND | MessageFlags::DONE_SEND);
                // Pool keeps the message id alive across the retry.
                self.slots[i].pool_msg_id = MessageId::INVALID;
                self.unprepare_slot(index);
                retriables.push((bundle, pool_msg_id));
            }
            index = next;
        }
        self.recompute_sync_flag();
        retriables
    }

    /// Complete every remaining message with `error`; canceled leftovers
    /// complete as canceled. Leaves the writer empty.
    pub fn complete_all_messages(
        &mut self,
        error_for: impl Fn(&MessageBundle) -> Error,
        completions: &mut Vec<WriterCompletion>,
    ) {
        loop {
            let index = self.order.front();
            if index == INVALID_INDEX {
                break;
            }
            let i = index as usize;
            match self.slots[i].status {
                InnerStatus::Pending => self.pending.erase(&mut self.slots, index),
                InnerStatus::Sending => self.sending.erase(&mut self.slots, index),
                _ => {}
            }
            self.order.erase(&mut self.slots, index);
            if self.slots[i].bundle.is_some() {
                let error = {
                    let bundle = self.slots[i].bundle.as_ref().expect("checked above");
                    if bundle.flags.is_canceled() {
                        Error::MessageCanceled
                    } else {
                        error_for(bundle)
                    }
                };
                self.complete_slot(index, None, Some(error), completions);
            } else {
                self.unprepare_slot(index);
            }
        }
        self.flags.remove(WriterFlags::SYNC_IN_SENDING | WriterFlags::ASYNC_IN_PENDING);
    }

    #[cfg(test)]
    pub fn check_invariants(&self, config: &Config) {
        let waiting = self
            .slots
            .iter()
            .filter(|s| s.status == InnerStatus::Waiting)
            .count();
        // Every slot is in exactly one status list, except response waiters
        // which hold their seat through the order list alone.
        assert_eq!(
            self.pending.len() + self.sending.len() + self.cached.len() + waiting,
            self.slots.len(),
            "status lists plus waiters must partition the slot vector"
        );
        // All non-cached slots are in the order list.
        assert_eq!(
            self.order.len(),
            self.pending.len() + self.sending.len() + waiting,
            "order list must hold every pending/sending/waiting slot"
        );
        assert!(
            self.sending.len() <= config.writer.max_message_count_multiplex,
            "sending list exceeded the multiplex cap"
        );
        let sync_sending = {
            let mut count = 0;
            let mut index = self.sending.front();
            while index != INVALID_INDEX {
                let slot = &self.slots[index as usize];
                if !slot.is_stop() && !slot.is_canceled() && slot.flags().is_synchronous() {
                    count += 1;
                }
                index = self.sending.next_of(&self.slots, index);
            }
            count
        };
        assert!(sync_sending <= 1, "more than one synchronous slot in sending");
    }
}

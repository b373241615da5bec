// ABOUTME: Message reader: decodes packets from a byte buffer into completed messages
// ABOUTME: Keeps one partially-assembled message per slot in a bounded FIFO mirroring the writer

use std::collections::VecDeque;
use std::io::Cursor;

use bytes::BytesMut;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::message::{AnyMessage, MessageHeader};
use crate::packet::{MAX_PACKET_DATA_SIZE, PacketHeader, PacketType};
use crate::protocol::{Protocol, TypeId, check_value_with_crc};

/// What the reader delivers while consuming input.
pub(crate) enum ReadEvent {
    Message {
        type_id: TypeId,
        header: MessageHeader,
        message: Box<dyn AnyMessage>,
    },
    KeepAlive,
}

#[derive(Default)]
struct VarintAccum {
    value: u32,
    shift: u32,
}

impl VarintAccum {
    /// Feed bytes; returns `(consumed, Some(value))` once the integer is whole.
    fn feed(&mut self, input: &[u8]) -> Result<(usize, Option<u32>)> {
        let mut pos = 0;
        while pos < input.len() {
            if self.shift > 28 {
                return Err(Error::Deserializer("variable-length integer overflow".into()));
            }
            let byte = input[pos];
            pos += 1;
            self.value |= ((byte & 0x7f) as u32) << self.shift;
            self.shift += 7;
            if byte & 0x80 == 0 {
                return Ok((pos, Some(self.value)));
            }
        }
        Ok((pos, None))
    }
}

enum Stage {
    TypeId(VarintAccum),
    Length(VarintAccum),
    Body { need: usize, buf: BytesMut },
}

/// Incremental per-slot deserializer.
///
/// Consumes the fragment stream of one message: CRC-wrapped type id, then a
/// CRC-wrapped length prefix, then that many payload bytes which are parsed
/// as message header plus user payload once complete. Reusable between
/// messages via `reset`.
pub(crate) struct MessageDeserializer {
    stage: Stage,
    type_id: TypeId,
    started: bool,
}

impl MessageDeserializer {
    fn new() -> Self {
        Self {
            stage: Stage::TypeId(VarintAccum::default()),
            type_id: TypeId(0),
            started: false,
        }
    }

    fn reset(&mut self) {
        self.stage = Stage::TypeId(VarintAccum::default());
        self.type_id = TypeId(0);
        self.started = false;
    }

    fn started(&self) -> bool {
        self.started
    }

    /// Consume bytes from `input`; returns `(consumed, Some(event))` when the
    /// message finished.
    fn run(
        &mut self,
        input: &[u8],
        protocol: &Protocol,
    ) -> Result<(usize, Option<(TypeId, MessageHeader, Box<dyn AnyMessage>)>)> {
        let mut pos = 0;
        loop {
            match &mut self.stage {
                Stage::TypeId(accum) => {
                    let (consumed, value) = accum.feed(&input[pos..])?;
                    pos += consumed;
                    self.started |= consumed > 0;
                    let Some(wire) = value else {
                        return Ok((pos, None));
                    };
                    let raw = check_value_with_crc(wire)?;
                    let type_id = TypeId(
                        u16::try_from(raw)
                            .map_err(|_| Error::Deserializer("type id out of range".into()))?,
                    );
                    if !protocol.is_registered(type_id) {
                        return Err(Error::Deserializer(format!(
                            "unknown message type id {}",
                            type_id.0
                        )));
                    }
                    self.type_id = type_id;
                    self.stage = Stage::Length(VarintAccum::default());
                }
                Stage::Length(accum) => {
                    let (consumed, value) = accum.feed(&input[pos..])?;
                    pos += consumed;
                    let Some(wire) = value else {
                        return Ok((pos, None));
                    };
                    let need = check_value_with_crc(wire)? as usize;
                    self.stage = Stage::Body {
                        need,
                        buf: BytesMut::with_capacity(need.min(MAX_PACKET_DATA_SIZE)),
                    };
                }
                Stage::Body { need, buf } => {
                    let take = (*need - buf.len()).min(input.len() - pos);
                    buf.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    if buf.len() < *need {
                        return Ok((pos, None));
                    }
                    let data = buf.split().freeze();
                    let mut cursor = Cursor::new(data.as_ref());
                    let header = MessageHeader::decode(&mut cursor)?;
                    let message = protocol.decode(self.type_id, &mut cursor)?;
                    if (cursor.position() as usize) < data.len() {
                        return Err(Error::Deserializer("trailing bytes after message".into()));
                    }
                    let type_id = self.type_id;
                    self.reset();
                    return Ok((pos, Some((type_id, header, message))));
                }
            }
        }
    }
}

#[derive(Default)]
struct ReaderSlot {
    deserializer: Option<MessageDeserializer>,
    packet_count: u32,
}

impl ReaderSlot {
    fn in_progress(&self) -> bool {
        self.deserializer.as_ref().is_some_and(|d| d.started())
    }

    fn clear(&mut self) {
        if let Some(deserializer) = &mut self.deserializer {
            deserializer.reset();
        }
        self.packet_count = 0;
    }
}

/// Decodes a stream of packets into completed messages.
///
/// The slot FIFO mirrors the peer writer's rotation discipline: a
/// switch-to-new rotates the current slot to the back, a switch-to-old brings
/// the oldest paused slot to the front. Overflowing
/// `max_message_count_multiplex` is a protocol error.
pub(crate) struct MessageReader {
    slots: VecDeque<ReaderSlot>,
    decompress_buf: Vec<u8>,
}

impl MessageReader {
    pub fn new() -> Self {
        Self {
            slots: VecDeque::new(),
            decompress_buf: Vec::new(),
        }
    }

    /// Seed the slot FIFO with one empty slot. Idempotent.
    pub fn prepare(&mut self, _config: &Config) {
        if self.slots.is_empty() {
            self.slots.push_back(ReaderSlot::default());
        }
    }

    pub fn unprepare(&mut self) {
        self.slots.clear();
        self.decompress_buf = Vec::new();
    }

    /// Drive the parse loop over `buf`, pushing completed messages and
    /// keep-alives into `events`. Returns the number of bytes consumed; the
    /// caller keeps any unread suffix for the next call.
    pub fn read(
        &mut self,
        buf: &[u8],
        config: &Config,
        protocol: &Protocol,
        events: &mut Vec<ReadEvent>,
    ) -> Result<usize> {
        let mut pos = 0;
        loop {
            if buf.len() - pos < PacketHeader::SIZE {
                break;
            }
            let header = PacketHeader::load(&buf[pos..])?;
            if buf.len() - pos - PacketHeader::SIZE < header.size() {
                break;
            }
            pos += PacketHeader::SIZE;
            let payload = &buf[pos..pos + header.size()];
            pos += header.size();

            if header.is_keep_alive() {
                events.push(ReadEvent::KeepAlive);
                continue;
            }
            self.consume_packet(header, payload, config, protocol, events)?;
        }
        Ok(pos)
    }

    fn consume_packet(
        &mut self,
        header: PacketHeader,
        payload: &[u8],
        config: &Config,
        protocol: &Protocol,
        events: &mut Vec<ReadEvent>,
    ) -> Result<()> {
        // Rebase onto the decompression scratch when the payload is packed.
        let mut scratch = std::mem::take(&mut self.decompress_buf);
        let result = (|| {
            let data: &[u8] = if header.is_compressed() {
                let decompress = config.reader.decompress_fnc.as_ref().ok_or_else(|| {
                    Error::Deserializer("compressed packet without decompress hook".into())
                })?;
                scratch.resize(MAX_PACKET_DATA_SIZE, 0);
                let len = decompress(&mut scratch, payload)?;
                if len > MAX_PACKET_DATA_SIZE {
                    return Err(Error::Deserializer("decompressed payload too large".into()));
                }
                &scratch[..len]
            } else {
                payload
            };
            self.consume_fragments(header.packet_type(), data, config, protocol, events)
        })();
        self.decompress_buf = scratch;
        result
    }

    fn consume_fragments(
        &mut self,
        first: PacketType,
        data: &[u8],
        config: &Config,
        protocol: &Protocol,
        events: &mut Vec<ReadEvent>,
    ) -> Result<()> {
        let mut control = first;
        let mut pos = 0;
        loop {
            let canceled = match control {
                PacketType::SwitchToNewMessage => {
                    if self.front_in_progress() {
                        if self.slots.len() >= config.reader.max_message_count_multiplex {
                            return Err(Error::TooManyMultiplexedMessages);
                        }
                        self.rotate_front_to_back();
                    }
                    let slot = self.front_mut();
                    slot.packet_count = 0;
                    match &mut slot.deserializer {
                        Some(deserializer) => deserializer.reset(),
                        None => slot.deserializer = Some(MessageDeserializer::new()),
                    }
                    false
                }
                PacketType::SwitchToOldMessage => {
                    self.switch_to_old()?;
                    if !self.front_in_progress() {
                        return Err(Error::InvalidMessageSwitch(control as u8));
                    }
                    false
                }
                PacketType::ContinuedMessage => {
                    if !self.front_in_progress() {
                        return Err(Error::InvalidMessageSwitch(control as u8));
                    }
                    self.front_mut().packet_count += 1;
                    false
                }
                PacketType::SwitchToOldCanceledMessage => {
                    self.switch_to_old()?;
                    self.front_mut().clear();
                    true
                }
                PacketType::ContinuedCanceledMessage => {
                    self.front_mut().clear();
                    true
                }
                PacketType::KeepAlive => {
                    return Err(Error::InvalidMessageSwitch(control as u8));
                }
            };

            if !canceled {
                let slot = self.front_mut();
                let deserializer = slot
                    .deserializer
                    .as_mut()
                    .ok_or(Error::Logic("slot without deserializer"))?;
                let (consumed, done) = deserializer.run(&data[pos..], protocol)?;
                pos += consumed;
                if let Some((type_id, header, message)) = done {
                    events.push(ReadEvent::Message {
                        type_id,
                        header,
                        message,
                    });
                    self.front_mut().clear();
                }
            }

            if pos >= data.len() {
                return Ok(());
            }
            control = PacketType::try_from(data[pos])
                .map_err(|_| Error::InvalidMessageSwitch(data[pos]))?;
            pos += 1;
        }
    }

    fn front_mut(&mut self) -> &mut ReaderSlot {
        if self.slots.is_empty() {
            self.slots.push_back(ReaderSlot::default());
        }
        self.slots.front_mut().expect("slot queue is never empty")
    }

    fn front_in_progress(&self) -> bool {
        self.slots.front().is_some_and(ReaderSlot::in_progress)
    }

    /// Move the current slot's state to the back and leave a fresh front.
    fn rotate_front_to_back(&mut self) {
        let taken = std::mem::take(self.front_mut());
        self.slots.push_back(taken);
    }

    /// Bring the oldest paused slot to the front.
    fn switch_to_old(&mut self) -> Result<()> {
        if self.front_in_progress() {
            self.rotate_front_to_back();
        }
        self.slots.pop_front();
        if self.slots.is_empty() {
            return Err(Error::InvalidMessageSwitch(
                PacketType::SwitchToOldMessage as u8,
            ));
        }
        Ok(())
    }
}

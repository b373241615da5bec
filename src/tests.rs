//! Integration tests: writer/reader pairing at the protocol level and full
//! client/server flows over loopback TCP.

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{BufMut, BytesMut};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::message::{MessageBundle, MessageFlags, MessageId, downcast_message};
use crate::protocol::{
    Protocol, ProtocolBuilder, Serializable, decode_string, decode_u8, decode_u32, encode_string,
    encode_u8, encode_u32,
};
use crate::reader::{MessageReader, ReadEvent};
use crate::writer::{MessageWriter, WriterCompletion};

#[derive(Debug, Clone, PartialEq)]
struct Text {
    body: String,
}

impl Serializable for Text {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        encode_string(buf, &self.body);
        Ok(())
    }

    fn decode(buf: &mut Cursor<&[u8]>) -> Result<Self> {
        Ok(Self {
            body: decode_string(buf)?,
        })
    }
}

/// Large patterned payload: carries only seed and length, the payload bytes
/// are generated on encode and verified on decode.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Chunky {
    seed: u8,
    len: u32,
}

impl Serializable for Chunky {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        encode_u8(buf, self.seed);
        encode_u32(buf, self.len);
        buf.reserve(self.len as usize);
        for i in 0..self.len {
            buf.put_u8(self.seed.wrapping_add(i as u8));
        }
        Ok(())
    }

    fn decode(buf: &mut Cursor<&[u8]>) -> Result<Self> {
        let seed = decode_u8(buf)?;
        let len = decode_u32(buf)?;
        for i in 0..len {
            let byte = decode_u8(buf)?;
            if byte != seed.wrapping_add(i as u8) {
                return Err(Error::Deserializer(format!(
                    "payload corrupted at offset {i}"
                )));
            }
        }
        Ok(Self { seed, len })
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Req {
    index: u32,
    body: String,
}

impl Serializable for Req {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        encode_u32(buf, self.index);
        encode_string(buf, &self.body);
        Ok(())
    }

    fn decode(buf: &mut Cursor<&[u8]>) -> Result<Self> {
        Ok(Self {
            index: decode_u32(buf)?,
            body: decode_string(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Resp {
    index: u32,
    body: String,
}

impl Serializable for Resp {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        encode_u32(buf, self.index);
        encode_string(buf, &self.body);
        Ok(())
    }

    fn decode(buf: &mut Cursor<&[u8]>) -> Result<Self> {
        Ok(Self {
            index: decode_u32(buf)?,
            body: decode_string(buf)?,
        })
    }
}

mod protocol_flow {
    use super::*;

    fn silent_protocol() -> Arc<Protocol> {
        ProtocolBuilder::new()
            .register::<Text, _>(|_, _, _, _| {})
            .register::<Chunky, _>(|_, _, _, _| {})
            .register::<Req, _>(|_, _, _, _| {})
            .register::<Resp, _>(|_, _, _, _| {})
            .build()
    }

    fn bundle<M: Serializable>(
        protocol: &Protocol,
        message: M,
        flags: MessageFlags,
    ) -> MessageBundle {
        let type_id = protocol.type_id_of::<M>().unwrap();
        MessageBundle::new(type_id, flags, Box::new(message))
    }

    /// Pump the writer's output straight into the reader until the writer
    /// runs dry, collecting the delivered events.
    fn drive(
        writer: &mut MessageWriter,
        reader: &mut MessageReader,
        config: &Config,
        protocol: &Protocol,
        completions: &mut Vec<WriterCompletion>,
    ) -> Result<Vec<ReadEvent>> {
        let mut events = Vec::new();
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let produced = writer.write(&mut buf, false, config, protocol, completions)?;
            if produced == 0 {
                break;
            }
            let consumed = reader.read(&buf[..produced], config, protocol, &mut events)?;
            assert_eq!(consumed, produced, "reader left whole packets unconsumed");
            writer.check_invariants(config);
        }
        Ok(events)
    }

    fn chunky_seeds(events: &[ReadEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|event| match event {
                ReadEvent::Message { message, .. } => message
                    .as_any()
                    .downcast_ref::<Chunky>()
                    .map(|chunky| chunky.seed),
                ReadEvent::KeepAlive => None,
            })
            .collect()
    }

    #[test]
    fn multiplexed_roundtrip() {
        let protocol = silent_protocol();
        let mut config = Config::default();
        config.writer.max_message_continuous_packet_count = 1;
        let mut writer = MessageWriter::new();
        let mut reader = MessageReader::new();
        reader.prepare(&config);
        let mut completions = Vec::new();

        for (seed, len) in [(1u8, 100_000u32), (2, 60_000), (3, 30_000), (4, 5_000)] {
            writer
                .enqueue(
                    &config,
                    bundle(&protocol, Chunky { seed, len }, MessageFlags::empty()),
                    MessageId::INVALID,
                )
                .map_err(|(error, _)| error)
                .unwrap();
        }
        writer.check_invariants(&config);

        let events = drive(&mut writer, &mut reader, &config, &protocol, &mut completions)
            .unwrap();

        let mut seeds = chunky_seeds(&events);
        seeds.sort_unstable();
        assert_eq!(seeds, vec![1, 2, 3, 4]);
        assert!(writer.is_empty());

        // No response waiters: every message completed on send, successfully.
        assert_eq!(completions.len(), 4);
        assert!(completions.iter().all(|c| c.error.is_none()));
    }

    #[test]
    fn synchronous_messages_keep_total_order() {
        let protocol = silent_protocol();
        let mut config = Config::default();
        config.writer.max_message_continuous_packet_count = 1;
        config.writer.max_message_count_multiplex = 2;
        let mut writer = MessageWriter::new();
        let mut reader = MessageReader::new();
        reader.prepare(&config);
        let mut completions = Vec::new();

        // sync 1 is large; a small async message fills the second seat; the
        // second sync must wait for the first, while the pending async one
        // may overtake it.
        let messages = [
            (1u8, 120_000u32, MessageFlags::SYNCHRONOUS),
            (2, 1_000, MessageFlags::empty()),
            (3, 1_000, MessageFlags::SYNCHRONOUS),
            (4, 1_000, MessageFlags::empty()),
        ];
        for (seed, len, flags) in messages {
            writer
                .enqueue(
                    &config,
                    bundle(&protocol, Chunky { seed, len }, flags),
                    MessageId::INVALID,
                )
                .map_err(|(error, _)| error)
                .unwrap();
            writer.check_invariants(&config);
        }

        let events = drive(&mut writer, &mut reader, &config, &protocol, &mut completions)
            .unwrap();
        let seeds = chunky_seeds(&events);
        assert_eq!(seeds.len(), 4);

        let position = |seed: u8| seeds.iter().position(|s| *s == seed).unwrap();
        assert!(
            position(1) < position(3),
            "second synchronous message overtook the first: {seeds:?}"
        );
        // The pending async message got promoted past the blocked sync one.
        assert!(position(4) < position(3), "fairness walk skipped: {seeds:?}");
    }

    #[test]
    fn cancel_before_any_bytes() {
        let protocol = silent_protocol();
        let config = Config::default();
        let mut writer = MessageWriter::new();
        let mut reader = MessageReader::new();
        reader.prepare(&config);
        let mut completions = Vec::new();

        writer
            .enqueue(
                &config,
                bundle(&protocol, Chunky { seed: 1, len: 1000 }, MessageFlags::empty()),
                MessageId::INVALID,
            )
            .map_err(|(error, _)| error)
            .unwrap();
        let request_id = writer
            .enqueue(
                &config,
                bundle(&protocol, Chunky { seed: 2, len: 1000 }, MessageFlags::empty()),
                MessageId::INVALID,
            )
            .map_err(|(error, _)| error)
            .unwrap();

        writer.cancel(request_id, &mut completions).unwrap();
        writer.check_invariants(&config);
        assert_eq!(completions.len(), 1);
        assert!(matches!(completions[0].error, Some(Error::MessageCanceled)));

        let events = drive(&mut writer, &mut reader, &config, &protocol, &mut completions)
            .unwrap();
        assert_eq!(chunky_seeds(&events), vec![1]);

        // Cancel of an unknown id reports the miss.
        assert!(matches!(
            writer.cancel(request_id, &mut completions),
            Err(Error::MessageInexistent)
        ));
    }

    #[test]
    fn cancel_mid_send_discards_on_the_peer() {
        let protocol = silent_protocol();
        let config = Config::default();
        let mut writer = MessageWriter::new();
        let mut reader = MessageReader::new();
        reader.prepare(&config);
        let mut completions = Vec::new();
        let mut events = Vec::new();

        let request_id = writer
            .enqueue(
                &config,
                bundle(
                    &protocol,
                    Chunky {
                        seed: 9,
                        len: 100_000,
                    },
                    MessageFlags::empty(),
                ),
                MessageId::INVALID,
            )
            .map_err(|(error, _)| error)
            .unwrap();

        // One partial pass, then cancel while bytes are on the wire.
        let mut buf = vec![0u8; 8 * 1024];
        let produced = writer
            .write(&mut buf, false, &config, &protocol, &mut completions)
            .unwrap();
        assert!(produced > 0);
        reader
            .read(&buf[..produced], &config, &protocol, &mut events)
            .unwrap();
        assert!(events.is_empty());

        writer.cancel(request_id, &mut completions).unwrap();
        writer.check_invariants(&config);
        // Completion is deferred until the canceled tail marker is emitted.
        assert!(completions.is_empty());

        let tail = drive(&mut writer, &mut reader, &config, &protocol, &mut completions)
            .unwrap();
        assert!(chunky_seeds(&tail).is_empty());
        assert_eq!(completions.len(), 1);
        assert!(matches!(completions[0].error, Some(Error::MessageCanceled)));

        // The reader slot is clean and reusable.
        completions.clear();
        writer
            .enqueue(
                &config,
                bundle(&protocol, Chunky { seed: 5, len: 500 }, MessageFlags::empty()),
                MessageId::INVALID,
            )
            .map_err(|(error, _)| error)
            .unwrap();
        let fresh = drive(&mut writer, &mut reader, &config, &protocol, &mut completions)
            .unwrap();
        assert_eq!(chunky_seeds(&fresh), vec![5]);
    }

    #[test]
    fn request_response_correlation() {
        let protocol = silent_protocol();
        let config = Config::default();
        let mut client_writer = MessageWriter::new();
        let mut server_writer = MessageWriter::new();
        let mut client_reader = MessageReader::new();
        let mut server_reader = MessageReader::new();
        client_reader.prepare(&config);
        server_reader.prepare(&config);
        let mut completions = Vec::new();

        let sent_request_id = client_writer
            .enqueue(
                &config,
                bundle(
                    &protocol,
                    Req {
                        index: 7,
                        body: "ping".into(),
                    },
                    MessageFlags::WAIT_RESPONSE,
                ),
                MessageId::INVALID,
            )
            .map_err(|(error, _)| error)
            .unwrap();

        // Client -> server: the request is fully sent but still waiting.
        let events = drive(
            &mut client_writer,
            &mut server_reader,
            &config,
            &protocol,
            &mut completions,
        )
        .unwrap();
        assert!(completions.is_empty());
        assert_eq!(client_writer.live_count(), 1);

        let mut events = events.into_iter();
        let Some(ReadEvent::Message {
            header, message, ..
        }) = events.next()
        else {
            panic!("request did not arrive");
        };
        assert_eq!(header.request_id, sent_request_id);
        assert!(header.flags.is_waiting_response());
        let request = downcast_message::<Req>(message).unwrap();
        assert_eq!(request.index, 7);

        // Server -> client: the response carries the request id back.
        let mut response = bundle(
            &protocol,
            Resp {
                index: request.index,
                body: request.body.clone(),
            },
            MessageFlags::RESPONSE,
        );
        response.peer_request_id = header.request_id;
        server_writer
            .enqueue(&config, response, MessageId::INVALID)
            .map_err(|(error, _)| error)
            .unwrap();

        let events = drive(
            &mut server_writer,
            &mut client_reader,
            &config,
            &protocol,
            &mut completions,
        )
        .unwrap();
        let mut events = events.into_iter();
        let Some(ReadEvent::Message {
            header: response_header,
            message: response_message,
            ..
        }) = events.next()
        else {
            panic!("response did not arrive");
        };
        assert!(response_header.flags.is_response());
        assert_eq!(response_header.request_id, sent_request_id);

        completions.clear();
        assert!(client_writer.complete_message(
            response_header.request_id,
            Some(response_message),
            &mut completions
        ));
        assert_eq!(completions.len(), 1);
        let completion = completions.pop().unwrap();
        assert!(completion.error.is_none());
        let resp = downcast_message::<Resp>(completion.response.unwrap()).unwrap();
        assert_eq!(resp.index, 7);
        assert_eq!(resp.body, "ping");
        assert_eq!(client_writer.live_count(), 0);

        // A second response for the same id has nobody waiting.
        assert!(!client_writer.complete_message(
            response_header.request_id,
            None,
            &mut completions
        ));
    }

    #[test]
    fn delayed_close_drains_queued_traffic_first() {
        let protocol = silent_protocol();
        let config = Config::default();
        let mut writer = MessageWriter::new();
        let mut reader = MessageReader::new();
        reader.prepare(&config);
        let mut completions = Vec::new();

        writer
            .enqueue(
                &config,
                bundle(&protocol, Chunky { seed: 1, len: 40_000 }, MessageFlags::empty()),
                MessageId::INVALID,
            )
            .map_err(|(error, _)| error)
            .unwrap();
        writer.enqueue_close().unwrap();
        assert!(matches!(
            writer.enqueue_close(),
            Err(Error::DelayedClosePending)
        ));
        assert!(matches!(
            writer
                .enqueue(
                    &config,
                    bundle(&protocol, Chunky { seed: 2, len: 10 }, MessageFlags::empty()),
                    MessageId::INVALID,
                )
                .map_err(|(error, _)| error),
            Err(Error::DelayedClosePending)
        ));

        // The queued message drains fully...
        let mut buf = vec![0u8; 16 * 1024];
        let mut events = Vec::new();
        let error = loop {
            match writer.write(&mut buf, false, &config, &protocol, &mut completions) {
                Ok(produced) => {
                    assert!(produced > 0, "writer stalled before the close sentinel");
                    reader
                        .read(&buf[..produced], &config, &protocol, &mut events)
                        .unwrap();
                }
                Err(error) => break error,
            }
        };
        // ...then the close fires.
        assert!(matches!(error, Error::ConnectionDelayedClosed));
        assert_eq!(chunky_seeds(&events), vec![1]);
        assert_eq!(completions.len(), 1);
        assert!(completions[0].error.is_none());
    }

    #[test]
    fn keep_alive_only_when_idle() {
        let protocol = silent_protocol();
        let config = Config::default();
        let mut writer = MessageWriter::new();
        let mut reader = MessageReader::new();
        reader.prepare(&config);
        let mut completions = Vec::new();
        let mut buf = vec![0u8; 16 * 1024];

        // With real traffic queued, no keep-alive packet sneaks in.
        writer
            .enqueue(
                &config,
                bundle(&protocol, Chunky { seed: 1, len: 100 }, MessageFlags::empty()),
                MessageId::INVALID,
            )
            .map_err(|(error, _)| error)
            .unwrap();
        let produced = writer
            .write(&mut buf, true, &config, &protocol, &mut completions)
            .unwrap();
        let mut events = Vec::new();
        reader
            .read(&buf[..produced], &config, &protocol, &mut events)
            .unwrap();
        assert!(
            events
                .iter()
                .all(|event| !matches!(event, ReadEvent::KeepAlive))
        );

        // Idle writer with the keep-alive flag: exactly one 4-byte packet.
        let produced = writer
            .write(&mut buf, true, &config, &protocol, &mut completions)
            .unwrap();
        assert_eq!(produced, 4);
        let mut events = Vec::new();
        reader
            .read(&buf[..produced], &config, &protocol, &mut events)
            .unwrap();
        assert!(matches!(events.as_slice(), [ReadEvent::KeepAlive]));

        // Idle writer without the flag: silence.
        let produced = writer
            .write(&mut buf, false, &config, &protocol, &mut completions)
            .unwrap();
        assert_eq!(produced, 0);
    }

    #[test]
    fn retriable_classification_on_teardown() {
        let protocol = silent_protocol();
        let config = Config::default();
        let mut completions = Vec::new();

        // Nothing sent yet: plain messages are retriable, one-shots are not.
        let mut writer = MessageWriter::new();
        writer
            .enqueue(
                &config,
                bundle(&protocol, Chunky { seed: 1, len: 100 }, MessageFlags::empty()),
                MessageId::new(0, 0),
            )
            .map_err(|(error, _)| error)
            .unwrap();
        writer
            .enqueue(
                &config,
                bundle(&protocol, Chunky { seed: 2, len: 100 }, MessageFlags::ONE_SHOT),
                MessageId::new(1, 0),
            )
            .map_err(|(error, _)| error)
            .unwrap();
        let retriables = writer.take_retriables();
        assert_eq!(retriables.len(), 1);
        assert_eq!(retriables[0].1, MessageId::new(0, 0));
        writer.complete_all_messages(|_| Error::MessageFailSend, &mut completions);
        assert_eq!(completions.len(), 1);
        assert!(matches!(completions[0].error, Some(Error::MessageFailSend)));

        // Fully sent and waiting: only idempotent requests survive.
        completions.clear();
        let mut writer = MessageWriter::new();
        let mut reader = MessageReader::new();
        reader.prepare(&config);
        writer
            .enqueue(
                &config,
                bundle(
                    &protocol,
                    Chunky { seed: 3, len: 100 },
                    MessageFlags::WAIT_RESPONSE | MessageFlags::IDEMPOTENT,
                ),
                MessageId::new(2, 0),
            )
            .map_err(|(error, _)| error)
            .unwrap();
        writer
            .enqueue(
                &config,
                bundle(
                    &protocol,
                    Chunky { seed: 4, len: 100 },
                    MessageFlags::WAIT_RESPONSE,
                ),
                MessageId::new(3, 0),
            )
            .map_err(|(error, _)| error)
            .unwrap();
        drive(&mut writer, &mut reader, &config, &protocol, &mut completions).unwrap();
        assert!(completions.is_empty(), "waiters completed prematurely");

        let retriables = writer.take_retriables();
        assert_eq!(retriables.len(), 1);
        assert_eq!(retriables[0].1, MessageId::new(2, 0));
        assert!(!retriables[0].0.flags.contains(MessageFlags::DONE_SEND));

        writer.complete_all_messages(|_| Error::MessageFailSend, &mut completions);
        assert_eq!(completions.len(), 1);
        assert!(matches!(completions[0].error, Some(Error::MessageFailSend)));
    }

    #[test]
    fn visitation_and_oldest_first_drain() {
        let protocol = silent_protocol();
        let config = Config::default();
        let mut writer = MessageWriter::new();
        let mut completions = Vec::new();

        for (seed, message_id) in [(1u8, 10), (2, 11), (3, 12)] {
            writer
                .enqueue(
                    &config,
                    bundle(&protocol, Chunky { seed, len: 50 }, MessageFlags::empty()),
                    MessageId::new(message_id, 0),
                )
                .map_err(|(error, _)| error)
                .unwrap();
        }

        // Visitation walks live bundles in submission order.
        let mut visited = Vec::new();
        writer.visit_all_messages(|_, message_id| visited.push(message_id.index));
        assert_eq!(visited, vec![10, 11, 12]);

        // Draining the oldest repeatedly preserves that order too.
        assert!(writer.cancel_oldest(&mut completions));
        assert!(writer.cancel_oldest(&mut completions));
        assert!(writer.cancel_oldest(&mut completions));
        assert!(!writer.cancel_oldest(&mut completions));
        let drained: Vec<u32> = completions.iter().map(|c| c.pool_msg_id.index).collect();
        assert_eq!(drained, vec![10, 11, 12]);
        assert!(
            completions
                .iter()
                .all(|c| matches!(c.error, Some(Error::MessageCanceled)))
        );
        writer.check_invariants(&config);
    }

    #[test]
    fn cancel_by_pool_id_finds_the_slot() {
        let protocol = silent_protocol();
        let config = Config::default();
        let mut writer = MessageWriter::new();
        let mut completions = Vec::new();

        let pool_msg_id = MessageId::new(77, 0);
        writer
            .enqueue(
                &config,
                bundle(&protocol, Chunky { seed: 1, len: 50 }, MessageFlags::empty()),
                pool_msg_id,
            )
            .map_err(|(error, _)| error)
            .unwrap();

        writer.cancel_by_pool_id(pool_msg_id, &mut completions).unwrap();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].pool_msg_id, pool_msg_id);

        assert!(matches!(
            writer.cancel_by_pool_id(pool_msg_id, &mut completions),
            Err(Error::MessageInexistent)
        ));

        // The pool id is released through the completing walk.
        let mut released = Vec::new();
        writer.visit_completing_messages(|message_id| released.push(message_id));
        assert_eq!(released, vec![pool_msg_id]);
    }

    /// Toy run-length codec: (count, byte) pairs, refusing to "compress"
    /// anything that would grow.
    fn rle_compress(data: &mut [u8]) -> Result<Option<usize>> {
        let mut out = Vec::new();
        let mut iter = data.iter().copied().peekable();
        while let Some(byte) = iter.next() {
            let mut count = 1u8;
            while count < u8::MAX && iter.peek() == Some(&byte) {
                iter.next();
                count += 1;
            }
            out.push(count);
            out.push(byte);
        }
        if out.len() >= data.len() {
            return Ok(None);
        }
        data[..out.len()].copy_from_slice(&out);
        Ok(Some(out.len()))
    }

    fn rle_decompress(out: &mut [u8], data: &[u8]) -> Result<usize> {
        let mut pos = 0;
        for pair in data.chunks(2) {
            let &[count, byte] = pair else {
                return Err(Error::Deserializer("odd run-length stream".into()));
            };
            for _ in 0..count {
                out[pos] = byte;
                pos += 1;
            }
        }
        Ok(pos)
    }

    /// Message whose payload is a long run of one byte, so the toy codec
    /// actually shrinks it.
    struct Runs {
        byte: u8,
        len: u32,
    }

    impl Serializable for Runs {
        fn encode(&self, buf: &mut BytesMut) -> Result<()> {
            encode_u8(buf, self.byte);
            encode_u32(buf, self.len);
            buf.reserve(self.len as usize);
            for _ in 0..self.len {
                buf.put_u8(self.byte);
            }
            Ok(())
        }

        fn decode(buf: &mut Cursor<&[u8]>) -> Result<Self> {
            let byte = decode_u8(buf)?;
            let len = decode_u32(buf)?;
            for _ in 0..len {
                if decode_u8(buf)? != byte {
                    return Err(Error::Deserializer("run corrupted".into()));
                }
            }
            Ok(Self { byte, len })
        }
    }

    #[test]
    fn compressed_packets_roundtrip() {
        let protocol = ProtocolBuilder::new()
            .register::<Runs, _>(|_, _, _, _| {})
            .build();
        let config = Config::default()
            .with_inplace_compress_fnc(Arc::new(rle_compress))
            .with_decompress_fnc(Arc::new(rle_decompress));
        let mut writer = MessageWriter::new();
        let mut reader = MessageReader::new();
        reader.prepare(&config);
        let mut completions = Vec::new();

        writer
            .enqueue(
                &config,
                MessageBundle::new(
                    protocol.type_id_of::<Runs>().unwrap(),
                    MessageFlags::empty(),
                    Box::new(Runs {
                        byte: 0x55,
                        len: 20_000,
                    }),
                ),
                MessageId::INVALID,
            )
            .map_err(|(error, _)| error)
            .unwrap();

        let mut buf = vec![0u8; 64 * 1024];
        let produced = writer
            .write(&mut buf, false, &config, &protocol, &mut completions)
            .unwrap();
        // The run compresses far below its raw size.
        assert!(produced < 20_000, "payload was not compressed: {produced}");

        let mut events = Vec::new();
        let consumed = reader
            .read(&buf[..produced], &config, &protocol, &mut events)
            .unwrap();
        assert_eq!(consumed, produced);
        let runs = events
            .iter()
            .find_map(|event| match event {
                ReadEvent::Message { message, .. } => {
                    message.as_any().downcast_ref::<Runs>().map(|r| r.len)
                }
                ReadEvent::KeepAlive => None,
            })
            .expect("compressed message did not arrive");
        assert_eq!(runs, 20_000);
    }

    #[test]
    fn writer_full() {
        let protocol = silent_protocol();
        let mut config = Config::default();
        config.writer.max_message_count_per_connection = 2;
        let mut writer = MessageWriter::new();

        for seed in 0..2u8 {
            writer
                .enqueue(
                    &config,
                    bundle(&protocol, Chunky { seed, len: 10 }, MessageFlags::empty()),
                    MessageId::INVALID,
                )
                .map_err(|(error, _)| error)
                .unwrap();
        }
        let result = writer.enqueue(
            &config,
            bundle(&protocol, Chunky { seed: 9, len: 10 }, MessageFlags::empty()),
            MessageId::INVALID,
        );
        assert!(matches!(result, Err((Error::WriterFull, _))));
    }
}

mod service_flow {
    use super::*;
    use crate::config::ResolveFn;
    use crate::service::Service;

    fn echo_protocol() -> Arc<Protocol> {
        ProtocolBuilder::new()
            .register::<Text, _>(|ctx, _sent, received, _error| {
                if ctx.is_on_peer() {
                    if let Some(text) = received {
                        let _ = ctx.send_response(Text { body: text.body });
                    }
                }
            })
            .build()
    }

    fn request_protocol() -> Arc<Protocol> {
        ProtocolBuilder::new()
            .register::<Req, _>(|ctx, _sent, received, _error| {
                if ctx.is_on_peer() {
                    if let Some(request) = received {
                        let _ = ctx.send_response(Resp {
                            index: request.index,
                            body: request.body,
                        });
                    }
                }
            })
            .register::<Resp, _>(|_, _, _, _| {})
            .build()
    }

    async fn start_server(config: Config, protocol: Arc<Protocol>) -> (Service, String) {
        let server = Service::new(config.with_listener("127.0.0.1", "0"), protocol);
        let addr = server.start_listener().await.unwrap();
        (server, addr.to_string())
    }

    #[tokio::test]
    async fn echo_roundtrip() {
        let (server, addr) = start_server(Config::default(), echo_protocol()).await;
        let client = Service::new(Config::default(), echo_protocol());

        let (tx, rx) = tokio::sync::oneshot::channel();
        client
            .send_request::<Text, Text, _>(
                &addr,
                Text {
                    body: "hello".into(),
                },
                move |ctx, response, error| {
                    let _ = tx.send((
                        response.map(|r| r.body),
                        error.is_none(),
                        ctx.is_back_on_sender(),
                    ));
                },
                MessageFlags::empty(),
            )
            .unwrap();

        let (body, no_error, back_on_sender) =
            tokio::time::timeout(Duration::from_secs(10), rx)
                .await
                .expect("echo timed out")
                .unwrap();
        assert_eq!(body.as_deref(), Some("hello"));
        assert!(no_error);
        assert!(back_on_sender);

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn sixteen_requests_sixteen_responses() {
        let (server, addr) = start_server(Config::default(), request_protocol()).await;
        let client = Service::new(Config::default(), request_protocol());

        let pattern = |index: u32| format!("pattern-{index}-{}", "x".repeat(index as usize));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for index in 0..16u32 {
            let tx = tx.clone();
            client
                .send_request::<Req, Resp, _>(
                    &addr,
                    Req {
                        index,
                        body: pattern(index),
                    },
                    move |_ctx, response, error| {
                        let _ = tx.send((response.map(|r| (r.index, r.body)), error.is_some()));
                    },
                    MessageFlags::empty(),
                )
                .unwrap();
        }
        drop(tx);

        let mut transfered_count = 0usize;
        for _ in 0..16 {
            let (response, failed) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("request timed out")
                .expect("handler dropped without completing");
            assert!(!failed);
            let (index, body) = response.expect("missing response");
            assert_eq!(body, pattern(index));
            transfered_count += 1;
        }
        assert_eq!(transfered_count, 16);

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn oneshot_fails_fast_and_cancel_reports_the_miss() {
        let client = Service::new(
            Config::default().with_connection_reconnect_timeout_seconds(1),
            echo_protocol(),
        );

        let (tx, rx) = tokio::sync::oneshot::channel();
        let (recipient, message_id) = client
            .send_request::<Text, Text, _>(
                "127.0.0.1:9",
                Text {
                    body: "nobody home".into(),
                },
                move |_ctx, response, error| {
                    let failed_send = matches!(error, Some(Error::MessageFailSend));
                    let _ = tx.send((response.is_none(), failed_send));
                },
                MessageFlags::ONE_SHOT,
            )
            .unwrap();

        let (no_response, failed_send) = tokio::time::timeout(Duration::from_secs(10), rx)
            .await
            .expect("one-shot failure timed out")
            .unwrap();
        assert!(no_response);
        assert!(failed_send);

        // The message is gone; canceling it now reports the miss.
        assert!(matches!(
            client.cancel_message(recipient, message_id),
            Err(Error::MessageInexistent)
        ));

        client.stop().await;
    }

    #[tokio::test]
    async fn keep_alive_bridges_an_idle_gap() {
        let inactivity_fired = Arc::new(AtomicBool::new(false));
        let fired = inactivity_fired.clone();
        let server_config = Config::default()
            .with_connection_inactivity_timeout_seconds(2)
            .with_connection_inactivity_keepalive_count(4)
            .with_connection_stop_fnc(Arc::new(move |_ctx, error| {
                if matches!(error, Some(Error::InactivityTimeout)) {
                    fired.store(true, Ordering::SeqCst);
                }
            }));
        let (server, addr) = start_server(server_config, echo_protocol()).await;

        let client = Service::new(
            Config::default().with_connection_keepalive_timeout_seconds(1),
            echo_protocol(),
        );

        let ask = |body: &str| {
            let (tx, rx) = tokio::sync::oneshot::channel();
            let body = body.to_string();
            client
                .send_request::<Text, Text, _>(
                    &addr,
                    Text { body },
                    move |_ctx, response, error| {
                        let _ = tx.send(error.is_none() && response.is_some());
                    },
                    MessageFlags::empty(),
                )
                .unwrap();
            rx
        };

        let first = ask("first");
        assert!(
            tokio::time::timeout(Duration::from_secs(10), first)
                .await
                .unwrap()
                .unwrap()
        );

        // Idle long enough that the server's inactivity window elapses more
        // than once; the client keep-alives must bridge it.
        tokio::time::sleep(Duration::from_millis(3500)).await;

        let second = ask("second");
        assert!(
            tokio::time::timeout(Duration::from_secs(10), second)
                .await
                .unwrap()
                .unwrap()
        );
        assert!(
            !inactivity_fired.load(Ordering::SeqCst),
            "server dropped the idle connection despite keep-alives"
        );

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn idempotent_request_survives_a_connection_loss() {
        let calls = Arc::new(AtomicUsize::new(0));
        let server_calls = calls.clone();
        let server_protocol = ProtocolBuilder::new()
            .register::<Req, _>(move |ctx, _sent, received, _error| {
                if ctx.is_on_peer() {
                    if let Some(request) = received {
                        if server_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                            // Drop the connection without answering.
                            ctx.close_connection();
                        } else {
                            let _ = ctx.send_response(Resp {
                                index: request.index,
                                body: request.body,
                            });
                        }
                    }
                }
            })
            .register::<Resp, _>(|_, _, _, _| {})
            .build();

        let (server, addr) = start_server(Config::default(), server_protocol).await;
        let client = Service::new(
            Config::default().with_connection_reconnect_timeout_seconds(1),
            request_protocol(),
        );

        let (tx, rx) = tokio::sync::oneshot::channel();
        client
            .send_request::<Req, Resp, _>(
                &addr,
                Req {
                    index: 42,
                    body: "retry me".into(),
                },
                move |ctx, response, error| {
                    let _ = tx.send((
                        response.map(|r| r.index),
                        error.is_none(),
                        ctx.message_state(),
                    ));
                },
                MessageFlags::IDEMPOTENT,
            )
            .unwrap();

        let (index, no_error, state) = tokio::time::timeout(Duration::from_secs(15), rx)
            .await
            .expect("idempotent retry timed out")
            .unwrap();
        assert!(no_error);
        assert_eq!(index, Some(42));
        assert!(state >= 2, "message was not re-sent (state {state})");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn delayed_close_stops_after_the_response() {
        let (server, addr) = start_server(Config::default(), echo_protocol()).await;

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
        let stop_tx = std::sync::Mutex::new(Some(stop_tx));
        let client = Service::new(
            Config::default().with_connection_stop_fnc(Arc::new(move |_ctx, error| {
                if let Some(tx) = stop_tx.lock().unwrap().take() {
                    let _ = tx.send(matches!(error, Some(Error::ConnectionDelayedClosed)));
                }
            })),
            echo_protocol(),
        );

        let (tx, rx) = tokio::sync::oneshot::channel();
        let (recipient, _) = client
            .send_request::<Text, Text, _>(
                &addr,
                Text { body: "bye".into() },
                move |_ctx, response, _error| {
                    let _ = tx.send(response.is_some());
                },
                MessageFlags::empty(),
            )
            .unwrap();
        assert!(
            tokio::time::timeout(Duration::from_secs(10), rx)
                .await
                .unwrap()
                .unwrap()
        );

        client.delayed_close(recipient).unwrap();
        let delayed = tokio::time::timeout(Duration::from_secs(10), stop_rx)
            .await
            .expect("connection did not stop")
            .unwrap();
        assert!(delayed, "connection stopped with the wrong reason");

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn force_close_kills_the_pool_connections() {
        let (server, addr) = start_server(Config::default(), echo_protocol()).await;

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
        let stop_tx = std::sync::Mutex::new(Some(stop_tx));
        let client = Service::new(
            Config::default().with_connection_stop_fnc(Arc::new(move |_ctx, error| {
                if let Some(tx) = stop_tx.lock().unwrap().take() {
                    let _ = tx.send(matches!(error, Some(Error::ConnectionKilled)));
                }
            })),
            echo_protocol(),
        );

        let (tx, rx) = tokio::sync::oneshot::channel();
        let (recipient, _) = client
            .send_request::<Text, Text, _>(
                &addr,
                Text { body: "kill".into() },
                move |_ctx, response, _error| {
                    let _ = tx.send(response.is_some());
                },
                MessageFlags::empty(),
            )
            .unwrap();
        assert!(
            tokio::time::timeout(Duration::from_secs(10), rx)
                .await
                .unwrap()
                .unwrap()
        );

        client.force_close(recipient).unwrap();
        let killed = tokio::time::timeout(Duration::from_secs(10), stop_rx)
            .await
            .expect("connection did not stop")
            .unwrap();
        assert!(killed);

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn raw_connection_passes_bytes_through() {
        use crate::config::ConnectionStartState;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (conn_tx, conn_rx) = tokio::sync::oneshot::channel();
        let conn_tx = std::sync::Mutex::new(Some(conn_tx));
        let server_config = Config::default()
            .with_connection_start_state(ConnectionStartState::Raw)
            .with_connection_start_incoming_fnc(Arc::new(move |ctx| {
                if let Some(tx) = conn_tx.lock().unwrap().take() {
                    let _ = tx.send(ctx.connection_id());
                }
            }));
        let (server, addr) = start_server(server_config, echo_protocol()).await;

        let mut peer = tokio::net::TcpStream::connect(&addr).await.unwrap();
        let conn_id = tokio::time::timeout(Duration::from_secs(10), conn_rx)
            .await
            .expect("incoming connection not seen")
            .unwrap();

        // Peer -> raw receive.
        let (recv_tx, recv_rx) = tokio::sync::oneshot::channel();
        server
            .connection_recv_raw(
                conn_id,
                Box::new(move |result| {
                    let _ = recv_tx.send(result.map(|bytes| bytes.to_vec()));
                }),
            )
            .unwrap();
        peer.write_all(b"untyped bytes").await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(10), recv_rx)
            .await
            .expect("raw receive timed out")
            .unwrap()
            .unwrap();
        assert_eq!(received, b"untyped bytes");

        // Raw send -> peer.
        let (send_tx, send_rx) = tokio::sync::oneshot::channel();
        server
            .connection_send_raw(
                conn_id,
                bytes::Bytes::from_static(b"pong"),
                Box::new(move |result| {
                    let _ = send_tx.send(result.is_ok());
                }),
            )
            .unwrap();
        assert!(
            tokio::time::timeout(Duration::from_secs(10), send_rx)
                .await
                .unwrap()
                .unwrap()
        );
        let mut back = [0u8; 4];
        peer.read_exact(&mut back).await.unwrap();
        assert_eq!(&back, b"pong");

        server.stop().await;
    }

    #[tokio::test]
    async fn user_event_reaches_the_event_hook() {
        let (server, addr) = start_server(Config::default(), echo_protocol()).await;

        let (conn_tx, conn_rx) = tokio::sync::oneshot::channel();
        let conn_tx = std::sync::Mutex::new(Some(conn_tx));
        let (event_tx, event_rx) = tokio::sync::oneshot::channel();
        let event_tx = std::sync::Mutex::new(Some(event_tx));
        let client_config = Config::default()
            .with_connection_start_outgoing_fnc(Arc::new(move |ctx| {
                if let Some(tx) = conn_tx.lock().unwrap().take() {
                    let _ = tx.send(ctx.connection_id());
                }
            }))
            .with_connection_on_event_fnc(Arc::new(move |_ctx, payload| {
                if let Some(tx) = event_tx.lock().unwrap().take() {
                    let value = payload.downcast::<u32>().map(|v| *v).unwrap_or_default();
                    let _ = tx.send(value);
                }
            }));
        let client = Service::new(client_config, echo_protocol());

        let (tx, rx) = tokio::sync::oneshot::channel();
        client
            .send_request::<Text, Text, _>(
                &addr,
                Text { body: "hi".into() },
                move |_ctx, response, _error| {
                    let _ = tx.send(response.is_some());
                },
                MessageFlags::empty(),
            )
            .unwrap();
        assert!(
            tokio::time::timeout(Duration::from_secs(10), rx)
                .await
                .unwrap()
                .unwrap()
        );

        let conn_id = tokio::time::timeout(Duration::from_secs(10), conn_rx)
            .await
            .unwrap()
            .unwrap();
        client.connection_post(conn_id, Box::new(42u32)).unwrap();
        let value = tokio::time::timeout(Duration::from_secs(10), event_rx)
            .await
            .expect("user event not delivered")
            .unwrap();
        assert_eq!(value, 42);

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn passive_connection_sends_only_after_activation() {
        use crate::config::ConnectionStartState;

        let (server, addr) = start_server(Config::default(), echo_protocol()).await;
        let client = Service::new(
            Config::default().with_connection_start_state(ConnectionStartState::Passive),
            echo_protocol(),
        );

        let (tx, rx) = tokio::sync::oneshot::channel();
        let (recipient, _) = client
            .send_request::<Text, Text, _>(
                &addr,
                Text {
                    body: "later".into(),
                },
                move |_ctx, response, _error| {
                    let _ = tx.send(response.is_some());
                },
                MessageFlags::empty(),
            )
            .unwrap();

        // Passive connections take no pooled traffic.
        tokio::time::sleep(Duration::from_millis(300)).await;

        client.connection_notify_enter_active_state(recipient).unwrap();
        assert!(
            tokio::time::timeout(Duration::from_secs(10), rx)
                .await
                .expect("activation did not release the message")
                .unwrap()
        );

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn cancel_while_still_pending_in_the_pool() {
        // A resolver that never finishes keeps the message in the pool.
        let stalled: ResolveFn = Arc::new(|_name| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok::<Vec<std::net::SocketAddr>, Error>(Vec::new())
            })
        });
        let client = Service::new(
            Config::default().with_name_resolve_fnc(stalled),
            echo_protocol(),
        );

        let (tx, rx) = tokio::sync::oneshot::channel();
        let (recipient, message_id) = client
            .send_request::<Text, Text, _>(
                "stalled.example:1",
                Text {
                    body: "never sent".into(),
                },
                move |_ctx, response, error| {
                    let canceled = matches!(error, Some(Error::MessageCanceled));
                    let _ = tx.send(response.is_none() && canceled);
                },
                MessageFlags::empty(),
            )
            .unwrap();

        client.cancel_message(recipient, message_id).unwrap();
        let canceled = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("cancel completion timed out")
            .unwrap();
        assert!(canceled);

        assert!(matches!(
            client.cancel_message(recipient, message_id),
            Err(Error::MessageInexistent)
        ));

        client.stop().await;
    }
}

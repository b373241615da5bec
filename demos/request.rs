// ABOUTME: Demo application issuing a batch of correlated requests over one pooled connection
// ABOUTME: Shows typed request/response handlers and the pool multiplexing many logical messages

pub(crate) use argh::FromArgs;
use std::error::Error;
use std::io::Cursor;
use std::time::Duration;

use bytes::BytesMut;
use msgmux::protocol::{
    decode_string, decode_u32, encode_string, encode_u32, Serializable,
};
use msgmux::{Config, MessageFlags, Protocol, Service};

/// Send a batch of requests and await the matching responses
#[derive(FromArgs)]
struct CliArgs {
    /// whether or not to enable debug logging
    #[argh(switch, short = 'd')]
    debugging: bool,

    /// the port to listen on (default: 6668)
    #[argh(option, short = 'p')]
    port: Option<u16>,

    /// how many requests to send (default: 16)
    #[argh(option, short = 'n')]
    count: Option<u32>,
}

struct Request {
    index: u32,
    body: String,
}

struct Response {
    index: u32,
    body: String,
}

impl Serializable for Request {
    fn encode(&self, buf: &mut BytesMut) -> msgmux::Result<()> {
        encode_u32(buf, self.index);
        encode_string(buf, &self.body);
        Ok(())
    }

    fn decode(buf: &mut Cursor<&[u8]>) -> msgmux::Result<Self> {
        Ok(Self {
            index: decode_u32(buf)?,
            body: decode_string(buf)?,
        })
    }
}

impl Serializable for Response {
    fn encode(&self, buf: &mut BytesMut) -> msgmux::Result<()> {
        encode_u32(buf, self.index);
        encode_string(buf, &self.body);
        Ok(())
    }

    fn decode(buf: &mut Cursor<&[u8]>) -> msgmux::Result<Self> {
        Ok(Self {
            index: decode_u32(buf)?,
            body: decode_string(buf)?,
        })
    }
}

fn build_protocol() -> std::sync::Arc<Protocol> {
    Protocol::builder()
        .register::<Request, _>(|ctx, _sent, received, _error| {
            if ctx.is_on_peer() {
                if let Some(request) = received {
                    let _ = ctx.send_response(Response {
                        index: request.index,
                        body: request.body.to_uppercase(),
                    });
                }
            }
        })
        .register::<Response, _>(|_, _, _, _| {})
        .build()
}

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli_args: CliArgs = argh::from_env();

    let level = if cli_args.debugging {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let port = cli_args.port.unwrap_or(6668);
    let count = cli_args.count.unwrap_or(16);

    let server = Service::new(
        Config::default().with_listener("127.0.0.1", port.to_string()),
        build_protocol(),
    );
    let addr = server.start_listener().await?;
    println!("listening on {addr}");

    let client = Service::new(Config::default(), build_protocol());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    for index in 0..count {
        let tx = tx.clone();
        client.send_request::<Request, Response, _>(
            &addr.to_string(),
            Request {
                index,
                body: format!("request-{index}"),
            },
            move |_ctx, response, error| {
                let outcome = match (response, error) {
                    (Some(response), None) => Ok((response.index, response.body)),
                    (_, Some(error)) => Err(error.to_string()),
                    (None, None) => Err("no response".to_owned()),
                };
                let _ = tx.send(outcome);
            },
            MessageFlags::empty(),
        )?;
    }
    drop(tx);

    let mut received = 0u32;
    while let Ok(Some(outcome)) =
        tokio::time::timeout(Duration::from_secs(10), rx.recv()).await
    {
        match outcome {
            Ok((index, body)) => {
                println!("response {index}: {body}");
                received += 1;
            }
            Err(error) => eprintln!("request failed: {error}"),
        }
        if received == count {
            break;
        }
    }
    println!("received {received}/{count} responses");

    client.stop().await;
    server.stop().await;
    Ok(())
}

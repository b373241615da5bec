// ABOUTME: Demo application running an echo server and client in one process
// ABOUTME: Shows protocol registration, listener startup and a request with a typed response

pub(crate) use argh::FromArgs;
use std::error::Error;
use std::io::Cursor;
use std::time::Duration;

use bytes::BytesMut;
use msgmux::protocol::{decode_string, encode_string, Serializable};
use msgmux::{Config, MessageFlags, Protocol, Service};

/// Echo one message through a loopback server
#[derive(FromArgs)]
struct CliArgs {
    /// whether or not to enable debug logging
    #[argh(switch, short = 'd')]
    debugging: bool,

    /// the port to listen on (default: 6666)
    #[argh(option, short = 'p')]
    port: Option<u16>,

    /// the text to echo
    #[argh(option, short = 'm')]
    message: Option<String>,
}

struct Echo {
    text: String,
}

impl Serializable for Echo {
    fn encode(&self, buf: &mut BytesMut) -> msgmux::Result<()> {
        encode_string(buf, &self.text);
        Ok(())
    }

    fn decode(buf: &mut Cursor<&[u8]>) -> msgmux::Result<Self> {
        Ok(Self {
            text: decode_string(buf)?,
        })
    }
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

    let port = cli_args.port.unwrap_or(6666);
    let text = cli_args.message.unwrap_or_else(|| "hello".to_owned());

    let protocol = Protocol::builder()
        .register::<Echo, _>(|ctx, _sent, received, error| {
            if let Some(error) = error {
                eprintln!("echo failed: {error}");
                return;
            }
            // Peer side: bounce the message straight back.
            if ctx.is_on_peer() {
                if let Some(echo) = received {
                    let _ = ctx.send_response(Echo { text: echo.text });
                }
            }
        })
        .build();

    let server = Service::new(
        Config::default().with_listener("127.0.0.1", port.to_string()),
        protocol.clone(),
    );
    let addr = server.start_listener().await?;
    println!("listening on {addr}");

    let client = Service::new(Config::default(), protocol);
    let (tx, rx) = tokio::sync::oneshot::channel();
    client.send_request::<Echo, Echo, _>(
        &addr.to_string(),
        Echo { text },
        move |ctx, response, error| {
            let outcome = match (response, error) {
                (Some(echo), None) => Ok((echo.text, ctx.is_back_on_sender())),
                (_, Some(error)) => Err(error.to_string()),
                (None, None) => Err("no response".to_owned()),
            };
            let _ = tx.send(outcome);
        },
        MessageFlags::empty(),
    )?;

    match tokio::time::timeout(Duration::from_secs(10), rx).await?? {
        Ok((echoed, back_on_sender)) => {
            println!("echoed: {echoed} (back on sender: {back_on_sender})");
        }
        Err(error) => eprintln!("{error}"),
    }

    client.stop().await;
    server.stop().await;
    Ok(())
}

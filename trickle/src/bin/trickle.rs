//! Pace bytes through a pipe or a TCP connection.
//!
//! The subcommands mirror the classic uses of a bandwidth throttle: cap a
//! local pipeline (`pipe`), an upload (`send`) or a download (`recv`)
//! without touching the program on the other end.

use std::process::exit;

use byte_unit::Byte;
use clap::{Parser, Subcommand};
use tokio::io::{self, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info};
use tracing_subscriber::{fmt::format::FmtSpan, util::SubscriberInitExt};

use trickle::aio::Throttled;
use trickle::config::{ConversionError, Limit};
use trickle::throttle::Throttle;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Sustained rate in bytes per second (e.g. "1MB", "512KiB")
    #[clap(long)]
    rate: Byte,
    /// Burst capacity in bytes, default half a second of traffic
    #[clap(long)]
    burst: Option<Byte>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy stdin to stdout at the configured rate
    Pipe,
    /// Copy stdin to a TCP endpoint at the configured rate
    Send {
        /// The address to connect to, e.g. 127.0.0.1:9000
        addr: String,
    },
    /// Accept one TCP connection and copy it to stdout at the configured rate
    Recv {
        /// The address to listen on, e.g. 127.0.0.1:9000
        addr: String,
    },
}

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Throttle configuration error: {0}")]
    Conversion(#[from] ConversionError),
}

fn throttle(args: &Args) -> Result<Throttle, ConversionError> {
    let limit = Limit {
        bytes_per_second: args.rate,
        burst_bytes: args.burst,
    };
    Ok(Throttle::new_with_config((&limit).try_into()?))
}

async fn run(args: Args) -> Result<(), Error> {
    match &args.command {
        Command::Pipe => {
            let mut stdin = io::stdin();
            let mut stdout = Throttled::writer(io::stdout(), throttle(&args)?);
            let bytes = io::copy(&mut stdin, &mut stdout).await?;
            stdout.shutdown().await?;
            info!(bytes, "pipe complete");
        }
        Command::Send { addr } => {
            let stream = TcpStream::connect(addr.as_str()).await?;
            info!(peer = %stream.peer_addr()?, "connected");
            let mut stdin = io::stdin();
            let mut stream = Throttled::writer(stream, throttle(&args)?);
            let bytes = io::copy(&mut stdin, &mut stream).await?;
            stream.shutdown().await?;
            info!(bytes, "send complete");
        }
        Command::Recv { addr } => {
            let listener = TcpListener::bind(addr.as_str()).await?;
            let (stream, peer) = listener.accept().await?;
            info!(%peer, "accepted");
            let mut stream = Throttled::reader(stream, throttle(&args)?);
            let mut stdout = io::stdout();
            let bytes = io::copy(&mut stream, &mut stdout).await?;
            stdout.flush().await?;
            info!(bytes, "recv complete");
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("{e}");
        exit(1);
    }
}

//! Peer-side echo stub: accepts connections on the link's service and
//! writes every chunk it reads straight back.

use anyhow::Result;
use clap::Parser;
use spp_link::config::{LinkConfig, TransportMode};
use spp_link::transport::{
    open_default_adapter, RfcommTransport, TcpTransport, Transport, TransportListener,
    TransportStream,
};
use spp_link_shared::{limits, PeerAddress, ServiceIdentifier};
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "echo-peer", about = "Echo every chunk received on the serial link")]
struct Args {
    /// Configuration file shared with spp-link
    #[arg(short, long, default_value = "spp-link.toml")]
    config: PathBuf,

    /// Transport: rfcomm or tcp-simulation
    #[arg(short, long)]
    mode: Option<TransportMode>,

    /// Listen address for the TCP simulation
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    let mut config = LinkConfig::load(&args.config)?;
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if let Some(listen) = args.listen {
        config.tcp_listen_address = listen;
    }

    match config.mode {
        TransportMode::Rfcomm => {
            let (session, adapter) = open_default_adapter().await?;
            let transport = RfcommTransport::new(session, adapter, config.rfcomm());
            run(transport, config.service()).await
        }
        TransportMode::TcpSimulation => {
            let transport = TcpTransport::new(config.tcp_listen_address.clone());
            run(transport, config.service()).await
        }
    }
}

async fn run<T: Transport>(transport: T, service: ServiceIdentifier) -> Result<()> {
    tokio::select! {
        result = serve(transport, service) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            Ok(())
        }
    }
}

async fn serve<T: Transport>(transport: T, service: ServiceIdentifier) -> Result<()> {
    let mut listener = transport.listen(service).await?;
    info!("Echo peer ready on {} ({})", service, transport.name());

    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(echo(stream, peer));
    }
}

async fn echo<S: TransportStream>(mut stream: S, peer: PeerAddress) {
    info!("Echoing for {}", peer);
    let mut buf = vec![0u8; limits::READ_BUFFER_SIZE];
    let mut total = 0usize;

    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = stream.write_all(&buf[..n]).await {
                    warn!("Write to {} failed: {}", peer, e);
                    break;
                }
                total += n;
            }
            Err(e) => {
                warn!("Read from {} failed: {}", peer, e);
                break;
            }
        }
    }

    let _ = TransportStream::shutdown(&mut stream).await;
    info!("{} disconnected after {} bytes", peer, total);
}

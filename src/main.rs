use anyhow::{Context, Result};
use clap::Parser;
use spp_link::config::{LinkConfig, TransportMode};
use spp_link::connection::{ConnectionManager, LinkEvent, LinkHandle};
use spp_link::transport::{
    open_default_adapter, BluezRadio, NullRadio, RadioAdapter, RfcommTransport, TcpTransport,
    Transport,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "spp-link", about = "Point-to-point serial link over Bluetooth RFCOMM")]
struct Args {
    /// Configuration file (defaults are used if it does not exist)
    #[arg(short, long, default_value = "spp-link.toml")]
    config: PathBuf,

    /// Transport: rfcomm or tcp-simulation
    #[arg(short, long)]
    mode: Option<TransportMode>,

    /// Peer to dial once the link is up
    #[arg(long)]
    connect: Option<String>,

    /// Scan for nearby devices for this many seconds before starting
    #[arg(long, value_name = "SECONDS")]
    scan: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    let mut config = LinkConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(mode) = args.mode {
        config.mode = mode;
    }

    info!("spp-link starting");
    info!("  Transport: {}", config.mode);
    info!("  Service: {} ({})", config.service(), config.service_name);

    match config.mode {
        TransportMode::Rfcomm => {
            let (session, adapter) = open_default_adapter().await?;
            info!("  Adapter: {}", adapter.name());
            let radio = Arc::new(BluezRadio::new(adapter.clone()));

            if let Some(seconds) = args.scan {
                scan(&radio, Duration::from_secs(seconds)).await?;
            }

            let transport = Arc::new(RfcommTransport::new(session, adapter, config.rfcomm()));
            run(transport, radio, &config, args.connect).await
        }
        TransportMode::TcpSimulation => {
            if args.scan.is_some() {
                warn!("Scanning needs a Bluetooth adapter, skipped in TCP simulation");
            }
            info!("  Listen address: {}", config.tcp_listen_address);
            let transport = Arc::new(TcpTransport::new(config.tcp_listen_address.clone()));
            run(transport, Arc::new(NullRadio), &config, args.connect).await
        }
    }
}

/// Print the devices seen during a discovery window
async fn scan(radio: &BluezRadio, window: Duration) -> Result<()> {
    let (found_tx, mut found_rx) = mpsc::channel(32);
    radio.start_discovery(found_tx).await?;
    info!("Scanning for {:?}", window);

    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            found = found_rx.recv() => match found {
                Some(peer) => {
                    let paired = if peer.paired { " [paired]" } else { "" };
                    let rssi = peer.rssi.map(|r| format!(" {} dBm", r)).unwrap_or_default();
                    println!("{}  {}{}{}", peer.address, peer.display_name(), paired, rssi);
                }
                None => break,
            },
        }
    }

    radio.cancel_discovery().await?;
    Ok(())
}

async fn run<T: Transport>(
    transport: Arc<T>,
    radio: Arc<dyn RadioAdapter>,
    config: &LinkConfig,
    connect: Option<String>,
) -> Result<()> {
    let (link, mut events) =
        ConnectionManager::new(transport, radio, config.connection()).into_parts();

    if let Some(peer) = connect {
        link.request_connect(peer).await?;
    }

    let mut input = tokio::spawn(read_input(link.clone()));

    // Main event loop
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = &mut input => break,
            event = events.recv() => match event {
                Some(LinkEvent::StateChanged(state)) => info!("Link {}", state),
                Some(LinkEvent::MessageReceived { peer, text }) => println!("{}> {}", peer, text),
                Some(LinkEvent::CannotProceed { reason }) => {
                    error!("Cannot proceed: {}", reason);
                    println!("Fix the problem above, then /listen or /connect again");
                }
                None => {
                    error!("Connection manager closed");
                    break;
                }
            },
        }
    }

    input.abort();
    // Nobody reads events from here on
    drop(events);
    link.shutdown().await?;
    info!("spp-link stopped");
    Ok(())
}

/// A line typed on stdin
#[derive(Debug, PartialEq)]
enum Input {
    Listen,
    Connect(String),
    State,
    Help,
    Quit,
    Text(String),
}

fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }

    let Some(command) = line.strip_prefix('/') else {
        return Some(Input::Text(line.to_string()));
    };

    let mut parts = command.split_whitespace();
    let input = match (parts.next(), parts.next()) {
        (Some("listen"), None) => Input::Listen,
        (Some("connect"), Some(peer)) => Input::Connect(peer.to_string()),
        (Some("state"), None) => Input::State,
        (Some("quit" | "exit"), None) => Input::Quit,
        (Some("help"), None) => Input::Help,
        // Escape for text that starts with a slash
        (Some("say"), Some(_)) => {
            let text = command.trim_start()["say".len()..].trim_start();
            Input::Text(text.to_string())
        }
        _ => Input::Help,
    };
    Some(input)
}

const HELP: &str =
    "/listen | /connect <peer> | /state | /say <text> | /quit; other lines are sent as text";

/// Feed stdin lines to the link until `/quit`
async fn read_input(link: LinkHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("stdin closed, running until interrupted");
                std::future::pending::<()>().await;
                return;
            }
            Err(e) => {
                warn!("Failed to read stdin: {}", e);
                std::future::pending::<()>().await;
                return;
            }
        };

        let result = match parse_input(&line) {
            None => continue,
            Some(Input::Quit) => return,
            Some(Input::Help) => {
                println!("{}", HELP);
                Ok(())
            }
            Some(Input::State) => {
                println!("{}", link.state());
                Ok(())
            }
            Some(Input::Listen) => link.request_listen().await,
            Some(Input::Connect(peer)) => link.request_connect(peer).await,
            Some(Input::Text(text)) => link.request_write(text).await,
        };

        if let Err(e) = result {
            warn!("{}", e);
        }
    }
}

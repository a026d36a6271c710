use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

use lib_stream::core::errors::LogErrorSink;
use lib_stream::retrieve::{asset_loader_factory, AssetClient};
use lib_stream::transport::StaticCredential;
use lib_stream::{StoreEvent, StreamClient, TransportEvent, VirtualElement};

mod client_logic;
use client_logic::console::{Console, ConsoleCommand, Reply, HELP};
use client_logic::{config, logger};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config();
    logger::setup_logging(&config.log_dir(), config.log_level())?;
    log::info!("Starting page_streamer against {}", config.url.as_deref().unwrap_or("-"));

    let client = Arc::new(StreamClient::new(
        config.client_config(),
        Arc::new(StaticCredential::new(config.token.clone())),
        Arc::new(LogErrorSink),
    ));

    if let Some(base_url) = &config.asset_base_url {
        let assets = AssetClient::new(base_url, config.token.clone(), config.asset_max_retries.unwrap_or(3))
            .with_context(|| format!("invalid asset base url {base_url}"))?;
        client.set_loader_factory(asset_loader_factory(Arc::new(assets)));
        log::info!("Widget assets are fetched from {}", base_url);
    }

    tokio::spawn(log_transport_events(client.transport().subscribe(), Arc::clone(&client)));
    tokio::spawn(log_store_events(client.store().subscribe()));

    client.connect().context("failed to start the transport")?;

    let (width, height) = config.viewport_size();
    let element = Arc::new(VirtualElement::new(width, height));
    let mut console = Console::new(&client, element, config.page_id());
    log::info!("Console ready on page '{}'", console.page_id());
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Ctrl-C received, initiating shutdown.");
                break;
            }
            _ = terminate() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            log::info!("stdin closed, initiating shutdown.");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match line.parse::<ConsoleCommand>() {
            Ok(command) => command,
            Err(e) => {
                println!("{e:#}");
                continue;
            }
        };
        match console.execute(command).await {
            Ok(Reply::Output(text)) => print!("{text}"),
            Ok(Reply::Quit) => break,
            Err(e) => println!("error: {e:#}"),
        }
    }

    client.disconnect();
    log::info!("Shutdown complete.");
    Ok(())
}

async fn terminate() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
                log::info!("SIGTERM received, initiating shutdown.");
            }
            Err(e) => {
                log::warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        // On non-unix platforms, just wait forever.
        std::future::pending::<()>().await;
    }
}

/// Logs transport lifecycle and asks for the widget packs on every open.
async fn log_transport_events(mut events: tokio::sync::broadcast::Receiver<TransportEvent>, client: Arc<StreamClient>) {
    loop {
        match events.recv().await {
            Ok(TransportEvent::Open) => {
                log::info!("Connected");
                if let Err(e) = client.request_widget_packs() {
                    log::warn!("Widget pack discovery not sent: {}", e);
                }
            }
            Ok(TransportEvent::Closed { expected }) => log::info!("Connection closed (expected: {})", expected),
            Ok(TransportEvent::ReconnectScheduled { attempt, delay }) => {
                log::info!("Reconnect attempt {} in {:?}", attempt, delay)
            }
            Ok(event) => log::debug!("Transport event: {:?}", event),
            Err(RecvError::Lagged(skipped)) => log::warn!("Missed {} transport events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn log_store_events(mut events: tokio::sync::broadcast::Receiver<StoreEvent>) {
    loop {
        match events.recv().await {
            Ok(StoreEvent::SectionMerged { page_id, key, fresh }) => {
                log::info!("Section {} of '{}' merged (new: {})", key, page_id, fresh)
            }
            Ok(StoreEvent::PageCompleted { page_id }) => log::info!("Page '{}' complete", page_id),
            Ok(event) => log::debug!("Store event: {:?}", event),
            Err(RecvError::Lagged(skipped)) => log::warn!("Missed {} store events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

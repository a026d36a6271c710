//! Scrolls a headless page against a running content server and reports how
//! fast requested sections come back.
//!
//! ```text
//! cargo run -p project_tests --bin test_page_stream_live -- --url ws://127.0.0.1:3010/ws --page home
//! ```

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Parser;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::sleep;

use lib_stream::core::errors::CollectingErrorSink;
use lib_stream::transport::StaticCredential;
use lib_stream::viewport::ViewportEvent;
use lib_stream::{SectionKey, StoreEvent, StreamClient, StreamClientConfig, TransportConfig, TransportEvent, VirtualElement};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Content server WebSocket URL
    #[clap(long, default_value = "ws://127.0.0.1:3010/ws")]
    url: String,

    /// Bearer credential
    #[clap(long)]
    token: Option<String>,

    /// Page to stream
    #[clap(long, default_value = "home")]
    page: String,

    /// Pixels moved per scroll step
    #[clap(long, default_value_t = 400.0)]
    step: f64,

    /// Milliseconds between scroll steps
    #[clap(long, default_value_t = 250)]
    step_interval_ms: u64,

    /// Scroll back to the top after this offset
    #[clap(long, default_value_t = 20_000.0)]
    max_scroll: f64,

    /// Report interval in seconds
    #[clap(short, long, default_value_t = 10)]
    report_interval_seconds: u64,

    /// Stop after this many seconds
    #[clap(long, default_value_t = 60)]
    duration_seconds: u64,
}

#[derive(Default)]
struct Stats {
    requested: HashMap<SectionKey, DateTime<Utc>>,
    latencies_ms: Vec<i64>,
    merged: VecDeque<DateTime<Utc>>,
    requests_sent: usize,
    reconnects: usize,
}

impl Stats {
    fn on_viewport(&mut self, event: &ViewportEvent) {
        if event.requested {
            self.requests_sent += 1;
            self.requested.insert(event.section, Utc::now());
        }
    }

    fn on_merge(&mut self, key: &SectionKey) {
        let now = Utc::now();
        self.merged.push_back(now);
        if let Some(sent) = self.requested.remove(key) {
            self.latencies_ms.push((now - sent).num_milliseconds());
        }
    }

    fn report(&mut self, errors: usize) {
        let one_minute_ago = Utc::now() - chrono::Duration::minutes(1);
        while self.merged.front().is_some_and(|&t| t < one_minute_ago) {
            self.merged.pop_front();
        }

        let mut sorted = self.latencies_ms.clone();
        sorted.sort_unstable();
        let percentile = |p: usize| sorted.get(sorted.len().saturating_sub(1) * p / 100).copied().unwrap_or(0);

        println!("\n----- Page Stream Summary -----");
        println!("Requests sent: {} (unanswered: {})", self.requests_sent, self.requested.len());
        println!("Sections merged: {} in the last minute", self.merged.len());
        println!(
            "Latency: p50 {} ms, p95 {} ms, max {} ms ({} samples)",
            percentile(50),
            percentile(95),
            sorted.last().copied().unwrap_or(0),
            sorted.len()
        );
        println!("Reconnects scheduled: {}, errors reported: {}", self.reconnects, errors);
        println!("-------------------------------\n");
    }
}

fn setup_logging() -> Result<()> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}] {}",
                chrono::Local::now().format("[%H:%M:%S%.3f]"),
                record.level(),
                message
            ))
        })
        .level(log::LevelFilter::Warn)
        .level_for("test_page_stream_live", log::LevelFilter::Info)
        .chain(std::io::stdout())
        .apply()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging()?;

    let errors = Arc::new(CollectingErrorSink::new());
    let client = StreamClient::new(
        StreamClientConfig {
            transport: TransportConfig {
                url: args.url.clone(),
                ..TransportConfig::default()
            },
            ..StreamClientConfig::default()
        },
        Arc::new(StaticCredential::new(args.token.clone())),
        errors.clone(),
    );
    let stats = Arc::new(Mutex::new(Stats::default()));

    let mut viewport_events = client.tracker().subscribe();
    let stats_viewport = Arc::clone(&stats);
    tokio::spawn(async move {
        loop {
            match viewport_events.recv().await {
                Ok(event) => stats_viewport.lock().unwrap().on_viewport(&event),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut store_events = client.store().subscribe();
    let stats_store = Arc::clone(&stats);
    tokio::spawn(async move {
        loop {
            match store_events.recv().await {
                Ok(StoreEvent::SectionMerged { key, .. }) => stats_store.lock().unwrap().on_merge(&key),
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut transport_events = client.transport().subscribe();
    let stats_transport = Arc::clone(&stats);
    tokio::spawn(async move {
        loop {
            match transport_events.recv().await {
                Ok(TransportEvent::ReconnectScheduled { attempt, delay }) => {
                    log::info!("Reconnect attempt {} in {:?}", attempt, delay);
                    stats_transport.lock().unwrap().reconnects += 1;
                }
                Ok(TransportEvent::Open) => log::info!("Connected to server"),
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    println!("Connecting to {}...", args.url);
    client.connect()?;

    let element = Arc::new(VirtualElement::new(1280.0, 800.0));
    client.tracker().start_tracking(&args.page, element.clone());

    let stats_reporter = Arc::clone(&stats);
    let errors_reporter = errors.clone();
    let report_every = Duration::from_secs(args.report_interval_seconds.max(1));
    tokio::spawn(async move {
        loop {
            sleep(report_every).await;
            stats_reporter.lock().unwrap().report(errors_reporter.len());
        }
    });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.duration_seconds);
    let mut top = 0.0;
    while tokio::time::Instant::now() < deadline {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = sleep(Duration::from_millis(args.step_interval_ms)) => {}
        }
        top = if top + args.step > args.max_scroll { 0.0 } else { top + args.step };
        element.scroll_to(top, 0.0);
    }

    client.disconnect();
    stats.lock().unwrap().report(errors.len());
    for error in errors.take() {
        println!("error: {error}");
    }
    Ok(())
}

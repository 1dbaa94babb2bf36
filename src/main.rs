use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod capture;
mod decoder;
mod frame;
mod fuzz;
mod output;
mod packet;

use capture::CaptureSource;
use decoder::{DecoderConfig, DecoderRegistry};
use fuzz::{FuzzConfig, Fuzzer, ProbeTrigger};
use output::OutputSink;

/// Frames buffered between the capture thread and the dispatch loop
const FRAME_QUEUE_CAPACITY: usize = 4096;

#[derive(Parser, Debug)]
#[command(name = "wirelens")]
#[command(about = "Passive HTTP/TLS/DNS traffic inspector with optional active HTTP probing")]
#[command(version)]
struct Args {
    /// Network interface to capture on
    #[arg(short, long, default_value = "lo")]
    iface: String,

    /// Read frames from a PCAP file instead of a live interface
    #[arg(short, long)]
    read: Option<PathBuf>,

    /// Also write JSON records to this file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Disable HTTP decoding
    #[arg(long)]
    no_http: bool,

    /// Disable TLS decoding
    #[arg(long)]
    no_tls: bool,

    /// Disable DNS decoding
    #[arg(long)]
    no_dns: bool,

    /// Probe HTTP endpoints seen in the traffic
    #[arg(long)]
    fuzz: bool,

    /// Extra payloads, one per line, appended to the built-in set
    #[arg(long)]
    fuzz_payloads: Option<PathBuf>,

    /// Maximum concurrent probe requests per probed endpoint
    #[arg(long, default_value = "10", value_parser = clap::value_parser!(u32).range(1..))]
    fuzz_concurrency: u32,

    /// Per-request probe timeout in seconds
    #[arg(long, default_value = "10")]
    fuzz_timeout: u64,

    /// Capacity of the probe outcome queue
    #[arg(long, default_value = "1024")]
    fuzz_queue: usize,

    /// Snapshot length for live capture
    #[arg(long, default_value = "1600")]
    snaplen: i32,

    /// Do not put the interface into promiscuous mode
    #[arg(long)]
    no_promisc: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn decoder_config(&self) -> DecoderConfig {
        DecoderConfig {
            http: !self.no_http,
            tls: !self.no_tls,
            dns: !self.no_dns,
        }
    }

    fn fuzz_config(&self) -> Option<FuzzConfig> {
        self.fuzz.then(|| FuzzConfig {
            payload_file: self.fuzz_payloads.clone(),
            concurrency: self.fuzz_concurrency as usize,
            request_timeout: Duration::from_secs(self.fuzz_timeout),
            queue_capacity: self.fuzz_queue,
        })
    }

    fn capture_source(&self) -> CaptureSource {
        match &self.read {
            Some(path) => CaptureSource::File(path.clone()),
            None => CaptureSource::Live {
                iface: self.iface.clone(),
                snaplen: self.snaplen,
                promisc: !self.no_promisc,
            },
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries the JSON records
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let registry = DecoderRegistry::new(args.decoder_config());
    if registry.is_empty() {
        warn!("All decoders are disabled; no records will be produced");
    }

    let sink = OutputSink::new(args.output.as_deref())?;

    let fuzz_config = args.fuzz_config();
    let fuzzer = match &fuzz_config {
        Some(config) => Some(Fuzzer::from_config(config)?),
        None => None,
    };
    let concurrency = fuzz_config.as_ref().map_or(1, |config| config.concurrency);

    let source = args.capture_source();
    let source_label = match &source {
        CaptureSource::Live { iface, .. } => format!("interface {}", iface),
        CaptureSource::File(path) => format!("file {}", path.display()),
    };
    let (capture, mut frames) = capture::start(source, FRAME_QUEUE_CAPACITY)?;

    let mut enabled = registry.names();
    if let Some(fuzzer) = &fuzzer {
        enabled.push("Fuzz");
        info!(
            "Probing with {} payloads, concurrency {}",
            fuzzer.payloads().len(),
            concurrency
        );
    }
    info!(
        "Packet capture started on {} (enabled decoders: {})",
        source_label,
        enabled.join(", ")
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let start_time = Instant::now();
    let mut frame_count = 0u64;
    let mut record_count = 0u64;
    let mut trigger = ProbeTrigger::default();

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("Received shutdown signal, stopping capture");
                break;
            }
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    info!("Capture source closed");
                    break;
                };
                frame_count += 1;

                record_count += registry.dispatch(&frame, |metadata| {
                    if let Some(fuzzer) = &fuzzer {
                        if let Some(target) = trigger.next_target(&metadata) {
                            debug!("Probing {}", target);
                            fuzzer.fuzz_url(&target, concurrency);
                        }
                    }
                    sink.write(&metadata);
                }) as u64;
            }
        }
    }

    // Unblocks the capture thread if it is waiting on a full queue
    drop(frames);
    let capture_stats = tokio::task::spawn_blocking(move || capture.stop()).await?;

    if let Some(fuzzer) = fuzzer {
        info!("Waiting for {} probe runs to finish", trigger.probed());
        let outcomes = fuzzer.close().await;
        let outcome_count = outcomes.len();
        for outcome in outcomes {
            sink.write(&outcome);
        }
        info!("Drained {} probe outcomes", outcome_count);
    }

    sink.finish();

    info!("======= CAPTURE SUMMARY =======");
    info!("Total time: {:.2} seconds", start_time.elapsed().as_secs_f64());
    info!("Frames: {} ({} read errors)", capture_stats.frames, capture_stats.errors);
    info!("Frames dispatched: {}", frame_count);
    info!("Records emitted: {}", record_count);
    info!("===============================");

    Ok(())
}

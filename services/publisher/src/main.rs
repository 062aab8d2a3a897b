//! Chunk publisher for the seccam security-camera recorder.
//!
//! Reads an already-encoded camera stream, cuts it into chunks on a capture
//! thread, and uploads every chunk to the storage API from a single-threaded
//! event loop.
//!
//! # Architecture
//!
//! ```text
//! stdin/FIFO -> Segmenter -> chunk channel -> Publisher -> api / content hosts
//!                   ^                            |
//!                   +-------- Controller <-------+ (events)
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/publisher.toml, /etc/seccam/publisher.toml)
//! 2. Environment variables (prefixed with SECCAM__)
//!
//! See `config.rs` for detailed configuration options.

use anyhow::{Context, Result};
use seccam_publisher::channel::{pipe, queue, ChunkReceiver, ChunkSink};
use seccam_publisher::config::{CaptureConfig, ChannelKind, LoggingConfig, PublisherConfig};
use seccam_publisher::segmenter::{SegmenterError, SegmenterStats};
use seccam_publisher::transport::{Endpoint, HttpTransport};
use seccam_publisher::{Publisher, PublisherEvent, PublisherSettings, PublisherStats, Segmenter, StopHandle};
use std::fs::File;
use std::io::{self, Read};
use std::thread::JoinHandle;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

type CaptureResult = std::result::Result<SegmenterStats, SegmenterError>;

/// How the event loop in [`drive`] came to an end.
enum Outcome {
    Finished(std::result::Result<(), seccam_publisher::PublisherError>),
    /// Signalled before the publisher was ready; nothing was captured.
    InterruptedBeforeCapture,
    /// Signalled twice while the capture source stayed silent.
    Forced,
}

fn main() -> Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        app_folder = %config.dropbox.app_folder,
        "Starting chunk publisher"
    );

    config.validate()?;

    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    // Everything except capture runs on this one thread
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build event loop")?;

    match runtime.block_on(run(config)) {
        Ok(()) => {
            info!("Chunk publisher completed successfully");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Chunk publisher failed");
            Err(e)
        }
    }
}

/// Load configuration, falling back to the environment alone.
fn load_config() -> Result<PublisherConfig> {
    let config = PublisherConfig::load().or_else(|e| {
        warn!(error = %e, "Failed to load config from files, trying environment");
        PublisherConfig::from_env()
    })?;

    Ok(config)
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("seccam_publisher={}", level).parse()?)
        .add_directive("reqwest=warn".parse()?)
        .add_directive("hyper=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

async fn run(config: PublisherConfig) -> Result<()> {
    let settings = config
        .publisher_settings()
        .context("Invalid storage endpoint")?;
    let transport_settings = config.dropbox.transport_settings();

    let api = HttpTransport::open(Endpoint::Api, &config.dropbox.api_url, &transport_settings)
        .context("Failed to open api transport")?;
    let content = HttpTransport::open(
        Endpoint::Content,
        &config.dropbox.content_url,
        &transport_settings,
    )
    .context("Failed to open content transport")?;

    match config.channel.kind {
        ChannelKind::Queue => {
            let (sink, chunks) = queue::channel(config.channel.high_water_mark);
            drive(&config.capture, settings, api, content, sink, chunks).await
        }
        ChannelKind::Pipe => {
            let (sink, chunks) = pipe::channel().context("Failed to create chunk pipe")?;
            drive(&config.capture, settings, api, content, sink, chunks).await
        }
    }
}

/// Run the publisher and react to its events until it finishes, fails, or
/// is interrupted before capture starts.
async fn drive<S, R>(
    capture_config: &CaptureConfig,
    settings: PublisherSettings,
    api: HttpTransport,
    content: HttpTransport,
    sink: S,
    chunks: R,
) -> Result<()>
where
    S: ChunkSink + 'static,
    R: ChunkReceiver,
{
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut publisher = Publisher::new(settings, api, content, chunks, events_tx);
    let mut controller = Controller::new(capture_config.clone(), sink);

    let outcome = {
        let run = publisher.run();
        tokio::pin!(run);
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);
        let mut interrupted = false;

        loop {
            tokio::select! {
                result = &mut run => break Outcome::Finished(result),
                Some(event) = events.recv() => controller.on_event(event)?,
                _ = &mut shutdown => {
                    if interrupted {
                        warn!("Second shutdown signal, exiting without sealing the final chunk");
                        break Outcome::Forced;
                    }
                    interrupted = true;
                    if !controller.stop_capture() {
                        warn!("Interrupted before capture started, exiting");
                        break Outcome::InterruptedBeforeCapture;
                    }
                    info!("Capture stopping, waiting for the last chunk to upload");
                    shutdown.set(shutdown_signal());
                }
            }
        }
    };

    // a stopped capture ignores a late Ready
    while let Ok(event) = events.try_recv() {
        controller.on_event(event)?;
    }

    let result = match outcome {
        Outcome::Finished(Ok(())) => {
            controller.join_capture();
            Ok(())
        }
        Outcome::Finished(Err(e)) => {
            controller.stop_capture();
            Err(e).context("Publisher stopped")
        }
        Outcome::InterruptedBeforeCapture => Ok(()),
        Outcome::Forced => {
            controller.abandon_capture();
            Ok(())
        }
    };

    log_final_stats(publisher.stats(), controller.stats.as_ref());
    result
}

enum Capture<S> {
    Pending(S),
    Running {
        stop: StopHandle,
        handle: JoinHandle<CaptureResult>,
    },
    Finished,
}

/// Starts and stops the capture thread in response to publisher events.
struct Controller<S> {
    config: CaptureConfig,
    capture: Capture<S>,
    stats: Option<SegmenterStats>,
}

impl<S: ChunkSink + 'static> Controller<S> {
    fn new(config: CaptureConfig, sink: S) -> Self {
        Self {
            config,
            capture: Capture::Pending(sink),
            stats: None,
        }
    }

    fn on_event(&mut self, event: PublisherEvent) -> Result<()> {
        match event {
            PublisherEvent::Ready { files, total_bytes } => {
                info!(files, total_bytes, "Publisher ready, starting capture");
                self.start_capture()?;
            }
            PublisherEvent::LastSent => self.join_capture(),
            PublisherEvent::ConnectionLost(endpoint) => {
                warn!(endpoint = %endpoint, "Storage connection lost");
            }
            PublisherEvent::ChunkUploaded { .. } | PublisherEvent::StateChanged { .. } => {}
        }
        Ok(())
    }

    fn start_capture(&mut self) -> Result<()> {
        if !matches!(self.capture, Capture::Pending(_)) {
            return Ok(());
        }

        let source: Box<dyn Read + Send> = if self.config.is_stdin() {
            Box::new(io::stdin())
        } else {
            Box::new(
                File::open(&self.config.source)
                    .with_context(|| format!("Failed to open capture source {}", self.config.source))?,
            )
        };
        self.spawn_capture(source)
    }

    fn spawn_capture(&mut self, source: Box<dyn Read + Send>) -> Result<()> {
        let sink = match std::mem::replace(&mut self.capture, Capture::Finished) {
            Capture::Pending(sink) => sink,
            other => {
                self.capture = other;
                return Ok(());
            }
        };

        let segmenter = Segmenter::new(source, self.config.segmenter_settings());
        let stop = segmenter.stop_handle();
        let handle = std::thread::Builder::new()
            .name("seccam-capture".to_string())
            .spawn(move || {
                let mut sink = sink;
                segmenter.run(&mut sink)
            })
            .context("Failed to spawn capture thread")?;

        info!(source = %self.config.source, "Capture thread started");
        self.capture = Capture::Running { stop, handle };
        Ok(())
    }

    /// Ask the capture thread to seal its final chunk. Returns false if
    /// capture never started, in which case it never will: the sink is
    /// dropped and the publisher sees the channel close.
    fn stop_capture(&mut self) -> bool {
        match &self.capture {
            Capture::Running { stop, .. } => {
                stop.stop();
                true
            }
            Capture::Finished => true,
            Capture::Pending(_) => {
                self.capture = Capture::Finished;
                false
            }
        }
    }

    /// Give up on a capture thread stuck in a read. The thread is detached
    /// and dies with the process.
    fn abandon_capture(&mut self) {
        if let Capture::Running { stop, handle } =
            std::mem::replace(&mut self.capture, Capture::Finished)
        {
            stop.stop();
            if handle.is_finished() {
                self.capture = Capture::Running { stop, handle };
                self.join_capture();
            } else {
                warn!("Capture source still blocked, final chunk was not sealed");
            }
        }
    }

    /// Join the capture thread once it has produced its final chunk.
    fn join_capture(&mut self) {
        let Capture::Running { handle, .. } = std::mem::replace(&mut self.capture, Capture::Finished)
        else {
            return;
        };

        match handle.join() {
            Ok(Ok(stats)) => self.stats = Some(stats),
            Ok(Err(e)) => error!(error = %e, "Capture ended with an error"),
            Err(_) => error!("Capture thread panicked"),
        }
    }
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

/// Log final statistics on shutdown.
fn log_final_stats(publisher: &PublisherStats, capture: Option<&SegmenterStats>) {
    info!("=== Final Statistics ===");

    info!(
        chunks_uploaded = publisher.chunks_uploaded,
        bytes_uploaded = publisher.bytes_uploaded,
        failed_attempts = publisher.failed_attempts,
        retries = publisher.retries,
        empty_chunks_skipped = publisher.empty_chunks_skipped,
        "Publisher final stats"
    );

    if let Some(stats) = capture {
        info!(
            chunks_sealed = stats.chunks_sealed,
            bytes_read = stats.bytes_read,
            "Capture final stats"
        );
    }
}

//! worker-tracer demo runner.
//!
//! Creates instrumented echo workers on the in-process loopback runtime,
//! exchanges messages with them, collects a trace snapshot from each, and
//! prints the snapshots as JSON.
//!
//! ```text
//!   main ──create_worker──▶ Instrumentation ──bootstrap──▶ loopback worker
//!        ──post_message──▶  ProxyWorker     ─────────────▶ InstrumentedScope → echo.js
//!        ◀─────echo──────   relay           ◀────────────
//!        ──snapshot_all─▶   control channel ─────────────▶ TraceBuffer
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use clap::Parser;
use serde_json::{json, Map, Value};
use url::Url;

use worker_tracer::config::{load_config, TracerConfig};
use worker_tracer::observability::{logging, metrics};
use worker_tracer::runtime::loopback::LoopbackHost;
use worker_tracer::runtime::{
    EventType, NativeWorker, WorkerContext, WorkerHost, WorkerOptions, WorkerResult,
};
use worker_tracer::{host, TraceBuffer, TraceSink, WorkerTracer};

#[derive(Parser)]
#[command(name = "worker-tracer", version)]
#[command(about = "Run instrumented workers in-process and print their trace snapshots", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Base location scripts are resolved against.
    #[arg(long, default_value = "https://localhost/app/")]
    base: Url,

    /// Number of workers to create.
    #[arg(long, default_value_t = 2)]
    workers: u32,

    /// Messages sent to each worker.
    #[arg(long, default_value_t = 3)]
    messages: u32,
}

fn echo_script(ctx: &WorkerContext) -> WorkerResult<()> {
    let scope = Arc::downgrade(&ctx.scope());
    ctx.scope().add_event_listener(
        EventType::Message,
        Arc::new(move |event| {
            let (Some(scope), Some(data)) = (scope.upgrade(), event.message_data()) else {
                return;
            };
            if let Err(err) = scope.post_message(json!({ "echo": data }), Vec::new()) {
                tracing::warn!(error = %err, "Echo failed");
            }
        }),
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => TracerConfig::default(),
    };

    logging::init(&config.observability)?;
    tracing::info!("worker-tracer v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        let addr: SocketAddr = config.observability.metrics_address.parse()?;
        metrics::init_metrics(addr)?;
    }

    let loopback = LoopbackHost::new(cli.base.clone());
    loopback.register_runtime(
        &config.instrumentation.tracing_runtime_url,
        WorkerTracer::factory(config.instrumentation.clone()),
    )?;
    loopback.register_script("echo.js", echo_script)?;
    let native: Arc<dyn WorkerHost> = Arc::new(loopback.clone());

    let sink = Arc::new(TraceBuffer::new(config.instrumentation.trace_buffer_capacity));
    let instrumentation =
        host::instrument(&config.instrumentation, native.clone(), sink.clone(), cli.base.clone())?;
    let entry: Arc<dyn WorkerHost> = match &instrumentation {
        Some(instrumentation) => Arc::new(instrumentation.clone()),
        None => native,
    };

    let replies = Arc::new(AtomicUsize::new(0));
    let mut workers: Vec<Box<dyn NativeWorker>> = Vec::new();
    for _ in 0..cli.workers {
        let worker = entry.create_worker("echo.js", &WorkerOptions::default())?;
        let counter = replies.clone();
        worker.add_event_listener(
            EventType::Message,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            }),
        );
        workers.push(worker);
    }

    for (index, worker) in workers.iter().enumerate() {
        for n in 0..cli.messages {
            worker.post_message(json!({ "worker": index, "seq": n }), Vec::new())?;
        }
    }
    let steps = loopback.run_until_idle();
    tracing::info!(
        workers = workers.len(),
        replies = replies.load(Ordering::Relaxed),
        steps,
        "Messages exchanged"
    );

    let Some(instrumentation) = instrumentation else {
        for worker in &workers {
            worker.terminate()?;
        }
        return Ok(());
    };

    let requests = instrumentation.snapshot_all();
    loopback.run_until_idle();

    let timeout = instrumentation.config().snapshot_timeout();
    let mut report = Map::new();
    report.insert("host".to_string(), sink.snapshot());
    for (id, request) in requests {
        let snapshot = match request {
            Ok(pending) => pending.timeout(timeout).await,
            Err(err) => Err(err),
        };
        let entry = snapshot.unwrap_or_else(|err| json!({ "error": err.to_string() }));
        report.insert(id.to_string(), entry);
    }
    println!("{}", serde_json::to_string_pretty(&Value::Object(report))?);

    let terminated = instrumentation.shutdown()?;
    tracing::info!(terminated, "Shutdown complete");
    Ok(())
}

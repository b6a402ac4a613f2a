use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use reconq_core::{EventKind, Object};
use reconq_queue::{EventQueue, QueueSettings};
use serde::Serialize;
use tokio::signal;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "reconqctl", version, about = "Reconq CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the event queue for a GVK and print every delivered event
    Run {
        /// GVK key, e.g. "v1/ConfigMap" or "testing.dev/v1/TestEntity"
        gvk: String,
        /// Bounded channel capacity
        #[arg(long = "queue-cap", env = "RECONQ_QUEUE_CAP")]
        queue_cap: Option<usize>,
        /// Re-check each live resource this many seconds after its last event (0 = off)
        #[arg(long = "resync", env = "RECONQ_RESYNC_SECS", default_value_t = 0)]
        resync_secs: u64,
    },
}

#[derive(Serialize)]
struct EventLine<'a> {
    event: EventKind,
    kind: &'a str,
    namespace: Option<&'a str>,
    name: &'a str,
    uid: &'a str,
    resource_version: Option<&'a str>,
}

fn init_tracing() {
    let env = std::env::var("RECONQ_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("RECONQ_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid RECONQ_METRICS_ADDR; expected host:port");
        }
    }
}

fn print_event(output: Output, kind: EventKind, obj: &Object) -> Result<()> {
    match output {
        Output::Human => {
            let ns = obj.metadata.namespace.as_deref().unwrap_or("-");
            println!("{:<14} {} {}/{} ({})", kind.to_string(), obj.kind, ns, obj.metadata.name, obj.metadata.uid);
        }
        Output::Json => {
            let line = EventLine {
                event: kind,
                kind: &obj.kind,
                namespace: obj.metadata.namespace.as_deref(),
                name: &obj.metadata.name,
                uid: &obj.metadata.uid,
                resource_version: obj.metadata.resource_version.as_deref(),
            };
            println!("{}", serde_json::to_string(&line)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { gvk, queue_cap, resync_secs } => {
            let mut settings = QueueSettings::from_env();
            if let Some(cap) = queue_cap {
                settings = settings.with_capacity(cap);
            }
            info!(gvk = %gvk, ns = ?cli.namespace, cap = settings.capacity, resync_secs, "run invoked");
            let source = reconq_kubehub::watch(&gvk, cli.namespace.as_deref()).await?;
            let queue = EventQueue::with_source(gvk.clone(), settings, source);

            let handle = queue.handle();
            let output = cli.output;
            let resync = Duration::from_secs(resync_secs);
            queue.subscribe(move |kind: EventKind, obj: &Object| -> Result<()> {
                print_event(output, kind, obj)?;
                if !resync.is_zero() && kind != EventKind::Deleted {
                    handle.enqueue_delayed(obj.clone(), resync);
                }
                Ok(())
            });

            queue.start()?;
            signal::ctrl_c().await?;
            info!("interrupt received; shutting down");
            queue.dispose().await;
        }
    }
    Ok(())
}

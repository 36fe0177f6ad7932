use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kube::Client;
use tether_core::{DeltaKind, DynObject, Object, Selector};
use tether_informer::{CancellationToken, HandlerFuncs, Informer, InformerConfig, SharedIndexInformer};
use tether_kubehub::KubeListWatcher;
use tether_store::{Indexer, Indexers};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "tetherctl", version, about = "Tether CLI: list/watch caches against a live cluster")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace to scope to (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Field selector passed to list and watch, e.g. "status.phase=Running"
    #[arg(long = "field-selector", global = true)]
    field_selector: Option<String>,

    /// Label selector passed to list and watch, e.g. "app=web"
    #[arg(short = 'l', long = "label-selector", global = true)]
    label_selector: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover served resources (incl. CRDs)
    Discover,
    /// Sync a cache for a GVK and print its contents
    Ls {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
        /// Seconds to wait for the initial list
        #[arg(long = "wait-secs", env = "TETHER_WAIT_SECS", default_value_t = 8)]
        wait_secs: u64,
    },
    /// Keep a cache for a GVK in sync and print +/~/- events until interrupted
    Watch {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
    },
}

impl Cli {
    fn selector(&self) -> Selector {
        Selector {
            namespace: self.namespace.clone(),
            field_selector: self.field_selector.clone(),
            label_selector: self.label_selector.clone(),
        }
    }
}

fn init_tracing() {
    let env = std::env::var("TETHER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TETHER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid TETHER_METRICS_ADDR; expected host:port");
        }
    }
}

async fn informer_for(gvk: &str, selector: Selector) -> Result<Arc<Informer<KubeListWatcher>>> {
    let client = Client::try_default().await?;
    let lw = KubeListWatcher::for_gvk(client, gvk).await?;
    let config = InformerConfig::from_env();
    Ok(Arc::new(Informer::new(gvk, lw, selector, Indexers::namespaced(), config)))
}

fn spawn_run(inf: &Arc<Informer<KubeListWatcher>>) -> (CancellationToken, JoinHandle<()>) {
    let token = CancellationToken::new();
    let task = tokio::spawn({
        let inf = Arc::clone(inf);
        let cancel = token.clone();
        async move {
            if let Err(e) = inf.run(cancel).await {
                error!(informer = %inf.name(), error = %e, "informer failed");
            }
        }
    });
    (token, task)
}

fn event_line(out: Output, kind: DeltaKind, o: &DynObject) -> String {
    match out {
        Output::Human => {
            let mark = match kind {
                DeltaKind::Added => '+',
                DeltaKind::Updated => '~',
                DeltaKind::Deleted => '-',
            };
            format!("{} {} rv={}", mark, o.key(), o.resource_version().unwrap_or("-"))
        }
        Output::Json => serde_json::json!({
            "kind": kind,
            "key": o.key().to_string(),
            "resourceVersion": o.resource_version(),
        })
        .to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let selector = cli.selector();

    match &cli.command {
        Commands::Discover => {
            let client = Client::try_default().await?;
            let resources = tether_kubehub::discover(client).await?;
            match cli.output {
                Output::Human => {
                    for r in resources {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        println!("{:<50} {:<30} {}", r.gvk_key(), r.plural, scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
            }
        }
        Commands::Ls { gvk, wait_secs } => {
            info!(gvk = %gvk, selector = %selector, "ls invoked");
            let inf = informer_for(gvk, selector).await?;
            let (token, task) = spawn_run(&inf);
            match tokio::time::timeout(Duration::from_secs(*wait_secs), inf.wait_for_sync()).await {
                Ok(true) => {}
                Ok(false) => bail!("informer stopped before the initial list completed"),
                Err(_) => warn!(wait_secs, "timed out waiting for the initial list; output may be partial"),
            }
            let mut items = inf.store().list();
            items.sort_by_key(|o| o.key());
            match cli.output {
                Output::Human => {
                    println!("{:<20} {:<40} {}", "NAMESPACE", "NAME", "RESOURCE-VERSION");
                    for o in &items {
                        let ns = o.namespace.as_deref().unwrap_or("-");
                        println!("{:<20} {:<40} {}", ns, o.name, o.resource_version().unwrap_or("-"));
                    }
                }
                Output::Json => {
                    let raw: Vec<&serde_json::Value> = items.iter().map(|o| &o.raw).collect();
                    println!("{}", serde_json::to_string_pretty(&raw)?);
                }
            }
            token.cancel();
            task.await?;
        }
        Commands::Watch { gvk } => {
            info!(gvk = %gvk, selector = %selector, "watch invoked");
            let inf = informer_for(gvk, selector).await?;
            let out = cli.output;
            let handler = HandlerFuncs::new()
                .on_add(move |o: &DynObject| {
                    println!("{}", event_line(out, DeltaKind::Added, o));
                    Ok(())
                })
                .on_update(move |old: &DynObject, new: &DynObject| {
                    if old != new {
                        println!("{}", event_line(out, DeltaKind::Updated, new));
                    }
                    Ok(())
                })
                .on_delete(move |o: &DynObject| {
                    println!("{}", event_line(out, DeltaKind::Deleted, o));
                    Ok(())
                });
            inf.add_event_handler_with_resync(Arc::new(handler), Duration::ZERO)?;
            let (token, task) = spawn_run(&inf);
            tokio::spawn({
                let inf = Arc::clone(&inf);
                async move {
                    if inf.wait_for_sync().await {
                        info!(objects = inf.store().len(), rv = %inf.last_sync_resource_version(), "initial list synced");
                    }
                }
            });
            signal::ctrl_c().await?;
            info!("interrupt received; stopping");
            token.cancel();
            task.await?;
        }
    }
    Ok(())
}

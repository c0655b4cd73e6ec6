use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use keel_apply::{workload_patch, workload_summary, PatchOutcome};
use keel_core::{EngineConfig, LogLevel, OperationLogger, StepStatus};
use keel_kubehub::{start_watchers, KubeOrchestrator, StaticDnsResolver};
use keel_ops::{ControllerKind, ControllerManager};
use keel_store::{spawn_ingest, Store};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{info, warn};

mod manifest;

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel component reconciliation CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Seconds to wait for the cache to synchronize
    #[arg(long = "wait-secs", env = "KEEL_WAIT_SECS", global = true, default_value_t = 30)]
    wait_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one operation over the components in the given manifests
    Run {
        /// start, stop, restart, scale, upgrade, apply_rule, apply_plugin_config,
        /// refresh_autoscaler, delete or export
        kind: String,
        /// Component manifest files (YAML)
        #[arg(required = true)]
        manifests: Vec<PathBuf>,
        /// Export: application name
        #[arg(long = "app-name")]
        app_name: Option<String>,
        /// Export: application version
        #[arg(long = "app-version")]
        app_version: Option<String>,
        /// Export: last batch, also write values.yaml
        #[arg(long = "end", action = ArgAction::SetTrue)]
        end: bool,
    },
    /// Print derived statuses from the cache (all cached components when no id is given)
    Status {
        ids: Vec<String>,
    },
    /// Print the upgrade patch between two manifests, offline
    Diff {
        old: PathBuf,
        new: PathBuf,
    },
    /// Print a tenant's resource totals
    Tenant {
        id: String,
    },
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

/// Prints operation progress as it happens.
#[derive(Debug)]
struct PrintLogger {
    output: Output,
}

impl OperationLogger for PrintLogger {
    fn log(&self, level: LogLevel, message: &str, step: &str, status: StepStatus) {
        if level == LogLevel::Debug {
            return;
        }
        match self.output {
            Output::Human => println!("[{:<8}] {:<8} {}", status.as_str(), step, message),
            Output::Json => {
                let line = serde_json::json!({ "level": level, "step": step, "status": status, "message": message });
                println!("{line}");
            }
        }
    }
}

/// A connected orchestrator plus a cache fed by its watchers.
struct Session {
    orchestrator: KubeOrchestrator,
    store: Arc<Store>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    async fn connect(cfg: &EngineConfig, wait_secs: u64) -> Result<Self> {
        let orchestrator = KubeOrchestrator::try_default().await?;
        let store = Arc::new(Store::new());
        let (tx, ingest) = spawn_ingest(store.clone(), cfg.ingest_capacity);
        let mut tasks = start_watchers(orchestrator.client().clone(), &cfg.managed_selector, tx).await;
        tasks.push(ingest);
        let session = Self { orchestrator, store, tasks };
        session.wait_ready(wait_secs).await?;
        Ok(session)
    }

    async fn wait_ready(&self, wait_secs: u64) -> Result<()> {
        let started = Instant::now();
        let deadline = started + Duration::from_secs(wait_secs);
        let mut rx = self.store.subscribe_epoch();
        while !self.store.ready() {
            let now = Instant::now();
            if now >= deadline {
                bail!("cache not synchronized after {wait_secs}s");
            }
            let rem = deadline.duration_since(now).min(Duration::from_secs(2));
            let _ = tokio::time::timeout(rem, rx.changed()).await;
        }
        info!(elapsed_ms = started.elapsed().as_millis() as u64, "cache synchronized");
        Ok(())
    }

    fn shutdown(self) {
        for t in self.tasks {
            t.abort();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = Arc::new(EngineConfig::from_env());

    match cli.command {
        Commands::Run { kind, manifests, app_name, app_version, end } => {
            let components = manifest::load_all(&manifests)?;
            let mut kind = ControllerKind::from_str(&kind)?;
            if let ControllerKind::Export(opts) = &mut kind {
                let (Some(name), Some(version)) = (app_name, app_version) else {
                    bail!("export needs --app-name and --app-version");
                };
                opts.app_name = name;
                opts.app_version = version;
                opts.end = end;
            }
            info!(%kind, components = components.len(), "run invoked");

            let session = Session::connect(&cfg, cli.wait_secs).await?;
            let manager = ControllerManager::new(
                Arc::new(session.orchestrator.clone()),
                session.store.clone(),
                cfg.clone(),
                Arc::new(StaticDnsResolver::from_config(&cfg)),
            );
            let controller = manager.get_controller(kind, Arc::new(PrintLogger { output: cli.output }), components)?;
            let mut task = tokio::spawn({
                let controller = controller.clone();
                async move { controller.begin().await }
            });
            let res = tokio::select! {
                res = &mut task => res?,
                _ = signal::ctrl_c() => {
                    warn!(controller = %controller.id(), "Ctrl-C received; cancelling pending waits");
                    controller.stop();
                    task.await?
                }
            };
            session.shutdown();
            res?;
        }
        Commands::Status { ids } => {
            let session = Session::connect(&cfg, cli.wait_secs).await?;
            let ids = if ids.is_empty() {
                let mut all: Vec<String> = session.store.all_components().iter().map(|c| c.id().to_string()).collect();
                all.sort();
                all
            } else {
                ids
            };
            let statuses = session.store.components_status(&ids);
            match cli.output {
                Output::Human => {
                    println!("{:<36} STATUS", "COMPONENT");
                    for (id, status) in &statuses {
                        println!("{id:<36} {status}");
                    }
                }
                Output::Json => {
                    let map: std::collections::BTreeMap<_, _> = statuses.into_iter().collect();
                    println!("{}", serde_json::to_string_pretty(&map)?);
                }
            }
            session.shutdown();
        }
        Commands::Diff { old, new } => {
            let old = manifest::load_one(&old)?;
            let new = manifest::load_one(&new)?;
            let summary = workload_summary(old.workload(), new.workload())?;
            let patch = match workload_patch(old.workload(), new.workload())? {
                PatchOutcome::NoChange => None,
                PatchOutcome::Patch(p) => Some(p),
            };
            match cli.output {
                Output::Human => {
                    println!("adds={} updates={} removes={}", summary.adds, summary.updates, summary.removes);
                    match &patch {
                        Some(p) => println!("{}", serde_json::to_string_pretty(p)?),
                        None => println!("no upgrade required"),
                    }
                }
                Output::Json => {
                    let out = serde_json::json!({ "summary": summary, "patch": patch });
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
        }
        Commands::Tenant { id } => {
            let session = Session::connect(&cfg, cli.wait_secs).await?;
            session.store.publish_tenants();
            let res = session.store.tenant_resource(&id).unwrap_or_default();
            match cli.output {
                Output::Human => {
                    println!("tenant:          {id}");
                    println!("pods:            {}", res.pods);
                    println!("cpu request:     {}m", res.cpu_request_millis);
                    println!("cpu limit:       {}m", res.cpu_limit_millis);
                    println!("memory request:  {} bytes", res.memory_request_bytes);
                    println!("memory limit:    {} bytes", res.memory_limit_bytes);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&res)?),
            }
            session.shutdown();
        }
    }

    Ok(())
}

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kube::ResourceExt;
use tracing::{info, warn};

use keel_core::{Capsule, Scheme};
use keel_kubehub::{ClusterClient, KubeCluster, MemoryCluster};
use keel_pipeline::{Manager, Pipeline, PipelineConfig, PipelineResult, RunOptions};
use keel_plugin::ModOptions;

mod operator;

#[derive(Parser, Debug)]
#[command(name = "keel", version, about = "Capsule reconciliation engine")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Pipeline config file (falls back to KEEL_CONFIG)
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve a built-in mod over stdio (started by the host, not by hand)
    Mod {
        name: String,
    },
    /// List registered mods
    Mods,
    /// Reconcile one capsule read from a YAML file
    Run {
        /// Capsule manifest
        file: PathBuf,
        /// Compute changes without writing anything
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
        /// Adopt objects that exist but are not owned by the capsule
        #[arg(long = "force-adopt", action = ArgAction::SetTrue)]
        force_adopt: bool,
        /// Reconcile against an empty in-memory cluster
        #[arg(long = "memory", action = ArgAction::SetTrue)]
        memory: bool,
    },
    /// Watch capsules and reconcile them until interrupted
    Operator,
}

/// `to_stderr` is for `keel mod`, whose stdout carries protocol frames.
fn init_tracing(to_stderr: bool) {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if to_stderr {
        fmt.with_writer(std::io::stderr).with_ansi(false).init();
    } else {
        fmt.init();
    }
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

/// Built-ins re-run this binary; third-party mods come from the mod dir.
fn build_manager(cfg: &PipelineConfig) -> Result<Manager> {
    let mut manager = Manager::with_process_launcher(ModOptions::from_env());
    let self_path = std::env::current_exe().context("locating the keel binary")?;
    manager.register_builtins(&self_path, keel_mods::BUILTIN_MODS)?;
    if let Some(dir) = cfg.mod_dir.as_deref() {
        let n = manager.discover_dir(dir)?;
        info!(dir = %dir.display(), mods = n, "discovered mods");
    }
    Ok(manager)
}

fn read_capsule(path: &Path) -> Result<Capsule> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing capsule {}", path.display()))
}

async fn serve_builtin(name: &str) -> Result<()> {
    let mut m = keel_mods::new_builtin(name).ok_or_else(|| anyhow!("no built-in mod named {name}"))?;
    keel_plugin::serve_stdio(m.as_mut()).await?;
    Ok(())
}

fn print_result(output: Output, capsule: &Capsule, res: &PipelineResult) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(res)?),
        Output::Human => {
            let mode = if res.dry_run { " (dry run)" } else { "" };
            println!("capsule {}/{}{} attempts={}", capsule.namespace().unwrap_or_default(), capsule.name_any(), mode, res.attempts);
            println!("{:<15} {:<8} OBJECT", "STATE", "APPLIED");
            for o in &res.output_objects {
                println!("{:<15} {:<8} {}", o.state().to_string(), o.change.applied, o.key);
                if let Some(err) = &o.change.error {
                    println!("  error: {err}");
                }
            }
            for u in &res.used_resources {
                println!("used {} {} ({})", u.reference.group_kind(), u.reference.name, u.state);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let serving_mod = matches!(cli.command, Commands::Mod { .. });
    init_tracing(serving_mod);
    if !serving_mod {
        init_metrics();
    }
    let scheme = Arc::new(Scheme::with_defaults());
    let load_config = || PipelineConfig::load(cli.config.as_deref());

    match cli.command {
        Commands::Mod { ref name } => serve_builtin(name).await?,
        Commands::Mods => {
            let cfg = load_config()?;
            let manager = build_manager(&cfg)?;
            match cli.output {
                Output::Human => {
                    println!("{:<28} PATH", "NAME");
                    for m in manager.mods() {
                        let args = if m.args.is_empty() { String::new() } else { format!(" {}", m.args.join(" ")) };
                        println!("{:<28} {}{}", m.name, m.path.display(), args);
                    }
                }
                Output::Json => {
                    let mods: Vec<_> = manager.mods().collect();
                    println!("{}", serde_json::to_string_pretty(&mods)?);
                }
            }
        }
        Commands::Run { ref file, dry_run, force_adopt, memory } => {
            let cfg = load_config()?;
            let capsule = read_capsule(file)?;
            info!(capsule = %capsule.name_any(), dry_run, force_adopt, memory, "run invoked");
            let client: Arc<dyn ClusterClient> = if memory {
                Arc::new(MemoryCluster::new())
            } else {
                Arc::new(KubeCluster::try_default(scheme.clone()).await?)
            };
            let manager = build_manager(&cfg)?;
            let pipeline = manager.new_pipeline(client, scheme, &cfg).await?;
            let res = pipeline.run_capsule(&capsule, RunOptions { dry_run, force_adopt }).await;
            pipeline.shutdown().await;
            print_result(cli.output, &capsule, &res?)?;
        }
        Commands::Operator => {
            let cfg = load_config()?;
            let cluster = KubeCluster::try_default(scheme.clone()).await?;
            let kube_client = cluster.client().clone();
            let manager = build_manager(&cfg)?;
            let pipeline: Pipeline = manager.new_pipeline(Arc::new(cluster), scheme, &cfg).await?;
            let pipeline = Arc::new(pipeline);
            operator::run(kube_client, pipeline.clone()).await;
            pipeline.shutdown().await;
            warn!("operator stopped");
        }
    }

    Ok(())
}

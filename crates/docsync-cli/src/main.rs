//! docsync CLI
//!
//! Thin wrapper around docsync-core for trying providers from a terminal.
//!
//! ## Usage
//!
//! ```bash
//! # Show the wire protocol message kinds
//! docsync info
//!
//! # Three replicas in one in-memory room, three edit rounds
//! docsync demo
//!
//! # Five replicas on a broadcast channel with a 200 ms resync interval
//! docsync demo --replicas 5 --transport channel --resync-ms 200
//!
//! # Provider settings from a JSON file, JSONL logs under ./logs
//! docsync -vv --log-dir ./logs demo --config provider.json
//!
//! # Keep running until Ctrl-C, then fire the exit hooks
//! docsync demo --hold
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use docsync_core::logging::LoggingBuilder;
use docsync_core::{
    AutomergeDoc, Awareness, ChannelTransport, ExitHooks, MemoryTransport, MessageKind,
    ProviderConfig, ReplicaId, RoomRegistry, SyncProvider,
};
use tracing::info;

/// How long the channel demo waits for replicas to converge
const CONVERGE_TIMEOUT: Duration = Duration::from_secs(5);

/// docsync - transport-agnostic document sync
#[derive(Parser)]
#[command(name = "docsync")]
#[command(version = "0.1.0")]
#[command(about = "docsync - transport-agnostic document sync")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Also write JSONL logs to this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show protocol information
    Info,

    /// Run several replicas against one transport and check they converge
    Demo {
        /// Number of replicas
        #[arg(short, long, default_value_t = 3, value_parser = clap::value_parser!(u64).range(1..=64))]
        replicas: u64,

        /// Edit rounds performed on the first replica
        #[arg(long, default_value_t = 3)]
        rounds: u64,

        /// Resync interval in milliseconds (overrides --config)
        #[arg(long)]
        resync_ms: Option<u64>,

        /// Transport binding
        #[arg(short, long, value_enum, default_value_t = TransportKind::Memory)]
        transport: TransportKind,

        /// Provider settings as JSON, e.g. {"resync_interval_ms": 500}
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Wait for Ctrl-C before exiting
        #[arg(long)]
        hold: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportKind {
    /// Synchronous in-process room
    Memory,
    /// tokio broadcast channel
    Channel,
}

/// A connected transport of either kind
enum Binding {
    Memory(MemoryTransport),
    Channel(ChannelTransport),
}

impl Binding {
    fn disconnect(&self) {
        match self {
            Binding::Memory(transport) => transport.disconnect(),
            Binding::Channel(transport) => transport.disconnect(),
        }
    }
}

struct Replica {
    doc: Arc<AutomergeDoc>,
    provider: Arc<SyncProvider>,
}

fn setup_logging(verbosity: u8, log_dir: Option<&Path>) -> Result<()> {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string());

    let mut builder = LoggingBuilder::new("docsync").with_filter(filter);
    if let Some(dir) = log_dir {
        builder = builder.with_logs_dir(dir);
    }

    if let Some(path) = builder.init().context("Failed to initialize logging")? {
        info!(path = %path.display(), "Writing JSONL logs");
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<ProviderConfig> {
    let Some(path) = path else {
        return Ok(ProviderConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid config {}", path.display()))
}

fn print_info() {
    println!("docsync v0.1.0");
    println!();
    println!("Message kinds:");
    for kind in [
        MessageKind::DocumentSync,
        MessageKind::PresenceQuery,
        MessageKind::PresenceUpdate,
        MessageKind::Authorization,
    ] {
        println!("  {}  {}", kind.tag(), kind);
    }
}

fn create_replicas(count: u64, config: &ProviderConfig) -> Result<Vec<Replica>> {
    (1..=count)
        .map(|id| {
            let replica_id = ReplicaId(id);
            let doc = Arc::new(AutomergeDoc::with_replica_id(replica_id));
            let awareness = Arc::new(Awareness::new(replica_id));
            awareness.set_local_state_field("name", serde_json::json!(format!("replica-{}", id)));

            let provider = SyncProvider::new(doc.clone(), config.clone().with_presence(awareness))?;
            Ok(Replica { doc, provider })
        })
        .collect()
}

fn connect(replicas: &[Replica], transport: TransportKind) -> Result<Vec<Binding>> {
    match transport {
        TransportKind::Memory => {
            let registry = RoomRegistry::new();
            Ok(replicas
                .iter()
                .map(|r| Binding::Memory(MemoryTransport::connect(&registry, "demo", r.provider.clone())))
                .collect())
        }
        TransportKind::Channel => {
            let sender = ChannelTransport::channel();
            replicas
                .iter()
                .map(|r| Ok(Binding::Channel(ChannelTransport::connect(&sender, r.provider.clone())?)))
                .collect()
        }
    }
}

fn converged(replicas: &[Replica]) -> Result<bool> {
    let first = replicas[0].doc.to_json()?;
    for replica in &replicas[1..] {
        if replica.doc.to_json()? != first {
            return Ok(false);
        }
    }
    // a lone replica has nobody to complete a handshake with
    Ok(replicas.len() == 1 || replicas.iter().all(|r| r.provider.is_synced()))
}

async fn wait_for_convergence(replicas: &[Replica]) -> Result<bool> {
    let deadline = tokio::time::Instant::now() + CONVERGE_TIMEOUT;
    loop {
        if converged(replicas)? {
            return Ok(true);
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn run_demo(
    count: u64,
    rounds: u64,
    transport: TransportKind,
    config: ProviderConfig,
    hold: bool,
) -> Result<()> {
    let hooks = ExitHooks::new();
    let config = config.with_exit_hooks(hooks.clone());

    println!(
        "docsync demo: {} replicas, {} rounds, {:?} transport",
        count, rounds, transport
    );

    let replicas = create_replicas(count, &config)?;
    let bindings = connect(&replicas, transport)?;

    // Members that joined first have not completed a handshake yet
    for replica in &replicas {
        replica.provider.resync();
    }

    for round in 0..rounds {
        let doc = &replicas[0].doc;
        doc.put(&format!("round_{}", round), round)?;
        doc.put("last_round", round)?;
        info!(round, "Edit round done");
    }

    let ok = match transport {
        TransportKind::Memory => converged(&replicas)?,
        TransportKind::Channel => wait_for_convergence(&replicas).await?,
    };

    for replica in &replicas {
        println!(
            "replica {}: {} synced={}",
            replica.provider.id(),
            serde_json::to_string(&replica.doc.to_json()?)?,
            replica.provider.is_synced()
        );
    }
    println!("converged: {}", if ok { "yes" } else { "no" });

    if hold {
        println!();
        println!("Running. Press Ctrl-C to exit.");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        println!();
        println!("Received shutdown signal...");
    }

    hooks.fire();
    for binding in &bindings {
        binding.disconnect();
    }
    for replica in &replicas {
        replica.provider.destroy();
    }

    if !ok {
        bail!("replicas did not converge");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.log_dir.as_deref())?;

    match cli.command {
        Commands::Info => print_info(),
        Commands::Demo {
            replicas,
            rounds,
            resync_ms,
            transport,
            config,
            hold,
        } => {
            let mut provider_config = load_config(config.as_deref())?;
            if let Some(ms) = resync_ms {
                provider_config = provider_config.with_resync_interval_ms(ms);
            }
            run_demo(replicas, rounds, transport, provider_config, hold).await?;
        }
    }

    Ok(())
}

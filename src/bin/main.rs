use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use plume::broker::Broker;
use plume::coord::{CoordStore, MemStore};
use plume::store::{FileSystemStore, FragmentStore};
use plume::{config, telemetry};

#[derive(Parser)]
#[command(name = "plumed", about = "Distributed append-only journal broker")]
struct Cli {
    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the broker until interrupted.
    Serve {
        /// Path to the broker config; created with defaults if absent.
        #[arg(long, default_value = "plumed.toml")]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config } => {
            if let Err(e) = serve(&config, cli.verbose) {
                tracing::error!("error: {e}");
                std::process::exit(1);
            }
        }
    }
}

fn serve(config_path: &std::path::Path, verbose: u8) -> plume::Result<()> {
    let cfg = config::load_or_init(config_path);
    let _telemetry_guard = telemetry::init(verbose.max(1), &cfg.logging);

    let coord: Arc<dyn CoordStore> = Arc::new(MemStore::new());
    let mut stores: BTreeMap<String, Arc<dyn FragmentStore>> = BTreeMap::new();
    if let Some(root) = &cfg.store_root {
        let store = Arc::new(FileSystemStore::new(root)?);
        stores.insert(store.root().to_string(), store);
    }

    let broker = Broker::start(&cfg, coord, stores)?;
    tracing::info!(addr = %broker.local_addr(), "plumed serving; ctrl-c to stop");

    wait_for_interrupt();
    broker.shutdown();
    Ok(())
}

/// Park until SIGINT or SIGTERM.
fn wait_for_interrupt() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    let shutdown = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown));
    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }
}

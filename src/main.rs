//! OxideTunnel agent binary
//!
//! `oxidetunnel [CONFIG]` loads the JSON config (default
//! `~/.oxidetunnel/config.json`), brings up the tunnel and the relay proxy,
//! and runs until Ctrl-C.

use std::process::ExitCode;
use std::sync::Arc;

use oxidetunnel_lib::agent::{SshConnectorFactory, StaticControlPlane, TunnelAgent};
use oxidetunnel_lib::config::ConfigStorage;
use oxidetunnel_lib::init_logging;
use oxidetunnel_lib::relay::NotImplementedDelegate;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 && (args[1] == "--version" || args[1] == "-V") {
        println!("oxidetunnel {}", VERSION);
        return ExitCode::SUCCESS;
    }

    let storage = match args.get(1) {
        Some(path) => ConfigStorage::with_path(path),
        None => match ConfigStorage::new() {
            Ok(storage) => storage,
            Err(e) => {
                eprintln!("oxidetunnel: {}", e);
                return ExitCode::FAILURE;
            }
        },
    };
    let config = match storage.load().await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("oxidetunnel: {}: {}", storage.path().display(), e);
            return ExitCode::FAILURE;
        }
    };

    init_logging(config.debug);
    info!("oxidetunnel v{} starting (pid: {})", VERSION, std::process::id());

    let control = match StaticControlPlane::from_config(&config) {
        Ok(control) => control,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let agent = Arc::new(TunnelAgent::new(
        config.clone(),
        Arc::new(control),
        Arc::new(SshConnectorFactory::new(config)),
        Arc::new(NotImplementedDelegate),
    ));

    let signal_agent = agent.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            signal_agent.shutdown();
        }
    });

    match agent.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

//! The per-node arbiter agent.

use std::path::PathBuf;

use arbiter_net::{Agent, AgentConfig, AgentError};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "arbiter-agent", about = "Per-node quorum arbitration agent", version)]
struct Cli {
    /// File holding the cluster's flat configuration key tree.
    #[arg(short = 'c', long = "config", default_value = "/etc/arbiter/agent.toml")]
    config: PathBuf,

    /// Increase debug output; repeat for trace level.
    #[arg(short = 'd', action = clap::ArgAction::Count)]
    debug: u8,

    /// Stay attached to the terminal, logging to stderr.
    #[arg(short = 'f')]
    foreground: bool,

    /// Unix socket of the local cluster runtime.
    #[arg(long = "runtime-socket", default_value = "/var/run/arbiter/runtime.sock")]
    runtime_socket: PathBuf,

    /// Allow negotiating the unsafe test algorithm.
    #[arg(long = "enable-test-algorithm")]
    enable_test_algorithm: bool,
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = Cli::parse();

    let default_level = match cli.debug {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
    if !cli.foreground {
        info!("running attached; use a service manager for daemonization");
    }

    let config = match AgentConfig::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("arbiter-agent: {}", err);
            return 1;
        }
    };
    info!(
        cluster = %config.cluster_name,
        node_id = config.node_id,
        algorithm = %config.algorithm,
        "agent configured"
    );

    let agent = match Agent::new(config, cli.enable_test_algorithm) {
        Ok(agent) => agent,
        Err(err) => {
            eprintln!("arbiter-agent: {}", err);
            return 1;
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("arbiter-agent: can't build runtime: {}", err);
            return 1;
        }
    };

    let result = runtime.block_on(async move {
        let handle = arbiter_net::runtime::connect_unix(&cli.runtime_socket)
            .await
            .map_err(|err| {
                AgentError::Config(format!(
                    "can't reach the local cluster runtime at {}: {}",
                    cli.runtime_socket.display(),
                    err
                ))
            })?;
        agent.run(handle).await
    });

    match result {
        Ok(()) => {
            info!("local cluster runtime closed, exiting");
            0
        }
        Err(AgentError::Config(err)) => {
            eprintln!("arbiter-agent: {}", err);
            1
        }
        Err(AgentError::AlgorithmFatal) => {
            eprintln!("arbiter-agent: algorithm forbids reconnecting, exiting");
            2
        }
    }
}
